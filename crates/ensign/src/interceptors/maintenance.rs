//! Rejects every non-public RPC while the node is in maintenance mode.

use tonic::Status;

use super::Next;
use crate::context::Context;

pub const MAINTENANCE_MODE: &str = "the node is in maintenance mode";

pub async fn intercept<T: Send + 'static>(ctx: Context, next: Next<T>) -> Result<T, Status> {
    if ctx.method.public {
        return next(ctx).await;
    }

    tracing::debug!(method = ctx.method.method, "rejected request in maintenance mode");
    Err(Status::unavailable(MAINTENANCE_MODE))
}
