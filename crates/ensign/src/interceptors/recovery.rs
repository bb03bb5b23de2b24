//! Translates panics in handlers into internal errors so that the node stays up.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tonic::Status;

use super::Next;
use crate::context::Context;

pub const UNHANDLED: &str = "an unhandled exception occurred";

pub async fn intercept<T: Send + 'static>(ctx: Context, next: Next<T>) -> Result<T, Status> {
    let method = ctx.method;
    match AssertUnwindSafe(async move { next(ctx).await })
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            tracing::error!(
                report = true,
                service = method.service,
                method = method.method,
                panic = %panic_message(panic.as_ref()),
                "recovered from panic in handler"
            );
            metrics::counter!(
                "ensign_rpc_panics_total",
                "service" => method.service,
                "method" => method.method
            )
            .increment(1);
            Err(Status::internal(UNHANDLED))
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
