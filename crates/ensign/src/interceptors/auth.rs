//! Authenticates the bearer token of every non-public RPC and attaches its claims
//! to the request context.

use std::sync::Arc;

use tonic::Status;

use super::Next;
use crate::auth::{bearer_token, AuthError, Authenticator};
use crate::context::Context;

pub const MISSING_CREDENTIALS: &str = "missing credentials";
pub const INVALID_CREDENTIALS: &str = "invalid credentials";

pub async fn intercept<T: Send + 'static>(
    authenticator: Arc<dyn Authenticator>,
    ctx: Context,
    next: Next<T>,
) -> Result<T, Status> {
    if ctx.method.public {
        return next(ctx).await;
    }

    let claims = match bearer_token(ctx.metadata()) {
        Ok(token) => authenticator.authenticate(token).await.map_err(|err| {
            tracing::debug!(error = %err, method = ctx.method.method, "could not verify bearer token");
            Status::unauthenticated(INVALID_CREDENTIALS)
        })?,
        Err(AuthError::MissingCredentials) => {
            return Err(Status::unauthenticated(MISSING_CREDENTIALS));
        }
        Err(err) => {
            tracing::debug!(error = %err, "could not parse authorization header");
            return Err(Status::unauthenticated(INVALID_CREDENTIALS));
        }
    };

    next(ctx.with_claims(claims)).await
}
