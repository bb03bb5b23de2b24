//! # Authentication & Claims
//!
//! Bearer token verification against the JWKS of the authentication service and
//! the claims-based authorization helpers used by every RPC handler.

mod claims;
pub mod jwks;

use async_trait::async_trait;
use tonic::metadata::MetadataMap;

pub use claims::{permissions, Claims};
pub use jwks::Validator;

pub const AUTHORIZATION: &str = "authorization";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,
    #[error("invalid authorization header")]
    MalformedCredentials,
    #[error("token header has no key id")]
    MissingKeyId,
    #[error("unknown signing key id {0:?}")]
    UnknownKeyId(String),
    #[error("unexpected signing algorithm")]
    UnexpectedAlgorithm,
    #[error("no jwks url configured")]
    NoKeysUrl,
    #[error("could not fetch jwks: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Verifies a raw bearer token and returns its claims.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Extract the bearer token from the `authorization` request metadata.
pub fn bearer_token(metadata: &MetadataMap) -> Result<&str, AuthError> {
    let value = metadata
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingCredentials)?
        .to_str()
        .map_err(|_| AuthError::MalformedCredentials)?
        .trim();

    let (scheme, token) = value
        .split_once(' ')
        .ok_or(AuthError::MalformedCredentials)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::MalformedCredentials);
    }

    match token.trim() {
        "" => Err(AuthError::MissingCredentials),
        token => Ok(token),
    }
}
