//! # ensign-api: the Ensign wire protocol
//!
//! Generated protobuf messages and gRPC stubs for the `ensign.v1beta1` service and the
//! standard `grpc.health.v1` probe, plus the helpers that every other crate uses to
//! work with them: [`rlid::Rlid`] event identifiers, event wrapping, deduplication
//! hashing, ULID parsing and topic name lookups.

pub mod rlid;

mod dedup;
mod event;
mod topic;

pub use dedup::DedupError;
pub use event::{from_datetime, now, to_datetime, DuplicateError, EVENT_MAX_DATA_SIZE};
pub use topic::{valid_topic_name, NameGroup, NameGroupError, TOPIC_NAME_MAX_LEN};

#[allow(clippy::all)]
pub mod v1beta1 {
    tonic::include_proto!("ensign.v1beta1");
}

#[allow(clippy::all)]
pub mod health {
    pub mod v1 {
        tonic::include_proto!("grpc.health.v1");
    }
}

use ulid::Ulid;

/// Errors parsing 128 bit identifiers (topic and project ids).
#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("missing identifier")]
    Empty,
    #[error("identifier must be 16 bytes or a 26 character string")]
    InvalidLength,
    #[error("could not decode identifier: {0}")]
    Decode(#[from] ulid::DecodeError),
}

/// Parse a ULID carried in a protobuf `bytes` field. Both the raw 16 byte encoding and
/// the 26 character string encoding are accepted.
pub fn parse_ulid(data: &[u8]) -> Result<Ulid, IdError> {
    match data.len() {
        0 => Err(IdError::Empty),
        16 => {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(data);
            Ok(Ulid::from_bytes(raw))
        }
        26 => {
            let s = std::str::from_utf8(data).map_err(|_| IdError::InvalidLength)?;
            Ok(Ulid::from_string(s)?)
        }
        _ => Err(IdError::InvalidLength),
    }
}

/// Parse a ULID from its string form, trimming surrounding whitespace.
pub fn parse_ulid_str(s: &str) -> Result<Ulid, IdError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    Ok(Ulid::from_string(s)?)
}
