use thiserror::Error;

/// Errors returned by the meta and data stores.
///
/// Validation errors carry a short message that is safe to return to clients, the
/// remaining variants should be logged and reported as internal errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database is readonly: cannot perform operation")]
    ReadOnly,

    #[error("object not found")]
    NotFound,

    #[error("object with specified key already exists")]
    AlreadyExists,

    #[error("{0}")]
    InvalidTopic(&'static str),

    #[error("{0}")]
    InvalidTopicInfo(&'static str),

    #[error("{0}")]
    InvalidEvent(&'static str),

    #[error("no part of the key can be zero-valued")]
    NullKey,

    #[error("invalid next page token field")]
    InvalidPageToken,

    #[error("journal is corrupted at offset {0}")]
    Corrupt(u64),

    #[error("could not decode journal record: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub const TOPIC_MISSING_PROJECT_ID: Self = Self::InvalidTopic("missing project_id field");
    pub const TOPIC_INVALID_PROJECT_ID: Self = Self::InvalidTopic("cannot parse project_id field");
    pub const TOPIC_MISSING_NAME: Self = Self::InvalidTopic("missing name field");
    pub const TOPIC_NAME_TOO_LONG: Self = Self::InvalidTopic("topic name is too long");
    pub const TOPIC_INVALID_NAME: Self = Self::InvalidTopic("topic name is invalid");
    pub const TOPIC_MISSING_ID: Self = Self::InvalidTopic("missing id field");
    pub const TOPIC_INVALID_ID: Self = Self::InvalidTopic("cannot parse id field");
    pub const TOPIC_INVALID_CREATED: Self = Self::InvalidTopic("invalid created field");
    pub const TOPIC_UNIQUE_NAME: Self = Self::InvalidTopic("topic name already exists in project");
    pub const TOPIC_NAME_CHANGED: Self = Self::InvalidTopic("topic name cannot be changed");
    pub const TOPIC_INVALID_DEDUPLICATION: Self =
        Self::InvalidTopic("invalid deduplication policy");

    pub const EVENT_MISSING_ID: Self = Self::InvalidEvent("missing id field");
    pub const EVENT_INVALID_ID: Self = Self::InvalidEvent("invalid id field");
    pub const EVENT_MISSING_TOPIC_ID: Self = Self::InvalidEvent("missing topic_id field");
    pub const EVENT_INVALID_TOPIC_ID: Self = Self::InvalidEvent("invalid topic_id field");

    /// True for errors caused by the caller's input rather than the store.
    pub fn is_invalid(&self) -> bool {
        matches!(
            self,
            Self::InvalidTopic(_)
                | Self::InvalidTopicInfo(_)
                | Self::InvalidEvent(_)
                | Self::NullKey
                | Self::InvalidPageToken
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
