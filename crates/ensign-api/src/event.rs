use chrono::{DateTime, TimeZone, Utc};
use prost::Message;
use ulid::Ulid;

use crate::rlid::{Rlid, RlidError};
use crate::v1beta1::{nack, Event, EventWrapper, Publisher};
use crate::{parse_ulid, IdError};

/// Events larger than 5 MB (serialized) are rejected by the broker.
pub const EVENT_MAX_DATA_SIZE: usize = 5_243_000;

#[derive(Debug, thiserror::Error)]
pub enum DuplicateError {
    #[error(transparent)]
    Id(#[from] RlidError),
    #[error("duplicate reference does not match the target event id")]
    Mismatch,
    #[error("could not unwrap event: {0}")]
    Decode(#[from] prost::DecodeError),
}

impl EventWrapper {
    /// Serialize the event into the wrapper, replacing any previously wrapped event.
    pub fn wrap(&mut self, event: &Event) {
        self.event = event.encode_to_vec();
    }

    /// Create a wrapper for the event on the given topic.
    pub fn for_topic(topic_id: Ulid, event: &Event) -> Self {
        let mut wrapper = Self {
            topic_id: topic_id.to_bytes().to_vec(),
            ..Default::default()
        };
        wrapper.wrap(event);
        wrapper
    }

    /// Deserialize the wrapped event.
    pub fn unwrap_event(&self) -> Result<Event, prost::DecodeError> {
        Event::decode(self.event.as_slice())
    }

    pub fn parse_topic_id(&self) -> Result<Ulid, IdError> {
        parse_ulid(&self.topic_id)
    }

    pub fn parse_id(&self) -> Result<Rlid, RlidError> {
        Rlid::from_slice(&self.id)
    }

    /// Size of the serialized inner event, used for size limits and topic statistics.
    pub fn data_size(&self) -> usize {
        self.event.len()
    }

    /// Restore the contents of a duplicate reference from the event it references,
    /// keeping whatever the duplicate stored on its own along with its id and commit
    /// metadata. The wrapper stays marked as a duplicate.
    pub fn duplicate_from(&mut self, target: &EventWrapper) -> Result<(), DuplicateError> {
        let target_id = target.parse_id()?;
        if self.duplicate_id != target_id.to_vec() {
            return Err(DuplicateError::Mismatch);
        }

        if self.event.is_empty() {
            self.event = target.event.clone();
            self.encryption = target.encryption.clone();
            self.compression = target.compression.clone();
            return Ok(());
        }

        let mut event = self.unwrap_event()?;
        let orig = target.unwrap_event()?;

        if event.data.is_empty() {
            event.data = orig.data;
        }

        for (key, val) in orig.metadata {
            event.metadata.entry(key).or_insert(val);
        }

        if event.mimetype == 0 {
            event.mimetype = orig.mimetype;
        }

        if event.r#type.is_none() {
            event.r#type = orig.r#type;
        }

        self.wrap(&event);
        Ok(())
    }
}

impl Publisher {
    /// The client id if the publisher supplied one, otherwise the authenticated
    /// publisher id.
    pub fn resolve_client_id(&self) -> String {
        if self.client_id.is_empty() {
            self.publisher_id.clone()
        } else {
            self.client_id.clone()
        }
    }
}

impl nack::Code {
    pub fn default_message(self) -> &'static str {
        match self {
            Self::UnknownType => "event could not be processed",
            Self::MaxEventSizeExceeded => "event exceeds the maximum allowed event size",
            Self::TopicUnknown => "topic is unknown or not available for publishing",
            Self::TopicArchived => "topic has been archived and is readonly",
            Self::PermissionDenied => "not authorized to publish to this topic",
            Self::Timeout => "timed out waiting for the event to be committed",
            Self::Unprocessed => "event was not committed and should be retried",
            Self::DeliverAgainAny => "event should be redelivered to any subscriber",
            Self::DeliverAgainNotMe => "event should be redelivered to another subscriber",
            Self::UnhandledMimetype => "subscriber cannot handle the event mimetype",
            Self::UnknownEventType => "subscriber cannot handle the event type",
        }
    }
}

/// The current time as a protobuf timestamp.
pub fn now() -> prost_types::Timestamp {
    from_datetime(Utc::now())
}

pub fn from_datetime(ts: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: ts.timestamp(),
        nanos: ts.timestamp_subsec_nanos() as i32,
    }
}

/// Convert a protobuf timestamp to a chrono timestamp, `None` if out of range.
pub fn to_datetime(ts: &prost_types::Timestamp) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts.seconds, ts.nanos.max(0) as u32).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v1beta1::MimeType;

    fn event() -> Event {
        Event {
            data: b"{\"color\": \"red\"}".to_vec(),
            mimetype: MimeType::ApplicationJson as i32,
            created: Some(now()),
            ..Default::default()
        }
    }

    #[test]
    fn test_wrap_and_unwrap() {
        let topic = Ulid::new();
        let wrapper = EventWrapper::for_topic(topic, &event());
        assert_eq!(wrapper.parse_topic_id().unwrap(), topic);

        let inner = wrapper.unwrap_event().unwrap();
        assert_eq!(inner.data, event().data);
        assert_eq!(inner.mimetype(), MimeType::ApplicationJson);
        assert!(wrapper.data_size() > inner.data.len());
    }

    #[test]
    fn test_missing_ids() {
        let wrapper = EventWrapper::default();
        assert!(matches!(wrapper.parse_topic_id(), Err(IdError::Empty)));
        assert_eq!(wrapper.parse_id(), Err(RlidError::DataSize));
    }

    #[test]
    fn test_duplicate_from() {
        let original = EventWrapper {
            id: Rlid::from_parts(10, 1).unwrap().to_vec(),
            event: vec![1, 2, 3],
            ..Default::default()
        };

        let mut dup = EventWrapper {
            id: Rlid::from_parts(10, 2).unwrap().to_vec(),
            is_duplicate: true,
            duplicate_id: original.id.clone(),
            ..Default::default()
        };
        dup.duplicate_from(&original).unwrap();
        assert_eq!(dup.event, original.event);
        assert_ne!(dup.id, original.id);

        let other = EventWrapper {
            id: Rlid::from_parts(10, 3).unwrap().to_vec(),
            ..Default::default()
        };
        assert!(matches!(
            dup.duplicate_from(&other),
            Err(DuplicateError::Mismatch)
        ));
    }

    #[test]
    fn test_resolve_client_id() {
        let mut publisher = Publisher {
            publisher_id: "apikey".into(),
            ..Default::default()
        };
        assert_eq!(publisher.resolve_client_id(), "apikey");
        publisher.client_id = "tester".into();
        assert_eq!(publisher.resolve_client_id(), "tester");
    }

    #[test]
    fn test_timestamp_conversion() {
        let ts = now();
        let dt = to_datetime(&ts).unwrap();
        assert_eq!(from_datetime(dt), ts);
    }
}
