//! # Deduplication
//!
//! Hashing and equality of events under a topic's [`Deduplication`] policy. Hashes
//! select duplicate candidates; [`EventWrapper::duplicates`] confirms them without
//! relying on the hash.
//!
//! | Strategy       | Hashed and compared                                   |
//! |----------------|-------------------------------------------------------|
//! | `NONE`         | nothing, events are never duplicates                  |
//! | `STRICT`       | data, sorted metadata, mimetype, type                 |
//! | `DATAGRAM`     | data only                                             |
//! | `KEY_GROUPED`  | values of the policy keys, then data                  |
//! | `UNIQUE_FIELD` | values of the policy fields in a JSON object datagram |

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::v1beta1::{deduplication::Strategy, Deduplication, Event, EventWrapper, Type};

#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("deduplication policy requires at least one metadata key")]
    NoKeys,
    #[error("deduplication policy requires at least one field")]
    NoFields,
    #[error("keys are not allowed with this deduplication strategy")]
    KeysNotAllowed,
    #[error("fields are not allowed with this deduplication strategy")]
    FieldsNotAllowed,
    #[error("duplicates are not allowed with this deduplication strategy")]
    DuplicatesNotAllowed,
    #[error("unique field deduplication requires a JSON object datagram")]
    NotAnObject,
    #[error("could not unwrap event: {0}")]
    Decode(#[from] prost::DecodeError),
}

impl Deduplication {
    /// Drop keys and fields the strategy does not use and sort and deduplicate the ones
    /// it does.
    pub fn normalize(&mut self) -> &mut Self {
        match self.strategy() {
            Strategy::None | Strategy::Strict | Strategy::Datagram => {
                self.keys.clear();
                self.fields.clear();
            }
            Strategy::KeyGrouped => {
                unique_sort(&mut self.keys);
                self.fields.clear();
            }
            Strategy::UniqueField => {
                self.keys.clear();
                unique_sort(&mut self.fields);
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), DedupError> {
        match self.strategy() {
            Strategy::None | Strategy::Strict | Strategy::Datagram => {
                if !self.keys.is_empty() {
                    return Err(DedupError::KeysNotAllowed);
                }
                if !self.fields.is_empty() {
                    return Err(DedupError::FieldsNotAllowed);
                }
            }
            Strategy::KeyGrouped => {
                if self.keys.is_empty() {
                    return Err(DedupError::NoKeys);
                }
                if !self.fields.is_empty() {
                    return Err(DedupError::FieldsNotAllowed);
                }
            }
            Strategy::UniqueField => {
                if self.fields.is_empty() {
                    return Err(DedupError::NoFields);
                }
                if !self.keys.is_empty() {
                    return Err(DedupError::KeysNotAllowed);
                }
            }
        }
        Ok(())
    }
}

fn unique_sort(items: &mut Vec<String>) {
    items.sort();
    items.dedup();
}

impl EventWrapper {
    /// Signature of the wrapped event under the policy, `None` when the policy does not
    /// deduplicate.
    pub fn hash(&self, policy: &Deduplication) -> Result<Option<Vec<u8>>, DedupError> {
        let strategy = policy.strategy();
        if strategy == Strategy::None {
            return Ok(None);
        }

        let event = self.unwrap_event()?;
        let mut hasher = Sha256::new();

        match strategy {
            Strategy::None => return Ok(None),
            Strategy::Strict => {
                hasher.update(&event.data);
                let metadata: BTreeMap<_, _> = event.metadata.iter().collect();
                for (key, val) in metadata {
                    hasher.update(key.as_bytes());
                    hasher.update(val.as_bytes());
                }
                hasher.update(event.mimetype.to_le_bytes());
                let etype = event.resolve_type();
                hasher.update(etype.name.as_bytes());
                hasher.update(etype.major_version.to_le_bytes());
                hasher.update(etype.minor_version.to_le_bytes());
                hasher.update(etype.patch_version.to_le_bytes());
            }
            Strategy::Datagram => hasher.update(&event.data),
            Strategy::KeyGrouped => {
                if policy.keys.is_empty() {
                    return Err(DedupError::NoKeys);
                }
                for key in &policy.keys {
                    hasher.update(key.as_bytes());
                    hasher.update(metadata_value(&event, key).as_bytes());
                }
                hasher.update(&event.data);
            }
            Strategy::UniqueField => {
                if policy.fields.is_empty() {
                    return Err(DedupError::NoFields);
                }
                for (field, value) in unique_fields(&event, &policy.fields)? {
                    hasher.update(field.as_bytes());
                    hasher.update(value.as_bytes());
                }
            }
        }

        Ok(Some(hasher.finalize().to_vec()))
    }

    /// Equality check of two events under the policy, used to confirm hash candidates.
    pub fn duplicates(&self, other: &EventWrapper, policy: &Deduplication) -> Result<bool, DedupError> {
        let strategy = policy.strategy();
        if strategy == Strategy::None {
            return Ok(false);
        }

        let ours = self.unwrap_event()?;
        let theirs = other.unwrap_event()?;

        match strategy {
            Strategy::None => Ok(false),
            Strategy::Strict => Ok(ours.strict_equals(&theirs)),
            Strategy::Datagram => Ok(ours.data == theirs.data),
            Strategy::KeyGrouped => {
                if policy.keys.is_empty() {
                    return Err(DedupError::NoKeys);
                }
                let grouped = policy
                    .keys
                    .iter()
                    .all(|key| metadata_value(&ours, key) == metadata_value(&theirs, key));
                Ok(grouped && ours.data == theirs.data)
            }
            Strategy::UniqueField => {
                if policy.fields.is_empty() {
                    return Err(DedupError::NoFields);
                }
                Ok(unique_fields(&ours, &policy.fields)? == unique_fields(&theirs, &policy.fields)?)
            }
        }
    }

    /// Turn this event into a duplicate reference to `original`, dropping whatever the
    /// original already stores. Does not check that the events are duplicates.
    pub fn duplicate_of(&mut self, original: &EventWrapper, policy: &Deduplication) -> Result<(), DedupError> {
        let strategy = policy.strategy();
        if strategy == Strategy::None {
            return Err(DedupError::DuplicatesNotAllowed);
        }

        self.is_duplicate = true;
        self.duplicate_id = original.id.clone();

        if strategy == Strategy::Strict {
            self.event.clear();
            self.encryption = None;
            self.compression = None;
            return Ok(());
        }

        let mut event = self.unwrap_event()?;
        let orig = original.unwrap_event()?;

        if matches!(strategy, Strategy::Datagram | Strategy::KeyGrouped) || event.data == orig.data {
            event.data.clear();
        }

        event
            .metadata
            .retain(|key, val| orig.metadata.get(key) != Some(val));

        if event.mimetype == orig.mimetype {
            event.mimetype = 0;
        }

        if event.r#type == orig.r#type {
            event.r#type = None;
        }

        self.wrap(&event);
        Ok(())
    }
}

impl Event {
    /// The event type, or the unspecified type for typeless events.
    pub fn resolve_type(&self) -> Type {
        match &self.r#type {
            Some(etype) if !etype.is_zero() => etype.clone(),
            _ => Type::unspecified(),
        }
    }

    /// Mimetype, type, data and metadata must all match; the created timestamp is
    /// ignored.
    pub fn strict_equals(&self, other: &Event) -> bool {
        self.mimetype == other.mimetype
            && self.resolve_type() == other.resolve_type()
            && self.data == other.data
            && self.metadata == other.metadata
    }
}

impl Type {
    pub const UNSPECIFIED: &'static str = "Unspecified";

    pub fn unspecified() -> Self {
        Self {
            name: Self::UNSPECIFIED.to_string(),
            ..Default::default()
        }
    }

    pub fn is_zero(&self) -> bool {
        (self.name.is_empty() || self.name == Self::UNSPECIFIED)
            && self.major_version == 0
            && self.minor_version == 0
            && self.patch_version == 0
    }
}

fn metadata_value<'a>(event: &'a Event, key: &str) -> &'a str {
    event.metadata.get(key).map(String::as_str).unwrap_or_default()
}

// Selected top level fields of a JSON object, rendered canonically. Missing fields
// render as null so that their absence is part of the signature.
fn unique_fields(event: &Event, fields: &[String]) -> Result<Vec<(String, String)>, DedupError> {
    let value: serde_json::Value =
        serde_json::from_slice(&event.data).map_err(|_| DedupError::NotAnObject)?;
    let object = value.as_object().ok_or(DedupError::NotAnObject)?;

    Ok(fields
        .iter()
        .map(|field| {
            let rendered = object
                .get(field)
                .map(|v| v.to_string())
                .unwrap_or_else(|| "null".to_string());
            (field.clone(), rendered)
        })
        .collect())
}
