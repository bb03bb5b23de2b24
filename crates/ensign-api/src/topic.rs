use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use ulid::Ulid;

use crate::v1beta1::{Topic, TopicInfo};
use crate::{parse_ulid, IdError};

pub const TOPIC_NAME_MAX_LEN: usize = 512;

static TOPIC_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").expect("topic name pattern is valid")
});

/// Topic names start with a letter or underscore and may contain letters, digits,
/// underscores, dots and dashes.
pub fn valid_topic_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= TOPIC_NAME_MAX_LEN && TOPIC_NAME.is_match(name)
}

impl Topic {
    pub fn parse_topic_id(&self) -> Result<Ulid, IdError> {
        parse_ulid(&self.id)
    }

    pub fn parse_project_id(&self) -> Result<Ulid, IdError> {
        parse_ulid(&self.project_id)
    }
}

impl TopicInfo {
    pub fn parse_topic_id(&self) -> Result<Ulid, IdError> {
        parse_ulid(&self.topic_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NameGroupError {
    #[error("topic name or id already exists in group")]
    AlreadyExists,
    #[error("topic name and id cannot be empty")]
    EmptyReference,
    #[error(transparent)]
    Id(#[from] IdError),
}

/// Bidirectional lookup between the names and ids of a set of related topics, e.g.
/// the topics a subscriber is allowed to read.
#[derive(Debug, Clone, Default)]
pub struct NameGroup {
    names: HashMap<String, Ulid>,
    ids: HashMap<Ulid, String>,
}

impl NameGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, id: Ulid) -> Result<(), NameGroupError> {
        if name.is_empty() || id.is_nil() {
            return Err(NameGroupError::EmptyReference);
        }

        if self.names.contains_key(name) || self.ids.contains_key(&id) {
            return Err(NameGroupError::AlreadyExists);
        }

        self.names.insert(name.to_string(), id);
        self.ids.insert(id, name.to_string());
        Ok(())
    }

    pub fn add_topic(&mut self, topic: &Topic) -> Result<(), NameGroupError> {
        let id = topic.parse_topic_id()?;
        self.add(&topic.name, id)
    }

    /// Resolve either a topic name or a ULID string to the `(name, id)` pair.
    pub fn lookup(&self, s: &str) -> Option<(&str, Ulid)> {
        if valid_topic_name(s) {
            if let Some((name, id)) = self.names.get_key_value(s) {
                return Some((name.as_str(), *id));
            }
        }

        let id = Ulid::from_string(s).ok()?;
        self.ids.get(&id).map(|name| (name.as_str(), id))
    }

    pub fn contains(&self, s: &str) -> bool {
        self.lookup(s).is_some()
    }

    pub fn contains_id(&self, id: &Ulid) -> bool {
        self.ids.contains_key(id)
    }

    pub fn name_of(&self, id: &Ulid) -> Option<&str> {
        self.ids.get(id).map(String::as_str)
    }

    pub fn id_of(&self, name: &str) -> Option<Ulid> {
        self.names.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Topic ids in the group in sorted order.
    pub fn ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<_> = self.ids.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Ulid)> {
        self.ids.iter().map(|(id, name)| (name.as_str(), *id))
    }
}
