//! # ensign-store: topic metadata and event storage
//!
//! The node reaches storage only through the [`MetaStore`] and [`DataStore`] traits.
//! [`Store`] implements both over an in-memory index that is made durable with an
//! append-only [`journal`] when it is opened on a data directory.

pub mod errors;
pub mod journal;
mod store;

use async_trait::async_trait;
use ensign_api::rlid::Rlid;
use ensign_api::v1beta1::{
    EventWrapper, PageInfo, Topic, TopicExistsInfo, TopicInfo, TopicName, TopicNamesPage,
    TopicsPage,
};
use ulid::Ulid;

pub use errors::{StoreError, StoreResult};
pub use store::{Store, DEFAULT_PAGE_SIZE};

/// Topic metadata: topics, the names index, and per-topic statistics.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Ids of every topic that belongs to the project.
    async fn allowed_topics(&self, project_id: Ulid) -> StoreResult<Vec<Ulid>>;

    async fn topic_name(&self, topic_id: Ulid) -> StoreResult<String>;

    /// Resolve a topic name within a project to the topic id.
    async fn lookup_topic_name(&self, name: &str, project_id: Ulid) -> StoreResult<Ulid>;

    async fn list_topics(&self, project_id: Ulid, page: &PageInfo) -> StoreResult<TopicsPage>;

    async fn list_topic_names(
        &self,
        project_id: Ulid,
        page: &PageInfo,
    ) -> StoreResult<TopicNamesPage>;

    /// Validate and store a new topic, assigning its id and timestamps.
    async fn create_topic(&self, topic: Topic) -> StoreResult<Topic>;

    async fn retrieve_topic(&self, topic_id: Ulid) -> StoreResult<Topic>;

    /// Replace an existing topic; the name of a topic cannot change.
    async fn update_topic(&self, topic: Topic) -> StoreResult<Topic>;

    /// Remove the topic and its name; deleting a missing topic is not an error.
    async fn delete_topic(&self, topic_id: Ulid) -> StoreResult<()>;

    async fn topic_exists(&self, query: &TopicName) -> StoreResult<TopicExistsInfo>;

    async fn topic_info(&self, topic_id: Ulid) -> StoreResult<TopicInfo>;
}

/// Committed events and the deduplication hash index ("indash").
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Store a committed event, replacing any event with the same topic and id.
    async fn insert(&self, event: &EventWrapper) -> StoreResult<()>;

    async fn retrieve(&self, topic_id: Ulid, event_id: Rlid) -> StoreResult<EventWrapper>;

    /// Every event in the topic in id order.
    async fn list(&self, topic_id: Ulid) -> StoreResult<Vec<EventWrapper>>;

    /// Record the hash of an event for duplicate detection.
    async fn indash(&self, topic_id: Ulid, hash: &[u8], event_id: Rlid) -> StoreResult<()>;

    /// The event recorded under the hash.
    async fn unhash(&self, topic_id: Ulid, hash: &[u8]) -> StoreResult<EventWrapper>;

    async fn load_indash(&self, topic_id: Ulid) -> StoreResult<Vec<Vec<u8>>>;

    async fn clear_indash(&self, topic_id: Ulid) -> StoreResult<()>;

    /// Delete every event and hash of the topic.
    async fn destroy(&self, topic_id: Ulid) -> StoreResult<()>;
}
