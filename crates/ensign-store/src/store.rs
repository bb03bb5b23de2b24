//! In-memory index over topics, events and event hashes, made durable by the journal.
//!
//! Every mutation takes the write lock, is appended to the journal (when there is
//! one) and only then applied to the index, so the index never holds state that a
//! restart would lose. Reads share the lock.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use ensign_api::rlid::Rlid;
use ensign_api::v1beta1::{
    EventWrapper, PageInfo, Topic, TopicExistsInfo, TopicInfo, TopicName, TopicNamesPage,
    TopicsPage,
};
use ensign_api::{parse_ulid, valid_topic_name, TOPIC_NAME_MAX_LEN};
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::errors::{StoreError, StoreResult};
use crate::journal::{self, Journal, Record, JOURNAL_FILE};
use crate::{DataStore, MetaStore};

/// Page size used when a request does not specify one.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Default)]
struct Index {
    topics: BTreeMap<Ulid, Topic>,
    names: HashMap<(Ulid, String), Ulid>,
    events: HashMap<Ulid, BTreeMap<Rlid, EventWrapper>>,
    hashes: HashMap<Ulid, BTreeMap<Vec<u8>, Rlid>>,
}

impl Index {
    fn apply(&mut self, record: Record) {
        match record {
            Record::PutTopic(topic) => {
                let (Ok(topic_id), Ok(project_id)) =
                    (parse_ulid(&topic.id), parse_ulid(&topic.project_id))
                else {
                    tracing::warn!(name = %topic.name, "skipping topic record without valid ids");
                    return;
                };

                if let Some(prev) = self.topics.get(&topic_id) {
                    self.names.remove(&(project_id, prev.name.clone()));
                }
                self.names.insert((project_id, topic.name.clone()), topic_id);
                self.topics.insert(topic_id, topic);
            }
            Record::DeleteTopic(topic_id) => {
                if let Some(topic) = self.topics.remove(&topic_id) {
                    if let Ok(project_id) = parse_ulid(&topic.project_id) {
                        self.names.remove(&(project_id, topic.name));
                    }
                }
            }
            Record::PutEvent(event) => {
                let (Ok(topic_id), Ok(event_id)) = (event.parse_topic_id(), event.parse_id())
                else {
                    tracing::warn!("skipping event record without valid ids");
                    return;
                };
                self.events
                    .entry(topic_id)
                    .or_default()
                    .insert(event_id, event);
            }
            Record::DestroyEvents(topic_id) => {
                self.events.remove(&topic_id);
                self.hashes.remove(&topic_id);
            }
            Record::PutHash {
                topic_id,
                hash,
                event_id,
            } => {
                self.hashes
                    .entry(topic_id)
                    .or_default()
                    .insert(hash, event_id);
            }
            Record::ClearHashes(topic_id) => {
                self.hashes.remove(&topic_id);
            }
        }
    }

    fn project_topics(&self, project_id: Ulid) -> impl Iterator<Item = (Ulid, &Topic)> {
        self.topics
            .iter()
            .filter(move |(_, topic)| {
                parse_ulid(&topic.project_id).is_ok_and(|id| id == project_id)
            })
            .map(|(id, topic)| (*id, topic))
    }
}

struct State {
    index: Index,
    journal: Option<Journal>,
}

impl State {
    fn commit(&mut self, record: Record) -> StoreResult<()> {
        if let Some(journal) = self.journal.as_mut() {
            journal.append(&record)?;
        }
        self.index.apply(record);
        Ok(())
    }
}

/// Meta and data store for a single node.
pub struct Store {
    state: RwLock<State>,
    read_only: bool,
}

impl Store {
    /// A store without a journal; all state is lost when it is dropped.
    pub fn in_memory(read_only: bool) -> Self {
        Self {
            state: RwLock::new(State {
                index: Index::default(),
                journal: None,
            }),
            read_only,
        }
    }

    /// Open the store on a data directory, replaying its journal. A read-only store
    /// replays the journal without opening it for writing.
    pub fn open(dir: impl AsRef<Path>, read_only: bool) -> StoreResult<Self> {
        let dir = dir.as_ref();
        let (journal, records) = if read_only {
            let (records, _) = journal::replay(&dir.join(JOURNAL_FILE))?;
            (None, records)
        } else {
            let (journal, records) = Journal::open(dir)?;
            (Some(journal), records)
        };

        let mut index = Index::default();
        let replayed = records.len();
        for record in records {
            index.apply(record);
        }

        tracing::info!(
            path = %dir.display(),
            read_only,
            records = replayed,
            topics = index.topics.len(),
            "opened ensign store"
        );

        Ok(Self {
            state: RwLock::new(State { index, journal }),
            read_only,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Flush the journal to disk.
    pub async fn sync(&self) -> StoreResult<()> {
        let state = self.state.read().await;
        if let Some(journal) = state.journal.as_ref() {
            journal.sync()?;
        }
        Ok(())
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }
}

/// Validate a topic for storage. Partial topics have not been assigned an id or
/// timestamps yet.
pub(crate) fn validate_topic(topic: &Topic, partial: bool) -> StoreResult<()> {
    if topic.project_id.is_empty() {
        return Err(StoreError::TOPIC_MISSING_PROJECT_ID);
    }

    match parse_ulid(&topic.project_id) {
        Ok(id) if !id.is_nil() => {}
        _ => return Err(StoreError::TOPIC_INVALID_PROJECT_ID),
    }

    if !topic.id.is_empty() && parse_ulid(&topic.id).is_err() {
        return Err(StoreError::TOPIC_INVALID_ID);
    }

    if topic.name.is_empty() {
        return Err(StoreError::TOPIC_MISSING_NAME);
    }

    if topic.name.len() > TOPIC_NAME_MAX_LEN {
        return Err(StoreError::TOPIC_NAME_TOO_LONG);
    }

    if !valid_topic_name(&topic.name) {
        return Err(StoreError::TOPIC_INVALID_NAME);
    }

    if let Some(policy) = &topic.deduplication {
        if policy.validate().is_err() {
            return Err(StoreError::TOPIC_INVALID_DEDUPLICATION);
        }
    }

    if !partial {
        if topic.id.is_empty() {
            return Err(StoreError::TOPIC_MISSING_ID);
        }

        if topic.created.is_none() {
            return Err(StoreError::TOPIC_INVALID_CREATED);
        }
    }

    Ok(())
}

fn validate_event(event: &EventWrapper) -> StoreResult<(Ulid, Rlid)> {
    if event.id.is_empty() {
        return Err(StoreError::EVENT_MISSING_ID);
    }
    let event_id = event.parse_id().map_err(|_| StoreError::EVENT_INVALID_ID)?;

    if event.topic_id.is_empty() {
        return Err(StoreError::EVENT_MISSING_TOPIC_ID);
    }
    let topic_id = event
        .parse_topic_id()
        .map_err(|_| StoreError::EVENT_INVALID_TOPIC_ID)?;

    Ok((topic_id, event_id))
}

// Sorted `(id, item)` pairs are paged by id; the page token is the id of the last item
// on the previous page.
fn paginate<'a, T: Clone + 'a>(
    items: impl Iterator<Item = (Ulid, &'a T)>,
    page: &PageInfo,
) -> StoreResult<(Vec<T>, String)> {
    let page_size = match page.page_size {
        0 => DEFAULT_PAGE_SIZE,
        n => n,
    } as usize;

    let after = if page.next_page_token.is_empty() {
        None
    } else {
        Some(Ulid::from_string(&page.next_page_token).map_err(|_| StoreError::InvalidPageToken)?)
    };

    let mut results = Vec::with_capacity(page_size.min(1024));
    let mut last = None;
    let mut has_next = false;

    for (id, item) in items {
        if after.is_some_and(|after| id <= after) {
            continue;
        }

        if results.len() == page_size {
            has_next = true;
            break;
        }

        results.push(item.clone());
        last = Some(id);
    }

    let token = match (has_next, last) {
        (true, Some(id)) => id.to_string(),
        _ => String::new(),
    };
    Ok((results, token))
}

#[async_trait]
impl MetaStore for Store {
    async fn allowed_topics(&self, project_id: Ulid) -> StoreResult<Vec<Ulid>> {
        let state = self.state.read().await;
        Ok(state.index.project_topics(project_id).map(|(id, _)| id).collect())
    }

    async fn topic_name(&self, topic_id: Ulid) -> StoreResult<String> {
        let state = self.state.read().await;
        state
            .index
            .topics
            .get(&topic_id)
            .map(|topic| topic.name.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn lookup_topic_name(&self, name: &str, project_id: Ulid) -> StoreResult<Ulid> {
        let state = self.state.read().await;
        state
            .index
            .names
            .get(&(project_id, name.to_string()))
            .copied()
            .ok_or(StoreError::NotFound)
    }

    async fn list_topics(&self, project_id: Ulid, page: &PageInfo) -> StoreResult<TopicsPage> {
        let state = self.state.read().await;
        let (topics, next_page_token) = paginate(state.index.project_topics(project_id), page)?;
        Ok(TopicsPage {
            topics,
            next_page_token,
        })
    }

    async fn list_topic_names(
        &self,
        project_id: Ulid,
        page: &PageInfo,
    ) -> StoreResult<TopicNamesPage> {
        let state = self.state.read().await;
        let names: Vec<(Ulid, TopicName)> = state
            .index
            .project_topics(project_id)
            .map(|(id, topic)| {
                (
                    id,
                    TopicName {
                        topic_id: id.to_string(),
                        project_id: project_id.to_string(),
                        name: topic.name.clone(),
                    },
                )
            })
            .collect();

        let (topic_names, next_page_token) =
            paginate(names.iter().map(|(id, name)| (*id, name)), page)?;
        Ok(TopicNamesPage {
            topic_names,
            next_page_token,
        })
    }

    async fn create_topic(&self, mut topic: Topic) -> StoreResult<Topic> {
        self.check_writable()?;
        if let Some(policy) = topic.deduplication.as_mut() {
            policy.normalize();
        }
        validate_topic(&topic, true)?;

        let project_id = parse_ulid(&topic.project_id)
            .map_err(|_| StoreError::TOPIC_INVALID_PROJECT_ID)?;
        let topic_id = if topic.id.is_empty() {
            Ulid::new()
        } else {
            parse_ulid(&topic.id).map_err(|_| StoreError::TOPIC_INVALID_ID)?
        };

        topic.id = topic_id.to_bytes().to_vec();
        topic.project_id = project_id.to_bytes().to_vec();
        topic.created = Some(ensign_api::now());
        topic.modified = topic.created;

        let mut state = self.state.write().await;
        if state.index.topics.contains_key(&topic_id) {
            return Err(StoreError::AlreadyExists);
        }

        if state
            .index
            .names
            .contains_key(&(project_id, topic.name.clone()))
        {
            return Err(StoreError::TOPIC_UNIQUE_NAME);
        }

        state.commit(Record::PutTopic(topic.clone()))?;
        Ok(topic)
    }

    async fn retrieve_topic(&self, topic_id: Ulid) -> StoreResult<Topic> {
        let state = self.state.read().await;
        state
            .index
            .topics
            .get(&topic_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn update_topic(&self, mut topic: Topic) -> StoreResult<Topic> {
        self.check_writable()?;
        if let Some(policy) = topic.deduplication.as_mut() {
            policy.normalize();
        }
        validate_topic(&topic, false)?;

        let topic_id = parse_ulid(&topic.id).map_err(|_| StoreError::TOPIC_INVALID_ID)?;
        let mut state = self.state.write().await;

        let existing = state.index.topics.get(&topic_id).ok_or(StoreError::NotFound)?;
        if existing.parse_project_id().ok() != topic.parse_project_id().ok() {
            return Err(StoreError::NotFound);
        }

        if existing.name != topic.name {
            return Err(StoreError::TOPIC_NAME_CHANGED);
        }

        topic.modified = Some(ensign_api::now());
        state.commit(Record::PutTopic(topic.clone()))?;
        Ok(topic)
    }

    async fn delete_topic(&self, topic_id: Ulid) -> StoreResult<()> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        if !state.index.topics.contains_key(&topic_id) {
            return Ok(());
        }
        state.commit(Record::DeleteTopic(topic_id))
    }

    async fn topic_exists(&self, query: &TopicName) -> StoreResult<TopicExistsInfo> {
        let project_id = match Ulid::from_string(query.project_id.trim()) {
            Ok(id) if !id.is_nil() => id,
            _ => return Err(StoreError::TOPIC_INVALID_PROJECT_ID),
        };

        let topic_id = if query.topic_id.is_empty() {
            None
        } else {
            match Ulid::from_string(query.topic_id.trim()) {
                Ok(id) if !id.is_nil() => Some(id),
                _ => return Err(StoreError::TOPIC_INVALID_ID),
            }
        };

        let state = self.state.read().await;
        let name_exists = !query.name.is_empty()
            && state
                .index
                .names
                .contains_key(&(project_id, query.name.clone()));

        let topic_exists = topic_id.is_some_and(|id| {
            state
                .index
                .topics
                .get(&id)
                .is_some_and(|topic| topic.project_id == project_id.to_bytes())
        });

        let (query, exists) = match (query.name.is_empty(), topic_id) {
            (false, Some(_)) => (
                format!("name={:?} and topic={:?}", query.name, query.topic_id),
                name_exists && topic_exists,
            ),
            (false, None) => (format!("name={:?}", query.name), name_exists),
            (true, Some(_)) => (format!("topic={:?}", query.topic_id), topic_exists),
            (true, None) => return Err(StoreError::TOPIC_MISSING_NAME),
        };

        Ok(TopicExistsInfo { query, exists })
    }

    async fn topic_info(&self, topic_id: Ulid) -> StoreResult<TopicInfo> {
        let state = self.state.read().await;
        let topic = state
            .index
            .topics
            .get(&topic_id)
            .ok_or(StoreError::NotFound)?;

        let mut info = TopicInfo {
            topic_id: topic.id.clone(),
            project_id: topic.project_id.clone(),
            modified: Some(ensign_api::now()),
            ..Default::default()
        };

        if let Some(events) = state.index.events.get(&topic_id) {
            for (id, event) in events {
                info.events += 1;
                if event.is_duplicate {
                    info.duplicates += 1;
                }
                info.data_size_bytes += event.data_size() as u64;
                info.event_offset_id = id.to_vec();
            }
        }

        Ok(info)
    }
}

#[async_trait]
impl DataStore for Store {
    async fn insert(&self, event: &EventWrapper) -> StoreResult<()> {
        self.check_writable()?;
        validate_event(event)?;
        let mut state = self.state.write().await;
        state.commit(Record::PutEvent(event.clone()))
    }

    async fn retrieve(&self, topic_id: Ulid, event_id: Rlid) -> StoreResult<EventWrapper> {
        let state = self.state.read().await;
        state
            .index
            .events
            .get(&topic_id)
            .and_then(|events| events.get(&event_id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list(&self, topic_id: Ulid) -> StoreResult<Vec<EventWrapper>> {
        let state = self.state.read().await;
        Ok(state
            .index
            .events
            .get(&topic_id)
            .map(|events| events.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn indash(&self, topic_id: Ulid, hash: &[u8], event_id: Rlid) -> StoreResult<()> {
        self.check_writable()?;
        if topic_id.is_nil() || hash.is_empty() {
            return Err(StoreError::NullKey);
        }

        let mut state = self.state.write().await;
        state.commit(Record::PutHash {
            topic_id,
            hash: hash.to_vec(),
            event_id,
        })
    }

    async fn unhash(&self, topic_id: Ulid, hash: &[u8]) -> StoreResult<EventWrapper> {
        let state = self.state.read().await;
        let event_id = state
            .index
            .hashes
            .get(&topic_id)
            .and_then(|hashes| hashes.get(hash))
            .ok_or(StoreError::NotFound)?;

        state
            .index
            .events
            .get(&topic_id)
            .and_then(|events| events.get(event_id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn load_indash(&self, topic_id: Ulid) -> StoreResult<Vec<Vec<u8>>> {
        if topic_id.is_nil() {
            return Err(StoreError::NullKey);
        }

        let state = self.state.read().await;
        Ok(state
            .index
            .hashes
            .get(&topic_id)
            .map(|hashes| hashes.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear_indash(&self, topic_id: Ulid) -> StoreResult<()> {
        self.check_writable()?;
        if topic_id.is_nil() {
            return Err(StoreError::NullKey);
        }

        let mut state = self.state.write().await;
        state.commit(Record::ClearHashes(topic_id))
    }

    async fn destroy(&self, topic_id: Ulid) -> StoreResult<()> {
        self.check_writable()?;
        if topic_id.is_nil() {
            return Err(StoreError::NullKey);
        }

        let mut state = self.state.write().await;
        state.commit(Record::DestroyEvents(topic_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensign_api::v1beta1::{deduplication::Strategy, Deduplication};

    fn topic(project_id: Ulid, name: &str) -> Topic {
        Topic {
            project_id: project_id.to_bytes().to_vec(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn event(topic_id: Ulid, seq: u32, data: &[u8]) -> EventWrapper {
        EventWrapper {
            id: Rlid::from_parts(1_700_000_000, seq).unwrap().to_vec(),
            topic_id: topic_id.to_bytes().to_vec(),
            event: data.to_vec(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_retrieve_topic() {
        let store = Store::in_memory(false);
        let project = Ulid::new();

        let created = store.create_topic(topic(project, "orders")).await.unwrap();
        assert_eq!(created.id.len(), 16);
        assert!(created.created.is_some());
        assert_eq!(created.created, created.modified);

        let topic_id = created.parse_topic_id().unwrap();
        let retrieved = store.retrieve_topic(topic_id).await.unwrap();
        assert_eq!(retrieved, created);

        assert_eq!(store.topic_name(topic_id).await.unwrap(), "orders");
        assert_eq!(
            store.lookup_topic_name("orders", project).await.unwrap(),
            topic_id
        );
        assert!(store
            .lookup_topic_name("orders", Ulid::new())
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(store.allowed_topics(project).await.unwrap(), vec![topic_id]);
    }

    #[tokio::test]
    async fn test_topic_validation() {
        let store = Store::in_memory(false);
        let project = Ulid::new();

        let cases = [
            (Topic::default(), "missing project_id field"),
            (
                Topic {
                    project_id: b"foo".to_vec(),
                    ..Default::default()
                },
                "cannot parse project_id field",
            ),
            (topic(project, ""), "missing name field"),
            (topic(project, "1orders"), "topic name is invalid"),
            (topic(project, &"a".repeat(513)), "topic name is too long"),
        ];

        for (input, msg) in cases {
            let err = store.create_topic(input).await.unwrap_err();
            assert!(err.is_invalid());
            assert_eq!(err.to_string(), msg);
        }

        let mut bad_policy = topic(project, "orders");
        bad_policy.deduplication = Some(Deduplication {
            strategy: Strategy::KeyGrouped as i32,
            ..Default::default()
        });
        let err = store.create_topic(bad_policy).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid deduplication policy");

        store.create_topic(topic(project, "orders")).await.unwrap();
        let err = store.create_topic(topic(project, "orders")).await.unwrap_err();
        assert_eq!(err.to_string(), "topic name already exists in project");

        // Names are unique per project only.
        store.create_topic(topic(Ulid::new(), "orders")).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_and_delete_topic() {
        let store = Store::in_memory(false);
        let project = Ulid::new();
        let mut created = store.create_topic(topic(project, "orders")).await.unwrap();
        let topic_id = created.parse_topic_id().unwrap();

        created.readonly = true;
        let updated = store.update_topic(created.clone()).await.unwrap();
        assert!(updated.readonly);
        assert!(store.retrieve_topic(topic_id).await.unwrap().readonly);

        let mut renamed = updated.clone();
        renamed.name = "shipments".into();
        let err = store.update_topic(renamed).await.unwrap_err();
        assert_eq!(err.to_string(), "topic name cannot be changed");

        store.delete_topic(topic_id).await.unwrap();
        assert!(store.retrieve_topic(topic_id).await.unwrap_err().is_not_found());
        assert!(store
            .lookup_topic_name("orders", project)
            .await
            .unwrap_err()
            .is_not_found());

        // Deleting a missing topic is not an error and updating it is not found.
        store.delete_topic(topic_id).await.unwrap();
        assert!(store.update_topic(updated).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_topics_pagination() {
        let store = Store::in_memory(false);
        let project = Ulid::new();
        for i in 0..7 {
            store
                .create_topic(topic(project, &format!("topic{i}")))
                .await
                .unwrap();
        }
        store.create_topic(topic(Ulid::new(), "other")).await.unwrap();

        let mut page = PageInfo {
            page_size: 3,
            next_page_token: String::new(),
        };
        let mut seen = Vec::new();
        let mut pages = 0;
        loop {
            let result = store.list_topics(project, &page).await.unwrap();
            pages += 1;
            seen.extend(result.topics.into_iter().map(|t| t.name));
            if result.next_page_token.is_empty() {
                break;
            }
            page.next_page_token = result.next_page_token;
        }

        assert_eq!(pages, 3);
        assert_eq!(seen.len(), 7);
        assert!(!seen.contains(&"other".to_string()));

        let names = store
            .list_topic_names(project, &PageInfo::default())
            .await
            .unwrap();
        assert_eq!(names.topic_names.len(), 7);
        assert!(names.next_page_token.is_empty());
        assert_eq!(names.topic_names[0].project_id, project.to_string());

        let bad = PageInfo {
            page_size: 3,
            next_page_token: "not a token".into(),
        };
        assert!(matches!(
            store.list_topics(project, &bad).await,
            Err(StoreError::InvalidPageToken)
        ));
    }

    #[tokio::test]
    async fn test_topic_exists() {
        let store = Store::in_memory(false);
        let project = Ulid::new();
        let created = store.create_topic(topic(project, "orders")).await.unwrap();
        let topic_id = created.parse_topic_id().unwrap().to_string();

        let query = |name: &str, topic_id: &str| TopicName {
            project_id: project.to_string(),
            name: name.to_string(),
            topic_id: topic_id.to_string(),
        };

        let info = store.topic_exists(&query("orders", "")).await.unwrap();
        assert!(info.exists);
        assert_eq!(info.query, "name=\"orders\"");

        let info = store.topic_exists(&query("", &topic_id)).await.unwrap();
        assert!(info.exists);

        let info = store.topic_exists(&query("shipments", &topic_id)).await.unwrap();
        assert!(!info.exists);

        assert!(store.topic_exists(&query("", "")).await.is_err());
        assert!(store.topic_exists(&query("", "foo")).await.is_err());
        let mut no_project = query("orders", "");
        no_project.project_id.clear();
        assert!(store.topic_exists(&no_project).await.is_err());
    }

    #[tokio::test]
    async fn test_events_and_topic_info() {
        let store = Store::in_memory(false);
        let created = store
            .create_topic(topic(Ulid::new(), "orders"))
            .await
            .unwrap();
        let topic_id = created.parse_topic_id().unwrap();

        for seq in [3, 1, 2] {
            store.insert(&event(topic_id, seq, b"abcd")).await.unwrap();
        }

        let events = store.list(topic_id).await.unwrap();
        let seqs: Vec<u32> = events
            .iter()
            .map(|e| e.parse_id().unwrap().sequence())
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let mut dup = event(topic_id, 2, b"");
        dup.is_duplicate = true;
        store.insert(&dup).await.unwrap();

        let info = store.topic_info(topic_id).await.unwrap();
        assert_eq!(info.events, 3);
        assert_eq!(info.duplicates, 1);
        assert_eq!(info.data_size_bytes, 8);
        assert_eq!(
            info.event_offset_id,
            Rlid::from_parts(1_700_000_000, 3).unwrap().to_vec()
        );

        let eid = Rlid::from_parts(1_700_000_000, 1).unwrap();
        assert_eq!(store.retrieve(topic_id, eid).await.unwrap().event, b"abcd");
        assert!(store
            .retrieve(topic_id, Rlid::from_parts(9, 9).unwrap())
            .await
            .unwrap_err()
            .is_not_found());

        assert!(store.topic_info(Ulid::new()).await.unwrap_err().is_not_found());

        let err = store.insert(&EventWrapper::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "missing id field");
        let mut no_topic = event(topic_id, 4, b"");
        no_topic.topic_id.clear();
        let err = store.insert(&no_topic).await.unwrap_err();
        assert_eq!(err.to_string(), "missing topic_id field");
    }

    #[tokio::test]
    async fn test_indash() {
        let store = Store::in_memory(false);
        let topic_id = Ulid::new();
        let original = event(topic_id, 1, b"abcd");
        store.insert(&original).await.unwrap();

        let eid = original.parse_id().unwrap();
        store.indash(topic_id, b"hash1", eid).await.unwrap();
        store.indash(topic_id, b"hash2", eid).await.unwrap();

        assert_eq!(store.unhash(topic_id, b"hash1").await.unwrap(), original);
        assert_eq!(store.load_indash(topic_id).await.unwrap().len(), 2);
        assert!(store.unhash(topic_id, b"nope").await.unwrap_err().is_not_found());

        store.clear_indash(topic_id).await.unwrap();
        assert!(store.load_indash(topic_id).await.unwrap().is_empty());
        assert!(matches!(
            store.clear_indash(Ulid::nil()).await,
            Err(StoreError::NullKey)
        ));

        store.indash(topic_id, b"hash1", eid).await.unwrap();
        store.destroy(topic_id).await.unwrap();
        assert!(store.list(topic_id).await.unwrap().is_empty());
        assert!(store.load_indash(topic_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_only() {
        let store = Store::in_memory(true);
        assert!(store.is_read_only());
        let err = store
            .create_topic(topic(Ulid::new(), "orders"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReadOnly));
        assert!(matches!(
            store.insert(&event(Ulid::new(), 1, b"")).await,
            Err(StoreError::ReadOnly)
        ));
    }

    #[tokio::test]
    async fn test_reopen_replays_journal() {
        let dir = tempfile::tempdir().unwrap();
        let project = Ulid::new();

        let (topic_id, deleted_id) = {
            let store = Store::open(dir.path(), false).unwrap();
            let kept = store.create_topic(topic(project, "orders")).await.unwrap();
            let gone = store.create_topic(topic(project, "gone")).await.unwrap();
            let topic_id = kept.parse_topic_id().unwrap();
            let deleted_id = gone.parse_topic_id().unwrap();

            store.insert(&event(topic_id, 1, b"abcd")).await.unwrap();
            store
                .indash(topic_id, b"hash", Rlid::from_parts(1_700_000_000, 1).unwrap())
                .await
                .unwrap();
            store.delete_topic(deleted_id).await.unwrap();
            store.sync().await.unwrap();
            (topic_id, deleted_id)
        };

        let store = Store::open(dir.path(), true).unwrap();
        assert_eq!(store.topic_name(topic_id).await.unwrap(), "orders");
        assert!(store.retrieve_topic(deleted_id).await.is_err());
        assert_eq!(store.list(topic_id).await.unwrap().len(), 1);
        assert_eq!(store.unhash(topic_id, b"hash").await.unwrap().event, b"abcd");
        assert!(matches!(
            store.delete_topic(topic_id).await,
            Err(StoreError::ReadOnly)
        ));
    }
}
