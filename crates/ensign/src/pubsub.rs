//! # Dispatcher
//!
//! The pub/sub core of the node. Events submitted by publish streams are queued for
//! the publish loop, the only writer of the commit counter: it stamps each event with
//! a fresh RLID, stores it, places it on the dispatch queue and only then replies to
//! the publisher. The dispatch loop broadcasts every event to the subscribers that
//! are registered at that moment; with no subscribers the event is dropped from the
//! live feed (it remains stored and queryable).
//!
//! All queues are bounded, so a slow subscriber slows down the dispatch loop, which
//! in turn blocks the publish loop and finally the publishers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ensign_api::rlid::Rlid;
use ensign_api::v1beta1::{Deduplication, EventWrapper};
use ensign_store::{DataStore, StoreError};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Default capacity of the dispatcher queues and of every subscriber channel.
pub const BUFFER: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    #[error("dispatcher is shut down")]
    Closed,
    #[error("could not commit event: {0}")]
    Store(#[from] StoreError),
    #[error("could not deduplicate event: {0}")]
    Dedup(#[from] ensign_api::DedupError),
}

/// The result of committing an event.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    pub id: Rlid,
    pub committed: prost_types::Timestamp,
    pub duplicate: bool,
}

struct Commit {
    event: EventWrapper,
    policy: Option<Deduplication>,
    reply: oneshot::Sender<Result<Committed, PubSubError>>,
}

type Subscribers = Arc<RwLock<HashMap<u64, mpsc::Sender<EventWrapper>>>>;

pub struct PubSub {
    queue: RwLock<Option<mpsc::Sender<Commit>>>,
    subscribers: Subscribers,
    next_subscriber: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    buffer: usize,
}

impl PubSub {
    /// Start the publish and dispatch loops. Must be called within a tokio runtime.
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self::with_buffer(store, BUFFER)
    }

    pub fn with_buffer(store: Arc<dyn DataStore>, buffer: usize) -> Self {
        let buffer = buffer.max(1);
        let (in_tx, in_rx) = mpsc::channel(buffer);
        let (out_tx, out_rx) = mpsc::channel(buffer);
        let subscribers: Subscribers = Arc::default();

        let publisher = tokio::spawn(publish_loop(store, in_rx, out_tx));
        let dispatcher = tokio::spawn(dispatch_loop(out_rx, subscribers.clone()));

        Self {
            queue: RwLock::new(Some(in_tx)),
            subscribers,
            next_subscriber: AtomicU64::new(1),
            tasks: Mutex::new(vec![publisher, dispatcher]),
            buffer,
        }
    }

    /// Submit an event and wait until it is committed and queued for dispatch. If a
    /// deduplication policy is given, duplicates of earlier events are committed as
    /// references to the original and are not dispatched.
    pub async fn publish(
        &self,
        event: EventWrapper,
        policy: Option<Deduplication>,
    ) -> Result<Committed, PubSubError> {
        let queue = self
            .queue
            .read()
            .await
            .clone()
            .ok_or(PubSubError::Closed)?;

        metrics::counter!("ensign_events_published_total").increment(1);
        let (reply, ack) = oneshot::channel();
        queue
            .send(Commit {
                event,
                policy,
                reply,
            })
            .await
            .map_err(|_| PubSubError::Closed)?;

        ack.await.map_err(|_| PubSubError::Closed)?
    }

    /// Register a subscriber; events committed from now on are delivered to the
    /// returned channel until [`PubSub::finish`] is called.
    pub async fn subscribe(&self) -> (u64, mpsc::Receiver<EventWrapper>) {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);

        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(id, tx);
        metrics::gauge!("ensign_online_subscribers").set(subscribers.len() as f64);
        (id, rx)
    }

    pub async fn finish(&self, id: u64) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.remove(&id);
        metrics::gauge!("ensign_online_subscribers").set(subscribers.len() as f64);
    }

    pub async fn num_subscribers(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.queue.read().await.is_none()
    }

    /// Stop accepting events, wait for the loops to drain the queues and close every
    /// subscriber channel.
    pub async fn shutdown(&self) {
        self.queue.write().await.take();

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "dispatcher task failed");
            }
        }

        self.subscribers.write().await.clear();
        metrics::gauge!("ensign_online_subscribers").set(0.0);
        tracing::debug!("dispatcher stopped");
    }
}

async fn publish_loop(
    store: Arc<dyn DataStore>,
    mut queue: mpsc::Receiver<Commit>,
    dispatch: mpsc::Sender<EventWrapper>,
) {
    let mut counter: u32 = 0;
    while let Some(Commit {
        mut event,
        policy,
        reply,
    }) = queue.recv().await
    {
        // The sequence only has to be unique within one tick of the clock.
        counter = counter.wrapping_add(1);
        let id = Rlid::make(counter);
        let committed = ensign_api::now();
        event.id = id.to_vec();
        event.committed = Some(committed.clone());
        event.is_duplicate = false;
        event.duplicate_id.clear();

        let result = match commit(store.as_ref(), &mut event, policy.as_ref()).await {
            Ok(duplicate) => {
                metrics::counter!("ensign_events_committed_total").increment(1);
                if !duplicate && dispatch.send(event).await.is_err() {
                    tracing::error!("dispatch queue closed before publish loop");
                    let _ = reply.send(Err(PubSubError::Closed));
                    break;
                }
                Ok(Committed {
                    id,
                    committed,
                    duplicate,
                })
            }
            Err(err) => {
                tracing::warn!(error = %err, event_id = %id, "could not commit event");
                Err(err)
            }
        };

        // The publisher may have gone away; the event is committed regardless.
        let _ = reply.send(result);
    }
    tracing::debug!("publish loop stopped");
}

/// Store the event, returns true if it was committed as a duplicate.
async fn commit(
    store: &dyn DataStore,
    event: &mut EventWrapper,
    policy: Option<&Deduplication>,
) -> Result<bool, PubSubError> {
    let topic_id = event
        .parse_topic_id()
        .map_err(|_| StoreError::EVENT_INVALID_TOPIC_ID)?;

    let Some(policy) = policy else {
        store.insert(event).await?;
        return Ok(false);
    };

    let Some(hash) = event.hash(policy)? else {
        store.insert(event).await?;
        return Ok(false);
    };

    match store.unhash(topic_id, &hash).await {
        Ok(original) if event.duplicates(&original, policy)? => {
            event.duplicate_of(&original, policy)?;
            store.insert(event).await?;
            Ok(true)
        }
        Ok(_) | Err(StoreError::NotFound) => {
            store.insert(event).await?;
            let id = Rlid::from_slice(&event.id).map_err(|_| StoreError::EVENT_INVALID_ID)?;
            store.indash(topic_id, &hash, id).await?;
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}

async fn dispatch_loop(mut queue: mpsc::Receiver<EventWrapper>, subscribers: Subscribers) {
    while let Some(event) = queue.recv().await {
        let targets: Vec<(u64, mpsc::Sender<EventWrapper>)> = subscribers
            .read()
            .await
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        if targets.is_empty() {
            tracing::trace!("no subscribers, dropping event from live feed");
            continue;
        }

        let mut gone = Vec::new();
        for (id, tx) in targets {
            if tx.send(event.clone()).await.is_err() {
                gone.push(id);
            }
        }

        if !gone.is_empty() {
            let mut subscribers = subscribers.write().await;
            for id in gone {
                subscribers.remove(&id);
            }
            metrics::gauge!("ensign_online_subscribers").set(subscribers.len() as f64);
        }
    }
    tracing::debug!("dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensign_api::v1beta1::{deduplication::Strategy, Event};
    use ensign_store::Store;
    use ulid::Ulid;

    fn event(topic_id: Ulid, data: &str) -> EventWrapper {
        EventWrapper::for_topic(
            topic_id,
            &Event {
                data: data.as_bytes().to_vec(),
                ..Default::default()
            },
        )
    }

    fn pubsub() -> (PubSub, Arc<Store>) {
        let store = Arc::new(Store::in_memory(false));
        (PubSub::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_monotonic_ids() {
        let (pubsub, store) = pubsub();
        let topic = Ulid::new();

        let mut prev: Option<Rlid> = None;
        for i in 0..50 {
            let committed = pubsub.publish(event(topic, &i.to_string()), None).await.unwrap();
            if let Some(prev) = prev {
                assert!(prev.as_bytes() < committed.id.as_bytes());
            }
            prev = Some(committed.id);
        }

        assert_eq!(store.list(topic).await.unwrap().len(), 50);
        pubsub.shutdown().await;
    }

    #[tokio::test]
    async fn test_fanout() {
        let (pubsub, _) = pubsub();
        let topic = Ulid::new();

        // Committed but not delivered to anyone.
        pubsub.publish(event(topic, "early"), None).await.unwrap();

        let (a, mut rx_a) = pubsub.subscribe().await;
        let (_, mut rx_b) = pubsub.subscribe().await;
        assert_eq!(pubsub.num_subscribers().await, 2);

        let committed = pubsub.publish(event(topic, "hello"), None).await.unwrap();
        for rx in [&mut rx_a, &mut rx_b] {
            let got = rx.recv().await.unwrap();
            assert_eq!(got.id, committed.id.to_vec());
            assert!(got.committed.is_some());
        }

        pubsub.finish(a).await;
        pubsub.publish(event(topic, "again"), None).await.unwrap();
        assert!(rx_b.recv().await.is_some());

        pubsub.shutdown().await;
        assert!(rx_b.recv().await.is_none());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_publishers() {
        let (pubsub, store) = pubsub();
        let pubsub = Arc::new(pubsub);
        let topic = Ulid::new();

        let mut handles = Vec::new();
        for p in 0..4 {
            let pubsub = pubsub.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for i in 0..25 {
                    let ack = pubsub
                        .publish(event(topic, &format!("{p}-{i}")), None)
                        .await
                        .unwrap();
                    ids.push(ack.id);
                }
                ids
            }));
        }

        for handle in handles {
            let ids = handle.await.unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
        }
        assert_eq!(store.list(topic).await.unwrap().len(), 100);
        pubsub.shutdown().await;
    }

    #[tokio::test]
    async fn test_deduplication() {
        let (pubsub, store) = pubsub();
        let topic = Ulid::new();
        let policy = Deduplication {
            strategy: Strategy::Datagram as i32,
            ..Default::default()
        };

        let (_, mut rx) = pubsub.subscribe().await;
        let first = pubsub
            .publish(event(topic, "same"), Some(policy.clone()))
            .await
            .unwrap();
        let second = pubsub
            .publish(event(topic, "same"), Some(policy.clone()))
            .await
            .unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);

        let stored = store.retrieve(topic, second.id).await.unwrap();
        assert!(stored.is_duplicate);
        assert_eq!(stored.duplicate_id, first.id.to_vec());

        // Only the original reaches subscribers.
        assert_eq!(rx.recv().await.unwrap().id, first.id.to_vec());
        pubsub.publish(event(topic, "different"), Some(policy)).await.unwrap();
        assert_ne!(rx.recv().await.unwrap().id, second.id.to_vec());
        pubsub.shutdown().await;
    }

    #[tokio::test]
    async fn test_commit_failure() {
        let store = Arc::new(Store::in_memory(true));
        let pubsub = PubSub::new(store);
        let err = pubsub.publish(event(Ulid::new(), "x"), None).await.unwrap_err();
        assert!(matches!(err, PubSubError::Store(StoreError::ReadOnly)));

        let err = pubsub.publish(EventWrapper::default(), None).await.unwrap_err();
        assert!(matches!(err, PubSubError::Store(_)));
        pubsub.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_after_shutdown() {
        let (pubsub, _) = pubsub();
        pubsub.shutdown().await;
        assert!(pubsub.is_closed().await);
        let err = pubsub.publish(event(Ulid::new(), "late"), None).await.unwrap_err();
        assert!(matches!(err, PubSubError::Closed));
    }
}
