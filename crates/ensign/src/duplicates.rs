//! Rebuilding the deduplication index of a topic.
//!
//! When the deduplication policy of a topic changes, every committed event has to be
//! reconsidered under the new policy: events that are no longer duplicates are
//! restored from the event they referenced, and events that now duplicate an earlier
//! event are reduced to a reference to it. Only the first event with a given hash is
//! recorded in the hash index.

use std::collections::HashMap;

use ensign_api::rlid::Rlid;
use ensign_api::v1beta1::{Deduplication, EventWrapper};
use ensign_api::{DedupError, DuplicateError};
use ensign_store::{DataStore, StoreError};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

#[derive(Debug, thiserror::Error)]
pub enum RehashError {
    #[error("rehash cancelled")]
    Cancelled,
    #[error("invalid deduplication policy: {0}")]
    Policy(DedupError),
    #[error(transparent)]
    Dedup(#[from] DedupError),
    #[error("could not restore duplicate: {0}")]
    Duplicate(#[from] DuplicateError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RehashStats {
    pub events: u64,
    pub duplicates: u64,
    pub restored: u64,
}

pub async fn rehash(
    data: &dyn DataStore,
    topic_id: Ulid,
    policy: &Deduplication,
    cancel: &CancellationToken,
) -> Result<RehashStats, RehashError> {
    let mut policy = policy.clone();
    policy.normalize();
    policy.validate().map_err(RehashError::Policy)?;

    data.clear_indash(topic_id).await?;
    let events = data.list(topic_id).await?;
    let by_id: HashMap<Vec<u8>, EventWrapper> = events
        .iter()
        .filter(|event| !event.is_duplicate)
        .map(|event| (event.id.clone(), event.clone()))
        .collect();

    let mut stats = RehashStats::default();
    let mut originals: HashMap<Vec<u8>, EventWrapper> = HashMap::new();

    for mut event in events {
        if cancel.is_cancelled() {
            return Err(RehashError::Cancelled);
        }
        stats.events += 1;

        let was_duplicate = event.is_duplicate;
        if was_duplicate {
            let target = match by_id.get(&event.duplicate_id) {
                Some(target) => target.clone(),
                None => {
                    let target_id = Rlid::from_slice(&event.duplicate_id)
                        .map_err(|_| StoreError::EVENT_INVALID_ID)?;
                    data.retrieve(topic_id, target_id).await?
                }
            };
            event.duplicate_from(&target)?;
            event.is_duplicate = false;
            event.duplicate_id.clear();
        }

        let Some(hash) = event.hash(&policy)? else {
            if was_duplicate {
                data.insert(&event).await?;
                stats.restored += 1;
            }
            continue;
        };

        if let Some(original) = originals.get(&hash) {
            if event.duplicates(original, &policy)? {
                event.duplicate_of(original, &policy)?;
                data.insert(&event).await?;
                stats.duplicates += 1;
                continue;
            }
        }

        if was_duplicate {
            data.insert(&event).await?;
            stats.restored += 1;
        }

        if !originals.contains_key(&hash) {
            let event_id = event.parse_id().map_err(|_| StoreError::EVENT_INVALID_ID)?;
            data.indash(topic_id, &hash, event_id).await?;
            originals.insert(hash, event);
        }
    }

    tracing::info!(
        topic_id = %topic_id,
        strategy = policy.strategy().as_str_name(),
        events = stats.events,
        duplicates = stats.duplicates,
        restored = stats.restored,
        "topic rehashed"
    );
    Ok(stats)
}
