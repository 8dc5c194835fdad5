//! Forward-Event Store
//!
//! Durable, deduplicated record of every completed forward, keyed by a
//! content hash of the routing tuple. Duplicate appends are a no-op so
//! overlapping page ranges can be re-ingested safely.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::error::RouterResult;

/// A completed payment-forwarding event, immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardEvent {
    /// Content hash identifying the event
    pub event_id: String,
    /// Reporting node that observed the forward
    pub node_public_key: String,
    /// Inbound channel id
    pub in_chan: String,
    /// Remote node of the inbound channel
    pub in_chan_node: String,
    /// Outbound channel id
    pub out_chan: String,
    /// Remote node of the outbound channel
    pub out_chan_node: String,
    /// Forwarded amount in sats
    pub amount_sats: u64,
    /// Fee earned in sats
    pub fee_sats: u64,
    /// Forwarded amount in fiat at the event's timestamp
    pub usd_amount: Decimal,
    /// Fee in fiat at the event's timestamp
    pub usd_fee: Decimal,
    /// When the forward completed
    pub routed_at: DateTime<Utc>,
    /// When the event was recorded locally
    pub created_at: DateTime<Utc>,
}

impl ForwardEvent {
    /// Content hash over the routing tuple. Two observations of the
    /// same forward always produce the same id.
    pub fn compute_id(
        in_chan_node: &str,
        out_chan_node: &str,
        routed_at: DateTime<Utc>,
        amount_sats: u64,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(in_chan_node.as_bytes());
        hasher.update(b"|");
        hasher.update(out_chan_node.as_bytes());
        hasher.update(b"|");
        hasher.update(routed_at.timestamp_millis().to_be_bytes());
        hasher.update(b"|");
        hasher.update(amount_sats.to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Outcome of an append attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The event was new and is now stored
    Inserted,
    /// An event with the same id already exists; nothing was written
    AlreadyExists,
}

/// Filter for historical scans
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events observed by this reporting node
    pub node_public_key: Option<String>,
    /// Only events routed strictly after this instant
    pub after: Option<DateTime<Utc>>,
}

impl EventFilter {
    fn matches(&self, event: &ForwardEvent) -> bool {
        if let Some(ref pk) = self.node_public_key {
            if &event.node_public_key != pk {
                return false;
            }
        }
        if let Some(after) = self.after {
            if event.routed_at <= after {
                return false;
            }
        }
        true
    }
}

/// Forward-event persistence trait
#[async_trait]
pub trait ForwardEventStore: Send + Sync {
    /// Persist `event`; a uniqueness conflict on `event_id` yields
    /// `AlreadyExists`, never an error.
    async fn append(&self, event: &ForwardEvent) -> RouterResult<AppendOutcome>;

    /// The event with the greatest `routed_at`, if any.
    async fn latest(&self) -> RouterResult<Option<ForwardEvent>>;

    /// Visit matching events in descending `routed_at` order. Finite
    /// and restartable: each call scans from scratch. The visitor is
    /// higher-ranked so borrowed events never outlive the call.
    async fn for_each(
        &self,
        filter: &EventFilter,
        visitor: &mut (dyn for<'a> FnMut(&'a ForwardEvent) + Send),
    ) -> RouterResult<()>;

    /// Number of stored events.
    async fn len(&self) -> RouterResult<usize>;
}

#[derive(Default)]
struct MemoryEventsInner {
    by_id: HashMap<String, ForwardEvent>,
    // (routed_at millis, event_id) keeps ordering stable when two
    // events share a timestamp.
    by_time: BTreeMap<(i64, String), String>,
}

/// In-memory forward-event store
#[derive(Default)]
pub struct MemoryForwardEventStore {
    inner: RwLock<MemoryEventsInner>,
}

impl MemoryForwardEventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ForwardEventStore for MemoryForwardEventStore {
    async fn append(&self, event: &ForwardEvent) -> RouterResult<AppendOutcome> {
        let mut inner = self.inner.write().await;
        if inner.by_id.contains_key(&event.event_id) {
            return Ok(AppendOutcome::AlreadyExists);
        }
        inner.by_time.insert(
            (event.routed_at.timestamp_millis(), event.event_id.clone()),
            event.event_id.clone(),
        );
        inner.by_id.insert(event.event_id.clone(), event.clone());
        Ok(AppendOutcome::Inserted)
    }

    async fn latest(&self) -> RouterResult<Option<ForwardEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_time
            .values()
            .next_back()
            .and_then(|id| inner.by_id.get(id))
            .cloned())
    }

    async fn for_each(
        &self,
        filter: &EventFilter,
        visitor: &mut (dyn for<'a> FnMut(&'a ForwardEvent) + Send),
    ) -> RouterResult<()> {
        let inner = self.inner.read().await;
        for id in inner.by_time.values().rev() {
            if let Some(event) = inner.by_id.get(id) {
                if filter.matches(event) {
                    visitor(event);
                }
            }
        }
        Ok(())
    }

    async fn len(&self) -> RouterResult<usize> {
        Ok(self.inner.read().await.by_id.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event_at(secs: i64, amount: u64) -> ForwardEvent {
        let routed_at = Utc.timestamp_opt(secs, 0).unwrap();
        ForwardEvent {
            event_id: ForwardEvent::compute_id("pk-in", "pk-out", routed_at, amount),
            node_public_key: "pk-node".to_string(),
            in_chan: "chan-1".to_string(),
            in_chan_node: "pk-in".to_string(),
            out_chan: "chan-2".to_string(),
            out_chan_node: "pk-out".to_string(),
            amount_sats: amount,
            fee_sats: 1,
            usd_amount: Decimal::ONE,
            usd_fee: Decimal::new(1, 3),
            routed_at,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_event_id_deterministic() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let a = ForwardEvent::compute_id("pk-a", "pk-b", at, 1000);
        let b = ForwardEvent::compute_id("pk-a", "pk-b", at, 1000);
        assert_eq!(a, b);
        assert_ne!(a, ForwardEvent::compute_id("pk-a", "pk-b", at, 1001));
        assert_ne!(a, ForwardEvent::compute_id("pk-b", "pk-a", at, 1000));
    }

    #[tokio::test]
    async fn test_append_deduplicates() {
        let store = MemoryForwardEventStore::new();
        let event = event_at(100, 1000);

        assert_eq!(
            store.append(&event).await.unwrap(),
            AppendOutcome::Inserted
        );
        assert_eq!(
            store.append(&event).await.unwrap(),
            AppendOutcome::AlreadyExists
        );
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_latest_by_routed_at() {
        let store = MemoryForwardEventStore::new();
        store.append(&event_at(200, 1)).await.unwrap();
        store.append(&event_at(100, 2)).await.unwrap();
        store.append(&event_at(300, 3)).await.unwrap();

        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.routed_at.timestamp(), 300);
    }

    #[tokio::test]
    async fn test_for_each_descending_and_restartable() {
        let store = MemoryForwardEventStore::new();
        store.append(&event_at(100, 1)).await.unwrap();
        store.append(&event_at(300, 2)).await.unwrap();
        store.append(&event_at(200, 3)).await.unwrap();

        for _ in 0..2 {
            let mut seen = Vec::new();
            store
                .for_each(&EventFilter::default(), &mut |event| {
                    seen.push(event.routed_at.timestamp());
                })
                .await
                .unwrap();
            assert_eq!(seen, vec![300, 200, 100]);
        }
    }

    #[tokio::test]
    async fn test_for_each_through_trait_object() {
        let store: std::sync::Arc<dyn ForwardEventStore> =
            std::sync::Arc::new(MemoryForwardEventStore::new());
        store.append(&event_at(100, 1)).await.unwrap();
        store.append(&event_at(200, 2)).await.unwrap();

        let mut ids = Vec::new();
        store
            .for_each(&EventFilter::default(), &mut |event| {
                ids.push(event.event_id.clone());
            })
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn test_for_each_filters() {
        let store = MemoryForwardEventStore::new();
        store.append(&event_at(100, 1)).await.unwrap();
        store.append(&event_at(200, 2)).await.unwrap();

        let filter = EventFilter {
            after: Some(Utc.timestamp_opt(100, 0).unwrap()),
            ..Default::default()
        };
        let mut count = 0;
        store
            .for_each(&filter, &mut |_| count += 1)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let filter = EventFilter {
            node_public_key: Some("pk-unknown".to_string()),
            ..Default::default()
        };
        let mut count = 0;
        store
            .for_each(&filter, &mut |_| count += 1)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
