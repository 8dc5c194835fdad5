//! Peer Profiles
//!
//! Per-peer connection bookkeeping and an append-only event log
//! (created, connected, disconnected, tier changes, channel
//! rejections). Separate from the group aggregates: a profile tracks
//! one node's lifecycle, a group tracks shared volume.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{RouterError, RouterResult};
use crate::fee_tier::FeeTier;

/// A peer node's profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerProfile {
    /// Peer public key
    pub public_key: String,
    /// Fee tier last recorded for this peer
    pub routing_fee_tier: FeeTier,
    /// When the profile was created
    pub created_at: DateTime<Utc>,
    /// Last connect time
    pub last_connect: Option<DateTime<Utc>>,
    /// Last disconnect time
    pub last_disconnect: Option<DateTime<Utc>>,
}

/// Peer log event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerLogEvent {
    /// Profile created
    Created,
    /// Peer connected
    Connected,
    /// Peer disconnected
    Disconnected,
    /// Fee tier recorded
    RoutingFeeTier,
    /// Channel open rejected
    ChannelReject,
}

/// One entry in a peer's append-only log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerLogEntry {
    /// Peer public key
    pub public_key: String,
    /// Event kind
    pub event: PeerLogEvent,
    /// When the entry was written
    pub at: DateTime<Utc>,
    /// Free-form event context
    pub meta: Option<serde_json::Value>,
}

/// Peer-profile persistence trait
#[async_trait]
pub trait PeerStore: Send + Sync {
    /// Create a profile seeded at `initial_tier`; logs Created,
    /// RoutingFeeTier and Connected.
    async fn new_peer(&self, public_key: &str, initial_tier: FeeTier)
        -> RouterResult<PeerProfile>;

    /// A profile by public key.
    async fn get_peer(&self, public_key: &str) -> RouterResult<Option<PeerProfile>>;

    /// Record a connect.
    async fn peer_connected(&self, public_key: &str) -> RouterResult<()>;

    /// Record a disconnect.
    async fn peer_disconnected(&self, public_key: &str) -> RouterResult<()>;

    /// Log a rejected channel open.
    async fn channel_rejected(&self, public_key: &str, reason: &str) -> RouterResult<()>;

    /// Record a tier change on the profile.
    async fn update_fee_tier(&self, public_key: &str, tier: &FeeTier) -> RouterResult<()>;

    /// The peer's log, oldest first.
    async fn log_of(&self, public_key: &str) -> RouterResult<Vec<PeerLogEntry>>;
}

#[derive(Default)]
struct MemoryPeersInner {
    profiles: HashMap<String, PeerProfile>,
    log: Vec<PeerLogEntry>,
}

impl MemoryPeersInner {
    fn push_log(&mut self, public_key: &str, event: PeerLogEvent, meta: Option<serde_json::Value>) {
        self.log.push(PeerLogEntry {
            public_key: public_key.to_string(),
            event,
            at: Utc::now(),
            meta,
        });
    }
}

/// In-memory peer store
#[derive(Default)]
pub struct MemoryPeerStore {
    inner: RwLock<MemoryPeersInner>,
}

impl MemoryPeerStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerStore for MemoryPeerStore {
    async fn new_peer(
        &self,
        public_key: &str,
        initial_tier: FeeTier,
    ) -> RouterResult<PeerProfile> {
        let mut inner = self.inner.write().await;
        if inner.profiles.contains_key(public_key) {
            return Err(RouterError::Storage(format!(
                "peer profile already exists: {public_key}"
            )));
        }
        let profile = PeerProfile {
            public_key: public_key.to_string(),
            routing_fee_tier: initial_tier.clone(),
            created_at: Utc::now(),
            last_connect: Some(Utc::now()),
            last_disconnect: None,
        };
        inner.profiles.insert(public_key.to_string(), profile.clone());
        inner.push_log(public_key, PeerLogEvent::Created, None);
        inner.push_log(
            public_key,
            PeerLogEvent::RoutingFeeTier,
            serde_json::to_value(&initial_tier).ok(),
        );
        inner.push_log(public_key, PeerLogEvent::Connected, None);
        Ok(profile)
    }

    async fn get_peer(&self, public_key: &str) -> RouterResult<Option<PeerProfile>> {
        Ok(self.inner.read().await.profiles.get(public_key).cloned())
    }

    async fn peer_connected(&self, public_key: &str) -> RouterResult<()> {
        let mut inner = self.inner.write().await;
        let profile = inner
            .profiles
            .get_mut(public_key)
            .ok_or_else(|| RouterError::Storage(format!("unknown peer: {public_key}")))?;
        profile.last_connect = Some(Utc::now());
        inner.push_log(public_key, PeerLogEvent::Connected, None);
        Ok(())
    }

    async fn peer_disconnected(&self, public_key: &str) -> RouterResult<()> {
        let mut inner = self.inner.write().await;
        let profile = inner
            .profiles
            .get_mut(public_key)
            .ok_or_else(|| RouterError::Storage(format!("unknown peer: {public_key}")))?;
        profile.last_disconnect = Some(Utc::now());
        inner.push_log(public_key, PeerLogEvent::Disconnected, None);
        Ok(())
    }

    async fn channel_rejected(&self, public_key: &str, reason: &str) -> RouterResult<()> {
        let mut inner = self.inner.write().await;
        inner.push_log(
            public_key,
            PeerLogEvent::ChannelReject,
            Some(serde_json::json!({ "reason": reason })),
        );
        Ok(())
    }

    async fn update_fee_tier(&self, public_key: &str, tier: &FeeTier) -> RouterResult<()> {
        let mut inner = self.inner.write().await;
        let profile = inner
            .profiles
            .get_mut(public_key)
            .ok_or_else(|| RouterError::Storage(format!("unknown peer: {public_key}")))?;
        profile.routing_fee_tier = tier.clone();
        inner.push_log(
            public_key,
            PeerLogEvent::RoutingFeeTier,
            serde_json::to_value(tier).ok(),
        );
        Ok(())
    }

    async fn log_of(&self, public_key: &str) -> RouterResult<Vec<PeerLogEntry>> {
        Ok(self
            .inner
            .read()
            .await
            .log
            .iter()
            .filter(|entry| entry.public_key == public_key)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fee_tier::FeeTierTable;

    fn first_tier() -> FeeTier {
        FeeTierTable::default().first().clone()
    }

    #[tokio::test]
    async fn test_new_peer_writes_creation_log() {
        let store = MemoryPeerStore::new();
        let profile = store.new_peer("pk-a", first_tier()).await.unwrap();
        assert_eq!(profile.routing_fee_tier, first_tier());
        assert!(profile.last_connect.is_some());

        let log = store.log_of("pk-a").await.unwrap();
        let events: Vec<PeerLogEvent> = log.iter().map(|e| e.event).collect();
        assert_eq!(
            events,
            vec![
                PeerLogEvent::Created,
                PeerLogEvent::RoutingFeeTier,
                PeerLogEvent::Connected
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_disconnect_cycle() {
        let store = MemoryPeerStore::new();
        store.new_peer("pk-a", first_tier()).await.unwrap();
        store.peer_disconnected("pk-a").await.unwrap();
        store.peer_connected("pk-a").await.unwrap();

        let profile = store.get_peer("pk-a").await.unwrap().unwrap();
        assert!(profile.last_disconnect.is_some());
        assert_eq!(store.log_of("pk-a").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_channel_rejected_logs_reason() {
        let store = MemoryPeerStore::new();
        store
            .channel_rejected("pk-new", "capacity over AML limit")
            .await
            .unwrap();
        let log = store.log_of("pk-new").await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].event, PeerLogEvent::ChannelReject);
        assert_eq!(log[0].meta.as_ref().unwrap()["reason"], "capacity over AML limit");
    }

    #[tokio::test]
    async fn test_update_fee_tier() {
        let store = MemoryPeerStore::new();
        let table = FeeTierTable::default();
        store.new_peer("pk-a", table.first().clone()).await.unwrap();
        store
            .update_fee_tier("pk-a", &table.tiers()[2])
            .await
            .unwrap();

        let profile = store.get_peer("pk-a").await.unwrap().unwrap();
        assert_eq!(profile.routing_fee_tier, table.tiers()[2]);
    }
}
