//! Channel Directory
//!
//! Maintains the current open-channel set plus channel→peer and
//! peer→channels indexes, refreshed from the node on a fixed timer.
//! The index is replaced wholesale on every refresh (the node returns
//! the full channel set), so readers always observe a fully-formed
//! snapshot. Channels absent from the latest refresh drop out of the
//! live index but remain resolvable through the node's closed-channel
//! lookup.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RouterError, RouterResult};
use crate::node_client::{Channel, LightningNodeClient};

#[derive(Default)]
struct ChannelIndex {
    by_id: HashMap<String, Channel>,
    by_peer: HashMap<String, Vec<Channel>>,
    refreshed_at: Option<DateTime<Utc>>,
}

/// Live view of the node's channels
pub struct ChannelDirectory {
    client: Arc<dyn LightningNodeClient>,
    index: RwLock<ChannelIndex>,
    refreshing: AtomicBool,
    update_tx: watch::Sender<u64>,
}

impl ChannelDirectory {
    /// Create a directory with an empty index; call [`refresh`] or
    /// [`spawn_refresh_task`] to populate it.
    ///
    /// [`refresh`]: ChannelDirectory::refresh
    /// [`spawn_refresh_task`]: ChannelDirectory::spawn_refresh_task
    pub fn new(client: Arc<dyn LightningNodeClient>) -> Self {
        let (update_tx, _) = watch::channel(0);
        Self {
            client,
            index: RwLock::new(ChannelIndex::default()),
            refreshing: AtomicBool::new(false),
            update_tx,
        }
    }

    /// Subscribe to "channels updated" notifications. The value is a
    /// refresh counter; every completed refresh bumps it.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.update_tx.subscribe()
    }

    /// Fetch the full channel list and rebuild both indexes.
    ///
    /// At most one refresh runs at a time; a refresh triggered while
    /// another is in flight is skipped and returns `Ok(false)`.
    pub async fn refresh(&self) -> RouterResult<bool> {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("channel refresh already in flight, skipping");
            return Ok(false);
        }
        let result = self.rebuild_index().await;
        self.refreshing.store(false, Ordering::SeqCst);
        result?;
        Ok(true)
    }

    async fn rebuild_index(&self) -> RouterResult<()> {
        let channels = self.client.list_channels().await?;

        let mut by_id = HashMap::with_capacity(channels.len());
        let mut by_peer: HashMap<String, Vec<Channel>> = HashMap::new();
        for channel in channels {
            by_peer
                .entry(channel.partner_public_key.clone())
                .or_default()
                .push(channel.clone());
            by_id.insert(channel.id.clone(), channel);
        }
        let count = by_id.len();

        {
            let mut index = self.index.write().await;
            index.by_id = by_id;
            index.by_peer = by_peer;
            index.refreshed_at = Some(Utc::now());
        }
        debug!(count, "channel index rebuilt");
        self.update_tx.send_modify(|version| *version = version.wrapping_add(1));
        Ok(())
    }

    /// Run an initial refresh, then refresh on a fixed timer. Refresh
    /// work runs on its own task; the timer never blocks.
    pub fn spawn_refresh_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let directory = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            info!(interval_secs = interval.as_secs(), "channel refresh task started");
            loop {
                ticker.tick().await;
                if let Err(e) = directory.refresh().await {
                    warn!(error = %e, "channel refresh failed");
                }
            }
        })
    }

    /// Resolve a channel id to its remote peer: live index first, then
    /// the node's closed-channel lookup.
    pub async fn resolve_peer_of_channel(&self, channel_id: &str) -> RouterResult<String> {
        {
            let index = self.index.read().await;
            if let Some(channel) = index.by_id.get(channel_id) {
                return Ok(channel.partner_public_key.clone());
            }
        }
        match self.client.get_node_of_closed_channel(channel_id).await {
            Ok(node) => Ok(node.public_key),
            Err(RouterError::UnknownChannel(_)) => {
                Err(RouterError::UnknownChannel(channel_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Live channels of a peer; empty when the peer has none open.
    pub async fn channels_of_peer(&self, public_key: &str) -> Vec<Channel> {
        self.index
            .read()
            .await
            .by_peer
            .get(public_key)
            .cloned()
            .unwrap_or_default()
    }

    /// All known partner public keys, de-duplicated.
    pub async fn all_peers(&self) -> Vec<String> {
        let index = self.index.read().await;
        let mut peers: Vec<String> = index.by_peer.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// When the index was last rebuilt, if ever.
    pub async fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.index.read().await.refreshed_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_client::MockLightningNode;

    fn channel(id: &str, peer: &str) -> Channel {
        Channel {
            id: id.to_string(),
            partner_public_key: peer.to_string(),
            capacity: 1_000_000,
            local_balance: 500_000,
            transaction_id: format!("tx-{id}"),
            transaction_vout: 0,
            sent: 0,
            received: 0,
            past_state_count: 0,
        }
    }

    fn directory_with(channels: Vec<Channel>) -> (Arc<MockLightningNode>, ChannelDirectory) {
        let node = Arc::new(MockLightningNode::new());
        node.set_channels(channels);
        let directory = ChannelDirectory::new(Arc::clone(&node) as Arc<dyn LightningNodeClient>);
        (node, directory)
    }

    #[tokio::test]
    async fn test_refresh_builds_indexes() {
        let (_, directory) = directory_with(vec![
            channel("chan-1", "pk-a"),
            channel("chan-2", "pk-a"),
            channel("chan-3", "pk-b"),
        ]);
        assert!(directory.refresh().await.unwrap());

        assert_eq!(
            directory.resolve_peer_of_channel("chan-1").await.unwrap(),
            "pk-a"
        );
        assert_eq!(directory.channels_of_peer("pk-a").await.len(), 2);
        assert_eq!(directory.all_peers().await, vec!["pk-a", "pk-b"]);
        assert!(directory.refreshed_at().await.is_some());
    }

    #[tokio::test]
    async fn test_refresh_replaces_snapshot() {
        let (node, directory) = directory_with(vec![channel("chan-1", "pk-a")]);
        directory.refresh().await.unwrap();

        node.set_channels(vec![channel("chan-2", "pk-b")]);
        directory.refresh().await.unwrap();

        assert!(directory.channels_of_peer("pk-a").await.is_empty());
        assert_eq!(directory.all_peers().await, vec!["pk-b"]);
    }

    #[tokio::test]
    async fn test_closed_channel_fallback() {
        let (node, directory) = directory_with(vec![channel("chan-1", "pk-a")]);
        directory.refresh().await.unwrap();
        node.add_closed_channel("chan-old", "pk-gone");

        assert_eq!(
            directory.resolve_peer_of_channel("chan-old").await.unwrap(),
            "pk-gone"
        );
        let result = directory.resolve_peer_of_channel("chan-never").await;
        assert!(matches!(result, Err(RouterError::UnknownChannel(_))));
    }

    #[tokio::test]
    async fn test_refresh_notifies_subscribers() {
        let (_, directory) = directory_with(vec![channel("chan-1", "pk-a")]);
        let mut rx = directory.subscribe();
        let initial = *rx.borrow();

        directory.refresh().await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), initial + 1);
    }
}
