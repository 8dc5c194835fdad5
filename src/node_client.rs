//! Lightning Node Client
//!
//! Narrow interface over the external Lightning node RPC: channel
//! listing, closed-channel lookup, cursor-paginated forward history
//! and fee-rate mutation. The hosting framework owns the actual
//! transport; the core only sees this trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{RouterError, RouterResult};

/// An open channel as reported by the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel id
    pub id: String,
    /// Remote peer public key
    pub partner_public_key: String,
    /// Total capacity in sats
    pub capacity: u64,
    /// Our balance in sats
    pub local_balance: u64,
    /// Funding transaction id
    pub transaction_id: String,
    /// Funding transaction output index
    pub transaction_vout: u32,
    /// Total sats sent over the channel
    pub sent: u64,
    /// Total sats received over the channel
    pub received: u64,
    /// Number of past channel states
    pub past_state_count: u32,
}

/// A node known to the local daemon (reporting scope for forward sync)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node public key
    pub public_key: String,
    /// Node alias
    pub alias: String,
}

/// Remote node of a closed channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedChannelNode {
    /// Public key of the channel's remote peer
    pub public_key: String,
}

/// A completed forward as returned by the node's history API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawForward {
    /// Inbound channel id
    pub incoming_channel: String,
    /// Outbound channel id
    pub outgoing_channel: String,
    /// Forwarded amount in sats
    pub tokens: u64,
    /// Fee earned in sats
    pub fee: u64,
    /// When the forward completed
    pub created_at: DateTime<Utc>,
}

/// Query for one page of forward history
#[derive(Debug, Clone, Default)]
pub struct ForwardsQuery {
    /// Page size
    pub limit: usize,
    /// Opaque continuation token; `None` means start of range
    pub token: Option<String>,
    /// Only forwards strictly after this instant
    pub after: Option<DateTime<Utc>>,
    /// Only forwards at or before this instant
    pub before: Option<DateTime<Utc>>,
}

/// One page of forward history
#[derive(Debug, Clone)]
pub struct ForwardsPage {
    /// Forwards in this page, oldest first
    pub forwards: Vec<RawForward>,
    /// Continuation token; `None` means the range is drained
    pub next: Option<String>,
}

/// Fee-rate mutation for a single channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingFeeUpdate {
    /// Funding transaction id of the channel
    pub transaction_id: String,
    /// Funding transaction output index
    pub transaction_vout: u32,
    /// New outbound fee rate in ppm
    pub fee_rate_ppm: u32,
}

/// Lightning node RPC trait
///
/// Implementations: the hosting worker's RPC bridge in production, or
/// [`MockLightningNode`] in tests.
#[async_trait]
pub trait LightningNodeClient: Send + Sync {
    /// Full snapshot of currently open channels.
    async fn list_channels(&self) -> RouterResult<Vec<Channel>>;

    /// Remote node of a channel that is no longer open.
    async fn get_node_of_closed_channel(&self, channel_id: &str)
        -> RouterResult<ClosedChannelNode>;

    /// Nodes whose forward history this daemon reports.
    async fn list_nodes(&self) -> RouterResult<Vec<NodeInfo>>;

    /// One page of forward history for `node_public_key`.
    async fn get_forwards(
        &self,
        node_public_key: &str,
        query: &ForwardsQuery,
    ) -> RouterResult<ForwardsPage>;

    /// Mutate one channel's outbound fee rate.
    async fn update_routing_fee(&self, update: &RoutingFeeUpdate) -> RouterResult<()>;
}

// ============================================================================
// Mock Client for Testing
// ============================================================================

#[derive(Default)]
struct MockNodeState {
    channels: Vec<Channel>,
    closed_channels: std::collections::HashMap<String, String>,
    nodes: Vec<NodeInfo>,
    forwards: Vec<RawForward>,
    fee_updates: Vec<RoutingFeeUpdate>,
}

/// In-memory Lightning node for testing
///
/// Forward pagination mirrors the real API: an opaque token carries
/// the read offset, and pages come back oldest first.
#[derive(Default)]
pub struct MockLightningNode {
    state: std::sync::RwLock<MockNodeState>,
    fail_forwards: AtomicBool,
    fail_fee_updates: AtomicBool,
}

impl MockLightningNode {
    /// Create an empty mock node.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the open-channel set.
    pub fn set_channels(&self, channels: Vec<Channel>) {
        self.state.write().expect("mock lock poisoned").channels = channels;
    }

    /// Register a closed channel's remote peer.
    pub fn add_closed_channel(&self, channel_id: &str, public_key: &str) {
        self.state
            .write()
            .expect("mock lock poisoned")
            .closed_channels
            .insert(channel_id.to_string(), public_key.to_string());
    }

    /// Replace the reporting node set.
    pub fn set_nodes(&self, nodes: Vec<NodeInfo>) {
        self.state.write().expect("mock lock poisoned").nodes = nodes;
    }

    /// Append a forward to the history.
    pub fn push_forward(&self, forward: RawForward) {
        let mut state = self.state.write().expect("mock lock poisoned");
        state.forwards.push(forward);
        state.forwards.sort_by_key(|f| f.created_at);
    }

    /// Fee updates received so far.
    pub fn fee_updates(&self) -> Vec<RoutingFeeUpdate> {
        self.state
            .read()
            .expect("mock lock poisoned")
            .fee_updates
            .clone()
    }

    /// Make `get_forwards` fail until cleared.
    pub fn set_fail_forwards(&self, fail: bool) {
        self.fail_forwards.store(fail, Ordering::SeqCst);
    }

    /// Make `update_routing_fee` fail until cleared.
    pub fn set_fail_fee_updates(&self, fail: bool) {
        self.fail_fee_updates.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl LightningNodeClient for MockLightningNode {
    async fn list_channels(&self) -> RouterResult<Vec<Channel>> {
        Ok(self.state.read().expect("mock lock poisoned").channels.clone())
    }

    async fn get_node_of_closed_channel(
        &self,
        channel_id: &str,
    ) -> RouterResult<ClosedChannelNode> {
        let state = self.state.read().expect("mock lock poisoned");
        state
            .closed_channels
            .get(channel_id)
            .map(|pk| ClosedChannelNode {
                public_key: pk.clone(),
            })
            .ok_or_else(|| RouterError::UnknownChannel(channel_id.to_string()))
    }

    async fn list_nodes(&self) -> RouterResult<Vec<NodeInfo>> {
        Ok(self.state.read().expect("mock lock poisoned").nodes.clone())
    }

    async fn get_forwards(
        &self,
        _node_public_key: &str,
        query: &ForwardsQuery,
    ) -> RouterResult<ForwardsPage> {
        if self.fail_forwards.load(Ordering::SeqCst) {
            return Err(RouterError::NodeUnavailable(
                "mock forwards endpoint down".to_string(),
            ));
        }
        let state = self.state.read().expect("mock lock poisoned");
        let matching: Vec<RawForward> = state
            .forwards
            .iter()
            .filter(|f| query.after.map_or(true, |after| f.created_at > after))
            .filter(|f| query.before.map_or(true, |before| f.created_at <= before))
            .cloned()
            .collect();

        let offset: usize = query
            .token
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);
        let limit = if query.limit == 0 { 100 } else { query.limit };
        let page: Vec<RawForward> = matching.iter().skip(offset).take(limit).cloned().collect();
        let next_offset = offset + page.len();
        let next = if next_offset < matching.len() {
            Some(next_offset.to_string())
        } else {
            None
        };
        Ok(ForwardsPage {
            forwards: page,
            next,
        })
    }

    async fn update_routing_fee(&self, update: &RoutingFeeUpdate) -> RouterResult<()> {
        if self.fail_fee_updates.load(Ordering::SeqCst) {
            return Err(RouterError::NodeUnavailable(
                "mock fee-update endpoint down".to_string(),
            ));
        }
        self.state
            .write()
            .expect("mock lock poisoned")
            .fee_updates
            .push(update.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn forward_at(secs: i64) -> RawForward {
        RawForward {
            incoming_channel: "chan-in".to_string(),
            outgoing_channel: "chan-out".to_string(),
            tokens: 1000,
            fee: 1,
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_mock_forward_pagination() {
        let node = MockLightningNode::new();
        for i in 0..5 {
            node.push_forward(forward_at(1_700_000_000 + i));
        }

        let mut query = ForwardsQuery {
            limit: 2,
            ..Default::default()
        };
        let mut seen = 0;
        loop {
            let page = node.get_forwards("pk", &query).await.unwrap();
            seen += page.forwards.len();
            match page.next {
                Some(token) => query.token = Some(token),
                None => break,
            }
        }
        assert_eq!(seen, 5);
    }

    #[tokio::test]
    async fn test_mock_forward_window() {
        let node = MockLightningNode::new();
        node.push_forward(forward_at(100));
        node.push_forward(forward_at(200));
        node.push_forward(forward_at(300));

        let query = ForwardsQuery {
            limit: 10,
            after: Some(Utc.timestamp_opt(100, 0).unwrap()),
            before: Some(Utc.timestamp_opt(200, 0).unwrap()),
            ..Default::default()
        };
        let page = node.get_forwards("pk", &query).await.unwrap();
        assert_eq!(page.forwards.len(), 1);
        assert_eq!(page.forwards[0].created_at.timestamp(), 200);
    }

    #[tokio::test]
    async fn test_mock_closed_channel_lookup() {
        let node = MockLightningNode::new();
        node.add_closed_channel("chan-gone", "pk-remote");

        let resolved = node.get_node_of_closed_channel("chan-gone").await.unwrap();
        assert_eq!(resolved.public_key, "pk-remote");
        assert!(node.get_node_of_closed_channel("chan-never").await.is_err());
    }

    #[tokio::test]
    async fn test_mock_fail_modes() {
        let node = MockLightningNode::new();
        node.set_fail_forwards(true);
        assert!(node
            .get_forwards("pk", &ForwardsQuery::default())
            .await
            .is_err());

        node.set_fail_fee_updates(true);
        let update = RoutingFeeUpdate {
            transaction_id: "tx".to_string(),
            transaction_vout: 0,
            fee_rate_ppm: 10_000,
        };
        assert!(node.update_routing_fee(&update).await.is_err());
        node.set_fail_fee_updates(false);
        assert!(node.update_routing_fee(&update).await.is_ok());
        assert_eq!(node.fee_updates().len(), 1);
    }
}
