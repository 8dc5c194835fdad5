//! Peer/Group Aggregate Store
//!
//! Running forwarding totals per peer group plus the group's current
//! fee tier. Groups aggregate one or more peer public keys; each key
//! belongs to at most one group. All read-modify-write mutations are
//! serialized behind a single async mutex, so concurrent deltas on the
//! same group never lose updates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::{RouterError, RouterResult};
use crate::fee_tier::FeeTier;

/// A peer group: one aggregate volume counter and fee tier shared by
/// one or more peer public keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerGroup {
    /// Opaque group id
    pub id: String,
    /// Member peer public keys
    pub nodes: Vec<String>,
    /// Current fee tier, mutated only by the tier manager
    pub fee_tier: FeeTier,
    /// Total sats forwarded through members
    pub total_sats_fwd: u64,
    /// Total fiat volume forwarded through members
    pub total_usd_fwd: Decimal,
    /// Total fee sats earned from members
    pub total_sats_fee: u64,
    /// Total fiat fees earned from members
    pub total_usd_fee: Decimal,
    /// When the group was created
    pub created_at: DateTime<Utc>,
}

impl PeerGroup {
    /// Whether `public_key` is a member.
    pub fn contains(&self, public_key: &str) -> bool {
        self.nodes.iter().any(|pk| pk == public_key)
    }
}

/// Additive update to a group's running totals
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupDelta {
    /// Sats forwarded
    pub sats_fwd: u64,
    /// Fiat volume forwarded
    pub usd_fwd: Decimal,
    /// Fee sats earned
    pub sats_fee: u64,
    /// Fiat fees earned
    pub usd_fee: Decimal,
}

/// Peer-group persistence trait
#[async_trait]
pub trait PeerGroupStore: Send + Sync {
    /// The group owning `public_key`, if any.
    async fn group_of(&self, public_key: &str) -> RouterResult<Option<PeerGroup>>;

    /// A group by id.
    async fn get(&self, group_id: &str) -> RouterResult<Option<PeerGroup>>;

    /// Create a group over `nodes` seeded at `initial_tier`.
    /// `DuplicateMembership` if any key is already grouped.
    async fn create_group(
        &self,
        nodes: &[String],
        initial_tier: FeeTier,
    ) -> RouterResult<PeerGroup>;

    /// Apply an additive delta; returns the post-update snapshot.
    /// Atomic with respect to concurrent deltas on the same group.
    async fn apply_delta(&self, group_id: &str, delta: &GroupDelta) -> RouterResult<PeerGroup>;

    /// Overwrite the group's current tier.
    async fn set_tier(&self, group_id: &str, tier: &FeeTier) -> RouterResult<()>;

    /// All groups, for reconcile passes.
    async fn all_groups(&self) -> RouterResult<Vec<PeerGroup>>;
}

#[derive(Default)]
struct MemoryGroupsInner {
    groups: HashMap<String, PeerGroup>,
    member_index: HashMap<String, String>,
    next_seq: u64,
}

/// In-memory peer-group store
#[derive(Default)]
pub struct MemoryPeerGroupStore {
    inner: Mutex<MemoryGroupsInner>,
}

impl MemoryPeerGroupStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerGroupStore for MemoryPeerGroupStore {
    async fn group_of(&self, public_key: &str) -> RouterResult<Option<PeerGroup>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .member_index
            .get(public_key)
            .and_then(|id| inner.groups.get(id))
            .cloned())
    }

    async fn get(&self, group_id: &str) -> RouterResult<Option<PeerGroup>> {
        let inner = self.inner.lock().await;
        Ok(inner.groups.get(group_id).cloned())
    }

    async fn create_group(
        &self,
        nodes: &[String],
        initial_tier: FeeTier,
    ) -> RouterResult<PeerGroup> {
        let mut inner = self.inner.lock().await;
        for pk in nodes {
            if inner.member_index.contains_key(pk) {
                return Err(RouterError::DuplicateMembership(pk.clone()));
            }
        }
        inner.next_seq += 1;
        let group = PeerGroup {
            id: format!("group-{:06}", inner.next_seq),
            nodes: nodes.to_vec(),
            fee_tier: initial_tier,
            total_sats_fwd: 0,
            total_usd_fwd: Decimal::ZERO,
            total_sats_fee: 0,
            total_usd_fee: Decimal::ZERO,
            created_at: Utc::now(),
        };
        for pk in nodes {
            inner.member_index.insert(pk.clone(), group.id.clone());
        }
        inner.groups.insert(group.id.clone(), group.clone());
        Ok(group)
    }

    async fn apply_delta(&self, group_id: &str, delta: &GroupDelta) -> RouterResult<PeerGroup> {
        let mut inner = self.inner.lock().await;
        let group = inner
            .groups
            .get_mut(group_id)
            .ok_or_else(|| RouterError::GroupNotFound(group_id.to_string()))?;
        group.total_sats_fwd = group.total_sats_fwd.saturating_add(delta.sats_fwd);
        group.total_usd_fwd += delta.usd_fwd;
        group.total_sats_fee = group.total_sats_fee.saturating_add(delta.sats_fee);
        group.total_usd_fee += delta.usd_fee;
        Ok(group.clone())
    }

    async fn set_tier(&self, group_id: &str, tier: &FeeTier) -> RouterResult<()> {
        let mut inner = self.inner.lock().await;
        let group = inner
            .groups
            .get_mut(group_id)
            .ok_or_else(|| RouterError::GroupNotFound(group_id.to_string()))?;
        group.fee_tier = tier.clone();
        Ok(())
    }

    async fn all_groups(&self) -> RouterResult<Vec<PeerGroup>> {
        let inner = self.inner.lock().await;
        let mut groups: Vec<PeerGroup> = inner.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(groups)
    }
}
