//! Tier Manager
//!
//! Drives periodic synchronization of forward events from the node:
//! pages through new forwards, prices them in fiat, deduplicates and
//! persists each event, updates the owning groups' aggregates,
//! reclassifies tiers and propagates fee-rate changes to the node's
//! channels when a tier boundary is crossed.
//!
//! One cycle runs at a time; a trigger arriving while a cycle is in
//! flight is dropped, not queued. The next periodic tick re-covers
//! anything missed because unsynced forwards stay on the remote side
//! and event ids deduplicate overlapping windows.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::channels::ChannelDirectory;
use crate::config::RouterConfig;
use crate::error::{RouterError, RouterResult};
use crate::event_store::{AppendOutcome, EventFilter, ForwardEvent, ForwardEventStore};
use crate::fee_tier::{FeeTier, FeeTierTable};
use crate::group_store::{GroupDelta, PeerGroup, PeerGroupStore};
use crate::node_client::{ForwardsQuery, LightningNodeClient, RawForward, RoutingFeeUpdate};
use crate::notifier::{AlertLevel, Notifier};
use crate::rate::{sats_to_btc, RateSource};

/// Summary of one sync cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// When the cycle started
    pub started_at: DateTime<Utc>,
    /// When the cycle finished
    pub finished_at: Option<DateTime<Utc>>,
    /// Pages fetched from the forwards API (including retries)
    pub pages_fetched: u64,
    /// New events persisted
    pub events_inserted: u64,
    /// Events already known (overlapping window)
    pub events_duplicate: u64,
    /// Events skipped (unresolvable channel)
    pub events_skipped: u64,
    /// Tier changes propagated and persisted
    pub tier_changes: u64,
    /// Pages abandoned after bounded retries
    pub failed_pages: u64,
    /// Fee propagations that failed (tier left unchanged)
    pub failed_propagations: u64,
}

impl CycleReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            pages_fetched: 0,
            events_inserted: 0,
            events_duplicate: 0,
            events_skipped: 0,
            tier_changes: 0,
            failed_pages: 0,
            failed_propagations: 0,
        }
    }
}

/// Outcome of a sync trigger
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// The cycle ran to completion
    Completed(CycleReport),
    /// Another cycle was already in flight; this trigger was dropped
    AlreadyRunning,
}

/// A group whose stored totals disagree with the event history
#[derive(Debug, Clone, PartialEq)]
pub struct GroupDiscrepancy {
    /// Group id
    pub group_id: String,
    /// Stored fiat volume
    pub stored_usd_fwd: Decimal,
    /// Fiat volume recomputed from events
    pub computed_usd_fwd: Decimal,
    /// Stored sats volume
    pub stored_sats_fwd: u64,
    /// Sats volume recomputed from events
    pub computed_sats_fwd: u64,
}

/// Summary of a reconcile pass
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Groups examined
    pub groups_checked: u64,
    /// Groups whose totals disagree with the event history
    pub discrepancies: Vec<GroupDiscrepancy>,
    /// Stale tiers repaired (propagated and persisted)
    pub tiers_repaired: u64,
}

#[derive(Default, Clone)]
struct NodeTotals {
    sats_fwd: u64,
    usd_fwd: Decimal,
    sats_fee: u64,
    usd_fee: Decimal,
}

/// A forward resolved and priced but not yet persisted
struct PreparedForward {
    event: ForwardEvent,
    delta: GroupDelta,
}

/// Fee-tier orchestrator
pub struct TierManager {
    config: RouterConfig,
    tiers: FeeTierTable,
    directory: Arc<ChannelDirectory>,
    node: Arc<dyn LightningNodeClient>,
    events: Arc<dyn ForwardEventStore>,
    groups: Arc<dyn PeerGroupStore>,
    rates: Arc<dyn RateSource>,
    notifier: Arc<dyn Notifier>,
    syncing: AtomicBool,
    // Window start of a cycle that abandoned a page, carried forward so
    // the next cycle re-fetches from there instead of from `latest()`.
    // Outer None: no pending retry; inner None: the window was genesis.
    retry_floor: Mutex<Option<Option<DateTime<Utc>>>>,
}

impl TierManager {
    /// Wire up a manager over its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RouterConfig,
        tiers: FeeTierTable,
        directory: Arc<ChannelDirectory>,
        node: Arc<dyn LightningNodeClient>,
        events: Arc<dyn ForwardEventStore>,
        groups: Arc<dyn PeerGroupStore>,
        rates: Arc<dyn RateSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            tiers,
            directory,
            node,
            events,
            groups,
            rates,
            notifier,
            syncing: AtomicBool::new(false),
            retry_floor: Mutex::new(None),
        }
    }

    /// The tier table in use.
    pub fn tiers(&self) -> &FeeTierTable {
        &self.tiers
    }

    /// Run one sync cycle: ingest new forwards for every reporting
    /// node and reclassify affected groups.
    ///
    /// A concurrent trigger is a no-op (`CycleOutcome::AlreadyRunning`).
    /// Structural errors abort the cycle without advancing the resume
    /// cursor and are alerted.
    pub async fn sync_forward_events(&self) -> RouterResult<CycleOutcome> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync cycle already in flight, dropping trigger");
            return Ok(CycleOutcome::AlreadyRunning);
        }
        let result = self.run_cycle().await;
        self.syncing.store(false, Ordering::SeqCst);
        match result {
            Ok(report) => {
                info!(
                    inserted = report.events_inserted,
                    duplicate = report.events_duplicate,
                    skipped = report.events_skipped,
                    tier_changes = report.tier_changes,
                    failed_pages = report.failed_pages,
                    "sync cycle complete"
                );
                Ok(CycleOutcome::Completed(report))
            }
            Err(e) => {
                error!(error = %e, "sync cycle aborted");
                self.notifier
                    .alert(
                        AlertLevel::Error,
                        "router",
                        &format!("Forward sync cycle aborted: {e}"),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn run_cycle(&self) -> RouterResult<CycleReport> {
        let mut report = CycleReport::new();

        // Resume one gap past the latest stored event so the remote
        // range excludes what is already accounted for; overlap is
        // harmless because event ids deduplicate.
        let computed = match self.events.latest().await? {
            Some(latest) => Some(
                latest.routed_at
                    + chrono::Duration::from_std(self.config.resume_gap)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
            ),
            None => None,
        };
        // A window abandoned by an earlier cycle takes precedence: its
        // unpriced events may sit inside the resume gap, where a
        // `latest()`-derived cursor would never fetch them again.
        let after = match self.retry_floor.lock().await.take() {
            Some(window_start) => window_start,
            None => computed,
        };
        let before = Utc::now();

        let nodes = self.list_nodes_with_retry().await?;
        for node in &nodes {
            self.sync_node(&node.public_key, after, before, &mut report)
                .await?;
        }
        if report.failed_pages > 0 {
            *self.retry_floor.lock().await = Some(after);
        }

        // Re-attempt any tier left stale by a failed propagation, even
        // when no new traffic settled on the group this cycle.
        for group in self.groups.all_groups().await? {
            if self.repair_group_tier(&group).await? {
                report.tier_changes += 1;
            }
        }

        report.finished_at = Some(Utc::now());
        Ok(report)
    }

    async fn list_nodes_with_retry(&self) -> RouterResult<Vec<crate::node_client::NodeInfo>> {
        let mut attempt = 0u32;
        loop {
            match self.node.list_nodes().await {
                Ok(nodes) => return Ok(nodes),
                Err(e) if e.is_transient() && attempt < self.config.retry.max_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "node listing failed, retrying");
                    tokio::time::sleep(self.config.retry.backoff_for_attempt(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drain one reporting node's page loop. A page that keeps failing
    /// after bounded retries is abandoned without advancing the
    /// cursor; the next cycle covers the same window again.
    async fn sync_node(
        &self,
        node_public_key: &str,
        after: Option<DateTime<Utc>>,
        before: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> RouterResult<()> {
        let mut token: Option<String> = None;
        loop {
            let mut attempt = 0u32;
            let outcome = loop {
                match self
                    .process_page(node_public_key, &token, after, before, report)
                    .await
                {
                    Ok(next) => break Ok(next),
                    Err(e) if e.is_transient() && attempt < self.config.retry.max_retries => {
                        attempt += 1;
                        warn!(
                            node = node_public_key,
                            attempt,
                            error = %e,
                            "forwards page failed, retrying"
                        );
                        tokio::time::sleep(self.config.retry.backoff_for_attempt(attempt)).await;
                    }
                    Err(e) => break Err(e),
                }
            };
            match outcome {
                Ok(Some(next)) => token = Some(next),
                Ok(None) => return Ok(()),
                Err(e) if e.is_transient() => {
                    report.failed_pages += 1;
                    warn!(
                        node = node_public_key,
                        error = %e,
                        "forwards page abandoned, deferring to next cycle"
                    );
                    self.notifier
                        .alert(
                            AlertLevel::Warning,
                            "router",
                            &format!("Forwards page failed for node {node_public_key}: {e}"),
                        )
                        .await;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn process_page(
        &self,
        node_public_key: &str,
        token: &Option<String>,
        after: Option<DateTime<Utc>>,
        before: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> RouterResult<Option<String>> {
        let query = ForwardsQuery {
            limit: self.config.forwards_page_limit,
            token: token.clone(),
            after,
            before: Some(before),
        };
        let page = self.node.get_forwards(node_public_key, &query).await?;
        report.pages_fetched += 1;

        // Price the whole page before persisting anything: an event
        // appended ahead of a failed rate lookup would advance the
        // resume point past the unpriced remainder.
        let mut prepared = Vec::with_capacity(page.forwards.len());
        for forward in &page.forwards {
            if let Some(p) = self
                .prepare_forward(node_public_key, forward, report)
                .await?
            {
                prepared.push(p);
            }
        }
        for p in &prepared {
            match self.events.append(&p.event).await? {
                AppendOutcome::AlreadyExists => {
                    report.events_duplicate += 1;
                    continue;
                }
                AppendOutcome::Inserted => report.events_inserted += 1,
            }
            self.settle_side(&p.event.out_chan_node, &p.delta, report)
                .await?;
            self.settle_side(&p.event.in_chan_node, &p.delta, report)
                .await?;
        }
        Ok(page.next)
    }

    /// Resolve both peers and price the forward; `None` means the
    /// event is skipped (unresolvable channel).
    async fn prepare_forward(
        &self,
        node_public_key: &str,
        forward: &RawForward,
        report: &mut CycleReport,
    ) -> RouterResult<Option<PreparedForward>> {
        let in_node = match self
            .directory
            .resolve_peer_of_channel(&forward.incoming_channel)
            .await
        {
            Ok(pk) => pk,
            Err(RouterError::UnknownChannel(id)) => {
                warn!(channel = %id, "inbound channel unresolvable, skipping event");
                report.events_skipped += 1;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let out_node = match self
            .directory
            .resolve_peer_of_channel(&forward.outgoing_channel)
            .await
        {
            Ok(pk) => pk,
            Err(RouterError::UnknownChannel(id)) => {
                warn!(channel = %id, "outbound channel unresolvable, skipping event");
                report.events_skipped += 1;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let rate_at = forward.created_at
            - chrono::Duration::from_std(self.config.rate_lookup_offset)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let rate = self.rates.fiat_rate(Some(rate_at)).await?;
        let usd_amount = sats_to_btc(forward.tokens) * rate.price;
        let usd_fee = sats_to_btc(forward.fee) * rate.price;

        let event = ForwardEvent {
            event_id: ForwardEvent::compute_id(
                &in_node,
                &out_node,
                forward.created_at,
                forward.tokens,
            ),
            node_public_key: node_public_key.to_string(),
            in_chan: forward.incoming_channel.clone(),
            in_chan_node: in_node.clone(),
            out_chan: forward.outgoing_channel.clone(),
            out_chan_node: out_node.clone(),
            amount_sats: forward.tokens,
            fee_sats: forward.fee,
            usd_amount,
            usd_fee,
            routed_at: forward.created_at,
            created_at: Utc::now(),
        };
        let delta = GroupDelta {
            sats_fwd: forward.tokens,
            usd_fwd: usd_amount,
            sats_fee: forward.fee,
            usd_fee,
        };
        Ok(Some(PreparedForward { event, delta }))
    }

    /// Credit one side of a forward to its owning group and
    /// reclassify. The fee propagation and tier write happen as one
    /// logical unit: a failed propagation leaves the stored tier
    /// untouched so the divergence is retried later.
    async fn settle_side(
        &self,
        public_key: &str,
        delta: &GroupDelta,
        report: &mut CycleReport,
    ) -> RouterResult<()> {
        let group = match self.groups.group_of(public_key).await? {
            Some(group) => group,
            None => {
                let group = self
                    .groups
                    .create_group(&[public_key.to_string()], self.tiers.first().clone())
                    .await?;
                debug!(group_id = %group.id, peer = public_key, "created peer group");
                group
            }
        };
        let updated = self.groups.apply_delta(&group.id, delta).await?;

        let new_tier = self.tiers.classify(updated.total_usd_fwd)?.clone();
        if new_tier == updated.fee_tier {
            return Ok(());
        }
        if updated.nodes.iter().any(|pk| self.config.is_whitelisted(pk)) {
            debug!(group_id = %updated.id, "tier change suppressed for whitelisted group");
            return Ok(());
        }

        match self.propagate_fee(&new_tier, &updated).await {
            Ok(()) => {
                self.groups.set_tier(&updated.id, &new_tier).await?;
                report.tier_changes += 1;
                info!(
                    group_id = %updated.id,
                    tier_index = ?self.tiers.index_of(&new_tier),
                    total_usd_fwd = %updated.total_usd_fwd,
                    "fee tier changed"
                );
                self.notifier
                    .alert(
                        AlertLevel::Info,
                        "channel_tier",
                        &format!("Channel tier changed for node {}", updated.nodes.join(",")),
                    )
                    .await;
            }
            Err(e) => {
                report.failed_propagations += 1;
                error!(group_id = %updated.id, error = %e, "fee propagation failed, keeping stored tier");
                self.notifier
                    .alert(
                        AlertLevel::Error,
                        "channel_tier",
                        &format!("Fee propagation failed for group {}: {e}", updated.id),
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Push `tier`'s ppm rate to every live channel of every node in
    /// the group.
    async fn propagate_fee(&self, tier: &FeeTier, group: &PeerGroup) -> RouterResult<()> {
        let fee_rate_ppm = tier.ppm_fee_rate().ok_or_else(|| {
            RouterError::InvalidTierTable(format!(
                "fee percent {} not representable in ppm",
                tier.fee_percent
            ))
        })?;
        for public_key in &group.nodes {
            for channel in self.directory.channels_of_peer(public_key).await {
                let update = RoutingFeeUpdate {
                    transaction_id: channel.transaction_id.clone(),
                    transaction_vout: channel.transaction_vout,
                    fee_rate_ppm,
                };
                self.node
                    .update_routing_fee(&update)
                    .await
                    .map_err(|e| RouterError::FeePropagation {
                        group_id: group.id.clone(),
                        reason: e.to_string(),
                    })?;
            }
        }
        Ok(())
    }

    /// Re-propagate and persist the classified tier when the stored
    /// one is stale (a propagation failed earlier); returns whether a
    /// repair happened. Whitelisted groups are left alone.
    async fn repair_group_tier(&self, group: &PeerGroup) -> RouterResult<bool> {
        let expected = self.tiers.classify(group.total_usd_fwd)?.clone();
        if expected == group.fee_tier
            || group.nodes.iter().any(|pk| self.config.is_whitelisted(pk))
        {
            return Ok(false);
        }
        match self.propagate_fee(&expected, group).await {
            Ok(()) => {
                self.groups.set_tier(&group.id, &expected).await?;
                info!(group_id = %group.id, "stale fee tier repaired");
                Ok(true)
            }
            Err(e) => {
                error!(group_id = %group.id, error = %e, "tier repair propagation failed");
                self.notifier
                    .alert(
                        AlertLevel::Error,
                        "channel_tier",
                        &format!("Tier repair failed for group {}: {e}", group.id),
                    )
                    .await;
                Ok(false)
            }
        }
    }

    /// Walk the whole event history, recompute per-group totals and
    /// compare them with the stored aggregates; repair any stored tier
    /// that no longer matches its group's classified tier (e.g. after
    /// a failed propagation).
    pub async fn reconcile_groups(&self) -> RouterResult<ReconcileReport> {
        let mut per_node: HashMap<String, NodeTotals> = HashMap::new();
        self.events
            .for_each(&EventFilter::default(), &mut |event| {
                for pk in [&event.out_chan_node, &event.in_chan_node] {
                    let totals = per_node.entry(pk.clone()).or_default();
                    totals.sats_fwd += event.amount_sats;
                    totals.usd_fwd += event.usd_amount;
                    totals.sats_fee += event.fee_sats;
                    totals.usd_fee += event.usd_fee;
                }
            })
            .await?;

        let mut report = ReconcileReport::default();
        for group in self.groups.all_groups().await? {
            report.groups_checked += 1;

            let mut computed = NodeTotals::default();
            for pk in &group.nodes {
                if let Some(totals) = per_node.get(pk) {
                    computed.sats_fwd += totals.sats_fwd;
                    computed.usd_fwd += totals.usd_fwd;
                    computed.sats_fee += totals.sats_fee;
                    computed.usd_fee += totals.usd_fee;
                }
            }
            if computed.sats_fwd != group.total_sats_fwd
                || computed.usd_fwd != group.total_usd_fwd
            {
                warn!(
                    group_id = %group.id,
                    stored_usd = %group.total_usd_fwd,
                    computed_usd = %computed.usd_fwd,
                    "group totals diverge from event history"
                );
                self.notifier
                    .alert(
                        AlertLevel::Warning,
                        "router",
                        &format!(
                            "Group {} totals diverge from event history: stored {} USD, computed {} USD",
                            group.id, group.total_usd_fwd, computed.usd_fwd
                        ),
                    )
                    .await;
                report.discrepancies.push(GroupDiscrepancy {
                    group_id: group.id.clone(),
                    stored_usd_fwd: group.total_usd_fwd,
                    computed_usd_fwd: computed.usd_fwd,
                    stored_sats_fwd: group.total_sats_fwd,
                    computed_sats_fwd: computed.sats_fwd,
                });
            }

            if self.repair_group_tier(&group).await? {
                report.tiers_repaired += 1;
            }
        }
        Ok(report)
    }
}
