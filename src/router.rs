//! Router Manager
//!
//! Top-level wiring: owns the channel directory and the tier manager,
//! runs the watch-driven sync task, admits or rejects incoming channel
//! opens through the AML collaborator and keeps peer profiles current
//! on connect/disconnect notifications.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::ChannelDirectory;
use crate::config::RouterConfig;
use crate::error::{RouterError, RouterResult};
use crate::notifier::{AlertLevel, Notifier};
use crate::peers::PeerStore;
use crate::tier_manager::{CycleOutcome, TierManager};

/// An incoming channel-open request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRequest {
    /// Proposed channel id
    pub id: String,
    /// Opening peer's public key
    pub partner_public_key: String,
    /// Proposed capacity in sats
    pub capacity: u64,
    /// Our side's balance in sats
    pub local_balance: u64,
}

/// Admission decision for a channel open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDecision {
    /// Whether to accept the channel
    pub accept: bool,
    /// Rejection reason, when not accepted
    pub reason: Option<String>,
}

impl ChannelDecision {
    fn accept() -> Self {
        Self {
            accept: true,
            reason: None,
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            accept: false,
            reason: Some(reason.into()),
        }
    }
}

/// AML capacity-check request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmlCheckRequest {
    /// Opening peer's public key
    pub node_public_key: String,
    /// Balance on our side, in sats
    pub local_balance: u64,
    /// Balance on the peer's side, in sats
    pub remote_balance: u64,
}

/// AML verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmlDecision {
    /// Whether the request passes
    pub pass: bool,
    /// Failure reason, when not passing
    pub reason: Option<String>,
}

/// AML channel-admission policy trait
#[async_trait]
pub trait AmlChecker: Send + Sync {
    /// Evaluate a channel-open request.
    async fn check(&self, request: &AmlCheckRequest) -> RouterResult<AmlDecision>;
}

/// AML checker for testing: fixed verdict, optional failure mode.
pub struct MockAmlChecker {
    pass: std::sync::atomic::AtomicBool,
    fail_mode: std::sync::atomic::AtomicBool,
    reason: std::sync::RwLock<Option<String>>,
}

impl MockAmlChecker {
    /// Create a checker that passes everything.
    pub fn passing() -> Self {
        Self {
            pass: std::sync::atomic::AtomicBool::new(true),
            fail_mode: std::sync::atomic::AtomicBool::new(false),
            reason: std::sync::RwLock::new(None),
        }
    }

    /// Make the checker reject with `reason`.
    pub fn set_reject(&self, reason: &str) {
        self.pass.store(false, std::sync::atomic::Ordering::SeqCst);
        *self.reason.write().expect("aml lock poisoned") = Some(reason.to_string());
    }

    /// Make `check` itself fail (transport error).
    pub fn set_fail_mode(&self, fail: bool) {
        self.fail_mode
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl AmlChecker for MockAmlChecker {
    async fn check(&self, _request: &AmlCheckRequest) -> RouterResult<AmlDecision> {
        if self.fail_mode.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RouterError::AmlCheck("mock AML endpoint down".to_string()));
        }
        Ok(AmlDecision {
            pass: self.pass.load(std::sync::atomic::Ordering::SeqCst),
            reason: self.reason.read().expect("aml lock poisoned").clone(),
        })
    }
}

/// Peer lifecycle notification from the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerEventKind {
    /// Peer connected
    Connected,
    /// Peer disconnected
    Disconnected,
}

/// A peer connect/disconnect event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEvent {
    /// Event kind
    pub kind: PeerEventKind,
    /// Peer public key
    pub public_key: String,
}

/// Handles to the router's background tasks
pub struct RouterHandles {
    /// Channel-directory refresh timer
    pub refresh: JoinHandle<()>,
    /// Watch-driven sync loop
    pub sync: JoinHandle<()>,
}

/// Top-level router
pub struct RouterManager {
    config: RouterConfig,
    directory: Arc<ChannelDirectory>,
    tier_manager: Arc<TierManager>,
    peers: Arc<dyn PeerStore>,
    aml: Arc<dyn AmlChecker>,
    notifier: Arc<dyn Notifier>,
}

impl RouterManager {
    /// Wire up the router over its collaborators.
    pub fn new(
        config: RouterConfig,
        directory: Arc<ChannelDirectory>,
        tier_manager: Arc<TierManager>,
        peers: Arc<dyn PeerStore>,
        aml: Arc<dyn AmlChecker>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            directory,
            tier_manager,
            peers,
            aml,
            notifier,
        }
    }

    /// The wrapped tier manager.
    pub fn tier_manager(&self) -> &Arc<TierManager> {
        &self.tier_manager
    }

    /// Start the refresh timer and the sync loop. Every completed
    /// channel refresh triggers a sync cycle; a cycle already in
    /// flight swallows the trigger.
    pub fn start(&self) -> RouterHandles {
        let refresh = self
            .directory
            .spawn_refresh_task(self.config.channel_refresh_interval);

        let mut updates = self.directory.subscribe();
        let tier_manager = Arc::clone(&self.tier_manager);
        let sync = tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                match tier_manager.sync_forward_events().await {
                    Ok(CycleOutcome::Completed(_)) => {}
                    Ok(CycleOutcome::AlreadyRunning) => {
                        debug!("channels updated during sync, trigger dropped");
                    }
                    Err(e) => {
                        error!(error = %e, "triggered sync cycle failed");
                    }
                }
            }
        });
        info!("router started");
        RouterHandles { refresh, sync }
    }

    /// Run one sync cycle directly (external invocation path).
    pub async fn sync_forward_events(&self) -> RouterResult<CycleOutcome> {
        self.tier_manager.sync_forward_events().await
    }

    /// Admit or reject an incoming channel open.
    ///
    /// Whitelisted peers are accepted outright; everyone else passes
    /// through the AML capacity check. AML transport failures are
    /// alerted and propagated, not treated as a verdict.
    pub async fn handle_channel_request(
        &self,
        request: &ChannelRequest,
    ) -> RouterResult<ChannelDecision> {
        if self.config.is_whitelisted(&request.partner_public_key) {
            self.notifier
                .alert(
                    AlertLevel::Info,
                    "router",
                    &format!(
                        "New channel from whitelisted node {} - Capacity: {}",
                        request.partner_public_key, request.capacity
                    ),
                )
                .await;
            return Ok(ChannelDecision::accept());
        }

        info!(
            channel = %request.id,
            peer = %request.partner_public_key,
            capacity = request.capacity,
            "new channel request"
        );
        let aml_request = AmlCheckRequest {
            node_public_key: request.partner_public_key.clone(),
            local_balance: request.local_balance,
            remote_balance: request.capacity.saturating_sub(request.local_balance),
        };
        let verdict = match self.aml.check(&aml_request).await {
            Ok(verdict) => verdict,
            Err(e) => {
                error!(error = %e, "failed to run AML check on channel request");
                self.notifier
                    .alert(
                        AlertLevel::Error,
                        "router",
                        "Failed to check aml on channel request",
                    )
                    .await;
                return Err(e);
            }
        };

        if verdict.pass {
            self.notifier
                .alert(
                    AlertLevel::Info,
                    "router",
                    &format!(
                        "New channel from {} - Capacity: {}",
                        request.partner_public_key, request.capacity
                    ),
                )
                .await;
            return Ok(ChannelDecision::accept());
        }

        let reason = verdict
            .reason
            .unwrap_or_else(|| "aml check failed".to_string());
        self.notifier
            .alert(
                AlertLevel::Info,
                "router",
                &format!("channel rejected {reason}"),
            )
            .await;
        self.peers
            .channel_rejected(&request.partner_public_key, &reason)
            .await?;
        Ok(ChannelDecision::reject(reason))
    }

    /// Record a peer connect/disconnect on its profile, creating the
    /// profile on first sight.
    pub async fn handle_peer_event(&self, event: &PeerEvent) -> RouterResult<()> {
        debug!(peer = %event.public_key, kind = ?event.kind, "peer event");
        match event.kind {
            PeerEventKind::Connected => {
                if self.peers.get_peer(&event.public_key).await?.is_none() {
                    self.peers
                        .new_peer(
                            &event.public_key,
                            self.tier_manager.tiers().first().clone(),
                        )
                        .await?;
                } else {
                    self.peers.peer_connected(&event.public_key).await?;
                }
            }
            PeerEventKind::Disconnected => {
                if let Err(e) = self.peers.peer_disconnected(&event.public_key).await {
                    warn!(peer = %event.public_key, error = %e, "disconnect for unknown peer");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{ForwardEventStore, MemoryForwardEventStore};
    use crate::fee_tier::FeeTierTable;
    use crate::group_store::{MemoryPeerGroupStore, PeerGroupStore};
    use crate::node_client::{LightningNodeClient, MockLightningNode};
    use crate::notifier::MemoryNotifier;
    use crate::peers::MemoryPeerStore;
    use crate::rate::{MockRateSource, RateSource};
    use rust_decimal::Decimal;

    struct Harness {
        aml: Arc<MockAmlChecker>,
        peers: Arc<MemoryPeerStore>,
        notifier: Arc<MemoryNotifier>,
        router: RouterManager,
    }

    fn harness(config: RouterConfig) -> Harness {
        let node = Arc::new(MockLightningNode::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let peers = Arc::new(MemoryPeerStore::new());
        let aml = Arc::new(MockAmlChecker::passing());
        let directory = Arc::new(ChannelDirectory::new(
            Arc::clone(&node) as Arc<dyn LightningNodeClient>
        ));
        let tier_manager = Arc::new(TierManager::new(
            config.clone(),
            FeeTierTable::default(),
            Arc::clone(&directory),
            Arc::clone(&node) as Arc<dyn LightningNodeClient>,
            Arc::new(MemoryForwardEventStore::new()) as Arc<dyn ForwardEventStore>,
            Arc::new(MemoryPeerGroupStore::new()) as Arc<dyn PeerGroupStore>,
            Arc::new(MockRateSource::new(Decimal::from(100_000u64))) as Arc<dyn RateSource>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
        ));
        let router = RouterManager::new(
            config,
            directory,
            tier_manager,
            Arc::clone(&peers) as Arc<dyn PeerStore>,
            Arc::clone(&aml) as Arc<dyn AmlChecker>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
        );
        Harness {
            aml,
            peers,
            notifier,
            router,
        }
    }

    fn request(peer: &str) -> ChannelRequest {
        ChannelRequest {
            id: "chan-new".to_string(),
            partner_public_key: peer.to_string(),
            capacity: 1_000_000,
            local_balance: 200_000,
        }
    }

    #[tokio::test]
    async fn test_whitelisted_peer_accepted_without_aml() {
        let config = RouterConfig {
            node_whitelist: vec!["pk-friend".to_string()],
            ..Default::default()
        };
        let h = harness(config);
        h.aml.set_fail_mode(true); // would error if consulted

        let decision = h
            .router
            .handle_channel_request(&request("pk-friend"))
            .await
            .unwrap();
        assert!(decision.accept);
        assert_eq!(h.notifier.alerts_on("router").len(), 1);
    }

    #[tokio::test]
    async fn test_aml_pass_accepts() {
        let h = harness(RouterConfig::default());
        let decision = h
            .router
            .handle_channel_request(&request("pk-new"))
            .await
            .unwrap();
        assert!(decision.accept);
    }

    #[tokio::test]
    async fn test_aml_reject_logs_and_rejects() {
        let h = harness(RouterConfig::default());
        h.aml.set_reject("capacity over AML limit");

        let decision = h
            .router
            .handle_channel_request(&request("pk-new"))
            .await
            .unwrap();
        assert!(!decision.accept);
        assert_eq!(decision.reason.as_deref(), Some("capacity over AML limit"));

        let log = h.peers.log_of("pk-new").await.unwrap();
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_aml_transport_failure_propagates() {
        let h = harness(RouterConfig::default());
        h.aml.set_fail_mode(true);

        let result = h.router.handle_channel_request(&request("pk-new")).await;
        assert!(matches!(result, Err(RouterError::AmlCheck(_))));
        assert!(h
            .notifier
            .alerts_on("router")
            .iter()
            .any(|a| a.level == AlertLevel::Error));
    }

    #[tokio::test]
    async fn test_peer_events_maintain_profile() {
        let h = harness(RouterConfig::default());
        let connect = PeerEvent {
            kind: PeerEventKind::Connected,
            public_key: "pk-a".to_string(),
        };
        h.router.handle_peer_event(&connect).await.unwrap();
        assert!(h.peers.get_peer("pk-a").await.unwrap().is_some());

        // Second connect updates rather than recreates.
        h.router.handle_peer_event(&connect).await.unwrap();
        let disconnect = PeerEvent {
            kind: PeerEventKind::Disconnected,
            public_key: "pk-a".to_string(),
        };
        h.router.handle_peer_event(&disconnect).await.unwrap();

        let profile = h.peers.get_peer("pk-a").await.unwrap().unwrap();
        assert!(profile.last_disconnect.is_some());
        assert_eq!(h.peers.log_of("pk-a").await.unwrap().len(), 5);
    }
}
