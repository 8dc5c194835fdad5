//! Lightning Fee-Tier Router
//!
//! Volume-based routing-fee management for a Lightning node. Forwarded
//! payments are pulled from the node, priced in fiat at their routing
//! time and aggregated into peer groups; each group's cumulative volume
//! maps onto a contiguous fee-tier table, and a tier change pushes the
//! new fee rate to every channel the group's nodes hold.
//!
//! # Idempotent Sync Protocol
//!
//! Forward ingestion runs as a paginated sync cycle:
//!
//! 1. **Resume** - The cycle starts just past the newest stored event,
//!    so replayed windows never double-count.
//! 2. **Ingest** - Each forward is content-addressed; appending an
//!    already-stored event is a no-op and skips group mutation.
//! 3. **Settle** - Both sides of a forward receive volume and fee
//!    deltas, and any tier crossing triggers fee propagation before
//!    the new tier is recorded.
//!
//! A transient failure abandons the current page without advancing the
//! resume point; the next cycle re-fetches it and deduplication absorbs
//! the overlap.
//!
//! # Usage
//!
//! ```ignore
//! use ln_tier_router::{
//!     ChannelDirectory, FeeTierTable, MemoryForwardEventStore, MemoryPeerGroupStore,
//!     MemoryPeerStore, MockAmlChecker, MockLightningNode, MockRateSource, NoopNotifier,
//!     RouterConfig, RouterManager, TierManager,
//! };
//! use rust_decimal::Decimal;
//! use std::sync::Arc;
//!
//! async fn example() {
//!     let config = RouterConfig::default();
//!     let node = Arc::new(MockLightningNode::new());
//!     let directory = Arc::new(ChannelDirectory::new(node.clone()));
//!     let tier_manager = Arc::new(TierManager::new(
//!         config.clone(),
//!         FeeTierTable::default(),
//!         directory.clone(),
//!         node,
//!         Arc::new(MemoryForwardEventStore::new()),
//!         Arc::new(MemoryPeerGroupStore::new()),
//!         Arc::new(MockRateSource::new(Decimal::from(100_000u64))),
//!         Arc::new(NoopNotifier),
//!     ));
//!     let router = RouterManager::new(
//!         config,
//!         directory,
//!         tier_manager,
//!         Arc::new(MemoryPeerStore::new()),
//!         Arc::new(MockAmlChecker::passing()),
//!         Arc::new(NoopNotifier),
//!     );
//!     let handles = router.start();
//!     handles.sync.await.ok();
//! }
//! ```

pub mod channels;
pub mod config;
pub mod error;
pub mod event_store;
pub mod fee_tier;
pub mod group_store;
pub mod node_client;
pub mod notifier;
pub mod peers;
pub mod rate;
pub mod retry;
pub mod router;
pub mod tier_manager;

pub use channels::ChannelDirectory;
pub use config::RouterConfig;
pub use error::{RouterError, RouterResult};
pub use event_store::{
    AppendOutcome, EventFilter, ForwardEvent, ForwardEventStore, MemoryForwardEventStore,
};
pub use fee_tier::{
    percent_to_ppm, ppm_to_percent, FeeTier, FeeTierTable, PPM_PER_PERCENT,
};
pub use group_store::{GroupDelta, MemoryPeerGroupStore, PeerGroup, PeerGroupStore};
pub use node_client::{
    Channel, ClosedChannelNode, ForwardsPage, ForwardsQuery, LightningNodeClient,
    MockLightningNode, NodeInfo, RawForward, RoutingFeeUpdate,
};
pub use notifier::{Alert, AlertLevel, MemoryNotifier, Notifier, NoopNotifier};
pub use peers::{MemoryPeerStore, PeerLogEntry, PeerLogEvent, PeerProfile, PeerStore};
pub use rate::{sats_to_btc, FiatRate, MockRateSource, RateSource, SATS_PER_BTC};
pub use retry::RetryConfig;
pub use router::{
    AmlCheckRequest, AmlChecker, AmlDecision, ChannelDecision, ChannelRequest, MockAmlChecker,
    PeerEvent, PeerEventKind, RouterHandles, RouterManager,
};
pub use tier_manager::{
    CycleOutcome, CycleReport, GroupDiscrepancy, ReconcileReport, TierManager,
};
