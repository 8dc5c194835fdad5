//! Router Error Types
//!
//! Error taxonomy for forward-event ingestion, tier classification and
//! fee propagation.

use thiserror::Error;

/// Router errors
#[derive(Debug, Error)]
pub enum RouterError {
    /// No fee-tier band covers the given amount
    #[error("No fee tier covers amount: {0}")]
    Classification(String),

    /// Channel could not be resolved to a peer
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// Fiat exchange rate unavailable
    #[error("Rate lookup failed: {0}")]
    RateLookup(String),

    /// Peer public key already belongs to a group
    #[error("Duplicate group membership: {0}")]
    DuplicateMembership(String),

    /// Fee-rate update failed for one or more channels
    #[error("Fee propagation failed for group {group_id}: {reason}")]
    FeePropagation { group_id: String, reason: String },

    /// Lightning node RPC unavailable or failed
    #[error("Node unavailable: {0}")]
    NodeUnavailable(String),

    /// Storage collaborator failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Fee-tier table failed validation
    #[error("Invalid tier table: {0}")]
    InvalidTierTable(String),

    /// Group not found by id
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    /// AML admission check could not be performed
    #[error("AML check failed: {0}")]
    AmlCheck(String),
}

impl RouterError {
    /// Whether the error is transient and worth a bounded retry.
    ///
    /// Structural errors (classification, duplicate membership) are
    /// never retried; they indicate a data or configuration problem.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RouterError::RateLookup(_)
                | RouterError::NodeUnavailable(_)
                | RouterError::Storage(_)
        )
    }
}

/// Result type for router operations
pub type RouterResult<T> = Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RouterError::RateLookup("down".into()).is_transient());
        assert!(RouterError::NodeUnavailable("down".into()).is_transient());
        assert!(RouterError::Storage("down".into()).is_transient());
        assert!(!RouterError::Classification("-1".into()).is_transient());
        assert!(!RouterError::DuplicateMembership("pk".into()).is_transient());
        assert!(!RouterError::FeePropagation {
            group_id: "g".into(),
            reason: "rpc".into()
        }
        .is_transient());
    }
}
