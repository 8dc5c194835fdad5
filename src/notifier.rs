//! Operator Alerting
//!
//! Fire-and-forget notifications (Slack-style). Alerts never block or
//! fail the calling operation; delivery problems are the notifier
//! implementation's concern.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    /// Informational: tier changes, accepted channels
    Info,
    /// Degraded operation: retries, skipped events
    Warning,
    /// Requires operator attention: failed propagation, aborted cycles
    Error,
}

/// Alerting trait
///
/// Implementations must swallow their own delivery failures; callers
/// treat `alert` as infallible.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send an alert on `topic`.
    async fn alert(&self, level: AlertLevel, topic: &str, message: &str);
}

/// Notifier that drops everything; useful when alerting is not wired.
#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn alert(&self, _level: AlertLevel, _topic: &str, _message: &str) {}
}

/// A recorded alert
#[derive(Debug, Clone)]
pub struct Alert {
    /// Severity
    pub level: AlertLevel,
    /// Topic, e.g. `channel_tier` or `router`
    pub topic: String,
    /// Human-readable message
    pub message: String,
    /// When the alert was raised
    pub at: DateTime<Utc>,
}

/// In-memory notifier for testing; records every alert.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    alerts: std::sync::Mutex<Vec<Alert>>,
}

impl MemoryNotifier {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All alerts recorded so far.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().expect("notifier lock poisoned").clone()
    }

    /// Alerts on a given topic.
    pub fn alerts_on(&self, topic: &str) -> Vec<Alert> {
        self.alerts()
            .into_iter()
            .filter(|a| a.topic == topic)
            .collect()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn alert(&self, level: AlertLevel, topic: &str, message: &str) {
        let mut alerts = self.alerts.lock().expect("notifier lock poisoned");
        alerts.push(Alert {
            level,
            topic: topic.to_string(),
            message: message.to_string(),
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_notifier_records() {
        let notifier = MemoryNotifier::new();
        notifier.alert(AlertLevel::Info, "router", "hello").await;
        notifier
            .alert(AlertLevel::Error, "channel_tier", "failed")
            .await;

        assert_eq!(notifier.alerts().len(), 2);
        let tier_alerts = notifier.alerts_on("channel_tier");
        assert_eq!(tier_alerts.len(), 1);
        assert_eq!(tier_alerts[0].level, AlertLevel::Error);
    }
}
