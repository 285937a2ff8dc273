//! Prometheus metrics for the sync client
//!
//! Collected when the `metrics` feature is enabled and a [`ClientMetrics`]
//! is attached to a client. Rendered in the Prometheus text format by
//! [`ClientMetrics::encode`].

use crate::error::ClientResult;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Sync client metrics collector
#[derive(Clone)]
pub struct ClientMetrics {
    registry: Registry,

    // Update metrics
    pub updates_sent: IntCounter,
    pub updates_resent: IntCounter,
    pub updates_acknowledged: IntCounter,
    pub updates_rejected: IntCounter,
    pub pending_updates: IntGauge,

    // Branch metrics
    pub watched_branches: IntGauge,
}

impl ClientMetrics {
    /// Create a collector with its own registry
    pub fn new() -> ClientResult<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create a collector registered into an existing registry
    pub fn with_registry(registry: Registry) -> ClientResult<Self> {
        let updates_sent = IntCounter::new(
            "tagsync_updates_sent_total",
            "Update batches sent for the first time",
        )?;
        let updates_resent = IntCounter::new(
            "tagsync_updates_resent_total",
            "Update batches sent again after a backoff or watch acknowledgement",
        )?;
        let updates_acknowledged = IntCounter::new(
            "tagsync_updates_acknowledged_total",
            "Update batches acknowledged by the server",
        )?;
        let updates_rejected = IntCounter::new(
            "tagsync_updates_rejected_total",
            "Update batches rejected by the server",
        )?;
        let pending_updates =
            IntGauge::new("tagsync_pending_updates", "Update batches awaiting acknowledgement")?;
        let watched_branches = IntGauge::new("tagsync_watched_branches", "Branches being watched")?;

        registry.register(Box::new(updates_sent.clone()))?;
        registry.register(Box::new(updates_resent.clone()))?;
        registry.register(Box::new(updates_acknowledged.clone()))?;
        registry.register(Box::new(updates_rejected.clone()))?;
        registry.register(Box::new(pending_updates.clone()))?;
        registry.register(Box::new(watched_branches.clone()))?;

        Ok(Self {
            registry,
            updates_sent,
            updates_resent,
            updates_acknowledged,
            updates_rejected,
            pending_updates,
            watched_branches,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export metrics in Prometheus text format
    pub fn encode(&self) -> ClientResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
