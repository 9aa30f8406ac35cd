//! Metrics collection for the storage backend.
//!
//! A trait object so embedders can plug in their own implementation; the
//! server wires in the Prometheus-backed collector and serves `/metrics` on a
//! dedicated listener.

use std::sync::Arc;

use lazy_static::lazy_static;
use prometheus::{register_int_counter, IntCounter};

/// Collector interface for the state transitions of the content store and
/// catalog.
pub trait MetricsCollector: Send + Sync {
    /// A new content entry was created (first upload of a hash).
    fn content_created(&self);
    /// An upload was deduplicated against an existing content entry.
    fn content_deduplicated(&self);
    /// A content entry reference was released.
    fn content_released(&self);
    /// A content entry reached refcount zero and was purged with its blobs.
    fn content_purged(&self);
    /// A blob store operation failed and the operation was rolled back.
    fn operation_rolled_back(&self);
    fn bytes_received(&self, amount: usize);
    fn bytes_sent(&self, amount: usize);
}

/// No-op metrics collector (default).
#[derive(Debug, Clone, Default)]
pub struct NoOpMetrics;

impl MetricsCollector for NoOpMetrics {
    fn content_created(&self) {}
    fn content_deduplicated(&self) {}
    fn content_released(&self) {}
    fn content_purged(&self) {}
    fn operation_rolled_back(&self) {}
    fn bytes_received(&self, _amount: usize) {}
    fn bytes_sent(&self, _amount: usize) {}
}

lazy_static! {
    static ref CONTENT_CREATED: IntCounter = register_int_counter!(
        "vault_content_entries_created_total",
        "Content entries created (first upload of a hash)"
    )
    .unwrap();
    static ref CONTENT_DEDUPLICATED: IntCounter = register_int_counter!(
        "vault_uploads_deduplicated_total",
        "Uploads deduplicated against an existing content entry"
    )
    .unwrap();
    static ref CONTENT_RELEASED: IntCounter = register_int_counter!(
        "vault_content_references_released_total",
        "Content entry references released"
    )
    .unwrap();
    static ref CONTENT_PURGED: IntCounter = register_int_counter!(
        "vault_content_entries_purged_total",
        "Content entries purged after reaching refcount zero"
    )
    .unwrap();
    static ref ROLLBACKS: IntCounter = register_int_counter!(
        "vault_operations_rolled_back_total",
        "Operations rolled back after a blob store failure"
    )
    .unwrap();
    static ref BYTES_RECEIVED: IntCounter = register_int_counter!(
        "vault_bytes_received_total",
        "Payload bytes received by uploads"
    )
    .unwrap();
    static ref BYTES_SENT: IntCounter = register_int_counter!(
        "vault_bytes_sent_total",
        "Payload bytes sent by downloads"
    )
    .unwrap();
}

/// Prometheus-backed collector using the default registry.
#[derive(Debug, Clone, Default)]
pub struct PrometheusMetrics;

impl MetricsCollector for PrometheusMetrics {
    fn content_created(&self) {
        CONTENT_CREATED.inc();
    }

    fn content_deduplicated(&self) {
        CONTENT_DEDUPLICATED.inc();
    }

    fn content_released(&self) {
        CONTENT_RELEASED.inc();
    }

    fn content_purged(&self) {
        CONTENT_PURGED.inc();
    }

    fn operation_rolled_back(&self) {
        ROLLBACKS.inc();
    }

    fn bytes_received(&self, amount: usize) {
        BYTES_RECEIVED.inc_by(amount as u64);
    }

    fn bytes_sent(&self, amount: usize) {
        BYTES_SENT.inc_by(amount as u64);
    }
}

/// Shared reference to a metrics collector.
#[derive(Clone)]
pub struct SharedMetrics(Arc<dyn MetricsCollector>);

impl SharedMetrics {
    pub fn new(collector: Arc<dyn MetricsCollector>) -> Self {
        Self(collector)
    }

    pub fn prometheus() -> Self {
        Self(Arc::new(PrometheusMetrics))
    }

    pub fn content_created(&self) {
        self.0.content_created();
    }

    pub fn content_deduplicated(&self) {
        self.0.content_deduplicated();
    }

    pub fn content_released(&self) {
        self.0.content_released();
    }

    pub fn content_purged(&self) {
        self.0.content_purged();
    }

    pub fn operation_rolled_back(&self) {
        self.0.operation_rolled_back();
    }

    pub fn bytes_received(&self, amount: usize) {
        self.0.bytes_received(amount);
    }

    pub fn bytes_sent(&self, amount: usize) {
        self.0.bytes_sent(amount);
    }
}

impl Default for SharedMetrics {
    fn default() -> Self {
        Self(Arc::new(NoOpMetrics))
    }
}

impl std::fmt::Debug for SharedMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedMetrics")
    }
}
