use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every connection of a manager
#[derive(Debug, Default)]
pub struct Metrics {
    // Handshakes
    pub connections_opened: AtomicU64,
    pub connections_accepted: AtomicU64,
    pub connections_closed: AtomicU64,
    pub fallbacks: AtomicU64,

    // Subflows
    pub joins_established: AtomicU64,
    pub joins_rejected: AtomicU64,
    pub subflows_closed: AtomicU64,

    // Tokens
    pub token_collisions: AtomicU64,

    // Data path
    pub mappings_sent: AtomicU64,
    pub mappings_received: AtomicU64,
    pub bytes_mapped: AtomicU64,
    pub checksum_failures: AtomicU64,
    pub options_dropped: AtomicU64,
    pub scheduler_deferrals: AtomicU64,

    // Path management
    pub addresses_announced: AtomicU64,
    pub addresses_received: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_join_established(&self) {
        self.joins_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_join_rejected(&self) {
        self.joins_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subflow_closed(&self) {
        self.subflows_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_token_collisions(&self, count: u64) {
        self.token_collisions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_mapping_sent(&self, len: usize) {
        self.mappings_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_mapped.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn record_mapping_received(&self) {
        self.mappings_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checksum_failure(&self) {
        self.checksum_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_options_dropped(&self, count: usize) {
        if count > 0 {
            self.options_dropped.fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    pub fn record_scheduler_deferral(&self) {
        self.scheduler_deferrals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_address_announced(&self) {
        self.addresses_announced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_address_received(&self) {
        self.addresses_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of the current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            joins_established: self.joins_established.load(Ordering::Relaxed),
            joins_rejected: self.joins_rejected.load(Ordering::Relaxed),
            subflows_closed: self.subflows_closed.load(Ordering::Relaxed),
            token_collisions: self.token_collisions.load(Ordering::Relaxed),
            mappings_sent: self.mappings_sent.load(Ordering::Relaxed),
            mappings_received: self.mappings_received.load(Ordering::Relaxed),
            bytes_mapped: self.bytes_mapped.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            options_dropped: self.options_dropped.load(Ordering::Relaxed),
            scheduler_deferrals: self.scheduler_deferrals.load(Ordering::Relaxed),
            addresses_announced: self.addresses_announced.load(Ordering::Relaxed),
            addresses_received: self.addresses_received.load(Ordering::Relaxed),
        }
    }
}

/// A snapshot of metrics values (immutable)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub fallbacks: u64,
    pub joins_established: u64,
    pub joins_rejected: u64,
    pub subflows_closed: u64,
    pub token_collisions: u64,
    pub mappings_sent: u64,
    pub mappings_received: u64,
    pub bytes_mapped: u64,
    pub checksum_failures: u64,
    pub options_dropped: u64,
    pub scheduler_deferrals: u64,
    pub addresses_announced: u64,
    pub addresses_received: u64,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- MPTCP Metrics ---")?;
        writeln!(f, "Connections:")?;
        writeln!(
            f,
            "  Opened: {} / Accepted: {} / Closed: {} / Fallback: {}",
            self.connections_opened, self.connections_accepted, self.connections_closed, self.fallbacks
        )?;
        writeln!(f, "Subflows:")?;
        writeln!(
            f,
            "  Joined: {} / Rejected: {} / Closed: {}",
            self.joins_established, self.joins_rejected, self.subflows_closed
        )?;
        writeln!(f, "Data:")?;
        writeln!(
            f,
            "  Mappings sent: {} ({} bytes) / received: {}",
            self.mappings_sent, self.bytes_mapped, self.mappings_received
        )?;
        writeln!(
            f,
            "  Checksum failures: {} / Dropped options: {} / Deferred: {}",
            self.checksum_failures, self.options_dropped, self.scheduler_deferrals
        )?;
        writeln!(f, "Paths:")?;
        writeln!(
            f,
            "  Announced: {} / Received: {}",
            self.addresses_announced, self.addresses_received
        )?;
        write!(f, "Token collisions: {}", self.token_collisions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let metrics = Metrics::new();
        metrics.record_connection_opened();
        metrics.record_mapping_sent(100);
        metrics.record_mapping_sent(50);
        metrics.record_options_dropped(0);
        metrics.record_options_dropped(2);
        metrics.record_token_collisions(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_opened, 1);
        assert_eq!(snapshot.mappings_sent, 2);
        assert_eq!(snapshot.bytes_mapped, 150);
        assert_eq!(snapshot.options_dropped, 2);
        assert_eq!(snapshot.token_collisions, 3);
    }

    #[test]
    fn test_snapshot_json() {
        let metrics = Metrics::new();
        metrics.record_fallback();
        let json = metrics.snapshot().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["fallbacks"], 1);
        assert_eq!(value["joins_rejected"], 0);
    }

    #[test]
    fn test_display() {
        let text = Metrics::new().snapshot().to_string();
        assert!(text.contains("MPTCP Metrics"));
        assert!(text.contains("Token collisions: 0"));
    }
}
