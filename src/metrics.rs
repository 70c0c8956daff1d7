use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every receive loop.
#[derive(Debug, Default)]
pub struct CollectorMetrics {
    pub udp_packets_received: AtomicU64,
    pub udp_bytes_received: AtomicU64,
    pub parse_errors: AtomicU64,
    pub records_forwarded: AtomicU64,
    pub sessions_created: AtomicU64,
    pub templates_attached: AtomicU64,
    pub passthrough_packets: AtomicU64,
    pub session_dumps: AtomicU64,
}

impl CollectorMetrics {
    pub fn snapshot(&self) -> HashMap<String, u64> {
        let mut stats = HashMap::new();
        stats.insert(
            "udp_packets_received".to_string(),
            self.udp_packets_received.load(Ordering::Relaxed),
        );
        stats.insert(
            "udp_bytes_received".to_string(),
            self.udp_bytes_received.load(Ordering::Relaxed),
        );
        stats.insert(
            "parse_errors".to_string(),
            self.parse_errors.load(Ordering::Relaxed),
        );
        stats.insert(
            "records_forwarded".to_string(),
            self.records_forwarded.load(Ordering::Relaxed),
        );
        stats.insert(
            "sessions_created".to_string(),
            self.sessions_created.load(Ordering::Relaxed),
        );
        stats.insert(
            "templates_attached".to_string(),
            self.templates_attached.load(Ordering::Relaxed),
        );
        stats.insert(
            "passthrough_packets".to_string(),
            self.passthrough_packets.load(Ordering::Relaxed),
        );
        stats.insert(
            "session_dumps".to_string(),
            self.session_dumps.load(Ordering::Relaxed),
        );
        stats
    }
}
