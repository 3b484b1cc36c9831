use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyMetrics {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub origin_dial_failures: u64,
    pub tls_upgrades: u64,
    pub origin_switches: u64,
    pub origin_switch_failures: u64,
    pub handler_rejections: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ProxyMetricsStore {
    total_sessions: AtomicU64,
    active_sessions: AtomicU64,
    origin_dial_failures: AtomicU64,
    tls_upgrades: AtomicU64,
    origin_switches: AtomicU64,
    origin_switch_failures: AtomicU64,
    handler_rejections: AtomicU64,
}

impl ProxyMetricsStore {
    pub(crate) fn snapshot(&self) -> ProxyMetrics {
        ProxyMetrics {
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            origin_dial_failures: self.origin_dial_failures.load(Ordering::Relaxed),
            tls_upgrades: self.tls_upgrades.load(Ordering::Relaxed),
            origin_switches: self.origin_switches.load(Ordering::Relaxed),
            origin_switch_failures: self.origin_switch_failures.load(Ordering::Relaxed),
            handler_rejections: self.handler_rejections.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_session_open(&self) {
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_session_close(&self) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(1))
            });
    }

    pub(crate) fn record_origin_dial_failure(&self) {
        self.origin_dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tls_upgrade(&self) {
        self.tls_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_origin_switch(&self) {
        self.origin_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_origin_switch_failure(&self) {
        self.origin_switch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_rejection(&self) {
        self.handler_rejections.fetch_add(1, Ordering::Relaxed);
    }
}
