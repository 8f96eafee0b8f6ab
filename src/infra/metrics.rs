//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics so the GPS feed, card signal and controller tasks can record
//! without contending on a mutex.
//!
//! Counters use Relaxed ordering and are for reporting only; nothing reads
//! them to make journey decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Lock-free metrics collector
pub struct Metrics {
    started_at: Instant,
    /// Fixes pushed into the position queue (monotonic)
    fixes_published: AtomicU64,
    /// Fixes evicted unread because the queue was full (monotonic)
    fixes_overwritten: AtomicU64,
    /// RMC sentences rejected as weak signal (monotonic)
    weak_fixes: AtomicU64,
    /// GPS port open/read failures that forced a reopen (monotonic)
    gps_reconnects: AtomicU64,
    /// Card reads accepted after debounce (monotonic)
    card_reads: AtomicU64,
    invalid_cards: AtomicU64,
    wrong_cards: AtomicU64,
    routes_started: AtomicU64,
    routes_recovered: AtomicU64,
    routes_completed: AtomicU64,
    path_rows_written: AtomicU64,
    /// Path rows written since last report (reset on report)
    path_rows_since_report: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            fixes_published: AtomicU64::new(0),
            fixes_overwritten: AtomicU64::new(0),
            weak_fixes: AtomicU64::new(0),
            gps_reconnects: AtomicU64::new(0),
            card_reads: AtomicU64::new(0),
            invalid_cards: AtomicU64::new(0),
            wrong_cards: AtomicU64::new(0),
            routes_started: AtomicU64::new(0),
            routes_recovered: AtomicU64::new(0),
            routes_completed: AtomicU64::new(0),
            path_rows_written: AtomicU64::new(0),
            path_rows_since_report: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_fix_published(&self, overwritten: bool) {
        self.fixes_published.fetch_add(1, Ordering::Relaxed);
        if overwritten {
            self.fixes_overwritten.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_weak_fix(&self) {
        self.weak_fixes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_gps_reconnect(&self) {
        self.gps_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_card_read(&self) {
        self.card_reads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_invalid_card(&self) {
        self.invalid_cards.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_wrong_card(&self) {
        self.wrong_cards.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_route_started(&self) {
        self.routes_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_route_recovered(&self) {
        self.routes_recovered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_route_completed(&self) {
        self.routes_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_path_row(&self) {
        self.path_rows_written.fetch_add(1, Ordering::Relaxed);
        self.path_rows_since_report.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fixes_published(&self) -> u64 {
        self.fixes_published.load(Ordering::Relaxed)
    }

    pub fn weak_fixes(&self) -> u64 {
        self.weak_fixes.load(Ordering::Relaxed)
    }

    pub fn card_reads(&self) -> u64 {
        self.card_reads.load(Ordering::Relaxed)
    }

    pub fn invalid_cards(&self) -> u64 {
        self.invalid_cards.load(Ordering::Relaxed)
    }

    pub fn wrong_cards(&self) -> u64 {
        self.wrong_cards.load(Ordering::Relaxed)
    }

    pub fn routes_completed(&self) -> u64 {
        self.routes_completed.load(Ordering::Relaxed)
    }

    pub fn path_rows_written(&self) -> u64 {
        self.path_rows_written.load(Ordering::Relaxed)
    }

    /// Snapshot all counters, resetting the per-interval ones
    pub fn report(&self) -> MetricsSummary {
        MetricsSummary {
            uptime_secs: self.started_at.elapsed().as_secs(),
            fixes_published: self.fixes_published.load(Ordering::Relaxed),
            fixes_overwritten: self.fixes_overwritten.load(Ordering::Relaxed),
            weak_fixes: self.weak_fixes.load(Ordering::Relaxed),
            gps_reconnects: self.gps_reconnects.load(Ordering::Relaxed),
            card_reads: self.card_reads.load(Ordering::Relaxed),
            invalid_cards: self.invalid_cards.load(Ordering::Relaxed),
            wrong_cards: self.wrong_cards.load(Ordering::Relaxed),
            routes_started: self.routes_started.load(Ordering::Relaxed),
            routes_recovered: self.routes_recovered.load(Ordering::Relaxed),
            routes_completed: self.routes_completed.load(Ordering::Relaxed),
            path_rows_written: self.path_rows_written.load(Ordering::Relaxed),
            path_rows_since_report: self.path_rows_since_report.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSummary {
    pub uptime_secs: u64,
    pub fixes_published: u64,
    pub fixes_overwritten: u64,
    pub weak_fixes: u64,
    pub gps_reconnects: u64,
    pub card_reads: u64,
    pub invalid_cards: u64,
    pub wrong_cards: u64,
    pub routes_started: u64,
    pub routes_recovered: u64,
    pub routes_completed: u64,
    pub path_rows_written: u64,
    pub path_rows_since_report: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            uptime_secs = %self.uptime_secs,
            fixes_published = %self.fixes_published,
            fixes_overwritten = %self.fixes_overwritten,
            weak_fixes = %self.weak_fixes,
            gps_reconnects = %self.gps_reconnects,
            card_reads = %self.card_reads,
            invalid_cards = %self.invalid_cards,
            wrong_cards = %self.wrong_cards,
            routes_started = %self.routes_started,
            routes_recovered = %self.routes_recovered,
            routes_completed = %self.routes_completed,
            path_rows = %self.path_rows_since_report,
            "metrics_summary"
        );
    }
}
