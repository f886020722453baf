use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

/// Global runtime metrics for the collector.
///
/// Purpose:
/// - Track connected sessions and active listeners
/// - Track event throughput (received / discarded)
/// - Track link outcomes (inserted / duplicate)
/// - Track contained failures per category
///
/// Design:
/// - Lock-free (Atomics)
/// - Cheap to update
/// - Safe in async + multithreaded contexts
///
/// These are process-wide totals. Per-account numbers live in the
/// collector's tracker and are what `CollectionStatus` reports.
#[derive(Default)]
pub struct RuntimeMetrics {
    // Sessions
    pub sessions_connected: AtomicUsize,
    pub listeners_active: AtomicUsize,

    // Events
    pub events_received: AtomicUsize,
    pub events_discarded: AtomicUsize,

    // Links
    pub links_extracted: AtomicUsize,
    pub links_inserted: AtomicUsize,
    pub links_duplicate: AtomicUsize,

    // Attachments
    pub attachments_scanned: AtomicUsize,
    pub attachment_errors: AtomicUsize,

    // Failures
    pub store_errors: AtomicUsize,
    pub rate_limits: AtomicUsize,
    pub transport_losses: AtomicUsize,
}

impl RuntimeMetrics {
    /// One-line summary used by the periodic reporter.
    pub fn summary(&self) -> String {
        let get = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        format!(
            "sessions={} listeners={} recv={} discarded={} extracted={} inserted={} dup={} files={} file_err={} store_err={} flood={} lost={}",
            get(&self.sessions_connected),
            get(&self.listeners_active),
            get(&self.events_received),
            get(&self.events_discarded),
            get(&self.links_extracted),
            get(&self.links_inserted),
            get(&self.links_duplicate),
            get(&self.attachments_scanned),
            get(&self.attachment_errors),
            get(&self.store_errors),
            get(&self.rate_limits),
            get(&self.transport_losses),
        )
    }
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));

/// Shorthand for `METRICS.<counter>.fetch_add(1, Relaxed)`.
pub fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}
