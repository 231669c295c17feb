//! Per-cycle progress tracking.
//!
//! The `CycleTracker` counts what one sync cycle did: records published to the
//! upload path, operations confirmed in the store, remote changes fetched and how
//! each was resolved. The orchestrator turns it into a `SyncReport` when the cycle
//! completes.

use crate::sync::conflict::Resolution;
use crate::sync::types::{SyncReport, SyncTrigger};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Counters for one sync cycle
#[derive(Debug, Clone)]
pub struct CycleTracker {
    trigger: SyncTrigger,
    started_at: DateTime<Utc>,
    /// Records handed to the upload path and acknowledged
    published: usize,
    /// Operations removed from the pending store
    confirmed: usize,
    /// Raw remote records received
    fetched: usize,
    /// Remote changes written locally
    applied: usize,
    /// Remote changes that lost to the local version
    kept_local: usize,
    /// Remote records that could not be parsed
    skipped_malformed: usize,
}

impl CycleTracker {
    pub fn new(trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            started_at: Utc::now(),
            published: 0,
            confirmed: 0,
            fetched: 0,
            applied: 0,
            kept_local: 0,
            skipped_malformed: 0,
        }
    }

    pub fn record_upload(&mut self, published: usize, confirmed: usize) {
        self.published += published;
        self.confirmed += confirmed;
    }

    pub fn record_fetched(&mut self, count: usize) {
        self.fetched += count;
    }

    pub fn record_malformed(&mut self) {
        self.skipped_malformed += 1;
    }

    pub fn record_resolution(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::AcceptIncoming => self.applied += 1,
            Resolution::KeepLocal => self.kept_local += 1,
        }
    }

    /// Close the cycle with the final clock counter and the new watermark.
    pub fn finish(self, clock_counter: u64, watermark: DateTime<Utc>) -> SyncReport {
        let report = SyncReport {
            trigger: self.trigger,
            started_at: self.started_at,
            finished_at: Utc::now(),
            published: self.published,
            confirmed: self.confirmed,
            fetched: self.fetched,
            applied: self.applied,
            kept_local: self.kept_local,
            skipped_malformed: self.skipped_malformed,
            clock_counter,
            watermark,
        };
        debug!(
            "Cycle took {} ms",
            (report.finished_at - report.started_at).num_milliseconds()
        );
        report
    }
}
