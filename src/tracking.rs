use crate::models::ChangeAction;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-pass progress counters, shared across concurrent batches.
#[derive(Default)]
pub struct SyncProgress {
    inserted: AtomicUsize,
    updated: AtomicUsize,
    kept: AtomicUsize,
    deleted: AtomicUsize,
    skipped: AtomicUsize,
}

/// Point-in-time readout of [`SyncProgress`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub inserted: usize,
    pub updated: usize,
    pub kept: usize,
    pub deleted: usize,
    pub skipped: usize,
}

impl SyncProgress {
    pub fn record_inserted(&self, n: usize) {
        self.inserted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_updated(&self, n: usize) {
        self.updated.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_kept(&self, n: usize) {
        self.kept.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_deleted(&self, n: usize) {
        self.deleted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_skipped(&self, n: usize) {
        self.skipped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            inserted: self.inserted.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            kept: self.kept.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Quota consumption counter for billed work. Only INSERT and UPDATE
/// represent real settlement work; KEEP and SKIP never consume quota.
#[derive(Default)]
pub struct GuardRail {
    consumed: AtomicUsize,
}

impl GuardRail {
    pub fn increment(&self, action: ChangeAction) {
        match action {
            ChangeAction::Insert | ChangeAction::Update => {
                self.consumed.fetch_add(1, Ordering::Relaxed);
            }
            ChangeAction::Keep | ChangeAction::Delete | ChangeAction::Skip => {}
        }
    }

    pub fn consumed(&self) -> usize {
        self.consumed.load(Ordering::Relaxed)
    }
}
