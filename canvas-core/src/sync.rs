//! # Debounced Sync
//!
//! Coalesces rapid state writes into one downstream flush.
//!
//! ```text
//! write → enqueue, deadline = now + debounce   (each write resets the timer)
//! poll  → deadline passed? take the whole queue → SyncSink::flush
//! ```
//!
//! The flush carries every queued record, not only the latest one.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::namespace::Namespace;
use crate::CanvasResult;

/// One queued state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Namespace that changed.
    pub namespace: Namespace,
    /// Value after the change.
    pub value: Value,
    /// When the change happened (ms since epoch).
    pub timestamp: u64,
}

/// Downstream receiver of flushed batches. Fire-and-forget.
pub trait SyncSink: Send + Sync + std::fmt::Debug {
    /// Deliver a batch.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery failed; the store logs it and moves on.
    fn flush(&self, batch: &[SyncRecord]) -> CanvasResult<()>;
}

/// A failed flush kept in the capped error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    /// Error message.
    pub message: String,
    /// Records in the failed batch.
    pub records: usize,
    /// When it failed (ms since epoch).
    pub timestamp: u64,
}

/// Pending sync records and flush bookkeeping.
#[derive(Debug, Clone)]
pub struct SyncQueue {
    pending: Vec<SyncRecord>,
    deadline: Option<Instant>,
    debounce: Duration,
    last_sync: Option<u64>,
    flush_count: u64,
    failures: VecDeque<SyncFailure>,
    max_failures: usize,
}

impl SyncQueue {
    /// Create a queue with a debounce window and error-log cap.
    #[must_use]
    pub fn new(debounce: Duration, max_failures: usize) -> Self {
        Self {
            pending: Vec::new(),
            deadline: None,
            debounce,
            last_sync: None,
            flush_count: 0,
            failures: VecDeque::new(),
            max_failures,
        }
    }

    /// Queue a record and restart the debounce timer.
    pub fn enqueue(&mut self, record: SyncRecord, now: Instant) {
        self.pending.push(record);
        self.deadline = Some(now + self.debounce);
    }

    /// Whether the debounce window has elapsed with records pending.
    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        !self.pending.is_empty() && self.deadline.is_some_and(|d| now >= d)
    }

    /// Take the queue if it is due.
    pub fn take_due(&mut self, now: Instant) -> Option<Vec<SyncRecord>> {
        if self.is_due(now) {
            Some(self.take_all())
        } else {
            None
        }
    }

    /// Take the queue regardless of the timer.
    pub fn take_all(&mut self) -> Vec<SyncRecord> {
        self.deadline = None;
        std::mem::take(&mut self.pending)
    }

    /// Record a completed flush.
    pub fn mark_synced(&mut self, timestamp: u64) {
        self.last_sync = Some(timestamp);
        self.flush_count += 1;
    }

    /// Record a failed flush, evicting the oldest failure at the cap.
    pub fn record_failure(&mut self, failure: SyncFailure) {
        if self.max_failures == 0 {
            return;
        }
        while self.failures.len() >= self.max_failures {
            self.failures.pop_front();
        }
        self.failures.push_back(failure);
    }

    /// Records waiting for the next flush.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Timestamp of the last flush.
    #[must_use]
    pub const fn last_sync(&self) -> Option<u64> {
        self.last_sync
    }

    /// Number of flushes so far.
    #[must_use]
    pub const fn flush_count(&self) -> u64 {
        self.flush_count
    }

    /// Recent failures, oldest first.
    #[must_use]
    pub fn failures(&self) -> Vec<SyncFailure> {
        self.failures.iter().cloned().collect()
    }

    /// Drop pending records and the failure log.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.deadline = None;
        self.failures.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(scale: f64) -> SyncRecord {
        SyncRecord {
            namespace: Namespace::Zoom,
            value: json!({ "scale": scale }),
            timestamp: 1,
        }
    }

    #[test]
    fn test_not_due_inside_window() {
        let mut queue = SyncQueue::new(Duration::from_millis(200), 10);
        let t0 = Instant::now();
        queue.enqueue(record(1.0), t0);
        assert!(!queue.is_due(t0 + Duration::from_millis(199)));
        assert!(queue.is_due(t0 + Duration::from_millis(200)));
    }

    #[test]
    fn test_writes_reset_timer_and_coalesce() {
        let mut queue = SyncQueue::new(Duration::from_millis(200), 10);
        let t0 = Instant::now();
        queue.enqueue(record(1.0), t0);
        queue.enqueue(record(2.0), t0 + Duration::from_millis(150));

        assert!(queue.take_due(t0 + Duration::from_millis(250)).is_none());
        let batch = queue
            .take_due(t0 + Duration::from_millis(350))
            .expect("due after quiet period");
        assert_eq!(batch.len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_mark_synced_counts() {
        let mut queue = SyncQueue::new(Duration::ZERO, 10);
        queue.mark_synced(1000);
        queue.mark_synced(2000);
        assert_eq!(queue.flush_count(), 2);
        assert_eq!(queue.last_sync(), Some(2000));
    }

    #[test]
    fn test_failure_log_is_capped() {
        let mut queue = SyncQueue::new(Duration::ZERO, 2);
        for i in 0..3 {
            queue.record_failure(SyncFailure {
                message: format!("fail {i}"),
                records: 1,
                timestamp: i,
            });
        }
        let failures = queue.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].message, "fail 1");
    }

    #[test]
    fn test_empty_queue_never_due() {
        let queue = SyncQueue::new(Duration::ZERO, 2);
        assert!(!queue.is_due(Instant::now()));
    }
}
