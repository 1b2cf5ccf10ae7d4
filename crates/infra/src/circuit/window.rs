//! Rolling outcome window backing the breaker's error rate.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Result of one guarded call, as far as statistics are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
    /// Fast-failed while open; upstream was not called.
    Rejected,
    /// Error classified as caller-caused; kept out of the error rate.
    Filtered,
}

/// Counters over the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowCounts {
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejects: u64,
    pub filtered: u64,
}

impl WindowCounts {
    fn add(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.successes += 1,
            Outcome::Failure => self.failures += 1,
            Outcome::Timeout => self.timeouts += 1,
            Outcome::Rejected => self.rejects += 1,
            Outcome::Filtered => self.filtered += 1,
        }
    }

    fn merge(&mut self, other: &WindowCounts) {
        self.successes += other.successes;
        self.failures += other.failures;
        self.timeouts += other.timeouts;
        self.rejects += other.rejects;
        self.filtered += other.filtered;
    }

    /// Calls that reached upstream and count toward the error rate.
    pub fn counted_calls(&self) -> u64 {
        self.successes + self.failures + self.timeouts
    }

    /// Failures (including timeouts) as a percentage of counted calls.
    pub fn error_percentage(&self) -> f64 {
        let calls = self.counted_calls();
        if calls == 0 {
            return 0.0;
        }
        (self.failures + self.timeouts) as f64 * 100.0 / calls as f64
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    start: Instant,
    counts: WindowCounts,
}

/// Fixed-length window split into equal buckets; whole buckets age out.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    window: Duration,
    bucket_len: Duration,
    buckets: VecDeque<Bucket>,
}

impl RollingWindow {
    pub fn new(window: Duration, buckets: u32) -> Self {
        let buckets = buckets.max(1);
        let bucket_len = (window / buckets).max(Duration::from_millis(1));
        Self {
            window,
            bucket_len,
            buckets: VecDeque::with_capacity(buckets as usize + 1),
        }
    }

    pub fn record(&mut self, now: Instant, outcome: Outcome) {
        self.evict(now);
        let needs_bucket = self
            .buckets
            .back()
            .is_none_or(|b| now.duration_since(b.start) >= self.bucket_len);
        if needs_bucket {
            self.buckets.push_back(Bucket {
                start: now,
                counts: WindowCounts::default(),
            });
        }
        if let Some(bucket) = self.buckets.back_mut() {
            bucket.counts.add(outcome);
        }
    }

    pub fn counts(&mut self, now: Instant) -> WindowCounts {
        self.evict(now);
        let mut total = WindowCounts::default();
        for bucket in &self.buckets {
            total.merge(&bucket.counts);
        }
        total
    }

    pub fn reset(&mut self) {
        self.buckets.clear();
    }

    fn evict(&mut self, now: Instant) {
        while let Some(front) = self.buckets.front() {
            if now.duration_since(front.start) >= self.window {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }
}
