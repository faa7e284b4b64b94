//! Pause budget tracking.
//!
//! The pause time goal allows at most `max_gc_pause` of pause time within any
//! window of `gc_pause_interval`. The tracker remembers recent pauses and
//! tells the collector how long it must wait before a pause of a given length
//! fits the budget.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
struct PauseRecord {
    start_us: i64,
    end_us: i64,
}

impl PauseRecord {
    fn duration_us(&self) -> i64 {
        self.end_us - self.start_us
    }
}

/// Sliding window of recent pauses.
pub struct G1PauseTracker {
    origin: Instant,
    interval_us: i64,
    max_pause_us: i64,
    pauses: Mutex<VecDeque<PauseRecord>>,
}

impl G1PauseTracker {
    /// Tracker for at most `max_pause_ms` of pauses per `interval_ms`.
    pub fn new(interval_ms: u64, max_pause_ms: u64) -> Self {
        Self {
            origin: Instant::now(),
            interval_us: interval_ms as i64 * 1000,
            max_pause_us: max_pause_ms as i64 * 1000,
            pauses: Mutex::new(VecDeque::new()),
        }
    }

    fn micros(&self, at: Instant) -> i64 {
        at.saturating_duration_since(self.origin).as_micros() as i64
    }

    /// Record a pause.
    pub fn add_pause(&self, start: Instant, end: Instant) {
        let record = PauseRecord {
            start_us: self.micros(start),
            end_us: self.micros(end),
        };
        let mut pauses = self.pauses.lock();
        // Pauses older than one interval can no longer affect any window.
        while pauses
            .front()
            .is_some_and(|p| p.end_us + self.interval_us < record.start_us)
        {
            pauses.pop_front();
        }
        pauses.push_back(record);
    }

    /// Record the pause covering the lifetime of the returned scope.
    pub fn create_scope(&self) -> PauseScope<'_> {
        PauseScope {
            tracker: self,
            start: Instant::now(),
        }
    }

    /// Time to wait before a pause of `pause` fits the budget.
    pub fn min_delay_before_pause(&self, now: Instant, pause: Duration) -> Duration {
        let now_us = self.micros(now);
        let pause_us = (pause.as_micros() as i64).min(self.max_pause_us);
        let mut budget = self.max_pause_us - pause_us;
        let window_begin = now_us + pause_us - self.interval_us;
        let pauses = self.pauses.lock();
        for record in pauses.iter().rev() {
            if record.end_us <= window_begin {
                break;
            }
            if record.duration_us() > budget {
                // The next window must begin after this pause ended.
                let delay = record.end_us + self.interval_us - pause_us - now_us;
                return Duration::from_micros(delay.max(0) as u64);
            }
            budget -= record.duration_us();
        }
        Duration::ZERO
    }

    /// Time to wait before a pause of the maximum length fits the budget.
    pub fn min_delay_before_max_pause(&self, now: Instant) -> Duration {
        self.min_delay_before_pause(now, Duration::from_micros(self.max_pause_us as u64))
    }

    /// Number of remembered pauses.
    pub fn recorded_pauses(&self) -> usize {
        self.pauses.lock().len()
    }
}

/// Pause measured from creation to drop.
pub struct PauseScope<'a> {
    tracker: &'a G1PauseTracker,
    start: Instant,
}

impl Drop for PauseScope<'_> {
    fn drop(&mut self) {
        self.tracker.add_pause(self.start, Instant::now());
    }
}
