//! Consecutive-failure tracking with escalating thresholds.

/// Event emitted by the tracker when a threshold is crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    /// Endpoint answered again after being past the warn threshold.
    Recovered,
    /// Consecutive failures reached the warn threshold.
    Warn,
    /// Consecutive failures reached the abandon threshold; the endpoint
    /// must be deregistered and re-registered manually to resume.
    Abandon,
}

/// Per-endpoint retry state machine: `Healthy(0)` / `Degraded(n)` /
/// terminal `Abandoned`. Failures count per tick; each threshold fires
/// exactly once per crossing.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    failures: u64,
    warn_threshold: u64,
    abandon_threshold: u64,
    warned: bool,
    abandoned: bool,
}

impl RetryTracker {
    pub fn new(warn_threshold: u64, abandon_threshold: u64) -> Self {
        Self {
            failures: 0,
            warn_threshold,
            abandon_threshold,
            warned: false,
            abandoned: false,
        }
    }

    /// Resume from a persisted failure count after a restart.
    pub fn with_failures(warn_threshold: u64, abandon_threshold: u64, failures: u64) -> Self {
        let mut tracker = Self::new(warn_threshold, abandon_threshold);
        tracker.failures = failures;
        // The warn for an already-degraded endpoint fired before the
        // restart; don't repeat it on the next failure past the threshold.
        tracker.warned = failures >= warn_threshold;
        tracker
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn is_degraded(&self) -> bool {
        self.failures > 0
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    /// A probe succeeded: reset to `Healthy(0)`.
    pub fn record_success(&mut self) -> Option<TrackerEvent> {
        let recovered = self.failures >= self.warn_threshold;
        self.failures = 0;
        self.warned = false;
        if recovered {
            Some(TrackerEvent::Recovered)
        } else {
            None
        }
    }

    /// A probe failed: bump the count and report any threshold crossing.
    pub fn record_failure(&mut self) -> Option<TrackerEvent> {
        if self.abandoned {
            return None;
        }

        self.failures += 1;

        if self.failures >= self.abandon_threshold {
            self.abandoned = true;
            return Some(TrackerEvent::Abandon);
        }

        if self.failures >= self.warn_threshold && !self.warned {
            self.warned = true;
            return Some(TrackerEvent::Warn);
        }

        None
    }
}
