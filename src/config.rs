//! Configuration module for driftwatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::time::Duration;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file (default: "driftwatch.db")
    pub db_path: String,
    /// Polling period per endpoint in seconds (default: 60)
    pub poll_interval_secs: u64,
    /// Per-probe timeout in seconds (default: 5, capped at 10)
    pub probe_timeout_secs: u64,
    /// Deadline for one cycle's store/delivery phase in seconds (default: 30)
    pub cycle_deadline_secs: u64,
    /// Consecutive failures before the one-time timeout warning (default: 10)
    pub warn_threshold: u64,
    /// Consecutive failures before giving up on an endpoint (default: 10080,
    /// a week of minute ticks)
    pub abandon_threshold: u64,
    /// Ring-buffer depth for population samples (default: 60)
    pub sample_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "driftwatch.db".to_string(),
            poll_interval_secs: 60,
            probe_timeout_secs: 5,
            cycle_deadline_secs: 30,
            warn_threshold: 10,
            abandon_threshold: 10080,
            sample_depth: 60,
        }
    }
}

impl Config {
    /// Load configuration from `DRIFTWATCH_*` environment variables.
    /// Malformed values fall back to their defaults with a warning.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(path) = env::var("DRIFTWATCH_DB_PATH") {
            cfg.db_path = path;
        }

        read_u64("DRIFTWATCH_POLL_INTERVAL_SECS", &mut cfg.poll_interval_secs);
        read_u64("DRIFTWATCH_PROBE_TIMEOUT_SECS", &mut cfg.probe_timeout_secs);
        read_u64("DRIFTWATCH_CYCLE_DEADLINE_SECS", &mut cfg.cycle_deadline_secs);
        read_u64("DRIFTWATCH_WARN_THRESHOLD", &mut cfg.warn_threshold);
        read_u64("DRIFTWATCH_ABANDON_THRESHOLD", &mut cfg.abandon_threshold);

        if let Ok(depth_str) = env::var("DRIFTWATCH_SAMPLE_DEPTH") {
            match depth_str.parse() {
                Ok(depth) => cfg.sample_depth = depth,
                Err(_) => tracing::warn!(
                    "Ignoring malformed DRIFTWATCH_SAMPLE_DEPTH: {}",
                    depth_str
                ),
            }
        }

        cfg.clamp();
        cfg
    }

    /// Enforce floors and ceilings on the loaded values.
    fn clamp(&mut self) {
        if self.poll_interval_secs == 0 {
            self.poll_interval_secs = 60;
        }
        if self.probe_timeout_secs == 0 {
            self.probe_timeout_secs = 5;
        }
        // A probe slower than this would eat the whole cycle budget
        if self.probe_timeout_secs > 10 {
            tracing::warn!(
                "Probe timeout {}s too large, capping at 10s",
                self.probe_timeout_secs
            );
            self.probe_timeout_secs = 10;
        }
        if self.cycle_deadline_secs == 0 {
            self.cycle_deadline_secs = 30;
        }
        if self.warn_threshold == 0 {
            self.warn_threshold = 10;
        }
        if self.abandon_threshold <= self.warn_threshold {
            tracing::warn!(
                "Abandon threshold {} not above warn threshold {}, using default",
                self.abandon_threshold,
                self.warn_threshold
            );
            self.abandon_threshold = 10080;
        }
        if self.sample_depth == 0 {
            self.sample_depth = 60;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.cycle_deadline_secs)
    }
}

fn read_u64(var: &str, into: &mut u64) {
    if let Ok(s) = env::var(var) {
        match s.parse() {
            Ok(v) => *into = v,
            Err(_) => tracing::warn!("Ignoring malformed {}: {}", var, s),
        }
    }
}
