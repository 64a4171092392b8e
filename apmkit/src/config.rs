//! Application configuration
//!
//! Configuration represents the per-application harvest and limit settings,
//! overrides can be set for the defaults through environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_HARVEST_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_TRACE_THRESHOLD: Duration = Duration::from_secs(2);
const DEFAULT_MAX_TRACES_PER_HARVEST: usize = 5;
const DEFAULT_MAX_SEGMENTS_PER_TRANSACTION: usize = 2048;
const DEFAULT_MAX_ATTRIBUTES_PER_TRANSACTION: usize = 64;
const DEFAULT_MAX_HARVEST_MERGES: u32 = 5;

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Config {
    /// How often the harvest ticker wakes up to aggregate and export.
    pub harvest_interval: Duration,

    /// Age past which an unclosed transaction is reaped and discarded.
    pub transaction_timeout: Duration,

    /// Minimum duration for a finished transaction to be retained as a
    /// slow-trace candidate.
    pub transaction_trace_threshold: Duration,

    /// Upper bound on retained slow traces per harvest cycle.
    pub max_traces_per_harvest: usize,

    /// Upper bound on segment nodes exported per transaction. Pushes past
    /// this still participate in stack discipline but are trimmed from the
    /// exported tree.
    pub max_segments_per_transaction: usize,

    /// Upper bound on custom attributes kept per transaction.
    pub max_attributes_per_transaction: usize,

    /// How many times an unexported metric snapshot may be merged back
    /// before it is discarded.
    pub max_harvest_merges: u32,
}

impl Default for Config {
    /// Create the default configuration, consulting environment overrides.
    fn default() -> Self {
        let mut config = Config {
            harvest_interval: DEFAULT_HARVEST_INTERVAL,
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
            transaction_trace_threshold: DEFAULT_TRACE_THRESHOLD,
            max_traces_per_harvest: DEFAULT_MAX_TRACES_PER_HARVEST,
            max_segments_per_transaction: DEFAULT_MAX_SEGMENTS_PER_TRANSACTION,
            max_attributes_per_transaction: DEFAULT_MAX_ATTRIBUTES_PER_TRANSACTION,
            max_harvest_merges: DEFAULT_MAX_HARVEST_MERGES,
        };

        if let Some(harvest_secs) = env::var("APMKIT_HARVEST_INTERVAL")
            .ok()
            .and_then(|secs| u64::from_str(&secs).ok())
        {
            config.harvest_interval = Duration::from_secs(harvest_secs);
        }

        if let Some(timeout_secs) = env::var("APMKIT_TRANSACTION_TIMEOUT")
            .ok()
            .and_then(|secs| u64::from_str(&secs).ok())
        {
            config.transaction_timeout = Duration::from_secs(timeout_secs);
        }

        if let Some(threshold_ms) = env::var("APMKIT_TRACE_THRESHOLD_MS")
            .ok()
            .and_then(|millis| u64::from_str(&millis).ok())
        {
            config.transaction_trace_threshold = Duration::from_millis(threshold_ms);
        }

        if let Some(max_segments) = env::var("APMKIT_MAX_SEGMENTS")
            .ok()
            .and_then(|count_limit| usize::from_str(&count_limit).ok())
        {
            config.max_segments_per_transaction = max_segments;
        }

        config
    }
}

impl Config {
    /// Specify the harvest interval.
    pub fn with_harvest_interval(mut self, interval: Duration) -> Self {
        self.harvest_interval = interval;
        self
    }

    /// Specify the age past which unclosed transactions are reaped.
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    /// Specify the slow-trace retention threshold.
    pub fn with_transaction_trace_threshold(mut self, threshold: Duration) -> Self {
        self.transaction_trace_threshold = threshold;
        self
    }

    /// Specify the max number of slow traces retained per harvest.
    pub fn with_max_traces_per_harvest(mut self, max: usize) -> Self {
        self.max_traces_per_harvest = max;
        self
    }

    /// Specify the max number of segment nodes exported per transaction.
    pub fn with_max_segments_per_transaction(mut self, max: usize) -> Self {
        self.max_segments_per_transaction = max;
        self
    }

    /// Specify the max number of custom attributes kept per transaction.
    pub fn with_max_attributes_per_transaction(mut self, max: usize) -> Self {
        self.max_attributes_per_transaction = max;
        self
    }

    /// Specify how many times a failed snapshot may be merged back.
    pub fn with_max_harvest_merges(mut self, max: u32) -> Self {
        self.max_harvest_merges = max;
        self
    }

    /// Check the configuration for values that cannot drive a harvest cycle.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.harvest_interval.is_zero() {
            return Err(ConfigError::InvalidHarvestInterval);
        }
        if self.transaction_timeout.is_zero() {
            return Err(ConfigError::InvalidTransactionTimeout);
        }
        Ok(())
    }
}
