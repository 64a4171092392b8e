//! Harvest exporters
//!
//! The exporter is the pluggable collaborator behind an application:
//! aggregation happens in-process, and whatever sampling policy, wire
//! protocol or storage a deployment wants attaches here.
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::env;
use std::fmt::Debug;
use std::time::SystemTime;

use crate::error::ExportResult;
use crate::sampler::SampledValue;
use crate::stats::{MetricName, TimeStats};
use crate::transaction::FinishedTransaction;

/// Immutable identity attached to every harvest payload.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct AppInfo {
    /// The registered application name.
    pub name: String,
    /// Host the process runs on.
    pub hostname: String,
    /// OS assigned process id.
    pub pid: u32,
    /// Version of this crate.
    pub agent_version: &'static str,
}

impl AppInfo {
    /// Detect process identity for the named application.
    pub(crate) fn detect(name: &str) -> Self {
        AppInfo {
            name: name.to_string(),
            hostname: env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            pid: std::process::id(),
            agent_version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Everything one harvest cycle ships out of the process.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct HarvestPayload {
    /// Identity of the reporting application.
    pub app_info: AppInfo,
    /// Start of the aggregation period.
    pub period_start: SystemTime,
    /// End of the aggregation period.
    pub period_end: SystemTime,
    /// Aggregated metric table for the period.
    pub metrics: HashMap<MetricName, TimeStats>,
    /// Values polled from registered samplers at harvest time.
    pub samples: Vec<SampledValue>,
    /// Transactions recorded in the period.
    pub transaction_count: u64,
    /// Transactions reaped or dropped unclosed in the period.
    pub abandoned_transaction_count: u64,
    /// Segments trimmed by the per-transaction limit in the period.
    pub dropped_segment_count: u64,
    /// Attributes dropped by the per-transaction limit in the period.
    pub dropped_attribute_count: u64,
    /// Slowest retained traces, worst first.
    pub slow_traces: Vec<FinishedTransaction>,
}

/// `HarvestExporter` defines the interface that protocol-specific exporters
/// must implement so that they can be plugged into an application and
/// support sending of harvest data.
///
/// The goal of the interface is to minimize burden of implementation for
/// protocol-dependent exporters. The exporter is expected to be primarily a
/// simple payload encoder and transmitter.
pub trait HarvestExporter: Send + Sync + Debug {
    /// Exports one harvest payload. Protocol exporters that will implement
    /// this function are typically expected to serialize and transmit the
    /// data to the destination.
    ///
    /// This function will never be called concurrently for the same exporter
    /// instance. It can be called again only after the current call returns.
    ///
    /// Any retry logic that is required by the exporter is the
    /// responsibility of the exporter; returning
    /// [`ExportError::Transient`](crate::ExportError::Transient) asks the
    /// application to merge the payload's metrics back for the next cycle.
    fn export(&mut self, payload: HarvestPayload) -> BoxFuture<'static, ExportResult>;

    /// Shuts down the exporter. Called when the application is shut down,
    /// after its final harvest. This is an opportunity for the exporter to
    /// do any cleanup required.
    ///
    /// This function should be called only once for each `HarvestExporter`
    /// instance. After the call to `shutdown`, subsequent calls to `export`
    /// are not allowed and should return an error.
    fn shutdown(&mut self) {}

    /// Set the application identity. Called once at activation, before the
    /// first export.
    fn set_app_info(&mut self, _app_info: &AppInfo) {}
}

/// A harvest exporter that discards every payload.
///
/// Applications built without an explicit exporter use this; aggregation
/// still runs and stays bounded, nothing leaves the process.
#[derive(Debug, Default)]
pub struct NoopHarvestExporter {
    _private: (),
}

impl NoopHarvestExporter {
    /// Create a new noop exporter.
    pub fn new() -> Self {
        NoopHarvestExporter { _private: () }
    }
}

impl HarvestExporter for NoopHarvestExporter {
    fn export(&mut self, _payload: HarvestPayload) -> BoxFuture<'static, ExportResult> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_info_detects_process_identity() {
        let info = AppInfo::detect("checkout");
        assert_eq!(info.name, "checkout");
        assert_eq!(info.pid, std::process::id());
        assert_eq!(info.agent_version, env!("CARGO_PKG_VERSION"));
        assert!(!info.hostname.is_empty());
    }

    #[test]
    fn noop_exporter_accepts_payloads() {
        let mut exporter = NoopHarvestExporter::new();
        let payload = HarvestPayload {
            app_info: AppInfo::detect("noop"),
            period_start: SystemTime::UNIX_EPOCH,
            period_end: SystemTime::UNIX_EPOCH,
            metrics: HashMap::new(),
            samples: Vec::new(),
            transaction_count: 0,
            abandoned_transaction_count: 0,
            dropped_segment_count: 0,
            dropped_attribute_count: 0,
            slow_traces: Vec::new(),
        };
        assert!(futures_executor::block_on(exporter.export(payload)).is_ok());
    }
}
