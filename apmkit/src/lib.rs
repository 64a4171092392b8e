//! # apmkit
//!
//! An in-process APM instrumentation core. A process registers one or more
//! named applications; each application hands out transactions (web or
//! background) on request. A transaction owns a stack-shaped tree of trace
//! segments (function, database, external, memcache) that instrumented code
//! pushes and pops around interesting operations. Closing a transaction
//! settles per-node durations and exclusive times, aggregates metric
//! statistics, and forwards the assembled trace to the application's
//! harvest exporter.
//!
//! Transmission, trace sampling policy and storage are pluggable behind the
//! [`HarvestExporter`] seam; the core guarantees structural integrity (LIFO
//! segment discipline, single close, frozen segment-kind registry) and
//! thread safety.
//!
//! # Example
//!
//! ```
//! use apmkit::{Config, SegmentMetadata, TransactionKind};
//!
//! let application = apmkit::register("checkout", Config::default()).unwrap();
//!
//! let mut txn = application.begin_transaction(TransactionKind::Web, "GET /cart");
//! let outer = txn.push_segment(SegmentMetadata::function("load_cart")).unwrap();
//! let query = txn
//!     .push_segment(SegmentMetadata::database("SELECT * FROM carts WHERE id = $1"))
//!     .unwrap();
//! txn.pop_segment(query).unwrap();
//! txn.pop_segment(outer).unwrap();
//! txn.close().unwrap();
//!
//! application.shutdown().unwrap();
//! ```
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![allow(clippy::needless_doctest_main)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]
#![cfg_attr(test, deny(warnings))]

pub mod application;
mod common;
pub mod config;
pub mod error;
pub mod export;
mod harvest;
pub mod ids;
mod in_memory_exporter;
mod internal_logging;
pub mod registry;
pub mod sampler;
pub mod segment;
pub mod stats;
pub mod transaction;

pub use application::{Application, ApplicationBuilder};
pub use common::{Key, KeyValue, StringValue, Value};
pub use config::Config;
pub use error::{
    ConfigError, Error, ExportError, ExportResult, HarvestError, StateError, ValidationError,
};
pub use export::{AppInfo, HarvestExporter, HarvestPayload, NoopHarvestExporter};
pub use ids::{IdGenerator, RandomIdGenerator, TransactionId};
pub use in_memory_exporter::{InMemoryHarvestExporter, InMemoryHarvestExporterBuilder};
pub use registry::SegmentRegistry;
pub use sampler::{MetricSampler, SampledValue, UptimeSampler};
pub use segment::{SegmentKind, SegmentMetadata, SegmentNode};
pub use stats::{MetricName, TimeStats};
pub use transaction::{
    FinishedTransaction, SegmentHandle, Transaction, TransactionKind,
};

/// Register the application with the given name, activating it on the first
/// registration.
///
/// Instrumentation libraries call this from many sites; a repeat
/// registration under a live name returns a clone of the existing handle
/// and the new config is ignored.
pub fn register(name: &str, config: Config) -> Result<Application, error::ConfigError> {
    registry::register(name, config)
}

/// Shut down the application registered under `name`.
///
/// Returns [`HarvestError::AlreadyShutdown`] when no live application is
/// registered under that name.
pub fn shutdown_application(name: &str) -> Result<(), error::HarvestError> {
    registry::shutdown_application(name)
}

/// Helper module for clock access, so the crate reads the wall clock in one
/// place.
pub mod time {
    use std::time::SystemTime;

    /// The current wall-clock time.
    pub fn now() -> SystemTime {
        SystemTime::now()
    }
}

#[cfg(feature = "internal-logs")]
#[doc(hidden)]
pub mod _private {
    pub use tracing::{debug, error, info, warn};
}
