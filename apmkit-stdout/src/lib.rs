//! Export apmkit harvest data to stdout.
//!
//! Intended for development and debugging: every harvest cycle becomes one
//! JSON line on stdout (or any configured `Write` sink).
//!
//! # Examples
//!
//! ```no_run
//! use apmkit::{SegmentMetadata, TransactionKind};
//!
//! let exporter = apmkit_stdout::HarvestExporter::default();
//! let application = apmkit::Application::builder()
//!     .with_exporter(exporter)
//!     .build("example")
//!     .unwrap();
//!
//! let mut txn = application.begin_transaction(TransactionKind::Web, "GET /");
//! let segment = txn.push_segment(SegmentMetadata::function("handler")).unwrap();
//! txn.pop_segment(segment).unwrap();
//! txn.close().unwrap();
//!
//! // Harvests are now written to stdout:
//! //
//! // {"app":{"name":"example","hostname":"dev","pid":4242,"agentVersion":"0.1..
//! application.shutdown().unwrap();
//! ```
#![warn(missing_debug_implementations, missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod exporter;
mod transform;

pub use exporter::{HarvestExporter, HarvestExporterBuilder};
pub use transform::HarvestData;
