//! Trace segments
//!
//! A segment is one timed sub-operation inside a transaction: a function
//! call, a database query, an external request or a cache lookup. Segments
//! nest through the transaction's open stack and end up as a tree of
//! [`SegmentNode`]s on the finished transaction.

use std::fmt;
use std::time::{Duration, SystemTime};

use url::Url;

use crate::error::ValidationError;

/// The kind of work a segment measures.
///
/// The set of kinds is closed. Descriptors for each kind (rollup metric,
/// metadata validator) are frozen into the segment registry when the first
/// application activates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    /// A timed function or code block.
    Function,
    /// A database query.
    Database,
    /// An outbound call to another service.
    External,
    /// A cache operation.
    Memcache,
}

impl SegmentKind {
    /// All kinds, in registry order.
    pub const ALL: [SegmentKind; 4] = [
        SegmentKind::Function,
        SegmentKind::Database,
        SegmentKind::External,
        SegmentKind::Memcache,
    ];

    /// The metric namespace for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentKind::Function => "Function",
            SegmentKind::Database => "Database",
            SegmentKind::External => "External",
            SegmentKind::Memcache => "Memcache",
        }
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific segment metadata, validated when the segment is pushed.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SegmentMetadata {
    /// A named function or code block.
    Function {
        /// Name recorded as `Function/{name}`.
        name: String,
    },
    /// A database query. The first keyword of the query becomes the
    /// operation for metric naming.
    Database {
        /// The query text.
        query: String,
    },
    /// An outbound request. The url must be absolute and carry a host.
    External {
        /// Target url of the request.
        url: String,
    },
    /// A cache operation keyed by the cache key.
    Memcache {
        /// The cache key.
        key: String,
    },
}

impl SegmentMetadata {
    /// A `Function` segment for the named code block.
    pub fn function(name: impl Into<String>) -> Self {
        SegmentMetadata::Function { name: name.into() }
    }

    /// A `Database` segment for the given query text.
    pub fn database(query: impl Into<String>) -> Self {
        SegmentMetadata::Database {
            query: query.into(),
        }
    }

    /// An `External` segment for the given target url.
    pub fn external(url: impl Into<String>) -> Self {
        SegmentMetadata::External { url: url.into() }
    }

    /// A `Memcache` segment for the given cache key.
    pub fn memcache(key: impl Into<String>) -> Self {
        SegmentMetadata::Memcache { key: key.into() }
    }

    /// The kind carried by this metadata.
    pub fn kind(&self) -> SegmentKind {
        match self {
            SegmentMetadata::Function { .. } => SegmentKind::Function,
            SegmentMetadata::Database { .. } => SegmentKind::Database,
            SegmentMetadata::External { .. } => SegmentKind::External,
            SegmentMetadata::Memcache { .. } => SegmentKind::Memcache,
        }
    }
}

/// Validate `Function` metadata and render its scoped metric name.
pub(crate) fn validate_function(metadata: &SegmentMetadata) -> Result<String, ValidationError> {
    match metadata {
        SegmentMetadata::Function { name } if !name.trim().is_empty() => {
            Ok(format!("Function/{}", name.trim()))
        }
        _ => Err(ValidationError::EmptyName(SegmentKind::Function)),
    }
}

/// Validate `Database` metadata and render its scoped metric name.
pub(crate) fn validate_database(metadata: &SegmentMetadata) -> Result<String, ValidationError> {
    match metadata {
        SegmentMetadata::Database { query } if !query.trim().is_empty() => {
            Ok(format!("Database/{}", sql_operation(query)))
        }
        _ => Err(ValidationError::EmptyQuery),
    }
}

/// Validate `External` metadata and render its scoped metric name.
pub(crate) fn validate_external(metadata: &SegmentMetadata) -> Result<String, ValidationError> {
    let url = match metadata {
        SegmentMetadata::External { url } => url,
        _ => return Err(ValidationError::InvalidUrl("not external metadata".into())),
    };
    let parsed = Url::parse(url).map_err(|err| ValidationError::InvalidUrl(err.to_string()))?;
    match parsed.host_str() {
        Some(host) => Ok(format!("External/{}", host)),
        None => Err(ValidationError::InvalidUrl(format!(
            "url has no host: {}",
            url
        ))),
    }
}

/// Validate `Memcache` metadata and render its scoped metric name.
///
/// Only the key class (the key up to the first `:`, `/` or space) goes into
/// the metric name, keeping metric cardinality bounded.
pub(crate) fn validate_memcache(metadata: &SegmentMetadata) -> Result<String, ValidationError> {
    match metadata {
        SegmentMetadata::Memcache { key } if !key.trim().is_empty() => {
            let class = key
                .trim()
                .split([':', '/', ' '])
                .next()
                .unwrap_or_default();
            Ok(format!("Memcache/{}", class))
        }
        _ => Err(ValidationError::EmptyKey),
    }
}

/// Extract the leading SQL keyword of a query, lowercased, for metric
/// naming. Unrecognized keywords collapse to `other`.
fn sql_operation(query: &str) -> &'static str {
    const OPERATIONS: [&str; 14] = [
        "select", "insert", "update", "delete", "create", "drop", "alter", "call", "show", "set",
        "exec", "execute", "commit", "rollback",
    ];
    let first = query
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_start_matches('(');
    OPERATIONS
        .iter()
        .find(|op| op.eq_ignore_ascii_case(first))
        .copied()
        .unwrap_or("other")
}

/// One node of a finished transaction's segment tree.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct SegmentNode {
    /// The kind of work this node measured.
    pub kind: SegmentKind,

    /// The metadata the segment was pushed with.
    pub metadata: SegmentMetadata,

    /// Scoped metric name rendered at validation time, e.g.
    /// `Database/select`.
    pub scoped_name: String,

    /// When the segment was pushed.
    pub start_time: SystemTime,

    /// When the segment was popped (or force-finished at close).
    pub end_time: SystemTime,

    /// Wall time between push and pop. Never negative, even under clock
    /// slew.
    pub duration: Duration,

    /// Duration minus the summed duration of direct children, floored at
    /// zero.
    pub exclusive: Duration,

    /// Child segments, in push order.
    pub children: Vec<SegmentNode>,
}
