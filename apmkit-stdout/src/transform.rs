use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::Serialize;

use apmkit::{FinishedTransaction, HarvestPayload, KeyValue, SegmentNode, TransactionKind};

/// Transformed harvest data that can be serialized by serde.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestData {
    app: App,
    period_start: Timestamp,
    period_end: Timestamp,
    metrics: Vec<Metric>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    samples: Vec<Sample>,
    transaction_count: u64,
    #[serde(skip_serializing_if = "is_zero")]
    abandoned_transaction_count: u64,
    #[serde(skip_serializing_if = "is_zero")]
    dropped_segment_count: u64,
    #[serde(skip_serializing_if = "is_zero")]
    dropped_attribute_count: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    slow_traces: Vec<TransactionTrace>,
}

impl HarvestData {
    pub(crate) fn new(payload: HarvestPayload, human_readable: bool) -> Self {
        let mut metrics: Vec<Metric> = payload
            .metrics
            .into_iter()
            .map(|(name, stats)| Metric {
                name: name.as_str().to_string(),
                call_count: stats.call_count,
                total_secs: stats.total.as_secs_f64(),
                exclusive_secs: stats.exclusive.as_secs_f64(),
                min_secs: stats.min.as_secs_f64(),
                max_secs: stats.max.as_secs_f64(),
                sum_of_squares: stats.sum_of_squares,
            })
            .collect();
        // HashMap iteration order is arbitrary; keep the output stable.
        metrics.sort_by(|a, b| a.name.cmp(&b.name));

        HarvestData {
            app: App {
                name: payload.app_info.name,
                hostname: payload.app_info.hostname,
                pid: payload.app_info.pid,
                agent_version: payload.app_info.agent_version.to_string(),
            },
            period_start: Timestamp::new(payload.period_start, human_readable),
            period_end: Timestamp::new(payload.period_end, human_readable),
            metrics,
            samples: payload
                .samples
                .into_iter()
                .map(|sample| Sample {
                    name: sample.name.as_str().to_string(),
                    value: sample.value,
                })
                .collect(),
            transaction_count: payload.transaction_count,
            abandoned_transaction_count: payload.abandoned_transaction_count,
            dropped_segment_count: payload.dropped_segment_count,
            dropped_attribute_count: payload.dropped_attribute_count,
            slow_traces: payload
                .slow_traces
                .into_iter()
                .map(|trace| TransactionTrace::new(trace, human_readable))
                .collect(),
        }
    }
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct App {
    name: String,
    hostname: String,
    pid: u32,
    agent_version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Metric {
    name: String,
    call_count: u64,
    total_secs: f64,
    exclusive_secs: f64,
    min_secs: f64,
    max_secs: f64,
    sum_of_squares: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Sample {
    name: String,
    value: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionTrace {
    id: String,
    kind: &'static str,
    name: String,
    start_time: Timestamp,
    end_time: Timestamp,
    duration_secs: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attributes: Vec<Attribute>,
    #[serde(skip_serializing_if = "is_zero")]
    dropped_segment_count: u64,
    #[serde(skip_serializing_if = "is_zero")]
    dropped_attribute_count: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    segments: Vec<Segment>,
}

impl TransactionTrace {
    fn new(trace: FinishedTransaction, human_readable: bool) -> Self {
        TransactionTrace {
            id: trace.id.to_string(),
            kind: match trace.kind {
                TransactionKind::Web => "web",
                TransactionKind::Background => "background",
            },
            name: trace.name,
            start_time: Timestamp::new(trace.start_time, human_readable),
            end_time: Timestamp::new(trace.end_time, human_readable),
            duration_secs: trace.duration.as_secs_f64(),
            attributes: trace.attributes.into_iter().map(Into::into).collect(),
            dropped_segment_count: trace.dropped_segment_count,
            dropped_attribute_count: trace.dropped_attribute_count,
            segments: trace
                .root_segments
                .into_iter()
                .map(|node| Segment::new(node, human_readable))
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Segment {
    name: String,
    kind: String,
    start_time: Timestamp,
    end_time: Timestamp,
    duration_secs: f64,
    exclusive_secs: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    children: Vec<Segment>,
}

impl Segment {
    fn new(node: SegmentNode, human_readable: bool) -> Self {
        Segment {
            name: node.scoped_name,
            kind: node.kind.to_string(),
            start_time: Timestamp::new(node.start_time, human_readable),
            end_time: Timestamp::new(node.end_time, human_readable),
            duration_secs: node.duration.as_secs_f64(),
            exclusive_secs: node.exclusive.as_secs_f64(),
            children: node
                .children
                .into_iter()
                .map(|child| Segment::new(child, human_readable))
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Attribute {
    key: String,
    value: AttributeValue,
}

impl From<KeyValue> for Attribute {
    fn from(kv: KeyValue) -> Self {
        Attribute {
            key: kv.key.to_string(),
            value: kv.value.into(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum AttributeValue {
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
}

impl From<apmkit::Value> for AttributeValue {
    fn from(value: apmkit::Value) -> Self {
        match value {
            apmkit::Value::Bool(v) => AttributeValue::Bool(v),
            apmkit::Value::I64(v) => AttributeValue::I64(v),
            apmkit::Value::F64(v) => AttributeValue::F64(v),
            apmkit::Value::String(v) => AttributeValue::String(v.to_string()),
            other => AttributeValue::String(other.as_str().into_owned()),
        }
    }
}

/// Timestamps serialize as unix nanos by default, or RFC 3339 when the
/// exporter was built with human-readable output.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Timestamp {
    UnixNano(u128),
    HumanReadable(String),
}

impl Timestamp {
    fn new(time: SystemTime, human_readable: bool) -> Self {
        if human_readable {
            let datetime: DateTime<Utc> = time.into();
            Timestamp::HumanReadable(datetime.to_rfc3339())
        } else {
            Timestamp::UnixNano(
                time.duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos(),
            )
        }
    }
}
