//! # Transaction
//!
//! A `Transaction` is the unit of recording: one web request or one
//! background job. Instrumented code pushes and pops trace segments around
//! interesting operations, forming a tree through a current-segment stack.
//! Closing the transaction stamps the end time, settles per-node durations
//! and exclusive times, and hands the assembled result to the application's
//! aggregation sink.
//!
//! Transactions are deliberately not `Send`: each one belongs to the thread
//! that began it, so segment pushes and pops need no locking. The shared
//! aggregation engine is only touched once, at close.

use std::marker::PhantomData;
use std::time::{Duration, SystemTime};

use crate::application::Application;
use crate::error::{Error, StateError};
use crate::ids::TransactionId;
use crate::registry::SegmentRegistry;
use crate::segment::{SegmentKind, SegmentMetadata, SegmentNode};
use crate::stats::MetricWorkarea;
use crate::KeyValue;

/// The kind of work a transaction measures. Decides the rollup metric
/// namespace: `WebTransaction/...` for web requests, `OtherTransaction/...`
/// for background jobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    /// A web request.
    Web,
    /// A background job.
    Background,
}

impl TransactionKind {
    /// The rollup metric namespace for this kind.
    pub fn rollup_prefix(&self) -> &'static str {
        match self {
            TransactionKind::Web => "WebTransaction",
            TransactionKind::Background => "OtherTransaction",
        }
    }
}

/// Token for one pushed segment, consumed by [`Transaction::pop_segment`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentHandle {
    transaction: TransactionId,
    index: usize,
}

/// One segment in the transaction's arena. Parents always precede their
/// children, so any index prefix of the arena is closed under parents.
#[derive(Debug)]
struct ArenaNode {
    kind: SegmentKind,
    metadata: SegmentMetadata,
    scoped_name: String,
    start_time: SystemTime,
    end_time: Option<SystemTime>,
    parent: Option<usize>,
    children: Vec<usize>,
}

#[derive(Debug)]
struct ActiveData {
    kind: TransactionKind,
    name: String,
    start_time: SystemTime,
    nodes: Vec<ArenaNode>,
    open_stack: Vec<usize>,
    attributes: Vec<KeyValue>,
    dropped_attribute_count: u64,
    dropped_segment_count: u64,
}

/// An in-progress web request or background job.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    data: Option<ActiveData>,
    application: Application,
    registry: &'static SegmentRegistry,
    max_segments: usize,
    max_attributes: usize,
    recording: bool,
    // Pin the transaction to its opening thread.
    _not_send: PhantomData<*const ()>,
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        kind: TransactionKind,
        name: String,
        application: Application,
        registry: &'static SegmentRegistry,
        max_segments: usize,
        max_attributes: usize,
        recording: bool,
    ) -> Self {
        Transaction {
            id,
            data: Some(ActiveData {
                kind,
                name,
                start_time: crate::time::now(),
                nodes: Vec::new(),
                open_stack: Vec::new(),
                attributes: Vec::new(),
                dropped_attribute_count: 0,
                dropped_segment_count: 0,
            }),
            application,
            registry,
            max_segments,
            max_attributes,
            recording,
            _not_send: PhantomData,
        }
    }

    /// Operate on a mutable reference to the live transaction data
    fn with_data<T, F>(&mut self, f: F) -> Option<T>
    where
        F: FnOnce(&mut ActiveData) -> T,
    {
        self.data.as_mut().map(f)
    }

    /// The id assigned when the transaction was begun.
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns `true` while the transaction is open and will be recorded at
    /// close. Always `false` for transactions begun after shutdown.
    pub fn is_recording(&self) -> bool {
        self.recording && self.data.is_some()
    }

    /// The transaction name as it stands right now.
    pub fn name(&self) -> Option<&str> {
        self.data.as_ref().map(|data| data.name.as_str())
    }

    /// Rename the transaction. Web frameworks resolve route names late, so
    /// this stays available until close.
    pub fn set_name<T>(&mut self, new_name: T)
    where
        T: Into<String>,
    {
        self.with_data(|data| data.name = new_name.into());
    }

    /// Attach a custom attribute, dropping it (and counting the drop) past
    /// the configured limit.
    pub fn add_attribute(&mut self, attribute: KeyValue) {
        let limit = self.max_attributes;
        self.with_data(|data| {
            if data.attributes.len() < limit {
                data.attributes.push(attribute);
            } else {
                data.dropped_attribute_count += 1;
            }
        });
    }

    /// Open a segment under the current stack top.
    ///
    /// The metadata is validated against the frozen registry entry for its
    /// kind before anything is pushed; a validation failure leaves the stack
    /// untouched. Pushes past the segment limit still go on the stack (so
    /// pops stay honest) but are trimmed from the exported tree and counted.
    pub fn push_segment(&mut self, metadata: SegmentMetadata) -> Result<SegmentHandle, Error> {
        let registry = self.registry;
        let limit = self.max_segments;
        let data = match self.data.as_mut() {
            Some(data) => data,
            None => return Err(StateError::AlreadyClosed.into()),
        };

        let scoped_name = registry.validate(&metadata)?;

        let index = data.nodes.len();
        if index >= limit {
            data.dropped_segment_count += 1;
        }
        let parent = data.open_stack.last().copied();
        data.nodes.push(ArenaNode {
            kind: metadata.kind(),
            metadata,
            scoped_name,
            start_time: crate::time::now(),
            end_time: None,
            parent,
            children: Vec::new(),
        });
        if let Some(parent) = parent {
            data.nodes[parent].children.push(index);
        }
        data.open_stack.push(index);

        Ok(SegmentHandle {
            transaction: self.id,
            index,
        })
    }

    /// Finish the segment named by `handle`, stamping its end time once.
    ///
    /// Only the current top of the stack may be popped. A failed pop leaves
    /// the stack exactly as it was.
    pub fn pop_segment(&mut self, handle: SegmentHandle) -> Result<(), StateError> {
        if handle.transaction != self.id {
            return Err(StateError::MismatchedTransaction);
        }
        let data = match self.data.as_mut() {
            Some(data) => data,
            None => return Err(StateError::AlreadyClosed),
        };

        if data.nodes[handle.index].end_time.is_some() {
            return Err(StateError::SegmentFinished);
        }
        // An unfinished segment is on the stack, so `last` cannot miss here.
        let expected = match data.open_stack.last() {
            Some(&top) => top,
            None => return Err(StateError::SegmentFinished),
        };
        if expected != handle.index {
            return Err(StateError::OutOfOrderPop {
                expected,
                got: handle.index,
            });
        }

        data.open_stack.pop();
        data.nodes[handle.index].end_time = Some(crate::time::now());
        Ok(())
    }

    /// Close the transaction.
    ///
    /// The first close force-finishes any still-open segments, stamps the
    /// transaction end time and hands the assembled result to the
    /// application. Every later close returns [`StateError::AlreadyClosed`]
    /// with no side effects.
    pub fn close(&mut self) -> Result<(), StateError> {
        let mut data = match self.data.take() {
            Some(data) => data,
            None => return Err(StateError::AlreadyClosed),
        };

        let end_time = crate::time::now();
        while let Some(index) = data.open_stack.pop() {
            let node = &mut data.nodes[index];
            if node.end_time.is_none() {
                node.end_time = Some(end_time);
            }
        }

        if !self.recording {
            return Ok(());
        }

        let finished = assemble(self.id, data, end_time, self.max_segments);
        self.application.finish_transaction(finished);
        Ok(())
    }
}

impl Drop for Transaction {
    /// Discard an unclosed transaction instead of recording partial data.
    fn drop(&mut self) {
        if self.data.take().is_some() && self.recording {
            self.application.discard_transaction(self.id);
        }
    }
}

/// Settle timings and build the finished tree from the arena.
fn assemble(
    id: TransactionId,
    data: ActiveData,
    end_time: SystemTime,
    max_segments: usize,
) -> FinishedTransaction {
    let node_count = data.nodes.len();
    let keep = max_segments.min(node_count);

    let mut durations = vec![Duration::ZERO; node_count];
    let mut child_time = vec![Duration::ZERO; node_count];
    // Children sit after their parents in the arena, so a reverse pass sees
    // every child before the parent it feeds.
    for index in (0..node_count).rev() {
        let node = &data.nodes[index];
        let node_end = node.end_time.unwrap_or(end_time);
        let duration = node_end
            .duration_since(node.start_time)
            .unwrap_or_default();
        durations[index] = duration;
        if let Some(parent) = node.parent {
            child_time[parent] = child_time[parent].saturating_add(duration);
        }
    }

    fn build(
        nodes: &[ArenaNode],
        durations: &[Duration],
        child_time: &[Duration],
        keep: usize,
        index: usize,
    ) -> SegmentNode {
        let node = &nodes[index];
        SegmentNode {
            kind: node.kind,
            metadata: node.metadata.clone(),
            scoped_name: node.scoped_name.clone(),
            start_time: node.start_time,
            end_time: node.end_time.unwrap_or(node.start_time),
            duration: durations[index],
            exclusive: durations[index].saturating_sub(child_time[index]),
            children: node
                .children
                .iter()
                .filter(|&&child| child < keep)
                .map(|&child| build(nodes, durations, child_time, keep, child))
                .collect(),
        }
    }

    let root_segments = (0..keep)
        .filter(|&index| data.nodes[index].parent.is_none())
        .map(|index| build(&data.nodes, &durations, &child_time, keep, index))
        .collect();

    FinishedTransaction {
        id,
        kind: data.kind,
        name: data.name,
        start_time: data.start_time,
        end_time,
        duration: end_time.duration_since(data.start_time).unwrap_or_default(),
        attributes: data.attributes,
        root_segments,
        dropped_segment_count: data.dropped_segment_count,
        dropped_attribute_count: data.dropped_attribute_count,
    }
}

/// The immutable result of closing a transaction.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct FinishedTransaction {
    /// Id assigned at begin.
    pub id: TransactionId,
    /// Web or background.
    pub kind: TransactionKind,
    /// Name at close time.
    pub name: String,
    /// When the transaction was begun.
    pub start_time: SystemTime,
    /// When the transaction was closed.
    pub end_time: SystemTime,
    /// Wall time between begin and close. Never negative, even under clock
    /// slew.
    pub duration: Duration,
    /// Custom attributes, in insertion order.
    pub attributes: Vec<KeyValue>,
    /// Top-level segments, in push order.
    pub root_segments: Vec<SegmentNode>,
    /// Segments pushed past the configured limit and trimmed from the tree.
    pub dropped_segment_count: u64,
    /// Attributes dropped past the configured limit.
    pub dropped_attribute_count: u64,
}

/// Derive the metric workarea for a finished transaction: the transaction
/// rollup plus scoped and rollup metrics for every node in the tree.
pub(crate) fn derive_metrics(
    finished: &FinishedTransaction,
    registry: &SegmentRegistry,
) -> MetricWorkarea {
    fn record_node(node: &SegmentNode, registry: &SegmentRegistry, workarea: &mut MetricWorkarea) {
        workarea
            .entry(node.scoped_name.clone().into())
            .or_default()
            .record(node.duration, node.exclusive);
        if let Some(rollup) = registry.descriptor(node.kind).rollup {
            workarea
                .entry(rollup.into())
                .or_default()
                .record(node.duration, node.exclusive);
        }
        for child in &node.children {
            record_node(child, registry, workarea);
        }
    }

    let mut workarea = MetricWorkarea::new();

    let child_time: Duration = finished
        .root_segments
        .iter()
        .map(|node| node.duration)
        .sum();
    let rollup = format!("{}/{}", finished.kind.rollup_prefix(), finished.name);
    workarea
        .entry(rollup.into())
        .or_default()
        .record(
            finished.duration,
            finished.duration.saturating_sub(child_time),
        );

    for node in &finished.root_segments {
        record_node(node, registry, &mut workarea);
    }
    workarea
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ValidationError;
    use crate::in_memory_exporter::InMemoryHarvestExporterBuilder;
    use crate::segment::SegmentMetadata;
    use std::time::Duration;

    fn test_application(name: &str) -> (Application, crate::InMemoryHarvestExporter) {
        let exporter = InMemoryHarvestExporterBuilder::new().build();
        let application = Application::builder()
            .with_config(
                Config::default()
                    .with_harvest_interval(Duration::from_secs(3600))
                    .with_transaction_trace_threshold(Duration::ZERO),
            )
            .with_exporter(exporter.clone())
            .build(name)
            .expect("valid test application");
        (application, exporter)
    }

    #[test]
    fn lifo_push_pop_succeeds() {
        let (application, _exporter) = test_application("txn-lifo");
        let mut txn = application.begin_transaction(TransactionKind::Web, "checkout");

        let a = txn.push_segment(SegmentMetadata::function("a")).unwrap();
        let b = txn.push_segment(SegmentMetadata::function("b")).unwrap();
        assert_eq!(txn.pop_segment(b), Ok(()));
        assert_eq!(txn.pop_segment(a), Ok(()));
        assert_eq!(txn.close(), Ok(()));
        application.shutdown().unwrap();
    }

    #[test]
    fn out_of_order_pop_leaves_stack_untouched() {
        let (application, _exporter) = test_application("txn-out-of-order");
        let mut txn = application.begin_transaction(TransactionKind::Web, "checkout");

        let a = txn.push_segment(SegmentMetadata::function("a")).unwrap();
        let b = txn.push_segment(SegmentMetadata::function("b")).unwrap();
        assert!(matches!(
            txn.pop_segment(a),
            Err(StateError::OutOfOrderPop { .. })
        ));
        // The failed pop must not disturb the stack: B then A still works.
        assert_eq!(txn.pop_segment(b), Ok(()));
        assert_eq!(txn.pop_segment(a), Ok(()));
        txn.close().unwrap();
        application.shutdown().unwrap();
    }

    #[test]
    fn popping_a_finished_segment_fails() {
        let (application, _exporter) = test_application("txn-refinish");
        let mut txn = application.begin_transaction(TransactionKind::Background, "job");

        let a = txn.push_segment(SegmentMetadata::function("a")).unwrap();
        txn.pop_segment(a).unwrap();
        assert_eq!(txn.pop_segment(a), Err(StateError::SegmentFinished));
        txn.close().unwrap();
        application.shutdown().unwrap();
    }

    #[test]
    fn close_succeeds_exactly_once() {
        let (application, _exporter) = test_application("txn-close-once");
        let mut txn = application.begin_transaction(TransactionKind::Web, "checkout");
        assert_eq!(txn.close(), Ok(()));
        assert_eq!(txn.close(), Err(StateError::AlreadyClosed));
        assert_eq!(txn.close(), Err(StateError::AlreadyClosed));
        application.shutdown().unwrap();
    }

    #[test]
    fn operations_after_close_are_rejected() {
        let (application, _exporter) = test_application("txn-after-close");
        let mut txn = application.begin_transaction(TransactionKind::Web, "checkout");
        let a = txn.push_segment(SegmentMetadata::function("a")).unwrap();
        txn.close().unwrap();

        assert!(matches!(
            txn.push_segment(SegmentMetadata::function("b")),
            Err(Error::State(StateError::AlreadyClosed))
        ));
        assert_eq!(txn.pop_segment(a), Err(StateError::AlreadyClosed));
        assert!(!txn.is_recording());
        application.shutdown().unwrap();
    }

    #[test]
    fn validation_failure_pushes_nothing() {
        let (application, _exporter) = test_application("txn-validation");
        let mut txn = application.begin_transaction(TransactionKind::Web, "checkout");

        let err = txn
            .push_segment(SegmentMetadata::database("   "))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::EmptyQuery)
        ));

        // The stack is untouched: the next push is a root segment.
        let a = txn.push_segment(SegmentMetadata::function("a")).unwrap();
        txn.pop_segment(a).unwrap();
        txn.close().unwrap();
        application.shutdown().unwrap();
    }

    #[test]
    fn handles_do_not_cross_transactions() {
        let (application, _exporter) = test_application("txn-foreign-handle");
        let mut first = application.begin_transaction(TransactionKind::Web, "one");
        let mut second = application.begin_transaction(TransactionKind::Web, "two");

        let foreign = first.push_segment(SegmentMetadata::function("a")).unwrap();
        let _own = second.push_segment(SegmentMetadata::function("b")).unwrap();
        assert_eq!(
            second.pop_segment(foreign),
            Err(StateError::MismatchedTransaction)
        );

        first.close().unwrap();
        second.close().unwrap();
        application.shutdown().unwrap();
    }

    #[test]
    fn attribute_limit_counts_drops() {
        let (application, _exporter) = test_application("txn-attr-limit");
        let mut txn = application.begin_transaction(TransactionKind::Web, "checkout");
        for i in 0..70 {
            txn.add_attribute(KeyValue::new(format!("attr{i}"), i as i64));
        }
        let data = txn.data.as_ref().unwrap();
        assert_eq!(data.attributes.len(), 64);
        assert_eq!(data.dropped_attribute_count, 6);
        txn.close().unwrap();
        application.shutdown().unwrap();
    }

    #[test]
    fn close_force_finishes_open_segments() {
        let (application, exporter) = test_application("txn-force-finish");
        let mut txn = application.begin_transaction(TransactionKind::Web, "checkout");
        let _a = txn.push_segment(SegmentMetadata::function("a")).unwrap();
        let _b = txn.push_segment(SegmentMetadata::function("b")).unwrap();
        txn.close().unwrap();

        application.force_harvest().unwrap();
        let harvests = exporter.get_harvests();
        let trace = &harvests[0].slow_traces[0];
        let a = &trace.root_segments[0];
        let b = &a.children[0];
        assert!(a.start_time <= a.end_time);
        assert!(b.start_time <= b.end_time);
        assert!(b.end_time <= trace.end_time);
        application.shutdown().unwrap();
    }

    #[test]
    fn segment_overflow_trims_tree_but_keeps_discipline() {
        let exporter = InMemoryHarvestExporterBuilder::new().build();
        let application = Application::builder()
            .with_config(
                Config::default()
                    .with_harvest_interval(Duration::from_secs(3600))
                    .with_transaction_trace_threshold(Duration::ZERO)
                    .with_max_segments_per_transaction(2),
            )
            .with_exporter(exporter.clone())
            .build("txn-overflow")
            .unwrap();

        let mut txn = application.begin_transaction(TransactionKind::Web, "checkout");
        let a = txn.push_segment(SegmentMetadata::function("a")).unwrap();
        let b = txn.push_segment(SegmentMetadata::function("b")).unwrap();
        let c = txn.push_segment(SegmentMetadata::function("c")).unwrap();

        // Over-limit segments still obey the stack.
        assert!(matches!(
            txn.pop_segment(b),
            Err(StateError::OutOfOrderPop { .. })
        ));
        txn.pop_segment(c).unwrap();
        txn.pop_segment(b).unwrap();
        txn.pop_segment(a).unwrap();
        txn.close().unwrap();

        application.force_harvest().unwrap();
        let harvests = exporter.get_harvests();
        let trace = &harvests[0].slow_traces[0];
        assert_eq!(trace.dropped_segment_count, 1);
        let a = &trace.root_segments[0];
        assert_eq!(a.scoped_name, "Function/a");
        assert_eq!(a.children.len(), 1);
        // c was trimmed.
        assert!(a.children[0].children.is_empty());
        application.shutdown().unwrap();
    }

    #[test]
    fn nested_scenario_records_tree_with_sane_timestamps() {
        let (application, exporter) = test_application("txn-scenario");
        let mut txn = application.begin_transaction(TransactionKind::Web, "checkout");

        let a = txn.push_segment(SegmentMetadata::function("A")).unwrap();
        let b = txn
            .push_segment(SegmentMetadata::database("SELECT * FROM carts"))
            .unwrap();
        std::thread::sleep(Duration::from_millis(2));
        txn.pop_segment(b).unwrap();
        txn.pop_segment(a).unwrap();
        txn.close().unwrap();

        application.force_harvest().unwrap();
        let harvests = exporter.get_harvests();
        let trace = &harvests[0].slow_traces[0];

        assert_eq!(trace.root_segments.len(), 1);
        let node_a = &trace.root_segments[0];
        assert_eq!(node_a.scoped_name, "Function/A");
        assert_eq!(node_a.children.len(), 1);
        let node_b = &node_a.children[0];
        assert_eq!(node_b.scoped_name, "Database/select");
        assert!(node_b.duration >= Duration::from_millis(2));
        assert!(node_a.duration >= node_b.duration);
        assert!(node_a.exclusive <= node_a.duration);
        assert!(trace.start_time <= node_a.start_time);
        application.shutdown().unwrap();
    }

    #[test]
    fn derive_metrics_records_scoped_rollup_and_transaction() {
        let registry = SegmentRegistry::freeze();
        let (application, exporter) = test_application("txn-derive");
        let mut txn = application.begin_transaction(TransactionKind::Web, "checkout");
        let a = txn
            .push_segment(SegmentMetadata::database("SELECT 1"))
            .unwrap();
        txn.pop_segment(a).unwrap();
        let b = txn
            .push_segment(SegmentMetadata::external("https://pay.example.com/c"))
            .unwrap();
        txn.pop_segment(b).unwrap();
        txn.close().unwrap();

        application.force_harvest().unwrap();
        let harvests = exporter.get_harvests();
        let workarea = derive_metrics(&harvests[0].slow_traces[0], registry);

        assert!(workarea.contains_key("WebTransaction/checkout"));
        assert!(workarea.contains_key("Database/select"));
        assert!(workarea.contains_key("Database/all"));
        assert!(workarea.contains_key("External/pay.example.com"));
        assert!(workarea.contains_key("External/all"));
        assert_eq!(workarea["Database/all"].call_count, 1);
        application.shutdown().unwrap();
    }
}
