//! # Application
//!
//! An [`Application`] is the process-wide handle for one monitored service.
//! It hands out [`Transaction`]s, aggregates their metrics into a shared
//! stats engine, retains slow traces, and drives the periodic harvest that
//! ships everything to the configured exporter.
//!
//! Handles are cheap to clone and safe to share across threads; all shared
//! state lives behind one `Arc`. Shutting down (explicitly or by dropping
//! the last handle) performs a final harvest and stops the ticker thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::SystemTime;

use crate::config::Config;
use crate::error::{ConfigError, ExportError, HarvestError};
use crate::export::{AppInfo, HarvestExporter, HarvestPayload, NoopHarvestExporter};
use crate::harvest::HarvestTicker;
use crate::ids::{IdGenerator, RandomIdGenerator, TransactionId};
use crate::registry::SegmentRegistry;
use crate::sampler::{self, MetricSampler, UptimeSampler};
use crate::stats::{MetricName, StatsEngine};
use crate::transaction::{derive_metrics, FinishedTransaction, Transaction, TransactionKind};
use crate::{apm_debug, apm_info, apm_warn};

/// Marker metric recorded once per harvest cycle, so a harvest with no
/// transactions is still distinguishable from a silent instance.
const REPORTING_METRIC: MetricName = MetricName::from_static("Instance/Reporting");

/// Handle for one named application.
///
/// Cloning is cheap; every clone drives the same activation. Dropping the
/// last clone shuts the application down implicitly.
#[derive(Clone, Debug)]
pub struct Application {
    inner: Arc<ApplicationInner>,
}

impl Application {
    /// Create a builder for configuring a new application.
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::default()
    }

    /// Open a transaction under this application.
    ///
    /// The transaction is confined to the calling thread. After shutdown
    /// this returns a non-recording transaction whose close discards
    /// silently.
    pub fn begin_transaction(
        &self,
        kind: TransactionKind,
        name: impl Into<String>,
    ) -> Transaction {
        let recording = !self.inner.is_shutdown.load(Ordering::SeqCst);
        let id = self.inner.id_generator.new_transaction_id();
        if recording {
            let mut live = lock(&self.inner.live);
            live.insert(id, crate::time::now());
        }
        Transaction::new(
            id,
            kind,
            name.into(),
            self.clone(),
            self.inner.registry,
            self.inner.config.max_segments_per_transaction,
            self.inner.config.max_attributes_per_transaction,
            recording,
        )
    }

    /// Aggregate one finished transaction.
    ///
    /// Normally invoked by [`Transaction::close`]; also callable directly
    /// with an assembled [`FinishedTransaction`] to replay recorded data.
    pub fn record(&self, finished: FinishedTransaction) {
        let workarea = derive_metrics(&finished, self.inner.registry);
        {
            let mut engine = lock(&self.inner.engine);
            engine.note_dropped_segments(finished.dropped_segment_count);
            engine.note_dropped_attributes(finished.dropped_attribute_count);
            engine.merge_workarea(workarea);
        }

        if finished.duration >= self.inner.config.transaction_trace_threshold {
            let mut slow = lock(&self.inner.slow_traces);
            slow.push(finished);
            slow.sort_by(|a, b| b.duration.cmp(&a.duration));
            slow.truncate(self.inner.config.max_traces_per_harvest);
        }
    }

    /// Run one harvest cycle now, outside the timer, and wait for it.
    pub fn force_harvest(&self) -> Result<(), HarvestError> {
        if self.inner.is_shutdown.load(Ordering::SeqCst) {
            return Err(HarvestError::AlreadyShutdown);
        }
        match self.inner.ticker.get() {
            Some(ticker) => ticker.force_harvest(),
            None => self.inner.run_harvest(),
        }
    }

    /// Shut the application down: final harvest, stop the ticker thread,
    /// shut the exporter down.
    ///
    /// Succeeds exactly once; later calls return
    /// [`HarvestError::AlreadyShutdown`].
    pub fn shutdown(&self) -> Result<(), HarvestError> {
        self.inner.shutdown()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown.load(Ordering::SeqCst)
    }

    /// Sink for [`Transaction::close`]. Transactions that outlived the
    /// liveness timeout were already reaped; their late data is dropped.
    pub(crate) fn finish_transaction(&self, finished: FinishedTransaction) {
        let was_live = lock(&self.inner.live).remove(&finished.id).is_some();
        if !was_live {
            apm_warn!(
                name: "transaction_closed_after_reap",
                app_name = self.inner.app_info.name.as_str(),
                transaction_id = finished.id.to_string()
            );
            return;
        }
        self.record(finished);
    }

    /// Sink for [`Transaction`]'s drop path: the transaction was abandoned
    /// without a close and its partial data is discarded.
    pub(crate) fn discard_transaction(&self, id: TransactionId) {
        let was_live = lock(&self.inner.live).remove(&id).is_some();
        if was_live {
            apm_debug!(
                name: "transaction_discarded",
                app_name = self.inner.app_info.name.as_str(),
                transaction_id = id.to_string()
            );
            lock(&self.inner.engine).note_abandoned(1);
        }
    }
}

/// Lock a mutex, continuing with the inner value if a panicking thread
/// poisoned it. Aggregation state stays usable either way.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

/// Shared state behind every [`Application`] clone.
#[derive(Debug)]
pub(crate) struct ApplicationInner {
    app_info: AppInfo,
    config: Config,
    registry: &'static SegmentRegistry,
    id_generator: Box<dyn IdGenerator>,
    engine: Mutex<StatsEngine>,
    /// Open transactions by id, with the time they were begun. Entries
    /// removed here without a close were reaped or discarded.
    live: Mutex<HashMap<TransactionId, SystemTime>>,
    slow_traces: Mutex<Vec<FinishedTransaction>>,
    samplers: Mutex<Vec<Box<dyn MetricSampler>>>,
    exporter: Mutex<Box<dyn HarvestExporter>>,
    ticker: OnceLock<HarvestTicker>,
    is_shutdown: AtomicBool,
}

impl ApplicationInner {
    /// One harvest cycle: reap stale transactions, snapshot the engine,
    /// poll samplers, export, merge the snapshot back on transient failure.
    pub(crate) fn run_harvest(&self) -> Result<(), HarvestError> {
        let now = crate::time::now();

        // Reap first so abandoned transactions cannot pin memory.
        let reaped = {
            let timeout = self.config.transaction_timeout;
            let mut live = lock(&self.live);
            let before = live.len();
            live.retain(|_, started| {
                now.duration_since(*started).unwrap_or_default() < timeout
            });
            (before - live.len()) as u64
        };

        let snapshot = {
            let mut engine = lock(&self.engine);
            if reaped > 0 {
                apm_warn!(
                    name: "transactions_reaped",
                    app_name = self.app_info.name.as_str(),
                    count = reaped
                );
                engine.note_abandoned(reaped);
            }
            engine.increment_counter(REPORTING_METRIC);
            engine.harvest_snapshot(now)
        };

        let slow_traces = std::mem::take(&mut *lock(&self.slow_traces));
        let samples = sampler::poll_samplers(&mut *lock(&self.samplers));

        let payload = HarvestPayload {
            app_info: self.app_info.clone(),
            period_start: snapshot.period_start(),
            period_end: now,
            metrics: snapshot.metrics().clone(),
            samples,
            transaction_count: snapshot.transaction_count(),
            abandoned_transaction_count: snapshot.abandoned_count(),
            dropped_segment_count: snapshot.dropped_segment_count(),
            dropped_attribute_count: snapshot.dropped_attribute_count(),
            slow_traces: slow_traces.clone(),
        };

        let result = {
            let mut exporter = lock(&self.exporter);
            futures_executor::block_on(exporter.export(payload))
        };

        match result {
            Ok(()) => {
                apm_debug!(
                    name: "harvest_exported",
                    app_name = self.app_info.name.as_str(),
                    transaction_count = snapshot.transaction_count()
                );
                Ok(())
            }
            Err(err @ ExportError::Transient(_)) => {
                let merged = lock(&self.engine).merge_back(snapshot, self.config.max_harvest_merges);
                if merged {
                    // Slow traces ride out with the retried metrics, still
                    // bounded by the per-harvest retention limit.
                    let mut slow = lock(&self.slow_traces);
                    slow.extend(slow_traces);
                    slow.sort_by(|a, b| b.duration.cmp(&a.duration));
                    slow.truncate(self.config.max_traces_per_harvest);
                } else {
                    apm_warn!(
                        name: "harvest_snapshot_discarded",
                        app_name = self.app_info.name.as_str(),
                        max_merges = self.config.max_harvest_merges
                    );
                }
                Err(err.into())
            }
            Err(err) => {
                apm_warn!(
                    name: "harvest_export_failed",
                    app_name = self.app_info.name.as_str(),
                    error = err.to_string()
                );
                Err(err.into())
            }
        }
    }

    fn shutdown(&self) -> Result<(), HarvestError> {
        if self
            .is_shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(HarvestError::AlreadyShutdown);
        }
        apm_info!(name: "application_shutdown", app_name = self.app_info.name.as_str());

        // The final harvest runs on the caller's thread; the ticker thread
        // only has to acknowledge and exit.
        let harvest_result = self.run_harvest();
        let stop_result = match self.ticker.get() {
            Some(ticker) => ticker.stop(),
            None => Ok(()),
        };
        lock(&self.exporter).shutdown();
        harvest_result.and(stop_result)
    }
}

impl Drop for ApplicationInner {
    /// Shut down implicitly when the last handle is dropped.
    fn drop(&mut self) {
        if self.is_shutdown.load(Ordering::SeqCst) {
            return;
        }
        // The ticker's weak upgrade can make its own thread the last owner;
        // joining it from here would deadlock. The cycle that triggered
        // this drop already harvested, so there is nothing left to flush.
        if let Some(ticker) = self.ticker.get() {
            if ticker.is_current_thread() {
                self.is_shutdown.store(true, Ordering::SeqCst);
                return;
            }
        }
        apm_debug!(
            name: "application_dropped_without_shutdown",
            app_name = self.app_info.name.as_str()
        );
        if let Err(err) = self.shutdown() {
            apm_warn!(
                name: "implicit_shutdown_failed",
                app_name = self.app_info.name.as_str(),
                error = err.to_string()
            );
        }
    }
}

/// Builder for [`Application`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use apmkit::{Application, Config};
///
/// let application = Application::builder()
///     .with_config(Config::default().with_harvest_interval(Duration::from_secs(30)))
///     .build("checkout")
///     .unwrap();
/// application.shutdown().unwrap();
/// ```
#[derive(Debug)]
pub struct ApplicationBuilder {
    config: Config,
    exporter: Option<Box<dyn HarvestExporter>>,
    samplers: Vec<Box<dyn MetricSampler>>,
    id_generator: Box<dyn IdGenerator>,
}

impl Default for ApplicationBuilder {
    fn default() -> Self {
        ApplicationBuilder {
            config: Config::default(),
            exporter: None,
            samplers: Vec::new(),
            id_generator: Box::new(RandomIdGenerator::default()),
        }
    }
}

impl ApplicationBuilder {
    /// Specify the application configuration.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Specify the harvest exporter. Without one, harvests are aggregated
    /// and then discarded by a [`NoopHarvestExporter`].
    pub fn with_exporter(mut self, exporter: impl HarvestExporter + 'static) -> Self {
        self.exporter = Some(Box::new(exporter));
        self
    }

    /// Add a harvest-time metric sampler alongside the built-in uptime
    /// sampler.
    pub fn with_sampler(mut self, sampler: impl MetricSampler + 'static) -> Self {
        self.samplers.push(Box::new(sampler));
        self
    }

    /// Specify the transaction id generator.
    pub fn with_id_generator(mut self, generator: impl IdGenerator + 'static) -> Self {
        self.id_generator = Box::new(generator);
        self
    }

    /// Validate the configuration and activate the application: freeze the
    /// segment-kind registry, announce the app identity to the exporter and
    /// spawn the harvest ticker thread.
    pub fn build(self, name: impl Into<String>) -> Result<Application, ConfigError> {
        let name = name.into();
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        self.config.validate()?;

        // No transaction can open before this returns, so the registry is
        // always frozen before first use.
        let registry = SegmentRegistry::freeze();

        let app_info = AppInfo::detect(name);
        let started = crate::time::now();

        let mut exporter = self
            .exporter
            .unwrap_or_else(|| Box::new(NoopHarvestExporter::new()));
        exporter.set_app_info(&app_info);

        let mut samplers = self.samplers;
        samplers.insert(0, Box::new(UptimeSampler::new(started)));

        let inner = Arc::new(ApplicationInner {
            app_info,
            config: self.config,
            registry,
            id_generator: self.id_generator,
            engine: Mutex::new(StatsEngine::new(started)),
            live: Mutex::new(HashMap::new()),
            slow_traces: Mutex::new(Vec::new()),
            samplers: Mutex::new(samplers),
            exporter: Mutex::new(exporter),
            ticker: OnceLock::new(),
            is_shutdown: AtomicBool::new(false),
        });

        let weak: Weak<ApplicationInner> = Arc::downgrade(&inner);
        let ticker = HarvestTicker::spawn(name, inner.config.harvest_interval, weak);
        let _ = inner.ticker.set(ticker);

        apm_info!(
            name: "application_activated",
            app_name = inner.app_info.name.as_str(),
            harvest_interval_secs = inner.config.harvest_interval.as_secs()
        );
        Ok(Application { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExportResult;
    use crate::in_memory_exporter::{InMemoryHarvestExporter, InMemoryHarvestExporterBuilder};
    use crate::segment::SegmentMetadata;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn quiet_config() -> Config {
        Config::default()
            .with_harvest_interval(Duration::from_secs(3600))
            .with_transaction_trace_threshold(Duration::ZERO)
    }

    #[test]
    fn build_rejects_blank_names() {
        assert_eq!(
            Application::builder().build("").err(),
            Some(ConfigError::EmptyName)
        );
        assert_eq!(
            Application::builder().build("  \t ").err(),
            Some(ConfigError::EmptyName)
        );
    }

    #[test]
    fn build_rejects_invalid_config() {
        let err = Application::builder()
            .with_config(Config::default().with_harvest_interval(Duration::ZERO))
            .build("app-bad-interval")
            .err();
        assert_eq!(err, Some(ConfigError::InvalidHarvestInterval));
    }

    #[test]
    fn shutdown_succeeds_exactly_once() {
        let application = Application::builder()
            .with_config(quiet_config())
            .build("app-shutdown-once")
            .unwrap();
        assert!(application.shutdown().is_ok());
        assert!(matches!(
            application.shutdown(),
            Err(HarvestError::AlreadyShutdown)
        ));
        assert!(matches!(
            application.force_harvest(),
            Err(HarvestError::AlreadyShutdown)
        ));
    }

    #[test]
    fn transactions_after_shutdown_do_not_record() {
        let exporter = InMemoryHarvestExporterBuilder::new().build();
        let application = Application::builder()
            .with_config(quiet_config())
            .with_exporter(exporter.clone())
            .build("app-after-shutdown")
            .unwrap();
        application.shutdown().unwrap();
        let count_after_shutdown = exporter.get_harvests().len();

        let mut txn = application.begin_transaction(TransactionKind::Web, "late");
        assert!(!txn.is_recording());
        assert_eq!(txn.close(), Ok(()));
        assert_eq!(exporter.get_harvests().len(), count_after_shutdown);
    }

    #[test]
    fn harvest_counts_transactions_and_marker_metrics() {
        let exporter = InMemoryHarvestExporterBuilder::new().build();
        let application = Application::builder()
            .with_config(quiet_config())
            .with_exporter(exporter.clone())
            .build("app-counts")
            .unwrap();

        for name in ["one", "two"] {
            let mut txn = application.begin_transaction(TransactionKind::Background, name);
            txn.close().unwrap();
        }
        application.force_harvest().unwrap();

        let harvests = exporter.get_harvests();
        assert_eq!(harvests.len(), 1);
        let payload = &harvests[0];
        assert_eq!(payload.transaction_count, 2);
        assert_eq!(payload.metrics["Instance/Reporting"].call_count, 1);
        assert!(payload.metrics.contains_key("OtherTransaction/one"));
        assert!(payload
            .samples
            .iter()
            .any(|sample| sample.name.as_str() == "Instance/Uptime"));
        assert!(payload.period_start <= payload.period_end);
        application.shutdown().unwrap();
    }

    #[test]
    fn exporter_learns_the_app_identity_at_activation() {
        let exporter = InMemoryHarvestExporterBuilder::new().build();
        let application = Application::builder()
            .with_config(quiet_config())
            .with_exporter(exporter.clone())
            .build("app-identity")
            .unwrap();
        let info = exporter.get_app_info().unwrap().unwrap();
        assert_eq!(info.name, "app-identity");
        assert_eq!(info.pid, std::process::id());
        application.shutdown().unwrap();
    }

    #[test]
    fn slow_trace_retention_is_bounded_and_sorted() {
        let exporter = InMemoryHarvestExporterBuilder::new().build();
        let application = Application::builder()
            .with_config(quiet_config().with_max_traces_per_harvest(2))
            .with_exporter(exporter.clone())
            .build("app-slow-traces")
            .unwrap();

        for _ in 0..5 {
            let mut txn = application.begin_transaction(TransactionKind::Web, "w");
            txn.close().unwrap();
        }
        application.force_harvest().unwrap();

        let harvests = exporter.get_harvests();
        let traces = &harvests[0].slow_traces;
        assert_eq!(traces.len(), 2);
        assert!(traces[0].duration >= traces[1].duration);
        application.shutdown().unwrap();
    }

    #[test]
    fn stale_transactions_are_reaped_and_late_close_is_dropped() {
        let exporter = InMemoryHarvestExporterBuilder::new().build();
        let application = Application::builder()
            .with_config(quiet_config().with_transaction_timeout(Duration::from_millis(1)))
            .with_exporter(exporter.clone())
            .build("app-reap")
            .unwrap();

        let mut stale = application.begin_transaction(TransactionKind::Web, "stale");
        std::thread::sleep(Duration::from_millis(10));
        application.force_harvest().unwrap();

        let harvests = exporter.get_harvests();
        assert_eq!(harvests[0].abandoned_transaction_count, 1);

        // The reaped transaction's late close succeeds but records nothing.
        assert_eq!(stale.close(), Ok(()));
        application.force_harvest().unwrap();
        let harvests = exporter.get_harvests();
        assert_eq!(harvests[1].transaction_count, 0);
        application.shutdown().unwrap();
    }

    #[test]
    fn dropped_transactions_are_counted_as_abandoned() {
        let exporter = InMemoryHarvestExporterBuilder::new().build();
        let application = Application::builder()
            .with_config(quiet_config())
            .with_exporter(exporter.clone())
            .build("app-drop-count")
            .unwrap();

        {
            let mut txn = application.begin_transaction(TransactionKind::Web, "leaky");
            let _ = txn.push_segment(SegmentMetadata::function("work")).unwrap();
            // Dropped without close.
        }
        application.force_harvest().unwrap();

        let harvests = exporter.get_harvests();
        assert_eq!(harvests[0].abandoned_transaction_count, 1);
        assert_eq!(harvests[0].transaction_count, 0);
        application.shutdown().unwrap();
    }

    #[test]
    fn record_accepts_replayed_transactions() {
        let exporter = InMemoryHarvestExporterBuilder::new().build();
        let application = Application::builder()
            .with_config(quiet_config())
            .with_exporter(exporter.clone())
            .build("app-replay")
            .unwrap();

        let mut txn = application.begin_transaction(TransactionKind::Web, "original");
        txn.close().unwrap();
        application.force_harvest().unwrap();
        let replay = exporter.get_harvests()[0].slow_traces[0].clone();

        application.record(replay);
        application.force_harvest().unwrap();
        let harvests = exporter.get_harvests();
        assert_eq!(harvests[1].transaction_count, 1);
        assert!(harvests[1].metrics.contains_key("WebTransaction/original"));
        application.shutdown().unwrap();
    }

    /// Fails the first `fail_remaining` exports with a transient error, then
    /// delegates to an in-memory exporter.
    #[derive(Debug)]
    struct FlakyExporter {
        fail_remaining: AtomicU32,
        inner: InMemoryHarvestExporter,
    }

    impl HarvestExporter for FlakyExporter {
        fn export(&mut self, payload: HarvestPayload) -> BoxFuture<'static, ExportResult> {
            if self
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Box::pin(std::future::ready(Err(ExportError::Transient(
                    "collector unreachable".into(),
                ))));
            }
            self.inner.export(payload)
        }
    }

    #[test]
    fn transient_export_failure_merges_metrics_back() {
        let inner = InMemoryHarvestExporterBuilder::new().build();
        let application = Application::builder()
            .with_config(quiet_config())
            .with_exporter(FlakyExporter {
                fail_remaining: AtomicU32::new(1),
                inner: inner.clone(),
            })
            .build("app-flaky")
            .unwrap();

        let mut txn = application.begin_transaction(TransactionKind::Web, "retried");
        txn.close().unwrap();

        assert!(matches!(
            application.force_harvest(),
            Err(HarvestError::Export(ExportError::Transient(_)))
        ));
        assert!(inner.get_harvests().is_empty());

        // The merged-back snapshot rides out with the next cycle.
        application.force_harvest().unwrap();
        let harvests = inner.get_harvests();
        assert_eq!(harvests[0].transaction_count, 1);
        assert!(harvests[0].metrics.contains_key("WebTransaction/retried"));
        application.shutdown().unwrap();
    }

    #[test]
    fn transient_export_failure_keeps_slow_traces() {
        let inner = InMemoryHarvestExporterBuilder::new().build();
        let application = Application::builder()
            .with_config(quiet_config().with_max_traces_per_harvest(2))
            .with_exporter(FlakyExporter {
                fail_remaining: AtomicU32::new(1),
                inner: inner.clone(),
            })
            .build("app-flaky-traces")
            .unwrap();

        for name in ["one", "two", "three"] {
            let mut txn = application.begin_transaction(TransactionKind::Web, name);
            txn.close().unwrap();
        }
        assert!(application.force_harvest().is_err());

        application.force_harvest().unwrap();
        let harvests = inner.get_harvests();
        // Re-retention stays bounded by the per-harvest limit.
        assert_eq!(harvests[0].slow_traces.len(), 2);
        assert!(harvests[0].slow_traces[0].duration >= harvests[0].slow_traces[1].duration);
        application.shutdown().unwrap();
    }

    #[cfg(feature = "testing")]
    #[test]
    fn increment_id_generator_yields_predictable_ids() {
        let application = Application::builder()
            .with_config(quiet_config())
            .with_id_generator(crate::ids::IncrementIdGenerator::new())
            .build("app-increment-ids")
            .unwrap();
        let first = application.begin_transaction(TransactionKind::Web, "a");
        let second = application.begin_transaction(TransactionKind::Web, "b");
        assert_eq!(first.id(), TransactionId::from(1));
        assert_eq!(second.id(), TransactionId::from(2));
        drop(first);
        drop(second);
        application.shutdown().unwrap();
    }
}
