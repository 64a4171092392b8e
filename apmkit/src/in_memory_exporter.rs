use crate::error::{ExportError, ExportResult, HarvestError};
use crate::export::{AppInfo, HarvestExporter, HarvestPayload};
use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex};

/// An in-memory harvest exporter that stores payloads in memory.
///
/// This exporter is useful for testing and debugging purposes. It stores
/// harvest data in a `Vec<HarvestPayload>`. Payloads can be retrieved using
/// the `get_harvests` method.
/// # Example
/// ```
/// use apmkit::{Application, InMemoryHarvestExporterBuilder, SegmentMetadata, TransactionKind};
///
/// let exporter = InMemoryHarvestExporterBuilder::new().build();
/// let application = Application::builder()
///     .with_exporter(exporter.clone())
///     .build("example")
///     .unwrap();
///
/// let mut txn = application.begin_transaction(TransactionKind::Web, "say-hello");
/// let segment = txn.push_segment(SegmentMetadata::function("hello")).unwrap();
/// txn.pop_segment(segment).unwrap();
/// txn.close().unwrap();
///
/// application.force_harvest().unwrap();
/// for harvest in exporter.get_harvests() {
///     println!("{:?}", harvest.metrics);
/// }
/// application.shutdown().unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryHarvestExporter {
    harvests: Arc<Mutex<Vec<HarvestPayload>>>,
    app_info: Arc<Mutex<Option<AppInfo>>>,
}

impl Default for InMemoryHarvestExporter {
    fn default() -> Self {
        InMemoryHarvestExporterBuilder::new().build()
    }
}

/// Builder for [`InMemoryHarvestExporter`].
/// # Example
/// ```
/// use apmkit::InMemoryHarvestExporterBuilder;
///
/// let exporter = InMemoryHarvestExporterBuilder::new().build();
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryHarvestExporterBuilder {}

impl Default for InMemoryHarvestExporterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryHarvestExporterBuilder {
    /// Creates a new instance of the `InMemoryHarvestExporterBuilder`.
    pub fn new() -> Self {
        Self {}
    }

    /// Creates a new instance of the `InMemoryHarvestExporter`.
    pub fn build(&self) -> InMemoryHarvestExporter {
        InMemoryHarvestExporter {
            harvests: Arc::new(Mutex::new(Vec::new())),
            app_info: Arc::new(Mutex::new(None)),
        }
    }
}

impl InMemoryHarvestExporter {
    /// Returns the exported harvests as a vector of `HarvestPayload`.
    ///
    /// # Example
    ///
    /// ```
    /// use apmkit::InMemoryHarvestExporter;
    ///
    /// let exporter = InMemoryHarvestExporter::default();
    /// let harvests = exporter.get_harvests();
    /// ```
    pub fn get_harvests(&self) -> Vec<HarvestPayload> {
        self.harvests
            .lock()
            .map(|harvests_guard| harvests_guard.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the app identity the application announced at activation.
    pub fn get_app_info(&self) -> Result<Option<AppInfo>, HarvestError> {
        Ok(self.app_info.lock()?.clone())
    }

    /// Clears the internal storage of harvests.
    ///
    /// # Example
    ///
    /// ```
    /// use apmkit::InMemoryHarvestExporter;
    ///
    /// let exporter = InMemoryHarvestExporter::default();
    /// exporter.reset();
    /// ```
    pub fn reset(&self) {
        let _ = self
            .harvests
            .lock()
            .map(|mut harvests_guard| harvests_guard.clear());
    }
}

impl HarvestExporter for InMemoryHarvestExporter {
    fn export(&mut self, payload: HarvestPayload) -> BoxFuture<'static, ExportResult> {
        let result = self
            .harvests
            .lock()
            .map(|mut harvests_guard| harvests_guard.push(payload))
            .map_err(|err| {
                ExportError::Permanent(format!("Failed to lock harvests: {:?}", err))
            });
        Box::pin(std::future::ready(result))
    }

    fn shutdown(&mut self) {
        self.reset();
    }

    fn set_app_info(&mut self, app_info: &AppInfo) {
        let _ = self
            .app_info
            .lock()
            .map(|mut info_guard| *info_guard = Some(app_info.clone()));
    }
}
