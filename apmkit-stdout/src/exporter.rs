use core::fmt;
use std::io::{stdout, Write};
use std::sync::Mutex;

use futures_util::future::BoxFuture;

use apmkit::{AppInfo, ExportError, ExportResult, HarvestPayload};

use crate::transform::HarvestData;

type Encoder = Box<dyn Fn(&mut dyn Write, HarvestData) -> ExportResult + Send + Sync>;

/// An apmkit exporter that writes one JSON object per harvest payload to
/// stdout, or to any configured `Write` sink.
pub struct HarvestExporter {
    writer: Mutex<Option<Box<dyn Write + Send + Sync>>>,
    encoder: Encoder,
    human_readable: bool,
}

impl HarvestExporter {
    /// Create a builder to configure this exporter.
    pub fn builder() -> HarvestExporterBuilder {
        HarvestExporterBuilder::default()
    }
}

impl Default for HarvestExporter {
    fn default() -> Self {
        HarvestExporterBuilder::default().build()
    }
}

impl fmt::Debug for HarvestExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HarvestExporter")
    }
}

impl apmkit::HarvestExporter for HarvestExporter {
    /// Write one harvest payload to the configured sink.
    fn export(&mut self, payload: HarvestPayload) -> BoxFuture<'static, ExportResult> {
        let result = match self.writer.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(writer) => {
                    let data = HarvestData::new(payload, self.human_readable);
                    (self.encoder)(writer, data).and_then(|_| {
                        writer
                            .write_all(b"\n")
                            .map_err(|err| ExportError::Transient(err.to_string()))
                    })
                }
                None => Err(ExportError::AlreadyShutdown),
            },
            Err(err) => Err(ExportError::Permanent(format!(
                "failed to lock writer: {err}"
            ))),
        };
        Box::pin(std::future::ready(result))
    }

    fn shutdown(&mut self) {
        if let Ok(mut guard) = self.writer.lock() {
            guard.take();
        }
    }

    // The app identity already rides on every payload; nothing to retain.
    fn set_app_info(&mut self, _app_info: &AppInfo) {}
}

/// Configuration for the stdout harvest exporter.
#[derive(Default)]
pub struct HarvestExporterBuilder {
    writer: Option<Box<dyn Write + Send + Sync>>,
    encoder: Option<Encoder>,
    human_readable: bool,
}

impl fmt::Debug for HarvestExporterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HarvestExporterBuilder")
    }
}

impl HarvestExporterBuilder {
    /// Set the writer that the exporter will write to.
    ///
    /// # Examples
    ///
    /// ```
    /// use apmkit_stdout::HarvestExporterBuilder;
    ///
    /// let buffer = Vec::new(); // Any type that implements `Write`
    /// let exporter = HarvestExporterBuilder::default().with_writer(buffer).build();
    /// ```
    pub fn with_writer(mut self, writer: impl Write + Send + Sync + 'static) -> Self {
        self.writer = Some(Box::new(writer));
        self
    }

    /// Set the encoder that this exporter will use.
    ///
    /// # Examples
    ///
    /// ```
    /// use apmkit::ExportError;
    /// use apmkit_stdout::HarvestExporterBuilder;
    ///
    /// let exporter = HarvestExporterBuilder::default()
    ///     .with_encoder(|writer, data| {
    ///         serde_json::to_writer_pretty(writer, &data)
    ///             .map_err(|err| ExportError::Permanent(err.to_string()))
    ///     })
    ///     .build();
    /// ```
    pub fn with_encoder(
        mut self,
        encoder: impl Fn(&mut dyn Write, HarvestData) -> ExportResult + Send + Sync + 'static,
    ) -> Self {
        self.encoder = Some(Box::new(encoder));
        self
    }

    /// Serialize timestamps as RFC 3339 strings instead of unix nanos.
    pub fn with_human_readable(mut self) -> Self {
        self.human_readable = true;
        self
    }

    /// Create an exporter with the configuration of this builder.
    pub fn build(self) -> HarvestExporter {
        HarvestExporter {
            writer: Mutex::new(Some(self.writer.unwrap_or_else(|| Box::new(stdout())))),
            encoder: self.encoder.unwrap_or_else(|| {
                Box::new(|writer, data| {
                    serde_json::to_writer(writer, &data)
                        .map_err(|err| ExportError::Permanent(err.to_string()))
                })
            }),
            human_readable: self.human_readable,
        }
    }
}
