//! Frozen segment-kind registry and the process-wide application registry.
//!
//! Activation of the first application freezes one descriptor per
//! [`SegmentKind`] (rollup metric plus metadata validator). Handles obtained
//! through [`register`] are the only path to opening transactions, so no
//! transaction can observe the registry before the freeze.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::application::Application;
use crate::config::Config;
use crate::error::{ConfigError, HarvestError, ValidationError};
use crate::segment::{self, SegmentKind, SegmentMetadata};

/// Descriptor for one segment kind.
#[derive(Debug)]
pub(crate) struct KindDescriptor {
    pub(crate) kind: SegmentKind,

    /// Rollup metric recorded alongside the scoped metric, if the kind has
    /// one.
    pub(crate) rollup: Option<&'static str>,

    /// Validates pushed metadata and renders the scoped metric name.
    pub(crate) validate: fn(&SegmentMetadata) -> Result<String, ValidationError>,
}

/// The frozen table of segment-kind descriptors.
#[derive(Debug)]
pub struct SegmentRegistry {
    descriptors: [KindDescriptor; 4],
}

impl SegmentRegistry {
    /// Freeze the registry, building and checking it on the first call.
    /// Every later call observes the same table.
    pub(crate) fn freeze() -> &'static SegmentRegistry {
        static FROZEN: OnceLock<SegmentRegistry> = OnceLock::new();
        FROZEN.get_or_init(SegmentRegistry::build)
    }

    fn build() -> Self {
        let registry = SegmentRegistry {
            descriptors: [
                KindDescriptor {
                    kind: SegmentKind::Function,
                    rollup: None,
                    validate: segment::validate_function,
                },
                KindDescriptor {
                    kind: SegmentKind::Database,
                    rollup: Some("Database/all"),
                    validate: segment::validate_database,
                },
                KindDescriptor {
                    kind: SegmentKind::External,
                    rollup: Some("External/all"),
                    validate: segment::validate_external,
                },
                KindDescriptor {
                    kind: SegmentKind::Memcache,
                    rollup: Some("Memcache/all"),
                    validate: segment::validate_memcache,
                },
            ],
        };
        debug_assert!(registry.is_complete());
        registry
    }

    /// Every kind has exactly one descriptor, in [`SegmentKind::ALL`] order.
    /// Descriptor lookup indexes by discriminant and relies on this.
    fn is_complete(&self) -> bool {
        self.descriptors.len() == SegmentKind::ALL.len()
            && self
                .descriptors
                .iter()
                .zip(SegmentKind::ALL)
                .all(|(descriptor, kind)| descriptor.kind == kind)
    }

    pub(crate) fn descriptor(&self, kind: SegmentKind) -> &KindDescriptor {
        &self.descriptors[kind as usize]
    }

    /// Validate metadata against its kind's descriptor, returning the scoped
    /// metric name recorded on the segment node.
    pub(crate) fn validate(&self, metadata: &SegmentMetadata) -> Result<String, ValidationError> {
        (self.descriptor(metadata.kind()).validate)(metadata)
    }
}

/// The process-wide map of named applications.
fn applications() -> &'static Mutex<HashMap<String, Application>> {
    static APPLICATIONS: OnceLock<Mutex<HashMap<String, Application>>> = OnceLock::new();
    APPLICATIONS.get_or_init(Default::default)
}

/// Register the application with the given name, activating it on first
/// registration.
///
/// A repeat registration under a live name returns a clone of the existing
/// handle and ignores the new config. A registration under a name whose
/// previous activation was shut down builds a fresh one.
pub(crate) fn register(name: &str, config: Config) -> Result<Application, ConfigError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyName);
    }

    let mut apps = applications().lock().unwrap_or_else(|err| err.into_inner());
    if let Some(existing) = apps.get(trimmed) {
        if !existing.is_shutdown() {
            return Ok(existing.clone());
        }
    }

    let application = Application::builder().with_config(config).build(trimmed)?;
    apps.insert(trimmed.to_string(), application.clone());
    Ok(application)
}

/// Shut down the application registered under `name`, if one is live.
pub(crate) fn shutdown_application(name: &str) -> Result<(), HarvestError> {
    let application = {
        let apps = applications().lock().unwrap_or_else(|err| err.into_inner());
        apps.get(name.trim()).cloned()
    };
    match application {
        Some(application) => application.shutdown(),
        None => Err(HarvestError::AlreadyShutdown),
    }
}
