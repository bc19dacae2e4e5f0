//! Device registry adapter.
//!
//! The catalog itself (profile collection loading, device discovery) lives
//! outside the daemon. We consume its "existing devices" listing through the
//! [`DeviceCatalog`] trait and keep the result as an immutable
//! [`DeviceSnapshot`]. A reload builds a new snapshot and swaps it in
//! atomically, so readers always see one consistent set.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dcs_core::{Capabilities, DeviceDefinition, DeviceId, DeviceType};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

/// Errors raised while loading a device catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read device catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse device catalog {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("device catalog {0} defines no devices")]
    Empty(String),
}

/// Source of device definitions.
pub trait DeviceCatalog: Send + Sync {
    /// Loads the full device set.
    fn load(&self) -> Result<Vec<DeviceDefinition>, CatalogError>;

    /// Human-readable description for logs and errors.
    fn describe(&self) -> String;
}

// ============================================================================
// Catalog file format
// ============================================================================

/// On-disk listing, keyed by device name.
#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    devices: BTreeMap<String, CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    classname: String,
    #[serde(default = "unknown_module")]
    module: String,
    #[serde(default)]
    is_readable: bool,
    #[serde(default)]
    is_movable: bool,
    #[serde(default)]
    is_flyable: bool,
}

fn unknown_module() -> String {
    dcs_core::device::UNKNOWN_MODULE.to_string()
}

impl CatalogEntry {
    fn into_definition(self, name: String) -> DeviceDefinition {
        DeviceDefinition::from_catalog(
            name,
            &self.classname,
            &self.module,
            Capabilities::new(self.is_readable, self.is_movable, self.is_flyable),
        )
    }
}

/// Parses catalog text. JSON when `json` is true, TOML otherwise.
pub fn parse_catalog(content: &str, json: bool) -> Result<Vec<DeviceDefinition>, String> {
    let file: CatalogFile = if json {
        serde_json::from_str(content).map_err(|e| e.to_string())?
    } else {
        toml::from_str(content).map_err(|e| e.to_string())?
    };

    Ok(file
        .devices
        .into_iter()
        .map(|(name, entry)| entry.into_definition(name))
        .collect())
}

/// Catalog backed by a TOML or JSON file.
#[derive(Debug, Clone)]
pub struct FileCatalog {
    path: PathBuf,
}

impl FileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeviceCatalog for FileCatalog {
    fn load(&self) -> Result<Vec<DeviceDefinition>, CatalogError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| CatalogError::Io {
            path: self.path.clone(),
            source,
        })?;
        let json = self
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        parse_catalog(&content, json).map_err(|message| CatalogError::Parse {
            path: self.path.clone(),
            message,
        })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory catalog. The device set can be replaced to exercise reloads.
pub struct StaticCatalog {
    devices: ArcSwap<Vec<DeviceDefinition>>,
}

impl StaticCatalog {
    pub fn new(devices: Vec<DeviceDefinition>) -> Self {
        Self {
            devices: ArcSwap::from_pointee(devices),
        }
    }

    /// Replaces the devices returned by the next `load`.
    pub fn replace(&self, devices: Vec<DeviceDefinition>) {
        self.devices.store(Arc::new(devices));
    }
}

impl DeviceCatalog for StaticCatalog {
    fn load(&self) -> Result<Vec<DeviceDefinition>, CatalogError> {
        Ok(self.devices.load().as_ref().clone())
    }

    fn describe(&self) -> String {
        "static catalog".to_string()
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Immutable device set taken from one catalog load.
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    devices: BTreeMap<DeviceId, DeviceDefinition>,
    loaded_at: Option<DateTime<Utc>>,
}

impl DeviceSnapshot {
    pub fn new(devices: Vec<DeviceDefinition>, loaded_at: DateTime<Utc>) -> Self {
        Self {
            devices: devices.into_iter().map(|d| (d.name.clone(), d)).collect(),
            loaded_at: Some(loaded_at),
        }
    }

    pub fn lookup(&self, device: &DeviceId) -> Option<&DeviceDefinition> {
        self.devices.get(device)
    }

    pub fn contains(&self, device: &DeviceId) -> bool {
        self.devices.contains_key(device)
    }

    /// Device names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &DeviceId> {
        self.devices.keys()
    }

    /// Definitions in name order.
    pub fn definitions(&self) -> impl Iterator<Item = &DeviceDefinition> {
        self.devices.values()
    }

    pub fn by_type(&self, device_type: DeviceType) -> Vec<DeviceDefinition> {
        self.devices
            .values()
            .filter(|d| d.device_type == device_type)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }
}

/// Names added and removed by a reload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub device_count: usize,
    pub added: Vec<DeviceId>,
    pub removed: Vec<DeviceId>,
}

// ============================================================================
// Directory
// ============================================================================

/// Current device snapshot behind an atomically swappable pointer.
///
/// Cheap to clone; clones share the same snapshot slot.
#[derive(Clone)]
pub struct DeviceDirectory {
    catalog: Arc<dyn DeviceCatalog>,
    current: Arc<ArcSwap<DeviceSnapshot>>,
}

impl DeviceDirectory {
    /// Loads the first snapshot.
    ///
    /// # Errors
    ///
    /// Fails if the catalog cannot be loaded or is empty; the daemon cannot
    /// serve without a device set.
    pub fn load(catalog: Arc<dyn DeviceCatalog>) -> Result<Self, CatalogError> {
        let devices = catalog.load()?;
        if devices.is_empty() {
            return Err(CatalogError::Empty(catalog.describe()));
        }

        let snapshot = DeviceSnapshot::new(devices, Utc::now());
        info!(
            source = %catalog.describe(),
            devices = snapshot.len(),
            "Device catalog loaded"
        );

        Ok(Self {
            catalog,
            current: Arc::new(ArcSwap::from_pointee(snapshot)),
        })
    }

    /// Returns the current snapshot. Holding it pins that version.
    pub fn snapshot(&self) -> Arc<DeviceSnapshot> {
        self.current.load_full()
    }

    pub fn lookup(&self, device: &DeviceId) -> Option<DeviceDefinition> {
        self.current.load().lookup(device).cloned()
    }

    pub fn list_all(&self) -> Vec<DeviceId> {
        self.current.load().names().cloned().collect()
    }

    pub fn by_type(&self, device_type: DeviceType) -> Vec<DeviceDefinition> {
        self.current.load().by_type(device_type)
    }

    /// Reloads the catalog and swaps in the new snapshot.
    ///
    /// On failure the previous snapshot stays in place.
    pub fn reload(&self) -> Result<ReloadSummary, CatalogError> {
        let devices = match self.catalog.load() {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "Device catalog reload failed, keeping previous snapshot");
                return Err(e);
            }
        };
        if devices.is_empty() {
            let err = CatalogError::Empty(self.catalog.describe());
            warn!(error = %err, "Device catalog reload found no devices, keeping previous snapshot");
            return Err(err);
        }

        let fresh = DeviceSnapshot::new(devices, Utc::now());
        let previous = self.current.load_full();

        let old: BTreeSet<&DeviceId> = previous.names().collect();
        let new: BTreeSet<&DeviceId> = fresh.names().collect();
        let summary = ReloadSummary {
            device_count: fresh.len(),
            added: new.difference(&old).map(|d| (*d).clone()).collect(),
            removed: old.difference(&new).map(|d| (*d).clone()).collect(),
        };

        self.current.store(Arc::new(fresh));

        info!(
            devices = summary.device_count,
            added = summary.added.len(),
            removed = summary.removed.len(),
            "Device catalog reloaded"
        );
        Ok(summary)
    }
}
