//! Device identity, capabilities and catalog definitions.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for an instrument device (e.g. "motor_x", "det1").
///
/// Device names come from the external device catalog and are treated as
/// opaque strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a new DeviceId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// Boolean capability flags reported by the device catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// Device can be read (signals, detectors, motors with readback)
    pub readable: bool,
    /// Device can be moved/set (motors, settable signals)
    pub movable: bool,
    /// Device supports fly scans
    pub flyable: bool,
}

impl Capabilities {
    /// Creates a capability set.
    pub const fn new(readable: bool, movable: bool, flyable: bool) -> Self {
        Self {
            readable,
            movable,
            flyable,
        }
    }
}

// ============================================================================
// Device Type
// ============================================================================

/// Coarse device category, derived from the device class name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Motor,
    Detector,
    Signal,
    Flyer,
    #[default]
    Device,
}

impl DeviceType {
    /// Classifies a device from its class name.
    ///
    /// Matching is case-insensitive and checked in order: motor, detector
    /// (or camera), signal, flyer. Anything else is a generic device.
    pub fn classify(classname: &str) -> Self {
        let lower = classname.to_lowercase();
        if lower.contains("motor") {
            Self::Motor
        } else if lower.contains("detector") || lower.contains("camera") {
            Self::Detector
        } else if lower.contains("signal") {
            Self::Signal
        } else if lower.contains("flyer") {
            Self::Flyer
        } else {
            Self::Device
        }
    }

    /// Returns the wire label for this type.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Motor => "motor",
            Self::Detector => "detector",
            Self::Signal => "signal",
            Self::Flyer => "flyer",
            Self::Device => "device",
        }
    }

    /// Parses a wire label. Returns `None` for unknown labels.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "motor" => Some(Self::Motor),
            "detector" => Some(Self::Detector),
            "signal" => Some(Self::Signal),
            "flyer" => Some(Self::Flyer),
            "device" => Some(Self::Device),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Device Definition
// ============================================================================

/// Module name used when the catalog does not report one.
pub const UNKNOWN_MODULE: &str = "unknown";

/// Catalog entry describing one device.
///
/// Immutable for the lifetime of a catalog snapshot; a reload replaces the
/// whole set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Device name (unique within a snapshot)
    pub name: DeviceId,
    /// Fully qualified class, `module.classname` when the module is known
    pub device_class: String,
    /// Category derived from the class name
    pub device_type: DeviceType,
    /// Python module the device class lives in
    pub module: String,
    /// Capability flags
    pub capabilities: Capabilities,
}

impl DeviceDefinition {
    /// Builds a definition from raw catalog fields.
    pub fn from_catalog(
        name: impl Into<DeviceId>,
        classname: &str,
        module: &str,
        capabilities: Capabilities,
    ) -> Self {
        let device_class = if module == UNKNOWN_MODULE {
            classname.to_string()
        } else {
            format!("{module}.{classname}")
        };

        Self {
            name: name.into(),
            device_class,
            device_type: DeviceType::classify(classname),
            module: module.to_string(),
            capabilities,
        }
    }
}
