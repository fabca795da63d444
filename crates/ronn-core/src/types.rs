//! Fundamental types shared by the registry, the providers and sessions.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Unique identifier of an inference session.
pub type SessionId = uuid::Uuid;

/// Kind of a physical compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HardwareDeviceKind {
    /// Central processing unit.
    Cpu,
    /// Graphics processing unit.
    Gpu,
    /// Neural processing unit.
    Npu,
}

impl fmt::Display for HardwareDeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cpu => "CPU",
            Self::Gpu => "GPU",
            Self::Npu => "NPU",
        };
        f.write_str(name)
    }
}

/// A physical compute device found by device discovery.
///
/// Equality and hashing only consider `kind`, `vendor`, `vendor_id` and
/// `bus_id`. The property bag is informational, so the same device reported
/// through two enumeration paths with different properties compares equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareDevice {
    /// Device kind.
    pub kind: HardwareDeviceKind,
    /// Vendor name.
    pub vendor: String,
    /// PCI vendor id, 0 if unknown.
    pub vendor_id: u32,
    /// Bus id, -1 if unknown.
    pub bus_id: i32,
    /// Free-form properties collected during discovery.
    pub properties: BTreeMap<String, String>,
}

impl HardwareDevice {
    /// Bus id value for devices without bus information.
    pub const UNKNOWN_BUS_ID: i32 = -1;

    /// Create a device without properties.
    pub fn new(
        kind: HardwareDeviceKind,
        vendor: impl Into<String>,
        vendor_id: u32,
        bus_id: i32,
    ) -> Self {
        Self {
            kind,
            vendor: vendor.into(),
            vendor_id,
            bus_id,
            properties: BTreeMap::new(),
        }
    }

    /// Add a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Look up a property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Whether the bus id is known.
    pub fn has_bus_id(&self) -> bool {
        self.bus_id >= 0
    }
}

impl PartialEq for HardwareDevice {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.vendor == other.vendor
            && self.vendor_id == other.vendor_id
            && self.bus_id == other.bus_id
    }
}

impl Eq for HardwareDevice {}

impl Hash for HardwareDevice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.vendor_id.hash(state);
        self.vendor.hash(state);
        self.bus_id.hash(state);
        self.kind.hash(state);
    }
}

impl fmt::Display for HardwareDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (vendor_id=0x{:04x}", self.kind, self.vendor, self.vendor_id)?;
        if self.has_bus_id() {
            write!(f, ", bus_id={}", self.bus_id)?;
        }
        f.write_str(")")
    }
}

/// A live execution provider instance owned by a session.
///
/// Instances are created by the provider registry during automatic selection
/// and handed to [`crate::InferenceSession`], which owns them until it is
/// dropped. Dropping an instance releases any backend resources it holds.
pub trait ExecutionProvider: Send + Sync + fmt::Debug {
    /// Execution provider type, e.g. `"CPU"`.
    fn provider_type(&self) -> &str;

    /// Vendor of the execution provider.
    fn vendor(&self) -> &str;

    /// Devices this instance was created for.
    fn devices(&self) -> &[Arc<HardwareDevice>];

    /// Get as Any for downcasting.
    fn as_any(&self) -> &dyn Any;
}
