//! Hardware device discovery.
//!
//! Discovery runs once per [`DeviceDiscovery`] handle: the first call to
//! [`DeviceDiscovery::discover`] scans the configured [`DeviceSource`] and
//! every later call returns the cached list. Devices are deduplicated by
//! identity and keep the order in which they were first reported.

use std::fmt;
use std::sync::{Arc, OnceLock};

use indexmap::IndexSet;
use once_cell::sync::Lazy;
use ronn_core::{HardwareDevice, HardwareDeviceKind, Result};
use tracing::{debug, info, warn};

/// Well-known PCI vendor ids.
pub mod vendor_ids {
    /// NVIDIA Corporation.
    pub const NVIDIA: u32 = 0x10DE;
    /// Advanced Micro Devices (GPUs).
    pub const AMD: u32 = 0x1002;
    /// Advanced Micro Devices (CPUs and chipsets).
    pub const AMD_CPU: u32 = 0x1022;
    /// Intel Corporation.
    pub const INTEL: u32 = 0x8086;
    /// Qualcomm.
    pub const QUALCOMM: u32 = 0x5143;
    /// Apple.
    pub const APPLE: u32 = 0x106B;
    /// Microsoft.
    pub const MICROSOFT: u32 = 0x1414;
}

/// Vendor name for a PCI vendor id, if known.
pub fn vendor_name(vendor_id: u32) -> Option<&'static str> {
    match vendor_id {
        vendor_ids::NVIDIA => Some("NVIDIA"),
        vendor_ids::AMD | vendor_ids::AMD_CPU => Some("AMD"),
        vendor_ids::INTEL => Some("Intel"),
        vendor_ids::QUALCOMM => Some("Qualcomm"),
        vendor_ids::APPLE => Some("Apple"),
        vendor_ids::MICROSOFT => Some("Microsoft"),
        _ => None,
    }
}

/// Something that can enumerate the hardware devices of the machine.
pub trait DeviceSource: Send + Sync + fmt::Debug {
    /// List the devices currently present. Duplicates are allowed.
    fn enumerate(&self) -> Result<Vec<HardwareDevice>>;
}

/// Enumerates devices of the machine the process runs on.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformDeviceSource;

impl DeviceSource for PlatformDeviceSource {
    fn enumerate(&self) -> Result<Vec<HardwareDevice>> {
        let mut devices = vec![platform::host_cpu()];
        devices.extend(platform::pci_devices());
        Ok(devices)
    }
}

/// A fixed device list, used to inject hardware in tests and tools.
#[derive(Debug, Default, Clone)]
pub struct StaticDeviceSource {
    devices: Vec<HardwareDevice>,
}

impl StaticDeviceSource {
    /// Create a source that always reports `devices`.
    pub fn new(devices: Vec<HardwareDevice>) -> Self {
        Self { devices }
    }
}

impl DeviceSource for StaticDeviceSource {
    fn enumerate(&self) -> Result<Vec<HardwareDevice>> {
        Ok(self.devices.clone())
    }
}

/// Memoized hardware device list.
pub struct DeviceDiscovery {
    source: Box<dyn DeviceSource>,
    cache: OnceLock<Arc<[Arc<HardwareDevice>]>>,
}

static GLOBAL_DISCOVERY: Lazy<Arc<DeviceDiscovery>> =
    Lazy::new(|| Arc::new(DeviceDiscovery::platform()));

impl DeviceDiscovery {
    /// Create a discovery handle over `source`.
    pub fn new(source: impl DeviceSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            cache: OnceLock::new(),
        }
    }

    /// Discovery over the real platform.
    pub fn platform() -> Self {
        Self::new(PlatformDeviceSource)
    }

    /// Discovery that reports a fixed device list.
    pub fn with_devices(devices: Vec<HardwareDevice>) -> Self {
        Self::new(StaticDeviceSource::new(devices))
    }

    /// Process-wide platform discovery handle.
    pub fn global() -> Arc<DeviceDiscovery> {
        Arc::clone(&GLOBAL_DISCOVERY)
    }

    /// Discovered devices.
    ///
    /// The first call scans the source. Source errors are logged and produce an
    /// empty list; they are never reported to the caller.
    pub fn discover(&self) -> Arc<[Arc<HardwareDevice>]> {
        Arc::clone(self.cache.get_or_init(|| self.scan()))
    }

    /// Whether discovery has already run.
    pub fn is_cached(&self) -> bool {
        self.cache.get().is_some()
    }

    fn scan(&self) -> Arc<[Arc<HardwareDevice>]> {
        let reported = match self.source.enumerate() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Hardware device discovery failed: {}", e);
                Vec::new()
            }
        };

        let reported_count = reported.len();
        let unique: IndexSet<HardwareDevice> = reported.into_iter().collect();
        if unique.len() != reported_count {
            debug!(
                "Dropped {} duplicate hardware devices",
                reported_count - unique.len()
            );
        }

        for device in &unique {
            debug!("Discovered hardware device: {}", device);
        }
        info!("Discovered {} hardware devices", unique.len());

        unique.into_iter().map(Arc::new).collect()
    }
}

impl fmt::Debug for DeviceDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceDiscovery")
            .field("source", &self.source)
            .field("cached", &self.is_cached())
            .finish()
    }
}

mod platform {
    use super::*;

    /// Device kind for a PCI class code, if it is a compute device.
    pub(super) fn kind_for_pci_class(class: u32) -> Option<HardwareDeviceKind> {
        match class >> 16 {
            0x03 => Some(HardwareDeviceKind::Gpu),
            0x12 => Some(HardwareDeviceKind::Npu),
            _ => None,
        }
    }

    /// Bus number from a PCI address like `0000:01:00.0`.
    pub(super) fn bus_from_pci_address(address: &str) -> Option<i32> {
        let bus = address.split(':').nth(1)?;
        i32::from_str_radix(bus, 16).ok()
    }

    pub(super) fn parse_hex(value: &str) -> Option<u32> {
        let value = value.trim();
        let digits = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .unwrap_or(value);
        u32::from_str_radix(digits, 16).ok()
    }

    /// CPU vendor id for the vendor string reported by the processor.
    pub(super) fn cpu_vendor_id(vendor: &str) -> u32 {
        match vendor {
            "GenuineIntel" => vendor_ids::INTEL,
            "AuthenticAMD" => vendor_ids::AMD_CPU,
            "Qualcomm" => vendor_ids::QUALCOMM,
            "Apple" => vendor_ids::APPLE,
            _ => 0,
        }
    }

    pub(super) fn host_cpu() -> HardwareDevice {
        let (vendor, model) = cpu_identity();
        let vendor = vendor.unwrap_or_else(|| std::env::consts::ARCH.to_string());
        let vendor_id = cpu_vendor_id(&vendor);

        let mut device = HardwareDevice::new(
            HardwareDeviceKind::Cpu,
            vendor,
            vendor_id,
            HardwareDevice::UNKNOWN_BUS_ID,
        )
        .with_property("logical_cores", num_cpus::get().to_string())
        .with_property("physical_cores", num_cpus::get_physical().to_string());

        if let Some(model) = model {
            device = device.with_property("Description", model);
        }
        device
    }

    #[cfg(target_os = "linux")]
    fn cpu_identity() -> (Option<String>, Option<String>) {
        let cpuinfo = match std::fs::read_to_string("/proc/cpuinfo") {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Failed to read /proc/cpuinfo: {}", e);
                return (None, None);
            }
        };

        let field = |name: &str| {
            cpuinfo.lines().find_map(|line| {
                let (key, value) = line.split_once(':')?;
                (key.trim() == name).then(|| value.trim().to_string())
            })
        };

        (field("vendor_id"), field("model name"))
    }

    #[cfg(not(target_os = "linux"))]
    fn cpu_identity() -> (Option<String>, Option<String>) {
        (None, None)
    }

    #[cfg(target_os = "linux")]
    pub(super) fn pci_devices() -> Vec<HardwareDevice> {
        use std::path::Path;

        const PCI_DEVICES: &str = "/sys/bus/pci/devices";

        let entries = match std::fs::read_dir(PCI_DEVICES) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to enumerate PCI devices in {}: {}", PCI_DEVICES, e);
                return Vec::new();
            }
        };

        let read_hex = |dir: &Path, file: &str| {
            std::fs::read_to_string(dir.join(file))
                .ok()
                .and_then(|value| parse_hex(&value))
        };

        let mut devices = Vec::new();
        for entry in entries.flatten() {
            let dir = entry.path();
            let Some(kind) = read_hex(&dir, "class").and_then(kind_for_pci_class) else {
                continue;
            };

            let address = entry.file_name().to_string_lossy().into_owned();
            let vendor_id = read_hex(&dir, "vendor").unwrap_or(0);
            let vendor = vendor_name(vendor_id)
                .map(str::to_string)
                .unwrap_or_else(|| format!("0x{vendor_id:04x}"));
            let bus_id = bus_from_pci_address(&address).unwrap_or(HardwareDevice::UNKNOWN_BUS_ID);

            let mut device = HardwareDevice::new(kind, vendor, vendor_id, bus_id)
                .with_property("pci_address", address);
            if let Some(device_id) = read_hex(&dir, "device") {
                device = device.with_property("device_id", format!("0x{device_id:04x}"));
            }
            devices.push(device);
        }

        devices
    }

    #[cfg(not(target_os = "linux"))]
    pub(super) fn pci_devices() -> Vec<HardwareDevice> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ronn_core::CoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingSource {
        calls: AtomicUsize,
    }

    impl DeviceSource for CountingSource {
        fn enumerate(&self) -> Result<Vec<HardwareDevice>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![HardwareDevice::new(
                HardwareDeviceKind::Cpu,
                "GenuineIntel",
                vendor_ids::INTEL,
                -1,
            )])
        }
    }

    #[derive(Debug)]
    struct FailingSource;

    impl DeviceSource for FailingSource {
        fn enumerate(&self) -> Result<Vec<HardwareDevice>> {
            Err(CoreError::fail("no access to device tree"))
        }
    }

    #[test]
    fn test_discovery_is_cached() {
        let source = Arc::new(CountingSource::default());

        #[derive(Debug)]
        struct Shared(Arc<CountingSource>);
        impl DeviceSource for Shared {
            fn enumerate(&self) -> Result<Vec<HardwareDevice>> {
                self.0.enumerate()
            }
        }

        let discovery = DeviceDiscovery::new(Shared(Arc::clone(&source)));
        assert!(!discovery.is_cached());

        let first = discovery.discover();
        let second = discovery.discover();

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_duplicates_are_removed_in_order() {
        let gpu = HardwareDevice::new(HardwareDeviceKind::Gpu, "NVIDIA", vendor_ids::NVIDIA, 1);
        let npu = HardwareDevice::new(HardwareDeviceKind::Npu, "Qualcomm", vendor_ids::QUALCOMM, 0);
        let discovery = DeviceDiscovery::with_devices(vec![
            gpu.clone().with_property("Description", "first"),
            npu.clone(),
            gpu.clone().with_property("Description", "second"),
        ]);

        let devices = discovery.discover();
        assert_eq!(devices.len(), 2);
        assert_eq!(*devices[0], gpu);
        assert_eq!(devices[0].property("Description"), Some("first"));
        assert_eq!(*devices[1], npu);
    }

    #[test]
    fn test_source_errors_yield_empty_list() {
        let discovery = DeviceDiscovery::new(FailingSource);
        assert!(discovery.discover().is_empty());
    }

    #[test]
    fn test_platform_always_reports_a_cpu() {
        let devices = DeviceDiscovery::platform().discover();
        assert!(devices
            .iter()
            .any(|d| d.kind == HardwareDeviceKind::Cpu));
    }

    #[test]
    fn test_pci_helpers() {
        assert_eq!(platform::kind_for_pci_class(0x030000), Some(HardwareDeviceKind::Gpu));
        assert_eq!(platform::kind_for_pci_class(0x030200), Some(HardwareDeviceKind::Gpu));
        assert_eq!(platform::kind_for_pci_class(0x120000), Some(HardwareDeviceKind::Npu));
        assert_eq!(platform::kind_for_pci_class(0x020000), None);

        assert_eq!(platform::bus_from_pci_address("0000:3b:00.0"), Some(0x3b));
        assert_eq!(platform::bus_from_pci_address("garbage"), None);

        assert_eq!(platform::parse_hex("0x10de\n"), Some(0x10de));
        assert_eq!(platform::cpu_vendor_id("AuthenticAMD"), vendor_ids::AMD_CPU);
        assert_eq!(vendor_name(vendor_ids::NVIDIA), Some("NVIDIA"));
        assert_eq!(vendor_name(0xdead), None);
    }
}
