//! Shared helpers for the provider integration tests.
//!
//! The mock plugin implements the execution provider ABI in-process. Its
//! behavior is configured per registration name, so tests running in parallel
//! must each use their own names.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::ptr;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use ronn_core::{HardwareDevice, HardwareDeviceKind};
use ronn_ep_abi::{
    RonnEp, RonnEpFactory, RonnErrorCode, RonnHardwareDevice, RonnHardwareDeviceType, RonnHostApi,
    RonnKeyValuePairs, RonnLogger, RonnSessionOptions, RonnStatus, RonnStr, RONN_EP_API_VERSION,
};
use ronn_providers::device::vendor_ids;
use ronn_providers::{DeviceDiscovery, EpLibrarySource, PluginEntryPoints};

/// How the mock plugin behaves for one registration name.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Device kinds the factory supports.
    pub kinds: Vec<RonnHardwareDeviceType>,
    /// Default options advertised for every supported device.
    pub options: Vec<(String, String)>,
    /// `CreateEpFactories` returns an error.
    pub fail_load: bool,
    /// `CreateEpFactories` panics.
    pub panic_on_load: bool,
    /// Version written into the factory table.
    pub factory_version: u32,
    /// `CreateEp` returns an error.
    pub fail_create: bool,
    /// `ReleaseEpFactory` returns an error.
    pub fail_release: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            kinds: Vec::new(),
            options: Vec::new(),
            fail_load: false,
            panic_on_load: false,
            factory_version: RONN_EP_API_VERSION,
            fail_create: false,
            fail_release: false,
        }
    }
}

impl MockBehavior {
    /// A factory supporting `kinds`.
    pub fn supporting(kinds: &[RonnHardwareDeviceType]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            ..Self::default()
        }
    }

    /// Advertise a default option.
    pub fn with_option(mut self, key: &str, value: &str) -> Self {
        self.options.push((key.to_string(), value.to_string()));
        self
    }
}

/// Calls the mock plugin has seen for one registration name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    pub factories_created: usize,
    pub factories_released: usize,
    pub eps_created: usize,
    pub eps_released: usize,
    /// Device count passed to the last successful `CreateEp`.
    pub last_device_count: usize,
}

#[derive(Default)]
struct MockState {
    behaviors: HashMap<String, MockBehavior>,
    stats: HashMap<String, MockStats>,
}

static STATE: Lazy<Mutex<MockState>> = Lazy::new(|| Mutex::new(MockState::default()));

fn with_state<T>(f: impl FnOnce(&mut MockState) -> T) -> T {
    let mut state = STATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut state)
}

/// Set the behavior of the mock plugin for `registration_name`.
pub fn configure(registration_name: &str, behavior: MockBehavior) {
    with_state(|state| {
        state.behaviors.insert(registration_name.to_string(), behavior);
        state.stats.remove(registration_name);
    });
}

/// Calls seen for `registration_name` so far.
pub fn stats(registration_name: &str) -> MockStats {
    with_state(|state| state.stats.get(registration_name).copied().unwrap_or_default())
}

fn behavior(registration_name: &str) -> MockBehavior {
    with_state(|state| {
        state
            .behaviors
            .get(registration_name)
            .cloned()
            .unwrap_or_default()
    })
}

fn record(registration_name: &str, update: impl FnOnce(&mut MockStats)) {
    with_state(|state| update(state.stats.entry(registration_name.to_string()).or_default()));
}

#[repr(C)]
struct MockFactory {
    base: RonnEpFactory,
    api: &'static RonnHostApi,
    name: String,
}

#[repr(C)]
struct MockEp {
    base: RonnEp,
    name: String,
}

unsafe fn status(api: &RonnHostApi, code: RonnErrorCode, message: &str) -> *mut RonnStatus {
    (api.create_status)(code, RonnStr::new(message))
}

unsafe extern "C" fn get_name(this: *const RonnEpFactory) -> RonnStr {
    RonnStr::new(&(*this.cast::<MockFactory>()).name)
}

unsafe extern "C" fn get_vendor(_this: *const RonnEpFactory) -> RonnStr {
    RonnStr::new("Mock Vendor")
}

unsafe extern "C" fn get_device_info_if_supported(
    this: *const RonnEpFactory,
    device: *const RonnHardwareDevice,
    _ep_metadata: *mut RonnKeyValuePairs,
    ep_options: *mut RonnKeyValuePairs,
) -> bool {
    let factory = &*this.cast::<MockFactory>();
    let behavior = behavior(&factory.name);

    let kind = (factory.api.hardware_device_type)(device);
    if !behavior.kinds.contains(&kind) {
        return false;
    }
    for (key, value) in &behavior.options {
        (factory.api.key_value_pairs_add)(ep_options, RonnStr::new(key), RonnStr::new(value));
    }
    true
}

unsafe extern "C" fn create_ep(
    this: *mut RonnEpFactory,
    _devices: *const *const RonnHardwareDevice,
    _ep_metadata: *const *const RonnKeyValuePairs,
    num_devices: usize,
    _session_options: *const RonnSessionOptions,
    _logger: *const RonnLogger,
    ep: *mut *mut RonnEp,
) -> *mut RonnStatus {
    let factory = &*this.cast::<MockFactory>();
    if behavior(&factory.name).fail_create {
        return status(factory.api, RonnErrorCode::FAIL, "mock CreateEp failure");
    }

    let instance = Box::new(MockEp {
        base: RonnEp {
            version: RONN_EP_API_VERSION,
            get_name: ep_get_name,
        },
        name: factory.name.clone(),
    });
    ep.write(Box::into_raw(instance).cast());
    record(&factory.name, |stats| {
        stats.eps_created += 1;
        stats.last_device_count = num_devices;
    });
    ptr::null_mut()
}

unsafe extern "C" fn release_ep(this: *mut RonnEpFactory, ep: *mut RonnEp) {
    let factory = &*this.cast::<MockFactory>();
    drop(Box::from_raw(ep.cast::<MockEp>()));
    record(&factory.name, |stats| stats.eps_released += 1);
}

unsafe extern "C" fn ep_get_name(this: *const RonnEp) -> RonnStr {
    RonnStr::new(&(*this.cast::<MockEp>()).name)
}

unsafe extern "C-unwind" fn create_ep_factories(
    registration_name: RonnStr,
    host_api: *const RonnHostApi,
    factories: *mut *mut RonnEpFactory,
    _max_factories: usize,
    num_factories: *mut usize,
) -> *mut RonnStatus {
    let api: &'static RonnHostApi = &*host_api;
    let name = registration_name.to_string_lossy();
    let behavior = behavior(&name);

    if behavior.panic_on_load {
        panic!("mock plugin '{name}' panicked");
    }
    if behavior.fail_load {
        return status(api, RonnErrorCode::FAIL, "mock CreateEpFactories failure");
    }

    let factory = Box::new(MockFactory {
        base: RonnEpFactory {
            version: behavior.factory_version,
            get_name,
            get_vendor,
            get_device_info_if_supported,
            create_ep,
            release_ep,
        },
        api,
        name: name.clone(),
    });
    factories.write(Box::into_raw(factory).cast());
    num_factories.write(1);
    record(&name, |stats| stats.factories_created += 1);
    ptr::null_mut()
}

unsafe extern "C-unwind" fn release_ep_factory(factory: *mut RonnEpFactory) -> *mut RonnStatus {
    let factory = Box::from_raw(factory.cast::<MockFactory>());
    record(&factory.name, |stats| stats.factories_released += 1);

    if behavior(&factory.name).fail_release {
        return status(factory.api, RonnErrorCode::FAIL, "mock ReleaseEpFactory failure");
    }
    ptr::null_mut()
}

/// Library source for the mock plugin.
pub fn mock_plugin() -> EpLibrarySource {
    // SAFETY: both functions implement the ABI and share their state.
    let entry_points = unsafe { PluginEntryPoints::new(create_ep_factories, release_ep_factory) };
    EpLibrarySource::Linked(entry_points)
}

/// Library source for the example NPU plugin, linked into the test binary.
pub fn example_plugin() -> EpLibrarySource {
    let (create, release) = ronn_ep_example::entry_points();
    // SAFETY: the example plugin's own entry points.
    EpLibrarySource::Linked(unsafe { PluginEntryPoints::new(create, release) })
}

pub fn cpu() -> HardwareDevice {
    HardwareDevice::new(HardwareDeviceKind::Cpu, "GenuineIntel", vendor_ids::INTEL, -1)
}

pub fn nvidia_gpu(bus_id: i32) -> HardwareDevice {
    HardwareDevice::new(HardwareDeviceKind::Gpu, "NVIDIA", vendor_ids::NVIDIA, bus_id)
}

pub fn npu() -> HardwareDevice {
    npu_on_bus(0)
}

pub fn npu_on_bus(bus_id: i32) -> HardwareDevice {
    HardwareDevice::new(HardwareDeviceKind::Npu, "Qualcomm", vendor_ids::QUALCOMM, bus_id)
}

/// Discovery reporting a CPU, one NVIDIA GPU and one NPU.
pub fn full_machine() -> Arc<DeviceDiscovery> {
    Arc::new(DeviceDiscovery::with_devices(vec![cpu(), nvidia_gpu(1), npu()]))
}

/// Discovery reporting only a CPU.
pub fn cpu_only_machine() -> Arc<DeviceDiscovery> {
    Arc::new(DeviceDiscovery::with_devices(vec![cpu()]))
}

/// An empty file named like the CUDA provider library, in a directory of its
/// own. The bridge only checks that the file exists.
pub fn fake_cuda_library(tag: &str) -> std::io::Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("ronn-bridge-{}-{}", tag, std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("libronn_providers_cuda.so");
    std::fs::write(&path, b"")?;
    Ok(path)
}
