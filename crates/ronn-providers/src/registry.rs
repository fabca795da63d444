//! Provider registry and management system.
//!
//! The registry maps registration names to loaded execution provider
//! libraries, in registration order, and publishes the flattened list of
//! [`ExecutionDevice`] pairings those libraries produced. Readers get an
//! immutable snapshot; registration and unregistration replace it atomically.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use indexmap::IndexMap;
use ronn_core::{CoreError, HardwareDevice, HardwareDeviceKind, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::device::DeviceDiscovery;
use crate::factory::EpFactory;
use crate::library::{EpLibrary, EpLibraryInternal, EpLibrarySource, LibraryKind, UnloadReport};

/// One execution provider paired with one hardware device it supports.
pub struct ExecutionDevice {
    ep_name: String,
    ep_vendor: String,
    registration_name: String,
    device: Arc<HardwareDevice>,
    ep_metadata: BTreeMap<String, String>,
    ep_options: BTreeMap<String, String>,
    factory: Weak<EpFactory>,
}

impl ExecutionDevice {
    /// Execution provider name.
    pub fn ep_name(&self) -> &str {
        &self.ep_name
    }

    /// Execution provider vendor.
    pub fn ep_vendor(&self) -> &str {
        &self.ep_vendor
    }

    /// Name of the library that provides the execution provider.
    pub fn registration_name(&self) -> &str {
        &self.registration_name
    }

    /// The hardware device.
    pub fn device(&self) -> &Arc<HardwareDevice> {
        &self.device
    }

    /// Metadata the factory reported for this device.
    pub fn ep_metadata(&self) -> &BTreeMap<String, String> {
        &self.ep_metadata
    }

    /// Default options the factory reported for this device.
    pub fn ep_options(&self) -> &BTreeMap<String, String> {
        &self.ep_options
    }

    /// The factory that produced this pairing.
    ///
    /// Fails once the owning library has been unregistered.
    pub fn factory(&self) -> Result<Arc<EpFactory>> {
        self.factory.upgrade().ok_or_else(|| {
            CoreError::fail(format!(
                "execution provider '{}' is no longer available: library '{}' was unregistered",
                self.ep_name, self.registration_name
            ))
        })
    }
}

impl fmt::Debug for ExecutionDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionDevice")
            .field("ep_name", &self.ep_name)
            .field("ep_vendor", &self.ep_vendor)
            .field("registration_name", &self.registration_name)
            .field("device", &self.device)
            .field("ep_metadata", &self.ep_metadata)
            .field("ep_options", &self.ep_options)
            .finish()
    }
}

/// Snapshot of the execution devices of all registered libraries.
pub type ExecutionDevices = Arc<[Arc<ExecutionDevice>]>;

/// Registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStatistics {
    /// Number of registered libraries.
    pub registered_libraries: usize,
    /// Registered libraries by kind.
    pub libraries_by_kind: BTreeMap<String, usize>,
    /// Number of published execution devices.
    pub execution_devices: usize,
    /// Execution devices by hardware device kind.
    pub execution_devices_by_kind: BTreeMap<HardwareDeviceKind, usize>,
    /// Number of discovered hardware devices.
    pub discovered_devices: usize,
}

struct RegisteredLibrary {
    library: Arc<dyn EpLibrary>,
    devices: Vec<Arc<ExecutionDevice>>,
}

struct RegistryState {
    libraries: IndexMap<String, RegisteredLibrary>,
    pending: HashSet<String>,
    snapshot: ExecutionDevices,
}

impl RegistryState {
    fn new() -> Self {
        Self {
            libraries: IndexMap::new(),
            pending: HashSet::new(),
            snapshot: Vec::new().into(),
        }
    }

    fn rebuild_snapshot(&mut self) {
        self.snapshot = self
            .libraries
            .values()
            .flat_map(|entry| entry.devices.iter().cloned())
            .collect();
    }

    /// A provider name of `library` that a registered library already uses,
    /// with that library's registration name.
    fn conflicting_provider(&self, library: &dyn EpLibrary) -> Option<(String, String)> {
        let factories = library.factories();
        self.libraries.iter().find_map(|(owner, entry)| {
            entry.library.factories().iter().find_map(|registered| {
                factories
                    .iter()
                    .any(|factory| factory.name() == registered.name())
                    .then(|| (registered.name().to_string(), owner.clone()))
            })
        })
    }
}

/// Unload a library that will not be published.
fn discard_library(library: &dyn EpLibrary) {
    match library.unload() {
        Ok(report) if !report.is_clean() => warn!(
            "Library '{}' was not released cleanly after a rejected registration: {:?}",
            library.registration_name(),
            report
        ),
        Ok(_) => {}
        Err(e) => warn!(
            "Failed to unload library '{}' after a rejected registration: {}",
            library.registration_name(),
            e
        ),
    }
}

/// Registry of execution provider libraries.
pub struct ProviderRegistry {
    discovery: Arc<DeviceDiscovery>,
    state: RwLock<RegistryState>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new(discovery: Arc<DeviceDiscovery>) -> Self {
        Self {
            discovery,
            state: RwLock::new(RegistryState::new()),
        }
    }

    /// Create a registry with the built-in CPU execution provider registered.
    pub fn with_builtin_providers(discovery: Arc<DeviceDiscovery>) -> Result<Self> {
        let registry = Self::new(discovery);
        registry.register(Arc::new(EpLibraryInternal::cpu()))?;
        Ok(registry)
    }

    /// Device discovery used to pair factories with devices.
    pub fn discovery(&self) -> &Arc<DeviceDiscovery> {
        &self.discovery
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, RegistryState>> {
        self.state
            .read()
            .map_err(|_| CoreError::fail("provider registry lock poisoned"))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, RegistryState>> {
        self.state
            .write()
            .map_err(|_| CoreError::fail("provider registry lock poisoned"))
    }

    /// Register a library by name.
    ///
    /// Fails with `InvalidArgument` if the name is empty or already used, or
    /// if the library provides an execution provider name that another
    /// registered library already provides. If the library fails to load or
    /// is rejected the name stays unused and the library is unloaded again.
    pub fn register_library(&self, registration_name: &str, source: EpLibrarySource) -> Result<()> {
        self.register(source.into_library(registration_name))
    }

    /// Register an already constructed library under its own name.
    pub fn register(&self, library: Arc<dyn EpLibrary>) -> Result<()> {
        let name = library.registration_name().to_string();
        if name.is_empty() {
            return Err(CoreError::invalid_argument("registration name must not be empty"));
        }

        {
            let mut state = self.write_state()?;
            if state.libraries.contains_key(&name) || !state.pending.insert(name.clone()) {
                return Err(CoreError::invalid_argument(format!(
                    "an execution provider library is already registered as '{name}'"
                )));
            }
        }

        // Loading runs plugin code, so it happens outside the registry lock.
        let loaded = library.load().map(|()| self.execution_devices_for(&*library));

        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => {
                poisoned.into_inner().pending.remove(&name);
                if loaded.is_ok() {
                    discard_library(&*library);
                }
                return Err(CoreError::fail("provider registry lock poisoned"));
            }
        };
        state.pending.remove(&name);
        let devices = loaded?;

        if let Some((ep_name, owner)) = state.conflicting_provider(&*library) {
            drop(state);
            drop(devices);
            discard_library(&*library);
            return Err(CoreError::invalid_argument(format!(
                "execution provider '{ep_name}' of library '{name}' is already provided by \
                 library '{owner}'"
            )));
        }

        info!(
            "Registered execution provider library '{}' ({:?}) with {} execution devices",
            name,
            library.kind(),
            devices.len()
        );
        state
            .libraries
            .insert(name, RegisteredLibrary { library, devices });
        state.rebuild_snapshot();

        Ok(())
    }

    fn execution_devices_for(&self, library: &dyn EpLibrary) -> Vec<Arc<ExecutionDevice>> {
        let hardware = self.discovery.discover();
        let mut devices = Vec::new();

        for factory in library.factories() {
            for device in hardware.iter() {
                let Some(support) = factory.get_device_info_if_supported(device) else {
                    continue;
                };
                debug!(
                    "Execution provider '{}' supports {}",
                    factory.name(),
                    device
                );
                devices.push(Arc::new(ExecutionDevice {
                    ep_name: factory.name().to_string(),
                    ep_vendor: factory.vendor().to_string(),
                    registration_name: library.registration_name().to_string(),
                    device: Arc::clone(device),
                    ep_metadata: support.metadata,
                    ep_options: support.options,
                    factory: Arc::downgrade(&factory),
                }));
            }
        }

        devices
    }

    /// Unregister a library and unload it.
    ///
    /// The library's execution devices disappear from new snapshots before it
    /// is unloaded. Fails with `InvalidArgument` if the name is not registered.
    pub fn unregister_library(&self, registration_name: &str) -> Result<UnloadReport> {
        let removed = {
            let mut state = self.write_state()?;
            let removed = state
                .libraries
                .shift_remove(registration_name)
                .ok_or_else(|| {
                    CoreError::invalid_argument(format!(
                        "no execution provider library is registered as '{registration_name}'"
                    ))
                })?;
            state.rebuild_snapshot();
            removed
        };

        let RegisteredLibrary { library, devices } = removed;
        drop(devices);

        let report = library.unload()?;
        info!(
            "Unregistered execution provider library '{}'",
            registration_name
        );
        Ok(report)
    }

    /// Point-in-time snapshot of all execution devices, in registration order.
    pub fn execution_devices(&self) -> Result<ExecutionDevices> {
        Ok(Arc::clone(&self.read_state()?.snapshot))
    }

    /// Registration names in registration order.
    pub fn registration_names(&self) -> Result<Vec<String>> {
        Ok(self.read_state()?.libraries.keys().cloned().collect())
    }

    /// Whether a library is registered under `registration_name`.
    pub fn is_registered(&self, registration_name: &str) -> bool {
        self.read_state()
            .map(|state| state.libraries.contains_key(registration_name))
            .unwrap_or(false)
    }

    /// A registered library.
    pub fn library(&self, registration_name: &str) -> Option<Arc<dyn EpLibrary>> {
        let state = self.read_state().ok()?;
        state
            .libraries
            .get(registration_name)
            .map(|entry| Arc::clone(&entry.library))
    }

    /// Get registry statistics.
    pub fn get_statistics(&self) -> RegistryStatistics {
        let mut stats = RegistryStatistics {
            discovered_devices: self.discovery.discover().len(),
            ..RegistryStatistics::default()
        };

        let Ok(state) = self.read_state() else {
            return stats;
        };

        stats.registered_libraries = state.libraries.len();
        for entry in state.libraries.values() {
            let kind = match entry.library.kind() {
                LibraryKind::Internal => "internal",
                LibraryKind::Plugin => "plugin",
                LibraryKind::ProviderBridge => "provider_bridge",
            };
            *stats.libraries_by_kind.entry(kind.to_string()).or_insert(0) += 1;
        }

        stats.execution_devices = state.snapshot.len();
        for execution_device in state.snapshot.iter() {
            *stats
                .execution_devices_by_kind
                .entry(execution_device.device().kind)
                .or_insert(0) += 1;
        }

        stats
    }

    /// Unregister every library, newest first.
    pub fn shutdown(&self) {
        let names = match self.registration_names() {
            Ok(names) => names,
            Err(e) => {
                warn!("Failed to shut down provider registry: {}", e);
                return;
            }
        };

        for name in names.iter().rev() {
            match self.unregister_library(name) {
                Ok(report) if !report.is_clean() => {
                    warn!(
                        "Library '{}' was not released cleanly during shutdown: {:?}",
                        name, report
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to unregister library '{}' during shutdown: {}", name, e),
            }
        }
    }
}

impl Drop for ProviderRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("libraries", &self.registration_names().unwrap_or_default())
            .field("discovery", &self.discovery)
            .finish()
    }
}
