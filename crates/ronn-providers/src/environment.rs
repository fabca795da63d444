//! Process-wide entry point pairing device discovery with a provider registry.

use std::path::Path;
use std::sync::Arc;

use ronn_core::{InferenceSession, Result, SessionOptions};
use tracing::info;

use crate::device::DeviceDiscovery;
use crate::library::{EpLibrarySource, UnloadReport};
use crate::registry::{ExecutionDevices, ProviderRegistry};
use crate::selection::{select_and_attach, EpSelection};

/// Owns the provider registry and creates sessions against it.
#[derive(Debug)]
pub struct Environment {
    registry: ProviderRegistry,
}

impl Environment {
    /// Create an environment over the platform's devices with the built-in
    /// providers registered.
    pub fn new() -> Result<Self> {
        Self::with_discovery(DeviceDiscovery::global())
    }

    /// Create an environment over a specific device discovery.
    pub fn with_discovery(discovery: Arc<DeviceDiscovery>) -> Result<Self> {
        let registry = ProviderRegistry::with_builtin_providers(discovery)?;
        info!(
            "Created environment with {} execution devices",
            registry.execution_devices()?.len()
        );
        Ok(Self { registry })
    }

    /// The provider registry.
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Register the provider library at `path`.
    ///
    /// Known legacy provider libraries are bridged, any other file must
    /// implement the plugin ABI.
    pub fn register_execution_provider_library(
        &self,
        registration_name: &str,
        path: impl AsRef<Path>,
    ) -> Result<()> {
        self.registry
            .register_library(registration_name, EpLibrarySource::from_path(path.as_ref()))
    }

    /// Register a library from an explicit source.
    pub fn register_library(&self, registration_name: &str, source: EpLibrarySource) -> Result<()> {
        self.registry.register_library(registration_name, source)
    }

    /// Unregister a library.
    pub fn unregister_execution_provider_library(
        &self,
        registration_name: &str,
    ) -> Result<UnloadReport> {
        self.registry.unregister_library(registration_name)
    }

    /// Snapshot of all execution devices.
    pub fn execution_devices(&self) -> Result<ExecutionDevices> {
        self.registry.execution_devices()
    }

    /// Create a session.
    ///
    /// If the options carry a device policy, providers are selected and
    /// attached before the session is returned.
    pub fn create_session(&self, options: SessionOptions) -> Result<InferenceSession> {
        let policy = options.ep_selection_policy;
        let mut session = InferenceSession::new(options);

        if let Some(policy) = policy {
            select_and_attach(&self.registry, &mut session, &EpSelection::Policy(policy))?;
        }
        Ok(session)
    }

    /// Select providers for an existing session.
    pub fn select_providers(
        &self,
        session: &mut InferenceSession,
        selection: &EpSelection,
    ) -> Result<()> {
        select_and_attach(&self.registry, session, selection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CPU_EXECUTION_PROVIDER;
    use ronn_core::{CoreError, DevicePolicy, HardwareDevice, HardwareDeviceKind};

    fn environment() -> anyhow::Result<Environment> {
        let discovery = DeviceDiscovery::with_devices(vec![HardwareDevice::new(
            HardwareDeviceKind::Cpu,
            "GenuineIntel",
            0x8086,
            -1,
        )]);
        Ok(Environment::with_discovery(Arc::new(discovery))?)
    }

    #[test]
    fn test_session_without_policy_has_no_providers() -> anyhow::Result<()> {
        let env = environment()?;
        let session = env.create_session(SessionOptions::new())?;
        assert_eq!(session.provider_count(), 0);
        Ok(())
    }

    #[test]
    fn test_session_with_policy_selects_cpu() -> anyhow::Result<()> {
        let env = environment()?;
        let options = SessionOptions::new().with_ep_selection_policy(DevicePolicy::PreferCpu);
        let session = env.create_session(options)?;
        assert_eq!(session.provider_types(), vec![CPU_EXECUTION_PROVIDER]);
        Ok(())
    }

    #[test]
    fn test_unsupported_policy_fails_session_creation() -> anyhow::Result<()> {
        let env = environment()?;
        let options = SessionOptions::new().with_ep_selection_policy(DevicePolicy::MaxPerformance);
        let err = env.create_session(options).unwrap_err();
        assert!(matches!(err, CoreError::NotImplemented(_)));
        Ok(())
    }

    #[test]
    fn test_register_missing_plugin_file() -> anyhow::Result<()> {
        let env = environment()?;
        let err = env
            .register_execution_provider_library("ghost", "/nonexistent/libghost_ep.so")
            .unwrap_err();
        assert!(matches!(err, CoreError::Fail(_)));
        assert!(!env.registry().is_registered("ghost"));
        Ok(())
    }
}
