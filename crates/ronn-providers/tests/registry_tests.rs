//! Integration tests for library registration and the provider registry.
//!
//! These tests drive the registry through the plugin ABI using the in-process
//! mock plugin and the example NPU plugin.

mod common;

use std::sync::Arc;

use anyhow::Result;
use common::{MockBehavior, MockStats};
use ronn_core::{CoreError, DevicePolicy, HardwareDeviceKind, SessionOptions};
use ronn_ep_abi::RonnHardwareDeviceType;
use ronn_providers::{
    Environment, EpLibrary, EpLibraryPlugin, LibraryKind, LibraryState, ProviderRegistry,
    CPU_EXECUTION_PROVIDER, CUDA_EXECUTION_PROVIDER,
};

// ============================================================================
// Registration Tests
// ============================================================================

#[test]
fn test_register_unregister_round_trip() -> Result<()> {
    let name = "RoundTripNpu";
    common::configure(name, MockBehavior::supporting(&[RonnHardwareDeviceType::NPU]));
    let registry = ProviderRegistry::with_builtin_providers(common::full_machine())?;

    registry.register_library(name, common::mock_plugin())?;
    assert!(registry.is_registered(name));
    assert_eq!(
        registry.registration_names()?,
        vec![CPU_EXECUTION_PROVIDER.to_string(), name.to_string()]
    );

    let devices = registry.execution_devices()?;
    let ours: Vec<_> = devices.iter().filter(|d| d.ep_name() == name).collect();
    assert_eq!(ours.len(), 1);
    assert_eq!(ours[0].device().kind, HardwareDeviceKind::Npu);
    assert_eq!(ours[0].ep_vendor(), "Mock Vendor");
    assert_eq!(ours[0].registration_name(), name);

    let report = registry.unregister_library(name)?;
    assert_eq!(report.released, 1);
    assert!(report.is_clean());
    assert!(!registry.is_registered(name));
    assert!(registry.execution_devices()?.iter().all(|d| d.ep_name() != name));
    assert_eq!(
        common::stats(name),
        MockStats {
            factories_created: 1,
            factories_released: 1,
            ..MockStats::default()
        }
    );

    // The name can be used again.
    registry.register_library(name, common::mock_plugin())?;
    assert!(registry.is_registered(name));
    Ok(())
}

#[test]
fn test_duplicate_registration_name() -> Result<()> {
    let name = "DuplicateGpu";
    common::configure(name, MockBehavior::supporting(&[RonnHardwareDeviceType::GPU]));
    let registry = ProviderRegistry::new(common::full_machine());

    registry.register_library(name, common::mock_plugin())?;
    let err = registry
        .register_library(name, common::mock_plugin())
        .unwrap_err();

    assert!(matches!(err, CoreError::InvalidArgument(_)));
    assert!(err.to_string().contains("already registered"));
    assert_eq!(registry.execution_devices()?.len(), 1);
    assert_eq!(common::stats(name).factories_created, 1);
    Ok(())
}

#[test]
fn test_failed_load_leaves_no_entry() -> Result<()> {
    let name = "FailingLoad";
    common::configure(
        name,
        MockBehavior {
            fail_load: true,
            ..MockBehavior::supporting(&[RonnHardwareDeviceType::GPU])
        },
    );
    let registry = ProviderRegistry::new(common::full_machine());

    let err = registry
        .register_library(name, common::mock_plugin())
        .unwrap_err();
    assert!(matches!(err, CoreError::Fail(_)));
    assert!(err.to_string().contains("mock CreateEpFactories failure"));
    assert!(!registry.is_registered(name));
    assert!(registry.execution_devices()?.is_empty());
    Ok(())
}

#[test]
fn test_panicking_plugin_fails_registration() -> Result<()> {
    let name = "PanickingLoad";
    common::configure(
        name,
        MockBehavior {
            panic_on_load: true,
            ..MockBehavior::default()
        },
    );
    let registry = ProviderRegistry::new(common::full_machine());

    let err = registry
        .register_library(name, common::mock_plugin())
        .unwrap_err();
    assert!(matches!(err, CoreError::Fail(_)));
    assert!(err.to_string().contains("panicked"));
    assert!(!registry.is_registered(name));
    Ok(())
}

#[test]
fn test_unsupported_factory_version_is_released() -> Result<()> {
    let name = "FutureVersion";
    common::configure(
        name,
        MockBehavior {
            factory_version: 99,
            ..MockBehavior::supporting(&[RonnHardwareDeviceType::NPU])
        },
    );
    let registry = ProviderRegistry::new(common::full_machine());

    let err = registry
        .register_library(name, common::mock_plugin())
        .unwrap_err();
    assert!(matches!(err, CoreError::Fail(_)));
    assert!(err.to_string().contains("unsupported API version 99"));
    assert!(!registry.is_registered(name));

    let stats = common::stats(name);
    assert_eq!(stats.factories_created, 1);
    assert_eq!(stats.factories_released, 1);
    Ok(())
}

#[test]
fn test_failed_release_is_reported() -> Result<()> {
    let name = "FailingRelease";
    common::configure(
        name,
        MockBehavior {
            fail_release: true,
            ..MockBehavior::supporting(&[RonnHardwareDeviceType::CPU])
        },
    );
    let registry = ProviderRegistry::new(common::full_machine());
    registry.register_library(name, common::mock_plugin())?;

    let report = registry.unregister_library(name)?;
    assert_eq!(report.failed, 1);
    assert_eq!(report.released, 0);
    assert!(!report.is_clean());
    assert!(!registry.is_registered(name));
    Ok(())
}

#[test]
fn test_unregister_unknown_name() {
    let registry = ProviderRegistry::new(common::cpu_only_machine());
    let err = registry.unregister_library("NeverRegistered").unwrap_err();
    assert!(matches!(err, CoreError::InvalidArgument(_)));
}

#[test]
fn test_concurrent_registrations() -> Result<()> {
    let names = ["ConcurrentA", "ConcurrentB", "ConcurrentC", "ConcurrentD"];
    for name in names {
        common::configure(name, MockBehavior::supporting(&[RonnHardwareDeviceType::GPU]));
    }
    let registry = ProviderRegistry::new(common::full_machine());

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = names
            .iter()
            .map(|&name| {
                let registry = &registry;
                scope.spawn(move || registry.register_library(name, common::mock_plugin()))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("registration thread panicked"))
            .collect()
    });
    for result in results {
        result?;
    }

    let mut registered = registry.registration_names()?;
    registered.sort();
    assert_eq!(registered, names.to_vec());
    assert_eq!(registry.execution_devices()?.len(), names.len());
    Ok(())
}

// ============================================================================
// Snapshot Tests
// ============================================================================

#[test]
fn test_snapshot_survives_unregister() -> Result<()> {
    let name = "SnapshotGpu";
    common::configure(name, MockBehavior::supporting(&[RonnHardwareDeviceType::GPU]));
    let registry = ProviderRegistry::with_builtin_providers(common::full_machine())?;
    registry.register_library(name, common::mock_plugin())?;

    let before = registry.execution_devices()?;
    registry.unregister_library(name)?;
    let after = registry.execution_devices()?;

    assert_eq!(before.len(), 2);
    assert_eq!(before[1].ep_name(), name);
    assert_eq!(before[1].device().kind, HardwareDeviceKind::Gpu);
    assert!(matches!(before[1].factory(), Err(CoreError::Fail(_))));

    assert_eq!(after.len(), 1);
    assert_eq!(after[0].ep_name(), CPU_EXECUTION_PROVIDER);
    Ok(())
}

#[test]
fn test_release_is_deferred_while_instances_live() -> Result<()> {
    let name = "DeferredNpu";
    common::configure(name, MockBehavior::supporting(&[RonnHardwareDeviceType::NPU]));
    let env = Environment::with_discovery(common::full_machine())?;
    env.register_library(name, common::mock_plugin())?;

    let session = env.create_session(
        SessionOptions::new().with_ep_selection_policy(DevicePolicy::PreferCpu),
    )?;
    assert!(session.has_provider(name));

    let report = env.unregister_execution_provider_library(name)?;
    assert_eq!(report.deferred, 1);
    assert_eq!(common::stats(name).factories_released, 0);

    drop(session);
    let stats = common::stats(name);
    assert_eq!(stats.eps_released, 1);
    assert_eq!(stats.factories_released, 1);
    Ok(())
}

// ============================================================================
// Library Kind Tests
// ============================================================================

#[test]
fn test_example_plugin_advertises_npu() -> Result<()> {
    let registry = ProviderRegistry::new(common::full_machine());
    registry.register_library("ExampleNpu", common::example_plugin())?;

    let devices = registry.execution_devices()?;
    assert_eq!(devices.len(), 1);
    let device = &devices[0];
    assert_eq!(device.ep_name(), "ExampleNpu");
    assert_eq!(device.ep_vendor(), ronn_ep_example::VENDOR);
    assert_eq!(device.device().kind, HardwareDeviceKind::Npu);
    assert_eq!(device.ep_metadata().get("npu_vendor").map(String::as_str), Some("Qualcomm"));
    assert_eq!(
        device.ep_options().get("performance_mode").map(String::as_str),
        Some("balanced")
    );

    let library = registry.library("ExampleNpu").expect("library is registered");
    assert_eq!(library.kind(), LibraryKind::Plugin);
    assert_eq!(library.state(), LibraryState::Loaded);
    Ok(())
}

#[test]
fn test_provider_bridge_exposes_cuda() -> Result<()> {
    let path = common::fake_cuda_library("registry")?;

    let env = Environment::with_discovery(common::full_machine())?;
    env.register_execution_provider_library("CUDA", &path)?;

    let devices = env.execution_devices()?;
    let cuda: Vec<_> = devices
        .iter()
        .filter(|d| d.ep_name() == CUDA_EXECUTION_PROVIDER)
        .collect();
    assert_eq!(cuda.len(), 1);
    assert_eq!(cuda[0].device().kind, HardwareDeviceKind::Gpu);
    assert_eq!(cuda[0].ep_metadata().get("pci_bus_id").map(String::as_str), Some("1"));

    let library = env.registry().library("CUDA").expect("library is registered");
    assert_eq!(library.kind(), LibraryKind::ProviderBridge);

    if let Some(dir) = path.parent() {
        std::fs::remove_dir_all(dir)?;
    }
    Ok(())
}

#[test]
fn test_bridge_registered_twice_is_rejected() -> Result<()> {
    let path = common::fake_cuda_library("twice")?;
    let env = Environment::with_discovery(common::full_machine())?;
    env.register_execution_provider_library("CUDA", &path)?;

    let err = env
        .register_execution_provider_library("CUDA-again", &path)
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidArgument(_)));
    assert!(err.to_string().contains("already provided by library 'CUDA'"));
    assert!(!env.registry().is_registered("CUDA-again"));

    // Selection still sees a single CUDA provider.
    let options = SessionOptions::new().with_ep_selection_policy(DevicePolicy::PreferCpu);
    let session = env.create_session(options)?;
    assert_eq!(
        session.provider_types(),
        vec![CUDA_EXECUTION_PROVIDER, CPU_EXECUTION_PROVIDER]
    );

    drop(session);
    env.unregister_execution_provider_library("CUDA")?;
    if let Some(dir) = path.parent() {
        std::fs::remove_dir_all(dir)?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
#[test]
fn test_library_without_entry_points_is_rejected() -> Result<()> {
    let registry = ProviderRegistry::new(common::full_machine());
    let plugin = Arc::new(EpLibraryPlugin::from_path("NotAPlugin", "libc.so.6"));

    let err = registry.register(plugin.clone()).unwrap_err();
    assert!(matches!(err, CoreError::Fail(_)));
    assert!(err.to_string().contains("CreateEpFactories"));
    assert!(!registry.is_registered("NotAPlugin"));

    // The handle opened to look up the entry points was closed again.
    assert!(!plugin.is_open());
    assert_eq!(plugin.state(), LibraryState::Unloaded);
    Ok(())
}

#[test]
fn test_statistics_by_kind() -> Result<()> {
    let name = "StatsGpu";
    common::configure(name, MockBehavior::supporting(&[RonnHardwareDeviceType::GPU]));
    let registry = ProviderRegistry::with_builtin_providers(common::full_machine())?;
    registry.register_library(name, common::mock_plugin())?;

    let stats = registry.get_statistics();
    assert_eq!(stats.registered_libraries, 2);
    assert_eq!(stats.libraries_by_kind.get("internal"), Some(&1));
    assert_eq!(stats.libraries_by_kind.get("plugin"), Some(&1));
    assert_eq!(stats.execution_devices, 2);
    assert_eq!(stats.execution_devices_by_kind.get(&HardwareDeviceKind::Gpu), Some(&1));
    assert_eq!(stats.discovered_devices, 3);
    Ok(())
}
