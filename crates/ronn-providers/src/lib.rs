//! RONN Execution Provider Framework
//!
//! This crate turns discovered hardware into live execution provider
//! instances for inference sessions:
//! - Hardware device discovery
//! - Execution provider libraries: built-in, ABI plugins and bridged legacy
//!   providers
//! - The registry of loaded libraries and the device pairings they expose
//! - Automatic provider selection from a device policy
//!
//! ## Architecture
//!
//! - **Discovery**: enumerates CPUs, GPUs and NPUs once per process
//! - **Libraries**: own factories and move through a load/unload lifecycle
//! - **Registry**: publishes an immutable snapshot of execution devices
//! - **Selection**: ranks providers NPU > GPU > CPU and attaches them
//!
//! ## Example
//!
//! ```rust
//! use ronn_core::{DevicePolicy, SessionOptions};
//! use ronn_providers::Environment;
//!
//! let env = Environment::new()?;
//! for device in env.execution_devices()?.iter() {
//!     println!("{} on {}", device.ep_name(), device.device());
//! }
//!
//! let options = SessionOptions::new().with_ep_selection_policy(DevicePolicy::PreferCpu);
//! let session = env.create_session(options)?;
//! assert!(session.has_provider("CPU"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod cpu;
pub mod device;
pub mod environment;
pub mod factory;
pub mod gpu;
mod host_api;
pub mod library;
pub mod plugin_provider;
pub mod registry;
pub mod selection;

pub use cpu::{
    create_cpu_factory, CpuExecutionProvider, CpuProviderConfig, CPU_EXECUTION_PROVIDER,
    RONN_VENDOR,
};
pub use device::{DeviceDiscovery, DeviceSource, PlatformDeviceSource, StaticDeviceSource};
pub use environment::Environment;
pub use factory::{CreateEpArgs, DeviceSupport, EpFactory, InternalEpFactory, PluginEpFactory};
pub use gpu::{
    create_cuda_factory, CudaExecutionProvider, CudaProviderConfig, CUDA_EXECUTION_PROVIDER,
};
pub use host_api::host_api;
pub use library::{
    EpLibrary, EpLibraryInternal, EpLibraryPlugin, EpLibraryProviderBridge, EpLibrarySource,
    LibraryKind, LibraryState, PluginEntryPoints, UnloadReport,
};
pub use plugin_provider::PluginExecutionProvider;
pub use registry::{ExecutionDevice, ExecutionDevices, ProviderRegistry, RegistryStatistics};
pub use selection::{select_and_attach, EpSelection, SelectionDelegate};

// Re-export core types that providers use
pub use ronn_core::{ExecutionProvider, HardwareDevice, HardwareDeviceKind};
