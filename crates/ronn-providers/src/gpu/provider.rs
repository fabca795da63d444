//! CUDA execution provider.
//!
//! Targets NVIDIA GPUs. Options are read from `ep.CUDA.*` session entries.

use std::any::Any;
use std::sync::Arc;

use ronn_core::{
    CoreError, ExecutionProvider, HardwareDevice, HardwareDeviceKind, Result, SessionOptions,
};
use tracing::info;

use crate::cpu::RONN_VENDOR;
use crate::device::vendor_ids;
use crate::factory::{CreateEpArgs, DeviceSupport, InternalEpFactory};

/// Name of the CUDA execution provider.
pub const CUDA_EXECUTION_PROVIDER: &str = "CUDA";

/// Configuration for the CUDA execution provider.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CudaProviderConfig {
    /// CUDA device ordinal.
    pub device_id: u32,
    /// Memory limit in bytes (None = no limit).
    pub gpu_mem_limit: Option<usize>,
}

impl CudaProviderConfig {
    /// Build a configuration from `ep.CUDA.*` session entries.
    pub fn from_session_options(options: &SessionOptions) -> Result<Self> {
        let provider_options = options.provider_options(CUDA_EXECUTION_PROVIDER);

        let device_id = match provider_options.get("device_id") {
            Some(value) => parse_option(value, "device_id")?,
            None => 0,
        };
        let gpu_mem_limit = provider_options
            .get("gpu_mem_limit")
            .map(|value| parse_option(value, "gpu_mem_limit"))
            .transpose()?;

        Ok(Self {
            device_id,
            gpu_mem_limit,
        })
    }
}

fn parse_option<T: std::str::FromStr>(value: &str, option: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        CoreError::invalid_argument(format!(
            "invalid value '{value}' for ep.{CUDA_EXECUTION_PROVIDER}.{option}"
        ))
    })
}

/// CUDA execution provider.
#[derive(Debug)]
pub struct CudaExecutionProvider {
    config: CudaProviderConfig,
    devices: Vec<Arc<HardwareDevice>>,
}

impl CudaExecutionProvider {
    /// Create a CUDA execution provider for `devices`.
    pub fn new(config: CudaProviderConfig, devices: Vec<Arc<HardwareDevice>>) -> Self {
        info!(
            "Created CUDA execution provider on device {}",
            config.device_id
        );
        Self { config, devices }
    }

    /// Provider configuration.
    pub fn config(&self) -> &CudaProviderConfig {
        &self.config
    }
}

impl ExecutionProvider for CudaExecutionProvider {
    fn provider_type(&self) -> &str {
        CUDA_EXECUTION_PROVIDER
    }

    fn vendor(&self) -> &str {
        RONN_VENDOR
    }

    fn devices(&self) -> &[Arc<HardwareDevice>] {
        &self.devices
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn supports_device(device: &HardwareDevice) -> Option<DeviceSupport> {
    if device.kind != HardwareDeviceKind::Gpu || device.vendor_id != vendor_ids::NVIDIA {
        return None;
    }

    let mut support = DeviceSupport::new();
    if device.has_bus_id() {
        support = support.with_metadata("pci_bus_id", device.bus_id.to_string());
    }
    Some(support)
}

fn create_cuda_provider(args: CreateEpArgs<'_>) -> Result<Box<dyn ExecutionProvider>> {
    let config = CudaProviderConfig::from_session_options(args.session_options)?;
    Ok(Box::new(CudaExecutionProvider::new(config, args.devices.to_vec())))
}

/// The factory of the CUDA execution provider.
pub fn create_cuda_factory() -> InternalEpFactory {
    InternalEpFactory::new(
        CUDA_EXECUTION_PROVIDER,
        RONN_VENDOR,
        Box::new(supports_device),
        Box::new(create_cuda_provider),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports_only_nvidia_gpus() {
        let nvidia = HardwareDevice::new(HardwareDeviceKind::Gpu, "NVIDIA", vendor_ids::NVIDIA, 1);
        let amd = HardwareDevice::new(HardwareDeviceKind::Gpu, "AMD", vendor_ids::AMD, 2);
        let cpu =
            HardwareDevice::new(HardwareDeviceKind::Cpu, "GenuineIntel", vendor_ids::INTEL, -1);

        let support = supports_device(&nvidia).unwrap();
        assert_eq!(support.metadata.get("pci_bus_id").map(String::as_str), Some("1"));
        assert!(supports_device(&amd).is_none());
        assert!(supports_device(&cpu).is_none());
    }

    #[test]
    fn test_config_from_options() -> anyhow::Result<()> {
        let mut options = SessionOptions::new();
        options.add_config_entry("ep.CUDA.device_id", "1")?;
        options.add_config_entry("ep.CUDA.gpu_mem_limit", "1073741824")?;

        let config = CudaProviderConfig::from_session_options(&options)?;
        assert_eq!(config.device_id, 1);
        assert_eq!(config.gpu_mem_limit, Some(1 << 30));

        options.add_config_entry("ep.CUDA.device_id", "first")?;
        assert!(CudaProviderConfig::from_session_options(&options).is_err());
        Ok(())
    }
}
