//! GPU execution provider module.
//!
//! Provides the CUDA execution provider, which is exposed through the legacy
//! provider bridge rather than the plugin ABI.

pub mod provider;

pub use provider::{
    CudaExecutionProvider, CudaProviderConfig, CUDA_EXECUTION_PROVIDER, create_cuda_factory,
};
