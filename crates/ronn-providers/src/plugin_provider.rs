//! Adapter that lets a plugin-created instance live in a session.

use std::any::Any;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use ronn_core::{ExecutionProvider, HardwareDevice};
use ronn_ep_abi::RonnEp;
use tracing::debug;

use crate::factory::EpFactory;

/// An execution provider instance created by a plugin factory.
///
/// Holds the factory that created it, which in turn keeps the plugin library
/// mapped. The instance is handed back to the factory exactly once, on drop.
pub struct PluginExecutionProvider {
    ep: NonNull<RonnEp>,
    name: String,
    vendor: String,
    devices: Vec<Arc<HardwareDevice>>,
    factory: Arc<EpFactory>,
}

// SAFETY: plugins are required to make instances usable from any thread, and
// the instance is only touched through its function table.
unsafe impl Send for PluginExecutionProvider {}
// SAFETY: see above.
unsafe impl Sync for PluginExecutionProvider {}

impl PluginExecutionProvider {
    /// Wrap an instance.
    ///
    /// # Safety
    /// `ep` must have been created by `factory`, which must be the plugin
    /// variant, and must not be released by anyone else.
    pub(crate) unsafe fn new(
        factory: Arc<EpFactory>,
        ep: NonNull<RonnEp>,
        devices: Vec<Arc<HardwareDevice>>,
    ) -> Self {
        let reported = (ep.as_ref().get_name)(ep.as_ptr()).to_string_lossy();
        let name = if reported.is_empty() {
            factory.name().to_string()
        } else {
            reported
        };
        let vendor = factory.vendor().to_string();

        Self {
            ep,
            name,
            vendor,
            devices,
            factory,
        }
    }

    /// Factory that created this instance.
    pub fn factory(&self) -> &Arc<EpFactory> {
        &self.factory
    }

    /// Raw instance pointer, for plugin-specific extensions.
    pub fn as_raw(&self) -> NonNull<RonnEp> {
        self.ep
    }
}

impl ExecutionProvider for PluginExecutionProvider {
    fn provider_type(&self) -> &str {
        &self.name
    }

    fn vendor(&self) -> &str {
        &self.vendor
    }

    fn devices(&self) -> &[Arc<HardwareDevice>] {
        &self.devices
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for PluginExecutionProvider {
    fn drop(&mut self) {
        if let EpFactory::Plugin(factory) = &*self.factory {
            factory.release_ep(self.ep);
            debug!("Released execution provider instance '{}'", self.name);
        }
    }
}

impl fmt::Debug for PluginExecutionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginExecutionProvider")
            .field("name", &self.name)
            .field("vendor", &self.vendor)
            .field("devices", &self.devices.len())
            .finish()
    }
}
