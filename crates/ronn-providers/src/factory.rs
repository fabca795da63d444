//! Execution provider factories.
//!
//! A factory answers two questions: which hardware devices it can target, and
//! how to create a provider instance for some of them. Factories come in two
//! variants that share one query surface:
//! - [`InternalEpFactory`]: compiled into the host, backed by closures
//! - [`PluginEpFactory`]: a `RonnEpFactory` table living in a plugin library

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::Arc;

use libloading::Library;
use ronn_core::{
    CoreError, ExecutionProvider, HardwareDevice, Result, SessionLogger, SessionOptions,
};
use ronn_ep_abi::{
    ReleaseEpFactoryFn, RonnEp, RonnEpFactory, RonnHardwareDevice, RonnKeyValuePairs,
    MIN_SUPPORTED_EP_API_VERSION, RONN_EP_API_VERSION,
};
use tracing::{debug, warn};

use crate::host_api::{self, KeyValuePairs};
use crate::plugin_provider::PluginExecutionProvider;

/// What a factory reports for a device it can target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSupport {
    /// Informational metadata about the pairing.
    pub metadata: BTreeMap<String, String>,
    /// Default session options, seeded under `ep.<name>.` during selection.
    pub options: BTreeMap<String, String>,
}

impl DeviceSupport {
    /// Support without metadata or options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Add a default option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// Device predicate of an internal factory.
pub type SupportsDeviceFn = Box<dyn Fn(&HardwareDevice) -> Option<DeviceSupport> + Send + Sync>;

/// Arguments passed to an internal factory's creation function.
#[derive(Debug, Clone, Copy)]
pub struct CreateEpArgs<'a> {
    /// Devices the instance targets.
    pub devices: &'a [Arc<HardwareDevice>],
    /// Metadata reported for each device, parallel to `devices`.
    pub ep_metadata: &'a [BTreeMap<String, String>],
    /// Options of the session the instance is created for.
    pub session_options: &'a SessionOptions,
    /// Logger of that session.
    pub logger: &'a SessionLogger,
}

/// Creation function of an internal factory.
pub type CreateProviderFn =
    Box<dyn Fn(CreateEpArgs<'_>) -> Result<Box<dyn ExecutionProvider>> + Send + Sync>;

/// A factory compiled into the host.
pub struct InternalEpFactory {
    name: String,
    vendor: String,
    supports: SupportsDeviceFn,
    create: CreateProviderFn,
}

impl InternalEpFactory {
    /// Create an internal factory.
    pub fn new(
        name: impl Into<String>,
        vendor: impl Into<String>,
        supports: SupportsDeviceFn,
        create: CreateProviderFn,
    ) -> Self {
        Self {
            name: name.into(),
            vendor: vendor.into(),
            supports,
            create,
        }
    }

    /// Execution provider name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execution provider vendor.
    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    fn create_ep(&self, args: CreateEpArgs<'_>) -> Result<Box<dyn ExecutionProvider>> {
        if args.devices.len() != 1 {
            return Err(CoreError::invalid_argument(format!(
                "{} execution provider factory only supports one device at a time, got {}",
                self.name,
                args.devices.len()
            )));
        }
        (self.create)(args)
    }
}

impl fmt::Debug for InternalEpFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalEpFactory")
            .field("name", &self.name)
            .field("vendor", &self.vendor)
            .finish_non_exhaustive()
    }
}

/// A `RonnEpFactory` table returned by a plugin.
///
/// The factory keeps the plugin's OS library mapped for as long as it is
/// alive, and hands the table back to the plugin's release entry point when
/// dropped.
pub struct PluginEpFactory {
    raw: NonNull<RonnEpFactory>,
    release: Option<ReleaseEpFactoryFn>,
    api_version: u32,
    name: String,
    vendor: String,
    registration_name: String,
    // Declared last so the library is unmapped after the release call.
    _library: Option<Arc<Library>>,
}

// SAFETY: the table is only accessed through its function pointers, and
// plugins are required to make factories usable from any thread.
unsafe impl Send for PluginEpFactory {}
// SAFETY: see above.
unsafe impl Sync for PluginEpFactory {}

impl PluginEpFactory {
    /// Wrap a table returned by a plugin's creation entry point.
    ///
    /// Only the leading version field is read here. Call
    /// [`PluginEpFactory::describe`] before using any other entry.
    ///
    /// # Safety
    /// `raw` must point to a live factory table created by the plugin that
    /// `release` belongs to, and `library` (if any) must be the library both
    /// come from.
    pub(crate) unsafe fn from_raw(
        raw: NonNull<RonnEpFactory>,
        release: ReleaseEpFactoryFn,
        library: Option<Arc<Library>>,
        registration_name: &str,
    ) -> Self {
        let api_version = raw.as_ref().version;
        Self {
            raw,
            release: Some(release),
            api_version,
            name: String::new(),
            vendor: String::new(),
            registration_name: registration_name.to_string(),
            _library: library,
        }
    }

    /// Check the table version and read the factory's name and vendor.
    pub(crate) fn describe(&mut self) -> Result<()> {
        if !(MIN_SUPPORTED_EP_API_VERSION..=RONN_EP_API_VERSION).contains(&self.api_version) {
            return Err(CoreError::fail(format!(
                "execution provider factory from library '{}' uses unsupported API version {} \
                 (supported: {}..={})",
                self.registration_name,
                self.api_version,
                MIN_SUPPORTED_EP_API_VERSION,
                RONN_EP_API_VERSION
            )));
        }

        let (get_name, get_vendor) = (self.table().get_name, self.table().get_vendor);
        // SAFETY: version checked above, the table and its strings are alive.
        unsafe {
            self.name = get_name(self.raw.as_ptr()).to_string_lossy();
            self.vendor = get_vendor(self.raw.as_ptr()).to_string_lossy();
        }

        if self.name.is_empty() {
            return Err(CoreError::fail(format!(
                "execution provider factory from library '{}' reported an empty name",
                self.registration_name
            )));
        }
        Ok(())
    }

    /// Execution provider name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execution provider vendor.
    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    /// ABI version of the factory table.
    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    /// Registration name of the library the factory came from.
    pub fn registration_name(&self) -> &str {
        &self.registration_name
    }

    fn table(&self) -> &RonnEpFactory {
        // SAFETY: the plugin keeps the table alive until it is released, and
        // release only happens when `self` goes away.
        unsafe { self.raw.as_ref() }
    }

    fn get_device_info_if_supported(&self, device: &HardwareDevice) -> Option<DeviceSupport> {
        let mut metadata = KeyValuePairs::new();
        let mut options = KeyValuePairs::new();

        // SAFETY: the device and both maps outlive the call.
        let supported = unsafe {
            (self.table().get_device_info_if_supported)(
                self.raw.as_ptr(),
                host_api::device_handle(device),
                host_api::key_value_pairs_handle_mut(&mut metadata),
                host_api::key_value_pairs_handle_mut(&mut options),
            )
        };

        supported.then_some(DeviceSupport { metadata, options })
    }

    fn create_ep(&self, args: &CreateEpArgs<'_>) -> Result<NonNull<RonnEp>> {
        let devices: Vec<*const RonnHardwareDevice> = args
            .devices
            .iter()
            .map(|device| host_api::device_handle(device))
            .collect();
        let metadata: Vec<*const RonnKeyValuePairs> = args
            .ep_metadata
            .iter()
            .map(host_api::key_value_pairs_handle)
            .collect();
        if devices.len() != metadata.len() {
            return Err(CoreError::invalid_argument(
                "device and metadata lists must have the same length",
            ));
        }

        let mut ep: *mut RonnEp = std::ptr::null_mut();
        // SAFETY: every pointer passed in refers to data that outlives the call.
        let status = unsafe {
            (self.table().create_ep)(
                self.raw.as_ptr(),
                devices.as_ptr(),
                metadata.as_ptr(),
                devices.len(),
                host_api::session_options_handle(args.session_options),
                host_api::logger_handle(args.logger),
                &mut ep,
            )
        };
        // SAFETY: plugins only return statuses created through the host API.
        unsafe { host_api::status_to_result(status) }?;

        let ep = NonNull::new(ep).ok_or_else(|| {
            CoreError::fail(format!(
                "execution provider factory '{}' returned no instance",
                self.name
            ))
        })?;

        // SAFETY: non-null instance just returned by the plugin.
        let version = unsafe { ep.as_ref().version };
        if !(MIN_SUPPORTED_EP_API_VERSION..=RONN_EP_API_VERSION).contains(&version) {
            self.release_ep(ep);
            return Err(CoreError::fail(format!(
                "execution provider '{}' returned an instance with unsupported API version {}",
                self.name, version
            )));
        }
        Ok(ep)
    }

    /// Hand an instance created by this factory back to the plugin.
    pub(crate) fn release_ep(&self, ep: NonNull<RonnEp>) {
        // SAFETY: `ep` came from this factory's `create_ep` and is released once.
        unsafe { (self.table().release_ep)(self.raw.as_ptr(), ep.as_ptr()) }
    }

    /// Release the table through the plugin's release entry point.
    ///
    /// Later calls, including the one made on drop, do nothing.
    pub(crate) fn release(&mut self) -> Result<()> {
        let Some(release) = self.release.take() else {
            return Ok(());
        };
        let raw = self.raw.as_ptr();

        // SAFETY: the table has not been released yet.
        let status = panic::catch_unwind(AssertUnwindSafe(|| unsafe { release(raw) }))
            .map_err(|_| {
                CoreError::fail(format!(
                    "plugin '{}' panicked while releasing factory '{}'",
                    self.registration_name, self.name
                ))
            })?;
        // SAFETY: plugins only return statuses created through the host API.
        unsafe { host_api::status_to_result(status) }?;

        debug!(
            "Released execution provider factory '{}' from library '{}'",
            self.name, self.registration_name
        );
        Ok(())
    }
}

impl Drop for PluginEpFactory {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(
                "Failed to release execution provider factory '{}' from library '{}': {}",
                self.name, self.registration_name, e
            );
        }
    }
}

impl fmt::Debug for PluginEpFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginEpFactory")
            .field("name", &self.name)
            .field("vendor", &self.vendor)
            .field("api_version", &self.api_version)
            .field("registration_name", &self.registration_name)
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// An execution provider factory of either variant.
#[derive(Debug)]
pub enum EpFactory {
    /// Compiled into the host.
    Internal(InternalEpFactory),
    /// Provided by a plugin library.
    Plugin(PluginEpFactory),
}

impl EpFactory {
    /// Execution provider name.
    pub fn name(&self) -> &str {
        match self {
            Self::Internal(factory) => factory.name(),
            Self::Plugin(factory) => factory.name(),
        }
    }

    /// Execution provider vendor.
    pub fn vendor(&self) -> &str {
        match self {
            Self::Internal(factory) => factory.vendor(),
            Self::Plugin(factory) => factory.vendor(),
        }
    }

    /// ABI version of the factory. Internal factories report the host's.
    pub fn api_version(&self) -> u32 {
        match self {
            Self::Internal(_) => RONN_EP_API_VERSION,
            Self::Plugin(factory) => factory.api_version(),
        }
    }

    /// Whether this factory is compiled into the host.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    /// Ask whether the factory can target `device`.
    ///
    /// Every call returns freshly built metadata and options.
    pub fn get_device_info_if_supported(&self, device: &HardwareDevice) -> Option<DeviceSupport> {
        match self {
            Self::Internal(factory) => (factory.supports)(device),
            Self::Plugin(factory) => factory.get_device_info_if_supported(device),
        }
    }

    /// Create a provider instance for `devices`.
    ///
    /// Plugin instances are wrapped in a [`PluginExecutionProvider`] that keeps
    /// this factory alive and releases the instance when dropped.
    pub fn create_ep(
        self: &Arc<Self>,
        devices: &[Arc<HardwareDevice>],
        ep_metadata: &[BTreeMap<String, String>],
        session_options: &SessionOptions,
        logger: &SessionLogger,
    ) -> Result<Box<dyn ExecutionProvider>> {
        let args = CreateEpArgs {
            devices,
            ep_metadata,
            session_options,
            logger,
        };

        match &**self {
            Self::Internal(factory) => factory.create_ep(args),
            Self::Plugin(factory) => {
                let ep = factory.create_ep(&args)?;
                // SAFETY: `ep` was just created by this plugin factory.
                let provider = unsafe {
                    PluginExecutionProvider::new(Arc::clone(self), ep, devices.to_vec())
                };
                Ok(Box::new(provider))
            }
        }
    }

    /// Release the factory.
    ///
    /// Internal factories have nothing to release. Plugin factories are handed
    /// to the plugin's release entry point.
    pub fn release(self) -> Result<()> {
        match self {
            Self::Internal(_) => Ok(()),
            Self::Plugin(mut factory) => factory.release(),
        }
    }
}
