//! RONN Execution Provider ABI
//!
//! This crate defines the binary contract between the RONN host and execution
//! provider (EP) plugins that are compiled separately and loaded from a shared
//! library at runtime. Host and plugin may be built by different toolchains, so
//! everything crossing the boundary is `#[repr(C)]`:
//! - **Function tables**: [`RonnEpFactory`], [`RonnEp`] and [`RonnHostApi`]
//! - **Opaque handles**: host-owned objects a plugin only ever sees by pointer
//! - **Value types**: [`RonnStr`] string views and `u32` code newtypes
//!
//! ## Versioning
//!
//! Every function table starts with a `version: u32` field. Fields are only ever
//! appended, never reordered or removed, so a plugin built against an older
//! version of this crate stays callable by a newer host. The host checks the
//! leading version of every table it receives before calling any entry.
//!
//! ## Entry points
//!
//! A plugin library exports two symbols:
//! - [`CREATE_EP_FACTORIES_SYMBOL`] with the [`CreateEpFactoriesFn`] signature
//! - [`RELEASE_EP_FACTORY_SYMBOL`] with the [`ReleaseEpFactoryFn`] signature

#![deny(missing_docs)]
#![warn(clippy::all)]

use std::marker::{PhantomData, PhantomPinned};

/// Version of the function tables defined by this crate.
pub const RONN_EP_API_VERSION: u32 = 1;

/// Oldest table version the host still knows how to call.
pub const MIN_SUPPORTED_EP_API_VERSION: u32 = 1;

/// Symbol name of the factory creation entry point (NUL terminated).
pub const CREATE_EP_FACTORIES_SYMBOL: &[u8] = b"CreateEpFactories\0";

/// Symbol name of the factory release entry point (NUL terminated).
pub const RELEASE_EP_FACTORY_SYMBOL: &[u8] = b"ReleaseEpFactory\0";

/// Number of factory slots the host offers to [`CreateEpFactoriesFn`].
pub const MAX_EP_FACTORIES_PER_LIBRARY: usize = 4;

/// Borrowed UTF-8 string passed across the ABI as pointer + length.
///
/// The referenced bytes are owned by whichever side produced the view and are
/// only guaranteed to be valid for the duration of the call, unless the
/// function documentation says otherwise.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RonnStr {
    /// Pointer to the first byte. May be null when `len` is 0.
    pub data: *const u8,
    /// Length in bytes.
    pub len: usize,
}

impl RonnStr {
    /// An empty string view.
    pub const fn empty() -> Self {
        Self {
            data: std::ptr::null(),
            len: 0,
        }
    }

    /// Borrow `s` as a string view. The view must not outlive `s`.
    pub const fn new(s: &str) -> Self {
        Self {
            data: s.as_ptr(),
            len: s.len(),
        }
    }

    /// Interpret the view as a `&str`.
    ///
    /// Returns `None` if the bytes are not valid UTF-8.
    ///
    /// # Safety
    /// `data` must point to `len` readable bytes that stay alive and unmodified
    /// for the chosen lifetime `'a`.
    pub unsafe fn as_str<'a>(&self) -> Option<&'a str> {
        if self.len == 0 {
            return Some("");
        }
        if self.data.is_null() {
            return None;
        }
        let bytes = std::slice::from_raw_parts(self.data, self.len);
        std::str::from_utf8(bytes).ok()
    }

    /// Copy the view into an owned `String`, replacing invalid UTF-8.
    ///
    /// # Safety
    /// Same requirements as [`RonnStr::as_str`] for the duration of the call.
    pub unsafe fn to_string_lossy(&self) -> String {
        if self.len == 0 || self.data.is_null() {
            return String::new();
        }
        let bytes = std::slice::from_raw_parts(self.data, self.len);
        String::from_utf8_lossy(bytes).into_owned()
    }
}

impl Default for RonnStr {
    fn default() -> Self {
        Self::empty()
    }
}

/// Status code carried by a [`RonnStatus`].
///
/// A newtype over `u32` rather than an enum so that codes added by a newer
/// host can never produce an invalid enum value inside an older plugin.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RonnErrorCode(pub u32);

impl RonnErrorCode {
    /// Success.
    pub const OK: Self = Self(0);
    /// Generic failure.
    pub const FAIL: Self = Self(1);
    /// An argument was invalid.
    pub const INVALID_ARGUMENT: Self = Self(2);
    /// The requested functionality is not implemented.
    pub const NOT_IMPLEMENTED: Self = Self(9);
}

/// Kind of a hardware device.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RonnHardwareDeviceType(pub u32);

impl RonnHardwareDeviceType {
    /// Central processing unit.
    pub const CPU: Self = Self(0);
    /// Graphics processing unit.
    pub const GPU: Self = Self(1);
    /// Neural processing unit.
    pub const NPU: Self = Self(2);
}

/// Severity passed to [`RonnHostApi::log`].
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RonnLoggingLevel(pub u32);

impl RonnLoggingLevel {
    /// Verbose diagnostics.
    pub const VERBOSE: Self = Self(0);
    /// Informational.
    pub const INFO: Self = Self(1);
    /// Warning.
    pub const WARNING: Self = Self(2);
    /// Error.
    pub const ERROR: Self = Self(3);
    /// Fatal error.
    pub const FATAL: Self = Self(4);
}

macro_rules! opaque_handle {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[repr(C)]
            pub struct $name {
                _data: [u8; 0],
                _marker: PhantomData<(*mut u8, PhantomPinned)>,
            }
        )*
    };
}

opaque_handle! {
    /// Error status allocated by the host. A null `*mut RonnStatus` means success.
    RonnStatus;
    /// A discovered hardware device, owned by the host.
    RonnHardwareDevice;
    /// A string to string map owned by the host.
    RonnKeyValuePairs;
    /// Read-only view of the session configuration, owned by the host.
    RonnSessionOptions;
    /// Session logging sink, owned by the host.
    RonnLogger;
}

/// Functions the host offers to plugins.
///
/// A pointer to this table is passed to [`CreateEpFactoriesFn`] and stays valid
/// for the lifetime of the process.
#[repr(C)]
pub struct RonnHostApi {
    /// Table version, see [`RONN_EP_API_VERSION`].
    pub version: u32,

    /// Allocate a status with the given code and message. Ownership passes to
    /// whoever receives it; returning it from an ABI call hands it to the host.
    pub create_status:
        unsafe extern "C" fn(code: RonnErrorCode, message: RonnStr) -> *mut RonnStatus,
    /// Free a status that is not going to be returned to the host.
    pub release_status: unsafe extern "C" fn(status: *mut RonnStatus),

    /// Kind of a hardware device.
    pub hardware_device_type:
        unsafe extern "C" fn(device: *const RonnHardwareDevice) -> RonnHardwareDeviceType,
    /// Vendor name of a hardware device. Valid while the device is alive.
    pub hardware_device_vendor: unsafe extern "C" fn(device: *const RonnHardwareDevice) -> RonnStr,
    /// PCI vendor id of a hardware device, 0 if unknown.
    pub hardware_device_vendor_id: unsafe extern "C" fn(device: *const RonnHardwareDevice) -> u32,
    /// Bus id of a hardware device, -1 if unknown.
    pub hardware_device_bus_id: unsafe extern "C" fn(device: *const RonnHardwareDevice) -> i32,
    /// Look up a device property. Writes the value and returns `true` if found.
    pub hardware_device_property: unsafe extern "C" fn(
        device: *const RonnHardwareDevice,
        key: RonnStr,
        value: *mut RonnStr,
    ) -> bool,

    /// Insert or replace an entry.
    pub key_value_pairs_add:
        unsafe extern "C" fn(pairs: *mut RonnKeyValuePairs, key: RonnStr, value: RonnStr),
    /// Look up an entry. Writes the value and returns `true` if found.
    pub key_value_pairs_get: unsafe extern "C" fn(
        pairs: *const RonnKeyValuePairs,
        key: RonnStr,
        value: *mut RonnStr,
    ) -> bool,

    /// Look up a session configuration entry. Writes the value and returns
    /// `true` if found.
    pub session_config_entry: unsafe extern "C" fn(
        options: *const RonnSessionOptions,
        key: RonnStr,
        value: *mut RonnStr,
    ) -> bool,

    /// Write a message to the session logger.
    pub log:
        unsafe extern "C" fn(logger: *const RonnLogger, level: RonnLoggingLevel, message: RonnStr),
}

/// An execution provider instance created by a plugin factory.
///
/// Plugins embed this table as the first field of their own `#[repr(C)]`
/// instance type and hand out a pointer to it.
#[repr(C)]
pub struct RonnEp {
    /// Table version, see [`RONN_EP_API_VERSION`].
    pub version: u32,
    /// Name of the execution provider type.
    pub get_name: unsafe extern "C" fn(this: *const RonnEp) -> RonnStr,
}

/// Factory table a plugin implements for each execution provider it offers.
///
/// Plugins embed this table as the first field of their own `#[repr(C)]`
/// factory type. The factory lives in plugin memory and must not be used after
/// it was handed to [`ReleaseEpFactoryFn`].
#[repr(C)]
pub struct RonnEpFactory {
    /// Table version, see [`RONN_EP_API_VERSION`].
    pub version: u32,

    /// Execution provider name. Valid while the factory is alive.
    pub get_name: unsafe extern "C" fn(this: *const RonnEpFactory) -> RonnStr,
    /// Execution provider vendor. Valid while the factory is alive.
    pub get_vendor: unsafe extern "C" fn(this: *const RonnEpFactory) -> RonnStr,

    /// Return `true` if the factory can target `device`. May add informational
    /// metadata to `ep_metadata` and default session options to `ep_options`.
    /// Both maps are freshly created by the host for every call.
    pub get_device_info_if_supported: unsafe extern "C" fn(
        this: *const RonnEpFactory,
        device: *const RonnHardwareDevice,
        ep_metadata: *mut RonnKeyValuePairs,
        ep_options: *mut RonnKeyValuePairs,
    ) -> bool,

    /// Create an execution provider instance for `num_devices` devices that
    /// were previously reported as supported.
    pub create_ep: unsafe extern "C" fn(
        this: *mut RonnEpFactory,
        devices: *const *const RonnHardwareDevice,
        ep_metadata: *const *const RonnKeyValuePairs,
        num_devices: usize,
        session_options: *const RonnSessionOptions,
        logger: *const RonnLogger,
        ep: *mut *mut RonnEp,
    ) -> *mut RonnStatus,

    /// Release an instance returned by `create_ep`. Called exactly once per
    /// instance.
    pub release_ep: unsafe extern "C" fn(this: *mut RonnEpFactory, ep: *mut RonnEp),
}

/// Signature of the [`CREATE_EP_FACTORIES_SYMBOL`] entry point.
///
/// Writes up to `max_factories` factory pointers into `factories` and their
/// count into `num_factories`. Uses the `C-unwind` ABI so that a panic inside
/// the plugin surfaces as a load failure in the host instead of an abort.
pub type CreateEpFactoriesFn = unsafe extern "C-unwind" fn(
    registration_name: RonnStr,
    host_api: *const RonnHostApi,
    factories: *mut *mut RonnEpFactory,
    max_factories: usize,
    num_factories: *mut usize,
) -> *mut RonnStatus;

/// Signature of the [`RELEASE_EP_FACTORY_SYMBOL`] entry point.
///
/// Called exactly once for each factory returned by [`CreateEpFactoriesFn`].
pub type ReleaseEpFactoryFn =
    unsafe extern "C-unwind" fn(factory: *mut RonnEpFactory) -> *mut RonnStatus;
