//! Example RONN execution provider plugin.
//!
//! Builds as a shared library exporting the two RONN plugin entry points, and
//! as an rlib so the host can link it statically (see [`entry_points`]).
//!
//! The plugin offers one factory per registration. The factory is named after
//! the registration name, targets NPU devices and understands one session
//! option, `ep.<name>.performance_mode`, which must be one of
//! [`PERFORMANCE_MODES`]. It only talks to the host through the
//! [`RonnHostApi`] table it is handed, so it depends on nothing but
//! `ronn-ep-abi`.

#![deny(missing_docs)]
#![warn(clippy::all)]

use std::ptr;

use ronn_ep_abi::{
    CreateEpFactoriesFn, ReleaseEpFactoryFn, RonnEp, RonnEpFactory, RonnErrorCode,
    RonnHardwareDevice, RonnHardwareDeviceType, RonnHostApi, RonnKeyValuePairs, RonnLogger,
    RonnLoggingLevel, RonnSessionOptions, RonnStatus, RonnStr, RONN_EP_API_VERSION,
};

/// Vendor reported by the example factory.
pub const VENDOR: &str = "RONN Examples";

/// Session option read when an instance is created.
pub const PERFORMANCE_MODE_OPTION: &str = "performance_mode";

/// Performance mode advertised as the default for every supported device.
pub const DEFAULT_PERFORMANCE_MODE: &str = "balanced";

/// Accepted values of the performance mode option.
pub const PERFORMANCE_MODES: &[&str] = &["power_saver", "balanced", "high_performance"];

#[repr(C)]
struct ExampleEpFactory {
    base: RonnEpFactory,
    host_api: &'static RonnHostApi,
    name: String,
}

#[repr(C)]
struct ExampleEp {
    base: RonnEp,
    name: String,
    performance_mode: String,
}

unsafe fn error_status(api: &RonnHostApi, code: RonnErrorCode, message: &str) -> *mut RonnStatus {
    (api.create_status)(code, RonnStr::new(message))
}

unsafe fn host_log(
    api: &RonnHostApi,
    logger: *const RonnLogger,
    level: RonnLoggingLevel,
    message: &str,
) {
    (api.log)(logger, level, RonnStr::new(message));
}

unsafe extern "C" fn factory_get_name(this: *const RonnEpFactory) -> RonnStr {
    match this.cast::<ExampleEpFactory>().as_ref() {
        Some(factory) => RonnStr::new(&factory.name),
        None => RonnStr::empty(),
    }
}

unsafe extern "C" fn factory_get_vendor(_this: *const RonnEpFactory) -> RonnStr {
    RonnStr::new(VENDOR)
}

unsafe extern "C" fn factory_get_device_info_if_supported(
    this: *const RonnEpFactory,
    device: *const RonnHardwareDevice,
    ep_metadata: *mut RonnKeyValuePairs,
    ep_options: *mut RonnKeyValuePairs,
) -> bool {
    let Some(factory) = this.cast::<ExampleEpFactory>().as_ref() else {
        return false;
    };
    let api = factory.host_api;

    if (api.hardware_device_type)(device) != RonnHardwareDeviceType::NPU {
        return false;
    }

    let vendor = (api.hardware_device_vendor)(device);
    (api.key_value_pairs_add)(ep_metadata, RonnStr::new("npu_vendor"), vendor);
    (api.key_value_pairs_add)(
        ep_options,
        RonnStr::new(PERFORMANCE_MODE_OPTION),
        RonnStr::new(DEFAULT_PERFORMANCE_MODE),
    );
    true
}

unsafe extern "C" fn factory_create_ep(
    this: *mut RonnEpFactory,
    devices: *const *const RonnHardwareDevice,
    _ep_metadata: *const *const RonnKeyValuePairs,
    num_devices: usize,
    session_options: *const RonnSessionOptions,
    logger: *const RonnLogger,
    ep: *mut *mut RonnEp,
) -> *mut RonnStatus {
    // SAFETY: the host only calls this with a factory returned by
    // `CreateEpFactories`.
    let factory = &*this.cast::<ExampleEpFactory>();
    let api = factory.host_api;

    if ep.is_null() {
        return error_status(
            api,
            RonnErrorCode::INVALID_ARGUMENT,
            "instance output pointer is null",
        );
    }
    if devices.is_null() || num_devices != 1 {
        return error_status(
            api,
            RonnErrorCode::INVALID_ARGUMENT,
            &format!(
                "{} only supports one device at a time, got {}",
                factory.name, num_devices
            ),
        );
    }

    let key = format!("ep.{}.{}", factory.name, PERFORMANCE_MODE_OPTION);
    let mut value = RonnStr::empty();
    let configured = (api.session_config_entry)(session_options, RonnStr::new(&key), &mut value);
    let performance_mode = if configured {
        value.to_string_lossy()
    } else {
        DEFAULT_PERFORMANCE_MODE.to_string()
    };

    if !PERFORMANCE_MODES.contains(&performance_mode.as_str()) {
        return error_status(
            api,
            RonnErrorCode::INVALID_ARGUMENT,
            &format!("invalid value '{performance_mode}' for {key}"),
        );
    }

    host_log(
        api,
        logger,
        RonnLoggingLevel::INFO,
        &format!("creating {} instance in {} mode", factory.name, performance_mode),
    );

    let instance = Box::new(ExampleEp {
        base: RonnEp {
            version: RONN_EP_API_VERSION,
            get_name: ep_get_name,
        },
        name: factory.name.clone(),
        performance_mode,
    });
    ep.write(Box::into_raw(instance).cast());
    ptr::null_mut()
}

unsafe extern "C" fn factory_release_ep(_this: *mut RonnEpFactory, ep: *mut RonnEp) {
    if !ep.is_null() {
        drop(Box::from_raw(ep.cast::<ExampleEp>()));
    }
}

unsafe extern "C" fn ep_get_name(this: *const RonnEp) -> RonnStr {
    match this.cast::<ExampleEp>().as_ref() {
        Some(ep) => RonnStr::new(&ep.name),
        None => RonnStr::empty(),
    }
}

/// Create the plugin's factory for `registration_name`.
///
/// # Safety
/// `host_api` must point to a host API table that outlives the process, and
/// `factories` must have room for `max_factories` pointers.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C-unwind" fn CreateEpFactories(
    registration_name: RonnStr,
    host_api: *const RonnHostApi,
    factories: *mut *mut RonnEpFactory,
    max_factories: usize,
    num_factories: *mut usize,
) -> *mut RonnStatus {
    let api: &'static RonnHostApi = match host_api.as_ref() {
        Some(api) => api,
        None => panic!("CreateEpFactories called without a host API table"),
    };

    if api.version < RONN_EP_API_VERSION {
        return error_status(
            api,
            RonnErrorCode::FAIL,
            &format!("host API version {} is too old", api.version),
        );
    }
    if factories.is_null() || num_factories.is_null() || max_factories < 1 {
        return error_status(
            api,
            RonnErrorCode::INVALID_ARGUMENT,
            "no room for an execution provider factory",
        );
    }

    let name = registration_name.to_string_lossy();
    if name.is_empty() {
        return error_status(
            api,
            RonnErrorCode::INVALID_ARGUMENT,
            "registration name must not be empty",
        );
    }

    let factory = Box::new(ExampleEpFactory {
        base: RonnEpFactory {
            version: RONN_EP_API_VERSION,
            get_name: factory_get_name,
            get_vendor: factory_get_vendor,
            get_device_info_if_supported: factory_get_device_info_if_supported,
            create_ep: factory_create_ep,
            release_ep: factory_release_ep,
        },
        host_api: api,
        name,
    });

    factories.write(Box::into_raw(factory).cast());
    num_factories.write(1);
    ptr::null_mut()
}

/// Release a factory created by [`CreateEpFactories`].
///
/// # Safety
/// `factory` must be null or a factory returned by [`CreateEpFactories`] that
/// has not been released yet.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C-unwind" fn ReleaseEpFactory(factory: *mut RonnEpFactory) -> *mut RonnStatus {
    if !factory.is_null() {
        drop(Box::from_raw(factory.cast::<ExampleEpFactory>()));
    }
    ptr::null_mut()
}

/// The plugin's entry points, for linking the plugin into the host process.
pub fn entry_points() -> (CreateEpFactoriesFn, ReleaseEpFactoryFn) {
    (CreateEpFactories, ReleaseEpFactory)
}

/// Performance mode an instance was created with.
///
/// # Safety
/// `ep` must be a live instance created by this plugin.
pub unsafe fn instance_performance_mode<'a>(ep: *const RonnEp) -> Option<&'a str> {
    ep.cast::<ExampleEp>()
        .as_ref()
        .map(|ep| ep.performance_mode.as_str())
}
