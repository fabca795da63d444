//! Host side of the plugin ABI.
//!
//! Plugins only ever see host objects through the opaque handle types of
//! `ronn_ep_abi`. The handles are plain pointers to the host's own Rust types:
//!
//! | ABI handle             | host type                      |
//! |------------------------|--------------------------------|
//! | `RonnHardwareDevice`   | [`HardwareDevice`]             |
//! | `RonnKeyValuePairs`    | `BTreeMap<String, String>`     |
//! | `RonnSessionOptions`   | [`SessionOptions`]             |
//! | `RonnLogger`           | [`SessionLogger`]              |
//! | `RonnStatus`           | boxed [`HostStatus`]           |
//!
//! Every function in [`RonnHostApi`] tolerates null handles.

use std::collections::BTreeMap;

use ronn_core::{
    CoreError, ErrorCode, HardwareDevice, HardwareDeviceKind, LogLevel, Result, SessionLogger,
    SessionOptions,
};
use ronn_ep_abi::{
    RonnErrorCode, RonnHardwareDevice, RonnHardwareDeviceType, RonnHostApi, RonnKeyValuePairs,
    RonnLogger, RonnLoggingLevel, RonnSessionOptions, RonnStatus, RonnStr, RONN_EP_API_VERSION,
};

/// Key/value map type behind `RonnKeyValuePairs`.
pub(crate) type KeyValuePairs = BTreeMap<String, String>;

/// Status object behind `RonnStatus`.
#[derive(Debug)]
pub(crate) struct HostStatus {
    code: RonnErrorCode,
    message: String,
}

static HOST_API: RonnHostApi = RonnHostApi {
    version: RONN_EP_API_VERSION,
    create_status,
    release_status,
    hardware_device_type,
    hardware_device_vendor,
    hardware_device_vendor_id,
    hardware_device_bus_id,
    hardware_device_property,
    key_value_pairs_add,
    key_value_pairs_get,
    session_config_entry,
    log,
};

/// The host API table handed to plugins. Lives for the whole process.
pub fn host_api() -> &'static RonnHostApi {
    &HOST_API
}

pub(crate) fn error_code_from_abi(code: RonnErrorCode) -> ErrorCode {
    match code {
        RonnErrorCode::INVALID_ARGUMENT => ErrorCode::InvalidArgument,
        RonnErrorCode::NOT_IMPLEMENTED => ErrorCode::NotImplemented,
        _ => ErrorCode::Fail,
    }
}

/// Take ownership of a status returned across the ABI.
///
/// A null status, or one carrying `OK`, is success.
///
/// # Safety
/// `status` must be null or a pointer obtained from this module's
/// `create_status` that has not been released yet.
pub(crate) unsafe fn status_to_result(status: *mut RonnStatus) -> Result<()> {
    if status.is_null() {
        return Ok(());
    }
    let status = Box::from_raw(status.cast::<HostStatus>());
    if status.code == RonnErrorCode::OK {
        return Ok(());
    }
    Err(CoreError::from_code(
        error_code_from_abi(status.code),
        status.message,
    ))
}

pub(crate) fn device_kind_to_abi(kind: HardwareDeviceKind) -> RonnHardwareDeviceType {
    match kind {
        HardwareDeviceKind::Cpu => RonnHardwareDeviceType::CPU,
        HardwareDeviceKind::Gpu => RonnHardwareDeviceType::GPU,
        HardwareDeviceKind::Npu => RonnHardwareDeviceType::NPU,
    }
}

pub(crate) fn device_handle(device: &HardwareDevice) -> *const RonnHardwareDevice {
    (device as *const HardwareDevice).cast()
}

pub(crate) fn key_value_pairs_handle(pairs: &KeyValuePairs) -> *const RonnKeyValuePairs {
    (pairs as *const KeyValuePairs).cast()
}

pub(crate) fn key_value_pairs_handle_mut(pairs: &mut KeyValuePairs) -> *mut RonnKeyValuePairs {
    (pairs as *mut KeyValuePairs).cast()
}

pub(crate) fn session_options_handle(options: &SessionOptions) -> *const RonnSessionOptions {
    (options as *const SessionOptions).cast()
}

pub(crate) fn logger_handle(logger: &SessionLogger) -> *const RonnLogger {
    (logger as *const SessionLogger).cast()
}

fn logging_level_from_abi(level: RonnLoggingLevel) -> LogLevel {
    match level {
        RonnLoggingLevel::VERBOSE => LogLevel::Trace,
        RonnLoggingLevel::INFO => LogLevel::Info,
        RonnLoggingLevel::WARNING => LogLevel::Warn,
        RonnLoggingLevel::ERROR | RonnLoggingLevel::FATAL => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

unsafe fn write_str_out(out: *mut RonnStr, value: &str) -> bool {
    if !out.is_null() {
        out.write(RonnStr::new(value));
    }
    true
}

unsafe extern "C" fn create_status(code: RonnErrorCode, message: RonnStr) -> *mut RonnStatus {
    let status = Box::new(HostStatus {
        code,
        message: message.to_string_lossy(),
    });
    Box::into_raw(status).cast()
}

unsafe extern "C" fn release_status(status: *mut RonnStatus) {
    if !status.is_null() {
        drop(Box::from_raw(status.cast::<HostStatus>()));
    }
}

unsafe extern "C" fn hardware_device_type(
    device: *const RonnHardwareDevice,
) -> RonnHardwareDeviceType {
    match device.cast::<HardwareDevice>().as_ref() {
        Some(device) => device_kind_to_abi(device.kind),
        None => RonnHardwareDeviceType::CPU,
    }
}

unsafe extern "C" fn hardware_device_vendor(device: *const RonnHardwareDevice) -> RonnStr {
    match device.cast::<HardwareDevice>().as_ref() {
        Some(device) => RonnStr::new(&device.vendor),
        None => RonnStr::empty(),
    }
}

unsafe extern "C" fn hardware_device_vendor_id(device: *const RonnHardwareDevice) -> u32 {
    device
        .cast::<HardwareDevice>()
        .as_ref()
        .map_or(0, |device| device.vendor_id)
}

unsafe extern "C" fn hardware_device_bus_id(device: *const RonnHardwareDevice) -> i32 {
    device
        .cast::<HardwareDevice>()
        .as_ref()
        .map_or(HardwareDevice::UNKNOWN_BUS_ID, |device| device.bus_id)
}

unsafe extern "C" fn hardware_device_property(
    device: *const RonnHardwareDevice,
    key: RonnStr,
    value: *mut RonnStr,
) -> bool {
    let (Some(device), Some(key)) = (device.cast::<HardwareDevice>().as_ref(), key.as_str()) else {
        return false;
    };
    match device.property(key) {
        Some(found) => write_str_out(value, found),
        None => false,
    }
}

unsafe extern "C" fn key_value_pairs_add(
    pairs: *mut RonnKeyValuePairs,
    key: RonnStr,
    value: RonnStr,
) {
    if let Some(pairs) = pairs.cast::<KeyValuePairs>().as_mut() {
        pairs.insert(key.to_string_lossy(), value.to_string_lossy());
    }
}

unsafe extern "C" fn key_value_pairs_get(
    pairs: *const RonnKeyValuePairs,
    key: RonnStr,
    value: *mut RonnStr,
) -> bool {
    let (Some(pairs), Some(key)) = (pairs.cast::<KeyValuePairs>().as_ref(), key.as_str()) else {
        return false;
    };
    match pairs.get(key) {
        Some(found) => write_str_out(value, found),
        None => false,
    }
}

unsafe extern "C" fn session_config_entry(
    options: *const RonnSessionOptions,
    key: RonnStr,
    value: *mut RonnStr,
) -> bool {
    let options = options.cast::<SessionOptions>().as_ref();
    let (Some(options), Some(key)) = (options, key.as_str()) else {
        return false;
    };
    match options.config_entry(key) {
        Some(found) => write_str_out(value, found),
        None => false,
    }
}

unsafe extern "C" fn log(logger: *const RonnLogger, level: RonnLoggingLevel, message: RonnStr) {
    if let Some(logger) = logger.cast::<SessionLogger>().as_ref() {
        logger.log(logging_level_from_abi(level), &message.to_string_lossy());
    }
}
