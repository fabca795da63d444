//! Session configuration.
//!
//! [`SessionOptions`] holds the typed session settings plus a free-form
//! [`ConfigOptions`] map. Execution providers read their own settings from that
//! map under the `ep.<provider name>.` prefix, and automatic provider selection
//! seeds provider defaults into it before creating any provider.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::logging::LogLevel;

/// Set to `"1"` to stop automatic selection from adding the built-in CPU
/// provider as a fallback.
pub const DISABLE_CPU_EP_FALLBACK: &str = "session.disable_cpu_ep_fallback";

/// Maximum length of a configuration key.
pub const MAX_CONFIG_KEY_LENGTH: usize = 1024;

/// Maximum length of a configuration value.
pub const MAX_CONFIG_VALUE_LENGTH: usize = 2048;

/// Prefix under which an execution provider's options live, e.g. `ep.CPU.`.
pub fn provider_option_prefix(ep_name: &str) -> String {
    format!("ep.{ep_name}.")
}

/// Full configuration key of an execution provider option, e.g. `ep.CPU.threads`.
pub fn provider_option_key(ep_name: &str, option: &str) -> String {
    format!("ep.{ep_name}.{option}")
}

/// Ordered string configuration map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigOptions {
    entries: BTreeMap<String, String>,
}

impl ConfigOptions {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an entry.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Whether an entry exists.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace an entry, returning the previous value.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Option<String>> {
        let key = key.into();
        let value = value.into();
        Self::validate(&key, &value)?;
        Ok(self.entries.insert(key, value))
    }

    /// Insert an entry only if the key is not present yet.
    ///
    /// Returns `true` if the entry was inserted.
    pub fn set_if_absent(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<bool> {
        let key = key.into();
        if self.entries.contains_key(&key) {
            return Ok(false);
        }
        let value = value.into();
        Self::validate(&key, &value)?;
        self.entries.insert(key, value);
        Ok(true)
    }

    /// Remove an entry, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    /// Entries whose key starts with `prefix`, with the prefix stripped.
    pub fn with_prefix(&self, prefix: &str) -> BTreeMap<String, String> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key[prefix.len()..].to_string(), value.clone()))
            .collect()
    }

    /// Iterate over all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn validate(key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(CoreError::invalid_argument("config key is empty"));
        }
        if key.len() > MAX_CONFIG_KEY_LENGTH {
            return Err(CoreError::invalid_argument(format!(
                "config key is longer than {MAX_CONFIG_KEY_LENGTH} bytes"
            )));
        }
        if value.len() > MAX_CONFIG_VALUE_LENGTH {
            return Err(CoreError::invalid_argument(format!(
                "config value for '{key}' is longer than {MAX_CONFIG_VALUE_LENGTH} bytes"
            )));
        }
        Ok(())
    }
}

/// Policy used by automatic execution provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DevicePolicy {
    /// NPU, then GPU, then third-party CPU providers, with the built-in CPU
    /// provider as the final fallback.
    PreferCpu,
    /// Prefer NPU providers.
    PreferNpu,
    /// Prefer GPU providers.
    PreferGpu,
    /// Maximize throughput.
    MaxPerformance,
    /// Maximize performance per watt.
    MaxEfficiency,
    /// Minimize overall power draw.
    MinOverallPower,
}

impl fmt::Display for DevicePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PreferCpu => "prefer_cpu",
            Self::PreferNpu => "prefer_npu",
            Self::PreferGpu => "prefer_gpu",
            Self::MaxPerformance => "max_performance",
            Self::MaxEfficiency => "max_efficiency",
            Self::MinOverallPower => "min_overall_power",
        };
        f.write_str(name)
    }
}

impl FromStr for DevicePolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "prefer_cpu" => Ok(Self::PreferCpu),
            "prefer_npu" => Ok(Self::PreferNpu),
            "prefer_gpu" => Ok(Self::PreferGpu),
            "max_performance" => Ok(Self::MaxPerformance),
            "max_efficiency" => Ok(Self::MaxEfficiency),
            "min_overall_power" => Ok(Self::MinOverallPower),
            other => Err(CoreError::invalid_argument(format!(
                "unknown device policy '{other}'"
            ))),
        }
    }
}

/// Configuration for an inference session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Identifier used in session log output.
    pub log_id: String,
    /// Minimum severity for the session logger.
    pub log_severity: LogLevel,
    /// Number of intra-op threads (None = provider default).
    pub thread_count: Option<usize>,
    /// Whether the CPU provider may use a memory arena.
    pub enable_cpu_mem_arena: bool,
    /// Policy for automatic execution provider selection.
    pub ep_selection_policy: Option<DevicePolicy>,
    /// Free-form configuration entries.
    pub config_options: ConfigOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            log_id: String::new(),
            log_severity: LogLevel::Warn,
            thread_count: None,
            enable_cpu_mem_arena: true,
            ep_selection_policy: None,
            config_options: ConfigOptions::new(),
        }
    }
}

impl SessionOptions {
    /// Create options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log id.
    pub fn with_log_id(mut self, log_id: impl Into<String>) -> Self {
        self.log_id = log_id.into();
        self
    }

    /// Set the session log severity.
    pub fn with_log_severity(mut self, level: LogLevel) -> Self {
        self.log_severity = level;
        self
    }

    /// Set the automatic selection policy.
    pub fn with_ep_selection_policy(mut self, policy: DevicePolicy) -> Self {
        self.ep_selection_policy = Some(policy);
        self
    }

    /// Add a configuration entry, replacing any existing value.
    pub fn add_config_entry(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        self.config_options.set(key, value).map(|_| ())
    }

    /// Get a configuration entry.
    pub fn config_entry(&self, key: &str) -> Option<&str> {
        self.config_options.get(key)
    }

    /// Options of one execution provider with the `ep.<name>.` prefix stripped.
    pub fn provider_options(&self, ep_name: &str) -> BTreeMap<String, String> {
        self.config_options
            .with_prefix(&provider_option_prefix(ep_name))
    }

    /// Whether the built-in CPU fallback was disabled.
    pub fn is_cpu_ep_fallback_disabled(&self) -> bool {
        self.config_entry(DISABLE_CPU_EP_FALLBACK) == Some("1")
    }

    /// Parse options from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize options to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| CoreError::fail(e.to_string()))
    }
}
