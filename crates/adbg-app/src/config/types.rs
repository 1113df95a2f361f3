//! Configuration types for android-debug
//!
//! Defines:
//! - `Settings` - Project settings (`.android-debug/config.toml`)
//! - `DebugRequest` - A single attach or launch configuration
//! - `LaunchFile` - Named configurations (`.android-debug/launch.toml`)

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use adbg_core::prelude::*;
use adbg_core::DebugMode;
use adbg_daemon::abi::AbiRequest;
use adbg_daemon::launch::{extras_from_json, LaunchExtra};
use adbg_daemon::DiscoveryTiming;
use adbg_daemon::DEFAULT_SUPPORTED_ABIS;

/// Application settings (.android-debug/config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub paths: PathSettings,

    #[serde(default)]
    pub timing: TimingSettings,

    #[serde(default)]
    pub abi: AbiSettings,
}

/// Host tool locations. Unset entries fall back to the environment.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PathSettings {
    #[serde(default)]
    pub adb: Option<PathBuf>,

    #[serde(default)]
    pub sdk_root: Option<PathBuf>,

    #[serde(default)]
    pub ndk_root: Option<PathBuf>,

    /// Flat `<abi>/lldb-server` layout checked before the NDK
    #[serde(default)]
    pub lldb_server_root: Option<PathBuf>,
}

/// Delays and timeouts, all in milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingSettings {
    #[serde(default = "default_initial_wait_ms")]
    pub discovery_initial_wait_ms: u64,

    #[serde(default = "default_quiet_period_ms")]
    pub discovery_quiet_period_ms: u64,

    /// Delay between `am start` and process enumeration
    #[serde(default = "default_launch_settle_ms")]
    pub launch_settle_ms: u64,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,

    /// Upper bound on waiting for child debuggers to stop
    #[serde(default = "default_child_stop_timeout_ms")]
    pub child_stop_timeout_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            discovery_initial_wait_ms: default_initial_wait_ms(),
            discovery_quiet_period_ms: default_quiet_period_ms(),
            launch_settle_ms: default_launch_settle_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            reply_timeout_ms: default_reply_timeout_ms(),
            child_stop_timeout_ms: default_child_stop_timeout_ms(),
        }
    }
}

impl TimingSettings {
    pub fn discovery(&self) -> DiscoveryTiming {
        DiscoveryTiming {
            initial_wait: Duration::from_millis(self.discovery_initial_wait_ms),
            quiet_period: Duration::from_millis(self.discovery_quiet_period_ms),
        }
    }

    pub fn launch_settle(&self) -> Duration {
        Duration::from_millis(self.launch_settle_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn child_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.child_stop_timeout_ms)
    }
}

fn default_initial_wait_ms() -> u64 {
    3000
}

fn default_quiet_period_ms() -> u64 {
    200
}

fn default_launch_settle_ms() -> u64 {
    1000
}

fn default_handshake_timeout_ms() -> u64 {
    3000
}

fn default_reply_timeout_ms() -> u64 {
    10_000
}

fn default_child_stop_timeout_ms() -> u64 {
    5000
}

/// Project-wide ABI preferences.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AbiSettings {
    /// ABIs the app ships native code for
    #[serde(default = "default_supported_abis")]
    pub supported: Vec<String>,

    /// Device ABI -> toolchain identifier
    #[serde(default)]
    pub map: HashMap<String, String>,
}

impl Default for AbiSettings {
    fn default() -> Self {
        Self {
            supported: default_supported_abis(),
            map: HashMap::new(),
        }
    }
}

fn default_supported_abis() -> Vec<String> {
    DEFAULT_SUPPORTED_ABIS.iter().map(|s| s.to_string()).collect()
}

/// Whether a request attaches to a running process or launches the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    #[default]
    Attach,
    Launch,
}

/// A local directory mirrored onto the device before launch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SyncEntry {
    pub local: PathBuf,
    pub remote: String,
}

/// Native options consumed by the orchestrator and never passed on.
pub const ORCHESTRATOR_NATIVE_KEYS: &[&str] = &["abi", "abiSupported", "abiMap"];

/// A single debug configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct DebugRequest {
    /// Display name for this configuration
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub request: RequestType,

    /// native, managed (alias java) or dual (alias auto)
    #[serde(default)]
    pub mode: DebugMode,

    /// Device serial; first online device when unset
    #[serde(default)]
    pub serial: Option<String>,

    /// Attach target
    #[serde(default)]
    pub pid: Option<u32>,

    #[serde(default)]
    pub package: Option<String>,

    /// Launch activity; resolved from the package when unset
    #[serde(default)]
    pub activity: Option<String>,

    /// APK to install and read the package name from
    #[serde(default)]
    pub apk: Option<PathBuf>,

    #[serde(default)]
    pub install: bool,

    #[serde(default)]
    pub sync: Vec<SyncEntry>,

    /// Intent extras: strings, booleans or string arrays
    #[serde(default)]
    pub extras: Value,

    /// Directories the native debugger searches for symbols
    #[serde(default)]
    pub symbol_search_paths: Vec<PathBuf>,

    /// Native debugger options; `abi`, `abiSupported` and `abiMap` are
    /// read here and stripped before hand-off
    #[serde(default)]
    pub native: Map<String, Value>,

    /// Managed debugger options, passed through untouched
    #[serde(default)]
    pub managed: Map<String, Value>,

    /// Resume the VM over JDWP once the managed debugger is attached
    #[serde(default)]
    pub resume_after_attach: bool,

    #[serde(default)]
    pub capture_logs: bool,
}

impl DebugRequest {
    pub fn attach(pid: u32, mode: DebugMode) -> Self {
        Self {
            name: format!("attach {}", pid),
            request: RequestType::Attach,
            mode,
            pid: Some(pid),
            ..Default::default()
        }
    }

    pub fn launch(package: impl Into<String>, mode: DebugMode) -> Self {
        let package = package.into();
        Self {
            name: format!("launch {}", package),
            request: RequestType::Launch,
            mode,
            package: Some(package),
            ..Default::default()
        }
    }

    /// Check that the fields the request type needs are present.
    pub fn validate(&self) -> Result<()> {
        match self.request {
            RequestType::Attach if self.pid.is_none() => Err(Error::invalid_argument(
                "attach requires a process id",
            )),
            RequestType::Launch if self.package.is_none() && self.apk.is_none() => Err(
                Error::invalid_argument("launch requires a package name or an APK"),
            ),
            RequestType::Launch if self.install && self.apk.is_none() => Err(
                Error::invalid_argument("install requested without an APK"),
            ),
            _ => Ok(()),
        }
    }

    pub fn launch_extras(&self) -> Result<std::collections::BTreeMap<String, LaunchExtra>> {
        extras_from_json(&self.extras)
    }

    /// The ABI request from native options (`abi = "select"`, an explicit
    /// ABI, or automatic when absent).
    pub fn abi_request(&self) -> AbiRequest {
        AbiRequest::from_option(self.native.get("abi").and_then(Value::as_str))
    }

    /// Per-request supported ABI list, overriding the project setting.
    pub fn abi_supported(&self) -> Option<Vec<String>> {
        self.native
            .get("abiSupported")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
    }

    /// Per-request ABI remap table, merged over the project setting.
    pub fn abi_map(&self) -> HashMap<String, String> {
        self.native
            .get("abiMap")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Native options minus the orchestrator-internal keys.
    pub fn native_passthrough(&self) -> Map<String, Value> {
        self.native
            .iter()
            .filter(|(k, _)| !ORCHESTRATOR_NATIVE_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Launch configurations file (.android-debug/launch.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LaunchFile {
    #[serde(default)]
    pub configurations: Vec<DebugRequest>,
}

impl LaunchFile {
    pub fn find(&self, name: &str) -> Option<&DebugRequest> {
        self.configurations.iter().find(|c| c.name == name)
    }
}
