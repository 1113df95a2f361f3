//! Domain types shared across all crates

use serde::{Deserialize, Serialize};

/// Connection state reported by `adb devices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Device,
    Offline,
    Unauthorized,
    Recovery,
    Sideload,
    Bootloader,
    #[serde(untagged)]
    Other(String),
}

impl DeviceState {
    pub fn parse(s: &str) -> Self {
        match s {
            "device" => DeviceState::Device,
            "offline" => DeviceState::Offline,
            "unauthorized" => DeviceState::Unauthorized,
            "recovery" => DeviceState::Recovery,
            "sideload" => DeviceState::Sideload,
            "bootloader" => DeviceState::Bootloader,
            other => DeviceState::Other(other.to_string()),
        }
    }

    /// Whether shell commands can be issued against the device.
    pub fn is_online(&self) -> bool {
        matches!(self, DeviceState::Device)
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceState::Device => write!(f, "device"),
            DeviceState::Offline => write!(f, "offline"),
            DeviceState::Unauthorized => write!(f, "unauthorized"),
            DeviceState::Recovery => write!(f, "recovery"),
            DeviceState::Sideload => write!(f, "sideload"),
            DeviceState::Bootloader => write!(f, "bootloader"),
            DeviceState::Other(s) => write!(f, "{}", s),
        }
    }
}

/// A connected Android device.
///
/// This is a snapshot taken when the device was resolved. Device state can
/// change between invocations, so it is re-queried per session rather than
/// cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// adb serial (UDID), e.g. `emulator-5554` or `R58M123ABC`
    pub serial: String,

    pub state: DeviceState,

    /// `model:` attribute from `adb devices -l`, if reported
    #[serde(default)]
    pub model: Option<String>,

    /// CPU ABIs in device preference order. Empty until queried.
    #[serde(default)]
    pub abis: Vec<String>,
}

impl Device {
    pub fn new(serial: impl Into<String>, state: DeviceState) -> Self {
        Self {
            serial: serial.into(),
            state,
            model: None,
            abis: Vec::new(),
        }
    }

    pub fn is_emulator(&self) -> bool {
        self.serial.starts_with("emulator-")
    }

    /// Get a display string for the device
    pub fn display_name(&self) -> String {
        match &self.model {
            Some(model) => format!("{} ({})", model.replace('_', " "), self.serial),
            None => self.serial.clone(),
        }
    }
}

/// A debuggable process on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,

    /// Process name as reported by the process itself (usually the package).
    pub name: String,

    /// Packages sharing the process's sandbox uid, best guess first.
    /// `None` when package resolution was not requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packages: Option<Vec<String>>,
}

impl ProcessRecord {
    /// The most likely owning package, if packages were resolved.
    pub fn best_package(&self) -> Option<&str> {
        self.packages
            .as_ref()
            .and_then(|p| p.first())
            .map(String::as_str)
    }
}

/// Which debuggers a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugMode {
    #[default]
    Native,
    #[serde(alias = "java")]
    Managed,
    #[serde(alias = "auto")]
    Dual,
}

impl DebugMode {
    pub fn wants_native(&self) -> bool {
        matches!(self, DebugMode::Native | DebugMode::Dual)
    }

    pub fn wants_managed(&self) -> bool {
        matches!(self, DebugMode::Managed | DebugMode::Dual)
    }
}

impl std::fmt::Display for DebugMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DebugMode::Native => write!(f, "native"),
            DebugMode::Managed => write!(f, "managed"),
            DebugMode::Dual => write!(f, "dual"),
        }
    }
}

/// One half of a debug session tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebuggerKind {
    Native,
    Managed,
}

impl std::fmt::Display for DebuggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DebuggerKind::Native => write!(f, "native"),
            DebuggerKind::Managed => write!(f, "managed"),
        }
    }
}
