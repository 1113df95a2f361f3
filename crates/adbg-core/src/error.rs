//! Application error types with rich context

use std::path::PathBuf;
use thiserror::Error;

use crate::types::DebuggerKind;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classes surfaced to callers.
///
/// Every [`Error`] variant maps onto exactly one category via [`Error::category`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidArgument,
    NotFound,
    ProtocolError,
    DeviceCommandError,
    PartialStartupFailure,
    ResourceLeakRisk,
    Infrastructure,
}

/// Known `am start` failures, recognised from the shell's stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchFailure {
    /// The requested activity class does not exist in the package.
    ActivityClassMissing,
    /// No activity could be resolved for the launch intent.
    UnresolvableIntent,
    /// The activity manager refused the launch (not exported, permission denial).
    SecurityDenied,
}

impl std::fmt::Display for LaunchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchFailure::ActivityClassMissing => write!(
                f,
                "Activity class does not exist. Check the activity name and that the latest build is installed."
            ),
            LaunchFailure::UnresolvableIntent => write!(
                f,
                "Unable to resolve the launch intent. Is the package installed on the device?"
            ),
            LaunchFailure::SecurityDenied => write!(
                f,
                "Launch denied by the device. The activity must be exported or launchable."
            ),
        }
    }
}

/// Application error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Operation cancelled")]
    Cancelled,

    // ─────────────────────────────────────────────────────────────
    // Argument Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    // ─────────────────────────────────────────────────────────────
    // Lookup Errors
    // ─────────────────────────────────────────────────────────────
    #[error("No compatible ABI: device supports [{}], app supports [{}]", .device.join(", "), .app.join(", "))]
    NoCompatibleAbi { device: Vec<String>, app: Vec<String> },

    #[error("lldb-server not found for ABI {abi} (searched {} locations)", .searched.len())]
    ServerBinaryNotFound { abi: String, searched: Vec<PathBuf> },

    #[error("Launched process for {package} did not appear in the debuggable process list")]
    LaunchPidNotFound { package: String },

    #[error("No connected device with serial {serial}")]
    DeviceNotFound { serial: String },

    #[error("Required tool not found: {name}")]
    ToolNotFound { name: String },

    // ─────────────────────────────────────────────────────────────
    // Wire Protocol Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to connect to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("JDWP handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    #[error("Remote command failed with error code {code}")]
    RemoteCommand { code: u16 },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // ─────────────────────────────────────────────────────────────
    // Device Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Device command `{command}` failed: {message}")]
    DeviceCommand { command: String, message: String },

    #[error("{0}")]
    Launch(LaunchFailure),

    // ─────────────────────────────────────────────────────────────
    // Session Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Could not start {failed} debugger: {reason}")]
    PartialStartup { failed: DebuggerKind, reason: String },

    #[error("error starting: {cause}")]
    Startup { cause: Box<Error> },

    #[error("Cleanup step failed: {message}")]
    ResourceLeakRisk { message: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn handshake(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            reason: reason.into(),
        }
    }

    pub fn connection(address: impl Into<String>, reason: impl ToString) -> Self {
        Self::ConnectionFailed {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    pub fn device_command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DeviceCommand {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn tool_not_found(name: impl Into<String>) -> Self {
        Self::ToolNotFound { name: name.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn leak_risk(message: impl Into<String>) -> Self {
        Self::ResourceLeakRisk {
            message: message.into(),
        }
    }

    pub fn partial_startup(failed: DebuggerKind, reason: impl Into<String>) -> Self {
        Self::PartialStartup {
            failed,
            reason: reason.into(),
        }
    }

    /// Wrap an error raised after resources were acquired.
    pub fn startup(cause: Error) -> Self {
        match cause {
            // Already wrapped, or already names the failed half.
            Error::Startup { .. } | Error::PartialStartup { .. } => cause,
            other => Self::Startup {
                cause: Box::new(other),
            },
        }
    }

    /// Map this error onto the caller-facing taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidArgument { .. } => ErrorCategory::InvalidArgument,
            Error::NoCompatibleAbi { .. }
            | Error::ServerBinaryNotFound { .. }
            | Error::LaunchPidNotFound { .. }
            | Error::DeviceNotFound { .. }
            | Error::ToolNotFound { .. } => ErrorCategory::NotFound,
            Error::ConnectionFailed { .. }
            | Error::HandshakeFailed { .. }
            | Error::RemoteCommand { .. }
            | Error::Protocol { .. } => ErrorCategory::ProtocolError,
            Error::DeviceCommand { .. } | Error::Launch(_) => ErrorCategory::DeviceCommandError,
            Error::PartialStartup { .. } => ErrorCategory::PartialStartupFailure,
            Error::ResourceLeakRisk { .. } => ErrorCategory::ResourceLeakRisk,
            Error::Startup { cause } => cause.category(),
            Error::Io(_)
            | Error::Json(_)
            | Error::Cancelled
            | Error::Config { .. } => ErrorCategory::Infrastructure,
        }
    }

    /// Check if this error should abort the whole attach/launch request
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument { .. }
                | Error::ServerBinaryNotFound { .. }
                | Error::NoCompatibleAbi { .. }
                | Error::DeviceNotFound { .. }
                | Error::ToolNotFound { .. }
        )
    }

    /// True for a cancellation, including one surfaced while starting.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Startup { cause } => cause.is_cancelled(),
            _ => false,
        }
    }
}
