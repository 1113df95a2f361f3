//! Headless presentation - NDJSON events on stdout
//!
//! Every command reports through [`HeadlessEvent`]s, one JSON object per
//! line, so an IDE extension or a test script can drive `adbg` without
//! parsing human-oriented text.
//!
//! # Example Output
//!
//! ```json
//! {"event":"device_listed","serial":"emulator-5554","state":"device","model":"sdk_gphone64","timestamp":1704700001000}
//! {"event":"child_started","id":1,"config":{"type":"native","pid":4321,...},"timestamp":1704700002000}
//! {"event":"session_phase","name":"attach 4321","phase":"attached","timestamp":1704700002100}
//! ```

pub mod launcher;
pub mod prompt;
pub mod runner;

use std::io::{self, Write};
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::error;

use adbg_app::{ChildConfig, ChildSessionId, ProfilerEvent, SessionPhase};
use adbg_core::{Device, DeviceState, Error, ProcessRecord};

pub use launcher::HeadlessLauncher;
pub use prompt::StdinAbiPrompt;
pub use runner::run;

/// Events emitted on stdout
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HeadlessEvent {
    /// One line of `adbg devices`
    DeviceListed {
        serial: String,
        state: String,
        model: Option<String>,
        timestamp: i64,
    },

    /// One debuggable process
    ProcessListed {
        pid: u32,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        packages: Option<Vec<String>>,
        timestamp: i64,
    },

    /// Device ABIs and the best match against the supported list
    AbiResolved {
        serial: String,
        device_abis: Vec<String>,
        best: Option<String>,
        timestamp: i64,
    },

    /// Interactive ABI selection is waiting on stdin
    AbiChoice {
        choices: Vec<String>,
        last: Option<String>,
        timestamp: i64,
    },

    SessionPhase {
        name: String,
        phase: String,
        timestamp: i64,
    },

    /// A child debugger should be started with this configuration
    ChildStarted {
        id: ChildSessionId,
        config: ChildConfig,
        timestamp: i64,
    },

    ChildStopped { id: ChildSessionId, timestamp: i64 },

    /// Captured device log line
    Log { line: String, timestamp: i64 },

    ProfilerStarted { pid: u32, timestamp: i64 },

    ProfilerOutput {
        line: String,
        stderr: bool,
        timestamp: i64,
    },

    ProfilerTerminated { code: Option<i32>, timestamp: i64 },

    /// Converted profile ready to open
    ProfileReady { path: PathBuf, timestamp: i64 },

    Error {
        message: String,
        category: String,
        fatal: bool,
        timestamp: i64,
    },
}

impl HeadlessEvent {
    /// Emit this event to stdout as JSON
    pub fn emit(&self) {
        let mut stdout = io::stdout().lock();
        if let Err(e) = self.write_to(&mut stdout) {
            error!("Failed to write headless event to stdout: {}", e);
        }
    }

    /// Write this event as one NDJSON line and flush.
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let json = serde_json::to_string(self).map_err(io::Error::other)?;
        writeln!(out, "{}", json)?;
        out.flush()
    }

    /// Get current timestamp in milliseconds
    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    // ─────────────────────────────────────────────────────────
    // Convenience constructors
    // ─────────────────────────────────────────────────────────

    pub fn device_listed(device: &Device) -> Self {
        let state = match &device.state {
            DeviceState::Device => "device".to_string(),
            DeviceState::Offline => "offline".to_string(),
            DeviceState::Unauthorized => "unauthorized".to_string(),
            DeviceState::Recovery => "recovery".to_string(),
            DeviceState::Sideload => "sideload".to_string(),
            DeviceState::Bootloader => "bootloader".to_string(),
            DeviceState::Other(other) => other.clone(),
        };
        Self::DeviceListed {
            serial: device.serial.clone(),
            state,
            model: device.model.clone(),
            timestamp: Self::now(),
        }
    }

    pub fn process_listed(record: &ProcessRecord) -> Self {
        Self::ProcessListed {
            pid: record.pid,
            name: record.name.clone(),
            packages: record.packages.clone(),
            timestamp: Self::now(),
        }
    }

    pub fn abi_resolved(serial: &str, device_abis: Vec<String>, best: Option<String>) -> Self {
        Self::AbiResolved {
            serial: serial.to_string(),
            device_abis,
            best,
            timestamp: Self::now(),
        }
    }

    pub fn abi_choice(choices: &[String], last: Option<&str>) -> Self {
        Self::AbiChoice {
            choices: choices.to_vec(),
            last: last.map(str::to_string),
            timestamp: Self::now(),
        }
    }

    pub fn session_phase(name: &str, phase: SessionPhase) -> Self {
        Self::SessionPhase {
            name: name.to_string(),
            phase: phase.to_string(),
            timestamp: Self::now(),
        }
    }

    pub fn child_started(id: ChildSessionId, config: ChildConfig) -> Self {
        Self::ChildStarted {
            id,
            config,
            timestamp: Self::now(),
        }
    }

    pub fn child_stopped(id: ChildSessionId) -> Self {
        Self::ChildStopped {
            id,
            timestamp: Self::now(),
        }
    }

    pub fn log(line: String) -> Self {
        Self::Log {
            line,
            timestamp: Self::now(),
        }
    }

    pub fn profiler(event: ProfilerEvent) -> Self {
        let timestamp = Self::now();
        match event {
            ProfilerEvent::Started { pid } => Self::ProfilerStarted { pid, timestamp },
            ProfilerEvent::Output { line, stderr } => Self::ProfilerOutput {
                line,
                stderr,
                timestamp,
            },
            ProfilerEvent::Terminated { code } => Self::ProfilerTerminated { code, timestamp },
            ProfilerEvent::ReportReady { path } => Self::ProfileReady { path, timestamp },
        }
    }

    pub fn error(err: &Error) -> Self {
        Self::Error {
            message: err.to_string(),
            category: format!("{:?}", err.category()),
            fatal: err.is_fatal(),
            timestamp: Self::now(),
        }
    }
}

/// Where headless events go: stdout in the binary, a channel in tests.
#[derive(Debug, Clone, Default)]
pub enum EventSink {
    #[default]
    Stdout,
    Channel(mpsc::UnboundedSender<HeadlessEvent>),
}

impl EventSink {
    pub fn emit(&self, event: HeadlessEvent) {
        match self {
            EventSink::Stdout => event.emit(),
            EventSink::Channel(tx) => {
                let _ = tx.send(event);
            }
        }
    }
}
