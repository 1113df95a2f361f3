//! Command line interface

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};

use adbg_app::config::find_configuration;
use adbg_app::{DebugRequest, RequestType};
use adbg_core::prelude::*;
use adbg_core::DebugMode;

/// android-debug - native and managed remote debugging for Android processes
#[derive(Parser, Debug)]
#[command(name = "adbg", version)]
#[command(about = "Native and managed remote debugging for Android processes", long_about = None)]
pub struct Args {
    /// Project directory holding `.android-debug/` (defaults to the current directory)
    #[arg(long, global = true, value_name = "PATH")]
    pub project: Option<PathBuf>,

    /// Device serial (defaults to the first online device)
    #[arg(long, short, global = true)]
    pub serial: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List attached devices
    Devices,

    /// List debuggable processes
    Processes {
        /// Resolve the packages owning each process
        #[arg(long)]
        packages: bool,

        /// Rank this package first when resolving packages
        #[arg(long, requires = "packages")]
        package: Option<String>,
    },

    /// Show the device ABIs and the best supported match
    Abi,

    /// Attach debuggers to a running process
    Attach(AttachArgs),

    /// Launch an app suspended and attach debuggers to it
    Launch(LaunchArgs),

    /// Record a CPU profile with simpleperf
    Profile(ProfileArgs),

    /// Stream the device log
    Logcat {
        /// Only lines from this process
        #[arg(long)]
        pid: Option<u32>,
    },

    /// Write a default `.android-debug/config.toml`
    Init,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Native,
    #[value(alias = "java")]
    Managed,
    #[value(alias = "auto")]
    Dual,
}

impl From<ModeArg> for DebugMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Native => DebugMode::Native,
            ModeArg::Managed => DebugMode::Managed,
            ModeArg::Dual => DebugMode::Dual,
        }
    }
}

/// Options shared by attach and launch.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct SessionArgs {
    /// Named configuration from `.android-debug/launch.toml`
    #[arg(long, short)]
    pub config: Option<String>,

    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,

    /// ABI to debug with, or `select` to choose interactively
    #[arg(long)]
    pub abi: Option<String>,

    /// Directory searched for native symbols (repeatable)
    #[arg(long = "symbols", value_name = "DIR")]
    pub symbol_search_paths: Vec<PathBuf>,

    /// Stream the target's log lines as events
    #[arg(long)]
    pub logs: bool,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct AttachArgs {
    #[arg(long)]
    pub pid: Option<u32>,

    #[arg(long)]
    pub package: Option<String>,

    /// Resume the VM once the managed debugger is attached
    #[arg(long)]
    pub resume: bool,

    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct LaunchArgs {
    #[arg(long)]
    pub package: Option<String>,

    #[arg(long)]
    pub activity: Option<String>,

    /// APK to read the package name from (and install with --install)
    #[arg(long)]
    pub apk: Option<PathBuf>,

    #[arg(long, requires = "apk")]
    pub install: bool,

    /// Intent extras as a JSON object of strings, booleans or string arrays
    #[arg(long, value_name = "JSON")]
    pub extras: Option<String>,

    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ProfileArgs {
    #[arg(long)]
    pub package: Option<String>,

    #[arg(long)]
    pub pid: Option<u32>,

    /// Samples per second
    #[arg(long)]
    pub frequency: Option<u32>,

    /// perf event to sample
    #[arg(long)]
    pub event: Option<String>,

    /// Device ABI of the sampler (defaults to the best supported device ABI)
    #[arg(long)]
    pub abi: Option<String>,

    #[arg(long = "symbols", value_name = "DIR")]
    pub symbol_search_paths: Vec<PathBuf>,

    /// Where to write the pulled data and the converted trace
    #[arg(long, value_name = "DIR")]
    pub output: Option<PathBuf>,
}

impl AttachArgs {
    /// Build the request from a named configuration or the flags.
    pub fn to_request(&self, project: &std::path::Path) -> Result<DebugRequest> {
        let mut request = match &self.session.config {
            Some(name) => {
                let request = find_configuration(project, name)?;
                if request.request != RequestType::Attach {
                    return Err(Error::config(format!(
                        "Configuration `{}` is not an attach configuration",
                        name
                    )));
                }
                request
            }
            None => {
                let pid = self
                    .pid
                    .ok_or_else(|| Error::invalid_argument("attach requires --pid or --config"))?;
                DebugRequest::attach(pid, DebugMode::default())
            }
        };

        if let Some(pid) = self.pid {
            request.pid = Some(pid);
        }
        if self.package.is_some() {
            request.package = self.package.clone();
        }
        request.resume_after_attach |= self.resume;
        self.session.apply(&mut request);
        Ok(request)
    }
}

impl LaunchArgs {
    /// Build the request from a named configuration or the flags.
    pub fn to_request(&self, project: &std::path::Path) -> Result<DebugRequest> {
        let mut request = match &self.session.config {
            Some(name) => {
                let request = find_configuration(project, name)?;
                if request.request != RequestType::Launch {
                    return Err(Error::config(format!(
                        "Configuration `{}` is not a launch configuration",
                        name
                    )));
                }
                request
            }
            None => {
                let name = self
                    .package
                    .clone()
                    .or_else(|| self.apk.as_ref().map(|p| p.display().to_string()))
                    .ok_or_else(|| {
                        Error::invalid_argument("launch requires --package, --apk or --config")
                    })?;
                let mut request = DebugRequest::launch(name, DebugMode::default());
                request.package = self.package.clone();
                request
            }
        };

        if self.package.is_some() {
            request.package = self.package.clone();
        }
        if self.activity.is_some() {
            request.activity = self.activity.clone();
        }
        if self.apk.is_some() {
            request.apk = self.apk.clone();
        }
        request.install |= self.install;
        if let Some(extras) = &self.extras {
            request.extras = serde_json::from_str(extras)
                .map_err(|e| Error::invalid_argument(format!("--extras is not JSON: {}", e)))?;
        }
        self.session.apply(&mut request);
        Ok(request)
    }
}

impl SessionArgs {
    fn apply(&self, request: &mut DebugRequest) {
        if let Some(mode) = self.mode {
            request.mode = mode.into();
        }
        if let Some(abi) = &self.abi {
            request
                .native
                .insert("abi".to_string(), serde_json::Value::String(abi.clone()));
        }
        request
            .symbol_search_paths
            .extend(self.symbol_search_paths.iter().cloned());
        request.capture_logs |= self.logs;
    }
}
