//! # adbg-daemon - Device and Toolchain Plumbing
//!
//! Everything that talks to an Android device or the host toolchain:
//! adb, streaming subprocesses, native debug server provisioning, process
//! discovery and the JDWP resume client.
//!
//! Depends on [`adbg_core`] for domain types and error handling.
//!
//! ## Public API
//!
//! ### Device Access
//! - [`Adb`] - Host adb handle, device listing
//! - [`DeviceChannel`] - Per-device command channel (shell, push, forward, spawn)
//! - [`StreamingProcess`] / [`ProcessStopper`] - Supervised long-running commands
//!
//! ### Debugging
//! - [`AbiResolutionContext`] / [`best_abi()`] - ABI selection
//! - [`lldb_server::start()`] / [`ServerRegistry`] - Native debug server lifecycle
//! - [`list_processes()`] - Debuggable process discovery
//! - [`JdwpClient`] - Handshake and VM resume
//!
//! ### Launching
//! - [`launch`] - `am start` command building and failure classification
//! - [`LogcatSubscription`] - Device log stream
//! - [`Toolchain`] - SDK / NDK lookup

pub mod abi;
pub mod adb;
pub mod discovery;
pub mod jdwp;
pub mod launch;
pub mod lldb_server;
pub mod logcat;
pub mod process;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod toolchain;

// Public API re-exports
pub use abi::{
    best_abi, device_abis, AbiMemory, AbiPrompt, AbiRequest, AbiResolutionContext,
    FirstChoicePrompt, DEFAULT_SUPPORTED_ABIS,
};
pub use adb::{Adb, AdbChannel, DeviceChannel, ShellOutput};
pub use discovery::{latest_for_package, list_processes, DiscoveryTiming};
pub use jdwp::{JdwpClient, JdwpState};
pub use launch::{classify_launch_error, LaunchExtra};
pub use lldb_server::{LldbServerHandle, ServerRegistry};
pub use logcat::LogcatSubscription;
pub use process::{ProcessStopper, StreamingProcess};
pub use toolchain::Toolchain;
