//! # adbg-core - Core Domain Types
//!
//! Foundation crate for android-debug. Provides domain types, error handling,
//! subprocess event definitions and logging setup.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, thiserror, tokio, tracing).
//!
//! ## Public API
//!
//! ### Domain Types (`types`)
//! - [`Device`], [`DeviceState`] - A connected device snapshot
//! - [`ProcessRecord`] - A debuggable process and its owning packages
//! - [`DebugMode`], [`DebuggerKind`] - Which debuggers a request wants
//!
//! ### Events (`events`)
//! - [`ProcessEvent`] - Line batches and the terminal exit event of a subprocess
//!
//! ### Cancellation (`cancel`)
//! - [`CancelSignal`], [`CancelHandle`] - Abandon provisioning on request
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Error enum with a caller-facing [`ErrorCategory`]
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//!
//! ## Prelude
//!
//! ```rust
//! use adbg_core::prelude::*;
//! ```

pub mod cancel;
pub mod error;
pub mod events;
pub mod logging;
pub mod types;

/// Prelude for common imports used throughout all android-debug crates
pub mod prelude {
    pub use super::error::{Error, Result};
    pub use tracing::{debug, error, info, instrument, trace, warn};
}

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use error::{Error, ErrorCategory, LaunchFailure, Result};
pub use events::ProcessEvent;
pub use types::{DebugMode, DebuggerKind, Device, DeviceState, ProcessRecord};
