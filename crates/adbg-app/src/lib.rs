//! adbg-app - Session orchestration for android-debug
//!
//! Turns one attach or launch request into running child debuggers:
//! resolves the target process and ABI, provisions the on-device debug
//! server and JDWP forward, hands child configurations to a
//! [`DebuggerLauncher`] and tears everything down in order. Also hosts
//! configuration loading, the process-wide [`RuntimeContext`] and the
//! simpleperf [`profiler`].

pub mod config;
pub mod launcher;
pub mod profiler;
pub mod runtime;
pub mod session;

// Re-export primary types
pub use config::{DebugRequest, LaunchFile, RequestType, Settings};
pub use launcher::{
    ChildConfig, ChildSessionId, DebuggerLauncher, LocalDebuggerLauncher, ManagedChildConfig,
    NativeChildConfig,
};
pub use profiler::{ProfileOptions, ProfilerEvent, ProfilingSession};
pub use runtime::RuntimeContext;
pub use session::{DebugSession, DebugSessionTree, SessionPhase};
