//! Child debugger collaborator
//!
//! The orchestrator never runs a debugger itself. It builds a
//! [`ChildConfig`] per mode and hands it to a [`DebuggerLauncher`], which
//! starts the actual native (lldb) or managed (JDWP) debugger session and
//! returns an id for stopping it later.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::{Map, Value};

use adbg_core::prelude::*;
use adbg_core::DebuggerKind;

/// Identifier of a started child debugger session
pub type ChildSessionId = u64;

static CHILD_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique child session ID
pub fn next_child_id() -> ChildSessionId {
    CHILD_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Configuration for the native (lldb) child.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeChildConfig {
    pub pid: u32,
    pub serial: String,

    /// ABI after applying the remap table
    pub abi: String,

    /// Abstract socket lldb-server listens on
    pub socket: String,
    pub connect_url: String,
    pub init_commands: Vec<String>,

    /// User options, minus the orchestrator-internal ABI keys
    pub options: Map<String, Value>,
}

/// Configuration for the managed (JDWP) child.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedChildConfig {
    pub pid: u32,
    pub serial: String,
    pub host: String,

    /// Local port forwarded to `jdwp:<pid>`
    pub port: u16,
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChildConfig {
    Native(NativeChildConfig),
    Managed(ManagedChildConfig),
}

impl ChildConfig {
    pub fn kind(&self) -> DebuggerKind {
        match self {
            ChildConfig::Native(_) => DebuggerKind::Native,
            ChildConfig::Managed(_) => DebuggerKind::Managed,
        }
    }

    pub fn pid(&self) -> u32 {
        match self {
            ChildConfig::Native(c) => c.pid,
            ChildConfig::Managed(c) => c.pid,
        }
    }
}

/// Starts and stops child debugger sessions.
#[trait_variant::make(DebuggerLauncher: Send)]
pub trait LocalDebuggerLauncher {
    async fn start(&self, config: ChildConfig) -> Result<ChildSessionId>;

    async fn stop(&self, id: ChildSessionId) -> Result<()>;
}

/// lldb commands that connect to the on-device platform server.
pub fn lldb_init_commands(connect_url: &str, symbol_paths: &[PathBuf]) -> Vec<String> {
    let mut commands = vec![
        "platform select remote-android".to_string(),
        format!("platform connect {}", connect_url),
        "settings set plugin.jit-loader.gdb.enable off".to_string(),
    ];
    commands.extend(symbol_paths.iter().map(|p| {
        format!(
            "settings append target.exec-search-paths '{}'",
            dunce::simplified(p).display()
        )
    }));
    commands
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lldb_init_commands() {
        let commands = lldb_init_commands(
            "unix-abstract-connect://[emulator-5554]/com.app/platform-0011223344556677.sock",
            &[PathBuf::from("/src/obj/local/arm64-v8a")],
        );
        assert_eq!(
            commands,
            vec![
                "platform select remote-android",
                "platform connect unix-abstract-connect://[emulator-5554]/com.app/platform-0011223344556677.sock",
                "settings set plugin.jit-loader.gdb.enable off",
                "settings append target.exec-search-paths '/src/obj/local/arm64-v8a'",
            ]
        );
    }

    #[test]
    fn test_child_config_serializes_with_type_tag() {
        let config = ChildConfig::Managed(ManagedChildConfig {
            pid: 42,
            serial: "emu".into(),
            host: "localhost".into(),
            port: 50_000,
            options: Map::new(),
        });
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["type"], "managed");
        assert_eq!(json["port"], 50_000);
        assert_eq!(config.kind(), DebuggerKind::Managed);
        assert_eq!(config.pid(), 42);
    }

    #[test]
    fn test_child_ids_unique() {
        assert_ne!(next_child_id(), next_child_id());
    }
}
