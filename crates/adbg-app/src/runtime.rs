//! Process-wide runtime context
//!
//! One constructed value holds everything that outlives a single debug
//! request: settings, the adb handle, the resolved toolchain, the
//! lldb-server socket registry and the last interactively picked ABI.
//! Sessions borrow it; nothing here is a global.

use std::path::{Path, PathBuf};

use adbg_core::prelude::*;
use adbg_daemon::{Adb, AbiMemory, ServerRegistry, Toolchain};

use crate::config::{load_settings, Settings};

#[derive(Debug)]
pub struct RuntimeContext {
    project_path: PathBuf,
    settings: Settings,
    adb: Adb,
    toolchain: Toolchain,
    servers: ServerRegistry,
    abi_memory: AbiMemory,
}

impl RuntimeContext {
    /// Load settings for `project_path` and locate the host tools.
    pub fn init(project_path: &Path) -> Result<Self> {
        let project_path = dunce::simplified(project_path).to_path_buf();
        let settings = load_settings(&project_path);

        let toolchain = Toolchain::resolve(
            settings.paths.sdk_root.as_deref(),
            settings.paths.ndk_root.as_deref(),
            settings.paths.lldb_server_root.as_deref(),
        );
        let adb = Adb::locate(settings.paths.adb.as_deref(), toolchain.sdk_root.as_deref())?;
        info!("Using adb at {}", adb.path().display());

        Ok(Self::new(project_path, settings, adb, toolchain))
    }

    pub fn new(project_path: PathBuf, settings: Settings, adb: Adb, toolchain: Toolchain) -> Self {
        Self {
            project_path,
            settings,
            adb,
            toolchain,
            servers: ServerRegistry::new(),
            abi_memory: AbiMemory::default(),
        }
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn adb(&self) -> &Adb {
        &self.adb
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    pub fn servers(&self) -> &ServerRegistry {
        &self.servers
    }

    pub fn abi_memory(&self) -> &AbiMemory {
        &self.abi_memory
    }

    /// Stop the lldb-server listening on `socket`, if it is still registered.
    pub fn cleanup_socket(&self, socket: &str) -> bool {
        let stopped = self.servers.cleanup(socket);
        if stopped {
            debug!("Released lldb-server socket {}", socket);
        }
        stopped
    }

    /// Stop every registered server and forget per-process state.
    pub fn shutdown(&self) -> usize {
        let stopped = self.servers.stop_all();
        self.abi_memory.clear();
        if stopped > 0 {
            info!("Stopped {} lldb-server instance(s) on shutdown", stopped);
        }
        stopped
    }
}
