//! Native Debug Server Launcher
//!
//! Deploys `lldb-server` into an app's sandbox and runs it in platform mode on
//! a fresh abstract socket. Running servers are tracked in a
//! [`ServerRegistry`] keyed by socket so they can be stopped out of band.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use adbg_core::prelude::*;
use adbg_core::{CancelSignal, ProcessEvent};

use crate::adb::DeviceChannel;
use crate::process::ProcessStopper;
use crate::toolchain::Toolchain;

/// Shared staging location every package copies from.
pub const STAGING_PATH: &str = "/data/local/tmp/android-debug/lldb-server";

/// Copy failures meaning the binary is already in place.
const ALREADY_PRESENT: &[&str] = &["File exists", "Text file busy"];

/// Directory inside the app sandbox holding the server binary.
pub fn sandbox_dir(package: &str) -> String {
    format!("/data/data/{}/android-debug/lldb/bin", package)
}

pub fn sandbox_path(package: &str) -> String {
    format!("{}/lldb-server", sandbox_dir(package))
}

/// `/<package>/platform-<16 hex>.sock`
pub fn socket_name(package: &str) -> String {
    format!("/{}/platform-{:016x}.sock", package, rand::random::<u64>())
}

/// Connection string for a server socket on a given device.
pub fn connect_url(serial: &str, socket: &str) -> String {
    format!("unix-abstract-connect://[{}]{}", serial, socket)
}

/// Running servers keyed by socket.
///
/// Clones share the same map. Entries are added when a server starts and
/// removed by whoever stops it first.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: Arc<Mutex<HashMap<String, ProcessStopper>>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProcessStopper>> {
        self.servers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, socket: &str, stopper: ProcessStopper) {
        self.lock().insert(socket.to_string(), stopper);
    }

    /// Stop and forget the server on `socket`.
    ///
    /// Returns `false` if nothing was registered under that socket.
    pub fn cleanup(&self, socket: &str) -> bool {
        let stopper = self.lock().remove(socket);
        match stopper {
            Some(stopper) => {
                debug!("Stopping lldb-server on {}", socket);
                stopper.stop();
                true
            }
            None => false,
        }
    }

    /// Stop every registered server. Returns how many were registered.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<(String, ProcessStopper)> = self.lock().drain().collect();
        for (socket, stopper) in &drained {
            debug!("Stopping lldb-server on {}", socket);
            stopper.stop();
        }
        drained.len()
    }

    pub fn contains(&self, socket: &str) -> bool {
        self.lock().contains_key(socket)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// A running `lldb-server` platform instance.
///
/// [`LldbServerHandle::stop`] is the release operation. It may be called any
/// number of times; only the first call reaches the process.
#[derive(Debug, Clone)]
pub struct LldbServerHandle {
    socket: String,
    stopper: ProcessStopper,
    registry: ServerRegistry,
}

impl LldbServerHandle {
    pub fn socket(&self) -> &str {
        &self.socket
    }

    pub fn is_running(&self) -> bool {
        !self.stopper.has_exited()
    }

    /// Terminate the server and release its socket.
    pub fn stop(&self) {
        if !self.registry.cleanup(&self.socket) {
            // Already removed from the registry; stopping again is a no-op
            // if someone else got there first.
            self.stopper.stop();
        }
    }
}

/// Provision and start `lldb-server` for `package`.
///
/// Resolution failures (`ServerBinaryNotFound`, `InvalidArgument`) are fatal.
/// The returned socket is usable immediately: the debugger connecting to it
/// retries on its own, so server readiness is not awaited.
pub async fn start<C>(
    channel: &C,
    toolchain: &Toolchain,
    registry: &ServerRegistry,
    package: &str,
    abi: &str,
    cancel: &CancelSignal,
) -> Result<LldbServerHandle>
where
    C: DeviceChannel + Sync,
{
    let binary = toolchain.find_lldb_server(abi)?;

    if package.trim().is_empty() {
        return Err(Error::invalid_argument(
            "package name is required to start lldb-server",
        ));
    }

    cancel
        .guard(provision(channel, &binary, package))
        .await?;

    let socket = loop {
        let candidate = socket_name(package);
        if !registry.contains(&candidate) {
            break candidate;
        }
    };

    let command = format!(
        "run-as {} {} platform --listen unix-abstract://{}",
        package,
        sandbox_path(package),
        socket
    );
    info!("Starting lldb-server: {}", command);

    let (tx, rx) = mpsc::channel::<ProcessEvent>(64);
    let process = channel.spawn(&["shell".to_string(), command], tx)?;
    tokio::spawn(forward_output(socket.clone(), rx));

    let handle = LldbServerHandle {
        socket: socket.clone(),
        stopper: process.stopper(),
        registry: registry.clone(),
    };
    registry.insert(&socket, process.stopper());

    if cancel.is_cancelled() {
        warn!("Cancelled after lldb-server started, stopping it");
        handle.stop();
        return Err(Error::Cancelled);
    }

    Ok(handle)
}

/// Push the binary to staging and copy it into the app sandbox.
async fn provision<C>(channel: &C, binary: &std::path::Path, package: &str) -> Result<()>
where
    C: DeviceChannel + Sync,
{
    debug!("Pushing {} to {}", binary.display(), STAGING_PATH);
    channel.push(binary, STAGING_PATH).await?;

    channel
        .shell(&format!("run-as {} mkdir -p {}", package, sandbox_dir(package)))
        .await?;

    let target = sandbox_path(package);
    let copy = format!(
        "cat {} | run-as {} sh -c 'cat > {} && chmod 700 {}'",
        STAGING_PATH, package, target, target
    );
    match channel.shell(&copy).await {
        Ok(_) => Ok(()),
        Err(Error::DeviceCommand { message, .. })
            if ALREADY_PRESENT.iter().any(|p| message.contains(p)) =>
        {
            debug!("lldb-server already present in sandbox: {}", message);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Log server output line by line until it exits. Nothing is buffered.
async fn forward_output(socket: String, mut rx: mpsc::Receiver<ProcessEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ProcessEvent::Stdout(lines) => {
                for line in lines.iter().map(|l| l.trim()).filter(|l| !l.is_empty()) {
                    info!("lldb-server out {}", line);
                }
            }
            ProcessEvent::Stderr(lines) => {
                for line in lines.iter().map(|l| l.trim()).filter(|l| !l.is_empty()) {
                    info!("lldb-server err {}", line);
                }
            }
            ProcessEvent::Exited { code } => {
                info!("lldb-server on {} exited with code {:?}", socket, code);
                break;
            }
        }
    }
}
