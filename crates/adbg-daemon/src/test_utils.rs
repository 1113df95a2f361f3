//! Test utilities for device plumbing
//!
//! [`FakeChannel`] is a scripted [`DeviceChannel`]: shell replies and
//! streaming processes are matched by substring, and every call is recorded
//! so tests can assert on the exact command sequence.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use adbg_core::prelude::*;
use adbg_core::ProcessEvent;

use crate::adb::{DeviceChannel, ShellOutput};
use crate::process::{ProcessStopper, ScriptStep, StreamingProcess};

/// First port handed out by [`FakeChannel::forward_jdwp`].
pub const FAKE_FIRST_PORT: u16 = 50_000;

#[derive(Debug, Clone)]
enum ShellReply {
    Ok(String),
    Fail(String),
}

#[derive(Default)]
struct FakeState {
    shell_rules: Vec<(String, ShellReply)>,
    spawn_rules: Vec<(String, Vec<ScriptStep>)>,
    props: HashMap<String, String>,
    calls: Vec<String>,
    spawned: Vec<(String, ProcessStopper)>,
    next_port: u16,
    fail_push: bool,
    fail_forward: bool,
    fail_remove_forward: bool,
    shell_delay: Duration,
}

/// Scripted device channel. Clones share state.
#[derive(Clone)]
pub struct FakeChannel {
    serial: String,
    state: Arc<Mutex<FakeState>>,
}

impl std::fmt::Debug for FakeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeChannel")
            .field("serial", &self.serial)
            .finish()
    }
}

impl FakeChannel {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            state: Arc::new(Mutex::new(FakeState {
                next_port: FAKE_FIRST_PORT,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Reply to shell commands containing `pattern` with `stdout`.
    pub fn on_shell(self, pattern: &str, stdout: &str) -> Self {
        self.lock()
            .shell_rules
            .push((pattern.to_string(), ShellReply::Ok(stdout.to_string())));
        self
    }

    /// Fail shell commands containing `pattern` with `stderr`.
    pub fn on_shell_fail(self, pattern: &str, stderr: &str) -> Self {
        self.lock()
            .shell_rules
            .push((pattern.to_string(), ShellReply::Fail(stderr.to_string())));
        self
    }

    /// Replay `script` for spawned commands whose joined args contain `pattern`.
    pub fn on_spawn(self, pattern: &str, script: Vec<ScriptStep>) -> Self {
        self.lock().spawn_rules.push((pattern.to_string(), script));
        self
    }

    pub fn with_prop(self, name: &str, value: &str) -> Self {
        self.lock()
            .props
            .insert(name.to_string(), value.to_string());
        self
    }

    /// Device ABI properties as a modern device reports them.
    pub fn with_abis(self, abis: &[&str]) -> Self {
        let primary = abis.first().copied().unwrap_or_default();
        self.with_prop("ro.product.cpu.abi", primary)
            .with_prop("ro.product.cpu.abilist", &abis.join(","))
    }

    /// Hand out `port` from the next `forward_jdwp`, e.g. a local listener.
    pub fn with_forward_port(self, port: u16) -> Self {
        self.lock().next_port = port;
        self
    }

    /// Delay every shell reply, so concurrent callers overlap.
    pub fn with_shell_delay(self, delay: Duration) -> Self {
        self.lock().shell_delay = delay;
        self
    }

    pub fn failing_push(self) -> Self {
        self.lock().fail_push = true;
        self
    }

    pub fn failing_forward(self) -> Self {
        self.lock().fail_forward = true;
        self
    }

    pub fn failing_remove_forward(self) -> Self {
        self.lock().fail_remove_forward = true;
        self
    }

    /// Every recorded call, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Recorded calls starting with `prefix`.
    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// Labels and stoppers of every spawned process.
    pub fn spawned(&self) -> Vec<(String, ProcessStopper)> {
        self.lock().spawned.clone()
    }

    fn record(&self, call: String) {
        self.lock().calls.push(call);
    }
}

impl DeviceChannel for FakeChannel {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn shell(&self, command: &str) -> Result<ShellOutput> {
        self.record(format!("shell {}", command));

        let delay = self.lock().shell_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let reply = self
            .lock()
            .shell_rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone());

        match reply {
            Some(ShellReply::Ok(stdout)) => Ok(ShellOutput {
                stdout,
                stderr: String::new(),
            }),
            Some(ShellReply::Fail(stderr)) => Err(Error::device_command(command, stderr)),
            None => Ok(ShellOutput::default()),
        }
    }

    async fn push(&self, local: &Path, remote: &str) -> Result<()> {
        self.record(format!("push {} {}", local.display(), remote));
        if self.lock().fail_push {
            return Err(Error::device_command("push", "remote write failed"));
        }
        Ok(())
    }

    async fn pull(&self, remote: &str, local: &Path) -> Result<()> {
        self.record(format!("pull {} {}", remote, local.display()));
        Ok(())
    }

    async fn install(&self, apk: &Path) -> Result<()> {
        self.record(format!("install {}", apk.display()));
        Ok(())
    }

    fn spawn(
        &self,
        args: &[String],
        event_tx: mpsc::Sender<ProcessEvent>,
    ) -> Result<StreamingProcess> {
        let label = args.join(" ");
        self.record(format!("spawn {}", label));

        let script = self
            .lock()
            .spawn_rules
            .iter()
            .find(|(pattern, _)| label.contains(pattern.as_str()))
            .map(|(_, script)| script.clone())
            .unwrap_or_default();

        let process = StreamingProcess::scripted(label.clone(), script, event_tx);
        self.lock().spawned.push((label, process.stopper()));
        Ok(process)
    }

    async fn forward_jdwp(&self, pid: u32) -> Result<u16> {
        let mut state = self.lock();
        if state.fail_forward {
            state.calls.push(format!("forward jdwp:{} failed", pid));
            return Err(Error::device_command("forward", "cannot bind"));
        }
        let port = state.next_port;
        state.next_port += 1;
        state.calls.push(format!("forward jdwp:{} tcp:{}", pid, port));
        Ok(port)
    }

    async fn remove_forward(&self, port: u16) -> Result<()> {
        self.record(format!("remove-forward tcp:{}", port));
        if self.lock().fail_remove_forward {
            return Err(Error::device_command("forward --remove", "listener not found"));
        }
        Ok(())
    }

    async fn getprop(&self, name: &str) -> Result<String> {
        Ok(self.lock().props.get(name).cloned().unwrap_or_default())
    }
}
