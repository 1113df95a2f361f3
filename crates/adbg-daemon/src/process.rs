//! Streaming subprocess supervision
//!
//! Every long-running device command (`adb shell ...`, `adb jdwp`, `adb logcat`)
//! runs as a [`StreamingProcess`]. Output is pushed to an mpsc channel as
//! [`ProcessEvent`] line batches and the process always ends with exactly one
//! [`ProcessEvent::Exited`].

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Notify};

use adbg_core::prelude::*;
use adbg_core::ProcessEvent;

/// Upper bound on lines coalesced into one event.
const MAX_BATCH_LINES: usize = 256;

/// Which pipe a reader task drains.
#[derive(Debug, Clone, Copy)]
enum Pipe {
    Stdout,
    Stderr,
}

/// One step of a [`StreamingProcess::scripted`] process.
#[cfg(any(test, feature = "test-helpers"))]
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Stdout(Vec<String>),
    Stderr(Vec<String>),
    Sleep(std::time::Duration),
    Exit(Option<i32>),
}

#[cfg(any(test, feature = "test-helpers"))]
impl ScriptStep {
    pub fn stdout(lines: &[&str]) -> Self {
        ScriptStep::Stdout(lines.iter().map(|l| l.to_string()).collect())
    }

    pub fn stderr(lines: &[&str]) -> Self {
        ScriptStep::Stderr(lines.iter().map(|l| l.to_string()).collect())
    }

    pub fn sleep_ms(ms: u64) -> Self {
        ScriptStep::Sleep(std::time::Duration::from_millis(ms))
    }
}

/// Clonable, idempotent kill switch for a [`StreamingProcess`].
///
/// All clones share one underlying kill channel, so the kill is delivered at
/// most once no matter how many holders call [`ProcessStopper::stop`].
#[derive(Clone)]
pub struct ProcessStopper {
    kill_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    exited: Arc<AtomicBool>,
}

impl std::fmt::Debug for ProcessStopper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessStopper")
            .field("exited", &self.has_exited())
            .finish()
    }
}

impl ProcessStopper {
    /// Request termination.
    ///
    /// Returns `true` only for the call that actually delivered the kill.
    /// Later calls, or calls after the process exited on its own, are no-ops.
    pub fn stop(&self) -> bool {
        if self.has_exited() {
            return false;
        }
        let tx = self
            .kill_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match tx {
            // Send fails only if the wait task already finished.
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

/// A supervised child process with push-based output.
///
/// The `Child` handle is moved into a dedicated wait task that captures the
/// real exit code. `StreamingProcess` keeps a [`ProcessStopper`] to request a
/// kill and a [`Notify`] so [`StreamingProcess::wait`] can await exit.
pub struct StreamingProcess {
    /// Human readable description for logging
    label: String,
    pid: Option<u32>,
    stopper: ProcessStopper,
    exit_notify: Arc<Notify>,
}

impl std::fmt::Debug for StreamingProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingProcess")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish()
    }
}

impl StreamingProcess {
    /// Spawn `program args...` and stream its output into `event_tx`.
    pub fn spawn(
        program: &str,
        args: &[String],
        event_tx: mpsc::Sender<ProcessEvent>,
    ) -> Result<Self> {
        let label = format!("{} {}", program, args.join(" "));
        debug!("Spawning: {}", label);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::tool_not_found(program)
                } else {
                    Error::device_command(&label, e.to_string())
                }
            })?;

        let pid = child.id();
        debug!("Started {:?} with PID {:?}", label, pid);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(Self::line_reader(stdout, Pipe::Stdout, event_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(Self::line_reader(stderr, Pipe::Stderr, event_tx.clone()));
        }

        Ok(Self::supervise(child, label, event_tx))
    }

    /// Hand `child` to a wait task and build the supervising handle.
    fn supervise(child: Child, label: String, event_tx: mpsc::Sender<ProcessEvent>) -> Self {
        let pid = child.id();
        let exited = Arc::new(AtomicBool::new(false));
        let exit_notify = Arc::new(Notify::new());
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(Self::wait_for_exit(
            child,
            label.clone(),
            kill_rx,
            event_tx,
            Arc::clone(&exited),
            Arc::clone(&exit_notify),
        ));

        Self {
            label,
            pid,
            stopper: ProcessStopper {
                kill_tx: Arc::new(Mutex::new(Some(kill_tx))),
                exited,
            },
            exit_notify,
        }
    }

    /// Background task: owns `child`, waits for it to exit, emits `Exited`.
    async fn wait_for_exit(
        mut child: Child,
        label: String,
        kill_rx: oneshot::Receiver<()>,
        event_tx: mpsc::Sender<ProcessEvent>,
        exited: Arc<AtomicBool>,
        exit_notify: Arc<Notify>,
    ) {
        let code: Option<i32> = tokio::select! {
            result = child.wait() => {
                match result {
                    Ok(status) => {
                        debug!("{} exited with status: {:?}", label, status);
                        status.code()
                    }
                    Err(e) => {
                        error!("Error waiting for {}: {}", label, e);
                        None
                    }
                }
            }
            Ok(()) = kill_rx => {
                debug!("Kill requested for {}", label);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {}: {}", label, e);
                }
                match child.wait().await {
                    Ok(status) => status.code(),
                    Err(e) => {
                        error!("Error waiting after kill of {}: {}", label, e);
                        None
                    }
                }
            }
        };

        Self::finish(code, &event_tx, &exited, &exit_notify).await;
    }

    async fn finish(
        code: Option<i32>,
        event_tx: &mpsc::Sender<ProcessEvent>,
        exited: &AtomicBool,
        exit_notify: &Notify,
    ) {
        // Flag first so `has_exited()` is true before anyone observes the event.
        exited.store(true, Ordering::Release);
        exit_notify.notify_waiters();

        let _ = event_tx.send(ProcessEvent::Exited { code }).await;
    }

    /// A process that replays `script` instead of running a program.
    ///
    /// A script without [`ScriptStep::Exit`] keeps running until stopped,
    /// which then reports `Exited { code: None }` like a killed process.
    #[cfg(any(test, feature = "test-helpers"))]
    pub fn scripted(
        label: impl Into<String>,
        script: Vec<ScriptStep>,
        event_tx: mpsc::Sender<ProcessEvent>,
    ) -> Self {
        let label = label.into();
        let exited = Arc::new(AtomicBool::new(false));
        let exit_notify = Arc::new(Notify::new());
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        {
            let exited = Arc::clone(&exited);
            let exit_notify = Arc::clone(&exit_notify);
            let tx = event_tx.clone();
            tokio::spawn(async move {
                let code = tokio::select! {
                    code = Self::replay(script, &tx) => code,
                    _ = kill_rx => None,
                };
                Self::finish(code, &tx, &exited, &exit_notify).await;
            });
        }

        Self {
            label,
            pid: None,
            stopper: ProcessStopper {
                kill_tx: Arc::new(Mutex::new(Some(kill_tx))),
                exited,
            },
            exit_notify,
        }
    }

    #[cfg(any(test, feature = "test-helpers"))]
    async fn replay(script: Vec<ScriptStep>, tx: &mpsc::Sender<ProcessEvent>) -> Option<i32> {
        for step in script {
            match step {
                ScriptStep::Stdout(lines) => {
                    let _ = tx.send(ProcessEvent::Stdout(lines)).await;
                }
                ScriptStep::Stderr(lines) => {
                    let _ = tx.send(ProcessEvent::Stderr(lines)).await;
                }
                ScriptStep::Sleep(duration) => tokio::time::sleep(duration).await,
                ScriptStep::Exit(code) => return code,
            }
        }
        std::future::pending().await
    }

    /// Read lines and push them in batches of whatever is immediately available.
    async fn line_reader<R>(pipe: R, which: Pipe, tx: mpsc::Sender<ProcessEvent>)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(pipe).lines();

        while let Ok(Some(line)) = reader.next_line().await {
            let mut batch = vec![line];
            while batch.len() < MAX_BATCH_LINES {
                // `next_line` is cancel safe, so dropping a pending poll loses nothing.
                match reader.next_line().now_or_never() {
                    Some(Ok(Some(line))) => batch.push(line),
                    _ => break,
                }
            }

            trace!("{:?}: {} line(s)", which, batch.len());
            let event = match which {
                Pipe::Stdout => ProcessEvent::Stdout(batch),
                Pipe::Stderr => ProcessEvent::Stderr(batch),
            };
            if tx.send(event).await.is_err() {
                debug!("{:?} channel closed", which);
                break;
            }
        }
    }

    /// Request termination. Safe to call any number of times.
    pub fn stop(&self) -> bool {
        self.stopper.stop()
    }

    /// A clonable kill handle that outlives borrowing this process.
    pub fn stopper(&self) -> ProcessStopper {
        self.stopper.clone()
    }

    /// Wait until the process has exited.
    pub async fn wait(&self) {
        // Create the future before checking the flag so a notification
        // between the check and the await is not lost.
        let notified = self.exit_notify.notified();
        if self.has_exited() {
            return;
        }
        notified.await;
    }

    pub fn has_exited(&self) -> bool {
        self.stopper.has_exited()
    }

    pub fn is_running(&self) -> bool {
        !self.has_exited()
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for StreamingProcess {
    fn drop(&mut self) {
        if self.is_running() {
            trace!("Handle for {:?} dropped while running", self.label);
        }
        // No kill here: stoppers handed out via `stopper()` own the lifetime.
        // `kill_on_drop(true)` covers the wait task being torn down with the runtime.
    }
}
