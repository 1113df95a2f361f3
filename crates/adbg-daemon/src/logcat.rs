//! Device log stream subscription

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use adbg_core::prelude::*;
use adbg_core::ProcessEvent;

use crate::adb::DeviceChannel;
use crate::process::ProcessStopper;

/// Arguments for `adb logcat`, optionally filtered to one process.
pub fn logcat_args(pid: Option<u32>) -> Vec<String> {
    let mut args = vec![
        "logcat".to_string(),
        "-v".to_string(),
        "threadtime,year".to_string(),
    ];
    if let Some(pid) = pid {
        args.push(format!("--pid={}", pid));
    }
    args
}

/// A running `logcat` whose stdout lines are forwarded to a channel.
///
/// The line channel closes once logcat exits or is stopped.
#[derive(Debug)]
pub struct LogcatSubscription {
    serial: String,
    pid: Option<u32>,
    stopper: ProcessStopper,
    forward_task: JoinHandle<Option<i32>>,
}

impl LogcatSubscription {
    pub fn start<C>(channel: &C, pid: Option<u32>, line_tx: mpsc::Sender<String>) -> Result<Self>
    where
        C: DeviceChannel + Sync,
    {
        let (event_tx, mut event_rx) = mpsc::channel(64);
        let process = channel.spawn(&logcat_args(pid), event_tx)?;
        let stopper = process.stopper();
        let serial = channel.serial().to_string();
        info!("Started logcat on {} (pid filter {:?})", serial, pid);

        let forward_task = tokio::spawn(async move {
            // Keep the process owned by the task so kill_on_drop only fires
            // once forwarding is over.
            let _process = process;
            while let Some(event) = event_rx.recv().await {
                match event {
                    ProcessEvent::Stdout(lines) => {
                        for line in lines {
                            if line_tx.send(line).await.is_err() {
                                debug!("logcat consumer dropped");
                                return None;
                            }
                        }
                    }
                    ProcessEvent::Stderr(lines) => {
                        for line in lines.iter().filter(|l| !l.trim().is_empty()) {
                            warn!("logcat err: {}", line);
                        }
                    }
                    ProcessEvent::Exited { code } => {
                        debug!("logcat exited with {:?}", code);
                        return code;
                    }
                }
            }
            None
        });

        Ok(Self {
            serial,
            pid,
            stopper,
            forward_task,
        })
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        !self.stopper.has_exited()
    }

    /// Stop logcat. Repeated calls are no-ops.
    pub fn stop(&self) {
        if self.stopper.stop() {
            debug!("Stopped logcat on {}", self.serial);
        }
    }

    /// Wait for the forwarding task to finish, returning logcat's exit code.
    pub async fn join(self) -> Option<i32> {
        self.forward_task.await.ok().flatten()
    }
}
