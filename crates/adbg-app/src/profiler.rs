//! Profiling Session Controller
//!
//! Runs `simpleperf record` on the device as a streaming subprocess, stops it
//! on request, pulls the sample file and converts it on the host with
//! `simpleperf report-sample --protobuf`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use adbg_core::prelude::*;
use adbg_core::ProcessEvent;
use adbg_daemon::{DeviceChannel, StreamingProcess, Toolchain};

/// Where the device sampler binary is pushed.
pub const DEVICE_SIMPLEPERF: &str = "/data/local/tmp/simpleperf";

pub const DEFAULT_FREQUENCY: u32 = 4000;
pub const DEFAULT_EVENT: &str = "cpu-clock";

/// How long to wait for simpleperf to flush and exit after `kill`.
const STOP_WAIT: Duration = Duration::from_secs(30);

/// First stdout line of the wrapped command, announcing the device pid.
static PID_SENTINEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^PID:(\d+)$").expect("sentinel pattern is valid"));

/// Recording parameters.
#[derive(Debug, Clone, Default)]
pub struct ProfileOptions {
    /// Samples per second, default 4000
    pub frequency: Option<u32>,

    /// perf event, default `cpu-clock`
    pub event: Option<String>,
    pub package: Option<String>,
    pub pid: Option<u32>,

    /// Passed to the converter as `--symdir` when readable
    pub symbol_search_paths: Vec<PathBuf>,

    /// Host directory for pulled data and the converted trace; the system
    /// temp directory when unset
    pub output_dir: Option<PathBuf>,
}

/// Optional recording features the device's simpleperf supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerFeatures {
    pub dwarf_callgraph: bool,
    pub trace_offcpu: bool,
}

impl SamplerFeatures {
    /// Parse `simpleperf list --show-features` output.
    pub fn parse(output: &str) -> Self {
        let has = |name: &str| output.lines().any(|l| l.trim() == name);
        Self {
            dwarf_callgraph: has("dwarf") || has("dwarf-based-call-graph"),
            trace_offcpu: has("trace-offcpu"),
        }
    }
}

/// Events surfaced to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfilerEvent {
    /// simpleperf announced its device pid
    Started { pid: u32 },

    /// A line of simpleperf output
    Output { line: String, stderr: bool },

    /// The recording process is gone, whether stopped or on its own
    Terminated { code: Option<i32> },

    /// Converted trace is ready to view
    ReportReady { path: PathBuf },
}

/// Build the `simpleperf record` command line.
pub fn record_command(
    simpleperf: &str,
    output: &str,
    options: &ProfileOptions,
    features: SamplerFeatures,
) -> String {
    let mut command = vec![
        simpleperf.to_string(),
        "record".to_string(),
        "-o".to_string(),
        output.to_string(),
        "-f".to_string(),
        options.frequency.unwrap_or(DEFAULT_FREQUENCY).to_string(),
        "-e".to_string(),
        options
            .event
            .clone()
            .unwrap_or_else(|| DEFAULT_EVENT.to_string()),
        "--call-graph".to_string(),
        if features.dwarf_callgraph { "dwarf" } else { "fp" }.to_string(),
    ];

    if features.trace_offcpu {
        command.push("--trace-offcpu".to_string());
    }
    if let Some(package) = &options.package {
        command.push("--app".to_string());
        command.push(package.clone());
    }
    if let Some(pid) = options.pid {
        command.push("-p".to_string());
        command.push(pid.to_string());
    }

    command.join(" ")
}

/// Recognises the pid sentinel exactly once.
#[derive(Debug, Default)]
pub struct PidSentinel {
    pid: Option<u32>,
}

impl PidSentinel {
    /// Returns the pid if `line` is the first sentinel seen. Any later
    /// sentinel-looking line is ordinary output.
    pub fn observe(&mut self, line: &str) -> Option<u32> {
        if self.pid.is_some() {
            return None;
        }
        let pid = PID_SENTINEL
            .captures(line.trim())
            .and_then(|c| c[1].parse::<u32>().ok())?;
        self.pid = Some(pid);
        Some(pid)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Symbol directories that can actually be read. Others are skipped with a
/// warning.
pub fn readable_symbol_dirs(paths: &[PathBuf]) -> Vec<PathBuf> {
    paths
        .iter()
        .filter_map(|path| {
            let normalized = dunce::simplified(path).to_path_buf();
            let readable = if normalized.is_dir() {
                std::fs::read_dir(&normalized).map(|_| ())
            } else {
                std::fs::File::open(&normalized).map(|_| ())
            };
            match readable {
                Ok(()) => Some(normalized),
                Err(e) => {
                    warn!("Ignoring symbol search path {}: {}", normalized.display(), e);
                    None
                }
            }
        })
        .collect()
}

/// A running device profiler.
#[derive(Debug)]
pub struct ProfilingSession<C> {
    channel: C,
    options: ProfileOptions,
    base_name: String,
    device_output: String,
    process: StreamingProcess,
    pid: Arc<Mutex<Option<u32>>>,
    event_tx: mpsc::Sender<ProfilerEvent>,
    pump: JoinHandle<()>,
}

impl<C> ProfilingSession<C>
where
    C: DeviceChannel + Sync,
{
    /// Push simpleperf, probe its features and start recording.
    pub async fn start(
        channel: C,
        toolchain: &Toolchain,
        abi: &str,
        options: ProfileOptions,
        event_tx: mpsc::Sender<ProfilerEvent>,
    ) -> Result<Self> {
        let sampler = toolchain.device_simpleperf(abi)?;
        channel.push(&sampler, DEVICE_SIMPLEPERF).await?;
        channel
            .shell(&format!("chmod 755 {}", DEVICE_SIMPLEPERF))
            .await?;

        let probe = channel
            .shell(&format!("{} list --show-features", DEVICE_SIMPLEPERF))
            .await?;
        let features = SamplerFeatures::parse(&probe.stdout);
        debug!("simpleperf features: {:?}", features);

        let base_name = format!("simpleperf-{:08x}", rand::random::<u32>());
        let device_output = format!("/data/local/tmp/{}.data", base_name);
        let command = record_command(DEVICE_SIMPLEPERF, &device_output, &options, features);
        info!("Starting simpleperf: {}", command);

        let (tx, rx) = mpsc::channel::<ProcessEvent>(64);
        let process = channel.spawn(
            &["shell".to_string(), format!("echo PID:$$; exec {}", command)],
            tx,
        )?;

        let pid = Arc::new(Mutex::new(None));
        let pump = tokio::spawn(pump_output(rx, Arc::clone(&pid), event_tx.clone()));

        Ok(Self {
            channel,
            options,
            base_name,
            device_output,
            process,
            pid,
            event_tx,
            pump,
        })
    }

    /// Device pid of simpleperf, once announced and while it runs.
    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.process.is_running()
    }

    pub fn device_output(&self) -> &str {
        &self.device_output
    }

    /// Stop recording and produce the converted trace.
    ///
    /// Returns `None` if simpleperf never announced its pid (it failed to
    /// start or already exited), in which case there is nothing to pull.
    pub async fn stop(self, toolchain: &Toolchain) -> Result<Option<PathBuf>> {
        let Some(pid) = self.pid() else {
            info!("simpleperf is not running, nothing to collect");
            self.process.stop();
            return Ok(None);
        };

        // After an exit on its own the device may have reused the pid.
        if self.process.has_exited() {
            info!("simpleperf (pid {}) already exited, collecting its data", pid);
        } else {
            info!("Stopping simpleperf (pid {})", pid);
            if let Err(e) = self.channel.shell(&format!("kill {}", pid)).await {
                warn!("kill {} failed: {}", pid, e);
            }
        }

        if timeout(STOP_WAIT, self.process.wait()).await.is_err() {
            warn!("simpleperf did not exit within {:?}, closing the shell", STOP_WAIT);
            self.process.stop();
            self.process.wait().await;
        }
        let _ = self.pump.await;

        let dir = self
            .options
            .output_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let local_data = dir.join(format!("{}.data", self.base_name));
        self.channel.pull(&self.device_output, &local_data).await?;
        debug!("Pulled profile to {}", local_data.display());

        let trace = dir.join(format!("{}.trace", self.base_name));
        convert(toolchain, &local_data, &trace, &self.options.symbol_search_paths).await?;

        let _ = self
            .event_tx
            .send(ProfilerEvent::ReportReady {
                path: trace.clone(),
            })
            .await;
        Ok(Some(trace))
    }
}

/// Forward simpleperf output, extracting the pid sentinel.
async fn pump_output(
    mut rx: mpsc::Receiver<ProcessEvent>,
    pid: Arc<Mutex<Option<u32>>>,
    event_tx: mpsc::Sender<ProfilerEvent>,
) {
    let mut sentinel = PidSentinel::default();
    while let Some(event) = rx.recv().await {
        match event {
            ProcessEvent::Stdout(lines) => {
                for line in lines {
                    if let Some(announced) = sentinel.observe(&line) {
                        info!("simpleperf started with pid {}", announced);
                        *pid.lock().unwrap_or_else(|e| e.into_inner()) = Some(announced);
                        let _ = event_tx.send(ProfilerEvent::Started { pid: announced }).await;
                        continue;
                    }
                    debug!("simpleperf out {}", line);
                    let _ = event_tx
                        .send(ProfilerEvent::Output {
                            line,
                            stderr: false,
                        })
                        .await;
                }
            }
            ProcessEvent::Stderr(lines) => {
                for line in lines {
                    debug!("simpleperf err {}", line);
                    let _ = event_tx
                        .send(ProfilerEvent::Output { line, stderr: true })
                        .await;
                }
            }
            ProcessEvent::Exited { code } => {
                info!("simpleperf exited with {:?}", code);
                // Pid stays readable so a later stop still pulls the data
                // recorded before an unexpected exit. `stop` checks the
                // process state before signalling it.
                let _ = event_tx.send(ProfilerEvent::Terminated { code }).await;
                return;
            }
        }
    }
}

/// Run `simpleperf report-sample` on the host.
async fn convert(
    toolchain: &Toolchain,
    data: &Path,
    trace: &Path,
    symbol_paths: &[PathBuf],
) -> Result<()> {
    let simpleperf = toolchain.host_simpleperf()?;

    let mut command = Command::new(&simpleperf);
    command
        .args(["report-sample", "--protobuf", "--show-callchain", "-i"])
        .arg(data)
        .arg("-o")
        .arg(trace);
    for dir in readable_symbol_dirs(symbol_paths) {
        command.arg("--symdir").arg(dir);
    }

    debug!("Converting {} -> {}", data.display(), trace.display());
    let output = command.output().await?;
    if !output.status.success() {
        return Err(Error::device_command(
            "simpleperf report-sample",
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    info!("Profile converted to {}", trace.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use adbg_daemon::process::ScriptStep;
    use adbg_daemon::test_utils::FakeChannel;

    #[test]
    fn test_record_command() {
        let options = ProfileOptions {
            package: Some("com.app".into()),
            pid: Some(42),
            ..Default::default()
        };
        let features = SamplerFeatures {
            dwarf_callgraph: true,
            trace_offcpu: true,
        };
        assert_eq!(
            record_command("/data/local/tmp/simpleperf", "/data/local/tmp/out.data", &options, features),
            "/data/local/tmp/simpleperf record -o /data/local/tmp/out.data -f 4000 -e cpu-clock \
             --call-graph dwarf --trace-offcpu --app com.app -p 42"
        );

        let fp = record_command("sp", "o", &ProfileOptions::default(), SamplerFeatures::default());
        assert_eq!(fp, "sp record -o o -f 4000 -e cpu-clock --call-graph fp");
    }

    #[test]
    fn test_features_parse() {
        let features = SamplerFeatures::parse("dwarf-based-call-graph\ntrace-offcpu\nset-tracing-data\n");
        assert!(features.dwarf_callgraph);
        assert!(features.trace_offcpu);
        assert_eq!(SamplerFeatures::parse(""), SamplerFeatures::default());
    }

    #[test]
    fn test_sentinel_parsed_once() {
        let mut sentinel = PidSentinel::default();
        assert_eq!(sentinel.observe("simpleperf: starting"), None);
        assert_eq!(sentinel.observe("PID:1234"), Some(1234));
        assert_eq!(sentinel.observe("PID:5678"), None);
        assert_eq!(sentinel.pid(), Some(1234));
        assert_eq!(PidSentinel::default().observe("PID:12ab"), None);
    }

    #[test]
    fn test_unreadable_symbol_dirs_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let kept = readable_symbol_dirs(&[dir.path().to_path_buf(), missing]);
        assert_eq!(kept, vec![dunce::simplified(dir.path()).to_path_buf()]);
    }

    fn ndk_with_sampler() -> (tempfile::TempDir, Toolchain) {
        let ndk = tempfile::tempdir().unwrap();
        let sampler = ndk.path().join("simpleperf/bin/android/x86_64");
        std::fs::create_dir_all(&sampler).unwrap();
        std::fs::write(sampler.join("simpleperf"), b"ELF").unwrap();
        let toolchain = Toolchain {
            ndk_root: Some(ndk.path().to_path_buf()),
            ..Default::default()
        };
        (ndk, toolchain)
    }

    #[tokio::test]
    async fn test_start_announces_pid_and_forwards_output() {
        let (_ndk, toolchain) = ndk_with_sampler();
        let channel = FakeChannel::new("emu")
            .on_shell("list --show-features", "dwarf\n")
            .on_spawn(
                "echo PID:$$",
                vec![
                    ScriptStep::stdout(&["PID:777", "simpleperf I: recording"]),
                    ScriptStep::stderr(&["warning"]),
                    ScriptStep::Exit(Some(0)),
                ],
            );
        let (tx, mut rx) = mpsc::channel(16);
        let options = ProfileOptions {
            package: Some("com.app".into()),
            ..Default::default()
        };

        let session = ProfilingSession::start(channel.clone(), &toolchain, "x86_64", options, tx)
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(ProfilerEvent::Started { pid: 777 }));
        assert_eq!(
            rx.recv().await,
            Some(ProfilerEvent::Output {
                line: "simpleperf I: recording".into(),
                stderr: false
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(ProfilerEvent::Output {
                line: "warning".into(),
                stderr: true
            })
        );
        // Exit on its own is surfaced without a stop request.
        assert_eq!(
            rx.recv().await,
            Some(ProfilerEvent::Terminated { code: Some(0) })
        );
        assert_eq!(session.pid(), Some(777));

        let spawned = channel.calls_matching("spawn shell echo PID:$$; exec");
        assert_eq!(spawned.len(), 1);
        assert!(spawned[0].contains("--call-graph dwarf --app com.app"));
        assert_eq!(
            channel.calls_matching("push"),
            vec![format!(
                "push {} {}",
                toolchain
                    .ndk_root
                    .as_ref()
                    .unwrap()
                    .join("simpleperf/bin/android/x86_64/simpleperf")
                    .display(),
                DEVICE_SIMPLEPERF
            )]
        );
    }

    #[tokio::test]
    async fn test_stop_without_pid_collects_nothing() {
        let (_ndk, toolchain) = ndk_with_sampler();
        let channel = FakeChannel::new("emu");
        let (tx, _rx) = mpsc::channel(16);

        let session = ProfilingSession::start(
            channel.clone(),
            &toolchain,
            "x86_64",
            ProfileOptions::default(),
            tx,
        )
        .await
        .unwrap();

        assert_eq!(session.stop(&toolchain).await.unwrap(), None);
        assert!(channel.calls_matching("shell kill").is_empty());
        assert!(channel.calls_matching("pull").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_kills_pulls_and_needs_host_converter() {
        let (_ndk, toolchain) = ndk_with_sampler();
        let out = tempfile::tempdir().unwrap();
        let channel = FakeChannel::new("emu")
            .on_spawn("echo PID:$$", vec![ScriptStep::stdout(&["PID:31"])]);
        let (tx, mut rx) = mpsc::channel(16);
        let options = ProfileOptions {
            output_dir: Some(out.path().to_path_buf()),
            ..Default::default()
        };

        let session = ProfilingSession::start(channel.clone(), &toolchain, "x86_64", options, tx)
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(ProfilerEvent::Started { pid: 31 }));
        let device_output = session.device_output().to_string();

        // The fake shell ignores `kill`, so stop falls back to closing the
        // shell; conversion then fails because no host simpleperf exists.
        let err = session.stop(&toolchain).await.unwrap_err();
        assert!(matches!(err, Error::ToolNotFound { .. }));

        assert_eq!(channel.calls_matching("shell kill"), vec!["shell kill 31"]);
        let pulls = channel.calls_matching("pull");
        assert_eq!(pulls.len(), 1);
        assert!(pulls[0].starts_with(&format!("pull {}", device_output)));
        assert!(pulls[0].ends_with(".data"));
        assert_eq!(
            rx.recv().await,
            Some(ProfilerEvent::Terminated { code: None })
        );
    }

    #[tokio::test]
    async fn test_stop_after_exit_skips_kill_but_pulls() {
        let (_ndk, toolchain) = ndk_with_sampler();
        let out = tempfile::tempdir().unwrap();
        let channel = FakeChannel::new("emu").on_spawn(
            "echo PID:$$",
            vec![ScriptStep::stdout(&["PID:31"]), ScriptStep::Exit(Some(0))],
        );
        let (tx, mut rx) = mpsc::channel(16);
        let options = ProfileOptions {
            output_dir: Some(out.path().to_path_buf()),
            ..Default::default()
        };

        let session = ProfilingSession::start(channel.clone(), &toolchain, "x86_64", options, tx)
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(ProfilerEvent::Started { pid: 31 }));
        assert_eq!(
            rx.recv().await,
            Some(ProfilerEvent::Terminated { code: Some(0) })
        );
        assert!(!session.is_running());

        let err = session.stop(&toolchain).await.unwrap_err();
        assert!(matches!(err, Error::ToolNotFound { .. }));

        assert!(channel.calls_matching("shell kill").is_empty());
        assert_eq!(channel.calls_matching("pull").len(), 1);
    }
}
