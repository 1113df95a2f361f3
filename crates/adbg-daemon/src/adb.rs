//! Device Command Channel backed by the `adb` host binary
//!
//! [`Adb`] is the host-wide handle (which `adb` to run). It lists devices and
//! hands out per-device [`AdbChannel`]s. Every channel call spawns its own
//! `adb -s <serial> ...` subprocess, so a channel can be cloned freely and used
//! by concurrent operations without cross-talk.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;

use adbg_core::prelude::*;
use adbg_core::{Device, DeviceState, ProcessEvent};

use crate::process::StreamingProcess;

/// Upper bound for `adb devices -l`
const DEVICES_TIMEOUT: Duration = Duration::from_secs(10);

/// Captured output of a one-shot shell command that exited with status 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    /// Non-empty, trimmed stdout lines.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|l| !l.is_empty())
    }
}

/// Operations against one selected device.
///
/// Implemented by [`AdbChannel`] for real devices and by a scripted fake in
/// `test_utils` for tests.
#[trait_variant::make(DeviceChannel: Send)]
pub trait LocalDeviceChannel {
    /// Serial (UDID) of the device this channel talks to
    fn serial(&self) -> &str;

    /// Run a one-shot shell command. Non-zero exit fails with `DeviceCommand`.
    async fn shell(&self, command: &str) -> Result<ShellOutput>;

    /// Copy a host file to the device
    async fn push(&self, local: &Path, remote: &str) -> Result<()>;

    /// Copy a device file to the host
    async fn pull(&self, remote: &str, local: &Path) -> Result<()>;

    /// Install (or reinstall) an APK
    async fn install(&self, apk: &Path) -> Result<()>;

    /// Start a long-running adb command (e.g. `["shell", "..."]`, `["jdwp"]`)
    /// whose output streams into `event_tx`.
    fn spawn(
        &self,
        args: &[String],
        event_tx: mpsc::Sender<ProcessEvent>,
    ) -> Result<StreamingProcess>;

    /// Forward a free local TCP port to `jdwp:<pid>`, returning the port.
    async fn forward_jdwp(&self, pid: u32) -> Result<u16>;

    /// Remove a forward created by [`LocalDeviceChannel::forward_jdwp`].
    async fn remove_forward(&self, port: u16) -> Result<()>;

    /// Read a system property. Unset properties read as an empty string.
    async fn getprop(&self, name: &str) -> Result<String>;
}

/// Host-wide adb handle.
#[derive(Debug, Clone)]
pub struct Adb {
    path: PathBuf,
}

impl Adb {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Locate adb: an explicit path wins, then `<sdk>/platform-tools/adb`,
    /// then whatever `adb` is on `PATH`.
    pub fn locate(explicit: Option<&Path>, sdk_root: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            if path.is_file() {
                return Ok(Self::new(path));
            }
            warn!("Configured adb {} does not exist, searching", path.display());
        }

        if let Some(sdk) = sdk_root {
            let candidate = crate::toolchain::adb_in_sdk(sdk);
            if candidate.is_file() {
                return Ok(Self::new(candidate));
            }
        }

        which::which("adb")
            .map(Self::new)
            .map_err(|_| Error::tool_not_found("adb"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A channel bound to `serial`.
    pub fn channel(&self, serial: impl Into<String>) -> AdbChannel {
        AdbChannel {
            adb: self.path.clone(),
            serial: serial.into(),
        }
    }

    /// List attached devices via `adb devices -l`.
    pub async fn devices(&self) -> Result<Vec<Device>> {
        let output = timeout(
            DEVICES_TIMEOUT,
            Command::new(&self.path)
                .args(["devices", "-l"])
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| Error::device_command("adb devices", "timed out"))?
        .map_err(|e| spawn_error(&self.path, "adb devices", e))?;

        if !output.status.success() {
            return Err(Error::device_command(
                "adb devices",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let devices = parse_devices_output(&String::from_utf8_lossy(&output.stdout));
        debug!("adb reports {} device(s)", devices.len());
        Ok(devices)
    }

    /// Resolve a device by serial, or the only online device when `serial`
    /// is `None`.
    pub async fn find_device(&self, serial: Option<&str>) -> Result<Device> {
        let devices = self.devices().await?;
        select_device(&devices, serial).cloned()
    }
}

/// Pick a device out of a listing.
///
/// With a serial, the device must be listed and online. Without one, the
/// first online device is used.
pub fn select_device<'a>(devices: &'a [Device], serial: Option<&str>) -> Result<&'a Device> {
    match serial {
        Some(serial) => devices
            .iter()
            .find(|d| d.serial == serial && d.state.is_online())
            .ok_or_else(|| Error::DeviceNotFound {
                serial: serial.to_string(),
            }),
        None => devices
            .iter()
            .find(|d| d.state.is_online())
            .ok_or_else(|| Error::DeviceNotFound {
                serial: "<any>".to_string(),
            }),
    }
}

/// Parse `adb devices -l` output.
///
/// Format:
/// `emulator-5554  device product:sdk_gphone64_x86_64 model:sdk_gphone64_x86_64 device:emu64x transport_id:1`
pub fn parse_devices_output(output: &str) -> Vec<Device> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            let rest: Vec<&str> = fields.collect();

            // "no permissions (...)" spans several words before the attributes.
            let attr_start = rest.iter().position(|f| f.contains(':')).unwrap_or(rest.len());
            let state = rest[..attr_start].join(" ");
            if state.is_empty() {
                return None;
            }

            let mut device = Device::new(serial, DeviceState::parse(&state));
            device.model = rest[attr_start..]
                .iter()
                .find_map(|f| f.strip_prefix("model:"))
                .map(str::to_string);
            Some(device)
        })
        .collect()
}

fn spawn_error(program: &Path, command: &str, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::tool_not_found(program.display().to_string())
    } else {
        Error::device_command(command, e.to_string())
    }
}

/// Per-device adb channel.
#[derive(Debug, Clone)]
pub struct AdbChannel {
    adb: PathBuf,
    serial: String,
}

impl AdbChannel {
    fn adb_program(&self) -> String {
        self.adb.to_string_lossy().into_owned()
    }

    /// Run `adb -s <serial> <args...>` to completion.
    async fn run(&self, args: &[&str]) -> Result<ShellOutput> {
        let label = args.join(" ");
        trace!("adb -s {} {}", self.serial, label);

        let output = Command::new(&self.adb)
            .arg("-s")
            .arg(&self.serial)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| spawn_error(&self.adb, &label, e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            let message = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::device_command(label, message));
        }

        Ok(ShellOutput { stdout, stderr })
    }
}

impl DeviceChannel for AdbChannel {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn shell(&self, command: &str) -> Result<ShellOutput> {
        self.run(&["shell", command]).await
    }

    async fn push(&self, local: &Path, remote: &str) -> Result<()> {
        let local = local.to_string_lossy();
        self.run(&["push", &local, remote]).await.map(|_| ())
    }

    async fn pull(&self, remote: &str, local: &Path) -> Result<()> {
        let local = local.to_string_lossy();
        self.run(&["pull", remote, &local]).await.map(|_| ())
    }

    async fn install(&self, apk: &Path) -> Result<()> {
        let apk = apk.to_string_lossy();
        self.run(&["install", "-r", &apk]).await.map(|_| ())
    }

    fn spawn(
        &self,
        args: &[String],
        event_tx: mpsc::Sender<ProcessEvent>,
    ) -> Result<StreamingProcess> {
        let mut full = vec!["-s".to_string(), self.serial.clone()];
        full.extend_from_slice(args);
        StreamingProcess::spawn(&self.adb_program(), &full, event_tx)
    }

    async fn forward_jdwp(&self, pid: u32) -> Result<u16> {
        let target = format!("jdwp:{}", pid);
        let output = self.run(&["forward", "tcp:0", &target]).await?;
        let port = output
            .stdout
            .trim()
            .parse::<u16>()
            .map_err(|_| {
                Error::device_command(
                    format!("forward tcp:0 {}", target),
                    format!("unexpected output {:?}", output.stdout.trim()),
                )
            })?;
        debug!("Forwarded tcp:{} -> {}", port, target);
        Ok(port)
    }

    async fn remove_forward(&self, port: u16) -> Result<()> {
        let local = format!("tcp:{}", port);
        self.run(&["forward", "--remove", &local]).await.map(|_| ())
    }

    async fn getprop(&self, name: &str) -> Result<String> {
        let output = DeviceChannel::shell(self, &format!("getprop {}", name)).await?;
        Ok(output.stdout.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICES_OUTPUT: &str = "List of devices attached\n\
        emulator-5554          device product:sdk_gphone64_x86_64 model:sdk_gphone64_x86_64 device:emu64x transport_id:1\n\
        R58M123ABC             unauthorized usb:1-1 transport_id:2\n\
        0123456789ABCDEF       no permissions (user in plugdev group) usb:1-2 transport_id:3\n\
        \n";

    #[test]
    fn test_parse_devices_output() {
        let devices = parse_devices_output(DEVICES_OUTPUT);
        assert_eq!(devices.len(), 3);

        assert_eq!(devices[0].serial, "emulator-5554");
        assert_eq!(devices[0].state, DeviceState::Device);
        assert_eq!(devices[0].model.as_deref(), Some("sdk_gphone64_x86_64"));

        assert_eq!(devices[1].state, DeviceState::Unauthorized);
        assert_eq!(devices[1].model, None);

        assert_eq!(
            devices[2].state,
            DeviceState::Other("no permissions (user in plugdev group)".to_string())
        );
    }

    #[test]
    fn test_parse_devices_output_skips_daemon_banner() {
        let output = "* daemon not running; starting now at tcp:5037\n\
                      * daemon started successfully\n\
                      List of devices attached\n";
        assert!(parse_devices_output(output).is_empty());
    }

    #[test]
    fn test_select_device() {
        let devices = parse_devices_output(DEVICES_OUTPUT);

        let any = select_device(&devices, None).unwrap();
        assert_eq!(any.serial, "emulator-5554");

        let err = select_device(&devices, Some("R58M123ABC")).unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound { .. }));

        let err = select_device(&devices, Some("missing")).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_select_device_none_online() {
        let devices = vec![Device::new("x", DeviceState::Offline)];
        assert!(select_device(&devices, None).is_err());
    }

    #[test]
    fn test_shell_output_lines() {
        let output = ShellOutput {
            stdout: "  a \n\n b\n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(output.lines().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_locate_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let adb = dir.path().join("adb");
        std::fs::write(&adb, "").unwrap();

        let located = Adb::locate(Some(&adb), None).unwrap();
        assert_eq!(located.path(), adb.as_path());
    }

    #[test]
    fn test_locate_from_sdk() {
        let dir = tempfile::tempdir().unwrap();
        let adb = crate::toolchain::adb_in_sdk(dir.path());
        std::fs::create_dir_all(adb.parent().unwrap()).unwrap();
        std::fs::write(&adb, "").unwrap();

        let located = Adb::locate(Some(Path::new("/nonexistent/adb")), Some(dir.path())).unwrap();
        assert_eq!(located.path(), adb.as_path());
    }
}
