//! Application launch helpers
//!
//! Builds the `am start` command line, classifies its stderr into known
//! failures and provides the small provisioning steps a launch needs
//! (activity resolution, directory sync, package name lookup).

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;
use tokio::process::Command;

use adbg_core::prelude::*;
use adbg_core::LaunchFailure;

use crate::adb::DeviceChannel;
use crate::toolchain::Toolchain;

/// A typed intent extra. Only the forms `am start` accepts as plain flags
/// are supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchExtra {
    String(String),
    Bool(bool),
    StringArray(Vec<String>),
}

impl LaunchExtra {
    /// Convert a JSON value. Numbers, objects, null and mixed arrays are
    /// rejected with `InvalidArgument`.
    pub fn from_json(key: &str, value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(LaunchExtra::String(s.clone())),
            Value::Bool(b) => Ok(LaunchExtra::Bool(*b)),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    other => Err(Error::invalid_argument(format!(
                        "extra `{}` contains a non-string array element: {}",
                        key, other
                    ))),
                })
                .collect::<Result<Vec<_>>>()
                .map(LaunchExtra::StringArray),
            other => Err(Error::invalid_argument(format!(
                "extra `{}` has unsupported type: {}",
                key, other
            ))),
        }
    }
}

/// Parse a JSON object of extras, keeping key order stable.
pub fn extras_from_json(value: &Value) -> Result<BTreeMap<String, LaunchExtra>> {
    match value {
        Value::Null => Ok(BTreeMap::new()),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), LaunchExtra::from_json(k, v)?)))
            .collect(),
        other => Err(Error::invalid_argument(format!(
            "extras must be an object, got {}",
            other
        ))),
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Encode extras as `am start` flags.
pub fn encode_extras(extras: &BTreeMap<String, LaunchExtra>) -> String {
    extras
        .iter()
        .map(|(key, extra)| match extra {
            LaunchExtra::String(v) => format!("--es {} {}", key, quote(v)),
            LaunchExtra::Bool(v) => format!("--eb {} {}", key, v),
            LaunchExtra::StringArray(items) => format!(
                "--esa {} {}",
                key,
                items.iter().map(|s| quote(s)).collect::<Vec<_>>().join(",")
            ),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// `am start` in wait-for-debugger mode for the launcher activity.
pub fn am_start_command(
    package: &str,
    activity: &str,
    extras: &BTreeMap<String, LaunchExtra>,
) -> String {
    let mut command =
        String::from("am start -D -a android.intent.action.MAIN -c android.intent.category.LAUNCHER");
    let encoded = encode_extras(extras);
    if !encoded.is_empty() {
        command.push(' ');
        command.push_str(&encoded);
    }
    command.push_str(&format!(" {}/{}", package, activity));
    command
}

pub fn force_stop_command(package: &str) -> String {
    format!("am force-stop {}", package)
}

/// Ordered substring rules; the first matching rule wins.
pub const LAUNCH_FAILURE_RULES: &[(&str, LaunchFailure)] = &[
    ("Error type 3", LaunchFailure::ActivityClassMissing),
    ("does not exist", LaunchFailure::ActivityClassMissing),
    ("unable to resolve Intent", LaunchFailure::UnresolvableIntent),
    ("SecurityException", LaunchFailure::SecurityDenied),
    ("Permission Denial", LaunchFailure::SecurityDenied),
];

pub fn classify_launch_error(stderr: &str) -> Option<LaunchFailure> {
    LAUNCH_FAILURE_RULES
        .iter()
        .find(|(needle, _)| stderr.contains(needle))
        .map(|(_, failure)| *failure)
}

/// Start the app's activity suspended, waiting for a debugger.
///
/// `am start` often reports failures on stdout with a zero exit status, so
/// both streams are checked.
pub async fn start_activity<C>(
    channel: &C,
    package: &str,
    activity: &str,
    extras: &BTreeMap<String, LaunchExtra>,
) -> Result<()>
where
    C: DeviceChannel + Sync,
{
    let command = am_start_command(package, activity, extras);
    info!("Launching {}/{}", package, activity);

    let text = match channel.shell(&command).await {
        Ok(output) => format!("{}\n{}", output.stdout, output.stderr),
        Err(Error::DeviceCommand { message, .. }) => {
            if let Some(failure) = classify_launch_error(&message) {
                return Err(Error::Launch(failure));
            }
            return Err(Error::device_command(command, message));
        }
        Err(e) => return Err(e),
    };

    if let Some(failure) = classify_launch_error(&text) {
        return Err(Error::Launch(failure));
    }
    if text.lines().any(|l| l.trim_start().starts_with("Error:")) {
        return Err(Error::device_command(command, text.trim().to_string()));
    }
    Ok(())
}

/// Resolve the launcher activity of an installed package.
pub async fn resolve_launch_activity<C>(channel: &C, package: &str) -> Result<String>
where
    C: DeviceChannel + Sync,
{
    let command = format!("cmd package resolve-activity --brief {}", package);
    let output = channel.shell(&command).await?;
    let component = output
        .lines()
        .last()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();

    match component.split_once('/') {
        Some((pkg, activity)) if pkg == package && !activity.is_empty() => {
            debug!("Resolved launch activity {} for {}", activity, package);
            Ok(activity.to_string())
        }
        _ => Err(Error::Launch(LaunchFailure::UnresolvableIntent)),
    }
}

/// Mirror a local directory onto the device.
pub async fn sync_directory<C>(channel: &C, local: &Path, remote: &str) -> Result<()>
where
    C: DeviceChannel + Sync,
{
    if !local.is_dir() {
        return Err(Error::invalid_argument(format!(
            "sync source {} is not a directory",
            local.display()
        )));
    }
    debug!("Syncing {} -> {}", local.display(), remote);
    channel.shell(&format!("mkdir -p {}", remote)).await?;
    // Trailing `.` pushes the directory contents rather than the directory.
    channel.push(&local.join("."), remote).await
}

/// Read the package name out of an APK with `aapt2 dump packagename`.
pub async fn package_from_apk(toolchain: &Toolchain, apk: &Path) -> Result<String> {
    let aapt2 = toolchain.aapt2()?;
    let output = Command::new(&aapt2)
        .arg("dump")
        .arg("packagename")
        .arg(apk)
        .output()
        .await?;

    if !output.status.success() {
        return Err(Error::device_command(
            format!("aapt2 dump packagename {}", apk.display()),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::invalid_argument(format!("no package name in {}", apk.display())))
}
