//! Process Discovery Service
//!
//! `adb jdwp` reports one pid per line whenever the set of debuggable VM
//! processes changes and never exits on its own. We collect ids until the
//! stream goes quiet, stop it, then resolve names and owning packages.

use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use adbg_core::prelude::*;
use adbg_core::{ProcessEvent, ProcessRecord};

use crate::adb::DeviceChannel;

/// Debounce timing for the pid collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryTiming {
    /// How long to wait for the first burst
    pub initial_wait: Duration,

    /// Silence after the latest burst that ends collection
    pub quiet_period: Duration,
}

impl Default for DiscoveryTiming {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_millis(3000),
            quiet_period: Duration::from_millis(200),
        }
    }
}

/// Collect stdout lines until the stream is quiet.
///
/// Waits up to `initial` for the first stdout batch. Every stdout batch then
/// moves the deadline to `quiet` after its arrival. Stderr is logged but does
/// not extend the wait. An exit or closed channel ends collection early.
pub async fn collect_until_quiet(
    rx: &mut mpsc::Receiver<ProcessEvent>,
    initial: Duration,
    quiet: Duration,
) -> Vec<String> {
    let mut lines = Vec::new();
    let mut deadline = Instant::now() + initial;

    loop {
        match timeout_at(deadline, rx.recv()).await {
            Err(_) => {
                trace!("Quiet period elapsed with {} line(s)", lines.len());
                break;
            }
            Ok(None) | Ok(Some(ProcessEvent::Exited { .. })) => break,
            Ok(Some(ProcessEvent::Stdout(batch))) => {
                lines.extend(
                    batch
                        .into_iter()
                        .map(|l| l.trim().to_string())
                        .filter(|l| !l.is_empty()),
                );
                deadline = Instant::now() + quiet;
            }
            Ok(Some(ProcessEvent::Stderr(batch))) => {
                for line in batch {
                    warn!("jdwp stderr: {}", line);
                }
            }
        }
    }

    lines
}

/// List debuggable processes on the device.
///
/// `target_package` ranks an exact package match first when packages are
/// resolved.
pub async fn list_processes<C>(
    channel: &C,
    resolve_packages: bool,
    target_package: Option<&str>,
    timing: DiscoveryTiming,
) -> Result<Vec<ProcessRecord>>
where
    C: DeviceChannel + Sync,
{
    let (tx, mut rx) = mpsc::channel::<ProcessEvent>(64);
    let process = channel.spawn(&["jdwp".to_string()], tx)?;

    let lines = collect_until_quiet(&mut rx, timing.initial_wait, timing.quiet_period).await;
    process.stop();

    let pids = parse_pids(&lines);
    debug!("Discovered {} debuggable pid(s)", pids.len());

    let records = join_all(
        pids.into_iter()
            .map(|pid| resolve_record(channel, pid, resolve_packages, target_package)),
    )
    .await;

    Ok(records)
}

async fn resolve_record<C>(
    channel: &C,
    pid: u32,
    resolve_packages: bool,
    target_package: Option<&str>,
) -> ProcessRecord
where
    C: DeviceChannel + Sync,
{
    let name = process_name(channel, pid).await;
    let packages = if resolve_packages {
        let packages = packages_for_pid(channel, pid).await;
        Some(sort_packages(&name, target_package, packages))
    } else {
        None
    };
    ProcessRecord {
        pid,
        name,
        packages,
    }
}

/// Parse pid lines, dropping junk and duplicates while keeping report order.
pub fn parse_pids(lines: &[String]) -> Vec<u32> {
    let mut pids = Vec::new();
    for line in lines {
        match line.trim().parse::<u32>() {
            Ok(pid) if !pids.contains(&pid) => pids.push(pid),
            Ok(_) => {}
            Err(_) => trace!("Ignoring non-pid jdwp line {:?}", line),
        }
    }
    pids
}

/// Process name from `/proc/<pid>/cmdline`, or the pid itself.
pub async fn process_name<C>(channel: &C, pid: u32) -> String
where
    C: DeviceChannel + Sync,
{
    match channel.shell(&format!("cat /proc/{}/cmdline", pid)).await {
        Ok(output) => parse_cmdline(&output.stdout).unwrap_or_else(|| pid.to_string()),
        Err(e) => {
            debug!("Could not read name of {}: {}", pid, e);
            pid.to_string()
        }
    }
}

fn parse_cmdline(cmdline: &str) -> Option<String> {
    cmdline
        .split('\0')
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Packages sharing the sandbox uid of `pid`. Empty on any shell failure.
pub async fn packages_for_pid<C>(channel: &C, pid: u32) -> Vec<String>
where
    C: DeviceChannel + Sync,
{
    let command = format!(
        "stat -c %u /proc/{} | xargs -n 1 cmd package list packages --uid",
        pid
    );
    match channel.shell(&command).await {
        Ok(output) => parse_package_list(&output.stdout),
        Err(e) => {
            debug!("Could not resolve packages of {}: {}", pid, e);
            Vec::new()
        }
    }
}

/// Parse `package:<name> uid:<n>` lines.
pub fn parse_package_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .filter_map(|rest| rest.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Order packages best guess first.
///
/// Rank 0: equals the target package or the process name.
/// Rank 1: prefix match in either direction with the process name.
/// Rank 2: everything else. Ties sort alphabetically.
pub fn sort_packages(
    process_name: &str,
    target_package: Option<&str>,
    mut packages: Vec<String>,
) -> Vec<String> {
    let rank = |package: &str| -> u8 {
        if Some(package) == target_package || package == process_name {
            0
        } else if package.starts_with(process_name) || process_name.starts_with(package) {
            1
        } else {
            2
        }
    };

    packages.sort_by(|a, b| rank(a).cmp(&rank(b)).then_with(|| a.cmp(b)));
    packages.dedup();
    packages
}

/// The most recently reported process belonging to `package`.
///
/// Process names may carry a `:service` suffix, so prefix matches count.
pub fn latest_for_package<'a>(
    records: &'a [ProcessRecord],
    package: &str,
) -> Option<&'a ProcessRecord> {
    records
        .iter()
        .rev()
        .find(|r| r.name.starts_with(package) || r.best_package() == Some(package))
}
