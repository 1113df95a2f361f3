//! Integration tests for the headless command runner
//!
//! Drives whole debug, logcat and failure flows against a scripted device
//! and checks the NDJSON events a front end would see.

use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};

use adbg_app::{DebugRequest, RequestType, RuntimeContext, Settings};
use adbg_core::{DebugMode, Error};
use adbg_daemon::process::ScriptStep;
use adbg_daemon::test_utils::FakeChannel;
use adbg_daemon::{Adb, FirstChoicePrompt, Toolchain};
use android_debug::headless::runner::{debug, logcat};
use android_debug::headless::{EventSink, HeadlessEvent};

const SERIAL: &str = "emulator-5554";
const PACKAGE: &str = "com.example.app";

// ─────────────────────────────────────────────────────────
// Test Data Helpers
// ─────────────────────────────────────────────────────────

/// Runtime whose toolchain has a flat-layout x86_64 lldb-server.
fn runtime() -> (TempDir, Arc<RuntimeContext>) {
    let dir = tempfile::tempdir().unwrap();
    let abi_dir = dir.path().join("x86_64");
    std::fs::create_dir_all(&abi_dir).unwrap();
    std::fs::write(abi_dir.join("lldb-server"), b"ELF").unwrap();

    let toolchain = Toolchain {
        lldb_server_root: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let ctx = RuntimeContext::new(
        dir.path().to_path_buf(),
        Settings::default(),
        Adb::new("/usr/bin/adb"),
        toolchain,
    );
    (dir, Arc::new(ctx))
}

fn attach_device() -> FakeChannel {
    FakeChannel::new(SERIAL)
        .with_abis(&["x86_64"])
        .on_shell("stat -c %u /proc/", "package:com.example.app uid:10123")
        .on_shell("/cmdline", PACKAGE)
}

fn phases(events: &[HeadlessEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            HeadlessEvent::SessionPhase { phase, .. } => Some(phase.clone()),
            _ => None,
        })
        .collect()
}

fn drain(rx: &mut mpsc::UnboundedReceiver<HeadlessEvent>) -> Vec<HeadlessEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ─────────────────────────────────────────────────────────
// Debug sessions
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_native_attach_runs_until_shutdown() {
    let (_dir, ctx) = runtime();
    let channel = attach_device();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let session = debug(
        Arc::clone(&ctx),
        channel.clone(),
        DebugRequest::attach(1234, DebugMode::Native),
        &FirstChoicePrompt,
        EventSink::Channel(tx),
        async {
            let _ = stop_rx.await;
        },
    );

    let driver = async {
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            let attached = matches!(
                &event,
                HeadlessEvent::SessionPhase { phase, .. } if phase == "attached"
            );
            seen.push(event);
            if attached {
                break;
            }
        }
        let _ = stop_tx.send(());
        seen
    };

    let (result, before_stop) = tokio::join!(session, driver);
    result.unwrap();

    let child_id = match &before_stop[0] {
        HeadlessEvent::ChildStarted { id, config, .. } => {
            assert_eq!(config.pid(), 1234);
            *id
        }
        other => panic!("expected child_started first, got {:?}", other),
    };

    let after_stop = drain(&mut rx);
    assert!(after_stop.iter().any(
        |e| matches!(e, HeadlessEvent::ChildStopped { id, .. } if *id == child_id)
    ));
    assert_eq!(phases(&after_stop), vec!["terminated"]);
    assert!(ctx.servers().is_empty());
    assert_eq!(channel.calls_matching("shell am force-stop com.example.app").len(), 1);
}

#[tokio::test]
async fn test_shutdown_during_startup_is_clean() {
    let (_dir, ctx) = runtime();
    let channel = attach_device();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let result = debug(
        Arc::clone(&ctx),
        channel,
        DebugRequest::attach(1234, DebugMode::Native),
        &FirstChoicePrompt,
        EventSink::Channel(tx),
        std::future::ready(()),
    )
    .await;
    assert!(result.is_ok(), "got {:?}", result);

    // Depending on where cancellation lands, the session either never
    // attached or attached and was torn down. Either way nothing leaks.
    let events = drain(&mut rx);
    assert_eq!(phases(&events).last().map(String::as_str), Some("terminated"));
    let started = events
        .iter()
        .filter(|e| matches!(e, HeadlessEvent::ChildStarted { .. }))
        .count();
    let stopped = events
        .iter()
        .filter(|e| matches!(e, HeadlessEvent::ChildStopped { .. }))
        .count();
    assert_eq!(started, stopped);
    assert!(ctx.servers().is_empty());
}

#[tokio::test]
async fn test_invalid_request_reports_terminated() {
    let (_dir, ctx) = runtime();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let request = DebugRequest {
        name: "broken".into(),
        request: RequestType::Attach,
        ..Default::default()
    };

    let err = debug(
        ctx,
        attach_device(),
        request,
        &FirstChoicePrompt,
        EventSink::Channel(tx),
        std::future::pending::<()>(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::InvalidArgument { .. }));
    assert_eq!(phases(&drain(&mut rx)), vec!["terminated"]);
}

#[tokio::test(start_paused = true)]
async fn test_managed_launch_streams_logs() {
    let (_dir, ctx) = runtime();
    let channel = FakeChannel::new(SERIAL)
        .with_abis(&["x86_64"])
        .on_shell("resolve-activity", "com.example.app/.MainActivity")
        .on_shell("am start", "Starting: Intent { cmp=com.example.app/.MainActivity }")
        .on_shell("cat /proc/4321/cmdline", PACKAGE)
        .on_shell("stat -c %u /proc/4321", "package:com.example.app uid:10123")
        .on_spawn("jdwp", vec![ScriptStep::stdout(&["4321"])])
        .on_spawn(
            "logcat",
            vec![ScriptStep::stdout(&[
                "2026-10-16 10:00:00.000  4321  4321 I app: started",
            ])],
        );
    let mut request = DebugRequest::launch(PACKAGE, DebugMode::Managed);
    request.capture_logs = true;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let session = debug(
        Arc::clone(&ctx),
        channel.clone(),
        request,
        &FirstChoicePrompt,
        EventSink::Channel(tx),
        async {
            let _ = stop_rx.await;
        },
    );

    let driver = async {
        let (mut attached, mut logged) = (false, false);
        let mut port = None;
        while !(attached && logged) {
            match rx.recv().await {
                Some(HeadlessEvent::SessionPhase { phase, .. }) if phase == "attached" => {
                    attached = true
                }
                Some(HeadlessEvent::Log { line, .. }) => {
                    assert!(line.ends_with("I app: started"));
                    logged = true;
                }
                Some(HeadlessEvent::ChildStarted { config, .. }) => {
                    port = match config {
                        adbg_app::ChildConfig::Managed(managed) => Some(managed.port),
                        other => panic!("unexpected child {:?}", other),
                    };
                }
                Some(_) => {}
                None => break,
            }
        }
        let _ = stop_tx.send(());
        port
    };

    let (result, port) = tokio::join!(session, driver);
    result.unwrap();

    let port = port.expect("managed child started");
    assert_eq!(
        channel.calls_matching("remove-forward"),
        vec![format!("remove-forward tcp:{}", port)]
    );
    // Managed-only launches leave the process alive.
    assert!(channel.calls_matching("shell am force-stop").is_empty());
}

// ─────────────────────────────────────────────────────────
// Logcat
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_logcat_forwards_until_exit() {
    let channel = FakeChannel::new(SERIAL).on_spawn(
        "logcat",
        vec![
            ScriptStep::stdout(&["first", "second"]),
            ScriptStep::Exit(Some(0)),
        ],
    );
    let (tx, mut rx) = mpsc::unbounded_channel();

    let code = logcat(
        &channel,
        Some(99),
        EventSink::Channel(tx),
        std::future::pending::<()>(),
    )
    .await
    .unwrap();

    assert_eq!(code, Some(0));
    let lines: Vec<String> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            HeadlessEvent::Log { line, .. } => Some(line),
            _ => None,
        })
        .collect();
    assert_eq!(lines, vec!["first", "second"]);
    assert_eq!(
        channel.calls_matching("spawn logcat"),
        vec!["spawn logcat -v threadtime,year --pid=99"]
    );
}

#[tokio::test]
async fn test_logcat_stops_on_shutdown() {
    let channel = FakeChannel::new(SERIAL)
        .on_spawn("logcat", vec![ScriptStep::stdout(&["only line"])]);
    let (tx, _rx) = mpsc::unbounded_channel();

    let code = logcat(&channel, None, EventSink::Channel(tx), std::future::ready(()))
        .await
        .unwrap();

    assert_eq!(code, None);
    assert_eq!(channel.calls_matching("spawn logcat").len(), 1);
}
