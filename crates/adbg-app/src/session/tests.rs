//! Tests for the session orchestrator.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use adbg_core::prelude::*;
use adbg_core::{cancel_pair, DebugMode, DebuggerKind, LaunchFailure};
use adbg_daemon::process::ScriptStep;
use adbg_daemon::test_utils::FakeChannel;
use adbg_daemon::{Adb, FirstChoicePrompt, Toolchain};

use crate::config::{DebugRequest, Settings};
use crate::launcher::testing::RecordingLauncher;
use crate::launcher::ChildConfig;
use crate::runtime::RuntimeContext;
use crate::session::{DebugSession, SessionPhase};

const SERIAL: &str = "emulator-5554";
const PACKAGE: &str = "com.example.app";

struct Fixture {
    _dir: TempDir,
    ctx: Arc<RuntimeContext>,
}

/// A runtime whose toolchain has flat-layout lldb-server binaries.
fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    for abi in ["x86_64", "arm64-v8a"] {
        let abi_dir = dir.path().join(abi);
        std::fs::create_dir_all(&abi_dir).unwrap();
        std::fs::write(abi_dir.join("lldb-server"), b"ELF").unwrap();
    }
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
    Fixture {
        _dir: dir,
        ctx: Arc::new(ctx),
    }
}

fn device() -> FakeChannel {
    FakeChannel::new(SERIAL)
        .with_abis(&["x86_64", "x86"])
        .on_shell("stat -c %u /proc/", "package:com.example.app uid:10123")
        .on_shell("/cmdline", PACKAGE)
}

fn session(
    fx: &Fixture,
    channel: &FakeChannel,
    launcher: &RecordingLauncher,
    request: DebugRequest,
) -> DebugSession<FakeChannel, RecordingLauncher> {
    DebugSession::new(fx.ctx.clone(), channel.clone(), launcher.clone(), request)
}

/// A launchable app whose process shows up as pid 4321.
fn launch_device() -> FakeChannel {
    FakeChannel::new(SERIAL)
        .with_abis(&["x86_64"])
        .on_shell("resolve-activity", "com.example.app/.MainActivity")
        .on_shell("am start", "Starting: Intent { cmp=com.example.app/.MainActivity }")
        .on_shell("cat /proc/111/cmdline", "com.other")
        .on_shell("cat /proc/4321/cmdline", PACKAGE)
        .on_shell("stat -c %u /proc/4321", "package:com.example.app uid:10123")
        .on_spawn("jdwp", vec![ScriptStep::stdout(&["111", "4321"])])
}

// ─────────────────────────────────────────────────────────
// Attach
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_attach_native_starts_server_and_child() {
    let fx = fixture();
    let channel = device();
    let launcher = RecordingLauncher::new();
    let mut session = session(
        &fx,
        &channel,
        &launcher,
        DebugRequest::attach(1234, DebugMode::Native),
    );

    session.run(&FirstChoicePrompt).await.unwrap();

    assert_eq!(session.phase(), SessionPhase::Attached);
    assert_eq!(session.package(), Some(PACKAGE));
    assert_eq!(session.abi(), Some("x86_64"));
    let socket = session.socket().unwrap().to_string();
    assert!(socket.starts_with("/com.example.app/platform-"));
    assert!(fx.ctx.servers().contains(&socket));

    let started = launcher.started();
    assert_eq!(started.len(), 1);
    let ChildConfig::Native(native) = &started[0] else {
        panic!("expected native child, got {:?}", started[0]);
    };
    assert_eq!(native.pid, 1234);
    assert_eq!(native.serial, SERIAL);
    assert_eq!(
        native.connect_url,
        format!("unix-abstract-connect://[{}]{}", SERIAL, socket)
    );
    assert_eq!(
        native.init_commands[1],
        format!("platform connect {}", native.connect_url)
    );
    assert!(channel.calls_matching("forward").is_empty());
}

#[tokio::test]
async fn test_terminate_releases_everything_once() {
    let fx = fixture();
    let channel = device();
    let launcher = RecordingLauncher::new();
    let mut session = session(
        &fx,
        &channel,
        &launcher,
        DebugRequest::attach(1234, DebugMode::Dual),
    );
    session.run(&FirstChoicePrompt).await.unwrap();
    assert_eq!(session.forwarded_port(), Some(50_000));

    session.terminate().await;

    assert_eq!(session.phase(), SessionPhase::Terminated);
    assert_eq!(launcher.stopped().len(), 2);
    assert!(fx.ctx.servers().is_empty());
    assert_eq!(
        channel.calls_matching("shell am force-stop"),
        vec!["shell am force-stop com.example.app"]
    );
    assert_eq!(
        channel.calls_matching("remove-forward"),
        vec!["remove-forward tcp:50000"]
    );

    let calls = channel.calls().len();
    session.terminate().await;
    assert_eq!(channel.calls().len(), calls);
    assert_eq!(launcher.stopped().len(), 2);
}

#[tokio::test]
async fn test_dual_attach_starts_native_then_managed() {
    let fx = fixture();
    let channel = device();
    let launcher = RecordingLauncher::new();
    let mut request = DebugRequest::attach(1234, DebugMode::Dual);
    request.managed.insert("sourcePaths".into(), json!(["app/src"]));
    let mut session = session(&fx, &channel, &launcher, request);

    session.run(&FirstChoicePrompt).await.unwrap();

    assert_eq!(
        launcher.attempts(),
        vec![DebuggerKind::Native, DebuggerKind::Managed]
    );
    let ChildConfig::Managed(managed) = &launcher.started()[1] else {
        panic!("expected managed child");
    };
    assert_eq!(managed.port, 50_000);
    assert_eq!(managed.host, "localhost");
    assert!(managed.options.contains_key("sourcePaths"));
    assert_eq!(
        channel.calls_matching("forward"),
        vec!["forward jdwp:1234 tcp:50000"]
    );
    assert_eq!(session.tree().len(), 2);
}

#[tokio::test]
async fn test_dual_native_failure_never_starts_managed() {
    let fx = fixture();
    let channel = device();
    let launcher = RecordingLauncher::failing(DebuggerKind::Native);
    let mut session = session(
        &fx,
        &channel,
        &launcher,
        DebugRequest::attach(1234, DebugMode::Dual),
    );

    let err = session.run(&FirstChoicePrompt).await.unwrap_err();

    assert!(
        matches!(
            err,
            Error::PartialStartup {
                failed: DebuggerKind::Native,
                ..
            }
        ),
        "got {:?}",
        err
    );
    assert_eq!(launcher.attempts(), vec![DebuggerKind::Native]);
    assert!(channel.calls_matching("forward").is_empty());
    assert_eq!(session.phase(), SessionPhase::Terminated);
    // The server that did start was unwound.
    assert!(fx.ctx.servers().is_empty());
    assert_eq!(channel.calls_matching("shell am force-stop").len(), 1);
}

#[tokio::test]
async fn test_managed_failure_names_managed() {
    let fx = fixture();
    let channel = device();
    let launcher = RecordingLauncher::failing(DebuggerKind::Managed);
    let mut session = session(
        &fx,
        &channel,
        &launcher,
        DebugRequest::attach(1234, DebugMode::Dual),
    );

    let err = session.run(&FirstChoicePrompt).await.unwrap_err();

    assert!(matches!(
        err,
        Error::PartialStartup {
            failed: DebuggerKind::Managed,
            ..
        }
    ));
    // Native child was started and then stopped during unwind.
    assert_eq!(launcher.started().len(), 1);
    assert_eq!(launcher.stopped().len(), 1);
    assert_eq!(channel.calls_matching("remove-forward").len(), 1);
}

#[tokio::test]
async fn test_managed_attach_skips_native_provisioning() {
    let fx = fixture();
    let channel = device();
    let launcher = RecordingLauncher::new();
    let mut session = session(
        &fx,
        &channel,
        &launcher,
        DebugRequest::attach(1234, DebugMode::Managed),
    );

    session.run(&FirstChoicePrompt).await.unwrap();

    assert_eq!(session.abi(), None);
    assert!(channel.calls_matching("push").is_empty());
    assert!(channel.calls_matching("spawn").is_empty());
    assert_eq!(launcher.attempts(), vec![DebuggerKind::Managed]);

    session.terminate().await;
    assert!(channel.calls_matching("shell am force-stop").is_empty());
}

#[tokio::test]
async fn test_managed_attach_resumes_vm_after_child_starts() {
    let fx = fixture();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let channel = device().with_forward_port(port);
    let launcher = RecordingLauncher::new();

    // Stand-in VM: echo the handshake, record the command and how many
    // children were running when it arrived, then acknowledge it.
    let observer = launcher.clone();
    let vm = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut handshake = [0u8; 14];
        socket.read_exact(&mut handshake).await.unwrap();
        socket.write_all(&handshake).await.unwrap();

        let mut command = [0u8; 11];
        socket.read_exact(&mut command).await.unwrap();
        let children = observer.started().len();
        socket
            .write_all(&[0, 0, 0, 11, 0, 0, 0, 0, 0x80, 0, 0])
            .await
            .unwrap();
        let mut rest = Vec::new();
        let _ = socket.read_to_end(&mut rest).await;
        (handshake, command, children)
    });

    let mut request = DebugRequest::attach(1234, DebugMode::Managed);
    request.resume_after_attach = true;
    let mut session = session(&fx, &channel, &launcher, request);
    session.run(&FirstChoicePrompt).await.unwrap();
    session.terminate().await;

    let (handshake, command, children) = vm.await.unwrap();
    assert_eq!(&handshake, b"JDWP-Handshake");
    assert_eq!(command, [0, 0, 0, 11, 0, 0, 0, 0, 0, 1, 9]);
    assert_eq!(children, 1);
    assert_eq!(
        channel.calls_matching("forward"),
        vec![format!("forward jdwp:1234 tcp:{}", port)]
    );
}

#[tokio::test]
async fn test_abi_map_applies_to_child_only() {
    let fx = fixture();
    let channel = device();
    let launcher = RecordingLauncher::new();
    let mut request = DebugRequest::attach(1234, DebugMode::Native);
    request
        .native
        .insert("abiMap".into(), json!({ "x86_64": "x86_64-custom" }));
    request.native.insert("initCommands".into(), json!(["bt"]));
    let mut session = session(&fx, &channel, &launcher, request);

    session.run(&FirstChoicePrompt).await.unwrap();

    let ChildConfig::Native(native) = &launcher.started()[0] else {
        panic!("expected native child");
    };
    assert_eq!(native.abi, "x86_64-custom");
    assert!(native.options.contains_key("initCommands"));
    assert!(!native.options.contains_key("abiMap"));
    // The server binary still comes from the device ABI directory.
    assert_eq!(session.abi(), Some("x86_64"));
}

// ─────────────────────────────────────────────────────────
// Resolving failures
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_resolving_failure_acquires_nothing() {
    let fx = fixture();
    let channel = FakeChannel::new(SERIAL).with_abis(&["mips"]);
    let launcher = RecordingLauncher::new();
    let mut request = DebugRequest::attach(1234, DebugMode::Native);
    request.package = Some(PACKAGE.to_string());
    let mut session = session(&fx, &channel, &launcher, request);

    let err = session.run(&FirstChoicePrompt).await.unwrap_err();

    assert!(matches!(err, Error::NoCompatibleAbi { .. }));
    assert_eq!(session.phase(), SessionPhase::Terminated);
    assert!(channel.calls_matching("push").is_empty());
    assert!(launcher.attempts().is_empty());
}

#[tokio::test]
async fn test_invalid_request_rejected() {
    let fx = fixture();
    let channel = device();
    let launcher = RecordingLauncher::new();
    let mut request = DebugRequest::attach(1, DebugMode::Native);
    request.pid = None;
    let mut session = session(&fx, &channel, &launcher, request);

    assert!(matches!(
        session.run(&FirstChoicePrompt).await,
        Err(Error::InvalidArgument { .. })
    ));
    assert!(channel.calls().is_empty());
}

#[tokio::test]
async fn test_run_twice_rejected() {
    let fx = fixture();
    let channel = device();
    let launcher = RecordingLauncher::new();
    let mut session = session(
        &fx,
        &channel,
        &launcher,
        DebugRequest::attach(1234, DebugMode::Managed),
    );
    session.run(&FirstChoicePrompt).await.unwrap();

    assert!(matches!(
        session.run(&FirstChoicePrompt).await,
        Err(Error::InvalidArgument { .. })
    ));
    assert_eq!(launcher.attempts().len(), 1);
}

#[tokio::test]
async fn test_cancelled_before_provisioning() {
    let fx = fixture();
    let channel = device();
    let launcher = RecordingLauncher::new();
    let (handle, signal) = cancel_pair();
    handle.cancel();
    let mut session = session(
        &fx,
        &channel,
        &launcher,
        DebugRequest::attach(1234, DebugMode::Native),
    )
    .with_cancel(signal);

    let err = session.run(&FirstChoicePrompt).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(channel.calls_matching("push").is_empty());
    assert!(channel.spawned().is_empty());
    assert!(fx.ctx.servers().is_empty());
}

// ─────────────────────────────────────────────────────────
// Launch
// ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_launch_managed_finds_new_pid() {
    let fx = fixture();
    let channel = launch_device();
    let launcher = RecordingLauncher::new();
    let mut session = session(
        &fx,
        &channel,
        &launcher,
        DebugRequest::launch(PACKAGE, DebugMode::Managed),
    );

    session.run(&FirstChoicePrompt).await.unwrap();

    assert_eq!(session.pid(), Some(4321));
    assert_eq!(launcher.started()[0].pid(), 4321);

    let calls = channel.calls();
    let resolve = calls
        .iter()
        .position(|c| c.contains("resolve-activity"))
        .unwrap();
    let start = calls.iter().position(|c| c.contains("am start -D")).unwrap();
    let jdwp = calls.iter().position(|c| c == "spawn jdwp").unwrap();
    assert!(resolve < start && start < jdwp);
    assert!(calls[start].ends_with("com.example.app/.MainActivity"));
}

#[tokio::test(start_paused = true)]
async fn test_launch_native_only_forwards_for_resume() {
    let fx = fixture();
    let channel = launch_device();
    let launcher = RecordingLauncher::new();
    let mut request = DebugRequest::launch(PACKAGE, DebugMode::Native);
    request.activity = Some(".MainActivity".to_string());
    let mut session = session(&fx, &channel, &launcher, request);

    // The resume itself fails (nothing listens on the fake port) and is
    // only logged.
    session.run(&FirstChoicePrompt).await.unwrap();

    assert!(channel.calls_matching("shell cmd package resolve-activity").is_empty());
    assert_eq!(
        channel.calls_matching("forward"),
        vec!["forward jdwp:4321 tcp:50000"]
    );

    session.terminate().await;
    assert_eq!(channel.calls_matching("remove-forward").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_launch_classifies_missing_activity() {
    let fx = fixture();
    let channel = FakeChannel::new(SERIAL).on_shell(
        "am start",
        "Starting: Intent\nError type 3\nError: Activity class {com.example.app/.Nope} does not exist.",
    );
    let launcher = RecordingLauncher::new();
    let mut request = DebugRequest::launch(PACKAGE, DebugMode::Managed);
    request.activity = Some(".Nope".to_string());
    let mut session = session(&fx, &channel, &launcher, request);

    let err = session.run(&FirstChoicePrompt).await.unwrap_err();

    match err {
        Error::Startup { cause } => assert!(matches!(
            *cause,
            Error::Launch(LaunchFailure::ActivityClassMissing)
        )),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(channel.spawned().is_empty());
    assert_eq!(session.phase(), SessionPhase::Terminated);
}

#[tokio::test(start_paused = true)]
async fn test_launch_without_process_fails() {
    let fx = fixture();
    let channel = FakeChannel::new(SERIAL)
        .on_shell("resolve-activity", "com.example.app/.MainActivity")
        .on_spawn("jdwp", Vec::new());
    let launcher = RecordingLauncher::new();
    let mut session = session(
        &fx,
        &channel,
        &launcher,
        DebugRequest::launch(PACKAGE, DebugMode::Managed),
    );

    let err = session.run(&FirstChoicePrompt).await.unwrap_err();

    match err {
        Error::Startup { cause } => assert!(matches!(*cause, Error::LaunchPidNotFound { .. })),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(launcher.attempts().is_empty());
}

#[tokio::test]
async fn test_launch_extras_rejected_before_start() {
    let fx = fixture();
    let channel = launch_device();
    let launcher = RecordingLauncher::new();
    let mut request = DebugRequest::launch(PACKAGE, DebugMode::Managed);
    request.activity = Some(".MainActivity".to_string());
    request.extras = json!({ "count": 3 });
    let mut session = session(&fx, &channel, &launcher, request);

    let err = session.run(&FirstChoicePrompt).await.unwrap_err();

    assert!(matches!(err, Error::Startup { .. }));
    assert!(channel.calls_matching("shell am start").is_empty());
}

// ─────────────────────────────────────────────────────────
// Terminating
// ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_terminate_bounded_by_stop_timeout() {
    let fx = fixture();
    let channel = device();
    let launcher = RecordingLauncher::new().with_stop_delay(Duration::from_secs(60));
    let mut session = session(
        &fx,
        &channel,
        &launcher,
        DebugRequest::attach(1234, DebugMode::Managed),
    );
    session.run(&FirstChoicePrompt).await.unwrap();

    let start = tokio::time::Instant::now();
    session.terminate().await;

    assert!(start.elapsed() < Duration::from_secs(60));
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert!(launcher.stopped().is_empty());
    // Cleanup after the stuck stop still ran.
    assert_eq!(channel.calls_matching("remove-forward").len(), 1);
    assert_eq!(session.phase(), SessionPhase::Terminated);
}

#[tokio::test]
async fn test_cleanup_failures_do_not_block() {
    let fx = fixture();
    let channel = device()
        .on_shell_fail("am force-stop", "service unavailable")
        .failing_remove_forward();
    let launcher = RecordingLauncher::new();
    let mut session = session(
        &fx,
        &channel,
        &launcher,
        DebugRequest::attach(1234, DebugMode::Dual),
    );
    session.run(&FirstChoicePrompt).await.unwrap();

    session.terminate().await;

    assert_eq!(session.phase(), SessionPhase::Terminated);
    assert!(fx.ctx.servers().is_empty());
    assert_eq!(channel.calls_matching("remove-forward").len(), 1);
}

#[tokio::test]
async fn test_log_capture_follows_session() {
    let fx = fixture();
    let channel = device().on_spawn(
        "logcat",
        vec![ScriptStep::stdout(&["2026-01-01 10:00:00.000  1234  1234 I app: hello"])],
    );
    let launcher = RecordingLauncher::new();
    let mut request = DebugRequest::attach(1234, DebugMode::Managed);
    request.capture_logs = true;
    let (tx, mut rx) = mpsc::channel(8);
    let mut session = session(&fx, &channel, &launcher, request).with_log_sink(tx);

    session.run(&FirstChoicePrompt).await.unwrap();

    assert!(rx.recv().await.unwrap().ends_with("I app: hello"));
    assert_eq!(
        channel.calls_matching("spawn logcat"),
        vec!["spawn logcat -v threadtime,year --pid=1234"]
    );

    session.terminate().await;
    assert_eq!(rx.recv().await, None);
}
