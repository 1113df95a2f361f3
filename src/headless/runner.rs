//! Command runner - executes one CLI command and reports through events

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use adbg_app::config::init_config_dir;
use adbg_app::{
    DebugRequest, DebugSession, ProfileOptions, ProfilerEvent, ProfilingSession, RuntimeContext,
    SessionPhase,
};
use adbg_core::prelude::*;
use adbg_core::cancel_pair;
use adbg_daemon::{
    best_abi, device_abis, list_processes, AbiPrompt, DeviceChannel, LogcatSubscription, Toolchain,
};

use super::{EventSink, HeadlessEvent, HeadlessLauncher, StdinAbiPrompt};
use crate::cli::{Args, Command, ProfileArgs};
use crate::signals::wait_for_signal;

/// Run one command against the device, reporting NDJSON events on stdout.
pub async fn run(args: Args) -> Result<()> {
    let project = match &args.project {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };
    info!("Project: {}", project.display());

    if matches!(args.command, Command::Init) {
        return init_config_dir(&project);
    }

    let ctx = Arc::new(RuntimeContext::init(&project)?);
    let sink = EventSink::Stdout;

    let result = execute(&ctx, args, &sink).await;

    let stopped = ctx.shutdown();
    if stopped > 0 {
        info!("Stopped {} leftover debug server(s)", stopped);
    }
    if let Err(e) = &result {
        sink.emit(HeadlessEvent::error(e));
    }
    result
}

async fn execute(ctx: &Arc<RuntimeContext>, args: Args, sink: &EventSink) -> Result<()> {
    let adb = ctx.adb();
    let timing = ctx.settings().timing.discovery();

    match args.command {
        Command::Devices => {
            for device in adb.devices().await? {
                sink.emit(HeadlessEvent::device_listed(&device));
            }
            Ok(())
        }
        Command::Processes { packages, package } => {
            let device = adb.find_device(args.serial.as_deref()).await?;
            let channel = adb.channel(&device.serial);
            for record in list_processes(&channel, packages, package.as_deref(), timing).await? {
                sink.emit(HeadlessEvent::process_listed(&record));
            }
            Ok(())
        }
        Command::Abi => {
            let device = adb.find_device(args.serial.as_deref()).await?;
            let channel = adb.channel(&device.serial);
            let abis = device_abis(&channel).await?;
            let best = best_abi(&abis, Some(ctx.settings().abi.supported.as_slice())).ok();
            sink.emit(HeadlessEvent::abi_resolved(&device.serial, abis, best));
            Ok(())
        }
        Command::Attach(attach) => {
            let request = attach.to_request(ctx.project_path())?;
            start_debug(ctx, args.serial, request, sink).await
        }
        Command::Launch(launch) => {
            let request = launch.to_request(ctx.project_path())?;
            start_debug(ctx, args.serial, request, sink).await
        }
        Command::Profile(profile_args) => {
            let device = adb.find_device(args.serial.as_deref()).await?;
            let channel = adb.channel(&device.serial);
            let abi = match &profile_args.abi {
                Some(abi) => abi.clone(),
                None => best_abi(
                    &device_abis(&channel).await?,
                    Some(ctx.settings().abi.supported.as_slice()),
                )?,
            };
            profile(
                ctx.toolchain(),
                channel,
                &abi,
                profile_options(profile_args),
                sink.clone(),
                shutdown_signal(),
            )
            .await
            .map(|_| ())
        }
        Command::Logcat { pid } => {
            let device = adb.find_device(args.serial.as_deref()).await?;
            let channel = adb.channel(&device.serial);
            logcat(&channel, pid, sink.clone(), shutdown_signal())
                .await
                .map(|_| ())
        }
        Command::Init => Ok(()),
    }
}

async fn start_debug(
    ctx: &Arc<RuntimeContext>,
    serial: Option<String>,
    mut request: DebugRequest,
    sink: &EventSink,
) -> Result<()> {
    let serial = serial.or_else(|| request.serial.clone());
    let device = ctx.adb().find_device(serial.as_deref()).await?;
    request.serial = Some(device.serial.clone());
    let channel = ctx.adb().channel(&device.serial);
    let prompt = StdinAbiPrompt::new(sink.clone());

    debug(
        Arc::clone(ctx),
        channel,
        request,
        &prompt,
        sink.clone(),
        shutdown_signal(),
    )
    .await
}

/// Resolves on SIGINT/SIGTERM. A broken signal handler never resolves so
/// the session keeps running rather than tearing down at once.
async fn shutdown_signal() {
    if let Err(e) = wait_for_signal().await {
        error!("Signal handler error: {}", e);
        std::future::pending::<()>().await;
    }
}

fn profile_options(args: ProfileArgs) -> ProfileOptions {
    ProfileOptions {
        frequency: args.frequency,
        event: args.event,
        package: args.package,
        pid: args.pid,
        symbol_search_paths: args.symbol_search_paths,
        output_dir: args.output,
    }
}

/// Run a debug session until `shutdown` resolves, then tear it down.
///
/// A shutdown during startup cancels provisioning; the session then unwinds
/// on its own and a resulting cancellation is not an error.
pub async fn debug<C, P, S>(
    ctx: Arc<RuntimeContext>,
    channel: C,
    request: DebugRequest,
    prompt: &P,
    sink: EventSink,
    shutdown: S,
) -> Result<()>
where
    C: DeviceChannel + Sync,
    P: AbiPrompt + Sync,
    S: Future<Output = ()>,
{
    let name = request.name.clone();
    let (cancel_handle, cancel) = cancel_pair();

    let (log_tx, mut log_rx) = mpsc::channel::<String>(256);
    let log_sink = sink.clone();
    let log_task = tokio::spawn(async move {
        while let Some(line) = log_rx.recv().await {
            log_sink.emit(HeadlessEvent::log(line));
        }
    });

    let launcher = HeadlessLauncher::new(sink.clone());
    let mut session = DebugSession::new(ctx, channel, launcher, request)
        .with_cancel(cancel)
        .with_log_sink(log_tx);

    tokio::pin!(shutdown);
    let (started, interrupted) = {
        let run = session.run(prompt);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => (result, false),
            _ = &mut shutdown => {
                info!("Shutdown requested while starting '{}'", name);
                cancel_handle.cancel();
                ((&mut run).await, true)
            }
        }
    };

    if let Err(e) = started {
        sink.emit(HeadlessEvent::session_phase(&name, session.phase()));
        drop(session);
        let _ = log_task.await;
        return if interrupted && e.is_cancelled() {
            Ok(())
        } else {
            Err(e)
        };
    }

    sink.emit(HeadlessEvent::session_phase(&name, SessionPhase::Attached));
    if !interrupted {
        shutdown.await;
    }

    session.terminate().await;
    sink.emit(HeadlessEvent::session_phase(&name, session.phase()));
    drop(session);
    let _ = log_task.await;
    Ok(())
}

/// Record a profile until `shutdown` resolves or simpleperf exits by
/// itself, then collect and convert it.
pub async fn profile<C, S>(
    toolchain: &Toolchain,
    channel: C,
    abi: &str,
    options: ProfileOptions,
    sink: EventSink,
    shutdown: S,
) -> Result<Option<PathBuf>>
where
    C: DeviceChannel + Sync,
    S: Future<Output = ()>,
{
    let (event_tx, mut event_rx) = mpsc::channel::<ProfilerEvent>(64);
    let (exited_tx, exited_rx) = oneshot::channel::<()>();

    let forward_sink = sink.clone();
    let forwarder = tokio::spawn(async move {
        let mut exited_tx = Some(exited_tx);
        while let Some(event) = event_rx.recv().await {
            if matches!(event, ProfilerEvent::Terminated { .. }) {
                if let Some(tx) = exited_tx.take() {
                    let _ = tx.send(());
                }
            }
            forward_sink.emit(HeadlessEvent::profiler(event));
        }
    });

    let session = ProfilingSession::start(channel, toolchain, abi, options, event_tx).await?;

    tokio::select! {
        _ = shutdown => info!("Stopping profiler"),
        _ = exited_rx => info!("Profiler exited before a stop was requested"),
    }

    let trace = session.stop(toolchain).await;
    let _ = forwarder.await;
    trace
}

/// Stream device log lines as events until `shutdown` resolves or logcat
/// exits. Returns logcat's exit code.
pub async fn logcat<C, S>(
    channel: &C,
    pid: Option<u32>,
    sink: EventSink,
    shutdown: S,
) -> Result<Option<i32>>
where
    C: DeviceChannel + Sync,
    S: Future<Output = ()>,
{
    let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
    let subscription = LogcatSubscription::start(channel, pid, line_tx)?;

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            line = line_rx.recv() => match line {
                Some(line) => sink.emit(HeadlessEvent::log(line)),
                None => break,
            },
            _ = &mut shutdown => break,
        }
    }

    subscription.stop();
    drop(line_rx);
    Ok(subscription.join().await)
}
