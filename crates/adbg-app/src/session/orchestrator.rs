//! Session orchestrator
//!
//! Drives one attach or launch request through
//! `Configuring -> Resolving -> Starting -> Attached -> Terminating -> Terminated`.
//!
//! Resolving acquires nothing, so its errors are returned as-is. Any failure
//! once Starting has begun unwinds through [`DebugSession::terminate`], the
//! same path a normal shutdown takes, and is reported as `error starting`.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::time::timeout;

use adbg_core::prelude::*;
use adbg_core::{CancelSignal, DebuggerKind};
use adbg_daemon::abi::{AbiPrompt, AbiResolutionContext};
use adbg_daemon::discovery::{self, latest_for_package, list_processes};
use adbg_daemon::jdwp::JdwpClient;
use adbg_daemon::launch::{self, force_stop_command};
use adbg_daemon::lldb_server::{self, connect_url, LldbServerHandle};
use adbg_daemon::{DeviceChannel, LogcatSubscription};

use super::tree::{DebugSessionTree, SessionPhase};
use crate::config::{DebugRequest, RequestType};
use crate::launcher::{
    lldb_init_commands, ChildConfig, DebuggerLauncher, ManagedChildConfig, NativeChildConfig,
};
use crate::runtime::RuntimeContext;

const JDWP_HOST: &str = "127.0.0.1";

/// What Resolving produced.
#[derive(Debug, Clone, Default)]
struct ResolvedTarget {
    package: Option<String>,
    pid: Option<u32>,
    abi: Option<String>,
}

/// Resources acquired while starting. Each is released by `terminate`.
#[derive(Debug, Default)]
struct SessionResources {
    package: Option<String>,
    pid: Option<u32>,
    abi: Option<String>,
    server: Option<LldbServerHandle>,
    forwarded_port: Option<u16>,
    jdwp: Option<JdwpClient>,
    logcat: Option<LogcatSubscription>,
}

/// One debug request and everything it started.
pub struct DebugSession<C, L> {
    ctx: Arc<RuntimeContext>,
    channel: C,
    launcher: L,
    request: DebugRequest,
    phase: SessionPhase,
    abi: AbiResolutionContext,
    cancel: CancelSignal,
    log_tx: Option<mpsc::Sender<String>>,
    resources: SessionResources,
    tree: DebugSessionTree,
}

impl<C, L> std::fmt::Debug for DebugSession<C, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugSession")
            .field("request", &self.request.name)
            .field("mode", &self.request.mode)
            .field("phase", &self.phase)
            .field("resources", &self.resources)
            .field("children", &self.tree)
            .finish()
    }
}

impl<C, L> DebugSession<C, L>
where
    C: DeviceChannel + Sync,
    L: DebuggerLauncher + Sync,
{
    pub fn new(ctx: Arc<RuntimeContext>, channel: C, launcher: L, request: DebugRequest) -> Self {
        let settings = ctx.settings();
        let mut abi_map = settings.abi.map.clone();
        abi_map.extend(request.abi_map());
        let supported = request
            .abi_supported()
            .unwrap_or_else(|| settings.abi.supported.clone());
        let abi = AbiResolutionContext::new(request.abi_request(), Some(supported), abi_map);

        Self {
            ctx,
            channel,
            launcher,
            request,
            phase: SessionPhase::Configuring,
            abi,
            cancel: CancelSignal::never(),
            log_tx: None,
            resources: SessionResources::default(),
            tree: DebugSessionTree::default(),
        }
    }

    /// Abandon ABI resolution and server provisioning when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Where captured log lines go when the request asks for log capture.
    pub fn with_log_sink(mut self, log_tx: mpsc::Sender<String>) -> Self {
        self.log_tx = Some(log_tx);
        self
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn request(&self) -> &DebugRequest {
        &self.request
    }

    pub fn pid(&self) -> Option<u32> {
        self.resources.pid
    }

    pub fn package(&self) -> Option<&str> {
        self.resources.package.as_deref()
    }

    /// Device ABI chosen for native debugging.
    pub fn abi(&self) -> Option<&str> {
        self.resources.abi.as_deref()
    }

    pub fn socket(&self) -> Option<&str> {
        self.resources.server.as_ref().map(|s| s.socket())
    }

    pub fn forwarded_port(&self) -> Option<u16> {
        self.resources.forwarded_port
    }

    pub fn tree(&self) -> &DebugSessionTree {
        &self.tree
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        debug!("Session '{}': {} -> {}", self.request.name, self.phase, phase);
        self.phase = phase;
    }

    /// Resolve, start and attach.
    ///
    /// On success the session is `Attached`. On failure it is `Terminated`
    /// with everything it acquired released.
    pub async fn run<P>(&mut self, prompt: &P) -> Result<()>
    where
        P: AbiPrompt + Sync,
    {
        if self.phase != SessionPhase::Configuring {
            return Err(Error::invalid_argument(format!(
                "session already {}",
                self.phase
            )));
        }

        self.set_phase(SessionPhase::Resolving);
        let target = match self.resolve(prompt).await {
            Ok(target) => target,
            Err(e) => {
                warn!("Resolving '{}' failed: {}", self.request.name, e);
                self.set_phase(SessionPhase::Terminated);
                return Err(e);
            }
        };

        self.set_phase(SessionPhase::Starting);
        if let Err(e) = self.start(target).await {
            error!("Starting '{}' failed: {}", self.request.name, e);
            self.terminate().await;
            return Err(Error::startup(e));
        }

        self.set_phase(SessionPhase::Attached);
        info!(
            "Session '{}' attached to pid {:?} ({} child session(s))",
            self.request.name,
            self.resources.pid,
            self.tree.len()
        );
        Ok(())
    }

    // ─────────────────────────────────────────────────────────
    // Resolving
    // ─────────────────────────────────────────────────────────

    async fn resolve<P>(&self, prompt: &P) -> Result<ResolvedTarget>
    where
        P: AbiPrompt + Sync,
    {
        self.request.validate()?;
        let mut target = ResolvedTarget::default();

        match self.request.request {
            RequestType::Launch => {
                target.package = match (&self.request.package, &self.request.apk) {
                    (Some(package), _) => Some(package.clone()),
                    (None, Some(apk)) => {
                        Some(launch::package_from_apk(self.ctx.toolchain(), apk).await?)
                    }
                    (None, None) => None,
                };
            }
            RequestType::Attach => {
                let pid = self
                    .request
                    .pid
                    .ok_or_else(|| Error::invalid_argument("attach requires a process id"))?;
                target.pid = Some(pid);
                target.package = match &self.request.package {
                    Some(package) => Some(package.clone()),
                    None => self.owning_package(pid).await,
                };
            }
        }

        if self.request.mode.wants_native() {
            let abi = self
                .abi
                .resolve(&self.channel, prompt, self.ctx.abi_memory(), &self.cancel)
                .await?;
            target.abi = Some(abi);
        }

        Ok(target)
    }

    /// Best guess at the package that owns `pid`.
    async fn owning_package(&self, pid: u32) -> Option<String> {
        let name = discovery::process_name(&self.channel, pid).await;
        let packages = discovery::packages_for_pid(&self.channel, pid).await;
        let package = discovery::sort_packages(&name, None, packages)
            .into_iter()
            .next()
            .or_else(|| {
                // `com.app:service` runs as `com.app`
                let base = name.split(':').next().unwrap_or_default();
                base.contains('.').then(|| base.to_string())
            });
        debug!("pid {} belongs to {:?}", pid, package);
        package
    }

    // ─────────────────────────────────────────────────────────
    // Starting
    // ─────────────────────────────────────────────────────────

    async fn start(&mut self, target: ResolvedTarget) -> Result<()> {
        self.resources.package = target.package.clone();
        self.resources.abi = target.abi.clone();

        let pid = match target.pid {
            Some(pid) => pid,
            None => {
                let package = target
                    .package
                    .as_deref()
                    .ok_or_else(|| Error::invalid_argument("launch requires a package name"))?;
                self.launch_app(package).await?
            }
        };
        self.resources.pid = Some(pid);

        self.attach_children(pid).await
    }

    /// Install, sync, start the activity and find the new process.
    async fn launch_app(&self, package: &str) -> Result<u32> {
        if self.request.install {
            if let Some(apk) = &self.request.apk {
                info!("Installing {}", apk.display());
                self.channel.install(apk).await?;
            }
        }

        for entry in &self.request.sync {
            launch::sync_directory(&self.channel, &entry.local, &entry.remote).await?;
        }

        let activity = match &self.request.activity {
            Some(activity) => activity.clone(),
            None => launch::resolve_launch_activity(&self.channel, package).await?,
        };
        let extras = self.request.launch_extras()?;
        launch::start_activity(&self.channel, package, &activity, &extras).await?;

        let timing = &self.ctx.settings().timing;
        tokio::time::sleep(timing.launch_settle()).await;

        let records =
            list_processes(&self.channel, true, Some(package), timing.discovery()).await?;
        let record = latest_for_package(&records, package).ok_or_else(|| {
            Error::LaunchPidNotFound {
                package: package.to_string(),
            }
        })?;
        info!("Launched {} as pid {}", package, record.pid);
        Ok(record.pid)
    }

    // ─────────────────────────────────────────────────────────
    // Attaching
    // ─────────────────────────────────────────────────────────

    async fn attach_children(&mut self, pid: u32) -> Result<()> {
        let mode = self.request.mode;

        if mode.wants_native() {
            self.start_native(pid).await?;
        }

        // Native failure returned above, so managed never starts after it.
        if mode.wants_managed() {
            self.start_managed(pid).await?;
        }

        if self.should_resume() {
            self.resume_vm(pid).await;
        }

        if self.request.capture_logs {
            self.start_log_capture(pid);
        }

        Ok(())
    }

    async fn start_native(&mut self, pid: u32) -> Result<()> {
        let package = self.resources.package.clone().unwrap_or_default();
        let abi = self
            .resources
            .abi
            .clone()
            .ok_or_else(|| Error::invalid_argument("native debugging requires an ABI"))?;

        let server = lldb_server::start(
            &self.channel,
            self.ctx.toolchain(),
            self.ctx.servers(),
            &package,
            &abi,
            &self.cancel,
        )
        .await?;
        let socket = server.socket().to_string();
        self.resources.server = Some(server);

        let url = connect_url(self.channel.serial(), &socket);
        let config = NativeChildConfig {
            pid,
            serial: self.channel.serial().to_string(),
            abi: self.abi.mapped(&abi),
            socket,
            init_commands: lldb_init_commands(&url, &self.request.symbol_search_paths),
            connect_url: url,
            options: self.request.native_passthrough(),
        };

        let id = self
            .launcher
            .start(ChildConfig::Native(config))
            .await
            .map_err(|e| Error::partial_startup(DebuggerKind::Native, e.to_string()))?;
        self.tree.add(DebuggerKind::Native, id);
        Ok(())
    }

    async fn start_managed(&mut self, pid: u32) -> Result<()> {
        let port = self.forward(pid).await?;

        let config = ManagedChildConfig {
            pid,
            serial: self.channel.serial().to_string(),
            host: "localhost".to_string(),
            port,
            options: self.request.managed.clone(),
        };

        let id = self
            .launcher
            .start(ChildConfig::Managed(config))
            .await
            .map_err(|e| Error::partial_startup(DebuggerKind::Managed, e.to_string()))?;
        self.tree.add(DebuggerKind::Managed, id);
        Ok(())
    }

    /// Forward a local port to `jdwp:<pid>`, once per session.
    async fn forward(&mut self, pid: u32) -> Result<u16> {
        if let Some(port) = self.resources.forwarded_port {
            return Ok(port);
        }
        let port = self.channel.forward_jdwp(pid).await?;
        debug!("Forwarded tcp:{} -> jdwp:{}", port, pid);
        self.resources.forwarded_port = Some(port);
        Ok(port)
    }

    /// Resume when asked to for managed debugging, and always after a
    /// native-only launch: `am start -D` leaves the VM waiting for a JDWP
    /// debugger that would otherwise never come.
    fn should_resume(&self) -> bool {
        let mode = self.request.mode;
        (self.request.resume_after_attach && mode.wants_managed())
            || (self.request.request == RequestType::Launch && !mode.wants_managed())
    }

    /// Connect, handshake and resume. Failures are logged only.
    async fn resume_vm(&mut self, pid: u32) {
        let port = match self.forward(pid).await {
            Ok(port) => port,
            Err(e) => {
                warn!("Cannot forward JDWP for pid {}: {}", pid, e);
                return;
            }
        };

        let timing = &self.ctx.settings().timing;
        let mut client = match JdwpClient::connect(
            JDWP_HOST,
            port,
            timing.handshake_timeout(),
            timing.reply_timeout(),
        )
        .await
        {
            Ok(client) => client,
            Err(e) => {
                warn!("Could not resume pid {}: {}", pid, e);
                return;
            }
        };

        match client.resume().await {
            Ok(()) => info!("Resumed pid {}", pid),
            Err(e) => warn!("Resume of pid {} failed: {}", pid, e),
        }
        self.resources.jdwp = Some(client);
    }

    fn start_log_capture(&mut self, pid: u32) {
        let Some(log_tx) = self.log_tx.clone() else {
            debug!("Log capture requested without a log sink");
            return;
        };
        match LogcatSubscription::start(&self.channel, Some(pid), log_tx) {
            Ok(subscription) => self.resources.logcat = Some(subscription),
            Err(e) => warn!("Could not start log capture: {}", e),
        }
    }

    // ─────────────────────────────────────────────────────────
    // Terminating
    // ─────────────────────────────────────────────────────────

    /// Stop children and release every acquired resource.
    ///
    /// Each step runs regardless of earlier failures; failures are logged as
    /// leak risks. Calling this again is a no-op.
    pub async fn terminate(&mut self) {
        if self.phase.is_finished() {
            return;
        }
        self.set_phase(SessionPhase::Terminating);

        self.stop_children().await;

        if let Some(mut client) = self.resources.jdwp.take() {
            client.disconnect().await;
        }

        if let Some(logcat) = self.resources.logcat.take() {
            logcat.stop();
        }
        self.log_tx = None;

        if self.request.mode.wants_native() {
            if let Some(package) = self.resources.package.as_deref() {
                if let Err(e) = self.channel.shell(&force_stop_command(package)).await {
                    leak(format!("force-stop of {} failed: {}", package, e));
                }
            }
            if let Some(server) = self.resources.server.take() {
                if !self.ctx.cleanup_socket(server.socket()) {
                    server.stop();
                }
            }
        }

        if let Some(port) = self.resources.forwarded_port.take() {
            if let Err(e) = self.channel.remove_forward(port).await {
                leak(format!("removing forward tcp:{} failed: {}", port, e));
            }
        }

        self.set_phase(SessionPhase::Terminated);
    }

    /// Stop all children in parallel, bounded by the child stop timeout.
    async fn stop_children(&mut self) {
        let children = self.tree.take();
        if children.is_empty() {
            return;
        }

        let launcher = &self.launcher;
        let stops = children.iter().map(|child| async move {
            (child, launcher.stop(child.id).await)
        });

        let limit = self.ctx.settings().timing.child_stop_timeout();
        match timeout(limit, join_all(stops)).await {
            Ok(results) => {
                for (child, result) in results {
                    if let Err(e) = result {
                        leak(format!("stopping {} child {} failed: {}", child.kind, child.id, e));
                    }
                }
            }
            Err(_) => leak(format!(
                "{} child session(s) did not stop within {:?}",
                children.len(),
                limit
            )),
        }
    }
}

fn leak(message: String) {
    let error = Error::leak_risk(message);
    warn!("{}", error);
}
