//! Sandbox lifecycle
//!
//! A [`RuntimeInstance`] owns everything one sandbox session needs: its port
//! reservations, the container tool, the supervised process and the readiness
//! probe. Ports are reserved when the instance is built; the process is only
//! spawned on the first [`RuntimeInstance::connect`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, Instrument, Span};

use crate::command::{CommandBuilder, ContainerTool, InvocationCommand, ServicePorts};
use crate::config::{PortRanges, RuntimeConfig};
use crate::error::RuntimeError;
use crate::image::select_image;
use crate::ports::{PortAllocator, PortReservation};
use crate::probe::{HttpLivenessCheck, LivenessCheck, ReadinessProbe, DEFAULT_CHECK_TIMEOUT};
use crate::supervisor::{ProcessSupervisor, SupervisedProcess};
use crate::Result;

/// Lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeStatus {
    NotStarted,
    Starting,
    Ready,
    Disconnected,
}

impl RuntimeStatus {
    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Status only moves forward, except that any state may fail to
    /// `Disconnected`, a ready sandbox may be re-checked, and a restart
    /// returns a finished sandbox to `NotStarted`.
    pub fn can_transition_to(self, next: RuntimeStatus) -> bool {
        use RuntimeStatus::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (Starting, Ready)
                | (Ready, Starting)
                | (_, Disconnected)
                | (Ready, NotStarted)
                | (Disconnected, NotStarted)
        )
    }
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RuntimeStatus::NotStarted => "NOT_STARTED",
            RuntimeStatus::Starting => "STARTING",
            RuntimeStatus::Ready => "READY",
            RuntimeStatus::Disconnected => "DISCONNECTED",
        };
        write!(f, "{s}")
    }
}

/// A sandbox backend as seen by its callers.
#[async_trait]
pub trait SandboxRuntime: Send {
    /// Start (or re-check) the sandbox and wait until it serves requests.
    async fn connect(&mut self) -> Result<()>;

    /// Tear everything down. Idempotent; never fails.
    async fn close(&mut self);

    fn status(&self) -> RuntimeStatus;

    /// Base URL of the action-execution server.
    fn api_url(&self) -> &str;
}

/// One-time initialization run after the sandbox first becomes ready.
#[async_trait]
pub trait PostStartHook: Send + Sync {
    async fn run(&self, api_url: &str) -> Result<()>;
}

/// Serializable view of an instance.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSummary {
    pub session_id: String,
    pub image: String,
    pub status: RuntimeStatus,
    pub api_url: String,
    pub ports: ServicePorts,
    pub collision_safe: bool,
    pub log_path: Option<PathBuf>,
}

/// An Apptainer-backed sandbox session.
pub struct RuntimeInstance {
    session_id: String,
    config: RuntimeConfig,
    image: String,
    tool: ContainerTool,
    allocator: PortAllocator,
    supervisor: ProcessSupervisor,
    probe: ReadinessProbe,
    liveness: Box<dyn LivenessCheck>,
    post_start: Option<Box<dyn PostStartHook>>,
    post_start_done: bool,
    reservations: Vec<PortReservation>,
    ports: ServicePorts,
    api_url: String,
    log_path: Option<PathBuf>,
    status: RuntimeStatus,
    process: Option<SupervisedProcess>,
    closed: bool,
    span: Span,
}

impl std::fmt::Debug for RuntimeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeInstance")
            .field("session_id", &self.session_id)
            .field("image", &self.image)
            .field("status", &self.status)
            .field("api_url", &self.api_url)
            .field("ports", &self.ports)
            .field("process", &self.process.as_ref().and_then(SupervisedProcess::id))
            .finish_non_exhaustive()
    }
}

impl RuntimeInstance {
    /// Build an instance and reserve its ports.
    ///
    /// Image and executable problems are reported before any port is
    /// reserved.
    pub fn new(config: RuntimeConfig, session_id: impl Into<String>) -> Result<Self> {
        let session_id = session_id.into();
        let span = tracing::info_span!("sandbox.session", session_id = %session_id);
        let entered = span.enter();

        let image = select_image(
            config.runtime_container_image.as_deref(),
            config.base_container_image.as_deref(),
        );
        if image.is_empty() {
            return Err(RuntimeError::Configuration(
                "Apptainer runtime requires a container image (runtime_container_image or base_container_image)"
                    .to_string(),
            ));
        }

        let tool = ContainerTool::resolve(config.executable.as_deref())?;
        let liveness = HttpLivenessCheck::new(DEFAULT_CHECK_TIMEOUT)?;

        let allocator = PortAllocator::from_config(&config);
        let (reservations, ports) = reserve_ports(&allocator, &config.port_ranges)?;
        let api_url = format!("{}:{}", config.local_runtime_url, ports.container_port);
        let log_path = prepare_log_path(config.log_dir.as_deref(), &session_id);

        info!(
            %image,
            executable = ?tool.executable(),
            container_port = ports.container_port,
            %api_url,
            "Created Apptainer runtime instance"
        );

        drop(entered);
        Ok(RuntimeInstance {
            session_id,
            image,
            tool,
            allocator,
            supervisor: ProcessSupervisor::from_config(&config),
            probe: ReadinessProbe::new(config.probe_interval()),
            liveness: Box::new(liveness),
            post_start: None,
            post_start_done: false,
            reservations,
            ports,
            api_url,
            log_path,
            status: RuntimeStatus::NotStarted,
            process: None,
            closed: false,
            span,
            config,
        })
    }

    /// Replace the HTTP liveness check.
    pub fn with_liveness_check(mut self, check: impl LivenessCheck + 'static) -> Self {
        self.liveness = Box::new(check);
        self
    }

    /// Run `hook` once, the first time the sandbox becomes ready.
    pub fn with_post_start_hook(mut self, hook: impl PostStartHook + 'static) -> Self {
        self.post_start = Some(Box::new(hook));
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn tool(&self) -> &ContainerTool {
        &self.tool
    }

    pub fn ports(&self) -> &ServicePorts {
        &self.ports
    }

    /// Host port of the action-execution server (equal to the container port).
    pub fn host_port(&self) -> u16 {
        self.ports.container_port
    }

    /// OS pid of the supervised process, once spawned.
    pub fn process_id(&self) -> Option<u32> {
        self.process.as_ref().and_then(SupervisedProcess::id)
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// `true` only when every held port is backed by a cross-process lock.
    pub fn collision_safe(&self) -> bool {
        !self.reservations.is_empty() && self.reservations.iter().all(PortReservation::is_locked)
    }

    /// The command the next spawn would run.
    pub fn invocation(&self) -> InvocationCommand {
        CommandBuilder::new(&self.tool, &self.config).build(&self.image, &self.ports)
    }

    pub fn summary(&self) -> RuntimeSummary {
        RuntimeSummary {
            session_id: self.session_id.clone(),
            image: self.image.clone(),
            status: self.status,
            api_url: self.api_url.clone(),
            ports: self.ports.clone(),
            collision_safe: self.collision_safe(),
            log_path: self.log_path.clone(),
        }
    }

    /// Close, reserve fresh ports and connect again.
    pub async fn restart(&mut self) -> Result<()> {
        self.close().await;

        let span = self.span.clone();
        async {
            if self.status != RuntimeStatus::NotStarted {
                self.transition(RuntimeStatus::NotStarted)?;
            }
            let (reservations, ports) =
                reserve_ports_async(&self.allocator, &self.config.port_ranges).await?;
            self.reservations = reservations;
            self.ports = ports;
            self.api_url = format!("{}:{}", self.config.local_runtime_url, self.ports.container_port);
            self.closed = false;
            info!(api_url = %self.api_url, "Restarting Apptainer runtime");
            Ok::<(), RuntimeError>(())
        }
        .instrument(span)
        .await?;

        self.connect().await
    }

    /// Nothing is tracked per session, so there is nothing to delete.
    pub async fn delete(_session_id: &str) -> Result<()> {
        Ok(())
    }

    fn transition(&mut self, next: RuntimeStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(RuntimeError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        debug!(from = %self.status, to = %next, "Runtime status change");
        self.status = next;
        Ok(())
    }

    async fn connect_inner(&mut self) -> Result<()> {
        if self.closed {
            return Err(RuntimeError::UnsupportedOperation(
                "instance is closed; restart it to run again".to_string(),
            ));
        }
        if self.status == RuntimeStatus::Ready
            && self.process.as_mut().is_some_and(SupervisedProcess::is_running)
        {
            debug!("Sandbox runtime already ready");
            return Ok(());
        }

        self.transition(RuntimeStatus::Starting)?;
        match self.start_and_wait().await {
            Ok(()) => {
                self.transition(RuntimeStatus::Ready)?;
                info!(api_url = %self.api_url, "Apptainer runtime ready");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Apptainer runtime failed to start");
                self.status = RuntimeStatus::Disconnected;
                Err(e)
            }
        }
    }

    async fn start_and_wait(&mut self) -> Result<()> {
        let mut process = match self.process.take() {
            Some(mut existing) => {
                if existing.is_running() {
                    existing
                } else {
                    self.supervisor.stop(existing).await;
                    self.spawn().await?
                }
            }
            None => self.spawn().await?,
        };

        let probed = self
            .probe
            .wait_until_alive(
                &mut process,
                self.liveness.as_ref(),
                &self.api_url,
                self.config.init_timeout(),
            )
            .await;
        self.process = Some(process);
        probed?;

        if !self.config.attach_to_existing && !self.post_start_done {
            if let Some(hook) = &self.post_start {
                hook.run(&self.api_url).await?;
            }
            self.post_start_done = true;
        }
        Ok(())
    }

    async fn spawn(&mut self) -> Result<SupervisedProcess> {
        if self.config.attach_to_existing {
            return Err(RuntimeError::UnsupportedOperation(
                "attach_to_existing is not supported for Apptainer runtime".to_string(),
            ));
        }

        let command = self.invocation();
        info!(image = %self.image, port = self.ports.container_port, "Starting Apptainer sandbox");
        self.supervisor.start(&command, self.log_path.as_deref()).await
    }

    async fn close_inner(&mut self) {
        if let Some(process) = self.process.take() {
            let status = self.supervisor.stop(process).await;
            info!(?status, "Apptainer sandbox stopped");
        }

        for mut reservation in self.reservations.drain(..) {
            if self.allocator.release(&mut reservation) {
                debug!(port = reservation.port(), "Released port reservation");
            }
        }

        if self.status != RuntimeStatus::NotStarted {
            self.status = RuntimeStatus::Disconnected;
        }
        self.closed = true;
    }
}

#[async_trait]
impl SandboxRuntime for RuntimeInstance {
    async fn connect(&mut self) -> Result<()> {
        let span = self.span.clone();
        self.connect_inner().instrument(span).await
    }

    async fn close(&mut self) {
        let span = self.span.clone();
        self.close_inner().instrument(span).await
    }

    fn status(&self) -> RuntimeStatus {
        self.status
    }

    fn api_url(&self) -> &str {
        &self.api_url
    }
}

/// Reserve the execution-server, VS Code and both application ports.
///
/// Blocks for up to the lock timeout per range. Earlier reservations are
/// released on drop if a later range fails.
fn reserve_ports(
    allocator: &PortAllocator,
    ranges: &PortRanges,
) -> Result<(Vec<PortReservation>, ServicePorts)> {
    Ok(assemble_ports([
        allocator.allocate(ranges.execution_server)?,
        allocator.allocate(ranges.vscode)?,
        allocator.allocate(ranges.app_1)?,
        allocator.allocate(ranges.app_2)?,
    ]))
}

/// [`reserve_ports`] with lock retries moved off the async executor.
async fn reserve_ports_async(
    allocator: &PortAllocator,
    ranges: &PortRanges,
) -> Result<(Vec<PortReservation>, ServicePorts)> {
    Ok(assemble_ports([
        allocator.allocate_async(ranges.execution_server).await?,
        allocator.allocate_async(ranges.vscode).await?,
        allocator.allocate_async(ranges.app_1).await?,
        allocator.allocate_async(ranges.app_2).await?,
    ]))
}

fn assemble_ports(reserved: [PortReservation; 4]) -> (Vec<PortReservation>, ServicePorts) {
    let [execution, vscode, app_1, app_2] = reserved;
    let ports = ServicePorts {
        container_port: execution.port(),
        vscode_port: Some(vscode.port()),
        app_ports: vec![app_1.port(), app_2.port()],
    };
    (vec![execution, vscode, app_1, app_2], ports)
}

fn prepare_log_path(log_dir: Option<&Path>, session_id: &str) -> Option<PathBuf> {
    let dir = log_dir?;
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!(dir = ?dir, error = %e, "Cannot create Apptainer runtime log directory");
        return None;
    }
    Some(dir.join(format!("{session_id}.log")))
}
