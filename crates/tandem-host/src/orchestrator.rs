use std::time::Duration;

use tandem_process::{
    HostStatus, Lifecycle, RunId, ServiceKind, ServiceState, ServiceStatus, StartedPorts,
};
use tracing::Instrument;

use crate::config::{HostConfig, ServiceSpec, TemplateVars};
use crate::error::HostError;
use crate::launcher::{ServiceLauncher, ServiceProcess};
use crate::port_locator::PortLocator;
use crate::reaper::ProcessReaper;

/// How long to wait for a force-killed process to be reaped before giving up on it.
const KILL_CONFIRM: Duration = Duration::from_secs(2);

/// One supervised (or adopted) service instance.
pub struct ServiceHandle<P> {
    spec: ServiceSpec,
    process: Option<P>,
    port: Option<u16>,
    state: ServiceState,
}

impl<P: ServiceProcess> ServiceHandle<P> {
    fn spawned(spec: ServiceSpec, process: P) -> Self {
        Self {
            spec,
            process: Some(process),
            port: None,
            state: ServiceState::Spawned,
        }
    }

    fn adopted(spec: ServiceSpec, port: u16) -> Self {
        Self {
            spec,
            process: None,
            port: Some(port),
            state: ServiceState::Ready,
        }
    }

    fn mark_ready(&mut self, port: u16) {
        // The first resolved port sticks for the handle's lifetime.
        if self.port.is_none() {
            self.port = Some(port);
        }
        self.state = ServiceState::Ready;
    }

    pub fn kind(&self) -> ServiceKind {
        self.spec.kind
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn is_adopted(&self) -> bool {
        self.process.is_none()
    }

    pub fn state(&self) -> ServiceState {
        match &self.process {
            Some(p) if p.has_exited() => ServiceState::Exited,
            _ => self.state,
        }
    }

    fn status(&self) -> ServiceStatus {
        ServiceStatus {
            kind: self.kind(),
            state: self.state(),
            port: self.port,
            pid: self.process.as_ref().and_then(|p| p.pid()),
            adopted: self.is_adopted(),
        }
    }
}

pub struct OrchestratorState<P> {
    pub lifecycle: Lifecycle,
    pub backend: Option<ServiceHandle<P>>,
    pub frontend: Option<ServiceHandle<P>>,
}

impl<P> Default for OrchestratorState<P> {
    fn default() -> Self {
        Self {
            lifecycle: Lifecycle::Idle,
            backend: None,
            frontend: None,
        }
    }
}

impl<P> OrchestratorState<P> {
    fn slot_mut(&mut self, kind: ServiceKind) -> &mut Option<ServiceHandle<P>> {
        match kind {
            ServiceKind::Backend => &mut self.backend,
            ServiceKind::Frontend => &mut self.frontend,
        }
    }

    fn slot(&self, kind: ServiceKind) -> Option<&ServiceHandle<P>> {
        match kind {
            ServiceKind::Backend => self.backend.as_ref(),
            ServiceKind::Frontend => self.frontend.as_ref(),
        }
    }
}

/// Starts the backend and then the frontend, and tears both down again.
///
/// `start` and `stop` take `&mut self`; a host that needs to share the
/// orchestrator wraps it in a mutex, which also keeps a single start attempt
/// in flight.
pub struct ServerOrchestrator<L: ServiceLauncher, R> {
    config: HostConfig,
    launcher: L,
    locator: PortLocator<R>,
    state: OrchestratorState<L::Process>,
}

impl<L: ServiceLauncher, R: ProcessReaper> ServerOrchestrator<L, R> {
    pub fn new(config: HostConfig, launcher: L, reaper: R) -> Result<Self, HostError> {
        config.validate()?;
        let locator = PortLocator::new(
            reaper,
            config.timeouts.probe,
            config.timeouts.settle,
            config.backend.probe_path.clone(),
            config.frontend.probe_path.clone(),
        )?;
        Ok(Self {
            config,
            launcher,
            locator,
            state: OrchestratorState::default(),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lifecycle
    }

    pub fn state(&self) -> &OrchestratorState<L::Process> {
        &self.state
    }

    pub fn status(&self) -> HostStatus {
        HostStatus {
            lifecycle: self.state.lifecycle,
            backend: self.state.backend.as_ref().map(ServiceHandle::status),
            frontend: self.state.frontend.as_ref().map(ServiceHandle::status),
        }
    }

    /// Last `limit` output lines of a launched service, oldest first.
    pub async fn tail_logs(&self, kind: ServiceKind, limit: usize) -> Vec<String> {
        match self.state.slot(kind).and_then(|h| h.process.as_ref()) {
            Some(p) => p.recent_output(limit).await,
            None => Vec::new(),
        }
    }

    pub async fn start(&mut self) -> Result<StartedPorts, HostError> {
        let lifecycle = self.state.lifecycle;
        if !lifecycle.can_start() {
            return Err(HostError::InvalidState(lifecycle));
        }

        let run_id = RunId::new();
        let span = tracing::info_span!("start", %run_id, mode = self.config.mode.as_str());
        async {
            self.state.lifecycle = Lifecycle::Starting;

            if let Some(ports) = self.adopt_running().await {
                self.state.lifecycle = Lifecycle::Running;
                tracing::info!(
                    backend_port = ports.backend_port,
                    frontend_port = ports.frontend_port,
                    "adopted running services"
                );
                return Ok(ports);
            }

            match self.launch_all().await {
                Ok(ports) => {
                    self.state.lifecycle = Lifecycle::Running;
                    tracing::info!(
                        backend_port = ports.backend_port,
                        frontend_port = ports.frontend_port,
                        "services running"
                    );
                    Ok(ports)
                }
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        "start failed, stopping partially started services"
                    );
                    self.stop().await;
                    self.state.lifecycle = Lifecycle::Failed;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Reuses instances started elsewhere, but only when *both* answer their probes.
    /// With only one healthy, both go through the regular reclaim/launch path.
    async fn adopt_running(&mut self) -> Option<StartedPorts> {
        let backend = self
            .locator
            .find_running_instance(&self.config.backend.candidate_ports, ServiceKind::Backend)
            .await;
        let frontend = self
            .locator
            .find_running_instance(&self.config.frontend.candidate_ports, ServiceKind::Frontend)
            .await;

        match (backend, frontend) {
            (Some(backend_port), Some(frontend_port)) => {
                self.state.backend = Some(ServiceHandle::adopted(
                    self.config.backend.clone(),
                    backend_port,
                ));
                self.state.frontend = Some(ServiceHandle::adopted(
                    self.config.frontend.clone(),
                    frontend_port,
                ));
                Some(StartedPorts {
                    backend_port,
                    frontend_port,
                })
            }
            (None, None) => None,
            (backend, frontend) => {
                tracing::info!(
                    backend_port = ?backend,
                    frontend_port = ?frontend,
                    "only one service already running, launching both"
                );
                None
            }
        }
    }

    async fn launch_all(&mut self) -> Result<StartedPorts, HostError> {
        let backend_port = self.launch_service(ServiceKind::Backend, None).await?;
        // The frontend must reach the port the backend really bound, not the one we asked for.
        let backend_url = format!("http://127.0.0.1:{backend_port}");
        let frontend_port = self
            .launch_service(ServiceKind::Frontend, Some(backend_url))
            .await?;
        Ok(StartedPorts {
            backend_port,
            frontend_port,
        })
    }

    async fn launch_service(
        &mut self,
        kind: ServiceKind,
        backend_url: Option<String>,
    ) -> Result<u16, HostError> {
        let spec = self.config.service(kind).clone();
        let port = self
            .locator
            .find_available_port(&spec.candidate_ports, kind)
            .await?;

        let vars = TemplateVars {
            mode: self.config.mode,
            port,
            backend_url,
        };
        let mut process = self.launcher.launch(&spec, &vars).await?;
        let ready = process.await_ready(port, self.config.timeouts.ready).await;

        // Stored even when the wait failed so stop() tears the process down.
        let handle = self
            .state
            .slot_mut(kind)
            .insert(ServiceHandle::spawned(spec, process));
        let resolved = ready?;
        handle.mark_ready(resolved);
        Ok(resolved)
    }

    /// Shuts both services down concurrently and always ends in `Stopped`.
    pub async fn stop(&mut self) {
        self.state.lifecycle = Lifecycle::Stopping;
        let grace = self.config.timeouts.stop_grace;
        let backend = self.state.backend.take();
        let frontend = self.state.frontend.take();

        tokio::join!(shutdown(backend, grace), shutdown(frontend, grace));

        self.state.lifecycle = Lifecycle::Stopped;
        tracing::info!("services stopped");
    }
}

async fn shutdown<P: ServiceProcess>(handle: Option<ServiceHandle<P>>, grace: Duration) {
    let Some(handle) = handle else {
        return;
    };
    let service = handle.kind().as_str();
    let Some(mut process) = handle.process else {
        tracing::info!(service, port = ?handle.port, "adopted instance left running");
        return;
    };
    if process.has_exited() {
        return;
    }

    let graceful = match process.terminate() {
        Ok(()) => match tokio::time::timeout(grace, process.wait()).await {
            Ok(code) => {
                tracing::info!(service, exit_code = ?code, "stopped");
                true
            }
            Err(_) => {
                tracing::warn!(
                    service,
                    grace_ms = grace.as_millis() as u64,
                    "did not exit in time, killing"
                );
                false
            }
        },
        Err(e) => {
            tracing::warn!(service, error = %e, "terminate failed, killing");
            false
        }
    };
    if graceful {
        return;
    }

    if let Err(e) = process.kill() {
        tracing::error!(service, error = %e, "kill failed");
        return;
    }
    if tokio::time::timeout(KILL_CONFIRM, process.wait()).await.is_err() {
        tracing::error!(service, pid = ?process.pid(), "process still running after kill");
    }
}
