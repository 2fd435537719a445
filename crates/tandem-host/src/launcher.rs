use std::{
    collections::VecDeque,
    future::Future,
    path::Path,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use tandem_process::ServiceKind;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::{Mutex, mpsc, watch},
};

use crate::config::{ServiceSpec, TemplateVars};
use crate::error::HostError;
use crate::readiness;

/// Starts service processes. The orchestrator only talks to this seam so the
/// start sequence can be exercised without real children.
pub trait ServiceLauncher: Send + Sync {
    type Process: ServiceProcess;

    fn launch(
        &self,
        spec: &ServiceSpec,
        vars: &TemplateVars,
    ) -> impl Future<Output = Result<Self::Process, HostError>> + Send;
}

/// A launched service process.
pub trait ServiceProcess: Send + Sync + 'static {
    fn pid(&self) -> Option<u32>;

    fn has_exited(&self) -> bool;

    /// Waits for a readiness line and returns the port the service bound.
    fn await_ready(
        &mut self,
        requested_port: u16,
        timeout: Duration,
    ) -> impl Future<Output = Result<u16, HostError>> + Send;

    /// Asks the process to exit on its own.
    fn terminate(&mut self) -> std::io::Result<()>;

    /// Kills the process without giving it a chance to clean up.
    fn kill(&mut self) -> std::io::Result<()>;

    /// Resolves with the exit code once the process is gone. Cancel-safe.
    fn wait(&mut self) -> impl Future<Output = Option<i32>> + Send;

    fn recent_output(&self, _limit: usize) -> impl Future<Output = Vec<String>> + Send {
        async { Vec::new() }
    }
}

const EXIT_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

#[derive(Debug)]
struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<String>,
}

impl LogBuffer {
    fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    fn push_line(&mut self, stream: Stream, line: &str) {
        self.lines.push_back(format!("[{}] {line}", stream.as_str()));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    fn tail(&self, limit: usize) -> Vec<String> {
        let start = self.lines.len().saturating_sub(limit);
        self.lines.iter().skip(start).cloned().collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct ExitInfo {
    code: Option<i32>,
}

fn log_child_line(kind: ServiceKind, stream: Stream, line: &str) {
    let service = kind.as_str();
    match stream {
        Stream::Stdout => tracing::info!(target: "tandem::child", service, "{line}"),
        Stream::Stderr if readiness::looks_like_error(line) => {
            tracing::error!(target: "tandem::child", service, "{line}")
        }
        Stream::Stderr => tracing::warn!(target: "tandem::child", service, "{line}"),
    }
}

/// Forwards one output stream line by line. Reads raw bytes so a child that
/// prints invalid UTF-8 never stops being drained.
fn spawn_pump<R>(
    reader: R,
    stream: Stream,
    kind: ServiceKind,
    logs: Arc<Mutex<LogBuffer>>,
    tx: mpsc::UnboundedSender<String>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(
                        service = kind.as_str(),
                        stream = stream.as_str(),
                        error = %e,
                        "output read failed"
                    );
                    break;
                }
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\r', '\n']);
            log_child_line(kind, stream, line);
            logs.lock().await.push_line(stream, line);
            let _ = tx.send(line.to_string());
        }
    });
}

#[cfg(target_os = "linux")]
fn set_parent_death_signal() -> std::io::Result<()> {
    // If the host dies without running stop(), the child gets SIGTERM.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(windows)]
fn platform_command(program: &str, args: &[String]) -> Command {
    // npm/npx/yarn are batch shims on Windows and cannot be spawned directly.
    if Path::new(program).extension().is_none() {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(program).args(args);
        cmd
    } else {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd
    }
}

#[cfg(not(windows))]
fn platform_command(program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(Path::new(program));
    cmd.args(args);
    cmd
}

/// Spawns real child processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    log_max_lines: usize,
}

impl ProcessLauncher {
    pub fn new(log_max_lines: usize) -> Self {
        Self { log_max_lines }
    }
}

impl ServiceLauncher for ProcessLauncher {
    type Process = ChildProcess;

    async fn launch(
        &self,
        spec: &ServiceSpec,
        vars: &TemplateVars,
    ) -> Result<ChildProcess, HostError> {
        let kind = spec.kind;
        let program = spec.command(vars.mode).program.clone();
        let args = spec.render_args(vars.mode, vars);
        let env = spec.render_env(vars);

        let mut cmd = platform_command(&program, &args);
        cmd.current_dir(&spec.working_dir)
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            // Own process group, so a signal to -pid reaches npm and whatever it spawned.
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        tracing::info!(
            service = kind.as_str(),
            mode = vars.mode.as_str(),
            port = vars.port,
            cwd = %spec.working_dir.display(),
            "exec: {} {}",
            program,
            args.join(" ")
        );

        let mut child = cmd
            .spawn()
            .map_err(|source| HostError::Spawn { kind, source })?;
        let pid = child.id();
        tracing::info!(service = kind.as_str(), pid = ?pid, "spawned");

        let logs = Arc::new(Mutex::new(LogBuffer::new(self.log_max_lines)));
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        if let Some(out) = child.stdout.take() {
            spawn_pump(out, Stream::Stdout, kind, logs.clone(), line_tx.clone());
        }
        if let Some(err) = child.stderr.take() {
            spawn_pump(err, Stream::Stderr, kind, logs.clone(), line_tx);
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => {
                    tracing::info!(
                        service = kind.as_str(),
                        pid = ?pid,
                        exit_code = ?status.code(),
                        "process exited"
                    );
                    status.code()
                }
                Err(e) => {
                    tracing::warn!(service = kind.as_str(), pid = ?pid, error = %e, "wait failed");
                    None
                }
            };
            let _ = exit_tx.send(Some(ExitInfo { code }));
        });

        Ok(ChildProcess {
            kind,
            pid,
            lines: Some(line_rx),
            exit: exit_rx,
            logs,
        })
    }
}

pub struct ChildProcess {
    kind: ServiceKind,
    pid: Option<u32>,
    /// Output feed for readiness detection; dropped once the service is ready.
    lines: Option<mpsc::UnboundedReceiver<String>>,
    exit: watch::Receiver<Option<ExitInfo>>,
    logs: Arc<Mutex<LogBuffer>>,
}

enum ReadyEvent {
    Line(Option<String>),
    Exited(Option<i32>),
    TimedOut,
}

async fn exit_code(exit: &mut watch::Receiver<Option<ExitInfo>>) -> Option<i32> {
    match exit.wait_for(Option::is_some).await {
        Ok(info) => info.and_then(|i| i.code),
        // Waiter task is gone without reporting; treat as exited.
        Err(_) => None,
    }
}

impl ChildProcess {
    /// Signals the whole process group so children of npm/node go down too.
    #[cfg(unix)]
    fn send_stop(&self, force: bool) -> std::io::Result<()> {
        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return Ok(());
        };
        let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
        let rc = unsafe { libc::kill(-pid, signal) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err);
            }
        }
        Ok(())
    }

    #[cfg(windows)]
    fn send_stop(&self, force: bool) -> std::io::Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let pid = pid.to_string();
        let mut args = vec!["/PID", pid.as_str(), "/T"];
        if force {
            args.push("/F");
        }
        std::process::Command::new("taskkill")
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        Ok(())
    }
}

impl ServiceProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    async fn await_ready(
        &mut self,
        requested_port: u16,
        timeout: Duration,
    ) -> Result<u16, HostError> {
        let kind = self.kind;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let event = match self.lines.as_mut() {
                Some(lines) => {
                    tokio::select! {
                        // Drain output before reacting to an exit.
                        biased;
                        line = lines.recv() => ReadyEvent::Line(line),
                        code = exit_code(&mut self.exit) => ReadyEvent::Exited(code),
                        _ = tokio::time::sleep_until(deadline) => ReadyEvent::TimedOut,
                    }
                }
                // Both output streams closed; only an exit or the deadline remain.
                None => {
                    tokio::select! {
                        code = exit_code(&mut self.exit) => ReadyEvent::Exited(code),
                        _ = tokio::time::sleep_until(deadline) => ReadyEvent::TimedOut,
                    }
                }
            };

            match event {
                ReadyEvent::Line(Some(line)) => {
                    if let Some(signal) = readiness::detect(&line) {
                        let port = signal.resolve(requested_port);
                        if port != requested_port {
                            tracing::info!(
                                service = kind.as_str(),
                                requested_port,
                                port,
                                "service bound a different port"
                            );
                        }
                        tracing::info!(service = kind.as_str(), port, "service ready");
                        self.lines = None;
                        return Ok(port);
                    }
                }
                ReadyEvent::Line(None) => self.lines = None,
                ReadyEvent::Exited(code) => {
                    // Let the pumps flush the last lines so they show up in recent_output.
                    if let Some(lines) = self.lines.as_mut() {
                        let _ = tokio::time::timeout(EXIT_DRAIN, async {
                            while lines.recv().await.is_some() {}
                        })
                        .await;
                    }
                    self.lines = None;
                    return Err(HostError::ProcessExited { kind, code });
                }
                ReadyEvent::TimedOut => {
                    return Err(HostError::StartupTimeout { kind, timeout });
                }
            }
        }
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        self.send_stop(false)
    }

    fn kill(&mut self) -> std::io::Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        self.send_stop(true)
    }

    async fn wait(&mut self) -> Option<i32> {
        exit_code(&mut self.exit).await
    }

    async fn recent_output(&self, limit: usize) -> Vec<String> {
        self.logs.lock().await.tail(limit)
    }
}
