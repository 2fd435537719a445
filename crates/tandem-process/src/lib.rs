use std::fmt;

use specta::Type;

/// Identifier for one `start()` attempt, carried on log spans so the two
/// services' output can be correlated with the attempt that spawned them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two services the host supervises. The set is closed on purpose:
/// the frontend depends on the backend and nothing else is orchestrated.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
    Type,
)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Backend,
    Frontend,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 2] = [ServiceKind::Backend, ServiceKind::Frontend];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::Backend => "backend",
            ServiceKind::Frontend => "frontend",
        }
    }

    /// HTTP statuses a healthy instance of this service answers its probe with.
    pub fn healthy_statuses(self) -> &'static [u16] {
        match self {
            ServiceKind::Backend => &[200],
            // Static frontends answer conditional GETs with 304.
            ServiceKind::Frontend => &[200, 304],
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-service handle flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub enum ServiceState {
    Spawned,
    Ready,
    Exited,
}

/// Overall orchestrator lifecycle.
///
/// `Idle -> Starting -> Running -> Stopping -> Stopped`, with `Starting -> Failed`
/// when any start step errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub enum Lifecycle {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl Lifecycle {
    /// Whether a new `start()` may begin from this state.
    pub fn can_start(self) -> bool {
        matches!(self, Lifecycle::Idle | Lifecycle::Stopped | Lifecycle::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct ServiceStatus {
    pub kind: ServiceKind,
    pub state: ServiceState,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    /// True when the instance was already running and the host adopted it.
    pub adopted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct HostStatus {
    pub lifecycle: Lifecycle,
    pub backend: Option<ServiceStatus>,
    pub frontend: Option<ServiceStatus>,
}

impl HostStatus {
    pub fn service(&self, kind: ServiceKind) -> Option<&ServiceStatus> {
        match kind {
            ServiceKind::Backend => self.backend.as_ref(),
            ServiceKind::Frontend => self.frontend.as_ref(),
        }
    }
}

/// Ports both services ended up listening on after a successful start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct StartedPorts {
    pub backend_port: u16,
    pub frontend_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_is_non_empty() {
        let id = RunId::new();
        assert!(!id.0.is_empty());
        assert_ne!(id, RunId::new());
    }

    #[test]
    fn frontend_accepts_not_modified() {
        assert_eq!(ServiceKind::Backend.healthy_statuses(), &[200]);
        assert!(ServiceKind::Frontend.healthy_statuses().contains(&304));
    }

    #[test]
    fn only_terminal_states_allow_start() {
        assert!(Lifecycle::Idle.can_start());
        assert!(Lifecycle::Stopped.can_start());
        assert!(Lifecycle::Failed.can_start());
        assert!(!Lifecycle::Starting.can_start());
        assert!(!Lifecycle::Running.can_start());
        assert!(!Lifecycle::Stopping.can_start());
    }

    #[test]
    fn kind_serializes_lowercase() {
        let s = serde_json::to_string(&ServiceKind::Frontend).unwrap();
        assert_eq!(s, "\"frontend\"");
    }
}
