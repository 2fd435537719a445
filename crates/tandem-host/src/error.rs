use std::time::Duration;

use tandem_process::{Lifecycle, ServiceKind};

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("no free port for {kind}: all candidates {candidates:?} are in use by other programs")]
    PortExhausted {
        kind: ServiceKind,
        candidates: Vec<u16>,
    },

    #[error("{kind} did not report readiness within {}ms", timeout.as_millis())]
    StartupTimeout { kind: ServiceKind, timeout: Duration },

    #[error("{kind} exited before becoming ready (exit code {})", fmt_code(*code))]
    ProcessExited { kind: ServiceKind, code: Option<i32> },

    #[error("failed to spawn {kind}: {source}")]
    Spawn {
        kind: ServiceKind,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot start while the orchestrator is {0:?}")]
    InvalidState(Lifecycle),

    #[error("build http probe client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn fmt_code(code: Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none, killed by signal".to_string())
}

/// Reclaiming a port is best-effort. These never leave the port locator.
#[derive(Debug, thiserror::Error)]
pub enum ReapError {
    #[error("reap attempt on port {port} failed: {reason}")]
    ReapAttemptFailed { port: u16, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_exhausted_names_the_list() {
        let err = HostError::PortExhausted {
            kind: ServiceKind::Backend,
            candidates: vec![47847, 47849, 47851],
        };
        let msg = err.to_string();
        assert!(msg.contains("[47847, 47849, 47851]"));
        assert!(msg.contains("backend"));
    }

    #[test]
    fn process_exited_without_code_mentions_signal() {
        let err = HostError::ProcessExited {
            kind: ServiceKind::Frontend,
            code: None,
        };
        assert!(err.to_string().contains("killed by signal"));

        let err = HostError::ProcessExited {
            kind: ServiceKind::Frontend,
            code: Some(1),
        };
        assert!(err.to_string().contains("exit code 1"));
    }
}
