use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tandem_process::ServiceKind;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "tandem.toml";

const DEFAULT_READY_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 1_500;
const DEFAULT_SETTLE_DELAY_MS: u64 = 1_000;
const DEFAULT_STOP_GRACE_MS: u64 = 5_000;
const DEFAULT_LOG_MAX_LINES: usize = 500;

// Both the config file and the environment go through these bounds.
fn ready_timeout(ms: u64) -> Duration {
    Duration::from_millis(ms.clamp(1_000, 10 * 60 * 1000))
}

fn probe_timeout(ms: u64) -> Duration {
    Duration::from_millis(ms.clamp(100, 10_000))
}

fn settle_delay(ms: u64) -> Duration {
    Duration::from_millis(ms.min(10_000))
}

fn stop_grace(ms: u64) -> Duration {
    Duration::from_millis(ms.clamp(1_000, 60_000))
}

fn log_max_lines(n: usize) -> usize {
    n.clamp(10, 50_000)
}

/// Selects which invocation a service is launched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    Development,
    #[default]
    Production,
}

impl BuildMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildMode::Development => "development",
            BuildMode::Production => "production",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(BuildMode::Development),
            "production" | "prod" => Some(BuildMode::Production),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Values substituted into `{mode}`, `{port}` and `{backend_url}` placeholders
/// of a service's environment template and arguments.
#[derive(Debug, Clone)]
pub struct TemplateVars {
    pub mode: BuildMode,
    pub port: u16,
    pub backend_url: Option<String>,
}

impl TemplateVars {
    pub fn render(&self, raw: &str) -> String {
        raw.replace("{mode}", self.mode.as_str())
            .replace("{port}", &self.port.to_string())
            .replace("{backend_url}", self.backend_url.as_deref().unwrap_or(""))
    }
}

/// Everything needed to locate, launch and probe one service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub kind: ServiceKind,
    pub candidate_ports: Vec<u16>,
    pub dev_command: CommandSpec,
    pub prod_command: CommandSpec,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub probe_path: String,
}

impl ServiceSpec {
    pub fn default_for(kind: ServiceKind) -> Self {
        match kind {
            ServiceKind::Backend => Self {
                kind,
                candidate_ports: vec![47847, 47849, 47851],
                dev_command: CommandSpec::new("npm", &["run", "dev"]),
                prod_command: CommandSpec::new("node", &["dist/server.js"]),
                working_dir: PathBuf::from("backend"),
                env: BTreeMap::from([
                    ("NODE_ENV".to_string(), "{mode}".to_string()),
                    ("PORT".to_string(), "{port}".to_string()),
                ]),
                probe_path: "/api/health".to_string(),
            },
            ServiceKind::Frontend => Self {
                kind,
                candidate_ports: vec![47848, 47850, 47852],
                dev_command: CommandSpec::new("npm", &["run", "dev", "--", "-p", "{port}"]),
                prod_command: CommandSpec::new("node", &["server.js"]),
                working_dir: PathBuf::from("frontend"),
                env: BTreeMap::from([
                    ("NODE_ENV".to_string(), "{mode}".to_string()),
                    ("PORT".to_string(), "{port}".to_string()),
                    ("BACKEND_URL".to_string(), "{backend_url}".to_string()),
                    ("NEXT_PUBLIC_API_URL".to_string(), "{backend_url}".to_string()),
                ]),
                probe_path: "/".to_string(),
            },
        }
    }

    pub fn command(&self, mode: BuildMode) -> &CommandSpec {
        match mode {
            BuildMode::Development => &self.dev_command,
            BuildMode::Production => &self.prod_command,
        }
    }

    pub fn render_env(&self, vars: &TemplateVars) -> BTreeMap<String, String> {
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), vars.render(v)))
            .collect()
    }

    pub fn render_args(&self, mode: BuildMode, vars: &TemplateVars) -> Vec<String> {
        self.command(mode)
            .args
            .iter()
            .map(|a| vars.render(a))
            .collect()
    }

    fn apply(&mut self, raw: RawService) {
        if let Some(v) = raw.candidate_ports {
            self.candidate_ports = v;
        }
        if let Some(v) = raw.dev_command {
            self.dev_command = v;
        }
        if let Some(v) = raw.prod_command {
            self.prod_command = v;
        }
        if let Some(v) = raw.working_dir {
            self.working_dir = v;
        }
        if let Some(v) = raw.env {
            self.env.extend(v);
        }
        if let Some(v) = raw.probe_path {
            self.probe_path = v;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub ready: Duration,
    pub probe: Duration,
    pub settle: Duration,
    pub stop_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ready: Duration::from_millis(DEFAULT_READY_TIMEOUT_MS),
            probe: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            settle: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub mode: BuildMode,
    pub timeouts: Timeouts,
    pub log_dir: Option<PathBuf>,
    pub log_max_lines: usize,
    /// When false, stale instances are never killed; their ports are skipped instead.
    pub reclaim_stale: bool,
    pub backend: ServiceSpec,
    pub frontend: ServiceSpec,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            mode: BuildMode::default(),
            timeouts: Timeouts::default(),
            log_dir: None,
            log_max_lines: DEFAULT_LOG_MAX_LINES,
            reclaim_stale: true,
            backend: ServiceSpec::default_for(ServiceKind::Backend),
            frontend: ServiceSpec::default_for(ServiceKind::Frontend),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHostConfig {
    mode: Option<BuildMode>,
    log_dir: Option<PathBuf>,
    log_max_lines: Option<usize>,
    reclaim_stale: Option<bool>,
    ready_timeout_ms: Option<u64>,
    probe_timeout_ms: Option<u64>,
    settle_delay_ms: Option<u64>,
    stop_grace_ms: Option<u64>,
    backend: Option<RawService>,
    frontend: Option<RawService>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawService {
    candidate_ports: Option<Vec<u16>>,
    dev_command: Option<CommandSpec>,
    prod_command: Option<CommandSpec>,
    working_dir: Option<PathBuf>,
    env: Option<BTreeMap<String, String>>,
    probe_path: Option<String>,
}

impl HostConfig {
    pub fn service(&self, kind: ServiceKind) -> &ServiceSpec {
        match kind {
            ServiceKind::Backend => &self.backend,
            ServiceKind::Frontend => &self.frontend,
        }
    }

    /// Loads `path`, falling back to built-in defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                String::new()
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source: e,
                });
            }
        };

        let mut cfg = Self::from_toml_str(&text).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })?;

        // Relative working directories are resolved against the config file.
        if let Some(base) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            for spec in [&mut cfg.backend, &mut cfg.frontend] {
                if spec.working_dir.is_relative() {
                    spec.working_dir = base.join(&spec.working_dir);
                }
            }
        }
        Ok(cfg)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawHostConfig = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            source: e,
        })?;

        let mut cfg = Self::default();
        if let Some(v) = raw.mode {
            cfg.mode = v;
        }
        cfg.log_dir = raw.log_dir;
        if let Some(v) = raw.log_max_lines {
            cfg.log_max_lines = log_max_lines(v);
        }
        if let Some(v) = raw.reclaim_stale {
            cfg.reclaim_stale = v;
        }
        if let Some(v) = raw.ready_timeout_ms {
            cfg.timeouts.ready = ready_timeout(v);
        }
        if let Some(v) = raw.probe_timeout_ms {
            cfg.timeouts.probe = probe_timeout(v);
        }
        if let Some(v) = raw.settle_delay_ms {
            cfg.timeouts.settle = settle_delay(v);
        }
        if let Some(v) = raw.stop_grace_ms {
            cfg.timeouts.stop_grace = stop_grace(v);
        }
        if let Some(b) = raw.backend {
            cfg.backend.apply(b);
        }
        if let Some(f) = raw.frontend {
            cfg.frontend.apply(f);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Applies `TANDEM_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let num = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(mode) = lookup("TANDEM_MODE").as_deref().and_then(BuildMode::parse) {
            self.mode = mode;
        }
        if let Some(v) = num("TANDEM_READY_TIMEOUT_MS") {
            self.timeouts.ready = ready_timeout(v);
        }
        if let Some(v) = num("TANDEM_PROBE_TIMEOUT_MS") {
            self.timeouts.probe = probe_timeout(v);
        }
        if let Some(v) = num("TANDEM_SETTLE_DELAY_MS") {
            self.timeouts.settle = settle_delay(v);
        }
        if let Some(v) = num("TANDEM_STOP_GRACE_SEC") {
            self.timeouts.stop_grace = stop_grace(v.saturating_mul(1000));
        }
        if let Some(v) = num("TANDEM_LOG_MAX_LINES") {
            self.log_max_lines = log_max_lines(usize::try_from(v).unwrap_or(usize::MAX));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for spec in [&self.backend, &self.frontend] {
            if spec.candidate_ports.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "{}: candidate_ports must not be empty",
                    spec.kind
                )));
            }
            for &port in &spec.candidate_ports {
                if port == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "{}: port 0 is not a valid candidate",
                        spec.kind
                    )));
                }
                if !seen.insert(port) {
                    return Err(ConfigError::Invalid(format!(
                        "{}: port {port} is listed more than once",
                        spec.kind
                    )));
                }
            }
            if spec.command(BuildMode::Development).program.trim().is_empty()
                || spec.command(BuildMode::Production).program.trim().is_empty()
            {
                return Err(ConfigError::Invalid(format!(
                    "{}: command program must not be empty",
                    spec.kind
                )));
            }
            if !spec.probe_path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "{}: probe_path must start with '/'",
                    spec.kind
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = HostConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.mode, BuildMode::Production);
        assert_eq!(cfg.backend.candidate_ports, vec![47847, 47849, 47851]);
        assert_eq!(cfg.frontend.probe_path, "/");
        assert_eq!(cfg.timeouts.ready, Duration::from_secs(60));
        assert_eq!(cfg.timeouts.stop_grace, Duration::from_secs(5));
    }

    #[test]
    fn service_sections_override_fields() {
        let cfg = HostConfig::from_toml_str(
            r#"
mode = "development"
ready_timeout_ms = 30000

[backend]
candidate_ports = [5000, 5001, 5002]
probe_path = "/healthz"
dev_command = { program = "cargo", args = ["run"] }

[backend.env]
RUST_LOG = "info"
"#,
        )
        .unwrap();
        assert_eq!(cfg.mode, BuildMode::Development);
        assert_eq!(cfg.timeouts.ready, Duration::from_secs(30));
        assert_eq!(cfg.backend.candidate_ports, vec![5000, 5001, 5002]);
        assert_eq!(cfg.backend.probe_path, "/healthz");
        assert_eq!(cfg.backend.dev_command.program, "cargo");
        // Template defaults survive alongside extra variables.
        assert_eq!(cfg.backend.env.get("PORT").map(String::as_str), Some("{port}"));
        assert_eq!(cfg.backend.env.get("RUST_LOG").map(String::as_str), Some("info"));
    }

    #[test]
    fn rejects_duplicate_ports_across_services() {
        let err = HostConfig::from_toml_str(
            r#"
[frontend]
candidate_ports = [47847, 3000, 3001]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("47847"));
    }

    #[test]
    fn rejects_port_zero_and_empty_lists() {
        assert!(HostConfig::from_toml_str("[backend]\ncandidate_ports = [0, 1, 2]").is_err());
        assert!(HostConfig::from_toml_str("[backend]\ncandidate_ports = []").is_err());
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(matches!(
            HostConfig::from_toml_str("bogus = 1"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn env_overrides_are_clamped() {
        let mut cfg = HostConfig::default();
        cfg.apply_overrides(|name| match name {
            "TANDEM_MODE" => Some("dev".to_string()),
            "TANDEM_STOP_GRACE_SEC" => Some("600".to_string()),
            "TANDEM_PROBE_TIMEOUT_MS" => Some("5".to_string()),
            "TANDEM_READY_TIMEOUT_MS" => Some("not-a-number".to_string()),
            _ => None,
        });
        assert_eq!(cfg.mode, BuildMode::Development);
        assert_eq!(cfg.timeouts.stop_grace, Duration::from_secs(60));
        assert_eq!(cfg.timeouts.probe, Duration::from_millis(100));
        assert_eq!(cfg.timeouts.ready, Duration::from_secs(60));
    }

    #[test]
    fn file_timeouts_use_the_same_bounds_as_env() {
        let cfg = HostConfig::from_toml_str(
            r#"
ready_timeout_ms = 0
probe_timeout_ms = 0
settle_delay_ms = 999999
stop_grace_ms = 0
log_max_lines = 1
"#,
        )
        .unwrap();
        assert_eq!(cfg.timeouts.ready, Duration::from_secs(1));
        assert_eq!(cfg.timeouts.probe, Duration::from_millis(100));
        assert_eq!(cfg.timeouts.settle, Duration::from_secs(10));
        assert_eq!(cfg.timeouts.stop_grace, Duration::from_secs(1));
        assert_eq!(cfg.log_max_lines, 10);
    }

    #[test]
    fn template_renders_backend_url_for_frontend() {
        let spec = ServiceSpec::default_for(ServiceKind::Frontend);
        let vars = TemplateVars {
            mode: BuildMode::Development,
            port: 47850,
            backend_url: Some("http://127.0.0.1:47849".to_string()),
        };
        let env = spec.render_env(&vars);
        assert_eq!(env["BACKEND_URL"], "http://127.0.0.1:47849");
        assert_eq!(env["NODE_ENV"], "development");
        assert_eq!(env["PORT"], "47850");
        assert_eq!(
            spec.render_args(BuildMode::Development, &vars),
            vec!["run", "dev", "--", "-p", "47850"]
        );
    }

    #[test]
    fn load_missing_file_uses_defaults_and_resolves_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = HostConfig::load(&dir.path().join("tandem.toml")).unwrap();
        assert_eq!(cfg.backend.working_dir, dir.path().join("backend"));
    }

    #[test]
    fn load_reports_path_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tandem.toml");
        std::fs::write(&path, "mode = 3").unwrap();
        let err = HostConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("tandem.toml"));
    }
}
