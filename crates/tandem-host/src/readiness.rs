//! Readiness detection on supervised processes' output.
//!
//! Preferred contract is a single structured line:
//!
//! ```text
//! TANDEM_READY_JSON:{"port":47850}
//! ```
//!
//! The free-form phrasings web frameworks print on startup are still accepted,
//! since most services never emit the structured line.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

pub const READY_PREFIX: &str = "TANDEM_READY_JSON:";

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid regex"));

// "ready - started server on 0.0.0.0:3000, url: http://localhost:3000"
static READY_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)ready\b.*started server on \S*:\d{1,5}.*url:\s*https?://\S*:(\d{1,5})\b")
        .expect("valid regex")
});

// "started server on 0.0.0.0:3000". The port follows the last colon, so
// bracketed IPv6 hosts like [::1] resolve correctly.
static STARTED_ON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)started server on \S*:(\d{1,5})\b").expect("valid regex")
});

// "Ready on http://localhost:3000"
static READY_ON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)ready on https?://\S*:(\d{1,5})\b").expect("valid regex")
});

static GENERIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)ready on|listening on|started server").expect("valid regex")
});

/// What a readiness line told us about the bound port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadySignal {
    /// The process reported the port it actually bound.
    Bound(u16),
    /// The process is ready but did not say where.
    Unspecified,
}

impl ReadySignal {
    pub fn resolve(self, requested_port: u16) -> u16 {
        match self {
            ReadySignal::Bound(port) => port,
            ReadySignal::Unspecified => requested_port,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReadyRecord {
    port: u16,
}

fn captured_port(re: &Regex, line: &str) -> Option<u16> {
    let port: u16 = re.captures(line)?.get(1)?.as_str().parse().ok()?;
    (port != 0).then_some(port)
}

pub fn strip_ansi(line: &str) -> std::borrow::Cow<'_, str> {
    ANSI_RE.replace_all(line, "")
}

/// Classifies one output line. `None` means the line says nothing about readiness.
pub fn detect(line: &str) -> Option<ReadySignal> {
    let line = strip_ansi(line);

    if let Some(idx) = line.find(READY_PREFIX) {
        let json = line[idx + READY_PREFIX.len()..].trim();
        match serde_json::from_str::<ReadyRecord>(json) {
            Ok(rec) if rec.port != 0 => return Some(ReadySignal::Bound(rec.port)),
            Ok(_) => return Some(ReadySignal::Unspecified),
            Err(e) => {
                tracing::debug!(error = %e, "malformed readiness record, trying text patterns")
            }
        }
    }

    for re in [&*READY_URL_RE, &*STARTED_ON_RE, &*READY_ON_RE] {
        if let Some(port) = captured_port(re, &line) {
            return Some(ReadySignal::Bound(port));
        }
    }

    GENERIC_RE
        .is_match(&line)
        .then_some(ReadySignal::Unspecified)
}

/// Crude error/noise split for child output. Some frameworks print benign
/// diagnostics on stderr, so only lines that mention an error are escalated.
pub fn looks_like_error(line: &str) -> bool {
    line.to_ascii_lowercase().contains("error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_record_wins() {
        assert_eq!(
            detect(r#"TANDEM_READY_JSON:{"port":47850}"#),
            Some(ReadySignal::Bound(47850))
        );
        assert_eq!(
            detect(r#"[api] TANDEM_READY_JSON: {"port": 47849, "pid": 12}"#),
            Some(ReadySignal::Bound(47849))
        );
    }

    #[test]
    fn malformed_record_falls_back_to_text() {
        assert_eq!(
            detect("TANDEM_READY_JSON:{nope} listening on 3000"),
            Some(ReadySignal::Unspecified)
        );
    }

    #[test]
    fn started_server_on_host_port() {
        assert_eq!(
            detect("started server on 0.0.0.0:47850"),
            Some(ReadySignal::Bound(47850))
        );
        assert_eq!(
            detect("Started server on [::]:47851"),
            Some(ReadySignal::Bound(47851))
        );
        assert_eq!(
            detect("started server on [::1]:47850"),
            Some(ReadySignal::Bound(47850))
        );
        assert_eq!(
            detect("started server on [fe80::1%lo0]:47849, waiting"),
            Some(ReadySignal::Bound(47849))
        );
    }

    #[test]
    fn ready_line_uses_url_port() {
        let line = "ready - started server on 0.0.0.0:47848, url: http://localhost:47852";
        assert_eq!(detect(line), Some(ReadySignal::Bound(47852)));

        let line = "ready - started server on [::]:47848, url: http://[::1]:47850";
        assert_eq!(detect(line), Some(ReadySignal::Bound(47850)));
    }

    #[test]
    fn ready_on_url() {
        assert_eq!(
            detect("> Ready on http://localhost:47850"),
            Some(ReadySignal::Bound(47850))
        );
        assert_eq!(
            detect("Ready on http://[::1]:47850"),
            Some(ReadySignal::Bound(47850))
        );
        assert_eq!(
            detect("ready on http://127.0.0.1:47852/app"),
            Some(ReadySignal::Bound(47852))
        );
    }

    #[test]
    fn colored_output_is_stripped() {
        let line =
            "\x1b[32mready\x1b[39m - started server on 0.0.0.0:3000, url: http://localhost:3001";
        assert_eq!(detect(line), Some(ReadySignal::Bound(3001)));
    }

    #[test]
    fn generic_phrases_have_no_port() {
        assert_eq!(detect("Server listening on all interfaces"), Some(ReadySignal::Unspecified));
        assert_eq!(detect("READY ON localhost"), Some(ReadySignal::Unspecified));
        assert_eq!(detect("started server"), Some(ReadySignal::Unspecified));
    }

    #[test]
    fn unrelated_lines_are_ignored() {
        assert_eq!(detect("compiling..."), None);
        assert_eq!(detect("GET /api/health 200"), None);
    }

    #[test]
    fn resolve_prefers_reported_port() {
        assert_eq!(ReadySignal::Bound(47850).resolve(47847), 47850);
        assert_eq!(ReadySignal::Unspecified.resolve(47847), 47847);
    }

    #[test]
    fn error_keyword_is_case_insensitive() {
        assert!(looks_like_error("Error: EADDRINUSE"));
        assert!(looks_like_error("TypeError: x is undefined"));
        assert!(!looks_like_error("(node:123) ExperimentalWarning: fetch"));
    }
}
