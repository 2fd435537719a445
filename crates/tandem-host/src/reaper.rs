//! Reclaiming ports held by a stale instance of one of our own services.
//!
//! Each platform enumerates listening sockets differently, so the orchestrator
//! only sees [`ProcessReaper`]. [`PlatformReaper`] picks the implementation for
//! the target at compile time.

use std::{collections::BTreeSet, future::Future};

use crate::error::ReapError;

pub trait ProcessReaper: Send + Sync {
    /// Force-terminates every process with a listening socket on `port`.
    ///
    /// Returns `Ok(true)` if at least one process was killed. Processes that are
    /// already gone by the time the signal is sent do not count as errors.
    fn kill_owner_of_port(&self, port: u16)
    -> impl Future<Output = Result<bool, ReapError>> + Send;
}

/// Never kills anything. Used when reclaiming is disabled in the config.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReaper;

impl ProcessReaper for NoopReaper {
    async fn kill_owner_of_port(&self, port: u16) -> Result<bool, ReapError> {
        tracing::debug!(port, "reclaim disabled, leaving port owner alone");
        Ok(false)
    }
}

#[cfg(target_os = "linux")]
pub type PlatformReaper = ProcNetReaper;
#[cfg(all(unix, not(target_os = "linux")))]
pub type PlatformReaper = LsofReaper;
#[cfg(windows)]
pub type PlatformReaper = NetstatReaper;

fn reap_failed(port: u16, reason: impl Into<String>) -> ReapError {
    ReapError::ReapAttemptFailed {
        port,
        reason: reason.into(),
    }
}

/// Kills each pid once, never ourselves. `kill` returns `Ok(false)` for a pid
/// that no longer exists.
fn kill_all(
    port: u16,
    pids: BTreeSet<u32>,
    kill: impl Fn(u32) -> std::io::Result<bool>,
) -> Result<bool, ReapError> {
    let me = std::process::id();
    let mut killed_any = false;
    let mut failures = Vec::new();

    for pid in pids.into_iter().filter(|p| *p != me && *p != 0) {
        match kill(pid) {
            Ok(true) => {
                tracing::info!(port, pid, "killed stale port owner");
                killed_any = true;
            }
            Ok(false) => tracing::debug!(port, pid, "port owner already gone"),
            Err(e) => failures.push(format!("pid {pid}: {e}")),
        }
    }

    if !killed_any && !failures.is_empty() {
        return Err(reap_failed(port, failures.join("; ")));
    }
    for f in &failures {
        tracing::warn!(port, "could not kill port owner: {f}");
    }
    Ok(killed_any)
}

#[cfg(unix)]
fn sigkill(pid: u32) -> std::io::Result<bool> {
    let Ok(pid) = i32::try_from(pid) else {
        return Ok(false);
    };
    let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

// ---- Linux: procfs socket tables + fd links ----

#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcNetReaper;

#[cfg(target_os = "linux")]
impl ProcNetReaper {
    /// Inodes of sockets in LISTEN state bound to `port`, IPv4 and IPv6.
    fn listening_inodes(port: u16) -> procfs::ProcResult<BTreeSet<u64>> {
        use procfs::net::TcpState;

        let mut entries = procfs::net::tcp()?;
        // Kernels without IPv6 have no tcp6 table.
        if let Ok(v6) = procfs::net::tcp6() {
            entries.extend(v6);
        }
        Ok(entries
            .into_iter()
            .filter(|e| e.state == TcpState::Listen && e.local_address.port() == port)
            .map(|e| e.inode)
            .filter(|inode| *inode != 0)
            .collect())
    }

    /// Pids owning a listening socket on `port`. Processes whose fd table we
    /// cannot read (other users, already gone) are skipped.
    pub fn listening_pids(port: u16) -> procfs::ProcResult<BTreeSet<u32>> {
        use procfs::process::FDTarget;

        let inodes = Self::listening_inodes(port)?;
        if inodes.is_empty() {
            return Ok(BTreeSet::new());
        }

        let mut pids = BTreeSet::new();
        for process in procfs::process::all_processes()?.flatten() {
            let Ok(fds) = process.fd() else {
                continue;
            };
            let owns = fds.flatten().any(|fd| {
                matches!(fd.target, FDTarget::Socket(inode) if inodes.contains(&inode))
            });
            if owns && let Ok(pid) = u32::try_from(process.pid) {
                pids.insert(pid);
            }
        }
        Ok(pids)
    }
}

#[cfg(target_os = "linux")]
impl ProcessReaper for ProcNetReaper {
    async fn kill_owner_of_port(&self, port: u16) -> Result<bool, ReapError> {
        let pids = tokio::task::spawn_blocking(move || Self::listening_pids(port))
            .await
            .map_err(|e| reap_failed(port, format!("scan task failed: {e}")))?
            .map_err(|e| reap_failed(port, format!("scan /proc: {e}")))?;
        if pids.is_empty() {
            tracing::debug!(port, "no listening process found");
            return Ok(false);
        }
        kill_all(port, pids, sigkill)
    }
}

// ---- other Unix: lsof ----

/// Pids from `lsof -Fp` output (one `p<pid>` line per process).
#[cfg_attr(not(all(unix, not(target_os = "linux"))), allow(dead_code))]
fn parse_lsof_pids(text: &str) -> BTreeSet<u32> {
    text.lines()
        .filter_map(|l| l.trim().strip_prefix('p'))
        .filter_map(|p| p.parse().ok())
        .collect()
}

#[cfg(all(unix, not(target_os = "linux")))]
#[derive(Debug, Clone, Copy, Default)]
pub struct LsofReaper;

#[cfg(all(unix, not(target_os = "linux")))]
impl ProcessReaper for LsofReaper {
    async fn kill_owner_of_port(&self, port: u16) -> Result<bool, ReapError> {
        // -sTCP:LISTEN keeps clients connected to the port out of the list.
        let out = tokio::process::Command::new("lsof")
            .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-Fp"])
            .output()
            .await
            .map_err(|e| reap_failed(port, format!("run lsof: {e}")))?;
        // lsof exits 1 when nothing matches.
        let pids = parse_lsof_pids(&String::from_utf8_lossy(&out.stdout));
        if pids.is_empty() {
            return Ok(false);
        }
        kill_all(port, pids, sigkill)
    }
}

// ---- Windows: netstat + taskkill ----

/// Pids of `LISTENING` rows whose *local* address ends in `:port`.
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_netstat_listeners(text: &str, port: u16) -> BTreeSet<u32> {
    let suffix = format!(":{port}");
    let mut out = BTreeSet::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 || !fields[0].eq_ignore_ascii_case("tcp") {
            continue;
        }
        if !fields[1].ends_with(&suffix) || !fields[3].eq_ignore_ascii_case("listening") {
            continue;
        }
        if let Ok(pid) = fields[4].parse() {
            out.insert(pid);
        }
    }
    out
}

#[cfg(windows)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NetstatReaper;

#[cfg(windows)]
impl ProcessReaper for NetstatReaper {
    async fn kill_owner_of_port(&self, port: u16) -> Result<bool, ReapError> {
        let out = tokio::process::Command::new("netstat")
            .args(["-ano", "-p", "tcp"])
            .output()
            .await
            .map_err(|e| reap_failed(port, format!("run netstat: {e}")))?;
        let pids = parse_netstat_listeners(&String::from_utf8_lossy(&out.stdout), port);
        if pids.is_empty() {
            return Ok(false);
        }
        kill_all(port, pids, |pid| {
            let status = std::process::Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/F"])
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status()?;
            // taskkill exits 128 when the pid does not exist.
            match status.code() {
                Some(0) => Ok(true),
                Some(128) => Ok(false),
                other => Err(std::io::Error::other(format!(
                    "taskkill exited with {other:?}"
                ))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsof_output_dedupes_pids() {
        let pids = parse_lsof_pids("p101\nf12\np202\np101\n");
        assert_eq!(pids, BTreeSet::from([101, 202]));
    }

    #[test]
    fn netstat_ignores_clients_and_other_ports() {
        let text = "
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:47847          0.0.0.0:0              LISTENING       4242
  TCP    [::]:47847             [::]:0                 LISTENING       4242
  TCP    127.0.0.1:50123        127.0.0.1:47847        ESTABLISHED     777
  TCP    0.0.0.0:147847         0.0.0.0:0              LISTENING       999
  TCP    0.0.0.0:47849          0.0.0.0:0              LISTENING       888
";
        assert_eq!(parse_netstat_listeners(text, 47847), BTreeSet::from([4242]));
    }

    #[test]
    fn kill_all_skips_self_and_tolerates_gone_pids() {
        let me = std::process::id();
        let killed = kill_all(1, BTreeSet::from([me, 10, 11]), |pid| Ok(pid == 10)).unwrap();
        assert!(killed);

        let killed = kill_all(1, BTreeSet::from([me]), |_| panic!("must not kill self")).unwrap();
        assert!(!killed);

        let killed = kill_all(1, BTreeSet::from([12]), |_| Ok(false)).unwrap();
        assert!(!killed);
    }

    #[test]
    fn kill_all_reports_failure_only_when_nothing_was_killed() {
        let err = kill_all(9, BTreeSet::from([20]), |_| {
            Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
        })
        .unwrap_err();
        assert!(err.to_string().contains("port 9"));

        let ok = kill_all(9, BTreeSet::from([20, 21]), |pid| {
            if pid == 20 {
                Ok(true)
            } else {
                Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
            }
        })
        .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn noop_reaper_never_kills() {
        assert!(!NoopReaper.kill_owner_of_port(47847).await.unwrap());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn proc_scan_finds_our_own_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let pids = ProcNetReaper::listening_pids(port).unwrap();
        assert!(pids.contains(&std::process::id()));

        // The reaper refuses to kill the host itself.
        assert!(!ProcNetReaper.kill_owner_of_port(port).await.unwrap());
        drop(listener);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn proc_scan_sees_ipv6_listeners() {
        // Hosts without IPv6 loopback have nothing to check.
        let Ok(listener) = std::net::TcpListener::bind("[::1]:0") else {
            return;
        };
        let port = listener.local_addr().unwrap().port();
        let pids = ProcNetReaper::listening_pids(port).unwrap();
        assert!(pids.contains(&std::process::id()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn proc_scan_ignores_closed_and_client_ports() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let server_port = listener.local_addr().unwrap().port();
        let client = std::net::TcpStream::connect(("127.0.0.1", server_port)).unwrap();
        let client_port = client.local_addr().unwrap().port();
        drop(listener);

        // Only ESTABLISHED sockets remain on either port now.
        assert!(ProcNetReaper::listening_pids(server_port).unwrap().is_empty());
        assert!(ProcNetReaper::listening_pids(client_port).unwrap().is_empty());
    }
}
