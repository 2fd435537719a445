use std::{io::ErrorKind, time::Duration};

use tandem_process::ServiceKind;
use tokio::net::TcpListener;

use crate::error::HostError;
use crate::reaper::ProcessReaper;

const PROBE_HOST: &str = "127.0.0.1";

/// Decides which candidate port a service gets, reclaiming ports still held
/// by a previous instance of the same service.
pub struct PortLocator<R> {
    reaper: R,
    client: reqwest::Client,
    settle_delay: Duration,
    backend_probe_path: String,
    frontend_probe_path: String,
}

impl<R: ProcessReaper> PortLocator<R> {
    pub fn new(
        reaper: R,
        probe_timeout: Duration,
        settle_delay: Duration,
        backend_probe_path: impl Into<String>,
        frontend_probe_path: impl Into<String>,
    ) -> Result<Self, HostError> {
        // Probes target loopback only: never via a proxy, never follow
        // redirects, never keep a pooled connection pinned to a port we may
        // be about to reclaim.
        let client = reqwest::Client::builder()
            .user_agent(concat!("tandem-host/", env!("CARGO_PKG_VERSION")))
            .timeout(probe_timeout)
            .connect_timeout(probe_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(0)
            .no_proxy()
            .build()?;

        Ok(Self {
            reaper,
            client,
            settle_delay,
            backend_probe_path: backend_probe_path.into(),
            frontend_probe_path: frontend_probe_path.into(),
        })
    }

    pub fn probe_path(&self, kind: ServiceKind) -> &str {
        match kind {
            ServiceKind::Backend => &self.backend_probe_path,
            ServiceKind::Frontend => &self.frontend_probe_path,
        }
    }

    /// True when nothing is listening on `port` right now.
    ///
    /// Both the wildcard and the loopback address are tried: services bind one
    /// or the other and some platforms let the two coexist.
    pub async fn is_available(&self, port: u16) -> bool {
        if port == 0 {
            return false;
        }
        for host in ["0.0.0.0", PROBE_HOST] {
            match TcpListener::bind((host, port)).await {
                Ok(l) => drop(l),
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    tracing::debug!(port, host, "port in use");
                    return false;
                }
                Err(e) => {
                    tracing::debug!(port, host, error = %e, "bind check failed");
                    return false;
                }
            }
        }
        true
    }

    /// True only if `port` answers the kind's health path with one of the
    /// kind's expected statuses before the probe timeout.
    pub async fn probe_stale_service(&self, port: u16, kind: ServiceKind) -> bool {
        let url = format!("http://{PROBE_HOST}:{port}{}", self.probe_path(kind));
        match self.client.get(&url).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let healthy = kind.healthy_statuses().contains(&status);
                tracing::debug!(%kind, port, status, healthy, "probe answered");
                healthy
            }
            Err(e) => {
                tracing::debug!(%kind, port, error = %e, "probe failed");
                false
            }
        }
    }

    /// First candidate that already hosts a healthy instance of `kind`.
    pub async fn find_running_instance(
        &self,
        candidates: &[u16],
        kind: ServiceKind,
    ) -> Option<u16> {
        for &port in candidates {
            if self.probe_stale_service(port, kind).await {
                return Some(port);
            }
        }
        None
    }

    /// Picks the first free candidate in order.
    ///
    /// Only the primary candidate is checked for a stale instance; if one is
    /// found its owner is killed and, when something was actually killed, the
    /// port gets `settle_delay` to be released.
    pub async fn find_available_port(
        &self,
        candidates: &[u16],
        kind: ServiceKind,
    ) -> Result<u16, HostError> {
        if let Some(&primary) = candidates.first()
            && self.probe_stale_service(primary, kind).await
        {
            tracing::info!(%kind, port = primary, "stale instance holds primary port, reclaiming");
            match self.reaper.kill_owner_of_port(primary).await {
                // Give the kernel time to release the killed owner's socket.
                Ok(true) => tokio::time::sleep(self.settle_delay).await,
                Ok(false) => tracing::info!(%kind, port = primary, "nothing to reclaim"),
                Err(e) => tracing::warn!(%kind, port = primary, error = %e, "reclaim failed"),
            }
        }

        for &port in candidates {
            if self.is_available(port).await {
                tracing::info!(%kind, port, "selected port");
                return Ok(port);
            }
        }

        Err(HostError::PortExhausted {
            kind,
            candidates: candidates.to_vec(),
        })
    }
}
