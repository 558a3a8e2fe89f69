use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use coh_core::{ExecAction, HttpGetAction, PortRef, ProbeHandler, ProbeSpec, TcpSocketAction};
use metrics::{counter, histogram};
use serde::Deserialize;
use tokio::net::TcpStream;
use tracing::debug;

use crate::{HealthVerdict, Member, Prober};

/// Runs a command inside a member's container and reports its exit code.
#[async_trait]
pub trait ExecRunner: Send + Sync {
    async fn exec(&self, member: &Member, container: &str, command: &[String]) -> Result<i32, String>;
}

/// Prober speaking HTTP, TCP and exec.
pub struct StatusHaProber {
    http: reqwest::Client,
    exec: Option<Arc<dyn ExecRunner>>,
    container: String,
}

impl StatusHaProber {
    pub fn new(container: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), exec: None, container: container.into() }
    }

    pub fn with_exec(mut self, exec: Arc<dyn ExecRunner>) -> Self {
        self.exec = Some(exec);
        self
    }

    async fn http(&self, member: &Member, action: &HttpGetAction, timeout: Duration) -> HealthVerdict {
        let port = match resolve(&action.port, member) {
            Ok(p) => p,
            Err(v) => return v,
        };
        let host = match action.host.as_deref().or(member.ip.as_deref()) {
            Some(h) => h,
            None => return HealthVerdict::Unknown(format!("member {} has no address", member.name)),
        };
        let scheme = action.scheme.as_deref().unwrap_or("http").to_ascii_lowercase();
        let path = if action.path.starts_with('/') { action.path.clone() } else { format!("/{}", action.path) };
        let url = format!("{scheme}://{host}:{port}{path}");

        let mut req = self.http.get(&url).timeout(timeout);
        for (k, v) in &action.headers {
            req = req.header(k, v);
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => HealthVerdict::Safe,
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                debug!(url = %url, status = %status, "StatusHA endpoint reported unsafe");
                HealthVerdict::Unsafe { endangered: endangered_from_body(&body) }
            }
            Err(e) if e.is_timeout() => HealthVerdict::Unknown(format!("GET {url} timed out")),
            Err(e) => HealthVerdict::Unknown(format!("GET {url} failed: {e}")),
        }
    }

    async fn tcp(&self, member: &Member, action: &TcpSocketAction, timeout: Duration) -> HealthVerdict {
        let port = match resolve(&action.port, member) {
            Ok(p) => p,
            Err(v) => return v,
        };
        let host = match action.host.as_deref().or(member.ip.as_deref()) {
            Some(h) => h.to_string(),
            None => return HealthVerdict::Unknown(format!("member {} has no address", member.name)),
        };
        match tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await {
            Ok(Ok(_)) => HealthVerdict::Safe,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => HealthVerdict::Unsafe { endangered: Vec::new() },
            Ok(Err(e)) => HealthVerdict::Unknown(format!("connect {host}:{port} failed: {e}")),
            Err(_) => HealthVerdict::Unknown(format!("connect {host}:{port} timed out")),
        }
    }

    async fn exec(&self, member: &Member, action: &ExecAction, timeout: Duration) -> HealthVerdict {
        let Some(runner) = self.exec.as_ref() else {
            return HealthVerdict::Unknown("exec probes are not available".to_string());
        };
        match tokio::time::timeout(timeout, runner.exec(member, &self.container, &action.command)).await {
            Ok(Ok(0)) => HealthVerdict::Safe,
            Ok(Ok(code)) => {
                debug!(member = %member.name, code, "exec probe exited non-zero");
                HealthVerdict::Unsafe { endangered: Vec::new() }
            }
            Ok(Err(e)) => HealthVerdict::Unknown(format!("exec failed: {e}")),
            Err(_) => HealthVerdict::Unknown("exec timed out".to_string()),
        }
    }
}

#[async_trait]
impl Prober for StatusHaProber {
    async fn probe(&self, member: &Member, probe: &ProbeSpec) -> HealthVerdict {
        let t0 = Instant::now();
        let timeout = probe.timeout();
        let verdict = match &probe.handler {
            ProbeHandler::HttpGet(a) => self.http(member, a, timeout).await,
            ProbeHandler::TcpSocket(a) => self.tcp(member, a, timeout).await,
            ProbeHandler::Exec(a) => self.exec(member, a, timeout).await,
        };
        histogram!("probe_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &verdict {
            HealthVerdict::Safe => counter!("probe_safe", 1u64),
            HealthVerdict::Unsafe { .. } => counter!("probe_unsafe", 1u64),
            HealthVerdict::Unknown(_) => counter!("probe_unknown", 1u64),
        }
        verdict
    }
}

fn resolve(port: &PortRef, member: &Member) -> Result<u16, HealthVerdict> {
    let n = match port {
        PortRef::Number(n) => *n,
        PortRef::Name(name) => member
            .ports
            .get(name)
            .copied()
            .ok_or_else(|| HealthVerdict::Unknown(format!("member {} has no port named {name}", member.name)))?,
    };
    u16::try_from(n)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| HealthVerdict::Unknown(format!("port {n} is out of range for member {}", member.name)))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EndangeredBody {
    List(Vec<String>),
    Object {
        #[serde(default, alias = "services")]
        endangered: Vec<String>,
    },
}

/// Endangered service names from an optional JSON body; anything else yields none.
pub(crate) fn endangered_from_body(body: &str) -> Vec<String> {
    match serde_json::from_str::<EndangeredBody>(body) {
        Ok(EndangeredBody::List(v)) => v,
        Ok(EndangeredBody::Object { endangered }) => endangered,
        Err(_) => Vec::new(),
    }
}
