//! Health supervision contract
//!
//! The image only declares the liveness probe. Scheduling the probe and
//! acting on its result (restart, stop routing) is the orchestrator's job.
//! [`probe_once`] performs a single attempt the same way the declared
//! command does, for local use and for image verification.

use anyhow::{Context, Result};
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::header::USER_AGENT;
use hyper::{Request, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Serialize, Serializer};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::HealthConfig;
use crate::launch::PortBinding;


/// Declarative liveness probe metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthProbe {
    pub path: String,
    pub port: PortBinding,
    /// Time between attempts
    #[serde(serialize_with = "serialize_duration")]
    pub interval: Duration,
    /// Max time a single attempt may take
    #[serde(serialize_with = "serialize_duration")]
    pub timeout: Duration,
    /// Grace window after start during which failures are not counted
    #[serde(serialize_with = "serialize_duration")]
    pub start_period: Duration,
    /// Consecutive failures after the grace window before the container is unhealthy
    pub retries: u32,
}

impl HealthProbe {
    pub fn from_config(config: &HealthConfig, port: PortBinding) -> Result<Self> {
        if !config.path.starts_with('/') {
            anyhow::bail!("Liveness path must start with '/': {:?}", config.path);
        }
        if config.timeout_secs == 0 || config.interval_secs == 0 {
            anyhow::bail!("Health check interval and timeout must be greater than zero");
        }
        if config.retries == 0 {
            anyhow::bail!("Health check retries must be at least 1");
        }

        Ok(Self {
            path: config.path.clone(),
            port,
            interval: Duration::from_secs(config.interval_secs),
            timeout: Duration::from_secs(config.timeout_secs),
            start_period: Duration::from_secs(config.start_period_secs),
            retries: config.retries,
        })
    }

    /// Options of the HEALTHCHECK instruction
    pub fn options(&self) -> String {
        format!(
            "--interval={} --timeout={} --start-period={} --retries={}",
            format_duration(self.interval),
            format_duration(self.timeout),
            format_duration(self.start_period),
            self.retries
        )
    }

    /// Shell command run inside the container. Shell form so an
    /// env-resolved port is expanded when the probe runs.
    pub fn test_command(&self) -> String {
        format!(
            "curl -f http://localhost:{}{} || exit 1",
            self.port.shell_expr(),
            self.path
        )
    }

    /// The complete HEALTHCHECK line
    pub fn instruction(&self) -> String {
        format!("HEALTHCHECK {} CMD {}", self.options(), self.test_command())
    }

    pub fn url(&self, host: &str, port: u16) -> String {
        format!("http://{}:{}{}", host, port, self.path)
    }
}

/// Result of a single probe attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum ProbeOutcome {
    Healthy { status: u16 },
    Unhealthy { status: u16 },
    Unreachable { reason: String },
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy { .. })
    }
}

/// Issue one GET against `url`. Any status below 400 counts as healthy.
pub async fn probe_once(url: &str, timeout: Duration) -> Result<ProbeOutcome> {
    let uri: Uri = url
        .parse()
        .with_context(|| format!("Invalid probe URL: {}", url))?;

    let client: Client<_, Empty<Bytes>> =
        Client::builder(TokioExecutor::new()).build(HttpsConnector::new());
    let request = Request::get(uri)
        .header(USER_AGENT, concat!("stagehand/", env!("CARGO_PKG_VERSION")))
        .body(Empty::new())
        .context("Failed to build probe request")?;

    debug!("Probing {} (timeout {})", url, format_duration(timeout));
    let outcome = match tokio::time::timeout(timeout, client.request(request)).await {
        Err(_) => ProbeOutcome::Unreachable {
            reason: format!("timed out after {}", format_duration(timeout)),
        },
        Ok(Err(e)) => ProbeOutcome::Unreachable {
            reason: e.to_string(),
        },
        Ok(Ok(response)) => {
            let status = response.status().as_u16();
            if status < 400 {
                ProbeOutcome::Healthy { status }
            } else {
                ProbeOutcome::Unhealthy { status }
            }
        }
    };

    Ok(outcome)
}

/// Poll until the endpoint is healthy or the start period (plus one timeout)
/// has elapsed. Returns the last outcome and the time it took.
pub async fn wait_until_healthy(url: &str, probe: &HealthProbe) -> Result<(ProbeOutcome, Duration)> {
    let started = Instant::now();
    let deadline = probe.start_period + probe.timeout;

    loop {
        let outcome = probe_once(url, probe.timeout).await?;
        let elapsed = started.elapsed();
        if outcome.is_healthy() || elapsed >= deadline {
            return Ok((outcome, elapsed));
        }
        debug!("Not healthy yet after {:?}: {:?}", elapsed, outcome);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Go-style duration as accepted by Docker (`30s`, `1m30s`, `500ms`)
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis % 1000 != 0 {
        return format!("{}ms", millis);
    }

    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, secs % 3600 / 60, secs % 60);
    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if seconds > 0 {
        out.push_str(&format!("{}s", seconds));
    }
    out
}

fn serialize_duration<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_duration(*duration))
}
