//! TCP availability probe.

use std::future::Future;
use std::time::Duration;

use gridfleet_core::ConfigError;
use gridfleet_core::config::HealthConfig;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Probe parameters shared by the TCP and HTTP probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSettings {
    pub host: String,
    pub attempts: u32,
    /// Per-attempt timeout, also slept between failed attempts.
    pub timeout: Duration,
    pub scheme: String,
    pub path: String,
    pub expected_text: String,
}

impl ProbeSettings {
    pub fn from_config(config: &HealthConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            host: config.host.clone(),
            attempts: config.attempts.max(1),
            timeout: config.timeout()?,
            scheme: config.scheme.clone(),
            path: config.path.clone(),
            expected_text: config.expected_text.clone(),
        })
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            attempts: 30,
            timeout: Duration::from_secs(1),
            scheme: "http".to_string(),
            path: "/health".to_string(),
            expected_text: "OK".to_string(),
        }
    }
}

/// Result of waiting for an endpoint to accept connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// A connection succeeded on the given attempt.
    Available { attempts: u32 },
    /// Every attempt failed.
    Unavailable { attempts: u32 },
    /// The exit predicate reported the instance gone.
    Exited { attempts: u32 },
}

impl ProbeOutcome {
    pub fn is_available(&self) -> bool {
        matches!(self, ProbeOutcome::Available { .. })
    }
}

/// Wait until `host:port` accepts a TCP connection.
pub async fn wait_for_tcp_available(settings: &ProbeSettings, port: u16) -> ProbeOutcome {
    wait_for_tcp(settings, port, || std::future::ready(false)).await
}

/// Wait until `host:port` accepts a TCP connection, giving up early once
/// `exited` reports the instance has terminated.
pub async fn wait_for_tcp<F, Fut>(settings: &ProbeSettings, port: u16, mut exited: F) -> ProbeOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let host = settings.host.as_str();
    let attempts = settings.attempts.max(1);

    for attempt in 1..=attempts {
        if exited().await {
            warn!(host, port, attempt, "instance exited before accepting connections");
            return ProbeOutcome::Exited { attempts: attempt };
        }

        match tokio::time::timeout(settings.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => {
                info!(host, port, attempts = attempt, "endpoint accepting connections");
                return ProbeOutcome::Available { attempts: attempt };
            }
            Ok(Err(e)) => debug!(host, port, attempt, error = %e, "tcp probe failed"),
            Err(_) => debug!(host, port, attempt, "tcp probe timed out"),
        }

        if attempt < attempts {
            tokio::time::sleep(settings.timeout).await;
        }
    }

    warn!(host, port, attempts, "endpoint never became available");
    ProbeOutcome::Unavailable { attempts }
}
