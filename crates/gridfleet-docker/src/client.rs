//! Docker Engine API client over hyper.
//!
//! One HTTP/1 connection per request, over the engine's Unix socket or
//! TCP. Unversioned API paths are used so any daemon version answers.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use gridfleet_core::ContainerResourceQuota;
use gridfleet_core::config::DockerConfig;
use http::{Method, Request, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::engine::ContainerEngine;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    ContainerFilters, ContainerInspect, ContainerSummary, CreateContainerParameters,
    CreateContainerResponse, UpdateContainerResponse, VersionInfo,
};

const USER_AGENT: &str = concat!("gridfleet-docker/", env!("CARGO_PKG_VERSION"));
const DEFAULT_TCP_PORT: u16 = 2375;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

/// Docker Engine client.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    endpoint: Endpoint,
    timeout: Duration,
}

impl DockerEngine {
    /// Parse `unix:///path`, `http://host[:port]` or `tcp://host[:port]`.
    pub fn from_uri(uri: &str) -> EngineResult<Self> {
        let endpoint = if let Some(path) = uri.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(EngineError::InvalidEndpoint(uri.to_string()));
            }
            Endpoint::Unix(PathBuf::from(path))
        } else if let Some(rest) = uri
            .strip_prefix("http://")
            .or_else(|| uri.strip_prefix("tcp://"))
        {
            let authority = rest.trim_end_matches('/');
            if authority.is_empty() || authority.contains('/') {
                return Err(EngineError::InvalidEndpoint(uri.to_string()));
            }
            if authority.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
                Endpoint::Tcp(authority.to_string())
            } else {
                Endpoint::Tcp(format!("{authority}:{DEFAULT_TCP_PORT}"))
            }
        } else {
            return Err(EngineError::InvalidEndpoint(uri.to_string()));
        };

        Ok(Self {
            endpoint,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> String {
        match &self.endpoint {
            Endpoint::Unix(path) => format!("unix://{}", path.display()),
            Endpoint::Tcp(authority) => format!("http://{authority}"),
        }
    }

    /// Connect to `socket_uri`, falling back to `fallback_uri` when the
    /// primary endpoint does not answer `GET /version`.
    pub async fn connect(config: &DockerConfig) -> EngineResult<Self> {
        let primary = Self::from_uri(&config.socket_uri)?;
        let primary_error = match primary.version().await {
            Ok(version) => {
                info!(
                    endpoint = %primary.endpoint(),
                    version = %version.version,
                    api_version = %version.api_version,
                    "connected to container engine"
                );
                return Ok(primary);
            }
            Err(e) => e,
        };

        let Some(fallback_uri) = config.fallback_uri.as_deref() else {
            return Err(primary_error);
        };
        warn!(
            endpoint = %primary.endpoint(),
            error = %primary_error,
            fallback = fallback_uri,
            "container engine unreachable, trying fallback"
        );

        let fallback = Self::from_uri(fallback_uri)?;
        let version = fallback.version().await?;
        info!(
            endpoint = %fallback.endpoint(),
            version = %version.version,
            "connected to container engine"
        );
        Ok(fallback)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> EngineResult<(StatusCode, Bytes)> {
        debug!(%method, path, "engine request");
        tokio::time::timeout(self.timeout, self.exchange(method, path, body))
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))?
    }

    async fn exchange(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> EngineResult<(StatusCode, Bytes)> {
        let host = match &self.endpoint {
            Endpoint::Unix(_) => "docker",
            Endpoint::Tcp(authority) => authority.as_str(),
        };
        let req = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, host)
            .header(header::USER_AGENT, USER_AGENT)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))?;

        match &self.endpoint {
            #[cfg(unix)]
            Endpoint::Unix(socket) => {
                let stream = tokio::net::UnixStream::connect(socket).await.map_err(|source| {
                    EngineError::Connect {
                        endpoint: self.endpoint(),
                        source,
                    }
                })?;
                send(stream, req).await
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(EngineError::InvalidEndpoint(self.endpoint())),
            Endpoint::Tcp(authority) => {
                let stream = tokio::net::TcpStream::connect(authority.as_str())
                    .await
                    .map_err(|source| EngineError::Connect {
                        endpoint: self.endpoint(),
                        source,
                    })?;
                send(stream, req).await
            }
        }
    }

    /// Issue a request and require a 2xx answer.
    async fn call(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> EngineResult<Bytes> {
        let (status, bytes) = self.request(method, path, body).await?;
        if status.is_success() {
            Ok(bytes)
        } else {
            Err(api_error(status, &bytes))
        }
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> EngineResult<T> {
        let bytes = self.call(method, path, body).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

async fn send<S>(stream: S, req: Request<Full<Bytes>>) -> EngineResult<(StatusCode, Bytes)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let resp = sender.send_request(req).await?;
    let status = resp.status();
    let body = resp.into_body().collect().await?.to_bytes();
    Ok((status, body))
}

fn api_error(status: StatusCode, body: &[u8]) -> EngineError {
    let message = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
    EngineError::Api {
        status: status.as_u16(),
        message,
    }
}

/// Percent-encode everything outside the unreserved set and `keep`.
fn encode(value: &str, keep: &[u8]) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || b"-._~".contains(&byte) || keep.contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Encode a path segment or query value.
fn component(value: &str) -> String {
    encode(value, b"")
}

impl ContainerEngine for DockerEngine {
    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerInspect> {
        self.call_json(Method::GET, &format!("/containers/{}/json", component(id)), None)
            .await
    }

    async fn image_exists(&self, image: &str, tag: &str) -> EngineResult<bool> {
        let path = format!("/images/{}:{}/json", encode(image, b"/"), component(tag));
        match self.call(Method::GET, &path, None).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn commit_container(&self, container: &str, repository: &str, tag: &str) -> EngineResult<()> {
        let path = format!(
            "/commit?container={}&repo={}&tag={}",
            component(container),
            component(repository),
            component(tag)
        );
        self.call(Method::POST, &path, Some(b"{}".to_vec())).await?;
        Ok(())
    }

    async fn create_container(&self, parameters: &CreateContainerParameters) -> EngineResult<String> {
        let path = format!("/containers/create?name={}", component(&parameters.name));
        let body = serde_json::to_vec(parameters)?;
        let resp: CreateContainerResponse = self.call_json(Method::POST, &path, Some(body)).await?;
        for warning in &resp.warnings {
            warn!(container = %parameters.name, %warning, "engine warning on create");
        }
        Ok(resp.id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        let path = format!("/containers/{}/start", component(id));
        let (status, bytes) = self.request(Method::POST, &path, None).await?;
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            Ok(())
        } else {
            Err(api_error(status, &bytes))
        }
    }

    async fn remove_container(&self, id: &str, remove_volumes: bool) -> EngineResult<()> {
        let path = format!("/containers/{}?v={remove_volumes}", component(id));
        self.call(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> EngineResult<()> {
        self.call(Method::POST, &format!("/containers/{}/kill", component(id)), None)
            .await?;
        Ok(())
    }

    async fn update_container(
        &self,
        id: &str,
        quota: &ContainerResourceQuota,
    ) -> EngineResult<UpdateContainerResponse> {
        let body = serde_json::to_vec(&serde_json::json!({
            "CpuPeriod": quota.cpu_period,
            "CpuQuota": quota.cpu_quota,
            "Memory": quota.memory_bytes,
        }))?;
        self.call_json(
            Method::POST,
            &format!("/containers/{}/update", component(id)),
            Some(body),
        )
        .await
    }

    async fn list_containers(&self, filters: &ContainerFilters) -> EngineResult<Vec<ContainerSummary>> {
        let path = if filters.is_empty() {
            "/containers/json".to_string()
        } else {
            format!("/containers/json?filters={}", component(&filters.to_json()))
        };
        self.call_json(Method::GET, &path, None).await
    }

    async fn version(&self) -> EngineResult<VersionInfo> {
        self.call_json(Method::GET, "/version", None).await
    }
}
