//! HTTP health check.
//!
//! A grid server that answers at all is considered available; whether its
//! body matches the expected text is reported separately.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::tcp::ProbeSettings;

const USER_AGENT: &str = concat!("gridfleet-health/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpProbeResult {
    /// The endpoint answered with an HTTP response.
    pub available: bool,
    /// The response was 2xx and its body equals the expected text.
    pub matched_expected: bool,
    pub status: Option<u16>,
    pub attempts: u32,
}

struct Answer {
    status: http::StatusCode,
    body: String,
}

/// GET `{scheme}://{host}:{port}{path}`, retrying connection-level
/// failures up to `settings.attempts` times.
pub async fn http_probe(settings: &ProbeSettings, port: u16) -> HttpProbeResult {
    let attempts = settings.attempts.max(1);
    let address = format!("{}:{port}", settings.host);
    let uri = format!("{}://{address}{}", settings.scheme, settings.path);

    for attempt in 1..=attempts {
        match tokio::time::timeout(settings.timeout, fetch(&address, &settings.path)).await {
            Ok(Ok(answer)) => {
                let matched = answer.status.is_success() && answer.body == settings.expected_text;
                if matched {
                    info!(%uri, attempts = attempt, "health check passed");
                } else {
                    warn!(
                        %uri,
                        status = answer.status.as_u16(),
                        body = %answer.body,
                        expected = %settings.expected_text,
                        "health check answered with unexpected response"
                    );
                }
                return HttpProbeResult {
                    available: true,
                    matched_expected: matched,
                    status: Some(answer.status.as_u16()),
                    attempts: attempt,
                };
            }
            Ok(Err(e)) => debug!(%uri, attempt, error = %e, "health check failed"),
            Err(_) => debug!(%uri, attempt, "health check timed out"),
        }

        if attempt < attempts {
            tokio::time::sleep(settings.timeout).await;
        }
    }

    warn!(%uri, attempts, "health check never reached the endpoint");
    HttpProbeResult {
        available: false,
        matched_expected: false,
        status: None,
        attempts,
    }
}

type FetchError = Box<dyn std::error::Error + Send + Sync>;

async fn fetch(address: &str, path: &str) -> Result<Answer, FetchError> {
    let stream = TcpStream::connect(address).await?;
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = http::Request::builder()
        .method("GET")
        .uri(path)
        .header("host", address)
        .header("user-agent", USER_AGENT)
        .body(Empty::<Bytes>::new())?;

    let resp = sender.send_request(req).await?;
    let status = resp.status();
    let body = resp.into_body().collect().await?.to_bytes();
    Ok(Answer {
        status,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}
