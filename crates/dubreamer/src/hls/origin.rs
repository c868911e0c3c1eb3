// Upstream access. The pipeline only ever talks to an `Origin`, so tests can
// serve playlists and segments from memory.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use rustls::ClientConfig;
use rustls::crypto::aws_lc_rs;
use rustls_platform_verifier::BuilderVerifierExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;
use url::Url;

use crate::error::RelayError;

const USER_AGENT: &str = concat!("dubreamer/", env!("CARGO_PKG_VERSION"));

/// What kind of resource is being requested; used in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    Playlist,
    Segment,
}

impl FetchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchKind::Playlist => "playlist",
            FetchKind::Segment => "segment",
        }
    }
}

#[async_trait]
pub trait Origin: Send + Sync {
    /// Fetch one resource. A single attempt: retries are the caller's concern.
    async fn fetch(&self, url: &Url, kind: FetchKind, timeout: Duration)
    -> Result<Bytes, RelayError>;
}

/// [`Origin`] backed by a shared reqwest client.
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    client: Client,
}

impl HttpOrigin {
    pub fn new() -> Result<Self, RelayError> {
        let provider = Arc::new(aws_lc_rs::default_provider());
        let tls_config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| RelayError::internal(format!("TLS protocol setup failed: {e}")))?
            .with_platform_verifier()
            .map_err(|e| RelayError::internal(format!("TLS verifier setup failed: {e}")))?
            .with_no_client_auth();

        let client = Client::builder()
            .use_preconfigured_tls(tls_config)
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RelayError::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn fetch(
        &self,
        url: &Url,
        kind: FetchKind,
        timeout: Duration,
    ) -> Result<Bytes, RelayError> {
        let network_err = |e: reqwest::Error| transport_error(url, timeout, e);

        let response = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(network_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::http_status(status, url.as_str(), kind.as_str()));
        }

        let bytes = response.bytes().await.map_err(network_err)?;
        trace!(url = %url, kind = kind.as_str(), bytes = bytes.len(), "Fetched");
        Ok(bytes)
    }
}

/// Map a reqwest failure that produced no usable response.
///
/// Connection, timeout and mid-body failures are worth another attempt.
/// Redirect loops and requests reqwest refused to build are not.
fn transport_error(url: &Url, timeout: Duration, e: reqwest::Error) -> RelayError {
    if e.is_timeout() {
        return RelayError::Timeout {
            url: url.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };
    }
    let retryable = if e.is_builder() || e.is_redirect() {
        false
    } else if let Some(status) = e.status() {
        status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    } else {
        e.is_connect() || e.is_request() || e.is_body() || e.is_decode()
    };
    RelayError::Network {
        url: url.to_string(),
        retryable,
        source: e,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn refused_connection_is_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let origin = HttpOrigin::new().unwrap();
        let url = Url::parse(&format!("http://{addr}/index.m3u8")).unwrap();
        let err = origin
            .fetch(&url, FetchKind::Playlist, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Network { .. }), "{err}");
        assert!(err.is_retryable());
    }
}
