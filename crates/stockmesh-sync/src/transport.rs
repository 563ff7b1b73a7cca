//! # Mesh Transport
//!
//! HTTP client for one peer endpoint.
//!
//! ## Request Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        One Mesh Request                                 │
//! │                                                                         │
//! │  build request ──► X-Instance-ID + Bearer <fresh mesh token>           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  send (IPv4 socket, connect 5s, route timeout)                         │
//! │       │                                                                 │
//! │       ├── 2xx ─────────────────────────────────► decode JSON            │
//! │       ├── 4xx ─────────────────────────────────► fail, no retry         │
//! │       └── 5xx / timeout / refused ──► backoff ──► retry (≤ max_retries) │
//! │                                                                         │
//! │  BACKOFF (exponential)                                                 │
//! │  Attempt 1: 500ms                                                       │
//! │  Attempt 2: 1s                                                          │
//! │  Attempt 3: 2s                                                          │
//! │  Max: 30s                                                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! On dual-stack hosts with broken IPv6 routing, connecting to a hostname
//! can stall on the AAAA address. Binding the local socket to `0.0.0.0`
//! forces the IPv4 family for that route.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::de::DeserializeOwned;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::auth::MeshAuth;
use crate::config::{RouteConfig, TransportSettings};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    HandshakeResponse, MerkleRequest, MerkleResponse, NegotiateRequest, NegotiateResponse,
    NodeInfo, PullRequest, PullResponse, PushRequest, PushResponse, RelayAckRequest,
    RelayAckResponse, RelayPullRequest, RelayPullResponse, RelayPushRequest, RelayPushResponse,
    TriggerRequest, TriggerResponse, INSTANCE_HEADER,
};

/// Client-side settings for one endpoint.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub force_ipv4: bool,
    /// Total attempts per request (1 = no retry).
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            force_ipv4: true,
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    pub fn for_route(route: &RouteConfig, settings: &TransportSettings) -> Self {
        TransportConfig {
            timeout: route.timeout(),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            force_ipv4: route.force_ipv4,
            max_retries: settings.max_retries.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_secs(settings.max_backoff_secs),
        }
    }
}

// =============================================================================
// Mesh Transport
// =============================================================================

/// Authenticated JSON client for one peer (or relay) base URL.
#[derive(Clone)]
pub struct MeshTransport {
    base: Url,
    client: reqwest::Client,
    auth: Arc<MeshAuth>,
    config: TransportConfig,
}

impl std::fmt::Debug for MeshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshTransport")
            .field("base", &self.base.as_str())
            .field("force_ipv4", &self.config.force_ipv4)
            .finish()
    }
}

impl MeshTransport {
    pub fn new(base_url: &str, auth: Arc<MeshAuth>, config: TransportConfig) -> SyncResult<Self> {
        let base = normalize_base(base_url)?;

        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .user_agent(concat!("stockmesh/", env!("CARGO_PKG_VERSION")));
        if config.force_ipv4 {
            builder = builder.local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        }
        let client = builder
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("Failed to build HTTP client: {}", e)))?;

        Ok(MeshTransport {
            base,
            client,
            auth,
            config,
        })
    }

    pub fn for_route(route: &RouteConfig, auth: Arc<MeshAuth>, settings: &TransportSettings) -> SyncResult<Self> {
        Self::new(&route.url, auth, TransportConfig::for_route(route, settings))
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    // =========================================================================
    // Mesh Endpoints
    // =========================================================================

    pub async fn handshake(&self, me: &NodeInfo) -> SyncResult<HandshakeResponse> {
        self.post("mesh/handshake", me).await
    }

    pub async fn nodes(&self) -> SyncResult<Vec<NodeInfo>> {
        let url = self.url("api/mesh/nodes")?;
        self.execute("nodes", || self.client.get(url.clone())).await
    }

    pub async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.post("api/mesh/pull", request).await
    }

    pub async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.post("api/mesh/push", request).await
    }

    pub async fn negotiate(&self, request: &NegotiateRequest) -> SyncResult<NegotiateResponse> {
        self.post("api/mesh/negotiate", request).await
    }

    pub async fn merkle(&self, request: &MerkleRequest) -> SyncResult<MerkleResponse> {
        self.post("api/mesh/merkle", request).await
    }

    pub async fn trigger(&self, request: &TriggerRequest) -> SyncResult<TriggerResponse> {
        self.post("api/mesh/trigger", request).await
    }

    /// Liveness check without retries.
    pub async fn health(&self) -> bool {
        let Ok(url) = self.url("health") else {
            return false;
        };
        match self.client.get(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(base = %self.base, error = %e, "Health check failed");
                false
            }
        }
    }

    // =========================================================================
    // Relay Endpoints
    // =========================================================================

    pub async fn relay_push(&self, request: &RelayPushRequest) -> SyncResult<RelayPushResponse> {
        self.post("api/relay/push", request).await
    }

    pub async fn relay_pull(&self, limit: Option<i64>) -> SyncResult<RelayPullResponse> {
        self.post("api/relay/pull", &RelayPullRequest { limit }).await
    }

    pub async fn relay_ack(&self, ids: Vec<String>) -> SyncResult<RelayAckResponse> {
        self.post("api/relay/ack", &RelayAckRequest { ids }).await
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    fn url(&self, path: &str) -> SyncResult<Url> {
        Ok(self.base.join(path)?)
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> SyncResult<T>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path)?;
        self.execute(path, || self.client.post(url.clone()).json(body)).await
    }

    /// Sends with auth headers, retrying retryable failures with backoff.
    async fn execute<T, F>(&self, what: &str, build: F) -> SyncResult<T>
    where
        T: DeserializeOwned,
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut backoff = self.create_backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.send_once(build()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let Some(delay) = backoff.next_backoff() else {
                        return Err(e);
                    };
                    warn!(
                        base = %self.base,
                        request = %what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Mesh request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> SyncResult<T> {
        let token = self.auth.issue_token()?;
        let response = request
            .header(INSTANCE_HEADER, self.auth.instance_id())
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<T>().await?)
    }

    /// Creates the exponential backoff configuration.
    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: Some(self.config.timeout * self.config.max_retries.max(1)),
            ..Default::default()
        }
    }
}

/// Parses a base URL and makes sure relative joins append to its path.
fn normalize_base(raw: &str) -> SyncResult<Url> {
    let mut url = Url::parse(raw.trim())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SyncError::InvalidUrl(format!("unsupported scheme in {}", raw)));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stockmesh_core::NodeRole;

    fn auth() -> Arc<MeshAuth> {
        Arc::new(MeshAuth::new(
            "secret",
            NodeInfo {
                instance_id: "nodeA".into(),
                role: NodeRole::Peer,
                base_url: None,
                weight: 50,
                is_online: true,
                last_seen: Utc::now(),
            },
        ))
    }

    #[test]
    fn test_normalize_base() {
        assert_eq!(normalize_base("http://10.0.0.1:8080").unwrap().as_str(), "http://10.0.0.1:8080/");
        assert_eq!(
            normalize_base("https://hq.example.com/mesh").unwrap().as_str(),
            "https://hq.example.com/mesh/"
        );
        assert!(normalize_base("ftp://x").is_err());
        assert!(normalize_base("not a url").is_err());
    }

    #[test]
    fn test_joined_paths_keep_prefix() {
        let transport =
            MeshTransport::new("https://hq.example.com/mesh", auth(), TransportConfig::default()).unwrap();
        assert_eq!(
            transport.url("api/mesh/pull").unwrap().as_str(),
            "https://hq.example.com/mesh/api/mesh/pull"
        );
    }

    #[test]
    fn test_config_from_route() {
        let route = RouteConfig::new("http://10.0.0.1:8080", stockmesh_core::RouteType::Web, 15, 2);
        let config = TransportConfig::for_route(&route, &TransportSettings::default());
        assert_eq!(config.timeout, Duration::from_secs(15));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert!(config.force_ipv4);
        assert_eq!(config.max_retries, 3);
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_retryable() {
        let config = TransportConfig {
            timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_millis(200),
            max_retries: 1,
            ..TransportConfig::default()
        };
        // Port 9 on loopback: nothing listens there.
        let transport = MeshTransport::new("http://127.0.0.1:9", auth(), config).unwrap();
        let err = transport.pull(&PullRequest::default()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!transport.health().await);
    }
}
