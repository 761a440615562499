//! HTTP client for a single TN agent.
//!
//! Every call maps onto one route of the agent API. Non-2xx responses are
//! surfaced as [`ManagerError::AgentResponse`] carrying the agent's
//! `{"error": ...}` message; transport failures become classified
//! [`TnError::Network`] or [`TnError::Timeout`] errors. Read-only calls
//! (health excluded) are retried with backoff, mutating calls never are.

use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument};

use tn_shared::errors::{ManagerError, ManagerResult};
use tn_shared::retry::{RetryPolicy, retry_async};
use tn_shared::{PerformanceMetrics, PerformanceTestConfig, TnConfig, TnError, TnStatus};

/// Default timeout for a single agent request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of `GET /health`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentHealth {
    pub healthy: bool,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub cluster: String,
}

/// Client bound to one agent endpoint such as `http://10.0.0.1:8080`
#[derive(Debug, Clone)]
pub struct AgentClient {
    cluster: String,
    base: Url,
    http: Client,
    timeout: Duration,
    read_retry: RetryPolicy,
}

impl AgentClient {
    pub fn new(cluster: &str, endpoint: &str, timeout: Duration) -> ManagerResult<Self> {
        let base = parse_endpoint(endpoint)?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TnError::network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            cluster: cluster.to_string(),
            base,
            http,
            timeout,
            read_retry: RetryPolicy::default(),
        })
    }

    pub fn with_read_retry(mut self, policy: RetryPolicy) -> Self {
        self.read_retry = policy;
        self
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn endpoint(&self) -> &Url {
        &self.base
    }

    /// `GET /health`. Only a 200 counts as healthy; the agent answers 503
    /// with the same body while it is starting or degraded.
    #[instrument(skip(self), fields(cluster = %self.cluster))]
    pub async fn health(&self) -> ManagerResult<AgentHealth> {
        let response = self.send(self.http.get(self.url("health")?), "health").await?;
        if response.status() != StatusCode::OK {
            return Err(ManagerError::AgentUnhealthy {
                cluster: self.cluster.clone(),
                message: format!("health endpoint returned HTTP {}", response.status().as_u16()),
            });
        }
        let health: AgentHealth = self.decode(response).await?;
        if !health.healthy {
            return Err(ManagerError::AgentUnhealthy {
                cluster: self.cluster.clone(),
                message: "agent reports unhealthy".to_string(),
            });
        }
        Ok(health)
    }

    #[instrument(skip(self), fields(cluster = %self.cluster))]
    pub async fn status(&self) -> ManagerResult<TnStatus> {
        retry_async(|| self.get_json("status"), self.read_retry, "agent status").await
    }

    /// Raw `GET /metrics` document of the agent.
    #[instrument(skip(self), fields(cluster = %self.cluster))]
    pub async fn metrics(&self) -> ManagerResult<Value> {
        retry_async(|| self.get_json("metrics"), self.read_retry, "agent metrics").await
    }

    #[instrument(skip(self, config), fields(cluster = %self.cluster))]
    pub async fn configure_slice(&self, slice_id: &str, config: &TnConfig) -> ManagerResult<()> {
        let url = self.url(&format!("slices/{}", slice_id))?;
        let response = self
            .send(self.http.post(url).json(config), "configure slice")
            .await?;
        self.check(response).await?;
        debug!("Slice {} configured on {}", slice_id, self.cluster);
        Ok(())
    }

    #[instrument(skip(self), fields(cluster = %self.cluster))]
    pub async fn delete_slice(&self, slice_id: &str) -> ManagerResult<()> {
        let url = self.url(&format!("slices/{}", slice_id))?;
        let response = self.send(self.http.delete(url), "delete slice").await?;
        self.check(response).await?;
        Ok(())
    }

    /// `POST /tests`. The request timeout is stretched to cover the test
    /// duration, since the agent answers only once the run completes.
    #[instrument(skip(self, config), fields(cluster = %self.cluster, test_id = %config.test_id))]
    pub async fn run_performance_test(
        &self,
        config: &PerformanceTestConfig,
    ) -> ManagerResult<PerformanceMetrics> {
        // throughput runs three directions back to back
        let budget = self.timeout + config.duration * 4;
        let request = self.http.post(self.url("tests")?).json(config).timeout(budget);
        let response = self.send(request, "performance test").await?;
        let response = self.check(response).await?;
        self.decode(response).await
    }

    /// `POST /vxlan/connectivity`: peer address to reachability.
    #[instrument(skip(self), fields(cluster = %self.cluster))]
    pub async fn test_connectivity(&self) -> ManagerResult<BTreeMap<String, bool>> {
        #[derive(Deserialize)]
        struct Body {
            connectivity: BTreeMap<String, bool>,
        }
        let response = self
            .send(self.http.post(self.url("vxlan/connectivity")?), "connectivity test")
            .await?;
        let response = self.check(response).await?;
        let body: Body = self.decode(response).await?;
        Ok(body.connectivity)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ManagerResult<T> {
        let response = self.send(self.http.get(self.url(path)?), path).await?;
        let response = self.check(response).await?;
        self.decode(response).await
    }

    fn url(&self, path: &str) -> ManagerResult<Url> {
        self.base
            .join(path)
            .map_err(|e| TnError::validation("endpoint", format!("cannot build URL for '{}': {}", path, e)).into())
    }

    async fn send(&self, request: reqwest::RequestBuilder, operation: &str) -> ManagerResult<Response> {
        request
            .send()
            .await
            .map_err(|e| transport_error(&e, operation, self.timeout).into())
    }

    /// Turn a non-2xx response into [`ManagerError::AgentResponse`].
    async fn check(&self, response: Response) -> ManagerResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(body);
        Err(ManagerError::AgentResponse {
            cluster: self.cluster.clone(),
            status: status.as_u16(),
            message,
        })
    }

    async fn decode<T: DeserializeOwned>(&self, response: Response) -> ManagerResult<T> {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(&e, "read response", self.timeout))?;
        Ok(serde_json::from_slice(&bytes).map_err(TnError::from)?)
    }
}

/// Parse an agent endpoint. Only `http` and `https` are accepted; a
/// trailing slash is added so relative joins keep any path prefix.
pub fn parse_endpoint(endpoint: &str) -> ManagerResult<Url> {
    let mut url = Url::parse(endpoint.trim())
        .map_err(|e| TnError::validation("endpoint", format!("'{}' is not a URL: {}", endpoint, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(TnError::validation("endpoint", format!("unsupported scheme '{}'", url.scheme())).into());
    }
    if url.host_str().is_none() {
        return Err(TnError::validation("endpoint", format!("'{}' has no host", endpoint)).into());
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Host part of an endpoint, used as the cluster's overlay address when
/// none is registered explicitly.
pub fn endpoint_host(endpoint: &Url) -> Option<String> {
    let host = endpoint.host_str()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host == "localhost" {
        return Some("127.0.0.1".to_string());
    }
    Some(host.to_string())
}

fn transport_error(err: &reqwest::Error, operation: &str, timeout: Duration) -> TnError {
    if err.is_timeout() {
        return TnError::Timeout {
            operation: operation.to_string(),
            secs: timeout.as_secs(),
        };
    }
    // reqwest's top-level message hides the OS error; walk the chain
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    TnError::network(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint_normalizes_trailing_slash() {
        let url = parse_endpoint("http://10.0.0.1:8080").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.1:8080/");
        assert_eq!(url.join("slices/s1").unwrap().as_str(), "http://10.0.0.1:8080/slices/s1");

        let url = parse_endpoint("https://tn.example.org/agents/edge01").unwrap();
        assert_eq!(
            url.join("health").unwrap().as_str(),
            "https://tn.example.org/agents/edge01/health"
        );
    }

    #[test]
    fn test_parse_endpoint_rejects_bad_input() {
        for bad in ["", "10.0.0.1:8080", "ftp://10.0.0.1/", "not a url"] {
            assert!(parse_endpoint(bad).is_err(), "{} accepted", bad);
        }
    }

    #[test]
    fn test_endpoint_host() {
        let host = |s: &str| endpoint_host(&parse_endpoint(s).unwrap());
        assert_eq!(host("http://192.168.1.100:8080"), Some("192.168.1.100".to_string()));
        assert_eq!(host("http://localhost:8080"), Some("127.0.0.1".to_string()));
        assert_eq!(host("http://[fd00::1]:8080"), Some("fd00::1".to_string()));
        assert_eq!(host("http://edge01.tn.local"), Some("edge01.tn.local".to_string()));
    }

    #[tokio::test]
    async fn test_refused_connection_is_classified() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = AgentClient::new("edge01", &format!("http://127.0.0.1:{}", port), Duration::from_secs(2))
            .unwrap()
            .with_read_retry(RetryPolicy::none());

        let err = client.status().await.unwrap_err();
        match err {
            ManagerError::Common(inner) => {
                assert_eq!(inner.network_kind(), Some(tn_shared::NetworkErrorKind::ConnectionRefused))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
