use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use crate::error::ControlError;
use crate::node::{NodeDescriptor, NodeId};

/// Header carrying the caller's daemon ID on intra-cluster requests.
pub const HDR_CALLER_ID: &str = "x-silo-caller-id";

/// Health endpoint probed by keepalive sweeps.
pub const PATH_HEALTH: &str = "/v1/health";
/// Metasync receiver.
pub const PATH_METASYNC: &str = "/v1/metasync";
/// Keepalive receiver on the primary.
pub const PATH_CLUSTER_KEEPALIVE: &str = "/v1/cluster/keepalive";
/// Self-join receiver on the primary.
pub const PATH_CLUSTER_SELF_JOIN: &str = "/v1/cluster/self-join";
/// Handshake receiver on an admin-joining node.
pub const PATH_DAEMON_ADMIN_JOIN: &str = "/v1/daemon/admin-join";
/// Prefix of the prepare/commit receiver for primary transitions.
pub const PATH_DAEMON_PROXY: &str = "/v1/daemon/proxy";

/// One intra-cluster request.
#[derive(Debug, Clone)]
pub struct ReqSpec {
    /// HTTP method.
    pub method: Method,
    /// Absolute path on the peer's control endpoint.
    pub path: String,
    /// Optional JSON body.
    pub body: Option<serde_json::Value>,
    /// Per-call budget.
    pub timeout: Duration,
}

impl ReqSpec {
    /// Request with no body.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            timeout,
        }
    }

    /// Attaches a JSON body.
    pub fn with_body<B: Serialize>(mut self, body: &B) -> Result<Self, ControlError> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }
}

/// Response from one peer.
#[derive(Debug, Clone)]
pub struct CallResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw body bytes.
    pub body: Vec<u8>,
}

impl CallResponse {
    /// True for 2xx.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ControlError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Body rendered for logs.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Outcome of a broadcast to one recipient.
#[derive(Debug)]
pub struct BcastResult {
    /// Recipient id.
    pub id: NodeId,
    /// Response when one arrived.
    pub response: Result<CallResponse, ControlError>,
}

/// Shared intra-cluster control client. One instance per daemon; per-call
/// timeouts come from the caller.
#[derive(Clone)]
pub struct ControlClient {
    http: reqwest::Client,
    self_id: NodeId,
}

impl ControlClient {
    /// Builds the client, stamping `self_id` into every request.
    #[must_use]
    pub fn new(self_id: NodeId) -> Self {
        Self {
            http: reqwest::Client::new(),
            self_id,
        }
    }

    /// Issues one request to `si`'s control endpoint.
    pub async fn call(&self, si: &NodeDescriptor, spec: &ReqSpec) -> Result<CallResponse, ControlError> {
        self.call_url(&si.control_net.url(""), &si.id, spec).await
    }

    /// Issues one request against a base URL, for peers not yet present in
    /// the cluster map (initial self-join).
    pub async fn call_url(
        &self,
        base: &str,
        peer: &NodeId,
        spec: &ReqSpec,
    ) -> Result<CallResponse, ControlError> {
        let url = format!("{}{}", base.trim_end_matches('/'), spec.path);
        let mut req = self
            .http
            .request(spec.method.clone(), &url)
            .timeout(spec.timeout)
            .header(HDR_CALLER_ID, self.self_id.as_str());
        if let Some(body) = &spec.body {
            req = req.json(body);
        }
        let resp = req.send().await.map_err(|err| classify(peer, &err))?;
        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .await
            .map_err(|err| classify(peer, &err))?
            .to_vec();
        Ok(CallResponse { status, body })
    }

    /// Health probe; transport failures come back as `Unreachable`, non-2xx
    /// statuses as `Transport`.
    pub async fn health(&self, si: &NodeDescriptor, timeout: Duration) -> Result<(), ControlError> {
        let spec = ReqSpec::new(Method::GET, PATH_HEALTH, timeout);
        let resp = self.call(si, &spec).await?;
        if resp.is_success() {
            return Ok(());
        }
        Err(ControlError::Transport(format!(
            "{}: health returned {}",
            si.id, resp.status
        )))
    }

    /// Fans `spec` out to `nodes` with at most `parallel` in-flight calls,
    /// collecting every per-node outcome.
    pub async fn broadcast(
        &self,
        nodes: Vec<NodeDescriptor>,
        spec: ReqSpec,
        parallel: usize,
    ) -> Vec<BcastResult> {
        let semaphore = Arc::new(Semaphore::new(parallel.max(1)));
        let spec = Arc::new(spec);
        let mut tasks = JoinSet::new();
        for si in nodes {
            let client = self.clone();
            let spec = Arc::clone(&spec);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let response = client.call(&si, &spec).await;
                BcastResult {
                    id: si.id.clone(),
                    response,
                }
            });
        }
        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => warn!("broadcast task panicked: {err}"),
            }
        }
        results
    }
}

fn classify(peer: &NodeId, err: &reqwest::Error) -> ControlError {
    if err.is_connect() || err.is_timeout() {
        return ControlError::Unreachable {
            peer: peer.clone(),
            reason: err.to_string(),
        };
    }
    ControlError::Transport(format!("{peer}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_response_success_window() {
        let resp = CallResponse {
            status: 204,
            body: Vec::new(),
        };
        assert!(resp.is_success());
        let resp = CallResponse {
            status: 409,
            body: b"conflict".to_vec(),
        };
        assert!(!resp.is_success());
        assert_eq!(resp.text(), "conflict");
    }

    #[test]
    fn spec_with_body_serializes() {
        let spec = ReqSpec::new(Method::POST, "/v1/x", Duration::from_secs(1))
            .with_body(&serde_json::json!({"a": 1}))
            .unwrap();
        assert!(spec.body.is_some());
    }
}
