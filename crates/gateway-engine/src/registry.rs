//! Registry of connected worker nodes and the single `invoke` RPC.
//!
//! The transport that feeds node connections is external: each connection
//! registers an `mpsc` request channel here, and the transport side is
//! responsible for forwarding [`NodeRpc`]s over the wire and resolving the
//! reply channel with the node's single response.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

/// Resources advertised by a connected node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResources {
    /// GPUs available on the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_count: Option<u32>,
    /// GPU model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_type: Option<String>,
    /// Per-GPU memory in GB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_mem_gb: Option<u32>,
    /// CPU cores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u32>,
    /// RAM in GB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_gb: Option<u32>,
}

/// A connected node as seen by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSession {
    /// Stable node identifier.
    pub node_id: String,
    /// Identifier of this particular connection.
    pub conn_id: String,
    /// Commands the node declares it can execute.
    #[serde(default)]
    pub declared_commands: Vec<String>,
    /// Free-form capability tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caps: Vec<String>,
    /// Advertised resources.
    #[serde(default)]
    pub resources: NodeResources,
    /// Connection time.
    pub connected_at_ms: i64,
}

/// One request forwarded to a node's connection task.
///
/// The `idempotency_key` travels with the request so a redelivered request
/// is recognized and not re-executed by the worker's idempotency cache.
#[derive(Debug)]
pub struct NodeRpc {
    /// RPC method name.
    pub command: String,
    /// Method parameters.
    pub params: Value,
    /// Dedup key for at-least-once delivery.
    pub idempotency_key: String,
    /// Resolved with the node's single response.
    pub reply: oneshot::Sender<Value>,
}

/// Parameters of [`NodeRegistry::invoke`].
#[derive(Debug)]
pub struct InvokeRequest {
    /// Target node.
    pub node_id: String,
    /// RPC method name.
    pub command: String,
    /// Method parameters.
    pub params: Value,
    /// Round-trip deadline.
    pub timeout_ms: u64,
    /// Dedup key propagated to the worker.
    pub idempotency_key: String,
}

/// Failure class of an `invoke`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvokeErrorCode {
    /// No response within the deadline.
    #[error("TIMEOUT")]
    Timeout,
    /// The node is not connected, or disconnected mid-call.
    #[error("UNAVAILABLE")]
    Unavailable,
    /// The gateway failed internally.
    #[error("INTERNAL")]
    Internal,
}

/// Structured `invoke` failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeError {
    /// Failure class.
    pub code: InvokeErrorCode,
    /// Human-readable detail.
    pub message: String,
}

/// Result of an `invoke`; never an `Err`, failures are carried inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeOutcome {
    /// Whether a response was received.
    pub ok: bool,
    /// The node's response payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Failure detail, when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<InvokeError>,
}

impl InvokeOutcome {
    fn success(payload: Value) -> Self {
        Self {
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    fn failure(code: InvokeErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            payload: None,
            error: Some(InvokeError {
                code,
                message: message.into(),
            }),
        }
    }
}

struct NodeHandle {
    session: NodeSession,
    tx: mpsc::Sender<NodeRpc>,
}

/// Tracks connected nodes and executes single-response RPCs against them.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: Mutex<HashMap<String, NodeHandle>>,
}

impl NodeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. A newer connection for the same `node_id`
    /// replaces the previous one; in-flight invokes against the old
    /// connection resolve `UNAVAILABLE` when its channel closes.
    pub fn connect(&self, session: NodeSession, tx: mpsc::Sender<NodeRpc>) {
        let mut nodes = self.nodes.lock().expect("node registry poisoned");
        if let Some(prev) = nodes.insert(session.node_id.clone(), NodeHandle { session, tx }) {
            tracing::info!(
                "node {} reconnected, replacing conn {}",
                prev.session.node_id,
                prev.session.conn_id
            );
        }
    }

    /// Remove the connection with the given `conn_id`, if still current.
    pub fn disconnect(&self, conn_id: &str) {
        let mut nodes = self.nodes.lock().expect("node registry poisoned");
        nodes.retain(|_, handle| handle.session.conn_id != conn_id);
    }

    /// Connected nodes at call time.
    pub fn list_connected(&self) -> Vec<NodeSession> {
        let nodes = self.nodes.lock().expect("node registry poisoned");
        let mut sessions: Vec<NodeSession> =
            nodes.values().map(|h| h.session.clone()).collect();
        sessions.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        sessions
    }

    /// Send a request to the named node and await its single response
    /// within `timeout_ms`. The response is delivered to exactly this call.
    pub async fn invoke(&self, req: InvokeRequest) -> InvokeOutcome {
        let tx = {
            let nodes = self.nodes.lock().expect("node registry poisoned");
            nodes.get(&req.node_id).map(|h| h.tx.clone())
        };
        let Some(tx) = tx else {
            return InvokeOutcome::failure(
                InvokeErrorCode::Unavailable,
                format!("node {} is not connected", req.node_id),
            );
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let rpc = NodeRpc {
            command: req.command,
            params: req.params,
            idempotency_key: req.idempotency_key,
            reply: reply_tx,
        };
        if tx.send(rpc).await.is_err() {
            return InvokeOutcome::failure(
                InvokeErrorCode::Unavailable,
                format!("connection to node {} is closed", req.node_id),
            );
        }

        match tokio::time::timeout(Duration::from_millis(req.timeout_ms), reply_rx).await {
            Ok(Ok(payload)) => InvokeOutcome::success(payload),
            Ok(Err(_)) => InvokeOutcome::failure(
                InvokeErrorCode::Unavailable,
                format!("node {} disconnected before replying", req.node_id),
            ),
            Err(_) => InvokeOutcome::failure(
                InvokeErrorCode::Timeout,
                format!("no response from node {} within {}ms", req.node_id, req.timeout_ms),
            ),
        }
    }
}
