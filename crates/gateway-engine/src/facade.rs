//! In-process gateway facade.
//!
//! Answers the same RPC surface an external gateway call would, but
//! dispatches locally: GPU job methods route to the scheduler, node
//! methods to the registry. Transport serialization is bypassed; payload
//! shapes still match the gateway schema.

use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::api::{GpuJobRequest, SubmitError};
use crate::registry::{InvokeRequest, NodeRegistry};
use crate::scheduler::GpuScheduler;

const DEFAULT_INVOKE_TIMEOUT_MS: u64 = 30_000;

/// Error of a facade call.
#[derive(Debug, thiserror::Error)]
pub enum FacadeError {
    /// The method name is not part of the facade surface.
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    /// Params did not match the method's schema.
    #[error("invalid params: {0}")]
    InvalidParams(String),
    /// `gpu.job.submit` was rejected.
    #[error(transparent)]
    Submit(#[from] SubmitError),
    /// The response could not be encoded.
    #[error("failed to encode response: {0}")]
    Encode(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitParams {
    job_id: String,
    #[serde(default = "default_wait_timeout_ms")]
    timeout_ms: u64,
}

fn default_wait_timeout_ms() -> u64 {
    DEFAULT_INVOKE_TIMEOUT_MS
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelParams {
    job_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeInvokeParams {
    node_id: String,
    command: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    idempotency_key: Option<String>,
}

/// Routes gateway RPC methods to the scheduler and registry in process.
#[derive(Clone)]
pub struct GatewayFacade {
    scheduler: GpuScheduler,
    registry: Arc<NodeRegistry>,
}

impl GatewayFacade {
    /// Build a facade over the given scheduler and registry.
    pub fn new(scheduler: GpuScheduler, registry: Arc<NodeRegistry>) -> Self {
        Self {
            scheduler,
            registry,
        }
    }

    /// Dispatch one gateway method.
    ///
    /// Supported: `gpu.job.submit`, `gpu.job.wait`, `gpu.job.cancel`,
    /// `node.list`, `node.invoke`.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, FacadeError> {
        match method {
            "gpu.job.submit" => {
                let req: GpuJobRequest = decode(params)?;
                let job = self.scheduler.submit(req).await?;
                encode(&job)
            }
            "gpu.job.wait" => {
                let p: WaitParams = decode(params)?;
                let job = self.scheduler.wait(&p.job_id, p.timeout_ms).await;
                encode(&job)
            }
            "gpu.job.cancel" => {
                let p: CancelParams = decode(params)?;
                let outcome = self.scheduler.cancel(&p.job_id).await;
                encode(&outcome)
            }
            "node.list" => encode(&self.registry.list_connected()),
            "node.invoke" => {
                let p: NodeInvokeParams = decode(params)?;
                let outcome = self
                    .registry
                    .invoke(InvokeRequest {
                        node_id: p.node_id,
                        command: p.command,
                        params: p.params,
                        timeout_ms: p.timeout_ms.unwrap_or(DEFAULT_INVOKE_TIMEOUT_MS),
                        idempotency_key: p
                            .idempotency_key
                            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                    })
                    .await;
                encode(&outcome)
            }
            other => Err(FacadeError::UnknownMethod(other.to_string())),
        }
    }
}

fn decode<T: DeserializeOwned>(params: Value) -> Result<T, FacadeError> {
    serde_json::from_value(params).map_err(|err| FacadeError::InvalidParams(err.to_string()))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, FacadeError> {
    serde_json::to_value(value).map_err(|err| FacadeError::Encode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::api::SchedulerConfig;
    use crate::policy::CommandPolicy;

    use super::*;

    fn facade() -> GatewayFacade {
        let registry = Arc::new(NodeRegistry::new());
        let scheduler = GpuScheduler::new(
            SchedulerConfig {
                persist: false,
                ..SchedulerConfig::default()
            },
            registry.clone(),
            CommandPolicy::allowing(["system.run"]),
        );
        GatewayFacade::new(scheduler, registry)
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let err = facade().call("gpu.job.purge", json!({})).await.unwrap_err();
        assert!(matches!(err, FacadeError::UnknownMethod(_)));
    }

    #[tokio::test]
    async fn node_list_answers_with_an_array() {
        let value = facade().call("node.list", json!({})).await.unwrap();
        assert_eq!(value, json!([]));
    }

    #[tokio::test]
    async fn submit_round_trips_camel_case_payloads() {
        let value = facade()
            .call(
                "gpu.job.submit",
                json!({
                    "resources": {"gpuCount": 2},
                    "exec": {"command": ["true"]},
                    "maxAttempts": 3
                }),
            )
            .await
            .unwrap();
        assert_eq!(value["state"], json!("queued"));
        assert_eq!(value["resources"]["gpuCount"], json!(2));
        assert_eq!(value["maxAttempts"], json!(3));
        assert!(value["jobId"].is_string());
    }

    #[tokio::test]
    async fn wait_for_unknown_job_is_null() {
        let value = facade()
            .call("gpu.job.wait", json!({"jobId": "ghost", "timeoutMs": 10}))
            .await
            .unwrap();
        assert_eq!(value, Value::Null);
    }

    #[tokio::test]
    async fn malformed_params_are_invalid() {
        let err = facade()
            .call("gpu.job.cancel", json!({"job": 42}))
            .await
            .unwrap_err();
        assert!(matches!(err, FacadeError::InvalidParams(_)));
    }
}
