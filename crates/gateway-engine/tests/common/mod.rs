//! Shared test harness: scripted fake nodes behind the registry's
//! connection channel, plus polling helpers.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use openclaw_gateway_engine::{
    CommandPolicy, ExecSpec, GpuJobRequest, GpuScheduler, NodeRegistry, NodeResources, NodeRpc,
    NodeSession, ResourceRequest, SchedulerConfig,
};

pub type ReplyFuture = Pin<Box<dyn Future<Output = Value> + Send>>;

/// Observed traffic of one fake node.
#[derive(Clone)]
pub struct NodeCalls {
    calls: Arc<Mutex<Vec<Value>>>,
    max_overlap: Arc<AtomicUsize>,
}

impl NodeCalls {
    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn params(&self, idx: usize) -> Value {
        self.calls.lock().unwrap()[idx].clone()
    }

    /// Highest number of requests that were ever in flight at once.
    pub fn max_overlap(&self) -> usize {
        self.max_overlap.load(Ordering::SeqCst)
    }
}

pub fn gpu_session(node_id: &str, gpu_count: u32) -> NodeSession {
    NodeSession {
        node_id: node_id.to_string(),
        conn_id: format!("{node_id}-conn"),
        declared_commands: vec!["system.run".to_string()],
        caps: Vec::new(),
        resources: NodeResources {
            gpu_count: Some(gpu_count),
            ..NodeResources::default()
        },
        connected_at_ms: 0,
    }
}

/// Register a fake node whose responses come from `respond(call_idx,
/// params)`. Each request is served concurrently, like a real worker.
pub fn connect_node<F>(registry: &NodeRegistry, session: NodeSession, respond: F) -> NodeCalls
where
    F: Fn(usize, Value) -> ReplyFuture + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::channel::<NodeRpc>(16);
    registry.connect(session, tx);

    let calls = Arc::new(Mutex::new(Vec::new()));
    let max_overlap = Arc::new(AtomicUsize::new(0));
    let active = Arc::new(AtomicUsize::new(0));
    let observed = NodeCalls {
        calls: calls.clone(),
        max_overlap: max_overlap.clone(),
    };

    let respond = Arc::new(respond);
    tokio::spawn(async move {
        let mut idx = 0usize;
        while let Some(rpc) = rx.recv().await {
            let call_idx = idx;
            idx += 1;
            calls.lock().unwrap().push(rpc.params.clone());

            let reply = respond(call_idx, rpc.params);
            let active = active.clone();
            let max_overlap = max_overlap.clone();
            tokio::spawn(async move {
                let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_overlap.fetch_max(now_active, Ordering::SeqCst);
                let payload = reply.await;
                active.fetch_sub(1, Ordering::SeqCst);
                let _ = rpc.reply.send(payload);
            });
        }
    });
    observed
}

pub fn ok_payload(stdout: &str) -> Value {
    json!({"success": true, "stdout": stdout, "stderr": "", "exitCode": 0, "timedOut": false})
}

pub fn fail_payload(exit_code: i64) -> Value {
    json!({"success": false, "stdout": "", "stderr": "", "exitCode": exit_code, "timedOut": false})
}

/// Reply immediately with `payload` on every call.
pub fn always(payload: Value) -> impl Fn(usize, Value) -> ReplyFuture + Send + Sync + 'static {
    move |_, _| {
        let payload = payload.clone();
        Box::pin(async move { payload })
    }
}

/// Reply with `payload` after `delay` on every call.
pub fn always_after(
    delay: Duration,
    payload: Value,
) -> impl Fn(usize, Value) -> ReplyFuture + Send + Sync + 'static {
    move |_, _| {
        let payload = payload.clone();
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            payload
        })
    }
}

pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        persist: false,
        poll_interval_ms: 25,
        ..SchedulerConfig::default()
    }
}

pub fn scheduler_over(registry: Arc<NodeRegistry>, cfg: SchedulerConfig) -> GpuScheduler {
    GpuScheduler::new(cfg, registry, CommandPolicy::allowing(["system.run"]))
}

pub fn simple_request(gpu_count: u32) -> GpuJobRequest {
    GpuJobRequest {
        resources: ResourceRequest {
            gpu_count,
            ..ResourceRequest::default()
        },
        exec: ExecSpec {
            command: vec!["nvidia-smi".to_string()],
            ..ExecSpec::default()
        },
        max_attempts: None,
        policy: None,
    }
}

pub fn shell_request(script: &str, plan_dir: &str) -> GpuJobRequest {
    let mut env = BTreeMap::new();
    env.insert(ExecSpec::PLAN_DIR_ENV.to_string(), plan_dir.to_string());
    GpuJobRequest {
        resources: ResourceRequest::default(),
        exec: ExecSpec {
            command: vec!["sh".to_string(), "-lc".to_string(), script.to_string()],
            env,
            ..ExecSpec::default()
        },
        max_attempts: None,
        policy: None,
    }
}

/// Poll `probe` until it returns true or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub const SPEC_WAIT_MS: u64 = 10_000;
