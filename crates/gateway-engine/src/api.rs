//! Public API types for the gateway scheduling core.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use openclaw_gateway_core::window::TimeWindow;

/// Interval at which the worker wrapper refreshes `heartbeat.txt`.
pub const HEARTBEAT_INTERVAL_MS: i64 = 2_000;

/// Age past which a heartbeat no longer proves the worker is alive.
pub const HEARTBEAT_STALE_MS: i64 = 120_000;

/// Grace between SIGTERM and SIGKILL when a marker is honored.
pub const CANCEL_GRACE_MS: i64 = 10_000;

/// Maximum characters retained from stdout/stderr tails.
pub const TAIL_CHARS: usize = 4_000;

/// Floor for the dispatcher poll interval.
pub const MIN_POLL_INTERVAL_MS: u64 = 25;

/// Default interval of the time-window policy ticker.
pub const DEFAULT_POLICY_INTERVAL_MS: u64 = 30_000;

/// Floor for the time-window policy ticker interval.
pub const MIN_POLICY_INTERVAL_MS: u64 = 5_000;

/// Lifecycle state of a GPU or pipeline job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for dispatch.
    Queued,
    /// An attempt is in flight.
    Running,
    /// Terminal: the last attempt succeeded.
    Succeeded,
    /// Terminal: attempts are exhausted or a step failed.
    Failed,
    /// Terminal: canceled by an operator.
    Canceled,
}

impl JobState {
    /// Whether the state is terminal (no further transitions).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

/// Why a queued job is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseReason {
    /// Paused by an operator.
    Manual,
    /// Paused by the time-window policy.
    Policy,
}

/// GPU resources requested by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    /// GPUs required; normalized to at least 1 at submit.
    #[serde(default)]
    pub gpu_count: u32,
    /// Required GPU model, matched case-insensitively when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_type: Option<String>,
    /// Minimum per-GPU memory in GB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_mem_gb: Option<u32>,
    /// CPU cores, advisory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u32>,
    /// RAM in GB, advisory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_gb: Option<u32>,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            gpu_count: 1,
            gpu_type: None,
            gpu_mem_gb: None,
            cpu_cores: None,
            ram_gb: None,
        }
    }
}

/// Command execution request forwarded to the worker's `system.run`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecSpec {
    /// Argv of the command to run.
    pub command: Vec<String>,
    /// Operator-entered form of the command, for display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_command: Option<String>,
    /// Working directory on the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Environment forwarded to the worker.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Timeout applied by the worker to the command itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout_ms: Option<i64>,
    /// Timeout applied by the gateway to the RPC round trip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_timeout_ms: Option<i64>,
    /// Whether the command was pre-approved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    /// Recorded approval decision, for audit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_decision: Option<String>,
}

impl ExecSpec {
    /// Env key naming the plan directory shared with the worker.
    pub const PLAN_DIR_ENV: &'static str = "OPENCLAW_PLAN_DIR";

    /// Env key marking a command as rewritten by the scheduler.
    pub const WRAPPED_ENV: &'static str = "OPENCLAW_GPU_SCHEDULER_WRAPPED";

    /// Effective RPC timeout per the invoke-timeout derivation rules.
    pub fn effective_invoke_timeout_ms(&self) -> u64 {
        if let Some(ms) = self.invoke_timeout_ms {
            if ms > 0 {
                return ms as u64;
            }
        }
        if let Some(ms) = self.command_timeout_ms {
            if ms > 0 {
                return ms as u64 + 30_000;
            }
        }
        30_000
    }
}

/// Per-job time-window policy; fields override the global defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPolicy {
    /// Pause the job when outside every window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_pause: Option<bool>,
    /// Resume a policy-paused job when back inside a window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_resume: Option<bool>,
    /// Windows during which the job may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windows: Option<Vec<TimeWindow>>,
}

/// One dispatch-and-invoke cycle of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuJobAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Node the attempt ran on.
    pub node_id: String,
    /// Dispatch time.
    pub started_at_ms: i64,
    /// Completion time, absent while in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<i64>,
    /// Whether the command reported success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    /// Exit code reported by the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Whether the command or RPC timed out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<bool>,
    /// Tail of captured stdout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_tail: Option<String>,
    /// Tail of captured stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,
    /// Failure annotation (RPC error, requeue reason, "paused").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final outcome of a job, set exactly once on the terminal transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    /// Exit code of the deciding attempt, when one ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Whether the deciding attempt timed out.
    pub timed_out: bool,
    /// Whether the job succeeded.
    pub success: bool,
    /// Tail of the deciding attempt's stdout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_tail: Option<String>,
    /// Tail of the deciding attempt's stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,
}

/// A GPU job as persisted and returned by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuJob {
    /// Opaque identifier assigned at submit.
    pub job_id: String,
    /// Submit time.
    pub created_at_ms: i64,
    /// Last mutation time, non-decreasing.
    pub updated_at_ms: i64,
    /// Lifecycle state.
    pub state: JobState,
    /// Requested resources.
    pub resources: ResourceRequest,
    /// Command to execute.
    pub exec: ExecSpec,
    /// Attempt budget, at least 1.
    pub max_attempts: u32,
    /// Attempt history, numbered 1..n without gaps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<GpuJobAttempt>,
    /// Node of the in-flight attempt; cleared on requeue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_node_id: Option<String>,
    /// Earliest dispatch time while backing off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before_ms: Option<i64>,
    /// A paused job stays queued and is never dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    /// Why the job is paused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_reason: Option<PauseReason>,
    /// A pause marker has been written for the in-flight attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_requested: Option<bool>,
    /// A cancel marker has been written, or cancel was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_requested: Option<bool>,
    /// Per-job time-window policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<JobPolicy>,
    /// Final outcome; present iff the state is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}

impl GpuJob {
    /// Whether the job is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.unwrap_or(false)
    }

    /// Whether cancellation has been requested.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.unwrap_or(false)
    }

    /// Whether a pause marker is outstanding for the in-flight attempt.
    pub fn is_pause_requested(&self) -> bool {
        self.pause_requested.unwrap_or(false)
    }
}

/// Request to submit a GPU job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuJobRequest {
    /// Requested resources; `gpuCount` is floored at 1.
    #[serde(default)]
    pub resources: ResourceRequest,
    /// Command to execute.
    pub exec: ExecSpec,
    /// Attempt budget; defaults to 1, floored at 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Per-job time-window policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<JobPolicy>,
}

/// Acknowledgement of a control operation (`cancel`, `pause`, `resume`).
///
/// Control operations never error; a rejection carries a reason instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpOutcome {
    /// Whether the operation took effect.
    pub ok: bool,
    /// Why it was rejected, when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl OpOutcome {
    /// An accepted operation.
    pub fn accepted() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    /// A rejected operation with a reason.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

/// Error returned by `submit`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The scheduler has been stopped.
    #[error("scheduler is stopped")]
    Stopped,
    /// The request failed validation.
    #[error("invalid request: {0}")]
    Invalid(String),
}

/// Global time-window policy defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyConfig {
    /// Whether the global windows below apply to jobs without their own.
    pub enabled: bool,
    /// Pause jobs outside every window.
    pub auto_pause: bool,
    /// Resume policy-paused jobs back inside a window.
    pub auto_resume: bool,
    /// Global windows.
    pub windows: Vec<TimeWindow>,
    /// Ticker interval, floored at [`MIN_POLICY_INTERVAL_MS`].
    pub interval_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_pause: true,
            auto_resume: true,
            windows: Vec::new(),
            interval_ms: DEFAULT_POLICY_INTERVAL_MS,
        }
    }
}

/// Configuration of the GPU job scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    /// Cap on simultaneously running jobs.
    pub max_concurrent_jobs: usize,
    /// Whether state is persisted across restarts.
    pub persist: bool,
    /// State directory under which the default state file lives.
    pub state_dir: Option<PathBuf>,
    /// Explicit state file path, overriding `state_dir`.
    pub persist_path: Option<PathBuf>,
    /// Terminal jobs retained before history trimming evicts the oldest.
    pub terminal_history_limit: usize,
    /// Dispatcher poll interval, floored at [`MIN_POLL_INTERVAL_MS`].
    pub poll_interval_ms: u64,
    /// Global time-window policy.
    pub policy: PolicyConfig,
}

impl SchedulerConfig {
    /// Default cap on simultaneously running jobs.
    pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 1;

    /// Default terminal-history retention.
    pub const DEFAULT_TERMINAL_HISTORY_LIMIT: usize = 200;

    /// Default dispatcher poll interval.
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

    /// State file path, when persistence is enabled and a path resolves.
    pub fn resolved_persist_path(&self) -> Option<PathBuf> {
        if !self.persist {
            return None;
        }
        if let Some(path) = &self.persist_path {
            return Some(path.clone());
        }
        self.state_dir
            .as_ref()
            .map(|dir| dir.join("gateway").join("gpu-scheduler").join("jobs.json"))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: Self::DEFAULT_MAX_CONCURRENT_JOBS,
            persist: true,
            state_dir: None,
            persist_path: None,
            terminal_history_limit: Self::DEFAULT_TERMINAL_HISTORY_LIMIT,
            poll_interval_ms: Self::DEFAULT_POLL_INTERVAL_MS,
            policy: PolicyConfig::default(),
        }
    }
}

/// Scheduler event stream payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SchedulerEvent {
    /// A job entered the queue.
    Submitted {
        /// Job identifier.
        job_id: String,
    },
    /// An attempt was dispatched to a node.
    Dispatched {
        /// Job identifier.
        job_id: String,
        /// Selected node.
        node_id: String,
        /// Attempt number.
        attempt: u32,
    },
    /// An attempt completed (live RPC or reconciliation evidence).
    AttemptFinished {
        /// Job identifier.
        job_id: String,
        /// Attempt number.
        attempt: u32,
        /// Whether the attempt succeeded.
        ok: bool,
    },
    /// A job was paused.
    Paused {
        /// Job identifier.
        job_id: String,
    },
    /// A paused job was resumed.
    Resumed {
        /// Job identifier.
        job_id: String,
    },
    /// Cancellation was requested for a running job.
    CancelRequested {
        /// Job identifier.
        job_id: String,
    },
    /// A job reached a terminal state.
    Terminal {
        /// Job identifier.
        job_id: String,
        /// The terminal state.
        state: JobState,
    },
}

/// Point-in-time scheduler counters for operator display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSnapshot {
    /// Jobs waiting for dispatch.
    pub queued: usize,
    /// Jobs with an attempt in flight.
    pub running: usize,
    /// Jobs in a terminal state still retained.
    pub terminal: usize,
    /// GPUs allocated per node by running jobs.
    pub allocated_gpus: BTreeMap<String, u32>,
}

/// Identifier of a pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepId {
    /// Compile the proposal into a plan directory.
    Compile,
    /// Safe-run the plan's safe nodes.
    Run,
    /// Refine the plan.
    Refine,
    /// Execute the plan's GPU nodes through the gateway facade.
    Execute,
    /// Finalize reports.
    Finalize,
    /// Evaluate acceptance.
    Accept,
}

impl StepId {
    /// All steps in pipeline order.
    pub const ALL: [StepId; 6] = [
        StepId::Compile,
        StepId::Run,
        StepId::Refine,
        StepId::Execute,
        StepId::Finalize,
        StepId::Accept,
    ];

    /// Stable lowercase name of the step.
    pub fn as_str(self) -> &'static str {
        match self {
            StepId::Compile => "compile",
            StepId::Run => "run",
            StepId::Refine => "refine",
            StepId::Execute => "execute",
            StepId::Finalize => "finalize",
            StepId::Accept => "accept",
        }
    }
}

/// Status of a pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Not started.
    Pending,
    /// In progress.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Completed with failure; the job fails.
    Failed,
    /// Disabled by the request or made redundant by it.
    Skipped,
}

/// Snapshot of one pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSnapshot {
    /// Step identifier.
    pub id: StepId,
    /// Current status.
    pub status: StepStatus,
    /// Start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<i64>,
    /// Completion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<i64>,
    /// Whether the step reported success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    /// Warnings reported by the collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings_count: Option<u32>,
    /// Errors reported by the collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors_count: Option<u32>,
    /// One-line summary from the collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Severity of a pipeline job event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    /// Informational.
    Info,
    /// Degraded but continuing.
    Warn,
    /// Failure.
    Error,
}

/// One entry of a pipeline job's bounded event ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalEvent {
    /// Event time.
    pub ts: i64,
    /// Severity.
    pub level: EventLevel,
    /// Human-readable message.
    pub message: String,
}

/// Request to submit a pipeline job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalRequest {
    /// Proposal source; required unless `planDir` is provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_markdown: Option<String>,
    /// Pre-compiled plan directory; skips the compile step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_dir: Option<String>,
    /// Enabled steps; absent means all six.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<StepId>>,
    /// Options forwarded to the compile collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_options: Option<serde_json::Value>,
}

/// A pipeline job as persisted and returned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalJob {
    /// Opaque identifier assigned at submit.
    pub job_id: String,
    /// Submit time.
    pub created_at_ms: i64,
    /// Last mutation time.
    pub updated_at_ms: i64,
    /// Lifecycle state.
    pub state: JobState,
    /// The submitted request.
    pub request: ProposalRequest,
    /// Plan directory, set by compile or carried from the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_dir: Option<String>,
    /// Plan identifier, set by compile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    /// Per-step snapshots.
    pub steps: BTreeMap<StepId, StepSnapshot>,
    /// Bounded ring of lifecycle events, oldest first.
    #[serde(default, skip_serializing_if = "VecDeque::is_empty")]
    pub events: VecDeque<ProposalEvent>,
    /// Cancellation was requested; honored between steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_requested: Option<bool>,
}

impl ProposalJob {
    /// Whether cancellation has been requested.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.unwrap_or(false)
    }
}

/// Outcome of one pipeline step reported by the delegate.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    /// Whether the step succeeded.
    pub ok: bool,
    /// One-line summary.
    pub summary: Option<String>,
    /// Warnings emitted.
    pub warnings_count: Option<u32>,
    /// Errors emitted.
    pub errors_count: Option<u32>,
    /// Failure detail, when `ok` is false.
    pub error: Option<String>,
    /// Plan identifier; meaningful for compile only.
    pub plan_id: Option<String>,
    /// Plan directory; meaningful for compile only.
    pub plan_dir: Option<String>,
}

impl StepOutcome {
    /// A successful outcome with no detail.
    pub fn success() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    /// A failed outcome with a detail message.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Configuration of the pipeline orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    /// Cap on simultaneously running pipeline jobs.
    pub max_concurrent_jobs: usize,
    /// Whether state is persisted across restarts.
    pub persist: bool,
    /// State directory under which the default state file lives.
    pub state_dir: Option<PathBuf>,
    /// Explicit state file path, overriding `state_dir`.
    pub persist_path: Option<PathBuf>,
    /// Terminal jobs retained before history trimming evicts the oldest.
    pub terminal_history_limit: usize,
    /// Cap on each job's event ring.
    pub event_limit: usize,
}

impl OrchestratorConfig {
    /// Default cap on each job's event ring.
    pub const DEFAULT_EVENT_LIMIT: usize = 100;

    /// State file path, when persistence is enabled and a path resolves.
    pub fn resolved_persist_path(&self) -> Option<PathBuf> {
        if !self.persist {
            return None;
        }
        if let Some(path) = &self.persist_path {
            return Some(path.clone());
        }
        self.state_dir.as_ref().map(|dir| {
            dir.join("gateway")
                .join("proposal-orchestrator")
                .join("jobs.json")
        })
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: SchedulerConfig::DEFAULT_MAX_CONCURRENT_JOBS,
            persist: true,
            state_dir: None,
            persist_path: None,
            terminal_history_limit: SchedulerConfig::DEFAULT_TERMINAL_HISTORY_LIMIT,
            event_limit: Self::DEFAULT_EVENT_LIMIT,
        }
    }
}
