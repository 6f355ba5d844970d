//! Pipeline orchestrator: drives the fixed six-step proposal pipeline
//! (`compile → run → refine → execute → finalize → accept`) per submitted
//! job, persisting state and returning a terminal result.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::task::JoinHandle;

use openclaw_gateway_core::now_ms;
use openclaw_gateway_core::state::{read_json, write_json_atomic};

use crate::api::{
    EventLevel, JobState, OpOutcome, OrchestratorConfig, ProposalEvent, ProposalJob,
    ProposalRequest, StepId, StepOutcome, StepSnapshot, StepStatus, SubmitError,
};
use crate::facade::GatewayFacade;

const PERSIST_DEBOUNCE: Duration = Duration::from_millis(200);
const STATE_SCHEMA_VERSION: u32 = 1;
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// External collaborators executing the pipeline steps.
///
/// The orchestrator owns sequencing, state, and cancellation; the
/// delegate owns the work. A step reports through its [`StepOutcome`];
/// the orchestrator never interprets step internals.
#[async_trait]
pub trait PipelineDelegate: Send + Sync {
    /// Compile the proposal into a plan; sets `plan_id`/`plan_dir` on
    /// success.
    async fn compile(&self, request: &ProposalRequest) -> StepOutcome;
    /// Safe-run the plan's safe nodes.
    async fn run(&self, plan_dir: &str) -> StepOutcome;
    /// Refine the plan.
    async fn refine(&self, plan_dir: &str) -> StepOutcome;
    /// Execute the plan's GPU nodes; `gateway` answers the gateway RPC
    /// surface in process.
    async fn execute(&self, plan_dir: &str, gateway: GatewayFacade) -> StepOutcome;
    /// Finalize reports.
    async fn finalize(&self, plan_dir: &str) -> StepOutcome;
    /// Evaluate acceptance.
    async fn accept(&self, plan_dir: &str) -> StepOutcome;
}

#[derive(Serialize, Deserialize)]
struct JobsFile {
    version: u32,
    #[serde(default)]
    jobs: Vec<ProposalJob>,
}

struct OrchCore {
    cfg: OrchestratorConfig,
    delegate: Arc<dyn PipelineDelegate>,
    facade: GatewayFacade,
    state: Mutex<OrchState>,
    kick: Notify,
    persist_kick: Notify,
    started: AtomicBool,
    stopped: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct OrchState {
    jobs: BTreeMap<String, ProposalJob>,
    queue: VecDeque<String>,
    waiters: HashMap<String, Vec<oneshot::Sender<ProposalJob>>>,
    state_version: u64,
    persisted_version: u64,
}

impl OrchCore {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn mark_dirty(&self, st: &mut OrchState) {
        st.state_version += 1;
        self.persist_kick.notify_one();
    }

    fn push_event(&self, job: &mut ProposalJob, level: EventLevel, message: impl Into<String>) {
        job.events.push_back(ProposalEvent {
            ts: now_ms(),
            level,
            message: message.into(),
        });
        let limit = self.cfg.event_limit.max(1);
        while job.events.len() > limit {
            job.events.pop_front();
        }
    }

    fn notify_terminal(&self, st: &mut OrchState, job_id: &str) {
        let Some(job) = st.jobs.get(job_id) else {
            return;
        };
        let snapshot = job.clone();
        if let Some(waiters) = st.waiters.remove(job_id) {
            for waiter in waiters {
                let _ = waiter.send(snapshot.clone());
            }
        }
    }

    /// Move a job to a terminal state, record an event, and wake waiters.
    fn finish(
        &self,
        st: &mut OrchState,
        job_id: &str,
        state: JobState,
        level: EventLevel,
        message: String,
    ) {
        if let Some(job) = st.jobs.get_mut(job_id) {
            job.state = state;
            job.updated_at_ms = now_ms();
            self.push_event(job, level, message);
        }
        st.queue.retain(|id| id != job_id);
        self.mark_dirty(st);
        self.notify_terminal(st, job_id);
        self.kick.notify_one();
    }
}

/// Step-sequenced pipeline scheduler.
///
/// Cheap to clone; clones share the same orchestrator instance.
#[derive(Clone)]
pub struct ProposalOrchestrator {
    core: Arc<OrchCore>,
}

impl ProposalOrchestrator {
    /// Build an orchestrator over the given delegate and gateway facade.
    pub fn new(
        cfg: OrchestratorConfig,
        delegate: Arc<dyn PipelineDelegate>,
        facade: GatewayFacade,
    ) -> Self {
        Self {
            core: Arc::new(OrchCore {
                cfg,
                delegate,
                facade,
                state: Mutex::new(OrchState::default()),
                kick: Notify::new(),
                persist_kick: Notify::new(),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Load persisted state and start the dispatcher and persistence
    /// tasks. Idempotent.
    ///
    /// Jobs loaded as `running` are marked failed: pipeline steps run in
    /// process and cannot resume mid-step across a restart.
    pub async fn start(&self) {
        if self.core.started.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(path) = self.core.cfg.resolved_persist_path() {
            let read_path = path.clone();
            let loaded = tokio::task::spawn_blocking(move || read_json::<JobsFile>(&read_path))
                .await
                .ok()
                .flatten();
            if let Some(file) = loaded.filter(|f| {
                if f.version != STATE_SCHEMA_VERSION {
                    tracing::warn!(
                        "ignoring proposal orchestrator state with unsupported version {}",
                        f.version
                    );
                    return false;
                }
                true
            }) {
                let mut st = self.core.state.lock().await;
                for mut job in file.jobs {
                    match job.state {
                        JobState::Queued => st.queue.push_back(job.job_id.clone()),
                        JobState::Running => {
                            job.state = JobState::Failed;
                            job.updated_at_ms = now_ms();
                            for snap in job.steps.values_mut() {
                                if snap.status == StepStatus::Running {
                                    snap.status = StepStatus::Failed;
                                    snap.finished_at_ms = Some(job.updated_at_ms);
                                    snap.ok = Some(false);
                                }
                            }
                            self.core.push_event(
                                &mut job,
                                EventLevel::Error,
                                "gateway restarted while proposal job was running",
                            );
                        }
                        _ => {}
                    }
                    st.jobs.insert(job.job_id.clone(), job);
                }
                self.core.mark_dirty(&mut st);
                tracing::info!(
                    "loaded {} persisted proposal jobs from {}",
                    st.jobs.len(),
                    path.display()
                );
            }
        }

        let mut tasks = self.core.tasks.lock().expect("orchestrator tasks poisoned");
        tasks.push(tokio::spawn(dispatch_loop(self.clone())));
        tasks.push(tokio::spawn(persist_loop(self.clone())));
        drop(tasks);
        self.core.kick.notify_one();
    }

    /// Cancel all internal tasks. Waiters are abandoned. Idempotent.
    pub fn stop(&self) {
        if self.core.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.core.tasks.lock().expect("orchestrator tasks poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
        self.core.kick.notify_waiters();
        self.core.persist_kick.notify_waiters();
    }

    /// Validate and enqueue a pipeline job.
    pub async fn submit(&self, request: ProposalRequest) -> Result<ProposalJob, SubmitError> {
        if self.core.is_stopped() {
            return Err(SubmitError::Stopped);
        }
        if request.proposal_markdown.is_none() && request.plan_dir.is_none() {
            return Err(SubmitError::Invalid(
                "request must carry proposalMarkdown or planDir".into(),
            ));
        }
        if let Some(steps) = &request.steps {
            if request.plan_dir.is_none() && !steps.contains(&StepId::Compile) {
                return Err(SubmitError::Invalid(
                    "compile step is required unless planDir is provided".into(),
                ));
            }
        }

        let now = now_ms();
        let enabled = request.steps.clone().unwrap_or_else(|| StepId::ALL.to_vec());
        let mut steps = BTreeMap::new();
        for step in StepId::ALL {
            let mut status = if enabled.contains(&step) {
                StepStatus::Pending
            } else {
                StepStatus::Skipped
            };
            if step == StepId::Compile && request.plan_dir.is_some() {
                status = StepStatus::Skipped;
            }
            steps.insert(
                step,
                StepSnapshot {
                    id: step,
                    status,
                    started_at_ms: None,
                    finished_at_ms: None,
                    ok: None,
                    warnings_count: None,
                    errors_count: None,
                    summary: None,
                },
            );
        }

        let mut job = ProposalJob {
            job_id: uuid::Uuid::new_v4().to_string(),
            created_at_ms: now,
            updated_at_ms: now,
            state: JobState::Queued,
            plan_dir: request.plan_dir.clone(),
            plan_id: None,
            request,
            steps,
            events: VecDeque::new(),
            cancel_requested: None,
        };
        self.core
            .push_event(&mut job, EventLevel::Info, "job submitted");
        let snapshot = job.clone();

        {
            let mut st = self.core.state.lock().await;
            st.queue.push_back(job.job_id.clone());
            st.jobs.insert(job.job_id.clone(), job);
            self.core.mark_dirty(&mut st);
        }
        self.core.kick.notify_one();
        Ok(snapshot)
    }

    /// Snapshot of one job.
    pub async fn get(&self, job_id: &str) -> Option<ProposalJob> {
        self.core.state.lock().await.jobs.get(job_id).cloned()
    }

    /// Jobs sorted by creation time descending, optionally filtered.
    pub async fn list(&self, state: Option<JobState>) -> Vec<ProposalJob> {
        let st = self.core.state.lock().await;
        let mut jobs: Vec<ProposalJob> = st
            .jobs
            .values()
            .filter(|j| state.is_none_or(|s| j.state == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        jobs
    }

    /// Cancel a job: a queued job terminates immediately; a running job
    /// only gets the flag, honored between steps. No marker files — the
    /// pipeline runs in process.
    pub async fn cancel(&self, job_id: &str) -> OpOutcome {
        let mut st = self.core.state.lock().await;
        let Some(job) = st.jobs.get_mut(job_id) else {
            return OpOutcome::rejected("unknown job");
        };
        if job.state.is_terminal() {
            return OpOutcome::rejected("job is already terminal");
        }
        match job.state {
            JobState::Queued => {
                job.cancel_requested = Some(true);
                self.core.finish(
                    &mut st,
                    job_id,
                    JobState::Canceled,
                    EventLevel::Warn,
                    "job canceled".into(),
                );
            }
            JobState::Running => {
                job.cancel_requested = Some(true);
                job.updated_at_ms = now_ms();
                self.core
                    .push_event(job, EventLevel::Warn, "cancel requested");
                self.core.mark_dirty(&mut st);
            }
            _ => {}
        }
        OpOutcome::accepted()
    }

    /// Wait for the job's next terminal transition; same semantics as the
    /// GPU scheduler's `wait`.
    pub async fn wait(&self, job_id: &str, timeout_ms: u64) -> Option<ProposalJob> {
        let rx = {
            let mut st = self.core.state.lock().await;
            match st.jobs.get(job_id) {
                None => return None,
                Some(job) if job.state.is_terminal() => return Some(job.clone()),
                Some(_) => {
                    let (tx, rx) = oneshot::channel();
                    st.waiters.entry(job_id.to_string()).or_default().push(tx);
                    rx
                }
            }
        };
        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(job)) => Some(job),
            _ => self.get(job_id).await,
        }
    }
}

async fn dispatch_loop(orch: ProposalOrchestrator) {
    loop {
        if orch.core.is_stopped() {
            break;
        }
        let starts: Vec<String> = {
            let mut st = orch.core.state.lock().await;
            {
                let OrchState { queue, jobs, .. } = &mut *st;
                queue.retain(|id| jobs.get(id).is_some_and(|j| !j.state.is_terminal()));
            }
            let running = st
                .jobs
                .values()
                .filter(|j| j.state == JobState::Running)
                .count();
            let mut slots = orch.core.cfg.max_concurrent_jobs.saturating_sub(running);
            let order: Vec<String> = st.queue.iter().cloned().collect();
            let mut starts = Vec::new();
            for job_id in order {
                if slots == 0 {
                    break;
                }
                let Some(job) = st.jobs.get_mut(&job_id) else {
                    continue;
                };
                if job.state != JobState::Queued {
                    continue;
                }
                job.state = JobState::Running;
                job.updated_at_ms = now_ms();
                orch.core
                    .push_event(job, EventLevel::Info, "pipeline started");
                starts.push(job_id);
                slots -= 1;
            }
            if !starts.is_empty() {
                orch.core.mark_dirty(&mut st);
            }
            starts
        };
        for job_id in starts {
            let orch = orch.clone();
            tokio::spawn(async move {
                run_pipeline(orch, job_id).await;
            });
        }
        trim_history(&orch).await;

        let has_queued = {
            let st = orch.core.state.lock().await;
            st.queue
                .iter()
                .any(|id| st.jobs.get(id).is_some_and(|j| j.state == JobState::Queued))
        };
        if has_queued {
            tokio::select! {
                _ = orch.core.kick.notified() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        } else {
            orch.core.kick.notified().await;
        }
    }
}

enum StepPlan {
    Skip,
    Run {
        request: ProposalRequest,
        plan_dir: Option<String>,
    },
}

async fn run_pipeline(orch: ProposalOrchestrator, job_id: String) {
    for step in StepId::ALL {
        let plan = {
            let mut st = orch.core.state.lock().await;
            let Some(job) = st.jobs.get_mut(&job_id) else {
                return;
            };
            if job.is_cancel_requested() {
                orch.core.finish(
                    &mut st,
                    &job_id,
                    JobState::Canceled,
                    EventLevel::Warn,
                    "job canceled".into(),
                );
                return;
            }
            if job
                .steps
                .get(&step)
                .is_none_or(|s| s.status == StepStatus::Skipped)
            {
                StepPlan::Skip
            } else {
                let now = now_ms();
                if let Some(snap) = job.steps.get_mut(&step) {
                    snap.status = StepStatus::Running;
                    snap.started_at_ms = Some(now);
                }
                job.updated_at_ms = now;
                orch.core.push_event(
                    job,
                    EventLevel::Info,
                    format!("step {} started", step.as_str()),
                );
                let request = job.request.clone();
                let plan_dir = job.plan_dir.clone();
                orch.core.mark_dirty(&mut st);
                StepPlan::Run { request, plan_dir }
            }
        };
        let (request, plan_dir) = match plan {
            StepPlan::Skip => continue,
            StepPlan::Run { request, plan_dir } => (request, plan_dir),
        };

        let outcome = if step == StepId::Compile {
            orch.core.delegate.compile(&request).await
        } else {
            match plan_dir.as_deref() {
                None => StepOutcome::failure("missing plan dir"),
                Some(dir) => match step {
                    StepId::Run => orch.core.delegate.run(dir).await,
                    StepId::Refine => orch.core.delegate.refine(dir).await,
                    StepId::Execute => {
                        orch.core
                            .delegate
                            .execute(dir, orch.core.facade.clone())
                            .await
                    }
                    StepId::Finalize => orch.core.delegate.finalize(dir).await,
                    StepId::Accept => orch.core.delegate.accept(dir).await,
                    StepId::Compile => StepOutcome::failure("unexpected compile"),
                },
            }
        };

        let mut st = orch.core.state.lock().await;
        let Some(job) = st.jobs.get_mut(&job_id) else {
            return;
        };
        let now = now_ms();
        if let Some(snap) = job.steps.get_mut(&step) {
            snap.finished_at_ms = Some(now);
            snap.ok = Some(outcome.ok);
            snap.warnings_count = outcome.warnings_count;
            snap.errors_count = outcome.errors_count;
            snap.summary = outcome.summary.clone();
            snap.status = if outcome.ok {
                StepStatus::Succeeded
            } else {
                StepStatus::Failed
            };
        }
        if outcome.ok {
            if step == StepId::Compile {
                if let Some(plan_id) = outcome.plan_id {
                    job.plan_id = Some(plan_id);
                }
                if let Some(plan_dir) = outcome.plan_dir {
                    job.plan_dir = Some(plan_dir);
                }
            }
            job.updated_at_ms = now;
            orch.core.push_event(
                job,
                EventLevel::Info,
                format!("step {} succeeded", step.as_str()),
            );
            orch.core.mark_dirty(&mut st);
        } else {
            let detail = outcome.error.unwrap_or_else(|| "no detail".into());
            orch.core.push_event(
                job,
                EventLevel::Error,
                format!("step {} failed: {detail}", step.as_str()),
            );
            orch.core.finish(
                &mut st,
                &job_id,
                JobState::Failed,
                EventLevel::Error,
                format!("{} failed", step.as_str()),
            );
            return;
        }
    }

    let mut st = orch.core.state.lock().await;
    let Some(job) = st.jobs.get(&job_id) else {
        return;
    };
    let terminal = if job.is_cancel_requested() {
        (JobState::Canceled, EventLevel::Warn, "job canceled")
    } else {
        (JobState::Succeeded, EventLevel::Info, "pipeline succeeded")
    };
    orch.core
        .finish(&mut st, &job_id, terminal.0, terminal.1, terminal.2.into());
}

async fn trim_history(orch: &ProposalOrchestrator) {
    let core = &orch.core;
    let limit = core.cfg.terminal_history_limit;
    let mut st = core.state.lock().await;

    let mut terminals: Vec<(i64, String)> = st
        .jobs
        .values()
        .filter(|j| j.state.is_terminal())
        .map(|j| (j.updated_at_ms, j.job_id.clone()))
        .collect();
    if terminals.len() <= limit {
        return;
    }
    terminals.sort_by(|a, b| b.0.cmp(&a.0));
    let evicted: Vec<String> = terminals.split_off(limit).into_iter().map(|(_, id)| id).collect();
    for job_id in &evicted {
        st.jobs.remove(job_id);
        st.waiters.remove(job_id);
    }
    st.queue.retain(|id| !evicted.contains(id));
    core.mark_dirty(&mut st);
}

async fn persist_loop(orch: ProposalOrchestrator) {
    let Some(path) = orch.core.cfg.resolved_persist_path() else {
        return;
    };
    loop {
        orch.core.persist_kick.notified().await;
        if orch.core.is_stopped() {
            break;
        }
        tokio::time::sleep(PERSIST_DEBOUNCE).await;

        loop {
            let snapshot = {
                let st = orch.core.state.lock().await;
                if st.state_version == st.persisted_version {
                    None
                } else {
                    Some((
                        st.state_version,
                        JobsFile {
                            version: STATE_SCHEMA_VERSION,
                            jobs: st.jobs.values().cloned().collect(),
                        },
                    ))
                }
            };
            let Some((version, doc)) = snapshot else {
                break;
            };

            let write_path = path.clone();
            match tokio::task::spawn_blocking(move || write_json_atomic(&write_path, &doc)).await
            {
                Ok(Ok(())) => {
                    let mut st = orch.core.state.lock().await;
                    st.persisted_version = version;
                    if st.state_version == version {
                        break;
                    }
                }
                Ok(Err(err)) => {
                    tracing::warn!("failed to persist proposal orchestrator state: {err:#}");
                    break;
                }
                Err(err) => {
                    tracing::warn!("proposal orchestrator persist task join error: {err}");
                    break;
                }
            }
        }
    }
}
