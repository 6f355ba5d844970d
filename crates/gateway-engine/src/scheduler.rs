//! GPU job scheduler: single queue, resource-aware dispatch, durable
//! state, cooperative pause/cancel, and restart reconciliation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex, Notify, broadcast, oneshot};
use tokio::task::JoinHandle;

use openclaw_gateway_core::now_ms;
use openclaw_gateway_core::state::{read_json, write_json_atomic};
use openclaw_gateway_core::window::{TimeWindow, any_contains};

use crate::api::{
    GpuJob, GpuJobRequest, JobResult, JobState, MIN_POLICY_INTERVAL_MS, MIN_POLL_INTERVAL_MS,
    OpOutcome, PauseReason, SchedulerConfig, SchedulerEvent, SchedulerSnapshot, SubmitError,
};
use crate::policy::CommandPolicy;
use crate::registry::NodeRegistry;
use crate::reconcile::ReconcileEntry;
use crate::{dispatch, monitor, reconcile, wrap};

const PERSIST_DEBOUNCE: Duration = Duration::from_millis(200);
const STATE_SCHEMA_VERSION: u32 = 1;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Serialize, Deserialize)]
struct JobsFile {
    version: u32,
    #[serde(default)]
    jobs: Vec<GpuJob>,
}

pub(crate) struct SchedulerCore {
    pub(crate) cfg: SchedulerConfig,
    pub(crate) registry: Arc<NodeRegistry>,
    pub(crate) command_policy: CommandPolicy,
    pub(crate) state: Mutex<SchedulerState>,
    pub(crate) kick: Notify,
    pub(crate) persist_kick: Notify,
    pub(crate) events: broadcast::Sender<SchedulerEvent>,
    started: AtomicBool,
    stopped: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
pub(crate) struct SchedulerState {
    pub(crate) jobs: BTreeMap<String, GpuJob>,
    pub(crate) queue: VecDeque<String>,
    pub(crate) waiters: HashMap<String, Vec<oneshot::Sender<GpuJob>>>,
    pub(crate) reconcile: Vec<ReconcileEntry>,
    pub(crate) state_version: u64,
    pub(crate) persisted_version: u64,
}

impl SchedulerCore {
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }

    /// Bump the state version and wake the persistence task.
    pub(crate) fn mark_dirty(&self, state: &mut SchedulerState) {
        state.state_version += 1;
        self.persist_kick.notify_one();
    }

    /// Drain the job's waiters with its terminal snapshot and emit the
    /// terminal event. The job must already be terminal.
    pub(crate) fn notify_terminal(&self, state: &mut SchedulerState, job_id: &str) {
        let Some(job) = state.jobs.get(job_id) else {
            return;
        };
        let snapshot = job.clone();
        if let Some(waiters) = state.waiters.remove(job_id) {
            for waiter in waiters {
                let _ = waiter.send(snapshot.clone());
            }
        }
        self.emit(SchedulerEvent::Terminal {
            job_id: job_id.to_string(),
            state: snapshot.state,
        });
    }
}

/// Effective time policy of one job after job-level overrides.
pub(crate) struct EffectivePolicy {
    pub(crate) auto_pause: bool,
    pub(crate) auto_resume: bool,
    pub(crate) windows: Vec<TimeWindow>,
}

/// Job-level policy overrides the global one; a job without windows from
/// either source has no policy. Malformed windows are discarded, and a job
/// left with none behaves as policy-free.
pub(crate) fn effective_policy(cfg: &SchedulerConfig, job: &GpuJob) -> Option<EffectivePolicy> {
    let job_policy = job.policy.as_ref();
    let windows = match job_policy.and_then(|p| p.windows.as_ref()) {
        Some(windows) => windows.clone(),
        None if cfg.policy.enabled => cfg.policy.windows.clone(),
        None => return None,
    };
    let windows: Vec<TimeWindow> = windows.into_iter().filter(|w| w.is_well_formed()).collect();
    if windows.is_empty() {
        return None;
    }
    Some(EffectivePolicy {
        auto_pause: job_policy
            .and_then(|p| p.auto_pause)
            .unwrap_or(cfg.policy.auto_pause),
        auto_resume: job_policy
            .and_then(|p| p.auto_resume)
            .unwrap_or(cfg.policy.auto_resume),
        windows,
    })
}

/// Append a lifecycle event to the job's on-disk journal, off the
/// executor and without blocking the caller.
pub(crate) fn journal(plan_dir: PathBuf, job_id: String, kind: &'static str, extra: Value) {
    tokio::task::spawn_blocking(move || {
        monitor::append_job_event(&plan_dir, &job_id, kind, extra);
    });
}

/// Resource-aware GPU job scheduler.
///
/// Cheap to clone; clones share the same scheduler instance. All state
/// mutation happens under a single FIFO critical section; RPCs and
/// filesystem work run between critical sections and re-enter to apply
/// their results.
#[derive(Clone)]
pub struct GpuScheduler {
    pub(crate) core: Arc<SchedulerCore>,
}

impl GpuScheduler {
    /// Build a scheduler over the given registry and command policy.
    ///
    /// No background task runs until [`start`](Self::start).
    pub fn new(
        cfg: SchedulerConfig,
        registry: Arc<NodeRegistry>,
        command_policy: CommandPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            core: Arc::new(SchedulerCore {
                cfg,
                registry,
                command_policy,
                state: Mutex::new(SchedulerState::default()),
                kick: Notify::new(),
                persist_kick: Notify::new(),
                events,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Load persisted state and start the dispatcher, persistence, and
    /// policy tasks. Idempotent.
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
                        "ignoring gpu scheduler state with unsupported version {}",
                        f.version
                    );
                    return false;
                }
                true
            }) {
                let mut st = self.core.state.lock().await;
                let mut running = 0usize;
                for job in file.jobs {
                    match job.state {
                        JobState::Queued => st.queue.push_back(job.job_id.clone()),
                        JobState::Running => {
                            running += 1;
                            st.queue.push_back(job.job_id.clone());
                            st.reconcile.push(ReconcileEntry {
                                job_id: job.job_id.clone(),
                                attempt: job.attempts.len() as u32,
                                plan_dir: monitor::plan_dir_of(&job.exec),
                            });
                        }
                        _ => {}
                    }
                    st.jobs.insert(job.job_id.clone(), job);
                }
                tracing::info!(
                    "loaded {} persisted gpu jobs ({} to reconcile) from {}",
                    st.jobs.len(),
                    running,
                    path.display()
                );
            }
        } else if self.core.cfg.persist {
            tracing::warn!(
                "gpu scheduler persistence is enabled but no state path is configured; \
                 continuing in memory"
            );
        }

        let mut tasks = self.core.tasks.lock().expect("scheduler tasks poisoned");
        tasks.push(tokio::spawn(dispatch_loop(self.clone())));
        tasks.push(tokio::spawn(persist_loop(self.clone())));
        tasks.push(tokio::spawn(policy_loop(self.clone())));
        drop(tasks);
        self.core.kick.notify_one();
    }

    /// Cancel all internal tasks. Waiters are abandoned. Idempotent.
    pub fn stop(&self) {
        if self.core.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.core.tasks.lock().expect("scheduler tasks poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
        self.core.kick.notify_waiters();
        self.core.persist_kick.notify_waiters();
    }

    /// Enqueue a job and return its initial snapshot.
    pub async fn submit(&self, req: GpuJobRequest) -> Result<GpuJob, SubmitError> {
        if self.core.is_stopped() {
            return Err(SubmitError::Stopped);
        }
        let now = now_ms();
        let mut resources = req.resources;
        resources.gpu_count = resources.gpu_count.max(1);

        let job = GpuJob {
            job_id: uuid::Uuid::new_v4().to_string(),
            created_at_ms: now,
            updated_at_ms: now,
            state: JobState::Queued,
            resources,
            exec: req.exec,
            max_attempts: req.max_attempts.unwrap_or(1).max(1),
            attempts: Vec::new(),
            assigned_node_id: None,
            not_before_ms: None,
            paused: None,
            paused_reason: None,
            pause_requested: None,
            cancel_requested: None,
            policy: req.policy,
            result: None,
        };
        let snapshot = job.clone();

        {
            let mut st = self.core.state.lock().await;
            st.queue.push_back(job.job_id.clone());
            st.jobs.insert(job.job_id.clone(), job);
            self.core.mark_dirty(&mut st);
        }
        self.core.emit(SchedulerEvent::Submitted {
            job_id: snapshot.job_id.clone(),
        });
        if let Some(dir) = monitor::plan_dir_of(&snapshot.exec) {
            journal(dir, snapshot.job_id.clone(), "submitted", json!({}));
        }
        self.core.kick.notify_one();
        Ok(snapshot)
    }

    /// Snapshot of one job.
    pub async fn get(&self, job_id: &str) -> Option<GpuJob> {
        self.core.state.lock().await.jobs.get(job_id).cloned()
    }

    /// Jobs sorted by creation time descending, optionally filtered.
    pub async fn list(&self, state: Option<JobState>) -> Vec<GpuJob> {
        let st = self.core.state.lock().await;
        let mut jobs: Vec<GpuJob> = st
            .jobs
            .values()
            .filter(|j| state.is_none_or(|s| j.state == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        jobs
    }

    /// Cancel a job: a queued job terminates immediately, a running job
    /// gets the cancel flag plus a `cancel.requested` marker when its
    /// command is wrapped. No effect on terminal jobs.
    pub async fn cancel(&self, job_id: &str) -> OpOutcome {
        let now = now_ms();
        let mut marker_dir: Option<PathBuf> = None;
        let mut plan_dir: Option<PathBuf> = None;
        let mut terminal = false;
        {
            let mut st = self.core.state.lock().await;
            let Some(job) = st.jobs.get_mut(job_id) else {
                return OpOutcome::rejected("unknown job");
            };
            if job.state.is_terminal() {
                return OpOutcome::rejected("job is already terminal");
            }
            plan_dir = monitor::plan_dir_of(&job.exec);
            match job.state {
                JobState::Queued => {
                    job.state = JobState::Canceled;
                    job.cancel_requested = Some(true);
                    job.paused = None;
                    job.paused_reason = None;
                    job.not_before_ms = None;
                    job.result = Some(JobResult {
                        exit_code: None,
                        timed_out: false,
                        success: false,
                        stdout_tail: None,
                        stderr_tail: None,
                    });
                    job.updated_at_ms = now;
                    terminal = true;
                }
                JobState::Running => {
                    job.cancel_requested = Some(true);
                    job.updated_at_ms = now;
                    let attempt = job.attempts.len().max(1) as u32;
                    marker_dir = plan_dir
                        .as_ref()
                        .map(|dir| monitor::monitor_dir(dir, job_id, attempt));
                }
                _ => {}
            }
            self.core.mark_dirty(&mut st);
            if terminal {
                st.queue.retain(|id| id != job_id);
                self.core.notify_terminal(&mut st, job_id);
            }
        }
        if !terminal {
            self.core.emit(SchedulerEvent::CancelRequested {
                job_id: job_id.to_string(),
            });
        }
        if let Some(dir) = marker_dir {
            let _ = tokio::task::spawn_blocking(move || monitor::write_cancel_marker(&dir, now))
                .await;
        }
        if let Some(dir) = plan_dir {
            let kind = if terminal { "canceled" } else { "cancel_requested" };
            journal(dir, job_id.to_string(), kind, json!({}));
        }
        OpOutcome::accepted()
    }

    /// Pause a job. A queued job is held back from dispatch; a running job
    /// additionally gets a `pause.requested` marker and is expected to
    /// terminate cooperatively. Rejected for a running job whose command
    /// is not wrapped.
    pub async fn pause(&self, job_id: &str, reason: PauseReason) -> OpOutcome {
        let now = now_ms();
        let mut marker_dir: Option<PathBuf> = None;
        let mut plan_dir: Option<PathBuf> = None;
        {
            let mut st = self.core.state.lock().await;
            let Some(job) = st.jobs.get_mut(job_id) else {
                return OpOutcome::rejected("unknown job");
            };
            match job.state {
                JobState::Queued => {
                    if job.is_paused() {
                        return OpOutcome::accepted();
                    }
                    job.paused = Some(true);
                    job.paused_reason = Some(reason);
                    job.updated_at_ms = now;
                }
                JobState::Running => {
                    let dir = monitor::plan_dir_of(&job.exec);
                    if dir.is_none() || !wrap::is_wrappable(&job.exec) {
                        return OpOutcome::rejected(
                            "job command is not wrapped; cannot pause while running",
                        );
                    }
                    if job.is_pause_requested() {
                        return OpOutcome::accepted();
                    }
                    job.pause_requested = Some(true);
                    job.paused = Some(true);
                    job.paused_reason = Some(reason);
                    job.updated_at_ms = now;
                    let attempt = job.attempts.len().max(1) as u32;
                    marker_dir = dir
                        .as_ref()
                        .map(|d| monitor::monitor_dir(d, job_id, attempt));
                }
                _ => return OpOutcome::rejected("job is already terminal"),
            }
            plan_dir = monitor::plan_dir_of(&job.exec);
            self.core.mark_dirty(&mut st);
        }
        self.core.emit(SchedulerEvent::Paused {
            job_id: job_id.to_string(),
        });
        let kind = if marker_dir.is_some() {
            "pause_requested"
        } else {
            "paused"
        };
        if let Some(dir) = marker_dir {
            let _ = tokio::task::spawn_blocking(move || monitor::write_pause_marker(&dir, now))
                .await;
        }
        if let Some(dir) = plan_dir {
            journal(dir, job_id.to_string(), kind, json!({}));
        }
        OpOutcome::accepted()
    }

    /// Resume a paused, queued job.
    pub async fn resume(&self, job_id: &str) -> OpOutcome {
        let now = now_ms();
        let mut plan_dir: Option<PathBuf> = None;
        {
            let mut st = self.core.state.lock().await;
            let Some(job) = st.jobs.get_mut(job_id) else {
                return OpOutcome::rejected("unknown job");
            };
            if job.state != JobState::Queued {
                return OpOutcome::rejected("job is not queued");
            }
            if !job.is_paused() {
                return OpOutcome::rejected("job is not paused");
            }
            job.paused = None;
            job.paused_reason = None;
            job.updated_at_ms = now;
            plan_dir = monitor::plan_dir_of(&job.exec);
            self.core.mark_dirty(&mut st);
        }
        self.core.emit(SchedulerEvent::Resumed {
            job_id: job_id.to_string(),
        });
        if let Some(dir) = plan_dir {
            journal(dir, job_id.to_string(), "resumed", json!({}));
        }
        self.core.kick.notify_one();
        OpOutcome::accepted()
    }

    /// Wait for the job's next terminal transition.
    ///
    /// Returns immediately when the job is already terminal; returns the
    /// latest snapshot when the deadline elapses first, and `None` for an
    /// unknown job.
    pub async fn wait(&self, job_id: &str, timeout_ms: u64) -> Option<GpuJob> {
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

    /// Subscribe to the scheduler event stream. Lossy under backpressure.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.core.events.subscribe()
    }

    /// Point-in-time counters for operator display.
    pub async fn snapshot(&self) -> SchedulerSnapshot {
        let st = self.core.state.lock().await;
        let mut snap = SchedulerSnapshot::default();
        for job in st.jobs.values() {
            match job.state {
                JobState::Queued => snap.queued += 1,
                JobState::Running => {
                    snap.running += 1;
                    if let Some(node) = &job.assigned_node_id {
                        *snap.allocated_gpus.entry(node.clone()).or_insert(0) +=
                            job.resources.gpu_count;
                    }
                }
                _ => snap.terminal += 1,
            }
        }
        snap
    }
}

async fn dispatch_loop(sched: GpuScheduler) {
    let poll = Duration::from_millis(sched.core.cfg.poll_interval_ms.max(MIN_POLL_INTERVAL_MS));
    loop {
        if sched.core.is_stopped() {
            break;
        }
        reconcile::run(&sched).await;
        let launches = dispatch::pump(&sched).await;
        for launch in launches {
            let sched = sched.clone();
            tokio::spawn(async move {
                dispatch::run_attempt(sched, launch).await;
            });
        }
        dispatch::trim_history(&sched).await;

        let runnable = {
            let st = sched.core.state.lock().await;
            dispatch::has_runnable_work(&st)
        };
        if runnable {
            tokio::select! {
                _ = sched.core.kick.notified() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        } else {
            sched.core.kick.notified().await;
        }
    }
}

async fn persist_loop(sched: GpuScheduler) {
    let Some(path) = sched.core.cfg.resolved_persist_path() else {
        return;
    };
    loop {
        sched.core.persist_kick.notified().await;
        if sched.core.is_stopped() {
            break;
        }
        tokio::time::sleep(PERSIST_DEBOUNCE).await;

        loop {
            let snapshot = {
                let st = sched.core.state.lock().await;
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
                    let mut st = sched.core.state.lock().await;
                    st.persisted_version = version;
                    if st.state_version == version {
                        break;
                    }
                }
                Ok(Err(err)) => {
                    tracing::warn!("failed to persist gpu scheduler state: {err:#}");
                    break;
                }
                Err(err) => {
                    tracing::warn!("gpu scheduler persist task join error: {err}");
                    break;
                }
            }
        }
    }
}

async fn policy_loop(sched: GpuScheduler) {
    let interval =
        Duration::from_millis(sched.core.cfg.policy.interval_ms.max(MIN_POLICY_INTERVAL_MS));
    loop {
        tokio::time::sleep(interval).await;
        if sched.core.is_stopped() {
            break;
        }
        policy_tick(&sched).await;
    }
}

enum PolicyAction {
    Pause(String),
    Resume(String),
}

async fn policy_tick(sched: &GpuScheduler) {
    let now = chrono::Utc::now();
    let actions: Vec<PolicyAction> = {
        let st = sched.core.state.lock().await;
        let mut actions = Vec::new();
        for job in st.jobs.values() {
            if job.state.is_terminal() {
                continue;
            }
            let Some(policy) = effective_policy(&sched.core.cfg, job) else {
                continue;
            };
            let in_window = any_contains(&policy.windows, now);
            match job.state {
                JobState::Queued => {
                    if policy.auto_pause && !in_window && !job.is_paused() {
                        actions.push(PolicyAction::Pause(job.job_id.clone()));
                    } else if policy.auto_resume
                        && in_window
                        && job.is_paused()
                        && job.paused_reason == Some(PauseReason::Policy)
                    {
                        actions.push(PolicyAction::Resume(job.job_id.clone()));
                    }
                }
                JobState::Running => {
                    if policy.auto_pause && !in_window && !job.is_pause_requested() {
                        actions.push(PolicyAction::Pause(job.job_id.clone()));
                    }
                }
                _ => {}
            }
        }
        actions
    };

    for action in actions {
        match action {
            PolicyAction::Pause(job_id) => {
                let outcome = sched.pause(&job_id, PauseReason::Policy).await;
                if !outcome.ok {
                    tracing::debug!(
                        "policy pause of {job_id} rejected: {}",
                        outcome.reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
            PolicyAction::Resume(job_id) => {
                let _ = sched.resume(&job_id).await;
            }
        }
    }
}
