//! Dispatch pump, best-fit node selection, and attempt execution.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{Value, json};

use openclaw_gateway_core::{now_ms, tail_chars};

use crate::api::{
    ExecSpec, GpuJobAttempt, JobResult, JobState, PauseReason, ResourceRequest, SchedulerEvent,
    TAIL_CHARS,
};
use crate::registry::{InvokeErrorCode, InvokeRequest};
use crate::scheduler::{GpuScheduler, SchedulerState, effective_policy, journal};
use crate::{monitor, wrap};

/// One dispatch decision taken under the critical section; the RPC itself
/// runs outside it.
pub(crate) struct AttemptLaunch {
    pub(crate) job_id: String,
    pub(crate) attempt: u32,
    pub(crate) node_id: String,
    pub(crate) exec: ExecSpec,
    pub(crate) plan_dir: Option<PathBuf>,
}

struct Candidate {
    node_id: String,
    gpu_count: u32,
    gpu_type: Option<String>,
    gpu_mem_gb: Option<u32>,
    allocated: u32,
}

impl Candidate {
    fn free(&self) -> u32 {
        self.gpu_count.saturating_sub(self.allocated)
    }

    fn fits(&self, req: &ResourceRequest) -> bool {
        if self.free() < req.gpu_count {
            return false;
        }
        if let Some(want) = &req.gpu_type {
            match &self.gpu_type {
                Some(have) if have.eq_ignore_ascii_case(want) => {}
                _ => return false,
            }
        }
        if let Some(want_mem) = req.gpu_mem_gb {
            match self.gpu_mem_gb {
                Some(have) if have >= want_mem => {}
                _ => return false,
            }
        }
        true
    }
}

/// Best-fit: among candidates that satisfy the request, the one with the
/// fewest free GPUs; node id breaks ties deterministically.
fn select_best_fit(candidates: &[Candidate], req: &ResourceRequest) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, candidate) in candidates.iter().enumerate() {
        if !candidate.fits(req) {
            continue;
        }
        best = match best {
            None => Some(idx),
            Some(prev) => {
                let prev_c = &candidates[prev];
                if (candidate.free(), candidate.node_id.as_str())
                    < (prev_c.free(), prev_c.node_id.as_str())
                {
                    Some(idx)
                } else {
                    Some(prev)
                }
            }
        };
    }
    best
}

/// `system.run` response payload. Unrecognized shapes decode field-wise
/// with `success` defaulting to false.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RunPayload {
    success: bool,
    stdout: String,
    stderr: String,
    exit_code: Option<i64>,
    timed_out: bool,
}

/// Result of one attempt, from a live RPC or reconciliation evidence.
pub(crate) struct AttemptCompletion {
    pub(crate) ok: bool,
    pub(crate) exit_code: Option<i64>,
    pub(crate) timed_out: bool,
    pub(crate) stdout_tail: Option<String>,
    pub(crate) stderr_tail: Option<String>,
    pub(crate) error: Option<String>,
}

pub(crate) fn has_runnable_work(st: &SchedulerState) -> bool {
    !st.reconcile.is_empty()
        || st.queue.iter().any(|id| {
            st.jobs
                .get(id)
                .is_some_and(|j| j.state == JobState::Queued && !j.is_paused())
        })
}

/// One dispatcher pump under the critical section: walk the queue in FIFO
/// order and reserve nodes best-fit for every runnable job.
pub(crate) async fn pump(sched: &GpuScheduler) -> Vec<AttemptLaunch> {
    let core = &sched.core;
    let now = now_ms();
    let policy_now = chrono::Utc::now();
    let mut launches: Vec<AttemptLaunch> = Vec::new();
    let mut paused_ids: Vec<String> = Vec::new();

    let mut st = core.state.lock().await;
    {
        let SchedulerState { queue, jobs, .. } = &mut *st;
        queue.retain(|id| jobs.get(id).is_some_and(|j| !j.state.is_terminal()));
    }

    let mut running = st
        .jobs
        .values()
        .filter(|j| j.state == JobState::Running)
        .count();
    if running >= core.cfg.max_concurrent_jobs {
        return launches;
    }

    let mut candidates: Vec<Candidate> = core
        .registry
        .list_connected()
        .into_iter()
        .filter(|s| core.command_policy.allows("system.run", s))
        .filter_map(|s| {
            let gpu_count = s.resources.gpu_count.unwrap_or(0);
            (gpu_count > 0).then(|| Candidate {
                node_id: s.node_id.clone(),
                gpu_count,
                gpu_type: s.resources.gpu_type.clone(),
                gpu_mem_gb: s.resources.gpu_mem_gb,
                allocated: 0,
            })
        })
        .collect();
    for job in st.jobs.values() {
        if job.state != JobState::Running {
            continue;
        }
        if let Some(node) = &job.assigned_node_id {
            if let Some(candidate) = candidates.iter_mut().find(|c| &c.node_id == node) {
                candidate.allocated += job.resources.gpu_count;
            }
        }
    }

    let order: Vec<String> = st.queue.iter().cloned().collect();
    for job_id in order {
        if running >= core.cfg.max_concurrent_jobs {
            break;
        }
        let Some(job) = st.jobs.get(&job_id) else {
            continue;
        };
        if job.state != JobState::Queued || job.is_paused() {
            continue;
        }
        if job.not_before_ms.is_some_and(|nb| nb > now) {
            continue;
        }

        if let Some(policy) = effective_policy(&core.cfg, job) {
            if policy.auto_pause
                && !openclaw_gateway_core::window::any_contains(&policy.windows, policy_now)
            {
                if let Some(job) = st.jobs.get_mut(&job_id) {
                    job.paused = Some(true);
                    job.paused_reason = Some(PauseReason::Policy);
                    job.updated_at_ms = now;
                    paused_ids.push(job_id.clone());
                }
                continue;
            }
        }

        let req = job.resources.clone();
        let Some(best) = select_best_fit(&candidates, &req) else {
            continue;
        };
        candidates[best].allocated += req.gpu_count;
        let node_id = candidates[best].node_id.clone();

        let Some(job) = st.jobs.get_mut(&job_id) else {
            continue;
        };
        let attempt = job.attempts.len() as u32 + 1;
        job.attempts.push(GpuJobAttempt {
            attempt,
            node_id: node_id.clone(),
            started_at_ms: now,
            finished_at_ms: None,
            ok: None,
            exit_code: None,
            timed_out: None,
            stdout_tail: None,
            stderr_tail: None,
            error: None,
        });
        job.state = JobState::Running;
        job.assigned_node_id = Some(node_id.clone());
        job.not_before_ms = None;
        job.updated_at_ms = now;
        running += 1;
        launches.push(AttemptLaunch {
            job_id: job_id.clone(),
            attempt,
            node_id,
            exec: job.exec.clone(),
            plan_dir: monitor::plan_dir_of(&job.exec),
        });
    }

    if !launches.is_empty() || !paused_ids.is_empty() {
        core.mark_dirty(&mut st);
    }
    drop(st);

    for job_id in paused_ids {
        core.emit(SchedulerEvent::Paused { job_id });
    }
    for launch in &launches {
        core.emit(SchedulerEvent::Dispatched {
            job_id: launch.job_id.clone(),
            node_id: launch.node_id.clone(),
            attempt: launch.attempt,
        });
    }
    launches
}

/// Run one attempt to completion: wrap the command when eligible, issue
/// the RPC, and re-enter the critical section with the result.
pub(crate) async fn run_attempt(sched: GpuScheduler, launch: AttemptLaunch) {
    let AttemptLaunch {
        job_id,
        attempt,
        node_id,
        mut exec,
        plan_dir,
    } = launch;

    if wrap::is_wrappable(&exec) {
        if let Some(dir) = plan_dir.as_ref() {
            let inner = exec.command[2].clone();
            exec.command[2] = wrap::wrapper_script(&job_id, attempt, dir, &inner);
            exec.env
                .insert(ExecSpec::WRAPPED_ENV.to_string(), "1".to_string());
        }
    }
    if let Some(dir) = plan_dir.clone() {
        journal(
            dir,
            job_id.clone(),
            "dispatched",
            json!({"nodeId": node_id, "attempt": attempt}),
        );
    }

    let mut params = serde_json::Map::new();
    params.insert("command".into(), json!(exec.command));
    if let Some(v) = &exec.raw_command {
        params.insert("rawCommand".into(), json!(v));
    }
    if let Some(v) = &exec.cwd {
        params.insert("cwd".into(), json!(v));
    }
    if !exec.env.is_empty() {
        params.insert("env".into(), json!(exec.env));
    }
    if let Some(v) = exec.command_timeout_ms {
        params.insert("timeoutMs".into(), json!(v));
    }
    if let Some(v) = exec.approved {
        params.insert("approved".into(), json!(v));
    }
    if let Some(v) = &exec.approval_decision {
        params.insert("approvalDecision".into(), json!(v));
    }

    let outcome = sched
        .core
        .registry
        .invoke(InvokeRequest {
            node_id: node_id.clone(),
            command: "system.run".into(),
            params: Value::Object(params),
            timeout_ms: exec.effective_invoke_timeout_ms(),
            idempotency_key: format!("{job_id}:{attempt}"),
        })
        .await;

    let completion = if outcome.ok {
        let run: RunPayload = outcome
            .payload
            .and_then(|p| serde_json::from_value(p).ok())
            .unwrap_or_default();
        AttemptCompletion {
            ok: run.success,
            exit_code: run.exit_code,
            timed_out: run.timed_out,
            stdout_tail: (!run.stdout.is_empty()).then(|| tail_chars(&run.stdout, TAIL_CHARS)),
            stderr_tail: (!run.stderr.is_empty()).then(|| tail_chars(&run.stderr, TAIL_CHARS)),
            error: None,
        }
    } else {
        let (code, message) = outcome
            .error
            .map(|e| (e.code, e.message))
            .unwrap_or((InvokeErrorCode::Internal, "unknown invoke failure".into()));
        AttemptCompletion {
            ok: false,
            exit_code: None,
            timed_out: code == InvokeErrorCode::Timeout,
            stdout_tail: None,
            stderr_tail: None,
            error: Some(format!("{code}: {message}")),
        }
    };

    apply_completion(&sched, &job_id, attempt, completion).await;
}

/// Apply an attempt result under the critical section and decide the next
/// state. Late arrivals for a job that is gone, no longer running, or no
/// longer on this attempt are discarded.
pub(crate) async fn apply_completion(
    sched: &GpuScheduler,
    job_id: &str,
    attempt: u32,
    done: AttemptCompletion,
) {
    let core = &sched.core;
    let now = now_ms();
    let mut plan_dir: Option<PathBuf> = None;
    let mut terminal_state: Option<JobState> = None;
    {
        let mut st = core.state.lock().await;
        let Some(job) = st.jobs.get_mut(job_id) else {
            tracing::warn!("discarding attempt completion for unknown job {job_id}");
            return;
        };
        if job.state != JobState::Running {
            tracing::warn!(
                "discarding attempt completion for job {job_id} in state {:?}",
                job.state
            );
            return;
        }
        let Some(last) = job.attempts.last_mut() else {
            tracing::warn!("discarding attempt completion for job {job_id} with no attempts");
            return;
        };
        if last.attempt != attempt {
            tracing::warn!(
                "discarding stale completion for job {job_id} attempt {attempt} \
                 (current attempt {})",
                last.attempt
            );
            return;
        }

        last.finished_at_ms = Some(now);
        last.ok = Some(done.ok);
        last.exit_code = done.exit_code;
        last.timed_out = Some(done.timed_out);
        last.stdout_tail = done.stdout_tail.clone();
        last.stderr_tail = done.stderr_tail.clone();
        if let Some(err) = &done.error {
            last.error = Some(err.clone());
        }

        let pause_requested = job.pause_requested.take().unwrap_or(false);

        if job.is_cancel_requested() {
            job.state = JobState::Canceled;
        } else if done.ok {
            job.state = JobState::Succeeded;
        } else if pause_requested {
            job.state = JobState::Queued;
            job.paused = Some(true);
            if job.paused_reason.is_none() {
                job.paused_reason = Some(PauseReason::Manual);
            }
            job.not_before_ms = Some(now);
            job.assigned_node_id = None;
            if let Some(last) = job.attempts.last_mut() {
                if last.error.is_none() {
                    last.error = Some("paused".into());
                }
            }
        } else if attempt < job.max_attempts {
            // Linear backoff capped at 30s.
            job.state = JobState::Queued;
            job.not_before_ms = Some(now + (1_000 * attempt as i64).min(30_000));
            job.assigned_node_id = None;
        } else {
            job.state = JobState::Failed;
        }
        job.updated_at_ms = now;

        if job.state.is_terminal() {
            job.assigned_node_id = None;
            job.paused = None;
            job.paused_reason = None;
            job.not_before_ms = None;
            job.result = Some(JobResult {
                exit_code: done.exit_code,
                timed_out: done.timed_out,
                success: job.state == JobState::Succeeded,
                stdout_tail: done.stdout_tail.clone(),
                stderr_tail: done.stderr_tail.clone(),
            });
            terminal_state = Some(job.state);
        }
        plan_dir = monitor::plan_dir_of(&job.exec);

        core.emit(SchedulerEvent::AttemptFinished {
            job_id: job_id.to_string(),
            attempt,
            ok: done.ok,
        });
        core.mark_dirty(&mut st);
        if terminal_state.is_some() {
            st.queue.retain(|id| id != job_id);
            core.notify_terminal(&mut st, job_id);
        }
    }

    if let Some(dir) = plan_dir {
        let job_id = job_id.to_string();
        let ok = done.ok;
        tokio::task::spawn_blocking(move || {
            monitor::append_job_event(
                &dir,
                &job_id,
                "attempt_finished",
                json!({"attempt": attempt, "ok": ok}),
            );
            if let Some(state) = terminal_state {
                monitor::append_job_event(&dir, &job_id, "terminal", json!({"state": state}));
            }
        });
    }
    core.kick.notify_one();
}

/// Evict the oldest terminal jobs beyond the history limit.
pub(crate) async fn trim_history(sched: &GpuScheduler) {
    let core = &sched.core;
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
    tracing::debug!("trimmed {} terminal gpu jobs from history", evicted.len());
}
