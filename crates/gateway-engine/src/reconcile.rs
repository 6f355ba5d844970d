//! Restart reconciliation: rebuild the state of formerly running jobs
//! from the evidence their worker wrappers left on disk.

use std::path::PathBuf;

use openclaw_gateway_core::now_ms;

use crate::api::{HEARTBEAT_STALE_MS, JobState};
use crate::dispatch::{AttemptCompletion, apply_completion};
use crate::monitor;
use crate::scheduler::GpuScheduler;

/// A job loaded as `running` that must be reconciled against on-disk
/// wrapper evidence before normal scheduling can resume for it.
pub(crate) struct ReconcileEntry {
    pub(crate) job_id: String,
    pub(crate) attempt: u32,
    pub(crate) plan_dir: Option<PathBuf>,
}

pub(crate) async fn run(sched: &GpuScheduler) {
    let entries = {
        let mut st = sched.core.state.lock().await;
        std::mem::take(&mut st.reconcile)
    };
    for entry in entries {
        reconcile_entry(sched, entry).await;
    }
}

async fn reconcile_entry(sched: &GpuScheduler, entry: ReconcileEntry) {
    let Some(plan_dir) = entry.plan_dir.clone() else {
        requeue(sched, &entry, "missing plan dir; requeued").await;
        return;
    };

    let dir = monitor::monitor_dir(&plan_dir, &entry.job_id, entry.attempt);
    let evidence = tokio::task::spawn_blocking(move || monitor::read_attempt_evidence(&dir))
        .await
        .unwrap_or_default();

    if let Some(exit) = evidence.exit {
        if exit.schema_version != 1 {
            tracing::warn!(
                "unexpected exit.json schemaVersion {} for job {}",
                exit.schema_version,
                entry.job_id
            );
        }
        if (!exit.job_id.is_empty() && exit.job_id != entry.job_id)
            || (exit.attempt != 0 && exit.attempt != entry.attempt)
        {
            tracing::warn!(
                "exit.json identity mismatch for job {} attempt {} (found job {:?} attempt {})",
                entry.job_id,
                entry.attempt,
                exit.job_id,
                exit.attempt
            );
        }
        tracing::info!(
            "reconciling job {} attempt {} from exit.json (success={}, ran {}ms)",
            entry.job_id,
            entry.attempt,
            exit.success,
            exit.finished_at_ms.saturating_sub(exit.started_at_ms)
        );
        apply_completion(
            sched,
            &entry.job_id,
            entry.attempt,
            AttemptCompletion {
                ok: exit.success,
                exit_code: exit.exit_code,
                timed_out: exit.timed_out,
                stdout_tail: evidence.stdout_tail,
                stderr_tail: evidence.stderr_tail,
                error: None,
            },
        )
        .await;
    } else if evidence
        .heartbeat_age_ms
        .is_some_and(|age| age <= HEARTBEAT_STALE_MS)
    {
        // The worker is alive; keep the job running and look again on a
        // later pump.
        tracing::debug!(
            "job {} attempt {} heartbeat is fresh; leaving it running",
            entry.job_id,
            entry.attempt
        );
        let mut st = sched.core.state.lock().await;
        if st
            .jobs
            .get(&entry.job_id)
            .is_some_and(|j| j.state == JobState::Running)
        {
            st.reconcile.push(entry);
        }
    } else {
        requeue(sched, &entry, "heartbeat stale; requeued").await;
    }
}

async fn requeue(sched: &GpuScheduler, entry: &ReconcileEntry, reason: &str) {
    tracing::warn!("job {} attempt {}: {reason}", entry.job_id, entry.attempt);
    if entry.attempt == 0 {
        // Loaded as running with no attempt on record; put it straight
        // back in the queue.
        let mut st = sched.core.state.lock().await;
        if let Some(job) = st.jobs.get_mut(&entry.job_id) {
            if job.state == JobState::Running {
                job.state = JobState::Queued;
                job.assigned_node_id = None;
                job.updated_at_ms = now_ms();
            }
        }
        let core = &sched.core;
        core.mark_dirty(&mut st);
        return;
    }
    apply_completion(
        sched,
        &entry.job_id,
        entry.attempt,
        AttemptCompletion {
            ok: false,
            exit_code: None,
            timed_out: false,
            stdout_tail: None,
            stderr_tail: None,
            error: Some(reason.to_string()),
        },
    )
    .await;
}
