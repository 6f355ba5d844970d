//! Restart behavior: persisted-state loading, reconciliation from
//! wrapper evidence, and persistence round trips.

mod common;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use openclaw_gateway_engine::{
    ExecSpec, GpuJob, GpuJobAttempt, JobState, NodeRegistry, ResourceRequest, SchedulerConfig,
};

use common::*;

fn persisted_config(state_dir: &Path) -> SchedulerConfig {
    SchedulerConfig {
        persist: true,
        state_dir: Some(state_dir.to_path_buf()),
        poll_interval_ms: 25,
        ..SchedulerConfig::default()
    }
}

fn running_job(job_id: &str, plan_dir: &Path, node_id: &str, max_attempts: u32) -> GpuJob {
    let mut env = BTreeMap::new();
    env.insert(
        ExecSpec::PLAN_DIR_ENV.to_string(),
        plan_dir.display().to_string(),
    );
    GpuJob {
        job_id: job_id.to_string(),
        created_at_ms: 1,
        updated_at_ms: 2,
        state: JobState::Running,
        resources: ResourceRequest::default(),
        exec: ExecSpec {
            command: vec!["sh".into(), "-lc".into(), "true".into()],
            env,
            ..ExecSpec::default()
        },
        max_attempts,
        attempts: vec![GpuJobAttempt {
            attempt: 1,
            node_id: node_id.to_string(),
            started_at_ms: 1,
            finished_at_ms: None,
            ok: None,
            exit_code: None,
            timed_out: None,
            stdout_tail: None,
            stderr_tail: None,
            error: None,
        }],
        assigned_node_id: Some(node_id.to_string()),
        not_before_ms: None,
        paused: None,
        paused_reason: None,
        pause_requested: None,
        cancel_requested: None,
        policy: None,
        result: None,
    }
}

fn seed_state_file(state_dir: &Path, jobs: &[GpuJob]) {
    let path = state_dir.join("gateway/gpu-scheduler/jobs.json");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let doc = json!({"version": 1, "jobs": jobs});
    std::fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
}

fn monitor_dir(plan_dir: &Path, job_id: &str, attempt: u32) -> std::path::PathBuf {
    plan_dir
        .join("report/gpu_scheduler/jobs")
        .join(job_id)
        .join(format!("attempt-{attempt}"))
}

#[tokio::test]
async fn restart_applies_exit_json_without_issuing_new_rpcs() {
    let state = tempfile::tempdir().unwrap();
    let plan = tempfile::tempdir().unwrap();
    let job = running_job("job-exit", plan.path(), "gpu-1", 1);
    seed_state_file(state.path(), &[job]);

    let dir = monitor_dir(plan.path(), "job-exit", 1);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("exit.json"),
        r#"{"schemaVersion":1,"jobId":"job-exit","attempt":1,"startedAtMs":1,"finishedAtMs":2,"exitCode":0,"timedOut":false,"success":true}"#,
    )
    .unwrap();
    std::fs::write(dir.join("stdout.txt"), "hello\n").unwrap();

    let registry = Arc::new(NodeRegistry::new());
    let node = connect_node(&registry, gpu_session("gpu-1", 1), always(ok_payload("")));
    let sched = scheduler_over(registry, persisted_config(state.path()));
    sched.start().await;

    let done = sched.wait("job-exit", SPEC_WAIT_MS).await.unwrap();
    assert_eq!(done.state, JobState::Succeeded);
    let result = done.result.unwrap();
    assert!(result.success);
    assert_eq!(result.exit_code, Some(0));
    assert!(result.stdout_tail.unwrap().contains("hello"));
    assert_eq!(done.attempts[0].ok, Some(true));
    assert_eq!(node.count(), 0);
    sched.stop();
}

#[tokio::test]
async fn restart_requeues_jobs_with_a_stale_heartbeat() {
    let state = tempfile::tempdir().unwrap();
    let plan = tempfile::tempdir().unwrap();
    let job = running_job("job-stale", plan.path(), "gpu-1", 2);
    seed_state_file(state.path(), &[job]);
    // Monitor dir exists but carries neither exit.json nor a heartbeat.
    std::fs::create_dir_all(monitor_dir(plan.path(), "job-stale", 1)).unwrap();

    let registry = Arc::new(NodeRegistry::new());
    let sched = scheduler_over(registry, persisted_config(state.path()));
    sched.start().await;

    assert!(
        wait_for(Duration::from_secs(5), || async {
            sched.get("job-stale").await.unwrap().state == JobState::Queued
        })
        .await
    );
    let j = sched.get("job-stale").await.unwrap();
    assert!(j.assigned_node_id.is_none());
    assert_eq!(j.attempts.len(), 1);
    assert!(j.attempts[0].error.as_deref().unwrap().contains("heartbeat stale"));
    sched.stop();
}

#[tokio::test]
async fn restart_keeps_jobs_with_a_fresh_heartbeat_running() {
    let state = tempfile::tempdir().unwrap();
    let plan = tempfile::tempdir().unwrap();
    let job = running_job("job-alive", plan.path(), "gpu-1", 1);
    seed_state_file(state.path(), &[job]);

    let dir = monitor_dir(plan.path(), "job-alive", 1);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("heartbeat.txt"), "1700000000\n").unwrap();

    let registry = Arc::new(NodeRegistry::new());
    let sched = scheduler_over(registry, persisted_config(state.path()));
    sched.start().await;

    // The worker looks alive: the job must stay running.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sched.get("job-alive").await.unwrap().state, JobState::Running);

    // A later reconciliation pass picks up the exit evidence.
    std::fs::write(
        dir.join("exit.json"),
        r#"{"schemaVersion":1,"jobId":"job-alive","attempt":1,"startedAtMs":1,"finishedAtMs":2,"exitCode":0,"timedOut":false,"success":true}"#,
    )
    .unwrap();
    let done = sched.wait("job-alive", SPEC_WAIT_MS).await.unwrap();
    assert_eq!(done.state, JobState::Succeeded);
    sched.stop();
}

#[tokio::test]
async fn restart_requeues_running_jobs_without_a_plan_dir() {
    let state = tempfile::tempdir().unwrap();
    let plan = tempfile::tempdir().unwrap();
    let mut job = running_job("job-nodir", plan.path(), "gpu-1", 2);
    job.exec.env.clear();
    seed_state_file(state.path(), &[job]);

    let registry = Arc::new(NodeRegistry::new());
    let sched = scheduler_over(registry, persisted_config(state.path()));
    sched.start().await;

    assert!(
        wait_for(Duration::from_secs(5), || async {
            sched.get("job-nodir").await.unwrap().state == JobState::Queued
        })
        .await
    );
    let j = sched.get("job-nodir").await.unwrap();
    assert!(j.attempts[0].error.as_deref().unwrap().contains("missing plan dir"));
    sched.stop();
}

#[tokio::test]
async fn state_survives_a_full_stop_start_cycle() {
    let state = tempfile::tempdir().unwrap();
    let path = state.path().join("gateway/gpu-scheduler/jobs.json");

    let registry = Arc::new(NodeRegistry::new());
    let sched = scheduler_over(registry, persisted_config(state.path()));
    sched.start().await;
    let a = sched.submit(simple_request(1)).await.unwrap();
    let b = sched.submit(simple_request(2)).await.unwrap();

    assert!(
        wait_for(Duration::from_secs(5), || async {
            std::fs::read_to_string(&path)
                .map(|raw| raw.contains(&a.job_id) && raw.contains(&b.job_id))
                .unwrap_or(false)
        })
        .await
    );
    sched.stop();

    let raw = std::fs::read_to_string(&path).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(doc["version"], json!(1));
    assert_eq!(doc["jobs"].as_array().unwrap().len(), 2);
    // Persisted layout is camelCase.
    assert!(raw.contains("\"jobId\""));
    assert!(raw.contains("\"createdAtMs\""));

    // A fresh instance over the same path resumes the queue and runs it.
    let registry = Arc::new(NodeRegistry::new());
    let node = connect_node(&registry, gpu_session("gpu-4", 4), always(ok_payload("")));
    let sched = scheduler_over(registry, persisted_config(state.path()));
    sched.start().await;

    let a_done = sched.wait(&a.job_id, SPEC_WAIT_MS).await.unwrap();
    let b_done = sched.wait(&b.job_id, SPEC_WAIT_MS).await.unwrap();
    assert_eq!(a_done.state, JobState::Succeeded);
    assert_eq!(b_done.state, JobState::Succeeded);
    assert_eq!(node.count(), 2);
    sched.stop();
}
