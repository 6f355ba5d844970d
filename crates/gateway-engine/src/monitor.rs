//! Per-job monitor directory: scheduler-authored markers and journal,
//! wrapper-authored evidence.
//!
//! Two writers share the directory by writing distinct file names. All
//! scheduler-side operations here are best-effort: writes are mkdir-p plus
//! write-or-log, reads tolerate missing files. Callers must run these
//! blocking helpers off the async executor.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use openclaw_gateway_core::{now_ms, tail_chars};

use crate::api::{ExecSpec, TAIL_CHARS};

pub(crate) const CANCEL_MARKER: &str = "cancel.requested";
pub(crate) const PAUSE_MARKER: &str = "pause.requested";
pub(crate) const EXIT_FILE: &str = "exit.json";
pub(crate) const HEARTBEAT_FILE: &str = "heartbeat.txt";
pub(crate) const STDOUT_FILE: &str = "stdout.txt";
pub(crate) const STDERR_FILE: &str = "stderr.txt";

/// Plan directory of a job, when its env names an absolute one.
pub(crate) fn plan_dir_of(exec: &ExecSpec) -> Option<PathBuf> {
    exec.env
        .get(ExecSpec::PLAN_DIR_ENV)
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
}

pub(crate) fn job_root(plan_dir: &Path, job_id: &str) -> PathBuf {
    plan_dir
        .join("report")
        .join("gpu_scheduler")
        .join("jobs")
        .join(job_id)
}

pub(crate) fn monitor_dir(plan_dir: &Path, job_id: &str, attempt: u32) -> PathBuf {
    job_root(plan_dir, job_id).join(format!("attempt-{attempt}"))
}

/// `exit.json` as written by the worker wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct ExitDoc {
    pub(crate) schema_version: u32,
    pub(crate) job_id: String,
    pub(crate) attempt: u32,
    pub(crate) started_at_ms: i64,
    pub(crate) finished_at_ms: i64,
    pub(crate) exit_code: Option<i64>,
    pub(crate) timed_out: bool,
    pub(crate) success: bool,
}

impl Default for ExitDoc {
    fn default() -> Self {
        Self {
            schema_version: 1,
            job_id: String::new(),
            attempt: 0,
            started_at_ms: 0,
            finished_at_ms: 0,
            exit_code: None,
            timed_out: false,
            success: false,
        }
    }
}

/// Wrapper-authored evidence found under one attempt's monitor directory.
#[derive(Debug, Default)]
pub(crate) struct AttemptEvidence {
    pub(crate) exit: Option<ExitDoc>,
    pub(crate) heartbeat_age_ms: Option<i64>,
    pub(crate) stdout_tail: Option<String>,
    pub(crate) stderr_tail: Option<String>,
}

pub(crate) fn read_attempt_evidence(dir: &Path) -> AttemptEvidence {
    let exit = match fs::read_to_string(dir.join(EXIT_FILE)) {
        Ok(raw) => match serde_json::from_str::<ExitDoc>(&raw) {
            Ok(doc) => Some(doc),
            Err(err) => {
                tracing::warn!("unreadable exit.json under {}: {err}", dir.display());
                None
            }
        },
        Err(_) => None,
    };

    let heartbeat_age_ms = fs::metadata(dir.join(HEARTBEAT_FILE))
        .ok()
        .and_then(|meta| meta.modified().ok())
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .map(|age| age.as_millis().min(i64::MAX as u128) as i64);

    AttemptEvidence {
        exit,
        heartbeat_age_ms,
        stdout_tail: read_file_tail(&dir.join(STDOUT_FILE)),
        stderr_tail: read_file_tail(&dir.join(STDERR_FILE)),
    }
}

/// Last `TAIL_CHARS` characters of a possibly large log file.
fn read_file_tail(path: &Path) -> Option<String> {
    let mut file = fs::File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    let cap = (TAIL_CHARS * 4) as u64;
    if len > cap {
        file.seek(SeekFrom::End(-(cap as i64))).ok()?;
    }
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).ok()?;
    Some(tail_chars(&String::from_utf8_lossy(&buf), TAIL_CHARS))
}

pub(crate) fn write_cancel_marker(dir: &Path, at_ms: i64) {
    write_marker(
        dir,
        CANCEL_MARKER,
        json!({"schemaVersion": 1, "cancelRequestedAtMs": at_ms}),
    );
}

pub(crate) fn write_pause_marker(dir: &Path, at_ms: i64) {
    write_marker(
        dir,
        PAUSE_MARKER,
        json!({"schemaVersion": 1, "pauseRequestedAtMs": at_ms}),
    );
}

fn write_marker(dir: &Path, name: &str, doc: Value) {
    let write = || -> anyhow::Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(name), format!("{doc}\n"))?;
        Ok(())
    };
    if let Err(err) = write() {
        tracing::warn!("failed to write {name} under {}: {err:#}", dir.display());
    }
}

/// Append a lifecycle event to the job's `events.jsonl`.
pub(crate) fn append_job_event(plan_dir: &Path, job_id: &str, kind: &str, extra: Value) {
    let root = job_root(plan_dir, job_id);
    let mut event = json!({
        "schemaVersion": 1,
        "atMs": now_ms(),
        "jobId": job_id,
        "type": kind,
    });
    if let (Some(event_map), Value::Object(extra_map)) = (event.as_object_mut(), extra) {
        event_map.extend(extra_map);
    }

    let write = || -> anyhow::Result<()> {
        use std::io::Write as _;
        fs::create_dir_all(&root)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(root.join("events.jsonl"))?;
        writeln!(file, "{event}")?;
        Ok(())
    };
    if let Err(err) = write() {
        tracing::debug!("failed to append job event for {job_id}: {err:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_dir_requires_an_absolute_path() {
        let mut exec = ExecSpec::default();
        assert_eq!(plan_dir_of(&exec), None);

        exec.env
            .insert(ExecSpec::PLAN_DIR_ENV.to_string(), "relative/dir".to_string());
        assert_eq!(plan_dir_of(&exec), None);

        exec.env
            .insert(ExecSpec::PLAN_DIR_ENV.to_string(), "/abs/plan".to_string());
        assert_eq!(plan_dir_of(&exec), Some(PathBuf::from("/abs/plan")));
    }

    #[test]
    fn monitor_dir_layout_matches_the_contract() {
        let dir = monitor_dir(Path::new("/plan"), "job-1", 2);
        assert_eq!(
            dir,
            PathBuf::from("/plan/report/gpu_scheduler/jobs/job-1/attempt-2")
        );
    }

    #[test]
    fn evidence_reads_tolerate_an_empty_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let evidence = read_attempt_evidence(tmp.path());
        assert!(evidence.exit.is_none());
        assert!(evidence.heartbeat_age_ms.is_none());
        assert!(evidence.stdout_tail.is_none());
    }

    #[test]
    fn evidence_reads_exit_and_tails() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join(EXIT_FILE),
            r#"{"schemaVersion":1,"jobId":"j","attempt":1,"startedAtMs":1,"finishedAtMs":2,"exitCode":0,"timedOut":false,"success":true}"#,
        )
        .unwrap();
        fs::write(tmp.path().join(STDOUT_FILE), "hello\n").unwrap();
        fs::write(tmp.path().join(HEARTBEAT_FILE), "12345\n").unwrap();

        let evidence = read_attempt_evidence(tmp.path());
        let exit = evidence.exit.unwrap();
        assert!(exit.success);
        assert_eq!(exit.exit_code, Some(0));
        assert_eq!(evidence.stdout_tail.as_deref(), Some("hello\n"));
        assert!(evidence.heartbeat_age_ms.unwrap() < 60_000);
    }

    #[test]
    fn markers_carry_their_request_timestamps() {
        let tmp = tempfile::tempdir().unwrap();
        write_pause_marker(tmp.path(), 42);
        write_cancel_marker(tmp.path(), 43);

        let pause = fs::read_to_string(tmp.path().join(PAUSE_MARKER)).unwrap();
        assert!(pause.contains("\"pauseRequestedAtMs\":42"));
        let cancel = fs::read_to_string(tmp.path().join(CANCEL_MARKER)).unwrap();
        assert!(cancel.contains("\"cancelRequestedAtMs\":43"));
    }

    #[test]
    fn job_events_append_as_json_lines() {
        let tmp = tempfile::tempdir().unwrap();
        append_job_event(tmp.path(), "j1", "submitted", json!({}));
        append_job_event(tmp.path(), "j1", "dispatched", json!({"nodeId": "n1"}));

        let raw =
            fs::read_to_string(job_root(tmp.path(), "j1").join("events.jsonl")).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"type\":\"submitted\""));
        assert!(lines[1].contains("\"nodeId\":\"n1\""));
    }
}
