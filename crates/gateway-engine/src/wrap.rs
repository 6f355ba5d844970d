//! Rewrites `sh -lc <script>` commands to run under the worker-side
//! supervisor wrapper.
//!
//! The generated script is a cross-process contract (see the monitor
//! directory layout): it writes `started.json`, redirects the inner script
//! to `stdout.txt`/`stderr.txt`, refreshes `heartbeat.txt`, honors the
//! `cancel.requested`/`pause.requested` markers with a TERM-then-KILL
//! sequence, and emits `exit.json` when the inner script finishes.

use std::path::Path;

use crate::api::{CANCEL_GRACE_MS, ExecSpec, HEARTBEAT_INTERVAL_MS, TAIL_CHARS};
use crate::monitor::{monitor_dir, plan_dir_of};

/// Whether the command can be rewritten: `["sh", "-lc", script]` with an
/// absolute plan directory in the env.
pub(crate) fn is_wrappable(exec: &ExecSpec) -> bool {
    exec.command.len() == 3
        && exec.command[0] == "sh"
        && exec.command[1] == "-lc"
        && plan_dir_of(exec).is_some()
}

/// The supervisor script replacing the original `sh -lc` argument.
pub(crate) fn wrapper_script(
    job_id: &str,
    attempt: u32,
    plan_dir: &Path,
    inner: &str,
) -> String {
    let mon_dir = sh_quote(&monitor_dir(plan_dir, job_id, attempt).display().to_string());
    let job = sh_quote(job_id);
    let tag = heredoc_tag(inner);
    let hb_secs = (HEARTBEAT_INTERVAL_MS / 1000).max(1);
    let grace_secs = (CANCEL_GRACE_MS / 1000).max(1);

    let mut inner = inner.to_string();
    if !inner.ends_with('\n') {
        inner.push('\n');
    }

    format!(
        r#"#!/bin/sh
set -u
MON_DIR={mon_dir}
mkdir -p "$MON_DIR"
STARTED_AT_MS=$(( $(date +%s) * 1000 ))
printf '{{"schemaVersion":1,"jobId":"%s","attempt":%d,"startedAtMs":%d}}\n' {job} {attempt} "$STARTED_AT_MS" > "$MON_DIR/started.json"
cat > "$MON_DIR/original.sh" <<'{tag}'
{inner}{tag}
if command -v setsid >/dev/null 2>&1; then
  setsid sh "$MON_DIR/original.sh" >"$MON_DIR/stdout.txt" 2>"$MON_DIR/stderr.txt" &
else
  sh "$MON_DIR/original.sh" >"$MON_DIR/stdout.txt" 2>"$MON_DIR/stderr.txt" &
fi
CHILD=$!
terminate_child() {{
  kill -TERM -"$CHILD" 2>/dev/null || kill -TERM "$CHILD" 2>/dev/null
  waited=0
  while [ "$waited" -lt {grace_secs} ]; do
    kill -0 "$CHILD" 2>/dev/null || return 0
    sleep 1
    waited=$((waited + 1))
  done
  kill -KILL -"$CHILD" 2>/dev/null || kill -KILL "$CHILD" 2>/dev/null
}}
while kill -0 "$CHILD" 2>/dev/null; do
  date +%s > "$MON_DIR/heartbeat.txt"
  if [ -e "$MON_DIR/cancel.requested" ] || [ -e "$MON_DIR/pause.requested" ]; then
    terminate_child
    break
  fi
  sleep {hb_secs}
done
wait "$CHILD"
EXIT_CODE=$?
FINISHED_AT_MS=$(( $(date +%s) * 1000 ))
SUCCESS=false
[ "$EXIT_CODE" -eq 0 ] && SUCCESS=true
printf '{{"schemaVersion":1,"jobId":"%s","attempt":%d,"startedAtMs":%d,"finishedAtMs":%d,"exitCode":%d,"timedOut":false,"success":%s}}\n' {job} {attempt} "$STARTED_AT_MS" "$FINISHED_AT_MS" "$EXIT_CODE" "$SUCCESS" > "$MON_DIR/exit.json"
tail -c {tail_chars} "$MON_DIR/stdout.txt"
tail -c {tail_chars} "$MON_DIR/stderr.txt" >&2
exit "$EXIT_CODE"
"#,
        tail_chars = TAIL_CHARS,
    )
}

/// Heredoc delimiter guaranteed not to appear in the inner script.
fn heredoc_tag(inner: &str) -> String {
    loop {
        let tag = format!("OPENCLAW_WRAP_{}", uuid::Uuid::new_v4().simple());
        if !inner.contains(&tag) {
            return tag;
        }
    }
}

fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
