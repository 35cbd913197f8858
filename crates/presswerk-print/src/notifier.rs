// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Push-notifier dispatch. A push subscription's pending events are written
// as newline-delimited JSON to a scheme-resolved child process's stdin,
// mirroring the original scheduler's `NotifierDir`-relative executable
// lookup; exit status drives the bus's backoff via `record_notifier_result`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use presswerk_core::error::{Result, SchedulerError};
use presswerk_core::types::Event;
use tracing::instrument;

/// Resolve a push recipient's URI scheme (`mailto:`, `dbus:`, ...) to an
/// executable under `notifier_dir`.
fn resolve_notifier(notifier_dir: &Path, uri: &str) -> Result<PathBuf> {
    let scheme = uri.split_once(':').map(|(s, _)| s).unwrap_or(uri);
    let path = notifier_dir.join(scheme);
    if !path.exists() {
        return Err(SchedulerError::BadRequest(format!(
            "no notifier registered for scheme {scheme}"
        )));
    }
    Ok(path)
}

/// Launch the notifier for `uri`, feed it every pending event as one
/// JSON line on stdin, close stdin, and wait for exit. A nonzero or
/// signaled exit is reported as `FilterFatal` so the caller backs off.
#[instrument(skip(user_data, events))]
pub fn notify(
    notifier_dir: &Path,
    uri: &str,
    subscription_id: i32,
    user_data: &[u8],
    events: &[Event],
) -> Result<()> {
    let executable = resolve_notifier(notifier_dir, uri)?;
    let mut child = Command::new(&executable)
        .arg(uri)
        .env("NOTIFY_SUBSCRIPTION_ID", subscription_id.to_string())
        .env("NOTIFY_USER_DATA_LEN", user_data.len().to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| SchedulerError::FilterFatal(format!("spawn notifier {}: {e}", executable.display())))?;

    if let Some(mut stdin) = child.stdin.take() {
        for event in events {
            let line = serde_json::to_string(event)?;
            if writeln!(stdin, "{line}").is_err() {
                break;
            }
        }
    }

    let status = child
        .wait()
        .map_err(|e| SchedulerError::FilterFatal(format!("wait on notifier: {e}")))?;
    if status.success() {
        Ok(())
    } else {
        Err(SchedulerError::FilterFatal(format!(
            "notifier for subscription {subscription_id} exited with {status}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presswerk_core::types::EventKind;
    use tempfile::tempdir;

    fn sample_event() -> Event {
        Event {
            kind: EventKind::JobCompleted,
            timestamp: chrono::Utc::now(),
            sequence: 1,
            printer: Some("P".into()),
            job: Some(7),
            attrs: std::collections::HashMap::new(),
        }
    }

    #[test]
    fn unregistered_scheme_is_rejected() {
        let dir = tempdir().unwrap();
        let err = notify(dir.path(), "mailto:ops@example.com", 1, &[], &[sample_event()]).unwrap_err();
        assert!(matches!(err, SchedulerError::BadRequest(_)));
    }

    #[test]
    fn registered_executable_runs_and_succeeds() {
        let dir = tempdir().unwrap();
        std::fs::copy("/bin/cat", dir.path().join("mailto")).unwrap();
        let mut perms = std::fs::metadata(dir.path().join("mailto")).unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o755);
        std::fs::set_permissions(dir.path().join("mailto"), perms).unwrap();

        notify(dir.path(), "mailto:ops@example.com", 1, &[], &[sample_event()]).unwrap();
    }
}
