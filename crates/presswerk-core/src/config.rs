// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Scheduler configuration and its tunables.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Persistent scheduler settings, loadable from an optional `scheduler.json`
/// under `state_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Directory holding the five configuration files and the spool.
    pub state_dir: PathBuf,
    /// Maximum number of jobs (any state) retained at once.
    pub max_jobs: u32,
    /// Maximum number of jobs simultaneously processing across all printers.
    pub max_active_jobs: u32,
    /// Maximum number of jobs simultaneously processing on one printer.
    pub max_jobs_per_printer: u32,
    /// Maximum number of jobs simultaneously processing for one user.
    pub max_jobs_per_user: u32,
    /// Seconds between scheduled dirty-file flushes.
    pub dirty_clean_interval_secs: u64,
    /// Maximum automatic retries for a transient backend failure.
    pub fax_retry_limit: u32,
    /// Seconds between automatic retries of a transient backend failure.
    pub fax_retry_interval_secs: u64,
    /// Seconds without a progress signal from a running pipeline before it
    /// is considered stalled and stopped for retry.
    pub timeout_secs: u64,
    /// Debounce window, in seconds, before recomputing implicit-class
    /// membership after a discovery change.
    pub implicit_class_debounce_secs: u64,
    /// Depth of the global and per-subscription event rings.
    pub max_events: u32,
    /// Maximum number of live subscriptions.
    pub max_subscriptions: u32,
    /// Default lease duration granted to a new subscription, in seconds.
    pub default_lease_duration_secs: u64,
    /// Grace period between canceling a pipeline's backend and escalating
    /// to the whole pipeline, in seconds.
    pub cancel_grace_period_secs: u64,
    /// Directory of scheme-named notifier executables, mirroring the
    /// original scheduler's `NotifierDir` directive.
    pub notifier_dir: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/spool/presswerk"),
            max_jobs: 500,
            max_active_jobs: 0,
            max_jobs_per_printer: 0,
            max_jobs_per_user: 0,
            dirty_clean_interval_secs: 60,
            fax_retry_limit: 5,
            fax_retry_interval_secs: 300,
            timeout_secs: 300,
            implicit_class_debounce_secs: 5,
            max_events: 100,
            max_subscriptions: 100,
            default_lease_duration_secs: 86_400,
            cancel_grace_period_secs: 5,
            notifier_dir: PathBuf::from("/usr/lib/presswerk/notifier"),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from `path` (JSON) if it exists, falling back to
    /// defaults with only `state_dir` overridden.
    pub fn load_or_default(path: &std::path::Path, state_dir: PathBuf) -> crate::Result<Self> {
        if !path.exists() {
            return Ok(Self {
                state_dir,
                ..Self::default()
            });
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tunables() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.fax_retry_limit, 5);
        assert_eq!(cfg.fax_retry_interval_secs, 300);
        assert_eq!(cfg.dirty_clean_interval_secs, 60);
        assert_eq!(cfg.implicit_class_debounce_secs, 5);
        assert_eq!(cfg.max_events, 100);
        assert_eq!(cfg.max_subscriptions, 100);
        assert_eq!(cfg.default_lease_duration_secs, 86_400);
    }

    #[test]
    fn load_or_default_falls_back_when_missing() {
        let cfg = SchedulerConfig::load_or_default(
            std::path::Path::new("/nonexistent/scheduler.json"),
            PathBuf::from("/tmp/presswerk-test"),
        )
        .unwrap();
        assert_eq!(cfg.state_dir, PathBuf::from("/tmp/presswerk-test"));
        assert_eq!(cfg.max_jobs, 500);
    }
}
