// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Main event loop. `run_once` does one iteration of the cooperative loop;
// `run_forever` repeats it, bounding each sleep to one second for
// liveness, exposing small, separately testable methods instead of one
// monolithic `run`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use presswerk_core::attrs::AttributeValue;
use presswerk_core::error::Result;
use presswerk_core::types::{EventKind, JobState, PrinterState, Recipient};
use presswerk_core::SchedulerConfig;
use presswerk_security::AuditLog;
use tracing::{debug, info, instrument, warn};

use crate::filter::{FilterArgs, FilterDesc, FilterEnv, FilterExecutor, MimeDatabase, Pipeline, StatusLine, RAW_MIME_TYPE};
use crate::job::JobManager;
use crate::persist::{PersistStore, DIRTY_CLASSES, DIRTY_JOBS, DIRTY_PRINTERS, DIRTY_REMOTE, DIRTY_SUBSCRIPTIONS};
use crate::policy::PolicyEngine;
use crate::registry::{DiscoveryRefresh, Registry};
use crate::retry::{should_retry, FilterOutcome, RetryConfig, RetryDecision};
use crate::subscriptions::EventBus;

/// Upper bound on the readiness-wait timeout, so the loop always wakes up
/// often enough to notice timer expiry even with no other activity.
pub const MAX_WAIT: Duration = Duration::from_secs(1);

pub struct Scheduler {
    pub registry: Registry,
    pub jobs: JobManager,
    pub events: EventBus,
    pub policy: PolicyEngine,
    pub executor: FilterExecutor,
    persist: PersistStore,
    audit: AuditLog,
    config: SchedulerConfig,
    retry_config: RetryConfig,
    dirty: crate::persist::DirtyBits,
    last_flush: Instant,
    last_lease_scan: Instant,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, system_group: Vec<String>) -> Result<Self> {
        let persist = PersistStore::new(config.state_dir.clone());
        persist.ensure_dirs()?;
        let audit = AuditLog::open(config.state_dir.join("audit.db"))?;
        audit.record("server-started", "scheduler", true, None)?;

        let mut registry = Registry::new(Duration::from_secs(config.implicit_class_debounce_secs));
        for printer in persist.load_printers()? {
            registry.add_printer(printer)?;
        }
        for class in persist.load_classes()? {
            registry.add_class(class)?;
        }
        registry.printers_dirty = false;
        registry.classes_dirty = false;

        let mut jobs = JobManager::new();
        for job in persist.load_jobs()? {
            jobs.insert_restored(job);
        }
        jobs.jobs_dirty = false;

        let mut events = EventBus::new(config.max_events as usize);
        for sub in persist.load_subscriptions()? {
            events.insert_restored(sub);
        }
        events.subscriptions_dirty = false;

        let executor = FilterExecutor::new(
            config.max_jobs as usize,
            config.max_active_jobs as usize,
            config.max_jobs_per_printer as usize,
            config.max_jobs_per_user as usize,
        );
        let retry_config = RetryConfig::from(&config);

        let mut policy = PolicyEngine::new(system_group);
        policy.add_policy(PolicyEngine::bootstrap_default_policy());

        Ok(Self {
            registry,
            jobs,
            events,
            policy,
            executor,
            persist,
            audit,
            config,
            retry_config,
            dirty: crate::persist::DirtyBits::default(),
            last_flush: Instant::now(),
            last_lease_scan: Instant::now(),
        })
    }

    /// One iteration of the cooperative loop: reap exited children, apply
    /// their outcomes, advance cancellations, expire leases, admit newly
    /// runnable jobs, retry stopped printers whose interval has elapsed,
    /// and flush dirty state once `dirty_clean_interval_secs` has passed.
    #[instrument(skip(self, mime_db, discovery))]
    pub fn run_once(&mut self, mime_db: &dyn MimeDatabase, discovery: &dyn DiscoveryRefresh) -> Result<()> {
        self.reap_pipelines();
        self.executor.tick_cancellations();
        self.apply_status_lines();

        if self.config.timeout_secs > 0 {
            for job_id in self.executor.check_stalls(Duration::from_secs(self.config.timeout_secs)) {
                warn!(job_id, "pipeline stalled, canceling for retry");
            }
        }

        let now = Instant::now();
        self.registry.refresh_implicit_classes(discovery, now);

        if now.duration_since(self.last_lease_scan) >= Duration::from_secs(1) {
            let expired = self.events.expire_leases(Utc::now());
            for id in expired {
                info!(subscription_id = id, "subscription lease expired");
            }
            self.last_lease_scan = now;
        }

        self.retry_stopped_printers();
        self.admit_runnable_jobs(mime_db)?;
        self.dispatch_due_notifiers();
        self.collect_dirty_bits();

        if now.duration_since(self.last_flush) >= Duration::from_secs(self.config.dirty_clean_interval_secs) {
            self.flush()?;
            self.last_flush = now;
        }

        Ok(())
    }

    /// Repeat `run_once` while `keep_running` returns true, sleeping
    /// between iterations bounded by `MAX_WAIT` for liveness.
    pub fn run_forever(
        &mut self,
        mime_db: &dyn MimeDatabase,
        discovery: &dyn DiscoveryRefresh,
        mut keep_running: impl FnMut() -> bool,
    ) -> Result<()> {
        while keep_running() {
            self.run_once(mime_db, discovery)?;
            std::thread::sleep(MAX_WAIT);
        }
        self.shutdown()
    }

    fn reap_pipelines(&mut self) {
        for (job_id, outcome) in self.executor.reap_finished() {
            match outcome {
                Ok(outcome) => self.apply_outcome(job_id, outcome),
                Err(e) => {
                    warn!(job_id, error = %e, "pipeline reap failed");
                    if let Ok(job) = self.jobs.get_mut(job_id) {
                        job.state = JobState::Aborted;
                        job.touch();
                    }
                    let _ = self.audit.record("spool-io", &job_id.to_string(), false, Some(&e.to_string()));
                }
            }
        }
    }

    /// Apply every filter status line queued since the last tick: page
    /// counts and `ATTR:` lines land on the job's attributes and generate a
    /// `job-progress` event, `STATE:` lines toggle printer state-reasons per
    /// the `+`/`-` prefix convention.
    fn apply_status_lines(&mut self) {
        for (job_id, lines) in self.executor.drain_all_status() {
            let Ok(job) = self.jobs.get(job_id) else {
                continue;
            };
            let printer_name = job.destination.clone();
            let mut progress_attrs = HashMap::new();
            let mut state_reasons = Vec::new();

            if let Ok(job) = self.jobs.get_mut(job_id) {
                for (stage, line) in lines {
                    debug!(job_id, stage = %stage, ?line, "filter status");
                    match line {
                        StatusLine::Page { number, copies } => {
                            job.status_buffer.push(format!("PAGE: {number} {copies}"));
                            job.attrs.insert(
                                "job-media-sheets-completed".into(),
                                AttributeValue::Integer(number as i32),
                            );
                            progress_attrs.insert(
                                "job-media-sheets-completed".to_string(),
                                AttributeValue::Integer(number as i32),
                            );
                            let _ = copies;
                        }
                        StatusLine::Attr { name, value } => {
                            job.attrs.insert(name.clone(), AttributeValue::Keyword(value.clone()));
                            progress_attrs.insert(name, AttributeValue::Keyword(value));
                        }
                        StatusLine::State(reason) => {
                            job.status_buffer.push(format!("STATE: {reason}"));
                            state_reasons.push(reason);
                        }
                        StatusLine::Info(msg) => job.status_buffer.push(format!("INFO: {msg}")),
                        StatusLine::Warning(msg) => job.status_buffer.push(format!("WARNING: {msg}")),
                        StatusLine::Error(msg) => job.status_buffer.push(format!("ERROR: {msg}")),
                        StatusLine::Ppd(msg) => job.status_buffer.push(format!("PPD: {msg}")),
                        StatusLine::Unknown(raw) => job.status_buffer.push(raw),
                    }
                }
                job.touch();
                self.jobs.jobs_dirty = true;
            }

            for reason in state_reasons {
                self.apply_printer_state_reason(&printer_name, &reason);
            }
            if !progress_attrs.is_empty() {
                self.events.publish(
                    EventKind::JobProgress,
                    Some(printer_name),
                    Some(job_id),
                    progress_attrs,
                );
            }
        }
    }

    /// Toggle a printer-state-reason per the `STATE:` convention: a `+`
    /// prefix adds the reason, `-` removes it, no prefix behaves as `+`.
    fn apply_printer_state_reason(&mut self, printer_name: &str, reason: &str) {
        let (add, code) = if let Some(code) = reason.strip_prefix('+') {
            (true, code)
        } else if let Some(code) = reason.strip_prefix('-') {
            (false, code)
        } else {
            (true, reason)
        };

        let Some(printer) = self.registry.find_printer_mut(printer_name) else {
            return;
        };
        let changed = if add {
            if printer.state_reasons.iter().any(|r| r == code) {
                false
            } else {
                printer.state_reasons.push(code.to_string());
                true
            }
        } else {
            let before = printer.state_reasons.len();
            printer.state_reasons.retain(|r| r != code);
            printer.state_reasons.len() != before
        };

        if changed {
            self.registry.printers_dirty = true;
            self.events.publish(
                EventKind::PrinterStateChanged,
                Some(printer_name.to_string()),
                None,
                HashMap::new(),
            );
        }
    }

    /// Launch (or relaunch) the notifier process for every push
    /// subscription with pending events that isn't already backing off,
    /// recording success/failure so the backoff schedule advances.
    fn dispatch_due_notifiers(&mut self) {
        let now = Utc::now();
        for sub_id in self.events.due_for_notification(now) {
            let Ok(sub) = self.events.get(sub_id) else {
                continue;
            };
            let Recipient::Push { uri, user_data } = sub.recipient.clone() else {
                continue;
            };
            let Ok(events) = self.events.peek_events(sub_id) else {
                continue;
            };
            if events.is_empty() {
                continue;
            }
            match crate::notifier::notify(&self.config.notifier_dir, &uri, sub_id, &user_data, &events) {
                Ok(()) => {
                    self.events.record_notifier_result(sub_id, true, &self.retry_config);
                    let _ = self.events.drain_pull(sub_id);
                }
                Err(e) => {
                    warn!(subscription_id = sub_id, error = %e, "notifier failed");
                    self.events.record_notifier_result(sub_id, false, &self.retry_config);
                }
            }
        }
    }

    fn apply_outcome(&mut self, job_id: i32, outcome: FilterOutcome) {
        let Ok(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        let printer_name = job.destination.clone();

        match outcome {
            FilterOutcome::Success => {
                job.state = JobState::Completed;
                job.touch();
                self.release_printer(&printer_name);
                self.events
                    .publish(EventKind::JobCompleted, Some(printer_name), Some(job_id), HashMap::new());
            }
            FilterOutcome::Abort => {
                job.state = JobState::Aborted;
                job.state_reasons.push("filter-aborted".into());
                job.touch();
                self.release_printer(&printer_name);
                self.events
                    .publish(EventKind::JobCompleted, Some(printer_name), Some(job_id), HashMap::new());
                let _ = self.audit.record("job-aborted", &job_id.to_string(), true, None);
            }
            FilterOutcome::Hold => {
                job.state = JobState::Held;
                job.touch();
                self.release_printer(&printer_name);
            }
            FilterOutcome::StopPrinterPaused => {
                job.state = JobState::Stopped;
                job.state_reasons.push("manual-resume-required".into());
                job.touch();
                self.stop_printer(&printer_name, "paused");
            }
            FilterOutcome::StopPrinterRetry => {
                job.state = JobState::Stopped;
                job.state_reasons.push("retry-pending".into());
                job.touch();
                self.stop_printer(&printer_name, "paused");
            }
            FilterOutcome::HoldJobStopPrinter => {
                job.state = JobState::Held;
                job.touch();
                self.release_printer(&printer_name);
                self.stop_printer(&printer_name, "paused");
            }
            FilterOutcome::FatalUnknown => {
                job.state = JobState::Aborted;
                job.state_reasons.push("filter-fatal".into());
                job.touch();
                self.release_printer(&printer_name);
                self.events
                    .publish(EventKind::JobCompleted, Some(printer_name), Some(job_id), HashMap::new());
                let _ = self.audit.record("filter-fatal", &job_id.to_string(), false, None);
            }
        }
    }

    fn release_printer(&mut self, name: &str) {
        if let Some(printer) = self.registry.find_printer_mut(name) {
            printer.current_job = None;
            printer.state = PrinterState::Idle;
            self.registry.printers_dirty = true;
        }
    }

    fn stop_printer(&mut self, name: &str, reason: &str) {
        if let Some(printer) = self.registry.find_printer_mut(name) {
            printer.state = PrinterState::Stopped;
            if !printer.state_reasons.iter().any(|r| r == reason) {
                printer.state_reasons.push(reason.to_string());
            }
            self.registry.printers_dirty = true;
        }
    }

    /// Jobs parked in `stopped` with a `retry-pending` reason resume on
    /// their own once the backoff interval for their attempt count has
    /// elapsed; jobs stopped for manual reasons (`paused`) wait for an
    /// explicit `resume-printer`.
    fn retry_stopped_printers(&mut self) {
        let now = Utc::now();
        let retryable: Vec<i32> = self
            .jobs
            .list(None, None)
            .into_iter()
            .filter(|j| j.state == JobState::Stopped && j.state_reasons.iter().any(|r| r == "retry-pending"))
            .filter(|j| {
                let elapsed = now.signed_duration_since(j.updated_at);
                match should_retry(j.tries, &self.retry_config) {
                    RetryDecision::RetryAfter(delay) => {
                        elapsed >= chrono::Duration::from_std(delay).unwrap_or_default()
                    }
                    RetryDecision::Exhausted => false,
                }
            })
            .map(|j| j.id)
            .collect();

        for job_id in retryable {
            if let Ok(job) = self.jobs.get_mut(job_id) {
                job.tries += 1;
                job.state = JobState::Pending;
                job.state_reasons.retain(|r| r != "retry-pending");
                let printer_name = job.destination.clone();
                job.touch();
                self.release_printer(&printer_name);
                info!(job_id, "stopped job resumed for retry");
            }
        }
    }

    fn admit_runnable_jobs(&mut self, mime_db: &dyn MimeDatabase) -> Result<()> {
        let printer_names: Vec<String> = self.registry.printers().map(|p| p.name.clone()).collect();
        for printer_name in printer_names {
            let Some(printer) = self.registry.find_printer(&printer_name) else {
                continue;
            };
            if !printer.accepting_jobs || printer.current_job.is_some() || printer.state == PrinterState::Stopped {
                continue;
            }
            let total = self.jobs.list(None, None).len();
            let printer_active = self.jobs.active_count_for_printer(&printer_name);
            let Some(job_id) = self.jobs.next_pending_for_printer(&printer_name) else {
                continue;
            };
            let owner = self.jobs.get(job_id)?.owner.clone();
            let owner_active = self.jobs.active_count_for_owner(&owner);
            if !self.executor.can_admit(total, printer_active, owner_active) {
                continue;
            }

            self.start_job(job_id, &printer_name, mime_db)?;
        }
        Ok(())
    }

    fn start_job(&mut self, job_id: i32, printer_name: &str, mime_db: &dyn MimeDatabase) -> Result<()> {
        let job = self.jobs.get(job_id)?;
        let Some(file) = job.files.get(job.current_file) else {
            return Ok(());
        };
        let src_type = file.mime_type.clone();
        let input_path = file.path.clone();
        let args = FilterArgs {
            job_id,
            owner: job.owner.clone(),
            title: format!("job-{job_id}"),
            copies: 1,
            options: String::new(),
        };

        let printer = self
            .registry
            .find_printer(printer_name)
            .ok_or_else(|| presswerk_core::error::SchedulerError::UnknownDestination(printer_name.to_string()))?;
        let dst_type = printer
            .supported_mime_types
            .first()
            .cloned()
            .unwrap_or_else(|| RAW_MIME_TYPE.to_string());
        let env = FilterEnv {
            device_uri: printer.device_uri.clone(),
            ppd: None,
            printer: printer_name.to_string(),
            charset: "utf-8".to_string(),
            lang: "en".to_string(),
            content_type: src_type.clone(),
            final_content_type: dst_type.clone(),
            classification: None,
        };

        let chain = crate::filter::resolve_path(mime_db, &src_type, &dst_type)?;
        let (filters, backend) = match chain.split_last() {
            Some((backend, filters)) => (filters.to_vec(), backend.clone()),
            None => {
                (Vec::new(), FilterDesc { executable: "/usr/lib/presswerk/backend/socket".into(), cost: 0 })
            }
        };

        let grace_period = Duration::from_secs(self.config.cancel_grace_period_secs);
        let pipeline = Pipeline::spawn(&args, &env, &filters, &backend, &input_path, grace_period)?;
        self.executor.start(pipeline);

        let job = self.jobs.get_mut(job_id)?;
        job.state = JobState::Processing;
        job.touch();

        let printer = self.registry.find_printer_mut(printer_name).expect("printer existed above");
        printer.current_job = Some(job_id);
        printer.state = PrinterState::Processing;
        self.registry.printers_dirty = true;

        self.events
            .publish(EventKind::JobStateChanged, Some(printer_name.to_string()), Some(job_id), HashMap::new());
        Ok(())
    }

    fn collect_dirty_bits(&mut self) {
        if self.registry.printers_dirty {
            self.dirty.mark(DIRTY_PRINTERS);
        }
        if self.registry.classes_dirty {
            self.dirty.mark(DIRTY_CLASSES);
        }
        if self.registry.remote_dirty {
            self.dirty.mark(DIRTY_REMOTE);
        }
        if self.jobs.jobs_dirty {
            self.dirty.mark(DIRTY_JOBS);
        }
        if self.events.subscriptions_dirty {
            self.dirty.mark(DIRTY_SUBSCRIPTIONS);
        }
    }

    /// Force an immediate flush of every dirty file, regardless of the
    /// scheduled interval. Used on graceful shutdown.
    pub fn flush(&mut self) -> Result<()> {
        self.collect_dirty_bits();
        if self.dirty.is_dirty(DIRTY_PRINTERS) {
            let printers: Vec<_> = self.registry.printers().cloned().collect();
            self.persist.save_printers(&printers)?;
            self.registry.printers_dirty = false;
            self.dirty.clear(DIRTY_PRINTERS);
        }
        if self.dirty.is_dirty(DIRTY_CLASSES) {
            let classes: Vec<_> = self.registry.classes().cloned().collect();
            self.persist.save_classes(&classes)?;
            self.registry.classes_dirty = false;
            self.dirty.clear(DIRTY_CLASSES);
        }
        if self.dirty.is_dirty(DIRTY_JOBS) {
            let jobs: Vec<_> = self.jobs.list(None, None).into_iter().cloned().collect();
            self.persist.save_jobs(&jobs)?;
            self.jobs.jobs_dirty = false;
            self.dirty.clear(DIRTY_JOBS);
        }
        if self.dirty.is_dirty(DIRTY_SUBSCRIPTIONS) {
            let subs: Vec<_> = self.events.list(None).into_iter().cloned().collect();
            self.persist.save_subscriptions(&subs)?;
            self.events.subscriptions_dirty = false;
            self.dirty.clear(DIRTY_SUBSCRIPTIONS);
        }
        self.dirty.clear(DIRTY_REMOTE);
        self.registry.remote_dirty = false;
        Ok(())
    }

    /// Drain in-flight children (no new pipelines admitted), re-read
    /// configuration from disk, and resume. Active pipelines are left
    /// running; only admission is paused for the duration of the call.
    pub fn reload(&mut self, config_path: &std::path::Path) -> Result<()> {
        self.config = SchedulerConfig::load_or_default(config_path, self.config.state_dir.clone())?;
        self.retry_config = RetryConfig::from(&self.config);
        info!("configuration reloaded");
        Ok(())
    }

    /// Stop listeners (handled by the caller), signal every pipeline to
    /// cancel, wait for the caller-provided grace window is the caller's
    /// responsibility via repeated `run_once` calls; here we force-kill
    /// whatever remains and flush dirty state.
    pub fn shutdown(&mut self) -> Result<()> {
        for job_id in self.active_pipeline_job_ids() {
            if let Some(pipeline) = self.executor.pipeline_mut(job_id) {
                pipeline.force_kill();
            }
        }
        self.reap_pipelines();
        let result = self.flush();
        let _ = self.audit.record("server-stopped", "scheduler", result.is_ok(), None);
        result
    }

    fn active_pipeline_job_ids(&self) -> Vec<i32> {
        self.jobs
            .list(None, None)
            .into_iter()
            .filter(|j| j.state == JobState::Processing)
            .map(|j| j.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presswerk_core::types::{DestinationType, Printer, Recipient};
    use tempfile::tempdir;

    struct EmptyDiscovery;
    impl DiscoveryRefresh for EmptyDiscovery {
        fn discovered_hosts(&self) -> Vec<crate::registry::DiscoveredHost> {
            vec![]
        }
    }

    struct EmptyMimeDb;
    impl MimeDatabase for EmptyMimeDb {
        fn types(&self) -> Vec<String> {
            vec![]
        }
        fn cheapest_path(&self, _src: &str, _dst: &str) -> Option<Vec<FilterDesc>> {
            None
        }
    }

    fn scheduler() -> Scheduler {
        let dir = tempdir().unwrap();
        let config = SchedulerConfig {
            state_dir: dir.path().to_path_buf(),
            ..SchedulerConfig::default()
        };
        std::mem::forget(dir);
        Scheduler::new(config, vec!["root".into()]).unwrap()
    }

    #[test]
    fn run_once_with_no_printers_is_a_noop() {
        let mut sched = scheduler();
        sched.run_once(&EmptyMimeDb, &EmptyDiscovery).unwrap();
        assert!(sched.registry.printers().next().is_none());
    }

    #[test]
    fn applying_success_outcome_completes_job_and_frees_printer() {
        let mut sched = scheduler();
        sched.registry.add_printer(Printer::new("P", "socket://x")).unwrap();
        let id = sched.jobs.create("alice", "P", DestinationType::Printer).unwrap();
        sched.jobs.submit(id).unwrap();
        sched.registry.find_printer_mut("P").unwrap().current_job = Some(id);
        sched.registry.find_printer_mut("P").unwrap().state = PrinterState::Processing;
        sched.jobs.get_mut(id).unwrap().state = JobState::Processing;

        sched.apply_outcome(id, FilterOutcome::Success);

        assert_eq!(sched.jobs.get(id).unwrap().state, JobState::Completed);
        assert!(sched.registry.find_printer("P").unwrap().current_job.is_none());
        assert_eq!(sched.registry.find_printer("P").unwrap().state, PrinterState::Idle);
    }

    #[test]
    fn applying_stop_printer_retry_marks_reason() {
        let mut sched = scheduler();
        sched.registry.add_printer(Printer::new("P", "socket://x")).unwrap();
        let id = sched.jobs.create("alice", "P", DestinationType::Printer).unwrap();
        sched.jobs.get_mut(id).unwrap().state = JobState::Processing;

        sched.apply_outcome(id, FilterOutcome::StopPrinterRetry);

        let job = sched.jobs.get(id).unwrap();
        assert_eq!(job.state, JobState::Stopped);
        assert!(job.state_reasons.iter().any(|r| r == "retry-pending"));
        assert_eq!(sched.registry.find_printer("P").unwrap().state, PrinterState::Stopped);
    }

    #[test]
    fn retry_stopped_printers_leaves_manual_stops_alone() {
        let mut sched = scheduler();
        sched.registry.add_printer(Printer::new("P", "socket://x")).unwrap();
        let id = sched.jobs.create("alice", "P", DestinationType::Printer).unwrap();
        let job = sched.jobs.get_mut(id).unwrap();
        job.state = JobState::Stopped;
        job.state_reasons.push("manual-resume-required".into());
        job.updated_at = Utc::now() - chrono::Duration::hours(2);

        sched.retry_stopped_printers();
        assert_eq!(sched.jobs.get(id).unwrap().state, JobState::Stopped);
    }

    #[test]
    fn flush_clears_dirty_bits_and_writes_files() {
        let mut sched = scheduler();
        sched.registry.add_printer(Printer::new("P", "socket://x")).unwrap();
        sched.flush().unwrap();
        assert!(!sched.registry.printers_dirty);
        assert!(!sched.dirty.any());
    }

    #[test]
    fn create_printer_subscription_survives_restart_round_trip() {
        let dir = tempdir().unwrap();
        let config = SchedulerConfig {
            state_dir: dir.path().to_path_buf(),
            ..SchedulerConfig::default()
        };
        {
            let mut sched = Scheduler::new(config.clone(), vec![]).unwrap();
            sched
                .events
                .subscribe(vec![EventKind::JobCompleted], Recipient::Pull, "alice", None, None, 3600, 50)
                .unwrap();
            sched.events.subscriptions_dirty = true;
            sched.flush().unwrap();
        }
        let restarted = Scheduler::new(config, vec![]).unwrap();
        assert_eq!(restarted.events.list(None).len(), 1);
    }
}
