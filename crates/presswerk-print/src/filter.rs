// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Filter pipeline executor. Process supervision wraps each child behind a
// small struct with explicit lifetime-bound handles; argument, environment,
// and file-descriptor layout mirrors the classic CUPS filter/backend
// invocation convention. Cancellation escalation uses `nix::sys::signal` to
// send SIGTERM before escalating to SIGKILL.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use presswerk_core::error::{Result, SchedulerError};
use presswerk_core::types::JobId;
use tracing::{debug, info, instrument, warn};

use crate::retry::FilterOutcome;

/// One stage's executable and its conversion cost, as reported by the
/// externally-supplied MIME database.
#[derive(Debug, Clone)]
pub struct FilterDesc {
    pub executable: PathBuf,
    pub cost: u32,
}

/// Boundary to the externally-supplied MIME type graph. The core never
/// parses MIME conversion rules itself.
pub trait MimeDatabase {
    fn types(&self) -> Vec<String>;
    fn cheapest_path(&self, src_type: &str, dst_type: &str) -> Option<Vec<FilterDesc>>;
}

/// Sentinel destination format for printers with no raster conversion
/// (the printer accepts the source bytes directly).
pub const RAW_MIME_TYPE: &str = "application/vnd.cups-raw";

/// Arguments common to every filter invocation (`cups-exec.c`'s six
/// positional arguments, minus the per-stage input-file slot).
#[derive(Debug, Clone)]
pub struct FilterArgs {
    pub job_id: JobId,
    pub owner: String,
    pub title: String,
    pub copies: u32,
    pub options: String,
}

impl FilterArgs {
    fn positional(&self, input_file: Option<&std::path::Path>) -> Vec<String> {
        vec![
            self.job_id.to_string(),
            self.owner.clone(),
            self.title.clone(),
            self.copies.to_string(),
            self.options.clone(),
            input_file.map(|p| p.display().to_string()).unwrap_or_default(),
        ]
    }
}

/// Environment variables inherited by every stage in the pipeline.
#[derive(Debug, Clone, Default)]
pub struct FilterEnv {
    pub device_uri: String,
    pub ppd: Option<PathBuf>,
    pub printer: String,
    pub charset: String,
    pub lang: String,
    pub content_type: String,
    pub final_content_type: String,
    pub classification: Option<String>,
}

impl FilterEnv {
    fn as_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("DEVICE_URI".to_string(), self.device_uri.clone()),
            ("PRINTER".to_string(), self.printer.clone()),
            ("CHARSET".to_string(), self.charset.clone()),
            ("LANG".to_string(), self.lang.clone()),
            ("CONTENT_TYPE".to_string(), self.content_type.clone()),
            ("FINAL_CONTENT_TYPE".to_string(), self.final_content_type.clone()),
        ];
        if let Some(ppd) = &self.ppd {
            pairs.push(("PPD".to_string(), ppd.display().to_string()));
        }
        if let Some(classification) = &self.classification {
            pairs.push(("CLASSIFICATION".to_string(), classification.clone()));
        }
        pairs
    }
}

/// A tagged line read from a child's stderr, per the status-pipe prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusLine {
    Info(String),
    Warning(String),
    Error(String),
    Page { number: u32, copies: u32 },
    State(String),
    Attr { name: String, value: String },
    Ppd(String),
    Unknown(String),
}

pub fn parse_status_line(raw: &str) -> StatusLine {
    let raw = raw.trim_end();
    if let Some(rest) = raw.strip_prefix("INFO:") {
        StatusLine::Info(rest.trim().to_string())
    } else if let Some(rest) = raw.strip_prefix("WARNING:") {
        StatusLine::Warning(rest.trim().to_string())
    } else if let Some(rest) = raw.strip_prefix("ERROR:") {
        StatusLine::Error(rest.trim().to_string())
    } else if let Some(rest) = raw.strip_prefix("PAGE:") {
        let rest = rest.trim();
        let mut parts = rest.split_whitespace();
        let number = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let copies = parts.next().and_then(|s| s.parse().ok()).unwrap_or(1);
        StatusLine::Page { number, copies }
    } else if let Some(rest) = raw.strip_prefix("STATE:") {
        StatusLine::State(rest.trim().to_string())
    } else if let Some(rest) = raw.strip_prefix("ATTR:") {
        let rest = rest.trim();
        match rest.split_once('=') {
            Some((name, value)) => StatusLine::Attr {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            },
            None => StatusLine::Unknown(raw.to_string()),
        }
    } else if let Some(rest) = raw.strip_prefix("PPD:") {
        StatusLine::Ppd(rest.trim().to_string())
    } else {
        StatusLine::Unknown(raw.to_string())
    }
}

/// One running (or exited) process in a job's pipeline.
struct Stage {
    name: String,
    child: Child,
}

/// A job's live filter₁ | filter₂ | … | backend process tree, plus the
/// merged channel every stage's stderr reader forwards tagged lines into.
pub struct Pipeline {
    pub job_id: JobId,
    stages: Vec<Stage>,
    status_rx: Receiver<(String, StatusLine)>,
    cancel_requested_at: Option<Instant>,
    escalated: bool,
    escalated_at: Option<Instant>,
    force_killed: bool,
    last_activity: Instant,
    stalled: bool,
    cancel_grace_period: Duration,
}

impl Pipeline {
    #[instrument(skip(filters, backend, env, args, input_file))]
    pub fn spawn(
        args: &FilterArgs,
        env: &FilterEnv,
        filters: &[FilterDesc],
        backend: &FilterDesc,
        input_file: &std::path::Path,
        cancel_grace_period: Duration,
    ) -> Result<Self> {
        let (tx, rx): (Sender<(String, StatusLine)>, Receiver<(String, StatusLine)>) = mpsc::channel();
        let mut stages = Vec::with_capacity(filters.len() + 1);
        let mut prev_stdout: Option<std::process::ChildStdout> = None;

        for (index, filter) in filters.iter().enumerate() {
            let stage_name = format!("filter[{index}]");
            let positional = args.positional(if index == 0 { Some(input_file) } else { None });
            let mut cmd = Command::new(&filter.executable);
            cmd.args(&positional).envs(env.as_pairs());
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            cmd.stdin(match prev_stdout.take() {
                Some(stdout) => Stdio::from(stdout),
                None => Stdio::null(),
            });

            let mut child = cmd
                .spawn()
                .map_err(|e| SchedulerError::FilterFatal(format!("spawn {stage_name}: {e}")))?;
            spawn_status_reader(&stage_name, child.stderr.take(), tx.clone());
            prev_stdout = child.stdout.take();
            stages.push(Stage { name: stage_name, child });
        }

        let backend_positional = args.positional(if filters.is_empty() { Some(input_file) } else { None });
        let mut backend_cmd = Command::new(&backend.executable);
        backend_cmd.args(&backend_positional).envs(env.as_pairs());
        backend_cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        backend_cmd.stdin(match prev_stdout.take() {
            Some(stdout) => Stdio::from(stdout),
            None => Stdio::null(),
        });
        let mut backend_child = backend_cmd
            .spawn()
            .map_err(|e| SchedulerError::FilterFatal(format!("spawn backend: {e}")))?;
        spawn_status_reader("backend", backend_child.stderr.take(), tx.clone());
        // The backend's stdout is the back-channel; a real implementation
        // would fan it into the job's back-channel ring. Draining it here
        // keeps the backend from blocking on a full pipe.
        spawn_backchannel_drain(backend_child.stdout.take());
        stages.push(Stage {
            name: "backend".to_string(),
            child: backend_child,
        });

        info!(job_id = args.job_id, stages = stages.len(), "pipeline spawned");
        Ok(Self {
            job_id: args.job_id,
            stages,
            status_rx: rx,
            cancel_requested_at: None,
            escalated: false,
            escalated_at: None,
            force_killed: false,
            last_activity: Instant::now(),
            stalled: false,
            cancel_grace_period,
        })
    }

    /// Drain every tagged status line queued since the last poll. Any line
    /// counts as a progress signal, resetting the stall timer.
    pub fn drain_status(&mut self) -> Vec<(String, StatusLine)> {
        let lines: Vec<_> = self.status_rx.try_iter().collect();
        if !lines.is_empty() {
            self.last_activity = Instant::now();
        }
        lines
    }

    /// Whether `timeout` has elapsed since the last status line was seen.
    pub fn is_stalled(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() >= timeout
    }

    /// Mark this pipeline as stalled and begin cancellation. Once every
    /// stage reaps, `try_reap` reports `StopPrinterRetry` regardless of the
    /// backend's actual exit code, since the cancellation was ours, not the
    /// filter's.
    pub fn mark_stalled(&mut self) {
        if !self.stalled {
            self.stalled = true;
            self.request_cancel();
        }
    }

    /// Begin cancellation: signal the backend first so it can flush,
    /// per the cancellation semantics.
    pub fn request_cancel(&mut self) {
        if self.cancel_requested_at.is_some() {
            return;
        }
        self.cancel_requested_at = Some(Instant::now());
        if let Some(backend) = self.stages.last_mut() {
            signal_child(backend, Signal::SIGTERM);
        }
    }

    /// Call once per loop tick while a cancellation is pending. After the
    /// grace period elapses without full reaping, escalates to a SIGTERM of
    /// the whole pipeline; after a second grace period with stages still
    /// alive, escalates further to a forceful kill.
    pub fn tick_cancel(&mut self) {
        let Some(requested_at) = self.cancel_requested_at else {
            return;
        };
        if self.force_killed {
            return;
        }
        if !self.escalated {
            if requested_at.elapsed() >= self.cancel_grace_period {
                warn!(job_id = self.job_id, "cancellation grace period elapsed, escalating");
                for stage in &mut self.stages {
                    signal_child(stage, Signal::SIGTERM);
                }
                self.escalated = true;
                self.escalated_at = Some(Instant::now());
            }
            return;
        }
        let escalated_at = self.escalated_at.expect("escalated implies escalated_at is set");
        if escalated_at.elapsed() >= self.cancel_grace_period {
            warn!(job_id = self.job_id, "stages still alive after SIGTERM, force-killing");
            self.force_kill();
        }
    }

    /// Force-kill every stage regardless of grace period; used by shutdown
    /// and by `tick_cancel`'s final escalation tier.
    pub fn force_kill(&mut self) {
        for stage in &mut self.stages {
            let _ = stage.child.kill();
        }
        self.force_killed = true;
    }

    pub fn is_force_killed(&self) -> bool {
        self.force_killed
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested_at.is_some()
    }

    /// Non-blocking check of every stage. Returns `Some(outcome)` once
    /// every stage has exited (reaped), derived from the backend's exit
    /// code, which carries the job-transition signal per the exit-code
    /// table. Returns `None` while any stage is still running.
    pub fn try_reap(&mut self) -> Result<Option<FilterOutcome>> {
        let mut backend_code = None;
        for (index, stage) in self.stages.iter_mut().enumerate() {
            match stage.child.try_wait() {
                Ok(Some(status)) => {
                    let code = status.code().unwrap_or(-1);
                    debug!(job_id = self.job_id, stage = %stage.name, code, "stage exited");
                    if index + 1 == self.stages.len() {
                        backend_code = Some(if status.code().is_some() { code } else { 255 });
                    }
                }
                Ok(None) => return Ok(None),
                Err(e) => {
                    return Err(SchedulerError::FilterFatal(format!(
                        "wait on {}: {e}",
                        stage.name
                    )))
                }
            }
        }
        if self.stalled {
            return Ok(Some(FilterOutcome::StopPrinterRetry));
        }
        Ok(backend_code.map(FilterOutcome::from_exit_code))
    }
}

fn signal_child(stage: &mut Stage, sig: Signal) {
    let pid = Pid::from_raw(stage.child.id() as i32);
    if let Err(e) = signal::kill(pid, sig) {
        warn!(stage = %stage.name, error = %e, "failed to signal stage");
    }
}

fn spawn_status_reader(stage: &str, stderr: Option<std::process::ChildStderr>, tx: Sender<(String, StatusLine)>) {
    let Some(stderr) = stderr else { return };
    let stage = stage.to_string();
    std::thread::Builder::new()
        .name(format!("status-{stage}"))
        .spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines().map_while(std::result::Result::ok) {
                let parsed = parse_status_line(&line);
                if tx.send((stage.clone(), parsed)).is_err() {
                    break;
                }
            }
        })
        .expect("failed to spawn status reader thread");
}

fn spawn_backchannel_drain(stdout: Option<std::process::ChildStdout>) {
    let Some(stdout) = stdout else { return };
    std::thread::Builder::new()
        .name("backchannel".to_string())
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut buf = [0u8; 4096];
            use std::io::Read;
            while let Ok(n) = reader.read(&mut buf) {
                if n == 0 {
                    break;
                }
            }
        })
        .expect("failed to spawn back-channel drain thread");
}

/// Concurrency caps and the set of currently-running pipelines.
pub struct FilterExecutor {
    pub max_jobs: usize,
    pub max_active_jobs: usize,
    pub max_jobs_per_printer: usize,
    pub max_jobs_per_user: usize,
    pipelines: std::collections::HashMap<JobId, Pipeline>,
}

impl FilterExecutor {
    pub fn new(max_jobs: usize, max_active_jobs: usize, max_jobs_per_printer: usize, max_jobs_per_user: usize) -> Self {
        Self {
            max_jobs,
            max_active_jobs,
            max_jobs_per_printer,
            max_jobs_per_user,
            pipelines: std::collections::HashMap::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.pipelines.len()
    }

    /// A limit of `0` means unlimited, matching the original scheduler's
    /// `MaxJobsPerPrinter`/`MaxJobsPerUser` convention.
    pub fn can_admit(&self, total_jobs: usize, printer_active: usize, owner_active: usize) -> bool {
        let under = |count: usize, limit: usize| limit == 0 || count < limit;
        under(total_jobs, self.max_jobs)
            && under(self.pipelines.len(), self.max_active_jobs)
            && under(printer_active, self.max_jobs_per_printer)
            && under(owner_active, self.max_jobs_per_user)
    }

    pub fn start(&mut self, pipeline: Pipeline) {
        self.pipelines.insert(pipeline.job_id, pipeline);
    }

    pub fn pipeline_mut(&mut self, job_id: JobId) -> Option<&mut Pipeline> {
        self.pipelines.get_mut(&job_id)
    }

    pub fn remove(&mut self, job_id: JobId) -> Option<Pipeline> {
        self.pipelines.remove(&job_id)
    }

    /// Poll every running pipeline for exit, returning jobs that fully
    /// reaped this tick along with their terminal filter outcome.
    pub fn reap_finished(&mut self) -> Vec<(JobId, Result<FilterOutcome>)> {
        let mut finished = Vec::new();
        let job_ids: Vec<JobId> = self.pipelines.keys().copied().collect();
        for job_id in job_ids {
            let outcome = {
                let pipeline = self.pipelines.get_mut(&job_id).expect("job_id from own keys");
                pipeline.try_reap()
            };
            match outcome {
                Ok(Some(outcome)) => {
                    self.pipelines.remove(&job_id);
                    finished.push((job_id, Ok(outcome)));
                }
                Ok(None) => {}
                Err(e) => {
                    self.pipelines.remove(&job_id);
                    finished.push((job_id, Err(e)));
                }
            }
        }
        finished
    }

    /// Advance cancellation escalation timers for every pipeline with a
    /// pending cancel request.
    pub fn tick_cancellations(&mut self) {
        for pipeline in self.pipelines.values_mut() {
            if pipeline.is_cancel_requested() {
                pipeline.tick_cancel();
            }
        }
    }

    /// Drain queued status lines from every running pipeline, keyed by job
    /// id. Also resets each pipeline's stall timer as a side effect.
    pub fn drain_all_status(&mut self) -> Vec<(JobId, Vec<(String, StatusLine)>)> {
        self.pipelines
            .iter_mut()
            .map(|(job_id, pipeline)| (*job_id, pipeline.drain_status()))
            .filter(|(_, lines)| !lines.is_empty())
            .collect()
    }

    /// Begin cancellation for every pipeline that has gone `timeout`
    /// without a progress signal, returning the job ids affected.
    pub fn check_stalls(&mut self, timeout: Duration) -> Vec<JobId> {
        let mut stalled = Vec::new();
        for (job_id, pipeline) in self.pipelines.iter_mut() {
            if !pipeline.is_cancel_requested() && pipeline.is_stalled(timeout) {
                pipeline.mark_stalled();
                stalled.push(*job_id);
            }
        }
        stalled
    }
}

/// Resolve the conversion chain for a job's current document against a
/// printer's native format, returning `NoFilterPath` when the MIME graph
/// has no route.
pub fn resolve_path(
    mime_db: &dyn MimeDatabase,
    src_type: &str,
    dst_type: &str,
) -> Result<Vec<FilterDesc>> {
    mime_db
        .cheapest_path(src_type, dst_type)
        .ok_or_else(|| SchedulerError::NoFilterPath {
            src: src_type.to_string(),
            dst: dst_type.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDb;
    impl MimeDatabase for FixedDb {
        fn types(&self) -> Vec<String> {
            vec!["application/pdf".into(), RAW_MIME_TYPE.into()]
        }

        fn cheapest_path(&self, src: &str, dst: &str) -> Option<Vec<FilterDesc>> {
            if src == "application/pdf" && dst == RAW_MIME_TYPE {
                Some(vec![FilterDesc {
                    executable: "/usr/lib/presswerk/filter/pdftoraster".into(),
                    cost: 100,
                }])
            } else {
                None
            }
        }
    }

    #[test]
    fn status_line_prefixes_parse() {
        assert_eq!(parse_status_line("INFO: starting up"), StatusLine::Info("starting up".into()));
        assert_eq!(
            parse_status_line("WARNING: low toner"),
            StatusLine::Warning("low toner".into())
        );
        assert_eq!(parse_status_line("ERROR: jam"), StatusLine::Error("jam".into()));
        assert_eq!(
            parse_status_line("PAGE: 3 2"),
            StatusLine::Page { number: 3, copies: 2 }
        );
        assert_eq!(parse_status_line("STATE: +paused"), StatusLine::State("+paused".into()));
        assert_eq!(
            parse_status_line("ATTR: marker-levels=42"),
            StatusLine::Attr {
                name: "marker-levels".into(),
                value: "42".into()
            }
        );
        assert_eq!(parse_status_line("PPD: ColorModel=Gray"), StatusLine::Ppd("ColorModel=Gray".into()));
        assert_eq!(parse_status_line("no prefix here"), StatusLine::Unknown("no prefix here".into()));
    }

    #[test]
    fn resolve_path_succeeds_for_known_route() {
        let db = FixedDb;
        let path = resolve_path(&db, "application/pdf", RAW_MIME_TYPE).unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].cost, 100);
    }

    #[test]
    fn resolve_path_fails_for_unknown_route() {
        let db = FixedDb;
        let err = resolve_path(&db, "image/jpeg", RAW_MIME_TYPE).unwrap_err();
        assert!(matches!(err, SchedulerError::NoFilterPath { .. }));
    }

    #[test]
    fn caps_reject_when_any_limit_reached() {
        let executor = FilterExecutor::new(10, 2, 1, 1);
        assert!(executor.can_admit(0, 0, 0));
        assert!(!executor.can_admit(0, 1, 0));
        assert!(!executor.can_admit(0, 0, 1));
    }

    #[test]
    fn filter_args_positional_layout() {
        let args = FilterArgs {
            job_id: 7,
            owner: "alice".into(),
            title: "report.pdf".into(),
            copies: 2,
            options: "media=letter".into(),
        };
        let positional = args.positional(Some(std::path::Path::new("/spool/d00007-001")));
        assert_eq!(
            positional,
            vec!["7", "alice", "report.pdf", "2", "media=letter", "/spool/d00007-001"]
        );
    }

    #[test]
    fn filter_env_includes_ppd_only_when_present() {
        let env = FilterEnv {
            device_uri: "socket://127.0.0.1:9100".into(),
            ppd: None,
            printer: "P".into(),
            charset: "utf-8".into(),
            lang: "en".into(),
            content_type: "application/pdf".into(),
            final_content_type: RAW_MIME_TYPE.into(),
            classification: None,
        };
        let pairs = env.as_pairs();
        assert!(!pairs.iter().any(|(k, _)| k == "PPD"));
        assert!(pairs.iter().any(|(k, v)| k == "DEVICE_URI" && v == "socket://127.0.0.1:9100"));
    }

    fn spawn_cat_pipeline(grace_period: Duration) -> Pipeline {
        let args = FilterArgs {
            job_id: 1,
            owner: "alice".into(),
            title: "t".into(),
            copies: 1,
            options: String::new(),
        };
        let env = FilterEnv::default();
        let backend = FilterDesc {
            executable: "/bin/cat".into(),
            cost: 0,
        };
        Pipeline::spawn(&args, &env, &[], &backend, std::path::Path::new("/dev/null"), grace_period)
            .expect("spawn /bin/cat")
    }

    #[test]
    fn pipeline_reports_stalled_after_timeout_with_no_progress() {
        let mut pipeline = spawn_cat_pipeline(Duration::from_secs(5));
        assert!(!pipeline.is_stalled(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(pipeline.is_stalled(Duration::from_millis(1)));
    }

    #[test]
    fn mark_stalled_requests_cancel_and_outcome_overrides_exit_code() {
        let mut pipeline = spawn_cat_pipeline(Duration::from_millis(10));
        pipeline.mark_stalled();
        assert!(pipeline.is_cancel_requested());

        let deadline = Instant::now() + Duration::from_secs(2);
        let outcome = loop {
            if let Some(outcome) = pipeline.try_reap().unwrap() {
                break outcome;
            }
            assert!(Instant::now() < deadline, "pipeline did not reap in time");
            std::thread::sleep(Duration::from_millis(10));
        };
        assert!(matches!(outcome, FilterOutcome::StopPrinterRetry));
    }

    #[test]
    fn tick_cancel_escalates_after_grace_period() {
        let mut pipeline = spawn_cat_pipeline(Duration::from_millis(1));
        pipeline.request_cancel();
        std::thread::sleep(Duration::from_millis(20));
        pipeline.tick_cancel();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if pipeline.try_reap().unwrap().is_some() {
                break;
            }
            assert!(Instant::now() < deadline, "pipeline did not reap in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn tick_cancel_force_kills_when_stages_ignore_sigterm_escalation() {
        let mut pipeline = spawn_cat_pipeline(Duration::from_millis(1));
        pipeline.request_cancel();
        std::thread::sleep(Duration::from_millis(20));
        pipeline.tick_cancel();
        assert!(!pipeline.is_force_killed());

        std::thread::sleep(Duration::from_millis(20));
        pipeline.tick_cancel();
        assert!(pipeline.is_force_killed());

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if pipeline.try_reap().unwrap().is_some() {
                break;
            }
            assert!(Instant::now() < deadline, "pipeline did not reap in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
