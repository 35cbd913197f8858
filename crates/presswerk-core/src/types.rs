// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the scheduler: printers, classes, jobs,
// subscriptions, events and policies.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attrs::AttributeValue;

/// Integer job identifier, monotonically allocated and wrapped at
/// `JOB_ID_CEILING`, skipping any id still present among live jobs.
pub type JobId = i32;

/// Printer/job state-reason tags such as `media-empty`, `paused`,
/// `toner-low`. Stored as plain strings (an open vocabulary, per the IPP
/// `printer-state-reasons` keyword set).
pub type ReasonCode = String;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    PendingHeld,
    Held,
    Processing,
    Stopped,
    Canceled,
    Aborted,
    Completed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Aborted | JobState::Canceled)
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobState::Processing | JobState::Stopped)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::PendingHeld => "pending-held",
            JobState::Held => "held",
            JobState::Processing => "processing",
            JobState::Stopped => "stopped",
            JobState::Canceled => "canceled",
            JobState::Aborted => "aborted",
            JobState::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// A single document file belonging to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFile {
    pub mime_type: String,
    pub compressed: bool,
    /// Path to the spooled document file (`<spool>/d<NNNNN>-NNN`).
    pub path: std::path::PathBuf,
}

/// Whether a job's destination is a printer or a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationType {
    Printer,
    Class,
}

/// A print job, owned by the job manager. Field set follows the original
/// scheduler's `job_str` (priority, hold_until, num_files/current_file,
/// cost, tries) beyond what a plain REST-style job resource would need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub priority: u8,
    pub state: JobState,
    pub state_reasons: Vec<ReasonCode>,
    pub owner: String,
    pub destination: String,
    pub destination_type: DestinationType,
    pub files: Vec<JobFile>,
    pub current_file: usize,
    pub attrs: HashMap<String, AttributeValue>,
    /// Unix timestamp; 0 = no hold.
    pub hold_until: i64,
    pub tries: u32,
    pub cost: u32,
    pub filter_pids: Vec<u32>,
    pub backend_pid: Option<u32>,
    pub status_buffer: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, owner: impl Into<String>, destination: impl Into<String>, destination_type: DestinationType) -> Self {
        let now = Utc::now();
        Self {
            id,
            priority: 50,
            state: JobState::Pending,
            state_reasons: Vec::new(),
            owner: owner.into(),
            destination: destination.into(),
            destination_type,
            files: Vec::new(),
            current_file: 0,
            attrs: HashMap::new(),
            hold_until: 0,
            tries: 0,
            cost: 0,
            filter_pids: Vec::new(),
            backend_pid: None,
            status_buffer: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Operational state of a printer, orthogonal to job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrinterState {
    Idle,
    Processing,
    Stopped,
}

impl std::fmt::Display for PrinterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PrinterState::Idle => "idle",
            PrinterState::Processing => "processing",
            PrinterState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// A rolling quota sample: pages printed by `owner` at `at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSample {
    pub owner: String,
    pub at: DateTime<Utc>,
    pub pages: u32,
}

/// Per-printer quota configuration, matching `job-k-limit`, `job-page-limit`
/// and `job-quota-period` IPP printer attributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub job_k_limit: Option<u64>,
    pub job_page_limit: Option<u32>,
    pub job_quota_period_secs: Option<u64>,
}

/// A physical or virtual printer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Printer {
    pub name: String,
    pub device_uri: String,
    pub state: PrinterState,
    pub state_reasons: Vec<ReasonCode>,
    pub accepting_jobs: bool,
    pub shared: bool,
    pub current_job: Option<JobId>,
    pub operation_policy: String,
    pub error_policy: String,
    pub filter_cost_cache: HashMap<(String, String), u32>,
    pub supported_mime_types: Vec<String>,
    pub job_sheets_start: Option<String>,
    pub job_sheets_end: Option<String>,
    pub quota: QuotaConfig,
    pub quota_samples: VecDeque<QuotaSample>,
    /// Classes that include this printer; derived, not authoritative.
    pub member_of_classes: Vec<String>,
    /// True if this printer was synthesized from discovery rather than
    /// declared in configuration.
    pub implicit: bool,
    /// While set, newly created jobs land in `pending-held` instead of
    /// `pending` until explicitly released.
    pub hold_new_jobs: bool,
}

impl Printer {
    pub fn new(name: impl Into<String>, device_uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device_uri: device_uri.into(),
            state: PrinterState::Idle,
            state_reasons: Vec::new(),
            accepting_jobs: true,
            shared: false,
            current_job: None,
            operation_policy: "default".into(),
            error_policy: "stop-printer".into(),
            filter_cost_cache: HashMap::new(),
            supported_mime_types: Vec::new(),
            job_sheets_start: None,
            job_sheets_end: None,
            quota: QuotaConfig::default(),
            quota_samples: VecDeque::new(),
            member_of_classes: Vec::new(),
            implicit: false,
            hold_new_jobs: false,
        }
    }
}

/// A named group of printers presented as a single destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Class {
    pub name: String,
    pub members: Vec<String>,
    /// True for classes synthesized from multiple hosts sharing a name
    /// during discovery; never persisted, rebuilt on each refresh.
    pub implicit: bool,
    pub accepting_jobs: bool,
    pub shared: bool,
    /// Round-robin cursor into `members` for `find_available`.
    pub next_member: usize,
}

impl Class {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
            implicit: false,
            accepting_jobs: true,
            shared: false,
            next_member: 0,
        }
    }
}

/// Event kinds, matching the `cupsd_eventmask_t` classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    PrinterStateChanged,
    PrinterConfigChanged,
    PrinterAdded,
    PrinterDeleted,
    JobCreated,
    JobStateChanged,
    JobCompleted,
    JobStopped,
    JobProgress,
    ServerStarted,
    ServerRestarted,
    ServerStopped,
    ServerAudit,
}

impl EventKind {
    /// All event kinds, used to expand a subscription's `"all"` mask.
    pub const ALL: &'static [EventKind] = &[
        EventKind::PrinterStateChanged,
        EventKind::PrinterConfigChanged,
        EventKind::PrinterAdded,
        EventKind::PrinterDeleted,
        EventKind::JobCreated,
        EventKind::JobStateChanged,
        EventKind::JobCompleted,
        EventKind::JobStopped,
        EventKind::JobProgress,
        EventKind::ServerStarted,
        EventKind::ServerRestarted,
        EventKind::ServerStopped,
        EventKind::ServerAudit,
    ];
}

/// A single event published to the subscription bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub printer: Option<String>,
    pub job: Option<JobId>,
    pub attrs: HashMap<String, AttributeValue>,
}

/// Where a subscription's events are delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Recipient {
    /// Push delivery to an external notifier process, addressed by a
    /// scheme-prefixed URI (e.g. `mailto:`, `dbus://`), with opaque
    /// user data (max 64 bytes).
    Push { uri: String, user_data: Vec<u8> },
    /// Pull delivery via `get-notifications`; no child process launched.
    Pull,
}

/// A registration of interest in a subset of events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i32,
    pub mask: Vec<EventKind>,
    pub recipient: Recipient,
    pub owner: String,
    pub printer_filter: Option<String>,
    pub job_filter: Option<JobId>,
    pub lease_expiry: DateTime<Utc>,
    pub events: VecDeque<Event>,
    pub ring_capacity: usize,
    pub lost_events: u64,
    pub read_cursor: u64,
    pub next_event_id: u64,
}

impl Subscription {
    pub fn matches(&self, event: &Event) -> bool {
        self.mask.contains(&event.kind)
            && self
                .printer_filter
                .as_deref()
                .is_none_or(|p| Some(p) == event.printer.as_deref())
            && self.job_filter.is_none_or(|j| Some(j) == event.job)
    }
}

/// Allow or deny for a policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllowDeny {
    Allow,
    Deny,
}

/// Evaluation order: which list is consulted first when both match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyOrder {
    AllowDeny,
    DenyAllow,
}

/// A principal pattern in a policy rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrincipalPattern {
    Literal(String),
    Group(String),
    Owner,
    System,
    Any,
}

/// One `(allow|deny, principal-pattern)` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub action: AllowDeny,
    pub pattern: PrincipalPattern,
}

/// Rules for a single operation (or the wildcard operation) within a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyOp {
    /// `None` means the wildcard entry, matched when no exact operation
    /// entry exists.
    pub operation: Option<String>,
    pub order: PolicyOrder,
    pub requires_authentication: bool,
    pub entries: Vec<PolicyEntry>,
}

/// A named collection of per-operation rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub ops: Vec<PolicyOp>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_terminal_classification() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Aborted.is_terminal());
        assert!(JobState::Canceled.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(!JobState::Held.is_terminal());
    }

    #[test]
    fn job_state_active_classification() {
        assert!(JobState::Processing.is_active());
        assert!(JobState::Stopped.is_active());
        assert!(!JobState::Pending.is_active());
    }

    #[test]
    fn subscription_matches_respects_filters() {
        let sub = Subscription {
            id: 1,
            mask: vec![EventKind::JobStateChanged],
            recipient: Recipient::Pull,
            owner: "alice".into(),
            printer_filter: Some("P".into()),
            job_filter: None,
            lease_expiry: Utc::now(),
            events: VecDeque::new(),
            ring_capacity: 100,
            lost_events: 0,
            read_cursor: 0,
            next_event_id: 0,
        };

        let matching = Event {
            kind: EventKind::JobStateChanged,
            timestamp: Utc::now(),
            sequence: 1,
            printer: Some("P".into()),
            job: Some(7),
            attrs: HashMap::new(),
        };
        assert!(sub.matches(&matching));

        let wrong_printer = Event {
            printer: Some("Q".into()),
            ..matching.clone()
        };
        assert!(!sub.matches(&wrong_printer));

        let wrong_kind = Event {
            kind: EventKind::PrinterAdded,
            ..matching
        };
        assert!(!sub.matches(&wrong_kind));
    }
}
