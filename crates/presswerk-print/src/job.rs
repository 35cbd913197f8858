// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Job manager & state machine. Field set and operation names follow the
// original scheduler's `job_str` / `AddJob`/`CancelJob`/`HoldJob`/
// `ReleaseJob`/`MoveJob`/`SetJobPriority` API.

use std::collections::HashMap;

use chrono::Utc;
use presswerk_core::error::{Result, SchedulerError};
use presswerk_core::types::{DestinationType, Job, JobFile, JobId, JobState, QuotaSample};
use tracing::{info, instrument, warn};

/// Job ids wrap at this ceiling; the allocator skips any id still present
/// among live jobs rather than reproducing the original 16-bit wrap
/// ordering.
pub const JOB_ID_CEILING: JobId = 0x7FFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Created,
    StateChanged,
    Completed,
    Stopped,
}

pub struct JobManager {
    jobs: HashMap<JobId, Job>,
    next_id: JobId,
    pub jobs_dirty: bool,
}

impl JobManager {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            next_id: 1,
            jobs_dirty: false,
        }
    }

    fn allocate_id(&mut self) -> JobId {
        loop {
            let candidate = self.next_id;
            self.next_id = if self.next_id >= JOB_ID_CEILING {
                1
            } else {
                self.next_id + 1
            };
            if !self.jobs.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    #[instrument(skip(self))]
    pub fn create(
        &mut self,
        owner: &str,
        dest: &str,
        dest_type: DestinationType,
    ) -> Result<JobId> {
        let id = self.allocate_id();
        let job = Job::new(id, owner, dest, dest_type);
        self.jobs.insert(id, job);
        self.jobs_dirty = true;
        info!(job_id = id, %owner, %dest, "job created");
        Ok(id)
    }

    pub fn add_document(&mut self, id: JobId, file: JobFile) -> Result<()> {
        let job = self.get_mut(id)?;
        job.files.push(file);
        job.touch();
        self.jobs_dirty = true;
        Ok(())
    }

    /// Mark a job ready for scheduling. If a hold condition applies
    /// (explicit `hold_until` in the future), the job moves to `held`
    /// instead of `pending`.
    #[instrument(skip(self))]
    pub fn submit(&mut self, id: JobId) -> Result<JobState> {
        let now = Utc::now().timestamp();
        let job = self.get_mut(id)?;
        if job.hold_until > now {
            job.state = JobState::Held;
            if !job.state_reasons.iter().any(|r| r == "job-hold-until-specified") {
                job.state_reasons.push("job-hold-until-specified".into());
            }
        } else {
            job.state = JobState::Pending;
        }
        job.touch();
        Ok(job.state)
    }

    #[instrument(skip(self))]
    pub fn cancel(&mut self, id: JobId, _purge: bool) -> Result<JobState> {
        let job = self.get_mut(id)?;
        if job.state.is_terminal() {
            // Canceling a job that already reached a terminal state is a
            // no-op: the earlier transition wins.
            return Ok(job.state);
        }
        job.state = JobState::Canceled;
        job.state_reasons = vec!["canceled-by-user".into()];
        job.touch();
        self.jobs_dirty = true;
        info!(job_id = id, "job canceled");
        Ok(job.state)
    }

    #[instrument(skip(self))]
    pub fn hold(&mut self, id: JobId) -> Result<()> {
        let job = self.get_mut(id)?;
        if job.state.is_terminal() {
            return Err(SchedulerError::NotPossible(format!(
                "cannot hold job {id} in state {}",
                job.state
            )));
        }
        job.state = JobState::Held;
        job.touch();
        self.jobs_dirty = true;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn release(&mut self, id: JobId) -> Result<()> {
        let job = self.get_mut(id)?;
        if job.state != JobState::Held && job.state != JobState::PendingHeld {
            return Err(SchedulerError::NotPossible(format!(
                "job {id} is not held"
            )));
        }
        job.hold_until = 0;
        job.state_reasons.retain(|r| r != "job-hold-until-specified");
        job.state = JobState::Pending;
        job.touch();
        self.jobs_dirty = true;
        Ok(())
    }

    /// Called right after creation/submission when the destination printer
    /// has `hold_new_jobs` set: move a job sitting at `pending` straight to
    /// `pending-held`. A job already `held` for its own `hold_until` keeps
    /// that more specific state.
    pub fn hold_new(&mut self, id: JobId) -> Result<()> {
        let job = self.get_mut(id)?;
        if job.state == JobState::Pending {
            job.state = JobState::PendingHeld;
            job.touch();
            self.jobs_dirty = true;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn restart(&mut self, id: JobId) -> Result<()> {
        let job = self.get_mut(id)?;
        if !job.state.is_terminal() {
            return Err(SchedulerError::NotPossible(format!(
                "cannot restart job {id} in state {}",
                job.state
            )));
        }
        job.state = JobState::Pending;
        job.current_file = 0;
        job.tries = 0;
        job.state_reasons.clear();
        job.touch();
        self.jobs_dirty = true;
        Ok(())
    }

    pub fn move_job(&mut self, id: JobId, new_dest: &str, dest_type: DestinationType) -> Result<()> {
        let job = self.get_mut(id)?;
        if job.state == JobState::Processing {
            return Err(SchedulerError::NotPossible(format!(
                "cannot move job {id} while processing"
            )));
        }
        job.destination = new_dest.to_string();
        job.destination_type = dest_type;
        job.touch();
        self.jobs_dirty = true;
        Ok(())
    }

    pub fn set_priority(&mut self, id: JobId, priority: u8) -> Result<()> {
        if !(1..=100).contains(&priority) {
            return Err(SchedulerError::BadRequest(format!(
                "priority {priority} out of range 1-100"
            )));
        }
        let job = self.get_mut(id)?;
        job.priority = priority;
        job.touch();
        self.jobs_dirty = true;
        Ok(())
    }

    pub fn set_hold_until(&mut self, id: JobId, spec: i64) -> Result<()> {
        let job = self.get_mut(id)?;
        job.hold_until = spec;
        if spec > Utc::now().timestamp() {
            job.state = JobState::Held;
            job.state_reasons.push("job-hold-until-specified".into());
        }
        job.touch();
        self.jobs_dirty = true;
        Ok(())
    }

    pub fn get(&self, id: JobId) -> Result<&Job> {
        self.jobs.get(&id).ok_or(SchedulerError::UnknownJob(id))
    }

    pub fn get_mut(&mut self, id: JobId) -> Result<&mut Job> {
        self.jobs.get_mut(&id).ok_or(SchedulerError::UnknownJob(id))
    }

    pub fn list(&self, dest: Option<&str>, owner: Option<&str>) -> Vec<&Job> {
        self.jobs
            .values()
            .filter(|j| dest.is_none_or(|d| j.destination == d))
            .filter(|j| owner.is_none_or(|o| j.owner == o))
            .collect()
    }

    pub fn insert_restored(&mut self, job: Job) {
        if job.id >= self.next_id {
            self.next_id = if job.id >= JOB_ID_CEILING { 1 } else { job.id + 1 };
        }
        self.jobs.insert(job.id, job);
    }

    pub fn active_job_count(&self) -> usize {
        self.jobs.values().filter(|j| j.state.is_active()).count()
    }

    pub fn active_count_for_printer(&self, printer: &str) -> usize {
        self.jobs
            .values()
            .filter(|j| j.destination == printer && j.state.is_active())
            .count()
    }

    pub fn active_count_for_owner(&self, owner: &str) -> usize {
        self.jobs
            .values()
            .filter(|j| j.owner == owner && j.state.is_active())
            .count()
    }

    /// Highest-priority pending job targeting `printer` (or class member
    /// `printer`), ties broken by earliest creation then lowest id.
    pub fn next_pending_for_printer(&self, printer: &str) -> Option<JobId> {
        self.jobs
            .values()
            .filter(|j| j.destination == printer && j.state == JobState::Pending)
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|j| j.id)
    }

    /// Check whether admitting `pages` more pages for `owner` on `printer`
    /// would exceed the quota window; if so, hold the job.
    pub fn check_quota(
        &mut self,
        id: JobId,
        printer_quota_period_secs: Option<u64>,
        printer_page_limit: Option<u32>,
        samples: &mut std::collections::VecDeque<QuotaSample>,
        pages: u32,
    ) -> Result<bool> {
        let Some(period) = printer_quota_period_secs else {
            return Ok(true);
        };
        let Some(limit) = printer_page_limit else {
            return Ok(true);
        };
        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(period as i64);
        samples.retain(|s| s.at >= cutoff);

        let job = self.get(id)?;
        let window_sum: u32 = samples
            .iter()
            .filter(|s| s.owner == job.owner)
            .map(|s| s.pages)
            .sum();

        if window_sum + pages > limit {
            let job = self.get_mut(id)?;
            job.state = JobState::Held;
            job.state_reasons.push("job-hold-until-specified".into());
            job.touch();
            warn!(job_id = id, window_sum, limit, "quota exceeded, job held");
            return Ok(false);
        }
        Ok(true)
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_submit_transitions_to_pending() {
        let mut mgr = JobManager::new();
        let id = mgr.create("alice", "P", DestinationType::Printer).unwrap();
        assert_eq!(mgr.submit(id).unwrap(), JobState::Pending);
    }

    #[test]
    fn submit_with_future_hold_until_holds() {
        let mut mgr = JobManager::new();
        let id = mgr.create("alice", "P", DestinationType::Printer).unwrap();
        mgr.set_hold_until(id, Utc::now().timestamp() + 3600).unwrap();
        assert_eq!(mgr.submit(id).unwrap(), JobState::Held);
    }

    #[test]
    fn cancel_completed_job_is_noop() {
        let mut mgr = JobManager::new();
        let id = mgr.create("alice", "P", DestinationType::Printer).unwrap();
        mgr.get_mut(id).unwrap().state = JobState::Completed;
        let state = mgr.cancel(id, false).unwrap();
        assert_eq!(state, JobState::Completed);
    }

    #[test]
    fn cancel_processing_job_cancels() {
        let mut mgr = JobManager::new();
        let id = mgr.create("alice", "P", DestinationType::Printer).unwrap();
        mgr.get_mut(id).unwrap().state = JobState::Processing;
        let state = mgr.cancel(id, false).unwrap();
        assert_eq!(state, JobState::Canceled);
    }

    #[test]
    fn release_requires_held_state() {
        let mut mgr = JobManager::new();
        let id = mgr.create("alice", "P", DestinationType::Printer).unwrap();
        assert!(mgr.release(id).is_err());
        mgr.hold(id).unwrap();
        assert!(mgr.release(id).is_ok());
        assert_eq!(mgr.get(id).unwrap().state, JobState::Pending);
    }

    #[test]
    fn hold_new_moves_pending_job_to_pending_held_and_release_clears_it() {
        let mut mgr = JobManager::new();
        let id = mgr.create("alice", "P", DestinationType::Printer).unwrap();
        mgr.submit(id).unwrap();
        mgr.hold_new(id).unwrap();
        assert_eq!(mgr.get(id).unwrap().state, JobState::PendingHeld);

        mgr.release(id).unwrap();
        assert_eq!(mgr.get(id).unwrap().state, JobState::Pending);
    }

    #[test]
    fn hold_new_does_not_override_an_explicit_hold_until() {
        let mut mgr = JobManager::new();
        let id = mgr.create("alice", "P", DestinationType::Printer).unwrap();
        mgr.set_hold_until(id, Utc::now().timestamp() + 3600).unwrap();
        mgr.submit(id).unwrap();
        mgr.hold_new(id).unwrap();
        assert_eq!(mgr.get(id).unwrap().state, JobState::Held);
    }

    #[test]
    fn restart_requires_terminal_state() {
        let mut mgr = JobManager::new();
        let id = mgr.create("alice", "P", DestinationType::Printer).unwrap();
        assert!(mgr.restart(id).is_err());
        mgr.get_mut(id).unwrap().state = JobState::Aborted;
        assert!(mgr.restart(id).is_ok());
        assert_eq!(mgr.get(id).unwrap().state, JobState::Pending);
    }

    #[test]
    fn set_priority_validates_range() {
        let mut mgr = JobManager::new();
        let id = mgr.create("alice", "P", DestinationType::Printer).unwrap();
        assert!(mgr.set_priority(id, 0).is_err());
        assert!(mgr.set_priority(id, 101).is_err());
        assert!(mgr.set_priority(id, 75).is_ok());
    }

    #[test]
    fn queue_ordering_prefers_priority_then_age_then_id() {
        let mut mgr = JobManager::new();
        let a = mgr.create("alice", "P", DestinationType::Printer).unwrap();
        mgr.submit(a).unwrap();
        let b = mgr.create("bob", "P", DestinationType::Printer).unwrap();
        mgr.submit(b).unwrap();
        mgr.set_priority(b, 90).unwrap();

        assert_eq!(mgr.next_pending_for_printer("P"), Some(b));
    }

    #[test]
    fn job_id_allocator_skips_live_ids() {
        let mut mgr = JobManager::new();
        let a = mgr.create("alice", "P", DestinationType::Printer).unwrap();
        assert_eq!(a, 1);
        mgr.next_id = JOB_ID_CEILING;
        let b = mgr.create("alice", "P", DestinationType::Printer).unwrap();
        assert_eq!(b, JOB_ID_CEILING);
        let c = mgr.create("alice", "P", DestinationType::Printer).unwrap();
        // id 1 is live (job `a`), so the wrap must skip it.
        assert_ne!(c, 1);
    }

    #[test]
    fn quota_holds_job_when_window_exceeded() {
        let mut mgr = JobManager::new();
        let id = mgr.create("alice", "P", DestinationType::Printer).unwrap();
        let mut samples = std::collections::VecDeque::new();
        samples.push_back(QuotaSample {
            owner: "alice".into(),
            at: Utc::now(),
            pages: 4,
        });
        let admitted = mgr
            .check_quota(id, Some(3600), Some(5), &mut samples, 2)
            .unwrap();
        assert!(!admitted);
        assert_eq!(mgr.get(id).unwrap().state, JobState::Held);
    }
}
