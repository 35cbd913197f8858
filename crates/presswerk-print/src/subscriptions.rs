// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Subscription & event bus. Publish fan-out follows the original
// scheduler's `cupsdAddEvent`: each event is appended to a bounded global
// ring and to every matching subscription's own ring, with a per-
// subscription lost-event counter when that ring overflows. Push
// notifiers relaunch with the backoff schedule from `retry.rs`; pull
// subscriptions are drained by `get-notifications`.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use presswerk_core::error::{Result, SchedulerError};
use presswerk_core::types::{Event, EventKind, Recipient, Subscription};
use tracing::{info, instrument, warn};

use crate::retry::{compute_delay, RetryConfig};

/// State the bus keeps for a push recipient's notifier child process,
/// separate from the subscription record itself.
#[derive(Debug, Clone, Default)]
struct NotifierState {
    attempts: u32,
    next_retry_at: Option<DateTime<Utc>>,
}

pub struct EventBus {
    subscriptions: HashMap<i32, Subscription>,
    next_subscription_id: i32,
    global_ring: VecDeque<Event>,
    global_ring_capacity: usize,
    next_sequence: u64,
    notifier_state: HashMap<i32, NotifierState>,
    pub subscriptions_dirty: bool,
}

impl EventBus {
    pub fn new(global_ring_capacity: usize) -> Self {
        Self {
            subscriptions: HashMap::new(),
            next_subscription_id: 1,
            global_ring: VecDeque::new(),
            global_ring_capacity,
            next_sequence: 1,
            notifier_state: HashMap::new(),
            subscriptions_dirty: false,
        }
    }

    #[instrument(skip(self, mask, recipient))]
    pub fn subscribe(
        &mut self,
        mask: Vec<EventKind>,
        recipient: Recipient,
        owner: &str,
        printer_filter: Option<String>,
        job_filter: Option<i32>,
        lease_duration_secs: i64,
        ring_capacity: usize,
    ) -> Result<i32> {
        if mask.is_empty() {
            return Err(SchedulerError::BadRequest(
                "subscription mask must name at least one event".into(),
            ));
        }
        let id = self.next_subscription_id;
        self.next_subscription_id += 1;

        let sub = Subscription {
            id,
            mask,
            recipient,
            owner: owner.to_string(),
            printer_filter,
            job_filter,
            lease_expiry: Utc::now() + ChronoDuration::seconds(lease_duration_secs),
            events: VecDeque::new(),
            ring_capacity,
            lost_events: 0,
            read_cursor: 0,
            next_event_id: 0,
        };
        self.subscriptions.insert(id, sub);
        self.subscriptions_dirty = true;
        info!(subscription_id = id, "subscription created");
        Ok(id)
    }

    pub fn cancel(&mut self, id: i32) -> Result<()> {
        self.subscriptions
            .remove(&id)
            .ok_or(SchedulerError::UnknownSubscription(id))?;
        self.notifier_state.remove(&id);
        self.subscriptions_dirty = true;
        Ok(())
    }

    pub fn renew(&mut self, id: i32, lease_duration_secs: i64) -> Result<DateTime<Utc>> {
        let sub = self
            .subscriptions
            .get_mut(&id)
            .ok_or(SchedulerError::UnknownSubscription(id))?;
        sub.lease_expiry = Utc::now() + ChronoDuration::seconds(lease_duration_secs);
        self.subscriptions_dirty = true;
        Ok(sub.lease_expiry)
    }

    pub fn get(&self, id: i32) -> Result<&Subscription> {
        self.subscriptions
            .get(&id)
            .ok_or(SchedulerError::UnknownSubscription(id))
    }

    pub fn list(&self, owner: Option<&str>) -> Vec<&Subscription> {
        self.subscriptions
            .values()
            .filter(|s| owner.is_none_or(|o| s.owner == o))
            .collect()
    }

    /// Number of live subscriptions, regardless of owner.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Publish an event: appended to the bounded global ring, then fanned
    /// out to every subscription whose mask/printer/job filter matches.
    /// Events dropped from a full per-subscription ring increment that
    /// subscription's `lost_events` rather than blocking the publisher.
    #[instrument(skip(self, kind, printer, job, attrs))]
    pub fn publish(
        &mut self,
        kind: EventKind,
        printer: Option<String>,
        job: Option<i32>,
        attrs: HashMap<String, presswerk_core::attrs::AttributeValue>,
    ) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let event = Event {
            kind,
            timestamp: Utc::now(),
            sequence,
            printer,
            job,
            attrs,
        };

        if self.global_ring.len() >= self.global_ring_capacity {
            self.global_ring.pop_front();
        }
        self.global_ring.push_back(event.clone());

        for sub in self.subscriptions.values_mut() {
            if !sub.matches(&event) {
                continue;
            }
            if sub.events.len() >= sub.ring_capacity {
                sub.events.pop_front();
                sub.lost_events += 1;
            }
            sub.events.push_back(event.clone());
        }

        sequence
    }

    /// Clone a subscription's pending events without removing them, so a
    /// push notifier can be retried with the same events on failure.
    pub fn peek_events(&self, id: i32) -> Result<Vec<Event>> {
        let sub = self
            .subscriptions
            .get(&id)
            .ok_or(SchedulerError::UnknownSubscription(id))?;
        Ok(sub.events.iter().cloned().collect())
    }

    /// Drain a pull subscription's ring for `get-notifications`. Returns
    /// the drained events and the subscription's cumulative lost count.
    pub fn drain_pull(&mut self, id: i32) -> Result<(Vec<Event>, u64)> {
        let sub = self
            .subscriptions
            .get_mut(&id)
            .ok_or(SchedulerError::UnknownSubscription(id))?;
        let drained: Vec<Event> = sub.events.drain(..).collect();
        Ok((drained, sub.lost_events))
    }

    /// Subscriptions with a push recipient that have pending events and are
    /// not already waiting on a backoff timer.
    pub fn due_for_notification(&self, now: DateTime<Utc>) -> Vec<i32> {
        self.subscriptions
            .values()
            .filter(|s| matches!(s.recipient, Recipient::Push { .. }))
            .filter(|s| !s.events.is_empty())
            .filter(|s| {
                self.notifier_state
                    .get(&s.id)
                    .and_then(|n| n.next_retry_at)
                    .is_none_or(|retry_at| now >= retry_at)
            })
            .map(|s| s.id)
            .collect()
    }

    /// Record that a notifier child process for `id` exited with `success`,
    /// scheduling its next retry with the same exponential backoff the
    /// filter pipeline uses for transient failures.
    pub fn record_notifier_result(&mut self, id: i32, success: bool, retry_config: &RetryConfig) {
        let state = self.notifier_state.entry(id).or_default();
        if success {
            state.attempts = 0;
            state.next_retry_at = None;
        } else {
            let delay = compute_delay(state.attempts, retry_config);
            state.attempts += 1;
            state.next_retry_at = Some(Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default());
            warn!(subscription_id = id, attempts = state.attempts, "notifier failed, backing off");
        }
    }

    /// Expire leases that have passed, returning the ids removed.
    pub fn expire_leases(&mut self, now: DateTime<Utc>) -> Vec<i32> {
        let expired: Vec<i32> = self
            .subscriptions
            .values()
            .filter(|s| s.lease_expiry <= now)
            .map(|s| s.id)
            .collect();
        for id in &expired {
            self.subscriptions.remove(id);
            self.notifier_state.remove(id);
        }
        if !expired.is_empty() {
            self.subscriptions_dirty = true;
        }
        expired
    }

    pub fn insert_restored(&mut self, sub: Subscription) {
        if sub.id >= self.next_subscription_id {
            self.next_subscription_id = sub.id + 1;
        }
        self.subscriptions.insert(sub.id, sub);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn bus() -> EventBus {
        EventBus::new(100)
    }

    #[test]
    fn subscribe_requires_nonempty_mask() {
        let mut bus = bus();
        let err = bus
            .subscribe(vec![], Recipient::Pull, "alice", None, None, 3600, 50)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::BadRequest(_)));
    }

    #[test]
    fn publish_delivers_to_matching_subscription_only() {
        let mut bus = bus();
        let id = bus
            .subscribe(
                vec![EventKind::JobCompleted],
                Recipient::Pull,
                "alice",
                None,
                None,
                3600,
                50,
            )
            .unwrap();

        bus.publish(EventKind::JobCreated, None, Some(1), HashMap::new());
        bus.publish(EventKind::JobCompleted, None, Some(1), HashMap::new());

        let (drained, lost) = bus.drain_pull(id).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].kind, EventKind::JobCompleted);
        assert_eq!(lost, 0);
    }

    #[test]
    fn overflowing_ring_counts_lost_events() {
        let mut bus = bus();
        let id = bus
            .subscribe(
                EventKind::ALL.to_vec(),
                Recipient::Pull,
                "alice",
                None,
                None,
                3600,
                2,
            )
            .unwrap();

        for _ in 0..5 {
            bus.publish(EventKind::JobProgress, None, Some(1), HashMap::new());
        }

        let (drained, lost) = bus.drain_pull(id).unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(lost, 3);
    }

    #[test]
    fn expire_leases_removes_past_due_subscriptions() {
        let mut bus = bus();
        let id = bus
            .subscribe(EventKind::ALL.to_vec(), Recipient::Pull, "alice", None, None, -1, 50)
            .unwrap();
        let expired = bus.expire_leases(Utc::now());
        assert_eq!(expired, vec![id]);
        assert!(bus.get(id).is_err());
    }

    #[test]
    fn renew_extends_lease_expiry() {
        let mut bus = bus();
        let id = bus
            .subscribe(EventKind::ALL.to_vec(), Recipient::Pull, "alice", None, None, 10, 50)
            .unwrap();
        let before = bus.get(id).unwrap().lease_expiry;
        let after = bus.renew(id, 3600).unwrap();
        assert!(after > before);
    }

    #[test]
    fn due_for_notification_respects_backoff() {
        let mut bus = bus();
        let id = bus
            .subscribe(
                EventKind::ALL.to_vec(),
                Recipient::Push {
                    uri: "mailto:ops@example.com".into(),
                    user_data: vec![],
                },
                "alice",
                None,
                None,
                3600,
                50,
            )
            .unwrap();
        bus.publish(EventKind::JobCompleted, None, Some(1), HashMap::new());

        assert_eq!(bus.due_for_notification(Utc::now()), vec![id]);

        let config = RetryConfig {
            max_retries: 5,
            base_delay: StdDuration::from_secs(60),
            max_delay: StdDuration::from_secs(600),
        };
        bus.record_notifier_result(id, false, &config);
        assert!(bus.due_for_notification(Utc::now()).is_empty());
    }

    #[test]
    fn cancel_removes_subscription() {
        let mut bus = bus();
        let id = bus
            .subscribe(EventKind::ALL.to_vec(), Recipient::Pull, "alice", None, None, 3600, 50)
            .unwrap();
        bus.cancel(id).unwrap();
        assert!(bus.get(id).is_err());
        assert!(bus.cancel(id).is_err());
    }
}
