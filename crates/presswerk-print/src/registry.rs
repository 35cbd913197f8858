// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer/class registry — two keyed mappings (name → Printer, name →
// Class) with add/delete/rename/find/find-available, plus implicit-class
// recomputation driven by discovery refresh events.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use presswerk_core::error::{Result, SchedulerError};
use presswerk_core::types::{Class, Printer, PrinterState};
use tracing::{info, instrument, warn};

/// A printer reachable at `device_uri`, as reported by discovery (mDNS or
/// another out-of-scope collaborator). Distinct from `Printer` because
/// discovery has no notion of policies, quotas, or job-sheets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHost {
    pub name: String,
    pub device_uri: String,
}

/// Boundary the registry uses to learn about discovered printers without
/// depending on a specific discovery transport (mDNS, or anything else).
pub trait DiscoveryRefresh {
    fn discovered_hosts(&self) -> Vec<DiscoveredHost>;
}

/// Event emitted by a registry mutation, consumed by the subscription bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    PrinterAdded(String),
    PrinterDeleted(String),
    PrinterStateChanged(String),
    PrinterConfigChanged(String),
}

pub struct Registry {
    printers: HashMap<String, Printer>,
    classes: HashMap<String, Class>,
    last_discovery_refresh: Option<Instant>,
    implicit_class_debounce: Duration,
    pub printers_dirty: bool,
    pub classes_dirty: bool,
    pub remote_dirty: bool,
}

impl Registry {
    pub fn new(implicit_class_debounce: Duration) -> Self {
        Self {
            printers: HashMap::new(),
            classes: HashMap::new(),
            last_discovery_refresh: None,
            implicit_class_debounce,
            printers_dirty: false,
            classes_dirty: false,
            remote_dirty: false,
        }
    }

    #[instrument(skip(self, printer), fields(name = %printer.name))]
    pub fn add_printer(&mut self, printer: Printer) -> Result<Vec<RegistryEvent>> {
        if self.printers.contains_key(&printer.name) {
            return Err(SchedulerError::AlreadyExists(printer.name.clone()));
        }
        let name = printer.name.clone();
        self.printers.insert(name.clone(), printer);
        self.printers_dirty = true;
        info!(%name, "printer added");
        Ok(vec![RegistryEvent::PrinterAdded(name)])
    }

    /// Delete a printer. If `force` is false and jobs still reference it,
    /// mark it removed-from-config but keep the record until the caller
    /// confirms no jobs remain.
    #[instrument(skip(self))]
    pub fn delete_printer(&mut self, name: &str, has_referencing_jobs: bool) -> Result<Vec<RegistryEvent>> {
        if !self.printers.contains_key(name) {
            return Err(SchedulerError::UnknownDestination(name.to_string()));
        }
        if has_referencing_jobs {
            if let Some(printer) = self.printers.get_mut(name) {
                printer.accepting_jobs = false;
            }
            self.printers_dirty = true;
            warn!(%name, "printer has active jobs; deferring deletion");
            return Ok(vec![RegistryEvent::PrinterConfigChanged(name.to_string())]);
        }
        self.printers.remove(name);
        self.printers_dirty = true;
        info!(%name, "printer deleted");
        Ok(vec![RegistryEvent::PrinterDeleted(name.to_string())])
    }

    pub fn find_printer(&self, name: &str) -> Option<&Printer> {
        self.printers.get(name)
    }

    pub fn find_printer_mut(&mut self, name: &str) -> Option<&mut Printer> {
        self.printers.get_mut(name)
    }

    pub fn find_class(&self, name: &str) -> Option<&Class> {
        self.classes.get(name)
    }

    pub fn find_class_mut(&mut self, name: &str) -> Option<&mut Class> {
        self.classes.get_mut(name)
    }

    pub fn add_class(&mut self, class: Class) -> Result<Vec<RegistryEvent>> {
        if self.classes.contains_key(&class.name) {
            return Err(SchedulerError::AlreadyExists(class.name.clone()));
        }
        let name = class.name.clone();
        for member in &class.members {
            if let Some(printer) = self.printers.get_mut(member) {
                if !printer.member_of_classes.iter().any(|c| c == &name) {
                    printer.member_of_classes.push(name.clone());
                }
            }
        }
        self.classes.insert(name.clone(), class);
        self.classes_dirty = true;
        Ok(vec![RegistryEvent::PrinterAdded(name)])
    }

    pub fn delete_class(&mut self, name: &str) -> Result<Vec<RegistryEvent>> {
        let class = self
            .classes
            .remove(name)
            .ok_or_else(|| SchedulerError::UnknownDestination(name.to_string()))?;
        for member in &class.members {
            if let Some(printer) = self.printers.get_mut(member) {
                printer.member_of_classes.retain(|c| c != name);
            }
        }
        self.classes_dirty = true;
        Ok(vec![RegistryEvent::PrinterDeleted(name.to_string())])
    }

    pub fn printers(&self) -> impl Iterator<Item = &Printer> {
        self.printers.values()
    }

    pub fn classes(&self) -> impl Iterator<Item = &Class> {
        self.classes.values()
    }

    /// Resolve `dest` (a printer or class name) to a concrete printer name
    /// available to accept a job: if it names a printer directly, return it
    /// when idle or processing-with-spare-capacity; if it names a class,
    /// round-robin among members in that state.
    pub fn find_available_printer(&mut self, dest: &str) -> Option<String> {
        if self.printers.contains_key(dest) {
            return self.printer_is_available(dest).then(|| dest.to_string());
        }

        let class = self.classes.get(dest)?;
        let members = class.members.clone();
        if members.is_empty() {
            return None;
        }

        let start = self.classes.get(dest).map(|c| c.next_member).unwrap_or(0) % members.len();
        for offset in 0..members.len() {
            let idx = (start + offset) % members.len();
            let candidate = &members[idx];
            if self.printer_is_available(candidate) {
                if let Some(c) = self.classes.get_mut(dest) {
                    c.next_member = (idx + 1) % members.len();
                }
                return Some(candidate.clone());
            }
        }
        None
    }

    fn printer_is_available(&self, name: &str) -> bool {
        self.printers
            .get(name)
            .map(|p| p.accepting_jobs && p.current_job.is_none() && p.state != PrinterState::Stopped)
            .unwrap_or(false)
    }

    /// Recompute implicit classes from a `DiscoveryRefresh` source, debounced
    /// by `implicit_class_debounce`. Implicit classes are never persisted;
    /// membership is purely derived.
    pub fn refresh_implicit_classes(&mut self, source: &dyn DiscoveryRefresh, now: Instant) {
        if let Some(last) = self.last_discovery_refresh {
            if now.duration_since(last) < self.implicit_class_debounce {
                return;
            }
        }
        self.last_discovery_refresh = Some(now);

        let hosts = source.discovered_hosts();
        let mut by_name: HashMap<String, Vec<String>> = HashMap::new();
        for host in &hosts {
            by_name.entry(host.name.clone()).or_default().push(host.device_uri.clone());
        }

        // Drop stale implicit classes before rebuilding.
        self.classes.retain(|_, c| !c.implicit);

        for (name, uris) in by_name {
            if uris.len() < 2 {
                continue;
            }
            let mut class = Class::new(name.clone());
            class.implicit = true;
            class.members = uris;
            self.classes.insert(name, class);
        }
    }
}
