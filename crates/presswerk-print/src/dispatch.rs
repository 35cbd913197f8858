// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// IPP operation dispatcher. Operation and status code numeric values
// follow RFC 8011 / the CUPS vendor extension band. The dispatcher
// consumes already-decoded operations; it never touches wire bytes.

use std::collections::HashMap;
use std::path::PathBuf;

use presswerk_core::attrs::{AttributeGroup, AttributeValue, GroupTag};
use presswerk_core::error::SchedulerError;
use presswerk_core::types::{Class, DestinationType, EventKind, JobId, JobState, Printer, PrinterState, Recipient};
use presswerk_core::SchedulerConfig;
use tracing::{error, info, instrument, warn};

use crate::job::JobManager;
use crate::policy::{Decision, PolicyEngine};
use crate::registry::{Registry, RegistryEvent};
use crate::subscriptions::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OperationCode {
    PrintJob = 0x0002,
    PrintUri = 0x0001,
    ValidateJob = 0x0004,
    CreateJob = 0x0005,
    SendDocument = 0x0006,
    SendUri = 0x0003,
    CancelJob = 0x0008,
    GetJobAttributes = 0x0009,
    GetJobs = 0x000A,
    GetPrinterAttributes = 0x000B,
    HoldJob = 0x000C,
    ReleaseJob = 0x000D,
    RestartJob = 0x000E,
    PausePrinter = 0x0010,
    ResumePrinter = 0x0011,
    PurgeJobs = 0x0012,
    SetJobAttributes = 0x0014,
    SetPrinterAttributes = 0x0016,
    CreatePrinterSubscription = 0x0017,
    CreateJobSubscription = 0x0018,
    CancelSubscription = 0x0024,
    GetSubscriptionAttributes = 0x0025,
    GetSubscriptions = 0x0026,
    RenewSubscription = 0x0027,
    GetNotifications = 0x0028,
    CupsAddModifyPrinter = 0x4003,
    CupsDeletePrinter = 0x4004,
    CupsAddModifyClass = 0x4006,
    CupsDeleteClass = 0x4007,
    CupsGetPrinters = 0x4002,
    CupsGetClasses = 0x4005,
    CupsGetDevices = 0x400B,
    CupsGetPpds = 0x400C,
    CupsMoveJob = 0x400D,
    CupsAuthenticateJob = 0x400E,
}

impl OperationCode {
    pub fn from_u16(code: u16) -> Option<Self> {
        use OperationCode::*;
        Some(match code {
            0x0001 => PrintUri,
            0x0002 => PrintJob,
            0x0003 => SendUri,
            0x0004 => ValidateJob,
            0x0005 => CreateJob,
            0x0006 => SendDocument,
            0x0008 => CancelJob,
            0x0009 => GetJobAttributes,
            0x000A => GetJobs,
            0x000B => GetPrinterAttributes,
            0x000C => HoldJob,
            0x000D => ReleaseJob,
            0x000E => RestartJob,
            0x0010 => PausePrinter,
            0x0011 => ResumePrinter,
            0x0012 => PurgeJobs,
            0x0014 => SetJobAttributes,
            0x0016 => SetPrinterAttributes,
            0x0017 => CreatePrinterSubscription,
            0x0018 => CreateJobSubscription,
            0x0024 => CancelSubscription,
            0x0025 => GetSubscriptionAttributes,
            0x0026 => GetSubscriptions,
            0x0027 => RenewSubscription,
            0x0028 => GetNotifications,
            0x4002 => CupsGetPrinters,
            0x4003 => CupsAddModifyPrinter,
            0x4004 => CupsDeletePrinter,
            0x4005 => CupsGetClasses,
            0x4006 => CupsAddModifyClass,
            0x4007 => CupsDeleteClass,
            0x400B => CupsGetDevices,
            0x400C => CupsGetPpds,
            0x400D => CupsMoveJob,
            0x400E => CupsAuthenticateJob,
            _ => return None,
        })
    }

    /// The name used as the policy's per-operation key, matching the
    /// keyword the original scheduler logs for this operation.
    pub fn policy_name(self) -> &'static str {
        use OperationCode::*;
        match self {
            PrintJob => "print-job",
            PrintUri => "print-uri",
            ValidateJob => "validate-job",
            CreateJob => "create-job",
            SendDocument => "send-document",
            SendUri => "send-uri",
            CancelJob => "cancel-job",
            GetJobAttributes => "get-job-attributes",
            GetJobs => "get-jobs",
            GetPrinterAttributes => "get-printer-attributes",
            HoldJob => "hold-job",
            ReleaseJob => "release-job",
            RestartJob => "restart-job",
            PausePrinter => "pause-printer",
            ResumePrinter => "resume-printer",
            PurgeJobs => "purge-jobs",
            SetJobAttributes => "set-job-attributes",
            SetPrinterAttributes => "set-printer-attributes",
            CreatePrinterSubscription => "create-printer-subscription",
            CreateJobSubscription => "create-job-subscription",
            CancelSubscription => "cancel-subscription",
            GetSubscriptionAttributes => "get-subscription-attributes",
            GetSubscriptions => "get-subscriptions",
            RenewSubscription => "renew-subscription",
            GetNotifications => "get-notifications",
            CupsAddModifyPrinter => "cups-add-modify-printer",
            CupsDeletePrinter => "cups-delete-printer",
            CupsAddModifyClass => "cups-add-modify-class",
            CupsDeleteClass => "cups-delete-class",
            CupsGetPrinters => "cups-get-printers",
            CupsGetClasses => "cups-get-classes",
            CupsGetDevices => "cups-get-devices",
            CupsGetPpds => "cups-get-ppds",
            CupsMoveJob => "cups-move-job",
            CupsAuthenticateJob => "cups-authenticate-job",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum IppStatus {
    SuccessfulOk = 0x0000,
    ClientErrorBadRequest = 0x0400,
    ClientErrorForbidden = 0x0401,
    ClientErrorNotAuthenticated = 0x0402,
    ClientErrorNotPossible = 0x0404,
    ClientErrorNotFound = 0x0406,
    ClientErrorDocumentFormatError = 0x0411,
    ClientErrorConflictingAttributes = 0x040E,
    ServerErrorInternalError = 0x0500,
    ServerErrorNotAcceptingJobs = 0x0506,
    ServerErrorBusy = 0x0507,
}

impl From<&SchedulerError> for IppStatus {
    fn from(err: &SchedulerError) -> Self {
        use presswerk_core::error::ErrorKind;
        match err.kind() {
            ErrorKind::BadRequest => IppStatus::ClientErrorBadRequest,
            ErrorKind::NotFound => IppStatus::ClientErrorNotFound,
            ErrorKind::Forbidden => IppStatus::ClientErrorForbidden,
            ErrorKind::NotAuthenticated => IppStatus::ClientErrorNotAuthenticated,
            ErrorKind::Conflict => IppStatus::ClientErrorConflictingAttributes,
            ErrorKind::Quota => IppStatus::ServerErrorNotAcceptingJobs,
            ErrorKind::SpoolIo => IppStatus::ServerErrorInternalError,
            ErrorKind::FilterTransient => IppStatus::ServerErrorBusy,
            ErrorKind::FilterFatal => IppStatus::ClientErrorDocumentFormatError,
            ErrorKind::Internal => IppStatus::ServerErrorInternalError,
        }
    }
}

/// A pre-decoded IPP request: the wire codec's output, consumed here.
#[derive(Debug, Clone)]
pub struct ParsedOperation {
    pub operation_code: u16,
    pub principal: Option<String>,
    pub attribute_groups: Vec<AttributeGroup>,
    /// Path to already-received document bytes staged by the transport,
    /// if this operation carries document data.
    pub document: Option<PathBuf>,
}

impl ParsedOperation {
    fn operation_group(&self) -> Option<&AttributeGroup> {
        self.attribute_groups.iter().find(|g| g.tag == GroupTag::Operation)
    }

    fn job_group(&self) -> Option<&AttributeGroup> {
        self.attribute_groups.iter().find(|g| g.tag == GroupTag::Job)
    }

    fn get(&self, tag: GroupTag, name: &str) -> Option<&AttributeValue> {
        self.attribute_groups.iter().find(|g| g.tag == tag)?.get(name)
    }

    fn printer_uri_name(&self) -> Option<String> {
        self.operation_group()?
            .get("printer-uri")
            .and_then(|v| v.as_text())
            .map(|s| s.rsplit('/').next().unwrap_or(s).to_string())
    }

    fn job_id(&self) -> Option<JobId> {
        self.operation_group()
            .and_then(|g| g.get("job-id"))
            .and_then(|v| v.as_integer())
    }
}

#[derive(Debug, Clone)]
pub struct OperationResponse {
    pub status: IppStatus,
    pub groups: Vec<AttributeGroup>,
}

impl OperationResponse {
    fn ok(groups: Vec<AttributeGroup>) -> Self {
        Self {
            status: IppStatus::SuccessfulOk,
            groups,
        }
    }

    fn error(err: &SchedulerError) -> Self {
        let mut group = AttributeGroup::new(GroupTag::Operation);
        group.set("status-message", AttributeValue::Keyword(err.to_string()));
        Self {
            status: IppStatus::from(err),
            groups: vec![group],
        }
    }
}

/// Bundles every subsystem a handler needs, borrowed for the duration of
/// one dispatch call. Never stored; constructed fresh by the event loop
/// on each incoming operation.
pub struct DispatchContext<'a> {
    pub registry: &'a mut Registry,
    pub jobs: &'a mut JobManager,
    pub events: &'a mut EventBus,
    pub policy: &'a PolicyEngine,
    pub config: &'a SchedulerConfig,
}

#[instrument(skip(op, ctx))]
pub fn dispatch(op: &ParsedOperation, ctx: &mut DispatchContext<'_>) -> OperationResponse {
    let Some(code) = OperationCode::from_u16(op.operation_code) else {
        warn!(code = op.operation_code, "unsupported operation code");
        return OperationResponse {
            status: IppStatus::ClientErrorBadRequest,
            groups: vec![],
        };
    };

    match handle(code, op, ctx) {
        Ok(response) => response,
        Err(e) => {
            log_dispatch_error(code, &e);
            OperationResponse::error(&e)
        }
    }
}

/// Log an operation failure at the level its kind warrants: a client
/// mistake is a warning, a spool or internal failure is an operator-facing
/// error, everything else (policy denials, quota, transient filter stops)
/// is informational.
fn log_dispatch_error(code: OperationCode, err: &SchedulerError) {
    use presswerk_core::error::ErrorKind;
    match err.kind() {
        ErrorKind::BadRequest | ErrorKind::NotFound | ErrorKind::Forbidden => {
            warn!(op = code.policy_name(), error = %err, "operation rejected");
        }
        ErrorKind::SpoolIo | ErrorKind::Internal => {
            error!(op = code.policy_name(), error = %err, "operation failed");
        }
        ErrorKind::NotAuthenticated
        | ErrorKind::Conflict
        | ErrorKind::Quota
        | ErrorKind::FilterTransient
        | ErrorKind::FilterFatal => {
            info!(op = code.policy_name(), error = %err, "operation could not complete");
        }
    }
}

fn authorize(
    ctx: &DispatchContext<'_>,
    policy_name: &str,
    op: &OperationCode,
    principal: Option<&str>,
    owner: &str,
) -> presswerk_core::error::Result<()> {
    match ctx.policy.evaluate(policy_name, op.policy_name(), principal, owner) {
        Decision::Allow => Ok(()),
        Decision::Deny => Err(SchedulerError::Forbidden),
        Decision::AuthRequired => Err(SchedulerError::NotAuthenticated),
    }
}

fn job_attributes_group(job: &presswerk_core::types::Job) -> AttributeGroup {
    let mut group = AttributeGroup::new(GroupTag::Job);
    group.set("job-id", AttributeValue::Integer(job.id));
    group.set("job-state", AttributeValue::Keyword(job.state.to_string()));
    group.set("job-printer-uri", AttributeValue::Keyword(job.destination.clone()));
    for reason in &job.state_reasons {
        group.set("job-state-reasons", AttributeValue::Keyword(reason.clone()));
    }
    group
}

/// Translate a registry mutation's domain events into bus publications.
fn publish_registry_events(ctx: &mut DispatchContext<'_>, events: Vec<RegistryEvent>) {
    for ev in events {
        let (kind, name) = match ev {
            RegistryEvent::PrinterAdded(name) => (EventKind::PrinterAdded, name),
            RegistryEvent::PrinterDeleted(name) => (EventKind::PrinterDeleted, name),
            RegistryEvent::PrinterStateChanged(name) => (EventKind::PrinterStateChanged, name),
            RegistryEvent::PrinterConfigChanged(name) => (EventKind::PrinterConfigChanged, name),
        };
        ctx.events.publish(kind, Some(name), None, HashMap::new());
    }
}

fn printer_attributes_group(printer: &Printer) -> AttributeGroup {
    let mut group = AttributeGroup::new(GroupTag::Printer);
    group.set("printer-name", AttributeValue::Keyword(printer.name.clone()));
    group.set("printer-state", AttributeValue::Keyword(printer.state.to_string()));
    group.set("printer-is-accepting-jobs", AttributeValue::Boolean(printer.accepting_jobs));
    for reason in &printer.state_reasons {
        group.set("printer-state-reasons", AttributeValue::Keyword(reason.clone()));
    }
    group
}

fn handle(
    code: OperationCode,
    op: &ParsedOperation,
    ctx: &mut DispatchContext<'_>,
) -> presswerk_core::error::Result<OperationResponse> {
    use OperationCode::*;
    match code {
        ValidateJob => {
            let dest = op
                .printer_uri_name()
                .ok_or_else(|| SchedulerError::BadRequest("missing printer-uri".into()))?;
            if ctx.registry.find_printer(&dest).is_none() && ctx.registry.find_class(&dest).is_none() {
                return Err(SchedulerError::UnknownDestination(dest));
            }
            authorize(ctx, "default", &code, op.principal.as_deref(), "")?;
            Ok(OperationResponse::ok(vec![]))
        }

        CreateJob | PrintJob => {
            let dest = op
                .printer_uri_name()
                .ok_or_else(|| SchedulerError::BadRequest("missing printer-uri".into()))?;
            let dest_type = if ctx.registry.find_class(&dest).is_some() {
                DestinationType::Class
            } else if ctx.registry.find_printer(&dest).is_some() {
                DestinationType::Printer
            } else {
                return Err(SchedulerError::UnknownDestination(dest));
            };
            let owner = op
                .operation_group()
                .and_then(|g| g.get("requesting-user-name"))
                .and_then(|v| v.as_text())
                .unwrap_or("anonymous")
                .to_string();
            authorize(ctx, "default", &code, op.principal.as_deref(), &owner)?;

            let id = ctx.jobs.create(&owner, &dest, dest_type)?;
            if let Some(job_group) = op.job_group() {
                let job = ctx.jobs.get_mut(id)?;
                for attr in &job_group.attributes {
                    job.attrs.insert(attr.name.clone(), attr.value.clone());
                }
            }

            if code == PrintJob {
                if let Some(doc) = &op.document {
                    ctx.jobs.add_document(
                        id,
                        presswerk_core::types::JobFile {
                            mime_type: op
                                .get(GroupTag::Operation, "document-format")
                                .and_then(|v| v.as_text())
                                .unwrap_or("application/octet-stream")
                                .to_string(),
                            compressed: false,
                            path: doc.clone(),
                        },
                    )?;
                }
                ctx.jobs.submit(id)?;
            }

            if dest_type == DestinationType::Printer
                && ctx.registry.find_printer(&dest).map(|p| p.hold_new_jobs).unwrap_or(false)
            {
                ctx.jobs.hold_new(id)?;
            }

            ctx.events.publish(EventKind::JobCreated, Some(dest), Some(id), HashMap::new());
            let mut group = AttributeGroup::new(GroupTag::Job);
            group.set("job-id", AttributeValue::Integer(id));
            Ok(OperationResponse::ok(vec![group]))
        }

        SendDocument => {
            let id = op
                .job_id()
                .ok_or_else(|| SchedulerError::BadRequest("missing job-id".into()))?;
            let owner = ctx.jobs.get(id)?.owner.clone();
            authorize(ctx, "default", &code, op.principal.as_deref(), &owner)?;
            if let Some(doc) = &op.document {
                ctx.jobs.add_document(
                    id,
                    presswerk_core::types::JobFile {
                        mime_type: op
                            .get(GroupTag::Operation, "document-format")
                            .and_then(|v| v.as_text())
                            .unwrap_or("application/octet-stream")
                            .to_string(),
                        compressed: false,
                        path: doc.clone(),
                    },
                )?;
            }
            let last_document = op
                .get(GroupTag::Operation, "last-document")
                .and_then(|v| v.as_boolean())
                .unwrap_or(true);
            if last_document {
                ctx.jobs.submit(id)?;
            }
            Ok(OperationResponse::ok(vec![]))
        }

        CancelJob => {
            let id = op
                .job_id()
                .ok_or_else(|| SchedulerError::BadRequest("missing job-id".into()))?;
            let job = ctx.jobs.get(id)?;
            let owner = job.owner.clone();
            let dest = job.destination.clone();
            authorize(ctx, "default", &code, op.principal.as_deref(), &owner)?;
            let purge = op
                .get(GroupTag::Operation, "purge-job")
                .and_then(|v| v.as_boolean())
                .unwrap_or(false);
            let new_state = ctx.jobs.cancel(id, purge)?;
            if new_state == JobState::Canceled {
                ctx.events.publish(EventKind::JobCompleted, Some(dest), Some(id), HashMap::new());
            }
            Ok(OperationResponse::ok(vec![]))
        }

        HoldJob => {
            let id = op.job_id().ok_or_else(|| SchedulerError::BadRequest("missing job-id".into()))?;
            let job = ctx.jobs.get(id)?;
            let owner = job.owner.clone();
            let dest = job.destination.clone();
            authorize(ctx, "default", &code, op.principal.as_deref(), &owner)?;
            ctx.jobs.hold(id)?;
            ctx.events.publish(EventKind::JobStateChanged, Some(dest), Some(id), HashMap::new());
            Ok(OperationResponse::ok(vec![]))
        }

        ReleaseJob => {
            let id = op.job_id().ok_or_else(|| SchedulerError::BadRequest("missing job-id".into()))?;
            let job = ctx.jobs.get(id)?;
            let owner = job.owner.clone();
            let dest = job.destination.clone();
            authorize(ctx, "default", &code, op.principal.as_deref(), &owner)?;
            ctx.jobs.release(id)?;
            ctx.events.publish(EventKind::JobStateChanged, Some(dest), Some(id), HashMap::new());
            Ok(OperationResponse::ok(vec![]))
        }

        RestartJob => {
            let id = op.job_id().ok_or_else(|| SchedulerError::BadRequest("missing job-id".into()))?;
            let job = ctx.jobs.get(id)?;
            let owner = job.owner.clone();
            let dest = job.destination.clone();
            authorize(ctx, "default", &code, op.principal.as_deref(), &owner)?;
            ctx.jobs.restart(id)?;
            ctx.events.publish(EventKind::JobStateChanged, Some(dest), Some(id), HashMap::new());
            Ok(OperationResponse::ok(vec![]))
        }

        SetJobAttributes => {
            let id = op.job_id().ok_or_else(|| SchedulerError::BadRequest("missing job-id".into()))?;
            let job = ctx.jobs.get(id)?;
            let owner = job.owner.clone();
            let dest = job.destination.clone();
            authorize(ctx, "default", &code, op.principal.as_deref(), &owner)?;
            if let Some(priority) = op.get(GroupTag::Job, "job-priority").and_then(|v| v.as_integer()) {
                ctx.jobs.set_priority(id, priority as u8)?;
                let mut attrs = HashMap::new();
                attrs.insert("job-priority".to_string(), AttributeValue::Integer(priority));
                ctx.events.publish(EventKind::JobProgress, Some(dest), Some(id), attrs);
            }
            Ok(OperationResponse::ok(vec![]))
        }

        GetJobAttributes => {
            let id = op.job_id().ok_or_else(|| SchedulerError::BadRequest("missing job-id".into()))?;
            let job = ctx.jobs.get(id)?;
            authorize(ctx, "default", &code, op.principal.as_deref(), &job.owner)?;
            Ok(OperationResponse::ok(vec![job_attributes_group(job)]))
        }

        GetJobs => {
            authorize(ctx, "default", &code, op.principal.as_deref(), "")?;
            let dest = op.printer_uri_name();
            let owner = op
                .get(GroupTag::Operation, "requesting-user-name")
                .and_then(|v| v.as_text());
            let groups = ctx
                .jobs
                .list(dest.as_deref(), owner)
                .into_iter()
                .map(job_attributes_group)
                .collect();
            Ok(OperationResponse::ok(groups))
        }

        GetPrinterAttributes => {
            let name = op
                .printer_uri_name()
                .ok_or_else(|| SchedulerError::BadRequest("missing printer-uri".into()))?;
            let printer = ctx
                .registry
                .find_printer(&name)
                .ok_or_else(|| SchedulerError::UnknownDestination(name.clone()))?;
            authorize(ctx, "default", &code, op.principal.as_deref(), "")?;
            Ok(OperationResponse::ok(vec![printer_attributes_group(printer)]))
        }

        PausePrinter => {
            let name = op
                .printer_uri_name()
                .ok_or_else(|| SchedulerError::BadRequest("missing printer-uri".into()))?;
            authorize(ctx, "default", &code, op.principal.as_deref(), "")?;
            let printer = ctx
                .registry
                .find_printer_mut(&name)
                .ok_or_else(|| SchedulerError::UnknownDestination(name))?;
            printer.state = PrinterState::Stopped;
            if !printer.state_reasons.iter().any(|r| r == "paused") {
                printer.state_reasons.push("paused".into());
            }
            ctx.registry.printers_dirty = true;
            ctx.events.publish(EventKind::PrinterStateChanged, Some(name), None, HashMap::new());
            Ok(OperationResponse::ok(vec![]))
        }

        ResumePrinter => {
            let name = op
                .printer_uri_name()
                .ok_or_else(|| SchedulerError::BadRequest("missing printer-uri".into()))?;
            authorize(ctx, "default", &code, op.principal.as_deref(), "")?;
            let printer = ctx
                .registry
                .find_printer_mut(&name)
                .ok_or_else(|| SchedulerError::UnknownDestination(name))?;
            printer.state = PrinterState::Idle;
            printer.state_reasons.retain(|r| r != "paused");
            ctx.registry.printers_dirty = true;
            ctx.events.publish(EventKind::PrinterStateChanged, Some(name), None, HashMap::new());
            Ok(OperationResponse::ok(vec![]))
        }

        PurgeJobs => {
            authorize(ctx, "default", &code, op.principal.as_deref(), "")?;
            let dest = op.printer_uri_name();
            let ids: Vec<JobId> = ctx.jobs.list(dest.as_deref(), None).into_iter().map(|j| j.id).collect();
            for id in ids {
                ctx.jobs.cancel(id, true)?;
            }
            Ok(OperationResponse::ok(vec![]))
        }

        SetPrinterAttributes | CupsAddModifyPrinter => {
            let name = op
                .printer_uri_name()
                .or_else(|| op.get(GroupTag::Operation, "printer-name").and_then(|v| v.as_text()).map(String::from))
                .ok_or_else(|| SchedulerError::BadRequest("missing printer-name".into()))?;
            authorize(ctx, "default", &code, op.principal.as_deref(), "")?;
            let hold_new_jobs = op.get(GroupTag::Operation, "printer-hold-new-jobs").and_then(|v| v.as_boolean());
            if ctx.registry.find_printer(&name).is_none() {
                let device_uri = op
                    .get(GroupTag::Operation, "device-uri")
                    .and_then(|v| v.as_text())
                    .unwrap_or("file:///dev/null")
                    .to_string();
                let mut printer = Printer::new(name, device_uri);
                if let Some(hold) = hold_new_jobs {
                    printer.hold_new_jobs = hold;
                }
                let events = ctx.registry.add_printer(printer)?;
                publish_registry_events(ctx, events);
            } else if let Some(hold) = hold_new_jobs {
                let name_for_event = name.clone();
                let printer = ctx.registry.find_printer_mut(&name).expect("checked above");
                printer.hold_new_jobs = hold;
                ctx.registry.printers_dirty = true;
                ctx.events.publish(EventKind::PrinterConfigChanged, Some(name_for_event), None, HashMap::new());
            }
            Ok(OperationResponse::ok(vec![]))
        }

        CupsDeletePrinter => {
            let name = op
                .printer_uri_name()
                .ok_or_else(|| SchedulerError::BadRequest("missing printer-uri".into()))?;
            authorize(ctx, "default", &code, op.principal.as_deref(), "")?;
            let has_jobs = ctx.jobs.active_count_for_printer(&name) > 0;
            let events = ctx.registry.delete_printer(&name, has_jobs)?;
            publish_registry_events(ctx, events);
            Ok(OperationResponse::ok(vec![]))
        }

        CupsAddModifyClass => {
            let name = op
                .get(GroupTag::Operation, "printer-name")
                .and_then(|v| v.as_text())
                .ok_or_else(|| SchedulerError::BadRequest("missing printer-name".into()))?
                .to_string();
            authorize(ctx, "default", &code, op.principal.as_deref(), "")?;
            if ctx.registry.find_class(&name).is_none() {
                let events = ctx.registry.add_class(Class::new(name))?;
                publish_registry_events(ctx, events);
            }
            Ok(OperationResponse::ok(vec![]))
        }

        CupsDeleteClass => {
            let name = op
                .get(GroupTag::Operation, "printer-name")
                .and_then(|v| v.as_text())
                .ok_or_else(|| SchedulerError::BadRequest("missing printer-name".into()))?
                .to_string();
            authorize(ctx, "default", &code, op.principal.as_deref(), "")?;
            let events = ctx.registry.delete_class(&name)?;
            publish_registry_events(ctx, events);
            Ok(OperationResponse::ok(vec![]))
        }

        CupsGetPrinters => {
            authorize(ctx, "default", &code, op.principal.as_deref(), "")?;
            Ok(OperationResponse::ok(ctx.registry.printers().map(printer_attributes_group).collect()))
        }

        CupsGetClasses => {
            authorize(ctx, "default", &code, op.principal.as_deref(), "")?;
            let groups = ctx
                .registry
                .classes()
                .map(|c| {
                    let mut g = AttributeGroup::new(GroupTag::Printer);
                    g.set("printer-name", AttributeValue::Keyword(c.name.clone()));
                    for member in &c.members {
                        g.set("member-names", AttributeValue::Keyword(member.clone()));
                    }
                    g
                })
                .collect();
            Ok(OperationResponse::ok(groups))
        }

        CupsMoveJob => {
            let id = op.job_id().ok_or_else(|| SchedulerError::BadRequest("missing job-id".into()))?;
            let job = ctx.jobs.get(id)?;
            let owner = job.owner.clone();
            let old_dest = job.destination.clone();
            authorize(ctx, "default", &code, op.principal.as_deref(), &owner)?;
            let new_dest = op
                .get(GroupTag::Job, "job-printer-uri")
                .and_then(|v| v.as_text())
                .ok_or_else(|| SchedulerError::BadRequest("missing job-printer-uri".into()))?
                .to_string();
            let dest_type = if ctx.registry.find_class(&new_dest).is_some() {
                DestinationType::Class
            } else {
                DestinationType::Printer
            };
            ctx.jobs.move_job(id, &new_dest, dest_type)?;
            ctx.events.publish(EventKind::JobStateChanged, Some(old_dest), Some(id), HashMap::new());
            ctx.events.publish(EventKind::JobStateChanged, Some(new_dest), Some(id), HashMap::new());
            Ok(OperationResponse::ok(vec![]))
        }

        CreatePrinterSubscription | CreateJobSubscription => {
            let owner = op
                .get(GroupTag::Operation, "requesting-user-name")
                .and_then(|v| v.as_text())
                .unwrap_or("anonymous")
                .to_string();
            authorize(ctx, "default", &code, op.principal.as_deref(), &owner)?;
            let mask: Vec<presswerk_core::types::EventKind> = op
                .attribute_groups
                .iter()
                .flat_map(|g| g.attributes.iter())
                .filter(|a| a.name == "notify-events")
                .filter_map(|a| a.value.as_keyword())
                .filter_map(event_kind_from_keyword)
                .collect();
            let mask = if mask.is_empty() { presswerk_core::types::EventKind::ALL.to_vec() } else { mask };
            let lease = op
                .get(GroupTag::Subscription, "notify-lease-duration")
                .and_then(|v| v.as_integer())
                .map(|v| v as i64)
                .unwrap_or(ctx.config.default_lease_duration_secs as i64);
            if ctx.config.max_subscriptions > 0
                && ctx.events.subscription_count() >= ctx.config.max_subscriptions as usize
            {
                return Err(SchedulerError::QuotaExceeded {
                    printer: op.printer_uri_name().unwrap_or_default(),
                    owner,
                });
            }
            let id = ctx.events.subscribe(
                mask,
                Recipient::Pull,
                &owner,
                op.printer_uri_name(),
                if code == CreateJobSubscription { op.job_id() } else { None },
                lease,
                ctx.config.max_events as usize,
            )?;
            let mut group = AttributeGroup::new(GroupTag::Subscription);
            group.set("notify-subscription-id", AttributeValue::Integer(id));
            Ok(OperationResponse::ok(vec![group]))
        }

        CancelSubscription => {
            let id = op
                .get(GroupTag::Operation, "notify-subscription-id")
                .and_then(|v| v.as_integer())
                .ok_or_else(|| SchedulerError::BadRequest("missing notify-subscription-id".into()))?;
            let owner = ctx.events.get(id)?.owner.clone();
            authorize(ctx, "default", &code, op.principal.as_deref(), &owner)?;
            ctx.events.cancel(id)?;
            Ok(OperationResponse::ok(vec![]))
        }

        GetSubscriptionAttributes => {
            let id = op
                .get(GroupTag::Operation, "notify-subscription-id")
                .and_then(|v| v.as_integer())
                .ok_or_else(|| SchedulerError::BadRequest("missing notify-subscription-id".into()))?;
            let sub = ctx.events.get(id)?;
            authorize(ctx, "default", &code, op.principal.as_deref(), &sub.owner)?;
            let mut group = AttributeGroup::new(GroupTag::Subscription);
            group.set("notify-subscription-id", AttributeValue::Integer(sub.id));
            Ok(OperationResponse::ok(vec![group]))
        }

        GetSubscriptions => {
            authorize(ctx, "default", &code, op.principal.as_deref(), "")?;
            let owner = op
                .get(GroupTag::Operation, "requesting-user-name")
                .and_then(|v| v.as_text());
            let groups = ctx
                .events
                .list(owner)
                .into_iter()
                .map(|s| {
                    let mut g = AttributeGroup::new(GroupTag::Subscription);
                    g.set("notify-subscription-id", AttributeValue::Integer(s.id));
                    g
                })
                .collect();
            Ok(OperationResponse::ok(groups))
        }

        RenewSubscription => {
            let id = op
                .get(GroupTag::Operation, "notify-subscription-id")
                .and_then(|v| v.as_integer())
                .ok_or_else(|| SchedulerError::BadRequest("missing notify-subscription-id".into()))?;
            let owner = ctx.events.get(id)?.owner.clone();
            authorize(ctx, "default", &code, op.principal.as_deref(), &owner)?;
            let lease = op
                .get(GroupTag::Subscription, "notify-lease-duration")
                .and_then(|v| v.as_integer())
                .map(|v| v as i64)
                .unwrap_or(ctx.config.default_lease_duration_secs as i64);
            ctx.events.renew(id, lease)?;
            Ok(OperationResponse::ok(vec![]))
        }

        GetNotifications => {
            let id = op
                .get(GroupTag::Operation, "notify-subscription-id")
                .and_then(|v| v.as_integer())
                .ok_or_else(|| SchedulerError::BadRequest("missing notify-subscription-id".into()))?;
            let owner = ctx.events.get(id)?.owner.clone();
            authorize(ctx, "default", &code, op.principal.as_deref(), &owner)?;
            let (drained, lost) = ctx.events.drain_pull(id)?;
            let mut groups: Vec<AttributeGroup> = drained
                .into_iter()
                .map(|e| {
                    let mut g = AttributeGroup::new(GroupTag::Subscription);
                    g.set("notify-sequence-number", AttributeValue::Integer(e.sequence as i32));
                    g
                })
                .collect();
            if lost > 0 {
                let mut g = AttributeGroup::new(GroupTag::Operation);
                g.set("notify-lost-events", AttributeValue::Integer(lost as i32));
                groups.push(g);
            }
            Ok(OperationResponse::ok(groups))
        }

        // Devices/PPDs enumeration depends on external collaborators
        // (the PPD parser, the device-discovery transport) that are out
        // of scope; exposed as empty result sets rather than omitted.
        CupsGetDevices => {
            authorize(ctx, "default", &code, op.principal.as_deref(), "")?;
            Ok(OperationResponse::ok(vec![]))
        }
        CupsGetPpds => {
            authorize(ctx, "default", &code, op.principal.as_deref(), "")?;
            Ok(OperationResponse::ok(vec![]))
        }

        CupsAuthenticateJob => {
            let id = op.job_id().ok_or_else(|| SchedulerError::BadRequest("missing job-id".into()))?;
            let owner = ctx.jobs.get(id)?.owner.clone();
            authorize(ctx, "default", &code, op.principal.as_deref(), &owner)?;
            Ok(OperationResponse::ok(vec![]))
        }

        PrintUri | SendUri => Err(SchedulerError::BadRequest(
            "URI-sourced documents require an external fetcher, not implemented here".into(),
        )),
    }
}

fn event_kind_from_keyword(keyword: &str) -> Option<presswerk_core::types::EventKind> {
    use presswerk_core::types::EventKind::*;
    Some(match keyword {
        "printer-state-changed" => PrinterStateChanged,
        "printer-config-changed" => PrinterConfigChanged,
        "printer-added" => PrinterAdded,
        "printer-deleted" => PrinterDeleted,
        "job-created" => JobCreated,
        "job-state-changed" => JobStateChanged,
        "job-completed" => JobCompleted,
        "job-stopped" => JobStopped,
        "job-progress" => JobProgress,
        "server-started" => ServerStarted,
        "server-restarted" => ServerRestarted,
        "server-stopped" => ServerStopped,
        "server-audit" => ServerAudit,
        "all" => return None,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn context_parts() -> (Registry, JobManager, EventBus, PolicyEngine, SchedulerConfig) {
        let mut registry = Registry::new(Duration::from_secs(5));
        registry.add_printer(Printer::new("P", "socket://127.0.0.1:9100")).unwrap();
        let jobs = JobManager::new();
        let events = EventBus::new(100);
        let mut policy = PolicyEngine::new(vec!["root".into()]);
        policy.add_policy(presswerk_core::types::Policy {
            name: "default".into(),
            ops: vec![presswerk_core::types::PolicyOp {
                operation: None,
                order: presswerk_core::types::PolicyOrder::AllowDeny,
                requires_authentication: false,
                entries: vec![presswerk_core::types::PolicyEntry {
                    action: presswerk_core::types::AllowDeny::Allow,
                    pattern: presswerk_core::types::PrincipalPattern::Any,
                }],
            }],
        });
        (registry, jobs, events, policy, SchedulerConfig::default())
    }

    fn op(code: OperationCode, groups: Vec<AttributeGroup>) -> ParsedOperation {
        ParsedOperation {
            operation_code: code as u16,
            principal: Some("alice".into()),
            attribute_groups: groups,
            document: None,
        }
    }

    #[test]
    fn create_job_allocates_and_publishes_event() {
        let (mut registry, mut jobs, mut events, policy, config) = context_parts();
        let mut ctx = DispatchContext {
            registry: &mut registry,
            jobs: &mut jobs,
            events: &mut events,
            policy: &policy,
            config: &config,
        };
        let mut op_group = AttributeGroup::new(GroupTag::Operation);
        op_group.set("printer-uri", AttributeValue::Keyword("ipp://host/printers/P".into()));
        let response = dispatch(&op(OperationCode::CreateJob, vec![op_group]), &mut ctx);
        assert_eq!(response.status, IppStatus::SuccessfulOk);
    }

    #[test]
    fn unknown_printer_yields_not_found() {
        let (mut registry, mut jobs, mut events, policy, config) = context_parts();
        let mut ctx = DispatchContext {
            registry: &mut registry,
            jobs: &mut jobs,
            events: &mut events,
            policy: &policy,
            config: &config,
        };
        let mut op_group = AttributeGroup::new(GroupTag::Operation);
        op_group.set("printer-uri", AttributeValue::Keyword("ipp://host/printers/Missing".into()));
        let response = dispatch(&op(OperationCode::ValidateJob, vec![op_group]), &mut ctx);
        assert_eq!(response.status, IppStatus::ClientErrorNotFound);
    }

    #[test]
    fn cancel_job_requires_existing_id() {
        let (mut registry, mut jobs, mut events, policy, config) = context_parts();
        let mut ctx = DispatchContext {
            registry: &mut registry,
            jobs: &mut jobs,
            events: &mut events,
            policy: &policy,
            config: &config,
        };
        let mut op_group = AttributeGroup::new(GroupTag::Operation);
        op_group.set("job-id", AttributeValue::Integer(99));
        let response = dispatch(&op(OperationCode::CancelJob, vec![op_group]), &mut ctx);
        assert_eq!(response.status, IppStatus::ClientErrorNotFound);
    }

    #[test]
    fn pause_then_resume_printer_clears_reason() {
        let (mut registry, mut jobs, mut events, policy, config) = context_parts();
        {
            let mut ctx = DispatchContext {
                registry: &mut registry,
                jobs: &mut jobs,
                events: &mut events,
                policy: &policy,
                config: &config,
            };
            let mut op_group = AttributeGroup::new(GroupTag::Operation);
            op_group.set("printer-uri", AttributeValue::Keyword("ipp://host/printers/P".into()));
            let response = dispatch(&op(OperationCode::PausePrinter, vec![op_group]), &mut ctx);
            assert_eq!(response.status, IppStatus::SuccessfulOk);
        }
        assert_eq!(registry.find_printer("P").unwrap().state, PrinterState::Stopped);

        let mut ctx = DispatchContext {
            registry: &mut registry,
            jobs: &mut jobs,
            events: &mut events,
            policy: &policy,
            config: &config,
        };
        let mut op_group = AttributeGroup::new(GroupTag::Operation);
        op_group.set("printer-uri", AttributeValue::Keyword("ipp://host/printers/P".into()));
        dispatch(&op(OperationCode::ResumePrinter, vec![op_group]), &mut ctx);
        assert_eq!(registry.find_printer("P").unwrap().state, PrinterState::Idle);
    }

    #[test]
    fn cancel_job_publishes_job_completed() {
        let (mut registry, mut jobs, mut events, policy, config) = context_parts();
        let id = jobs.create("alice", "P", DestinationType::Printer).unwrap();
        let sub_id = events
            .subscribe(vec![presswerk_core::types::EventKind::JobCompleted], presswerk_core::types::Recipient::Pull, "alice", None, None, 3600, 50)
            .unwrap();
        let mut ctx = DispatchContext {
            registry: &mut registry,
            jobs: &mut jobs,
            events: &mut events,
            policy: &policy,
            config: &config,
        };
        let mut op_group = AttributeGroup::new(GroupTag::Operation);
        op_group.set("job-id", AttributeValue::Integer(id));
        let response = dispatch(&op(OperationCode::CancelJob, vec![op_group]), &mut ctx);
        assert_eq!(response.status, IppStatus::SuccessfulOk);
        let (drained, _) = events.drain_pull(sub_id).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].kind, presswerk_core::types::EventKind::JobCompleted);
    }

    #[test]
    fn delete_printer_publishes_registry_event() {
        let (mut registry, mut jobs, mut events, policy, config) = context_parts();
        let mut ctx = DispatchContext {
            registry: &mut registry,
            jobs: &mut jobs,
            events: &mut events,
            policy: &policy,
            config: &config,
        };
        let mut op_group = AttributeGroup::new(GroupTag::Operation);
        op_group.set("printer-uri", AttributeValue::Keyword("ipp://host/printers/P".into()));
        let response = dispatch(&op(OperationCode::CupsDeletePrinter, vec![op_group]), &mut ctx);
        assert_eq!(response.status, IppStatus::SuccessfulOk);
        assert!(registry.find_printer("P").is_none());
    }

    #[test]
    fn create_job_subscription_defaults_to_all_events() {
        let (mut registry, mut jobs, mut events, policy, config) = context_parts();
        let mut ctx = DispatchContext {
            registry: &mut registry,
            jobs: &mut jobs,
            events: &mut events,
            policy: &policy,
            config: &config,
        };
        let op_group = AttributeGroup::new(GroupTag::Operation);
        let response = dispatch(&op(OperationCode::CreatePrinterSubscription, vec![op_group]), &mut ctx);
        assert_eq!(response.status, IppStatus::SuccessfulOk);
    }

    #[test]
    fn create_subscription_rejects_once_quota_full() {
        let (mut registry, mut jobs, mut events, policy, mut config) = context_parts();
        config.max_subscriptions = 1;
        {
            let mut ctx = DispatchContext {
                registry: &mut registry,
                jobs: &mut jobs,
                events: &mut events,
                policy: &policy,
                config: &config,
            };
            let op_group = AttributeGroup::new(GroupTag::Operation);
            let response = dispatch(&op(OperationCode::CreatePrinterSubscription, vec![op_group]), &mut ctx);
            assert_eq!(response.status, IppStatus::SuccessfulOk);
        }

        let mut ctx = DispatchContext {
            registry: &mut registry,
            jobs: &mut jobs,
            events: &mut events,
            policy: &policy,
            config: &config,
        };
        let op_group = AttributeGroup::new(GroupTag::Operation);
        let response = dispatch(&op(OperationCode::CreatePrinterSubscription, vec![op_group]), &mut ctx);
        assert_eq!(response.status, IppStatus::ServerErrorNotAcceptingJobs);
    }
}
