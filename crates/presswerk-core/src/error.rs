// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error type for the scheduler, grouped by the kind taxonomy the
// error handling design uses to pick an IPP status code and a log level:
// bad-request, not-found, forbidden/not-authenticated, conflict, quota,
// spool-io, filter-transient, filter-fatal, internal.

use thiserror::Error;

/// Top-level error type for all scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    // -- bad-request --
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("attribute error: {0}")]
    AttributeError(String),

    // -- not-found --
    #[error("unknown job id: {0}")]
    UnknownJob(i32),

    #[error("unknown printer or class: {0}")]
    UnknownDestination(String),

    #[error("unknown subscription id: {0}")]
    UnknownSubscription(i32),

    // -- forbidden / not-authenticated --
    #[error("operation forbidden by policy")]
    Forbidden,

    #[error("authentication required")]
    NotAuthenticated,

    // -- conflict --
    #[error("operation not possible in current state: {0}")]
    NotPossible(String),

    #[error("destination already exists: {0}")]
    AlreadyExists(String),

    // -- quota --
    #[error("quota exceeded for printer {printer}, owner {owner}")]
    QuotaExceeded { printer: String, owner: String },

    // -- spool-io --
    #[error("spool I/O error: {0}")]
    SpoolIo(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    // -- filter-transient / filter-fatal --
    #[error("filter pipeline requested retry (printer {printer} stopped: {reason})")]
    FilterTransient { printer: String, reason: String },

    #[error("filter pipeline failed fatally: {0}")]
    FilterFatal(String),

    #[error("no filter path from {src} to {dst}")]
    NoFilterPath { src: String, dst: String },

    // -- internal --
    #[error("internal invariant violation: {0}")]
    Internal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(String),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// The error-kind taxonomy from the error handling design, used to pick an
/// IPP status code and a log level without re-deriving it from the
/// `SchedulerError` variant at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    Forbidden,
    NotAuthenticated,
    Conflict,
    Quota,
    SpoolIo,
    FilterTransient,
    FilterFatal,
    Internal,
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::BadRequest(_) | SchedulerError::AttributeError(_) => {
                ErrorKind::BadRequest
            }
            SchedulerError::UnknownJob(_)
            | SchedulerError::UnknownDestination(_)
            | SchedulerError::UnknownSubscription(_) => ErrorKind::NotFound,
            SchedulerError::Forbidden => ErrorKind::Forbidden,
            SchedulerError::NotAuthenticated => ErrorKind::NotAuthenticated,
            SchedulerError::NotPossible(_) | SchedulerError::AlreadyExists(_) => {
                ErrorKind::Conflict
            }
            SchedulerError::QuotaExceeded { .. } => ErrorKind::Quota,
            SchedulerError::SpoolIo(_) | SchedulerError::Io(_) => ErrorKind::SpoolIo,
            SchedulerError::FilterTransient { .. } => ErrorKind::FilterTransient,
            SchedulerError::FilterFatal(_) | SchedulerError::NoFilterPath { .. } => {
                ErrorKind::FilterFatal
            }
            SchedulerError::Internal(_)
            | SchedulerError::Serialization(_)
            | SchedulerError::Database(_) => ErrorKind::Internal,
        }
    }
}
