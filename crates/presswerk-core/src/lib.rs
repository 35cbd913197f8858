// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Presswerk core — domain types, error definitions and configuration shared
// across the scheduler crates.

pub mod attrs;
pub mod config;
pub mod error;
pub mod types;

pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError};
pub use types::*;
