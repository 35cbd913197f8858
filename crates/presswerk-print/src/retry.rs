// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Retry engine with exponential backoff + jitter, keyed to `FaxRetryLimit`
// and `FaxRetryInterval`, and the filter exit-code classification from the
// filter pipeline executor's failure handling.

use std::time::Duration;

use presswerk_core::SchedulerConfig;
use tracing::{debug, warn};

/// The outcome a filter or backend process reports via its exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    Success,
    Abort,
    Hold,
    StopPrinterPaused,
    StopPrinterRetry,
    HoldJobStopPrinter,
    /// Any undocumented code in 6..=255, or termination by an uncaught
    /// signal.
    FatalUnknown,
}

impl FilterOutcome {
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => FilterOutcome::Success,
            1 => FilterOutcome::Abort,
            2 => FilterOutcome::Hold,
            3 => FilterOutcome::StopPrinterPaused,
            4 => FilterOutcome::StopPrinterRetry,
            5 => FilterOutcome::HoldJobStopPrinter,
            _ => FilterOutcome::FatalUnknown,
        }
    }

    /// Whether this outcome should be retried automatically (exit code 4).
    pub fn is_transient(self) -> bool {
        matches!(self, FilterOutcome::StopPrinterRetry)
    }
}

/// Retry configuration, derived from `SchedulerConfig`.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl From<&SchedulerConfig> for RetryConfig {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            max_retries: cfg.fax_retry_limit,
            base_delay: Duration::from_secs(cfg.fax_retry_interval_secs),
            max_delay: Duration::from_secs(cfg.fax_retry_interval_secs.saturating_mul(8)),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(300),
            max_delay: Duration::from_secs(2_400),
        }
    }
}

/// Result of evaluating whether to retry a stopped printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Exhausted,
}

/// Decide whether a printer stopped by a transient (exit-code-4) failure
/// should be retried given how many attempts have already been made.
pub fn should_retry(tries: u32, config: &RetryConfig) -> RetryDecision {
    if tries >= config.max_retries {
        warn!(tries, max = config.max_retries, "retry limit exhausted");
        RetryDecision::Exhausted
    } else {
        let delay = compute_delay(tries, config);
        debug!(tries, delay_secs = delay.as_secs(), "scheduling retry");
        RetryDecision::RetryAfter(delay)
    }
}

/// Compute exponential backoff delay with jitter.
///
/// delay = min(base * 2^attempt + jitter, max_delay)
pub fn compute_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let base_ms = config.base_delay.as_millis() as u64;
    let exp_ms = base_ms.saturating_mul(1u64 << attempt.min(10));
    let jitter_ms = jitter(base_ms, attempt);
    let total_ms = exp_ms.saturating_add(jitter_ms);
    let capped_ms = total_ms.min(config.max_delay.as_millis() as u64);
    Duration::from_millis(capped_ms)
}

/// Deterministic jitter derived from the attempt number, spread across
/// `[0, base_ms)`.
fn jitter(base_ms: u64, attempt: u32) -> u64 {
    let hash = (attempt as u64).wrapping_mul(6364136223846793005);
    hash % base_ms.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_classify_into_documented_outcomes() {
        assert_eq!(FilterOutcome::from_exit_code(0), FilterOutcome::Success);
        assert_eq!(FilterOutcome::from_exit_code(1), FilterOutcome::Abort);
        assert_eq!(FilterOutcome::from_exit_code(2), FilterOutcome::Hold);
        assert_eq!(
            FilterOutcome::from_exit_code(3),
            FilterOutcome::StopPrinterPaused
        );
        assert_eq!(
            FilterOutcome::from_exit_code(4),
            FilterOutcome::StopPrinterRetry
        );
        assert_eq!(
            FilterOutcome::from_exit_code(5),
            FilterOutcome::HoldJobStopPrinter
        );
        assert_eq!(FilterOutcome::from_exit_code(42), FilterOutcome::FatalUnknown);
    }

    #[test]
    fn only_exit_code_4_is_transient() {
        assert!(FilterOutcome::StopPrinterRetry.is_transient());
        assert!(!FilterOutcome::Abort.is_transient());
        assert!(!FilterOutcome::FatalUnknown.is_transient());
    }

    #[test]
    fn retry_respects_max() {
        let config = RetryConfig {
            max_retries: 3,
            ..Default::default()
        };
        assert!(matches!(should_retry(0, &config), RetryDecision::RetryAfter(_)));
        assert_eq!(should_retry(3, &config), RetryDecision::Exhausted);
    }

    #[test]
    fn delay_increases_with_attempts() {
        let config = RetryConfig::default();
        let d0 = compute_delay(0, &config);
        let d1 = compute_delay(1, &config);
        let d2 = compute_delay(2, &config);
        assert!(d1 > d0);
        assert!(d2 > d1);
    }

    #[test]
    fn delay_capped_at_max() {
        let config = RetryConfig {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let d = compute_delay(20, &config);
        assert!(d <= Duration::from_secs(10));
    }

    #[test]
    fn defaults_match_fax_retry_tunables() {
        let cfg = SchedulerConfig::default();
        let retry_cfg = RetryConfig::from(&cfg);
        assert_eq!(retry_cfg.max_retries, 5);
        assert_eq!(retry_cfg.base_delay, Duration::from_secs(300));
    }
}
