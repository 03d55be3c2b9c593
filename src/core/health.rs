// src/core/health.rs

//! Per-scan circuit breaker for modules.
//!
//! Every scan gets its own [`HealthMonitor`], so quarantine never outlives the
//! scan that triggered it. Operator-level bans live in the registry instead.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{debug, info, warn};

use crate::core::error::InvocationFailure;

/// Thresholds deciding when a module is quarantined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    /// Quarantine after this many failures in a row.
    pub max_consecutive_failures: u32,
    /// Quarantine when the failure ratio exceeds this, in `(0, 1]`.
    pub failure_rate_threshold: f64,
    /// Invocations required before the failure ratio is considered.
    pub min_invocations_for_rate: u32,
    /// Number of recent latencies kept for the rolling average.
    pub latency_window: usize,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            failure_rate_threshold: 0.5,
            min_invocations_for_rate: 5,
            latency_window: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Active,
    Quarantined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    ConsecutiveFailures,
    FailureRate,
    SetupFailed,
    DependencyFailed,
}

/// Outcome of one sandboxed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    Success { emitted: usize, throttled: usize, rejected: usize },
    Failure(InvocationFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationReport {
    pub module_id: String,
    pub latency: Duration,
    pub outcome: InvocationOutcome,
}

/// Serialisable view of one module's health within a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub timeouts: u64,
    pub panics: u64,
    pub throttled_events: u64,
    pub rejected_events: u64,
    pub emitted_events: u64,
    pub mean_latency_ms: f64,
    pub rolling_latency_ms: f64,
    pub max_latency_ms: u64,
    pub last_error: Option<String>,
    pub quarantine_reason: Option<QuarantineReason>,
    pub quarantined_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct ModuleHealth {
    quarantine: Option<(QuarantineReason, DateTime<Utc>)>,
    invocations: u64,
    successes: u64,
    failures: u64,
    consecutive_failures: u32,
    timeouts: u64,
    panics: u64,
    throttled: u64,
    rejected: u64,
    emitted: u64,
    total_latency: Duration,
    max_latency: Duration,
    window: VecDeque<Duration>,
    last_error: Option<String>,
}

impl ModuleHealth {
    fn failure_rate(&self) -> f64 {
        if self.invocations == 0 {
            0.0
        } else {
            self.failures as f64 / self.invocations as f64
        }
    }

    fn snapshot(&self) -> HealthSnapshot {
        let mean = if self.invocations == 0 {
            0.0
        } else {
            self.total_latency.as_secs_f64() * 1000.0 / self.invocations as f64
        };
        let rolling = if self.window.is_empty() {
            0.0
        } else {
            self.window.iter().map(Duration::as_secs_f64).sum::<f64>() * 1000.0 / self.window.len() as f64
        };
        HealthSnapshot {
            status: if self.quarantine.is_some() { HealthStatus::Quarantined } else { HealthStatus::Active },
            invocations: self.invocations,
            successes: self.successes,
            failures: self.failures,
            consecutive_failures: self.consecutive_failures,
            timeouts: self.timeouts,
            panics: self.panics,
            throttled_events: self.throttled,
            rejected_events: self.rejected,
            emitted_events: self.emitted,
            mean_latency_ms: mean,
            rolling_latency_ms: rolling,
            max_latency_ms: u64::try_from(self.max_latency.as_millis()).unwrap_or(u64::MAX),
            last_error: self.last_error.clone(),
            quarantine_reason: self.quarantine.map(|(reason, _)| reason),
            quarantined_at: self.quarantine.map(|(_, at)| at),
        }
    }
}

pub struct HealthMonitor {
    policy: HealthPolicy,
    modules: Mutex<HashMap<String, ModuleHealth>>,
    quarantined: AtomicUsize,
}

impl HealthMonitor {
    /// Creates a monitor tracking `modules`, all starting `Active`.
    pub fn new<I, S>(policy: HealthPolicy, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let modules = modules.into_iter().map(|id| (id.into(), ModuleHealth::default())).collect();
        Self { policy, modules: Mutex::new(modules), quarantined: AtomicUsize::new(0) }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Folds an invocation outcome into the module's statistics.
    ///
    /// Returns the reason when this report is what tipped the module into
    /// quarantine; reports arriving after quarantine only update counters.
    pub fn record(&self, report: &InvocationReport) -> Option<QuarantineReason> {
        let mut modules = self.modules.lock();
        let health = modules.entry(report.module_id.clone()).or_default();

        health.invocations += 1;
        health.total_latency += report.latency;
        health.max_latency = health.max_latency.max(report.latency);
        health.window.push_back(report.latency);
        while health.window.len() > self.policy.latency_window.max(1) {
            health.window.pop_front();
        }

        match &report.outcome {
            InvocationOutcome::Success { emitted, throttled, rejected } => {
                health.successes += 1;
                health.consecutive_failures = 0;
                health.emitted += *emitted as u64;
                health.throttled += *throttled as u64;
                health.rejected += *rejected as u64;
                return None;
            }
            InvocationOutcome::Failure(failure) => {
                health.failures += 1;
                health.consecutive_failures += 1;
                match failure {
                    InvocationFailure::Timeout { .. } => health.timeouts += 1,
                    InvocationFailure::Panicked { .. } => health.panics += 1,
                    InvocationFailure::ModuleError { .. } | InvocationFailure::Cancelled => {}
                }
                health.last_error = Some(failure.to_string());
                debug!(
                    module = %report.module_id,
                    consecutive = health.consecutive_failures,
                    error = %failure,
                    "Invocation failed."
                );
            }
        }

        if health.quarantine.is_some() {
            return None;
        }

        let reason = if health.consecutive_failures >= self.policy.max_consecutive_failures {
            QuarantineReason::ConsecutiveFailures
        } else if health.invocations >= u64::from(self.policy.min_invocations_for_rate)
            && health.failure_rate() > self.policy.failure_rate_threshold
        {
            QuarantineReason::FailureRate
        } else {
            return None;
        };

        health.quarantine = Some((reason, Utc::now()));
        self.quarantined.fetch_add(1, Ordering::SeqCst);
        warn!(
            module = %report.module_id,
            reason = %reason,
            failures = health.failures,
            invocations = health.invocations,
            "Module quarantined for the remainder of the scan."
        );
        Some(reason)
    }

    /// Quarantines a module outright, e.g. after its setup failed.
    /// Returns `false` if it already was.
    pub fn quarantine(&self, module_id: &str, reason: QuarantineReason, error: Option<String>) -> bool {
        let mut modules = self.modules.lock();
        let health = modules.entry(module_id.to_string()).or_default();
        if health.quarantine.is_some() {
            return false;
        }
        health.quarantine = Some((reason, Utc::now()));
        if error.is_some() {
            health.last_error = error;
        }
        self.quarantined.fetch_add(1, Ordering::SeqCst);
        warn!(module = module_id, reason = %reason, "Module quarantined for the remainder of the scan.");
        true
    }

    /// Lifts an in-scan quarantine and clears the failure streak.
    pub fn reinstate(&self, module_id: &str) -> bool {
        let mut modules = self.modules.lock();
        let Some(health) = modules.get_mut(module_id) else {
            return false;
        };
        if health.quarantine.take().is_none() {
            return false;
        }
        health.consecutive_failures = 0;
        self.quarantined.fetch_sub(1, Ordering::SeqCst);
        info!(module = module_id, "Module reinstated.");
        true
    }

    pub fn is_quarantined(&self, module_id: &str) -> bool {
        self.modules
            .lock()
            .get(module_id)
            .is_some_and(|h| h.quarantine.is_some())
    }

    pub fn quarantined_count(&self) -> usize {
        self.quarantined.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, module_id: &str) -> Option<HealthSnapshot> {
        self.modules.lock().get(module_id).map(ModuleHealth::snapshot)
    }

    pub fn snapshots(&self) -> BTreeMap<String, HealthSnapshot> {
        self.modules
            .lock()
            .iter()
            .map(|(id, h)| (id.clone(), h.snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ok(module: &str) -> InvocationReport {
        InvocationReport {
            module_id: module.to_string(),
            latency: Duration::from_millis(10),
            outcome: InvocationOutcome::Success { emitted: 1, throttled: 0, rejected: 0 },
        }
    }

    fn failed(module: &str) -> InvocationReport {
        InvocationReport {
            module_id: module.to_string(),
            latency: Duration::from_millis(30),
            outcome: InvocationOutcome::Failure(InvocationFailure::ModuleError { message: "boom".into() }),
        }
    }

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthPolicy::default(), ["m"])
    }

    #[test]
    fn third_consecutive_failure_quarantines() {
        let health = monitor();
        assert_eq!(health.record(&failed("m")), None);
        assert_eq!(health.record(&failed("m")), None);
        assert_eq!(health.record(&failed("m")), Some(QuarantineReason::ConsecutiveFailures));
        assert!(health.is_quarantined("m"));
        assert_eq!(health.quarantined_count(), 1);

        // Further failures neither re-trigger nor double count.
        assert_eq!(health.record(&failed("m")), None);
        assert_eq!(health.quarantined_count(), 1);
    }

    #[test]
    fn success_resets_the_streak() {
        let health = monitor();
        health.record(&failed("m"));
        health.record(&failed("m"));
        health.record(&ok("m"));
        health.record(&failed("m"));
        assert!(!health.is_quarantined("m"));
        assert_eq!(health.snapshot("m").expect("tracked").consecutive_failures, 1);
    }

    #[test]
    fn failure_rate_applies_after_minimum_invocations() {
        let health = monitor();
        // F S F S F -> 3/5 = 60% with no streak longer than one.
        for report in [failed("m"), ok("m"), failed("m"), ok("m")] {
            assert_eq!(health.record(&report), None);
        }
        assert_eq!(health.record(&failed("m")), Some(QuarantineReason::FailureRate));
    }

    #[rstest]
    #[case(InvocationFailure::Timeout { after: Duration::from_secs(1) }, 1, 0)]
    #[case(InvocationFailure::Panicked { message: "oops".into() }, 0, 1)]
    fn failure_kinds_are_counted(#[case] failure: InvocationFailure, #[case] timeouts: u64, #[case] panics: u64) {
        let health = monitor();
        health.record(&InvocationReport {
            module_id: "m".into(),
            latency: Duration::from_millis(5),
            outcome: InvocationOutcome::Failure(failure),
        });
        let snap = health.snapshot("m").expect("tracked");
        assert_eq!(snap.timeouts, timeouts);
        assert_eq!(snap.panics, panics);
        assert!(snap.last_error.is_some());
    }

    #[test]
    fn reinstatement_clears_quarantine() {
        let health = monitor();
        assert!(health.quarantine("m", QuarantineReason::SetupFailed, Some("no key".into())));
        assert!(!health.quarantine("m", QuarantineReason::SetupFailed, None));
        assert!(health.reinstate("m"));
        assert!(!health.is_quarantined("m"));
        assert_eq!(health.quarantined_count(), 0);
        assert!(!health.reinstate("m"));
    }

    #[test]
    fn latency_window_is_bounded() {
        let policy = HealthPolicy { latency_window: 2, ..HealthPolicy::default() };
        let health = HealthMonitor::new(policy, ["m"]);
        health.record(&failed("m"));
        health.record(&ok("m"));
        health.record(&ok("m"));
        let snap = health.snapshot("m").expect("tracked");
        assert!((snap.rolling_latency_ms - 10.0).abs() < 1e-6);
        assert_eq!(snap.max_latency_ms, 30);
        assert_eq!(snap.invocations, 3);
    }
}
