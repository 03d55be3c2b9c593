// src/core/sandbox.rs

//! Failure containment around module code.
//!
//! Each call runs on its own Tokio task so a panic stays inside the task, and
//! the wall-clock budget is enforced from the outside. A timed-out call is
//! signalled through its cancellation token and aborted; the executor never
//! waits for it to wind down.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, warn};

use crate::core::descriptor::{CapabilityFlag, ModuleDescriptor};
use crate::core::error::{InvocationFailure, ModuleError};
use crate::core::health::{HealthMonitor, InvocationOutcome, InvocationReport};
use crate::core::models::{Emission, ScanEvent};
use crate::core::module::{ModuleContext, ModuleHandle};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Budget for a module without a timeout class flag.
    pub default_timeout_ms: u64,
    /// Budget for modules flagged `slow` or `tool`.
    pub slow_timeout_ms: u64,
    /// Budget for the one-time `setup` hook.
    pub setup_timeout_ms: u64,
    /// Events a single invocation may emit; the rest are dropped as throttled.
    pub max_emissions: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 60_000,
            slow_timeout_ms: 300_000,
            setup_timeout_ms: 30_000,
            max_emissions: 10_000,
        }
    }
}

impl SandboxConfig {
    /// Picks the invocation budget for a module: its own override first, then
    /// its timeout class.
    pub fn timeout_for(&self, descriptor: &ModuleDescriptor) -> Duration {
        let millis = descriptor.timeout_ms.unwrap_or_else(|| {
            if descriptor.has_flag(CapabilityFlag::Slow) || descriptor.has_flag(CapabilityFlag::Tool) {
                self.slow_timeout_ms
            } else {
                self.default_timeout_ms
            }
        });
        Duration::from_millis(millis)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }
}

/// Everything needed to run one dispatch unit. The implementation handle is
/// captured when the invocation is built, so a later hot-reload cannot change
/// what this invocation runs.
pub struct Invocation {
    pub descriptor: Arc<ModuleDescriptor>,
    pub implementation: ModuleHandle,
    pub event: Arc<ScanEvent>,
    pub context: ModuleContext,
}

#[derive(Debug)]
pub struct InvocationResult {
    pub report: InvocationReport,
    /// Accepted emissions, already stamped with source and origin.
    pub events: Vec<ScanEvent>,
}

pub struct SandboxExecutor {
    config: SandboxConfig,
    health: Arc<HealthMonitor>,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig, health: Arc<HealthMonitor>) -> Self {
        Self { config, health }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Runs `handle` for one event under the module's budget.
    ///
    /// The outcome is recorded with the health monitor before this returns;
    /// nothing the module does can make this function fail.
    pub async fn invoke(&self, invocation: Invocation) -> InvocationResult {
        let Invocation { descriptor, implementation, event, context } = invocation;
        let budget = self.config.timeout_for(&descriptor);
        let started = Instant::now();

        let task_event = Arc::clone(&event);
        let task_context = context.clone();
        let outcome = contained(budget, &context, async move {
            implementation.handle(&task_event, &task_context).await
        })
        .await;
        let latency = started.elapsed();

        let (events, outcome) = match outcome {
            Ok(emissions) => {
                let admitted = self.admit(&descriptor, &event, emissions);
                let outcome = InvocationOutcome::Success {
                    emitted: admitted.events.len(),
                    throttled: admitted.throttled,
                    rejected: admitted.rejected,
                };
                (admitted.events, outcome)
            }
            Err(failure) => {
                debug!(module = %descriptor.id, event = %event.event_type, error = %failure, "Invocation contained.");
                (Vec::new(), InvocationOutcome::Failure(failure))
            }
        };

        let report = InvocationReport { module_id: descriptor.id.clone(), latency, outcome };
        self.health.record(&report);
        InvocationResult { report, events }
    }

    /// Runs the module's one-time `setup` hook under the setup budget.
    ///
    /// # Errors
    /// The contained failure; the caller decides what a failed setup means.
    pub async fn setup(
        &self,
        descriptor: &ModuleDescriptor,
        implementation: ModuleHandle,
        context: ModuleContext,
    ) -> Result<(), InvocationFailure> {
        let task_context = context.clone();
        let result = contained(self.config.setup_timeout(), &context, async move {
            implementation.setup(&task_context).await
        })
        .await;
        if let Err(failure) = &result {
            warn!(module = %descriptor.id, error = %failure, "Module setup failed.");
        }
        result
    }

    fn admit(&self, descriptor: &ModuleDescriptor, origin: &ScanEvent, emissions: Vec<Emission>) -> Admitted {
        let mut admitted = Admitted::default();
        for emission in emissions {
            if !descriptor.produces_type(&emission.event_type) {
                debug!(
                    module = %descriptor.id,
                    event_type = %emission.event_type,
                    "Dropping emission of undeclared event type."
                );
                admitted.rejected += 1;
            } else if admitted.events.len() >= self.config.max_emissions {
                admitted.throttled += 1;
            } else {
                admitted.events.push(ScanEvent::derived(emission, &descriptor.id, origin));
            }
        }
        if admitted.throttled > 0 {
            warn!(
                module = %descriptor.id,
                dropped = admitted.throttled,
                cap = self.config.max_emissions,
                "Invocation throttled: emission cap reached."
            );
        }
        if admitted.rejected > 0 {
            warn!(module = %descriptor.id, dropped = admitted.rejected, "Emissions of undeclared types dropped.");
        }
        admitted
    }
}

#[derive(Default)]
struct Admitted {
    events: Vec<ScanEvent>,
    throttled: usize,
    rejected: usize,
}

/// Drives `work` on its own task within `budget`.
///
/// On timeout the context's token is cancelled and the task aborted. The
/// `AbortOnDropHandle` also aborts the task if this future is itself dropped,
/// which is how a hard-cancelled scan reclaims module tasks.
async fn contained<F, T>(budget: Duration, context: &ModuleContext, work: F) -> Result<T, InvocationFailure>
where
    F: Future<Output = Result<T, ModuleError>> + Send + 'static,
    T: Send + 'static,
{
    let mut task = AbortOnDropHandle::new(tokio::spawn(work));
    match timeout(budget, &mut task).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(err))) => Err(InvocationFailure::ModuleError { message: err.message().to_string() }),
        Ok(Err(join_err)) if join_err.is_panic() => Err(InvocationFailure::Panicked {
            message: panic_message(join_err.into_panic()),
        }),
        Ok(Err(_)) => Err(InvocationFailure::Cancelled),
        Err(_) => {
            context.cancellation_token().cancel();
            task.abort();
            Err(InvocationFailure::Timeout { after: budget })
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
