// src/core/dispatch.rs

//! The per-scan event loop: setup, seeding, fan-out and abort.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::health::{HealthMonitor, HealthPolicy, HealthSnapshot, QuarantineReason};
use crate::core::models::{EventKey, ScanEvent, ScanState, ScanTarget};
use crate::core::module::ModuleContext;
use crate::core::registry::{LifecycleState, Registry};
use crate::core::resolver::ActivationPlan;
use crate::core::sandbox::{Invocation, InvocationResult, SandboxConfig, SandboxExecutor};

/// Receives every distinct event a scan finalizes, exactly once per event key.
pub trait EventSink: Send + Sync {
    fn on_event_finalized(&self, event: &ScanEvent);
}

impl EventSink for mpsc::UnboundedSender<ScanEvent> {
    fn on_event_finalized(&self, event: &ScanEvent) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.send(event.clone());
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn on_event_finalized(&self, _event: &ScanEvent) {}
}

struct DispatchUnit {
    module_id: String,
    event: Arc<ScanEvent>,
}

/// At-most-once identity of a dispatch: which module saw which event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DispatchKey {
    module_id: String,
    event: EventKey,
}

/// Point-in-time view of a scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanStatus {
    pub scan_id: Uuid,
    pub target: String,
    pub state: ScanState,
    pub modules: BTreeMap<String, HealthSnapshot>,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub invocations_submitted: u64,
    pub events_emitted: u64,
    pub duplicates_suppressed: u64,
    pub quarantined_modules: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Tunables a scan takes from the engine configuration.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_concurrency: usize,
    pub abort_grace_period: Duration,
    pub sandbox: SandboxConfig,
    pub health: HealthPolicy,
}

/// All state of one running scan. Explicitly constructed per scan and shared
/// between the engine façade and the dispatch loop.
pub struct ScanContext {
    id: Uuid,
    target: Arc<ScanTarget>,
    plan: Arc<ActivationPlan>,
    registry: Arc<Registry>,
    health: Arc<HealthMonitor>,
    sandbox: SandboxExecutor,
    sink: Arc<dyn EventSink>,
    queue: Mutex<VecDeque<DispatchUnit>>,
    seen: DashSet<DispatchKey>,
    finalized: DashSet<EventKey>,
    permits: Arc<Semaphore>,
    cancellation: CancellationToken,
    state: watch::Sender<ScanState>,
    grace_period: Duration,
    in_flight: AtomicUsize,
    submitted: AtomicU64,
    emitted: AtomicU64,
    duplicates: AtomicU64,
    started_at: DateTime<Utc>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
}

impl ScanContext {
    pub fn new(
        id: Uuid,
        target: ScanTarget,
        plan: ActivationPlan,
        registry: Arc<Registry>,
        sink: Arc<dyn EventSink>,
        settings: DispatchSettings,
    ) -> Self {
        let health = Arc::new(HealthMonitor::new(settings.health, plan.activation_set()));
        let sandbox = SandboxExecutor::new(settings.sandbox, Arc::clone(&health));
        let (state, _) = watch::channel(ScanState::Created);
        Self {
            id,
            target: Arc::new(target),
            plan: Arc::new(plan),
            registry,
            health,
            sandbox,
            sink,
            queue: Mutex::new(VecDeque::new()),
            seen: DashSet::new(),
            finalized: DashSet::new(),
            permits: Arc::new(Semaphore::new(settings.max_concurrency.max(1))),
            cancellation: CancellationToken::new(),
            state,
            grace_period: settings.abort_grace_period,
            in_flight: AtomicUsize::new(0),
            submitted: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            started_at: Utc::now(),
            finished_at: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn target(&self) -> &ScanTarget {
        &self.target
    }

    pub fn plan(&self) -> &ActivationPlan {
        &self.plan
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn state(&self) -> ScanState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ScanState> {
        self.state.subscribe()
    }

    /// Requests an abort. Returns `false` when the scan already ended.
    pub fn abort(&self) -> bool {
        let accepted = self.state.send_if_modified(|state| {
            if matches!(state, ScanState::Created | ScanState::Running) {
                *state = ScanState::Aborting;
                true
            } else {
                false
            }
        });
        if accepted {
            info!(scan = %self.id, "Abort requested.");
            self.cancellation.cancel();
        }
        accepted
    }

    /// Moves the scan into its terminal state. Only the first call wins.
    pub(crate) fn finish(&self, terminal: ScanState) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *self.finished_at.lock() = Some(Utc::now());
            *state = terminal;
            true
        });
    }

    /// Frees the dedup sets and the queue once the scan is over. Counters and
    /// health stay, so [`ScanContext::status`] keeps answering.
    pub(crate) fn release_working_state(&self) {
        let dropped = std::mem::take(&mut *self.queue.lock()).len();
        let (seen, finalized) = (self.seen.len(), self.finalized.len());
        self.seen.clear();
        self.seen.shrink_to_fit();
        self.finalized.clear();
        self.finalized.shrink_to_fit();
        debug!(scan = %self.id, dropped, seen, finalized, "Scan working state released.");
    }

    pub fn status(&self) -> ScanStatus {
        ScanStatus {
            scan_id: self.id,
            target: self.target.value.clone(),
            state: self.state(),
            modules: self.health.snapshots(),
            queue_depth: self.queue.lock().len(),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            invocations_submitted: self.submitted.load(Ordering::SeqCst),
            events_emitted: self.emitted.load(Ordering::SeqCst),
            duplicates_suppressed: self.duplicates.load(Ordering::SeqCst),
            quarantined_modules: self.health.quarantined_count(),
            started_at: self.started_at,
            finished_at: *self.finished_at.lock(),
        }
    }

    /// Drives the scan until the queue drains with nothing in flight, or until
    /// it is aborted. Returns the terminal state the caller should publish.
    pub async fn run(self: Arc<Self>) -> ScanState {
        self.state.send_if_modified(|state| {
            if *state == ScanState::Created {
                *state = ScanState::Running;
                true
            } else {
                false
            }
        });
        info!(scan = %self.id, target = %self.target, modules = self.plan.len(), "Scan started.");

        self.run_setup().await;
        self.seed();

        let mut tasks: JoinSet<InvocationResult> = JoinSet::new();
        let mut failed = false;

        while !self.cancellation.is_cancelled() {
            while let Some(joined) = tasks.try_join_next() {
                failed |= self.complete(joined, true);
            }

            let next = self.queue.lock().pop_front();
            let Some(unit) = next else {
                if tasks.is_empty() {
                    break;
                }
                tokio::select! {
                    _ = self.cancellation.cancelled() => break,
                    Some(joined) = tasks.join_next() => failed |= self.complete(joined, true),
                }
                continue;
            };

            let module_id = unit.module_id.as_str();
            if self.health.is_quarantined(module_id) {
                debug!(scan = %self.id, module = module_id, "Skipping unit for quarantined module.");
                continue;
            }
            let key = DispatchKey { module_id: unit.module_id.clone(), event: unit.event.key() };
            if !self.seen.insert(key) {
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Quarantine may have landed while we waited for a slot.
            if self.health.is_quarantined(module_id) {
                continue;
            }
            let Some(invocation) = self.prepare(&unit) else {
                continue;
            };

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            self.submitted.fetch_add(1, Ordering::SeqCst);
            let ctx = Arc::clone(&self);
            tasks.spawn(async move {
                let result = ctx.sandbox.invoke(invocation).await;
                drop(permit);
                result
            });
        }

        if self.cancellation.is_cancelled() {
            self.wind_down(&mut tasks).await;
        }

        let status = self.status();
        info!(
            scan = %self.id,
            invocations = status.invocations_submitted,
            events = status.events_emitted,
            duplicates = status.duplicates_suppressed,
            quarantined = status.quarantined_modules,
            "Scan dispatch finished."
        );
        if failed { ScanState::Failed } else { ScanState::Finished }
    }

    /// Runs setup hooks in dependency order. A failed setup quarantines the
    /// module and everything that depends on it.
    async fn run_setup(&self) {
        for module_id in self.plan.setup_order() {
            if self.cancellation.is_cancelled() {
                return;
            }
            if self.health.is_quarantined(module_id) {
                continue;
            }
            let Some(entry) = self.registry.get(module_id) else {
                self.quarantine_with_dependents(module_id, "module vanished from the registry".to_string());
                continue;
            };
            let context = self.module_context(module_id);
            debug!(scan = %self.id, module = %module_id, "Running module setup.");
            if let Err(failure) = self.sandbox.setup(entry.descriptor(), entry.implementation(), context).await {
                self.quarantine_with_dependents(module_id, failure.to_string());
            }
        }
    }

    fn quarantine_with_dependents(&self, module_id: &str, error: String) {
        self.health.quarantine(module_id, QuarantineReason::SetupFailed, Some(error));
        for dependent in self.plan.dependents_of(module_id) {
            self.health.quarantine(
                &dependent,
                QuarantineReason::DependencyFailed,
                Some(format!("dependency '{module_id}' failed setup")),
            );
        }
    }

    fn seed(&self) {
        for seed_type in self.plan.seed_types() {
            self.finalize(ScanEvent::seed(seed_type.clone(), self.target.value.clone()), true);
        }
    }

    /// Hands a first occurrence to the sink and, when `enqueue` is set, fans it
    /// out to every watcher other than its source.
    fn finalize(&self, event: ScanEvent, enqueue: bool) {
        if !self.finalized.insert(event.key()) {
            self.duplicates.fetch_add(1, Ordering::SeqCst);
            return;
        }
        self.emitted.fetch_add(1, Ordering::SeqCst);
        self.sink.on_event_finalized(&event);
        if !enqueue {
            return;
        }

        let event = Arc::new(event);
        let mut queue = self.queue.lock();
        for consumer in self.plan.consumers_of(&event.event_type) {
            if consumer == event.source_module {
                continue;
            }
            queue.push_back(DispatchUnit { module_id: consumer.to_string(), event: Arc::clone(&event) });
        }
    }

    /// Looks up the module's current implementation. Units for modules that
    /// were retired or banned since the scan started are dropped.
    fn prepare(&self, unit: &DispatchUnit) -> Option<Invocation> {
        let entry = self.registry.get(&unit.module_id)?;
        if matches!(entry.state(), LifecycleState::Retired | LifecycleState::Quarantined) {
            debug!(scan = %self.id, module = %unit.module_id, state = %entry.state(), "Dropping unit for unavailable module.");
            return None;
        }
        Some(Invocation {
            descriptor: Arc::clone(entry.descriptor()),
            implementation: entry.implementation(),
            event: Arc::clone(&unit.event),
            context: self.module_context(&unit.module_id),
        })
    }

    fn module_context(&self, module_id: &str) -> ModuleContext {
        ModuleContext::new(
            self.id,
            module_id,
            Arc::clone(&self.target),
            self.plan.options(module_id),
            self.cancellation.child_token(),
        )
    }

    /// Folds a finished task back in. Returns `true` if the task itself
    /// panicked, which only happens outside module code.
    fn complete(&self, joined: Result<InvocationResult, JoinError>, enqueue: bool) -> bool {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match joined {
            Ok(result) => {
                for event in result.events {
                    self.finalize(event, enqueue);
                }
                false
            }
            Err(err) if err.is_panic() => {
                error!(scan = %self.id, error = %err, "Dispatch task panicked.");
                true
            }
            Err(_) => false,
        }
    }

    /// Gives in-flight invocations the grace period, then hard-cancels them.
    async fn wind_down(&self, tasks: &mut JoinSet<InvocationResult>) {
        let dropped = {
            let mut queue = self.queue.lock();
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        info!(scan = %self.id, in_flight = tasks.len(), dropped, "Scan aborting.");

        let drained = timeout(self.grace_period, async {
            while let Some(joined) = tasks.join_next().await {
                self.complete(joined, false);
            }
        })
        .await;

        if drained.is_err() {
            warn!(scan = %self.id, remaining = tasks.len(), "Grace period elapsed; cancelling in-flight invocations.");
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                self.complete(joined, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptor::{ModuleDescriptor, ModuleVersion};
    use crate::core::error::ModuleError;
    use crate::core::models::Emission;
    use crate::core::module::ScanModule;
    use crate::core::resolver::{Selection, resolve};
    use async_trait::async_trait;

    /// Emits a fixed list of events for every input.
    struct Echo(Vec<(&'static str, &'static str)>);

    #[async_trait]
    impl ScanModule for Echo {
        async fn handle(&self, _: &ScanEvent, _: &ModuleContext) -> Result<Vec<Emission>, ModuleError> {
            Ok(self.0.iter().map(|(t, d)| Emission::new(*t, *d)).collect())
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            max_concurrency: 4,
            abort_grace_period: Duration::from_millis(100),
            sandbox: SandboxConfig::default(),
            health: HealthPolicy::default(),
        }
    }

    fn context(modules: Vec<(ModuleDescriptor, Echo)>) -> (Arc<ScanContext>, mpsc::UnboundedReceiver<ScanEvent>) {
        let registry = Arc::new(Registry::new());
        for (descriptor, module) in modules {
            let id = descriptor.id.clone();
            registry.register(descriptor, Arc::new(module)).expect("register");
            registry.set_state(&id, LifecycleState::Active).expect("activate");
        }
        let target = ScanTarget::parse("example.com").expect("target");
        let selection = Selection { seed_types: target.seed_types(), ..Selection::default() };
        let plan = resolve(&registry.active(), &selection).expect("plan");
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = ScanContext::new(Uuid::new_v4(), target, plan, registry, Arc::new(tx), settings());
        (Arc::new(ctx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ScanEvent>) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn seeds_reach_the_sink_and_fan_out() {
        let (ctx, mut rx) = context(vec![(
            ModuleDescriptor::new("resolver", ModuleVersion::new(1, 0, 0))
                .watches("INTERNET_NAME")
                .produces("IP_ADDRESS"),
            Echo(vec![("IP_ADDRESS", "93.184.216.34")]),
        )]);

        assert_eq!(Arc::clone(&ctx).run().await, ScanState::Finished);

        let events = drain(&mut rx);
        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["INTERNET_NAME", "ROOT", "IP_ADDRESS"]);
        assert_eq!(events[2].source_module, "resolver");
        assert_eq!(ctx.status().invocations_submitted, 1);
    }

    #[tokio::test]
    async fn released_state_keeps_the_counters() {
        let (ctx, _rx) = context(vec![(
            ModuleDescriptor::new("resolver", ModuleVersion::new(1, 0, 0))
                .watches("INTERNET_NAME")
                .produces("IP_ADDRESS"),
            Echo(vec![("IP_ADDRESS", "93.184.216.34")]),
        )]);
        Arc::clone(&ctx).run().await;
        assert_eq!(ctx.finalized.len(), 3);
        assert_eq!(ctx.seen.len(), 1);

        ctx.release_working_state();
        assert!(ctx.seen.is_empty());
        assert!(ctx.finalized.is_empty());
        let status = ctx.status();
        assert_eq!(status.events_emitted, 3);
        assert_eq!(status.queue_depth, 0);
    }

    #[tokio::test]
    async fn a_module_never_receives_its_own_events() {
        let (ctx, mut rx) = context(vec![(
            ModuleDescriptor::new("looper", ModuleVersion::new(1, 0, 0))
                .watches("INTERNET_NAME")
                .produces("INTERNET_NAME"),
            Echo(vec![("INTERNET_NAME", "mail.example.com")]),
        )]);

        Arc::clone(&ctx).run().await;

        assert_eq!(ctx.status().invocations_submitted, 1);
        assert_eq!(drain(&mut rx).len(), 3);
    }

    #[tokio::test]
    async fn repeated_emissions_are_counted_as_duplicates() {
        let (ctx, mut rx) = context(vec![
            (
                ModuleDescriptor::new("a", ModuleVersion::new(1, 0, 0)).watches("ROOT").produces("ALPHA"),
                Echo(vec![("ALPHA", "x"), ("ALPHA", "x")]),
            ),
            (
                ModuleDescriptor::new("b", ModuleVersion::new(1, 0, 0)).watches("ALPHA"),
                Echo(Vec::new()),
            ),
        ]);

        Arc::clone(&ctx).run().await;

        let status = ctx.status();
        assert_eq!(status.duplicates_suppressed, 1);
        assert_eq!(status.invocations_submitted, 2);
        assert_eq!(drain(&mut rx).iter().filter(|e| e.event_type.as_str() == "ALPHA").count(), 1);
    }

    #[tokio::test]
    async fn abort_before_run_finishes_without_dispatch() {
        let (ctx, mut rx) = context(vec![(
            ModuleDescriptor::new("resolver", ModuleVersion::new(1, 0, 0)).watches("INTERNET_NAME"),
            Echo(Vec::new()),
        )]);

        assert!(ctx.abort());
        assert_eq!(ctx.state(), ScanState::Aborting);
        Arc::clone(&ctx).run().await;
        ctx.finish(ScanState::Finished);

        assert!(!ctx.abort());
        let status = ctx.status();
        assert_eq!(status.invocations_submitted, 0);
        assert_eq!(status.queue_depth, 0);
        assert!(status.finished_at.is_some());
        // Seeds are still finalized before the loop observes the abort.
        assert_eq!(drain(&mut rx).len(), 2);
    }
}
