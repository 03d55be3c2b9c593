// src/core/engine.rs

//! The façade callers drive: module management plus scan lifecycle.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::core::descriptor::{ModuleDescriptor, ModuleVersion, OptionValue};
use crate::core::dispatch::{EventSink, ScanContext, ScanStatus};
use crate::core::error::{RegistrationError, ReloadError, ScanError};
use crate::core::models::{EventType, ScanState, ScanTarget};
use crate::core::module::ModuleHandle;
use crate::core::registry::{LifecycleState, ModuleFilter, Registry, RegistryEntry};
use crate::core::reload::{HotReloadManager, ReloadReceipt};
use crate::core::resolver::{Selection, resolve};

/// What to scan and which modules may take part.
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    target: String,
    extra_seeds: BTreeSet<EventType>,
    include: BTreeSet<String>,
    exclude: BTreeSet<String>,
    wanted: BTreeSet<EventType>,
    options: BTreeMap<String, BTreeMap<String, OptionValue>>,
}

impl ScanRequest {
    pub fn new(target: impl Into<String>) -> Self {
        Self { target: target.into(), ..Self::default() }
    }

    /// Seeds an extra event type on top of the ones the target implies.
    pub fn seed(mut self, event_type: impl Into<EventType>) -> Self {
        self.extra_seeds.insert(event_type.into());
        self
    }

    pub fn include(mut self, module_id: impl Into<String>) -> Self {
        self.include.insert(module_id.into());
        self
    }

    pub fn exclude(mut self, module_id: impl Into<String>) -> Self {
        self.exclude.insert(module_id.into());
        self
    }

    /// Narrows the scan to modules that help produce `event_type`.
    pub fn want(mut self, event_type: impl Into<EventType>) -> Self {
        self.wanted.insert(event_type.into());
        self
    }

    pub fn option(
        mut self,
        module_id: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<OptionValue>,
    ) -> Self {
        self.options
            .entry(module_id.into())
            .or_default()
            .insert(name.into(), value.into());
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn selection(&self, target: &ScanTarget) -> Selection {
        let mut seed_types = target.seed_types();
        seed_types.extend(self.extra_seeds.iter().cloned());
        Selection {
            seed_types,
            include: self.include.clone(),
            exclude: self.exclude.clone(),
            wanted_types: self.wanted.clone(),
            module_options: self.options.clone(),
        }
    }
}

/// A caller's reference to a started scan.
#[derive(Clone)]
pub struct ScanHandle {
    context: Arc<ScanContext>,
    state: watch::Receiver<ScanState>,
}

impl ScanHandle {
    pub fn id(&self) -> Uuid {
        self.context.id()
    }

    pub fn state(&self) -> ScanState {
        *self.state.borrow()
    }

    pub fn status(&self) -> ScanStatus {
        self.context.status()
    }

    /// Waits for the scan to reach a terminal state and returns its final status.
    pub async fn wait(&self) -> ScanStatus {
        let mut state = self.state.clone();
        // The sender lives in the context this handle keeps alive.
        let _ = state.wait_for(ScanState::is_terminal).await;
        self.context.status()
    }
}

/// A scan as the engine tracks it: the live context until the supervisor is
/// done, then only its final status.
#[derive(Clone)]
enum ScanSlot {
    Live(Arc<ScanContext>),
    Ended(ScanStatus),
}

impl ScanSlot {
    fn status(&self) -> ScanStatus {
        match self {
            ScanSlot::Live(context) => context.status(),
            ScanSlot::Ended(status) => status.clone(),
        }
    }

    fn is_terminal(&self) -> bool {
        match self {
            ScanSlot::Live(context) => context.state().is_terminal(),
            ScanSlot::Ended(_) => true,
        }
    }
}

/// Running scans plus the final status of the most recent finished ones.
struct ScanTable {
    slots: DashMap<Uuid, ScanSlot>,
    ended: Mutex<VecDeque<Uuid>>,
    retained: usize,
}

impl ScanTable {
    fn new(retained: usize) -> Self {
        Self { slots: DashMap::new(), ended: Mutex::new(VecDeque::new()), retained }
    }

    fn get(&self, scan_id: Uuid) -> Result<ScanSlot, ScanError> {
        self.slots
            .get(&scan_id)
            .map(|entry| entry.value().clone())
            .ok_or(ScanError::UnknownScan(scan_id))
    }

    /// Swaps a finished scan's context for its final status and evicts the
    /// oldest finished scans beyond the retention limit.
    fn settle(&self, context: &ScanContext) {
        let scan_id = context.id();
        let Some(mut slot) = self.slots.get_mut(&scan_id) else {
            // Forgotten before the supervisor got here.
            return;
        };
        *slot = ScanSlot::Ended(context.status());
        drop(slot);

        let mut ended = self.ended.lock();
        ended.push_back(scan_id);
        while ended.len() > self.retained {
            let Some(evicted) = ended.pop_front() else {
                break;
            };
            if self.slots.remove_if(&evicted, |_, slot| slot.is_terminal()).is_some() {
                debug!(scan = %evicted, "Finished scan evicted.");
            }
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    registry: Arc<Registry>,
    reloads: Arc<HotReloadManager>,
    scans: Arc<ScanTable>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let reloads = Arc::new(HotReloadManager::new(Arc::clone(&registry)));
        let scans = Arc::new(ScanTable::new(config.retained_scans));
        Self { config, registry, reloads, scans }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // --- Module management ---

    /// Registers and activates a module.
    ///
    /// # Errors
    /// See [`Registry::register`].
    pub fn register_module(
        &self,
        descriptor: ModuleDescriptor,
        implementation: ModuleHandle,
    ) -> Result<(), RegistrationError> {
        let id = descriptor.id.clone();
        self.registry.register(descriptor, implementation)?;
        self.registry.set_state(&id, LifecycleState::Active)?;
        Ok(())
    }

    /// # Errors
    /// See [`HotReloadManager::reload`].
    pub fn reload_module(
        &self,
        descriptor: ModuleDescriptor,
        implementation: ModuleHandle,
    ) -> Result<ReloadReceipt, ReloadError> {
        self.reloads.reload(descriptor, implementation)
    }

    pub fn pending_reloads(&self) -> BTreeMap<String, ModuleVersion> {
        self.reloads.pending()
    }

    pub fn list_modules(&self, filter: &ModuleFilter) -> Vec<Arc<RegistryEntry>> {
        self.registry.list(filter)
    }

    pub fn get_module(&self, id: &str) -> Option<Arc<RegistryEntry>> {
        self.registry.get(id)
    }

    /// Takes a module out of service for good. Running scans drop its pending
    /// work and any deferred reload of it is cancelled; only a new reload
    /// brings the id back.
    pub fn retire_module(&self, id: &str) -> Result<(), RegistrationError> {
        self.reloads.retire(id).map(|_| ())
    }

    /// Bans a module from new scans until it is reinstated or reloaded.
    pub fn quarantine_module(&self, id: &str) -> Result<(), RegistrationError> {
        self.registry.set_state(id, LifecycleState::Quarantined).map(|_| ())
    }

    pub fn reinstate_module(&self, id: &str) -> Result<(), RegistrationError> {
        self.registry
            .compare_and_set(id, LifecycleState::Quarantined, LifecycleState::Active)
    }

    // --- Scans ---

    /// Resolves the activation plan and starts the scan in the background.
    ///
    /// Nothing runs when resolution fails. Must be called from within a Tokio
    /// runtime.
    ///
    /// # Errors
    /// [`ScanError::Target`] for unparsable targets and [`ScanError::Resolution`]
    /// for an invalid module graph.
    pub fn start_scan(&self, request: ScanRequest, sink: Arc<dyn EventSink>) -> Result<ScanHandle, ScanError> {
        let target = ScanTarget::parse(request.target())?;
        let selection = request.selection(&target);
        let scan_id = Uuid::new_v4();

        let plan = self
            .reloads
            .lease(scan_id, || resolve(&self.registry.list(&ModuleFilter::default()), &selection))?;

        let context = Arc::new(ScanContext::new(
            scan_id,
            target,
            plan,
            Arc::clone(&self.registry),
            sink,
            self.config.dispatch_settings(),
        ));
        let handle = ScanHandle { context: Arc::clone(&context), state: context.subscribe() };
        self.scans.slots.insert(scan_id, ScanSlot::Live(Arc::clone(&context)));

        tokio::spawn(supervise(
            context,
            Arc::clone(&self.registry),
            Arc::clone(&self.reloads),
            Arc::clone(&self.scans),
        ));
        Ok(handle)
    }

    /// Asks a scan to stop. Returns `false` if it had already ended.
    pub fn abort_scan(&self, scan_id: Uuid) -> Result<bool, ScanError> {
        match self.scans.get(scan_id)? {
            ScanSlot::Live(context) => Ok(context.abort()),
            ScanSlot::Ended(_) => Ok(false),
        }
    }

    /// Status of a running scan, or the final status of a recently finished
    /// one. Finished scans beyond `retained_scans` are no longer known.
    pub fn scan_status(&self, scan_id: Uuid) -> Result<ScanStatus, ScanError> {
        Ok(self.scans.get(scan_id)?.status())
    }

    /// Lifts a module's quarantine within one running scan. Events the module
    /// missed while quarantined are not replayed; later ones reach it again.
    ///
    /// Returns `false` when the scan has ended or the module was not
    /// quarantined in it.
    pub fn reinstate_in_scan(&self, scan_id: Uuid, module_id: &str) -> Result<bool, ScanError> {
        match self.scans.get(scan_id)? {
            ScanSlot::Live(context) if !context.state().is_terminal() => Ok(context.health().reinstate(module_id)),
            _ => Ok(false),
        }
    }

    /// Drops a finished scan from the engine, returning its final status.
    pub fn forget_scan(&self, scan_id: Uuid) -> Option<ScanStatus> {
        let (_, slot) = self.scans.slots.remove_if(&scan_id, |_, slot| slot.is_terminal())?;
        self.scans.ended.lock().retain(|id| *id != scan_id);
        Some(slot.status())
    }

    /// Ids of scans that have not reached a terminal state.
    pub fn running_scans(&self) -> Vec<Uuid> {
        self.scans
            .slots
            .iter()
            .filter(|entry| !entry.value().is_terminal())
            .map(|entry| *entry.key())
            .collect()
    }

    /// Ids of every scan the engine still answers for, finished ones included.
    pub fn known_scans(&self) -> Vec<Uuid> {
        self.scans.slots.iter().map(|entry| *entry.key()).collect()
    }
}

/// Runs a scan to completion, then writes health back to the registry and
/// releases its reload lease before publishing the terminal state. The scan's
/// working state is freed and the engine keeps only its final status.
async fn supervise(
    context: Arc<ScanContext>,
    registry: Arc<Registry>,
    reloads: Arc<HotReloadManager>,
    scans: Arc<ScanTable>,
) {
    let scan_id = context.id();
    let state = match tokio::spawn(Arc::clone(&context).run()).await {
        Ok(state) => state,
        Err(err) => {
            error!(scan = %scan_id, error = %err, "Scan dispatch loop crashed.");
            ScanState::Failed
        }
    };
    context.release_working_state();

    for (module_id, snapshot) in context.health().snapshots() {
        registry.record_health(&module_id, snapshot);
    }
    let applied = reloads.release(scan_id);
    if !applied.is_empty() {
        info!(scan = %scan_id, reloads = applied.len(), "Deferred reloads applied after scan.");
    }

    context.finish(state);
    scans.settle(&context);
    info!(scan = %scan_id, state = %state, "Scan finished.");
}
