// src/core/reload.rs

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::descriptor::{ModuleContract, ModuleDescriptor, ModuleVersion};
use crate::core::error::{RegistrationError, ReloadError};
use crate::core::module::ModuleHandle;
use crate::core::registry::{LifecycleState, Registry};
use crate::core::resolver::ActivationPlan;

/// What a completed reload changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadReceipt {
    pub module_id: String,
    pub previous_version: ModuleVersion,
    pub version: ModuleVersion,
    pub generation: u64,
    pub state: LifecycleState,
}

struct PendingReload {
    descriptor: Arc<ModuleDescriptor>,
    implementation: ModuleHandle,
    requested_at: DateTime<Utc>,
    /// Lifecycle state of the entry when the reload was parked.
    requested_in: LifecycleState,
}

#[derive(Default)]
struct ReloadState {
    /// Contracts each running scan's activation plan was computed from.
    leases: HashMap<Uuid, BTreeMap<String, ModuleContract>>,
    pending: BTreeMap<String, PendingReload>,
}

/// Swaps module versions in the registry without disturbing running scans.
///
/// A reload that keeps the module's watched/produced/dependency contract is
/// applied at once: invocations already submitted keep the implementation
/// they captured and new submissions pick up the new one. A reload that
/// changes the contract of a module some running scan was resolved with is
/// parked until the last such scan releases its lease.
pub struct HotReloadManager {
    registry: Arc<Registry>,
    state: Mutex<ReloadState>,
}

impl HotReloadManager {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry, state: Mutex::new(ReloadState::default()) }
    }

    /// Resolves a plan for `scan_id` and records its contracts, with reloads
    /// held off until the lease is in place.
    pub fn lease<E>(
        &self,
        scan_id: Uuid,
        resolve: impl FnOnce() -> Result<ActivationPlan, E>,
    ) -> Result<ActivationPlan, E> {
        let mut state = self.state.lock();
        let plan = resolve()?;
        state.leases.insert(scan_id, plan.contracts());
        Ok(plan)
    }

    /// Drops the lease of a finished scan and applies every deferred reload
    /// that no remaining scan blocks.
    pub fn release(&self, scan_id: Uuid) -> Vec<ReloadReceipt> {
        let mut state = self.state.lock();
        if state.leases.remove(&scan_id).is_none() {
            return Vec::new();
        }

        let ready: Vec<String> = state
            .pending
            .iter()
            .filter(|(id, pending)| blocking_scans(&state.leases, id, &pending.descriptor.contract()).is_empty())
            .map(|(id, _)| id.clone())
            .collect();

        let mut receipts = Vec::new();
        for id in ready {
            let Some(pending) = state.pending.remove(&id) else {
                continue;
            };
            let waited = Utc::now() - pending.requested_at;
            let current = self.registry.get(&id).map(|entry| entry.state());
            if current != Some(pending.requested_in) {
                warn!(
                    module = %id,
                    version = %pending.descriptor.version,
                    "Deferred reload dropped: module changed state while it waited."
                );
                continue;
            }
            match self.apply(pending.descriptor, pending.implementation) {
                Ok(receipt) => {
                    info!(
                        module = %id,
                        version = %receipt.version,
                        waited_ms = waited.num_milliseconds(),
                        "Deferred reload applied."
                    );
                    receipts.push(receipt);
                }
                Err(err) => warn!(module = %id, error = %err, "Deferred reload dropped."),
            }
        }
        receipts
    }

    /// Validates and installs a new version of an already registered module.
    ///
    /// # Errors
    /// * [`ReloadError::Registration`] for an invalid descriptor or unknown id.
    /// * [`ReloadError::IncompatibleVersion`] when the version is not newer
    ///   than both the installed and any pending version.
    /// * [`ReloadError::Deferred`] when running scans depend on the current
    ///   contract; the reload is kept and applied once they finish.
    pub fn reload(
        &self,
        descriptor: ModuleDescriptor,
        implementation: ModuleHandle,
    ) -> Result<ReloadReceipt, ReloadError> {
        descriptor.validate()?;
        let mut state = self.state.lock();
        let id = descriptor.id.clone();
        let current = self
            .registry
            .get(&id)
            .ok_or_else(|| RegistrationError::UnknownModule { id: id.clone() })?;

        let baseline = state
            .pending
            .get(&id)
            .map_or(current.version(), |p| p.descriptor.version.max(current.version()));
        if descriptor.version <= baseline {
            return Err(ReloadError::IncompatibleVersion { id, current: baseline, proposed: descriptor.version });
        }

        let blocking = blocking_scans(&state.leases, &id, &descriptor.contract());
        if !blocking.is_empty() {
            info!(
                module = %id,
                version = %descriptor.version,
                blocking = blocking.len(),
                "Reload deferred: running scans depend on the current contract."
            );
            state.pending.insert(
                id.clone(),
                PendingReload {
                    descriptor: Arc::new(descriptor),
                    implementation,
                    requested_at: Utc::now(),
                    requested_in: current.state(),
                },
            );
            return Err(ReloadError::Deferred { id, blocking_scans: blocking });
        }

        // A compatible reload supersedes anything still waiting.
        state.pending.remove(&id);
        self.apply(Arc::new(descriptor), implementation).map_err(ReloadError::from)
    }

    /// Retires a module and cancels any reload still waiting for it, returning
    /// the cancelled version.
    ///
    /// # Errors
    /// See [`Registry::set_state`].
    pub fn retire(&self, id: &str) -> Result<Option<ModuleVersion>, RegistrationError> {
        let mut state = self.state.lock();
        self.registry.set_state(id, LifecycleState::Retired)?;
        let cancelled = state.pending.remove(id).map(|p| p.descriptor.version);
        if let Some(version) = cancelled {
            info!(module = id, version = %version, "Pending reload cancelled by retirement.");
        }
        Ok(cancelled)
    }

    /// Versions waiting for running scans to finish, by module id.
    pub fn pending(&self) -> BTreeMap<String, ModuleVersion> {
        self.state
            .lock()
            .pending
            .iter()
            .map(|(id, p)| (id.clone(), p.descriptor.version))
            .collect()
    }

    pub fn active_leases(&self) -> usize {
        self.state.lock().leases.len()
    }

    fn apply(
        &self,
        descriptor: Arc<ModuleDescriptor>,
        implementation: ModuleHandle,
    ) -> Result<ReloadReceipt, RegistrationError> {
        let version = descriptor.version;
        let previous = self.registry.swap(descriptor, implementation)?;
        let current = self
            .registry
            .get(previous.id())
            .ok_or_else(|| RegistrationError::UnknownModule { id: previous.id().to_string() })?;
        info!(
            module = %previous.id(),
            from = %previous.version(),
            to = %version,
            generation = current.generation(),
            "Module reloaded."
        );
        Ok(ReloadReceipt {
            module_id: previous.id().to_string(),
            previous_version: previous.version(),
            version,
            generation: current.generation(),
            state: current.state(),
        })
    }
}

fn blocking_scans(
    leases: &HashMap<Uuid, BTreeMap<String, ModuleContract>>,
    module_id: &str,
    proposed: &ModuleContract,
) -> Vec<Uuid> {
    let mut blocking: Vec<Uuid> = leases
        .iter()
        .filter(|(_, contracts)| contracts.get(module_id).is_some_and(|assumed| assumed != proposed))
        .map(|(scan, _)| *scan)
        .collect();
    blocking.sort();
    blocking
}
