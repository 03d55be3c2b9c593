// src/core/registry.rs

//! The source of truth for which modules exist and whether they are usable.
//!
//! Entries are immutable and shared as `Arc<RegistryEntry>`. Every mutation
//! builds a new entry and swaps it in under the write lock, so a reader holding
//! a snapshot never observes a half-updated entry.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::{debug, info};

use crate::core::descriptor::{CapabilityFlag, ModuleDescriptor, ModuleVersion};
use crate::core::error::RegistrationError;
use crate::core::health::HealthSnapshot;
use crate::core::models::EventType;
use crate::core::module::ModuleHandle;

/// Lifecycle of a registry entry.
///
/// `Registered → Validated → Active ⇄ Quarantined → Retired`, plus
/// `Active → Retired` and `Validated → Retired`. `Retired` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Registered,
    Validated,
    Active,
    Quarantined,
    Retired,
}

impl LifecycleState {
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Registered, Validated)
                | (Validated, Active)
                | (Validated, Retired)
                | (Active, Quarantined)
                | (Active, Retired)
                | (Quarantined, Active)
                | (Quarantined, Retired)
        )
    }
}

/// An immutable point-in-time view of one registered module.
#[derive(Clone)]
pub struct RegistryEntry {
    descriptor: Arc<ModuleDescriptor>,
    state: LifecycleState,
    implementation: ModuleHandle,
    generation: u64,
    created_at: DateTime<Utc>,
    last_health: Option<HealthSnapshot>,
}

impl RegistryEntry {
    fn staged(descriptor: Arc<ModuleDescriptor>, implementation: ModuleHandle, generation: u64) -> Self {
        Self {
            descriptor,
            state: LifecycleState::Registered,
            implementation,
            generation,
            created_at: Utc::now(),
            last_health: None,
        }
    }

    fn transition(&self, next: LifecycleState) -> Result<Self, RegistrationError> {
        if !self.state.can_transition_to(next) {
            return Err(RegistrationError::InvalidTransition {
                id: self.id().to_string(),
                from: self.state,
                to: next,
            });
        }
        Ok(Self { state: next, ..self.clone() })
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn version(&self) -> ModuleVersion {
        self.descriptor.version
    }

    pub fn descriptor(&self) -> &Arc<ModuleDescriptor> {
        &self.descriptor
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn implementation(&self) -> ModuleHandle {
        Arc::clone(&self.implementation)
    }

    /// Bumped each time the entry is replaced by a reload.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Health of this module at the end of the most recent scan it ran in.
    pub fn last_health(&self) -> Option<&HealthSnapshot> {
        self.last_health.as_ref()
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("id", &self.descriptor.id)
            .field("version", &self.descriptor.version)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Criteria for [`Registry::list`]. Empty criteria match everything.
#[derive(Debug, Clone, Default)]
pub struct ModuleFilter {
    pub state: Option<LifecycleState>,
    pub required_flags: BTreeSet<CapabilityFlag>,
    pub forbidden_flags: BTreeSet<CapabilityFlag>,
    /// Matches modules that watch or produce this type.
    pub event_type: Option<EventType>,
}

impl ModuleFilter {
    pub fn in_state(mut self, state: LifecycleState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_flag(mut self, flag: CapabilityFlag) -> Self {
        self.required_flags.insert(flag);
        self
    }

    pub fn without_flag(mut self, flag: CapabilityFlag) -> Self {
        self.forbidden_flags.insert(flag);
        self
    }

    pub fn participating_in(mut self, event_type: impl Into<EventType>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn matches(&self, entry: &RegistryEntry) -> bool {
        let d = entry.descriptor();
        self.state.is_none_or(|s| s == entry.state())
            && self.required_flags.iter().all(|f| d.has_flag(*f))
            && !self.forbidden_flags.iter().any(|f| d.has_flag(*f))
            && self
                .event_type
                .as_ref()
                .is_none_or(|t| d.watches_type(t) || d.produces_type(t))
    }
}

#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, Arc<RegistryEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores a new module. The entry ends up `Validated`; it
    /// takes part in scans once moved to `Active`.
    ///
    /// # Errors
    /// * [`RegistrationError::InvalidDescriptor`] when validation fails.
    /// * [`RegistrationError::DuplicateModule`] when the id is already present
    ///   in any state, including `Retired`. New versions go through hot-reload.
    pub fn register(
        &self,
        descriptor: ModuleDescriptor,
        implementation: ModuleHandle,
    ) -> Result<(), RegistrationError> {
        descriptor.validate()?;
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&descriptor.id) {
            return Err(RegistrationError::DuplicateModule {
                id: descriptor.id.clone(),
                version: existing.version(),
            });
        }
        let entry = RegistryEntry::staged(Arc::new(descriptor), implementation, 0)
            .transition(LifecycleState::Validated)?;
        info!(module = %entry.id(), version = %entry.version(), "Module registered.");
        entries.insert(entry.id().to_string(), Arc::new(entry));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<RegistryEntry>> {
        self.entries.read().get(id).cloned()
    }

    /// Returns the entries matching `filter`, ordered by module id.
    pub fn list(&self, filter: &ModuleFilter) -> Vec<Arc<RegistryEntry>> {
        let mut matching: Vec<_> = self
            .entries
            .read()
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id().cmp(b.id()));
        matching
    }

    pub fn active(&self) -> Vec<Arc<RegistryEntry>> {
        self.list(&ModuleFilter::default().in_state(LifecycleState::Active))
    }

    /// Moves `id` to `next` if the lifecycle allows it, returning the previous state.
    ///
    /// # Errors
    /// [`RegistrationError::UnknownModule`] or [`RegistrationError::InvalidTransition`].
    pub fn set_state(&self, id: &str, next: LifecycleState) -> Result<LifecycleState, RegistrationError> {
        self.update_state(id, None, next)
    }

    /// Like [`Registry::set_state`], but only when the current state is `expected`.
    ///
    /// # Errors
    /// Additionally [`RegistrationError::StateConflict`] when the entry is not in `expected`.
    pub fn compare_and_set(
        &self,
        id: &str,
        expected: LifecycleState,
        next: LifecycleState,
    ) -> Result<(), RegistrationError> {
        self.update_state(id, Some(expected), next).map(|_| ())
    }

    fn update_state(
        &self,
        id: &str,
        expected: Option<LifecycleState>,
        next: LifecycleState,
    ) -> Result<LifecycleState, RegistrationError> {
        let mut entries = self.entries.write();
        let current = entries
            .get(id)
            .ok_or_else(|| RegistrationError::UnknownModule { id: id.to_string() })?;
        let previous = current.state();
        if let Some(expected) = expected {
            if previous != expected {
                return Err(RegistrationError::StateConflict {
                    id: id.to_string(),
                    expected,
                    actual: previous,
                });
            }
        }
        let updated = current.transition(next)?;
        entries.insert(id.to_string(), Arc::new(updated));
        info!(module = id, from = %previous, to = %next, "Module state changed.");
        Ok(previous)
    }

    /// Replaces the descriptor and implementation of `id` in one step.
    ///
    /// Quarantined and retired entries come back `Active`; a retired id gets a
    /// fresh entry with no health history. Returns the entry that was replaced.
    pub(crate) fn swap(
        &self,
        descriptor: Arc<ModuleDescriptor>,
        implementation: ModuleHandle,
    ) -> Result<Arc<RegistryEntry>, RegistrationError> {
        let mut entries = self.entries.write();
        let id = descriptor.id.clone();
        let previous = entries
            .get(&id)
            .cloned()
            .ok_or_else(|| RegistrationError::UnknownModule { id: id.clone() })?;

        let mut replacement = RegistryEntry::staged(descriptor, implementation, previous.generation() + 1);
        replacement.state = match previous.state() {
            LifecycleState::Registered | LifecycleState::Validated => LifecycleState::Validated,
            LifecycleState::Active | LifecycleState::Quarantined | LifecycleState::Retired => {
                LifecycleState::Active
            }
        };
        if previous.state() != LifecycleState::Retired {
            replacement.created_at = previous.created_at();
            replacement.last_health = previous.last_health.clone();
        }
        debug!(
            module = %id,
            generation = replacement.generation,
            state = %replacement.state,
            "Registry entry swapped."
        );
        entries.insert(id, Arc::new(replacement));
        Ok(previous)
    }

    /// Stores the health a module finished a scan with.
    pub fn record_health(&self, id: &str, snapshot: HealthSnapshot) {
        let mut entries = self.entries.write();
        if let Some(current) = entries.get(id) {
            let updated = RegistryEntry { last_health: Some(snapshot), ..RegistryEntry::clone(current) };
            entries.insert(id.to_string(), Arc::new(updated));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
