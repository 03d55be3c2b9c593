// src/core/error.rs

//! Error taxonomy of the module management core.
//!
//! Structural failures (bad descriptors, cycles, registry misuse) propagate to
//! the caller. Failures that originate inside module code are captured as
//! [`InvocationFailure`] at the sandbox boundary and never escape a scan.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::core::descriptor::ModuleVersion;
use crate::core::registry::LifecycleState;

/// Errors raised by registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("module '{id}' has an invalid descriptor: {reason}")]
    InvalidDescriptor { id: String, reason: String },

    #[error("module '{id}' is already registered at version {version}")]
    DuplicateModule { id: String, version: ModuleVersion },

    #[error("module '{id}' is not registered")]
    UnknownModule { id: String },

    #[error("module '{id}' cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: LifecycleState, to: LifecycleState },

    #[error("module '{id}' is {actual}, expected {expected}")]
    StateConflict { id: String, expected: LifecycleState, actual: LifecycleState },
}

/// Errors that stop a scan before any module runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("explicit dependencies form a cycle: {}", modules.join(" -> "))]
    CyclicDependency { modules: Vec<String> },

    #[error("module '{module}' depends on '{dependency}', which is not registered")]
    UnresolvedDependency { module: String, dependency: String },

    #[error("included module '{id}' is not an active module")]
    UnknownModule { id: String },

    #[error("option '{option}' of module '{module}' is invalid: {reason}")]
    InvalidOption { module: String, option: String, reason: String },

    #[error("scan declares no seed event types and includes no modules")]
    NoSeedTypes,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("scan target is empty")]
    Empty,

    #[error("scan target '{input}' is invalid: {reason}")]
    Invalid { input: String, reason: String },
}

/// Errors returned by `start_scan` and the other scan-level operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error("scan {0} is not known to this engine")]
    UnknownScan(Uuid),
}

/// Errors returned by a hot-reload request. Both `Deferred` and
/// `IncompatibleVersion` are retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReloadError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("module '{id}' version {proposed} is not newer than {current}")]
    IncompatibleVersion { id: String, current: ModuleVersion, proposed: ModuleVersion },

    #[error("reload of module '{id}' deferred until {} running scan(s) finish", blocking_scans.len())]
    Deferred { id: String, blocking_scans: Vec<Uuid> },
}

/// The error type module implementations return from their hooks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ModuleError {
    message: String,
}

impl ModuleError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    /// Wraps any error, keeping its display text.
    pub fn from_error(error: &dyn std::error::Error) -> Self {
        Self::new(error.to_string())
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for ModuleError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ModuleError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// How a single sandboxed invocation failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationFailure {
    #[error("timed out after {}ms", after.as_millis())]
    Timeout { after: Duration },

    #[error("module error: {message}")]
    ModuleError { message: String },

    #[error("module panicked: {message}")]
    Panicked { message: String },

    #[error("invocation cancelled")]
    Cancelled,
}
