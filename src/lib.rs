// src/lib.rs

//! Module management core for a reconnaissance scanner.
//!
//! Scan modules declare the event types they watch and produce. The [`Engine`]
//! keeps them in a registry, resolves a per-scan activation plan, and
//! dispatches events through a sandbox that contains timeouts, panics and
//! runaway output, quarantining modules that keep failing. Modules can be
//! reloaded while scans run.

pub mod config;
pub mod core;
pub mod logging;

pub use crate::config::{ConfigError, EngineConfig};
pub use crate::logging::LoggingConfig;
pub use crate::core::descriptor::{CapabilityFlag, ModuleDescriptor, ModuleVersion, OptionValue};
pub use crate::core::dispatch::{EventSink, NullSink, ScanStatus};
pub use crate::core::engine::{Engine, ScanHandle, ScanRequest};
pub use crate::core::error::{
    InvocationFailure, ModuleError, RegistrationError, ReloadError, ResolutionError, ScanError,
};
pub use crate::core::models::{Emission, EventType, ScanEvent, ScanState, ScanTarget};
pub use crate::core::module::{ModuleContext, ModuleHandle, ScanModule};
pub use crate::core::registry::{LifecycleState, ModuleFilter};
