// src/core/mod.rs

// The module management core. Data flows descriptor → registry → resolver
// (per-scan activation plan) → dispatch, which drives the sandbox and feeds the
// health monitor, while hot-reload swaps registry entries underneath.

/// Events, event types, scan targets and scan states.
pub mod models;

/// Error enums for every fallible operation of the core.
pub mod error;

/// Module descriptors, versions, options and capability flags.
pub mod descriptor;

/// The `ScanModule` trait and the context handed to each invocation.
pub mod module;

/// The module registry and its lifecycle state machine.
pub mod registry;

/// Per-scan activation plans: fixed-point selection and setup ordering.
pub mod resolver;

/// Per-scan module health and quarantine.
pub mod health;

/// Timeouts, panic containment and emission limits around module code.
pub mod sandbox;

/// The per-scan dispatch loop.
pub mod dispatch;

/// Version swaps that respect running scans.
pub mod reload;

/// The `Engine` façade.
pub mod engine;

/// Built-in scan modules.
pub mod scanner;
