// src/core/module.rs

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::core::descriptor::OptionValue;
use crate::core::error::ModuleError;
use crate::core::models::{Emission, ScanEvent, ScanTarget};

/// The single entry point every scan module implements.
///
/// Implementations must be cheap to share: the registry hands the same
/// `Arc` to every concurrent invocation. A module that needs per-scan state
/// keys it by [`ModuleContext::scan_id`].
#[async_trait]
pub trait ScanModule: Send + Sync {
    /// One-time initialisation, run once per scan in dependency order before
    /// any event is dispatched.
    async fn setup(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Handles one event and returns whatever it discovered.
    ///
    /// Long-running work should watch [`ModuleContext::cancelled`]; the
    /// sandbox abandons the call on timeout or scan abort either way.
    async fn handle(&self, event: &ScanEvent, ctx: &ModuleContext) -> Result<Vec<Emission>, ModuleError>;
}

/// Shared handle to a module implementation, as stored in the registry.
pub type ModuleHandle = Arc<dyn ScanModule>;

/// Per-invocation view of the scan a module is running in.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    scan_id: Uuid,
    module_id: String,
    target: Arc<ScanTarget>,
    options: Arc<BTreeMap<String, OptionValue>>,
    cancellation: CancellationToken,
}

impl ModuleContext {
    pub fn new(
        scan_id: Uuid,
        module_id: impl Into<String>,
        target: Arc<ScanTarget>,
        options: Arc<BTreeMap<String, OptionValue>>,
        cancellation: CancellationToken,
    ) -> Self {
        Self { scan_id, module_id: module_id.into(), target, options, cancellation }
    }

    pub fn scan_id(&self) -> Uuid {
        self.scan_id
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    pub fn target(&self) -> &ScanTarget {
        &self.target
    }

    pub fn options(&self) -> &BTreeMap<String, OptionValue> {
        &self.options
    }

    pub fn option(&self, name: &str) -> Option<&OptionValue> {
        self.options.get(name)
    }

    pub fn option_bool(&self, name: &str) -> Option<bool> {
        self.option(name).and_then(OptionValue::as_bool)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the invocation has been asked to stop.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation.cancelled()
    }

    pub(crate) fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }
}
