#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore, mpsc};

use vanguard_engine::{
    Emission, Engine, EngineConfig, ModuleContext, ModuleDescriptor, ModuleError, ModuleVersion, ScanEvent,
    ScanModule,
};

/// Shared record of `(module label, event data)` for every invocation.
#[derive(Clone, Default)]
pub struct InvocationLog(Arc<Mutex<Vec<(String, String)>>>);

impl InvocationLog {
    pub fn record(&self, label: &str, data: &str) {
        self.0.lock().push((label.to_string(), data.to_string()));
    }

    pub fn entries(&self) -> Vec<(String, String)> {
        self.0.lock().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.0.lock().iter().map(|(label, _)| label.clone()).collect()
    }

    pub fn count(&self, label: &str) -> usize {
        self.0.lock().iter().filter(|(l, _)| l == label).count()
    }
}

type Handler = dyn Fn(&ScanEvent) -> Result<Vec<Emission>, ModuleError> + Send + Sync;

/// A module whose behaviour is a closure, logging every call.
pub struct Scripted {
    label: String,
    log: InvocationLog,
    handler: Box<Handler>,
    fail_setup: bool,
}

impl Scripted {
    pub fn new(
        label: &str,
        log: &InvocationLog,
        handler: impl Fn(&ScanEvent) -> Result<Vec<Emission>, ModuleError> + Send + Sync + 'static,
    ) -> Self {
        Self { label: label.to_string(), log: log.clone(), handler: Box::new(handler), fail_setup: false }
    }

    /// Emits nothing.
    pub fn quiet(label: &str, log: &InvocationLog) -> Self {
        Self::new(label, log, |_| Ok(Vec::new()))
    }

    /// Emits the same events for every input.
    pub fn emitting(label: &str, log: &InvocationLog, emissions: &[(&'static str, &'static str)]) -> Self {
        let emissions: Vec<Emission> = emissions.iter().map(|(t, d)| Emission::new(*t, *d)).collect();
        Self::new(label, log, move |_| Ok(emissions.clone()))
    }

    pub fn failing(label: &str, log: &InvocationLog) -> Self {
        Self::new(label, log, |_| Err(ModuleError::new("upstream API returned 500")))
    }

    pub fn with_failing_setup(mut self) -> Self {
        self.fail_setup = true;
        self
    }
}

#[async_trait]
impl ScanModule for Scripted {
    async fn setup(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        if self.fail_setup {
            return Err(ModuleError::new("missing API key"));
        }
        Ok(())
    }

    async fn handle(&self, event: &ScanEvent, _ctx: &ModuleContext) -> Result<Vec<Emission>, ModuleError> {
        self.log.record(&self.label, &event.data);
        (self.handler)(event)
    }
}

/// Blocks each invocation until the test opens the gate.
pub struct Gated {
    label: String,
    log: InvocationLog,
    pub entered: Arc<Notify>,
    pub gate: Arc<Semaphore>,
    emissions: Vec<Emission>,
}

impl Gated {
    pub fn new(label: &str, log: &InvocationLog, emissions: &[(&'static str, &'static str)]) -> Self {
        Self {
            label: label.to_string(),
            log: log.clone(),
            entered: Arc::new(Notify::new()),
            gate: Arc::new(Semaphore::new(0)),
            emissions: emissions.iter().map(|(t, d)| Emission::new(*t, *d)).collect(),
        }
    }
}

#[async_trait]
impl ScanModule for Gated {
    async fn handle(&self, event: &ScanEvent, _ctx: &ModuleContext) -> Result<Vec<Emission>, ModuleError> {
        self.log.record(&self.label, &event.data);
        self.entered.notify_one();
        let permit = self.gate.acquire().await.map_err(|e| ModuleError::from_error(&e))?;
        permit.forget();
        Ok(self.emissions.clone())
    }
}

/// Sleeps through every invocation and remembers how many ran at once.
#[derive(Default)]
pub struct Tracked {
    running: AtomicUsize,
    pub peak: AtomicUsize,
    pub calls: AtomicUsize,
}

#[async_trait]
impl ScanModule for Tracked {
    async fn handle(&self, _event: &ScanEvent, _ctx: &ModuleContext) -> Result<Vec<Emission>, ModuleError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

/// Never returns and ignores cancellation.
pub struct Stuck;

#[async_trait]
impl ScanModule for Stuck {
    async fn handle(&self, _event: &ScanEvent, _ctx: &ModuleContext) -> Result<Vec<Emission>, ModuleError> {
        std::future::pending::<()>().await;
        Ok(Vec::new())
    }
}

pub fn descriptor(id: &str) -> ModuleDescriptor {
    ModuleDescriptor::new(id, ModuleVersion::new(1, 0, 0))
}

pub fn engine(max_concurrency: usize) -> Engine {
    engine_with(|config| config.max_concurrency = max_concurrency)
}

/// Test engine with a short grace period and timeout, adjusted by `configure`.
pub fn engine_with(configure: impl FnOnce(&mut EngineConfig)) -> Engine {
    let mut config = EngineConfig { abort_grace_period_ms: 100, ..EngineConfig::default() };
    config.sandbox.default_timeout_ms = 5_000;
    configure(&mut config);
    Engine::new(config)
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<ScanEvent>) -> Vec<ScanEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Upper bound for any single await in a test.
pub const PATIENCE: Duration = Duration::from_secs(10);
