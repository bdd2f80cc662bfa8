//! Episode lifecycle, mode dispatch and termination detection.

use std::{
    collections::HashSet,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use serde_json::json;
use shared_audit::{AuditSink, NullAuditSink};
use tracing::{debug, info};

use crate::{
    checks::CheckRegistry,
    config::{Budget, ExecutionMode, RuntimeConfig, DEFAULT_WORKERS},
    engine::{CycleReport, ExecutionEngine, ExecutionStrategy, RESET_LOCK_TIMEOUT},
    error::{ConfigError, RuntimeError},
    message::{Message, Snapshot},
    module::Module,
    monitor::{ComplianceMonitor, PropertyCheck},
    registry::ModuleRegistry,
    store::MessageStore,
};

/// Lifecycle position of an orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Constructed, not yet run.
    Idle,
    /// Inside `run`.
    Running,
    /// `run` returned.
    Stopped,
}

/// Totals gathered over one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Scheduling cycles executed.
    pub cycles: u64,
    /// Episode resets, including the initial one.
    pub episodes: u64,
    /// Invocations dispatched.
    pub dispatched: u64,
    /// Cycles cut short by the no-progress guard.
    pub deadlocks: u64,
}

impl RunSummary {
    fn absorb(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.dispatched += report.dispatched.len() as u64;
        if report.deadlock_detected() {
            self.deadlocks += 1;
        }
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    mode: ExecutionMode,
    max_ticks: Option<u64>,
    max_seconds: Option<f64>,
    workers: usize,
    modules: Vec<Box<dyn Module>>,
    checks: Vec<Box<dyn PropertyCheck>>,
    audit: Arc<dyn AuditSink>,
}

impl OrchestratorBuilder {
    /// Starts a builder for `mode`.
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            max_ticks: None,
            max_seconds: None,
            workers: DEFAULT_WORKERS,
            modules: Vec::new(),
            checks: Vec::new(),
            audit: Arc::new(NullAuditSink),
        }
    }

    /// Tick budget (tick-indexed mode).
    #[must_use]
    pub const fn max_ticks(mut self, ticks: u64) -> Self {
        self.max_ticks = Some(ticks);
        self
    }

    /// Duration budget in seconds (wall-clock modes).
    #[must_use]
    pub const fn max_seconds(mut self, seconds: f64) -> Self {
        self.max_seconds = Some(seconds);
        self
    }

    /// Worker slots for the pooled mode.
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Appends a module; order is queue order.
    #[must_use]
    pub fn module(mut self, module: Box<dyn Module>) -> Self {
        self.modules.push(module);
        self
    }

    /// Appends several modules.
    #[must_use]
    pub fn modules(mut self, modules: impl IntoIterator<Item = Box<dyn Module>>) -> Self {
        self.modules.extend(modules);
        self
    }

    /// Registers a property check with the compliance monitor.
    #[must_use]
    pub fn check(mut self, check: Box<dyn PropertyCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// Audit sink shared by every component.
    #[must_use]
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Validates the configuration and wires the components.
    pub fn build(self) -> Result<Orchestrator, RuntimeError> {
        let budget = Budget::for_mode(self.mode, self.max_ticks, self.max_seconds)?;
        if self.modules.is_empty() {
            return Err(ConfigError::NoModules.into());
        }
        let mut ids = HashSet::new();
        for module in &self.modules {
            if !ids.insert(module.id().to_string()) {
                return Err(ConfigError::DuplicateModule(module.id().to_string()).into());
            }
        }
        let strategy = match self.mode {
            ExecutionMode::WallClockPooled => {
                if self.workers == 0 {
                    return Err(ConfigError::InvalidWorkers(self.workers).into());
                }
                ExecutionStrategy::Pooled {
                    workers: self.workers,
                }
            }
            ExecutionMode::TickIndexed | ExecutionMode::WallClock => ExecutionStrategy::Inline,
        };

        let store = Arc::new(MessageStore::new(Arc::clone(&self.audit)));
        for module in &self.modules {
            for topic in &module.spec().inputs {
                store
                    .subscribe(topic, module.id())
                    .map_err(|err| ConfigError::Invalid {
                        field: format!("{}.inputs", module.id()),
                        reason: err.to_string(),
                    })?;
            }
        }
        let environment_ids = self
            .modules
            .iter()
            .filter(|module| module.spec().is_environment)
            .map(|module| module.id().to_string())
            .collect();
        let mut monitor = ComplianceMonitor::new(Arc::clone(&self.audit));
        for check in self.checks {
            monitor.register(check);
        }
        let engine = ExecutionEngine::new(
            self.modules,
            Arc::clone(&store),
            Arc::clone(&self.audit),
            strategy,
        )?;

        Ok(Orchestrator {
            mode: self.mode,
            budget,
            store,
            engine,
            monitor,
            audit: self.audit,
            environment_ids,
            state: RunState::Idle,
        })
    }
}

/// Owns the store and engine and drives one run in a fixed mode.
pub struct Orchestrator {
    mode: ExecutionMode,
    budget: Budget,
    store: Arc<MessageStore>,
    engine: ExecutionEngine,
    monitor: ComplianceMonitor,
    audit: Arc<dyn AuditSink>,
    environment_ids: HashSet<String>,
    state: RunState,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("mode", &self.mode)
            .field("budget", &self.budget)
            .field("state", &self.state)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Returns a builder.
    #[must_use]
    pub fn builder(mode: ExecutionMode) -> OrchestratorBuilder {
        OrchestratorBuilder::new(mode)
    }

    /// Instantiates modules and checks named by `config`.
    pub fn from_config(
        config: &RuntimeConfig,
        registry: &ModuleRegistry,
        checks: &CheckRegistry,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        let mut builder = Self::builder(config.mode)
            .workers(config.workers)
            .audit(audit);
        if let Some(ticks) = config.max_steps {
            builder = builder.max_ticks(ticks);
        }
        if let Some(seconds) = config.max_time {
            builder = builder.max_seconds(seconds);
        }
        for descriptor in &config.modules {
            let spec = descriptor.to_spec()?;
            builder = builder.module(registry.create(&descriptor.type_tag, spec)?);
        }
        for name in &config.checks {
            builder = builder.check(checks.create(name)?);
        }
        builder.build()
    }

    /// Mode selected at construction.
    #[must_use]
    pub const fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Lifecycle position.
    #[must_use]
    pub const fn state(&self) -> RunState {
        self.state
    }

    /// Shared message store.
    #[must_use]
    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    /// Execution engine.
    #[must_use]
    pub const fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Runs the configured budget. Start and stop events are always recorded and
    /// the worker pool is always released, whichever way the loop exits.
    pub fn run(&mut self) -> Result<RunSummary, RuntimeError> {
        if self.state != RunState::Idle {
            return Err(RuntimeError::AlreadyStarted);
        }
        self.state = RunState::Running;
        info!(mode = %self.mode, "runtime started");
        self.audit
            .record("runtime_started", json!({ "mode": self.mode.label() }));

        let mut summary = RunSummary::default();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.drive(&mut summary)));

        self.audit.record(
            "runtime_stopped",
            json!({
                "cycles": summary.cycles,
                "episodes": summary.episodes,
                "ok": matches!(outcome, Ok(Ok(()))),
            }),
        );
        self.engine.shutdown();
        self.state = RunState::Stopped;
        info!(cycles = summary.cycles, episodes = summary.episodes, "runtime stopped");
        match outcome {
            Ok(result) => result.map(|()| summary),
            Err(cause) => panic::resume_unwind(cause),
        }
    }

    fn drive(&mut self, summary: &mut RunSummary) -> Result<(), RuntimeError> {
        self.reset_episode(summary)?;
        match self.budget {
            Budget::Ticks(ticks) => self.run_ticks(ticks, summary),
            Budget::Duration(limit) => self.run_wall_clock(limit, summary),
        }
    }

    fn run_ticks(&mut self, ticks: u64, summary: &mut RunSummary) -> Result<(), RuntimeError> {
        for tick in 0..ticks {
            let report = self.engine.run_tick(tick);
            self.end_cycle(&report, summary)?;
        }
        Ok(())
    }

    fn run_wall_clock(
        &mut self,
        limit: Duration,
        summary: &mut RunSummary,
    ) -> Result<(), RuntimeError> {
        let started = Instant::now();
        while started.elapsed() < limit {
            let cycle_start = Instant::now();
            let report = self.engine.run_wall_clock();
            self.end_cycle(&report, summary)?;

            let remaining = self.engine.min_cycle() - cycle_start.elapsed().as_secs_f64();
            if remaining > 0.0 {
                // Never sleep past the end of the budget.
                let pause = Duration::try_from_secs_f64(remaining).unwrap_or(Duration::MAX);
                thread::sleep(pause.min(limit.saturating_sub(started.elapsed())));
            } else {
                let overrun = (-remaining * 10_000.0).round() / 10_000.0;
                debug!(overrun, "interval overrun");
                self.audit
                    .record("interval_overrun", json!({ "overrun_seconds": overrun }));
            }
        }
        Ok(())
    }

    /// Monitor evaluation and termination check after a scheduling pass.
    fn end_cycle(
        &mut self,
        report: &CycleReport,
        summary: &mut RunSummary,
    ) -> Result<(), RuntimeError> {
        summary.absorb(report);
        let snapshot = self.store.snapshot();
        self.monitor.evaluate(&snapshot);
        if self.episode_done(&snapshot) {
            self.reset_episode(summary)?;
        }
        Ok(())
    }

    /// Whether an environment-sent envelope is terminated or truncated.
    #[must_use]
    pub fn episode_done(&self, snapshot: &Snapshot) -> bool {
        snapshot.values().any(|msg| {
            self.environment_ids.contains(msg.sender())
                && msg.context().is_some_and(|ctx| ctx.is_done())
        })
    }

    /// Clears stored messages and publishes every environment's initial outputs.
    fn reset_episode(&mut self, summary: &mut RunSummary) -> Result<(), RuntimeError> {
        self.audit.record("episode_reset", json!({ "episode": summary.episodes + 1 }));
        self.store.reset();
        for slot in self.engine.environments() {
            let module = slot.spec().id.clone();
            let outputs = slot
                .reset(RESET_LOCK_TIMEOUT)
                .map_err(|source| RuntimeError::EpisodeReset {
                    module: module.clone(),
                    source,
                })?;
            for (topic, payload) in outputs {
                self.store
                    .publish(Message::new(topic, payload, module.as_str()))
                    .map_err(|source| RuntimeError::ResetOutput {
                        module: module.clone(),
                        source,
                    })?;
            }
        }
        summary.episodes += 1;
        debug!(episode = summary.episodes, "episode reset");
        Ok(())
    }
}
