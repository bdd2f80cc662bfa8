//! Cycle-driven, readiness-gated scheduling of modules.

use std::{
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde_json::json;
use shared_audit::AuditSink;
use tracing::{debug, warn};

use crate::{
    error::{ModuleError, RuntimeError},
    message::Message,
    module::{Module, ModuleSpec},
    pool::WorkerPool,
    store::MessageStore,
};

/// `min_cycle` reported when no module is registered.
pub const DEFAULT_MIN_CYCLE: f64 = 100.0;

/// How long an episode reset waits for an in-flight pooled step of the same module.
pub const RESET_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// How due and ready modules are invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// On the scheduling thread, in queue order.
    Inline,
    /// Submitted to a bounded worker pool; completion order unspecified.
    Pooled {
        /// Worker slots.
        workers: usize,
    },
}

/// Outcome of one scheduling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Modules judged ready and invoked (inline) or submitted (pooled), in order.
    pub dispatched: Vec<String>,
    /// Modules abandoned by the no-progress guard, if it fired.
    pub deadlocked: Vec<String>,
}

impl CycleReport {
    /// Whether the no-progress guard fired.
    #[must_use]
    pub fn deadlock_detected(&self) -> bool {
        !self.deadlocked.is_empty()
    }
}

/// A module plus the scheduler-owned state around it.
pub(crate) struct ModuleSlot {
    spec: ModuleSpec,
    module: Mutex<Box<dyn Module>>,
    last_execution: Mutex<Option<Instant>>,
}

impl ModuleSlot {
    fn new(module: Box<dyn Module>) -> Self {
        Self {
            spec: module.spec().clone(),
            module: Mutex::new(module),
            last_execution: Mutex::new(None),
        }
    }

    pub(crate) fn spec(&self) -> &ModuleSpec {
        &self.spec
    }

    /// Resets the module, giving up if a running step holds it past `timeout`.
    pub(crate) fn reset(&self, timeout: Duration) -> Result<crate::message::Outputs, ModuleError> {
        let Some(mut module) = self.module.try_lock_for(timeout) else {
            return Err(ModuleError::failed(format!(
                "module still busy after {}ms",
                timeout.as_millis()
            )));
        };
        match panic::catch_unwind(AssertUnwindSafe(|| module.reset())) {
            Ok(result) => result,
            Err(cause) => Err(ModuleError::Panicked(panic_message(cause.as_ref()))),
        }
    }

    fn last_execution(&self) -> Option<Instant> {
        *self.last_execution.lock()
    }

    /// Advances `last_execution`; never moves it backwards.
    fn touch(&self, now: Instant) {
        let mut last = self.last_execution.lock();
        if last.map_or(true, |prev| now > prev) {
            *last = Some(now);
        }
    }

    fn due_at_tick(&self, tick: u64) -> bool {
        #[allow(clippy::cast_precision_loss)]
        let tick = tick as f64;
        tick % self.spec.cycle == 0.0
    }

    fn due_at(&self, now: Instant) -> bool {
        self.last_execution().map_or(true, |last| {
            now.saturating_duration_since(last).as_secs_f64() >= self.spec.cycle
        })
    }
}

enum Dispatcher {
    Inline,
    Pooled(WorkerPool),
}

/// Decides, per cycle, which modules run and invokes them.
pub struct ExecutionEngine {
    slots: Vec<Arc<ModuleSlot>>,
    store: Arc<MessageStore>,
    audit: Arc<dyn AuditSink>,
    dispatcher: Dispatcher,
    min_cycle: f64,
}

impl fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("modules", &self.module_ids())
            .field("strategy", &self.strategy())
            .field("min_cycle", &self.min_cycle)
            .finish()
    }
}

impl ExecutionEngine {
    /// Creates an engine over `modules`, preserving their order as queue order.
    pub fn new(
        modules: Vec<Box<dyn Module>>,
        store: Arc<MessageStore>,
        audit: Arc<dyn AuditSink>,
        strategy: ExecutionStrategy,
    ) -> Result<Self, RuntimeError> {
        let slots: Vec<_> = modules
            .into_iter()
            .map(|module| Arc::new(ModuleSlot::new(module)))
            .collect();
        let min_cycle = slots
            .iter()
            .map(|slot| slot.spec.cycle)
            .reduce(f64::min)
            .unwrap_or(DEFAULT_MIN_CYCLE);
        let dispatcher = match strategy {
            ExecutionStrategy::Inline => Dispatcher::Inline,
            ExecutionStrategy::Pooled { workers } => {
                Dispatcher::Pooled(WorkerPool::new(workers).map_err(RuntimeError::WorkerPool)?)
            }
        };
        Ok(Self {
            slots,
            store,
            audit,
            dispatcher,
            min_cycle,
        })
    }

    /// Smallest cycle across modules.
    #[must_use]
    pub const fn min_cycle(&self) -> f64 {
        self.min_cycle
    }

    /// Strategy selected at construction.
    #[must_use]
    pub fn strategy(&self) -> ExecutionStrategy {
        match &self.dispatcher {
            Dispatcher::Inline => ExecutionStrategy::Inline,
            Dispatcher::Pooled(pool) => ExecutionStrategy::Pooled {
                workers: pool.workers(),
            },
        }
    }

    /// Module ids in queue order.
    #[must_use]
    pub fn module_ids(&self) -> Vec<&str> {
        self.slots.iter().map(|slot| slot.spec.id.as_str()).collect()
    }

    /// When `module_id` last completed an invocation.
    #[must_use]
    pub fn last_execution(&self, module_id: &str) -> Option<Instant> {
        self.slots
            .iter()
            .find(|slot| slot.spec.id == module_id)
            .and_then(|slot| slot.last_execution())
    }

    pub(crate) fn environments(&self) -> impl Iterator<Item = &Arc<ModuleSlot>> {
        self.slots.iter().filter(|slot| slot.spec.is_environment)
    }

    /// Whether every declared input of the slot is present in the store.
    fn is_ready(&self, slot: &ModuleSlot) -> bool {
        self.store.has_all(&slot.spec.inputs)
    }

    /// Tick-indexed pass: modules with `tick mod cycle == 0` are due.
    pub fn run_tick(&self, tick: u64) -> CycleReport {
        let queue = self
            .slots
            .iter()
            .filter(|slot| slot.due_at_tick(tick))
            .cloned()
            .collect();
        self.drain(queue, "tick-indexed", Some(tick))
    }

    /// Wall-clock pass: modules whose cycle has elapsed since their last run are due.
    pub fn run_wall_clock(&self) -> CycleReport {
        let now = Instant::now();
        let queue = self
            .slots
            .iter()
            .filter(|slot| slot.due_at(now))
            .cloned()
            .collect();
        self.drain(queue, "wall-clock", None)
    }

    /// Readiness loop shared by both policies.
    ///
    /// Unready modules rotate to the back. Once the no-progress count exceeds the
    /// remaining queue length, the rest of the queue is abandoned for this cycle.
    fn drain(
        &self,
        mut queue: VecDeque<Arc<ModuleSlot>>,
        mode: &str,
        tick: Option<u64>,
    ) -> CycleReport {
        let mut report = CycleReport::default();
        let mut no_progress = 0_usize;
        while let Some(slot) = queue.pop_front() {
            if self.is_ready(&slot) {
                report.dispatched.push(slot.spec.id.clone());
                self.dispatch(slot);
                no_progress = 0;
            } else {
                queue.push_back(slot);
                no_progress += 1;
            }
            if no_progress > queue.len() {
                report.deadlocked = queue.iter().map(|slot| slot.spec.id.clone()).collect();
                warn!(mode, ?tick, modules = ?report.deadlocked, "scheduling deadlock detected");
                self.audit.record(
                    "deadlock_detected",
                    json!({ "mode": mode, "tick": tick, "modules": report.deadlocked }),
                );
                break;
            }
        }
        report
    }

    fn dispatch(&self, slot: Arc<ModuleSlot>) {
        match &self.dispatcher {
            Dispatcher::Inline => {
                execute(&slot, &self.store, self.audit.as_ref());
            }
            Dispatcher::Pooled(pool) => {
                let store = Arc::clone(&self.store);
                let audit = Arc::clone(&self.audit);
                let module_id = slot.spec.id.clone();
                if !pool.submit(move || {
                    execute(&slot, &store, audit.as_ref());
                }) {
                    debug!(module = %module_id, "worker pool closed, invocation dropped");
                }
            }
        }
    }

    /// Stops the worker pool from accepting work; in-flight invocations keep running.
    pub fn shutdown(&self) {
        if let Dispatcher::Pooled(pool) = &self.dispatcher {
            pool.shutdown();
        }
    }
}

/// Invokes one module and publishes its outputs. Failures become audit events.
fn execute(slot: &ModuleSlot, store: &MessageStore, audit: &dyn AuditSink) -> bool {
    let module_id = slot.spec.id.as_str();
    if !store.has_all(&slot.spec.inputs) {
        return false;
    }
    let inputs = store.collect(&slot.spec.inputs);
    let result = {
        let mut module = slot.module.lock();
        panic::catch_unwind(AssertUnwindSafe(|| module.step(&inputs)))
    };
    let outputs = match result {
        Ok(Ok(outputs)) => outputs,
        Ok(Err(err)) => return execution_error(audit, module_id, &err),
        Err(cause) => {
            let err = ModuleError::Panicked(panic_message(cause.as_ref()));
            return execution_error(audit, module_id, &err);
        }
    };
    if let Some(topic) = outputs.keys().find(|topic| !slot.spec.declares_output(topic)) {
        let err = ModuleError::UndeclaredOutput(topic.clone());
        return execution_error(audit, module_id, &err);
    }
    for (topic, payload) in outputs {
        if let Err(err) = store.publish(Message::new(topic, payload, module_id)) {
            return execution_error(audit, module_id, &ModuleError::failed(err));
        }
    }
    slot.touch(Instant::now());
    audit.record("module_executed", json!({ "module": module_id }));
    true
}

fn execution_error(audit: &dyn AuditSink, module_id: &str, err: &ModuleError) -> bool {
    warn!(module = module_id, error = %err, "module execution failed");
    audit.record(
        "execution_error",
        json!({ "module": module_id, "error": err.to_string() }),
    );
    false
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    cause
        .downcast_ref::<&str>()
        .map(|msg| (*msg).to_string())
        .or_else(|| cause.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Inputs, Outputs, Payload};
    use shared_audit::MemoryAuditBus;
    use std::{thread, time::Duration};

    /// Publishes an incrementing counter on each output; optionally misbehaves.
    struct Counter {
        spec: ModuleSpec,
        calls: u64,
        seen: Arc<Mutex<Vec<Vec<String>>>>,
        behaviour: Behaviour,
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Publish,
        Fail,
        Panic,
        Undeclared,
        /// Publishes after holding the module for a while.
        Linger(Duration),
    }

    impl Module for Counter {
        fn spec(&self) -> &ModuleSpec {
            &self.spec
        }

        fn step(&mut self, inputs: &Inputs) -> Result<Outputs, ModuleError> {
            self.calls += 1;
            self.seen.lock().push(inputs.keys().cloned().collect());
            match self.behaviour {
                Behaviour::Publish => Ok(self.publish_all()),
                Behaviour::Linger(pause) => {
                    thread::sleep(pause);
                    Ok(self.publish_all())
                }
                Behaviour::Fail => Err(ModuleError::failed("sensor offline")),
                Behaviour::Panic => panic!("boom"),
                Behaviour::Undeclared => {
                    let mut outputs = Outputs::new();
                    outputs.insert("elsewhere".into(), json!(1).into());
                    Ok(outputs)
                }
            }
        }
    }

    impl Counter {
        fn publish_all(&self) -> Outputs {
            self.spec
                .outputs
                .iter()
                .map(|topic| (topic.clone(), Payload::from(json!(self.calls))))
                .collect()
        }
    }

    struct Fixture {
        bus: Arc<MemoryAuditBus>,
        store: Arc<MessageStore>,
        seen: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl Fixture {
        fn new() -> Self {
            let bus = Arc::new(MemoryAuditBus::new(1024));
            Self {
                store: Arc::new(MessageStore::new(bus.clone())),
                bus,
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn counter(
            &self,
            id: &str,
            inputs: &[&str],
            outputs: &[&str],
            cycle: f64,
            behaviour: Behaviour,
        ) -> Box<dyn Module> {
            let spec = ModuleSpec::new(id, inputs.iter().copied(), outputs.iter().copied(), cycle)
                .unwrap();
            Box::new(Counter {
                spec,
                calls: 0,
                seen: Arc::clone(&self.seen),
                behaviour,
            })
        }

        fn engine(
            &self,
            modules: Vec<Box<dyn Module>>,
            strategy: ExecutionStrategy,
        ) -> ExecutionEngine {
            ExecutionEngine::new(modules, Arc::clone(&self.store), self.bus.clone(), strategy)
                .unwrap()
        }

        fn wait_for_executions(&self, expected: usize) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.bus.count("module_executed") < expected && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(2));
            }
            assert_eq!(self.bus.count("module_executed"), expected);
        }
    }

    #[test]
    fn downstream_module_runs_after_producer_in_same_tick() {
        let fx = Fixture::new();
        // B is queued first, so it must be retried after A publishes.
        let engine = fx.engine(
            vec![
                fx.counter("b", &["x"], &["y"], 1.0, Behaviour::Publish),
                fx.counter("a", &[], &["x"], 1.0, Behaviour::Publish),
            ],
            ExecutionStrategy::Inline,
        );
        let report = engine.run_tick(0);
        assert_eq!(report.dispatched, vec!["a", "b"]);
        assert!(!report.deadlock_detected());
        assert!(fx.store.has_topic("y"));
        assert_eq!(fx.store.get_latest("y").unwrap().sender(), "b");
        assert_eq!(fx.bus.count("deadlock_detected"), 0);
    }

    #[test]
    fn ready_module_receives_exactly_its_inputs() {
        let fx = Fixture::new();
        fx.store.publish(Message::new("x", json!(1), "seed")).unwrap();
        fx.store.publish(Message::new("unrelated", json!(2), "seed")).unwrap();
        let engine = fx.engine(
            vec![fx.counter("b", &["x"], &["y"], 1.0, Behaviour::Publish)],
            ExecutionStrategy::Inline,
        );
        engine.run_tick(0);
        assert_eq!(*fx.seen.lock(), vec![vec!["x".to_string()]]);
    }

    #[test]
    fn unready_module_triggers_deadlock_after_one_retry() {
        let fx = Fixture::new();
        let engine = fx.engine(
            vec![fx.counter("c", &["z"], &["w"], 1.0, Behaviour::Publish)],
            ExecutionStrategy::Inline,
        );
        for tick in 0..3 {
            let report = engine.run_tick(tick);
            assert!(report.dispatched.is_empty());
            assert_eq!(report.deadlocked, vec!["c"]);
        }
        assert!(fx.seen.lock().is_empty());
        let events = fx.bus.events_of("deadlock_detected");
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].fields["modules"], json!(["c"]));
        assert_eq!(events[0].fields["mode"], json!("tick-indexed"));
    }

    #[test]
    fn single_retry_does_not_count_as_deadlock() {
        let fx = Fixture::new();
        let engine = fx.engine(
            vec![
                fx.counter("late", &["x"], &["y"], 1.0, Behaviour::Publish),
                fx.counter("mid", &["w"], &["x"], 1.0, Behaviour::Publish),
                fx.counter("root", &[], &["w"], 1.0, Behaviour::Publish),
            ],
            ExecutionStrategy::Inline,
        );
        let report = engine.run_tick(0);
        assert_eq!(report.dispatched, vec!["root", "mid", "late"]);
        assert_eq!(fx.bus.count("deadlock_detected"), 0);
    }

    #[test]
    fn deadlock_abandons_only_unready_remainder() {
        let fx = Fixture::new();
        let engine = fx.engine(
            vec![
                fx.counter("stuck", &["never"], &["y"], 1.0, Behaviour::Publish),
                fx.counter("free", &[], &["x"], 1.0, Behaviour::Publish),
            ],
            ExecutionStrategy::Inline,
        );
        let report = engine.run_tick(0);
        assert_eq!(report.dispatched, vec!["free"]);
        assert_eq!(report.deadlocked, vec!["stuck"]);
    }

    #[test]
    fn tick_policy_honours_cycle() {
        let fx = Fixture::new();
        let engine = fx.engine(
            vec![
                fx.counter("every", &[], &["a"], 1.0, Behaviour::Publish),
                fx.counter("third", &[], &["b"], 3.0, Behaviour::Publish),
            ],
            ExecutionStrategy::Inline,
        );
        let mut third_ticks = Vec::new();
        for tick in 0..10 {
            let report = engine.run_tick(tick);
            assert!(report.dispatched.contains(&"every".to_string()));
            if report.dispatched.contains(&"third".to_string()) {
                third_ticks.push(tick);
            }
        }
        assert_eq!(third_ticks, vec![0, 3, 6, 9]);
    }

    #[test]
    fn wall_clock_policy_waits_for_cycle() {
        let fx = Fixture::new();
        let engine = fx.engine(
            vec![fx.counter("slow", &[], &["a"], 0.2, Behaviour::Publish)],
            ExecutionStrategy::Inline,
        );
        assert!(engine.last_execution("slow").is_none());
        assert_eq!(engine.run_wall_clock().dispatched, vec!["slow"]);
        let first = engine.last_execution("slow").unwrap();
        assert!(engine.run_wall_clock().dispatched.is_empty());
        thread::sleep(Duration::from_millis(250));
        assert_eq!(engine.run_wall_clock().dispatched, vec!["slow"]);
        assert!(engine.last_execution("slow").unwrap() > first);
    }

    #[test]
    fn failures_are_recorded_and_do_not_stop_the_cycle() {
        let fx = Fixture::new();
        let engine = fx.engine(
            vec![
                fx.counter("failing", &[], &["a"], 1.0, Behaviour::Fail),
                fx.counter("panicking", &[], &["b"], 1.0, Behaviour::Panic),
                fx.counter("rogue", &[], &["c"], 1.0, Behaviour::Undeclared),
                fx.counter("healthy", &[], &["d"], 1.0, Behaviour::Publish),
            ],
            ExecutionStrategy::Inline,
        );
        engine.run_tick(0);
        let errors: Vec<_> = fx
            .bus
            .events_of("execution_error")
            .into_iter()
            .map(|event| event.fields)
            .collect();
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0], json!({ "module": "failing", "error": "sensor offline" }));
        assert_eq!(errors[1]["module"], json!("panicking"));
        assert_eq!(errors[2]["error"], json!("undeclared output topic `elsewhere`"));
        assert!(!fx.store.has_topic("elsewhere"));
        assert!(fx.store.has_topic("d"));
        assert!(engine.last_execution("failing").is_none());
        assert!(engine.last_execution("healthy").is_some());
        assert_eq!(fx.bus.count("module_executed"), 1);
    }

    #[test]
    fn min_cycle_defaults_without_modules() {
        let fx = Fixture::new();
        let empty = fx.engine(Vec::new(), ExecutionStrategy::Inline);
        assert!((empty.min_cycle() - DEFAULT_MIN_CYCLE).abs() < f64::EPSILON);
        let engine = fx.engine(
            vec![
                fx.counter("a", &[], &["a"], 0.5, Behaviour::Publish),
                fx.counter("b", &[], &["b"], 0.1, Behaviour::Publish),
            ],
            ExecutionStrategy::Inline,
        );
        assert!((engine.min_cycle() - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn pooled_strategy_converges_on_latest_values() {
        let fx = Fixture::new();
        let engine = fx.engine(
            vec![
                fx.counter("a", &[], &["x"], 1.0, Behaviour::Publish),
                fx.counter("b", &[], &["y"], 1.0, Behaviour::Publish),
            ],
            ExecutionStrategy::Pooled { workers: 2 },
        );
        assert_eq!(engine.strategy(), ExecutionStrategy::Pooled { workers: 2 });
        for tick in 0..5 {
            engine.run_tick(tick);
            fx.wait_for_executions(2 * (tick as usize + 1));
        }
        assert_eq!(fx.store.get_latest("x").unwrap().payload(), &Payload::from(json!(5)));
        assert_eq!(fx.store.get_latest("y").unwrap().payload(), &Payload::from(json!(5)));
        engine.shutdown();
    }

    #[test]
    fn pooled_writers_sharing_a_topic_lose_no_publish() {
        let fx = Fixture::new();
        let engine = fx.engine(
            vec![
                fx.counter("a", &[], &["x"], 1.0, Behaviour::Publish),
                fx.counter("b", &[], &["x"], 1.0, Behaviour::Publish),
            ],
            ExecutionStrategy::Pooled { workers: 2 },
        );
        for tick in 0..20 {
            engine.run_tick(tick);
            fx.wait_for_executions(2 * (tick as usize + 1));
        }
        assert_eq!(fx.bus.count("message_sent"), 40);
        assert_eq!(fx.bus.count("message_sent"), fx.bus.count("module_executed"));
        // Completion order is unspecified, so either writer may hold the topic.
        let latest = fx.store.get_latest("x").unwrap();
        assert!(["a", "b"].contains(&latest.sender()), "{}", latest.sender());
        assert_eq!(latest.payload(), &Payload::from(json!(20)));
        engine.shutdown();
    }

    #[test]
    fn reset_gives_up_while_a_pooled_step_holds_the_module() {
        let fx = Fixture::new();
        let engine = fx.engine(
            vec![fx.counter(
                "env",
                &[],
                &["obs"],
                1.0,
                Behaviour::Linger(Duration::from_millis(400)),
            )],
            ExecutionStrategy::Pooled { workers: 1 },
        );
        engine.run_tick(0);
        let slot = &engine.slots[0];
        let deadline = Instant::now() + Duration::from_secs(5);
        while !slot.module.is_locked() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        let err = slot.reset(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, ModuleError::Failed(ref reason) if reason.contains("busy")));

        fx.wait_for_executions(1);
        assert!(slot.reset(RESET_LOCK_TIMEOUT).unwrap().is_empty());
        engine.shutdown();
    }
}
