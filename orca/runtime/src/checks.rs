//! Built-in organic-computing property checks.
//!
//! None is enabled unless named in the run configuration. Each check owns the
//! history it needs, so separate monitors never observe each other's state.

use std::collections::VecDeque;

use indexmap::IndexMap;

use crate::{
    error::ConfigError,
    message::Snapshot,
    monitor::{CheckOutcome, PropertyCheck},
};

const RAW_ACTION: &str = "raw_action";
const SAFE_ACTION: &str = "safe_action";
const REWARD: &str = "reward";
const MODULE_UPDATE: &str = "module_update";

/// Builds a fresh check instance.
pub type CheckFactory = fn() -> Box<dyn PropertyCheck>;

/// Named check factories.
#[derive(Debug, Clone)]
pub struct CheckRegistry {
    factories: IndexMap<&'static str, CheckFactory>,
}

impl Default for CheckRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl CheckRegistry {
    /// Registry with no checks.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: IndexMap::new(),
        }
    }

    /// Registry holding the four built-in checks.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("self_protection", || Box::new(SelfProtection));
        registry.register("self_healing", || Box::new(SelfHealing::default()));
        registry.register("self_optimization", || Box::new(SelfOptimization::default()));
        registry.register("self_configuration", || Box::new(SelfConfiguration));
        registry
    }

    /// Adds or replaces a factory.
    pub fn register(&mut self, name: &'static str, factory: CheckFactory) {
        self.factories.insert(name, factory);
    }

    /// Registered names.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Instantiates the check called `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn PropertyCheck>, ConfigError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| ConfigError::UnknownCheck(name.to_string()))
    }
}

/// Whether the shield altered the controller's action, if both are present.
fn override_active(snapshot: &Snapshot) -> Option<bool> {
    let raw = snapshot.get(RAW_ACTION)?;
    let safe = snapshot.get(SAFE_ACTION)?;
    Some(raw.payload() != safe.payload())
}

/// Reports when the safety shield is overriding the controller.
#[derive(Debug, Default)]
pub struct SelfProtection;

impl PropertyCheck for SelfProtection {
    fn name(&self) -> &str {
        "self_protection"
    }

    fn evaluate(&mut self, snapshot: &Snapshot) -> CheckOutcome {
        match override_active(snapshot) {
            None => CheckOutcome::violation("missing action messages"),
            Some(true) => CheckOutcome::violation("protection active: unsafe action overridden"),
            Some(false) => CheckOutcome::Pass,
        }
    }
}

/// Reports the first cycle without an override after one or more overrides.
#[derive(Debug, Default)]
pub struct SelfHealing {
    last_was_override: bool,
}

impl PropertyCheck for SelfHealing {
    fn name(&self) -> &str {
        "self_healing"
    }

    fn evaluate(&mut self, snapshot: &Snapshot) -> CheckOutcome {
        let Some(current) = override_active(snapshot) else {
            return CheckOutcome::violation("missing action messages");
        };
        if self.last_was_override && !current {
            self.last_was_override = false;
            return CheckOutcome::violation("system healed: back to unmodified actions");
        }
        self.last_was_override = current;
        CheckOutcome::Pass
    }
}

/// Compares the reward sum of the latest window against the one before it.
#[derive(Debug)]
pub struct SelfOptimization {
    window: usize,
    history: VecDeque<f64>,
}

impl Default for SelfOptimization {
    fn default() -> Self {
        Self::new(5)
    }
}

impl SelfOptimization {
    /// Creates the check with a custom window (at least one sample).
    #[must_use]
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            history: VecDeque::with_capacity(2 * window),
        }
    }
}

impl PropertyCheck for SelfOptimization {
    fn name(&self) -> &str {
        "self_optimization"
    }

    fn evaluate(&mut self, snapshot: &Snapshot) -> CheckOutcome {
        let Some(reward) = snapshot.get(REWARD).and_then(|msg| msg.payload().as_reward()) else {
            return CheckOutcome::violation("missing or invalid reward message");
        };
        self.history.push_back(reward);
        while self.history.len() > 2 * self.window {
            self.history.pop_front();
        }
        if self.history.len() < 2 * self.window {
            return CheckOutcome::violation("insufficient data");
        }
        let earlier: f64 = self.history.iter().take(self.window).sum();
        let recent: f64 = self.history.iter().skip(self.window).sum();
        if recent > earlier {
            CheckOutcome::violation(format!(
                "performance improved: {earlier:.3} -> {recent:.3}"
            ))
        } else {
            CheckOutcome::Pass
        }
    }
}

/// Reports when a module update has been announced.
#[derive(Debug, Default)]
pub struct SelfConfiguration;

impl PropertyCheck for SelfConfiguration {
    fn name(&self) -> &str {
        "self_configuration"
    }

    fn evaluate(&mut self, snapshot: &Snapshot) -> CheckOutcome {
        if snapshot.contains_key(MODULE_UPDATE) {
            CheckOutcome::violation("module configuration changed")
        } else {
            CheckOutcome::Pass
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn snapshot(entries: &[(&str, Value)]) -> Snapshot {
        entries
            .iter()
            .map(|(topic, value)| {
                (
                    (*topic).to_string(),
                    Arc::new(Message::new(*topic, value.clone(), "test")),
                )
            })
            .collect()
    }

    #[test]
    fn registry_knows_builtins() {
        let registry = CheckRegistry::builtin();
        assert_eq!(
            registry.names(),
            vec!["self_protection", "self_healing", "self_optimization", "self_configuration"]
        );
        assert_eq!(registry.create("self_healing").unwrap().name(), "self_healing");
        assert!(matches!(
            registry.create("nope"),
            Err(ConfigError::UnknownCheck(name)) if name == "nope"
        ));
    }

    #[test]
    fn protection_reports_overrides() {
        let mut check = SelfProtection;
        assert_eq!(
            check.evaluate(&Snapshot::new()),
            CheckOutcome::violation("missing action messages")
        );
        let same = snapshot(&[(RAW_ACTION, json!(1)), (SAFE_ACTION, json!(1))]);
        assert_eq!(check.evaluate(&same), CheckOutcome::Pass);
        let clipped = snapshot(&[(RAW_ACTION, json!(10)), (SAFE_ACTION, json!(5))]);
        assert!(matches!(check.evaluate(&clipped), CheckOutcome::Violation(_)));
    }

    #[test]
    fn healing_fires_once_after_override_clears() {
        let mut check = SelfHealing::default();
        let clipped = snapshot(&[(RAW_ACTION, json!(10)), (SAFE_ACTION, json!(5))]);
        let clean = snapshot(&[(RAW_ACTION, json!(1)), (SAFE_ACTION, json!(1))]);
        assert_eq!(check.evaluate(&clipped), CheckOutcome::Pass);
        assert!(matches!(check.evaluate(&clean), CheckOutcome::Violation(_)));
        assert_eq!(check.evaluate(&clean), CheckOutcome::Pass);
    }

    #[test]
    fn optimization_needs_two_windows() {
        let mut check = SelfOptimization::new(2);
        assert_eq!(
            check.evaluate(&Snapshot::new()),
            CheckOutcome::violation("missing or invalid reward message")
        );
        for reward in [-3.0, -2.0, -1.0] {
            assert_eq!(
                check.evaluate(&snapshot(&[(REWARD, json!(reward))])),
                CheckOutcome::violation("insufficient data")
            );
        }
        let outcome = check.evaluate(&snapshot(&[(REWARD, json!(0.0))]));
        assert!(matches!(
            outcome,
            CheckOutcome::Violation(ref d) if d.starts_with("performance improved")
        ));
        for _ in 0..4 {
            check.evaluate(&snapshot(&[(REWARD, json!(-9.0))]));
        }
        assert_eq!(check.evaluate(&snapshot(&[(REWARD, json!(-9.0))])), CheckOutcome::Pass);
    }

    #[test]
    fn configuration_watches_module_update() {
        let mut check = SelfConfiguration;
        assert_eq!(check.evaluate(&Snapshot::new()), CheckOutcome::Pass);
        let updated = snapshot(&[(MODULE_UPDATE, json!({ "module": "controller" }))]);
        assert!(matches!(check.evaluate(&updated), CheckOutcome::Violation(_)));
    }
}
