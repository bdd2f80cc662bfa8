use orca_runtime::{ConfigError, Inputs, Module, ModuleError, ModuleSpec, Outputs};
use rand::{rngs::SmallRng, Rng};
use serde_json::json;

use crate::{context, first_topic, module_rng, single};

/// Band controller: heat below `low`, cool above `high`, idle in between.
///
/// With probability `spike_prob` the action is replaced by `±spike_delta` to
/// exercise the shield.
#[derive(Debug)]
pub struct Controller {
    spec: ModuleSpec,
    input: String,
    output: String,
    low: f64,
    high: f64,
    normal_delta: f64,
    spike_delta: f64,
    spike_prob: f64,
    rng: SmallRng,
}

impl Controller {
    /// Builds the controller from `spec.config`.
    pub fn new(spec: ModuleSpec) -> Result<Self, ConfigError> {
        let spike_prob = spec.config_f64("spike_prob", 0.1)?;
        if !(0.0..=1.0).contains(&spike_prob) {
            return Err(ConfigError::Invalid {
                field: format!("{}.config.spike_prob", spec.id),
                reason: format!("{spike_prob} is not a probability"),
            });
        }
        Ok(Self {
            input: first_topic(&spec, &spec.inputs, "inputs")?,
            output: first_topic(&spec, &spec.outputs, "outputs")?,
            low: spec.config_f64("low", 20.0)?,
            high: spec.config_f64("high", 25.0)?,
            normal_delta: spec.config_f64("normal_delta", 1.5)?,
            spike_delta: spec.config_f64("spike_delta", 10.0)?,
            spike_prob,
            rng: module_rng(&spec)?,
            spec,
        })
    }

    fn delta_for(&mut self, temp: f64) -> f64 {
        let delta = if temp < self.low {
            self.normal_delta
        } else if temp > self.high {
            -self.normal_delta
        } else {
            0.0
        };
        if self.rng.gen_bool(self.spike_prob) {
            if delta >= 0.0 {
                self.spike_delta
            } else {
                -self.spike_delta
            }
        } else {
            delta
        }
    }
}

impl Module for Controller {
    fn spec(&self) -> &ModuleSpec {
        &self.spec
    }

    fn step(&mut self, inputs: &Inputs) -> Result<Outputs, ModuleError> {
        let Some(state) = context(inputs, &self.input) else {
            return Ok(Outputs::new());
        };
        let Some(temp) = state.state_f64() else {
            return Ok(Outputs::new());
        };
        let delta = self.delta_for(temp);
        let action = state.clone().with_info("action", json!({ "delta": delta }));
        Ok(single(&self.output, action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_delta;
    use orca_runtime::{Context, Message};
    use serde_json::Value;
    use std::sync::Arc;

    fn controller(config: Value) -> Controller {
        let spec = ModuleSpec::new("controller", ["state"], ["raw_action"], 1.0)
            .unwrap()
            .with_config(config.as_object().cloned().unwrap());
        Controller::new(spec).unwrap()
    }

    fn delta(controller: &mut Controller, temp: f64) -> f64 {
        let mut inputs = Inputs::new();
        let message = Message::new("state", Context::new(temp), "estimator");
        inputs.insert("state".into(), Arc::new(message));
        let outputs = controller.step(&inputs).unwrap();
        action_delta(outputs["raw_action"].as_context().unwrap()).unwrap()
    }

    #[test]
    fn band_control_without_spikes() {
        let mut ctl = controller(json!({ "spike_prob": 0.0 }));
        assert!((delta(&mut ctl, 18.0) - 1.5).abs() < f64::EPSILON);
        assert!((delta(&mut ctl, 27.0) + 1.5).abs() < f64::EPSILON);
        assert!(delta(&mut ctl, 22.0).abs() < f64::EPSILON);
    }

    #[test]
    fn spikes_keep_direction() {
        let mut ctl = controller(json!({ "spike_prob": 1.0, "seed": 1 }));
        assert!((delta(&mut ctl, 18.0) - 10.0).abs() < f64::EPSILON);
        assert!((delta(&mut ctl, 30.0) + 10.0).abs() < f64::EPSILON);
        assert!((delta(&mut ctl, 22.0) - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_invalid_probability() {
        let spec = ModuleSpec::new("controller", ["state"], ["raw_action"], 1.0)
            .unwrap()
            .with_config(json!({ "spike_prob": 2.0 }).as_object().cloned().unwrap());
        assert!(Controller::new(spec).is_err());
    }
}
