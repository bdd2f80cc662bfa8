use std::f64::consts::TAU;

use orca_runtime::{ConfigError, Context, Inputs, Module, ModuleError, ModuleSpec, Outputs};
use rand::{rngs::SmallRng, Rng};
use serde_json::Value;
use tracing::debug;

use crate::{action_delta, context, first_topic, module_rng, single};

/// Simulated room temperature.
///
/// Each step applies `alpha * delta` plus gaussian drift, clamps to
/// `[min_temp, max_temp]` and rewards `-|temp - target_temp|`. The action is read
/// from the first input topic, if any. With `episode_steps` set, the envelope is
/// truncated after that many steps.
#[derive(Debug)]
pub struct ThermostatEnv {
    spec: ModuleSpec,
    output: String,
    action_topic: Option<String>,
    initial_temp: f64,
    target_temp: f64,
    alpha: f64,
    drift_std: f64,
    min_temp: f64,
    max_temp: f64,
    episode_steps: Option<u64>,
    temp: f64,
    steps: u64,
    rng: SmallRng,
}

impl ThermostatEnv {
    /// Builds the environment from `spec.config`.
    pub fn new(spec: ModuleSpec) -> Result<Self, ConfigError> {
        let spec = spec.environment(true);
        let min_temp = spec.config_f64("min_temp", 5.0)?;
        let max_temp = spec.config_f64("max_temp", 45.0)?;
        if min_temp > max_temp {
            return Err(ConfigError::Invalid {
                field: format!("{}.config.min_temp", spec.id),
                reason: format!("{min_temp} exceeds max_temp {max_temp}"),
            });
        }
        let drift_std = spec.config_f64("drift_std", 0.1)?;
        if drift_std < 0.0 {
            return Err(ConfigError::Invalid {
                field: format!("{}.config.drift_std", spec.id),
                reason: "must not be negative".into(),
            });
        }
        let initial_temp = spec.config_f64("initial_temp", 22.0)?;
        Ok(Self {
            output: first_topic(&spec, &spec.outputs, "outputs")?,
            action_topic: spec.inputs.first().cloned(),
            initial_temp,
            target_temp: spec.config_f64("target_temp", 22.0)?,
            alpha: spec.config_f64("alpha", 0.5)?,
            drift_std,
            min_temp,
            max_temp,
            episode_steps: spec.config_u64("episode_steps")?,
            temp: initial_temp,
            steps: 0,
            rng: module_rng(&spec)?,
            spec,
        })
    }

    /// Current temperature.
    #[must_use]
    pub const fn temperature(&self) -> f64 {
        self.temp
    }

    fn drift(&mut self) -> f64 {
        if self.drift_std == 0.0 {
            return 0.0;
        }
        // Box-Muller over two uniforms; 1 - u keeps the log argument positive.
        let u1: f64 = 1.0 - self.rng.gen::<f64>();
        let u2: f64 = self.rng.gen();
        self.drift_std * (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
    }

    /// Delta carried by the action envelope. Accepts `info.delta` as well.
    fn requested_delta(&self, inputs: &Inputs) -> f64 {
        self.action_topic
            .as_deref()
            .and_then(|topic| context(inputs, topic))
            .and_then(|ctx| {
                action_delta(ctx).or_else(|| ctx.info.get("delta").and_then(Value::as_f64))
            })
            .unwrap_or(0.0)
    }
}

impl Module for ThermostatEnv {
    fn spec(&self) -> &ModuleSpec {
        &self.spec
    }

    fn step(&mut self, inputs: &Inputs) -> Result<Outputs, ModuleError> {
        let delta = self.requested_delta(inputs);
        let drift = self.drift();
        self.temp =
            (self.alpha.mul_add(delta, self.temp) + drift).clamp(self.min_temp, self.max_temp);
        self.steps += 1;

        let mut obs = Context::new(self.temp).with_reward(-(self.temp - self.target_temp).abs());
        if self.episode_steps.is_some_and(|limit| self.steps >= limit) {
            obs = obs.truncated();
        }
        debug!(module = %self.spec.id, temp = self.temp, delta, "thermostat step");
        Ok(single(&self.output, obs))
    }

    fn reset(&mut self) -> Result<Outputs, ModuleError> {
        self.temp = self.initial_temp;
        self.steps = 0;
        Ok(single(&self.output, Context::new(self.temp)))
    }
}
