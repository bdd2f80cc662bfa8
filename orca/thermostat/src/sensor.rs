use orca_runtime::{ConfigError, Inputs, Module, ModuleError, ModuleSpec, Outputs};
use rand::{rngs::SmallRng, Rng};

use crate::{context, first_topic, module_rng, single};

/// Adds uniform noise in `[-noise, noise]` to the observed temperature.
#[derive(Debug)]
pub struct Sensor {
    spec: ModuleSpec,
    input: String,
    output: String,
    noise: f64,
    rng: SmallRng,
}

impl Sensor {
    /// Builds the sensor from `spec.config`.
    pub fn new(spec: ModuleSpec) -> Result<Self, ConfigError> {
        let noise = spec.config_f64("noise", 0.1)?.abs();
        Ok(Self {
            input: first_topic(&spec, &spec.inputs, "inputs")?,
            output: first_topic(&spec, &spec.outputs, "outputs")?,
            noise,
            rng: module_rng(&spec)?,
            spec,
        })
    }
}

impl Module for Sensor {
    fn spec(&self) -> &ModuleSpec {
        &self.spec
    }

    fn step(&mut self, inputs: &Inputs) -> Result<Outputs, ModuleError> {
        let Some(true_obs) = context(inputs, &self.input) else {
            return Ok(Outputs::new());
        };
        let Some(temp) = true_obs.state_f64() else {
            return Ok(Outputs::new());
        };
        let noise = if self.noise > 0.0 {
            self.rng.gen_range(-self.noise..=self.noise)
        } else {
            0.0
        };
        let mut reading = true_obs.clone();
        reading.state = Some((temp + noise).into());
        Ok(single(&self.output, reading))
    }
}
