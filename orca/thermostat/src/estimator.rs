use orca_runtime::{ConfigError, Inputs, Module, ModuleError, ModuleSpec, Outputs};

use crate::{context, first_topic, single};

/// Exponentially smoothed temperature estimate. Reset forgets the estimate.
#[derive(Debug)]
pub struct Estimator {
    spec: ModuleSpec,
    input: String,
    output: String,
    alpha: f64,
    estimate: Option<f64>,
}

impl Estimator {
    /// Builds the estimator; `alpha` must lie in `[0, 1]`.
    pub fn new(spec: ModuleSpec) -> Result<Self, ConfigError> {
        let alpha = spec.config_f64("alpha", 0.5)?;
        if !(0.0..=1.0).contains(&alpha) {
            return Err(ConfigError::Invalid {
                field: format!("{}.config.alpha", spec.id),
                reason: format!("{alpha} is outside [0, 1]"),
            });
        }
        Ok(Self {
            input: first_topic(&spec, &spec.inputs, "inputs")?,
            output: first_topic(&spec, &spec.outputs, "outputs")?,
            alpha,
            estimate: None,
            spec,
        })
    }

    /// Current estimate, if any reading has been seen this episode.
    #[must_use]
    pub const fn estimate(&self) -> Option<f64> {
        self.estimate
    }
}

impl Module for Estimator {
    fn spec(&self) -> &ModuleSpec {
        &self.spec
    }

    fn step(&mut self, inputs: &Inputs) -> Result<Outputs, ModuleError> {
        let Some(raw) = context(inputs, &self.input) else {
            return Ok(Outputs::new());
        };
        let Some(reading) = raw.state_f64() else {
            return Ok(Outputs::new());
        };
        let estimate = self
            .estimate
            .map_or(reading, |prev| self.alpha.mul_add(reading, (1.0 - self.alpha) * prev));
        self.estimate = Some(estimate);
        let mut smoothed = raw.clone();
        smoothed.state = Some(estimate.into());
        Ok(single(&self.output, smoothed))
    }

    fn reset(&mut self) -> Result<Outputs, ModuleError> {
        self.estimate = None;
        Ok(Outputs::new())
    }
}
