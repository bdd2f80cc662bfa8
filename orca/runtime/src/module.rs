//! The contract every pluggable processing unit satisfies.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::{ConfigError, ModuleError},
    message::{Inputs, Outputs},
};

/// Static description of a module: identity, wiring and cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    /// Unique id within a run.
    pub id: String,
    /// Topics that must all be present before the module may run.
    pub inputs: Vec<String>,
    /// Topics the module is allowed to publish.
    pub outputs: Vec<String>,
    /// Ticks (tick-indexed mode) or seconds (wall-clock modes) between invocations.
    pub cycle: f64,
    /// Environments are reset at episode boundaries and drive termination.
    #[serde(default)]
    pub is_environment: bool,
    /// Opaque module-specific settings.
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl ModuleSpec {
    /// Validates and builds a spec.
    pub fn new(
        id: impl Into<String>,
        inputs: impl IntoIterator<Item = impl Into<String>>,
        outputs: impl IntoIterator<Item = impl Into<String>>,
        cycle: f64,
    ) -> Result<Self, ConfigError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ConfigError::EmptyModuleId);
        }
        if !cycle.is_finite() || cycle <= 0.0 {
            return Err(ConfigError::NonPositiveCycle { module: id });
        }
        let inputs: Vec<String> = inputs.into_iter().map(Into::into).collect();
        let outputs: Vec<String> = outputs.into_iter().map(Into::into).collect();
        if inputs.iter().chain(&outputs).any(String::is_empty) {
            return Err(ConfigError::EmptyTopic { module: id });
        }
        Ok(Self {
            id,
            inputs,
            outputs,
            cycle,
            is_environment: false,
            config: Map::new(),
        })
    }

    /// Sets the environment flag.
    #[must_use]
    pub fn environment(mut self, is_environment: bool) -> Self {
        self.is_environment = is_environment;
        self
    }

    /// Replaces the opaque config bag.
    #[must_use]
    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }

    /// Whether `topic` is one of the declared outputs.
    #[must_use]
    pub fn declares_output(&self, topic: &str) -> bool {
        self.outputs.iter().any(|out| out == topic)
    }

    /// Numeric config value, or `default` when absent.
    pub fn config_f64(&self, key: &str, default: f64) -> Result<f64, ConfigError> {
        match self.config.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => value.as_f64().ok_or_else(|| ConfigError::Invalid {
                field: format!("{}.config.{key}", self.id),
                reason: format!("expected a number, got {value}"),
            }),
        }
    }

    /// Optional unsigned integer config value.
    pub fn config_u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.config.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value.as_u64().map(Some).ok_or_else(|| ConfigError::Invalid {
                field: format!("{}.config.{key}", self.id),
                reason: format!("expected an unsigned integer, got {value}"),
            }),
        }
    }
}

/// A processing unit driven by the execution engine.
///
/// `step` receives the current message for every declared input topic and returns
/// payloads for any subset of the declared outputs. Private state may be kept
/// across invocations; nothing outside the module mutates it.
pub trait Module: Send {
    /// Static description.
    fn spec(&self) -> &ModuleSpec;

    /// One logical step.
    fn step(&mut self, inputs: &Inputs) -> Result<Outputs, ModuleError>;

    /// Episode reset. Only called on environment modules; publishes nothing by default.
    fn reset(&mut self) -> Result<Outputs, ModuleError> {
        Ok(Outputs::new())
    }

    /// Module id.
    fn id(&self) -> &str {
        &self.spec().id
    }
}
