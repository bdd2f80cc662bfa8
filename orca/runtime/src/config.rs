//! Run configuration parsed from JSON.

use std::{collections::HashSet, fmt, path::Path, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::ConfigError, module::ModuleSpec};

/// Default worker pool size for the pooled mode.
pub const DEFAULT_WORKERS: usize = 4;

/// Execution mode, fixed for the lifetime of an orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ExecutionMode {
    /// Fixed number of discrete ticks, inline execution.
    TickIndexed,
    /// Time-bounded loop, inline execution, sleeping to `min_cycle`.
    WallClock,
    /// Time-bounded loop, invocations offloaded to a worker pool.
    WallClockPooled,
}

impl ExecutionMode {
    /// Canonical name.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::TickIndexed => "tick-indexed",
            Self::WallClock => "wall-clock",
            Self::WallClockPooled => "wall-clock-pooled",
        }
    }

    /// Whether the budget is a duration rather than a tick count.
    #[must_use]
    pub const fn is_wall_clock(self) -> bool {
        matches!(self, Self::WallClock | Self::WallClockPooled)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ExecutionMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "tick-indexed" | "step-based" => Ok(Self::TickIndexed),
            "wall-clock" | "time-loop-based" => Ok(Self::WallClock),
            "wall-clock-pooled" | "time-thread-based" => Ok(Self::WallClockPooled),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

impl TryFrom<String> for ExecutionMode {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExecutionMode> for String {
    fn from(mode: ExecutionMode) -> Self {
        mode.label().to_string()
    }
}

/// How long a run lasts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Budget {
    /// Number of ticks (tick-indexed mode).
    Ticks(u64),
    /// Wall-clock duration (wall-clock modes).
    Duration(Duration),
}

impl Budget {
    /// Validates that exactly the budget matching `mode` is present.
    pub fn for_mode(
        mode: ExecutionMode,
        max_ticks: Option<u64>,
        max_seconds: Option<f64>,
    ) -> Result<Self, ConfigError> {
        let label = mode.label();
        if mode.is_wall_clock() {
            if max_ticks.is_some() {
                return Err(ConfigError::ConflictingBudget {
                    mode: label,
                    field: "max_steps",
                });
            }
            let seconds = max_seconds.ok_or(ConfigError::MissingBudget {
                mode: label,
                field: "max_time",
            })?;
            Duration::try_from_secs_f64(seconds)
                .map(Self::Duration)
                .map_err(|err| ConfigError::Invalid {
                    field: "max_time".into(),
                    reason: format!("{seconds} is not a usable number of seconds: {err}"),
                })
        } else {
            if max_seconds.is_some() {
                return Err(ConfigError::ConflictingBudget {
                    mode: label,
                    field: "max_time",
                });
            }
            max_ticks.map(Self::Ticks).ok_or(ConfigError::MissingBudget {
                mode: label,
                field: "max_steps",
            })
        }
    }
}

/// One module entry of the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Registry type tag.
    #[serde(rename = "type")]
    pub type_tag: String,
    /// Module id.
    #[serde(default)]
    pub id: String,
    /// Input topics.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Output topics.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Ticks or seconds between invocations.
    #[serde(default)]
    pub cycle: Option<f64>,
    /// Environment flag.
    #[serde(default, alias = "is_environment")]
    pub is_env: bool,
    /// Opaque module settings.
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl ModuleDescriptor {
    /// Validates the descriptor into a [`ModuleSpec`].
    pub fn to_spec(&self) -> Result<ModuleSpec, ConfigError> {
        let cycle = self.cycle.ok_or_else(|| ConfigError::NonPositiveCycle {
            module: self.id.clone(),
        })?;
        Ok(ModuleSpec::new(&self.id, &self.inputs, &self.outputs, cycle)?
            .environment(self.is_env)
            .with_config(self.config.clone()))
    }
}

/// Complete run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Execution mode.
    pub mode: ExecutionMode,
    /// Tick budget (tick-indexed mode).
    #[serde(default, alias = "max_ticks", skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u64>,
    /// Duration budget in seconds (wall-clock modes).
    #[serde(default, alias = "max_duration", skip_serializing_if = "Option::is_none")]
    pub max_time: Option<f64>,
    /// Worker slots for the pooled mode.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Property checks to enable, by name.
    #[serde(default)]
    pub checks: Vec<String>,
    /// Module descriptors in scheduling order.
    #[serde(default)]
    pub modules: Vec<ModuleDescriptor>,
}

const fn default_workers() -> usize {
    DEFAULT_WORKERS
}

impl FromStr for RuntimeConfig {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        // Unknown modes surface as serde errors; re-map them to the dedicated variant.
        let value: Value = serde_json::from_str(raw)?;
        if let Some(mode) = value.get("mode").and_then(Value::as_str) {
            mode.parse::<ExecutionMode>()?;
        }
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }
}

impl RuntimeConfig {
    /// Reads and validates a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        raw.parse()
    }

    /// Budget implied by the mode.
    pub fn budget(&self) -> Result<Budget, ConfigError> {
        Budget::for_mode(self.mode, self.max_steps, self.max_time)
    }

    /// Checks every field that can be checked without a module registry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.budget()?;
        if self.workers == 0 {
            return Err(ConfigError::InvalidWorkers(self.workers));
        }
        if self.modules.is_empty() {
            return Err(ConfigError::NoModules);
        }
        let mut seen = HashSet::new();
        for descriptor in &self.modules {
            descriptor.to_spec()?;
            if !seen.insert(descriptor.id.as_str()) {
                return Err(ConfigError::DuplicateModule(descriptor.id.clone()));
            }
        }
        Ok(())
    }
}
