use std::{fmt, sync::Arc};

use orca_runtime::{ConfigError, Inputs, Module, ModuleError, ModuleSpec, Outputs};
use serde_json::json;
use shared_audit::AuditSink;
use tracing::info;

use crate::{action_delta, context, first_topic, single};

/// Clips `|delta| > max_delta` and records each override.
pub struct Shield {
    spec: ModuleSpec,
    input: String,
    output: String,
    max_delta: f64,
    audit: Arc<dyn AuditSink>,
}

impl fmt::Debug for Shield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shield")
            .field("id", &self.spec.id)
            .field("max_delta", &self.max_delta)
            .finish_non_exhaustive()
    }
}

impl Shield {
    /// Builds the shield; overrides are reported to `audit`.
    pub fn new(spec: ModuleSpec, audit: Arc<dyn AuditSink>) -> Result<Self, ConfigError> {
        let max_delta = spec.config_f64("max_delta", 5.0)?;
        if max_delta < 0.0 {
            return Err(ConfigError::Invalid {
                field: format!("{}.config.max_delta", spec.id),
                reason: "must not be negative".into(),
            });
        }
        Ok(Self {
            input: first_topic(&spec, &spec.inputs, "inputs")?,
            output: first_topic(&spec, &spec.outputs, "outputs")?,
            max_delta,
            audit,
            spec,
        })
    }
}

impl Module for Shield {
    fn spec(&self) -> &ModuleSpec {
        &self.spec
    }

    fn step(&mut self, inputs: &Inputs) -> Result<Outputs, ModuleError> {
        let Some(raw) = context(inputs, &self.input) else {
            return Ok(Outputs::new());
        };
        let Some(delta) = action_delta(raw) else {
            return Ok(Outputs::new());
        };
        if delta.abs() <= self.max_delta {
            return Ok(single(&self.output, raw.clone()));
        }
        let safe_delta = delta.clamp(-self.max_delta, self.max_delta);
        info!(module = %self.spec.id, raw_delta = delta, safe_delta, "shield override");
        self.audit.record(
            "shield_override",
            json!({ "module": self.spec.id, "raw_delta": delta, "safe_delta": safe_delta }),
        );
        let safe = raw.clone().with_info("action", json!({ "delta": safe_delta }));
        Ok(single(&self.output, safe))
    }
}
