#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Thermostat control loop built from ORCA plug-in modules.
//!
//! A simulated room ([`ThermostatEnv`]) is observed by a noisy [`Sensor`],
//! smoothed by an [`Estimator`], driven by a band [`Controller`] that occasionally
//! proposes unsafe actions, and guarded by a clipping [`Shield`]. Actions travel
//! in the observation envelope as `info.action.delta`.

/// Band controller.
pub mod controller;
/// Simulated room.
pub mod env;
/// Exponential smoothing.
pub mod estimator;
/// Noisy sensor.
pub mod sensor;
/// Action clipping.
pub mod shield;

pub use controller::Controller;
pub use env::ThermostatEnv;
pub use estimator::Estimator;
pub use sensor::Sensor;
pub use shield::Shield;

use std::sync::Arc;

use orca_runtime::{ConfigError, Context, Inputs, ModuleRegistry, ModuleSpec, Outputs};
use rand::{rngs::SmallRng, SeedableRng};
use serde_json::Value;
use shared_audit::AuditSink;

/// Registers every thermostat module under its type tag.
pub fn register_all(registry: &mut ModuleRegistry, audit: Arc<dyn AuditSink>) {
    registry
        .register("ThermostatEnv", |spec| Ok(Box::new(ThermostatEnv::new(spec)?)))
        .register("Sensor", |spec| Ok(Box::new(Sensor::new(spec)?)))
        .register("Estimator", |spec| Ok(Box::new(Estimator::new(spec)?)))
        .register("Controller", |spec| Ok(Box::new(Controller::new(spec)?)))
        .register("Shield", move |spec| {
            Ok(Box::new(Shield::new(spec, Arc::clone(&audit))?))
        });
}

/// Seeded generator when `seed` is configured, entropy otherwise.
pub(crate) fn module_rng(spec: &ModuleSpec) -> Result<SmallRng, ConfigError> {
    Ok(spec
        .config_u64("seed")?
        .map_or_else(SmallRng::from_entropy, SmallRng::seed_from_u64))
}

/// First declared topic, required by single-input or single-output modules.
pub(crate) fn first_topic(
    spec: &ModuleSpec,
    topics: &[String],
    kind: &str,
) -> Result<String, ConfigError> {
    topics.first().cloned().ok_or_else(|| ConfigError::Invalid {
        field: format!("{}.{kind}", spec.id),
        reason: format!("at least one {kind} topic is required"),
    })
}

/// Envelope on `topic`, if present.
pub(crate) fn context<'a>(inputs: &'a Inputs, topic: &str) -> Option<&'a Context> {
    inputs.get(topic).and_then(|msg| msg.context())
}

/// `info.action.delta` of an envelope.
pub(crate) fn action_delta(ctx: &Context) -> Option<f64> {
    ctx.info
        .get("action")
        .and_then(|action| action.get("delta"))
        .and_then(Value::as_f64)
}

pub(crate) fn single(topic: &str, ctx: Context) -> Outputs {
    let mut outputs = Outputs::new();
    outputs.insert(topic.to_string(), ctx.into());
    outputs
}
