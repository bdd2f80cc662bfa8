#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! ORCA module runtime.
//!
//! Modules exchange [`Message`]s through a latest-value [`MessageStore`]. The
//! [`ExecutionEngine`] invokes a module only when it is due by its cycle and every
//! declared input topic is present, retrying not-ready modules within the cycle
//! until no progress is possible. The [`Orchestrator`] wraps this in episodes and
//! one of three execution modes, and a [`ComplianceMonitor`] inspects the store
//! after every cycle.

/// Built-in property checks.
pub mod checks;
/// JSON run configuration.
pub mod config;
/// Scheduling.
pub mod engine;
/// Error types.
pub mod error;
/// Message envelope and payloads.
pub mod message;
/// Module contract.
pub mod module;
/// Compliance monitor.
pub mod monitor;
/// Run lifecycle.
pub mod orchestrator;
/// Bounded worker pool.
pub mod pool;
/// Module factories by type tag.
pub mod registry;
/// Latest-value message store.
pub mod store;

pub use checks::CheckRegistry;
pub use config::{Budget, ExecutionMode, ModuleDescriptor, RuntimeConfig};
pub use engine::{CycleReport, ExecutionEngine, ExecutionStrategy};
pub use error::{ConfigError, ModuleError, RuntimeError, StoreError};
pub use message::{Context, Inputs, Message, Outputs, Payload, Snapshot};
pub use module::{Module, ModuleSpec};
pub use monitor::{CheckOutcome, ComplianceMonitor, FnCheck, PropertyCheck};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RunState, RunSummary};
pub use registry::ModuleRegistry;
pub use store::MessageStore;
