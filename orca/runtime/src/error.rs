use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the message store to its immediate caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Publish attempted with an empty topic.
    #[error("message topic must be a non-empty string")]
    InvalidTopic,
    /// Subscription attempted with an empty topic or module id.
    #[error("topic and module id must be non-empty")]
    InvalidArgument,
    /// Nothing was ever published on the topic.
    #[error("no message found for topic `{0}`")]
    NotFound(String),
}

/// Fatal configuration errors, raised before any run starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Module id missing or empty.
    #[error("module id must be a non-empty string")]
    EmptyModuleId,
    /// A declared input or output topic is empty.
    #[error("module `{module}` declares an empty topic name")]
    EmptyTopic {
        /// Offending module.
        module: String,
    },
    /// Cycle missing, zero, negative or not finite.
    #[error("invalid or missing cycle for module `{module}`")]
    NonPositiveCycle {
        /// Offending module.
        module: String,
    },
    /// Execution mode not one of the supported names.
    #[error("unsupported execution mode `{0}`")]
    UnknownMode(String),
    /// The budget matching the mode is absent.
    #[error("missing `{field}` for {mode} mode")]
    MissingBudget {
        /// Mode label.
        mode: &'static str,
        /// Expected config field.
        field: &'static str,
    },
    /// A budget that does not belong to the mode was supplied.
    #[error("`{field}` is not accepted in {mode} mode")]
    ConflictingBudget {
        /// Mode label.
        mode: &'static str,
        /// Rejected config field.
        field: &'static str,
    },
    /// No factory registered under the type tag.
    #[error("unknown module type `{type_tag}` for module `{module}`")]
    UnknownModuleType {
        /// Module id.
        module: String,
        /// Requested type tag.
        type_tag: String,
    },
    /// Two modules share an id.
    #[error("duplicate module id `{0}`")]
    DuplicateModule(String),
    /// The module list is empty.
    #[error("no modules defined in configuration")]
    NoModules,
    /// Property check name not registered.
    #[error("unknown property check `{0}`")]
    UnknownCheck(String),
    /// Worker count must be at least one.
    #[error("worker pool size must be positive, got {0}")]
    InvalidWorkers(usize),
    /// A field holds an unusable value.
    #[error("invalid `{field}`: {reason}")]
    Invalid {
        /// Field name.
        field: String,
        /// Human-readable reason.
        reason: String,
    },
    /// Malformed JSON.
    #[error("invalid config format: {0}")]
    Parse(#[from] serde_json::Error),
    /// Config file could not be read.
    #[error("reading config {path}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Failure inside a module's transition or reset function.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModuleError {
    /// Generic failure reported by the module.
    #[error("{0}")]
    Failed(String),
    /// Returned a topic outside the declared outputs.
    #[error("undeclared output topic `{0}`")]
    UndeclaredOutput(String),
    /// The module panicked.
    #[error("module panicked: {0}")]
    Panicked(String),
}

impl ModuleError {
    /// Wraps any displayable failure.
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }
}

impl From<anyhow::Error> for ModuleError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// An environment module failed to reset.
    #[error("environment `{module}` failed to reset")]
    EpisodeReset {
        /// Environment module id.
        module: String,
        /// Underlying failure.
        #[source]
        source: ModuleError,
    },
    /// An environment reset produced an unpublishable message.
    #[error("environment `{module}` produced an invalid reset output")]
    ResetOutput {
        /// Environment module id.
        module: String,
        /// Underlying failure.
        #[source]
        source: StoreError,
    },
    /// The worker pool could not be created.
    #[error("starting worker pool")]
    WorkerPool(#[source] std::io::Error),
    /// `run` called more than once.
    #[error("orchestrator has already been started")]
    AlreadyStarted,
}
