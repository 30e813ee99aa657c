use stagewise_abstraction::CollaboratorError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the engine and its registries.
///
/// Schedule and checksum mismatches found while resuming are not errors; they
/// are logged and reported through `ResumeReport`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed stage, hook or component specification.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("hook '{0}' already registered")]
    DuplicateHook(String),

    #[error("hook '{0}' not found")]
    HookNotFound(String),

    /// Query on a buffer key that never received a value.
    #[error("buffer has no values for '{0}'")]
    EmptyBuffer(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Saved optimizer state does not fit the optimizer built for the current stage.
    #[error("optimizer state mismatch: {0}")]
    OptimizerStateMismatch(CollaboratorError),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("no {0} data source available")]
    MissingDataSource(String),

    #[error("no optimizer has been built for the current stage")]
    NoOptimizer,

    #[error("communication error: {0}")]
    Communication(String),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl EngineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
