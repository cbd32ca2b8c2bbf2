//! Error types for the workflow engine.
//!
//! Each layer returns its own error; [`EngineError`] wraps them and decides
//! the consequence for a run.

use crate::types::ExecutionStatus;

/// Errors detected while building a dependency graph from a workflow spec.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Two vertices share a reference.
    #[error("duplicate reference `{0}`: vertex already exists")]
    DuplicateRef(String),

    /// A reference names a vertex that does not exist.
    #[error("source vertex `{0}`: vertex not found")]
    VertexNotFound(String),

    /// The edge would close a cycle.
    #[error("edge would create a cycle: `{from}` -> `{to}`")]
    Cycle { from: String, to: String },

    /// A non-trigger step references nothing.
    #[error("all non-trigger steps must have a dependent ref, `{0}` has none")]
    MissingDependentRef(String),

    /// A reference token in the step's inputs is malformed.
    #[error("invalid reference in step `{step}`: {source}")]
    InvalidReference {
        step: String,
        #[source]
        source: InterpolationError,
    },
}

/// Errors resolving `$(ref.path...)` tokens.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterpolationError {
    #[error("cannot interpolate `{0}`: must have at least two parts")]
    TooFewParts(String),

    #[error("could not find ref `{0}`")]
    RefNotFound(String),

    #[error("cannot interpolate `{0}`: step has errored")]
    StepErrored(String),

    #[error("cannot interpolate `{token}`: second part must be `inputs` or `outputs`, got `{part}`")]
    InvalidSection { token: String, part: String },

    #[error("could not find key `{key}` (ref: `{token}`)")]
    KeyNotFound { token: String, key: String },

    #[error("could not interpolate ref part `{part}` (ref: `{token}`): index out of bounds {index}")]
    IndexOutOfBounds {
        token: String,
        part: String,
        index: usize,
    },

    #[error("could not interpolate ref part `{part}` (ref: `{token}`): `{part}` is not convertible to an int")]
    NotAnInt { token: String, part: String },

    #[error("could not interpolate ref part `{part}` (ref: `{token}`): value cannot be indexed")]
    NotIndexable { token: String, part: String },
}

/// Errors returned by an execution store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("execution `{0}` already exists")]
    DuplicateExecution(String),

    #[error("execution `{0}` not found")]
    ExecutionNotFound(String),

    #[error("database error: {0}")]
    Database(#[from] redb::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

macro_rules! store_error_from_redb {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StoreError {
                fn from(err: $ty) -> Self {
                    StoreError::Database(err.into())
                }
            }
        )*
    };
}

store_error_from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// Errors returned by capabilities and the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    /// The capability asks the engine to stop the branch without error.
    #[error("execution stopped early")]
    StopExecution,

    #[error("capability `{0}` not found")]
    NotFound(String),

    #[error("capability `{id}` is a {actual}, expected {expected}")]
    WrongType {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("{0}")]
    Failed(String),
}

impl CapabilityError {
    pub fn failed(msg: impl Into<String>) -> Self {
        CapabilityError::Failed(msg.into())
    }
}

/// Errors raised while applying an execution strategy.
#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    #[error("unknown schedule type `{0}`")]
    UnknownSchedule(String),

    #[error("invalid transmission config: {0}")]
    InvalidConfig(String),

    #[error("local peer is not a member of the workflow DON")]
    NotAMember,

    #[error("cancelled while waiting for transmission slot")]
    Cancelled,

    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

/// Errors returned by [`crate::retry::retryable`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    #[error("max retries reached after {attempts} attempts, aborting: {last_error}")]
    MaxRetriesReached { attempts: u32, last_error: String },

    #[error("cancelled before a successful attempt")]
    Cancelled,
}

/// Errors surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow {workflow_id}: {source}")]
    Graph {
        workflow_id: String,
        #[source]
        source: GraphError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("step {step_ref}: failed to interpolate inputs: {source}")]
    Interpolation {
        step_ref: String,
        #[source]
        source: InterpolationError,
    },

    #[error("step {step_ref}: capability {capability_id}: {source}")]
    Step {
        step_ref: String,
        capability_id: String,
        #[source]
        source: StrategyError,
    },

    #[error("workflow {workflow_id}: failed to resolve capabilities: {source}")]
    Initialization {
        workflow_id: String,
        #[source]
        source: RetryError,
    },

    #[error("workflow {workflow_id}: trigger {trigger_id}: failed to register trigger: {source}")]
    TriggerRegistration {
        workflow_id: String,
        trigger_id: String,
        #[source]
        source: CapabilityError,
    },

    #[error("step {step_ref}: capability {capability_id}: {source}")]
    Capability {
        step_ref: String,
        capability_id: String,
        #[source]
        source: CapabilityError,
    },

    #[error("execution {execution_id} finished with status {status}")]
    ExecutionFailed {
        execution_id: String,
        status: ExecutionStatus,
    },

    #[error("engine already started")]
    AlreadyStarted,

    #[error("engine is closed")]
    Closed,
}
