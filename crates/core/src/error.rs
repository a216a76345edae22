use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Workspace-wide error type. Mutation APIs return these to the caller;
/// nothing in the core panics on a recoverable failure.
#[derive(Error, Debug)]
pub enum ConductorError {
    #[error("config error: {0}")]
    Config(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("dependency cycle: {0}")]
    Cycle(String),

    #[error("insufficient resources for task {0}")]
    Insufficient(String),

    #[error("task already running: {0}")]
    AlreadyRunning(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,

    #[error("executor error: {0}")]
    Executor(String),

    #[error("state IO error: {0}")]
    StateIo(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),
}

impl From<std::io::Error> for ConductorError {
    fn from(e: std::io::Error) -> Self {
        ConductorError::StateIo(e.to_string())
    }
}

impl From<serde_json::Error> for ConductorError {
    fn from(e: serde_json::Error) -> Self {
        ConductorError::StateIo(e.to_string())
    }
}

impl ConductorError {
    /// Classify this error into a wire-friendly kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConductorError::Config(_) => ErrorKind::Config,
            ConductorError::Validation(_) => ErrorKind::Validation,
            ConductorError::NotFound(_) => ErrorKind::NotFound,
            ConductorError::Duplicate(_) => ErrorKind::Duplicate,
            ConductorError::Cycle(_) => ErrorKind::Cycle,
            ConductorError::Insufficient(_) => ErrorKind::Insufficient,
            ConductorError::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            ConductorError::Timeout(_) => ErrorKind::Timeout,
            ConductorError::Cancelled => ErrorKind::Cancelled,
            ConductorError::Executor(_) => ErrorKind::Executor,
            ConductorError::StateIo(_) => ErrorKind::StateIo,
            ConductorError::Scheduler(_) => ErrorKind::Scheduler,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;

/// Error classification shared between the core and executors.
///
/// Executors report an [`ErrorKind`] with their failure so the retry policy
/// can distinguish transient faults from terminal ones without inspecting
/// message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Validation,
    Permission,
    NotFound,
    Duplicate,
    Cycle,
    Insufficient,
    AlreadyRunning,
    Timeout,
    Cancelled,
    /// Transient network fault signalled by an executor.
    Network,
    /// Transient local IO fault signalled by an executor.
    Io,
    /// Opaque failure from an executor with no finer classification.
    Executor,
    StateIo,
    Scheduler,
}

impl ErrorKind {
    /// Whether a failure of this kind is eligible for retry.
    ///
    /// Validation, config, and permission failures will fail the same way
    /// every attempt; cancellation is an operator decision. Everything the
    /// executor flags as transient (timeout, network, IO, opaque executor
    /// faults) goes through the backoff path.
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorKind::Timeout | ErrorKind::Network | ErrorKind::Io | ErrorKind::Executor => true,
            ErrorKind::Config
            | ErrorKind::Validation
            | ErrorKind::Permission
            | ErrorKind::Cancelled => false,
            // Bookkeeping kinds never originate from an executor run; if one
            // surfaces here, do not loop on it.
            _ => false,
        }
    }
}
