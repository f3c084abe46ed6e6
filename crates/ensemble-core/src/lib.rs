//! Core types shared by every Ensemble crate.
//!
//! # Main types
//!
//! - [`EnsembleError`] — Unified error enum for all Ensemble subsystems.
//! - [`EnsembleResult`] — Convenience alias for `Result<T, EnsembleError>`.
//! - [`logging`] — `tracing` subscriber initialisation for binaries and tests.

/// Tracing subscriber setup.
pub mod logging;

use uuid::Uuid;

// --- Error types ---

/// Top-level error type for the Ensemble workspace.
///
/// String variants carry subsystem context; the typed variants are the
/// systemic failures that callers are expected to match on.
#[derive(Debug, thiserror::Error)]
pub enum EnsembleError {
    /// An error from the task scheduler or orchestration facade.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// An error raised by an agent executor.
    #[error("Agent error: {0}")]
    Agent(String),

    /// No idle agent cleared the scoring threshold for a task.
    #[error("No suitable agent for task {task_id}: {reason}")]
    NoSuitableAgent {
        /// The task that could not be placed.
        task_id: Uuid,
        /// Why selection came back empty.
        reason: String,
    },

    /// A task id that the scheduler has never seen.
    #[error("Unknown task: {0}")]
    UnknownTask(Uuid),

    /// An agent name that is not registered.
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// A resource pool id that does not exist.
    #[error("Unknown resource pool: {0}")]
    UnknownPool(String),

    /// A task was asked to run before its dependencies completed.
    #[error("Dependencies not met for task {0}")]
    DependenciesNotMet(Uuid),

    /// An operation that is not valid in the current task state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A resource accounting error.
    #[error("Resource error: {0}")]
    Resource(String),

    /// A capability discovery error.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// An operation exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from an outbound HTTP request.
    #[error("HTTP error: {0}")]
    Http(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`EnsembleError`].
pub type EnsembleResult<T> = Result<T, EnsembleError>;
