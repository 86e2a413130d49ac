//! Error types for firehot.

use std::path::PathBuf;

use thiserror::Error;

use crate::execute::TerminationReason;

/// Result type for firehot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running isolated code.
#[derive(Debug, Error)]
pub enum Error {
    /// The package root handed to `start` does not exist.
    #[error("package path not found: {}", .0.display())]
    PathNotFound(PathBuf),

    /// The callable cannot be shipped to a worker.
    #[error("unsupported callable: {0}")]
    UnsupportedCallable(String),

    /// No runner is registered under this id.
    #[error("runner not found: {0}")]
    RunnerNotFound(String),

    /// No outcome is tracked for this execution id (unknown or already collected).
    #[error("execution handle not found: {0}")]
    HandleNotFound(String),

    /// The module named by a call is not registered.
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    /// The module exists but does not expose the function.
    #[error("function {function} not found in module {module}")]
    FunctionNotFound { module: String, function: String },

    /// A module failed to import while the controller was warming up.
    #[error("import of {module} failed: {message}")]
    Import { module: String, message: String },

    /// The callable raised inside the worker.
    #[error("{class}: {message}{}", traceback.as_ref().map(|t| format!("\n\n{}", t)).unwrap_or_default())]
    Child {
        class: String,
        message: String,
        traceback: Option<String>,
    },

    /// The worker died without reporting an outcome.
    #[error("worker {pid} {reason} before reporting a result")]
    WorkerCrashed { pid: i32, reason: TerminationReason },

    /// The controller was rebuilt while the execution was in flight.
    #[error("controller restarted while the execution was pending")]
    ControllerRestarted,

    /// The runner was stopped while the execution was in flight.
    #[error("runner stopped")]
    Stopped,

    /// Waiting on the controller or a worker exceeded the configured bound.
    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(std::time::Duration, String),

    /// Call payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Failed to start the controller process.
    #[error("failed to spawn controller: {0}")]
    Spawn(String),

    /// IPC communication error with the controller.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Stream redirection could not be installed or restored.
    #[error("stream redirection error: {0}")]
    StreamRedirect(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error on the line protocol.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Self::Io(std::io::Error::from_raw_os_error(errno as i32))
    }
}
