//! Error types for fleetjobs
//!
//! Exit codes:
//! - 0: Success
//! - 2: User error (bad args, unknown task, bad config)
//! - 3: Rejected by the store (operation already in flight, id conflict)
//! - 4: Operation failed (gateway unreachable, remote rejected, IO)

use std::path::PathBuf;
use thiserror::Error;

/// Exit codes for the fleetjobs CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const REJECTED: i32 = 3;
    pub const OPERATION_FAILED: i32 = 4;
}

/// Main error type for fleetjobs operations
#[derive(Error, Debug)]
pub enum Error {
    // User errors (exit code 2)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown local task id: {0}")]
    UnknownLocalId(String),

    #[error("Task not found: {0}")]
    UnknownTask(String),

    #[error("Ambiguous task id '{input}': {candidates}")]
    AmbiguousId { input: String, candidates: String },

    #[error("Task {0} has not been accepted by the backend yet")]
    NotSubmitted(String),

    // Store rejections (exit code 3)
    #[error("{op} already in flight for task {id}")]
    AlreadyInFlight { id: String, op: &'static str },

    #[error("Backend job {backend_id} is already bound to task {bound_to}")]
    BackendIdConflict { backend_id: String, bound_to: String },

    // Operation failures (exit code 4)
    #[error("Gateway transport error: {0}")]
    Transport(String),

    #[error("Gateway rejected request: {0}")]
    Remote(String),

    #[error("Invalid remote task record: {0}")]
    InvalidRecord(String),

    #[error("timed out: no terminal status from the backend within {0}")]
    RemoteTaskTimeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Lock acquisition failed: {0}")]
    LockFailed(PathBuf),
}

impl Error {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            // User errors
            Error::InvalidConfig(_)
            | Error::InvalidArgument(_)
            | Error::UnknownLocalId(_)
            | Error::UnknownTask(_)
            | Error::AmbiguousId { .. }
            | Error::NotSubmitted(_) => exit_codes::USER_ERROR,

            // Store rejections
            Error::AlreadyInFlight { .. } | Error::BackendIdConflict { .. } => {
                exit_codes::REJECTED
            }

            // Operation failures
            Error::Transport(_)
            | Error::Remote(_)
            | Error::InvalidRecord(_)
            | Error::RemoteTaskTimeout(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::LockFailed(_) => exit_codes::OPERATION_FAILED,
        }
    }

    /// True for failures of the gateway itself, as opposed to local
    /// rejections. These never leave local state mutated.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Remote(_))
    }

    /// Structured details for JSON error output
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Error::AlreadyInFlight { id, op } => Some(serde_json::json!({
                "task_id": id,
                "operation": op,
            })),
            Error::BackendIdConflict {
                backend_id,
                bound_to,
            } => Some(serde_json::json!({
                "backend_id": backend_id,
                "bound_to": bound_to,
            })),
            Error::AmbiguousId { candidates, .. } => Some(serde_json::json!({
                "candidates": candidates.split(", ").collect::<Vec<_>>(),
            })),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Error::InvalidRecord(err.to_string())
        } else if err.is_status() {
            Error::Remote(err.to_string())
        } else {
            Error::Transport(err.to_string())
        }
    }
}

/// Result type alias for fleetjobs operations
pub type Result<T> = std::result::Result<T, Error>;
