//! Custom error types for cryo.
//!
//! Every failure is an explicit variant. Callers that need the coarse
//! taxonomy (for exit codes or RPC status) use [`CryoError::code`].

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::JobId;

/// Coarse classification of every error surfaced by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    Internal,
    Unimplemented,
}

impl ErrorCode {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "InvalidArgument",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::FailedPrecondition => "FailedPrecondition",
            ErrorCode::Internal => "Internal",
            ErrorCode::Unimplemented => "Unimplemented",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Top-level error type for the cryo orchestrator.
#[derive(Debug, Error)]
pub enum CryoError {
    // =========================================================================
    // Request Errors - Raised by Pipeline Steps
    // =========================================================================
    #[error("{message}")]
    InvalidArgument { message: String },

    #[error("{message}")]
    NotFound { message: String },

    #[error("{message}")]
    FailedPrecondition { message: String },

    #[error("{message}")]
    Internal { message: String },

    #[error("{message}")]
    Unimplemented { message: String },

    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Job Errors
    // =========================================================================
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(#[from] StateTransitionError),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job already exists: {0}")]
    JobAlreadyExists(JobId),

    // =========================================================================
    // Subsystem Errors
    // =========================================================================
    #[error("CRIU error: {0}")]
    Criu(#[from] CriuError),

    #[error("Streamer error: {0}")]
    Streamer(#[from] StreamerError),

    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Several independent failures, e.g. an operation error plus a
    /// finalizer error.
    #[error("{}", join_display(errors))]
    Joined { errors: Vec<CryoError> },
}

impl CryoError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        CryoError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        CryoError::NotFound {
            message: message.into(),
        }
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        CryoError::FailedPrecondition {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CryoError::Internal {
            message: message.into(),
        }
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        CryoError::Unimplemented {
            message: message.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CryoError::Io {
            context: context.into(),
            source,
        }
    }

    /// Combines an optional primary error with a secondary one. The primary
    /// error keeps its position so its code stays the reported code.
    pub fn join(primary: Option<CryoError>, secondary: CryoError) -> CryoError {
        match primary {
            None => secondary,
            Some(CryoError::Joined { mut errors }) => {
                errors.push(secondary);
                CryoError::Joined { errors }
            }
            Some(first) => CryoError::Joined {
                errors: vec![first, secondary],
            },
        }
    }

    /// Maps the error onto the operation error taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            CryoError::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            CryoError::NotFound { .. } => ErrorCode::NotFound,
            CryoError::FailedPrecondition { .. } => ErrorCode::FailedPrecondition,
            CryoError::Internal { .. } => ErrorCode::Internal,
            CryoError::Unimplemented { .. } => ErrorCode::Unimplemented,
            CryoError::HardValidation(_) | CryoError::ConfigParse { .. } => {
                ErrorCode::InvalidArgument
            }
            CryoError::ConfigNotFound { .. } | CryoError::JobNotFound(_) => ErrorCode::NotFound,
            CryoError::InvalidStateTransition(_) | CryoError::JobAlreadyExists(_) => {
                ErrorCode::FailedPrecondition
            }
            CryoError::Criu(e) => e.code(),
            CryoError::Streamer(e) => e.code(),
            CryoError::Gpu(e) => e.code(),
            CryoError::Io { .. } => ErrorCode::Internal,
            CryoError::Joined { errors } => errors
                .first()
                .map(CryoError::code)
                .unwrap_or(ErrorCode::Internal),
        }
    }
}

/// Hard validation errors reject a configuration outright.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid job ID: {id} - {reason}")]
    InvalidJobId { id: String, reason: String },
}

/// State transition errors for the job state machine.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Cannot transition from {from} to {to} for job {job_id}")]
    InvalidTransition {
        job_id: JobId,
        from: &'static str,
        to: &'static str,
    },

    #[error("Job {job_id} is not running (state: {state})")]
    NotRunning { job_id: JobId, state: &'static str },
}

/// Checkpoint engine errors.
#[derive(Debug, Error)]
pub enum CriuError {
    #[error("CRIU binary not found. Please install CRIU plugin, or specify path in config or env var.")]
    BinaryNotFound,

    #[error("Failed to spawn CRIU: {reason}")]
    SpawnFailed { reason: String },

    #[error("CRIU transport failure: {reason}")]
    Transport { reason: String },

    #[error("Malformed CRIU response: {reason}")]
    MalformedResponse { reason: String },

    #[error("CRIU response exceeds receive buffer of {size} bytes")]
    ResponseTooLarge { size: usize },

    #[error("{request} operation failed (msg:{message} err:{errno}), see log {log_file}")]
    OperationFailed {
        request: &'static str,
        message: String,
        errno: i32,
        log_file: String,
    },

    #[error("Unexpected CRIU response: expected {expected}, got {got}")]
    UnexpectedResponse {
        expected: &'static str,
        got: &'static str,
    },

    #[error("Unexpected notify from CRIU with no hooks registered")]
    UnexpectedNotify,

    #[error("CRIU version {version} is older than required {min}")]
    VersionTooOld { version: i32, min: i32 },

    #[error("CRIU is missing features: {}", features.join(", "))]
    MissingFeatures { features: Vec<&'static str> },

    #[error("CRIU compatibility check failed: {reason}")]
    Incompatible { reason: String },
}

impl CriuError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CriuError::BinaryNotFound
            | CriuError::VersionTooOld { .. }
            | CriuError::MissingFeatures { .. }
            | CriuError::Incompatible { .. } => ErrorCode::FailedPrecondition,
            _ => ErrorCode::Internal,
        }
    }
}

/// Streaming image filesystem errors.
#[derive(Debug, Error)]
pub enum StreamerError {
    #[error("invalid number of streams: {streams}")]
    InvalidStreams { streams: i32 },

    #[error("expected {expected} images, got {found}. please specify correct number of streams")]
    ShardCountMismatch { expected: usize, found: usize },

    #[error("failed to start streamer: {reason}")]
    SpawnFailed { reason: String },

    #[error("timed out waiting for streamer to start: {last_message}")]
    ReadyTimeout { last_message: String },

    #[error("failed to connect to streamer: {reason}")]
    ConnectFailed { reason: String },

    #[error("streamer control request for {file} failed: {reason}")]
    Control { file: String, reason: String },

    #[error("file does not exist: {file}")]
    FileNotFound { file: String },

    #[error("streaming filesystem is not open for {operation}")]
    WrongMode { operation: &'static str },

    #[error("streaming I/O failed: {}", join_display(errors))]
    ShardIo { errors: Vec<std::io::Error> },
}

impl StreamerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StreamerError::InvalidStreams { .. } | StreamerError::ShardCountMismatch { .. } => {
                ErrorCode::InvalidArgument
            }
            StreamerError::FileNotFound { .. } => ErrorCode::NotFound,
            _ => ErrorCode::Internal,
        }
    }
}

/// GPU sidecar errors.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("a GPU controller is already attached to {jid}")]
    AlreadyAttached { jid: JobId },

    #[error("No GPU attached to job {jid}")]
    NotAttached { jid: JobId },

    #[error("Leave running is not compatible with GPU support, yet")]
    LeaveRunningUnsupported,

    #[error("Failed to spawn GPU controller: {reason}")]
    SpawnFailed { reason: String },

    #[error("GPU controller exited prematurely: {detail}")]
    ControllerExited { detail: String },

    #[error("GPU controller health check failed: {reason}")]
    HealthCheckFailed { reason: String },

    #[error("GPU controller {call} timed out after {timeout_ms}ms")]
    Timeout { call: &'static str, timeout_ms: u64 },

    #[error("GPU controller {call} failed: {reason}")]
    CallFailed { call: &'static str, reason: String },

    #[error("GPU restore was never started for job {jid}")]
    RestoreNotStarted { jid: JobId },
}

impl GpuError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GpuError::AlreadyAttached { .. } | GpuError::LeaveRunningUnsupported => {
                ErrorCode::FailedPrecondition
            }
            GpuError::NotAttached { .. } => ErrorCode::NotFound,
            _ => ErrorCode::Internal,
        }
    }
}

fn join_display<E: fmt::Display>(errors: &[E]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias using CryoError.
pub type CryoResult<T> = Result<T, CryoError>;
