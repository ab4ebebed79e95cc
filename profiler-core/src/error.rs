use thiserror::Error;

/// Error taxonomy for the profiler's public API (spec §7).
///
/// Errors raised *inside* the event dispatcher are never surfaced through
/// this type; they are counted and logged instead (see [`crate::profiler`]).
#[derive(Debug, Error, Clone)]
pub enum ProfilerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("clock mode mismatch: {0}")]
    ClockModeMismatch(String),

    #[error("failed to decode stats: {0}")]
    DecodeError(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("unsupported: {0}")]
    NotSupported(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("json error: {0}")]
    Json(String),
}

impl From<std::io::Error> for ProfilerError {
    fn from(err: std::io::Error) -> Self {
        ProfilerError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ProfilerError {
    fn from(err: serde_json::Error) -> Self {
        ProfilerError::Json(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProfilerError>;
