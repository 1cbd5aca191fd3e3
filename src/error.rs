use chrono::{DateTime, Utc};
use thiserror::Error;

/// Malformed or non-monotonic bar input. Fatal for the owning task only.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    #[error("bar series is empty")]
    Empty,

    #[error("timestamps not strictly increasing at bar {index} ({previous} -> {current})")]
    NonMonotonicTimestamp {
        index: usize,
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },

    #[error("malformed bar at index {index}: {reason}")]
    MalformedBar { index: usize, reason: String },

    #[error("cannot read bars from {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("{what} length {actual} does not match bar count {expected}")]
    MisalignedInput {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Invalid configuration, raised before any simulation starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{key} must be in {expected} (value: {value})")]
    OutOfRange {
        key: &'static str,
        value: f64,
        expected: &'static str,
    },

    #[error("emaFast ({fast}) must be shorter than emaSlow ({slow})")]
    PeriodOrder { fast: usize, slow: usize },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SizingError {
    #[error("invalid risk parameters: stop distance {stop_distance} must be positive")]
    InvalidRiskParameters { stop_distance: f64 },

    #[error("invalid sizing input: {reason}")]
    InvalidInput { reason: String },
}

/// Indicator cache failure. Always recoverable by recomputing.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache encode error: {0}")]
    Encode(String),

    #[error("cache decode error: {0}")]
    Decode(String),

    #[error("cache entry holds key {found}, expected {expected}")]
    KeyMismatch { expected: String, found: String },
}

/// Failure of one orchestrated task, attributed to its key in the run report.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("task panicked: {message}")]
    Panicked { message: String },

    #[error("task cancelled before dispatch")]
    Cancelled,

    #[error("duplicate task key '{key}'")]
    DuplicateTask { key: String },
}

impl TaskError {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::Data(_) => "data_error",
            TaskError::Config(_) => "config_error",
            TaskError::Panicked { .. } => "panicked",
            TaskError::Cancelled => "cancelled",
            TaskError::DuplicateTask { .. } => "duplicate_task",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_wraps_domain_errors_with_kind() {
        let err: TaskError = DataError::Empty.into();
        assert_eq!(err.kind(), "data_error");
        assert_eq!(err.to_string(), "data error: bar series is empty");

        let err: TaskError = ConfigError::PeriodOrder { fast: 200, slow: 50 }.into();
        assert_eq!(err.kind(), "config_error");
        assert!(err.to_string().contains("emaFast (200)"));
    }
}
