//! Error model of the queue domain.

use std::backtrace::BacktraceStatus;
use std::time::Duration;

use thiserror::Error;

/// Failure to turn a payload into its durable form, or back.
///
/// `UnknownType` and `Malformed` are kept apart so operators can tell a worker
/// that lacks a registration from a corrupted row.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Enqueue-time: the payload type has no registered execution entry point.
    #[error("cannot enqueue `{0}`: no perform capability is registered for it")]
    InvalidPayload(String),

    /// Decode-time: the stored type name is absent from the registry.
    #[error("job failed to load: unknown handler type `{0}`")]
    UnknownType(String),

    /// Decode-time: the stored handler is not structurally valid.
    #[error("job failed to load: malformed handler for `{job_type}`: {reason}")]
    Malformed { job_type: String, reason: String },

    /// Encode-time: the payload could not be serialized.
    #[error("failed to serialize `{job_type}`: {reason}")]
    Serialize { job_type: String, reason: String },
}

impl CodecError {
    pub fn malformed(job_type: impl Into<String>, reason: impl ToString) -> Self {
        Self::Malformed {
            job_type: job_type.into(),
            reason: reason.to_string(),
        }
    }

    /// True for the decode-time variants (the `DeserializationError` class).
    pub fn is_deserialization(&self) -> bool {
        matches!(self, Self::UnknownType(_) | Self::Malformed { .. })
    }
}

/// Anything that went wrong while running a claimed job.
///
/// Always caught by the executor and turned into a reschedule or a terminal
/// failure; never propagated to the worker loop.
#[derive(Debug, Error)]
pub enum ExecutionFault {
    #[error(transparent)]
    Decode(#[from] CodecError),

    #[error("{0}")]
    Failed(anyhow::Error),

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("execution expired after {0:?}")]
    TimedOut(Duration),
}

impl ExecutionFault {
    /// Short class name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "DeserializationError",
            Self::Failed(_) => "ExecutionFault",
            Self::Panicked(_) => "Panic",
            Self::TimedOut(_) => "Timeout",
        }
    }

    /// Cause chain and captured backtrace, one entry per line.
    pub fn trace(&self) -> Vec<String> {
        let Self::Failed(err) = self else {
            return Vec::new();
        };

        let mut lines: Vec<String> = err
            .chain()
            .skip(1)
            .map(|cause| format!("caused by: {cause}"))
            .collect();

        let backtrace = err.backtrace();
        if backtrace.status() == BacktraceStatus::Captured {
            lines.extend(backtrace.to_string().lines().map(str::to_string));
        }
        lines
    }
}

/// Invalid or missing configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing configuration value: {0}")]
    Missing(String),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub fn missing(key: impl Into<String>) -> Self {
        Self::Missing(key.into())
    }

    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_variants_are_deserialization_errors() {
        assert!(CodecError::UnknownType("Gone".into()).is_deserialization());
        assert!(CodecError::malformed("Mail", "eof").is_deserialization());
        assert!(!CodecError::InvalidPayload("Mail".into()).is_deserialization());
    }

    #[test]
    fn failed_fault_reports_cause_chain() {
        let err = anyhow::anyhow!("disk full").context("writing report");
        let fault = ExecutionFault::Failed(err);

        assert_eq!(fault.to_string(), "writing report");
        assert_eq!(fault.kind(), "ExecutionFault");
        assert_eq!(fault.trace().first().map(String::as_str), Some("caused by: disk full"));
    }

    #[test]
    fn timeout_has_no_trace() {
        let fault = ExecutionFault::TimedOut(Duration::from_secs(3));
        assert!(fault.trace().is_empty());
        assert_eq!(fault.to_string(), "execution expired after 3s");
    }
}
