use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by graph compilation, step execution, and the engines.
///
/// The type is cloneable and serializable: a failure travels inside
/// `FlowData::Error`, may be delivered to several listeners, and is persisted
/// inside `NODE_FAILED` events.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrandError {
    // Graph / dispatch errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    // Step errors
    #[error("Step execution failed: {step}: {message}")]
    StepExecution { step: String, message: String },

    #[error("Routing failed at {node}: {message}")]
    Routing { node: String, message: String },

    #[error("Parallel branch {branch} of {node} failed: {message}")]
    ParallelBranch {
        node: String,
        branch: String,
        message: String,
    },

    // Persistence errors
    #[error("Recovery error: {message}")]
    Recovery { message: String },

    #[error("Event log error: {message}")]
    EventLog { message: String },

    // Streaming errors
    #[error("Buffer error: {buffer}: {message}")]
    Buffer { buffer: String, message: String },

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Timed out")]
    Timeout,

    // I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    // JSON errors
    #[error("JSON error: {message}")]
    Json { message: String },
}

impl StrandError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepExecution {
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn routing(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Routing {
            node: node.into(),
            message: message.into(),
        }
    }

    pub fn recovery(message: impl Into<String>) -> Self {
        Self::Recovery {
            message: message.into(),
        }
    }

    pub fn event_log(message: impl Into<String>) -> Self {
        Self::EventLog {
            message: message.into(),
        }
    }

    pub fn buffer(buffer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Buffer {
            buffer: buffer.into(),
            message: message.into(),
        }
    }

    /// Engine faults that must never be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::Recovery { .. } | Self::EventLog { .. }
        )
    }

    /// The innermost human-readable message, without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            Self::Configuration { message }
            | Self::Recovery { message }
            | Self::EventLog { message }
            | Self::Io { message }
            | Self::Json { message } => message.clone(),
            Self::StepExecution { message, .. }
            | Self::Routing { message, .. }
            | Self::ParallelBranch { message, .. }
            | Self::Buffer { message, .. } => message.clone(),
            Self::Cancelled | Self::Timeout => self.to_string(),
        }
    }
}

impl From<std::io::Error> for StrandError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for StrandError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json {
            message: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StrandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = StrandError::step("fetch", "connection refused");
        assert_eq!(
            err.to_string(),
            "Step execution failed: fetch: connection refused"
        );
        assert_eq!(err.message(), "connection refused");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(StrandError::config("unknown entry").is_fatal());
        assert!(StrandError::recovery("bad seq").is_fatal());
        assert!(!StrandError::step("a", "boom").is_fatal());
        assert!(!StrandError::routing("a", "boom").is_fatal());
    }

    #[test]
    fn test_serde_keeps_variant() {
        let err = StrandError::ParallelBranch {
            node: "fan".into(),
            branch: "b2".into(),
            message: "nope".into(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"parallel_branch\""));
        let parsed: StrandError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, err);
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: StrandError = io.into();
        assert!(matches!(err, StrandError::Io { .. }));
    }
}
