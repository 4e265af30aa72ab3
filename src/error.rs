//! Error kinds surfaced by the orchestration core.
//!
//! Most hot-path failures are not exceptional (a full queue, an exhausted
//! page pool) and are reported as `Option`/`bool` returns instead, since one
//! request's failure should never block another and the core never retries
//! silently on its own. This enum covers the cases that do need a named,
//! inspectable error.

use std::fmt;

/// Errors raised by orchestration operations.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    /// `submit` found the waiting queue at `max_waiting_queue`.
    QueueFull,
    /// A model forward pass failed; the offending request is marked ERROR
    /// and the batcher continues with the rest of the active set.
    ModelFailure(String),
    /// Hardware signalled a fatal error; every request on the device is
    /// marked ERROR and the device is taken offline.
    DeviceLost { gpu_id: u32, reason: String },
    /// `stop()` was called while the request was still WAITING.
    Cancelled,
    /// `from_hf_cache`/`to_hf_cache` were given a KV-cache layout other than
    /// `[batch, heads, seq, dim]`.
    UnsupportedKvLayout { expected: &'static str, got: String },
    /// A request id was not known to the paged cache or the batcher.
    UnknownRequest(String),
    /// Configuration failed to parse or had an invalid combination of values.
    InvalidConfig(String),
    /// I/O failure loading or saving configuration/profiling data.
    Io(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::QueueFull => write!(f, "waiting queue is full"),
            OrchestratorError::ModelFailure(msg) => write!(f, "model forward pass failed: {msg}"),
            OrchestratorError::DeviceLost { gpu_id, reason } => {
                write!(f, "GPU {gpu_id} lost: {reason}")
            }
            OrchestratorError::Cancelled => write!(f, "request cancelled"),
            OrchestratorError::UnsupportedKvLayout { expected, got } => {
                write!(f, "unsupported KV cache layout: expected {expected}, got {got}")
            }
            OrchestratorError::UnknownRequest(id) => write!(f, "unknown request id: {id}"),
            OrchestratorError::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            OrchestratorError::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<std::io::Error> for OrchestratorError {
    fn from(e: std::io::Error) -> Self {
        OrchestratorError::Io(e.to_string())
    }
}

impl From<toml::de::Error> for OrchestratorError {
    fn from(e: toml::de::Error) -> Self {
        OrchestratorError::InvalidConfig(e.to_string())
    }
}

impl From<toml::ser::Error> for OrchestratorError {
    fn from(e: toml::ser::Error) -> Self {
        OrchestratorError::InvalidConfig(e.to_string())
    }
}

/// Result type alias for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_descriptive() {
        let err = OrchestratorError::DeviceLost {
            gpu_id: 2,
            reason: "XID 79".into(),
        };
        assert!(err.to_string().contains("GPU 2"));
        assert!(err.to_string().contains("XID 79"));

        let err = OrchestratorError::QueueFull;
        assert_eq!(err.to_string(), "waiting queue is full");
    }

    #[test]
    fn unsupported_layout_names_both_sides() {
        let err = OrchestratorError::UnsupportedKvLayout {
            expected: "[batch, heads, seq, dim]",
            got: "[seq, batch, heads, dim]".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("[batch, heads, seq, dim]"));
        assert!(msg.contains("[seq, batch, heads, dim]"));
    }
}
