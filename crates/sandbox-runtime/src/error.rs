//! Error types for sandbox-runtime

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while managing a sandbox runtime
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Missing image, missing executable, or otherwise unusable settings.
    /// Always raised before any port or process is acquired.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The backend cannot perform the requested operation
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The supervised process terminated before the server became ready
    #[error("sandbox process exited before becoming ready (exit code {code:?})")]
    ProcessExited { code: Option<i32> },

    /// Readiness deadline elapsed
    #[error("timed out after {timeout:?} waiting for sandbox runtime to become ready")]
    Timeout {
        timeout: Duration,
        #[source]
        last_error: Option<LivenessError>,
    },

    /// No port in the range could be reserved, locked or not
    #[error("no available port in range {min}-{max}")]
    PortsExhausted { min: u16, max: u16 },

    /// Invalid lifecycle transition
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: crate::runtime::RuntimeStatus,
        to: crate::runtime::RuntimeStatus,
    },

    /// Spawning the container tool failed
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Post-start initialization hook failed
    #[error("post-start initialization failed: {0}")]
    Initialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single failed liveness check
#[derive(Error, Debug)]
pub enum LivenessError {
    /// The request never produced a response
    #[error("liveness request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-success status
    #[error("liveness endpoint {url} returned status {status}")]
    Status { url: String, status: u16 },

    /// Any other failure reported by a custom check
    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    /// Whether this error means the sandbox is gone (process died or never came up).
    pub fn is_disconnected(&self) -> bool {
        matches!(
            self,
            RuntimeError::ProcessExited { .. } | RuntimeError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_timeout_wraps_last_liveness_error() {
        let err = RuntimeError::Timeout {
            timeout: Duration::from_secs(3),
            last_error: Some(LivenessError::Status {
                url: "http://localhost:30000/alive".into(),
                status: 503,
            }),
        };
        let source = err.source().expect("timeout should carry its cause");
        assert!(source.to_string().contains("503"));
        assert!(err.is_disconnected());
    }

    #[test]
    fn test_configuration_error_is_not_disconnected() {
        let err = RuntimeError::Configuration("no image".into());
        assert!(!err.is_disconnected());
        assert_eq!(err.to_string(), "configuration error: no image");
    }

    #[test]
    fn test_process_exited_display() {
        let err = RuntimeError::ProcessExited { code: Some(2) };
        assert!(err.to_string().contains("Some(2)"));
    }
}
