use thiserror::Error;

use crate::resilience::CircuitOpenError;

#[derive(Error, Debug)]
pub enum BuildPilotError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Upstream rejected request (status {status}): {message}")]
    UpstreamClient { status: u16, message: String },

    #[error("Upstream unavailable (status {status}): {message}")]
    UpstreamTransient { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Circuit breaker open for endpoint '{endpoint}', upstream temporarily unavailable")]
    CircuitOpen { endpoint: String },

    #[error("Build {0} not found in queue")]
    NotFoundInQueue(String),

    #[error("Build {0} not found")]
    BuildNotFound(String),

    #[error("Queue limit reached for {build_type_id}: {reason}")]
    CapacityExceeded {
        build_type_id: String,
        reason: String,
    },

    #[error("Build {build_id} is blocked by: {}", blocked_by.join(", "))]
    Blocked {
        build_id: String,
        blocked_by: Vec<String>,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildPilotError {
    /// HTTP status carried by upstream errors, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::UpstreamClient { status, .. } | Self::UpstreamTransient { status, .. } => {
                Some(*status)
            }
            Self::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// 4xx responses. These are never retried.
    pub fn is_client_error(&self) -> bool {
        matches!(self.status(), Some(status) if (400..500).contains(&status) && status != 429)
    }

    /// Whether a later attempt of the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UpstreamTransient { .. } => true,
            Self::Network(e) => !self.is_client_error() && (e.is_connect() || e.is_timeout() || e.is_request()),
            _ => false,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

impl From<CircuitOpenError> for BuildPilotError {
    fn from(err: CircuitOpenError) -> Self {
        Self::CircuitOpen {
            endpoint: err.endpoint,
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildPilotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_not_retryable() {
        let err = BuildPilotError::UpstreamClient {
            status: 403,
            message: "forbidden".to_string(),
        };
        assert!(err.is_client_error());
        assert!(!err.is_retryable());
        assert_eq!(err.status(), Some(403));
    }

    #[test]
    fn transient_errors_are_retryable() {
        for status in [429, 500, 503] {
            let err = BuildPilotError::UpstreamTransient {
                status,
                message: String::new(),
            };
            assert!(err.is_retryable(), "status {status} should be retryable");
            assert!(!err.is_client_error(), "status {status} is not a client error");
        }
    }

    #[test]
    fn validation_and_circuit_errors_are_terminal() {
        assert!(!BuildPilotError::Validation("bad".into()).is_retryable());
        let open: BuildPilotError = CircuitOpenError {
            endpoint: "buildQueue".into(),
        }
        .into();
        assert!(open.is_circuit_open());
        assert!(!open.is_retryable());
        assert!(open.to_string().contains("buildQueue"));
    }

    #[test]
    fn blocked_error_lists_blockers() {
        let err = BuildPilotError::Blocked {
            build_id: "B".into(),
            blocked_by: vec!["C".into(), "D".into()],
        };
        assert_eq!(err.to_string(), "Build B is blocked by: C, D");
    }
}
