/// Error taxonomy for the gateway.
///
/// Cancellation is never an error: it folds into `StopReason::Cancelled` on
/// the Response. Malformed stream fragments are logged and skipped inside the
/// adapters. Only credential exhaustion and terminal backend failures reach
/// the caller.

use std::time::Duration;
use thiserror::Error;

/// A process- or connection-level failure raised by a single adapter attempt,
/// before the fallback engine classifies it.
#[derive(Debug, Clone, Error)]
#[error("{backend} backend failed after {elapsed:?}: {detail}")]
pub struct BackendFailure {
    pub backend: &'static str,
    pub elapsed: Duration,
    pub detail: String,
}

impl BackendFailure {
    pub fn new(backend: &'static str, elapsed: Duration, detail: impl Into<String>) -> Self {
        Self {
            backend,
            elapsed,
            detail: detail.into(),
        }
    }
}

/// Errors the gateway raises to its caller.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A terminal failure, or a transient failure once the fallback chain is
    /// exhausted. Carries every model attempted on this request.
    #[error("{failure} (models attempted: {})", .attempted.join(", "))]
    BackendExhausted {
        failure: BackendFailure,
        attempted: Vec<String>,
    },

    /// Neither the credential helper nor the static API key produced a
    /// usable credential.
    #[error("no credential available: {remediation}")]
    CredentialUnavailable { remediation: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_failure_display() {
        let f = BackendFailure::new("cli", Duration::from_millis(120), "exit code 1");
        let msg = f.to_string();
        assert!(msg.contains("cli"));
        assert!(msg.contains("exit code 1"));
    }

    #[test]
    fn test_exhausted_lists_attempted_models() {
        let err = GatewayError::BackendExhausted {
            failure: BackendFailure::new("api", Duration::from_secs(1), "rate limit"),
            attempted: vec!["m1".to_string(), "m2".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("m1, m2"));
        assert!(msg.contains("rate limit"));
    }

    #[test]
    fn test_credential_unavailable_carries_remediation() {
        let err = GatewayError::CredentialUnavailable {
            remediation: "log in or set GEMINI_API_KEY".to_string(),
        };
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }
}
