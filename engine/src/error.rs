//! Error taxonomy shared by every component. Each variant carries its own
//! `recoverable`/user-message behavior so callers never have to re-derive
//! retryability from a string.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("auth: {0}")]
    Auth(String),

    #[error("provider: {0}")]
    Provider(String),

    #[error("network: {0}")]
    Network(String),

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("rate: {0}")]
    Rate(String),

    #[error("config: {0}")]
    Config(String),

    #[error("state: {0}")]
    State(#[from] store::StoreError),

    #[error("validation: {0}")]
    Validation(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl CoreError {
    /// Network, timeout, rate, and provider errors are retryable under the
    /// executor's retry policy. Auth, config, validation, and state errors
    /// are terminal.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::Network(_) | CoreError::Timeout(_) | CoreError::Rate(_) | CoreError::Provider(_)
        )
    }

    /// Stable code for a concise, user-visible message; the raw error stays
    /// on the event payload for diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Auth(_) => "auth_error",
            CoreError::Provider(_) => "provider_error",
            CoreError::Network(_) => "network_error",
            CoreError::Timeout(_) => "timeout",
            CoreError::Rate(_) => "rate_limited",
            CoreError::Config(_) => "config_error",
            CoreError::State(_) => "state_error",
            CoreError::Validation(_) => "validation_error",
            CoreError::Internal(_) => "internal_error",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            CoreError::Auth(_) => "Authentication failed; check your credentials.".to_string(),
            CoreError::Provider(m) => format!("The model provider rejected the request: {m}"),
            CoreError::Network(_) => "A network error occurred; this will be retried.".to_string(),
            CoreError::Timeout(_) => "The operation timed out and will be retried.".to_string(),
            CoreError::Rate(_) => "Rate limit or quota exceeded; backing off.".to_string(),
            CoreError::Config(m) => format!("Invalid configuration: {m}"),
            CoreError::State(_) => "A durable storage error occurred.".to_string(),
            CoreError::Validation(m) => format!("Invalid input: {m}"),
            CoreError::Internal(_) => "An unexpected internal error occurred.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_timeout_and_rate_and_provider_are_retryable() {
        assert!(CoreError::Network("x".into()).recoverable());
        assert!(CoreError::Timeout(std::time::Duration::from_secs(1)).recoverable());
        assert!(CoreError::Rate("x".into()).recoverable());
        assert!(CoreError::Provider("x".into()).recoverable());
    }

    #[test]
    fn auth_config_validation_state_are_terminal() {
        assert!(!CoreError::Auth("x".into()).recoverable());
        assert!(!CoreError::Config("x".into()).recoverable());
        assert!(!CoreError::Validation("x".into()).recoverable());
        assert!(!CoreError::Internal("x".into()).recoverable());
    }
}
