//! Error taxonomy shared by every Outreach crate.

use thiserror::Error;

/// Unified error type.
#[derive(Debug, Error)]
pub enum OutreachError {
    /// Missing or inactive integration, bad credentials, unreadable config.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lead cannot be contacted on the requested channel.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Provider rejected the request; retrying will not help.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider 5xx, timeout, or connection failure.
    #[error("Transient provider error: {0}")]
    Transient(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Lock '{0}' is already held")]
    LockHeld(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl OutreachError {
    /// Whether the queue delivery layer should retry the job.
    pub fn is_transient(&self) -> bool {
        matches!(self, OutreachError::Transient(_) | OutreachError::Queue(_))
    }

    /// Faults caused by the caller's input rather than an upstream system.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            OutreachError::Precondition(_)
                | OutreachError::NotFound(_)
                | OutreachError::InvalidTransition(_)
                | OutreachError::Serialization(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, OutreachError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(OutreachError::Transient("503".into()).is_transient());
        assert!(!OutreachError::Provider("invalid number".into()).is_transient());
        assert!(!OutreachError::Config("no key".into()).is_transient());
    }

    #[test]
    fn test_client_fault_classification() {
        assert!(OutreachError::Precondition("no phone".into()).is_client_fault());
        assert!(!OutreachError::Provider("down".into()).is_client_fault());
        assert!(!OutreachError::Transient("timeout".into()).is_client_fault());
    }
}
