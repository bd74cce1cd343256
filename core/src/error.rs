/// Error types for the inbox core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The tenant has no WhatsApp integration set up (or the backend answered with HTML)
    #[error("WhatsApp integration not configured: {0}")]
    NotConfigured(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl InboxError {
    /// Failures that the next poll tick may recover from on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InboxError::Io(_)
                | InboxError::Serialization(_)
                | InboxError::Http(_)
                | InboxError::Api(_)
                | InboxError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, InboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(InboxError::Timeout("slow".into()).is_transient());
        assert!(InboxError::Api("boom".into()).is_transient());
        assert!(!InboxError::NotConfigured("x".into()).is_transient());
        assert!(!InboxError::PermissionDenied("x".into()).is_transient());
        assert!(!InboxError::Session("x".into()).is_transient());
    }
}
