use thiserror::Error;

pub type Result<T> = std::result::Result<T, EntitlementError>;

#[derive(Error, Debug)]
pub enum EntitlementError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Certificate creation failed: {reason}")]
    CertificateCreation { reason: String },

    #[error(
        "Too many content sets for certificate {product}: {content_count} exceeds the limit of {limit}. \
         A newer client supporting compact certificates may be available to address this problem"
    )]
    CertificateTooLarge {
        product: String,
        content_count: usize,
        limit: usize,
    },

    #[error("Concurrent creation conflict for key: {key}")]
    ConcurrentCreationConflict { key: String },

    #[error("Malformed entitlement data: {0}")]
    MalformedPayload(String),

    #[error("Signature verification failed: {0}")]
    SignatureVerification(String),
}

impl EntitlementError {
    /// Only a lost creation race is expected; the caller re-reads and carries on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EntitlementError::ConcurrentCreationConflict { .. })
    }

    pub fn creation(reason: impl Into<String>) -> Self {
        EntitlementError::CertificateCreation {
            reason: reason.into(),
        }
    }
}

impl From<rcgen::Error> for EntitlementError {
    fn from(err: rcgen::Error) -> Self {
        EntitlementError::CertificateCreation {
            reason: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for EntitlementError {
    fn from(err: config::ConfigError) -> Self {
        EntitlementError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_conflict_is_recoverable() {
        let conflict = EntitlementError::ConcurrentCreationConflict {
            key: "v1:abc".to_string(),
        };
        assert!(conflict.is_recoverable());

        let too_large = EntitlementError::CertificateTooLarge {
            product: "Awesome OS".to_string(),
            content_count: 186,
            limit: 185,
        };
        assert!(!too_large.is_recoverable());
        assert!(!EntitlementError::creation("signer offline").is_recoverable());
        assert!(!EntitlementError::Storage("db down".to_string()).is_recoverable());
    }

    #[test]
    fn test_too_large_message_names_product_and_limit() {
        let err = EntitlementError::CertificateTooLarge {
            product: "Awesome OS".to_string(),
            content_count: 186,
            limit: 185,
        };
        let message = err.to_string();
        assert!(message.contains("Awesome OS"));
        assert!(message.contains("186"));
        assert!(message.contains("185"));
    }
}
