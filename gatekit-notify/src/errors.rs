//! Error types for inbound notification handling.

use gatekit_lib::{GatewayError, GatewayErrorKind};

/// Why an inbound request was rejected.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Decoding, signature, decryption or identity failure.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The HTTP method is not accepted for this endpoint.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// A required query parameter or body field was absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// The push declared an `encrypt_type` other than raw or aes.
    #[error("unsupported encrypt_type: {0:?}")]
    UnsupportedEncryption(String),

    /// An encrypted push arrived but no AES key is configured.
    #[error("encrypted pushes are not configured")]
    EncryptionNotConfigured,

    /// The application handler refused the notification.
    #[error("handler failed: {0}")]
    Handler(String),
}

impl NotifyError {
    /// Create a handler error.
    pub fn handler(reason: impl Into<String>) -> Self {
        Self::Handler(reason.into())
    }

    /// Returns true for signature, decryption and identity failures.
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            Self::Gateway(err)
                if matches!(err.kind(), GatewayErrorKind::Security | GatewayErrorKind::FieldMismatch)
        )
    }

    /// Text safe to put in a `FAIL` reply.
    ///
    /// Security failures are reported generically so the reply does not echo
    /// expected identities back to the sender.
    pub fn reply_message(&self) -> String {
        if self.is_security() {
            match self {
                Self::Gateway(GatewayError::FieldMismatch { field, .. }) => format!("{field} mismatch"),
                _ => "verification failed".to_string(),
            }
        } else {
            self.to_string()
        }
    }
}

/// Result alias for notification handling.
pub type Result<T> = std::result::Result<T, NotifyError>;
