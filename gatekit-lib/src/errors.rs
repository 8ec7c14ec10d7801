//! Error types for gateway operations.
//!
//! Every failure the engine can report is a [`GatewayError`]. The variant is
//! decided at the boundary where the remote response (or inbound push) is
//! parsed, and [`GatewayError::kind`] groups variants into the retry classes
//! the dispatcher and verifiers act on.

/// Business error code meaning the gateway hit an internal error and the same
/// request may be repeated.
pub const ERR_CODE_SYSTEM_ERROR: &str = "SYSTEMERROR";

/// Business error code meaning the request was rejected under concurrency and
/// should be retried.
pub const ERR_CODE_NEED_RETRY: &str = "BIZERR_NEED_RETRY";

/// JSON API error code for an invalid access token.
pub const API_INVALID_CREDENTIAL: i64 = 40001;

/// JSON API error code for an expired access token.
pub const API_ACCESS_TOKEN_EXPIRED: i64 = 42001;

/// Coarse classification of a [`GatewayError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorKind {
    /// Network or HTTP-status failure.
    Transport,
    /// Outer `return_code` failure.
    Envelope,
    /// Inner `result_code` failure or JSON API `errcode`.
    Business,
    /// Signature or decryption failure.
    Security,
    /// Identity or round-trip field inconsistency.
    FieldMismatch,
    /// Malformed payload or out-of-range protocol value.
    Protocol,
    /// Local misconfiguration or engine shutdown.
    Internal,
}

/// Comprehensive error type for gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The request never produced an HTTP response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The gateway answered with a non-200 status.
    #[error("http status {status} from {url}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Requested URL.
        url: String,
    },

    /// The envelope-level `return_code` was not `SUCCESS`.
    #[error("return_code: {return_code:?}, return_msg: {return_msg:?}")]
    Envelope {
        /// Value of `return_code`.
        return_code: String,
        /// Value of `return_msg`.
        return_msg: String,
    },

    /// The business-level `result_code` was not `SUCCESS`.
    #[error("result_code: {result_code:?}, err_code: {err_code:?}, err_code_des: {err_code_des:?}")]
    Business {
        /// Value of `result_code`.
        result_code: String,
        /// Value of `err_code`.
        err_code: String,
        /// Value of `err_code_des`.
        err_code_des: String,
    },

    /// A JSON API call returned a non-zero `errcode`.
    #[error("errcode: {code}, errmsg: {message}")]
    Api {
        /// Value of `errcode`.
        code: i64,
        /// Value of `errmsg`.
        message: String,
    },

    /// A signature did not match under any accepted secret.
    #[error("signature mismatch: {0}")]
    Signature(String),

    /// An encrypted envelope could not be decrypted or was malformed.
    #[error("decrypt failed: {0}")]
    Decrypt(String),

    /// An identity or echoed field differs from what this client expects.
    #[error("{field} mismatch, have: {have:?}, want: {want:?}")]
    FieldMismatch {
        /// Field name.
        field: String,
        /// Value received.
        have: String,
        /// Value expected.
        want: String,
    },

    /// The wire envelope could not be parsed.
    #[error("malformed wire envelope: {0}")]
    Codec(String),

    /// A token endpoint declared a lifetime outside the supported buckets.
    #[error("expires_in out of range: {0}")]
    TokenLifetime(i64),

    /// A `sign_type` this engine cannot compute.
    #[error("unsupported sign type: {0:?}")]
    UnsupportedSignType(String),

    /// Invalid local configuration.
    #[error("invalid {field}: {reason}")]
    InvalidConfig {
        /// Offending field.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The token refresher task is no longer running.
    #[error("token refresher stopped")]
    RefresherStopped,
}

impl GatewayError {
    /// Get the retry class of this error.
    pub fn kind(&self) -> GatewayErrorKind {
        match self {
            Self::Transport(_) | Self::HttpStatus { .. } => GatewayErrorKind::Transport,
            Self::Envelope { .. } => GatewayErrorKind::Envelope,
            Self::Business { .. } | Self::Api { .. } => GatewayErrorKind::Business,
            Self::Signature(_) | Self::Decrypt(_) => GatewayErrorKind::Security,
            Self::FieldMismatch { .. } => GatewayErrorKind::FieldMismatch,
            Self::Codec(_) | Self::TokenLifetime(_) | Self::UnsupportedSignType(_) => {
                GatewayErrorKind::Protocol
            }
            Self::InvalidConfig { .. } | Self::Serialization(_) | Self::RefresherStopped => {
                GatewayErrorKind::Internal
            }
        }
    }

    /// Returns true if the one endpoint-failover retry applies to this error.
    ///
    /// Transport failures, HTTP 5xx and the business codes `SYSTEMERROR` and
    /// `BIZERR_NEED_RETRY` qualify. Everything else is terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::HttpStatus { status, .. } => *status >= 500,
            Self::Business { err_code, .. } => {
                err_code == ERR_CODE_SYSTEM_ERROR || err_code == ERR_CODE_NEED_RETRY
            }
            _ => false,
        }
    }

    /// Returns true if a JSON API error means the access token must be refreshed.
    pub fn is_stale_token(&self) -> bool {
        matches!(
            self,
            Self::Api { code, .. } if *code == API_INVALID_CREDENTIAL || *code == API_ACCESS_TOKEN_EXPIRED
        )
    }

    /// Create a field mismatch error.
    pub fn mismatch(field: impl Into<String>, have: impl Into<String>, want: impl Into<String>) -> Self {
        Self::FieldMismatch {
            field: field.into(),
            have: have.into(),
            want: want.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::HttpStatus {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            },
            None => Self::Transport(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<quick_xml::Error> for GatewayError {
    fn from(err: quick_xml::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
