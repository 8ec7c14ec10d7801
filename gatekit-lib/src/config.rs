//! Engine configuration.
//!
//! Everything is plain serde data so it can come from a file, or from the
//! environment through [`GatewayConfig::from_env`]:
//!
//! | variable                   | field                         |
//! |----------------------------|-------------------------------|
//! | `GATEKIT_APP_ID`           | `credential.app_id` (required) |
//! | `GATEKIT_MCH_ID`           | `credential.mch_id` (required) |
//! | `GATEKIT_API_KEY`          | `api_key` (required)          |
//! | `GATEKIT_SUB_APP_ID`       | `credential.sub_app_id`       |
//! | `GATEKIT_SUB_MCH_ID`       | `credential.sub_mch_id`       |
//! | `GATEKIT_SIGN_TYPE`        | `credential.sign_algorithm`   |
//! | `GATEKIT_PRIMARY_URL`      | `dispatch.primary_url`        |
//! | `GATEKIT_MIRROR_URL`       | `dispatch.mirror_url`         |
//! | `GATEKIT_TIMEOUT_SECS`     | `dispatch.timeout_secs`       |
//! | `GATEKIT_APP_SECRET`       | enables `token`               |
//! | `GATEKIT_NEEDS_TICKET`     | `token.needs_ticket`          |
//! | `GATEKIT_PUSH_TOKEN`       | enables `push`                |
//! | `GATEKIT_PUSH_ACCOUNT_ID`  | `push.account_id`             |
//! | `GATEKIT_AES_KEY`          | `push.encoded_aes_key`        |

use crate::api::DEFAULT_API_URL;
use crate::dispatch::{Credential, DispatchConfig};
use crate::signing::SignAlgorithm;
use crate::token::TokenConfig;
use serde::{Deserialize, Serialize};

/// Message-push settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PushConfig {
    /// Expected `ToUserName` of encrypted pushes (the account's original id).
    /// Empty disables the check.
    #[serde(default)]
    pub account_id: String,

    /// Expected identity trailer of decrypted pushes. Empty disables the check.
    #[serde(default)]
    pub app_id: String,

    /// Token used for push signatures.
    pub token: String,

    /// 43-character base64 AES key; required for encrypted pushes.
    #[serde(default)]
    pub encoded_aes_key: Option<String>,
}

impl PushConfig {
    /// Create a plaintext-only push configuration.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Self::default()
        }
    }

    /// Set the expected account and application identities.
    pub fn with_identity(mut self, account_id: impl Into<String>, app_id: impl Into<String>) -> Self {
        self.account_id = account_id.into();
        self.app_id = app_id.into();
        self
    }

    /// Set the encoded AES key.
    pub fn with_aes_key(mut self, encoded: impl Into<String>) -> Self {
        self.encoded_aes_key = Some(encoded.into());
        self
    }
}

/// Complete engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Merchant identity.
    pub credential: Credential,

    /// Initial API key.
    pub api_key: String,

    /// Merchant API endpoints.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// JSON API host.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Access token source; no refresher is started without it.
    #[serde(default)]
    pub token: Option<TokenConfig>,

    /// Message push verification.
    #[serde(default)]
    pub push: Option<PushConfig>,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

impl GatewayConfig {
    /// Create a configuration for the merchant API only.
    pub fn new(credential: Credential, api_key: impl Into<String>) -> Self {
        Self {
            credential,
            api_key: api_key.into(),
            dispatch: DispatchConfig::default(),
            api_url: default_api_url(),
            token: None,
            push: None,
        }
    }

    /// Set the merchant API endpoints.
    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Set the JSON API host.
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    /// Enable the token refresher.
    pub fn with_token(mut self, token: TokenConfig) -> Self {
        self.token = Some(token);
        self
    }

    /// Enable message push verification.
    pub fn with_push(mut self, push: PushConfig) -> Self {
        self.push = Some(push);
        self
    }

    /// Read the configuration from `GATEKIT_*` variables.
    ///
    /// Returns `None` if any required variable is missing. Unparseable
    /// optional values are ignored.
    pub fn from_env() -> Option<Self> {
        let app_id = std::env::var("GATEKIT_APP_ID").ok()?;
        let mch_id = std::env::var("GATEKIT_MCH_ID").ok()?;
        let api_key = std::env::var("GATEKIT_API_KEY").ok()?;

        let mut credential = Credential::new(app_id.clone(), mch_id);
        if let Ok(sub_app_id) = std::env::var("GATEKIT_SUB_APP_ID") {
            credential = credential.with_sub_app_id(sub_app_id);
        }
        if let Ok(sub_mch_id) = std::env::var("GATEKIT_SUB_MCH_ID") {
            credential = credential.with_sub_mch_id(sub_mch_id);
        }
        if let Ok(sign_type) = std::env::var("GATEKIT_SIGN_TYPE") {
            if let Ok(algorithm) = sign_type.parse::<SignAlgorithm>() {
                credential = credential.with_sign_algorithm(algorithm);
            }
        }

        let mut dispatch = DispatchConfig::default();
        if let (Ok(primary), Ok(mirror)) = (
            std::env::var("GATEKIT_PRIMARY_URL"),
            std::env::var("GATEKIT_MIRROR_URL"),
        ) {
            dispatch = dispatch.with_urls(primary, mirror);
        }
        let timeout = std::env::var("GATEKIT_TIMEOUT_SECS")
            .ok()
            .and_then(|t| t.parse::<u64>().ok());
        if let Some(secs) = timeout {
            dispatch = dispatch.with_timeout(secs);
        }

        let mut config = Self::new(credential, api_key).with_dispatch(dispatch);

        if let Ok(app_secret) = std::env::var("GATEKIT_APP_SECRET") {
            let needs_ticket = std::env::var("GATEKIT_NEEDS_TICKET")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false);
            let mut token = TokenConfig::new(app_id.clone(), app_secret).with_ticket(needs_ticket);
            if let Some(secs) = timeout {
                token = token.with_timeout(secs);
            }
            config = config.with_token(token);
        }

        if let Ok(push_token) = std::env::var("GATEKIT_PUSH_TOKEN") {
            let account_id = std::env::var("GATEKIT_PUSH_ACCOUNT_ID").unwrap_or_default();
            let mut push = PushConfig::new(push_token).with_identity(account_id, app_id);
            if let Ok(aes_key) = std::env::var("GATEKIT_AES_KEY") {
                push = push.with_aes_key(aes_key);
            }
            config = config.with_push(push);
        }

        Some(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_with_defaults() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{
                "credential": {"app_id": "wx1", "mch_id": "100"},
                "api_key": "key",
                "push": {"token": "push-token"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.credential.sign_algorithm, SignAlgorithm::Md5);
        assert_eq!(config.dispatch.primary_url, crate::dispatch::PRIMARY_URL);
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert!(config.token.is_none());

        let push = config.push.unwrap();
        assert_eq!(push.token, "push-token");
        assert!(push.encoded_aes_key.is_none());
        assert!(push.account_id.is_empty());
    }

    #[test]
    fn test_sign_type_serde_names() {
        let credential: Credential = serde_json::from_str(
            r#"{"app_id": "wx1", "mch_id": "100", "sign_algorithm": "HMAC-SHA256"}"#,
        )
        .unwrap();
        assert_eq!(credential.sign_algorithm, SignAlgorithm::HmacSha256);
    }

    #[test]
    fn test_builders() {
        let config = GatewayConfig::new(Credential::new("wx1", "100"), "key")
            .with_token(TokenConfig::new("wx1", "secret").with_ticket(true))
            .with_push(PushConfig::new("t").with_identity("gh_1", "wx1").with_aes_key("k"));

        assert!(config.token.as_ref().unwrap().needs_ticket);
        let push = config.push.unwrap();
        assert_eq!(push.account_id, "gh_1");
        assert_eq!(push.encoded_aes_key.as_deref(), Some("k"));
    }
}
