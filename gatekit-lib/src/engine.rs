//! Caller-owned engine bundle.
//!
//! A [`Gateway`] holds every piece of mutable state the protocol needs: the
//! rotating API key, push token and AES key, the dispatcher and, when
//! configured, the token refresher with its JSON API client. Several engines
//! can coexist in one process.

use crate::api::ApiClient;
use crate::config::{GatewayConfig, PushConfig};
use crate::crypto::AesKey;
use crate::dispatch::{Credential, Dispatcher};
use crate::errors::GatewayError;
use crate::params::{nonce_str, ParameterMap, NONCE_LEN};
use crate::rotation::RotatingSecret;
use crate::signing;
use crate::token::TokenRefresher;
use crate::Result;
use std::sync::Arc;
use tracing::info;

/// Engine instance built from a [`GatewayConfig`].
pub struct Gateway {
    credential: Credential,
    push: Option<PushConfig>,
    api_key: Arc<RotatingSecret<String>>,
    push_token: Arc<RotatingSecret<String>>,
    aes_key: Option<Arc<RotatingSecret<AesKey>>>,
    dispatcher: Dispatcher,
    tokens: Option<Arc<TokenRefresher>>,
    api: Option<ApiClient>,
}

impl Gateway {
    /// Build the engine.
    ///
    /// When `config.token` is set the refresher task is spawned, so this must
    /// then be called inside a tokio runtime.
    pub fn from_config(config: GatewayConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(GatewayError::invalid_config("api_key", "must not be empty"));
        }
        let api_key = Arc::new(RotatingSecret::new(config.api_key));

        let (push_token, aes_key) = match &config.push {
            Some(push) => {
                let aes_key = push
                    .encoded_aes_key
                    .as_deref()
                    .map(AesKey::from_encoded)
                    .transpose()?
                    .map(|key| Arc::new(RotatingSecret::new(key)));
                (push.token.clone(), aes_key)
            }
            None => (String::new(), None),
        };

        let dispatcher = Dispatcher::new(config.dispatch.clone(), config.credential.clone(), api_key.clone())?;

        let (tokens, api) = match config.token {
            Some(token) => {
                let timeout = token.timeout_secs;
                let tokens = Arc::new(TokenRefresher::from_config(token)?);
                let api = ApiClient::new(config.api_url, tokens.clone(), timeout)?;
                (Some(tokens), Some(api))
            }
            None => (None, None),
        };

        Ok(Self {
            credential: config.credential,
            push: config.push,
            api_key,
            push_token: Arc::new(RotatingSecret::new(push_token)),
            aes_key,
            dispatcher,
            tokens,
            api,
        })
    }

    /// Merchant identity.
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Push settings, if configured.
    pub fn push_config(&self) -> Option<&PushConfig> {
        self.push.as_ref()
    }

    /// Rotating API key shared with the dispatcher and payment verifiers.
    pub fn api_key(&self) -> &Arc<RotatingSecret<String>> {
        &self.api_key
    }

    /// Rotating push signature token.
    pub fn push_token(&self) -> &Arc<RotatingSecret<String>> {
        &self.push_token
    }

    /// Rotating push AES key, if encrypted pushes are configured.
    pub fn aes_key(&self) -> Option<&Arc<RotatingSecret<AesKey>>> {
        self.aes_key.as_ref()
    }

    /// Outbound dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Replace the dispatcher, e.g. with one carrying a client certificate.
    pub fn set_dispatcher(&mut self, dispatcher: Dispatcher) {
        self.dispatcher = dispatcher;
    }

    /// Token refresher, if configured.
    pub fn tokens(&self) -> Option<&Arc<TokenRefresher>> {
        self.tokens.as_ref()
    }

    /// JSON API client, if a token source is configured.
    pub fn api(&self) -> Option<&ApiClient> {
        self.api.as_ref()
    }

    /// Rotate the API key. Returns `false` if it was already current.
    pub fn rotate_api_key(&self, key: impl Into<String>) -> bool {
        let rotated = self.api_key.set(key.into());
        if rotated {
            info!("api key rotated");
        }
        rotated
    }

    /// Rotate the push token. Returns `false` if it was already current.
    pub fn rotate_push_token(&self, token: impl Into<String>) -> bool {
        let rotated = self.push_token.set(token.into());
        if rotated {
            info!("push token rotated");
        }
        rotated
    }

    /// Rotate the push AES key from its encoded form.
    pub fn rotate_aes_key(&self, encoded: &str) -> Result<bool> {
        let slot = self
            .aes_key
            .as_ref()
            .ok_or_else(|| GatewayError::invalid_config("aes_key", "encrypted pushes are not configured"))?;
        let rotated = slot.set(AesKey::from_encoded(encoded)?);
        if rotated {
            info!("push aes key rotated");
        }
        Ok(rotated)
    }

    /// Signed arguments for the client-side payment bridge.
    pub fn js_bridge_args(&self, prepay_id: &str) -> ParameterMap {
        signing::js_bridge_args(
            &self.credential.app_id,
            prepay_id,
            &self.api_key.current(),
            self.credential.sign_algorithm,
        )
    }

    /// Page signature for client SDK configuration, using the cached ticket.
    pub async fn page_signature(&self, noncestr: &str, timestamp: &str, url: &str) -> Result<String> {
        let tokens = self
            .tokens
            .as_ref()
            .ok_or_else(|| GatewayError::invalid_config("token", "no token source configured"))?;
        let ticket = tokens.ticket().await?;
        Ok(signing::page_signature(&ticket, noncestr, timestamp, url))
    }

    /// [`Gateway::page_signature`] with a fresh nonce and the current time,
    /// returning `(noncestr, timestamp, signature)`.
    pub async fn page_signature_now(&self, url: &str) -> Result<(String, String, String)> {
        let noncestr = nonce_str(NONCE_LEN);
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = self.page_signature(&noncestr, &timestamp, url).await?;
        Ok((noncestr, timestamp, signature))
    }
}
