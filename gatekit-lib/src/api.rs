//! JSON API client authenticated by access token.
//!
//! Every call carries `access_token` as a query parameter. A response whose
//! `errcode` says the token is invalid or expired triggers exactly one forced
//! refresh and retry; any other non-zero `errcode` becomes
//! [`GatewayError::Api`].

use crate::errors::GatewayError;
use crate::token::TokenRefresher;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default JSON API host.
pub const DEFAULT_API_URL: &str = "https://api.weixin.qq.com";

/// Client for the token-authenticated JSON APIs.
pub struct ApiClient {
    base_url: String,
    tokens: Arc<TokenRefresher>,
    client: reqwest::Client,
}

impl ApiClient {
    /// Create a client for `base_url` using `tokens` for authentication.
    pub fn new(base_url: impl Into<String>, tokens: Arc<TokenRefresher>, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| GatewayError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into(),
            tokens,
            client,
        })
    }

    /// The token refresher backing this client.
    pub fn tokens(&self) -> &Arc<TokenRefresher> {
        &self.tokens
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    /// GET `path` with `query` and decode the JSON response.
    #[tracing::instrument(skip(self, query))]
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = self.url(path);
        self.send_with_token(|token| {
            self.client
                .get(&url)
                .query(query)
                .query(&[("access_token", token)])
        })
        .await
    }

    /// POST `body` as JSON to `path` and decode the JSON response.
    #[tracing::instrument(skip(self, body))]
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        self.send_with_token(|token| {
            self.client
                .post(&url)
                .query(&[("access_token", token)])
                .json(body)
        })
        .await
    }

    async fn send_with_token<T, F>(&self, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let mut token = self.tokens.token().await?;
        let mut refreshed = false;
        loop {
            let response = build(&token).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(GatewayError::HttpStatus {
                    status: status.as_u16(),
                    url: response.url().to_string(),
                });
            }
            let value: serde_json::Value = response.json().await?;

            match check_errcode(&value) {
                Err(err) if err.is_stale_token() && !refreshed => {
                    warn!(error = %err, "access token rejected, refreshing");
                    token = self.tokens.refresh_token(&token).await?;
                    refreshed = true;
                }
                Err(err) => return Err(err),
                Ok(()) => {
                    debug!("api call succeeded");
                    return Ok(serde_json::from_value(value)?);
                }
            }
        }
    }
}

/// Map a non-zero `errcode` to [`GatewayError::Api`].
pub fn check_errcode(value: &serde_json::Value) -> Result<()> {
    let code = value.get("errcode").and_then(serde_json::Value::as_i64).unwrap_or(0);
    if code == 0 {
        return Ok(());
    }
    let message = value
        .get("errmsg")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    Err(GatewayError::Api { code, message })
}
