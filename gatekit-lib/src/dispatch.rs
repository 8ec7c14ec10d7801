//! Signed request dispatch to the merchant gateway.
//!
//! A call merges the configured identity into the caller's parameters, adds a
//! nonce, signs with the current API key, encodes the flat envelope and POSTs
//! it to the primary host. A transient failure (see
//! [`GatewayError::is_transient`]) is retried exactly once against the mirror
//! host with the same body.
//!
//! Responses are checked in order: envelope status, business status,
//! signature (current key, then previous), identity fields.

use crate::codec;
use crate::errors::GatewayError;
use crate::params::{
    field, nonce_str, ParameterMap, NONCE_KEY, NONCE_LEN, RESULT_CODE_KEY, RETURN_CODE_KEY,
    RETURN_MSG_KEY, SIGN_KEY, SIGN_TYPE_KEY, STATUS_SUCCESS,
};
use crate::rotation::{RotatingSecret, Slot};
use crate::signing::{self, SignAlgorithm};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Primary merchant API host.
pub const PRIMARY_URL: &str = "https://api.mch.weixin.qq.com";

/// Mirror host used for the single failover retry.
pub const MIRROR_URL: &str = "https://api2.mch.weixin.qq.com";

const CONTENT_TYPE_XML: &str = "text/xml; charset=utf-8";

/// Endpoint settings for the dispatcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Host tried first.
    #[serde(default = "default_primary_url")]
    pub primary_url: String,

    /// Host tried once after a transient failure.
    #[serde(default = "default_mirror_url")]
    pub mirror_url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_primary_url() -> String {
    PRIMARY_URL.to_string()
}

fn default_mirror_url() -> String {
    MIRROR_URL.to_string()
}

fn default_timeout() -> u64 {
    30
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            primary_url: default_primary_url(),
            mirror_url: default_mirror_url(),
            timeout_secs: default_timeout(),
        }
    }
}

impl DispatchConfig {
    /// Set both hosts.
    pub fn with_urls(mut self, primary: impl Into<String>, mirror: impl Into<String>) -> Self {
        self.primary_url = primary.into();
        self.mirror_url = mirror.into();
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Merchant identity attached to every request.
///
/// The API key itself lives in a [`RotatingSecret`] next to this.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Application identifier (`appid`).
    pub app_id: String,

    /// Merchant identifier (`mch_id`).
    pub mch_id: String,

    /// Sub-application identifier for service-provider mode.
    #[serde(default)]
    pub sub_app_id: Option<String>,

    /// Sub-merchant identifier for service-provider mode.
    #[serde(default)]
    pub sub_mch_id: Option<String>,

    /// Algorithm used to sign requests.
    #[serde(default)]
    pub sign_algorithm: SignAlgorithm,
}

impl Credential {
    /// Create a credential signing with MD5.
    pub fn new(app_id: impl Into<String>, mch_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            mch_id: mch_id.into(),
            ..Self::default()
        }
    }

    /// Set the sub-application identifier.
    pub fn with_sub_app_id(mut self, sub_app_id: impl Into<String>) -> Self {
        self.sub_app_id = Some(sub_app_id.into());
        self
    }

    /// Set the sub-merchant identifier.
    pub fn with_sub_mch_id(mut self, sub_mch_id: impl Into<String>) -> Self {
        self.sub_mch_id = Some(sub_mch_id.into());
        self
    }

    /// Set the request signing algorithm.
    pub fn with_sign_algorithm(mut self, algorithm: SignAlgorithm) -> Self {
        self.sign_algorithm = algorithm;
        self
    }

    /// Configured sub-application identifier, if non-empty.
    pub fn sub_app_id(&self) -> Option<&str> {
        self.sub_app_id.as_deref().filter(|s| !s.is_empty())
    }

    /// Configured sub-merchant identifier, if non-empty.
    pub fn sub_mch_id(&self) -> Option<&str> {
        self.sub_mch_id.as_deref().filter(|s| !s.is_empty())
    }
}

/// Field layout and response rules of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallProfile {
    /// Ordinary merchant API: `appid`/`mch_id`, `sign_type`, signed responses.
    Standard,
    /// Merchant-to-user transfers: `mch_appid`/`mchid`, no `sign_type`,
    /// unsigned responses.
    Transfer,
}

impl CallProfile {
    /// Transfer requests are recognized by their `mch_appid` field.
    pub fn detect(params: &ParameterMap) -> Self {
        if params.contains_key("mch_appid") {
            Self::Transfer
        } else {
            Self::Standard
        }
    }
}

/// Outbound request dispatcher.
pub struct Dispatcher {
    config: DispatchConfig,
    credential: Credential,
    api_key: Arc<RotatingSecret<String>>,
    client: reqwest::Client,
    cert_client: Option<reqwest::Client>,
}

impl Dispatcher {
    /// Create a dispatcher signing with `api_key`.
    pub fn new(
        config: DispatchConfig,
        credential: Credential,
        api_key: Arc<RotatingSecret<String>>,
    ) -> Result<Self> {
        let client = Self::client_builder(&config)
            .build()
            .map_err(|e| GatewayError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            credential,
            api_key,
            client,
            cert_client: None,
        })
    }

    /// Configure the TLS client certificate used by [`Dispatcher::call_with_cert`].
    ///
    /// `pem` must hold both the certificate chain and the private key.
    pub fn with_client_identity(mut self, pem: &[u8]) -> Result<Self> {
        let identity = reqwest::Identity::from_pem(pem)
            .map_err(|e| GatewayError::invalid_config("client_identity", e.to_string()))?;
        let client = Self::client_builder(&self.config)
            .identity(identity)
            .build()
            .map_err(|e| GatewayError::Transport(format!("failed to build HTTP client: {e}")))?;
        self.cert_client = Some(client);
        Ok(self)
    }

    fn client_builder(config: &DispatchConfig) -> reqwest::ClientBuilder {
        reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_secs))
    }

    /// Configured identity.
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Endpoint settings.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Sign and send `params` to `path`, returning the verified response.
    #[tracing::instrument(skip(self, params))]
    pub async fn call(&self, path: &str, params: ParameterMap) -> Result<ParameterMap> {
        self.execute(&self.client, path, params).await
    }

    /// Like [`Dispatcher::call`], over the client-certificate connection.
    #[tracing::instrument(skip(self, params))]
    pub async fn call_with_cert(&self, path: &str, params: ParameterMap) -> Result<ParameterMap> {
        let client = self.cert_client.as_ref().ok_or_else(|| {
            GatewayError::invalid_config("client_identity", "no client certificate configured")
        })?;
        self.execute(client, path, params).await
    }

    async fn execute(
        &self,
        client: &reqwest::Client,
        path: &str,
        params: ParameterMap,
    ) -> Result<ParameterMap> {
        let profile = CallProfile::detect(&params);
        let body = self.build_request(params, profile);

        match self.post(client, &self.config.primary_url, path, body.clone(), profile).await {
            Err(err) if err.is_transient() => {
                warn!(error = %err, "transient failure, retrying on mirror host");
                self.post(client, &self.config.mirror_url, path, body, profile).await
            }
            result => result,
        }
    }

    /// Merge identity, nonce and signature into `params` and encode them.
    pub fn build_request(&self, mut params: ParameterMap, profile: CallProfile) -> Vec<u8> {
        let credential = &self.credential;
        let algorithm = match profile {
            CallProfile::Standard => {
                params.insert("appid".into(), credential.app_id.clone());
                params.insert("mch_id".into(), credential.mch_id.clone());
                credential.sign_algorithm
            }
            CallProfile::Transfer => {
                fill_if_empty(&mut params, "mch_appid", &credential.app_id);
                fill_if_empty(&mut params, "mchid", &credential.mch_id);
                SignAlgorithm::Md5
            }
        };
        if let Some(sub_app_id) = credential.sub_app_id() {
            params.insert("sub_appid".into(), sub_app_id.to_string());
        }
        if let Some(sub_mch_id) = credential.sub_mch_id() {
            params.insert("sub_mch_id".into(), sub_mch_id.to_string());
        }
        params.insert(NONCE_KEY.into(), nonce_str(NONCE_LEN));
        if profile == CallProfile::Standard {
            params.insert(SIGN_TYPE_KEY.into(), algorithm.as_str().into());
        }

        let signature = signing::sign(&params, &self.api_key.current(), algorithm);
        params.insert(SIGN_KEY.into(), signature);
        codec::encode(&params)
    }

    async fn post(
        &self,
        client: &reqwest::Client,
        host: &str,
        path: &str,
        body: Vec<u8>,
        profile: CallProfile,
    ) -> Result<ParameterMap> {
        let url = format!("{}/{}", host.trim_end_matches('/'), path.trim_start_matches('/'));
        debug!(%url, "posting request");

        let response = client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_XML)
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(GatewayError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let bytes = response.bytes().await?;
        self.check_response(&bytes, profile)
    }

    /// Decode and validate a response body.
    pub fn check_response(&self, body: &[u8], profile: CallProfile) -> Result<ParameterMap> {
        let response = codec::decode(body)?;

        let return_code = field(&response, RETURN_CODE_KEY);
        if return_code != STATUS_SUCCESS {
            return Err(GatewayError::Envelope {
                return_code: return_code.to_string(),
                return_msg: field(&response, RETURN_MSG_KEY).to_string(),
            });
        }

        let result_code = field(&response, RESULT_CODE_KEY);
        if result_code != STATUS_SUCCESS {
            return Err(GatewayError::Business {
                result_code: result_code.to_string(),
                err_code: field(&response, "err_code").to_string(),
                err_code_des: field(&response, "err_code_des").to_string(),
            });
        }

        if profile == CallProfile::Standard {
            self.check_signature(&response)?;
        }
        self.check_identity(&response)?;
        Ok(response)
    }

    fn check_signature(&self, response: &ParameterMap) -> Result<()> {
        let algorithm = signing::response_algorithm(response)?;
        let verified = self.api_key.try_with(|key| {
            if signing::verify(response, key, algorithm) {
                Ok(())
            } else {
                Err(())
            }
        });
        match verified {
            Ok(((), Slot::Previous)) => {
                debug!("response verified with previous api key");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(()) => {
                warn!(sign_type = %algorithm, "response signature mismatch");
                Err(GatewayError::Signature("response sign mismatch".into()))
            }
        }
    }

    fn check_identity(&self, response: &ParameterMap) -> Result<()> {
        let credential = &self.credential;

        let app_id = field(response, "appid");
        if !app_id.is_empty() && app_id != credential.app_id {
            warn!(have = app_id, "response appid mismatch");
            return Err(GatewayError::mismatch("appid", app_id, &credential.app_id));
        }

        let mch_app_id = field(response, "mch_appid");
        if !mch_app_id.is_empty() && mch_app_id != credential.app_id {
            warn!(have = mch_app_id, "response mch_appid mismatch");
            return Err(GatewayError::mismatch("mch_appid", mch_app_id, &credential.app_id));
        }

        let mut mch_id = field(response, "mch_id");
        if mch_id.is_empty() {
            mch_id = field(response, "mchid");
        }
        if !mch_id.is_empty() && mch_id != credential.mch_id {
            warn!(have = mch_id, "response mch_id mismatch");
            return Err(GatewayError::mismatch("mch_id", mch_id, &credential.mch_id));
        }

        if let Some(want) = credential.sub_app_id() {
            let have = field(response, "sub_appid");
            if !have.is_empty() && have != want {
                warn!(have, "response sub_appid mismatch");
                return Err(GatewayError::mismatch("sub_appid", have, want));
            }
        }
        if let Some(want) = credential.sub_mch_id() {
            let have = field(response, "sub_mch_id");
            if have != want {
                warn!(have, "response sub_mch_id mismatch");
                return Err(GatewayError::mismatch("sub_mch_id", have, want));
            }
        }
        Ok(())
    }
}

fn fill_if_empty(params: &mut ParameterMap, key: &str, value: &str) {
    let entry = params.entry(key.to_string()).or_default();
    if entry.is_empty() {
        *entry = value.to_string();
    }
}
