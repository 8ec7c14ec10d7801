//! Message push endpoint.
//!
//! The gateway talks to one callback URL:
//!
//! - `HEAD` and a bare `GET` are health checks.
//! - `GET` with `signature`/`timestamp`/`nonce`/`echostr` is the URL
//!   ownership handshake; `echostr` is echoed once the signature checks out.
//! - `POST` delivers a message or event, either in the clear
//!   (`encrypt_type` empty or `raw`) or as an AES envelope
//!   (`encrypt_type=aes`), in which case the reply is encrypted too.

use crate::errors::{NotifyError, Result};
use crate::reply::{self, ReplySeal};
use crate::request::{Method, NotifyRequest, NotifyResponse};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use gatekit_lib::params::{field, ParameterMap};
use gatekit_lib::signing::{constant_time_eq, digest_sorted};
use gatekit_lib::{codec, crypto, AesKey, Gateway, GatewayError, RotatingSecret, Slot};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// `MsgType` of event pushes.
pub const EVENT_MSG_TYPE: &str = "event";

/// Handles one kind of pushed message.
///
/// Returning `Some(map)` replies with that map (e.g. a passive text reply);
/// `None` acknowledges with a `SUCCESS` envelope.
#[async_trait]
pub trait PushHandler: Send + Sync {
    /// Handle one verified message.
    async fn handle(&self, message: &ParameterMap) -> Result<Option<ParameterMap>>;
}

#[async_trait]
impl<F> PushHandler for F
where
    F: Fn(&ParameterMap) -> Result<Option<ParameterMap>> + Send + Sync,
{
    async fn handle(&self, message: &ParameterMap) -> Result<Option<ParameterMap>> {
        self(message)
    }
}

/// Routes pushes to handlers by `MsgType`, or by `Event` for event pushes.
#[derive(Clone, Default)]
pub struct PushRouter {
    messages: HashMap<String, Arc<dyn PushHandler>>,
    events: HashMap<String, Arc<dyn PushHandler>>,
    fallback: Option<Arc<dyn PushHandler>>,
}

impl PushRouter {
    /// An empty router; every push is acknowledged until routes are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle messages whose `MsgType` is `msg_type`.
    pub fn on_message(mut self, msg_type: impl Into<String>, handler: impl PushHandler + 'static) -> Self {
        self.messages.insert(msg_type.into(), Arc::new(handler));
        self
    }

    /// Handle event pushes whose `Event` is `event`.
    pub fn on_event(mut self, event: impl Into<String>, handler: impl PushHandler + 'static) -> Self {
        self.events.insert(event.into(), Arc::new(handler));
        self
    }

    /// Handle anything no other route matches.
    pub fn fallback(mut self, handler: impl PushHandler + 'static) -> Self {
        self.fallback = Some(Arc::new(handler));
        self
    }

    fn route(&self, message: &ParameterMap) -> Option<&Arc<dyn PushHandler>> {
        let msg_type = field(message, "MsgType");
        let routed = if msg_type == EVENT_MSG_TYPE {
            self.events.get(field(message, "Event"))
        } else {
            self.messages.get(msg_type)
        };
        routed.or(self.fallback.as_ref())
    }

    /// Run the matching handler. Unrouted messages are acknowledged.
    pub async fn dispatch(&self, message: &ParameterMap) -> Result<Option<ParameterMap>> {
        match self.route(message) {
            Some(handler) => handler.handle(message).await,
            None => {
                debug!(
                    msg_type = field(message, "MsgType"),
                    event = field(message, "Event"),
                    "no push handler registered"
                );
                Ok(None)
            }
        }
    }
}

/// Verifies and answers pushes for one account.
pub struct PushVerifier {
    account_id: String,
    app_id: String,
    token: Arc<RotatingSecret<String>>,
    aes_key: Option<Arc<RotatingSecret<AesKey>>>,
    router: PushRouter,
}

impl PushVerifier {
    /// Create a verifier for plaintext pushes.
    pub fn new(token: Arc<RotatingSecret<String>>, router: PushRouter) -> Self {
        Self {
            account_id: String::new(),
            app_id: String::new(),
            token,
            aes_key: None,
            router,
        }
    }

    /// Check `ToUserName` against `account_id` and the decrypted identity
    /// against `app_id`. Empty values disable the respective check.
    pub fn with_identity(mut self, account_id: impl Into<String>, app_id: impl Into<String>) -> Self {
        self.account_id = account_id.into();
        self.app_id = app_id.into();
        self
    }

    /// Accept encrypted pushes.
    pub fn with_aes_key(mut self, aes_key: Arc<RotatingSecret<AesKey>>) -> Self {
        self.aes_key = Some(aes_key);
        self
    }

    /// Create a verifier sharing `gateway`'s push token, AES key and identity.
    pub fn from_gateway(gateway: &Gateway, router: PushRouter) -> Self {
        let mut verifier = Self::new(gateway.push_token().clone(), router);
        if let Some(push) = gateway.push_config() {
            verifier = verifier.with_identity(push.account_id.clone(), push.app_id.clone());
        }
        if let Some(aes_key) = gateway.aes_key() {
            verifier = verifier.with_aes_key(aes_key.clone());
        }
        verifier
    }

    /// Process one inbound request and build the reply.
    #[tracing::instrument(skip_all, fields(method = %request.method))]
    pub async fn handle(&self, request: &NotifyRequest) -> NotifyResponse {
        let result = match &request.method {
            Method::Head => Ok(NotifyResponse::empty()),
            Method::Get => self.handshake(request),
            Method::Post => self.receive(request).await,
            Method::Other(name) => Err(NotifyError::MethodNotAllowed(name.clone())),
        };
        result.unwrap_or_else(|err| {
            warn!(error = %err, "push rejected");
            reply::failure(&err.reply_message())
        })
    }

    fn handshake(&self, request: &NotifyRequest) -> Result<NotifyResponse> {
        if request.query("signature").is_empty() && request.query("echostr").is_empty() {
            return Ok(NotifyResponse::empty());
        }
        let (token, slot) = self.verify_signature(request)?;
        self.confirm_token(&token, slot);
        info!("push url handshake verified");
        Ok(NotifyResponse::text(request.query("echostr")))
    }

    async fn receive(&self, request: &NotifyRequest) -> Result<NotifyResponse> {
        match request.query("encrypt_type") {
            "" | "raw" => self.receive_plain(request).await,
            "aes" => self.receive_encrypted(request).await,
            other => Err(NotifyError::UnsupportedEncryption(other.to_string())),
        }
    }

    /// Check `signature` and return the token that produced it.
    ///
    /// Does not retire the previous token; see [`Self::confirm_token`].
    fn verify_signature(&self, request: &NotifyRequest) -> Result<(String, Slot)> {
        let signature = request.query("signature");
        if signature.is_empty() {
            return Err(NotifyError::MissingField("signature"));
        }
        let (timestamp, nonce) = (request.query("timestamp"), request.query("nonce"));

        let verified = self.token.find_with(|token| {
            if constant_time_eq(signature, &digest_sorted(&[token, timestamp, nonce])) {
                Ok(token.clone())
            } else {
                Err(())
            }
        });
        match verified {
            Ok((token, slot)) => {
                if slot == Slot::Previous {
                    debug!("push verified with previous token");
                }
                Ok((token, slot))
            }
            Err(()) => Err(GatewayError::Signature("push signature mismatch".into()).into()),
        }
    }

    // Called once every check of a request has passed.
    fn confirm_token(&self, token: &str, slot: Slot) {
        if slot == Slot::Current && self.token.retire_if_current(&token.to_owned()) {
            debug!("previous push token retired");
        }
    }

    async fn receive_plain(&self, request: &NotifyRequest) -> Result<NotifyResponse> {
        let (token, slot) = self.verify_signature(request)?;
        let message = codec::decode(&request.body)?;
        self.confirm_token(&token, slot);
        let answer = self.router.dispatch(&message).await?;
        Ok(answer.map_or_else(reply::success, |answer| NotifyResponse::xml(codec::encode(&answer))))
    }

    async fn receive_encrypted(&self, request: &NotifyRequest) -> Result<NotifyResponse> {
        let aes_key = self.aes_key.as_ref().ok_or(NotifyError::EncryptionNotConfigured)?;
        let (token, token_slot) = self.verify_signature(request)?;
        let (timestamp, nonce) = (request.query("timestamp"), request.query("nonce"));

        let envelope = codec::decode(&request.body)?;
        let to_user = field(&envelope, "ToUserName");
        if !self.account_id.is_empty() && !constant_time_eq(to_user, &self.account_id) {
            return Err(GatewayError::mismatch("ToUserName", to_user, &self.account_id).into());
        }

        let encrypted = field(&envelope, "Encrypt");
        if encrypted.is_empty() {
            return Err(NotifyError::MissingField("Encrypt"));
        }
        let msg_signature = request.query("msg_signature");
        if !constant_time_eq(msg_signature, &digest_sorted(&[&token, timestamp, nonce, encrypted])) {
            return Err(GatewayError::Signature("msg_signature mismatch".into()).into());
        }

        let ciphertext = STANDARD
            .decode(encrypted)
            .map_err(|e| GatewayError::Decrypt(format!("Encrypt is not base64: {e}")))?;

        // The identity check runs per key so a wrong key that happens to
        // unpad cleanly cannot retire the previous one.
        let ((opened, key), slot) = aes_key.try_with(|key| {
            let opened = crypto::decrypt(&ciphertext, key)?;
            if !self.app_id.is_empty() && !constant_time_eq(&String::from_utf8_lossy(&opened.identity), &self.app_id) {
                return Err(GatewayError::mismatch(
                    "AppId",
                    String::from_utf8_lossy(&opened.identity),
                    &self.app_id,
                ));
            }
            Ok((opened, key.clone()))
        })?;
        if slot == Slot::Previous {
            debug!("push decrypted with previous aes key");
        }

        let message = codec::decode(&opened.payload)?;
        self.confirm_token(&token, token_slot);
        let answer = match self.router.dispatch(&message).await? {
            Some(answer) => codec::encode(&answer),
            None => reply::success().body,
        };

        Ok(reply::sealed(
            &answer,
            &ReplySeal {
                token: &token,
                key: &key,
                nonce: opened.nonce,
                identity: &opened.identity,
                timestamp,
                query_nonce: nonce,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekit_lib::params::params_from;

    fn text_reply(message: &ParameterMap) -> Result<Option<ParameterMap>> {
        Ok(Some(params_from(&[
            ("ToUserName", field(message, "FromUserName")),
            ("MsgType", "text"),
            ("Content", "pong"),
        ])))
    }

    fn subscribed(_: &ParameterMap) -> Result<Option<ParameterMap>> {
        Ok(Some(params_from(&[("Content", "welcome")])))
    }

    fn refuse(_: &ParameterMap) -> Result<Option<ParameterMap>> {
        Err(NotifyError::handler("nope"))
    }

    #[tokio::test]
    async fn test_routes_by_msg_type_and_event() {
        let router = PushRouter::new()
            .on_message("text", text_reply)
            .on_event("subscribe", subscribed);

        let text = params_from(&[("MsgType", "text"), ("FromUserName", "user")]);
        assert_eq!(router.dispatch(&text).await.unwrap().unwrap()["ToUserName"], "user");

        let event = params_from(&[("MsgType", "event"), ("Event", "subscribe")]);
        assert_eq!(router.dispatch(&event).await.unwrap().unwrap()["Content"], "welcome");

        let unrouted = params_from(&[("MsgType", "event"), ("Event", "LOCATION")]);
        assert!(router.dispatch(&unrouted).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fallback_and_handler_errors() {
        let router = PushRouter::new().fallback(refuse);
        let image = params_from(&[("MsgType", "image")]);
        assert!(matches!(router.dispatch(&image).await, Err(NotifyError::Handler(_))));
    }

    #[tokio::test]
    async fn test_unsupported_method() {
        let verifier = PushVerifier::new(Arc::new(RotatingSecret::new("t".to_string())), PushRouter::new());
        let request = NotifyRequest::new(Method::Other("PUT".into()), ParameterMap::new(), Vec::new());
        let reply = codec::decode(&verifier.handle(&request).await.body).unwrap();
        assert_eq!(reply["return_code"], "FAIL");
    }
}
