//! Payment and refund result notifications.
//!
//! The gateway POSTs a flat signed envelope to the merchant's notify URL
//! after a payment settles or a refund completes. [`PayNotifyVerifier`]
//! authenticates it, hands it to a [`PaymentHandler`] and produces the
//! acknowledgement envelope.

use crate::errors::{NotifyError, Result};
use crate::reply;
use crate::request::{Method, NotifyRequest, NotifyResponse};
use async_trait::async_trait;
use gatekit_lib::params::{field, ParameterMap, RESULT_CODE_KEY, RETURN_CODE_KEY, RETURN_MSG_KEY, STATUS_SUCCESS};
use gatekit_lib::signing::{self, constant_time_eq};
use gatekit_lib::{codec, crypto, Credential, Gateway, GatewayError, RotatingSecret, Slot};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Field carrying the encrypted refund details.
const REFUND_INFO_KEY: &str = "req_info";

/// Application side of the notify endpoint.
///
/// Returning an error makes the verifier answer `FAIL`, so the gateway will
/// redeliver the notification later.
#[async_trait]
pub trait PaymentHandler: Send + Sync {
    /// A verified payment result.
    async fn on_payment(&self, notification: &ParameterMap) -> Result<()>;

    /// A refund result. `refund` holds the decrypted `req_info` fields.
    async fn on_refund(&self, notification: &ParameterMap, refund: &ParameterMap) -> Result<()>;
}

/// Verifies payment and refund notifications for one merchant.
pub struct PayNotifyVerifier {
    credential: Credential,
    api_key: Arc<RotatingSecret<String>>,
    handler: Arc<dyn PaymentHandler>,
}

impl PayNotifyVerifier {
    /// Create a verifier sharing `api_key` with the rest of the engine.
    pub fn new(credential: Credential, api_key: Arc<RotatingSecret<String>>, handler: Arc<dyn PaymentHandler>) -> Self {
        Self {
            credential,
            api_key,
            handler,
        }
    }

    /// Create a verifier bound to `gateway`'s identity and API key.
    pub fn from_gateway(gateway: &Gateway, handler: Arc<dyn PaymentHandler>) -> Self {
        Self::new(gateway.credential().clone(), gateway.api_key().clone(), handler)
    }

    /// Process one inbound request and build the reply.
    ///
    /// Every rejection is answered with a `FAIL` envelope; the reason is
    /// logged and never propagated.
    #[tracing::instrument(skip_all, fields(method = %request.method))]
    pub async fn handle(&self, request: &NotifyRequest) -> NotifyResponse {
        match self.process(request).await {
            Ok(()) => reply::success(),
            Err(err) => {
                warn!(error = %err, "payment notification rejected");
                reply::failure(&err.reply_message())
            }
        }
    }

    async fn process(&self, request: &NotifyRequest) -> Result<()> {
        if request.method != Method::Post {
            return Err(NotifyError::MethodNotAllowed(request.method.to_string()));
        }

        let notification = codec::decode(&request.body)?;

        let return_code = field(&notification, RETURN_CODE_KEY);
        if return_code != STATUS_SUCCESS {
            return Err(GatewayError::Envelope {
                return_code: return_code.to_string(),
                return_msg: field(&notification, RETURN_MSG_KEY).to_string(),
            }
            .into());
        }

        self.check_identity(&notification)?;

        let req_info = field(&notification, REFUND_INFO_KEY);
        if !req_info.is_empty() {
            let (refund, slot) = self.api_key.try_with(|key| {
                let refund = crypto::decrypt_refund_info(req_info, key)?;
                if refund.is_empty() {
                    return Err(GatewayError::Decrypt("req_info decrypted to no fields".into()));
                }
                Ok(refund)
            })?;
            if slot == Slot::Previous {
                debug!("refund info decrypted with previous api key");
            }
            info!(out_refund_no = field(&refund, "out_refund_no"), "refund notification verified");
            return self.handler.on_refund(&notification, &refund).await;
        }

        self.check_signature(&notification)?;

        let result_code = field(&notification, RESULT_CODE_KEY);
        if result_code != STATUS_SUCCESS {
            return Err(GatewayError::Business {
                result_code: result_code.to_string(),
                err_code: field(&notification, "err_code").to_string(),
                err_code_des: field(&notification, "err_code_des").to_string(),
            }
            .into());
        }

        info!(out_trade_no = field(&notification, "out_trade_no"), "payment notification verified");
        self.handler.on_payment(&notification).await
    }

    fn check_identity(&self, notification: &ParameterMap) -> Result<()> {
        let credential = &self.credential;

        let app_id = field(notification, "appid");
        if !credential.app_id.is_empty() && !constant_time_eq(app_id, &credential.app_id) {
            return Err(GatewayError::mismatch("appid", app_id, &credential.app_id).into());
        }
        let mch_id = field(notification, "mch_id");
        if !credential.mch_id.is_empty() && !constant_time_eq(mch_id, &credential.mch_id) {
            return Err(GatewayError::mismatch("mch_id", mch_id, &credential.mch_id).into());
        }

        if let Some(want) = credential.sub_app_id() {
            let sub_app_id = field(notification, "sub_appid");
            if !sub_app_id.is_empty() && !constant_time_eq(sub_app_id, want) {
                return Err(GatewayError::mismatch("sub_appid", sub_app_id, want).into());
            }
        }
        if let Some(want) = credential.sub_mch_id() {
            let sub_mch_id = field(notification, "sub_mch_id");
            if !constant_time_eq(sub_mch_id, want) {
                return Err(GatewayError::mismatch("sub_mch_id", sub_mch_id, want).into());
            }
        }
        Ok(())
    }

    fn check_signature(&self, notification: &ParameterMap) -> Result<()> {
        let algorithm = signing::response_algorithm(notification)?;
        let verified = self.api_key.try_with(|key| {
            if signing::verify(notification, key, algorithm) {
                Ok(())
            } else {
                Err(())
            }
        });
        match verified {
            Ok(((), Slot::Previous)) => {
                debug!("notification verified with previous api key");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(()) => Err(GatewayError::Signature("notification sign mismatch".into()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekit_lib::params::params_from;
    use gatekit_lib::test_utils::{
        encrypt_refund_info, signed_notification, test_credential, TEST_API_KEY,
    };
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        payments: Mutex<Vec<ParameterMap>>,
        refunds: Mutex<Vec<ParameterMap>>,
    }

    #[async_trait]
    impl PaymentHandler for Recorder {
        async fn on_payment(&self, notification: &ParameterMap) -> Result<()> {
            self.payments.lock().unwrap().push(notification.clone());
            Ok(())
        }

        async fn on_refund(&self, _notification: &ParameterMap, refund: &ParameterMap) -> Result<()> {
            self.refunds.lock().unwrap().push(refund.clone());
            Ok(())
        }
    }

    fn verifier(handler: Arc<Recorder>) -> (PayNotifyVerifier, Arc<RotatingSecret<String>>) {
        let key = Arc::new(RotatingSecret::new(TEST_API_KEY.to_string()));
        (PayNotifyVerifier::new(test_credential(), key.clone(), handler), key)
    }

    fn post(params: &ParameterMap) -> NotifyRequest {
        NotifyRequest::post(ParameterMap::new(), codec::encode(params))
    }

    fn return_code(response: &NotifyResponse) -> String {
        codec::decode(&response.body).unwrap()[RETURN_CODE_KEY].clone()
    }

    #[tokio::test]
    async fn test_get_is_rejected() {
        let (verifier, _) = verifier(Arc::default());
        let response = verifier.handle(&NotifyRequest::get(ParameterMap::new())).await;
        assert_eq!(response.status, 200);
        assert_eq!(return_code(&response), "FAIL");
    }

    #[tokio::test]
    async fn test_previous_key_accepted_without_retiring() {
        let recorder = Arc::new(Recorder::default());
        let (verifier, key) = verifier(recorder.clone());
        key.set("rotated-key".into());

        let notification = signed_notification(&[("result_code", "SUCCESS"), ("total_fee", "1")], TEST_API_KEY);
        assert_eq!(return_code(&verifier.handle(&post(&notification)).await), "SUCCESS");
        assert_eq!(key.get().1.as_deref(), Some(TEST_API_KEY));

        let notification = signed_notification(&[("result_code", "SUCCESS")], "rotated-key");
        assert_eq!(return_code(&verifier.handle(&post(&notification)).await), "SUCCESS");
        assert_eq!(key.get(), ("rotated-key".to_string(), None));
        assert_eq!(recorder.payments.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_sign_type_is_rejected() {
        let (verifier, _) = verifier(Arc::default());
        let mut notification = signed_notification(&[("result_code", "SUCCESS")], TEST_API_KEY);
        notification.insert("sign_type".into(), "RSA".into());
        assert_eq!(return_code(&verifier.handle(&post(&notification)).await), "FAIL");
    }

    #[tokio::test]
    async fn test_refund_branch_skips_signature() {
        let recorder = Arc::new(Recorder::default());
        let (verifier, _) = verifier(recorder.clone());

        let info = params_from(&[("out_refund_no", "R1"), ("refund_status", "SUCCESS")]);
        let notification = params_from(&[
            ("return_code", "SUCCESS"),
            ("appid", "wx_test_app"),
            ("mch_id", "10000100"),
            ("req_info", &encrypt_refund_info(&info, TEST_API_KEY)),
        ]);

        assert_eq!(return_code(&verifier.handle(&post(&notification)).await), "SUCCESS");
        assert_eq!(recorder.refunds.lock().unwrap()[0], info);
    }

    #[tokio::test]
    async fn test_sub_mch_id_required_when_configured() {
        let key = Arc::new(RotatingSecret::new(TEST_API_KEY.to_string()));
        let credential = test_credential().with_sub_mch_id("1900000109");
        let verifier = PayNotifyVerifier::new(credential, key, Arc::new(Recorder::default()));

        let notification = signed_notification(&[("result_code", "SUCCESS")], TEST_API_KEY);
        let response = verifier.handle(&post(&notification)).await;
        let reply = codec::decode(&response.body).unwrap();
        assert_eq!(reply[RETURN_CODE_KEY], "FAIL");
        assert_eq!(reply[RETURN_MSG_KEY], "sub_mch_id mismatch");
    }

    #[tokio::test]
    async fn test_sub_appid_checked_only_when_configured() {
        let notification = signed_notification(&[("result_code", "SUCCESS"), ("sub_appid", "wx_sub")], TEST_API_KEY);

        let recorder = Arc::new(Recorder::default());
        let (verifier, _) = verifier(recorder.clone());
        assert_eq!(return_code(&verifier.handle(&post(&notification)).await), "SUCCESS");
        assert_eq!(recorder.payments.lock().unwrap().len(), 1);

        let key = Arc::new(RotatingSecret::new(TEST_API_KEY.to_string()));
        let credential = test_credential().with_sub_app_id("wx_other_sub");
        let verifier = PayNotifyVerifier::new(credential, key, Arc::new(Recorder::default()));
        let response = verifier.handle(&post(&notification)).await;
        let reply = codec::decode(&response.body).unwrap();
        assert_eq!(reply[RETURN_CODE_KEY], "FAIL");
        assert_eq!(reply[RETURN_MSG_KEY], "sub_appid mismatch");
    }
}
