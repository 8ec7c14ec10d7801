//! Reply envelopes.

use crate::request::NotifyResponse;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use gatekit_lib::crypto::{self, AesKey, NONCE_SIZE};
use gatekit_lib::params::{ParameterMap, RETURN_CODE_KEY, RETURN_MSG_KEY, STATUS_FAIL, STATUS_SUCCESS};
use gatekit_lib::{codec, signing};

fn envelope(code: &str, message: &str) -> NotifyResponse {
    let mut params = ParameterMap::new();
    params.insert(RETURN_CODE_KEY.into(), code.into());
    params.insert(RETURN_MSG_KEY.into(), message.into());
    NotifyResponse::xml(codec::encode(&params))
}

/// `{return_code: SUCCESS, return_msg: OK}`.
pub fn success() -> NotifyResponse {
    envelope(STATUS_SUCCESS, "OK")
}

/// `{return_code: FAIL, return_msg: message}`.
pub fn failure(message: &str) -> NotifyResponse {
    envelope(STATUS_FAIL, message)
}

/// Secrets and echo values for answering an encrypted push.
pub(crate) struct ReplySeal<'a> {
    pub token: &'a str,
    pub key: &'a AesKey,
    pub nonce: [u8; NONCE_SIZE],
    pub identity: &'a [u8],
    pub timestamp: &'a str,
    pub query_nonce: &'a str,
}

/// Encrypt `plaintext` and wrap it as
/// `{Encrypt, MsgSignature, TimeStamp, Nonce}`.
pub(crate) fn sealed(plaintext: &[u8], seal: &ReplySeal<'_>) -> NotifyResponse {
    let ciphertext = STANDARD.encode(crypto::encrypt(&seal.nonce, plaintext, seal.identity, seal.key));
    let signature = signing::digest_sorted(&[seal.token, seal.timestamp, seal.query_nonce, &ciphertext]);

    let mut params = ParameterMap::new();
    params.insert("Encrypt".into(), ciphertext);
    params.insert("MsgSignature".into(), signature);
    params.insert("TimeStamp".into(), seal.timestamp.into());
    params.insert("Nonce".into(), seal.query_nonce.into());
    NotifyResponse::xml(codec::encode(&params))
}
