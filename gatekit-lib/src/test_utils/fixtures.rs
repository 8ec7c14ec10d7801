//! Fixture identities and payload builders.

use crate::codec;
use crate::crypto::{self, AesKey};
use crate::dispatch::Credential;
use crate::params::{nonce_str, ParameterMap, NONCE_KEY, SIGN_KEY, SIGN_TYPE_KEY};
use crate::signing::{self, SignAlgorithm};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncryptMut, KeyInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Application id of the fixture merchant.
pub const TEST_APP_ID: &str = "wx_test_app";

/// Merchant id of the fixture merchant.
pub const TEST_MCH_ID: &str = "10000100";

/// API key of the fixture merchant.
pub const TEST_API_KEY: &str = "192006250b4c09247ec02edce69f6a2d";

/// Push signature token.
pub const TEST_PUSH_TOKEN: &str = "testtoken";

/// Original id of the fixture account (`ToUserName` of pushes).
pub const TEST_ACCOUNT_ID: &str = "gh_test_account";

/// Encoded push AES key (decodes to `abcdefghijklmnopqrstuvwxyz012345`).
pub const TEST_AES_KEY: &str = "YWJjZGVmZ2hpamtsbW5vcHFyc3R1dnd4eXowMTIzNDU";

/// Credential of the fixture merchant.
pub fn test_credential() -> Credential {
    Credential::new(TEST_APP_ID, TEST_MCH_ID)
}

/// The decoded [`TEST_AES_KEY`].
pub fn test_aes_key() -> AesKey {
    AesKey::new(*b"abcdefghijklmnopqrstuvwxyz012345")
}

fn base_fields(pairs: &[(&str, &str)]) -> ParameterMap {
    let mut params = ParameterMap::new();
    params.insert("return_code".into(), "SUCCESS".into());
    params.insert("appid".into(), TEST_APP_ID.into());
    params.insert("mch_id".into(), TEST_MCH_ID.into());
    params.insert(NONCE_KEY.into(), nonce_str(16));
    for (k, v) in pairs {
        params.insert(k.to_string(), v.to_string());
    }
    params
}

/// A signed map carrying the fixture identity plus `pairs`, signed with MD5.
pub fn signed_notification(pairs: &[(&str, &str)], api_key: &str) -> ParameterMap {
    let mut params = base_fields(pairs);
    let signature = signing::sign(&params, api_key, SignAlgorithm::Md5);
    params.insert(SIGN_KEY.into(), signature);
    params
}

/// Encoded [`signed_notification`], as the gateway would answer a call.
pub fn signed_response(pairs: &[(&str, &str)], api_key: &str) -> Vec<u8> {
    codec::encode(&signed_notification(pairs, api_key))
}

/// Like [`signed_response`] with an explicit algorithm declared in `sign_type`.
pub fn signed_response_with(pairs: &[(&str, &str)], api_key: &str, algorithm: SignAlgorithm) -> Vec<u8> {
    let mut params = base_fields(pairs);
    params.insert(SIGN_TYPE_KEY.into(), algorithm.as_str().into());
    let signature = signing::sign(&params, api_key, algorithm);
    params.insert(SIGN_KEY.into(), signature);
    codec::encode(&params)
}

/// Build a refund `req_info` value the way the gateway does.
pub fn encrypt_refund_info(info: &ParameterMap, api_key: &str) -> String {
    let mut plaintext = codec::encode(info);
    let len = plaintext.len();
    plaintext.resize(len + 16, 0);

    let key = format!("{:x}", md5::compute(api_key.as_bytes()));
    let cipher = ecb::Encryptor::<aes::Aes256>::new(GenericArray::from_slice(key.as_bytes()));
    match cipher.encrypt_padded_mut::<Pkcs7>(&mut plaintext, len) {
        Ok(ciphertext) => STANDARD.encode(ciphertext),
        Err(_) => unreachable!("buffer has room for a full padding block"),
    }
}

/// Encrypt `plaintext` as a push envelope and return it base64-encoded.
pub fn seal_push(plaintext: &[u8], app_id: &str, key: &AesKey) -> String {
    let nonce = crypto::random_nonce();
    STANDARD.encode(crypto::encrypt(&nonce, plaintext, app_id.as_bytes(), key))
}
