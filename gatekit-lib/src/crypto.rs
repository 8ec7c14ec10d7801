//! Callback envelope encryption.
//!
//! # Wire Format
//!
//! Before encryption a push is framed as
//!
//! ```text
//! [16 bytes nonce][4 bytes BE payload length][payload][identity][pad]
//! ```
//!
//! and padded to a multiple of 32 bytes with `n` copies of the byte `n`
//! (1..=32, a full block when already aligned). The frame is encrypted with
//! AES-256-CBC; the IV is the first 16 bytes of the key. Both properties are
//! fixed by the remote party.
//!
//! Every failure on the way back is reported as [`GatewayError::Decrypt`] so
//! the verifier can fall back to the previous key uniformly.

use crate::codec;
use crate::errors::GatewayError;
use crate::params::ParameterMap;
use crate::Result;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::Aes256;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256EcbDec = ecb::Decryptor<Aes256>;

/// Padding granularity of the envelope (not the AES block size).
pub const ENVELOPE_BLOCK: usize = 32;

/// Size of the random nonce that opens every frame.
pub const NONCE_SIZE: usize = 16;

const AES_BLOCK: usize = 16;
const FRAME_HEADER: usize = NONCE_SIZE + 4;
const ENCODED_KEY_LEN: usize = 43;

/// A 256-bit envelope key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AesKey([u8; 32]);

impl AesKey {
    /// Wrap raw key bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse the 43-character base64 form distributed by the gateway.
    ///
    /// The trailing `=` is implied and appended before decoding.
    pub fn from_encoded(encoded: &str) -> Result<Self> {
        if encoded.len() != ENCODED_KEY_LEN {
            return Err(GatewayError::invalid_config(
                "aes_key",
                format!("expected {ENCODED_KEY_LEN} characters, got {}", encoded.len()),
            ));
        }
        let mut decoded = STANDARD
            .decode(format!("{encoded}="))
            .map_err(|e| GatewayError::invalid_config("aes_key", e.to_string()))?;
        if decoded.len() != 32 {
            decoded.zeroize();
            return Err(GatewayError::invalid_config("aes_key", "key must decode to 32 bytes"));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self(bytes))
    }

    /// The 43-character base64 form.
    pub fn to_encoded(&self) -> String {
        let mut encoded = STANDARD.encode(self.0);
        encoded.pop();
        encoded
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn key(&self) -> &GenericArray<u8, aes::cipher::consts::U32> {
        GenericArray::from_slice(&self.0)
    }

    fn iv(&self) -> &GenericArray<u8, aes::cipher::consts::U16> {
        GenericArray::from_slice(&self.0[..AES_BLOCK])
    }
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(..)")
    }
}

/// The parts recovered from an encrypted envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecryptedMessage {
    /// Nonce chosen by the sender; echoed in the encrypted reply.
    pub nonce: [u8; NONCE_SIZE],
    /// The enclosed message.
    pub payload: Vec<u8>,
    /// Identity of the account the message belongs to.
    pub identity: Vec<u8>,
}

/// Fresh random nonce for an outbound envelope.
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce);
    nonce
}

/// Frame, pad and encrypt `plaintext`.
pub fn encrypt(nonce: &[u8; NONCE_SIZE], plaintext: &[u8], identity: &[u8], key: &AesKey) -> Vec<u8> {
    let framed = FRAME_HEADER + plaintext.len() + identity.len();
    let pad = ENVELOPE_BLOCK - framed % ENVELOPE_BLOCK;

    let mut text = Vec::with_capacity(framed + pad);
    text.extend_from_slice(nonce);
    text.extend_from_slice(&(plaintext.len() as u32).to_be_bytes());
    text.extend_from_slice(plaintext);
    text.extend_from_slice(identity);
    text.resize(framed + pad, pad as u8);

    let mut cipher = Aes256CbcEnc::new(key.key(), key.iv());
    for block in text.chunks_exact_mut(AES_BLOCK) {
        cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
    text
}

/// Decrypt and unframe an envelope produced by [`encrypt`].
pub fn decrypt(ciphertext: &[u8], key: &AesKey) -> Result<DecryptedMessage> {
    if ciphertext.len() < ENVELOPE_BLOCK || ciphertext.len() % ENVELOPE_BLOCK != 0 {
        return Err(GatewayError::Decrypt(format!(
            "ciphertext length {} is not a positive multiple of {ENVELOPE_BLOCK}",
            ciphertext.len()
        )));
    }

    let mut text = ciphertext.to_vec();
    let mut cipher = Aes256CbcDec::new(key.key(), key.iv());
    for block in text.chunks_exact_mut(AES_BLOCK) {
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }

    let pad = usize::from(text.last().copied().unwrap_or(0));
    if !(1..=ENVELOPE_BLOCK).contains(&pad) {
        return Err(GatewayError::Decrypt(format!("incorrect pad count: {pad}")));
    }
    text.truncate(text.len() - pad);

    if text.len() < FRAME_HEADER {
        return Err(GatewayError::Decrypt(format!("frame too short: {}", text.len())));
    }
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&text[..NONCE_SIZE]);
    let declared = u32::from_be_bytes([text[16], text[17], text[18], text[19]]) as usize;

    // The identity trailer must be non-empty.
    let payload_end = FRAME_HEADER.saturating_add(declared);
    if text.len() <= payload_end {
        return Err(GatewayError::Decrypt(format!("incorrect payload length: {declared}")));
    }

    Ok(DecryptedMessage {
        nonce,
        payload: text[FRAME_HEADER..payload_end].to_vec(),
        identity: text[payload_end..].to_vec(),
    })
}

/// Decrypt the `req_info` field of a refund notification.
///
/// The field is base64 AES-256-ECB with PKCS#7 padding, keyed by the
/// lowercase hex MD5 of the API key; the plaintext is a flat envelope.
pub fn decrypt_refund_info(req_info: &str, api_key: &str) -> Result<ParameterMap> {
    let mut data = STANDARD
        .decode(req_info)
        .map_err(|e| GatewayError::Decrypt(format!("req_info is not base64: {e}")))?;
    let key = format!("{:x}", md5::compute(api_key.as_bytes()));

    let cipher = Aes256EcbDec::new(GenericArray::from_slice(key.as_bytes()));
    let plaintext = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut data)
        .map_err(|_| GatewayError::Decrypt("req_info padding is invalid".into()))?;
    codec::decode(plaintext)
}
