//! Canonical request signing.
//!
//! The gateway recomputes every signature independently, so the procedure
//! here must match it byte for byte:
//!
//! 1. take every key except `sign` whose value is non-empty
//! 2. sort keys by byte value
//! 3. join as `k1=v1&k2=v2&...&` and append `key=<secret>`
//! 4. hash with MD5, or HMAC-SHA256 keyed by the same secret
//! 5. hex-encode in upper case
//!
//! Message pushes use a different, secret-free digest over sorted strings,
//! see [`digest_sorted`].

use crate::errors::GatewayError;
use crate::params::{field, nonce_str, ParameterMap, NONCE_LEN, SIGN_KEY, SIGN_TYPE_KEY};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hash algorithm used for canonical signatures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SignAlgorithm {
    /// Plain MD5 over the canonical string.
    #[default]
    #[serde(rename = "MD5")]
    Md5,
    /// HMAC-SHA256 keyed by the shared secret.
    #[serde(rename = "HMAC-SHA256")]
    HmacSha256,
}

impl SignAlgorithm {
    /// Wire name used in `sign_type` / `signType`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::HmacSha256 => "HMAC-SHA256",
        }
    }
}

impl fmt::Display for SignAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignAlgorithm {
    type Err = GatewayError;

    /// An absent (empty) `sign_type` means MD5.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "MD5" => Ok(Self::Md5),
            "HMAC-SHA256" => Ok(Self::HmacSha256),
            other => Err(GatewayError::UnsupportedSignType(other.to_string())),
        }
    }
}

fn canonical_string(params: &ParameterMap, secret: &str) -> String {
    let mut buf = String::with_capacity(128);
    for (k, v) in params {
        if k == SIGN_KEY || v.is_empty() {
            continue;
        }
        buf.push_str(k);
        buf.push('=');
        buf.push_str(v);
        buf.push('&');
    }
    buf.push_str("key=");
    buf.push_str(secret);
    buf
}

/// Compute the canonical signature of `params`.
///
/// Never fails: missing keys are simply not part of the string.
///
/// ```
/// use gatekit_lib::params::params_from;
/// use gatekit_lib::signing::{sign, SignAlgorithm};
///
/// let params = params_from(&[("out_trade_no", "1234"), ("total_fee", "100")]);
/// let signature = sign(&params, "testkey", SignAlgorithm::Md5);
/// assert_eq!(signature, "87DA4AC5F9C679913149931BEE58903F");
/// ```
pub fn sign(params: &ParameterMap, secret: &str, algorithm: SignAlgorithm) -> String {
    let canonical = canonical_string(params, secret);
    match algorithm {
        SignAlgorithm::Md5 => hex::encode_upper(md5::compute(canonical.as_bytes()).0),
        SignAlgorithm::HmacSha256 => {
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                .expect("HMAC accepts keys of any length");
            mac.update(canonical.as_bytes());
            hex::encode_upper(mac.finalize().into_bytes())
        }
    }
}

/// Check the `sign` field of `params` against `secret`.
pub fn verify(params: &ParameterMap, secret: &str, algorithm: SignAlgorithm) -> bool {
    let have = field(params, SIGN_KEY);
    !have.is_empty() && constant_time_eq(have, &sign(params, secret, algorithm))
}

/// Algorithm declared by a received map's `sign_type` field.
pub fn response_algorithm(params: &ParameterMap) -> Result<SignAlgorithm, GatewayError> {
    field(params, SIGN_TYPE_KEY).parse()
}

/// Compare two strings without leaking the position of the first difference.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Arguments handed to the client-side payment bridge, signed as `paySign`.
///
/// The field set is fixed (`appId`, `nonceStr`, `package`, `signType`,
/// `timeStamp`); signing is the ordinary canonical procedure over it.
pub fn js_bridge_args(
    app_id: &str,
    prepay_id: &str,
    secret: &str,
    algorithm: SignAlgorithm,
) -> ParameterMap {
    let timestamp = chrono::Utc::now().timestamp().to_string();
    js_bridge_args_at(app_id, prepay_id, &nonce_str(NONCE_LEN), &timestamp, secret, algorithm)
}

/// [`js_bridge_args`] with an explicit nonce and timestamp.
pub fn js_bridge_args_at(
    app_id: &str,
    prepay_id: &str,
    nonce: &str,
    timestamp: &str,
    secret: &str,
    algorithm: SignAlgorithm,
) -> ParameterMap {
    let mut args = ParameterMap::new();
    args.insert("appId".into(), app_id.into());
    args.insert("timeStamp".into(), timestamp.into());
    args.insert("nonceStr".into(), nonce.into());
    args.insert("package".into(), format!("prepay_id={prepay_id}"));
    args.insert("signType".into(), algorithm.as_str().into());
    let pay_sign = sign(&args, secret, algorithm);
    args.insert("paySign".into(), pay_sign);
    args
}

/// SHA-1 over the sorted, directly concatenated `parts`, lowercase hex.
///
/// Push `signature` is `digest_sorted(&[token, timestamp, nonce])`;
/// `msg_signature` adds the base64 ciphertext as a fourth part.
pub fn digest_sorted(parts: &[&str]) -> String {
    let mut sorted = parts.to_vec();
    sorted.sort_unstable();
    let mut hasher = Sha1::new();
    for part in sorted {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Page signature for client-side SDK configuration, derived from the ticket.
pub fn page_signature(ticket: &str, noncestr: &str, timestamp: &str, url: &str) -> String {
    let mut pairs = [
        format!("jsapi_ticket={ticket}"),
        format!("noncestr={noncestr}"),
        format!("timestamp={timestamp}"),
        format!("url={url}"),
    ];
    pairs.sort_unstable();
    hex::encode(Sha1::digest(pairs.join("&").as_bytes()))
}
