//! Flat string parameter maps exchanged with the gateway.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeMap;

/// Field name to string value, used for every outbound request and every
/// inbound response or push.
///
/// `BTreeMap<String, _>` iterates in byte-wise key order, which is exactly the
/// order canonical signing needs.
pub type ParameterMap = BTreeMap<String, String>;

/// Reserved signature field. Present on the wire, excluded from signing.
pub const SIGN_KEY: &str = "sign";

/// Field declaring which algorithm produced `sign`.
pub const SIGN_TYPE_KEY: &str = "sign_type";

/// Field carrying the per-request random string.
pub const NONCE_KEY: &str = "nonce_str";

/// Outer status field of every envelope.
pub const RETURN_CODE_KEY: &str = "return_code";

/// Outer status message.
pub const RETURN_MSG_KEY: &str = "return_msg";

/// Inner business status field.
pub const RESULT_CODE_KEY: &str = "result_code";

/// Status value for success, both outer and inner.
pub const STATUS_SUCCESS: &str = "SUCCESS";

/// Status value for failure, both outer and inner.
pub const STATUS_FAIL: &str = "FAIL";

/// Default nonce length for outbound requests.
pub const NONCE_LEN: usize = 32;

/// Generate a random alphanumeric nonce of `len` characters.
pub fn nonce_str(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Build a [`ParameterMap`] from borrowed pairs.
///
/// ```
/// use gatekit_lib::params::params_from;
///
/// let params = params_from(&[("out_trade_no", "1234"), ("total_fee", "100")]);
/// assert_eq!(params["total_fee"], "100");
/// ```
pub fn params_from(pairs: &[(&str, &str)]) -> ParameterMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Value of `key`, or the empty string when absent.
pub fn field<'a>(params: &'a ParameterMap, key: &str) -> &'a str {
    params.get(key).map(String::as_str).unwrap_or("")
}
