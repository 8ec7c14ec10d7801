//! Test utilities for gateway integrations.
//!
//! - Fixture identities and keys
//! - Builders for signed responses, refund payloads and encrypted pushes
//! - An in-memory [`TokenSource`](crate::token::TokenSource) that counts fetches
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gatekit_lib::test_utils::{signed_response, TEST_API_KEY};
//!
//! let body = signed_response(&[("result_code", "SUCCESS")], TEST_API_KEY);
//! ```

mod fixtures;
mod token_source;

pub use fixtures::{
    encrypt_refund_info, seal_push, signed_notification, signed_response, signed_response_with,
    test_aes_key, test_credential, TEST_ACCOUNT_ID, TEST_AES_KEY, TEST_API_KEY, TEST_APP_ID,
    TEST_MCH_ID, TEST_PUSH_TOKEN,
};

pub use token_source::CountingTokenSource;
