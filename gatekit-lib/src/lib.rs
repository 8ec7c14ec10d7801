//! Gatekit protocol engine.
//!
//! Client side of a payment and messaging gateway that speaks flat, signed
//! XML envelopes:
//!
//! - **Signing**: canonical sort-concatenate-hash signatures ([`signing`])
//! - **Wire codec**: single-level `<xml>` envelopes ([`codec`])
//! - **Callback crypto**: AES-256-CBC push envelopes ([`crypto`])
//! - **Rotation**: current/previous secrets with lock-free reads ([`rotation`])
//! - **Tokens**: a single-writer access token refresher ([`token`])
//! - **Dispatch**: signed calls with one mirror failover ([`dispatch`])
//!
//! Inbound notification handling lives in the `gatekit-notify` crate.
//!
//! # Example
//!
//! ```ignore
//! use gatekit_lib::{Credential, Gateway, GatewayConfig};
//! use gatekit_lib::params::params_from;
//!
//! let config = GatewayConfig::new(Credential::new("wx2421b1c4370ec43b", "10000100"), api_key);
//! let gateway = Gateway::from_config(config)?;
//!
//! let order = gateway
//!     .dispatcher()
//!     .call("pay/orderquery", params_from(&[("out_trade_no", "1415757673")]))
//!     .await?;
//! println!("trade_state: {}", order["trade_state"]);
//! ```

pub mod api;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod params;
pub mod rotation;
pub mod signing;
pub mod token;

/// Test utilities for gateway integrations.
///
/// This module is only available with the `test-utils` feature or in test builds.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{GatewayConfig, PushConfig};
pub use crypto::AesKey;
pub use dispatch::{CallProfile, Credential, DispatchConfig, Dispatcher};
pub use engine::Gateway;
pub use errors::{GatewayError, GatewayErrorKind};
pub use params::ParameterMap;
pub use rotation::{RotatingSecret, SecretPair, Slot};
pub use signing::SignAlgorithm;
pub use token::{TokenConfig, TokenRefresher, TokenSource};

/// Common result alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
