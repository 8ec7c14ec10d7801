//! Inbound side of the gatekit protocol engine.
//!
//! Two endpoints receive traffic from the gateway:
//!
//! - **Payment notifications** ([`pay_notify`]): signed payment results and
//!   encrypted refund results, acknowledged with a status envelope.
//! - **Message pushes** ([`push`]): the URL handshake plus plaintext and
//!   AES-encrypted messages and events, routed to application handlers.
//!
//! Both verifiers share the rotating secrets of a [`gatekit_lib::Gateway`],
//! so a rotation there is seen here immediately and a notification signed
//! with the previous secret is still accepted until the new one has been
//! seen.
//!
//! # Example
//!
//! ```ignore
//! use gatekit_notify::{NotifyRequest, PushRouter, PushVerifier};
//!
//! let router = PushRouter::new().on_message("text", |msg: &ParameterMap| -> gatekit_notify::Result<_> {
//!     Ok(Some(echo(msg)))
//! });
//! let verifier = PushVerifier::from_gateway(&gateway, router);
//!
//! let response = verifier.handle(&NotifyRequest::post(query, body)).await;
//! ```

pub mod errors;
pub mod pay_notify;
pub mod push;
pub mod reply;
pub mod request;

pub use errors::{NotifyError, Result};
pub use pay_notify::{PayNotifyVerifier, PaymentHandler};
pub use push::{PushHandler, PushRouter, PushVerifier};
pub use request::{Method, NotifyRequest, NotifyResponse};
