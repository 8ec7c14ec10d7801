//! Transport-neutral view of an inbound HTTP exchange.
//!
//! The verifiers never touch a web framework; the embedding server copies the
//! method, decoded query string and raw body into a [`NotifyRequest`] and
//! writes the returned [`NotifyResponse`] back verbatim.

use gatekit_lib::params::{field, ParameterMap};
use std::fmt;

/// HTTP method of an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    /// Health check.
    Head,
    /// Health check or URL handshake.
    Get,
    /// Notification or message delivery.
    Post,
    /// Anything else, upper-cased. Always rejected.
    Other(String),
}

impl Method {
    /// Map a method name as it appears on the request line.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "HEAD" => Self::Head,
            "GET" => Self::Get,
            "POST" => Self::Post,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Head => f.write_str("HEAD"),
            Self::Get => f.write_str("GET"),
            Self::Post => f.write_str("POST"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// An inbound request.
#[derive(Debug, Clone)]
pub struct NotifyRequest {
    /// Request method.
    pub method: Method,
    /// Decoded query string parameters.
    pub query: ParameterMap,
    /// Raw request body, as received.
    pub body: Vec<u8>,
}

impl NotifyRequest {
    /// Create a request.
    pub fn new(method: Method, query: ParameterMap, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method,
            query,
            body: body.into(),
        }
    }

    /// A `POST` carrying `body`.
    pub fn post(query: ParameterMap, body: impl Into<Vec<u8>>) -> Self {
        Self::new(Method::Post, query, body)
    }

    /// A bodiless `GET`.
    pub fn get(query: ParameterMap) -> Self {
        Self::new(Method::Get, query, Vec::new())
    }

    /// Query parameter `key`, or `""`.
    pub fn query(&self, key: &str) -> &str {
        field(&self.query, key)
    }
}

/// Reply to write back to the caller.
///
/// Rejections are still answered with status 200 and a `FAIL` envelope,
/// which is what the gateway expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyResponse {
    /// HTTP status code.
    pub status: u16,
    /// Value for the `Content-Type` header.
    pub content_type: &'static str,
    /// Response body.
    pub body: Vec<u8>,
}

impl NotifyResponse {
    /// An XML reply.
    pub fn xml(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: "text/xml; charset=utf-8",
            body,
        }
    }

    /// A plain-text reply.
    pub fn text(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
        }
    }

    /// An empty 200 reply.
    pub fn empty() -> Self {
        Self::text(Vec::new())
    }
}
