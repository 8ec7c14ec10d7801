//! In-memory token source.

use crate::errors::GatewayError;
use crate::token::{Grant, TokenSource};
use crate::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Token source that hands out `token-<n>` and `ticket-<n>-for-<token>`
/// and counts every fetch, failed ones included.
pub struct CountingTokenSource {
    token_calls: AtomicUsize,
    ticket_calls: AtomicUsize,
    token_lifetime: i64,
    ticket_lifetime: i64,
    delay: Option<Duration>,
    fail_tokens: AtomicBool,
    fail_tickets: AtomicBool,
}

impl CountingTokenSource {
    /// Create a source whose grants declare `lifetime` seconds.
    pub fn new(lifetime: i64) -> Self {
        Self {
            token_calls: AtomicUsize::new(0),
            ticket_calls: AtomicUsize::new(0),
            token_lifetime: lifetime,
            ticket_lifetime: lifetime,
            delay: None,
            fail_tokens: AtomicBool::new(false),
            fail_tickets: AtomicBool::new(false),
        }
    }

    /// Declare a different lifetime for tickets.
    pub fn with_ticket_lifetime(mut self, lifetime: i64) -> Self {
        self.ticket_lifetime = lifetime;
        self
    }

    /// Sleep this long inside every token fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make token fetches fail.
    pub fn fail_tokens(&self, fail: bool) {
        self.fail_tokens.store(fail, Ordering::SeqCst);
    }

    /// Make ticket fetches fail.
    pub fn fail_tickets(&self, fail: bool) {
        self.fail_tickets.store(fail, Ordering::SeqCst);
    }

    /// Number of token fetches so far.
    pub fn token_calls(&self) -> usize {
        self.token_calls.load(Ordering::SeqCst)
    }

    /// Number of ticket fetches so far.
    pub fn ticket_calls(&self) -> usize {
        self.ticket_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for CountingTokenSource {
    async fn fetch_token(&self) -> Result<Grant> {
        let n = self.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_tokens.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("token endpoint unavailable".into()));
        }
        Ok(Grant {
            value: format!("token-{n}"),
            expires_in: self.token_lifetime,
        })
    }

    async fn fetch_ticket(&self, access_token: &str) -> Result<Grant> {
        let n = self.ticket_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_tickets.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("ticket endpoint unavailable".into()));
        }
        Ok(Grant {
            value: format!("ticket-{n}-for-{access_token}"),
            expires_in: self.ticket_lifetime,
        })
    }
}
