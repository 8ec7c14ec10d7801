//! Access token and ticket lifecycle.
//!
//! A single background task owns the cached token (and, optionally, the
//! page-signing ticket derived from it). Callers never write the cache; they
//! read the latest published value from a `watch` channel, or send a request
//! over a bounded `mpsc` channel and wait on a `oneshot` reply. At most one
//! remote refresh is in flight at any time.
//!
//! ```text
//!        caller ──Request{stale, reply}──▶ actor ──fetch──▶ token endpoint
//!        caller ◀──────── watch<TokenState> ◀──┘
//! ```
//!
//! Timer-driven refreshes are scheduled at the declared lifetime minus a
//! safety margin (see [`effective_lifetime`]).

use crate::errors::GatewayError;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default token endpoint.
pub const DEFAULT_TOKEN_URL: &str = "https://api.weixin.qq.com/cgi-bin/token";

/// Default ticket endpoint.
pub const DEFAULT_TICKET_URL: &str = "https://api.weixin.qq.com/cgi-bin/ticket/getticket";

/// Longest lifetime a token endpoint may declare (one year).
pub const MAX_DECLARED_LIFETIME: i64 = 365 * 24 * 60 * 60;

/// A credential together with its server-declared lifetime in seconds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grant {
    /// Token or ticket value.
    pub value: String,
    /// Lifetime declared by the server.
    pub expires_in: i64,
}

/// Remote source of access tokens and tickets.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Obtain a new access token.
    async fn fetch_token(&self) -> Result<Grant>;

    /// Obtain a new page-signing ticket for `access_token`.
    async fn fetch_ticket(&self, access_token: &str) -> Result<Grant>;
}

/// Token endpoint settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Application identifier.
    pub app_id: String,

    /// Application secret.
    pub app_secret: String,

    /// Token endpoint URL.
    #[serde(default = "default_token_url")]
    pub token_url: String,

    /// Ticket endpoint URL.
    #[serde(default = "default_ticket_url")]
    pub ticket_url: String,

    /// Fetch a ticket alongside every token.
    #[serde(default)]
    pub needs_ticket: bool,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Refresh interval used until a lifetime has been declared.
    #[serde(default = "default_refresh_secs")]
    pub default_refresh_secs: u64,
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}

fn default_ticket_url() -> String {
    DEFAULT_TICKET_URL.to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_refresh_secs() -> u64 {
    7200
}

impl TokenConfig {
    /// Create a configuration for the default endpoints.
    pub fn new(app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            token_url: default_token_url(),
            ticket_url: default_ticket_url(),
            needs_ticket: false,
            timeout_secs: default_timeout(),
            default_refresh_secs: default_refresh_secs(),
        }
    }

    /// Set both endpoint URLs.
    pub fn with_endpoints(mut self, token_url: impl Into<String>, ticket_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self.ticket_url = ticket_url.into();
        self
    }

    /// Fetch a ticket with every token.
    pub fn with_ticket(mut self, needs_ticket: bool) -> Self {
        self.needs_ticket = needs_ticket;
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set the initial refresh interval.
    pub fn with_default_refresh(mut self, secs: u64) -> Self {
        self.default_refresh_secs = secs;
        self
    }
}

/// Shrink a declared lifetime by a margin that scales with its size.
///
/// | declared (s)   | margin |
/// |----------------|--------|
/// | > 3600         | 600    |
/// | > 1800         | 300    |
/// | > 300          | 60     |
/// | > 60           | 10     |
///
/// Anything at or below 60 seconds, or above a year, is rejected.
pub fn effective_lifetime(expires_in: i64) -> Result<Duration> {
    let margin = match expires_in {
        s if s > MAX_DECLARED_LIFETIME => return Err(GatewayError::TokenLifetime(s)),
        s if s > 3600 => 600,
        s if s > 1800 => 300,
        s if s > 300 => 60,
        s if s > 60 => 10,
        s => return Err(GatewayError::TokenLifetime(s)),
    };
    Ok(Duration::from_secs((expires_in - margin) as u64))
}

#[derive(Deserialize)]
struct GrantResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    ticket: Option<String>,
    #[serde(default)]
    expires_in: i64,
}

impl GrantResponse {
    fn into_grant(self, value: Option<String>) -> Result<Grant> {
        if self.errcode != 0 {
            return Err(GatewayError::Api {
                code: self.errcode,
                message: self.errmsg,
            });
        }
        match value {
            Some(value) if !value.is_empty() => Ok(Grant {
                value,
                expires_in: self.expires_in,
            }),
            _ => Err(GatewayError::Serialization(
                "grant response carries no credential".into(),
            )),
        }
    }
}

/// [`TokenSource`] backed by the gateway's HTTP token and ticket endpoints.
pub struct HttpTokenSource {
    config: TokenConfig,
    client: reqwest::Client,
}

impl HttpTokenSource {
    /// Create a source with its own HTTP client.
    pub fn new(config: TokenConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    async fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<GrantResponse> {
        let response = self.client.get(url).query(query).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.json::<GrantResponse>().await?)
    }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn fetch_token(&self) -> Result<Grant> {
        let response = self
            .get(
                &self.config.token_url,
                &[
                    ("grant_type", "client_credential"),
                    ("appid", self.config.app_id.as_str()),
                    ("secret", self.config.app_secret.as_str()),
                ],
            )
            .await?;
        let value = response.access_token.clone();
        response.into_grant(value)
    }

    async fn fetch_ticket(&self, access_token: &str) -> Result<Grant> {
        let response = self
            .get(
                &self.config.ticket_url,
                &[("access_token", access_token), ("type", "jsapi")],
            )
            .await?;
        let value = response.ticket.clone();
        response.into_grant(value)
    }
}

/// Cached credentials as published by the refresher.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenState {
    /// Current access token, empty until the first refresh.
    pub token: String,
    /// Current ticket, empty unless tickets are fetched.
    pub ticket: String,
    /// Expiry of the token, margin already applied.
    pub valid_until: Option<Instant>,
    /// Expiry of the ticket, capped by the token it was issued for.
    pub ticket_valid_until: Option<Instant>,
}

impl TokenState {
    fn value(&self, kind: Target) -> (&str, Option<Instant>) {
        match kind {
            Target::Token => (&self.token, self.valid_until),
            Target::Ticket => (&self.ticket, self.ticket_valid_until),
        }
    }

    // A value the caller can use instead of refreshing. With `stale` set, any
    // non-empty value other than it qualifies; otherwise it must be unexpired.
    fn reusable(&self, kind: Target, stale: Option<&str>) -> Option<String> {
        let (value, until) = self.value(kind);
        if value.is_empty() {
            return None;
        }
        let fresh = match stale {
            Some(stale) => value != stale,
            None => until.is_some_and(|until| Instant::now() < until),
        };
        fresh.then(|| value.to_owned())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Target {
    Token,
    Ticket,
}

enum Request {
    Refresh {
        kind: Target,
        stale: Option<String>,
        reply: oneshot::Sender<Result<String>>,
    },
    Shutdown,
}

/// Handle to the background token refresher.
///
/// Cheap to share behind an `Arc`; every method may be called concurrently.
pub struct TokenRefresher {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<TokenState>,
}

impl TokenRefresher {
    /// Start a refresher for the HTTP endpoints in `config`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn from_config(config: TokenConfig) -> Result<Self> {
        let needs_ticket = config.needs_ticket;
        let interval = Duration::from_secs(config.default_refresh_secs);
        let source = HttpTokenSource::new(config)?;
        Ok(Self::spawn(Arc::new(source), needs_ticket, interval))
    }

    /// Start the actor task. The first refresh runs immediately.
    pub fn spawn(source: Arc<dyn TokenSource>, needs_ticket: bool, default_interval: Duration) -> Self {
        let (requests, inbox) = mpsc::channel(1);
        let (publisher, state) = watch::channel(TokenState::default());
        let actor = RefreshActor {
            source,
            needs_ticket,
            interval: default_interval,
            ticket_interval: default_interval,
            next_refresh: Instant::now(),
            state: publisher,
        };
        tokio::spawn(actor.run(inbox));
        Self { requests, state }
    }

    /// Latest published state.
    pub fn snapshot(&self) -> TokenState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every publication.
    pub fn subscribe(&self) -> watch::Receiver<TokenState> {
        self.state.clone()
    }

    /// Current access token, refreshing first if none is cached or it expired.
    pub async fn token(&self) -> Result<String> {
        let cached = self.state.borrow().reusable(Target::Token, None);
        match cached {
            Some(token) => Ok(token),
            None => self.request(Target::Token, None).await,
        }
    }

    /// Replace a token the caller found to be rejected downstream.
    ///
    /// If the cached token already differs from `stale`, it is returned
    /// without contacting the endpoint.
    #[tracing::instrument(skip_all)]
    pub async fn refresh_token(&self, stale: &str) -> Result<String> {
        self.request(Target::Token, Some(stale.to_string())).await
    }

    /// Current ticket, fetching one first if none is cached or it expired.
    pub async fn ticket(&self) -> Result<String> {
        let cached = self.state.borrow().reusable(Target::Ticket, None);
        match cached {
            Some(ticket) => Ok(ticket),
            None => self.request(Target::Ticket, None).await,
        }
    }

    /// Replace a ticket the caller found to be stale.
    #[tracing::instrument(skip_all)]
    pub async fn refresh_ticket(&self, stale: &str) -> Result<String> {
        self.request(Target::Ticket, Some(stale.to_string())).await
    }

    /// Stop the actor. Later requests fail with [`GatewayError::RefresherStopped`].
    pub async fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown).await;
    }

    async fn request(&self, kind: Target, stale: Option<String>) -> Result<String> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request::Refresh { kind, stale, reply })
            .await
            .map_err(|_| GatewayError::RefresherStopped)?;
        response.await.map_err(|_| GatewayError::RefresherStopped)?
    }
}

struct RefreshActor {
    source: Arc<dyn TokenSource>,
    needs_ticket: bool,
    interval: Duration,
    ticket_interval: Duration,
    next_refresh: Instant,
    state: watch::Sender<TokenState>,
}

impl RefreshActor {
    async fn run(mut self, mut inbox: mpsc::Receiver<Request>) {
        loop {
            tokio::select! {
                request = inbox.recv() => match request {
                    Some(Request::Refresh { kind, stale, reply }) => {
                        let result = self.serve(kind, stale.as_deref()).await;
                        let _ = reply.send(result);
                    }
                    Some(Request::Shutdown) | None => break,
                },
                _ = tokio::time::sleep_until(self.next_refresh) => {
                    if let Err(err) = self.refresh().await {
                        warn!(error = %err, retry_in = ?self.interval, "scheduled token refresh failed");
                        self.next_refresh = Instant::now() + self.interval;
                    }
                }
            }
        }
        debug!("token refresher stopped");
    }

    async fn serve(&mut self, kind: Target, stale: Option<&str>) -> Result<String> {
        let cached = self.state.borrow().reusable(kind, stale);
        if let Some(value) = cached {
            return Ok(value);
        }

        match kind {
            Target::Token => {
                self.refresh().await?;
                Ok(self.state.borrow().token.clone())
            }
            Target::Ticket => {
                let token = self.state.borrow().reusable(Target::Token, None);
                match token {
                    Some(token) => self.refresh_ticket(&token).await?,
                    None => {
                        let token = self.refresh_token_only().await?;
                        self.refresh_ticket(&token).await?;
                    }
                }
                Ok(self.state.borrow().ticket.clone())
            }
        }
    }

    // Token, then ticket when configured. A ticket failure keeps the new token
    // and the old ticket's own expiry, and retries on the ticket's cadence.
    async fn refresh(&mut self) -> Result<()> {
        let token = self.refresh_token_only().await?;
        if self.needs_ticket {
            if let Err(err) = self.refresh_ticket(&token).await {
                let retry_at = Instant::now() + self.ticket_interval;
                warn!(error = %err, retry_in = ?self.ticket_interval, "ticket refresh failed, keeping new token");
                self.next_refresh = self.next_refresh.min(retry_at);
            }
        }
        Ok(())
    }

    async fn refresh_token_only(&mut self) -> Result<String> {
        debug!("fetching access token");
        let grant = self.source.fetch_token().await?;
        let lifetime = effective_lifetime(grant.expires_in)?;
        let now = Instant::now();

        self.interval = lifetime;
        self.next_refresh = now + lifetime;
        self.state.send_modify(|state| {
            state.token = grant.value.clone();
            state.valid_until = Some(now + lifetime);
        });
        info!(refresh_in = ?lifetime, "access token refreshed");
        Ok(grant.value)
    }

    async fn refresh_ticket(&mut self, token: &str) -> Result<()> {
        debug!("fetching ticket");
        let grant = self.source.fetch_ticket(token).await?;
        let lifetime = effective_lifetime(grant.expires_in)?;
        let now = Instant::now();

        self.interval = self.interval.min(lifetime);
        self.ticket_interval = lifetime;
        self.next_refresh = self.next_refresh.min(now + lifetime);
        self.state.send_modify(|state| {
            state.ticket = grant.value;
            state.ticket_valid_until = Some(match state.valid_until {
                Some(until) => until.min(now + lifetime),
                None => now + lifetime,
            });
        });
        info!(refresh_in = ?lifetime, "ticket refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::CountingTokenSource;

    #[test]
    fn test_margin_buckets() {
        assert_eq!(effective_lifetime(7200).unwrap(), Duration::from_secs(6600));
        assert_eq!(effective_lifetime(2000).unwrap(), Duration::from_secs(1700));
        assert_eq!(effective_lifetime(600).unwrap(), Duration::from_secs(540));
        assert_eq!(effective_lifetime(100).unwrap(), Duration::from_secs(90));
        assert!(matches!(effective_lifetime(60), Err(GatewayError::TokenLifetime(60))));
        assert!(matches!(effective_lifetime(0), Err(GatewayError::TokenLifetime(0))));
        assert!(effective_lifetime(MAX_DECLARED_LIFETIME).is_ok());
        assert!(effective_lifetime(MAX_DECLARED_LIFETIME + 1).is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config: TokenConfig =
            serde_json::from_str(r#"{"app_id": "wx1", "app_secret": "s"}"#).unwrap();
        assert_eq!(config.token_url, DEFAULT_TOKEN_URL);
        assert_eq!(config.ticket_url, DEFAULT_TICKET_URL);
        assert!(!config.needs_ticket);
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.default_refresh_secs, 7200);
    }

    #[test]
    fn test_reusable_rules() {
        let state = TokenState {
            token: "t2".into(),
            ticket: "k1".into(),
            valid_until: Some(Instant::now() + Duration::from_secs(60)),
            ticket_valid_until: None,
        };
        assert_eq!(state.reusable(Target::Token, None).as_deref(), Some("t2"));
        assert_eq!(state.reusable(Target::Token, Some("t1")).as_deref(), Some("t2"));
        assert_eq!(state.reusable(Target::Token, Some("t2")), None);
        assert_eq!(state.reusable(Target::Ticket, None), None);
        assert_eq!(state.reusable(Target::Ticket, Some("k0")).as_deref(), Some("k1"));

        let expired = TokenState {
            valid_until: None,
            ..state
        };
        assert_eq!(expired.reusable(Target::Token, None), None);
    }

    #[tokio::test]
    async fn test_token_is_cached() {
        let source = Arc::new(CountingTokenSource::new(7200));
        let refresher = TokenRefresher::spawn(source.clone(), false, Duration::from_secs(7200));

        let first = refresher.token().await.unwrap();
        let second = refresher.token().await.unwrap();
        assert_eq!(first, "token-1");
        assert_eq!(first, second);
        assert_eq!(source.token_calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_with_unknown_stale_value_skips_fetch() {
        let source = Arc::new(CountingTokenSource::new(7200));
        let refresher = TokenRefresher::spawn(source.clone(), false, Duration::from_secs(7200));
        refresher.token().await.unwrap();

        assert_eq!(refresher.refresh_token("token-0").await.unwrap(), "token-1");
        assert_eq!(source.token_calls(), 1);

        assert_eq!(refresher.refresh_token("token-1").await.unwrap(), "token-2");
        assert_eq!(source.token_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_refresh_uses_margin() {
        let source = Arc::new(CountingTokenSource::new(7200));
        let _refresher = TokenRefresher::spawn(source.clone(), false, Duration::from_secs(7200));

        tokio::time::sleep(Duration::from_secs(6599)).await;
        assert_eq!(source.token_calls(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(source.token_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_schedule() {
        let source = Arc::new(CountingTokenSource::new(7200));
        source.fail_tokens(true);
        let refresher = TokenRefresher::spawn(source.clone(), false, Duration::from_secs(100));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.token_calls(), 1);
        assert!(refresher.snapshot().token.is_empty());

        source.fail_tokens(false);
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(source.token_calls(), 2);
        assert_eq!(refresher.snapshot().token, "token-2");
    }

    #[tokio::test]
    async fn test_ticket_lifetime_caps_token() {
        let source = Arc::new(CountingTokenSource::new(7200).with_ticket_lifetime(600));
        let refresher = TokenRefresher::spawn(source.clone(), true, Duration::from_secs(7200));

        let ticket = refresher.ticket().await.unwrap();
        assert_eq!(ticket, "ticket-1-for-token-1");

        let state = refresher.snapshot();
        let remaining = state.ticket_valid_until.unwrap() - Instant::now();
        assert!(remaining <= Duration::from_secs(540));
        assert!(state.valid_until.unwrap() - Instant::now() > Duration::from_secs(6000));
        assert_eq!(source.ticket_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_scheduled_ticket_does_not_outlive_its_lifetime() {
        let source = Arc::new(CountingTokenSource::new(7200).with_ticket_lifetime(600));
        let refresher = TokenRefresher::spawn(source.clone(), true, Duration::from_secs(7200));
        assert_eq!(refresher.ticket().await.unwrap(), "ticket-1-for-token-1");

        // The scheduled refresh at 540 s renews the token but not the ticket.
        source.fail_tickets(true);
        tokio::time::sleep(Duration::from_secs(541)).await;
        assert_eq!(source.token_calls(), 2);
        assert_eq!(source.ticket_calls(), 2);

        let state = refresher.snapshot();
        assert_eq!(state.token, "token-2");
        assert_eq!(state.ticket, "ticket-1-for-token-1");
        assert!(state.ticket_valid_until.unwrap() <= Instant::now());
        assert!(refresher.ticket().await.is_err());
        assert_eq!(source.ticket_calls(), 3);

        // The retry follows the ticket's cadence, not the token's.
        source.fail_tickets(false);
        tokio::time::sleep(Duration::from_secs(540)).await;
        let state = refresher.snapshot();
        assert_ne!(state.ticket, "ticket-1-for-token-1");
        assert!(state.ticket_valid_until.unwrap() > Instant::now());
        assert_eq!(refresher.ticket().await.unwrap(), state.ticket);
    }

    #[tokio::test]
    async fn test_ticket_failure_keeps_token() {
        let source = Arc::new(CountingTokenSource::new(7200));
        source.fail_tickets(true);
        let refresher = TokenRefresher::spawn(source.clone(), true, Duration::from_secs(7200));

        assert_eq!(refresher.token().await.unwrap(), "token-1");
        assert!(refresher.ticket().await.is_err());
        assert_eq!(refresher.snapshot().token, "token-1");
    }

    #[tokio::test]
    async fn test_shutdown() {
        let source = Arc::new(CountingTokenSource::new(7200));
        let refresher = TokenRefresher::spawn(source, false, Duration::from_secs(7200));
        refresher.shutdown().await;

        assert!(matches!(
            refresher.refresh_token("x").await,
            Err(GatewayError::RefresherStopped)
        ));
    }
}
