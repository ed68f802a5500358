//! Admission middleware.
//!
//! Callers presenting an API token are limited by the token limiter using the
//! token's own policy, and never by IP. Callers without a token are limited
//! by the IP limiter using its default policy. No state is kept here between
//! requests; it all lives in the limiters and their event store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error, instrument, warn};

use crate::config::TokenPolicies;
use crate::error::LimitError;
use crate::ratelimit::{LimitOptions, RateLimiterBackend};

/// Header carrying the caller's API token.
pub const TOKEN_HEADER: &str = "api_key";
/// Header carrying the client address as seen by upstream proxies.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// A token was presented but has no registered policy.
    TokenNotFound,
    /// The limiter failed or timed out; the request's fate is unknown.
    LimiterFailure,
    /// The caller is over its limit.
    RateExceeded,
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::TokenNotFound => StatusCode::UNAUTHORIZED,
            Rejection::LimiterFailure => StatusCode::INTERNAL_SERVER_ERROR,
            Rejection::RateExceeded => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    pub fn body(&self) -> &'static str {
        match self {
            Rejection::TokenNotFound => "token not found",
            Rejection::LimiterFailure => "error when executing the RateLimiter",
            Rejection::RateExceeded => concat!(
                "you have reached the maximum number of requests or actions ",
                "allowed within a certain time frame"
            ),
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.status(), self.body()).into_response()
    }
}

/// Result of an admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Allow,
    Reject(Rejection),
}

/// Who is asking, as far as rate limiting is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Non-empty API token, if one was presented.
    pub token: Option<String>,
    /// Forwarded client address, else the peer address.
    pub ip: String,
}

impl CallerIdentity {
    /// Extract the caller from request headers and the peer address.
    pub fn from_parts(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        let token = headers
            .get(TOKEN_HEADER)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).trim().to_string())
            .filter(|t| !t.is_empty());

        let ip = headers
            .get(FORWARDED_FOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string());

        Self { token, ip }
    }

    pub fn from_request(request: &Request) -> Self {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Self::from_parts(request.headers(), peer)
    }
}

/// Combines a token-scoped and an IP-scoped limiter into one decision.
pub struct AdmissionGate {
    token_limiter: Arc<dyn RateLimiterBackend>,
    ip_limiter: Arc<dyn RateLimiterBackend>,
    tokens: Arc<TokenPolicies>,
    timeout: Duration,
}

impl AdmissionGate {
    pub fn new(
        token_limiter: Arc<dyn RateLimiterBackend>,
        ip_limiter: Arc<dyn RateLimiterBackend>,
        tokens: Arc<TokenPolicies>,
    ) -> Self {
        Self {
            token_limiter,
            ip_limiter,
            tokens,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bound every limiter call by `timeout`. An elapsed check counts as a limiter failure.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Decide whether the caller may proceed.
    #[instrument(
        skip(self, caller),
        fields(ip = %caller.ip, has_token = caller.token.is_some())
    )]
    pub async fn decide(&self, caller: &CallerIdentity) -> Outcome {
        match caller.token.as_deref() {
            Some(token) => {
                let Some(options) = self.tokens.get(token) else {
                    error!("Token not found in policy table");
                    return Outcome::Reject(Rejection::TokenNotFound);
                };
                let result = self.check(self.token_limiter.as_ref(), token, Some(options)).await;
                Self::outcome("token", result)
            }
            None => {
                let result = self.check(self.ip_limiter.as_ref(), &caller.ip, None).await;
                Self::outcome("ip", result)
            }
        }
    }

    async fn check(
        &self,
        limiter: &dyn RateLimiterBackend,
        identity: &str,
        options: Option<&LimitOptions>,
    ) -> Result<bool, LimitError> {
        tokio::time::timeout(self.timeout, limiter.limit(identity, options))
            .await
            .map_err(|_| LimitError::Timeout(self.timeout))?
    }

    fn outcome(scope: &'static str, result: Result<bool, LimitError>) -> Outcome {
        match result {
            Ok(false) => {
                debug!(scope, "Request admitted");
                Outcome::Allow
            }
            Ok(true) => {
                warn!(scope, "Caller reached the request limit for the window");
                Outcome::Reject(Rejection::RateExceeded)
            }
            Err(e) => {
                error!(scope, error = %e, "Error when executing the rate limiter");
                Outcome::Reject(Rejection::LimiterFailure)
            }
        }
    }
}

/// axum middleware running every request through the [`AdmissionGate`].
pub async fn admission_middleware(
    State(gate): State<Arc<AdmissionGate>>,
    request: Request,
    next: Next,
) -> Response {
    let caller = CallerIdentity::from_request(&request);
    match gate.decide(&caller).await {
        Outcome::Allow => next.run(request).await,
        Outcome::Reject(rejection) => rejection.into_response(),
    }
}
