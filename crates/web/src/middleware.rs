//! HTTP middleware: security headers, request ids, per-client rate
//! limiting and the optional IP allowlist.

use axum::{
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::auth::ClientIp;
use crate::server::AppState;

pub const X_REQUEST_ID: &str = "x-request-id";

const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; \
     img-src 'self' data:; font-src 'self'; connect-src 'self'; frame-ancestors 'none'";

/// Paths exempt from rate limiting
const RATE_LIMIT_EXEMPT: &[&str] = &["/api/health"];

// ============================================================================
// Security headers
// ============================================================================

pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::X_XSS_PROTECTION, HeaderValue::from_static("1; mode=block"));
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(CONTENT_SECURITY_POLICY),
    );
    headers.remove(header::SERVER);
    response
}

// ============================================================================
// Request id
// ============================================================================

/// Accept a sane incoming id, otherwise mint one; echo it on the response.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| is_valid_request_id(v))
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

    let value = HeaderValue::from_str(&id).unwrap_or_else(|_| HeaderValue::from_static("invalid"));
    request.headers_mut().insert(HeaderName::from_static(X_REQUEST_ID), value.clone());
    let mut response = next.run(request).await;
    response.headers_mut().insert(HeaderName::from_static(X_REQUEST_ID), value);
    response
}

fn is_valid_request_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// ============================================================================
// Rate limiting
// ============================================================================

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: u64 },
}

/// Sliding-window request counter per client key
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        let mut hits = self.hits.lock();
        let queue = hits.entry(key.to_string()).or_default();
        while queue.front().is_some_and(|t| now.duration_since(*t) >= self.window) {
            queue.pop_front();
        }
        if queue.len() as u32 >= self.limit {
            let oldest = queue.front().copied().unwrap_or(now);
            let wait = self.window.saturating_sub(now.duration_since(oldest));
            return RateDecision::Limited {
                retry_after: wait.as_secs().max(1),
            };
        }
        queue.push_back(now);
        RateDecision::Allowed {
            remaining: self.limit - queue.len() as u32,
        }
    }

    /// Forget clients with no hits inside the window
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut hits = self.hits.lock();
        let before = hits.len();
        hits.retain(|_, q| q.back().is_some_and(|t| now.duration_since(*t) < self.window));
        before - hits.len()
    }
}

pub async fn rate_limit(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    if RATE_LIMIT_EXEMPT.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let ClientIp(ip) = ClientIp::from_parts(&parts);
    let request = Request::from_parts(parts, body);

    let limiter = &state.rate_limiter;
    let reset = chrono::Utc::now().timestamp() + limiter.window().as_secs() as i64;
    match limiter.check(&ip) {
        RateDecision::Limited { retry_after } => {
            debug!("Rate limited {}", ip);
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({
                    "detail": "Too many requests. Please try again later.",
                    "retry_after": retry_after,
                })),
            )
                .into_response();
            let headers = response.headers_mut();
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
            headers.insert(HeaderName::from_static("x-ratelimit-limit"), HeaderValue::from(limiter.limit()));
            headers.insert(HeaderName::from_static("x-ratelimit-remaining"), HeaderValue::from(0u32));
            response
        }
        RateDecision::Allowed { remaining } => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert(HeaderName::from_static("x-ratelimit-limit"), HeaderValue::from(limiter.limit()));
            headers.insert(HeaderName::from_static("x-ratelimit-remaining"), HeaderValue::from(remaining));
            headers.insert(HeaderName::from_static("x-ratelimit-reset"), HeaderValue::from(reset));
            response
        }
    }
}

// ============================================================================
// IP allowlist
// ============================================================================

/// Parse allowlist entries; bare addresses become single-host networks.
pub fn parse_allowlist(entries: &[String]) -> Result<Vec<IpNetwork>, String> {
    entries
        .iter()
        .map(|e| {
            let e = e.trim();
            e.parse::<IpNetwork>()
                .or_else(|_| e.parse::<IpAddr>().map(IpNetwork::from))
                .map_err(|err| format!("invalid allowlist entry '{}': {}", e, err))
        })
        .collect()
}

/// Reject clients outside `server.ip_allowlist`; an empty list allows all.
pub async fn ip_allowlist(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    if state.allowlist.is_empty() {
        return next.run(request).await;
    }
    let (parts, body) = request.into_parts();
    let ClientIp(ip) = ClientIp::from_parts(&parts);
    let allowed = ip
        .parse::<IpAddr>()
        .map(|addr| state.allowlist.iter().any(|net| net.contains(addr)))
        .unwrap_or(false);
    if !allowed {
        warn!("Rejected request from {} (not in allowlist)", ip);
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "detail": "Access denied" })),
        )
            .into_response();
    }
    next.run(Request::from_parts(parts, body)).await
}
