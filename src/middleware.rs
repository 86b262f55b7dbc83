use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::auth::token_fingerprint;
use crate::error::ApiError;
use crate::metrics::{REQUEST_LATENCY, REQUEST_TOTAL};
use crate::rate_limit::{Decision, RateLimiter};
use crate::state::AppState;

/// Caller address used as the rate limit key.
///
/// The socket peer, unless the service runs with `--trust-proxy`, in which
/// case `X-Forwarded-For` then `X-Real-IP` win. Requests without any address
/// share the `unknown` bucket.
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

impl FromRequestParts<Arc<AppState>> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        Ok(ClientIp(client_ip(&parts.headers, peer, state.trust_proxy)))
    }
}

fn client_ip(headers: &HeaderMap, peer: Option<String>, trust_proxy: bool) -> String {
    let forwarded = || {
        let forwarded_for = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        forwarded_for.or(real_ip).map(str::to_string)
    };

    trust_proxy
        .then(forwarded)
        .flatten()
        .or(peer)
        .unwrap_or_else(|| "unknown".to_string())
}

/// Runs one limiter, turning a rejection into a 429.
pub fn enforce(limiter: &RateLimiter, key: &str) -> Result<Decision, ApiError> {
    match limiter.check(key) {
        Decision::Rejected {
            limit,
            retry_after_secs,
        } => {
            warn!(
                limiter = limiter.name(),
                key,
                retry_after = retry_after_secs,
                "rate limit exceeded"
            );
            Err(ApiError::RateLimited {
                limiter: limiter.name(),
                message: limiter.message(),
                limit,
                retry_after: retry_after_secs,
            })
        }
        admitted => Ok(admitted),
    }
}

// Global limiter (per IP) and, when a key is presented, the API key limiter
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    req: Request,
    next: Next,
) -> Response {
    REQUEST_TOTAL.inc();
    let start_time = Instant::now();
    let method = req.method().to_string();

    let response = match admit(&state, &ip, req.headers()) {
        Ok(decision) => {
            let mut response = next.run(req).await;
            if let Decision::Admitted {
                limit,
                remaining,
                reset_after_secs,
            } = decision
            {
                if state.limiters.global.is_enabled() {
                    let headers = response.headers_mut();
                    headers.insert("ratelimit-limit", HeaderValue::from(limit));
                    headers.insert("ratelimit-remaining", HeaderValue::from(remaining));
                    headers.insert("ratelimit-reset", HeaderValue::from(reset_after_secs));
                }
            }
            response
        }
        Err(e) => e.into_response(),
    };

    REQUEST_LATENCY
        .with_label_values(&[method.as_str(), response.status().as_str()])
        .observe(start_time.elapsed().as_secs_f64());

    response
}

fn admit(state: &AppState, ip: &str, headers: &HeaderMap) -> Result<Decision, ApiError> {
    let decision = enforce(&state.limiters.global, ip)?;
    if let Some(api_key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        enforce(
            &state.limiters.api,
            &format!("api:{}", token_fingerprint(api_key)),
        )?;
    }
    Ok(decision)
}
