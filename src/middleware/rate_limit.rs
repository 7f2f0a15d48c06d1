use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{Response as HttpResponse, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_governor::{governor::GovernorConfigBuilder, GovernorError, GovernorLayer};

/// Type alias for the IP-keyed governor layers
pub type IpGovernorLayer = GovernorLayer<
    tower_governor::key_extractor::PeerIpKeyExtractor,
    governor::middleware::NoOpMiddleware<governor::clock::QuantaInstant>,
    Body,
>;

/// Create a GovernorLayer for global rate limiting (per IP address)
/// - 1000 requests per minute (one token every 60ms)
/// - Applied before authentication to protect against DDoS
pub fn create_global_governor() -> IpGovernorLayer {
    let config = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond(60) // One token every 60ms (1000 per minute)
            .burst_size(1000)    // Max capacity of the "window"
            .finish()
            .expect("global governor config is valid"),
    );

    GovernorLayer::new(config).error_handler(rate_limit_error_handler)
}

/// Per-IP limiter for unauthenticated routes (auth, socket handshake):
/// 100 requests per minute, the same budget a rider gets.
pub fn create_public_governor() -> IpGovernorLayer {
    let config = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond(600)
            .burst_size(100)
            .finish()
            .expect("public governor config is valid"),
    );

    GovernorLayer::new(config).error_handler(rate_limit_error_handler)
}

/// JSON body in the same `{error, message}` shape as `AppError`.
pub fn rate_limit_error_handler(error: GovernorError) -> HttpResponse<Body> {
    match error {
        GovernorError::TooManyRequests { wait_time, headers } => {
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "rate_limited",
                    "message": format!("Too many requests, retry in {} seconds", wait_time),
                })),
            )
                .into_response();
            if let Some(headers) = headers {
                response.headers_mut().extend(headers);
            }
            response
        }
        GovernorError::UnableToExtractKey => (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "authentication_error",
                "message": "Unable to identify client",
            })),
        )
            .into_response(),
        GovernorError::Other { code, msg, headers } => {
            let mut response = (
                code,
                Json(json!({
                    "error": "internal_error",
                    "message": msg.unwrap_or_else(|| "Rate limiter error".to_string()),
                })),
            )
                .into_response();
            if let Some(headers) = headers {
                response.headers_mut().extend(headers);
            }
            response
        }
    }
}

/// Per-request access log keyed by client IP. Throttled and failed
/// requests are raised to `warn`.
pub async fn log_request(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let client_ip = addr.ip();

    match status {
        StatusCode::TOO_MANY_REQUESTS => tracing::warn!(
            %client_ip, %method, %path, elapsed_ms,
            "Rate limited"
        ),
        s if s.is_server_error() || s.is_client_error() => tracing::warn!(
            %client_ip, %method, %path, status = s.as_u16(), elapsed_ms,
            "Request failed"
        ),
        s => tracing::debug!(
            %client_ip, %method, %path, status = s.as_u16(), elapsed_ms,
            "Request completed"
        ),
    }

    response
}
