//! Request-id propagation, access logging, security headers, and CORS —
//! the ambient middleware stack every handler runs under. There is no
//! authentication layer: this system has no notion of API-key tenants, and
//! request-level admission is already enforced inside `scheduler::queue`.

use axum::extract::Request;
use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Attach (or propagate) a request id, exposed to handlers via
/// `request.extensions()` and echoed back in the response headers.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Newtype wrapper so handlers can pull the request id out of extensions
/// without colliding with a bare `String` some other layer might insert.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Log method, path, request id, status, and duration for every request at
/// `info` level — one event per request, not per processing step.
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| "unknown".to_string());

    let response = next.run(request).await;
    let duration = start.elapsed();

    tracing::info!(
        request_id = %request_id,
        %method,
        %uri,
        status = response.status().as_u16(),
        duration_ms = duration.as_millis() as u64,
        "handled request"
    );
    response
}

/// Standard defensive response headers.
pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    response
}

/// Permissive CORS: both boundaries are consumed by the operator's own
/// infrastructure, not a public browser client, so origin/method
/// restriction adds no real boundary.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(REQUEST_ID_HEADER)])
}
