//! Request logging middleware.
//!
//! One line per request with method, path, status and latency. Money routes
//! log at INFO even on success so the request trail lines up with ledger logs.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::Request,
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, warn, Instrument};

pub async fn request_logging(
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    // Health checks are polled constantly.
    if path == "/health" {
        return next.run(request).await;
    }

    let client_ip = connect
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "-".to_string());
    let span = tracing::info_span!(
        "http_request",
        method = %method,
        path = %path,
        client_ip = %client_ip,
    );

    let start = Instant::now();
    let response = next.run(request).instrument(span).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    if status >= 500 {
        warn!(%method, %path, status, latency_ms, %client_ip, "Request failed (5xx)");
    } else if status >= 400 {
        info!(%method, %path, status, latency_ms, %client_ip, "Request rejected (4xx)");
    } else if method == axum::http::Method::GET {
        debug!(%method, %path, status, latency_ms, "Request completed");
    } else {
        info!(%method, %path, status, latency_ms, "Request completed");
    }

    response
}
