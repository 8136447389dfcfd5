use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    /// Required for the stdio transport, whose stdout carries protocol frames
    Stderr,
}

/// Install the global fmt subscriber, filtered by `RUST_LOG` (default `info`)
pub fn init_logging(target: LogTarget) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false).compact();
    match target {
        LogTarget::Stdout => builder.init(),
        LogTarget::Stderr => builder.with_writer(std::io::stderr).with_ansi(false).init(),
    }
}

/// One summary line per HTTP request
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started_at = Instant::now();

    let response = next.run(request).await;

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = started_at.elapsed().as_millis(),
        "request summary"
    );
    response
}
