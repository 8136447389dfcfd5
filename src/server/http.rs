//! Stateless HTTP: one JSON-RPC message per POST, the reply in the response body.
//!
//! There is no session and no server-to-client channel. Every request runs against the
//! single anonymous session, and queued notifications are discarded.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::{MessageContext, Server};
use crate::{
    error::{ErrorCode, Result},
    logging,
    protocol::Message,
};

pub const DEFAULT_PATH: &str = "/mcp";

/// A failure outside JSON-RPC (unknown session, missing query parameter) rendered as
/// `{code, message, details}`
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HttpError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct HttpErrorBody {
    code: String,
    message: String,
    details: Value,
}

impl HttpError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        tracing::debug!(status = %self.status, code = self.code, message = %self.message, "http request rejected");
        (
            self.status,
            Json(HttpErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: json!({}),
            }),
        )
            .into_response()
    }
}

/// HTTP status for a JSON-RPC error code
pub fn status_for_error(code: i32) -> StatusCode {
    match ErrorCode::from(code) {
        ErrorCode::ParseError | ErrorCode::InvalidRequest | ErrorCode::InvalidParams => {
            StatusCode::BAD_REQUEST
        }
        ErrorCode::MethodNotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub struct StatelessHttpServer {
    server: Server,
    path: String,
}

impl StatelessHttpServer {
    pub fn new(server: Server) -> Self {
        Self {
            server,
            path: DEFAULT_PATH.to_string(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Build the axum app. Must be called inside a tokio runtime.
    pub fn into_router(self) -> Router {
        if let Some(mut rx) = self.server.take_notification_receiver() {
            tokio::spawn(async move {
                while let Some(item) = rx.recv().await {
                    tracing::debug!(
                        method = %item.notification.method,
                        "stateless transport cannot deliver notification, dropping"
                    );
                }
            });
        }

        Router::new()
            .route(&self.path, post(handle_post))
            .layer(middleware::from_fn(logging::request_logging_middleware))
            .with_state(self.server)
    }

    pub async fn serve(self, addr: &str, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_with_listener(listener, shutdown).await
    }

    pub async fn serve_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        tracing::info!(addr = ?listener.local_addr().ok(), path = %self.path, "stateless http server listening");
        axum::serve(listener, self.into_router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

async fn handle_post(State(server): State<Server>, body: Bytes) -> Response {
    match server
        .handle_message(&MessageContext::anonymous(), &body)
        .await
    {
        None => StatusCode::ACCEPTED.into_response(),
        Some(Message::Error(error)) => {
            (status_for_error(error.error.code), Json(Message::Error(error))).into_response()
        }
        Some(reply) => (StatusCode::OK, Json(reply)).into_response(),
    }
}
