//! Session-oriented SSE server.
//!
//! `GET /sse` opens a session: the first event (`endpoint`) carries the URL the client must
//! POST its messages to, every later event (`message`) carries one JSON-RPC message.
//! `POST /message?sessionId=<id>` feeds one message into the router; its reply is pushed
//! onto the session's stream and also returned in the POST body with status 202.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    middleware,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use std::{collections::HashMap, convert::Infallible, sync::Arc};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{http::HttpError, MessageContext, Server, ServerNotification, DEFAULT_NOTIFICATION_QUEUE};
use crate::{error::Result, logging, protocol::Message};

pub const SSE_PATH: &str = "/sse";
pub const MESSAGE_PATH: &str = "/message";

type Sessions = Arc<RwLock<HashMap<String, mpsc::Sender<Event>>>>;

#[derive(Clone)]
struct SseState {
    server: Server,
    sessions: Sessions,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

pub struct SseServer {
    server: Server,
    base_url: String,
}

impl SseServer {
    pub fn new(server: Server) -> Self {
        Self {
            server,
            base_url: String::new(),
        }
    }

    /// Prefix for the advertised message endpoint, e.g. `http://localhost:8080`.
    /// Without it the endpoint is sent as a path relative to the SSE URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Build the axum app and start routing queued notifications to session streams.
    /// Must be called inside a tokio runtime.
    pub fn into_router(self) -> Router {
        let state = SseState {
            server: self.server,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            base_url: self.base_url,
        };

        match state.server.take_notification_receiver() {
            Some(rx) => {
                tokio::spawn(fan_out(rx, state.sessions.clone()));
            }
            None => tracing::warn!("notification receiver already taken, sse sessions will not get notifications"),
        }

        Router::new()
            .route(SSE_PATH, get(handle_sse))
            .route(MESSAGE_PATH, post(handle_message))
            .layer(middleware::from_fn(logging::request_logging_middleware))
            .with_state(state)
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
        tracing::info!(addr = ?listener.local_addr().ok(), "sse server listening");
        axum::serve(listener, self.into_router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

/// Removes the session from the table and the router once its stream is dropped
struct SessionGuard {
    id: String,
    server: Server,
    sessions: Sessions,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.write().remove(&self.id);
        self.server.close_session(Some(&self.id));
        tracing::info!(session_id = %self.id, "sse session closed");
    }
}

async fn handle_sse(
    State(state): State<SseState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel(DEFAULT_NOTIFICATION_QUEUE);
    state.sessions.write().insert(id.clone(), tx);
    tracing::info!(session_id = %id, "sse session opened");

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("{}{}?sessionId={}", state.base_url, MESSAGE_PATH, id));
    let guard = SessionGuard {
        id,
        server: state.server.clone(),
        sessions: state.sessions.clone(),
    };

    let messages = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        Some((event, (rx, guard)))
    });
    let events = stream::once(async move { endpoint })
        .chain(messages)
        .map(Ok::<_, Infallible>);

    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn handle_message(
    State(state): State<SseState>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> std::result::Result<Response, HttpError> {
    let session_id = query
        .session_id
        .ok_or_else(|| HttpError::bad_request("Missing sessionId"))?;
    let sender = state
        .sessions
        .read()
        .get(&session_id)
        .cloned()
        .ok_or_else(|| HttpError::not_found(format!("Session not found: {}", session_id)))?;

    let ctx = MessageContext::session(session_id.clone());
    let Some(reply) = state.server.handle_message(&ctx, &body).await else {
        return Ok(StatusCode::ACCEPTED.into_response());
    };

    let event = message_event(&reply)
        .map_err(|e| HttpError::internal(format!("Failed to encode reply: {}", e)))?;
    if sender.send(event).await.is_err() {
        tracing::warn!(session_id = %session_id, "sse stream gone before reply was delivered");
    }
    Ok((StatusCode::ACCEPTED, Json(reply)).into_response())
}

fn message_event(message: &Message) -> serde_json::Result<Event> {
    let data = serde_json::to_string(message)?;
    Ok(Event::default().event("message").data(data))
}

/// Route each queued notification to its session; anonymous ones go to every session
async fn fan_out(mut rx: mpsc::Receiver<ServerNotification>, sessions: Sessions) {
    while let Some(item) = rx.recv().await {
        let event = match message_event(&Message::Notification(item.notification)) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode notification");
                continue;
            }
        };

        let targets: Vec<(String, mpsc::Sender<Event>)> = {
            let sessions = sessions.read();
            match &item.session_id {
                Some(id) => sessions
                    .get(id)
                    .map(|tx| vec![(id.clone(), tx.clone())])
                    .unwrap_or_default(),
                None => sessions
                    .iter()
                    .map(|(id, tx)| (id.clone(), tx.clone()))
                    .collect(),
            }
        };
        if targets.is_empty() {
            tracing::debug!(session_id = ?item.session_id, "no session for notification");
        }
        for (id, tx) in targets {
            if let Err(e) = tx.try_send(event.clone()) {
                tracing::warn!(session_id = %id, error = %e, "dropping notification for sse session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn next_frame(body: &mut Body) -> String {
        loop {
            let frame = body.frame().await.expect("stream open").unwrap();
            if let Ok(data) = frame.into_data() {
                let text = String::from_utf8(data.to_vec()).unwrap();
                // skip keep-alive comments
                if !text.starts_with(':') {
                    return text;
                }
            }
        }
    }

    fn data_line(frame: &str) -> &str {
        frame
            .lines()
            .find_map(|l| l.strip_prefix("data: "))
            .expect("data line")
    }

    #[tokio::test]
    async fn session_flow_over_sse() {
        let app = SseServer::new(Server::builder("sse-test", "1.0").build()).into_router();

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.into_body();

        let first = next_frame(&mut body).await;
        assert!(first.starts_with("event: endpoint"), "{}", first);
        let endpoint = data_line(&first).to_string();
        assert!(endpoint.starts_with("/message?sessionId="));

        let request = Request::builder()
            .method("POST")
            .uri(&endpoint)
            .header("Content-Type", "application/json")
            .body(Body::from(
                r#"{"jsonrpc":"2.0","id":7,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{},"clientInfo":{"name":"t","version":"1"}}}"#,
            ))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let posted: Value =
            serde_json::from_slice(&response.into_body().collect().await.unwrap().to_bytes())
                .unwrap();
        assert_eq!(posted["id"], 7);
        assert!(!posted["result"].is_null());

        let pushed = next_frame(&mut body).await;
        assert!(pushed.starts_with("event: message"), "{}", pushed);
        let pushed: Value = serde_json::from_str(data_line(&pushed)).unwrap();
        assert_eq!(pushed, posted);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let app = SseServer::new(Server::builder("sse-test", "1.0").build()).into_router();
        let request = Request::builder()
            .method("POST")
            .uri("/message?sessionId=nope")
            .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let request = Request::builder()
            .method("POST")
            .uri("/message")
            .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn base_url_prefixes_the_endpoint() {
        let app = SseServer::new(Server::builder("sse-test", "1.0").build())
            .with_base_url("http://localhost:9000/")
            .into_router();
        let response = app
            .oneshot(Request::builder().uri("/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let mut body = response.into_body();
        let first = next_frame(&mut body).await;
        assert!(data_line(&first).starts_with("http://localhost:9000/message?sessionId="));
    }
}
