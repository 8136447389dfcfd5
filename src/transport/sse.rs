//! Server-Sent Events client transport
//!
//! The client opens a long lived `GET` against the server's SSE URL. The server first
//! sends one `endpoint` event naming the URL to POST messages to, then pushes every
//! response and notification as a `message` event. Outbound messages are POSTed to the
//! endpoint and the POST's response body is ignored; replies are correlated from the
//! event stream by id.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    error::Error,
    transport::{CloseHandler, ErrorHandler, Message, MessageHandler, Transport, TransportHandlers},
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// One decoded SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type, `message` when the stream did not name one
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental SSE decoder.
///
/// Feed raw chunks as they arrive; complete events come out once their terminating
/// blank line has been seen. Chunks may split lines (or UTF-8 sequences) anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw = self.buffer.split_to(pos + 1);
            let line = String::from_utf8_lossy(&raw[..pos]);
            let line = line.trim_end_matches('\r');
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        // comment / keep-alive
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
            id: self.id.clone(),
        })
    }
}

pub struct SseTransport {
    url: Url,
    client: reqwest::Client,
    endpoint: RwLock<Option<Url>>,
    handlers: Arc<TransportHandlers>,
    shutdown: CancellationToken,
    started: AtomicBool,
    connect_timeout: Duration,
}

impl SseTransport {
    /// Creates a transport for the server's SSE URL, e.g. `http://localhost:8080/sse`
    pub fn new(url: &str) -> Result<Self, Error> {
        let url = Url::parse(url).map_err(|e| Error::Transport(format!("invalid url {url}: {e}")))?;
        Ok(Self {
            url,
            client: reqwest::Client::new(),
            endpoint: RwLock::new(None),
            handlers: Arc::new(TransportHandlers::new()),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// How long `start` waits for the `endpoint` event
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The POST endpoint announced by the server, once connected
    pub fn endpoint(&self) -> Option<Url> {
        self.endpoint.read().clone()
    }

    /// Report a failed POST and tear the connection down
    fn fail(&self, error: Error) {
        self.handlers.report_error(error);
        self.shutdown.cancel();
        self.handlers.close_once();
    }

    async fn read_loop(
        mut stream: ByteStream,
        base: Url,
        handlers: Arc<TransportHandlers>,
        shutdown: CancellationToken,
        endpoint_tx: oneshot::Sender<Url>,
    ) {
        let mut decoder = SseDecoder::new();
        let mut endpoint_tx = Some(endpoint_tx);
        loop {
            let chunk = tokio::select! {
                _ = shutdown.cancelled() => break,
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    for event in decoder.push(&bytes) {
                        Self::handle_event(event, &base, &handlers, &mut endpoint_tx);
                    }
                }
                Some(Err(e)) => {
                    handlers.report_error(Error::Http(e));
                    break;
                }
                None => {
                    tracing::debug!(url = %base, "event stream ended");
                    break;
                }
            }
        }
        handlers.close_once();
    }

    fn handle_event(
        event: SseEvent,
        base: &Url,
        handlers: &TransportHandlers,
        endpoint_tx: &mut Option<oneshot::Sender<Url>>,
    ) {
        match event.event.as_str() {
            "endpoint" => match base.join(event.data.trim()) {
                Ok(endpoint) => match endpoint_tx.take() {
                    Some(tx) => {
                        tracing::debug!(endpoint = %endpoint, "received endpoint");
                        let _ = tx.send(endpoint);
                    }
                    None => tracing::debug!("ignoring repeated endpoint event"),
                },
                Err(e) => handlers.report_error(Error::Transport(format!(
                    "invalid endpoint {}: {}",
                    event.data, e
                ))),
            },
            "message" => match Message::from_slice(event.data.as_bytes()) {
                Ok(message) => handlers.dispatch_message(message),
                Err(e) => handlers.report_error(e),
            },
            other => tracing::trace!(event = %other, "ignoring event"),
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    /// Opens the event stream and waits for the `endpoint` event
    async fn start(&self) -> Result<(), Error> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Transport("sse transport already started".to_string()));
        }

        let response = self
            .client
            .get(self.url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?
            .error_for_status()?;

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        tokio::spawn(Self::read_loop(
            Box::pin(response.bytes_stream()),
            self.url.clone(),
            self.handlers.clone(),
            self.shutdown.clone(),
            endpoint_tx,
        ));

        let endpoint = match tokio::time::timeout(self.connect_timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                return Err(Error::Transport(
                    "event stream closed before endpoint event".to_string(),
                ))
            }
            Err(_) => {
                self.shutdown.cancel();
                return Err(Error::Transport(
                    "timed out waiting for endpoint event".to_string(),
                ));
            }
        };
        *self.endpoint.write() = Some(endpoint);
        Ok(())
    }

    /// POSTs the message to the announced endpoint
    async fn send(&self, message: Message) -> Result<(), Error> {
        if self.handlers.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let endpoint = self.endpoint().ok_or(Error::NotConnected)?;
        let response = match self.client.post(endpoint.clone()).json(&message).send().await {
            Ok(response) => response,
            Err(e) => {
                self.fail(Error::Transport(format!("POST {} failed: {}", endpoint, e)));
                return Err(Error::Http(e));
            }
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("POST {} failed with status {}: {}", endpoint, status, body);
            // the session behind the endpoint is gone
            self.fail(Error::Transport(message.clone()));
            return Err(Error::Transport(message));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.shutdown.cancel();
        self.handlers.close_once();
        Ok(())
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        self.handlers.set_message_handler(handler);
    }

    fn set_error_handler(&self, handler: ErrorHandler) {
        self.handlers.set_error_handler(handler);
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        self.handlers.set_close_handler(handler);
    }
}
