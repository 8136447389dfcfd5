//! Request/response correlation on top of a [`Transport`].
//!
//! [`Protocol`] turns the push based message stream of a transport into awaitable
//! calls. Each outbound request gets a fresh id and a single-slot channel; the first of
//! response, caller cancellation or timeout to happen removes the pending entry and
//! settles the call. Inbound requests run on their own task so a slow handler never
//! stalls the read loop.

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, ErrorCode, Result},
    protocol::{ErrorResponse, Message, Notification, Request, RequestId, Response, ResponseError},
    transport::{CloseHandler, ErrorHandler, Transport},
    types::{CancelledNotification, Progress, ProgressNotification},
};

/// Timeout applied to requests that do not set their own
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Handles one inbound request and produces its result
pub type RequestHandlerFn =
    Arc<dyn Fn(Request, RequestHandlerExtra) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
/// Handles one inbound notification
pub type NotificationHandlerFn =
    Arc<dyn Fn(Notification) -> BoxFuture<'static, Result<()>> + Send + Sync>;
/// Receives progress updates for an outbound request
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Extra context handed to inbound request handlers
#[derive(Debug, Clone)]
pub struct RequestHandlerExtra {
    pub request_id: RequestId,
    /// Fired when the peer sends `notifications/cancelled` for this request or the
    /// connection closes
    pub cancellation: CancellationToken,
}

/// Per-call options for [`Protocol::request`]
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub on_progress: Option<ProgressCallback>,
    pub cancellation: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Connection wide options
#[derive(Debug, Clone)]
pub struct ProtocolOptions {
    pub default_timeout: Duration,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    Connected,
    Closed,
}

struct Inner {
    options: ProtocolOptions,
    state: Mutex<State>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    next_id: AtomicI64,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Result<Value>>>>,
    progress_handlers: Mutex<HashMap<RequestId, ProgressCallback>>,
    request_cancellers: Mutex<HashMap<RequestId, CancellationToken>>,
    request_handlers: RwLock<HashMap<String, RequestHandlerFn>>,
    notification_handlers: RwLock<HashMap<String, NotificationHandlerFn>>,
    fallback_request_handler: RwLock<Option<RequestHandlerFn>>,
    fallback_notification_handler: RwLock<Option<NotificationHandlerFn>>,
    on_close: RwLock<Option<CloseHandler>>,
    on_error: RwLock<Option<ErrorHandler>>,
}

enum Outcome {
    Settled(Result<Value>),
    Cancelled,
    TimedOut,
}

/// Correlation engine bound to one transport connection
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<Inner>,
}

impl Protocol {
    pub fn new(options: ProtocolOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                state: Mutex::new(State::Disconnected),
                transport: RwLock::new(None),
                next_id: AtomicI64::new(1),
                pending: Mutex::new(HashMap::new()),
                progress_handlers: Mutex::new(HashMap::new()),
                request_cancellers: Mutex::new(HashMap::new()),
                request_handlers: RwLock::new(HashMap::new()),
                notification_handlers: RwLock::new(HashMap::new()),
                fallback_request_handler: RwLock::new(None),
                fallback_notification_handler: RwLock::new(None),
                on_close: RwLock::new(None),
                on_error: RwLock::new(None),
            }),
        }
    }

    /// Attach to a transport, install its callbacks and start it.
    ///
    /// A protocol connects once; reconnecting after close is not supported.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != State::Disconnected {
                return Err(Error::Other("protocol already connected".to_string()));
            }
            *state = State::Connected;
        }

        let weak = Arc::downgrade(&self.inner);
        transport.set_close_handler(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                Protocol { inner }.handle_close();
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        transport.set_error_handler(Arc::new(move |error| {
            if let Some(inner) = weak.upgrade() {
                Protocol { inner }.handle_error(error);
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        transport.set_message_handler(Arc::new(move |message| {
            if let Some(inner) = weak.upgrade() {
                Protocol { inner }.handle_message(message);
            }
        }));

        *self.inner.transport.write() = Some(transport.clone());
        tracing::debug!("protocol connected");
        transport.start().await
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state.lock() == State::Connected
    }

    fn transport(&self) -> Result<Arc<dyn Transport>> {
        match *self.inner.state.lock() {
            State::Disconnected => return Err(Error::NotConnected),
            State::Closed => return Err(Error::ConnectionClosed),
            State::Connected => {}
        }
        self.inner
            .transport
            .read()
            .clone()
            .ok_or(Error::NotConnected)
    }

    /// Send a request and wait for its result.
    ///
    /// Resolves with the peer's result, or fails with [`Error::Remote`] for an error
    /// reply, [`Error::Timeout`], [`Error::Cancelled`] or [`Error::ConnectionClosed`].
    /// Timeout and cancellation both send `notifications/cancelled` to the peer.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value> {
        let transport = self.transport()?;
        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::SeqCst));

        let params = match &options.on_progress {
            Some(_) => Some(attach_progress_token(params, &id)?),
            None => params,
        };

        let (tx, mut rx) = oneshot::channel();
        self.inner.pending.lock().insert(id.clone(), tx);
        if let Some(on_progress) = options.on_progress.clone() {
            self.inner
                .progress_handlers
                .lock()
                .insert(id.clone(), on_progress);
        }

        tracing::debug!(request_id = %id, method = %method, "sending request");
        let request = Request::new(method, params, id.clone());
        let timeout = options.timeout.unwrap_or(self.inner.options.default_timeout);
        let cancellation = options.cancellation.unwrap_or_default();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        // HTTP based transports only finish `send` once the POST is answered, so the
        // send races the reply, the caller's token and the deadline
        let mut send = transport.send(Message::Request(request));
        let mut sent = false;
        let outcome = loop {
            tokio::select! {
                result = &mut send, if !sent => match result {
                    Ok(()) => sent = true,
                    Err(e) => {
                        self.forget(&id);
                        return Err(e);
                    }
                },
                result = &mut rx => {
                    break Outcome::Settled(result.unwrap_or(Err(Error::ConnectionClosed)))
                }
                _ = cancellation.cancelled() => break Outcome::Cancelled,
                _ = &mut deadline => break Outcome::TimedOut,
            }
        };
        drop(send);

        let (reason, error) = match outcome {
            Outcome::Settled(result) => {
                self.inner.progress_handlers.lock().remove(&id);
                return result;
            }
            Outcome::Cancelled => (
                "request cancelled",
                Error::Cancelled("request cancelled".to_string()),
            ),
            Outcome::TimedOut => ("request timeout", Error::Timeout(timeout)),
        };

        if !self.forget(&id) {
            // a reply or a close won the race and already filled the slot
            return rx.try_recv().unwrap_or(Err(Error::ConnectionClosed));
        }

        tracing::debug!(request_id = %id, reason, "abandoning request");
        self.send_cancelled(&transport, &id, reason).await;
        Err(error)
    }

    /// Send a notification; no reply is expected
    pub async fn notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        let transport = self.transport()?;
        transport
            .send(Message::Notification(Notification::new(method, params)))
            .await
    }

    /// Close the transport and settle everything still in flight.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        let transport = self.inner.transport.read().clone();
        let result = match transport {
            Some(transport) => transport.close().await,
            None => Ok(()),
        };
        self.handle_close();
        result
    }

    /// Handler for inbound requests with the given method
    pub fn set_request_handler<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Request, RequestHandlerExtra) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: RequestHandlerFn = Arc::new(move |req, extra| Box::pin(handler(req, extra)));
        self.inner
            .request_handlers
            .write()
            .insert(method.into(), handler);
    }

    pub fn remove_request_handler(&self, method: &str) {
        self.inner.request_handlers.write().remove(method);
    }

    /// Handler for inbound notifications with the given method
    pub fn set_notification_handler<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Notification) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: NotificationHandlerFn = Arc::new(move |n| Box::pin(handler(n)));
        self.inner
            .notification_handlers
            .write()
            .insert(method.into(), handler);
    }

    pub fn remove_notification_handler(&self, method: &str) {
        self.inner.notification_handlers.write().remove(method);
    }

    /// Handler for inbound requests no specific handler claims
    pub fn set_fallback_request_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Request, RequestHandlerExtra) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: RequestHandlerFn = Arc::new(move |req, extra| Box::pin(handler(req, extra)));
        *self.inner.fallback_request_handler.write() = Some(handler);
    }

    /// Handler for inbound notifications no specific handler claims
    pub fn set_fallback_notification_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Notification) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: NotificationHandlerFn = Arc::new(move |n| Box::pin(handler(n)));
        *self.inner.fallback_notification_handler.write() = Some(handler);
    }

    pub fn set_close_handler(&self, handler: CloseHandler) {
        *self.inner.on_close.write() = Some(handler);
    }

    pub fn set_error_handler(&self, handler: ErrorHandler) {
        *self.inner.on_error.write() = Some(handler);
    }

    /// Drop the pending slot and progress callback of a request.
    ///
    /// Returns whether the pending slot was still present.
    fn forget(&self, id: &RequestId) -> bool {
        self.inner.progress_handlers.lock().remove(id);
        self.inner.pending.lock().remove(id).is_some()
    }

    async fn send_cancelled(&self, transport: &Arc<dyn Transport>, id: &RequestId, reason: &str) {
        let params = CancelledNotification {
            request_id: id.clone(),
            reason: Some(reason.to_string()),
        };
        let params = match serde_json::to_value(params) {
            Ok(params) => params,
            Err(e) => {
                self.handle_error(e.into());
                return;
            }
        };
        let notification = Notification::new("notifications/cancelled", Some(params));
        if let Err(e) = transport.send(Message::Notification(notification)).await {
            tracing::debug!(request_id = %id, error = %e, "failed to send cancellation");
        }
    }

    fn handle_message(&self, message: Message) {
        match message {
            Message::Response(response) => self.settle(Some(response.id), Ok(response.result)),
            Message::Error(error) => self.settle(error.id, Err(Error::Remote(error.error))),
            Message::Request(request) => self.handle_request(request),
            Message::Notification(notification) => self.handle_notification(notification),
        }
    }

    fn settle(&self, id: Option<RequestId>, result: Result<Value>) {
        let Some(id) = id else {
            if let Err(e) = result {
                self.handle_error(e);
            }
            return;
        };
        self.inner.progress_handlers.lock().remove(&id);
        let sender = self.inner.pending.lock().remove(&id);
        match sender {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => {
                tracing::debug!(request_id = %id, "dropping response for unknown or abandoned request")
            }
        }
    }

    fn handle_request(&self, request: Request) {
        let Ok(transport) = self.transport() else {
            return;
        };
        let handler = self
            .inner
            .request_handlers
            .read()
            .get(&request.method)
            .cloned()
            .or_else(|| self.inner.fallback_request_handler.read().clone());

        let Some(handler) = handler else {
            tracing::debug!(method = %request.method, "no handler for inbound request");
            let error = ResponseError::new(
                ErrorCode::MethodNotFound,
                format!("Method not found: {}", request.method),
            );
            let this = self.clone();
            tokio::spawn(async move {
                let reply = ErrorResponse::new(Some(request.id), error);
                if let Err(e) = transport.send(Message::Error(reply)).await {
                    this.handle_error(e);
                }
            });
            return;
        };

        let token = CancellationToken::new();
        self.inner
            .request_cancellers
            .lock()
            .insert(request.id.clone(), token.clone());

        let this = self.clone();
        tokio::spawn(async move {
            let id = request.id.clone();
            let extra = RequestHandlerExtra {
                request_id: id.clone(),
                cancellation: token.clone(),
            };
            let result = handler(request, extra).await;
            this.inner.request_cancellers.lock().remove(&id);

            if token.is_cancelled() {
                tracing::debug!(request_id = %id, "request cancelled, not replying");
                return;
            }

            let reply = match result {
                Ok(value) => Message::Response(Response::success(id, value)),
                Err(e) => Message::Error(ErrorResponse::new(Some(id), handler_error(e))),
            };
            if let Err(e) = transport.send(reply).await {
                this.handle_error(e);
            }
        });
    }

    fn handle_notification(&self, notification: Notification) {
        match notification.method.as_str() {
            "notifications/cancelled" => {
                self.handle_cancelled(notification.params);
                return;
            }
            "$/progress" | "notifications/progress" => {
                self.handle_progress(notification.params);
                return;
            }
            _ => {}
        }

        let handler = self
            .inner
            .notification_handlers
            .read()
            .get(&notification.method)
            .cloned()
            .or_else(|| self.inner.fallback_notification_handler.read().clone());
        let Some(handler) = handler else {
            tracing::trace!(method = %notification.method, "ignoring notification");
            return;
        };

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = handler(notification).await {
                this.handle_error(e);
            }
        });
    }

    fn handle_cancelled(&self, params: Option<Value>) {
        let params: CancelledNotification =
            match serde_json::from_value(params.unwrap_or(Value::Null)) {
                Ok(params) => params,
                Err(e) => {
                    self.handle_error(e.into());
                    return;
                }
            };
        let token = self.inner.request_cancellers.lock().remove(&params.request_id);
        if let Some(token) = token {
            tracing::debug!(request_id = %params.request_id, reason = ?params.reason, "peer cancelled request");
            token.cancel();
        }
    }

    fn handle_progress(&self, params: Option<Value>) {
        let params: ProgressNotification =
            match serde_json::from_value(params.unwrap_or(Value::Null)) {
                Ok(params) => params,
                Err(e) => {
                    self.handle_error(e.into());
                    return;
                }
            };
        let callback = self
            .inner
            .progress_handlers
            .lock()
            .get(&params.progress_token)
            .cloned();
        match callback {
            Some(callback) => callback(Progress {
                progress: params.progress,
                total: params.total,
            }),
            None => self.handle_error(Error::Other(format!(
                "received progress for unknown token {}",
                params.progress_token
            ))),
        }
    }

    fn handle_error(&self, error: Error) {
        let handler = self.inner.on_error.read().clone();
        match handler {
            Some(handler) => handler(error),
            None => tracing::warn!(error = %error, "protocol error"),
        }
    }

    fn handle_close(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == State::Closed {
                return;
            }
            *state = State::Closed;
        }

        self.inner.request_handlers.write().clear();
        self.inner.notification_handlers.write().clear();
        *self.inner.fallback_request_handler.write() = None;
        *self.inner.fallback_notification_handler.write() = None;

        let cancellers: Vec<_> = self.inner.request_cancellers.lock().drain().collect();
        for (_, token) in cancellers {
            token.cancel();
        }

        let pending: Vec<_> = self.inner.pending.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }
        self.inner.progress_handlers.lock().clear();
        self.inner.transport.write().take();

        tracing::debug!("protocol closed");
        let on_close = self.inner.on_close.write().take();
        if let Some(on_close) = on_close {
            on_close();
        }
    }
}

/// Protocol and remote errors keep their code; anything else is a generic failure
fn handler_error(error: Error) -> ResponseError {
    match error {
        Error::Protocol { .. } | Error::Remote(_) => ResponseError::from(error),
        other => ResponseError::new(ErrorCode::RequestFailed, other.to_string()),
    }
}

/// Put the request id into `params._meta.progressToken`
fn attach_progress_token(params: Option<Value>, token: &RequestId) -> Result<Value> {
    let mut params = params.unwrap_or_else(|| Value::Object(Map::new()));
    let Value::Object(map) = &mut params else {
        return Err(Error::protocol(
            ErrorCode::InvalidParams,
            "params must be an object to carry a progress token",
        ));
    };
    let meta = map.entry("_meta").or_insert_with(|| json!({}));
    let Value::Object(meta) = meta else {
        return Err(Error::protocol(
            ErrorCode::InvalidParams,
            "_meta must be an object",
        ));
    };
    meta.insert("progressToken".to_string(), serde_json::to_value(token)?);
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{stdio::StreamTransport, MessageHandler, TransportHandlers};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

    struct Peer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn recv(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, value: Value) {
            let mut line = serde_json::to_vec(&value).unwrap();
            line.push(b'\n');
            self.writer.write_all(&line).await.unwrap();
        }
    }

    async fn connected(options: ProtocolOptions) -> (Protocol, Peer) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(local);
        let protocol = Protocol::new(options);
        protocol
            .connect(Arc::new(StreamTransport::new(reader, writer)))
            .await
            .unwrap();
        let (reader, writer) = tokio::io::split(remote);
        let peer = Peer {
            lines: BufReader::new(reader).lines(),
            writer,
        };
        (protocol, peer)
    }

    #[tokio::test]
    async fn out_of_order_replies_reach_their_callers() {
        let (protocol, mut peer) = connected(ProtocolOptions::default()).await;

        let p = protocol.clone();
        let first = tokio::spawn(async move { p.request("first", None, RequestOptions::default()).await });
        let first_id = peer.recv().await["id"].clone();

        let p = protocol.clone();
        let second =
            tokio::spawn(async move { p.request("second", None, RequestOptions::default()).await });
        let second_id = peer.recv().await["id"].clone();
        assert_ne!(first_id, second_id);

        peer.send(json!({"jsonrpc": "2.0", "id": second_id, "result": "two"}))
            .await;
        assert_eq!(second.await.unwrap().unwrap(), json!("two"));
        assert!(!first.is_finished());

        peer.send(json!({"jsonrpc": "2.0", "id": first_id, "result": "one"}))
            .await;
        assert_eq!(first.await.unwrap().unwrap(), json!("one"));
    }

    #[tokio::test]
    async fn error_reply_becomes_remote_error() {
        let (protocol, mut peer) = connected(ProtocolOptions::default()).await;

        let p = protocol.clone();
        let call = tokio::spawn(async move { p.request("tools/call", None, RequestOptions::default()).await });
        let id = peer.recv().await["id"].clone();
        peer.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32602, "message": "unknown tool"}
        }))
        .await;

        match call.await.unwrap() {
            Err(Error::Remote(err)) => {
                assert_eq!(err.code, -32602);
                assert_eq!(err.message, "unknown tool");
            }
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn timeout_sends_exactly_one_cancellation() {
        let (protocol, mut peer) = connected(ProtocolOptions::default()).await;

        let result = protocol
            .request(
                "slow",
                None,
                RequestOptions::default().with_timeout(Duration::from_millis(50)),
            )
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        let request = peer.recv().await;
        let cancelled = peer.recv().await;
        assert_eq!(cancelled["method"], "notifications/cancelled");
        assert_eq!(cancelled["params"]["requestId"], request["id"]);
        assert_eq!(cancelled["params"]["reason"], "request timeout");

        // next frame is the marker, not a second cancellation
        let p = protocol.clone();
        tokio::spawn(async move { p.notification("ping-marker", None).await });
        assert_eq!(peer.recv().await["method"], "ping-marker");
    }

    #[tokio::test]
    async fn cancellation_drops_late_response() {
        let (protocol, mut peer) = connected(ProtocolOptions::default()).await;
        let token = CancellationToken::new();

        let p = protocol.clone();
        let t = token.clone();
        let call = tokio::spawn(async move {
            p.request("slow", None, RequestOptions::default().with_cancellation(t))
                .await
        });
        let id = peer.recv().await["id"].clone();
        token.cancel();

        assert!(call.await.unwrap().unwrap_err().is_cancelled());
        let cancelled = peer.recv().await;
        assert_eq!(cancelled["params"]["requestId"], id);
        assert_eq!(cancelled["params"]["reason"], "request cancelled");

        peer.send(json!({"jsonrpc": "2.0", "id": id, "result": "late"}))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(protocol.inner.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn progress_token_routes_updates() {
        let (protocol, mut peer) = connected(ProtocolOptions::default()).await;
        let updates = Arc::new(Mutex::new(Vec::new()));

        let p = protocol.clone();
        let u = updates.clone();
        let call = tokio::spawn(async move {
            p.request(
                "long",
                Some(json!({"n": 1})),
                RequestOptions::default().with_progress(move |progress| u.lock().push(progress)),
            )
            .await
        });

        let request = peer.recv().await;
        let token = request["params"]["_meta"]["progressToken"].clone();
        assert_eq!(token, request["id"]);
        assert_eq!(request["params"]["n"], 1);

        peer.send(json!({
            "jsonrpc": "2.0",
            "method": "$/progress",
            "params": {"progressToken": token, "progress": 1, "total": 2}
        }))
        .await;
        peer.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {}}))
            .await;
        call.await.unwrap().unwrap();

        assert_eq!(
            *updates.lock(),
            vec![Progress {
                progress: 1,
                total: 2
            }]
        );
    }

    #[tokio::test]
    async fn inbound_requests_are_answered() {
        let (protocol, mut peer) = connected(ProtocolOptions::default()).await;
        protocol.set_request_handler("echo", |req: Request, _extra| async move {
            Ok(req.params.unwrap_or(Value::Null))
        });
        protocol.set_request_handler("fail", |_req: Request, _extra| async move {
            Err(Error::Other("boom".to_string()))
        });
        protocol.set_request_handler("sampling/createMessage", |_req: Request, _extra| async move {
            Err(Error::protocol(ErrorCode::MethodNotFound, "sampling not supported"))
        });

        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "echo", "params": {"a": 1}}))
            .await;
        let reply = peer.recv().await;
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["result"], json!({"a": 1}));

        peer.send(json!({"jsonrpc": "2.0", "id": 2, "method": "fail"}))
            .await;
        let reply = peer.recv().await;
        assert_eq!(reply["error"]["code"], -32000);
        assert_eq!(reply["error"]["message"], "boom");

        peer.send(json!({"jsonrpc": "2.0", "id": 3, "method": "nope"}))
            .await;
        let reply = peer.recv().await;
        assert_eq!(reply["error"]["code"], -32601);

        // typed errors keep their own code
        peer.send(json!({"jsonrpc": "2.0", "id": 4, "method": "sampling/createMessage"}))
            .await;
        let reply = peer.recv().await;
        assert_eq!(reply["error"]["code"], -32601);
        assert_eq!(reply["error"]["message"], "sampling not supported");
    }

    #[tokio::test]
    async fn peer_cancellation_reaches_handler() {
        let (protocol, mut peer) = connected(ProtocolOptions::default()).await;
        let (seen_tx, seen_rx) = oneshot::channel();
        let seen_tx = Arc::new(Mutex::new(Some(seen_tx)));
        protocol.set_request_handler("wait", move |_req: Request, extra: RequestHandlerExtra| {
            let seen_tx = seen_tx.clone();
            async move {
                extra.cancellation.cancelled().await;
                if let Some(tx) = seen_tx.lock().take() {
                    let _ = tx.send(());
                }
                Ok(Value::Null)
            }
        });

        peer.send(json!({"jsonrpc": "2.0", "id": 9, "method": "wait"}))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        peer.send(json!({
            "jsonrpc": "2.0",
            "method": "notifications/cancelled",
            "params": {"requestId": 9, "reason": "user"}
        }))
        .await;
        tokio::time::timeout(Duration::from_secs(1), seen_rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn close_settles_pending_requests() {
        let (protocol, mut peer) = connected(ProtocolOptions::default()).await;
        let closed = Arc::new(AtomicUsize::new(0));
        let c = closed.clone();
        protocol.set_close_handler(Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        let p = protocol.clone();
        let call = tokio::spawn(async move { p.request("never", None, RequestOptions::default()).await });
        peer.recv().await;

        protocol.close().await.unwrap();
        protocol.close().await.unwrap();

        assert!(matches!(call.await.unwrap(), Err(Error::ConnectionClosed)));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(!protocol.is_connected());
        assert!(matches!(
            protocol.notification("x", None).await,
            Err(Error::ConnectionClosed)
        ));
    }

    /// Never finishes sending a request, like a POST whose answer waits on the handler
    #[derive(Default)]
    struct StalledPost {
        handlers: TransportHandlers,
        notifications: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Transport for StalledPost {
        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn send(&self, message: Message) -> Result<()> {
            match message {
                Message::Notification(n) => {
                    self.notifications.lock().push(n.method);
                    Ok(())
                }
                _ => futures::future::pending().await,
            }
        }

        async fn close(&self) -> Result<()> {
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

    #[tokio::test]
    async fn deadline_and_token_apply_while_send_is_pending() {
        let transport = Arc::new(StalledPost::default());
        let protocol = Protocol::new(ProtocolOptions::default());
        protocol.connect(transport.clone()).await.unwrap();

        let started = std::time::Instant::now();
        let result = protocol
            .request(
                "slow",
                None,
                RequestOptions::default().with_timeout(Duration::from_millis(50)),
            )
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let result = protocol
            .request("slow", None, RequestOptions::default().with_cancellation(token))
            .await;
        assert!(matches!(result, Err(Error::Cancelled(_))));

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(protocol.inner.pending.lock().is_empty());
        assert_eq!(
            *transport.notifications.lock(),
            vec!["notifications/cancelled", "notifications/cancelled"]
        );
    }

    #[test]
    fn progress_token_requires_object_params() {
        let token = RequestId::Number(4);
        let params = attach_progress_token(Some(json!({"_meta": {"other": true}})), &token).unwrap();
        assert_eq!(params["_meta"], json!({"other": true, "progressToken": 4}));
        assert!(attach_progress_token(Some(json!([1])), &token).is_err());
    }
}
