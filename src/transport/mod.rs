//! Transport layer
//!
//! A transport moves whole JSON-RPC [`Message`]s between two peers. Reading is push based:
//! once [`Transport::start`] has been called, every decoded message is handed to the
//! registered message handler, decode and I/O failures go to the error handler, and the
//! close handler fires exactly once when the transport shuts down.
//!
//! Implementations:
//! - [`stdio::StreamTransport`]: newline delimited JSON over any byte stream pair
//!   (own stdin/stdout, a spawned child process, in-memory duplex pipes)
//! - [`sse::SseTransport`]: Server-Sent Events stream plus POST endpoint
//! - [`http::HttpTransport`]: stateless POST, one request per round trip

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::error::Error;
pub use crate::protocol::Message;

pub mod http;
pub mod sse;
pub mod stdio;

/// Callback receiving every inbound message
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;
/// Callback receiving transport level failures
pub type ErrorHandler = Arc<dyn Fn(Error) + Send + Sync>;
/// Callback fired once when the transport closes
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

/// Trait for implementing MCP transports
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin reading from the underlying channel
    async fn start(&self) -> Result<(), Error>;

    /// Send a message. Safe to call concurrently with the read path.
    async fn send(&self, message: Message) -> Result<(), Error>;

    /// Release resources and fire the close handler (at most once)
    async fn close(&self) -> Result<(), Error>;

    fn set_message_handler(&self, handler: MessageHandler);

    fn set_error_handler(&self, handler: ErrorHandler);

    fn set_close_handler(&self, handler: CloseHandler);
}

/// Callback slots shared by the transport implementations
#[derive(Default)]
pub struct TransportHandlers {
    on_message: RwLock<Option<MessageHandler>>,
    on_error: RwLock<Option<ErrorHandler>>,
    on_close: RwLock<Option<CloseHandler>>,
    closed: AtomicBool,
}

impl TransportHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_message_handler(&self, handler: MessageHandler) {
        *self.on_message.write() = Some(handler);
    }

    pub fn set_error_handler(&self, handler: ErrorHandler) {
        *self.on_error.write() = Some(handler);
    }

    pub fn set_close_handler(&self, handler: CloseHandler) {
        *self.on_close.write() = Some(handler);
    }

    /// Hand a decoded message to the message handler
    pub fn dispatch_message(&self, message: Message) {
        let handler = self.on_message.read().clone();
        match handler {
            Some(handler) => handler(message),
            None => tracing::warn!("dropping inbound message, no handler registered"),
        }
    }

    /// Report a failure to the error handler, or log it when none is set
    pub fn report_error(&self, error: Error) {
        let handler = self.on_error.read().clone();
        match handler {
            Some(handler) => handler(error),
            None => tracing::error!(error = %error, "transport error"),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark the transport closed and fire the close handler.
    ///
    /// Returns `false` when the transport was already closed, in which case nothing runs.
    pub fn close_once(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let handler = self.on_close.read().clone();
        if let Some(handler) = handler {
            handler();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Notification;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn close_handler_fires_once() {
        let handlers = TransportHandlers::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        handlers.set_close_handler(Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(handlers.close_once());
        assert!(!handlers.close_once());
        assert!(handlers.is_closed());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatch_reaches_message_handler() {
        let handlers = TransportHandlers::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = seen.clone();
        handlers.set_message_handler(Arc::new(move |m: Message| {
            s.lock().push(m.method().map(str::to_string));
        }));

        handlers.dispatch_message(Message::Notification(Notification::new("a", None)));
        assert_eq!(*seen.lock(), vec![Some("a".to_string())]);
    }
}
