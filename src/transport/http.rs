//! Stateless HTTP client transport
//!
//! Every message is one `POST` to a fixed URL. A non-empty response body is decoded as
//! the reply and delivered to the message handler before `send` returns, so the
//! correlation engine sees it like any other inbound message. There is no push channel:
//! server-initiated notifications and progress are not available over this transport.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::sync::Arc;
use url::Url;

use crate::{
    error::Error,
    transport::{CloseHandler, ErrorHandler, Message, MessageHandler, Transport, TransportHandlers},
};

pub struct HttpTransport {
    url: Url,
    client: reqwest::Client,
    handlers: Arc<TransportHandlers>,
}

impl HttpTransport {
    pub fn new(url: &str) -> Result<Self, Error> {
        let url = Url::parse(url).map_err(|e| Error::Transport(format!("invalid url {url}: {e}")))?;
        Ok(Self {
            url,
            client: reqwest::Client::new(),
            handlers: Arc::new(TransportHandlers::new()),
        })
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    /// Nothing to open; each send is its own connection
    async fn start(&self) -> Result<(), Error> {
        if self.handlers.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<(), Error> {
        if self.handlers.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let response = self
            .client
            .post(self.url.clone())
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(&message)?)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            if status.is_success() {
                return Ok(());
            }
            return Err(Error::Transport(format!(
                "server responded with status {}",
                status
            )));
        }

        // error replies arrive with 4xx/5xx but still carry a JSON-RPC payload
        match Message::from_slice(&body) {
            Ok(reply) => {
                self.handlers.dispatch_message(reply);
                Ok(())
            }
            Err(e) if status.is_success() => Err(e),
            Err(_) => Err(Error::Transport(format!(
                "server responded with status {}: {}",
                status,
                String::from_utf8_lossy(&body)
            ))),
        }
    }

    async fn close(&self) -> Result<(), Error> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_url() {
        assert!(matches!(
            HttpTransport::new("not a url"),
            Err(Error::Transport(_))
        ));
    }

    #[tokio::test]
    async fn closed_transport_refuses_to_send() {
        let transport = HttpTransport::new("http://127.0.0.1:1/mcp").unwrap();
        transport.close().await.unwrap();
        let err = transport
            .send(Message::Notification(crate::protocol::Notification::new(
                "x", None,
            )))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert!(transport.start().await.is_err());
    }
}
