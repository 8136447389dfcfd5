//! Line delimited stream transport
//!
//! Speaks newline delimited JSON over any pair of async byte streams. This covers:
//! - a server process talking over its own stdin/stdout
//! - a client driving a spawned child process over the child's stdio
//! - in-memory pipes for tests
//!
//! Incoming bytes accumulate in a growable buffer; each complete line is decoded on its
//! own and partial lines stay buffered across reads. Every outbound message is written as
//! one line terminated by a single `\n`.

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    process::Command,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::Error,
    process::ProcessManager,
    transport::{CloseHandler, ErrorHandler, Message, MessageHandler, Transport, TransportHandlers},
};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct StreamTransport {
    reader: Mutex<Option<BoxedReader>>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    handlers: Arc<TransportHandlers>,
    shutdown: CancellationToken,
    process: tokio::sync::Mutex<Option<ProcessManager>>,
}

impl StreamTransport {
    /// Creates a transport reading from `reader` and writing to `writer`
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Mutex::new(Some(Box::new(reader))),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            handlers: Arc::new(TransportHandlers::new()),
            shutdown: CancellationToken::new(),
            process: tokio::sync::Mutex::new(None),
        }
    }

    /// Transport over this process' own stdin/stdout
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Spawns `command` and speaks the protocol over its stdin/stdout.
    ///
    /// The child is killed when the transport closes.
    pub fn spawn(command: Command) -> Result<Self, Error> {
        let mut manager = ProcessManager::new();
        let (stdin, stdout) = manager.start_process(command)?;
        tracing::debug!(pid = ?manager.id(), "spawned server process");
        let mut transport = Self::new(stdout, stdin);
        transport.process = tokio::sync::Mutex::new(Some(manager));
        Ok(transport)
    }

    async fn read_loop(
        mut reader: BoxedReader,
        handlers: Arc<TransportHandlers>,
        shutdown: CancellationToken,
    ) {
        let mut buffer = BytesMut::with_capacity(8 * 1024);
        loop {
            let read = tokio::select! {
                _ = shutdown.cancelled() => break,
                read = reader.read_buf(&mut buffer) => read,
            };
            match read {
                Ok(0) => {
                    if !buffer.is_empty() {
                        let rest = buffer.split();
                        process_line(&rest, &handlers);
                    }
                    tracing::debug!("stream reached end of input");
                    break;
                }
                Ok(_) => {
                    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let line = buffer.split_to(pos + 1);
                        process_line(&line[..pos], &handlers);
                    }
                }
                Err(e) => {
                    handlers.report_error(Error::Io(e));
                    break;
                }
            }
        }
        handlers.close_once();
    }
}

fn process_line(line: &[u8], handlers: &TransportHandlers) {
    let line = line.trim_ascii();
    if line.is_empty() {
        return;
    }
    match Message::from_slice(line) {
        Ok(message) => handlers.dispatch_message(message),
        Err(e) => {
            tracing::debug!(line = %String::from_utf8_lossy(line), "failed to decode line");
            handlers.report_error(e);
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    /// Starts the background read loop. Fails if called twice.
    async fn start(&self) -> Result<(), Error> {
        let reader = self
            .reader
            .lock()
            .take()
            .ok_or_else(|| Error::Transport("stream transport already started".to_string()))?;
        tokio::spawn(Self::read_loop(
            reader,
            self.handlers.clone(),
            self.shutdown.clone(),
        ));
        Ok(())
    }

    /// Writes the message as a single line and flushes
    async fn send(&self, message: Message) -> Result<(), Error> {
        if self.handlers.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        let written: std::io::Result<()> = async {
            writer.write_all(&line).await?;
            writer.flush().await
        }
        .await;
        drop(writer);

        if let Err(e) = written {
            // a broken writer ends the connection for every caller, not just this one
            self.handlers
                .report_error(Error::Transport(format!("write failed: {}", e)));
            self.shutdown.cancel();
            self.handlers.close_once();
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// Stops reading, shuts the writer down and kills a spawned child if there is one
    async fn close(&self) -> Result<(), Error> {
        if self.handlers.is_closed() {
            return Ok(());
        }
        self.shutdown.cancel();
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(error = %e, "error shutting down writer");
            }
        }
        if let Some(mut process) = self.process.lock().await.take() {
            process.shutdown().await;
        }
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
