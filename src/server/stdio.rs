//! Line-delimited JSON server loop over stdin/stdout or any pair of byte streams.

use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{mpsc, Mutex},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use super::{MessageContext, Server, ServerNotification};
use crate::{error::Result, protocol::Message};

type SharedWriter<W> = Arc<Mutex<W>>;

/// How long cancelled handlers get to finish after shutdown before they are aborted
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Serves one anonymous session over line-delimited JSON on a pair of byte streams.
///
/// stdout carries protocol frames only; logs belong on stderr.
pub struct StdioServer {
    server: Server,
}

impl StdioServer {
    pub fn new(server: Server) -> Self {
        Self { server }
    }

    /// Serve on the process's stdin/stdout until EOF or ctrl-c
    pub async fn serve(self) -> Result<()> {
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received shutdown signal");
                signal.cancel();
            }
        });
        self.serve_streams(tokio::io::stdin(), tokio::io::stdout(), shutdown)
            .await
    }

    /// Serve until the reader hits EOF or `shutdown` is cancelled.
    ///
    /// Requests are handled concurrently and every reply is written as one line. On EOF the
    /// outstanding requests finish first. On shutdown they are cancelled, and any still
    /// running after [`SHUTDOWN_GRACE`] are aborted. Queued notifications are flushed
    /// before returning.
    pub async fn serve_streams<R, W>(
        self,
        reader: R,
        writer: W,
        shutdown: CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer: SharedWriter<W> = Arc::new(Mutex::new(writer));
        let stop_notifications = CancellationToken::new();
        let notifier = match self.server.take_notification_receiver() {
            Some(rx) => Some(tokio::spawn(write_notifications(
                rx,
                writer.clone(),
                stop_notifications.clone(),
            ))),
            None => {
                tracing::warn!("notification receiver already taken, notifications will not be written");
                None
            }
        };

        let mut lines = BufReader::new(reader).lines();
        let mut tasks = JoinSet::new();
        let ctx = MessageContext::anonymous();
        let mut result = Ok(());
        let mut interrupted = false;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("stdio server shutting down");
                    self.server.close_session(None);
                    interrupted = true;
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "request task failed");
                    }
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        let server = self.server.clone();
                        let writer = writer.clone();
                        let ctx = ctx.clone();
                        tasks.spawn(async move {
                            if let Some(reply) = server.handle_message(&ctx, line.as_bytes()).await {
                                if let Err(e) = write_frame(&writer, &reply).await {
                                    tracing::error!(error = %e, "failed to write reply");
                                }
                            }
                        });
                    }
                    Ok(None) => {
                        tracing::debug!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to read from stdin");
                        result = Err(e.into());
                        break;
                    }
                }
            }
        }

        if interrupted {
            let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                tracing::warn!(remaining = tasks.len(), "aborting handlers that ignored cancellation");
                tasks.abort_all();
            }
        }
        while tasks.join_next().await.is_some() {}
        stop_notifications.cancel();
        if let Some(notifier) = notifier {
            let _ = notifier.await;
        }
        self.server.close_session(None);
        result
    }
}

async fn write_notifications<W>(
    mut rx: mpsc::Receiver<ServerNotification>,
    writer: SharedWriter<W>,
    stop: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => {
                    let message = Message::Notification(item.notification);
                    if let Err(e) = write_frame(&writer, &message).await {
                        tracing::error!(error = %e, "failed to write notification");
                    }
                }
                None => return,
            }
        }
    }

    while let Ok(item) = rx.try_recv() {
        let message = Message::Notification(item.notification);
        if write_frame(&writer, &message).await.is_err() {
            break;
        }
    }
}

async fn write_frame<W>(writer: &SharedWriter<W>, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = serde_json::to_vec(message)?;
    frame.push(b'\n');
    let mut writer = writer.lock().await;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::RequestContext;
    use crate::types::{CallToolResult, Tool};
    use serde_json::{json, Value};
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    async fn next_json<R: AsyncRead + Unpin>(lines: &mut tokio::io::Lines<BufReader<R>>) -> Value {
        let line = lines.next_line().await.unwrap().expect("a line");
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn answers_requests_and_writes_notifications() {
        let server = Server::builder("stdio-test", "1.0").build();
        let (mut input, server_in) = duplex(4096);
        let (server_out, client_out) = duplex(4096);
        let shutdown = CancellationToken::new();

        let serving = tokio::spawn(StdioServer::new(server.clone()).serve_streams(
            server_in,
            server_out,
            shutdown.clone(),
        ));
        let mut output = BufReader::new(client_out).lines();

        input
            .write_all(
                b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\",\"params\":{\"protocolVersion\":\"2024-11-05\",\"capabilities\":{},\"clientInfo\":{\"name\":\"t\",\"version\":\"1\"}}}\n",
            )
            .await
            .unwrap();
        let reply = next_json(&mut output).await;
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["result"]["serverInfo"]["name"], "stdio-test");

        server
            .add_tool(Tool::new("echo", "echo"), |_ctx: RequestContext, _args: Value| async move {
                Ok(CallToolResult::text("hi"))
            })
            .unwrap();
        let notification = next_json(&mut output).await;
        assert_eq!(notification, json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}));

        input.write_all(b"\n{not json\n").await.unwrap();
        let reply = next_json(&mut output).await;
        assert_eq!(reply["error"]["code"], -32700);

        shutdown.cancel();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_aborts_handlers_that_ignore_cancellation() {
        let server = Server::builder("stdio-test", "1.0").build();
        server
            .add_tool(Tool::new("stuck", "ignores cancellation"), |_ctx: RequestContext, _args: Value| async move {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(CallToolResult::text("never"))
            })
            .unwrap();
        let (mut input, server_in) = duplex(4096);
        let (server_out, client_out) = duplex(4096);
        let shutdown = CancellationToken::new();
        let serving = tokio::spawn(StdioServer::new(server).serve_streams(
            server_in,
            server_out,
            shutdown.clone(),
        ));
        let mut output = BufReader::new(client_out).lines();

        input
            .write_all(
                b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\",\"params\":{\"protocolVersion\":\"2024-11-05\",\"capabilities\":{},\"clientInfo\":{\"name\":\"t\",\"version\":\"1\"}}}\n",
            )
            .await
            .unwrap();
        assert_eq!(next_json(&mut output).await["id"], 1);
        input
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"tools/call\",\"params\":{\"name\":\"stuck\"}}\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        let finished = tokio::time::timeout(SHUTDOWN_GRACE * 3, serving)
            .await
            .expect("serve_streams should return after the grace period");
        finished.unwrap().unwrap();
    }

    #[tokio::test]
    async fn eof_finishes_outstanding_requests() {
        let server = Server::builder("stdio-test", "1.0").build();
        let (mut client_in, server_in) = duplex(4096);
        let (server_out, client_out) = duplex(4096);

        client_in
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":\"p\",\"method\":\"ping\"}\n")
            .await
            .unwrap();
        drop(client_in);

        StdioServer::new(server)
            .serve_streams(server_in, server_out, CancellationToken::new())
            .await
            .unwrap();

        let mut output = BufReader::new(client_out).lines();
        let reply = next_json(&mut output).await;
        assert_eq!(reply, json!({"jsonrpc": "2.0", "id": "p", "result": {}}));
    }
}
