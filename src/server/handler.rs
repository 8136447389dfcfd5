//! Handler traits for tools, resources, prompts and notifications, plus the per-request
//! context handlers receive and the bounded queue notifications go through.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::{collections::HashMap, future::Future};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    protocol::{Notification, RequestId},
    types::{CallToolResult, GetPromptResult, ProgressToken, ResourceContents},
};

/// A notification waiting to be delivered to one session
#[derive(Debug, Clone)]
pub struct ServerNotification {
    /// Target session, `None` for the single anonymous connection (stdio, stateless HTTP)
    pub session_id: Option<String>,
    pub notification: Notification,
}

/// Where an inbound message came from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageContext {
    pub session_id: Option<String>,
}

impl MessageContext {
    /// The single connection of a stdio or stateless HTTP server
    pub fn anonymous() -> Self {
        Self { session_id: None }
    }

    pub fn session(id: impl Into<String>) -> Self {
        Self {
            session_id: Some(id.into()),
        }
    }
}

/// Bounded queue shared by everything that emits server notifications
#[derive(Debug, Clone)]
pub(crate) struct NotificationQueue {
    tx: mpsc::Sender<ServerNotification>,
}

impl NotificationQueue {
    pub(crate) fn new(tx: mpsc::Sender<ServerNotification>) -> Self {
        Self { tx }
    }

    /// Enqueue without waiting; a full queue is reported, never blocks
    pub(crate) fn push(&self, session_id: Option<String>, notification: Notification) -> Result<()> {
        let item = ServerNotification {
            session_id,
            notification,
        };
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item)) => {
                tracing::warn!(
                    method = %item.notification.method,
                    session_id = ?item.session_id,
                    "notification queue full, dropping notification"
                );
                Err(Error::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(Error::ConnectionClosed),
        }
    }
}

/// Per-request context handed to tool, resource and prompt handlers
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub session_id: Option<String>,
    /// Cancelled when the client sends `notifications/cancelled` for this request or its
    /// session goes away
    pub cancellation: CancellationToken,
    /// Present when the client asked for progress via `_meta.progressToken`
    pub progress_token: Option<ProgressToken>,
    queue: NotificationQueue,
}

impl RequestContext {
    pub(crate) fn new(
        request_id: RequestId,
        session_id: Option<String>,
        cancellation: CancellationToken,
        progress_token: Option<ProgressToken>,
        queue: NotificationQueue,
    ) -> Self {
        Self {
            request_id,
            session_id,
            cancellation,
            progress_token,
            queue,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Send a `$/progress` notification to the caller.
    ///
    /// A no-op when the request carried no progress token.
    pub fn report_progress(&self, progress: i64, total: i64) -> Result<()> {
        let Some(token) = &self.progress_token else {
            return Ok(());
        };
        let params = json!({
            "progressToken": token,
            "progress": progress,
            "total": total,
        });
        self.queue.push(
            self.session_id.clone(),
            Notification::new("$/progress", Some(params)),
        )
    }
}

/// Executes a tool call
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, ctx: RequestContext, arguments: Value) -> Result<CallToolResult>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CallToolResult>> + Send + 'static,
{
    async fn call(&self, ctx: RequestContext, arguments: Value) -> Result<CallToolResult> {
        (self)(ctx, arguments).await
    }
}

/// Produces the contents of a resource.
///
/// `variables` holds the placeholder values when the resource was matched through a
/// template, and is empty for directly registered resources.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn read(
        &self,
        ctx: RequestContext,
        uri: String,
        variables: HashMap<String, String>,
    ) -> Result<Vec<ResourceContents>>;
}

#[async_trait]
impl<F, Fut> ResourceHandler for F
where
    F: Fn(RequestContext, String, HashMap<String, String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<ResourceContents>>> + Send + 'static,
{
    async fn read(
        &self,
        ctx: RequestContext,
        uri: String,
        variables: HashMap<String, String>,
    ) -> Result<Vec<ResourceContents>> {
        (self)(ctx, uri, variables).await
    }
}

/// Renders a prompt
#[async_trait]
pub trait PromptHandler: Send + Sync {
    async fn get(
        &self,
        ctx: RequestContext,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult>;
}

#[async_trait]
impl<F, Fut> PromptHandler for F
where
    F: Fn(RequestContext, HashMap<String, String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<GetPromptResult>> + Send + 'static,
{
    async fn get(
        &self,
        ctx: RequestContext,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult> {
        (self)(ctx, arguments).await
    }
}

/// Reacts to a client notification
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, ctx: MessageContext, params: Option<Value>) -> Result<()>;
}

#[async_trait]
impl<F, Fut> NotificationHandler for F
where
    F: Fn(MessageContext, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: MessageContext, params: Option<Value>) -> Result<()> {
        (self)(ctx, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn progress_is_only_sent_with_a_token() {
        let (tx, mut rx) = mpsc::channel(4);
        let queue = NotificationQueue::new(tx);

        let silent = RequestContext::new(
            RequestId::Number(1),
            None,
            CancellationToken::new(),
            None,
            queue.clone(),
        );
        silent.report_progress(1, 2).unwrap();
        assert!(rx.try_recv().is_err());

        let ctx = RequestContext::new(
            RequestId::Number(2),
            Some("s1".to_string()),
            CancellationToken::new(),
            Some(RequestId::from("tok")),
            queue,
        );
        ctx.report_progress(1, 2).unwrap();
        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.session_id.as_deref(), Some("s1"));
        assert_eq!(sent.notification.method, "$/progress");
        assert_eq!(
            sent.notification.params.unwrap(),
            json!({"progressToken": "tok", "progress": 1, "total": 2})
        );
    }

    #[test]
    fn full_queue_is_an_error_not_a_wait() {
        let (tx, _rx) = mpsc::channel(1);
        let queue = NotificationQueue::new(tx);
        queue.push(None, Notification::new("a", None)).unwrap();
        assert!(matches!(
            queue.push(None, Notification::new("b", None)),
            Err(Error::QueueFull)
        ));
    }
}
