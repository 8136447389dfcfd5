//! MCP client
//!
//! [`Client`] wraps a [`Protocol`] with typed verbs for every server method. Requests
//! and notifications the server sends to the client are handed to a [`ClientHandler`].
//!
//! ```no_run
//! use mcp_rpc::client::Client;
//! use mcp_rpc::types::Implementation;
//!
//! # async fn run() -> Result<(), mcp_rpc::Error> {
//! let client = Client::sse("http://localhost:8080/sse").await?;
//! client
//!     .initialize(Implementation::new("example-client", "0.1.0"), None)
//!     .await?;
//! for tool in client.list_all_tools().await? {
//!     println!("{}", tool.name);
//! }
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc};
use tokio::process::Command;

use crate::{
    error::{Error, ErrorCode, Result},
    protocol::{
        Notification, Protocol, ProtocolOptions, Request, RequestOptions,
        LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
    },
    transport::{http::HttpTransport, sse::SseTransport, stdio::StreamTransport, Transport},
    types::{
        CallToolParams, CallToolResult, ClientCapabilities, Cursor, GetPromptParams,
        GetPromptResult, Implementation, InitializeParams, InitializeResult, ListPromptsResult,
        ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, LoggingLevel,
        LoggingMessage, PaginatedParams, Prompt, ReadResourceResult, Resource, ResourceUriParams,
        ServerCapabilities, SetLevelParams, Tool,
    },
};

/// Trait for implementing MCP client handlers
#[async_trait]
pub trait ClientHandler: Send + Sync {
    /// Called once when the connection closes
    async fn shutdown(&self) -> Result<()>;

    /// Handle requests
    async fn handle_request(&self, method: String, params: Option<Value>) -> Result<Value>;

    /// Handle notifications
    async fn handle_notification(&self, method: String, params: Option<Value>) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct DefaultClientHandler;

#[async_trait]
impl ClientHandler for DefaultClientHandler {
    /// Handle an incoming request
    async fn handle_request(&self, method: String, _params: Option<Value>) -> Result<Value> {
        match method.as_str() {
            "ping" => Ok(json!({})),
            _ => Err(Error::protocol(
                ErrorCode::MethodNotFound,
                format!("Method not found: {}", method),
            )),
        }
    }

    /// Handle an incoming notification
    async fn handle_notification(&self, method: String, params: Option<Value>) -> Result<()> {
        match method.as_str() {
            "notifications/message" => {
                if let Some(p) = params {
                    let message: LoggingMessage = serde_json::from_value(p)?;
                    let logger = message.logger.as_deref().unwrap_or("server");
                    match message.level {
                        LoggingLevel::Debug => tracing::debug!(logger, "{}", message.data),
                        LoggingLevel::Info | LoggingLevel::Notice => {
                            tracing::info!(logger, "{}", message.data)
                        }
                        LoggingLevel::Warning => tracing::warn!(logger, "{}", message.data),
                        _ => tracing::error!(logger, level = ?message.level, "{}", message.data),
                    }
                }
                Ok(())
            }
            "notifications/resources/updated" => {
                if let Some(p) = params {
                    let update: ResourceUriParams = serde_json::from_value(p)?;
                    tracing::debug!(uri = %update.uri, "resource updated");
                }
                Ok(())
            }
            "notifications/tools/list_changed"
            | "notifications/resources/list_changed"
            | "notifications/prompts/list_changed" => {
                tracing::debug!(method = %method, "server list changed");
                Ok(())
            }
            _ => {
                tracing::debug!(method = %method, "unhandled notification");
                Ok(())
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        tracing::debug!("Client shutting down");
        Ok(())
    }
}

/// MCP client state
#[derive(Clone)]
pub struct Client {
    protocol: Protocol,
    initialize_result: Arc<RwLock<Option<InitializeResult>>>,
}

impl Client {
    /// Connect over an already built transport
    pub async fn connect(
        transport: Arc<dyn Transport>,
        handler: Option<Arc<dyn ClientHandler>>,
    ) -> Result<Self> {
        Self::connect_with_options(transport, handler, ProtocolOptions::default()).await
    }

    pub async fn connect_with_options(
        transport: Arc<dyn Transport>,
        handler: Option<Arc<dyn ClientHandler>>,
        options: ProtocolOptions,
    ) -> Result<Self> {
        let handler = handler.unwrap_or_else(|| Arc::new(DefaultClientHandler));
        let protocol = Protocol::new(options);

        let h = handler.clone();
        protocol.set_fallback_request_handler(move |req: Request, _extra| {
            let h = h.clone();
            async move { h.handle_request(req.method, req.params).await }
        });
        let h = handler.clone();
        protocol.set_fallback_notification_handler(move |n: Notification| {
            let h = h.clone();
            async move { h.handle_notification(n.method, n.params).await }
        });
        let h = handler;
        protocol.set_close_handler(Arc::new(move || {
            let h = h.clone();
            tokio::spawn(async move {
                if let Err(e) = h.shutdown().await {
                    tracing::warn!(error = %e, "client handler shutdown failed");
                }
            });
        }));

        protocol.connect(transport).await?;
        Ok(Self {
            protocol,
            initialize_result: Arc::new(RwLock::new(None)),
        })
    }

    /// Spawn a server process and talk to it over its stdin/stdout
    pub async fn spawn(command: Command) -> Result<Self> {
        let transport = StreamTransport::spawn(command)?;
        Self::connect(Arc::new(transport), None).await
    }

    /// Connect to a server's SSE endpoint, e.g. `http://localhost:8080/sse`
    pub async fn sse(url: &str) -> Result<Self> {
        let transport = SseTransport::new(url)?;
        Self::connect(Arc::new(transport), None).await
    }

    /// Talk to a stateless HTTP endpoint, one POST per request
    pub async fn http(url: &str) -> Result<Self> {
        let transport = HttpTransport::new(url)?;
        Self::connect(Arc::new(transport), None).await
    }

    /// The underlying correlation engine
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Initialize the client with the latest protocol version
    pub async fn initialize(
        &self,
        implementation: Implementation,
        capabilities: Option<ClientCapabilities>,
    ) -> Result<InitializeResult> {
        self.initialize_with_version(LATEST_PROTOCOL_VERSION, implementation, capabilities)
            .await
    }

    /// Run the `initialize` handshake asking for a specific protocol version
    pub async fn initialize_with_version(
        &self,
        protocol_version: &str,
        implementation: Implementation,
        capabilities: Option<ClientCapabilities>,
    ) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: protocol_version.to_string(),
            capabilities: capabilities.unwrap_or_default(),
            client_info: implementation,
        };
        tracing::debug!(version = %protocol_version, "initializing client");
        let result: InitializeResult = self
            .call("initialize", Some(serde_json::to_value(params)?))
            .await?;

        if result.protocol_version != protocol_version {
            tracing::warn!(
                requested = %protocol_version,
                negotiated = %result.protocol_version,
                "server answered with a different protocol version"
            );
        }
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            return Err(Error::protocol(
                ErrorCode::InvalidRequest,
                format!("unsupported protocol version {}", result.protocol_version),
            ));
        }

        *self.initialize_result.write() = Some(result.clone());
        // Send initialized notification
        self.notify("initialized", None).await?;
        Ok(result)
    }

    /// Capabilities the server advertised during `initialize`
    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.initialize_result
            .read()
            .as_ref()
            .map(|r| r.capabilities.clone())
    }

    pub fn server_info(&self) -> Option<Implementation> {
        self.initialize_result
            .read()
            .as_ref()
            .map(|r| r.server_info.clone())
    }

    pub fn instructions(&self) -> Option<String> {
        self.initialize_result
            .read()
            .as_ref()
            .and_then(|r| r.instructions.clone())
    }

    /// Send a request to the server and wait for the raw result
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.protocol
            .request(method, params, RequestOptions::default())
            .await
    }

    /// Like [`Client::request`] with a timeout, progress callback or cancellation token
    pub async fn request_with(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value> {
        self.protocol.request(method, params, options).await
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> Result<R> {
        let value = self.request(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a notification to the server.
    ///
    /// `method` is relative to `notifications/`, so `notify("initialized", None)` sends
    /// `notifications/initialized`.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let path = format!("notifications/{method}");
        self.protocol.notification(&path, params).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.request("ping", None).await?;
        Ok(())
    }

    pub async fn list_tools(&self, cursor: Option<Cursor>) -> Result<ListToolsResult> {
        self.call("tools/list", Some(page_params(cursor)?)).await
    }

    /// Every tool, following `nextCursor` until the server runs out
    pub async fn list_all_tools(&self) -> Result<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.list_tools(cursor).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        self.call_tool_with(name, arguments, RequestOptions::default())
            .await
    }

    pub async fn call_tool_with(
        &self,
        name: &str,
        arguments: Value,
        options: RequestOptions,
    ) -> Result<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let value = self
            .request_with("tools/call", Some(serde_json::to_value(params)?), options)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn list_resources(&self, cursor: Option<Cursor>) -> Result<ListResourcesResult> {
        self.call("resources/list", Some(page_params(cursor)?)).await
    }

    pub async fn list_all_resources(&self) -> Result<Vec<Resource>> {
        let mut resources = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.list_resources(cursor).await?;
            resources.extend(page.resources);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(resources),
            }
        }
    }

    pub async fn list_resource_templates(
        &self,
        cursor: Option<Cursor>,
    ) -> Result<ListResourceTemplatesResult> {
        self.call("resources/templates/list", Some(page_params(cursor)?))
            .await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        self.call("resources/read", Some(json!({ "uri": uri }))).await
    }

    pub async fn subscribe(&self, uri: &str) -> Result<()> {
        self.request("resources/subscribe", Some(json!({ "uri": uri })))
            .await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, uri: &str) -> Result<()> {
        self.request("resources/unsubscribe", Some(json!({ "uri": uri })))
            .await?;
        Ok(())
    }

    pub async fn list_prompts(&self, cursor: Option<Cursor>) -> Result<ListPromptsResult> {
        self.call("prompts/list", Some(page_params(cursor)?)).await
    }

    pub async fn list_all_prompts(&self) -> Result<Vec<Prompt>> {
        let mut prompts = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.list_prompts(cursor).await?;
            prompts.extend(page.prompts);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(prompts),
            }
        }
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult> {
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        self.call("prompts/get", Some(serde_json::to_value(params)?))
            .await
    }

    pub async fn set_log_level(&self, level: LoggingLevel) -> Result<()> {
        let params = serde_json::to_value(SetLevelParams { level })?;
        self.request("logging/setLevel", Some(params)).await?;
        Ok(())
    }

    /// Close the client connection
    pub async fn close(&self) -> Result<()> {
        self.protocol.close().await
    }
}

fn page_params(cursor: Option<Cursor>) -> Result<Value> {
    Ok(serde_json::to_value(PaginatedParams { cursor })?)
}
