//! MCP server router
//!
//! [`Server`] owns the tool, resource, resource template and prompt registries and turns
//! one raw JSON-RPC payload into at most one reply via [`Server::handle_message`]. The
//! wrappers in [`stdio`], [`sse`] and [`http`] own the I/O and feed bytes in.
//!
//! Method dispatch goes through a fixed table built once in [`ServerBuilder::build`].
//! Methods whose capability category was not enabled reply `method not found`, and every
//! method except `initialize` and `ping` is refused until the connection initialized.
//!
//! Notifications (list changes, progress, log messages, resource updates) are pushed onto
//! a bounded queue; the transport wrapper drains it with
//! [`Server::take_notification_receiver`] and routes each item to its session.

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, ErrorCode, Result},
    protocol::{
        ErrorResponse, Message, Notification, RequestId, Response, ResponseError,
        JSONRPC_VERSION, LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
    },
    types::{
        CallToolParams, CallToolResult, CancelledNotification, GetPromptParams, Implementation,
        InitializeParams, InitializeResult, ListPromptsResult, ListResourceTemplatesResult,
        ListResourcesResult, ListToolsResult, LoggingLevel, LoggingMessage, PaginatedParams,
        Prompt, PromptsCapability, ReadResourceResult, Resource, ResourceTemplate,
        ResourceUriParams, ResourcesCapability, ServerCapabilities, SetLevelParams, Tool,
        ToolsCapability,
    },
};

mod handler;
pub mod http;
pub mod registry;
pub mod sse;
pub mod stdio;
pub mod template;

pub use handler::{
    MessageContext, NotificationHandler, PromptHandler, RequestContext, ResourceHandler,
    ServerNotification, ToolHandler,
};
use handler::NotificationQueue;
use registry::Registry;
use template::UriTemplate;

/// Default capacity of the outbound notification queue
pub const DEFAULT_NOTIFICATION_QUEUE: usize = 100;

type RouteResult = std::result::Result<Value, ResponseError>;
type RouteFn = for<'a> fn(&'a Server, Call) -> BoxFuture<'a, RouteResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capability {
    Tools,
    Resources,
    ResourceSubscribe,
    Prompts,
    Logging,
}

struct Route {
    capability: Option<Capability>,
    handler: RouteFn,
}

/// Arguments of one routed request
struct Call {
    ctx: RequestContext,
    params: Option<Value>,
}

struct ToolEntry {
    tool: Tool,
    handler: Arc<dyn ToolHandler>,
}

struct ResourceEntry {
    resource: Resource,
    handler: Arc<dyn ResourceHandler>,
}

struct TemplateEntry {
    template: ResourceTemplate,
    matcher: UriTemplate,
    handler: Arc<dyn ResourceHandler>,
}

struct PromptEntry {
    prompt: Prompt,
    handler: Arc<dyn PromptHandler>,
}

#[derive(Debug, Default)]
struct SessionState {
    initialized: bool,
    subscriptions: HashSet<String>,
}

type SessionKey = Option<String>;

/// Unregisters an in-flight request even when its future is dropped mid-way, as happens
/// when an HTTP client disconnects
struct InFlight<'a> {
    inner: &'a ServerInner,
    key: (SessionKey, RequestId),
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.key);
    }
}

struct ServerInner {
    info: Implementation,
    instructions: Option<String>,
    capabilities: ServerCapabilities,
    pagination_limit: Option<usize>,
    routes: HashMap<&'static str, Route>,
    tools: RwLock<Registry<ToolEntry>>,
    resources: RwLock<Registry<ResourceEntry>>,
    templates: RwLock<Vec<TemplateEntry>>,
    prompts: RwLock<Registry<PromptEntry>>,
    notification_handlers: RwLock<HashMap<String, Arc<dyn NotificationHandler>>>,
    sessions: RwLock<HashMap<SessionKey, SessionState>>,
    in_flight: Mutex<HashMap<(SessionKey, RequestId), CancellationToken>>,
    log_level: RwLock<LoggingLevel>,
    queue: NotificationQueue,
    notifications: Mutex<Option<mpsc::Receiver<ServerNotification>>>,
}

/// Builder for [`Server`]; all configuration happens here, before serving
#[derive(Debug, Clone)]
pub struct ServerBuilder {
    info: Implementation,
    instructions: Option<String>,
    tools: Option<ToolsCapability>,
    resources: Option<ResourcesCapability>,
    prompts: Option<PromptsCapability>,
    logging: bool,
    pagination_limit: Option<usize>,
    notification_queue: usize,
}

impl ServerBuilder {
    /// A builder with tools enabled and every other category disabled
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            info: Implementation::new(name, version),
            instructions: None,
            tools: Some(ToolsCapability { list_changed: true }),
            resources: None,
            prompts: None,
            logging: false,
            pagination_limit: None,
            notification_queue: DEFAULT_NOTIFICATION_QUEUE,
        }
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_tool_capabilities(mut self, list_changed: bool) -> Self {
        self.tools = Some(ToolsCapability { list_changed });
        self
    }

    pub fn without_tools(mut self) -> Self {
        self.tools = None;
        self
    }

    pub fn with_resource_capabilities(mut self, subscribe: bool, list_changed: bool) -> Self {
        self.resources = Some(ResourcesCapability {
            subscribe,
            list_changed,
        });
        self
    }

    pub fn with_prompt_capabilities(mut self, list_changed: bool) -> Self {
        self.prompts = Some(PromptsCapability { list_changed });
        self
    }

    pub fn with_logging(mut self) -> Self {
        self.logging = true;
        self
    }

    /// Page size for `tools/list`, `resources/list` and `prompts/list`
    pub fn with_pagination_limit(mut self, limit: usize) -> Self {
        self.pagination_limit = Some(limit).filter(|l| *l > 0);
        self
    }

    pub fn with_notification_queue(mut self, capacity: usize) -> Self {
        self.notification_queue = capacity.max(1);
        self
    }

    pub fn build(self) -> Server {
        let capabilities = ServerCapabilities {
            experimental: None,
            logging: self.logging.then(|| json!({})),
            prompts: self.prompts,
            resources: self.resources,
            tools: self.tools,
        };
        let (tx, rx) = mpsc::channel(self.notification_queue);

        Server {
            inner: Arc::new(ServerInner {
                info: self.info,
                instructions: self.instructions,
                capabilities,
                pagination_limit: self.pagination_limit,
                routes: routes(),
                tools: RwLock::new(Registry::new()),
                resources: RwLock::new(Registry::new()),
                templates: RwLock::new(Vec::new()),
                prompts: RwLock::new(Registry::new()),
                notification_handlers: RwLock::new(HashMap::new()),
                sessions: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                log_level: RwLock::new(LoggingLevel::Debug),
                queue: NotificationQueue::new(tx),
                notifications: Mutex::new(Some(rx)),
            }),
        }
    }
}

fn routes() -> HashMap<&'static str, Route> {
    let table: [(&'static str, Option<Capability>, RouteFn); 12] = [
        ("initialize", None, Server::route_initialize),
        ("ping", None, Server::route_ping),
        ("tools/list", Some(Capability::Tools), Server::route_list_tools),
        ("tools/call", Some(Capability::Tools), Server::route_call_tool),
        ("resources/list", Some(Capability::Resources), Server::route_list_resources),
        (
            "resources/templates/list",
            Some(Capability::Resources),
            Server::route_list_templates,
        ),
        ("resources/read", Some(Capability::Resources), Server::route_read_resource),
        (
            "resources/subscribe",
            Some(Capability::ResourceSubscribe),
            Server::route_subscribe,
        ),
        (
            "resources/unsubscribe",
            Some(Capability::ResourceSubscribe),
            Server::route_unsubscribe,
        ),
        ("prompts/list", Some(Capability::Prompts), Server::route_list_prompts),
        ("prompts/get", Some(Capability::Prompts), Server::route_get_prompt),
        ("logging/setLevel", Some(Capability::Logging), Server::route_set_level),
    ];
    table
        .into_iter()
        .map(|(method, capability, handler)| (method, Route { capability, handler }))
        .collect()
}

/// MCP server router; cheap to clone and share between transport tasks
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn builder(name: impl Into<String>, version: impl Into<String>) -> ServerBuilder {
        ServerBuilder::new(name, version)
    }

    pub fn info(&self) -> &Implementation {
        &self.inner.info
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.inner.capabilities
    }

    /// The receiving end of the notification queue. Only the first call gets it.
    pub fn take_notification_receiver(&self) -> Option<mpsc::Receiver<ServerNotification>> {
        self.inner.notifications.lock().take()
    }

    /// Whether `initialize` completed on the given session
    pub fn is_initialized(&self, session_id: Option<&str>) -> bool {
        self.inner
            .sessions
            .read()
            .get(&session_id.map(str::to_string))
            .map(|s| s.initialized)
            .unwrap_or(false)
    }

    /// Forget a session and cancel everything it still has in flight
    pub fn close_session(&self, session_id: Option<&str>) {
        let key = session_id.map(str::to_string);
        self.inner.sessions.write().remove(&key);
        let mut in_flight = self.inner.in_flight.lock();
        in_flight.retain(|(session, _), token| {
            if *session == key {
                token.cancel();
                false
            } else {
                true
            }
        });
    }

    /// Decode one raw payload and produce the reply, if any.
    ///
    /// Notifications and stray responses never produce a reply. Malformed payloads get an
    /// error reply with the best id that could be recovered.
    pub async fn handle_message(&self, ctx: &MessageContext, raw: &[u8]) -> Option<Message> {
        let value: Value = match serde_json::from_slice(raw) {
            Ok(value) => value,
            Err(e) => {
                return Some(error_reply(
                    None,
                    ResponseError::new(ErrorCode::ParseError, format!("Parse error: {}", e)),
                ))
            }
        };
        let Value::Object(mut map) = value else {
            return Some(error_reply(
                None,
                ResponseError::new(ErrorCode::InvalidRequest, "Request must be a JSON object"),
            ));
        };

        let raw_id = map.remove("id");
        let best_effort_id = raw_id
            .clone()
            .and_then(|id| serde_json::from_value::<RequestId>(id).ok());

        if map.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Some(error_reply(
                best_effort_id,
                ResponseError::new(ErrorCode::InvalidRequest, "Invalid JSON-RPC version"),
            ));
        }

        let method = match map.get("method").and_then(Value::as_str) {
            Some(method) => method.to_string(),
            None if raw_id.is_some()
                && (map.contains_key("result") || map.contains_key("error")) =>
            {
                tracing::debug!(session_id = ?ctx.session_id, "ignoring response from client");
                return None;
            }
            None => {
                return Some(error_reply(
                    best_effort_id,
                    ResponseError::new(ErrorCode::InvalidRequest, "Missing method"),
                ))
            }
        };
        let params = map.remove("params");

        let Some(raw_id) = raw_id else {
            self.handle_notification(ctx, &method, params).await;
            return None;
        };
        let Some(id) = best_effort_id else {
            return Some(error_reply(
                None,
                ResponseError::new(ErrorCode::InvalidRequest, format!("Invalid id {}", raw_id)),
            ));
        };

        Some(self.handle_request(ctx, id, &method, params).await)
    }

    async fn handle_request(
        &self,
        ctx: &MessageContext,
        id: RequestId,
        method: &str,
        params: Option<Value>,
    ) -> Message {
        let Some(route) = self.inner.routes.get(method) else {
            return error_reply(Some(id), method_not_found(method));
        };
        if let Some(capability) = route.capability {
            if !self.capability_enabled(capability) {
                return error_reply(Some(id), method_not_found(method));
            }
        }
        if method != "initialize" && method != "ping" && !self.is_initialized(ctx.session_id.as_deref())
        {
            return error_reply(
                Some(id),
                ResponseError::new(ErrorCode::InvalidRequest, "Server not initialized"),
            );
        }

        let key = (ctx.session_id.clone(), id.clone());
        let token = CancellationToken::new();
        self.inner.in_flight.lock().insert(key.clone(), token.clone());
        let in_flight = InFlight {
            inner: &self.inner,
            key,
        };

        let request_ctx = RequestContext::new(
            id.clone(),
            ctx.session_id.clone(),
            token,
            progress_token(params.as_ref()),
            self.inner.queue.clone(),
        );
        tracing::debug!(method = %method, request_id = %id, session_id = ?ctx.session_id, "handling request");
        let result = (route.handler)(
            self,
            Call {
                ctx: request_ctx,
                params,
            },
        )
        .await;
        drop(in_flight);

        match result {
            Ok(value) => Message::Response(Response::success(id, value)),
            Err(error) => {
                tracing::debug!(method = %method, request_id = %id, code = error.code, message = %error.message, "request failed");
                error_reply(Some(id), error)
            }
        }
    }

    async fn handle_notification(&self, ctx: &MessageContext, method: &str, params: Option<Value>) {
        match method {
            "notifications/cancelled" => {
                match serde_json::from_value::<CancelledNotification>(
                    params.clone().unwrap_or(Value::Null),
                ) {
                    Ok(cancelled) => {
                        let key = (ctx.session_id.clone(), cancelled.request_id);
                        if let Some(token) = self.inner.in_flight.lock().remove(&key) {
                            tracing::debug!(request_id = %key.1, reason = ?cancelled.reason, "client cancelled request");
                            token.cancel();
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "malformed cancellation"),
                }
            }
            "notifications/initialized" => {
                tracing::debug!(session_id = ?ctx.session_id, "client initialized");
            }
            _ => {}
        }

        let handler = self.inner.notification_handlers.read().get(method).cloned();
        if let Some(handler) = handler {
            if let Err(e) = handler.handle(ctx.clone(), params).await {
                tracing::warn!(method = %method, error = %e, "notification handler failed");
            }
        }
    }

    fn capability_enabled(&self, capability: Capability) -> bool {
        let caps = &self.inner.capabilities;
        match capability {
            Capability::Tools => caps.tools.is_some(),
            Capability::Resources => caps.resources.is_some(),
            Capability::ResourceSubscribe => caps.resources.map(|r| r.subscribe).unwrap_or(false),
            Capability::Prompts => caps.prompts.is_some(),
            Capability::Logging => caps.logging.is_some(),
        }
    }

    /// Register a tool, replacing any tool with the same name
    pub fn add_tool(&self, tool: Tool, handler: impl ToolHandler + 'static) -> Result<()> {
        if self.inner.capabilities.tools.is_none() {
            return Err(Error::CapabilityNotEnabled("tools"));
        }
        let name = tool.name.clone();
        self.inner.tools.write().insert(
            name.clone(),
            ToolEntry {
                tool,
                handler: Arc::new(handler),
            },
        );
        tracing::debug!(tool = %name, "tool registered");
        self.notify_list_changed(Capability::Tools);
        Ok(())
    }

    /// Returns whether a tool was removed
    pub fn remove_tool(&self, name: &str) -> bool {
        let removed = self.inner.tools.write().remove(name).is_some();
        if removed {
            self.notify_list_changed(Capability::Tools);
        }
        removed
    }

    pub fn add_resource(
        &self,
        resource: Resource,
        handler: impl ResourceHandler + 'static,
    ) -> Result<()> {
        if self.inner.capabilities.resources.is_none() {
            return Err(Error::CapabilityNotEnabled("resources"));
        }
        let uri = resource.uri.clone();
        self.inner.resources.write().insert(
            uri.clone(),
            ResourceEntry {
                resource,
                handler: Arc::new(handler),
            },
        );
        tracing::debug!(uri = %uri, "resource registered");
        self.notify_list_changed(Capability::Resources);
        Ok(())
    }

    pub fn remove_resource(&self, uri: &str) -> bool {
        let removed = self.inner.resources.write().remove(uri).is_some();
        if removed {
            self.notify_list_changed(Capability::Resources);
        }
        removed
    }

    /// Register a resource template.
    ///
    /// Reads try templates in registration order and the first match wins.
    /// Registering the same template string again replaces it in place.
    pub fn add_resource_template(
        &self,
        template: ResourceTemplate,
        handler: impl ResourceHandler + 'static,
    ) -> Result<()> {
        if self.inner.capabilities.resources.is_none() {
            return Err(Error::CapabilityNotEnabled("resources"));
        }
        let matcher = UriTemplate::parse(&template.uri_template)?;
        let entry = TemplateEntry {
            template,
            matcher,
            handler: Arc::new(handler),
        };
        {
            let mut templates = self.inner.templates.write();
            match templates
                .iter_mut()
                .find(|t| t.template.uri_template == entry.template.uri_template)
            {
                Some(existing) => *existing = entry,
                None => templates.push(entry),
            }
        }
        self.notify_list_changed(Capability::Resources);
        Ok(())
    }

    pub fn remove_resource_template(&self, uri_template: &str) -> bool {
        let removed = {
            let mut templates = self.inner.templates.write();
            let before = templates.len();
            templates.retain(|t| t.template.uri_template != uri_template);
            templates.len() != before
        };
        if removed {
            self.notify_list_changed(Capability::Resources);
        }
        removed
    }

    pub fn add_prompt(&self, prompt: Prompt, handler: impl PromptHandler + 'static) -> Result<()> {
        if self.inner.capabilities.prompts.is_none() {
            return Err(Error::CapabilityNotEnabled("prompts"));
        }
        let name = prompt.name.clone();
        self.inner.prompts.write().insert(
            name.clone(),
            PromptEntry {
                prompt,
                handler: Arc::new(handler),
            },
        );
        tracing::debug!(prompt = %name, "prompt registered");
        self.notify_list_changed(Capability::Prompts);
        Ok(())
    }

    pub fn remove_prompt(&self, name: &str) -> bool {
        let removed = self.inner.prompts.write().remove(name).is_some();
        if removed {
            self.notify_list_changed(Capability::Prompts);
        }
        removed
    }

    /// Handle a client notification method, e.g. `notifications/roots/list_changed`
    pub fn add_notification_handler(
        &self,
        method: impl Into<String>,
        handler: impl NotificationHandler + 'static,
    ) {
        self.inner
            .notification_handlers
            .write()
            .insert(method.into(), Arc::new(handler));
    }

    /// Queue a notification for one session. Fails with [`Error::QueueFull`] rather than
    /// waiting when the queue is at capacity.
    pub fn send_notification(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Option<Value>,
    ) -> Result<()> {
        self.inner.queue.push(
            session_id.map(str::to_string),
            Notification::new(method, params),
        )
    }

    /// Queue a notification for every initialized session
    pub fn broadcast(&self, method: &str, params: Option<Value>) -> Result<()> {
        let mut result = Ok(());
        for session in self.initialized_sessions() {
            if let Err(e) = self
                .inner
                .queue
                .push(session, Notification::new(method, params.clone()))
            {
                result = Err(e);
            }
        }
        result
    }

    /// Send `notifications/message` to every initialized session when `level` is at or
    /// above the level the client asked for
    pub fn log_message(
        &self,
        level: LoggingLevel,
        logger: Option<&str>,
        data: Value,
    ) -> Result<()> {
        if self.inner.capabilities.logging.is_none() {
            return Err(Error::CapabilityNotEnabled("logging"));
        }
        if level < *self.inner.log_level.read() {
            return Ok(());
        }
        let message = LoggingMessage {
            level,
            logger: logger.map(str::to_string),
            data,
        };
        self.broadcast("notifications/message", Some(serde_json::to_value(message)?))
    }

    /// Tell every session subscribed to `uri` that it changed
    pub fn notify_resource_updated(&self, uri: &str) -> Result<()> {
        let subscribers: Vec<SessionKey> = self
            .inner
            .sessions
            .read()
            .iter()
            .filter(|(_, s)| s.subscriptions.contains(uri))
            .map(|(k, _)| k.clone())
            .collect();
        let mut result = Ok(());
        for session in subscribers {
            let notification = Notification::new(
                "notifications/resources/updated",
                Some(json!({ "uri": uri })),
            );
            if let Err(e) = self.inner.queue.push(session, notification) {
                result = Err(e);
            }
        }
        result
    }

    fn initialized_sessions(&self) -> Vec<SessionKey> {
        self.inner
            .sessions
            .read()
            .iter()
            .filter(|(_, s)| s.initialized)
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn notify_list_changed(&self, capability: Capability) {
        let caps = &self.inner.capabilities;
        let (enabled, method) = match capability {
            Capability::Tools => (
                caps.tools.map(|c| c.list_changed).unwrap_or(false),
                "notifications/tools/list_changed",
            ),
            Capability::Resources => (
                caps.resources.map(|c| c.list_changed).unwrap_or(false),
                "notifications/resources/list_changed",
            ),
            Capability::Prompts => (
                caps.prompts.map(|c| c.list_changed).unwrap_or(false),
                "notifications/prompts/list_changed",
            ),
            Capability::ResourceSubscribe | Capability::Logging => return,
        };
        if !enabled {
            return;
        }
        // the queue already logs a full queue; registration still succeeds
        let _ = self.broadcast(method, None);
    }

    fn route_initialize(&self, call: Call) -> BoxFuture<'_, RouteResult> {
        Box::pin(async move {
            let params: InitializeParams = parse_params(call.params)?;
            let protocol_version =
                if SUPPORTED_PROTOCOL_VERSIONS.contains(&params.protocol_version.as_str()) {
                    params.protocol_version.clone()
                } else {
                    LATEST_PROTOCOL_VERSION.to_string()
                };
            tracing::info!(
                client = %params.client_info.name,
                client_version = %params.client_info.version,
                protocol_version = %protocol_version,
                session_id = ?call.ctx.session_id,
                "client initializing"
            );

            self.inner
                .sessions
                .write()
                .entry(call.ctx.session_id.clone())
                .or_default()
                .initialized = true;

            to_value(InitializeResult {
                protocol_version,
                capabilities: self.inner.capabilities.clone(),
                server_info: self.inner.info.clone(),
                instructions: self.inner.instructions.clone(),
            })
        })
    }

    fn route_ping(&self, _call: Call) -> BoxFuture<'_, RouteResult> {
        Box::pin(async move { Ok(json!({})) })
    }

    fn route_list_tools(&self, call: Call) -> BoxFuture<'_, RouteResult> {
        Box::pin(async move {
            let params: PaginatedParams = parse_optional_params(call.params)?;
            let page = self.inner.tools.read().page(
                params.cursor.as_deref(),
                self.inner.pagination_limit,
                |e| e.tool.clone(),
            )?;
            to_value(ListToolsResult {
                tools: page.items,
                next_cursor: page.next_cursor,
            })
        })
    }

    fn route_call_tool(&self, call: Call) -> BoxFuture<'_, RouteResult> {
        Box::pin(async move {
            let params: CallToolParams = parse_params(call.params)?;
            let handler = self
                .inner
                .tools
                .read()
                .get(&params.name)
                .map(|e| e.handler.clone())
                .ok_or_else(|| {
                    ResponseError::new(
                        ErrorCode::InvalidParams,
                        format!("Tool not found: {}", params.name),
                    )
                })?;
            let arguments = match params.arguments {
                Value::Null => Value::Object(Map::new()),
                other => other,
            };
            let result: CallToolResult = handler
                .call(call.ctx, arguments)
                .await
                .map_err(|e| ResponseError::new(ErrorCode::InternalError, e.to_string()))?;
            to_value(result)
        })
    }

    fn route_list_resources(&self, call: Call) -> BoxFuture<'_, RouteResult> {
        Box::pin(async move {
            let params: PaginatedParams = parse_optional_params(call.params)?;
            let page = self.inner.resources.read().page(
                params.cursor.as_deref(),
                self.inner.pagination_limit,
                |e| e.resource.clone(),
            )?;
            to_value(ListResourcesResult {
                resources: page.items,
                next_cursor: page.next_cursor,
            })
        })
    }

    fn route_list_templates(&self, _call: Call) -> BoxFuture<'_, RouteResult> {
        Box::pin(async move {
            let mut resource_templates: Vec<ResourceTemplate> = self
                .inner
                .templates
                .read()
                .iter()
                .map(|t| t.template.clone())
                .collect();
            resource_templates.sort_by(|a, b| a.uri_template.cmp(&b.uri_template));
            to_value(ListResourceTemplatesResult {
                resource_templates,
                next_cursor: None,
            })
        })
    }

    fn route_read_resource(&self, call: Call) -> BoxFuture<'_, RouteResult> {
        Box::pin(async move {
            let params: ResourceUriParams = parse_params(call.params)?;
            let uri = params.uri;

            let direct = self
                .inner
                .resources
                .read()
                .get(&uri)
                .map(|e| e.handler.clone());
            let (handler, variables) = match direct {
                Some(handler) => (handler, HashMap::new()),
                None => self
                    .inner
                    .templates
                    .read()
                    .iter()
                    .find_map(|t| t.matcher.matches(&uri).map(|vars| (t.handler.clone(), vars)))
                    .ok_or_else(|| {
                        ResponseError::new(
                            ErrorCode::InvalidParams,
                            format!("Resource not found: {}", uri),
                        )
                    })?,
            };

            let contents = handler
                .read(call.ctx, uri, variables)
                .await
                .map_err(|e| ResponseError::new(ErrorCode::InternalError, e.to_string()))?;
            to_value(ReadResourceResult { contents })
        })
    }

    fn route_subscribe(&self, call: Call) -> BoxFuture<'_, RouteResult> {
        Box::pin(async move {
            let params: ResourceUriParams = parse_params(call.params)?;
            self.inner
                .sessions
                .write()
                .entry(call.ctx.session_id.clone())
                .or_default()
                .subscriptions
                .insert(params.uri);
            Ok(json!({}))
        })
    }

    fn route_unsubscribe(&self, call: Call) -> BoxFuture<'_, RouteResult> {
        Box::pin(async move {
            let params: ResourceUriParams = parse_params(call.params)?;
            if let Some(session) = self.inner.sessions.write().get_mut(&call.ctx.session_id) {
                session.subscriptions.remove(&params.uri);
            }
            Ok(json!({}))
        })
    }

    fn route_list_prompts(&self, call: Call) -> BoxFuture<'_, RouteResult> {
        Box::pin(async move {
            let params: PaginatedParams = parse_optional_params(call.params)?;
            let page = self.inner.prompts.read().page(
                params.cursor.as_deref(),
                self.inner.pagination_limit,
                |e| e.prompt.clone(),
            )?;
            to_value(ListPromptsResult {
                prompts: page.items,
                next_cursor: page.next_cursor,
            })
        })
    }

    fn route_get_prompt(&self, call: Call) -> BoxFuture<'_, RouteResult> {
        Box::pin(async move {
            let params: GetPromptParams = parse_params(call.params)?;
            let (prompt, handler) = self
                .inner
                .prompts
                .read()
                .get(&params.name)
                .map(|e| (e.prompt.clone(), e.handler.clone()))
                .ok_or_else(|| {
                    ResponseError::new(
                        ErrorCode::InvalidParams,
                        format!("Prompt not found: {}", params.name),
                    )
                })?;

            if let Some(missing) = prompt
                .arguments
                .iter()
                .find(|a| a.required && !params.arguments.contains_key(&a.name))
            {
                return Err(ResponseError::new(
                    ErrorCode::InvalidParams,
                    format!("Missing required argument: {}", missing.name),
                ));
            }

            let result = handler
                .get(call.ctx, params.arguments)
                .await
                .map_err(|e| ResponseError::new(ErrorCode::InternalError, e.to_string()))?;
            to_value(result)
        })
    }

    fn route_set_level(&self, call: Call) -> BoxFuture<'_, RouteResult> {
        Box::pin(async move {
            let params: SetLevelParams = parse_params(call.params)?;
            tracing::debug!(level = ?params.level, "client set log level");
            *self.inner.log_level.write() = params.level;
            Ok(json!({}))
        })
    }
}

fn error_reply(id: Option<RequestId>, error: ResponseError) -> Message {
    Message::Error(ErrorResponse::new(id, error))
}

fn method_not_found(method: &str) -> ResponseError {
    ResponseError::new(
        ErrorCode::MethodNotFound,
        format!("Method not found: {}", method),
    )
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> std::result::Result<T, ResponseError> {
    let params = params.ok_or_else(|| ResponseError::new(ErrorCode::InvalidParams, "Missing params"))?;
    serde_json::from_value(params)
        .map_err(|e| ResponseError::new(ErrorCode::InvalidParams, format!("Invalid params: {}", e)))
}

fn parse_optional_params<T: DeserializeOwned>(
    params: Option<Value>,
) -> std::result::Result<T, ResponseError> {
    match params {
        None | Some(Value::Null) => parse_params(Some(json!({}))),
        some => parse_params(some),
    }
}

fn to_value<T: serde::Serialize>(value: T) -> RouteResult {
    serde_json::to_value(value)
        .map_err(|e| ResponseError::new(ErrorCode::InternalError, e.to_string()))
}

fn progress_token(params: Option<&Value>) -> Option<RequestId> {
    let token = params?.get("_meta")?.get("progressToken")?;
    serde_json::from_value(token.clone()).ok()
}
