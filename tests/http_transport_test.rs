use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use mcp_rpc::{
    client::{Client, ClientHandler},
    protocol::RequestOptions,
    server::{http::StatelessHttpServer, sse::SseServer, RequestContext, Server},
    transport::sse::SseTransport,
    CallToolResult, Content, Error, Implementation, Resource, ResourceContents, Tool,
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;

struct ForwardingHandler {
    tx: mpsc::UnboundedSender<(String, Option<Value>)>,
}

#[async_trait]
impl ClientHandler for ForwardingHandler {
    async fn shutdown(&self) -> mcp_rpc::Result<()> {
        Ok(())
    }

    async fn handle_request(&self, method: String, _params: Option<Value>) -> mcp_rpc::Result<Value> {
        Err(Error::Other(format!("unexpected request {}", method)))
    }

    async fn handle_notification(&self, method: String, params: Option<Value>) -> mcp_rpc::Result<()> {
        let _ = self.tx.send((method, params));
        Ok(())
    }
}

fn test_server() -> Server {
    let server = Server::builder("http-server", "1.0.0")
        .with_resource_capabilities(true, false)
        .build();
    server
        .add_tool(
            Tool::new("add", "adds two numbers"),
            |_ctx: RequestContext, args: Value| async move {
                let a = args["a"].as_i64().unwrap_or_default();
                let b = args["b"].as_i64().unwrap_or_default();
                Ok(CallToolResult::text((a + b).to_string()))
            },
        )
        .unwrap();
    server
        .add_resource(
            Resource::new("test://resource", "Test Resource"),
            |_ctx: RequestContext, uri: String, _vars: HashMap<String, String>| async move {
                Ok(vec![ResourceContents::text(uri, "test content")])
            },
        )
        .unwrap();
    server
}

/// Adds a tool whose answer takes seconds unless the request is cancelled
fn with_slow_tool(server: Server) -> Server {
    server
        .add_tool(
            Tool::new("slow", "answers after three seconds"),
            |ctx: RequestContext, _args: Value| async move {
                tokio::select! {
                    _ = ctx.cancellation.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_secs(3)) => {}
                }
                Ok(CallToolResult::text("ok"))
            },
        )
        .unwrap();
    server
}

/// Timeout and cancellation must settle the call while the server is still working
async fn assert_abandons_slow_calls(client: &Client) {
    let started = Instant::now();
    let err = client
        .call_tool_with(
            "slow",
            json!({}),
            RequestOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let started = Instant::now();
    let err = client
        .call_tool_with(
            "slow",
            json!({}),
            RequestOptions::default().with_cancellation(token),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());

    // the connection stays usable
    client.ping().await.unwrap();
}

async fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, format!("http://{}", addr))
}

async fn next_notification(
    rx: &mut mpsc::UnboundedReceiver<(String, Option<Value>)>,
) -> (String, Option<Value>) {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("notification should arrive")
        .expect("channel open")
}

#[tokio::test]
async fn sse_client_talks_to_sse_server() {
    let server = test_server();
    let (listener, base) = listener().await;
    let shutdown = CancellationToken::new();
    tokio::spawn(
        SseServer::new(server.clone()).serve_with_listener(listener, shutdown.clone()),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let transport = SseTransport::new(&format!("{}/sse", base)).unwrap();
    let client = Client::connect(Arc::new(transport), Some(Arc::new(ForwardingHandler { tx })))
        .await
        .expect("sse client should connect");

    let init = client
        .initialize(Implementation::new("sse-client", "1.0.0"), None)
        .await
        .unwrap();
    assert_eq!(init.server_info.name, "http-server");

    let result = client.call_tool("add", json!({"a": 2, "b": 3})).await.unwrap();
    assert_eq!(result.content, vec![Content::text("5")]);

    let read = client.read_resource("test://resource").await.unwrap();
    assert_eq!(read.contents[0].text.as_deref(), Some("test content"));

    // notifications travel over the event stream of this session
    server
        .add_tool(Tool::new("late", "added later"), |_ctx: RequestContext, _args: Value| async move {
            Ok(CallToolResult::text("late"))
        })
        .unwrap();
    let (method, _) = next_notification(&mut rx).await;
    assert_eq!(method, "notifications/tools/list_changed");

    client.subscribe("test://resource").await.unwrap();
    server.notify_resource_updated("test://resource").unwrap();
    let (method, params) = next_notification(&mut rx).await;
    assert_eq!(method, "notifications/resources/updated");
    assert_eq!(params.unwrap()["uri"], "test://resource");

    client.close().await.unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn separate_sse_sessions_initialize_independently() {
    let server = test_server();
    let (listener, base) = listener().await;
    let shutdown = CancellationToken::new();
    tokio::spawn(SseServer::new(server).serve_with_listener(listener, shutdown.clone()));

    let first = Client::sse(&format!("{}/sse", base)).await.unwrap();
    let second = Client::sse(&format!("{}/sse", base)).await.unwrap();

    first
        .initialize(Implementation::new("first", "1.0.0"), None)
        .await
        .unwrap();
    assert_eq!(first.list_all_tools().await.unwrap().len(), 1);

    let err = second.list_tools(None).await.unwrap_err();
    match err {
        Error::Remote(e) => assert_eq!(e.code, -32600),
        other => panic!("expected a remote error, got {:?}", other),
    }

    first.close().await.unwrap();
    second.close().await.unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn http_client_talks_to_stateless_server() {
    let (listener, base) = listener().await;
    let shutdown = CancellationToken::new();
    tokio::spawn(
        StatelessHttpServer::new(test_server()).serve_with_listener(listener, shutdown.clone()),
    );

    let client = Client::http(&format!("{}/mcp", base)).await.unwrap();
    let init = client
        .initialize(Implementation::new("http-client", "1.0.0"), None)
        .await
        .unwrap();
    assert_eq!(init.protocol_version, mcp_rpc::LATEST_PROTOCOL_VERSION);

    let tools = client.list_all_tools().await.unwrap();
    assert_eq!(tools[0].name, "add");

    let result = client.call_tool("add", json!({"a": 40, "b": 2})).await.unwrap();
    assert_eq!(result.content, vec![Content::text("42")]);

    // a 400 with a JSON-RPC body still settles the request
    let err = client.call_tool("nope", json!({})).await.unwrap_err();
    match err {
        Error::Remote(e) => assert_eq!(e.code, -32602),
        other => panic!("expected a remote error, got {:?}", other),
    }

    client.close().await.unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn sse_calls_time_out_and_cancel_while_the_server_works() {
    let (listener, base) = listener().await;
    let shutdown = CancellationToken::new();
    tokio::spawn(
        SseServer::new(with_slow_tool(test_server())).serve_with_listener(listener, shutdown.clone()),
    );

    let client = Client::sse(&format!("{}/sse", base)).await.unwrap();
    client
        .initialize(Implementation::new("sse-client", "1.0.0"), None)
        .await
        .unwrap();
    assert_abandons_slow_calls(&client).await;

    client.close().await.unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn http_calls_time_out_and_cancel_while_the_server_works() {
    let (listener, base) = listener().await;
    let shutdown = CancellationToken::new();
    tokio::spawn(
        StatelessHttpServer::new(with_slow_tool(test_server()))
            .serve_with_listener(listener, shutdown.clone()),
    );

    let client = Client::http(&format!("{}/mcp", base)).await.unwrap();
    client
        .initialize(Implementation::new("http-client", "1.0.0"), None)
        .await
        .unwrap();
    assert_abandons_slow_calls(&client).await;

    client.close().await.unwrap();
    shutdown.cancel();
}
