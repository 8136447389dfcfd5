use std::collections::HashMap;

use mcp_rpc::{
    config::{ServerConfig, TransportKind},
    logging::{self, LogTarget},
    server::{http::StatelessHttpServer, sse::SseServer, stdio::StdioServer, RequestContext, Server},
    CallToolResult, Content, GetPromptResult, Prompt, PromptMessage, Resource, ResourceContents,
    ResourceTemplate, Role, Tool,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::from_env()?;
    logging::init_logging(match config.transport {
        TransportKind::Stdio => LogTarget::Stderr,
        _ => LogTarget::Stdout,
    });

    let server = demo_server(&config)?;
    info!(
        name = %config.server_name,
        version = %config.server_version,
        transport = ?config.transport,
        "server starting"
    );

    match config.transport {
        TransportKind::Stdio => StdioServer::new(server).serve().await?,
        TransportKind::Sse => {
            let mut sse = SseServer::new(server);
            if let Some(base_url) = &config.base_url {
                sse = sse.with_base_url(base_url.clone());
            }
            sse.serve(&config.bind_socket()?.to_string(), shutdown_on_ctrl_c())
                .await?
        }
        TransportKind::Http => {
            StatelessHttpServer::new(server)
                .serve(&config.bind_socket()?.to_string(), shutdown_on_ctrl_c())
                .await?
        }
    }
    Ok(())
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            signal.cancel();
        }
    });
    token
}

fn demo_server(config: &ServerConfig) -> mcp_rpc::Result<Server> {
    let mut builder = Server::builder(&config.server_name, &config.server_version)
        .instructions("Demo server: an echo tool, a readme resource, notes by id and a greeting prompt.")
        .with_resource_capabilities(true, true)
        .with_prompt_capabilities(true)
        .with_logging()
        .with_notification_queue(config.notification_queue);
    if let Some(limit) = config.pagination_limit {
        builder = builder.with_pagination_limit(limit);
    }
    let server = builder.build();

    server.add_tool(
        Tool::new("echo", "Echo the given text back").with_input_schema(json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })),
        |ctx: RequestContext, args: Value| async move {
            ctx.report_progress(1, 1)?;
            let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
            Ok(CallToolResult::text(text))
        },
    )?;

    server.add_resource(
        Resource::new("demo://readme", "README").with_mime_type("text/plain"),
        |_ctx: RequestContext, uri: String, _vars: HashMap<String, String>| async move {
            Ok(vec![ResourceContents::text(uri, "This server speaks MCP over JSON-RPC 2.0.")
                .with_mime_type("text/plain")])
        },
    )?;

    server.add_resource_template(
        ResourceTemplate::new("demo://notes/{id}", "Note"),
        |_ctx: RequestContext, uri: String, vars: HashMap<String, String>| async move {
            let id = vars.get("id").cloned().unwrap_or_default();
            Ok(vec![ResourceContents::text(uri, format!("Note {}", id))])
        },
    )?;

    server.add_prompt(
        Prompt::new("greet", "Greet someone by name").with_argument("name", "Who to greet", true),
        |_ctx: RequestContext, args: HashMap<String, String>| async move {
            let name = args.get("name").cloned().unwrap_or_default();
            Ok(GetPromptResult {
                description: Some("A friendly greeting".to_string()),
                messages: vec![PromptMessage::new(
                    Role::User,
                    Content::text(format!("Say hello to {}", name)),
                )],
            })
        },
    )?;

    Ok(server)
}
