//! # mcp-rpc
//!
//! A transport-agnostic JSON-RPC 2.0 layer for the Model Context Protocol (MCP).
//!
//! - [`protocol`]: message envelopes and the [`Protocol`](protocol::Protocol) correlation
//!   engine (request ids, timeouts, cancellation, progress)
//! - [`transport`]: line-delimited streams (stdio or a child process), an SSE client and a
//!   stateless HTTP client
//! - [`client`]: the typed [`Client`](client::Client) façade
//! - [`server`]: the [`Server`](server::Server) router with stdio, SSE and stateless HTTP
//!   front ends
//!
//! ## Example
//!
//! ```no_run
//! use mcp_rpc::{client::Client, Implementation};
//!
//! #[tokio::main]
//! async fn main() -> mcp_rpc::Result<()> {
//!     let mut command = tokio::process::Command::new("my-mcp-server");
//!     command.arg("--stdio");
//!     let client = Client::spawn(command).await?;
//!
//!     let init = client
//!         .initialize(Implementation::new("example-client", "0.1.0"), Default::default())
//!         .await?;
//!     println!("connected to {}", init.server_info.name);
//!
//!     let tools = client.list_all_tools().await?;
//!     println!("{} tools available", tools.len());
//!
//!     client.close().await
//! }
//! ```

/// Client façade
pub mod client;
/// Binary configuration from the environment
pub mod config;
/// Error types and JSON-RPC error codes
pub mod error;
/// Tracing setup
pub mod logging;
/// Child process management for the stream transport
pub mod process;
/// Message envelopes and the correlation engine
pub mod protocol;
/// Server router and transport front ends
pub mod server;
/// Client transports (stream, SSE, stateless HTTP)
pub mod transport;
/// MCP data types
pub mod types;

// Re-export commonly used types for convenience
pub use error::{Error, ErrorCode, Result};
pub use protocol::{
    Message, Notification, Request, RequestId, Response, JSONRPC_VERSION,
    LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
pub use types::*;
