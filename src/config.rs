use std::{env, net::SocketAddr, str::FromStr};

use thiserror::Error;

use crate::server::DEFAULT_NOTIFICATION_QUEUE;

/// Which server transport the binary runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Stdio,
    Sse,
    Http,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "sse" => Ok(Self::Sse),
            "http" => Ok(Self::Http),
            other => Err(ConfigError::InvalidTransport(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub transport: TransportKind,
    pub bind_addr: String,
    pub bind_port: u16,
    pub base_url: Option<String>,
    pub pagination_limit: Option<usize>,
    pub notification_queue: usize,
    pub server_name: String,
    pub server_version: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MCP_TRANSPORT must be one of stdio, sse, http (got {0:?})")]
    InvalidTransport(String),
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("MCP_PAGINATION_LIMIT must be a positive integer")]
    InvalidPaginationLimit,
    #[error("MCP_NOTIFICATION_QUEUE must be a positive integer")]
    InvalidNotificationQueue,
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let transport = get("MCP_TRANSPORT")
            .map(|value| value.parse::<TransportKind>())
            .transpose()?
            .unwrap_or_default();
        let bind_addr = get("BIND_ADDR").unwrap_or_else(|| "127.0.0.1".to_string());
        let bind_port = get("BIND_PORT")
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8080);
        let pagination_limit = get("MCP_PAGINATION_LIMIT")
            .map(|value| positive(&value).ok_or(ConfigError::InvalidPaginationLimit))
            .transpose()?;
        let notification_queue = get("MCP_NOTIFICATION_QUEUE")
            .map(|value| positive(&value).ok_or(ConfigError::InvalidNotificationQueue))
            .transpose()?
            .unwrap_or(DEFAULT_NOTIFICATION_QUEUE);

        let config = Self {
            transport,
            bind_addr,
            bind_port,
            base_url: get("MCP_BASE_URL"),
            pagination_limit,
            notification_queue,
            server_name: get("MCP_SERVER_NAME").unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
            server_version: get("MCP_SERVER_VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
        };

        if config.transport != TransportKind::Stdio {
            let _ = config.bind_socket()?;
        }
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }
}

fn positive(value: &str) -> Option<usize> {
    value.parse::<usize>().ok().filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    fn load(pairs: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn parse_defaults() {
        let config = assert_ok!(load(&[]));
        assert_eq!(config.transport, TransportKind::Stdio);
        assert_eq!(config.bind_addr, "127.0.0.1");
        assert_eq!(config.bind_port, 8080);
        assert_eq!(config.base_url, None);
        assert_eq!(config.pagination_limit, None);
        assert_eq!(config.notification_queue, 100);
        assert_eq!(config.server_name, "mcp-rpc");
    }

    #[test]
    fn parse_overrides() {
        let config = load(&[
            ("MCP_TRANSPORT", "SSE"),
            ("BIND_ADDR", "0.0.0.0"),
            ("BIND_PORT", "9000"),
            ("MCP_BASE_URL", "http://example.com"),
            ("MCP_PAGINATION_LIMIT", "25"),
            ("MCP_NOTIFICATION_QUEUE", "10"),
            ("MCP_SERVER_NAME", "demo"),
        ])
        .expect("config should parse");
        assert_eq!(config.transport, TransportKind::Sse);
        assert_eq!(config.bind_socket().unwrap().port(), 9000);
        assert_eq!(config.base_url.as_deref(), Some("http://example.com"));
        assert_eq!(config.pagination_limit, Some(25));
        assert_eq!(config.notification_queue, 10);
        assert_eq!(config.server_name, "demo");
    }

    #[test]
    fn invalid_values_fail() {
        assert!(matches!(
            load(&[("MCP_TRANSPORT", "websocket")]),
            Err(ConfigError::InvalidTransport(_))
        ));
        assert!(matches!(assert_err!(load(&[("BIND_PORT", "70000")])), ConfigError::InvalidPort));
        assert!(matches!(
            load(&[("MCP_PAGINATION_LIMIT", "0")]),
            Err(ConfigError::InvalidPaginationLimit)
        ));
        assert!(matches!(
            load(&[("MCP_NOTIFICATION_QUEUE", "-1")]),
            Err(ConfigError::InvalidNotificationQueue)
        ));
        assert!(matches!(
            load(&[("MCP_TRANSPORT", "http"), ("BIND_ADDR", "not an address")]),
            Err(ConfigError::InvalidSocket)
        ));
    }

    #[test]
    fn blank_values_are_unset() {
        let config = assert_ok!(load(&[("BIND_PORT", "  "), ("MCP_BASE_URL", "")]));
        assert_eq!(config.bind_port, 8080);
        assert_eq!(config.base_url, None);
    }
}
