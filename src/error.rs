use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::ResponseError;

/// JSON-RPC error codes used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Invalid JSON was received
    ParseError,
    /// The JSON sent is not a valid request object
    InvalidRequest,
    /// The method does not exist or its capability is not enabled
    MethodNotFound,
    /// Invalid method parameters
    InvalidParams,
    /// Internal JSON-RPC error
    InternalError,
    /// A request handler failed
    RequestFailed,
    /// Code not recognized by this SDK
    UnknownErrorCode,
    /// A request arrived before `initialize` completed
    ServerNotInitialized,
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::RequestFailed => -32000,
            ErrorCode::UnknownErrorCode => -32001,
            ErrorCode::ServerNotInitialized => -32002,
        }
    }
}

impl From<i32> for ErrorCode {
    fn from(code: i32) -> Self {
        match code {
            -32700 => ErrorCode::ParseError,
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotFound,
            -32602 => ErrorCode::InvalidParams,
            -32603 => ErrorCode::InternalError,
            -32000 => ErrorCode::RequestFailed,
            -32002 => ErrorCode::ServerNotInitialized,
            _ => ErrorCode::UnknownErrorCode,
        }
    }
}

/// Errors produced anywhere in the SDK
#[derive(Debug, Error)]
pub enum Error {
    /// A JSON-RPC level error produced locally
    #[error("protocol error ({code:?}): {message}")]
    Protocol {
        code: ErrorCode,
        message: String,
        data: Option<Value>,
    },

    /// The peer answered a request with an error object
    #[error("remote error {}: {}", .0.code, .0.message)]
    Remote(ResponseError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request cancelled: {0}")]
    Cancelled(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("not connected")]
    NotConnected,

    /// The bounded notification queue rejected an item
    #[error("notification queue full")]
    QueueFull,

    #[error("{0} capability not enabled")]
    CapabilityNotEnabled(&'static str),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a locally produced protocol error without data
    pub fn protocol(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Protocol {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// The JSON-RPC code this error maps to when sent over the wire
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Protocol { code, .. } => *code,
            Error::Remote(err) => ErrorCode::from(err.code),
            Error::Serialization(_) => ErrorCode::ParseError,
            _ => ErrorCode::InternalError,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::Other(message)
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::Other(message.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
