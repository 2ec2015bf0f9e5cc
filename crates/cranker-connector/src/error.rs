//! Connector error types

use cranker_proto::ProtocolViolation;
use thiserror::Error;

/// Fatal configuration errors, returned synchronously by
/// [`Connector::connect`](crate::Connector::connect).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid router URL {url:?}: {source}")]
    InvalidRouterUrl {
        url: String,
        source: url::ParseError,
    },

    #[error("router URL {0:?} must use a ws or wss scheme")]
    UnsupportedScheme(String),

    #[error("invalid service URL {url:?}: {source}")]
    InvalidServiceUrl {
        url: String,
        source: url::ParseError,
    },

    #[error("service URL {0:?} has no host")]
    MissingServiceHost(String),

    #[error("connector is already started")]
    AlreadyStarted,
}

/// Per-socket failures. These are isolated: each one is logged and hands the
/// slot back to the pool for replacement, but never aborts the pool itself.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("registration to {router} failed: {message}")]
    Dial {
        router: String,
        /// HTTP status of the rejected upgrade, when one was obtained.
        status: Option<u16>,
        message: String,
    },

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("local service request failed: {0}")]
    Upstream(String),

    #[error("websocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("grace period exceeded during shutdown")]
    GraceExceeded,
}
