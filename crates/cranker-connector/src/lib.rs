//! Backend-side connector for cranker reverse proxies
//!
//! Routers usually cannot dial into firewalled backends, so each backend
//! runs this connector instead: it dials outbound WebSocket registrations to
//! every router and services the HTTP requests the routers multiplex over
//! them against a process-local service. Each socket carries one request at
//! a time; a sliding window of sockets per router provides the concurrency,
//! and finished sockets are replaced to keep the window full.
//!
//! ```no_run
//! use cranker_connector::{Connector, RouterConfig, ServiceConfig};
//!
//! # async fn run() -> Result<(), cranker_connector::ConfigError> {
//! let connector = Connector::new(RouterConfig::default(), ServiceConfig::default());
//! connector
//!     .connect(&["wss://router.example:16489"], 2, "demo", "http://127.0.0.1:8080")
//!     .await?;
//! // ... serve until it is time to leave ...
//! connector.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod grace;
pub mod pool;
pub mod service;

mod socket;

pub use buffer::BufferPool;
pub use config::{RouterConfig, ServiceConfig};
pub use error::{ConfigError, SocketError};
pub use grace::GraceToken;
pub use pool::Connector;
pub use service::ServiceClient;

pub use cranker_proto::{BodyMarker, ProtocolViolation, RequestHead};
