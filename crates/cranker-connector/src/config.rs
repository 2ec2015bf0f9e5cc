//! Connector configuration

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::MIN_BUFFER_SIZE;
use crate::service::ServiceClient;

/// Router-facing options.
#[derive(Clone)]
pub struct RouterConfig {
    /// Per-message buffer size; floored at 8 KiB. Also the upper bound on a
    /// request head frame.
    pub buffer_size: usize,

    /// Pre-built TLS configuration for `wss` routers. Trust-store assembly
    /// happens outside this library; when absent, the WebSocket stack's
    /// webpki roots apply.
    pub tls: Option<Arc<rustls::ClientConfig>>,

    /// Bound on a single registration dial.
    pub dial_timeout: Duration,

    /// How long in-flight requests may keep draining after shutdown begins.
    pub shutdown_grace: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            buffer_size: MIN_BUFFER_SIZE,
            tls: None,
            dial_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl RouterConfig {
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

impl fmt::Debug for RouterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterConfig")
            .field("buffer_size", &self.buffer_size)
            .field("tls", &self.tls.is_some())
            .field("dial_timeout", &self.dial_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

/// Local-service-facing options.
#[derive(Clone)]
pub struct ServiceConfig {
    /// Pre-configured client for the local service. When absent one is built
    /// from the service URL passed to
    /// [`Connector::connect`](crate::Connector::connect); when present its
    /// own target wins.
    pub client: Option<Arc<ServiceClient>>,

    /// Connection-pool cap used when the client is built internally.
    pub max_pooled_connections: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            client: None,
            max_pooled_connections: 10,
        }
    }
}

impl ServiceConfig {
    pub fn with_client(mut self, client: Arc<ServiceClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_max_pooled_connections(mut self, max: usize) -> Self {
        self.max_pooled_connections = max;
        self
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("client", &self.client.is_some())
            .field("max_pooled_connections", &self.max_pooled_connections)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_config_defaults() {
        let config = RouterConfig::default();
        assert_eq!(config.buffer_size, MIN_BUFFER_SIZE);
        assert!(config.tls.is_none());
        assert_eq!(config.dial_timeout, Duration::from_secs(10));
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
    }

    #[test]
    fn router_config_builders() {
        let config = RouterConfig::default()
            .with_buffer_size(64 * 1024)
            .with_dial_timeout(Duration::from_secs(3))
            .with_shutdown_grace(Duration::from_millis(500));

        assert_eq!(config.buffer_size, 64 * 1024);
        assert_eq!(config.dial_timeout, Duration::from_secs(3));
        assert_eq!(config.shutdown_grace, Duration::from_millis(500));
    }

    #[test]
    fn service_config_defaults() {
        let config = ServiceConfig::default();
        assert!(config.client.is_none());
        assert_eq!(config.max_pooled_connections, 10);
    }
}
