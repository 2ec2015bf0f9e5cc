//! Pooled HTTP/1.1 client for the process-local service
//!
//! Keeps a small pool of http1 connections to the local service so
//! consecutive proxied requests reuse TCP connections. Bodies stream in both
//! directions; nothing is buffered whole.

use std::fmt;
use std::io;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::SocketError;

/// Body type sent to the local service: empty for bodiless requests,
/// channel-fed for streamed ones.
pub type LocalBody = BoxBody<Bytes, io::Error>;

struct PooledConnection {
    sender: http1::SendRequest<LocalBody>,
}

/// HTTP client for the local service with connection reuse.
pub struct ServiceClient {
    /// Target `host:port`.
    target: String,
    pool: Mutex<Vec<PooledConnection>>,
    max_pooled: usize,
}

impl ServiceClient {
    pub fn new(target: impl Into<String>, max_pooled: usize) -> Self {
        Self {
            target: target.into(),
            pool: Mutex::new(Vec::new()),
            max_pooled,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Send a request to the local service, reusing a pooled connection when
    /// one is still usable.
    pub async fn execute(
        &self,
        request: Request<LocalBody>,
    ) -> Result<Response<Incoming>, SocketError> {
        let mut sender = self.checkout().await?;

        let response = sender.send_request(request).await.map_err(|e| {
            SocketError::Upstream(format!("request to {} failed: {}", self.target, e))
        })?;

        self.checkin(sender).await;
        Ok(response)
    }

    async fn checkout(&self) -> Result<http1::SendRequest<LocalBody>, SocketError> {
        {
            let mut pool = self.pool.lock().await;
            while let Some(conn) = pool.pop() {
                if conn.sender.is_ready() {
                    debug!(target = %self.target, "reusing pooled local connection");
                    return Ok(conn.sender);
                }
                debug!(target = %self.target, "discarding stale local connection");
            }
        }

        debug!(target = %self.target, "opening local connection");
        let stream = TcpStream::connect(&self.target).await.map_err(|e| {
            SocketError::Upstream(format!("failed to connect to {}: {}", self.target, e))
        })?;

        let io = TokioIo::new(stream);
        let (sender, conn) = http1::handshake::<_, LocalBody>(io).await.map_err(|e| {
            SocketError::Upstream(format!("handshake with {} failed: {}", self.target, e))
        })?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("local connection closed: {}", e);
            }
        });

        Ok(sender)
    }

    async fn checkin(&self, sender: http1::SendRequest<LocalBody>) {
        if !sender.is_ready() {
            return;
        }

        let mut pool = self.pool.lock().await;
        if pool.len() < self.max_pooled {
            pool.push(PooledConnection { sender });
        }
    }
}

impl fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceClient")
            .field("target", &self.target)
            .finish()
    }
}
