//! Connector pool: the sliding window of router sockets
//!
//! Owns one socket per (router, window slot). Sockets are single-use, so the
//! pool watches for terminations and dials replacements to keep the window
//! full until shutdown begins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::buffer::BufferPool;
use crate::config::{RouterConfig, ServiceConfig};
use crate::error::{ConfigError, SocketError};
use crate::grace::signal_fired;
use crate::service::ServiceClient;
use crate::socket::ConnectorSocket;

const STATE_CONFIGURED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_SHUTTING_DOWN: u8 = 2;
const STATE_TERMINATED: u8 = 3;

/// Connects a local service to cranker routers and keeps the registrations
/// replenished.
pub struct Connector {
    router_config: RouterConfig,
    service_config: ServiceConfig,
    buffers: Arc<BufferPool>,
    state: AtomicU8,
    sockets: Arc<Mutex<Vec<SocketHandle>>>,
    shutdown: watch::Sender<bool>,
    replenisher: Mutex<Option<JoinHandle<()>>>,
}

struct SocketHandle {
    id: Uuid,
    task: JoinHandle<()>,
}

struct SocketEvent {
    id: Uuid,
    router: Url,
    failed_dial: bool,
}

/// Everything needed to start a socket for one window slot.
#[derive(Clone)]
struct Launcher {
    route: String,
    router_config: RouterConfig,
    buffers: Arc<BufferPool>,
    client: Arc<ServiceClient>,
    sockets: Arc<Mutex<Vec<SocketHandle>>>,
    events: mpsc::Sender<SocketEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Launcher {
    fn launch(&self, router: Url, dial_done: Option<oneshot::Sender<()>>) {
        if *self.shutdown.borrow() {
            return;
        }

        let socket = ConnectorSocket::new(
            router.clone(),
            self.route.clone(),
            self.router_config.clone(),
            self.buffers.clone(),
            self.client.clone(),
            self.shutdown.clone(),
        );
        let id = socket.id();
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            let result = socket.run(dial_done).await;
            let failed_dial = matches!(result, Err(SocketError::Dial { .. }));
            match &result {
                Ok(()) => debug!(socket = %id, router = %router, "socket finished"),
                Err(e) => error!(socket = %id, router = %router, error = %e, "socket terminated"),
            }
            let _ = events.send(SocketEvent {
                id,
                router,
                failed_dial,
            })
            .await;
        });

        if let Ok(mut sockets) = self.sockets.lock() {
            sockets.push(SocketHandle { id, task });
        }
    }
}

impl Connector {
    pub fn new(router_config: RouterConfig, service_config: ServiceConfig) -> Self {
        let buffers = Arc::new(BufferPool::new(router_config.buffer_size));
        let (shutdown, _) = watch::channel(false);

        Self {
            router_config,
            service_config,
            buffers,
            state: AtomicU8::new(STATE_CONFIGURED),
            sockets: Arc::new(Mutex::new(Vec::new())),
            shutdown,
            replenisher: Mutex::new(None),
        }
    }

    /// Register `sliding_window` sockets with every router and return once
    /// each initial dial attempt has an outcome. Per-socket dial failures
    /// are logged and replaced in the background; only configuration errors
    /// are returned.
    pub async fn connect(
        &self,
        router_urls: &[&str],
        sliding_window: usize,
        service_name: &str,
        service_url: &str,
    ) -> Result<(), ConfigError> {
        let service = Url::parse(service_url).map_err(|source| ConfigError::InvalidServiceUrl {
            url: service_url.to_string(),
            source,
        })?;
        let host = service
            .host_str()
            .ok_or_else(|| ConfigError::MissingServiceHost(service_url.to_string()))?;
        let port = service.port_or_known_default().unwrap_or(80);
        let authority = format!("{host}:{port}");

        let mut routers = Vec::with_capacity(router_urls.len());
        for raw in router_urls {
            let url = Url::parse(raw).map_err(|source| ConfigError::InvalidRouterUrl {
                url: raw.to_string(),
                source,
            })?;
            match url.scheme() {
                "ws" | "wss" => {}
                _ => return Err(ConfigError::UnsupportedScheme(raw.to_string())),
            }
            routers.push(url);
        }

        self.state
            .compare_exchange(
                STATE_CONFIGURED,
                STATE_RUNNING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| ConfigError::AlreadyStarted)?;

        let client = self.service_config.client.clone().unwrap_or_else(|| {
            Arc::new(ServiceClient::new(
                authority,
                self.service_config.max_pooled_connections,
            ))
        });

        let (event_tx, event_rx) = mpsc::channel(64);
        let launcher = Launcher {
            route: service_name.to_string(),
            router_config: self.router_config.clone(),
            buffers: self.buffers.clone(),
            client,
            sockets: self.sockets.clone(),
            events: event_tx,
            shutdown: self.shutdown.subscribe(),
        };

        let replenisher = tokio::spawn(Self::replenish(
            launcher.clone(),
            event_rx,
            self.shutdown.subscribe(),
        ));
        if let Ok(mut slot) = self.replenisher.lock() {
            *slot = Some(replenisher);
        }

        info!(
            routers = routers.len(),
            window = sliding_window,
            route = service_name,
            "connecting"
        );

        let mut dials = Vec::with_capacity(routers.len() * sliding_window);
        for router in &routers {
            for _ in 0..sliding_window {
                let (done_tx, done_rx) = oneshot::channel();
                launcher.launch(router.clone(), Some(done_tx));
                dials.push(done_rx);
            }
        }

        // The socket-list lock is only touched per launch; nothing is held
        // across this wait, so shutdown can preempt a slow dial.
        for dial in dials {
            let _ = dial.await;
        }

        Ok(())
    }

    /// Replace terminated sockets while the pool runs. Failed dials back
    /// off per router; anything else is replaced immediately.
    async fn replenish(
        launcher: Launcher,
        mut events: mpsc::Receiver<SocketEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff: HashMap<Url, RedialBackoff> = HashMap::new();

        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = signal_fired(&mut shutdown) => break,
            };

            if let Ok(mut sockets) = launcher.sockets.lock() {
                sockets.retain(|handle| handle.id != event.id);
            }

            if *shutdown.borrow() {
                continue;
            }

            let slot = backoff
                .entry(event.router.clone())
                .or_insert_with(RedialBackoff::new);

            if event.failed_dial {
                let delay = slot.next_delay();
                debug!(router = %event.router, ?delay, "delaying replacement dial");
                let launcher = launcher.clone();
                let router = event.router;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    launcher.launch(router, None);
                });
            } else {
                slot.reset();
                debug!(router = %event.router, "dialling replacement socket");
                launcher.launch(event.router, None);
            }
        }
    }

    /// Signal every socket, then wait for them all to finish. In-flight
    /// requests get the configured grace period to drain. Idempotent; never
    /// fails.
    pub async fn shutdown(&self) {
        let from_running = self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_SHUTTING_DOWN,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if !from_running {
            let _ = self.state.compare_exchange(
                STATE_CONFIGURED,
                STATE_TERMINATED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            return;
        }

        let _ = self.shutdown.send(true);

        let handles = match self.sockets.lock() {
            Ok(mut sockets) => std::mem::take(&mut *sockets),
            Err(_) => Vec::new(),
        };

        info!(sockets = handles.len(), "shutting down connector");

        // A launch that raced this snapshot still observes the shutdown
        // signal and exits on its own.
        for handle in handles {
            if handle.task.await.is_err() {
                warn!(socket = %handle.id, "socket task aborted or panicked");
            }
        }

        let replenisher = match self.replenisher.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(task) = replenisher {
            let _ = task.await;
        }

        self.state.store(STATE_TERMINATED, Ordering::SeqCst);
        info!("connector terminated");
    }
}

/// Exponential backoff for replacement dials to an unresponsive router.
struct RedialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl RedialBackoff {
    fn new() -> Self {
        let initial = Duration::from_secs(1);
        Self {
            initial,
            max: Duration::from_secs(60),
            current: initial,
        }
    }

    /// Delay before the next dial; grows until [`reset`](Self::reset).
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let mut backoff = RedialBackoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
            current: Duration::from_millis(10),
        };

        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn connect_rejects_invalid_router_url() {
        let connector = Connector::new(RouterConfig::default(), ServiceConfig::default());
        let err = connector
            .connect(&["not a url"], 1, "svc", "http://127.0.0.1:8080")
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRouterUrl { .. }));
    }

    #[tokio::test]
    async fn connect_rejects_non_websocket_scheme() {
        let connector = Connector::new(RouterConfig::default(), ServiceConfig::default());
        let err = connector
            .connect(&["http://router.example"], 1, "svc", "http://127.0.0.1:8080")
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedScheme(_)));
    }

    #[tokio::test]
    async fn connect_rejects_invalid_service_url() {
        let connector = Connector::new(RouterConfig::default(), ServiceConfig::default());
        let err = connector
            .connect(&["ws://router.example"], 1, "svc", "::")
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidServiceUrl { .. }));
    }

    #[tokio::test]
    async fn connect_twice_is_an_error() {
        let connector = Connector::new(RouterConfig::default(), ServiceConfig::default());
        connector
            .connect(&[], 1, "svc", "http://127.0.0.1:8080")
            .await
            .unwrap();

        let err = connector
            .connect(&[], 1, "svc", "http://127.0.0.1:8080")
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::AlreadyStarted));

        connector.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let connector = Connector::new(RouterConfig::default(), ServiceConfig::default());
        connector
            .connect(&[], 1, "svc", "http://127.0.0.1:8080")
            .await
            .unwrap();

        connector.shutdown().await;
        connector.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_before_connect_is_a_no_op() {
        let connector = Connector::new(RouterConfig::default(), ServiceConfig::default());
        connector.shutdown().await;
    }
}
