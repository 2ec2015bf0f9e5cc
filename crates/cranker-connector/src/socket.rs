//! One WebSocket registration serving one proxied request
//!
//! A socket dials `<router>/register`, waits for the router to multiplex a
//! request onto it, proxies that request to the local service while
//! streaming both bodies, and then closes. Sockets are single-use; the pool
//! replaces them to keep the sliding window full.

use std::io;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::Frame;
use hyper::Request;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{
    connect_async_tls_with_config, Connector as TlsConnector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info};
use url::Url;
use uuid::Uuid;

use cranker_proto::{self as proto, BodyMarker, ProtocolViolation, RequestHead};

use crate::buffer::BufferPool;
use crate::config::RouterConfig;
use crate::error::SocketError;
use crate::grace::{signal_fired, GraceToken};
use crate::service::{LocalBody, ServiceClient};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bound on draining queued frames after a request finishes.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// One registration to one router, serving one request lifecycle.
pub(crate) struct ConnectorSocket {
    id: Uuid,
    router: Url,
    route: String,
    config: RouterConfig,
    buffers: Arc<BufferPool>,
    client: Arc<ServiceClient>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectorSocket {
    pub(crate) fn new(
        router: Url,
        route: String,
        config: RouterConfig,
        buffers: Arc<BufferPool>,
        client: Arc<ServiceClient>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            router,
            route,
            config,
            buffers,
            client,
            shutdown,
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    /// Dial the router, then serve one request to completion. `dial_done`
    /// fires as soon as the dial attempt has an outcome, so the pool can
    /// report registration results without waiting for the request.
    pub(crate) async fn run(self, dial_done: Option<oneshot::Sender<()>>) -> Result<(), SocketError> {
        let mut shutdown = self.shutdown.clone();

        let dialed = tokio::select! {
            dialed = self.dial() => dialed,
            _ = signal_fired(&mut shutdown) => {
                debug!(socket = %self.id, "shutdown before registration completed");
                return Ok(());
            }
        };
        if let Some(done) = dial_done {
            let _ = done.send(());
        }

        let ws = dialed?;
        self.serve(ws).await
    }

    async fn dial(&self) -> Result<WsStream, SocketError> {
        debug!(socket = %self.id, router = %self.router, route = %self.route, "socket starting");

        let register_url = format!(
            "{}/{}",
            self.router.as_str().trim_end_matches('/'),
            proto::REGISTER_PATH
        );
        let mut request = register_url
            .as_str()
            .into_client_request()
            .map_err(|e| self.dial_error(None, e.to_string()))?;

        let headers = request.headers_mut();
        headers.insert(
            proto::PROTOCOL_HEADER,
            HeaderValue::from_static(proto::PROTOCOL_VERSION),
        );
        let route = HeaderValue::from_str(&self.route)
            .map_err(|e| self.dial_error(None, format!("route is not a valid header value: {e}")))?;
        headers.insert(proto::ROUTE_HEADER, route);

        let tls = self.config.tls.clone().map(TlsConnector::Rustls);
        let dial = connect_async_tls_with_config(request, None, false, tls);

        let (ws, response) = match tokio::time::timeout(self.config.dial_timeout, dial).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(tungstenite::Error::Http(response))) => {
                let status = response.status();
                return Err(self.dial_error(
                    Some(status.as_u16()),
                    format!("router rejected registration with status {status}"),
                ));
            }
            Ok(Err(e)) => return Err(self.dial_error(None, e.to_string())),
            Err(_) => {
                return Err(self.dial_error(
                    None,
                    format!("dial timed out after {:?}", self.config.dial_timeout),
                ))
            }
        };

        debug!(
            socket = %self.id,
            router = %self.router,
            status = %response.status(),
            "registered with router"
        );
        Ok(ws)
    }

    fn dial_error(&self, status: Option<u16>, message: String) -> SocketError {
        SocketError::Dial {
            router: self.router.to_string(),
            status,
            message,
        }
    }

    async fn serve(&self, ws: WsStream) -> Result<(), SocketError> {
        let (sink, mut source) = ws.split();
        let (writer_tx, writer_rx) = mpsc::channel::<Message>(16);
        let mut writer = tokio::spawn(Self::write_frames(sink, writer_rx, self.id));

        let result = self.serve_inner(&mut source, &writer_tx).await;
        if let Err(err) = &result {
            error!(socket = %self.id, router = %self.router, error = %err, "socket failed");
        }

        drop(writer_tx);
        if matches!(result, Err(SocketError::GraceExceeded)) {
            writer.abort();
        }
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            writer.abort();
            let _ = (&mut writer).await;
        }

        debug!(socket = %self.id, "socket closed");
        result
    }

    /// Idle phase: wait for the request head. Shutdown applies immediately
    /// here; only an in-flight request earns the grace period.
    async fn serve_inner(
        &self,
        source: &mut SplitStream<WsStream>,
        writer: &mpsc::Sender<Message>,
    ) -> Result<(), SocketError> {
        let mut shutdown = self.shutdown.clone();

        let head = loop {
            let msg = tokio::select! {
                msg = source.next() => msg,
                _ = signal_fired(&mut shutdown) => {
                    debug!(socket = %self.id, "shutting down while idle");
                    return Ok(());
                }
            };

            match msg {
                Some(Ok(Message::Text(text))) => break self.decode_head(text.as_bytes())?,
                Some(Ok(Message::Binary(_))) => {
                    return Err(ProtocolViolation::UnexpectedBinaryFrame.into())
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = writer.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Pong(_))) => {
                    debug!(socket = %self.id, "pong received");
                }
                Some(Ok(Message::Close(frame))) => {
                    log_close(self.id, frame.as_ref());
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(SocketError::Transport(e)),
                None => return Ok(()),
            }
        };

        self.serve_request(head, source, writer).await
    }

    fn decode_head(&self, payload: &[u8]) -> Result<RequestHead, SocketError> {
        let limit = self.buffers.buffer_size();
        if payload.len() > limit {
            return Err(ProtocolViolation::OversizedHead {
                len: payload.len(),
                limit,
            }
            .into());
        }
        Ok(proto::parse_request_head(payload)?)
    }

    /// Serving phase: pump request-body frames into the local request while
    /// the response streams back out, until the response pump finishes or
    /// the grace period cuts the socket off.
    async fn serve_request(
        &self,
        head: RequestHead,
        source: &mut SplitStream<WsStream>,
        writer: &mpsc::Sender<Message>,
    ) -> Result<(), SocketError> {
        debug!(
            socket = %self.id,
            method = %head.method,
            target = %head.target,
            "request received"
        );

        let grace = GraceToken::new(self.shutdown.clone(), self.config.shutdown_grace);

        let (body, mut body_tx) = match head.marker {
            BodyMarker::NoBody => (
                Empty::<Bytes>::new().map_err(io::Error::other).boxed(),
                None,
            ),
            BodyMarker::BodyFollows => {
                let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, io::Error>>(1);
                (
                    BodyExt::boxed(StreamBody::new(ReceiverStream::new(rx))),
                    Some(tx),
                )
            }
        };
        // True while the router still owes body frames, even if the local
        // side stopped consuming them.
        let mut body_open = body_tx.is_some();

        let request = self.build_local_request(&head, body)?;

        let mut buf = self.buffers.acquire();
        let max_frame = self.buffers.buffer_size();

        let result = {
            let mut respond = pin!(Self::pump_response(
                self.id,
                &self.client,
                writer,
                request,
                &mut buf,
                max_frame,
            ));

            loop {
                tokio::select! {
                    res = &mut respond => break res,
                    msg = source.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            if !body_open {
                                break Err(ProtocolViolation::UnexpectedBinaryFrame.into());
                            }
                            if let Some(tx) = &body_tx {
                                if tx.send(Ok(Frame::data(Bytes::from(data)))).await.is_err() {
                                    // Local side gave up on the body; keep
                                    // draining the router's frames.
                                    body_tx = None;
                                }
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            if body_open && proto::is_end_of_body_marker(text.as_bytes()) {
                                body_open = false;
                                body_tx = None;
                            } else {
                                if let Some(tx) = body_tx.take() {
                                    let _ = tx
                                        .send(Err(io::Error::other(
                                            "request body aborted by protocol violation",
                                        )))
                                        .await;
                                }
                                break Err(ProtocolViolation::UnexpectedTextFrame(text).into());
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = writer.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            log_close(self.id, frame.as_ref());
                            break Err(SocketError::Transport(tungstenite::Error::ConnectionClosed));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            if let Some(tx) = body_tx.take() {
                                let _ = tx
                                    .send(Err(io::Error::other("websocket read failed")))
                                    .await;
                            }
                            break Err(SocketError::Transport(e));
                        }
                        None => break Err(SocketError::Transport(tungstenite::Error::ConnectionClosed)),
                    },
                    _ = grace.cancelled() => break Err(SocketError::GraceExceeded),
                }
            }
        };

        self.buffers.release(buf);
        result
    }

    fn build_local_request(
        &self,
        head: &RequestHead,
        body: LocalBody,
    ) -> Result<Request<LocalBody>, SocketError> {
        let path = strip_route_prefix(&head.target, &self.route);

        let mut builder = Request::builder().method(head.method.as_str()).uri(path);
        for (name, value) in &head.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder
            .body(body)
            .map_err(|e| ProtocolViolation::InvalidHead(e.to_string()).into())
    }

    /// Dispatch the request to the local service and stream the response
    /// back: one text frame for the head, then binary frames bounded by the
    /// buffer size. On dispatch failure a 502 head goes out before the
    /// socket closes.
    async fn pump_response(
        id: Uuid,
        client: &ServiceClient,
        writer: &mpsc::Sender<Message>,
        request: Request<LocalBody>,
        buf: &mut Vec<u8>,
        max_frame: usize,
    ) -> Result<(), SocketError> {
        let response = match client.execute(request).await {
            Ok(response) => response,
            Err(err) => {
                error!(socket = %id, error = %err, "local service dispatch failed");
                Self::send_bad_gateway(writer, &err).await;
                return Err(err);
            }
        };

        let (parts, mut body) = response.into_parts();
        debug!(socket = %id, status = %parts.status, "local service responded");

        let head = proto::encode_response_head(
            version_str(parts.version),
            parts.status.as_u16(),
            parts.status.canonical_reason().unwrap_or(""),
            &header_pairs(&parts.headers),
        );
        if writer
            .send(Message::Text(String::from_utf8_lossy(&head).into_owned()))
            .await
            .is_err()
        {
            return Err(SocketError::Transport(tungstenite::Error::ConnectionClosed));
        }

        let mut sent = 0usize;
        while let Some(frame) = body.frame().await {
            let frame = frame
                .map_err(|e| SocketError::Upstream(format!("reading local response body: {e}")))?;
            let Ok(data) = frame.into_data() else {
                continue;
            };
            for chunk in data.chunks(max_frame) {
                buf.clear();
                buf.extend_from_slice(chunk);
                sent += chunk.len();
                if writer.send(Message::Binary(buf.clone())).await.is_err() {
                    return Err(SocketError::Transport(tungstenite::Error::ConnectionClosed));
                }
            }
        }

        debug!(socket = %id, bytes = sent, "response sent");
        Ok(())
    }

    async fn send_bad_gateway(writer: &mpsc::Sender<Message>, err: &SocketError) {
        let body = err.to_string();
        let headers = vec![
            ("content-type".to_string(), "text/plain".to_string()),
            ("content-length".to_string(), body.len().to_string()),
        ];
        let head = proto::encode_response_head("HTTP/1.1", 502, "Bad Gateway", &headers);

        if writer
            .send(Message::Text(String::from_utf8_lossy(&head).into_owned()))
            .await
            .is_ok()
        {
            let _ = writer.send(Message::Binary(body.into_bytes())).await;
        }
    }

    async fn write_frames(
        mut sink: SplitSink<WsStream, Message>,
        mut frames: mpsc::Receiver<Message>,
        id: Uuid,
    ) {
        while let Some(msg) = frames.recv().await {
            if let Err(e) = sink.send(msg).await {
                debug!(socket = %id, error = %e, "websocket send failed");
                break;
            }
        }
        // Closing the sink sends the close frame if one has not gone out.
        let _ = sink.close().await;
    }
}

fn log_close(id: Uuid, frame: Option<&CloseFrame<'_>>) {
    match frame {
        Some(frame) => info!(
            socket = %id,
            code = %frame.code,
            reason = %frame.reason,
            "router closed socket"
        ),
        None => info!(socket = %id, "router closed socket"),
    }
}

/// Strip the leading `/<route>` the router prefixes onto the target.
fn strip_route_prefix<'a>(target: &'a str, route: &str) -> &'a str {
    let rest = match target.strip_prefix('/') {
        Some(rest) if rest.starts_with(route) => &rest[route.len()..],
        _ => target,
    };
    if rest.is_empty() {
        "/"
    } else {
        rest
    }
}

fn version_str(version: hyper::Version) -> &'static str {
    match version {
        hyper::Version::HTTP_09 => "HTTP/0.9",
        hyper::Version::HTTP_10 => "HTTP/1.0",
        hyper::Version::HTTP_11 => "HTTP/1.1",
        hyper::Version::HTTP_2 => "HTTP/2.0",
        hyper::Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

fn header_pairs(headers: &hyper::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or("").to_string(),
            )
        })
        .collect()
}
