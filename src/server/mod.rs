//! Async TCP transport using Tokio.
//!
//! Accepts TCP connections, parses HTTP/1.1 requests, and hands each one to
//! a handler function. Persistent connections (keep-alive) and pipelined
//! requests are served in order on each connection.
//!
//! [`start`] wires a [`Gateway`] to a listener and returns a
//! [`TransportHandle`] that can stop it again.

mod gateway;

pub use gateway::Gateway;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_MAX_REQUEST_BYTES;
use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("listener task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Largest health response read back by the self-check.
const HEALTH_PROBE_READ_LIMIT: u64 = 16 * 1024;

/// A bound HTTP/1.1 listener.
///
/// # Examples
///
/// ```rust,no_run
/// use cavebridge::server::Server;
/// use cavebridge::http::{Request, Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(|_req: Request| async {
///         Response::new(StatusCode::Ok).body("Hello!")
///     }).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    max_request_bytes: usize,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        })
    }

    /// Caps the size of one buffered request, head and body together.
    /// Larger requests are answered with `413` and the connection is closed.
    #[must_use]
    pub fn max_request_bytes(mut self, limit: usize) -> Self {
        self.max_request_bytes = limit;
        self
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections forever, dispatching requests to `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        self.run_until(handler, std::future::pending()).await
    }

    /// Accepts connections until `shutdown` completes.
    ///
    /// Connections already accepted keep being served after shutdown; only
    /// the accept loop stops.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run_until<H, F, S>(self, handler: H, shutdown: S) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
        S: Future<Output = ()>,
    {
        let handler = Arc::new(handler);
        let max_request_bytes = self.max_request_bytes;
        info!(address = %self.local_addr, "cavebridge listening");
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                () = &mut shutdown => {
                    info!(address = %self.local_addr, "listener stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, peer_addr, handler, max_request_bytes).await
                {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// A running listener started by [`start`].
#[derive(Debug)]
pub struct TransportHandle {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<(), ServerError>>,
    health_probe: Option<JoinHandle<()>>,
}

impl TransportHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Requests `GET path` from this listener over TCP every `every` until
    /// [`stop`](Self::stop). Non-2xx answers and failures are logged at `warn`.
    #[must_use]
    pub fn with_health_probe(mut self, path: impl Into<String>, every: Duration) -> Self {
        let addr = self.local_addr;
        let path = path.into();
        if let Some(previous) = self.health_probe.take() {
            previous.abort();
        }
        self.health_probe = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match tokio::time::timeout(every, probe_health(addr, &path)).await {
                    Ok(Ok(status)) if (200..300).contains(&status) => {
                        debug!(%path, status, "health check passed");
                    }
                    Ok(Ok(status)) => warn!(%path, status, "health check failed"),
                    Ok(Err(e)) => warn!(%path, error = %e, "health check request failed"),
                    Err(_) => warn!(%path, ?every, "health check timed out"),
                }
            }
        }));
        self
    }

    /// Stops accepting connections and waits for the accept loop to exit.
    ///
    /// # Errors
    ///
    /// Whatever the accept loop failed with, or [`ServerError::Join`] if it panicked.
    pub async fn stop(self) -> Result<(), ServerError> {
        if let Some(probe) = self.health_probe {
            probe.abort();
        }
        // the loop may already have ended on its own
        let _ = self.shutdown.send(());
        self.task.await?
    }
}

/// Binds `addr` and serves `gateway` on a background task.
///
/// # Errors
///
/// [`ServerError::Bind`] if the address cannot be bound.
pub async fn start(addr: impl AsRef<str>, gateway: Gateway) -> Result<TransportHandle, ServerError> {
    let server = Server::bind(addr).await?;
    Ok(spawn(server, gateway))
}

/// Serves `gateway` from an already bound server on a background task.
pub fn spawn(server: Server, gateway: Gateway) -> TransportHandle {
    let local_addr = server.local_addr();
    let (shutdown, stop) = oneshot::channel::<()>();
    let handler = move |request: Request| {
        let gateway = gateway.clone();
        async move { gateway.handle(request).await }
    };
    let task = tokio::spawn(server.run_until(handler, async move {
        let _ = stop.await;
    }));
    TransportHandle {
        local_addr,
        shutdown,
        task,
        health_probe: None,
    }
}

/// Sends one `GET path` with `Connection: close` and returns the status code.
async fn probe_health(addr: SocketAddr, path: &str) -> std::io::Result<u16> {
    let mut stream = TcpStream::connect(addr).await?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut raw = Vec::new();
    stream.take(HEALTH_PROBE_READ_LIMIT).read_to_end(&mut raw).await?;

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    response
        .parse(&raw)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    response.code.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "no status line in health response")
    })
}

/// Serves one TCP connection until the peer closes it, asks for
/// `Connection: close`, or sends something unparseable.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
    max_request_bytes: usize,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        // Serve every complete request already buffered before reading more.
        match Request::parse(&buf) {
            Ok((request, body_offset)) => {
                let content_length = match request.content_length() {
                    Ok(n) => n,
                    Err(e) => return reject(&mut stream, peer_addr, StatusCode::BadRequest, &e).await,
                };
                let total_needed = body_offset.saturating_add(content_length);
                if total_needed > max_request_bytes {
                    return reject_too_large(&mut stream, peer_addr).await;
                }

                if buf.len() >= total_needed {
                    let raw = buf.split_to(total_needed).freeze();
                    let request = request.with_body(raw.slice(body_offset..));
                    let keep_alive = request.is_keep_alive();

                    debug!(
                        peer = %peer_addr,
                        method = %request.method(),
                        target = %request.target(),
                        "dispatching request"
                    );

                    let response = handler(request).await.keep_alive(keep_alive);
                    stream.write_all(&response.into_bytes()).await?;
                    stream.flush().await?;

                    if !keep_alive {
                        debug!(peer = %peer_addr, "closing connection on request");
                        return Ok(());
                    }
                    continue;
                }
            }
            Err(RequestError::Incomplete) => {
                if buf.len() > max_request_bytes {
                    return reject_too_large(&mut stream, peer_addr).await;
                }
            }
            Err(e) => return reject(&mut stream, peer_addr, StatusCode::BadRequest, &e).await,
        }

        let bytes_read = stream.read_buf(&mut buf).await?;
        if bytes_read == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            return Ok(());
        }
    }
}

async fn reject(
    stream: &mut TcpStream,
    peer_addr: SocketAddr,
    status: StatusCode,
    cause: &RequestError,
) -> Result<(), std::io::Error> {
    warn!(peer = %peer_addr, error = %cause, %status, "rejecting request");
    let response = Response::new(status)
        .body(format!("{}: {cause}", status.canonical_reason()))
        .keep_alive(false);
    stream.write_all(&response.into_bytes()).await?;
    stream.flush().await
}

async fn reject_too_large(stream: &mut TcpStream, peer_addr: SocketAddr) -> Result<(), std::io::Error> {
    warn!(peer = %peer_addr, "request too large, sending 413");
    let response = Response::new(StatusCode::PayloadTooLarge)
        .body("Request entity too large")
        .keep_alive(false);
    stream.write_all(&response.into_bytes()).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_server(limit: usize) -> TestServer {
        let server = Server::bind("127.0.0.1:0").await.unwrap().max_request_bytes(limit);
        let addr = server.local_addr();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(
            |req: Request| async move {
                let body = String::from_utf8_lossy(req.body()).into_owned();
                Response::new(StatusCode::Ok).body(format!("{} {}", req.target(), body))
            },
            async move {
                let _ = rx.await;
            },
        ));
        TestServer { addr, stop: tx, task }
    }

    struct TestServer {
        addr: SocketAddr,
        stop: oneshot::Sender<()>,
        task: JoinHandle<Result<(), ServerError>>,
    }

    async fn exchange(addr: SocketAddr, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn serves_body_exactly() {
        let server = echo_server(DEFAULT_MAX_REQUEST_BYTES).await;
        let text = exchange(
            server.addr,
            b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
        )
        .await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("/echo hello"));
        server.stop.send(()).unwrap();
        server.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pipelined_requests_answered_in_order() {
        let server = echo_server(DEFAULT_MAX_REQUEST_BYTES).await;
        let text = exchange(
            server.addr,
            b"POST /a HTTP/1.1\r\nContent-Length: 1\r\n\r\nxGET /b HTTP/1.1\r\nConnection: close\r\n\r\n",
        )
        .await;
        let first = text.find("/a x").unwrap();
        let second = text.find("/b ").unwrap();
        assert!(first < second);
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let server = echo_server(DEFAULT_MAX_REQUEST_BYTES).await;
        let text = exchange(server.addr, b"NOT HTTP AT ALL\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn health_probe_hits_route_until_stopped() {
        use crate::bridge::DispatchBridge;
        use crate::router::RouteRegistry;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let gateway = Gateway::new(
            Arc::new(RouteRegistry::new()),
            DispatchBridge::spawn(None).unwrap(),
        );
        gateway.registry().register("GET", "/health");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        gateway.bridge().set_dispatcher(move |_, req| {
            assert_eq!(req.path(), "/health");
            counter.fetch_add(1, Ordering::SeqCst);
            serde_json::json!({ "status": 200, "body": "{\"ok\":true}" }).into()
        });

        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let transport =
            spawn(server, gateway).with_health_probe("/health", Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(hits.load(Ordering::SeqCst) >= 3, "{hits:?}");

        transport.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = hits.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), settled);
    }

    #[tokio::test]
    async fn oversized_request_gets_413() {
        let server = echo_server(64).await;
        let text = exchange(
            server.addr,
            b"POST /big HTTP/1.1\r\nContent-Length: 1000\r\n\r\n",
        )
        .await;
        assert!(text.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    }
}
