//! The listener and accept loop.
//!
//! [`HttpServer::bind`] acquires the socket (and TLS material) up front so
//! configuration problems fail before the previous daemon generation is
//! torn down. [`HttpServer::serve`] then accepts connections, applying in
//! order: the global connection cap, the per-IP cap, the optional TLS
//! handshake, and the inactivity timeout, before handing the stream to
//! hyper to drive the axum app.
//!
//! Each connection runs as its own task on the runtime; the caps are the
//! only shared state and live in a [`ConnectionTable`] whose guards release
//! slots on drop, whatever way the connection task ends.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, Sleep, sleep};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::{Service, ServiceExt};
use tracing::{debug, warn};

use crate::config::HttpdConfig;

use super::tls::{self, TlsError};

/// hyper rejects smaller HTTP/1.1 read buffers.
const MIN_READ_BUF_SIZE: usize = 8192;

/// Errors acquiring the listener.
#[derive(Debug, Error)]
pub enum BindError {
    /// `httpd.ip` is not a valid address literal.
    #[error("invalid httpd.ip address '{0}'")]
    InvalidAddress(String),

    /// The socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    /// TLS was configured but its material is unusable.
    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// Per-connection limits copied out of the configuration.
#[derive(Debug, Clone)]
struct ConnectionLimits {
    memory_limit: usize,
    idle_timeout: Option<Duration>,
}

/// A bound HTTP(S) listener, ready to serve.
pub struct HttpServer {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    limits: ConnectionLimits,
    connections: Arc<ConnectionTable>,
}

impl HttpServer {
    /// Binds the configured address and loads TLS material if configured.
    pub async fn bind(config: &HttpdConfig) -> Result<Self, BindError> {
        let ip: IpAddr = config
            .ip
            .parse()
            .map_err(|_| BindError::InvalidAddress(config.ip.clone()))?;
        let addr = SocketAddr::new(ip, config.port);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BindError::Bind { addr, source })?;

        let tls = match (&config.certificate, &config.private_key) {
            (Some(certificate), Some(private_key)) => {
                Some(tls::acceptor(certificate, private_key)?)
            }
            _ => None,
        };

        Ok(HttpServer {
            listener,
            tls,
            limits: ConnectionLimits {
                memory_limit: config.memory_limit.max(MIN_READ_BUF_SIZE),
                idle_timeout: config.idle_timeout(),
            },
            connections: Arc::new(ConnectionTable::new(
                config.max_connections,
                config.max_connections_per_ip,
            )),
        })
    }

    /// The bound address (useful with port 0 in tests).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts and serves connections until `shutdown` is cancelled, then
    /// waits for in-flight connections to finish.
    pub async fn serve(self, app: Router, shutdown: CancellationToken) {
        let mut make_service = app.into_make_service_with_connect_info::<SocketAddr>();
        let tracker = TaskTracker::new();

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(connection) => connection,
                    Err(err) => {
                        warn!("failed to accept connection: {err}");
                        continue;
                    }
                },
            };

            let Some(guard) = self.connections.try_admit(peer.ip()) else {
                debug!(peer = %peer, "connection limits reached, dropping connection");
                continue;
            };

            // Infallible and always ready, so no poll_ready dance.
            let service = unwrap_infallible(make_service.call(peer).await);
            let tls = self.tls.clone();
            let limits = self.limits.clone();

            tracker.spawn(async move {
                let _guard = guard;
                handle_connection(stream, peer, tls, limits, service).await;
            });
        }

        // Stop accepting before draining so clients see closed, not hung.
        drop(self.listener);
        tracker.close();
        tracker.wait().await;
    }
}

fn unwrap_infallible<T>(result: Result<T, Infallible>) -> T {
    match result {
        Ok(value) => value,
        Err(never) => match never {},
    }
}

/// Runs one connection to completion.
async fn handle_connection<S>(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    limits: ConnectionLimits,
    service: S,
) where
    S: Service<
            axum::http::Request<hyper::body::Incoming>,
            Response = axum::response::Response,
            Error = Infallible,
        > + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    let transport = match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => Transport::Tls(Box::new(tls_stream)),
            Err(err) => {
                debug!(peer = %peer, "TLS handshake failed: {err}");
                return;
            }
        },
        None => Transport::Plain(stream),
    };

    let io = TokioIo::new(IdleStream::new(transport, limits.idle_timeout));
    let hyper_service = hyper::service::service_fn(move |request| service.clone().oneshot(request));

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder.http1().max_buf_size(limits.memory_limit);

    if let Err(err) = builder.serve_connection(io, hyper_service).await {
        debug!(peer = %peer, "connection closed: {err}");
    }
}

// ─── Connection accounting ───

/// Tracks live connections against the global and per-IP caps.
#[derive(Debug)]
struct ConnectionTable {
    max_connections: usize,
    max_per_ip: usize,
    inner: Mutex<TableInner>,
}

#[derive(Debug, Default)]
struct TableInner {
    total: usize,
    per_ip: HashMap<IpAddr, usize>,
}

impl ConnectionTable {
    fn new(max_connections: usize, max_per_ip: usize) -> Self {
        ConnectionTable {
            max_connections,
            max_per_ip,
            inner: Mutex::new(TableInner::default()),
        }
    }

    /// Reserves a slot for `ip`, or `None` when a cap is reached. The
    /// returned guard releases the slot on drop.
    fn try_admit(self: &Arc<Self>, ip: IpAddr) -> Option<ConnectionGuard> {
        let mut inner = self.inner.lock().expect("connection table poisoned");
        if inner.total >= self.max_connections {
            return None;
        }
        let per_ip = inner.per_ip.entry(ip).or_insert(0);
        if *per_ip >= self.max_per_ip {
            return None;
        }
        *per_ip += 1;
        inner.total += 1;
        Some(ConnectionGuard {
            table: Arc::clone(self),
            ip,
        })
    }

    fn release(&self, ip: IpAddr) {
        let mut inner = self.inner.lock().expect("connection table poisoned");
        inner.total -= 1;
        if let Some(count) = inner.per_ip.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                inner.per_ip.remove(&ip);
            }
        }
    }
}

struct ConnectionGuard {
    table: Arc<ConnectionTable>,
    ip: IpAddr,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.table.release(self.ip);
    }
}

// ─── Transport ───

/// A plain or TLS-wrapped connection stream.
enum Transport {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

// ─── Inactivity timeout ───

/// Wraps a stream so that a pending read past the inactivity deadline
/// fails with `TimedOut`. Any successful read or write pushes the deadline
/// out again.
struct IdleStream<S> {
    inner: S,
    idle: Option<IdleDeadline>,
}

struct IdleDeadline {
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl<S> IdleStream<S> {
    fn new(inner: S, timeout: Option<Duration>) -> Self {
        IdleStream {
            inner,
            idle: timeout.map(|timeout| IdleDeadline {
                timeout,
                sleep: Box::pin(sleep(timeout)),
            }),
        }
    }

    fn bump(&mut self) {
        if let Some(idle) = &mut self.idle {
            idle.sleep.as_mut().reset(Instant::now() + idle.timeout);
        }
    }

    /// Fails the poll when the idle deadline has passed.
    fn check_deadline(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(idle) = &mut self.idle
            && idle.sleep.as_mut().poll(cx).is_ready()
        {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connection idle timeout",
            )));
        }
        Poll::Pending
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.bump();
                Poll::Ready(result)
            }
            Poll::Pending => this.check_deadline(cx),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.bump();
                Poll::Ready(result)
            }
            Poll::Pending => match this.check_deadline(cx) {
                Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
                _ => Poll::Pending,
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
