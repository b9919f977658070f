//! TCP listener: accept loop, admission ceiling and per-connection tasks.
//!
//! The listener thread only accepts and admits. A connection over the
//! ceiling gets a 503 written right there and never reaches the pool; every
//! other connection becomes one task on the [`WorkerPool`] that frames a
//! single request, calls the [`Handler`] and closes the socket.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use socket2::SockRef;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::core::{PoolError, PoolStats, WorkerPool};

use super::framing::{self, FrameLimits, FramingError};
use super::http::{Request, Response};
use super::limiter::{ConnectionGuard, ConnectionLimiter};

/// Turns one framed request into a response.
///
/// Business failures belong in the response body. An `Err` or a panic is
/// caught by the connection task and becomes a 500.
pub trait Handler: Send + Sync + 'static {
    /// Handle one request.
    ///
    /// # Errors
    ///
    /// Any unexpected failure; the caller answers with a 500.
    fn handle(&self, request: &Request) -> anyhow::Result<Response>;

    /// Called once when the server stops accepting, before in-flight
    /// connections are drained. Release anything a request may block on.
    fn shutdown(&self) {}
}

impl<F> Handler for F
where
    F: Fn(&Request) -> anyhow::Result<Response> + Send + Sync + 'static,
{
    fn handle(&self, request: &Request) -> anyhow::Result<Response> {
        self(request)
    }
}

/// Startup failures.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Could not bind the listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        source: io::Error,
    },
    /// Listener socket setup failed.
    #[error("listener i/o error: {0}")]
    Io(#[from] io::Error),
    /// Worker pool could not be started.
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),
    /// Configuration rejected.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Per-connection timeouts and framing bounds.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// Timeout for each read.
    pub read_timeout: Duration,
    /// Timeout for writing the response.
    pub write_timeout: Duration,
    /// Framing bounds.
    pub limits: FrameLimits,
    /// How often the accept loop looks at the stop flag.
    pub accept_poll: Duration,
    /// Enable `SO_KEEPALIVE` on accepted sockets.
    pub tcp_keepalive: bool,
}

impl ConnectionSettings {
    /// Settings taken from a server configuration.
    #[must_use]
    pub const fn from_config(cfg: &ServerConfig) -> Self {
        Self {
            read_timeout: cfg.read_timeout(),
            write_timeout: cfg.write_timeout(),
            limits: cfg.frame_limits(),
            accept_poll: cfg.accept_poll(),
            tcp_keepalive: cfg.tcp_keepalive,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Cloneable handle that asks a running [`Server`] to stop.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Request a stop; the accept loop notices within one poll interval.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Bound listener plus everything needed to serve connections.
pub struct Server {
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    pool: WorkerPool,
    limiter: ConnectionLimiter,
    settings: ConnectionSettings,
    stop: StopHandle,
}

impl Server {
    /// Bind `addr`.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] if the socket cannot be bound, [`ServerError::Io`]
    /// if it cannot be made non-blocking.
    pub fn bind(
        addr: SocketAddr,
        handler: Arc<dyn Handler>,
        pool: WorkerPool,
        limiter: ConnectionLimiter,
        settings: ConnectionSettings,
    ) -> Result<Self, ServerError> {
        let listener =
            TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
        listener.set_nonblocking(true)?;
        info!(
            addr = %listener.local_addr()?,
            workers = pool.worker_count(),
            max_connections = limiter.max_connections(),
            "Listening"
        );
        Ok(Self {
            listener,
            handler,
            pool,
            limiter,
            settings,
            stop: StopHandle::default(),
        })
    }

    /// Address actually bound; useful with port 0.
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for stopping [`Server::run`] from another thread.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Admission limiter shared with connection tasks.
    #[must_use]
    pub const fn limiter(&self) -> &ConnectionLimiter {
        &self.limiter
    }

    /// Worker pool statistics.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Accept connections until stopped, then shut the pool down.
    ///
    /// Running connection tasks finish before this returns.
    ///
    /// # Errors
    ///
    /// Currently only returns `Ok`; accept errors are logged and retried.
    pub fn run(self) -> Result<(), ServerError> {
        while !self.stop.is_stopped() {
            match self.listener.accept() {
                Ok((stream, peer)) => self.dispatch(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(self.settings.accept_poll);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    thread::sleep(self.settings.accept_poll);
                }
            }
        }

        info!("Stop requested, draining connection tasks");
        self.handler.shutdown();
        self.pool.shutdown();
        let stats = self.pool.stats();
        info!(
            completed = stats.completed_tasks,
            discarded = stats.discarded_tasks,
            panicked = stats.panicked_tasks,
            "Server stopped"
        );
        Ok(())
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        // Accepted sockets may inherit non-blocking mode from the listener.
        if let Err(e) = stream.set_nonblocking(false) {
            warn!(%peer, error = %e, "Could not configure accepted socket");
            return;
        }

        let Some(guard) = self.limiter.try_acquire() else {
            warn!(
                %peer,
                active = self.limiter.active_count(),
                "Connection ceiling reached, rejecting"
            );
            reject_unavailable(stream, self.settings.write_timeout);
            return;
        };

        let handler = Arc::clone(&self.handler);
        let settings = self.settings;
        let request_id = Uuid::new_v4();
        let submitted = self.pool.submit(move || {
            serve_connection(stream, peer, handler.as_ref(), &settings, request_id, guard);
        });
        if let Err(e) = submitted {
            warn!(%peer, error = %e, "Could not hand connection to worker pool");
        }
    }
}

fn reject_unavailable(mut stream: TcpStream, write_timeout: Duration) {
    let response = failure(503, "Server busy, try again later");
    if stream.set_write_timeout(Some(write_timeout)).is_ok() {
        if let Err(e) = response.write_to(&mut stream) {
            debug!(error = %e, "Failed to write 503");
        }
    }
    let _ = stream.shutdown(Shutdown::Both);
}

/// One connection, start to finish. The guard is held until return.
fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: &dyn Handler,
    settings: &ConnectionSettings,
    request_id: Uuid,
    _guard: ConnectionGuard,
) {
    let span = info_span!("conn", %request_id, %peer);
    let _enter = span.enter();

    if let Err(e) = configure_stream(&stream, settings) {
        warn!(error = %e, "Could not configure socket");
        let _ = stream.shutdown(Shutdown::Both);
        return;
    }

    let response = match framing::read_request(&mut stream, &settings.limits) {
        Ok(request) => {
            debug!(method = %request.method, path = %request.path, "Request framed");
            call_handler(handler, &request)
        }
        Err(FramingError::Closed) => {
            debug!("Peer closed before sending a request");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        Err(e) => {
            warn!(error = %e, "Framing failed");
            failure(e.status(), &e.to_string())
        }
    };

    let response = response.with_header("X-Request-Id", request_id.to_string());
    if let Err(e) = response.write_to(&mut stream) {
        debug!(error = %e, "Failed to write response");
    } else {
        debug!(status = response.status, "Response written");
    }
    let _ = stream.shutdown(Shutdown::Both);
}

/// Apply timeouts and TCP keepalive to an accepted socket.
fn configure_stream(stream: &TcpStream, settings: &ConnectionSettings) -> io::Result<()> {
    stream.set_read_timeout(Some(settings.read_timeout))?;
    stream.set_write_timeout(Some(settings.write_timeout))?;
    SockRef::from(stream).set_keepalive(settings.tcp_keepalive)
}

fn call_handler(handler: &dyn Handler, request: &Request) -> Response {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request))) {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(error = %e, "Handler failed");
            failure(500, &format!("Internal server error: {e}"))
        }
        Err(_) => {
            error!("Handler panicked");
            failure(500, "Internal server error")
        }
    }
}

fn failure(status: u16, message: &str) -> Response {
    Response::json(
        status,
        &serde_json::json!({ "success": false, "message": message }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_becomes_500() {
        let handler = |_: &Request| -> anyhow::Result<Response> { anyhow::bail!("disk on fire") };
        let resp = call_handler(&handler, &Request::default());
        assert_eq!(resp.status, 500);
        assert!(String::from_utf8_lossy(&resp.body).contains("disk on fire"));
    }

    #[test]
    fn test_handler_panic_becomes_500() {
        let handler = |_: &Request| -> anyhow::Result<Response> { panic!("bug") };
        let resp = call_handler(&handler, &Request::default());
        assert_eq!(resp.status, 500);
    }

    fn accepted_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    #[test]
    fn test_configure_stream_sets_keepalive() {
        let (server, _client) = accepted_pair();
        let settings = ConnectionSettings {
            read_timeout: Duration::from_millis(750),
            tcp_keepalive: true,
            ..ConnectionSettings::default()
        };
        configure_stream(&server, &settings).unwrap();
        assert!(SockRef::from(&server).keepalive().unwrap());
        assert_eq!(server.read_timeout().unwrap(), Some(Duration::from_millis(750)));
    }

    #[test]
    fn test_configure_stream_keepalive_off() {
        let (server, _client) = accepted_pair();
        let settings = ConnectionSettings {
            tcp_keepalive: false,
            ..ConnectionSettings::default()
        };
        configure_stream(&server, &settings).unwrap();
        assert!(!SockRef::from(&server).keepalive().unwrap());
    }

    #[test]
    fn test_handler_shutdown_default_is_noop() {
        let handler = |_: &Request| -> anyhow::Result<Response> { Ok(Response::new(204)) };
        Handler::shutdown(&handler);
        assert_eq!(call_handler(&handler, &Request::default()).status, 204);
    }

    #[test]
    fn test_stop_handle() {
        let stop = StopHandle::default();
        let other = stop.clone();
        assert!(!other.is_stopped());
        stop.stop();
        assert!(other.is_stopped());
    }
}
