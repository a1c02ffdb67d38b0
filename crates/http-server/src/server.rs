//! Relay HTTP server.
//!
//! Binds a TCP listener and serves HTTP/1.1 on every accepted connection,
//! dispatching requests through a shared [`Session`].

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use liverelay_relay::{TransportRegistry, UploadOptions};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::session::Session;
use crate::{DEFAULT_BODY_LIMIT, ServerError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind.
    pub listen_addr: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Directory holding `{dir}/{name}` files.
    pub root_dir: PathBuf,
    /// Largest accepted `Content-Length`.
    pub body_limit: u64,
    /// Applied to every upload.
    pub upload: UploadOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            root_dir: PathBuf::from("data"),
            body_limit: DEFAULT_BODY_LIMIT,
            upload: UploadOptions::default(),
        }
    }
}

/// The relay server.
pub struct RelayServer {
    addr: SocketAddr,
    session: Arc<Session>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    running: AtomicBool,
}

impl RelayServer {
    /// Creates a server dispatching into `registry`.
    pub fn new(config: ServerConfig, registry: Arc<TransportRegistry>) -> Arc<Self> {
        let session = Session::new(config.root_dir, config.body_limit, config.upload, registry);
        Arc::new(Self {
            addr: SocketAddr::new(config.listen_addr, config.port),
            session: Arc::new(session),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    pub fn registry(&self) -> &Arc<TransportRegistry> {
        self.session.registry()
    }

    /// Stops accepting and asks open connections to close once their
    /// in-flight response is done.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("relay server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    tracing::debug!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Serves HTTP/1.1 on one connection until the peer closes it or the
    /// server shuts down.
    async fn handle_connection(&self, stream: TcpStream) -> Result<(), ServerError> {
        let session = Arc::clone(&self.session);
        let service = service_fn(move |req| {
            let session = Arc::clone(&session);
            async move { Ok::<_, Infallible>(session.handle(req).await) }
        });

        let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
        tokio::pin!(conn);

        tokio::select! {
            result = conn.as_mut() => result?,
            _ = self.cancel.cancelled() => {
                conn.as_mut().graceful_shutdown();
                conn.await?;
            }
        }
        Ok(())
    }
}
