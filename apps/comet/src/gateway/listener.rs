//! Accept loops for the client-facing listeners.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_rustls::TlsAcceptor;

use super::channel::Transport;
use super::server::Server;
use super::tls::{self, TlsError};
use super::connection;
use super::transport::{self, TransportError};
use crate::config::Config;

/// Pause after a failed `accept` so a persistent error (e.g. out of file
/// descriptors) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(thiserror::Error, Debug)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("COMET_WSS_BIND requires COMET_TLS_CERT and COMET_TLS_KEY")]
    MissingTlsMaterial,
    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// How accepted sockets are turned into frame transports.
#[derive(Clone)]
pub enum Acceptor {
    Tcp,
    WebSocket,
    WebSocketTls(TlsAcceptor),
}

impl Acceptor {
    pub fn transport(&self) -> Transport {
        match self {
            Self::Tcp => Transport::Tcp,
            Self::WebSocket => Transport::WebSocket,
            Self::WebSocketTls(_) => Transport::WebSocketTls,
        }
    }
}

/// Bound client listeners. Binding happens before anything is spawned so a
/// taken port fails startup.
pub struct Listeners {
    bound: Vec<(TcpListener, Acceptor)>,
}

impl Listeners {
    pub async fn bind(config: &Config) -> Result<Self, ListenerError> {
        let mut bound = vec![
            (bind(config.tcp_bind).await?, Acceptor::Tcp),
            (bind(config.ws_bind).await?, Acceptor::WebSocket),
        ];
        if let Some(addr) = config.wss_bind {
            let (Some(cert), Some(key)) = (&config.tls_cert, &config.tls_key) else {
                return Err(ListenerError::MissingTlsMaterial);
            };
            let acceptor = tls::load_acceptor(cert, key)?;
            bound.push((bind(addr).await?, Acceptor::WebSocketTls(acceptor)));
        }
        Ok(Self { bound })
    }

    /// Local address of the first listener using `transport`.
    pub fn local_addr(&self, transport: Transport) -> Option<SocketAddr> {
        self.bound
            .iter()
            .find(|(_, acceptor)| acceptor.transport() == transport)
            .and_then(|(listener, _)| listener.local_addr().ok())
    }

    pub fn spawn(self, server: Arc<Server>) -> Vec<JoinHandle<()>> {
        self.bound
            .into_iter()
            .map(|(listener, acceptor)| tokio::spawn(run(server.clone(), listener, acceptor)))
            .collect()
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ListenerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ListenerError::Bind { addr, source })
}

/// Accept until the server's listener token is cancelled. Each connection
/// runs on the server's task tracker.
pub async fn run(server: Arc<Server>, listener: TcpListener, acceptor: Acceptor) {
    let shutdown = server.listener_token();
    let transport = acceptor.transport();
    let addr = listener.local_addr().ok();
    tracing::info!(?addr, transport = transport.as_str(), "listener started");

    loop {
        let (socket, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, transport = transport.as_str(), "accept failed");
                    time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!(error = %e, %peer, "set_nodelay failed");
        }
        let server_ref = server.clone();
        let acceptor = acceptor.clone();
        server
            .tasks()
            .spawn(async move { handle(server_ref, socket, peer, acceptor).await });
    }

    tracing::info!(?addr, transport = transport.as_str(), "listener stopped");
}

async fn handle(server: Arc<Server>, socket: TcpStream, peer: SocketAddr, acceptor: Acceptor) {
    let max_body = server.config().max_body;
    let transport = acceptor.transport();
    // The handshake and the AUTH frame share one deadline.
    let auth_deadline = Instant::now() + server.config().auth_timeout;
    let handshake = async move {
        match acceptor {
            Acceptor::Tcp => Ok(transport::framed(socket, max_body)),
            Acceptor::WebSocket => transport::websocket(socket, max_body).await,
            Acceptor::WebSocketTls(tls) => {
                let stream = tls.accept(socket).await.map_err(TransportError::Tls)?;
                transport::websocket(stream, max_body).await
            }
        }
    };

    match time::timeout_at(auth_deadline, handshake).await {
        Ok(Ok((sink, stream))) => {
            connection::serve(server, peer, transport, auth_deadline, sink, stream).await
        }
        Ok(Err(e)) => {
            tracing::debug!(%peer, transport = transport.as_str(), error = %e, "handshake failed");
        }
        Err(_) => {
            tracing::debug!(%peer, transport = transport.as_str(), "handshake timed out");
        }
    }
}
