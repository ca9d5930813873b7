//! Acceptor side: listens on a Unix socket, a TCP port or a WebSocket port and
//! turns every inbound connection into a [`Client`] in the acceptor role.

use std::{fmt, net::SocketAddr, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use dashmap::DashMap;
use serde_json::Value;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{OwnedSemaphorePermit, Semaphore},
    time::{sleep, timeout},
};
use tokio_tungstenite::accept_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{HandshakeFailure, SessionError},
    handle::HandleMap,
    session::{Client, CloseReason, Endpoint, Role, SessionOptions},
    wire,
};

/// What to listen on. Parsed from the same notation as [`Endpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listen {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(String),
    WebSocket(String),
}

impl FromStr for Listen {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<Endpoint>()? {
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Listen::Unix(path)),
            Endpoint::Tcp(addr) => Ok(Listen::Tcp(addr)),
            Endpoint::WebSocket(url) => {
                let host = url
                    .host_str()
                    .ok_or_else(|| SessionError::InvalidEndpoint(s.to_string()))?;
                let port = url.port_or_known_default().unwrap_or(80);
                Ok(Listen::WebSocket(format!("{host}:{port}")))
            }
        }
    }
}

impl fmt::Display for Listen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Listen::Unix(path) => write!(f, "unix:{}", path.display()),
            Listen::Tcp(addr) => write!(f, "tcp://{addr}"),
            Listen::WebSocket(addr) => write!(f, "ws://{addr}"),
        }
    }
}

/// The address a server actually bound, with resolved ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddr {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(SocketAddr),
    WebSocket(SocketAddr),
}

impl BoundAddr {
    /// Where a connector should dial to reach this server.
    pub fn endpoint(&self) -> Endpoint {
        match self {
            #[cfg(unix)]
            BoundAddr::Unix(path) => Endpoint::Unix(path.clone()),
            BoundAddr::Tcp(addr) => Endpoint::Tcp(addr.to_string()),
            BoundAddr::WebSocket(addr) => match Url::parse(&format!("ws://{addr}")) {
                Ok(url) => Endpoint::WebSocket(url),
                Err(_) => Endpoint::Tcp(addr.to_string()),
            },
        }
    }
}

impl fmt::Display for BoundAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Live sessions allowed at once; `None` means unlimited.
    pub max_connections: Option<usize>,
    pub session: SessionOptions,
}

enum Listener {
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
    Tcp(TcpListener),
    WebSocket(TcpListener),
}

enum Conn {
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    Tcp(TcpStream, SocketAddr),
    WebSocket(TcpStream, SocketAddr),
}

impl Conn {
    fn peer(&self) -> String {
        match self {
            #[cfg(unix)]
            Conn::Unix(_) => "unix".to_string(),
            Conn::Tcp(_, addr) | Conn::WebSocket(_, addr) => addr.to_string(),
        }
    }
}

impl Listener {
    async fn accept(&self) -> std::io::Result<Conn> {
        match self {
            #[cfg(unix)]
            Listener::Unix(listener) => Ok(Conn::Unix(listener.accept().await?.0)),
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok(Conn::Tcp(stream, addr))
            }
            Listener::WebSocket(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok(Conn::WebSocket(stream, addr))
            }
        }
    }
}

struct ServerInner {
    addr: BoundAddr,
    options: ServerOptions,
    handles: HandleMap,
    sessions: DashMap<String, Client>,
    slots: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
}

/// A listening transport and its live sessions. Clones share the server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Binds `listen` and starts accepting. Stale Unix socket files are
    /// removed first.
    pub async fn bind(
        listen: Listen,
        options: ServerOptions,
        handles: HandleMap,
    ) -> Result<Server, SessionError> {
        let (listener, addr) = match listen {
            #[cfg(unix)]
            Listen::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(&path)?;
                    debug!(path = %path.display(), "removed stale socket file");
                }
                let listener = tokio::net::UnixListener::bind(&path)?;
                (Listener::Unix(listener), BoundAddr::Unix(path))
            }
            Listen::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await?;
                let local = listener.local_addr()?;
                (Listener::Tcp(listener), BoundAddr::Tcp(local))
            }
            Listen::WebSocket(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await?;
                let local = listener.local_addr()?;
                (Listener::WebSocket(listener), BoundAddr::WebSocket(local))
            }
        };

        let slots = options.max_connections.map(|n| Arc::new(Semaphore::new(n)));
        let server = Server {
            inner: Arc::new(ServerInner {
                addr,
                options,
                handles,
                sessions: DashMap::new(),
                slots,
                cancel: CancellationToken::new(),
            }),
        };
        info!(addr = %server.local_addr(), max_connections = ?server.inner.options.max_connections, "listening");
        tokio::spawn(server.clone().accept_loop(listener));
        Ok(server)
    }

    pub fn local_addr(&self) -> &BoundAddr {
        &self.inner.addr
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.addr.endpoint()
    }

    pub fn handles(&self) -> &HandleMap {
        &self.inner.handles
    }

    /// Snapshot of the live sessions.
    pub fn sessions(&self) -> Vec<Client> {
        self.inner.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn session(&self, id: &str) -> Option<Client> {
        self.inner.sessions.get(id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Notifies every live session; returns how many accepted the frame.
    pub fn broadcast(&self, name: &str, args: Value) -> usize {
        self.sessions()
            .into_iter()
            .filter(|client| client.notify(name, args.clone()).is_ok())
            .count()
    }

    /// Stops accepting and force-closes every live session.
    pub fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        for client in self.sessions() {
            client.force_close_with(CloseReason::ServerShutdown);
        }
        #[cfg(unix)]
        if let BoundAddr::Unix(path) = &self.inner.addr {
            let _ = std::fs::remove_file(path);
        }
        info!(addr = %self.inner.addr, "server closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once [`Server::close`] was called.
    pub async fn stopped(&self) {
        self.inner.cancel.cancelled().await;
    }

    async fn accept_loop(self, listener: Listener) {
        let cancel = self.inner.cancel.clone();
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let conn = match accepted {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let permit = match &self.inner.slots {
                Some(slots) => match slots.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        warn!(peer = %conn.peer(), "connection limit exceeded, dropping connection");
                        continue;
                    }
                },
                None => None,
            };
            tokio::spawn(self.clone().serve(conn, permit));
        }
        debug!(addr = %self.inner.addr, "accept loop stopped");
    }

    /// Runs one inbound connection until its session closes. The permit is
    /// held for the whole lifetime of the session.
    async fn serve(self, conn: Conn, permit: Option<OwnedSemaphorePermit>) {
        let options = self.inner.options.session.clone();
        let handles = self.inner.handles.clone();
        let cancel = self.inner.cancel.clone();
        let peer = conn.peer();

        let setup = async move {
            let wire = match conn {
                #[cfg(unix)]
                Conn::Unix(stream) => {
                    let (reader, writer) = stream.into_split();
                    wire::stream(reader, writer, options.framing, options.max_frame)
                }
                Conn::Tcp(stream, _) => {
                    let _ = stream.set_nodelay(true);
                    let (reader, writer) = stream.into_split();
                    wire::stream(reader, writer, options.framing, options.max_frame)
                }
                Conn::WebSocket(stream, _) => {
                    let ws = timeout(options.handshake_timeout, accept_async(stream))
                        .await
                        .map_err(|_| {
                            HandshakeFailure::Timeout(options.handshake_timeout.as_millis() as u64)
                        })??;
                    wire::websocket(ws)
                }
            };
            Client::establish(wire, Role::Acceptor, options, handles).await
        };

        let client = tokio::select! {
            _ = cancel.cancelled() => return,
            result = setup => match result {
                Ok(client) => client,
                Err(err) => {
                    warn!(%peer, error = %err, "inbound session failed");
                    return;
                }
            },
        };

        let id = client.id().to_string();
        self.inner.sessions.insert(id.clone(), client.clone());
        // close() may have run between the handshake and the insert
        if cancel.is_cancelled() {
            client.force_close_with(CloseReason::ServerShutdown);
        }
        debug!(session = %id, %peer, live = self.inner.sessions.len(), "session added");

        let reason = client.closed().await;
        self.inner.sessions.remove(&id);
        debug!(session = %id, %reason, live = self.inner.sessions.len(), "session removed");
        drop(permit);
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.inner.addr)
            .field("sessions", &self.inner.sessions.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
