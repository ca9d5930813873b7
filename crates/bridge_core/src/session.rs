//! A session is one negotiated connection, independent of the transport that
//! carries it. Both ends can call each other: replies are matched to pending
//! requests by `echo`, inbound calls are looked up in the session's
//! [`HandleMap`].
//!
//! Per session there is one reader task, one writer task, a heartbeat task on
//! WebSocket transports, and one task per inbound call.
//!
//! ```ignore
//! let endpoint: Endpoint = "ws://127.0.0.1:7700".parse()?;
//! let client = Client::connect(&endpoint, SessionOptions::named("console"), HandleMap::new()).await?;
//! let echoed = client.request("echo", json!("hi")).await?;
//! client.close().await;
//! ```

use std::{
    fmt,
    path::PathBuf,
    str::FromStr,
    sync::{
        Arc, Mutex, MutexGuard, OnceLock,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use serde_json::Value;
use strum_macros::{AsRefStr, Display};
use tokio::{
    net::TcpStream,
    sync::{Notify, mpsc, oneshot, watch},
    time::{Instant, sleep, timeout, timeout_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    encoder::{Encoder, EncoderPrefs, EncoderRegistry, Negotiated, negotiate_all},
    error::{HandshakeFailure, SessionError},
    frame::{Framing, MAX_FRAME_SIZE},
    handle::HandleMap,
    packet::{HandshakeMeta, Packet, PacketKind},
    wire::{self, Inbound, Wire},
};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a graceful close waits for the writer to flush before it gives up
/// and closes immediately.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

// -----------------------------------------------------------------------------
// Endpoints & options
// -----------------------------------------------------------------------------

/// Where a connector dials.
///
/// Parsed from `unix:/run/bot.sock` (or any absolute path), `tcp://host:port`
/// (or bare `host:port`) and `ws://host:port/path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(String),
    WebSocket(Url),
}

impl FromStr for Endpoint {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.starts_with("ws://") || s.starts_with("wss://") {
            let url = Url::parse(s).map_err(|e| SessionError::InvalidEndpoint(format!("{s}: {e}")))?;
            return Ok(Endpoint::WebSocket(url));
        }
        #[cfg(unix)]
        {
            if let Some(path) = s.strip_prefix("unix:") {
                return Ok(Endpoint::Unix(PathBuf::from(path)));
            }
            if s.starts_with('/') || s.starts_with("./") {
                return Ok(Endpoint::Unix(PathBuf::from(s)));
            }
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            return Ok(Endpoint::Tcp(addr.to_string()));
        }
        if s.contains(':') {
            return Ok(Endpoint::Tcp(s.to_string()));
        }
        Err(SessionError::InvalidEndpoint(s.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::WebSocket(url) => write!(f, "{url}"),
        }
    }
}

/// WebSocket liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Everything a session needs besides its transport and handlers.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub id: String,                      // advertised in the handshake meta
    pub name: String,
    pub encoders: EncoderPrefs,
    pub registry: Arc<EncoderRegistry>,
    pub framing: Framing,                // byte-stream transports only
    pub max_frame: usize,
    pub handshake_timeout: Duration,
    pub heartbeat: Option<Heartbeat>,    // WebSocket transports only
    pub high_water: usize,               // queued frames before write() reports backpressure
    pub low_water: usize,
    pub max_decode_failures: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: "botbridge".into(),
            encoders: EncoderPrefs::default(),
            registry: EncoderRegistry::global(),
            framing: Framing::default(),
            max_frame: MAX_FRAME_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            heartbeat: Some(Heartbeat::default()),
            high_water: 1024,
            low_water: 256,
            max_decode_failures: 8,
        }
    }
}

impl SessionOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The preferences actually advertised: only what the registry can build,
    /// and plain JSON when frames are delimiter-separated.
    pub fn advertised(&self) -> EncoderPrefs {
        let mut prefs = self.registry.filter_supported(&self.encoders);
        if let Framing::Delimited(_) = self.framing {
            prefs.encode.retain(|name| name == "json");
            prefs.verify.clear();
            prefs.compress.clear();
        }
        prefs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Connector,
    Acceptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` or `force_close()` on this side.
    Local,
    PeerClosed,
    Transport(String),
    HeartbeatTimeout,
    DecodeFailures(usize),
    ServerShutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::Transport(err) => write!(f, "transport failure: {err}"),
            CloseReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            CloseReason::DecodeFailures(n) => write!(f, "{n} consecutive undecodable frames"),
            CloseReason::ServerShutdown => write!(f, "server shutdown"),
        }
    }
}

// -----------------------------------------------------------------------------
// Client
// -----------------------------------------------------------------------------

enum Outbound {
    Frame(Vec<u8>),
    Ping,
    Shutdown,
}

type CloseCallback = Box<dyn FnOnce(CloseReason) + Send>;
type Pending = oneshot::Sender<Result<Value, SessionError>>;

struct Inner {
    id: String,
    role: Role,
    local: HandshakeMeta,
    peer: HandshakeMeta,
    encoder: Encoder,
    handles: HandleMap,
    outbound: mpsc::UnboundedSender<Outbound>,
    queued: AtomicUsize,
    high_water: usize,
    low_water: usize,
    max_decode_failures: usize,
    drain: Notify,
    pong: Notify,
    pending: DashMap<String, Pending>,
    next_echo: AtomicU64,
    state: watch::Sender<SessionState>,
    close_reason: OnceLock<CloseReason>,
    on_close: Mutex<Option<Vec<CloseCallback>>>,
    cancel: CancellationToken,
}

/// Handle to one open session. Clones share the session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Client {
    /// Dials `endpoint` and runs the connector side of the handshake.
    pub async fn connect(
        endpoint: &Endpoint,
        options: SessionOptions,
        handles: HandleMap,
    ) -> Result<Client, SessionError> {
        debug!(%endpoint, name = %options.name, "connecting");
        let (framing, max_frame) = (options.framing, options.max_frame);
        let dial = async {
            let wire = match endpoint {
                #[cfg(unix)]
                Endpoint::Unix(path) => {
                    let (reader, writer) = tokio::net::UnixStream::connect(path).await?.into_split();
                    wire::stream(reader, writer, framing, max_frame)
                }
                Endpoint::Tcp(addr) => {
                    let stream = TcpStream::connect(addr.as_str()).await?;
                    stream.set_nodelay(true)?;
                    let (reader, writer) = stream.into_split();
                    wire::stream(reader, writer, framing, max_frame)
                }
                Endpoint::WebSocket(url) => {
                    let (ws, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
                    wire::websocket(ws)
                }
            };
            Ok::<_, SessionError>(wire)
        };
        // a peer that accepts but never answers the upgrade must not hang the dial
        let wire = timeout(options.handshake_timeout, dial)
            .await
            .map_err(|_| HandshakeFailure::Timeout(options.handshake_timeout.as_millis() as u64))??;
        Self::establish(wire, Role::Connector, options, handles).await
    }

    /// Two sessions connected back to back over an in-memory pipe, connector
    /// first. Useful for in-process peers and tests.
    pub async fn pair(
        connector: (SessionOptions, HandleMap),
        acceptor: (SessionOptions, HandleMap),
    ) -> Result<(Client, Client), SessionError> {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (left_reader, left_writer) = tokio::io::split(left);
        let (right_reader, right_writer) = tokio::io::split(right);
        let (c_options, c_handles) = connector;
        let (a_options, a_handles) = acceptor;
        let c_wire = wire::stream(left_reader, left_writer, c_options.framing, c_options.max_frame);
        let a_wire = wire::stream(right_reader, right_writer, a_options.framing, a_options.max_frame);
        tokio::try_join!(
            Self::establish(c_wire, Role::Connector, c_options, c_handles),
            Self::establish(a_wire, Role::Acceptor, a_options, a_handles),
        )
    }

    /// Handshakes over `wire` and, on success, starts the session tasks.
    pub(crate) async fn establish(
        mut wire: Wire,
        role: Role,
        options: SessionOptions,
        handles: HandleMap,
    ) -> Result<Client, SessionError> {
        let (local, peer, encoder) = match handshake(&mut wire, role, &options).await {
            Ok(done) => done,
            Err(failure) => {
                warn!(name = %options.name, ?role, state = %SessionState::Failed, error = %failure, "handshake failed");
                wire.sink.shutdown().await;
                return Err(failure.into());
            }
        };

        let (outbound, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Open);
        let client = Client {
            inner: Arc::new(Inner {
                id: Uuid::new_v4().to_string(),
                role,
                local,
                peer,
                encoder,
                handles,
                outbound,
                queued: AtomicUsize::new(0),
                high_water: options.high_water.max(1),
                low_water: options.low_water.min(options.high_water),
                max_decode_failures: options.max_decode_failures.max(1),
                drain: Notify::new(),
                pong: Notify::new(),
                pending: DashMap::new(),
                next_echo: AtomicU64::new(1),
                state,
                close_reason: OnceLock::new(),
                on_close: Mutex::new(Some(Vec::new())),
                cancel: CancellationToken::new(),
            }),
        };

        let negotiated = client.negotiated();
        info!(
            session = %client.id(),
            peer = %client.peer().name,
            ?role,
            encode = %negotiated.encode,
            verify = ?negotiated.verify,
            compress = ?negotiated.compress,
            "session open"
        );

        let Wire { source, sink, websocket } = wire;
        tokio::spawn(client.clone().read_loop(source));
        tokio::spawn(client.clone().write_loop(sink, rx));
        if websocket {
            if let Some(heartbeat) = options.heartbeat {
                tokio::spawn(client.clone().heartbeat_loop(heartbeat));
            }
        }
        Ok(client)
    }

    /// Locally unique session id (not the advertised meta id).
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn local_meta(&self) -> &HandshakeMeta {
        &self.inner.local
    }

    /// Handshake meta the peer advertised.
    pub fn peer(&self) -> &HandshakeMeta {
        &self.inner.peer
    }

    pub fn encoder(&self) -> &Encoder {
        &self.inner.encoder
    }

    pub fn negotiated(&self) -> &Negotiated {
        self.inner.encoder.negotiated()
    }

    pub fn handles(&self) -> &HandleMap {
        &self.inner.handles
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.get().cloned()
    }

    /// Frames handed to the writer but not yet on the wire.
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    // ---------------------------------------------------------------------
    // Writing
    // ---------------------------------------------------------------------

    /// Enqueues one already encoded frame. `Ok(false)` means the queue reached
    /// its high-water mark; wait on [`Client::drained`] before producing more.
    pub fn write(&self, bytes: Vec<u8>) -> Result<bool, SessionError> {
        if !self.is_open() {
            return Err(SessionError::Closed);
        }
        let queued = self.inner.queued.fetch_add(1, Ordering::SeqCst) + 1;
        if self.inner.outbound.send(Outbound::Frame(bytes)).is_err() {
            self.inner.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(SessionError::Closed);
        }
        Ok(queued < self.inner.high_water)
    }

    /// Resolves once the write queue is at or under the low-water mark, or the
    /// session is no longer open.
    pub async fn drained(&self) {
        loop {
            let notified = self.inner.drain.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.queued() <= self.inner.low_water || !self.is_open() {
                return;
            }
            notified.await;
        }
    }

    fn send_packet(&self, packet: &Packet) -> Result<bool, SessionError> {
        let bytes = self.inner.encoder.encode(packet)?;
        self.write(bytes)
    }

    fn frame_done(&self) {
        let left = self.inner.queued.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if left <= self.inner.low_water {
            self.inner.drain.notify_waiters();
        }
    }

    // ---------------------------------------------------------------------
    // Calls
    // ---------------------------------------------------------------------

    /// Calls `name` on the peer and waits for its reply.
    pub async fn request(&self, name: &str, args: Value) -> Result<Value, SessionError> {
        self.call(name, args, None).await
    }

    /// Like [`Client::request`], giving up after `limit`.
    pub async fn request_timeout(
        &self,
        name: &str,
        args: Value,
        limit: Duration,
    ) -> Result<Value, SessionError> {
        self.call(name, args, Some(limit)).await
    }

    /// Fire-and-forget call; the peer sends no reply.
    pub fn notify(&self, name: &str, args: Value) -> Result<bool, SessionError> {
        self.send_packet(&Packet::notification(name, Some(args)))
    }

    async fn call(
        &self,
        name: &str,
        args: Value,
        limit: Option<Duration>,
    ) -> Result<Value, SessionError> {
        let echo = self.inner.next_echo.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(echo.clone(), tx);
        // a close racing the insert has either rejected the entry already or
        // is visible through the state here
        if !self.is_open() {
            self.inner.pending.remove(&echo);
            return Err(SessionError::Closed);
        }
        if let Err(err) = self.send_packet(&Packet::call(echo.clone(), name, Some(args))) {
            self.inner.pending.remove(&echo);
            return Err(err);
        }

        let outcome = match limit {
            None => rx.await,
            Some(limit) => match timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.inner.pending.remove(&echo);
                    return Err(SessionError::Timeout(name.to_string()));
                }
            },
        };
        outcome.unwrap_or(Err(SessionError::Closed))
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Graceful close: rejects pending requests, flushes queued frames, then
    /// shuts the transport down. Safe to call any number of times.
    pub async fn close(&self) {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Open {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        });
        if started {
            debug!(session = %self.id(), "closing");
            self.reject_pending();
            if self.inner.outbound.send(Outbound::Shutdown).is_err() {
                self.finish(CloseReason::Local);
            }
        }
        if timeout(CLOSE_GRACE, self.closed()).await.is_err() {
            warn!(session = %self.id(), "writer did not flush in time, closing immediately");
            self.finish(CloseReason::Local);
        }
    }

    /// Immediate close: the transport is dropped without flushing.
    pub fn force_close(&self) {
        self.finish(CloseReason::Local);
    }

    pub(crate) fn force_close_with(&self, reason: CloseReason) {
        self.finish(reason);
    }

    /// Registers a callback run exactly once when the session closes. Runs
    /// immediately if it already has.
    pub fn on_close(&self, callback: impl FnOnce(CloseReason) + Send + 'static) {
        let mut slot = lock(&self.inner.on_close);
        match slot.as_mut() {
            Some(callbacks) => callbacks.push(Box::new(callback)),
            None => {
                drop(slot);
                callback(self.close_reason().unwrap_or(CloseReason::Local));
            }
        }
    }

    /// Waits until the session is closed and returns why.
    pub async fn closed(&self) -> CloseReason {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
        self.close_reason().unwrap_or(CloseReason::Local)
    }

    fn reject_pending(&self) {
        let echoes: Vec<String> = self.inner.pending.iter().map(|e| e.key().clone()).collect();
        for echo in echoes {
            if let Some((_, tx)) = self.inner.pending.remove(&echo) {
                let _ = tx.send(Err(SessionError::Closed));
            }
        }
    }

    /// Single transition into `Closed`; every later call is a no-op.
    fn finish(&self, reason: CloseReason) {
        if self.inner.close_reason.set(reason.clone()).is_err() {
            return;
        }
        self.inner.state.send_replace(SessionState::Closed);
        self.inner.cancel.cancel();
        self.reject_pending();
        self.inner.drain.notify_waiters();

        info!(session = %self.id(), peer = %self.peer().name, %reason, "session closed");
        let callbacks = lock(&self.inner.on_close).take().unwrap_or_default();
        for callback in callbacks {
            callback(reason.clone());
        }
    }

    // ---------------------------------------------------------------------
    // Tasks
    // ---------------------------------------------------------------------

    async fn read_loop(self, mut source: Box<dyn wire::FrameSource>) {
        let cancel = self.inner.cancel.clone();
        let mut failures = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = source.next_frame() => next,
            };
            match next {
                Ok(Some(Inbound::Frame(bytes))) => {
                    if self.receive(&bytes) {
                        failures = 0;
                        continue;
                    }
                    failures += 1;
                    if failures >= self.inner.max_decode_failures {
                        warn!(session = %self.id(), failures, "too many undecodable frames");
                        self.finish(CloseReason::DecodeFailures(failures));
                        return;
                    }
                }
                Ok(Some(Inbound::Pong)) => self.inner.pong.notify_one(),
                Ok(None) => {
                    let reason = if self.state() == SessionState::Closing {
                        CloseReason::Local
                    } else {
                        CloseReason::PeerClosed
                    };
                    self.finish(reason);
                    return;
                }
                Err(err) => {
                    self.finish(CloseReason::Transport(err.to_string()));
                    return;
                }
            }
        }
    }

    /// Handles one frame. Returns false if it could not be decoded.
    fn receive(&self, bytes: &[u8]) -> bool {
        let packet: Packet = match self.inner.encoder.decode(bytes) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(session = %self.id(), error = %err, len = bytes.len(), "dropping undecodable frame");
                return false;
            }
        };
        match packet.classify() {
            PacketKind::Reply { echo, outcome } => match self.inner.pending.remove(&echo) {
                Some((_, tx)) => {
                    let _ = tx.send(outcome.map_err(|err| SessionError::Remote {
                        message: err.message,
                        data: err.data,
                    }));
                }
                None => debug!(session = %self.id(), %echo, "reply for unknown request"),
            },
            PacketKind::Call { name, args, echo } => {
                let client = self.clone();
                tokio::spawn(async move { client.run_handler(name, args, echo).await });
            }
            PacketKind::Malformed => {
                warn!(session = %self.id(), "dropping packet with neither name nor echo");
                return false;
            }
        }
        true
    }

    async fn run_handler(self, name: String, args: Value, echo: Option<String>) {
        let result = self.inner.handles.invoke(&name, args, self.clone()).await;
        let Some(echo) = echo else {
            if let Err(err) = result {
                warn!(session = %self.id(), method = %name, error = %err, "notification handler failed");
            }
            return;
        };
        let reply = match result {
            Ok(value) => Packet::success(echo, value),
            Err(err) => {
                debug!(session = %self.id(), method = %name, error = %err, "handler failed");
                Packet::failure(echo, err.to_string(), None)
            }
        };
        if let Err(err) = self.send_packet(&reply) {
            debug!(session = %self.id(), method = %name, error = %err, "reply not delivered");
        }
    }

    async fn write_loop(
        self,
        mut sink: Box<dyn wire::FrameSink>,
        mut rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        let cancel = self.inner.cancel.clone();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = rx.recv() => next,
            };
            match next {
                Some(Outbound::Frame(bytes)) => {
                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        sent = sink.send_frame(bytes) => sent,
                    };
                    self.frame_done();
                    if let Err(err) = sent {
                        self.finish(CloseReason::Transport(err.to_string()));
                        return;
                    }
                }
                Some(Outbound::Ping) => {
                    if let Err(err) = sink.ping().await {
                        self.finish(CloseReason::Transport(err.to_string()));
                        return;
                    }
                }
                Some(Outbound::Shutdown) | None => {
                    sink.shutdown().await;
                    self.finish(CloseReason::Local);
                    return;
                }
            }
        }
    }

    async fn heartbeat_loop(self, heartbeat: Heartbeat) {
        let cancel = self.inner.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(heartbeat.interval) => {}
            }
            if self.inner.outbound.send(Outbound::Ping).is_err() {
                return;
            }
            let answered = tokio::select! {
                _ = cancel.cancelled() => return,
                answered = timeout(heartbeat.timeout, self.inner.pong.notified()) => answered.is_ok(),
            };
            if !answered {
                warn!(session = %self.id(), "no pong within {:?}", heartbeat.timeout);
                self.finish(CloseReason::HeartbeatTimeout);
                return;
            }
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("peer", &self.inner.peer.name)
            .field("state", &self.state())
            .field("encoder", &self.inner.encoder)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Handshake
// -----------------------------------------------------------------------------

/// Sends the local meta, waits for the peer's and negotiates. Both metas are
/// plain JSON; the acceptor's preference order decides on both ends.
async fn handshake(
    wire: &mut Wire,
    role: Role,
    options: &SessionOptions,
) -> Result<(HandshakeMeta, HandshakeMeta, Encoder), HandshakeFailure> {
    let local = HandshakeMeta {
        id: options.id.clone(),
        name: options.name.clone(),
        encoders: options.advertised(),
    };
    let plain = Encoder::plain_json();
    let bytes = plain
        .encode(&local)
        .map_err(|e| HandshakeFailure::MalformedMeta(e.to_string()))?;
    wire.sink
        .send_frame(bytes)
        .await
        .map_err(|_| HandshakeFailure::Disconnected)?;

    let deadline = Instant::now() + options.handshake_timeout;
    let frame = loop {
        match timeout_at(deadline, wire.source.next_frame()).await {
            Err(_) => {
                return Err(HandshakeFailure::Timeout(
                    options.handshake_timeout.as_millis() as u64,
                ));
            }
            Ok(Ok(Some(Inbound::Frame(frame)))) => break frame,
            Ok(Ok(Some(Inbound::Pong))) => continue,
            Ok(Ok(None)) | Ok(Err(_)) => return Err(HandshakeFailure::Disconnected),
        }
    };
    let peer: HandshakeMeta = plain
        .decode(&frame)
        .map_err(|e| HandshakeFailure::MalformedMeta(e.to_string()))?;

    let negotiated = match role {
        Role::Acceptor => negotiate_all(&local.encoders, &peer.encoders)?,
        Role::Connector => negotiate_all(&peer.encoders, &local.encoders)?,
    };
    let encoder = options
        .registry
        .build(&negotiated)
        .map_err(|e| HandshakeFailure::UnknownAlgorithm(e.to_string()))?;
    Ok((local, peer, encoder))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_parse() {
        assert_eq!(
            "tcp://127.0.0.1:7700".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:7700".into())
        );
        assert_eq!(
            "localhost:9".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("localhost:9".into())
        );
        assert!(matches!(
            "ws://127.0.0.1:7700/bot".parse::<Endpoint>().unwrap(),
            Endpoint::WebSocket(url) if url.path() == "/bot"
        ));
        #[cfg(unix)]
        assert_eq!(
            "unix:/tmp/bot.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/bot.sock"))
        );
        assert!("nonsense".parse::<Endpoint>().is_err());
    }

    #[test]
    fn delimited_framing_advertises_plain_json() {
        let options = SessionOptions {
            encoders: EncoderPrefs {
                encode: vec!["cbor".into(), "json".into(), "binary".into()],
                verify: vec!["sha256".into()],
                compress: vec!["gzip".into()],
            },
            framing: Framing::Delimited(b'\n'),
            ..Default::default()
        };
        let prefs = options.advertised();
        assert_eq!(prefs.encode, vec!["json".to_string()]);
        assert!(prefs.verify.is_empty() && prefs.compress.is_empty());
    }

    #[test]
    fn unsupported_names_are_not_advertised() {
        let options = SessionOptions {
            encoders: EncoderPrefs {
                encode: vec!["json".into(), "binary".into()],
                verify: vec!["blake3-96".into(), "md5".into()],
                compress: vec![],
            },
            ..Default::default()
        };
        let prefs = options.advertised();
        assert_eq!(prefs.encode, vec!["json".to_string()]);
        assert_eq!(prefs.verify, vec!["blake3-96".to_string()]);
    }
}
