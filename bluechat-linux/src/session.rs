//! Session manager: owns the listening and outbound stream lifecycles, wires an
//! established stream to a transfer channel and turns every outcome into one
//! ordered sequence of connection events.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bluechat_core::{
    Capabilities, Capability, ConnectionEvent, FrameFormat, Message, PeerDevice, PermissionDenied,
    Role, SessionCore, SessionId, SessionState, SessionStateError, SERVICE_NAME,
    UNKNOWN_DEVICE_NAME,
};
use futures::{Stream, StreamExt};
use tokio::io::WriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{Config, ConfigError};
use crate::discovery::Discovery;
use crate::events::EventSurface;
use crate::transfer::{TransferChannel, TransferError, TransferWriter};
use crate::transport::{self, Hello};

/// Terminal event text when the outbound handshake fails.
pub const CONNECTION_INTERRUPTED: &str = "Connection was interrupted";
/// Terminal event text when a read on an established stream fails.
pub const TRANSFER_FAILED: &str = "Data transfer failed";

const EVENT_CHANNEL_CAPACITY: usize = 64;

type Writer = TransferWriter<WriteHalf<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    PermissionDenied(#[from] PermissionDenied),
    #[error(transparent)]
    Busy(#[from] SessionStateError),
    #[error("cannot open listening endpoint: {0}")]
    Bind(std::io::Error),
    #[error("send failed: {0}")]
    Transfer(#[from] TransferError),
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub service: Uuid,
    pub device_name: Option<String>,
    pub bind_host: String,
    pub listen_port: u16,
    pub framing: FrameFormat,
    pub read_buffer_size: usize,
}

impl SessionSettings {
    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            service: cfg.service_id()?,
            device_name: cfg.device_name.clone(),
            bind_host: cfg.bind_host.clone(),
            listen_port: cfg.transport_port,
            framing: cfg.framing,
            read_buffer_size: cfg.read_buffer_size,
        })
    }

    pub fn sender_name(&self) -> &str {
        self.device_name.as_deref().unwrap_or(UNKNOWN_DEVICE_NAME)
    }

    fn hello(&self, listen_port: u16) -> Hello {
        Hello {
            service: self.service,
            listen_port,
            name: self.device_name.clone(),
        }
    }
}

/// Events of one connection attempt. Dropping it cancels the attempt and tears the session down.
pub struct ConnectionEvents {
    rx: mpsc::Receiver<ConnectionEvent>,
}

impl ConnectionEvents {
    /// Next event; `None` once the session is over.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }
}

impl Stream for ConnectionEvents {
    type Item = ConnectionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

struct Slot {
    core: SessionCore,
    writer: Option<Arc<tokio::sync::Mutex<Writer>>>,
    task: Option<JoinHandle<()>>,
    listening: Option<SocketAddr>,
}

struct Shared {
    slot: Mutex<Slot>,
    settings: SessionSettings,
    caps: Arc<Capabilities>,
    surface: Arc<EventSurface>,
}

impl Shared {
    fn with_slot<R>(&self, f: impl FnOnce(&mut Slot) -> R) -> R {
        let mut slot = match self.slot.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut slot)
    }

    /// Spawn the task driving `id`, unless `id` was torn down in the meantime.
    fn spawn_session<F>(&self, id: SessionId, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.with_slot(|s| {
            if s.core.current_id() == Some(id) {
                s.task = Some(tokio::spawn(fut));
            }
        });
    }

    /// Link-up is published under the slot lock, so a concurrent teardown of `id`
    /// always publishes its link-down after it.
    fn establish(&self, id: SessionId, peer: &PeerDevice, writer: Writer) -> Result<Role, SessionStateError> {
        self.with_slot(|s| {
            let role = s.core.on_established(id, peer.clone())?;
            s.writer = Some(Arc::new(tokio::sync::Mutex::new(writer)));
            s.listening = None;
            self.surface.on_link_state_changed(peer, true);
            Ok(role)
        })
    }

    /// Mark `id` closed and drop the writer. Runs at most once per session; later
    /// calls for the same id are no-ops. Returns the task still holding the
    /// listening or connected stream, if one was spawned.
    fn teardown(&self, id: SessionId) -> Option<JoinHandle<()>> {
        self.with_slot(|s| {
            let left = s.core.close(id)?;
            s.listening = None;
            s.writer = None;
            if let SessionState::Active { role, peer } = &left {
                tracing::info!(?role, peer = %peer.address, "session closed");
                self.surface.on_link_state_changed(peer, false);
            } else {
                tracing::debug!(state = ?left, "connection attempt closed");
            }
            s.task.take()
        })
    }

    /// Tear down the current session and return its task, if any.
    fn detach_current(&self) -> Option<JoinHandle<()>> {
        let id = self.with_slot(|s| s.core.current_id())?;
        self.teardown(id)
    }
}

/// Runs `teardown` for its session when the owning task ends, however it ends.
struct TeardownGuard {
    shared: Arc<Shared>,
    id: SessionId,
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        // The handle returned here is this task's own; dropping it detaches.
        self.shared.teardown(self.id);
    }
}

/// Single-session manager. A second `start_server`/`connect_to` while a session
/// exists is rejected with `SessionError::Busy`.
pub struct SessionManager {
    shared: Arc<Shared>,
    discovery: Arc<Discovery>,
}

impl SessionManager {
    pub fn new(
        settings: SessionSettings,
        caps: Arc<Capabilities>,
        surface: Arc<EventSurface>,
        discovery: Arc<Discovery>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    core: SessionCore::new(),
                    writer: None,
                    task: None,
                    listening: None,
                }),
                settings,
                caps,
                surface,
            }),
            discovery,
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.with_slot(|s| s.core.state().clone())
    }

    /// Sessions torn down since start.
    pub fn teardowns(&self) -> u64 {
        self.shared.with_slot(|s| s.core.teardowns())
    }

    /// Bound address while waiting for a client.
    pub fn listening_addr(&self) -> Option<SocketAddr> {
        self.shared.with_slot(|s| s.listening)
    }

    pub fn sender_name(&self) -> &str {
        self.shared.settings.sender_name()
    }

    /// Open the listening endpoint and wait for one client. The endpoint is closed as
    /// soon as a client completes the hello.
    pub async fn start_server(&self) -> Result<ConnectionEvents, SessionError> {
        self.shared.caps.require(Capability::Connect)?;
        let id = self.shared.with_slot(|s| s.core.begin_listen())?;
        let settings = &self.shared.settings;
        let listener = match transport::bind(&settings.bind_host, settings.listen_port).await {
            Ok(l) => l,
            Err(e) => {
                self.shared.teardown(id);
                return Err(SessionError::Bind(e));
            }
        };
        let local = listener.local_addr().map_err(|e| {
            self.shared.teardown(id);
            SessionError::Bind(e)
        })?;
        self.shared.with_slot(|s| {
            if s.core.current_id() == Some(id) {
                s.listening = Some(local);
            }
        });
        tracing::info!(%local, service = SERVICE_NAME, "listening");

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let shared = self.shared.clone();
        self.shared
            .spawn_session(id, run_server(shared, id, listener, local.port(), tx));
        Ok(ConnectionEvents { rx })
    }

    /// Connect to `peer` under the service identifier. Stops any running scan first.
    pub async fn connect_to(&self, peer: &PeerDevice) -> Result<ConnectionEvents, SessionError> {
        self.shared.caps.require(Capability::Connect)?;
        let id = self.shared.with_slot(|s| s.core.begin_connect())?;
        self.discovery.stop();
        tracing::info!(peer = %peer.address, "connecting");

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let shared = self.shared.clone();
        self.shared
            .spawn_session(id, run_client(shared, id, peer.clone(), tx));
        Ok(ConnectionEvents { rx })
    }

    /// Send `text` on the active session. `Ok(None)` without `Connect` or without an
    /// active session; nothing is written in either case.
    pub async fn try_send_message(&self, text: &str) -> Result<Option<Message>, SessionError> {
        if self.shared.caps.require(Capability::Connect).is_err() {
            tracing::debug!("send skipped: connect permission missing");
            return Ok(None);
        }
        let Some(writer) = self.shared.with_slot(|s| s.writer.clone()) else {
            return Ok(None);
        };
        let msg = Message::outgoing(self.shared.settings.sender_name(), text);
        let mut writer = writer.lock().await;
        if let Err(e) = writer.send_message(&msg).await {
            tracing::warn!(error = %e, "message not sent");
            self.shared.surface.notify_error(format!("Message not sent: {e}"));
            return Err(e.into());
        }
        Ok(Some(msg))
    }

    /// Close whatever is open. Idempotent; a no-op from Idle. Returns once the
    /// session task is gone, so the listening port and the stream are released.
    pub async fn close_connection(&self) {
        if let Some(task) = self.shared.detach_current() {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "session task failed");
                }
            }
        }
    }

    /// Non-blocking close for drop paths: the task is aborted, not awaited.
    pub fn abort_connection(&self) {
        if let Some(task) = self.shared.detach_current() {
            task.abort();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.abort_connection();
    }
}

async fn run_server(
    shared: Arc<Shared>,
    id: SessionId,
    listener: TcpListener,
    local_port: u16,
    tx: mpsc::Sender<ConnectionEvent>,
) {
    let _guard = TeardownGuard {
        shared: shared.clone(),
        id,
    };
    let local = shared.settings.hello(local_port);
    // Rejected hellos (wrong service, junk) do not end the wait; an accept error does.
    // Hellos are read one at a time, so a silent client holds the queue for up to
    // HANDSHAKE_TIMEOUT.
    let (stream, peer) = loop {
        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = tx.closed() => return,
        };
        let (mut stream, remote) = match accepted {
            Ok(x) => x,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                return;
            }
        };
        match transport::accept_hello(&mut stream, &local).await {
            Ok(hello) => break (stream, hello.peer_device(remote)),
            Err(e) => tracing::warn!(%remote, error = %e, "rejected incoming connection"),
        }
    };
    // Single client: no further incoming connections.
    drop(listener);
    serve(&shared, id, stream, peer, &tx).await;
}

async fn run_client(
    shared: Arc<Shared>,
    id: SessionId,
    peer: PeerDevice,
    tx: mpsc::Sender<ConnectionEvent>,
) {
    let _guard = TeardownGuard {
        shared: shared.clone(),
        id,
    };
    let local = shared.settings.hello(shared.settings.listen_port);
    let connected = tokio::select! {
        r = transport::connect(&peer.address, &local) => r,
        _ = tx.closed() => return,
    };
    match connected {
        Ok((stream, hello)) => {
            let peer = PeerDevice::new(hello.name.or(peer.name), peer.address);
            serve(&shared, id, stream, peer, &tx).await;
        }
        Err(e) => {
            tracing::warn!(peer = %peer.address, error = %e, "connection failed");
            let _ = tx.send(ConnectionEvent::Failed(CONNECTION_INTERRUPTED.into())).await;
        }
    }
}

/// Established stream: publish `Established`, then forward every received message
/// until the stream ends or the consumer goes away.
async fn serve(
    shared: &Arc<Shared>,
    id: SessionId,
    stream: TcpStream,
    peer: PeerDevice,
    tx: &mpsc::Sender<ConnectionEvent>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "set_nodelay failed");
    }
    let channel = TransferChannel::new(
        stream,
        shared.settings.framing,
        shared.settings.read_buffer_size,
    );
    let (reader, writer) = channel.split();
    let role = match shared.establish(id, &peer, writer) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "session closed before it was established");
            return;
        }
    };
    tracing::info!(?role, peer = %peer.address, name = ?peer.name, "connection established");
    if tx.send(ConnectionEvent::Established).await.is_err() {
        return;
    }

    let mut messages = Box::pin(reader.receive_messages());
    loop {
        tokio::select! {
            next = messages.next() => match next {
                Some(Ok(msg)) => {
                    if tx.send(ConnectionEvent::MessageReceived(msg)).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(peer = %peer.address, error = %e, "transfer failed");
                    let _ = tx.send(ConnectionEvent::Failed(TRANSFER_FAILED.into())).await;
                    return;
                }
                None => return,
            },
            _ = tx.closed() => return,
        }
    }
}
