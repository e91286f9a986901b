//! Local-to-remote TCP port forwarding over a secure session.
//!
//! A [`TunnelManager`] owns a local TCP listener. Every accepted socket gets
//! its own forwarded channel on the shared [`SecureSession`], and a
//! per-connection task relays bytes in both directions until either side
//! finishes. Failures of one connection tear down only that connection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::channel::{write_all, ForwardedChannel, SecureSession};
use crate::error::{Direction, Result, StateError, TunnelError};
use crate::registry::{ConnectionId, ConnectionRegistry};

/// Default number of bytes read per relay step.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Back-off after a failed `accept` (e.g. file descriptor exhaustion).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Where the tunnel listens and what it forwards to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelOptions {
    /// Local address to bind (default: "127.0.0.1").
    pub bind_host: String,

    /// Local port to bind; 0 picks an ephemeral port.
    pub bind_port: u16,

    /// Destination host, resolved by the remote end.
    pub remote_host: String,

    pub remote_port: u16,

    /// Maximum bytes moved per read in either direction.
    pub buffer_size: usize,
}

impl TunnelOptions {
    pub fn new(remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 0,
            remote_host: remote_host.into(),
            remote_port,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Set the local bind address.
    pub fn bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.bind_host = host.into();
        self.bind_port = port;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    fn bind_label(&self) -> String {
        join_host_port(&self.bind_host, self.bind_port)
    }

    fn remote_label(&self) -> String {
        join_host_port(&self.remote_host, self.remote_port)
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Lifecycle and per-connection notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// The listener is bound and accepting.
    Listening { addr: SocketAddr },

    /// A forwarded channel was opened and the connection registered.
    ConnectionOpened { id: ConnectionId, peer: SocketAddr },

    /// The channel for an accepted socket could not be opened; the socket was closed.
    ConnectionFailed { peer: SocketAddr, error: String },

    /// A registered connection was torn down.
    ConnectionClosed { id: ConnectionId },

    /// The tunnel stopped and released its listener.
    Stopped,
}

/// A live (socket, channel) pair.
///
/// The local socket is owned by the connection task; dropping `kill` (or
/// sending on it) makes that task drop the socket.
struct ConnectionEntry<C> {
    channel: Arc<C>,
    peer: SocketAddr,
    kill: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

/// State shared between the manager and its tasks.
struct Shared<S: SecureSession> {
    session: Arc<S>,
    options: TunnelOptions,
    registry: ConnectionRegistry<ConnectionEntry<S::Channel>>,
    events: broadcast::Sender<TunnelEvent>,
}

enum TunnelState {
    Idle,
    Starting,
    Running(Listening),
    Stopped,
}

struct Listening {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    accept_task: JoinHandle<TcpListener>,
}

/// Forwards local TCP connections to a remote destination through a
/// secure session.
///
/// A manager is single-use: once stopped it cannot be started again.
pub struct TunnelManager<S: SecureSession> {
    shared: Arc<Shared<S>>,
    state: Mutex<TunnelState>,
}

impl<S: SecureSession> TunnelManager<S> {
    pub fn new(session: Arc<S>, options: TunnelOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                session,
                options,
                registry: ConnectionRegistry::new(),
                events,
            }),
            state: Mutex::new(TunnelState::Idle),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, TunnelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn options(&self) -> &TunnelOptions {
        &self.shared.options
    }

    /// Subscribe to tunnel events.
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.shared.events.subscribe()
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Returns once the listener is bound; forwarding continues in the
    /// background until [`stop`](Self::stop). On error nothing is left bound.
    pub async fn start(&self) -> Result<SocketAddr> {
        {
            let mut state = self.lock_state();
            match *state {
                TunnelState::Idle => {}
                TunnelState::Starting | TunnelState::Running(_) => {
                    return Err(StateError::AlreadyStarted.into());
                }
                TunnelState::Stopped => return Err(StateError::Stopped.into()),
            }
            if !self.shared.session.is_connected() {
                return Err(StateError::SessionNotConnected.into());
            }
            *state = TunnelState::Starting;
        }

        let options = &self.shared.options;
        let bound = match TcpListener::bind((options.bind_host.as_str(), options.bind_port)).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                *self.lock_state() = TunnelState::Idle;
                return Err(TunnelError::Bind {
                    addr: options.bind_label(),
                    source,
                });
            }
        };

        let (shutdown, shutdown_rx) = oneshot::channel();
        let accept_task = tokio::spawn(accept_loop(self.shared.clone(), listener, shutdown_rx));

        *self.lock_state() = TunnelState::Running(Listening {
            local_addr,
            shutdown,
            accept_task,
        });

        info!(
            "Tunnel listening on {} -> {}",
            local_addr,
            options.remote_label()
        );
        self.shared.emit(TunnelEvent::Listening { addr: local_addr });

        Ok(local_addr)
    }

    /// Stop accepting, tear down every live connection, then release the
    /// listener. Calling this on a tunnel that is not running is a no-op.
    ///
    /// The registry is always empty when this returns, even on error.
    pub async fn stop(&self) -> Result<()> {
        let listening = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, TunnelState::Stopped) {
                TunnelState::Running(listening) => listening,
                other => {
                    *state = other;
                    return Ok(());
                }
            }
        };

        info!("Stopping tunnel on {}", listening.local_addr);

        let _ = listening.shutdown.send(());
        let listener = listening.accept_task.await;

        self.shared.drain().await;

        let result = match listener {
            Ok(listener) => {
                drop(listener);
                Ok(())
            }
            Err(e) => Err(TunnelError::Stop(format!(
                "accept task for {} failed: {}",
                listening.local_addr, e
            ))),
        };

        info!("Tunnel on {} stopped", listening.local_addr);
        self.shared.emit(TunnelEvent::Stopped);
        result
    }

    /// The bound local address, or `None` when not listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lock_state() {
            TunnelState::Running(listening) => Some(listening.local_addr),
            _ => None,
        }
    }

    /// Number of connections currently forwarding.
    pub fn active_connections(&self) -> usize {
        self.shared.registry.len()
    }

    /// Ids of the connections currently forwarding.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.shared.registry.ids()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock_state(), TunnelState::Running(_))
    }
}

impl<S: SecureSession> Drop for TunnelManager<S> {
    fn drop(&mut self) {
        // Dropping the kill switches ends every connection task, and each
        // task closes its own socket and channel on the way out.
        let drained = self.shared.registry.drain();
        if !drained.is_empty() {
            debug!("Dropping tunnel with {} live connection(s)", drained.len());
        }
    }
}

impl<S: SecureSession> Shared<S> {
    fn emit(&self, event: TunnelEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Close both halves of a connection and forget it.
    ///
    /// Safe to call any number of times for the same id; returns true only
    /// for the call that actually removed the entry.
    async fn teardown(&self, id: ConnectionId) -> bool {
        match self.registry.remove(id) {
            Some(entry) => {
                self.close_entry(id, entry).await;
                true
            }
            None => false,
        }
    }

    async fn close_entry(&self, id: ConnectionId, mut entry: ConnectionEntry<S::Channel>) {
        if let Some(kill) = entry.kill.take() {
            let _ = kill.send(());
        }
        if let Err(e) = entry.channel.close().await {
            debug!("Connection {}: error closing channel: {}", id, e);
        }
        debug!("Connection {} from {} closed", id, entry.peer);
        self.emit(TunnelEvent::ConnectionClosed { id });
    }

    /// Tear down every live connection and wait for their tasks to exit.
    async fn drain(&self) {
        let entries = self.registry.drain();
        if entries.is_empty() {
            return;
        }

        debug!("Tearing down {} connection(s)", entries.len());
        join_all(entries.into_iter().map(|(id, mut entry)| async move {
            let task = entry.task.take();
            self.close_entry(id, entry).await;
            if let Some(task) = task {
                if let Err(e) = task.await {
                    warn!("Connection {} task failed: {}", id, e);
                }
            }
        }))
        .await;
    }
}

async fn accept_loop<S: SecureSession>(
    shared: Arc<Shared<S>>,
    listener: TcpListener,
    mut shutdown: oneshot::Receiver<()>,
) -> TcpListener {
    // Ids are allocated here, in a single task, so they are strictly increasing.
    let mut next_id: ConnectionId = 0;

    // Accepted sockets still waiting for their channel.
    let mut pending = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            Some(joined) = pending.join_next(), if !pending.is_empty() => {
                if let Err(e) = joined {
                    warn!("Channel setup task failed: {}", e);
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id = next_id;
                    next_id += 1;
                    debug!("Accepted connection {} from {}", id, peer);
                    pending.spawn(establish(shared.clone(), id, stream, peer));
                }
                Err(e) => {
                    warn!("Accept error: {}", e);
                    if accept_backoff(&mut shutdown).await {
                        break;
                    }
                }
            },
        }
    }

    // Dropping an aborted open also drops its socket.
    if !pending.is_empty() {
        debug!("Cancelling {} pending channel open(s)", pending.len());
    }
    pending.shutdown().await;

    listener
}

/// Wait out an accept error. Returns true if shutdown arrived first.
async fn accept_backoff(shutdown: &mut oneshot::Receiver<()>) -> bool {
    tokio::select! {
        biased;
        _ = shutdown => true,
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => false,
    }
}

/// Open the forwarded channel for an accepted socket and start relaying.
async fn establish<S: SecureSession>(
    shared: Arc<Shared<S>>,
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let options = &shared.options;
    let source_host = peer.ip().to_string();

    let channel = match shared
        .session
        .open_forwarded_channel(
            &options.remote_host,
            options.remote_port,
            &source_host,
            peer.port(),
        )
        .await
    {
        Ok(channel) => Arc::new(channel),
        Err(source) => {
            let err = TunnelError::ChannelOpen {
                remote: options.remote_label(),
                peer,
                source,
            };
            warn!("Connection {}: {}", id, err);
            drop(stream);
            shared.emit(TunnelEvent::ConnectionFailed {
                peer,
                error: err.to_string(),
            });
            return;
        }
    };

    let (kill, kill_rx) = oneshot::channel();
    let task_shared = shared.clone();
    let task_channel = channel.clone();
    let entry_channel = channel.clone();

    // Spawning under the registry lock means the task can never try to
    // remove its entry before the entry exists.
    let registered = shared.registry.insert_with(id, || {
        shared.emit(TunnelEvent::ConnectionOpened { id, peer });
        let task = tokio::spawn(forward(task_shared, id, peer, stream, task_channel, kill_rx));
        ConnectionEntry {
            channel: entry_channel,
            peer,
            kill: Some(kill),
            task: Some(task),
        }
    });

    if registered {
        info!(
            "Connection {} from {} forwarded to {}",
            id,
            peer,
            options.remote_label()
        );
    } else {
        // The registry was drained while the channel was opening.
        debug!("Connection {} from {} refused: tunnel stopping", id, peer);
        if let Err(e) = channel.close().await {
            debug!("Connection {}: error closing channel: {}", id, e);
        }
    }
}

/// Relay both directions until either ends, then tear the connection down.
async fn forward<S: SecureSession>(
    shared: Arc<Shared<S>>,
    id: ConnectionId,
    peer: SocketAddr,
    stream: TcpStream,
    channel: Arc<S::Channel>,
    kill: oneshot::Receiver<()>,
) {
    let buffer_size = shared.options.buffer_size;
    let (mut reader, mut writer) = stream.into_split();

    let outcome = tokio::select! {
        biased;
        _ = kill => Ok(()),
        res = relay_outbound(&mut reader, channel.as_ref(), buffer_size) => res,
        res = relay_inbound(channel.as_ref(), &mut writer, buffer_size) => res,
    };

    match outcome {
        Ok(()) => debug!("Connection {} from {} finished", id, peer),
        Err(e) => warn!("Connection {} from {}: {}", id, peer, e),
    }

    drop(reader);
    drop(writer);
    if !shared.teardown(id).await {
        // Drained by a dropped manager, which cannot close channels itself.
        if let Err(e) = channel.close().await {
            debug!("Connection {}: error closing channel: {}", id, e);
        }
    }
}

/// Local socket to channel. Ends on local EOF.
async fn relay_outbound<C: ForwardedChannel>(
    reader: &mut OwnedReadHalf,
    channel: &C,
    buffer_size: usize,
) -> Result<()> {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| TunnelError::relay(Direction::Outbound, e))?;
        if n == 0 {
            return Ok(());
        }
        write_all(channel, &buf[..n])
            .await
            .map_err(|e| TunnelError::relay(Direction::Outbound, e))?;
    }
}

/// Channel to local socket. Ends on remote EOF; each chunk is fully written
/// before the next read.
async fn relay_inbound<C: ForwardedChannel>(
    channel: &C,
    writer: &mut OwnedWriteHalf,
    buffer_size: usize,
) -> Result<()> {
    while channel.is_open() {
        let data = channel
            .read(buffer_size)
            .await
            .map_err(|e| TunnelError::relay(Direction::Inbound, e))?;
        if data.is_empty() {
            break;
        }
        writer
            .write_all(&data)
            .await
            .map_err(|e| TunnelError::relay(Direction::Inbound, e))?;
    }
    writer
        .flush()
        .await
        .map_err(|e| TunnelError::relay(Direction::Inbound, e))
}
