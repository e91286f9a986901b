//! SSH session implementation using russh.
//!
//! Handles:
//! - Connecting and verifying the server key against `known_hosts`
//! - Password, private-key and SSH agent authentication
//! - Opening direct-tcpip channels for the tunnel manager

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use russh::client::{self, AuthResult, Handle, Msg};
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, ChannelReadHalf, ChannelWriteHalf, Disconnect};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::{ForwardedChannel, SecureSession};
use crate::error::BoxError;

/// How to authenticate to the SSH server.
#[derive(Clone)]
pub enum SshAuth {
    Password(String),
    PrivateKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
    /// Try each identity offered by the agent at `$SSH_AUTH_SOCK`.
    Agent,
}

impl std::fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SshAuth::Password(_) => f.write_str("Password(..)"),
            SshAuth::PrivateKey { path, .. } => f
                .debug_struct("PrivateKey")
                .field("path", path)
                .finish_non_exhaustive(),
            SshAuth::Agent => f.write_str("Agent"),
        }
    }
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SshAuth,

    /// Reject servers whose key is not in the user's `known_hosts`.
    pub verify_host_key: bool,

    pub connect_timeout: Duration,

    /// Keep-alive interval; `None` disables keep-alives.
    pub keepalive_interval: Option<Duration>,
}

/// russh client callbacks.
pub struct ClientHandler {
    host: String,
    port: u16,
    verify_host_key: bool,
}

impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        if !self.verify_host_key {
            warn!(
                "Host key verification disabled, accepting key for {}:{}",
                self.host, self.port
            );
            return Ok(true);
        }

        match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            Ok(false) => {
                warn!(
                    "Host {}:{} is not in known_hosts; connect once with ssh to trust it",
                    self.host, self.port
                );
                Ok(false)
            }
            Err(e) => Err(anyhow!(
                "Host key verification failed for {}:{}: {}",
                self.host,
                self.port,
                e
            )),
        }
    }
}

/// An authenticated SSH connection.
pub struct SshSession {
    handle: Handle<ClientHandler>,
    label: String,
}

impl SshSession {
    /// Connect and authenticate.
    pub async fn connect(target: &SshTarget) -> Result<Self> {
        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: target.keepalive_interval,
            ..Default::default()
        });

        let handler = ClientHandler {
            host: target.host.clone(),
            port: target.port,
            verify_host_key: target.verify_host_key,
        };

        let label = format!("{}@{}:{}", target.user, target.host, target.port);
        info!("Connecting to {}", label);

        let mut handle = tokio::time::timeout(
            target.connect_timeout,
            client::connect(config, (target.host.as_str(), target.port), handler),
        )
        .await
        .map_err(|_| {
            anyhow!(
                "Connection to {} timed out after {:?}",
                label,
                target.connect_timeout
            )
        })?
        .with_context(|| format!("Failed to connect to {}", label))?;

        authenticate(&mut handle, target).await?;
        info!("Authenticated as {}", label);

        Ok(Self { handle, label })
    }

    /// Send a disconnect message to the server.
    pub async fn disconnect(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .with_context(|| format!("Failed to disconnect from {}", self.label))
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

async fn authenticate(handle: &mut Handle<ClientHandler>, target: &SshTarget) -> Result<()> {
    let result = match &target.auth {
        SshAuth::Password(password) => handle
            .authenticate_password(target.user.as_str(), password.as_str())
            .await
            .context("Password authentication failed")?,
        SshAuth::PrivateKey { path, passphrase } => {
            let key = load_secret_key(path, passphrase.as_deref())
                .with_context(|| format!("Failed to load SSH key from {}", path.display()))?;

            // RSA keys need a negotiated hash; other key types ignore it.
            let key_with_alg = PrivateKeyWithHashAlg::new(
                Arc::new(key),
                handle.best_supported_rsa_hash().await?.flatten(),
            );

            handle
                .authenticate_publickey(target.user.as_str(), key_with_alg)
                .await
                .context("Public key authentication failed")?
        }
        SshAuth::Agent => authenticate_with_agent(handle, &target.user).await?,
    };

    match result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure { .. } => bail!("Authentication rejected for user '{}'", target.user),
    }
}

#[cfg(unix)]
async fn authenticate_with_agent(handle: &mut Handle<ClientHandler>, user: &str) -> Result<AuthResult> {
    use russh::keys::agent::client::AgentClient;
    use russh::keys::Algorithm;

    let mut agent = AgentClient::connect_env()
        .await
        .context("Failed to connect to SSH agent (is SSH_AUTH_SOCK set?)")?;
    let identities = agent
        .request_identities()
        .await
        .context("Failed to list SSH agent identities")?;
    if identities.is_empty() {
        bail!("SSH agent has no keys loaded");
    }
    debug!("SSH agent offers {} key(s)", identities.len());

    let rsa_hash = handle.best_supported_rsa_hash().await?.flatten();
    let mut rejected = None;
    for key in identities {
        let hash_alg = match key.algorithm() {
            Algorithm::Rsa { .. } => rsa_hash,
            _ => None,
        };
        match handle
            .authenticate_publickey_with(user, key, hash_alg, &mut agent)
            .await
        {
            Ok(AuthResult::Success) => return Ok(AuthResult::Success),
            Ok(result) => rejected = Some(result),
            Err(e) => warn!("SSH agent could not sign: {}", e),
        }
    }

    rejected.ok_or_else(|| anyhow!("SSH agent could not sign with any of its keys"))
}

#[cfg(not(unix))]
async fn authenticate_with_agent(_handle: &mut Handle<ClientHandler>, _user: &str) -> Result<AuthResult> {
    bail!("SSH agent authentication is only supported on Unix")
}

impl SecureSession for SshSession {
    type Channel = SshChannel;

    fn is_connected(&self) -> bool {
        !self.handle.is_closed()
    }

    async fn open_forwarded_channel(
        &self,
        remote_host: &str,
        remote_port: u16,
        source_host: &str,
        source_port: u16,
    ) -> Result<SshChannel, BoxError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(
                remote_host,
                u32::from(remote_port),
                source_host,
                u32::from(source_port),
            )
            .await?;
        debug!(
            "Opened direct-tcpip channel {:?} to {}:{}",
            channel.id(),
            remote_host,
            remote_port
        );
        Ok(SshChannel::new(channel))
    }
}

/// Where inbound channel messages come from.
trait MessageSource: Send {
    fn next_message(&mut self) -> impl Future<Output = Option<ChannelMsg>> + Send;
}

impl MessageSource for ChannelReadHalf {
    fn next_message(&mut self) -> impl Future<Output = Option<ChannelMsg>> + Send {
        self.wait()
    }
}

struct Inbound<R> {
    source: R,
    leftover: Vec<u8>,
}

/// Inbound buffering plus the closed/EOF flags shared by reads and writes.
///
/// Closing wakes every pending read (which then returns empty) and every
/// guarded write (which then fails).
struct ChannelState<R> {
    inbound: tokio::sync::Mutex<Inbound<R>>,
    closed: watch::Sender<bool>,
    eof: AtomicBool,
}

impl<R: MessageSource> ChannelState<R> {
    fn new(source: R) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inbound: tokio::sync::Mutex::new(Inbound {
                source,
                leftover: Vec::new(),
            }),
            closed,
            eof: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn is_open(&self) -> bool {
        !self.is_closed() && !self.eof.load(Ordering::SeqCst)
    }

    /// Mark the channel closed. Returns true only for the first call.
    fn mark_closed(&self) -> bool {
        !self.closed.send_replace(true)
    }

    /// Next chunk of at most `max_bytes`; empty on EOF or close.
    async fn read(&self, max_bytes: usize) -> Vec<u8> {
        let max_bytes = max_bytes.max(1);
        let mut closed = self.closed.subscribe();
        if !self.is_open() {
            return Vec::new();
        }

        let mut inbound = self.inbound.lock().await;
        let Inbound { source, leftover } = &mut *inbound;

        if !leftover.is_empty() {
            let rest = leftover.split_off(leftover.len().min(max_bytes));
            return std::mem::replace(leftover, rest);
        }

        let next = async {
            loop {
                match source.next_message().await {
                    Some(ChannelMsg::Data { data }) => return Some(data.to_vec()),
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => return None,
                    Some(other) => debug!("Ignoring channel message: {:?}", other),
                }
            }
        };

        tokio::select! {
            data = next => match data {
                Some(mut data) => {
                    if data.len() > max_bytes {
                        *leftover = data.split_off(max_bytes);
                    }
                    data
                }
                None => {
                    self.eof.store(true, Ordering::SeqCst);
                    Vec::new()
                }
            },
            _ = wait_closed(&mut closed) => Vec::new(),
        }
    }

    /// Run `op` unless the channel is, or becomes, closed.
    async fn guard<F, T, E>(&self, op: F) -> Result<T, BoxError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let mut closed = self.closed.subscribe();
        if self.is_closed() {
            return Err(closed_error());
        }

        tokio::select! {
            res = op => res.map_err(Into::into),
            _ = wait_closed(&mut closed) => Err(closed_error()),
        }
    }
}

/// A direct-tcpip channel adapted to [`ForwardedChannel`].
pub struct SshChannel {
    state: ChannelState<ChannelReadHalf>,
    writer: ChannelWriteHalf<Msg>,
}

impl SshChannel {
    fn new(channel: russh::Channel<Msg>) -> Self {
        let (half, writer) = channel.split();
        Self {
            state: ChannelState::new(half),
            writer,
        }
    }
}

impl ForwardedChannel for SshChannel {
    async fn read(&self, max_bytes: usize) -> Result<Vec<u8>, BoxError> {
        Ok(self.state.read(max_bytes).await)
    }

    async fn write(&self, data: &[u8]) -> Result<usize, BoxError> {
        self.state.guard(self.writer.data(data)).await?;
        Ok(data.len())
    }

    async fn close(&self) -> Result<(), BoxError> {
        if !self.state.mark_closed() {
            return Ok(());
        }
        // The server may already have closed its side.
        if let Err(e) = self.writer.close().await {
            debug!("Channel close ignored: {}", e);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

fn closed_error() -> BoxError {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "channel is closed").into()
}
