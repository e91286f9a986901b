//! Error types for the tunnel manager.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Boxed error returned by the secure-session collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why a lifecycle call was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("tunnel is already started")]
    AlreadyStarted,

    #[error("tunnel was stopped and cannot be restarted")]
    Stopped,

    #[error("secure session is not connected")]
    SessionNotConnected,
}

/// Direction of a relay half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local socket to forwarded channel.
    Outbound,
    /// Forwarded channel to local socket.
    Inbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Outbound => f.write_str("local->remote"),
            Direction::Inbound => f.write_str("remote->local"),
        }
    }
}

/// Errors raised by the tunnel manager.
///
/// `State`, `Bind` and `Stop` are returned from `start`/`stop`. `ChannelOpen`
/// and `Relay` are scoped to a single connection: they are logged and
/// published as events, never returned to the caller of `start`.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid tunnel state: {0}")]
    State(#[from] StateError),

    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to release listener: {0}")]
    Stop(String),

    #[error("failed to open forwarded channel to {remote} for {peer}: {source}")]
    ChannelOpen {
        remote: String,
        peer: SocketAddr,
        #[source]
        source: BoxError,
    },

    #[error("relay {direction} failed: {source}")]
    Relay {
        direction: Direction,
        #[source]
        source: BoxError,
    },
}

impl TunnelError {
    pub(crate) fn relay(direction: Direction, source: impl Into<BoxError>) -> Self {
        TunnelError::Relay {
            direction,
            source: source.into(),
        }
    }
}

/// Result alias for tunnel operations.
pub type Result<T, E = TunnelError> = std::result::Result<T, E>;
