//! Local-to-remote TCP port forwarding over SSH.
//!
//! [`TunnelManager`] listens on a local port and forwards every accepted
//! connection through its own channel on a shared [`SecureSession`].
//! [`SshSession`] is the russh-backed session used by the binary; tests and
//! embedders can supply their own.

pub mod channel;
pub mod config;
pub mod error;
pub mod registry;
pub mod session;
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use channel::{ForwardedChannel, SecureSession};
pub use error::{BoxError, Direction, StateError, TunnelError};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use session::{SshAuth, SshChannel, SshSession, SshTarget};
pub use tunnel::{TunnelEvent, TunnelManager, TunnelOptions};
