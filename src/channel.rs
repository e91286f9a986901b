//! Contracts for the secure session the tunnel forwards over.
//!
//! The tunnel manager never talks to the transport directly. A
//! [`SecureSession`] mints [`ForwardedChannel`]s bound to a remote
//! destination; the russh-backed implementation lives in
//! [`crate::session`].

use std::future::Future;

use crate::error::BoxError;

/// One logical byte stream multiplexed over a secure session.
///
/// All operations take `&self` so both relay directions and the teardown
/// path can use the same channel concurrently.
pub trait ForwardedChannel: Send + Sync + 'static {
    /// Read up to `max_bytes`. An empty buffer means the remote side sent EOF.
    fn read(&self, max_bytes: usize) -> impl Future<Output = Result<Vec<u8>, BoxError>> + Send;

    /// Write `data`, returning how many bytes were accepted.
    fn write(&self, data: &[u8]) -> impl Future<Output = Result<usize, BoxError>> + Send;

    /// Close the channel. Closing twice must succeed.
    ///
    /// Pending reads and writes must return once the channel is closed.
    fn close(&self) -> impl Future<Output = Result<(), BoxError>> + Send;

    fn is_open(&self) -> bool;
}

/// An authenticated session able to open forwarded channels.
pub trait SecureSession: Send + Sync + 'static {
    type Channel: ForwardedChannel;

    fn is_connected(&self) -> bool;

    /// Open a channel to `remote_host:remote_port`, reporting
    /// `source_host:source_port` as the originator.
    fn open_forwarded_channel(
        &self,
        remote_host: &str,
        remote_port: u16,
        source_host: &str,
        source_port: u16,
    ) -> impl Future<Output = Result<Self::Channel, BoxError>> + Send;
}

/// Write all of `data` to `channel`, retrying partial writes.
pub async fn write_all<C: ForwardedChannel>(channel: &C, mut data: &[u8]) -> Result<(), BoxError> {
    while !data.is_empty() {
        let written = channel.write(data).await?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "channel accepted zero bytes",
            )
            .into());
        }
        data = &data[written.min(data.len())..];
    }
    Ok(())
}
