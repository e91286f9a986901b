//! In-memory secure session used by the tunnel tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::channel::{ForwardedChannel, SecureSession};
use crate::error::BoxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Open,
    Closed,
    Failed,
}

struct Inbox {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    leftover: Vec<u8>,
}

struct EchoState {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbox: tokio::sync::Mutex<Inbox>,
    signal: watch::Sender<Signal>,
    close_calls: AtomicUsize,
}

/// Channel whose remote end echoes everything written to it.
#[derive(Clone)]
pub(crate) struct EchoChannel {
    state: Arc<EchoState>,
}

impl EchoChannel {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (signal, _) = watch::channel(Signal::Open);
        Self {
            state: Arc::new(EchoState {
                tx: Mutex::new(Some(tx)),
                inbox: tokio::sync::Mutex::new(Inbox {
                    rx,
                    leftover: Vec::new(),
                }),
                signal,
                close_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Simulate the remote side sending EOF once queued data is read.
    pub(crate) fn remote_eof(&self) {
        self.state.tx.lock().unwrap().take();
    }

    /// Make pending and future reads fail.
    pub(crate) fn fail(&self) {
        self.state.signal.send_replace(Signal::Failed);
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    fn current(&self) -> Signal {
        *self.state.signal.borrow()
    }
}

impl ForwardedChannel for EchoChannel {
    async fn read(&self, max_bytes: usize) -> Result<Vec<u8>, BoxError> {
        let mut signal = self.state.signal.subscribe();
        let mut inbox = self.state.inbox.lock().await;
        let Inbox { rx, leftover } = &mut *inbox;

        if !leftover.is_empty() {
            let rest = leftover.split_off(leftover.len().min(max_bytes));
            return Ok(std::mem::replace(leftover, rest));
        }

        tokio::select! {
            chunk = rx.recv() => match chunk {
                Some(mut data) => {
                    if data.len() > max_bytes {
                        *leftover = data.split_off(max_bytes);
                    }
                    Ok(data)
                }
                None => Ok(Vec::new()),
            },
            state = async { signal.wait_for(|s| *s != Signal::Open).await.map(|s| *s) } => match state {
                Ok(Signal::Failed) => Err("injected channel failure".into()),
                _ => Ok(Vec::new()),
            },
        }
    }

    async fn write(&self, data: &[u8]) -> Result<usize, BoxError> {
        if self.current() != Signal::Open {
            return Err("channel is closed".into());
        }
        let tx = self.state.tx.lock().unwrap().clone();
        match tx {
            Some(tx) if tx.send(data.to_vec()).is_ok() => Ok(data.len()),
            _ => Err("remote side is gone".into()),
        }
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        self.state.signal.send_if_modified(|s| {
            if *s == Signal::Open {
                *s = Signal::Closed;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.current() == Signal::Open
    }
}

/// A channel open request observed by [`MockSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OpenRequest {
    pub remote: (String, u16),
    pub source: (String, u16),
}

/// Session handing out [`EchoChannel`]s.
pub(crate) struct MockSession {
    connected: AtomicBool,
    refuse_next: AtomicUsize,
    open_delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<OpenRequest>>,
    channels: Mutex<Vec<EchoChannel>>,
}

impl MockSession {
    pub(crate) fn connected() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            refuse_next: AtomicUsize::new(0),
            open_delay: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn disconnected() -> Arc<Self> {
        let session = Self::connected();
        session.set_connected(false);
        session
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Refuse the next `count` channel opens.
    pub(crate) fn refuse_next(&self, count: usize) {
        self.refuse_next.store(count, Ordering::SeqCst);
    }

    pub(crate) fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn requests(&self) -> Vec<OpenRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Channels handed out so far, in open order.
    pub(crate) fn channels(&self) -> Vec<EchoChannel> {
        self.channels.lock().unwrap().clone()
    }
}

impl SecureSession for MockSession {
    type Channel = EchoChannel;

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn open_forwarded_channel(
        &self,
        remote_host: &str,
        remote_port: u16,
        source_host: &str,
        source_port: u16,
    ) -> Result<EchoChannel, BoxError> {
        self.requests.lock().unwrap().push(OpenRequest {
            remote: (remote_host.to_string(), remote_port),
            source: (source_host.to_string(), source_port),
        });

        let delay = *self.open_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if !self.is_connected() {
            return Err("session is not connected".into());
        }
        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err("administratively prohibited: open failed".into());
        }

        let channel = EchoChannel::new();
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }
}
