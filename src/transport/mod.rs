//! Transport module - the stream a session runs over.
//!
//! A session sees its transport as a [`FrameTx`] for outgoing frames and a
//! [`FrameRx`] for incoming ones. Both are backed by bounded channels, so the
//! same session code runs over:
//!
//! - the in-process adapter ([`channel`]), which connects two endpoints
//!   directly, and
//! - a byte stream ([`stream`]), where dedicated tasks move frames between
//!   the channels and an `AsyncRead`/`AsyncWrite` pair.
//!
//! A send waits only while the peer is not receiving, and fails with
//! [`TxnError::ConnectionClosed`] once the peer has ended its side. Frames are
//! never dropped silently.
//!
//! Transport statuses are mapped onto the caller's error kinds at
//! [`FrameRx::recv`]: cancellation and deadline codes become
//! [`TxnError::Cancelled`] and [`TxnError::DeadlineExceeded`], and internal or
//! unknown codes are unwrapped to their message text.

use std::fmt;

use tokio::sync::mpsc;

use crate::error::{Result, TxnError};
use crate::protocol::{Request, Response};

pub mod stream;

#[cfg(unix)]
mod socket;

#[cfg(unix)]
pub use socket::{connect, socket_path, SocketListener};

/// Default capacity of frame channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Transport status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    Cancelled = 1,
    Unknown = 2,
    DeadlineExceeded = 4,
    Internal = 13,
    Unavailable = 14,
}

impl Code {
    /// Code for a wire value. Unrecognized values read as `Unknown`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Code::Cancelled,
            4 => Code::DeadlineExceeded,
            13 => Code::Internal,
            14 => Code::Unavailable,
            _ => Code::Unknown,
        }
    }
}

/// A terminal error status sent in place of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    /// Create a new status.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// An internal status carrying a causal message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    /// Status reporting a local error to the peer.
    pub fn from_error(err: &TxnError) -> Self {
        match err.root() {
            TxnError::Cancelled => Self::new(Code::Cancelled, err.to_string()),
            TxnError::DeadlineExceeded => Self::new(Code::DeadlineExceeded, err.to_string()),
            TxnError::Transport { code, message } => Self::new(*code, message.clone()),
            _ => Self::internal(err.to_string()),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl From<Status> for TxnError {
    fn from(status: Status) -> Self {
        match status.code {
            Code::Cancelled => TxnError::Cancelled,
            Code::DeadlineExceeded => TxnError::DeadlineExceeded,
            Code::Internal | Code::Unknown => TxnError::Remote(status.message),
            code => TxnError::Transport {
                code,
                message: status.message,
            },
        }
    }
}

type Item<M> = std::result::Result<M, Status>;

/// Sending half of a session stream.
#[derive(Debug)]
pub struct FrameTx<M> {
    tx: mpsc::Sender<Item<M>>,
}

impl<M> FrameTx<M> {
    pub(crate) fn new(tx: mpsc::Sender<Item<M>>) -> Self {
        Self { tx }
    }

    /// Send a frame, waiting while the peer is not ready to receive it.
    ///
    /// # Errors
    ///
    /// Returns [`TxnError::ConnectionClosed`] if the peer ended its side.
    pub async fn send(&self, frame: M) -> Result<()> {
        self.tx
            .send(Ok(frame))
            .await
            .map_err(|_| TxnError::ConnectionClosed)
    }

    /// End the stream with an error status.
    pub async fn fail(self, status: Status) -> Result<()> {
        self.tx
            .send(Err(status))
            .await
            .map_err(|_| TxnError::ConnectionClosed)
    }

    /// Whether the peer has ended its side.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// End the stream cleanly. The peer observes end-of-stream once every
    /// clone of this sender is closed.
    pub fn close(self) {}
}

impl<M> Clone for FrameTx<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Receiving half of a session stream.
#[derive(Debug)]
pub struct FrameRx<M> {
    rx: mpsc::Receiver<Item<M>>,
}

impl<M> FrameRx<M> {
    pub(crate) fn new(rx: mpsc::Receiver<Item<M>>) -> Self {
        Self { rx }
    }

    /// Receive the next frame, or `None` at a clean end-of-stream.
    ///
    /// # Errors
    ///
    /// Returns the mapped error of a status sent by the peer.
    pub async fn recv(&mut self) -> Result<Option<M>> {
        match self.rx.recv().await {
            None => Ok(None),
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(status)) => {
                // A status is terminal.
                self.rx.close();
                Err(status.into())
            }
        }
    }
}

/// Create a connected pair of frame channels.
pub fn frame_channel<M>(capacity: usize) -> (FrameTx<M>, FrameRx<M>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (FrameTx::new(tx), FrameRx::new(rx))
}

/// One endpoint of a session stream.
#[derive(Debug)]
pub struct Endpoint<Out, In> {
    pub tx: FrameTx<Out>,
    pub rx: FrameRx<In>,
}

impl<Out, In> Endpoint<Out, In> {
    /// Split into sending and receiving halves.
    pub fn into_split(self) -> (FrameTx<Out>, FrameRx<In>) {
        (self.tx, self.rx)
    }
}

/// The runtime's endpoint: sends requests, receives responses.
pub type ClientEnd = Endpoint<Request, Response>;

/// The connector's endpoint: sends responses, receives requests.
pub type ServerEnd = Endpoint<Response, Request>;

/// In-process transport adapter.
///
/// Returns directly connected runtime and connector endpoints, each direction
/// a bounded channel of `capacity` frames.
///
/// # Example
///
/// ```ignore
/// use materialize_txn::protocol::Request;
/// use materialize_txn::transport::channel;
///
/// let (client, mut server) = channel(4);
/// client.tx.send(Request::Acknowledge).await?;
/// assert_eq!(server.rx.recv().await?, Some(Request::Acknowledge));
/// ```
pub fn channel(capacity: usize) -> (ClientEnd, ServerEnd) {
    let (request_tx, request_rx) = frame_channel(capacity);
    let (response_tx, response_rx) = frame_channel(capacity);
    (
        Endpoint {
            tx: request_tx,
            rx: response_rx,
        },
        Endpoint {
            tx: response_tx,
            rx: request_rx,
        },
    )
}
