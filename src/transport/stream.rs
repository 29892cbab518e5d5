//! Byte-stream transport: session frames over `AsyncRead`/`AsyncWrite`.
//!
//! Each direction gets a dedicated task. The sending task receives frames from
//! the [`FrameTx`] channel and writes them to the stream, batching whatever is
//! ready into a single vectored write. The receiving task reads the stream,
//! reassembles frames with a [`FrameBuffer`], and forwards them to the
//! [`FrameRx`] channel.
//!
//! # Architecture
//!
//! ```text
//! FrameTx ─► mpsc ─► sender task ─► AsyncWrite ═══► AsyncRead ─► receiver task ─► mpsc ─► FrameRx
//! ```
//!
//! Closing a `FrameTx` shuts down the write half, which the peer reads as a
//! clean end-of-stream. A [`Status`] is written as an `IS_ERROR` frame and
//! likewise ends the stream.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Code, Endpoint, FrameRx, FrameTx, Status, DEFAULT_CHANNEL_CAPACITY};
use crate::error::{Result, TxnError};
use crate::protocol::{
    flags, Frame, FrameBuffer, Header, Message, Phase, Request, Response,
    DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE,
};

/// Default size of the receiving task's read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration of a byte-stream transport.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Capacity of the frame channels, in frames.
    pub channel_capacity: usize,
    /// Largest payload accepted from the peer.
    pub max_payload_size: u32,
    /// Size of the read buffer.
    pub read_buffer_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl StreamConfig {
    /// Set the frame channel capacity.
    ///
    /// Default: 16
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the largest accepted payload.
    ///
    /// Default: 64 MiB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Set the read buffer size.
    ///
    /// Default: 64 KiB
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }
}

/// Join handles of a stream's transport tasks.
#[derive(Debug)]
pub struct StreamTasks {
    pub sender: JoinHandle<Result<()>>,
    pub receiver: JoinHandle<Result<()>>,
}

/// Attach the runtime's side of a session to a byte stream.
pub fn client<S>(stream: S, config: &StreamConfig) -> (Endpoint<Request, Response>, StreamTasks)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    attach(stream, config)
}

/// Attach the connector's side of a session to a byte stream.
pub fn server<S>(stream: S, config: &StreamConfig) -> (Endpoint<Response, Request>, StreamTasks)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    attach(stream, config)
}

/// Attach an endpoint to a byte stream.
pub fn attach<Out, In, S>(stream: S, config: &StreamConfig) -> (Endpoint<Out, In>, StreamTasks)
where
    Out: Message,
    In: Message,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    attach_split(reader, writer, config)
}

/// Attach an endpoint to separate read and write halves.
pub fn attach_split<Out, In, R, W>(
    reader: R,
    writer: W,
    config: &StreamConfig,
) -> (Endpoint<Out, In>, StreamTasks)
where
    Out: Message,
    In: Message,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, sender) = spawn_sender(writer, config);
    let (rx, receiver) = spawn_receiver(reader, config);
    (Endpoint { tx, rx }, StreamTasks { sender, receiver })
}

/// A frame ready to be written.
#[derive(Debug)]
struct OutboundFrame {
    header: [u8; HEADER_SIZE],
    payload: Bytes,
}

impl OutboundFrame {
    fn new(header: &Header, payload: Bytes) -> Self {
        Self {
            header: header.encode(),
            payload,
        }
    }

    #[inline]
    fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Spawn the sending task and return the channel feeding it.
pub fn spawn_sender<M, W>(writer: W, config: &StreamConfig) -> (FrameTx<M>, JoinHandle<Result<()>>)
where
    M: Message,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let task = tokio::spawn(async move {
        let result = writer_loop(rx, writer).await;
        if let Err(e) = &result {
            tracing::error!("stream writer failed: {}", e);
        }
        result
    });
    (FrameTx::new(tx), task)
}

/// Spawn the receiving task and return the channel it feeds.
pub fn spawn_receiver<M, R>(reader: R, config: &StreamConfig) -> (FrameRx<M>, JoinHandle<Result<()>>)
where
    M: Message,
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let max_payload_size = config.max_payload_size;
    let read_buffer_size = config.read_buffer_size.max(HEADER_SIZE);
    let task = tokio::spawn(async move {
        let result = reader_loop(reader, tx, max_payload_size, read_buffer_size).await;
        if let Err(e) = &result {
            tracing::warn!("stream reader failed: {}", e);
        }
        result
    });
    (FrameRx::new(rx), task)
}

/// Encode one channel item. Returns whether it ends the stream.
fn encode_item<M: Message>(
    item: std::result::Result<M, Status>,
    sequence: &mut u32,
) -> Result<(OutboundFrame, bool)> {
    let (kind, flag_bits, payload, terminal) = match item {
        Ok(message) => {
            let phase = message.phase();
            let direction = if phase.is_response() {
                flags::IS_RESPONSE
            } else {
                0
            };
            (phase.code(), direction, message.encode()?, false)
        }
        Err(status) => (
            status.code as u8,
            flags::IS_ERROR,
            Bytes::from(status.message.into_bytes()),
            true,
        ),
    };
    let length = u32::try_from(payload.len()).map_err(|_| {
        TxnError::Protocol(format!("payload of {} bytes is too large", payload.len()))
    })?;

    let header = Header::new(kind, flag_bits, *sequence, length);
    *sequence = sequence.wrapping_add(1);
    Ok((OutboundFrame::new(&header, payload), terminal))
}

async fn writer_loop<M, W>(
    mut rx: mpsc::Receiver<std::result::Result<M, Status>>,
    mut writer: W,
) -> Result<()>
where
    M: Message,
    W: AsyncWrite + Unpin,
{
    let mut sequence = 0u32;

    loop {
        let first = match rx.recv().await {
            Some(item) => item,
            None => {
                // Channel closed: end the stream cleanly.
                writer.shutdown().await?;
                return Ok(());
            }
        };

        let (frame, mut done) = encode_item(first, &mut sequence)?;
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(frame);

        // Collect additional ready frames (non-blocking).
        while !done && batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(item) => {
                    let (frame, terminal) = encode_item(item, &mut sequence)?;
                    batch.push(frame);
                    done = terminal;
                }
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;

        if done {
            writer.shutdown().await?;
            return Ok(());
        }
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }
    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(TxnError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data remaining after `skip_bytes`.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        for part in [&frame.header[..], &frame.payload[..]] {
            let end = offset + part.len();
            if !part.is_empty() && skip_bytes < end {
                slices.push(IoSlice::new(&part[skip_bytes.saturating_sub(offset)..]));
            }
            offset = end;
        }
    }
    slices
}

fn decode_frame<M: Message>(frame: Frame) -> Result<std::result::Result<M, Status>> {
    if frame.is_error() {
        let message = String::from_utf8_lossy(&frame.payload).into_owned();
        return Ok(Err(Status::new(Code::from_u8(frame.header.kind), message)));
    }
    let phase = Phase::from_code(frame.header.kind).ok_or_else(|| {
        TxnError::Protocol(format!("unknown phase code {:#04x}", frame.header.kind))
    })?;
    Ok(Ok(M::decode(phase, &frame.payload)?))
}

async fn reader_loop<M, R>(
    mut reader: R,
    tx: mpsc::Sender<std::result::Result<M, Status>>,
    max_payload_size: u32,
    read_buffer_size: usize,
) -> Result<()>
where
    M: Message,
    R: AsyncRead + Unpin,
{
    let mut frames = FrameBuffer::with_max_payload(max_payload_size);
    let mut buf = vec![0u8; read_buffer_size];

    // Forward a local failure to the consumer before returning it.
    async fn forward<M>(
        tx: &mpsc::Sender<std::result::Result<M, Status>>,
        status: Status,
        err: TxnError,
    ) -> Result<()> {
        let _ = tx.send(Err(status)).await;
        Err(err)
    }

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) if frames.is_mid_frame() => {
                let status = Status::new(Code::Unavailable, "stream ended mid-frame");
                return forward(&tx, status, TxnError::UnexpectedEof).await;
            }
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => {
                let status = Status::new(Code::Unavailable, e.to_string());
                return forward(&tx, status, e.into()).await;
            }
        };

        let decoded = match frames.push(&buf[..n]) {
            Ok(decoded) => decoded,
            Err(e) => return forward(&tx, Status::internal(e.to_string()), e).await,
        };

        for frame in decoded {
            let item = match decode_frame::<M>(frame) {
                Ok(item) => item,
                Err(e) => return forward(&tx, Status::internal(e.to_string()), e).await,
            };
            let terminal = item.is_err();

            if tx.send(item).await.is_err() {
                tracing::debug!("stream receiver dropped; discarding remaining frames");
                return Ok(());
            }
            if terminal {
                return Ok(());
            }
        }
    }
}
