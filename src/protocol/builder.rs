//! Frame builders for each side of a session.
//!
//! [`RequestWriter`] and [`ResponseWriter`] own the sending half of a stream.
//! They check that each phase follows one its own side may precede it with,
//! and they batch repeated items (Load, Store, Loaded) into frames.
//!
//! # Batching
//!
//! Items are staged into a pending frame while their binding is unchanged
//! and the frame's arena stays within [`BatchLimits::max_bytes`]. A binding
//! change, or an item which would overflow the arena, first sends the
//! pending frame. A frame holding [`BatchLimits::max_items`] items is sent at
//! once. Pending items are always sent before the next singleton phase, so
//! no item is held back by a timer.

use std::mem;

use bytes::Bytes;

use super::arena::Arena;
use super::messages::{
    Acknowledged, ConnectorState, Flushed, LoadBatch, LoadItem, LoadedBatch, LoadedItem, Message, Open,
    Opened, Phase, Request, Response, StartCommit, StartedCommit, StoreBatch, StoreItem,
};
use crate::error::{Result, TxnError};
use crate::transport::{FrameTx, Status};

/// Default maximum items per batched frame.
pub const DEFAULT_MAX_ITEMS: usize = 32;

/// Default arena size at which a batched frame is sent (16 KiB).
pub const DEFAULT_MAX_BYTES: usize = 16 * 1024;

/// Limits on a batched frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_items: usize,
    pub max_bytes: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl BatchLimits {
    /// Set the maximum items per frame. One sends each item as its own frame.
    ///
    /// Default: 32
    pub fn max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items.max(1);
        self
    }

    /// Set the arena size at which a frame is sent.
    ///
    /// Default: 16 KiB
    pub fn max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

/// Items of one binding staged for a single frame.
#[derive(Debug)]
struct Batcher<T> {
    limits: BatchLimits,
    binding: u32,
    arena: Arena,
    items: Vec<T>,
}

impl<T> Batcher<T> {
    fn new(limits: BatchLimits) -> Self {
        Self {
            limits,
            binding: 0,
            arena: Arena::new(),
            items: Vec::new(),
        }
    }

    /// Whether an item of `size` bytes for `binding` cannot join the pending frame.
    fn must_send_before(&self, binding: u32, size: usize) -> bool {
        !self.items.is_empty()
            && (binding != self.binding || self.arena.len() + size > self.limits.max_bytes)
    }

    /// Add an item of `size` bytes, built against the pending arena.
    fn push(&mut self, binding: u32, size: usize, build: impl FnOnce(&mut Arena) -> T) -> Result<()> {
        if !self.arena.has_room(size) {
            return Err(TxnError::Protocol(format!(
                "item of {} bytes doesn't fit a frame arena",
                size
            )));
        }
        if self.items.is_empty() {
            self.binding = binding;
        }
        let item = build(&mut self.arena);
        self.items.push(item);
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.items.len() >= self.limits.max_items.max(1)
    }

    fn take(&mut self) -> Option<(u32, Bytes, Vec<T>)> {
        if self.items.is_empty() {
            return None;
        }
        Some((self.binding, self.arena.take(), mem::take(&mut self.items)))
    }
}

fn check_order(phase: Phase, last: Option<Phase>, allowed: &[Phase]) -> Result<()> {
    match last {
        Some(last) if allowed.contains(&last) => Ok(()),
        None if allowed.is_empty() => Ok(()),
        Some(last) => Err(TxnError::Protocol(format!(
            "cannot write {} after {}",
            phase, last
        ))),
        None => Err(TxnError::Protocol(format!(
            "cannot write {} as the first frame",
            phase
        ))),
    }
}

/// Writes the runtime's side of a session.
#[derive(Debug)]
pub struct RequestWriter {
    tx: FrameTx<Request>,
    last: Option<Phase>,
    loads: Batcher<LoadItem>,
    stores: Batcher<StoreItem>,
}

impl RequestWriter {
    /// Create a writer sending over `tx`.
    pub fn new(tx: FrameTx<Request>, limits: BatchLimits) -> Self {
        Self {
            tx,
            last: None,
            loads: Batcher::new(limits),
            stores: Batcher::new(limits),
        }
    }

    /// The phase most recently written or staged.
    pub fn last_phase(&self) -> Option<Phase> {
        self.last
    }

    pub async fn write_open(&mut self, open: Open) -> Result<()> {
        check_order(Phase::Open, self.last, &[])?;
        self.send(Request::Open(open)).await
    }

    pub async fn write_acknowledge(&mut self) -> Result<()> {
        check_order(
            Phase::Acknowledge,
            self.last,
            &[Phase::Open, Phase::StartCommit],
        )?;
        self.send(Request::Acknowledge).await
    }

    /// Stage a key to load, sending the pending frame if the key can't join it.
    pub async fn stage_load(&mut self, binding: u32, key_packed: &[u8], key_json: &[u8]) -> Result<()> {
        check_order(Phase::Load, self.last, &[Phase::Acknowledge, Phase::Load])?;

        let size = key_packed.len() + key_json.len();
        if self.loads.must_send_before(binding, size) {
            self.send_loads().await?;
        }
        self.loads.push(binding, size, |arena| LoadItem {
            key_packed: arena.add(key_packed),
            key_json: arena.add(key_json),
        })?;
        self.last = Some(Phase::Load);

        if self.loads.is_full() {
            self.send_loads().await?;
        }
        Ok(())
    }

    pub async fn write_flush(&mut self) -> Result<()> {
        check_order(Phase::Flush, self.last, &[Phase::Acknowledge, Phase::Load])?;
        self.send_loads().await?;
        self.send(Request::Flush).await
    }

    /// Stage a document to store, sending the pending frame if it can't join it.
    pub async fn stage_store(
        &mut self,
        binding: u32,
        key_packed: &[u8],
        values_packed: &[u8],
        doc_json: &[u8],
        exists: bool,
    ) -> Result<()> {
        check_order(Phase::Store, self.last, &[Phase::Flush, Phase::Store])?;

        let size = key_packed.len() + values_packed.len() + doc_json.len();
        if self.stores.must_send_before(binding, size) {
            self.send_stores().await?;
        }
        self.stores.push(binding, size, |arena| StoreItem {
            key_packed: arena.add(key_packed),
            key_json: Default::default(),
            values_packed: arena.add(values_packed),
            doc_json: arena.add(doc_json),
            exists,
        })?;
        self.last = Some(Phase::Store);

        if self.stores.is_full() {
            self.send_stores().await?;
        }
        Ok(())
    }

    pub async fn write_start_commit(&mut self, runtime_checkpoint: Bytes) -> Result<()> {
        check_order(Phase::StartCommit, self.last, &[Phase::Flush, Phase::Store])?;
        self.send_stores().await?;
        self.send(Request::StartCommit(StartCommit { runtime_checkpoint }))
            .await
    }

    /// End the stream cleanly. Staged items which were never sent are dropped.
    pub fn close(self) {
        self.tx.close();
    }

    async fn send_loads(&mut self) -> Result<()> {
        match self.loads.take() {
            Some((binding, arena, items)) => {
                self.send(Request::Load(LoadBatch {
                    binding,
                    arena,
                    items,
                }))
                .await
            }
            None => Ok(()),
        }
    }

    async fn send_stores(&mut self) -> Result<()> {
        match self.stores.take() {
            Some((binding, arena, items)) => {
                self.send(Request::Store(StoreBatch {
                    binding,
                    arena,
                    items,
                }))
                .await
            }
            None => Ok(()),
        }
    }

    async fn send(&mut self, request: Request) -> Result<()> {
        let phase = request.phase();
        self.tx
            .send(request)
            .await
            .map_err(|err| TxnError::send(phase.name(), err))?;
        self.last = Some(phase);
        Ok(())
    }
}

/// Writes the connector's side of a session.
#[derive(Debug)]
pub struct ResponseWriter {
    tx: FrameTx<Response>,
    last: Option<Phase>,
    loaded: Batcher<LoadedItem>,
}

impl ResponseWriter {
    /// Create a writer sending over `tx`.
    pub fn new(tx: FrameTx<Response>, limits: BatchLimits) -> Self {
        Self {
            tx,
            last: None,
            loaded: Batcher::new(limits),
        }
    }

    /// The phase most recently written or staged.
    pub fn last_phase(&self) -> Option<Phase> {
        self.last
    }

    pub async fn write_opened(&mut self, opened: Opened) -> Result<()> {
        check_order(Phase::Opened, self.last, &[])?;
        self.send(Response::Opened(opened)).await
    }

    pub async fn write_acknowledged(&mut self, state: Option<ConnectorState>) -> Result<()> {
        check_order(
            Phase::Acknowledged,
            self.last,
            &[Phase::Opened, Phase::StartedCommit],
        )?;
        self.send(Response::Acknowledged(Acknowledged { state }))
            .await
    }

    /// Stage a found document, sending the pending frame if it can't join it.
    pub async fn stage_loaded(&mut self, binding: u32, doc_json: &[u8]) -> Result<()> {
        check_order(
            Phase::Loaded,
            self.last,
            &[Phase::Acknowledged, Phase::Loaded],
        )?;

        if self.loaded.must_send_before(binding, doc_json.len()) {
            self.send_loaded().await?;
        }
        self.loaded.push(binding, doc_json.len(), |arena| LoadedItem {
            doc_json: arena.add(doc_json),
        })?;
        self.last = Some(Phase::Loaded);

        if self.loaded.is_full() {
            self.send_loaded().await?;
        }
        Ok(())
    }

    pub async fn write_flushed(&mut self, state: Option<ConnectorState>) -> Result<()> {
        check_order(
            Phase::Flushed,
            self.last,
            &[Phase::Acknowledged, Phase::Loaded],
        )?;
        self.send_loaded().await?;
        self.send(Response::Flushed(Flushed { state })).await
    }

    pub async fn write_started_commit(&mut self, state: Option<ConnectorState>) -> Result<()> {
        check_order(Phase::StartedCommit, self.last, &[Phase::Flushed])?;
        self.send(Response::StartedCommit(StartedCommit { state }))
            .await
    }

    /// End the stream with an error status.
    pub async fn fail(self, status: Status) -> Result<()> {
        self.tx.fail(status).await
    }

    /// End the stream cleanly.
    pub fn close(self) {
        self.tx.close();
    }

    async fn send_loaded(&mut self) -> Result<()> {
        match self.loaded.take() {
            Some((binding, arena, items)) => {
                self.send(Response::Loaded(LoadedBatch {
                    binding,
                    arena,
                    items,
                }))
                .await
            }
            None => Ok(()),
        }
    }

    async fn send(&mut self, response: Response) -> Result<()> {
        let phase = response.phase();
        self.tx
            .send(response)
            .await
            .map_err(|err| TxnError::send(phase.name(), err))?;
        self.last = Some(phase);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{channel, frame_channel, FrameRx};

    fn request_writer(limits: BatchLimits) -> (RequestWriter, FrameRx<Request>) {
        let (tx, rx) = frame_channel(64);
        (RequestWriter::new(tx, limits), rx)
    }

    async fn drain<M>(rx: &mut FrameRx<M>) -> Vec<M> {
        let mut out = Vec::new();
        while let Ok(Ok(Some(frame))) =
            tokio::time::timeout(std::time::Duration::from_millis(10), rx.recv()).await
        {
            out.push(frame);
        }
        out
    }

    async fn acknowledged(writer: &mut RequestWriter) {
        writer.write_open(Open::default()).await.unwrap();
        writer.write_acknowledge().await.unwrap();
    }

    #[test]
    fn test_limits_builder() {
        let limits = BatchLimits::default();
        assert_eq!(limits.max_items, DEFAULT_MAX_ITEMS);
        assert_eq!(limits.max_bytes, DEFAULT_MAX_BYTES);

        let limits = BatchLimits::default().max_items(0).max_bytes(10);
        assert_eq!(limits, BatchLimits { max_items: 1, max_bytes: 10 });
    }

    #[test]
    fn test_oversized_item_is_rejected() {
        let mut batcher: Batcher<LoadedItem> = Batcher::new(BatchLimits::default());
        let err = batcher.push(0, usize::MAX, |_| unreachable!()).unwrap_err();
        assert!(matches!(err, TxnError::Protocol(_)), "{}", err);
        assert!(batcher.take().is_none());

        batcher
            .push(0, 2, |arena| LoadedItem {
                doc_json: arena.add(b"{}"),
            })
            .unwrap();
        let (_, arena, items) = batcher.take().unwrap();
        assert_eq!((arena.len(), items.len()), (2, 1));
    }

    #[tokio::test]
    async fn test_binding_change_sends_frame() {
        let (mut writer, mut rx) = request_writer(BatchLimits::default());
        acknowledged(&mut writer).await;

        writer.stage_load(0, b"a", b"").await.unwrap();
        writer.stage_load(0, b"b", b"").await.unwrap();
        writer.stage_load(1, b"c", b"").await.unwrap();
        writer.write_flush().await.unwrap();

        let frames = drain(&mut rx).await;
        assert_eq!(frames.len(), 5);
        let Request::Load(first) = &frames[2] else {
            panic!("expected Load, got {:?}", frames[2]);
        };
        assert_eq!(first.binding, 0);
        assert_eq!(first.len(), 2);
        assert_eq!(&first.resolve(first.items[1].key_packed)[..], b"b");

        let Request::Load(second) = &frames[3] else {
            panic!("expected Load, got {:?}", frames[3]);
        };
        assert_eq!(second.binding, 1);
        assert_eq!(second.len(), 1);
        assert_eq!(frames[4], Request::Flush);
    }

    #[tokio::test]
    async fn test_max_items_sends_at_once() {
        let (mut writer, mut rx) = request_writer(BatchLimits::default().max_items(2));
        acknowledged(&mut writer).await;
        let _ = drain(&mut rx).await;

        writer.stage_load(0, b"a", b"").await.unwrap();
        assert!(drain(&mut rx).await.is_empty());
        writer.stage_load(0, b"b", b"").await.unwrap();

        let frames = drain(&mut rx).await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], Request::Load(batch) if batch.len() == 2));
    }

    #[tokio::test]
    async fn test_max_bytes_sends_before_overflow() {
        let (mut writer, mut rx) = request_writer(BatchLimits::default().max_bytes(8));
        acknowledged(&mut writer).await;
        writer.write_flush().await.unwrap();
        let _ = drain(&mut rx).await;

        writer.stage_store(0, b"k1", b"", b"{}", false).await.unwrap();
        writer.stage_store(0, b"k2", b"", b"{}", true).await.unwrap();
        // A lone oversized item still forms a frame.
        writer
            .stage_store(0, b"k3", b"", b"{\"big\":true}", false)
            .await
            .unwrap();
        writer
            .write_start_commit(Bytes::from_static(b"cp"))
            .await
            .unwrap();

        let frames = drain(&mut rx).await;
        let sizes: Vec<usize> = frames
            .iter()
            .filter_map(|f| match f {
                Request::Store(batch) => Some(batch.len()),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![2, 1]);
        assert!(matches!(frames.last(), Some(Request::StartCommit(_))));

        let Request::Store(batch) = &frames[0] else {
            panic!("expected Store");
        };
        assert!(batch.items[1].exists);
        assert_eq!(&batch.resolve(batch.items[1].doc_json)[..], b"{}");
    }

    #[tokio::test]
    async fn test_request_order_is_enforced() {
        let (mut writer, _rx) = request_writer(BatchLimits::default());

        let err = writer.write_acknowledge().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "protocol error (cannot write Acknowledge as the first frame)"
        );

        writer.write_open(Open::default()).await.unwrap();
        let err = writer.stage_load(0, b"k", b"").await.unwrap_err();
        assert!(matches!(err, TxnError::Protocol(_)));

        writer.write_acknowledge().await.unwrap();
        let err = writer
            .write_start_commit(Bytes::from_static(b"cp"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "protocol error (cannot write StartCommit after Acknowledge)"
        );
        assert_eq!(writer.last_phase(), Some(Phase::Acknowledge));
    }

    #[tokio::test]
    async fn test_response_order_and_batching() {
        let (mut client, server) = channel(64);
        let mut writer = ResponseWriter::new(server.tx, BatchLimits::default());

        let err = writer.stage_loaded(0, b"{}").await.unwrap_err();
        assert!(matches!(err, TxnError::Protocol(_)));

        writer.write_opened(Opened::internal()).await.unwrap();
        let err = writer.write_started_commit(None).await.unwrap_err();
        assert!(matches!(err, TxnError::Protocol(_)));

        writer.write_acknowledged(None).await.unwrap();
        writer.stage_loaded(0, br#"{"a":1}"#).await.unwrap();
        writer.stage_loaded(0, br#"{"b":2}"#).await.unwrap();
        writer
            .write_flushed(Some(ConnectorState::merge(r#"{"x":1}"#)))
            .await
            .unwrap();
        writer.write_started_commit(None).await.unwrap();
        assert_eq!(writer.last_phase(), Some(Phase::StartedCommit));

        let frames = drain(&mut client.rx).await;
        assert_eq!(frames.len(), 5);
        let Response::Loaded(batch) = &frames[2] else {
            panic!("expected Loaded, got {:?}", frames[2]);
        };
        assert_eq!(batch.len(), 2);
        assert_eq!(&batch.resolve(batch.items[0].doc_json)[..], br#"{"a":1}"#);
        assert!(matches!(&frames[3], Response::Flushed(f) if f.state.is_some()));
    }

    #[tokio::test]
    async fn test_send_failure_names_phase() {
        let (client, server) = channel(4);
        drop(server);
        let mut writer = RequestWriter::new(client.tx, BatchLimits::default());

        let err = writer.write_open(Open::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "sending Open: connection closed");
        assert!(err.is_closed());
        assert_eq!(writer.last_phase(), None);
    }
}
