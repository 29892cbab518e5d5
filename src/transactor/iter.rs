//! Iterators over the Load and Store phases, and the Loaded callback.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::{oneshot, Mutex};

use crate::context::Context;
use crate::error::{Result, TxnError};
use crate::protocol::{
    unpack, Element, LoadBatch, Message, Phase, Request, ResponseWriter, StoreBatch,
};
use crate::transport::FrameRx;

/// A key requested by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadDoc {
    pub binding: u32,
    pub key: Vec<Element>,
    pub key_packed: Bytes,
    /// Readable key JSON. Empty if the runtime did not send one.
    pub key_json: Bytes,
}

/// A document to store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreDoc {
    pub binding: u32,
    pub key: Vec<Element>,
    pub values: Vec<Element>,
    pub key_packed: Bytes,
    pub values_packed: Bytes,
    pub doc_json: Bytes,
    /// Whether the document was loaded, and so already exists in the store.
    pub exists: bool,
}

enum Ack {
    /// The prior commit hasn't been acknowledged yet.
    Pending(oneshot::Receiver<ResponseWriter>),
    /// Acknowledged was sent; Loaded frames may follow.
    Sent(ResponseWriter),
    /// The await activity ended without sending Acknowledged.
    Failed,
}

/// Hand-off of the response writer from the await activity to the load activity.
///
/// The await activity sends the writer once it has written Acknowledged. If it
/// fails, it drops the sender and the gate reads as failed.
pub(crate) struct AckGate {
    ack: Mutex<Ack>,
    iterator_failed: AtomicBool,
}

impl AckGate {
    pub(crate) fn new(rx: oneshot::Receiver<ResponseWriter>) -> Self {
        Self {
            ack: Mutex::new(Ack::Pending(rx)),
            iterator_failed: AtomicBool::new(false),
        }
    }

    async fn wait(&self, ctx: &Context) -> Result<()> {
        let mut ack = self.ack.lock().await;

        let received = match &mut *ack {
            Ack::Pending(rx) => Some(ctx.run(rx).await?.ok()),
            _ => None,
        };
        if let Some(received) = received {
            *ack = match received {
                Some(writer) => Ack::Sent(writer),
                None => Ack::Failed,
            };
        }

        match &*ack {
            Ack::Sent(_) => Ok(()),
            _ => Err(TxnError::Cancelled),
        }
    }

    async fn stage_loaded(&self, binding: u32, doc_json: &[u8]) -> Result<()> {
        match &mut *self.ack.lock().await {
            Ack::Sent(writer) => writer.stage_loaded(binding, doc_json).await,
            Ack::Failed => Err(TxnError::Cancelled),
            Ack::Pending(_) => Err(TxnError::Protocol(
                "loaded called without first calling LoadIterator::wait_for_acknowledged".to_string(),
            )),
        }
    }

    /// Take back the writer once both activities have finished.
    pub(crate) fn into_writer(self) -> Option<ResponseWriter> {
        match self.ack.into_inner() {
            Ack::Sent(writer) => Some(writer),
            Ack::Pending(mut rx) => rx.try_recv().ok(),
            Ack::Failed => None,
        }
    }
}

/// How a load or store phase ended.
#[derive(Debug)]
pub(crate) struct PhaseEnd {
    /// The frame which closed the phase, if one was read.
    pub terminal: Option<Request>,
    /// Phase of the last frame read, for protocol errors.
    pub last: Phase,
    /// Clean end-of-stream before any item.
    pub eof: bool,
    pub err: Option<TxnError>,
    pub total: usize,
}

/// Iterator over the keys of a Load phase.
///
/// Yields keys until the runtime sends a frame other than Load. Before ending,
/// it waits until the prior transaction was acknowledged, so a connector which
/// stages keys and evaluates them after iteration reads committed data.
pub struct LoadIterator<'a> {
    ctx: &'a Context,
    rx: &'a mut FrameRx<Request>,
    gate: &'a AckGate,
    bindings: usize,
    batch: Option<LoadBatch>,
    index: usize,
    last: Phase,
    terminal: Option<Request>,
    total: usize,
    err: Option<TxnError>,
    eof: bool,
    done: bool,
}

impl<'a> LoadIterator<'a> {
    pub(crate) fn new(
        ctx: &'a Context,
        rx: &'a mut FrameRx<Request>,
        gate: &'a AckGate,
        bindings: usize,
    ) -> Self {
        Self {
            ctx,
            rx,
            gate,
            bindings,
            batch: None,
            index: 0,
            last: Phase::Acknowledge,
            terminal: None,
            total: 0,
            err: None,
            eof: false,
            done: false,
        }
    }

    /// The next requested key, or `None` once the phase ends.
    ///
    /// After `None`, check [`err`](Self::err).
    pub async fn next(&mut self) -> Option<LoadDoc> {
        if self.done {
            return None;
        }
        loop {
            if let Some(batch) = &self.batch {
                if let Some(item) = batch.items.get(self.index).copied() {
                    self.index += 1;
                    let binding = batch.binding;
                    let key_packed = batch.resolve(item.key_packed);
                    let key_json = batch.resolve(item.key_json);

                    return match unpack(&key_packed) {
                        Ok(key) => {
                            self.total += 1;
                            Some(LoadDoc {
                                binding,
                                key,
                                key_packed,
                                key_json,
                            })
                        }
                        Err(source) => self.fail(TxnError::Unpack {
                            what: "Load key",
                            source,
                        }),
                    };
                }
                self.batch = None;
            }

            let received = match self.ctx.run(self.rx.recv()).await {
                Ok(received) => received.map_err(|err| TxnError::recv("Load", err)),
                Err(err) => Err(err),
            };
            match received {
                Ok(Some(Request::Load(batch))) => {
                    self.last = Phase::Load;
                    if let Err(err) = batch.validate(self.bindings) {
                        return self.fail(err);
                    }
                    self.batch = Some(batch);
                    self.index = 0;
                }
                Ok(Some(request)) => {
                    // No loads remain.
                    self.last = request.phase();
                    self.terminal = Some(request);
                    return self.finish().await;
                }
                Ok(None) if self.total == 0 => {
                    self.eof = true;
                    return self.finish().await;
                }
                Ok(None) => {
                    return self.fail(TxnError::Protocol(
                        "unexpected EOF when there are loaded keys".to_string(),
                    ))
                }
                Err(err) => return self.fail(err),
            }
        }
    }

    /// Wait until the prior transaction's Acknowledged has been sent.
    ///
    /// Afterwards the connector may query its store without violating
    /// read-committed semantics. Fails with [`TxnError::Cancelled`] if the
    /// prior commit failed.
    pub async fn wait_for_acknowledged(&mut self) -> Result<()> {
        self.gate.wait(self.ctx).await
    }

    /// The error which ended iteration, if any.
    pub fn err(&self) -> Option<&TxnError> {
        self.err.as_ref()
    }

    /// Whether the runtime cleanly ended the session instead of a transaction.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Number of keys yielded.
    pub fn total(&self) -> usize {
        self.total
    }

    /// The session's context.
    pub fn context(&self) -> &Context {
        self.ctx
    }

    pub(crate) fn into_end(self) -> PhaseEnd {
        PhaseEnd {
            terminal: self.terminal,
            last: self.last,
            eof: self.eof,
            err: self.err,
            total: self.total,
        }
    }

    async fn finish(&mut self) -> Option<LoadDoc> {
        self.done = true;
        // Block for connectors which stage keys and evaluate them on return.
        if let Err(err) = self.gate.wait(self.ctx).await {
            return self.fail(err);
        }
        None
    }

    fn fail(&mut self, err: TxnError) -> Option<LoadDoc> {
        self.done = true;
        self.err = Some(err);
        self.gate.iterator_failed.store(true, Ordering::Release);
        None
    }
}

/// Callback through which a connector reports documents it found.
pub struct Loaded<'a> {
    gate: &'a AckGate,
    bindings: usize,
    count: usize,
}

impl<'a> Loaded<'a> {
    pub(crate) fn new(gate: &'a AckGate, bindings: usize) -> Self {
        Self {
            gate,
            bindings,
            count: 0,
        }
    }

    /// Report a found document of `binding`.
    ///
    /// Must follow [`LoadIterator::wait_for_acknowledged`] (or the end of
    /// iteration), and must not be called once the iterator has failed.
    /// Returns [`TxnError::Cancelled`] if the prior commit failed.
    pub async fn send(&mut self, binding: u32, doc_json: &[u8]) -> Result<()> {
        if self.gate.iterator_failed.load(Ordering::Acquire) {
            return Err(TxnError::Protocol(
                "loaded called without first checking LoadIterator::err".to_string(),
            ));
        }
        if binding as usize >= self.bindings {
            return Err(TxnError::validation(
                "loaded.binding",
                format!("{} is not less than {} bindings", binding, self.bindings),
            ));
        }
        self.gate.stage_loaded(binding, doc_json).await?;
        self.count += 1;
        Ok(())
    }

    /// Number of documents reported.
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Iterator over the documents of a Store phase.
pub struct StoreIterator<'a> {
    ctx: &'a Context,
    rx: &'a mut FrameRx<Request>,
    bindings: usize,
    batch: Option<StoreBatch>,
    index: usize,
    last: Phase,
    terminal: Option<Request>,
    total: usize,
    err: Option<TxnError>,
    done: bool,
}

impl<'a> StoreIterator<'a> {
    pub(crate) fn new(ctx: &'a Context, rx: &'a mut FrameRx<Request>, bindings: usize) -> Self {
        Self {
            ctx,
            rx,
            bindings,
            batch: None,
            index: 0,
            last: Phase::Flush,
            terminal: None,
            total: 0,
            err: None,
            done: false,
        }
    }

    /// The next document to store, or `None` once the phase ends.
    ///
    /// After `None`, check [`err`](Self::err).
    pub async fn next(&mut self) -> Option<StoreDoc> {
        if self.done {
            return None;
        }
        loop {
            if let Some(batch) = &self.batch {
                if let Some(item) = batch.items.get(self.index).copied() {
                    self.index += 1;
                    let binding = batch.binding;
                    let key_packed = batch.resolve(item.key_packed);
                    let values_packed = batch.resolve(item.values_packed);
                    let doc_json = batch.resolve(item.doc_json);

                    let key = match unpack(&key_packed) {
                        Ok(key) => key,
                        Err(source) => {
                            return self.fail(TxnError::Unpack {
                                what: "Store key",
                                source,
                            })
                        }
                    };
                    let values = match unpack(&values_packed) {
                        Ok(values) => values,
                        Err(source) => {
                            return self.fail(TxnError::Unpack {
                                what: "Store values",
                                source,
                            })
                        }
                    };

                    self.total += 1;
                    return Some(StoreDoc {
                        binding,
                        key,
                        values,
                        key_packed,
                        values_packed,
                        doc_json,
                        exists: item.exists,
                    });
                }
                self.batch = None;
            }

            let received = match self.ctx.run(self.rx.recv()).await {
                Ok(received) => received.map_err(|err| TxnError::recv("Store", err)),
                Err(err) => Err(err),
            };
            match received {
                Ok(Some(Request::Store(batch))) => {
                    self.last = Phase::Store;
                    if let Err(err) = batch.validate(self.bindings) {
                        return self.fail(err);
                    }
                    self.batch = Some(batch);
                    self.index = 0;
                }
                Ok(Some(request)) => {
                    // No stores remain.
                    self.last = request.phase();
                    self.terminal = Some(request);
                    self.done = true;
                    return None;
                }
                Ok(None) => return self.fail(TxnError::recv("Store", TxnError::UnexpectedEof)),
                Err(err) => return self.fail(err),
            }
        }
    }

    /// The error which ended iteration, if any.
    pub fn err(&self) -> Option<&TxnError> {
        self.err.as_ref()
    }

    /// Number of documents yielded.
    pub fn total(&self) -> usize {
        self.total
    }

    /// The session's context.
    pub fn context(&self) -> &Context {
        self.ctx
    }

    pub(crate) fn into_end(self) -> PhaseEnd {
        PhaseEnd {
            terminal: self.terminal,
            last: self.last,
            eof: false,
            err: self.err,
            total: self.total,
        }
    }

    fn fail(&mut self, err: TxnError) -> Option<StoreDoc> {
        self.done = true;
        self.err = Some(err);
        None
    }
}
