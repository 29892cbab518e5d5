//! Runtime side of a session.
//!
//! [`TxnClient`] drives a connector through transactions:
//!
//! 1. [`TxnClientBuilder::open`] writes Open, reads Opened, re-acknowledges
//!    the last commit and waits for the first Acknowledged.
//! 2. [`add_load`](TxnClient::add_load) requests keys; found documents are
//!    read in the background.
//! 3. [`flush`](TxnClient::flush) ends the load phase and returns the
//!    documents the connector found.
//! 4. [`add_store`](TxnClient::add_store) sends documents to store.
//! 5. [`start_commit`](TxnClient::start_commit) returns the connector's state
//!    update and an [`Acknowledgement`] which resolves once the connector's
//!    commit completes. Loads of the next transaction may begin as soon as
//!    [`acknowledge`](TxnClient::acknowledge) is called, before it resolves.
//!
//! # Example
//!
//! ```ignore
//! let mut client = TxnClient::builder(spec, "v1", RangeSpec::full())
//!     .open(&ctx, tx, rx)
//!     .await?;
//!
//! client.add_load(0, &key_packed, b"").await?;
//! let loaded = client.flush().await?;
//! client.add_store(0, &key_packed, &values_packed, doc, false).await?;
//!
//! let (_state, acknowledged) = client.start_commit(checkpoint).await?;
//! client.acknowledge().await?;
//! acknowledged.await?;
//! client.close().await?;
//! ```

use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::context::Context;
use crate::error::{Result, TxnError};
use crate::protocol::{
    BatchLimits, ConnectorState, MaterializationSpec, Message, Open, Opened, Phase, RangeSpec,
    Request, RequestWriter, Response,
};
use crate::transactor::{CommitFuture, CommitResolver};
use crate::transport::{FrameRx, FrameTx};

/// Resolves once the connector acknowledges its commit of a transaction.
pub type Acknowledgement = CommitFuture;

/// A document found by the connector during a load phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedDoc {
    pub binding: u32,
    pub doc_json: Bytes,
}

/// Builder for opening a [`TxnClient`].
#[derive(Debug, Clone)]
pub struct TxnClientBuilder {
    spec: MaterializationSpec,
    version: String,
    range: RangeSpec,
    state_json: Bytes,
    limits: BatchLimits,
}

impl TxnClientBuilder {
    /// Last persisted connector state, handed to the connector in Open.
    pub fn state_json(mut self, state_json: impl Into<Bytes>) -> Self {
        self.state_json = state_json.into();
        self
    }

    /// Limits on batched Load and Store frames.
    pub fn batch_limits(mut self, limits: BatchLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Open a session over `tx` and `rx`.
    ///
    /// Returns once the connector has acknowledged the last commit, so the
    /// first transaction may begin immediately.
    pub async fn open(
        self,
        ctx: &Context,
        tx: FrameTx<Request>,
        rx: FrameRx<Response>,
    ) -> Result<TxnClient> {
        if self.range.splits_r_clock() {
            return Err(TxnError::validation(
                "range",
                format!(
                    "materializations cannot split on r-clock: {:#010x}..{:#010x}",
                    self.range.r_clock_begin, self.range.r_clock_end
                ),
            ));
        }
        let state = if self.state_json.is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_slice(&self.state_json)?
        };

        let open = Open {
            materialization: self.spec,
            version: self.version,
            range: self.range,
            state_json: self.state_json,
        };
        open.validate().map_err(|err| TxnError::Invalid {
            what: "open",
            source: Box::new(err),
        })?;
        let bindings = open.bindings();

        let mut client = TxnClient {
            ctx: ctx.clone(),
            writer: RequestWriter::new(tx, self.limits),
            rx: Some(rx),
            reader: None,
            opened: Opened::default(),
            state,
            bindings,
        };

        if let Err(err) = client.writer.write_open(open).await {
            return Err(client.write_err(err).await);
        }
        client.opened = match client.recv("Opened").await? {
            Some(Response::Opened(opened)) => opened,
            Some(other) => return Err(TxnError::unexpected("Opened", &other)),
            None => return Err(TxnError::recv("Opened", TxnError::UnexpectedEof)),
        };
        tracing::debug!("read Opened, resume {:?}", client.opened.resume());

        // Re-acknowledge the last commit, which the connector may not have seen.
        if let Err(err) = client.writer.write_acknowledge().await {
            return Err(client.write_err(err).await);
        }

        // Flush must not be written before the first Acknowledged is read.
        let acknowledged = client.spawn_reader()?;
        acknowledged.await?;

        Ok(client)
    }
}

/// Result of a background read of Acknowledged and Loaded responses.
#[derive(Debug)]
struct Loading {
    docs: Vec<LoadedDoc>,
    /// The response which ended the Loaded phase. `None` at end-of-stream.
    terminal: Option<Response>,
    ack_state: Option<ConnectorState>,
}

type Reader = JoinHandle<(FrameRx<Response>, Result<Loading>)>;

/// The runtime's client of a connector session.
pub struct TxnClient {
    ctx: Context,
    writer: RequestWriter,
    /// Held here unless a reader task owns it.
    rx: Option<FrameRx<Response>>,
    reader: Option<Reader>,
    opened: Opened,
    state: Value,
    bindings: usize,
}

impl TxnClient {
    /// Start building a client for `spec` at `version`, assigned `range`.
    pub fn builder(
        spec: MaterializationSpec,
        version: impl Into<String>,
        range: RangeSpec,
    ) -> TxnClientBuilder {
        TxnClientBuilder {
            spec,
            version: version.into(),
            range,
            state_json: Bytes::new(),
            limits: BatchLimits::default(),
        }
    }

    /// The connector's Opened response.
    pub fn opened(&self) -> &Opened {
        &self.opened
    }

    /// Connector state, with every update received so far applied.
    pub fn state(&self) -> &Value {
        &self.state
    }

    /// Number of bindings of the materialization.
    pub fn bindings(&self) -> usize {
        self.bindings
    }

    /// Request a key of `binding` in the current transaction.
    pub async fn add_load(&mut self, binding: u32, key_packed: &[u8], key_json: &[u8]) -> Result<()> {
        self.check_binding("load.binding", binding)?;
        if let Err(err) = self.writer.stage_load(binding, key_packed, key_json).await {
            return Err(self.write_err(err).await);
        }
        Ok(())
    }

    /// End the load phase, returning every document the connector found.
    pub async fn flush(&mut self) -> Result<Vec<LoadedDoc>> {
        if let Err(err) = self.writer.write_flush().await {
            return Err(self.write_err(err).await);
        }
        let loading = self.join_reader().await?;

        let flushed = match loading.terminal {
            Some(Response::Flushed(flushed)) => flushed,
            Some(other) => return Err(TxnError::unexpected("Flushed", &other)),
            None => return Err(TxnError::recv("Flushed", TxnError::UnexpectedEof)),
        };
        // The acknowledged update precedes the flushed one.
        if let Some(state) = loading.ack_state {
            state.apply(&mut self.state)?;
        }
        if let Some(state) = flushed.state {
            state.apply(&mut self.state)?;
        }

        tracing::debug!(loaded = loading.docs.len(), "read Flushed");
        Ok(loading.docs)
    }

    /// Send a document of `binding` to store in the current transaction.
    pub async fn add_store(
        &mut self,
        binding: u32,
        key_packed: &[u8],
        values_packed: &[u8],
        doc_json: &[u8],
        exists: bool,
    ) -> Result<()> {
        self.check_binding("store.binding", binding)?;
        if let Err(err) = self
            .writer
            .stage_store(binding, key_packed, values_packed, doc_json, exists)
            .await
        {
            return Err(self.write_err(err).await);
        }
        Ok(())
    }

    /// Start committing the current transaction.
    ///
    /// Returns the connector's state update, to persist with
    /// `runtime_checkpoint`, and a future resolving when the connector
    /// acknowledges its commit.
    pub async fn start_commit(
        &mut self,
        runtime_checkpoint: Bytes,
    ) -> Result<(Option<ConnectorState>, Acknowledgement)> {
        if let Err(err) = self.writer.write_start_commit(runtime_checkpoint).await {
            return Err(self.write_err(err).await);
        }
        let state = match self.recv("StartedCommit").await? {
            Some(Response::StartedCommit(started)) => started.state,
            Some(other) => return Err(TxnError::unexpected("StartedCommit", &other)),
            None => return Err(TxnError::recv("StartedCommit", TxnError::UnexpectedEof)),
        };
        if let Some(state) = &state {
            state.apply(&mut self.state)?;
        }

        let acknowledged = self.spawn_reader()?;
        Ok((state, acknowledged))
    }

    /// Tell the connector the runtime's own commit is durable.
    pub async fn acknowledge(&mut self) -> Result<()> {
        if let Err(err) = self.writer.write_acknowledge().await {
            return Err(self.write_err(err).await);
        }
        Ok(())
    }

    /// End the session.
    ///
    /// Succeeds if the connector ends its stream right after Acknowledged,
    /// which it does once it reads end-of-stream between transactions.
    /// Closing with a transaction underway is a protocol error.
    pub async fn close(mut self) -> Result<()> {
        let reader = self.reader.take();
        let last = self.writer.last_phase();
        self.writer.close();

        if last != Some(Phase::Acknowledge) {
            return Err(TxnError::Protocol(format!(
                "closed mid-transaction (during {})",
                last.map_or("Open", Phase::name)
            )));
        }

        let Some(reader) = reader else {
            return Ok(());
        };
        let (_rx, result) = reader.await.map_err(|err| TxnError::Io(std::io::Error::other(err)))?;
        match result?.terminal {
            None => Ok(()), // Graceful shutdown.
            Some(other) => Err(TxnError::unexpected("EOF", &other)),
        }
    }

    fn check_binding(&self, path: &str, binding: u32) -> Result<()> {
        if binding as usize >= self.bindings {
            return Err(TxnError::validation(
                path,
                format!("{} is not less than {} bindings", binding, self.bindings),
            ));
        }
        Ok(())
    }

    async fn recv(&mut self, phase: &'static str) -> Result<Option<Response>> {
        let rx = self.rx.as_mut().ok_or_else(|| {
            TxnError::Protocol(format!("cannot read {} while Loaded is being read", phase))
        })?;
        recv(&self.ctx, rx, phase, self.bindings).await
    }

    fn spawn_reader(&mut self) -> Result<Acknowledgement> {
        let mut rx = self.rx.take().ok_or_else(|| {
            TxnError::Protocol("Acknowledged and Loaded are already being read".to_string())
        })?;
        let (resolver, acknowledged) = CommitFuture::pair();
        let ctx = self.ctx.clone();
        let bindings = self.bindings;

        self.reader = Some(tokio::spawn(async move {
            let result = read_acknowledged_and_loaded(&ctx, &mut rx, bindings, resolver).await;
            (rx, result)
        }));
        Ok(acknowledged)
    }

    async fn join_reader(&mut self) -> Result<Loading> {
        let reader = self.reader.take().ok_or_else(|| {
            TxnError::Protocol("Acknowledged and Loaded are not being read".to_string())
        })?;
        let (rx, result) = reader
            .await
            .map_err(|err| TxnError::Io(std::io::Error::other(err)))?;
        self.rx = Some(rx);
        result
    }

    /// Map a failed write to its cause.
    ///
    /// A broken stream surfaces its causal error only on the receive side:
    /// wait for the running reader, or read it directly.
    async fn write_err(&mut self, err: TxnError) -> TxnError {
        if !err.is_closed() {
            return err;
        }
        if self.reader.is_some() {
            return match self.join_reader().await {
                Err(cause) => cause,
                Ok(_) => err,
            };
        }
        let Some(rx) = self.rx.as_mut() else {
            return err;
        };
        loop {
            match rx.recv().await {
                Ok(Some(_)) => continue,
                Ok(None) => return err,
                Err(cause) => return cause,
            }
        }
    }
}

async fn recv(
    ctx: &Context,
    rx: &mut FrameRx<Response>,
    phase: &'static str,
    bindings: usize,
) -> Result<Option<Response>> {
    let response = ctx
        .run(rx.recv())
        .await?
        .map_err(|err| TxnError::recv(phase, err))?;
    if let Some(response) = &response {
        response
            .validate(bindings)
            .map_err(|err| TxnError::recv(response.phase().name(), err))?;
    }
    Ok(response)
}

async fn read_acknowledged_and_loaded(
    ctx: &Context,
    rx: &mut FrameRx<Response>,
    bindings: usize,
    acknowledged: CommitResolver,
) -> Result<Loading> {
    let ack_state = match read_acknowledged(ctx, rx, bindings).await {
        Ok(state) => {
            acknowledged.resolve(Ok(()));
            state
        }
        Err(err) => {
            let err = err.into_shared();
            acknowledged.resolve(Err(TxnError::Shared(err.clone())));
            return Err(TxnError::Shared(err));
        }
    };

    let mut docs = Vec::new();
    loop {
        match recv(ctx, rx, "Loaded", bindings).await? {
            Some(Response::Loaded(batch)) => {
                docs.extend(batch.items.iter().map(|item| LoadedDoc {
                    binding: batch.binding,
                    doc_json: batch.resolve(item.doc_json),
                }));
            }
            terminal => {
                return Ok(Loading {
                    docs,
                    terminal,
                    ack_state,
                })
            }
        }
    }
}

async fn read_acknowledged(
    ctx: &Context,
    rx: &mut FrameRx<Response>,
    bindings: usize,
) -> Result<Option<ConnectorState>> {
    match recv(ctx, rx, "Acknowledged", bindings).await? {
        Some(Response::Acknowledged(acked)) => {
            tracing::debug!("read Acknowledged");
            Ok(acked.state)
        }
        Some(other) => Err(TxnError::unexpected("Acknowledged", &other)),
        None => Err(TxnError::recv("Acknowledged", TxnError::UnexpectedEof)),
    }
}
