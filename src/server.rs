//! Connector side of a session.
//!
//! [`run_transactions`] drives a [`Transactor`] through the rounds of a
//! session. Each round overlaps two activities:
//!
//! - **await**: wait for the prior transaction's commit, then write
//!   Acknowledged and hand the response writer to the load activity.
//! - **load**: run [`Transactor::load`] over the round's Load requests.
//!
//! Loaded responses can only be written once Acknowledged has been, so a
//! connector never reports documents the runtime might read before the prior
//! commit is durable. After both activities finish, the round proceeds
//! sequentially through Flushed, the Store phase, and StartedCommit.

use std::future::Future;

use tokio::sync::oneshot;

use crate::context::Context;
use crate::error::{Result, TxnError};
use crate::protocol::{BatchLimits, Open, Opened, Request, Response, ResponseWriter};
use crate::transactor::{
    AckGate, CommitFuture, LoadIterator, Loaded, PhaseEnd, StoreIterator, Transactor,
};
use crate::transport::{FrameRx, FrameTx, Status};

/// Serve one session: read Open, open a transactor, and run transactions.
///
/// `open` validates the request against the connector's endpoint and returns
/// the Opened response with a transactor. A failure of the session is reported
/// to the runtime as an error status before it is returned.
pub async fn serve<T, F, Fut>(
    ctx: &Context,
    mut rx: FrameRx<Request>,
    tx: FrameTx<Response>,
    limits: BatchLimits,
    open: F,
) -> Result<()>
where
    T: Transactor,
    F: FnOnce(Open) -> Fut,
    Fut: Future<Output = Result<(Opened, T)>>,
{
    let status_tx = tx.clone();

    let result = match read_open(ctx, &mut rx).await {
        Ok(request) => match open(request.clone()).await {
            Ok((opened, transactor)) => {
                run_transactions(ctx, rx, tx, request, opened, transactor, limits).await
            }
            Err(err) => Err(err),
        },
        Err(err) => Err(err),
    };

    if let Err(err) = &result {
        if !err.is_closed() {
            let _ = status_tx.fail(Status::from_error(err)).await;
        }
    }
    result
}

/// Run transactions of an opened session until the runtime ends it.
///
/// Writes `opened`, then loops over transaction rounds until the runtime
/// closes its side between transactions, which is a clean shutdown.
/// [`Transactor::destroy`] is called exactly once, however the session ends.
pub async fn run_transactions<T: Transactor>(
    ctx: &Context,
    mut rx: FrameRx<Request>,
    tx: FrameTx<Response>,
    open: Open,
    opened: Opened,
    transactor: T,
    limits: BatchLimits,
) -> Result<()> {
    let mut transactor = DestroyOnDrop(transactor);

    let result = transact(ctx, &mut rx, tx, open, opened, &mut transactor.0, limits).await;
    match &result {
        Ok(()) => tracing::debug!("run_transactions finished"),
        Err(err) => tracing::error!(error = %err, "run_transactions failed"),
    }
    result
}

struct DestroyOnDrop<T: Transactor>(T);

impl<T: Transactor> Drop for DestroyOnDrop<T> {
    fn drop(&mut self) {
        self.0.destroy();
    }
}

async fn transact<T: Transactor>(
    ctx: &Context,
    rx: &mut FrameRx<Request>,
    tx: FrameTx<Response>,
    open: Open,
    opened: Opened,
    transactor: &mut T,
    limits: BatchLimits,
) -> Result<()> {
    open.validate().map_err(|err| TxnError::Invalid {
        what: "open",
        source: Box::new(err),
    })?;
    opened.validate().map_err(|err| TxnError::Invalid {
        what: "opened",
        source: Box::new(err),
    })?;
    let bindings = open.bindings();

    let mut writer = ResponseWriter::new(tx, limits);
    writer.write_opened(opened).await?;

    // Nothing to commit before the first round.
    let mut commit = CommitFuture::ok();

    for round in 0u64.. {
        read_acknowledge(ctx, rx).await?;
        transactor
            .runtime_committed(ctx)
            .await
            .map_err(|err| in_context(ctx, TxnError::transactor("RuntimeCommitted", err)))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        let gate = AckGate::new(ack_rx);
        let end = {
            let awaiting = await_commit(ctx, round, commit, writer, ack_tx);
            let loading = load(ctx, round, transactor, rx, &gate, bindings);
            join_round(awaiting, loading).await?
        };
        if end.eof {
            return Ok(()); // Graceful shutdown.
        }
        writer = gate.into_writer().ok_or_else(|| {
            TxnError::Protocol("Acknowledged was not written before load finished".to_string())
        })?;

        match end.terminal {
            Some(Request::Flush) => {}
            Some(other) => return Err(TxnError::unexpected("Flush", &other)),
            None => return Err(TxnError::unexpected("Flush", end.last)),
        }
        writer.write_flushed(None).await?;
        tracing::debug!(round, "wrote Flushed");

        let end = store(ctx, round, transactor, rx, bindings).await?;
        let start = match end.terminal {
            Some(Request::StartCommit(start)) => start,
            Some(other) => return Err(TxnError::unexpected("StartCommit", &other)),
            None => return Err(TxnError::unexpected("StartCommit", end.last)),
        };
        start.validate()?;

        let (state, mut started) = transactor
            .start_commit(ctx, start.runtime_checkpoint)
            .await
            .map_err(|err| in_context(ctx, TxnError::transactor("StartCommit", err)))?;

        // A pre-resolved failure means `state` may be invalid: don't send it.
        if let Some(Err(err)) = started.try_result() {
            return Err(TxnError::transactor("StartCommit", TxnError::Shared(err)));
        }
        writer.write_started_commit(state).await?;
        tracing::debug!(round, "wrote StartedCommit");

        commit = started;
    }
    Ok(())
}

async fn read_open(ctx: &Context, rx: &mut FrameRx<Request>) -> Result<Open> {
    match ctx
        .run(rx.recv())
        .await?
        .map_err(|err| TxnError::recv("Open", err))?
    {
        Some(Request::Open(open)) => Ok(open),
        Some(other) => Err(TxnError::unexpected("Open", &other)),
        None => Err(TxnError::recv("Open", TxnError::UnexpectedEof)),
    }
}

async fn read_acknowledge(ctx: &Context, rx: &mut FrameRx<Request>) -> Result<()> {
    match ctx
        .run(rx.recv())
        .await?
        .map_err(|err| TxnError::recv("Acknowledge", err))?
    {
        Some(Request::Acknowledge) => Ok(()),
        Some(other) => Err(TxnError::unexpected("Acknowledge", &other)),
        None => Err(TxnError::recv("Acknowledge", TxnError::UnexpectedEof)),
    }
}

/// Wait for the prior commit, write Acknowledged, and hand off the writer.
async fn await_commit(
    ctx: &Context,
    round: u64,
    commit: CommitFuture,
    mut writer: ResponseWriter,
    handoff: oneshot::Sender<ResponseWriter>,
) -> Result<()> {
    ctx.run(commit).await??;
    writer.write_acknowledged(None).await?;
    tracing::debug!(round, "wrote Acknowledged");

    // The load activity may have already returned, which is fine.
    let _ = handoff.send(writer);
    Ok(())
}

async fn load<T: Transactor>(
    ctx: &Context,
    round: u64,
    transactor: &mut T,
    rx: &mut FrameRx<Request>,
    gate: &AckGate,
    bindings: usize,
) -> Result<PhaseEnd> {
    let mut it = LoadIterator::new(ctx, rx, gate, bindings);
    let mut loaded = Loaded::new(gate, bindings);

    let result = transactor.load(&mut it, &mut loaded).await;
    let count = loaded.count();
    let mut end = it.into_end();
    tracing::debug!(round, total = end.total, loaded = count, "load finished");

    // Prefer the iterator's error: it's earlier in the chain of dependency
    // and likely causal of (or equal to) the transactor's.
    match (end.err.take(), result) {
        (Some(err), _) | (None, Err(err)) => {
            Err(in_context(ctx, TxnError::transactor("Load", err)))
        }
        (None, Ok(())) => Ok(end),
    }
}

async fn store<T: Transactor>(
    ctx: &Context,
    round: u64,
    transactor: &mut T,
    rx: &mut FrameRx<Request>,
    bindings: usize,
) -> Result<PhaseEnd> {
    let mut it = StoreIterator::new(ctx, rx, bindings);

    let result = transactor.store(&mut it).await;
    let mut end = it.into_end();

    match (end.err.take(), result) {
        (Some(err), _) | (None, Err(err)) => {
            Err(in_context(ctx, TxnError::transactor("Store", err)))
        }
        (None, Ok(())) => {
            tracing::debug!(round, stored = end.total, "store finished");
            Ok(end)
        }
    }
}

/// Join the await and load activities of a round.
///
/// A failed await ends the round at once, dropping an in-progress load.
async fn join_round(
    awaiting: impl Future<Output = Result<()>>,
    loading: impl Future<Output = Result<PhaseEnd>>,
) -> Result<PhaseEnd> {
    tokio::pin!(awaiting, loading);

    let mut awaited = false;
    let mut loaded = None;

    loop {
        if awaited {
            if let Some(end) = loaded.take() {
                return Ok(end);
            }
        }
        tokio::select! {
            biased;
            result = &mut awaiting, if !awaited => {
                result.map_err(|err| {
                    if is_context_error(&err) {
                        err
                    } else {
                        TxnError::CommitFailed(Box::new(err))
                    }
                })?;
                awaited = true;
            }
            result = &mut loading, if loaded.is_none() => {
                loaded = Some(result?);
            }
        }
    }
}

fn is_context_error(err: &TxnError) -> bool {
    matches!(err.root(), TxnError::Cancelled | TxnError::DeadlineExceeded)
}

/// Report the context's own error when it's the reason a phase failed.
fn in_context(ctx: &Context, err: TxnError) -> TxnError {
    ctx.err().unwrap_or(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        pack, Arena, Binding, Element, FieldSelection, LoadBatch, LoadItem, MaterializationSpec,
        Message, Phase, RangeSpec, StartCommit,
    };
    use crate::transport::{channel, ClientEnd};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn open() -> Open {
        Open {
            materialization: MaterializationSpec {
                name: "acme/widgets".to_string(),
                config_json: "{}".to_string(),
                bindings: vec![Binding {
                    collection: "acme/events".to_string(),
                    resource_path: vec!["widgets".to_string()],
                    resource_config_json: "{}".to_string(),
                    field_selection: FieldSelection {
                        keys: vec!["id".to_string()],
                        values: vec![],
                        document: "flow_document".to_string(),
                    },
                    delta_updates: false,
                }],
            },
            version: "v1".to_string(),
            range: RangeSpec::full(),
            state_json: Bytes::new(),
        }
    }

    fn load_request(key: &str) -> Request {
        let mut arena = Arena::new();
        let item = LoadItem {
            key_packed: arena.add(&pack(&[Element::from(key)])),
            key_json: Default::default(),
        };
        Request::Load(LoadBatch {
            binding: 0,
            arena: arena.freeze(),
            items: vec![item],
        })
    }

    /// Finds every requested key, once acknowledged.
    #[derive(Default)]
    struct Echo {
        destroyed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transactor for Echo {
        async fn load(&mut self, it: &mut LoadIterator<'_>, loaded: &mut Loaded<'_>) -> Result<()> {
            let mut keys = Vec::new();
            while let Some(doc) = it.next().await {
                keys.push(doc);
            }
            if let Some(err) = it.err() {
                return Err(TxnError::connector(err.to_string()));
            }
            for doc in keys {
                loaded.send(doc.binding, br#"{"found":true}"#).await?;
            }
            Ok(())
        }

        async fn store(&mut self, it: &mut StoreIterator<'_>) -> Result<()> {
            while it.next().await.is_some() {}
            Ok(())
        }

        fn destroy(&mut self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn expect(client: &mut ClientEnd, phase: Phase) -> Response {
        let response = client.rx.recv().await.unwrap().unwrap();
        assert_eq!(response.phase(), phase, "{:?}", response);
        response
    }

    #[tokio::test]
    async fn test_round_trip_over_frames() {
        let (mut client, server) = channel(16);
        let destroyed = Arc::new(AtomicUsize::new(0));
        let transactor = Echo {
            destroyed: destroyed.clone(),
        };
        let task = tokio::spawn(async move {
            let ctx = Context::new();
            serve(&ctx, server.rx, server.tx, BatchLimits::default(), |_| async {
                Ok((Opened::internal(), transactor))
            })
            .await
        });

        client.tx.send(Request::Open(open())).await.unwrap();
        expect(&mut client, Phase::Opened).await;
        client.tx.send(Request::Acknowledge).await.unwrap();
        client.tx.send(load_request("k1")).await.unwrap();
        client.tx.send(Request::Flush).await.unwrap();

        expect(&mut client, Phase::Acknowledged).await;
        let Response::Loaded(batch) = expect(&mut client, Phase::Loaded).await else {
            unreachable!()
        };
        assert_eq!(&batch.resolve(batch.items[0].doc_json)[..], br#"{"found":true}"#);
        expect(&mut client, Phase::Flushed).await;

        client
            .tx
            .send(Request::StartCommit(StartCommit {
                runtime_checkpoint: Bytes::from_static(b"cp"),
            }))
            .await
            .unwrap();
        expect(&mut client, Phase::StartedCommit).await;

        // Acknowledge, then end the session between transactions.
        client.tx.send(Request::Acknowledge).await.unwrap();
        expect(&mut client, Phase::Acknowledged).await;
        client.tx.close();

        task.await.unwrap().unwrap();
        assert_eq!(client.rx.recv().await.unwrap(), None);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_frame_is_reported() {
        let (mut client, server) = channel(16);
        let destroyed = Arc::new(AtomicUsize::new(0));
        let transactor = Echo {
            destroyed: destroyed.clone(),
        };
        let task = tokio::spawn(async move {
            let ctx = Context::new();
            serve(&ctx, server.rx, server.tx, BatchLimits::default(), |_| async {
                Ok((Opened::internal(), transactor))
            })
            .await
        });

        client.tx.send(Request::Open(open())).await.unwrap();
        expect(&mut client, Phase::Opened).await;
        client.tx.send(Request::Flush).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(
            err.to_string(),
            "protocol error (expected Acknowledge, got Flush)"
        );
        // The runtime sees the same error as a status.
        let remote = client.rx.recv().await.unwrap_err();
        assert_eq!(remote.to_string(), err.to_string());
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unexpected_frame_is_described() {
        let (mut client, server) = channel(16);
        let task = tokio::spawn(async move {
            let ctx = Context::new();
            serve(&ctx, server.rx, server.tx, BatchLimits::default(), |_| async {
                Ok((Opened::internal(), Echo::default()))
            })
            .await
        });

        client.tx.send(Request::Open(open())).await.unwrap();
        expect(&mut client, Phase::Opened).await;
        client.tx.send(Request::Acknowledge).await.unwrap();
        client.tx.send(load_request("k1")).await.unwrap();
        // StartCommit ends the load phase where Flush is due.
        client
            .tx
            .send(Request::StartCommit(StartCommit {
                runtime_checkpoint: Bytes::from_static(b"cp"),
            }))
            .await
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"protocol error (expected Flush, got StartCommit(StartCommit { runtime_checkpoint: b"cp" }))"#
        );
    }

    #[tokio::test]
    async fn test_invalid_open_is_rejected() {
        let (client, server) = channel(4);
        let mut request = open();
        request.version.clear();

        let ctx = Context::new();
        let err = run_transactions(
            &ctx,
            server.rx,
            server.tx,
            request,
            Opened::internal(),
            Echo::default(),
            BatchLimits::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "open is invalid: validation failed: version: expected non-empty"
        );
        drop(client);
    }

    #[tokio::test]
    async fn test_cancellation_destroys_once() {
        let (client, server) = channel(4);
        let destroyed = Arc::new(AtomicUsize::new(0));
        let transactor = Echo {
            destroyed: destroyed.clone(),
        };

        let ctx = Context::new();
        let session = ctx.clone();
        let task = tokio::spawn(async move {
            run_transactions(
                &session,
                server.rx,
                server.tx,
                open(),
                Opened::internal(),
                transactor,
                BatchLimits::default(),
            )
            .await
        });

        client.tx.send(Request::Acknowledge).await.unwrap();
        ctx.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_cancelled(), "{}", err);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }
}
