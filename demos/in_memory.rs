//! In-memory materialization - a runtime and connector in one process.
//!
//! This example demonstrates:
//! - Implementing `Transactor` for a key/value table
//! - Serving it over in-process channels
//! - Driving pipelined transactions with `TxnClient`
//!
//! # Running
//!
//! ```sh
//! RUST_LOG=materialize_txn=debug cargo run --example in_memory
//! ```

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use materialize_txn::protocol::{pack, Binding, Element, FieldSelection, MaterializationSpec};
use materialize_txn::transport::channel;
use materialize_txn::{
    serve, BatchLimits, CommitFuture, ConnectorState, Context, LoadIterator, Loaded, Opened,
    RangeSpec, Result, StoreIterator, Transactor, TxnClient, TxnError,
};
use tracing_subscriber::EnvFilter;

type Table = Arc<Mutex<HashMap<Bytes, Bytes>>>;

/// Key/value connector. Stored documents are visible once committed.
struct KeyValue {
    table: Table,
    pending: Vec<(Bytes, Bytes)>,
}

#[async_trait]
impl Transactor for KeyValue {
    async fn load(&mut self, it: &mut LoadIterator<'_>, loaded: &mut Loaded<'_>) -> Result<()> {
        let mut keys = Vec::new();
        while let Some(doc) = it.next().await {
            keys.push(doc);
        }
        if let Some(err) = it.err() {
            return Err(TxnError::connector(err.to_string()));
        }

        for doc in keys {
            let found = self.table.lock().ok().and_then(|t| t.get(&doc.key_packed).cloned());
            if let Some(found) = found {
                loaded.send(doc.binding, &found).await?;
            }
        }
        Ok(())
    }

    async fn store(&mut self, it: &mut StoreIterator<'_>) -> Result<()> {
        while let Some(doc) = it.next().await {
            self.pending.push((doc.key_packed, doc.doc_json));
        }
        match it.err() {
            Some(err) => Err(TxnError::connector(err.to_string())),
            None => Ok(()),
        }
    }

    async fn start_commit(
        &mut self,
        _ctx: &Context,
        runtime_checkpoint: Bytes,
    ) -> Result<(Option<ConnectorState>, CommitFuture)> {
        let writes = mem::take(&mut self.pending);
        let table = self.table.clone();
        let state = ConnectorState::merge(format!(
            r#"{{"last_checkpoint":{:?}}}"#,
            String::from_utf8_lossy(&runtime_checkpoint)
        ));

        // Commit in the background while the next transaction loads.
        let commit = CommitFuture::spawn(async move {
            let mut table = table
                .lock()
                .map_err(|_| TxnError::connector("table lock poisoned"))?;
            table.extend(writes);
            Ok(())
        });
        Ok((Some(state), commit))
    }
}

fn spec() -> MaterializationSpec {
    MaterializationSpec {
        name: "demo/counters".to_string(),
        config_json: "{}".to_string(),
        bindings: vec![Binding {
            collection: "demo/events".to_string(),
            resource_path: vec!["counters".to_string()],
            resource_config_json: "{}".to_string(),
            field_selection: FieldSelection {
                keys: vec!["name".to_string()],
                values: vec!["count".to_string()],
                document: "flow_document".to_string(),
            },
            delta_updates: false,
        }],
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let ctx = Context::new();
    let (runtime, connector) = channel(16);

    let table = Table::default();
    let server = tokio::spawn({
        let ctx = ctx.clone();
        let table = table.clone();
        async move {
            serve(&ctx, connector.rx, connector.tx, BatchLimits::default(), |_open| async move {
                let transactor = KeyValue {
                    table,
                    pending: Vec::new(),
                };
                Ok((Opened::internal(), transactor))
            })
            .await
        }
    });

    let mut client = TxnClient::builder(spec(), "v1", RangeSpec::full())
        .open(&ctx, runtime.tx, runtime.rx)
        .await?;

    let names = ["apples", "pears", "plums"];
    for (round, count) in (1..=3i64).enumerate() {
        for name in names {
            client.add_load(0, &pack(&[Element::from(name)]), b"").await?;
        }
        let loaded = client.flush().await?;
        println!("round {}: loaded {} documents", round, loaded.len());

        for name in names {
            let doc = format!(r#"{{"name":"{}","count":{}}}"#, name, count);
            client
                .add_store(
                    0,
                    &pack(&[Element::from(name)]),
                    &pack(&[Element::Int(count)]),
                    doc.as_bytes(),
                    !loaded.is_empty(),
                )
                .await?;
        }

        let checkpoint = Bytes::from(format!("checkpoint-{}", round));
        let (_state, acknowledged) = client.start_commit(checkpoint).await?;
        client.acknowledge().await?;
        acknowledged.await?;
    }

    println!("connector state: {}", client.state());
    client.close().await?;
    server.await??;
    Ok(())
}
