//! Byte-stream session - runtime and connector over a Unix socket.
//!
//! This example demonstrates:
//! - Binding a `SocketListener` and connecting to it
//! - Attaching framed endpoints to each end of the socket
//! - Running one transaction whose connector reports no documents
//!
//! # Running
//!
//! ```sh
//! RUST_LOG=debug cargo run --example byte_stream
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use materialize_txn::protocol::{pack, Binding, Element, FieldSelection, MaterializationSpec};
use materialize_txn::transport::stream::{self, StreamConfig};
use materialize_txn::transport::{connect, socket_path, SocketListener};
use materialize_txn::{
    serve, BatchLimits, Context, LoadIterator, Loaded, Opened, RangeSpec, Result, StoreIterator,
    Transactor, TxnClient, TxnError,
};
use tracing_subscriber::EnvFilter;

/// Logs what it's asked to do, and stores nothing.
struct Logging;

#[async_trait]
impl Transactor for Logging {
    async fn load(&mut self, it: &mut LoadIterator<'_>, _loaded: &mut Loaded<'_>) -> Result<()> {
        while let Some(doc) = it.next().await {
            tracing::info!(binding = doc.binding, "load {:?}", doc.key);
        }
        it.err().map_or(Ok(()), |err| Err(TxnError::connector(err.to_string())))
    }

    async fn store(&mut self, it: &mut StoreIterator<'_>) -> Result<()> {
        while let Some(doc) = it.next().await {
            tracing::info!(
                binding = doc.binding,
                "store {:?} {}",
                doc.key,
                String::from_utf8_lossy(&doc.doc_json)
            );
        }
        it.err().map_or(Ok(()), |err| Err(TxnError::connector(err.to_string())))
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = StreamConfig::default();
    let path = socket_path("materialize-txn-demo");
    let listener = SocketListener::bind(&path).await?;
    println!("listening on {}", listener.path().display());

    let ctx = Context::new();
    let server = tokio::spawn({
        let ctx = ctx.clone();
        let config = config.clone();
        async move {
            let socket = listener.accept().await?;
            let (endpoint, _tasks) = stream::server(socket, &config);
            serve(&ctx, endpoint.rx, endpoint.tx, BatchLimits::default(), |_open| async {
                Ok((Opened::internal(), Logging))
            })
            .await
        }
    });

    let socket = connect(&path).await?;
    let (endpoint, _tasks) = stream::client(socket, &config);
    let mut client = TxnClient::builder(spec(), "v1", RangeSpec::full())
        .open(&ctx, endpoint.tx, endpoint.rx)
        .await?;
    println!("opened, resuming with {:?}", client.opened().resume());

    let key = pack(&[Element::from("greeting")]);
    client.add_load(0, &key, br#"["greeting"]"#).await?;
    let loaded = client.flush().await?;
    println!("loaded {} documents", loaded.len());

    client
        .add_store(0, &key, b"", br#"{"greeting":"hello"}"#, false)
        .await?;
    let (_state, acknowledged) = client.start_commit(Bytes::from_static(b"cp1")).await?;
    client.acknowledge().await?;
    acknowledged.await?;

    client.close().await?;
    server.await??;
    Ok(())
}

fn spec() -> MaterializationSpec {
    MaterializationSpec {
        name: "demo/greetings".to_string(),
        config_json: "{}".to_string(),
        bindings: vec![Binding {
            collection: "demo/greetings".to_string(),
            resource_path: vec!["greetings".to_string()],
            resource_config_json: "{}".to_string(),
            field_selection: FieldSelection {
                keys: vec!["greeting".to_string()],
                values: vec![],
                document: "flow_document".to_string(),
            },
            delta_updates: false,
        }],
    }
}
