//! # materialize-txn
//!
//! Transaction protocol between a materialization runtime and the connector
//! which writes into an external store.
//!
//! A session is a long-lived bidirectional stream. The runtime drives the
//! connector through repeated transactions, each made of phases:
//! Load, Flush, Store, StartCommit and Acknowledge. Transactions are
//! pipelined: keys of transaction N+1 are loaded while the commit of N is
//! still in flight, without the connector ever reporting documents it read
//! before N was durable.
//!
//! ## Architecture
//!
//! - **Connector side**: implement [`Transactor`] and run it with [`serve`]
//!   or [`run_transactions`].
//! - **Runtime side**: [`TxnClient`].
//! - **Transport**: in-process channels ([`transport::channel`]) or any byte
//!   stream ([`transport::stream`]), framed with a fixed 10-byte header and
//!   MessagePack payloads.
//!
//! ## Example
//!
//! ```ignore
//! use materialize_txn::{serve, BatchLimits, Context, Opened};
//! use materialize_txn::transport::stream::{server, StreamConfig};
//! use materialize_txn::transport::SocketListener;
//!
//! #[tokio::main]
//! async fn main() -> materialize_txn::Result<()> {
//!     let listener = SocketListener::bind(path).await?;
//!     let stream = listener.accept().await?;
//!     let (endpoint, _tasks) = server(stream, &StreamConfig::default());
//!
//!     let ctx = Context::new();
//!     serve(&ctx, endpoint.rx, endpoint.tx, BatchLimits::default(), |open| async move {
//!         Ok((Opened::internal(), MyTransactor::connect(&open).await?))
//!     })
//!     .await
//! }
//! ```

pub mod client;
pub mod codec;
pub mod context;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transactor;
pub mod transport;

pub use client::{Acknowledgement, LoadedDoc, TxnClient, TxnClientBuilder};
pub use context::Context;
pub use error::{Result, TxnError};
pub use protocol::{BatchLimits, ConnectorState, Open, Opened, RangeSpec};
pub use server::{run_transactions, serve};
pub use transactor::{
    CommitFuture, CommitResolver, LoadDoc, LoadIterator, Loaded, StoreDoc, StoreIterator,
    Transactor,
};
