//! Transactor module - the connector's side of each transaction.
//!
//! A connector implements [`Transactor`] and hands it to
//! [`run_transactions`](crate::server::run_transactions), which calls it once
//! per phase of every transaction:
//!
//! - [`load`](Transactor::load) consumes requested keys and reports found
//!   documents. It runs while the prior transaction's commit may still be
//!   in flight.
//! - [`store`](Transactor::store) consumes documents to store.
//! - [`start_commit`](Transactor::start_commit) begins committing, returning
//!   connector state to persist with the runtime checkpoint and a
//!   [`CommitFuture`] resolving once the commit completes.
//!
//! # Read-committed loads
//!
//! Loads of transaction N+1 begin before N is acknowledged. A connector whose
//! store is authoritative must not read it until N has committed: either call
//! [`LoadIterator::wait_for_acknowledged`] before querying, or stage keys
//! during iteration and query once [`LoadIterator::next`] returns `None`,
//! which happens only after acknowledgement.
//!
//! # Example
//!
//! ```ignore
//! struct Widgets { table: HashMap<Bytes, Bytes> }
//!
//! #[async_trait]
//! impl Transactor for Widgets {
//!     async fn load(&mut self, it: &mut LoadIterator<'_>, loaded: &mut Loaded<'_>) -> Result<()> {
//!         let mut keys = Vec::new();
//!         while let Some(doc) = it.next().await {
//!             keys.push(doc);
//!         }
//!         if let Some(err) = it.err() {
//!             return Err(TxnError::connector(err.to_string()));
//!         }
//!         for doc in keys {
//!             if let Some(found) = self.table.get(&doc.key_packed) {
//!                 loaded.send(doc.binding, found).await?;
//!             }
//!         }
//!         Ok(())
//!     }
//!
//!     async fn store(&mut self, it: &mut StoreIterator<'_>) -> Result<()> {
//!         while let Some(doc) = it.next().await {
//!             self.table.insert(doc.key_packed, doc.doc_json);
//!         }
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;
use bytes::Bytes;

use crate::context::Context;
use crate::error::Result;
use crate::protocol::ConnectorState;

mod commit;
mod iter;

pub use commit::{CommitFuture, CommitResolver};
pub use iter::{LoadDoc, LoadIterator, Loaded, StoreDoc, StoreIterator};

pub(crate) use iter::{AckGate, PhaseEnd};

/// Store-specific behavior of a materialization connector.
#[async_trait]
pub trait Transactor: Send {
    /// Consume requested keys from `it`, reporting every found document
    /// through `loaded` before returning.
    ///
    /// Keys which aren't found are ignored.
    async fn load(&mut self, it: &mut LoadIterator<'_>, loaded: &mut Loaded<'_>) -> Result<()>;

    /// Consume documents to store from `it`.
    async fn store(&mut self, it: &mut StoreIterator<'_>) -> Result<()>;

    /// Begin to commit the stored transaction.
    ///
    /// Returns connector state to commit atomically with `runtime_checkpoint`,
    /// and a future resolving when the commit completes. A commit which fails
    /// to start should return an already-failed future. The default is a
    /// no-op commit.
    async fn start_commit(
        &mut self,
        ctx: &Context,
        runtime_checkpoint: Bytes,
    ) -> Result<(Option<ConnectorState>, CommitFuture)> {
        let _ = (ctx, runtime_checkpoint);
        Ok((None, CommitFuture::ok()))
    }

    /// Called when the runtime acknowledges that its own commit of the last
    /// transaction is durable.
    ///
    /// This may be called more than once for one commit, as when a session
    /// re-acknowledges after a restart; it must be idempotent.
    async fn runtime_committed(&mut self, ctx: &Context) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Release held resources. Called exactly once, when the session ends.
    fn destroy(&mut self) {}
}
