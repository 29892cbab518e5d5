//! Unix domain socket transport.
//!
//! A connector listens on a socket path and serves one session per accepted
//! connection; the runtime connects to that path. Either side attaches the
//! resulting stream with [`stream::client`](super::stream::client) or
//! [`stream::server`](super::stream::server).
//!
//! # Example
//!
//! ```ignore
//! use materialize_txn::transport::{stream, SocketListener};
//!
//! let listener = SocketListener::bind(&path).await?;
//! let socket = listener.accept().await?;
//! let (server, _tasks) = stream::server(socket, &Default::default());
//! ```

use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};

use crate::error::Result;

/// Generate a socket path unique to this process in the temp directory.
pub fn socket_path(prefix: &str) -> PathBuf {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = std::process::id();
    let mixed = nanos.wrapping_mul(0x517cc1b727220a95) ^ pid as u64;

    std::env::temp_dir().join(format!("{}-{}-{:x}.sock", prefix, pid, mixed))
}

/// Listener for session connections. Removes its socket file on drop.
#[derive(Debug)]
pub struct SocketListener {
    listener: UnixListener,
    path: PathBuf,
}

impl SocketListener {
    /// Bind to a socket path, replacing a stale socket file.
    pub async fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        tracing::debug!("listening on {}", path.display());

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }

    /// The bound socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Connect to a listening connector.
pub async fn connect(path: impl AsRef<Path>) -> Result<UnixStream> {
    Ok(UnixStream::connect(path).await?)
}
