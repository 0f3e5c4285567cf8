//! Error surface for the RPC layer.
//!
//! Every failure reaches exactly one waiting caller (or, for transport-wide
//! failure, all waiting callers). Nothing here retries.

use std::path::PathBuf;
use std::time::Duration;

/// Errors surfaced to callers of the RPC layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The host process could not be reached at transport construction.
    #[error("inference host unavailable at {path}: {source}")]
    HostUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The link dropped while requests were outstanding, or a send was
    /// attempted on a disposed transport.
    #[error("transport closed")]
    TransportClosed,

    /// The relay link was not established within the bound. The owning
    /// context must call `provide_worker_link` for the handshake to complete.
    #[error("relay handshake timed out after {0:?}; owner never granted a link")]
    HandshakeTimeout(Duration),

    /// The terminal message carried an error, propagated verbatim.
    #[error("remote error: {0}")]
    Remote(String),

    /// A typed helper received a result of an unexpected shape.
    #[error("unexpected result shape: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
