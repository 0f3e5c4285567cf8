//! inferlink: cross-context RPC layer for local AI inference hosts.
//!
//! A consumer task talks to a privileged host process (the context that owns
//! the models) over a message channel with no built-in request/response
//! semantics. This crate supplies those semantics:
//!
//! - **protocol**: id-tagged wire envelope (request, chunk, terminal)
//! - **codec**: JSON framing for socket transports
//! - **transport**: channel pairs and Unix-socket links with lifecycle
//! - **client**: request/response correlation and streaming delivery
//! - **stream**: pull-style fragment sequences over the chunk callbacks
//! - **relay**: bridging for contexts that cannot own the host link
//! - **host**: the privileged-side dispatcher and its collaborator seam

pub mod actions;
mod client;
pub mod codec;
mod error;
pub mod host;
pub mod protocol;
mod relay;
mod stream;
pub mod transport;

pub use client::Client;

pub use actions::{
    Action, ChatMessage, ChatParams, CompletionParams, Engine, InferParams, Model, Role, Task,
    TaskRequest, TranslationParams,
};
pub use error::{Error, Result};
pub use host::{ChunkSender, HostError, InferenceHost, serve_connection, serve_unix};
pub use protocol::{RequestId, WireMessage};
pub use relay::{
    ControlMessage, HANDSHAKE_TIMEOUT, WorkerContext, WorkerHandle, connect_via_owner,
    connect_via_owner_timeout, worker_client, worker_pair,
};
pub use stream::FragmentStream;
pub use transport::{MessageSender, Transport, default_socket_path, host_available};
