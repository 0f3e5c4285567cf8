//! Privileged-side dispatcher.
//!
//! The host owns the models. This module accepts client transports, decodes
//! request envelopes, and routes them by action tag to an [`InferenceHost`]
//! implementation, the seam behind which engines live. Each request runs on
//! its own task, so a slow inference never blocks other ids on the same
//! connection. Engine-level failures travel back verbatim in the terminal
//! error field.

use std::sync::Arc;

use tokio::net::UnixListener;

use crate::actions::{Action, Engine, InferParams, Model, Task};
use crate::error::Result;
use crate::protocol::{RequestId, WireMessage};
use crate::transport::{MessageSender, Transport};

/// Errors produced while serving a single request. The dispatcher flattens
/// them to strings; clients see them as [`Error::Remote`](crate::Error).
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("model {model} does not serve task {task}")]
    UnsupportedTask { model: String, task: Task },

    #[error("engine {engine} cannot run task {task}")]
    EngineMismatch { engine: Engine, task: Task },

    #[error("model not ready: {0}")]
    NotReady(String),

    /// Engine-internal failure, passed through unmodified.
    #[error("{0}")]
    Engine(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Handle for streaming result fragments back to one request's caller.
#[derive(Clone)]
pub struct ChunkSender {
    id: RequestId,
    sender: MessageSender,
}

impl ChunkSender {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Emit one partial result fragment, tagged with the request id.
    pub fn send(&self, fragment: impl Into<String>) -> Result<()> {
        self.sender.send(WireMessage::Chunk {
            id: self.id,
            data: fragment.into(),
        })
    }
}

/// The collaborator seam: whatever actually loads models and generates
/// output. The dispatcher never looks past this trait.
#[async_trait::async_trait]
pub trait InferenceHost: Send + Sync + 'static {
    /// Enumerate the models this host can serve.
    async fn models(&self) -> std::result::Result<Vec<Model>, HostError>;

    /// Run one inference task. Fragments sent through `chunks` stream to the
    /// caller; the returned string is the final result.
    async fn infer(
        &self,
        params: InferParams,
        chunks: &ChunkSender,
    ) -> std::result::Result<String, HostError>;
}

/// Serve one client connection until it closes.
pub async fn serve_connection(transport: Transport, host: Arc<dyn InferenceHost>) {
    let Transport {
        sender,
        mut inbound,
        cancel,
    } = transport;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = inbound.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    WireMessage::Request { id, action } => {
                        tracing::debug!(%id, action = action.name(), "Dispatching request");
                        tokio::spawn(dispatch(id, action, sender.clone(), Arc::clone(&host)));
                    }
                    other => {
                        tracing::trace!(id = %other.id(), "Ignoring non-request message from client");
                    }
                }
            }
        }
    }
    tracing::debug!("Client connection closed");
}

async fn dispatch(
    id: RequestId,
    action: Action,
    sender: MessageSender,
    host: Arc<dyn InferenceHost>,
) {
    let outcome = match action {
        Action::GetModels => host.models().await.and_then(|models| {
            serde_json::to_value(models).map_err(|e| HostError::Internal(e.to_string()))
        }),
        Action::Infer(params) => {
            let chunks = ChunkSender {
                id,
                sender: sender.clone(),
            };
            host.infer(params, &chunks)
                .await
                .map(serde_json::Value::String)
        }
    };

    let terminal = match outcome {
        Ok(result) => WireMessage::Done { id, result },
        Err(e) => WireMessage::Failed {
            id,
            error: e.to_string(),
        },
    };
    if sender.send(terminal).is_err() {
        tracing::debug!(%id, "Connection closed before terminal message");
    }
}

/// Accept client connections forever, serving each on its own task.
pub async fn serve_unix(listener: UnixListener, host: Arc<dyn InferenceHost>) -> std::io::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        tracing::debug!("Accepted client connection");
        tokio::spawn(serve_connection(
            Transport::from_unix_stream(stream),
            Arc::clone(&host),
        ));
    }
}
