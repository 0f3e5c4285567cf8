//! Request/response correlation over a transport.
//!
//! The client owns the transport's inbound queue through a single event loop
//! task. Sends insert a pending entry and enqueue the envelope; the loop
//! routes chunks to the caller's queue and settles the caller's oneshot on
//! the terminal message. When the transport closes, every remaining pending
//! call is rejected with `TransportClosed` and the table is cleared.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::actions::{
    Action, ChatParams, CompletionParams, InferParams, Model, TaskRequest, TranslationParams,
};
use crate::error::{Error, Result};
use crate::protocol::{RequestId, WireMessage};
use crate::stream::FragmentStream;
use crate::transport::{MessageSender, Transport};

/// Entry held from send until terminal message or transport failure.
///
/// Owned exclusively by the correlator; removed exactly once.
struct PendingCall {
    reply: oneshot::Sender<Result<serde_json::Value>>,
    chunks: Option<mpsc::UnboundedSender<String>>,
}

pub(crate) struct ClientInner {
    sender: MessageSender,
    pending: DashMap<RequestId, PendingCall>,
    /// Secondary sink receiving a verbatim copy of every inbound message.
    /// Installed by the relay bridge; at most one at a time.
    passthrough: StdMutex<Option<MessageSender>>,
    /// Cancels the forwarder of the currently bridged worker, if any.
    relay_cancel: StdMutex<Option<CancellationToken>>,
    cancel: CancellationToken,
}

/// RPC client for an inference host. Cheap to clone; all clones share one
/// transport and one pending table.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Take ownership of a transport and start the event loop.
    pub fn new(transport: Transport) -> Self {
        let Transport {
            sender,
            inbound,
            cancel,
        } = transport;
        let inner = Arc::new(ClientInner {
            sender,
            pending: DashMap::new(),
            passthrough: StdMutex::new(None),
            relay_cancel: StdMutex::new(None),
            cancel: cancel.clone(),
        });
        // The loop holds only a weak reference so dropping the last client
        // clone tears the transport down.
        tokio::spawn(event_loop(inbound, Arc::downgrade(&inner), cancel));
        Self { inner }
    }

    /// Connect to the host socket and wrap it in a client.
    pub async fn connect_unix(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Transport::connect_unix(path).await?))
    }

    /// Send a request and await its terminal message. Chunks, if any, are
    /// dropped: the caller opted out of streaming.
    pub async fn request(&self, action: Action) -> Result<serde_json::Value> {
        let reply = self.start(action, None)?;
        match reply.await {
            Ok(result) => result,
            Err(_) => Err(Error::TransportClosed),
        }
    }

    /// Send a request, delivering each chunk to `chunk_tx` strictly before
    /// the returned future settles.
    pub async fn request_with_chunks(
        &self,
        action: Action,
        chunk_tx: mpsc::UnboundedSender<String>,
    ) -> Result<serde_json::Value> {
        let reply = self.start(action, Some(chunk_tx))?;
        match reply.await {
            Ok(result) => result,
            Err(_) => Err(Error::TransportClosed),
        }
    }

    /// Send a request and consume its output as a pull-style fragment
    /// sequence. Each call yields a fresh, non-restartable sequence.
    pub fn request_streaming(&self, action: Action) -> FragmentStream {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        match self.start(action, Some(chunk_tx)) {
            Ok(reply) => FragmentStream::new(chunk_rx, reply),
            Err(e) => FragmentStream::failed(e),
        }
    }

    /// Enumerate the models the host can serve.
    pub async fn get_models(&self) -> Result<Vec<Model>> {
        let value = self.request(Action::GetModels).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Run inference to completion, returning the final string.
    pub async fn infer(&self, params: InferParams) -> Result<String> {
        let value = self.request(Action::Infer(params)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Run inference in streaming mode. The fragments concatenate to the
    /// final string.
    pub fn infer_stream(&self, params: InferParams) -> FragmentStream {
        self.request_streaming(Action::Infer(params))
    }

    pub async fn chat(&self, model_id: impl Into<String>, params: ChatParams) -> Result<String> {
        self.infer(InferParams {
            model_id: model_id.into(),
            task: TaskRequest::Chat(params),
        })
        .await
    }

    pub fn chat_stream(&self, model_id: impl Into<String>, params: ChatParams) -> FragmentStream {
        self.infer_stream(InferParams {
            model_id: model_id.into(),
            task: TaskRequest::Chat(params),
        })
    }

    pub async fn complete(
        &self,
        model_id: impl Into<String>,
        params: CompletionParams,
    ) -> Result<String> {
        self.infer(InferParams {
            model_id: model_id.into(),
            task: TaskRequest::Completion(params),
        })
        .await
    }

    pub fn complete_stream(
        &self,
        model_id: impl Into<String>,
        params: CompletionParams,
    ) -> FragmentStream {
        self.infer_stream(InferParams {
            model_id: model_id.into(),
            task: TaskRequest::Completion(params),
        })
    }

    pub async fn translate(
        &self,
        model_id: impl Into<String>,
        params: TranslationParams,
    ) -> Result<String> {
        self.infer(InferParams {
            model_id: model_id.into(),
            task: TaskRequest::Translation(params),
        })
        .await
    }

    pub fn translate_stream(
        &self,
        model_id: impl Into<String>,
        params: TranslationParams,
    ) -> FragmentStream {
        self.infer_stream(InferParams {
            model_id: model_id.into(),
            task: TaskRequest::Translation(params),
        })
    }

    /// Number of requests awaiting a terminal message.
    pub fn in_flight(&self) -> usize {
        self.inner.pending.len()
    }

    /// Dispose the transport. Idempotent; all in-flight requests reject with
    /// [`Error::TransportClosed`]. Required for a clean teardown when a
    /// worker relay is active, since the relay tasks keep the client alive.
    pub fn disconnect(&self) {
        self.inner.cancel.cancel();
    }

    /// Install the relay's inbound copy sink, superseding any previous one.
    pub fn set_passthrough(&self, sink: MessageSender) {
        *lock_recovering(&self.inner.passthrough) = Some(sink);
    }

    pub fn clear_passthrough(&self) {
        *lock_recovering(&self.inner.passthrough) = None;
    }

    /// Inject an already-correlated message directly into the send path,
    /// bypassing id generation. The relay uses this for worker traffic whose
    /// ids were assigned by the worker-side correlator.
    pub fn passthrough_send(&self, msg: WireMessage) -> Result<()> {
        self.inner.sender.send(msg)
    }

    /// Swap in a fresh relay forwarder token, cancelling the previous
    /// forwarder. Only one worker may be bridged at a time.
    pub(crate) fn replace_relay_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let old = lock_recovering(&self.inner.relay_cancel).replace(token.clone());
        if let Some(old) = old {
            tracing::debug!("Superseding existing worker relay");
            old.cancel();
        }
        token
    }

    pub(crate) fn closed(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    fn start(
        &self,
        action: Action,
        chunks: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<oneshot::Receiver<Result<serde_json::Value>>> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::TransportClosed);
        }
        let id = RequestId::new();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.insert(
            id,
            PendingCall {
                reply: reply_tx,
                chunks,
            },
        );
        tracing::debug!(%id, action = action.name(), "Sending request");
        if let Err(e) = self.inner.sender.send(WireMessage::Request { id, action }) {
            self.inner.pending.remove(&id);
            return Err(e);
        }
        Ok(reply_rx)
    }
}

fn lock_recovering<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ClientInner {
    fn route(&self, msg: WireMessage) {
        // The relay, if installed, sees every inbound message verbatim.
        // Worker-owned ids then fall through the table lookup below as
        // unknown ids, which is exactly the stray-message path.
        if let Some(sink) = lock_recovering(&self.passthrough).as_ref() {
            let _ = sink.send(msg.clone());
        }

        match msg {
            WireMessage::Chunk { id, data } => match self.pending.get(&id) {
                Some(call) => {
                    if let Some(chunk_tx) = &call.chunks {
                        let _ = chunk_tx.send(data);
                    } else {
                        tracing::trace!(%id, "Dropping chunk for non-streaming call");
                    }
                }
                None => tracing::trace!(%id, "Ignoring chunk for unknown request"),
            },
            WireMessage::Done { id, result } => self.settle(id, Ok(result)),
            WireMessage::Failed { id, error } => self.settle(id, Err(Error::Remote(error))),
            WireMessage::Request { id, .. } => {
                tracing::trace!(%id, "Ignoring inbound request on client transport");
            }
        }
    }

    fn settle(&self, id: RequestId, result: Result<serde_json::Value>) {
        match self.pending.remove(&id) {
            Some((_, call)) => {
                tracing::debug!(%id, ok = result.is_ok(), "Request settled");
                // Dropping the call also drops its chunk sender, which is
                // what ends the fragment queue for streaming consumers.
                let _ = call.reply.send(result);
            }
            None => tracing::trace!(%id, "Ignoring terminal for unknown request"),
        }
    }

    fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(token) = lock_recovering(&self.relay_cancel).take() {
            token.cancel();
        }
        *lock_recovering(&self.passthrough) = None;

        let ids: Vec<RequestId> = self.pending.iter().map(|entry| *entry.key()).collect();
        if !ids.is_empty() {
            tracing::warn!(pending = ids.len(), "Transport closed with requests in flight");
        }
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                let _ = call.reply.send(Err(Error::TransportClosed));
            }
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn event_loop(
    mut inbound: mpsc::UnboundedReceiver<WireMessage>,
    inner: Weak<ClientInner>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = inbound.recv() => {
                let Some(msg) = msg else { break };
                let Some(inner) = inner.upgrade() else { break };
                inner.route(msg);
            }
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.shutdown();
    }
    tracing::debug!("Client event loop stopped");
}
