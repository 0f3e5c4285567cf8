//! Relay bridge for contexts that cannot own the host link.
//!
//! A worker context has no path to the host socket; its owner does. The
//! worker asks its owner for a link, the owner creates a local channel pair,
//! keeps one end, and hands the other to the worker. From then on the owner
//! forwards every inbound host message verbatim onto its retained end, and
//! injects everything the worker sends directly into the host transport's
//! send path. The worker's own correlator behaves as if it held the host
//! link itself.
//!
//! Only one worker can be bridged through an owner at a time; a second
//! bridge supersedes the first and detaches its forwarder.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::client::Client;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// How long a worker waits for its owner to grant a link.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Messages crossing the owner/worker boundary.
#[derive(Debug)]
pub enum ControlMessage {
    /// Worker asks for a link to the host transport.
    LinkRequest,
    /// Owner transfers one end of a freshly created local channel pair.
    LinkGrant(Transport),
}

/// Owner-side endpoint of the worker control channel.
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<ControlMessage>,
    rx: mpsc::UnboundedReceiver<ControlMessage>,
}

/// Worker-side endpoint of the worker control channel.
pub struct WorkerContext {
    tx: mpsc::UnboundedSender<ControlMessage>,
    rx: mpsc::UnboundedReceiver<ControlMessage>,
}

/// Create the control channel between an owner and a worker it spawns.
pub fn worker_pair() -> (WorkerHandle, WorkerContext) {
    let (to_worker, from_owner) = mpsc::unbounded_channel();
    let (to_owner, from_worker) = mpsc::unbounded_channel();
    (
        WorkerHandle {
            tx: to_worker,
            rx: from_worker,
        },
        WorkerContext {
            tx: to_owner,
            rx: from_owner,
        },
    )
}

impl Client {
    /// Serve link requests from a worker, bridging it onto this client's
    /// transport. Each grant supersedes any previously bridged worker.
    pub fn provide_worker_link(&self, mut handle: WorkerHandle) {
        let client = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = handle.rx.recv().await {
                match msg {
                    ControlMessage::LinkRequest => {
                        tracing::debug!("Worker requested a host link");
                        let (retained, granted) = Transport::pair();
                        install_forwarder(&client, retained);
                        if handle.tx.send(ControlMessage::LinkGrant(granted)).is_err() {
                            tracing::warn!("Worker went away before the link grant");
                            break;
                        }
                    }
                    ControlMessage::LinkGrant(_) => {
                        tracing::trace!("Ignoring unexpected link grant from worker");
                    }
                }
            }
            tracing::debug!("Worker link service stopped");
        });
    }
}

/// Wire the retained end into the owning client: inbound host traffic is
/// copied onto it, and everything the worker sends through it goes out on
/// the host transport verbatim, ids untouched.
fn install_forwarder(client: &Client, retained: Transport) {
    let Transport {
        sender,
        mut inbound,
        cancel: _,
    } = retained;

    let superseded = client.replace_relay_token();
    client.set_passthrough(sender);

    let client = client.clone();
    tokio::spawn(async move {
        let closed = client.closed();
        loop {
            tokio::select! {
                _ = superseded.cancelled() => break,
                _ = closed.cancelled() => break,
                msg = inbound.recv() => {
                    let Some(msg) = msg else { break };
                    if client.passthrough_send(msg).is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Relay forwarder stopped");
    });
}

/// Worker side of the handshake: request a link and wait for the grant,
/// bounded by [`HANDSHAKE_TIMEOUT`].
pub async fn connect_via_owner(ctx: &mut WorkerContext) -> Result<Transport> {
    connect_via_owner_timeout(ctx, HANDSHAKE_TIMEOUT).await
}

/// As [`connect_via_owner`], with an explicit bound. On timeout the wait is
/// abandoned entirely; the caller must start over with a fresh request.
pub async fn connect_via_owner_timeout(
    ctx: &mut WorkerContext,
    wait: Duration,
) -> Result<Transport> {
    ctx.tx
        .send(ControlMessage::LinkRequest)
        .map_err(|_| Error::TransportClosed)?;

    let grant = async {
        loop {
            match ctx.rx.recv().await {
                Some(ControlMessage::LinkGrant(transport)) => return Some(transport),
                Some(ControlMessage::LinkRequest) => continue,
                None => return None,
            }
        }
    };

    match tokio::time::timeout(wait, grant).await {
        Ok(Some(transport)) => {
            tracing::debug!("Worker link established");
            Ok(transport)
        }
        Ok(None) => Err(Error::TransportClosed),
        Err(_) => Err(Error::HandshakeTimeout(wait)),
    }
}

/// Build a correlating client for a worker context in one step.
pub async fn worker_client(ctx: &mut WorkerContext) -> Result<Client> {
    Ok(Client::new(connect_via_owner(ctx).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Action;
    use crate::protocol::{RequestId, WireMessage};
    use serde_json::json;

    async fn expect_request(far: &mut Transport) -> (RequestId, Action) {
        match far.inbound.recv().await.expect("transport open") {
            WireMessage::Request { id, action } => (id, action),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handshake_times_out_without_an_owner() {
        let (_handle, mut ctx) = worker_pair();

        let err = connect_via_owner_timeout(&mut ctx, Duration::from_millis(50))
            .await
            .unwrap_err();
        match err {
            Error::HandshakeTimeout(wait) => assert_eq!(wait, Duration::from_millis(50)),
            other => panic!("expected handshake timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handshake_fails_fast_when_owner_is_gone() {
        let (handle, mut ctx) = worker_pair();
        drop(handle);

        match connect_via_owner_timeout(&mut ctx, Duration::from_secs(5)).await {
            Err(Error::TransportClosed) => {}
            other => panic!("expected transport-closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn worker_requests_flow_to_the_host_in_order() {
        let (real_near, mut real_far) = Transport::pair();
        let owner = Client::new(real_near);

        let (handle, mut ctx) = worker_pair();
        owner.provide_worker_link(handle);

        let worker = worker_client(&mut ctx).await.unwrap();

        let first = tokio::spawn({
            let worker = worker.clone();
            async move { worker.get_models().await }
        });
        // The host sees the worker's envelope verbatim: same kind, worker id.
        let (first_id, first_action) = expect_request(&mut real_far).await;
        assert!(matches!(first_action, Action::GetModels));

        let second = tokio::spawn({
            let worker = worker.clone();
            async move { worker.get_models().await }
        });
        let (second_id, _) = expect_request(&mut real_far).await;
        assert_ne!(first_id, second_id);

        // Replies route back through the relay to the worker's correlator.
        real_far
            .sender
            .send(WireMessage::Done {
                id: first_id,
                result: json!([]),
            })
            .unwrap();
        real_far
            .sender
            .send(WireMessage::Done {
                id: second_id,
                result: json!([]),
            })
            .unwrap();

        assert!(first.await.unwrap().unwrap().is_empty());
        assert!(second.await.unwrap().unwrap().is_empty());
        owner.disconnect();
    }

    #[tokio::test]
    async fn inbound_chunks_reach_the_worker_in_order() {
        let (real_near, mut real_far) = Transport::pair();
        let owner = Client::new(real_near);

        let (handle, mut ctx) = worker_pair();
        owner.provide_worker_link(handle);
        let worker = worker_client(&mut ctx).await.unwrap();

        let stream = worker.request_streaming(Action::GetModels);
        let (id, _) = expect_request(&mut real_far).await;
        for data in ["a", "b", "c"] {
            real_far
                .sender
                .send(WireMessage::Chunk {
                    id,
                    data: data.to_string(),
                })
                .unwrap();
        }
        real_far
            .sender
            .send(WireMessage::Done {
                id,
                result: json!("abc"),
            })
            .unwrap();

        assert_eq!(stream.into_string().await.unwrap(), "abc");
        owner.disconnect();
    }

    #[tokio::test]
    async fn owner_requests_still_work_while_bridged() {
        let (real_near, mut real_far) = Transport::pair();
        let owner = Client::new(real_near);

        let (handle, mut ctx) = worker_pair();
        owner.provide_worker_link(handle);
        let worker = worker_client(&mut ctx).await.unwrap();

        let owner_call = tokio::spawn({
            let owner = owner.clone();
            async move { owner.request(Action::GetModels).await }
        });
        let (owner_id, _) = expect_request(&mut real_far).await;

        let worker_call = tokio::spawn({
            let worker = worker.clone();
            async move { worker.request(Action::GetModels).await }
        });
        let (worker_id, _) = expect_request(&mut real_far).await;

        // Each terminal lands in exactly one correlator; the copy the other
        // side sees is ignored as a stray id.
        real_far
            .sender
            .send(WireMessage::Done {
                id: worker_id,
                result: json!("worker"),
            })
            .unwrap();
        real_far
            .sender
            .send(WireMessage::Done {
                id: owner_id,
                result: json!("owner"),
            })
            .unwrap();

        assert_eq!(worker_call.await.unwrap().unwrap(), json!("worker"));
        assert_eq!(owner_call.await.unwrap().unwrap(), json!("owner"));
        owner.disconnect();
    }

    #[tokio::test]
    async fn second_bridge_supersedes_the_first() {
        let (real_near, mut real_far) = Transport::pair();
        let owner = Client::new(real_near);

        let (first_handle, mut first_ctx) = worker_pair();
        owner.provide_worker_link(first_handle);
        let first_worker = worker_client(&mut first_ctx).await.unwrap();

        let (second_handle, mut second_ctx) = worker_pair();
        owner.provide_worker_link(second_handle);
        let second_worker = worker_client(&mut second_ctx).await.unwrap();

        // The second worker owns the bridge now.
        let call = tokio::spawn({
            let second_worker = second_worker.clone();
            async move { second_worker.request(Action::GetModels).await }
        });
        let (id, _) = expect_request(&mut real_far).await;
        real_far
            .sender
            .send(WireMessage::Done {
                id,
                result: json!("second"),
            })
            .unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!("second"));

        // The first worker's link is dead: its forwarder was detached and
        // its inbound copy stream closed when the passthrough was replaced.
        tokio::time::sleep(Duration::from_millis(50)).await;
        match first_worker.request(Action::GetModels).await {
            Err(Error::TransportClosed) => {}
            other => panic!("expected transport-closed, got {other:?}"),
        }
        owner.disconnect();
    }
}
