//! Pull-style consumption of streaming results.
//!
//! Each streaming request gets its own unbounded ordered queue: the
//! correlator appends fragments as chunk messages arrive and closes the
//! queue at the terminal message. A single reusable slot would lose
//! fragments produced faster than the consumer pulls them; the queue cannot.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

/// A lazy, finite, forward-only sequence of result fragments for a single
/// request. Yields each fragment in send order, then ends, or yields the
/// request's error as its final item. Not restartable.
pub struct FragmentStream {
    chunks: mpsc::UnboundedReceiver<String>,
    reply: oneshot::Receiver<Result<serde_json::Value>>,
    /// Set when the request could not even be sent.
    immediate: Option<Error>,
    done: bool,
}

impl FragmentStream {
    pub(crate) fn new(
        chunks: mpsc::UnboundedReceiver<String>,
        reply: oneshot::Receiver<Result<serde_json::Value>>,
    ) -> Self {
        Self {
            chunks,
            reply,
            immediate: None,
            done: false,
        }
    }

    pub(crate) fn failed(error: Error) -> Self {
        let (_chunk_tx, chunks) = mpsc::unbounded_channel();
        let (_reply_tx, reply) = oneshot::channel();
        Self {
            chunks,
            reply,
            immediate: Some(error),
            done: false,
        }
    }

    /// Drain the sequence, concatenating fragments into the final string.
    pub async fn into_string(mut self) -> Result<String> {
        use futures::StreamExt;
        let mut out = String::new();
        while let Some(fragment) = self.next().await {
            out.push_str(&fragment?);
        }
        Ok(out)
    }
}

impl Stream for FragmentStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if let Some(error) = this.immediate.take() {
            this.done = true;
            return Poll::Ready(Some(Err(error)));
        }

        match this.chunks.poll_recv(cx) {
            Poll::Ready(Some(fragment)) => return Poll::Ready(Some(Ok(fragment))),
            // Queue closed: the terminal settled the call. Fall through to
            // learn whether it succeeded.
            Poll::Ready(None) => {}
            Poll::Pending => return Poll::Pending,
        }

        match Pin::new(&mut this.reply).poll(cx) {
            Poll::Ready(Ok(Ok(_final))) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Ok(Err(error))) => {
                this.done = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(Err(_)) => {
                this.done = true;
                Poll::Ready(Some(Err(Error::TransportClosed)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
