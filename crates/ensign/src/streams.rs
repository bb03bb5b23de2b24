//! Typed halves of a gRPC stream as seen by the handlers.
//!
//! [`Inbound`] wraps the client messages and [`Outbound`] the sending half of the
//! channel that backs the response stream. When the monitoring interceptor is in the
//! chain, both count messages; errors from the underlying stream are passed through
//! unchanged.

use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

use crate::context::{Context, MethodInfo};

/// Capacity of the response channel of every streaming RPC.
pub const OUTBOUND_BUFFER: usize = 128;

pub type ResponseStream<T> = ReceiverStream<Result<T, Status>>;

pub struct Inbound<T> {
    stream: BoxStream<'static, Result<T, Status>>,
    labels: Option<&'static MethodInfo>,
}

impl<T> Inbound<T> {
    pub fn new<S>(stream: S, ctx: &Context) -> Self
    where
        S: Stream<Item = Result<T, Status>> + Send + 'static,
    {
        Self {
            stream: stream.boxed(),
            labels: ctx.is_monitored().then_some(ctx.method),
        }
    }

    /// The next message from the client, `None` once the client closed its side.
    pub async fn recv(&mut self) -> Option<Result<T, Status>> {
        let msg = self.stream.next().await;
        if let (Some(Ok(_)), Some(method)) = (&msg, self.labels) {
            metrics::counter!(
                "ensign_stream_msgs_received_total",
                "service" => method.service,
                "method" => method.method
            )
            .increment(1);
        }
        msg
    }
}

pub struct Outbound<T> {
    tx: mpsc::Sender<Result<T, Status>>,
    labels: Option<&'static MethodInfo>,
}

impl<T> Clone for Outbound<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            labels: self.labels,
        }
    }
}

impl<T> Outbound<T> {
    pub fn new(tx: mpsc::Sender<Result<T, Status>>, ctx: &Context) -> Self {
        Self {
            tx,
            labels: ctx.is_monitored().then_some(ctx.method),
        }
    }

    /// Create the outbound half together with the response stream for tonic.
    pub fn channel(ctx: &Context) -> (Self, ResponseStream<T>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        (Self::new(tx, ctx), ReceiverStream::new(rx))
    }

    pub async fn send(&self, msg: T) -> Result<(), Status> {
        self.tx
            .send(Ok(msg))
            .await
            .map_err(|_| Status::cancelled("stream closed by client"))?;

        if let Some(method) = self.labels {
            metrics::counter!(
                "ensign_stream_msgs_sent_total",
                "service" => method.service,
                "method" => method.method
            )
            .increment(1);
        }
        Ok(())
    }

    /// Terminate the response stream with an error status.
    pub async fn fail(&self, status: Status) {
        // The client is already gone if this fails.
        let _ = self.tx.send(Err(status)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
