//! Per-connection outbound queues
//!
//! Every connection drains its own bounded queue from a dedicated writer
//! task. Frames reach one peer in the order they were queued, and a slow
//! peer only ever delays itself.

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use swarmcast_core::{ConnectionId, SwarmcastError, SwarmcastResult};

/// One frame waiting for its writer
pub struct Outbound {
    pub frame: Bytes,
    /// Told the outcome of the write, when someone is waiting for it
    pub ack: Option<oneshot::Sender<SwarmcastResult<()>>>,
}

/// Why a frame could not be queued
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueError {
    /// The peer is not keeping up
    Full,
    /// The writer has stopped
    Closed,
}

impl QueueError {
    pub fn into_error(self, connection: ConnectionId) -> SwarmcastError {
        match self {
            QueueError::Full => SwarmcastError::TransportWriteFailure {
                connection,
                reason: "outbound queue full".into(),
            },
            QueueError::Closed => {
                SwarmcastError::TransportClosed(format!("writer for connection {} stopped", connection))
            }
        }
    }
}

/// Sending half of a connection's queue
#[derive(Clone)]
pub struct OutboundQueue {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
}

impl OutboundQueue {
    pub fn channel(id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame without waiting for the write
    pub fn push(&self, frame: Bytes) -> Result<(), QueueError> {
        self.enqueue(Outbound { frame, ack: None })
    }

    /// Queue a frame and get a handle on the outcome of its write
    pub fn push_acked(&self, frame: Bytes) -> Result<Delivery, QueueError> {
        let (ack, rx) = oneshot::channel();
        self.enqueue(Outbound {
            frame,
            ack: Some(ack),
        })?;
        Ok(Delivery { id: self.id, rx })
    }

    fn enqueue(&self, outbound: Outbound) -> Result<(), QueueError> {
        self.tx.try_send(outbound).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Closed(_) => QueueError::Closed,
        })
    }
}

/// Pending outcome of one queued write
pub struct Delivery {
    id: ConnectionId,
    rx: oneshot::Receiver<SwarmcastResult<()>>,
}

impl Delivery {
    /// Resolves once the writer has tried the frame. A writer that stops
    /// first reports the frame as not written.
    pub async fn wait(self) -> (ConnectionId, SwarmcastResult<()>) {
        let result = self.rx.await.unwrap_or_else(|_| {
            Err(SwarmcastError::TransportClosed(format!(
                "connection {} closed before the write",
                self.id
            )))
        });
        (self.id, result)
    }
}
