//! Per-connection delivery queue.
//!
//! Every frame accepted by a [`DeliverySender`] gets the next sequence
//! number of that channel, starting at 1. A push never waits: a full queue
//! or a dropped receiver is reported to the caller, which decides whether
//! to evict the connection.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use chatroom_types::events::GatewayEvent;

/// Default queue depth per connection.
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    /// Shared by every connection a fan-out reaches.
    pub event: Arc<GatewayEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery channel is full")]
    Full,
    #[error("delivery channel is closed")]
    Closed,
}

pub struct DeliverySender {
    tx: mpsc::Sender<Frame>,
    /// Sequence number for the next accepted frame. Held across `try_send`
    /// so concurrent pushers cannot enqueue out of sequence order.
    next_seq: Mutex<u64>,
}

pub struct DeliveryReceiver {
    rx: mpsc::Receiver<Frame>,
}

pub fn delivery_channel(capacity: usize) -> (DeliverySender, DeliveryReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        DeliverySender {
            tx,
            next_seq: Mutex::new(1),
        },
        DeliveryReceiver { rx },
    )
}

impl DeliverySender {
    /// Enqueue without waiting. Returns the sequence number assigned.
    pub fn push(&self, event: Arc<GatewayEvent>) -> Result<u64, DeliveryError> {
        let mut next_seq = self.next_seq.lock().unwrap_or_else(|e| e.into_inner());
        let seq = *next_seq;

        match self.tx.try_send(Frame { seq, event }) {
            Ok(()) => {
                *next_seq += 1;
                Ok(seq)
            }
            Err(TrySendError::Full(_)) => Err(DeliveryError::Full),
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }
}

impl DeliveryReceiver {
    /// Next frame in push order; `None` once the sender is dropped and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}
