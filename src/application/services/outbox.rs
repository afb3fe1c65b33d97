//! Outbox - non-blocking hand-off of best-effort client and push messages
//!
//! Handlers enqueue synchronously as part of their logical operation; the
//! [`OutboxWorker`](crate::infrastructure::outbox_worker::OutboxWorker) owns
//! delivery. A full or closed outbox drops the message with a warning and never
//! fails the handler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::application::dto::{ClientUpdate, OutboundMessage, PushNotification};

#[derive(Clone)]
pub struct Outbox {
    sender: mpsc::Sender<OutboundMessage>,
    dropped: Arc<AtomicU64>,
}

/// Receiving half, consumed by the outbox worker
pub struct OutboxReceiver(pub(crate) mpsc::Receiver<OutboundMessage>);

impl Outbox {
    pub fn channel(capacity: usize) -> (Self, OutboxReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            OutboxReceiver(receiver),
        )
    }

    /// Queue a message without waiting. Returns false when it was dropped.
    pub fn enqueue(&self, message: OutboundMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(channel = message.channel(), "Outbox full, dropping message");
                false
            }
            Err(TrySendError::Closed(message)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(channel = message.channel(), "Outbox closed, dropping message");
                false
            }
        }
    }

    pub fn client_update(&self, update: ClientUpdate) -> bool {
        self.enqueue(OutboundMessage::Client(update))
    }

    pub fn push(&self, notification: PushNotification) -> bool {
        self.enqueue(OutboundMessage::Push(notification))
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

impl OutboxReceiver {
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        self.0.recv().await
    }

    /// Stop accepting new messages; queued ones can still be drained
    pub fn close(&mut self) {
        self.0.close();
    }

    /// Drain whatever is queued right now; test helper
    #[cfg(test)]
    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.0.try_recv() {
            messages.push(message);
        }
        messages
    }
}
