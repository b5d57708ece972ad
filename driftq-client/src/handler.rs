//! Handler contracts bridging application code to the wire response path.
//!
//! Both handler flavors sit on the same plumbing: each delivered message
//! carries a [`Responder`] holding the originating connection's response
//! channel, and a [`FinishedMessage`] sent through it becomes a `FIN` or
//! `REQ` on that connection's socket.

use async_trait::async_trait;
use driftq::protocol::{Message, MessageId};
use tokio::sync::mpsc;
use tracing::warn;

/// Outcome reported back to a connection for one delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishedMessage {
    pub id: MessageId,
    /// Requeue delay in milliseconds; ignored when `success` is true
    pub requeue_delay_ms: u64,
    pub success: bool,
}

/// Application error type returned by [`Handler::handle_message`].
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// The synchronous handler contract.
///
/// Return `Ok` and the reader FINs the message; return `Err` and the reader
/// requeues it with backoff, giving up after the configured attempt limit.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle_message(&self, message: &Message) -> Result<(), HandlerError>;

    /// Called once when a message exceeds the attempt limit and is given up on.
    fn log_failed_message(&self, _message: &Message) {}
}

/// The asynchronous handler contract.
///
/// The handler takes ownership of the message and its [`Responder`] and is
/// responsible for eventually reporting a [`FinishedMessage`]. Useful for
/// batching work before acknowledging.
#[async_trait]
pub trait AsyncHandler: Send + Sync + 'static {
    async fn handle_message(&self, message: Message, responder: Responder);

    /// Called once when a message exceeds the attempt limit and is given up on.
    fn log_failed_message(&self, _message: &Message) {}
}

/// Write side of a connection's response channel.
#[derive(Debug, Clone)]
pub struct Responder {
    tx: mpsc::Sender<FinishedMessage>,
}

impl Responder {
    pub(crate) fn new(tx: mpsc::Sender<FinishedMessage>) -> Self {
        Self { tx }
    }

    /// Report the outcome for one message.
    ///
    /// A failed send means the connection is already gone; the broker will
    /// redeliver the message after its own timeout.
    pub async fn respond(&self, finished: FinishedMessage) {
        let id = finished.id;
        if self.tx.send(finished).await.is_err() {
            warn!(id = %id, "connection closed before response could be delivered");
        }
    }

    /// Report successful processing.
    pub async fn finish(&self, id: MessageId) {
        self.respond(FinishedMessage {
            id,
            requeue_delay_ms: 0,
            success: true,
        })
        .await;
    }

    /// Request a requeue after `delay_ms` milliseconds.
    pub async fn requeue(&self, id: MessageId, delay_ms: u64) {
        self.respond(FinishedMessage {
            id,
            requeue_delay_ms: delay_ms,
            success: false,
        })
        .await;
    }
}

/// A message paired with the response channel of the connection it arrived on.
pub(crate) struct IncomingMessage {
    pub message: Message,
    pub responder: Responder,
}
