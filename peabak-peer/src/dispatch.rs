//! Outbound dispatch: one bounded queue, routed to a channel by message kind.

use peabak_core::{Message, MessageKind};
use tokio::sync::mpsc;

/// The three multicast traffic classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Negotiation traffic (STORED, GETCHUNK, DELETE, DELETED, REMOVED).
    Control,
    /// PUTCHUNK traffic.
    Backup,
    /// CHUNK traffic.
    Restore,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [ChannelKind::Control, ChannelKind::Backup, ChannelKind::Restore];

    pub fn name(self) -> &'static str {
        match self {
            ChannelKind::Control => "MC",
            ChannelKind::Backup => "MDB",
            ChannelKind::Restore => "MDR",
        }
    }
}

/// Channel a message travels on.
pub fn route(msg: &Message) -> ChannelKind {
    match msg.kind {
        MessageKind::Putchunk { .. } => ChannelKind::Backup,
        MessageKind::Chunk { .. } => ChannelKind::Restore,
        MessageKind::Stored { .. }
        | MessageKind::Getchunk { .. }
        | MessageKind::Delete
        | MessageKind::Deleted
        | MessageKind::Removed { .. } => ChannelKind::Control,
    }
}

/// Handle for queueing outbound messages. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Message>,
}

impl Dispatcher {
    /// Dispatcher plus the receiving end for the single sender task.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a message. Waits while the queue is full. Returns false only once
    /// the sender task is gone (shutdown).
    pub async fn send(&self, msg: Message) -> bool {
        match self.tx.send(msg).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(msg_type = %e.0.message_type(), "send queue closed, message dropped");
                false
            }
        }
    }

    /// Queue a message only if `wanted` still holds once there is room for it.
    /// The check and the enqueue happen with no await in between.
    pub async fn send_if(&self, msg: Message, wanted: impl FnOnce() -> bool) -> bool {
        let Ok(permit) = self.tx.reserve().await else {
            tracing::debug!(msg_type = %msg.message_type(), "send queue closed, message dropped");
            return false;
        };
        if !wanted() {
            return false;
        }
        permit.send(msg);
        true
    }
}
