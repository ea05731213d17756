//! Message store collaborator.
//!
//! The runtime never reads or writes chat history. Its only interaction with
//! the store is [`MessageStore::invalidate`], called in the order inbound
//! messages arrived.

use std::sync::Arc;

use mentorlink_core::RoomId;
use tokio::sync::mpsc;

/// External cache of per-room chat history.
pub trait MessageStore: Send + Sync + 'static {
    /// History for `room_id` changed and should be refetched.
    fn invalidate(&self, room_id: RoomId);
}

impl<T: MessageStore + ?Sized> MessageStore for Arc<T> {
    fn invalidate(&self, room_id: RoomId) {
        (**self).invalidate(room_id);
    }
}

/// Forwards invalidations onto a channel, for consumers that refetch in
/// their own task.
#[derive(Debug, Clone)]
pub struct InvalidationChannel {
    tx: mpsc::UnboundedSender<RoomId>,
}

impl InvalidationChannel {
    /// Create the store and the receiving end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RoomId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageStore for InvalidationChannel {
    fn invalidate(&self, room_id: RoomId) {
        if self.tx.send(room_id).is_err() {
            tracing::debug!(room_id, "invalidation receiver dropped");
        }
    }
}
