//! Message store that records invalidations.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mentorlink_client::MessageStore;
use mentorlink_core::RoomId;

/// Records every invalidation in call order. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct RecordingStore {
    invalidations: Arc<Mutex<Vec<RoomId>>>,
}

impl RecordingStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidations so far, oldest first.
    pub fn invalidations(&self) -> Vec<RoomId> {
        self.lock().clone()
    }

    /// Number of invalidations for `room_id`.
    pub fn count(&self, room_id: RoomId) -> usize {
        self.lock().iter().filter(|r| **r == room_id).count()
    }

    /// Forget recorded invalidations.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RoomId>> {
        self.invalidations.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MessageStore for RecordingStore {
    fn invalidate(&self, room_id: RoomId) {
        self.lock().push(room_id);
    }
}
