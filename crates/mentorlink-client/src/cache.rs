//! In-memory history cache.
//!
//! [`HistoryCache`] is a reference [`MessageStore`]: it keeps per-room
//! history fetched from the REST layer, sorted by timestamp and de-duplicated
//! by message id. Invalidation only marks a room stale; refetching is the
//! consumer's job (see [`HistoryCache::needs_refresh`]).

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use mentorlink_core::RoomId;

use crate::MessageStore;

/// A message as kept in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    /// Server-assigned message id.
    pub id: String,
    /// Sender's user id.
    pub sender_id: String,
    /// Message body.
    pub text: String,
    /// Server timestamp.
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RoomHistory {
    /// Sorted by `sent_at` ascending.
    messages: Vec<CachedMessage>,
    loaded: bool,
    stale: bool,
    invalidations: u64,
}

impl RoomHistory {
    fn add(&mut self, message: CachedMessage) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }

        // Equal timestamps keep arrival order.
        let pos = self.messages.partition_point(|m| m.sent_at <= message.sent_at);
        self.messages.insert(pos, message);
        true
    }
}

/// Per-room chat history with a stale flag.
#[derive(Debug, Default)]
pub struct HistoryCache {
    rooms: Mutex<HashMap<RoomId, RoomHistory>>,
}

impl HistoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a room's history with a fresh fetch. Clears the stale flag.
    pub fn set_history(&self, room_id: RoomId, messages: Vec<CachedMessage>) {
        let mut rooms = self.lock();
        let room = rooms.entry(room_id).or_default();

        room.messages.clear();
        for message in messages {
            room.add(message);
        }
        room.loaded = true;
        room.stale = false;
    }

    /// Insert a single message. Returns `false` if its id is already cached.
    pub fn add_message(&self, room_id: RoomId, message: CachedMessage) -> bool {
        self.lock().entry(room_id).or_default().add(message)
    }

    /// Cached history for a room, oldest first.
    pub fn messages(&self, room_id: RoomId) -> Vec<CachedMessage> {
        self.lock().get(&room_id).map(|room| room.messages.clone()).unwrap_or_default()
    }

    /// History has been fetched at least once.
    pub fn is_loaded(&self, room_id: RoomId) -> bool {
        self.lock().get(&room_id).is_some_and(|room| room.loaded)
    }

    /// Room was never loaded or was invalidated since the last fetch.
    pub fn needs_refresh(&self, room_id: RoomId) -> bool {
        self.lock().get(&room_id).is_none_or(|room| !room.loaded || room.stale)
    }

    /// Rooms invalidated since their last fetch.
    pub fn stale_rooms(&self) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> =
            self.lock().iter().filter(|(_, room)| room.stale).map(|(id, _)| *id).collect();
        rooms.sort_unstable();
        rooms
    }

    /// Total invalidations seen for a room.
    pub fn invalidation_count(&self, room_id: RoomId) -> u64 {
        self.lock().get(&room_id).map_or(0, |room| room.invalidations)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RoomId, RoomHistory>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MessageStore for HistoryCache {
    fn invalidate(&self, room_id: RoomId) {
        let mut rooms = self.lock();
        let room = rooms.entry(room_id).or_default();
        room.stale = true;
        room.invalidations += 1;
        tracing::trace!(room_id, count = room.invalidations, "history invalidated");
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn msg(id: &str, secs: i64) -> CachedMessage {
        CachedMessage {
            id: id.to_string(),
            sender_id: "mentor".to_string(),
            text: format!("message {id}"),
            sent_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let cache = HistoryCache::new();
        assert!(cache.add_message(1, msg("a", 10)));
        assert!(!cache.add_message(1, msg("a", 10)));
        assert_eq!(cache.messages(1).len(), 1);
    }

    #[test]
    fn messages_stay_sorted() {
        let cache = HistoryCache::new();
        cache.add_message(1, msg("late", 30));
        cache.add_message(1, msg("early", 10));
        cache.add_message(1, msg("middle", 20));

        let ids: Vec<_> = cache.messages(1).into_iter().map(|m| m.id).collect();
        assert_eq!(ids, ["early", "middle", "late"]);
    }

    #[test]
    fn set_history_sorts_and_dedupes() {
        let cache = HistoryCache::new();
        cache.set_history(4, vec![msg("b", 2), msg("a", 1), msg("b", 2)]);

        let ids: Vec<_> = cache.messages(4).into_iter().map(|m| m.id).collect();
        assert_eq!(ids, ["a", "b"]);
        assert!(cache.is_loaded(4));
    }

    #[test]
    fn invalidation_marks_stale_until_refetch() {
        let cache = HistoryCache::new();
        assert!(cache.needs_refresh(3));

        cache.set_history(3, vec![msg("a", 1)]);
        assert!(!cache.needs_refresh(3));

        cache.invalidate(3);
        assert!(cache.needs_refresh(3));
        assert_eq!(cache.stale_rooms(), vec![3]);
        assert_eq!(cache.messages(3).len(), 1);

        cache.set_history(3, vec![msg("a", 1), msg("b", 2)]);
        assert!(cache.stale_rooms().is_empty());
        assert_eq!(cache.invalidation_count(3), 1);
    }
}
