use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::ChatError;
use crate::membership::RoomMembershipManager;
use crate::messages::{Outbound, ServerEvent};
use crate::models::{RoomId, UserId};
use crate::session::SessionRegistry;

type Key = (RoomId, UserId);

struct Entry {
    expires_at: Instant,
    generation: u64,
}

/// Live typing entries plus a min-heap of their deadlines. Heap items whose
/// generation no longer matches the entry are stale and skipped.
#[derive(Default)]
struct TypingTable {
    entries: HashMap<Key, Entry>,
    deadlines: BinaryHeap<Reverse<(Instant, u64, Key)>>,
    next_generation: u64,
}

impl TypingTable {
    fn arm(&mut self, key: Key, expires_at: Instant) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.deadlines.push(Reverse((expires_at, generation, key.clone())));
        self.entries.insert(key, Entry { expires_at, generation });
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.peek().map(|Reverse((at, _, _))| *at)
    }

    fn drain_expired(&mut self, now: Instant) -> Vec<Key> {
        let mut expired = Vec::new();
        while let Some(Reverse((at, generation, _))) = self.deadlines.peek() {
            if *at > now {
                break;
            }
            let generation = *generation;
            let Some(Reverse((_, _, key))) = self.deadlines.pop() else { break };
            if self.entries.get(&key).is_some_and(|e| e.generation == generation) {
                self.entries.remove(&key);
                expired.push(key);
            }
        }
        expired
    }
}

struct Inner {
    table: Mutex<TypingTable>,
    wake: Arc<Notify>,
    timeout: Duration,
    sessions: Arc<SessionRegistry>,
    rooms: Arc<RoomMembershipManager>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.wake.notify_one();
    }
}

/// Ephemeral per-room "is typing" state with timed expiry.
#[derive(Clone)]
pub struct TypingCoordinator {
    inner: Arc<Inner>,
}

impl TypingCoordinator {
    /// Spawns the expiry sweeper; must be called inside a tokio runtime.
    pub fn new(timeout: Duration, sessions: Arc<SessionRegistry>, rooms: Arc<RoomMembershipManager>) -> Self {
        let wake = Arc::new(Notify::new());
        let inner = Arc::new(Inner {
            table: Mutex::new(TypingTable::default()),
            wake: wake.clone(),
            timeout,
            sessions,
            rooms,
        });
        tokio::spawn(sweep(Arc::downgrade(&inner), wake));
        Self { inner }
    }

    /// Returns `true` when `user-typing` was announced, `false` when an
    /// existing entry was only refreshed.
    pub async fn start_typing(&self, room_id: &str, user_id: &str) -> Result<bool, ChatError> {
        let room = self.inner.rooms.snapshot(room_id).await?;
        if !room.is_participant(user_id) {
            return Err(ChatError::NotMember);
        }

        let key = (room_id.to_string(), user_id.to_string());
        let now = Instant::now();
        let announce = {
            let mut table = self.lock_table();
            let live = table.entries.get(&key).is_some_and(|e| e.expires_at > now);
            table.arm(key, now + self.inner.timeout);
            !live
        };
        self.inner.wake.notify_one();

        if announce {
            let frame = Outbound::from(ServerEvent::UserTyping {
                user_id: user_id.to_string(),
                room_id: room_id.to_string(),
            });
            let others = room.participants().iter().filter(|p| *p != user_id);
            self.inner.sessions.broadcast(others, &frame, None).await;
        }
        Ok(announce)
    }

    /// Cancels the entry and announces the stop. Returns `false` if there was
    /// nothing to stop.
    pub async fn stop_typing(&self, room_id: &str, user_id: &str) -> bool {
        let key = (room_id.to_string(), user_id.to_string());
        let removed = self.lock_table().entries.remove(&key).is_some();
        if removed {
            announce_stop(&self.inner, room_id, user_id).await;
        }
        removed
    }

    /// Stops every live entry of the user, whichever room it is in. Returns
    /// the rooms that were announced.
    pub async fn stop_all(&self, user_id: &str) -> Vec<RoomId> {
        let rooms: Vec<RoomId> = {
            let mut table = self.lock_table();
            let keys: Vec<Key> = table.entries.keys().filter(|(_, user)| user == user_id).cloned().collect();
            for key in &keys {
                table.entries.remove(key);
            }
            keys.into_iter().map(|(room_id, _)| room_id).collect()
        };
        for room_id in &rooms {
            announce_stop(&self.inner, room_id, user_id).await;
        }
        rooms
    }

    pub fn is_typing(&self, room_id: &str, user_id: &str) -> bool {
        let key = (room_id.to_string(), user_id.to_string());
        self.lock_table().entries.contains_key(&key)
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, TypingTable> {
        self.inner.table.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

async fn announce_stop(inner: &Inner, room_id: &str, user_id: &str) {
    let Ok(room) = inner.rooms.snapshot(room_id).await else {
        return;
    };
    let frame = Outbound::from(ServerEvent::UserStoppedTyping {
        user_id: user_id.to_string(),
        room_id: room_id.to_string(),
    });
    let others = room.participants().iter().filter(|p| *p != user_id);
    inner.sessions.broadcast(others, &frame, None).await;
}

async fn sweep(inner: Weak<Inner>, wake: Arc<Notify>) {
    loop {
        let next = {
            let Some(inner) = inner.upgrade() else { return };
            let table = inner.table.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            table.next_deadline()
        };

        match next {
            Some(deadline) => {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => {}
                    () = wake.notified() => continue,
                }
            }
            None => {
                wake.notified().await;
                continue;
            }
        }

        let Some(inner) = inner.upgrade() else { return };
        let expired = inner
            .table
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain_expired(Instant::now());
        for (room_id, user_id) in expired {
            log::debug!("Typing expired for {user_id} in {room_id}");
            announce_stop(&inner, &room_id, &user_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    use crate::identity::SignedTokenIdentity;
    use crate::membership::tests::fast_retry;
    use crate::room::{Room, RoomKind};
    use crate::session::tests::{token, SECRET};
    use crate::store::InMemoryStore;

    struct Fixture {
        typing: TypingCoordinator,
        bob_rx: mpsc::UnboundedReceiver<Outbound>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let mut room = Room::new("r1", "general", RoomKind::Public, "alice");
        room.join("bob").unwrap();
        store.insert_room(room).await;

        let sessions = Arc::new(SessionRegistry::new(Arc::new(SignedTokenIdentity::new(SECRET))));
        let rooms = Arc::new(RoomMembershipManager::new(store, fast_retry()));
        let (tx, bob_rx) = mpsc::unbounded_channel();
        sessions.register(Some(token("bob").as_str()), tx).await.unwrap();

        Fixture {
            typing: TypingCoordinator::new(Duration::from_secs(3), sessions, rooms),
            bob_rx,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn typing() -> Outbound {
        ServerEvent::UserTyping { user_id: "alice".into(), room_id: "r1".into() }.into()
    }

    fn stopped() -> Outbound {
        ServerEvent::UserStoppedTyping { user_id: "alice".into(), room_id: "r1".into() }.into()
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_start_is_throttled_and_expires_once() {
        let mut f = fixture().await;
        assert!(f.typing.start_typing("r1", "alice").await.unwrap());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!f.typing.start_typing("r1", "alice").await.unwrap());
        assert_eq!(drain(&mut f.bob_rx), [typing()]);

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert!(drain(&mut f.bob_rx).is_empty(), "refresh should push expiry out");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(drain(&mut f.bob_rx), [stopped()]);
        assert!(!f.typing.is_typing("r1", "alice"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(drain(&mut f.bob_rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_stop_cancels_the_timer() {
        let mut f = fixture().await;
        f.typing.start_typing("r1", "alice").await.unwrap();
        assert!(f.typing.stop_typing("r1", "alice").await);
        assert!(!f.typing.stop_typing("r1", "alice").await);
        assert_eq!(drain(&mut f.bob_rx), [typing(), stopped()]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(drain(&mut f.bob_rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn start_after_stop_announces_again() {
        let mut f = fixture().await;
        f.typing.start_typing("r1", "alice").await.unwrap();
        f.typing.stop_typing("r1", "alice").await;
        assert!(f.typing.start_typing("r1", "alice").await.unwrap());
        assert_eq!(drain(&mut f.bob_rx), [typing(), stopped(), typing()]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_clears_every_room_of_the_user() {
        let mut f = fixture().await;
        f.typing.start_typing("r1", "alice").await.unwrap();
        f.typing.start_typing("r1", "bob").await.unwrap();
        drain(&mut f.bob_rx);

        assert_eq!(f.typing.stop_all("alice").await, ["r1"]);
        assert_eq!(drain(&mut f.bob_rx), [stopped()]);
        assert!(f.typing.is_typing("r1", "bob"));
        assert!(f.typing.stop_all("alice").await.is_empty());
    }

    #[tokio::test]
    async fn outsiders_cannot_type() {
        let f = fixture().await;
        assert_eq!(f.typing.start_typing("r1", "mallory").await, Err(ChatError::NotMember));
        assert!(matches!(
            f.typing.start_typing("missing", "alice").await,
            Err(ChatError::RoomNotFound(_))
        ));
    }

    #[test]
    fn stale_heap_entries_are_skipped() {
        let mut table = TypingTable::default();
        let now = Instant::now();
        let key = ("r1".to_string(), "alice".to_string());
        table.arm(key.clone(), now + Duration::from_secs(1));
        table.arm(key.clone(), now + Duration::from_secs(3));

        assert!(table.drain_expired(now + Duration::from_secs(2)).is_empty());
        assert_eq!(table.drain_expired(now + Duration::from_secs(3)), [key]);
        assert!(table.deadlines.is_empty());
    }
}
