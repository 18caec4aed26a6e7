use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::ChatError;
use crate::models::{RoomId, UserId};
use crate::room::{Departure, Room, RoomUpdate};
use crate::store::{RetryPolicy, Store};

/// Exclusive, read-only view of a room. Holding it serializes against every
/// other mutation of the same room.
pub struct RoomGuard(OwnedMutexGuard<Room>);

impl Deref for RoomGuard {
    type Target = Room;

    fn deref(&self) -> &Room {
        &self.0
    }
}

/// Result of a committed membership change, with the room as persisted.
#[derive(Debug, Clone)]
pub struct Committed<T> {
    pub outcome: T,
    pub room: Room,
}

/// Owns the in-memory mirror of every room this process serves.
pub struct RoomMembershipManager {
    store: Arc<dyn Store>,
    retry: RetryPolicy,
    rooms: RwLock<HashMap<RoomId, Arc<Mutex<Room>>>>,
}

impl RoomMembershipManager {
    pub fn new(store: Arc<dyn Store>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    async fn slot(&self, room_id: &str) -> Result<Arc<Mutex<Room>>, ChatError> {
        if let Some(slot) = self.rooms.read().await.get(room_id) {
            return Ok(slot.clone());
        }

        let store = &self.store;
        let loaded = self
            .retry
            .run("fetch_room", move || store.fetch_room(room_id))
            .await?
            .ok_or_else(|| ChatError::RoomNotFound(room_id.to_string()))?;
        if let Err(problem) = loaded.check_invariants() {
            log::warn!("Room {room_id} loaded with broken invariant: {problem}");
        }

        let mut rooms = self.rooms.write().await;
        let slot = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(loaded)));
        Ok(slot.clone())
    }

    /// Locks the room for the caller's critical section.
    pub async fn lock(&self, room_id: &str) -> Result<RoomGuard, ChatError> {
        let slot = self.slot(room_id).await?;
        Ok(RoomGuard(slot.lock_owned().await))
    }

    pub async fn snapshot(&self, room_id: &str) -> Result<Room, ChatError> {
        Ok(self.lock(room_id).await?.clone())
    }

    /// Applies `change` to a copy, persists it, then commits. On any failure
    /// the in-memory room is left as it was. A change that leaves the room
    /// as it was is not persisted.
    async fn mutate<T, F>(&self, room_id: &str, operation: &str, change: F) -> Result<Committed<T>, ChatError>
    where
        F: FnOnce(&mut Room) -> Result<T, ChatError>,
    {
        let slot = self.slot(room_id).await?;
        let mut room = slot.lock().await;

        let mut candidate = room.clone();
        let outcome = change(&mut candidate)?;
        if candidate == *room {
            return Ok(Committed { outcome, room: candidate });
        }

        let store = &self.store;
        let candidate_ref = &candidate;
        self.retry
            .run(operation, move || store.persist_membership_change(candidate_ref))
            .await?;

        *room = candidate;
        log::debug!("Room {room_id}: {operation} committed");
        Ok(Committed {
            outcome,
            room: room.clone(),
        })
    }

    pub async fn join(&self, room_id: &str, user_id: &str) -> Result<Committed<()>, ChatError> {
        self.mutate(room_id, "join", |room| room.join(user_id)).await
    }

    /// Joins, or finds the user already a participant. The outcome is `true`
    /// only when this call added them.
    pub async fn enter(&self, room_id: &str, user_id: &str) -> Result<Committed<bool>, ChatError> {
        self.mutate(room_id, "join", |room| {
            if room.is_participant(user_id) {
                Ok(false)
            } else {
                room.join(user_id).map(|()| true)
            }
        })
        .await
    }

    pub async fn update(&self, room_id: &str, actor: &str, update: &RoomUpdate) -> Result<Committed<()>, ChatError> {
        self.mutate(room_id, "update_room", |room| room.update(actor, update)).await
    }

    /// Deletes the room for everyone; the outcome lists the former participants.
    pub async fn close(&self, room_id: &str, actor: &str) -> Result<Committed<Vec<UserId>>, ChatError> {
        let committed = self.mutate(room_id, "delete_room", |room| room.close(actor)).await?;
        log::info!("Room {room_id}: deleted by {actor}");
        Ok(committed)
    }

    pub async fn leave(&self, room_id: &str, user_id: &str) -> Result<Committed<Departure>, ChatError> {
        let committed = self.mutate(room_id, "leave", |room| room.leave(user_id)).await?;
        if let Some(creator) = &committed.outcome.new_creator {
            log::info!("Room {room_id}: ownership passed from {user_id} to {creator}");
        }
        if committed.outcome.deactivated {
            log::info!("Room {room_id}: last participant left, room is now inactive");
        }
        Ok(committed)
    }

    pub async fn kick(&self, room_id: &str, actor: &str, target: &str) -> Result<Committed<()>, ChatError> {
        self.mutate(room_id, "kick", |room| room.kick(actor, target)).await
    }

    pub async fn promote(&self, room_id: &str, actor: &str, target: &str) -> Result<Committed<()>, ChatError> {
        self.mutate(room_id, "promote", |room| room.promote(actor, target)).await
    }

    pub async fn demote(&self, room_id: &str, actor: &str, target: &str) -> Result<Committed<()>, ChatError> {
        self.mutate(room_id, "demote", |room| room.demote(actor, target)).await
    }

    pub async fn add_member(&self, room_id: &str, actor: &str, target: &str) -> Result<Committed<()>, ChatError> {
        self.mutate(room_id, "add_member", |room| room.add_member(actor, target)).await
    }

    /// Loaded rooms where `user_id` participates.
    pub async fn rooms_of(&self, user_id: &str) -> Vec<RoomId> {
        let slots: Vec<(RoomId, Arc<Mutex<Room>>)> = self
            .rooms
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut joined = Vec::new();
        for (id, slot) in slots {
            if slot.lock().await.is_participant(user_id) {
                joined.push(id);
            }
        }
        joined
    }

    /// Everyone sharing at least one loaded room with `user_id`, excluding them.
    pub async fn co_members(&self, user_id: &str) -> Vec<UserId> {
        let mut members: Vec<UserId> = Vec::new();
        for room_id in self.rooms_of(user_id).await {
            let Ok(room) = self.lock(&room_id).await else { continue };
            for participant in room.participants() {
                if participant != user_id && !members.contains(participant) {
                    members.push(participant.clone());
                }
            }
        }
        members
    }
}
