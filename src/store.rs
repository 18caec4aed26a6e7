use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::StoreError;
use crate::models::{Message, MessageId, NewMessage, Receipt, ReceiptKind, RoomId, UserId, DELETED_PLACEHOLDER};
use crate::room::Room;

/// Durable owner of rooms and messages.
///
/// Implementations must give read-after-write consistency for the document a
/// call touches.
#[async_trait]
pub trait Store: Send + Sync {
    async fn fetch_room(&self, room_id: &str) -> Result<Option<Room>, StoreError>;

    async fn persist_membership_change(&self, room: &Room) -> Result<(), StoreError>;

    /// Assigns the durable id, the per-room sequence and the timestamp.
    async fn create_message(&self, draft: &NewMessage) -> Result<Message, StoreError>;

    async fn fetch_message(&self, message_id: &str) -> Result<Option<Message>, StoreError>;

    async fn update_message(&self, message: &Message) -> Result<(), StoreError>;

    /// Replaces the content with [`DELETED_PLACEHOLDER`] and sets the tombstone.
    async fn soft_delete_message(&self, message_id: &str) -> Result<Option<Message>, StoreError>;

    /// Returns `false` when the user already has a receipt of this kind.
    async fn record_receipt(
        &self,
        message_id: &str,
        kind: ReceiptKind,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

#[derive(Default)]
struct Documents {
    rooms: HashMap<RoomId, Room>,
    messages: HashMap<MessageId, Message>,
    sequences: HashMap<RoomId, u64>,
}

/// Process-local store used by the binary and tests.
#[derive(Default)]
pub struct InMemoryStore {
    docs: RwLock<Documents>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_room(&self, room: Room) {
        self.docs.write().await.rooms.insert(room.id.clone(), room);
    }

    /// Messages of a room in persisted order.
    pub async fn room_history(&self, room_id: &str) -> Vec<Message> {
        let docs = self.docs.read().await;
        let mut history: Vec<Message> = docs
            .messages
            .values()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect();
        history.sort_by_key(|m| m.sequence);
        history
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn fetch_room(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        Ok(self.docs.read().await.rooms.get(room_id).cloned())
    }

    async fn persist_membership_change(&self, room: &Room) -> Result<(), StoreError> {
        let mut docs = self.docs.write().await;
        match docs.rooms.get_mut(&room.id) {
            Some(stored) => {
                *stored = room.clone();
                Ok(())
            }
            None => Err(StoreError::Conflict(format!("room {} does not exist", room.id))),
        }
    }

    async fn create_message(&self, draft: &NewMessage) -> Result<Message, StoreError> {
        let mut docs = self.docs.write().await;
        let sequence = docs.sequences.entry(draft.room_id.clone()).or_insert(0);
        *sequence += 1;
        let message = Message {
            id: Uuid::new_v4().to_string(),
            room_id: draft.room_id.clone(),
            sender_id: draft.sender_id.clone(),
            content: draft.content.clone(),
            kind: draft.kind,
            reply_to: draft.reply_to.clone(),
            sequence: *sequence,
            created_at: Utc::now(),
            edited: false,
            edited_at: None,
            deleted: false,
            delivered_to: Vec::new(),
            read_by: Vec::new(),
        };
        docs.messages.insert(message.id.clone(), message.clone());
        Ok(message)
    }

    async fn fetch_message(&self, message_id: &str) -> Result<Option<Message>, StoreError> {
        Ok(self.docs.read().await.messages.get(message_id).cloned())
    }

    async fn update_message(&self, message: &Message) -> Result<(), StoreError> {
        let mut docs = self.docs.write().await;
        match docs.messages.get_mut(&message.id) {
            Some(stored) if stored.deleted => {
                Err(StoreError::Conflict(format!("message {} is deleted", message.id)))
            }
            Some(stored) => {
                *stored = message.clone();
                Ok(())
            }
            None => Err(StoreError::Conflict(format!("message {} does not exist", message.id))),
        }
    }

    async fn soft_delete_message(&self, message_id: &str) -> Result<Option<Message>, StoreError> {
        let mut docs = self.docs.write().await;
        Ok(docs.messages.get_mut(message_id).map(|stored| {
            stored.content = DELETED_PLACEHOLDER.to_string();
            stored.deleted = true;
            stored.clone()
        }))
    }

    async fn record_receipt(
        &self,
        message_id: &str,
        kind: ReceiptKind,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut docs = self.docs.write().await;
        let Some(message) = docs.messages.get_mut(message_id) else {
            return Err(StoreError::Conflict(format!("message {message_id} does not exist")));
        };
        if message.has_receipt(kind, user_id) {
            return Ok(false);
        }
        let receipt = Receipt {
            user_id: UserId::from(user_id),
            at,
        };
        match kind {
            ReceiptKind::Delivered => message.delivered_to.push(receipt),
            ReceiptKind::Read => message.read_by.push(receipt),
        }
        Ok(true)
    }
}

/// Bounded retries with exponential backoff around every store call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub timeout: Duration,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        RetryPolicy {
            attempts: settings.store_attempts.max(1),
            timeout: settings.store_timeout,
            backoff: settings.store_backoff,
        }
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout),
            };
            match result {
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    let delay = self.delay_for(attempt);
                    log::warn!(
                        "{operation}: attempt {attempt}/{} failed ({err}), retrying in {delay:?}",
                        self.attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        log::error!("{operation}: giving up after {attempt} attempts: {err}");
                    }
                    return Err(err);
                }
                Ok(value) => return Ok(value),
            }
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff.saturating_mul(1 << (attempt - 1).min(8));
        let spread = u64::try_from(self.backoff.as_millis() / 2).unwrap_or(u64::MAX);
        let jitter = rand::thread_rng().gen_range(0..=spread);
        base + Duration::from_millis(jitter)
    }
}
