use std::sync::Arc;

use chrono::Utc;

use crate::config::Settings;
use crate::error::ChatError;
use crate::membership::RoomMembershipManager;
use crate::messages::{Outbound, ServerEvent};
use crate::models::{Message, MessageId, MessageKind, NewMessage, ReceiptKind, RoomId, UserId};
use crate::session::{ConnectionId, ConnectionHandle, SessionRegistry};
use crate::store::{RetryPolicy, Store};

/// A message as submitted by a client, before validation.
#[derive(Debug, Clone)]
pub struct Submission {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub reply_to: Option<MessageId>,
    pub client_temp_id: Option<String>,
}

/// Persists message operations and fans them out to live room members.
///
/// Every operation holds the room's guard from validation through broadcast,
/// so all recipients observe one room's events in store order.
pub struct MessageFanout {
    store: Arc<dyn Store>,
    retry: RetryPolicy,
    rooms: Arc<RoomMembershipManager>,
    sessions: Arc<SessionRegistry>,
    max_len: usize,
}

impl MessageFanout {
    pub fn new(
        store: Arc<dyn Store>,
        rooms: Arc<RoomMembershipManager>,
        sessions: Arc<SessionRegistry>,
        settings: &Settings,
    ) -> Self {
        Self {
            store,
            retry: RetryPolicy::from_settings(settings),
            rooms,
            sessions,
            max_len: settings.max_message_len,
        }
    }

    fn validate_content(&self, content: &str) -> Result<String, ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::invalid("message content is empty"));
        }
        if content.chars().count() > self.max_len {
            return Err(ChatError::invalid(format!(
                "message content exceeds {} characters",
                self.max_len
            )));
        }
        Ok(content.to_string())
    }

    async fn fetch(&self, message_id: &str) -> Result<Message, ChatError> {
        let store = &self.store;
        self.retry
            .run("fetch_message", move || store.fetch_message(message_id))
            .await?
            .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))
    }

    /// Persists, broadcasts `new-message` to every other member connection,
    /// then acks `origin` with `message-sent` carrying the client's temp id.
    pub async fn submit(&self, origin: Option<&ConnectionHandle>, submission: Submission) -> Result<Message, ChatError> {
        let content = self.validate_content(&submission.content)?;
        if submission.kind == MessageKind::System && origin.is_some() {
            return Err(ChatError::invalid("system messages are reserved for the server"));
        }

        let room = self.rooms.lock(&submission.room_id).await?;
        if !room.is_active() {
            return Err(ChatError::RoomInactive);
        }
        // System notices may name a user who has just left or been removed.
        if submission.kind != MessageKind::System && !room.is_participant(&submission.sender_id) {
            return Err(ChatError::NotMember);
        }
        if let Some(reply_to) = &submission.reply_to {
            match self.fetch(reply_to).await {
                Ok(parent) if parent.room_id == submission.room_id => {}
                Ok(_) | Err(ChatError::MessageNotFound(_)) => {
                    return Err(ChatError::invalid("replyTo does not reference a message in this room"));
                }
                Err(err) => return Err(err),
            }
        }

        let draft = NewMessage {
            room_id: submission.room_id,
            sender_id: submission.sender_id,
            content,
            kind: submission.kind,
            reply_to: submission.reply_to,
        };
        let store = &self.store;
        let draft_ref = &draft;
        let message = self
            .retry
            .run("create_message", move || store.create_message(draft_ref))
            .await?;

        let frame = Outbound::from(ServerEvent::NewMessage { message: message.clone() });
        let reached = self
            .sessions
            .broadcast(room.participants(), &frame, origin.map(|o| o.id))
            .await;
        if let Some(origin) = origin {
            origin.send(ServerEvent::MessageSent {
                message: message.clone(),
                client_temp_id: submission.client_temp_id,
            });
        }
        log::debug!(
            "Message {} (seq {}) in {} fanned out to {reached} connections",
            message.id,
            message.sequence,
            message.room_id
        );
        Ok(message)
    }

    /// Records a server-authored system message in the room. `actor` need
    /// not still be a participant.
    pub async fn post_system(&self, room_id: &str, actor: &str, content: String) -> Result<Message, ChatError> {
        self.submit(
            None,
            Submission {
                room_id: room_id.to_string(),
                sender_id: actor.to_string(),
                content,
                kind: MessageKind::System,
                reply_to: None,
                client_temp_id: None,
            },
        )
        .await
    }

    /// Sender-only edit. Admin rights do not extend to editing.
    pub async fn edit(&self, actor: &str, message_id: &str, content: &str) -> Result<Message, ChatError> {
        let content = self.validate_content(content)?;
        let room_id = self.fetch(message_id).await?.room_id;
        let room = self.rooms.lock(&room_id).await?;

        let mut message = self.fetch(message_id).await?;
        if message.sender_id != actor {
            return Err(ChatError::denied("only the sender can edit a message"));
        }
        if message.deleted {
            return Err(ChatError::AlreadyDeleted);
        }
        message.content = content;
        message.edited = true;
        message.edited_at = Some(Utc::now());

        let store = &self.store;
        let updated = &message;
        self.retry
            .run("update_message", move || store.update_message(updated))
            .await?;

        let frame = Outbound::from(ServerEvent::MessageEdited {
            message_id: message.id.clone(),
            edit_message: message.clone(),
        });
        self.sessions.broadcast(room.participants(), &frame, None).await;
        Ok(message)
    }

    /// Tombstones the message. Allowed for the sender and room admins.
    pub async fn delete(&self, actor: &str, message_id: &str, room_hint: Option<&str>) -> Result<Message, ChatError> {
        let room_id = self.fetch(message_id).await?.room_id;
        if room_hint.is_some_and(|hint| hint != room_id) {
            return Err(ChatError::invalid("message does not belong to that room"));
        }
        let room = self.rooms.lock(&room_id).await?;

        let message = self.fetch(message_id).await?;
        if message.sender_id != actor && !room.is_admin(actor) {
            return Err(ChatError::denied("not authorized to delete this message"));
        }
        if message.deleted {
            return Err(ChatError::AlreadyDeleted);
        }

        let store = &self.store;
        let tombstone = self
            .retry
            .run("soft_delete_message", move || store.soft_delete_message(message_id))
            .await?
            .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;

        let frame = Outbound::from(ServerEvent::MessageDeleted {
            message_id: tombstone.id.clone(),
            room_id: tombstone.room_id.clone(),
            deleted_by: actor.to_string(),
        });
        self.sessions.broadcast(room.participants(), &frame, None).await;
        Ok(tombstone)
    }

    pub async fn mark_delivered(&self, message_id: &str, user_id: &str) -> Result<bool, ChatError> {
        self.mark(message_id, user_id, ReceiptKind::Delivered).await
    }

    pub async fn mark_read(&self, message_id: &str, user_id: &str) -> Result<bool, ChatError> {
        self.mark(message_id, user_id, ReceiptKind::Read).await
    }

    /// Append-only: a second receipt of the same kind is a silent no-op.
    async fn mark(&self, message_id: &str, user_id: &str, kind: ReceiptKind) -> Result<bool, ChatError> {
        let message = self.fetch(message_id).await?;
        if message.has_receipt(kind, user_id) {
            return Ok(false);
        }
        let room = self.rooms.snapshot(&message.room_id).await?;
        if !room.is_participant(user_id) {
            return Err(ChatError::NotMember);
        }

        let at = Utc::now();
        let store = &self.store;
        let recorded = self
            .retry
            .run("record_receipt", move || store.record_receipt(message_id, kind, user_id, at))
            .await?;
        if recorded && message.sender_id != user_id {
            let event = match kind {
                ReceiptKind::Delivered => ServerEvent::MessageDelivered {
                    message_id: message.id.clone(),
                    user_id: user_id.to_string(),
                    at,
                },
                ReceiptKind::Read => ServerEvent::MessageRead {
                    message_id: message.id.clone(),
                    user_id: user_id.to_string(),
                    at,
                },
            };
            self.sessions
                .broadcast([&message.sender_id], &Outbound::from(event), None::<ConnectionId>)
                .await;
        }
        Ok(recorded)
    }
}
