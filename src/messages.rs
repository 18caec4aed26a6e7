use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChatError;
use crate::models::{Message, MessageId, MessageKind, PresenceStatus, RoomId, UserId, UserPresence};
use crate::room::{Room, RoomUpdate};

/// Frames sent by clients: `{"event": "send-message", "data": {...}}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: RoomId,
        #[serde(default)]
        user_data: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: RoomId },
    #[serde(rename_all = "camelCase")]
    UpdateRoom { room_id: RoomId, updated_room: RoomUpdate },
    #[serde(rename_all = "camelCase")]
    DeleteRoom { room_id: RoomId },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        room_id: RoomId,
        content: String,
        #[serde(default)]
        message_type: MessageKind,
        #[serde(default)]
        reply_to: Option<MessageId>,
        #[serde(default)]
        client_temp_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    EditMessage { message_id: MessageId, content: String },
    #[serde(rename_all = "camelCase")]
    DeleteMessage {
        message_id: MessageId,
        #[serde(default)]
        room_id: Option<RoomId>,
    },
    #[serde(rename_all = "camelCase")]
    MarkDelivered { message_id: MessageId },
    #[serde(rename_all = "camelCase")]
    MarkRead { message_id: MessageId },
    #[serde(rename_all = "camelCase")]
    StartTyping { room_id: RoomId },
    #[serde(rename_all = "camelCase")]
    StopTyping { room_id: RoomId },
    #[serde(rename_all = "camelCase")]
    AddUser { room_id: RoomId, user_id: UserId },
    #[serde(rename_all = "camelCase")]
    UserRemoved { room_id: RoomId, user_id: UserId },
    #[serde(rename_all = "camelCase")]
    AddAdmin { room_id: RoomId, user_id: UserId },
    #[serde(rename_all = "camelCase")]
    RemoveAdmin { room_id: RoomId, user_id: UserId },
    SetStatus { status: PresenceStatus },
}

impl ClientEvent {
    /// Prefix of the `{operation}-error` event reported when this fails.
    pub fn operation(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom { .. } => "join-room",
            ClientEvent::LeaveRoom { .. } => "leave-room",
            ClientEvent::UpdateRoom { .. } => "update-room",
            ClientEvent::DeleteRoom { .. } => "delete-room",
            ClientEvent::SendMessage { .. } => "send-message",
            ClientEvent::EditMessage { .. } => "edit-message",
            ClientEvent::DeleteMessage { .. } => "delete-message",
            ClientEvent::MarkDelivered { .. } => "mark-delivered",
            ClientEvent::MarkRead { .. } => "mark-read",
            ClientEvent::StartTyping { .. } => "start-typing",
            ClientEvent::StopTyping { .. } => "stop-typing",
            ClientEvent::AddUser { .. } => "add-user",
            ClientEvent::UserRemoved { .. } => "remove-user",
            ClientEvent::AddAdmin { .. } => "add-admin",
            ClientEvent::RemoveAdmin { .. } => "remove-admin",
            ClientEvent::SetStatus { .. } => "set-status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    JoinRoomSuccess {
        room_id: RoomId,
        room: Room,
        online: Vec<UserPresence>,
    },
    #[serde(rename_all = "camelCase")]
    UserJoined {
        room_id: RoomId,
        user_id: UserId,
        username: String,
        user_data: Option<Value>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft {
        room_id: RoomId,
        user_id: UserId,
        username: String,
        new_creator: Option<UserId>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    RoomUpdated {
        room_id: RoomId,
        updated_room: Room,
        updated_by: UserId,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    RoomDeleted {
        room_id: RoomId,
        deleted_by: UserId,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    UserAdded {
        room_id: RoomId,
        user_id: UserId,
        added_by: UserId,
    },
    #[serde(rename_all = "camelCase")]
    UserRemoved {
        room_id: RoomId,
        user_id: UserId,
        removed_by: UserId,
    },
    #[serde(rename_all = "camelCase")]
    AdminAdded {
        room_id: RoomId,
        user_id: UserId,
        added_by: UserId,
    },
    #[serde(rename_all = "camelCase")]
    AdminRemoved {
        room_id: RoomId,
        user_id: UserId,
        removed_by: UserId,
    },
    NewMessage { message: Message },
    /// Ack to the sender; `clientTempId` maps the optimistic copy to `message.id`.
    #[serde(rename_all = "camelCase")]
    MessageSent {
        message: Message,
        client_temp_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MessageEdited {
        message_id: MessageId,
        edit_message: Message,
    },
    #[serde(rename_all = "camelCase")]
    MessageDeleted {
        message_id: MessageId,
        room_id: RoomId,
        deleted_by: UserId,
    },
    #[serde(rename_all = "camelCase")]
    MessageDelivered {
        message_id: MessageId,
        user_id: UserId,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    MessageRead {
        message_id: MessageId,
        user_id: UserId,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    UserTyping { user_id: UserId, room_id: RoomId },
    #[serde(rename_all = "camelCase")]
    UserStoppedTyping { user_id: UserId, room_id: RoomId },
    #[serde(rename_all = "camelCase")]
    UserOnline { user_id: UserId },
    #[serde(rename_all = "camelCase")]
    UserOffline {
        user_id: UserId,
        last_seen: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    UserStatus {
        user_id: UserId,
        status: PresenceStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub kind: String,
}

/// `{"event": "{operation}-error", "data": {"message", "kind"}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEvent {
    pub event: String,
    pub data: ErrorBody,
}

impl ErrorEvent {
    pub fn new(operation: &str, err: &ChatError) -> Self {
        ErrorEvent {
            event: format!("{operation}-error"),
            data: ErrorBody {
                message: err.to_string(),
                kind: err.kind().to_string(),
            },
        }
    }

    pub fn operation(&self) -> &str {
        self.event.trim_end_matches("-error")
    }
}

/// Everything a connection's writer task can be handed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Event(ServerEvent),
    Error(ErrorEvent),
}

impl From<ServerEvent> for Outbound {
    fn from(event: ServerEvent) -> Self {
        Outbound::Event(event)
    }
}

impl From<ErrorEvent> for Outbound {
    fn from(error: ErrorEvent) -> Self {
        Outbound::Error(error)
    }
}
