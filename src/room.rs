use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::models::{RoomId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Public,
    Private,
    Direct,
}

impl RoomKind {
    pub fn default_capacity(self) -> usize {
        match self {
            RoomKind::Direct => 2,
            RoomKind::Public | RoomKind::Private => 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSettings {
    pub allow_invites: bool,
    pub require_approval: bool,
    pub allow_file_uploads: bool,
    /// Days.
    pub message_retention: u32,
}

impl Default for RoomSettings {
    fn default() -> Self {
        RoomSettings {
            allow_invites: true,
            require_approval: false,
            allow_file_uploads: true,
            message_retention: 365,
        }
    }
}

/// In-memory mirror of a room document.
///
/// `participants` keeps insertion order; it decides who inherits the room when
/// the creator leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(rename = "type")]
    pub kind: RoomKind,
    participants: Vec<UserId>,
    admins: Vec<UserId>,
    creator: UserId,
    pub max_participants: usize,
    active: bool,
    pub settings: RoomSettings,
}

/// Partial update of a room's descriptive fields; absent fields are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub avatar: Option<String>,
    pub settings: Option<SettingsPatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub allow_invites: Option<bool>,
    pub require_approval: Option<bool>,
    pub allow_file_uploads: Option<bool>,
    pub message_retention: Option<u32>,
}

impl RoomSettings {
    fn merge(&mut self, patch: &SettingsPatch) {
        if let Some(v) = patch.allow_invites {
            self.allow_invites = v;
        }
        if let Some(v) = patch.require_approval {
            self.require_approval = v;
        }
        if let Some(v) = patch.allow_file_uploads {
            self.allow_file_uploads = v;
        }
        if let Some(v) = patch.message_retention {
            self.message_retention = v;
        }
    }
}

/// What happened to the room's leadership when someone left.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Departure {
    pub new_creator: Option<UserId>,
    pub deactivated: bool,
}

impl Room {
    /// A fresh room: the creator is its only participant and admin.
    pub fn new(id: impl Into<RoomId>, name: impl Into<String>, kind: RoomKind, creator: impl Into<UserId>) -> Self {
        let creator = creator.into();
        Room {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            avatar: None,
            kind,
            participants: vec![creator.clone()],
            admins: vec![creator.clone()],
            creator,
            max_participants: kind.default_capacity(),
            active: true,
            settings: RoomSettings::default(),
        }
    }

    /// A two-person conversation with fixed membership.
    pub fn direct(id: impl Into<RoomId>, first: impl Into<UserId>, second: impl Into<UserId>) -> Self {
        let mut room = Room::new(id, "direct", RoomKind::Direct, first);
        room.participants.push(second.into());
        room
    }

    pub fn with_capacity(mut self, max_participants: usize) -> Self {
        if self.kind != RoomKind::Direct {
            self.max_participants = max_participants;
        }
        self
    }

    pub fn with_settings(mut self, settings: RoomSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn participants(&self) -> &[UserId] {
        &self.participants
    }

    pub fn admins(&self) -> &[UserId] {
        &self.admins
    }

    pub fn creator(&self) -> &str {
        &self.creator
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admins.iter().any(|a| a == user_id)
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.max_participants
    }

    /// Self-service join.
    pub fn join(&mut self, user_id: &str) -> Result<(), ChatError> {
        if !self.active {
            return Err(ChatError::RoomInactive);
        }
        if self.is_full() {
            return Err(ChatError::RoomFull);
        }
        if self.is_participant(user_id) {
            return Err(ChatError::AlreadyMember);
        }
        if self.kind == RoomKind::Direct {
            return Err(ChatError::denied("direct room membership is fixed"));
        }
        if self.kind == RoomKind::Private && self.settings.require_approval {
            return Err(ChatError::ApprovalRequired);
        }
        self.participants.push(user_id.to_string());
        Ok(())
    }

    /// An admin adds someone else.
    pub fn add_member(&mut self, actor: &str, target: &str) -> Result<(), ChatError> {
        if !self.is_admin(actor) {
            return Err(ChatError::denied("only admins can add members"));
        }
        if !self.active {
            return Err(ChatError::RoomInactive);
        }
        if self.kind == RoomKind::Direct {
            return Err(ChatError::denied("direct room membership is fixed"));
        }
        if self.is_participant(target) {
            return Err(ChatError::AlreadyMember);
        }
        if self.is_full() {
            return Err(ChatError::RoomFull);
        }
        self.participants.push(target.to_string());
        Ok(())
    }

    /// Voluntary departure, handing the room on if the creator leaves.
    ///
    /// Successor order: first remaining admin, else first remaining
    /// participant (who also becomes admin), else the room goes inactive.
    pub fn leave(&mut self, user_id: &str) -> Result<Departure, ChatError> {
        if !self.is_participant(user_id) {
            return Err(ChatError::NotMember);
        }
        if self.kind == RoomKind::Direct {
            return Err(ChatError::denied("direct room membership is fixed"));
        }
        self.remove(user_id);

        let mut departure = Departure::default();
        if self.creator == user_id {
            if let Some(admin) = self.admins.first() {
                self.creator = admin.clone();
                departure.new_creator = Some(admin.clone());
            } else if let Some(first) = self.participants.first().cloned() {
                self.admins.push(first.clone());
                self.creator = first.clone();
                departure.new_creator = Some(first);
            } else {
                self.active = false;
                departure.deactivated = true;
            }
        } else if self.participants.is_empty() {
            self.active = false;
            departure.deactivated = true;
        }
        Ok(departure)
    }

    /// Removal by an admin, or by the target themselves.
    pub fn kick(&mut self, actor: &str, target: &str) -> Result<(), ChatError> {
        if !self.is_admin(actor) && actor != target {
            return Err(ChatError::denied("only admins can remove users"));
        }
        if self.creator == target {
            return Err(ChatError::CannotRemoveCreator);
        }
        if !self.is_participant(target) {
            return Err(ChatError::NotMember);
        }
        if self.kind == RoomKind::Direct {
            return Err(ChatError::denied("direct room membership is fixed"));
        }
        self.remove(target);
        Ok(())
    }

    pub fn promote(&mut self, actor: &str, target: &str) -> Result<(), ChatError> {
        if !self.is_admin(actor) {
            return Err(ChatError::denied("only admins can add other admins"));
        }
        if !self.is_participant(target) {
            return Err(ChatError::NotMember);
        }
        if self.is_admin(target) {
            return Err(ChatError::AlreadyAdmin);
        }
        self.admins.push(target.to_string());
        Ok(())
    }

    pub fn demote(&mut self, actor: &str, target: &str) -> Result<(), ChatError> {
        if !self.is_admin(actor) && actor != target {
            return Err(ChatError::denied("only admins can remove other admins"));
        }
        if self.creator == target {
            return Err(ChatError::CannotRemoveCreator);
        }
        if !self.is_admin(target) {
            return Err(ChatError::invalid("user is not an admin"));
        }
        self.admins.retain(|a| a != target);
        Ok(())
    }

    /// Admin-only edit of name, description, avatar and settings.
    pub fn update(&mut self, actor: &str, update: &RoomUpdate) -> Result<(), ChatError> {
        if !self.is_admin(actor) {
            return Err(ChatError::denied("only admins can update the room"));
        }
        if !self.active {
            return Err(ChatError::RoomInactive);
        }
        if let Some(name) = &update.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(ChatError::invalid("room name cannot be empty"));
            }
            self.name = name.to_string();
        }
        if let Some(description) = &update.description {
            self.description = description.trim().to_string();
        }
        if let Some(avatar) = &update.avatar {
            self.avatar = Some(avatar.clone()).filter(|a| !a.is_empty());
        }
        if let Some(patch) = &update.settings {
            self.settings.merge(patch);
        }
        Ok(())
    }

    /// Creator-only deletion. The room goes inactive with nobody in it;
    /// returns who was a participant.
    pub fn close(&mut self, actor: &str) -> Result<Vec<UserId>, ChatError> {
        if self.creator != actor {
            return Err(ChatError::denied("only the room creator can delete the room"));
        }
        if !self.active {
            return Err(ChatError::RoomInactive);
        }
        if self.kind == RoomKind::Direct {
            return Err(ChatError::denied("direct room membership is fixed"));
        }
        self.active = false;
        self.admins.clear();
        Ok(std::mem::take(&mut self.participants))
    }

    fn remove(&mut self, user_id: &str) {
        self.participants.retain(|p| p != user_id);
        self.admins.retain(|a| a != user_id);
    }

    /// Checks the structural invariants; used by tests and on load.
    pub fn check_invariants(&self) -> Result<(), String> {
        if let Some(stray) = self.admins.iter().find(|a| !self.is_participant(a)) {
            return Err(format!("admin {stray} is not a participant"));
        }
        if self.active && !self.is_admin(&self.creator) {
            return Err(format!("creator {} is not an admin of an active room", self.creator));
        }
        if self.participants.len() > self.max_participants {
            return Err("participant count exceeds capacity".to_string());
        }
        if self.kind == RoomKind::Direct && self.participants.len() != 2 {
            return Err("direct room must have exactly two participants".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        if !self.participants.iter().all(|p| seen.insert(p)) {
            return Err("duplicate participant".to_string());
        }
        Ok(())
    }
}
