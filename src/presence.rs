use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::ChatError;
use crate::models::{PresenceStatus, UserId, UserPresence};
use crate::session::Transition;

#[derive(Debug, Clone)]
struct Entry {
    status: PresenceStatus,
    last_seen: Option<DateTime<Utc>>,
    epoch: u64,
}

/// A presence flip that should be announced to co-members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Online,
    Offline { last_seen: DateTime<Utc> },
    Status(PresenceStatus),
}

/// Derives online/offline from session registry transitions.
#[derive(Default)]
pub struct PresenceTracker {
    users: RwLock<HashMap<UserId, Entry>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a registry transition. Stale epochs are ignored, so a delayed
    /// offline can never overwrite a newer online.
    pub async fn apply(&self, user_id: &str, transition: Transition) -> Option<PresenceChange> {
        let (epoch, online) = match transition {
            Transition::FirstConnection { epoch } => (epoch, true),
            Transition::LastDisconnect { epoch } => (epoch, false),
            Transition::AdditionalConnection | Transition::StillConnected => return None,
        };

        let mut users = self.users.write().await;
        let entry = users.entry(user_id.to_string()).or_insert(Entry {
            status: PresenceStatus::Offline,
            last_seen: None,
            epoch: 0,
        });
        if epoch <= entry.epoch {
            log::debug!("Ignoring stale presence epoch {epoch} for {user_id}");
            return None;
        }
        entry.epoch = epoch;

        let now = Utc::now();
        entry.last_seen = Some(now);
        match (online, entry.status) {
            (true, PresenceStatus::Offline) => {
                entry.status = PresenceStatus::Online;
                Some(PresenceChange::Online)
            }
            (false, status) if status != PresenceStatus::Offline => {
                entry.status = PresenceStatus::Offline;
                Some(PresenceChange::Offline { last_seen: now })
            }
            _ => None,
        }
    }

    /// Manual away/busy/online while connected.
    pub async fn set_status(&self, user_id: &str, status: PresenceStatus) -> Result<Option<PresenceChange>, ChatError> {
        if status == PresenceStatus::Offline {
            return Err(ChatError::invalid("offline is derived from connections"));
        }
        let mut users = self.users.write().await;
        let Some(entry) = users.get_mut(user_id).filter(|e| e.status != PresenceStatus::Offline) else {
            return Err(ChatError::invalid("user is not connected"));
        };
        if entry.status == status {
            return Ok(None);
        }
        entry.status = status;
        Ok(Some(PresenceChange::Status(status)))
    }

    pub async fn status_of(&self, user_id: &str) -> UserPresence {
        let users = self.users.read().await;
        match users.get(user_id) {
            Some(entry) => UserPresence {
                user_id: user_id.to_string(),
                status: entry.status,
                last_seen: entry.last_seen,
            },
            None => UserPresence {
                user_id: user_id.to_string(),
                status: PresenceStatus::Offline,
                last_seen: None,
            },
        }
    }

    /// Snapshot of the users among `candidates` that are currently not offline.
    pub async fn online_among<'a, I>(&self, candidates: I) -> Vec<UserPresence>
    where
        I: IntoIterator<Item = &'a UserId>,
    {
        let users = self.users.read().await;
        candidates
            .into_iter()
            .filter_map(|user_id| {
                let entry = users.get(user_id)?;
                (entry.status != PresenceStatus::Offline).then(|| UserPresence {
                    user_id: user_id.clone(),
                    status: entry.status,
                    last_seen: entry.last_seen,
                })
            })
            .collect()
    }
}
