use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::ChatError;
use crate::identity::IdentityService;
use crate::messages::Outbound;
use crate::models::{Identity, RoomId, UserId};

pub type ConnectionId = Uuid;

/// Cloneable handle used to push frames at one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub identity: Identity,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    /// Returns `false` once the writer side has gone away.
    pub fn send(&self, frame: impl Into<Outbound>) -> bool {
        self.tx.send(frame.into()).is_ok()
    }
}

struct Connection {
    handle: ConnectionHandle,
    rooms: HashSet<RoomId>,
}

/// How a user's live connection count moved. `epoch` comes from one
/// registry-wide counter, so it orders transitions of the same user and
/// presence never applies them out of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    FirstConnection { epoch: u64 },
    AdditionalConnection,
    LastDisconnect { epoch: u64 },
    StillConnected,
}

/// A connection that was just unregistered.
#[derive(Debug)]
pub struct Departed {
    pub handle: ConnectionHandle,
    pub rooms: Vec<RoomId>,
    pub transition: Transition,
}

#[derive(Default)]
struct Sessions {
    connections: HashMap<ConnectionId, Connection>,
    by_user: HashMap<UserId, Vec<ConnectionId>>,
    last_epoch: u64,
}

impl Sessions {
    fn bump(&mut self) -> u64 {
        self.last_epoch += 1;
        self.last_epoch
    }
}

/// Maps authenticated identities to their live connections.
pub struct SessionRegistry {
    identity: Arc<dyn IdentityService>,
    sessions: RwLock<Sessions>,
}

impl SessionRegistry {
    pub fn new(identity: Arc<dyn IdentityService>) -> Self {
        Self {
            identity,
            sessions: RwLock::new(Sessions::default()),
        }
    }

    /// Verifies the credential and adds the connection.
    pub async fn register(
        &self,
        token: Option<&str>,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Result<(ConnectionHandle, Transition), ChatError> {
        let identity = self.identity.verify(token.unwrap_or_default()).await?;
        let handle = ConnectionHandle {
            id: Uuid::new_v4(),
            identity,
            tx,
        };

        let mut sessions = self.sessions.write().await;
        let user_id = handle.identity.user_id.clone();
        let siblings = sessions.by_user.entry(user_id.clone()).or_default();
        siblings.push(handle.id);
        let transition = if siblings.len() == 1 {
            Transition::FirstConnection { epoch: sessions.bump() }
        } else {
            Transition::AdditionalConnection
        };
        sessions.connections.insert(
            handle.id,
            Connection {
                handle: handle.clone(),
                rooms: HashSet::new(),
            },
        );
        log::info!("Connection {} registered for {}", handle.id, user_id);
        Ok((handle, transition))
    }

    /// Drops the connection along with every room subscription it held.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<Departed> {
        let mut sessions = self.sessions.write().await;
        let connection = sessions.connections.remove(&connection_id)?;
        let user_id = connection.handle.identity.user_id.clone();

        let remaining = match sessions.by_user.get_mut(&user_id) {
            Some(ids) => {
                ids.retain(|id| *id != connection_id);
                ids.len()
            }
            None => 0,
        };
        let transition = if remaining == 0 {
            sessions.by_user.remove(&user_id);
            Transition::LastDisconnect { epoch: sessions.bump() }
        } else {
            Transition::StillConnected
        };
        log::info!("Connection {connection_id} of {user_id} unregistered ({remaining} left)");

        Some(Departed {
            handle: connection.handle,
            rooms: connection.rooms.into_iter().collect(),
            transition,
        })
    }

    pub async fn connections_for(&self, user_id: &str) -> Vec<ConnectionHandle> {
        let sessions = self.sessions.read().await;
        sessions
            .by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| sessions.connections.get(id))
            .map(|c| c.handle.clone())
            .collect()
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.sessions.read().await.by_user.contains_key(user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.sessions.read().await.connections.len()
    }

    pub async fn attach_room(&self, connection_id: ConnectionId, room_id: &str) {
        if let Some(connection) = self.sessions.write().await.connections.get_mut(&connection_id) {
            connection.rooms.insert(room_id.to_string());
        }
    }

    /// Detaches the room from every connection of the user.
    pub async fn detach_user_room(&self, user_id: &str, room_id: &str) {
        let mut sessions = self.sessions.write().await;
        let ids = sessions.by_user.get(user_id).cloned().unwrap_or_default();
        for id in ids {
            if let Some(connection) = sessions.connections.get_mut(&id) {
                connection.rooms.remove(room_id);
            }
        }
    }

    /// Whether any live connection of the user is attached to the room.
    pub async fn is_attached(&self, user_id: &str, room_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| sessions.connections.get(id))
            .any(|c| c.rooms.contains(room_id))
    }

    pub async fn display_name(&self, user_id: &str) -> Option<String> {
        let sessions = self.sessions.read().await;
        let id = sessions.by_user.get(user_id)?.first()?;
        sessions.connections.get(id).map(|c| c.handle.identity.username.clone())
    }

    /// Sends one frame to every live connection of `users`, skipping `except`.
    /// Returns how many connections were reached.
    pub async fn broadcast<'a, I>(&self, users: I, frame: &Outbound, except: Option<ConnectionId>) -> usize
    where
        I: IntoIterator<Item = &'a UserId>,
    {
        let sessions = self.sessions.read().await;
        let mut reached = 0;
        for user_id in users {
            for id in sessions.by_user.get(user_id).into_iter().flatten() {
                if Some(*id) == except {
                    continue;
                }
                if let Some(connection) = sessions.connections.get(id) {
                    if connection.handle.send(frame.clone()) {
                        reached += 1;
                    }
                }
            }
        }
        reached
    }
}
