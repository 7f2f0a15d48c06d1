use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use tokio::sync::mpsc;
use uuid::Uuid;

use super::events::OutboundEvent;
use crate::utils::jwt::Identity;

pub type ConnectionId = Uuid;
pub type EventSender = mpsc::UnboundedSender<OutboundEvent>;

struct Session {
    identity: Identity,
    sender: EventSender,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<ConnectionId, Session>,
    rooms: HashMap<Uuid, HashSet<ConnectionId>>,
}

/// What remains after a connection goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    pub identity: Identity,
    /// True when the user has no other live connection.
    pub last_connection: bool,
}

/// Live socket sessions, and for each user the set of their connections.
/// Owned by `AppState`; nothing here outlives the process.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Registry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, identity: Identity, sender: EventSender) -> ConnectionId {
        let connection_id = Uuid::new_v4();
        let mut registry = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        registry
            .sessions
            .insert(connection_id, Session { identity, sender });
        registry
            .rooms
            .entry(identity.user_id)
            .or_default()
            .insert(connection_id);
        tracing::info!(
            connection_id = %connection_id,
            user_id = %identity.user_id,
            role = ?identity.role,
            "Session opened"
        );
        connection_id
    }

    pub fn unregister(&self, connection_id: ConnectionId) -> Option<Departure> {
        let mut registry = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let session = registry.sessions.remove(&connection_id)?;
        let user_id = session.identity.user_id;

        let last_connection = match registry.rooms.get_mut(&user_id) {
            Some(room) => {
                room.remove(&connection_id);
                room.is_empty()
            }
            None => true,
        };
        if last_connection {
            registry.rooms.remove(&user_id);
        }

        tracing::info!(
            connection_id = %connection_id,
            user_id = %user_id,
            last_connection,
            "Session closed"
        );
        Some(Departure {
            identity: session.identity,
            last_connection,
        })
    }

    /// Deliver to every live connection of `user_id`. Returns how many
    /// connections took the event; zero means the user is offline.
    pub fn notify_user(&self, user_id: Uuid, event: OutboundEvent) -> usize {
        let registry = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let Some(room) = registry.rooms.get(&user_id) else {
            return 0;
        };

        room.iter()
            .filter_map(|id| registry.sessions.get(id))
            .filter(|session| session.sender.send(event.clone()).is_ok())
            .count()
    }

    /// Send to a single connection, used for replies to the sender.
    pub fn notify_connection(&self, connection_id: ConnectionId, event: OutboundEvent) -> bool {
        let registry = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .sessions
            .get(&connection_id)
            .is_some_and(|session| session.sender.send(event).is_ok())
    }

    pub fn is_connected(&self, user_id: Uuid) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rooms
            .contains_key(&user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .len()
    }

    /// Drop every sender, which ends every socket writer task.
    pub fn shutdown(&self) {
        let mut registry = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let closed = registry.sessions.len();
        registry.sessions.clear();
        registry.rooms.clear();
        tracing::info!(closed, "Session registry shut down");
    }
}
