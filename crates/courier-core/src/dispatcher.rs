use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

use courier_types::events::{GatewayEvent, OnlineUser};
use courier_types::models::PresenceStatus;

/// A live connection. Only the most recent connection per user is kept.
struct PresenceEntry {
    conn_id: Uuid,
    status: PresenceStatus,
    last_activity: DateTime<Utc>,
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

/// Presence registry and fan-out. Built once at startup and shared by the
/// service and every connection task.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Conversation-scoped and global events. Each connection filters
    /// conversation events against the conversations it joined.
    broadcast_tx: broadcast::Sender<GatewayEvent>,

    /// Private channels: user_id -> most recent connection
    presence: RwLock<HashMap<Uuid, PresenceEntry>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                presence: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Fire-and-forget. Having no subscribers is not an error.
    pub fn broadcast(&self, event: GatewayEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Register a connection as the user's presence entry and announce it.
    /// A previous connection for the same user stops receiving private events.
    pub async fn connect(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let replaced = self
            .inner
            .presence
            .write()
            .await
            .insert(
                user_id,
                PresenceEntry {
                    conn_id,
                    status: PresenceStatus::Online,
                    last_activity: Utc::now(),
                    tx,
                },
            )
            .is_some();
        if replaced {
            debug!("User {} reconnected, newer connection {} takes over", user_id, conn_id);
        }

        self.broadcast(GatewayEvent::UserStatusUpdated {
            user_id,
            status: PresenceStatus::Online,
        });
        (conn_id, rx)
    }

    /// Remove the presence entry, but only if `conn_id` still owns it.
    pub async fn disconnect(&self, user_id: Uuid, conn_id: Uuid) {
        let removed = {
            let mut presence = self.inner.presence.write().await;
            match presence.get(&user_id) {
                Some(entry) if entry.conn_id == conn_id => presence.remove(&user_id).is_some(),
                _ => false,
            }
        };

        if removed {
            self.broadcast(GatewayEvent::UserStatusUpdated {
                user_id,
                status: PresenceStatus::Offline,
            });
        }
    }

    /// Push to the user's private channel. Returns true only if a live
    /// connection accepted the event.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) -> bool {
        let presence = self.inner.presence.read().await;
        match presence.get(&user_id) {
            Some(entry) => entry.tx.send(event).is_ok(),
            None => false,
        }
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner
            .presence
            .read()
            .await
            .get(&user_id)
            .is_some_and(|entry| !entry.tx.is_closed())
    }

    /// Change the status shown to others. Offline is reserved for disconnects.
    pub async fn set_status(&self, user_id: Uuid, conn_id: Uuid, status: PresenceStatus) -> bool {
        if status == PresenceStatus::Offline {
            return false;
        }
        let updated = {
            let mut presence = self.inner.presence.write().await;
            match presence.get_mut(&user_id) {
                Some(entry) if entry.conn_id == conn_id => {
                    entry.status = status;
                    entry.last_activity = Utc::now();
                    true
                }
                _ => false,
            }
        };

        if updated {
            self.broadcast(GatewayEvent::UserStatusUpdated { user_id, status });
        }
        updated
    }

    pub async fn touch(&self, user_id: Uuid, conn_id: Uuid) {
        if let Some(entry) = self.inner.presence.write().await.get_mut(&user_id) {
            if entry.conn_id == conn_id {
                entry.last_activity = Utc::now();
            }
        }
    }

    pub async fn online_users(&self) -> Vec<OnlineUser> {
        self.inner
            .presence
            .read()
            .await
            .iter()
            .map(|(user_id, entry)| OnlineUser {
                user_id: *user_id,
                status: entry.status,
                last_activity: entry.last_activity,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn newest_connection_owns_presence() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();

        let (old_conn, mut old_rx) = dispatcher.connect(user).await;
        let (new_conn, mut new_rx) = dispatcher.connect(user).await;

        assert!(dispatcher.send_to_user(user, GatewayEvent::OnlineUsers { users: vec![] }).await);
        assert!(new_rx.try_recv().is_ok());
        assert!(old_rx.try_recv().is_err());

        // The stale connection closing must not take the user offline.
        dispatcher.disconnect(user, old_conn).await;
        assert!(dispatcher.is_online(user).await);

        dispatcher.disconnect(user, new_conn).await;
        assert!(!dispatcher.is_online(user).await);
        assert!(!dispatcher.send_to_user(user, GatewayEvent::OnlineUsers { users: vec![] }).await);
    }

    #[tokio::test]
    async fn status_changes_are_broadcast() {
        let dispatcher = Dispatcher::new();
        let mut events = dispatcher.subscribe();
        let user = Uuid::new_v4();

        let (conn_id, _rx) = dispatcher.connect(user).await;
        assert!(dispatcher.set_status(user, conn_id, PresenceStatus::Busy).await);
        assert!(!dispatcher.set_status(user, conn_id, PresenceStatus::Offline).await);

        let online = events.recv().await.unwrap();
        assert!(matches!(online, GatewayEvent::UserStatusUpdated { status: PresenceStatus::Online, .. }));
        let busy = events.recv().await.unwrap();
        assert!(matches!(busy, GatewayEvent::UserStatusUpdated { status: PresenceStatus::Busy, .. }));

        let users = dispatcher.online_users().await;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].status, PresenceStatus::Busy);
    }

    #[tokio::test]
    async fn heartbeats_refresh_last_activity() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (conn_id, _rx) = dispatcher.connect(user).await;
        let connected = dispatcher.online_users().await[0].last_activity;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        dispatcher.touch(user, Uuid::new_v4()).await;
        assert_eq!(dispatcher.online_users().await[0].last_activity, connected);

        dispatcher.touch(user, conn_id).await;
        assert!(dispatcher.online_users().await[0].last_activity > connected);
    }

    #[tokio::test]
    async fn dropped_receiver_counts_as_offline() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (_conn, rx) = dispatcher.connect(user).await;
        drop(rx);

        assert!(!dispatcher.is_online(user).await);
        assert!(!dispatcher.send_to_user(user, GatewayEvent::OnlineUsers { users: vec![] }).await);
    }
}
