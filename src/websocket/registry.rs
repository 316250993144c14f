use std::collections::HashMap;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;
use tracing::{debug, info};

use crate::error::HubError;
use crate::websocket::BotConnection;

/// Live connector sockets keyed by bot identifier. At most one connection per
/// key; the registry owns connection lifetime once a socket is installed.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, BotConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `conn` for `bot_id`, closing and evicting any connection
    /// already registered under that key.
    pub async fn register(&self, bot_id: &str, conn: BotConnection) {
        let mut connections = self.connections.write().await;
        if let Some(existing) = connections.insert(bot_id.to_string(), conn) {
            info!("Existing connection {} for bot {} replaced, closing it", existing.id(), bot_id);
            existing.close();
        }
        info!("Bot {} registered", bot_id);
    }

    /// Check-and-insert under a single write lock. Fails with
    /// [`HubError::AlreadyConnected`] when `bot_id` already has a connection;
    /// the registry is left untouched in that case.
    pub async fn try_register(&self, bot_id: &str, conn: BotConnection) -> Result<(), HubError> {
        let mut connections = self.connections.write().await;
        if connections.contains_key(bot_id) {
            return Err(HubError::AlreadyConnected(bot_id.to_string()));
        }
        connections.insert(bot_id.to_string(), conn);
        info!("Bot {} registered", bot_id);
        Ok(())
    }

    /// Close and remove the connection for `bot_id`, if any.
    pub async fn unregister(&self, bot_id: &str) -> bool {
        let removed = self.connections.write().await.remove(bot_id);
        match removed {
            Some(conn) => {
                conn.close();
                info!("Bot {} unregistered", bot_id);
                true
            }
            None => false,
        }
    }

    /// Like [`unregister`](Self::unregister), but only when the entry is still
    /// the connection identified by `connection_id`. A handler whose socket was
    /// replaced must not evict its successor.
    pub async fn release(&self, bot_id: &str, connection_id: Uuid) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(bot_id) {
            Some(current) if current.id() == connection_id => {
                if let Some(conn) = connections.remove(bot_id) {
                    conn.close();
                }
                info!("Bot {} unregistered", bot_id);
                true
            }
            Some(_) => {
                debug!("Connection {} for bot {} was already replaced", connection_id, bot_id);
                false
            }
            None => false,
        }
    }

    pub async fn lookup(&self, bot_id: &str) -> Option<BotConnection> {
        self.connections.read().await.get(bot_id).cloned()
    }

    pub async fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Write `payload` as a JSON text frame to the connection for `bot_id` and
    /// wait for the socket write to finish.
    ///
    /// The map lock is only held for the lookup. Write failures are returned
    /// as-is; the entry stays registered until its receive loop notices the
    /// dead socket.
    pub async fn send_to<T: Serialize>(&self, bot_id: &str, payload: &T) -> Result<(), HubError> {
        let conn = self
            .lookup(bot_id)
            .await
            .ok_or_else(|| HubError::NotFound(bot_id.to_string()))?;
        conn.send_json(payload).await
    }

    pub async fn close_all(&self) {
        let mut connections = self.connections.write().await;
        for (bot_id, conn) in connections.drain() {
            conn.close();
            info!("Closed connection for bot {}", bot_id);
        }
    }
}
