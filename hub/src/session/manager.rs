//! Session manager for tracking all connected devices

use super::connection::SessionHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use twinlink_engine::CommandClient;
use twinlink_shared::Envelope;

struct SessionEntry {
    handle: SessionHandle,
    /// Client for commands the hub issues to this device
    commands: Arc<CommandClient>,
}

/// Manages all active device sessions
pub struct SessionManager {
    /// Map of device_id -> session entry
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a new device session
    pub async fn register(&self, handle: SessionHandle, commands: Arc<CommandClient>) {
        let device_id = handle.device_id.clone();
        if device_id.is_empty() {
            return; // Can't register without device ID
        }

        let entry = SessionEntry { handle, commands };

        let mut sessions = self.sessions.write().await;
        sessions.insert(device_id, entry);
    }

    /// Unregister a device session
    pub async fn unregister(&self, device_id: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.remove(device_id);
    }

    /// Get a session handle for a specific device
    pub async fn get(&self, device_id: &str) -> Option<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions.get(device_id).map(|e| e.handle.clone())
    }

    /// Get the command client for a specific device
    pub async fn commands(&self, device_id: &str) -> Option<Arc<CommandClient>> {
        let sessions = self.sessions.read().await;
        sessions.get(device_id).map(|e| e.commands.clone())
    }

    /// Send a message to a specific device
    pub async fn send_to(&self, device_id: &str, envelope: &Envelope) -> anyhow::Result<()> {
        let handle = self
            .get(device_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("device not connected: {}", device_id))?;
        handle.send(envelope).await
    }

    /// Get list of all connected device IDs
    pub async fn connected_devices(&self) -> Vec<String> {
        let sessions = self.sessions.read().await;
        sessions.keys().cloned().collect()
    }

    /// Remove sessions with no recent traffic and return their IDs
    pub async fn remove_dead_sessions(&self) -> Vec<String> {
        let handles: Vec<(String, SessionHandle)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .map(|(id, entry)| (id.clone(), entry.handle.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (device_id, handle) in handles {
            if !handle.is_alive().await {
                dead.push(device_id);
            }
        }

        if !dead.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in &dead {
                sessions.remove(id);
            }
        }
        dead
    }

    /// Get the number of connected devices
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
