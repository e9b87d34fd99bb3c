//! Client sessions, keyed by [`ClientId`]

use crate::core::serial::handler::ClientId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Public view of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    /// Session id
    pub id: ClientId,
    /// Remote address
    pub peer: String,
    /// Device named in the session header, once known
    pub device: Option<String>,
    /// When the connection was accepted
    pub connected_at: DateTime<Utc>,
}

struct Entry {
    info: ClientInfo,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Sessions {
    entries: Mutex<HashMap<ClientId, Entry>>,
    emptied: Notify,
}

/// Registry of client handlers
pub struct ClientHandlerCollection {
    sessions: Arc<Sessions>,
    cancel: CancellationToken,
}

impl ClientHandlerCollection {
    /// Empty registry; sessions end when `cancel` fires
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            sessions: Arc::new(Sessions::default()),
            cancel,
        }
    }

    /// Add a session for a connection from `peer`
    ///
    /// The session stays registered until the ticket is dropped.
    pub fn register(&self, peer: impl Into<String>) -> SessionTicket {
        let id = ClientId::new();
        let cancel = self.cancel.child_token();
        let info = ClientInfo {
            id,
            peer: peer.into(),
            device: None,
            connected_at: Utc::now(),
        };
        self.sessions.entries.lock().insert(
            id,
            Entry {
                info,
                cancel: cancel.clone(),
            },
        );
        SessionTicket {
            id,
            sessions: self.sessions.clone(),
            cancel,
        }
    }

    /// Snapshot of all sessions
    pub fn list(&self) -> Vec<ClientInfo> {
        let mut sessions: Vec<ClientInfo> = self
            .sessions
            .entries
            .lock()
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        sessions.sort_by_key(|info| info.connected_at);
        sessions
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.sessions.entries.lock().len()
    }

    /// No sessions?
    pub fn is_empty(&self) -> bool {
        self.sessions.entries.lock().is_empty()
    }

    /// End one session
    pub fn disconnect(&self, id: ClientId) -> bool {
        match self.sessions.entries.lock().get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// End every session and wait up to `grace` for them to finish
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        let drained = tokio::time::timeout(grace, async {
            loop {
                let emptied = self.sessions.emptied.notified();
                tokio::pin!(emptied);
                emptied.as_mut().enable();
                if self.is_empty() {
                    return;
                }
                emptied.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = self.len(), "Sessions still open after shutdown grace period");
        }
    }
}

/// Registration of one session, removed on drop
pub struct SessionTicket {
    id: ClientId,
    sessions: Arc<Sessions>,
    cancel: CancellationToken,
}

impl SessionTicket {
    /// Session id
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Fires when the session should end
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Remote address
    pub fn peer(&self) -> String {
        self.sessions
            .entries
            .lock()
            .get(&self.id)
            .map(|entry| entry.info.peer.clone())
            .unwrap_or_default()
    }

    /// Record the device named in the session header
    pub fn set_device(&self, device: &str) {
        if let Some(entry) = self.sessions.entries.lock().get_mut(&self.id) {
            entry.info.device = Some(device.to_string());
        }
    }
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        let empty = {
            let mut entries = self.sessions.entries.lock();
            entries.remove(&self.id);
            entries.is_empty()
        };
        debug!(client = %self.id, "Session unregistered");
        if empty {
            self.sessions.emptied.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_drop() {
        let sessions = ClientHandlerCollection::new(CancellationToken::new());
        let first = sessions.register("127.0.0.1:4000");
        let second = sessions.register("127.0.0.1:4001");
        assert_eq!(sessions.len(), 2);

        first.set_device("/dev/ttyUSB0");
        let info = sessions
            .list()
            .into_iter()
            .find(|info| info.id == first.id())
            .unwrap();
        assert_eq!(info.device.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(first.peer(), "127.0.0.1:4000");

        drop(first);
        assert_eq!(sessions.len(), 1);
        assert!(sessions.disconnect(second.id()));
        assert!(second.cancel_token().is_cancelled());
        drop(second);
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_sessions() {
        let sessions = ClientHandlerCollection::new(CancellationToken::new());
        let ticket = sessions.register("peer");
        let task = tokio::spawn(async move {
            ticket.cancel_token().cancelled().await;
            drop(ticket);
        });
        sessions.shutdown(Duration::from_secs(5)).await;
        assert!(sessions.is_empty());
        task.await.unwrap();
    }
}
