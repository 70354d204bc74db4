//! Session registry
//!
//! Maps each logged-in identity to its control connection handle and the
//! last datagram address seen from it. One lock guards the whole map; it is
//! never held across socket I/O. Handles only queue frames, so fan-out
//! either clones them out or queues while the lock is held.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::connection::ConnectionHandle;

/// Registry errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Identity already taken: {0}")]
    AlreadyTaken(String),
}

/// One logged-in participant
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub identity: String,
    /// Handle of the control connection that owns this session
    pub handle: ConnectionHandle,
    /// Most recent datagram source address, if any
    pub datagram_addr: Option<SocketAddr>,
}

/// Thread-safe identity → session map
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<BTreeMap<String, ClientSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identity; fails if it is held by a live session
    pub async fn register(
        &self,
        identity: &str,
        handle: ConnectionHandle,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(identity) {
            return Err(RegistryError::AlreadyTaken(identity.to_string()));
        }

        sessions.insert(
            identity.to_string(),
            ClientSession {
                identity: identity.to_string(),
                handle,
                datagram_addr: None,
            },
        );
        Ok(())
    }

    /// Remove an identity; returns the removed session
    pub async fn unregister(&self, identity: &str) -> Option<ClientSession> {
        self.sessions.lock().await.remove(identity)
    }

    /// Remove an identity only while it still belongs to `connection_id`
    pub async fn unregister_connection(
        &self,
        identity: &str,
        connection_id: Uuid,
    ) -> Option<ClientSession> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(identity) {
            Some(session) if session.handle.id() == connection_id => sessions.remove(identity),
            _ => None,
        }
    }

    /// Record the latest datagram source; `false` for unknown identities
    pub async fn update_datagram_address(&self, identity: &str, addr: SocketAddr) -> bool {
        match self.sessions.lock().await.get_mut(identity) {
            Some(session) => {
                if session.datagram_addr != Some(addr) {
                    tracing::debug!("'{}' sends datagrams from {}", identity, addr);
                    session.datagram_addr = Some(addr);
                }
                true
            }
            None => false,
        }
    }

    pub async fn lookup(&self, identity: &str) -> Option<ClientSession> {
        self.sessions.lock().await.get(identity).cloned()
    }

    /// All registered identities in sorted order
    pub async fn snapshot_identities(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Handles of every session except `excluded`
    pub async fn handles_except(&self, excluded: &str) -> Vec<(String, ConnectionHandle)> {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|s| s.identity != excluded)
            .map(|s| (s.identity.clone(), s.handle.clone()))
            .collect()
    }

    /// Build one frame from the identity list and queue it to every session
    ///
    /// The lock is held until every queue has the frame, so pushes from
    /// concurrent membership changes reach each peer in the order the
    /// changes were applied. Returns the identities the frame was built from.
    pub async fn queue_to_all<F, E>(&self, build: F) -> Result<Vec<String>, E>
    where
        F: FnOnce(&[String]) -> Result<Bytes, E>,
    {
        let sessions = self.sessions.lock().await;
        let identities: Vec<String> = sessions.keys().cloned().collect();
        let frame = build(&identities)?;

        for session in sessions.values() {
            super::server::deliver(&session.identity, &session.handle, frame.clone());
        }
        Ok(identities)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}
