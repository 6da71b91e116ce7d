//! Session registry
//!
//! Maps an authenticated client identifier to the key material of its live
//! session. Entries carry the handler that owns them so a stale handler can
//! neither remove nor write through a session that has since been replaced by
//! a newer login under the same identifier.

use dashmap::DashMap;
use securechat_core::{ClientId, PeerPublicKey, SessionKey};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::handler::HandlerId;

// ----------------------------------------------------------------------------
// Entries
// ----------------------------------------------------------------------------

/// Key material of one connected client
#[derive(Debug, Clone)]
pub struct SessionEntry {
    /// Public key from the client's verified certificate
    pub public_key: PeerPublicKey,
    /// Symmetric key negotiated for this connection
    pub session_key: SessionKey,
    /// Handler serving the connection
    pub handler: HandlerId,
    /// Unique per connection instance
    pub session_id: Uuid,
}

impl SessionEntry {
    pub fn new(public_key: PeerPublicKey, session_key: SessionKey, handler: HandlerId) -> Self {
        Self {
            public_key,
            session_key,
            handler,
            session_id: Uuid::new_v4(),
        }
    }
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// Concurrent map from client identifier to session
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<ClientId, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a session, returning the entry it replaced.
    ///
    /// A repeat login overwrites; the earlier handler loses ownership and its
    /// writes are refused from then on.
    pub fn insert(&self, client: ClientId, entry: SessionEntry) -> Option<SessionEntry> {
        debug!(%client, handler = %entry.handler, session = %entry.session_id, "Registering session");
        let previous = self.sessions.insert(client.clone(), entry);
        if let Some(previous) = &previous {
            warn!(
                %client,
                previous_handler = %previous.handler,
                "Identifier logged in again; previous session superseded"
            );
        }
        previous
    }

    /// Remove the entry for `client` only if `handler` still owns it
    pub fn remove_if_owned(&self, client: &ClientId, handler: &HandlerId) -> Option<SessionEntry> {
        self.sessions
            .remove_if(client, |_, entry| &entry.handler == handler)
            .map(|(_, entry)| entry)
    }

    /// Copy of the entry for `client`
    pub fn get(&self, client: &ClientId) -> Option<SessionEntry> {
        self.sessions.get(client).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, client: &ClientId) -> bool {
        self.sessions.contains_key(client)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Identifiers with a live session, sorted
    pub fn clients(&self) -> Vec<ClientId> {
        let mut clients: Vec<ClientId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        clients.sort();
        clients
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
