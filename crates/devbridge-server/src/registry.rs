//! Connection registry: every live socket plus the authoritative browser slot.

use std::collections::HashMap;
use std::sync::Arc;

use devbridge_core::{ConnectionId, Role};

use crate::connection::BridgeConnection;

/// What `unregister` removed.
#[derive(Debug)]
pub struct Unregistered {
    /// The removed connection.
    pub connection: Arc<BridgeConnection>,
    /// Whether it held the browser slot at removal time.
    pub was_browser: bool,
}

/// Live sockets keyed by id. Not internally synchronized; the router owns it
/// behind its lock.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Arc<BridgeConnection>>,
    browser: Option<ConnectionId>,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` (or update its role if already present).
    ///
    /// Returns the connection that lost the browser slot because of this
    /// call: the previous browser when a new one registers, or `conn` itself
    /// when the current browser re-registers as an agent.
    pub fn register(
        &mut self,
        conn: Arc<BridgeConnection>,
        role: Role,
    ) -> Option<Arc<BridgeConnection>> {
        conn.set_role(role);
        let id = conn.id.clone();
        let _ = self.connections.insert(id.clone(), Arc::clone(&conn));

        match role {
            Role::Browser => {
                let previous = self.browser.replace(id.clone())?;
                if previous == id {
                    return None;
                }
                let displaced = self.connections.get(&previous).cloned()?;
                displaced.set_role(Role::Agent);
                Some(displaced)
            }
            Role::Agent => {
                if self.browser.as_ref() == Some(&id) {
                    self.browser = None;
                    Some(conn)
                } else {
                    None
                }
            }
        }
    }

    /// Remove a connection. `None` if it was not registered.
    pub fn unregister(&mut self, id: &ConnectionId) -> Option<Unregistered> {
        let connection = self.connections.remove(id)?;
        let was_browser = self.browser.as_ref() == Some(id);
        if was_browser {
            self.browser = None;
        }
        Some(Unregistered {
            connection,
            was_browser,
        })
    }

    /// The authoritative browser connection, if any.
    pub fn browser(&self) -> Option<&Arc<BridgeConnection>> {
        self.browser.as_ref().and_then(|id| self.connections.get(id))
    }

    /// Look up a connection.
    pub fn get(&self, id: &ConnectionId) -> Option<&Arc<BridgeConnection>> {
        self.connections.get(id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Remove every connection, returning them.
    pub fn drain(&mut self) -> Vec<Arc<BridgeConnection>> {
        self.browser = None;
        self.connections.drain().map(|(_, conn)| conn).collect()
    }
}
