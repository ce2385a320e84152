use crate::proto::Reply;
use crate::Port;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::Sender;

/// Handle to a live connection's outbound queue.
#[derive(Clone)]
pub(crate) struct RouteEntry {
    pub id: u64,
    pub tx: Sender<Reply>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct ListenerState {
    port: Port,
    owner: Port,
}

/// Where a payload on a relay connection should go.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ForwardRoute {
    pub destination: Port,
    pub return_port: Port,
}

/// How a forwarded payload reaches its listener port.
pub(crate) enum Destination {
    /// Nobody inside the broker listens there; dial it.
    Dial,
    /// The broker hosts the port and an application connection is attached.
    Attached(RouteEntry),
    /// The broker hosts the port but no application is connected to it.
    Detached,
}

#[derive(Default)]
struct Tables {
    relays: HashMap<Port, Port>,
    listeners: HashMap<Port, ListenerState>,
    returns: HashMap<Port, Port>,
    routes: HashMap<Port, RouteEntry>,
    hosted: HashMap<Port, Option<RouteEntry>>,
}

/// Shared routing state of the broker.
///
/// Every method takes the lock once, so each one is atomic with respect to
/// the others. The lock is never held across an await point.
#[derive(Clone, Default)]
pub(crate) struct RouteTable {
    inner: Arc<Mutex<Tables>>,
}

impl RouteTable {
    fn lock(&self) -> MutexGuard<'_, Tables> {
        // every update is a single map operation, so a poisoned table is intact
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record that `relay` belongs to the connection with remote port `owner`.
    /// Returns false if the relay port is already taken.
    pub fn insert_relay(&self, relay: Port, owner: Port) -> bool {
        let mut t = self.lock();
        if t.relays.contains_key(&relay) {
            return false;
        }
        t.relays.insert(relay, owner);
        true
    }

    pub fn relay_owner(&self, relay: Port) -> Option<Port> {
        self.lock().relays.get(&relay).copied()
    }

    /// Map `relay` to `listener`, replacing any previous listener.
    pub fn insert_listener(&self, relay: Port, listener: Port, owner: Port) -> Option<Port> {
        self.lock()
            .listeners
            .insert(
                relay,
                ListenerState {
                    port: listener,
                    owner,
                },
            )
            .map(|l| l.port)
    }

    /// Resolve relay → listener for a payload arriving on `local` from
    /// `remote`, and remember `remote` as the listener's return port.
    ///
    /// Fails if the relay's owner has gone away, or if the payload comes from
    /// the connection that requested the listener.
    pub fn resolve_forward(&self, local: Port, remote: Port) -> Option<ForwardRoute> {
        let mut t = self.lock();
        let owner = t.relays.get(&local)?;
        if !t.routes.contains_key(owner) {
            return None;
        }
        let listener = *t.listeners.get(&local)?;
        if listener.owner == remote {
            return None;
        }

        t.returns.insert(listener.port, remote);
        Some(ForwardRoute {
            destination: listener.port,
            return_port: remote,
        })
    }

    pub fn return_port(&self, listener: Port) -> Option<Port> {
        self.lock().returns.get(&listener).copied()
    }

    /// Register a live connection, replacing an older one with the same port.
    pub fn add_route(&self, remote: Port, entry: RouteEntry) {
        if let Some(old) = self.lock().routes.insert(remote, entry) {
            log::debug!("route to port {} replaced (was conn {})", remote, old.id);
        }
    }

    /// Remove the route for `remote` only if it still belongs to connection `id`.
    pub fn remove_route(&self, remote: Port, id: u64) -> bool {
        let mut t = self.lock();
        match t.routes.get(&remote) {
            Some(entry) if entry.id == id => {
                t.routes.remove(&remote);
                true
            }
            _ => false,
        }
    }

    pub fn route(&self, remote: Port) -> Option<RouteEntry> {
        self.lock().routes.get(&remote).cloned()
    }

    /// Mark `listener` as a port the broker itself listens on.
    pub fn host_listener(&self, listener: Port) {
        self.lock().hosted.insert(listener, None);
    }

    /// Attach a connection accepted on a hosted listener port. The latest
    /// connection wins. Returns false if `listener` is not hosted.
    pub fn attach(&self, listener: Port, entry: RouteEntry) -> bool {
        match self.lock().hosted.get_mut(&listener) {
            Some(slot) => {
                *slot = Some(entry);
                true
            }
            None => false,
        }
    }

    /// Detach connection `id` from `listener` if it is still the attached one.
    pub fn detach(&self, listener: Port, id: u64) {
        if let Some(slot) = self.lock().hosted.get_mut(&listener) {
            if slot.as_ref().is_some_and(|e| e.id == id) {
                *slot = None;
            }
        }
    }

    pub fn destination(&self, listener: Port) -> Destination {
        match self.lock().hosted.get(&listener) {
            None => Destination::Dial,
            Some(Some(entry)) => Destination::Attached(entry.clone()),
            Some(None) => Destination::Detached,
        }
    }
}
