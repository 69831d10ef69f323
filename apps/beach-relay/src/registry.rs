use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::call_state::{CallState, Transition};
use crate::envelope::EnvelopeKind;
use crate::error::RelayError;
use crate::identity::Identity;

/// Sending half of a connection's outbound queue. The transport's writer task owns the
/// receiving half and drains it into the socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    outbound: mpsc::Sender<String>,
}

impl ConnectionHandle {
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(depth.max(1));
        (Self { outbound }, rx)
    }

    pub fn same_channel(&self, other: &ConnectionHandle) -> bool {
        self.outbound.same_channel(&other.outbound)
    }
}

/// Registry entry: transport handle plus subscriber set, dropped together.
#[derive(Debug)]
pub struct Connection {
    handle: ConnectionHandle,
    calls: CallState,
}

impl Connection {
    pub fn into_call_state(self) -> CallState {
        self.calls
    }
}

/// Identity -> live connection. Cloning shares the same underlying map.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<Identity, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Identity, handle: ConnectionHandle) -> Result<(), RelayError> {
        match self.connections.entry(id) {
            Entry::Occupied(entry) => Err(RelayError::DuplicateIdentity(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(Connection {
                    handle,
                    calls: CallState::default(),
                });
                Ok(())
            }
        }
    }

    pub fn lookup(&self, id: &Identity) -> Option<ConnectionHandle> {
        self.connections.get(id).map(|entry| entry.handle.clone())
    }

    /// Removing an absent id is a no-op.
    pub fn remove(&self, id: &Identity) -> Option<Connection> {
        self.connections.remove(id).map(|(_, connection)| connection)
    }

    /// Queue `text` on the target's transport without waiting. The entry guard is held for
    /// the duration of the send so a concurrent `remove` is either fully before or after it.
    pub fn deliver(&self, id: &Identity, text: String) -> Result<(), RelayError> {
        let entry = self
            .connections
            .get(id)
            .ok_or_else(|| RelayError::UnknownTarget(id.clone()))?;
        entry
            .handle
            .outbound
            .try_send(text)
            .map_err(|err| RelayError::DeliveryFailure {
                target: id.clone(),
                reason: match err {
                    TrySendError::Full(_) => "outbound buffer full".to_string(),
                    TrySendError::Closed(_) => "connection closed".to_string(),
                },
            })
    }

    /// Drive `id`'s subscriber set. Returns `None` when `id` is not registered.
    pub fn apply_transition(
        &self,
        id: &Identity,
        kind: Option<&EnvelopeKind>,
        peer: &Identity,
    ) -> Option<Transition> {
        self.connections
            .get_mut(id)
            .map(|mut entry| entry.calls.apply(kind, peer))
    }

    pub fn subscribers(&self, id: &Identity) -> Option<Vec<Identity>> {
        self.connections
            .get(id)
            .map(|entry| entry.calls.clone().into_peers().collect())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
