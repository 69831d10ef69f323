use std::collections::HashSet;

use crate::envelope::EnvelopeKind;
use crate::identity::Identity;

/// Peers that must be told `bye` if this connection disappears.
#[derive(Debug, Default, Clone)]
pub struct CallState {
    peers: HashSet<Identity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Subscribed,
    Unsubscribed,
    Unchanged,
}

impl CallState {
    /// Apply the transition for an envelope exchanged with `peer`, in either direction.
    /// `answer` subscribes, `bye` unsubscribes, every other tag is ignored.
    pub fn apply(&mut self, kind: Option<&EnvelopeKind>, peer: &Identity) -> Transition {
        match kind {
            Some(EnvelopeKind::Answer) if self.peers.insert(peer.clone()) => Transition::Subscribed,
            Some(EnvelopeKind::Bye) if self.peers.remove(peer) => Transition::Unsubscribed,
            _ => Transition::Unchanged,
        }
    }

    pub fn contains(&self, peer: &Identity) -> bool {
        self.peers.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn into_peers(self) -> impl Iterator<Item = Identity> {
        self.peers.into_iter()
    }
}
