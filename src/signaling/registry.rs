use std::collections::BTreeMap;

use super::types::{PeerHandle, PlayerId};

/// A connected player
#[derive(Debug, Clone)]
pub struct PlayerEntry {
    pub id: PlayerId,
    pub peer: PeerHandle,
}

/// Connected players keyed by id. Ids come from a monotonic counter starting at 1,
/// so they are never reused within the process.
#[derive(Debug)]
pub struct PlayerRegistry {
    next_id: u64,
    players: BTreeMap<PlayerId, PlayerEntry>,
}

impl Default for PlayerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            players: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, peer: PeerHandle) -> PlayerId {
        let id = PlayerId::new(self.next_id);
        self.next_id += 1;
        self.players.insert(id, PlayerEntry { id, peer });
        id
    }

    pub fn lookup(&self, id: PlayerId) -> Option<&PlayerEntry> {
        self.players.get(&id)
    }

    /// Idempotent: removing an unknown id returns `None`.
    pub fn remove(&mut self, id: PlayerId) -> Option<PlayerEntry> {
        self.players.remove(&id)
    }

    pub fn count(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Copy of all entries in id order, for callers that mutate the registry
    /// while walking it.
    pub fn snapshot(&self) -> Vec<PlayerEntry> {
        self.players.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlayerEntry> {
        self.players.values()
    }
}
