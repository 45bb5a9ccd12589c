//! Indexed session table
//!
//! Device-wide mapping from random 32-bit indices to in-progress
//! handshakes and live sessions. Indices name one side of a session on
//! the wire; collisions are rerolled at assignment.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rand::Rng;

use crate::device::peer::Peer;
use crate::protocol::session::Keypair;

/// What a 32-bit receiver index currently names
#[derive(Clone)]
pub enum IndexEntry {
    /// An initiation in flight, awaiting the peer's response
    Handshake { peer: Arc<Peer> },
    /// A live session
    Session {
        peer: Arc<Peer>,
        keypair: Arc<Keypair>,
    },
}

/// Device-wide index allocator and lookup table
#[derive(Default)]
pub struct IndexTable {
    map: RwLock<HashMap<u32, IndexEntry>>,
}

impl IndexTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw a fresh device-unique index and register the in-progress
    /// handshake under it
    pub fn assign_handshake(&self, peer: Arc<Peer>) -> u32 {
        let mut map = self.map.write().unwrap();
        loop {
            let index: u32 = rand::thread_rng().gen();
            if let std::collections::hash_map::Entry::Vacant(slot) = map.entry(index) {
                slot.insert(IndexEntry::Handshake { peer });
                return index;
            }
        }
    }

    /// Register a live session under an index, replacing a handshake
    /// entry that reserved it
    pub fn insert_session(&self, index: u32, peer: Arc<Peer>, keypair: Arc<Keypair>) {
        self.map
            .write()
            .unwrap()
            .insert(index, IndexEntry::Session { peer, keypair });
    }

    pub fn get(&self, index: u32) -> Option<IndexEntry> {
        self.map.read().unwrap().get(&index).cloned()
    }

    pub fn remove(&self, index: u32) {
        self.map.write().unwrap().remove(&index);
    }

    pub fn remove_all(&self, indices: &[u32]) {
        let mut map = self.map.write().unwrap();
        for index in indices {
            map.remove(index);
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_unique_indices() {
        let table = IndexTable::new();
        let peer = Peer::new([0u8; 32]);

        let a = table.assign_handshake(peer.clone());
        let b = table.assign_handshake(peer.clone());

        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert!(matches!(table.get(a), Some(IndexEntry::Handshake { .. })));
    }

    #[test]
    fn test_remove() {
        let table = IndexTable::new();
        let peer = Peer::new([0u8; 32]);

        let a = table.assign_handshake(peer.clone());
        let b = table.assign_handshake(peer);
        table.remove(a);

        assert!(table.get(a).is_none());
        assert!(table.get(b).is_some());

        table.remove_all(&[b]);
        assert!(table.is_empty());
    }
}
