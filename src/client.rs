//! Per-connection client state (§3, "Ambient addition — Client").
//!
//! Not persisted: a client rebuilds its binding by sending `IDENTIFY`
//! again after a reconnect.

use hashbrown::HashSet;

use crate::prelude::*;

/// Set once `IDENTIFY` has been answered successfully.
pub const CLIENT_USING: u32 = 1 << 0;

/// State the dispatch layer keeps for one connected socket.
#[derive(Debug)]
pub struct Client {
    pub id: u64,
    /// `None` while bound to the origin volume; `Some(bit)` once bound to
    /// a live snapshot.
    pub snap: Option<u8>,
    pub flags: u32,
    pub orgsectors: u64,
    pub orgoffset: u64,
    /// Chunks this client currently holds a snapshot-read lock on, so a
    /// disconnect can release them all.
    pub held_chunks: HashSet<ChunkT>,
}

impl Client {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            snap: None,
            flags: 0,
            orgsectors: 0,
            orgoffset: 0,
            held_chunks: HashSet::new(),
        }
    }

    pub fn is_identified(&self) -> bool {
        self.flags & CLIENT_USING != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_client_is_origin_bound_and_unidentified() {
        let c = Client::new(1);
        assert!(c.snap.is_none());
        assert!(!c.is_identified());
    }
}
