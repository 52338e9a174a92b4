//! Interior index-node encoding.
//!
//! An index node holds `count` `(key, sector)` pairs; `entries[0].key` is
//! never inspected (child 0 covers everything below `entries[1].key`).
//! Like leaves, nodes are decoded into a typed `Vec` view, mutated, and
//! re-encoded.

use byteorder::{ByteOrder, LittleEndian};

use crate::prelude::*;

const HEADER_SIZE: usize = 8; // count: u32 + reserved: u32
const ENTRY_SIZE: usize = 16; // key: u64 + sector: u64

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeEntry {
    pub key: ChunkT,
    pub sector: SectorT,
}

#[derive(Clone, Debug, Default)]
pub struct IndexNode {
    pub entries: Vec<NodeEntry>,
}

impl IndexNode {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return_errno_with_msg!(CorruptState, "index node shorter than header");
        }
        let count = LittleEndian::read_u32(&buf[0..4]) as usize;
        if HEADER_SIZE + count * ENTRY_SIZE > buf.len() {
            return_errno_with_msg!(CorruptState, "index node entry count overruns block");
        }
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = HEADER_SIZE + i * ENTRY_SIZE;
            entries.push(NodeEntry {
                key: LittleEndian::read_u64(&buf[at..at + 8]),
                sector: LittleEndian::read_u64(&buf[at + 8..at + 16]),
            });
        }
        Ok(Self { entries })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if HEADER_SIZE + self.entries.len() * ENTRY_SIZE > buf.len() {
            return_errno_with_msg!(Full, "index node does not fit in block");
        }
        buf.fill(0);
        LittleEndian::write_u32(&mut buf[0..4], self.entries.len() as u32);
        for (i, e) in self.entries.iter().enumerate() {
            let at = HEADER_SIZE + i * ENTRY_SIZE;
            LittleEndian::write_u64(&mut buf[at..at + 8], e.key);
            LittleEndian::write_u64(&mut buf[at + 8..at + 16], e.sector);
        }
        Ok(())
    }

    pub fn capacity(blocksize: usize) -> usize {
        (blocksize - HEADER_SIZE) / ENTRY_SIZE
    }

    /// Finds the child index to descend through for `key`: the last entry
    /// whose key is `<= key` (entry 0's key is never inspected).
    pub fn child_for(&self, key: ChunkT) -> usize {
        // First entry with key > target; the child just before it.
        let pos = self.entries[1..].partition_point(|e| e.key <= key);
        pos
    }

    /// Inserts `(key, sector)` as a new entry at `idx`, shifting the rest up.
    pub fn insert(&mut self, idx: usize, entry: NodeEntry) {
        self.entries.insert(idx, entry);
    }

    /// Splits roughly in half; `self` keeps the lower half, the returned
    /// node holds the upper half along with the key that should be promoted
    /// to the parent.
    pub fn split(&mut self) -> (IndexNode, ChunkT) {
        let half = self.entries.len() / 2;
        let upper = self.entries.split_off(half);
        let promoted_key = upper[0].key;
        (IndexNode { entries: upper }, promoted_key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn payload_bytes(&self) -> usize {
        HEADER_SIZE + self.entries.len() * ENTRY_SIZE
    }

    pub fn freespace(&self, blocksize: usize) -> usize {
        blocksize.saturating_sub(self.payload_bytes())
    }

    /// Removes the entry at `idx`. If it was the node's first entry,
    /// returns the key that must be promoted up the path (the caller's
    /// responsibility per `remove_index`).
    pub fn remove(&mut self, idx: usize) -> NodeEntry {
        self.entries.remove(idx)
    }

    pub fn merge(&mut self, right: &IndexNode) -> Result<()> {
        self.entries.extend_from_slice(&right.entries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut node = IndexNode::new();
        node.insert(0, NodeEntry { key: 0, sector: 10 });
        node.insert(1, NodeEntry { key: 50, sector: 20 });
        node.insert(2, NodeEntry { key: 100, sector: 30 });
        let mut buf = vec![0u8; 256];
        node.encode(&mut buf).unwrap();
        let back = IndexNode::decode(&buf).unwrap();
        assert_eq!(back.entries, node.entries);
    }

    #[test]
    fn child_for_picks_last_entry_not_exceeding_key() {
        let mut node = IndexNode::new();
        node.insert(0, NodeEntry { key: 0, sector: 10 });
        node.insert(1, NodeEntry { key: 50, sector: 20 });
        node.insert(2, NodeEntry { key: 100, sector: 30 });
        assert_eq!(node.child_for(10), 0);
        assert_eq!(node.child_for(50), 1);
        assert_eq!(node.child_for(99), 1);
        assert_eq!(node.child_for(150), 2);
    }
}
