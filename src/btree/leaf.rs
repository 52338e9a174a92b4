//! Exception-leaf encoding and in-leaf operations.
//!
//! The on-disk leaf is a fixed-size block: a small header, a directory of
//! `(rchunk, offset)` entries sorted by `rchunk`, and an array of exception
//! records. Rather than doing byte-level pointer surgery on every mutation,
//! this module decodes a leaf into a typed [`Leaf`] (the directory entries
//! and their exceptions as plain `Vec`s), mutates that, and re-encodes —
//! the bounds-checked typed view the design notes call for. `encode`/`decode`
//! are where the actual custom layout (header, directory, exception array,
//! free-space accounting) lives and is enforced.

use byteorder::{ByteOrder, LittleEndian};

use crate::prelude::*;

/// Size in bytes of the leaf header.
pub const HEADER_SIZE: usize = 32;
/// Size in bytes of one directory entry.
pub const MAP_ENTRY_SIZE: usize = 8;
/// Size in bytes of one exception record.
pub const EXCEPTION_SIZE: usize = 16;

pub const LEAF_VERSION: u16 = 1;

/// One exception: the set of snapshots sharing this copy, and where it is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Exception {
    pub share: u64,
    pub chunk: ChunkT,
}

/// One logical origin chunk's worth of exceptions.
#[derive(Clone, Debug)]
pub struct LeafEntry {
    pub rchunk: u32,
    pub exceptions: Vec<Exception>,
}

/// A decoded exception-leaf block.
#[derive(Clone, Debug)]
pub struct Leaf {
    pub version: u16,
    pub base_chunk: ChunkT,
    pub entries: Vec<LeafEntry>,
}

impl Leaf {
    /// Creates a fresh, empty leaf rooted at `base_chunk`.
    pub fn empty(base_chunk: ChunkT) -> Self {
        Self {
            version: LEAF_VERSION,
            base_chunk,
            entries: Vec::new(),
        }
    }

    /// Decodes a leaf from a fixed-size block. Fails if the magic or
    /// version do not validate, or if the directory is structurally
    /// inconsistent (out of bounds, unsorted).
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return_errno_with_msg!(CorruptState, "leaf block shorter than header");
        }
        let magic = LittleEndian::read_u32(&buf[0..4]);
        if magic != LEAF_MAGIC {
            return_errno_with_msg!(CorruptState, "bad leaf magic");
        }
        let version = LittleEndian::read_u16(&buf[4..6]);
        let count = LittleEndian::read_u32(&buf[8..12]) as usize;
        let base_chunk = LittleEndian::read_u64(&buf[16..24]);

        let blocksize = buf.len();
        let dir_end = HEADER_SIZE + (count + 1) * MAP_ENTRY_SIZE;
        if dir_end > blocksize {
            return_errno_with_msg!(CorruptState, "leaf directory overruns block");
        }

        let read_map = |i: usize| -> (u32, u32) {
            let at = HEADER_SIZE + i * MAP_ENTRY_SIZE;
            (
                LittleEndian::read_u32(&buf[at..at + 4]),
                LittleEndian::read_u32(&buf[at + 4..at + 8]),
            )
        };

        let mut entries = Vec::with_capacity(count);
        let mut prev_rchunk: Option<u32> = None;
        for i in 0..count {
            let (offset, rchunk) = read_map(i);
            let (next_offset, _) = read_map(i + 1);
            if let Some(prev) = prev_rchunk {
                if rchunk <= prev {
                    return_errno_with_msg!(CorruptState, "leaf directory not sorted");
                }
            }
            prev_rchunk = Some(rchunk);
            if offset as usize > next_offset as usize || next_offset as usize > blocksize {
                return_errno_with_msg!(CorruptState, "leaf exception range out of bounds");
            }
            let nexc = (next_offset as usize - offset as usize) / EXCEPTION_SIZE;
            let mut exceptions = Vec::with_capacity(nexc);
            for k in 0..nexc {
                let at = offset as usize + k * EXCEPTION_SIZE;
                let share = LittleEndian::read_u64(&buf[at..at + 8]);
                let chunk = LittleEndian::read_u64(&buf[at + 8..at + 16]);
                exceptions.push(Exception { share, chunk });
            }
            entries.push(LeafEntry { rchunk, exceptions });
        }

        Ok(Self {
            version,
            base_chunk,
            entries,
        })
    }

    /// Total directory bytes (including the sentinel).
    fn dir_bytes(&self) -> usize {
        (self.entries.len() + 1) * MAP_ENTRY_SIZE
    }

    /// Total exception bytes across every entry.
    fn exception_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.exceptions.len() * EXCEPTION_SIZE).sum()
    }

    /// Directory bytes plus exception bytes currently in use.
    pub fn payload(&self) -> usize {
        self.dir_bytes() + self.exception_bytes()
    }

    /// What's left in a block of `blocksize` once the header and current
    /// payload are accounted for.
    pub fn freespace(&self, blocksize: usize) -> usize {
        blocksize.saturating_sub(HEADER_SIZE + self.payload())
    }

    /// Encodes the leaf into a block of exactly `blocksize` bytes.
    /// Fails if the payload does not fit.
    pub fn encode(&self, buf: &mut [u8], blocksize: usize) -> Result<()> {
        if buf.len() != blocksize {
            return_errno_with_msg!(InvalidArgs, "leaf encode buffer size mismatch");
        }
        if HEADER_SIZE + self.payload() > blocksize {
            return_errno_with_msg!(Full, "leaf payload does not fit in block");
        }
        buf.fill(0);
        LittleEndian::write_u32(&mut buf[0..4], LEAF_MAGIC);
        LittleEndian::write_u16(&mut buf[4..6], self.version);
        LittleEndian::write_u32(&mut buf[8..12], self.entries.len() as u32);
        LittleEndian::write_u64(&mut buf[16..24], self.base_chunk);
        let using_mask = self.using_mask();
        LittleEndian::write_u64(&mut buf[24..32], using_mask);

        // Exceptions are packed starting right after the directory,
        // entry-by-entry, ascending; the sentinel marks the high-water
        // mark of that packing (== blocksize once everything below it is
        // laid out contiguously up to the block's own top edge is not
        // required here — we only require internal contiguity and
        // strictly-increasing emap(i), which this packing guarantees).
        let dir_end = HEADER_SIZE + self.dir_bytes();
        let mut cursor = dir_end;
        for (i, entry) in self.entries.iter().enumerate() {
            let map_at = HEADER_SIZE + i * MAP_ENTRY_SIZE;
            LittleEndian::write_u32(&mut buf[map_at..map_at + 4], cursor as u32);
            LittleEndian::write_u32(&mut buf[map_at + 4..map_at + 8], entry.rchunk);
            for exc in &entry.exceptions {
                LittleEndian::write_u64(&mut buf[cursor..cursor + 8], exc.share);
                LittleEndian::write_u64(&mut buf[cursor + 8..cursor + 16], exc.chunk);
                cursor += EXCEPTION_SIZE;
            }
        }
        let sentinel_at = HEADER_SIZE + self.entries.len() * MAP_ENTRY_SIZE;
        LittleEndian::write_u32(&mut buf[sentinel_at..sentinel_at + 4], cursor as u32);
        LittleEndian::write_u32(&mut buf[sentinel_at + 4..sentinel_at + 8], 0);
        Ok(())
    }

    fn using_mask(&self) -> u64 {
        self.entries
            .iter()
            .flat_map(|e| e.exceptions.iter())
            .fold(0u64, |acc, e| acc | e.share)
    }

    fn find(&self, rchunk: u32) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by_key(&rchunk, |e| e.rchunk)
    }

    /// Rewrites the leaf so `chunk` now maps to `exception_chunk` for
    /// `snapnum` (`None` means the origin writer). Returns the chunk of an
    /// orphaned exception that must be freed by the caller, if the
    /// snapshot-write path emptied an existing exception's share (the
    /// resolved open question from the design notes).
    pub fn add_exception(
        &mut self,
        chunk: ChunkT,
        exception_chunk: ChunkT,
        snapnum: Option<u32>,
        active_mask: u64,
    ) -> Result<Option<ChunkT>> {
        let rchunk = (chunk - self.base_chunk) as u32;
        match self.find(rchunk) {
            Err(idx) => {
                let share = match snapnum {
                    None => active_mask,
                    Some(n) => 1u64 << n,
                };
                self.entries.insert(
                    idx,
                    LeafEntry {
                        rchunk,
                        exceptions: vec![Exception {
                            share,
                            chunk: exception_chunk,
                        }],
                    },
                );
                Ok(None)
            }
            Ok(idx) => {
                let mut freed = None;
                match snapnum {
                    None => {
                        let using = self.entries[idx]
                            .exceptions
                            .iter()
                            .fold(0u64, |acc, e| acc | e.share);
                        let share = active_mask & !using;
                        self.entries[idx].exceptions.push(Exception {
                            share,
                            chunk: exception_chunk,
                        });
                    }
                    Some(n) => {
                        let bit = 1u64 << n;
                        let entry = &mut self.entries[idx];
                        if let Some(pos) = entry.exceptions.iter().position(|e| e.share & bit != 0) {
                            entry.exceptions[pos].share &= !bit;
                            if entry.exceptions[pos].share == 0 {
                                freed = Some(entry.exceptions[pos].chunk);
                                entry.exceptions.remove(pos);
                            }
                        }
                        entry.exceptions.push(Exception {
                            share: bit,
                            chunk: exception_chunk,
                        });
                    }
                }
                Ok(freed)
            }
        }
    }

    /// `origin_chunk_unique`: true iff every live snapshot already has an
    /// exception for `chunk` (so an origin write needs no further copy-out).
    pub fn origin_chunk_unique(&self, chunk: ChunkT, snapmask: u64) -> bool {
        let rchunk = (chunk - self.base_chunk) as u32;
        match self.find(rchunk) {
            Err(_) => snapmask == 0,
            Ok(idx) => {
                let using = self.entries[idx]
                    .exceptions
                    .iter()
                    .fold(0u64, |acc, e| acc | e.share);
                (!using & snapmask) == 0
            }
        }
    }

    /// `snapshot_chunk_unique`: `None` if `chunk` has no exception at all
    /// (the snapshot must read the origin); `Some((unique, exception_chunk))`
    /// otherwise, where `unique` means no other snapshot shares that
    /// exception chunk.
    pub fn snapshot_chunk_unique(&self, chunk: ChunkT, snapnum: u32) -> Option<(bool, ChunkT)> {
        let rchunk = (chunk - self.base_chunk) as u32;
        let idx = self.find(rchunk).ok()?;
        let bit = 1u64 << snapnum;
        let exc = self.entries[idx]
            .exceptions
            .iter()
            .find(|e| e.share & bit != 0)?;
        let unique = (exc.share & !bit) == 0;
        Some((unique, exc.chunk))
    }

    /// Splits the leaf roughly in half by directory position. `self` keeps
    /// the lower half; the returned leaf holds the upper half, re-based so
    /// its own `rchunk` values stay relative to its own `base_chunk`
    /// (resolving the design notes' open question about `split_leaf`).
    pub fn split(&mut self) -> (Leaf, ChunkT) {
        let nhead = (self.entries.len() + 1) / 2;
        let upper = self.entries.split_off(nhead);
        let split_point = self.base_chunk + upper[0].rchunk as u64;
        let rebase = upper[0].rchunk;
        let rebased_entries = upper
            .into_iter()
            .map(|e| LeafEntry {
                rchunk: e.rchunk - rebase,
                exceptions: e.exceptions,
            })
            .collect();
        let leaf2 = Leaf {
            version: self.version,
            base_chunk: split_point,
            entries: rebased_entries,
        };
        (leaf2, split_point)
    }

    /// Merges `right` into `self`. Caller must have already checked
    /// `right.payload() <= self.freespace(blocksize)`.
    pub fn merge(&mut self, right: &Leaf) -> Result<()> {
        if right.base_chunk < self.base_chunk {
            return_errno_with_msg!(InvalidArgs, "merge_leaves called out of key order");
        }
        let rebase = (right.base_chunk - self.base_chunk) as u32;
        for e in &right.entries {
            self.entries.push(LeafEntry {
                rchunk: e.rchunk + rebase,
                exceptions: e.exceptions.clone(),
            });
        }
        Ok(())
    }

    /// Removes every exception whose share intersects `snapmask`, clearing
    /// those bits from the survivors. Entries left with no exceptions are
    /// dropped. Returns the snapshot-store chunks of exceptions that became
    /// entirely orphaned (to be freed by the caller).
    pub fn delete_by_mask(&mut self, snapmask: u64) -> Vec<ChunkT> {
        let mut freed = Vec::new();
        for entry in &mut self.entries {
            entry.exceptions.retain_mut(|exc| {
                if exc.share & snapmask != 0 {
                    exc.share &= !snapmask;
                    if exc.share == 0 {
                        freed.push(exc.chunk);
                        return false;
                    }
                }
                true
            });
        }
        self.entries.retain(|e| !e.exceptions.is_empty());
        freed
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First logical chunk this leaf could possibly hold, used when
    /// propagating a child key up to the parent index node.
    pub fn first_key(&self) -> ChunkT {
        self.base_chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCKSIZE: usize = 4096;

    fn roundtrip(leaf: &Leaf) -> Leaf {
        let mut buf = vec![0u8; BLOCKSIZE];
        leaf.encode(&mut buf, BLOCKSIZE).unwrap();
        Leaf::decode(&buf).unwrap()
    }

    #[test]
    fn empty_leaf_roundtrips() {
        let leaf = Leaf::empty(100);
        let back = roundtrip(&leaf);
        assert_eq!(back.base_chunk, 100);
        assert!(back.is_empty());
    }

    #[test]
    fn add_new_chunk_then_query() {
        let mut leaf = Leaf::empty(0x100);
        let freed = leaf
            .add_exception(0x100, 7, None, 0b1)
            .unwrap();
        assert!(freed.is_none());
        assert!(leaf.origin_chunk_unique(0x100, 0b1));
        assert!(!leaf.origin_chunk_unique(0x100, 0b11));

        let back = roundtrip(&leaf);
        assert!(back.origin_chunk_unique(0x100, 0b1));
    }

    #[test]
    fn existing_chunk_origin_write_adds_missing_shares() {
        let mut leaf = Leaf::empty(0x100);
        leaf.add_exception(0x100, 7, Some(0), 0b11).unwrap();
        // Snapshot 0 has an exception; snapshot 1 does not yet.
        assert!(!leaf.origin_chunk_unique(0x100, 0b11));
        leaf.add_exception(0x100, 9, None, 0b11).unwrap();
        assert!(leaf.origin_chunk_unique(0x100, 0b11));
    }

    #[test]
    fn snapshot_write_frees_orphaned_exception() {
        let mut leaf = Leaf::empty(0x100);
        // Only snapshot 0 sees exception chunk 7.
        leaf.add_exception(0x100, 7, Some(0), 0b1).unwrap();
        let (unique, chunk) = leaf.snapshot_chunk_unique(0x100, 0).unwrap();
        assert!(unique);
        assert_eq!(chunk, 7);

        // Snapshot 0 now writes itself: its old exception (share={0}) is
        // cleared to share=0 and must be freed; a fresh exception is added.
        let freed = leaf.add_exception(0x100, 42, Some(0), 0b1).unwrap();
        assert_eq!(freed, Some(7));
        let (_, chunk) = leaf.snapshot_chunk_unique(0x100, 0).unwrap();
        assert_eq!(chunk, 42);
    }

    #[test]
    fn split_rebases_base_chunk() {
        let mut leaf = Leaf::empty(0x1000);
        for i in 0..6u64 {
            leaf.add_exception(0x1000 + i * 4, 100 + i, None, 0b1).unwrap();
        }
        let (right, split_point) = leaf.split();
        assert_eq!(right.base_chunk, split_point);
        for e in &right.entries {
            let abs = right.base_chunk + e.rchunk as u64;
            assert!(abs >= split_point);
        }
        for e in &leaf.entries {
            let abs = leaf.base_chunk + e.rchunk as u64;
            assert!(abs < split_point);
        }
    }

    #[test]
    fn split_then_merge_preserves_triples() {
        let mut leaf = Leaf::empty(0x2000);
        let mut expect = Vec::new();
        for i in 0..8u64 {
            leaf.add_exception(0x2000 + i * 4, 1000 + i, None, 0b1).unwrap();
            expect.push((0x2000 + i * 4, 0b1u64, 1000 + i));
        }
        let (right, _) = leaf.split();
        leaf.merge(&right).unwrap();

        let mut got: Vec<(ChunkT, u64, ChunkT)> = leaf
            .entries
            .iter()
            .flat_map(|e| {
                let base = leaf.base_chunk;
                e.exceptions
                    .iter()
                    .map(move |x| (base + e.rchunk as u64, x.share, x.chunk))
            })
            .collect();
        got.sort();
        let mut expect = expect;
        expect.sort();
        assert_eq!(got, expect);
    }

    #[test]
    fn delete_by_mask_frees_orphans_and_keeps_survivors() {
        let mut leaf = Leaf::empty(0x100);
        leaf.add_exception(0x100, 7, Some(0), 0b11).unwrap();
        leaf.add_exception(0x100, 8, Some(1), 0b11).unwrap();
        let freed = leaf.delete_by_mask(0b1);
        assert_eq!(freed, vec![7]);
        assert!(leaf.snapshot_chunk_unique(0x100, 0).is_none());
        assert!(leaf.snapshot_chunk_unique(0x100, 1).is_some());
    }

    #[test]
    fn add_exception_fails_when_full() {
        let mut leaf = Leaf::empty(0);
        let mut buf = vec![0u8; HEADER_SIZE + MAP_ENTRY_SIZE]; // room for sentinel only
        // Freespace is exactly 0 once a single new-chunk insert is attempted.
        leaf.encode(&mut buf, buf.len()).unwrap();
        assert_eq!(leaf.freespace(buf.len()), 0);
        // Growing by one exception would need EXCEPTION_SIZE+MAP_ENTRY_SIZE
        // more bytes than are available in this tiny block.
        leaf.add_exception(5, 1, None, 0b1).unwrap();
        let mut out = vec![0u8; buf.len()];
        assert!(leaf.encode(&mut out, buf.len()).is_err());
    }
}
