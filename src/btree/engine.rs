//! B-tree engine: probe, in-order traversal, insert-with-split, and
//! range-delete.
//!
//! Buffers obtained while walking a path are borrowed from the buffer
//! cache and always released on every exit path (including early returns
//! via `?`), modeled here as a `Vec<Buffer>` path that every fallible
//! helper below is careful to drain through [`BTree::release_path`] before
//! returning an error.

use crate::alloc::{AllocSpace, Allocator, ReclaimPolicy};
use crate::btree::leaf::Leaf;
use crate::btree::node::{IndexNode, NodeEntry};
use crate::cache::{Buffer, BufferCache, Dev};
use crate::prelude::*;

/// The tree's persistent root pointer, owned by the superblock.
#[derive(Clone, Copy, Debug)]
pub struct TreeRoot {
    pub root_sector: SectorT,
    pub levels: u32,
}

/// One step down a probe path: the interior node buffer and which child
/// entry was followed from it.
struct PathEntry {
    buffer: Buffer,
    child_idx: usize,
}

/// The B-tree engine. Borrows the buffer cache and allocator for the
/// duration of a single request; owns no persistent state of its own
/// beyond the chunk-size bits needed to convert chunk addresses to
/// sectors.
pub struct BTree<'a> {
    pub cache: &'a BufferCache,
    pub dev: Dev,
    pub chunksize_bits: u32,
    pub blocksize: usize,
}

impl<'a> BTree<'a> {
    pub fn new(cache: &'a BufferCache, dev: Dev, chunksize_bits: u32) -> Self {
        let blocksize = 1usize << chunksize_bits;
        Self {
            cache,
            dev,
            chunksize_bits,
            blocksize,
        }
    }

    fn chunk_to_sector(&self, chunk: ChunkT) -> SectorT {
        chunk << (self.chunksize_bits - 9)
    }

    fn read_node(&self, sector: SectorT) -> Result<(Buffer, IndexNode)> {
        let buf = self.cache.read(self.dev, sector, self.blocksize)?;
        let node = IndexNode::decode(&buf.as_slice())?;
        Ok((buf, node))
    }

    fn read_leaf(&self, sector: SectorT) -> Result<(Buffer, Leaf)> {
        let buf = self.cache.read(self.dev, sector, self.blocksize)?;
        let leaf = Leaf::decode(&buf.as_slice())?;
        Ok((buf, leaf))
    }

    fn release_all(&self, path: Vec<PathEntry>) {
        for entry in path {
            self.cache.release(entry.buffer);
        }
    }

    /// Walks from the root to the leaf that would contain `chunk`. Returns
    /// the interior path (outermost first) and the leaf buffer/value.
    /// Releases everything held so far and returns the error on any read
    /// failure.
    fn probe(&self, root: &TreeRoot, chunk: ChunkT) -> Result<(Vec<PathEntry>, Buffer, Leaf)> {
        let mut path = Vec::with_capacity(root.levels as usize);
        let mut sector = root.root_sector;
        for _ in 0..root.levels {
            match self.read_node(sector) {
                Ok((buf, node)) => {
                    let child_idx = node.child_for(chunk);
                    let next_sector = node.entries[child_idx].sector;
                    path.push(PathEntry {
                        buffer: buf,
                        child_idx,
                    });
                    sector = next_sector;
                }
                Err(e) => {
                    self.release_all(path);
                    return Err(e);
                }
            }
        }
        match self.read_leaf(sector) {
            Ok((buf, leaf)) => Ok((path, buf, leaf)),
            Err(e) => {
                self.release_all(path);
                Err(e)
            }
        }
    }

    /// Public probe entry point: returns the leaf's decoded value and
    /// releases every buffer (including the leaf) before returning, since
    /// most callers only need a read-only query.
    pub fn lookup(&self, root: &TreeRoot, chunk: ChunkT) -> Result<Leaf> {
        let (path, leaf_buf, leaf) = self.probe(root, chunk)?;
        self.cache.release(leaf_buf);
        self.release_all(path);
        Ok(leaf)
    }

    fn alloc_metadata_sector(&self, alloc: &mut Allocator, policy: &mut dyn ReclaimPolicy) -> Result<SectorT> {
        let chunk = alloc.alloc_chunk(AllocSpace::Metadata, policy)?;
        Ok(self.chunk_to_sector(chunk))
    }

    /// Inserts `(chunk, exception_chunk)` for `snapnum` (`None` = origin
    /// writer), splitting leaves/nodes and growing the tree as needed.
    /// Returns a chunk that was orphaned by the insert (see the leaf
    /// module's resolved open question) for the caller to free.
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &self,
        root: &mut TreeRoot,
        alloc: &mut Allocator,
        policy: &mut dyn ReclaimPolicy,
        chunk: ChunkT,
        exception_chunk: ChunkT,
        snapnum: Option<u32>,
        active_mask: u64,
    ) -> Result<Option<ChunkT>> {
        let (mut path, leaf_buf, mut leaf) = self.probe(root, chunk)?;

        const MAX_SPLIT_RETRIES: u32 = 2;
        let mut retries = 0;
        let (freed, carry) = loop {
            match leaf.add_exception(chunk, exception_chunk, snapnum, active_mask) {
                Ok(freed) => break (freed, None),
                Err(e) if e.errno() == Full => {
                    if retries >= MAX_SPLIT_RETRIES {
                        self.cache.release(leaf_buf);
                        self.release_all(path);
                        return_errno_with_msg!(
                            Full,
                            "leaf cannot accept exception even after repeated splits"
                        );
                    }
                    retries += 1;
                    let (right, split_point) = leaf.split();
                    let right_sector = match self.alloc_metadata_sector(alloc, policy) {
                        Ok(s) => s,
                        Err(e) => {
                            self.cache.release(leaf_buf);
                            self.release_all(path);
                            return Err(e);
                        }
                    };
                    let right_buf = self.cache.get(self.dev, right_sector, self.blocksize);
                    let mut right = right;
                    let use_right = chunk >= split_point;
                    // Encode whichever half we are not continuing to mutate,
                    // then keep going with the half that covers `chunk`.
                    if use_right {
                        if let Err(e) = leaf.encode(&mut leaf_buf.as_mut_slice(), self.blocksize) {
                            self.cache.release(leaf_buf);
                            self.cache.release(right_buf);
                            self.release_all(path);
                            return Err(e);
                        }
                        self.cache.release_dirty(leaf_buf);
                        std::mem::swap(&mut leaf, &mut right);
                        // `leaf` now holds the (former) right half; its
                        // buffer is `right_buf`.
                        let carry = (right_sector, split_point);
                        return self.finish_insert_with_carry(
                            path, right_buf, leaf, chunk, exception_chunk, snapnum, active_mask,
                            alloc, policy, root, carry,
                        );
                    } else {
                        if let Err(e) = right.encode(&mut right_buf.as_mut_slice(), self.blocksize) {
                            self.cache.release(leaf_buf);
                            self.cache.release(right_buf);
                            self.release_all(path);
                            return Err(e);
                        }
                        self.cache.release_dirty(right_buf);
                        let carry_key = split_point;
                        break (None, Some((right_sector, carry_key)));
                    }
                }
                Err(e) => {
                    self.cache.release(leaf_buf);
                    self.release_all(path);
                    return Err(e);
                }
            }
        };

        if let Err(e) = leaf.encode(&mut leaf_buf.as_mut_slice(), self.blocksize) {
            self.cache.release(leaf_buf);
            self.release_all(path);
            return Err(e);
        }
        self.cache.release_dirty(leaf_buf);

        if let Some((sibling_sector, sibling_key)) = carry {
            self.propagate_carry(root, alloc, policy, path, sibling_sector, sibling_key)?;
        } else {
            self.release_all(path);
        }
        Ok(freed)
    }

    /// Helper used only when the split chose to continue mutating the
    /// *right* sibling: finishes the add_exception retry loop against
    /// `leaf`/`leaf_buf` (now the right half) and then propagates the
    /// left-vs-right carry up the path.
    #[allow(clippy::too_many_arguments)]
    fn finish_insert_with_carry(
        &self,
        path: Vec<PathEntry>,
        mut leaf_buf: Buffer,
        mut leaf: Leaf,
        chunk: ChunkT,
        exception_chunk: ChunkT,
        snapnum: Option<u32>,
        active_mask: u64,
        alloc: &mut Allocator,
        policy: &mut dyn ReclaimPolicy,
        root: &mut TreeRoot,
        carry: (SectorT, ChunkT),
    ) -> Result<Option<ChunkT>> {
        const MAX_SPLIT_RETRIES: u32 = 2;
        let mut retries = 0;
        let freed = loop {
            match leaf.add_exception(chunk, exception_chunk, snapnum, active_mask) {
                Ok(freed) => break freed,
                Err(e) if e.errno() == Full && retries < MAX_SPLIT_RETRIES => {
                    retries += 1;
                    let (right, split_point) = leaf.split();
                    let right_sector = self.alloc_metadata_sector(alloc, policy).map_err(|e| {
                        self.cache.release(leaf_buf.clone());
                        self.release_all_ref(&path);
                        e
                    })?;
                    let right_buf = self.cache.get(self.dev, right_sector, self.blocksize);
                    let use_right = chunk >= split_point;
                    if use_right {
                        leaf.encode(&mut leaf_buf.as_mut_slice(), self.blocksize)?;
                        self.cache.release_dirty(leaf_buf);
                        leaf_buf = right_buf;
                        leaf = right;
                    } else {
                        let mut r = right;
                        r.encode(&mut right_buf.as_mut_slice(), self.blocksize)?;
                        self.cache.release_dirty(right_buf);
                        // second-level split carries both up; extremely
                        // rare in practice (single-chunk fan-out pathology)
                        // and handled by surfacing a capacity error instead
                        // of chaining multiple carries.
                        self.cache.release(leaf_buf);
                        self.release_all(path);
                        return_errno_with_msg!(
                            Full,
                            "double split while inserting a single exception is unsupported"
                        );
                    }
                }
                Err(e) => {
                    self.cache.release(leaf_buf);
                    self.release_all(path);
                    return Err(e);
                }
            }
        };
        leaf.encode(&mut leaf_buf.as_mut_slice(), self.blocksize)?;
        self.cache.release_dirty(leaf_buf);
        self.propagate_carry(root, alloc, policy, path, carry.0, carry.1)?;
        Ok(freed)
    }

    fn release_all_ref(&self, path: &[PathEntry]) {
        for entry in path {
            self.cache.release(entry.buffer.clone());
        }
    }

    /// Propagates a new-sibling carry up through the interior path,
    /// splitting nodes as needed and growing the tree's root if the carry
    /// reaches the top.
    fn propagate_carry(
        &self,
        root: &mut TreeRoot,
        alloc: &mut Allocator,
        policy: &mut dyn ReclaimPolicy,
        mut path: Vec<PathEntry>,
        mut sibling_sector: SectorT,
        mut sibling_key: ChunkT,
    ) -> Result<()> {
        while let Some(entry) = path.pop() {
            let mut node = IndexNode::decode(&entry.buffer.as_slice())?;
            let capacity = IndexNode::capacity(self.blocksize);
            if node.len() < capacity {
                node.insert(
                    entry.child_idx + 1,
                    NodeEntry {
                        key: sibling_key,
                        sector: sibling_sector,
                    },
                );
                node.encode(&mut entry.buffer.as_mut_slice())?;
                self.cache.release_dirty(entry.buffer.clone());
                self.release_all_ref(&path);
                return Ok(());
            }
            // Insert first (temporarily over capacity), then split in half
            // so the new sibling carries the correct set of entries.
            node.insert(
                entry.child_idx + 1,
                NodeEntry {
                    key: sibling_key,
                    sector: sibling_sector,
                },
            );
            let (right, promoted_key) = node.split();
            node.encode(&mut entry.buffer.as_mut_slice())?;
            self.cache.release_dirty(entry.buffer.clone());

            let right_sector = self.alloc_metadata_sector(alloc, policy)?;
            let right_buf = self.cache.get(self.dev, right_sector, self.blocksize);
            right.encode(&mut right_buf.as_mut_slice())?;
            self.cache.release_dirty(right_buf);

            sibling_sector = right_sector;
            sibling_key = promoted_key;
        }

        // Carry reached past the root: grow the tree by one level.
        let new_root_sector = self.alloc_metadata_sector(alloc, policy)?;
        let mut new_root = IndexNode::new();
        new_root.insert(
            0,
            NodeEntry {
                key: 0,
                sector: root.root_sector,
            },
        );
        new_root.insert(
            1,
            NodeEntry {
                key: sibling_key,
                sector: sibling_sector,
            },
        );
        let buf = self.cache.get(self.dev, new_root_sector, self.blocksize);
        new_root.encode(&mut buf.as_mut_slice())?;
        self.cache.release_dirty(buf);
        root.root_sector = new_root_sector;
        root.levels += 1;
        Ok(())
    }

    /// The key that starts the next leaf to the right of the one `path`
    /// leads to, found structurally (the nearest ancestor with an
    /// unvisited next child), not by inspecting the leaf's own contents.
    /// `None` means the probed leaf was the rightmost one in the tree.
    /// Relying on the leaf's own last entry to find this would break as
    /// soon as a leaf is emptied by a range-delete but not yet dropped
    /// from the tree.
    fn leaf_upper_bound(&self, path: &[PathEntry]) -> Result<Option<ChunkT>> {
        for entry in path.iter().rev() {
            let node = IndexNode::decode(&entry.buffer.as_slice())?;
            if entry.child_idx + 1 < node.entries.len() {
                return Ok(Some(node.entries[entry.child_idx + 1].key));
            }
        }
        Ok(None)
    }

    fn sector_to_metadata_chunk(&self, sector: SectorT) -> ChunkT {
        sector >> (self.chunksize_bits - 9)
    }

    /// Frees a metadata block that is no longer referenced by the tree:
    /// drops it from the buffer cache (so a later allocation of the same
    /// chunk doesn't hand back stale cached content) and returns its chunk
    /// to the metadata allocation space.
    fn free_metadata_block(&self, alloc: &mut Allocator, buf: Buffer) {
        let sector = buf.sector();
        self.cache.release(buf.clone());
        self.cache.evict(&buf);
        alloc.free_chunk(AllocSpace::Metadata, self.sector_to_metadata_chunk(sector));
    }

    /// In-order traversal from `start_chunk` (or the leftmost leaf if
    /// `max_leaves == 0`). `visit` is called once per leaf with its
    /// decoded value; if it returns `Some(leaf)` the leaf is re-encoded
    /// and marked dirty (mutating traversals like `delete_tree_range` use
    /// this; read-only ones like `STATUS`/`STREAM_CHANGELIST` return
    /// `None`).
    pub fn traverse<F>(&self, root: &TreeRoot, start_chunk: ChunkT, max_leaves: usize, mut visit: F) -> Result<()>
    where
        F: FnMut(&Leaf) -> Option<Leaf>,
    {
        let mut chunk = if max_leaves > 0 { start_chunk } else { 0 };
        let mut visited = 0usize;
        loop {
            let (path, leaf_buf, leaf) = self.probe(root, chunk)?;
            let next_chunk = self.leaf_upper_bound(&path)?;
            self.release_all(path);

            if let Some(updated) = visit(&leaf) {
                updated.encode(&mut leaf_buf.as_mut_slice(), self.blocksize)?;
                self.cache.release_dirty(leaf_buf);
            } else {
                self.cache.release(leaf_buf);
            }
            visited += 1;
            if max_leaves > 0 && visited >= max_leaves {
                break;
            }
            match next_chunk {
                Some(c) => chunk = c,
                None => break,
            }
        }
        Ok(())
    }

    /// Shifts `entries[pnext..count]` left by one in the leaf's immediate
    /// parent (the deepest entry of `path`) and, if the removed entry was
    /// its node's first, promotes the new first entry's key up the path to
    /// the nearest ancestor whose own `pnext` is not position 0 (entries at
    /// position 0 don't carry a meaningful key of their own).
    fn remove_index(&self, mut path: Vec<PathEntry>) -> Result<()> {
        let Some(parent) = path.pop() else {
            return Ok(());
        };
        let mut node = IndexNode::decode(&parent.buffer.as_slice())?;
        let idx = parent.child_idx;
        node.remove(idx);
        let mut promote = if idx == 0 { node.entries.first().map(|e| e.key) } else { None };
        node.encode(&mut parent.buffer.as_mut_slice())?;
        self.cache.release_dirty(parent.buffer);

        while let Some(key) = promote {
            let Some(ancestor) = path.pop() else { break };
            if ancestor.child_idx == 0 {
                // This ancestor's own position carries no meaningful key
                // either; keep looking further up without touching it.
                self.cache.release(ancestor.buffer);
                continue;
            }
            let mut anc_node = IndexNode::decode(&ancestor.buffer.as_slice())?;
            anc_node.entries[ancestor.child_idx].key = key;
            anc_node.encode(&mut ancestor.buffer.as_mut_slice())?;
            self.cache.release_dirty(ancestor.buffer);
            promote = None;
        }
        self.release_all(path);
        Ok(())
    }

    /// Merges adjacent same-parent interior-node siblings below `sector`,
    /// bottom-up. `levels_below` is the number of interior levels strictly
    /// below `sector` before leaves are reached (0 once `sector`'s own
    /// children are leaves, in which case there is nothing to do here —
    /// leaf merging already happened during the range-delete walk).
    fn compact_children(&self, sector: SectorT, levels_below: u32, alloc: &mut Allocator) -> Result<()> {
        if levels_below == 0 {
            return Ok(());
        }
        let (buf, mut node) = self.read_node(sector)?;
        let children: Vec<SectorT> = node.entries.iter().map(|e| e.sector).collect();
        for child in children {
            self.compact_children(child, levels_below - 1, alloc)?;
        }

        let mut i = 0;
        while i + 1 < node.entries.len() {
            let left_sector = node.entries[i].sector;
            let right_sector = node.entries[i + 1].sector;
            let (left_buf, mut left_node) = self.read_node(left_sector)?;
            let (right_buf, right_node) = self.read_node(right_sector)?;
            if right_node.payload_bytes() <= left_node.freespace(self.blocksize) {
                left_node.merge(&right_node)?;
                left_node.encode(&mut left_buf.as_mut_slice())?;
                self.cache.release_dirty(left_buf);
                self.free_metadata_block(alloc, right_buf);
                node.remove(i + 1);
            } else {
                self.cache.release(left_buf);
                self.cache.release(right_buf);
                i += 1;
            }
        }
        node.encode(&mut buf.as_mut_slice())?;
        self.cache.release_dirty(buf);
        Ok(())
    }

    /// Merges interior-node siblings bottom-up (see [`Self::compact_children`])
    /// and then drops tree levels while the root has a single child.
    fn compact_interior(&self, root: &mut TreeRoot, alloc: &mut Allocator) -> Result<()> {
        if root.levels > 0 {
            self.compact_children(root.root_sector, root.levels - 1, alloc)?;
        }
        while root.levels > 0 {
            let (buf, node) = self.read_node(root.root_sector)?;
            if node.entries.len() != 1 {
                self.cache.release(buf);
                break;
            }
            let only_child = node.entries[0].sector;
            self.free_metadata_block(alloc, buf);
            root.root_sector = only_child;
            root.levels -= 1;
        }
        Ok(())
    }

    /// Removes every exception whose share intersects `snapmask` across
    /// the whole tree, freeing each orphaned snapshot-data chunk as it
    /// goes. A leaf left empty (or merely sparse) by the deletion is
    /// folded into the previous surviving leaf whenever it fits
    /// (`payload(this) <= freespace(prev)`), its own metadata block freed
    /// and its entry removed from the tree via [`Self::remove_index`].
    /// Once every leaf has been visited, interior-node siblings are
    /// compacted the same way and the tree's level count is dropped while
    /// the root has a single child. `on_commit` is invoked whenever the
    /// caller should flush an intermediate transaction (dirty buffer count
    /// threshold reached).
    pub fn delete_range<F>(
        &self,
        root: &mut TreeRoot,
        alloc: &mut Allocator,
        snapmask: u64,
        mut on_commit: F,
    ) -> Result<Vec<ChunkT>>
    where
        F: FnMut() -> Result<()>,
    {
        let mut freed_all = Vec::new();
        let mut chunk = 0u64;
        // The most recently retained (not merged away) leaf, kept around
        // so the next leaf visited can be folded into it if it fits.
        let mut prev: Option<(SectorT, Leaf)> = None;

        loop {
            let (path, leaf_buf, mut leaf) = self.probe(root, chunk)?;
            let leaf_sector = leaf_buf.sector();

            let freed = leaf.delete_by_mask(snapmask);
            for c in &freed {
                alloc.free_chunk(AllocSpace::Snapdata, *c);
            }
            freed_all.extend(freed);

            // Computed from tree structure, not leaf contents, so an
            // emptied (but not yet removed) leaf never stalls the walk.
            let next_chunk = self.leaf_upper_bound(&path)?;

            let fits_prev = match &prev {
                Some((_, prev_leaf)) => leaf.payload() <= prev_leaf.freespace(self.blocksize),
                None => false,
            };

            if fits_prev {
                let (prev_sector, prev_leaf) = prev.as_mut().expect("fits_prev implies prev is Some");
                prev_leaf.merge(&leaf)?;
                let prev_buf = self.cache.get(self.dev, *prev_sector, self.blocksize);
                prev_leaf.encode(&mut prev_buf.as_mut_slice(), self.blocksize)?;
                self.cache.release_dirty(prev_buf);
                self.free_metadata_block(alloc, leaf_buf);
                self.remove_index(path)?;
            } else {
                leaf.encode(&mut leaf_buf.as_mut_slice(), self.blocksize)?;
                self.cache.release_dirty(leaf_buf);
                self.release_all(path);
                prev = Some((leaf_sector, leaf));
            }

            on_commit()?;

            match next_chunk {
                Some(c) => chunk = c,
                None => break,
            }
        }

        self.compact_interior(root, alloc)?;
        Ok(freed_all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{Allocation, NoReclaim};
    use crate::cache::Devices;
    use crate::device::FileDevice;
    use tempfile::NamedTempFile;

    const CHUNKSIZE_BITS: u32 = 12; // 4096-byte chunks
    const BLOCKSIZE: usize = 1 << CHUNKSIZE_BITS;

    fn setup() -> (BufferCache, Allocator) {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(64 * 1024 * 1024).unwrap();
        let dev = FileDevice::open(file.path()).unwrap();
        let devices = Devices {
            origin: None,
            snapdata: Box::new(FileDevice::open(file.path()).unwrap()),
            metadata: Box::new(dev),
        };
        let cache = BufferCache::new(devices, 64);
        let metadata = Allocation::new(1024, 0, 1, CHUNKSIZE_BITS, 4);
        let snapdata = Allocation::new(1024, 0, 1, CHUNKSIZE_BITS, 0);
        (cache, Allocator::new(metadata, snapdata))
    }

    #[test]
    fn insert_and_lookup_roundtrip() {
        let (cache, mut alloc) = setup();
        let tree = BTree::new(&cache, Dev::Metadata, CHUNKSIZE_BITS);
        let root_chunk = alloc
            .alloc_chunk(AllocSpace::Metadata, &mut NoReclaim)
            .unwrap();
        let root_sector = root_chunk << (CHUNKSIZE_BITS - 9);
        let buf = cache.get(Dev::Metadata, root_sector, BLOCKSIZE);
        Leaf::empty(0).encode(&mut buf.as_mut_slice(), BLOCKSIZE).unwrap();
        cache.release_dirty(buf);
        let mut root = TreeRoot {
            root_sector,
            levels: 0,
        };

        tree.insert(&mut root, &mut alloc, &mut NoReclaim, 10, 777, None, 0b1)
            .unwrap();

        let leaf = tree.lookup(&root, 10).unwrap();
        assert!(leaf.origin_chunk_unique(10, 0b1));
    }

    #[test]
    fn many_inserts_force_leaf_and_node_splits() {
        let (cache, mut alloc) = setup();
        let tree = BTree::new(&cache, Dev::Metadata, CHUNKSIZE_BITS);
        let root_chunk = alloc
            .alloc_chunk(AllocSpace::Metadata, &mut NoReclaim)
            .unwrap();
        let root_sector = root_chunk << (CHUNKSIZE_BITS - 9);
        let buf = cache.get(Dev::Metadata, root_sector, BLOCKSIZE);
        Leaf::empty(0).encode(&mut buf.as_mut_slice(), BLOCKSIZE).unwrap();
        cache.release_dirty(buf);
        let mut root = TreeRoot {
            root_sector,
            levels: 0,
        };

        for i in 0..400u64 {
            tree.insert(&mut root, &mut alloc, &mut NoReclaim, i * 4, 1000 + i, None, 0b1)
                .unwrap();
        }
        assert!(root.levels >= 1, "expected at least one node split to have grown the tree");

        for i in 0..400u64 {
            let leaf = tree.lookup(&root, i * 4).unwrap();
            assert!(leaf.origin_chunk_unique(i * 4, 0b1), "missing exception for chunk {i}");
        }
    }

    /// An interior (non-last) leaf emptied out-of-band, without going
    /// through `remove_index`, must not stop `traverse` from reaching the
    /// leaves structurally to its right — the walk has to follow the tree,
    /// not the emptied leaf's own (empty) contents.
    #[test]
    fn traverse_does_not_stall_on_an_emptied_interior_leaf() {
        let (cache, mut alloc) = setup();
        let tree = BTree::new(&cache, Dev::Metadata, CHUNKSIZE_BITS);
        let root_chunk = alloc
            .alloc_chunk(AllocSpace::Metadata, &mut NoReclaim)
            .unwrap();
        let root_sector = root_chunk << (CHUNKSIZE_BITS - 9);
        let buf = cache.get(Dev::Metadata, root_sector, BLOCKSIZE);
        Leaf::empty(0).encode(&mut buf.as_mut_slice(), BLOCKSIZE).unwrap();
        cache.release_dirty(buf);
        let mut root = TreeRoot {
            root_sector,
            levels: 0,
        };

        for i in 0..400u64 {
            tree.insert(&mut root, &mut alloc, &mut NoReclaim, i * 4, 1000 + i, None, 0b1)
                .unwrap();
        }
        assert!(root.levels >= 1, "expected the tree to have grown past a single leaf");

        // Find an interior leaf (not the first, not the last) and empty it
        // directly, bypassing remove_index, to simulate a leaf left behind
        // sparse/empty by a deletion that did not (or could not) merge it
        // into a neighbor.
        let (path, leaf_buf, leaf) = tree.probe(&root, 200 * 4).unwrap();
        let base = leaf.base_chunk;
        assert_ne!(base, 0, "expected a leaf strictly after the first one");
        Leaf::empty(base)
            .encode(&mut leaf_buf.as_mut_slice(), BLOCKSIZE)
            .unwrap();
        cache.release_dirty(leaf_buf);
        tree.release_all(path);

        let mut visited_leaves = 0usize;
        let mut saw_chunk_past_the_emptied_leaf = false;
        tree.traverse(&root, 0, 0, |l| {
            visited_leaves += 1;
            if l.entries.iter().any(|e| l.base_chunk + u64::from(e.rchunk) > 399 * 4) {
                saw_chunk_past_the_emptied_leaf = true;
            }
            None
        })
        .unwrap();

        assert!(
            visited_leaves >= 3,
            "expected to walk past the emptied leaf into later leaves, only visited {visited_leaves}"
        );
        assert!(
            saw_chunk_past_the_emptied_leaf,
            "STREAM_CHANGELIST-style traversal must still see leaves after an emptied interior one"
        );
    }

    /// `delete_range` clearing every exception across a multi-leaf,
    /// multi-level tree must merge the emptied leaves/nodes back together
    /// and drop the tree to a single root leaf, freeing every metadata
    /// chunk the deleted leaves/nodes occupied — not just the snapdata
    /// chunks the exceptions pointed at.
    #[test]
    fn delete_range_merges_leaves_and_nodes_and_drops_levels() {
        let (cache, mut alloc) = setup();
        let tree = BTree::new(&cache, Dev::Metadata, CHUNKSIZE_BITS);
        let root_chunk = alloc
            .alloc_chunk(AllocSpace::Metadata, &mut NoReclaim)
            .unwrap();
        let root_sector = root_chunk << (CHUNKSIZE_BITS - 9);
        let buf = cache.get(Dev::Metadata, root_sector, BLOCKSIZE);
        Leaf::empty(0).encode(&mut buf.as_mut_slice(), BLOCKSIZE).unwrap();
        cache.release_dirty(buf);
        let mut root = TreeRoot {
            root_sector,
            levels: 0,
        };

        for i in 0..400u64 {
            tree.insert(&mut root, &mut alloc, &mut NoReclaim, i * 4, 2000 + i, None, 0b1)
                .unwrap();
        }
        assert!(root.levels >= 1, "expected the tree to have grown past a single leaf");
        let metadata_chunks_in_use_before = alloc.space(AllocSpace::Metadata).bitmap().count_ones();

        let freed = tree
            .delete_range(&mut root, &mut alloc, 0b1, || Ok(()))
            .unwrap();
        assert_eq!(freed.len(), 400, "every exception's snapdata chunk should be freed");

        assert_eq!(root.levels, 0, "the tree should have collapsed back to a single leaf");
        let remaining = tree.lookup(&root, 0).unwrap();
        assert!(remaining.is_empty(), "the surviving leaf should hold no exceptions");

        let metadata_chunks_in_use_after = alloc.space(AllocSpace::Metadata).bitmap().count_ones();
        assert_eq!(
            metadata_chunks_in_use_after, 1,
            "every leaf/node chunk but the final root leaf should have been freed, was using {metadata_chunks_in_use_before} before"
        );
    }
}
