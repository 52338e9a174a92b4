//! Exception logic: the glue between a single client request and the
//! B-tree — deciding whether a chunk needs a fresh copy-out, and, if so,
//! coalescing and issuing the actual bulk data move.

use crate::alloc::{AllocSpace, Allocator, ReclaimPolicy};
use crate::btree::{BTree, TreeRoot};
use crate::cache::{BufferCache, Dev};
use crate::prelude::*;

/// Where a copy-out's source data comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopySource {
    Origin(ChunkT),
    Snapdata(ChunkT),
}

/// One queued copy-out: move one chunk of data from `source` to
/// `dest` on the snapshot-data device.
#[derive(Clone, Copy, Debug)]
pub struct CopyOutJob {
    pub source: CopySource,
    pub dest: ChunkT,
}

/// Buffers up copy-out jobs from a single request and coalesces
/// contiguous runs (same source device, strictly increasing source and
/// dest addresses) into a single read+write, up to `max_run` chunks.
pub struct CopyOutCoalescer {
    jobs: Vec<CopyOutJob>,
    max_run: usize,
}

impl CopyOutCoalescer {
    pub fn new(max_run: usize) -> Self {
        Self {
            jobs: Vec::new(),
            max_run: max_run.max(1),
        }
    }

    pub fn push(&mut self, job: CopyOutJob) {
        self.jobs.push(job);
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn source_dev_and_addr(source: CopySource) -> (Dev, ChunkT) {
        match source {
            CopySource::Origin(c) => (Dev::Origin, c),
            CopySource::Snapdata(c) => (Dev::Snapdata, c),
        }
    }

    /// Issues every queued copy-out, coalescing contiguous runs, then
    /// clears the queue. `chunk_bits` is the snapshot-data chunk size
    /// in bits (`chunksize = 1 << chunk_bits`).
    pub fn flush(&mut self, cache: &BufferCache, chunk_bits: u32) -> Result<()> {
        let chunksize = 1usize << chunk_bits;
        let mut i = 0;
        while i < self.jobs.len() {
            let (dev, start_src) = Self::source_dev_and_addr(self.jobs[i].source);
            let start_dest = self.jobs[i].dest;
            let mut run = 1usize;
            while run < self.max_run && i + run < self.jobs.len() {
                let (next_dev, next_src) = Self::source_dev_and_addr(self.jobs[i + run].source);
                let next_dest = self.jobs[i + run].dest;
                if next_dev != dev
                    || next_src != start_src + run as u64
                    || next_dest != start_dest + run as u64
                {
                    break;
                }
                run += 1;
            }
            let mut buf = vec![0u8; chunksize * run];
            cache.read_raw(dev, &mut buf, start_src * chunksize as u64)?;
            cache.write_raw(Dev::Snapdata, &buf, start_dest * chunksize as u64)?;
            i += run;
        }
        self.jobs.clear();
        Ok(())
    }
}

/// Ensures `chunk` has an exception unique to `snapnum` (`None` = origin
/// writer), allocating and queuing a copy-out if one is needed. Returns
/// the newly allocated snapshot-store chunk, or `None` if the chunk was
/// already unique and no copy-out was necessary.
#[allow(clippy::too_many_arguments)]
pub fn make_unique(
    tree: &BTree,
    root: &mut TreeRoot,
    alloc: &mut Allocator,
    policy: &mut dyn ReclaimPolicy,
    coalescer: &mut CopyOutCoalescer,
    chunk: ChunkT,
    snapnum: Option<u32>,
    active_mask: u64,
) -> Result<Option<ChunkT>> {
    let leaf = tree.lookup(root, chunk)?;

    let existing_exception = match snapnum {
        None => None,
        Some(n) => leaf.snapshot_chunk_unique(chunk, n),
    };

    let already_unique = match snapnum {
        None => leaf.origin_chunk_unique(chunk, active_mask),
        Some(_) => existing_exception.map(|(unique, _)| unique).unwrap_or(false),
    };
    if already_unique {
        return Ok(None);
    }

    let dest = alloc.alloc_chunk(AllocSpace::Snapdata, policy)?;
    let source = match (snapnum, existing_exception) {
        (None, _) => CopySource::Origin(chunk),
        (Some(_), Some((_, exc_chunk))) => CopySource::Snapdata(exc_chunk),
        (Some(_), None) => CopySource::Origin(chunk),
    };
    coalescer.push(CopyOutJob { source, dest });

    match tree.insert(root, alloc, policy, chunk, dest, snapnum, active_mask) {
        Ok(freed) => {
            if let Some(f) = freed {
                alloc.free_chunk(AllocSpace::Snapdata, f);
            }
            Ok(Some(dest))
        }
        Err(e) => {
            alloc.free_chunk(AllocSpace::Snapdata, dest);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{Allocation, NoReclaim};
    use crate::btree::leaf::Leaf;
    use crate::cache::Devices;
    use crate::device::FileDevice;
    use tempfile::NamedTempFile;

    const CHUNKSIZE_BITS: u32 = 12;
    const BLOCKSIZE: usize = 1 << CHUNKSIZE_BITS;

    fn setup() -> (BufferCache, Allocator, NamedTempFile, NamedTempFile) {
        let meta_file = NamedTempFile::new().unwrap();
        meta_file.as_file().set_len(16 * 1024 * 1024).unwrap();
        let snap_file = NamedTempFile::new().unwrap();
        snap_file.as_file().set_len(16 * 1024 * 1024).unwrap();

        let devices = Devices {
            origin: Some(Box::new(FileDevice::open(meta_file.path()).unwrap())),
            snapdata: Box::new(FileDevice::open(snap_file.path()).unwrap()),
            metadata: Box::new(FileDevice::open(meta_file.path()).unwrap()),
        };
        let cache = BufferCache::new(devices, 64);
        let metadata = Allocation::new(1024, 0, 1, CHUNKSIZE_BITS, 4);
        let snapdata = Allocation::new(1024, 0, 1, CHUNKSIZE_BITS, 0);
        (cache, Allocator::new(metadata, snapdata), meta_file, snap_file)
    }

    #[test]
    fn origin_write_to_fresh_chunk_copies_out_once() {
        let (cache, mut alloc, _meta, _snap) = setup();
        let tree = BTree::new(&cache, Dev::Metadata, CHUNKSIZE_BITS);
        let root_chunk = alloc.alloc_chunk(AllocSpace::Metadata, &mut NoReclaim).unwrap();
        let root_sector = root_chunk << (CHUNKSIZE_BITS - 9);
        let buf = cache.get(Dev::Metadata, root_sector, BLOCKSIZE);
        Leaf::empty(0).encode(&mut buf.as_mut_slice(), BLOCKSIZE).unwrap();
        cache.release_dirty(buf);
        let mut root = TreeRoot {
            root_sector,
            levels: 0,
        };
        let mut coalescer = CopyOutCoalescer::new(32);

        let dest = make_unique(&tree, &mut root, &mut alloc, &mut NoReclaim, &mut coalescer, 5, None, 0b1)
            .unwrap();
        assert!(dest.is_some());
        assert!(!coalescer.is_empty());
        coalescer.flush(&cache, CHUNKSIZE_BITS).unwrap();
        assert!(coalescer.is_empty());

        // Second origin write to the same chunk, with the same single live
        // snapshot, is now unique: no further copy-out.
        let again = make_unique(&tree, &mut root, &mut alloc, &mut NoReclaim, &mut coalescer, 5, None, 0b1)
            .unwrap();
        assert!(again.is_none());
        assert!(coalescer.is_empty());
    }
}
