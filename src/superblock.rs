//! Superblock image persistence and server lifecycle.
//!
//! The superblock is the single root of trust for the whole store: it
//! names the journal and B-tree locations, both allocator descriptors,
//! and the live snapshot list. It is read once at startup and written
//! back (outside the journal) only at `save_state`/clean shutdown; all
//! other mutations ride along inside ordinary journal commits because
//! the superblock's own sector is itself just another dirty metadata
//! buffer during normal operation.

use byteorder::{ByteOrder, LittleEndian};

use crate::alloc::{AllocSpace, Allocation, Allocator};
use crate::bitmap::BitMap;
use crate::btree::TreeRoot;
use crate::cache::{BufferCache, Dev};
use crate::journal::Journal;
use crate::prelude::*;

const SB_VERSION: u16 = 1;
const SNAPSHOT_STRIDE: usize = 24; // padded, byte-aligned record size on disk

/// One live snapshot entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub tag: u32,
    pub bit: u8,
    pub ctime: u64,
    pub prio: i8,
    pub usecnt: u32,
}

/// On-disk descriptor for one allocation space, excluding the bitmap
/// itself (which lives in its own reserved sectors).
#[derive(Clone, Copy, Debug)]
pub struct AllocDesc {
    pub chunks: u64,
    pub bitmap_base_sector: SectorT,
    pub bitmap_blocks: u64,
    pub allocsize_bits: u32,
    pub last_alloc: u64,
}

/// The persisted superblock image.
#[derive(Clone, Debug)]
pub struct SuperBlock {
    pub create_time: u64,
    pub origin_size: u64,
    pub origin_offset: u64,
    pub journal: Journal,
    pub root: TreeRoot,
    pub metadata_desc: AllocDesc,
    pub snapdata_desc: AllocDesc,
    pub meta_chunks_used: u64,
    pub snap_chunks_used: u64,
    pub busy: bool,
    pub snapshots: Vec<Snapshot>,
}

impl SuperBlock {
    pub fn active_mask(&self) -> u64 {
        self.snapshots.iter().fold(0u64, |acc, s| acc | (1u64 << s.bit))
    }

    pub fn find_by_tag(&self, tag: u32) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.tag == tag)
    }

    pub fn lowest_free_bit(&self) -> Option<u8> {
        let used = self.active_mask();
        (0..MAX_SNAPSHOTS as u8).find(|&b| used & (1u64 << b) == 0)
    }

    pub fn add_snapshot(&mut self, tag: u32, ctime: u64) -> Result<u8> {
        if self.find_by_tag(tag).is_some() {
            return_errno_with_msg!(DuplicateTag, "snapshot tag already in use");
        }
        let bit = self
            .lowest_free_bit()
            .ok_or_else(|| Error::with_msg(TooManySnapshots, "maximum live snapshot count reached"))?;
        self.snapshots.push(Snapshot {
            tag,
            bit,
            ctime,
            prio: 0,
            usecnt: 0,
        });
        Ok(bit)
    }

    pub fn remove_snapshot(&mut self, tag: u32) -> Result<Snapshot> {
        let idx = self
            .snapshots
            .iter()
            .position(|s| s.tag == tag)
            .ok_or_else(|| Error::with_msg(NotFound, "no such snapshot tag"))?;
        Ok(self.snapshots.remove(idx))
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        let needed = HEADER_FIXED_SIZE + self.snapshots.len() * SNAPSHOT_STRIDE;
        if needed > buf.len() {
            return_errno_with_msg!(InvalidArgs, "superblock image does not fit in block");
        }
        buf.fill(0);
        LittleEndian::write_u32(&mut buf[0..4], SB_MAGIC);
        LittleEndian::write_u16(&mut buf[4..6], SB_VERSION);
        buf[6] = self.busy as u8;
        LittleEndian::write_u64(&mut buf[8..16], self.create_time);
        LittleEndian::write_u64(&mut buf[16..24], self.origin_size);
        LittleEndian::write_u64(&mut buf[24..32], self.origin_offset);

        LittleEndian::write_u64(&mut buf[32..40], self.journal.base_sector);
        LittleEndian::write_u64(&mut buf[40..48], self.journal.size);
        LittleEndian::write_u64(&mut buf[48..56], self.journal.next);
        LittleEndian::write_i32(&mut buf[56..60], self.journal.sequence);
        LittleEndian::write_u32(&mut buf[60..64], self.journal.chunk_bits);

        LittleEndian::write_u64(&mut buf[64..72], self.root.root_sector);
        LittleEndian::write_u32(&mut buf[72..76], self.root.levels);

        encode_alloc_desc(&self.metadata_desc, &mut buf[80..120]);
        encode_alloc_desc(&self.snapdata_desc, &mut buf[120..160]);

        LittleEndian::write_u64(&mut buf[160..168], self.meta_chunks_used);
        LittleEndian::write_u64(&mut buf[168..176], self.snap_chunks_used);

        LittleEndian::write_u32(&mut buf[176..180], self.snapshots.len() as u32);
        for (i, s) in self.snapshots.iter().enumerate() {
            let at = HEADER_FIXED_SIZE + i * SNAPSHOT_STRIDE;
            LittleEndian::write_u32(&mut buf[at..at + 4], s.tag);
            buf[at + 4] = s.bit;
            LittleEndian::write_u64(&mut buf[at + 8..at + 16], s.ctime);
            buf[at + 16] = s.prio as u8;
            LittleEndian::write_u32(&mut buf[at + 17..at + 21], s.usecnt);
        }
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_FIXED_SIZE {
            return_errno_with_msg!(CorruptState, "superblock block shorter than header");
        }
        let magic = LittleEndian::read_u32(&buf[0..4]);
        if magic != SB_MAGIC {
            return_errno_with_msg!(CorruptState, "bad superblock magic");
        }
        let version = LittleEndian::read_u16(&buf[4..6]);
        if version != SB_VERSION {
            return_errno_with_msg!(CorruptState, "unsupported superblock version");
        }
        let busy = buf[6] != 0;
        let create_time = LittleEndian::read_u64(&buf[8..16]);
        let origin_size = LittleEndian::read_u64(&buf[16..24]);
        let origin_offset = LittleEndian::read_u64(&buf[24..32]);

        let journal = Journal {
            base_sector: LittleEndian::read_u64(&buf[32..40]),
            size: LittleEndian::read_u64(&buf[40..48]),
            next: LittleEndian::read_u64(&buf[48..56]),
            sequence: LittleEndian::read_i32(&buf[56..60]),
            chunk_bits: LittleEndian::read_u32(&buf[60..64]),
        };
        let root = TreeRoot {
            root_sector: LittleEndian::read_u64(&buf[64..72]),
            levels: LittleEndian::read_u32(&buf[72..76]),
        };

        let metadata_desc = decode_alloc_desc(&buf[80..120]);
        let snapdata_desc = decode_alloc_desc(&buf[120..160]);

        let meta_chunks_used = LittleEndian::read_u64(&buf[160..168]);
        let snap_chunks_used = LittleEndian::read_u64(&buf[168..176]);

        let count = LittleEndian::read_u32(&buf[176..180]) as usize;
        if HEADER_FIXED_SIZE + count * SNAPSHOT_STRIDE > buf.len() {
            return_errno_with_msg!(CorruptState, "superblock snapshot count overruns block");
        }
        let mut snapshots = Vec::with_capacity(count);
        let mut seen_tags = std::collections::HashSet::new();
        let mut seen_bits: u64 = 0;
        for i in 0..count {
            let at = HEADER_FIXED_SIZE + i * SNAPSHOT_STRIDE;
            let tag = LittleEndian::read_u32(&buf[at..at + 4]);
            let bit = buf[at + 4];
            let ctime = LittleEndian::read_u64(&buf[at + 8..at + 16]);
            let prio = buf[at + 16] as i8;
            let usecnt = LittleEndian::read_u32(&buf[at + 17..at + 21]);
            if !seen_tags.insert(tag) {
                return_errno_with_msg!(CorruptState, "duplicate snapshot tag in superblock image");
            }
            if bit as usize >= MAX_SNAPSHOTS || seen_bits & (1u64 << bit) != 0 {
                return_errno_with_msg!(CorruptState, "duplicate or out-of-range snapshot bit");
            }
            seen_bits |= 1u64 << bit;
            snapshots.push(Snapshot {
                tag,
                bit,
                ctime,
                prio,
                usecnt,
            });
        }

        Ok(Self {
            create_time,
            origin_size,
            origin_offset,
            journal,
            root,
            metadata_desc,
            snapdata_desc,
            meta_chunks_used,
            snap_chunks_used,
            busy,
            snapshots,
        })
    }
}

const HEADER_FIXED_SIZE: usize = 180;

fn encode_alloc_desc(desc: &AllocDesc, buf: &mut [u8]) {
    LittleEndian::write_u64(&mut buf[0..8], desc.chunks);
    LittleEndian::write_u64(&mut buf[8..16], desc.bitmap_base_sector);
    LittleEndian::write_u64(&mut buf[16..24], desc.bitmap_blocks);
    LittleEndian::write_u32(&mut buf[24..28], desc.allocsize_bits);
    LittleEndian::write_u64(&mut buf[32..40], desc.last_alloc);
}

fn decode_alloc_desc(buf: &[u8]) -> AllocDesc {
    AllocDesc {
        chunks: LittleEndian::read_u64(&buf[0..8]),
        bitmap_base_sector: LittleEndian::read_u64(&buf[8..16]),
        bitmap_blocks: LittleEndian::read_u64(&buf[16..24]),
        allocsize_bits: LittleEndian::read_u32(&buf[24..28]),
        last_alloc: LittleEndian::read_u64(&buf[32..40]),
    }
}

/// Reads the bitmap blocks for one allocation space off disk and rebuilds
/// a live [`Allocation`] from them. `dev` names the device the bitmap
/// actually lives on: the metadata device always for the metadata space,
/// and for the snapshot-data space either the metadata device (when the
/// two share one device) or the snapshot-data device itself.
fn load_allocation(cache: &BufferCache, dev: Dev, desc: &AllocDesc) -> Result<Allocation> {
    let mut words = Vec::new();
    let blocksize = 1usize << desc.allocsize_bits;
    for b in 0..desc.bitmap_blocks {
        let buf = cache.read(dev, desc.bitmap_base_sector + b * (blocksize as u64 / SECTOR_SIZE), blocksize)?;
        let data = buf.as_slice();
        for word in data.chunks_exact(8) {
            words.push(LittleEndian::read_u64(word));
        }
        drop(data);
        cache.release(buf);
    }
    let bitmap = BitMap::from_words(words, desc.chunks as usize);
    Ok(Allocation::from_parts(
        desc.chunks,
        desc.bitmap_base_sector,
        desc.bitmap_blocks,
        desc.allocsize_bits,
        desc.last_alloc,
        bitmap,
    ))
}

/// Writes an allocation space's bitmap out to its reserved sectors on `dev`.
pub(crate) fn store_allocation(cache: &BufferCache, dev: Dev, desc: &AllocDesc, alloc: &Allocation) -> Result<()> {
    let blocksize = 1usize << desc.allocsize_bits;
    let words = alloc.bitmap().words();
    let words_per_block = blocksize / 8;
    for b in 0..desc.bitmap_blocks as usize {
        let buf = cache.get(
            dev,
            desc.bitmap_base_sector + b as u64 * (blocksize as u64 / SECTOR_SIZE),
            blocksize,
        );
        {
            let mut data = buf.as_mut_slice();
            data.fill(0);
            let start = b * words_per_block;
            let end = (start + words_per_block).min(words.len());
            for (i, w) in words[start..end].iter().enumerate() {
                LittleEndian::write_u64(&mut data[i * 8..i * 8 + 8], *w);
            }
        }
        cache.release_dirty(buf);
    }
    Ok(())
}

/// Parameters for laying out a brand-new store.
pub struct InitParams {
    pub metadata_chunks: u64,
    pub metadata_chunksize_bits: u32,
    pub snapdata_chunks: u64,
    pub snapdata_chunksize_bits: u32,
    pub snapdata_shares_device: bool,
    pub journal_chunks: u64,
    pub origin_size: u64,
    pub origin_offset: u64,
    pub create_time: u64,
}

/// Lays out a fresh store: superblock, metadata bitmap, snapshot-data
/// bitmap (if on a distinct device), then the journal, formatting the
/// journal so recovery finds exactly one newest (empty) transaction.
pub fn init_snapstore(cache: &BufferCache, params: &InitParams) -> Result<(SuperBlock, Allocator)> {
    let meta_blocksize = 1usize << params.metadata_chunksize_bits;
    let meta_bits_per_block = (meta_blocksize * 8) as u64;
    let meta_bitmap_blocks = div_round(params.metadata_chunks, meta_bits_per_block);

    // Chunk 0 holds the superblock; the bitmap blocks follow it.
    let sb_chunks = 1u64;
    let meta_bitmap_base_sector = sb_chunks << (params.metadata_chunksize_bits - 9);
    let mut reserved_meta_chunks = sb_chunks + meta_bitmap_blocks;

    let snap_bitmap_blocks = div_round(params.snapdata_chunks, (1u64 << params.snapdata_chunksize_bits) * 8);
    let snap_bitmap_base_sector = if params.snapdata_shares_device {
        let base = reserved_meta_chunks << (params.metadata_chunksize_bits - 9);
        reserved_meta_chunks += snap_bitmap_blocks;
        base
    } else {
        0
    };

    let journal_base_sector = reserved_meta_chunks << (params.metadata_chunksize_bits - 9);
    reserved_meta_chunks += params.journal_chunks;

    let journal = Journal::format(
        cache,
        journal_base_sector,
        params.journal_chunks,
        params.metadata_chunksize_bits,
    )?;

    // The B-tree's initial empty leaf takes the next metadata chunk; fold
    // it into the reserved region up front so the allocator's bitmap marks
    // it used from the start.
    let root_chunk = reserved_meta_chunks;
    reserved_meta_chunks += 1;

    let metadata_desc = AllocDesc {
        chunks: params.metadata_chunks,
        bitmap_base_sector: meta_bitmap_base_sector,
        bitmap_blocks: meta_bitmap_blocks,
        allocsize_bits: params.metadata_chunksize_bits,
        last_alloc: reserved_meta_chunks,
    };
    let snapdata_desc = AllocDesc {
        chunks: params.snapdata_chunks,
        bitmap_base_sector: snap_bitmap_base_sector,
        bitmap_blocks: snap_bitmap_blocks,
        allocsize_bits: params.snapdata_chunksize_bits,
        last_alloc: 0,
    };

    let metadata_alloc = Allocation::new(
        params.metadata_chunks,
        metadata_desc.bitmap_base_sector,
        metadata_desc.bitmap_blocks,
        metadata_desc.allocsize_bits,
        reserved_meta_chunks,
    );
    let snapdata_alloc = Allocation::new(
        params.snapdata_chunks,
        snapdata_desc.bitmap_base_sector,
        snapdata_desc.bitmap_blocks,
        snapdata_desc.allocsize_bits,
        0,
    );

    store_allocation(cache, Dev::Metadata, &metadata_desc, &metadata_alloc)?;
    let snapdata_dev = if params.snapdata_shares_device { Dev::Metadata } else { Dev::Snapdata };
    store_allocation(cache, snapdata_dev, &snapdata_desc, &snapdata_alloc)?;

    // The B-tree starts out as a single empty leaf occupying the chunk
    // reserved for it above.
    let root_sector = root_chunk << (params.metadata_chunksize_bits - 9);
    let buf = cache.get(Dev::Metadata, root_sector, meta_blocksize);
    crate::btree::leaf::Leaf::empty(0).encode(&mut buf.as_mut_slice(), meta_blocksize)?;
    cache.release_dirty(buf);

    let sb = SuperBlock {
        create_time: params.create_time,
        origin_size: params.origin_size,
        origin_offset: params.origin_offset,
        journal,
        root: TreeRoot {
            root_sector,
            levels: 0,
        },
        metadata_desc,
        snapdata_desc,
        meta_chunks_used: reserved_meta_chunks,
        snap_chunks_used: 0,
        busy: false,
        snapshots: Vec::new(),
    };

    let sb_buf = cache.get(Dev::Metadata, SB_SECTOR, meta_blocksize);
    sb.encode(&mut sb_buf.as_mut_slice(), meta_blocksize)?;
    cache.release_dirty(sb_buf);
    cache.flush_all()?;

    let allocator = Allocator::new(metadata_alloc, snapdata_alloc);
    Ok((sb, allocator))
}

/// Loads the superblock and both allocation spaces off disk. Does not
/// run recovery; the caller checks `busy` first. `snapdata_shares_device`
/// must match what the store was initialized with: it decides whether the
/// snapshot-data bitmap is read from the metadata device or the
/// snapshot-data device.
pub fn load_sb(cache: &BufferCache, metadata_chunksize_bits: u32, snapdata_shares_device: bool) -> Result<(SuperBlock, Allocator)> {
    let blocksize = 1usize << metadata_chunksize_bits;
    let buf = cache.read(Dev::Metadata, SB_SECTOR, blocksize)?;
    let sb = SuperBlock::decode(&buf.as_slice())?;
    cache.release(buf);

    let snapdata_dev = if snapdata_shares_device { Dev::Metadata } else { Dev::Snapdata };
    let metadata_alloc = load_allocation(cache, Dev::Metadata, &sb.metadata_desc)?;
    let snapdata_alloc = load_allocation(cache, snapdata_dev, &sb.snapdata_desc)?;
    Ok((sb, Allocator::new(metadata_alloc, snapdata_alloc)))
}

/// Syncs the allocator's live cursors back into the superblock's
/// descriptors, writes both allocation spaces' bitmaps, and marks the
/// superblock's own sector dirty so every change made while handling a
/// request rides the same journal commit as the B-tree nodes it touched.
pub fn persist_state(
    cache: &BufferCache,
    sb: &mut SuperBlock,
    alloc: &Allocator,
    metadata_chunksize_bits: u32,
    snapdata_shares_device: bool,
) -> Result<()> {
    sb.metadata_desc.last_alloc = alloc.metadata.last_alloc;
    sb.snapdata_desc.last_alloc = alloc.snapdata.last_alloc;
    sb.meta_chunks_used = sb.metadata_desc.chunks - alloc.metadata.freechunks;
    sb.snap_chunks_used = sb.snapdata_desc.chunks - alloc.snapdata.freechunks;

    store_allocation(cache, Dev::Metadata, &sb.metadata_desc, &alloc.metadata)?;
    let snapdata_dev = if snapdata_shares_device { Dev::Metadata } else { Dev::Snapdata };
    store_allocation(cache, snapdata_dev, &sb.snapdata_desc, &alloc.snapdata)?;

    let blocksize = 1usize << metadata_chunksize_bits;
    let buf = cache.get(Dev::Metadata, SB_SECTOR, blocksize);
    sb.encode(&mut buf.as_mut_slice(), blocksize)?;
    cache.release_dirty(buf);
    Ok(())
}

/// Flushes every dirty buffer and, if the superblock itself changed,
/// writes it out. Bypasses the journal: legal only once the last
/// transaction has already been committed (clean shutdown).
pub fn save_state(cache: &BufferCache, sb: &SuperBlock, metadata_chunksize_bits: u32) -> Result<()> {
    let blocksize = 1usize << metadata_chunksize_bits;
    let buf = cache.get(Dev::Metadata, SB_SECTOR, blocksize);
    sb.encode(&mut buf.as_mut_slice(), blocksize)?;
    cache.release_dirty(buf);
    cache.flush_all()
}

/// Runs at process start: if the on-disk image says `busy` (a prior run
/// did not shut down cleanly), replays the journal before anything else
/// touches the store. Always returns with `busy` set, persisted, ready
/// for normal operation.
pub fn start_server(cache: &BufferCache, mut sb: SuperBlock) -> Result<SuperBlock> {
    if sb.busy {
        warn!("store was not cleanly shut down; replaying journal");
        let recovered = crate::journal::recover_journal(
            cache,
            sb.journal.base_sector,
            sb.journal.size,
            sb.journal.chunk_bits,
        )?;
        sb.journal = recovered;
        // Re-read the superblock image itself in case recovery replayed
        // a commit that touched it.
        let buf = cache.read(Dev::Metadata, SB_SECTOR, 1usize << sb.journal.chunk_bits)?;
        sb = SuperBlock::decode(&buf.as_slice())?;
        cache.release(buf);
    }
    sb.busy = true;
    save_state(cache, &sb, sb.journal.chunk_bits)?;
    Ok(sb)
}

/// Runs at clean shutdown: clears `busy` and persists.
pub fn stop_server(cache: &BufferCache, mut sb: SuperBlock) -> Result<()> {
    sb.busy = false;
    save_state(cache, &sb, sb.journal.chunk_bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Devices;
    use crate::device::FileDevice;
    use tempfile::NamedTempFile;

    const META_BITS: u32 = 12;

    fn setup() -> (BufferCache, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(16 * 1024 * 1024).unwrap();
        let devices = Devices {
            origin: None,
            snapdata: Box::new(FileDevice::open(file.path()).unwrap()),
            metadata: Box::new(FileDevice::open(file.path()).unwrap()),
        };
        (BufferCache::new(devices, 128), file)
    }

    fn params() -> InitParams {
        InitParams {
            metadata_chunks: 512,
            metadata_chunksize_bits: META_BITS,
            snapdata_chunks: 512,
            snapdata_chunksize_bits: META_BITS,
            snapdata_shares_device: true,
            journal_chunks: 8,
            origin_size: 1 << 20,
            origin_offset: 0,
            create_time: 1_700_000_000,
        }
    }

    #[test]
    fn init_then_load_roundtrips() {
        let (cache, _file) = setup();
        let (sb, _alloc) = init_snapstore(&cache, &params()).unwrap();
        assert!(!sb.busy);
        assert_eq!(sb.root.levels, 0);

        let (loaded, _alloc2) = load_sb(&cache, META_BITS, true).unwrap();
        assert_eq!(loaded.create_time, sb.create_time);
        assert_eq!(loaded.root.root_sector, sb.root.root_sector);
        assert_eq!(loaded.metadata_desc.chunks, sb.metadata_desc.chunks);
    }

    #[test]
    fn snapshot_list_enforces_unique_tag_and_bit_limit() {
        let (cache, _file) = setup();
        let (mut sb, _alloc) = init_snapstore(&cache, &params()).unwrap();

        let bit0 = sb.add_snapshot(1, 1).unwrap();
        assert_eq!(bit0, 0);
        assert!(sb.add_snapshot(1, 2).is_err());

        for tag in 2..65u32 {
            sb.add_snapshot(tag, 3).unwrap();
        }
        assert_eq!(sb.snapshots.len(), 64);
        assert!(sb.add_snapshot(1000, 4).is_err());
    }

    #[test]
    fn start_server_replays_when_busy() {
        let (cache, _file) = setup();
        let (mut sb, _alloc) = init_snapstore(&cache, &params()).unwrap();
        sb.busy = true;
        save_state(&cache, &sb, META_BITS).unwrap();

        let (reloaded, _alloc2) = load_sb(&cache, META_BITS, true).unwrap();
        assert!(reloaded.busy);
        let started = start_server(&cache, reloaded).unwrap();
        assert!(started.busy);
    }
}
