//! Buffer cache: caches fixed-size metadata blocks keyed by `(device,
//! sector)`, tracks which ones are dirty, and flushes them to disk.
//!
//! This is the collaborator named in §4.1: an LRU-ish cache with
//! `get/read/release/dirty/evict` operations. The B-tree, allocator,
//! journal and superblock code above it only ever see [`Buffer`] handles;
//! they never touch a [`std::fs::File`] directly.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use lru::LruCache;

use crate::device::BlockDevice;
use crate::prelude::*;

/// Identifies which of the server's (up to three) open devices a buffer
/// belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dev {
    Origin,
    Snapdata,
    Metadata,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct Key {
    dev: Dev,
    sector: SectorT,
}

struct BufferInner {
    key: Key,
    size: usize,
    data: RefCell<Vec<u8>>,
    dirty: Cell<bool>,
    inuse: Cell<usize>,
}

/// A handle to a cached block. Cloning a `Buffer` is cheap (it is an `Rc`)
/// and is how the B-tree engine shares a probe path's buffers.
#[derive(Clone)]
pub struct Buffer(Rc<BufferInner>);

impl Buffer {
    pub fn dev(&self) -> Dev {
        self.0.key.dev
    }

    pub fn sector(&self) -> SectorT {
        self.0.key.sector
    }

    pub fn size(&self) -> usize {
        self.0.size
    }

    pub fn as_slice(&self) -> std::cell::Ref<'_, Vec<u8>> {
        self.0.data.borrow()
    }

    pub fn as_mut_slice(&self) -> std::cell::RefMut<'_, Vec<u8>> {
        self.0.data.borrow_mut()
    }

    pub fn is_dirty(&self) -> bool {
        self.0.dirty.get()
    }

    fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}
impl Eq for Buffer {}

/// Per-device backing store used by the cache on a miss/flush.
pub struct Devices {
    pub origin: Option<Box<dyn BlockDevice>>,
    pub snapdata: Box<dyn BlockDevice>,
    pub metadata: Box<dyn BlockDevice>,
}

impl Devices {
    fn get(&self, dev: Dev) -> Result<&dyn BlockDevice> {
        match dev {
            Dev::Origin => self
                .origin
                .as_deref()
                .ok_or_else(|| Error::with_msg(InvalidArgs, "no origin device configured")),
            Dev::Snapdata => Ok(self.snapdata.as_ref()),
            Dev::Metadata => Ok(self.metadata.as_ref()),
        }
    }
}

/// The metadata server's buffer cache.
pub struct BufferCache {
    devices: Devices,
    // LRU of *clean, unreferenced* buffers, eligible for silent eviction.
    lru: RefCell<LruCache<Key, Buffer>>,
    // Buffers currently referenced or dirty; never silently evicted.
    hot: RefCell<hashbrown::HashMap<Key, Buffer>>,
    dirty_order: RefCell<Vec<Key>>,
    dirty_set: RefCell<HashSet<Key>>,
}

impl BufferCache {
    pub fn new(devices: Devices, lru_capacity: usize) -> Self {
        let cap = std::num::NonZeroUsize::new(lru_capacity.max(1)).unwrap();
        Self {
            devices,
            lru: RefCell::new(LruCache::new(cap)),
            hot: RefCell::new(hashbrown::HashMap::new()),
            dirty_order: RefCell::new(Vec::new()),
            dirty_set: RefCell::new(HashSet::new()),
        }
    }

    fn find(&self, key: Key) -> Option<Buffer> {
        if let Some(buf) = self.hot.borrow().get(&key) {
            return Some(buf.clone());
        }
        self.lru.borrow_mut().get(&key).cloned()
    }

    fn insert_new(&self, key: Key, size: usize, zero_fill: bool) -> Buffer {
        let data = if zero_fill { vec![0u8; size] } else { Vec::new() };
        let buf = Buffer(Rc::new(BufferInner {
            key,
            size,
            data: RefCell::new(data),
            dirty: Cell::new(false),
            inuse: Cell::new(0),
        }));
        self.lru.borrow_mut().put(key, buf.clone());
        buf
    }

    fn acquire(&self, buf: &Buffer) {
        let was_unused = buf.0.inuse.get() == 0;
        buf.0.inuse.set(buf.0.inuse.get() + 1);
        if was_unused {
            // Move from the LRU into the hot set while referenced so it can
            // never be silently evicted out from under a caller.
            if let Some(b) = self.lru.borrow_mut().pop(&buf.0.key) {
                self.hot.borrow_mut().insert(buf.0.key, b);
            }
        }
    }

    /// Returns a cached block, allocating and zero-filling it if new.
    /// Does not touch the backing device.
    pub fn get(&self, dev: Dev, sector: SectorT, size: usize) -> Buffer {
        let key = Key { dev, sector };
        let buf = self
            .find(key)
            .unwrap_or_else(|| self.insert_new(key, size, true));
        self.acquire(&buf);
        buf
    }

    /// As [`Self::get`], but populates the block from the device on a miss.
    pub fn read(&self, dev: Dev, sector: SectorT, size: usize) -> Result<Buffer> {
        let key = Key { dev, sector };
        if let Some(buf) = self.find(key) {
            self.acquire(&buf);
            return Ok(buf);
        }
        let buf = self.insert_new(key, size, true);
        self.devices
            .get(dev)?
            .read_at(&mut buf.as_mut_slice(), sector * SECTOR_SIZE)?;
        self.acquire(&buf);
        Ok(buf)
    }

    fn mark_dirty_locked(&self, key: Key) {
        if self.dirty_set.borrow_mut().insert(key) {
            self.dirty_order.borrow_mut().push(key);
        }
    }

    pub fn mark_dirty(&self, buf: &Buffer) {
        buf.0.dirty.set(true);
        self.mark_dirty_locked(buf.0.key);
    }

    pub fn is_dirty(&self, buf: &Buffer) -> bool {
        buf.is_dirty()
    }

    /// Decrements the reference count. Demotes the buffer back into the LRU
    /// once unreferenced (unless it is dirty, in which case it stays hot
    /// until flushed).
    pub fn release(&self, buf: Buffer) {
        debug_assert!(buf.0.inuse.get() > 0, "release of a buffer not in use");
        buf.0.inuse.set(buf.0.inuse.get() - 1);
        if buf.0.inuse.get() == 0 && !buf.is_dirty() {
            if let Some(b) = self.hot.borrow_mut().remove(&buf.0.key) {
                self.lru.borrow_mut().put(buf.0.key, b);
            }
        }
    }

    /// As [`Self::release`], but also marks the buffer dirty.
    pub fn release_dirty(&self, buf: Buffer) {
        self.mark_dirty(&buf);
        self.release(buf);
    }

    /// Removes a clean, unreferenced buffer from the cache entirely.
    /// No-op (with a debug assertion) if still referenced.
    pub fn evict(&self, buf: &Buffer) {
        debug_assert_eq!(buf.0.inuse.get(), 0, "evict of a buffer still in use");
        if buf.0.inuse.get() != 0 {
            return;
        }
        self.lru.borrow_mut().pop(&buf.0.key);
        self.hot.borrow_mut().remove(&buf.0.key);
    }

    /// Number of currently-dirty buffers, observed by the journal to decide
    /// whether a mid-traversal commit is due.
    pub fn dirty_buffer_count(&self) -> usize {
        self.dirty_order.borrow().len()
    }

    /// Returns the dirty buffers in the (stable) order they were dirtied,
    /// without clearing dirty status. The journal's commit path walks this
    /// list twice: once to write block contents into journal slots, once to
    /// write them to their home sectors (via [`Self::write_buffer`]).
    pub fn dirty_snapshot(&self) -> Vec<Buffer> {
        self.dirty_order
            .borrow()
            .iter()
            .map(|key| self.find(*key).expect("dirty buffer must be cached"))
            .collect()
    }

    /// Writes a single dirty buffer to its home sector and clears its dirty
    /// bit, removing it from the dirty list.
    pub fn write_buffer(&self, buf: &Buffer) -> Result<()> {
        self.devices
            .get(buf.dev())?
            .write_at(&buf.as_slice(), buf.sector() * SECTOR_SIZE)?;
        buf.0.dirty.set(false);
        self.dirty_set.borrow_mut().remove(&buf.0.key);
        self.dirty_order.borrow_mut().retain(|k| *k != buf.0.key);
        if buf.0.inuse.get() == 0 {
            if let Some(b) = self.hot.borrow_mut().remove(&buf.0.key) {
                self.lru.borrow_mut().put(buf.0.key, b);
            }
        }
        Ok(())
    }

    /// Writes every dirty buffer to its original sector and clears the
    /// dirty set, bypassing the journal. Used only at clean shutdown, after
    /// the last transaction has already been committed.
    pub fn flush_all(&self) -> Result<()> {
        for buf in self.dirty_snapshot() {
            self.write_buffer(&buf)?;
        }
        Ok(())
    }

    /// Direct, uncached read against a device, bypassing the buffer cache
    /// entirely. Used by the copy-out coalescer, which moves bulk chunk
    /// data rather than metadata blocks.
    pub fn read_raw(&self, dev: Dev, buf: &mut [u8], offset_bytes: u64) -> Result<()> {
        self.devices.get(dev)?.read_at(buf, offset_bytes)
    }

    /// Direct, uncached write against a device. See [`Self::read_raw`].
    pub fn write_raw(&self, dev: Dev, buf: &[u8], offset_bytes: u64) -> Result<()> {
        self.devices.get(dev)?.write_at(buf, offset_bytes)
    }
}
