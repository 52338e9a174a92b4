//! Circular redo-log journal.
//!
//! Every dirty metadata buffer is written to the next journal slot, then a
//! commit block recording the dirty buffers' home sectors and a checksum
//! is appended; only then are the buffers written to their real sectors.
//! Recovery replays the newest intact commit it can find.

use byteorder::{ByteOrder, LittleEndian};

use crate::cache::{BufferCache, Dev};
use crate::prelude::*;

const COMMIT_HEADER: usize = 8 + 4 + 4 + 4; // magic + checksum + sequence + entries

/// Journal geometry and cursor, persisted inside the superblock.
#[derive(Clone, Copy, Debug)]
pub struct Journal {
    pub base_sector: SectorT,
    pub size: u64,
    pub next: u64,
    pub sequence: i32,
    pub chunk_bits: u32,
}

impl Journal {
    fn slot_size(&self) -> usize {
        1usize << self.chunk_bits
    }

    fn sectors_per_slot(&self) -> u64 {
        1u64 << (self.chunk_bits - 9)
    }

    fn slot_sector(&self, slot: u64) -> SectorT {
        self.base_sector + slot * self.sectors_per_slot()
    }

    fn capacity(&self) -> usize {
        (self.slot_size() - COMMIT_HEADER) / 8
    }

    /// Stamps every slot as a valid, zero-entry commit block with an
    /// ascending sequence number, so a freshly initialized store recovers
    /// to exactly one (trivial) newest block.
    pub fn format(cache: &BufferCache, base_sector: SectorT, size: u64, chunk_bits: u32) -> Result<Self> {
        let journal = Journal {
            base_sector,
            size,
            next: 0,
            sequence: size as i32,
            chunk_bits,
        };
        let mut buf = vec![0u8; journal.slot_size()];
        for slot in 0..size {
            write_commit_block(&mut buf, slot as i32, &[]);
            cache.write_raw(Dev::Metadata, &buf, journal.slot_sector(slot) * SECTOR_SIZE)?;
        }
        Ok(journal)
    }

    /// Writes every currently dirty buffer through the journal, then to
    /// its home sector, in one atomic transaction. No-op if nothing is
    /// dirty.
    pub fn commit_transaction(&mut self, cache: &BufferCache) -> Result<()> {
        let dirty = cache.dirty_snapshot();
        if dirty.is_empty() {
            return Ok(());
        }
        if dirty.len() > self.capacity() {
            return_errno_with_msg!(CorruptState, "transaction exceeds journal commit capacity");
        }

        let mut sectors = Vec::with_capacity(dirty.len());
        for buf in &dirty {
            let slot = self.next;
            self.next = (self.next + 1) % self.size;
            cache.write_raw(Dev::Metadata, &buf.as_slice(), self.slot_sector(slot) * SECTOR_SIZE)?;
            sectors.push(buf.sector());
        }

        let commit_slot = self.next;
        self.next = (self.next + 1) % self.size;
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        let mut commit_buf = vec![0u8; self.slot_size()];
        write_commit_block(&mut commit_buf, sequence, &sectors);
        cache.write_raw(Dev::Metadata, &commit_buf, self.slot_sector(commit_slot) * SECTOR_SIZE)?;

        for buf in &dirty {
            cache.write_buffer(buf)?;
        }
        Ok(())
    }
}

fn checksum(buf: &[u8]) -> u32 {
    let mut sum = 0u32;
    for chunk in buf.chunks_exact(4) {
        sum = sum.wrapping_add(LittleEndian::read_u32(chunk));
    }
    sum
}

fn write_commit_block(buf: &mut [u8], sequence: i32, sectors: &[SectorT]) {
    buf.fill(0);
    buf[0..8].copy_from_slice(&JOURNAL_MAGIC);
    LittleEndian::write_u32(&mut buf[8..12], 0); // checksum placeholder
    LittleEndian::write_i32(&mut buf[12..16], sequence);
    LittleEndian::write_u32(&mut buf[16..20], sectors.len() as u32);
    for (i, s) in sectors.iter().enumerate() {
        let at = COMMIT_HEADER + i * 8;
        LittleEndian::write_u64(&mut buf[at..at + 8], *s);
    }
    let sum = checksum(buf);
    LittleEndian::write_u32(&mut buf[8..12], sum.wrapping_neg());
}

struct DecodedCommit {
    sequence: i32,
    entries: u32,
    sectors: Vec<SectorT>,
}

fn decode_commit(buf: &[u8]) -> Option<DecodedCommit> {
    if buf.len() < COMMIT_HEADER || buf[0..8] != JOURNAL_MAGIC {
        return None;
    }
    if checksum(buf) != 0 {
        return None;
    }
    let sequence = LittleEndian::read_i32(&buf[12..16]);
    let entries = LittleEndian::read_u32(&buf[16..20]);
    let mut sectors = Vec::with_capacity(entries as usize);
    for i in 0..entries as usize {
        let at = COMMIT_HEADER + i * 8;
        if at + 8 > buf.len() {
            return None;
        }
        sectors.push(LittleEndian::read_u64(&buf[at..at + 8]));
    }
    Some(DecodedCommit {
        sequence,
        entries,
        sectors,
    })
}

fn is_scribbled(buf: &[u8]) -> bool {
    buf.len() >= 8 && buf[0..8] == JOURNAL_MAGIC && checksum(buf) != 0
}

/// Scans the journal ring for the newest intact transaction and replays
/// it to the recorded target sectors, returning the journal cursor the
/// server should resume with.
pub fn recover_journal(cache: &BufferCache, base_sector: SectorT, size: u64, chunk_bits: u32) -> Result<Journal> {
    let slot_size = 1usize << chunk_bits;
    let sectors_per_slot = 1u64 << (chunk_bits - 9);
    let slot_sector = |slot: u64| base_sector + slot * sectors_per_slot;

    let mut last_good: Option<(u64, DecodedCommit)> = None;
    let mut newest: Option<u64> = None;
    let mut prev_sequence: Option<i32> = None;
    let mut wraps = 0u32;
    let mut scribbled_count = 0u32;
    let mut newest_commit: Option<DecodedCommit> = None;

    for slot in 0..size {
        let mut buf = vec![0u8; slot_size];
        cache.read_raw(Dev::Metadata, &mut buf, slot_sector(slot) * SECTOR_SIZE)?;

        if let Some(commit) = decode_commit(&buf) {
            if let Some(prev) = prev_sequence {
                if commit.sequence != prev.wrapping_add(1) {
                    let delta = prev - commit.sequence;
                    if delta > 0 && (delta as u64) <= size {
                        wraps += 1;
                        if wraps > 1 {
                            return_errno_with_msg!(
                                RecoveryFailed,
                                "journal recovery found more than one sequence wrap"
                            );
                        }
                        // Pin the head to whatever was the newest good
                        // commit before this gap.
                        if let Some((idx, _)) = &last_good {
                            newest = Some(*idx);
                        }
                    }
                }
            }
            prev_sequence = Some(commit.sequence);
            if wraps == 0 {
                newest = Some(slot);
            }
            last_good = Some((slot, commit));
        } else if is_scribbled(&buf) {
            scribbled_count += 1;
            if scribbled_count > 1 {
                return_errno_with_msg!(RecoveryFailed, "journal recovery found more than one scribbled block");
            }
        }
    }

    let newest_slot = newest.ok_or_else(|| Error::with_msg(RecoveryFailed, "no intact journal commit found"))?;
    if let Some((idx, commit)) = last_good {
        if idx == newest_slot {
            newest_commit = Some(commit);
        }
    }
    let commit = if let Some(c) = newest_commit {
        c
    } else {
        // The pinned newest slot wasn't the last one decoded (a wrap
        // occurred); re-read and decode it directly.
        let mut buf = vec![0u8; slot_size];
        cache.read_raw(Dev::Metadata, &mut buf, slot_sector(newest_slot) * SECTOR_SIZE)?;
        decode_commit(&buf).ok_or_else(|| Error::with_msg(RecoveryFailed, "newest journal slot is not a valid commit"))?
    };

    let entries = commit.entries as u64;
    for i in 0..entries {
        let data_slot = (newest_slot + size - entries + i) % size;
        let mut data = vec![0u8; slot_size];
        cache.read_raw(Dev::Metadata, &mut data, slot_sector(data_slot) * SECTOR_SIZE)?;
        let target = commit.sectors[i as usize];
        cache.write_raw(Dev::Metadata, &data, target * SECTOR_SIZE)?;
    }

    Ok(Journal {
        base_sector,
        size,
        next: (newest_slot + 1) % size,
        sequence: commit.sequence.wrapping_add(1),
        chunk_bits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Devices;
    use crate::device::FileDevice;
    use tempfile::NamedTempFile;

    const CHUNK_BITS: u32 = 12;

    fn setup() -> (BufferCache, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(4 * 1024 * 1024).unwrap();
        let devices = Devices {
            origin: None,
            snapdata: Box::new(FileDevice::open(file.path()).unwrap()),
            metadata: Box::new(FileDevice::open(file.path()).unwrap()),
        };
        (BufferCache::new(devices, 64), file)
    }

    #[test]
    fn checksum_is_zero_after_writing_commit_block() {
        let mut buf = vec![0u8; 1 << CHUNK_BITS];
        write_commit_block(&mut buf, 7, &[10, 20, 30]);
        assert_eq!(checksum(&buf), 0);
        let decoded = decode_commit(&buf).unwrap();
        assert_eq!(decoded.sequence, 7);
        assert_eq!(decoded.sectors, vec![10, 20, 30]);
    }

    #[test]
    fn freshly_formatted_journal_recovers_with_no_replay() {
        let (cache, _file) = setup();
        let journal = Journal::format(&cache, 8, 4, CHUNK_BITS).unwrap();
        assert_eq!(journal.next, 0);

        // format() stamps slots 0..size with ascending sequence numbers, so
        // the last slot (size - 1) is the newest intact commit and nothing
        // needs replaying.
        let recovered = recover_journal(&cache, 8, 4, CHUNK_BITS).unwrap();
        assert_eq!(recovered.next, 0);
        assert_eq!(recovered.sequence, 3 + 1);
    }

    #[test]
    fn commit_then_recover_replays_dirty_buffers() {
        let (cache, _file) = setup();
        let mut journal = Journal::format(&cache, 8, 8, CHUNK_BITS).unwrap();

        let buf = cache.get(Dev::Metadata, 200, 1 << CHUNK_BITS);
        buf.as_mut_slice()[0] = 0xAB;
        cache.release_dirty(buf);

        journal.commit_transaction(&cache).unwrap();

        let mut readback = vec![0u8; 1 << CHUNK_BITS];
        cache.read_raw(Dev::Metadata, &mut readback, 200 * SECTOR_SIZE).unwrap();
        assert_eq!(readback[0], 0xAB);

        let recovered = recover_journal(&cache, 8, 8, CHUNK_BITS).unwrap();
        assert_eq!(recovered.next, journal.next);
    }
}
