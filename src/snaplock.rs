//! Snaplock table: per-chunk read locks that serialize snapshot reads
//! against origin writes, plus a wait list for writers blocked behind an
//! outstanding read.
//!
//! A lock's holders are clients that currently have the chunk readlocked
//! (via `QUERY_SNAPSHOT_READ`'s origin branch); a pending writer enqueues a
//! hold-count on every chunk it is waiting for and is dispatched once every
//! count reaches zero. This mirrors the reference-counted waiter design
//! recorded in the design notes: no in-place list surgery, only
//! `Vec::retain`/`swap_remove`.

use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashMap;

use crate::prelude::*;

/// Number of low bits of the hashed chunk address used as the table index.
const HASH_BITS: u32 = 8;

fn hash_chunk(chunk: ChunkT) -> u32 {
    ((chunk.wrapping_mul(3498734713) as u32) as u64 >> (32 - HASH_BITS)) as u32
}

/// A deferred reply waiting on one or more snaplock chunks to be released.
/// The caller constructs one with `holdcount` set to the number of chunks
/// it is about to wait on, plus one held by the caller itself until every
/// `waitfor_chunk` call has been issued (see [`SnapLockTable::waitfor_chunk`]).
pub struct Pending {
    pub holdcount: u32,
    pub client_id: u64,
    /// Opaque payload the dispatch layer stashes (e.g. the reply to emit).
    pub payload: PendingPayload,
}

/// Placeholder for whatever the dispatch layer needs to resume once a
/// pending reply's last chunk clears; kept as an enum so the snaplock
/// module never needs to know about wire message types.
pub enum PendingPayload {
    OriginWriteOk,
    OriginWriteError { message: &'static str },
}

struct Lock {
    holders: Vec<u64>,
    waiters: Vec<Rc<RefCell<Pending>>>,
}

impl Lock {
    fn new() -> Self {
        Self {
            holders: Vec::new(),
            waiters: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.holders.is_empty() && self.waiters.is_empty()
    }
}

/// The snaplock table proper. Ready replies (pendings whose holdcount hits
/// zero) are returned from `release_chunk`/`release_client` for the caller
/// to actually dispatch, keeping this module free of wire-protocol concerns.
pub struct SnapLockTable {
    locks: HashMap<ChunkT, Lock>,
}

impl SnapLockTable {
    pub fn new() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }

    /// Takes a read hold on `chunk` for `client_id`. Never blocks.
    pub fn readlock_chunk(&mut self, chunk: ChunkT, client_id: u64) {
        let _ = hash_chunk(chunk); // table is keyed directly by chunk; hash informs bucket sizing only
        self.locks
            .entry(chunk)
            .or_insert_with(Lock::new)
            .holders
            .push(client_id);
    }

    /// Enqueues `pending` against `chunk` if (and only if) the chunk is
    /// currently held. Returns `true` if the caller must wait (a hold
    /// exists), `false` if the chunk was free (no wait needed, caller
    /// should not have bumped `holdcount` for it).
    pub fn waitfor_chunk(&mut self, chunk: ChunkT, pending: &Rc<RefCell<Pending>>) -> bool {
        match self.locks.get_mut(&chunk) {
            Some(lock) if !lock.holders.is_empty() => {
                lock.waiters.push(pending.clone());
                pending.borrow_mut().holdcount += 1;
                true
            }
            _ => false,
        }
    }

    /// Releases `client_id`'s hold on `chunk`. If the chunk becomes
    /// unheld, every waiter's holdcount is decremented; waiters that reach
    /// zero are returned for the caller to dispatch.
    pub fn release_chunk(&mut self, chunk: ChunkT, client_id: u64) -> Vec<Rc<RefCell<Pending>>> {
        let mut ready = Vec::new();
        let Some(lock) = self.locks.get_mut(&chunk) else {
            warn!("release_chunk: no lock for chunk {chunk}");
            return ready;
        };
        let before = lock.holders.len();
        lock.holders.retain(|&id| id != client_id);
        if lock.holders.len() == before {
            warn!("release_chunk: client {client_id} held no lock on chunk {chunk}");
        }
        if lock.holders.is_empty() {
            for waiter in lock.waiters.drain(..) {
                let hit_zero = {
                    let mut p = waiter.borrow_mut();
                    p.holdcount -= 1;
                    p.holdcount == 0
                };
                if hit_zero {
                    ready.push(waiter);
                }
            }
        }
        if lock.is_empty() {
            self.locks.remove(&chunk);
        }
        ready
    }

    /// Releases every hold belonging to `client_id` across the whole
    /// table (used on client disconnect). Returns every pending that
    /// became ready as a result.
    pub fn release_client(&mut self, client_id: u64) -> Vec<Rc<RefCell<Pending>>> {
        let chunks: Vec<ChunkT> = self
            .locks
            .iter()
            .filter(|(_, lock)| lock.holders.contains(&client_id))
            .map(|(&c, _)| c)
            .collect();
        let mut ready = Vec::new();
        for chunk in chunks {
            ready.extend(self.release_chunk(chunk, client_id));
        }
        ready
    }
}

impl Default for SnapLockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readlock_then_release_is_a_no_op_with_no_waiters() {
        let mut table = SnapLockTable::new();
        table.readlock_chunk(10, 1);
        let ready = table.release_chunk(10, 1);
        assert!(ready.is_empty());
        assert!(table.locks.is_empty());
    }

    #[test]
    fn waiter_dispatched_once_its_chunk_is_released() {
        let mut table = SnapLockTable::new();
        table.readlock_chunk(10, 1);
        let pending = Rc::new(RefCell::new(Pending {
            holdcount: 1,
            client_id: 2,
            payload: PendingPayload::OriginWriteOk,
        }));
        let waited = table.waitfor_chunk(10, &pending);
        assert!(waited);
        // Caller's own initial holdcount=1 decremented last, after issuing
        // every waitfor_chunk call for this request:
        pending.borrow_mut().holdcount -= 1;
        assert_eq!(pending.borrow().holdcount, 1);

        let ready = table.release_chunk(10, 1);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].borrow().holdcount, 0);
    }

    #[test]
    fn waiter_across_two_chunks_waits_for_both() {
        let mut table = SnapLockTable::new();
        table.readlock_chunk(10, 1);
        table.readlock_chunk(20, 1);
        let pending = Rc::new(RefCell::new(Pending {
            holdcount: 1,
            client_id: 2,
            payload: PendingPayload::OriginWriteOk,
        }));
        table.waitfor_chunk(10, &pending);
        table.waitfor_chunk(20, &pending);
        pending.borrow_mut().holdcount -= 1; // done issuing waits

        let ready = table.release_chunk(10, 1);
        assert!(ready.is_empty(), "should still be waiting on chunk 20");

        let ready = table.release_chunk(20, 1);
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn release_client_drains_every_hold() {
        let mut table = SnapLockTable::new();
        table.readlock_chunk(10, 1);
        table.readlock_chunk(11, 1);
        let pending = Rc::new(RefCell::new(Pending {
            holdcount: 1,
            client_id: 2,
            payload: PendingPayload::OriginWriteOk,
        }));
        table.waitfor_chunk(10, &pending);
        pending.borrow_mut().holdcount -= 1;

        let ready = table.release_client(1);
        assert_eq!(ready.len(), 1);
        assert!(table.locks.is_empty());
    }
}
