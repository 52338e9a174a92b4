//! Request dispatch: turns decoded wire messages into exception-logic,
//! B-tree, allocator, snaplock and superblock operations (§4.9).
//!
//! [`ServerState`] bundles everything a single connection's request needs.
//! The forward reference `alloc_chunk -> delete_snapshot -> delete_tree_range
//! -> alloc_chunk` is broken here rather than inside `alloc.rs`: every
//! allocation in this module goes through [`ServerState::make_unique_with_reclaim`],
//! which retries with [`NoReclaim`] and performs the actual snapshot deletion
//! itself once `alloc_chunk` reports `OutOfSpace`, instead of handing
//! `alloc_chunk` a policy that would need to borrow the allocator again.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;

use crate::alloc::{Allocator, NoReclaim};
use crate::btree::{BTree, TreeRoot};
use crate::cache::{BufferCache, Dev};
use crate::client::{Client, CLIENT_USING};
use crate::exception::{make_unique, CopyOutCoalescer};
use crate::prelude::*;
use crate::protocol::{code, errcode, error_frame, frame, decode_ranges, BodyReader, BodyWriter, FrameHeader};
use crate::snaplock::{Pending, PendingPayload, SnapLockTable};
use crate::superblock::{persist_state, SuperBlock};

/// One outbound frame addressed to a specific client, as produced by
/// [`ServerState::dispatch`] or by a snaplock release draining its waiters.
pub struct Reply {
    pub client_id: u64,
    pub frame: Vec<u8>,
}

/// What the event loop should do after handling one request.
pub struct DispatchOutcome {
    pub replies: Vec<Reply>,
    pub shutdown: bool,
}

/// All server-side state needed to answer one request: the persistent
/// store (cache, superblock, allocator) plus the per-connection and
/// per-chunk-lock bookkeeping that never touches disk.
pub struct ServerState {
    pub cache: BufferCache,
    pub sb: SuperBlock,
    pub alloc: Allocator,
    pub metadata_chunksize_bits: u32,
    pub snapdata_chunksize_bits: u32,
    pub snapdata_shares_device: bool,
    coalescer: CopyOutCoalescer,
    snaplocks: SnapLockTable,
    clients: HashMap<u64, Client>,
    next_client_id: u64,
}

impl ServerState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: BufferCache,
        sb: SuperBlock,
        alloc: Allocator,
        metadata_chunksize_bits: u32,
        snapdata_chunksize_bits: u32,
        snapdata_shares_device: bool,
        copybuf_chunks: usize,
    ) -> Self {
        Self {
            cache,
            sb,
            alloc,
            metadata_chunksize_bits,
            snapdata_chunksize_bits,
            snapdata_shares_device,
            coalescer: CopyOutCoalescer::new(copybuf_chunks),
            snaplocks: SnapLockTable::new(),
            clients: HashMap::new(),
            next_client_id: 1,
        }
    }

    pub fn on_client_connect(&mut self) -> u64 {
        let id = self.next_client_id;
        self.next_client_id += 1;
        self.clients.insert(id, Client::new(id));
        id
    }

    /// Releases every hold and snapshot binding belonging to a disconnected
    /// client, returning any replies this unblocked.
    pub fn on_client_disconnect(&mut self, client_id: u64) -> Vec<Reply> {
        let Some(client) = self.clients.remove(&client_id) else {
            return Vec::new();
        };
        if let Some(bit) = client.snap {
            if let Some(s) = self.sb.snapshots.iter_mut().find(|s| s.bit == bit) {
                s.usecnt = s.usecnt.saturating_sub(1);
            }
        }
        self.snaplocks
            .release_client(client_id)
            .iter()
            .map(|p| pending_to_reply(&p.borrow()))
            .collect()
    }

    fn error_reply(&self, client_id: u64, reply_code: u32, err: u32, msg: &str) -> Reply {
        Reply {
            client_id,
            frame: error_frame(reply_code, err, msg),
        }
    }

    fn flush_and_commit(&mut self) -> Result<()> {
        self.coalescer.flush(&self.cache, self.snapdata_chunksize_bits)?;
        persist_state(
            &self.cache,
            &mut self.sb,
            &self.alloc,
            self.metadata_chunksize_bits,
            self.snapdata_shares_device,
        )?;
        self.sb.journal.commit_transaction(&self.cache)
    }

    /// Ensures `chunk` is unique for `snapnum`, reclaiming idle snapshots
    /// and retrying if the snapshot-data space is exhausted.
    fn make_unique_with_reclaim(&mut self, chunk: ChunkT, snapnum: Option<u32>, active_mask: u64) -> Result<Option<ChunkT>> {
        loop {
            let tree = BTree::new(&self.cache, Dev::Metadata, self.metadata_chunksize_bits);
            let result = make_unique(
                &tree,
                &mut self.sb.root,
                &mut self.alloc,
                &mut NoReclaim,
                &mut self.coalescer,
                chunk,
                snapnum,
                active_mask,
            );
            match result {
                Ok(v) => return Ok(v),
                Err(e) if e.errno() == OutOfSpace => {
                    if self.reclaim_one_snapshot()? {
                        continue;
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Deletes the live snapshot with the lowest `prio` among those with
    /// `usecnt == 0`; ties favor the highest index (scanned from the tail).
    fn reclaim_one_snapshot(&mut self) -> Result<bool> {
        let mut victim: Option<usize> = None;
        for idx in (0..self.sb.snapshots.len()).rev() {
            if self.sb.snapshots[idx].usecnt != 0 {
                continue;
            }
            match victim {
                None => victim = Some(idx),
                Some(v) if self.sb.snapshots[idx].prio < self.sb.snapshots[v].prio => victim = Some(idx),
                Some(_) => {}
            }
        }
        let Some(idx) = victim else { return Ok(false) };
        let tag = self.sb.snapshots[idx].tag;
        info!("reclaiming idle snapshot tag {tag} under allocation pressure");
        self.delete_snapshot_internal(tag)?;
        Ok(true)
    }

    fn exception_chunk_for(&self, chunk: ChunkT, snapnum: u32) -> Result<ChunkT> {
        let tree = BTree::new(&self.cache, Dev::Metadata, self.metadata_chunksize_bits);
        let leaf = tree.lookup(&self.sb.root, chunk)?;
        leaf.snapshot_chunk_unique(chunk, snapnum)
            .map(|(_, c)| c)
            .ok_or_else(|| Error::with_msg(NotFound, "no snapshot exception for chunk"))
    }

    fn delete_snapshot_internal(&mut self, tag: u32) -> Result<()> {
        let snap = self.sb.remove_snapshot(tag)?;
        let mask = 1u64 << snap.bit;
        let mut root = self.sb.root;
        let mut journal = self.sb.journal;
        let threshold = journal.size.saturating_sub(1) as usize;
        {
            let cache = &self.cache;
            let tree = BTree::new(cache, Dev::Metadata, self.metadata_chunksize_bits);
            tree.delete_range(&mut root, &mut self.alloc, mask, || {
                if cache.dirty_buffer_count() >= threshold {
                    journal.commit_transaction(cache)?;
                }
                Ok(())
            })?;
        }
        self.sb.root = root;
        self.sb.journal = journal;
        persist_state(
            &self.cache,
            &mut self.sb,
            &self.alloc,
            self.metadata_chunksize_bits,
            self.snapdata_shares_device,
        )?;
        self.sb.journal.commit_transaction(&self.cache)
    }

    /// Decodes and answers one request; never panics on a malformed body or
    /// an unknown message, turning either into the appropriate `*_ERROR`
    /// reply instead.
    pub fn dispatch(&mut self, client_id: u64, header: FrameHeader, body: &[u8]) -> DispatchOutcome {
        if header.length > MAXBODY {
            warn!("client {client_id} sent an oversized frame ({} bytes)", header.length);
            return DispatchOutcome {
                replies: vec![self.error_reply(client_id, code::PROTOCOL_ERROR, errcode::UNKNOWN_MESSAGE, "body too large")],
                shutdown: false,
            };
        }
        let replies = match header.code {
            code::QUERY_WRITE => match self.clients.get(&client_id).and_then(|c| c.snap) {
                None => self.handle_query_write_origin(client_id, body),
                Some(bit) => self.handle_query_write_snapshot(client_id, bit as u32, body),
            },
            code::QUERY_SNAPSHOT_READ => self.handle_query_snapshot_read(client_id, body),
            code::FINISH_SNAPSHOT_READ => self.handle_finish_snapshot_read(client_id, body),
            code::IDENTIFY => self.handle_identify(client_id, body),
            code::CREATE_SNAPSHOT => self.handle_create_snapshot(client_id, body),
            code::DELETE_SNAPSHOT => self.handle_delete_snapshot(client_id, body),
            code::PRIORITY => self.handle_priority(client_id, body),
            code::USECOUNT => self.handle_usecount(client_id, body),
            code::STREAM_CHANGELIST => self.handle_stream_changelist(client_id, body),
            code::STATUS => self.handle_status(client_id),
            code::LIST_SNAPSHOTS => self.handle_list_snapshots(client_id),
            code::REQUEST_ORIGIN_SECTORS => self.handle_request_origin_sectors(client_id),
            code::SHUTDOWN_SERVER => {
                return DispatchOutcome {
                    replies: Vec::new(),
                    shutdown: true,
                };
            }
            code::UPLOAD_LOCK | code::FINISH_UPLOAD_LOCK => Vec::new(),
            other => {
                warn!("unknown message code {other} from client {client_id}");
                vec![self.error_reply(client_id, code::PROTOCOL_ERROR, errcode::UNKNOWN_MESSAGE, "unknown message code")]
            }
        };
        DispatchOutcome { replies, shutdown: false }
    }

    fn handle_query_write_origin(&mut self, client_id: u64, body: &[u8]) -> Vec<Reply> {
        let chunks = match decode_ranges(body) {
            Ok(c) => c,
            Err(e) => return vec![self.error_reply(client_id, code::ORIGIN_WRITE_ERROR, errcode::UNKNOWN_MESSAGE, e.msg())],
        };
        let active_mask = self.sb.active_mask();
        let mut waiters = Vec::new();
        let mut failed = false;
        for chunk in chunks {
            match self.make_unique_with_reclaim(chunk, None, active_mask) {
                Ok(Some(_)) => waiters.push(chunk),
                Ok(None) => {}
                Err(e) => {
                    warn!("origin write failed at chunk {chunk}: {e}");
                    failed = true;
                    break;
                }
            }
        }
        if let Err(e) = self.flush_and_commit() {
            error!("commit failed after QUERY_WRITE: {e}");
            return vec![self.error_reply(client_id, code::ORIGIN_WRITE_ERROR, errcode::UNABLE_TO_COPYOUT, "commit failed")];
        }
        if failed {
            return vec![self.error_reply(client_id, code::ORIGIN_WRITE_ERROR, errcode::UNABLE_TO_COPYOUT, "allocation failed")];
        }
        if waiters.is_empty() {
            return vec![Reply {
                client_id,
                frame: frame(code::ORIGIN_WRITE_OK, &[]),
            }];
        }
        let pending = Rc::new(RefCell::new(Pending {
            holdcount: 1,
            client_id,
            payload: PendingPayload::OriginWriteOk,
        }));
        for chunk in waiters {
            self.snaplocks.waitfor_chunk(chunk, &pending);
        }
        let ready = {
            let mut p = pending.borrow_mut();
            p.holdcount -= 1;
            p.holdcount == 0
        };
        if ready {
            vec![Reply {
                client_id,
                frame: frame(code::ORIGIN_WRITE_OK, &[]),
            }]
        } else {
            Vec::new()
        }
    }

    fn handle_query_write_snapshot(&mut self, client_id: u64, snapnum: u32, body: &[u8]) -> Vec<Reply> {
        let chunks = match decode_ranges(body) {
            Ok(c) => c,
            Err(e) => return vec![self.error_reply(client_id, code::SNAPSHOT_WRITE_ERROR, errcode::UNKNOWN_MESSAGE, e.msg())],
        };
        let active_mask = self.sb.active_mask();
        let mut pairs = Vec::new();
        let mut failed = false;
        for chunk in chunks {
            let dest = match self.make_unique_with_reclaim(chunk, Some(snapnum), active_mask) {
                Ok(Some(dest)) => Some(dest),
                Ok(None) => self.exception_chunk_for(chunk, snapnum).ok(),
                Err(e) => {
                    warn!("snapshot write failed at chunk {chunk}: {e}");
                    None
                }
            };
            match dest {
                Some(d) => pairs.push((chunk, d)),
                None => {
                    failed = true;
                    break;
                }
            }
        }
        if let Err(e) = self.flush_and_commit() {
            error!("commit failed after QUERY_WRITE (snapshot): {e}");
            return vec![self.error_reply(client_id, code::SNAPSHOT_WRITE_ERROR, errcode::UNABLE_TO_COPYOUT, "commit failed")];
        }
        if failed {
            return vec![self.error_reply(client_id, code::SNAPSHOT_WRITE_ERROR, errcode::UNABLE_TO_COPYOUT, "allocation failed")];
        }
        let mut w = BodyWriter::new().u32(pairs.len() as u32);
        for (chunk, dest) in &pairs {
            w = w.u64(*chunk).u64(*dest);
        }
        vec![Reply {
            client_id,
            frame: frame(code::SNAPSHOT_WRITE_OK, &w.into_vec()),
        }]
    }

    fn handle_query_snapshot_read(&mut self, client_id: u64, body: &[u8]) -> Vec<Reply> {
        let snapnum = match self.clients.get(&client_id).and_then(|c| c.snap) {
            Some(bit) => bit as u32,
            None => {
                return vec![self.error_reply(client_id, code::PROTOCOL_ERROR, errcode::INVALID_SNAPSHOT, "not bound to a snapshot")]
            }
        };
        let chunks = match decode_ranges(body) {
            Ok(c) => c,
            Err(e) => return vec![self.error_reply(client_id, code::PROTOCOL_ERROR, errcode::UNKNOWN_MESSAGE, e.msg())],
        };
        let tree = BTree::new(&self.cache, Dev::Metadata, self.metadata_chunksize_bits);
        let mut origin_chunks = Vec::new();
        let mut snap_pairs = Vec::new();
        for chunk in chunks {
            let unique = tree.lookup(&self.sb.root, chunk).ok().and_then(|leaf| leaf.snapshot_chunk_unique(chunk, snapnum));
            match unique {
                Some((_, exc_chunk)) => snap_pairs.push((chunk, exc_chunk)),
                None => {
                    self.snaplocks.readlock_chunk(chunk, client_id);
                    if let Some(c) = self.clients.get_mut(&client_id) {
                        c.held_chunks.insert(chunk);
                    }
                    origin_chunks.push(chunk);
                }
            }
        }
        let mut origin_body = BodyWriter::new().u32(origin_chunks.len() as u32);
        for c in &origin_chunks {
            origin_body = origin_body.u64(*c);
        }
        let mut snap_body = BodyWriter::new().u32(snap_pairs.len() as u32);
        for (c, e) in &snap_pairs {
            snap_body = snap_body.u64(*c).u64(*e);
        }
        vec![
            Reply {
                client_id,
                frame: frame(code::SNAPSHOT_READ_ORIGIN_OK, &origin_body.into_vec()),
            },
            Reply {
                client_id,
                frame: frame(code::SNAPSHOT_READ_OK, &snap_body.into_vec()),
            },
        ]
    }

    fn handle_finish_snapshot_read(&mut self, client_id: u64, body: &[u8]) -> Vec<Reply> {
        let chunks = match decode_ranges(body) {
            Ok(c) => c,
            Err(e) => {
                warn!("malformed FINISH_SNAPSHOT_READ from client {client_id}: {e}");
                return Vec::new();
            }
        };
        let mut replies = Vec::new();
        for chunk in chunks {
            if let Some(c) = self.clients.get_mut(&client_id) {
                c.held_chunks.remove(&chunk);
            }
            for p in self.snaplocks.release_chunk(chunk, client_id) {
                replies.push(pending_to_reply(&p.borrow()));
            }
        }
        replies
    }

    fn handle_identify(&mut self, client_id: u64, body: &[u8]) -> Vec<Reply> {
        let mut r = BodyReader::new(body);
        let parsed = (|| -> Result<(u32, u64, u64)> { Ok((r.u32()?, r.u64()?, r.u64()?)) })();
        let (tag, orgsectors, orgoffset) = match parsed {
            Ok(v) => v,
            Err(e) => return vec![self.error_reply(client_id, code::IDENTIFY_ERROR, errcode::UNKNOWN_MESSAGE, e.msg())],
        };
        let bit = if tag == 0 {
            None
        } else {
            match self.sb.find_by_tag(tag) {
                Some(s) => Some(s.bit),
                None => return vec![self.error_reply(client_id, code::IDENTIFY_ERROR, errcode::INVALID_SNAPSHOT, "unknown snapshot tag")],
            }
        };
        if orgsectors != self.sb.origin_size {
            return vec![self.error_reply(client_id, code::IDENTIFY_ERROR, errcode::SIZE_MISMATCH, "origin size mismatch")];
        }
        if orgoffset != self.sb.origin_offset {
            return vec![self.error_reply(client_id, code::IDENTIFY_ERROR, errcode::OFFSET_MISMATCH, "origin offset mismatch")];
        }
        if let Some(bit) = bit {
            if let Some(s) = self.sb.snapshots.iter_mut().find(|s| s.bit == bit) {
                s.usecnt += 1;
            }
        }
        if let Some(c) = self.clients.get_mut(&client_id) {
            c.snap = bit;
            c.flags |= CLIENT_USING;
            c.orgsectors = orgsectors;
            c.orgoffset = orgoffset;
        }
        let body = BodyWriter::new().u32(self.snapdata_chunksize_bits).into_vec();
        vec![Reply {
            client_id,
            frame: frame(code::IDENTIFY_OK, &body),
        }]
    }

    fn handle_create_snapshot(&mut self, client_id: u64, body: &[u8]) -> Vec<Reply> {
        let mut r = BodyReader::new(body);
        let tag = match r.u32() {
            Ok(t) => t,
            Err(e) => return vec![self.error_reply(client_id, code::CREATE_SNAPSHOT_ERROR, errcode::UNKNOWN_MESSAGE, e.msg())],
        };
        if let Err(e) = self.sb.add_snapshot(tag, now_secs()) {
            return vec![self.error_reply(client_id, code::CREATE_SNAPSHOT_ERROR, errcode::INVALID_SNAPSHOT, e.msg())];
        }
        if let Err(e) = self.flush_and_commit() {
            error!("commit failed after CREATE_SNAPSHOT: {e}");
            return vec![self.error_reply(client_id, code::CREATE_SNAPSHOT_ERROR, errcode::UNABLE_TO_COPYOUT, "commit failed")];
        }
        vec![Reply {
            client_id,
            frame: frame(code::CREATE_SNAPSHOT_OK, &[]),
        }]
    }

    fn handle_delete_snapshot(&mut self, client_id: u64, body: &[u8]) -> Vec<Reply> {
        let mut r = BodyReader::new(body);
        let tag = match r.u32() {
            Ok(t) => t,
            Err(e) => return vec![self.error_reply(client_id, code::DELETE_SNAPSHOT_ERROR, errcode::UNKNOWN_MESSAGE, e.msg())],
        };
        match self.delete_snapshot_internal(tag) {
            Ok(()) => vec![Reply {
                client_id,
                frame: frame(code::DELETE_SNAPSHOT_OK, &[]),
            }],
            Err(e) => vec![self.error_reply(client_id, code::DELETE_SNAPSHOT_ERROR, errcode::INVALID_SNAPSHOT, e.msg())],
        }
    }

    fn handle_priority(&mut self, client_id: u64, body: &[u8]) -> Vec<Reply> {
        let mut r = BodyReader::new(body);
        let parsed = (|| -> Result<(u32, i8)> { Ok((r.u32()?, r.i8()?)) })();
        let (tag, prio) = match parsed {
            Ok(v) => v,
            Err(e) => return vec![self.error_reply(client_id, code::PRIORITY_ERROR, errcode::UNKNOWN_MESSAGE, e.msg())],
        };
        if tag == 0 {
            return vec![self.error_reply(client_id, code::PRIORITY_ERROR, errcode::INVALID_SNAPSHOT, "cannot reprioritize the origin")];
        }
        match self.sb.snapshots.iter_mut().find(|s| s.tag == tag) {
            Some(s) => {
                s.prio = prio;
                vec![Reply {
                    client_id,
                    frame: frame(code::PRIORITY_OK, &[]),
                }]
            }
            None => vec![self.error_reply(client_id, code::PRIORITY_ERROR, errcode::INVALID_SNAPSHOT, "unknown snapshot tag")],
        }
    }

    fn handle_usecount(&mut self, client_id: u64, body: &[u8]) -> Vec<Reply> {
        let mut r = BodyReader::new(body);
        let parsed = (|| -> Result<(u32, i32)> { Ok((r.u32()?, r.i32()?)) })();
        let (tag, delta) = match parsed {
            Ok(v) => v,
            Err(e) => return vec![self.error_reply(client_id, code::USECOUNT_ERROR, errcode::UNKNOWN_MESSAGE, e.msg())],
        };
        if !(-(1i32 << 16)..(1i32 << 16)).contains(&delta) {
            return vec![self.error_reply(client_id, code::USECOUNT_ERROR, errcode::USECOUNT, "delta out of 16-bit range")];
        }
        let Some(snap) = self.sb.snapshots.iter_mut().find(|s| s.tag == tag) else {
            return vec![self.error_reply(client_id, code::USECOUNT_ERROR, errcode::INVALID_SNAPSHOT, "unknown snapshot tag")];
        };
        let updated = if delta >= 0 {
            snap.usecnt.checked_add(delta as u32)
        } else {
            snap.usecnt.checked_sub((-delta) as u32)
        };
        match updated {
            Some(v) => {
                snap.usecnt = v;
                vec![Reply {
                    client_id,
                    frame: frame(code::USECOUNT_OK, &[]),
                }]
            }
            None => vec![self.error_reply(client_id, code::USECOUNT_ERROR, errcode::USECOUNT, "usecount overflow")],
        }
    }

    fn handle_stream_changelist(&mut self, client_id: u64, body: &[u8]) -> Vec<Reply> {
        let mut r = BodyReader::new(body);
        let parsed = (|| -> Result<(u32, u32)> { Ok((r.u32()?, r.u32()?)) })();
        let (tag1, tag2) = match parsed {
            Ok(v) => v,
            Err(e) => return vec![self.error_reply(client_id, code::STREAM_CHANGELIST_ERROR, errcode::UNKNOWN_MESSAGE, e.msg())],
        };
        let Some(bit1) = self.sb.find_by_tag(tag1).map(|s| s.bit) else {
            return vec![self.error_reply(client_id, code::STREAM_CHANGELIST_ERROR, errcode::INVALID_SNAPSHOT, "unknown tag1")];
        };
        let Some(bit2) = self.sb.find_by_tag(tag2).map(|s| s.bit) else {
            return vec![self.error_reply(client_id, code::STREAM_CHANGELIST_ERROR, errcode::INVALID_SNAPSHOT, "unknown tag2")];
        };
        let mask1 = 1u64 << bit1;
        let mask2 = 1u64 << bit2;
        let mut changed = Vec::new();
        let tree = BTree::new(&self.cache, Dev::Metadata, self.metadata_chunksize_bits);
        let result = tree.traverse(&self.sb.root, 0, 0, |leaf| {
            for entry in &leaf.entries {
                let using = entry.exceptions.iter().fold(0u64, |acc, e| acc | e.share);
                if (using & mask1 == mask1) != (using & mask2 == mask2) {
                    changed.push(leaf.base_chunk + entry.rchunk as u64);
                }
            }
            None
        });
        if let Err(e) = result {
            return vec![self.error_reply(client_id, code::STREAM_CHANGELIST_ERROR, errcode::UNABLE_TO_COPYOUT, e.msg())];
        }
        let mut w = BodyWriter::new().u32(changed.len() as u32).u32(self.metadata_chunksize_bits);
        for c in &changed {
            w = w.u64(*c);
        }
        vec![Reply {
            client_id,
            frame: frame(code::STREAM_CHANGELIST_OK, &w.into_vec()),
        }]
    }

    /// Per-snapshot-bit histogram: `table[bit][popcount(share)-1]` counts
    /// exceptions shared by exactly `popcount(share)` live snapshots that
    /// include `bit`.
    fn handle_status(&mut self, client_id: u64) -> Vec<Reply> {
        let mut table = vec![vec![0u32; MAX_SNAPSHOTS]; MAX_SNAPSHOTS];
        let tree = BTree::new(&self.cache, Dev::Metadata, self.metadata_chunksize_bits);
        let result = tree.traverse(&self.sb.root, 0, 0, |leaf| {
            for entry in &leaf.entries {
                for exc in &entry.exceptions {
                    let pc = exc.share.count_ones() as usize;
                    for bit in 0..MAX_SNAPSHOTS {
                        if exc.share & (1u64 << bit) != 0 {
                            table[bit][pc - 1] += 1;
                        }
                    }
                }
            }
            None
        });
        if let Err(e) = result {
            return vec![self.error_reply(client_id, code::STATUS_ERROR, errcode::UNABLE_TO_COPYOUT, e.msg())];
        }
        let mut w = BodyWriter::new()
            .u64(self.sb.create_time)
            .u32(self.metadata_chunksize_bits)
            .u64(self.sb.metadata_desc.chunks - self.alloc.metadata.freechunks)
            .u64(self.alloc.metadata.freechunks)
            .u32(self.snapdata_chunksize_bits)
            .u64(self.sb.snapdata_desc.chunks - self.alloc.snapdata.freechunks)
            .u64(self.alloc.snapdata.freechunks)
            .u32(MAX_SNAPSHOTS as u32)
            .u32(MAX_SNAPSHOTS as u32);
        for row in &table {
            for v in row {
                w = w.u32(*v);
            }
        }
        vec![Reply {
            client_id,
            frame: frame(code::STATUS_OK, &w.into_vec()),
        }]
    }

    fn handle_list_snapshots(&mut self, client_id: u64) -> Vec<Reply> {
        let mut w = BodyWriter::new().u32(self.sb.snapshots.len() as u32);
        for s in &self.sb.snapshots {
            w = w.u32(s.tag).u8(s.bit).u64(s.ctime).i8(s.prio).u32(s.usecnt);
        }
        vec![Reply {
            client_id,
            frame: frame(code::SNAPSHOT_LIST, &w.into_vec()),
        }]
    }

    fn handle_request_origin_sectors(&mut self, client_id: u64) -> Vec<Reply> {
        let body = BodyWriter::new().u64(self.sb.origin_size).into_vec();
        vec![Reply {
            client_id,
            frame: frame(code::ORIGIN_SECTORS, &body),
        }]
    }
}

fn pending_to_reply(p: &Pending) -> Reply {
    let frame = match &p.payload {
        PendingPayload::OriginWriteOk => frame(code::ORIGIN_WRITE_OK, &[]),
        PendingPayload::OriginWriteError { message } => error_frame(code::ORIGIN_WRITE_ERROR, errcode::UNABLE_TO_COPYOUT, message),
    };
    Reply {
        client_id: p.client_id,
        frame,
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Devices;
    use crate::device::FileDevice;
    use crate::protocol::code as msgcode;
    use crate::superblock::{init_snapstore, InitParams};
    use tempfile::NamedTempFile;

    const META_BITS: u32 = 12;

    fn setup() -> (ServerState, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(16 * 1024 * 1024).unwrap();
        let devices = Devices {
            origin: Some(Box::new(FileDevice::open(file.path()).unwrap())),
            snapdata: Box::new(FileDevice::open(file.path()).unwrap()),
            metadata: Box::new(FileDevice::open(file.path()).unwrap()),
        };
        let cache = BufferCache::new(devices, 128);
        let params = InitParams {
            metadata_chunks: 512,
            metadata_chunksize_bits: META_BITS,
            snapdata_chunks: 512,
            snapdata_chunksize_bits: META_BITS,
            snapdata_shares_device: true,
            journal_chunks: 8,
            origin_size: 1 << 20,
            origin_offset: 0,
            create_time: 1_700_000_000,
        };
        let (sb, alloc) = init_snapstore(&cache, &params).unwrap();
        let state = ServerState::new(cache, sb, alloc, META_BITS, META_BITS, true, 32);
        (state, file)
    }

    fn header(code: u32, len: usize) -> FrameHeader {
        FrameHeader { code, length: len as u32 }
    }

    #[test]
    fn create_then_list_then_delete_snapshot() {
        let (mut state, _file) = setup();
        let client = state.on_client_connect();

        let body = BodyWriter::new().u32(7).into_vec();
        let out = state.dispatch(client, header(msgcode::CREATE_SNAPSHOT, body.len()), &body);
        assert_eq!(out.replies.len(), 1);
        assert_eq!(FrameHeader::decode(&out.replies[0].frame).unwrap().code, msgcode::CREATE_SNAPSHOT_OK);

        let out = state.dispatch(client, header(msgcode::LIST_SNAPSHOTS, 0), &[]);
        assert_eq!(FrameHeader::decode(&out.replies[0].frame).unwrap().code, msgcode::SNAPSHOT_LIST);
        let mut r = BodyReader::new(&out.replies[0].frame[protocol_header_len()..]);
        assert_eq!(r.u32().unwrap(), 1);

        let body = BodyWriter::new().u32(7).into_vec();
        let out = state.dispatch(client, header(msgcode::DELETE_SNAPSHOT, body.len()), &body);
        assert_eq!(FrameHeader::decode(&out.replies[0].frame).unwrap().code, msgcode::DELETE_SNAPSHOT_OK);
    }

    #[test]
    fn origin_write_copies_out_and_commits() {
        let (mut state, _file) = setup();
        let client = state.on_client_connect();

        let create = BodyWriter::new().u32(1).into_vec();
        state.dispatch(client, header(msgcode::CREATE_SNAPSHOT, create.len()), &create);

        let body = BodyWriter::new().u32(1).u64(10).u32(1).into_vec();
        let out = state.dispatch(client, header(msgcode::QUERY_WRITE, body.len()), &body);
        assert_eq!(out.replies.len(), 1);
        assert_eq!(FrameHeader::decode(&out.replies[0].frame).unwrap().code, msgcode::ORIGIN_WRITE_OK);
    }

    #[test]
    fn unknown_message_yields_protocol_error() {
        let (mut state, _file) = setup();
        let client = state.on_client_connect();
        let out = state.dispatch(client, header(999, 0), &[]);
        assert_eq!(FrameHeader::decode(&out.replies[0].frame).unwrap().code, msgcode::PROTOCOL_ERROR);
    }

    fn protocol_header_len() -> usize {
        crate::protocol::HEADER_SIZE
    }
}
