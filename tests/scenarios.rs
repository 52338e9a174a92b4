//! End-to-end request-sequence scenarios driven straight through
//! [`ServerState::dispatch`], without going through the socket/event loop.

use snapmetad::btree::BTree;
use snapmetad::cache::{BufferCache, Dev, Devices};
use snapmetad::device::FileDevice;
use snapmetad::dispatch::ServerState;
use snapmetad::protocol::{code, BodyReader, BodyWriter, FrameHeader, HEADER_SIZE};
use snapmetad::superblock::{init_snapstore, InitParams};
use tempfile::NamedTempFile;

const META_BITS: u32 = 12;

fn header(code: u32, len: usize) -> FrameHeader {
    FrameHeader { code, length: len as u32 }
}

fn reply_code(frame: &[u8]) -> u32 {
    FrameHeader::decode(frame).unwrap().code
}

fn reply_body(frame: &[u8]) -> BodyReader<'_> {
    BodyReader::new(&frame[HEADER_SIZE..])
}

fn range_body(chunk: u64, count: u32) -> Vec<u8> {
    BodyWriter::new().u32(1).u64(chunk).u32(count).into_vec()
}

fn new_store(snapdata_chunks: u64) -> (ServerState, NamedTempFile) {
    let file = NamedTempFile::new().unwrap();
    file.as_file().set_len(16 * 1024 * 1024).unwrap();
    let devices = Devices {
        origin: Some(Box::new(FileDevice::open(file.path()).unwrap())),
        snapdata: Box::new(FileDevice::open(file.path()).unwrap()),
        metadata: Box::new(FileDevice::open(file.path()).unwrap()),
    };
    let cache = BufferCache::new(devices, 256);
    let params = InitParams {
        metadata_chunks: 512,
        metadata_chunksize_bits: META_BITS,
        snapdata_chunks,
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

fn create_snapshot(state: &mut ServerState, client: u64, tag: u32) {
    let body = BodyWriter::new().u32(tag).into_vec();
    let out = state.dispatch(client, header(code::CREATE_SNAPSHOT, body.len()), &body);
    assert_eq!(reply_code(&out.replies[0].frame), code::CREATE_SNAPSHOT_OK);
}

fn identify_snapshot(state: &mut ServerState, client: u64, tag: u32, orgsectors: u64) {
    let body = BodyWriter::new().u32(tag).u64(orgsectors).u64(0).into_vec();
    let out = state.dispatch(client, header(code::IDENTIFY, body.len()), &body);
    assert_eq!(reply_code(&out.replies[0].frame), code::IDENTIFY_OK);
}

/// Scenario 1: origin write forces copy-out.
#[test]
fn origin_write_forces_copy_out() {
    let (mut state, _file) = new_store(64);
    let client = state.on_client_connect();
    create_snapshot(&mut state, client, 1);

    let freechunks_before = state.alloc.snapdata.freechunks;
    let body = range_body(0x100, 1);
    let out = state.dispatch(client, header(code::QUERY_WRITE, body.len()), &body);
    assert_eq!(out.replies.len(), 1);
    assert_eq!(reply_code(&out.replies[0].frame), code::ORIGIN_WRITE_OK);
    assert_eq!(state.alloc.snapdata.freechunks, freechunks_before - 1);
}

/// Scenario 2: a redundant origin write to the same chunk is a no-op.
#[test]
fn redundant_origin_write_allocates_nothing() {
    let (mut state, _file) = new_store(64);
    let client = state.on_client_connect();
    create_snapshot(&mut state, client, 1);

    let body = range_body(0x100, 1);
    state.dispatch(client, header(code::QUERY_WRITE, body.len()), &body);
    let freechunks_after_first = state.alloc.snapdata.freechunks;

    let out = state.dispatch(client, header(code::QUERY_WRITE, body.len()), &body);
    assert_eq!(reply_code(&out.replies[0].frame), code::ORIGIN_WRITE_OK);
    assert_eq!(state.alloc.snapdata.freechunks, freechunks_after_first);
}

/// Scenario 3: reading an unmodified chunk from a snapshot returns the
/// origin-redirect reply followed by an empty snapshot-local reply, and
/// takes a read-lock on the chunk.
#[test]
fn snapshot_read_of_unmodified_chunk_redirects_to_origin() {
    let (mut state, _file) = new_store(64);
    let origin_size = state.sb.origin_size;
    let writer = state.on_client_connect();
    create_snapshot(&mut state, writer, 1);
    create_snapshot(&mut state, writer, 2);

    let reader = state.on_client_connect();
    identify_snapshot(&mut state, reader, 1, origin_size);

    let body = range_body(0x200, 1);
    let out = state.dispatch(reader, header(code::QUERY_SNAPSHOT_READ, body.len()), &body);
    assert_eq!(out.replies.len(), 2);
    assert_eq!(reply_code(&out.replies[0].frame), code::SNAPSHOT_READ_ORIGIN_OK);
    let mut r = reply_body(&out.replies[0].frame);
    assert_eq!(r.u32().unwrap(), 1);
    assert_eq!(r.u64().unwrap(), 0x200);

    assert_eq!(reply_code(&out.replies[1].frame), code::SNAPSHOT_READ_OK);
    let mut r = reply_body(&out.replies[1].frame);
    assert_eq!(r.u32().unwrap(), 0);
}

/// Scenario 4: a snapshot read-hold blocks a colliding origin write until
/// the reader finishes; finishing the read unblocks the write.
#[test]
fn read_then_origin_write_serializes_through_the_snaplock() {
    let (mut state, _file) = new_store(64);
    let origin_size = state.sb.origin_size;
    let a = state.on_client_connect();
    create_snapshot(&mut state, a, 1);
    identify_snapshot(&mut state, a, 1, origin_size);

    let read_body = range_body(0x300, 1);
    let out = state.dispatch(a, header(code::QUERY_SNAPSHOT_READ, read_body.len()), &read_body);
    assert_eq!(out.replies.len(), 2);

    let b = state.on_client_connect();
    let write_body = range_body(0x300, 1);
    let out = state.dispatch(b, header(code::QUERY_WRITE, write_body.len()), &write_body);
    assert!(out.replies.is_empty(), "B must block behind A's read-hold");

    let finish_body = range_body(0x300, 1);
    let out = state.dispatch(a, header(code::FINISH_SNAPSHOT_READ, finish_body.len()), &finish_body);
    assert_eq!(out.replies.len(), 1);
    assert_eq!(out.replies[0].client_id, b);
    assert_eq!(reply_code(&out.replies[0].frame), code::ORIGIN_WRITE_OK);
}

/// Scenario 5: exhausting the snapshot-data space triggers automatic
/// reclamation of the lowest-priority idle snapshot.
#[test]
fn snapshot_full_reclaims_lowest_priority_snapshot() {
    let (mut state, _file) = new_store(4);
    let client = state.on_client_connect();
    create_snapshot(&mut state, client, 1);

    for chunk in [10u64, 11, 12, 13] {
        let body = range_body(chunk, 1);
        let out = state.dispatch(client, header(code::QUERY_WRITE, body.len()), &body);
        assert_eq!(reply_code(&out.replies[0].frame), code::ORIGIN_WRITE_OK);
    }
    assert_eq!(state.alloc.snapdata.freechunks, 0);

    create_snapshot(&mut state, client, 2);
    let prio_body = BodyWriter::new().u32(2).i8(5).into_vec();
    let out = state.dispatch(client, header(code::PRIORITY, prio_body.len()), &prio_body);
    assert_eq!(reply_code(&out.replies[0].frame), code::PRIORITY_OK);

    let body = range_body(14, 1);
    let out = state.dispatch(client, header(code::QUERY_WRITE, body.len()), &body);
    assert_eq!(reply_code(&out.replies[0].frame), code::ORIGIN_WRITE_OK);

    let out = state.dispatch(client, header(code::LIST_SNAPSHOTS, 0), &[]);
    let mut r = reply_body(&out.replies[0].frame);
    assert_eq!(r.u32().unwrap(), 1);
    assert_eq!(r.u32().unwrap(), 2); // surviving tag
}

/// Scenario 6: a simulated crash before clean shutdown is recovered from
/// the journal on the next start, restoring exactly the pre-crash state.
#[test]
fn journal_replay_restores_state_after_a_crash() {
    let file = NamedTempFile::new().unwrap();
    file.as_file().set_len(16 * 1024 * 1024).unwrap();
    let devices = || Devices {
        origin: Some(Box::new(FileDevice::open(file.path()).unwrap())),
        snapdata: Box::new(FileDevice::open(file.path()).unwrap()),
        metadata: Box::new(FileDevice::open(file.path()).unwrap()),
    };

    let meta_chunks_used;
    {
        let cache = BufferCache::new(devices(), 256);
        let params = InitParams {
            metadata_chunks: 512,
            metadata_chunksize_bits: META_BITS,
            snapdata_chunks: 64,
            snapdata_chunksize_bits: META_BITS,
            snapdata_shares_device: true,
            journal_chunks: 8,
            origin_size: 1 << 20,
            origin_offset: 0,
            create_time: 1_700_000_000,
        };
        let (sb, alloc) = init_snapstore(&cache, &params).unwrap();
        let sb = snapmetad::superblock::start_server(&cache, sb).unwrap();
        let mut state = ServerState::new(cache, sb, alloc, META_BITS, META_BITS, true, 32);
        let client = state.on_client_connect();
        create_snapshot(&mut state, client, 7);
        for chunk in [20u64, 21, 22] {
            let body = range_body(chunk, 1);
            let out = state.dispatch(client, header(code::QUERY_WRITE, body.len()), &body);
            assert_eq!(reply_code(&out.replies[0].frame), code::ORIGIN_WRITE_OK);
        }
        meta_chunks_used = state.sb.meta_chunks_used;
        // No `stop_server` call: `busy` stays set, as if the process died
        // here. Every write above already committed through the journal.
    }

    let cache = BufferCache::new(devices(), 256);
    let (sb, alloc) = snapmetad::superblock::load_sb(&cache, META_BITS, true).unwrap();
    assert!(sb.busy);
    let sb = snapmetad::superblock::start_server(&cache, sb).unwrap();

    assert_eq!(sb.snapshots.len(), 1);
    assert_eq!(sb.snapshots[0].tag, 7);
    assert_eq!(sb.meta_chunks_used, meta_chunks_used);

    let tree = BTree::new(&cache, Dev::Metadata, META_BITS);
    let mut exception_count = 0usize;
    tree.traverse(&sb.root, 0, 0, |leaf| {
        for entry in &leaf.entries {
            exception_count += entry.exceptions.len();
        }
        None
    })
    .unwrap();
    assert_eq!(exception_count, 3);

    let _ = alloc;
}
