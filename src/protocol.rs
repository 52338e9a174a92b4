//! Wire protocol: message framing and body codecs.
//!
//! Every request and reply is `{code: u32, length: u32}` little-endian
//! followed by `length` bytes of body (§4.9/§6). Bodies are encoded with
//! the same manual, bounds-checked `byteorder` style already used for the
//! on-disk superblock/leaf/journal formats — there is no derive-based
//! serialization here, just [`BodyWriter`]/[`BodyReader`] helpers.

use byteorder::{ByteOrder, LittleEndian};

use crate::prelude::*;

pub const HEADER_SIZE: usize = 8;

/// Message codes carried in a frame's `code` field.
pub mod code {
    pub const QUERY_WRITE: u32 = 1;
    pub const ORIGIN_WRITE_OK: u32 = 2;
    pub const ORIGIN_WRITE_ERROR: u32 = 3;
    pub const SNAPSHOT_WRITE_OK: u32 = 4;
    pub const SNAPSHOT_WRITE_ERROR: u32 = 5;
    pub const QUERY_SNAPSHOT_READ: u32 = 6;
    pub const SNAPSHOT_READ_OK: u32 = 7;
    pub const SNAPSHOT_READ_ORIGIN_OK: u32 = 8;
    pub const FINISH_SNAPSHOT_READ: u32 = 9;
    pub const IDENTIFY: u32 = 10;
    pub const IDENTIFY_OK: u32 = 11;
    pub const IDENTIFY_ERROR: u32 = 12;
    pub const CREATE_SNAPSHOT: u32 = 13;
    pub const CREATE_SNAPSHOT_OK: u32 = 14;
    pub const CREATE_SNAPSHOT_ERROR: u32 = 15;
    pub const DELETE_SNAPSHOT: u32 = 16;
    pub const DELETE_SNAPSHOT_OK: u32 = 17;
    pub const DELETE_SNAPSHOT_ERROR: u32 = 18;
    pub const INITIALIZE_SNAPSTORE: u32 = 19;
    pub const DUMP_TREE: u32 = 20;
    pub const START_SERVER: u32 = 21;
    pub const LIST_SNAPSHOTS: u32 = 22;
    pub const SNAPSHOT_LIST: u32 = 23;
    pub const PRIORITY: u32 = 24;
    pub const PRIORITY_OK: u32 = 25;
    pub const PRIORITY_ERROR: u32 = 26;
    pub const USECOUNT: u32 = 27;
    pub const USECOUNT_OK: u32 = 28;
    pub const USECOUNT_ERROR: u32 = 29;
    pub const STREAM_CHANGELIST: u32 = 30;
    pub const STREAM_CHANGELIST_OK: u32 = 31;
    pub const STREAM_CHANGELIST_ERROR: u32 = 32;
    pub const STATUS: u32 = 33;
    pub const STATUS_OK: u32 = 34;
    pub const STATUS_ERROR: u32 = 35;
    pub const REQUEST_ORIGIN_SECTORS: u32 = 36;
    pub const ORIGIN_SECTORS: u32 = 37;
    pub const SHUTDOWN_SERVER: u32 = 38;
    pub const PROTOCOL_ERROR: u32 = 39;
    pub const UPLOAD_LOCK: u32 = 40;
    pub const FINISH_UPLOAD_LOCK: u32 = 41;
    pub const SERVER_READY: u32 = 42;
}

/// Error sub-codes carried in the body of `*_ERROR`/`PROTOCOL_ERROR` replies.
pub mod errcode {
    pub const INVALID_SNAPSHOT: u32 = 1;
    pub const USECOUNT: u32 = 2;
    pub const SIZE_MISMATCH: u32 = 3;
    pub const OFFSET_MISMATCH: u32 = 4;
    pub const UNKNOWN_MESSAGE: u32 = 5;
    pub const UNABLE_TO_COPYOUT: u32 = 6;
}

/// A decoded frame header.
#[derive(Clone, Copy, Debug)]
pub struct FrameHeader {
    pub code: u32,
    pub length: u32,
}

impl FrameHeader {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return_errno_with_msg!(ProtocolError, "short frame header");
        }
        Ok(Self {
            code: LittleEndian::read_u32(&buf[0..4]),
            length: LittleEndian::read_u32(&buf[4..8]),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.code);
        LittleEndian::write_u32(&mut buf[4..8], self.length);
    }
}

/// Builds a complete frame (header + body) ready to write to a socket.
pub fn frame(code: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&code.to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Appends a `{errcode: u32, msg}` error body and wraps it as a frame.
pub fn error_frame(code: u32, errcode: u32, msg: &str) -> Vec<u8> {
    let body = BodyWriter::new().u32(errcode).cstr(msg).into_vec();
    frame(code, &body)
}

/// A tiny append-only little-endian body writer.
#[derive(Default)]
pub struct BodyWriter(Vec<u8>);

impl BodyWriter {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.0.push(v);
        self
    }

    pub fn i8(mut self, v: i8) -> Self {
        self.0.push(v as u8);
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, v);
        self.0.extend_from_slice(&tmp);
        self
    }

    pub fn i32(mut self, v: i32) -> Self {
        let mut tmp = [0u8; 4];
        LittleEndian::write_i32(&mut tmp, v);
        self.0.extend_from_slice(&tmp);
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        let mut tmp = [0u8; 8];
        LittleEndian::write_u64(&mut tmp, v);
        self.0.extend_from_slice(&tmp);
        self
    }

    /// Appends a null-terminated diagnostic string.
    pub fn cstr(mut self, s: &str) -> Self {
        self.0.extend_from_slice(s.as_bytes());
        self.0.push(0);
        self
    }

    pub fn bytes(mut self, b: &[u8]) -> Self {
        self.0.extend_from_slice(b);
        self
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

/// A tiny bounds-checked little-endian body reader.
pub struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return_errno_with_msg!(ProtocolError, "message body too short");
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

/// One `{chunk, count}` request range, as used by `QUERY_WRITE` and
/// `QUERY_SNAPSHOT_READ` bodies.
#[derive(Clone, Copy, Debug)]
pub struct ChunkRange {
    pub chunk: ChunkT,
    pub count: u32,
}

/// Decodes a `{count: u32, ranges[count]: {chunk: u64, count: u32}}` body
/// and expands it into a flat list of individual chunk addresses.
pub fn decode_ranges(body: &[u8]) -> Result<Vec<ChunkT>> {
    let mut r = BodyReader::new(body);
    let nranges = r.u32()?;
    let mut chunks = Vec::new();
    for _ in 0..nranges {
        let chunk = r.u64()?;
        let count = r.u32()?;
        for i in 0..count as u64 {
            chunks.push(chunk + i);
        }
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrips_header() {
        let f = frame(code::IDENTIFY_OK, &[1, 2, 3]);
        let header = FrameHeader::decode(&f).unwrap();
        assert_eq!(header.code, code::IDENTIFY_OK);
        assert_eq!(header.length, 3);
        assert_eq!(&f[HEADER_SIZE..], &[1, 2, 3]);
    }

    #[test]
    fn body_writer_reader_roundtrip() {
        let body = BodyWriter::new().u32(7).i8(-3).u64(0xdead_beef).cstr("hi").into_vec();
        let mut r = BodyReader::new(&body);
        assert_eq!(r.u32().unwrap(), 7);
        assert_eq!(r.i8().unwrap(), -3);
        assert_eq!(r.u64().unwrap(), 0xdead_beef);
        assert_eq!(r.remaining(), b"hi\0");
    }

    #[test]
    fn reader_rejects_short_body() {
        let mut r = BodyReader::new(&[1, 2]);
        assert!(r.u32().is_err());
    }

    #[test]
    fn decode_ranges_expands_counts() {
        let body = BodyWriter::new().u32(2).u64(10).u32(3).u64(100).u32(1).into_vec();
        let chunks = decode_ranges(&body).unwrap();
        assert_eq!(chunks, vec![10, 11, 12, 100]);
    }
}
