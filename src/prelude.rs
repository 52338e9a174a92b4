//! Common imports shared across modules, following the grounding crate's
//! convention of a single prelude rather than repeating `use` boilerplate.

pub(crate) use crate::error::{Errno::*, Error};
pub(crate) use crate::error::Result;
pub(crate) use crate::{return_errno, return_errno_with_msg};

pub(crate) use log::{debug, error, info, trace, warn};

/// Sector size in bytes. Fixed by the wire/on-disk format.
pub const SECTOR_SIZE: u64 = 512;

/// Rounds `n` up to the next multiple of `align` (`align` must be a power of two).
pub const fn align_up(n: u64, align: u64) -> u64 {
    (n + align - 1) & !(align - 1)
}

/// Rounds `n` down to the previous multiple of `align` (`align` must be a power of two).
pub const fn align_down(n: u64, align: u64) -> u64 {
    n & !(align - 1)
}

/// Divides `n` by `d`, rounding up.
pub const fn div_round(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}

/// A chunk address, in units of the relevant allocation space's chunk size.
pub type ChunkT = u64;

/// A raw disk sector number.
pub type SectorT = u64;

/// Sector at which the superblock image is persisted.
pub const SB_SECTOR: SectorT = 0;

/// Magic value identifying a valid superblock image.
pub const SB_MAGIC: u32 = 0x534e_4150; // "SNAP" (big-endian reading), arbitrary but fixed.

/// Magic value identifying a valid exception-leaf block.
pub const LEAF_MAGIC: u32 = 0x1eaf;

/// Literal magic bytes opening a journal commit block.
pub const JOURNAL_MAGIC: [u8; 8] = *b"MAGICNUM";

/// Upper bound on the number of live snapshots, fixed by the 64-bit share field.
pub const MAX_SNAPSHOTS: usize = 64;

/// Maximum wire message body size; larger bodies are a fatal framing error.
pub const MAXBODY: u32 = 16 * 1024 * 1024;

/// Sentinel "no snapshot" value used for client/exception-logic plumbing:
/// requests bound to the origin volume use this in place of a snapshot bit.
pub const ORIGIN_WRITER: i32 = -1;
