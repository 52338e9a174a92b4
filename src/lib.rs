//! Metadata server for a copy-on-write block snapshot store.
//!
//! The exception B-tree ([`btree`]), bitmap allocator ([`alloc`]/[`bitmap`]),
//! redo-log journal ([`journal`]), and buffer cache ([`cache`]) form the
//! on-disk store; [`superblock`] ties them together and persists the root of
//! trust. [`dispatch`] turns decoded wire messages ([`protocol`]) into calls
//! against that store, serialized per-chunk by [`snaplock`]. [`server`] and
//! [`agent`] are the userspace process shell around all of that: a
//! single-threaded `mio` event loop accepting client connections over a UNIX
//! socket and reporting readiness to a control agent.

pub mod agent;
pub mod alloc;
pub mod bitmap;
pub mod btree;
pub mod cache;
pub mod client;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod exception;
pub mod journal;
pub mod prelude;
pub mod protocol;
pub mod server;
pub mod snaplock;
pub mod superblock;
