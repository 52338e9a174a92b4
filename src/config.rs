//! CLI surface and process-wide configuration (§3/§6 ambient additions).
//!
//! A `clap`-derived `initialize`/`server` command pair, size-string
//! parsing (`k/K/m/M/g/G` suffixes) and power-of-two bit-count validation,
//! and the immutable [`Config`] every other module is handed at startup.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "snapmetad", about = "Metadata server for a copy-on-write block snapshot store")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Lays out a fresh store on the given devices.
    Initialize(InitializeArgs),
    /// Runs the metadata server against an already-initialized store.
    Server(ServerArgs),
}

#[derive(Args, Debug, Clone)]
pub struct InitializeArgs {
    /// Path to the metadata device.
    #[arg(long)]
    pub metadev: PathBuf,
    /// Path to the snapshot-data device (may equal `--metadev`).
    #[arg(long)]
    pub snapdev: PathBuf,
    /// Origin volume size in sectors.
    #[arg(long)]
    pub origin_sectors: u64,
    /// Metadata chunk size in bytes; must be a power of two, >= 512.
    #[arg(long, value_parser = parse_size, default_value = "4k")]
    pub metadata_chunksize: u64,
    /// Snapshot-data chunk size in bytes; must be a power of two, >= 512.
    #[arg(long, value_parser = parse_size, default_value = "4k")]
    pub snapdata_chunksize: u64,
    /// Journal size, accepts k/K/m/M/g/G suffixes.
    #[arg(long, value_parser = parse_size, default_value = "4m")]
    pub journal_size: u64,
    /// Size to create `--metadev`/`--snapdev` at, if they don't already exist.
    #[arg(long, value_parser = parse_size, default_value = "64m")]
    pub device_size: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    #[arg(long)]
    pub metadev: PathBuf,
    #[arg(long)]
    pub snapdev: PathBuf,
    #[arg(long)]
    pub orgdev: Option<PathBuf>,
    /// UNIX socket path the server listens on for client connections.
    #[arg(long)]
    pub sockname: PathBuf,
    /// UNIX socket path of the control agent to report readiness to; an
    /// `@`-prefix denotes the abstract namespace.
    #[arg(long)]
    pub agent_sockname: Option<String>,
    /// Maximum chunks coalesced into a single copy-out read+write.
    #[arg(long, default_value_t = 32)]
    pub copybuf_chunks: usize,
}

/// Parses a size string with an optional `k/K/m/M/g/G` suffix.
pub fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }
    let (digits, mult) = match s.as_bytes()[s.len() - 1] {
        b'k' | b'K' => (&s[..s.len() - 1], 1024u64),
        b'm' | b'M' => (&s[..s.len() - 1], 1024 * 1024),
        b'g' | b'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let value: u64 = digits.parse().map_err(|_| format!("invalid size string {s:?}"))?;
    value.checked_mul(mult).ok_or_else(|| format!("size string {s:?} overflows"))
}

/// Validates that `n` is a power of two and returns its bit position,
/// for chunk-size arguments that must be expressible as `allocsize_bits`.
pub fn bits_of_power_of_two(n: u64) -> Result<u32> {
    if n == 0 || !n.is_power_of_two() {
        return_errno_with_msg!(InvalidArgs, "chunk size must be a power of two");
    }
    Ok(n.trailing_zeros())
}

/// Process-wide configuration, parsed once at startup and handed to the
/// server/dispatch layer by reference; immutable afterward.
#[derive(Clone, Debug)]
pub struct Config {
    pub metadev: PathBuf,
    pub snapdev: PathBuf,
    pub orgdev: Option<PathBuf>,
    pub metadata_chunksize_bits: u32,
    pub snapdata_chunksize_bits: u32,
    pub snapdata_shares_device: bool,
    pub sockname: PathBuf,
    pub agent_sockname: Option<String>,
    pub copybuf_chunks: usize,
}

impl Config {
    pub fn from_server_args(args: &ServerArgs, metadata_chunksize_bits: u32, snapdata_chunksize_bits: u32) -> Self {
        Self {
            metadev: args.metadev.clone(),
            snapdev: args.snapdev.clone(),
            orgdev: args.orgdev.clone(),
            metadata_chunksize_bits,
            snapdata_chunksize_bits,
            snapdata_shares_device: args.metadev == args.snapdev,
            sockname: args.sockname.clone(),
            agent_sockname: args.agent_sockname.clone(),
            copybuf_chunks: args.copybuf_chunks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_accepts_suffixes() {
        assert_eq!(parse_size("4k").unwrap(), 4096);
        assert_eq!(parse_size("1M").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("512").unwrap(), 512);
    }

    #[test]
    fn parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("4x").is_err());
    }

    #[test]
    fn power_of_two_validation() {
        assert_eq!(bits_of_power_of_two(4096).unwrap(), 12);
        assert!(bits_of_power_of_two(4097).is_err());
        assert!(bits_of_power_of_two(0).is_err());
    }
}
