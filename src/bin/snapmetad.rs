//! Process entry point: `snapmetad initialize ...` lays out a fresh store,
//! `snapmetad server ...` runs the metadata server against one.

use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;

use snapmetad::cache::{BufferCache, Devices};
use snapmetad::config::{bits_of_power_of_two, Cli, Command, Config, InitializeArgs, ServerArgs};
use snapmetad::device::FileDevice;
use snapmetad::dispatch::ServerState;
use snapmetad::prelude::*;
use snapmetad::superblock::{init_snapstore, load_sb, start_server, stop_server, InitParams};
use snapmetad::{agent, server};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Initialize(args) => run_initialize(&args),
        Command::Server(args) => run_server(&args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn open_or_create(path: &std::path::Path, size_bytes: u64) -> Result<FileDevice> {
    if path.exists() {
        FileDevice::open(path)
    } else {
        FileDevice::create(path, size_bytes)
    }
}

fn run_initialize(args: &InitializeArgs) -> Result<()> {
    let metadata_chunksize_bits = bits_of_power_of_two(args.metadata_chunksize)?;
    let snapdata_chunksize_bits = bits_of_power_of_two(args.snapdata_chunksize)?;
    let snapdata_shares_device = args.metadev == args.snapdev;

    let metadev = open_or_create(&args.metadev, args.device_size)?;
    let snapdev: Box<dyn snapmetad::device::BlockDevice> = if snapdata_shares_device {
        Box::new(FileDevice::open(&args.metadev)?)
    } else {
        Box::new(open_or_create(&args.snapdev, args.device_size)?)
    };

    let devices = Devices {
        origin: None,
        snapdata: snapdev,
        metadata: Box::new(metadev),
    };
    let cache = BufferCache::new(devices, 128);

    let metadata_chunks = args.device_size >> metadata_chunksize_bits;
    let snapdata_chunks = args.device_size >> snapdata_chunksize_bits;
    let journal_chunks = (args.journal_size >> metadata_chunksize_bits).max(1);

    let params = InitParams {
        metadata_chunks,
        metadata_chunksize_bits,
        snapdata_chunks,
        snapdata_chunksize_bits,
        snapdata_shares_device,
        journal_chunks,
        origin_size: args.origin_sectors,
        origin_offset: 0,
        create_time: now_secs(),
    };
    init_snapstore(&cache, &params)?;
    info!("initialized snapshot store at {:?}", args.metadev);
    Ok(())
}

fn run_server(args: &ServerArgs) -> Result<()> {
    let metadev = FileDevice::open(&args.metadev)?;
    let snapdata_shares_device = args.metadev == args.snapdev;
    let snapdev: Box<dyn snapmetad::device::BlockDevice> = if snapdata_shares_device {
        Box::new(FileDevice::open(&args.metadev)?)
    } else {
        Box::new(FileDevice::open(&args.snapdev)?)
    };
    let origin: Option<Box<dyn snapmetad::device::BlockDevice>> = match &args.orgdev {
        Some(path) => Some(Box::new(FileDevice::open(path)?)),
        None => None,
    };

    let devices = Devices {
        origin,
        snapdata: snapdev,
        metadata: Box::new(metadev),
    };
    let cache = BufferCache::new(devices, 4096);

    // The true chunk size isn't known until the superblock is decoded, but
    // the header plus a full `MAX_SNAPSHOTS`-entry table never exceeds 4KiB
    // (the default `--metadata-chunksize`), so a single bootstrap read at
    // that size is enough regardless of the store's actual chunk size: a
    // smaller real chunk size just means the read spills harmlessly into
    // the following bitmap sectors, which `SuperBlock::decode` ignores.
    let (sb, alloc) = load_sb(&cache, 12, snapdata_shares_device)?;
    let metadata_chunksize_bits = sb.journal.chunk_bits;
    let snapdata_chunksize_bits = sb.snapdata_desc.allocsize_bits;

    let sb = start_server(&cache, sb)?;

    let config = Config::from_server_args(args, metadata_chunksize_bits, snapdata_chunksize_bits);
    let state = ServerState::new(
        cache,
        sb,
        alloc,
        metadata_chunksize_bits,
        snapdata_chunksize_bits,
        config.snapdata_shares_device,
        config.copybuf_chunks,
    );

    agent::notify_ready(config.agent_sockname.as_deref(), &config.sockname)?;
    let state = server::run(&config.sockname, state)?;

    stop_server(&state.cache, state.sb)?;
    info!("server shut down cleanly");
    Ok(())
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
