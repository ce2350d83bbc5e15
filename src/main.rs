//! swarm-engine - Main entry point
//!
//! Downloads a torrent from the swarm, then keeps seeding until interrupted.

use anyhow::{Context, Result};
use std::path::Path;
use swarm_engine::cli::progress::format_bytes;
use swarm_engine::{
    dht, CliArgs, Config, FileBlockStore, ProgressDisplay, Runtime, StaticTracker, Swarm, TorrentError,
    TorrentInfo, TorrentParser,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    info!("swarm-engine starting");
    debug!("CLI arguments: {:?}", args);

    let torrent_info = load_torrent_file(&args.torrent_file).context("Failed to load torrent file")?;

    let config = Config::from_args(&args);
    config.validate().context("Invalid configuration")?;

    if !args.is_quiet() {
        display_torrent_info(&torrent_info, &config);
    }

    let ctx = Runtime::acquire();
    if config.use_dht {
        info!("Starting DHT on {}", config.dht_addr());
        let mut dht_config = dht::DhtServiceConfig::new(config.dht_addr());
        dht_config.state_file = config.dht_state.clone();
        match dht::start(dht_config).await {
            Ok(handle) => ctx.set_dht(handle),
            Err(e) => warn!("DHT unavailable, continuing without it: {:#}", e),
        }
    }

    let store = FileBlockStore::new(&config.output_dir, &torrent_info, config.max_open_files);
    store.create_files().await.map_err(|e| {
        error!("Failed to prepare download files: {}", e);
        anyhow::Error::from(TorrentError::storage_error_full(
            "Failed to prepare download files",
            config.output_dir.display().to_string(),
            e.to_string(),
        ))
    })?;

    let total = torrent_info.total_size();
    let tracker = StaticTracker::new(config.peers.clone());
    let swarm = Swarm::new(torrent_info, config.clone(), ctx.clone(), Box::new(store), Box::new(tracker));

    let mut progress = ProgressDisplay::new(total, args.is_quiet());
    let mut stats_rx = swarm.subscribe();
    let printer = tokio::spawn(async move {
        while stats_rx.changed().await.is_ok() {
            let stats = stats_rx.borrow_and_update().clone();
            if progress.update(&stats).is_err() {
                break;
            }
        }
        progress
    });

    let (stop_tx, stop_rx) = oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            let _ = stop_tx.send(());
        }
    });

    let result = swarm.run(stop_rx).await;

    if let Some(dht) = ctx.take_dht() {
        dht.shutdown().await;
    }

    let progress = printer.await.context("Progress task failed")?;
    match result {
        Ok(stats) => {
            progress.print_summary(&stats)?;
            info!("swarm-engine finished");
            Ok(())
        }
        Err(e) => {
            error!("Swarm failed: {:#}", e);
            Err(e)
        }
    }
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }

    debug!("Logging initialized successfully");
}

/// Load and parse the torrent file
fn load_torrent_file(path: &Path) -> Result<TorrentInfo> {
    info!("Loading torrent file: {}", path.display());

    let torrent_data = std::fs::read(path).map_err(|e| {
        error!("Failed to read torrent file '{}': {}", path.display(), e);
        anyhow::anyhow!("Failed to read torrent file: {}", e)
    })?;

    debug!("Torrent file size: {} bytes", torrent_data.len());

    let info = TorrentParser::parse_bytes(&torrent_data).map_err(|e| {
        error!("Failed to parse torrent file '{}': {}", path.display(), e);
        anyhow::Error::from(TorrentError::parse_error_with_source("Failed to parse torrent file", e.to_string()))
    })?;

    info!("Successfully loaded torrent file: {}", info.name);
    Ok(info)
}

/// Display torrent information
fn display_torrent_info(torrent_info: &TorrentInfo, config: &Config) {
    println!("Torrent Information:");
    println!("  Name: {}", torrent_info.name);
    println!("  Size: {} ({})", torrent_info.total_size(), format_bytes(torrent_info.total_size()));
    println!("  Pieces: {}", torrent_info.piece_count());
    println!("  Piece length: {}", format_bytes(torrent_info.piece_length));
    println!("  Info hash: {}", torrent_info.info_hash_hex());
    println!();
    println!("Configuration:");
    println!("  Output directory: {}", config.output_dir.display());
    println!("  Listen port: {}", config.listen_port);
    println!("  Max connections: {}", config.max_connections);
    println!("  Uploaders: {}..={} (+1 optimistic)", config.min_uploaders, config.max_uploaders);
    println!("  DHT: {}", if config.use_dht { "enabled" } else { "disabled" });
    if !config.peers.is_empty() {
        println!("  Manual peers: {}", config.peers.len());
    }
    println!();
}
