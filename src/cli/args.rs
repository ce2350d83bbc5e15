//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// CLI arguments for the swarm engine
#[derive(Debug, Parser)]
#[command(name = "swarm-engine")]
#[command(about = "Download and seed a torrent over the BitTorrent swarm and DHT", long_about = None)]
pub struct CliArgs {
    /// Path to the .torrent file
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent_file: PathBuf,

    /// Download directory
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Listening port for incoming connections (0 = any free port)
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// Maximum number of peer connections
    #[arg(short, long, default_value_t = 50)]
    pub max_connections: usize,

    /// Peers unchoked per choke round (plus one optimistic)
    #[arg(long, default_value_t = 4)]
    pub max_uploaders: usize,

    /// Peers kept unchoked even when few are interested
    #[arg(long, default_value_t = 1)]
    pub min_uploaders: usize,

    /// Outstanding block requests per peer
    #[arg(long, default_value_t = 16)]
    pub pipeline: usize,

    /// Download rate limit in bytes/s (0 = unlimited)
    #[arg(long, default_value_t = 0, value_name = "BYTES")]
    pub download_limit: u64,

    /// Upload rate limit in bytes/s (0 = unlimited)
    #[arg(long, default_value_t = 0, value_name = "BYTES")]
    pub upload_limit: u64,

    /// Disable DHT peer discovery
    #[arg(long)]
    pub no_dht: bool,

    /// UDP port for the DHT
    #[arg(long, default_value_t = 6881)]
    pub dht_port: u16,

    /// File the DHT routing table is saved to and restored from
    #[arg(long, value_name = "FILE")]
    pub dht_state: Option<PathBuf>,

    /// Peer to connect to directly (repeatable)
    #[arg(long = "peer", value_name = "ADDR")]
    pub peers: Vec<SocketAddr>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let args = CliArgs::try_parse_from(["swarm-engine", "test.torrent"]).unwrap();

        assert_eq!(args.torrent_file, PathBuf::from("test.torrent"));
        assert_eq!(args.port, 6881);
        assert_eq!(args.max_connections, 50);
        assert_eq!(args.max_uploaders, 4);
        assert_eq!(args.pipeline, 16);
        assert!(!args.no_dht);
        assert!(args.peers.is_empty());
        assert_eq!(args.log_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_repeated_peers_and_flags() {
        let args = CliArgs::try_parse_from([
            "swarm-engine",
            "test.torrent",
            "--peer",
            "10.0.0.1:6881",
            "--peer",
            "10.0.0.2:6882",
            "--no-dht",
            "--upload-limit",
            "50000",
            "-v",
        ])
        .unwrap();

        assert_eq!(args.peers.len(), 2);
        assert!(args.no_dht);
        assert_eq!(args.upload_limit, 50_000);
        assert!(args.is_verbose());
        assert_eq!(args.log_level(), tracing::Level::DEBUG);
    }

    #[test]
    fn test_bad_peer_address_rejected() {
        assert!(CliArgs::try_parse_from(["swarm-engine", "t.torrent", "--peer", "nowhere"]).is_err());
    }
}
