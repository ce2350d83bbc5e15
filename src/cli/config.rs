//! Engine configuration
//!
//! Settings for a swarm and the runtime around it, built from the command
//! line or constructed directly with [`Config::default`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::cli::args::CliArgs;
use crate::error::TorrentError;
use crate::protocol::DEFAULT_MAX_FRAME;
use crate::scheduler::ChokeConfig;
use crate::storage::file::DEFAULT_OPEN_FILES;
use crate::storage::piece::BLOCK_SIZE;

/// Largest block a peer may request from us
pub const DEFAULT_MAX_REQUEST: u32 = 128 * 1024;

/// Configuration for the swarm engine
#[derive(Debug, Clone)]
pub struct Config {
    /// Download directory
    pub output_dir: PathBuf,
    /// Listening port for incoming peers; 0 picks a free port
    pub listen_port: u16,
    pub max_connections: usize,
    pub max_uploaders: usize,
    pub min_uploaders: usize,
    pub max_downloading_peers: usize,
    /// Outstanding requests per peer
    pub pipeline: usize,
    pub choke_interval: Duration,
    pub optimistic_interval: Duration,
    pub keep_alive: Duration,
    pub inactivity_timeout: Duration,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub max_request: u32,
    pub max_frame: usize,
    /// Bytes per second, 0 for unlimited
    pub download_limit: u64,
    pub upload_limit: u64,
    /// Share weight every session gets on top of its measured rate
    pub rate_floor: f64,
    pub tick_interval: Duration,
    pub tracker_interval: Duration,
    pub dht_interval: Duration,
    /// New outgoing connections started per tick
    pub connects_per_tick: usize,
    pub max_open_files: usize,
    pub use_dht: bool,
    pub dht_port: u16,
    pub dht_state: Option<PathBuf>,
    /// Peers to connect to directly
    pub peers: Vec<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./downloads"),
            listen_port: 6881,
            max_connections: 50,
            max_uploaders: 4,
            min_uploaders: 1,
            max_downloading_peers: 20,
            pipeline: 16,
            choke_interval: Duration::from_secs(10),
            optimistic_interval: Duration::from_secs(30),
            keep_alive: Duration::from_secs(120),
            inactivity_timeout: Duration::from_secs(300),
            handshake_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            max_request: DEFAULT_MAX_REQUEST,
            max_frame: DEFAULT_MAX_FRAME,
            download_limit: 0,
            upload_limit: 0,
            rate_floor: 1024.0,
            tick_interval: Duration::from_secs(1),
            tracker_interval: Duration::from_secs(30 * 60),
            dht_interval: Duration::from_secs(5 * 60),
            connects_per_tick: 8,
            max_open_files: DEFAULT_OPEN_FILES,
            use_dht: true,
            dht_port: 6881,
            dht_state: None,
            peers: Vec::new(),
        }
    }
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Self {
        let defaults = Self::default();
        Self {
            output_dir: args.output_dir.clone().unwrap_or(defaults.output_dir),
            listen_port: args.port,
            max_connections: args.max_connections,
            max_uploaders: args.max_uploaders,
            min_uploaders: args.min_uploaders,
            pipeline: args.pipeline,
            download_limit: args.download_limit,
            upload_limit: args.upload_limit,
            use_dht: !args.no_dht,
            dht_port: args.dht_port,
            dht_state: args.dht_state.clone(),
            peers: args.peers.clone(),
            ..defaults
        }
    }

    /// Validate configuration, naming the offending field on failure
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str, field: &str| -> Result<()> {
            Err(TorrentError::config_error_with_field(message, field).into())
        };

        if self.output_dir.as_os_str().is_empty() {
            return invalid("Output directory cannot be empty", "output_dir");
        }
        if self.max_connections == 0 {
            return invalid("Must allow at least one connection", "max_connections");
        }
        if self.max_uploaders == 0 {
            return invalid("Must allow at least one uploader", "max_uploaders");
        }
        if self.min_uploaders > self.max_uploaders {
            return invalid("Cannot exceed max_uploaders", "min_uploaders");
        }
        if self.pipeline == 0 {
            return invalid("Pipeline depth must be at least 1", "pipeline");
        }
        if self.max_request < BLOCK_SIZE {
            return invalid("Must be at least one block", "max_request");
        }
        if self.max_frame < self.max_request as usize + 13 {
            return invalid("Frame limit too small for the largest piece message", "max_frame");
        }
        if self.choke_interval.is_zero() || self.optimistic_interval < self.choke_interval {
            return invalid("Optimistic interval must be a multiple of a non-zero choke interval", "optimistic_interval");
        }
        if self.tick_interval.is_zero() {
            return invalid("Tick interval must be non-zero", "tick_interval");
        }
        if self.rate_floor < 0.0 {
            return invalid("Rate floor must be non-negative", "rate_floor");
        }
        if self.use_dht && self.dht_port == 0 {
            return invalid("DHT port cannot be 0", "dht_port");
        }
        Ok(())
    }

    /// Choking parameters for the scheduler
    pub fn choke_config(&self) -> ChokeConfig {
        ChokeConfig {
            max_uploaders: self.max_uploaders,
            min_uploaders: self.min_uploaders,
            max_downloading_peers: self.max_downloading_peers,
            choke_interval: self.choke_interval,
            optimistic_interval: self.optimistic_interval,
        }
    }

    /// Address the peer listener binds
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.listen_port))
    }

    /// Address the DHT socket binds
    pub fn dht_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.dht_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_field(err: anyhow::Error) -> Option<String> {
        match err.downcast::<TorrentError>().unwrap() {
            TorrentError::ConfigError { field, .. } => field,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.pipeline, 16);
        assert_eq!(config.max_request, 128 * 1024);
        assert_eq!(config.max_frame, (1 << 20) + 13);
        assert_eq!(config.choke_config().max_uploaders, 4);
    }

    #[test]
    fn test_config_from_args() {
        let args = CliArgs {
            torrent_file: PathBuf::from("test.torrent"),
            output_dir: Some(PathBuf::from("/tmp/downloads")),
            port: 6882,
            max_connections: 100,
            max_uploaders: 6,
            min_uploaders: 2,
            pipeline: 32,
            download_limit: 1_000_000,
            upload_limit: 0,
            no_dht: true,
            dht_port: 7000,
            dht_state: None,
            peers: vec!["10.0.0.1:6881".parse().unwrap()],
            verbose: false,
            quiet: false,
        };

        let config = Config::from_args(&args);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/downloads"));
        assert_eq!(config.listen_port, 6882);
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.pipeline, 32);
        assert_eq!(config.download_limit, 1_000_000);
        assert!(!config.use_dht);
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.keep_alive, Duration::from_secs(120));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_names_field() {
        let config = Config { max_connections: 0, ..Config::default() };
        assert_eq!(config_field(config.validate().unwrap_err()).as_deref(), Some("max_connections"));

        let config = Config { min_uploaders: 5, ..Config::default() };
        assert_eq!(config_field(config.validate().unwrap_err()).as_deref(), Some("min_uploaders"));

        let config = Config { max_request: 1024, ..Config::default() };
        assert_eq!(config_field(config.validate().unwrap_err()).as_deref(), Some("max_request"));
    }

    #[test]
    fn test_listen_addr() {
        let config = Config { listen_port: 6889, ..Config::default() };
        assert_eq!(config.listen_addr().to_string(), "0.0.0.0:6889");
    }
}
