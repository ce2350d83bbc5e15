//! CLI module
//!
//! Command-line arguments, the engine configuration built from them and
//! the progress display.

pub mod args;
pub mod config;
pub mod progress;

pub use args::CliArgs;
pub use config::Config;
pub use progress::ProgressDisplay;
