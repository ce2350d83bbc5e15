//! Scheduling module
//!
//! Choking, piece selection and bandwidth apportioning.

pub mod bandwidth;
pub mod choke;
pub mod picker;

pub use bandwidth::{Allowance, BandwidthPool, RateMeter};
pub use choke::{ChokeConfig, ChokeScheduler};
pub use picker::{PiecePicker, Picks};
