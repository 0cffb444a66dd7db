//! Incremental mirroring of an audio library into a converted copy.
//!
//! The [`sync::SyncManager`] scans the source tree against the target,
//! then converts or copies what changed on a pool of workers and removes
//! target entries whose source is gone.

pub mod convert;
pub mod error;
pub mod report;
pub mod sync;
pub mod utils;

pub use error::{ConfigError, ConversionError, SyncError};
