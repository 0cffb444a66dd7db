pub mod config;
pub mod disk;
pub mod logging;

pub use config::{ConfigFile, SyncConfig};
