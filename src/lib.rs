pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliConfig;

pub use adapters::{CsvRosterSource, LocalStorage};
pub use config::SyncConfig;
pub use core::{EngineOptions, Mapper, SyncEngine};
pub use utils::error::{Result, SyncError};
