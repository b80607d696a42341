//! Utility modules shared by the engines.

pub mod errors;
pub mod logger;
pub mod pool;

pub use errors::{BackupError, Result};
