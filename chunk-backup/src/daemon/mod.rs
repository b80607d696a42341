//! Process-level lifecycle handling.

pub mod shutdown;

pub use shutdown::ShutdownCoordinator;
