//! Progress accounting and periodic progress notifications.

pub mod progress;
pub mod timer;

pub use progress::{format_bytes, format_duration, format_speed, ProgressCounters};
pub use timer::ProgressTimer;
