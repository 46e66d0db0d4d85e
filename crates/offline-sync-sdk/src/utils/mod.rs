pub mod time;

pub use time::{format_duration_ms, Clock, ManualClock, SystemClock, TimezoneConfig};
