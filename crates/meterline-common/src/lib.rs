//! Shared building blocks for Meterline components

pub mod logging;
pub mod time;

pub use time::{format_timestamp, parse_timestamp, TimestampError};
