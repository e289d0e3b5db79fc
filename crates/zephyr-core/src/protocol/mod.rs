//! Protocol module - Zephyr wire definitions.

pub mod checksum;
pub mod constants;
pub mod header;

pub use constants::*;
pub use header::{FingerRecord, FrameError, FrameHeader};
