//! Process-wide tracing setup for the coachq binaries.

pub mod tracing;

pub use self::tracing::{LogFormat, init, init_with};
