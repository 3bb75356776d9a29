//! Process-level concerns: run-lock, triggers and signal handling.

pub mod lock;
pub mod shutdown;
pub mod trigger;
