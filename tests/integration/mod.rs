//! Integration testing framework for mpd-harness
//!
//! Child processes are played by small shell stubs and the MPD server by an
//! in-process fake speaking the line protocol, so no real `mpd` or
//! `valgrind` is needed.

pub mod infrastructure;
pub mod scenarios;

// Re-export commonly used types for convenience
pub use infrastructure::{pid_alive, wait_until_dead, FakeMpd, FakeState, StubHarness};
