
pub use fake_mpd::{FakeMpd, FakeState};
pub use stub_harness::{pid_alive, wait_until_dead, StubHarness};
pub use assertions::*;
