//! Harness for driving an MPD server and an MPD client under test as
//! external processes.
//!
//! A test typically starts a [`TestMpd`], points a [`TestClient`] at it, makes
//! assertions through the server's query accessors, and shuts both down.
//! Every process is tied to a parent [`CancellationToken`] so a whole test
//! run can be torn down at once.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

pub mod address;
pub mod classify;
pub mod client;
pub mod config;
pub mod environment;
pub mod error;
pub mod process;
pub mod profile;
pub mod protocol;
pub mod readiness;
pub mod server;
pub mod shutdown;
pub mod workspace;

pub use address::{Address, MpdAddress};
pub use client::{ClientOptions, TestClient};
pub use config::{Password, ServerConfig};
pub use environment::Environment;
pub use error::{HarnessError, Result};
pub use process::{spawn, Instance, Instrumentation, OutputBuffer, SpawnSpec};
pub use profile::MassifProfile;
pub use readiness::{wait_indexed, wait_ready, Backoff};
pub use server::{MpdOptions, PlayState, TestMpd};
pub use shutdown::{ExitFailure, ExitOutcome, ShutdownType};
pub use workspace::Workspace;
