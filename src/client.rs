use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::address::{Address, MpdAddress};
use crate::environment::Environment;
use crate::error::{HarnessError, Result};
use crate::process::{spawn, Instance, Instrumentation, OutputBuffer, SpawnSpec};
use crate::profile::{MassifProfile, ProfileError};
use crate::shutdown::ShutdownType;

/// How long a client gets to exit before it is force-killed.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for starting a client under test.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server the client is pointed at through `MPD_HOST` / `MPD_PORT`.
    pub address: Option<Address>,
    /// Arguments passed to the client binary.
    pub args: Vec<String>,
    /// Extra variables for the client. `MPD_HOST` / `MPD_PORT` derived from
    /// `address` take precedence over the same names set here.
    pub environment: Environment,
    /// Run under massif and keep the heap profile for [`TestClient::heap_profile`].
    pub heap_profile: bool,
    /// Overrides the valgrind binary used for heap profiling.
    pub valgrind: Option<PathBuf>,
    /// How long [`TestClient::shutdown`] waits before force-killing.
    pub shutdown_timeout: Duration,
}

impl ClientOptions {
    /// Options pointing the client at `server`.
    pub fn for_server(server: &impl MpdAddress) -> Self {
        Self {
            address: Some(server.address()),
            ..Default::default()
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            address: None,
            args: Vec::new(),
            environment: Environment::new(),
            heap_profile: false,
            valgrind: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// A running instance of the client under test.
///
/// The client needs no readiness probe; it is usable as soon as it has
/// been spawned.
#[derive(Debug)]
pub struct TestClient {
    instance: Instance,
    shutdown_timeout: Duration,
}

impl TestClient {
    /// Starts the client at `path`.
    ///
    /// # Arguments
    /// * `parent` - Token the client's own cancellation token derives from
    /// * `path` - Client binary
    /// * `opts` - Address, arguments, environment and profiling options
    ///
    /// # Returns
    /// * `Result<Self>` - The running client, or [`HarnessError::Spawn`] if it
    ///   could not be started
    pub fn new(parent: &CancellationToken, path: impl Into<PathBuf>, opts: ClientOptions) -> Result<Self> {
        let mut environment = opts.environment;
        if let Some(address) = &opts.address {
            environment.extend(Environment::for_address(address));
        }

        let instrumentation = opts.heap_profile.then(|| match &opts.valgrind {
            Some(tool) => Instrumentation::massif_with(tool.clone()),
            None => Instrumentation::massif(),
        });

        let spec = SpawnSpec {
            program: path.into(),
            args: opts.args,
            environment,
            instrumentation,
            ..Default::default()
        };

        Ok(Self {
            instance: spawn(parent, spec)?,
            shutdown_timeout: opts.shutdown_timeout,
        })
    }

    /// The underlying managed process.
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// True once the client has exited, whether or not it was asked to.
    pub fn has_exited(&mut self) -> bool {
        self.instance.has_exited()
    }

    /// Captured standard output so far.
    pub fn stdout(&self) -> &OutputBuffer {
        self.instance.stdout()
    }

    /// Captured standard error so far.
    pub fn stderr(&self) -> &OutputBuffer {
        self.instance.stderr()
    }

    /// Stops the client.
    ///
    /// A hard (or unspecified) shutdown kills the client and treats that kill
    /// as success. A soft shutdown waits for the client to exit on its own
    /// and fails if it does not do so cleanly within the shutdown timeout.
    pub async fn shutdown(&mut self, shutdown_type: ShutdownType) -> Result<()> {
        self.instance.shutdown(shutdown_type, self.shutdown_timeout).await
    }

    /// Reads the heap profile written by massif, deleting the file once it
    /// has been read.
    ///
    /// Only meaningful after shutdown. A second call fails because the
    /// artifact is gone.
    pub fn heap_profile(&self) -> Result<MassifProfile> {
        let path = self.instance.profile_path().ok_or(HarnessError::ProfilingDisabled)?;

        let text = std::fs::read_to_string(path)
            .map_err(|e| ProfileError::Read(format!("{}: {}", path.display(), e)))?;
        if let Err(e) = std::fs::remove_file(path) {
            debug!("Removing heap profile {}: {}", path.display(), e);
        }

        Ok(text.parse::<MassifProfile>()?)
    }
}
