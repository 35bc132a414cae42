use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::address::{Address, MpdAddress};
use crate::config::ServerConfig;
use crate::error::{HarnessError, Result};
use crate::process::{spawn, Instance, OutputBuffer, SpawnSpec};
use crate::protocol::{MpdClient, ProtocolError};
use crate::readiness::{wait_indexed, wait_ready, Backoff};
use crate::shutdown::ShutdownType;
use crate::workspace::Workspace;

/// How long to wait for MPD to accept connections.
pub const CONNECT_BACKOFF: Backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
/// How long to wait for MPD's initial database scan.
pub const UPDATE_DB_BACKOFF: Backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(30));
/// How long MPD gets to exit after being killed.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Options for starting a test MPD server.
#[derive(Debug, Clone)]
pub struct MpdOptions {
    /// MPD binary. `mpd` is looked up on the `PATH` when unset.
    pub bin_path: Option<PathBuf>,
    /// Rendered into the server's configuration file.
    pub config: ServerConfig,
    /// Budget for the server to accept connections.
    pub connect: Backoff,
    /// Budget for the initial database scan.
    pub update_db: Backoff,
    /// How long shutdown waits for the process to go away.
    pub shutdown_timeout: Duration,
}

impl MpdOptions {
    /// Default options serving `library_root`.
    pub fn new(library_root: impl Into<PathBuf>) -> Self {
        Self {
            bin_path: None,
            config: ServerConfig::new(library_root),
            connect: CONNECT_BACKOFF,
            update_db: UPDATE_DB_BACKOFF,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Play state reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Unknown,
    Play,
    Pause,
    Stop,
}

impl PlayState {
    fn parse(state: Option<&str>) -> Self {
        match state {
            Some("play") => PlayState::Play,
            Some("pause") => PlayState::Pause,
            Some("stop") => PlayState::Stop,
            _ => PlayState::Unknown,
        }
    }
}

/// A running MPD server with a private workspace, ready for queries.
///
/// Control and query methods never fail directly: transport errors are
/// appended to the instance error log and a neutral value is returned.
/// Check [`TestMpd::is_ok`] at teardown.
#[derive(Debug)]
pub struct TestMpd {
    instance: Instance,
    client: Option<MpdClient>,
    workspace: Workspace,
    config_path: PathBuf,
    shutdown_timeout: Duration,
}

impl TestMpd {
    /// Starts MPD, waits until it accepts connections, then waits for its
    /// initial database scan to finish.
    ///
    /// # Arguments
    /// * `parent` - Token the server process's token derives from
    /// * `opts` - Binary, configuration and readiness budgets
    ///
    /// # Returns
    /// * `Result<Self>` - A ready server. On any failure the process is
    ///   killed and the workspace removed before the error is returned.
    pub async fn new(parent: &CancellationToken, opts: MpdOptions) -> Result<Self> {
        let mut workspace = Workspace::new("mpd-harness")?;

        let (instance, config_path) = match Self::start(parent, &opts, &workspace) {
            Ok(started) => started,
            Err(e) => {
                if let Err(cleanup) = workspace.cleanup() {
                    warn!("Failed to remove MPD workspace: {}", cleanup);
                }
                return Err(e);
            }
        };

        let mut mpd = TestMpd {
            instance,
            client: None,
            workspace,
            config_path,
            shutdown_timeout: opts.shutdown_timeout,
        };

        if let Err(e) = mpd.await_ready(&opts).await {
            warn!("MPD never became ready: {}", e);
            if !mpd.instance.stderr().contents().is_empty() {
                warn!("MPD stderr: {}", mpd.instance.stderr().to_string_lossy());
            }
            if let Err(teardown) = mpd.teardown(ShutdownType::Hard).await {
                warn!("Failed to tear down MPD after readiness failure: {}", teardown);
            }
            return Err(e);
        }

        info!("MPD ready at {}", mpd.address());
        Ok(mpd)
    }

    fn start(
        parent: &CancellationToken,
        opts: &MpdOptions,
        workspace: &Workspace,
    ) -> Result<(Instance, PathBuf)> {
        let (conf, address) = opts.config.build(workspace.root());

        let config_path = workspace.path(["mpd.conf"]);
        std::fs::write(&config_path, conf).map_err(|source| HarnessError::Workspace {
            path: config_path.clone(),
            source,
        })?;
        let playlists = workspace.path(["playlists"]);
        std::fs::create_dir_all(&playlists).map_err(|source| HarnessError::Workspace {
            path: playlists,
            source,
        })?;

        let spec = SpawnSpec {
            address: Some(address),
            ..SpawnSpec::new(opts.bin_path.clone().unwrap_or_else(|| PathBuf::from("mpd")))
                .args(["--no-daemon", "--stderr"])
                .args([config_path.to_string_lossy()])
        };
        let instance = spawn(parent, spec)?;
        Ok((instance, config_path))
    }

    async fn await_ready(&mut self, opts: &MpdOptions) -> Result<()> {
        let address = self.address();
        let what = format!("connection to MPD at {address}");
        let target = &address;
        let client = wait_ready(&what, opts.connect, move || MpdClient::connect(target)).await?;

        // MPD reports `updating_db` in its status while the scan runs.
        let client = Mutex::new(client);
        let shared = &client;
        wait_indexed("MPD database update", opts.update_db, move || async move {
            let status = shared.lock().await.status().await?;
            Ok::<_, ProtocolError>(status.contains_key("updating_db"))
        })
        .await?;

        self.client = Some(client.into_inner());
        Ok(())
    }

    /// Address the server listens on.
    pub fn address(&self) -> Address {
        self.instance
            .address()
            .cloned()
            .unwrap_or_else(|| Address::unix(self.workspace.path(["socket"])))
    }

    /// The generated configuration file.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Root of this server's private workspace.
    pub fn root(&self) -> &Path {
        self.workspace.root()
    }

    /// The underlying managed process.
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Captured standard output so far.
    pub fn stdout(&self) -> &OutputBuffer {
        self.instance.stdout()
    }

    /// Captured standard error so far. MPD logs here with `--stderr`.
    pub fn stderr(&self) -> &OutputBuffer {
        self.instance.stderr()
    }

    /// Errors observed while talking to this server.
    pub fn errors(&self) -> &[HarnessError] {
        self.instance.errors()
    }

    /// True if no errors have been observed while talking to this server.
    pub fn is_ok(&self) -> bool {
        self.instance.is_ok()
    }

    fn client(&mut self) -> std::result::Result<&mut MpdClient, ProtocolError> {
        self.client.as_mut().ok_or(ProtocolError::Closed)
    }

    /// Resumes playback of the current song.
    pub async fn play(&mut self) {
        let result = async { self.client()?.pause(false).await }.await;
        self.instance.maybe_err(result);
    }

    /// Pauses playback.
    pub async fn pause(&mut self) {
        let result = async { self.client()?.pause(true).await }.await;
        self.instance.maybe_err(result);
    }

    /// Skips the current song.
    pub async fn next(&mut self) {
        let result = async { self.client()?.next().await }.await;
        self.instance.maybe_err(result);
    }

    /// Goes back to the previous song.
    pub async fn prev(&mut self) {
        let result = async { self.client()?.previous().await }.await;
        self.instance.maybe_err(result);
    }

    /// URIs of every song in the database.
    pub async fn db(&mut self) -> Vec<String> {
        let result = async { self.client()?.list_files().await }.await;
        self.instance.maybe_err(result).unwrap_or_default()
    }

    /// URIs of the songs in the queue, in queue order.
    pub async fn queue(&mut self) -> Vec<String> {
        let result = async { self.client()?.playlist_info().await }.await;
        self.instance
            .maybe_err(result)
            .map(|songs| {
                songs
                    .into_iter()
                    .filter_map(|mut song| song.remove("file"))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Queue position of the current song, or -1 (with an error recorded)
    /// when the server reports none.
    pub async fn queue_pos(&mut self) -> i64 {
        let result = async { self.client()?.status().await }.await;
        let Some(status) = self.instance.maybe_err(result) else {
            return -1;
        };
        let song = status.get("song").map(String::as_str).unwrap_or_default();
        match song.parse::<i64>() {
            Ok(pos) => pos,
            Err(_) => {
                self.instance
                    .record_error(ProtocolError::Malformed(format!("song: {song:?}")));
                -1
            }
        }
    }

    /// Current play state, or [`PlayState::Unknown`] if it cannot be queried.
    pub async fn play_state(&mut self) -> PlayState {
        let result = async { self.client()?.status().await }.await;
        match self.instance.maybe_err(result) {
            Some(status) => PlayState::parse(status.get("state").map(String::as_str)),
            None => PlayState::Unknown,
        }
    }

    /// Stops the server and removes its workspace.
    ///
    /// MPD is killed outright; being killed is not reported as an error.
    pub async fn shutdown(mut self) -> Result<()> {
        self.teardown(ShutdownType::Hard).await
    }

    async fn teardown(&mut self, shutdown_type: ShutdownType) -> Result<()> {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.close().await {
                warn!("Closing MPD connection: {}", e);
            }
        }
        let result = self.instance.shutdown(shutdown_type, self.shutdown_timeout).await;
        let cleanup = self.workspace.cleanup();
        result.and(cleanup)
    }
}

impl MpdAddress for TestMpd {
    fn address(&self) -> Address {
        TestMpd::address(self)
    }
}
