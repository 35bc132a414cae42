use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::address::Address;
use crate::environment::Environment;
use crate::error::{HarnessError, Result};
use crate::shutdown::ExitOutcome;

/// How long capture readers may keep running after the process exits.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Result delivered by the exit waiter. The error is shared so every
/// observer can hold a copy.
pub type WaitResult = std::result::Result<ExitStatus, Arc<std::io::Error>>;

/// A tool that wraps the process under test and writes a profile artifact.
#[derive(Debug, Clone)]
pub struct Instrumentation {
    /// Tool binary, e.g. `valgrind`.
    pub tool: PathBuf,
    /// Short name used in the artifact file name.
    pub name: String,
    /// Arguments placed before the wrapped binary. `{out}` is replaced with
    /// the artifact path.
    pub args: Vec<String>,
}

impl Instrumentation {
    /// Heap profiling with valgrind's massif tool.
    pub fn massif() -> Self {
        Self::massif_with("valgrind")
    }

    /// Massif heap profiling through a specific valgrind binary.
    pub fn massif_with(tool: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            name: "massif".to_string(),
            args: vec![
                "--tool=massif".to_string(),
                "--massif-out-file={out}".to_string(),
            ],
        }
    }

    fn artifact_path(&self) -> PathBuf {
        std::env::temp_dir().join(format!("{}.{}", self.name, Uuid::new_v4().simple()))
    }

    fn tool_args(&self, out: &Path) -> Vec<String> {
        let out = out.to_string_lossy();
        self.args.iter().map(|a| a.replace("{out}", &out)).collect()
    }
}

/// Everything needed to launch one managed process.
#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    /// Binary to run.
    pub program: PathBuf,
    /// Arguments passed to the binary.
    pub args: Vec<String>,
    /// Layered over the inherited environment.
    pub environment: Environment,
    /// Working directory. Inherited when unset.
    pub working_directory: Option<PathBuf>,
    /// Tool to run the binary under, e.g. massif.
    pub instrumentation: Option<Instrumentation>,
    /// Address the process advertises, for servers.
    pub address: Option<Address>,
}

impl SpawnSpec {
    /// A spec running `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Appends arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Append-only capture of one output stream.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer(Arc<Mutex<Vec<u8>>>);

impl OutputBuffer {
    /// A copy of everything captured so far.
    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// The captured bytes as text, replacing invalid UTF-8.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    fn append(&self, bytes: &[u8]) {
        self.lock().extend_from_slice(bytes);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn capture<R>(&self, mut reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = self.clone();
        tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => buffer.append(&chunk[..n]),
                    Err(e) => {
                        debug!("Output capture stopped: {}", e);
                        break;
                    }
                }
            }
        })
    }
}

/// Single-slot delivery of the process exit result.
///
/// The background waiter sends exactly once. The first observer caches the
/// value, so later observers get it without waiting again.
#[derive(Debug)]
pub(crate) struct ExitWaiter {
    rx: Option<oneshot::Receiver<WaitResult>>,
    result: Option<WaitResult>,
}

impl ExitWaiter {
    /// Waits for the exit result. Cancel-safe: dropping the future before it
    /// completes leaves the pending result in place.
    pub(crate) async fn wait(&mut self) -> WaitResult {
        if let Some(result) = &self.result {
            return result.clone();
        }

        let result = match self.rx.as_mut() {
            Some(rx) => rx.await.unwrap_or_else(|_| Err(waiter_gone())),
            None => Err(Arc::new(std::io::Error::other("exit waiter missing"))),
        };
        self.rx = None;
        self.result = Some(result.clone());
        result
    }

    /// Returns the exit result without waiting, if it has been delivered.
    ///
    /// A waiter that went away without sending (e.g. aborted during runtime
    /// shutdown) counts as delivered with an error, and the spent receiver is
    /// dropped so it is never polled again.
    pub(crate) fn try_result(&mut self) -> Option<WaitResult> {
        if self.result.is_none() {
            if let Some(rx) = self.rx.as_mut() {
                match rx.try_recv() {
                    Ok(result) => {
                        self.rx = None;
                        self.result = Some(result);
                    }
                    Err(oneshot::error::TryRecvError::Closed) => {
                        self.rx = None;
                        self.result = Some(Err(waiter_gone()));
                    }
                    Err(oneshot::error::TryRecvError::Empty) => {}
                }
            }
        }
        self.result.clone()
    }
}

fn waiter_gone() -> Arc<std::io::Error> {
    Arc::new(std::io::Error::other("exit waiter went away"))
}

/// One managed external process.
///
/// The instance owns the process exclusively. The process is killed when the
/// instance's cancellation token fires, which happens on hard shutdown, on a
/// shutdown timeout, when the parent token is cancelled, or when the instance
/// is dropped.
#[derive(Debug)]
pub struct Instance {
    pub(crate) program: String,
    pub(crate) pid: Option<u32>,
    pub(crate) address: Option<Address>,
    pub(crate) stdout: OutputBuffer,
    pub(crate) stderr: OutputBuffer,
    pub(crate) errors: Vec<HarnessError>,
    pub(crate) cancel: CancellationToken,
    pub(crate) exit: ExitWaiter,
    pub(crate) profile_path: Option<PathBuf>,
    pub(crate) outcome: Option<ExitOutcome>,
}

impl Instance {
    /// Display name of the managed program.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// OS process id, if the OS reported one at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Address the process serves on, for server instances.
    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    /// Captured standard output so far.
    pub fn stdout(&self) -> &OutputBuffer {
        &self.stdout
    }

    /// Captured standard error so far.
    pub fn stderr(&self) -> &OutputBuffer {
        &self.stderr
    }

    /// Non-fatal errors observed while using this instance, oldest first.
    pub fn errors(&self) -> &[HarnessError] {
        &self.errors
    }

    /// True if no errors have been recorded.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Appends an error to the instance error log.
    pub fn record_error(&mut self, err: impl Into<HarnessError>) {
        let err = err.into();
        debug!("{}: Recording error: {}", self.program, err);
        self.errors.push(err);
    }

    /// Unwraps `result`, recording the error and returning `None` on failure.
    pub fn maybe_err<T, E: Into<HarnessError>>(&mut self, result: std::result::Result<T, E>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.record_error(e);
                None
            }
        }
    }

    /// Kills the process. Repeated calls are no-ops.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!("{}: Cancelling", self.program);
            self.cancel.cancel();
        }
    }

    /// True once the instance has been cancelled, directly or through its parent.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once the exit result has been delivered.
    pub fn has_exited(&mut self) -> bool {
        self.exit.try_result().is_some()
    }

    /// Path of the profile artifact, when running under instrumentation.
    pub fn profile_path(&self) -> Option<&Path> {
        self.profile_path.as_deref()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if self.outcome.is_none() && !self.cancel.is_cancelled() {
            warn!("{} dropped without shutdown, killing it", self.program);
        }
        self.cancel.cancel();
    }
}

/// Starts the process described by `spec`.
///
/// The process gets a token derived from `parent`; cancelling either one
/// kills the process (and its process group). If the OS refuses to start the
/// process, the derived token is cancelled and no instance is returned.
///
/// Must be called from within a Tokio runtime.
///
/// # Arguments
/// * `parent` - Token the instance's own token derives from
/// * `spec` - Binary, arguments, environment and optional instrumentation
///
/// # Returns
/// * `Result<Instance>` - The running instance, or [`HarnessError::Spawn`]
pub fn spawn(parent: &CancellationToken, spec: SpawnSpec) -> Result<Instance> {
    let cancel = parent.child_token();
    let program = spec.program.to_string_lossy().into_owned();

    let profile_path = spec.instrumentation.as_ref().map(Instrumentation::artifact_path);
    let mut command = match (&spec.instrumentation, &profile_path) {
        (Some(instr), Some(out)) => {
            let mut command = Command::new(&instr.tool);
            command.args(instr.tool_args(out)).arg(&spec.program);
            command
        }
        _ => Command::new(&spec.program),
    };
    command.args(&spec.args);

    for (key, value) in spec.environment.iter() {
        command.env(key, value);
    }
    if let Some(ref dir) = spec.working_directory {
        command.current_dir(dir);
    }

    // A fresh process group lets a kill reach anything the process forks.
    #[cfg(unix)]
    command.process_group(0);
    command.kill_on_drop(true);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    info!("Spawning {} {:?}", program, spec.args);
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(source) => {
            cancel.cancel();
            return Err(HarnessError::Spawn { program, source });
        }
    };

    let pid = child.id();
    let stdout = OutputBuffer::default();
    let stderr = OutputBuffer::default();
    let mut readers = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        readers.push(stdout.capture(out));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(stderr.capture(err));
    }

    let (tx, rx) = oneshot::channel();
    tokio::spawn(wait_for_exit(child, cancel.clone(), readers, tx, program.clone()));

    info!("{} spawned with PID {:?}", program, pid);
    Ok(Instance {
        program,
        pid,
        address: spec.address,
        stdout,
        stderr,
        errors: Vec::new(),
        cancel,
        exit: ExitWaiter {
            rx: Some(rx),
            result: None,
        },
        profile_path,
        outcome: None,
    })
}

/// The per-instance background task: blocks on process completion (killing
/// the process if the token fires first), kills whatever is left of its
/// process group, lets the capture readers drain, and delivers the result
/// exactly once.
///
/// The result is decided by the leader's exit. Leftover descendants are
/// killed before draining, so they cannot delay delivery past the grace
/// period, and cancellation during the drain still reaches the group.
async fn wait_for_exit(
    mut child: Child,
    cancel: CancellationToken,
    readers: Vec<JoinHandle<()>>,
    tx: oneshot::Sender<WaitResult>,
    program: String,
) {
    let pid = child.id();
    let result = tokio::select! {
        status = child.wait() => status,
        () = cancel.cancelled() => {
            debug!("{}: Cancellation fired, killing process group", program);
            kill_process_group(pid);
            if let Err(e) = child.start_kill() {
                debug!("{}: Kill after cancellation: {}", program, e);
            }
            child.wait().await
        }
    };

    match &result {
        Ok(status) => info!("{} exited with status: {}", program, status),
        Err(e) => warn!("Error waiting for {}: {}", program, e),
    }

    // Descendants left in the group would otherwise hold the capture pipes
    // open and outlive their parent.
    kill_process_group(pid);

    let mut readers = readers;
    if cancel.is_cancelled() {
        drain_output(&mut readers, &program).await;
    } else {
        tokio::select! {
            () = drain_output(&mut readers, &program) => {}
            () = cancel.cancelled() => {
                debug!("{}: Cancelled while draining output, killing process group", program);
                kill_process_group(pid);
            }
        }
    }
    for reader in &readers {
        reader.abort();
    }

    // The receiver may already be gone if the instance was dropped.
    let _ = tx.send(result.map_err(Arc::new));
}

/// Gives each capture reader [`OUTPUT_DRAIN_GRACE`] to reach EOF, aborting
/// the ones that do not.
async fn drain_output(readers: &mut [JoinHandle<()>], program: &str) {
    for reader in readers.iter_mut() {
        if tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut *reader).await.is_err() {
            warn!("{}: Output still open {:?} after exit, freezing capture", program, OUTPUT_DRAIN_GRACE);
            reader.abort();
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    use crate::classify::TERMINATION_SIGNAL;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    match kill(Pid::from_raw(-pid), TERMINATION_SIGNAL) {
        Ok(()) | Err(nix::Error::ESRCH) => {}
        Err(e) => warn!("Failed to send {:?} to process group {}: {}", TERMINATION_SIGNAL, pid, e),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}
