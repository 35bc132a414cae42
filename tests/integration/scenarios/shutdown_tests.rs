use crate::integration::infrastructure::*;
use anyhow::Result;
use mpd_harness::{ExitFailure, ExitOutcome, ShutdownType};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_clean_exit_soft_shutdown() -> Result<()> {
    let harness = StubHarness::new()?;
    let mut process = harness.spawn_sh("echo hello; echo oops >&2; exit 0")?;

    process.shutdown(ShutdownType::Soft, TIMEOUT).await?;

    assert_eq!(process.stdout().to_string_lossy(), "hello\n");
    assert_eq!(process.stderr().to_string_lossy(), "oops\n");
    assert_eq!(process.outcome(), Some(&ExitOutcome::Success));
    Ok(())
}

#[tokio::test]
async fn test_clean_exit_with_background_child_soft_shutdown() -> Result<()> {
    let harness = StubHarness::new()?;
    let pid_file = harness.temp_path().join("background.pid");
    let mut process = harness.spawn_sh(&format!(
        "sleep 30 & echo $! > {}; exit 0",
        pid_file.display()
    ))?;

    // The background sleep inherits stdout, so the pipe stays open after
    // the shell exits.
    let start = Instant::now();
    let outcome = process
        .shutdown_outcome(ShutdownType::Soft, Duration::from_millis(500))
        .await;

    assert_eq!(outcome, ExitOutcome::Success);
    assert_within(start.elapsed(), Duration::from_millis(500), "soft shutdown after clean exit");

    let background: u32 = std::fs::read_to_string(&pid_file)?.trim().parse()?;
    assert!(
        wait_until_dead(background, Duration::from_secs(2)).await,
        "background child of an exited process should be killed"
    );
    Ok(())
}

#[tokio::test]
async fn test_hard_shutdown_of_term_ignoring_process() -> Result<()> {
    let harness = StubHarness::new()?;
    let mut process = harness.spawn_sh("trap '' TERM; sleep 60")?;
    let pid = process.pid().expect("pid");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let start = Instant::now();
    process.shutdown(ShutdownType::Hard, TIMEOUT).await?;

    assert_within(start.elapsed(), TIMEOUT, "hard shutdown");
    assert!(!pid_alive(pid), "process should be dead after hard shutdown");
    assert_eq!(process.outcome(), Some(&ExitOutcome::ExpectedKill));
    Ok(())
}

#[tokio::test]
async fn test_unspecified_shutdown_kills_like_hard() -> Result<()> {
    let harness = StubHarness::new()?;
    let mut process = harness.spawn_sh("sleep 60")?;

    process.shutdown(ShutdownType::Unspecified, TIMEOUT).await?;
    assert_eq!(process.outcome(), Some(&ExitOutcome::ExpectedKill));
    Ok(())
}

#[tokio::test]
async fn test_soft_shutdown_timeout_kills_process() -> Result<()> {
    let harness = StubHarness::new()?;
    let mut process = harness.spawn_sh("sleep 60")?;
    let pid = process.pid().expect("pid");

    let start = Instant::now();
    let result = process
        .shutdown(ShutdownType::Soft, Duration::from_millis(300))
        .await;

    assert_shutdown_timed_out(&result, "sleeping process");
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert_within(start.elapsed(), Duration::from_secs(2), "soft shutdown timeout");
    assert!(
        wait_until_dead(pid, Duration::from_secs(2)).await,
        "timed out process should be killed"
    );
    Ok(())
}

#[tokio::test]
async fn test_failed_exit_reports_error_and_keeps_stderr() -> Result<()> {
    let harness = StubHarness::new()?;
    let mut process = harness.spawn_sh("echo 'bad argument' >&2; exit 1")?;

    let result = process.shutdown(ShutdownType::Soft, TIMEOUT).await;

    assert_process_failed(&result, "exit 1");
    assert!(process.stderr().to_string_lossy().contains("bad argument"));
    Ok(())
}

#[tokio::test]
async fn test_hard_shutdown_after_failed_exit_still_fails() -> Result<()> {
    let harness = StubHarness::new()?;
    let mut process = harness.spawn_sh("exit 3")?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let result = process.shutdown(ShutdownType::Hard, TIMEOUT).await;
    assert_process_failed(&result, "exit 3");
    Ok(())
}

#[tokio::test]
async fn test_repeated_shutdown_returns_cached_result() -> Result<()> {
    let harness = StubHarness::new()?;
    let mut process = harness.spawn_sh("exit 1")?;

    let first = process.shutdown(ShutdownType::Soft, TIMEOUT).await;
    assert_process_failed(&first, "first shutdown");

    // A different type on the second call must not change the answer.
    let start = Instant::now();
    let second = process.shutdown(ShutdownType::Hard, TIMEOUT).await;
    assert_within(start.elapsed(), Duration::from_millis(50), "cached shutdown");
    assert_process_failed(&second, "second shutdown");
    Ok(())
}

#[tokio::test]
async fn test_external_kill_is_failure_on_soft_shutdown() -> Result<()> {
    let harness = StubHarness::new()?;
    let mut process = harness.spawn_sh("sleep 60")?;
    let pid = process.pid().expect("pid");

    kill(Pid::from_raw(-(pid as i32)), Signal::SIGKILL)?;
    let outcome = process.shutdown_outcome(ShutdownType::Soft, TIMEOUT).await;

    assert!(
        matches!(outcome, ExitOutcome::Failure(ExitFailure::Status(_))),
        "an unrequested kill should be a failure, got {:?}",
        outcome
    );
    Ok(())
}

#[tokio::test]
async fn test_has_exited_tracks_process() -> Result<()> {
    let harness = StubHarness::new()?;
    let mut quick = harness.spawn_sh("exit 0")?;
    let mut slow = harness.spawn_sh("sleep 60")?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(quick.has_exited());
    assert!(!slow.has_exited());

    quick.shutdown(ShutdownType::Soft, TIMEOUT).await?;
    slow.shutdown(ShutdownType::Hard, TIMEOUT).await?;
    assert!(slow.has_exited());
    Ok(())
}
