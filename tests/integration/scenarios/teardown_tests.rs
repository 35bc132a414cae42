use crate::integration::infrastructure::*;
use anyhow::Result;
use mpd_harness::{spawn, ShutdownType, SpawnSpec, Workspace};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_parent_cancel_kills_every_instance() -> Result<()> {
    let harness = StubHarness::new()?;
    let mut instances = Vec::new();
    for _ in 0..3 {
        instances.push(harness.spawn_sh("sleep 60")?);
    }
    let pids: Vec<u32> = instances.iter().filter_map(|i| i.pid()).collect();
    assert_eq!(pids.len(), 3);

    harness.parent().cancel();

    for pid in &pids {
        assert!(
            wait_until_dead(*pid, Duration::from_secs(2)).await,
            "pid {} survived parent cancellation",
            pid
        );
    }
    for instance in &mut instances {
        assert!(instance.is_cancelled());
        instance.shutdown(ShutdownType::Hard, TIMEOUT).await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_cancel_reaches_grandchildren() -> Result<()> {
    let harness = StubHarness::new()?;
    let pid_file = harness.temp_path().join("grandchild.pid");
    let mut process = harness.spawn_sh(&format!(
        "sleep 60 & echo $! > {}; wait",
        pid_file.display()
    ))?;

    let mut grandchild = None;
    for _ in 0..50 {
        if let Ok(text) = std::fs::read_to_string(&pid_file) {
            if let Ok(pid) = text.trim().parse::<u32>() {
                grandchild = Some(pid);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let grandchild = grandchild.expect("grandchild pid written");

    process.shutdown(ShutdownType::Hard, TIMEOUT).await?;
    assert!(
        wait_until_dead(grandchild, Duration::from_secs(2)).await,
        "grandchild survived the process group kill"
    );
    Ok(())
}

#[tokio::test]
async fn test_dropped_instance_is_killed() -> Result<()> {
    let harness = StubHarness::new()?;
    let process = harness.spawn_sh("sleep 60")?;
    let pid = process.pid().expect("pid");

    drop(process);
    assert!(wait_until_dead(pid, Duration::from_secs(2)).await);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_trials_with_bounded_parallelism() -> Result<()> {
    let root = CancellationToken::new();
    let permits = Arc::new(Semaphore::new(3));
    let mut trials = Vec::new();

    for i in 0..8 {
        let root = root.clone();
        let permits = permits.clone();
        trials.push(tokio::spawn(async move {
            let _permit = permits.acquire_owned().await?;
            let mut workspace = Workspace::new("trial")?;
            let script = format!("echo trial {i}; pwd");
            let spec = SpawnSpec {
                working_directory: Some(workspace.root().to_path_buf()),
                ..SpawnSpec::new("sh").args(["-c", script.as_str()])
            };
            let mut instance = spawn(&root, spec)?;
            instance.shutdown(ShutdownType::Soft, TIMEOUT).await?;

            let output = instance.stdout().to_string_lossy();
            let expected = format!("trial {i}\n{}\n", workspace.root().display());
            workspace.cleanup()?;
            anyhow::Ok(output == expected)
        }));
    }

    for trial in trials {
        assert!(trial.await??, "trial output did not match");
    }
    root.cancel();
    Ok(())
}
