use crate::integration::infrastructure::*;
use anyhow::Result;
use mpd_harness::protocol::ProtocolError;
use mpd_harness::{Address, Backoff, HarnessError, MpdOptions, PlayState, TestMpd};
use std::time::Duration;

const FAST: Backoff = Backoff::new(Duration::from_millis(20), Duration::from_secs(2));

/// Options for a "server" that is really a sleeping stub, while the fake
/// answers on `address`.
fn stub_options(harness: &StubHarness, address: Address) -> Result<MpdOptions> {
    let mut opts = MpdOptions::new(harness.temp_path().join("music"));
    opts.bin_path = Some(harness.write_script("mpd", "exec sleep 60")?);
    opts.config.bind_address = Some(address);
    opts.connect = FAST;
    opts.update_db = FAST;
    opts.shutdown_timeout = Duration::from_secs(5);
    Ok(opts)
}

/// An address nothing listens on
async fn dead_address() -> Result<Address> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(Address::tcp("127.0.0.1", port))
}

#[tokio::test]
async fn test_server_waits_for_indexing_then_answers_queries() -> Result<()> {
    let harness = StubHarness::new()?;
    let fake = FakeMpd::start(FakeState {
        song: Some(1),
        state: "play".to_string(),
        updating_polls: 2,
        ..FakeState::with_library(&["a.mp3", "b.mp3", "c.mp3"])
    })
    .await?;

    let mut mpd = TestMpd::new(harness.parent(), stub_options(&harness, fake.address())?).await?;

    // two polls still updating, then one clean status
    assert_eq!(fake.count("status"), 3);
    assert_eq!(mpd.address(), fake.address());

    assert_eq!(mpd.db().await, vec!["a.mp3", "b.mp3", "c.mp3"]);
    assert_eq!(mpd.queue().await, vec!["a.mp3", "b.mp3", "c.mp3"]);
    assert_eq!(mpd.queue_pos().await, 1);
    assert_eq!(mpd.play_state().await, PlayState::Play);

    mpd.pause().await;
    assert_eq!(mpd.play_state().await, PlayState::Pause);
    mpd.play().await;
    assert_eq!(mpd.play_state().await, PlayState::Play);

    mpd.next().await;
    assert_eq!(mpd.queue_pos().await, 2);
    mpd.prev().await;
    assert_eq!(mpd.queue_pos().await, 1);

    assert!(mpd.is_ok(), "unexpected errors: {:?}", mpd.errors());
    mpd.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_server_workspace_and_config() -> Result<()> {
    let harness = StubHarness::new()?;
    let fake = FakeMpd::start(FakeState::with_library(&[])).await?;
    let mut opts = stub_options(&harness, fake.address())?;
    opts.config.default_permissions = vec!["read".to_string()];

    let mpd = TestMpd::new(harness.parent(), opts).await?;
    let root = mpd.root().to_path_buf();
    let conf = std::fs::read_to_string(mpd.config_path())?;

    assert!(mpd.config_path().starts_with(&root));
    assert!(root.join("playlists").is_dir());
    assert!(conf.contains("bind_to_address     \"127.0.0.1\""));
    assert!(conf.contains("default_permissions \"read\""));
    assert!(conf.contains("type\t\t\"null\""));

    mpd.shutdown().await?;
    assert!(!root.exists(), "workspace should be removed on shutdown");
    Ok(())
}

#[tokio::test]
async fn test_transport_errors_are_recorded_not_raised() -> Result<()> {
    let harness = StubHarness::new()?;
    let fake = FakeMpd::start(FakeState {
        deny: vec!["next".to_string()],
        ..FakeState::with_library(&["a.mp3"])
    })
    .await?;

    let mut mpd = TestMpd::new(harness.parent(), stub_options(&harness, fake.address())?).await?;
    assert!(mpd.is_ok());

    mpd.next().await;
    assert!(!mpd.is_ok());
    assert_eq!(mpd.errors().len(), 1);
    assert!(matches!(
        &mpd.errors()[0],
        HarnessError::Transport(ProtocolError::Ack { command, .. }) if command == "next"
    ));

    // The server process itself is fine, so teardown still succeeds.
    mpd.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_queue_pos_without_current_song() -> Result<()> {
    let harness = StubHarness::new()?;
    let fake = FakeMpd::start(FakeState::with_library(&["a.mp3"])).await?;

    let mut mpd = TestMpd::new(harness.parent(), stub_options(&harness, fake.address())?).await?;
    assert_eq!(mpd.queue_pos().await, -1);
    assert_eq!(mpd.play_state().await, PlayState::Stop);
    assert_eq!(mpd.errors().len(), 1);

    mpd.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_readiness_timeout_when_nothing_listens() -> Result<()> {
    let harness = StubHarness::new()?;
    let mut opts = stub_options(&harness, dead_address().await?)?;
    opts.connect = Backoff::new(Duration::from_millis(20), Duration::from_millis(200));

    let err = TestMpd::new(harness.parent(), opts).await.unwrap_err();
    match err {
        HarnessError::ReadinessTimeout { waited, last_error, .. } => {
            assert_eq!(waited, Duration::from_millis(200));
            assert!(last_error.is_some());
        }
        other => panic!("expected ReadinessTimeout, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_indexing_never_finishes() -> Result<()> {
    let harness = StubHarness::new()?;
    let fake = FakeMpd::start(FakeState {
        updating_polls: u32::MAX,
        ..FakeState::with_library(&[])
    })
    .await?;
    let mut opts = stub_options(&harness, fake.address())?;
    opts.update_db = Backoff::new(Duration::from_millis(20), Duration::from_millis(200));

    let err = TestMpd::new(harness.parent(), opts).await.unwrap_err();
    assert!(matches!(err, HarnessError::ReadinessTimeout { .. }), "got {:?}", err);
    Ok(())
}

#[tokio::test]
async fn test_lost_connection_while_indexing_is_permanent() -> Result<()> {
    let harness = StubHarness::new()?;
    let fake = FakeMpd::start(FakeState {
        hang_up_on_status: true,
        ..FakeState::with_library(&[])
    })
    .await?;

    let err = TestMpd::new(harness.parent(), stub_options(&harness, fake.address())?)
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::ProbeFailed { .. }), "got {:?}", err);
    assert_eq!(fake.count("status"), 1);
    Ok(())
}

#[tokio::test]
async fn test_missing_server_binary() -> Result<()> {
    let harness = StubHarness::new()?;
    let fake = FakeMpd::start(FakeState::with_library(&[])).await?;
    let mut opts = stub_options(&harness, fake.address())?;
    opts.bin_path = Some(harness.temp_path().join("no-such-mpd"));

    let err = TestMpd::new(harness.parent(), opts).await.unwrap_err();
    assert!(matches!(err, HarnessError::Spawn { .. }), "got {:?}", err);
    Ok(())
}
