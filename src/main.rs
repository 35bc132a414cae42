type Result<T> = color_eyre::eyre::Result<T>;

mod cli;
mod signals;

use clap::Parser;
use eyre::WrapErr;
use tokio::select;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, RunConfig};
use mpd_harness::{ClientOptions, ShutdownType, TestClient, TestMpd};
use signals::Signals;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = RunConfig::from_cli(cli)?;

    // Everything spawned below hangs off this token.
    let root = CancellationToken::new();
    let mut signals = Signals::new()?;

    let mut mpd = TestMpd::new(&root, config.mpd)
        .await
        .wrap_err("failed to start MPD")?;
    let address = mpd.address();
    info!("MPD ready, db has {} songs", mpd.db().await.len());
    println!("MPD_HOST={}", address.host);
    if let Some(port) = &address.port {
        println!("MPD_PORT={}", port);
    }

    let mut client = match config.client {
        Some((path, opts)) => {
            let opts = ClientOptions {
                address: Some(address.clone()),
                ..opts
            };
            let client = TestClient::new(&root, path.clone(), opts)
                .wrap_err_with(|| format!("failed to start client {}", path.display()))?;
            Some(client)
        }
        None => None,
    };

    let heap_profile = client
        .as_ref()
        .is_some_and(|c| c.instance().profile_path().is_some());

    run_until_stopped(&mut signals, &mut mpd, client.as_mut(), config.status_interval).await;

    let mut failed = false;
    if let Some(mut client) = client {
        let shutdown_type = if client.has_exited() {
            ShutdownType::Soft
        } else {
            ShutdownType::Hard
        };
        if let Err(e) = client.shutdown(shutdown_type).await {
            error!("Client: {}", e);
            failed = true;
        }
        let stderr = client.stderr().to_string_lossy();
        if !stderr.is_empty() {
            info!("Client stderr:\n{}", stderr);
        }
        if heap_profile {
            match client.heap_profile() {
                Ok(profile) => info!("Client peak heap: {} bytes", profile.peak_heap_bytes()),
                Err(e) => warn!("Could not read heap profile: {}", e),
            }
        }
    }

    if !mpd.is_ok() {
        for e in mpd.errors() {
            warn!("MPD communication error: {}", e);
        }
    }
    mpd.shutdown().await.wrap_err("failed to shut down MPD")?;
    root.cancel();

    if failed {
        return Err(eyre::eyre!("client did not exit cleanly"));
    }
    info!("Harness exiting");
    Ok(())
}

/// Waits for a stop signal or for the client to exit, logging server state
/// along the way.
async fn run_until_stopped(
    signals: &mut Signals,
    mpd: &mut TestMpd,
    mut client: Option<&mut TestClient>,
    status_interval: std::time::Duration,
) {
    let mut status_tick = interval(status_interval);

    loop {
        select! {
            name = signals.next() => {
                info!("Received {}, shutting down", name);
                return;
            }

            _ = status_tick.tick() => {
                if let Some(client) = client.as_deref_mut() {
                    if client.has_exited() {
                        info!("Client exited on its own");
                        return;
                    }
                }
                let state = mpd.play_state().await;
                let queue = mpd.queue().await;
                debug!("MPD {:?} at {}, {} songs queued", state, mpd.address(), queue.len());
            }
        }
    }
}
