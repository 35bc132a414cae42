use clap::Parser;
use eyre::eyre;
use std::path::PathBuf;
use std::time::Duration;

use mpd_harness::{Backoff, ClientOptions, Environment, MpdOptions, Password};

type Result<T> = color_eyre::eyre::Result<T>;

/// Start a throwaway MPD server, optionally with a client attached
#[derive(Parser)]
#[command(name = "mpd-harness")]
#[command(about = "Start a throwaway MPD server, optionally with a client attached")]
#[command(version)]
pub struct Cli {
    /// Path to the MPD binary
    #[arg(long, default_value = "mpd")]
    pub mpd_bin: PathBuf,

    /// Root directory of the music library
    #[arg(long)]
    pub library_root: PathBuf,

    /// Comma-separated permissions for unauthenticated clients
    #[arg(long, value_delimiter = ',')]
    pub default_permissions: Vec<String>,

    /// Password grant as SECRET@perm,perm (repeatable)
    #[arg(long = "password")]
    pub passwords: Vec<String>,

    /// MPD output buffer size (KiB)
    #[arg(long)]
    pub max_output_buffer_kib: Option<u64>,

    /// How long to wait for the initial database scan (seconds)
    #[arg(long, default_value = "30")]
    pub update_db_timeout_secs: u64,

    /// How long the client gets to exit on shutdown (seconds)
    #[arg(long, default_value = "5")]
    pub shutdown_timeout_secs: u64,

    /// Extra client environment variable as KEY=VALUE (repeatable)
    #[arg(long = "client-env")]
    pub client_env: Vec<String>,

    /// Run the client under valgrind's massif and report its peak heap
    #[arg(long)]
    pub heap_profile: bool,

    /// Status logging interval (ms)
    #[arg(long, default_value = "2000")]
    pub status_interval_ms: u64,

    /// Client command to run against the server
    pub client: Option<PathBuf>,

    /// Arguments for the client
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub client_args: Vec<String>,
}

/// Configuration for one harness run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Options for the server under test
    pub mpd: MpdOptions,
    /// Client binary and its options. The address is filled in once the
    /// server is up.
    pub client: Option<(PathBuf, ClientOptions)>,
    /// How often server status is logged while running
    pub status_interval: Duration,
}

impl RunConfig {
    /// Parse command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let passwords = cli
            .passwords
            .iter()
            .map(|grant| parse_password(grant))
            .collect::<Result<Vec<_>>>()?;

        let mut mpd = MpdOptions::new(cli.library_root);
        mpd.bin_path = Some(cli.mpd_bin);
        mpd.config.default_permissions = cli.default_permissions;
        mpd.config.passwords = passwords;
        mpd.config.max_output_buffer_size = cli
            .max_output_buffer_kib
            .map(|kib| {
                kib.checked_mul(1024)
                    .ok_or_else(|| eyre!("Output buffer size of {} KiB is too large", kib))
            })
            .transpose()?;
        mpd.update_db = Backoff::new(
            mpd.update_db.interval,
            Duration::from_secs(cli.update_db_timeout_secs),
        );

        let mut environment = Environment::new();
        for var in &cli.client_env {
            let (key, value) = parse_env_var(var)?;
            environment.set(key, value);
        }

        let client = cli.client.map(|path| {
            let opts = ClientOptions {
                args: cli.client_args,
                environment,
                heap_profile: cli.heap_profile,
                shutdown_timeout: Duration::from_secs(cli.shutdown_timeout_secs),
                ..Default::default()
            };
            (path, opts)
        });

        Ok(RunConfig {
            mpd,
            client,
            status_interval: Duration::from_millis(cli.status_interval_ms),
        })
    }
}

/// Splits a `KEY=VALUE` pair. The value may itself contain `=`.
fn parse_env_var(var: &str) -> Result<(&str, &str)> {
    match var.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => Err(eyre!("Invalid environment variable '{}': expected KEY=VALUE", var)),
    }
}

fn parse_password(grant: &str) -> Result<Password> {
    let (secret, perms) = grant
        .split_once('@')
        .ok_or_else(|| eyre!("Invalid password grant '{}': expected SECRET@perm,perm", grant))?;
    if secret.is_empty() {
        return Err(eyre!("Invalid password grant '{}': empty password", grant));
    }
    Ok(Password {
        password: secret.to_string(),
        permissions: perms
            .split(',')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
    })
}
