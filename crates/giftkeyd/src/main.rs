use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use giftkey_server::clock::{Clock, SystemClock};
use giftkey_server::keys::{ActivationWindowPolicy, KeyManager, LifecycleConfig};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "giftkeyd",
    about = "Giftkeyd — gift relay and license key server daemon",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, env = "GIFTKEY_PORT", default_value = "3000")]
        port: u16,
        /// Host to bind
        #[arg(long, env = "GIFTKEY_HOST", default_value = "0.0.0.0")]
        host: String,
        /// Log level: error, warn, info, debug, verbose (default: warn)
        #[arg(long, env = "GIFTKEY_LOG_LEVEL")]
        log_level: Option<String>,
        #[command(flatten)]
        lifecycle: LifecycleArgs,
        /// How often expired keys are swept, e.g. "10m"
        #[arg(long, env = "GIFTKEY_REAPER_INTERVAL", default_value = "10m", value_parser = parse_nonzero_duration)]
        reaper_interval: Duration,
    },
    /// Run one expiry sweep against the data directory and exit.
    Sweep,
}

#[derive(clap::Args)]
struct LifecycleArgs {
    /// Heartbeat age after which a key is shown offline, e.g. "5m"
    #[arg(long, env = "GIFTKEY_LIVENESS_TIMEOUT", default_value = "5m", value_parser = humantime::parse_duration)]
    liveness_timeout: Duration,
    /// Duration granted to keys created without an explicit one
    #[arg(long, env = "GIFTKEY_DEFAULT_DURATION_DAYS", default_value_t = 7)]
    default_duration_days: u32,
    /// When a key's countdown starts: "first-verify" or "creation"
    #[arg(long, env = "GIFTKEY_ACTIVATION_WINDOW", default_value = "first-verify")]
    activation_window: ActivationWindowPolicy,
}

impl From<LifecycleArgs> for LifecycleConfig {
    fn from(args: LifecycleArgs) -> Self {
        Self {
            liveness_timeout: args.liveness_timeout,
            default_duration_days: args.default_duration_days,
            window_policy: args.activation_window,
        }
    }
}

/// Like `humantime::parse_duration`, but a zero duration is an error.
fn parse_nonzero_duration(s: &str) -> Result<Duration, String> {
    let d = humantime::parse_duration(s).map_err(|e| e.to_string())?;
    if d.is_zero() {
        return Err("duration must be greater than zero".into());
    }
    Ok(d)
}

/// Describes a `.env` load failure worth reporting; a missing file is not one.
fn env_file_problem<T>(loaded: dotenvy::Result<T>) -> Option<String> {
    match loaded {
        Err(e) if !e.not_found() => Some(format!("ignoring unreadable .env file: {e}")),
        _ => None,
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal; anything set in the real environment wins.
    if let Some(msg) = env_file_problem(dotenvy::dotenv()) {
        eprintln!("giftkeyd: {msg}");
    }
    let cli = Cli::parse();

    let effective_log_level = if let Commands::Serve { ref log_level, .. } = cli.command {
        let raw = log_level
            .clone()
            .or_else(|| std::env::var("GIFTKEY_LOG_LEVEL").ok())
            .unwrap_or_else(|| "warn".into());
        if raw.eq_ignore_ascii_case("verbose") {
            "debug".to_owned()
        } else {
            raw
        }
    } else {
        std::env::var("GIFTKEY_LOG_LEVEL").unwrap_or_else(|_| "warn".into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&effective_log_level))
        .init();

    match cli.command {
        Commands::Serve {
            port,
            host,
            log_level: _,
            lifecycle,
            reaper_interval,
        } => cmd_serve(host, port, lifecycle.into(), reaper_interval).await,

        Commands::Sweep => cmd_sweep(),
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(
    host: String,
    port: u16,
    lifecycle: LifecycleConfig,
    reaper_interval: Duration,
) -> Result<()> {
    let cfg = giftkey_server::ServerConfig {
        host,
        port,
        lifecycle,
        reaper_interval,
        ..Default::default()
    };

    giftkey_server::run(cfg).await
}

fn cmd_sweep() -> Result<()> {
    let data_dir_env: Option<PathBuf> = std::env::var("GIFTKEY_DATA_DIR").ok().map(Into::into);
    let data_dir = giftkey_server::resolve_data_dir(data_dir_env.as_ref())?;
    let store = giftkey_server::server::open_store(&data_dir)?;

    let keys = KeyManager::new(std::sync::Arc::new(store), LifecycleConfig::default());
    let removed = keys.sweep_expired(SystemClock.now())?;

    println!("removed {removed} expired key(s)");
    Ok(())
}
