//! CLI entry point for media-relay
//!
//! Parses command line arguments, loads the configuration and serves the
//! media root until Ctrl-C or SIGTERM.

use clap::Parser;
use media_relay::{run_server, run_startup_checks, Config, Relay};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How long unload waits for killed encoders to be reaped
const UNLOAD_WAIT: Duration = Duration::from_secs(5);

/// Media Relay - on-demand transcoding file server
#[derive(Parser, Debug)]
#[command(name = "media-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip startup checks (encoder version, served root). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn load_config(path: &Path) -> Result<Config, media_relay::config::ConfigError> {
    if path.exists() {
        Config::load(path)
    } else {
        let mut cfg = Config::default();
        cfg.apply_env_overrides();
        Ok(cfg)
    }
}

fn init_tracing(cfg: &Config) {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let default_level = if cfg.encoder.debug {
        "media_relay=debug"
    } else {
        "media_relay=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(env_filter)
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown requested");
}

/// Re-read the config file on SIGHUP; a file that fails to parse keeps the
/// current configuration.
#[cfg(unix)]
fn spawn_reload_task(relay: &Relay, path: PathBuf) {
    use tokio::signal::unix::{signal, SignalKind};

    let shared = relay.shared_config();
    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(sig) => sig,
            Err(e) => {
                warn!("Config reload disabled, cannot listen for SIGHUP: {}", e);
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match load_config(&path) {
                Ok(cfg) => {
                    *shared.write().await = cfg;
                    info!(path = %path.display(), "Configuration reloaded");
                }
                Err(e) => warn!(path = %path.display(), "Configuration reload failed: {}", e),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_task(_relay: &Relay, _path: PathBuf) {}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config);

    info!(config = %args.config.display(), root = %config.server.root.display(), "Media relay starting");

    if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(&config) {
        error!("Startup checks failed: {}", e);
        return ExitCode::FAILURE;
    }

    let bind = config.server.bind.clone();
    let relay = Relay::with_config(config);
    spawn_reload_task(&relay, args.config.clone());

    let result = run_server(relay.clone(), &bind, shutdown_signal()).await;

    // The server already unloaded when the signal fired; this catches
    // anything spawned while connections were draining.
    relay.unload();
    if !relay.supervisor().wait_idle(UNLOAD_WAIT).await {
        warn!(
            running = relay.supervisor().transcodes().len(),
            "Encoder processes still running after unload"
        );
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}
