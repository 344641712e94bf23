use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use livecast_core::{logging, Config, SharedConfig};
use livecast_stream::{FfmpegTranscoder, StreamController};

#[derive(Parser, Debug)]
#[command(name = "livecast")]
#[command(about = "Single-stream HLS broadcast server", long_about = None)]
struct Args {
    /// Configuration file (yaml, toml or json)
    #[arg(short, long)]
    config: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Keep published output in memory instead of the configured storage
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration (fail fast on misconfigurations)
    let config = match load_config(&args)? {
        Ok(config) => config,
        Err(errors) => {
            for e in &errors {
                eprintln!("Config validation error: {e}");
            }
            anyhow::bail!("Configuration validation failed with {} error(s)", errors.len());
        }
    };
    if args.check {
        println!("Configuration OK");
        return Ok(());
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("livecast starting...");
    info!(
        "Serving HLS from {} (staging in {})",
        config.storage.public_hls_path.display(),
        config.storage.private_hls_path.display()
    );
    if config.storage.dry_run {
        warn!("Dry run: published output is kept in memory only");
    }

    // 3. Start the stream subsystem
    let transcoder = Arc::new(FfmpegTranscoder::new(config.video.ffmpeg_path.clone()));
    let shared = SharedConfig::new(config);
    let (controller, worker) = StreamController::start(shared.clone(), transcoder)
        .await
        .context("Stream subsystem failed to start")?;
    info!("Stream subsystem ready, serving offline placeholder");

    // 4. Serve until shutdown; SIGHUP reloads the configuration
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut reload = ReloadSignal::install();
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            () = reload.recv() => {
                if let Err(e) = reload_config(&args, &shared) {
                    warn!("Configuration not reloaded, keeping current: {:#}", e);
                }
            }
        }
    }
    info!("Shutdown signal received, starting graceful shutdown...");

    if let Err(e) = controller.shutdown().await {
        error!("Stream controller shutdown failed: {}", e);
    }
    if let Err(e) = worker.await {
        error!("Stream controller task failed: {}", e);
    }

    info!("livecast stopped");
    Ok(())
}

/// Load the configuration and apply command line overrides.
///
/// The outer error is a load failure; the inner one lists validation errors.
fn load_config(args: &Args) -> Result<std::result::Result<Config, Vec<String>>> {
    let mut config =
        Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if args.dry_run {
        config.storage.dry_run = true;
    }
    Ok(config.validate().map(|()| config))
}

/// Replace the shared configuration with a fresh load.
///
/// The controller picks it up at its next transition. Staging paths and
/// logging settings stay as they were at startup.
fn reload_config(args: &Args, shared: &SharedConfig) -> Result<()> {
    let config = load_config(args)?.map_err(|errors| anyhow::anyhow!(errors.join("; ")))?;
    shared.replace(config);
    info!("Configuration reloaded, applied at the next transition");
    Ok(())
}

/// SIGHUP listener; never fires where the signal does not exist.
struct ReloadSignal {
    #[cfg(unix)]
    hangup: Option<tokio::signal::unix::Signal>,
}

#[cfg(unix)]
impl ReloadSignal {
    fn install() -> Self {
        use tokio::signal::unix::{signal, SignalKind};

        let hangup = match signal(SignalKind::hangup()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                error!("Failed to install SIGHUP handler: {}", e);
                None
            }
        };
        Self { hangup }
    }

    async fn recv(&mut self) {
        if let Some(hangup) = self.hangup.as_mut() {
            if hangup.recv().await.is_some() {
                info!("Received SIGHUP");
                return;
            }
            self.hangup = None;
        }
        std::future::pending::<()>().await;
    }
}

#[cfg(not(unix))]
impl ReloadSignal {
    fn install() -> Self {
        Self {}
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
