//! logproxy - change-data-capture proxy
//!
//! Accepts client subscriptions over TCP and hands each admitted client to
//! its own log reader worker process.
//!
//! # Usage
//!
//! ```bash
//! # Start with a configuration file
//! logproxy -f conf/conf.json
//!
//! # Override the listen port and log at debug level
//! logproxy -f conf/conf.json -P 2983 -V
//!
//! # Encrypt a system account secret for the configuration file
//! logproxy -x 'secret'
//!
//! # Enable debug logging for a single crate
//! RUST_LOG=logproxyd=debug logproxy -f conf/conf.json
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown, workers are terminated

use std::path::PathBuf;
use std::process::{self, ExitCode};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::{error, info};

use logproxy_core::{cipher, ProxyConfig};
use logproxyd::arranger::{AllowAll, Arranger, Authenticator, UpstreamAuthenticator};
use logproxyd::logging;
use logproxyd::worker;

/// logproxy - change-data-capture proxy
#[derive(Parser, Debug)]
#[command(name = "logproxy", version, about, disable_version_flag = true)]
struct Args {
    /// Configuration file (JSON); absent keys take their defaults
    #[arg(short = 'f', long = "file", value_name = "CONFIG")]
    file: Option<PathBuf>,

    /// Listen port, overrides `service_port`
    #[arg(short = 'P', long = "listen-port", value_name = "PORT")]
    listen_port: Option<u16>,

    /// Debug mode: workers read but never send records
    #[arg(short = 'D', long)]
    debug: bool,

    /// Log at debug level
    #[arg(short = 'V', long)]
    verbose: bool,

    /// Print the encrypted hex of TEXT and exit
    #[arg(short = 'x', long = "encrypt", value_name = "TEXT", conflicts_with = "decrypt")]
    encrypt: Option<String>,

    /// Print the plaintext of HEX and exit
    #[arg(short = 'y', long = "decrypt", value_name = "HEX")]
    decrypt: Option<String>,

    /// Print version
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: (),

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve one client; started by the proxy, not by hand
    #[command(hide = true)]
    Worker,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Some(Command::Worker) = args.command {
        return run_worker();
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("logproxy: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = match &args.file {
        Some(path) => ProxyConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ProxyConfig::default(),
    };

    if let Some(text) = &args.encrypt {
        let hex = cipher::encrypt(&config.cipher_key, text).context("Failed to encrypt")?;
        println!("{hex}");
        return Ok(());
    }
    if let Some(hex) = &args.decrypt {
        let text = cipher::decrypt(&config.cipher_key, hex).context("Failed to decrypt")?;
        println!("{text}");
        return Ok(());
    }

    if let Some(port) = args.listen_port {
        config.service_port = port;
    }
    config.debug |= args.debug;
    config.verbose |= args.verbose;
    config.validate().context("Invalid configuration")?;

    run_proxy(config)
}

/// Runs the proxy (async entry point).
#[tokio::main]
async fn run_proxy(config: ProxyConfig) -> Result<()> {
    logging::init_stdout(config.verbose).context("Failed to initialize logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "logproxy starting"
    );
    info!(
        port = config.service_port,
        max_workers = config.oblogreader_max_count,
        auth_user = config.auth_user,
        readonly = config.readonly || config.debug,
        "Configuration loaded"
    );

    let authenticator: Arc<dyn Authenticator> = if config.auth_user {
        Arc::new(UpstreamAuthenticator {
            allow_sys_user: config.auth_allow_sys_user,
            allow_all_tenant: config.allow_all_tenant,
            timeout: Duration::from_secs(config.command_timeout_s.max(1)),
        })
    } else {
        Arc::new(AllowAll)
    };

    let arranger = Arranger::new(config, authenticator).context("Failed to create arranger")?;
    let addr = arranger.init().await.context("Failed to start listener")?;
    info!(addr = %addr, "Listening");

    // Setup signal handlers
    let shutdown = Arc::clone(&arranger);
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown.shutdown();
    });

    if let Err(e) = arranger.run().await {
        error!(error = %e, "Arranger error");
        return Err(e.into());
    }

    info!("logproxy stopped");
    Ok(())
}

/// Runs the hidden `worker` subcommand on a single-threaded runtime.
fn run_worker() -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("logproxy worker: cannot start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(worker::run()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("logproxy worker: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
