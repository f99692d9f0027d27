//! gitlab-hookd - Main entry point.
//!
//! Parses the command line, initializes logging, and drives the daemon
//! lifecycle: build a generation, serve until a signal, reload on SIGUSR1,
//! exit on SIGHUP/SIGINT/SIGTERM.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gitlab_hookd::config::Config;
use gitlab_hookd::daemon::{Daemon, DaemonError, Exit};
use gitlab_hookd::notify;
use gitlab_hookd::signals::SignalListener;

/// Configuration file used when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "/etc/gitlab-hookd.toml";

/// Runs a GitLab webhook receiver.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Sets the configuration file to use.
    #[arg(long, value_name = "path", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Increases the amount of log messages.
    #[arg(long, value_name = "n", num_args = 0..=1, default_missing_value = "0", allow_negative_numbers = true)]
    verbose: Option<i32>,
}

impl Cli {
    /// Maps `--verbose` onto a default log filter: absent → warn,
    /// `--verbose`/`=0` → info, positive → debug.
    fn default_filter(&self) -> &'static str {
        match self.verbose {
            None => "gitlab_hookd=warn",
            Some(n) if n < 0 => "gitlab_hookd=warn",
            Some(0) => "gitlab_hookd=info",
            Some(_) => "gitlab_hookd=debug",
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.default_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            notify::status(&err.to_string());
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<(), DaemonError> {
    let mut config = Config::load(&cli.config)?;
    let mut signals = SignalListener::new().map_err(DaemonError::Signals)?;
    let _watchdog = notify::spawn_watchdog();

    info!("starting gitlab-hookd");

    loop {
        let daemon = Daemon::build(&config).await?;
        if let Ok(addr) = daemon.local_addr() {
            info!("listening on {addr}");
        }
        notify::ready("Normal operation");

        // The daemon reparses the config file on SIGUSR1 while it is still
        // serving; it only returns Reload once the replacement parsed.
        match daemon.run(&mut signals, &cli.config).await {
            Exit::Shutdown => {
                info!("shutting down");
                notify::stopping();
                return Ok(());
            }
            Exit::Reload(reloaded) => {
                info!("reloading configuration from {}", cli.config.display());
                notify::status("Reloading configuration");
                config = reloaded;
            }
        }
    }
}
