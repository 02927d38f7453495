use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use sentinel::alerts::{AlertRouter, HttpAlarmMirror, LogBackend, MessagingBackend, SlackBackend, ThreadRegistry};
use sentinel::config::{Config, MessagingConfig, StateConfig};
use sentinel::probe::Prober;
use sentinel::recovery::RecoveryVerifier;
use sentinel::remediation::{KeyDirectoryProvider, RemediationDispatcher, SshExecutor};
use sentinel::scheduler::{self, Schedule};
use sentinel::state::{FileStateStore, MemoryStateStore, StateStore};
use sentinel::Orchestrator;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

const DEFAULT_CONFIG_PATH: &str = "sentinel.toml";

/// Command-line arguments for the health monitor
#[derive(Parser)]
#[command(
    name = "sentinel",
    about = "Health monitoring and remediation engine",
    long_about = "Probes a fleet of HTTP endpoints, restarts services that stop answering, \
                  verifies their recovery and reports state changes and periodic digests \
                  to chat channels."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        global = true,
        value_name = "FILE",
        help = "Configuration file path (TOML format, defaults to sentinel.toml)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        global = true,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run one monitoring cycle
    Check,
    /// Post one periodic digest into today's thread
    Digest,
    /// Send the OK heartbeat for healthy targets
    Heartbeat,
    /// Run due recovery verifications only
    Verify,
    /// Keep running all flows on their configured cadences until Ctrl+C
    Watch,
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// # Returns
    ///
    /// `Ok(())` if all arguments are valid, `Err(String)` with error message otherwise
    fn validate(&self) -> Result<(), String> {
        let config_path = self.config_path();
        // Missing files are reported when the configuration is loaded
        if config_path.exists() {
            if !config_path.is_file() {
                return Err(format!(
                    "Configuration path is not a file: {}",
                    config_path.display()
                ));
            }

            if let Some(extension) = config_path.extension() {
                if extension != "toml" {
                    warn!(
                        "Configuration file does not have .toml extension: {}",
                        config_path.display()
                    );
                }
            }
        }

        Ok(())
    }

    fn config_path(&self) -> &Path {
        self.config
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH))
    }
}

fn build_store(config: &Config) -> Arc<dyn StateStore> {
    match &config.state {
        StateConfig::Memory => {
            warn!("Using in-memory state; alarm state will not survive this process");
            Arc::new(MemoryStateStore::new())
        }
        StateConfig::File { path } => Arc::new(FileStateStore::new(path.clone())),
    }
}

fn build_backend(config: &Config) -> anyhow::Result<Arc<dyn MessagingBackend>> {
    let timeout = config.timing.connect_timeout();
    Ok(match &config.messaging {
        MessagingConfig::Slack {
            bot_token_env,
            api_base,
        } => Arc::new(
            SlackBackend::from_env(api_base.clone(), bot_token_env, timeout)
                .context("Failed to create Slack backend")?,
        ),
        MessagingConfig::Log => {
            info!("Messaging backend is in dry-run mode; messages are only logged");
            Arc::new(LogBackend::new())
        }
    })
}

/// Wire every configured stage into an orchestrator
fn build_orchestrator(config: &Config) -> anyhow::Result<Orchestrator> {
    let store = build_store(config);
    let backend = build_backend(config)?;

    let mut router = AlertRouter::new(
        Arc::clone(&store),
        Arc::clone(&backend),
        config.channels.clone(),
        config.default_channel.clone(),
    );
    if let Some(mirror) = &config.alarm_mirror {
        let mirror = HttpAlarmMirror::new(
            mirror.url.clone(),
            mirror.alarm_prefix.clone(),
            config.timing.connect_timeout(),
        )
        .context("Failed to create alarm mirror")?;
        router = router.with_mirror(Arc::new(mirror));
    }
    if config.stages.threading {
        router = router.with_threads(ThreadRegistry::new(
            Arc::clone(&store),
            Arc::clone(&backend),
            config.timing.thread_claim_staleness(),
        ));
    }

    let source = Arc::new(Prober::new().context("Failed to create HTTP prober")?);
    let mut orchestrator = Orchestrator::new(config.targets.clone(), source.clone(), Arc::new(router))
        .with_limits(config.timing.max_concurrency, config.timing.invocation_budget());

    if config.stages.remediation {
        let dispatcher = RemediationDispatcher::new(
            Arc::clone(&store),
            Arc::new(KeyDirectoryProvider::new(config.credentials.key_dir.clone())),
            Arc::new(SshExecutor::new(config.timing.connect_timeout())),
            config.timing.in_flight_staleness(),
        );
        orchestrator = orchestrator.with_remediation(Arc::new(dispatcher));

        if config.stages.verification {
            let verifier = RecoveryVerifier::new(store, source)
                .with_claim_staleness(config.timing.in_flight_staleness());
            orchestrator = orchestrator.with_verification(Arc::new(verifier));
        }
    }

    Ok(orchestrator)
}

fn print_report<T: Serialize>(report: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
    println!("{}", json);
    Ok(())
}

async fn run(command: Command, config: Config) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(&config)?;

    match command {
        Command::Check => {
            let report = orchestrator.run_cycle().await;
            info!(
                "Cycle complete: {} targets, {} in alarm",
                report.targets.len(),
                report.alarms()
            );
            print_report(&report)
        }
        Command::Digest => print_report(&orchestrator.run_digest_at(Utc::now()).await),
        Command::Heartbeat => print_report(&orchestrator.run_heartbeat().await),
        Command::Verify => print_report(&orchestrator.run_due_verifications_at(Utc::now()).await),
        Command::Watch => {
            let (shutdown_sender, shutdown_receiver) = watch::channel(false);
            ctrlc::set_handler(move || {
                info!("Received interrupt signal (SIGINT), shutting down gracefully...");
                if let Err(e) = shutdown_sender.send(true) {
                    error!("Failed to send shutdown signal: {}", e);
                }
            })
            .context("Error setting SIGINT handler for graceful shutdown")?;

            info!("Monitor is running. Press Ctrl+C to stop.");
            scheduler::run(Arc::new(orchestrator), Schedule::from_config(&config), shutdown_receiver).await;
            info!("Monitor stopped");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let config = match Config::from_file(cli.config_path()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        "Loaded {} targets from {}",
        config.targets.len(),
        cli.config_path().display()
    );

    if let Err(e) = run(cli.command, config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
