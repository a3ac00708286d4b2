//! OTA Relay CLI - Main entry point for the `ota-cli` binary
//!
//! Runs the TCU distributor, the ECU consumer, or one-shot operator commands
//! against a shared config file.

use anyhow::{bail, Context, Result};
use clap::Parser;
use ota_relay_lib::engine::{
    cli::{formatter::CliFormatter, Cli, Commands, OutputFormat, TriggerCommand},
    config::{ensure_folders, ensure_folders_with_backoff, ConfigStore},
    events::{Reporter, StatusColor, StatusEvent},
    logging,
    updater::{
        consumer::{ConsumerAgent, SimulatedApplier},
        gate::VERIFICATION_DISABLED_WARNING,
        handoff::{AckFolder, HandoffSlot},
        ticker::Ticker,
        Distributor, SessionOutcome, VersionId,
    },
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const FOLDER_ATTEMPTS: u32 = 5;
const FOLDER_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init_tracing(&cli.log_level) {
        eprintln!("Warning: {}", e);
    }

    if let Err(e) = run_cli(cli).await {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run_cli(cli: Cli) -> Result<()> {
    let store = Arc::new(
        ConfigStore::open(&cli.config)
            .with_context(|| format!("cannot load {}", cli.config.display()))?,
    );

    match cli.command {
        Commands::Init { reset_version } => cmd_init(&store, reset_version, cli.format),
        Commands::Tcu { auto } => cmd_tcu(store, auto, cli.format).await,
        Commands::Ecu => cmd_ecu(store, cli.format).await,
        Commands::Check => cmd_check(store, cli.format).await,
        Commands::Security { state } => cmd_security(&store, state.enabled(), cli.format),
        Commands::Status => cmd_status(&store, cli.format),
    }
}

/// Cancel `token` on Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            trigger.cancel();
        }
    });
    token
}

fn spawn_printer(mut rx: UnboundedReceiver<StatusEvent>, format: OutputFormat) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            CliFormatter::emit(&event, format);
        }
    })
}

/// Create the folders, retrying before declaring the node crashed
async fn prepare_folders(store: &ConfigStore, reporter: &Reporter) -> Result<()> {
    let folders = store.folders();
    if let Err(e) =
        ensure_folders_with_backoff(&folders, FOLDER_ATTEMPTS, FOLDER_INITIAL_BACKOFF).await
    {
        reporter.status("Crashed", StatusColor::Red);
        reporter.log(format!("CRITICAL: {}", e));
        return Err(e.into());
    }
    Ok(())
}

fn cmd_init(store: &ConfigStore, reset_version: bool, format: OutputFormat) -> Result<()> {
    if reset_version {
        store.commit_version(VersionId::new(1, 0))?;
    } else {
        store.persist()?;
    }
    ensure_folders(&store.folders())?;

    if format == OutputFormat::Json {
        println!(
            "{}",
            serde_json::json!({
                "config": store.path(),
                "installed_version": store.distributor_state().installed_version,
            })
        );
    } else {
        CliFormatter::success(&format!("Config written to {}", store.path().display()));
        CliFormatter::kv(
            "Installed version",
            &store.distributor_state().installed_version.to_string(),
        );
    }
    Ok(())
}

async fn cmd_tcu(store: Arc<ConfigStore>, auto: bool, format: OutputFormat) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let (reporter, rx) = Reporter::channel();
    let printer = spawn_printer(rx, format);

    prepare_folders(&store, &reporter).await?;
    let distributor = Arc::new(Distributor::new(
        store.clone(),
        reporter.clone(),
        cancel.clone(),
    ));

    reporter.status("Idle", StatusColor::Gray);
    reporter.log(format!(
        "TCU online (v{}). Send CHECK to look for updates.",
        store.distributor_state().installed_version
    ));
    if !store.posture().integrity_check_enabled {
        reporter.log(VERIFICATION_DISABLED_WARNING);
    }

    let mut schedule = auto.then(|| Ticker::new(store.snapshot().poll_interval(), cancel.clone()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut in_flight: Option<JoinHandle<SessionOutcome>> = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            ticked = next_tick(schedule.as_mut()) => {
                if !ticked {
                    break;
                }
                if let Some(handle) = distributor.trigger() {
                    in_flight = Some(handle);
                }
            }
            line = lines.next_line(), if stdin_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        stdin_open = false;
                        if !auto {
                            break;
                        }
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "stdin read failed");
                        stdin_open = false;
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                match line.parse::<TriggerCommand>() {
                    Ok(TriggerCommand::Check) => {
                        if let Some(handle) = distributor.trigger() {
                            in_flight = Some(handle);
                        }
                    }
                    Ok(TriggerCommand::Security(enabled)) => {
                        if let Err(e) = distributor.set_security(enabled) {
                            reporter.log(format!("Could not change security setting: {}", e));
                        }
                    }
                    Ok(TriggerCommand::Status) => {
                        let state = store.distributor_state();
                        let posture = store.posture();
                        reporter.log(format!(
                            "Installed version: {} | Checksum verification: {}{}",
                            state.installed_version,
                            if posture.integrity_check_enabled { "enabled" } else { "disabled" },
                            if distributor.is_busy() { " | session running" } else { "" }
                        ));
                    }
                    Err(e) => reporter.log(e.to_string()),
                }
            }
        }
    }

    if let Some(handle) = in_flight {
        if let Ok(outcome) = handle.await {
            info!(outcome = ?outcome.summary(), "last session finished");
        }
    }

    drop(distributor);
    drop(reporter);
    let _ = printer.await;
    Ok(())
}

/// Next scheduled check, or never when scheduling is off
async fn next_tick(schedule: Option<&mut Ticker>) -> bool {
    match schedule {
        Some(ticker) => ticker.tick().await,
        None => std::future::pending().await,
    }
}

async fn cmd_ecu(store: Arc<ConfigStore>, format: OutputFormat) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let (reporter, rx) = Reporter::channel();
    let printer = spawn_printer(rx, format);

    prepare_folders(&store, &reporter).await?;
    let config = store.snapshot();
    let folders = store.folders();

    let agent = ConsumerAgent::new(
        HandoffSlot::new(folders.ecu_shared_folder),
        AckFolder::new(folders.tcu_ack_folder),
        SimulatedApplier::new(config.apply_duration()),
        config.ecu_poll_interval(),
        reporter,
    );
    agent.run(cancel).await;

    let _ = printer.await;
    Ok(())
}

async fn cmd_check(store: Arc<ConfigStore>, format: OutputFormat) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let (reporter, rx) = Reporter::channel();
    let printer = spawn_printer(rx, format);

    prepare_folders(&store, &reporter).await?;
    let distributor = Distributor::new(store, reporter, cancel);
    let outcome = distributor.check().await;

    drop(distributor);
    let _ = printer.await;

    let summary = outcome.summary();
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string(&summary)?);
    }

    match outcome {
        SessionOutcome::Failed(failure) => bail!("update session failed: {}", failure),
        SessionOutcome::Committed(advertisement) if format != OutputFormat::Json => {
            CliFormatter::success(&format!(
                "Installed {} from {}",
                advertisement.version, advertisement.source
            ));
            Ok(())
        }
        _ => Ok(()),
    }
}

fn cmd_security(store: &ConfigStore, enabled: bool, format: OutputFormat) -> Result<()> {
    store.set_checksum_verification(enabled)?;

    if format == OutputFormat::Json {
        println!(
            "{}",
            serde_json::json!({ "checksum_verification_enabled": enabled })
        );
    } else if enabled {
        CliFormatter::success("Checksum verification enabled");
    } else {
        CliFormatter::warning("Checksum verification disabled");
    }
    Ok(())
}

fn cmd_status(store: &ConfigStore, format: OutputFormat) -> Result<()> {
    let config = store.snapshot();
    let folders = store.folders();

    if format == OutputFormat::Json {
        println!(
            "{}",
            serde_json::json!({
                "config": store.path(),
                "installed_version": config.tcu.current_version,
                "checksum_verification_enabled": config.security.checksum_verification_enabled,
                "sources": config.server.sources,
                "folders": {
                    "ecu_shared_folder": folders.ecu_shared_folder,
                    "tcu_download_folder": folders.tcu_download_folder,
                    "tcu_ack_folder": folders.tcu_ack_folder,
                },
            })
        );
        return Ok(());
    }

    CliFormatter::header("OTA Relay Status");
    CliFormatter::kv("Config", &store.path().display().to_string());
    CliFormatter::kv("Installed version", &config.tcu.current_version.to_string());
    CliFormatter::kv(
        "Checksum verification",
        if config.security.checksum_verification_enabled {
            "enabled"
        } else {
            "DISABLED"
        },
    );

    CliFormatter::header("Sources");
    if config.server.sources.is_empty() {
        CliFormatter::warning("No sources configured");
    }
    for source in &config.server.sources {
        CliFormatter::item(&format!("{} → {}", source.name, source.endpoint));
    }

    CliFormatter::header("Folders");
    CliFormatter::kv("ECU slot", &folders.ecu_shared_folder.display().to_string());
    CliFormatter::kv("Downloads", &folders.tcu_download_folder.display().to_string());
    CliFormatter::kv("Acks", &folders.tcu_ack_folder.display().to_string());
    Ok(())
}
