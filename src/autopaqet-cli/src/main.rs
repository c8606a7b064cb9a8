//! AutoPaqet command-line client
//!
//! Connects through a paqet tunnel and diagnoses why it does not work.
//!
//! Usage:
//!   # Generate sample config, then edit server address and key
//!   autopaqet init-config
//!
//!   # Connect and keep the tunnel up until Ctrl-C
//!   autopaqet connect
//!
//!   # One diagnostic run, machine-readable
//!   autopaqet diagnose --json

mod config;
mod output;

use anyhow::{Context, Result};
use autopaqet_core::{
    ConfigGenerator, DiagnosticResult, DiagnosticRunner, FlagProbeBattery, LinuxDetector,
    NetworkDetector, PcapChecker, ProcessState, ProcessSupervisor, RunOptions, StepRecord,
    TunnelOptions, YamlConfigGenerator,
};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use config::{AppConfig, DEFAULT_CONFIG_PATH};

#[derive(Parser)]
#[command(name = "autopaqet")]
#[command(about = "AutoPaqet - paqet tunnel client with connection diagnostics")]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(long, short, global = true)]
    verbose: bool,

    /// SOCKS5 readiness deadline in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Diagnose, then keep the tunnel up until Ctrl-C
    Connect,
    /// Run the diagnostic sequence once and stop the tunnel
    Diagnose {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run only the TCP flag probe battery
    Probe {
        /// Print the probe records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the tunnel config generated for the current profile
    RenderConfig,
    /// Write a sample config file
    InitConfig {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON output stays clean
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::InitConfig { path } = &cli.command {
        AppConfig::create_sample(path)?;
        println!("Sample config created at: {:?}", path);
        println!("Edit the server address and key, then run: autopaqet connect");
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(timeout) = cli.timeout {
        config.attempt_timeout_secs = timeout;
    }
    config.validate()?;

    let ok = match cli.command {
        Commands::Connect => run_diagnostics(&config, true, false, cli.verbose).await?,
        Commands::Diagnose { json } => run_diagnostics(&config, false, json, cli.verbose).await?,
        Commands::Probe { json } => run_probes(&config, json).await?,
        Commands::RenderConfig => {
            let options = prepare_options(&config).await?;
            print!("{}", YamlConfigGenerator.generate(&options)?);
            true
        }
        Commands::InitConfig { .. } => true,
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Profile options with detected network fields filled in.
async fn prepare_options(config: &AppConfig) -> Result<TunnelOptions> {
    let mut options = config.profile.clone();
    let complete = !options.interface_name.is_empty()
        && !options.local_addr.is_empty()
        && !options.gateway_mac.is_empty();
    if !complete {
        let network = LinuxDetector::new()
            .detect()
            .await
            .context("detecting network (set interface_name, local_addr and gateway_mac to skip)")?;
        network.apply_to(&mut options);
    }
    Ok(options)
}

fn prepare_scratch_dir(config: &AppConfig) -> Result<()> {
    std::fs::create_dir_all(&config.scratch_dir)
        .with_context(|| format!("creating scratch dir {:?}", config.scratch_dir))
}

/// Ctrl-C cancels `cancel` and stops the tunnel.
fn spawn_interrupt_handler(cancel: CancellationToken, supervisor: Option<ProcessSupervisor>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            cancel.cancel();
            if let Some(supervisor) = supervisor {
                if let Err(e) = supervisor.stop().await {
                    tracing::warn!("Failed to stop tunnel: {}", e);
                }
            }
        }
    });
}

async fn run_diagnostics(
    config: &AppConfig,
    keep_alive: bool,
    json: bool,
    verbose: bool,
) -> Result<bool> {
    let binary = config.resolve_binary()?;
    prepare_scratch_dir(config)?;
    let options = prepare_options(config).await?;

    let supervisor = ProcessSupervisor::with_capacity(&binary, config.log_capacity);
    supervisor.set_state_change_handler(|state| {
        if state == ProcessState::Error {
            tracing::error!("Tunnel process stopped unexpectedly");
        }
    });

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone(), Some(supervisor.clone()));

    if !json {
        println!("{}", "═".repeat(60).blue());
        println!("{}", format!(" {} → {} ", config.profile_name, options.server_addr).bold().blue());
        println!("{}", "═".repeat(60).blue());
    }

    let mut diagnostics =
        DiagnosticRunner::new(&binary, &config.scratch_dir, Arc::new(supervisor.clone()));
    // The report lands in the tunnel log; echo it only when asked to.
    let logs = supervisor.log_buffer();
    diagnostics = if verbose && !json {
        diagnostics.with_log_sink(Arc::new(move |line: &str| {
            logs.append(line);
            println!("{}", line.dimmed());
        }))
    } else {
        diagnostics.with_log_sink(logs)
    };
    if !json {
        diagnostics = diagnostics.with_step_sink(|step: &StepRecord| output::print_step(step));
    }

    let run_options = RunOptions::new(options)
        .with_profile_name(&config.profile_name)
        .with_attempt_timeout(Duration::from_secs(config.attempt_timeout_secs))
        .with_driver_checker(Arc::new(PcapChecker::new()));

    let result = diagnostics.run(&run_options, &cancel).await;
    report(&result, json)?;

    if keep_alive && result.success && !cancel.is_cancelled() {
        println!("\nSOCKS5 proxy on {} (Ctrl-C to disconnect)\n", run_options.socks_addr.cyan());
        stream_logs(&supervisor, &cancel).await;
    }

    supervisor.stop().await?;
    Ok(result.success)
}

fn report(result: &DiagnosticResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        output::print_summary(result);
    }
    Ok(())
}

/// Print tunnel output until Ctrl-C or until the process goes away.
async fn stream_logs(supervisor: &ProcessSupervisor, cancel: &CancellationToken) {
    let mut logs = supervisor.subscribe_logs();
    let mut states = supervisor.subscribe_state();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = logs.recv() => match line {
                Some(line) => println!("{}", line),
                None => break,
            },
            state = states.recv() => match state {
                Ok(ProcessState::Error) => {
                    let reason = supervisor.last_error().unwrap_or_default();
                    println!("{} {}", "Tunnel crashed:".red().bold(), reason);
                    break;
                }
                Ok(ProcessState::Idle) | Err(broadcast::error::RecvError::Closed) => break,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
        }
    }
    supervisor.unsubscribe_logs(logs.id());
}

async fn run_probes(config: &AppConfig, json: bool) -> Result<bool> {
    let binary = config.resolve_binary()?;
    prepare_scratch_dir(config)?;
    let options = prepare_options(config).await?;

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone(), None);

    let battery = FlagProbeBattery::new(&binary, &config.scratch_dir, Arc::new(YamlConfigGenerator));
    let records = battery
        .run(&options, &cancel, |marker| {
            if !json {
                println!("  Testing {} flags with paqet ping...", marker);
            }
        })
        .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        output::print_probes(&records);
    }
    Ok(records.iter().any(|r| r.success))
}
