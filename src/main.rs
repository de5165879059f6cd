//! Fleet supervisor CLI.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tradewire::auth::{HmacSecurity, NoopSecurity, SecurityManager};
use tradewire::config::Settings;
use tradewire::events::EventBroker;
use tradewire::paths;
use tradewire::runtime::ServiceClient;
use tradewire::supervisor::{
    FleetConfig, HealthProber, ProcessBackend, RpcProber, ServiceReport, StandaloneBackend,
    StartOutcome, Supervisor,
};
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tradewire", version, about = "Local-socket service fleet supervisor")]
struct Cli {
    /// Settings file (defaults to ./tradewire.toml when present).
    #[arg(long, global = true, env = "TRADEWIRE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the fleet (or one service) in dependency order.
    Start {
        /// Start only this service.
        #[arg(long)]
        service: Option<String>,
        /// Bypass the restart budget.
        #[arg(long)]
        force: bool,
    },
    /// Stop the fleet (or one service) in reverse dependency order.
    Stop {
        #[arg(long)]
        service: Option<String>,
    },
    /// Stop then start, bypassing the restart budget.
    Restart {
        #[arg(long)]
        service: Option<String>,
    },
    /// One-line status per declared service.
    Status,
    /// Full health payloads for every responsive service.
    Health,
    /// Tail captured service logs.
    Logs {
        #[arg(long)]
        service: Option<String>,
        /// Lines shown from the end of each log.
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },
    /// Periodically refreshed status view until Ctrl-C.
    Dashboard,
    /// Run the event bus broker in the foreground. Declare this command as a
    /// fleet service to give the fleet a bus.
    Broker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("failed to load settings: {e}");
            return ExitCode::FAILURE;
        }
    };
    settings.apply_runtime_dir();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(cli.command, &settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, settings: &Settings) -> Result<()> {
    if let Command::Broker = command {
        return run_broker().await;
    }

    let fleet = FleetConfig::load(&settings.fleet)
        .with_context(|| format!("loading fleet file {}", settings.fleet.display()))?;
    let mut supervisor = build_supervisor(&fleet)?;
    supervisor.adopt_running();

    match command {
        Command::Start { service, force } => match service {
            Some(name) => report_start(&name, supervisor.start_one(&name, force).await?),
            None => {
                supervisor.start_all(force).await?;
                println!("fleet started");
                Ok(())
            }
        },
        Command::Stop { service } => {
            match service {
                Some(name) => supervisor.stop_one(&name).await,
                None => supervisor.stop_all().await,
            }
            println!("stopped");
            Ok(())
        }
        Command::Restart { service } => match service {
            Some(name) => report_start(&name, supervisor.restart_one(&name).await?),
            None => {
                supervisor.stop_all().await;
                supervisor.start_all(true).await?;
                println!("fleet restarted");
                Ok(())
            }
        },
        Command::Status => {
            print_status(&supervisor.status().await);
            Ok(())
        }
        Command::Health => {
            for report in supervisor.status().await {
                match report.health {
                    Some(payload) => println!(
                        "{}:\n{}",
                        report.name,
                        serde_json::to_string_pretty(&payload)?
                    ),
                    None => println!(
                        "{}: {}",
                        report.name,
                        report.failure.as_deref().unwrap_or("no health data")
                    ),
                }
            }
            Ok(())
        }
        Command::Logs { service, lines } => {
            let names: Vec<String> = match service {
                Some(name) => vec![name],
                None => supervisor.startup_order().to_vec(),
            };
            for name in names {
                print_log_tail(&name, lines);
            }
            Ok(())
        }
        Command::Dashboard => run_dashboard(&mut supervisor).await,
        Command::Broker => unreachable!("handled above"),
    }
}

fn build_supervisor(fleet: &FleetConfig) -> Result<Supervisor> {
    let security: Arc<dyn SecurityManager> = match &fleet.shared_secret {
        Some(secret) => Arc::new(HmacSecurity::new(secret.as_bytes().to_vec())),
        None => Arc::new(NoopSecurity::new()),
    };
    let client = ServiceClient::new("manager", security);
    let backend: Arc<dyn ProcessBackend> = Arc::new(StandaloneBackend::new());
    let prober: Arc<dyn HealthProber> = Arc::new(RpcProber::new(client));
    Ok(Supervisor::new(fleet, backend, prober)?)
}

fn report_start(name: &str, outcome: StartOutcome) -> Result<()> {
    match outcome {
        StartOutcome::Started => {
            println!("{name}: started");
            Ok(())
        }
        StartOutcome::AlreadyRunning => {
            println!("{name}: already running");
            Ok(())
        }
        StartOutcome::SkippedBudget => {
            anyhow::bail!("{name}: restart budget exhausted, use --force to override")
        }
        StartOutcome::Failed(reason) => anyhow::bail!("{name}: failed to start: {reason}"),
    }
}

fn print_status(reports: &[ServiceReport]) {
    println!(
        "{:<20} {:<10} {:<8} {:<12} {:<9} {}",
        "SERVICE", "STATE", "PID", "RESPONSIVE", "RESTARTS", "DETAIL"
    );
    for report in reports {
        println!(
            "{:<20} {:<10} {:<8} {:<12} {:<9} {}",
            report.name,
            if report.running { "running" } else { "stopped" },
            report
                .pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".into()),
            if report.responsive { "yes" } else { "no" },
            report.restart_count,
            report.failure.as_deref().unwrap_or("")
        );
    }
}

fn print_log_tail(name: &str, lines: usize) {
    let path = paths::service_log_file(name);
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            println!("==> {name} <==");
            let all: Vec<&str> = contents.lines().collect();
            let start = all.len().saturating_sub(lines);
            for line in &all[start..] {
                println!("{line}");
            }
        }
        Err(e) => println!("==> {name} <== (no log: {e})"),
    }
}

async fn run_dashboard(supervisor: &mut Supervisor) -> Result<()> {
    loop {
        let reports = supervisor.status().await;
        // Clear screen and home the cursor.
        print!("\x1b[2J\x1b[H");
        println!("tradewire fleet — {}\n", chrono::Local::now().format("%H:%M:%S"));
        print_status(&reports);
        println!("\nCtrl-C to exit");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
        }
    }
}

async fn run_broker() -> Result<()> {
    let mut broker = EventBroker::start().await?;
    tokio::signal::ctrl_c().await?;
    broker.stop().await;
    Ok(())
}
