//! clusterd - CLI entry point

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use nix::sys::signal::Signal;
use tracing::{debug, error, info};

use clusterd::cli::{Cli, Command, OutputFormat};
use clusterd::config::Config;
use clusterd::daemon::DaemonManager;
use clusterd::{Bootstrap, Launch, LaunchMode, RunOutcome};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    cli.apply(&mut config);

    debug!(command = ?cli.command, "main: dispatching command");
    match &cli.command {
        None | Some(Command::Start) => cmd_start(&cli, config, false).await,
        Some(Command::RunDaemon) => cmd_start(&cli, config, true).await,
        Some(Command::Stop) => cmd_stop(&config),
        Some(Command::Status { format }) => cmd_status(&config, *format),
        Some(Command::Restart) => cmd_signal(&config, Signal::SIGHUP, "Rolling restart requested"),
        Some(Command::Reload) => cmd_signal(&config, Signal::SIGUSR2, "Reload requested"),
    }
}

/// Start the supervisor, detaching unless told to stay in the foreground
async fn cmd_start(cli: &Cli, config: Config, run_daemon: bool) -> Result<()> {
    let mode = LaunchMode::resolve(&config, run_daemon);
    debug!(?mode, "cmd_start: called");

    let launch = Bootstrap::new(config, mode)
        .daemon_args(cli.daemon_args())
        .launch()
        .await?;

    match launch {
        Launch::AlreadyRunning(pid) => {
            println!("clusterd is already running (PID: {})", pid);
            Ok(())
        }
        Launch::Launched(pid) => {
            println!("{} (PID: {})", "clusterd started".green(), pid);
            Ok(())
        }
        Launch::Running(running) => match running.run().await? {
            RunOutcome::Shutdown => {
                info!("clusterd stopped");
                Ok(())
            }
            RunOutcome::Halted => {
                error!("[cluster] Crash loop detected, supervisor halted");
                Err(eyre::eyre!("Too many worker crashes, giving up"))
            }
        },
    }
}

fn cmd_stop(config: &Config) -> Result<()> {
    let daemon = DaemonManager::with_pid_file(config.pid_file());
    if !daemon.is_running() {
        println!("clusterd is not running");
        return Ok(());
    }
    let pid = daemon.stop()?;
    println!("clusterd stopped (PID: {})", pid);
    Ok(())
}

fn cmd_status(config: &Config, format: OutputFormat) -> Result<()> {
    debug!(?format, "cmd_status: called");
    let status = DaemonManager::with_pid_file(config.pid_file()).status();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        OutputFormat::Text => {
            println!("clusterd Status");
            println!("---------------");
            if status.running {
                println!("Status: {}", "running".green());
                if let Some(pid) = status.pid {
                    println!("PID: {}", pid);
                }
            } else {
                println!("Status: {}", "stopped".red());
            }
            println!("PID file: {}", status.pid_file.display());
        }
    }
    Ok(())
}

fn cmd_signal(config: &Config, signal: Signal, what: &str) -> Result<()> {
    let pid = DaemonManager::with_pid_file(config.pid_file()).signal(signal)?;
    println!("{} (PID: {})", what, pid);
    Ok(())
}
