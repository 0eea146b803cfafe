//! CLI command definitions and subcommands

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;

use crate::config::{ClusterSetting, Config};

/// clusterd - process-pool supervisor
#[derive(Debug, Parser)]
#[command(
    name = "clusterd",
    about = "Supervise a pool of worker processes with rolling restarts",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Worker count: a number, or `auto` for one per CPU core
    #[arg(long, global = true, value_name = "N|auto")]
    pub cluster: Option<ClusterSetting>,

    /// Install directory (pid file, logs, worker sockets)
    #[arg(long = "base-dir", global = true)]
    pub base_dir: Option<PathBuf>,

    /// Stay attached to the terminal
    #[arg(long = "no-daemon", visible_alias = "foreground", global = true)]
    pub no_daemon: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the supervisor (the default)
    Start,

    /// Stop the running supervisor
    Stop,

    /// Show whether the supervisor is running
    Status {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Rolling restart of every worker (SIGHUP)
    Restart,

    /// Ask every worker to reload (SIGUSR2)
    Reload,

    /// Internal: Run as daemon process (used by `start`)
    #[command(hide = true)]
    RunDaemon,
}

/// Output format for status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl Cli {
    /// Merge command-line overrides on top of the loaded config
    pub fn apply(&self, config: &mut Config) {
        debug!("Cli::apply: called");
        if let Some(cluster) = self.cluster {
            config.cluster = cluster;
        }
        if let Some(base_dir) = &self.base_dir {
            config.base_dir = base_dir.clone();
        }
        if self.no_daemon {
            config.daemon = false;
        }
        if self.log_level.is_some() {
            config.log_level = self.log_level.clone();
        }
    }

    /// Global options to hand to the detached `run-daemon` child
    pub fn daemon_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(config) = &self.config {
            args.push(OsString::from("--config"));
            args.push(config.clone().into_os_string());
        }
        if let Some(level) = &self.log_level {
            args.push(OsString::from("--log-level"));
            args.push(OsString::from(level));
        }
        if let Some(cluster) = self.cluster {
            args.push(OsString::from("--cluster"));
            args.push(OsString::from(cluster.to_string()));
        }
        if let Some(base_dir) = &self.base_dir {
            args.push(OsString::from("--base-dir"));
            args.push(base_dir.clone().into_os_string());
        }
        args
    }
}
