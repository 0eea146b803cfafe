//! Daemon process management
//!
//! Handles the pid file, the singleton check, detaching from the terminal and
//! signalling a running instance.

use std::ffi::OsString;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use eyre::{Context, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Outcome of the singleton check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Singleton {
    /// No other live instance; any stale pid file has been removed
    Clear,
    /// Another instance is alive with this pid
    Running(u32),
}

/// Daemon process manager
#[derive(Debug)]
pub struct DaemonManager {
    /// Path to the PID file
    pid_file: PathBuf,
}

impl DaemonManager {
    pub fn with_pid_file(pid_file: PathBuf) -> Self {
        debug!(?pid_file, "DaemonManager::with_pid_file: called");
        Self { pid_file }
    }

    /// Check if a daemon is running
    pub fn is_running(&self) -> bool {
        self.running_pid().is_some()
    }

    /// Get the running daemon's PID
    pub fn running_pid(&self) -> Option<u32> {
        debug!("DaemonManager::running_pid: called");
        let result = self.read_pid().filter(|&pid| is_process_running(pid));
        debug!(?result, "DaemonManager::running_pid: returning");
        result
    }

    /// Refuse to run twice against the same install
    ///
    /// A pid file naming a dead process, or this very process, is stale and
    /// gets removed.
    pub fn check_singleton(&self) -> Result<Singleton> {
        debug!(?self.pid_file, "DaemonManager::check_singleton: called");
        let Some(pid) = self.read_pid() else {
            return Ok(Singleton::Clear);
        };

        if pid != std::process::id() && is_process_running(pid) {
            debug!(pid, "DaemonManager::check_singleton: instance alive");
            return Ok(Singleton::Running(pid));
        }

        debug!(pid, "DaemonManager::check_singleton: removing stale pid file");
        self.remove_pid_file()?;
        Ok(Singleton::Clear)
    }

    /// Read the PID from the PID file
    fn read_pid(&self) -> Option<u32> {
        debug!(?self.pid_file, "DaemonManager::read_pid: called");
        if !self.pid_file.exists() {
            debug!("DaemonManager::read_pid: pid file does not exist");
            return None;
        }

        let mut file = fs::File::open(&self.pid_file).ok()?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).ok()?;

        let pid = contents.trim().parse().ok();
        debug!(?pid, "DaemonManager::read_pid: returning");
        pid
    }

    /// Write the PID to the PID file
    fn write_pid(&self, pid: u32) -> Result<()> {
        debug!(pid, ?self.pid_file, "DaemonManager::write_pid: called");
        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent).context("Failed to create PID file directory")?;
        }

        let mut file = fs::File::create(&self.pid_file).context("Failed to create PID file")?;
        write!(file, "{}", pid).context("Failed to write PID")?;

        debug!(pid, path = ?self.pid_file, "Wrote PID file");
        Ok(())
    }

    /// Remove the PID file
    pub fn remove_pid_file(&self) -> Result<()> {
        debug!(?self.pid_file, "DaemonManager::remove_pid_file: called");
        if self.pid_file.exists() {
            fs::remove_file(&self.pid_file).context("Failed to remove PID file")?;
            debug!(path = ?self.pid_file, "Removed PID file");
        }
        Ok(())
    }

    /// Detach by re-executing this binary with `run-daemon`
    ///
    /// The child gets null stdio and its own process group, then registers
    /// its pid. The pid is also written here so `status` works immediately.
    pub fn daemonize(&self, args: &[OsString]) -> Result<u32> {
        debug!(?args, "DaemonManager::daemonize: called");
        let exe = std::env::current_exe().context("Failed to get current executable")?;

        let child = Command::new(&exe)
            .args(args)
            .arg("run-daemon")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .context("Failed to spawn daemon process")?;

        let pid = child.id();
        self.write_pid(pid)?;
        info!(pid, "Daemon started");
        Ok(pid)
    }

    /// Register the current process as the daemon
    pub fn register_self(&self) -> Result<()> {
        let pid = std::process::id();
        debug!(pid, "DaemonManager::register_self: called");
        self.write_pid(pid)?;
        info!(pid, "Daemon registered");
        Ok(())
    }

    /// Deliver a signal to the running instance
    pub fn signal(&self, signal: Signal) -> Result<u32> {
        debug!(?signal, "DaemonManager::signal: called");
        let pid = self
            .running_pid()
            .ok_or_else(|| eyre::eyre!("clusterd is not running"))?;
        kill(Pid::from_raw(pid as i32), signal).context(format!("Failed to send {} to {}", signal, pid))?;
        info!(pid, %signal, "Signal delivered");
        Ok(pid)
    }

    /// Stop the daemon: SIGTERM, wait up to five seconds, then SIGKILL
    pub fn stop(&self) -> Result<u32> {
        debug!("DaemonManager::stop: called");
        let pid = self
            .running_pid()
            .ok_or_else(|| eyre::eyre!("clusterd is not running"))?;

        info!(pid, "Stopping daemon...");
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).context("Failed to send SIGTERM")?;

        let mut attempts = 0;
        while is_process_running(pid) && attempts < 50 {
            std::thread::sleep(Duration::from_millis(100));
            attempts += 1;
        }
        debug!(attempts, "DaemonManager::stop: waited for process");

        if is_process_running(pid) {
            warn!(pid, "Daemon did not stop gracefully, sending SIGKILL");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }

        self.remove_pid_file()?;
        info!(pid, "Daemon stopped");
        Ok(pid)
    }

    pub fn pid_file(&self) -> &PathBuf {
        &self.pid_file
    }

    pub fn status(&self) -> DaemonStatus {
        let pid = self.running_pid();
        DaemonStatus {
            running: pid.is_some(),
            pid,
            pid_file: self.pid_file.clone(),
        }
    }
}

/// Check if a process with the given PID is running
pub fn is_process_running(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything
    let result = kill(Pid::from_raw(pid as i32), None).is_ok();
    debug!(pid, result, "is_process_running: checked");
    result
}

/// Daemon status information
#[derive(Debug, Serialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    #[serde(rename = "pid-file")]
    pub pid_file: PathBuf,
}
