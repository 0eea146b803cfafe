//! Supervisor configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Desired number of workers
    #[serde(default = "default_num_procs")]
    pub num_procs: usize,

    /// Quiet period after which the crash counter resets
    #[serde(default = "default_crash_window_secs")]
    pub crash_window_secs: u64,

    /// How long terminated workers get to exit on shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Channel buffer size for control requests
    #[serde(default = "default_control_buffer")]
    pub control_buffer: usize,

    /// Channel buffer size for pool events
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_num_procs() -> usize {
    debug!("default_num_procs: called");
    1
}

fn default_crash_window_secs() -> u64 {
    debug!("default_crash_window_secs: called");
    10
}

fn default_shutdown_grace_secs() -> u64 {
    debug!("default_shutdown_grace_secs: called");
    5
}

fn default_control_buffer() -> usize {
    debug!("default_control_buffer: called");
    64
}

fn default_event_buffer() -> usize {
    debug!("default_event_buffer: called");
    1000
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        debug!("SupervisorConfig::default: called");
        Self {
            num_procs: 1,
            crash_window_secs: 10,
            shutdown_grace_secs: 5,
            control_buffer: 64,
            event_buffer: 1000,
        }
    }
}

impl SupervisorConfig {
    pub fn with_num_procs(num_procs: usize) -> Self {
        Self {
            num_procs,
            ..Default::default()
        }
    }

    pub fn crash_window(&self) -> Duration {
        debug!(crash_window_secs = %self.crash_window_secs, "SupervisorConfig::crash_window: called");
        Duration::from_secs(self.crash_window_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Crash count above which the supervisor halts instead of respawning
    pub fn crash_threshold(&self) -> usize {
        self.num_procs * 3
    }
}
