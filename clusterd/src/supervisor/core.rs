//! Supervisor task: owns the pool state and processes one event at a time

use eyre::{Result, eyre};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::SupervisorConfig;
use super::handle::SupervisorHandle;
use super::host::ProcessHost;
use super::messages::{ControlRequest, PoolEvent, PoolStatus};
use super::state::PoolState;

/// Whether the supervisor keeps going after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Crash-loop breaker tripped
    Halt,
}

/// Why `Supervisor::run` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Shutdown was requested; every worker was asked to terminate
    Shutdown,
    /// Too many crashes inside the crash window
    Halted,
}

/// The process-pool supervisor
///
/// Generic over the process host so the state machine runs the same against
/// real OS processes and the in-memory host.
pub struct Supervisor<H: ProcessHost> {
    pub(super) config: SupervisorConfig,
    pub(super) host: H,
    pub(super) state: PoolState,
    tx: mpsc::Sender<ControlRequest>,
    rx: Option<mpsc::Receiver<ControlRequest>>,
}

impl<H: ProcessHost> Supervisor<H> {
    /// Create a supervisor; no worker is forked until `start`
    pub fn new(config: SupervisorConfig, host: H) -> Self {
        debug!(?config, "Supervisor::new: called");
        let (tx, rx) = mpsc::channel(config.control_buffer);
        let state = PoolState::new(config.crash_window());
        Self {
            config,
            host,
            state,
            tx,
            rx: Some(rx),
        }
    }

    /// Cloneable handle for signals and other tasks
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle::new(self.tx.clone())
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn state(&self) -> &PoolState {
        &self.state
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn status(&self) -> PoolStatus {
        self.state.status()
    }

    /// Apply one host event to the pool
    pub fn handle_event(&mut self, event: PoolEvent) -> Flow {
        debug!(?event, "Supervisor::handle_event: called");
        match event {
            PoolEvent::Message { id, raw } => {
                self.route(id, raw);
                Flow::Continue
            }
            PoolEvent::Disconnected { id } => {
                self.on_child_disconnect(id);
                Flow::Continue
            }
            PoolEvent::Exited { id, exit } => self.on_child_exit(id, exit),
        }
    }

    /// Apply one control request; returns the outcome when the loop must stop
    pub fn handle_request(&mut self, request: ControlRequest) -> Option<RunOutcome> {
        debug!(?request, "Supervisor::handle_request: called");
        match request {
            ControlRequest::Restart => {
                self.restart();
                None
            }
            ControlRequest::Reload => {
                self.reload();
                None
            }
            ControlRequest::Status { reply_tx } => {
                let _ = reply_tx.send(self.state.status());
                None
            }
            ControlRequest::Shutdown => {
                info!("Supervisor shutting down");
                self.shutdown_all();
                Some(RunOutcome::Shutdown)
            }
        }
    }

    /// Run the supervisor until shutdown or until the crash-loop breaker trips
    pub async fn run(mut self) -> Result<RunOutcome> {
        let mut events = self
            .host
            .take_events()
            .ok_or_else(|| eyre!("Process host event stream already taken"))?;
        let mut control = self
            .rx
            .take()
            .ok_or_else(|| eyre!("Supervisor control channel already taken"))?;

        info!(num_procs = self.config.num_procs, "Supervisor started");

        loop {
            let crash_reset = crash_reset_timer(self.state.crashes.deadline());

            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if self.handle_event(event) == Flow::Halt {
                            return Ok(RunOutcome::Halted);
                        }
                    }
                    None => {
                        warn!("Process host event stream closed");
                        self.shutdown_all();
                        return Ok(RunOutcome::Shutdown);
                    }
                },
                request = control.recv() => match request {
                    Some(request) => {
                        if let Some(outcome) = self.handle_request(request) {
                            self.drain(&mut events).await;
                            return Ok(outcome);
                        }
                    }
                    None => {
                        self.shutdown_all();
                        self.drain(&mut events).await;
                        return Ok(RunOutcome::Shutdown);
                    }
                },
                _ = crash_reset => {
                    if self.state.crashes.expire(Instant::now().into_std()) {
                        debug!("Supervisor::run: crash counter reset");
                    }
                }
            }
        }
    }

    /// Wait for terminated workers to exit, bounded by the shutdown grace period
    ///
    /// Only exits and disconnects are applied; worker messages are dropped so
    /// nothing new gets forked while the pool winds down.
    async fn drain(&mut self, events: &mut mpsc::Receiver<PoolEvent>) {
        let grace = self.config.shutdown_grace();
        debug!(live = self.state.workers.len(), ?grace, "Supervisor::drain: called");
        let deadline = Instant::now() + grace;

        while !self.state.workers.is_empty() {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(PoolEvent::Exited { id, exit })) => {
                    self.on_child_exit(id, exit);
                }
                Ok(Some(PoolEvent::Disconnected { id })) => self.on_child_disconnect(id),
                Ok(Some(PoolEvent::Message { id, .. })) => {
                    debug!(id, "Supervisor::drain: ignoring message during shutdown");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = self.state.workers.len(),
                        "Workers still running after {}s shutdown grace period",
                        grace.as_secs()
                    );
                    break;
                }
            }
        }
    }
}

/// Resolves when the pending crash-window reset is due, never if none is armed
async fn crash_reset_timer(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(Instant::from_std(deadline)).await,
        None => std::future::pending::<()>().await,
    }
}
