//! Start-of-day sequence
//!
//! Runs once, strictly in order. Any failing step aborts startup and the
//! error names the step.

use std::ffi::OsString;
use std::fmt;

use eyre::{Result, WrapErr, eyre};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::daemon::{DaemonManager, Singleton};
use crate::logging;
use crate::process::OsHost;
use crate::sink::OutputSink;
use crate::supervisor::{RunOutcome, Supervisor, SupervisorHandle};

/// How this process relates to the terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Stay attached; no pid file
    Foreground,
    /// Re-exec as a detached daemon and return
    Daemonize,
    /// Already the detached daemon
    Detached,
}

impl LaunchMode {
    pub fn resolve(config: &Config, run_daemon: bool) -> Self {
        if run_daemon {
            Self::Detached
        } else if config.daemon {
            Self::Daemonize
        } else {
            Self::Foreground
        }
    }

    fn owns_pid_file(self) -> bool {
        !matches!(self, Self::Foreground)
    }
}

/// Bootstrap steps in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Validate,
    Singleton,
    Daemonize,
    Output,
    Signals,
    Banner,
    WireEvents,
    WorkerCount,
    StartPool,
}

impl Step {
    pub const ALL: [Step; 9] = [
        Step::Validate,
        Step::Singleton,
        Step::Daemonize,
        Step::Output,
        Step::Signals,
        Step::Banner,
        Step::WireEvents,
        Step::WorkerCount,
        Step::StartPool,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Step::Validate => "validate config",
            Step::Singleton => "enforce singleton",
            Step::Daemonize => "daemonize",
            Step::Output => "configure output",
            Step::Signals => "register signals",
            Step::Banner => "startup banner",
            Step::WireEvents => "wire cluster events",
            Step::WorkerCount => "compute worker count",
            Step::StartPool => "fork initial pool",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn step<T>(step: Step, result: Result<T>) -> Result<T> {
    debug!(%step, ok = result.is_ok(), "bootstrap: step finished");
    result.wrap_err_with(|| format!("Error during startup ({})", step))
}

/// What the bootstrap produced
pub enum Launch {
    /// Another instance owns the pid file
    AlreadyRunning(u32),
    /// A detached daemon was started with this pid
    Launched(u32),
    /// This process is the supervisor
    Running(Running),
}

/// Inputs to the bootstrap
#[derive(Debug)]
pub struct Bootstrap {
    config: Config,
    mode: LaunchMode,
    daemon_args: Vec<OsString>,
}

impl Bootstrap {
    pub fn new(config: Config, mode: LaunchMode) -> Self {
        Self {
            config,
            mode,
            daemon_args: Vec::new(),
        }
    }

    /// Arguments passed through to the re-executed daemon
    pub fn daemon_args(mut self, args: Vec<OsString>) -> Self {
        self.daemon_args = args;
        self
    }

    /// Run every step of `Step::ALL` in order
    pub async fn launch(self) -> Result<Launch> {
        debug!(mode = ?self.mode, "Bootstrap::launch: called");
        let mut startup = Startup::new(self);
        for next in Step::ALL {
            if let Some(launch) = step(next, startup.run(next))? {
                return Ok(launch);
            }
        }
        startup.finish()
    }
}

/// What the steps have produced so far
struct Startup {
    config: Config,
    mode: LaunchMode,
    daemon_args: Vec<OsString>,
    daemon: DaemonManager,
    sink: Option<OutputSink>,
    signals: Option<SignalRelay>,
    supervisor: Option<Supervisor<OsHost>>,
    num_procs: usize,
}

impl Startup {
    fn new(bootstrap: Bootstrap) -> Self {
        let daemon = DaemonManager::with_pid_file(bootstrap.config.pid_file());
        Self {
            config: bootstrap.config,
            mode: bootstrap.mode,
            daemon_args: bootstrap.daemon_args,
            daemon,
            sink: None,
            signals: None,
            supervisor: None,
            num_procs: 0,
        }
    }

    /// Run one step; `Some` ends startup early
    fn run(&mut self, step: Step) -> Result<Option<Launch>> {
        match step {
            Step::Validate => self.config.validate()?,
            Step::Singleton => {
                if self.mode.owns_pid_file()
                    && let Singleton::Running(pid) = self.daemon.check_singleton()?
                {
                    return Ok(Some(Launch::AlreadyRunning(pid)));
                }
            }
            Step::Daemonize => match self.mode {
                LaunchMode::Daemonize => {
                    let pid = self.daemon.daemonize(&self.daemon_args)?;
                    return Ok(Some(Launch::Launched(pid)));
                }
                LaunchMode::Detached => self.daemon.register_self()?,
                LaunchMode::Foreground => {}
            },
            Step::Output => self.sink = configure_output(&self.config)?,
            Step::Signals => self.signals = Some(SignalRelay::register()?),
            Step::Banner => banner(),
            Step::WireEvents => {
                // The supervisor and its event stream exist before the first fork
                let host = OsHost::from_config(&self.config, self.sink.clone());
                self.supervisor = Some(Supervisor::new(self.config.supervisor_config(), host));
            }
            Step::WorkerCount => self.num_procs = self.config.num_procs(),
            Step::StartPool => {
                let supervisor = self.supervisor.as_mut().ok_or_else(|| eyre!("supervisor not wired"))?;
                if supervisor.start(self.num_procs).is_empty() {
                    return Err(eyre!("no worker could be forked"));
                }
            }
        }
        Ok(None)
    }

    fn finish(self) -> Result<Launch> {
        let supervisor = self.supervisor.ok_or_else(|| eyre!("supervisor not wired"))?;
        let signals = self.signals.ok_or_else(|| eyre!("signals not registered"))?;
        Ok(Launch::Running(Running {
            supervisor,
            signals,
            daemon: self.mode.owns_pid_file().then_some(self.daemon),
        }))
    }
}

fn configure_output(config: &Config) -> Result<Option<OutputSink>> {
    let sink = if config.silent() {
        Some(OutputSink::open(config.log_file(), &config.output).context("Failed to open output log")?)
    } else {
        None
    };
    logging::init(None, config.log_level.as_deref(), sink.clone())?;
    Ok(sink)
}

fn banner() {
    info!("");
    info!("clusterd v{} Copyright (C) clusterd contributors", env!("CARGO_PKG_VERSION"));
    info!("This program comes with ABSOLUTELY NO WARRANTY.");
    info!("This is free software, and you are welcome to redistribute it under certain conditions.");
    info!("For the full license, see the MIT license distributed with this program.");
    info!("");
}

/// A started supervisor, ready to run
pub struct Running {
    supervisor: Supervisor<OsHost>,
    signals: SignalRelay,
    daemon: Option<DaemonManager>,
}

impl Running {
    pub fn handle(&self) -> SupervisorHandle {
        self.supervisor.handle()
    }

    /// Run until shutdown or a crash loop; removes the pid file afterwards
    pub async fn run(self) -> Result<RunOutcome> {
        let relay = self.signals.forward(self.supervisor.handle());
        let outcome = self.supervisor.run().await;
        relay.abort();

        if let Some(daemon) = &self.daemon
            && let Err(e) = daemon.remove_pid_file()
        {
            warn!(error = %e, "Failed to remove pid file");
        }
        outcome
    }
}

/// OS signals mapped onto supervisor requests
///
/// SIGHUP restarts, SIGUSR2 reloads, SIGINT and SIGTERM shut down.
pub struct SignalRelay {
    hangup: Signal,
    user2: Signal,
    interrupt: Signal,
    terminate: Signal,
}

impl SignalRelay {
    pub fn register() -> Result<Self> {
        debug!("SignalRelay::register: called");
        Ok(Self {
            hangup: signal(SignalKind::hangup()).context("Failed to register SIGHUP")?,
            user2: signal(SignalKind::user_defined2()).context("Failed to register SIGUSR2")?,
            interrupt: signal(SignalKind::interrupt()).context("Failed to register SIGINT")?,
            terminate: signal(SignalKind::terminate()).context("Failed to register SIGTERM")?,
        })
    }

    /// Forward signals to the supervisor until a shutdown is delivered
    pub fn forward(mut self, handle: SupervisorHandle) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let result = tokio::select! {
                    _ = self.hangup.recv() => {
                        info!("SIGHUP received - rolling restart");
                        handle.restart().await
                    }
                    _ = self.user2.recv() => {
                        info!("SIGUSR2 received - reloading workers");
                        handle.reload().await
                    }
                    _ = self.interrupt.recv() => {
                        warn!("SIGINT received");
                        let _ = handle.shutdown().await;
                        break;
                    }
                    _ = self.terminate.recv() => {
                        warn!("SIGTERM received");
                        let _ = handle.shutdown().await;
                        break;
                    }
                };
                if let Err(e) = result {
                    debug!(error = %e, "SignalRelay::forward: supervisor gone");
                    break;
                }
            }
        })
    }
}
