//! OS process host
//!
//! Runs workers as child processes with `tokio::process`. Each worker gets an
//! IPC socket, a waiter task that reports its exit, and (in silent mode) two
//! capture tasks copying stdout/stderr into the output sink.

pub mod ipc;

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, WorkerConfig};
use crate::sink::OutputSink;
use crate::supervisor::{HostError, PoolEvent, ProcessHost, SpawnRequest, WorkerExit, WorkerId};

/// Environment variable naming the worker's IPC socket
pub const SOCKET_ENV: &str = "CLUSTERD_IPC_SOCKET";
/// Environment variable carrying the worker id
pub const WORKER_ID_ENV: &str = "CLUSTERD_WORKER_ID";

/// How long an exited worker's IPC and output tasks get to drain
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct WorkerChannel {
    pid: Option<u32>,
    outbound: mpsc::UnboundedSender<Value>,
    socket: PathBuf,
}

/// Process host backed by real child processes
#[derive(Debug)]
pub struct OsHost {
    worker: WorkerConfig,
    socket_dir: PathBuf,
    sink: Option<OutputSink>,
    events_tx: mpsc::Sender<PoolEvent>,
    events_rx: Option<mpsc::Receiver<PoolEvent>>,
    workers: HashMap<WorkerId, WorkerChannel>,
}

impl OsHost {
    pub fn new(worker: WorkerConfig, socket_dir: PathBuf, sink: Option<OutputSink>, event_buffer: usize) -> Self {
        debug!(program = %worker.program, ?socket_dir, "OsHost::new: called");
        let (events_tx, events_rx) = mpsc::channel(event_buffer);
        Self {
            worker,
            socket_dir,
            sink,
            events_tx,
            events_rx: Some(events_rx),
            workers: HashMap::new(),
        }
    }

    /// Host for a loaded configuration; workers run in `base-dir` unless
    /// `worker.working-dir` says otherwise
    pub fn from_config(config: &Config, sink: Option<OutputSink>) -> Self {
        let mut worker = config.worker.clone();
        if worker.working_dir.is_none() {
            worker.working_dir = Some(config.base_dir.clone());
        }
        let event_buffer = config.supervisor_config().event_buffer;
        Self::new(worker, config.socket_dir(), sink, event_buffer)
    }

    /// OS pid of a live worker
    pub fn pid(&self, id: WorkerId) -> Option<u32> {
        self.workers.get(&id).and_then(|w| w.pid)
    }

    fn command(&self, request: SpawnRequest, socket: &Path) -> Command {
        let primary = request.primary.to_string();
        let mut cmd = Command::new(&self.worker.program);
        cmd.args(&self.worker.args)
            .envs(&self.worker.env)
            .env(SOCKET_ENV, socket)
            .env(WORKER_ID_ENV, request.id.to_string())
            .env("cluster_setup", &primary)
            .env("handle_jobs", &primary)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = &self.worker.working_dir {
            cmd.current_dir(dir);
        }

        if self.sink.is_some() {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
        cmd
    }
}

impl ProcessHost for OsHost {
    fn spawn(&mut self, request: SpawnRequest) -> Result<Option<u32>, HostError> {
        debug!(?request, "OsHost::spawn: called");
        if self.worker.program.trim().is_empty() {
            return Err(HostError::NoProgram);
        }
        let id = request.id;

        let socket = ipc::socket_path(&self.socket_dir, id);
        let listener = ipc::bind(&socket).map_err(|source| HostError::Ipc { id, source })?;

        let mut child = match self.command(request, &socket).spawn() {
            Ok(child) => child,
            Err(source) => {
                ipc::cleanup_socket(&socket);
                return Err(HostError::Spawn { id, source });
            }
        };
        let pid = child.id();

        let mut capture = Vec::new();
        if let Some(sink) = &self.sink {
            if let Some(stdout) = child.stdout.take() {
                capture.push(spawn_capture_task(stdout, sink.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                capture.push(spawn_capture_task(stderr, sink.clone()));
            }
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited_rx) = oneshot::channel();
        let connection = tokio::spawn(ipc::serve(id, listener, exited_rx, outbound_rx, self.events_tx.clone()));
        tokio::spawn(wait_for_exit(
            id,
            child,
            exited_tx,
            connection,
            capture,
            self.events_tx.clone(),
        ));

        self.workers.insert(
            id,
            WorkerChannel {
                pid,
                outbound: outbound_tx,
                socket,
            },
        );
        debug!(id, ?pid, "OsHost::spawn: worker running");
        Ok(pid)
    }

    fn send(&mut self, id: WorkerId, message: &Value) -> Result<(), HostError> {
        let channel = self.workers.get(&id).ok_or(HostError::UnknownWorker(id))?;
        channel
            .outbound
            .send(message.clone())
            .map_err(|_| HostError::ChannelClosed(id))
    }

    fn terminate(&mut self, id: WorkerId) -> Result<(), HostError> {
        debug!(id, "OsHost::terminate: called");
        let pid = self.pid(id).ok_or(HostError::UnknownWorker(id))?;
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|source| HostError::Signal { id, source })
    }

    fn release(&mut self, id: WorkerId) {
        debug!(id, "OsHost::release: called");
        if let Some(channel) = self.workers.remove(&id) {
            ipc::cleanup_socket(&channel.socket);
        }
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<PoolEvent>> {
        self.events_rx.take()
    }
}

impl Drop for OsHost {
    fn drop(&mut self) {
        for channel in self.workers.values() {
            ipc::cleanup_socket(&channel.socket);
        }
    }
}

/// Copy a child's output stream into the sink line by line
fn spawn_capture_task(stream: impl tokio::io::AsyncRead + Unpin + Send + 'static, sink: OutputSink) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Err(e) = sink.write_line(&line) {
                warn!(error = %e, "Failed to write worker output");
            }
        }
    })
}

/// Wait for the child, let its IPC and output drain, then report the exit
///
/// Draining first keeps a worker's last messages ahead of its exit event.
async fn wait_for_exit(
    id: WorkerId,
    mut child: Child,
    exited_tx: oneshot::Sender<()>,
    connection: JoinHandle<()>,
    capture: Vec<JoinHandle<()>>,
    events: mpsc::Sender<PoolEvent>,
) {
    let exit = match child.wait().await {
        Ok(status) => WorkerExit {
            code: status.code(),
            signal: status.signal(),
        },
        Err(e) => {
            warn!(id, error = %e, "Failed to wait for worker");
            WorkerExit {
                code: None,
                signal: None,
            }
        }
    };
    debug!(id, %exit, "wait_for_exit: worker exited");
    let _ = exited_tx.send(());

    if tokio::time::timeout(DRAIN_TIMEOUT, connection).await.is_err() {
        info!(id, "Worker IPC still open after exit");
    }
    for task in capture {
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, task).await;
    }

    let _ = events.send(PoolEvent::Exited { id, exit }).await;
}
