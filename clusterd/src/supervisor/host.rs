//! Process-host capability used by the supervisor
//!
//! The supervisor never touches OS processes directly. It forks, messages and
//! terminates workers through this trait and receives their events from the
//! stream the host hands out, so the state machine can run against an
//! in-memory host in tests.

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use super::messages::{PoolEvent, WorkerId};

/// Errors from process-host operations
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Failed to spawn worker {id}: {source}")]
    Spawn {
        id: WorkerId,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to set up IPC for worker {id}: {source}")]
    Ipc {
        id: WorkerId,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker {0} is not known to the host")]
    UnknownWorker(WorkerId),

    #[error("Channel to worker {0} is closed")]
    ChannelClosed(WorkerId),

    #[error("Failed to signal worker {id}: {source}")]
    Signal {
        id: WorkerId,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("Worker program is not configured")]
    NoProgram,
}

/// What the supervisor asks the host to fork
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnRequest {
    pub id: WorkerId,
    /// Primary hint passed to the child's environment
    pub primary: bool,
}

/// Capability interface over worker processes
pub trait ProcessHost {
    /// Fork a worker, returning its OS pid when known
    fn spawn(&mut self, request: SpawnRequest) -> Result<Option<u32>, HostError>;

    /// Fire-and-forget IPC send
    fn send(&mut self, id: WorkerId, message: &Value) -> Result<(), HostError>;

    /// Ask a worker to exit; its exit still arrives as a `PoolEvent::Exited`
    fn terminate(&mut self, id: WorkerId) -> Result<(), HostError>;

    /// Forget a worker after its exit has been handled
    fn release(&mut self, id: WorkerId);

    /// Take the event stream; there is exactly one consumer
    fn take_events(&mut self) -> Option<mpsc::Receiver<PoolEvent>>;
}
