//! Process-pool supervisor
//!
//! The supervisor owns every piece of coordination state and is driven by two
//! inputs only:
//! - **Pool events** from the process host: IPC messages, disconnects, exits
//! - **Control requests** from a `SupervisorHandle`: restart, reload, status, shutdown
//!
//! Each input is handled to completion before the next one is taken.

mod config;
mod control;
mod core;
mod handle;
mod host;
mod memory;
mod messages;
mod router;
mod state;

pub use config::SupervisorConfig;
pub use self::core::{Flow, RunOutcome, Supervisor};
pub use handle::SupervisorHandle;
pub use host::{HostError, ProcessHost, SpawnRequest};
pub use memory::MemoryHost;
pub use messages::{ControlRequest, PoolEvent, PoolStatus, WorkerExit, WorkerId, WorkerMessage, WorkerStatus};
pub use state::{CacheEntry, CacheStore, CrashCounter, PoolState, ShutdownQueue, WorkerHandle, WorkerPhase};
