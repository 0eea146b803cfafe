//! clusterd - single-host process-pool supervisor
//!
//! clusterd forks a fixed number of worker processes, keeps them alive, and
//! relays messages between them.
//!
//! # Core Concepts
//!
//! - **Primary worker**: exactly one worker is trusted with exclusive duties,
//!   designated when it announces itself as primary
//! - **Rolling restart**: old workers are retired one at a time, each time a
//!   fresh worker reports `ready`
//! - **Cache propagation**: compiled js/css bundles announced by one worker are
//!   relayed to its siblings and replayed to every newcomer
//! - **Crash-loop breaker**: too many crashes inside the crash window stop the
//!   whole tree instead of respawning forever
//!
//! # Modules
//!
//! - [`supervisor`] - Pool state machine, message router, and run loop
//! - [`process`] - Worker processes and their IPC sockets
//! - [`bootstrap`] - Start-of-day sequence and signal wiring
//! - [`daemon`] - Pid file, singleton check, detaching
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod logging;
pub mod process;
pub mod sink;
pub mod supervisor;

pub use bootstrap::{Bootstrap, Launch, LaunchMode};
pub use config::Config;
pub use process::OsHost;
pub use supervisor::{MemoryHost, ProcessHost, RunOutcome, Supervisor, SupervisorConfig, SupervisorHandle};
