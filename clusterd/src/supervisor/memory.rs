//! In-memory process host
//!
//! Records every spawn, send and terminate instead of touching the OS. Events
//! are injected through `event_sender`. Used by the test suites and handy for
//! exercising the supervisor without real workers.

use std::collections::BTreeSet;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::host::{HostError, ProcessHost, SpawnRequest};
use super::messages::{PoolEvent, WorkerExit, WorkerId};

#[derive(Debug)]
pub struct MemoryHost {
    events_tx: mpsc::Sender<PoolEvent>,
    events_rx: Option<mpsc::Receiver<PoolEvent>>,
    live: BTreeSet<WorkerId>,
    spawned: Vec<SpawnRequest>,
    sent: Vec<(WorkerId, Value)>,
    terminated: Vec<WorkerId>,
    released: Vec<WorkerId>,
    fail_spawns: bool,
    exit_on_terminate: bool,
    next_pid: u32,
}

impl MemoryHost {
    pub fn new(buffer: usize) -> Self {
        let (events_tx, events_rx) = mpsc::channel(buffer);
        Self {
            events_tx,
            events_rx: Some(events_rx),
            live: BTreeSet::new(),
            spawned: Vec::new(),
            sent: Vec::new(),
            terminated: Vec::new(),
            released: Vec::new(),
            fail_spawns: false,
            exit_on_terminate: true,
            next_pid: 10_000,
        }
    }

    /// Sender for injecting worker events
    pub fn event_sender(&self) -> mpsc::Sender<PoolEvent> {
        self.events_tx.clone()
    }

    /// Make every following spawn fail
    pub fn fail_spawns(&mut self, fail: bool) {
        self.fail_spawns = fail;
    }

    /// Whether a terminated worker reports a SIGTERM exit on its own
    pub fn exit_on_terminate(&mut self, exit: bool) {
        self.exit_on_terminate = exit;
    }

    pub fn spawned(&self) -> &[SpawnRequest] {
        &self.spawned
    }

    pub fn sent(&self) -> &[(WorkerId, Value)] {
        &self.sent
    }

    pub fn terminated(&self) -> &[WorkerId] {
        &self.terminated
    }

    pub fn released(&self) -> &[WorkerId] {
        &self.released
    }

    /// Messages delivered to one worker, in send order
    pub fn messages_for(&self, id: WorkerId) -> Vec<Value> {
        self.sent
            .iter()
            .filter(|(to, _)| *to == id)
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }
}

impl ProcessHost for MemoryHost {
    fn spawn(&mut self, request: SpawnRequest) -> Result<Option<u32>, HostError> {
        debug!(?request, "MemoryHost::spawn: called");
        if self.fail_spawns {
            return Err(HostError::Spawn {
                id: request.id,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "spawn disabled"),
            });
        }
        self.spawned.push(request);
        self.live.insert(request.id);
        self.next_pid += 1;
        Ok(Some(self.next_pid))
    }

    fn send(&mut self, id: WorkerId, message: &Value) -> Result<(), HostError> {
        if !self.live.contains(&id) {
            return Err(HostError::UnknownWorker(id));
        }
        self.sent.push((id, message.clone()));
        Ok(())
    }

    fn terminate(&mut self, id: WorkerId) -> Result<(), HostError> {
        if !self.live.contains(&id) {
            return Err(HostError::UnknownWorker(id));
        }
        self.terminated.push(id);
        if self.exit_on_terminate {
            let exit = PoolEvent::Exited {
                id,
                exit: WorkerExit::signal(15),
            };
            if self.events_tx.try_send(exit).is_err() {
                debug!(id, "MemoryHost::terminate: event buffer full, exit dropped");
            }
        }
        Ok(())
    }

    fn release(&mut self, id: WorkerId) {
        self.live.remove(&id);
        self.released.push(id);
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<PoolEvent>> {
        self.events_rx.take()
    }
}
