//! Fork, restart, reload and exit handling

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::core::{Flow, Supervisor};
use super::host::{ProcessHost, SpawnRequest};
use super::messages::{WorkerExit, WorkerId, WorkerMessage};
use super::state::{WorkerHandle, WorkerPhase};

impl<H: ProcessHost> Supervisor<H> {
    /// Fork `count` workers; the first one carries the primary hint
    pub fn start(&mut self, count: usize) -> Vec<WorkerId> {
        info!("Clustering enabled: Spinning up {} process(es).", count);
        (0..count).filter_map(|index| self.fork_worker(index == 0)).collect()
    }

    /// Fork a single worker and record its handle
    pub(super) fn fork_worker(&mut self, primary: bool) -> Option<WorkerId> {
        let id = self.state.allocate_id();
        debug!(id, primary, "Supervisor::fork_worker: called");
        match self.host.spawn(SpawnRequest { id, primary }) {
            Ok(pid) => {
                self.state.workers.insert(id, WorkerHandle::new(id, pid, primary));
                info!(id, ?pid, primary, "[cluster] Forked worker");
                Some(id)
            }
            Err(e) => {
                error!(id, error = %e, "[cluster] Failed to fork worker");
                None
            }
        }
    }

    /// Rolling restart: queue every live worker for termination and fork a
    /// fresh pool next to it. Old workers go away one per `ready` announcement.
    pub fn restart(&mut self) {
        info!("[cluster] Restarting...");
        let doomed: Vec<WorkerId> = self
            .state
            .workers
            .values()
            .filter(|handle| !handle.terminating)
            .map(|handle| handle.id)
            .collect();
        for id in doomed {
            self.state.shutdown_queue.enqueue(id);
        }
        debug!(queued = self.state.shutdown_queue.len(), "Supervisor::restart: shutdown queue filled");
        self.start(self.config.num_procs);
    }

    /// Broadcast `reload` to every live worker
    pub fn reload(&mut self) {
        info!("[cluster] Reloading...");
        let message = WorkerMessage::reload();
        for id in self.state.live_ids() {
            if let Err(e) = self.host.send(id, &message) {
                warn!(id, error = %e, "Failed to send reload");
            }
        }
    }

    /// Ask a live worker to exit; its exit will be treated as voluntary
    pub(super) fn terminate_worker(&mut self, id: WorkerId) -> bool {
        let Some(handle) = self.state.workers.get_mut(&id) else {
            debug!(id, "Supervisor::terminate_worker: worker not live");
            return false;
        };
        handle.terminating = true;
        match self.host.terminate(id) {
            Ok(()) => {
                info!(id, pid = ?handle.pid, "[cluster] Terminating worker");
                true
            }
            Err(e) => {
                warn!(id, error = %e, "Failed to terminate worker");
                false
            }
        }
    }

    /// Terminate every live worker and forget the shutdown queue
    pub fn shutdown_all(&mut self) {
        debug!(live = self.state.workers.len(), "Supervisor::shutdown_all: called");
        while self.state.shutdown_queue.pop_next().is_some() {}
        for id in self.state.live_ids() {
            self.terminate_worker(id);
        }
    }

    /// Handle a worker process exit
    pub fn on_child_exit(&mut self, id: WorkerId, exit: WorkerExit) -> Flow {
        let Some(handle) = self.state.workers.remove(&id) else {
            debug!(id, %exit, "Supervisor::on_child_exit: unknown worker, ignoring");
            return Flow::Continue;
        };
        self.host.release(id);

        let was_queued = self.state.shutdown_queue.remove(id);
        let voluntary = handle.terminating || was_queued;

        if !exit.is_clean() && !voluntary {
            let count = self.state.crashes.record(Instant::now().into_std());
            if count > self.config.crash_threshold() {
                error!(
                    "{} restarts in {} seconds, most likely an error on startup. Halting.",
                    self.config.crash_threshold(),
                    self.state.crashes.window().as_secs()
                );
                return Flow::Halt;
            }
        }

        let pid = handle.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string());
        info!("[cluster] Child Process ({}) has exited ({})", pid, exit);

        let was_primary = handle.primary_candidate || self.state.primary == Some(id);
        if self.state.primary == Some(id) {
            self.state.primary = None;
        }

        if voluntary {
            debug!(id, "Supervisor::on_child_exit: voluntary exit, not respawning");
            return Flow::Continue;
        }

        info!("[cluster] Spinning up another process...");
        self.fork_worker(was_primary);
        Flow::Continue
    }

    /// Handle a closed IPC channel; the exit event still follows separately
    pub fn on_child_disconnect(&mut self, id: WorkerId) {
        if let Some(handle) = self.state.workers.get_mut(&id) {
            handle.phase = WorkerPhase::Disconnected;
            let pid = handle.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string());
            info!("[cluster] Child Process ({}) has disconnected", pid);
        } else {
            debug!(id, "Supervisor::on_child_disconnect: unknown worker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::config::SupervisorConfig;
    use crate::supervisor::memory::MemoryHost;

    fn supervisor(num_procs: usize) -> Supervisor<MemoryHost> {
        Supervisor::new(SupervisorConfig::with_num_procs(num_procs), MemoryHost::new(16))
    }

    #[test]
    fn test_start_forks_n_with_one_primary_candidate() {
        let mut sup = supervisor(3);
        let ids = sup.start(3);

        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(sup.state().workers.len(), 3);
        let primaries: Vec<_> = sup.host().spawned().iter().filter(|r| r.primary).collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].id, 1);
        assert!(sup.state().workers[&1].primary_candidate);
        assert!(!sup.state().workers[&2].primary_candidate);
    }

    #[test]
    fn test_spawn_failure_is_not_recorded() {
        let mut sup = supervisor(2);
        sup.host_mut().fail_spawns(true);
        assert!(sup.start(2).is_empty());
        assert!(sup.state().workers.is_empty());
    }

    #[test]
    fn test_reload_sends_once_to_each_worker_and_forks_nothing() {
        let mut sup = supervisor(2);
        sup.start(2);

        sup.reload();

        assert_eq!(sup.host().messages_for(1), vec![WorkerMessage::reload()]);
        assert_eq!(sup.host().messages_for(2), vec![WorkerMessage::reload()]);
        assert_eq!(sup.host().spawned().len(), 2);
        assert!(sup.host().terminated().is_empty());
    }

    #[test]
    fn test_restart_queues_live_workers_and_forks_new_pool() {
        let mut sup = supervisor(2);
        sup.start(2);

        sup.restart();

        assert_eq!(sup.state().shutdown_queue.ids(), vec![1, 2]);
        assert_eq!(sup.state().workers.len(), 4);
        assert!(sup.host().terminated().is_empty());
        // New pool's first worker carries the primary hint again
        assert!(sup.state().workers[&3].primary_candidate);
        assert!(!sup.state().workers[&4].primary_candidate);
    }

    #[test]
    fn test_crash_respawns_with_primary_flag() {
        let mut sup = supervisor(2);
        sup.start(2);

        assert_eq!(sup.on_child_exit(1, WorkerExit::code(1)), Flow::Continue);

        assert_eq!(sup.state().crashes.count(), 1);
        assert!(!sup.state().is_live(1));
        assert!(sup.state().workers[&3].primary_candidate);
        assert_eq!(sup.host().released(), &[1]);
    }

    #[test]
    fn test_clean_exit_respawns_without_counting_crash() {
        let mut sup = supervisor(1);
        sup.start(1);

        sup.on_child_exit(1, WorkerExit::code(0));

        assert_eq!(sup.state().crashes.count(), 0);
        assert!(sup.state().is_live(2));
    }

    #[test]
    fn test_voluntary_exit_is_not_respawned_or_counted() {
        let mut sup = supervisor(1);
        sup.start(1);
        assert!(sup.terminate_worker(1));

        sup.on_child_exit(1, WorkerExit::signal(15));

        assert_eq!(sup.state().crashes.count(), 0);
        assert!(sup.state().workers.is_empty());
        assert_eq!(sup.host().spawned().len(), 1);
    }

    #[test]
    fn test_exit_while_queued_is_voluntary_and_dequeued() {
        let mut sup = supervisor(1);
        sup.start(1);
        sup.restart();

        sup.on_child_exit(1, WorkerExit::code(1));

        assert!(sup.state().shutdown_queue.is_empty());
        assert_eq!(sup.state().crashes.count(), 0);
        assert_eq!(sup.state().live_ids(), vec![2]);
    }

    #[test]
    fn test_crash_loop_breaker_trips_only_above_threshold() {
        let mut sup = supervisor(1);
        sup.start(1);

        // Threshold is 3 for a single worker
        for id in 1..=3 {
            assert_eq!(sup.on_child_exit(id, WorkerExit::code(1)), Flow::Continue);
        }
        assert_eq!(sup.state().crashes.count(), 3);
        assert_eq!(sup.on_child_exit(4, WorkerExit::code(1)), Flow::Halt);
    }

    #[test]
    fn test_exit_of_unknown_worker_is_ignored() {
        let mut sup = supervisor(1);
        sup.start(1);
        assert_eq!(sup.on_child_exit(99, WorkerExit::code(1)), Flow::Continue);
        assert_eq!(sup.state().crashes.count(), 0);
        assert_eq!(sup.host().spawned().len(), 1);
    }

    #[test]
    fn test_disconnect_only_marks_phase() {
        let mut sup = supervisor(1);
        sup.start(1);

        sup.on_child_disconnect(1);

        assert_eq!(sup.state().workers[&1].phase, WorkerPhase::Disconnected);
        assert_eq!(sup.host().spawned().len(), 1);
    }

    #[test]
    fn test_shutdown_all_terminates_everyone() {
        let mut sup = supervisor(2);
        sup.start(2);
        sup.restart();

        sup.shutdown_all();

        assert_eq!(sup.host().terminated(), &[1, 2, 3, 4]);
        assert!(sup.state().shutdown_queue.is_empty());
        assert!(sup.state().workers.values().all(|w| w.terminating));
    }
}
