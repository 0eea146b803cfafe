//! IPC message routing between workers

use serde_json::Value;
use tracing::{debug, info, warn};

use super::core::Supervisor;
use super::host::ProcessHost;
use super::messages::{WorkerId, WorkerMessage};
use super::state::{CacheEntry, WorkerPhase};

impl<H: ProcessHost> Supervisor<H> {
    /// Dispatch one inbound message from a live worker
    ///
    /// Messages are handled in arrival order; unrecognized shapes are dropped.
    pub fn route(&mut self, from: WorkerId, raw: Value) {
        if !self.state.is_live(from) {
            debug!(from, "Supervisor::route: message from unknown worker, ignoring");
            return;
        }

        match WorkerMessage::decode(&raw) {
            WorkerMessage::Ready => self.on_ready(from),
            WorkerMessage::Restart => self.restart(),
            WorkerMessage::Reload => self.reload(),
            WorkerMessage::JsPropagate { cache, map } => {
                debug!(from, "Supervisor::route: js-propagate");
                self.state.cache.js = CacheEntry::from_parts(cache, map);
                self.forward_to_others(from, &raw);
            }
            WorkerMessage::CssPropagate { cache, acp_cache } => {
                debug!(from, "Supervisor::route: css-propagate");
                self.state.cache.css = CacheEntry::from_parts(cache, acp_cache);
                self.forward_to_others(from, &raw);
            }
            WorkerMessage::Listening { primary } => self.on_listening(from, primary),
            WorkerMessage::UserConnect | WorkerMessage::UserDisconnect | WorkerMessage::ConfigUpdate => {
                self.notify_workers(&raw);
            }
            WorkerMessage::Unrecognized => {
                debug!(from, %raw, "Supervisor::route: unrecognized message ignored");
            }
        }
    }

    /// Hand the cached artifacts to a ready worker, then retire one queued worker
    fn on_ready(&mut self, from: WorkerId) {
        if let Some(handle) = self.state.workers.get_mut(&from) {
            handle.phase = WorkerPhase::Ready;
        }

        let js = self.state.cache.js.as_ref().map(|entry| {
            WorkerMessage::JsPropagate {
                cache: entry.payload.clone(),
                map: entry.auxiliary.clone(),
            }
            .to_value()
        });
        let css = self.state.cache.css.as_ref().map(|entry| {
            WorkerMessage::CssPropagate {
                cache: entry.payload.clone(),
                acp_cache: entry.auxiliary.clone(),
            }
            .to_value()
        });
        for message in js.into_iter().chain(css) {
            self.send_to(from, &message);
        }

        // Skip ids that are no longer live
        while let Some(doomed) = self.state.shutdown_queue.pop_next() {
            if self.terminate_worker(doomed) {
                break;
            }
        }
    }

    fn on_listening(&mut self, from: WorkerId, primary: bool) {
        if let Some(handle) = self.state.workers.get_mut(&from) {
            if handle.phase == WorkerPhase::Forked {
                handle.phase = WorkerPhase::Listening;
            }
            let pid = handle.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string());
            info!("[cluster] Child Process ({}) listening for connections.", pid);
        }

        if primary {
            debug!(from, "Supervisor::on_listening: primary announced");
            self.state.primary = Some(from);
        }
    }

    /// Relay a message to every live worker except its sender
    fn forward_to_others(&mut self, from: WorkerId, message: &Value) {
        for id in self.state.live_ids() {
            if id != from {
                self.send_to(id, message);
            }
        }
    }

    /// Relay a message verbatim to every live worker, sender included
    fn notify_workers(&mut self, message: &Value) {
        for id in self.state.live_ids() {
            self.send_to(id, message);
        }
    }

    fn send_to(&mut self, id: WorkerId, message: &Value) {
        if let Err(e) = self.host.send(id, message) {
            warn!(id, error = %e, "Failed to send message to worker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::config::SupervisorConfig;
    use crate::supervisor::memory::MemoryHost;
    use crate::supervisor::state::CacheStore;
    use serde_json::json;

    fn supervisor(num_procs: usize) -> Supervisor<MemoryHost> {
        let mut sup = Supervisor::new(SupervisorConfig::with_num_procs(num_procs), MemoryHost::new(16));
        sup.start(num_procs);
        sup
    }

    #[test]
    fn test_js_propagate_updates_cache_and_skips_sender() {
        let mut sup = supervisor(3);
        let msg = json!({"action": "js-propagate", "cache": "P", "map": "M"});

        sup.route(1, msg.clone());

        let js = sup.state().cache.js.clone().unwrap();
        assert_eq!(js.payload, json!("P"));
        assert_eq!(js.auxiliary, json!("M"));
        assert!(sup.host().messages_for(1).is_empty());
        assert_eq!(sup.host().messages_for(2), vec![msg.clone()]);
        assert_eq!(sup.host().messages_for(3), vec![msg]);
    }

    #[test]
    fn test_css_propagate_updates_cache_and_skips_sender() {
        let mut sup = supervisor(2);
        let msg = json!({"action": "css-propagate", "cache": "C", "acpCache": "A"});

        sup.route(2, msg.clone());

        let css = sup.state().cache.css.clone().unwrap();
        assert_eq!(css.payload, json!("C"));
        assert_eq!(css.auxiliary, json!("A"));
        assert_eq!(sup.host().messages_for(1), vec![msg]);
        assert!(sup.host().messages_for(2).is_empty());
    }

    #[test]
    fn test_ready_receives_cached_artifacts_first() {
        let mut sup = supervisor(1);
        sup.route(1, json!({"action": "js-propagate", "cache": "P", "map": "M"}));
        sup.route(1, json!({"action": "css-propagate", "cache": "C", "acpCache": "A"}));

        // A fresh worker joins and announces ready
        let late = sup.fork_worker(false).unwrap();
        sup.route(late, json!({"action": "ready"}));

        let received = sup.host().messages_for(late);
        assert_eq!(
            received,
            vec![
                json!({"action": "js-propagate", "cache": "P", "map": "M"}),
                json!({"action": "css-propagate", "cache": "C", "acpCache": "A"}),
            ]
        );
        assert_eq!(sup.state().workers[&late].phase, WorkerPhase::Ready);
    }

    #[test]
    fn test_ready_without_cache_sends_nothing() {
        let mut sup = supervisor(2);
        sup.route(1, json!({"action": "ready"}));
        assert!(sup.host().messages_for(1).is_empty());
        assert!(sup.host().terminated().is_empty());
    }

    #[test]
    fn test_ready_pops_one_queued_worker() {
        let mut sup = supervisor(2);
        sup.restart();

        sup.route(3, json!({"action": "ready"}));
        assert_eq!(sup.host().terminated(), &[1]);
        assert_eq!(sup.state().shutdown_queue.ids(), vec![2]);

        sup.route(4, json!({"action": "ready"}));
        assert_eq!(sup.host().terminated(), &[1, 2]);
        assert!(sup.state().shutdown_queue.is_empty());
    }

    #[test]
    fn test_listening_primary_sets_marker() {
        let mut sup = supervisor(2);

        sup.route(2, json!({"action": "listening"}));
        assert_eq!(sup.state().primary, None);
        assert_eq!(sup.state().workers[&2].phase, WorkerPhase::Listening);

        sup.route(1, json!({"action": "listening", "primary": true}));
        assert_eq!(sup.state().primary, Some(1));
    }

    #[test]
    fn test_broadcast_actions_reach_every_worker_including_sender() {
        let mut sup = supervisor(3);
        for action in ["user:connect", "user:disconnect", "config:update"] {
            let msg = json!({"action": action, "payload": {"uid": 7}});
            sup.route(2, msg.clone());
            for id in 1..=3 {
                assert_eq!(sup.host().messages_for(id).last(), Some(&msg));
            }
        }
        assert_eq!(sup.host().messages_for(2).len(), 3);
    }

    #[test]
    fn test_restart_action_triggers_rolling_restart() {
        let mut sup = supervisor(2);
        sup.route(1, json!({"action": "restart"}));
        assert_eq!(sup.state().shutdown_queue.ids(), vec![1, 2]);
        assert_eq!(sup.state().workers.len(), 4);
    }

    #[test]
    fn test_reload_action_broadcasts_reload() {
        let mut sup = supervisor(2);
        sup.route(2, json!({"action": "reload"}));
        assert_eq!(sup.host().messages_for(1), vec![WorkerMessage::reload()]);
        assert_eq!(sup.host().messages_for(2), vec![WorkerMessage::reload()]);
    }

    #[test]
    fn test_unrecognized_and_malformed_messages_are_ignored() {
        let mut sup = supervisor(2);
        sup.route(1, json!({"action": "launch-missiles"}));
        sup.route(1, json!("ready"));
        sup.route(1, json!(42));
        sup.route(1, json!({"cache": "P"}));

        assert!(sup.host().sent().is_empty());
        assert!(sup.host().terminated().is_empty());
        assert_eq!(sup.state().cache, CacheStore::default());
        assert_eq!(sup.host().spawned().len(), 2);
    }

    #[test]
    fn test_messages_from_dead_workers_are_ignored() {
        let mut sup = supervisor(2);
        sup.route(9, json!({"action": "js-propagate", "cache": "P"}));
        assert!(sup.state().cache.js.is_none());
        assert!(sup.host().sent().is_empty());
    }
}
