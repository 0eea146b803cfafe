//! Message types exchanged between the supervisor, its workers and its handle

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use super::state::WorkerPhase;

/// Supervisor-assigned worker identifier, unique per live child
pub type WorkerId = u32;

/// Inbound IPC messages from workers, tagged by their `action` field
///
/// Payload fields are opaque to the supervisor and kept as raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum WorkerMessage {
    /// Worker finished booting and can take cached artifacts
    #[serde(rename = "ready")]
    Ready,

    /// Worker asks for a rolling restart of the whole pool
    #[serde(rename = "restart")]
    Restart,

    /// Worker asks for a reload broadcast
    #[serde(rename = "reload")]
    Reload,

    /// New js bundle and its source map
    #[serde(rename = "js-propagate")]
    JsPropagate {
        #[serde(default)]
        cache: Value,
        #[serde(default)]
        map: Value,
    },

    /// New css bundle and its admin-panel variant
    #[serde(rename = "css-propagate")]
    CssPropagate {
        #[serde(default)]
        cache: Value,
        #[serde(default, rename = "acpCache")]
        acp_cache: Value,
    },

    /// Worker is accepting connections; a truthy `primary` claims the primary role
    #[serde(rename = "listening")]
    Listening {
        #[serde(default, deserialize_with = "truthy")]
        primary: bool,
    },

    #[serde(rename = "user:connect")]
    UserConnect,

    #[serde(rename = "user:disconnect")]
    UserDisconnect,

    #[serde(rename = "config:update")]
    ConfigUpdate,

    /// Any other action, or a message that is not an object with a string `action`
    #[serde(other)]
    Unrecognized,
}

impl WorkerMessage {
    /// Decode a raw IPC payload, mapping every malformed shape to `Unrecognized`
    pub fn decode(raw: &Value) -> Self {
        // serde also accepts numeric variant indices as tags
        if !raw.get("action").is_some_and(Value::is_string) {
            return Self::Unrecognized;
        }
        Self::deserialize(raw).unwrap_or(Self::Unrecognized)
    }

    /// The outbound `reload` instruction
    pub fn reload() -> Value {
        serde_json::json!({ "action": "reload" })
    }

    /// Serialize into the JSON shape workers expect
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Loose truthiness for flags that workers may send as numbers or strings
///
/// `false`, `null`, `0` and `""` are false; everything else is true.
fn truthy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => false,
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    })
}

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerExit {
    /// Exit code, absent when the process was killed by a signal
    pub code: Option<i32>,
    /// Terminating signal number, if any
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// A clean exit is exit code zero; anything else counts as a crash
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = self.code.map(|c| c.to_string()).unwrap_or_else(|| "null".to_string());
        let signal = self.signal.map(|s| s.to_string()).unwrap_or_else(|| "null".to_string());
        write!(f, "code: {}, signal: {}", code, signal)
    }
}

/// Events delivered by the process host to the supervisor loop
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// A worker sent an IPC message
    Message { id: WorkerId, raw: Value },

    /// A worker's IPC channel closed
    Disconnected { id: WorkerId },

    /// A worker process exited
    Exited { id: WorkerId, exit: WorkerExit },
}

/// Requests sent to the supervisor task through a `SupervisorHandle`
#[derive(Debug)]
pub enum ControlRequest {
    /// Rolling restart of the whole pool
    Restart,

    /// Broadcast `reload` to every live worker
    Reload,

    /// Snapshot of the pool
    Status { reply_tx: oneshot::Sender<PoolStatus> },

    /// Terminate every worker and stop the loop
    Shutdown,
}

/// Snapshot of one live worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub phase: WorkerPhase,
    #[serde(rename = "primary-candidate")]
    pub primary_candidate: bool,
    pub terminating: bool,
}

/// Snapshot of the whole pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub workers: Vec<WorkerStatus>,
    pub primary: Option<WorkerId>,
    #[serde(rename = "shutdown-queue")]
    pub shutdown_queue: Vec<WorkerId>,
    #[serde(rename = "crash-count")]
    pub crash_count: usize,
    #[serde(rename = "js-cached")]
    pub js_cached: bool,
    #[serde(rename = "css-cached")]
    pub css_cached: bool,
}
