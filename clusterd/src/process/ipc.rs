//! Per-worker IPC channel
//!
//! Every worker connects back to its own Unix domain socket. Messages are one
//! JSON document per line in both directions.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::supervisor::{PoolEvent, WorkerId};

/// Socket path for one worker
pub fn socket_path(dir: &Path, id: WorkerId) -> PathBuf {
    dir.join(format!("worker-{}.sock", id))
}

/// Bind a worker socket, replacing any stale file left by an earlier run
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    debug!(?path, "ipc::bind: called");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        debug!(?path, "ipc::bind: removing stale socket");
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path)
}

/// Remove a socket file once its worker is gone
pub fn cleanup_socket(path: &Path) {
    if path.exists() {
        debug!(?path, "cleanup_socket: removing socket file");
        if let Err(e) = std::fs::remove_file(path) {
            warn!(?path, error = %e, "Failed to remove socket file");
        }
    }
}

/// Accept the worker's connection and pump messages until it closes
///
/// Gives up without a connection when `exited` fires first. Emits
/// `Disconnected` once a connected worker's stream reaches EOF.
pub async fn serve(
    id: WorkerId,
    listener: UnixListener,
    exited: oneshot::Receiver<()>,
    outbound: mpsc::UnboundedReceiver<Value>,
    events: mpsc::Sender<PoolEvent>,
) {
    let stream = tokio::select! {
        biased;
        accepted = listener.accept() => match accepted {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(id, error = %e, "Failed to accept worker connection");
                return;
            }
        },
        _ = exited => {
            debug!(id, "ipc::serve: worker exited before connecting");
            return;
        }
    };
    drop(listener);
    debug!(id, "ipc::serve: worker connected");

    let (read_half, write_half) = stream.into_split();
    let writer = tokio::spawn(write_loop(id, write_half, outbound));
    read_loop(id, read_half, &events).await;
    writer.abort();

    let _ = events.send(PoolEvent::Disconnected { id }).await;
}

async fn read_loop(id: WorkerId, read_half: OwnedReadHalf, events: &mpsc::Sender<PoolEvent>) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(id, error = %e, "ipc::read_loop: read failed");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(raw) => {
                if events.send(PoolEvent::Message { id, raw }).await.is_err() {
                    break;
                }
            }
            Err(e) => debug!(id, error = %e, "ipc::read_loop: dropping malformed line"),
        }
    }
}

async fn write_loop(id: WorkerId, mut write_half: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Value>) {
    while let Some(message) = outbound.recv().await {
        let mut line = message.to_string();
        line.push('\n');
        if let Err(e) = write_half.write_all(line.as_bytes()).await {
            debug!(id, error = %e, "ipc::write_loop: write failed");
            break;
        }
        if let Err(e) = write_half.flush().await {
            debug!(id, error = %e, "ipc::write_loop: flush failed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::UnixStream;

    #[test]
    fn test_socket_path() {
        let path = socket_path(Path::new("/srv/app/run"), 7);
        assert_eq!(path, PathBuf::from("/srv/app/run/worker-7.sock"));
    }

    #[tokio::test]
    async fn test_bind_creates_parent_and_replaces_stale_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run").join("worker-1.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "stale").unwrap();

        let _listener = bind(&path).unwrap();
        assert!(path.exists());

        cleanup_socket(&path);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_serve_relays_both_directions() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("worker-1.sock");
        let listener = bind(&path).unwrap();
        let (_exited_tx, exited_rx) = oneshot::channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::channel(8);

        // Queued before the worker connects
        out_tx.send(json!({"action": "reload"})).unwrap();
        let task = tokio::spawn(serve(1, listener, exited_rx, out_rx, events_tx));

        let stream = UnixStream::connect(&path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(b"{\"action\":\"ready\"}\nnot json\n\n{\"action\":\"listening\"}\n")
            .await
            .unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let received = lines.next_line().await.unwrap().unwrap();
        assert_eq!(serde_json::from_str::<Value>(&received).unwrap(), json!({"action": "reload"}));

        let first = events_rx.recv().await.unwrap();
        assert_eq!(
            first,
            PoolEvent::Message {
                id: 1,
                raw: json!({"action": "ready"})
            }
        );
        let second = events_rx.recv().await.unwrap();
        assert_eq!(
            second,
            PoolEvent::Message {
                id: 1,
                raw: json!({"action": "listening"})
            }
        );

        drop(write_half);
        drop(lines);
        let closed = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed, PoolEvent::Disconnected { id: 1 });
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_serve_gives_up_when_worker_exits_unconnected() {
        let temp = TempDir::new().unwrap();
        let listener = bind(&temp.path().join("worker-2.sock")).unwrap();
        let (exited_tx, exited_rx) = oneshot::channel();
        let (_out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::channel(8);

        let task = tokio::spawn(serve(2, listener, exited_rx, out_rx, events_tx));
        exited_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(events_rx.recv().await.is_none());
    }
}
