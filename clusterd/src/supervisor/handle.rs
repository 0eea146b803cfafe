//! SupervisorHandle - client interface to a running supervisor

use eyre::{Result, eyre};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::messages::{ControlRequest, PoolStatus};

/// Handle for signal listeners and other tasks to drive the supervisor
///
/// Cloneable; every operation is a message to the supervisor task.
#[derive(Clone, Debug)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<ControlRequest>,
}

impl SupervisorHandle {
    pub(crate) fn new(tx: mpsc::Sender<ControlRequest>) -> Self {
        Self { tx }
    }

    /// Request a rolling restart of the pool
    pub async fn restart(&self) -> Result<()> {
        debug!("SupervisorHandle::restart: called");
        self.send(ControlRequest::Restart).await
    }

    /// Request a reload broadcast
    pub async fn reload(&self) -> Result<()> {
        debug!("SupervisorHandle::reload: called");
        self.send(ControlRequest::Reload).await
    }

    /// Request a graceful shutdown
    pub async fn shutdown(&self) -> Result<()> {
        debug!("SupervisorHandle::shutdown: called");
        self.send(ControlRequest::Shutdown).await
    }

    /// Snapshot of the pool
    pub async fn status(&self) -> Result<PoolStatus> {
        debug!("SupervisorHandle::status: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ControlRequest::Status { reply_tx }).await?;
        reply_rx.await.map_err(|_| eyre!("Supervisor stopped before reply"))
    }

    async fn send(&self, request: ControlRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| eyre!("Supervisor channel closed"))
    }
}
