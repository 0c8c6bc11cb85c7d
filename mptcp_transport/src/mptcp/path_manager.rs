//! Path manager
//!
//! Address announcements arrive on the data path, which must not block.
//! They are queued to a background task that opens or tears down
//! subflows through [`PathOps`]. The task checks the connection's closed
//! flag before and after every I/O step, so closing a connection cancels
//! its outstanding path work.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::connection::WeakConnection;
use super::subflow::SubflowId;

/// I/O side of path management, supplied by the embedding transport
#[async_trait]
pub trait PathOps: Send + Sync {
    /// Open a path and send a SYN carrying `syn_options`. The SYN-ACK is
    /// handed to `Connection::on_join_syn_ack` by the caller.
    async fn open_path(
        &self,
        token: u32,
        subflow: SubflowId,
        local: SocketAddr,
        remote: SocketAddr,
        syn_options: Bytes,
    ) -> std::io::Result<()>;

    async fn close_path(&self, token: u32, subflow: SubflowId) -> std::io::Result<()>;
}

/// Work item for the path manager task
#[derive(Debug)]
pub enum PmCommand {
    AddAddr {
        conn: WeakConnection,
        address_id: u8,
        addr: SocketAddr,
    },
    RemoveAddr {
        conn: WeakConnection,
        address_id: u8,
    },
}

pub struct PathManager {
    tx: mpsc::Sender<PmCommand>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PathManager {
    /// Start the worker. Must be called within a Tokio runtime.
    pub fn spawn(ops: Arc<dyn PathOps>, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(run(rx, shutdown_rx, ops));

        Self {
            tx,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<PmCommand> {
        self.tx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().as_ref().map_or(false, |w| !w.is_finished())
    }

    /// Stop the worker and wait for it. Queued work is discarded.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "path manager task failed");
            }
        }
    }
}

async fn run(
    mut rx: mpsc::Receiver<PmCommand>,
    mut shutdown: watch::Receiver<bool>,
    ops: Arc<dyn PathOps>,
) {
    tracing::debug!("path manager started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            command = rx.recv() => match command {
                Some(command) => handle_command(ops.as_ref(), command).await,
                None => break,
            },
        }
    }
    tracing::debug!("path manager stopped");
}

async fn handle_command(ops: &dyn PathOps, command: PmCommand) {
    match command {
        PmCommand::AddAddr { conn, address_id, addr } => {
            add_subflow(ops, conn, address_id, addr).await
        }
        PmCommand::RemoveAddr { conn, address_id } => remove_subflows(ops, conn, address_id).await,
    }
}

async fn add_subflow(ops: &dyn PathOps, weak: WeakConnection, address_id: u8, addr: SocketAddr) {
    let Some(handle) = weak.upgrade() else {
        tracing::trace!(address_id, "connection gone, announcement dropped");
        return;
    };
    let token = handle.token();

    let (id, local, syn) = {
        let mut conn = handle.lock();
        if conn.is_closed() {
            tracing::debug!(token = format_args!("{:08x}", token), address_id, "connection closed, announcement dropped");
            return;
        }
        if conn.has_subflow_to(addr) {
            return;
        }
        match conn.open_join(None, addr, address_id, false) {
            Ok((id, syn)) => {
                let local = conn.subflow(id).map(|s| s.local_addr);
                match local {
                    Some(local) => (id, local, syn),
                    None => return,
                }
            }
            Err(e) => {
                tracing::debug!(token = format_args!("{:08x}", token), error = %e, "join not opened");
                return;
            }
        }
    };

    if let Err(e) = ops.open_path(token, id, local, addr, syn).await {
        tracing::warn!(token = format_args!("{:08x}", token), subflow = id, %addr, error = %e, "failed to open path");
        handle.lock().abort_join(id);
        return;
    }

    let closed = handle.lock().is_closed();
    if closed {
        // connection went away while the path was opening
        if let Err(e) = ops.close_path(token, id).await {
            tracing::debug!(token = format_args!("{:08x}", token), subflow = id, error = %e, "close after cancel failed");
        }
    }
}

async fn remove_subflows(ops: &dyn PathOps, weak: WeakConnection, address_id: u8) {
    let Some(handle) = weak.upgrade() else {
        return;
    };
    let token = handle.token();

    let ids = {
        let mut conn = handle.lock();
        if conn.is_closed() {
            return;
        }
        conn.remove_subflows_for_remote(address_id)
    };

    for id in ids {
        if let Err(e) = ops.close_path(token, id).await {
            tracing::warn!(token = format_args!("{:08x}", token), subflow = id, error = %e, "failed to close path");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopOps;

    #[async_trait]
    impl PathOps for NoopOps {
        async fn open_path(
            &self,
            _: u32,
            _: SubflowId,
            _: SocketAddr,
            _: SocketAddr,
            _: Bytes,
        ) -> std::io::Result<()> {
            Ok(())
        }

        async fn close_path(&self, _: u32, _: SubflowId) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let pm = PathManager::spawn(Arc::new(NoopOps), 4);
        assert!(pm.is_running());

        pm.shutdown().await;
        assert!(!pm.is_running());
        // second shutdown is a no-op
        pm.shutdown().await;
    }

    #[tokio::test]
    async fn test_dead_connection_is_ignored() {
        let pm = PathManager::spawn(Arc::new(NoopOps), 4);
        let addr = SocketAddr::from(([203, 0, 113, 1], 443));
        pm.sender()
            .send(PmCommand::AddAddr { conn: WeakConnection::dangling(1), address_id: 1, addr })
            .await
            .unwrap();
        pm.sender()
            .send(PmCommand::RemoveAddr { conn: WeakConnection::dangling(1), address_id: 1 })
            .await
            .unwrap();

        tokio::task::yield_now().await;
        assert!(pm.is_running());
        pm.shutdown().await;
    }
}
