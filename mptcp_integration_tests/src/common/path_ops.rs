use async_trait::async_trait;
use bytes::Bytes;
use mptcp_transport::{PathOps, SubflowId};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathCall {
    Open {
        token: u32,
        subflow: SubflowId,
        local: SocketAddr,
        remote: SocketAddr,
        syn: Bytes,
    },
    Close {
        token: u32,
        subflow: SubflowId,
    },
}

/// Path operations that record every call instead of touching sockets
pub struct RecordingPathOps {
    tx: mpsc::UnboundedSender<PathCall>,
    /// When set, `open_path` blocks until notified
    gate: Option<Arc<Notify>>,
    fail_open: bool,
}

impl RecordingPathOps {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PathCall>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx, gate: None, fail_open: false }), rx)
    }

    /// Opens stall until the returned `Notify` fires
    pub fn gated() -> (Arc<Self>, mpsc::UnboundedReceiver<PathCall>, Arc<Notify>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Notify::new());
        let ops = Self {
            tx,
            gate: Some(Arc::clone(&gate)),
            fail_open: false,
        };
        (Arc::new(ops), rx, gate)
    }

    /// Every open fails with `ConnectionRefused`
    pub fn failing() -> (Arc<Self>, mpsc::UnboundedReceiver<PathCall>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx, gate: None, fail_open: true }), rx)
    }
}

#[async_trait]
impl PathOps for RecordingPathOps {
    async fn open_path(
        &self,
        token: u32,
        subflow: SubflowId,
        local: SocketAddr,
        remote: SocketAddr,
        syn_options: Bytes,
    ) -> io::Result<()> {
        let _ = self.tx.send(PathCall::Open {
            token,
            subflow,
            local,
            remote,
            syn: syn_options,
        });
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail_open {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "path refused"));
        }
        Ok(())
    }

    async fn close_path(&self, token: u32, subflow: SubflowId) -> io::Result<()> {
        let _ = self.tx.send(PathCall::Close { token, subflow });
        Ok(())
    }
}
