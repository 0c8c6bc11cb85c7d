// Common test utilities for integration tests
#![allow(dead_code)]

pub mod path_ops;
pub mod peer;

pub use path_ops::{PathCall, RecordingPathOps};
pub use peer::{send, warm_up, FixedKey, Peer, ScriptedKeys};

use std::time::Duration;
use tokio::sync::mpsc;

/// Wait for the next recorded path operation
pub async fn next_call(
    rx: &mut mpsc::UnboundedReceiver<PathCall>,
    timeout: Duration,
) -> Option<PathCall> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

/// Let the path manager task run, then check nothing was recorded
pub async fn assert_no_call(rx: &mut mpsc::UnboundedReceiver<PathCall>) {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    if let Ok(call) = rx.try_recv() {
        panic!("unexpected path operation: {:?}", call);
    }
}

/// Install a test subscriber once; later calls are ignored
pub fn init_tracing() {
    mptcp_transport::logging::init_logging_with_filter("mptcp_transport=debug");
}
