//! Multipath TCP connection engine: handshakes, subflow bookkeeping,
//! data-sequence mapping per subflow, pluggable schedulers and an
//! asynchronous path manager. Segments never pass through this crate;
//! callers feed in option bytes and get option bytes back.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod mptcp;
pub mod negotiation;
pub mod token;

pub use config::{ConfigError, MptcpConfig, MptcpConfigBuilder};
pub use metrics::{Metrics, MetricsSnapshot};
pub use mptcp::{
    AcceptOutcome, Connection, ConnectionEvents, ConnectionHandle, InboundOutcome, JoinOutcome, MptcpError,
    MptcpManager, PathOps, Scheduler, SchedulerContext, SchedulerOps, SchedulerRegistry, SubflowId, SubflowState,
    SynDecision,
};
pub use token::{TokenError, TokenTable};
