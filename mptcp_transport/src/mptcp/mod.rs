//! Multi-path TCP connection engine
//!
//! Connection and subflow state, the handshake, scheduling and path
//! management. Byte transport is left to the caller: every entry point
//! takes raw option bytes in and hands option bytes back.

pub mod connection;
pub mod events;
pub mod handshake;
pub mod manager;
pub mod path_manager;
pub mod registry;
pub mod request;
pub mod scheduler;
pub mod subflow;

pub use connection::{Connection, ConnectionHandle, InboundOutcome, JoinOutcome};
pub use events::{ConnectionEvents, TracingEvents};
pub use handshake::{AcceptOutcome, SynDecision};
pub use manager::{MptcpManager, MptcpManagerBuilder};
pub use path_manager::{PathManager, PathOps};
pub use registry::SubflowRegistry;
pub use request::SubflowRequest;
pub use scheduler::{Scheduler, SchedulerContext, SchedulerOps, SchedulerRegistry};
pub use subflow::{Subflow, SubflowId, SubflowState};

use crate::config::ConfigError;
use crate::token::TokenError;
use mptcp_core::codec::OptionError;
use mptcp_core::mapping::MappingError;
use scheduler::SchedulerError;

#[derive(Debug, thiserror::Error)]
pub enum MptcpError {
    #[error("MPTCP is disabled")]
    Disabled,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Codec(#[from] OptionError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("unknown subflow {0}")]
    UnknownSubflow(SubflowId),

    #[error("subflow {id} is {state:?}, expected {expected}")]
    InvalidState {
        id: SubflowId,
        state: SubflowState,
        expected: &'static str,
    },

    #[error("connection {0:08x} is closed")]
    Closed(u32),

    #[error("connection is not fully established")]
    NotFullyEstablished,

    #[error("subflow limit of {0} reached")]
    LimitReached(usize),
}

pub type Result<T> = std::result::Result<T, MptcpError>;
