//! Loopback harness for driving two MPTCP endpoints against each other
//! without sockets: option bytes produced by one manager are handed
//! straight to the other.

pub mod common;
