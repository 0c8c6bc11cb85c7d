use std::net::SocketAddr;

use super::subflow::SubflowId;

/// Lifecycle notifications.
///
/// Invoked with the connection lock held; implementations must not call
/// back into the connection.
pub trait ConnectionEvents: Send + Sync {
    fn connection_established(&self, _token: u32) {}

    fn connection_closed(&self, _token: u32) {}

    fn fallback(&self, _token: u32) {}

    fn subflow_established(&self, _token: u32, _subflow: SubflowId, _remote: SocketAddr) {}

    fn subflow_closed(&self, _token: u32, _subflow: SubflowId) {}

    fn address_announced(&self, _token: u32, _address_id: u8, _addr: SocketAddr) {}

    fn address_removed(&self, _token: u32, _address_id: u8) {}
}

/// Default sink that writes every event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEvents;

impl ConnectionEvents for TracingEvents {
    fn connection_established(&self, token: u32) {
        tracing::info!(token = format_args!("{:08x}", token), "connection established");
    }

    fn connection_closed(&self, token: u32) {
        tracing::info!(token = format_args!("{:08x}", token), "connection closed");
    }

    fn fallback(&self, token: u32) {
        tracing::info!(token = format_args!("{:08x}", token), "fell back to plain TCP");
    }

    fn subflow_established(&self, token: u32, subflow: SubflowId, remote: SocketAddr) {
        tracing::info!(token = format_args!("{:08x}", token), subflow, %remote, "subflow established");
    }

    fn subflow_closed(&self, token: u32, subflow: SubflowId) {
        tracing::debug!(token = format_args!("{:08x}", token), subflow, "subflow closed");
    }

    fn address_announced(&self, token: u32, address_id: u8, addr: SocketAddr) {
        tracing::debug!(token = format_args!("{:08x}", token), address_id, %addr, "peer announced address");
    }

    fn address_removed(&self, token: u32, address_id: u8) {
        tracing::debug!(token = format_args!("{:08x}", token), address_id, "peer removed address");
    }
}
