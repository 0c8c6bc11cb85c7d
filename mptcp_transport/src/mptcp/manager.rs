//! MPTCP Manager

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

use mptcp_core::codec::parse_options;
use mptcp_core::crypto::{generate_nonce, KeyMaterial, KeySource, OsKeySource};
use mptcp_core::types::option::MpJoin;

use super::connection::{Connection, ConnectionHandle, Shared};
use super::events::{ConnectionEvents, TracingEvents};
use super::handshake::{check_capable_ack, check_join_ack, AcceptOutcome, RejectReason, SynDecision};
use super::path_manager::{PathManager, PathOps};
use super::request::{RequestKind, SubflowRequest};
use super::scheduler::{Scheduler, SchedulerError, SchedulerRegistry};
use super::{MptcpError, Result};
use crate::config::MptcpConfig;
use crate::metrics::Metrics;
use crate::negotiation::CapabilityNegotiator;
use crate::token::{TokenReservation, TokenTable};

/// Entry point of the stack: creates connections, answers SYNs and owns
/// the token table, scheduler registry and path manager.
pub struct MptcpManager {
    config: Arc<MptcpConfig>,
    negotiator: CapabilityNegotiator,
    tokens: Arc<TokenTable>,
    schedulers: Arc<SchedulerRegistry>,
    metrics: Arc<Metrics>,
    events: Arc<dyn ConnectionEvents>,
    path_manager: Option<PathManager>,
}

/// Builder for MptcpManager
pub struct MptcpManagerBuilder {
    config: MptcpConfig,
    key_source: Option<Arc<dyn KeySource>>,
    schedulers: Option<Arc<SchedulerRegistry>>,
    events: Option<Arc<dyn ConnectionEvents>>,
    path_ops: Option<Arc<dyn PathOps>>,
}

impl MptcpManagerBuilder {
    pub fn key_source(mut self, source: Arc<dyn KeySource>) -> Self {
        self.key_source = Some(source);
        self
    }

    pub fn schedulers(mut self, registry: Arc<SchedulerRegistry>) -> Self {
        self.schedulers = Some(registry);
        self
    }

    pub fn events(mut self, events: Arc<dyn ConnectionEvents>) -> Self {
        self.events = Some(events);
        self
    }

    /// Enable the path manager. `build` must then run inside a Tokio
    /// runtime.
    pub fn path_ops(mut self, ops: Arc<dyn PathOps>) -> Self {
        self.path_ops = Some(ops);
        self
    }

    pub fn build(self) -> Result<MptcpManager> {
        self.config.validate()?;

        let schedulers = self
            .schedulers
            .unwrap_or_else(|| Arc::new(SchedulerRegistry::with_defaults()));
        if schedulers.find(&self.config.scheduler).is_none() {
            return Err(SchedulerError::NotFound(self.config.scheduler.clone()).into());
        }

        let key_source = self.key_source.unwrap_or_else(|| Arc::new(OsKeySource));
        let tokens = Arc::new(TokenTable::new(key_source, self.config.token_retries));
        let path_manager = self
            .path_ops
            .map(|ops| PathManager::spawn(ops, self.config.pm_queue_depth));

        tracing::info!(
            enabled = self.config.enabled,
            scheduler = %self.config.scheduler,
            path_manager = path_manager.is_some(),
            "MPTCP manager ready"
        );

        Ok(MptcpManager {
            negotiator: CapabilityNegotiator::new(self.config.checksum_required),
            config: Arc::new(self.config),
            tokens,
            schedulers,
            metrics: Arc::new(Metrics::new()),
            events: self.events.unwrap_or_else(|| Arc::new(TracingEvents)),
            path_manager,
        })
    }
}

impl MptcpManager {
    pub fn new(config: MptcpConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: MptcpConfig) -> MptcpManagerBuilder {
        MptcpManagerBuilder {
            config,
            key_source: None,
            schedulers: None,
            events: None,
            path_ops: None,
        }
    }

    pub fn config(&self) -> &MptcpConfig {
        &self.config
    }

    pub fn tokens(&self) -> &TokenTable {
        &self.tokens
    }

    pub fn schedulers(&self) -> &SchedulerRegistry {
        &self.schedulers
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn shared(&self) -> Shared {
        Shared {
            config: Arc::clone(&self.config),
            negotiator: self.negotiator.clone(),
            tokens: Arc::clone(&self.tokens),
            metrics: Arc::clone(&self.metrics),
            events: Arc::clone(&self.events),
            pm_tx: self.path_manager.as_ref().map(PathManager::sender),
        }
    }

    fn default_scheduler(&self) -> Result<Arc<dyn Scheduler>> {
        self.schedulers
            .find(&self.config.scheduler)
            .ok_or_else(|| SchedulerError::NotFound(self.config.scheduler.clone()).into())
    }

    fn reserve_token(&self) -> Result<TokenReservation> {
        let before = self.tokens.collisions();
        let reservation = self.tokens.reserve();
        self.metrics
            .record_token_collisions(self.tokens.collisions().saturating_sub(before));
        Ok(reservation?)
    }

    /// Open a connection. Returns its handle and the options for the SYN.
    pub fn connect(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<(ConnectionHandle, Bytes)> {
        if !self.config.enabled {
            return Err(MptcpError::Disabled);
        }
        let scheduler = self.default_scheduler()?;
        let reservation = self.reserve_token()?;

        let conn = Connection::active(self.shared(), *reservation.keys(), scheduler, local, remote);
        let handle = ConnectionHandle::new(conn);
        reservation.bind(handle.downgrade())?;

        let syn = handle.lock().syn_options()?;
        self.metrics.record_connection_opened();
        tracing::debug!(token = format_args!("{:08x}", handle.token()), %remote, "connecting");
        Ok((handle, syn))
    }

    /// Classify an incoming SYN by its options
    pub fn on_syn(
        &self,
        options: &[u8],
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<SynDecision> {
        let parsed = parse_options(options);
        self.metrics.record_options_dropped(parsed.dropped);

        if let Some(join) = parsed.join() {
            return Ok(self.on_join_syn(join, local, remote));
        }

        let Some(cap) = parsed.capable() else {
            return Ok(SynDecision::Plain);
        };
        if !self.config.enabled || cap.receiver_key.is_some() {
            return Ok(SynDecision::Plain);
        }
        let Some(result) = self.negotiator.negotiate(cap) else {
            self.metrics.record_fallback();
            return Ok(SynDecision::Plain);
        };

        let reservation = self.reserve_token()?;
        Ok(SynDecision::Capable(SubflowRequest::capable(
            reservation,
            local,
            remote,
            cap.sender_key,
            result.version,
            result.use_checksum,
        )))
    }

    fn on_join_syn(&self, join: &MpJoin, local: SocketAddr, remote: SocketAddr) -> SynDecision {
        let &MpJoin::Syn { backup, address_id, token, nonce } = join else {
            return SynDecision::Reject(RejectReason::Malformed);
        };

        let handle = match self.tokens.lookup(token).filter(|_| self.config.enabled) {
            Some(handle) => handle,
            None => {
                tracing::debug!(token = format_args!("{:08x}", token), %remote, "MP_JOIN for unknown token");
                self.metrics.record_join_rejected();
                return SynDecision::Reject(RejectReason::UnknownToken);
            }
        };

        let conn = handle.lock();
        let reject = if conn.is_closed() {
            Some(RejectReason::Closed)
        } else if conn.is_fallback() || !conn.is_fully_established() {
            Some(RejectReason::NotFullyEstablished)
        } else if conn.subflow_count() + conn.pending_count() >= self.config.max_subflows {
            Some(RejectReason::LimitReached)
        } else {
            None
        };
        if let Some(reason) = reject {
            tracing::debug!(token = format_args!("{:08x}", token), ?reason, "MP_JOIN refused");
            self.metrics.record_join_rejected();
            return SynDecision::Reject(reason);
        }

        let keys = KeyMaterial {
            key: conn.local_key(),
            token: conn.token(),
            idsn: conn.idsn(),
        };
        SynDecision::Join(SubflowRequest::join(
            handle.downgrade(),
            &keys,
            conn.remote_key(),
            local,
            remote,
            conn.pm().local_id_for(local.ip()),
            address_id,
            backup,
            generate_nonce(),
            nonce,
            conn.use_checksum(),
        ))
    }

    /// Complete a server-side handshake with the options of the peer's ACK
    pub fn accept(&self, mut request: SubflowRequest, options: &[u8]) -> Result<AcceptOutcome> {
        let parsed = parse_options(options);
        self.metrics.record_options_dropped(parsed.dropped);

        match request.kind() {
            RequestKind::Capable => {
                let echoed = parsed.capable().map_or(false, |cap| {
                    check_capable_ack(cap, request.local_key, request.remote_key)
                });
                if !echoed {
                    tracing::debug!(remote = %request.remote_addr, "MP_CAPABLE not completed, falling back");
                    self.metrics.record_fallback();
                    return Ok(AcceptOutcome::Fallback);
                }

                let reservation = request
                    .take_reservation()
                    .ok_or(MptcpError::InvalidState {
                        id: 0,
                        state: request.state(),
                        expected: "reserved token",
                    })?;
                let scheduler = self.default_scheduler()?;
                let conn = Connection::passive(self.shared(), &request, scheduler);
                let handle = ConnectionHandle::new(conn);
                reservation.bind(handle.downgrade())?;

                self.metrics.record_connection_accepted();
                Ok(AcceptOutcome::Established(handle))
            }
            RequestKind::Join => {
                let verified = match parsed.join() {
                    Some(MpJoin::Ack { hmac }) => check_join_ack(
                        hmac,
                        request.local_key,
                        request.remote_key,
                        request.local_nonce,
                        request.remote_nonce,
                    ),
                    _ => false,
                };
                if !verified {
                    tracing::warn!(remote = %request.remote_addr, "MP_JOIN authentication failed");
                    self.metrics.record_join_rejected();
                    return Ok(AcceptOutcome::Rejected(RejectReason::AuthFailed));
                }

                let Some(handle) = request.connection.as_ref().and_then(|weak| weak.upgrade()) else {
                    return Ok(AcceptOutcome::Rejected(RejectReason::Closed));
                };
                let attached = handle.lock().attach_join(&request);
                match attached {
                    Ok((subflow, options)) => Ok(AcceptOutcome::Joined {
                        connection: handle,
                        subflow,
                        options,
                    }),
                    Err(MptcpError::Closed(_)) => Ok(AcceptOutcome::Rejected(RejectReason::Closed)),
                    Err(MptcpError::LimitReached(_)) => {
                        Ok(AcceptOutcome::Rejected(RejectReason::LimitReached))
                    }
                    Err(MptcpError::NotFullyEstablished) => {
                        Ok(AcceptOutcome::Rejected(RejectReason::NotFullyEstablished))
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    pub fn lookup(&self, token: u32) -> Option<ConnectionHandle> {
        self.tokens.lookup(token)
    }

    /// Rebind a connection to a registered policy
    pub fn set_scheduler(&self, handle: &ConnectionHandle, name: &str) -> Result<()> {
        let scheduler = self
            .schedulers
            .find(name)
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))?;
        handle.lock().set_scheduler(scheduler);
        Ok(())
    }

    /// Stop the path manager
    pub async fn shutdown(&self) {
        if let Some(path_manager) = &self.path_manager {
            path_manager.shutdown().await;
        }
        tracing::info!(live_tokens = self.tokens.len(), "MPTCP manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mptcp::connection::JoinOutcome;
    use crate::mptcp::subflow::SubflowState;

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], port))
    }

    /// Client and server managers with an established connection
    fn established() -> (MptcpManager, MptcpManager, ConnectionHandle, ConnectionHandle) {
        let client = MptcpManager::new(MptcpConfig::default()).unwrap();
        let server = MptcpManager::new(MptcpConfig::default()).unwrap();

        let (client_conn, syn) = client.connect(addr(1, 40000), addr(2, 80)).unwrap();
        let request = match server.on_syn(&syn, addr(2, 80), addr(1, 40000)).unwrap() {
            SynDecision::Capable(request) => request,
            other => panic!("unexpected {:?}", other),
        };
        let syn_ack = request.syn_ack_options().unwrap();
        let ack = client_conn.lock().on_syn_ack(&syn_ack).unwrap();
        let server_conn = match server.accept(request, &ack).unwrap() {
            AcceptOutcome::Established(handle) => handle,
            other => panic!("unexpected {:?}", other),
        };
        (client, server, client_conn, server_conn)
    }

    #[test]
    fn test_capable_handshake() {
        let (client, server, client_conn, server_conn) = established();

        let c = client_conn.lock();
        let s = server_conn.lock();
        assert_eq!(c.remote_key(), s.local_key());
        assert_eq!(s.remote_key(), c.local_key());
        assert_eq!(c.remote_token(), s.token());
        assert_eq!(c.write_seq(), s.ack_seq());
        assert_eq!(s.write_seq(), c.ack_seq());
        assert_eq!(c.subflow(0).unwrap().state(), SubflowState::Established);
        assert!(!c.is_fully_established());

        assert!(client.lookup(c.token()).is_some());
        assert!(server.lookup(s.token()).is_some());
        assert_eq!(server.metrics().snapshot().connections_accepted, 1);
    }

    #[test]
    fn test_unknown_join_token_rejected() {
        let (_client, server, client_conn, _server_conn) = established();
        let mut c = client_conn.lock();
        // not fully established yet, so open_join refuses
        assert!(matches!(
            c.open_join(None, addr(3, 80), 0, false),
            Err(MptcpError::NotFullyEstablished)
        ));

        let bogus = mptcp_core::encode_options(&[crate::mptcp::handshake::join_syn(false, 0, 0xdeadbeef, 1)]).unwrap();
        match server.on_syn(&bogus, addr(2, 80), addr(3, 5000)).unwrap() {
            SynDecision::Reject(RejectReason::UnknownToken) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(server.metrics().snapshot().joins_rejected, 1);
    }

    #[test]
    fn test_join_after_data() {
        let (_client, server, client_conn, server_conn) = established();

        let data = client_conn.lock().build_data_options(0, b"hello", false).unwrap();
        server_conn.lock().on_options(0, &data).unwrap();
        server_conn.lock().on_data(0, 1, b"hello").unwrap();
        assert!(server_conn.lock().is_fully_established());
        assert!(client_conn.lock().is_fully_established());

        let (id, syn) = client_conn.lock().open_join(Some(addr(3, 40001)), addr(2, 80), 0, true).unwrap();
        let request = match server.on_syn(&syn, addr(2, 80), addr(3, 40001)).unwrap() {
            SynDecision::Join(request) => request,
            other => panic!("unexpected {:?}", other),
        };
        let syn_ack = request.syn_ack_options().unwrap();
        let ack = match client_conn.lock().on_join_syn_ack(id, &syn_ack).unwrap() {
            JoinOutcome::Established { options } => options,
            JoinOutcome::Rejected => panic!("join rejected"),
        };
        let (server_id, fourth) = match server.accept(request, &ack).unwrap() {
            AcceptOutcome::Joined { subflow, options, connection } => {
                assert!(connection.ptr_eq(&server_conn));
                (subflow, options)
            }
            other => panic!("unexpected {:?}", other),
        };

        client_conn.lock().on_options(id, &fourth).unwrap();
        let c = client_conn.lock();
        assert_eq!(c.subflow_count(), 2);
        assert!(c.subflow(id).unwrap().is_fully_established());
        assert!(c.subflow(id).unwrap().flags.backup);
        assert_eq!(server_conn.lock().subflow(server_id).unwrap().state(), SubflowState::Established);
    }

    #[test]
    fn test_disabled_stack() {
        let config = MptcpConfig::builder().enabled(false).build();
        let manager = MptcpManager::new(config).unwrap();
        assert!(matches!(
            manager.connect(addr(1, 1), addr(2, 2)),
            Err(MptcpError::Disabled)
        ));

        let other = MptcpManager::new(MptcpConfig::default()).unwrap();
        let (_conn, syn) = other.connect(addr(1, 1), addr(2, 2)).unwrap();
        assert!(matches!(
            manager.on_syn(&syn, addr(2, 2), addr(1, 1)).unwrap(),
            SynDecision::Plain
        ));
    }

    #[test]
    fn test_unknown_scheduler_rejected() {
        let config = MptcpConfig::builder().scheduler("missing").build();
        assert!(matches!(
            MptcpManager::new(config),
            Err(MptcpError::Scheduler(SchedulerError::NotFound(_)))
        ));
    }
}
