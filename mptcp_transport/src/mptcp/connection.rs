//! Connection-level state.
//!
//! A [`Connection`] owns the data sequence space, the subflow registry,
//! path-manager bookkeeping and the bound scheduler. It is shared as a
//! [`ConnectionHandle`] and every operation runs under its lock.

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

use mptcp_core::codec::{encode_options, parse_options};
use mptcp_core::crypto::{derive, KeyMaterial};
use mptcp_core::mapping::{seq_after, seq_max, MappedData, MappingError};
use mptcp_core::types::option::{
    AddAddr, DataAck, Dss, MpFail, MpFastclose, MpJoin, MpPrio, MptcpOption, RemoveAddr,
};

use super::events::ConnectionEvents;
use super::handshake::{capable_ack, capable_syn, check_join_syn_ack, join_ack, join_syn};
use super::path_manager::PmCommand;
use super::registry::SubflowRegistry;
use super::request::SubflowRequest;
use super::scheduler::{Scheduler, SchedulerContext, SchedulerState, SubflowView};
use super::subflow::{Subflow, SubflowId, SubflowState};
use super::{MptcpError, Result};
use crate::config::MptcpConfig;
use crate::metrics::Metrics;
use crate::negotiation::CapabilityNegotiator;
use crate::token::TokenTable;

/// Manager-wide collaborators every connection needs
#[derive(Clone)]
pub(crate) struct Shared {
    pub config: Arc<MptcpConfig>,
    pub negotiator: CapabilityNegotiator,
    pub tokens: Arc<TokenTable>,
    pub metrics: Arc<Metrics>,
    pub events: Arc<dyn ConnectionEvents>,
    pub pm_tx: Option<mpsc::Sender<PmCommand>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionFlags {
    /// A DSS has been exchanged; joins and scheduling are allowed
    pub fully_established: bool,
    /// Running as plain TCP or on an infinite mapping
    pub fallback: bool,
    pub closed: bool,
    pub data_fin_sent: bool,
    pub data_fin_received: bool,
}

/// Address bookkeeping for the path manager
#[derive(Debug, Default)]
pub struct PmState {
    /// Addresses we announced, by address id
    pub local_addrs: BTreeMap<u8, SocketAddr>,
    /// Addresses the peer announced
    pub remote_addrs: BTreeMap<u8, SocketAddr>,
    /// Announcements received before the connection was fully established
    parked: Vec<(u8, SocketAddr)>,
    next_local_id: u8,
}

impl PmState {
    pub(crate) fn local_id_for(&self, ip: IpAddr) -> u8 {
        self.local_addrs
            .iter()
            .find(|(_, addr)| addr.ip() == ip)
            .map(|(&id, _)| id)
            .unwrap_or(0)
    }

    pub fn parked(&self) -> &[(u8, SocketAddr)] {
        &self.parked
    }
}

/// What an incoming option list changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundOutcome {
    /// New cumulative data ack, when it advanced
    pub data_acked: Option<u64>,
    /// Data sequence number of a newly installed mapping
    pub mapping: Option<u64>,
    pub data_fin: bool,
    /// The connection switched to fallback
    pub fallback: bool,
    /// The subflow was closed because of MP_FAIL
    pub subflow_closed: bool,
    /// The peer fast-closed the connection
    pub closed: bool,
}

/// Result of the client side of an MP_JOIN
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Send `options` on the third ACK
    Established { options: Bytes },
    Rejected,
}

pub struct Connection {
    token: u32,
    local_key: u64,
    remote_key: u64,
    remote_token: u32,
    idsn: u64,
    remote_idsn: u64,
    version: u8,
    use_checksum: bool,

    write_seq: u64,
    snd_una: u64,
    ack_seq: u64,
    out_of_order: BTreeMap<u64, u64>,

    registry: SubflowRegistry,
    pending: HashMap<SubflowId, Subflow>,
    next_subflow_id: SubflowId,
    first: Option<SubflowId>,
    last_snd: Option<SubflowId>,

    pm: PmState,
    flags: ConnectionFlags,

    scheduler: Arc<dyn Scheduler>,
    sched_state: Option<SchedulerState>,

    self_ref: Option<WeakConnection>,
    shared: Shared,
}

impl Connection {
    /// Outgoing connection; the initial subflow waits in `Init`
    pub(crate) fn active(
        shared: Shared,
        keys: KeyMaterial,
        scheduler: Arc<dyn Scheduler>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Self {
        let request_checksum = shared.config.checksum_required;
        let mut conn = Self::new(shared, keys, scheduler);
        let subflow = Subflow::initial(0, local_addr, remote_addr, &keys, request_checksum);
        conn.pending.insert(0, subflow);
        conn.next_subflow_id = 1;
        conn
    }

    /// Incoming connection completed by the third ACK
    pub(crate) fn passive(
        shared: Shared,
        request: &SubflowRequest,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let keys = KeyMaterial {
            key: request.local_key,
            token: request.token,
            idsn: request.idsn,
        };
        let mut conn = Self::new(shared, keys, scheduler);
        let subflow = request.to_subflow(0);
        conn.next_subflow_id = 1;
        conn.establish(subflow, request.remote_key, request.version, request.use_checksum);
        conn
    }

    fn new(shared: Shared, keys: KeyMaterial, scheduler: Arc<dyn Scheduler>) -> Self {
        let mut conn = Self {
            token: keys.token,
            local_key: keys.key,
            remote_key: 0,
            remote_token: 0,
            idsn: keys.idsn,
            remote_idsn: 0,
            version: shared.negotiator.local_version(),
            use_checksum: shared.config.checksum_required,
            write_seq: keys.idsn.wrapping_add(1),
            snd_una: keys.idsn.wrapping_add(1),
            ack_seq: 0,
            out_of_order: BTreeMap::new(),
            registry: SubflowRegistry::new(),
            pending: HashMap::new(),
            next_subflow_id: 0,
            first: None,
            last_snd: None,
            pm: PmState {
                next_local_id: 1,
                ..Default::default()
            },
            flags: ConnectionFlags::default(),
            scheduler,
            sched_state: None,
            self_ref: None,
            shared,
        };
        conn.init_scheduler();
        conn
    }

    // Accessors

    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn local_key(&self) -> u64 {
        self.local_key
    }

    pub fn remote_key(&self) -> u64 {
        self.remote_key
    }

    /// Token the peer expects in our MP_JOIN SYNs
    pub fn remote_token(&self) -> u32 {
        self.remote_token
    }

    pub fn idsn(&self) -> u64 {
        self.idsn
    }

    pub fn remote_idsn(&self) -> u64 {
        self.remote_idsn
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn use_checksum(&self) -> bool {
        self.use_checksum
    }

    /// Next data sequence number to send
    pub fn write_seq(&self) -> u64 {
        self.write_seq
    }

    /// Oldest unacknowledged data sequence number
    pub fn snd_una(&self) -> u64 {
        self.snd_una
    }

    /// Next data sequence number expected from the peer
    pub fn ack_seq(&self) -> u64 {
        self.ack_seq
    }

    pub fn flags(&self) -> ConnectionFlags {
        self.flags
    }

    pub fn is_fully_established(&self) -> bool {
        self.flags.fully_established
    }

    pub fn is_fallback(&self) -> bool {
        self.flags.fallback
    }

    pub fn is_closed(&self) -> bool {
        self.flags.closed
    }

    pub fn subflow(&self, id: SubflowId) -> Option<&Subflow> {
        self.registry.get(id).or_else(|| self.pending.get(&id))
    }

    /// Established subflows in registry order
    pub fn subflows(&self) -> impl Iterator<Item = &Subflow> {
        self.registry.iter()
    }

    pub fn subflow_count(&self) -> usize {
        self.registry.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn first(&self) -> Option<SubflowId> {
        self.first
    }

    pub fn last_used(&self) -> Option<SubflowId> {
        self.last_snd
    }

    pub fn pm(&self) -> &PmState {
        &self.pm
    }

    pub fn scheduler_name(&self) -> &str {
        self.scheduler.name()
    }

    // Client handshake

    /// Options for the SYN of the initial subflow
    pub fn syn_options(&mut self) -> Result<Bytes> {
        let subflow = self.pending.get_mut(&0).ok_or(MptcpError::UnknownSubflow(0))?;
        if subflow.state() != SubflowState::Init {
            return Err(MptcpError::InvalidState {
                id: 0,
                state: subflow.state(),
                expected: "Init",
            });
        }
        subflow.set_state(SubflowState::CapableSent);
        Ok(encode_options(&[capable_syn(&self.shared.negotiator, self.local_key)])?)
    }

    /// Process the SYN-ACK of the initial subflow and return the options
    /// for the third ACK. An empty result means the connection fell back.
    pub fn on_syn_ack(&mut self, options: &[u8]) -> Result<Bytes> {
        let state = self.pending.get(&0).map(Subflow::state);
        if state != Some(SubflowState::CapableSent) {
            return Err(match state {
                Some(state) => MptcpError::InvalidState { id: 0, state, expected: "CapableSent" },
                None => MptcpError::UnknownSubflow(0),
            });
        }

        let parsed = parse_options(options);
        self.shared.metrics.record_options_dropped(parsed.dropped);

        let negotiated = parsed
            .capable()
            .filter(|cap| cap.receiver_key.is_none())
            .and_then(|cap| self.shared.negotiator.negotiate(cap).map(|result| (cap.sender_key, result)));

        let subflow = match self.pending.remove(&0) {
            Some(subflow) => subflow,
            None => return Err(MptcpError::UnknownSubflow(0)),
        };

        match negotiated {
            Some((remote_key, result)) => {
                self.establish(subflow, remote_key, result.version, result.use_checksum);
                let ack = capable_ack(self.version, self.use_checksum, self.local_key, self.remote_key);
                if let Some(subflow) = self.registry.get_mut(0) {
                    subflow.flags.fourth_ack = true;
                }
                Ok(encode_options(&[ack])?)
            }
            None => {
                self.fall_back_plain(subflow);
                Ok(Bytes::new())
            }
        }
    }

    fn establish(
        &mut self,
        mut subflow: Subflow,
        remote_key: u64,
        version: u8,
        use_checksum: bool,
    ) {
        let (remote_token, remote_idsn) = derive(remote_key);
        self.remote_key = remote_key;
        self.remote_token = remote_token;
        self.remote_idsn = remote_idsn;
        self.version = version;
        self.use_checksum = use_checksum;
        self.ack_seq = remote_idsn.wrapping_add(1);

        subflow.remote_key = remote_key;
        subflow.remote_idsn = remote_idsn;
        subflow.flags.mp_capable = true;
        subflow.synchronize(self.write_seq, self.ack_seq, use_checksum, true);
        subflow.set_state(SubflowState::Established);

        let id = subflow.id;
        let remote = subflow.remote_addr;
        self.registry.push(subflow);
        self.first = Some(id);

        tracing::debug!(
            token = format_args!("{:08x}", self.token),
            remote_token = format_args!("{:08x}", remote_token),
            use_checksum,
            "MP_CAPABLE negotiated"
        );
        self.shared.events.subflow_established(self.token, id, remote);
        self.shared.events.connection_established(self.token);
    }

    fn fall_back_plain(&mut self, mut subflow: Subflow) {
        subflow.flags.mp_capable = false;
        subflow.flags.fully_established = true;
        subflow.set_state(SubflowState::Fallback);

        let id = subflow.id;
        self.registry.push(subflow);
        self.first = Some(id);
        self.flags.fallback = true;

        // nothing can join a plain connection
        self.release_token();
        self.shared.metrics.record_fallback();
        self.shared.events.fallback(self.token);
    }

    // Joins

    /// Start an additional subflow towards `remote`. Returns its id and the
    /// options for its SYN.
    pub fn open_join(
        &mut self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        remote_id: u8,
        backup: bool,
    ) -> Result<(SubflowId, Bytes)> {
        self.check_join_allowed()?;

        let local = local.unwrap_or_else(|| {
            let ip = self
                .first
                .and_then(|id| self.registry.get(id))
                .map(|s| s.local_addr.ip())
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            SocketAddr::new(ip, 0)
        });
        let local_id = self.pm.local_id_for(local.ip());

        let id = self.allocate_subflow_id();
        let keys = KeyMaterial {
            key: self.local_key,
            token: self.token,
            idsn: self.idsn,
        };
        let mut subflow = Subflow::join(id, local, remote, &keys, self.remote_key, local_id, backup);
        subflow.remote_id = remote_id;
        subflow.remote_idsn = self.remote_idsn;
        subflow.set_state(SubflowState::JoinSent);

        let syn = join_syn(backup, local_id, self.remote_token, subflow.local_nonce);
        let options = encode_options(&[syn])?;
        self.pending.insert(id, subflow);

        tracing::debug!(token = format_args!("{:08x}", self.token), subflow = id, %remote, "MP_JOIN sent");
        Ok((id, options))
    }

    /// Process the SYN-ACK of a join started with [`Self::open_join`]
    pub fn on_join_syn_ack(&mut self, id: SubflowId, options: &[u8]) -> Result<JoinOutcome> {
        if self.flags.closed {
            return Err(MptcpError::Closed(self.token));
        }
        let mut subflow = self.pending.remove(&id).ok_or(MptcpError::UnknownSubflow(id))?;
        if subflow.state() != SubflowState::JoinSent {
            let state = subflow.state();
            self.pending.insert(id, subflow);
            return Err(MptcpError::InvalidState { id, state, expected: "JoinSent" });
        }

        let parsed = parse_options(options);
        self.shared.metrics.record_options_dropped(parsed.dropped);

        let verified = match parsed.join() {
            Some(&MpJoin::SynAck { address_id, truncated_hmac, nonce, .. }) => {
                subflow.remote_id = address_id;
                subflow.remote_nonce = nonce;
                check_join_syn_ack(truncated_hmac, self.local_key, self.remote_key, subflow.local_nonce, nonce)
            }
            _ => false,
        };

        if !verified {
            tracing::warn!(token = format_args!("{:08x}", self.token), subflow = id, "MP_JOIN SYN-ACK rejected");
            subflow.set_state(SubflowState::Closed);
            self.shared.metrics.record_join_rejected();
            self.shared.events.subflow_closed(self.token, id);
            return Ok(JoinOutcome::Rejected);
        }

        subflow.set_state(SubflowState::Authenticated);
        let ack = join_ack(self.local_key, self.remote_key, subflow.local_nonce, subflow.remote_nonce);
        let options = encode_options(&[ack])?;

        subflow.synchronize(self.write_seq, self.ack_seq, self.use_checksum, false);
        subflow.flags.fourth_ack = true;
        subflow.set_state(SubflowState::Established);
        let remote = subflow.remote_addr;
        self.registry.push(subflow);

        self.shared.metrics.record_join_established();
        self.shared.events.subflow_established(self.token, id, remote);
        Ok(JoinOutcome::Established { options })
    }

    /// Forget a join whose path could not be opened
    pub fn abort_join(&mut self, id: SubflowId) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Server side: add a verified join and return the options for the
    /// fourth ACK
    pub(crate) fn attach_join(&mut self, request: &SubflowRequest) -> Result<(SubflowId, Bytes)> {
        self.check_join_allowed()?;

        let id = self.allocate_subflow_id();
        let mut subflow = request.to_subflow(id);
        subflow.remote_idsn = self.remote_idsn;
        subflow.local_id = self.pm.local_id_for(request.local_addr.ip());
        subflow.synchronize(self.write_seq, self.ack_seq, self.use_checksum, false);
        subflow.set_state(SubflowState::Established);
        subflow.mark_fully_established();

        let dss = Dss {
            data_ack: Some(subflow.data_ack(self.ack_seq)),
            mapping: None,
            data_fin: false,
        };
        let options = encode_options(&[MptcpOption::Dss(dss)])?;

        let remote = subflow.remote_addr;
        self.registry.push(subflow);
        self.shared.metrics.record_join_established();
        self.shared.events.subflow_established(self.token, id, remote);
        Ok((id, options))
    }

    fn check_join_allowed(&self) -> Result<()> {
        if self.flags.closed {
            return Err(MptcpError::Closed(self.token));
        }
        if self.flags.fallback || !self.flags.fully_established {
            return Err(MptcpError::NotFullyEstablished);
        }
        let max = self.shared.config.max_subflows;
        if self.registry.len() + self.pending.len() >= max {
            return Err(MptcpError::LimitReached(max));
        }
        Ok(())
    }

    fn allocate_subflow_id(&mut self) -> SubflowId {
        let id = self.next_subflow_id;
        self.next_subflow_id = self.next_subflow_id.wrapping_add(1);
        id
    }

    // Data path

    /// Options to attach to a segment carrying `payload` on `id`.
    /// The payload is assigned the next data sequence numbers.
    pub fn build_data_options(
        &mut self,
        id: SubflowId,
        payload: &[u8],
        data_fin: bool,
    ) -> Result<Bytes> {
        if self.flags.closed {
            return Err(MptcpError::Closed(self.token));
        }
        let fallback = self.flags.fallback;
        let write_seq = self.write_seq;
        let ack_seq = self.ack_seq;

        let subflow = self.registry.get_mut(id).ok_or(MptcpError::UnknownSubflow(id))?;
        if !subflow.is_established() {
            return Err(MptcpError::InvalidState {
                id,
                state: subflow.state(),
                expected: "Established",
            });
        }

        if fallback {
            self.write_seq = write_seq.wrapping_add(payload.len() as u64);
            return Ok(Bytes::new());
        }

        let data_ack = Some(subflow.data_ack(ack_seq));
        let mapping = if !payload.is_empty() || data_fin {
            Some(subflow.next_mapping(write_seq, payload, data_fin)?)
        } else {
            None
        };

        let mut options = vec![MptcpOption::Dss(Dss {
            data_ack,
            mapping,
            data_fin: data_fin && mapping.is_some(),
        })];
        if let Some(data_seq) = subflow.fail_seq.take() {
            options.push(MptcpOption::MpFail(MpFail { data_seq }));
        }
        let encoded = encode_options(&options)?;
        let newly_ready = subflow.mark_fully_established();

        if mapping.is_some() {
            self.write_seq = write_seq.wrapping_add(payload.len() as u64 + data_fin as u64);
            self.shared.metrics.record_mapping_sent(payload.len());
        }
        if data_fin {
            self.flags.data_fin_sent = true;
        }
        if newly_ready {
            self.on_fully_established();
        }
        Ok(encoded)
    }

    /// Handle the MPTCP options of a segment received on an established
    /// subflow
    pub fn on_options(&mut self, id: SubflowId, options: &[u8]) -> Result<InboundOutcome> {
        if self.flags.closed {
            return Err(MptcpError::Closed(self.token));
        }
        if !self.registry.contains(id) {
            return Err(MptcpError::UnknownSubflow(id));
        }

        let parsed = parse_options(options);
        self.shared.metrics.record_options_dropped(parsed.dropped);

        let mut outcome = InboundOutcome::default();
        for option in parsed.options {
            match option {
                MptcpOption::Dss(dss) => self.handle_dss(id, &dss, &mut outcome)?,
                MptcpOption::AddAddr(add) => self.handle_add_addr(id, &add),
                MptcpOption::RemoveAddr(remove) => self.handle_remove_addr(&remove),
                MptcpOption::MpPrio(prio) => self.handle_prio(id, &prio),
                MptcpOption::MpFail(fail) => self.handle_fail(id, &fail, &mut outcome),
                MptcpOption::MpFastclose(fastclose) => {
                    if self.handle_fastclose(&fastclose) {
                        outcome.closed = true;
                        break;
                    }
                }
                MptcpOption::MpCapable(_) | MptcpOption::MpJoin(_) => {
                    tracing::trace!(subflow = id, "handshake option on established subflow ignored");
                }
            }
            if outcome.subflow_closed {
                break;
            }
        }
        Ok(outcome)
    }

    fn handle_dss(&mut self, id: SubflowId, dss: &Dss, outcome: &mut InboundOutcome) -> Result<()> {
        let ack_seq = self.ack_seq;
        let Some(subflow) = self.registry.get_mut(id) else {
            return Err(MptcpError::UnknownSubflow(id));
        };
        let newly_ready = subflow.mark_fully_established();

        if let Some(mapping) = &dss.mapping {
            if !self.flags.fallback {
                match subflow.install_mapping(mapping, dss.data_fin) {
                    Ok(data_seq) => {
                        outcome.mapping = Some(data_seq);
                        self.shared.metrics.record_mapping_received();
                    }
                    Err(MappingError::MissingChecksum) => {
                        tracing::warn!(subflow = id, "mapping without required checksum");
                        self.shared.metrics.record_checksum_failure();
                        subflow.fail_seq = Some(ack_seq);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        if newly_ready {
            self.on_fully_established();
        }

        if let Some(ack) = &dss.data_ack {
            self.handle_dss_ack(ack, outcome);
        }

        if self.check_data_fin(id) {
            outcome.data_fin = true;
        }
        Ok(())
    }

    /// DATA_ACK moves `snd_una` forward, never past `write_seq`
    fn handle_dss_ack(&mut self, ack: &DataAck, outcome: &mut InboundOutcome) {
        let acked = ack.expand(self.snd_una);
        if seq_after(acked, self.write_seq) {
            tracing::debug!(acked, write_seq = self.write_seq, "data ack beyond sent data ignored");
        } else if seq_after(acked, self.snd_una) {
            self.snd_una = acked;
            outcome.data_acked = Some(acked);
        }
    }

    fn handle_add_addr(&mut self, id: SubflowId, add: &AddAddr) {
        if self.pm.remote_addrs.len() >= self.shared.config.max_add_addr_accepted
            && !self.pm.remote_addrs.contains_key(&add.address_id)
        {
            tracing::debug!(address_id = add.address_id, "ADD_ADDR over limit ignored");
            return;
        }

        let port = add
            .port
            .or_else(|| self.registry.get(id).map(|s| s.remote_addr.port()))
            .unwrap_or(0);
        let addr = SocketAddr::new(add.addr, port);
        self.pm.remote_addrs.insert(add.address_id, addr);
        self.shared.metrics.record_address_received();
        self.shared.events.address_announced(self.token, add.address_id, addr);

        if self.flags.fully_established {
            self.queue_pm(|conn| PmCommand::AddAddr { conn, address_id: add.address_id, addr });
        } else {
            self.pm.parked.push((add.address_id, addr));
        }
    }

    fn handle_remove_addr(&mut self, remove: &RemoveAddr) {
        for &address_id in &remove.address_ids {
            if self.pm.remote_addrs.remove(&address_id).is_none() {
                continue;
            }
            self.pm.parked.retain(|(id, _)| *id != address_id);
            self.shared.events.address_removed(self.token, address_id);
            self.queue_pm(|conn| PmCommand::RemoveAddr { conn, address_id });
        }
    }

    fn handle_prio(&mut self, id: SubflowId, prio: &MpPrio) {
        match prio.address_id {
            Some(address_id) => {
                for subflow in self.registry.iter_mut().filter(|s| s.remote_id == address_id) {
                    subflow.flags.backup = prio.backup;
                }
            }
            None => {
                if let Some(subflow) = self.registry.get_mut(id) {
                    subflow.flags.backup = prio.backup;
                }
            }
        }
    }

    fn handle_fail(&mut self, id: SubflowId, fail: &MpFail, outcome: &mut InboundOutcome) {
        tracing::warn!(subflow = id, data_seq = fail.data_seq, "MP_FAIL received");
        if self.registry.len() == 1 {
            // last path: continue on an infinite mapping
            if !self.flags.fallback {
                self.flags.fallback = true;
                outcome.fallback = true;
                self.shared.metrics.record_fallback();
                self.shared.events.fallback(self.token);
            }
        } else {
            self.remove_subflow(id);
            outcome.subflow_closed = true;
        }
    }

    fn handle_fastclose(&mut self, fastclose: &MpFastclose) -> bool {
        if fastclose.receiver_key != self.local_key {
            tracing::debug!("MP_FASTCLOSE with wrong key ignored");
            return false;
        }
        self.close();
        true
    }

    /// Account subflow payload against the connection-level sequence space
    pub fn on_data(
        &mut self,
        id: SubflowId,
        subflow_seq: u32,
        payload: &[u8],
    ) -> Result<MappedData> {
        if self.flags.closed {
            return Err(MptcpError::Closed(self.token));
        }
        let fallback = self.flags.fallback;
        let ack_seq = self.ack_seq;

        let subflow = self.registry.get_mut(id).ok_or(MptcpError::UnknownSubflow(id))?;

        if fallback || subflow.state() == SubflowState::Fallback {
            let mapped = MappedData {
                data_seq: ack_seq,
                len: payload.len(),
                mapping_complete: false,
            };
            self.advance_ack(mapped.data_seq, mapped.len);
            return Ok(mapped);
        }

        let mapped = match subflow.consume(subflow_seq, payload) {
            Ok(mapped) => mapped,
            Err(e @ MappingError::ChecksumMismatch { .. }) => {
                tracing::warn!(subflow = id, error = %e, "DSS checksum failed");
                subflow.fail_seq = Some(subflow.map_seq());
                self.shared.metrics.record_checksum_failure();
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        self.advance_ack(mapped.data_seq, mapped.len);
        if mapped.mapping_complete {
            self.check_data_fin(id);
        }
        Ok(mapped)
    }

    fn advance_ack(&mut self, start: u64, len: usize) {
        let end = start.wrapping_add(len as u64);
        if !seq_after(start, self.ack_seq) {
            self.ack_seq = seq_max(self.ack_seq, end);
        } else {
            let entry = self.out_of_order.entry(start).or_insert(end);
            *entry = seq_max(*entry, end);
        }

        // keys are absolute, so after a wrap the next range need not be first
        while let Some((start, end)) = self
            .out_of_order
            .iter()
            .find(|(&start, _)| !seq_after(start, self.ack_seq))
            .map(|(&start, &end)| (start, end))
        {
            self.out_of_order.remove(&start);
            self.ack_seq = seq_max(self.ack_seq, end);
        }
    }

    /// Consume a DATA_FIN once everything before it has arrived
    fn check_data_fin(&mut self, id: SubflowId) -> bool {
        if self.flags.data_fin_received {
            return false;
        }
        let ack_seq = self.ack_seq;
        let Some(subflow) = self.registry.get_mut(id) else {
            return false;
        };
        if subflow.data_fin_seq() != Some(ack_seq) {
            return false;
        }
        subflow.flags.conn_finished = true;
        self.ack_seq = ack_seq.wrapping_add(1);
        self.flags.data_fin_received = true;
        tracing::debug!(token = format_args!("{:08x}", self.token), data_seq = ack_seq, "DATA_FIN received");
        true
    }

    // Scheduling

    /// Pick the subflow for the next transmission. `None` defers until the
    /// subflow set changes.
    pub fn select_subflow(&mut self, retransmission: bool) -> Option<SubflowId> {
        if self.flags.closed {
            return None;
        }
        if !self.flags.fully_established || self.flags.fallback {
            return self
                .first
                .filter(|&id| self.registry.get(id).map_or(false, Subflow::is_established));
        }

        let views: Vec<SubflowView> = self.registry.iter().map(Subflow::view).collect();
        let scheduler = Arc::clone(&self.scheduler);
        let mut ctx = SchedulerContext::new(
            self.token,
            &views,
            self.first,
            self.last_snd,
            self.sched_state.as_mut(),
        );
        let chosen = scheduler.select(&mut ctx, retransmission);
        self.last_snd = ctx.last_used();

        let chosen = match chosen {
            Some(id) if views.iter().any(|v| v.id == id && v.fully_established) => Some(id),
            Some(id) => {
                tracing::warn!(scheduler = scheduler.name(), subflow = id, "scheduler picked an ineligible subflow");
                None
            }
            None => None,
        };
        if chosen.is_none() {
            self.shared.metrics.record_scheduler_deferral();
            tracing::trace!(token = format_args!("{:08x}", self.token), "transmission deferred");
        }
        chosen
    }

    /// Rebind the connection to another policy
    pub fn set_scheduler(&mut self, scheduler: Arc<dyn Scheduler>) {
        self.release_scheduler();
        self.scheduler = scheduler;
        self.init_scheduler();
    }

    fn init_scheduler(&mut self) {
        let views: Vec<SubflowView> = self.registry.iter().map(Subflow::view).collect();
        let ctx = SchedulerContext::new(self.token, &views, self.first, self.last_snd, None);
        self.sched_state = self.scheduler.init(&ctx);
    }

    fn release_scheduler(&mut self) {
        let views: Vec<SubflowView> = self.registry.iter().map(Subflow::view).collect();
        let scheduler = Arc::clone(&self.scheduler);
        let mut ctx = SchedulerContext::new(
            self.token,
            &views,
            self.first,
            self.last_snd,
            self.sched_state.as_mut(),
        );
        scheduler.release(&mut ctx);
        self.sched_state = None;
    }

    // Path management

    /// Announce a local address. Returns its address id and the ADD_ADDR
    /// option to send.
    pub fn announce_address(&mut self, addr: SocketAddr) -> Result<(u8, Bytes)> {
        if self.flags.closed {
            return Err(MptcpError::Closed(self.token));
        }
        if let Some((&id, _)) = self.pm.local_addrs.iter().find(|(_, a)| **a == addr) {
            return Ok((id, self.add_addr_option(id, addr)?));
        }
        if self.pm.next_local_id == 0 {
            return Err(MptcpError::LimitReached(u8::MAX as usize));
        }

        let id = self.pm.next_local_id;
        self.pm.next_local_id = id.wrapping_add(1);
        self.pm.local_addrs.insert(id, addr);
        self.shared.metrics.record_address_announced();
        Ok((id, self.add_addr_option(id, addr)?))
    }

    fn add_addr_option(&self, address_id: u8, addr: SocketAddr) -> Result<Bytes> {
        let option = MptcpOption::AddAddr(AddAddr {
            address_id,
            addr: addr.ip(),
            port: (addr.port() != 0).then(|| addr.port()),
        });
        Ok(encode_options(&[option])?)
    }

    /// Withdraw a local address; subflows using it are closed. Returns
    /// the REMOVE_ADDR option and the closed subflows.
    pub fn withdraw_address(&mut self, address_id: u8) -> Result<(Bytes, Vec<SubflowId>)> {
        if self.flags.closed {
            return Err(MptcpError::Closed(self.token));
        }
        self.pm.local_addrs.remove(&address_id);
        let ids: Vec<SubflowId> = self
            .registry
            .iter()
            .filter(|s| s.local_id == address_id)
            .map(|s| s.id)
            .collect();
        for &id in &ids {
            self.remove_subflow(id);
        }
        let option = MptcpOption::RemoveAddr(RemoveAddr { address_ids: vec![address_id] });
        Ok((encode_options(&[option])?, ids))
    }

    /// Close the subflows towards a peer address id
    pub fn remove_subflows_for_remote(&mut self, address_id: u8) -> Vec<SubflowId> {
        let ids: Vec<SubflowId> = self
            .registry
            .iter()
            .filter(|s| s.remote_id == address_id)
            .map(|s| s.id)
            .collect();
        for &id in &ids {
            self.remove_subflow(id);
        }
        ids
    }

    pub fn has_subflow_to(&self, remote: SocketAddr) -> bool {
        self.registry
            .iter()
            .chain(self.pending.values())
            .any(|s| s.remote_addr == remote)
    }

    fn on_fully_established(&mut self) {
        if self.flags.fully_established {
            return;
        }
        self.flags.fully_established = true;
        tracing::debug!(token = format_args!("{:08x}", self.token), "connection fully established");

        for (address_id, addr) in std::mem::take(&mut self.pm.parked) {
            self.queue_pm(|conn| PmCommand::AddAddr { conn, address_id, addr });
        }
    }

    fn queue_pm(&self, command: impl FnOnce(WeakConnection) -> PmCommand) {
        let (Some(tx), Some(conn)) = (&self.shared.pm_tx, &self.self_ref) else {
            return;
        };
        if let Err(e) = tx.try_send(command(conn.clone())) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::warn!(token = format_args!("{:08x}", self.token), "path manager queue full, event dropped")
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::debug!("path manager stopped")
                }
            }
        }
    }

    // Teardown

    /// Remove one subflow from the registry
    pub fn remove_subflow(&mut self, id: SubflowId) -> Option<Subflow> {
        let mut subflow = self.registry.remove(id).or_else(|| self.pending.remove(&id))?;
        subflow.set_state(SubflowState::Closed);
        if self.first == Some(id) {
            self.first = None;
        }
        if self.last_snd == Some(id) {
            self.last_snd = None;
        }
        self.shared.metrics.record_subflow_closed();
        self.shared.events.subflow_closed(self.token, id);
        Some(subflow)
    }

    /// Options for an MP_FASTCLOSE; the connection is closed immediately
    pub fn fast_close(&mut self) -> Result<Bytes> {
        let option = MptcpOption::MpFastclose(MpFastclose { receiver_key: self.remote_key });
        let encoded = encode_options(&[option])?;
        self.close();
        Ok(encoded)
    }

    /// Drop this connection's token table entry. An entry already handed to
    /// another connection is not ours and stays.
    fn release_token(&self) {
        if let Some(me) = &self.self_ref {
            self.shared.tokens.release(me);
        }
    }

    /// Tear the connection down: subflows close, the scheduler is
    /// released and the token becomes free. Idempotent.
    pub fn close(&mut self) {
        if self.flags.closed {
            return;
        }
        self.release_scheduler();
        self.flags.closed = true;

        for mut subflow in self.registry.drain() {
            subflow.set_state(SubflowState::Closed);
            self.shared.metrics.record_subflow_closed();
            self.shared.events.subflow_closed(self.token, subflow.id);
        }
        self.pending.clear();
        self.pm.parked.clear();
        self.out_of_order.clear();
        self.first = None;
        self.last_snd = None;

        self.release_token();
        self.shared.metrics.record_connection_closed();
        self.shared.events.connection_closed(self.token);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("token", &format_args!("{:08x}", self.token))
            .field("flags", &self.flags)
            .field("write_seq", &self.write_seq)
            .field("snd_una", &self.snd_una)
            .field("ack_seq", &self.ack_seq)
            .field("subflows", &self.registry.ids())
            .field("scheduler", &self.scheduler.name())
            .finish()
    }
}

/// Shared handle to a connection
#[derive(Clone)]
pub struct ConnectionHandle {
    token: u32,
    inner: Arc<Mutex<Connection>>,
}

impl ConnectionHandle {
    pub(crate) fn new(conn: Connection) -> Self {
        let handle = Self {
            token: conn.token,
            inner: Arc::new(Mutex::new(conn)),
        };
        handle.inner.lock().self_ref = Some(handle.downgrade());
        handle
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.inner.lock()
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            token: self.token,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("token", &format_args!("{:08x}", self.token))
            .finish()
    }
}

/// Non-owning reference held by the token table and the path manager
#[derive(Clone)]
pub struct WeakConnection {
    pub(crate) token: u32,
    pub(crate) inner: Weak<Mutex<Connection>>,
}

impl WeakConnection {
    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn upgrade(&self) -> Option<ConnectionHandle> {
        self.inner.upgrade().map(|inner| ConnectionHandle { token: self.token, inner })
    }

    #[cfg(test)]
    pub(crate) fn dangling(token: u32) -> Self {
        Self { token, inner: Weak::new() }
    }
}

impl fmt::Debug for WeakConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakConnection")
            .field("token", &format_args!("{:08x}", self.token))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mptcp::events::TracingEvents;
    use crate::mptcp::scheduler::FirstScheduler;
    use mptcp_core::crypto::OsKeySource;
    use mptcp_core::types::option::SeqWidth;

    fn connection() -> Connection {
        let shared = Shared {
            config: Arc::new(MptcpConfig::default()),
            negotiator: CapabilityNegotiator::default(),
            tokens: Arc::new(TokenTable::new(Arc::new(OsKeySource), 8)),
            metrics: Arc::new(Metrics::new()),
            events: Arc::new(TracingEvents),
            pm_tx: None,
        };
        let addr = SocketAddr::from(([192, 0, 2, 1], 4000));
        Connection::active(shared, KeyMaterial::from_key(7), Arc::new(FirstScheduler), addr, addr)
    }

    #[test]
    fn test_reassembly_across_sequence_wrap() {
        let mut conn = connection();
        conn.ack_seq = u64::MAX - 9;

        // the segment past the wrap arrives first
        conn.advance_ack(6, 4);
        assert_eq!(conn.ack_seq, u64::MAX - 9);
        conn.advance_ack(u64::MAX - 9, 16);
        assert_eq!(conn.ack_seq, 10);
        assert!(conn.out_of_order.is_empty());

        // a duplicate from before the wrap does not move it back
        conn.advance_ack(u64::MAX - 9, 4);
        assert_eq!(conn.ack_seq, 10);
    }

    #[test]
    fn test_data_ack_across_sequence_wrap() {
        let mut conn = connection();
        conn.snd_una = u64::MAX - 4;
        conn.write_seq = 20;

        let ack = DataAck { value: 3, width: SeqWidth::Bits64 };
        let mut outcome = InboundOutcome::default();
        conn.handle_dss_ack(&ack, &mut outcome);
        assert_eq!(conn.snd_una, 3);
        assert_eq!(outcome.data_acked, Some(3));

        let beyond = DataAck { value: 21, width: SeqWidth::Bits64 };
        conn.handle_dss_ack(&beyond, &mut InboundOutcome::default());
        assert_eq!(conn.snd_una, 3);
    }
}
