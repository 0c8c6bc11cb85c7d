//! MPTCP Subflow

use std::net::SocketAddr;
use std::time::Duration;

use mptcp_core::crypto::{generate_nonce, KeyMaterial};
use mptcp_core::mapping::{fits_truncated, MappedData, MappingError, ReceiveMapper, SendMapper};
use mptcp_core::types::option::{DataAck, DssMapping, SeqWidth};

use super::scheduler::SubflowView;

/// Identifier of a subflow, unique within its connection
pub type SubflowId = u32;

const INITIAL_RTT: Duration = Duration::from_millis(100);

/// Handshake and lifetime state of one subflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubflowState {
    Init,
    CapableSent,
    CapableReceived,
    Establishing,
    JoinSent,
    JoinReceived,
    Authenticated,
    Established,
    /// Plain TCP path after a failed negotiation
    Fallback,
    Closed,
}

impl SubflowState {
    /// Can carry data
    pub fn is_established(self) -> bool {
        matches!(self, Self::Established | Self::Fallback)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubflowFlags {
    pub mp_capable: bool,
    pub mp_join: bool,
    /// We asked for checksums in our MP_CAPABLE
    pub request_checksum: bool,
    pub use_checksum: bool,
    pub backup: bool,
    /// Waiting for the first DSS on this subflow
    pub fourth_ack: bool,
    /// DATA_FIN seen on this subflow
    pub conn_finished: bool,
    pub fully_established: bool,
}

/// Represents a single subflow (path)
#[derive(Debug)]
pub struct Subflow {
    pub id: SubflowId,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub local_id: u8,
    pub remote_id: u8,

    pub local_key: u64,
    pub remote_key: u64,
    /// Token of the owning connection
    pub token: u32,
    pub idsn: u64,
    pub remote_idsn: u64,
    pub local_nonce: u32,
    pub remote_nonce: u32,
    /// Peer's initial subflow sequence number
    pub ssn_offset: u32,

    pub flags: SubflowFlags,
    pub rtt: Duration,

    state: SubflowState,
    snd_ssn: u32,
    tx: SendMapper,
    rx: ReceiveMapper,
    last_ack: Option<u64>,
    pub(crate) fail_seq: Option<u64>,
}

impl Subflow {
    /// First subflow of an outgoing connection
    pub fn initial(
        id: SubflowId,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        keys: &KeyMaterial,
        request_checksum: bool,
    ) -> Self {
        let mut subflow = Self::blank(id, local_addr, remote_addr, keys);
        subflow.flags.mp_capable = true;
        subflow.flags.request_checksum = request_checksum;
        subflow
    }

    /// Additional subflow joining an existing connection
    pub fn join(
        id: SubflowId,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        keys: &KeyMaterial,
        remote_key: u64,
        local_id: u8,
        backup: bool,
    ) -> Self {
        let mut subflow = Self::blank(id, local_addr, remote_addr, keys);
        subflow.remote_key = remote_key;
        subflow.local_id = local_id;
        subflow.local_nonce = generate_nonce();
        subflow.flags.mp_join = true;
        subflow.flags.backup = backup;
        subflow
    }

    pub(crate) fn blank(
        id: SubflowId,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        keys: &KeyMaterial,
    ) -> Self {
        Self {
            id,
            local_addr,
            remote_addr,
            local_id: 0,
            remote_id: 0,
            local_key: keys.key,
            remote_key: 0,
            token: keys.token,
            idsn: keys.idsn,
            remote_idsn: 0,
            local_nonce: 0,
            remote_nonce: 0,
            ssn_offset: 0,
            flags: SubflowFlags::default(),
            rtt: INITIAL_RTT,
            state: SubflowState::Init,
            snd_ssn: 1,
            tx: SendMapper::unsynchronized(false),
            rx: ReceiveMapper::new(0, false),
            last_ack: None,
            fail_seq: None,
        }
    }

    pub fn state(&self) -> SubflowState {
        self.state
    }

    pub fn set_state(&mut self, state: SubflowState) {
        if self.state != state {
            tracing::trace!(subflow = self.id, from = ?self.state, to = ?state, "subflow state");
            self.state = state;
        }
    }

    pub fn is_established(&self) -> bool {
        self.state.is_established()
    }

    pub fn is_fully_established(&self) -> bool {
        self.flags.fully_established
    }

    /// Returns true on the transition
    pub(crate) fn mark_fully_established(&mut self) -> bool {
        self.flags.fourth_ack = false;
        !std::mem::replace(&mut self.flags.fully_established, true)
    }

    /// Seed both mappers once the data sequence space is known.
    /// `synchronized` is false for joins, whose first mapping must carry
    /// the full 64-bit sequence number.
    pub(crate) fn synchronize(
        &mut self,
        write_seq: u64,
        ack_seq: u64,
        use_checksum: bool,
        synchronized: bool,
    ) {
        self.flags.use_checksum = use_checksum;
        self.tx = if synchronized {
            SendMapper::new(write_seq, use_checksum)
        } else {
            SendMapper::unsynchronized(use_checksum)
        };
        self.rx = ReceiveMapper::new(ack_seq, use_checksum);
        self.last_ack = synchronized.then_some(ack_seq);
    }

    /// Data-ack field for `ack_seq`, 64 bits wide when a 32-bit value could
    /// be expanded into the wrong epoch
    pub(crate) fn data_ack(&mut self, ack_seq: u64) -> DataAck {
        let width = match self.last_ack {
            Some(last) if fits_truncated(last, ack_seq) => SeqWidth::Bits32,
            _ => SeqWidth::Bits64,
        };
        self.last_ack = Some(ack_seq);
        DataAck { value: width.truncate(ack_seq), width }
    }

    /// Map `payload` at `data_seq` onto the next subflow bytes
    pub(crate) fn next_mapping(
        &mut self,
        data_seq: u64,
        payload: &[u8],
        data_fin: bool,
    ) -> Result<DssMapping, MappingError> {
        let mapping = self.tx.map(data_seq, self.snd_ssn, payload, data_fin)?;
        self.snd_ssn = self.snd_ssn.wrapping_add(payload.len() as u32);
        Ok(mapping)
    }

    pub(crate) fn install_mapping(
        &mut self,
        mapping: &DssMapping,
        data_fin: bool,
    ) -> Result<u64, MappingError> {
        self.rx.install(mapping, data_fin)
    }

    pub(crate) fn consume(
        &mut self,
        subflow_seq: u32,
        payload: &[u8],
    ) -> Result<MappedData, MappingError> {
        self.rx.consume(subflow_seq, payload)
    }

    /// Next relative subflow sequence number to send
    pub fn snd_ssn(&self) -> u32 {
        self.snd_ssn
    }

    pub fn map_valid(&self) -> bool {
        self.rx.is_valid()
    }

    pub fn map_seq(&self) -> u64 {
        self.rx.map_seq()
    }

    pub fn map_subflow_seq(&self) -> u32 {
        self.rx.map_subflow_seq()
    }

    pub fn map_data_len(&self) -> u16 {
        self.rx.map_data_len()
    }

    pub fn data_fin_seq(&self) -> Option<u64> {
        self.rx.data_fin_seq()
    }

    /// Subflow sequence number relative to the peer's initial sequence
    pub fn relative_seq(&self, absolute: u32) -> u32 {
        absolute.wrapping_sub(self.ssn_offset)
    }

    pub fn update_rtt(&mut self, sample: Duration) {
        // EWMA, gain 1/8
        self.rtt = (self.rtt * 7 + sample) / 8;
    }

    pub fn view(&self) -> SubflowView {
        SubflowView {
            id: self.id,
            local_addr: self.local_addr,
            remote_addr: self.remote_addr,
            backup: self.flags.backup,
            fully_established: self.is_established() && self.flags.fully_established,
            rtt: self.rtt,
        }
    }
}
