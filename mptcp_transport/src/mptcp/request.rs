use bytes::Bytes;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mptcp_core::codec::{encode_options, OptionError};
use mptcp_core::crypto::KeyMaterial;

use super::connection::WeakConnection;
use super::handshake::{capable_syn_ack, join_syn_ack};
use super::subflow::{Subflow, SubflowId, SubflowState};
use crate::token::TokenReservation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Capable,
    Join,
}

/// Server-side half-open subflow, between SYN and the final ACK.
///
/// Dropping a capable request releases its reserved token.
#[derive(Debug)]
pub struct SubflowRequest {
    kind: RequestKind,
    state: SubflowState,
    created: Instant,

    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub local_id: u8,
    pub remote_id: u8,
    pub backup: bool,

    pub local_key: u64,
    pub remote_key: u64,
    /// Token of the connection this request creates or joins
    pub token: u32,
    pub idsn: u64,
    pub local_nonce: u32,
    pub remote_nonce: u32,

    pub version: u8,
    pub use_checksum: bool,
    /// Initial sequence number of the peer's SYN
    pub ssn_offset: u32,

    pub(crate) reservation: Option<TokenReservation>,
    pub(crate) connection: Option<WeakConnection>,
}

impl SubflowRequest {
    pub(crate) fn capable(
        reservation: TokenReservation,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        remote_key: u64,
        version: u8,
        use_checksum: bool,
    ) -> Self {
        let keys = *reservation.keys();
        let mut request = Self::new(
            RequestKind::Capable,
            SubflowState::CapableReceived,
            local_addr,
            remote_addr,
            &keys,
        );
        request.remote_key = remote_key;
        request.version = version;
        request.use_checksum = use_checksum;
        request.reservation = Some(reservation);
        request
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn join(
        connection: WeakConnection,
        keys: &KeyMaterial,
        remote_key: u64,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        local_id: u8,
        remote_id: u8,
        backup: bool,
        local_nonce: u32,
        remote_nonce: u32,
        use_checksum: bool,
    ) -> Self {
        let mut request = Self::new(
            RequestKind::Join,
            SubflowState::JoinReceived,
            local_addr,
            remote_addr,
            keys,
        );
        request.remote_key = remote_key;
        request.local_id = local_id;
        request.remote_id = remote_id;
        request.backup = backup;
        request.local_nonce = local_nonce;
        request.remote_nonce = remote_nonce;
        request.use_checksum = use_checksum;
        request.connection = Some(connection);
        request
    }

    fn new(
        kind: RequestKind,
        state: SubflowState,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        keys: &KeyMaterial,
    ) -> Self {
        Self {
            kind,
            state,
            created: Instant::now(),
            local_addr,
            remote_addr,
            local_id: 0,
            remote_id: 0,
            backup: false,
            local_key: keys.key,
            remote_key: 0,
            token: keys.token,
            idsn: keys.idsn,
            local_nonce: 0,
            remote_nonce: 0,
            version: 0,
            use_checksum: false,
            ssn_offset: 0,
            reservation: None,
            connection: None,
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn state(&self) -> SubflowState {
        self.state
    }

    pub fn set_ssn_offset(&mut self, isn: u32) {
        self.ssn_offset = isn;
    }

    /// Time since the SYN arrived
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Options for our SYN-ACK
    pub fn syn_ack_options(&self) -> Result<Bytes, OptionError> {
        let option = match self.kind {
            RequestKind::Capable => {
                capable_syn_ack(self.version, self.use_checksum, self.local_key)
            }
            RequestKind::Join => join_syn_ack(
                self.backup,
                self.local_id,
                self.local_key,
                self.remote_key,
                self.local_nonce,
                self.remote_nonce,
            ),
        };
        encode_options(&[option])
    }

    pub(crate) fn take_reservation(&mut self) -> Option<TokenReservation> {
        self.reservation.take()
    }

    /// Subflow carrying this request's identity, in `Establishing` state
    pub(crate) fn to_subflow(&self, id: SubflowId) -> Subflow {
        let keys = KeyMaterial {
            key: self.local_key,
            token: self.token,
            idsn: self.idsn,
        };
        let mut subflow = Subflow::blank(id, self.local_addr, self.remote_addr, &keys);
        subflow.remote_key = self.remote_key;
        subflow.local_id = self.local_id;
        subflow.remote_id = self.remote_id;
        subflow.local_nonce = self.local_nonce;
        subflow.remote_nonce = self.remote_nonce;
        subflow.ssn_offset = self.ssn_offset;
        subflow.flags.backup = self.backup;
        subflow.flags.use_checksum = self.use_checksum;
        match self.kind {
            RequestKind::Capable => subflow.flags.mp_capable = true,
            RequestKind::Join => subflow.flags.mp_join = true,
        }
        subflow.set_state(SubflowState::Establishing);
        subflow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::handshake::check_join_syn_ack;
    use crate::token::TokenTable;
    use mptcp_core::codec::parse_options;
    use mptcp_core::crypto::OsKeySource;
    use mptcp_core::types::option::MpJoin;
    use std::sync::Arc;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([198, 51, 100, 7], port))
    }

    #[test]
    fn test_capable_request_releases_token_on_drop() {
        let table = Arc::new(TokenTable::new(Arc::new(OsKeySource), 4));
        let reservation = table.reserve().unwrap();
        let token = reservation.token();

        let request = SubflowRequest::capable(reservation, addr(80), addr(5555), 9, 0, true);
        assert_eq!(request.kind(), RequestKind::Capable);
        assert_eq!(request.state(), SubflowState::CapableReceived);
        assert_eq!(request.token, token);
        assert!(table.contains(token));

        let options = parse_options(&request.syn_ack_options().unwrap());
        let cap = options.capable().unwrap();
        assert_eq!(cap.receiver_key, None);
        assert!(cap.flags.checksum_required);

        drop(request);
        assert!(!table.contains(token));
    }

    #[test]
    fn test_join_request_syn_ack() {
        let keys = KeyMaterial::from_key(0xfedcba9876543210);
        let weak = WeakConnection::dangling(keys.token);
        let mut request = SubflowRequest::join(
            weak,
            &keys,
            0x0123456789abcdef,
            addr(80),
            addr(6000),
            3,
            1,
            true,
            0x55667788,
            0x11223344,
            false,
        );
        request.set_ssn_offset(1000);

        let options = parse_options(&request.syn_ack_options().unwrap());
        match options.join() {
            Some(MpJoin::SynAck { backup, address_id, truncated_hmac, nonce }) => {
                assert!(*backup);
                assert_eq!(*address_id, 3);
                assert_eq!(*nonce, 0x55667788);
                assert!(check_join_syn_ack(
                    *truncated_hmac,
                    0x0123456789abcdef,
                    keys.key,
                    0x11223344,
                    0x55667788
                ));
            }
            other => panic!("unexpected {:?}", other),
        }

        let subflow = request.to_subflow(5);
        assert_eq!(subflow.state(), SubflowState::Establishing);
        assert!(subflow.flags.mp_join);
        assert_eq!(subflow.remote_id, 1);
        assert_eq!(subflow.ssn_offset, 1000);
        assert_eq!(subflow.token, keys.token);
    }
}
