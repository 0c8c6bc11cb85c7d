//! Handshake options and their verification.
//!
//! MP_CAPABLE (three-way key exchange):
//!   SYN      client key
//!   SYN-ACK  server key
//!   ACK      client key, server key
//!
//! MP_JOIN (authenticated additional subflow):
//!   SYN      token of the receiver, sender nonce
//!   SYN-ACK  truncated HMAC, sender nonce
//!   ACK      full HMAC
//!
//! Every HMAC is computed from the sender's side: keyed by
//! `sender_key || receiver_key` over `sender_nonce || receiver_nonce`.

use bytes::Bytes;

use mptcp_core::crypto::{
    join_proof, truncated_join_proof, verify_join_proof, verify_truncated_join_proof,
};
use mptcp_core::types::option::{CapabilityFlags, MpCapable, MpJoin, MptcpOption};

use super::connection::ConnectionHandle;
use super::request::SubflowRequest;
use super::subflow::SubflowId;
use crate::negotiation::CapabilityNegotiator;

/// Verdict on an incoming SYN
#[derive(Debug)]
pub enum SynDecision {
    /// New connection; answer with [`SubflowRequest::syn_ack_options`]
    Capable(SubflowRequest),
    /// Additional subflow for an existing connection
    Join(SubflowRequest),
    /// No usable MP_CAPABLE; continue as plain TCP
    Plain,
    /// Refuse the SYN
    Reject(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownToken,
    NotFullyEstablished,
    Closed,
    LimitReached,
    AuthFailed,
    Malformed,
}

/// Result of completing a server-side handshake with the peer's ACK
#[derive(Debug)]
pub enum AcceptOutcome {
    Established(ConnectionHandle),
    /// Options carry the DSS acknowledging the join
    Joined {
        connection: ConnectionHandle,
        subflow: SubflowId,
        options: Bytes,
    },
    /// MP_CAPABLE was not completed; the path is plain TCP
    Fallback,
    Rejected(RejectReason),
}

pub(crate) fn capable_syn(negotiator: &CapabilityNegotiator, local_key: u64) -> MptcpOption {
    MptcpOption::MpCapable(MpCapable {
        version: negotiator.local_version(),
        flags: negotiator.local_flags(),
        sender_key: local_key,
        receiver_key: None,
    })
}

pub(crate) fn capable_syn_ack(version: u8, use_checksum: bool, local_key: u64) -> MptcpOption {
    MptcpOption::MpCapable(MpCapable {
        version,
        flags: CapabilityFlags::new(use_checksum),
        sender_key: local_key,
        receiver_key: None,
    })
}

pub(crate) fn capable_ack(
    version: u8,
    use_checksum: bool,
    local_key: u64,
    remote_key: u64,
) -> MptcpOption {
    MptcpOption::MpCapable(MpCapable {
        version,
        flags: CapabilityFlags::new(use_checksum),
        sender_key: local_key,
        receiver_key: Some(remote_key),
    })
}

/// The third ACK must echo both keys
pub(crate) fn check_capable_ack(cap: &MpCapable, local_key: u64, remote_key: u64) -> bool {
    cap.sender_key == remote_key && cap.receiver_key == Some(local_key)
}

pub(crate) fn join_syn(backup: bool, address_id: u8, remote_token: u32, nonce: u32) -> MptcpOption {
    MptcpOption::MpJoin(MpJoin::Syn {
        backup,
        address_id,
        token: remote_token,
        nonce,
    })
}

pub(crate) fn join_syn_ack(
    backup: bool,
    address_id: u8,
    local_key: u64,
    remote_key: u64,
    local_nonce: u32,
    remote_nonce: u32,
) -> MptcpOption {
    MptcpOption::MpJoin(MpJoin::SynAck {
        backup,
        address_id,
        truncated_hmac: truncated_join_proof(local_key, remote_key, local_nonce, remote_nonce),
        nonce: local_nonce,
    })
}

pub(crate) fn join_ack(
    local_key: u64,
    remote_key: u64,
    local_nonce: u32,
    remote_nonce: u32,
) -> MptcpOption {
    MptcpOption::MpJoin(MpJoin::Ack {
        hmac: join_proof(local_key, remote_key, local_nonce, remote_nonce),
    })
}

/// Check the truncated proof the peer computed from its own side
pub(crate) fn check_join_syn_ack(
    truncated: u64,
    local_key: u64,
    remote_key: u64,
    local_nonce: u32,
    remote_nonce: u32,
) -> bool {
    verify_truncated_join_proof(truncated, remote_key, local_key, remote_nonce, local_nonce)
}

pub(crate) fn check_join_ack(
    hmac: &[u8],
    local_key: u64,
    remote_key: u64,
    local_nonce: u32,
    remote_nonce: u32,
) -> bool {
    verify_join_proof(hmac, remote_key, local_key, remote_nonce, local_nonce)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_KEY: u64 = 0x0123456789abcdef;
    const SERVER_KEY: u64 = 0xfedcba9876543210;
    const CLIENT_NONCE: u32 = 0x11223344;
    const SERVER_NONCE: u32 = 0x55667788;

    #[test]
    fn test_join_proofs_cross_check() {
        let syn_ack = join_syn_ack(false, 2, SERVER_KEY, CLIENT_KEY, SERVER_NONCE, CLIENT_NONCE);
        let truncated = match syn_ack {
            MptcpOption::MpJoin(MpJoin::SynAck { truncated_hmac, nonce, .. }) => {
                assert_eq!(nonce, SERVER_NONCE);
                truncated_hmac
            }
            other => panic!("unexpected option {:?}", other),
        };
        assert!(check_join_syn_ack(truncated, CLIENT_KEY, SERVER_KEY, CLIENT_NONCE, SERVER_NONCE));
        assert!(!check_join_syn_ack(truncated ^ 1, CLIENT_KEY, SERVER_KEY, CLIENT_NONCE, SERVER_NONCE));

        let hmac = match join_ack(CLIENT_KEY, SERVER_KEY, CLIENT_NONCE, SERVER_NONCE) {
            MptcpOption::MpJoin(MpJoin::Ack { hmac }) => hmac,
            other => panic!("unexpected option {:?}", other),
        };
        assert!(check_join_ack(&hmac, SERVER_KEY, CLIENT_KEY, SERVER_NONCE, CLIENT_NONCE));
        // a proof is never valid in the other direction
        assert!(!check_join_ack(&hmac, CLIENT_KEY, SERVER_KEY, CLIENT_NONCE, SERVER_NONCE));
    }

    #[test]
    fn test_capable_ack_echo() {
        let ack = match capable_ack(0, false, CLIENT_KEY, SERVER_KEY) {
            MptcpOption::MpCapable(cap) => cap,
            other => panic!("unexpected option {:?}", other),
        };
        assert!(check_capable_ack(&ack, SERVER_KEY, CLIENT_KEY));
        assert!(!check_capable_ack(&ack, CLIENT_KEY, SERVER_KEY));
    }

    #[test]
    fn test_capable_syn_advertises_policy() {
        let negotiator = CapabilityNegotiator::new(true);
        match capable_syn(&negotiator, CLIENT_KEY) {
            MptcpOption::MpCapable(cap) => {
                assert_eq!(cap.version, 0);
                assert!(cap.flags.checksum_required);
                assert!(cap.flags.hmac_sha1);
                assert_eq!(cap.receiver_key, None);
            }
            other => panic!("unexpected option {:?}", other),
        }
    }
}
