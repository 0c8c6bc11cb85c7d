use std::fmt;
use std::net::IpAddr;

use crate::crypto::JoinProof;

/// TCP option kind assigned to Multipath TCP
pub const TCPOPT_MPTCP: u8 = 30;
pub const TCPOPT_EOL: u8 = 0;
pub const TCPOPT_NOP: u8 = 1;

/// Total TCP option space available in a segment header
pub const MAX_OPTION_SPACE: usize = 40;

// MP_CAPABLE lengths
pub const MPC_SYN_LEN: usize = 12;
pub const MPC_SYNACK_LEN: usize = 12;
pub const MPC_ACK_LEN: usize = 20;

// MP_JOIN lengths
pub const JOIN_SYN_LEN: usize = 12;
pub const JOIN_SYNACK_LEN: usize = 16;
pub const JOIN_ACK_LEN: usize = 24;

// DSS component lengths; the option length is their sum
pub const DSS_BASE_LEN: usize = 4;
pub const DSS_ACK32_LEN: usize = 4;
pub const DSS_ACK64_LEN: usize = 8;
pub const DSS_MAP32_LEN: usize = 10;
pub const DSS_MAP64_LEN: usize = 14;
pub const DSS_CHECKSUM_LEN: usize = 2;

// ADD_ADDR lengths
pub const ADD_ADDR_V4_LEN: usize = 8;
pub const ADD_ADDR_V4_PORT_LEN: usize = 10;
pub const ADD_ADDR_V6_LEN: usize = 20;
pub const ADD_ADDR_V6_PORT_LEN: usize = 22;

pub const REMOVE_ADDR_BASE_LEN: usize = 3;
pub const MP_PRIO_LEN: usize = 3;
pub const MP_PRIO_ADDR_LEN: usize = 4;
pub const MP_FAIL_LEN: usize = 12;
pub const MP_FASTCLOSE_LEN: usize = 12;

/// Protocol version carried in the MP_CAPABLE version nibble
pub const MPTCP_VERSION: u8 = 0;

// DSS flag bits
pub const DSS_DATA_FIN: u8 = 0x10;
pub const DSS_DSN64: u8 = 0x08;
pub const DSS_MAP_PRESENT: u8 = 0x04;
pub const DSS_ACK64: u8 = 0x02;
pub const DSS_ACK_PRESENT: u8 = 0x01;

/// Option subtype, stored in the high nibble of the third option byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Subtype {
    MpCapable = 0,
    MpJoin = 1,
    Dss = 2,
    AddAddr = 3,
    RemoveAddr = 4,
    MpPrio = 5,
    MpFail = 6,
    MpFastclose = 7,
}

impl Subtype {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::MpCapable),
            1 => Some(Self::MpJoin),
            2 => Some(Self::Dss),
            3 => Some(Self::AddAddr),
            4 => Some(Self::RemoveAddr),
            5 => Some(Self::MpPrio),
            6 => Some(Self::MpFail),
            7 => Some(Self::MpFastclose),
            _ => None,
        }
    }
}

impl fmt::Display for Subtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MpCapable => "MP_CAPABLE",
            Self::MpJoin => "MP_JOIN",
            Self::Dss => "DSS",
            Self::AddAddr => "ADD_ADDR",
            Self::RemoveAddr => "REMOVE_ADDR",
            Self::MpPrio => "MP_PRIO",
            Self::MpFail => "MP_FAIL",
            Self::MpFastclose => "MP_FASTCLOSE",
        };
        f.write_str(name)
    }
}

/// MP_CAPABLE flag byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilityFlags {
    /// A: sender requires DSS checksums
    pub checksum_required: bool,
    /// B: extensibility, reserved
    pub extensibility: bool,
    /// H: HMAC-SHA1 is the negotiated hash
    pub hmac_sha1: bool,
}

impl CapabilityFlags {
    pub const CHECKSUM_REQUIRED: u8 = 0x80;
    pub const EXTENSIBILITY: u8 = 0x40;
    pub const HMAC_SHA1: u8 = 0x01;

    pub fn new(checksum_required: bool) -> Self {
        Self {
            checksum_required,
            extensibility: false,
            hmac_sha1: true,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut byte = 0;
        if self.checksum_required {
            byte |= Self::CHECKSUM_REQUIRED;
        }
        if self.extensibility {
            byte |= Self::EXTENSIBILITY;
        }
        if self.hmac_sha1 {
            byte |= Self::HMAC_SHA1;
        }
        byte
    }

    /// Unknown bits are ignored
    pub fn from_byte(byte: u8) -> Self {
        Self {
            checksum_required: byte & Self::CHECKSUM_REQUIRED != 0,
            extensibility: byte & Self::EXTENSIBILITY != 0,
            hmac_sha1: byte & Self::HMAC_SHA1 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpCapable {
    pub version: u8,
    pub flags: CapabilityFlags,
    pub sender_key: u64,
    /// Present only on the third ACK
    pub receiver_key: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpJoin {
    Syn {
        backup: bool,
        address_id: u8,
        token: u32,
        nonce: u32,
    },
    SynAck {
        backup: bool,
        address_id: u8,
        truncated_hmac: u64,
        nonce: u32,
    },
    Ack {
        hmac: JoinProof,
    },
}

/// Width of a sequence number on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqWidth {
    Bits32,
    Bits64,
}

impl SeqWidth {
    /// Value as it appears on the wire
    pub fn truncate(self, value: u64) -> u64 {
        match self {
            Self::Bits32 => value & 0xFFFF_FFFF,
            Self::Bits64 => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAck {
    pub value: u64,
    pub width: SeqWidth,
}

/// Relation between subflow bytes and the connection-level stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DssMapping {
    /// Data sequence number; only the low 32 bits are meaningful for `Bits32`
    pub data_seq: u64,
    pub width: SeqWidth,
    /// Subflow sequence number relative to the subflow's initial sequence
    pub subflow_seq: u32,
    pub data_len: u16,
    pub checksum: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dss {
    pub data_ack: Option<DataAck>,
    pub mapping: Option<DssMapping>,
    /// Only valid together with a mapping
    pub data_fin: bool,
}

impl Dss {
    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if let Some(ack) = &self.data_ack {
            flags |= DSS_ACK_PRESENT;
            if ack.width == SeqWidth::Bits64 {
                flags |= DSS_ACK64;
            }
        }
        if let Some(map) = &self.mapping {
            flags |= DSS_MAP_PRESENT;
            if map.width == SeqWidth::Bits64 {
                flags |= DSS_DSN64;
            }
        }
        if self.data_fin {
            flags |= DSS_DATA_FIN;
        }
        flags
    }

    /// Option length implied by the flag byte, without checksum
    pub fn expected_len(flags: u8) -> usize {
        let mut len = DSS_BASE_LEN;
        if flags & DSS_ACK_PRESENT != 0 {
            len += if flags & DSS_ACK64 != 0 { DSS_ACK64_LEN } else { DSS_ACK32_LEN };
        }
        if flags & DSS_MAP_PRESENT != 0 {
            len += if flags & DSS_DSN64 != 0 { DSS_MAP64_LEN } else { DSS_MAP32_LEN };
        }
        len
    }

    pub fn wire_len(&self) -> usize {
        let checksum = match &self.mapping {
            Some(DssMapping { checksum: Some(_), .. }) => DSS_CHECKSUM_LEN,
            _ => 0,
        };
        Self::expected_len(self.flags()) + checksum
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddAddr {
    pub address_id: u8,
    pub addr: IpAddr,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveAddr {
    pub address_ids: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpPrio {
    pub backup: bool,
    pub address_id: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpFail {
    pub data_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpFastclose {
    pub receiver_key: u64,
}

/// Any Multipath TCP suboption
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MptcpOption {
    MpCapable(MpCapable),
    MpJoin(MpJoin),
    Dss(Dss),
    AddAddr(AddAddr),
    RemoveAddr(RemoveAddr),
    MpPrio(MpPrio),
    MpFail(MpFail),
    MpFastclose(MpFastclose),
}

impl MptcpOption {
    pub fn subtype(&self) -> Subtype {
        match self {
            Self::MpCapable(_) => Subtype::MpCapable,
            Self::MpJoin(_) => Subtype::MpJoin,
            Self::Dss(_) => Subtype::Dss,
            Self::AddAddr(_) => Subtype::AddAddr,
            Self::RemoveAddr(_) => Subtype::RemoveAddr,
            Self::MpPrio(_) => Subtype::MpPrio,
            Self::MpFail(_) => Subtype::MpFail,
            Self::MpFastclose(_) => Subtype::MpFastclose,
        }
    }

    /// Encoded length including kind and length bytes
    pub fn wire_len(&self) -> usize {
        match self {
            Self::MpCapable(cap) => {
                if cap.receiver_key.is_some() {
                    MPC_ACK_LEN
                } else {
                    MPC_SYN_LEN
                }
            }
            Self::MpJoin(MpJoin::Syn { .. }) => JOIN_SYN_LEN,
            Self::MpJoin(MpJoin::SynAck { .. }) => JOIN_SYNACK_LEN,
            Self::MpJoin(MpJoin::Ack { .. }) => JOIN_ACK_LEN,
            Self::Dss(dss) => dss.wire_len(),
            Self::AddAddr(add) => match (add.addr, add.port) {
                (IpAddr::V4(_), None) => ADD_ADDR_V4_LEN,
                (IpAddr::V4(_), Some(_)) => ADD_ADDR_V4_PORT_LEN,
                (IpAddr::V6(_), None) => ADD_ADDR_V6_LEN,
                (IpAddr::V6(_), Some(_)) => ADD_ADDR_V6_PORT_LEN,
            },
            Self::RemoveAddr(rm) => REMOVE_ADDR_BASE_LEN + rm.address_ids.len(),
            Self::MpPrio(prio) => {
                if prio.address_id.is_some() {
                    MP_PRIO_ADDR_LEN
                } else {
                    MP_PRIO_LEN
                }
            }
            Self::MpFail(_) => MP_FAIL_LEN,
            Self::MpFastclose(_) => MP_FASTCLOSE_LEN,
        }
    }
}
