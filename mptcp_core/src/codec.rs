//! Wire codec for Multipath TCP suboptions.
//!
//! Every option is `kind(30) len subtype<<4|nibble ...` in network byte
//! order. The decoder checks the length byte against the fixed lengths of
//! each subtype before reading any field; a mismatch yields an error that
//! callers treat as "ignore this option", never as a connection failure.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::crypto::JOIN_PROOF_LEN;
use crate::types::option::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OptionError {
    #[error("option truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("not an MPTCP option (kind {0})")]
    NotMptcp(u8),

    #[error("unknown MPTCP subtype {0}")]
    UnknownSubtype(u8),

    #[error("invalid length {len} for {subtype}")]
    BadLength { subtype: Subtype, len: usize },

    #[error("invalid option: {0}")]
    Invalid(&'static str),

    #[error("options need {needed} bytes, only {available} available")]
    NoSpace { needed: usize, available: usize },
}

pub type Result<T> = std::result::Result<T, OptionError>;

/// Options recovered from a segment's option list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOptions {
    pub options: Vec<MptcpOption>,
    /// Malformed MPTCP options that were skipped
    pub dropped: usize,
}

impl ParsedOptions {
    pub fn capable(&self) -> Option<&MpCapable> {
        self.options.iter().find_map(|o| match o {
            MptcpOption::MpCapable(cap) => Some(cap),
            _ => None,
        })
    }

    pub fn join(&self) -> Option<&MpJoin> {
        self.options.iter().find_map(|o| match o {
            MptcpOption::MpJoin(join) => Some(join),
            _ => None,
        })
    }

    pub fn dss(&self) -> Option<&Dss> {
        self.options.iter().find_map(|o| match o {
            MptcpOption::Dss(dss) => Some(dss),
            _ => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

fn check_encodable(option: &MptcpOption) -> Result<()> {
    match option {
        MptcpOption::MpCapable(cap) if cap.version > 0x0F => {
            Err(OptionError::Invalid("version does not fit in a nibble"))
        }
        MptcpOption::Dss(dss) if dss.data_fin && dss.mapping.is_none() => {
            Err(OptionError::Invalid("DATA_FIN requires a mapping"))
        }
        MptcpOption::RemoveAddr(rm) if rm.address_ids.is_empty() => {
            Err(OptionError::Invalid("REMOVE_ADDR needs at least one address id"))
        }
        _ if option.wire_len() > MAX_OPTION_SPACE => Err(OptionError::NoSpace {
            needed: option.wire_len(),
            available: MAX_OPTION_SPACE,
        }),
        _ => Ok(()),
    }
}

fn put_seq(buf: &mut BytesMut, value: u64, width: SeqWidth) {
    match width {
        SeqWidth::Bits32 => buf.put_u32(value as u32),
        SeqWidth::Bits64 => buf.put_u64(value),
    }
}

/// Append one option to `buf`
pub fn encode_option(option: &MptcpOption, buf: &mut BytesMut) -> Result<()> {
    check_encodable(option)?;

    let len = option.wire_len();
    let subtype = (option.subtype() as u8) << 4;
    buf.reserve(len);
    buf.put_u8(TCPOPT_MPTCP);
    buf.put_u8(len as u8);

    match option {
        MptcpOption::MpCapable(cap) => {
            buf.put_u8(subtype | cap.version);
            buf.put_u8(cap.flags.to_byte());
            buf.put_u64(cap.sender_key);
            if let Some(key) = cap.receiver_key {
                buf.put_u64(key);
            }
        }
        MptcpOption::MpJoin(MpJoin::Syn { backup, address_id, token, nonce }) => {
            buf.put_u8(subtype | *backup as u8);
            buf.put_u8(*address_id);
            buf.put_u32(*token);
            buf.put_u32(*nonce);
        }
        MptcpOption::MpJoin(MpJoin::SynAck { backup, address_id, truncated_hmac, nonce }) => {
            buf.put_u8(subtype | *backup as u8);
            buf.put_u8(*address_id);
            buf.put_u64(*truncated_hmac);
            buf.put_u32(*nonce);
        }
        MptcpOption::MpJoin(MpJoin::Ack { hmac }) => {
            buf.put_u8(subtype);
            buf.put_u8(0);
            buf.put_slice(hmac);
        }
        MptcpOption::Dss(dss) => {
            buf.put_u8(subtype);
            buf.put_u8(dss.flags());
            if let Some(ack) = &dss.data_ack {
                put_seq(buf, ack.value, ack.width);
            }
            if let Some(map) = &dss.mapping {
                put_seq(buf, map.data_seq, map.width);
                buf.put_u32(map.subflow_seq);
                buf.put_u16(map.data_len);
                if let Some(checksum) = map.checksum {
                    buf.put_u16(checksum);
                }
            }
        }
        MptcpOption::AddAddr(add) => {
            match add.addr {
                IpAddr::V4(v4) => {
                    buf.put_u8(subtype | 4);
                    buf.put_u8(add.address_id);
                    buf.put_slice(&v4.octets());
                }
                IpAddr::V6(v6) => {
                    buf.put_u8(subtype | 6);
                    buf.put_u8(add.address_id);
                    buf.put_slice(&v6.octets());
                }
            }
            if let Some(port) = add.port {
                buf.put_u16(port);
            }
        }
        MptcpOption::RemoveAddr(rm) => {
            buf.put_u8(subtype);
            buf.put_slice(&rm.address_ids);
        }
        MptcpOption::MpPrio(prio) => {
            buf.put_u8(subtype | prio.backup as u8);
            if let Some(id) = prio.address_id {
                buf.put_u8(id);
            }
        }
        MptcpOption::MpFail(fail) => {
            buf.put_u8(subtype);
            buf.put_u8(0);
            buf.put_u64(fail.data_seq);
        }
        MptcpOption::MpFastclose(close) => {
            buf.put_u8(subtype);
            buf.put_u8(0);
            buf.put_u64(close.receiver_key);
        }
    }

    Ok(())
}

/// Encode a set of options, NOP-padded to a 32-bit boundary
pub fn encode_options(options: &[MptcpOption]) -> Result<Bytes> {
    let needed: usize = options.iter().map(MptcpOption::wire_len).sum();
    let padded = (needed + 3) & !3;
    if padded > MAX_OPTION_SPACE {
        return Err(OptionError::NoSpace {
            needed: padded,
            available: MAX_OPTION_SPACE,
        });
    }

    let mut buf = BytesMut::with_capacity(padded);
    for option in options {
        encode_option(option, &mut buf)?;
    }
    while buf.len() < padded {
        buf.put_u8(TCPOPT_NOP);
    }
    Ok(buf.freeze())
}

fn get_seq(buf: &mut &[u8], width: SeqWidth) -> u64 {
    match width {
        SeqWidth::Bits32 => buf.get_u32() as u64,
        SeqWidth::Bits64 => buf.get_u64(),
    }
}

fn validate_len(subtype: Subtype, len: usize, first: u8, flags: u8) -> Result<()> {
    let ok = match subtype {
        Subtype::MpCapable => len == MPC_SYN_LEN || len == MPC_SYNACK_LEN || len == MPC_ACK_LEN,
        Subtype::MpJoin => len == JOIN_SYN_LEN || len == JOIN_SYNACK_LEN || len == JOIN_ACK_LEN,
        Subtype::Dss => {
            let expected = Dss::expected_len(flags);
            len == expected || (flags & DSS_MAP_PRESENT != 0 && len == expected + DSS_CHECKSUM_LEN)
        }
        Subtype::AddAddr => match first & 0x0F {
            4 => len == ADD_ADDR_V4_LEN || len == ADD_ADDR_V4_PORT_LEN,
            6 => len == ADD_ADDR_V6_LEN || len == ADD_ADDR_V6_PORT_LEN,
            _ => return Err(OptionError::Invalid("unknown ADD_ADDR IP version")),
        },
        Subtype::RemoveAddr => len > REMOVE_ADDR_BASE_LEN,
        Subtype::MpPrio => len == MP_PRIO_LEN || len == MP_PRIO_ADDR_LEN,
        Subtype::MpFail => len == MP_FAIL_LEN,
        Subtype::MpFastclose => len == MP_FASTCLOSE_LEN,
    };

    if ok {
        Ok(())
    } else {
        Err(OptionError::BadLength { subtype, len })
    }
}

/// Decode one option. `data` starts at the kind byte and may extend past
/// the option; only `len` bytes are consumed.
pub fn decode_option(data: &[u8]) -> Result<MptcpOption> {
    if data.len() < 3 {
        return Err(OptionError::Truncated { needed: 3, available: data.len() });
    }
    if data[0] != TCPOPT_MPTCP {
        return Err(OptionError::NotMptcp(data[0]));
    }

    let len = data[1] as usize;
    if len < 3 {
        return Err(OptionError::Invalid("length shorter than option header"));
    }
    if len > data.len() {
        return Err(OptionError::Truncated { needed: len, available: data.len() });
    }

    let first = data[2];
    let subtype = Subtype::from_u8(first >> 4).ok_or(OptionError::UnknownSubtype(first >> 4))?;
    let flags = if len > 3 { data[3] } else { 0 };
    validate_len(subtype, len, first, flags)?;

    let low = first & 0x0F;
    let mut buf = &data[3..len];

    let option = match subtype {
        Subtype::MpCapable => {
            let flags = CapabilityFlags::from_byte(buf.get_u8());
            let sender_key = buf.get_u64();
            let receiver_key = if len == MPC_ACK_LEN { Some(buf.get_u64()) } else { None };
            MptcpOption::MpCapable(MpCapable {
                version: low,
                flags,
                sender_key,
                receiver_key,
            })
        }
        Subtype::MpJoin => {
            let backup = low & 0x01 != 0;
            match len {
                JOIN_SYN_LEN => {
                    let address_id = buf.get_u8();
                    let token = buf.get_u32();
                    let nonce = buf.get_u32();
                    MptcpOption::MpJoin(MpJoin::Syn { backup, address_id, token, nonce })
                }
                JOIN_SYNACK_LEN => {
                    let address_id = buf.get_u8();
                    let truncated_hmac = buf.get_u64();
                    let nonce = buf.get_u32();
                    MptcpOption::MpJoin(MpJoin::SynAck { backup, address_id, truncated_hmac, nonce })
                }
                _ => {
                    buf.advance(1);
                    let mut hmac = [0u8; JOIN_PROOF_LEN];
                    buf.copy_to_slice(&mut hmac);
                    MptcpOption::MpJoin(MpJoin::Ack { hmac })
                }
            }
        }
        Subtype::Dss => {
            let flags = buf.get_u8();
            let data_fin = flags & DSS_DATA_FIN != 0;
            if data_fin && flags & DSS_MAP_PRESENT == 0 {
                return Err(OptionError::Invalid("DATA_FIN requires a mapping"));
            }

            let data_ack = if flags & DSS_ACK_PRESENT != 0 {
                let width = if flags & DSS_ACK64 != 0 {
                    SeqWidth::Bits64
                } else {
                    SeqWidth::Bits32
                };
                Some(DataAck { value: get_seq(&mut buf, width), width })
            } else {
                None
            };

            let mapping = if flags & DSS_MAP_PRESENT != 0 {
                let width = if flags & DSS_DSN64 != 0 {
                    SeqWidth::Bits64
                } else {
                    SeqWidth::Bits32
                };
                let data_seq = get_seq(&mut buf, width);
                let subflow_seq = buf.get_u32();
                let data_len = buf.get_u16();
                let checksum = if buf.remaining() >= DSS_CHECKSUM_LEN {
                    Some(buf.get_u16())
                } else {
                    None
                };
                Some(DssMapping { data_seq, width, subflow_seq, data_len, checksum })
            } else {
                None
            };

            MptcpOption::Dss(Dss { data_ack, mapping, data_fin })
        }
        Subtype::AddAddr => {
            let address_id = buf.get_u8();
            let addr = if low == 4 {
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                IpAddr::V4(Ipv4Addr::from(octets))
            } else {
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                IpAddr::V6(Ipv6Addr::from(octets))
            };
            let port = if buf.remaining() >= 2 { Some(buf.get_u16()) } else { None };
            MptcpOption::AddAddr(AddAddr { address_id, addr, port })
        }
        Subtype::RemoveAddr => MptcpOption::RemoveAddr(RemoveAddr {
            address_ids: buf.to_vec(),
        }),
        Subtype::MpPrio => MptcpOption::MpPrio(MpPrio {
            backup: low & 0x01 != 0,
            address_id: if buf.has_remaining() { Some(buf.get_u8()) } else { None },
        }),
        Subtype::MpFail => {
            buf.advance(1);
            MptcpOption::MpFail(MpFail { data_seq: buf.get_u64() })
        }
        Subtype::MpFastclose => {
            buf.advance(1);
            MptcpOption::MpFastclose(MpFastclose { receiver_key: buf.get_u64() })
        }
    };

    Ok(option)
}

/// Walk a TCP option list and decode every MPTCP option in it.
///
/// Malformed MPTCP options are skipped and counted; other option kinds are
/// stepped over untouched.
pub fn parse_options(data: &[u8]) -> ParsedOptions {
    let mut parsed = ParsedOptions::default();
    let mut pos = 0;

    while pos < data.len() {
        let kind = data[pos];
        match kind {
            TCPOPT_EOL => break,
            TCPOPT_NOP => {
                pos += 1;
                continue;
            }
            _ => {}
        }

        let Some(&len) = data.get(pos + 1) else {
            if kind == TCPOPT_MPTCP {
                parsed.dropped += 1;
            }
            break;
        };
        let len = len as usize;
        if len < 2 || pos + len > data.len() {
            if kind == TCPOPT_MPTCP {
                tracing::debug!(len, remaining = data.len() - pos, "dropping MPTCP option running past option space");
                parsed.dropped += 1;
            }
            break;
        }

        if kind == TCPOPT_MPTCP {
            match decode_option(&data[pos..pos + len]) {
                Ok(option) => parsed.options.push(option),
                Err(e) => {
                    tracing::debug!(error = %e, "dropping malformed MPTCP option");
                    parsed.dropped += 1;
                }
            }
        }
        pos += len;
    }

    parsed
}
