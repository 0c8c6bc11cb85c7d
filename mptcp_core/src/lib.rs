//! Protocol core for Multipath TCP: key and token derivation, the suboption
//! wire format, and data-sequence mapping. Nothing in this crate performs
//! I/O or takes locks; the connection engine lives in `mptcp_transport`.

pub mod types;
pub mod codec;
pub mod crypto;
pub mod mapping;

pub use codec::{
    decode_option, encode_option, encode_options, parse_options, OptionError, ParsedOptions,
};
pub use crypto::{KeyMaterial, KeySource, OsKeySource};
pub use mapping::{MappingError, ReceiveMapper, SendMapper};
pub use types::option::MptcpOption;
