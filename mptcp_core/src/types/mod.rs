pub mod option;

pub use option::{
    AddAddr, CapabilityFlags, DataAck, Dss, DssMapping, MpCapable, MpFail, MpFastclose, MpJoin,
    MpPrio, MptcpOption, RemoveAddr, SeqWidth, Subtype,
};
