//! Data-sequence mapping between subflow bytes and the connection stream.
//!
//! Each subflow carries a [`SendMapper`] that builds DSS mappings for
//! outgoing data and a [`ReceiveMapper`] that installs incoming mappings and
//! translates subflow sequence numbers into 64-bit data sequence numbers.
//! Sequence numbers travel as 32-bit values whenever the high-order epoch
//! is unchanged since the subflow's previous mapping and the distance from
//! it is small enough for the receiver to expand unambiguously.
//! Data sequence numbers are modular; compare them with [`seq_after`].

use crate::types::option::{DataAck, DssMapping, SeqWidth};

const EPOCH: u64 = 1 << 32;
const HALF_EPOCH: u64 = 1 << 31;

/// Largest jump from the previous mapping that still goes out truncated.
/// The receiver's reference may trail the sender's by one mapping.
const MAX_TRUNCATED_JUMP: u64 = HALF_EPOCH - (u16::MAX as u64 + 1);

/// `a` comes after `b` in the modular 64-bit data sequence space
pub fn seq_after(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) > 0
}

/// Whether `next` can follow `last` on the wire in 32-bit form: same
/// high-order epoch and close enough to expand unambiguously
pub fn fits_truncated(last: u64, next: u64) -> bool {
    last >> 32 == next >> 32 && last.abs_diff(next) < MAX_TRUNCATED_JUMP
}

/// Later of two data sequence numbers
pub fn seq_max(a: u64, b: u64) -> u64 {
    if seq_after(a, b) {
        a
    } else {
        b
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("no valid mapping covers the received data")]
    NoMapping,

    #[error("subflow bytes {subflow_seq}+{len} fall outside the current mapping")]
    OutsideMapping { subflow_seq: u32, len: usize },

    #[error("DSS checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("connection negotiated checksums but mapping carries none")]
    MissingChecksum,

    #[error("mapping of {0} bytes exceeds the data-level length field")]
    TooLong(usize),
}

/// Reconstruct a 64-bit sequence number from its low 32 bits.
///
/// Picks the candidate closest to `reference`, so a value that rolled over
/// lands in the next epoch and a slightly stale one stays in the current.
pub fn expand_seq(reference: u64, low: u32) -> u64 {
    let candidate = (reference & !(EPOCH - 1)) | low as u64;

    if candidate < reference && reference - candidate > HALF_EPOCH {
        candidate.wrapping_add(EPOCH)
    } else if candidate > reference && candidate - reference > HALF_EPOCH && candidate >= EPOCH {
        candidate - EPOCH
    } else {
        candidate
    }
}

/// Expand a possibly truncated wire value against `reference`
pub fn expand(reference: u64, value: u64, width: SeqWidth) -> u64 {
    match width {
        SeqWidth::Bits64 => value,
        SeqWidth::Bits32 => expand_seq(reference, value as u32),
    }
}

impl DataAck {
    /// Full 64-bit data acknowledgment relative to `snd_una`
    pub fn expand(&self, snd_una: u64) -> u64 {
        expand(snd_una, self.value, self.width)
    }
}

fn add_words(mut sum: u64, data: &[u8]) -> u64 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u64;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u64) << 8;
    }
    sum
}

/// DSS checksum: ones-complement sum over the pseudo-header
/// (DSN, relative subflow seq, data-level length, zero) and the payload.
pub fn dss_checksum(data_seq: u64, subflow_seq: u32, data_len: u16, payload: &[u8]) -> u16 {
    let mut header = [0u8; 16];
    header[..8].copy_from_slice(&data_seq.to_be_bytes());
    header[8..12].copy_from_slice(&subflow_seq.to_be_bytes());
    header[12..14].copy_from_slice(&data_len.to_be_bytes());

    let mut sum = add_words(0, &header);
    sum = add_words(sum, payload);
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Builds outgoing mappings for one subflow
#[derive(Debug, Clone)]
pub struct SendMapper {
    last_seq: Option<u64>,
    use_checksum: bool,
}

impl SendMapper {
    /// Both ends already agree on the epoch of `reference`
    pub fn new(reference: u64, use_checksum: bool) -> Self {
        Self {
            last_seq: Some(reference),
            use_checksum,
        }
    }

    /// No shared reference yet; the first mapping goes out in 64-bit form
    pub fn unsynchronized(use_checksum: bool) -> Self {
        Self {
            last_seq: None,
            use_checksum,
        }
    }

    pub fn set_use_checksum(&mut self, use_checksum: bool) {
        self.use_checksum = use_checksum;
    }

    /// Width the next mapping starting at `data_seq` would use
    pub fn width_for(&self, data_seq: u64) -> SeqWidth {
        match self.last_seq {
            Some(last) if fits_truncated(last, data_seq) => SeqWidth::Bits32,
            _ => SeqWidth::Bits64,
        }
    }

    /// Map `payload` at `data_seq` onto the subflow at `subflow_seq`.
    /// A DATA_FIN occupies one unit of the data-level length.
    pub fn map(
        &mut self,
        data_seq: u64,
        subflow_seq: u32,
        payload: &[u8],
        data_fin: bool,
    ) -> Result<DssMapping, MappingError> {
        let total = payload.len() + data_fin as usize;
        let data_len = u16::try_from(total).map_err(|_| MappingError::TooLong(total))?;

        let width = self.width_for(data_seq);
        self.last_seq = Some(data_seq);

        let checksum = self
            .use_checksum
            .then(|| dss_checksum(data_seq, subflow_seq, data_len, payload));

        Ok(DssMapping {
            data_seq: width.truncate(data_seq),
            width,
            subflow_seq,
            data_len,
            checksum,
        })
    }
}

/// Result of pushing subflow bytes through the current mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedData {
    pub data_seq: u64,
    pub len: usize,
    /// The mapping has been fully consumed and is no longer valid
    pub mapping_complete: bool,
}

/// Tracks the current incoming mapping of one subflow
#[derive(Debug, Clone)]
pub struct ReceiveMapper {
    reference: u64,
    map_seq: u64,
    map_subflow_seq: u32,
    map_data_len: u16,
    map_payload_len: u32,
    map_data_fin: bool,
    map_checksum: Option<u16>,
    map_valid: bool,
    infinite: bool,
    consumed: u32,
    use_checksum: bool,
    pending: Vec<u8>,
    data_fin_seq: Option<u64>,
}

impl ReceiveMapper {
    /// `reference` is the last full data sequence number known for this
    /// subflow; its high half seeds reconstruction of 32-bit mappings.
    pub fn new(reference: u64, use_checksum: bool) -> Self {
        Self {
            reference,
            map_seq: 0,
            map_subflow_seq: 0,
            map_data_len: 0,
            map_payload_len: 0,
            map_data_fin: false,
            map_checksum: None,
            map_valid: false,
            infinite: false,
            consumed: 0,
            use_checksum,
            pending: Vec::new(),
            data_fin_seq: None,
        }
    }

    pub fn set_use_checksum(&mut self, use_checksum: bool) {
        self.use_checksum = use_checksum;
    }

    pub fn reference(&self) -> u64 {
        self.reference
    }

    pub fn is_valid(&self) -> bool {
        self.map_valid
    }

    pub fn map_seq(&self) -> u64 {
        self.map_seq
    }

    pub fn map_subflow_seq(&self) -> u32 {
        self.map_subflow_seq
    }

    pub fn map_data_len(&self) -> u16 {
        self.map_data_len
    }

    /// Connection-level sequence number of a received DATA_FIN
    pub fn data_fin_seq(&self) -> Option<u64> {
        self.data_fin_seq
    }

    /// Install a mapping received in a DSS option and return its full
    /// 64-bit data sequence number.
    pub fn install(&mut self, mapping: &DssMapping, data_fin: bool) -> Result<u64, MappingError> {
        if self.use_checksum && mapping.checksum.is_none() && mapping.data_len != 0 {
            return Err(MappingError::MissingChecksum);
        }

        let data_seq = expand(self.reference, mapping.data_seq, mapping.width);

        if self.map_valid
            && self.map_seq == data_seq
            && self.map_subflow_seq == mapping.subflow_seq
            && self.map_data_len == mapping.data_len
        {
            // retransmitted option for the mapping in progress
            return Ok(data_seq);
        }

        let payload_len = mapping.data_len as u32 - (data_fin && mapping.data_len > 0) as u32;

        if data_fin && payload_len == 0 {
            // DATA_FIN without payload does not replace the current mapping
            self.data_fin_seq = Some(data_seq);
            self.reference = seq_max(self.reference, data_seq);
            tracing::trace!(data_seq, "bare DATA_FIN mapping");
            return Ok(data_seq);
        }

        self.map_seq = data_seq;
        self.map_subflow_seq = mapping.subflow_seq;
        self.map_data_len = mapping.data_len;
        self.map_payload_len = payload_len;
        self.map_data_fin = data_fin;
        self.map_checksum = mapping.checksum;
        self.infinite = mapping.data_len == 0;
        self.map_valid = true;
        self.consumed = 0;
        self.pending.clear();
        self.reference = data_seq;

        tracing::trace!(
            data_seq,
            subflow_seq = mapping.subflow_seq,
            data_len = mapping.data_len,
            infinite = self.infinite,
            "installed mapping"
        );
        Ok(data_seq)
    }

    /// Translate received subflow bytes into connection-level sequence
    /// space. `subflow_seq` is relative to the subflow's initial sequence.
    pub fn consume(
        &mut self,
        subflow_seq: u32,
        payload: &[u8],
    ) -> Result<MappedData, MappingError> {
        if !self.map_valid {
            return Err(MappingError::NoMapping);
        }

        let offset = subflow_seq.wrapping_sub(self.map_subflow_seq);
        let len = payload.len();

        if self.infinite {
            let data_seq = self.map_seq.wrapping_add(offset as u64);
            self.reference = seq_max(self.reference, data_seq.wrapping_add(len as u64));
            return Ok(MappedData { data_seq, len, mapping_complete: false });
        }

        let end = offset as u64 + len as u64;
        if end > self.map_payload_len as u64 {
            return Err(MappingError::OutsideMapping { subflow_seq, len });
        }

        let data_seq = self.map_seq.wrapping_add(offset as u64);

        if end > self.consumed as u64 {
            if self.use_checksum {
                let fresh = (self.consumed - offset.min(self.consumed)) as usize;
                self.pending.extend_from_slice(&payload[fresh..]);
            }
            self.consumed = end as u32;
        }
        self.reference = seq_max(self.reference, data_seq.wrapping_add(len as u64));

        let mapping_complete = self.consumed == self.map_payload_len;
        if mapping_complete {
            self.map_valid = false;
            if self.use_checksum {
                self.verify_pending()?;
            }
            if self.map_data_fin {
                self.data_fin_seq = Some(self.map_seq.wrapping_add(self.map_payload_len as u64));
            }
        }

        Ok(MappedData { data_seq, len, mapping_complete })
    }

    fn verify_pending(&mut self) -> Result<(), MappingError> {
        let expected = dss_checksum(
            self.map_seq,
            self.map_subflow_seq,
            self.map_data_len,
            &self.pending,
        );
        self.pending.clear();
        match self.map_checksum {
            Some(actual) if actual != expected => {
                Err(MappingError::ChecksumMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }
}
