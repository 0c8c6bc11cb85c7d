use mptcp_core::types::option::{CapabilityFlags, MpCapable, MPTCP_VERSION};

/// Outcome of comparing a peer's MP_CAPABLE against local policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationResult {
    pub version: u8,
    /// Checksums are used when either side requires them
    pub use_checksum: bool,
}

/// Capability negotiator for MP_CAPABLE exchanges
#[derive(Debug, Clone)]
pub struct CapabilityNegotiator {
    supported_versions: Vec<u8>,
    checksum_required: bool,
}

impl CapabilityNegotiator {
    pub fn new(checksum_required: bool) -> Self {
        Self {
            supported_versions: vec![MPTCP_VERSION],
            checksum_required,
        }
    }

    /// Flags we advertise
    pub fn local_flags(&self) -> CapabilityFlags {
        CapabilityFlags::new(self.checksum_required)
    }

    pub fn local_version(&self) -> u8 {
        MPTCP_VERSION
    }

    /// Negotiate against the peer's option. `None` means the path must
    /// fall back to plain TCP.
    pub fn negotiate(&self, peer: &MpCapable) -> Option<NegotiationResult> {
        if !self.supports_version(peer.version) {
            tracing::debug!(version = peer.version, "peer offered unsupported version");
            return None;
        }
        if !peer.flags.hmac_sha1 {
            tracing::debug!("peer did not offer HMAC-SHA1");
            return None;
        }

        Some(NegotiationResult {
            version: peer.version,
            use_checksum: self.checksum_required || peer.flags.checksum_required,
        })
    }

    pub fn supported_versions(&self) -> &[u8] {
        &self.supported_versions
    }

    pub fn supports_version(&self, version: u8) -> bool {
        self.supported_versions.contains(&version)
    }
}

impl Default for CapabilityNegotiator {
    fn default() -> Self {
        Self::new(false)
    }
}
