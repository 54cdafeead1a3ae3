use clkvc_oracle::{Header, HEADER_LEN};

/// Header, share target and the next nonce to hand out for them.
///
/// The base is kept at 64 bits so that stepping past the end of the 32-bit
/// nonce space is visible instead of wrapping; only bases that passed
/// `would_exhaust` are ever handed to a kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceWindow {
    header: Header,
    target: u64,
    nonce_base: u64,
}

impl Default for NonceWindow {
    fn default() -> Self {
        Self {
            header: [0; HEADER_LEN],
            target: 0,
            nonce_base: 0,
        }
    }
}

impl NonceWindow {
    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn nonce_base(&self) -> u64 {
        self.nonce_base
    }

    /// The base as a kernel nonce, or `None` once it has left the 32-bit space.
    pub fn first_nonce(&self) -> Option<u32> {
        u32::try_from(self.nonce_base).ok()
    }

    pub fn set_header(&mut self, header: Header) {
        self.header = header;
        self.nonce_base = 0;
    }

    pub fn set_target(&mut self, target: u64) {
        self.target = target;
        self.nonce_base = 0;
    }

    pub fn seek(&mut self, nonce_base: u64) {
        self.nonce_base = nonce_base;
    }

    /// True when a batch starting at the current base would run past the end
    /// of the 32-bit nonce space.
    pub fn would_exhaust(&self, batch: usize) -> bool {
        self.nonce_base.saturating_add(batch as u64) > u64::from(u32::MAX)
    }

    pub fn advance(&mut self, batch: usize) {
        self.nonce_base = self.nonce_base.saturating_add(batch as u64);
    }
}

/// Nonces a batch reported, attributed to the header it was dispatched with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinedNonces {
    pub origin: Header,
    pub first_nonce: u32,
    pub batch: usize,
    pub nonces: Vec<u32>,
    /// Count the device reported; larger than `nonces.len()` when the
    /// candidate buffer overflowed.
    pub reported: u32,
}

impl MinedNonces {
    pub fn overflowed(&self) -> bool {
        self.reported as usize > self.nonces.len()
    }
}
