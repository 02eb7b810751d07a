use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MacParseError {
    #[error("malformed mac address '{0}'")]
    Malformed(String),
    #[error("multicast mac address '{0}' is not usable as a device address")]
    Multicast(String),
}

/// An Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const LEN: usize = 6;

    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Parse a `xx:xx:xx:xx:xx:xx` literal.
    ///
    /// Multicast addresses are rejected: a NIC cannot present one as its own
    /// station address.
    pub fn parse(s: &str) -> Result<Self, MacParseError> {
        let mut octets = [0u8; Self::LEN];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| MacParseError::Malformed(s.to_string()))?;
            if part.len() != 2 {
                return Err(MacParseError::Malformed(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| MacParseError::Malformed(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(MacParseError::Malformed(s.to_string()));
        }
        let mac = Self(octets);
        if mac.is_multicast() {
            return Err(MacParseError::Multicast(s.to_string()));
        }
        Ok(mac)
    }

    /// Derive a deterministic, locally administered unicast address from a
    /// PCI bus/slot/function triple.
    ///
    /// Instantiating the same slot twice yields the same address, so guests
    /// keep a stable MAC across VMM restarts without one being configured.
    pub fn derive_local(bus: u8, slot: u8, func: u8) -> Self {
        // FNV-1a over the PCI address, spread over the low three octets.
        let mut hash: u32 = 0x811c_9dc5;
        for byte in [bus, slot, func] {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        let h = hash.to_le_bytes();
        Self([0x02, 0xb0, 0x5a, h[0], h[1], h[2]])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}
