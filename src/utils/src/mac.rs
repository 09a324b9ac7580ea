use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Prefix for derived addresses: locally administered, unicast.
const DERIVED_OUI: [u8; 3] = [0x02, 0xa0, 0x98];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MacError {
    #[error("invalid MAC literal `{0}`, expected xx:xx:xx:xx:xx:xx")]
    InvalidLiteral(String),
    #[error("MAC address {0} is multicast")]
    Multicast(MacAddr),
    #[error("MAC address is all zeroes")]
    Zero,
}

/// An Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 6]
    }

    /// Derives a stable unicast address from a PCI bus/slot/function triple,
    /// so a VM keeps the same MAC across restarts without one being
    /// configured.
    pub fn derive_from_pci(bus: u8, slot: u8, func: u8) -> MacAddr {
        MacAddr([
            DERIVED_OUI[0],
            DERIVED_OUI[1],
            DERIVED_OUI[2],
            bus,
            slot,
            func,
        ])
    }
}

impl FromStr for MacAddr {
    type Err = MacError;

    fn from_str(s: &str) -> Result<Self, MacError> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| MacError::InvalidLiteral(s.to_string()))?;
            if part.len() != 2 {
                return Err(MacError::InvalidLiteral(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| MacError::InvalidLiteral(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(MacError::InvalidLiteral(s.to_string()));
        }

        let mac = MacAddr(bytes);
        if mac.is_zero() {
            return Err(MacError::Zero);
        }
        if mac.is_multicast() {
            return Err(MacError::Multicast(mac));
        }
        Ok(mac)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}
