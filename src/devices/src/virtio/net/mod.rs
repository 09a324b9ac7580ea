use utils::mac::{MacAddr, MacError};

pub mod backend;
mod device;
pub mod dgram;
mod rx;
mod worker;

pub use self::backend::{ConnectError, NetBackend, ReadError, WriteError};
pub use self::device::{Net, VirtioNetBackend};
pub use self::rx::RxHandle;

pub(crate) const QUEUE_SIZE: u16 = 1024;
pub(crate) const NUM_QUEUES: usize = 2;
pub(crate) const QUEUE_SIZES: [u16; NUM_QUEUES] = [QUEUE_SIZE; NUM_QUEUES];

pub(crate) const RX_INDEX: usize = 0;
pub(crate) const TX_INDEX: usize = 1;
// A control queue would sit at index 2; this device does not implement one.

/// Longest descriptor chain either data path will gather into one frame.
pub const MAX_SEGS_PER_CHAIN: usize = 256;

#[derive(Debug)]
pub enum Error {
    /// The MAC literal in the device option string is unusable.
    ParseMac(MacError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Parsed form of the device option string `"<backend>[,<mac>]"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetOptions {
    /// Backend device to open, e.g. a tap name; `None` when the option
    /// string was empty.
    pub backend: Option<String>,
    /// MAC literal, when one was given; otherwise the caller derives one
    /// from the PCI slot.
    pub mac: Option<MacAddr>,
}

impl NetOptions {
    pub fn parse(opts: &str) -> Result<NetOptions> {
        let (backend, mac) = match opts.split_once(',') {
            Some((backend, mac)) => (backend, Some(mac)),
            None => (opts, None),
        };

        let mac = mac
            .map(|m| m.parse().map_err(Error::ParseMac))
            .transpose()?;
        let backend = if backend.is_empty() {
            None
        } else {
            Some(backend.to_string())
        };

        Ok(NetOptions { backend, mac })
    }

    /// The configured MAC, or one derived from the device's PCI address.
    pub fn mac_or_derived(&self, bus: u8, slot: u8, func: u8) -> MacAddr {
        self.mac
            .unwrap_or_else(|| MacAddr::derive_from_pci(bus, slot, func))
    }
}
