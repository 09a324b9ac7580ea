use std::os::fd::RawFd;

use crate::virtio::descriptor_utils::Iovec;

#[derive(Debug)]
pub enum ConnectError {
    /// Could not inspect or adjust the descriptor's flags
    Fcntl(nix::Error),
}

#[derive(Debug)]
pub enum ReadError {
    /// No frame was waiting
    NothingRead,
    /// Another internal error occurred
    Internal(nix::Error),
}

#[derive(Debug)]
pub enum WriteError {
    /// Nothing was written, you can drop the frame or try to resend it later
    NothingWritten,
    /// The other end of the backend is gone (received EPIPE)
    PeerGone,
    /// Another internal error occurred
    Internal(nix::Error),
}

/// Host-side frame mover bound to the device at init time. Both data paths
/// call in concurrently, so implementations take `&self`.
pub trait NetBackend: Send + Sync {
    /// Feature bits this backend contributes to the advertised set.
    fn features(&self) -> u64 {
        0
    }

    /// Called when the guest accepts a feature set; `vhdr_len` is the vnet
    /// header size every frame carries from then on.
    fn negotiate_features(&self, _features: u64, _vhdr_len: usize) {}

    /// Try to write one frame of `len` total bytes, vnet header included.
    fn send_frame(&self, iovs: &[Iovec], len: usize) -> Result<(), WriteError>;

    /// Try to read one frame into `iovs`, returning its total length
    /// including the vnet header the backend prepends.
    fn recv_frame(&self, iovs: &[Iovec]) -> Result<usize, ReadError>;

    /// Pollable descriptor for the event loop, if the backend has one.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}
