use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::uio::writev;
use tracing::debug;

use crate::virtio::descriptor_utils::Iovec;

use super::backend::{ConnectError, NetBackend, ReadError, WriteError};

fn readv(fd: RawFd, iov: &[Iovec]) -> Result<usize, Errno> {
    let ret = unsafe {
        libc::readv(
            fd,
            iov.as_ptr() as *const libc::iovec,
            iov.len() as libc::c_int,
        )
    };
    Errno::result(ret).map(|r| r as usize)
}

/// Backend over a datagram fd carrying raw Ethernet frames (a socketpair to
/// a host-side switch process, or a pre-opened tap). The kernel side knows
/// nothing of vnet headers, so sends skip the header and receives synthesize
/// a zeroed one of the negotiated length.
pub struct Dgram {
    fd: OwnedFd,
    vhdr_len: AtomicUsize,
}

impl Dgram {
    pub fn new(fd: OwnedFd) -> Result<Self, ConnectError> {
        let flags =
            fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(ConnectError::Fcntl)?;
        let flags = OFlag::from_bits_retain(flags);
        fcntl(
            fd.as_raw_fd(),
            FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
        )
        .map_err(ConnectError::Fcntl)?;

        #[cfg(target_os = "macos")]
        {
            // nix doesn't provide an abstraction for SO_NOSIGPIPE, fall back to libc.
            let option_value: libc::c_int = 1;
            unsafe {
                libc::setsockopt(
                    fd.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_NOSIGPIPE,
                    &option_value as *const _ as *const libc::c_void,
                    std::mem::size_of_val(&option_value) as libc::socklen_t,
                )
            };
        }

        Ok(Self {
            fd,
            // Until negotiation says otherwise, frames carry the mergeable
            // 12 byte header.
            vhdr_len: AtomicUsize::new(12),
        })
    }
}

impl NetBackend for Dgram {
    fn negotiate_features(&self, _features: u64, vhdr_len: usize) {
        self.vhdr_len.store(vhdr_len, Ordering::Relaxed);
    }

    fn send_frame(&self, iovs: &[Iovec], len: usize) -> Result<(), WriteError> {
        let hdr_len = self.vhdr_len.load(Ordering::Relaxed);
        if iovs.is_empty() || iovs[0].len() < hdr_len || len < hdr_len {
            return Err(WriteError::Internal(Errno::EINVAL));
        }

        // skip the vnet header, the wire carries the bare frame
        let mut iovs = iovs.to_vec();
        iovs[0].advance(hdr_len);

        match writev(&self.fd, Iovec::slice_to_std(&iovs)) {
            Ok(_) => Ok(()),
            Err(Errno::ENOBUFS | Errno::EAGAIN) => Err(WriteError::NothingWritten),
            Err(Errno::EPIPE) => Err(WriteError::PeerGone),
            Err(e) => Err(WriteError::Internal(e)),
        }
    }

    fn recv_frame(&self, iovs: &[Iovec]) -> Result<usize, ReadError> {
        let hdr_len = self.vhdr_len.load(Ordering::Relaxed);
        if iovs.is_empty() || iovs[0].len() < hdr_len {
            return Err(ReadError::Internal(Errno::EINVAL));
        }

        // the guest expects a vnet header ahead of the frame; zero-fill one
        unsafe { std::ptr::write_bytes(iovs[0].addr_mut(), 0, hdr_len) };
        let mut iovs = iovs.to_vec();
        iovs[0].advance(hdr_len);

        let frame_len = match readv(self.fd.as_raw_fd(), &iovs) {
            Ok(0) => return Err(ReadError::NothingRead),
            Ok(n) => n,
            Err(Errno::EAGAIN) => return Err(ReadError::NothingRead),
            Err(e) => return Err(ReadError::Internal(e)),
        };
        debug!("read eth frame from backend: {} bytes", frame_len);
        Ok(hdr_len + frame_len)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.fd.as_raw_fd())
    }
}
