use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error};
use vm_memory::GuestMemory;

use crate::virtio::descriptor_utils::Iovec;

use super::backend::{NetBackend, ReadError};
use super::device::{NetCore, RingBinding, RxState};
use super::MAX_SEGS_PER_CHAIN;

/// Typed receive entry handed to the event loop; invoked whenever the
/// backend fd turns readable. Cloneable, and never outlives the device core
/// it points at.
#[derive(Clone)]
pub struct RxHandle {
    core: Arc<NetCore>,
}

impl RxHandle {
    pub(crate) fn new(core: Arc<NetCore>) -> Self {
        Self { core }
    }

    /// Entry point for backend-readable events.
    pub fn backend_readable(&self) {
        let mut rx = self.core.rx.lock();
        self.core.rx_drain(&mut rx);
    }
}

impl NetCore {
    /// One receive pass: move frames from the backend into guest RX chains
    /// until either side runs dry. Runs entirely under the RX lock; ends
    /// with exactly one end-of-batch interrupt decision whenever the ring
    /// was touched.
    pub(crate) fn rx_drain(&self, rx: &mut RxState) {
        let Some(backend) = self.backend.as_deref() else {
            return;
        };

        if !rx.ready || self.resetting.load(Ordering::Acquire) || rx.ring.is_none() {
            // the ring is off limits; drop one frame so the fd drains
            discard_frame(backend, &mut rx.discard_buf);
            return;
        }

        let RxState {
            ring, discard_buf, ..
        } = rx;
        let RingBinding { queue, mem } = ring.as_mut().unwrap();
        let mem = &*mem;

        if queue.is_empty(mem) {
            // no guest buffers: drop one frame, and wake the guest if it
            // asked to hear about the ring running empty
            discard_frame(backend, discard_buf);
            if queue.needs_interrupt(mem, true) {
                self.irq.signal_used_queue("rx ring empty");
            }
            return;
        }

        let mut iovecs: Vec<Iovec> = Vec::with_capacity(MAX_SEGS_PER_CHAIN);

        loop {
            let Some(head) = queue.pop(mem) else {
                break;
            };
            let head_index = head.index;

            iovecs.clear();
            let mut malformed = false;
            let mut next_desc = Some(head);
            while let Some(desc) = next_desc {
                if !desc.is_write_only() || iovecs.len() == MAX_SEGS_PER_CHAIN {
                    malformed = true;
                    break;
                }
                match mem.get_slice(desc.addr, desc.len as usize) {
                    Ok(slice) => iovecs.push(Iovec::from(slice)),
                    Err(e) => {
                        error!("failed to map rx segment: {e:?}");
                        malformed = true;
                        break;
                    }
                }
                next_desc = desc.next_descriptor();
            }

            if malformed {
                if let Err(e) = queue.add_used(mem, head_index, 0) {
                    error!("failed to return malformed rx chain: {e:?}");
                }
                continue;
            }

            match backend.recv_frame(&iovecs) {
                Ok(len) => {
                    if let Err(e) = queue.add_used(mem, head_index, len as u32) {
                        error!("failed to publish rx chain: {e:?}");
                    }
                }
                Err(ReadError::NothingRead) => {
                    // nothing waiting: hand the chain back untouched and skip
                    // the empty-ring boost on the way out
                    queue.undo_pop();
                    if queue.needs_interrupt(mem, false) {
                        self.irq.signal_used_queue("rx backend drained");
                    }
                    return;
                }
                Err(e) => {
                    // transient backend failure: put the chain back and abort
                    // the pass, the event loop will redeliver
                    error!("failed to read frame from backend: {e:?}");
                    queue.undo_pop();
                    break;
                }
            }

            if queue.is_empty(mem) {
                break;
            }
        }

        if queue.needs_interrupt(mem, true) {
            self.irq.signal_used_queue("rx drain");
        }
    }
}

fn discard_frame(backend: &dyn NetBackend, buf: &mut [u8]) {
    let iovs = [Iovec::from_slice(buf)];
    match backend.recv_frame(&iovs) {
        Ok(len) => debug!("dropped {len} byte frame, guest rx ring unusable"),
        Err(ReadError::NothingRead) => {}
        Err(e) => error!("failed to discard frame: {e:?}"),
    }
}
