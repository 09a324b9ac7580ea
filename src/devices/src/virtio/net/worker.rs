use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error};
use vm_memory::GuestMemory;

use crate::virtio::descriptor_utils::Iovec;

use super::backend::WriteError;
use super::device::{NetCore, RingBinding};
use super::MAX_SEGS_PER_CHAIN;

/// The dedicated transmit worker. It spends its life parked on the TX
/// condition; a guest kick wakes it, it drains the ring to the backend, then
/// parks again. It holds the TX mutex only while parked and in the short
/// pre/post-drain sections, never across a backend send.
pub(crate) struct TxWorker {
    core: Arc<NetCore>,
}

impl TxWorker {
    pub fn new(core: Arc<NetCore>) -> Self {
        Self { core }
    }

    pub fn run(self) -> JoinHandle<()> {
        thread::Builder::new()
            .name("virtio-net tx".to_string())
            .spawn(|| self.work())
            .expect("failed to spawn thread")
    }

    fn work(self) {
        let core = &*self.core;

        let mut tx = core.tx.lock();
        loop {
            // Park until a kick leaves work behind. Reopening the kick window
            // before the final emptiness re-check is what closes the race
            // with a kick that fired between "ring empty" and "window open".
            loop {
                if tx.shutdown {
                    return;
                }
                let has_work = match tx.ring.as_mut() {
                    Some(ring) => ring
                        .queue
                        .enable_notification(&ring.mem)
                        .unwrap_or_else(|e| {
                            error!("failed to reopen tx kick window: {e:?}");
                            false
                        }),
                    None => false,
                };
                let runnable = has_work && !core.resetting.load(Ordering::Acquire);
                if runnable {
                    break;
                }
                tx.in_progress = false;
                core.tx_cond.wait(&mut tx);
            }

            {
                let ring = tx.ring.as_mut().unwrap();
                if let Err(e) = ring.queue.disable_notification(&ring.mem) {
                    error!("failed to suppress tx kicks: {e:?}");
                }
            }
            tx.in_progress = true;

            // Take the binding out so the drain runs without the lock; reset
            // polls `in_progress` and will not touch the ring until we park.
            let mut ring = tx.ring.take().unwrap();
            drop(tx);

            self.drain(&mut ring);

            tx = core.tx.lock();
            tx.ring = Some(ring);
        }
    }

    fn drain(&self, ring: &mut RingBinding) {
        let core = &*self.core;
        let RingBinding { queue, mem } = ring;
        let mem = &*mem;

        let mut iovecs: Vec<Iovec> = Vec::with_capacity(MAX_SEGS_PER_CHAIN);

        while !core.resetting.load(Ordering::Acquire) {
            let Some(head) = queue.pop(mem) else {
                break;
            };
            let head_index = head.index;

            iovecs.clear();
            let mut len = 0usize;
            let mut malformed = false;
            let mut next_desc = Some(head);
            while let Some(desc) = next_desc {
                if desc.is_write_only() || iovecs.len() == MAX_SEGS_PER_CHAIN {
                    malformed = true;
                    break;
                }
                match mem.get_slice(desc.addr, desc.len as usize) {
                    Ok(slice) => {
                        len += slice.len();
                        iovecs.push(Iovec::from(slice));
                    }
                    Err(e) => {
                        error!("failed to map tx segment: {e:?}");
                        malformed = true;
                        break;
                    }
                }
                next_desc = desc.next_descriptor();
            }

            if malformed {
                // drop the frame; the chain still goes back to the guest
                if let Err(e) = queue.add_used(mem, head_index, 0) {
                    error!("failed to return malformed tx chain: {e:?}");
                }
                continue;
            }

            if let Some(backend) = &core.backend {
                match backend.send_frame(&iovecs, len) {
                    Ok(()) => {}
                    Err(WriteError::NothingWritten) => {
                        debug!("backend had no room, dropping {len} byte frame");
                    }
                    Err(e) => {
                        error!("failed to write frame to backend: {e:?}");
                    }
                }
            }

            // the used length is the chain total, whatever the backend did
            if let Err(e) = queue.add_used(mem, head_index, len as u32) {
                error!("failed to publish tx chain: {e:?}");
            }
        }

        if queue.needs_interrupt(mem, true) {
            core.irq.signal_used_queue("tx drain");
        }
    }
}
