// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

use std::cmp;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error};
use utils::mac::MacAddr;
use utils::{Condvar, Mutex};
use virtio_bindings::virtio_config::VIRTIO_F_NOTIFY_ON_EMPTY;
use virtio_bindings::virtio_net::{
    virtio_net_hdr, virtio_net_hdr_v1, VIRTIO_NET_F_MAC, VIRTIO_NET_F_MRG_RXBUF,
    VIRTIO_NET_F_STATUS,
};
use virtio_bindings::virtio_ring::VIRTIO_RING_F_INDIRECT_DESC;
use vm_memory::{ByteValued, GuestMemoryMmap};

use crate::virtio::irq_signaler::IrqSignaler;
use crate::virtio::queue::Queue;
use crate::virtio::{
    ActivateError, ActivateResult, DeviceState, InterruptLine, PciIdentity, VirtioDevice,
    VmmExitObserver, PCI_CLASS_NETWORK_ETHERNET, TYPE_NET, VIRTIO_PCI_DEVICE_ID_NET,
    VIRTIO_PCI_VENDOR_ID,
};

use super::backend::NetBackend;
use super::rx::RxHandle;
use super::worker::TxWorker;
use super::{QUEUE_SIZES, RX_INDEX, TX_INDEX};

/// Size of the per-device scratch buffer frames are dropped into while the
/// guest's RX ring is unusable: a full 64K TSO payload plus headroom for the
/// vnet header and Ethernet framing.
pub(crate) const RX_DISCARD_BUF_LEN: usize = 65_600;

/// How often reset re-checks whether the TX worker finished its batch.
const TX_QUIESCE_POLL: Duration = Duration::from_millis(10);

pub(crate) fn mergeable_vnet_hdr_len() -> usize {
    std::mem::size_of::<virtio_net_hdr_v1>()
}

pub(crate) fn legacy_vnet_hdr_len() -> usize {
    std::mem::size_of::<virtio_net_hdr>()
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C, packed)]
struct VirtioNetConfig {
    mac: [u8; 6],
    status: u16,
    max_virtqueue_pairs: u16,
}

// Safe because it only has data and has no implicit padding.
unsafe impl ByteValued for VirtioNetConfig {}

/// How the device was attached to the host network at init time.
pub enum VirtioNetBackend {
    /// No backend was requested; the link reports up but carries no traffic.
    None,
    /// The requested backend opened successfully.
    Attached(Box<dyn NetBackend>),
    /// The requested backend failed to open; the device stays link-down.
    Failed,
}

/// A ring bound to guest memory, the form the data paths work on.
pub(crate) struct RingBinding {
    pub(crate) queue: Queue,
    pub(crate) mem: GuestMemoryMmap,
}

pub(crate) struct TxState {
    pub(crate) ring: Option<RingBinding>,
    pub(crate) in_progress: bool,
    pub(crate) shutdown: bool,
}

pub(crate) struct RxState {
    pub(crate) ring: Option<RingBinding>,
    pub(crate) ready: bool,
    pub(crate) merge: bool,
    pub(crate) vhdr_len: usize,
    pub(crate) discard_buf: Box<[u8]>,
}

/// State shared between the control plane, the TX worker and the RX entry.
pub(crate) struct NetCore {
    pub(crate) tx: Mutex<TxState>,
    pub(crate) tx_cond: Condvar,
    pub(crate) rx: Mutex<RxState>,
    pub(crate) resetting: AtomicBool,
    pub(crate) backend: Option<Box<dyn NetBackend>>,
    pub(crate) irq: IrqSignaler,
}

pub struct Net {
    id: String,
    pub(crate) core: Arc<NetCore>,

    avail_features: u64,
    acked_features: u64,

    queues: Vec<Queue>,
    config: VirtioNetConfig,

    device_state: DeviceState,
    worker_thread: Option<JoinHandle<()>>,
}

impl Net {
    /// Create a new virtio network device over the given backend state and
    /// spawn its TX worker, parked until the first kick.
    pub fn new(id: String, cfg_backend: VirtioNetBackend, mac: MacAddr) -> Net {
        let (backend, link_up) = match cfg_backend {
            VirtioNetBackend::None => (None, true),
            VirtioNetBackend::Attached(backend) => (Some(backend), true),
            VirtioNetBackend::Failed => (None, false),
        };

        let mut avail_features = (1u64 << VIRTIO_NET_F_MAC)
            | (1 << VIRTIO_NET_F_STATUS)
            | (1 << VIRTIO_F_NOTIFY_ON_EMPTY)
            | (1 << VIRTIO_RING_F_INDIRECT_DESC);
        if let Some(backend) = &backend {
            avail_features |= backend.features();
        }

        let queues = QUEUE_SIZES.iter().map(|&s| Queue::new(s)).collect();

        let config = VirtioNetConfig {
            mac: mac.bytes(),
            status: link_up as u16,
            max_virtqueue_pairs: 0,
        };

        let core = Arc::new(NetCore {
            tx: Mutex::new(TxState {
                ring: None,
                in_progress: false,
                shutdown: false,
            }),
            tx_cond: Condvar::new(),
            rx: Mutex::new(RxState {
                ring: None,
                ready: false,
                merge: true,
                vhdr_len: mergeable_vnet_hdr_len(),
                discard_buf: vec![0u8; RX_DISCARD_BUF_LEN].into_boxed_slice(),
            }),
            resetting: AtomicBool::new(false),
            backend,
            irq: IrqSignaler::new(),
        });

        let worker_thread = Some(TxWorker::new(core.clone()).run());

        Net {
            id,
            core,
            avail_features,
            acked_features: 0,
            queues,
            config,
            device_state: DeviceState::Inactive,
            worker_thread,
        }
    }

    /// Provides the ID of this net device.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Typed entry the event loop invokes when the backend fd turns readable.
    pub fn rx_handle(&self) -> RxHandle {
        RxHandle::new(self.core.clone())
    }

    /// PCI identity the config-space glue advertises for this device.
    pub fn pci_identity() -> PciIdentity {
        PciIdentity {
            vendor_id: VIRTIO_PCI_VENDOR_ID,
            device_id: VIRTIO_PCI_DEVICE_ID_NET,
            class: PCI_CLASS_NETWORK_ETHERNET,
            subsystem_vendor_id: VIRTIO_PCI_VENDOR_ID,
            subsystem_device_id: TYPE_NET as u16,
        }
    }

    // The first kick marks the ring live; from then on the backend-readable
    // callback is authoritative and further kicks are no-ops.
    fn ping_rxq(&mut self) {
        let mut rx = self.core.rx.lock();
        let rx = &mut *rx;
        if rx.ready {
            return;
        }
        if let Some(ring) = rx.ring.as_mut() {
            if let Err(e) = ring.queue.disable_notification(&ring.mem) {
                error!("failed to suppress rx kicks: {e:?}");
            }
            rx.ready = true;
        }
    }

    // Hand the ring to the worker; no I/O happens on the vCPU thread.
    fn ping_txq(&mut self) {
        let core = &self.core;
        let mut tx = core.tx.lock();
        let tx = &mut *tx;
        let Some(ring) = tx.ring.as_mut() else {
            return;
        };
        if ring.queue.is_empty(&ring.mem) {
            // spurious kick
            return;
        }
        if let Err(e) = ring.queue.disable_notification(&ring.mem) {
            error!("failed to suppress tx kicks: {e:?}");
        }
        if !tx.in_progress {
            core.tx_cond.notify_one();
        }
    }
}

impl VirtioDevice for Net {
    fn device_type(&self) -> u32 {
        TYPE_NET
    }

    fn avail_features(&self) -> u64 {
        self.avail_features
    }

    fn acked_features(&self) -> u64 {
        self.acked_features
    }

    fn set_acked_features(&mut self, acked_features: u64) {
        self.acked_features = acked_features;

        let vhdr_len = {
            let mut rx = self.core.rx.lock();
            rx.merge = acked_features & (1 << VIRTIO_NET_F_MRG_RXBUF) != 0;
            rx.vhdr_len = if rx.merge {
                mergeable_vnet_hdr_len()
            } else {
                legacy_vnet_hdr_len()
            };
            rx.vhdr_len
        };

        if let Some(backend) = &self.core.backend {
            backend.negotiate_features(acked_features, vhdr_len);
        }
    }

    fn queues(&self) -> &[Queue] {
        &self.queues
    }

    fn queues_mut(&mut self) -> &mut [Queue] {
        &mut self.queues
    }

    fn queue_notify(&mut self, queue_index: usize) {
        match queue_index {
            RX_INDEX => self.ping_rxq(),
            TX_INDEX => self.ping_txq(),
            _ => debug!("kick on unknown queue {queue_index}"),
        }
    }

    fn read_config(&self, offset: u64, mut data: &mut [u8]) {
        let config_slice = self.config.as_slice();
        let config_len = config_slice.len() as u64;
        if offset >= config_len {
            error!("failed to read config space");
            return;
        }
        if let Some(end) = offset.checked_add(data.len() as u64) {
            // This write can't fail, offset and end are checked against config_len.
            data.write_all(&config_slice[offset as usize..cmp::min(end, config_len) as usize])
                .unwrap();
        }
    }

    fn write_config(&mut self, offset: u64, data: &[u8]) {
        // the driver may overwrite its MAC; everything else is read-only
        let mac_len = self.config.mac.len() as u64;
        if let Some(end) = offset.checked_add(data.len() as u64) {
            if end <= mac_len {
                self.config.mac[offset as usize..end as usize].copy_from_slice(data);
                return;
            }
        }
        debug!(
            "ignoring write to read-only config bytes (offset={:x}, len={:x})",
            offset,
            data.len()
        );
    }

    fn interrupt_status(&self) -> Arc<AtomicUsize> {
        self.core.irq.interrupt_status()
    }

    fn set_interrupt_line(&mut self, line: Box<dyn InterruptLine>) {
        self.core.irq.set_line(line);
    }

    fn activate(&mut self, mem: GuestMemoryMmap) -> ActivateResult {
        let notify_on_empty = self.acked_features & (1 << VIRTIO_F_NOTIFY_ON_EMPTY) != 0;
        for queue in self.queues.iter_mut() {
            queue.set_notify_on_empty(notify_on_empty);
        }
        for (index, queue) in self.queues.iter().enumerate() {
            if !queue.is_valid(&mem) {
                return Err(ActivateError::BadQueue(index));
            }
        }

        {
            let mut rx = self.core.rx.lock();
            rx.ring = Some(RingBinding {
                queue: self.queues[RX_INDEX].clone(),
                mem: mem.clone(),
            });
        }
        {
            let mut tx = self.core.tx.lock();
            tx.ring = Some(RingBinding {
                queue: self.queues[TX_INDEX].clone(),
                mem: mem.clone(),
            });
        }

        self.device_state = DeviceState::Activated(mem);
        Ok(())
    }

    fn is_activated(&self) -> bool {
        match self.device_state {
            DeviceState::Inactive => false,
            DeviceState::Activated(_) => true,
        }
    }

    fn reset(&mut self) -> bool {
        let core = &self.core;
        core.resetting.store(true, Ordering::SeqCst);

        // Wait out an in-flight TX batch; the worker re-checks the flag per
        // chain and parks once it sees it.
        {
            let mut tx = core.tx.lock();
            while tx.in_progress {
                drop(tx);
                std::thread::sleep(TX_QUIESCE_POLL);
                tx = core.tx.lock();
            }
            tx.ring = None;
        }

        // RX work is bounded and runs entirely under this lock; holding it
        // once proves the callback has drained out.
        {
            let mut rx = core.rx.lock();
            rx.ring = None;
            rx.ready = false;
            rx.merge = true;
            rx.vhdr_len = mergeable_vnet_hdr_len();
        }

        self.acked_features = 0;
        for queue in self.queues.iter_mut() {
            *queue = Queue::new(queue.get_max_size());
        }
        self.device_state = DeviceState::Inactive;

        core.resetting.store(false, Ordering::SeqCst);
        true
    }
}

impl VmmExitObserver for Net {
    fn on_vmm_exit(&mut self) {
        debug!("shutting down net {}", self.id);
        {
            let mut tx = self.core.tx.lock();
            tx.shutdown = true;
            self.core.tx_cond.notify_one();
        }
        if let Some(thread) = self.worker_thread.take() {
            let _ = thread.join();
        }
        debug!("net {} worker joined", self.id);
    }
}

impl Drop for Net {
    fn drop(&mut self) {
        self.on_vmm_exit();
    }
}
