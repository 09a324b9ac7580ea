use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use utils::mac::MacAddr;
use utils::Mutex;
use vm_memory::{Address, Bytes, GuestAddress, GuestMemoryMmap};

use super::descriptor_utils::Iovec;
use super::device::InterruptLine;
use super::net::backend::{NetBackend, ReadError, WriteError};
use super::net::{Net, VirtioNetBackend, RX_INDEX, TX_INDEX};
use super::queue::Queue;
use super::VirtioDevice;

pub(crate) fn guest_mem() -> GuestMemoryMmap {
    GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10_0000)]).unwrap()
}

/// Where a test virtqueue's three guest-resident pieces live.
#[derive(Clone, Copy)]
pub(crate) struct RingLayout {
    pub desc: u64,
    pub avail: u64,
    pub used: u64,
    pub size: u16,
}

impl RingLayout {
    pub fn rx() -> Self {
        Self {
            desc: 0x1000,
            avail: 0x2000,
            used: 0x3000,
            size: 16,
        }
    }

    pub fn tx() -> Self {
        Self {
            desc: 0x4000,
            avail: 0x5000,
            used: 0x6000,
            size: 16,
        }
    }

    pub fn configure(&self, queue: &mut Queue) {
        queue.size = self.size;
        queue.ready = true;
        queue.desc_table = GuestAddress(self.desc);
        queue.avail_ring = GuestAddress(self.avail);
        queue.used_ring = GuestAddress(self.used);
    }

    pub fn queue(&self) -> Queue {
        let mut queue = Queue::new(self.size);
        self.configure(&mut queue);
        queue
    }

    pub fn write_desc_at(
        mem: &GuestMemoryMmap,
        table: u64,
        index: u16,
        addr: u64,
        len: u32,
        flags: u16,
        next: u16,
    ) {
        let base = GuestAddress(table + u64::from(index) * 16);
        mem.write_obj(addr, base).unwrap();
        mem.write_obj(len, base.unchecked_add(8)).unwrap();
        mem.write_obj(flags, base.unchecked_add(12)).unwrap();
        mem.write_obj(next, base.unchecked_add(14)).unwrap();
    }

    pub fn write_desc(
        &self,
        mem: &GuestMemoryMmap,
        index: u16,
        addr: u64,
        len: u32,
        flags: u16,
        next: u16,
    ) {
        Self::write_desc_at(mem, self.desc, index, addr, len, flags, next);
    }

    /// Publishes `heads` as the driver would: ring entries first, then the
    /// avail index.
    pub fn publish_avail(&self, mem: &GuestMemoryMmap, heads: &[u16]) {
        for (slot, head) in heads.iter().enumerate() {
            mem.write_obj(
                *head,
                GuestAddress(self.avail + 4 + 2 * slot as u64),
            )
            .unwrap();
        }
        mem.write_obj(heads.len() as u16, GuestAddress(self.avail + 2))
            .unwrap();
    }

    pub fn set_avail_flags(&self, mem: &GuestMemoryMmap, flags: u16) {
        mem.write_obj(flags, GuestAddress(self.avail)).unwrap();
    }

    pub fn used_flags(&self, mem: &GuestMemoryMmap) -> u16 {
        mem.read_obj(GuestAddress(self.used)).unwrap()
    }

    pub fn used_idx(&self, mem: &GuestMemoryMmap) -> u16 {
        mem.read_obj(GuestAddress(self.used + 2)).unwrap()
    }

    pub fn used_elem(&self, mem: &GuestMemoryMmap, slot: u16) -> (u32, u32) {
        let base = GuestAddress(self.used + 4 + 8 * u64::from(slot));
        (
            mem.read_obj(base).unwrap(),
            mem.read_obj(base.unchecked_add(4)).unwrap(),
        )
    }
}

/// Scatter `data` across `iovs`, returning how much fit.
pub(crate) fn iovs_write(iovs: &[Iovec], data: &[u8]) -> usize {
    let mut off = 0;
    for iov in iovs {
        if off == data.len() {
            break;
        }
        let n = std::cmp::min(iov.len(), data.len() - off);
        unsafe { std::ptr::copy_nonoverlapping(data[off..].as_ptr(), iov.addr_mut(), n) };
        off += n;
    }
    off
}

/// Gather up to `len` bytes back out of `iovs`.
pub(crate) fn iovs_read(iovs: &[Iovec], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for iov in iovs {
        if out.len() == len {
            break;
        }
        let n = std::cmp::min(iov.len(), len - out.len());
        let start = out.len();
        out.resize(start + n, 0);
        unsafe { std::ptr::copy_nonoverlapping(iov.addr(), out[start..].as_mut_ptr(), n) };
    }
    out
}

pub(crate) struct MockState {
    /// Frames (without vnet header) the backend will deliver, in order.
    pub rx_frames: VecDeque<Vec<u8>>,
    /// Fail the next receive with an internal error.
    pub rx_error: bool,
    /// Full frames observed on send, vnet header included.
    pub sent: Vec<Vec<u8>>,
    /// (segment count, total length) per observed send.
    pub sent_meta: Vec<(usize, usize)>,
    /// Header length prepended on receive; follows negotiation.
    pub vhdr_len: usize,
    /// What the device propagated at feature negotiation.
    pub negotiated: Option<(u64, usize)>,
}

struct SendGate {
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

pub(crate) struct MockBackend {
    features: u64,
    state: Arc<Mutex<MockState>>,
    gate: Option<SendGate>,
}

impl MockBackend {
    fn build(features: u64, gate: Option<SendGate>) -> (Self, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState {
            rx_frames: VecDeque::new(),
            rx_error: false,
            sent: Vec::new(),
            sent_meta: Vec::new(),
            vhdr_len: 12,
            negotiated: None,
        }));
        (
            Self {
                features,
                state: state.clone(),
                gate,
            },
            state,
        )
    }

    pub fn new() -> (Self, Arc<Mutex<MockState>>) {
        Self::build(0, None)
    }

    pub fn with_features(features: u64) -> (Self, Arc<Mutex<MockState>>) {
        Self::build(features, None)
    }

    /// A backend whose sends block: each send reports itself on the returned
    /// receiver and stalls until the returned sender fires.
    pub fn gated() -> (
        Self,
        Arc<Mutex<MockState>>,
        mpsc::Receiver<()>,
        mpsc::Sender<()>,
    ) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let gate = SendGate {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };
        let (backend, state) = Self::build(0, Some(gate));
        (backend, state, entered_rx, release_tx)
    }
}

impl NetBackend for MockBackend {
    fn features(&self) -> u64 {
        self.features
    }

    fn negotiate_features(&self, features: u64, vhdr_len: usize) {
        let mut state = self.state.lock();
        state.vhdr_len = vhdr_len;
        state.negotiated = Some((features, vhdr_len));
    }

    fn send_frame(&self, iovs: &[Iovec], len: usize) -> Result<(), WriteError> {
        let bytes = iovs_read(iovs, len);
        {
            let mut state = self.state.lock();
            state.sent.push(bytes);
            state.sent_meta.push((iovs.len(), len));
        }
        if let Some(gate) = &self.gate {
            gate.entered.lock().send(()).ok();
            gate.release.lock().recv().ok();
        }
        Ok(())
    }

    fn recv_frame(&self, iovs: &[Iovec]) -> Result<usize, ReadError> {
        let mut state = self.state.lock();
        if state.rx_error {
            state.rx_error = false;
            return Err(ReadError::Internal(nix::errno::Errno::EIO));
        }
        let Some(frame) = state.rx_frames.pop_front() else {
            return Err(ReadError::NothingRead);
        };
        let mut bytes = vec![0u8; state.vhdr_len];
        bytes.extend_from_slice(&frame);
        Ok(iovs_write(iovs, &bytes))
    }
}

/// Interrupt line that only counts how often it was raised.
pub(crate) struct CountingLine(pub Arc<AtomicUsize>);

impl InterruptLine for CountingLine {
    fn raise(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct TestNet {
    pub net: Net,
    pub mem: GuestMemoryMmap,
    pub state: Arc<Mutex<MockState>>,
    pub irqs: Arc<AtomicUsize>,
}

impl TestNet {
    pub fn mem_write(&self, addr: u64, data: &[u8]) {
        self.mem.write_slice(data, GuestAddress(addr)).unwrap();
    }

    pub fn mem_read(&self, addr: u64, data: &mut [u8]) {
        self.mem.read_slice(data, GuestAddress(addr)).unwrap();
    }
}

fn build_net(
    backend: MockBackend,
    state: Arc<Mutex<MockState>>,
    features_page0: u32,
) -> TestNet {
    let mem = guest_mem();
    let irqs = Arc::new(AtomicUsize::new(0));

    let mut net = Net::new(
        "net-test".to_string(),
        VirtioNetBackend::Attached(Box::new(backend)),
        MacAddr([0x52, 0x54, 0, 0, 0, 1]),
    );
    net.set_interrupt_line(Box::new(CountingLine(irqs.clone())));
    net.ack_features_by_page(0, features_page0);

    RingLayout::rx().configure(&mut net.queues_mut()[RX_INDEX]);
    RingLayout::tx().configure(&mut net.queues_mut()[TX_INDEX]);
    net.activate(mem.clone()).unwrap();

    TestNet {
        net,
        mem,
        state,
        irqs,
    }
}

/// A device with a mock backend, features acked, both rings configured and
/// activated; the TX worker is parked.
pub(crate) fn activated_net(features_page0: u32) -> TestNet {
    let (backend, state) = MockBackend::new();
    build_net(backend, state, features_page0)
}

/// Like [`activated_net`] but sends block on a gate, so a test can hold the
/// worker inside the backend.
pub(crate) fn activated_net_gated(
    features_page0: u32,
) -> (TestNet, mpsc::Receiver<()>, mpsc::Sender<()>) {
    let (backend, state, entered, release) = MockBackend::gated();
    (build_net(backend, state, features_page0), entered, release)
}

/// Polls `cond` until it holds or two seconds pass.
pub(crate) fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("timed out waiting for {what}");
}
