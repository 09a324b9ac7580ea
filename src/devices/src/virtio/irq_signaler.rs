use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use super::device::InterruptLine;
use super::VIRTIO_ISR_VRING;

/// Fans a used-ring publication out to the transport: the ISR status bit is
/// set first, then whatever interrupt line the transport installed is raised.
pub struct IrqSignaler {
    interrupt_status: Arc<AtomicUsize>,
    line: ArcSwapOption<Box<dyn InterruptLine>>,
}

impl IrqSignaler {
    pub fn new() -> IrqSignaler {
        Self {
            interrupt_status: Arc::new(AtomicUsize::new(0)),
            line: ArcSwapOption::empty(),
        }
    }

    pub fn interrupt_status(&self) -> Arc<AtomicUsize> {
        self.interrupt_status.clone()
    }

    pub fn set_line(&self, line: Box<dyn InterruptLine>) {
        self.line.store(Some(Arc::new(line)));
    }

    pub fn signal_used_queue(&self, reason: &str) {
        tracing::trace!("signal used queue because '{reason}'");

        self.interrupt_status
            .fetch_or(VIRTIO_ISR_VRING, Ordering::SeqCst);
        if let Some(line) = &*self.line.load() {
            line.raise();
        }
    }
}

impl Default for IrqSignaler {
    fn default() -> Self {
        Self::new()
    }
}
