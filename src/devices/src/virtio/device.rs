// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use tracing::warn;
use vm_memory::GuestMemoryMmap;

use super::queue::Queue;

#[derive(Debug)]
pub enum ActivateError {
    /// The queue at this index has an unusable ring layout.
    BadQueue(usize),
}

pub type ActivateResult = std::result::Result<(), ActivateError>;

pub enum DeviceState {
    Inactive,
    Activated(GuestMemoryMmap),
}

/// Interrupt injection seam installed by the transport; raising the line is
/// how a device tells the guest its ISR status changed.
pub trait InterruptLine: Send + Sync {
    fn raise(&self);
}

/// PCI identity of a virtio function, consumed by the config-space glue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciIdentity {
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u16,
    pub subsystem_vendor_id: u16,
    pub subsystem_device_id: u16,
}

/// The device half of the virtio transport contract. The transport decodes
/// guest register accesses and calls in; the device owns queue semantics and
/// its config space.
pub trait VirtioDevice: Send {
    fn device_type(&self) -> u32;

    fn avail_features(&self) -> u64;

    fn acked_features(&self) -> u64;

    fn set_acked_features(&mut self, acked_features: u64);

    fn avail_features_by_page(&self, page: u32) -> u32 {
        let avail_features = self.avail_features();
        match page {
            0 => avail_features as u32,
            1 => (avail_features >> 32) as u32,
            _ => {
                warn!("read from unknown features page {page}");
                0
            }
        }
    }

    fn ack_features_by_page(&mut self, page: u32, value: u32) {
        let mask = match page {
            0 => u64::from(value),
            1 => u64::from(value) << 32,
            _ => {
                warn!("ack of unknown features page {page}");
                0
            }
        };

        let avail_features = self.avail_features();
        let unrequested = mask & !avail_features;
        if unrequested != 0 {
            warn!("driver acked features the device never offered: 0x{unrequested:x}");
        }

        self.set_acked_features(self.acked_features() | (mask & avail_features));
    }

    fn queues(&self) -> &[Queue];

    fn queues_mut(&mut self) -> &mut [Queue];

    /// Guest wrote the queue-notify register for `queue_index`.
    fn queue_notify(&mut self, queue_index: usize);

    fn read_config(&self, offset: u64, data: &mut [u8]);

    fn write_config(&mut self, offset: u64, data: &[u8]);

    fn interrupt_status(&self) -> Arc<AtomicUsize>;

    fn set_interrupt_line(&mut self, line: Box<dyn InterruptLine>);

    fn activate(&mut self, mem: GuestMemoryMmap) -> ActivateResult;

    fn is_activated(&self) -> bool;

    /// Guest wrote 0 to the device-status register. Returns false if the
    /// device cannot be reset.
    fn reset(&mut self) -> bool {
        false
    }
}

/// Devices that need to quiesce worker threads before the process exits.
pub trait VmmExitObserver {
    fn on_vmm_exit(&mut self) {}
}
