// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

pub mod descriptor_utils;
mod device;
mod irq_signaler;
pub mod net;
pub mod queue;

#[cfg(test)]
pub(crate) mod test_utils;

pub use self::device::{
    ActivateError, ActivateResult, DeviceState, InterruptLine, PciIdentity, VirtioDevice,
    VmmExitObserver,
};
pub use self::irq_signaler::IrqSignaler;
pub use self::queue::Queue;

/// Virtio device type for a network card.
pub const TYPE_NET: u32 = 1;

/// ISR status bit reporting that a virtqueue had buffers published.
pub const VIRTIO_ISR_VRING: usize = 0x1;

/// PCI vendor id owned by the virtio specification.
pub const VIRTIO_PCI_VENDOR_ID: u16 = 0x1af4;

/// Transitional PCI device id of the virtio-net function.
pub const VIRTIO_PCI_DEVICE_ID_NET: u16 = 0x1000;

/// PCI class/subclass for an Ethernet controller.
pub const PCI_CLASS_NETWORK_ETHERNET: u16 = 0x0200;
