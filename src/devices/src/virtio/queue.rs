// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

use std::num::Wrapping;
use std::sync::atomic::{fence, Ordering};

use tracing::{error, warn};
use virtio_bindings::virtio_ring::{
    VRING_AVAIL_F_NO_INTERRUPT, VRING_DESC_F_INDIRECT, VRING_DESC_F_NEXT, VRING_DESC_F_WRITE,
    VRING_USED_F_NO_NOTIFY,
};
use vm_memory::{Address, ByteValued, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

pub(crate) const VIRTQ_DESC_LEN: u64 = 16;

#[derive(Debug)]
pub enum Error {
    /// A published descriptor index does not fit the ring.
    DescIndexOutOfBounds(u16),
    GuestMemory(vm_memory::GuestMemoryError),
}

/// A descriptor table entry, as laid out in guest memory.
#[repr(C)]
#[derive(Default, Clone, Copy)]
struct Descriptor {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

// Safe because it only contains plain data.
unsafe impl ByteValued for Descriptor {}

/// A walk through one guest I/O request: the head descriptor plus however
/// many `VRING_DESC_F_NEXT` links follow it, possibly through one level of
/// indirection.
pub struct DescriptorChain<'a> {
    mem: &'a GuestMemoryMmap,
    desc_table: GuestAddress,
    table_size: u16,
    ttl: u16,

    /// Head index of this chain in the queue's descriptor table; this is the
    /// id that goes back onto the used ring.
    pub index: u16,

    pub addr: GuestAddress,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl<'a> DescriptorChain<'a> {
    fn read_new(
        mem: &'a GuestMemoryMmap,
        desc_table: GuestAddress,
        table_size: u16,
        ttl: u16,
        index: u16,
        head_index: u16,
        allow_indirect: bool,
    ) -> Option<DescriptorChain<'a>> {
        if index >= table_size {
            return None;
        }

        let desc_addr = desc_table.checked_add(u64::from(index) * VIRTQ_DESC_LEN)?;
        let desc: Descriptor = mem.read_obj(desc_addr).ok()?;

        if u32::from(desc.flags) & VRING_DESC_F_INDIRECT != 0 {
            if !allow_indirect {
                warn!("nested or mid-chain indirect descriptor, truncating chain");
                return None;
            }
            return Self::read_indirect(mem, &desc, head_index);
        }

        let chain = DescriptorChain {
            mem,
            desc_table,
            table_size,
            ttl,
            index: head_index,
            addr: GuestAddress(desc.addr),
            len: desc.len,
            flags: desc.flags,
            next: desc.next,
        };
        chain.is_valid().then_some(chain)
    }

    // One level only: an indirect table replaces the chain's view of the
    // descriptor table, entry 0 becomes the head.
    fn read_indirect(
        mem: &'a GuestMemoryMmap,
        desc: &Descriptor,
        head_index: u16,
    ) -> Option<DescriptorChain<'a>> {
        if desc.len == 0
            || u64::from(desc.len) % VIRTQ_DESC_LEN != 0
            || u64::from(desc.len) / VIRTQ_DESC_LEN > u64::from(u16::MAX)
        {
            warn!("indirect descriptor table has bogus length {}", desc.len);
            return None;
        }
        let table_size = (u64::from(desc.len) / VIRTQ_DESC_LEN) as u16;
        Self::read_new(
            mem,
            GuestAddress(desc.addr),
            table_size,
            table_size,
            0,
            head_index,
            false,
        )
    }

    fn is_valid(&self) -> bool {
        self.mem.check_range(self.addr, self.len as usize)
    }

    pub fn is_write_only(&self) -> bool {
        u32::from(self.flags) & VRING_DESC_F_WRITE != 0
    }

    pub fn has_next(&self) -> bool {
        u32::from(self.flags) & VRING_DESC_F_NEXT != 0 && self.ttl > 1
    }

    /// The descriptor this one links to, if any. `ttl` bounds the walk so a
    /// looping chain cannot spin us forever.
    pub fn next_descriptor(&self) -> Option<DescriptorChain<'a>> {
        if !self.has_next() {
            return None;
        }
        Self::read_new(
            self.mem,
            self.desc_table,
            self.table_size,
            self.ttl - 1,
            self.next,
            self.index,
            false,
        )
    }
}

/// A guest-resident virtqueue in the legacy split layout. The handle lives
/// device-side; the descriptor table and both rings live in guest memory and
/// every access goes through the memory model.
#[derive(Clone, Debug)]
pub struct Queue {
    max_size: u16,

    /// Queue size negotiated by the driver.
    pub size: u16,
    pub ready: bool,
    pub desc_table: GuestAddress,
    pub avail_ring: GuestAddress,
    pub used_ring: GuestAddress,

    pub(crate) next_avail: Wrapping<u16>,
    pub(crate) next_used: Wrapping<u16>,

    // Used index as of the last interrupt decision.
    signalled_used: Wrapping<u16>,
    notify_on_empty: bool,
}

impl Queue {
    pub fn new(max_size: u16) -> Queue {
        Queue {
            max_size,
            size: max_size,
            ready: false,
            desc_table: GuestAddress(0),
            avail_ring: GuestAddress(0),
            used_ring: GuestAddress(0),
            next_avail: Wrapping(0),
            next_used: Wrapping(0),
            signalled_used: Wrapping(0),
            notify_on_empty: false,
        }
    }

    pub fn get_max_size(&self) -> u16 {
        self.max_size
    }

    pub fn actual_size(&self) -> u16 {
        std::cmp::min(self.size, self.max_size)
    }

    /// Whether draining the ring to empty should interrupt the guest.
    pub fn set_notify_on_empty(&mut self, notify_on_empty: bool) {
        self.notify_on_empty = notify_on_empty;
    }

    pub fn is_valid(&self, mem: &GuestMemoryMmap) -> bool {
        let size = u64::from(self.actual_size());
        let desc_table = self.desc_table;
        let avail_ring = self.avail_ring;
        let used_ring = self.used_ring;
        let desc_table_size = VIRTQ_DESC_LEN * size;
        let avail_ring_size = 6 + 2 * size;
        let used_ring_size = 6 + 8 * size;

        if !self.ready {
            error!("attempt to use virtio queue that is not marked ready");
            false
        } else if self.size > self.max_size || self.size == 0 || (self.size & (self.size - 1)) != 0
        {
            error!("virtio queue with invalid size: {}", self.size);
            false
        } else if desc_table.raw_value() & 0xf != 0 {
            error!("virtio queue descriptor table breaks alignment constraints");
            false
        } else if avail_ring.raw_value() & 0x1 != 0 {
            error!("virtio queue available ring breaks alignment constraints");
            false
        } else if used_ring.raw_value() & 0x3 != 0 {
            error!("virtio queue used ring breaks alignment constraints");
            false
        } else if !mem.check_range(desc_table, desc_table_size as usize) {
            error!(
                "virtio queue descriptor table goes out of bounds: start:0x{:08x} size:0x{:08x}",
                desc_table.raw_value(),
                desc_table_size
            );
            false
        } else if !mem.check_range(avail_ring, avail_ring_size as usize) {
            error!(
                "virtio queue available ring goes out of bounds: start:0x{:08x} size:0x{:08x}",
                avail_ring.raw_value(),
                avail_ring_size
            );
            false
        } else if !mem.check_range(used_ring, used_ring_size as usize) {
            error!(
                "virtio queue used ring goes out of bounds: start:0x{:08x} size:0x{:08x}",
                used_ring.raw_value(),
                used_ring_size
            );
            false
        } else {
            true
        }
    }

    fn avail_idx(&self, mem: &GuestMemoryMmap) -> Wrapping<u16> {
        let addr = self.avail_ring.unchecked_add(2);
        Wrapping(mem.read_obj::<u16>(addr).unwrap_or_else(|e| {
            error!("failed to read avail index: {e}");
            self.next_avail.0
        }))
    }

    /// Number of chains the driver has published and we have not fetched.
    pub fn len(&self, mem: &GuestMemoryMmap) -> u16 {
        (self.avail_idx(mem) - self.next_avail).0
    }

    pub fn is_empty(&self, mem: &GuestMemoryMmap) -> bool {
        self.len(mem) == 0
    }

    /// Fetches the next available descriptor chain. Unusable heads are
    /// published back with length 0 and skipped, so a hostile driver cannot
    /// wedge the ring in a state where it is non-empty yet yields nothing.
    pub fn pop<'a>(&mut self, mem: &'a GuestMemoryMmap) -> Option<DescriptorChain<'a>> {
        loop {
            if self.len(mem) == 0 {
                return None;
            }

            let idx = self.next_avail.0 % self.actual_size();
            let head_addr = self.avail_ring.unchecked_add(4 + u64::from(idx) * 2);
            let head: u16 = match mem.read_obj(head_addr) {
                Ok(head) => head,
                Err(e) => {
                    error!("failed to read available ring entry: {e}");
                    return None;
                }
            };
            self.next_avail += Wrapping(1);

            match DescriptorChain::read_new(
                mem,
                self.desc_table,
                self.actual_size(),
                self.actual_size(),
                head,
                head,
                true,
            ) {
                Some(chain) => return Some(chain),
                None => {
                    error!("driver published unusable descriptor chain at head {head}");
                    if head < self.actual_size() {
                        if let Err(e) = self.add_used(mem, head, 0) {
                            error!("failed to return unusable chain: {e:?}");
                        }
                    }
                }
            }
        }
    }

    /// Returns the most recently popped chain to the available side; the next
    /// `pop` fetches it again.
    pub fn undo_pop(&mut self) {
        self.next_avail -= Wrapping(1);
    }

    /// Publishes a chain to the used ring with the number of bytes written.
    pub fn add_used(
        &mut self,
        mem: &GuestMemoryMmap,
        desc_index: u16,
        len: u32,
    ) -> Result<(), Error> {
        if desc_index >= self.actual_size() {
            return Err(Error::DescIndexOutOfBounds(desc_index));
        }

        let slot = self.next_used.0 % self.actual_size();
        let elem_addr = self.used_ring.unchecked_add(4 + u64::from(slot) * 8);
        mem.write_obj(u32::from(desc_index), elem_addr)
            .map_err(Error::GuestMemory)?;
        mem.write_obj(len, elem_addr.unchecked_add(4))
            .map_err(Error::GuestMemory)?;

        self.next_used += Wrapping(1);

        // The element must land before the index moves.
        fence(Ordering::Release);

        mem.write_obj(self.next_used.0, self.used_ring.unchecked_add(2))
            .map_err(Error::GuestMemory)
    }

    /// Tells the driver to stop kicking while a drain is in flight.
    pub fn disable_notification(&mut self, mem: &GuestMemoryMmap) -> Result<(), Error> {
        mem.write_obj(VRING_USED_F_NO_NOTIFY as u16, self.used_ring)
            .map_err(Error::GuestMemory)
    }

    /// Reopens the kick window and reports whether work raced in while it was
    /// closed. The fence between the flag write and the avail re-read is what
    /// keeps a kick issued in that window from being lost.
    pub fn enable_notification(&mut self, mem: &GuestMemoryMmap) -> Result<bool, Error> {
        mem.write_obj(0u16, self.used_ring)
            .map_err(Error::GuestMemory)?;

        fence(Ordering::SeqCst);

        Ok(!self.is_empty(mem))
    }

    /// End-of-batch interrupt decision: fire when the used index moved since
    /// the last decision and the driver did not suppress interrupts, or when
    /// the avail ring was fully drained and `NOTIFY_ON_EMPTY` is on.
    pub fn needs_interrupt(&mut self, mem: &GuestMemoryMmap, used_all_avail: bool) -> bool {
        let old_idx = self.signalled_used;
        self.signalled_used = self.next_used;

        if used_all_avail && self.notify_on_empty {
            return true;
        }

        fence(Ordering::SeqCst);

        let flags: u16 = mem.read_obj(self.avail_ring).unwrap_or(0);
        self.next_used != old_idx && u32::from(flags) & VRING_AVAIL_F_NO_INTERRUPT == 0
    }
}
