// Copyright 2019 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::IoSlice;
use std::marker::PhantomData;

use libc::c_void;
use vm_memory::VolatileSlice;

/// A guest buffer segment in the shape the readv/writev family wants.
#[repr(transparent)]
#[derive(Clone)]
pub struct Iovec<'a> {
    iov: libc::iovec,
    _phantom: PhantomData<&'a ()>,
}

unsafe impl<'a> Send for Iovec<'a> {}
unsafe impl<'a> Sync for Iovec<'a> {}

impl<'a> Iovec<'a> {
    pub fn from_slice(buf: &'a mut [u8]) -> Self {
        Iovec {
            iov: libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut c_void,
                iov_len: buf.len(),
            },
            _phantom: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.iov.iov_len
    }

    pub fn is_empty(&self) -> bool {
        self.iov.iov_len == 0
    }

    pub fn addr(&self) -> *const u8 {
        self.iov.iov_base as *const u8
    }

    pub fn addr_mut(&self) -> *mut u8 {
        self.iov.iov_base as *mut u8
    }

    pub fn advance(&mut self, len: usize) {
        debug_assert!(len <= self.iov.iov_len);
        self.iov.iov_base = unsafe { self.iov.iov_base.add(len) };
        self.iov.iov_len -= len;
    }

    pub fn slice_to_std(iovs: &'a [Iovec<'a>]) -> &'a [IoSlice<'a>] {
        // safe: std IoSlice is guaranteed to be ABI compatible with iovec
        unsafe { std::slice::from_raw_parts(iovs.as_ptr() as *const IoSlice<'a>, iovs.len()) }
    }
}

impl<'a> From<VolatileSlice<'a>> for Iovec<'a> {
    fn from(slice: VolatileSlice<'a>) -> Self {
        Iovec {
            iov: libc::iovec {
                iov_base: slice.ptr_guard_mut().as_ptr() as *mut c_void,
                iov_len: slice.len(),
            },
            _phantom: PhantomData,
        }
    }
}
