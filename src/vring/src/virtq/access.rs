/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Memory Access Traits for Virtqueue Operations
//!
//! This module defines the [`MemOps`] trait that abstracts the shared memory
//! a ring lives in. Addresses are in the peer-visible address space (guest
//! physical, bus address, ...) and it is up to the backend to translate them.
//!
//! [`HeapMem`] is a backend over an owned, page aligned heap region whose
//! addresses are its host virtual addresses. Both the driver and the device
//! half of a ring can share it through an `Arc`.

use alloc::alloc::{Layout as AllocLayout, alloc_zeroed, dealloc};
use alloc::rc::Rc;
use alloc::sync::Arc;
use core::ptr::{self, NonNull};
use core::sync::atomic::{self, AtomicU16, Ordering};

use bytemuck::Pod;
use thiserror::Error;

/// Backend-provided memory access for virtqueue.
///
/// # Memory ordering
///
/// - [`load_acquire`](Self::load_acquire) and [`store_release`](Self::store_release)
///   are used for every 16-bit control field of the ring (indices, flags and
///   event indices). A reader that observes an index published with release
///   also observes every write the publisher made before it.
/// - [`fence`](Self::fence) is a full barrier. It orders a store of our own
///   index against a subsequent load of the peer's suppression field, which
///   acquire/release alone cannot do.
pub trait MemOps {
    type Error;

    /// Read bytes from shared memory.
    ///
    /// Returns the number of bytes read (equal to `dst.len()` on success).
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error>;

    /// Write bytes to shared memory.
    ///
    /// Returns the number of bytes written (equal to `src.len()` on success).
    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error>;

    /// Load a u16 with acquire semantics.
    ///
    /// `addr` must be 2-byte aligned.
    fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error>;

    /// Store a u16 with release semantics.
    ///
    /// `addr` must be 2-byte aligned.
    fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error>;

    /// Full memory barrier.
    fn fence(&self) {
        atomic::fence(Ordering::SeqCst);
    }

    /// Read a Pod type at the given address.
    fn read_val<T: Pod>(&self, addr: u64) -> Result<T, Self::Error> {
        let mut val = T::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut val);

        self.read(addr, bytes)?;
        Ok(val)
    }

    /// Write a Pod type at the given address.
    fn write_val<T: Pod>(&self, addr: u64, val: T) -> Result<(), Self::Error> {
        let bytes = bytemuck::bytes_of(&val);
        self.write(addr, bytes)?;
        Ok(())
    }
}

macro_rules! forward_mem_ops {
    ($($ty:ty),*) => {
        $(
            impl<M: MemOps + ?Sized> MemOps for $ty {
                type Error = M::Error;

                fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
                    (**self).read(addr, dst)
                }

                fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
                    (**self).write(addr, src)
                }

                fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error> {
                    (**self).load_acquire(addr)
                }

                fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error> {
                    (**self).store_release(addr, val)
                }

                fn fence(&self) {
                    (**self).fence()
                }
            }
        )*
    };
}

forward_mem_ops!(&M, Arc<M>, Rc<M>);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    #[error("Access to {len} bytes at {addr:#x} is outside the region")]
    OutOfBounds { addr: u64, len: usize },
    #[error("Misaligned atomic access at {0:#x}")]
    Misaligned(u64),
    #[error("Empty region")]
    EmptyRegion,
    #[error("Failed to allocate {0} bytes")]
    AllocFailed(usize),
}

/// An owned, zero-initialized, page aligned region of shared memory.
///
/// Addresses handed out by [`base_addr`](Self::base_addr) are host virtual
/// addresses. Every access is bounds checked, so a corrupted descriptor can
/// at worst produce a [`MemError`].
#[derive(Debug)]
pub struct HeapMem {
    ptr: NonNull<u8>,
    layout: AllocLayout,
}

// SAFETY: HeapMem owns its allocation and only hands out copies of its
// contents or atomic views of it; concurrent access from several threads is
// the intended use.
unsafe impl Send for HeapMem {}
// SAFETY: see above.
unsafe impl Sync for HeapMem {}

impl HeapMem {
    pub const ALIGN: usize = 4096;

    /// Allocate `len` zeroed bytes.
    pub fn new(len: usize) -> Result<Self, MemError> {
        if len == 0 {
            return Err(MemError::EmptyRegion);
        }

        let layout =
            AllocLayout::from_size_align(len, Self::ALIGN).map_err(|_| MemError::AllocFailed(len))?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(MemError::AllocFailed(len))?;

        Ok(Self { ptr, layout })
    }

    /// Address of the first byte of the region.
    pub fn base_addr(&self) -> u64 {
        self.ptr.as_ptr().addr() as u64
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Translate `[addr, addr + len)` into a pointer derived from the
    /// allocation, preserving provenance.
    fn ptr_for(&self, addr: u64, len: usize) -> Result<*mut u8, MemError> {
        let oob = MemError::OutOfBounds { addr, len };
        let off = addr.checked_sub(self.base_addr()).ok_or(oob)? as usize;
        let end = off.checked_add(len).ok_or(oob)?;
        if end > self.len() {
            return Err(oob);
        }

        Ok(self.ptr.as_ptr().wrapping_add(off))
    }

    fn atomic_for(&self, addr: u64) -> Result<&AtomicU16, MemError> {
        if !addr.is_multiple_of(2) {
            return Err(MemError::Misaligned(addr));
        }

        let ptr = self.ptr_for(addr, 2)?;
        // SAFETY: ptr is in bounds, 2-byte aligned (the allocation is page
        // aligned and addr is even) and lives as long as self.
        Ok(unsafe { AtomicU16::from_ptr(ptr.cast()) })
    }
}

impl Drop for HeapMem {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated in `new` with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl MemOps for HeapMem {
    type Error = MemError;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
        let src = self.ptr_for(addr, dst.len())?;
        // SAFETY: src is valid for dst.len() bytes and dst is a distinct
        // Rust borrow, so the ranges cannot overlap.
        unsafe { ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        Ok(dst.len())
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
        let dst = self.ptr_for(addr, src.len())?;
        // SAFETY: dst is valid for src.len() bytes, see `read`.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(src.len())
    }

    fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error> {
        Ok(self.atomic_for(addr)?.load(Ordering::Acquire))
    }

    fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error> {
        self.atomic_for(addr)?.store(val, Ordering::Release);
        Ok(())
    }
}
