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

//! Virtqueue Descriptor Types
//!
//! This module defines the descriptor format of the split virtqueue. Each
//! descriptor describes one memory buffer of a scatter-gather list that the
//! device will read from or write to. Descriptors are linked into chains by
//! their `next` field.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use super::MemOps;

bitflags! {
    /// Descriptor flags as defined by VIRTIO specification.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DescFlags: u16 {
        /// This marks a buffer as continuing via the next field.
        const NEXT     = 1 << 0;
        /// This marks a buffer as device write-only (otherwise device read-only).
        const WRITE    = 1 << 1;
        /// This means the buffer contains a list of buffer descriptors.
        const INDIRECT = 1 << 2;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct Descriptor {
    /// Address of the buffer in the device-visible address space.
    pub addr: u64,
    /// Length of the buffer in bytes.
    pub len: u32,
    /// Flags (NEXT, WRITE, INDIRECT).
    pub flags: u16,
    /// Index of the next descriptor in the chain when NEXT is set.
    pub next: u16,
}

const _: () = assert!(core::mem::size_of::<Descriptor>() == 16);
const _: () = assert!(Descriptor::ADDR_OFFSET == 0);
const _: () = assert!(Descriptor::LEN_OFFSET == 8);
const _: () = assert!(Descriptor::FLAGS_OFFSET == 12);
const _: () = assert!(Descriptor::NEXT_OFFSET == 14);

impl Descriptor {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const ALIGN: usize = core::mem::align_of::<Self>();

    pub const ADDR_OFFSET: usize = core::mem::offset_of!(Self, addr);
    pub const LEN_OFFSET: usize = core::mem::offset_of!(Self, len);
    pub const FLAGS_OFFSET: usize = core::mem::offset_of!(Self, flags);
    pub const NEXT_OFFSET: usize = core::mem::offset_of!(Self, next);

    pub fn new(addr: u64, len: u32, flags: DescFlags, next: u16) -> Self {
        Self {
            addr,
            len,
            flags: flags.bits(),
            next,
        }
    }

    /// Get flags as a [`DescFlags`] bitfield.
    #[inline]
    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_truncate(self.flags)
    }

    /// Is this descriptor writeable by the device?
    #[inline]
    pub fn is_writeable(&self) -> bool {
        self.flags().contains(DescFlags::WRITE)
    }

    /// Does this descriptor point to a next descriptor in the chain?
    #[inline]
    pub fn is_next(&self) -> bool {
        self.flags().contains(DescFlags::NEXT)
    }

    /// Does this descriptor point to an indirect descriptor table?
    #[inline]
    pub fn is_indirect(&self) -> bool {
        self.flags().contains(DescFlags::INDIRECT)
    }

    /// Read a descriptor from memory.
    ///
    /// Descriptors carry no synchronization of their own; the reader must
    /// have observed the index that published them with acquire semantics.
    pub fn read<M: MemOps>(mem: &M, addr: u64) -> Result<Self, M::Error> {
        mem.read_val(addr)
    }

    /// Write a descriptor to memory.
    ///
    /// The write becomes visible to the device once the available index that
    /// covers it is stored with release semantics.
    pub fn write<M: MemOps>(&self, mem: &M, addr: u64) -> Result<(), M::Error> {
        mem.write_val(addr, *self)
    }
}

/// A table of descriptors stored in shared memory.
///
/// Used both for the ring's descriptor table and for indirect tables.
#[derive(Debug, Clone, Copy)]
pub struct DescTable {
    base_addr: u64,
    size: u16,
}

impl DescTable {
    /// Create a descriptor table view over `size` descriptors at `base_addr`.
    ///
    /// Returns `None` if `base_addr` is not aligned for [`Descriptor`].
    pub fn new(base_addr: u64, size: u16) -> Option<Self> {
        if !base_addr.is_multiple_of(Descriptor::ALIGN as u64) {
            return None;
        }

        Some(Self { base_addr, size })
    }

    /// Get address of descriptor at index or None if idx is out of bounds
    pub fn desc_addr(&self, idx: u16) -> Option<u64> {
        if idx >= self.size {
            return None;
        }

        Some(self.base_addr + (idx as u64 * Descriptor::SIZE as u64))
    }

    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    /// Get number of descriptors in table
    pub fn len(&self) -> u16 {
        self.size
    }

    /// Is the descriptor table empty?
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Size in bytes of a table with `n` descriptors.
    pub const fn size_of(n: u16) -> usize {
        n as usize * Descriptor::SIZE
    }
}
