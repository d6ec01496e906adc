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

//! Split Virtqueue Ring Implementation
//!
//! A split virtqueue is three areas in shared memory:
//!
//! ```text
//!  Descriptor table (driver writes)       Available ring (driver writes)
//! ┌──────┬─────┬───────┬──────┐         ┌───────┬─────┬─────────────┬────────────┐
//! │ addr │ len │ flags │ next │ x N     │ flags │ idx │ ring[N] u16 │ used_event │
//! └──────┴─────┴───────┴──────┘         └───────┴─────┴─────────────┴────────────┘
//!
//!  Used ring (device writes)
//! ┌───────┬─────┬───────────────────────────┬─────────────┐
//! │ flags │ idx │ ring[N] { id u32, len u32 } │ avail_event │
//! └───────┴─────┴───────────────────────────┴─────────────┘
//! ```
//!
//! `avail.idx` and `used.idx` are free running 16-bit counters. The slot for
//! counter value `i` is `i & (N - 1)`, and `idx - last_seen` (wrapping) is the
//! number of entries published since `last_seen`.
//!
//! # Ordering
//!
//! - The driver writes descriptors and the available slot, then stores
//!   `avail.idx` with release semantics.
//! - The device writes the used element, then stores `used.idx` with release
//!   semantics.
//! - Readers load the index with acquire semantics before reading the entries
//!   it covers.
//!
//! The driver never writes the used ring and the device never writes the
//! descriptor table or the available ring after initialization.
//!
//! # Event Suppression
//!
//! Without `VIRTIO_F_EVENT_IDX` each side sets a flag in its own ring header
//! asking the other not to signal. With it, each side instead writes the index
//! at which it next wants to be signalled into the trailing event field of its
//! own ring (`used_event` lives in the available ring, `avail_event` in the used
//! ring). See [`ring_need_event`].

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use super::desc::{DescTable, Descriptor};
use super::{Layout, MemOps};

bitflags! {
    /// Flags of the available ring header, written by the driver.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AvailFlags: u16 {
        /// The driver does not want to be interrupted for used buffers.
        const NO_INTERRUPT = 1;
    }
}

bitflags! {
    /// Flags of the used ring header, written by the device.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct UsedFlags: u16 {
        /// The device does not want to be notified of available buffers.
        const NO_NOTIFY = 1;
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("Invalid memory layout")]
    InvalidLayout,
    #[error("Queue size {0} is not a power of two between 1 and 32768")]
    InvalidQueueSize(u16),
    #[error("Descriptor index {0} out of range")]
    IndexOutOfRange(u16),
    #[error("Backend memory error")]
    MemError,
}

/// One entry of the used ring.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct UsedElem {
    /// Head of the completed descriptor chain.
    pub id: u32,
    /// Number of bytes the device wrote into the writable part of the chain.
    pub len: u32,
}

const _: () = assert!(core::mem::size_of::<UsedElem>() == 8);

/// Address arithmetic for the available ring.
#[derive(Debug, Clone, Copy)]
pub struct AvailRing {
    addr: u64,
    size: u16,
}

impl AvailRing {
    pub const FLAGS_OFFSET: u64 = 0;
    pub const IDX_OFFSET: u64 = 2;
    pub const RING_OFFSET: u64 = 4;
    pub const ENTRY_SIZE: u64 = 2;
    pub const ALIGN: usize = 2;

    pub fn new(addr: u64, size: u16) -> Self {
        Self { addr, size }
    }

    /// Bytes needed for a ring of `n` entries, including `used_event`.
    pub const fn size_of(n: u16) -> usize {
        (Self::RING_OFFSET + Self::ENTRY_SIZE * n as u64 + 2) as usize
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn flags_addr(&self) -> u64 {
        self.addr + Self::FLAGS_OFFSET
    }

    pub fn idx_addr(&self) -> u64 {
        self.addr + Self::IDX_OFFSET
    }

    /// Address of the slot for free running counter value `idx`.
    pub fn slot_addr(&self, idx: u16) -> u64 {
        let slot = idx & (self.size - 1);
        self.addr + Self::RING_OFFSET + Self::ENTRY_SIZE * slot as u64
    }

    pub fn used_event_addr(&self) -> u64 {
        self.addr + Self::RING_OFFSET + Self::ENTRY_SIZE * self.size as u64
    }
}

/// Address arithmetic for the used ring.
#[derive(Debug, Clone, Copy)]
pub struct UsedRing {
    addr: u64,
    size: u16,
}

impl UsedRing {
    pub const FLAGS_OFFSET: u64 = 0;
    pub const IDX_OFFSET: u64 = 2;
    pub const RING_OFFSET: u64 = 4;
    pub const ENTRY_SIZE: u64 = core::mem::size_of::<UsedElem>() as u64;
    pub const ALIGN: usize = 4;

    pub fn new(addr: u64, size: u16) -> Self {
        Self { addr, size }
    }

    /// Bytes needed for a ring of `n` entries, including `avail_event`.
    pub const fn size_of(n: u16) -> usize {
        (Self::RING_OFFSET + Self::ENTRY_SIZE * n as u64 + 2) as usize
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn flags_addr(&self) -> u64 {
        self.addr + Self::FLAGS_OFFSET
    }

    pub fn idx_addr(&self) -> u64 {
        self.addr + Self::IDX_OFFSET
    }

    /// Address of the element for free running counter value `idx`.
    pub fn elem_addr(&self, idx: u16) -> u64 {
        let slot = idx & (self.size - 1);
        self.addr + Self::RING_OFFSET + Self::ENTRY_SIZE * slot as u64
    }

    pub fn avail_event_addr(&self) -> u64 {
        self.addr + Self::RING_OFFSET + Self::ENTRY_SIZE * self.size as u64
    }
}

/// Driver side of the split ring index protocol.
///
/// Owns the shadow of `avail.idx` (the driver is its only writer) and the
/// driver's position in the used ring. Descriptor chains are laid out by
/// [`ChainAllocator`](super::ChainAllocator); this type only publishes heads
/// and consumes used elements.
#[derive(Debug)]
pub struct DescriptorRing<M> {
    mem: M,
    layout: Layout,
    desc: DescTable,
    avail: AvailRing,
    used: UsedRing,
    avail_idx: u16,
    last_used_idx: u16,
}

impl<M: MemOps> DescriptorRing<M> {
    /// Take ownership of the ring memory described by `layout` and reset it.
    pub fn new(layout: Layout, mem: M) -> Result<Self, RingError> {
        let size = layout.queue_size;
        let desc = DescTable::new(layout.desc_table_addr, size).ok_or(RingError::InvalidLayout)?;
        let ring = Self {
            mem,
            layout,
            desc,
            avail: AvailRing::new(layout.avail_addr, size),
            used: UsedRing::new(layout.used_addr, size),
            avail_idx: 0,
            last_used_idx: 0,
        };

        ring.reset()?;
        Ok(ring)
    }

    fn reset(&self) -> Result<(), RingError> {
        let zeroes = [0u8; 256];
        let areas = [
            (self.desc.base_addr(), DescTable::size_of(self.len())),
            (self.avail.addr(), AvailRing::size_of(self.len())),
            (self.used.addr(), UsedRing::size_of(self.len())),
        ];

        for (mut addr, mut left) in areas {
            while left > 0 {
                let n = left.min(zeroes.len());
                self.mem
                    .write(addr, &zeroes[..n])
                    .map_err(|_| RingError::MemError)?;
                addr += n as u64;
                left -= n;
            }
        }

        Ok(())
    }

    /// Number of descriptors in the ring.
    #[inline]
    pub fn len(&self) -> u16 {
        self.layout.queue_size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layout.queue_size == 0
    }

    #[inline]
    pub fn mem(&self) -> &M {
        &self.mem
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn write_desc(&self, idx: u16, desc: Descriptor) -> Result<(), RingError> {
        let addr = self
            .desc
            .desc_addr(idx)
            .ok_or(RingError::IndexOutOfRange(idx))?;
        desc.write(&self.mem, addr).map_err(|_| RingError::MemError)
    }

    pub fn read_desc(&self, idx: u16) -> Result<Descriptor, RingError> {
        let addr = self
            .desc
            .desc_addr(idx)
            .ok_or(RingError::IndexOutOfRange(idx))?;
        Descriptor::read(&self.mem, addr).map_err(|_| RingError::MemError)
    }

    /// Write the `i`th entry of an out-of-ring descriptor table at `table`.
    pub fn write_table_desc(&self, table: u64, i: u16, desc: Descriptor) -> Result<(), RingError> {
        let addr = table + i as u64 * Descriptor::SIZE as u64;
        desc.write(&self.mem, addr).map_err(|_| RingError::MemError)
    }

    /// Publish `head` in the next available slot and advance `avail.idx`.
    ///
    /// The release store of the index orders every descriptor write made
    /// before this call ahead of the publication.
    pub fn publish(&mut self, head: u16) -> Result<u16, RingError> {
        let slot = self.avail.slot_addr(self.avail_idx);
        self.mem
            .write_val(slot, head)
            .map_err(|_| RingError::MemError)?;

        let new = self.avail_idx.wrapping_add(1);
        self.mem
            .store_release(self.avail.idx_addr(), new)
            .map_err(|_| RingError::MemError)?;
        self.avail_idx = new;

        Ok(new)
    }

    /// Shadow of `avail.idx`.
    #[inline]
    pub fn avail_idx(&self) -> u16 {
        self.avail_idx
    }

    /// Used ring position the driver will consume next.
    #[inline]
    pub fn last_used_idx(&self) -> u16 {
        self.last_used_idx
    }

    /// Load the device's `used.idx` with acquire semantics.
    pub fn used_idx(&self) -> Result<u16, RingError> {
        self.mem
            .load_acquire(self.used.idx_addr())
            .map_err(|_| RingError::MemError)
    }

    /// Number of used elements published and not yet consumed.
    ///
    /// The result is untrusted: a misbehaving device can make it exceed the
    /// ring size.
    pub fn pending_used(&self) -> Result<u16, RingError> {
        Ok(self.used_idx()?.wrapping_sub(self.last_used_idx))
    }

    /// Read the used element at the driver's position.
    ///
    /// Only meaningful after [`used_idx`](Self::used_idx) showed it published.
    pub fn read_used(&self) -> Result<UsedElem, RingError> {
        self.mem
            .read_val(self.used.elem_addr(self.last_used_idx))
            .map_err(|_| RingError::MemError)
    }

    /// Move past the used element at the driver's position.
    #[inline]
    pub fn advance_used(&mut self) {
        self.last_used_idx = self.last_used_idx.wrapping_add(1);
    }

    pub fn set_avail_flags(&self, flags: AvailFlags) -> Result<(), RingError> {
        self.mem
            .store_release(self.avail.flags_addr(), flags.bits())
            .map_err(|_| RingError::MemError)
    }

    pub fn avail_flags(&self) -> Result<AvailFlags, RingError> {
        self.mem
            .load_acquire(self.avail.flags_addr())
            .map(AvailFlags::from_bits_truncate)
            .map_err(|_| RingError::MemError)
    }

    /// The device's request to suppress notifications.
    pub fn used_flags(&self) -> Result<UsedFlags, RingError> {
        self.mem
            .load_acquire(self.used.flags_addr())
            .map(UsedFlags::from_bits_truncate)
            .map_err(|_| RingError::MemError)
    }

    /// Ask the device to interrupt once `used.idx` moves past `idx`.
    pub fn set_used_event(&self, idx: u16) -> Result<(), RingError> {
        self.mem
            .store_release(self.avail.used_event_addr(), idx)
            .map_err(|_| RingError::MemError)
    }

    pub fn used_event(&self) -> Result<u16, RingError> {
        self.mem
            .load_acquire(self.avail.used_event_addr())
            .map_err(|_| RingError::MemError)
    }

    /// The available index at which the device wants to be notified next.
    pub fn avail_event(&self) -> Result<u16, RingError> {
        self.mem
            .load_acquire(self.used.avail_event_addr())
            .map_err(|_| RingError::MemError)
    }

    /// Full barrier between our last store and the next load of a peer field.
    #[inline]
    pub fn fence(&self) {
        self.mem.fence();
    }
}

/// Event index check from the VIRTIO specification.
///
/// Returns true if `event_idx` lies in the window `[old, new)` of entries
/// published since the last signal, i.e. the other side asked to be woken at
/// an index we just moved past. All arithmetic wraps at 2^16.
#[inline(always)]
pub fn ring_need_event(event_idx: u16, new: u16, old: u16) -> bool {
    new.wrapping_sub(event_idx).wrapping_sub(1) < new.wrapping_sub(old)
}
