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

//! Buffer chains and the descriptor free list.
//!
//! A caller describes one logical buffer as a [`BufferChain`]: readable
//! segments first, then writable ones, in the order the device should see
//! them. [`ChainAllocator`] lays such a chain out in the descriptor table,
//! either directly (one descriptor per segment) or through an indirect table
//! (one ring descriptor regardless of length), and puts it back on the free
//! list when the device is done with it.
//!
//! # Free list
//!
//! Free descriptors are linked through a private shadow of their `next`
//! fields. The shadow is never read back from shared memory, so a device that
//! scribbles over the descriptor table cannot corrupt the free list.
//!
//! ```text
//!  free_head ─> [3] ─> [0] ─> [1]        num_free = 3
//!  in flight:   [2]  (head of a 1-descriptor chain)
//! ```

use alloc::vec::Vec;
use core::marker::PhantomData;

use bytemuck::Zeroable;
use fixedbitset::FixedBitSet;
use smallvec::SmallVec;

use super::desc::{DescFlags, Descriptor};
use super::indirect::{AllocError, IndirectTable};
use super::ring::DescriptorRing;
use super::{MemOps, VirtqError};

/// A single buffer element in a scatter-gather list.
///
/// Represents one contiguous memory region that the device will read from
/// or write to. Multiple elements can be chained together to form a
/// [`BufferChain`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Zeroable)]
#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
pub struct BufferElement {
    /// Address of buffer
    pub addr: u64,
    /// Length of the buffer in bytes
    pub len: u32,
    /// Is this buffer writable by the device
    pub writable: bool,
}

/// An address and length, without a direction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Segment {
    pub addr: u64,
    pub len: u32,
}

impl From<(u64, u32)> for Segment {
    fn from((addr, len): (u64, u32)) -> Self {
        Self { addr, len }
    }
}

/// Type-state: Can add readable buffers
pub struct Readable;

/// Type-state: Can add writable buffers (no more readables allowed)
pub struct Writable;

/// A builder for buffer chains using type-state to enforce readable/writable order.
///
/// Upholds invariants: at least one buffer must be present in the chain,
/// and readable buffers must be added before writable buffers.
#[derive(Debug, Default)]
pub struct BufferChainBuilder<T> {
    elems: SmallVec<[BufferElement; 16]>,
    split: usize,
    marker: PhantomData<T>,
}

impl BufferChainBuilder<Readable> {
    /// Create a new builder in the [`Readable`] state.
    pub fn new() -> Self {
        Self {
            elems: Default::default(),
            split: 0,
            marker: PhantomData,
        }
    }

    /// Add a readable buffer (device reads from this).
    pub fn readable(mut self, addr: u64, len: u32) -> Self {
        self.elems.push(BufferElement {
            addr,
            len,
            writable: false,
        });
        self.split += 1;
        self
    }

    /// Add multiple readable buffers from an iterator.
    pub fn readables(mut self, segments: impl IntoIterator<Item = impl Into<Segment>>) -> Self {
        for seg in segments {
            let Segment { addr, len } = seg.into();
            self = self.readable(addr, len);
        }
        self
    }

    /// Add a writable buffer (device writes to this).
    ///
    /// This transitions to Writable state so no more readable buffers can be added.
    pub fn writable(self, addr: u64, len: u32) -> BufferChainBuilder<Writable> {
        self.into_writable().writable(addr, len)
    }

    /// Add multiple writable buffers from an iterator.
    ///
    /// This transitions to Writable state so no more readable buffers can be added.
    pub fn writables(
        self,
        segments: impl IntoIterator<Item = impl Into<Segment>>,
    ) -> BufferChainBuilder<Writable> {
        self.into_writable().writables(segments)
    }

    fn into_writable(self) -> BufferChainBuilder<Writable> {
        BufferChainBuilder {
            elems: self.elems,
            split: self.split,
            marker: PhantomData,
        }
    }

    /// Build a buffer chain with only readable buffers.
    ///
    /// Chain must have at least one buffer otherwise an error is returned.
    pub fn build(self) -> Result<BufferChain, VirtqError> {
        BufferChain::new(self.elems, self.split)
    }
}

impl BufferChainBuilder<Writable> {
    /// Add writable buffer
    pub fn writable(mut self, addr: u64, len: u32) -> Self {
        self.elems.push(BufferElement {
            addr,
            len,
            writable: true,
        });
        self
    }

    /// Add multiple writable buffers from an iterator.
    pub fn writables(mut self, segments: impl IntoIterator<Item = impl Into<Segment>>) -> Self {
        for seg in segments {
            let Segment { addr, len } = seg.into();
            self = self.writable(addr, len);
        }
        self
    }

    /// Build the buffer chain.
    ///
    /// Chain must have at least one buffer otherwise an error is returned.
    pub fn build(self) -> Result<BufferChain, VirtqError> {
        BufferChain::new(self.elems, self.split)
    }
}

/// A chain of buffers ready for submission to the virtqueue.
///
/// Contains a scatter-gather list of [`BufferElement`]s, divided into
/// readable (driver->device) and writable (device->driver) sections.
#[derive(Debug, Clone)]
pub struct BufferChain {
    /// All buffer elements (readable followed by writable)
    elems: SmallVec<[BufferElement; 16]>,
    /// Split index between readable and writable buffers
    split: usize,
}

impl BufferChain {
    fn new(elems: SmallVec<[BufferElement; 16]>, split: usize) -> Result<Self, VirtqError> {
        if elems.is_empty() {
            return Err(VirtqError::EmptyChain);
        }

        Ok(Self { elems, split })
    }

    /// Get all buffer elements in the chain.
    pub fn elems(&self) -> &[BufferElement] {
        self.elems.as_slice()
    }

    /// Get readable buffers in chain
    pub fn readables(&self) -> &[BufferElement] {
        &self.elems[..self.split]
    }

    /// Get writable buffers in chain
    pub fn writables(&self) -> &[BufferElement] {
        &self.elems[self.split..]
    }

    /// Get total number of buffers in chain
    // Note: buffer chain cannot be empty by construction
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.elems.len()
    }
}

/// A chain laid out in the descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainHandle {
    head: u16,
    descs: u16,
    indirect: Option<IndirectTable>,
}

impl ChainHandle {
    /// Index of the head descriptor, as published in the available ring.
    #[inline]
    pub fn head(&self) -> u16 {
        self.head
    }

    /// Ring descriptors consumed by the chain.
    #[inline]
    pub fn descs(&self) -> u16 {
        self.descs
    }

    /// The indirect table holding the chain, if it was laid out indirectly.
    #[inline]
    pub fn indirect(&self) -> Option<IndirectTable> {
        self.indirect
    }
}

#[derive(Debug, Clone, Copy)]
struct DescShadow {
    next: u16,
    flags: u16,
}

/// Descriptor free list and chain layout.
#[derive(Debug, Clone)]
pub struct ChainAllocator {
    shadow: Vec<DescShadow>,
    /// Heads of chains currently in flight. Clearing a bit on reclaim
    /// poisons the handle against a second reclaim.
    live: FixedBitSet,
    free_head: u16,
    num_free: u16,
}

impl ChainAllocator {
    /// Put all `size` descriptors on the free list in index order.
    pub fn new(size: u16) -> Self {
        let shadow = (0..size)
            .map(|i| DescShadow {
                next: i.wrapping_add(1) % size.max(1),
                flags: 0,
            })
            .collect();

        Self {
            shadow,
            live: FixedBitSet::with_capacity(size as usize),
            free_head: 0,
            num_free: size,
        }
    }

    /// Total number of descriptors.
    #[inline]
    pub fn len(&self) -> u16 {
        self.shadow.len() as u16
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.shadow.is_empty()
    }

    /// Descriptors immediately available.
    #[inline]
    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    /// Is `head` the head of a chain that has not been reclaimed?
    #[inline]
    pub fn is_live(&self, head: u16) -> bool {
        self.live.contains(head as usize)
    }

    /// Lay `chain` out in the descriptor table and take it off the free list.
    ///
    /// With `indirect`, the segments are written into that table and a single
    /// ring descriptor points at it; the caller guarantees the table holds
    /// `chain.len()` entries. Nothing is taken off the free list unless every
    /// write succeeded.
    pub fn add<M: MemOps>(
        &mut self,
        ring: &DescriptorRing<M>,
        chain: &BufferChain,
        indirect: Option<IndirectTable>,
    ) -> Result<ChainHandle, VirtqError> {
        let len = chain.len();
        let descs = match indirect {
            Some(table) if table.entries as usize != len => {
                return Err(AllocError::InvalidArg(table.entries as usize).into());
            }
            Some(_) => 1,
            None => u16::try_from(len).map_err(|_| VirtqError::ChainTooLong {
                len,
                size: self.len(),
            })?,
        };

        if descs > self.len() {
            return Err(VirtqError::ChainTooLong {
                len,
                size: self.len(),
            });
        }
        if descs > self.num_free {
            return Err(VirtqError::OutOfSpace);
        }

        let head = self.free_head;
        let new_free_head = match indirect {
            Some(table) => self.lay_out_indirect(ring, chain, head, table)?,
            None => self.lay_out_direct(ring, chain, head)?,
        };

        self.free_head = new_free_head;
        self.num_free -= descs;
        self.live.insert(head as usize);

        Ok(ChainHandle {
            head,
            descs,
            indirect,
        })
    }

    fn lay_out_direct<M: MemOps>(
        &mut self,
        ring: &DescriptorRing<M>,
        chain: &BufferChain,
        head: u16,
    ) -> Result<u16, VirtqError> {
        let last = chain.len() - 1;
        let mut idx = head;

        for (i, elem) in chain.elems().iter().enumerate() {
            let next = self.shadow[idx as usize].next;
            let mut flags = direction(elem);
            if i != last {
                flags |= DescFlags::NEXT;
            }

            ring.write_desc(idx, Descriptor::new(elem.addr, elem.len, flags, next))?;
            self.shadow[idx as usize].flags = flags.bits();
            idx = next;
        }

        // idx is now the descriptor after the tail on the free list
        Ok(idx)
    }

    fn lay_out_indirect<M: MemOps>(
        &mut self,
        ring: &DescriptorRing<M>,
        chain: &BufferChain,
        head: u16,
        table: IndirectTable,
    ) -> Result<u16, VirtqError> {
        let last = chain.len() - 1;

        for (i, elem) in chain.elems().iter().enumerate() {
            let mut flags = direction(elem);
            let mut next = 0;
            if i != last {
                flags |= DescFlags::NEXT;
                next = i as u16 + 1;
            }

            let desc = Descriptor::new(elem.addr, elem.len, flags, next);
            ring.write_table_desc(table.addr, i as u16, desc)?;
        }

        let next = self.shadow[head as usize].next;
        ring.write_desc(
            head,
            Descriptor::new(table.addr, table.byte_len(), DescFlags::INDIRECT, next),
        )?;
        self.shadow[head as usize].flags = DescFlags::INDIRECT.bits();

        Ok(next)
    }

    /// Return the chain starting at `head` to the free list.
    ///
    /// Returns the number of ring descriptors freed.
    pub fn reclaim(&mut self, head: u16) -> Result<u16, VirtqError> {
        if head >= self.len() {
            return Err(VirtqError::InvalidHandle(head));
        }
        if !self.is_live(head) {
            return Err(VirtqError::DoubleFree(head));
        }

        let mut tail = head;
        let mut freed = 1;
        while DescFlags::from_bits_truncate(self.shadow[tail as usize].flags)
            .contains(DescFlags::NEXT)
        {
            tail = self.shadow[tail as usize].next;
            freed += 1;
        }

        self.live.set(head as usize, false);
        self.shadow[tail as usize].next = self.free_head;
        self.free_head = head;
        self.num_free += freed;

        Ok(freed)
    }

    /// Walk the free list; its length must equal `num_free`.
    #[cfg(test)]
    pub(crate) fn free_list_len(&self) -> usize {
        let mut seen = FixedBitSet::with_capacity(self.len() as usize);
        let mut idx = self.free_head;
        for _ in 0..self.num_free {
            if seen.put(idx as usize) {
                break;
            }
            idx = self.shadow[idx as usize].next;
        }
        seen.count_ones(..)
    }

    /// Every descriptor is either on the free list or in exactly one live
    /// chain.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> Result<(), &'static str> {
        let size = self.len() as usize;
        let mut owner = alloc::vec![0u8; size];

        let mut idx = self.free_head;
        for _ in 0..self.num_free {
            let slot = owner.get_mut(idx as usize).ok_or("free list out of range")?;
            if *slot != 0 {
                return Err("descriptor on free list twice");
            }
            *slot = 1;
            idx = self.shadow[idx as usize].next;
        }

        for head in self.live.ones() {
            let mut idx = head as u16;
            loop {
                let slot = &mut owner[idx as usize];
                if *slot != 0 {
                    return Err("descriptor both free and in flight");
                }
                *slot = 2;
                let flags = DescFlags::from_bits_truncate(self.shadow[idx as usize].flags);
                if !flags.contains(DescFlags::NEXT) {
                    break;
                }
                idx = self.shadow[idx as usize].next;
            }
        }

        if owner.contains(&0) {
            return Err("descriptor leaked");
        }
        Ok(())
    }
}

fn direction(elem: &BufferElement) -> DescFlags {
    if elem.writable {
        DescFlags::WRITE
    } else {
        DescFlags::empty()
    }
}
