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

//! Device side of the split ring.
//!
//! [`DeviceRing`] consumes chain heads from the available ring, resolves them
//! (including indirect tables) into [`BufferElement`] lists, and publishes
//! completions in the used ring. It trusts nothing the driver wrote: every
//! index and chain is bounds checked and walks are capped by the table size.

use smallvec::SmallVec;
use thiserror::Error;

use super::chain::BufferElement;
use super::desc::{DescTable, Descriptor};
use super::ring::{AvailFlags, AvailRing, RingError, UsedElem, UsedFlags, UsedRing, ring_need_event};
use super::{Layout, MemOps};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerError {
    #[error("Ring error: {0}")]
    Ring(#[from] RingError),
    #[error("Available head {0} out of range")]
    BadHead(u16),
    #[error("Malformed descriptor chain at head {0}")]
    BadChain(u16),
    #[error("Available index {avail} is more than a ring ahead of {last_avail}")]
    IndexOverrun { avail: u16, last_avail: u16 },
}

/// A chain popped from the available ring.
#[derive(Debug, Clone)]
pub struct AvailChain {
    /// Head descriptor index, to be reported back in the used ring.
    pub head: u16,
    /// Resolved buffers, readable ones first.
    pub elems: SmallVec<[BufferElement; 16]>,
    /// Whether the chain was described by an indirect table.
    pub indirect: bool,
}

impl AvailChain {
    pub fn readables(&self) -> impl Iterator<Item = &BufferElement> {
        self.elems.iter().filter(|e| !e.writable)
    }

    pub fn writables(&self) -> impl Iterator<Item = &BufferElement> {
        self.elems.iter().filter(|e| e.writable)
    }

    /// Total capacity of the writable buffers.
    pub fn writable_len(&self) -> u32 {
        self.writables().map(|e| e.len).sum()
    }
}

/// Device half of a split virtqueue.
#[derive(Debug)]
pub struct DeviceRing<M> {
    mem: M,
    desc: DescTable,
    avail: AvailRing,
    used: UsedRing,
    size: u16,
    event_idx: bool,
    last_avail_idx: u16,
    used_idx: u16,
    signalled_used: u16,
    kicks_enabled: bool,
}

impl<M: MemOps> DeviceRing<M> {
    /// Attach to a ring the driver has already initialized.
    pub fn new(layout: Layout, mem: M, event_idx: bool) -> Result<Self, RingError> {
        let size = layout.queue_size;
        let desc = DescTable::new(layout.desc_table_addr, size).ok_or(RingError::InvalidLayout)?;
        Ok(Self {
            mem,
            desc,
            avail: AvailRing::new(layout.avail_addr, size),
            used: UsedRing::new(layout.used_addr, size),
            size,
            event_idx,
            last_avail_idx: 0,
            used_idx: 0,
            signalled_used: 0,
            kicks_enabled: true,
        })
    }

    #[inline]
    pub fn mem(&self) -> &M {
        &self.mem
    }

    #[inline]
    pub fn last_avail_idx(&self) -> u16 {
        self.last_avail_idx
    }

    #[inline]
    pub fn used_idx(&self) -> u16 {
        self.used_idx
    }

    /// Number of chains the driver has published that we have not popped.
    pub fn avail_pending(&self) -> Result<u16, PeerError> {
        let avail = self
            .mem
            .load_acquire(self.avail.idx_addr())
            .map_err(|_| RingError::MemError)?;
        let pending = avail.wrapping_sub(self.last_avail_idx);
        if pending > self.size {
            return Err(PeerError::IndexOverrun {
                avail,
                last_avail: self.last_avail_idx,
            });
        }

        Ok(pending)
    }

    /// Pop the next available chain, if any.
    pub fn pop_avail(&mut self) -> Result<Option<AvailChain>, PeerError> {
        if self.avail_pending()? == 0 {
            return Ok(None);
        }

        let head: u16 = self
            .mem
            .read_val(self.avail.slot_addr(self.last_avail_idx))
            .map_err(|_| RingError::MemError)?;
        if head >= self.size {
            return Err(PeerError::BadHead(head));
        }

        let chain = self.read_chain(head)?;
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);

        if self.event_idx && self.kicks_enabled {
            self.write_avail_event(self.last_avail_idx)?;
        }

        Ok(Some(chain))
    }

    fn read_chain(&self, head: u16) -> Result<AvailChain, PeerError> {
        let first = self.read_desc(&self.desc, head)?;

        if first.is_indirect() {
            let len = first.len as usize;
            if first.is_next() || len == 0 || len % Descriptor::SIZE != 0 {
                return Err(PeerError::BadChain(head));
            }

            let entries =
                u16::try_from(len / Descriptor::SIZE).map_err(|_| PeerError::BadChain(head))?;
            let table = DescTable::new(first.addr, entries).ok_or(PeerError::BadChain(head))?;
            let elems = self.walk(&table, 0, head, true)?;

            return Ok(AvailChain {
                head,
                elems,
                indirect: true,
            });
        }

        let elems = self.walk(&self.desc, head, head, false)?;
        Ok(AvailChain {
            head,
            elems,
            indirect: false,
        })
    }

    /// Follow `next` links through `table` starting at `start`.
    fn walk(
        &self,
        table: &DescTable,
        start: u16,
        head: u16,
        in_indirect: bool,
    ) -> Result<SmallVec<[BufferElement; 16]>, PeerError> {
        let mut elems = SmallVec::new();
        let mut idx = start;
        let mut seen_writable = false;

        for _ in 0..table.len() {
            let desc = self.read_desc(table, idx)?;
            if desc.is_indirect() && in_indirect {
                return Err(PeerError::BadChain(head));
            }

            let writable = desc.is_writeable();
            if seen_writable && !writable {
                return Err(PeerError::BadChain(head));
            }
            seen_writable |= writable;

            elems.push(BufferElement {
                addr: desc.addr,
                len: desc.len,
                writable,
            });

            if !desc.is_next() {
                return Ok(elems);
            }
            idx = desc.next;
        }

        // More links than descriptors: the chain loops.
        Err(PeerError::BadChain(head))
    }

    fn read_desc(&self, table: &DescTable, idx: u16) -> Result<Descriptor, PeerError> {
        let addr = table.desc_addr(idx).ok_or(RingError::IndexOutOfRange(idx))?;
        Ok(Descriptor::read(&self.mem, addr).map_err(|_| RingError::MemError)?)
    }

    /// Publish a completion for chain `id` with `len` bytes written.
    ///
    /// `id` is written as given so tests can play a misbehaving device.
    pub fn push_used(&mut self, id: u32, len: u32) -> Result<(), PeerError> {
        self.mem
            .write_val(self.used.elem_addr(self.used_idx), UsedElem { id, len })
            .map_err(|_| RingError::MemError)?;

        let new = self.used_idx.wrapping_add(1);
        self.mem
            .store_release(self.used.idx_addr(), new)
            .map_err(|_| RingError::MemError)?;
        self.used_idx = new;
        Ok(())
    }

    /// Should the driver be interrupted for completions pushed since the
    /// last call?
    pub fn needs_interrupt(&mut self) -> Result<bool, PeerError> {
        let old = self.signalled_used;
        let new = self.used_idx;
        self.signalled_used = new;
        if old == new {
            return Ok(false);
        }

        self.mem.fence();
        if self.event_idx {
            let event = self
                .mem
                .load_acquire(self.avail.used_event_addr())
                .map_err(|_| RingError::MemError)?;
            Ok(ring_need_event(event, new, old))
        } else {
            let flags = self
                .mem
                .load_acquire(self.avail.flags_addr())
                .map_err(|_| RingError::MemError)?;
            Ok(!AvailFlags::from_bits_truncate(flags).contains(AvailFlags::NO_INTERRUPT))
        }
    }

    /// Ask the driver not to notify us of new available buffers.
    pub fn disable_kicks(&mut self) -> Result<(), PeerError> {
        self.kicks_enabled = false;
        if !self.event_idx {
            self.write_used_flags(UsedFlags::NO_NOTIFY)?;
        }
        Ok(())
    }

    /// Re-enable notifications.
    ///
    /// Returns false if buffers were made available while kicks were
    /// disabled, in which case the caller must pop again instead of waiting.
    pub fn enable_kicks(&mut self) -> Result<bool, PeerError> {
        self.kicks_enabled = true;
        if self.event_idx {
            self.write_avail_event(self.last_avail_idx)?;
        } else {
            self.write_used_flags(UsedFlags::empty())?;
        }

        self.mem.fence();
        Ok(self.avail_pending()? == 0)
    }

    fn write_used_flags(&self, flags: UsedFlags) -> Result<(), PeerError> {
        self.mem
            .store_release(self.used.flags_addr(), flags.bits())
            .map_err(|_| RingError::MemError)?;
        Ok(())
    }

    fn write_avail_event(&self, idx: u16) -> Result<(), PeerError> {
        self.mem
            .store_release(self.used.avail_event_addr(), idx)
            .map_err(|_| RingError::MemError)?;
        Ok(())
    }
}
