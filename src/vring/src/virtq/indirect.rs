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

//! Indirect descriptor tables.
//!
//! An [`IndirectPool`] carves a fixed region of shared memory into equal
//! slots, each large enough for one table of `table_len` descriptors. A slot
//! is handed out per indirect chain and returned when the device reports the
//! chain as used. Free slots are tracked with a flat bitmap; the most recently
//! freed slot is reused first, which keeps hot tables in cache.

use fixedbitset::FixedBitSet;
use thiserror::Error;

use super::Layout;
use super::desc::Descriptor;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("Invalid region addr {0}")]
    InvalidAlign(u64),
    #[error("Invalid free of table at {0:#x}")]
    InvalidFree(u64),
    #[error("Invalid table length {0}")]
    InvalidArg(usize),
    #[error("Empty region")]
    EmptyRegion,
    #[error("Out of memory")]
    OutOfMemory,
}

/// A table slot handed out by [`IndirectPool::alloc`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IndirectTable {
    /// Address of the first entry.
    pub addr: u64,
    /// Entries the chain stored in it.
    pub entries: u16,
}

impl IndirectTable {
    /// Size in bytes of the entries in use, as written to the ring descriptor.
    #[inline]
    pub fn byte_len(&self) -> u32 {
        self.entries as u32 * Descriptor::SIZE as u32
    }
}

#[derive(Debug, Clone)]
pub struct IndirectPool {
    base_addr: u64,
    table_len: u16,
    used_slots: FixedBitSet,
    last_free: Option<usize>,
}

impl IndirectPool {
    /// Bytes needed for `tables` tables of `table_len` entries each.
    pub const fn query_size(tables: usize, table_len: u16) -> usize {
        tables * table_len as usize * Descriptor::SIZE
    }

    /// Create a pool over `region_len` bytes at `base_addr`, which must be
    /// aligned like a descriptor table.
    ///
    /// The region is rounded down to a whole number of tables.
    pub fn new(base_addr: u64, region_len: usize, table_len: u16) -> Result<Self, AllocError> {
        if !base_addr.is_multiple_of(Layout::DESC_ALIGN as u64) {
            return Err(AllocError::InvalidAlign(base_addr));
        }
        if table_len == 0 {
            return Err(AllocError::InvalidArg(0));
        }

        let num_slots = region_len / Self::query_size(1, table_len);
        if num_slots == 0 {
            return Err(AllocError::EmptyRegion);
        }

        Ok(Self {
            base_addr,
            table_len,
            used_slots: FixedBitSet::with_capacity(num_slots),
            last_free: None,
        })
    }

    /// Maximum entries per table.
    #[inline]
    pub fn table_len(&self) -> u16 {
        self.table_len
    }

    /// Total number of tables.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.used_slots.len()
    }

    /// Tables not currently handed out.
    #[inline]
    pub fn num_free(&self) -> usize {
        self.used_slots.count_zeroes(..)
    }

    /// Can a chain of `entries` segments go through this pool at all?
    #[inline]
    pub fn fits(&self, entries: usize) -> bool {
        entries > 0 && entries <= self.table_len as usize
    }

    #[inline]
    fn addr_of(&self, slot: usize) -> u64 {
        self.base_addr + Self::query_size(slot, self.table_len) as u64
    }

    fn slot_of(&self, addr: u64) -> Option<usize> {
        let off = addr.checked_sub(self.base_addr)? as usize;
        let stride = Self::query_size(1, self.table_len);
        if off % stride != 0 {
            return None;
        }
        let slot = off / stride;
        (slot < self.capacity()).then_some(slot)
    }

    /// Hand out a table for a chain of `entries` segments.
    pub fn alloc(&mut self, entries: usize) -> Result<IndirectTable, AllocError> {
        if !self.fits(entries) {
            return Err(AllocError::InvalidArg(entries));
        }

        let slot = match self.last_free.take() {
            Some(slot) => slot,
            None => self.used_slots.zeroes().next().ok_or(AllocError::OutOfMemory)?,
        };
        self.used_slots.insert(slot);

        Ok(IndirectTable {
            addr: self.addr_of(slot),
            entries: entries as u16,
        })
    }

    /// Return a table to the pool.
    pub fn dealloc(&mut self, table: IndirectTable) -> Result<(), AllocError> {
        let slot = self
            .slot_of(table.addr)
            .ok_or(AllocError::InvalidFree(table.addr))?;

        // clearing an already clear bit would hide a double free
        if !self.used_slots.contains(slot) {
            return Err(AllocError::InvalidFree(table.addr));
        }

        self.used_slots.set(slot, false);
        self.last_free = Some(slot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pool(tables: usize) -> IndirectPool {
        IndirectPool::new(0x10000, IndirectPool::query_size(tables, 8), 8).unwrap()
    }

    #[test]
    fn test_new_rejects_bad_regions() {
        assert_eq!(
            IndirectPool::new(0x10008, 4096, 8).unwrap_err(),
            AllocError::InvalidAlign(0x10008)
        );
        assert_eq!(
            IndirectPool::new(0x10000, 64, 8).unwrap_err(),
            AllocError::EmptyRegion
        );
        assert_eq!(
            IndirectPool::new(0x10000, 4096, 0).unwrap_err(),
            AllocError::InvalidArg(0)
        );
    }

    #[test]
    fn test_alloc_until_exhausted() {
        let mut pool = make_pool(3);
        assert_eq!(pool.capacity(), 3);

        let a = pool.alloc(2).unwrap();
        let b = pool.alloc(8).unwrap();
        let c = pool.alloc(1).unwrap();
        assert_eq!(a.addr, 0x10000);
        assert_eq!(b.addr, 0x10000 + 128);
        assert_eq!(c.addr, 0x10000 + 256);
        assert_eq!(b.byte_len(), 128);

        assert_eq!(pool.alloc(1).unwrap_err(), AllocError::OutOfMemory);
        assert_eq!(pool.num_free(), 0);
    }

    #[test]
    fn test_alloc_rejects_oversized_and_empty() {
        let mut pool = make_pool(2);
        assert_eq!(pool.alloc(9).unwrap_err(), AllocError::InvalidArg(9));
        assert_eq!(pool.alloc(0).unwrap_err(), AllocError::InvalidArg(0));
        assert_eq!(pool.num_free(), 2);
    }

    #[test]
    fn test_recently_freed_is_reused() {
        let mut pool = make_pool(4);
        let _a = pool.alloc(1).unwrap();
        let b = pool.alloc(1).unwrap();
        let _c = pool.alloc(1).unwrap();

        pool.dealloc(b).unwrap();
        let d = pool.alloc(3).unwrap();
        assert_eq!(d.addr, b.addr);
        assert_eq!(d.entries, 3);
    }

    #[test]
    fn test_double_free_detected() {
        let mut pool = make_pool(2);
        let a = pool.alloc(4).unwrap();
        pool.dealloc(a).unwrap();

        assert_eq!(pool.dealloc(a).unwrap_err(), AllocError::InvalidFree(a.addr));
        assert_eq!(pool.num_free(), 2);
    }

    #[test]
    fn test_foreign_address_rejected() {
        let mut pool = make_pool(2);
        let bogus = IndirectTable {
            addr: 0x10010,
            entries: 1,
        };
        assert_eq!(pool.dealloc(bogus).unwrap_err(), AllocError::InvalidFree(0x10010));

        let past_end = IndirectTable {
            addr: 0x10000 + 256,
            entries: 1,
        };
        assert!(pool.dealloc(past_end).is_err());
    }
}
