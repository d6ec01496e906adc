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

//! Split Virtqueue Implementation
//!
//! This module provides the driver end of a VIRTIO split virtqueue and the
//! pieces it is built from. A queue moves caller-owned buffers to a device
//! that shares memory with us but is not trusted.
//!
//! # Architecture
//!
//! - **Queue** ([`Queue`]): adds buffer chains with a caller token, rings the
//!   doorbell, hands back completed tokens and manages completion callbacks.
//!   Detects a misbehaving device and marks it broken.
//!
//! - **Ring primitives** ([`DescriptorRing`], [`ChainAllocator`],
//!   [`IndirectPool`], [`BufferTracker`], [`NotificationController`]): the
//!   index protocol, the descriptor free list, indirect tables, token
//!   bookkeeping and notification suppression.
//!
//! - **Device side** ([`DeviceRing`]): the other end of the protocol, for
//!   tests and device emulation.
//!
//! # Quick Start
//!
//! ```ignore
//! let id = queue.add_sgs([(req_addr, req_len)], [(resp_addr, resp_len)], token)?;
//! queue.kick()?;
//!
//! // ... device interrupts ...
//! while let Some((token, written)) = queue.get_buf()? {
//!     complete(token, written);
//! }
//! ```
//!
//! # Callback Suppression
//!
//! A consumer that drains the queue from its callback usually disables
//! callbacks first and re-enables them when done. Re-enabling returns false
//! if the device completed more buffers in between:
//!
//! ```ignore
//! loop {
//!     queue.disable_cb()?;
//!     while let Some((token, len)) = queue.get_buf()? {
//!         complete(token, len);
//!     }
//!     if queue.enable_cb()? {
//!         break;
//!     }
//! }
//! ```

mod access;
mod chain;
mod desc;
mod event;
mod indirect;
mod peer;
mod ring;
mod tracker;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::num::NonZeroU16;

pub use access::*;
pub use chain::*;
pub use desc::*;
pub use event::*;
pub use indirect::*;
use log::{error, trace, warn};
pub use peer::*;
pub use ring::*;
use thiserror::Error;
pub use tracker::*;

use crate::config::{QueueConfig, QueueSpec};
use crate::device::DeviceHandle;
use crate::feature::{VIRTIO_F_INDIRECT_DESC, VIRTIO_RING_F_EVENT_IDX, has_feature};

/// A trait for notifying the device about new buffers in the virtqueue.
///
/// Implemented by the transport; usually a write to a doorbell register.
pub trait Notifier {
    fn notify(&self, stats: QueueStats);
}

impl<F: Fn(QueueStats)> Notifier for F {
    fn notify(&self, stats: QueueStats) {
        self(stats)
    }
}

/// Called when the device has completed buffers. Must not block: it exists
/// to wake whoever drains the queue.
pub type CompletionCallback = Arc<dyn Fn(QueueStats) + Send + Sync>;

/// Ways the device broke the ring protocol.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    #[error("used index {used_idx} is more than a ring ahead of {last_used}")]
    IndexOverrun { used_idx: u16, last_used: u16 },
    #[error("used id {0} out of range")]
    IdOutOfRange(u32),
    #[error("used id {0} is not the head of a chain in flight")]
    NotAHead(u16),
}

/// Errors that can occur in the virtqueue operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtqError {
    #[error("Ring error: {0}")]
    RingError(#[from] RingError),
    #[error("Allocation error: {0}")]
    Alloc(#[from] AllocError),
    #[error("Not enough free descriptors")]
    OutOfSpace,
    #[error("Empty buffer chain")]
    EmptyChain,
    #[error("Chain of {len} buffers can never fit a ring of {size}")]
    ChainTooLong { len: usize, size: u16 },
    #[error("Protocol violation: {0}")]
    ProtocolViolation(Violation),
    #[error("Device is broken")]
    Broken,
    #[error("Descriptor {0} is not the head of a chain in flight")]
    DoubleFree(u16),
    #[error("Invalid descriptor handle {0}")]
    InvalidHandle(u16),
}

/// What an interrupt handler should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// Nothing was pending; the interrupt was not for this queue.
    None,
    Handled,
}

/// Layout of a split virtqueue in shared memory.
///
/// Describes the addresses of the descriptor table and the two rings. Use
/// [`from_base`](Self::from_base) for the contiguous modern layout,
/// [`from_base_aligned`](Self::from_base_aligned) for the legacy layout with a
/// page aligned used ring, or [`from_parts`](Self::from_parts) when the
/// transport places the three areas independently.
///
/// # Memory Layout
///
/// 1. Descriptor table: `queue_size` × 16 bytes, aligned to 16 bytes
/// 2. Available ring: `6 + 2 × queue_size` bytes, aligned to 2 bytes
/// 3. Used ring: `6 + 8 × queue_size` bytes, aligned to 4 bytes (legacy: to
///    the transport's alignment, usually 4096)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    /// Descriptor table base in shared memory.
    pub desc_table_addr: u64,
    /// Available ring base in shared memory.
    pub avail_addr: u64,
    /// Used ring base in shared memory.
    pub used_addr: u64,
    /// Number of descriptors (ring size, must be a power of 2).
    pub queue_size: u16,
}

#[inline]
const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

impl Layout {
    pub const DESC_ALIGN: usize = 16;
    pub const AVAIL_ALIGN: usize = AvailRing::ALIGN;
    pub const USED_ALIGN: usize = UsedRing::ALIGN;
    /// Used ring alignment of legacy transports.
    pub const LEGACY_ALIGN: usize = 4096;
    pub const MAX_QUEUE_SIZE: u16 = 32768;

    fn check_size(queue_size: u16) -> Result<(), RingError> {
        if !queue_size.is_power_of_two() || queue_size > Self::MAX_QUEUE_SIZE {
            return Err(RingError::InvalidQueueSize(queue_size));
        }
        Ok(())
    }

    /// Contiguous layout starting at `base`, which must be 16-byte aligned.
    /// The region must be at least [`query_size`](Self::query_size) bytes.
    pub fn from_base(base: u64, queue_size: NonZeroU16) -> Result<Self, RingError> {
        Self::from_base_aligned(base, queue_size, Self::USED_ALIGN)
    }

    /// Like [`from_base`](Self::from_base) with the used ring aligned to
    /// `used_align`, a power of two of at least 4.
    pub fn from_base_aligned(
        base: u64,
        queue_size: NonZeroU16,
        used_align: usize,
    ) -> Result<Self, RingError> {
        let size = queue_size.get();
        Self::check_size(size)?;
        if !used_align.is_power_of_two() || used_align < Self::USED_ALIGN {
            return Err(RingError::InvalidLayout);
        }
        if !base.is_multiple_of(Self::DESC_ALIGN as u64) {
            return Err(RingError::InvalidLayout);
        }

        let avail_off = DescTable::size_of(size);
        let used_off = align_up(avail_off + AvailRing::size_of(size), used_align);

        Ok(Self {
            desc_table_addr: base,
            avail_addr: base + avail_off as u64,
            used_addr: base + used_off as u64,
            queue_size: size,
        })
    }

    /// Layout with independently placed areas, as a transport reports them.
    pub fn from_parts(
        desc_table_addr: u64,
        avail_addr: u64,
        used_addr: u64,
        queue_size: u16,
    ) -> Result<Self, RingError> {
        Self::check_size(queue_size)?;
        if !desc_table_addr.is_multiple_of(Self::DESC_ALIGN as u64)
            || !avail_addr.is_multiple_of(Self::AVAIL_ALIGN as u64)
            || !used_addr.is_multiple_of(Self::USED_ALIGN as u64)
        {
            return Err(RingError::InvalidLayout);
        }

        Ok(Self {
            desc_table_addr,
            avail_addr,
            used_addr,
            queue_size,
        })
    }

    /// Calculate the memory size needed for a ring of `queue_size`
    /// descriptors laid out by [`from_base`](Self::from_base).
    pub const fn query_size(queue_size: usize) -> usize {
        Self::query_size_aligned(queue_size, Self::USED_ALIGN)
    }

    /// Memory size needed by [`from_base_aligned`](Self::from_base_aligned).
    pub const fn query_size_aligned(queue_size: usize, used_align: usize) -> usize {
        let n = queue_size as u16;
        let avail_off = DescTable::size_of(n);
        let used_off = align_up(avail_off + AvailRing::size_of(n), used_align);
        used_off + UsedRing::size_of(n)
    }
}

/// Statistics about the current virtqueue state.
///
/// Provided to the [`Notifier`] and to the completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Queue index within its device.
    pub index: u16,
    /// Number of free descriptor slots available.
    pub num_free: usize,
    /// Number of chains currently in flight (added but not completed).
    pub num_inflight: usize,
}

/// The ring memory a transport hands to a new queue.
#[derive(Debug)]
pub struct QueueMemory<M> {
    pub layout: Layout,
    pub mem: M,
    /// Region for indirect tables; only used if `VIRTIO_F_INDIRECT_DESC` was
    /// negotiated.
    pub indirect: Option<IndirectPool>,
}

/// The driver end of a split virtqueue.
///
/// `M` is the shared memory backend, `N` rings the device's doorbell and `T`
/// is the caller's token type, handed back once per added chain.
///
/// Not internally synchronized: callers serialize access per queue. Only
/// [`interrupt`](Self::interrupt) takes `&self` so it can run from an
/// interrupt context next to a consumer holding a shared reference.
pub struct Queue<M, N, T> {
    index: u16,
    name: String,
    device: DeviceHandle,
    ring: DescriptorRing<M>,
    chains: ChainAllocator,
    tracker: BufferTracker<T>,
    indirect: Option<IndirectPool>,
    events: NotificationController,
    notifier: N,
    callback: Option<CompletionCallback>,
    config: QueueConfig,
}

impl<M: MemOps, N: Notifier, T> Queue<M, N, T> {
    /// Create a queue over `memory`, resetting the ring.
    ///
    /// `features` is the negotiated feature set of the owning device; it
    /// selects event index suppression and indirect descriptors.
    pub fn new(
        device: DeviceHandle,
        index: u16,
        spec: QueueSpec,
        memory: QueueMemory<M>,
        notifier: N,
        features: u64,
    ) -> Result<Self, VirtqError> {
        let QueueMemory {
            layout,
            mem,
            indirect,
        } = memory;
        Layout::check_size(layout.queue_size)?;

        let ring = DescriptorRing::new(layout, mem)?;
        let mode = if has_feature(features, VIRTIO_RING_F_EVENT_IDX) {
            SuppressionMode::EventIdx
        } else {
            SuppressionMode::Flags
        };
        let indirect = indirect.filter(|_| has_feature(features, VIRTIO_F_INDIRECT_DESC));
        let QueueSpec {
            name,
            callback,
            config,
            ..
        } = spec;

        Ok(Self {
            index,
            name,
            device,
            chains: ChainAllocator::new(layout.queue_size),
            tracker: BufferTracker::new(layout.queue_size),
            ring,
            indirect,
            events: NotificationController::new(mode, config.get_delayed_enable()),
            notifier,
            callback,
            config,
        })
    }

    /// Expose buffers to the device.
    ///
    /// On success the chain is published and `token` will be returned by
    /// exactly one later [`get_buf`](Self::get_buf) or
    /// [`detach_unused_buf`](Self::detach_unused_buf). On failure nothing
    /// was published. Returns the chain head.
    pub fn add(&mut self, chain: &BufferChain, token: T) -> Result<u16, VirtqError> {
        if self.is_broken() {
            return Err(VirtqError::Broken);
        }

        let table = self.pick_indirect(chain.len())?;
        let handle = match self.chains.add(&self.ring, chain, table) {
            Ok(handle) => handle,
            Err(err) => {
                self.release_table(table);
                return Err(err);
            }
        };

        let head = handle.head();
        if self.tracker.insert(handle, token).is_err() {
            self.unwind(handle);
            return Err(VirtqError::InvalidHandle(head));
        }

        if let Err(err) = self.ring.publish(head) {
            self.tracker.take(head);
            self.unwind(handle);
            return Err(err.into());
        }

        // keep the event index window from wrapping
        if self.events.unsignalled(self.ring.avail_idx()) == u16::MAX {
            self.kick()?;
        }

        Ok(head)
    }

    /// Add device-readable buffers.
    pub fn add_outbuf(
        &mut self,
        segments: impl IntoIterator<Item = impl Into<Segment>>,
        token: T,
    ) -> Result<u16, VirtqError> {
        let chain = BufferChainBuilder::new().readables(segments).build()?;
        self.add(&chain, token)
    }

    /// Add device-writable buffers.
    pub fn add_inbuf(
        &mut self,
        segments: impl IntoIterator<Item = impl Into<Segment>>,
        token: T,
    ) -> Result<u16, VirtqError> {
        let chain = BufferChainBuilder::new().writables(segments).build()?;
        self.add(&chain, token)
    }

    /// Add device-readable buffers followed by device-writable ones, as one
    /// chain.
    pub fn add_sgs(
        &mut self,
        out: impl IntoIterator<Item = impl Into<Segment>>,
        input: impl IntoIterator<Item = impl Into<Segment>>,
        token: T,
    ) -> Result<u16, VirtqError> {
        let chain = BufferChainBuilder::new()
            .readables(out)
            .writables(input)
            .build()?;
        self.add(&chain, token)
    }

    fn pick_indirect(&mut self, len: usize) -> Result<Option<IndirectTable>, VirtqError> {
        let threshold = self.config.get_indirect_threshold() as usize;
        let num_free = self.chains.num_free() as usize;
        let size = self.vring_size() as usize;
        let Some(pool) = self.indirect.as_mut() else {
            return Ok(None);
        };

        if len <= 1 || !pool.fits(len) {
            return Ok(None);
        }
        if len <= threshold && len <= num_free {
            return Ok(None);
        }

        match pool.alloc(len) {
            Ok(table) => Ok(Some(table)),
            // only an indirect table can hold a chain longer than the ring,
            // so wait for one to be released
            Err(_) if len > size => Err(VirtqError::OutOfSpace),
            // an exhausted pool falls back to a direct chain
            Err(_) => Ok(None),
        }
    }

    fn release_table(&mut self, table: Option<IndirectTable>) {
        let (Some(table), Some(pool)) = (table, self.indirect.as_mut()) else {
            return;
        };
        if let Err(err) = pool.dealloc(table) {
            warn!("{}: failed to release indirect table: {}", self.name, err);
        }
    }

    fn unwind(&mut self, handle: ChainHandle) {
        if let Err(err) = self.chains.reclaim(handle.head()) {
            warn!("{}: failed to reclaim chain {}: {}", self.name, handle.head(), err);
        }
        self.release_table(handle.indirect());
    }

    /// Does the device need a doorbell for the buffers added since the last
    /// one? Has no side effects.
    pub fn kick_prepare(&self) -> Result<bool, VirtqError> {
        if self.is_broken() {
            return Err(VirtqError::Broken);
        }
        Ok(self.events.prepare_signal(&self.ring)?)
    }

    /// Ring the doorbell. Returns false if the device is broken.
    pub fn notify(&mut self) -> bool {
        if self.is_broken() {
            return false;
        }

        self.events.mark_signalled(self.ring.avail_idx());
        trace!("{}: notify at avail idx {}", self.name, self.ring.avail_idx());
        self.notifier.notify(self.stats());
        true
    }

    /// [`kick_prepare`](Self::kick_prepare) then [`notify`](Self::notify) if
    /// needed. Returns whether the device was notified.
    pub fn kick(&mut self) -> Result<bool, VirtqError> {
        if self.kick_prepare()? {
            return Ok(self.notify());
        }
        self.events.mark_signalled(self.ring.avail_idx());
        Ok(false)
    }

    /// Take the next completed chain, returning its token and the number of
    /// bytes the device reports having written.
    ///
    /// `Ok(None)` means nothing is pending. A used entry that breaks the
    /// protocol marks the device broken and is reported once as
    /// [`VirtqError::ProtocolViolation`]; every later call fails with
    /// [`VirtqError::Broken`].
    pub fn get_buf(&mut self) -> Result<Option<(T, u32)>, VirtqError> {
        if self.is_broken() {
            return Err(VirtqError::Broken);
        }

        let last_used = self.ring.last_used_idx();
        let used_idx = self.ring.used_idx()?;
        let pending = used_idx.wrapping_sub(last_used);
        if pending == 0 {
            return Ok(None);
        }
        if pending > self.vring_size() {
            return Err(self.violation(Violation::IndexOverrun {
                used_idx,
                last_used,
            }));
        }

        let elem = self.ring.read_used()?;
        if elem.id >= self.vring_size() as u32 {
            return Err(self.violation(Violation::IdOutOfRange(elem.id)));
        }

        let head = elem.id as u16;
        let Some(inflight) = self.tracker.take(head) else {
            return Err(self.violation(Violation::NotAHead(head)));
        };

        self.chains.reclaim(head)?;
        if let (Some(table), Some(pool)) = (inflight.chain.indirect(), self.indirect.as_mut()) {
            pool.dealloc(table)?;
        }

        self.ring.advance_used();
        self.events.after_consume(&self.ring)?;

        Ok(Some((inflight.token, elem.len)))
    }

    fn violation(&self, violation: Violation) -> VirtqError {
        error!("{}: protocol violation: {}", self.name, violation);
        self.device.mark_broken();
        VirtqError::ProtocolViolation(violation)
    }

    /// Stop wanting completion callbacks. Advisory: a callback may still run
    /// once if an interrupt was already in flight.
    pub fn disable_cb(&mut self) -> Result<(), VirtqError> {
        if self.is_broken() {
            return Err(VirtqError::Broken);
        }
        Ok(self.events.disable(&self.ring)?)
    }

    /// Want completion callbacks again, but do not check for pending work;
    /// pass the result to [`poll`](Self::poll) later.
    pub fn enable_cb_prepare(&mut self) -> Result<UsedCursor, VirtqError> {
        if self.is_broken() {
            return Err(VirtqError::Broken);
        }
        Ok(self.events.enable_prepare(&self.ring)?)
    }

    /// Has the device completed anything since `cursor` was taken?
    pub fn poll(&self, cursor: UsedCursor) -> Result<bool, VirtqError> {
        if self.is_broken() {
            return Err(VirtqError::Broken);
        }
        Ok(self.events.poll(&self.ring, cursor)?)
    }

    /// Want completion callbacks again.
    ///
    /// Returns false if completions are already pending; the caller must
    /// drain them rather than wait for a callback that may not come.
    pub fn enable_cb(&mut self) -> Result<bool, VirtqError> {
        let cursor = self.enable_cb_prepare()?;
        Ok(!self.poll(cursor)?)
    }

    /// Like [`enable_cb`](Self::enable_cb), but with event index suppression
    /// only ask for a callback once most outstanding buffers have completed.
    pub fn enable_cb_delayed(&mut self) -> Result<bool, VirtqError> {
        if self.is_broken() {
            return Err(VirtqError::Broken);
        }
        Ok(self.events.enable_delayed(&self.ring)?)
    }

    /// Entry point for the transport's interrupt handler.
    pub fn interrupt(&self) -> IrqReturn {
        // a broken ring is not read again
        if self.is_broken() {
            return IrqReturn::Handled;
        }
        match self.ring.pending_used() {
            Ok(0) | Err(_) => return IrqReturn::None,
            Ok(_) => {}
        }

        if self.events.callbacks_enabled()
            && let Some(callback) = &self.callback
        {
            callback(self.stats());
        }
        IrqReturn::Handled
    }

    /// Take back one chain the device never completed. Only for teardown,
    /// once the device no longer touches the ring; works on a broken device.
    pub fn detach_unused_buf(&mut self) -> Option<T> {
        let head = self.tracker.first_outstanding()?;
        let inflight = self.tracker.take(head)?;
        self.unwind(inflight.chain);
        Some(inflight.token)
    }

    /// Detach every outstanding chain.
    pub fn drain(&mut self) -> Vec<T> {
        core::iter::from_fn(|| self.detach_unused_buf()).collect()
    }

    #[inline]
    pub fn index(&self) -> u16 {
        self.index
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn vring_size(&self) -> u16 {
        self.ring.len()
    }

    #[inline]
    pub fn num_free(&self) -> u16 {
        self.chains.num_free()
    }

    #[inline]
    pub fn is_broken(&self) -> bool {
        self.device.is_broken()
    }

    #[inline]
    pub fn desc_addr(&self) -> u64 {
        self.ring.layout().desc_table_addr
    }

    #[inline]
    pub fn avail_addr(&self) -> u64 {
        self.ring.layout().avail_addr
    }

    #[inline]
    pub fn used_addr(&self) -> u64 {
        self.ring.layout().used_addr
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        self.ring.layout()
    }

    #[inline]
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    #[inline]
    pub fn mode(&self) -> SuppressionMode {
        self.events.mode()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            index: self.index,
            num_free: self.chains.num_free() as usize,
            num_inflight: self.tracker.outstanding(),
        }
    }
}

impl<M, N, T> core::fmt::Debug for Queue<M, N, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Queue")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("num_free", &self.chains.num_free())
            .field("inflight", &self.tracker.outstanding())
            .field("broken", &self.device.is_broken())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec;
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::ring::tests::OwnedRing;
    use super::*;
    use crate::feature::{VIRTIO_F_INDIRECT_DESC, VIRTIO_RING_F_EVENT_IDX, bit};

    #[derive(Clone, Default)]
    pub(crate) struct CountingNotifier(pub Arc<AtomicUsize>);

    impl CountingNotifier {
        pub fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl Notifier for CountingNotifier {
        fn notify(&self, _stats: QueueStats) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    type TestQueue = Queue<Arc<HeapMem>, CountingNotifier, u32>;

    fn make_queue_with(
        ring: &OwnedRing,
        features: u64,
        indirect: Option<IndirectPool>,
        spec: QueueSpec,
    ) -> (TestQueue, CountingNotifier) {
        let notifier = CountingNotifier::default();
        let memory = QueueMemory {
            layout: ring.layout,
            mem: ring.mem.clone(),
            indirect,
        };
        let queue = Queue::new(
            DeviceHandle::new(0),
            0,
            spec,
            memory,
            notifier.clone(),
            features,
        )
        .unwrap();
        (queue, notifier)
    }

    fn make_queue(ring: &OwnedRing, features: u64) -> (TestQueue, CountingNotifier) {
        make_queue_with(ring, features, None, QueueSpec::new("test"))
    }

    #[test]
    fn test_layout_from_base() {
        let layout = Layout::from_base(0x10000, NonZeroU16::new(4).unwrap()).unwrap();
        assert_eq!(layout.desc_table_addr, 0x10000);
        assert_eq!(layout.avail_addr, 0x10000 + 64);
        // 64 + 14 rounded up to 4
        assert_eq!(layout.used_addr, 0x10000 + 80);
        assert_eq!(Layout::query_size(4), 80 + 38);
    }

    #[test]
    fn test_layout_legacy_alignment() {
        let layout =
            Layout::from_base_aligned(0x10000, NonZeroU16::new(256).unwrap(), Layout::LEGACY_ALIGN)
                .unwrap();
        assert_eq!(layout.used_addr % 4096, 0);
        assert_eq!(layout.used_addr, 0x10000 + 8192);
        assert_eq!(
            Layout::query_size_aligned(256, Layout::LEGACY_ALIGN),
            8192 + UsedRing::size_of(256)
        );
    }

    #[test]
    fn test_layout_rejects_bad_input() {
        let three = NonZeroU16::new(3).unwrap();
        assert_eq!(
            Layout::from_base(0x10000, three).unwrap_err(),
            RingError::InvalidQueueSize(3)
        );
        let four = NonZeroU16::new(4).unwrap();
        assert_eq!(
            Layout::from_base(0x10008, four).unwrap_err(),
            RingError::InvalidLayout
        );
        assert_eq!(
            Layout::from_base_aligned(0x10000, four, 6).unwrap_err(),
            RingError::InvalidLayout
        );
        assert_eq!(
            Layout::from_parts(0x10000, 0x20000, 0x30002, 4).unwrap_err(),
            RingError::InvalidLayout
        );
        assert_eq!(
            Layout::from_parts(0x10000, 0x20000, 0x30000, 0).unwrap_err(),
            RingError::InvalidQueueSize(0)
        );
        assert!(Layout::from_parts(0x10000, 0x20002, 0x30004, 32768).is_ok());
    }

    #[test]
    fn test_out_of_order_completion() {
        let ring = OwnedRing::new(4);
        let (mut queue, _) = make_queue(&ring, 0);
        let mut device = ring.device(false);

        let h1 = queue.add_outbuf([(0x1000u64, 8u32)], 1).unwrap();
        let h2 = queue.add_outbuf([(0x2000u64, 8u32)], 2).unwrap();
        let h3 = queue.add_outbuf([(0x3000u64, 8u32)], 3).unwrap();
        assert_eq!(queue.num_free(), 1);

        let mut popped = vec![];
        while let Some(chain) = device.pop_avail().unwrap() {
            popped.push(chain.head);
        }
        assert_eq!(popped, vec![h1, h2, h3]);

        device.push_used(h2 as u32, 5).unwrap();
        assert_eq!(queue.get_buf().unwrap(), Some((2, 5)));
        assert_eq!(queue.num_free(), 2);
        assert_eq!(queue.get_buf().unwrap(), None);

        device.push_used(h3 as u32, 0).unwrap();
        device.push_used(h1 as u32, 1).unwrap();
        assert_eq!(queue.get_buf().unwrap(), Some((3, 0)));
        assert_eq!(queue.get_buf().unwrap(), Some((1, 1)));
        assert_eq!(queue.num_free(), 4);
        queue.chains.check_invariants().unwrap();
    }

    #[test]
    fn test_add_sgs_orders_directions() {
        let ring = OwnedRing::new(8);
        let (mut queue, _) = make_queue(&ring, 0);
        let mut device = ring.device(false);

        queue
            .add_sgs([(0x1000u64, 16u32)], [(0x2000u64, 32u32), (0x3000, 64)], 7)
            .unwrap();
        assert_eq!(queue.num_free(), 5);

        let chain = device.pop_avail().unwrap().unwrap();
        assert_eq!(chain.readables().count(), 1);
        assert_eq!(chain.writable_len(), 96);
        assert!(!chain.indirect);
    }

    #[test]
    fn test_add_inbuf_is_device_writable() {
        let ring = OwnedRing::new(4);
        let (mut queue, _) = make_queue(&ring, 0);
        let mut device = ring.device(false);

        queue.add_inbuf([(0x1000u64, 16u32)], 1).unwrap();
        let chain = device.pop_avail().unwrap().unwrap();
        assert_eq!(chain.writables().count(), 1);
        assert_eq!(chain.readables().count(), 0);
    }

    #[test]
    fn test_long_chain_uses_one_indirect_descriptor() {
        let table_bytes = IndirectPool::query_size(2, 16);
        let (ring, scratch) = OwnedRing::with_extra(4, table_bytes);
        let pool = IndirectPool::new(scratch, table_bytes, 16).unwrap();
        let (mut queue, _) = make_queue_with(
            &ring,
            bit(VIRTIO_F_INDIRECT_DESC),
            Some(pool),
            QueueSpec::new("indirect"),
        );
        let mut device = ring.device(false);

        let segments: Vec<(u64, u32)> = (0..10).map(|i| (0x1000 * (i + 1), 64)).collect();
        let head = queue.add_outbuf(segments.iter().copied(), 42).unwrap();
        assert_eq!(queue.num_free(), 3);

        let chain = device.pop_avail().unwrap().unwrap();
        assert!(chain.indirect);
        assert_eq!(chain.head, head);
        assert_eq!(chain.elems.len(), 10);
        assert_eq!(chain.elems[9].addr, 0xa000);

        device.push_used(head as u32, 0).unwrap();
        assert_eq!(queue.get_buf().unwrap(), Some((42, 0)));
        assert_eq!(queue.num_free(), 4);
        assert_eq!(queue.indirect.as_ref().unwrap().num_free(), 2);
    }

    #[test]
    fn test_long_chain_without_indirect_never_fits() {
        let ring = OwnedRing::new(4);
        let (mut queue, _) = make_queue(&ring, 0);

        let segments: Vec<(u64, u32)> = (0..10).map(|i| (0x1000 * (i + 1), 64)).collect();
        assert_eq!(
            queue.add_outbuf(segments, 1).unwrap_err(),
            VirtqError::ChainTooLong { len: 10, size: 4 }
        );
        assert_eq!(queue.num_free(), 4);
        assert_eq!(ring.avail_idx(), 0);
    }

    #[test]
    fn test_indirect_ignored_unless_negotiated() {
        let table_bytes = IndirectPool::query_size(1, 16);
        let (ring, scratch) = OwnedRing::with_extra(4, table_bytes);
        let pool = IndirectPool::new(scratch, table_bytes, 16).unwrap();
        let (mut queue, _) = make_queue_with(&ring, 0, Some(pool), QueueSpec::new("q"));

        queue
            .add_outbuf([(0x1000u64, 1u32), (0x2000, 1)], 1)
            .unwrap();
        assert_eq!(queue.num_free(), 2);
    }

    #[test]
    fn test_exhausted_pool_falls_back_to_direct() {
        let table_bytes = IndirectPool::query_size(1, 16);
        let (ring, scratch) = OwnedRing::with_extra(4, table_bytes);
        let pool = IndirectPool::new(scratch, table_bytes, 16).unwrap();
        let (mut queue, _) = make_queue_with(
            &ring,
            bit(VIRTIO_F_INDIRECT_DESC),
            Some(pool),
            QueueSpec::new("q"),
        );
        let mut device = ring.device(false);

        let two = [(0x1000u64, 1u32), (0x2000, 1)];
        queue.add_outbuf(two, 1).unwrap();
        assert_eq!(queue.num_free(), 3);
        queue.add_outbuf(two, 2).unwrap();
        assert_eq!(queue.num_free(), 1);

        assert!(device.pop_avail().unwrap().unwrap().indirect);
        assert!(!device.pop_avail().unwrap().unwrap().indirect);
    }

    #[test]
    fn test_long_chain_waits_for_indirect_table() {
        let table_bytes = IndirectPool::query_size(1, 16);
        let (ring, scratch) = OwnedRing::with_extra(4, table_bytes);
        let pool = IndirectPool::new(scratch, table_bytes, 16).unwrap();
        let (mut queue, _) = make_queue_with(
            &ring,
            bit(VIRTIO_F_INDIRECT_DESC),
            Some(pool),
            QueueSpec::new("q"),
        );
        let mut device = ring.device(false);

        let segments: Vec<(u64, u32)> = (0..10).map(|i| (0x1000 * (i + 1), 64)).collect();
        let head = queue.add_outbuf(segments.iter().copied(), 1).unwrap();
        assert_eq!(queue.num_free(), 3);

        // transient: the only table is in flight
        assert_eq!(
            queue.add_outbuf(segments.iter().copied(), 2).unwrap_err(),
            VirtqError::OutOfSpace
        );
        assert_eq!(queue.num_free(), 3);

        device.pop_avail().unwrap().unwrap();
        device.push_used(head as u32, 0).unwrap();
        assert_eq!(queue.get_buf().unwrap(), Some((1, 0)));

        queue.add_outbuf(segments.iter().copied(), 2).unwrap();
        assert!(device.pop_avail().unwrap().unwrap().indirect);
    }

    #[test]
    fn test_indirect_threshold() {
        let table_bytes = IndirectPool::query_size(4, 16);
        let (ring, scratch) = OwnedRing::with_extra(8, table_bytes);
        let pool = IndirectPool::new(scratch, table_bytes, 16).unwrap();
        let mut config = QueueConfig::default();
        config.set_indirect_threshold(3);
        let (mut queue, _) = make_queue_with(
            &ring,
            bit(VIRTIO_F_INDIRECT_DESC),
            Some(pool),
            QueueSpec::new("q").with_config(config),
        );

        queue
            .add_outbuf([(0x1000u64, 1u32), (0x2000, 1), (0x3000, 1)], 1)
            .unwrap();
        assert_eq!(queue.num_free(), 5);
        queue
            .add_outbuf([(0x1000u64, 1u32), (0x2000, 1), (0x3000, 1), (0x4000, 1)], 2)
            .unwrap();
        assert_eq!(queue.num_free(), 4);
        queue
            .add_outbuf([(0x1000u64, 1u32), (0x2000, 1), (0x3000, 1)], 3)
            .unwrap();
        assert_eq!(queue.num_free(), 1);
        // under the threshold but longer than what is left in the ring
        queue
            .add_outbuf([(0x1000u64, 1u32), (0x2000, 1), (0x3000, 1)], 4)
            .unwrap();
        assert_eq!(queue.num_free(), 0);
    }

    #[test]
    fn test_out_of_space_publishes_nothing() {
        let ring = OwnedRing::new(2);
        let (mut queue, _) = make_queue(&ring, 0);

        queue.add_outbuf([(0x1000u64, 1u32)], 1).unwrap();
        queue.add_outbuf([(0x2000u64, 1u32)], 2).unwrap();
        assert_eq!(
            queue.add_outbuf([(0x3000u64, 1u32)], 3).unwrap_err(),
            VirtqError::OutOfSpace
        );
        assert_eq!(ring.avail_idx(), 2);
        assert_eq!(queue.stats().num_inflight, 2);
    }

    #[test]
    fn test_empty_chain_rejected() {
        let ring = OwnedRing::new(2);
        let (mut queue, _) = make_queue(&ring, 0);
        assert_eq!(
            queue
                .add_outbuf(core::iter::empty::<(u64, u32)>(), 1)
                .unwrap_err(),
            VirtqError::EmptyChain
        );
    }

    #[test]
    fn test_id_out_of_range_breaks_device() {
        let ring = OwnedRing::new(4);
        let (mut queue, notifier) = make_queue(&ring, 0);
        let mut device = ring.device(false);

        queue.add_outbuf([(0x1000u64, 8u32)], 1).unwrap();
        device.pop_avail().unwrap().unwrap();
        device.push_used(7, 0).unwrap();

        assert_eq!(
            queue.get_buf().unwrap_err(),
            VirtqError::ProtocolViolation(Violation::IdOutOfRange(7))
        );
        assert!(queue.is_broken());

        // nothing touches the ring any more
        assert_eq!(
            queue.add_outbuf([(0x2000u64, 8u32)], 2).unwrap_err(),
            VirtqError::Broken
        );
        assert_eq!(ring.avail_idx(), 1);
        assert_eq!(queue.get_buf().unwrap_err(), VirtqError::Broken);
        assert_eq!(queue.kick_prepare().unwrap_err(), VirtqError::Broken);
        assert_eq!(queue.enable_cb().unwrap_err(), VirtqError::Broken);
        assert!(!queue.notify());
        assert_eq!(notifier.count(), 0);
        assert_eq!(queue.interrupt(), IrqReturn::Handled);

        // teardown still works
        assert_eq!(queue.detach_unused_buf(), Some(1));
        assert_eq!(queue.num_free(), 4);
    }

    #[test]
    fn test_completion_of_non_head_breaks_device() {
        let ring = OwnedRing::new(4);
        let (mut queue, _) = make_queue(&ring, 0);
        let mut device = ring.device(false);

        let head = queue
            .add_outbuf([(0x1000u64, 8u32), (0x2000, 8)], 1)
            .unwrap();
        device.pop_avail().unwrap().unwrap();
        device.push_used(head as u32 + 1, 0).unwrap();

        assert_eq!(
            queue.get_buf().unwrap_err(),
            VirtqError::ProtocolViolation(Violation::NotAHead(head + 1))
        );
        assert!(queue.device().is_broken());
    }

    #[test]
    fn test_completion_reported_twice_breaks_device() {
        let ring = OwnedRing::new(4);
        let (mut queue, _) = make_queue(&ring, 0);
        let mut device = ring.device(false);

        let head = queue.add_outbuf([(0x1000u64, 8u32)], 1).unwrap();
        device.pop_avail().unwrap().unwrap();
        device.push_used(head as u32, 0).unwrap();
        device.push_used(head as u32, 0).unwrap();

        assert_eq!(queue.get_buf().unwrap(), Some((1, 0)));
        assert_eq!(
            queue.get_buf().unwrap_err(),
            VirtqError::ProtocolViolation(Violation::NotAHead(head))
        );
        assert_eq!(queue.num_free(), 4);
    }

    #[test]
    fn test_used_index_overrun_breaks_device() {
        let ring = OwnedRing::new(4);
        let (mut queue, _) = make_queue(&ring, 0);

        queue.add_outbuf([(0x1000u64, 8u32)], 1).unwrap();
        ring.mem
            .store_release(ring.layout.used_addr + UsedRing::IDX_OFFSET, 5)
            .unwrap();

        assert_eq!(
            queue.get_buf().unwrap_err(),
            VirtqError::ProtocolViolation(Violation::IndexOverrun {
                used_idx: 5,
                last_used: 0
            })
        );
    }

    #[test]
    fn test_kick_with_flags() {
        let ring = OwnedRing::new(4);
        let (mut queue, notifier) = make_queue(&ring, 0);
        let mut device = ring.device(false);

        assert!(!queue.kick().unwrap());

        queue.add_outbuf([(0x1000u64, 8u32)], 1).unwrap();
        queue.add_outbuf([(0x2000u64, 8u32)], 2).unwrap();
        assert!(queue.kick_prepare().unwrap());
        assert!(queue.kick().unwrap());
        assert_eq!(notifier.count(), 1);
        assert!(!queue.kick().unwrap());

        device.disable_kicks().unwrap();
        queue.add_outbuf([(0x3000u64, 8u32)], 3).unwrap();
        assert!(!queue.kick().unwrap());
        assert_eq!(notifier.count(), 1);
    }

    #[test]
    fn test_kick_with_event_idx() {
        let ring = OwnedRing::new(8);
        let (mut queue, notifier) = make_queue(&ring, bit(VIRTIO_RING_F_EVENT_IDX));
        let mut device = ring.device(true);
        assert_eq!(queue.mode(), SuppressionMode::EventIdx);

        // device waits for the first entry
        device.enable_kicks().unwrap();
        queue.add_outbuf([(0x1000u64, 8u32)], 1).unwrap();
        queue.add_outbuf([(0x2000u64, 8u32)], 2).unwrap();
        assert!(queue.kick().unwrap());

        // device has not caught up, so it does not want another kick
        queue.add_outbuf([(0x3000u64, 8u32)], 3).unwrap();
        assert!(!queue.kick().unwrap());

        while device.pop_avail().unwrap().is_some() {}
        queue.add_outbuf([(0x4000u64, 8u32)], 4).unwrap();
        assert!(queue.kick().unwrap());
        assert_eq!(notifier.count(), 2);
    }

    #[test]
    fn test_unsignalled_adds_kick_before_wrapping() {
        let ring = OwnedRing::new(4);
        let (mut queue, notifier) = make_queue(&ring, 0);
        let mut device = ring.device(false);

        for i in 0..u16::MAX as u32 {
            let head = queue.add_outbuf([(0x1000u64, 8u32)], i).unwrap();
            device.pop_avail().unwrap().unwrap();
            device.push_used(head as u32, 0).unwrap();
            assert_eq!(queue.get_buf().unwrap(), Some((i, 0)));
        }

        assert_eq!(notifier.count(), 1);
        assert!(!queue.kick().unwrap());
    }

    #[test]
    fn test_get_buf_moves_used_event() {
        let ring = OwnedRing::new(4);
        let (mut queue, _) = make_queue(&ring, bit(VIRTIO_RING_F_EVENT_IDX));
        let mut device = ring.device(true);

        queue.add_outbuf([(0x1000u64, 8u32)], 1).unwrap();
        queue.add_outbuf([(0x2000u64, 8u32)], 2).unwrap();
        device.pop_avail().unwrap().unwrap();
        device.push_used(0, 0).unwrap();
        assert!(device.needs_interrupt().unwrap());

        queue.get_buf().unwrap().unwrap();
        assert_eq!(queue.ring.used_event().unwrap(), 1);

        device.pop_avail().unwrap().unwrap();
        device.push_used(1, 0).unwrap();
        assert!(device.needs_interrupt().unwrap());
    }

    #[test]
    fn test_disable_cb_then_completion_is_reported() {
        let ring = OwnedRing::new(4);
        let (mut queue, _) = make_queue(&ring, bit(VIRTIO_RING_F_EVENT_IDX));
        let mut device = ring.device(true);

        queue.add_outbuf([(0x1000u64, 8u32)], 1).unwrap();
        queue.disable_cb().unwrap();
        device.pop_avail().unwrap().unwrap();
        device.push_used(0, 0).unwrap();

        assert!(!queue.enable_cb().unwrap());
        assert_eq!(queue.get_buf().unwrap(), Some((1, 0)));
        assert!(queue.enable_cb().unwrap());
    }

    #[test]
    fn test_enable_cb_prepare_and_poll() {
        let ring = OwnedRing::new(4);
        let (mut queue, _) = make_queue(&ring, 0);
        let mut device = ring.device(false);

        queue.add_outbuf([(0x1000u64, 8u32)], 1).unwrap();
        let cursor = queue.enable_cb_prepare().unwrap();
        assert!(!queue.poll(cursor).unwrap());

        device.pop_avail().unwrap().unwrap();
        device.push_used(0, 0).unwrap();
        assert!(queue.poll(cursor).unwrap());
    }

    #[test]
    fn test_enable_cb_delayed() {
        let ring = OwnedRing::new(8);
        let (mut queue, _) = make_queue(&ring, bit(VIRTIO_RING_F_EVENT_IDX));

        for i in 0..4 {
            queue.add_outbuf([(0x1000u64, 8u32)], i).unwrap();
        }
        queue.disable_cb().unwrap();
        assert!(queue.enable_cb_delayed().unwrap());
        assert_eq!(queue.ring.used_event().unwrap(), 3);
    }

    #[test]
    fn test_interrupt_invokes_callback() {
        let ring = OwnedRing::new(4);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let spec = QueueSpec::new("irq").with_callback(move |stats| {
            assert_eq!(stats.num_inflight, 1);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let (mut queue, _) = make_queue_with(&ring, 0, None, spec);
        let mut device = ring.device(false);

        assert_eq!(queue.interrupt(), IrqReturn::None);

        queue.add_outbuf([(0x1000u64, 8u32)], 1).unwrap();
        device.pop_avail().unwrap().unwrap();
        device.push_used(0, 0).unwrap();
        assert_eq!(queue.interrupt(), IrqReturn::Handled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        queue.disable_cb().unwrap();
        assert_eq!(queue.interrupt(), IrqReturn::Handled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        queue.get_buf().unwrap().unwrap();
        assert_eq!(queue.interrupt(), IrqReturn::None);
    }

    #[test]
    fn test_interrupt_on_broken_queue_skips_ring_and_callback() {
        let ring = OwnedRing::new(4);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let spec = QueueSpec::new("irq").with_callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let (queue, _) = make_queue_with(&ring, 0, None, spec);
        let mut device = ring.device(false);

        queue.device().mark_broken();
        // claimed even with nothing pending
        assert_eq!(queue.interrupt(), IrqReturn::Handled);

        device.push_used(0, 0).unwrap();
        assert_eq!(queue.interrupt(), IrqReturn::Handled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drain_returns_every_outstanding_token() {
        let ring = OwnedRing::new(8);
        let (mut queue, _) = make_queue(&ring, 0);

        queue.add_outbuf([(0x1000u64, 8u32)], 10).unwrap();
        queue
            .add_sgs([(0x2000u64, 8u32)], [(0x3000u64, 8u32)], 11)
            .unwrap();
        queue.add_inbuf([(0x4000u64, 8u32)], 12).unwrap();
        assert_eq!(queue.num_free(), 4);

        assert_eq!(queue.drain(), vec![10, 11, 12]);
        assert_eq!(queue.num_free(), 8);
        assert_eq!(queue.detach_unused_buf(), None);
        // indices are never rewound
        assert_eq!(ring.avail_idx(), 3);
        queue.chains.check_invariants().unwrap();
    }

    #[test]
    fn test_accessors() {
        let ring = OwnedRing::new(16);
        let (queue, _) = make_queue_with(&ring, 0, None, QueueSpec::new("rx"));

        assert_eq!(queue.name(), "rx");
        assert_eq!(queue.index(), 0);
        assert_eq!(queue.vring_size(), 16);
        assert_eq!(queue.desc_addr(), ring.layout.desc_table_addr);
        assert_eq!(queue.avail_addr(), ring.layout.avail_addr);
        assert_eq!(queue.used_addr(), ring.layout.used_addr);
        assert_eq!(
            queue.stats(),
            QueueStats {
                index: 0,
                num_free: 16,
                num_inflight: 0
            }
        );
    }
}
