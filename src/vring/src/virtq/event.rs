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

//! Notification suppression.
//!
//! Two independent channels, one per direction:
//!
//! - Driver to device (kicks): before ringing the doorbell the driver checks
//!   whether the device asked not to be notified, either with the
//!   `VRING_USED_F_NO_NOTIFY` flag or, with `VIRTIO_F_EVENT_IDX`, by
//!   publishing `avail_event`, the available index it wants to be woken at.
//! - Device to driver (callbacks): the driver tells the device whether it
//!   wants interrupts with `VRING_AVAIL_F_NO_INTERRUPT` or `used_event`.
//!
//! Re-enabling callbacks always re-reads `used.idx` after publishing the new
//! suppression state. A completion posted while callbacks were off is then
//! reported to the caller instead of being waited for.

use super::ring::{AvailFlags, DescriptorRing, RingError, UsedFlags, ring_need_event};
use super::MemOps;
use crate::config::DelayedEnable;

/// Which suppression scheme the negotiated features selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressionMode {
    /// All-or-nothing flags in the ring headers.
    Flags,
    /// `used_event` / `avail_event` thresholds.
    EventIdx,
}

/// Position in the used ring captured by
/// [`Queue::enable_cb_prepare`](super::Queue::enable_cb_prepare).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedCursor(pub(crate) u16);

#[derive(Debug, Clone)]
pub struct NotificationController {
    mode: SuppressionMode,
    cb_disabled: bool,
    /// `avail.idx` as of the last doorbell
    signalled_avail: u16,
    policy: DelayedEnable,
}

impl NotificationController {
    pub fn new(mode: SuppressionMode, policy: DelayedEnable) -> Self {
        Self {
            mode,
            cb_disabled: false,
            signalled_avail: 0,
            policy,
        }
    }

    #[inline]
    pub fn mode(&self) -> SuppressionMode {
        self.mode
    }

    #[inline]
    pub fn callbacks_enabled(&self) -> bool {
        !self.cb_disabled
    }

    /// Does the device want a doorbell for what was published since the
    /// last one? Reads only; call [`mark_signalled`](Self::mark_signalled)
    /// once the doorbell is rung.
    pub fn prepare_signal<M: MemOps>(&self, ring: &DescriptorRing<M>) -> Result<bool, RingError> {
        let old = self.signalled_avail;
        let new = ring.avail_idx();
        if old == new {
            return Ok(false);
        }

        // our avail.idx store must be visible before we read the device's
        // suppression state
        ring.fence();

        match self.mode {
            SuppressionMode::EventIdx => Ok(ring_need_event(ring.avail_event()?, new, old)),
            SuppressionMode::Flags => Ok(!ring.used_flags()?.contains(UsedFlags::NO_NOTIFY)),
        }
    }

    #[inline]
    pub fn mark_signalled(&mut self, avail_idx: u16) {
        self.signalled_avail = avail_idx;
    }

    /// Additions published since the last doorbell.
    #[inline]
    pub fn unsignalled(&self, avail_idx: u16) -> u16 {
        avail_idx.wrapping_sub(self.signalled_avail)
    }

    /// Stop wanting callbacks.
    ///
    /// In flag mode this sets the driver-owned `NO_INTERRUPT` hint. In event
    /// index mode nothing is written: the device keeps seeing the
    /// old `used_event` and may interrupt once more, which the queue ignores.
    pub fn disable<M: MemOps>(&mut self, ring: &DescriptorRing<M>) -> Result<(), RingError> {
        if self.cb_disabled {
            return Ok(());
        }
        self.cb_disabled = true;
        if self.mode == SuppressionMode::Flags {
            ring.set_avail_flags(AvailFlags::NO_INTERRUPT)?;
        }
        Ok(())
    }

    fn clear_disabled<M: MemOps>(&mut self, ring: &DescriptorRing<M>) -> Result<(), RingError> {
        if self.cb_disabled {
            self.cb_disabled = false;
            if self.mode == SuppressionMode::Flags {
                ring.set_avail_flags(AvailFlags::empty())?;
            }
        }
        Ok(())
    }

    /// Want callbacks again, starting from the next completion.
    pub fn enable_prepare<M: MemOps>(
        &mut self,
        ring: &DescriptorRing<M>,
    ) -> Result<UsedCursor, RingError> {
        self.clear_disabled(ring)?;
        let last = ring.last_used_idx();
        if self.mode == SuppressionMode::EventIdx {
            ring.set_used_event(last)?;
        }
        Ok(UsedCursor(last))
    }

    /// Has the device completed anything since `cursor` was taken?
    pub fn poll<M: MemOps>(
        &self,
        ring: &DescriptorRing<M>,
        cursor: UsedCursor,
    ) -> Result<bool, RingError> {
        // the suppression store must be visible before used.idx is read
        ring.fence();
        Ok(ring.used_idx()? != cursor.0)
    }

    /// Re-enable callbacks. Returns false if completions are already pending.
    pub fn enable<M: MemOps>(&mut self, ring: &DescriptorRing<M>) -> Result<bool, RingError> {
        let cursor = self.enable_prepare(ring)?;
        Ok(!self.poll(ring, cursor)?)
    }

    /// Re-enable callbacks, but in event index mode only ask to be woken once
    /// the policy's share of the outstanding buffers has completed.
    ///
    /// Returns false if more than that share has already completed.
    pub fn enable_delayed<M: MemOps>(
        &mut self,
        ring: &DescriptorRing<M>,
    ) -> Result<bool, RingError> {
        self.clear_disabled(ring)?;

        let last = ring.last_used_idx();
        let bufs = self
            .policy
            .threshold(ring.avail_idx().wrapping_sub(last));
        if self.mode == SuppressionMode::EventIdx {
            ring.set_used_event(last.wrapping_add(bufs))?;
        }

        ring.fence();
        Ok(ring.used_idx()?.wrapping_sub(last) <= bufs)
    }

    /// Called after each consumed completion. While callbacks are wanted,
    /// moves `used_event` along so the device interrupts for the next one.
    pub fn after_consume<M: MemOps>(&self, ring: &DescriptorRing<M>) -> Result<(), RingError> {
        if self.cb_disabled || self.mode != SuppressionMode::EventIdx {
            return Ok(());
        }
        ring.set_used_event(ring.last_used_idx())?;
        ring.fence();
        Ok(())
    }
}
