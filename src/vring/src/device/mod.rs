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

//! Device lifecycle.
//!
//! A [`Device`] walks through
//!
//! ```text
//! Uninitialized -> DriverBound -> FeaturesNegotiated -> QueuesReady -> DriverOk
//! ```
//!
//! on the way to being usable, and can fall into `Failed` (probe or
//! negotiation failed, the device stays unbound) or `Broken` (a queue saw
//! the device violate the ring protocol) from any of them. `Suspended` sits
//! between [`Device::freeze`] and [`Device::restore`].
//!
//! The device talks to the hardware (or hypervisor) through a [`Transport`]
//! and to its driver through the [`Driver`] trait. The [`bus::Bus`] registry
//! decides which driver gets which device.

pub mod bus;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use log::{debug, error, warn};
use thiserror::Error;
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

pub use crate::config::QueueSpec;
use crate::feature::{self, DriverFeatures, FeatureError, Negotiated, Revision};
use crate::virtq::{AllocError, MemError, MemOps, Notifier, Queue, RingError, VirtqError};
pub use crate::virtq::QueueMemory;

/// Matches drivers to devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub device: u32,
    pub vendor: u32,
}

impl DeviceId {
    /// Matches any device type or vendor in a driver's id table.
    pub const ANY_ID: u32 = 0xffff_ffff;

    pub const fn new(device: u32, vendor: u32) -> Self {
        Self { device, vendor }
    }

    /// Does this id table entry match `dev`?
    pub fn matches(&self, dev: &DeviceId) -> bool {
        (self.device == Self::ANY_ID || self.device == dev.device)
            && (self.vendor == Self::ANY_ID || self.vendor == dev.vendor)
    }
}

bitflags! {
    /// The device status register.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DeviceStatus: u8 {
        /// The guest noticed the device.
        const ACKNOWLEDGE = 1;
        /// The guest knows how to drive the device.
        const DRIVER = 2;
        /// The driver is set up and ready to drive the device.
        const DRIVER_OK = 4;
        /// Feature negotiation is complete.
        const FEATURES_OK = 8;
        /// The device hit an error it cannot recover from without a reset.
        const NEEDS_RESET = 0x40;
        /// The guest gave up on the device.
        const FAILED = 0x80;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Uninitialized,
    DriverBound,
    FeaturesNegotiated,
    QueuesReady,
    DriverOk,
    Suspended,
    Failed,
    Broken,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::DriverBound => "driver-bound",
            Self::FeaturesNegotiated => "features-negotiated",
            Self::QueuesReady => "queues-ready",
            Self::DriverOk => "driver-ok",
            Self::Suspended => "suspended",
            Self::Failed => "failed",
            Self::Broken => "broken",
        };
        f.write_str(s)
    }
}

/// Back-reference from a queue to its device.
///
/// Cloned into every queue of the device; they share the broken flag.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    index: u32,
    broken: Arc<AtomicBool>,
}

impl DeviceHandle {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            broken: Arc::new(AtomicBool::new(false)),
        }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Stop trusting the rings of this device. Only a reset clears it.
    #[inline]
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("Queue {0} is not available")]
    QueueUnavailable(u16),
    #[error("Queue {index} cannot have {size} entries")]
    QueueSize { index: u16, size: u16 },
    #[error("Ring error: {0}")]
    Ring(#[from] RingError),
    #[error("Memory error: {0}")]
    Memory(#[from] MemError),
    #[error("Allocation error: {0}")]
    Alloc(#[from] AllocError),
}

/// Configuration operations of a device, provided by PCI, MMIO and the like.
pub trait Transport {
    type Mem: MemOps;
    type Notifier: Notifier;

    fn device_id(&self) -> DeviceId;

    /// Features the device offers.
    fn device_features(&self) -> u64;

    /// Tell the device which features the driver accepted.
    fn finalize_features(&mut self, features: u64) -> Result<(), TransportError>;

    fn status(&self) -> DeviceStatus;

    fn set_status(&mut self, status: DeviceStatus);

    /// Reset the device: status cleared, queues forgotten.
    fn reset(&mut self);

    /// Largest size for queue `index`; 0 if the queue does not exist.
    fn max_queue_size(&self, index: u16) -> u16;

    /// Allocate ring memory for queue `index` and tell the device where it is.
    fn setup_queue(
        &mut self,
        index: u16,
        size: u16,
    ) -> Result<QueueMemory<Self::Mem>, TransportError>;

    /// The doorbell of queue `index`.
    fn notifier(&self, index: u16) -> Self::Notifier;

    /// Tell the device queue `index` is gone and release its memory.
    fn teardown_queue(&mut self, index: u16);
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Feature negotiation failed: {0}")]
    FeatureNegotiation(#[from] FeatureError),
    #[error("Device did not accept the negotiated features")]
    FeaturesRejected,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Queue error: {0}")]
    Virtq(#[from] VirtqError),
    #[error("Cannot {op} a device in state {state}")]
    InvalidState { op: &'static str, state: DeviceState },
    #[error("Driver {driver} failed: {reason}")]
    Driver { driver: String, reason: String },
    #[error("No device at index {0}")]
    UnknownDevice(u32),
    #[error("No driver with id {0}")]
    UnknownDriver(usize),
    #[error("Device {0} has no driver")]
    NotBound(u32),
    #[error("No driver matches device {0}")]
    NoMatchingDriver(u32),
}

/// A device driver.
///
/// `probe` and `restore` create the queues they need with
/// [`Device::find_vqs`]. Queues still present after `remove` or `freeze`
/// are drained and torn down by the device.
pub trait Driver<Tr: Transport, T> {
    fn name(&self) -> &str;

    /// Devices this driver handles.
    fn id_table(&self) -> &[DeviceId];

    fn features(&self) -> &DriverFeatures;

    /// Set up a newly bound device. May call [`Device::ready`] itself if it
    /// needs to use its queues before returning.
    fn probe(&self, dev: &mut Device<Tr, T>) -> Result<(), DeviceError>;

    fn remove(&self, dev: &mut Device<Tr, T>);

    /// Called once the device is live.
    fn scan(&self, _dev: &mut Device<Tr, T>) {}

    /// The device configuration changed. Called with the config lock held:
    /// must not block and must not enable or disable config reporting.
    fn config_changed(&self, _dev: &Device<Tr, T>) {}

    fn freeze(&self, _dev: &mut Device<Tr, T>) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Bring the device back after [`freeze`](Self::freeze). Features have
    /// been renegotiated; queues must be recreated.
    fn restore(&self, dev: &mut Device<Tr, T>) -> Result<(), DeviceError> {
        self.probe(dev)
    }
}

#[derive(Debug, Default)]
struct ConfigReporting {
    enabled: bool,
    pending: bool,
}

/// A device, its negotiated state and its queues.
///
/// `T` is the token type of its queues.
pub struct Device<Tr: Transport, T> {
    index: u32,
    id: DeviceId,
    transport: Tr,
    handle: DeviceHandle,
    state: DeviceState,
    features: u64,
    revision: Option<Revision>,
    queues: Vec<Queue<Tr::Mem, Tr::Notifier, T>>,
    config: spin::Mutex<ConfigReporting>,
    /// FAILED was set when the device was frozen
    failed_on_freeze: bool,
}

impl<Tr: Transport, T> Device<Tr, T> {
    pub fn new(index: u32, transport: Tr) -> Self {
        Self {
            index,
            id: transport.device_id(),
            transport,
            handle: DeviceHandle::new(index),
            state: DeviceState::Uninitialized,
            features: 0,
            revision: None,
            queues: Vec::new(),
            config: spin::Mutex::new(ConfigReporting::default()),
            failed_on_freeze: false,
        }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Current state; `Broken` as soon as any queue has seen a violation.
    pub fn state(&self) -> DeviceState {
        if self.handle.is_broken() {
            DeviceState::Broken
        } else {
            self.state
        }
    }

    /// Negotiated features.
    #[inline]
    pub fn features(&self) -> u64 {
        self.features
    }

    #[inline]
    pub fn has_feature(&self, feature: u32) -> bool {
        feature::has_feature(self.features, feature)
    }

    #[inline]
    pub fn revision(&self) -> Option<Revision> {
        self.revision
    }

    #[inline]
    pub fn status(&self) -> DeviceStatus {
        self.transport.status()
    }

    #[inline]
    pub fn is_broken(&self) -> bool {
        self.handle.is_broken()
    }

    #[inline]
    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    #[inline]
    pub fn transport(&self) -> &Tr {
        &self.transport
    }

    #[inline]
    pub fn transport_mut(&mut self) -> &mut Tr {
        &mut self.transport
    }

    pub fn queues(&self) -> &[Queue<Tr::Mem, Tr::Notifier, T>] {
        &self.queues
    }

    pub fn queue(&self, index: u16) -> Option<&Queue<Tr::Mem, Tr::Notifier, T>> {
        self.queues.get(index as usize)
    }

    pub fn queue_mut(&mut self, index: u16) -> Option<&mut Queue<Tr::Mem, Tr::Notifier, T>> {
        self.queues.get_mut(index as usize)
    }

    pub fn add_status(&mut self, status: DeviceStatus) {
        let current = self.transport.status();
        self.transport.set_status(current | status);
    }

    fn set_state(&mut self, to: DeviceState) {
        debug!("device {}: {} -> {}", self.index, self.state, to);
        self.state = to;
    }

    fn expect_state(&self, op: &'static str, allowed: &[DeviceState]) -> Result<(), DeviceError> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(DeviceError::InvalidState { op, state })
        }
    }

    /// Claim the device for a driver.
    pub fn bind(&mut self) -> Result<(), DeviceError> {
        self.expect_state("bind", &[DeviceState::Uninitialized, DeviceState::Failed])?;
        if self.state == DeviceState::Failed {
            // start over after a failed probe
            self.transport.reset();
            self.add_status(DeviceStatus::ACKNOWLEDGE);
        }
        self.add_status(DeviceStatus::DRIVER);
        self.set_state(DeviceState::DriverBound);
        Ok(())
    }

    /// Agree on features with the device.
    ///
    /// A failed negotiation leaves the device `Failed` with the FAILED status
    /// bit set; [`bind`](Self::bind) starts over.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn negotiate(&mut self, driver: &DriverFeatures) -> Result<(), DeviceError> {
        self.expect_state("negotiate features on", &[DeviceState::DriverBound])?;

        let negotiated = match self.try_negotiate(driver) {
            Ok(negotiated) => negotiated,
            Err(err) => {
                self.fail();
                return Err(err);
            }
        };

        self.features = negotiated.features;
        self.revision = Some(negotiated.revision);
        self.set_state(DeviceState::FeaturesNegotiated);
        Ok(())
    }

    fn try_negotiate(&mut self, driver: &DriverFeatures) -> Result<Negotiated, DeviceError> {
        let offered = self.transport.device_features();
        let negotiated = feature::negotiate(offered, driver).inspect_err(|err| {
            warn!("device {}: feature negotiation failed: {}", self.index, err);
        })?;

        self.transport.finalize_features(negotiated.features)?;
        if negotiated.revision == Revision::Modern {
            self.add_status(DeviceStatus::FEATURES_OK);
            if !self.transport.status().contains(DeviceStatus::FEATURES_OK) {
                warn!("device {}: device cleared FEATURES_OK", self.index);
                return Err(DeviceError::FeaturesRejected);
            }
        }
        Ok(negotiated)
    }

    /// Create one queue per spec, with indices in order.
    ///
    /// Either every queue is created or none is.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn find_vqs(&mut self, specs: Vec<QueueSpec>) -> Result<(), DeviceError> {
        self.expect_state("create queues on", &[DeviceState::FeaturesNegotiated])?;

        for (index, spec) in specs.into_iter().enumerate() {
            if let Err(err) = self.setup_vq(index as u16, spec) {
                self.del_vqs();
                return Err(err);
            }
        }

        self.set_state(DeviceState::QueuesReady);
        Ok(())
    }

    fn setup_vq(&mut self, index: u16, spec: QueueSpec) -> Result<(), DeviceError> {
        let max = self.transport.max_queue_size(index);
        if max == 0 {
            return Err(TransportError::QueueUnavailable(index).into());
        }
        let size = spec.size().map_or(max, |size| size.min(max));
        if size == 0 {
            return Err(TransportError::QueueSize { index, size }.into());
        }

        let memory = self.transport.setup_queue(index, size)?;
        let notifier = self.transport.notifier(index);
        let queue = Queue::new(
            self.handle.clone(),
            index,
            spec,
            memory,
            notifier,
            self.features,
        );

        match queue {
            Ok(queue) => {
                self.queues.push(queue);
                Ok(())
            }
            Err(err) => {
                self.transport.teardown_queue(index);
                Err(err.into())
            }
        }
    }

    /// Tear down every queue, returning the tokens the device never
    /// completed.
    pub fn del_vqs(&mut self) -> Vec<T> {
        let mut tokens = Vec::new();
        for mut queue in self.queues.drain(..) {
            tokens.extend(queue.drain());
            self.transport.teardown_queue(queue.index());
        }
        tokens
    }

    /// Let the device start using its queues.
    pub fn ready(&mut self) -> Result<(), DeviceError> {
        self.expect_state(
            "set DRIVER_OK on",
            &[DeviceState::FeaturesNegotiated, DeviceState::QueuesReady],
        )?;
        self.add_status(DeviceStatus::DRIVER_OK);
        self.set_state(DeviceState::DriverOk);
        Ok(())
    }

    /// Give up on the device: queues go away and FAILED is set.
    pub fn fail(&mut self) -> Vec<T> {
        let tokens = self.del_vqs();
        self.add_status(DeviceStatus::FAILED);
        self.set_state(DeviceState::Failed);
        tokens
    }

    /// Stop trusting every ring of the device.
    pub fn break_device(&self) {
        error!("device {}: marked broken", self.index);
        self.handle.mark_broken();
    }

    /// Reset the device and forget everything negotiated. Clears `Broken`.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level = "Trace"))]
    pub fn reset(&mut self) -> Vec<T> {
        let tokens = self.del_vqs();
        self.transport.reset();
        self.handle = DeviceHandle::new(self.index);
        self.features = 0;
        self.revision = None;
        *self.config.lock() = ConfigReporting::default();
        self.set_state(DeviceState::Uninitialized);
        tokens
    }

    /// Bind `driver` and bring the device up.
    ///
    /// On failure the device is left `Failed` with no queues and the error is
    /// returned; the caller should consider it unbound.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn probe(&mut self, driver: &dyn Driver<Tr, T>) -> Result<(), DeviceError> {
        self.bind()?;
        debug!("device {}: probing with {}", self.index, driver.name());

        if let Err(err) = self.try_probe(driver) {
            self.fail();
            return Err(err);
        }

        self.enable_config(driver);
        driver.scan(self);
        Ok(())
    }

    fn try_probe(&mut self, driver: &dyn Driver<Tr, T>) -> Result<(), DeviceError> {
        self.negotiate(driver.features())?;
        driver.probe(self)?;
        if self.state != DeviceState::DriverOk {
            self.ready()?;
        }
        Ok(())
    }

    /// Unbind `driver`. Returns the tokens of chains the device never
    /// completed.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level = "Trace"))]
    pub fn remove(&mut self, driver: &dyn Driver<Tr, T>) -> Vec<T> {
        debug!("device {}: removing {}", self.index, driver.name());
        self.disable_config();
        driver.remove(self);
        let tokens = self.reset();
        self.add_status(DeviceStatus::ACKNOWLEDGE);
        tokens
    }

    /// Report a configuration change to `driver`, or remember it until
    /// reporting is enabled. Never touches a ring.
    pub fn config_changed(&self, driver: Option<&dyn Driver<Tr, T>>) {
        let mut config = self.config.lock();
        match driver {
            Some(driver) if config.enabled => driver.config_changed(self),
            _ => config.pending = true,
        }
    }

    /// Start reporting configuration changes, delivering one that came in
    /// while reporting was off.
    pub fn enable_config(&self, driver: &dyn Driver<Tr, T>) {
        let mut config = self.config.lock();
        config.enabled = true;
        if config.pending {
            config.pending = false;
            driver.config_changed(self);
        }
    }

    pub fn disable_config(&self) {
        self.config.lock().enabled = false;
    }

    /// Suspend the device. Queues are torn down; negotiated features are
    /// kept so [`restore`](Self::restore) can check them.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn freeze(&mut self, driver: &dyn Driver<Tr, T>) -> Result<Vec<T>, DeviceError> {
        self.expect_state(
            "freeze",
            &[DeviceState::DriverOk, DeviceState::QueuesReady, DeviceState::FeaturesNegotiated],
        )?;

        self.disable_config();
        self.failed_on_freeze = self.transport.status().contains(DeviceStatus::FAILED);
        driver.freeze(self)?;

        let tokens = self.del_vqs();
        self.set_state(DeviceState::Suspended);
        Ok(tokens)
    }

    /// Resume a suspended device. The device must offer the same features
    /// it did before; a difference fails the device.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn restore(&mut self, driver: &dyn Driver<Tr, T>) -> Result<(), DeviceError> {
        self.expect_state("restore", &[DeviceState::Suspended])?;

        self.transport.reset();
        self.add_status(DeviceStatus::ACKNOWLEDGE);
        if self.failed_on_freeze {
            self.add_status(DeviceStatus::FAILED);
        }
        self.add_status(DeviceStatus::DRIVER);
        self.set_state(DeviceState::DriverBound);

        if let Err(err) = self.try_restore(driver) {
            self.fail();
            return Err(err);
        }

        self.enable_config(driver);
        Ok(())
    }

    fn try_restore(&mut self, driver: &dyn Driver<Tr, T>) -> Result<(), DeviceError> {
        let saved = self.features;
        self.negotiate(driver.features())?;
        if self.features != saved {
            warn!(
                "device {}: features {:#x} after resume differ from {:#x}",
                self.index, self.features, saved
            );
            return Err(FeatureError::ResumeMismatch {
                saved,
                negotiated: self.features,
            }
            .into());
        }

        driver.restore(self)?;
        if self.state != DeviceState::DriverOk {
            self.ready()?;
        }
        Ok(())
    }
}

impl<Tr: Transport, T> fmt::Debug for Device<Tr, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("index", &self.index)
            .field("id", &self.id)
            .field("state", &self.state())
            .field("features", &format_args!("{:#x}", self.features))
            .field("queues", &self.queues.len())
            .finish()
    }
}
