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

//! Driver and device registry.
//!
//! A [`Bus`] owns the drivers and devices of one transport and binds them:
//! registering either side probes every unbound match. It is an ordinary
//! value; create one per transport instance rather than sharing a global.

use alloc::boxed::Box;
use alloc::vec::Vec;

use log::debug;
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use super::{Device, DeviceError, DeviceStatus, Driver, Transport};

/// Index of a registered driver.
pub type DriverId = usize;

struct Slot<Tr: Transport, T> {
    device: Device<Tr, T>,
    driver: Option<DriverId>,
}

pub struct Bus<Tr: Transport, T> {
    drivers: Vec<Option<Box<dyn Driver<Tr, T>>>>,
    devices: Vec<Option<Slot<Tr, T>>>,
}

impl<Tr: Transport, T> Default for Bus<Tr, T> {
    fn default() -> Self {
        Self {
            drivers: Vec::new(),
            devices: Vec::new(),
        }
    }
}

impl<Tr: Transport, T> Bus<Tr, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a driver and probe it against every unbound device it matches.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level = "Trace"))]
    pub fn register_driver(&mut self, driver: Box<dyn Driver<Tr, T>>) -> DriverId {
        let id = self.drivers.len();
        debug!("bus: registered driver {} as {}", driver.name(), id);
        self.drivers.push(Some(driver));

        for slot in self.devices.iter_mut().flatten() {
            if slot.driver.is_none() {
                Self::try_bind(&self.drivers, slot, [id]);
            }
        }
        id
    }

    /// Unbind a driver from all its devices and drop it. Returns the tokens
    /// the devices never completed.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn unregister_driver(&mut self, id: DriverId) -> Result<Vec<T>, DeviceError> {
        let driver = self
            .drivers
            .get_mut(id)
            .and_then(Option::take)
            .ok_or(DeviceError::UnknownDriver(id))?;

        let mut tokens = Vec::new();
        for slot in self.devices.iter_mut().flatten() {
            if slot.driver == Some(id) {
                tokens.extend(slot.device.remove(driver.as_ref()));
                slot.driver = None;
            }
        }
        debug!("bus: unregistered driver {}", driver.name());
        Ok(tokens)
    }

    /// Add a device and bind the first registered driver that matches it
    /// and probes successfully.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level = "Trace"))]
    pub fn register_device(&mut self, transport: Tr) -> u32 {
        let index = self.devices.len() as u32;
        let mut device = Device::new(index, transport);
        device.transport_mut().reset();
        device.add_status(DeviceStatus::ACKNOWLEDGE);

        let mut slot = Slot {
            device,
            driver: None,
        };
        Self::try_bind(&self.drivers, &mut slot, 0..self.drivers.len());
        self.devices.push(Some(slot));
        index
    }

    /// Remove a device, unbinding its driver. Returns the device along with
    /// the tokens it never completed.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn unregister_device(&mut self, index: u32) -> Result<(Device<Tr, T>, Vec<T>), DeviceError> {
        let mut slot = self
            .devices
            .get_mut(index as usize)
            .and_then(Option::take)
            .ok_or(DeviceError::UnknownDevice(index))?;

        let tokens = match slot.driver.and_then(|id| self.drivers[id].as_deref()) {
            Some(driver) => slot.device.remove(driver),
            None => slot.device.reset(),
        };
        Ok((slot.device, tokens))
    }

    fn try_bind(
        drivers: &[Option<Box<dyn Driver<Tr, T>>>],
        slot: &mut Slot<Tr, T>,
        candidates: impl IntoIterator<Item = DriverId>,
    ) {
        let dev_id = slot.device.id();
        for id in candidates {
            let Some(driver) = drivers[id].as_deref() else {
                continue;
            };
            if !driver.id_table().iter().any(|entry| entry.matches(&dev_id)) {
                continue;
            }

            match slot.device.probe(driver) {
                Ok(()) => {
                    debug!("bus: device {} bound to {}", slot.device.index(), driver.name());
                    slot.driver = Some(id);
                    return;
                }
                Err(err) => {
                    debug!(
                        "bus: {} failed to probe device {}: {}",
                        driver.name(),
                        slot.device.index(),
                        err
                    );
                }
            }
        }
    }

    pub fn device(&self, index: u32) -> Option<&Device<Tr, T>> {
        self.slot(index).map(|slot| &slot.device)
    }

    pub fn device_mut(&mut self, index: u32) -> Option<&mut Device<Tr, T>> {
        self.devices
            .get_mut(index as usize)?
            .as_mut()
            .map(|slot| &mut slot.device)
    }

    /// The driver bound to device `index`.
    pub fn driver_of(&self, index: u32) -> Option<DriverId> {
        self.slot(index)?.driver
    }

    pub fn num_devices(&self) -> usize {
        self.devices.iter().flatten().count()
    }

    fn slot(&self, index: u32) -> Option<&Slot<Tr, T>> {
        self.devices.get(index as usize)?.as_ref()
    }

    fn bound(&mut self, index: u32) -> Result<(&mut Device<Tr, T>, &dyn Driver<Tr, T>), DeviceError> {
        let slot = self
            .devices
            .get_mut(index as usize)
            .and_then(Option::as_mut)
            .ok_or(DeviceError::UnknownDevice(index))?;
        let driver = slot
            .driver
            .and_then(|id| self.drivers[id].as_deref())
            .ok_or(DeviceError::NotBound(index))?;
        Ok((&mut slot.device, driver))
    }

    /// Suspend device `index`.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn freeze(&mut self, index: u32) -> Result<Vec<T>, DeviceError> {
        let (device, driver) = self.bound(index)?;
        device.freeze(driver)
    }

    /// Resume device `index`.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn restore(&mut self, index: u32) -> Result<(), DeviceError> {
        let (device, driver) = self.bound(index)?;
        device.restore(driver)
    }

    /// Entry point for a configuration change interrupt of device `index`.
    pub fn config_changed(&self, index: u32) -> Result<(), DeviceError> {
        let slot = self.slot(index).ok_or(DeviceError::UnknownDevice(index))?;
        let driver = slot.driver.and_then(|id| self.drivers[id].as_deref());
        slot.device.config_changed(driver);
        Ok(())
    }

    pub fn enable_config(&mut self, index: u32) -> Result<(), DeviceError> {
        let (device, driver) = self.bound(index)?;
        device.enable_config(driver);
        Ok(())
    }

    pub fn disable_config(&self, index: u32) -> Result<(), DeviceError> {
        let slot = self.slot(index).ok_or(DeviceError::UnknownDevice(index))?;
        slot.device.disable_config();
        Ok(())
    }
}
