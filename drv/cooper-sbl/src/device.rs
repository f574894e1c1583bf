// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A fixed set of controller slots.
//!
//! Each open controller is bound to one IOM (the SPI/I2C bus master it sits
//! behind) and carries a flag recording whether the bus is currently
//! claimed for a transfer.

use crate::{CooperError, CooperSbl, Outcome, Transport};
use embedded_hal::blocking::delay::DelayMs;

/// Number of IOM bus masters on the part.
pub const IOM_MODULES: u32 = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceError {
    NoFreeSlot,
    InvalidModule,
    NotOpen,
    /// The bus was already enabled for this controller.
    BusBusy,
}

/// Names an open slot. Only meaningful to the [`Devices`] that issued it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceHandle(usize);

impl DeviceHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct Slot<T> {
    module: u32,
    bus_busy: bool,
    inner: T,
}

pub struct Devices<T, const N: usize> {
    slots: [Option<Slot<T>>; N],
}

impl<T, const N: usize> Devices<T, N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
        }
    }

    /// Places `inner` in the first free slot, bound to IOM `module`.
    pub fn open(&mut self, module: u32, inner: T) -> Result<DeviceHandle, DeviceError> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(DeviceError::NoFreeSlot)?;
        if module >= IOM_MODULES {
            return Err(DeviceError::InvalidModule);
        }
        self.slots[index] = Some(Slot {
            module,
            bus_busy: false,
            inner,
        });
        Ok(DeviceHandle(index))
    }

    /// Frees the slot, handing back what was in it.
    pub fn close(&mut self, handle: DeviceHandle) -> Result<T, DeviceError> {
        self.slots
            .get_mut(handle.0)
            .and_then(Option::take)
            .map(|s| s.inner)
            .ok_or(DeviceError::NotOpen)
    }

    pub fn bus_enable(&mut self, handle: DeviceHandle) -> Result<(), DeviceError> {
        let slot = self.slot_mut(handle)?;
        if slot.bus_busy {
            return Err(DeviceError::BusBusy);
        }
        slot.bus_busy = true;
        Ok(())
    }

    pub fn bus_disable(&mut self, handle: DeviceHandle) -> Result<(), DeviceError> {
        self.slot_mut(handle)?.bus_busy = false;
        Ok(())
    }

    pub fn is_bus_enabled(&self, handle: DeviceHandle) -> Result<bool, DeviceError> {
        self.slot(handle).map(|s| s.bus_busy)
    }

    pub fn module(&self, handle: DeviceHandle) -> Result<u32, DeviceError> {
        self.slot(handle).map(|s| s.module)
    }

    pub fn get_mut(&mut self, handle: DeviceHandle) -> Result<&mut T, DeviceError> {
        self.slot_mut(handle).map(|s| &mut s.inner)
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn slot(&self, handle: DeviceHandle) -> Result<&Slot<T>, DeviceError> {
        self.slots
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or(DeviceError::NotOpen)
    }

    fn slot_mut(&mut self, handle: DeviceHandle) -> Result<&mut Slot<T>, DeviceError> {
        self.slots
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(DeviceError::NotOpen)
    }
}

impl<T, const N: usize> Default for Devices<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, X: Transport, D: DelayMs<u32>, const N: usize> Devices<CooperSbl<'a, X, D>, N> {
    /// Opens `sbl` on IOM `module` and brings the controller up, updating it
    /// if needed. The slot is freed again if bring-up fails.
    pub fn open_and_init(
        &mut self,
        module: u32,
        sbl: CooperSbl<'a, X, D>,
    ) -> Result<(DeviceHandle, Outcome), CooperError> {
        let handle = self.open(module, sbl)?;
        self.bus_enable(handle)?;
        let result = self.get_mut(handle)?.init();
        self.bus_disable(handle)?;
        match result {
            Ok(outcome) => Ok((handle, outcome)),
            Err(e) => {
                self.close(handle)?;
                Err(e.into())
            }
        }
    }
}
