// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::cell::Cell;
use critical_section::Mutex;

/// Set from the controller's IRQ handler, consumed by the thread waiting on
/// a response. Can live in a `static`.
pub struct IrqLatch(Mutex<Cell<bool>>);

impl IrqLatch {
    pub const fn new() -> Self {
        Self(Mutex::new(Cell::new(false)))
    }

    pub fn signal(&self) {
        critical_section::with(|cs| self.0.borrow(cs).set(true));
    }

    /// Returns whether the latch was set, clearing it.
    pub fn take(&self) -> bool {
        critical_section::with(|cs| self.0.borrow(cs).replace(false))
    }

    pub fn is_set(&self) -> bool {
        critical_section::with(|cs| self.0.borrow(cs).get())
    }
}

impl Default for IrqLatch {
    fn default() -> Self {
        Self::new()
    }
}
