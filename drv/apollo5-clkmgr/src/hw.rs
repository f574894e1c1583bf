// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The register-level operations the manager drives.
//!
//! Methods take `&self`, as register blocks do: the manager calls the
//! switching primitives from inside its critical sections and the waits
//! from outside them, so an implementation must not assume exclusive
//! access between calls.

use crate::clkgen::{HfrcAdj, Hfrc2Adj, SyspllConfig};

/// How a crystal input is driven.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OscMode {
    /// A crystal on the pins, driven by the on-chip oscillator.
    Xtal,
    /// A clock signal supplied from outside the part.
    External,
}

/// What a crystal input is doing right now.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OscStatus {
    Off,
    On(OscMode),
}

/// A primitive reported failure. Carries no detail; the manager reports it
/// as [`ClkError::Hardware`](crate::ClkError::Hardware).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HwFault;

pub trait ClockHw {
    fn xtal_ls_status(&self) -> OscStatus;
    fn xtal_ls_enable(&self, mode: OscMode);
    fn xtal_ls_disable(&self);

    fn xtal_hs_status(&self) -> OscStatus;
    /// In [`OscMode::Xtal`] this kick-starts the oscillator; the caller
    /// waits for it to stabilize.
    fn xtal_hs_enable(&self, mode: OscMode);
    fn xtal_hs_disable(&self);

    /// Routes the EXTREF_CLK pin into the clock tree.
    fn extref_enable(&self);
    fn extref_disable(&self);

    fn hfrc_force_on(&self, on: bool);
    fn hfadj_apply(&self, adj: &HfrcAdj) -> Result<(), HwFault>;
    fn hfadj_disable(&self) -> Result<(), HwFault>;

    fn hfrc2_force_on(&self, on: bool);
    fn hf2adj_apply(&self, adj: &Hfrc2Adj) -> Result<(), HwFault>;
    fn hf2adj_disable(&self) -> Result<(), HwFault>;

    fn syspll_configure(&self, cfg: &SyspllConfig) -> Result<(), HwFault>;
    fn syspll_enable(&self) -> Result<(), HwFault>;
    fn syspll_disable(&self);
    /// Spins until the PLL reports lock.
    fn syspll_lock_wait(&self) -> Result<(), HwFault>;

    fn delay_us(&self, us: u32);
}
