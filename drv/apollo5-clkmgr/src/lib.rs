// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Clock source arbitration for the Apollo5.
//!
//! Several drivers may want the same oscillator at once. Each names itself
//! with a [`UserId`] and calls [`ClockManager::request`] and
//! [`ClockManager::release`]; a source is physically on exactly while at
//! least one user holds it. The variable sources (HFRC, HFRC2, SYSPLL) can
//! be retuned with [`ClockManager::configure`] while unused, and a few
//! preset pairs can be switched between while running.
//!
//! HFRC's adjusted mode, HFRC2's adjusted modes, and the SYSPLL all need a
//! reference clock. The manager requests it on their behalf under a
//! reserved user id, so the reference stays on as long as anything built
//! on it does.

#![cfg_attr(not(test), no_std)]

use enum_map::Enum;

pub mod bitmap;
pub mod clkgen;
pub mod hw;
mod manager;

pub use bitmap::{UserBitmap, UserId, MAX_USERS};
pub use clkgen::{ClockConfig, HfrcAdj, Hfrc2Adj, PllMode, RefSel, SyspllConfig};
pub use hw::{ClockHw, HwFault, OscMode, OscStatus};
pub use manager::{ClockManager, ClockSetting, CriticalGuard, Trace};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum ClockId {
    Lfrc,
    XtalLs,
    XtalHs,
    ExtRefClk,
    Hfrc,
    Hfrc2,
    Syspll,
}

impl ClockId {
    /// Sources that other sources can be built on.
    pub fn is_reference(self) -> bool {
        matches!(self, Self::XtalLs | Self::XtalHs | Self::ExtRefClk)
    }

    /// Sources whose frequency can be configured.
    pub fn is_variable(self) -> bool {
        matches!(self, Self::Hfrc | Self::Hfrc2 | Self::Syspll)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClkError {
    InvalidArgument,
    /// The operation does not apply to this source, or the board lacks the
    /// reference clock it needs.
    InvalidOperation,
    /// The source has users and the change would disturb them.
    InUse,
    OutOfRange,
    /// The SYSPLL was requested before it was given a frequency.
    NotConfigured,
    Hardware,
}

impl From<HwFault> for ClkError {
    fn from(_: HwFault) -> Self {
        Self::Hardware
    }
}

pub const HFRC_FREE_RUN_HZ: u32 = 48_000_000;
pub const HFRC_ADJ_48_HZ: u32 = 48_005_120;

pub const HFRC2_FREE_RUN_HZ: u32 = 250_000_000;
pub const HFRC2_ADJ_196P608_HZ: u32 = 196_608_000;
pub const HFRC2_ADJ_250_HZ: u32 = 250_019_840;

/// A crystal input as fitted on the board. A frequency of zero means the
/// input is not populated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RefClock {
    pub freq_hz: u32,
    pub mode: OscMode,
}

impl RefClock {
    pub fn is_present(&self) -> bool {
        self.freq_hz != 0
    }
}

/// Reference clocks fitted on the board.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BoardInfo {
    pub xtal_hs: RefClock,
    pub xtal_ls: RefClock,
    /// Zero if nothing drives the EXTREF_CLK pin.
    pub extref_hz: u32,
}

impl BoardInfo {
    /// Frequency of a reference source, zero if absent.
    pub fn ref_hz(&self, clock: ClockId) -> u32 {
        match clock {
            ClockId::XtalHs => self.xtal_hs.freq_hz,
            ClockId::XtalLs => self.xtal_ls.freq_hz,
            ClockId::ExtRefClk => self.extref_hz,
            _ => 0,
        }
    }

    /// The high-frequency reference to derive HFRC2 and SYSPLL settings
    /// from, preferring XTAL_HS.
    pub fn hf_reference(&self) -> Option<(RefSel, u32)> {
        if self.xtal_hs.is_present() {
            Some((RefSel::XtalHs, self.xtal_hs.freq_hz))
        } else if self.extref_hz != 0 {
            Some((RefSel::ExtRefClk, self.extref_hz))
        } else {
            None
        }
    }
}

impl Default for BoardInfo {
    fn default() -> Self {
        Self {
            xtal_hs: RefClock {
                freq_hz: 32_000_000,
                mode: OscMode::Xtal,
            },
            xtal_ls: RefClock {
                freq_hz: 32_768,
                mode: OscMode::Xtal,
            },
            extref_hz: 0,
        }
    }
}
