// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Settings for the clock generator's adjust blocks and the system PLL, and
//! the arithmetic that derives them from a requested frequency.
//!
//! Everything here is integer math over hertz; there is no FPU assumption.

use crate::{ClkError, ClockId};

/// Which reference clock feeds HFRC2's adjust block or the system PLL.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RefSel {
    XtalHs,
    ExtRefClk,
}

impl RefSel {
    pub fn clock(self) -> ClockId {
        match self {
            RefSel::XtalHs => ClockId::XtalHs,
            RefSel::ExtRefClk => ClockId::ExtRefClk,
        }
    }

    pub fn other(self) -> RefSel {
        match self {
            RefSel::XtalHs => RefSel::ExtRefClk,
            RefSel::ExtRefClk => RefSel::XtalHs,
        }
    }
}

/// HFRC adjust: lock HFRC to a multiple of XTAL_LS.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HfrcAdj {
    /// Target frequency as a multiple of the XTAL_LS frequency.
    pub target: u32,
}

/// HFRC2 adjust: lock HFRC2 to a fixed-point multiple of a divided reference.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Hfrc2Adj {
    pub ref_sel: RefSel,
    /// The reference is divided by `1 << ref_div` before comparison.
    pub ref_div: u8,
    /// Target over divided reference, with 15 fractional bits.
    pub ratio: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PllMode {
    Integer,
    /// The feedback divider has a 24-bit fractional part.
    Fractional,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SyspllConfig {
    pub ref_sel: RefSel,
    pub mode: PllMode,
    pub ref_div: u8,
    pub fb_div_int: u16,
    pub fb_div_frac: u32,
    pub post_div1: u8,
    pub post_div2: u8,
}

impl SyspllConfig {
    /// Output frequency this configuration produces from `ref_hz`, rounded
    /// down.
    pub fn output_hz(&self, ref_hz: u32) -> u64 {
        let fb = (u64::from(self.fb_div_int) << FRAC_BITS)
            + u64::from(self.fb_div_frac);
        let vco = u64::from(ref_hz) * fb
            / u64::from(self.ref_div)
            >> FRAC_BITS;
        vco / (u64::from(self.post_div1) * u64::from(self.post_div2))
    }
}

/// A configuration for one of the variable clocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClockConfig {
    Hfrc(HfrcAdj),
    Hfrc2(Hfrc2Adj),
    Syspll(SyspllConfig),
}

impl ClockConfig {
    /// The clock this configuration applies to.
    pub fn clock(&self) -> ClockId {
        match self {
            ClockConfig::Hfrc(_) => ClockId::Hfrc,
            ClockConfig::Hfrc2(_) => ClockId::Hfrc2,
            ClockConfig::Syspll(_) => ClockId::Syspll,
        }
    }

    /// The reference clock that must be running while this configuration is
    /// in effect.
    pub fn reference(&self) -> ClockId {
        match self {
            ClockConfig::Hfrc(_) => ClockId::XtalLs,
            ClockConfig::Hfrc2(a) => a.ref_sel.clock(),
            ClockConfig::Syspll(p) => p.ref_sel.clock(),
        }
    }
}

pub fn hfrc_adj(xtal_ls_hz: u32, target_hz: u32) -> Result<HfrcAdj, ClkError> {
    if xtal_ls_hz == 0 {
        return Err(ClkError::InvalidOperation);
    }
    Ok(HfrcAdj {
        target: target_hz / xtal_ls_hz,
    })
}

/// HFRC2's reference is always divided by 4.
pub const HFRC2_REF_DIV: u8 = 2;

const HFRC2_RATIO_FRAC_BITS: u32 = 15;

pub fn hfrc2_adj(
    ref_sel: RefSel,
    ref_hz: u32,
    target_hz: u32,
) -> Result<Hfrc2Adj, ClkError> {
    let divided = ref_hz >> HFRC2_REF_DIV;
    if divided == 0 {
        return Err(ClkError::InvalidOperation);
    }
    let ratio = (u64::from(target_hz) << HFRC2_RATIO_FRAC_BITS)
        / u64::from(divided);
    Ok(Hfrc2Adj {
        ref_sel,
        ref_div: HFRC2_REF_DIV,
        ratio: u32::try_from(ratio).map_err(|_| ClkError::OutOfRange)?,
    })
}

const MHZ: u64 = 1_000_000;
const FRAC_BITS: u32 = 24;

const VCO_MIN_HZ: u64 = 60 * MHZ;
const VCO_MAX_HZ: u64 = 960 * MHZ;
const POST_DIV_MAX: u8 = 7;
const REF_DIV_MAX: u8 = 63;
const FB_DIV_INT_MODE: core::ops::RangeInclusive<u64> = 16..=640;
const FB_DIV_FRAC_MODE: core::ops::RangeInclusive<u64> = 20..=320;
const PFD_MIN_INT_HZ: u64 = MHZ;
const PFD_MIN_FRAC_HZ: u64 = 10 * MHZ;

/// Finds a system PLL configuration producing `out_hz` from a reference of
/// `ref_hz` on `ref_sel`.
///
/// Post dividers are chosen to put the VCO at the lowest frequency at or
/// above its minimum; integer mode is preferred over fractional mode at
/// each candidate.
pub fn syspll_config(
    ref_sel: RefSel,
    ref_hz: u32,
    out_hz: u32,
) -> Result<SyspllConfig, ClkError> {
    if ref_hz == 0 {
        return Err(ClkError::InvalidOperation);
    }
    if out_hz == 0 {
        return Err(ClkError::OutOfRange);
    }
    let ref_hz = u64::from(ref_hz);

    for total in 1..=u64::from(POST_DIV_MAX) * u64::from(POST_DIV_MAX) {
        let Some((post_div1, post_div2)) = post_divs(total) else {
            continue;
        };
        let vco = u64::from(out_hz) * total;
        if vco < VCO_MIN_HZ {
            continue;
        }
        if vco > VCO_MAX_HZ {
            break;
        }

        let found = integer_mode(ref_hz, vco)
            .map(|(ref_div, fb)| (PllMode::Integer, ref_div, fb, 0))
            .or_else(|| {
                fractional_mode(ref_hz, vco).map(|(ref_div, fb, frac)| {
                    (PllMode::Fractional, ref_div, fb, frac)
                })
            });
        if let Some((mode, ref_div, fb_div_int, fb_div_frac)) = found {
            return Ok(SyspllConfig {
                ref_sel,
                mode,
                ref_div,
                fb_div_int,
                fb_div_frac,
                post_div1,
                post_div2,
            });
        }
    }
    Err(ClkError::OutOfRange)
}

/// Splits a total post divide into two dividers, larger first.
fn post_divs(total: u64) -> Option<(u8, u8)> {
    (1..=POST_DIV_MAX).rev().find_map(|d1| {
        let d1_64 = u64::from(d1);
        let d2 = total / d1_64;
        (total % d1_64 == 0 && d2 >= 1 && d2 <= d1_64)
            .then(|| (d1, d2 as u8))
    })
}

fn integer_mode(ref_hz: u64, vco: u64) -> Option<(u8, u16)> {
    (1..=REF_DIV_MAX).find_map(|ref_div| {
        let rd = u64::from(ref_div);
        if ref_hz / rd < PFD_MIN_INT_HZ {
            return None;
        }
        let scaled = vco * rd;
        if scaled % ref_hz != 0 {
            return None;
        }
        let fb = scaled / ref_hz;
        FB_DIV_INT_MODE.contains(&fb).then(|| (ref_div, fb as u16))
    })
}

fn fractional_mode(ref_hz: u64, vco: u64) -> Option<(u8, u16, u32)> {
    // Smallest reference divider that gets the feedback divider into range.
    let ref_div = (FB_DIV_FRAC_MODE.start() * ref_hz).div_ceil(vco).max(1);
    if ref_div > u64::from(REF_DIV_MAX) || ref_hz / ref_div < PFD_MIN_FRAC_HZ {
        return None;
    }
    let scaled = vco * ref_div;
    let mut fb = scaled / ref_hz;
    let mut frac =
        (((scaled % ref_hz) << FRAC_BITS) + ref_hz / 2) / ref_hz;
    if frac == 1 << FRAC_BITS {
        fb += 1;
        frac = 0;
    }
    FB_DIV_FRAC_MODE
        .contains(&fb)
        .then(|| (ref_div as u8, fb as u16, frac as u32))
}
