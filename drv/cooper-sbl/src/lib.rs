// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host side of the Cooper BLE controller's secondary bootloader (SBL).
//!
//! After reset the controller runs a small bootloader that reports the state
//! of its firmware and patch areas in a STATUS frame. If anything is out of
//! date (or the host simply has newer firmware) the host streams an image to
//! it in DATA frames, then tells it to continue into the firmware. The
//! exchange is strictly half-duplex: the host writes a frame, waits for the
//! controller's IRQ line, and reads one frame back.
//!
//! The crate is split so the protocol can be tested without a controller:
//!
//! - [`session`] is the update state machine, which consumes received
//!   frames and names the frame to send next;
//! - [`driver`] owns a [`Transport`] and a delay source and runs a session
//!   to completion;
//! - [`device`] hands out a fixed number of controller handles, one per bus
//!   module;
//! - [`irq`] is the flag an interrupt handler sets when the controller's IRQ
//!   line rises.

#![cfg_attr(not(test), no_std)]

use cooper_sbl_messages::FrameError;
use derive_more::From;

pub mod device;
pub mod driver;
pub mod image;
pub mod irq;
pub mod session;

pub use device::{DeviceError, DeviceHandle, Devices};
pub use driver::{CooperSbl, Outcome, Trace};
pub use image::{ImageKind, ImageRegistry, UpdateImage};
pub use irq::IrqLatch;
pub use session::{Session, SblStatus};

/// Failure of the underlying bus while moving a frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    Bus,
    Timeout,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SblError {
    /// A frame could not be moved over the bus.
    PacketIncomplete,
    /// The controller did not raise its IRQ line in time.
    Timeout,
    /// The update session ended in failure. `peer_status` is the last status
    /// code the controller reported.
    Fail { peer_status: u32 },
    /// The controller asked for an image the host does not have, or refused
    /// the version it was given.
    UpdateImageFail { peer_status: u32 },
    InvalidArgument,
    /// A step was asked of a session that has already finished.
    InvalidOperation,
}

impl SblError {
    /// Returns true if a fresh attempt (typically after a reset) could
    /// succeed without anything on the host changing.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::PacketIncomplete | Self::Timeout | Self::Fail { .. })
    }
}

impl From<TransportError> for SblError {
    fn from(_: TransportError) -> Self {
        Self::PacketIncomplete
    }
}

impl From<FrameError> for SblError {
    fn from(e: FrameError) -> Self {
        match e {
            // Only produced when building a frame that cannot fit.
            FrameError::BufferTooSmall => Self::InvalidArgument,
            _ => Self::PacketIncomplete,
        }
    }
}

/// Anything that can go wrong between opening a controller and having it
/// run its firmware.
#[derive(Copy, Clone, Debug, PartialEq, Eq, From)]
pub enum CooperError {
    Sbl(SblError),
    Device(DeviceError),
}

/// The half-duplex link to the controller.
pub trait Transport {
    /// Reads one frame into `buf`, returning the number of bytes received.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn write(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Consumes a pending rising edge of the controller's IRQ line.
    fn irq_asserted(&mut self) -> bool;

    /// Drives the controller's reset pin; `true` holds it in reset.
    fn set_reset(&mut self, asserted: bool);
}

/// Tunables for a [`CooperSbl`]. The defaults match the controller's
/// bootloader timing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SblConfig {
    /// How long to wait for the IRQ line after sending a frame.
    pub irq_timeout_ms: u32,
    /// Bad frames tolerated in a row before a session fails.
    pub max_comm_errors: u32,
    /// Time the controller needs to clear its update signature before it
    /// can be reset.
    pub signature_clear_delay_ms: u32,
    /// Width of each phase of the reset pulse.
    pub reset_pulse_ms: u32,
    /// How long to wait for the controller to announce itself after reset.
    pub ready_wait_ms: u32,
    /// Settling time once the controller has been told to run firmware.
    pub post_ok_delay_ms: u32,
}

impl Default for SblConfig {
    fn default() -> Self {
        Self {
            irq_timeout_ms: 1000,
            max_comm_errors: 5,
            signature_clear_delay_ms: 1200,
            reset_pulse_ms: 20,
            ready_wait_ms: 500,
            post_ok_delay_ms: 10,
        }
    }
}
