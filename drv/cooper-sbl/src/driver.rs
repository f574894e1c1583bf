// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs update sessions against a real controller.

use cooper_sbl_messages::{
    self as msgs, FrameError, MsgType, Response, WORK_BUFFER_SIZE,
};
use embedded_hal::blocking::delay::DelayMs;
use ringbuf::{ringbuf_entry, Ringbuf};

use crate::image::ImageRegistry;
use crate::session::{Action, Event, SblStatus, Session, State};
use crate::{SblConfig, SblError, Transport};

/// Firmware older than this needs chip select held longer around transfers.
const SLOW_CS_FW_VERSION: u32 = 0x10E;
const SLOW_CS_DURATION: u32 = 300;
const DEFAULT_CS_DURATION: u32 = 100;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trace {
    None,
    SessionInit,
    Sent(MsgType),
    SentData { packet: u32, len: u16 },
    Status { boot_status: u32, fw_version: u32, sbl_version: u32 },
    ChipId(u32, u32),
    Ack { ack: bool, src: u32, status: u32 },
    Unexpected(u16),
    Malformed,
    Corrupt { len: u16, error: FrameError },
    State(State),
    Outcome(SblStatus),
    ResetPeer,
    PeerNotReady,
    IrqTimeout,
    ForceUpdateRetry,
    Ready { fw_version: u32, cs_duration: u32 },
}

/// How a completed bring-up left the controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The controller is running firmware of the given version.
    Ready { fw_version: u32 },
    /// The controller answered HELLO with something other than STATUS; it
    /// is running firmware without (or not via) its bootloader.
    NoBootloader,
}

pub struct CooperSbl<'a, T, D> {
    transport: T,
    delay: D,
    images: ImageRegistry<'a>,
    config: SblConfig,
    session: Session,
    /// Shared by outgoing and incoming frames: receiving a response
    /// overwrites the frame that provoked it.
    buf: [u8; WORK_BUFFER_SIZE],
    fw_version: Option<u32>,
    cs_duration: u32,
    trace: Ringbuf<Trace, 32>,
}

impl<'a, T: Transport, D: DelayMs<u32>> CooperSbl<'a, T, D> {
    pub fn new(
        transport: T,
        delay: D,
        images: ImageRegistry<'a>,
        config: SblConfig,
    ) -> Self {
        Self {
            transport,
            delay,
            images,
            session: Session::new(config.max_comm_errors),
            config,
            buf: [0; WORK_BUFFER_SIZE],
            fw_version: None,
            cs_duration: DEFAULT_CS_DURATION,
            trace: Ringbuf::new(Trace::None),
        }
    }

    /// Firmware version the controller was left running by the last
    /// successful bring-up.
    pub fn fw_version(&self) -> Option<u32> {
        self.fw_version
    }

    /// Chip select assertion time, in microseconds, suited to the firmware
    /// the controller is running.
    pub fn cs_duration(&self) -> u32 {
        self.cs_duration
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn images(&self) -> &ImageRegistry<'a> {
        &self.images
    }

    pub fn images_mut(&mut self) -> &mut ImageRegistry<'a> {
        &mut self.images
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn trace(&self) -> &Ringbuf<Trace, 32> {
        &self.trace
    }

    /// Makes the next session send the firmware image even if the
    /// controller's is not older.
    pub fn set_force_update(&mut self, force: bool) {
        self.session.set_force_update(force);
    }

    /// Starts a new session from [`State::Init`]. A pending force-update
    /// request carries over.
    pub fn image_update_init(&mut self) {
        let force = self.session.force_update();
        self.session = Session::new(self.config.max_comm_errors);
        self.session.set_force_update(force);
        ringbuf_entry!(self.trace, Trace::SessionInit);
    }

    /// Runs one step of the session: reads the controller's response to the
    /// last frame (except on the first step), advances the state machine,
    /// and sends whatever it asks for. The caller must wait for the IRQ
    /// line between steps. Once the session has finished this fails with
    /// [`SblError::InvalidOperation`] until [`Self::image_update_init`]
    /// starts another.
    pub fn update_image(&mut self) -> Result<SblStatus, SblError> {
        if self.session.is_done() {
            return Err(SblError::InvalidOperation);
        }
        let event = if self.session.state() == State::Init {
            Event::Start
        } else {
            self.receive()?
        };

        let before = self.session.state();
        let step = self.session.advance(&self.images, event);
        if self.session.state() != before {
            ringbuf_entry!(self.trace, Trace::State(self.session.state()));
        }
        if step.status != SblStatus::InProgress {
            ringbuf_entry!(self.trace, Trace::Outcome(step.status));
        }

        // A finished session may still owe the peer a FW_CONTINUE. The
        // verdict stands whether or not it gets there.
        match self.perform(step.action) {
            Err(e) if !self.session.is_done() => Err(e),
            _ => Ok(step.status),
        }
    }

    fn receive(&mut self) -> Result<Event, SblError> {
        let n = self.transport.read(&mut self.buf)?.min(self.buf.len());
        let frame = &self.buf[..n];

        let event = match msgs::decode(frame) {
            Ok(r) => {
                match r {
                    Response::Status(s) => {
                        ringbuf_entry!(
                            self.trace,
                            Trace::Status {
                                boot_status: s.boot_status,
                                fw_version: s.version_number,
                                sbl_version: s.sbl_version,
                            }
                        );
                        if let Some(ext) = s.ext {
                            ringbuf_entry!(
                                self.trace,
                                Trace::ChipId(ext.chip_id0, ext.chip_id1)
                            );
                        }
                    }
                    Response::Ack(a) | Response::Nack(a) => {
                        ringbuf_entry!(
                            self.trace,
                            Trace::Ack {
                                ack: matches!(r, Response::Ack(_)),
                                src: a.src_msg_type,
                                status: a.status,
                            }
                        );
                    }
                    Response::Other(t) => {
                        ringbuf_entry!(self.trace, Trace::Unexpected(t));
                    }
                }
                Event::Response(r)
            }
            Err(FrameError::Malformed) => {
                ringbuf_entry!(self.trace, Trace::Malformed);
                Event::Malformed
            }
            Err(error) => {
                ringbuf_entry!(
                    self.trace,
                    Trace::Corrupt {
                        len: n as u16,
                        error,
                    }
                );
                Event::Corrupt {
                    len: n,
                    stale_status: msgs::peek_ack_status(frame),
                }
            }
        };
        Ok(event)
    }

    fn perform(&mut self, action: Action) -> Result<(), SblError> {
        let n = match action {
            Action::None => return Ok(()),
            Action::SendHello => self.bare(MsgType::Hello)?,
            Action::SendFwContinue => self.bare(MsgType::FwContinue)?,
            Action::SendUpdate(info) => {
                ringbuf_entry!(self.trace, Trace::Sent(MsgType::Update));
                msgs::write_update(&mut self.buf, &info)?
            }
            Action::SendData {
                image,
                packet_number,
                offset,
                len,
            } => {
                let payload = self
                    .images
                    .get(image)
                    .and_then(|i| i.bytes().get(offset..offset + len))
                    .ok_or(SblError::InvalidArgument)?;
                ringbuf_entry!(
                    self.trace,
                    Trace::SentData {
                        packet: packet_number,
                        len: len as u16,
                    }
                );
                msgs::write_data(&mut self.buf, packet_number, payload)?
            }
            Action::ResetPeerThenHello => {
                self.delay.delay_ms(self.config.signature_clear_delay_ms);
                self.reset();
                self.bare(MsgType::Hello)?
            }
        };
        self.transport.write(&self.buf[..n])?;
        Ok(())
    }

    fn bare(&mut self, t: MsgType) -> Result<usize, SblError> {
        ringbuf_entry!(self.trace, Trace::Sent(t));
        Ok(msgs::write_bare(&mut self.buf, t)?)
    }

    /// Pulses the controller's reset line and waits for it to signal that
    /// its bootloader is listening.
    pub fn reset(&mut self) {
        ringbuf_entry!(self.trace, Trace::ResetPeer);
        let pulse = self.config.reset_pulse_ms;
        self.transport.set_reset(false);
        self.delay.delay_ms(pulse);
        self.transport.set_reset(true);
        self.delay.delay_ms(pulse);
        self.transport.set_reset(false);

        // Not fatal: HELLO will time out if the controller really is gone.
        if !self.poll_irq(self.config.ready_wait_ms) {
            ringbuf_entry!(self.trace, Trace::PeerNotReady);
        }
    }

    fn poll_irq(&mut self, timeout_ms: u32) -> bool {
        for _ in 0..timeout_ms {
            if self.transport.irq_asserted() {
                return true;
            }
            self.delay.delay_ms(1);
        }
        self.transport.irq_asserted()
    }

    fn wait_irq(&mut self) -> Result<(), SblError> {
        if self.poll_irq(self.config.irq_timeout_ms) {
            Ok(())
        } else {
            ringbuf_entry!(self.trace, Trace::IrqTimeout);
            Err(SblError::Timeout)
        }
    }

    /// Resets the controller and runs a whole session against it.
    pub fn reset_with_sbl_check(&mut self) -> Result<Outcome, SblError> {
        self.reset();
        self.image_update_init();

        let status = loop {
            let status = self.update_image()?;
            if self.session.is_done() {
                break status;
            }
            self.wait_irq()?;
        };

        let peer_status = self.session.peer_status();
        match status {
            SblStatus::Ok => {
                let fw_version = self.session.fw_version();
                self.fw_version = Some(fw_version);
                self.cs_duration = if fw_version < SLOW_CS_FW_VERSION {
                    SLOW_CS_DURATION
                } else {
                    DEFAULT_CS_DURATION
                };
                ringbuf_entry!(
                    self.trace,
                    Trace::Ready {
                        fw_version,
                        cs_duration: self.cs_duration,
                    }
                );
                self.delay.delay_ms(self.config.post_ok_delay_ms);
                Ok(Outcome::Ready { fw_version })
            }
            SblStatus::BootloaderAbsent => Ok(Outcome::NoBootloader),
            SblStatus::UpdateImageFail => {
                Err(SblError::UpdateImageFail { peer_status })
            }
            _ => Err(SblError::Fail { peer_status }),
        }
    }

    /// Brings the controller up. A controller that refuses to run its
    /// firmware over a version mismatch gets the firmware image forced onto
    /// it, once.
    pub fn init(&mut self) -> Result<Outcome, SblError> {
        match self.reset_with_sbl_check() {
            Err(SblError::UpdateImageFail { peer_status })
                if peer_status
                    == msgs::AckStatus::InvalidOperation as u32 =>
            {
                ringbuf_entry!(self.trace, Trace::ForceUpdateRetry);
                self.set_force_update(true);
                self.reset_with_sbl_check()
            }
            r => r,
        }
    }
}
