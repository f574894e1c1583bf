// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The SBL update state machine.
//!
//! A [`Session`] never touches the transport. Each call to
//! [`Session::advance`] takes what was (or was not) received, updates the
//! session, and returns a [`Step`]: the status to report to the caller and
//! the [`Action`] the caller must perform before waiting for the peer again.
//! This keeps the protocol logic testable without any I/O.
//!
//! ```text
//!   INIT ──► HELLO ──► UPDATE ──► DATA ──► IMAGE_OK ──► OK
//!              ▲  │       │                   ▲
//!              │  └───────┼───────────────────┘  (nothing to update)
//!              └──────────┘  (NACK INVALID_PARAM: reset peer)
//! ```

use cooper_sbl_messages::{
    AckInfo, AckStatus, BootStatus, MsgType, Response, SblVersion,
    StatusInfo, UpdateInfo, DEFAULT_FW_VERSION, IMAGE_HEADER_SIZE,
    INVALID_PACKET_SIZE, MAX_CHUNK_SIZE, VER_ROLLBACK_ENABLED,
};

use num_traits::FromPrimitive;

use crate::image::{ImageKind, ImageRegistry, UpdateImage};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Init,
    Hello,
    Update,
    Data,
    ImageOk,
}

/// What a single step reports to the caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SblStatus {
    InProgress,
    /// The peer will be sent the firmware image.
    UpdateFw,
    UpdateInfo0,
    UpdateInfo1,
    /// The peer wants an image the host does not have, or rejected the
    /// firmware version it was handed.
    UpdateImageFail,
    Ok,
    Fail,
    /// The peer answered HELLO with something that is not a STATUS frame:
    /// it is not running its bootloader.
    BootloaderAbsent,
}

impl ImageKind {
    fn update_status(self) -> SblStatus {
        match self {
            ImageKind::Firmware => SblStatus::UpdateFw,
            ImageKind::Info0Patch => SblStatus::UpdateInfo0,
            ImageKind::Info1Patch => SblStatus::UpdateInfo1,
        }
    }
}

/// What the caller observed since the last step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Nothing has been read; only meaningful in [`State::Init`].
    Start,
    /// A frame whose CRC checked out.
    Response(Response),
    /// A frame whose CRC checked out but whose body does not match its type.
    Malformed,
    /// A frame that failed its length or CRC check. `len` is the number of
    /// bytes received; `stale_status` is the unverified ACK/NACK status field,
    /// if the frame was long enough to have one.
    Corrupt {
        len: usize,
        stale_status: Option<u32>,
    },
}

/// I/O the caller must perform on behalf of the session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    None,
    SendHello,
    SendUpdate(UpdateInfo),
    /// Send `len` bytes of `image` starting at `offset` as a DATA frame.
    SendData {
        image: ImageKind,
        packet_number: u32,
        offset: usize,
        len: usize,
    },
    SendFwContinue,
    /// Wait for the peer to clear its update signature, reset it, then send
    /// HELLO.
    ResetPeerThenHello,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Step {
    pub status: SblStatus,
    pub action: Action,
}

impl Step {
    fn progress(action: Action) -> Self {
        Self {
            status: SblStatus::InProgress,
            action,
        }
    }
}

/// What the peer told us about itself in its last STATUS frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerInfo {
    pub sbl_version: Option<SblVersion>,
    /// Firmware version, with the unprogrammed value folded to 0.
    pub fw_version: u32,
    pub rollback: u32,
    pub chip_id: Option<(u32, u32)>,
}

/// The image being streamed and how far along it is.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Transfer {
    kind: ImageKind,
    image_size: u32,
    version: u32,
    /// Image size less the header.
    data_size: u32,
    /// Data chunks not yet sent.
    remaining: u32,
    /// Number of the last DATA packet sent; the header is packet 0.
    packet_number: u32,
}

impl Transfer {
    fn new(image: &UpdateImage<'_>) -> Self {
        let data_size = image.size() - IMAGE_HEADER_SIZE as u32;
        Self {
            kind: image.kind(),
            image_size: image.size(),
            version: image.version(),
            data_size,
            remaining: data_size.div_ceil(MAX_CHUNK_SIZE as u32),
            packet_number: 0,
        }
    }

    fn total_chunks(&self) -> u32 {
        self.data_size.div_ceil(MAX_CHUNK_SIZE as u32)
    }

    fn header(&self) -> Action {
        Action::SendData {
            image: self.kind,
            packet_number: 0,
            offset: 0,
            len: IMAGE_HEADER_SIZE,
        }
    }

    /// DATA action for chunk `index` (0-based), which travels as packet
    /// `index + 1`.
    fn chunk(&self, index: u32) -> Action {
        let len = if index + 1 == self.total_chunks() {
            match self.data_size as usize % MAX_CHUNK_SIZE {
                0 => MAX_CHUNK_SIZE,
                rem => rem,
            }
        } else {
            MAX_CHUNK_SIZE
        };
        Action::SendData {
            image: self.kind,
            packet_number: index + 1,
            offset: IMAGE_HEADER_SIZE + index as usize * MAX_CHUNK_SIZE,
            len,
        }
    }

    /// The packet most recently sent, for a retry.
    fn current(&self) -> Action {
        match self.packet_number {
            0 => self.header(),
            n => self.chunk(n - 1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Session {
    state: State,
    transfer: Option<Transfer>,
    /// The last UPDATE sent, kept for retries.
    update: UpdateInfo,
    error_count: u32,
    max_errors: u32,
    peer_status: u32,
    peer: PeerInfo,
    fw_version: u32,
    force_update: bool,
    outcome: Option<SblStatus>,
}

impl Session {
    /// Starts a session in [`State::Init`]. A received frame may fail its
    /// checks `max_errors` times in a row before the session gives up.
    pub fn new(max_errors: u32) -> Self {
        Self {
            state: State::Init,
            transfer: None,
            update: UpdateInfo {
                image_size: 0,
                max_packet_size: INVALID_PACKET_SIZE,
                num_packets: 1,
                version_number: 0,
            },
            error_count: 0,
            max_errors,
            peer_status: 0,
            peer: PeerInfo::default(),
            fw_version: 0,
            force_update: false,
            outcome: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The terminal status, once the session has reached one.
    pub fn outcome(&self) -> Option<SblStatus> {
        self.outcome
    }

    pub fn is_done(&self) -> bool {
        self.outcome.is_some()
    }

    /// Raw status code from the last ACK/NACK or STATUS frame.
    pub fn peer_status(&self) -> u32 {
        self.peer_status
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// Firmware version the peer will be running when the session ends: the
    /// version it reported, or the version of the firmware image once that
    /// has been transferred.
    pub fn fw_version(&self) -> u32 {
        self.fw_version
    }

    /// Send the registered firmware image even if the peer's is not older.
    /// Cleared once an update has been started because of it.
    pub fn set_force_update(&mut self, force: bool) {
        self.force_update = force;
    }

    pub fn force_update(&self) -> bool {
        self.force_update
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn advance(&mut self, images: &ImageRegistry<'_>, event: Event) -> Step {
        if let Some(status) = self.outcome {
            return Step {
                status,
                action: Action::None,
            };
        }

        if let Event::Response(_) | Event::Malformed = event {
            self.error_count = 0;
        }

        match self.state {
            State::Init => {
                self.state = State::Hello;
                Step::progress(Action::SendHello)
            }
            State::Hello => self.on_hello(images, event),
            State::Update => self.on_update(event),
            State::Data => self.on_data(event),
            State::ImageOk => self.on_image_ok(event),
        }
    }

    fn finish(&mut self, status: SblStatus) -> Step {
        self.outcome = Some(status);
        Step {
            status,
            action: Action::None,
        }
    }

    /// Counts a bad frame and either resends or gives up.
    fn retry(&mut self, resend: Action) -> Step {
        self.error_count += 1;
        if self.error_count > self.max_errors {
            self.finish(SblStatus::Fail)
        } else {
            Step::progress(resend)
        }
    }

    fn record_ack(&mut self, event: &Event) -> Option<AckInfo> {
        match event {
            Event::Response(Response::Ack(a) | Response::Nack(a)) => {
                self.peer_status = a.status;
                Some(*a)
            }
            _ => None,
        }
    }

    fn on_hello(&mut self, images: &ImageRegistry<'_>, event: Event) -> Step {
        let info = match event {
            Event::Corrupt { len, .. }
                if !cooper_sbl_messages::is_status_size(len) =>
            {
                return self.finish(SblStatus::BootloaderAbsent);
            }
            Event::Corrupt { .. } => return self.retry(Action::SendHello),
            Event::Response(Response::Status(info)) => info,
            _ => return self.finish(SblStatus::Fail),
        };

        self.peer_status = info.boot_status;
        let Some(sbl_version) = info.sbl_version() else {
            return self.finish(SblStatus::Fail);
        };
        self.learn_peer(sbl_version, &info);

        let kind = match info.boot_status() {
            Some(BootStatus::Success) => {
                if let Some(fw) = images.get(ImageKind::Firmware) {
                    if self.fw_version < fw.version() || self.force_update {
                        self.force_update = false;
                        self.transfer = Some(Transfer::new(fw));
                        return self.send_update(images, SblStatus::UpdateFw);
                    }
                }
                // Nothing newer to offer; let the peer run what it has.
                self.state = State::ImageOk;
                return Step::progress(Action::SendFwContinue);
            }
            Some(BootStatus::FwUpdateRequired) => ImageKind::Firmware,
            Some(BootStatus::Info0UpdateRequired) => ImageKind::Info0Patch,
            Some(BootStatus::Info1UpdateRequired) => ImageKind::Info1Patch,
            _ => return self.finish(SblStatus::Fail),
        };

        // An UPDATE goes out either way: with no image it carries size 0 and
        // the invalid packet size, so the peer NACKs and clears its pending
        // signature instead of waiting on us forever.
        let status = match images.get(kind) {
            Some(image) => {
                self.transfer = Some(Transfer::new(image));
                kind.update_status()
            }
            None => {
                self.transfer = None;
                SblStatus::UpdateImageFail
            }
        };
        self.send_update(images, status)
    }

    fn learn_peer(&mut self, sbl_version: SblVersion, info: &StatusInfo) {
        self.fw_version = match info.version_number {
            DEFAULT_FW_VERSION => 0,
            v => v,
        };
        self.peer = PeerInfo {
            sbl_version: Some(sbl_version),
            fw_version: self.fw_version,
            rollback: info.ext.map_or(0, |e| e.ver_rollback_status),
            chip_id: info.ext.map(|e| (e.chip_id0, e.chip_id1)),
        };
    }

    fn send_update(
        &mut self,
        images: &ImageRegistry<'_>,
        status: SblStatus,
    ) -> Step {
        let image_version = images.fw_version();
        let version_number = if self.fw_version < image_version
            || self.peer.rollback & VER_ROLLBACK_ENABLED != 0
        {
            image_version
        } else {
            self.fw_version
        };

        self.update = match &self.transfer {
            Some(t) => UpdateInfo {
                image_size: t.image_size,
                max_packet_size: MAX_CHUNK_SIZE as u32,
                // The header travels as a packet of its own.
                num_packets: t.remaining + 1,
                version_number,
            },
            None => UpdateInfo {
                image_size: 0,
                max_packet_size: INVALID_PACKET_SIZE,
                num_packets: 1,
                version_number,
            },
        };
        self.state = State::Update;
        Step {
            status,
            action: Action::SendUpdate(self.update),
        }
    }

    fn on_update(&mut self, event: Event) -> Step {
        if let Event::Corrupt { .. } = event {
            return self.retry(Action::SendUpdate(self.update));
        }

        match (event, self.transfer) {
            (Event::Response(Response::Ack(a)), Some(t)) => {
                self.peer_status = a.status;
                self.state = State::Data;
                Step::progress(t.header())
            }
            (Event::Response(Response::Nack(a)), _)
                if a.status() == Some(AckStatus::InvalidParam) =>
            {
                // The peer's signature does not match anything we sent;
                // start over against a freshly reset peer.
                self.peer_status = a.status;
                self.transfer = None;
                self.state = State::Hello;
                Step::progress(Action::ResetPeerThenHello)
            }
            _ => {
                self.record_ack(&event);
                self.finish(SblStatus::Fail)
            }
        }
    }

    fn on_data(&mut self, event: Event) -> Step {
        let Some(mut t) = self.transfer else {
            return self.finish(SblStatus::Fail);
        };

        if let Event::Corrupt { .. } = event {
            return self.retry(t.current());
        }

        let Some(ack) = self.record_ack(&event) else {
            return self.finish(SblStatus::Fail);
        };
        if !(ack.is_for(MsgType::Data) || ack.is_for(MsgType::UpdateStatus)) {
            return self.finish(SblStatus::Fail);
        }
        let status = ack.status();
        if !matches!(status, Some(AckStatus::Success | AckStatus::Seq)) {
            return self.finish(SblStatus::Fail);
        }

        if t.remaining > 0 {
            let action = t.chunk(t.packet_number);
            t.remaining -= 1;
            t.packet_number += 1;
            self.transfer = Some(t);
            return Step::progress(action);
        }

        if status != Some(AckStatus::Success) {
            return self.finish(SblStatus::Fail);
        }
        match t.kind {
            ImageKind::Firmware => {
                self.fw_version = t.version;
                self.state = State::ImageOk;
                Step::progress(Action::SendFwContinue)
            }
            ImageKind::Info0Patch | ImageKind::Info1Patch => {
                self.finish(SblStatus::Ok)
            }
        }
    }

    fn on_image_ok(&mut self, event: Event) -> Step {
        // The verdict is read out of whatever arrived, verified or not. A
        // bad frame still earns a FW_CONTINUE while retries remain.
        let (status, resend) = match event {
            Event::Corrupt { stale_status, .. } => {
                self.error_count += 1;
                if let Some(st) = stale_status {
                    self.peer_status = st;
                }
                let resend = if self.error_count > self.max_errors {
                    Action::None
                } else {
                    Action::SendFwContinue
                };
                (stale_status.and_then(AckStatus::from_u32), resend)
            }
            _ => (
                self.record_ack(&event).and_then(|a| a.status()),
                Action::None,
            ),
        };

        let outcome = match status {
            Some(AckStatus::Success) => SblStatus::Ok,
            // The peer checks the firmware version once the image is in; a
            // mismatch lands here.
            Some(AckStatus::InvalidOperation) => SblStatus::UpdateImageFail,
            _ => SblStatus::Fail,
        };
        Step {
            action: resend,
            ..self.finish(outcome)
        }
    }
}
