// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types for messages exchanged between the host MCU and the secondary
//! bootloader (SBL) of the Cooper BLE controller.
//!
//! Every frame starts with a [`Header`]: a CRC-32, a message type, and the
//! total length of the frame in bytes (header included). All fields are
//! little-endian. The CRC covers everything after itself, from the message
//! type up to the declared length, so a receiver must recompute it before
//! trusting any status field in the body.

#![cfg_attr(not(test), no_std)]

use crc::{Crc, CRC_32_ISO_HDLC};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Size of the CRC field that leads every frame.
pub const CRC_SIZE: usize = core::mem::size_of::<u32>();

/// Size of [`Header`].
pub const HEADER_SIZE: usize = core::mem::size_of::<Header>();

/// Largest chunk of image data carried by one DATA frame.
pub const MAX_CHUNK_SIZE: usize = 512;

/// Size of the image header, always sent alone as DATA packet 0.
pub const IMAGE_HEADER_SIZE: usize = 64;

/// `maxPacketSize` value sent in UPDATE when the host has no image to offer,
/// which makes the peer NACK and clear its pending update signature.
pub const INVALID_PACKET_SIZE: u32 = 0xFFFF_FFFF;

/// Firmware version reported by a peer with no firmware programmed.
pub const DEFAULT_FW_VERSION: u32 = 0xFFFF_FFFF;

/// Bit in `verRollBackStatus` set when the peer permits version rollback.
pub const VER_ROLLBACK_ENABLED: u32 = 0x1;

/// Offset of the little-endian firmware version inside a firmware image.
pub const IMAGE_VERSION_OFFSET: usize = 24;

/// Size of a buffer that can hold any frame of the protocol, in either
/// direction: a DATA header plus a full chunk.
pub const WORK_BUFFER_SIZE: usize = DATA_HEADER_SIZE + MAX_CHUNK_SIZE;

const DATA_HEADER_SIZE: usize = core::mem::size_of::<DataHeader>();

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum MsgType {
    Hello = 0,
    Status = 1,
    UpdateStatus = 2,
    Update = 3,
    Data = 4,
    Ack = 5,
    Nack = 6,
    Reset = 7,
    FwContinue = 8,
}

/// `bootStatus` reported by the peer in a STATUS frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum BootStatus {
    Success = 0,
    Failure = 1,
    BadImage = 2,
    FwUpdateRequired = 3,
    Info0UpdateRequired = 4,
    Info1UpdateRequired = 5,
}

/// `status` carried by an ACK or NACK frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum AckStatus {
    Success = 0,
    Failure = 1,
    BadImage = 2,
    InvalidParam = 3,
    InvalidOperation = 4,
    MsgTooBig = 5,
    Seq = 6,
}

/// Generation of the peer's bootloader, from the `sblVersion` field.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum SblVersion {
    V1 = 1,
    /// V2 bootloaders append rollback configuration and chip ids to STATUS.
    V2 = 2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than a header.
    TooShort,
    /// The declared length is shorter than a header or longer than what was
    /// received.
    BadLength,
    BadCrc,
    /// The CRC matched but the body does not have the shape its type demands.
    Malformed,
    /// The destination buffer cannot hold the frame.
    BufferTooSmall,
}

#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct Header {
    pub crc: U32,
    pub msg_type: U16,
    pub length: U16,
}

#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct StatusV1 {
    pub header: Header,
    pub version_number: U32,
    pub max_image_size: U32,
    pub boot_status: U32,
    pub sbl_version: U32,
}

#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct StatusV2 {
    pub v1: StatusV1,
    pub ver_rollback_status: U32,
    pub chip_id0: U32,
    pub chip_id1: U32,
}

#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct Update {
    pub header: Header,
    pub image_size: U32,
    pub max_packet_size: U32,
    pub num_packets: U32,
    pub version_number: U32,
}

/// Fixed part of a DATA frame; the payload follows immediately.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct DataHeader {
    pub header: Header,
    pub packet_number: U32,
}

#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct AckNack {
    pub header: Header,
    pub src_msg_type: U32,
    pub status: U32,
    pub seq_no: U32,
}

const_assert_eq!(HEADER_SIZE, 8);
const_assert_eq!(core::mem::size_of::<StatusV1>(), 24);
const_assert_eq!(core::mem::size_of::<StatusV2>(), 36);
const_assert_eq!(core::mem::size_of::<Update>(), 24);
const_assert_eq!(DATA_HEADER_SIZE, 12);
const_assert_eq!(core::mem::size_of::<AckNack>(), 20);
const_assert_eq!(WORK_BUFFER_SIZE, 8 + 4 + 512);

/// Length of a STATUS frame from a V1 bootloader.
pub const STATUS_V1_SIZE: usize = core::mem::size_of::<StatusV1>();
/// Length of a STATUS frame from a V2 bootloader.
pub const STATUS_V2_SIZE: usize = core::mem::size_of::<StatusV2>();

/// Returns true if `len` is the length of some STATUS frame.
pub fn is_status_size(len: usize) -> bool {
    len == STATUS_V1_SIZE || len == STATUS_V2_SIZE
}

/// The fields of an UPDATE frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UpdateInfo {
    pub image_size: u32,
    pub max_packet_size: u32,
    pub num_packets: u32,
    pub version_number: u32,
}

/// Fields only present in STATUS from a V2 bootloader.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusExt {
    pub ver_rollback_status: u32,
    pub chip_id0: u32,
    pub chip_id1: u32,
}

/// The fields of a STATUS frame. Status codes are kept raw so that values
/// this host does not know about survive to be reported.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusInfo {
    pub version_number: u32,
    pub max_image_size: u32,
    pub boot_status: u32,
    pub sbl_version: u32,
    pub ext: Option<StatusExt>,
}

impl StatusInfo {
    pub fn boot_status(&self) -> Option<BootStatus> {
        BootStatus::from_u32(self.boot_status)
    }

    pub fn sbl_version(&self) -> Option<SblVersion> {
        SblVersion::from_u32(self.sbl_version)
    }
}

/// The fields of an ACK or NACK frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AckInfo {
    pub src_msg_type: u32,
    pub status: u32,
    pub seq_no: u32,
}

impl AckInfo {
    pub fn status(&self) -> Option<AckStatus> {
        AckStatus::from_u32(self.status)
    }

    /// Returns true if this acknowledges a frame of type `t`.
    pub fn is_for(&self, t: MsgType) -> bool {
        self.src_msg_type == t as u32
    }
}

/// A received frame whose CRC has been verified.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Status(StatusInfo),
    Ack(AckInfo),
    Nack(AckInfo),
    /// A well-formed frame of a type the host never expects to receive.
    Other(u16),
}

fn crc_of(frame: &[u8]) -> u32 {
    CRC32.checksum(&frame[CRC_SIZE..])
}

/// Stamps the header of the `len`-byte frame at the front of `buf` and
/// fills in its CRC. The body must already be in place.
fn seal(buf: &mut [u8], msg_type: MsgType, len: usize) -> Result<usize, FrameError> {
    let frame = buf.get_mut(..len).ok_or(FrameError::BufferTooSmall)?;
    let length = u16::try_from(len).map_err(|_| FrameError::BufferTooSmall)?;
    let (header, _) = Header::mut_from_prefix(&mut *frame)
        .map_err(|_| FrameError::BufferTooSmall)?;
    header.msg_type.set(msg_type as u16);
    header.length.set(length);
    let crc = crc_of(frame);
    frame[..CRC_SIZE].copy_from_slice(&crc.to_le_bytes());
    Ok(len)
}

fn write_body<T: IntoBytes + Immutable>(
    buf: &mut [u8],
    msg_type: MsgType,
    body: &T,
) -> Result<usize, FrameError> {
    let len = core::mem::size_of::<T>();
    buf.get_mut(..len)
        .ok_or(FrameError::BufferTooSmall)?
        .copy_from_slice(body.as_bytes());
    seal(buf, msg_type, len)
}

fn blank_header() -> Header {
    Header {
        crc: U32::new(0),
        msg_type: U16::new(0),
        length: U16::new(0),
    }
}

/// Writes a frame that has no body (HELLO, RESET, FW_CONTINUE) into `buf`,
/// returning its length.
pub fn write_bare(buf: &mut [u8], msg_type: MsgType) -> Result<usize, FrameError> {
    write_body(buf, msg_type, &blank_header())
}

pub fn write_update(buf: &mut [u8], info: &UpdateInfo) -> Result<usize, FrameError> {
    let body = Update {
        header: blank_header(),
        image_size: U32::new(info.image_size),
        max_packet_size: U32::new(info.max_packet_size),
        num_packets: U32::new(info.num_packets),
        version_number: U32::new(info.version_number),
    };
    write_body(buf, MsgType::Update, &body)
}

/// Writes a DATA frame carrying `payload` as packet `packet_number`.
pub fn write_data(
    buf: &mut [u8],
    packet_number: u32,
    payload: &[u8],
) -> Result<usize, FrameError> {
    let len = DATA_HEADER_SIZE + payload.len();
    let frame = buf.get_mut(..len).ok_or(FrameError::BufferTooSmall)?;
    let (head, rest) = frame.split_at_mut(DATA_HEADER_SIZE);
    let body = DataHeader {
        header: blank_header(),
        packet_number: U32::new(packet_number),
    };
    head.copy_from_slice(body.as_bytes());
    rest.copy_from_slice(payload);
    seal(buf, MsgType::Data, len)
}

/// Writes a STATUS frame, V2-shaped if `info.ext` is present. Used by
/// anything standing in for the peer.
pub fn write_status(buf: &mut [u8], info: &StatusInfo) -> Result<usize, FrameError> {
    let v1 = StatusV1 {
        header: blank_header(),
        version_number: U32::new(info.version_number),
        max_image_size: U32::new(info.max_image_size),
        boot_status: U32::new(info.boot_status),
        sbl_version: U32::new(info.sbl_version),
    };
    match info.ext {
        None => write_body(buf, MsgType::Status, &v1),
        Some(ext) => {
            let v2 = StatusV2 {
                v1,
                ver_rollback_status: U32::new(ext.ver_rollback_status),
                chip_id0: U32::new(ext.chip_id0),
                chip_id1: U32::new(ext.chip_id1),
            };
            write_body(buf, MsgType::Status, &v2)
        }
    }
}

/// Writes an ACK (`ack == true`) or NACK frame.
pub fn write_ack(buf: &mut [u8], ack: bool, info: &AckInfo) -> Result<usize, FrameError> {
    let body = AckNack {
        header: blank_header(),
        src_msg_type: U32::new(info.src_msg_type),
        status: U32::new(info.status),
        seq_no: U32::new(info.seq_no),
    };
    let t = if ack { MsgType::Ack } else { MsgType::Nack };
    write_body(buf, t, &body)
}

/// Checks the header and CRC of the frame at the front of `buf`, returning
/// the frame (trimmed to its declared length) on success.
pub fn verify(buf: &[u8]) -> Result<&[u8], FrameError> {
    let (header, _) = Header::ref_from_prefix(buf).map_err(|_| FrameError::TooShort)?;
    let len = usize::from(header.length.get());
    if len < HEADER_SIZE || len > buf.len() {
        return Err(FrameError::BadLength);
    }
    let frame = &buf[..len];
    if crc_of(frame) != header.crc.get() {
        return Err(FrameError::BadCrc);
    }
    Ok(frame)
}

/// Verifies and decodes a frame received from the peer.
pub fn decode(buf: &[u8]) -> Result<Response, FrameError> {
    let frame = verify(buf)?;
    let (header, _) = Header::ref_from_prefix(frame).map_err(|_| FrameError::TooShort)?;
    let raw_type = header.msg_type.get();
    match MsgType::from_u16(raw_type) {
        Some(MsgType::Status) => decode_status(frame).map(Response::Status),
        Some(MsgType::Ack) => decode_ack(frame).map(Response::Ack),
        Some(MsgType::Nack) => decode_ack(frame).map(Response::Nack),
        _ => Ok(Response::Other(raw_type)),
    }
}

fn decode_status(frame: &[u8]) -> Result<StatusInfo, FrameError> {
    match frame.len() {
        STATUS_V1_SIZE => {
            let s = StatusV1::read_from_bytes(frame).map_err(|_| FrameError::Malformed)?;
            Ok(status_v1(&s, None))
        }
        STATUS_V2_SIZE => {
            let s = StatusV2::read_from_bytes(frame).map_err(|_| FrameError::Malformed)?;
            let ext = StatusExt {
                ver_rollback_status: s.ver_rollback_status.get(),
                chip_id0: s.chip_id0.get(),
                chip_id1: s.chip_id1.get(),
            };
            Ok(status_v1(&s.v1, Some(ext)))
        }
        _ => Err(FrameError::Malformed),
    }
}

fn status_v1(s: &StatusV1, ext: Option<StatusExt>) -> StatusInfo {
    StatusInfo {
        version_number: s.version_number.get(),
        max_image_size: s.max_image_size.get(),
        boot_status: s.boot_status.get(),
        sbl_version: s.sbl_version.get(),
        ext,
    }
}

fn decode_ack(frame: &[u8]) -> Result<AckInfo, FrameError> {
    let (a, _) = AckNack::read_from_prefix(frame).map_err(|_| FrameError::Malformed)?;
    Ok(AckInfo {
        src_msg_type: a.src_msg_type.get(),
        status: a.status.get(),
        seq_no: a.seq_no.get(),
    })
}

/// Reads the `status` field of an ACK/NACK-shaped frame without checking
/// its CRC. Used where a stale status is still informative.
pub fn peek_ack_status(buf: &[u8]) -> Option<u32> {
    AckNack::read_from_prefix(buf).ok().map(|(a, _)| a.status.get())
}

/// Extracts the firmware version embedded in a firmware image.
pub fn image_version(image: &[u8]) -> Option<u32> {
    let bytes = image.get(IMAGE_VERSION_OFFSET..IMAGE_VERSION_OFFSET + 4)?;
    let (v, _) = U32::read_from_prefix(bytes).ok()?;
    Some(v.get())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn bare_frames() {
        let mut buf = [0u8; 16];
        let n = write_bare(&mut buf, MsgType::Hello).unwrap();
        assert_eq!(n, HEADER_SIZE);
        assert_eq!(&buf[4..8], &[0, 0, 8, 0]);
        assert_eq!(decode(&buf[..n]).unwrap(), Response::Other(MsgType::Hello as u16));
    }

    #[test]
    fn crc_is_standard_crc32() {
        let mut buf = [0u8; 8];
        write_bare(&mut buf, MsgType::FwContinue).unwrap();
        let expected = CRC32.checksum(&[8, 0, 8, 0]);
        assert_eq!(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]), expected);
        // CRC-32/ISO-HDLC check value
        assert_eq!(CRC32.checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn status_shapes() {
        let mut buf = [0u8; 64];
        let v1 = StatusInfo {
            version_number: 3,
            max_image_size: 0x4_0000,
            boot_status: BootStatus::Success as u32,
            sbl_version: SblVersion::V1 as u32,
            ext: None,
        };
        let n = write_status(&mut buf, &v1).unwrap();
        assert_eq!(n, STATUS_V1_SIZE);
        assert_eq!(decode(&buf[..n]).unwrap(), Response::Status(v1));

        let v2 = StatusInfo {
            sbl_version: SblVersion::V2 as u32,
            ext: Some(StatusExt {
                ver_rollback_status: VER_ROLLBACK_ENABLED,
                chip_id0: 0x1234,
                chip_id1: 0x5678,
            }),
            ..v1
        };
        let n = write_status(&mut buf, &v2).unwrap();
        assert_eq!(n, STATUS_V2_SIZE);
        assert_eq!(decode(&buf[..n]).unwrap(), Response::Status(v2));
    }

    #[test]
    fn status_of_odd_size_is_malformed() {
        let mut buf = [0u8; 64];
        let n = write_data(&mut buf, 0, &[0; 20]).unwrap();
        // Retag the DATA frame as STATUS and reseal it.
        seal(&mut buf, MsgType::Status, n).unwrap();
        assert_eq!(decode(&buf[..n]), Err(FrameError::Malformed));
    }

    #[test]
    fn data_frame_layout() {
        let mut buf = [0u8; WORK_BUFFER_SIZE];
        let payload = [0xa5u8; MAX_CHUNK_SIZE];
        let n = write_data(&mut buf, 7, &payload).unwrap();
        assert_eq!(n, WORK_BUFFER_SIZE);
        assert_eq!(&buf[8..12], &7u32.to_le_bytes());
        assert!(buf[12..].iter().all(|&b| b == 0xa5));
        assert!(verify(&buf).is_ok());

        let mut small = [0u8; 16];
        assert_eq!(write_data(&mut small, 0, &payload), Err(FrameError::BufferTooSmall));
    }

    #[test]
    fn update_with_sentinel() {
        let mut buf = [0u8; 32];
        let info = UpdateInfo {
            image_size: 0,
            max_packet_size: INVALID_PACKET_SIZE,
            num_packets: 1,
            version_number: 0,
        };
        let n = write_update(&mut buf, &info).unwrap();
        let (u, _) = Update::read_from_prefix(&buf[..n]).unwrap();
        assert_eq!(u.max_packet_size.get(), INVALID_PACKET_SIZE);
        assert_eq!(u.header.msg_type.get(), MsgType::Update as u16);
    }

    #[test]
    fn ack_and_nack() {
        let mut buf = [0u8; 32];
        let info = AckInfo {
            src_msg_type: MsgType::Update as u32,
            status: AckStatus::InvalidParam as u32,
            seq_no: 0,
        };
        let n = write_ack(&mut buf, false, &info).unwrap();
        let Response::Nack(got) = decode(&buf[..n]).unwrap() else {
            panic!("expected NACK");
        };
        assert!(got.is_for(MsgType::Update));
        assert_eq!(got.status(), Some(AckStatus::InvalidParam));
        assert_eq!(peek_ack_status(&buf[..n]), Some(AckStatus::InvalidParam as u32));
    }

    #[test]
    fn bad_lengths() {
        assert_eq!(verify(&[0u8; 4]), Err(FrameError::TooShort));

        let mut buf = [0u8; 8];
        write_bare(&mut buf, MsgType::Hello).unwrap();
        buf[6] = 200;
        assert_eq!(verify(&buf), Err(FrameError::BadLength));
        buf[6] = 2;
        assert_eq!(verify(&buf), Err(FrameError::BadLength));
    }

    #[test]
    fn image_version_is_little_endian() {
        let mut image = [0u8; 64];
        image[24..28].copy_from_slice(&[0x05, 0x00, 0x00, 0x00]);
        assert_eq!(image_version(&image), Some(5));
        assert_eq!(image_version(&image[..26]), None);
    }

    proptest! {
        #[test]
        fn crc_round_trip(
            packet in any::<u32>(),
            payload in proptest::collection::vec(any::<u8>(), 0..=MAX_CHUNK_SIZE),
        ) {
            let mut buf = [0u8; WORK_BUFFER_SIZE];
            let n = write_data(&mut buf, packet, &payload).unwrap();
            prop_assert_eq!(verify(&buf[..n]).map(|f| f.len()), Ok(n));
        }

        #[test]
        fn single_byte_corruption_is_caught(
            payload in proptest::collection::vec(any::<u8>(), 0..=64),
            pos in any::<proptest::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let mut buf = [0u8; WORK_BUFFER_SIZE];
            let n = write_data(&mut buf, 1, &payload).unwrap();
            let i = pos.index(n);
            buf[i] ^= flip;
            prop_assert!(verify(&buf[..n]).is_err());
        }
    }
}
