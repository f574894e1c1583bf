// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Images the host can offer to the controller's bootloader.

use cooper_sbl_messages::{image_version, IMAGE_HEADER_SIZE};
use enum_map::{Enum, EnumMap};

use crate::SblError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum ImageKind {
    Firmware,
    Info0Patch,
    Info1Patch,
}

/// A registered image: the bytes (64-byte header followed by the data to
/// stream) plus what we learned about it at registration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UpdateImage<'a> {
    bytes: &'a [u8],
    kind: ImageKind,
    version: u32,
}

impl<'a> UpdateImage<'a> {
    /// Wraps `bytes` as an image of type `kind`. Fails if the image cannot
    /// even hold its own header, or is too large to describe on the wire.
    pub fn new(kind: ImageKind, bytes: &'a [u8]) -> Result<Self, SblError> {
        if bytes.len() < IMAGE_HEADER_SIZE || u32::try_from(bytes.len()).is_err() {
            return Err(SblError::InvalidArgument);
        }
        // Only firmware images carry a version; patches report 0.
        let version = match kind {
            ImageKind::Firmware => {
                image_version(bytes).ok_or(SblError::InvalidArgument)?
            }
            ImageKind::Info0Patch | ImageKind::Info1Patch => 0,
        };
        Ok(Self {
            bytes,
            kind,
            version,
        })
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn size(&self) -> u32 {
        // Checked in `new`.
        self.bytes.len() as u32
    }
}

/// The set of images registered by the application at startup, one slot per
/// [`ImageKind`].
#[derive(Clone, Debug, Default)]
pub struct ImageRegistry<'a> {
    images: EnumMap<ImageKind, Option<UpdateImage<'a>>>,
}

impl<'a> ImageRegistry<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fw_image(&mut self, bytes: &'a [u8]) -> Result<(), SblError> {
        self.register(UpdateImage::new(ImageKind::Firmware, bytes)?);
        Ok(())
    }

    pub fn set_info0_patch(&mut self, bytes: &'a [u8]) -> Result<(), SblError> {
        self.register(UpdateImage::new(ImageKind::Info0Patch, bytes)?);
        Ok(())
    }

    pub fn set_info1_patch(&mut self, bytes: &'a [u8]) -> Result<(), SblError> {
        self.register(UpdateImage::new(ImageKind::Info1Patch, bytes)?);
        Ok(())
    }

    pub fn register(&mut self, image: UpdateImage<'a>) {
        self.images[image.kind()] = Some(image);
    }

    pub fn get(&self, kind: ImageKind) -> Option<&UpdateImage<'a>> {
        self.images[kind].as_ref()
    }

    /// Version of the registered firmware image, or 0 if there is none.
    pub fn fw_version(&self) -> u32 {
        self.get(ImageKind::Firmware).map_or(0, UpdateImage::version)
    }
}
