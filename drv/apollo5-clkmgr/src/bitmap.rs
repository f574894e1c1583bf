// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::ClkError;
use static_assertions::const_assert;

/// Upper bound on user ids, including the ids the manager reserves for its
/// own dependency holds.
pub const MAX_USERS: usize = 64;

/// Ids at and above this value are reserved for dependency holds.
const FIRST_RESERVED: u8 = MAX_USERS as u8 - 3;

const WORDS: usize = MAX_USERS.div_ceil(32);

const_assert!(MAX_USERS <= u8::MAX as usize + 1);
const_assert!(MAX_USERS > FIRST_RESERVED as usize);

/// Identifies one consumer of clocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct UserId(u8);

impl UserId {
    pub const HFRC_DEPENDENCY: Self = Self(FIRST_RESERVED);
    pub const HFRC2_DEPENDENCY: Self = Self(FIRST_RESERVED + 1);
    pub const SYSPLL_DEPENDENCY: Self = Self(FIRST_RESERVED + 2);

    /// Makes a caller-facing user id. The top few ids are reserved.
    pub const fn new(id: u8) -> Result<Self, ClkError> {
        if id < FIRST_RESERVED {
            Ok(Self(id))
        } else {
            Err(ClkError::InvalidArgument)
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn is_reserved(self) -> bool {
        self.0 >= FIRST_RESERVED
    }
}

/// One bit per user id.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct UserBitmap([u32; WORDS]);

impl UserBitmap {
    pub const fn new() -> Self {
        Self([0; WORDS])
    }

    fn locate(user: UserId) -> (usize, u32) {
        let bit = usize::from(user.0);
        (bit / 32, 1 << (bit % 32))
    }

    /// Returns false if the bit was already set.
    pub fn set(&mut self, user: UserId) -> bool {
        let (word, mask) = Self::locate(user);
        let was = self.0[word] & mask != 0;
        self.0[word] |= mask;
        !was
    }

    /// Returns false if the bit was already clear.
    pub fn clear(&mut self, user: UserId) -> bool {
        let (word, mask) = Self::locate(user);
        let was = self.0[word] & mask != 0;
        self.0[word] &= !mask;
        was
    }

    pub fn test(&self, user: UserId) -> bool {
        let (word, mask) = Self::locate(user);
        self.0[word] & mask != 0
    }

    pub fn count(&self) -> u32 {
        self.0.iter().map(|w| w.count_ones()).sum()
    }

    pub fn any(&self) -> bool {
        self.0.iter().any(|&w| w != 0)
    }
}
