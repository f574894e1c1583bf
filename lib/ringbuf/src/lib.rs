// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for tracing drivers
//!
//! This contains an implementation of a fixed-size ring buffer designed to be
//! embedded in the context object of a driver and used to instrument it. The
//! buffer is owned by whatever logs into it rather than living in a static,
//! so two instances of a driver (or two tests) never share a history.
//!
//! ## Constraints
//!
//! The type in the ring buffer must implement both `Copy` and `PartialEq`.
//!
//! ## Creating a ring buffer
//!
//! A ring buffer is a plain field, built with [`Ringbuf::new`] from the
//! payload every slot starts out holding:
//!
//! ```
//! struct Driver {
//!     trace: Ringbuf<Trace, 16>,
//! }
//!
//! let d = Driver { trace: Ringbuf::new(Trace::None) };
//! ```
//!
//! Entries are recorded with [`ringbuf_entry!`], which stamps each one with
//! the source line it came from:
//!
//! ```
//! ringbuf_entry!(self.trace, Trace::Sent(MsgType::Hello));
//! ```
//!
//! ## Reading a ring buffer
//!
//! [`Ringbuf::iter`] walks the recorded entries from oldest to newest and
//! [`Ringbuf::last`] returns the most recent one. Under a debugger the
//! structure prints directly:
//!
//! ```console
//! (gdb) print sbl.trace
//! $1 = ringbuf::Ringbuf<drv_cooper_sbl::Trace, 32> {
//!  last: core::option::Option<usize>::Some(3),
//!  buffer: [
//!    ringbuf::RingbufEntry<drv_cooper_sbl::Trace> {
//!      line: 212,
//!      generation: 1,
//!      count: 5,
//!      payload: drv_cooper_sbl::Trace::CrcError
//!    },...
//! ```

#![cfg_attr(not(test), no_std)]

/// Inserts data into a ring buffer.
///
/// `ringbuf_entry!(place, expr)` will insert `expr` into the [`Ringbuf`] at
/// `place`, which must be a mutable place expression such as `self.trace`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate the payload before borrowing the buffer, so the payload
        // expression may itself read from the structure holding the buffer.
        let p = $payload;
        $crate::Ringbuf::entry(&mut $buf, line!() as u16, p);
    }};
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$buf;
        let _ = &$payload;
    }};
}

///
/// The structure of a single [`Ringbuf`] entry, carrying a payload of arbitrary
/// type.  When a ring buffer entry is generated with an identical payload to
/// the most recent entry (in terms of both `line` and `payload`), `count` will
/// be incremented rather than generating a new entry.
///
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

///
/// A ring buffer of parametrized type and size.
///
#[derive(Debug, Clone)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    last: Option<usize>,
    buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    /// Makes an empty ring buffer whose slots all start out holding `init`.
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // On first use, last is None. Treating it as an out-of-range index
        // keeps us from bumping the count of a slot that was never written
        // and lands the first entry in slot 0.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                // Only reuse this entry if we don't overflow the count.
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        // Not a remainder: most of our targets lack a hardware divide, and
        // this form also turns usize::MAX into 0 for the starting condition.
        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        // A zero-sized buffer records nothing.
        let Some(ent) = self.buffer.get_mut(ndx) else {
            return;
        };
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// Returns the most recently recorded entry, if any.
    pub fn last(&self) -> Option<&RingbufEntry<T>> {
        self.last.and_then(|ndx| self.buffer.get(ndx))
    }

    /// Walks the recorded entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = match self.last {
            Some(last) => last + 1,
            None => self.buffer.len(),
        };
        let (newer, older) = self.buffer.split_at(start.min(N));
        older
            .iter()
            .chain(newer.iter())
            .filter(|ent| ent.generation != 0)
    }

    /// Forgets every recorded entry.
    pub fn clear(&mut self) {
        self.last = None;
        for ent in self.buffer.iter_mut() {
            ent.generation = 0;
            ent.count = 0;
        }
    }
}
