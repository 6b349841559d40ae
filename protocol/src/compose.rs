//! Composition of byte reads out of long reads.
//!
//! The device can only read 32-bit-aligned longs. An arbitrary byte range is
//! covered by one long read, whose result is then split into the bytes of the
//! first long at or after the requested address (head), whole longs (middle)
//! and the leading bytes of the last long (tail).

use crate::{ArgumentError, command::MAX_READ_LONGS};
use log::debug;

/// Maximum number of bytes accepted by a single byte read.
pub const MAX_READ_BYTES: u32 = 65536;

/// Aligned long range covering a requested byte range.
#[derive(PartialEq, Eq, Debug)]
pub(crate) struct LongSpan {
    long_addr: u16,
    long_count: u16,
    offset: usize,
    head: usize,
    middle: usize,
    tail: usize,
    wrap: bool,
}

impl LongSpan {
    /// Computes the long range covering `count` bytes starting at `addr`.
    pub(crate) fn new(addr: u16, count: u32) -> Result<Self, ArgumentError> {
        if count == 0 {
            return Err(ArgumentError::EmptyRequest);
        }

        if count > MAX_READ_BYTES {
            return Err(ArgumentError::ByteReadTooLarge(count));
        }

        let long_addr = addr & !0b11;
        let last_long_addr = (u32::from(addr) + count - 1) & !0b11;
        let mut long_count = (last_long_addr - u32::from(long_addr)) / 4 + 1;

        // Close to 64 KiB starting at an unaligned address, the first and last
        // long are the same long once the address space wraps around
        let wrap = long_count > u32::from(MAX_READ_LONGS);

        if wrap {
            long_count = MAX_READ_LONGS.into();
        }

        let long_count =
            u16::try_from(long_count).map_err(|_| ArgumentError::ByteReadTooLarge(count))?;
        let count = usize::try_from(count).map_err(|_| ArgumentError::ByteReadTooLarge(count))?;
        let offset = usize::from(addr - long_addr);

        // A short read may end before the first long does
        let head = ((4 - offset) % 4).min(count);
        let tail = (count - head) % 4;
        let middle = (count - head - tail) / 4;

        let span = Self {
            long_addr,
            long_count,
            offset,
            head,
            middle,
            tail,
            wrap,
        };

        debug!("Composing {count} bytes at {addr:#06x} from {span:?}");

        Ok(span)
    }

    /// Returns the aligned address of the first long.
    pub(crate) fn long_addr(&self) -> u16 {
        self.long_addr
    }

    /// Returns the number of longs to read.
    pub(crate) fn long_count(&self) -> u16 {
        self.long_count
    }

    /// Extracts the requested bytes from the longs read for this span.
    pub(crate) fn extract(&self, longs: &[u32]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.head + self.middle * 4 + self.tail);
        let mut iter = longs.iter();

        if self.head > 0 {
            if let Some(first) = iter.next() {
                bytes.extend_from_slice(&first.to_le_bytes()[self.offset..self.offset + self.head]);
            }
        }

        bytes.extend(
            iter.by_ref()
                .take(self.middle)
                .flat_map(|val| val.to_le_bytes()),
        );

        if self.tail > 0 {
            let last = if self.wrap { longs.first() } else { iter.next() };

            if let Some(last) = last {
                bytes.extend_from_slice(&last.to_le_bytes()[..self.tail]);
            }
        }

        bytes
    }
}
