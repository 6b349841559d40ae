//! Command frame encoding.
//!
//! The device only implements three primitive commands: writing bytes,
//! writing longs and reading longs. Every other client operation is
//! composed out of these.

use crate::ArgumentError;
use bitflags_derive::FlagsDebug;
use log::trace;
use strum::{Display, FromRepr};

/// Sync bytes that start every command and response frame.
pub(crate) const SYNC: [u8; 2] = [0x50, 0x50];

/// Size of the fixed command header (sync, details, reserved, address, length).
pub(crate) const COMMAND_HEADER_LEN: usize = 8;

/// Bits of the details byte that must match [`Status::Response`] in a response.
pub(crate) const RESERVED_MASK: u8 = 0xb8;

/// Bits of the details byte that carry the operation tag.
pub(crate) const TAG_MASK: u8 = 0x07;

/// Maximum number of bytes accepted by a single byte write.
pub const MAX_WRITE_BYTES: usize = 512;

/// Maximum number of longs accepted by a single long write.
pub const MAX_WRITE_LONGS: usize = 128;

/// Maximum number of longs returned by a single long read.
pub const MAX_READ_LONGS: u16 = 16384;

bitflags::bitflags! {
    /// Flags of the details byte found at offset 2 of every frame.
    #[derive(FlagsDebug, PartialEq, Eq, Copy, Clone)]
    pub(crate) struct Status: u8 {
        /// Always set in responses.
        const Response = 0x80;
        /// The device rejected the command.
        const Error = 0x40;
        /// The command writes to the device's memory.
        const Write = 0x04;
    }
}

/// Primitive operation implemented by the device.
///
/// The discriminant is the operation tag stored in the
/// low three bits of the details byte.
#[derive(FromRepr, Display, PartialEq, Eq, Copy, Clone, Debug)]
#[strum(serialize_all = "title_case")]
#[repr(u8)]
pub(crate) enum Operation {
    ReadLongs = 0b010,
    WriteBytes = 0b100,
    WriteLongs = 0b110,
}

impl Operation {
    /// Returns the details byte sent with the command.
    pub(crate) const fn details(self) -> u8 {
        self as u8
    }

    /// Returns `true` if the operation modifies the device's memory.
    pub(crate) const fn is_write(self) -> bool {
        self as u8 & Status::Write.bits() != 0
    }
}

/// Command sent to the device.
#[derive(Debug)]
pub(crate) struct Command {
    op: Operation,
    addr: u16,
    len: u16,
    payload: Vec<u8>,
}

impl Command {
    fn new(op: Operation, addr: u16, len: u16, payload: Vec<u8>) -> Self {
        let cmd = Self {
            op,
            addr,
            len,
            payload,
        };

        trace!("New command: {} at {addr:#06x}, length field {len:#06x}", cmd.op);

        cmd
    }

    /// Builds a byte write command.
    pub(crate) fn write_bytes(addr: u16, bytes: &[u8]) -> Result<Self, ArgumentError> {
        if bytes.is_empty() {
            return Err(ArgumentError::EmptyRequest);
        }

        if bytes.len() > MAX_WRITE_BYTES {
            return Err(ArgumentError::ByteWriteTooLarge(bytes.len()));
        }

        let len = u16::try_from(bytes.len() - 1)
            .map_err(|_| ArgumentError::ByteWriteTooLarge(bytes.len()))?;

        Ok(Self::new(Operation::WriteBytes, addr, len, bytes.to_vec()))
    }

    /// Builds a long write command.
    ///
    /// Only the low byte of the length field is used.
    pub(crate) fn write_longs(addr: u16, longs: &[u32]) -> Result<Self, ArgumentError> {
        if longs.is_empty() {
            return Err(ArgumentError::EmptyRequest);
        }

        if longs.len() > MAX_WRITE_LONGS {
            return Err(ArgumentError::LongWriteTooLarge(longs.len()));
        }

        if addr % 4 != 0 {
            return Err(ArgumentError::MisalignedAddress(addr));
        }

        let len = u8::try_from(longs.len() - 1)
            .map_err(|_| ArgumentError::LongWriteTooLarge(longs.len()))?;
        let payload = longs.iter().flat_map(|val| val.to_le_bytes()).collect();

        Ok(Self::new(Operation::WriteLongs, addr, len.into(), payload))
    }

    /// Builds a long read command.
    pub(crate) fn read_longs(addr: u16, count: u16) -> Result<Self, ArgumentError> {
        if count == 0 {
            return Err(ArgumentError::EmptyRequest);
        }

        if count > MAX_READ_LONGS {
            return Err(ArgumentError::LongReadTooLarge(count));
        }

        if addr % 4 != 0 {
            return Err(ArgumentError::MisalignedAddress(addr));
        }

        Ok(Self::new(Operation::ReadLongs, addr, count - 1, Vec::new()))
    }

    /// Returns the command's operation.
    pub(crate) fn operation(&self) -> Operation {
        self.op
    }

    /// Returns the number of items the command transfers.
    pub(crate) fn count(&self) -> usize {
        usize::from(self.len) + 1
    }
}

impl From<Command> for Vec<u8> {
    fn from(cmd: Command) -> Self {
        let mut buf = Vec::with_capacity(COMMAND_HEADER_LEN + cmd.payload.len());

        buf.extend_from_slice(&SYNC);
        buf.push(cmd.op.details());
        buf.push(0x00);
        buf.extend_from_slice(&cmd.addr.to_le_bytes());
        buf.extend_from_slice(&cmd.len.to_le_bytes());
        buf.extend(cmd.payload);

        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::init_logger;

    #[test]
    fn write_bytes() -> Result<(), ArgumentError> {
        init_logger();

        let frame: Vec<u8> = Command::write_bytes(0xabcd, &[0x11, 0x22, 0x33])?.into();

        assert_eq!(
            frame,
            [0x50, 0x50, 0x04, 0x00, 0xcd, 0xab, 0x02, 0x00, 0x11, 0x22, 0x33],
            "frame contents should be correct"
        );

        Ok(())
    }

    #[test]
    fn write_bytes_maximum() -> Result<(), ArgumentError> {
        init_logger();

        let frame: Vec<u8> = Command::write_bytes(0x0000, &[0xaa; MAX_WRITE_BYTES])?.into();

        assert_eq!(frame.len(), 520, "frame length should be correct");
        assert_eq!(frame[6..8], [0xff, 0x01], "length field should be correct");

        Ok(())
    }

    #[test]
    fn write_longs() -> Result<(), ArgumentError> {
        init_logger();

        let frame: Vec<u8> = Command::write_longs(0x1234, &[0x4433_2211, 0xdead_beef])?.into();

        assert_eq!(
            frame,
            [
                0x50, 0x50, 0x06, 0x00, 0x34, 0x12, 0x01, 0x00, 0x11, 0x22, 0x33, 0x44, 0xef,
                0xbe, 0xad, 0xde
            ],
            "frame contents should be correct"
        );

        Ok(())
    }

    #[test]
    fn write_longs_maximum() -> Result<(), ArgumentError> {
        init_logger();

        let frame: Vec<u8> = Command::write_longs(0x0100, &[0x00; MAX_WRITE_LONGS])?.into();

        assert_eq!(frame.len(), 8 + 512, "frame length should be correct");
        assert_eq!(frame[6..8], [0x7f, 0x00], "length field should be correct");

        Ok(())
    }

    #[test]
    fn read_longs() -> Result<(), ArgumentError> {
        init_logger();

        let frame: Vec<u8> = Command::read_longs(0xfffc, MAX_READ_LONGS)?.into();

        assert_eq!(
            frame,
            [0x50, 0x50, 0x02, 0x00, 0xfc, 0xff, 0xff, 0x3f],
            "frame contents should be correct"
        );

        Ok(())
    }

    #[test]
    fn operation_tags() {
        assert_eq!(Operation::WriteBytes.details(), 0b100, "tag should be correct");
        assert_eq!(Operation::WriteLongs.details(), 0b110, "tag should be correct");
        assert_eq!(Operation::ReadLongs.details(), 0b010, "tag should be correct");
        assert!(Operation::WriteLongs.is_write(), "long write should be a write");
        assert!(!Operation::ReadLongs.is_write(), "long read should not be a write");
        assert_eq!(
            Operation::from_repr(0b110),
            Some(Operation::WriteLongs),
            "tag should decode"
        );
    }

    #[test]
    fn error_invalid_argument() {
        init_logger();

        assert_eq!(
            Command::write_bytes(0x0000, &[0x00; 513]).unwrap_err(),
            ArgumentError::ByteWriteTooLarge(513),
            "oversized byte write should be rejected"
        );
        assert_eq!(
            Command::write_bytes(0x0000, &[]).unwrap_err(),
            ArgumentError::EmptyRequest,
            "empty byte write should be rejected"
        );
        assert_eq!(
            Command::write_longs(0x0000, &[0x00; 129]).unwrap_err(),
            ArgumentError::LongWriteTooLarge(129),
            "oversized long write should be rejected"
        );
        assert_eq!(
            Command::write_longs(0x0002, &[0x00]).unwrap_err(),
            ArgumentError::MisalignedAddress(0x0002),
            "misaligned long write should be rejected"
        );
        assert_eq!(
            Command::read_longs(0x0000, 0).unwrap_err(),
            ArgumentError::EmptyRequest,
            "empty long read should be rejected"
        );
        assert_eq!(
            Command::read_longs(0x0000, 16385).unwrap_err(),
            ArgumentError::LongReadTooLarge(16385),
            "oversized long read should be rejected"
        );
        assert_eq!(
            Command::read_longs(0x0003, 1).unwrap_err(),
            ArgumentError::MisalignedAddress(0x0003),
            "misaligned long read should be rejected"
        );
    }
}
