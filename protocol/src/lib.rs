//! Peek and poke the hub memory of a remote microcontroller.
//!
//! # Overview
//!
//! The `peekpoke` crate implements the host side of the PeekPoke protocol.
//! The device firmware only implements three primitive commands:
//!
//! - **Write bytes:** up to 512 bytes at any address.
//! - **Write longs:** up to 128 longs at a long-aligned address.
//! - **Read longs:** up to 16384 longs from a long-aligned address.
//!
//! The [`PeekPoke`] client exposes these commands and composes byte reads of
//! any alignment out of a single long read. Every operation blocks the calling
//! thread until the transaction has ended.
//!
//! # Transports
//!
//! The client does not own the link to the device. Commands are handed to a
//! [`Transport`], which delivers the device's responses through a
//! [`ResponseSink`], typically from its own thread. Every response is
//! validated against the command that produced it before the caller is
//! released.
//!
//! ```no_run
//! # fn example<T: peekpoke::Transport>(transport: T) -> peekpoke::Result<(), T::Error> {
//! let mut client = peekpoke::PeekPoke::new(transport);
//!
//! client.write_bytes(0x1000, b"hello")?;
//!
//! let data = client.read_bytes(0x1000, 5)?;
//!
//! println!("Hub memory: {data:02x?}");
//! # Ok(())
//! # }
//! ```
//!
//! Devices that are not at the default link-layer address are selected
//! using a [`Config`]:
//!
//! ```no_run
//! # fn example<T: peekpoke::Transport>(transport: T) -> peekpoke::Result<(), T::Error> {
//! let config = peekpoke::Config::with_address(5)?;
//! let mut client = peekpoke::PeekPoke::with_config(transport, config);
//!
//! let longs = client.read_longs(0x0000, 16)?;
//!
//! println!("First long: {:#010x}", longs[0]);
//! # Ok(())
//! # }
//! ```
//!
//! # Protocol details
//!
//! Commands and responses start with the sync bytes `0x50 0x50`, followed by a
//! details byte carrying the operation tag. Long reads are answered by a
//! sequence of numbered 512-byte chunks, the last one of which is flagged as
//! final by the transport. The hub address space is 64 KiB and wraps around.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod command;
mod compose;
mod response;
mod transport;

#[cfg(any(test, feature = "sim"))]
#[cfg_attr(docsrs, doc(cfg(feature = "sim")))]
pub mod sim;

pub use command::{MAX_READ_LONGS, MAX_WRITE_BYTES, MAX_WRITE_LONGS};
pub use compose::MAX_READ_BYTES;
pub use response::{DeviceError, ProtocolError};
pub use transport::{ResponseSink, Transport};

use command::Command;
use compose::LongSpan;
use core::fmt::{Display, Formatter};
use log::{debug, trace};
use response::Transaction;
use std::sync::Arc;
use transport::Slot;

/// A specialized [`Result`] type for [`PeekPoke`] operations.
///
/// Uses [`Error<E>`] as the error variant, which can include transport-specific errors.
pub type Result<T, E> = core::result::Result<T, Error<E>>;

/// Error type for [`PeekPoke`] operations.
///
/// The generic parameter `E` allows the error type to carry a transport-specific error.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(PartialEq, Eq, Debug)]
pub enum Error<E> {
    /// The provided argument is invalid. Nothing was sent to the device.
    InvalidArgument(ArgumentError),
    /// The operation is not implemented.
    NotImplemented,
    /// The device returned a malformed or unexpected response.
    Protocol(ProtocolError),
    /// The device rejected the command.
    Device(DeviceError),
    /// The transport failed to complete the transaction.
    Transport(E),
    /// The transaction ended without a response confirming success.
    UnknownFailure,
}

impl<E: core::error::Error> Display for Error<E> {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::InvalidArgument(err) => write!(f, "invalid argument: {err}"),
            Self::NotImplemented => write!(f, "not implemented"),
            Self::Protocol(err) => write!(f, "protocol error: {err}"),
            Self::Device(err) => write!(f, "device error: {err}"),
            Self::Transport(err) => write!(f, "transaction failed: {err}"),
            Self::UnknownFailure => write!(f, "command failed for unknown reasons"),
        }
    }
}

impl<E: core::error::Error> core::error::Error for Error<E> {}

impl<E> From<ArgumentError> for Error<E> {
    fn from(err: ArgumentError) -> Self {
        Self::InvalidArgument(err)
    }
}

impl<E> From<ProtocolError> for Error<E> {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

impl<E> From<DeviceError> for Error<E> {
    fn from(err: DeviceError) -> Self {
        Self::Device(err)
    }
}

/// Argument rejected before anything is sent to the device.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum ArgumentError {
    /// The request does not transfer any data.
    EmptyRequest,
    /// A byte write exceeds [`MAX_WRITE_BYTES`].
    ByteWriteTooLarge(usize),
    /// A long write exceeds [`MAX_WRITE_LONGS`].
    LongWriteTooLarge(usize),
    /// A byte read exceeds [`MAX_READ_BYTES`].
    ByteReadTooLarge(u32),
    /// A long read exceeds [`MAX_READ_LONGS`].
    LongReadTooLarge(u16),
    /// A long operation targets an address that is not a multiple of 4.
    MisalignedAddress(u16),
    /// The link-layer address is outside of the range 1 to 31.
    InvalidDeviceAddress(u8),
}

impl Display for ArgumentError {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "request does not transfer any data"),
            Self::ByteWriteTooLarge(len) => write!(
                f,
                "cannot write {len} bytes at once (maximum {MAX_WRITE_BYTES})"
            ),
            Self::LongWriteTooLarge(len) => write!(
                f,
                "cannot write {len} longs at once (maximum {MAX_WRITE_LONGS})"
            ),
            Self::ByteReadTooLarge(count) => write!(
                f,
                "cannot read {count} bytes at once (maximum {MAX_READ_BYTES})"
            ),
            Self::LongReadTooLarge(count) => write!(
                f,
                "cannot read {count} longs at once (maximum {MAX_READ_LONGS})"
            ),
            Self::MisalignedAddress(addr) => {
                write!(f, "address {addr:#06x} is not a multiple of 4")
            }
            Self::InvalidDeviceAddress(addr) => {
                write!(f, "device address {addr} is not in the range 1 to 31")
            }
        }
    }
}

impl core::error::Error for ArgumentError {}

/// Addressing of the device on the transport.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct Config {
    address: u8,
    protocol: u16,
}

impl Config {
    /// Link-layer address used unless configured otherwise.
    pub const DEFAULT_ADDRESS: u8 = 1;

    /// Protocol identifier of the PeekPoke service.
    pub const DEFAULT_PROTOCOL: u16 = 0xafaf;

    /// Creates a configuration for the device at `address`.
    ///
    /// # Errors
    ///
    /// - [`ArgumentError::InvalidDeviceAddress`] if `address` is not in the range 1 to 31.
    pub fn with_address(address: u8) -> core::result::Result<Self, ArgumentError> {
        if !(1..=31).contains(&address) {
            return Err(ArgumentError::InvalidDeviceAddress(address));
        }

        Ok(Self {
            address,
            ..Self::default()
        })
    }

    /// Replaces the protocol identifier sent with every command.
    #[must_use]
    pub fn with_protocol(self, protocol: u16) -> Self {
        Self { protocol, ..self }
    }

    /// Returns the link-layer address of the device.
    #[must_use]
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Returns the protocol identifier.
    #[must_use]
    pub fn protocol(&self) -> u16 {
        self.protocol
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: Self::DEFAULT_ADDRESS,
            protocol: Self::DEFAULT_PROTOCOL,
        }
    }
}

/// Blocking PeekPoke client.
///
/// Each operation submits exactly one command to the [`Transport`] and blocks
/// until the transport has ended the transaction. Only one transaction can be
/// in flight at a time.
///
/// # Examples
///
/// ```no_run
/// # fn example<T: peekpoke::Transport>(transport: T) -> peekpoke::Result<(), T::Error> {
/// let mut client = peekpoke::PeekPoke::new(transport);
///
/// client.write_longs(0x0400, &[0xdead_beef, 0x1234_5678])?;
///
/// // Unaligned reads are composed from a single long read
/// let bytes = client.read_bytes(0x0401, 6)?;
///
/// assert_eq!(bytes, [0xbe, 0xad, 0xde, 0x78, 0x56, 0x34]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct PeekPoke<T> {
    transport: T,
    config: Config,
}

impl<T: Transport> PeekPoke<T> {
    /// Constructs a client for the device at the default address.
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, Config::default())
    }

    /// Constructs a client using the provided configuration.
    pub fn with_config(transport: T, config: Config) -> Self {
        Self { transport, config }
    }

    /// Returns the current configuration.
    pub fn config(&self) -> Config {
        self.config
    }

    /// Replaces the configuration used for subsequent operations.
    pub fn set_config(&mut self, config: Config) {
        self.config = config;
    }

    /// Returns a reference to the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Consumes the client, returning the underlying transport.
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Writes bytes to the device's hub memory.
    ///
    /// Writes to read-only memory are silently ignored by the device.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `bytes` is empty or longer than [`MAX_WRITE_BYTES`].
    pub fn write_bytes(&mut self, addr: u16, bytes: &[u8]) -> Result<(), T::Error> {
        self.transact(Command::write_bytes(addr, bytes)?)?;

        Ok(())
    }

    /// Writes longs to the device's hub memory.
    ///
    /// Longs are transferred in little-endian byte order.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `longs` is empty or longer than [`MAX_WRITE_LONGS`],
    ///   or if `addr` is not a multiple of 4.
    pub fn write_longs(&mut self, addr: u16, longs: &[u32]) -> Result<(), T::Error> {
        self.transact(Command::write_longs(addr, longs)?)?;

        Ok(())
    }

    /// Reads longs from the device's hub memory.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `count` is 0 or larger than [`MAX_READ_LONGS`],
    ///   or if `addr` is not a multiple of 4.
    pub fn read_longs(&mut self, addr: u16, count: u16) -> Result<Vec<u32>, T::Error> {
        let data = self.transact(Command::read_longs(addr, count)?)?;

        Ok(data
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    /// Reads bytes from the device's hub memory.
    ///
    /// The address does not need to be aligned. The read is served by a
    /// single long read covering the requested range, wrapping around at the
    /// end of the 64 KiB address space.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `count` is 0 or larger than [`MAX_READ_BYTES`].
    pub fn read_bytes(&mut self, addr: u16, count: u32) -> Result<Vec<u8>, T::Error> {
        let span = LongSpan::new(addr, count)?;
        let longs = self.read_longs(span.long_addr(), span.long_count())?;

        Ok(span.extract(&longs))
    }

    /// Writes words to the device's hub memory.
    ///
    /// The device firmware does not support word access.
    ///
    /// # Errors
    ///
    /// - [`Error::NotImplemented`] in all cases.
    pub fn write_words(&mut self, _addr: u16, _words: &[u16]) -> Result<(), T::Error> {
        Err(Error::NotImplemented)
    }

    /// Reads words from the device's hub memory.
    ///
    /// The device firmware does not support word access.
    ///
    /// # Errors
    ///
    /// - [`Error::NotImplemented`] in all cases.
    pub fn read_words(&mut self, _addr: u16, _count: u16) -> Result<Vec<u16>, T::Error> {
        Err(Error::NotImplemented)
    }

    /// Submits a command and blocks until its transaction has ended.
    fn transact(&mut self, cmd: Command) -> Result<Vec<u8>, T::Error> {
        let op = cmd.operation();
        let slot = Slot::new(Transaction::new(&cmd));
        let frame: Vec<u8> = cmd.into();

        trace!(
            "Submitting to device {} (protocol {:#06x}): {frame:02x?}",
            self.config.address, self.config.protocol
        );

        self.transport.submit(
            self.config.address,
            self.config.protocol,
            frame,
            ResponseSink::new(Arc::clone(&slot)),
        );

        let data = slot.wait()?;

        debug!("{op} transaction completed with {} data bytes", data.len());

        Ok(data)
    }
}
