//! Validation and reassembly of response frames.
//!
//! Every command produces one transaction. Write commands are answered by a
//! single final frame, while long reads are answered by a sequence of
//! 512-byte chunks followed by a shorter or equally sized final chunk.
//! [`Transaction`] checks each frame against the command that produced it
//! and records the first failure, after which further frames are ignored.

use crate::{
    Error, Result,
    command::{Command, Operation, RESERVED_MASK, SYNC, Status, TAG_MASK},
};
use core::{
    fmt::{Display, Formatter},
    mem,
};
use log::{debug, warn};

/// Size of the header at the start of every response frame.
pub(crate) const RESPONSE_HEADER_LEN: usize = 4;

/// Number of data bytes carried by every intermediate read response.
pub(crate) const CHUNK_SIZE: usize = 512;

/// Size of a successful write response.
const WRITE_RESPONSE_LEN: usize = 3;

/// Size of an error response.
const ERROR_RESPONSE_LEN: usize = 4;

/// Malformed or unexpected response from the device.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum ProtocolError {
    /// The response does not start with the sync bytes.
    InvalidSync,
    /// The reserved bits of the details byte are incorrect.
    InvalidReservedBits,
    /// The operation tag of the response does not match the command.
    DetailsMismatch {
        /// Tag of the command.
        expected: u8,
        /// Tag echoed by the response.
        received: u8,
    },
    /// An error response does not have the expected size.
    ErrorResponseSize(usize),
    /// A write response does not have the expected size.
    WriteResponseSize(usize),
    /// A write command received an intermediate response.
    UnexpectedIntermediateResponse,
    /// A read command received more responses than expected.
    TooManyResponses,
    /// A read command received its final response too early.
    PrematureFinalResponse,
    /// The last expected response of a read command is not final.
    MissingFinalResponse,
    /// A read response is smaller than the response header.
    ResponseTooSmall(usize),
    /// An intermediate read response does not carry a full chunk.
    IntermediateResponseSize(usize),
    /// A read response carries an unexpected sequence number.
    SequenceMismatch {
        /// Expected sequence number.
        expected: usize,
        /// Received sequence number.
        received: u8,
    },
    /// The final read response carries an unexpected amount of data.
    FinalResponseSize {
        /// Expected number of data bytes.
        expected: usize,
        /// Received number of data bytes.
        received: usize,
    },
    /// The reassembled read data has an unexpected length.
    ByteCountMismatch {
        /// Expected number of bytes.
        expected: usize,
        /// Received number of bytes.
        received: usize,
    },
    /// Validating a response faulted.
    HandlerFault,
    /// The transport released the transaction without ending it.
    Abandoned,
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::InvalidSync => write!(f, "invalid sync bytes in response header"),
            Self::InvalidReservedBits => write!(f, "incorrect reserved bits in response header"),
            Self::DetailsMismatch { expected, received } => write!(
                f,
                "incorrect command details in response (expected {expected:#05b}, received {received:#05b})"
            ),
            Self::ErrorResponseSize(len) => {
                write!(f, "incorrect size for error response ({len} bytes)")
            }
            Self::WriteResponseSize(len) => {
                write!(f, "unexpected size for write response ({len} bytes)")
            }
            Self::UnexpectedIntermediateResponse => {
                write!(f, "unexpected intermediate response to write command")
            }
            Self::TooManyResponses => write!(f, "too many responses received"),
            Self::PrematureFinalResponse => write!(f, "premature final response to read command"),
            Self::MissingFinalResponse => write!(f, "expected final response is not final"),
            Self::ResponseTooSmall(len) => write!(f, "read response is too small ({len} bytes)"),
            Self::IntermediateResponseSize(len) => {
                write!(f, "unexpected intermediate read response size ({len} bytes)")
            }
            Self::SequenceMismatch { expected, received } => write!(
                f,
                "incorrect response sequence number (expected {expected}, received {received})"
            ),
            Self::FinalResponseSize { expected, received } => write!(
                f,
                "incorrect final read response size (received {received} data bytes, expected {expected})"
            ),
            Self::ByteCountMismatch { expected, received } => write!(
                f,
                "incorrect number of bytes read (expected {expected}, received {received})"
            ),
            Self::HandlerFault => write!(f, "response handler faulted"),
            Self::Abandoned => write!(f, "transaction abandoned by transport"),
        }
    }
}

impl core::error::Error for ProtocolError {}

/// Error reported by the device in an error response.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum DeviceError {
    /// Unspecified error.
    Unspecified,
    /// The command is not supported.
    UnsupportedCommand,
    /// The command is missing arguments.
    MissingArguments,
    /// The command has invalid arguments.
    InvalidArguments,
    /// The requested memory range is invalid.
    Range,
    /// The command is not allowed.
    Prohibited,
    /// The error code is not known.
    Unknown(u8),
}

impl From<u8> for DeviceError {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::Unspecified,
            1 => Self::UnsupportedCommand,
            2 => Self::MissingArguments,
            3 => Self::InvalidArguments,
            4 => Self::Range,
            5 => Self::Prohibited,
            code => Self::Unknown(code),
        }
    }
}

impl Display for DeviceError {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::Unspecified => write!(f, "Unspecified"),
            Self::UnsupportedCommand => write!(f, "Unsupported command"),
            Self::MissingArguments => write!(f, "Missing argument(s)"),
            Self::InvalidArguments => write!(f, "Invalid argument(s)"),
            Self::Range => write!(f, "Range error"),
            Self::Prohibited => write!(f, "Command prohibited"),
            Self::Unknown(code) => write!(f, "Unknown error code ({code})"),
        }
    }
}

impl core::error::Error for DeviceError {}

/// Progress of a transaction.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub(crate) enum Phase {
    /// No response has been accepted yet.
    AwaitingFirstResponse,
    /// Intermediate read responses are being accumulated.
    Accumulating,
    /// Only the final read response is missing.
    AwaitingFinal,
    /// The final response has been accepted.
    Complete,
    /// A response was rejected or the transport failed.
    Failed,
}

/// Expected shape of a long read's response stream.
#[derive(Debug)]
struct ReadProgress {
    expected_responses: usize,
    final_len: usize,
    responses: usize,
    data: Vec<u8>,
}

impl ReadProgress {
    fn new(count: usize) -> Self {
        let len = count * 4;

        // A whole number of chunks ends with a full final chunk
        let final_len = match len % CHUNK_SIZE {
            0 => CHUNK_SIZE,
            rem => rem,
        };

        Self {
            expected_responses: len.div_ceil(CHUNK_SIZE),
            final_len,
            responses: 0,
            data: Vec::with_capacity(len),
        }
    }

    fn expected_len(&self) -> usize {
        self.expected_responses.saturating_sub(1) * CHUNK_SIZE + self.final_len
    }

    fn accept<E>(&mut self, frame: &[u8], is_final: bool) -> Result<Phase, E> {
        self.responses += 1;

        if self.responses > self.expected_responses {
            return Err(ProtocolError::TooManyResponses.into());
        }

        if frame.len() < RESPONSE_HEADER_LEN {
            return Err(ProtocolError::ResponseTooSmall(frame.len()).into());
        }

        if let Some(err) = check_header(Operation::ReadLongs, frame)? {
            return Err(err.into());
        }

        if is_final && self.responses < self.expected_responses {
            return Err(ProtocolError::PrematureFinalResponse.into());
        }

        if !is_final && self.responses == self.expected_responses {
            return Err(ProtocolError::MissingFinalResponse.into());
        }

        if !is_final && frame.len() != RESPONSE_HEADER_LEN + CHUNK_SIZE {
            return Err(ProtocolError::IntermediateResponseSize(frame.len()).into());
        }

        let seq = frame[3];

        if usize::from(seq) != self.responses - 1 {
            return Err(ProtocolError::SequenceMismatch {
                expected: self.responses - 1,
                received: seq,
            }
            .into());
        }

        let data = &frame[RESPONSE_HEADER_LEN..];

        if is_final && data.len() != self.final_len {
            return Err(ProtocolError::FinalResponseSize {
                expected: self.final_len,
                received: data.len(),
            }
            .into());
        }

        self.data.extend_from_slice(data);

        Ok(if is_final {
            Phase::Complete
        } else if self.responses + 1 == self.expected_responses {
            Phase::AwaitingFinal
        } else {
            Phase::Accumulating
        })
    }
}

/// Response expectations of a command.
#[derive(Debug)]
enum Expectation {
    Write { succeeded: bool },
    Read(ReadProgress),
}

/// Outcome of a single command/response exchange.
///
/// Created before the command is submitted, fed with every response frame
/// and sealed exactly once when the transport ends the transaction.
#[derive(Debug)]
pub(crate) struct Transaction<E> {
    op: Operation,
    phase: Phase,
    expect: Expectation,
    error: Option<Error<E>>,
    ended: bool,
}

impl<E> Transaction<E> {
    /// Creates the transaction for a command about to be submitted.
    pub(crate) fn new(cmd: &Command) -> Self {
        let op = cmd.operation();
        let expect = if op.is_write() {
            Expectation::Write { succeeded: false }
        } else {
            Expectation::Read(ReadProgress::new(cmd.count()))
        };

        Self {
            op,
            phase: Phase::AwaitingFirstResponse,
            expect,
            error: None,
            ended: false,
        }
    }

    /// Returns the current phase.
    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns `true` once the transport has ended the transaction.
    pub(crate) fn is_ended(&self) -> bool {
        self.ended
    }

    /// Validates a response frame delivered by the transport.
    pub(crate) fn handle_response(&mut self, frame: &[u8], is_final: bool) {
        if self.phase == Phase::Failed {
            return;
        }

        let res = match &mut self.expect {
            Expectation::Write { succeeded } => {
                accept_write(self.op, frame, is_final).inspect(|_| *succeeded = true)
            }
            Expectation::Read(progress) => progress.accept(frame, is_final),
        };

        match res {
            Ok(phase) => self.phase = phase,
            Err(err) => self.fail(err),
        }
    }

    /// Records a failure, keeping the first one.
    pub(crate) fn fail(&mut self, err: Error<E>) {
        if self.error.is_none() {
            self.error = Some(err);
        }

        self.phase = Phase::Failed;
    }

    /// Seals the transaction.
    ///
    /// An error reported by the transport replaces any earlier failure.
    pub(crate) fn end(&mut self, res: Result<(), E>) {
        if self.ended {
            warn!("Ignoring repeated end of {} transaction", self.op);

            return;
        }

        self.ended = true;

        if let Err(err) = res {
            self.error = Some(err);
            self.phase = Phase::Failed;

            return;
        }

        if self.error.is_some() {
            return;
        }

        match &self.expect {
            Expectation::Write { succeeded: false } => self.fail(Error::UnknownFailure),
            Expectation::Write { succeeded: true } => {}
            Expectation::Read(progress) => {
                if progress.data.len() != progress.expected_len() {
                    self.fail(
                        ProtocolError::ByteCountMismatch {
                            expected: progress.expected_len(),
                            received: progress.data.len(),
                        }
                        .into(),
                    );
                }
            }
        }
    }

    /// Takes the outcome of a sealed transaction.
    ///
    /// Returns the reassembled data for reads and an empty buffer for writes.
    pub(crate) fn take_outcome(&mut self) -> Result<Vec<u8>, E> {
        if let Some(err) = self.error.take() {
            debug!("{} transaction failed in phase {:?}", self.op, self.phase());

            return Err(err);
        }

        match &mut self.expect {
            Expectation::Write { .. } => Ok(Vec::new()),
            Expectation::Read(progress) => Ok(mem::take(&mut progress.data)),
        }
    }
}

/// Validates a write response.
fn accept_write<E>(op: Operation, frame: &[u8], is_final: bool) -> Result<Phase, E> {
    if !is_final {
        return Err(ProtocolError::UnexpectedIntermediateResponse.into());
    }

    if !(WRITE_RESPONSE_LEN..=ERROR_RESPONSE_LEN).contains(&frame.len()) {
        return Err(ProtocolError::WriteResponseSize(frame.len()).into());
    }

    if let Some(err) = check_header(op, frame)? {
        return Err(err.into());
    }

    if frame.len() != WRITE_RESPONSE_LEN {
        return Err(ProtocolError::WriteResponseSize(frame.len()).into());
    }

    Ok(Phase::Complete)
}

/// Checks the header shared by all responses.
///
/// Returns the device error carried by an error response.
fn check_header(
    op: Operation,
    frame: &[u8],
) -> core::result::Result<Option<DeviceError>, ProtocolError> {
    let &[sync0, sync1, details, ..] = frame else {
        return Err(ProtocolError::ResponseTooSmall(frame.len()));
    };

    if [sync0, sync1] != SYNC {
        return Err(ProtocolError::InvalidSync);
    }

    if details & RESERVED_MASK != Status::Response.bits() {
        return Err(ProtocolError::InvalidReservedBits);
    }

    if details & TAG_MASK != op.details() {
        return Err(ProtocolError::DetailsMismatch {
            expected: op.details(),
            received: details & TAG_MASK,
        });
    }

    if !Status::from_bits_retain(details).contains(Status::Error) {
        return Ok(None);
    }

    match frame {
        [_, _, _, code] => Ok(Some(DeviceError::from(*code))),
        _ => Err(ProtocolError::ErrorResponseSize(frame.len())),
    }
}
