//! Simulated device for testing without hardware.
//!
//! [`SimulatedDevice`] is a [`Transport`] that emulates the device firmware
//! on top of a 64 KiB hub memory. The lower 32 KiB are RAM, the upper 32 KiB
//! are ROM that ignores writes. Addresses wrap around at the end of the hub.
//!
//! Responses are delivered from a separate thread, the same way a transport
//! driven by an I/O loop would deliver them.

use crate::{
    ResponseSink, Transport,
    command::{
        COMMAND_HEADER_LEN, MAX_READ_LONGS, MAX_WRITE_BYTES, MAX_WRITE_LONGS, Operation, SYNC,
        Status, TAG_MASK,
    },
    response::{CHUNK_SIZE, RESPONSE_HEADER_LEN},
};
use core::fmt::{Display, Formatter};
use log::{debug, warn};
use std::thread;

/// Size of the hub address space.
const HUB_SIZE: usize = 0x10000;

/// First address of the ROM.
const ROM_START: usize = 0x8000;

/// Size of the ROM.
pub const ROM_SIZE: usize = HUB_SIZE - ROM_START;

/// Error code for commands with unknown tags.
const CODE_UNSUPPORTED_COMMAND: u8 = 1;

/// Error code for commands with malformed arguments.
const CODE_INVALID_ARGUMENTS: u8 = 3;

/// Error reported by the simulated transport.
#[non_exhaustive]
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum SimError {
    /// The simulated link failed.
    LinkFailure,
}

impl Display for SimError {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::LinkFailure => write!(f, "simulated link failure"),
        }
    }
}

impl core::error::Error for SimError {}

/// Fault applied to the responses of the next submitted command.
///
/// Faults that alter a frame apply to the first frame, unless noted otherwise.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Fault {
    /// Corrupts the sync bytes.
    CorruptSync,
    /// Sets a reserved bit of the details byte.
    ReservedBits,
    /// Alters the echoed operation tag.
    WrongTag,
    /// Skips a sequence number. Applies to the second frame of multi-chunk reads.
    SkipSequence,
    /// Replaces all responses with an error response carrying the given code.
    DeviceError(u8),
    /// Repeats the final response.
    ExtraResponse,
    /// Flags the first response as final.
    PrematureFinal,
    /// Drops the last byte of the final response.
    TruncateFinal,
    /// Ends the transaction with [`SimError::LinkFailure`] without any response.
    LinkFailure,
    /// Delivers all responses, then drops the sink without ending the transaction.
    Abandon,
    /// Ends the transaction successfully without any response.
    Silence,
}

/// Command submitted to the simulated device.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Submission {
    /// Link-layer address of the device.
    pub address: u8,
    /// Protocol identifier.
    pub protocol: u16,
    /// Command frame.
    pub frame: Vec<u8>,
}

/// How a transaction is ended after its responses were delivered.
#[derive(Debug)]
enum Ending {
    Finish(Result<(), SimError>),
    Drop,
}

/// Simulated device with RAM, ROM and wrap-around addressing.
///
/// # Examples
///
/// ```
/// use peekpoke::{PeekPoke, sim::SimulatedDevice};
///
/// # fn main() -> peekpoke::Result<(), peekpoke::sim::SimError> {
/// let mut dev = SimulatedDevice::new();
/// let mut client = PeekPoke::new(&mut dev);
///
/// client.write_bytes(0x0010, &[0x01, 0x02, 0x03])?;
///
/// assert_eq!(client.read_bytes(0x0011, 2)?, [0x02, 0x03]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SimulatedDevice {
    hub: Vec<u8>,
    fault: Option<Fault>,
    submissions: Vec<Submission>,
}

impl SimulatedDevice {
    /// Creates a device with zeroed memory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hub: vec![0x00; HUB_SIZE],
            fault: None,
            submissions: Vec::new(),
        }
    }

    /// Replaces the ROM contents.
    pub fn set_rom(&mut self, rom: &[u8; ROM_SIZE]) {
        self.hub[ROM_START..].copy_from_slice(rom);
    }

    /// Returns `count` bytes of hub memory starting at `addr`.
    #[must_use]
    pub fn peek(&self, addr: u16, count: usize) -> Vec<u8> {
        (0..count)
            .map(|idx| self.hub[(usize::from(addr) + idx) % HUB_SIZE])
            .collect()
    }

    /// Stores bytes in hub memory starting at `addr`.
    ///
    /// Unlike commands sent to the device, this also writes to the ROM.
    pub fn poke(&mut self, addr: u16, data: &[u8]) {
        for (idx, &val) in data.iter().enumerate() {
            self.hub[(usize::from(addr) + idx) % HUB_SIZE] = val;
        }
    }

    /// Applies a fault to the responses of the next submitted command.
    pub fn inject(&mut self, fault: Fault) {
        self.fault = Some(fault);
    }

    /// Returns all commands submitted so far.
    #[must_use]
    pub fn submissions(&self) -> &[Submission] {
        &self.submissions
    }

    /// Writes bytes the way the device does, skipping the ROM.
    fn store(&mut self, addr: u16, data: &[u8]) {
        for (idx, &val) in data.iter().enumerate() {
            let addr = (usize::from(addr) + idx) % HUB_SIZE;

            if addr < ROM_START {
                self.hub[addr] = val;
            }
        }
    }

    /// Executes a command frame, returning the response frames.
    fn execute(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        if frame.len() < COMMAND_HEADER_LEN || frame[..2] != SYNC {
            warn!("Simulated device ignoring malformed frame: {frame:02x?}");

            return Vec::new();
        }

        let tag = frame[2] & TAG_MASK;
        let addr = u16::from_le_bytes([frame[4], frame[5]]);
        let len = u16::from_le_bytes([frame[6], frame[7]]);
        let payload = &frame[COMMAND_HEADER_LEN..];

        let Some(op) = Operation::from_repr(tag) else {
            return vec![error_response(tag, CODE_UNSUPPORTED_COMMAND)];
        };

        debug!("Simulated device executing {op} at {addr:#06x}, length field {len:#06x}");

        let count = usize::from(len) + 1;

        match op {
            Operation::WriteBytes => {
                if count > MAX_WRITE_BYTES || payload.len() != count {
                    return vec![error_response(tag, CODE_INVALID_ARGUMENTS)];
                }

                self.store(addr, payload);

                vec![write_response(tag)]
            }
            Operation::WriteLongs => {
                if count > MAX_WRITE_LONGS || addr % 4 != 0 || payload.len() != count * 4 {
                    return vec![error_response(tag, CODE_INVALID_ARGUMENTS)];
                }

                self.store(addr, payload);

                vec![write_response(tag)]
            }
            Operation::ReadLongs => {
                if count > usize::from(MAX_READ_LONGS) || addr % 4 != 0 || !payload.is_empty() {
                    return vec![error_response(tag, CODE_INVALID_ARGUMENTS)];
                }

                self.peek(addr, count * 4)
                    .chunks(CHUNK_SIZE)
                    .zip(0_u8..)
                    .map(|(chunk, seq)| {
                        let mut frame = Vec::with_capacity(RESPONSE_HEADER_LEN + chunk.len());

                        frame.extend_from_slice(&SYNC);
                        frame.push(Status::Response.bits() | tag);
                        frame.push(seq);
                        frame.extend_from_slice(chunk);

                        frame
                    })
                    .collect()
            }
        }
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimulatedDevice {
    type Error = SimError;

    fn submit(&mut self, address: u8, protocol: u16, payload: Vec<u8>, sink: ResponseSink<SimError>) {
        let frames = self.execute(&payload);

        self.submissions.push(Submission {
            address,
            protocol,
            frame: payload,
        });

        // Every frame but the last is intermediate
        let last = frames.len().saturating_sub(1);
        let mut responses: Vec<(Vec<u8>, bool)> = frames
            .into_iter()
            .enumerate()
            .map(|(idx, frame)| (frame, idx == last))
            .collect();
        let mut ending = Ending::Finish(Ok(()));

        if let Some(fault) = self.fault.take() {
            debug!("Simulated device injecting {fault:?}");

            ending = apply_fault(fault, &mut responses);
        }

        let spawned = thread::Builder::new()
            .name("sim-device".into())
            .spawn(move || {
                for (frame, is_final) in &responses {
                    sink.respond(frame, *is_final);
                }

                match ending {
                    Ending::Finish(res) => sink.finish(res),
                    Ending::Drop => drop(sink),
                }
            });

        if let Err(err) = spawned {
            warn!("Failed to spawn simulated device thread: {err}");
        }
    }
}

fn write_response(tag: u8) -> Vec<u8> {
    vec![SYNC[0], SYNC[1], Status::Response.bits() | tag]
}

fn error_response(tag: u8, code: u8) -> Vec<u8> {
    vec![
        SYNC[0],
        SYNC[1],
        (Status::Response | Status::Error).bits() | tag,
        code,
    ]
}

/// Alters the responses of a transaction, returning how it ends.
fn apply_fault(fault: Fault, responses: &mut Vec<(Vec<u8>, bool)>) -> Ending {
    let first = responses.first_mut().map(|(frame, _)| frame);

    match fault {
        Fault::CorruptSync => {
            if let Some(frame) = first {
                frame[1] ^= 0x01;
            }
        }
        Fault::ReservedBits => {
            if let Some(frame) = first {
                frame[2] |= 0x08;
            }
        }
        Fault::WrongTag => {
            if let Some(frame) = first {
                frame[2] ^= 0x01;
            }
        }
        Fault::SkipSequence => {
            let idx = responses.len().min(2).saturating_sub(1);

            if let Some(seq) = responses.get_mut(idx).and_then(|(frame, _)| frame.get_mut(3)) {
                *seq = seq.wrapping_add(1);
            }
        }
        Fault::DeviceError(code) => {
            let tag = responses
                .first()
                .map_or(0, |(frame, _)| frame[2] & TAG_MASK);

            *responses = vec![(error_response(tag, code), true)];
        }
        Fault::ExtraResponse => {
            if let Some(last) = responses.last().cloned() {
                responses.push(last);
            }
        }
        Fault::PrematureFinal => {
            if let Some((_, is_final)) = responses.first_mut() {
                *is_final = true;
            }
        }
        Fault::TruncateFinal => {
            if let Some((frame, _)) = responses.last_mut() {
                frame.pop();
            }
        }
        Fault::LinkFailure => {
            responses.clear();

            return Ending::Finish(Err(SimError::LinkFailure));
        }
        Fault::Abandon => return Ending::Drop,
        Fault::Silence => responses.clear(),
    }

    Ending::Finish(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::init_logger;

    #[test]
    fn memory_wraps_around() {
        init_logger();

        let mut dev = SimulatedDevice::new();

        dev.poke(0xfffe, &[0x01, 0x02, 0x03, 0x04]);

        assert_eq!(
            dev.peek(0xfffe, 4),
            [0x01, 0x02, 0x03, 0x04],
            "memory should wrap around"
        );
        assert_eq!(dev.peek(0x0000, 2), [0x03, 0x04], "start should be written");
    }

    #[test]
    fn store_skips_rom() {
        init_logger();

        let mut dev = SimulatedDevice::new();

        dev.set_rom(&[0xff; ROM_SIZE]);
        dev.store(0xffff, &[0x01, 0x02]);

        assert_eq!(dev.peek(0xffff, 1), [0xff], "ROM should be unchanged");
        assert_eq!(dev.peek(0x0000, 1), [0x02], "RAM should be written");
    }

    #[test]
    fn execute_read_chunks() {
        init_logger();

        let mut dev = SimulatedDevice::new();
        let frames = dev.execute(&[0x50, 0x50, 0x02, 0x00, 0x00, 0x00, 0x2b, 0x01]);

        assert_eq!(frames.len(), 3, "response count should be correct");
        assert_eq!(
            frames.iter().map(Vec::len).collect::<Vec<_>>(),
            [516, 516, 180],
            "response sizes should be correct"
        );
        assert_eq!(
            frames[2][..4],
            [0x50, 0x50, 0x82, 0x02],
            "last header should be correct"
        );
    }

    #[test]
    fn execute_error_responses() {
        init_logger();

        let mut dev = SimulatedDevice::new();

        assert_eq!(
            dev.execute(&[0x50, 0x50, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]),
            [[0x50, 0x50, 0xc1, 0x01]],
            "unknown tag should be unsupported"
        );
        assert_eq!(
            dev.execute(&[0x50, 0x50, 0x02, 0x00, 0x02, 0x00, 0x00, 0x00]),
            [[0x50, 0x50, 0xc2, 0x03]],
            "misaligned read should be invalid"
        );
        assert_eq!(
            dev.execute(&[0x50, 0x50, 0x04, 0x00, 0x00, 0x00, 0x01, 0x00, 0xaa]),
            [[0x50, 0x50, 0xc4, 0x03]],
            "short write payload should be invalid"
        );
        assert!(
            dev.execute(&[0x51, 0x50, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xaa])
                .is_empty(),
            "bad sync should be ignored"
        );
    }
}
