//! The underlying binary protocol spoken with the programmer.
//!
//! Every packet is framed as
//!
//! ```text
//! command_type: i16 | length: u16 | payload: length bytes | checksum: u16
//! ```
//!
//! with all fields big endian and the checksum computed over everything that
//! precedes it.

use std::{fmt, io, time::Duration};

use scroll::{BE, Pread, Pwrite};
use thiserror::Error;

use crate::constants::{commands, errors};
use crate::error::{Error, Result};
use crate::transport::Link;

pub const HEADER_SIZE: usize = 4;
pub const FOOTER_SIZE: usize = 2;

/// Calculate the packet checksum of given data.
pub fn crc_ccitt(data: &[u8]) -> u16 {
    let mut msb: u8 = 0xff;
    let mut lsb: u8 = 0xff;

    for &c in data {
        let mut x = c ^ msb;
        x ^= x >> 4;
        msb = lsb ^ (x >> 3) ^ (x << 4);
        lsb = x ^ (x << 5);
    }

    u16::from_be_bytes([msb, lsb])
}

/// Command type of a packet. Requests and their successful responses share
/// the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum CommandType {
    Failed = commands::FAILED,
    Ping = commands::PING,
    Erase = commands::ERASE,
    Read = commands::READ,
    Write = commands::WRITE,
    ProgrammerPing = commands::PROGRAMMER_PING,
    Connect = commands::PROGRAMMER_CONNECT,
    Disconnect = commands::PROGRAMMER_DISCONNECT,
    Reset = commands::PROGRAMMER_RESET,
    DeviceStatus = commands::PROGRAMMER_DEVICE_STATUS,
    ChipErase = commands::PROGRAMMER_CHIP_ERASE,
}

impl CommandType {
    pub const fn raw(self) -> i16 {
        self as i16
    }

    pub fn from_raw(raw: i16) -> Option<Self> {
        use CommandType::*;

        [
            Failed,
            Ping,
            Erase,
            Read,
            Write,
            ProgrammerPing,
            Connect,
            Disconnect,
            Reset,
            DeviceStatus,
            ChipErase,
        ]
        .into_iter()
        .find(|t| t.raw() == raw)
    }
}

/// A request to the programmer or the PIC.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// Check that the RAM application is executing.
    Ping,
    /// Erase `size` bytes of flash starting at `address`.
    Erase { address: u32, size: u32 },
    /// Read `size` bytes starting at `address`.
    Read { address: u32, size: u32 },
    /// Write `data` to flash starting at `address`.
    Write { address: u32, data: Vec<u8> },
    ProgrammerPing,
    /// Upload the RAM application and start it.
    Connect,
    Disconnect,
    Reset,
    /// Read the ICSP status byte.
    DeviceStatus,
    /// Erase program flash, boot flash and configuration memory.
    ChipErase,
}

impl Command {
    pub fn erase(address: u32, size: u32) -> Self {
        Command::Erase { address, size }
    }

    pub fn read(address: u32, size: u32) -> Self {
        Command::Read { address, size }
    }

    pub fn write(address: u32, data: Vec<u8>) -> Self {
        Command::Write { address, data }
    }

    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Ping => CommandType::Ping,
            Command::Erase { .. } => CommandType::Erase,
            Command::Read { .. } => CommandType::Read,
            Command::Write { .. } => CommandType::Write,
            Command::ProgrammerPing => CommandType::ProgrammerPing,
            Command::Connect => CommandType::Connect,
            Command::Disconnect => CommandType::Disconnect,
            Command::Reset => CommandType::Reset,
            Command::DeviceStatus => CommandType::DeviceStatus,
            Command::ChipErase => CommandType::ChipErase,
        }
    }

    /// Request payload of the command.
    pub fn into_raw(self) -> Result<Vec<u8>> {
        match self {
            Command::Erase { address, size } | Command::Read { address, size } => {
                let mut buf = vec![0u8; 8];
                buf.pwrite_with(address, 0, BE)?;
                buf.pwrite_with(size, 4, BE)?;
                Ok(buf)
            }
            Command::Write { address, data } => {
                // ADDR, SIZE, DATA
                let mut buf = vec![0u8; 8 + data.len()];
                buf.pwrite_with(address, 0, BE)?;
                buf.pwrite_with(data.len() as u32, 4, BE)?;
                buf[8..].copy_from_slice(&data);
                Ok(buf)
            }
            _ => Ok(Vec::new()),
        }
    }
}

/// Error code of a failure response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const ALREADY_CONNECTED: ErrorCode = ErrorCode(errors::EISCONN);
    pub const NOT_CONNECTED: ErrorCode = ErrorCode(errors::ENOTCONN);

    /// Parse the payload of a failure response, a big endian `i32`.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() != 4 {
            return None;
        }

        payload.pread_with::<i32>(0, BE).ok().map(ErrorCode)
    }

    pub fn description(self) -> Option<&'static str> {
        errors::DESCRIPTIONS
            .iter()
            .find(|(code, _)| *code == self.0)
            .map(|(_, description)| *description)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.description() {
            Some(description) => f.write_str(description),
            None => write!(f, "failed with {}", self.0),
        }
    }
}

/// Local failure to receive a well formed packet.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to read packet header")]
    ShortHeader,

    #[error("received {received} bytes when expecting {expected}")]
    ShortPayload { expected: usize, received: usize },

    #[error("failed to read packet footer")]
    ShortFooter,

    #[error("crc mismatch of received packet ({received:#06x} != {expected:#06x})")]
    ChecksumMismatch { expected: u16, received: u16 },

    #[error(transparent)]
    Malformed(#[from] scroll::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    pub command_type: i16,
    pub payload: Vec<u8>,
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.command_type, hex::encode(&self.payload))
    }
}

impl Packet {
    pub fn new(command_type: i16, payload: impl Into<Vec<u8>>) -> Self {
        Packet {
            command_type,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let size = u16::try_from(self.payload.len())
            .map_err(|_| Error::PayloadTooLarge(self.payload.len()))?;
        let end = HEADER_SIZE + self.payload.len();

        // TYPE, SIZE, PAYLOAD, CRC
        let mut buf = vec![0u8; end + FOOTER_SIZE];
        buf.pwrite_with(self.command_type, 0, BE)?;
        buf.pwrite_with(size, 2, BE)?;
        buf[HEADER_SIZE..end].copy_from_slice(&self.payload);
        let crc = crc_ccitt(&buf[..end]);
        buf.pwrite_with(crc, end, BE)?;

        Ok(buf)
    }

    /// Decode a packet from the start of `raw`. Trailing bytes are ignored.
    pub fn decode(raw: &[u8]) -> std::result::Result<Self, DecodeError> {
        let mut offset = 0;

        Self::decode_with(|n| {
            let end = raw.len().min(offset + n);
            let chunk = raw[offset..end].to_vec();
            offset = end;
            Ok(chunk)
        })
    }

    /// Read one packet from the link, waiting at most `timeout` per read.
    pub fn read_from<L: Link + ?Sized>(
        link: &mut L,
        timeout: Duration,
    ) -> std::result::Result<Self, DecodeError> {
        Self::decode_with(|n| link.read(n, timeout))
    }

    fn decode_with(
        mut read: impl FnMut(usize) -> io::Result<Vec<u8>>,
    ) -> std::result::Result<Self, DecodeError> {
        let mut raw = read(HEADER_SIZE)?;

        if raw.len() != HEADER_SIZE {
            return Err(DecodeError::ShortHeader);
        }

        let command_type = raw.pread_with::<i16>(0, BE)?;
        let size = raw.pread_with::<u16>(2, BE)? as usize;

        if size > 0 {
            let payload = read(size)?;

            if payload.len() != size {
                log::debug!("short payload: {}", hex::encode(&payload));
                return Err(DecodeError::ShortPayload {
                    expected: size,
                    received: payload.len(),
                });
            }

            raw.extend_from_slice(&payload);
        }

        let footer = read(FOOTER_SIZE)?;

        if footer.len() != FOOTER_SIZE {
            return Err(DecodeError::ShortFooter);
        }

        let received = footer.pread_with::<u16>(0, BE)?;
        let expected = crc_ccitt(&raw);

        if received != expected {
            return Err(DecodeError::ChecksumMismatch { expected, received });
        }

        Ok(Packet {
            command_type,
            payload: raw.split_off(HEADER_SIZE),
        })
    }
}

/// Outcome of a command. The request command type is omitted.
#[derive(Clone, PartialEq, Eq)]
pub enum Response {
    /// Response with the request's command type.
    Ok(Vec<u8>),
    /// Explicit failure response.
    Failed(ErrorCode),
    /// No valid response within the attempt budget.
    Exhausted,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok(data) => write!(f, "OK[{}]", hex::encode(data)),
            Response::Failed(code) => write!(f, "FAILED({})", code.0),
            Response::Exhausted => write!(f, "EXHAUSTED"),
        }
    }
}

impl Response {
    pub fn into_result(self) -> Result<Vec<u8>> {
        match self {
            Response::Ok(payload) => Ok(payload),
            Response::Failed(code) => Err(Error::Device(code)),
            Response::Exhausted => Err(Error::CommunicationFailure),
        }
    }
}
