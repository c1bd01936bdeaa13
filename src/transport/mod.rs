//! Abstract link and command transport.
use std::{io, time::Duration};

use crate::constants::{MAX_ATTEMPTS, SERIAL_TIMEOUT};
use crate::error::Result;
use crate::protocol::{Command, CommandType, DecodeError, ErrorCode, Packet, Response};

pub use self::serial::{Baudrate, SerialLink};

#[cfg(any(test, feature = "test"))]
pub mod mock;
mod serial;

/// Byte stream to the programmer.
/// Might be a serial port, a socket or a scripted test double.
pub trait Link {
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read up to `len` bytes, returning fewer if `timeout` elapses first.
    fn read(&mut self, len: usize, timeout: Duration) -> io::Result<Vec<u8>>;
}

impl<L: Link + ?Sized> Link for &mut L {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).write(data)
    }

    fn read(&mut self, len: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        (**self).read(len, timeout)
    }
}

impl<L: Link + ?Sized> Link for Box<L> {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).write(data)
    }

    fn read(&mut self, len: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        (**self).read(len, timeout)
    }
}

/// Request/response command execution over a link, one command in flight.
pub struct Transport<L> {
    link: L,
}

impl<L: Link> Transport<L> {
    pub fn new(link: L) -> Self {
        Transport { link }
    }

    pub fn into_link(self) -> L {
        self.link
    }

    /// Execute a command with the default response timeout.
    pub fn transfer(&mut self, cmd: Command) -> Result<Response> {
        self.transfer_with_timeout(cmd, SERIAL_TIMEOUT)
    }

    pub fn transfer_with_timeout(&mut self, cmd: Command, timeout: Duration) -> Result<Response> {
        let command_type = cmd.command_type();
        let payload = cmd.into_raw()?;
        self.execute_with_timeout(command_type, &payload, timeout)
    }

    /// Send the request and wait for its response, at most `MAX_ATTEMPTS`
    /// times. Corrupt, truncated and unrelated responses are retried; an
    /// explicit failure response is returned at once.
    ///
    /// `Err` is only returned for link errors other than timeouts.
    pub fn execute_with_timeout(
        &mut self,
        command_type: CommandType,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Response> {
        let req = Packet::new(command_type.raw(), payload).encode()?;

        for attempt in 1..=MAX_ATTEMPTS {
            log::debug!("=> {}", hex::encode(&req));
            self.link.write(&req)?;

            let resp = match Packet::read_from(&mut self.link, timeout) {
                Ok(resp) => resp,
                Err(DecodeError::Io(err)) => return Err(err.into()),
                Err(err) => {
                    log::warn!("{:?} attempt {}/{}: {}", command_type, attempt, MAX_ATTEMPTS, err);
                    continue;
                }
            };
            log::debug!("<= {:?}", resp);

            if resp.command_type == command_type.raw() {
                return Ok(Response::Ok(resp.payload));
            }

            if resp.command_type == CommandType::Failed.raw() {
                if let Some(code) = ErrorCode::from_payload(&resp.payload) {
                    return Ok(Response::Failed(code));
                }
            }

            log::warn!(
                "{:?} attempt {}/{}: unexpected response {:?}",
                command_type,
                attempt,
                MAX_ATTEMPTS,
                resp
            );
        }

        Ok(Response::Exhausted)
    }
}
