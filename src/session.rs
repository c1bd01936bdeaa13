//! Connection state of the programmer link.
use std::fmt;

use crate::constants::ERASE_TIMEOUT;
use crate::error::{Error, Result};
use crate::protocol::{Command, ErrorCode, Response};
use crate::register::DeviceStatus;
use crate::transport::{Link, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Link open, PIC state unknown.
    Disconnected,
    /// PIC explicitly disconnected, only the programmer is addressed.
    ProgrammerOnly,
    /// RAM application uploaded and running on the PIC.
    ConnectedToPic,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Disconnected => "disconnected",
            State::ProgrammerOnly => "disconnected from the PIC",
            State::ConnectedToPic => "connected to the PIC",
        })
    }
}

/// The single owner of a programmer link.
pub struct Session<L: Link> {
    transport: Transport<L>,
    state: State,
}

impl<L: Link> Session<L> {
    pub fn new(link: L) -> Self {
        Self::with_transport(Transport::new(link))
    }

    pub fn with_transport(transport: Transport<L>) -> Self {
        Session {
            transport,
            state: State::Disconnected,
        }
    }

    /// Open a session and make sure the programmer answers.
    pub fn open_programmer(link: L) -> Result<Self> {
        let mut session = Self::new(link);
        session.ping_programmer()?;
        Ok(session)
    }

    /// Open a session with the RAM application running on the PIC.
    pub fn open_connected(link: L) -> Result<Self> {
        let mut session = Self::open_programmer(link)?;
        session.connect()?;
        session.ping()?;
        Ok(session)
    }

    /// Open a session with the PIC released by the programmer.
    pub fn open_disconnected(link: L) -> Result<Self> {
        let mut session = Self::open_programmer(link)?;
        session.disconnect()?;
        Ok(session)
    }

    /// Announce the erase, then open a disconnected session and erase the chip.
    pub fn erase_chip(link: L) -> Result<Self> {
        log::info!("Erasing the chip.");
        let mut session = Self::open_disconnected(link)?;
        session.chip_erase()?;
        Ok(session)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn transport(&mut self) -> &mut Transport<L> {
        &mut self.transport
    }

    pub fn into_link(self) -> L {
        self.transport.into_link()
    }

    pub fn ping_programmer(&mut self) -> Result<()> {
        self.transport.transfer(Command::ProgrammerPing)?.into_result()?;

        log::info!("Programmer is alive.");
        Ok(())
    }

    /// Connect to the PIC. Already being connected is fine.
    pub fn connect(&mut self) -> Result<()> {
        match self.transport.transfer(Command::Connect)? {
            Response::Ok(_) => log::info!("Connected to PIC."),
            Response::Failed(ErrorCode::ALREADY_CONNECTED) => log::debug!("PIC already connected"),
            resp => {
                resp.into_result()?;
            }
        }

        self.state = State::ConnectedToPic;
        Ok(())
    }

    /// Disconnect from the PIC. Not being connected is fine.
    pub fn disconnect(&mut self) -> Result<()> {
        match self.transport.transfer(Command::Disconnect)? {
            Response::Ok(_) => log::info!("Disconnected from PIC."),
            Response::Failed(ErrorCode::NOT_CONNECTED) => log::debug!("PIC not connected"),
            resp => {
                resp.into_result()?;
            }
        }

        self.state = State::ProgrammerOnly;
        Ok(())
    }

    /// Check that the RAM application is executing.
    pub fn ping(&mut self) -> Result<()> {
        self.transport.transfer(Command::Ping)?.into_result()?;

        log::info!("PIC is alive.");
        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        self.ensure_not_connected("reset the PIC")?;
        self.transport.transfer(Command::Reset)?.into_result()?;

        log::info!("PIC reset.");
        Ok(())
    }

    pub fn device_status(&mut self) -> Result<DeviceStatus> {
        let payload = self.transport.transfer(Command::DeviceStatus)?.into_result()?;

        let &[raw] = payload.as_slice() else {
            return Err(Error::UnexpectedLength {
                expected: 1,
                actual: payload.len(),
            });
        };
        let status = DeviceStatus(raw);

        if status.nvmerr() {
            log::warn!("Flash controller reports an error");
        }

        Ok(status)
    }

    /// Erase program flash, boot flash and configuration memory.
    pub fn chip_erase(&mut self) -> Result<()> {
        self.ensure_not_connected("erase the chip")?;

        log::debug!("chip erase");
        self.transport
            .transfer_with_timeout(Command::ChipErase, ERASE_TIMEOUT)?
            .into_result()?;

        log::info!("Chip erase complete.");
        Ok(())
    }

    pub(crate) fn ensure_connected(&self, operation: &'static str) -> Result<()> {
        if self.state != State::ConnectedToPic {
            return Err(Error::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn ensure_not_connected(&self, operation: &'static str) -> Result<()> {
        if self.state == State::ConnectedToPic {
            return Err(Error::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommandType;
    use crate::transport::mock::MockLink;
    use pretty_assertions::assert_eq;

    #[test]
    fn connect_twice() {
        let mut link = MockLink::new();
        link.push_packet(CommandType::Connect.raw(), &[]);
        link.push_failure(-106);

        let mut session = Session::new(&mut link);
        session.connect().unwrap();
        assert_eq!(session.state(), State::ConnectedToPic);
        session.connect().unwrap();
        assert_eq!(session.state(), State::ConnectedToPic);
        drop(session);

        assert_eq!(link.writes().len(), 2);
    }

    #[test]
    fn disconnect_twice() {
        let mut link = MockLink::new();
        link.push_packet(CommandType::Disconnect.raw(), &[]);
        link.push_failure(-107);

        let mut session = Session::new(&mut link);
        session.disconnect().unwrap();
        session.disconnect().unwrap();
        assert_eq!(session.state(), State::ProgrammerOnly);
    }

    #[test]
    fn connect_propagates_other_failures() {
        let mut link = MockLink::new();
        link.push_failure(-107);

        let mut session = Session::new(&mut link);
        let err = session.connect().unwrap_err();

        assert!(matches!(err, Error::Device(ErrorCode(-107))));
        assert_eq!(session.state(), State::Disconnected);
    }

    #[test]
    fn disconnect_propagates_other_failures() {
        let mut link = MockLink::new();
        link.push_failure(-106);

        let err = Session::new(&mut link).disconnect().unwrap_err();

        assert!(matches!(err, Error::Device(ErrorCode(-106))));
    }

    #[test]
    fn reset_refused_while_connected() {
        let mut link = MockLink::new();
        link.push_packet(CommandType::Connect.raw(), &[]);

        let mut session = Session::new(&mut link);
        session.connect().unwrap();
        let err = session.reset().unwrap_err();
        drop(session);

        assert!(matches!(
            err,
            Error::InvalidState {
                state: State::ConnectedToPic,
                ..
            }
        ));
        assert_eq!(link.writes().len(), 1);
    }

    #[test]
    fn open_connected_sequence() {
        let mut link = MockLink::new();
        link.push_packet(CommandType::ProgrammerPing.raw(), &[]);
        link.push_packet(CommandType::Connect.raw(), &[]);
        link.push_packet(CommandType::Ping.raw(), &[]);

        let session = Session::open_connected(&mut link).unwrap();
        assert_eq!(session.state(), State::ConnectedToPic);
        drop(session);

        assert_eq!(
            link.writes(),
            [
                b"\x00\x64\x00\x00\xc3\x6b".to_vec(),
                b"\x00\x65\x00\x00\xf4\x5b".to_vec(),
                b"\x00\x01\x00\x00\xb3\xf0".to_vec(),
            ]
        );
    }

    #[test]
    fn open_connected_stops_when_programmer_is_silent() {
        let mut link = MockLink::new();

        let err = Session::open_connected(&mut link).err().unwrap();

        assert!(matches!(err, Error::CommunicationFailure));
        assert_eq!(link.writes().len(), 3);
    }

    #[test]
    fn device_status() {
        let mut link = MockLink::new();
        link.push_response(&hex::decode("00680001853f01").unwrap());

        let status = Session::new(&mut link).device_status().unwrap();

        assert_eq!(status, DeviceStatus(0x85));
    }

    #[test]
    fn chip_erase_uses_erase_timeout() {
        let mut link = MockLink::new();
        link.push_packet(CommandType::ChipErase.raw(), &[]);

        Session::new(&mut link).chip_erase().unwrap();

        assert!(link.read_timeouts().iter().all(|t| *t == ERASE_TIMEOUT));
    }
}
