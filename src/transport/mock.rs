//! Scripted link for tests.
//!
//! Every write consumes the next scripted response, which then becomes the
//! only data available for reading. Bytes left unread from a previous
//! response are discarded. When the script is empty the optional responder
//! is asked to answer the decoded request instead.
use std::{cell::RefCell, collections::VecDeque, io, ops::Range, rc::Rc, time::Duration};

use scroll::{BE, Pread, Pwrite};

use super::Link;
use crate::constants::errors;
use crate::protocol::{CommandType, Packet};

type Responder = Box<dyn FnMut(&Packet) -> Vec<u8>>;

#[derive(Default)]
pub struct MockLink {
    responses: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
    inbound: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    read_timeouts: Vec<Duration>,
    fail_writes: bool,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer requests left unscripted with `responder`.
    pub fn with_responder(responder: impl FnMut(&Packet) -> Vec<u8> + 'static) -> Self {
        MockLink {
            responder: Some(Box::new(responder)),
            ..Self::default()
        }
    }

    /// Answer unscripted requests from an in-memory flash.
    pub fn with_flash(flash: Rc<RefCell<FakeFlash>>) -> Self {
        Self::with_responder(move |request| flash.borrow_mut().respond(request))
    }

    /// Queue raw response bytes for the next request.
    pub fn push_response(&mut self, raw: &[u8]) {
        self.responses.push_back(raw.to_vec());
    }

    pub fn push_packet(&mut self, command_type: i16, payload: &[u8]) {
        self.responses.push_back(encode(command_type, payload));
    }

    /// Queue a failure response carrying `code`.
    pub fn push_failure(&mut self, code: i32) {
        self.responses.push_back(failure(code));
    }

    pub fn fail_writes(&mut self) {
        self.fail_writes = true;
    }

    /// Raw requests written so far.
    pub fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    /// Decoded requests written so far.
    pub fn requests(&self) -> Vec<Packet> {
        self.writes
            .iter()
            .filter_map(|raw| Packet::decode(raw).ok())
            .collect()
    }

    pub fn read_timeouts(&self) -> &[Duration] {
        &self.read_timeouts
    }
}

/// Encoded packet with a valid checksum.
pub fn encode(command_type: i16, payload: &[u8]) -> Vec<u8> {
    Packet::new(command_type, payload)
        .encode()
        .expect("test packet fits")
}

/// Encoded failure response.
pub fn failure(code: i32) -> Vec<u8> {
    let mut payload = [0u8; 4];
    payload
        .pwrite_with(code, 0, BE)
        .expect("error code fits");
    encode(CommandType::Failed.raw(), &payload)
}

/// Flash memory behind a programmer that is connected to the PIC.
#[derive(Debug, Clone)]
pub struct FakeFlash {
    pub base: u32,
    pub memory: Vec<u8>,
}

impl FakeFlash {
    /// Erased flash of `size` bytes at physical address `base`.
    pub fn new(base: u32, size: usize) -> Self {
        FakeFlash {
            base,
            memory: vec![0xff; size],
        }
    }

    pub fn respond(&mut self, request: &Packet) -> Vec<u8> {
        let command_type = request.command_type;
        let payload = &request.payload;
        let range = match (
            payload.pread_with::<u32>(0, BE),
            payload.pread_with::<u32>(4, BE),
        ) {
            (Ok(address), Ok(size)) => self.range(address, size),
            _ => None,
        };

        match (CommandType::from_raw(command_type), range) {
            (Some(CommandType::Read), Some(range)) => encode(command_type, &self.memory[range]),
            (Some(CommandType::Write), Some(range)) if payload.len() == 8 + range.len() => {
                self.memory[range].copy_from_slice(&payload[8..]);
                encode(command_type, &[])
            }
            (Some(CommandType::Erase), Some(range)) => {
                self.memory[range].fill(0xff);
                encode(command_type, &[])
            }
            (Some(CommandType::Read | CommandType::Write | CommandType::Erase), None) => {
                failure(errors::ERANGE)
            }
            (Some(CommandType::Write), Some(_)) | (None, _) => failure(errors::EINVAL),
            (Some(_), _) => encode(command_type, &[]),
        }
    }

    fn range(&self, address: u32, size: u32) -> Option<Range<usize>> {
        let start = address.checked_sub(self.base)? as usize;
        let end = start.checked_add(size as usize)?;
        (end <= self.memory.len()).then_some(start..end)
    }
}

impl Link for MockLink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link closed"));
        }

        self.writes.push(data.to_vec());

        let response = match self.responses.pop_front() {
            Some(response) => response,
            None => match (&mut self.responder, Packet::decode(data)) {
                (Some(responder), Ok(request)) => responder(&request),
                _ => Vec::new(),
            },
        };
        self.inbound = response.into();

        Ok(())
    }

    fn read(&mut self, len: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        self.read_timeouts.push(timeout);
        let n = len.min(self.inbound.len());
        Ok(self.inbound.drain(..n).collect())
    }
}
