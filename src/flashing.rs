//! Flash access through the RAM application.

use scroll::{LE, Pread};

use crate::constants::{ERASE_TIMEOUT, READ_WRITE_CHUNK_SIZE};
use crate::device::{
    CONFIGURATION_BITS, CONFIGURATION_WORDS_OFFSET, DEVICE_ID_ADDRESS, Region, UDID_ADDRESS,
    physical_flash_address, region_of,
};
use crate::error::{Error, Result};
use crate::format::{Image, Segment};
use crate::protocol::Command;
use crate::register::{CONFIGURATION, DEVICE_ID, Decoded, DeviceId, UNIQUE_ID};
use crate::session::Session;
use crate::transport::{Link, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Read,
    Write,
    Verify,
}

/// Receives progress of chunked transfers.
pub trait Progress {
    fn started(&mut self, _operation: Operation, _address: u32, _size: usize) {}
    fn advanced(&mut self, bytes: usize);
    fn finished(&mut self) {}
}

impl Progress for () {
    fn advanced(&mut self, _bytes: usize) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Erase every segment before writing it.
    pub erase: bool,
    /// Read back every segment after writing.
    pub verify: bool,
}

/// One request of a chunked transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub address: u32,
    /// Offset into the transferred data.
    pub offset: usize,
    pub size: usize,
}

/// Split `size` bytes at `address` into requests the RAM application accepts.
pub fn chunks(address: u32, size: usize) -> Chunks {
    Chunks {
        address: physical_flash_address(address),
        offset: 0,
        size,
    }
}

#[derive(Debug, Clone)]
pub struct Chunks {
    address: u32,
    offset: usize,
    size: usize,
}

impl Iterator for Chunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let remaining = self.size - self.offset;
        if remaining == 0 {
            return None;
        }

        let chunk = Chunk {
            address: self.address,
            offset: self.offset,
            size: remaining.min(READ_WRITE_CHUNK_SIZE),
        };
        self.address = self.address.wrapping_add(chunk.size as u32);
        self.offset += chunk.size;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = (self.size - self.offset).div_ceil(READ_WRITE_CHUNK_SIZE);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Chunks {}

fn end_of(address: u32, size: usize) -> u64 {
    u64::from(address) + size as u64
}

pub struct Flashing<L: Link> {
    session: Session<L>,
}

impl<L: Link> Flashing<L> {
    pub fn new(session: Session<L>) -> Result<Self> {
        session.ensure_connected("access flash")?;
        Ok(Flashing { session })
    }

    /// Open a link, connect to the PIC and check that it answers.
    pub fn open(link: L) -> Result<Self> {
        Self::new(Session::open_connected(link)?)
    }

    pub fn session(&mut self) -> &mut Session<L> {
        &mut self.session
    }

    pub fn into_session(self) -> Session<L> {
        self.session
    }

    fn transport(&mut self, operation: &'static str) -> Result<&mut Transport<L>> {
        self.session.ensure_connected(operation)?;
        Ok(self.session.transport())
    }

    pub fn erase(&mut self, address: u32, size: u32) -> Result<()> {
        let address = physical_flash_address(address);
        let transport = self.transport("erase flash")?;

        log::info!(
            "Erasing 0x{:08x}-0x{:08x}.",
            address,
            end_of(address, size as usize)
        );
        transport
            .transfer_with_timeout(Command::erase(address, size), ERASE_TIMEOUT)?
            .into_result()?;

        log::info!("Erase complete.");
        Ok(())
    }

    pub fn read(&mut self, address: u32, size: usize, progress: &mut dyn Progress) -> Result<Vec<u8>> {
        let transport = self.transport("read flash")?;
        let mut data = Vec::with_capacity(size);

        progress.started(Operation::Read, physical_flash_address(address), size);
        for chunk in chunks(address, size) {
            let payload = transport
                .transfer(Command::read(chunk.address, chunk.size as u32))?
                .into_result()?;
            if payload.len() != chunk.size {
                return Err(Error::UnexpectedLength {
                    expected: chunk.size,
                    actual: payload.len(),
                });
            }

            data.extend_from_slice(&payload);
            progress.advanced(chunk.size);
        }
        progress.finished();

        Ok(data)
    }

    /// Read every region in turn into one image.
    pub fn read_ranges(&mut self, ranges: &[Region], progress: &mut dyn Progress) -> Result<Image> {
        let mut image = Image::new();

        for range in ranges {
            let address = physical_flash_address(range.address);
            log::debug!("reading {}", range);
            log::info!(
                "Reading 0x{:08x}-0x{:08x}.",
                address,
                end_of(address, range.size as usize)
            );
            let data = self.read(address, range.size as usize, progress)?;
            image.add(address, &data)?;
            log::info!("Read complete.");
        }

        Ok(image)
    }

    pub fn write(&mut self, address: u32, data: &[u8], progress: &mut dyn Progress) -> Result<()> {
        let transport = self.transport("write flash")?;

        progress.started(Operation::Write, physical_flash_address(address), data.len());
        for chunk in chunks(address, data.len()) {
            let bytes = &data[chunk.offset..chunk.offset + chunk.size];
            transport
                .transfer(Command::write(chunk.address, bytes.to_vec()))?
                .into_result()?;
            progress.advanced(chunk.size);
        }
        progress.finished();

        Ok(())
    }

    /// Read back `data` from `address` and compare.
    pub fn verify(&mut self, address: u32, data: &[u8], progress: &mut dyn Progress) -> Result<()> {
        let transport = self.transport("verify flash")?;

        progress.started(Operation::Verify, physical_flash_address(address), data.len());
        for chunk in chunks(address, data.len()) {
            let expected = &data[chunk.offset..chunk.offset + chunk.size];
            let actual = transport
                .transfer(Command::read(chunk.address, chunk.size as u32))?
                .into_result()?;

            let mismatch = expected
                .iter()
                .zip(&actual)
                .position(|(a, b)| a != b)
                .or((actual.len() != expected.len()).then(|| actual.len().min(expected.len())));
            if let Some(index) = mismatch {
                return Err(Error::VerifyMismatch {
                    address: chunk.address.wrapping_add(index as u32),
                });
            }

            progress.advanced(chunk.size);
        }
        progress.finished();

        Ok(())
    }

    pub fn write_image(
        &mut self,
        image: &Image,
        options: WriteOptions,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        let image = image.to_physical()?;

        for segment in image.segments() {
            if !within_flash(segment) {
                log::warn!(
                    "0x{:08x}-0x{:08x} is outside the flash memory.",
                    segment.address,
                    segment.end()
                );
            }
        }

        if options.erase {
            for segment in image.segments() {
                self.erase(segment.address, segment.data.len() as u32)?;
            }
        }

        for segment in image.segments() {
            log::info!(
                "Writing 0x{:08x}-0x{:08x}.",
                segment.address,
                segment.end()
            );
            self.write(segment.address, &segment.data, progress)?;
            log::info!("Write complete.");
        }

        if options.verify {
            log::info!("Verifying written data.");
            for segment in image.segments() {
                log::info!(
                    "Verifying 0x{:08x}-0x{:08x}.",
                    segment.address,
                    segment.end()
                );
                self.verify(segment.address, &segment.data, progress)?;
                log::info!("Verify complete.");
            }
        }

        Ok(())
    }

    /// Read little-endian words in a single request.
    pub fn read_words(&mut self, address: u32, count: usize) -> Result<Vec<u32>> {
        let size = count * 4;
        let raw = self
            .transport("read registers")?
            .transfer(Command::read(physical_flash_address(address), size as u32))?
            .into_result()?;
        if raw.len() != size {
            return Err(Error::UnexpectedLength {
                expected: size,
                actual: raw.len(),
            });
        }

        let mut words = Vec::with_capacity(count);
        for offset in (0..size).step_by(4) {
            words.push(raw.pread_with::<u32>(offset, LE)?);
        }
        Ok(words)
    }

    pub fn configuration(&mut self) -> Result<Decoded> {
        let address = CONFIGURATION_BITS.address + CONFIGURATION_WORDS_OFFSET;
        let words = self.read_words(address, CONFIGURATION.registers.len())?;
        CONFIGURATION.decode(&words)
    }

    pub fn device_id(&mut self) -> Result<DeviceId> {
        let words = self.read_words(DEVICE_ID_ADDRESS, DEVICE_ID.registers.len())?;
        let id = DeviceId(words[0]);
        log::debug!("device id: ver {} devid {:#x}", id.ver(), id.devid());
        Ok(id)
    }

    pub fn unique_id(&mut self) -> Result<Decoded> {
        let words = self.read_words(UDID_ADDRESS, UNIQUE_ID.registers.len())?;
        UNIQUE_ID.decode(&words)
    }
}

/// Whether the segment lies inside a single flash range.
fn within_flash(segment: &Segment) -> bool {
    region_of(segment.address).is_some_and(|region| {
        u64::from(physical_flash_address(segment.address)) + segment.data.len() as u64
            <= region.end()
    })
}
