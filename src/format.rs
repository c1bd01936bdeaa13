//! Firmware image files.
use std::path::Path;
use std::str;

use anyhow::Result;
use object::{
    Endianness,
    elf::{FileHeader32, PT_LOAD},
    read::elf::{FileHeader, ProgramHeader},
};

use crate::device::physical_flash_address;
use crate::error::Error;

/// Data bytes per Intel HEX record when saving.
const IHEX_RECORD_SIZE: usize = 16;
/// Data bytes per S3 record when saving.
const SREC_RECORD_SIZE: usize = 32;

const IHEX_EXTENSIONS: [&str; 6] = ["ihex", "ihe", "h86", "hex", "a43", "a90"];
const SREC_EXTENSIONS: [&str; 6] = ["srec", "s19", "s28", "s37", "mot", "s"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    IntelHex,
    SRecord,
    ELF,
}

/// Contiguous data at an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub address: u32,
    pub data: Vec<u8>,
}

impl Segment {
    pub fn end(&self) -> u64 {
        u64::from(self.address) + self.data.len() as u64
    }
}

/// Sorted, non-overlapping segments. Adjacent data is merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    segments: Vec<Segment>,
}

impl Image {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.data.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn add(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }

        let end = u64::from(address) + data.len() as u64;
        let index = self.segments.partition_point(|s| s.end() <= u64::from(address));

        if let Some(next) = self.segments.get(index) {
            if u64::from(next.address) < end {
                return Err(Error::SegmentOverlap {
                    address: next.address.max(address),
                });
            }
        }

        let joins_previous = index > 0 && self.segments[index - 1].end() == u64::from(address);
        let joins_next = self
            .segments
            .get(index)
            .is_some_and(|next| u64::from(next.address) == end);

        match (joins_previous, joins_next) {
            (true, true) => {
                let next = self.segments.remove(index);
                let previous = &mut self.segments[index - 1];
                previous.data.extend_from_slice(data);
                previous.data.extend_from_slice(&next.data);
            }
            (true, false) => self.segments[index - 1].data.extend_from_slice(data),
            (false, true) => {
                let next = &mut self.segments[index];
                let mut merged = data.to_vec();
                merged.extend_from_slice(&next.data);
                next.address = address;
                next.data = merged;
            }
            (false, false) => self.segments.insert(
                index,
                Segment {
                    address,
                    data: data.to_vec(),
                },
            ),
        }

        Ok(())
    }

    /// Copy of the image with every segment moved to its physical address.
    pub fn to_physical(&self) -> Result<Image, Error> {
        let mut image = Image::new();
        for segment in &self.segments {
            image.add(physical_flash_address(segment.address), &segment.data)?;
        }
        Ok(image)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let raw = std::fs::read(p)?;

        let format = guess_format(p, &raw)?;
        log::debug!("Read {} as {:?} format", p.display(), format);
        match format {
            FirmwareFormat::IntelHex => Self::from_ihex(str::from_utf8(&raw)?),
            FirmwareFormat::SRecord => Self::from_srec(str::from_utf8(&raw)?),
            FirmwareFormat::ELF => Self::from_elf(&raw),
        }
    }

    pub fn from_ihex(data: &str) -> Result<Self> {
        use ihex::Record;

        let mut base_address = 0;
        let mut image = Image::new();

        for record in ihex::Reader::new(data) {
            let record = record?;
            use Record::*;
            match record {
                Data { offset, value } => {
                    let offset = base_address + offset as u32;

                    image.add(offset, &value)?;
                }
                EndOfFile => (),
                ExtendedSegmentAddress(address) => {
                    base_address = (address as u32) * 16;
                }
                StartSegmentAddress { .. } => (),
                ExtendedLinearAddress(address) => {
                    base_address = (address as u32) << 16;
                }
                StartLinearAddress(_) => (),
            };
        }

        Ok(image)
    }

    pub fn from_srec(data: &str) -> Result<Self> {
        use srec::Record;

        let mut image = Image::new();

        for record in srec::reader::read_records(data) {
            let record = record.map_err(|e| anyhow::format_err!("invalid S-record: {:?}", e))?;
            match record {
                Record::S1(data) => image.add(u32::from(data.address.0), &data.data)?,
                Record::S2(data) => image.add(data.address.0, &data.data)?,
                Record::S3(data) => image.add(data.address.0, &data.data)?,
                _ => (),
            }
        }

        Ok(image)
    }

    /// Loadable segments of an ELF32 file, at their physical addresses.
    pub fn from_elf(elf_data: &[u8]) -> Result<Self> {
        let file_kind = object::FileKind::parse(elf_data)?;

        match file_kind {
            object::FileKind::Elf32 => (),
            _ => anyhow::bail!("cannot read file as ELF32 format"),
        }
        let elf_header = FileHeader32::<Endianness>::parse(elf_data)?;
        let endian = elf_header.endian()?;

        let mut image = Image::new();

        for segment in elf_header.program_headers(endian, elf_data)? {
            let p_paddr: u64 = segment.p_paddr(endian).into();
            let p_vaddr: u64 = segment.p_vaddr(endian).into();

            let segment_data = segment
                .data(endian, elf_data)
                .map_err(|_| anyhow::format_err!("Failed to access data for an ELF segment."))?;
            if !segment_data.is_empty() && segment.p_type(endian) == PT_LOAD {
                log::debug!(
                    "Found loadable segment, physical address: {:#010x}, virtual address: {:#010x}, size: {:#x}",
                    p_paddr,
                    p_vaddr,
                    segment_data.len()
                );
                image.add(p_paddr as u32, segment_data)?;
            }
        }

        if image.is_empty() {
            anyhow::bail!("empty ELF file");
        }
        log::debug!("found {} segments", image.segments.len());
        Ok(image)
    }

    /// Render as Intel HEX.
    pub fn to_ihex(&self) -> Result<String> {
        use ihex::Record;

        let mut records = vec![];
        let mut upper = None;

        for segment in &self.segments {
            let mut address = segment.address;
            let mut data = &segment.data[..];

            while !data.is_empty() {
                if upper != Some(address >> 16) {
                    upper = Some(address >> 16);
                    records.push(Record::ExtendedLinearAddress((address >> 16) as u16));
                }

                // Records never cross a 64 KiB boundary.
                let room = 0x1_0000 - (address & 0xffff) as usize;
                let size = data.len().min(IHEX_RECORD_SIZE).min(room);

                records.push(Record::Data {
                    offset: address as u16,
                    value: data[..size].to_vec(),
                });
                address = address.wrapping_add(size as u32);
                data = &data[size..];
            }
        }

        records.push(Record::EndOfFile);

        Ok(ihex::create_object_file_representation(&records)?)
    }

    /// Render as Motorola S-records: S3 data, a record count and an S7 terminator.
    pub fn to_srec(&self) -> String {
        use srec::{Address32, Count16, Count24, Data, Record};

        let mut records = vec![];

        for segment in &self.segments {
            let mut address = segment.address;
            for data in segment.data.chunks(SREC_RECORD_SIZE) {
                records.push(Record::S3(Data {
                    address: Address32(address),
                    data: data.to_vec(),
                }));
                address = address.wrapping_add(data.len() as u32);
            }
        }

        let count = records.len();
        match u16::try_from(count) {
            Ok(count) => records.push(Record::S5(Count16(count))),
            Err(_) => records.push(Record::S6(Count24(count as u32))),
        }
        records.push(Record::S7(Address32(0)));

        srec::writer::generate_srec_file(&records)
    }

    pub fn write_ihex<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_text(path.as_ref(), self.to_ihex()?)
    }

    pub fn write_srec<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_text(path.as_ref(), self.to_srec())
    }

    /// Save as Intel HEX when the extension names it, as S-records otherwise.
    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if IHEX_EXTENSIONS.contains(&&*extension(path)) {
            self.write_ihex(path)
        } else {
            self.write_srec(path)
        }
    }
}

fn write_text(path: &Path, mut text: String) -> Result<()> {
    if !text.ends_with('\n') {
        text.push('\n');
    }
    std::fs::write(path, text)?;
    Ok(())
}

fn extension(path: &Path) -> String {
    path.extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase()
}

pub fn guess_format(path: &Path, raw: &[u8]) -> Result<FirmwareFormat> {
    let ext = extension(path);
    if IHEX_EXTENSIONS.contains(&&*ext) {
        return Ok(FirmwareFormat::IntelHex);
    }
    if SREC_EXTENSIONS.contains(&&*ext) {
        return Ok(FirmwareFormat::SRecord);
    }

    if raw.starts_with(&[0x7f, b'E', b'L', b'F']) {
        Ok(FirmwareFormat::ELF)
    } else if raw.first() == Some(&b':')
        && raw
            .iter()
            .all(|&c| c.is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        Ok(FirmwareFormat::IntelHex)
    } else if raw.first() == Some(&b'S') && raw.get(1).is_some_and(u8::is_ascii_digit) {
        Ok(FirmwareFormat::SRecord)
    } else {
        anyhow::bail!("unsupported file format of {}", path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn adjacent_data_is_merged() {
        let mut image = Image::new();
        image.add(0x100, &[1, 2]).unwrap();
        image.add(0x104, &[5, 6]).unwrap();
        image.add(0x102, &[3, 4]).unwrap();
        image.add(0x0fe, &[0xfe, 0xff]).unwrap();
        image.add(0x200, &[9]).unwrap();

        assert_eq!(
            image.segments(),
            [
                Segment {
                    address: 0x0fe,
                    data: vec![0xfe, 0xff, 1, 2, 3, 4, 5, 6]
                },
                Segment {
                    address: 0x200,
                    data: vec![9]
                },
            ]
        );
        assert_eq!(image.len(), 9);
    }

    #[test]
    fn overlapping_data_is_rejected() {
        let mut image = Image::new();
        image.add(0x100, &[0; 16]).unwrap();

        assert!(matches!(
            image.add(0x10f, &[0; 2]),
            Err(Error::SegmentOverlap { address: 0x10f })
        ));
        assert!(matches!(
            image.add(0x0f0, &[0; 17]),
            Err(Error::SegmentOverlap { address: 0x100 })
        ));
        image.add(0x0f0, &[0; 16]).unwrap();
        assert_eq!(image.segments().len(), 1);
    }

    #[test]
    fn physical_image() {
        let mut image = Image::new();
        image.add(0x9d00_0000, &[1, 2, 3]).unwrap();
        image.add(0xbfc0_0000, &[4]).unwrap();

        let physical = image.to_physical().unwrap();

        assert_eq!(physical.segments()[0].address, 0x1d00_0000);
        assert_eq!(physical.segments()[1].address, 0x1fc0_0000);
    }

    #[test]
    fn ihex_round_trip() {
        let mut image = Image::new();
        image
            .add(0x1d00_fff8, &(0u8..40).collect::<Vec<_>>())
            .unwrap();
        image.add(0x1fc0_1700, &[0xaa; 3]).unwrap();

        let text = image.to_ihex().unwrap();
        let lines: Vec<_> = text.lines().collect();

        assert_eq!(lines[0], ":020000041D00DD");
        assert_eq!(lines.last(), Some(&":00000001FF"));
        assert!(text.contains(":020000041D01DC"));
        assert!(text.contains(":020000041FC01B"));
        assert_eq!(Image::from_ihex(&text).unwrap(), image);
    }

    /// Little-endian MIPS ELF32 with one PT_LOAD segment and no sections.
    fn elf(paddr: u32, data: &[u8]) -> Vec<u8> {
        let mut elf = vec![0x7f, b'E', b'L', b'F', 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        for half in [2u16, 8] {
            elf.extend_from_slice(&half.to_le_bytes());
        }
        for word in [1u32, 0x9d00_0000, 52, 0, 0] {
            elf.extend_from_slice(&word.to_le_bytes());
        }
        for half in [52u16, 32, 1, 40, 0, 0] {
            elf.extend_from_slice(&half.to_le_bytes());
        }
        let size = data.len() as u32;
        for word in [PT_LOAD, 84, paddr | 0x8000_0000, paddr, size, size, 5, 4] {
            elf.extend_from_slice(&word.to_le_bytes());
        }
        elf.extend_from_slice(data);
        elf
    }

    #[test]
    fn elf_segments_without_sections() {
        let image = Image::from_elf(&elf(0x1d00_0000, &[1, 2, 3, 4])).unwrap();

        assert_eq!(
            image.segments(),
            [Segment {
                address: 0x1d00_0000,
                data: vec![1, 2, 3, 4]
            }]
        );
        assert!(Image::from_elf(&elf(0x1d00_0000, &[])).is_err());
    }

    #[test]
    fn guess() {
        assert_eq!(
            guess_format(Path::new("app.hex"), b"").unwrap(),
            FirmwareFormat::IntelHex
        );
        assert_eq!(
            guess_format(Path::new("app"), b"\x7fELF\x01").unwrap(),
            FirmwareFormat::ELF
        );
        assert_eq!(
            guess_format(Path::new("app.txt"), b":00000001FF\n").unwrap(),
            FirmwareFormat::IntelHex
        );
        assert_eq!(
            guess_format(Path::new("app.s19"), b"").unwrap(),
            FirmwareFormat::SRecord
        );
        assert_eq!(
            guess_format(Path::new("dump"), b"S00600004844521B\n").unwrap(),
            FirmwareFormat::SRecord
        );
        assert!(guess_format(Path::new("app.bin"), b"\x00\x01").is_err());
        assert!(guess_format(Path::new("notes"), b"Some text").is_err());
    }

    #[test]
    fn srec_round_trip() {
        let mut image = Image::new();
        image
            .add(0x1d00_fff8, &(0u8..40).collect::<Vec<_>>())
            .unwrap();
        image.add(0x1fc0_1700, &[0xaa; 3]).unwrap();

        let text = image.to_srec();
        let lines: Vec<_> = text.lines().map(str::to_uppercase).collect();

        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("S3251D00FFF8"));
        assert!(lines[1].starts_with("S30D1D010018"));
        assert!(lines[2].starts_with("S3081FC01700AAAAAA"));
        assert!(lines[3].starts_with("S5030003"));
        assert!(lines[4].starts_with("S705000000"));
        assert_eq!(Image::from_srec(&text).unwrap(), image);
    }

    #[test]
    fn srec_accepts_short_addresses() {
        let image = Image::from_srec("S1061000010203E3\nS9030000FC\n").unwrap();

        assert_eq!(
            image.segments(),
            [Segment {
                address: 0x1000,
                data: vec![1, 2, 3]
            }]
        );
    }

    #[test]
    fn output_format_follows_extension() {
        let dir = std::env::temp_dir().join(format!("pictools-format-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut image = Image::new();
        image.add(0x1d00_0000, &[1, 2, 3, 4]).unwrap();

        image.write_file(dir.join("flash.hex")).unwrap();
        image.write_file(dir.join("flash.srec")).unwrap();
        let ihex = std::fs::read_to_string(dir.join("flash.hex")).unwrap();
        let srec = std::fs::read_to_string(dir.join("flash.srec")).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert!(ihex.starts_with(':'));
        assert!(srec.starts_with('S'));
        assert_eq!(Image::from_srec(&srec).unwrap(), image);
    }
}
