//! PIC32MM memory map.
use std::fmt;

use anyhow::Result;

/// Physical address bits. Clearing the rest maps a KSEG0/KSEG1 virtual
/// address to its physical address.
pub const PHYSICAL_ADDRESS_MASK: u32 = 0x1fff_ffff;

/// A named memory range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub name: &'static str,
    pub address: u32,
    pub size: u32,
}

impl Region {
    pub const fn new(name: &'static str, address: u32, size: u32) -> Self {
        Region {
            name,
            address,
            size,
        }
    }

    /// One past the last byte. Wide enough for ranges reaching 4 GiB.
    pub const fn end(&self) -> u64 {
        self.address as u64 + self.size as u64
    }

    pub const fn contains(&self, address: u32) -> bool {
        address >= self.address && (address as u64) < self.end()
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08x}-0x{:08x})", self.name, self.address, self.end())
    }
}

pub const PROGRAM_FLASH: Region = Region::new("program flash", 0x1d00_0000, 0x0004_0000);
pub const BOOT_FLASH: Region = Region::new("boot flash", 0x1fc0_0000, 0x0000_1700);
pub const CONFIGURATION_BITS: Region = Region::new("configuration bits", 0x1fc0_1700, 0x0000_0100);

/// Everything `flash_read_all` reads, in order.
pub const FLASH_RANGES: [Region; 3] = [PROGRAM_FLASH, BOOT_FLASH, CONFIGURATION_BITS];

/// First configuration word, relative to the configuration bits.
pub const CONFIGURATION_WORDS_OFFSET: u32 = 0xc0;
pub const DEVICE_ID_ADDRESS: u32 = 0x1f80_3660;
pub const UDID_ADDRESS: u32 = 0x1fc4_1840;

pub const fn physical_flash_address(address: u32) -> u32 {
    address & PHYSICAL_ADDRESS_MASK
}

/// Flash region containing `address`, if any.
pub fn region_of(address: u32) -> Option<&'static Region> {
    let address = physical_flash_address(address);
    FLASH_RANGES.iter().find(|r| r.contains(address))
}

/// Parse a number given on the command line.
///
/// Accepts `0x`, `0o` and `0b` prefixes as well as `K`, `KB` and `KiB`
/// suffixes, which all mean 1024.
pub fn parse_number(s: &str) -> Result<u32> {
    let s = s.trim().replace('_', "");

    let (digits, multiplier) = if let Some(digits) = s.strip_suffix("KiB") {
        (digits, 1024)
    } else if let Some(digits) = s.strip_suffix("KB") {
        (digits, 1024)
    } else if let Some(digits) = s.strip_suffix('K') {
        (digits, 1024)
    } else {
        (s.as_str(), 1)
    };

    let value = if let Some(hex) = digits.strip_prefix("0x").or(digits.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if let Some(octal) = digits.strip_prefix("0o") {
        u32::from_str_radix(octal, 8)
    } else if let Some(binary) = digits.strip_prefix("0b") {
        u32::from_str_radix(binary, 2)
    } else {
        digits.parse()
    }
    .map_err(|e| anyhow::format_err!("invalid number {:?}: {}", s, e))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow::format_err!("number {:?} out of range", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0x9d00_0000 => 0x1d00_0000; "kseg0 program flash")]
    #[test_case(0xbfc0_1700 => 0x1fc0_1700; "kseg1 configuration bits")]
    #[test_case(0x1d00_1000 => 0x1d00_1000; "already physical")]
    #[test_case(0xffff_ffff => 0x1fff_ffff; "all ones")]
    fn physical(address: u32) -> u32 {
        physical_flash_address(address)
    }

    #[test]
    fn physical_address_is_idempotent() {
        for address in [0u32, 0x8000_0000, 0x9d00_0123, 0xbfc0_0000, 0xe000_0001, u32::MAX] {
            let physical = physical_flash_address(address);
            assert_eq!(physical_flash_address(physical), physical);
            assert_eq!(physical & !PHYSICAL_ADDRESS_MASK, 0);
            assert_eq!(physical, address & 0x1fff_ffff);
        }
    }

    #[test]
    fn flash_ranges_are_disjoint() {
        for (i, a) in FLASH_RANGES.iter().enumerate() {
            for b in &FLASH_RANGES[i + 1..] {
                assert!(
                    a.end() <= u64::from(b.address) || b.end() <= u64::from(a.address),
                    "{a} {b}"
                );
            }
        }
        assert_eq!(region_of(0x9fc0_17ff), Some(&CONFIGURATION_BITS));
        assert_eq!(region_of(0x9fc0_1800), None);
        assert_eq!(region_of(0xbd03_ffff), Some(&PROGRAM_FLASH));
        assert_eq!(region_of(0x1d04_0000), None);
        assert_eq!(region_of(DEVICE_ID_ADDRESS), None);
        assert_eq!(region_of(UDID_ADDRESS), None);
    }

    #[test]
    fn region_at_top_of_address_space() {
        let region = Region::new("flash", 0xffff_f000, 0x2000);

        assert_eq!(region.end(), 0x1_0000_1000);
        assert_eq!(region.to_string(), "flash (0xfffff000-0x100001000)");
        assert!(region.contains(u32::MAX));
        assert!(!region.contains(0xffff_efff));
    }

    #[test_case("0x1d000000" => 0x1d00_0000)]
    #[test_case("4096" => 4096)]
    #[test_case("0o17" => 15)]
    #[test_case("0b101" => 5)]
    #[test_case("256K" => 0x4_0000)]
    #[test_case("4KiB" => 4096)]
    #[test_case("0x1000_0000" => 0x1000_0000)]
    fn numbers(s: &str) -> u32 {
        parse_number(s).unwrap()
    }

    #[test]
    fn bad_numbers() {
        assert!(parse_number("0xg").is_err());
        assert!(parse_number("").is_err());
        assert!(parse_number("8388608K").is_err());
    }
}
