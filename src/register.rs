//! Packed configuration, identity and status registers.
//!
//! Every register is described by a constant list of fields, most
//! significant first. The field widths of a register always add up to the
//! register width, which is checked when the layout is compiled.

use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Unsigned,
    Signed,
    Reserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Radix {
    Decimal,
    Hex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub width: u32,
    pub kind: Kind,
    pub radix: Radix,
}

impl Field {
    pub const fn unsigned(name: &'static str, width: u32) -> Self {
        Field {
            name,
            width,
            kind: Kind::Unsigned,
            radix: Radix::Decimal,
        }
    }

    pub const fn signed(name: &'static str, width: u32) -> Self {
        Field {
            name,
            width,
            kind: Kind::Signed,
            radix: Radix::Decimal,
        }
    }

    /// Unsigned field printed as `0x%08x`.
    pub const fn hex(name: &'static str, width: u32) -> Self {
        Field {
            name,
            width,
            kind: Kind::Unsigned,
            radix: Radix::Hex,
        }
    }

    pub const fn reserved(width: u32) -> Self {
        Field {
            name: "",
            width,
            kind: Kind::Reserved,
            radix: Radix::Decimal,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Register {
    /// Heading printed above the fields, if any.
    pub name: Option<&'static str>,
    pub width: u32,
    pub fields: &'static [Field],
}

impl Register {
    pub const fn new(name: Option<&'static str>, width: u32, fields: &'static [Field]) -> Self {
        let mut total = 0;
        let mut i = 0;

        while i < fields.len() {
            assert!(fields[i].width > 0, "empty field");
            total += fields[i].width;
            i += 1;
        }

        assert!(width <= 32, "register wider than a word");
        assert!(total == width, "field widths must add up to the register width");

        Register {
            name,
            width,
            fields,
        }
    }

    /// Named fields of `raw`, most significant first. Bits above the
    /// register width are ignored.
    pub fn decode(&self, raw: u32) -> Vec<FieldValue> {
        let mut shift = self.width;
        let mut values = Vec::new();

        for field in self.fields {
            shift -= field.width;
            let bits = (u64::from(raw) >> shift) & ((1u64 << field.width) - 1);

            let value = match field.kind {
                Kind::Reserved => continue,
                Kind::Unsigned => bits as i64,
                Kind::Signed if bits >> (field.width - 1) != 0 => bits as i64 - (1i64 << field.width),
                Kind::Signed => bits as i64,
            };

            values.push(FieldValue {
                name: field.name,
                value,
                radix: field.radix,
            });
        }

        values
    }
}

/// A group of registers read together.
#[derive(Debug, Clone, Copy)]
pub struct Group {
    pub registers: &'static [Register],
}

impl Group {
    /// Decode one raw word per register.
    pub fn decode(&self, words: &[u32]) -> Result<Decoded> {
        if words.len() != self.registers.len() {
            return Err(Error::UnexpectedLength {
                expected: self.registers.len(),
                actual: words.len(),
            });
        }

        let registers = self
            .registers
            .iter()
            .zip(words)
            .map(|(register, &raw)| DecodedRegister {
                name: register.name,
                fields: register.decode(raw),
            })
            .collect();

        Ok(Decoded { registers })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldValue {
    pub name: &'static str,
    pub value: i64,
    pub radix: Radix,
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.radix {
            Radix::Decimal => write!(f, "{}", self.value),
            Radix::Hex => write!(f, "0x{:08x}", self.value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRegister {
    pub name: Option<&'static str>,
    pub fields: Vec<FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub registers: Vec<DecodedRegister>,
}

impl Decoded {
    pub fn get(&self, name: &str) -> Option<i64> {
        self.registers
            .iter()
            .flat_map(|r| &r.fields)
            .find(|f| f.name == name)
            .map(|f| f.value)
    }
}

impl fmt::Display for Decoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines = Vec::new();

        for register in &self.registers {
            if register.fields.is_empty() {
                continue;
            }

            if let Some(name) = register.name {
                lines.push(name.to_string());
            }

            for field in &register.fields {
                lines.push(format!("  {}: {}", field.name, field));
            }
        }

        f.write_str(&lines.join("\n"))
    }
}

const RESERVED_WORD: Register = Register::new(None, 32, &[Field::reserved(32)]);

pub const FDEVOPT: Register = Register::new(
    Some("FDEVOPT"),
    32,
    &[
        Field::unsigned("USERID", 16),
        Field::unsigned("FVBUSIO", 1),
        Field::unsigned("FUSBIDIO", 1),
        Field::reserved(9),
        Field::unsigned("ALTI2C", 1),
        Field::unsigned("SOSCHP", 1),
        Field::reserved(3),
    ],
);

pub const FICD: Register = Register::new(
    Some("FICD"),
    32,
    &[
        Field::reserved(27),
        Field::unsigned("ICS", 2),
        Field::unsigned("JTAGEN", 1),
        Field::reserved(2),
    ],
);

pub const FPOR: Register = Register::new(
    Some("FPOR"),
    32,
    &[
        Field::reserved(28),
        Field::unsigned("LPBOREN", 1),
        Field::unsigned("RETVR", 1),
        Field::unsigned("BOREN", 2),
    ],
);

pub const FWDT: Register = Register::new(
    Some("FWDT"),
    32,
    &[
        Field::reserved(16),
        Field::unsigned("FWDTEN", 1),
        Field::unsigned("RCLKSEL", 2),
        Field::unsigned("RWDTPS", 5),
        Field::unsigned("WINDIS", 1),
        Field::unsigned("FWDTWINSZ", 2),
        Field::unsigned("SWDTPS", 5),
    ],
);

pub const FOSCSEL: Register = Register::new(
    Some("FOSCSEL"),
    32,
    &[
        Field::reserved(16),
        Field::unsigned("FCKSM", 2),
        Field::reserved(1),
        Field::unsigned("SOSCSEL", 1),
        Field::reserved(1),
        Field::unsigned("OSCIOFNC", 1),
        Field::unsigned("POSCMOD", 2),
        Field::unsigned("IESO", 1),
        Field::unsigned("SOSCEN", 1),
        Field::reserved(1),
        Field::unsigned("PLLSRC", 1),
        Field::reserved(1),
        Field::unsigned("FNOSC", 3),
    ],
);

pub const FSEC: Register = Register::new(
    Some("FSEC"),
    32,
    &[Field::unsigned("CP", 1), Field::reserved(31)],
);

/// Configuration words, read as 10 consecutive words.
pub const CONFIGURATION: Group = Group {
    registers: &[
        RESERVED_WORD,
        FDEVOPT,
        FICD,
        FPOR,
        FWDT,
        FOSCSEL,
        FSEC,
        RESERVED_WORD,
        RESERVED_WORD,
        RESERVED_WORD,
    ],
};

pub const DEVICE_ID: Group = Group {
    registers: &[Register::new(
        Some("DEVID"),
        32,
        &[Field::unsigned("VER", 4), Field::hex("DEVID", 28)],
    )],
};

pub const UNIQUE_ID: Group = Group {
    registers: &[
        Register::new(Some("UDID"), 32, &[Field::hex("UDID1", 32)]),
        Register::new(None, 32, &[Field::hex("UDID2", 32)]),
        Register::new(None, 32, &[Field::hex("UDID3", 32)]),
        Register::new(None, 32, &[Field::hex("UDID4", 32)]),
        Register::new(None, 32, &[Field::hex("UDID5", 32)]),
    ],
};

pub const STATUS: Register = Register::new(
    Some("STATUS"),
    8,
    &[
        Field::unsigned("CPS", 1),
        Field::reserved(1),
        Field::unsigned("NVMERR", 1),
        Field::reserved(1),
        Field::unsigned("CFGRDY", 1),
        Field::unsigned("FCBUSY", 1),
        Field::reserved(1),
        Field::unsigned("DEVRST", 1),
    ],
);

bitfield::bitfield! {
    /// ICSP status byte reported by the programmer.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct DeviceStatus(u8);
    impl Debug;
    /// Code protect state.
    pub cps, _: 7;
    /// Flash controller error.
    pub nvmerr, _: 5;
    /// Configuration has been read and the device is ready.
    pub cfgrdy, _: 3;
    /// Flash controller busy.
    pub fcbusy, _: 2;
    /// Device held in reset.
    pub devrst, _: 0;
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "STATUS: 0x{:02x}", self.0)?;

        for field in STATUS.decode(self.0.into()) {
            write!(f, "\n  {:<8}{}", format!("{}:", field.name), field)?;
        }

        Ok(())
    }
}

bitfield::bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct DeviceId(u32);
    impl Debug;
    pub ver, _: 31, 28;
    pub devid, _: 27, 0;
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match DEVICE_ID.decode(&[self.0]) {
            Ok(decoded) => fmt::Display::fmt(&decoded, f),
            Err(_) => Err(fmt::Error),
        }
    }
}
