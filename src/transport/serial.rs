//! Serial link to the programmer.
use std::{
    fmt::Display,
    io::{self, Read, Write},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use clap::{ValueEnum, builder::PossibleValue};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use super::Link;
use crate::constants::{DEFAULT_BAUDRATE, SERIAL_TIMEOUT};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Baudrate {
    Baud115200,
    #[default]
    Baud460800,
    Baud921600,
}

impl From<Baudrate> for u32 {
    fn from(value: Baudrate) -> Self {
        match value {
            Baudrate::Baud115200 => 115200,
            Baudrate::Baud460800 => DEFAULT_BAUDRATE,
            Baudrate::Baud921600 => 921600,
        }
    }
}

impl Display for Baudrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u32::from(*self))
    }
}

impl ValueEnum for Baudrate {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            Baudrate::Baud115200,
            Baudrate::Baud460800,
            Baudrate::Baud921600,
        ]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        match self {
            Baudrate::Baud115200 => Some(PossibleValue::new("115200").aliases(["115_200"])),
            Baudrate::Baud460800 => Some(PossibleValue::new("460800").aliases(["460_800"])),
            Baudrate::Baud921600 => Some(PossibleValue::new("921600").aliases(["921_600"])),
        }
    }
}

pub struct SerialLink {
    serial_port: Box<dyn SerialPort>,
}

impl SerialLink {
    pub fn open(port: &str, baudrate: Baudrate) -> Result<Self> {
        log::debug!("Opening serial port: \"{}\" @ {} baud", port, baudrate);
        let serial_port = serialport::new(port, baudrate.into())
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(SERIAL_TIMEOUT)
            .open()
            .with_context(|| format!("failed to open {}", port))?;
        Ok(SerialLink { serial_port })
    }
}

impl Link for SerialLink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.serial_port.write_all(data)?;
        self.serial_port.flush()
    }

    fn read(&mut self, len: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; len];
        let mut received = 0;

        while received < len {
            let remaining = deadline.saturating_duration_since(Instant::now());

            if remaining.is_zero() {
                break;
            }

            self.serial_port.set_timeout(remaining)?;

            match self.serial_port.read(&mut buf[received..]) {
                Ok(0) => break,
                Ok(n) => received += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        buf.truncate(received);
        Ok(buf)
    }
}
