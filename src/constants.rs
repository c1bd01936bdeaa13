//! Protocol constants shared with the programmer firmware.

use std::time::Duration;

/// Command type values. Anything less than zero is a failure response.
pub mod commands {
    pub const FAILED: i16 = -1;

    pub const PING: i16 = 1;
    pub const ERASE: i16 = 2;
    pub const READ: i16 = 3;
    pub const WRITE: i16 = 4;

    pub const PROGRAMMER_PING: i16 = 100;
    pub const PROGRAMMER_CONNECT: i16 = 101;
    pub const PROGRAMMER_DISCONNECT: i16 = 102;
    pub const PROGRAMMER_RESET: i16 = 103;
    pub const PROGRAMMER_DEVICE_STATUS: i16 = 104;
    pub const PROGRAMMER_CHIP_ERASE: i16 = 105;
}

/// Error codes carried in failure responses.
pub mod errors {
    pub const EINVAL: i32 = -22;
    pub const ERANGE: i32 = -34;
    pub const EPROTO: i32 = -71;
    pub const EISCONN: i32 = -106;
    pub const ENOTCONN: i32 = -107;
    pub const ETIMEDOUT: i32 = -110;
    pub const EBADCRC: i32 = -1007;
    pub const EFLASHWRITE: i32 = -1008;
    pub const EFLASHERASE: i32 = -1009;

    pub const DESCRIPTIONS: &[(i32, &str)] = &[
        (EINVAL, "invalid argument"),
        (ERANGE, "bad value, likely a memory address out of range"),
        (EPROTO, "communication between programmer and PIC failed"),
        (EISCONN, "PIC already connected"),
        (ENOTCONN, "PIC is not connected"),
        (ETIMEDOUT, "PIC command timeout"),
        (EBADCRC, "invalid packet checksum"),
        (EFLASHWRITE, "flash write failed"),
        (EFLASHERASE, "flash erase failed"),
    ];
}

/// Default response timeout.
pub const SERIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Response timeout of erase commands.
pub const ERASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts made by the transport before giving up on a command.
pub const MAX_ATTEMPTS: usize = 3;

/// Largest read or write payload per request. Keeps a request, including
/// header, address and footer, within the programmer's frame buffer.
pub const READ_WRITE_CHUNK_SIZE: usize = 1016;

pub const DEFAULT_BAUDRATE: u32 = 460800;
