//! PIC32MM programmer protocol implementation.

pub mod constants;
pub mod device;
pub mod error;
pub mod flashing;
pub mod format;
pub mod protocol;
pub mod ramapp;
pub mod register;
pub mod session;
pub mod transport;

pub use self::error::{Error, Result};
pub use self::flashing::{Flashing, Progress, WriteOptions};
pub use self::format::Image;
pub use self::protocol::{Command, Response};
pub use self::session::{Session, State};
pub use self::transport::{Link, Transport};
