use std::{cell::RefCell, rc::Rc};

use log::{Level, LevelFilter, Metadata, Record};
use pretty_assertions::assert_eq;

use pictools::{
    Error, Flashing, Image, Session, State, WriteOptions,
    constants::errors,
    device::{FLASH_RANGES, PROGRAM_FLASH, Region},
    protocol::CommandType,
    transport::mock::{FakeFlash, MockLink},
};

thread_local! {
    static LINES: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Collects the confirmation lines logged by the test's own thread.
struct Capture;

impl log::Log for Capture {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() == Level::Info
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            LINES.with(|lines| lines.borrow_mut().push(record.args().to_string()));
        }
    }

    fn flush(&self) {}
}

static CAPTURE: Capture = Capture;

fn capture() {
    let _ = log::set_logger(&CAPTURE);
    log::set_max_level(LevelFilter::Info);
    LINES.with(|lines| lines.borrow_mut().clear());
}

fn lines() -> Vec<String> {
    LINES.with(|lines| lines.borrow().clone())
}

#[test]
fn reset() {
    capture();
    let mut link = MockLink::new();
    link.push_packet(CommandType::ProgrammerPing.raw(), &[]);
    link.push_packet(CommandType::Disconnect.raw(), &[]);
    link.push_packet(CommandType::Reset.raw(), &[]);

    let mut session = Session::open_disconnected(&mut link).unwrap();
    session.reset().unwrap();
    assert_eq!(session.state(), State::ProgrammerOnly);
    drop(session);

    assert_eq!(
        link.writes(),
        [
            hex::decode("00640000c36b").unwrap(),
            hex::decode("00660000ad0b").unwrap(),
            hex::decode("006700009a3b").unwrap(),
        ]
    );
    assert_eq!(
        lines(),
        ["Programmer is alive.", "Disconnected from PIC.", "PIC reset."]
    );
}

#[test]
fn reset_when_already_disconnected() {
    capture();
    let mut link = MockLink::new();
    link.push_packet(CommandType::ProgrammerPing.raw(), &[]);
    link.push_failure(errors::ENOTCONN);
    link.push_packet(CommandType::Reset.raw(), &[]);

    Session::open_disconnected(&mut link)
        .unwrap()
        .reset()
        .unwrap();

    assert_eq!(link.writes().len(), 3);
    assert_eq!(lines(), ["Programmer is alive.", "PIC reset."]);
}

#[test]
fn erase_chip_announces_before_opening() {
    capture();
    let mut link = MockLink::new();
    link.push_packet(CommandType::ProgrammerPing.raw(), &[]);
    link.push_packet(CommandType::Disconnect.raw(), &[]);
    link.push_packet(CommandType::ChipErase.raw(), &[]);

    let session = Session::erase_chip(&mut link).unwrap();
    assert_eq!(session.state(), State::ProgrammerOnly);
    drop(session);

    let types: Vec<_> = link.requests().iter().map(|r| r.command_type).collect();
    assert_eq!(
        types,
        [
            CommandType::ProgrammerPing.raw(),
            CommandType::Disconnect.raw(),
            CommandType::ChipErase.raw(),
        ]
    );
    assert_eq!(
        lines(),
        [
            "Erasing the chip.",
            "Programmer is alive.",
            "Disconnected from PIC.",
            "Chip erase complete."
        ]
    );
}

#[test]
fn ping() {
    capture();
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
            hex::decode("00640000c36b").unwrap(),
            hex::decode("00650000f45b").unwrap(),
            hex::decode("00010000b3f0").unwrap(),
        ]
    );
    assert_eq!(
        lines(),
        ["Programmer is alive.", "Connected to PIC.", "PIC is alive."]
    );
}

#[test]
fn ping_when_already_connected() {
    capture();
    let mut link = MockLink::new();
    link.push_packet(CommandType::ProgrammerPing.raw(), &[]);
    link.push_response(&hex::decode("ffff0004ffffff96ed46").unwrap());
    link.push_packet(CommandType::Ping.raw(), &[]);

    Session::open_connected(&mut link).unwrap();

    assert_eq!(lines(), ["Programmer is alive.", "PIC is alive."]);
}

#[test]
fn silent_programmer() {
    let mut link = MockLink::new();

    let err = Session::open_programmer(&mut link).err().unwrap();

    assert!(matches!(err, Error::CommunicationFailure));
    assert_eq!(err.to_string(), "communication failure");
    assert_eq!(link.writes().len(), 3);
}

#[test]
fn device_failure_message() {
    let mut link = MockLink::new();
    link.push_packet(CommandType::ProgrammerPing.raw(), &[]);
    link.push_packet(CommandType::Connect.raw(), &[]);
    link.push_packet(CommandType::Ping.raw(), &[]);
    link.push_response(&hex::decode("ffff0004ffffffde248a").unwrap());

    let mut flashing = Flashing::open(&mut link).unwrap();
    let err = flashing.erase(0x1d00_0000, 0x800).unwrap_err();

    assert_eq!(
        err.to_string(),
        "bad value, likely a memory address out of range"
    );
}

#[test]
fn device_status_print() {
    let mut link = MockLink::new();
    link.push_packet(CommandType::ProgrammerPing.raw(), &[]);
    link.push_response(&hex::decode("00680001853f01").unwrap());

    let status = Session::open_programmer(&mut link)
        .unwrap()
        .device_status()
        .unwrap();

    assert_eq!(
        status.to_string(),
        "STATUS: 0x85\n  CPS:    1\n  NVMERR: 0\n  CFGRDY: 0\n  FCBUSY: 1\n  DEVRST: 1"
    );
}

fn flash() -> (Rc<RefCell<FakeFlash>>, Flashing<MockLink>) {
    let flash = Rc::new(RefCell::new(FakeFlash::new(
        PROGRAM_FLASH.address,
        PROGRAM_FLASH.size as usize,
    )));
    let flashing = Flashing::open(MockLink::with_flash(flash.clone())).unwrap();
    (flash, flashing)
}

#[test]
fn write_then_read_back() {
    let (flash, mut flashing) = flash();
    let firmware: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let mut image = Image::new();
    image.add(0x9d00_1000, &firmware).unwrap();
    image.add(0x9d00_3000, &[0x12, 0x34]).unwrap();

    let options = WriteOptions {
        erase: true,
        verify: true,
    };
    flashing.write_image(&image, options, &mut ()).unwrap();

    assert_eq!(flash.borrow().memory[0x1000..0x1000 + 5000], firmware[..]);

    let ranges = [
        Region::new("firmware", 0x1d00_1000, 5000),
        Region::new("trailer", 0x1d00_3000, 2),
    ];
    let read = flashing.read_ranges(&ranges, &mut ()).unwrap();
    assert_eq!(read, image.to_physical().unwrap());
}

#[test]
fn verify_detects_corruption() {
    let (flash, mut flashing) = flash();
    let firmware = vec![0x5a; 3000];
    flashing.write(0x1d00_0000, &firmware, &mut ()).unwrap();

    flash.borrow_mut().memory[2047] = 0x00;

    let err = flashing.verify(0x1d00_0000, &firmware, &mut ()).unwrap_err();
    assert_eq!(err.to_string(), "verify failed at address 0x1d0007ff");
}

#[test]
fn read_all_outside_fake_flash_fails() {
    let (_flash, mut flashing) = flash();

    let err = flashing.read_ranges(&FLASH_RANGES, &mut ()).unwrap_err();

    assert!(matches!(err, Error::Device(code) if code.0 == errors::ERANGE));
}
