use std::{path::PathBuf, process::ExitCode};

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, LevelPadding, TermLogger, TerminalMode};

use pictools::{
    Flashing, Image, Progress, Session, WriteOptions,
    device::{FLASH_RANGES, Region, parse_number},
    flashing::Operation,
    ramapp,
    transport::{Baudrate, SerialLink},
};

#[derive(Parser)]
#[command(
    name = "pictools",
    version,
    about = "Erase, read from and write to PIC32MM flash memory, and more",
    long_about = "Erase, read from and write to PIC32MM flash memory, and more. \
        Uploads the RAM application to the PIC RAM over ICSP, which in turn accesses \
        the flash memory."
)]
struct Cli {
    /// Programmer serial port
    #[arg(short, long, global = true, default_value = "/dev/ttyUSB1")]
    port: String,

    /// Programmer serial baudrate
    #[arg(short, long, global = true, value_enum, default_value_t = Baudrate::default())]
    baudrate: Baudrate,

    /// Print debug output and full error chains
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(rename_all = "snake_case")]
enum Commands {
    /// Reset the PIC
    Reset,
    /// Test if the PIC is alive and executing the RAM application
    Ping,
    /// Erase given flash range
    FlashErase {
        #[arg(value_parser = parse_number)]
        address: u32,
        #[arg(value_parser = parse_number)]
        size: u32,
    },
    /// Read from the flash memory
    FlashRead {
        #[arg(value_parser = parse_number)]
        address: u32,
        #[arg(value_parser = parse_number)]
        size: u32,
        /// Intel HEX for .hex files, Motorola S-records otherwise
        outfile: PathBuf,
    },
    /// Read program flash, boot flash and configuration memory
    FlashReadAll {
        /// Intel HEX for .hex files, Motorola S-records otherwise
        outfile: PathBuf,
    },
    /// Write given file to flash. Optionally performs erase and verify operations
    FlashWrite {
        #[arg(short, long)]
        erase: bool,
        #[arg(short, long)]
        verify: bool,
        /// Intel HEX, Motorola S-record or ELF file
        binfile: PathBuf,
    },
    /// Erase program flash, boot flash and configuration memory
    FlashEraseChip,
    /// Print the configuration memory
    ConfigurationPrint,
    /// Print the device id
    DeviceIdPrint,
    /// Print the unique chip id
    UdidPrint,
    /// Print the device status
    DeviceStatusPrint,
    /// Test if the programmer is alive
    ProgrammerPing,
    /// Generate the RAM application C source file
    GenerateRamappUploadInstructions {
        elffile: PathBuf,
        outfile: PathBuf,
        /// objdump for the RAM application target
        #[arg(long, default_value = ramapp::DEFAULT_OBJDUMP)]
        objdump: String,
    },
}

/// Progress bars on the terminal.
struct ProgressBars {
    hidden: bool,
    bar: Option<ProgressBar>,
}

impl ProgressBars {
    fn new(hidden: bool) -> Self {
        ProgressBars { hidden, bar: None }
    }
}

impl Progress for ProgressBars {
    fn started(&mut self, operation: Operation, _address: u32, size: usize) {
        let bar = if self.hidden {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(size as u64)
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg:>7} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar.set_message(format!("{operation:?}"));
        self.bar = Some(bar);
    }

    fn advanced(&mut self, bytes: usize) {
        if let Some(bar) = &self.bar {
            bar.inc(bytes as u64);
        }
    }

    fn finished(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish();
        }
    }
}

fn init_logging(debug: bool) {
    let (level, config) = if debug {
        (LevelFilter::Debug, simplelog::Config::default())
    } else {
        // Confirmation lines are printed bare.
        let config = ConfigBuilder::new()
            .set_max_level(LevelFilter::Off)
            .set_time_level(LevelFilter::Off)
            .set_target_level(LevelFilter::Off)
            .set_thread_level(LevelFilter::Off)
            .set_location_level(LevelFilter::Off)
            .set_level_padding(LevelPadding::Off)
            .build();
        (LevelFilter::Info, config)
    };

    let _ = TermLogger::init(level, config, TerminalMode::Mixed, ColorChoice::Auto);
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.debug {
                eprintln!("error: {e:?}");
            } else {
                eprintln!("error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let open = || SerialLink::open(&cli.port, cli.baudrate);
    let mut progress = ProgressBars::new(cli.debug);

    match &cli.command {
        Commands::Reset => {
            Session::open_disconnected(open()?)?.reset()?;
        }
        Commands::Ping => {
            Session::open_connected(open()?)?;
        }
        Commands::FlashErase { address, size } => {
            Flashing::open(open()?)?.erase(*address, *size)?;
        }
        Commands::FlashRead {
            address,
            size,
            outfile,
        } => {
            let range = Region::new("flash", *address, *size);
            let image = Flashing::open(open()?)?.read_ranges(&[range], &mut progress)?;
            image.write_file(outfile)?;
        }
        Commands::FlashReadAll { outfile } => {
            let image = Flashing::open(open()?)?.read_ranges(&FLASH_RANGES, &mut progress)?;
            image.write_file(outfile)?;
        }
        Commands::FlashWrite {
            erase,
            verify,
            binfile,
        } => {
            let image = Image::from_file(binfile)?;
            let mut flashing = Flashing::open(open()?)?;

            let path = std::path::absolute(binfile).unwrap_or_else(|_| binfile.clone());
            log::info!("Writing {} to flash.", path.display());
            log::debug!("{} bytes in {} segments", image.len(), image.segments().len());

            let options = WriteOptions {
                erase: *erase,
                verify: *verify,
            };
            flashing.write_image(&image, options, &mut progress)?;
        }
        Commands::FlashEraseChip => {
            Session::erase_chip(open()?)?;
        }
        Commands::ConfigurationPrint => {
            println!("{}", Flashing::open(open()?)?.configuration()?);
        }
        Commands::DeviceIdPrint => {
            println!("{}", Flashing::open(open()?)?.device_id()?);
        }
        Commands::UdidPrint => {
            println!("{}", Flashing::open(open()?)?.unique_id()?);
        }
        Commands::DeviceStatusPrint => {
            println!("{}", Session::open_programmer(open()?)?.device_status()?);
        }
        Commands::ProgrammerPing => {
            Session::open_programmer(open()?)?;
        }
        Commands::GenerateRamappUploadInstructions {
            elffile,
            outfile,
            objdump,
        } => {
            ramapp::generate(elffile, objdump, outfile)?;
        }
    }

    Ok(())
}
