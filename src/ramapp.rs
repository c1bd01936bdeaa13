//! RAM application upload instructions.
//!
//! The programmer copies the RAM application into PIC RAM by executing
//! microMIPS instructions over ICSP. This module turns a disassembled RAM
//! application into the C initializer list of those instructions.
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};

pub const DEFAULT_OBJDUMP: &str = "mips-unknown-elf-objdump";

/// A halfword filling gaps between instructions.
const PADDING: &str = "0000";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Instruction {
    address: u32,
    size: u32,
    /// Hex digits, high halfword first.
    data: String,
}

/// Disassemble `elf` with `objdump -d`.
pub fn disassemble(elf: &Path, objdump: &str) -> Result<String> {
    let output = Command::new(objdump)
        .arg("-d")
        .arg(elf)
        .output()
        .with_context(|| format!("failed to run {objdump}"))?;

    if !output.status.success() {
        anyhow::bail!(
            "{} failed with {}: {}",
            objdump,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8(output.stdout)?)
}

/// Write the upload instructions of `elf` to `out`.
pub fn generate(elf: &Path, objdump: &str, out: &Path) -> Result<()> {
    let disassembly = disassemble(elf, objdump)?;
    let source = upload_instructions(&disassembly);

    std::fs::write(out, source).with_context(|| format!("failed to write {}", out.display()))?;
    log::info!("Wrote {}.", out.display());
    Ok(())
}

/// C source uploading the disassembled application.
pub fn upload_instructions(disassembly: &str) -> String {
    let instructions = parse(disassembly);
    log::debug!("found {} instructions", instructions.len());

    let mut words = Vec::new();
    for (high, low) in pair(&instructions) {
        words.push(format!("0x{high}41a6"));
        words.push(format!("0x{low}50c6"));
        words.push("0x0000f8c4".to_string());
        words.push("0x00043084".to_string());
    }

    format!(
        "\
/**
 * This file was generated by pictools.
 */

/* Destination address in RAM to copy to. */
0xa00041a4,
0x00005084,

/* Upload the application. */
{},

/* Start the uploaded application. */
0xa00041b9,
0x00015339,
0x0f3c0019
",
        words.join(",\n")
    )
}

/// `<hex address>:\t<hex halfwords>\t...`
fn parse_line(line: &str) -> Option<(u32, String)> {
    let line = line.trim_start();
    let colon = line.find(":\t")?;
    let address = &line[..colon];
    if address.is_empty() || !address.bytes().all(|c| matches!(c, b'0'..=b'9' | b'a'..=b'f')) {
        return None;
    }
    let address = u32::from_str_radix(address, 16).ok()?;

    let rest = &line[colon + 2..];
    let data: String = rest
        .split('\t')
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| *c != ' ')
        .collect();
    if data.is_empty() || !data.bytes().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    Some((address, data))
}

/// Instructions in address order, with gaps filled by padding halfwords.
fn parse(disassembly: &str) -> Vec<Instruction> {
    let mut instructions: Vec<Instruction> = Vec::new();

    for (address, mut data) in disassembly.lines().filter_map(parse_line) {
        let size = (data.len() / 2) as u32;

        // 32-bit instructions are listed low halfword first.
        if data.len() == 8 {
            data = format!("{}{}", &data[4..], &data[..4]);
        }

        if let Some(previous) = instructions.last() {
            let end = previous.address + previous.size;
            let gap = address.saturating_sub(end);
            for i in 0..gap / 2 {
                instructions.push(Instruction {
                    address: end + 2 * i,
                    size: 2,
                    data: PADDING.to_string(),
                });
            }
        }

        instructions.push(Instruction {
            address,
            size,
            data,
        });
    }

    instructions
}

/// Group the halfword stream into (high, low) words.
fn pair(instructions: &[Instruction]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut leftover: Option<String> = None;

    for instruction in instructions {
        let data = &instruction.data;

        if instruction.size == 4 {
            match leftover.take() {
                Some(low) => {
                    pairs.push((data[4..].to_string(), low));
                    leftover = Some(data[..4].to_string());
                }
                None => pairs.push((data[..4].to_string(), data[4..].to_string())),
            }
        } else {
            match leftover.take() {
                Some(low) => pairs.push((data.clone(), low)),
                None => leftover = Some(data.clone()),
            }
        }
    }

    if let Some(low) = leftover {
        pairs.push((PADDING.to_string(), low));
    }

    pairs
}
