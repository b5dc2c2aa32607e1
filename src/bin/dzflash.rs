//! CLI front-end: wires the flag surface from the external-interfaces
//! design onto the library (§6).

use std::fs::File;
use std::io::Cursor;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgGroup, Parser};

use dzflash::applicability::{test_archive, ApplyVerdict, ChunkOutcome};
use dzflash::archive::Archive;
use dzflash::chunk::{ChunkUnpacker, Verdict};
use dzflash::device::{self, Bus, BlockDevice};
use dzflash::diffwrite::{trim_trailing_space, write_differential};
use dzflash::disk::LogicalBlockSize;
use dzflash::gpt::Expectation;
use dzflash::logging::*;
use dzflash::repair::{self, PackMode};
use dzflash::slices::{self, MatchMask};
use dzflash::{Error, Gpt};

/// Applicability testing and wear-aware flashing of a firmware archive.
#[derive(Parser, Debug)]
#[command(name = "dzflash", group(
    ArgGroup::new("mode").args(["test", "report", "apply_all", "bootloader"]).multiple(false)
))]
struct Cli {
    /// Test applicability (and simulate writes).
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Report per-chunk match state.
    #[arg(short = 'r', long = "report")]
    report: bool,

    /// Apply all safe slices (system + modem).
    #[arg(short = 'a', long = "apply-all")]
    apply_all: bool,

    /// Apply bootloader (returning to stock).
    #[arg(short = 'b', long = "bootloader")]
    bootloader: bool,

    /// Apply system.
    #[arg(short = 's', long = "system")]
    system: bool,

    /// Apply modem.
    #[arg(short = 'm', long = "modem")]
    modem: bool,

    /// Apply kernel/boot.
    #[arg(short = 'k', long = "kernel")]
    kernel: bool,

    /// Apply OP.
    #[arg(short = 'O', long = "op")]
    op: bool,

    /// More verbose.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Less verbose.
    #[arg(short = 'q', long = "quiet", action = clap::ArgAction::Count)]
    quiet: u8,

    /// Path to the firmware archive.
    archive: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(true) => ExitCode::from(0),
        Ok(false) => ExitCode::from(8),
        Err(e) => {
            eprintln!("dzflash: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

/// Returns `Ok(true)` on success, `Ok(false)` for a clean not-applicable
/// verdict (exit code 8), `Err` for every other failure.
fn run(cli: &Cli) -> Result<bool, Error> {
    let archive = Archive::open(&cli.archive)?;
    let bus = Bus::from_ufs_flag(archive.file_header.flag_ufs);
    debug!("resolved bus {:?} from ufs flag {:#x}", bus, archive.file_header.flag_ufs);

    let device_path = bus.device_path(0);
    let device = BlockDevice::open_read_only(&device_path)?;

    let (verdict, reports) = test_archive(&archive, &device)?;

    if cli.report || cli.verbose > 0 {
        for r in &reports {
            let state = match r.outcome {
                ChunkOutcome::Skipped => "skip",
                ChunkOutcome::Matched => "match",
                ChunkOutcome::Diverged => "diverge",
            };
            println!("{:<20} {}", r.slice_name, state);
        }
    }

    println!("{verdict:?}");

    if verdict == ApplyVerdict::NotApplicable {
        return Ok(false);
    }

    if cli.test || cli.report {
        return Ok(true);
    }

    if cli.bootloader {
        // kdzwriter's own bootloader path only proceeds on an exact,
        // unmodified match (verdict >= 2); anything less aborts up front.
        if verdict != ApplyVerdict::ApplicableAndUnmodified {
            eprintln!(
                "dzflash: bootloader write requires an exact, unmodified match; re-run with -t to see why"
            );
            return Ok(false);
        }
        apply_bootloader(&archive, bus, &device)?;
        return Ok(true);
    }

    if cli.apply_all || cli.system || cli.modem || cli.kernel || cli.op {
        // GPT geometry must be settled before any slice content is streamed
        // onto a possibly-resized OP/userdata boundary.
        if cli.op {
            apply_gpt(&archive, bus, &device)?;
        }

        let mut names: Vec<&str> = Vec::new();
        if cli.apply_all || cli.system {
            names.push("system");
        }
        if cli.apply_all || cli.modem {
            names.push("modem");
        }
        if cli.kernel {
            names.push("boot");
        }
        if cli.op {
            names.push("OP");
        }
        names.sort_unstable();
        names.dedup();

        apply_slices(&archive, &device, &names)?;
    }

    Ok(true)
}

/// Decompresses chunk `idx` in full, verifying it against its own CRC32/MD5
/// rather than the device (an apply must trust the archive, not re-derive
/// divergence from it).
fn decompress_chunk(archive: &Archive, idx: usize, sector_size: LogicalBlockSize) -> Result<Vec<u8>, Error> {
    let chunk = &archive.chunks[idx];
    let mut unpacker = ChunkUnpacker::open(archive, idx, sector_size)?;
    let mut decompressed = Vec::with_capacity(chunk.header.target_size as usize);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = unpacker.read(&mut buf)?;
        if n == 0 {
            break;
        }
        decompressed.extend_from_slice(&buf[..n]);
    }
    if unpacker.close(false)? != Verdict::Verified {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("chunk {idx} ({}) failed verification during apply", chunk.header.slice_name),
        )
        .into());
    }
    Ok(decompressed)
}

fn read_device_primary_gpt(device: &BlockDevice) -> Result<Gpt, Error> {
    let mut cursor = Cursor::new(device.as_slice().to_vec());
    let gpt = Gpt::read(&mut cursor, Expectation::Primary, Some(device.sector_size))?;
    Ok(gpt)
}

fn gpt_entry_first_lba(gpt: &Gpt, name: &str) -> Option<u64> {
    gpt.entries.iter().find(|e| e.name == name).map(|e| e.first_lba)
}

/// Streams one chunk through the differential writer at its per-slice
/// device node, offset relative to the slice's own first LBA rather than
/// the raw disk (§4's apply data flow).
fn apply_one_chunk(
    archive: &Archive,
    idx: usize,
    slice_first_lba: u64,
    sector_size: LogicalBlockSize,
) -> Result<(), Error> {
    let chunk = &archive.chunks[idx];
    let relative_lba = (chunk.header.target_addr as u64)
        .checked_sub(slice_first_lba)
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::Other,
                format!(
                    "chunk {idx} ({}) target address precedes its slice's first LBA",
                    chunk.header.slice_name
                ),
            )
        })?;
    let base = relative_lba * sector_size.as_u64();

    let decompressed = decompress_chunk(archive, idx, sector_size)?;

    let slice_device_path = device::slice_path(&chunk.header.slice_name);
    let current = BlockDevice::open_read_only(&slice_device_path)?;
    let target = BlockDevice::open_for_write(&slice_device_path, false)?;

    let stats = write_differential(&target, current.as_slice(), base, &decompressed, sector_size)?;
    debug!(
        "{}: wrote {} sector(s), skipped {}",
        chunk.header.slice_name, stats.sectors_written, stats.sectors_skipped
    );
    trim_trailing_space(
        &target,
        base,
        chunk.header.target_size as u64,
        chunk.header.trim_count as u64,
        sector_size,
    )?;
    Ok(())
}

/// Applies every chunk whose slice name is in `names`, resolving each
/// slice's first LBA from the raw device's current primary GPT.
fn apply_slices(archive: &Archive, device: &BlockDevice, names: &[&str]) -> Result<(), Error> {
    if names.is_empty() {
        return Ok(());
    }
    let device_gpt = read_device_primary_gpt(device)?;
    for (idx, chunk) in archive.chunks.iter().enumerate() {
        if !names.contains(&chunk.header.slice_name.as_str()) {
            continue;
        }
        let Some(first_lba) = gpt_entry_first_lba(&device_gpt, &chunk.header.slice_name) else {
            eprintln!(
                "dzflash: no GPT entry named {:?} on this device, skipping",
                chunk.header.slice_name
            );
            continue;
        };
        apply_one_chunk(archive, idx, first_lba, device.sector_size)?;
    }
    Ok(())
}

/// Repairs and writes the GPT from the archive's `PrimaryGPT` chunk,
/// rereading the partition table afterward (§4.F).
fn apply_gpt(archive: &Archive, bus: Bus, device: &BlockDevice) -> Result<(), Error> {
    let gpt_idx = archive
        .chunks
        .iter()
        .position(|c| c.header.slice_name == "PrimaryGPT")
        .ok_or_else(|| Error::from(std::io::Error::new(std::io::ErrorKind::Other, "archive has no PrimaryGPT chunk")))?;

    let decompressed = decompress_chunk(archive, gpt_idx, device.sector_size)?;
    let mut archive_cursor = Cursor::new(decompressed);
    let archive_gpt = Gpt::read(&mut archive_cursor, Expectation::Primary, Some(device.sector_size))?;
    let device_gpt = read_device_primary_gpt(device)?;

    let repaired = repair::repair(&archive_gpt, &device_gpt, PackMode::Forward, device.sector_size)?;

    let device_path = bus.device_path(0);
    let mut target: File = BlockDevice::open_for_write(&device_path, false)?;
    repaired.write(&mut target)?;
    if !device::reread_partition_table(&target) {
        eprintln!("dzflash: kernel did not pick up the new partition table; reboot before continuing");
    }
    Ok(())
}

/// Returning-to-stock bootloader write: the GPT plus every non-GPT slice
/// named in the match-mask table, mirroring kdzwriter's `BOOTLOADER` mode.
fn apply_bootloader(archive: &Archive, bus: Bus, device: &BlockDevice) -> Result<(), Error> {
    apply_gpt(archive, bus, device)?;

    let mut names: Vec<&str> = archive
        .chunks
        .iter()
        .filter_map(|c| {
            let name = c.header.slice_name.as_str();
            match slices::match_mask(name) {
                Some(mask) if !mask.contains(MatchMask::GPT) => Some(name),
                _ => None,
            }
        })
        .collect();
    names.sort_unstable();
    names.dedup();

    apply_slices(archive, device, &names)
}
