//! Applicability tester: decides whether an archive matches a device
//! closely enough to apply, without writing anything (§4.E).

use crate::archive::{Archive, ChunkDescriptor};
use crate::chunk::{ChunkUnpacker, Verdict as ChunkVerdict};
use crate::device::BlockDevice;
use crate::disk::LogicalBlockSize;
use crate::error::{Error, Result};
use crate::gpt::header::Expectation;
use crate::gpt::partition::entries_equal_exact;
use crate::gpt::Gpt;
use crate::logging::*;
use crate::slices::{self, MatchMask};

/// Overall applicability verdict (§4.E).
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub enum ApplyVerdict {
    NotApplicable,
    Applicable,
    ApplicableAndUnmodified,
}

/// Per-chunk outcome, useful for the `-r` report mode.
#[derive(Debug, Clone)]
pub struct ChunkReport {
    pub slice_name: String,
    pub outcome: ChunkOutcome,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChunkOutcome {
    Skipped,
    Matched,
    Diverged,
}

/// Walks every chunk in `archive` against `device`, applying the
/// match-mask table, and returns the overall verdict plus a per-chunk
/// report.
pub fn test_archive(
    archive: &Archive,
    device: &BlockDevice,
) -> Result<(ApplyVerdict, Vec<ChunkReport>)> {
    let mut verdict = ApplyVerdict::ApplicableAndUnmodified;
    let mut reports = Vec::with_capacity(archive.chunks.len());

    for (i, chunk) in archive.chunks.iter().enumerate() {
        let name = chunk.header.slice_name.as_str();
        let Some(mask) = slices::match_mask(name) else {
            reports.push(ChunkReport {
                slice_name: name.to_string(),
                outcome: ChunkOutcome::Skipped,
            });
            continue;
        };

        let outcome = if mask.contains(MatchMask::GPT) {
            test_gpt_chunk(archive, i, chunk, device.sector_size, device)?
        } else {
            test_ordinary_chunk(archive, i, chunk, device)?
        };

        reports.push(ChunkReport {
            slice_name: name.to_string(),
            outcome,
        });

        match outcome {
            ChunkOutcome::Matched => {}
            ChunkOutcome::Diverged => {
                if mask.contains(MatchMask::REQUIRED) {
                    return Ok((ApplyVerdict::NotApplicable, reports));
                }
                if mask.contains(MatchMask::ADVISORY) {
                    verdict = verdict.min(ApplyVerdict::Applicable);
                }
            }
            ChunkOutcome::Skipped => unreachable!("skipped chunks never reach the match branch"),
        }
    }

    Ok((verdict, reports))
}

/// An ordinary (non-GPT) chunk: streaming equality of the decompressed
/// chunk against the device byte range at `target_addr * sector_size`.
/// The unpacker's CRC/MD5 verification always runs regardless of whether
/// the comparison matched; a verification failure is treated as
/// divergence rather than a hard error, so a corrupt advisory chunk only
/// drops the verdict instead of aborting testing outright (S4).
fn test_ordinary_chunk(
    archive: &Archive,
    i: usize,
    chunk: &ChunkDescriptor,
    device: &BlockDevice,
) -> Result<ChunkOutcome> {
    let mut unpacker = ChunkUnpacker::open(archive, i, device.sector_size)?;
    let base = chunk.header.target_addr as u64 * device.sector_size.as_u64();

    let mut buf = vec![0u8; 64 * 1024];
    let mut pos = 0u64;
    let mut diverged = false;
    loop {
        let n = match unpacker.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                debug!(
                    "chunk {} ({}) failed to decompress, treating as divergence: {e}",
                    i, chunk.header.slice_name
                );
                return Ok(ChunkOutcome::Diverged);
            }
        };
        if n == 0 {
            break;
        }
        let window = device.read_at(base + pos, n)?;
        if window != &buf[..n] {
            diverged = true;
        }
        pos += n as u64;
    }

    let verdict = unpacker.close(false)?;
    if verdict != ChunkVerdict::Verified {
        debug!(
            "chunk {} ({}) failed CRC/MD5 verification, treating as divergence",
            i, chunk.header.slice_name
        );
        diverged = true;
    }

    Ok(if diverged {
        ChunkOutcome::Diverged
    } else {
        ChunkOutcome::Matched
    })
}

/// The GPT special case (§4.E steps 1-4).
fn test_gpt_chunk(
    archive: &Archive,
    i: usize,
    chunk: &ChunkDescriptor,
    sector_size: LogicalBlockSize,
    device: &BlockDevice,
) -> Result<ChunkOutcome> {
    let mut unpacker = ChunkUnpacker::open(archive, i, sector_size)?;
    let mut decompressed = Vec::with_capacity(chunk.header.target_size as usize);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match unpacker.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                debug!("GPT chunk failed to decompress, treating as divergence: {e}");
                return Ok(ChunkOutcome::Diverged);
            }
        };
        if n == 0 {
            break;
        }
        decompressed.extend_from_slice(&buf[..n]);
    }
    if unpacker.close(false)? != ChunkVerdict::Verified {
        debug!("GPT chunk failed CRC/MD5 verification, treating as divergence");
        return Ok(ChunkOutcome::Diverged);
    }

    let is_primary = chunk.header.slice_name == "PrimaryGPT";
    let window = if is_primary {
        &decompressed[..sector_size.as_usize().min(decompressed.len())]
    } else {
        let start = decompressed.len().saturating_sub(sector_size.as_usize());
        &decompressed[start..]
    };
    let mut archive_cursor = std::io::Cursor::new(window.to_vec());
    let archive_gpt = Gpt::read(
        &mut archive_cursor,
        if is_primary {
            Expectation::Primary
        } else {
            Expectation::Backup
        },
        Some(sector_size),
    )?;

    let device_primary = Gpt::read(
        &mut std::io::Cursor::new(device.as_slice().to_vec()),
        Expectation::Primary,
        Some(sector_size),
    )?;
    let device_backup = Gpt::read(
        &mut std::io::Cursor::new(device.as_slice().to_vec()),
        Expectation::Backup,
        Some(sector_size),
    )?;
    if !device_primary.compare_tolerant(&device_backup) {
        return Err(Error::geometry("device primary and backup GPT disagree"));
    }

    let device_gpt = if is_primary { &device_primary } else { &device_backup };
    if !archive_gpt.header.compare_tolerant(&device_gpt.header) {
        return Ok(ChunkOutcome::Diverged);
    }

    Ok(compare_entries(&archive_gpt, device_gpt, chunk.header.device))
}

/// Entry walk with the ignore list and the device-index-6 unique-ID
/// quirk (§4.E step 4, §9 named-policy open question).
fn compare_entries(archive_gpt: &Gpt, device_gpt: &Gpt, chunk_device: u32) -> ChunkOutcome {
    let mut diverged = false;
    let tolerate_unique_id_mismatch = unique_id_mismatch_is_tolerated(chunk_device);

    for (a, d) in archive_gpt.entries.iter().zip(device_gpt.entries.iter()) {
        if slices::is_ignored_for_compare(&a.name) || slices::is_ignored_for_compare(&d.name) {
            continue;
        }
        if !entries_equal_exact(a, d) {
            return ChunkOutcome::Diverged;
        }
        if a.unique_guid != d.unique_guid && !tolerate_unique_id_mismatch {
            diverged = true;
        }
    }

    if diverged {
        ChunkOutcome::Diverged
    } else {
        ChunkOutcome::Matched
    }
}

/// Applies the device-index-6 unique-ID exemption as a named check rather
/// than inlining the magic number at each call site.
pub fn unique_id_mismatch_is_tolerated(device_index: u32) -> bool {
    device_index == slices::UNIQUE_ID_QUIRK_DEVICE_INDEX as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmodified_implies_applicable() {
        assert!(ApplyVerdict::ApplicableAndUnmodified > ApplyVerdict::Applicable);
        assert!(ApplyVerdict::Applicable > ApplyVerdict::NotApplicable);
    }

    #[test]
    fn device_index_six_is_the_named_quirk() {
        assert!(unique_id_mismatch_is_tolerated(6));
        assert!(!unique_id_mismatch_is_tolerated(0));
    }
}
