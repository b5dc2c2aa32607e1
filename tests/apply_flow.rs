//! End-to-end exercises of the archive -> chunk -> differential-write
//! pipeline against hand-built, minimal archives (no real KDZ file
//! needed).

use std::fs::File;
use std::io::Write as _;

use dzflash::applicability::{test_archive, ApplyVerdict};
use dzflash::archive::Archive;
use dzflash::device::BlockDevice;
use dzflash::diffwrite::{trim_trailing_space, write_differential};
use dzflash::gpt::header::calculate_crc32;
use dzflash::hash::Md5Hasher;

const SECTOR: u64 = 512;
const MIN_ARCHIVE_LEN: u64 = 1024 * 1024;
const STREAM_OFFSET: u64 = 512;

fn cstr_field(out: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    out[..bytes.len()].copy_from_slice(bytes);
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// Builds a single-chunk archive on disk: outer container with one `.dz`
/// directory entry, an inner stream with a file header (chunk_count=1)
/// and one chunk header + compressed payload for `plaintext`.
fn build_archive(path: &std::path::Path, slice_name: &str, plaintext: &[u8], target_addr: u32, trim_count: u32) {
    let compressed = deflate(plaintext);
    let crc32 = calculate_crc32(plaintext);
    let mut md5 = Md5Hasher::new();
    md5.update(plaintext);
    let md5 = md5.finalize();

    let mut buf = vec![0u8; STREAM_OFFSET as usize];
    buf[0..8].copy_from_slice(b"KDZ_FILE");
    // one directory entry naming the inner stream
    let entry_off = 8usize;
    cstr_field(&mut buf[entry_off..entry_off + 256], "update.dz");
    buf[entry_off + 260..entry_off + 264].copy_from_slice(&(STREAM_OFFSET as u32).to_le_bytes());

    // file header (512 bytes) at STREAM_OFFSET
    let mut file_header = vec![0u8; 512];
    file_header[0..4].copy_from_slice(b"\x32\x96\x18\x74");
    file_header[4..8].copy_from_slice(&1u32.to_le_bytes());
    file_header[8..12].copy_from_slice(&0u32.to_le_bytes());
    file_header[12..16].copy_from_slice(&0u32.to_le_bytes()); // patch_level
    cstr_field(&mut file_header[16..48], "testdevice");
    cstr_field(&mut file_header[48..192], "1.0");
    file_header[192..196].copy_from_slice(&1u32.to_le_bytes());
    // chunk_count=1 so the header-MD5 (over every header but index 0)
    // accumulates nothing; MD5 of the empty input.
    let empty_md5 = Md5Hasher::new().finalize();
    file_header[196..212].copy_from_slice(&empty_md5);
    file_header[212..216].copy_from_slice(&0u32.to_le_bytes()); // flag_mmc
    file_header[336..340].copy_from_slice(&0u32.to_le_bytes()); // flag_ufs = eMMC

    // chunk header (512 bytes)
    let mut chunk_header = vec![0u8; 512];
    chunk_header[0..4].copy_from_slice(b"\x32\x96\x18\x74");
    cstr_field(&mut chunk_header[4..36], slice_name);
    cstr_field(&mut chunk_header[36..100], "chunk0000");
    chunk_header[100..104].copy_from_slice(&(plaintext.len() as u32).to_le_bytes());
    chunk_header[104..108].copy_from_slice(&(compressed.len() as u32).to_le_bytes());
    chunk_header[108..124].copy_from_slice(&md5);
    chunk_header[124..128].copy_from_slice(&target_addr.to_le_bytes());
    chunk_header[128..132].copy_from_slice(&trim_count.to_le_bytes());
    chunk_header[132..136].copy_from_slice(&0u32.to_le_bytes()); // device index
    chunk_header[136..140].copy_from_slice(&crc32.to_le_bytes());

    buf.extend_from_slice(&file_header);
    buf.extend_from_slice(&chunk_header);
    buf.extend_from_slice(&compressed);

    if (buf.len() as u64) < MIN_ARCHIVE_LEN {
        buf.resize(MIN_ARCHIVE_LEN as usize, 0);
    }

    let mut f = File::create(path).unwrap();
    f.write_all(&buf).unwrap();
}

/// Offset (within the archive file) of the first byte of the chunk's
/// compressed payload, matching `build_archive`'s layout.
fn payload_offset() -> u64 {
    STREAM_OFFSET + 512 + 512
}

/// S2/S3: applying a chunk with `target_addr=10, target_size=4096,
/// trim_count=8` over a zeroed device writes 8 sectors the first time and
/// zero sectors (all skipped) on reapply; the trailing TRIM range
/// `[4096, 4096)` is empty and a no-op both times.
#[test]
fn s2_s3_apply_then_reapply_matches_expected_write_counts() {
    let dir = tempfile::tempdir().unwrap();
    let archive_path = dir.path().join("firmware.kdz");
    let plaintext = vec![0xABu8; 4096];
    build_archive(&archive_path, "boot", &plaintext, 10, 8);

    let archive = Archive::open(&archive_path).unwrap();
    let device_path = dir.path().join("device.img");
    File::create(&device_path).unwrap().set_len(65536).unwrap();

    let mut unpacker = dzflash::chunk::ChunkUnpacker::open(&archive, 0, dzflash::disk::LogicalBlockSize::LB512).unwrap();
    let mut decompressed = Vec::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = unpacker.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        decompressed.extend_from_slice(&buf[..n]);
    }
    assert_eq!(unpacker.close(false).unwrap(), dzflash::chunk::Verdict::Verified);

    let slice_base = 10 * SECTOR;
    let current = std::fs::read(&device_path).unwrap();
    let target = File::options().read(true).write(true).open(&device_path).unwrap();

    let stats = write_differential(&target, &current, slice_base, &decompressed, dzflash::disk::LogicalBlockSize::LB512).unwrap();
    assert_eq!(stats.sectors_written, 8);
    assert_eq!(stats.sectors_skipped, 0);

    trim_trailing_space(&target, slice_base, 4096, 8, dzflash::disk::LogicalBlockSize::LB512).unwrap();

    // S3: reapply against the now-updated device contents.
    let current_after = std::fs::read(&device_path).unwrap();
    let stats_again = write_differential(&target, &current_after, slice_base, &decompressed, dzflash::disk::LogicalBlockSize::LB512).unwrap();
    assert_eq!(stats_again.sectors_written, 0);
    assert_eq!(stats_again.sectors_skipped, 8);

    trim_trailing_space(&target, slice_base, 4096, 8, dzflash::disk::LogicalBlockSize::LB512).unwrap();
}

/// S4 (required): corrupting one byte of a required slice's compressed
/// payload makes the whole archive `NotApplicable`.
#[test]
fn s4_required_chunk_corruption_is_not_applicable() {
    let dir = tempfile::tempdir().unwrap();
    let archive_path = dir.path().join("firmware.kdz");
    let plaintext = vec![0x11u8; 512];
    // "sec" carries REQUIRED in the match table.
    build_archive(&archive_path, "sec", &plaintext, 0, 0);

    let mut bytes = std::fs::read(&archive_path).unwrap();
    let idx = payload_offset() as usize + 2;
    bytes[idx] ^= 0xFF;
    std::fs::write(&archive_path, &bytes).unwrap();

    let archive = Archive::open(&archive_path).unwrap();
    let device_path = dir.path().join("device.img");
    File::create(&device_path).unwrap().set_len(65536).unwrap();
    let device = BlockDevice::open_read_only(&device_path).unwrap();

    let (verdict, _) = test_archive(&archive, &device).unwrap();
    assert_eq!(verdict, ApplyVerdict::NotApplicable);
}

/// S4 (advisory): the same corruption on an advisory-only slice drops the
/// verdict one level instead of failing outright.
#[test]
fn s4_advisory_chunk_corruption_drops_verdict_one_level() {
    let dir = tempfile::tempdir().unwrap();
    let archive_path = dir.path().join("firmware.kdz");
    let plaintext = vec![0x22u8; 512];
    // "tz" carries ADVISORY only in the match table.
    build_archive(&archive_path, "tz", &plaintext, 0, 0);

    let mut bytes = std::fs::read(&archive_path).unwrap();
    let idx = payload_offset() as usize + 2;
    bytes[idx] ^= 0xFF;
    std::fs::write(&archive_path, &bytes).unwrap();

    let archive = Archive::open(&archive_path).unwrap();
    let device_path = dir.path().join("device.img");
    File::create(&device_path).unwrap().set_len(65536).unwrap();
    let device = BlockDevice::open_read_only(&device_path).unwrap();

    let (verdict, _) = test_archive(&archive, &device).unwrap();
    assert_eq!(verdict, ApplyVerdict::Applicable);
}
