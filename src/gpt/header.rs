//! GPT-header object and helper functions.
//!
//! Layout and CRC rules mirror §3's on-disk description bit-for-bit: an
//! 8-byte ASCII magic, a 92-byte fixed body (fields below), then zero
//! padding out to `header_size_le`. The CRC32 is always computed with the
//! CRC field itself zeroed.

use crc::Crc;
use std::fmt;
use std::io::{Error, ErrorKind, Read, Result, Seek, SeekFrom, Write};

use simple_bytes::{BytesArray, BytesRead, BytesSeek, BytesWrite};

use crate::disk::{LogicalBlockSize, MAX_PROBE_SECTOR_SIZE};
use crate::logging::*;

/// Minimum legal header size in bytes (§3).
pub const MIN_HEADER_SIZE: u32 = 0x5C;
/// On-disk size of one partition entry (§3, §4.A write validation).
pub const ENTRY_SIZE: u32 = 128;
/// Entry slots reserved regardless of how many are populated (§3 invariant).
pub const MIN_NUM_PARTS: u32 = 128;

const HEADER_BODY_LEN: usize = 92;

#[non_exhaustive]
#[derive(Debug, Clone)]
/// Errors returned when building or decoding a header.
pub enum HeaderError {
    /// `HeaderBuilder::build` was called without a backup LBA.
    MissingBackupLba,
    /// Not enough room between `first_usable` and `backup_lba` for the
    /// reserved entry-table span.
    BackupLbaTooEarly,
    /// The on-disk magic didn't read `"EFI PART"`.
    BadMagic,
    /// `header_size_le` was outside `[MIN_HEADER_SIZE, sector_size]`.
    BadHeaderSize(u32),
    /// Header CRC32 didn't match the stored value.
    HeaderCrcMismatch { expected: u32, computed: u32 },
    /// Entry-table CRC32 didn't match the stored value.
    EntryCrcMismatch { expected: u32, computed: u32 },
    /// No sector size up to 16 MiB produced a valid header.
    SectorProbeExhausted,
}

impl std::error::Error for HeaderError {}

impl fmt::Display for HeaderError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use HeaderError::*;
        match self {
            MissingBackupLba => write!(fmt, "HeaderBuilder expects backup_lba to be set"),
            BackupLbaTooEarly => write!(
                fmt,
                "HeaderBuilder: not enough space between first_lba and backup_lba"
            ),
            BadMagic => write!(fmt, "invalid GPT signature"),
            BadHeaderSize(n) => write!(fmt, "invalid header size: {n}"),
            HeaderCrcMismatch { expected, computed } => write!(
                fmt,
                "header CRC32 mismatch: on-disk {expected:#x}, computed {computed:#x}"
            ),
            EntryCrcMismatch { expected, computed } => write!(
                fmt,
                "entry table CRC32 mismatch: on-disk {expected:#x}, computed {computed:#x}"
            ),
            SectorProbeExhausted => write!(fmt, "no sector size up to 16MiB yielded a valid header"),
        }
    }
}

/// Which copy of the table a caller expects to find.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Expectation {
    Any,
    Primary,
    Backup,
}

/// Header describing a GPT disk (host byte order, as held in memory).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Header {
    /// GPT header magic signature, hardcoded to "EFI PART".
    pub signature: String,
    /// (major, minor)
    pub revision: (u16, u16),
    /// Header size in bytes, little-endian on disk.
    pub header_size_le: u32,
    /// CRC32 of the header with the crc32 field zeroed.
    pub crc32: u32,
    /// Must be 0.
    pub reserved: u32,
    /// Self LBA: 1 for the primary header, last device LBA for the backup.
    pub current_lba: u64,
    /// Alternate LBA: points at the other copy.
    pub backup_lba: u64,
    /// First usable LBA for partitions.
    pub first_usable: u64,
    /// Last usable LBA for partitions.
    pub last_usable: u64,
    /// UUID of the disk.
    pub disk_guid: uuid::Uuid,
    /// Starting LBA of the partition entry array.
    pub part_start: u64,
    /// Number of partition entry slots.
    pub num_parts: u32,
    /// Size of one partition entry, usually 128.
    pub part_size: u32,
    /// CRC32 of the partition entry array.
    pub crc32_parts: u32,
}

impl Header {
    /// Write the primary header. Must start before the backup one.
    pub fn write_primary<D: Read + Write + Seek>(
        &self,
        device: &mut D,
        lb_size: LogicalBlockSize,
    ) -> Result<usize> {
        if self.current_lba >= self.backup_lba {
            return Err(Error::new(
                ErrorKind::Other,
                "primary header does not start before backup one",
            ));
        }
        self.file_write_header(device, self.current_lba, lb_size)
    }

    /// Write the backup header. Must start after the primary one.
    pub fn write_backup<D: Read + Write + Seek>(
        &self,
        device: &mut D,
        lb_size: LogicalBlockSize,
    ) -> Result<usize> {
        if self.current_lba <= self.backup_lba {
            return Err(Error::new(
                ErrorKind::Other,
                "backup header does not start after primary one",
            ));
        }
        self.file_write_header(device, self.current_lba, lb_size)
    }

    /// Block-differential write of a single logical block at `lba`: reads
    /// the existing sector and skips the write entirely if the encoded
    /// header already matches (§4.A: "block-differential" write step).
    fn file_write_header<D: Read + Write + Seek>(
        &self,
        device: &mut D,
        lba: u64,
        lb_size: LogicalBlockSize,
    ) -> Result<usize> {
        let parts_checksum = self.stored_entry_crc();
        let header_bytes = self.as_bytes(None, Some(parts_checksum));
        let checksum = calculate_crc32(&header_bytes);
        let final_bytes = self.as_bytes(Some(checksum), Some(parts_checksum));

        let mut block = vec![0u8; lb_size.as_usize()];
        block[..final_bytes.len()].copy_from_slice(&final_bytes);

        let start = lba
            .checked_mul(lb_size.as_u64())
            .ok_or_else(|| Error::new(ErrorKind::Other, "header overflow - offset"))?;

        let mut existing = vec![0u8; lb_size.as_usize()];
        device.seek(SeekFrom::Start(start))?;
        if device.read_exact(&mut existing).is_ok() && existing == block {
            trace!("header sector at lba {} unchanged, skipping write", lba);
            return Ok(0);
        }

        device.seek(SeekFrom::Start(start))?;
        let len = device.write(&block)?;
        trace!("wrote {} header bytes at lba {}", len, lba);
        Ok(len)
    }

    /// Entry CRC32 this header currently claims (used while assembling a
    /// header for output; callers that need the *actual* table CRC should
    /// compute it from the live entry bytes via [`partentry_checksum`]).
    fn stored_entry_crc(&self) -> u32 {
        self.crc32_parts
    }

    fn as_bytes(&self, header_checksum: Option<u32>, partitions_checksum: Option<u32>) -> Vec<u8> {
        let mut bytes = BytesArray::from([0u8; HEADER_BODY_LEN]);
        let disk_guid_fields = self.disk_guid.as_fields();

        BytesWrite::write(&mut bytes, self.signature.as_bytes());
        bytes.write_le_u16(self.revision.1);
        bytes.write_le_u16(self.revision.0);
        bytes.write_le_u32(self.header_size_le);
        bytes.write_le_u32(header_checksum.unwrap_or_default());
        bytes.write_le_u32(0);
        bytes.write_le_u64(self.current_lba);
        bytes.write_le_u64(self.backup_lba);
        bytes.write_le_u64(self.first_usable);
        bytes.write_le_u64(self.last_usable);
        bytes.write_le_u32(disk_guid_fields.0);
        bytes.write_le_u16(disk_guid_fields.1);
        bytes.write_le_u16(disk_guid_fields.2);
        BytesWrite::write(&mut bytes, disk_guid_fields.3);
        bytes.write_le_u64(self.part_start);
        bytes.write_le_u32(self.num_parts);
        bytes.write_le_u32(self.part_size);
        bytes.write_le_u32(partitions_checksum.unwrap_or_default());

        let mut out = bytes.into_array().to_vec();
        out.resize(self.header_size_le.max(HEADER_BODY_LEN as u32) as usize, 0);
        out
    }

    /// Tolerant comparison allowing a primary header to equal its backup
    /// (§4.A `compare`). Ignores `current_lba`, `backup_lba`, both CRC
    /// fields, and the entry-table's absolute start LBA (only its offset
    /// from the nearest anchor -- header LBA for primary, last usable +1
    /// for backup -- is required to match). Tolerates a backup whose
    /// `backup_lba` points at itself (S6).
    pub fn compare_tolerant(&self, other: &Header) -> bool {
        if self.signature != other.signature
            || self.revision != other.revision
            || self.header_size_le != other.header_size_le
            || self.reserved != other.reserved
            || self.first_usable != other.first_usable
            || self.last_usable != other.last_usable
            || self.disk_guid != other.disk_guid
            || self.num_parts != other.num_parts
            || self.part_size != other.part_size
        {
            return false;
        }
        let self_anchor = if self.current_lba <= self.first_usable {
            self.current_lba
        } else {
            self.last_usable
        };
        let other_anchor = if other.current_lba <= other.first_usable {
            other.current_lba
        } else {
            other.last_usable
        };
        self.part_start.wrapping_sub(self_anchor) == other.part_start.wrapping_sub(other_anchor)
    }
}

/// Parses a uuid with first 3 fields little-endian (GPT on-disk mixed-endian
/// convention), the rest (clock seq + node) verbatim.
pub fn parse_uuid<R: BytesRead>(rdr: &mut R) -> Result<uuid::Uuid> {
    if rdr.remaining().len() < 16 {
        return Err(Error::new(ErrorKind::UnexpectedEof, "uuid needs 16 bytes"));
    }
    let d1 = rdr.read_le_u32();
    let d2 = rdr.read_le_u16();
    let d3 = rdr.read_le_u16();
    let d4: [u8; 8] = rdr.read(8).try_into().unwrap();
    Ok(uuid::Uuid::from_fields(d1, d2, d3, &d4))
}

/// Writes a uuid with the same mixed-endian convention as [`parse_uuid`].
pub fn write_uuid<W: BytesWrite>(w: &mut W, u: &uuid::Uuid) {
    let f = u.as_fields();
    w.write_le_u32(f.0);
    w.write_le_u16(f.1);
    w.write_le_u16(f.2);
    BytesWrite::write(w, f.3);
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Disk:\t\t{}\nCRC32:\t\t{:#x}\nTable CRC:\t{:#x}",
            self.disk_guid, self.crc32, self.crc32_parts
        )
    }
}

/// Reads one header candidate (primary or backup) honoring `expectation`.
/// Probes sector size by doubling from 512 up to 16MiB when `sector_size`
/// is `None` (§4.A).
pub fn read(
    device: &mut (impl Read + Seek),
    expectation: Expectation,
    sector_size: Option<LogicalBlockSize>,
) -> Result<(Header, LogicalBlockSize)> {
    let try_sizes: Vec<LogicalBlockSize> = match sector_size {
        Some(s) => vec![s],
        None => {
            let mut sizes = Vec::new();
            let mut s = 512u64;
            while s <= MAX_PROBE_SECTOR_SIZE {
                sizes.push(LogicalBlockSize::try_from(s).expect("power of two in range"));
                s *= 2;
            }
            sizes
        }
    };

    let mut last_err = Error::new(ErrorKind::Other, "no sector size attempted");
    for lb in try_sizes {
        match try_read_at_size(device, expectation, lb) {
            Ok(h) => return Ok((h, lb)),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

fn try_read_at_size(
    device: &mut (impl Read + Seek),
    expectation: Expectation,
    lb: LogicalBlockSize,
) -> Result<Header> {
    let primary_err = if expectation != Expectation::Backup {
        match read_primary_header(device, lb) {
            Ok(h) => return Ok(h),
            Err(e) => Some(e),
        }
    } else {
        None
    };

    if expectation != Expectation::Primary {
        match read_backup_header(device, lb) {
            Ok(h) => return Ok(h),
            Err(e) => return Err(e),
        }
    }

    Err(primary_err.unwrap_or_else(|| Error::new(ErrorKind::Other, "no table read attempted")))
}

pub(crate) fn read_primary_header<D: Read + Seek>(
    device: &mut D,
    sector_size: LogicalBlockSize,
) -> Result<Header> {
    let cur = device.seek(SeekFrom::Current(0)).unwrap_or(0);
    let offset = sector_size.as_u64();
    let res = file_read_header(device, offset, sector_size);
    let _ = device.seek(SeekFrom::Start(cur));
    res
}

pub(crate) fn read_backup_header<D: Read + Seek>(
    device: &mut D,
    sector_size: LogicalBlockSize,
) -> Result<Header> {
    let cur = device.seek(SeekFrom::Current(0)).unwrap_or(0);
    let h2sect = find_backup_lba(device, sector_size)?;
    let offset = h2sect
        .checked_mul(sector_size.as_u64())
        .ok_or_else(|| Error::new(ErrorKind::Other, "backup header overflow - offset"))?;
    let res = file_read_header(device, offset, sector_size);
    let _ = device.seek(SeekFrom::Start(cur));
    res
}

pub(crate) fn file_read_header<D: Read + Seek>(
    device: &mut D,
    offset: u64,
    sector_size: LogicalBlockSize,
) -> Result<Header> {
    device.seek(SeekFrom::Start(offset))?;

    let mut bytes = BytesArray::from([0u8; HEADER_BODY_LEN]);
    device.read_exact(bytes.as_mut())?;

    let sigstr = String::from_utf8_lossy(BytesRead::read(&mut bytes, 8)).into_owned();
    if sigstr != "EFI PART" {
        return Err(Error::new(ErrorKind::Other, "invalid GPT signature"));
    }

    let h = Header {
        signature: sigstr,
        revision: {
            let minor = bytes.read_le_u16();
            let major = bytes.read_le_u16();
            (major, minor)
        },
        header_size_le: bytes.read_le_u32(),
        crc32: bytes.read_le_u32(),
        reserved: bytes.read_le_u32(),
        current_lba: bytes.read_le_u64(),
        backup_lba: bytes.read_le_u64(),
        first_usable: bytes.read_le_u64(),
        last_usable: bytes.read_le_u64(),
        disk_guid: parse_uuid(&mut bytes)?,
        part_start: bytes.read_le_u64(),
        num_parts: bytes.read_le_u32(),
        part_size: bytes.read_le_u32(),
        crc32_parts: bytes.read_le_u32(),
    };

    if h.header_size_le < MIN_HEADER_SIZE || (h.header_size_le as u64) > sector_size.as_u64() {
        return Err(Error::new(ErrorKind::Other, "invalid header size"));
    }

    BytesSeek::seek(&mut bytes, 16);
    bytes.write_u32(0);
    let c = calculate_crc32(bytes.as_slice());
    if c == h.crc32 {
        Ok(h)
    } else {
        Err(Error::new(ErrorKind::Other, "invalid header CRC32"))
    }
}

pub(crate) fn find_backup_lba<D: Read + Seek>(
    f: &mut D,
    sector_size: LogicalBlockSize,
) -> Result<u64> {
    let lb_size = sector_size.as_u64();
    let old_pos = f.seek(SeekFrom::Current(0))?;
    let len = f.seek(SeekFrom::End(0))?;
    f.seek(SeekFrom::Start(old_pos))?;
    if len < lb_size * 3 {
        return Err(Error::new(
            ErrorKind::Other,
            "disk image too small for backup header",
        ));
    }
    let bak_offset = len.saturating_sub(lb_size);
    Ok(bak_offset / lb_size)
}

const CRC_32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// CRC32 (ISO-HDLC) over an arbitrary byte slice, used for both the header
/// and the entry-table checksums.
pub fn calculate_crc32(b: &[u8]) -> u32 {
    let mut digest = CRC_32.digest();
    digest.update(b);
    digest.finalize()
}

/// Computes the CRC32 over exactly `num_parts * part_size` bytes starting
/// at `part_start` (§3 invariant: "entry CRC32 is over exactly
/// `entry-count x entry-size` bytes").
pub fn partentry_checksum<D: Read + Seek>(
    device: &mut D,
    hdr: &Header,
    lb_size: LogicalBlockSize,
) -> Result<u32> {
    let start = hdr
        .part_start
        .checked_mul(lb_size.as_u64())
        .ok_or_else(|| Error::new(ErrorKind::Other, "header overflow - partition table start"))?;
    device.seek(SeekFrom::Start(start))?;

    let pt_len = u64::from(hdr.num_parts)
        .checked_mul(hdr.part_size.into())
        .ok_or_else(|| Error::new(ErrorKind::Other, "partition table size overflow"))?;
    let mut buf = vec![0u8; pt_len as usize];
    device.read_exact(&mut buf)?;
    Ok(calculate_crc32(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpt::builder::HeaderBuilder;
    use std::io::Cursor;

    fn cursor_with_headers(primary: &Header, backup: &Header, lb: LogicalBlockSize) -> Cursor<Vec<u8>> {
        let total_lbas = backup.current_lba + 1;
        let mut buf = vec![0u8; (total_lbas * lb.as_u64()) as usize];
        let mut cur = Cursor::new(buf.clone());
        primary.write_primary(&mut cur, lb).unwrap();
        backup.write_backup(&mut cur, lb).unwrap();
        buf = cur.into_inner();
        Cursor::new(buf)
    }

    #[test]
    fn round_trip_primary_and_backup() {
        let lb = LogicalBlockSize::LB512;
        let primary = HeaderBuilder::new()
            .disk_guid("1B6A2BFA-E92B-184C-A8A7-ED0610D54821".parse().unwrap())
            .backup_lba(199)
            .build(lb)
            .unwrap();
        let backup = HeaderBuilder::new()
            .disk_guid("1B6A2BFA-E92B-184C-A8A7-ED0610D54821".parse().unwrap())
            .backup_lba(199)
            .primary(false)
            .build(lb)
            .unwrap();

        let mut disk = cursor_with_headers(&primary, &backup, lb);
        let read_primary = read_primary_header(&mut disk, lb).unwrap();
        let read_backup = read_backup_header(&mut disk, lb).unwrap();

        assert_eq!(read_primary.disk_guid, primary.disk_guid);
        assert_eq!(read_backup.disk_guid, backup.disk_guid);
        assert!(read_primary.compare_tolerant(&read_backup));
    }

    #[test]
    fn compare_tolerant_allows_self_pointing_alternate_lba() {
        let lb = LogicalBlockSize::LB512;
        let mut backup = HeaderBuilder::new()
            .disk_guid("1B6A2BFA-E92B-184C-A8A7-ED0610D54821".parse().unwrap())
            .backup_lba(199)
            .primary(false)
            .build(lb)
            .unwrap();
        let primary = HeaderBuilder::new()
            .disk_guid("1B6A2BFA-E92B-184C-A8A7-ED0610D54821".parse().unwrap())
            .backup_lba(199)
            .build(lb)
            .unwrap();

        // S6: backup's alternate-LBA quirk-points at itself.
        backup.backup_lba = backup.current_lba;
        assert!(primary.compare_tolerant(&backup));
    }

    #[test]
    fn header_crc_is_over_header_size_bytes_with_crc_zeroed() {
        let lb = LogicalBlockSize::LB512;
        let h = HeaderBuilder::new()
            .disk_guid("1B6A2BFA-E92B-184C-A8A7-ED0610D54821".parse().unwrap())
            .backup_lba(199)
            .build(lb)
            .unwrap();
        let bytes_zeroed = h.as_bytes(None, Some(h.crc32_parts));
        let crc = calculate_crc32(&bytes_zeroed);
        let bytes_final = h.as_bytes(Some(crc), Some(h.crc32_parts));
        let mut rehashed = bytes_final.clone();
        rehashed[16..20].copy_from_slice(&[0, 0, 0, 0]);
        assert_eq!(calculate_crc32(&rehashed), crc);
    }
}
