//! GPT codec: read / write / compare a GUID Partition Table.
//!
//! A [`Gpt`] is the in-memory form described by the data model: one
//! logical header (disk UUID, usable range, entry-table geometry) plus a
//! flat, UTF-8-decoded entry array. Reading produces a `Gpt` from either
//! copy on a device; writing always regenerates both copies from it,
//! backup first, per the UEFI ordering guarantee.

pub mod builder;
pub mod header;
pub mod partition;

pub use builder::HeaderBuilder;
pub use header::{Expectation, Header, HeaderError};
pub use partition::Entry;

use std::io::{Read, Result, Seek, Write};

use crate::disk::LogicalBlockSize;
use crate::logging::*;

/// An in-memory GPT: the logical header plus its entry array.
#[derive(Debug, Clone)]
pub struct Gpt {
    /// The logical header (host byte order).
    pub header: Header,
    /// The full entry array, including empty slots.
    pub entries: Vec<Entry>,
    /// Sector size this table was read with / will be written at.
    pub lb_size: LogicalBlockSize,
}

impl Gpt {
    /// Reads one table copy (per `expectation`) plus its entry array.
    pub fn read(
        device: &mut (impl Read + Seek),
        expectation: Expectation,
        sector_size: Option<LogicalBlockSize>,
    ) -> Result<Self> {
        let (header, lb_size) = header::read(device, expectation, sector_size)?;
        let entries = partition::read_entries(device, &header, lb_size)?;
        Ok(Self {
            header,
            entries,
            lb_size,
        })
    }

    /// Writes both copies to `device`. Backup first, primary second (§4.A,
    /// §5 ordering guarantee): a crash between the two writes always
    /// leaves one side fully valid.
    ///
    /// Validates header size, entry size, and that the entry array fits
    /// in the reserved span before writing anything.
    pub fn write(&self, device: &mut (impl Read + Write + Seek)) -> Result<()> {
        self.validate_for_write()?;

        let is_primary = self.header.current_lba < self.header.backup_lba;
        let (primary_header, backup_header) = if is_primary {
            let backup = self.backup_counterpart();
            (self.header.clone(), backup)
        } else {
            let primary = self.primary_counterpart();
            (primary, self.header.clone())
        };

        debug!("writing backup GPT at lba {}", backup_header.current_lba);
        let backup_entries = self.entries_for(&backup_header);
        partition::write_entries(device, &backup_entries, &backup_header, self.lb_size)?;
        let backup_crc = partition::encode_entries(&backup_entries, &backup_header).1;
        let mut backup_header = backup_header;
        backup_header.crc32_parts = backup_crc;
        backup_header.write_backup(device, self.lb_size)?;

        debug!("writing primary GPT at lba {}", primary_header.current_lba);
        let primary_entries = self.entries_for(&primary_header);
        partition::write_entries(device, &primary_entries, &primary_header, self.lb_size)?;
        let primary_crc = partition::encode_entries(&primary_entries, &primary_header).1;
        let mut primary_header = primary_header;
        primary_header.crc32_parts = primary_crc;
        primary_header.write_primary(device, self.lb_size)?;

        Ok(())
    }

    fn entries_for(&self, _header: &Header) -> Vec<Entry> {
        self.entries.clone()
    }

    fn backup_counterpart(&self) -> Header {
        HeaderBuilder::from_header(&self.header)
            .primary(false)
            .build(self.lb_size)
            .expect("header derived from a valid primary is always buildable")
    }

    fn primary_counterpart(&self) -> Header {
        HeaderBuilder::from_header(&self.header)
            .primary(true)
            .build(self.lb_size)
            .expect("header derived from a valid backup is always buildable")
    }

    fn validate_for_write(&self) -> Result<()> {
        use std::io::{Error, ErrorKind};
        if self.header.header_size_le != header::MIN_HEADER_SIZE {
            return Err(Error::new(ErrorKind::Other, "header size must be exactly 0x5C"));
        }
        if self.header.part_size != header::ENTRY_SIZE {
            return Err(Error::new(ErrorKind::Other, "entry size must be exactly 128"));
        }
        let reserved_lbas = crate::gpt::builder_span(self.header.num_parts, self.header.part_size, self.lb_size);
        if self.header.last_usable < self.header.first_usable
            || self.header.part_start + reserved_lbas > self.header.first_usable
        {
            return Err(Error::new(
                ErrorKind::Other,
                "entry array does not fit between header and first usable LBA",
            ));
        }
        Ok(())
    }

    /// Tolerant equality per §4.A `compare`: ignores CRCs, self/alternate
    /// LBA (beyond anchor offset), tolerates the backup-points-at-self
    /// quirk, and compares entries byte-for-byte in decoded form.
    pub fn compare_tolerant(&self, other: &Gpt) -> bool {
        self.header.compare_tolerant(&other.header) && self.entries == other.entries
    }
}

pub(crate) fn builder_span(num_parts: u32, part_size: u32, lb_size: LogicalBlockSize) -> u64 {
    let bytes = u64::from(num_parts) * u64::from(part_size);
    (bytes + lb_size.as_u64() - 1) / lb_size.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::LogicalBlockSize;
    use std::io::Cursor;

    fn fresh_gpt(lb: LogicalBlockSize, backup_lba: u64) -> Gpt {
        let header = HeaderBuilder::new()
            .disk_guid("1B6A2BFA-E92B-184C-A8A7-ED0610D54821".parse().unwrap())
            .backup_lba(backup_lba)
            .build(lb)
            .unwrap();
        let mut entries = vec![Entry::empty(); header.num_parts as usize];
        entries[0] = Entry {
            type_guid: uuid::Uuid::new_v4(),
            unique_guid: uuid::Uuid::new_v4(),
            first_lba: header.first_usable,
            last_lba: header.first_usable + 100,
            flags: 0,
            name: "boot".into(),
        };
        Gpt {
            header,
            entries,
            lb_size: lb,
        }
    }

    #[test]
    fn round_trip_gpt_through_cursor() {
        let lb = LogicalBlockSize::LB512;
        let gpt = fresh_gpt(lb, 199);
        let mut disk = Cursor::new(vec![0u8; 200 * lb.as_usize()]);
        gpt.write(&mut disk).unwrap();

        disk.set_position(0);
        let read_primary = Gpt::read(&mut disk, Expectation::Primary, Some(lb)).unwrap();
        let read_backup = Gpt::read(&mut disk, Expectation::Backup, Some(lb)).unwrap();

        assert_eq!(read_primary.entries, gpt.entries);
        assert!(read_primary.compare_tolerant(&read_backup));
    }

    #[test]
    fn write_idempotence_is_a_property_of_partition_write() {
        let lb = LogicalBlockSize::LB512;
        let gpt = fresh_gpt(lb, 199);
        let mut disk = Cursor::new(vec![0u8; 200 * lb.as_usize()]);
        gpt.write(&mut disk).unwrap();
        let after_first = disk.get_ref().clone();
        gpt.write(&mut disk).unwrap();
        assert_eq!(disk.get_ref(), &after_first);
    }
}
