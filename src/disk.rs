//! Disk-related scalar types shared by the GPT codec and the device layer.

use std::fmt;
use std::io;

/// Default size of a logical sector (bytes), used until a device reports
/// otherwise.
pub const DEFAULT_SECTOR_SIZE: LogicalBlockSize = LogicalBlockSize::LB512;

/// Largest sector size we are willing to probe up to (§4.A: "probe by
/// doubling from 512 up to 16 MiB").
pub const MAX_PROBE_SECTOR_SIZE: u64 = 16 * 1024 * 1024;

/// Logical block/sector size of a device or archive chunk.
///
/// Most real devices report 512 or 4096, but §4.A's sector-size probe can
/// in principle land on any power of two up to 16 MiB, so this isn't a
/// closed enum the way the teacher crate's `LogicalBlockSize` was.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct LogicalBlockSize(u64);

impl LogicalBlockSize {
    /// 512-byte sectors — the common case for eMMC/UFS devices here.
    pub const LB512: LogicalBlockSize = LogicalBlockSize(512);
    /// 4096-byte sectors.
    pub const LB4096: LogicalBlockSize = LogicalBlockSize(4096);

    /// Returns the logical block size as a `usize`.
    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    /// Returns the logical block size as a `u64`.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<LogicalBlockSize> for u64 {
    fn from(lb: LogicalBlockSize) -> u64 {
        lb.as_u64()
    }
}

impl From<LogicalBlockSize> for usize {
    fn from(lb: LogicalBlockSize) -> usize {
        lb.as_usize()
    }
}

impl TryFrom<u64> for LogicalBlockSize {
    type Error = io::Error;
    fn try_from(v: u64) -> Result<Self, Self::Error> {
        if v >= 512 && v <= MAX_PROBE_SECTOR_SIZE && v.is_power_of_two() {
            Ok(LogicalBlockSize(v))
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                "unsupported logical block size (must be a power of two, 512..=16MiB)",
            ))
        }
    }
}

impl fmt::Display for LogicalBlockSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
