//! Device abstraction: path templates, sector size, memory views, and the
//! positioned read/write/discard primitives the differential writer and
//! GPT codec are built on (§4.G).

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use memmap2::{Mmap, MmapOptions};

use crate::disk::{LogicalBlockSize, DEFAULT_SECTOR_SIZE, MAX_PROBE_SECTOR_SIZE};
use crate::error::{Error, Result};
use crate::logging::*;

/// Bit in the file header's UFS-flag word selecting multi-LUN UFS
/// addressing over single-device eMMC addressing (§3, §6).
pub const UFS_MULTI_LUN_BIT: u32 = 256;

// BLKSSZGET/BLKDISCARD/BLKRRPART are encoded with `_IO`/`_IOR` against
// block-layer-private magic numbers the `ioctl_*!` standard macros don't
// model, so they're declared with the `_bad` variants as every `blkdev`
// ioctl wrapper in the ecosystem does.
nix::ioctl_read_bad!(blkszget, 0x1268, libc::c_int);
nix::ioctl_write_ptr_bad!(blkdiscard, 0x1277, [u64; 2]);
nix::ioctl_none_bad!(blkrrpart, 0x125F);

/// Which path template a device index resolves through.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Bus {
    /// `/dev/block/sd{a..}`
    Ufs,
    /// `/dev/block/mmcblk{0..}`
    Mmc,
}

impl Bus {
    /// Selects a bus from the file header's UFS-flag word (§6).
    pub fn from_ufs_flag(flag_ufs: u32) -> Self {
        if flag_ufs & UFS_MULTI_LUN_BIT != 0 {
            Bus::Ufs
        } else {
            Bus::Mmc
        }
    }

    /// Builds the raw device node path for a device index.
    pub fn device_path(&self, index: u8) -> PathBuf {
        match self {
            Bus::Ufs => PathBuf::from(format!("/dev/block/sd{}", (b'a' + index) as char)),
            Bus::Mmc => PathBuf::from(format!("/dev/block/mmcblk{index}")),
        }
    }
}

/// Resolves a slice name to its stable by-name alias (§6).
pub fn slice_path(slice_name: &str) -> PathBuf {
    PathBuf::from(format!("/dev/block/bootdevice/by-name/{slice_name}"))
}

/// A block device opened read-only, with its sector size and a mapped
/// read-only view (§4.G: "mmap for read").
pub struct BlockDevice {
    #[allow(dead_code)]
    file: File,
    pub sector_size: LogicalBlockSize,
    len: u64,
    view: Mmap,
}

impl BlockDevice {
    /// Opens `path` read-only, determining sector size via ioctl (falling
    /// back to the doubling probe) and mapping the whole device.
    pub fn open_read_only(path: &std::path::Path) -> Result<Self> {
        let file = File::open(path)?;
        let sector_size = query_sector_size(&file).unwrap_or_else(|e| {
            debug!("BLKSSZGET failed on {}: {e}, falling back to default", path.display());
            DEFAULT_SECTOR_SIZE
        });
        let len = file.metadata()?.len();
        let view = unsafe { MmapOptions::new().map(&file)? };
        Ok(Self {
            file,
            sector_size,
            len,
            view,
        })
    }

    /// Opens `path` for the exclusive read-write access a slice write
    /// requires, refusing a mounted slice (`O_EXCL`) unless `simulate` is
    /// set (§4.D, §5 exclusive-open discipline).
    pub fn open_for_write(path: &std::path::Path, simulate: bool) -> Result<File> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);
        if !simulate {
            opts.custom_flags(libc::O_EXCL);
        }
        opts.open(path).map_err(|e| {
            if e.raw_os_error() == Some(libc::EBUSY) || e.raw_os_error() == Some(libc::ETXTBSY) {
                Error::BusyMount(format!("{}: {e}", path.display()))
            } else {
                Error::Io(e)
            }
        })
    }

    /// Reads `len` bytes at absolute byte `offset` from the mapped
    /// read-only view (§4.A "source presenting block-addressed reads").
    pub fn read_at(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| Error::internal("read range overflow"))?;
        if end > self.view.len() as u64 {
            return Err(Error::internal("read past end of device view"));
        }
        Ok(&self.view[offset as usize..end as usize])
    }

    /// Reads `len` bytes counted back from the end of the device, mirroring
    /// §4.A's "positive offsets from start, negative from end" convention.
    pub fn read_from_end(&self, len: usize) -> Result<&[u8]> {
        let start = (self.view.len() as u64)
            .checked_sub(len as u64)
            .ok_or_else(|| Error::internal("read range underflow from end"))?;
        self.read_at(start, len)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.view[..]
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Writes `buf` at absolute byte `offset` on an exclusively opened file.
pub fn pwrite(file: &File, offset: u64, buf: &[u8]) -> Result<()> {
    use rustix::io::pwrite;
    let mut written = 0usize;
    while written < buf.len() {
        let n =
            pwrite(file, &buf[written..], offset + written as u64).map_err(io::Error::from)?;
        if n == 0 {
            return Err(Error::internal("pwrite wrote zero bytes"));
        }
        written += n;
    }
    Ok(())
}

/// Issues a discard (TRIM) over `[start, start+len)`. Failures are
/// non-fatal by contract (§4.D) — callers should log and continue.
pub fn discard(file: &File, start: u64, len: u64) -> io::Result<()> {
    let range: [u64; 2] = [start, len];
    unsafe { blkdiscard(file.as_raw_fd(), &range) }?;
    Ok(())
}

/// Re-reads the partition table via the kernel ioctl (§4.F: "re-read the
/// partition table via the kernel ioctl; report whether the kernel picked
/// up the new table").
pub fn reread_partition_table(file: &File) -> bool {
    unsafe { blkrrpart(file.as_raw_fd()) }.is_ok()
}

fn query_sector_size(file: &File) -> io::Result<LogicalBlockSize> {
    let mut size: libc::c_int = 0;
    unsafe { blkszget(file.as_raw_fd(), &mut size) }?;
    if size <= 0 {
        return Err(io::Error::new(io::ErrorKind::Other, "BLKSSZGET returned non-positive size"));
    }
    LogicalBlockSize::try_from(size as u64)
}

/// Probes sector size by doubling from 512 up to 16MiB, invoking `probe`
/// with each candidate until it returns `true` (§4.A; used when the ioctl
/// above is unavailable, e.g. reading a plain image file).
pub fn probe_sector_size<F>(mut probe: F) -> Result<LogicalBlockSize>
where
    F: FnMut(LogicalBlockSize) -> bool,
{
    let mut s = 512u64;
    while s <= MAX_PROBE_SECTOR_SIZE {
        let lb = LogicalBlockSize::try_from(s).expect("power of two in range");
        if probe(lb) {
            return Ok(lb);
        }
        s *= 2;
    }
    Err(Error::format("sector-size probe exhausted at 16MiB"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_selection_follows_ufs_flag_bit() {
        assert_eq!(Bus::from_ufs_flag(256), Bus::Ufs);
        assert_eq!(Bus::from_ufs_flag(0), Bus::Mmc);
    }

    #[test]
    fn device_path_templates() {
        assert_eq!(Bus::Ufs.device_path(0).to_str().unwrap(), "/dev/block/sda");
        assert_eq!(Bus::Mmc.device_path(0).to_str().unwrap(), "/dev/block/mmcblk0");
    }

    #[test]
    fn slice_path_uses_by_name_alias() {
        assert_eq!(
            slice_path("boot").to_str().unwrap(),
            "/dev/block/bootdevice/by-name/boot"
        );
    }

    #[test]
    fn probe_sector_size_doubles_until_match() {
        let target = LogicalBlockSize::LB4096;
        let found = probe_sector_size(|lb| lb == target).unwrap();
        assert_eq!(found, target);
    }
}
