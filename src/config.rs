//! OP resize-hint configuration: mounts `cust` read-only, reads
//! `official_op_resize.cfg`, and unmounts again (§4.F, §6).

use std::io::Read;
use std::path::Path;

use rustix::mount::{mount, unmount, MountFlags, UnmountFlags};

use crate::error::Result;
use crate::logging::*;

const CUST_MOUNT_POINT: &str = "/cust";
const CUST_DEVICE: &str = "/dev/block/bootdevice/by-name/cust";
const RESIZE_HINT_FILE: &str = "official_op_resize.cfg";

/// Reads the desired `OP` size in bytes from `/cust/official_op_resize.cfg`
/// (`KEY=<decimal bytes>`, first `=` determines the value). Returns `None`
/// if the file or device is absent, per §4.F: "If the file is absent,
/// treat the hint as zero."
pub fn read_op_resize_hint() -> Result<Option<u64>> {
    if !Path::new(CUST_DEVICE).exists() {
        debug!("{CUST_DEVICE} does not exist, no resize hint available");
        return Ok(None);
    }

    let guard = match CustMount::mount_read_only() {
        Ok(g) => g,
        Err(e) => {
            debug!("failed to mount cust read-only: {e}, treating hint as absent");
            return Ok(None);
        }
    };

    let path = Path::new(CUST_MOUNT_POINT).join(RESIZE_HINT_FILE);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(_) => {
            drop(guard);
            return Ok(None);
        }
    };
    drop(guard);

    Ok(parse_resize_hint(&contents))
}

/// Parses the decimal run following the first `=` in the whole file,
/// mirroring the original's raw `strchr(buf, '=')` scan: whatever precedes
/// the `=` is irrelevant, and there is no key filtering.
fn parse_resize_hint(contents: &str) -> Option<u64> {
    let after_eq = contents.split_once('=')?.1;
    let digits: String = after_eq
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// RAII guard: mounts `cust` read-only on construction, unmounts on drop.
struct CustMount;

impl CustMount {
    fn mount_read_only() -> Result<Self> {
        std::fs::create_dir_all(CUST_MOUNT_POINT)?;
        mount(
            CUST_DEVICE,
            CUST_MOUNT_POINT,
            "ext4",
            MountFlags::RDONLY,
            "",
        )
        .map_err(std::io::Error::from)?;
        Ok(Self)
    }
}

impl Drop for CustMount {
    fn drop(&mut self) {
        if let Err(e) = unmount(CUST_MOUNT_POINT, UnmountFlags::empty()) {
            debug!("failed to unmount {CUST_MOUNT_POINT}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_value_after_first_equals() {
        let cfg = "OP=41943040\n";
        assert_eq!(parse_resize_hint(cfg), Some(41_943_040));
    }

    #[test]
    fn first_equals_wins_regardless_of_key() {
        let cfg = "OTHER=5\nOP=0\n";
        assert_eq!(parse_resize_hint(cfg), Some(5));
    }

    #[test]
    fn missing_equals_returns_none() {
        let cfg = "no equals sign here\n";
        assert_eq!(parse_resize_hint(cfg), None);
    }
}
