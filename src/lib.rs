//! Rewrites raw flash slices on a partitioned block device from a vendor
//! firmware archive.
//!
//! An [`archive::Archive`] is opened and indexed once; [`applicability`]
//! decides whether it's safe to apply to the device in front of you;
//! [`repair`] reconciles partition-table geometry when it doesn't match;
//! and [`diffwrite`] streams each selected chunk onto its target slice
//! with the fewest possible physical writes.
//!
//! ```no_run
//! use dzflash::archive::Archive;
//! use dzflash::device::BlockDevice;
//! use std::path::Path;
//!
//! let archive = Archive::open(Path::new("/sdcard/firmware.kdz")).unwrap();
//! let device = BlockDevice::open_read_only(Path::new("/dev/block/mmcblk0")).unwrap();
//! let (verdict, _report) = dzflash::applicability::test_archive(&archive, &device).unwrap();
//! println!("{verdict:?}");
//! ```

#![warn(missing_docs)]

#[macro_use]
pub mod logging;

pub mod applicability;
pub mod archive;
pub mod chunk;
pub mod config;
pub mod device;
pub mod diffwrite;
pub mod disk;
pub mod error;
pub mod gpt;
pub mod hash;
pub mod repair;
pub mod slices;

pub use applicability::ApplyVerdict;
pub use archive::Archive;
pub use error::{Error, Result};
pub use gpt::Gpt;
