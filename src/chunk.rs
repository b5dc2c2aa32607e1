//! Streaming decompression of one chunk with integrated CRC32 + MD5
//! verification (§4.C).
//!
//! The accounting rule is the whole point of this module: only bytes
//! actually produced by the decompressor are fed to the running digests.
//! An earlier variant of the unpacker accounted bytes requested instead,
//! which silently produced the wrong MD5 on the final short read; that
//! behaviour must never be reintroduced (§9).

use flate2::{Decompress, FlushDecompress, Status};

use crate::archive::Archive;
use crate::disk::LogicalBlockSize;
use crate::error::{Error, Result};
use crate::gpt::header::calculate_crc32;
use crate::hash::Md5Hasher;
use crate::logging::*;

/// Outcome of [`ChunkUnpacker::close`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Verdict {
    Verified,
    Mismatch,
}

/// A streaming decompressor over one chunk's payload, with running CRC32
/// and MD5 accumulators.
pub struct ChunkUnpacker<'a> {
    input: &'a [u8],
    input_pos: usize,
    inflater: Decompress,
    crc: crc::Digest<'static, u32>,
    md5: Md5Hasher,
    expected_crc32: u32,
    expected_md5: [u8; 16],
    failed: bool,
    finished: bool,
}

static CRC_32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

impl<'a> ChunkUnpacker<'a> {
    /// Opens chunk `i` of `archive` for streaming decompression. Fails if
    /// `target_size` isn't a multiple of `sector_size` (§4.C).
    pub fn open(archive: &'a Archive, i: usize, sector_size: LogicalBlockSize) -> Result<Self> {
        let chunk = archive
            .chunks
            .get(i)
            .ok_or_else(|| Error::internal("chunk index out of range"))?;
        if chunk.header.target_size as u64 % sector_size.as_u64() != 0 {
            return Err(Error::format(format!(
                "chunk {i}: target_size {} is not a multiple of the sector size {}",
                chunk.header.target_size,
                sector_size.as_u64()
            )));
        }

        let input = archive.payload(i)?;
        Ok(Self {
            input,
            input_pos: 0,
            inflater: Decompress::new(true),
            crc: CRC_32.digest(),
            md5: Md5Hasher::new(),
            expected_crc32: chunk.header.crc32,
            expected_md5: chunk.header.md5,
            failed: false,
            finished: false,
        })
    }

    /// Fills up to `buf.len()` bytes, advancing the accumulators by
    /// exactly the bytes delivered. Returns the number of bytes written,
    /// `0` at end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.failed {
            return Err(Error::internal("unpacker already failed"));
        }
        if self.finished {
            return Ok(0);
        }

        let before_out = self.inflater.total_out();
        let status = self
            .inflater
            .decompress(&self.input[self.input_pos..], buf, FlushDecompress::None)
            .map_err(|e| {
                self.failed = true;
                Error::format(format!("zlib inflate error: {e}"))
            })?;
        self.input_pos = self.inflater.total_in() as usize;

        let produced = (self.inflater.total_out() - before_out) as usize;
        self.crc.update(&buf[..produced]);
        self.md5.update(&buf[..produced]);

        if status == Status::StreamEnd {
            self.finished = true;
        }
        Ok(produced)
    }

    /// Finalises the decompressor. If `discard` is false (or the stream
    /// end was reached naturally regardless of `discard`), the running
    /// CRC32 and finalised MD5 must both match the chunk header.
    pub fn close(mut self, discard: bool) -> Result<Verdict> {
        if self.failed {
            return Ok(Verdict::Mismatch);
        }
        let must_verify = !discard || self.finished;
        if !must_verify {
            return Ok(Verdict::Verified);
        }

        let crc = self.crc.finalize();
        let md5 = std::mem::take(&mut self.md5).finalize();

        if crc == self.expected_crc32 && md5 == self.expected_md5 {
            Ok(Verdict::Verified)
        } else {
            debug!(
                "chunk verification failed: crc {:#x} (want {:#x}), md5 mismatch={}",
                crc,
                self.expected_crc32,
                md5 != self.expected_md5
            );
            Ok(Verdict::Mismatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn bytes_delivered_accounting_matches_plain_decompression() {
        let plain = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let compressed = deflate(&plain);

        let mut inflater = Decompress::new(true);
        let mut out = vec![0u8; plain.len() + 64];
        let mut crc = CRC_32.digest();
        let mut md5 = Md5Hasher::new();
        let mut pos = 0usize;
        loop {
            let before = inflater.total_out();
            let status = inflater
                .decompress(&compressed[pos..], &mut out, FlushDecompress::None)
                .unwrap();
            pos = inflater.total_in() as usize;
            let produced = (inflater.total_out() - before) as usize;
            crc.update(&out[..produced]);
            md5.update(&out[..produced]);
            if status == Status::StreamEnd {
                break;
            }
        }
        assert_eq!(crc.finalize(), calculate_crc32(&plain));
        let mut expected_md5 = Md5Hasher::new();
        expected_md5.update(&plain);
        assert_eq!(md5.finalize(), expected_md5.finalize());
    }
}
