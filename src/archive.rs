//! Outer-container and inner-stream parsing: locates the chunked image
//! stream inside the archive, decodes its file header and chunk headers,
//! and verifies the header MD5 (§4.B).

use std::fs::File;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};

use crate::error::{Error, Result};
use crate::hash::Md5Hasher;
use crate::logging::*;

/// Outer container magic (first 8 bytes of the archive).
pub const OUTER_MAGIC: &[u8; 8] = b"KDZ_FILE";
/// Inner stream magic (first 4 bytes at the located offset).
pub const INNER_MAGIC: &[u8; 4] = b"\x32\x96\x18\x74";
/// Suffix identifying the directory entry that holds the inner stream.
pub const INNER_ENTRY_SUFFIX: &str = ".dz";

const DIRECTORY_ENTRY_LEN: usize = 256 + 4 + 4;
const FILE_HEADER_LEN: usize = 512;
const CHUNK_HEADER_LEN: usize = 512;
const MAX_CHUNK_COUNT: u32 = 1 << 20;
const MIN_ARCHIVE_LEN: u64 = 1024 * 1024;

/// Decoded file header (§3).
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub major: u32,
    pub minor: u32,
    /// Patch level; reserved in practice.
    pub patch_level: u32,
    pub device_name: String,
    pub factory_version: String,
    pub chunk_count: u32,
    pub md5: [u8; 16],
    pub flag_mmc: u32,
    pub flag_ufs: u32,
}

/// One chunk's decoded header plus the byte offset of its payload.
#[derive(Debug, Clone)]
pub struct ChunkDescriptor {
    pub header: ChunkHeader,
    pub payload_offset: u64,
}

/// Decoded chunk header (§3).
#[derive(Debug, Clone)]
pub struct ChunkHeader {
    pub slice_name: String,
    pub chunk_name: String,
    pub target_size: u32,
    pub data_size: u32,
    pub md5: [u8; 16],
    pub target_addr: u32,
    pub trim_count: u32,
    pub device: u32,
    pub crc32: u32,
}

/// A parsed archive: its read-only memory view, decoded file header, and
/// per-chunk index (§3 "Archive" lifecycle).
pub struct Archive {
    view: Mmap,
    pub stream_offset: u64,
    pub file_header: FileHeader,
    pub chunks: Vec<ChunkDescriptor>,
}

impl Archive {
    /// Opens and fully indexes an archive file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < MIN_ARCHIVE_LEN {
            return Err(Error::format("archive is smaller than the 1MiB minimum"));
        }
        let view = unsafe { MmapOptions::new().map(&file)? };

        if &view[0..8] != OUTER_MAGIC {
            return Err(Error::format("bad outer container magic"));
        }

        let stream_offset = locate_inner_stream(&view)?;
        if &view[stream_offset as usize..stream_offset as usize + 4] != INNER_MAGIC {
            return Err(Error::format("bad inner stream magic"));
        }

        let file_header = decode_file_header(&view, stream_offset)?;
        if file_header.chunk_count == 0 || file_header.chunk_count > MAX_CHUNK_COUNT {
            return Err(Error::format("chunk count out of range"));
        }

        let chunks = index_chunks(&view, stream_offset, &file_header, len)?;

        Ok(Self {
            view,
            stream_offset,
            file_header,
            chunks,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.view[..]
    }

    /// Raw, still-compressed payload bytes for chunk `i`.
    pub fn payload(&self, i: usize) -> Result<&[u8]> {
        let c = self
            .chunks
            .get(i)
            .ok_or_else(|| Error::internal("chunk index out of range"))?;
        let start = c.payload_offset as usize;
        let end = start + c.header.data_size as usize;
        self.view
            .get(start..end)
            .ok_or_else(|| Error::format("chunk payload runs past end of file"))
    }
}

/// Scans the directory entries from offset 8 forward until one whose name
/// ends with [`INNER_ENTRY_SUFFIX`] is found, returning its file offset
/// (§4.B).
fn locate_inner_stream(view: &[u8]) -> Result<u64> {
    let mut cur = 8usize;
    while cur + DIRECTORY_ENTRY_LEN <= view.len() {
        let entry = &view[cur..cur + DIRECTORY_ENTRY_LEN];
        let name_raw = &entry[0..256];
        let nul = name_raw.iter().position(|&b| b == 0).unwrap_or(256);
        let name = String::from_utf8_lossy(&name_raw[..nul]);
        let offset = u32::from_le_bytes(entry[260..264].try_into().unwrap());

        if name.ends_with(INNER_ENTRY_SUFFIX) {
            return Ok(offset as u64);
        }
        cur += DIRECTORY_ENTRY_LEN;
    }
    Err(Error::format("no inner stream entry found in directory"))
}

/// Decodes the 512-byte file header, swapping the five designated 32-bit
/// fields to host order (§3, §4.B).
fn decode_file_header(view: &[u8], offset: u64) -> Result<FileHeader> {
    let start = offset as usize;
    let raw = view
        .get(start..start + FILE_HEADER_LEN)
        .ok_or_else(|| Error::format("file header runs past end of file"))?;

    let major = u32::from_le_bytes(raw[4..8].try_into().unwrap());
    let minor = u32::from_le_bytes(raw[8..12].try_into().unwrap());
    let patch_level = u32::from_le_bytes(raw[12..16].try_into().unwrap());
    let device_name = cstr_field(&raw[16..48]);
    let factory_version = cstr_field(&raw[48..192]);
    let chunk_count = u32::from_le_bytes(raw[192..196].try_into().unwrap());
    let mut md5 = [0u8; 16];
    md5.copy_from_slice(&raw[196..212]);
    let flag_mmc = u32::from_le_bytes(raw[212..216].try_into().unwrap());
    let flag_ufs = u32::from_le_bytes(raw[336..340].try_into().unwrap());

    trace!("file header: device={device_name} chunks={chunk_count} ufs_flag={flag_ufs:#x}");

    Ok(FileHeader {
        major,
        minor,
        patch_level,
        device_name,
        factory_version,
        chunk_count,
        md5,
        flag_mmc,
        flag_ufs,
    })
}

fn cstr_field(raw: &[u8]) -> String {
    let nul = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..nul]).into_owned()
}

/// Walks the chunk stream, decoding each header and recording its payload
/// offset; accumulates the header-MD5 over every header except the first
/// (§4.B, §9 chunk-0 sentinel open question) and checks it against the
/// file header's `md5` field.
fn index_chunks(
    view: &[u8],
    stream_offset: u64,
    file_header: &FileHeader,
    file_len: u64,
) -> Result<Vec<ChunkDescriptor>> {
    let mut cur = stream_offset + FILE_HEADER_LEN as u64;
    let mut chunks = Vec::with_capacity(file_header.chunk_count as usize);
    let mut hasher = Md5Hasher::new();

    for i in 0..file_header.chunk_count {
        if cur + CHUNK_HEADER_LEN as u64 > file_len {
            return Err(Error::format("chunk header runs past end of file"));
        }
        let start = cur as usize;
        let raw = &view[start..start + CHUNK_HEADER_LEN];
        let header = decode_chunk_header(raw)?;

        if i != 0 {
            hasher.update(raw);
        }

        let payload_offset = cur + CHUNK_HEADER_LEN as u64;
        cur = payload_offset + header.data_size as u64;
        if cur > file_len {
            return Err(Error::format("chunk payload runs past end of file"));
        }

        chunks.push(ChunkDescriptor {
            header,
            payload_offset,
        });
    }

    let computed = hasher.finalize();
    if computed != file_header.md5 {
        return Err(Error::format("header MD5 mismatch"));
    }

    Ok(chunks)
}

fn decode_chunk_header(raw: &[u8]) -> Result<ChunkHeader> {
    if &raw[0..4] != b"\x32\x96\x18\x74" {
        return Err(Error::format("bad chunk header magic"));
    }
    let slice_name = cstr_field(&raw[4..36]);
    let chunk_name = cstr_field(&raw[36..100]);
    let target_size = u32::from_le_bytes(raw[100..104].try_into().unwrap());
    let data_size = u32::from_le_bytes(raw[104..108].try_into().unwrap());
    let mut md5 = [0u8; 16];
    md5.copy_from_slice(&raw[108..124]);
    let target_addr = u32::from_le_bytes(raw[124..128].try_into().unwrap());
    let trim_count = u32::from_le_bytes(raw[128..132].try_into().unwrap());
    let device = u32::from_le_bytes(raw[132..136].try_into().unwrap());
    let crc32 = u32::from_le_bytes(raw[136..140].try_into().unwrap());

    Ok(ChunkHeader {
        slice_name,
        chunk_name,
        target_size,
        data_size,
        md5,
        target_addr,
        trim_count,
        device,
        crc32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk_header(slice_name: &str, data_size: u32) -> Vec<u8> {
        let mut raw = vec![0u8; CHUNK_HEADER_LEN];
        raw[0..4].copy_from_slice(b"\x32\x96\x18\x74");
        let name_bytes = slice_name.as_bytes();
        raw[4..4 + name_bytes.len()].copy_from_slice(name_bytes);
        raw[104..108].copy_from_slice(&data_size.to_le_bytes());
        raw
    }

    #[test]
    fn decode_chunk_header_reads_slice_name_and_sizes() {
        let raw = sample_chunk_header("boot", 1024);
        let h = decode_chunk_header(&raw).unwrap();
        assert_eq!(h.slice_name, "boot");
        assert_eq!(h.data_size, 1024);
    }

    #[test]
    fn decode_chunk_header_rejects_bad_magic() {
        let mut raw = sample_chunk_header("boot", 0);
        raw[0] = 0;
        assert!(decode_chunk_header(&raw).is_err());
    }
}
