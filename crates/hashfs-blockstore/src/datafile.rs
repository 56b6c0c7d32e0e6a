//! The flat data file behind one (size, shard) pair: slot 0 is a fixed
//! header, every other slot holds one block's payload at a fixed offset
//! `slot * block_size`.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use hashfs_util::{fail_einit, HfsError, Result};

/// `hashfs.c: HASHFS_VERSION`, NUL-padded to 16 bytes on disk.
pub const VERSION_TAG: &str = "SX-Storage 1.5";
const VERSION_FIELD_LEN: usize = 16;
const SHARD_NAME_FIELD_LEN: usize = 32;
const BLOCK_SIZE_FIELD_LEN: usize = 8;
const UUID_FIELD_LEN: usize = 16;
const HEADER_LEN: usize = VERSION_FIELD_LEN + SHARD_NAME_FIELD_LEN + BLOCK_SIZE_FIELD_LEN + UUID_FIELD_LEN;

pub struct Header {
    pub shard_name: String,
    pub block_size: u64,
    pub cluster_uuid: [u8; 16],
}

#[derive(Debug)]
pub struct DataFile {
    file: File,
    block_size: u64,
}

impl DataFile {
    /// Open an existing data file and verify its header matches the shard
    /// this process expects to find there, or create a fresh one with that
    /// header if the file is new.
    pub fn open_or_create(
        path: &Path,
        shard_name: &str,
        block_size: u64,
        cluster_uuid: [u8; 16],
    ) -> Result<DataFile> {
        let is_new = !path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(HfsError::from)?;

        if is_new || file.metadata().map_err(HfsError::from)?.len() == 0 {
            write_header(&file, shard_name, block_size, cluster_uuid)?;
        } else {
            let header = read_header(&file)?;
            if header.shard_name != shard_name || header.block_size != block_size {
                return Err(fail_einit(format!(
                    "data file {} header mismatch: expected shard {shard_name:?}/{block_size}, got {:?}/{}",
                    path.display(),
                    header.shard_name,
                    header.block_size
                )));
            }
            if header.cluster_uuid != cluster_uuid {
                return Err(fail_einit(format!(
                    "data file {} belongs to a different cluster",
                    path.display()
                )));
            }
        }
        Ok(DataFile { file, block_size })
    }

    /// Write `payload` (which must fit within one slot) at `slot`'s offset.
    pub fn write_slot(&self, slot: u64, payload: &[u8]) -> Result<()> {
        if payload.len() as u64 > self.block_size {
            return Err(hashfs_util::emsgsize(format!(
                "payload of {} bytes exceeds block size {}",
                payload.len(),
                self.block_size
            )));
        }
        let offset = slot * self.block_size;
        write_at_retrying(&self.file, payload, offset)
    }

    /// Read exactly `len` bytes back from `slot`.
    pub fn read_slot(&self, slot: u64, len: usize) -> Result<Vec<u8>> {
        let offset = slot * self.block_size;
        let mut buf = vec![0u8; len];
        read_at_retrying(&self.file, &mut buf, offset)?;
        Ok(buf)
    }
}

fn write_header(file: &File, shard_name: &str, block_size: u64, cluster_uuid: [u8; 16]) -> Result<()> {
    let mut buf = [0u8; HEADER_LEN];
    let mut pos = 0;
    pad_into(&mut buf[pos..pos + VERSION_FIELD_LEN], VERSION_TAG.as_bytes());
    pos += VERSION_FIELD_LEN;
    pad_into(&mut buf[pos..pos + SHARD_NAME_FIELD_LEN], shard_name.as_bytes());
    pos += SHARD_NAME_FIELD_LEN;
    let hex = format!("{block_size:x}");
    pad_into(&mut buf[pos..pos + BLOCK_SIZE_FIELD_LEN], hex.as_bytes());
    pos += BLOCK_SIZE_FIELD_LEN;
    buf[pos..pos + UUID_FIELD_LEN].copy_from_slice(&cluster_uuid);
    write_at_retrying(file, &buf, 0)
}

fn read_header(file: &File) -> Result<Header> {
    let mut buf = [0u8; HEADER_LEN];
    read_at_retrying(file, &mut buf, 0)?;
    let mut pos = 0;
    let version = trim_nul(&buf[pos..pos + VERSION_FIELD_LEN]);
    pos += VERSION_FIELD_LEN;
    if version != VERSION_TAG {
        return Err(fail_einit(format!("unrecognized data file version tag {version:?}")));
    }
    let shard_name = trim_nul(&buf[pos..pos + SHARD_NAME_FIELD_LEN]).to_string();
    pos += SHARD_NAME_FIELD_LEN;
    let size_hex = trim_nul(&buf[pos..pos + BLOCK_SIZE_FIELD_LEN]);
    pos += BLOCK_SIZE_FIELD_LEN;
    let block_size = u64::from_str_radix(size_hex, 16)
        .map_err(|e| fail_einit(format!("bad block size field {size_hex:?}: {e}")))?;
    let mut cluster_uuid = [0u8; 16];
    cluster_uuid.copy_from_slice(&buf[pos..pos + UUID_FIELD_LEN]);
    Ok(Header {
        shard_name,
        block_size,
        cluster_uuid,
    })
}

fn pad_into(dst: &mut [u8], src: &[u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
}

fn trim_nul(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}

/// `hashfs.c`'s `write_block` retries `pwrite` on `EINTR`; this does the
/// same around `write_at` instead of surfacing the interruption upward.
fn write_at_retrying(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    loop {
        match file.write_at(buf, offset) {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(HfsError::from(e)),
        }
    }
}

fn read_at_retrying(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    loop {
        match file.read_at(buf, offset) {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(HfsError::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_and_reopens_with_matching_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hs0.bin");
        {
            let df = DataFile::open_or_create(&path, "hs0", 8192, [3u8; 16]).unwrap();
            df.write_slot(1, b"hello").unwrap();
        }
        let df = DataFile::open_or_create(&path, "hs0", 8192, [3u8; 16]).unwrap();
        assert_eq!(df.read_slot(1, 5).unwrap(), b"hello");
    }

    #[test]
    fn mismatched_shard_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hs0.bin");
        DataFile::open_or_create(&path, "hs0", 8192, [1u8; 16]).unwrap();
        let err = DataFile::open_or_create(&path, "hs1", 8192, [1u8; 16]).unwrap_err();
        assert_eq!(err.code, hashfs_util::Code::FailEInit);
    }

    #[test]
    fn mismatched_cluster_uuid_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hs0.bin");
        DataFile::open_or_create(&path, "hs0", 8192, [1u8; 16]).unwrap();
        let err = DataFile::open_or_create(&path, "hs0", 8192, [2u8; 16]).unwrap_err();
        assert_eq!(err.code, hashfs_util::Code::FailEInit);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hs0.bin");
        let df = DataFile::open_or_create(&path, "hs0", 8, [0u8; 16]).unwrap();
        let err = df.write_slot(1, b"too long for 8 bytes").unwrap_err();
        assert_eq!(err.code, hashfs_util::Code::EMsgSize);
    }
}
