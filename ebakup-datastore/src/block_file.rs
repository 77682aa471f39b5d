//! The common container format: a file made of equal-sized blocks, each
//! ending in a checksum over the preceding bytes of the block.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use crate::checksum::ChecksumKind;
use crate::error::StoreError;
use crate::settings::{Settings, SETTING_BLOCKSIZE, SETTING_BLOCKSUM};

pub const DEFAULT_BLOCKSIZE: usize = 4096;
pub const DEFAULT_BLOCKSUM: ChecksumKind = ChecksumKind::Sha256;

/// How much of a file the first-block bootstrap may read before the real
/// blocksize is known.
const BOOTSTRAP_READ_LIMIT: usize = 10_000;

const MIN_BLOCKSIZE: usize = 128;
const MAX_BLOCKSIZE: usize = 1 << 24;

/// Pad a payload to the data area and append the block checksum.
fn seal_block(payload: &[u8], blocksize: usize, kind: ChecksumKind) -> Vec<u8> {
    let sumsize = kind.digest_len();
    debug_assert!(payload.len() <= blocksize - sumsize);

    let mut block = Vec::with_capacity(blocksize);
    block.extend_from_slice(payload);
    block.resize(blocksize - sumsize, 0);
    block.extend_from_slice(&kind.digest(&block));
    block
}

fn verify_block(block: &[u8], kind: ChecksumKind) -> bool {
    let sumsize = kind.digest_len();
    if block.len() <= sumsize {
        return false;
    }
    let (data, sum) = block.split_at(block.len() - sumsize);
    kind.digest(data) == sum
}

/// Extract the `edb-*` bootstrap settings from an unverified file prefix.
///
/// The prefix may end mid-line; lines are inspected only until the first
/// NUL octet. Missing keys fall back to the format defaults.
fn bootstrap_settings(prefix: &[u8]) -> Result<(usize, ChecksumKind), Error> {
    let used = prefix.iter().position(|&b| b == 0).unwrap_or(prefix.len());

    let mut blocksize = DEFAULT_BLOCKSIZE;
    let mut sum_kind = DEFAULT_BLOCKSUM;

    for line in prefix[..used].split(|&b| b == b'\n') {
        let line = match std::str::from_utf8(line) {
            Ok(line) => line,
            Err(_) => continue,
        };
        if let Some(value) = line.strip_prefix("edb-blocksize:") {
            blocksize = value
                .parse()
                .map_err(|_| format_err!("malformed edb-blocksize value {:?}", value))?;
        } else if let Some(value) = line.strip_prefix("edb-blocksum:") {
            sum_kind = ChecksumKind::from_name(value)?;
        }
    }

    if !(MIN_BLOCKSIZE..=MAX_BLOCKSIZE).contains(&blocksize) {
        bail!("unsupported blocksize {}", blocksize);
    }
    if blocksize <= sum_kind.digest_len() + 1 {
        bail!(
            "blocksize {} too small for {} checksums",
            blocksize,
            sum_kind
        );
    }

    Ok((blocksize, sum_kind))
}

/// Verifying reader over a block container file.
pub struct BlockFileReader {
    file: File,
    path: PathBuf,
    blocksize: usize,
    sum_kind: ChecksumKind,
    settings: Settings,
}

impl BlockFileReader {
    /// Open a container file.
    ///
    /// Reads a bounded prefix to locate `edb-blocksize`, then re-reads the
    /// aligned first block and verifies it with the checksum algorithm it
    /// declares before trusting any of its settings.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = File::open(path).map_err(|err| StoreError::io(path, err))?;

        let mut prefix = vec![0u8; BOOTSTRAP_READ_LIMIT];
        let got = read_at_most(&file, &mut prefix, 0).map_err(|err| StoreError::io(path, err))?;
        prefix.truncate(got);

        let (blocksize, sum_kind) = bootstrap_settings(&prefix)
            .map_err(|err| StoreError::invalid_format(path, err.to_string()))?;

        let mut reader = Self {
            file,
            path: path.to_owned(),
            blocksize,
            sum_kind,
            settings: Settings::new(""),
        };

        let payload = reader.read_block(0)?;
        reader.settings = Settings::parse(&payload)
            .map_err(|err| StoreError::invalid_format(path, err.to_string()))?;

        // the verified settings must agree with the bootstrap values
        if let Some(declared) = reader.settings.get(SETTING_BLOCKSIZE) {
            if declared != blocksize.to_string() {
                return Err(StoreError::invalid_format(path, "inconsistent edb-blocksize").into());
            }
        }

        Ok(reader)
    }

    /// Open and check the magic line.
    pub fn open_expecting(path: &Path, magic: &str) -> Result<Self, Error> {
        let reader = Self::open(path)?;
        if reader.settings.magic() != magic {
            return Err(StoreError::invalid_format(
                path,
                format!("unexpected magic {:?}", reader.settings.magic()),
            )
            .into());
        }
        Ok(reader)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn blocksize(&self) -> usize {
        self.blocksize
    }

    pub fn sum_kind(&self) -> ChecksumKind {
        self.sum_kind
    }

    /// Octets of usable payload per block.
    pub fn payload_capacity(&self) -> usize {
        self.blocksize - self.sum_kind.digest_len()
    }

    /// Number of blocks, counting a trailing partial block as one (reading
    /// it will fail with `BlockCorrupt`).
    pub fn block_count(&self) -> Result<u64, Error> {
        let len = self
            .file
            .metadata()
            .map_err(|err| StoreError::io(&self.path, err))?
            .len();
        Ok((len + self.blocksize as u64 - 1) / self.blocksize as u64)
    }

    /// Read and verify a whole block, returning it checksum included.
    pub fn read_raw_block(&self, index: u64) -> Result<Vec<u8>, Error> {
        let mut block = vec![0u8; self.blocksize];
        let offset = index * self.blocksize as u64;

        let got = read_at_most(&self.file, &mut block, offset)
            .map_err(|err| StoreError::io(&self.path, err))?;
        if got != self.blocksize || !verify_block(&block, self.sum_kind) {
            return Err(StoreError::block_corrupt(&self.path, index).into());
        }
        Ok(block)
    }

    /// Read and verify a block, returning its payload (data area only).
    pub fn read_block(&self, index: u64) -> Result<Vec<u8>, Error> {
        let mut block = self.read_raw_block(index)?;
        block.truncate(self.blocksize - self.sum_kind.digest_len());
        Ok(block)
    }

    /// Iterate the data blocks (everything after the settings block). Each
    /// item carries the block index for error reporting.
    pub fn data_blocks(&self) -> Result<impl Iterator<Item = (u64, Result<Vec<u8>, Error>)> + '_, Error> {
        let count = self.block_count()?;
        Ok((1..count).map(move |index| (index, self.read_block(index))))
    }
}

fn read_at_most(file: &File, buf: &mut [u8], offset: u64) -> Result<usize, std::io::Error> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(done)
}

/// Writer for a block container file.
///
/// Blocks are finalized one at a time; there is never a partially written
/// block in a growing file.
#[derive(Debug)]
pub struct BlockFileWriter {
    file: File,
    path: PathBuf,
    blocksize: usize,
    sum_kind: ChecksumKind,
    block_count: u64,
}

impl BlockFileWriter {
    /// Create a fresh container file; fails if the path already exists.
    pub fn create(path: &Path, settings: &Settings) -> Result<Self, Error> {
        let file = ebakup_tools::fs::create_new(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                StoreError::already_exists(path, "container file")
            } else {
                StoreError::io(path, err)
            }
        })?;
        Self::init_file(file, path, settings)
    }

    /// Write the settings block into an already-created, empty file (the
    /// caller owns the exclusive-creation token, e.g. a manifest `.new`).
    pub fn init_file(file: File, path: &Path, settings: &Settings) -> Result<Self, Error> {
        let len = file.metadata().map_err(|err| StoreError::io(path, err))?.len();
        if len != 0 {
            return Err(StoreError::invalid_format(path, "new container file is not empty").into());
        }

        let blocksize: usize = settings
            .get(SETTING_BLOCKSIZE)
            .ok_or_else(|| format_err!("settings lack {}", SETTING_BLOCKSIZE))?
            .parse()
            .map_err(|_| format_err!("malformed {}", SETTING_BLOCKSIZE))?;
        let sum_kind = ChecksumKind::from_name(
            settings
                .get(SETTING_BLOCKSUM)
                .ok_or_else(|| format_err!("settings lack {}", SETTING_BLOCKSUM))?,
        )?;

        let mut writer = Self {
            file,
            path: path.to_owned(),
            blocksize,
            sum_kind,
            block_count: 0,
        };
        writer.append_block(&settings.encode())?;
        Ok(writer)
    }

    /// Open an existing container for mutation (content index append,
    /// verification log rewrite). The caller must hold the write lock.
    pub fn open_existing(path: &Path) -> Result<Self, Error> {
        let reader = BlockFileReader::open(path)?;
        let blocksize = reader.blocksize;
        let sum_kind = reader.sum_kind;
        let len = reader
            .file
            .metadata()
            .map_err(|err| StoreError::io(path, err))?
            .len();
        drop(reader);

        if len % blocksize as u64 != 0 {
            return Err(StoreError::block_corrupt(path, len / blocksize as u64).into());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| StoreError::io(path, err))?;

        Ok(Self {
            file,
            path: path.to_owned(),
            blocksize,
            sum_kind,
            block_count: len / blocksize as u64,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn blocksize(&self) -> usize {
        self.blocksize
    }

    pub fn sum_kind(&self) -> ChecksumKind {
        self.sum_kind
    }

    pub fn payload_capacity(&self) -> usize {
        self.blocksize - self.sum_kind.digest_len()
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    fn check_payload(&self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() > self.payload_capacity() {
            bail!(
                "payload of {} octets exceeds block capacity {}",
                payload.len(),
                self.payload_capacity()
            );
        }
        Ok(())
    }

    /// Append a finalized block, returning its index.
    pub fn append_block(&mut self, payload: &[u8]) -> Result<u64, Error> {
        self.check_payload(payload)?;
        let block = seal_block(payload, self.blocksize, self.sum_kind);
        let index = self.block_count;
        self.file
            .write_all_at(&block, index * self.blocksize as u64)
            .map_err(|err| StoreError::io(&self.path, err))?;
        self.block_count += 1;
        Ok(index)
    }

    /// Append a pre-sealed block verbatim (cross-storage manifest copy).
    pub fn append_raw_block(&mut self, block: &[u8]) -> Result<u64, Error> {
        if block.len() != self.blocksize {
            bail!(
                "raw block of {} octets does not match blocksize {}",
                block.len(),
                self.blocksize
            );
        }
        if !verify_block(block, self.sum_kind) {
            return Err(StoreError::block_corrupt(&self.path, self.block_count).into());
        }
        let index = self.block_count;
        self.file
            .write_all_at(block, index * self.blocksize as u64)
            .map_err(|err| StoreError::io(&self.path, err))?;
        self.block_count += 1;
        Ok(index)
    }

    /// Overwrite an existing block. Only valid on mutable files, under a
    /// write lock.
    pub fn rewrite_block(&mut self, index: u64, payload: &[u8]) -> Result<(), Error> {
        if index >= self.block_count {
            bail!(
                "rewrite of block {} beyond end of {:?} ({} blocks)",
                index,
                self.path,
                self.block_count
            );
        }
        self.check_payload(payload)?;
        let block = seal_block(payload, self.blocksize, self.sum_kind);
        self.file
            .write_all_at(&block, index * self.blocksize as u64)
            .map_err(|err| StoreError::io(&self.path, err))?;
        Ok(())
    }

    /// Drop trailing blocks (verification log compaction).
    pub fn truncate_blocks(&mut self, count: u64) -> Result<(), Error> {
        if count > self.block_count {
            bail!("cannot grow {:?} by truncation", self.path);
        }
        self.file
            .set_len(count * self.blocksize as u64)
            .map_err(|err| StoreError::io(&self.path, err))?;
        self.block_count = count;
        Ok(())
    }

    pub fn sync(&self) -> Result<(), Error> {
        ebakup_tools::fs::fsync_file(&self.file)
    }
}

/// Check that everything after the entry terminator is NUL padding.
pub fn check_padding(rest: &[u8], path: &Path, index: u64) -> Result<(), Error> {
    if rest.iter().any(|&b| b != 0) {
        return Err(StoreError::block_corrupt(path, index).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_store_error;

    fn test_settings(magic: &str) -> Settings {
        let mut settings = Settings::new(magic);
        settings.set(SETTING_BLOCKSIZE, "4096");
        settings.set(SETTING_BLOCKSUM, "sha256");
        settings
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("container");

        let mut writer = BlockFileWriter::create(&path, &test_settings("ebakup test data")).unwrap();
        writer.append_block(b"first data block").unwrap();
        writer.append_block(b"second data block").unwrap();
        writer.sync().unwrap();
        drop(writer);

        let reader = BlockFileReader::open_expecting(&path, "ebakup test data").unwrap();
        assert_eq!(reader.blocksize(), 4096);
        assert_eq!(reader.block_count().unwrap(), 3);

        let payload = reader.read_block(1).unwrap();
        assert_eq!(&payload[..16], b"first data block");
        assert!(payload[16..].iter().all(|&b| b == 0));

        let blocks: Vec<_> = reader.data_blocks().unwrap().collect();
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|(_, b)| b.is_ok()));
    }

    #[test]
    fn test_corruption_detected_and_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("container");

        let mut writer = BlockFileWriter::create(&path, &test_settings("ebakup test data")).unwrap();
        writer.append_block(b"block one").unwrap();
        writer.append_block(b"block two").unwrap();
        drop(writer);

        // flip one bit in block 1
        let mut raw = std::fs::read(&path).unwrap();
        raw[4096 + 3] ^= 0x40;
        std::fs::write(&path, &raw).unwrap();

        let reader = BlockFileReader::open(&path).unwrap();
        let err = reader.read_block(1).unwrap_err();
        assert!(is_store_error(&err, |e| matches!(
            e,
            StoreError::BlockCorrupt { index: 1, .. }
        )));

        // the sibling block is unaffected
        assert!(reader.read_block(2).is_ok());
    }

    #[test]
    fn test_first_block_bootstrap_nondefault_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("container");

        let mut settings = test_settings("ebakup test data");
        settings.set(SETTING_BLOCKSIZE, "1024");
        settings.set(SETTING_BLOCKSUM, "sha512");

        let mut writer = BlockFileWriter::create(&path, &settings).unwrap();
        writer.append_block(b"payload").unwrap();
        drop(writer);

        let reader = BlockFileReader::open(&path).unwrap();
        assert_eq!(reader.blocksize(), 1024);
        assert_eq!(reader.sum_kind(), ChecksumKind::Sha512);
        assert!(reader.read_block(1).is_ok());
    }

    #[test]
    fn test_rewrite_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("container");

        let mut writer = BlockFileWriter::create(&path, &test_settings("ebakup test data")).unwrap();
        writer.append_block(b"old payload").unwrap();
        drop(writer);

        let mut writer = BlockFileWriter::open_existing(&path).unwrap();
        assert_eq!(writer.block_count(), 2);
        writer.rewrite_block(1, b"new payload").unwrap();
        assert!(writer.rewrite_block(2, b"beyond end").is_err());
        drop(writer);

        let reader = BlockFileReader::open(&path).unwrap();
        assert_eq!(&reader.read_block(1).unwrap()[..11], b"new payload");
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("container");

        let mut writer = BlockFileWriter::create(&path, &test_settings("ebakup test data")).unwrap();
        let too_big = vec![1u8; 4096 - 32 + 1];
        assert!(writer.append_block(&too_big).is_err());
    }

    #[test]
    fn test_unknown_magic_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("container");

        let writer = BlockFileWriter::create(&path, &test_settings("something else")).unwrap();
        drop(writer);

        let err = BlockFileReader::open_expecting(&path, "ebakup test data").unwrap_err();
        assert!(is_store_error(&err, |e| matches!(
            e,
            StoreError::InvalidFormat { .. }
        )));
    }
}
