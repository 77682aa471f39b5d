//! The object store: deduplicated file bodies under `content/`, addressed
//! by CID-derived paths.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{bail, format_err, Error};

use crate::checksum::ChecksumKind;
use crate::error::StoreError;

/// Streams larger than this spill from memory to a temporary file during
/// add (spec default 100 MiB).
pub const SPOOL_LIMIT: u64 = 100 * 1024 * 1024;

const IO_CHUNK: usize = 64 * 1024;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// An input stream captured for insertion: its bytes (in memory or spilled
/// to `tmp/`), length, and rolling checksum.
pub struct SpooledContent {
    data: SpoolData,
    checksum: Vec<u8>,
    size: u64,
}

enum SpoolData {
    Memory(Vec<u8>),
    File(PathBuf),
}

impl Drop for SpooledContent {
    fn drop(&mut self) {
        if let SpoolData::File(path) = &self.data {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl SpooledContent {
    /// The candidate CID (digest of the streamed bytes).
    pub fn checksum(&self) -> &[u8] {
        &self.checksum
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn reader(&self) -> Result<Box<dyn Read + '_>, Error> {
        match &self.data {
            SpoolData::Memory(data) => Ok(Box::new(&data[..])),
            SpoolData::File(path) => {
                let file = File::open(path).map_err(|err| StoreError::io(path, err))?;
                Ok(Box::new(file))
            }
        }
    }

    /// Test-only constructor with an injected checksum (collision tests).
    #[doc(hidden)]
    pub fn fake_with_checksum(data: Vec<u8>, checksum: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self {
            data: SpoolData::Memory(data),
            checksum,
            size,
        }
    }
}

/// Outcome of verifying one stored object against its good checksum.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjectVerdict {
    Good,
    Missing,
    /// Carries the actual digest of the stored bytes.
    Mismatch(Vec<u8>),
}

/// File system backed object store.
pub struct ContentStore {
    base: PathBuf,
    tmp_dir: PathBuf,
    mutex: Mutex<()>,
}

impl ContentStore {
    pub fn create(root: &Path) -> Result<Self, Error> {
        let base = root.join("content");
        let tmp_dir = root.join("tmp");
        ebakup_tools::fs::create_dir(&base)?;
        ebakup_tools::fs::create_dir(&tmp_dir)?;
        Self::open(root)
    }

    pub fn open(root: &Path) -> Result<Self, Error> {
        let base = root.join("content");
        let tmp_dir = root.join("tmp");
        if !base.is_dir() {
            bail!("unable to open content store at {:?} - no such directory", base);
        }
        // tmp/ may be missing on storages created by older tools
        if !tmp_dir.is_dir() {
            ebakup_tools::fs::create_dir(&tmp_dir)?;
        }
        Ok(Self {
            base,
            tmp_dir,
            mutex: Mutex::new(()),
        })
    }

    /// Path of an object body, derived from the CID alone: two hex octets,
    /// two hex octets, remainder.
    pub fn object_path(&self, cid: &[u8]) -> PathBuf {
        let hex = hex::encode(cid);
        debug_assert!(hex.len() > 4);
        self.base
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(&hex[4..])
    }

    fn tmp_path(&self, purpose: &str) -> PathBuf {
        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.tmp_dir
            .join(format!("{}-{}-{}", purpose, std::process::id(), n))
    }

    /// Capture an input stream, computing its checksum on the fly. Streams
    /// up to [SPOOL_LIMIT] stay in memory, longer ones spill to `tmp/`.
    pub fn spool(&self, source: &mut dyn Read, kind: ChecksumKind) -> Result<SpooledContent, Error> {
        let mut hasher = kind.streamer();
        let mut buffer: Vec<u8> = Vec::new();
        let mut spill: Option<(PathBuf, File)> = None;
        let mut size: u64 = 0;

        let mut chunk = vec![0u8; IO_CHUNK];
        loop {
            let got = match source.read(&mut chunk) {
                Ok(0) => break,
                Ok(got) => got,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(StoreError::io(&self.tmp_dir, err).into()),
            };
            let data = &chunk[..got];
            hasher.update(data);
            size += got as u64;

            match &mut spill {
                Some((path, file)) => {
                    file.write_all(data)
                        .map_err(|err| StoreError::io(&*path, err))?;
                }
                None => {
                    buffer.extend_from_slice(data);
                    if size > SPOOL_LIMIT {
                        let path = self.tmp_path("add");
                        let mut file = ebakup_tools::fs::create_new(&path)
                            .map_err(|err| StoreError::io(&path, err))?;
                        file.write_all(&buffer)
                            .map_err(|err| StoreError::io(&path, err))?;
                        buffer = Vec::new();
                        spill = Some((path, file));
                    }
                }
            }
        }

        let data = match spill {
            Some((path, file)) => {
                ebakup_tools::fs::fsync_file(&file)?;
                SpoolData::File(path)
            }
            None => SpoolData::Memory(buffer),
        };

        Ok(SpooledContent {
            data,
            checksum: hasher.finish(),
            size,
        })
    }

    /// Write a spooled stream to its final object path: temporary file,
    /// fsync, rename, fsync of the leaf directory.
    pub fn insert(&self, cid: &[u8], content: &SpooledContent) -> Result<(), Error> {
        let final_path = self.object_path(cid);
        let leaf_dir = final_path
            .parent()
            .ok_or_else(|| format_err!("unable to derive object directory"))?;

        let _guard = self.mutex.lock().unwrap();

        ebakup_tools::fs::create_path(leaf_dir)?;

        let tmp_path = self.tmp_path("obj");
        let mut tmp_file =
            ebakup_tools::fs::create_new(&tmp_path).map_err(|err| StoreError::io(&tmp_path, err))?;

        let result = std::io::copy(&mut content.reader()?, &mut tmp_file)
            .map_err(|err| Error::from(StoreError::io(&tmp_path, err)))
            .and_then(|_| ebakup_tools::fs::fsync_file(&tmp_file))
            .and_then(|()| {
                std::fs::rename(&tmp_path, &final_path)
                    .map_err(|err| StoreError::io(&final_path, err).into())
            })
            .and_then(|()| ebakup_tools::fs::fsync_dir(leaf_dir));

        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        result
    }

    /// Byte-for-byte comparison of a stored object with a spooled stream.
    pub fn matches(&self, cid: &[u8], content: &SpooledContent) -> Result<bool, Error> {
        let path = self.object_path(cid);
        let mut stored = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(StoreError::io(&path, err).into()),
        };

        let len = stored
            .metadata()
            .map_err(|err| StoreError::io(&path, err))?
            .len();
        if len != content.size() {
            return Ok(false);
        }

        let mut incoming = content.reader()?;
        let mut buf_a = vec![0u8; IO_CHUNK];
        let mut buf_b = vec![0u8; IO_CHUNK];
        loop {
            let got = read_full(&mut stored, &mut buf_a).map_err(|err| StoreError::io(&path, err))?;
            if got == 0 {
                return Ok(true);
            }
            read_exact_from(&mut incoming, &mut buf_b[..got])
                .map_err(|err| StoreError::io(&path, err))?;
            if buf_a[..got] != buf_b[..got] {
                return Ok(false);
            }
        }
    }

    /// Open an object body for reading.
    pub fn open_object(&self, cid: &[u8]) -> Result<File, Error> {
        let path = self.object_path(cid);
        match File::open(&path) {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StoreError::ContentMissing {
                cid: hex::encode(cid),
            }
            .into()),
            Err(err) => Err(StoreError::io(&path, err).into()),
        }
    }

    /// Recompute the digest of a stored object and compare it to the good
    /// checksum from the content index.
    pub fn verify_object(
        &self,
        cid: &[u8],
        expected: &[u8],
        kind: ChecksumKind,
    ) -> Result<ObjectVerdict, Error> {
        let path = self.object_path(cid);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ObjectVerdict::Missing)
            }
            Err(err) => return Err(StoreError::io(&path, err).into()),
        };

        let mut hasher = kind.streamer();
        let mut chunk = vec![0u8; IO_CHUNK];
        loop {
            let got = read_full(&mut file, &mut chunk).map_err(|err| StoreError::io(&path, err))?;
            if got == 0 {
                break;
            }
            hasher.update(&chunk[..got]);
        }

        let digest = hasher.finish();
        if digest == expected {
            Ok(ObjectVerdict::Good)
        } else {
            Ok(ObjectVerdict::Mismatch(digest))
        }
    }
}

fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> Result<usize, std::io::Error> {
    let mut done = 0;
    while done < buf.len() {
        match reader.read(&mut buf[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(done)
}

fn read_exact_from(reader: &mut dyn Read, buf: &mut [u8]) -> Result<(), std::io::Error> {
    let got = read_full(reader, buf)?;
    if got != buf.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "stream ended early",
        ));
    }
    Ok(())
}
