//! The content index (`db/content`): one record per object in the store.

use std::path::{Path, PathBuf};

use anyhow::{bail, Error};

use crate::block_file::{check_padding, BlockFileReader, BlockFileWriter};
use crate::error::StoreError;
use crate::file_formats::{
    CKDATA_CHANGED_OLD, CKDATA_RESTORED_OLD, CONTENT_MAGIC, ENTRY_CLOSED_OLD, ENTRY_CONTENT,
    ENTRY_CONTENT_OLD,
};
use crate::settings::{Settings, SETTING_BLOCKSIZE, SETTING_BLOCKSUM};
use crate::wire;

const MAX_CID_LEN: usize = 1024;

const KNOWN_SETTINGS: &[&str] = &[SETTING_BLOCKSIZE, SETTING_BLOCKSUM];

/// One active record of the content index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentInfo {
    pub cid: Vec<u8>,
    pub checksum: Vec<u8>,
    /// Insertion time, seconds since the epoch.
    pub first: u32,
    /// Equal to `first` for everything modern writers produce.
    pub last: u32,
}

impl ContentInfo {
    pub fn added_at(&self) -> u32 {
        self.first
    }
}

/// Handle to the content index file. Stateless; every operation re-reads
/// the file so that lock-then-read sequencing stays in the caller's hands.
pub struct ContentIndex {
    path: PathBuf,
}

/// The good checksum must be a prefix of the CID (it equals the CID unless
/// collision suffixes were appended).
fn encode_entry(out: &mut Vec<u8>, info: &ContentInfo) -> Result<(), Error> {
    if info.checksum.len() > info.cid.len() || info.cid[..info.checksum.len()] != info.checksum[..] {
        bail!("content checksum is not a prefix of the cid");
    }

    out.push(ENTRY_CONTENT);
    wire::encode_varuint(out, info.cid.len() as u64);
    wire::encode_varuint(out, info.checksum.len() as u64);
    out.extend_from_slice(&info.cid);
    out.extend_from_slice(&info.first.to_le_bytes());
    out.extend_from_slice(&info.last.to_le_bytes());
    Ok(())
}

fn encoded_len(info: &ContentInfo) -> usize {
    1 + wire::varuint_len(info.cid.len() as u64)
        + wire::varuint_len(info.checksum.len() as u64)
        + info.cid.len()
        + 8
}

/// Parse one block payload. Returns the active entries and the number of
/// payload octets in use (up to but not including the terminator).
fn parse_block(payload: &[u8], path: &Path, index: u64) -> Result<(Vec<ContentInfo>, usize), Error> {
    let mut entries = Vec::new();
    let mut cursor = &payload[..];

    loop {
        if cursor.is_empty() {
            break;
        }
        if cursor[0] == 0 {
            check_padding(&cursor[1..], path, index)?;
            break;
        }

        let tag = cursor[0];
        cursor = &cursor[1..];
        match tag {
            ENTRY_CONTENT => {
                let cidlen = wire::decode_varuint(&mut cursor)? as usize;
                let cklen = wire::decode_varuint(&mut cursor)? as usize;
                if cidlen == 0 || cidlen > MAX_CID_LEN || cklen > MAX_CID_LEN {
                    return Err(StoreError::invalid_format(
                        path,
                        format!("implausible cid/checksum length in block {}", index),
                    )
                    .into());
                }
                let field = wire::read_bytes(&mut cursor, cidlen.max(cklen))?;
                let first = wire::read_u32_le(&mut cursor)?;
                let last = wire::read_u32_le(&mut cursor)?;

                // deprecated trailing ckdata items: recognize and skip
                while let Some(&item) = cursor.first() {
                    match item {
                        CKDATA_RESTORED_OLD => {
                            cursor = &cursor[1..];
                            let _time = wire::read_u32_le(&mut cursor)?;
                        }
                        CKDATA_CHANGED_OLD => {
                            cursor = &cursor[1..];
                            let _cksum = wire::decode_lenprefixed(&mut cursor, MAX_CID_LEN)?;
                            let _first = wire::read_u32_le(&mut cursor)?;
                            let _last = wire::read_u32_le(&mut cursor)?;
                        }
                        _ => break,
                    }
                }

                entries.push(ContentInfo {
                    cid: field[..cidlen].to_vec(),
                    checksum: field[..cklen].to_vec(),
                    first,
                    last,
                });
            }
            ENTRY_CONTENT_OLD => {
                let _cid = wire::decode_lenprefixed(&mut cursor, MAX_CID_LEN)?;
                let _first = wire::read_u32_le(&mut cursor)?;
                let _last = wire::read_u32_le(&mut cursor)?;
            }
            ENTRY_CLOSED_OLD => {
                let _data = wire::decode_lenprefixed(&mut cursor, MAX_CID_LEN)?;
            }
            _ => {
                return Err(StoreError::invalid_format(
                    path,
                    format!("unknown entry tag {:#04x} in block {}", tag, index),
                )
                .into());
            }
        }
    }

    // when the loop broke at a terminator, `cursor` still includes it
    Ok((entries, payload.len() - cursor.len()))
}

impl ContentIndex {
    /// Create an empty index file.
    pub fn create(path: &Path, blocksize: usize, blocksum: crate::ChecksumKind) -> Result<Self, Error> {
        let mut settings = Settings::new(CONTENT_MAGIC);
        settings.set(SETTING_BLOCKSIZE, &blocksize.to_string());
        settings.set(SETTING_BLOCKSUM, blocksum.name());
        let writer = BlockFileWriter::create(path, &settings)?;
        writer.sync()?;
        Ok(Self {
            path: path.to_owned(),
        })
    }

    /// Open an existing index, verifying magic and settings.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let reader = BlockFileReader::open_expecting(path, CONTENT_MAGIC)?;
        reader.settings().check_known_keys(path, KNOWN_SETTINGS)?;
        Ok(Self {
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lazy iteration in file order. A corrupt block yields a single error
    /// and iteration continues with the next block.
    pub fn iterate(&self) -> Result<ContentIndexIter, Error> {
        let reader = BlockFileReader::open_expecting(&self.path, CONTENT_MAGIC)?;
        let count = reader.block_count()?;
        Ok(ContentIndexIter {
            reader,
            next_block: 1,
            block_count: count,
            pending: Vec::new(),
        })
    }

    /// Find the entry for an exact CID. Scans the file; entries may live in
    /// any block.
    pub fn lookup(&self, cid: &[u8]) -> Result<Option<ContentInfo>, Error> {
        for entry in self.iterate()? {
            let entry = entry?;
            if entry.cid == cid {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// All entries whose good checksum equals `checksum` (collision
    /// candidates during add).
    pub fn lookup_by_checksum(&self, checksum: &[u8]) -> Result<Vec<ContentInfo>, Error> {
        let mut found = Vec::new();
        for entry in self.iterate()? {
            let entry = entry?;
            if entry.checksum == checksum {
                found.push(entry);
            }
        }
        Ok(found)
    }

    /// Append a record. The caller must hold the write lock on the index
    /// (and `db/main` above it).
    pub fn add(&self, info: &ContentInfo) -> Result<(), Error> {
        let mut entry = Vec::with_capacity(encoded_len(info));
        encode_entry(&mut entry, info)?;

        let reader = BlockFileReader::open_expecting(&self.path, CONTENT_MAGIC)?;
        let block_count = reader.block_count()?;
        let capacity = reader.payload_capacity();
        if entry.len() > capacity {
            bail!("content index entry does not fit a single block");
        }

        // try to extend the last block in place
        let mut target = None;
        if block_count > 1 {
            let last = block_count - 1;
            let payload = reader.read_block(last)?;
            let (_, used) = parse_block(&payload, &self.path, last)?;
            if used + entry.len() <= capacity {
                let mut updated = payload[..used].to_vec();
                updated.extend_from_slice(&entry);
                target = Some((last, updated));
            }
        }
        drop(reader);

        let mut writer = BlockFileWriter::open_existing(&self.path)?;
        match target {
            Some((index, payload)) => writer.rewrite_block(index, &payload)?,
            None => {
                writer.append_block(&entry)?;
            }
        }
        writer.sync()
    }

    /// Replace the whole index, rotating previous generations.
    ///
    /// Writes `content.new`, shifts `content.0 → content.1 → …` up to
    /// `depth`, hard-links the current file as `content.0`, then renames
    /// `content.new` over `content`. The caller holds the write lock.
    pub fn replace<I>(&self, entries: I, depth: u32) -> Result<(), Error>
    where
        I: IntoIterator<Item = ContentInfo>,
    {
        let reader = BlockFileReader::open_expecting(&self.path, CONTENT_MAGIC)?;
        let settings = reader.settings().clone();
        let capacity = reader.payload_capacity();
        drop(reader);

        let new_path = self.sibling("content.new");
        let _ = std::fs::remove_file(&new_path);
        let mut writer = BlockFileWriter::create(&new_path, &settings)?;

        let mut payload: Vec<u8> = Vec::with_capacity(capacity);
        for info in entries {
            let len = encoded_len(&info);
            if len > capacity {
                bail!("content index entry does not fit a single block");
            }
            if payload.len() + len > capacity {
                writer.append_block(&payload)?;
                payload.clear();
            }
            encode_entry(&mut payload, &info)?;
        }
        if !payload.is_empty() {
            writer.append_block(&payload)?;
        }
        writer.sync()?;
        drop(writer);

        for i in (0..depth).rev() {
            let from = self.sibling(&format!("content.{}", i));
            let to = self.sibling(&format!("content.{}", i + 1));
            match std::fs::rename(&from, &to) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(StoreError::io(&from, err).into()),
            }
        }
        if depth > 0 {
            let backup = self.sibling("content.0");
            let _ = std::fs::remove_file(&backup);
            std::fs::hard_link(&self.path, &backup)
                .map_err(|err| StoreError::io(&self.path, err))?;
        }
        std::fs::rename(&new_path, &self.path).map_err(|err| StoreError::io(&self.path, err))?;
        if let Some(parent) = self.path.parent() {
            ebakup_tools::fs::fsync_dir(parent)?;
        }
        Ok(())
    }

    fn sibling(&self, name: &str) -> PathBuf {
        self.path.with_file_name(name)
    }
}

pub struct ContentIndexIter {
    reader: BlockFileReader,
    next_block: u64,
    block_count: u64,
    pending: Vec<Result<ContentInfo, Error>>,
}

impl Iterator for ContentIndexIter {
    type Item = Result<ContentInfo, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if !self.pending.is_empty() {
                return Some(self.pending.remove(0));
            }
            if self.next_block >= self.block_count {
                return None;
            }
            let index = self.next_block;
            self.next_block += 1;

            match self
                .reader
                .read_block(index)
                .and_then(|payload| parse_block(&payload, self.reader.path(), index))
            {
                Ok((entries, _)) => {
                    self.pending = entries.into_iter().map(Ok).collect();
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_store_error;
    use crate::ChecksumKind;

    fn new_index(dir: &Path) -> ContentIndex {
        ContentIndex::create(&dir.join("content"), 4096, ChecksumKind::Sha256).unwrap()
    }

    fn info(cid: &[u8], first: u32) -> ContentInfo {
        ContentInfo {
            cid: cid.to_vec(),
            checksum: cid.to_vec(),
            first,
            last: first,
        }
    }

    #[test]
    fn test_add_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let index = new_index(dir.path());

        let a = info(&[0xaa; 32], 1000);
        let b = info(&[0xbb; 32], 2000);
        index.add(&a).unwrap();
        index.add(&b).unwrap();

        assert_eq!(index.lookup(&[0xaa; 32]).unwrap(), Some(a.clone()));
        assert_eq!(index.lookup(&[0xcc; 32]).unwrap(), None);

        let all: Vec<_> = index.iterate().unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(all, vec![a, b]);

        // both entries landed in one block
        let reader = BlockFileReader::open(index.path()).unwrap();
        assert_eq!(reader.block_count().unwrap(), 2);
    }

    #[test]
    fn test_lookup_by_checksum_with_collision_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let index = new_index(dir.path());

        let digest = vec![0x11u8; 32];
        let plain = info(&digest, 10);
        let mut extended = digest.clone();
        extended.push(0x00);
        let collided = ContentInfo {
            cid: extended.clone(),
            checksum: digest.clone(),
            first: 20,
            last: 20,
        };

        index.add(&plain).unwrap();
        index.add(&collided).unwrap();

        let found = index.lookup_by_checksum(&digest).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(index.lookup(&extended).unwrap(), Some(collided));
    }

    #[test]
    fn test_checksum_must_be_cid_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let index = new_index(dir.path());

        let bad = ContentInfo {
            cid: vec![0x11; 32],
            checksum: vec![0x22; 32],
            first: 1,
            last: 1,
        };
        assert!(index.add(&bad).is_err());
    }

    #[test]
    fn test_deprecated_entries_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let index = new_index(dir.path());

        // hand-build a block holding: old 0xd0 entry, a 0xdd entry with two
        // trailing ckdata items, and an old 0xcc marker
        let mut payload = Vec::new();
        payload.push(ENTRY_CONTENT_OLD);
        wire::encode_lenprefixed(&mut payload, &[0x77; 32]);
        payload.extend_from_slice(&5u32.to_le_bytes());
        payload.extend_from_slice(&5u32.to_le_bytes());

        let keep = info(&[0x33; 32], 42);
        encode_entry(&mut payload, &keep).unwrap();
        payload.push(CKDATA_RESTORED_OLD);
        payload.extend_from_slice(&7u32.to_le_bytes());
        payload.push(CKDATA_CHANGED_OLD);
        wire::encode_lenprefixed(&mut payload, &[0x44; 32]);
        payload.extend_from_slice(&8u32.to_le_bytes());
        payload.extend_from_slice(&9u32.to_le_bytes());

        payload.push(ENTRY_CLOSED_OLD);
        wire::encode_lenprefixed(&mut payload, b"closed");

        let mut writer = BlockFileWriter::open_existing(index.path()).unwrap();
        writer.append_block(&payload).unwrap();
        drop(writer);

        let all: Vec<_> = index.iterate().unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(all, vec![keep]);
    }

    #[test]
    fn test_corrupt_block_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let index = new_index(dir.path());

        // force entries into two separate data blocks
        let big_cid = vec![0x55u8; 1000];
        for i in 0..8u8 {
            let mut cid = big_cid.clone();
            cid[0] = i;
            let entry = ContentInfo {
                cid: cid.clone(),
                checksum: cid,
                first: i as u32,
                last: i as u32,
            };
            index.add(&entry).unwrap();
        }

        let reader = BlockFileReader::open(index.path()).unwrap();
        let blocks = reader.block_count().unwrap();
        assert!(blocks > 2);
        drop(reader);

        // flip a bit in data block 1
        let mut raw = std::fs::read(index.path()).unwrap();
        raw[4096 + 100] ^= 1;
        std::fs::write(index.path(), &raw).unwrap();

        let mut good = 0;
        let mut corrupt = 0;
        for item in index.iterate().unwrap() {
            match item {
                Ok(_) => good += 1,
                Err(err) => {
                    assert!(is_store_error(&err, |e| matches!(
                        e,
                        StoreError::BlockCorrupt { index: 1, .. }
                    )));
                    corrupt += 1;
                }
            }
        }
        assert_eq!(corrupt, 1);
        assert!(good > 0);
    }

    #[test]
    fn test_replace_with_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let index = new_index(dir.path());

        let a = info(&[0xaa; 32], 1);
        let b = info(&[0xbb; 32], 2);
        index.add(&a).unwrap();
        index.add(&b).unwrap();

        index.replace(vec![b.clone()], 2).unwrap();

        let all: Vec<_> = index.iterate().unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(all, vec![b.clone()]);

        // previous generation is preserved as content.0
        let old = ContentIndex::open(&dir.path().join("content.0")).unwrap();
        let all: Vec<_> = old.iterate().unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(all, vec![a.clone(), b.clone()]);

        // a second replace shifts content.0 to content.1
        index.replace(vec![a.clone()], 2).unwrap();
        assert!(dir.path().join("content.1").exists());
        let older = ContentIndex::open(&dir.path().join("content.1")).unwrap();
        let all: Vec<_> = older.iterate().unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(all, vec![a, b]);
    }
}
