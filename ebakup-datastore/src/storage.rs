//! The storage façade: binds a directory into a [Storage] and enforces the
//! locking discipline shared by every operation.
//!
//! Lock rank: `db/main` dominates every other lock in `db/`. A process
//! holding more than one lock acquired `main` first and releases it last;
//! upgrading `main` while holding a dependent lock is impossible by
//! construction (there is no upgrade method). Every acquisition re-checks
//! that the locked fd still names the current directory entry, so writers
//! using atomic replace cannot strand readers on a dead inode.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use lazy_static::lazy_static;
use regex::Regex;

use ebakup_tools::lock::FileLock;

use crate::block_file::BlockFileReader;
use crate::check_log::CheckLog;
use crate::checksum::ChecksumKind;
use crate::content_index::{ContentIndex, ContentInfo};
use crate::content_store::{ContentStore, SpooledContent};
use crate::error::StoreError;
use crate::file_formats::MAIN_MAGIC;
use crate::manifest::{ManifestBuilder, ManifestReader};
use crate::settings::{Settings, SETTING_BLOCKSIZE, SETTING_BLOCKSUM};
use crate::timestamp::snapshot_name;

/// A `.new` file older than this is considered abandoned and may be
/// reclaimed.
pub const STALE_NEW_SECS: u64 = 2 * 3600;

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const STALE_RETRIES: u32 = 3;

/// Default checksum algorithm for new storages.
pub const SETTING_CHECKSUM: &str = "checksum";

const MAIN_KNOWN_SETTINGS: &[&str] = &[SETTING_BLOCKSIZE, SETTING_BLOCKSUM, SETTING_CHECKSUM];

lazy_static! {
    static ref YEAR_DIR_REGEX: Regex = Regex::new(r"^\d{4}$").unwrap();
    static ref SNAPSHOT_FILE_REGEX: Regex = Regex::new(r"^\d{2}-\d{2}T\d{2}:\d{2}$").unwrap();
    static ref SNAPSHOT_NAME_REGEX: Regex = Regex::new(r"^\d{4}/\d{2}-\d{2}T\d{2}:\d{2}$").unwrap();
}

/// Guard for the `db/main` rank lock. Dependent locks can only be taken
/// through a live guard.
pub struct MainLockGuard {
    lock: FileLock,
}

impl MainLockGuard {
    pub fn is_exclusive(&self) -> bool {
        self.lock.is_exclusive()
    }
}

/// One snapshot as listed by [Storage::snapshots].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// `YYYY/MM-DDThh:mm`
    pub name: String,
    pub start_time: i64,
}

/// An opened storage directory.
pub struct Storage {
    root: PathBuf,
    db_dir: PathBuf,
    blocksize: usize,
    blocksum: ChecksumKind,
    checksum: ChecksumKind,
    content_store: ContentStore,
}

impl Storage {
    /// Create a fresh storage. The target must not exist, or must be an
    /// empty directory.
    pub fn create(root: &Path) -> Result<Self, Error> {
        Self::create_with(root, 4096, ChecksumKind::Sha256, ChecksumKind::Sha256)
    }

    pub fn create_with(
        root: &Path,
        blocksize: usize,
        blocksum: ChecksumKind,
        checksum: ChecksumKind,
    ) -> Result<Self, Error> {
        if root.exists() {
            let mut entries = std::fs::read_dir(root).map_err(|err| StoreError::io(root, err))?;
            if entries.next().is_some() {
                return Err(StoreError::already_exists(root, "non-empty storage root").into());
            }
        } else {
            ebakup_tools::fs::create_path(root)?;
        }

        let db_dir = root.join("db");
        ebakup_tools::fs::create_dir(&db_dir)?;
        ContentStore::create(root)?;

        let mut settings = Settings::new(MAIN_MAGIC);
        settings.set(SETTING_BLOCKSIZE, &blocksize.to_string());
        settings.set(SETTING_BLOCKSUM, blocksum.name());
        settings.set(SETTING_CHECKSUM, checksum.name());
        let writer = crate::block_file::BlockFileWriter::create(&db_dir.join("main"), &settings)?;
        writer.sync()?;
        drop(writer);

        ContentIndex::create(&db_dir.join("content"), blocksize, blocksum)?;
        ebakup_tools::fs::fsync_dir(&db_dir)?;

        Self::open(root)
    }

    /// Create a destination storage with the same `main` settings as an
    /// existing one (sync step 1).
    pub fn create_like(root: &Path, source: &Storage) -> Result<Self, Error> {
        Self::create_with(root, source.blocksize, source.blocksum, source.checksum)
    }

    pub fn open(root: &Path) -> Result<Self, Error> {
        let db_dir = root.join("db");
        let main_path = db_dir.join("main");
        if !main_path.exists() {
            return Err(StoreError::not_found(root, "storage database").into());
        }

        let reader = BlockFileReader::open_expecting(&main_path, MAIN_MAGIC)?;
        reader.settings().check_known_keys(&main_path, MAIN_KNOWN_SETTINGS)?;

        let blocksize = reader.blocksize();
        let blocksum = reader.sum_kind();
        let checksum = match reader.settings().get(SETTING_CHECKSUM) {
            Some(name) => ChecksumKind::from_name(name)?,
            None => ChecksumKind::Sha256,
        };
        drop(reader);

        Ok(Self {
            root: root.to_owned(),
            db_dir,
            blocksize,
            blocksum,
            checksum,
            content_store: ContentStore::open(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self, name: &str) -> PathBuf {
        self.db_dir.join(name)
    }

    pub fn blocksize(&self) -> usize {
        self.blocksize
    }

    pub fn blocksum_kind(&self) -> ChecksumKind {
        self.blocksum
    }

    /// The content checksum algorithm of this storage.
    pub fn checksum_kind(&self) -> ChecksumKind {
        self.checksum
    }

    pub fn content_store(&self) -> &ContentStore {
        &self.content_store
    }

    pub fn content_index(&self) -> Result<ContentIndex, Error> {
        ContentIndex::open(&self.db_path("content"))
    }

    pub fn check_log(&self) -> CheckLog {
        CheckLog::new(&self.db_dir, self.blocksize, self.blocksum)
    }

    // --- locking -------------------------------------------------------

    fn acquire(path: &Path, exclusive: bool) -> Result<FileLock, Error> {
        for _ in 0..STALE_RETRIES {
            let lock = match if exclusive {
                FileLock::exclusive(path, LOCK_TIMEOUT)
            } else {
                FileLock::shared(path, LOCK_TIMEOUT)
            } {
                Ok(lock) => lock,
                Err(err) => {
                    log::debug!("lock on {:?} failed: {}", path, err);
                    return Err(StoreError::LockContention {
                        path: path.to_owned(),
                    }
                    .into());
                }
            };
            // an atomic-replace writer may have swapped the file between
            // our open and our lock
            if lock.verify_current()? {
                return Ok(lock);
            }
            log::info!("file {:?} was replaced while locking, retrying", path);
        }
        Err(StoreError::StaleReplaced {
            path: path.to_owned(),
        }
        .into())
    }

    /// Acquire the rank lock. Shared is sufficient unless `db/main` itself
    /// is being rewritten.
    pub fn lock_main_shared(&self) -> Result<MainLockGuard, Error> {
        Ok(MainLockGuard {
            lock: Self::acquire(&self.db_path("main"), false)?,
        })
    }

    pub fn lock_main_exclusive(&self) -> Result<MainLockGuard, Error> {
        Ok(MainLockGuard {
            lock: Self::acquire(&self.db_path("main"), true)?,
        })
    }

    /// Lock a dependent `db/` file. Requires a held main guard; guards must
    /// be dropped in LIFO order so `main` goes last.
    pub fn lock_file_shared(&self, _main: &MainLockGuard, name: &str) -> Result<FileLock, Error> {
        Self::acquire(&self.db_path(name), false)
    }

    pub fn lock_file_exclusive(
        &self,
        _main: &MainLockGuard,
        name: &str,
    ) -> Result<FileLock, Error> {
        Self::acquire(&self.db_path(name), true)
    }

    // --- snapshots -----------------------------------------------------

    /// All finalized snapshots, ordered by name (which is also start-time
    /// order).
    pub fn snapshots(&self) -> Result<Vec<SnapshotInfo>, Error> {
        let mut found = Vec::new();

        for entry in walkdir::WalkDir::new(&self.db_dir)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|err| format_err!("scanning {:?} - {}", self.db_dir, err))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let year = match entry.path().parent().and_then(|p| p.file_name()) {
                Some(year) => year.to_string_lossy().into_owned(),
                None => continue,
            };
            let file = entry.file_name().to_string_lossy().into_owned();
            if !YEAR_DIR_REGEX.is_match(&year) || !SNAPSHOT_FILE_REGEX.is_match(&file) {
                continue;
            }

            let name = format!("{}/{}", year, file);
            let reader = BlockFileReader::open_expecting(entry.path(), crate::file_formats::BACKUP_MAGIC)?;
            let start = match reader.settings().get(crate::manifest::SETTING_START) {
                Some(value) => crate::timestamp::parse_datetime(value)?,
                None => {
                    return Err(
                        StoreError::invalid_format(entry.path(), "missing start setting").into(),
                    )
                }
            };
            found.push(SnapshotInfo {
                name,
                start_time: start,
            });
        }

        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    fn check_snapshot_name(&self, name: &str) -> Result<PathBuf, Error> {
        if !SNAPSHOT_NAME_REGEX.is_match(name) {
            bail!("malformed snapshot name {:?}", name);
        }
        Ok(self.db_dir.join(name))
    }

    /// Open one snapshot manifest by name (`YYYY/MM-DDThh:mm`).
    pub fn snapshot(&self, name: &str) -> Result<ManifestReader, Error> {
        let path = self.check_snapshot_name(name)?;
        if !path.exists() {
            return Err(StoreError::not_found(&self.db_dir, format!("snapshot {}", name)).into());
        }
        ManifestReader::open(&path)
    }

    /// Prepare the `.new` exclusion token for a snapshot path, reclaiming
    /// an abandoned one.
    fn claim_new_file(&self, final_path: &Path) -> Result<(PathBuf, File), Error> {
        let mut tmp_os = final_path.as_os_str().to_owned();
        tmp_os.push(".new");
        let tmp_path = PathBuf::from(tmp_os);

        if tmp_path.exists() {
            let age = ebakup_tools::fs::file_age_secs(&tmp_path)?;
            if age < STALE_NEW_SECS {
                return Err(StoreError::ConcurrentWriter {
                    path: tmp_path.clone(),
                }
                .into());
            }
            log::info!("reclaiming stale {:?} ({}s old)", tmp_path, age);
            std::fs::remove_file(&tmp_path).map_err(|err| StoreError::io(&tmp_path, err))?;
        }

        let file = match ebakup_tools::fs::create_new(&tmp_path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::ConcurrentWriter {
                    path: tmp_path.clone(),
                }
                .into());
            }
            Err(err) => return Err(StoreError::io(&tmp_path, err).into()),
        };
        Ok((tmp_path, file))
    }

    /// Begin a new snapshot. Fails with `AlreadyExists` when the minute
    /// slot is taken, `ConcurrentWriter` when a recent `.new` is present.
    pub fn start_snapshot(&self, start_time: i64) -> Result<ManifestBuilder, Error> {
        let name = snapshot_name(start_time)?;
        let final_path = self.db_dir.join(&name);

        if final_path.exists() {
            return Err(StoreError::already_exists(&self.db_dir, format!("snapshot {}", name)).into());
        }
        if let Some(year_dir) = final_path.parent() {
            ebakup_tools::fs::create_dir(year_dir)?;
        }

        let main = self.lock_main_shared()?;
        let (tmp_path, tmp_file) = self.claim_new_file(&final_path)?;

        let result = (|| {
            let lock = self.lock_file_exclusive(&main, &format!("{}.new", name))?;

            // the exclusive creation is the real token; the lock exists to
            // order us against reclaim scans
            if lock.file().metadata().map_err(|err| StoreError::io(&tmp_path, err))?.len() != 0 {
                return Err(StoreError::ConcurrentWriter {
                    path: tmp_path.clone(),
                }
                .into());
            }
            if final_path.exists() {
                return Err(
                    StoreError::already_exists(&self.db_dir, format!("snapshot {}", name)).into(),
                );
            }

            // write the settings block while locked; everything after runs
            // lock-free because the `.new` file is ours alone
            ManifestBuilder::start(
                final_path.clone(),
                tmp_path.clone(),
                tmp_file,
                self.blocksize,
                self.blocksum,
                start_time,
            )
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        result
    }

    // --- content -------------------------------------------------------

    /// Add a byte stream to the store, returning its CID. Identical content
    /// is deduplicated; digest collisions get a suffix-extended CID.
    pub fn add_content(&self, source: &mut dyn Read) -> Result<Vec<u8>, Error> {
        let spooled = self.content_store.spool(source, self.checksum)?;
        self.add_content_spooled(&spooled)
    }

    pub fn add_content_spooled(&self, spooled: &SpooledContent) -> Result<Vec<u8>, Error> {
        let now = epoch_now_u32();

        let mut last_err = None;
        for _ in 0..STALE_RETRIES {
            let main = self.lock_main_shared()?;
            let lock = self.lock_file_exclusive(&main, "content")?;

            match self.add_locked(spooled, now) {
                Err(err)
                    if crate::error::is_store_error(&err, |e| {
                        matches!(e, StoreError::StaleReplaced { .. })
                    }) =>
                {
                    last_err = Some(err);
                    drop(lock);
                    drop(main);
                    continue;
                }
                other => return other,
            }
        }
        Err(last_err.unwrap_or_else(|| {
            StoreError::LockContention {
                path: self.db_path("content"),
            }
            .into()
        }))
    }

    fn add_locked(&self, spooled: &SpooledContent, now: u32) -> Result<Vec<u8>, Error> {
        let index = self.content_index()?;
        let checksum = spooled.checksum().to_vec();

        let candidates = index.lookup_by_checksum(&checksum)?;
        for candidate in &candidates {
            if self.content_store.matches(&candidate.cid, spooled)? {
                log::debug!("content {} already present", hex::encode(&candidate.cid));
                return Ok(candidate.cid.clone());
            }
        }

        let cid = if candidates.is_empty() {
            checksum.clone()
        } else {
            let cid = extend_cid(&index, &checksum)?;
            log::warn!(
                "checksum collision for {}, extending cid to {}",
                hex::encode(&checksum),
                hex::encode(&cid)
            );
            cid
        };

        // the object body must be durable before its index entry exists
        self.content_store.insert(&cid, spooled)?;
        index.add(&ContentInfo {
            cid: cid.clone(),
            checksum,
            first: now,
            last: now,
        })?;

        Ok(cid)
    }

    /// Copy an object from another storage, preserving its CID and insertion
    /// time (sync step 3).
    pub fn import_object(
        &self,
        cid: &[u8],
        checksum: &[u8],
        added_at: u32,
        source: &mut dyn Read,
    ) -> Result<(), Error> {
        let spooled = self.content_store.spool(source, self.checksum)?;
        if spooled.checksum() != checksum {
            bail!(
                "imported object data does not match checksum {}",
                hex::encode(checksum)
            );
        }

        let main = self.lock_main_shared()?;
        let _lock = self.lock_file_exclusive(&main, "content")?;

        let index = self.content_index()?;
        if index.lookup(cid)?.is_some() {
            return Ok(());
        }

        self.content_store.insert(cid, &spooled)?;
        index.add(&ContentInfo {
            cid: cid.to_vec(),
            checksum: checksum.to_vec(),
            first: added_at,
            last: added_at,
        })
    }

    /// Copy a finalized manifest from another storage block-for-block. The
    /// blocks are verified on read and land byte-identical on disk.
    pub fn import_manifest(&self, name: &str, source: &BlockFileReader) -> Result<(), Error> {
        let final_path = self.check_snapshot_name(name)?;
        if final_path.exists() {
            return Err(StoreError::already_exists(&self.db_dir, format!("snapshot {}", name)).into());
        }
        if let Some(year_dir) = final_path.parent() {
            ebakup_tools::fs::create_dir(year_dir)?;
        }

        let (tmp_path, mut tmp_file) = self.claim_new_file(&final_path)?;

        let result = (|| {
            use std::io::Write;

            for index in 0..source.block_count()? {
                let block = source.read_raw_block(index)?;
                tmp_file
                    .write_all(&block)
                    .map_err(|err| StoreError::io(&tmp_path, err))?;
            }
            ebakup_tools::fs::fsync_file(&tmp_file)?;

            std::fs::rename(&tmp_path, &final_path)
                .map_err(|err| format_err!("atomic rename to {:?} failed - {}", final_path, err))?;
            if let Some(parent) = final_path.parent() {
                ebakup_tools::fs::fsync_dir(parent)?;
            }
            Ok(())
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        result
    }
}

fn epoch_now_u32() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Extend a colliding checksum with the shortest suffix of fresh octets
/// that yields an unused CID. Candidates are enumerated shortest first, each
/// length in ascending byte order, so the outcome is deterministic given
/// the insertion order of prior objects.
fn extend_cid(index: &ContentIndex, checksum: &[u8]) -> Result<Vec<u8>, Error> {
    for suffix_len in 1..=8usize {
        let mut suffix = vec![0u8; suffix_len];
        loop {
            let mut candidate = checksum.to_vec();
            candidate.extend_from_slice(&suffix);
            if index.lookup(&candidate)?.is_none() {
                return Ok(candidate);
            }
            if !increment_suffix(&mut suffix) {
                break;
            }
        }
    }
    Err(StoreError::CidCollision {
        checksum: hex::encode(checksum),
    }
    .into())
}

fn increment_suffix(suffix: &mut [u8]) -> bool {
    for byte in suffix.iter_mut().rev() {
        if *byte < 0xff {
            *byte += 1;
            return true;
        }
        *byte = 0;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_store_error;

    const START: i64 = 1735787045; // 2025-01-02T03:04:05

    #[test]
    fn test_create_open_and_refuse_nonempty() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("storage");

        let storage = Storage::create(&root).unwrap();
        assert_eq!(storage.checksum_kind(), ChecksumKind::Sha256);
        assert!(root.join("db/main").exists());
        assert!(root.join("db/content").exists());
        assert!(root.join("content").is_dir());

        // re-create over the now non-empty root must fail
        let err = Storage::create(&root).unwrap_err();
        assert!(is_store_error(&err, |e| matches!(
            e,
            StoreError::AlreadyExists { .. }
        )));

        let storage = Storage::open(&root).unwrap();
        assert!(storage.snapshots().unwrap().is_empty());
    }

    #[test]
    fn test_add_content_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::create(&dir.path().join("storage")).unwrap();

        let body = vec![0x5au8; 1024 * 1024];
        let cid_a = storage.add_content(&mut &body[..]).unwrap();
        let cid_b = storage.add_content(&mut &body[..]).unwrap();
        assert_eq!(cid_a, cid_b);
        assert_eq!(cid_a, ChecksumKind::Sha256.digest(&body));

        let index = storage.content_index().unwrap();
        let entries: Vec<_> = index.iterate().unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_collision_gets_suffix_extended_cid() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::create(&dir.path().join("storage")).unwrap();

        // two distinct payloads forced onto the same 32-octet checksum
        let fake_sum = vec![0x77u8; 32];
        let first = SpooledContent::fake_with_checksum(b"payload-1".to_vec(), fake_sum.clone());
        let second = SpooledContent::fake_with_checksum(b"payload-2".to_vec(), fake_sum.clone());

        let cid_a = storage.add_content_spooled(&first).unwrap();
        let cid_b = storage.add_content_spooled(&second).unwrap();

        assert_eq!(cid_a, fake_sum);
        assert_eq!(cid_b.len(), 33);
        assert_eq!(&cid_b[..32], &fake_sum[..]);
        assert_eq!(cid_b[32], 0x00);

        // both bodies live at distinct paths and stay retrievable
        let mut data = Vec::new();
        storage
            .content_store()
            .open_object(&cid_a)
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        assert_eq!(data, b"payload-1");

        data.clear();
        storage
            .content_store()
            .open_object(&cid_b)
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        assert_eq!(data, b"payload-2");

        // adding the first payload again resolves to the unextended cid
        let again = SpooledContent::fake_with_checksum(b"payload-1".to_vec(), fake_sum);
        assert_eq!(storage.add_content_spooled(&again).unwrap(), cid_a);
    }

    #[test]
    fn test_snapshot_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::create(&dir.path().join("storage")).unwrap();

        let cid = storage.add_content(&mut &b"hello"[..]).unwrap();

        let mut builder = storage.start_snapshot(START).unwrap();
        builder
            .add_file(
                0,
                b"a.txt",
                &cid,
                5,
                crate::timestamp::Mtime::from_epoch(START, 0).unwrap(),
                0,
                crate::manifest::FileType::Regular,
            )
            .unwrap();
        builder.finalize(START + 30).unwrap();

        let list = storage.snapshots().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "2025/01-02T03:04");
        assert_eq!(list[0].start_time, START);

        let manifest = storage.snapshot("2025/01-02T03:04").unwrap();
        assert_eq!(manifest.files().count(), 1);
        assert_eq!(manifest.referenced_cids(), vec![cid]);

        // the minute slot is now taken
        let err = storage.start_snapshot(START + 20).unwrap_err();
        assert!(is_store_error(&err, |e| matches!(
            e,
            StoreError::AlreadyExists { .. }
        )));
    }

    #[test]
    fn test_concurrent_start_snapshot_refused() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::create(&dir.path().join("storage")).unwrap();

        let builder = storage.start_snapshot(START).unwrap();

        // a second writer for the same minute sees the fresh `.new`
        let err = storage.start_snapshot(START).unwrap_err();
        assert!(is_store_error(&err, |e| matches!(
            e,
            StoreError::ConcurrentWriter { .. }
        )));

        // dropping the unfinished builder reclaims the slot
        drop(builder);
        let builder = storage.start_snapshot(START).unwrap();
        builder.finalize(START + 1).unwrap();
    }

    #[test]
    fn test_lock_rank_compiles_to_lifo_release() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::create(&dir.path().join("storage")).unwrap();

        let main = storage.lock_main_shared().unwrap();
        let content = storage.lock_file_exclusive(&main, "content").unwrap();
        assert!(content.is_exclusive());
        assert!(!main.is_exclusive());
        drop(content);
        drop(main);
    }
}
