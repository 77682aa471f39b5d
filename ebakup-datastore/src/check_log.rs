//! The verification log: `db/lastcheck` (ranges of "last checked at T") and
//! `db/issues` (per-item histories of detected changes). Both are mutable
//! container files, rewritten block-locally under a write lock.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Error};

use ebakup_tools::lock::FileLock;

use crate::block_file::{check_padding, BlockFileReader, BlockFileWriter};
use crate::checksum::ChecksumKind;
use crate::error::StoreError;
use crate::file_formats::{
    CHECK_KIND_BACKUP, CHECK_KIND_CONTENT, DETAIL_CHECKSUM_BAD_BLOCKS, DETAIL_HEALTHY_BLOCKS,
    DETAIL_LOGICAL_BAD_BLOCKS, DETAIL_MISSING_CID, DETAIL_WHOLE_FILE_BAD, ISSUE_MAGIC,
    LASTCHECK_MAGIC, STATE_CHECKSUM_ONLY, STATE_GOOD, STATE_MISSING, STATE_WRONG_CHECKSUM,
};
use crate::settings::{Settings, SETTING_BLOCKSIZE, SETTING_BLOCKSUM};
use crate::storage::MainLockGuard;
use crate::timestamp::{decode_check_stamp, encode_check_stamp, CheckStamp};
use crate::wire;

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_ID_LEN: usize = 1024;
const MAX_EVENTS: usize = 100_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CheckKind {
    /// Snapshot manifests, ranged by name.
    Backups,
    /// Objects, ranged by CID.
    Contents,
}

impl CheckKind {
    fn tag(self) -> u8 {
        match self {
            CheckKind::Backups => CHECK_KIND_BACKUP,
            CheckKind::Contents => CHECK_KIND_CONTENT,
        }
    }
}

/// One `lastcheck` entry: closed lexicographic ranges checked at `time`.
/// The endpoints need not name extant items.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckedRanges {
    pub kind: CheckKind,
    pub time: Option<CheckStamp>,
    pub ranges: Vec<(Vec<u8>, Vec<u8>)>,
}

/// History event for one object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub before: Option<CheckStamp>,
    pub after: Option<CheckStamp>,
    pub state: ChangeState,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeState {
    /// Believed good.
    Good,
    /// Checksum correct, provenance uncertain.
    ChecksumOnly,
    Missing,
    /// Carries the actually observed checksum.
    WrongChecksum(Vec<u8>),
}

/// History event for one manifest file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotChangeEvent {
    pub before: Option<CheckStamp>,
    pub after: Option<CheckStamp>,
    pub rewritten: bool,
    pub details: SnapshotDetails,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotDetails {
    WholeFileBad,
    Blocks {
        /// Correct blocks that were previously suspect.
        healthy: Vec<u64>,
        /// Blocks whose checksum is good but whose contents do not parse.
        logical_bad: Vec<u64>,
        /// Referenced CIDs absent from the content index.
        missing_cids: Vec<Vec<u8>>,
        /// Blocks failing their checksum (mandatory, possibly empty).
        checksum_bad: Vec<u64>,
    },
}

/// One `issues` entry; exactly one per item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IssueEntry {
    Content {
        cid: Vec<u8>,
        events: Vec<ChangeEvent>,
    },
    Snapshot {
        name: Vec<u8>,
        events: Vec<SnapshotChangeEvent>,
    },
}

impl IssueEntry {
    fn key(&self) -> (u8, &[u8]) {
        match self {
            IssueEntry::Content { cid, .. } => (CHECK_KIND_CONTENT, cid),
            IssueEntry::Snapshot { name, .. } => (CHECK_KIND_BACKUP, name),
        }
    }
}

/// Access to both verification log files of a storage.
pub struct CheckLog {
    lastcheck_path: PathBuf,
    issues_path: PathBuf,
    blocksize: usize,
    blocksum: ChecksumKind,
}

// --- entry codecs ------------------------------------------------------

fn push_stamp(out: &mut Vec<u8>, stamp: Option<CheckStamp>) {
    out.extend_from_slice(&encode_check_stamp(stamp));
}

fn read_stamp(cursor: &mut &[u8]) -> Result<Option<CheckStamp>, Error> {
    let bytes = wire::read_bytes(cursor, 5)?;
    let mut raw = [0u8; 5];
    raw.copy_from_slice(&bytes);
    decode_check_stamp(&raw)
}

fn encode_checked_ranges(out: &mut Vec<u8>, entry: &CheckedRanges) {
    let mut body = Vec::new();
    push_stamp(&mut body, entry.time);
    for (first, last) in &entry.ranges {
        wire::encode_lenprefixed(&mut body, first);
        wire::encode_lenprefixed(&mut body, last);
    }

    out.push(entry.kind.tag());
    wire::encode_varuint(out, body.len() as u64);
    out.extend_from_slice(&body);
}

fn decode_checked_ranges(cursor: &mut &[u8], kind: CheckKind) -> Result<CheckedRanges, Error> {
    let size = wire::decode_varuint(cursor)? as usize;
    let mut body = &wire::read_bytes(cursor, size)?[..];

    let time = read_stamp(&mut body)?;
    let mut ranges = Vec::new();
    while !body.is_empty() {
        let first = wire::decode_lenprefixed(&mut body, MAX_ID_LEN)?;
        let last = wire::decode_lenprefixed(&mut body, MAX_ID_LEN)?;
        ranges.push((first, last));
    }
    Ok(CheckedRanges { kind, time, ranges })
}

fn sorted_unique(mut list: Vec<u64>) -> Vec<u64> {
    list.sort_unstable();
    list.dedup();
    list
}

fn push_block_list(out: &mut Vec<u8>, tag: u8, blocks: &[u64]) {
    out.push(tag);
    wire::encode_varuint(out, blocks.len() as u64);
    for &index in blocks {
        wire::encode_varuint(out, index);
    }
}

fn read_block_list(cursor: &mut &[u8]) -> Result<Vec<u64>, Error> {
    let count = wire::decode_varuint(cursor)? as usize;
    if count > MAX_EVENTS {
        bail!("implausible block list length {}", count);
    }
    let mut list = Vec::with_capacity(count);
    for _ in 0..count {
        list.push(wire::decode_varuint(cursor)?);
    }
    Ok(list)
}

fn encode_issue_entry(out: &mut Vec<u8>, entry: &IssueEntry) {
    let mut body = Vec::new();
    match entry {
        IssueEntry::Content { cid, events } => {
            wire::encode_lenprefixed(&mut body, cid);
            for event in events {
                push_stamp(&mut body, event.before);
                push_stamp(&mut body, event.after);
                match &event.state {
                    ChangeState::Good => body.push(STATE_GOOD),
                    ChangeState::ChecksumOnly => body.push(STATE_CHECKSUM_ONLY),
                    ChangeState::Missing => body.push(STATE_MISSING),
                    ChangeState::WrongChecksum(cksum) => {
                        body.push(STATE_WRONG_CHECKSUM);
                        wire::encode_lenprefixed(&mut body, cksum);
                    }
                }
            }
            out.push(CHECK_KIND_CONTENT);
        }
        IssueEntry::Snapshot { name, events } => {
            wire::encode_lenprefixed(&mut body, name);
            for event in events {
                push_stamp(&mut body, event.before);
                push_stamp(&mut body, event.after);
                body.push(event.rewritten as u8);
                match &event.details {
                    SnapshotDetails::WholeFileBad => body.push(DETAIL_WHOLE_FILE_BAD),
                    SnapshotDetails::Blocks {
                        healthy,
                        logical_bad,
                        missing_cids,
                        checksum_bad,
                    } => {
                        if !healthy.is_empty() {
                            push_block_list(
                                &mut body,
                                DETAIL_HEALTHY_BLOCKS,
                                &sorted_unique(healthy.clone()),
                            );
                        }
                        if !logical_bad.is_empty() {
                            push_block_list(
                                &mut body,
                                DETAIL_LOGICAL_BAD_BLOCKS,
                                &sorted_unique(logical_bad.clone()),
                            );
                        }
                        for cid in missing_cids {
                            body.push(DETAIL_MISSING_CID);
                            wire::encode_lenprefixed(&mut body, cid);
                        }
                        push_block_list(
                            &mut body,
                            DETAIL_CHECKSUM_BAD_BLOCKS,
                            &sorted_unique(checksum_bad.clone()),
                        );
                    }
                }
            }
            out.push(CHECK_KIND_BACKUP);
        }
    }
    wire::encode_varuint(out, body.len() as u64);
    out.extend_from_slice(&body);
}

fn issue_entry_len(entry: &IssueEntry) -> usize {
    let mut out = Vec::new();
    encode_issue_entry(&mut out, entry);
    out.len()
}

fn decode_issue_entry(cursor: &mut &[u8], tag: u8) -> Result<IssueEntry, Error> {
    let size = wire::decode_varuint(cursor)? as usize;
    let mut body = &wire::read_bytes(cursor, size)?[..];

    match tag {
        CHECK_KIND_CONTENT => {
            let cid = wire::decode_lenprefixed(&mut body, MAX_ID_LEN)?;
            let mut events = Vec::new();
            while !body.is_empty() {
                let before = read_stamp(&mut body)?;
                let after = read_stamp(&mut body)?;
                let state = wire::read_bytes(&mut body, 1)?[0];
                let state = match state {
                    STATE_GOOD => ChangeState::Good,
                    STATE_CHECKSUM_ONLY => ChangeState::ChecksumOnly,
                    STATE_MISSING => ChangeState::Missing,
                    STATE_WRONG_CHECKSUM => {
                        ChangeState::WrongChecksum(wire::decode_lenprefixed(&mut body, MAX_ID_LEN)?)
                    }
                    other => bail!("unknown change state {:#04x}", other),
                };
                events.push(ChangeEvent {
                    before,
                    after,
                    state,
                });
            }
            Ok(IssueEntry::Content { cid, events })
        }
        CHECK_KIND_BACKUP => {
            let name = wire::decode_lenprefixed(&mut body, MAX_ID_LEN)?;
            let mut events = Vec::new();
            while !body.is_empty() {
                let before = read_stamp(&mut body)?;
                let after = read_stamp(&mut body)?;
                let rewritten = match wire::read_bytes(&mut body, 1)?[0] {
                    0 => false,
                    1 => true,
                    other => bail!("bad rewritten flag {:#04x}", other),
                };

                let details = if body.first() == Some(&DETAIL_WHOLE_FILE_BAD) {
                    body = &body[1..];
                    SnapshotDetails::WholeFileBad
                } else {
                    let mut healthy = Vec::new();
                    let mut logical_bad = Vec::new();
                    let mut missing_cids = Vec::new();

                    if body.first() == Some(&DETAIL_HEALTHY_BLOCKS) {
                        body = &body[1..];
                        healthy = read_block_list(&mut body)?;
                    }
                    if body.first() == Some(&DETAIL_LOGICAL_BAD_BLOCKS) {
                        body = &body[1..];
                        logical_bad = read_block_list(&mut body)?;
                    }
                    while body.first() == Some(&DETAIL_MISSING_CID) {
                        body = &body[1..];
                        missing_cids.push(wire::decode_lenprefixed(&mut body, MAX_ID_LEN)?);
                    }
                    match body.first() {
                        Some(&DETAIL_CHECKSUM_BAD_BLOCKS) => body = &body[1..],
                        other => bail!("missing mandatory block trailer, got {:?}", other),
                    }
                    let checksum_bad = read_block_list(&mut body)?;

                    SnapshotDetails::Blocks {
                        healthy,
                        logical_bad,
                        missing_cids,
                        checksum_bad,
                    }
                };

                events.push(SnapshotChangeEvent {
                    before,
                    after,
                    rewritten,
                    details,
                });
            }
            Ok(IssueEntry::Snapshot { name, events })
        }
        other => bail!("unknown issue entry kind {:#04x}", other),
    }
}

// --- file access -------------------------------------------------------

impl CheckLog {
    pub(crate) fn new(db_dir: &Path, blocksize: usize, blocksum: ChecksumKind) -> Self {
        Self {
            lastcheck_path: db_dir.join("lastcheck"),
            issues_path: db_dir.join("issues"),
            blocksize,
            blocksum,
        }
    }

    fn open_or_create(&self, path: &Path, magic: &str) -> Result<(), Error> {
        if path.exists() {
            BlockFileReader::open_expecting(path, magic)?;
            return Ok(());
        }
        let mut settings = Settings::new(magic);
        settings.set(SETTING_BLOCKSIZE, &self.blocksize.to_string());
        settings.set(SETTING_BLOCKSUM, self.blocksum.name());
        let writer = BlockFileWriter::create(path, &settings)?;
        writer.sync()
    }

    fn lock_exclusive(&self, path: &Path) -> Result<FileLock, Error> {
        FileLock::exclusive(path, LOCK_TIMEOUT).map_err(|err| {
            log::debug!("lock on {:?} failed: {}", path, err);
            StoreError::LockContention {
                path: path.to_owned(),
            }
            .into()
        })
    }

    // --- lastcheck -----------------------------------------------------

    /// All recorded check ranges. A missing file reads as empty.
    pub fn read_checked(&self) -> Result<Vec<CheckedRanges>, Error> {
        if !self.lastcheck_path.exists() {
            return Ok(Vec::new());
        }
        let reader = BlockFileReader::open_expecting(&self.lastcheck_path, LASTCHECK_MAGIC)?;

        let mut entries = Vec::new();
        for (index, payload) in reader.data_blocks()? {
            let payload = payload?;
            let mut cursor = &payload[..];
            loop {
                match cursor.first() {
                    None => break,
                    Some(0) => {
                        check_padding(&cursor[1..], &self.lastcheck_path, index)?;
                        break;
                    }
                    Some(&tag) => {
                        cursor = &cursor[1..];
                        match tag {
                            CHECK_KIND_BACKUP => {
                                entries.push(decode_checked_ranges(&mut cursor, CheckKind::Backups)?)
                            }
                            CHECK_KIND_CONTENT => entries
                                .push(decode_checked_ranges(&mut cursor, CheckKind::Contents)?),
                            other => {
                                // skip unknown kinds by their size field
                                log::warn!(
                                    "skipping unknown lastcheck entry kind {:#04x} in {:?}",
                                    other,
                                    self.lastcheck_path
                                );
                                let size = wire::decode_varuint(&mut cursor)? as usize;
                                let _ = wire::read_bytes(&mut cursor, size)?;
                            }
                        }
                    }
                }
            }
        }
        Ok(entries)
    }

    /// Record a check pass, coalescing with existing entries of the same
    /// kind and time. Requires the `main` rank lock.
    pub fn record_checked(
        &self,
        _main: &MainLockGuard,
        kind: CheckKind,
        time: Option<CheckStamp>,
        ranges: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<(), Error> {
        self.open_or_create(&self.lastcheck_path, LASTCHECK_MAGIC)?;
        let _lock = self.lock_exclusive(&self.lastcheck_path)?;

        let mut entries = self.read_checked()?;
        entries.push(CheckedRanges { kind, time, ranges });

        // coalesce: one entry per (kind, time), overlapping ranges merged
        let mut merged: Vec<CheckedRanges> = Vec::new();
        for entry in entries {
            match merged
                .iter_mut()
                .find(|m| m.kind == entry.kind && m.time == entry.time)
            {
                Some(existing) => existing.ranges.extend(entry.ranges),
                None => merged.push(entry),
            }
        }
        for entry in &mut merged {
            entry.ranges.sort();
            let mut out: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
            for (first, last) in entry.ranges.drain(..) {
                match out.last_mut() {
                    Some((_, prev_last)) if first <= *prev_last => {
                        if last > *prev_last {
                            *prev_last = last;
                        }
                    }
                    _ => out.push((first, last)),
                }
            }
            entry.ranges = out;
        }

        let mut writer = BlockFileWriter::open_existing(&self.lastcheck_path)?;
        let capacity = writer.payload_capacity();

        // re-pack all data blocks
        let mut payloads: Vec<Vec<u8>> = Vec::new();
        let mut payload: Vec<u8> = Vec::new();
        let mut entry_buf = Vec::new();
        for entry in &merged {
            entry_buf.clear();
            encode_checked_ranges(&mut entry_buf, entry);
            if entry_buf.len() > capacity {
                bail!("lastcheck entry does not fit a single block");
            }
            if payload.len() + entry_buf.len() > capacity {
                payloads.push(std::mem::take(&mut payload));
            }
            payload.extend_from_slice(&entry_buf);
        }
        if !payload.is_empty() {
            payloads.push(payload);
        }

        for (i, payload) in payloads.iter().enumerate() {
            let index = i as u64 + 1;
            if index < writer.block_count() {
                writer.rewrite_block(index, payload)?;
            } else {
                writer.append_block(payload)?;
            }
        }
        writer.truncate_blocks(payloads.len() as u64 + 1)?;
        writer.sync()
    }

    // --- issues --------------------------------------------------------

    /// All issue entries. A missing file reads as empty.
    pub fn read_issues(&self) -> Result<Vec<IssueEntry>, Error> {
        Ok(self.load_blocks()?.into_iter().flatten().collect())
    }

    pub fn lookup_content_issue(&self, cid: &[u8]) -> Result<Option<IssueEntry>, Error> {
        Ok(self
            .read_issues()?
            .into_iter()
            .find(|e| e.key() == (CHECK_KIND_CONTENT, cid)))
    }

    pub fn lookup_snapshot_issue(&self, name: &[u8]) -> Result<Option<IssueEntry>, Error> {
        Ok(self
            .read_issues()?
            .into_iter()
            .find(|e| e.key() == (CHECK_KIND_BACKUP, name)))
    }

    fn load_blocks(&self) -> Result<Vec<Vec<IssueEntry>>, Error> {
        if !self.issues_path.exists() {
            return Ok(Vec::new());
        }
        let reader = BlockFileReader::open_expecting(&self.issues_path, ISSUE_MAGIC)?;

        let mut blocks = Vec::new();
        for (index, payload) in reader.data_blocks()? {
            let payload = payload?;
            let mut entries = Vec::new();
            let mut cursor = &payload[..];
            loop {
                match cursor.first() {
                    None => break,
                    Some(0) => {
                        check_padding(&cursor[1..], &self.issues_path, index)?;
                        break;
                    }
                    Some(&tag) => {
                        cursor = &cursor[1..];
                        entries.push(decode_issue_entry(&mut cursor, tag)?);
                    }
                }
            }
            blocks.push(entries);
        }
        Ok(blocks)
    }

    /// Insert or update the single history entry for an item.
    ///
    /// The owning block is rewritten in place; entries that no longer fit
    /// spill to another block with space. Blocks are never re-ordered.
    pub fn upsert_issue(&self, _main: &MainLockGuard, entry: IssueEntry) -> Result<(), Error> {
        self.open_or_create(&self.issues_path, ISSUE_MAGIC)?;
        let _lock = self.lock_exclusive(&self.issues_path)?;

        let capacity = {
            let reader = BlockFileReader::open_expecting(&self.issues_path, ISSUE_MAGIC)?;
            reader.payload_capacity()
        };
        if issue_entry_len(&entry) > capacity {
            bail!("issue entry does not fit a single block");
        }

        let mut blocks = self.load_blocks()?;
        let mut dirty: Vec<usize> = Vec::new();

        let key = {
            let (tag, id) = entry.key();
            (tag, id.to_vec())
        };
        let owner = blocks.iter().position(|entries| {
            entries
                .iter()
                .any(|e| e.key() == (key.0, key.1.as_slice()))
        });

        let block_len =
            |entries: &[IssueEntry]| entries.iter().map(issue_entry_len).sum::<usize>();

        let mut spilled: Vec<IssueEntry> = Vec::new();
        match owner {
            Some(bi) => {
                let entries = &mut blocks[bi];
                let ei = entries
                    .iter()
                    .position(|e| e.key() == (key.0, key.1.as_slice()))
                    .unwrap();
                entries[ei] = entry;
                dirty.push(bi);

                // spill trailing entries (never the updated one) until the
                // block fits again
                while block_len(entries) > capacity {
                    let victim = entries
                        .iter()
                        .rposition(|e| e.key() != (key.0, key.1.as_slice()))
                        .ok_or_else(|| {
                            anyhow::format_err!("issue entry does not fit a single block")
                        })?;
                    spilled.push(entries.remove(victim));
                }
            }
            None => spilled.push(entry),
        }

        for entry in spilled {
            let len = issue_entry_len(&entry);
            let target = blocks
                .iter()
                .position(|entries| block_len(entries) + len <= capacity);
            match target {
                Some(bi) => {
                    blocks[bi].push(entry);
                    dirty.push(bi);
                }
                None => {
                    blocks.push(vec![entry]);
                    dirty.push(blocks.len() - 1);
                }
            }
        }

        let mut writer = BlockFileWriter::open_existing(&self.issues_path)?;
        dirty.sort_unstable();
        dirty.dedup();
        for bi in dirty {
            let mut payload = Vec::new();
            for entry in &blocks[bi] {
                encode_issue_entry(&mut payload, entry);
            }
            let index = bi as u64 + 1;
            if index < writer.block_count() {
                writer.rewrite_block(index, &payload)?;
            } else {
                writer.append_block(&payload)?;
            }
        }
        writer.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn stamp(epoch: i64) -> Option<CheckStamp> {
        Some(CheckStamp::from_epoch(epoch).unwrap())
    }

    fn test_storage(dir: &Path) -> Storage {
        Storage::create(&dir.join("storage")).unwrap()
    }

    #[test]
    fn test_lastcheck_round_trip_and_coalescing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_storage(dir.path());
        let log = storage.check_log();
        let main = storage.lock_main_shared().unwrap();

        assert!(log.read_checked().unwrap().is_empty());

        let time = stamp(1735787045);
        log.record_checked(
            &main,
            CheckKind::Backups,
            time,
            vec![(b"2025/01-01T00:00".to_vec(), b"2025/01-05T00:00".to_vec())],
        )
        .unwrap();
        log.record_checked(
            &main,
            CheckKind::Backups,
            time,
            vec![(b"2025/01-03T00:00".to_vec(), b"2025/01-09T00:00".to_vec())],
        )
        .unwrap();
        log.record_checked(
            &main,
            CheckKind::Contents,
            time,
            vec![(vec![0x00; 32], vec![0xff; 32])],
        )
        .unwrap();

        let entries = log.read_checked().unwrap();
        assert_eq!(entries.len(), 2);

        let backups = entries
            .iter()
            .find(|e| e.kind == CheckKind::Backups)
            .unwrap();
        // overlapping ranges were coalesced on write
        assert_eq!(
            backups.ranges,
            vec![(b"2025/01-01T00:00".to_vec(), b"2025/01-09T00:00".to_vec())]
        );
        assert_eq!(backups.time, time);

        let contents = entries
            .iter()
            .find(|e| e.kind == CheckKind::Contents)
            .unwrap();
        assert_eq!(contents.ranges.len(), 1);
    }

    #[test]
    fn test_issue_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_storage(dir.path());
        let log = storage.check_log();
        let main = storage.lock_main_shared().unwrap();

        let content_issue = IssueEntry::Content {
            cid: vec![0x42; 32],
            events: vec![
                ChangeEvent {
                    before: stamp(1735787045),
                    after: stamp(1735787105),
                    state: ChangeState::WrongChecksum(vec![0x43; 32]),
                },
                ChangeEvent {
                    before: stamp(1735787105),
                    after: None,
                    state: ChangeState::Missing,
                },
            ],
        };
        log.upsert_issue(&main, content_issue.clone()).unwrap();

        let snapshot_issue = IssueEntry::Snapshot {
            name: b"2025/01-02T03:04".to_vec(),
            events: vec![SnapshotChangeEvent {
                before: None,
                after: stamp(1735787045),
                rewritten: false,
                details: SnapshotDetails::Blocks {
                    healthy: vec![4, 2],
                    logical_bad: vec![],
                    missing_cids: vec![vec![0x99; 32]],
                    checksum_bad: vec![7],
                },
            }],
        };
        log.upsert_issue(&main, snapshot_issue.clone()).unwrap();

        let read = log.read_issues().unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(
            log.lookup_content_issue(&[0x42; 32]).unwrap().unwrap(),
            content_issue
        );

        // block index lists come back sorted
        match log
            .lookup_snapshot_issue(b"2025/01-02T03:04")
            .unwrap()
            .unwrap()
        {
            IssueEntry::Snapshot { events, .. } => match &events[0].details {
                SnapshotDetails::Blocks {
                    healthy,
                    missing_cids,
                    checksum_bad,
                    ..
                } => {
                    assert_eq!(healthy, &vec![2, 4]);
                    assert_eq!(missing_cids, &vec![vec![0x99; 32]]);
                    assert_eq!(checksum_bad, &vec![7]);
                }
                other => panic!("unexpected details {:?}", other),
            },
            other => panic!("unexpected entry {:?}", other),
        }

        let whole_bad = IssueEntry::Snapshot {
            name: b"2025/01-03T00:00".to_vec(),
            events: vec![SnapshotChangeEvent {
                before: stamp(1),
                after: stamp(2),
                rewritten: true,
                details: SnapshotDetails::WholeFileBad,
            }],
        };
        log.upsert_issue(&main, whole_bad.clone()).unwrap();
        assert_eq!(
            log.lookup_snapshot_issue(b"2025/01-03T00:00").unwrap(),
            Some(whole_bad)
        );
    }

    #[test]
    fn test_upsert_keeps_one_entry_per_item() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_storage(dir.path());
        let log = storage.check_log();
        let main = storage.lock_main_shared().unwrap();

        let mut issue = IssueEntry::Content {
            cid: vec![0x11; 32],
            events: vec![ChangeEvent {
                before: None,
                after: stamp(100),
                state: ChangeState::Missing,
            }],
        };
        log.upsert_issue(&main, issue.clone()).unwrap();

        if let IssueEntry::Content { events, .. } = &mut issue {
            events.push(ChangeEvent {
                before: stamp(100),
                after: stamp(200),
                state: ChangeState::ChecksumOnly,
            });
        }
        log.upsert_issue(&main, issue.clone()).unwrap();

        let all = log.read_issues().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], issue);
    }

    #[test]
    fn test_upsert_spills_when_block_overflows() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_storage(dir.path());
        let log = storage.check_log();
        let main = storage.lock_main_shared().unwrap();

        // fill the first data block nearly to capacity with two large
        // entries, then grow the first one so it no longer fits
        let big_events = |n: usize| -> Vec<ChangeEvent> {
            (0..n)
                .map(|i| ChangeEvent {
                    before: stamp(i as i64 + 1),
                    after: stamp(i as i64 + 2),
                    state: ChangeState::WrongChecksum(vec![i as u8; 32]),
                })
                .collect()
        };

        let first = IssueEntry::Content {
            cid: vec![0x01; 32],
            events: big_events(40),
        };
        let second = IssueEntry::Content {
            cid: vec![0x02; 32],
            events: big_events(40),
        };
        log.upsert_issue(&main, first).unwrap();
        log.upsert_issue(&main, second.clone()).unwrap();

        let grown = IssueEntry::Content {
            cid: vec![0x01; 32],
            events: big_events(60),
        };
        log.upsert_issue(&main, grown.clone()).unwrap();

        let all = log.read_issues().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&grown));
        assert!(all.contains(&second));
    }
}
