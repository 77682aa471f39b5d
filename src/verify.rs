//! Storage-wide verification: every block of every database file is
//! checksum-checked, every object body is re-digested, and every manifest
//! reference is resolved against the content index. Verdicts are recorded
//! in the verification log.

use anyhow::Error;

use ebakup_datastore::block_file::BlockFileReader;
use ebakup_datastore::check_log::{
    ChangeEvent, ChangeState, CheckKind, IssueEntry, SnapshotChangeEvent, SnapshotDetails,
};
use ebakup_datastore::timestamp::CheckStamp;
use ebakup_datastore::{ObjectVerdict, Storage};

use crate::backup::epoch_now;

/// Hard cap on missing-CID records per history event; overflow is logged.
const MAX_MISSING_CIDS_PER_EVENT: usize = 64;

#[derive(Default, Debug)]
pub struct VerifyStats {
    pub corrupt_blocks: u64,
    pub objects_checked: u64,
    pub objects_missing: u64,
    pub objects_bad: u64,
    pub snapshots_checked: u64,
    pub snapshots_bad: u64,
    pub missing_cids: u64,
}

impl VerifyStats {
    pub fn is_clean(&self) -> bool {
        self.corrupt_blocks == 0
            && self.objects_missing == 0
            && self.objects_bad == 0
            && self.snapshots_bad == 0
            && self.missing_cids == 0
    }
}

pub fn verify_storage(storage: &Storage) -> Result<VerifyStats, Error> {
    let now = CheckStamp::from_epoch(epoch_now())?;
    let log = storage.check_log();
    let main = storage.lock_main_shared()?;
    let mut stats = VerifyStats::default();

    // plain container files without per-item histories
    for name in ["main", "lastcheck", "issues"] {
        let path = storage.db_path(name);
        if !path.exists() {
            continue;
        }
        match BlockFileReader::open(&path) {
            Ok(reader) => {
                for (index, block) in reader.data_blocks()? {
                    if let Err(err) = block {
                        log::error!("corrupt block {} in {:?}: {}", index, path, err);
                        stats.corrupt_blocks += 1;
                    }
                }
            }
            Err(err) => {
                log::error!("unable to open {:?}: {}", path, err);
                stats.corrupt_blocks += 1;
            }
        }
    }

    // objects, driven by the content index
    let index = storage.content_index()?;
    let mut first_cid: Option<Vec<u8>> = None;
    let mut last_cid: Option<Vec<u8>> = None;

    for entry in index.iterate()? {
        let info = match entry {
            Ok(info) => info,
            Err(err) => {
                log::error!("content index: {}", err);
                stats.corrupt_blocks += 1;
                continue;
            }
        };

        stats.objects_checked += 1;
        if first_cid.as_ref().map(|c| info.cid < *c).unwrap_or(true) {
            first_cid = Some(info.cid.clone());
        }
        if last_cid.as_ref().map(|c| info.cid > *c).unwrap_or(true) {
            last_cid = Some(info.cid.clone());
        }

        let verdict =
            storage
                .content_store()
                .verify_object(&info.cid, &info.checksum, storage.checksum_kind())?;

        let prior_events = match log.lookup_content_issue(&info.cid)? {
            Some(IssueEntry::Content { events, .. }) => events,
            _ => Vec::new(),
        };
        let before = prior_events.last().and_then(|e| e.after);

        let new_state = match verdict {
            ObjectVerdict::Good => {
                // only worth recording when the object has a history of
                // trouble; `k` = checksum correct, provenance uncertain
                match prior_events.last().map(|e| &e.state) {
                    Some(ChangeState::Missing) | Some(ChangeState::WrongChecksum(_)) => {
                        Some(ChangeState::ChecksumOnly)
                    }
                    _ => None,
                }
            }
            ObjectVerdict::Missing => {
                stats.objects_missing += 1;
                log::error!("object {} is missing", hex::encode(&info.cid));
                match prior_events.last().map(|e| &e.state) {
                    Some(ChangeState::Missing) => None,
                    _ => Some(ChangeState::Missing),
                }
            }
            ObjectVerdict::Mismatch(actual) => {
                stats.objects_bad += 1;
                log::error!("object {} fails its checksum", hex::encode(&info.cid));
                match prior_events.last().map(|e| &e.state) {
                    Some(ChangeState::WrongChecksum(seen)) if *seen == actual => None,
                    _ => Some(ChangeState::WrongChecksum(actual)),
                }
            }
        };

        if let Some(state) = new_state {
            let mut events = prior_events;
            events.push(ChangeEvent {
                before,
                after: Some(now),
                state,
            });
            log.upsert_issue(
                &main,
                IssueEntry::Content {
                    cid: info.cid.clone(),
                    events,
                },
            )?;
        }
    }

    if let (Some(first), Some(last)) = (first_cid, last_cid) {
        log.record_checked(&main, CheckKind::Contents, Some(now), vec![(first, last)])?;
    }

    // snapshot manifests
    let snapshots = storage.snapshots()?;
    for info in &snapshots {
        stats.snapshots_checked += 1;
        verify_snapshot(storage, &log, &main, &index, &info.name, now, &mut stats)?;
    }
    if let (Some(first), Some(last)) = (snapshots.first(), snapshots.last()) {
        log.record_checked(
            &main,
            CheckKind::Backups,
            Some(now),
            vec![(first.name.clone().into_bytes(), last.name.clone().into_bytes())],
        )?;
    }

    Ok(stats)
}

fn verify_snapshot(
    storage: &Storage,
    log: &ebakup_datastore::check_log::CheckLog,
    main: &ebakup_datastore::storage::MainLockGuard,
    index: &ebakup_datastore::ContentIndex,
    name: &str,
    now: CheckStamp,
    stats: &mut VerifyStats,
) -> Result<(), Error> {
    let path = storage.db_path(name);

    let prior_events = match log.lookup_snapshot_issue(name.as_bytes())? {
        Some(IssueEntry::Snapshot { events, .. }) => events,
        _ => Vec::new(),
    };
    let before = prior_events.last().and_then(|e| e.after);
    let previously_bad: Vec<u64> = match prior_events.last().map(|e| &e.details) {
        Some(SnapshotDetails::Blocks {
            logical_bad,
            checksum_bad,
            ..
        }) => {
            let mut bad = checksum_bad.clone();
            bad.extend_from_slice(logical_bad);
            bad
        }
        _ => Vec::new(),
    };

    let mut checksum_bad: Vec<u64> = Vec::new();
    let mut whole_file_bad = false;
    let mut missing_cids: Vec<Vec<u8>> = Vec::new();

    match BlockFileReader::open(&path) {
        Ok(reader) => {
            for (idx, block) in reader.data_blocks()? {
                if block.is_err() {
                    checksum_bad.push(idx);
                }
            }
        }
        Err(err) => {
            log::error!("snapshot {} is unreadable: {}", name, err);
            whole_file_bad = true;
        }
    }
    stats.corrupt_blocks += checksum_bad.len() as u64;

    if !whole_file_bad && checksum_bad.is_empty() {
        match storage.snapshot(name) {
            Ok(manifest) => {
                let mut missing_here = 0usize;
                for cid in manifest.referenced_cids() {
                    if index.lookup(&cid)?.is_none() {
                        missing_here += 1;
                        stats.missing_cids += 1;
                        log::error!(
                            "snapshot {} references missing content {}",
                            name,
                            hex::encode(&cid)
                        );
                        if missing_cids.len() < MAX_MISSING_CIDS_PER_EVENT {
                            missing_cids.push(cid);
                        }
                    }
                }
                if missing_here > missing_cids.len() {
                    log::warn!(
                        "snapshot {}: only {} of {} missing references were recorded",
                        name,
                        missing_cids.len(),
                        missing_here
                    );
                }
            }
            Err(err) => {
                // all block checksums pass, so the damage is logical
                log::error!("snapshot {} does not parse: {}", name, err);
                whole_file_bad = true;
            }
        }
    }

    let healthy: Vec<u64> = previously_bad
        .iter()
        .copied()
        .filter(|idx| !checksum_bad.contains(idx))
        .collect();

    let found_problem = whole_file_bad || !checksum_bad.is_empty() || !missing_cids.is_empty();
    if found_problem {
        stats.snapshots_bad += 1;
    }

    // an event is recorded for new trouble and for recoveries of a
    // previously-bad snapshot
    if !found_problem && (prior_events.is_empty() || (previously_bad.is_empty() && healthy.is_empty()))
    {
        let recovered = matches!(
            prior_events.last().map(|e| &e.details),
            Some(SnapshotDetails::WholeFileBad)
        );
        if !recovered {
            return Ok(());
        }
    }

    let details = if whole_file_bad {
        SnapshotDetails::WholeFileBad
    } else {
        SnapshotDetails::Blocks {
            healthy,
            logical_bad: Vec::new(),
            missing_cids,
            checksum_bad,
        }
    };

    let mut events = prior_events;
    events.push(SnapshotChangeEvent {
        before,
        after: Some(now),
        rewritten: false,
        details,
    });
    log.upsert_issue(
        main,
        IssueEntry::Snapshot {
            name: name.as_bytes().to_vec(),
            events,
        },
    )?;

    Ok(())
}
