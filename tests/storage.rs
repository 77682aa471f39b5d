use std::io::Read;
use std::path::Path;

use ebakup::backup::run_backup;
use ebakup::shadow::shadow_copy;
use ebakup::sync::sync_storages;
use ebakup::verify::verify_storage;
use ebakup_datastore::error::is_store_error;
use ebakup_datastore::manifest::FileType;
use ebakup_datastore::timestamp::Mtime;
use ebakup_datastore::{ChecksumKind, ManifestEntry, Storage, StoreError};

const T1: i64 = 1735787045; // 2025-01-02T03:04:05
const T2: i64 = 1735787045 + 3600;

fn add_file(
    storage: &Storage,
    builder: &mut ebakup_datastore::ManifestBuilder,
    name: &[u8],
    body: &[u8],
    time: i64,
) -> Vec<u8> {
    let cid = storage.add_content(&mut &body[..]).unwrap();
    builder
        .add_file(
            0,
            name,
            &cid,
            body.len() as u64,
            Mtime::from_epoch(time, 0).unwrap(),
            0,
            FileType::Regular,
        )
        .unwrap();
    cid
}

#[test]
fn test_create_storage_and_first_backup() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("storage");
    let storage = Storage::create(&root).unwrap();

    // the database identifies itself in its first block
    let main = std::fs::read(root.join("db/main")).unwrap();
    assert!(main.starts_with(b"ebakup database v1\n"));
    assert!(main.len() % 4096 == 0);

    let mut builder = storage.start_snapshot(T1).unwrap();
    let cid_a = add_file(&storage, &mut builder, b"a.txt", b"hello", T1);
    let cid_b = add_file(&storage, &mut builder, b"b.txt", b"world", T1);
    assert_ne!(cid_a, cid_b);
    builder.finalize(T1 + 10).unwrap();

    let snapshots = storage.snapshots().unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].name, "2025/01-02T03:04");
    assert_eq!(snapshots[0].start_time, T1);

    let manifest = storage.snapshot("2025/01-02T03:04").unwrap();
    assert_eq!(manifest.start_time().unwrap(), T1);
    assert_eq!(manifest.end_time().unwrap(), T1 + 10);

    match manifest.lookup(0, b"a.txt") {
        Some(ManifestEntry::File(f)) => {
            assert_eq!(f.cid, cid_a);
            assert_eq!(f.size, 5);
        }
        other => panic!("unexpected entry {:?}", other),
    }

    // both objects are indexed with an insertion timestamp
    let index = storage.content_index().unwrap();
    let entries: Vec<_> = index.iterate().unwrap().map(|e| e.unwrap()).collect();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.added_at() > 0));
    assert!(entries.iter().any(|e| e.cid == cid_a));
    assert!(entries.iter().any(|e| e.cid == cid_b));
}

fn count_files(dir: &Path) -> usize {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count()
}

#[test]
fn test_deduplication_stores_one_body() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("storage");
    let storage = Storage::create(&root).unwrap();

    let body = vec![0xabu8; 1024 * 1024];
    let mut builder = storage.start_snapshot(T1).unwrap();
    let cid_a = add_file(&storage, &mut builder, b"one.bin", &body, T1);
    let cid_b = add_file(&storage, &mut builder, b"two.bin", &body, T1);
    builder.finalize(T1 + 1).unwrap();

    assert_eq!(cid_a, cid_b);

    let index = storage.content_index().unwrap();
    assert_eq!(index.iterate().unwrap().count(), 1);
    assert_eq!(count_files(&root.join("content")), 1);
}

#[test]
fn test_single_block_corruption_is_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("storage");
    let storage = Storage::create(&root).unwrap();

    // enough index entries to span several data blocks
    for i in 0..120u32 {
        let body = i.to_le_bytes();
        storage.add_content(&mut &body[..]).unwrap();
    }
    let content_path = root.join("db/content");
    let blocks = std::fs::read(&content_path).unwrap().len() / 4096;
    assert!(blocks > 2, "expected several blocks, got {}", blocks);

    // flip one bit in data block 1
    let mut raw = std::fs::read(&content_path).unwrap();
    raw[4096 + 200] ^= 0x01;
    std::fs::write(&content_path, &raw).unwrap();

    // opening stays lazy; iteration reports exactly the damaged block
    let index = storage.content_index().unwrap();
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
fn test_sync_mirrors_missing_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let root_a = dir.path().join("a");
    let root_b = dir.path().join("b");

    let a = Storage::create(&root_a).unwrap();
    let mut builder = a.start_snapshot(T1).unwrap();
    add_file(&a, &mut builder, b"a.txt", b"first snapshot", T1);
    builder.finalize(T1 + 1).unwrap();

    // first sync creates B with T1
    let stats = sync_storages(&root_a, &root_b).unwrap();
    assert_eq!(stats.snapshots_copied, 1);
    assert_eq!(stats.objects_copied, 1);

    let mut builder = a.start_snapshot(T2).unwrap();
    add_file(&a, &mut builder, b"b.txt", b"second snapshot", T2);
    add_file(&a, &mut builder, b"a.txt", b"first snapshot", T2); // deduped
    builder.finalize(T2 + 1).unwrap();

    let before_sync = std::fs::read(root_a.join("db/2025/01-02T03:04")).unwrap();

    let stats = sync_storages(&root_a, &root_b).unwrap();
    assert_eq!(stats.snapshots_copied, 1);
    assert_eq!(stats.objects_copied, 1);
    assert_eq!(stats.objects_present, 1);

    let b = Storage::open(&root_b).unwrap();
    let names: Vec<String> = b.snapshots().unwrap().into_iter().map(|i| i.name).collect();
    assert_eq!(names, vec!["2025/01-02T03:04", "2025/01-02T04:04"]);

    // manifests are byte-identical between the storages
    for name in &names {
        let manifest_a = std::fs::read(root_a.join("db").join(name)).unwrap();
        let manifest_b = std::fs::read(root_b.join("db").join(name)).unwrap();
        assert_eq!(manifest_a, manifest_b, "manifest {} differs", name);
    }

    // every referenced cid is present in B
    let index_b = b.content_index().unwrap();
    for name in &names {
        for cid in b.snapshot(name).unwrap().referenced_cids() {
            assert!(index_b.lookup(&cid).unwrap().is_some());
        }
    }

    // the source is unchanged
    assert_eq!(
        std::fs::read(root_a.join("db/2025/01-02T03:04")).unwrap(),
        before_sync
    );

    // a third run finds nothing to do
    let stats = sync_storages(&root_a, &root_b).unwrap();
    assert_eq!(stats.snapshots_copied, 0);
}

#[test]
fn test_concurrent_snapshot_creation() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::create(&dir.path().join("storage")).unwrap();

    let builder = storage.start_snapshot(T1).unwrap();
    let err = storage.start_snapshot(T1).unwrap_err();
    assert!(is_store_error(&err, |e| matches!(
        e,
        StoreError::ConcurrentWriter { .. } | StoreError::AlreadyExists { .. }
    )));

    // no partial manifest became visible
    assert!(storage.snapshots().unwrap().is_empty());
    drop(builder);
    assert!(!dir
        .path()
        .join("storage/db/2025/01-02T03:04.new")
        .exists());
}

#[test]
fn test_backup_verify_and_shadow_copy() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("storage");
    let storage = Storage::create(&root).unwrap();

    // a small source tree with a subdirectory and a symlink
    let source = dir.path().join("data");
    std::fs::create_dir_all(source.join("sub")).unwrap();
    std::fs::write(source.join("top.txt"), b"top file").unwrap();
    std::fs::write(source.join("sub/inner.txt"), b"inner file").unwrap();
    std::os::unix::fs::symlink("top.txt", source.join("link")).unwrap();

    let (name, stats) = run_backup(&storage, &[source.clone()], T1).unwrap();
    assert_eq!(name, "2025/01-02T03:04");
    assert_eq!(stats.files, 2);
    assert_eq!(stats.directories, 1);
    assert_eq!(stats.special_files, 1);

    // the manifest records ownership extras for regular files
    let manifest = storage.snapshot(&name).unwrap();
    let data_dir = match manifest.lookup(0, b"data") {
        Some(ManifestEntry::Directory(d)) => d.dirid,
        other => panic!("unexpected entry {:?}", other),
    };
    match manifest.lookup(data_dir, b"top.txt") {
        Some(ManifestEntry::File(f)) => {
            let pairs = manifest.extra_pairs(f.extra).unwrap();
            assert!(pairs.iter().any(|(k, _)| *k == b"unix-access"));
        }
        other => panic!("unexpected entry {:?}", other),
    }

    // a fresh storage verifies clean
    let stats = verify_storage(&storage).unwrap();
    assert!(stats.is_clean());
    assert_eq!(stats.objects_checked, 3);
    assert!(!storage.check_log().read_checked().unwrap().is_empty());

    // shadow copy materializes the tree with shared bodies
    let shadow = dir.path().join("shadow");
    let stats = shadow_copy(&storage, &name, &shadow).unwrap();
    assert_eq!(stats.linked, 2);
    assert_eq!(stats.recreated, 1);

    let mut body = String::new();
    std::fs::File::open(shadow.join("data/top.txt"))
        .unwrap()
        .read_to_string(&mut body)
        .unwrap();
    assert_eq!(body, "top file");
    assert_eq!(
        std::fs::read_link(shadow.join("data/link")).unwrap(),
        Path::new("top.txt")
    );

    // hard links share the inode with the object store
    let object = storage
        .content_store()
        .object_path(&ChecksumKind::Sha256.digest(b"top file"));
    let meta_obj = std::fs::metadata(&object).unwrap();
    let meta_shadow = std::fs::metadata(shadow.join("data/top.txt")).unwrap();
    assert_eq!(
        std::os::unix::fs::MetadataExt::ino(&meta_obj),
        std::os::unix::fs::MetadataExt::ino(&meta_shadow)
    );
}

#[test]
fn test_verify_reports_missing_and_tampered_objects() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("storage");
    let storage = Storage::create(&root).unwrap();

    let cid_keep = storage.add_content(&mut &b"keep me"[..]).unwrap();
    let cid_gone = storage.add_content(&mut &b"lose me"[..]).unwrap();
    let cid_bad = storage.add_content(&mut &b"bend me"[..]).unwrap();

    std::fs::remove_file(storage.content_store().object_path(&cid_gone)).unwrap();
    std::fs::write(storage.content_store().object_path(&cid_bad), b"tampered").unwrap();

    let stats = verify_storage(&storage).unwrap();
    assert!(!stats.is_clean());
    assert_eq!(stats.objects_missing, 1);
    assert_eq!(stats.objects_bad, 1);

    let log = storage.check_log();
    assert!(log.lookup_content_issue(&cid_gone).unwrap().is_some());
    assert!(log.lookup_content_issue(&cid_bad).unwrap().is_some());
    assert!(log.lookup_content_issue(&cid_keep).unwrap().is_none());

    // restore the tampered body; the next verify records the recovery
    std::fs::write(storage.content_store().object_path(&cid_bad), b"bend me").unwrap();
    verify_storage(&storage).unwrap();
    match log.lookup_content_issue(&cid_bad).unwrap().unwrap() {
        ebakup_datastore::check_log::IssueEntry::Content { events, .. } => {
            assert_eq!(events.len(), 2);
            assert_eq!(
                events.last().unwrap().state,
                ebakup_datastore::check_log::ChangeState::ChecksumOnly
            );
        }
        other => panic!("unexpected issue entry {:?}", other),
    }
}
