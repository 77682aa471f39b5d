//! The backup driver: walks source directories and feeds the storage
//! engine. The walker is deliberately thin; every invariant (dedup,
//! durability ordering, atomic finalization) is enforced by the engine.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use ebakup_datastore::manifest::{FileType, EXTRA_GROUP, EXTRA_OWNER, EXTRA_UNIX_ACCESS};
use ebakup_datastore::timestamp::Mtime;
use ebakup_datastore::Storage;

#[derive(Default, Debug)]
pub struct BackupStats {
    pub files: u64,
    pub directories: u64,
    pub special_files: u64,
    pub bytes: u64,
}

/// Back up `sources` into one new snapshot, returning its name.
///
/// Each source directory becomes a top-level directory in the snapshot,
/// named after its final path component.
pub fn run_backup(
    storage: &Storage,
    sources: &[PathBuf],
    start_time: i64,
) -> Result<(String, BackupStats), Error> {
    let mut builder = storage.start_snapshot(start_time)?;
    let mut stats = BackupStats::default();

    for source in sources {
        let source = source
            .canonicalize()
            .map_err(|err| format_err!("unable to resolve {:?} - {}", source, err))?;
        let top_name = source
            .file_name()
            .ok_or_else(|| format_err!("source {:?} has no name component", source))?;

        let top_dirid = builder.ensure_directory(0, top_name.as_bytes())?;
        let mut dir_ids: HashMap<PathBuf, u64> = HashMap::new();
        dir_ids.insert(PathBuf::new(), top_dirid);

        for entry in walkdir::WalkDir::new(&source)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|err| format_err!("walking {:?} - {}", source, err))?;
            let rel = entry
                .path()
                .strip_prefix(&source)
                .map_err(|_| format_err!("entry {:?} outside {:?}", entry.path(), source))?;

            let parent = match rel.parent() {
                Some(parent) => *dir_ids
                    .get(parent)
                    .ok_or_else(|| format_err!("missing parent directory for {:?}", rel))?,
                None => top_dirid,
            };
            let name = entry.file_name().as_bytes();
            let metadata = entry
                .metadata()
                .map_err(|err| format_err!("unable to stat {:?} - {}", entry.path(), err))?;

            if metadata.is_dir() {
                let extra = builder.intern_extra(&metadata_extras(&metadata));
                let dirid = builder.add_directory(parent, name, extra)?;
                dir_ids.insert(rel.to_owned(), dirid);
                stats.directories += 1;
                continue;
            }

            let extra = builder.intern_extra(&metadata_extras(&metadata));
            let mtime = mtime_of(&metadata);

            if metadata.file_type().is_symlink() {
                // the link target is stored as the file content
                let target = std::fs::read_link(entry.path())
                    .map_err(|err| format_err!("unable to read link {:?} - {}", entry.path(), err))?;
                let target = target.as_os_str().as_bytes().to_vec();
                let cid = storage.add_content(&mut &target[..])?;
                builder.add_file(
                    parent,
                    name,
                    &cid,
                    target.len() as u64,
                    mtime,
                    extra,
                    FileType::Symlink,
                )?;
                stats.special_files += 1;
            } else if metadata.is_file() {
                let mut file = File::open(entry.path())
                    .map_err(|err| format_err!("unable to open {:?} - {}", entry.path(), err))?;
                let cid = storage.add_content(&mut file)?;
                builder.add_file(parent, name, &cid, metadata.len(), mtime, extra, FileType::Regular)?;
                stats.files += 1;
                stats.bytes += metadata.len();
            } else {
                let file_type = special_file_type(&metadata);
                builder.add_file(parent, name, b"", 0, mtime, extra, file_type)?;
                stats.special_files += 1;
            }
        }
    }

    if builder.file_count() == 0 {
        log::warn!("backup contains no files");
    }

    let end_time = epoch_now();
    let path = builder.finalize(end_time.max(start_time))?;
    let name = snapshot_name_of(&path)?;
    log::info!("created snapshot {}", name);
    Ok((name, stats))
}

pub fn epoch_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn snapshot_name_of(path: &Path) -> Result<String, Error> {
    let file = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| format_err!("snapshot path {:?} has no name", path))?;
    let year = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .ok_or_else(|| format_err!("snapshot path {:?} has no year directory", path))?;
    Ok(format!("{}/{}", year, file))
}

fn mtime_of(metadata: &std::fs::Metadata) -> Mtime {
    let mtime = metadata.mtime();
    let nanos = metadata.mtime_nsec().clamp(0, 999_999_999) as u32;
    Mtime::from_epoch(mtime, nanos).unwrap_or(Mtime::UNKNOWN)
}

fn special_file_type(metadata: &std::fs::Metadata) -> FileType {
    let file_type = metadata.file_type();
    if file_type.is_fifo() {
        FileType::Pipe
    } else if file_type.is_socket() {
        FileType::Socket
    } else if file_type.is_block_device() || file_type.is_char_device() {
        FileType::Device
    } else {
        FileType::Unknown
    }
}

fn metadata_extras(metadata: &std::fs::Metadata) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut pairs = Vec::with_capacity(3);
    if let Ok(Some(user)) = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(metadata.uid()))
    {
        pairs.push((EXTRA_OWNER.to_vec(), user.name.into_bytes()));
    }
    if let Ok(Some(group)) =
        nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(metadata.gid()))
    {
        pairs.push((EXTRA_GROUP.to_vec(), group.name.into_bytes()));
    }
    pairs.push((
        EXTRA_UNIX_ACCESS.to_vec(),
        format!("{:04o}", metadata.mode() & 0o7777).into_bytes(),
    ));
    pairs
}

/// Validate that a user-supplied source list is usable before any `.new`
/// file is claimed.
pub fn check_sources(sources: &[PathBuf]) -> Result<(), Error> {
    if sources.is_empty() {
        bail!("no source directories given");
    }
    for source in sources {
        if !source.is_dir() {
            bail!("source {:?} is not a directory", source);
        }
    }
    Ok(())
}
