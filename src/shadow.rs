//! Shadow trees: a directory of hard links into the object store,
//! materialized from one snapshot. Uses read-only storage access; the
//! object bodies are shared, not copied.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use ebakup_datastore::manifest::FileType;
use ebakup_datastore::Storage;

#[derive(Default, Debug)]
pub struct ShadowStats {
    pub linked: u64,
    pub recreated: u64,
    pub skipped: u64,
}

/// Materialize snapshot `name` as a tree of hard links under `target`.
///
/// Regular files become hard links to their object bodies; symlinks and
/// fifos are recreated from their manifest records; other special files
/// are skipped with a warning.
pub fn shadow_copy(storage: &Storage, name: &str, target: &Path) -> Result<ShadowStats, Error> {
    let manifest = storage.snapshot(name)?;

    if target.exists() {
        let mut entries =
            std::fs::read_dir(target).map_err(|err| format_err!("unable to read {:?} - {}", target, err))?;
        if entries.next().is_some() {
            bail!("shadow target {:?} exists and is not empty", target);
        }
    } else {
        ebakup_tools::fs::create_path(target)?;
    }

    // parents have smaller ids, so id order creates parents first
    let mut dirs: Vec<_> = manifest.directories().collect();
    dirs.sort_by_key(|d| d.dirid);

    let mut dir_paths: HashMap<u64, PathBuf> = HashMap::new();
    dir_paths.insert(0, target.to_owned());
    for dir in dirs {
        let parent = dir_paths
            .get(&dir.parent)
            .ok_or_else(|| format_err!("directory {} has unmaterialized parent", dir.dirid))?;
        let path = parent.join(OsStr::from_bytes(&dir.name));
        ebakup_tools::fs::create_dir(&path)?;
        dir_paths.insert(dir.dirid, path);
    }

    let mut stats = ShadowStats::default();
    for file in manifest.files() {
        let parent = dir_paths
            .get(&file.parent)
            .ok_or_else(|| format_err!("file parent {} is not materialized", file.parent))?;
        let path = parent.join(OsStr::from_bytes(&file.name));

        match file.file_type {
            FileType::Regular => {
                let object = storage.content_store().object_path(&file.cid);
                std::fs::hard_link(&object, &path)
                    .map_err(|err| format_err!("unable to link {:?} - {}", path, err))?;
                stats.linked += 1;
            }
            FileType::Symlink => {
                let mut link_target = Vec::new();
                storage
                    .content_store()
                    .open_object(&file.cid)?
                    .read_to_end(&mut link_target)
                    .map_err(|err| format_err!("unable to read link body - {}", err))?;
                std::os::unix::fs::symlink(OsStr::from_bytes(&link_target), &path)
                    .map_err(|err| format_err!("unable to create symlink {:?} - {}", path, err))?;
                stats.recreated += 1;
            }
            FileType::Pipe => {
                nix::unistd::mkfifo(path.as_path(), nix::sys::stat::Mode::from_bits_truncate(0o644))
                    .map_err(|err| format_err!("unable to create fifo {:?} - {}", path, err))?;
                stats.recreated += 1;
            }
            other => {
                log::warn!(
                    "skipping special file {:?} (type {:?})",
                    String::from_utf8_lossy(&file.name),
                    other
                );
                stats.skipped += 1;
            }
        }
    }

    Ok(stats)
}
