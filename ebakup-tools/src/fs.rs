use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

/// Create a directory, ignoring `EEXIST`.
///
/// Returns `true` if the directory was created by this call.
pub fn create_dir(path: &Path) -> Result<bool, Error> {
    match std::fs::create_dir(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            if !path.is_dir() {
                bail!("path {:?} exists but is not a directory", path);
            }
            Ok(false)
        }
        Err(err) => bail!("unable to create directory {:?} - {}", path, err),
    }
}

/// Create a directory and all missing parents, ignoring existing ones.
pub fn create_path(path: &Path) -> Result<(), Error> {
    std::fs::create_dir_all(path)
        .map_err(|err| format_err!("unable to create path {:?} - {}", path, err))
}

/// Fsync an open file.
pub fn fsync_file(file: &File) -> Result<(), Error> {
    nix::unistd::fsync(file.as_raw_fd()).map_err(|err| format_err!("fsync failed - {}", err))?;
    Ok(())
}

/// Fsync a directory handle, persisting renames and creations inside it.
pub fn fsync_dir(path: &Path) -> Result<(), Error> {
    let dir = File::open(path)
        .map_err(|err| format_err!("unable to open directory {:?} - {}", path, err))?;
    nix::unistd::fsync(dir.as_raw_fd())
        .map_err(|err| format_err!("fsync on {:?} failed - {}", path, err))?;
    Ok(())
}

/// Name of the temporary sibling used by [replace_file].
fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(&format!(".tmp_{}", std::process::id()));
    name.into()
}

/// Atomically replace the contents of a file.
///
/// Writes a temporary sibling, optionally fsyncs it, then renames it over
/// the target. The target either keeps its old contents or has the new ones,
/// never a mix.
pub fn replace_file(path: &Path, data: &[u8], fsync: bool) -> Result<(), Error> {
    let tmp_path = tmp_sibling(path);

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp_path)
        .map_err(|err| format_err!("unable to create {:?} - {}", tmp_path, err))?;

    let result = file
        .write_all(data)
        .map_err(Error::from)
        .and_then(|()| if fsync { fsync_file(&file) } else { Ok(()) })
        .and_then(|()| {
            std::fs::rename(&tmp_path, path)
                .map_err(|err| format_err!("atomic rename to {:?} failed - {}", path, err))
        });

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }

    result
}

/// Open a file with exclusive creation, failing if it already exists.
pub fn create_new(path: &Path) -> Result<File, std::io::Error> {
    OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .open(path)
}

/// Age of a file in seconds, measured against its mtime.
pub fn file_age_secs(path: &Path) -> Result<u64, Error> {
    let metadata = std::fs::metadata(path)
        .map_err(|err| format_err!("unable to stat {:?} - {}", path, err))?;
    let mtime = metadata
        .modified()
        .map_err(|err| format_err!("no mtime for {:?} - {}", path, err))?;
    Ok(mtime.elapsed().map(|d| d.as_secs()).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_file() {
        let dir = std::env::temp_dir().join(format!("ebakup-fs-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        create_path(&dir).unwrap();

        let target = dir.join("data");
        replace_file(&target, b"first", false).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"first");

        replace_file(&target, b"second", true).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"second");

        // the temporary sibling must not survive
        assert!(!tmp_sibling(&target).exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
