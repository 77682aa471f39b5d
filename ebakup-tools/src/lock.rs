use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Error};
use nix::fcntl::{flock, FlockArg};

/// An advisory lock on a database file.
///
/// The lock is tied to the open file descriptor and released on drop. After
/// acquisition, callers racing with atomic-replace writers must call
/// [FileLock::verify_current] before trusting the file contents.
pub struct FileLock {
    file: File,
    path: PathBuf,
    exclusive: bool,
}

impl FileLock {
    /// Take a shared (read) lock.
    pub fn shared(path: &Path, timeout: Duration) -> Result<Self, Error> {
        Self::lock(path, timeout, false)
    }

    /// Take an exclusive (write) lock.
    pub fn exclusive(path: &Path, timeout: Duration) -> Result<Self, Error> {
        Self::lock(path, timeout, true)
    }

    fn lock(path: &Path, timeout: Duration, exclusive: bool) -> Result<Self, Error> {
        let file = match OpenOptions::new().read(true).write(exclusive).open(path) {
            Ok(file) => file,
            Err(err) => bail!("unable to open lock target {:?} - {}", path, err),
        };

        let flags = if exclusive {
            FlockArg::LockExclusiveNonblock
        } else {
            FlockArg::LockSharedNonblock
        };

        let fd = file.as_raw_fd();
        let started = std::time::Instant::now();
        let mut logged = false;
        loop {
            match flock(fd, flags) {
                Ok(()) => break,
                Err(nix::errno::Errno::EWOULDBLOCK) | Err(nix::errno::Errno::EINTR) => {
                    if !logged {
                        logged = true;
                        log::info!("waiting for lock on {:?}", path);
                    }
                }
                Err(err) => bail!("flock on {:?} failed - {}", path, err),
            }

            if started.elapsed() >= timeout {
                bail!("unable to acquire lock on {:?} - got timeout", path);
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        Ok(Self {
            file,
            path: path.to_owned(),
            exclusive,
        })
    }

    /// Check that the locked fd still names the current directory entry.
    ///
    /// A writer may have atomically replaced the file between our open and
    /// our lock. Returns `false` when the path now points at a different
    /// inode (or no longer exists), in which case the caller must drop this
    /// lock and retry against the new file.
    pub fn verify_current(&self) -> Result<bool, Error> {
        let locked = nix::sys::stat::fstat(self.file.as_raw_fd())?;
        let current = match nix::sys::stat::stat(&self.path) {
            Ok(stat) => stat,
            Err(nix::errno::Errno::ENOENT) => return Ok(false),
            Err(err) => bail!("unable to stat {:?} - {}", self.path, err),
        };
        Ok(locked.st_dev == current.st_dev && locked.st_ino == current.st_ino)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Access the locked file.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Mutable access to the locked file (seeking, rewriting blocks).
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_and_verify() {
        let dir = std::env::temp_dir().join(format!("ebakup-lock-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let path = dir.join("main");
        std::fs::write(&path, b"x").unwrap();

        let lock = FileLock::shared(&path, Duration::from_secs(1)).unwrap();
        assert!(lock.verify_current().unwrap());

        // replace the file under the lock - verify_current must notice
        std::fs::write(dir.join("main.new"), b"y").unwrap();
        std::fs::rename(dir.join("main.new"), &path).unwrap();
        assert!(!lock.verify_current().unwrap());

        drop(lock);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_exclusive_excludes_shared() {
        let dir = std::env::temp_dir().join(format!("ebakup-lock-excl-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let path = dir.join("content");
        std::fs::write(&path, b"x").unwrap();

        let excl = FileLock::exclusive(&path, Duration::from_secs(1)).unwrap();
        assert!(excl.is_exclusive());
        assert!(FileLock::shared(&path, Duration::from_millis(200)).is_err());

        drop(excl);
        assert!(FileLock::shared(&path, Duration::from_secs(1)).is_ok());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
