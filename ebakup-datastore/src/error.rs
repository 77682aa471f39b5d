use std::path::PathBuf;

/// Failure classes of the storage engine.
///
/// Most engine functions return `anyhow::Error`; conditions callers need to
/// react to programmatically are raised as one of these variants so they
/// stay matchable via `Error::downcast_ref`.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("corrupt block {index} in {path:?}")]
    BlockCorrupt { path: PathBuf, index: u64 },

    #[error("invalid format in {path:?} - {reason}")]
    InvalidFormat { path: PathBuf, reason: String },

    #[error("{what} not found in {path:?}")]
    NotFound { path: PathBuf, what: String },

    #[error("{what} already exists in {path:?}")]
    AlreadyExists { path: PathBuf, what: String },

    #[error("another writer is active on {path:?}")]
    ConcurrentWriter { path: PathBuf },

    #[error("content id collision for checksum {checksum}")]
    CidCollision { checksum: String },

    #[error("content {cid} is missing from the store")]
    ContentMissing { cid: String },

    #[error("lock contention on {path:?}")]
    LockContention { path: PathBuf },

    #[error("file {path:?} was replaced while in use")]
    StaleReplaced { path: PathBuf },

    #[error("I/O error on {path:?} - {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn block_corrupt(path: impl Into<PathBuf>, index: u64) -> Self {
        StoreError::BlockCorrupt {
            path: path.into(),
            index,
        }
    }

    pub fn invalid_format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StoreError::InvalidFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(path: impl Into<PathBuf>, what: impl Into<String>) -> Self {
        StoreError::NotFound {
            path: path.into(),
            what: what.into(),
        }
    }

    pub fn already_exists(path: impl Into<PathBuf>, what: impl Into<String>) -> Self {
        StoreError::AlreadyExists {
            path: path.into(),
            what: what.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::IoError {
            path: path.into(),
            source,
        }
    }
}

/// Check whether an `anyhow::Error` wraps a given [StoreError] variant.
pub fn is_store_error(err: &anyhow::Error, check: impl Fn(&StoreError) -> bool) -> bool {
    err.downcast_ref::<StoreError>().map(check).unwrap_or(false)
}
