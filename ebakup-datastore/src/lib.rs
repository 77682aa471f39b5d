//! This crate implements the ebakup storage engine.
//!
//! # Data formats
//!
//! Every file under `db/` shares one container format: a sequence of
//! equal-sized blocks, each carrying a trailing checksum over its own
//! bytes. The first block declares the block size and checksum algorithm
//! (`edb-blocksize`, `edb-blocksum`) along with a magic line identifying
//! the file type. Nothing is consumed from a block before its checksum has
//! been verified, and a flipped bit anywhere damages exactly one block.
//!
//! File bodies are stored deduplicated in a content addressable store
//! under `content/`, keyed by the digest of their bytes (the CID). The
//! content index (`db/content`) maps each CID to its good checksum and
//! insertion time; rare digest collisions are resolved by extending the
//! CID with suffix octets.
//!
//! Snapshots are immutable manifest files (`db/YYYY/MM-DDThh:mm`) listing
//! directories, files and interned per-file metadata. A manifest is built
//! as a `.new` sibling and atomically renamed into place, after every
//! object body it references has been made durable.
//!
//! The verification log (`db/lastcheck`, `db/issues`) records when items
//! were last checked and the per-item history of detected changes.
//!
//! # Locking
//!
//! Cross-process coordination uses advisory per-file locks with a single
//! rank rule: `db/main` is acquired first and released last. See
//! [storage::Storage] for the enforcement.

pub mod block_file;
pub mod check_log;
pub mod checksum;
pub mod content_index;
pub mod content_store;
pub mod error;
pub mod file_formats;
pub mod manifest;
pub mod settings;
pub mod storage;
pub mod timestamp;
pub mod wire;

pub use checksum::ChecksumKind;
pub use content_index::{ContentIndex, ContentInfo};
pub use content_store::{ContentStore, ObjectVerdict, SpooledContent};
pub use error::StoreError;
pub use manifest::{FileType, ManifestBuilder, ManifestEntry, ManifestReader};
pub use storage::{SnapshotInfo, Storage, STALE_NEW_SECS};
