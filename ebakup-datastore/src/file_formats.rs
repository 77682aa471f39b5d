// WARNING: these values are part of the on-disk format - do not change them

pub const MAIN_MAGIC: &str = "ebakup database v1";
pub const CONTENT_MAGIC: &str = "ebakup content data";
pub const BACKUP_MAGIC: &str = "ebakup backup data";
pub const LASTCHECK_MAGIC: &str = "ebakup last-check data";
pub const ISSUE_MAGIC: &str = "ebakup issue data";

// content index entry tags
pub const ENTRY_CONTENT: u8 = 0xdd;
/// Deprecated; recognized and skipped, never written.
pub const ENTRY_CONTENT_OLD: u8 = 0xd0;
/// Deprecated ("closed" marker); recognized and skipped, never written.
pub const ENTRY_CLOSED_OLD: u8 = 0xcc;
/// Deprecated ckdata item; recognized and skipped, never written.
pub const CKDATA_RESTORED_OLD: u8 = 0xa0;
/// Deprecated ckdata item; recognized and skipped, never written.
pub const CKDATA_CHANGED_OLD: u8 = 0xa1;

// manifest definition entry tags
pub const ENTRY_KEYVALUE: u8 = 0x21;
pub const ENTRY_EXTRADEF: u8 = 0x22;

// manifest data entry tags
pub const ENTRY_DIRECTORY: u8 = 0x90;
pub const ENTRY_DIRECTORY_EXTRA: u8 = 0x92;
pub const ENTRY_FILE: u8 = 0x91;
pub const ENTRY_FILE_EXTRA: u8 = 0x93;
pub const ENTRY_SPECIAL_FILE: u8 = 0x94;

/// Directory and extras ids below this value are reserved; id 0 is the
/// virtual root (directories) or "no extras" (bundles).
pub const FIRST_FREE_ID: u64 = 8;

// verification log entry kind octets
pub const CHECK_KIND_BACKUP: u8 = b'B';
pub const CHECK_KIND_CONTENT: u8 = b'C';

// issue change event states
pub const STATE_GOOD: u8 = b'g';
pub const STATE_CHECKSUM_ONLY: u8 = b'k';
pub const STATE_MISSING: u8 = b'm';
pub const STATE_WRONG_CHECKSUM: u8 = b'w';

// issue detail sections for manifest histories
pub const DETAIL_WHOLE_FILE_BAD: u8 = b'b';
pub const DETAIL_HEALTHY_BLOCKS: u8 = b'k';
pub const DETAIL_LOGICAL_BAD_BLOCKS: u8 = b'l';
pub const DETAIL_MISSING_CID: u8 = b'c';
pub const DETAIL_CHECKSUM_BAD_BLOCKS: u8 = b'w';
