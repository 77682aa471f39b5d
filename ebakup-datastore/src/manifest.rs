//! The per-snapshot manifest codec (`db/YYYY/MM-DDThh:mm`).
//!
//! A manifest is three ordered block sets: the settings block, definition
//! blocks (interned key-value pairs and extra-data bundles), and data blocks
//! (directory and file records). The file is written as a `.new` sibling and
//! becomes immutable when renamed to its final name.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use crate::block_file::{check_padding, BlockFileReader, BlockFileWriter};
use crate::checksum::ChecksumKind;
use crate::error::StoreError;
use crate::file_formats::{
    BACKUP_MAGIC, ENTRY_DIRECTORY, ENTRY_DIRECTORY_EXTRA, ENTRY_EXTRADEF, ENTRY_FILE,
    ENTRY_FILE_EXTRA, ENTRY_KEYVALUE, ENTRY_SPECIAL_FILE, FIRST_FREE_ID,
};
use crate::settings::{Settings, SETTING_BLOCKSIZE, SETTING_BLOCKSUM};
use crate::timestamp::{format_datetime, parse_datetime, Mtime};
use crate::wire;

pub const SETTING_START: &str = "start";
pub const SETTING_END: &str = "end";

const KNOWN_SETTINGS: &[&str] = &[SETTING_BLOCKSIZE, SETTING_BLOCKSUM, SETTING_START, SETTING_END];

const MAX_NAME_LEN: usize = 4000;
const MAX_CID_LEN: usize = 1024;

/// Well-known extras keys.
pub const EXTRA_OWNER: &[u8] = b"owner";
pub const EXTRA_GROUP: &[u8] = b"group";
pub const EXTRA_UNIX_ACCESS: &[u8] = b"unix-access";

/// File type codes for special-file records; a regular file has no code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Unknown,
    Symlink,
    Socket,
    Pipe,
    Device,
    Other(u8),
}

impl FileType {
    pub fn code(self) -> Option<u8> {
        match self {
            FileType::Regular => None,
            FileType::Unknown => Some(b'?'),
            FileType::Symlink => Some(b'L'),
            FileType::Socket => Some(b'S'),
            FileType::Pipe => Some(b'P'),
            FileType::Device => Some(b'D'),
            FileType::Other(code) => Some(code),
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            b'?' => FileType::Unknown,
            b'L' => FileType::Symlink,
            b'S' => FileType::Socket,
            b'P' => FileType::Pipe,
            b'D' => FileType::Device,
            other => FileType::Other(other),
        }
    }
}

/// A directory record. `dirid` is unique and at least 8; parent 0 is the
/// virtual root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub dirid: u64,
    pub parent: u64,
    pub name: Vec<u8>,
    /// Extras bundle id; 0 means none.
    pub extra: u64,
}

/// A file record. Names are raw bytes; invalid UTF-8 is preserved verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    pub parent: u64,
    pub name: Vec<u8>,
    /// Empty for content-less special files.
    pub cid: Vec<u8>,
    pub size: u64,
    pub mtime: Mtime,
    /// Extras bundle id; 0 means none.
    pub extra: u64,
    pub file_type: FileType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManifestEntry<'a> {
    Directory(&'a DirectoryEntry),
    File(&'a FileEntry),
}

impl<'a> ManifestEntry<'a> {
    pub fn name(&self) -> &'a [u8] {
        match self {
            ManifestEntry::Directory(dir) => &dir.name,
            ManifestEntry::File(file) => &file.name,
        }
    }
}

/// Interning arenas for per-manifest extras: key-value pairs keyed by
/// `kvid`, bundles of `kvid`s keyed by `xid`. Ids 0-7 are reserved, id 0
/// means "no extras".
#[derive(Default, Debug)]
struct ExtrasArena {
    kv_pairs: Vec<(Vec<u8>, Vec<u8>)>,
    kv_lookup: HashMap<(Vec<u8>, Vec<u8>), u64>,
    bundles: Vec<Vec<u64>>,
    bundle_lookup: HashMap<Vec<u64>, u64>,
}

impl ExtrasArena {
    fn intern_pair(&mut self, key: &[u8], value: &[u8]) -> u64 {
        let pair = (key.to_vec(), value.to_vec());
        if let Some(&kvid) = self.kv_lookup.get(&pair) {
            return kvid;
        }
        let kvid = FIRST_FREE_ID + self.kv_pairs.len() as u64;
        self.kv_pairs.push(pair.clone());
        self.kv_lookup.insert(pair, kvid);
        kvid
    }

    fn intern_bundle(&mut self, pairs: &[(Vec<u8>, Vec<u8>)]) -> u64 {
        if pairs.is_empty() {
            return 0;
        }
        let kvids: Vec<u64> = pairs
            .iter()
            .map(|(k, v)| self.intern_pair(k, v))
            .collect();
        if let Some(&xid) = self.bundle_lookup.get(&kvids) {
            return xid;
        }
        let xid = FIRST_FREE_ID + self.bundles.len() as u64;
        self.bundles.push(kvids.clone());
        self.bundle_lookup.insert(kvids, xid);
        xid
    }
}

fn encode_directory(out: &mut Vec<u8>, dir: &DirectoryEntry) {
    if dir.extra == 0 {
        out.push(ENTRY_DIRECTORY);
    } else {
        out.push(ENTRY_DIRECTORY_EXTRA);
    }
    wire::encode_varuint(out, dir.dirid);
    wire::encode_varuint(out, dir.parent);
    wire::encode_lenprefixed(out, &dir.name);
    if dir.extra != 0 {
        wire::encode_varuint(out, dir.extra);
    }
}

fn encode_file(out: &mut Vec<u8>, file: &FileEntry) {
    let type_code = file.file_type.code();
    let tag = match (type_code, file.extra) {
        (Some(_), _) => ENTRY_SPECIAL_FILE,
        (None, 0) => ENTRY_FILE,
        (None, _) => ENTRY_FILE_EXTRA,
    };
    out.push(tag);
    wire::encode_varuint(out, file.parent);
    wire::encode_lenprefixed(out, &file.name);
    wire::encode_lenprefixed(out, &file.cid);
    wire::encode_varuint(out, file.size);
    out.extend_from_slice(&file.mtime.encode());
    if let Some(code) = type_code {
        out.push(code);
    }
    if tag != ENTRY_FILE {
        wire::encode_varuint(out, file.extra);
    }
}

fn encode_keyvalue(out: &mut Vec<u8>, kvid: u64, key: &[u8], value: &[u8]) {
    out.push(ENTRY_KEYVALUE);
    wire::encode_varuint(out, kvid);
    wire::encode_lenprefixed(out, key);
    wire::encode_lenprefixed(out, value);
}

fn encode_extradef(out: &mut Vec<u8>, xid: u64, kvids: &[u64]) {
    out.push(ENTRY_EXTRADEF);
    wire::encode_varuint(out, xid);
    wire::encode_varuint(out, kvids.len() as u64);
    for &kvid in kvids {
        wire::encode_varuint(out, kvid);
    }
}

fn read_mtime(cursor: &mut &[u8]) -> Result<Mtime, Error> {
    let bytes = wire::read_bytes(cursor, 9)?;
    let mut raw = [0u8; 9];
    raw.copy_from_slice(&bytes);
    Mtime::decode(&raw)
}

/// Greedy block packer: entries are appended whole, a block is flushed when
/// the next entry does not fit. An entry must never span blocks.
struct BlockPacker {
    payload: Vec<u8>,
    capacity: usize,
}

impl BlockPacker {
    fn new(capacity: usize) -> Self {
        Self {
            payload: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, writer: &mut BlockFileWriter, entry: &[u8]) -> Result<(), Error> {
        if entry.len() > self.capacity {
            bail!("manifest entry of {} octets does not fit a block", entry.len());
        }
        if self.payload.len() + entry.len() > self.capacity {
            self.flush(writer)?;
        }
        self.payload.extend_from_slice(entry);
        Ok(())
    }

    fn flush(&mut self, writer: &mut BlockFileWriter) -> Result<(), Error> {
        if !self.payload.is_empty() {
            writer.append_block(&self.payload)?;
            self.payload.clear();
        }
        Ok(())
    }
}

/// Builds one snapshot manifest.
///
/// Records accumulate in memory; the definition and data block sets are
/// emitted on [ManifestBuilder::finalize], which also fills in the `end`
/// setting and renames the `.new` exclusion token to the final name. An
/// unfinalized builder removes its `.new` on drop.
#[derive(Debug)]
pub struct ManifestBuilder {
    writer: BlockFileWriter,
    final_path: PathBuf,
    tmp_path: PathBuf,
    settings: Settings,
    dirs: Vec<DirectoryEntry>,
    dir_ids: HashMap<u64, usize>,
    names: HashMap<(u64, Vec<u8>), bool>,
    files: Vec<FileEntry>,
    extras: ExtrasArena,
    next_dirid: u64,
    finalized: bool,
}

impl ManifestBuilder {
    /// Begin a manifest in an already-created (empty, exclusively owned)
    /// `.new` file and write its settings block.
    pub(crate) fn start(
        final_path: PathBuf,
        tmp_path: PathBuf,
        tmp_file: File,
        blocksize: usize,
        blocksum: ChecksumKind,
        start_epoch: i64,
    ) -> Result<Self, Error> {
        let mut settings = Settings::new(BACKUP_MAGIC);
        settings.set(SETTING_BLOCKSIZE, &blocksize.to_string());
        settings.set(SETTING_BLOCKSUM, blocksum.name());
        settings.set(SETTING_START, &format_datetime(start_epoch)?);

        let writer = BlockFileWriter::init_file(tmp_file, &tmp_path, &settings)?;

        Ok(Self {
            writer,
            final_path,
            tmp_path,
            settings,
            dirs: Vec::new(),
            dir_ids: HashMap::new(),
            names: HashMap::new(),
            files: Vec::new(),
            extras: ExtrasArena::default(),
            next_dirid: FIRST_FREE_ID,
            finalized: false,
        })
    }

    fn check_parent(&self, parent: u64) -> Result<(), Error> {
        if parent != 0 && !self.dir_ids.contains_key(&parent) {
            bail!("parent directory id {} is not defined", parent);
        }
        Ok(())
    }

    fn check_name(&self, parent: u64, name: &[u8]) -> Result<(), Error> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            bail!("entry name length {} out of range", name.len());
        }
        if self.names.contains_key(&(parent, name.to_vec())) {
            return Err(StoreError::already_exists(
                &self.final_path,
                format!("entry {:?} in directory {}", String::from_utf8_lossy(name), parent),
            )
            .into());
        }
        Ok(())
    }

    /// Intern an extras bundle, returning its `xid` (0 for no pairs).
    pub fn intern_extra(&mut self, pairs: &[(Vec<u8>, Vec<u8>)]) -> u64 {
        self.extras.intern_bundle(pairs)
    }

    /// Add a directory under `parent` (0 = root). Ids are allocated in call
    /// order; a parent must exist before its children, which keeps the tree
    /// acyclic by construction.
    pub fn add_directory(&mut self, parent: u64, name: &[u8], extra: u64) -> Result<u64, Error> {
        self.check_parent(parent)?;
        self.check_name(parent, name)?;

        let dirid = self.next_dirid;
        self.next_dirid += 1;
        self.dir_ids.insert(dirid, self.dirs.len());
        self.names.insert((parent, name.to_vec()), true);
        self.dirs.push(DirectoryEntry {
            dirid,
            parent,
            name: name.to_vec(),
            extra,
        });
        Ok(dirid)
    }

    /// Directory id for `(parent, name)`, creating the record if needed.
    pub fn ensure_directory(&mut self, parent: u64, name: &[u8]) -> Result<u64, Error> {
        if let Some(idx) = self
            .dirs
            .iter()
            .position(|d| d.parent == parent && d.name == name)
        {
            return Ok(self.dirs[idx].dirid);
        }
        self.add_directory(parent, name, 0)
    }

    pub fn add_file(
        &mut self,
        parent: u64,
        name: &[u8],
        cid: &[u8],
        size: u64,
        mtime: Mtime,
        extra: u64,
        file_type: FileType,
    ) -> Result<(), Error> {
        self.check_parent(parent)?;
        self.check_name(parent, name)?;
        if cid.len() > MAX_CID_LEN {
            bail!("cid length {} out of range", cid.len());
        }

        self.names.insert((parent, name.to_vec()), true);
        self.files.push(FileEntry {
            parent,
            name: name.to_vec(),
            cid: cid.to_vec(),
            size,
            mtime,
            extra,
            file_type,
        });
        Ok(())
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Emit the definition and data block sets, set `end`, fsync and rename
    /// the manifest to its final (immutable) name.
    pub fn finalize(mut self, end_epoch: i64) -> Result<PathBuf, Error> {
        let capacity = self.writer.payload_capacity();
        let mut entry = Vec::new();

        // definition blocks
        let mut packer = BlockPacker::new(capacity);
        for (idx, (key, value)) in self.extras.kv_pairs.iter().enumerate() {
            entry.clear();
            encode_keyvalue(&mut entry, FIRST_FREE_ID + idx as u64, key, value);
            packer.push(&mut self.writer, &entry)?;
        }
        for (idx, kvids) in self.extras.bundles.iter().enumerate() {
            entry.clear();
            encode_extradef(&mut entry, FIRST_FREE_ID + idx as u64, kvids);
            packer.push(&mut self.writer, &entry)?;
        }
        packer.flush(&mut self.writer)?;

        // data blocks: directories in id order, then files
        let mut packer = BlockPacker::new(capacity);
        for dir in &self.dirs {
            entry.clear();
            encode_directory(&mut entry, dir);
            packer.push(&mut self.writer, &entry)?;
        }
        for file in &self.files {
            entry.clear();
            encode_file(&mut entry, file);
            packer.push(&mut self.writer, &entry)?;
        }
        packer.flush(&mut self.writer)?;

        // the settings block is re-emitted with the end time filled in
        self.settings.set(SETTING_END, &format_datetime(end_epoch)?);
        self.writer.rewrite_block(0, &self.settings.encode())?;
        self.writer.sync()?;

        if self.final_path.exists() {
            return Err(StoreError::already_exists(&self.final_path, "snapshot").into());
        }
        std::fs::rename(&self.tmp_path, &self.final_path)
            .map_err(|err| format_err!("atomic rename to {:?} failed - {}", self.final_path, err))?;
        if let Some(parent) = self.final_path.parent() {
            ebakup_tools::fs::fsync_dir(parent)?;
        }

        self.finalized = true;
        Ok(self.final_path.clone())
    }
}

impl Drop for ManifestBuilder {
    fn drop(&mut self) {
        if !self.finalized {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

/// Random and sequential read access to a finalized manifest.
pub struct ManifestReader {
    path: PathBuf,
    settings: Settings,
    dirs: Vec<DirectoryEntry>,
    files: Vec<FileEntry>,
    kv_pairs: HashMap<u64, (Vec<u8>, Vec<u8>)>,
    bundles: HashMap<u64, Vec<u64>>,
    children: HashMap<u64, Vec<usize>>,
    files_by_parent: HashMap<u64, Vec<usize>>,
}

#[derive(PartialEq)]
enum BlockClass {
    Definition,
    Data,
}

impl ManifestReader {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let reader = BlockFileReader::open_expecting(path, BACKUP_MAGIC)?;
        reader.settings().check_known_keys(path, KNOWN_SETTINGS)?;

        let mut manifest = Self {
            path: path.to_owned(),
            settings: reader.settings().clone(),
            dirs: Vec::new(),
            files: Vec::new(),
            kv_pairs: HashMap::new(),
            bundles: HashMap::new(),
            children: HashMap::new(),
            files_by_parent: HashMap::new(),
        };

        let mut seen_data = false;
        for (index, payload) in reader.data_blocks()? {
            let payload = payload?;
            if payload.first().map(|&b| b == 0).unwrap_or(true) {
                check_padding(&payload[1..], path, index)?;
                continue;
            }
            let class = manifest.parse_block(&payload, index)?;
            match class {
                BlockClass::Definition if seen_data => {
                    return Err(StoreError::invalid_format(
                        path,
                        format!("definition block {} after data blocks", index),
                    )
                    .into());
                }
                BlockClass::Definition => {}
                BlockClass::Data => seen_data = true,
            }
        }

        manifest.validate()?;
        manifest.build_lookup_tables();
        Ok(manifest)
    }

    fn parse_block(&mut self, payload: &[u8], index: u64) -> Result<BlockClass, Error> {
        let mut cursor = &payload[..];
        let mut class = None;

        loop {
            if cursor.is_empty() {
                break;
            }
            if cursor[0] == 0 {
                check_padding(&cursor[1..], &self.path, index)?;
                break;
            }

            let tag = cursor[0];
            cursor = &cursor[1..];
            let entry_class = match tag {
                ENTRY_KEYVALUE | ENTRY_EXTRADEF => BlockClass::Definition,
                ENTRY_DIRECTORY | ENTRY_DIRECTORY_EXTRA | ENTRY_FILE | ENTRY_FILE_EXTRA
                | ENTRY_SPECIAL_FILE => BlockClass::Data,
                _ => {
                    return Err(StoreError::invalid_format(
                        &self.path,
                        format!("unknown entry tag {:#04x} in block {}", tag, index),
                    )
                    .into());
                }
            };
            match &class {
                None => class = Some(entry_class),
                Some(seen) if *seen != entry_class => {
                    return Err(StoreError::invalid_format(
                        &self.path,
                        format!("mixed definition and data entries in block {}", index),
                    )
                    .into());
                }
                Some(_) => {}
            }

            match tag {
                ENTRY_KEYVALUE => {
                    let kvid = wire::decode_varuint(&mut cursor)?;
                    let key = wire::decode_lenprefixed(&mut cursor, MAX_NAME_LEN)?;
                    let value = wire::decode_lenprefixed(&mut cursor, MAX_NAME_LEN)?;
                    if kvid < FIRST_FREE_ID || self.kv_pairs.insert(kvid, (key, value)).is_some() {
                        return Err(StoreError::invalid_format(
                            &self.path,
                            format!("bad key-value id {} in block {}", kvid, index),
                        )
                        .into());
                    }
                }
                ENTRY_EXTRADEF => {
                    let xid = wire::decode_varuint(&mut cursor)?;
                    let count = wire::decode_varuint(&mut cursor)? as usize;
                    if count > MAX_NAME_LEN {
                        return Err(StoreError::invalid_format(
                            &self.path,
                            format!("implausible bundle size in block {}", index),
                        )
                        .into());
                    }
                    let mut kvids = Vec::with_capacity(count);
                    for _ in 0..count {
                        kvids.push(wire::decode_varuint(&mut cursor)?);
                    }
                    if xid < FIRST_FREE_ID || self.bundles.insert(xid, kvids).is_some() {
                        return Err(StoreError::invalid_format(
                            &self.path,
                            format!("bad extras id {} in block {}", xid, index),
                        )
                        .into());
                    }
                }
                ENTRY_DIRECTORY | ENTRY_DIRECTORY_EXTRA => {
                    let dirid = wire::decode_varuint(&mut cursor)?;
                    let parent = wire::decode_varuint(&mut cursor)?;
                    let name = wire::decode_lenprefixed(&mut cursor, MAX_NAME_LEN)?;
                    let extra = if tag == ENTRY_DIRECTORY_EXTRA {
                        wire::decode_varuint(&mut cursor)?
                    } else {
                        0
                    };
                    self.dirs.push(DirectoryEntry {
                        dirid,
                        parent,
                        name,
                        extra,
                    });
                }
                ENTRY_FILE | ENTRY_FILE_EXTRA | ENTRY_SPECIAL_FILE => {
                    let parent = wire::decode_varuint(&mut cursor)?;
                    let name = wire::decode_lenprefixed(&mut cursor, MAX_NAME_LEN)?;
                    let cid = wire::decode_lenprefixed(&mut cursor, MAX_CID_LEN)?;
                    let size = wire::decode_varuint(&mut cursor)?;
                    let mtime = read_mtime(&mut cursor)?;
                    let file_type = if tag == ENTRY_SPECIAL_FILE {
                        let code = wire::read_bytes(&mut cursor, 1)?[0];
                        FileType::from_code(code)
                    } else {
                        FileType::Regular
                    };
                    let extra = if tag != ENTRY_FILE {
                        wire::decode_varuint(&mut cursor)?
                    } else {
                        0
                    };
                    self.files.push(FileEntry {
                        parent,
                        name,
                        cid,
                        size,
                        mtime,
                        extra,
                        file_type,
                    });
                }
                _ => unreachable!(),
            }
        }

        class.ok_or_else(|| {
            StoreError::invalid_format(&self.path, format!("empty block {}", index)).into()
        })
    }

    fn validate(&self) -> Result<(), Error> {
        let mut by_id: HashMap<u64, &DirectoryEntry> = HashMap::new();
        for dir in &self.dirs {
            if dir.dirid < FIRST_FREE_ID {
                return Err(StoreError::invalid_format(
                    &self.path,
                    format!("reserved directory id {}", dir.dirid),
                )
                .into());
            }
            if by_id.insert(dir.dirid, dir).is_some() {
                return Err(StoreError::invalid_format(
                    &self.path,
                    format!("duplicate directory id {}", dir.dirid),
                )
                .into());
            }
        }

        // parent chains must terminate at the root (acyclicity)
        for dir in &self.dirs {
            let mut cursor = dir.parent;
            let mut steps = 0usize;
            while cursor != 0 {
                let parent = by_id.get(&cursor).ok_or_else(|| {
                    StoreError::invalid_format(
                        &self.path,
                        format!("directory {} has unknown parent {}", dir.dirid, cursor),
                    )
                })?;
                cursor = parent.parent;
                steps += 1;
                if steps > self.dirs.len() {
                    return Err(StoreError::invalid_format(
                        &self.path,
                        format!("directory parent cycle at id {}", dir.dirid),
                    )
                    .into());
                }
            }
        }

        for file in &self.files {
            if file.parent != 0 && !by_id.contains_key(&file.parent) {
                return Err(StoreError::invalid_format(
                    &self.path,
                    format!(
                        "file {:?} has unknown parent {}",
                        String::from_utf8_lossy(&file.name),
                        file.parent
                    ),
                )
                .into());
            }
            if file.extra != 0 && !self.bundles.contains_key(&file.extra) {
                return Err(StoreError::invalid_format(
                    &self.path,
                    format!("undefined extras id {}", file.extra),
                )
                .into());
            }
        }
        for dir in &self.dirs {
            if dir.extra != 0 && !self.bundles.contains_key(&dir.extra) {
                return Err(StoreError::invalid_format(
                    &self.path,
                    format!("undefined extras id {}", dir.extra),
                )
                .into());
            }
        }
        for kvids in self.bundles.values() {
            for kvid in kvids {
                if !self.kv_pairs.contains_key(kvid) {
                    return Err(StoreError::invalid_format(
                        &self.path,
                        format!("undefined key-value id {}", kvid),
                    )
                    .into());
                }
            }
        }
        Ok(())
    }

    fn build_lookup_tables(&mut self) {
        for (idx, dir) in self.dirs.iter().enumerate() {
            self.children.entry(dir.parent).or_default().push(idx);
        }
        for (idx, file) in self.files.iter().enumerate() {
            self.files_by_parent.entry(file.parent).or_default().push(idx);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start_time(&self) -> Result<i64, Error> {
        let value = self
            .settings
            .get(SETTING_START)
            .ok_or_else(|| StoreError::invalid_format(&self.path, "missing start setting"))?;
        parse_datetime(value)
    }

    pub fn end_time(&self) -> Result<i64, Error> {
        let value = self
            .settings
            .get(SETTING_END)
            .ok_or_else(|| StoreError::invalid_format(&self.path, "missing end setting"))?;
        parse_datetime(value)
    }

    pub fn directories(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.dirs.iter()
    }

    pub fn files(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.iter()
    }

    /// Every distinct non-empty CID referenced by this manifest.
    pub fn referenced_cids(&self) -> Vec<Vec<u8>> {
        let mut cids: Vec<Vec<u8>> = self
            .files
            .iter()
            .filter(|f| !f.cid.is_empty())
            .map(|f| f.cid.clone())
            .collect();
        cids.sort();
        cids.dedup();
        cids
    }

    /// Look up one entry by parent directory id and exact name.
    pub fn lookup(&self, parent: u64, name: &[u8]) -> Option<ManifestEntry<'_>> {
        if let Some(indices) = self.children.get(&parent) {
            for &idx in indices {
                if self.dirs[idx].name == name {
                    return Some(ManifestEntry::Directory(&self.dirs[idx]));
                }
            }
        }
        if let Some(indices) = self.files_by_parent.get(&parent) {
            for &idx in indices {
                if self.files[idx].name == name {
                    return Some(ManifestEntry::File(&self.files[idx]));
                }
            }
        }
        None
    }

    /// Entries of one directory, sorted by byte-wise name order.
    pub fn list_directory(&self, dirid: u64) -> Vec<ManifestEntry<'_>> {
        let mut entries: Vec<ManifestEntry> = Vec::new();
        if let Some(indices) = self.children.get(&dirid) {
            entries.extend(indices.iter().map(|&i| ManifestEntry::Directory(&self.dirs[i])));
        }
        if let Some(indices) = self.files_by_parent.get(&dirid) {
            entries.extend(indices.iter().map(|&i| ManifestEntry::File(&self.files[i])));
        }
        entries.sort_by(|a, b| a.name().cmp(b.name()));
        entries
    }

    /// Resolve an extras bundle to its key-value pairs.
    pub fn extra_pairs(&self, xid: u64) -> Result<Vec<(&[u8], &[u8])>, Error> {
        if xid == 0 {
            return Ok(Vec::new());
        }
        let kvids = self
            .bundles
            .get(&xid)
            .ok_or_else(|| format_err!("undefined extras id {}", xid))?;
        kvids
            .iter()
            .map(|kvid| {
                self.kv_pairs
                    .get(kvid)
                    .map(|(k, v)| (k.as_slice(), v.as_slice()))
                    .ok_or_else(|| format_err!("undefined key-value id {}", kvid))
            })
            .collect()
    }
}
