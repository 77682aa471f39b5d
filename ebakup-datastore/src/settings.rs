//! Codec for the first block of every database file: a magic line followed
//! by `key:value` lines.

use std::path::Path;

use anyhow::{bail, Error};

use crate::error::StoreError;

pub const SETTING_BLOCKSIZE: &str = "edb-blocksize";
pub const SETTING_BLOCKSUM: &str = "edb-blocksum";

/// Parsed contents of a settings block.
///
/// Keys may repeat; order is preserved on re-emit so a rewritten first block
/// only changes where it was edited.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    magic: String,
    items: Vec<(String, String)>,
}

impl Settings {
    pub fn new(magic: &str) -> Self {
        Self {
            magic: magic.to_owned(),
            items: Vec::new(),
        }
    }

    /// Parse a settings payload. Parsing stops at the first NUL octet (block
    /// padding); every line before it must be well-formed.
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let used = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
        let text = std::str::from_utf8(&payload[..used])
            .map_err(|_| anyhow::format_err!("settings block is not valid UTF-8"))?;

        let mut lines = text.split_inclusive('\n');
        let magic = match lines.next() {
            Some(line) if line.ends_with('\n') => line[..line.len() - 1].to_owned(),
            _ => bail!("settings block has no magic line"),
        };

        let mut items = Vec::new();
        for line in lines {
            let line = match line.strip_suffix('\n') {
                Some(line) => line,
                None => bail!("settings block has an unterminated line"),
            };
            match line.split_once(':') {
                Some((key, value)) => items.push((key.to_owned(), value.to_owned())),
                None => bail!("malformed settings line {:?}", line),
            }
        }

        Ok(Self { magic, items })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.magic.as_bytes());
        out.push(b'\n');
        for (key, value) in &self.items {
            out.extend_from_slice(key.as_bytes());
            out.push(b':');
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
        out
    }

    pub fn magic(&self) -> &str {
        &self.magic
    }

    /// First value for a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.items
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Replace the first occurrence of a key, or append it.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.items.iter_mut().find(|(k, _)| k == key) {
            Some(item) => item.1 = value.to_owned(),
            None => self.items.push((key.to_owned(), value.to_owned())),
        }
    }

    /// Refuse settings this reader does not understand (format upgrade path).
    pub fn check_known_keys(&self, path: &Path, known: &[&str]) -> Result<(), Error> {
        for (key, _) in &self.items {
            if !known.contains(&key.as_str()) {
                return Err(StoreError::invalid_format(
                    path,
                    format!("unknown setting '{}'", key),
                )
                .into());
            }
        }
        Ok(())
    }
}
