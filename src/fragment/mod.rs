//! # Fragments
//!
//! A fragment is one immutable write batch, materialized as a directory of
//! tile files plus a book-keeping index:
//!
//! ```text
//! <array>/__00000001706172000123_42/
//! ├── __book_keeping.tdb   # tile index; written last, commits the fragment
//! ├── a.tdb                # attribute tiles
//! ├── s.tdb                # var attribute: payload tiles
//! ├── s_var.tdb            # var attribute: offsets tiles
//! └── __coords.tdb         # coordinate tiles (sparse only)
//! ```
//!
//! The directory name encodes the creation timestamp (zero-padded so
//! lexicographic order equals temporal order) and the writer id. A
//! fragment is *live* once its book-keeping file exists; a directory
//! without one is an in-progress or aborted write and is ignored by every
//! reader and eventually garbage-collected.
//!
//! ## File Slots
//!
//! Book-keeping, the writer, and the reader agree on one indexing scheme:
//! slot `i < attribute_num` is attribute `i` in schema order, and for
//! sparse fragments slot `attribute_num` is the coordinates file.

pub mod book_keeping;
pub mod reader;
pub mod writer;

use std::path::{Path, PathBuf};

use crate::config::{
    BOOK_KEEPING_FILE_NAME, COORDS_FILE_NAME, FILE_SUFFIX, FRAGMENT_PREFIX, VAR_SUFFIX,
};
use crate::schema::ArraySchema;

/// Timestamp digits in a fragment name. Zero-padding keeps lexicographic
/// and temporal order identical across digit-count boundaries.
const TIMESTAMP_DIGITS: usize = 20;

/// Builds a fragment directory name: `__<timestamp-ms>_<writer-id>`.
pub fn fragment_name(timestamp_ms: u64, writer_id: u64) -> String {
    format!(
        "{}{:0width$}_{}",
        FRAGMENT_PREFIX,
        timestamp_ms,
        writer_id,
        width = TIMESTAMP_DIGITS
    )
}

/// Parses `(timestamp_ms, writer_id)` back out of a fragment name.
pub fn parse_fragment_name(name: &str) -> Option<(u64, u64)> {
    let rest = name.strip_prefix(FRAGMENT_PREFIX)?;
    let (ts, wid) = rest.split_once('_')?;
    Some((ts.parse().ok()?, wid.parse().ok()?))
}

pub fn is_fragment_name(name: &str) -> bool {
    parse_fragment_name(name).is_some()
}

pub fn book_keeping_path(fragment_dir: &Path) -> PathBuf {
    fragment_dir.join(BOOK_KEEPING_FILE_NAME)
}

pub fn coords_path(fragment_dir: &Path) -> PathBuf {
    fragment_dir.join(COORDS_FILE_NAME)
}

pub fn attr_path(fragment_dir: &Path, attr_name: &str) -> PathBuf {
    fragment_dir.join(format!("{}{}", attr_name, FILE_SUFFIX))
}

pub fn attr_var_path(fragment_dir: &Path, attr_name: &str) -> PathBuf {
    fragment_dir.join(format!("{}{}{}", attr_name, VAR_SUFFIX, FILE_SUFFIX))
}

/// Number of file slots of a fragment of `schema`: one per attribute plus
/// the coordinates slot for sparse arrays.
pub fn slot_count(schema: &ArraySchema) -> usize {
    schema.attribute_num() + usize::from(!schema.is_dense())
}

/// `true` once the fragment's commit marker exists.
pub fn is_live(fragment_dir: &Path) -> bool {
    book_keeping_path(fragment_dir).is_file()
}

// ----------------------------------------------------------------------
// Fragment list file
// ----------------------------------------------------------------------
//
// `__fragments.tdb` is the ordered list of live fragment names:
// u32 count, then per fragment u32 name_len + name bytes. It is always
// replaced atomically, so readers see a consistent snapshot of the set.

use crate::config::FRAGMENT_LIST_FILE_NAME;
use crate::io;
use crate::schema::wire::{write_string, ByteReader};
use eyre::Result;

pub fn fragment_list_path(array_dir: &Path) -> PathBuf {
    array_dir.join(FRAGMENT_LIST_FILE_NAME)
}

/// Reads the fragment list; a missing file is an empty list.
pub fn read_fragment_list(array_dir: &Path) -> Result<Vec<String>> {
    let path = fragment_list_path(array_dir);
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let bytes = io::read_file(&path)?;
    let mut r = ByteReader::new(&bytes);
    let count = r.read_u32()? as usize;
    let mut names = Vec::with_capacity(count);
    for _ in 0..count {
        names.push(r.read_string()?);
    }
    eyre::ensure!(
        r.remaining() == 0,
        "{} trailing bytes in fragment list",
        r.remaining()
    );
    Ok(names)
}

/// Atomically replaces the fragment list.
pub fn write_fragment_list(array_dir: &Path, names: &[String]) -> Result<()> {
    let mut buf = Vec::new();
    buf.extend((names.len() as u32).to_le_bytes());
    for name in names {
        write_string(&mut buf, name);
    }
    io::write_file_atomic(&fragment_list_path(array_dir), &buf)
}

/// Appends `name` to the fragment list unless already present.
pub fn register_fragment(array_dir: &Path, name: &str) -> Result<()> {
    let mut names = read_fragment_list(array_dir)?;
    if names.iter().any(|existing| existing == name) {
        return Ok(());
    }
    names.push(name.to_string());
    write_fragment_list(array_dir, &names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        let name = fragment_name(1706172000123, 42);
        assert!(name.starts_with(FRAGMENT_PREFIX));
        assert_eq!(parse_fragment_name(&name), Some((1706172000123, 42)));
    }

    #[test]
    fn lexicographic_order_is_temporal() {
        let earlier = fragment_name(999, 7);
        let later = fragment_name(1000, 1);
        assert!(earlier < later);
    }

    #[test]
    fn non_fragment_names_are_rejected() {
        assert!(!is_fragment_name("__array_schema.tdb"));
        assert!(!is_fragment_name("plain_dir"));
        assert!(is_fragment_name(&fragment_name(5, 5)));
    }
}
