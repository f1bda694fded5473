//! # GridStore Configuration Module
//!
//! This module centralizes runtime configuration and the constants shared
//! across the engine. Constants that name on-disk artifacts live here so the
//! writer, the reader, and the directory-type probe can never disagree about
//! a file name.
//!
//! ## Runtime Configuration
//!
//! A [`Config`] value is owned by each `StorageManager`. Multiple managers
//! with different configurations may coexist in one process; nothing in this
//! module is global state.
//!
//! - `read_method`: how tile and book-keeping bytes are read back
//!   (buffered pread, memory mapping, or direct I/O)
//! - `write_method`: how attribute files are appended (buffered or O_SYNC)
//! - `tile_cache_bytes`: byte budget of the process-wide tile cache
//!
//! ## Module Organization
//!
//! - [`constants`]: on-disk names, magics, and default values

pub mod constants;
pub use constants::*;

/// How file bytes are read or written.
///
/// `Direct` is only meaningful on platforms with `O_DIRECT`/`O_SYNC`; the
/// I/O layer degrades it to a synced buffered path where unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMethod {
    Buffered,
    Mmap,
    Direct,
}

/// Runtime configuration for one `StorageManager`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Read path for tile files and book-keeping. All of `Buffered`,
    /// `Mmap`, and `Direct` are valid.
    pub read_method: IoMethod,
    /// Write path for attribute files. `Mmap` is not a write method;
    /// `Config::validate` rejects it.
    pub write_method: IoMethod,
    /// Capacity of the decompressed tile cache in bytes.
    pub tile_cache_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_method: IoMethod::Mmap,
            write_method: IoMethod::Buffered,
            tile_cache_bytes: DEFAULT_TILE_CACHE_BYTES,
        }
    }
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        eyre::ensure!(
            self.write_method != IoMethod::Mmap,
            "mmap is not a supported write method"
        );
        Ok(())
    }
}
