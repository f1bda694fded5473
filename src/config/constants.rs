//! # GridStore Constants
//!
//! On-disk names, format magics, and default sizes. The file and sentinel
//! names below are the wire format: changing any of them makes existing
//! workspaces unreadable.
//!
//! ## Dependency Notes
//!
//! ```text
//! BOOK_KEEPING_FILE_NAME
//!       │
//!       └─> A fragment directory is LIVE iff this file exists inside it.
//!           The fragment writer must create it last; the reader and the
//!           garbage sweeps key off its presence.
//!
//! FRAGMENT_PREFIX ("__")
//!       │
//!       └─> Shared by fragment directories and all book-keeping artifacts
//!           so that `ls` can separate engine files from user objects.
//! ```

/// Sentinel file marking a workspace root.
pub const WORKSPACE_FILE_NAME: &str = "__tiledb_workspace.tdb";

/// Sentinel file marking a group directory.
pub const GROUP_FILE_NAME: &str = "__tiledb_group.tdb";

/// Sentinel file marking a metadata directory. The metadata layer itself is
/// a thin projection over arrays and lives outside this crate; the probe
/// still recognizes the sentinel.
pub const METADATA_FILE_NAME: &str = "__tiledb_metadata.tdb";

/// Binary array schema, written once at array creation.
pub const SCHEMA_FILE_NAME: &str = "__array_schema.tdb";

/// Ordered list of live fragment directory names.
pub const FRAGMENT_LIST_FILE_NAME: &str = "__fragments.tdb";

/// Per-fragment tile index; its presence commits the fragment.
pub const BOOK_KEEPING_FILE_NAME: &str = "__book_keeping.tdb";

/// Coordinate tile file of a sparse fragment.
pub const COORDS_FILE_NAME: &str = "__coords.tdb";

/// Extension of every engine file.
pub const FILE_SUFFIX: &str = ".tdb";

/// Suffix of the paired offsets file of a variable-length attribute:
/// `<attr>.tdb` holds concatenated payloads, `<attr>_var.tdb` holds the
/// per-cell `u64` start offsets plus a terminating total size.
pub const VAR_SUFFIX: &str = "_var";

/// Prefix of fragment directories and engine-internal files.
pub const FRAGMENT_PREFIX: &str = "__";

/// Magic of the book-keeping file.
pub const BOOK_KEEPING_MAGIC: &[u8; 4] = b"TDBK";

/// Current book-keeping format version.
pub const BOOK_KEEPING_VERSION: u32 = 1;

/// Default tile cache capacity: 10 MiB.
pub const DEFAULT_TILE_CACHE_BYTES: usize = 10 * 1024 * 1024;

/// Number of worker threads in the asynchronous I/O pool.
pub const AIO_THREAD_COUNT: usize = 2;

/// Alignment required by direct I/O reads. Offsets and lengths handed to
/// the kernel are rounded to this; callers never see the padding.
pub const DIRECT_IO_ALIGNMENT: usize = 4096;

/// Age an uncommitted fragment directory must reach before garbage
/// collection may assume its writer is dead and delete it. Younger
/// directories may belong to a write still in progress.
pub const FRAGMENT_GC_GRACE_MS: u64 = 60 * 60 * 1000;

const _: () = assert!(
    DIRECT_IO_ALIGNMENT.is_power_of_two(),
    "direct I/O alignment must be a power of two"
);

const _: () = assert!(AIO_THREAD_COUNT >= 1, "the AIO pool needs a worker");
