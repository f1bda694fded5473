//! # GridStore - Embedded Multidimensional Array Storage Engine
//!
//! GridStore persists sparse and dense N-dimensional arrays as immutable,
//! append-only fragments on a local filesystem and serves range/point reads,
//! writes, and iteration against them. This Rust implementation prioritizes:
//!
//! - **Immutable fragments**: every write batch becomes its own on-disk
//!   fragment; readers always see a consistent snapshot
//! - **Zero-copy sharing**: decompressed tiles are shared via `Arc` between
//!   concurrent readers through a process-wide cache
//! - **Crash safety without a WAL**: a fragment's book-keeping file is
//!   written last and doubles as the commit marker
//!
//! ## Quick Start
//!
//! ```ignore
//! use gridstore::{ArraySchema, Config, Datatype, Mode, StorageManager};
//!
//! let mgr = StorageManager::init("./workspace", Config::default())?;
//!
//! let schema = ArraySchema::sparse("weather")
//!     .dimension("x", 0, 99)
//!     .dimension("y", 0, 99)
//!     .attribute("temp", Datatype::Float32)
//!     .build()?;
//! mgr.array_create(&schema)?;
//!
//! let mut array = mgr.array_init("weather", Mode::WriteUnsorted, None, None)?;
//! array.write(&[&temps, &coords])?;
//! mgr.array_finalize(array)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │     StorageManager (workspace)       │
//! ├──────────────────────────────────────┤
//! │  Array handle │ Cell merge iterator  │
//! ├───────────────┼──────────────────────┤
//! │ Fragment writer │ Fragment reader    │
//! ├──────────────────────────────────────┤
//! │  Book-keeping   │    Tile cache      │
//! ├──────────────────────────────────────┤
//! │    Tile building / Codec layer       │
//! ├──────────────────────────────────────┤
//! │ File I/O (buffered / mmap / direct)  │
//! └──────────────────────────────────────┘
//! ```
//!
//! ## Workspace Layout
//!
//! ```text
//! workspace/
//! ├── __tiledb_workspace.tdb       # workspace sentinel
//! └── climate/                     # group
//!     ├── __tiledb_group.tdb       # group sentinel
//!     └── weather/                 # array
//!         ├── __array_schema.tdb   # schema, binary, immutable
//!         ├── __fragments.tdb      # ordered list of live fragments
//!         └── __1706172000123_42/  # one fragment
//!             ├── __book_keeping.tdb  # tile index; commit marker
//!             ├── temp.tdb            # attribute tiles
//!             └── __coords.tdb        # coordinate tiles (sparse)
//! ```
//!
//! Fragment directory names encode `__<timestamp-ms>_<writer-id>` so that a
//! lexicographic sort equals temporal order; newer fragments shadow older
//! ones on identical coordinates. A fragment directory without its
//! book-keeping file is an aborted write and is ignored on open.
//!
//! ## Module Overview
//!
//! - [`io`]: filesystem primitives and typed read/write methods
//! - [`codec`]: per-tile compression (none, gzip)
//! - [`schema`]: immutable array schemas, cell/tile orders, Hilbert curve
//! - [`tile`]: in-memory tile building and decoded tile views
//! - [`fragment`]: write batch materialization and the per-fragment index
//! - [`cache`]: process-wide LRU over decompressed tiles
//! - [`array`]: per-open handles and the k-way merge read path
//! - [`manager`]: workspace registry, consolidation, directory operations
//! - [`aio`]: asynchronous I/O worker pool

pub mod aio;
pub mod array;
pub mod cache;
pub mod codec;
pub mod config;
pub mod fragment;
pub mod io;
pub mod manager;
pub mod schema;
pub mod tile;

pub use aio::{AioMode, AioRequest, AioStatus};
pub use array::{Array, ArrayIterator, Mode, ReadStatus};
pub use cache::TileCache;
pub use codec::Compressor;
pub use config::{Config, IoMethod};
pub use manager::{DirType, StorageManager};
pub use schema::{ArraySchema, Datatype, Layout, COORDS_NAME, VAR_NUM};
