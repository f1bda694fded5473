//! # Array Handles
//!
//! An [`Array`] is one open of an array, created by
//! `StorageManager::array_init` and destroyed by `array_finalize`.
//!
//! - **Read mode**: the handle owns a reader for every fragment that was
//!   live at open time and serves `read` calls against a subarray through
//!   the k-way merge in [`iterator`]. The fragment set is a snapshot:
//!   writes and consolidations committed later are invisible to this
//!   handle.
//! - **Write modes**: the handle owns at most one fragment being built.
//!   The fragment directory appears on the first `write`; `finalize` seals
//!   it. `Write` expects cells already in the array's global order,
//!   `WriteUnsorted` (sparse only) lets the engine sort the batch at seal.
//!
//! ## Buffer Convention
//!
//! Callers exchange cells through flat byte buffers, one per selected
//! buffer target in selection order: a fixed-size attribute takes one
//! buffer of packed little-endian values; a variable-length attribute
//! takes an offsets buffer (`u64` start per cell) followed by a payload
//! buffer; the sparse coordinates ride under the reserved name
//! [`COORDS_NAME`], by default last. `read` fills the buffers, reports
//! bytes written per buffer, and sets per-buffer overflow flags when a
//! cell would not fit; a subsequent `read` resumes exactly where the
//! previous one stopped.

pub mod iterator;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{ensure, Result};

use crate::cache::TileCache;
use crate::config::IoMethod;
use crate::fragment::reader::FragmentReader;
use crate::fragment;
use crate::fragment::writer::{FragmentWriter, InputOrder};
use crate::schema::{ArraySchema, COORDS_NAME};

pub use iterator::ArrayIterator;
use iterator::ReadState;

/// Open mode of an array handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    /// Cells arrive in the array's global cell order.
    Write,
    /// Sparse only: cells arrive in any order and are sorted at seal.
    WriteUnsorted,
}

/// Outcome of one `read` call. `Incomplete` is not an error: at least one
/// buffer filled up and the handle is positioned to resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Completed,
    Incomplete,
}

/// What one caller buffer carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferTarget {
    Coords,
    Fixed(usize),
    VarOffsets(usize),
    VarPayload(usize),
}

pub struct Array {
    schema: Arc<ArraySchema>,
    dir: PathBuf,
    mode: Mode,
    cache: Arc<TileCache>,
    write_method: IoMethod,
    writer_id: u64,

    fragments: Vec<FragmentReader>,
    subarray: Vec<(i64, i64)>,
    targets: Vec<BufferTarget>,
    overflow: Vec<bool>,
    state: Option<ReadState>,
    writer: Option<FragmentWriter>,
    /// Consolidation feeds dense cells in global order instead of array
    /// cell order; never set for handles returned to callers.
    global_order_writes: bool,
}

impl Array {
    /// Wires up an open handle; called by `StorageManager::array_init`
    /// with the fragments it resolved for read mode.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        schema: Arc<ArraySchema>,
        dir: PathBuf,
        mode: Mode,
        fragments: Vec<FragmentReader>,
        subarray: Option<&[i64]>,
        attrs: Option<&[&str]>,
        cache: Arc<TileCache>,
        write_method: IoMethod,
        writer_id: u64,
    ) -> Result<Self> {
        if mode == Mode::WriteUnsorted {
            ensure!(
                !schema.is_dense(),
                "dense arrays take sorted writes only; cells already arrive in cell order"
            );
        }
        let subarray = match subarray {
            Some(flat) => schema.parse_subarray(flat)?,
            None => schema
                .parse_subarray(&schema.full_domain())
                .expect("the full domain is a valid subarray"), // INVARIANT: by construction
        };
        if mode != Mode::Read {
            ensure!(
                subarray == schema.parse_subarray(&schema.full_domain())?,
                "write handles cover the full domain; subarrays apply to reads"
            );
        }
        let targets = Self::resolve_targets(&schema, mode, attrs)?;
        let overflow = vec![false; targets.len()];

        Ok(Self {
            schema,
            dir,
            mode,
            cache,
            write_method,
            writer_id,
            fragments,
            subarray,
            targets,
            overflow,
            state: None,
            writer: None,
            global_order_writes: false,
        })
    }

    pub(crate) fn set_global_order_writes(&mut self) {
        self.global_order_writes = true;
    }

    /// Expands attribute names into per-buffer targets. Defaults to every
    /// attribute in schema order, plus the coordinates for sparse reads.
    fn resolve_targets(
        schema: &ArraySchema,
        mode: Mode,
        attrs: Option<&[&str]>,
    ) -> Result<Vec<BufferTarget>> {
        let default_names: Vec<&str> = {
            let mut names: Vec<&str> = schema.attributes().iter().map(|a| a.name.as_str()).collect();
            if !schema.is_dense() {
                names.push(COORDS_NAME);
            }
            names
        };
        let names: Vec<&str> = match attrs {
            Some(names) => names.to_vec(),
            None => default_names.clone(),
        };

        if mode != Mode::Read {
            // The write path keeps attribute tiles positionally aligned, so
            // a write must provide every attribute (and sparse coordinates).
            ensure!(
                names == default_names,
                "writes must supply all attributes in schema order{}",
                if schema.is_dense() { "" } else { " plus the coordinates" }
            );
        }

        let mut targets = Vec::new();
        for name in &names {
            if *name == COORDS_NAME {
                ensure!(
                    !schema.is_dense(),
                    "dense arrays derive coordinates positionally; '{}' cannot be selected",
                    COORDS_NAME
                );
                targets.push(BufferTarget::Coords);
                continue;
            }
            let slot = schema.attribute_index(name)?;
            if schema.attribute(slot).is_var() {
                targets.push(BufferTarget::VarOffsets(slot));
                targets.push(BufferTarget::VarPayload(slot));
            } else {
                targets.push(BufferTarget::Fixed(slot));
            }
        }
        ensure!(!targets.is_empty(), "no buffers selected");
        Ok(targets)
    }

    pub fn schema(&self) -> &ArraySchema {
        &self.schema
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn targets(&self) -> &[BufferTarget] {
        &self.targets
    }

    pub(crate) fn dir(&self) -> &PathBuf {
        &self.dir
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    fn writer(&mut self) -> Result<&mut FragmentWriter> {
        ensure!(
            self.mode != Mode::Read,
            "array '{}' is open for reading",
            self.schema.name()
        );
        if self.writer.is_none() {
            let timestamp_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            let name = fragment::fragment_name(timestamp_ms, self.writer_id);
            let order = match self.mode {
                Mode::Write if self.schema.is_dense() && !self.global_order_writes => {
                    InputOrder::ArrayOrder
                }
                Mode::Write => InputOrder::Sorted,
                Mode::WriteUnsorted => InputOrder::Unsorted,
                Mode::Read => unreachable!("checked above"),
            };
            self.writer = Some(FragmentWriter::create(
                &self.dir,
                Arc::clone(&self.schema),
                name,
                self.write_method,
                order,
            )?);
        }
        Ok(self.writer.as_mut().expect("just created")) // INVARIANT: set above
    }

    /// Writes one batch of cells; see the module docs for the buffer
    /// layout. The fragment directory is created on the first call.
    pub fn write<B: AsRef<[u8]>>(&mut self, buffers: &[B]) -> Result<()> {
        let views: Vec<&[u8]> = buffers.iter().map(|b| b.as_ref()).collect();
        self.writer()?.write(&views)
    }

    /// Sparse only: records deletions for the given packed coordinate
    /// tuples. Deleted cells disappear from every read that sees this
    /// fragment.
    pub fn write_deletions(&mut self, coords: &[u8]) -> Result<()> {
        self.writer()?.write_deletions(coords)
    }

    /// Makes everything written so far durable; in the sorted write path
    /// also visible to future opens. No-op before the first write.
    pub fn sync(&mut self) -> Result<()> {
        if self.mode == Mode::Read || self.writer.is_none() {
            return Ok(());
        }
        let dir = self.dir.clone();
        self.writer()?.sync(&dir)
    }

    /// Fsyncs the tile files of one attribute of the open fragment.
    pub fn sync_attribute(&mut self, attr_name: &str) -> Result<()> {
        if self.mode == Mode::Read || self.writer.is_none() {
            return Ok(());
        }
        self.writer()?.sync_attribute(attr_name)
    }

    /// Seals the open fragment (write modes) and consumes the handle,
    /// returning the sealed fragment's name. A read handle, or a write
    /// handle that never wrote, seals nothing.
    pub fn finalize(mut self) -> Result<Option<String>> {
        match self.writer.take() {
            Some(writer) => Ok(Some(writer.seal(&self.dir)?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Narrows subsequent reads to a new subarray and rewinds the cell
    /// iterator.
    pub fn reset_subarray(&mut self, subarray: &[i64]) -> Result<()> {
        ensure!(
            self.mode == Mode::Read,
            "reset_subarray applies to read handles"
        );
        self.subarray = self.schema.parse_subarray(subarray)?;
        self.state = None;
        self.overflow.fill(false);
        Ok(())
    }

    /// Re-selects the buffers of subsequent reads and rewinds the cell
    /// iterator.
    pub fn reset_attributes(&mut self, attrs: Option<&[&str]>) -> Result<()> {
        ensure!(
            self.mode == Mode::Read,
            "reset_attributes applies to read handles"
        );
        self.targets = Self::resolve_targets(&self.schema, self.mode, attrs)?;
        self.overflow = vec![false; self.targets.len()];
        self.state = None;
        Ok(())
    }

    /// Fills the caller's buffers with the next run of cells in global
    /// order, newest fragment winning on duplicate coordinates. Sets
    /// `sizes[i]` to the bytes written into `buffers[i]`. Returns
    /// `Incomplete` and flags [`Array::overflow`] when a buffer filled up;
    /// calling again resumes. A `Completed` call that wrote zero bytes
    /// means the subarray is exhausted.
    pub fn read(&mut self, buffers: &mut [&mut [u8]], sizes: &mut [usize]) -> Result<ReadStatus> {
        ensure!(self.mode == Mode::Read, "array '{}' is open for writing", self.schema.name());
        ensure!(
            buffers.len() == self.targets.len() && sizes.len() == self.targets.len(),
            "read expects {} buffers, got {} (sizes: {})",
            self.targets.len(),
            buffers.len(),
            sizes.len()
        );
        self.overflow.fill(false);
        sizes.fill(0);

        if self.state.is_none() {
            self.state = Some(ReadState::new(&self.schema, &self.fragments, &self.subarray, &self.targets)?);
        }
        let state = self.state.as_mut().expect("just created"); // INVARIANT: set above
        state.read(
            &self.schema,
            &self.fragments,
            &self.cache,
            &self.subarray,
            &self.targets,
            buffers,
            sizes,
            &mut self.overflow,
        )
    }

    /// Whether the last `read` stopped because buffer `buffer_idx` was
    /// full.
    pub fn overflow(&self, buffer_idx: usize) -> bool {
        self.overflow.get(buffer_idx).copied().unwrap_or(false)
    }

    pub(crate) fn overflow_any(&self) -> bool {
        self.overflow.iter().any(|&flag| flag)
    }

    pub(crate) fn fragments(&self) -> &[FragmentReader] {
        &self.fragments
    }

    /// Names of the live fragments this handle snapshot sees, oldest
    /// first.
    pub fn fragment_names(&self) -> Vec<String> {
        self.fragments.iter().map(|f| f.name().to_string()).collect()
    }

    /// Turns this read handle into a cell-at-a-time iterator with internal
    /// buffers of the given sizes (bytes, one per selected buffer).
    pub fn into_iter_cells(self, buffer_sizes: &[usize]) -> Result<ArrayIterator> {
        ensure!(self.mode == Mode::Read, "cell iteration requires a read handle");
        ArrayIterator::new(self, buffer_sizes)
    }
}

impl Mode {
    pub fn is_write(self) -> bool {
        matches!(self, Mode::Write | Mode::WriteUnsorted)
    }
}

impl std::fmt::Debug for Array {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Array")
            .field("name", &self.schema.name())
            .field("mode", &self.mode)
            .field("fragments", &self.fragments.len())
            .finish()
    }
}
