//! # Fragment Writer
//!
//! Materializes one write batch as a fragment directory. The writer moves
//! through `INIT -> BUFFERING -> FLUSHING -> SEALED`:
//!
//! - `INIT`: the fragment directory and its (empty) tile files exist.
//! - `BUFFERING`: one in-memory tile per file slot accumulates cells. When
//!   the current tiles reach their cell budget, all of them flush together
//!   so attribute tile `k` stays aligned with coordinate tile `k`.
//! - `FLUSHING`: compress each tile, append to its file, record offset,
//!   size, MBR, and bounding coordinates in the in-memory book-keeping.
//! - `SEALED`: final partial tiles flush, every file fsyncs, and the
//!   book-keeping file is published atomically LAST. Its presence is the
//!   commit marker; a crash at any earlier point leaves a directory that
//!   every reader ignores.
//!
//! ## Input Shapes
//!
//! - **Sorted sparse**: cells arrive already in the array's global order
//!   (space-tile order, then cell order); the writer tiles them as they
//!   stream through and rejects order violations.
//! - **Unsorted sparse**: cells accumulate raw; at seal they are sorted by
//!   the global order key (stable, so a repeated coordinate keeps its last
//!   write) and then tiled. The sort scratch lives in a bump arena that is
//!   dropped wholesale when sealing finishes.
//! - **Dense**: cells arrive in array cell order over the full domain; the
//!   writer re-tiles the gathered batch at seal, one tile extent block at
//!   a time.
//!
//! A `sync` in the sorted path flushes the current partial tiles, fsyncs,
//! and publishes a book-keeping snapshot, making everything written so far
//! durable and visible to future opens; the fragment stays open for more
//! cells. Accumulating paths (unsorted, dense) have nothing coherent to
//! publish mid-batch and become durable at seal.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::ThreadId;

use bumpalo::Bump;
use eyre::{ensure, Result};
use log::debug;

use crate::codec::Compressor;
use crate::config::IoMethod;
use crate::io::{self, FileAppender};
use crate::schema::{ArraySchema, Coords, GlobalKey};
use crate::tile::TileBuilder;

use super::book_keeping::BookKeeping;
use super::{
    attr_path, attr_var_path, book_keeping_path, coords_path, register_fragment, slot_count,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Buffering,
    Sealed,
}

/// How the batch arrives; see the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOrder {
    /// Cells arrive in the array's global order. Sparse batches carry
    /// coordinates and are checked; dense batches (the consolidation
    /// path) are trusted and stream straight into tiles.
    Sorted,
    /// Sparse only: cells arrive in any order and are sorted at seal.
    Unsorted,
    /// Dense only: cells arrive in array cell order over the full domain
    /// and are re-tiled at seal.
    ArrayOrder,
}

/// Per-slot accumulator for batches that cannot be tiled on the fly.
#[derive(Debug, Default)]
struct SlotAcc {
    payload: Vec<u8>,
    /// Var slots: start offset of each accumulated cell.
    starts: Vec<u64>,
}

impl SlotAcc {
    fn cell(&self, cell_size: Option<usize>, i: u64) -> &[u8] {
        match cell_size {
            Some(size) => {
                let start = i as usize * size;
                &self.payload[start..start + size]
            }
            None => {
                let start = self.starts[i as usize] as usize;
                let end = self
                    .starts
                    .get(i as usize + 1)
                    .map_or(self.payload.len(), |&s| s as usize);
                &self.payload[start..end]
            }
        }
    }
}

/// Parsed view of one write call's buffers for one file slot.
struct SlotInput<'a> {
    data: &'a [u8],
    /// Var slots: parsed cell start offsets.
    starts: Vec<u64>,
    cell_size: Option<usize>,
}

impl<'a> SlotInput<'a> {
    fn cell(&self, i: u64) -> &'a [u8] {
        match self.cell_size {
            Some(size) => {
                let start = i as usize * size;
                &self.data[start..start + size]
            }
            None => {
                let start = self.starts[i as usize] as usize;
                let end = self
                    .starts
                    .get(i as usize + 1)
                    .map_or(self.data.len(), |&s| s as usize);
                &self.data[start..end]
            }
        }
    }
}

pub struct FragmentWriter {
    schema: Arc<ArraySchema>,
    name: String,
    dir: PathBuf,
    order: InputOrder,
    state: State,
    owner: ThreadId,

    appenders: Vec<FileAppender>,
    var_appenders: Vec<Option<FileAppender>>,
    book: BookKeeping,

    // Streaming (sorted sparse) state.
    tiles: Vec<TileBuilder>,
    mbr: Vec<(i64, i64)>,
    first_coords: Option<Coords>,
    last_coords: Option<Coords>,
    last_key: Option<GlobalKey>,

    // Accumulating (unsorted sparse / dense) state.
    acc: Vec<SlotAcc>,
    acc_cells: u64,
}

impl FragmentWriter {
    /// Creates the fragment directory and its tile files. `INIT` is left
    /// behind as soon as the first cell arrives.
    pub fn create(
        array_dir: &Path,
        schema: Arc<ArraySchema>,
        name: String,
        write_method: IoMethod,
        order: InputOrder,
    ) -> Result<Self> {
        if schema.is_dense() {
            ensure!(
                order != InputOrder::Unsorted,
                "dense arrays take ordered writes only; cells already arrive in cell order"
            );
        } else {
            ensure!(
                order != InputOrder::ArrayOrder,
                "array-order input is a dense write shape"
            );
        }

        let dir = array_dir.join(&name);
        io::create_dir(&dir)?;

        let slots = slot_count(&schema);
        let mut appenders = Vec::with_capacity(slots);
        let mut var_appenders = Vec::with_capacity(slots);
        for slot in 0..slots {
            let (path, var_path) = Self::slot_paths(&schema, &dir, slot);
            appenders.push(FileAppender::create(&path, write_method)?);
            var_appenders.push(match var_path {
                Some(p) => Some(FileAppender::create(&p, write_method)?),
                None => None,
            });
        }

        let tiles = Self::fresh_tiles(&schema);
        debug!("fragment {} created under {}", name, array_dir.display());

        Ok(Self {
            book: BookKeeping::new(&schema),
            schema,
            name,
            dir,
            order,
            state: State::Init,
            owner: std::thread::current().id(),
            appenders,
            var_appenders,
            tiles,
            mbr: Vec::new(),
            first_coords: None,
            last_coords: None,
            last_key: None,
            acc: (0..slots).map(|_| SlotAcc::default()).collect(),
            acc_cells: 0,
        })
    }

    fn slot_paths(schema: &ArraySchema, dir: &Path, slot: usize) -> (PathBuf, Option<PathBuf>) {
        if slot == schema.attribute_num() {
            (coords_path(dir), None)
        } else {
            let attr = schema.attribute(slot);
            let var = attr.is_var().then(|| attr_var_path(dir, &attr.name));
            (attr_path(dir, &attr.name), var)
        }
    }

    fn fresh_tiles(schema: &ArraySchema) -> Vec<TileBuilder> {
        let max_cells = if schema.is_dense() {
            schema.tile_cell_num().expect("dense schemas always carry extents") // INVARIANT: schema validation
        } else {
            schema.capacity()
        };
        let mut tiles = Vec::with_capacity(slot_count(schema));
        for attr in schema.attributes() {
            tiles.push(match attr.cell_size() {
                Some(size) => TileBuilder::fixed(size, max_cells),
                None => TileBuilder::var(max_cells),
            });
        }
        if !schema.is_dense() {
            tiles.push(TileBuilder::fixed(schema.coords_size(), max_cells));
        }
        tiles
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn slot_compressor(&self, slot: usize) -> Compressor {
        if slot == self.schema.attribute_num() {
            Compressor::None
        } else {
            self.schema.attribute(slot).compressor
        }
    }

    fn check_owner(&self) -> Result<()> {
        ensure!(
            std::thread::current().id() == self.owner,
            "fragment '{}' is owned by another thread; concurrent writes to \
             one fragment are not supported",
            self.name
        );
        Ok(())
    }

    /// Parses and cross-checks one write call's buffers. Expects one buffer
    /// per fixed attribute, two (offsets, payload) per variable attribute,
    /// and for sparse arrays the coordinates buffer last. Returns the
    /// per-slot views plus the shared cell count.
    fn parse_buffers<'a>(&self, buffers: &[&'a [u8]]) -> Result<(Vec<SlotInput<'a>>, u64)> {
        let schema = &self.schema;
        let mut expected = 0usize;
        for attr in schema.attributes() {
            expected += if attr.is_var() { 2 } else { 1 };
        }
        if !schema.is_dense() {
            expected += 1;
        }
        ensure!(
            buffers.len() == expected,
            "write expects {} buffers, got {}",
            expected,
            buffers.len()
        );

        let mut slots = Vec::with_capacity(slot_count(schema));
        let mut next = 0usize;
        let mut count: Option<u64> = None;
        let mut check_count = |n: u64, what: &str| -> Result<()> {
            match count {
                None => count = Some(n),
                Some(existing) => ensure!(
                    existing == n,
                    "{} holds {} cells, earlier buffers hold {}",
                    what,
                    n,
                    existing
                ),
            }
            Ok(())
        };

        for attr in schema.attributes() {
            if attr.is_var() {
                let offsets_buf = buffers[next];
                let data = buffers[next + 1];
                next += 2;
                ensure!(
                    offsets_buf.len() % 8 == 0,
                    "offsets buffer of '{}' is not a whole number of u64s",
                    attr.name
                );
                let mut starts = Vec::with_capacity(offsets_buf.len() / 8);
                for chunk in offsets_buf.chunks_exact(8) {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(chunk);
                    starts.push(u64::from_le_bytes(raw));
                }
                if let Some(&first) = starts.first() {
                    ensure!(first == 0, "offsets of '{}' must start at 0", attr.name);
                }
                ensure!(
                    starts.windows(2).all(|w| w[0] <= w[1]),
                    "offsets of '{}' are not monotonic",
                    attr.name
                );
                if let Some(&last) = starts.last() {
                    ensure!(
                        last <= data.len() as u64,
                        "offsets of '{}' point past its payload",
                        attr.name
                    );
                }
                check_count(starts.len() as u64, &attr.name)?;
                slots.push(SlotInput { data, starts, cell_size: None });
            } else {
                let data = buffers[next];
                next += 1;
                let size = attr.cell_size().expect("fixed attribute has a size"); // INVARIANT: !is_var
                ensure!(
                    data.len() % size == 0,
                    "buffer of '{}' is not a whole number of {}-byte cells",
                    attr.name,
                    size
                );
                check_count((data.len() / size) as u64, &attr.name)?;
                slots.push(SlotInput { data, starts: Vec::new(), cell_size: Some(size) });
            }
        }

        if !schema.is_dense() {
            let data = buffers[next];
            let size = schema.coords_size();
            ensure!(
                data.len() % size == 0,
                "coordinates buffer is not a whole number of {}-byte tuples",
                size
            );
            check_count((data.len() / size) as u64, "coordinates")?;
            slots.push(SlotInput { data, starts: Vec::new(), cell_size: Some(size) });
        }

        Ok((slots, count.unwrap_or(0)))
    }

    /// Writes one batch of cells. See the module docs for the expected
    /// ordering per input shape.
    pub fn write(&mut self, buffers: &[&[u8]]) -> Result<()> {
        self.check_owner()?;
        ensure!(self.state != State::Sealed, "fragment is already sealed");
        let (slots, n) = self.parse_buffers(buffers)?;
        self.state = State::Buffering;

        if self.order != InputOrder::Sorted {
            return self.accumulate(&slots, n);
        }
        if self.schema.is_dense() {
            // Global-order dense stream: consecutive cells fill consecutive
            // tiles, no coordinates involved.
            for i in 0..n {
                for (slot, input) in slots.iter().enumerate() {
                    self.tiles[slot].append(input.cell(i))?;
                }
                if self.tiles[0].full() {
                    self.flush_tiles()?;
                }
            }
            return Ok(());
        }

        let coords_slot = self.schema.attribute_num();
        for i in 0..n {
            let coords = self.schema.decode_coords(slots[coords_slot].cell(i));
            for (d, &c) in coords.iter().enumerate() {
                let (lo, hi) = self.schema.domain()[d];
                ensure!(
                    c >= lo && c <= hi,
                    "coordinate {} of dimension {} is outside the domain [{}, {}]",
                    c,
                    d,
                    lo,
                    hi
                );
            }
            let key = self.schema.global_key(&coords);
            if let Some(last) = &self.last_key {
                ensure!(
                    *last <= key,
                    "cells are not in the array's global order; use the unsorted write mode"
                );
            }
            self.last_key = Some(key);
            self.append_cell(&slots, i, &coords)?;
        }
        Ok(())
    }

    /// Records deletions for the given coordinate tuples: the cell is
    /// written with every attribute set to its reserved deletion sentinel,
    /// so it sorts and shadows exactly like an overwrite.
    pub fn write_deletions(&mut self, coords: &[u8]) -> Result<()> {
        ensure!(
            !self.schema.is_dense(),
            "deletions are a sparse-array operation"
        );
        let n = coords.len() / self.schema.coords_size();

        let mut synthetic: Vec<Vec<u8>> = Vec::new();
        for attr in self.schema.attributes() {
            let cell = attr.deletion_cell();
            if attr.is_var() {
                let mut offsets = Vec::with_capacity(n * 8);
                for i in 0..n {
                    offsets.extend(((i * cell.len()) as u64).to_le_bytes());
                }
                synthetic.push(offsets);
            }
            synthetic.push(cell.repeat(n));
        }
        synthetic.push(coords.to_vec());

        let views: Vec<&[u8]> = synthetic.iter().map(|b| b.as_slice()).collect();
        self.write(&views)
    }

    fn accumulate(&mut self, slots: &[SlotInput], n: u64) -> Result<()> {
        for (slot, input) in slots.iter().enumerate() {
            let acc = &mut self.acc[slot];
            if input.cell_size.is_none() {
                for i in 0..n {
                    acc.starts.push(acc.payload.len() as u64);
                    acc.payload.extend_from_slice(input.cell(i));
                }
            } else {
                acc.payload.extend_from_slice(input.data);
            }
        }
        self.acc_cells += n;
        Ok(())
    }

    /// Fixed cell size per slot, `None` for variable attributes.
    fn slot_cell_sizes(&self) -> Vec<Option<usize>> {
        let mut sizes: Vec<Option<usize>> = self
            .schema
            .attributes()
            .iter()
            .map(|a| a.cell_size())
            .collect();
        if !self.schema.is_dense() {
            sizes.push(Some(self.schema.coords_size()));
        }
        sizes
    }

    /// Appends cell `i` of the parsed input to every current tile, tracking
    /// the sparse MBR and bounding coordinates, and flushes once the tiles
    /// hit their budget.
    fn append_cell(&mut self, slots: &[SlotInput], i: u64, coords: &Coords) -> Result<()> {
        for (slot, input) in slots.iter().enumerate() {
            self.tiles[slot].append(input.cell(i))?;
        }
        self.note_sparse_cell(coords);
        if self.tiles[0].full() {
            self.flush_tiles()?;
        }
        Ok(())
    }

    fn note_sparse_cell(&mut self, coords: &Coords) {
        if self.schema.is_dense() {
            return;
        }
        ArraySchema::expand_mbr(&mut self.mbr, coords);
        if self.first_coords.is_none() {
            self.first_coords = Some(coords.clone());
        }
        self.last_coords = Some(coords.clone());
    }

    /// Flushes all current tiles together: compress, append, record. The
    /// joint flush keeps attribute tile `k` aligned with coordinate tile
    /// `k` even for partial tiles.
    fn flush_tiles(&mut self) -> Result<()> {
        if self.tiles[0].is_empty() {
            return Ok(());
        }
        for slot in 0..self.tiles.len() {
            let compressor = self.slot_compressor(slot);
            let frame = compressor.compress(self.tiles[slot].payload())?;
            let offset = self.appenders[slot].append(&frame)?;
            self.book.record_tile(slot, offset, frame.len() as u64);

            if let Some(var_appender) = &mut self.var_appenders[slot] {
                let offsets_frame = compressor.compress(&self.tiles[slot].offsets_tile())?;
                let var_offset = var_appender.append(&offsets_frame)?;
                self.book
                    .record_var_tile(slot, var_offset, offsets_frame.len() as u64);
            }
            self.tiles[slot].reset();
        }

        if !self.schema.is_dense() {
            let first = self.first_coords.take().expect("flushed tile has cells"); // INVARIANT: is_empty checked above
            let last = self.last_coords.take().expect("flushed tile has cells"); // INVARIANT: same
            let mbr = std::mem::take(&mut self.mbr);
            self.book.record_sparse_tile(mbr, first, last);
        }
        Ok(())
    }

    /// Sorts the accumulated unsorted batch by the global order key and
    /// tiles it. Stable sorting keeps repeated coordinates in input order,
    /// so the later write of a duplicate lands later in the fragment and
    /// wins at read time.
    fn emit_unsorted(&mut self) -> Result<()> {
        let coords_slot = self.schema.attribute_num();
        let sizes = self.slot_cell_sizes();
        let acc = std::mem::take(&mut self.acc);
        let schema = Arc::clone(&self.schema);

        let arena = Bump::new();
        let mut order =
            bumpalo::collections::Vec::with_capacity_in(self.acc_cells as usize, &arena);
        for i in 0..self.acc_cells {
            let coords = schema.decode_coords(acc[coords_slot].cell(sizes[coords_slot], i));
            for (d, &c) in coords.iter().enumerate() {
                let (lo, hi) = schema.domain()[d];
                ensure!(
                    c >= lo && c <= hi,
                    "coordinate {} of dimension {} is outside the domain [{}, {}]",
                    c,
                    d,
                    lo,
                    hi
                );
            }
            order.push((schema.global_key(&coords), i, coords));
        }
        order.sort_by(|a, b| a.0.cmp(&b.0));

        for (_, i, coords) in order.iter() {
            for slot in 0..self.tiles.len() {
                self.tiles[slot].append(acc[slot].cell(sizes[slot], *i))?;
            }
            self.note_sparse_cell(coords);
            if self.tiles[0].full() {
                self.flush_tiles()?;
            }
        }
        self.flush_tiles()
    }

    /// Re-tiles the gathered dense batch: the input is the full domain in
    /// array cell order, emitted one tile extent block at a time in tile
    /// order.
    fn emit_dense(&mut self) -> Result<()> {
        let schema = &self.schema;
        let domain_cells: u64 = schema
            .domain()
            .iter()
            .map(|&(lo, hi)| (hi - lo + 1) as u64)
            .product();
        ensure!(
            self.acc_cells == domain_cells,
            "dense write covers {} cells, the domain has {}",
            self.acc_cells,
            domain_cells
        );

        let spans: Vec<i64> = schema.domain().iter().map(|&(lo, hi)| hi - lo + 1).collect();
        let counts = schema.tile_counts().expect("dense schemas always carry extents"); // INVARIANT: schema validation
        let tile_ranges: Vec<(i64, i64)> = counts.iter().map(|&n| (0, n - 1)).collect();
        let col_tiles = schema.tile_order() == crate::schema::Layout::ColMajor;
        let col_cells = schema.cell_order() == crate::schema::Layout::ColMajor;
        let domain = schema.domain().to_vec();
        let sizes = self.slot_cell_sizes();
        let acc = std::mem::take(&mut self.acc);
        let schema = Arc::clone(&self.schema);

        for tile in crate::schema::order::RangeWalker::new(&tile_ranges, col_tiles) {
            let cell_ranges = schema.tile_cell_ranges(&tile);
            for coords in crate::schema::order::RangeWalker::new(&cell_ranges, col_cells) {
                let offsets: Coords = coords
                    .iter()
                    .zip(&domain)
                    .map(|(&c, &(lo, _))| c - lo)
                    .collect();
                let pos = crate::schema::order::linear_position(&offsets, &spans, col_cells);
                for slot in 0..self.tiles.len() {
                    self.tiles[slot].append(acc[slot].cell(sizes[slot], pos))?;
                }
            }
            self.flush_tiles()?;
        }
        Ok(())
    }

    /// Publishes the current book-keeping. The atomic rename makes this the
    /// commit point: before it the fragment is invisible, after it the
    /// fragment is live with exactly the recorded tiles.
    fn publish_book_keeping(&self) -> Result<()> {
        let bytes = self.book.serialize(&self.schema);
        io::write_file_atomic(&book_keeping_path(&self.dir), &bytes)
    }

    /// Durability point inside a sorted write: flush partial tiles, fsync
    /// every file, publish a book-keeping snapshot, and register the
    /// fragment so future opens see everything written so far. The
    /// fragment stays open for more cells.
    pub fn sync(&mut self, array_dir: &Path) -> Result<()> {
        self.check_owner()?;
        ensure!(self.state != State::Sealed, "fragment is already sealed");
        if self.order == InputOrder::Sorted && !self.schema.is_dense() {
            self.flush_tiles()?;
        }
        for appender in &self.appenders {
            appender.sync()?;
        }
        for var_appender in self.var_appenders.iter().flatten() {
            var_appender.sync()?;
        }
        if self.order == InputOrder::Sorted && !self.schema.is_dense() {
            self.publish_book_keeping()?;
            register_fragment(array_dir, &self.name)?;
        }
        Ok(())
    }

    /// Fsyncs the tile files of one attribute.
    pub fn sync_attribute(&mut self, attr_name: &str) -> Result<()> {
        self.check_owner()?;
        let slot = self.schema.attribute_index(attr_name)?;
        self.appenders[slot].sync()?;
        if let Some(var_appender) = &self.var_appenders[slot] {
            var_appender.sync()?;
        }
        Ok(())
    }

    /// Seals the fragment: emits any deferred batch, flushes the last
    /// partial tiles, fsyncs everything, publishes the book-keeping, and
    /// registers the fragment in the array's fragment list. On any earlier
    /// error the directory simply never gains its commit marker.
    pub fn seal(mut self, array_dir: &Path) -> Result<String> {
        self.check_owner()?;
        ensure!(self.state != State::Sealed, "fragment is already sealed");

        match (self.schema.is_dense(), self.order) {
            (true, InputOrder::ArrayOrder) => self.emit_dense()?,
            (true, _) => {
                // A global-order dense stream must land on a tile boundary;
                // dense tiles have no partial form.
                ensure!(
                    self.tiles[0].is_empty(),
                    "dense batch ended mid-tile ({} of {} cells)",
                    self.tiles[0].cell_count(),
                    self.schema.tile_cell_num().expect("dense schemas always carry extents") // INVARIANT: schema validation
                );
            }
            (false, InputOrder::Unsorted) => self.emit_unsorted()?,
            (false, _) => self.flush_tiles()?,
        }

        for appender in &self.appenders {
            appender.sync()?;
        }
        for var_appender in self.var_appenders.iter().flatten() {
            var_appender.sync()?;
        }

        self.publish_book_keeping()?;
        register_fragment(array_dir, &self.name)?;
        self.state = State::Sealed;
        debug!("fragment {} sealed with {} tiles", self.name, self.book.tile_num());
        Ok(self.name)
    }
}
