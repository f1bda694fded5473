//! # Cell Iteration and K-Way Merge
//!
//! The read core. For a sparse query over fragments `F1..Fn` (oldest
//! first), one cursor per fragment yields that fragment's cells in the
//! array's global order restricted to the subarray. A min-heap keyed by
//! `(global order key, newest fragment first)` merges the cursors:
//!
//! 1. Pop the minimum; among equal coordinates the newest fragment pops
//!    first and the rest of the duplicate group is discarded.
//! 2. Within the winning fragment, a later cell with the same coordinates
//!    supersedes an earlier one, so the last write of a batch wins.
//! 3. A surviving deletion marker is skipped.
//! 4. Otherwise the cell is emitted into the caller's buffers.
//!
//! Emission stops the moment a buffer cannot take the next cell: the
//! affected buffers get their overflow flag, the cell parks in a pending
//! slot, and the next `read` call resumes deterministically. Splitting a
//! read into overflow-terminated chunks concatenates to exactly the
//! unbounded result.
//!
//! Dense arrays bypass the heap entirely: every dense fragment covers the
//! whole domain, so the newest fragment's tiles overlay everything and the
//! iterator walks them positionally in tile order.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use eyre::{bail, ensure, Result};

use crate::cache::TileCache;
use crate::fragment::reader::FragmentReader;
use crate::schema::order::{linear_position, RangeWalker};
use crate::schema::{ArraySchema, GlobalKey, Layout};
use crate::tile::DecodedTile;

use super::{Array, BufferTarget, ReadStatus};

/// One located cell: where it lives and how it sorts.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Located {
    key: GlobalKey,
    frag_idx: usize,
    tile_id: u64,
    cell_idx: u64,
}

impl Ord for Located {
    fn cmp(&self, other: &Self) -> Ordering {
        // Smallest key first; among equal keys the newest fragment.
        // Wrapped in `Reverse` inside the max-heap below.
        self.key
            .cmp(&other.key)
            .then_with(|| other.frag_idx.cmp(&self.frag_idx))
    }
}

impl PartialOrd for Located {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-fragment cursor over the cells of the selected tiles.
#[derive(Debug)]
struct Stream {
    frag_idx: usize,
    tiles: Vec<u64>,
    tile_pos: usize,
    cell_idx: u64,
    current: Option<Located>,
}

impl Stream {
    /// Advances to the next cell inside the subarray, loading coordinate
    /// tiles through the cache as the cursor crosses tile boundaries.
    fn advance(
        &mut self,
        schema: &ArraySchema,
        frag: &FragmentReader,
        cache: &TileCache,
        subarray: &[(i64, i64)],
    ) -> Result<()> {
        self.current = None;
        let coords_slot = frag.coords_slot();
        while self.tile_pos < self.tiles.len() {
            let tile_id = self.tiles[self.tile_pos];
            let coords_tile = frag.tile(cache, coords_slot, tile_id)?;
            while self.cell_idx < coords_tile.cell_count() {
                let cell_idx = self.cell_idx;
                self.cell_idx += 1;
                let coords = schema.decode_coords(coords_tile.cell(cell_idx));
                if schema.cell_in(&coords, subarray) {
                    self.current = Some(Located {
                        key: schema.global_key(&coords),
                        frag_idx: self.frag_idx,
                        tile_id,
                        cell_idx,
                    });
                    return Ok(());
                }
            }
            self.tile_pos += 1;
            self.cell_idx = 0;
        }
        Ok(())
    }
}

/// Copies located cells into the caller's buffers, tracking fill levels
/// and overflow flags for one `read` call.
struct Sink<'a, 'b> {
    buffers: &'a mut [&'b mut [u8]],
    sizes: &'a mut [usize],
    overflow: &'a mut [bool],
}

impl Sink<'_, '_> {
    /// Emits one cell, all buffers or none. Returns `false` (with the
    /// overflow flags of the lacking buffers set) when it does not fit.
    fn emit(
        &mut self,
        frag: &FragmentReader,
        cache: &TileCache,
        targets: &[BufferTarget],
        tile_id: u64,
        cell_idx: u64,
    ) -> Result<bool> {
        let mut tiles: Vec<Option<Arc<DecodedTile>>> = Vec::with_capacity(targets.len());
        for target in targets {
            tiles.push(match target {
                BufferTarget::Coords => Some(frag.tile(cache, frag.coords_slot(), tile_id)?),
                BufferTarget::Fixed(slot) | BufferTarget::VarPayload(slot) => {
                    Some(frag.tile(cache, *slot, tile_id)?)
                }
                BufferTarget::VarOffsets(_) => None,
            });
        }

        let mut fits = true;
        for (i, target) in targets.iter().enumerate() {
            let needed = match target {
                BufferTarget::VarOffsets(_) => 8,
                _ => tiles[i]
                    .as_ref()
                    .expect("non-offset targets fetched a tile") // INVARIANT: filled above
                    .cell(cell_idx)
                    .len(),
            };
            if self.sizes[i] + needed > self.buffers[i].len() {
                self.overflow[i] = true;
                fits = false;
            }
        }
        if !fits {
            return Ok(false);
        }

        for (i, target) in targets.iter().enumerate() {
            match target {
                BufferTarget::VarOffsets(_) => {
                    // The paired payload buffer sits right behind this one;
                    // its current fill is this cell's start offset.
                    let offset = self.sizes[i + 1] as u64;
                    self.buffers[i][self.sizes[i]..self.sizes[i] + 8]
                        .copy_from_slice(&offset.to_le_bytes());
                    self.sizes[i] += 8;
                }
                _ => {
                    let bytes = tiles[i]
                        .as_ref()
                        .expect("non-offset targets fetched a tile") // INVARIANT: filled above
                        .cell(cell_idx);
                    self.buffers[i][self.sizes[i]..self.sizes[i] + bytes.len()]
                        .copy_from_slice(bytes);
                    self.sizes[i] += bytes.len();
                }
            }
        }
        Ok(true)
    }
}

/// Resumable position of a read; rebuilt from scratch whenever the handle
/// resets its subarray or attribute selection.
#[derive(Debug)]
pub(crate) enum ReadState {
    Sparse(SparseState),
    Dense(DenseState),
}

#[derive(Debug)]
pub(crate) struct SparseState {
    streams: Vec<Stream>,
    pending: Option<Located>,
    primed: bool,
    /// Attribute consulted for the deletion sentinel, with its pattern.
    del_slot: usize,
    del_pattern: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct DenseState {
    tiles: Vec<(u64, Vec<(i64, i64)>)>,
    tile_pos: usize,
    walker: Option<RangeWalker>,
    pending: Option<(u64, u64)>,
    primed: bool,
}

impl ReadState {
    pub(crate) fn new(
        schema: &ArraySchema,
        fragments: &[FragmentReader],
        _subarray: &[(i64, i64)],
        targets: &[BufferTarget],
    ) -> Result<Self> {
        if schema.is_dense() {
            return Ok(ReadState::Dense(DenseState {
                tiles: Vec::new(),
                tile_pos: 0,
                walker: None,
                pending: None,
                primed: false,
            }));
        }

        // Any attribute works for the deletion check because a deletion
        // writes the sentinel into every attribute; prefer one already
        // selected so its tiles are warm.
        let del_slot = targets
            .iter()
            .find_map(|t| match t {
                BufferTarget::Fixed(slot) | BufferTarget::VarPayload(slot) => Some(*slot),
                _ => None,
            })
            .unwrap_or(0);
        let del_pattern = schema.attribute(del_slot).deletion_cell();

        let streams = fragments
            .iter()
            .enumerate()
            .map(|(frag_idx, _)| Stream {
                frag_idx,
                tiles: Vec::new(),
                tile_pos: 0,
                cell_idx: 0,
                current: None,
            })
            .collect();
        Ok(ReadState::Sparse(SparseState {
            streams,
            pending: None,
            primed: false,
            del_slot,
            del_pattern,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn read(
        &mut self,
        schema: &ArraySchema,
        fragments: &[FragmentReader],
        cache: &TileCache,
        subarray: &[(i64, i64)],
        targets: &[BufferTarget],
        buffers: &mut [&mut [u8]],
        sizes: &mut [usize],
        overflow: &mut [bool],
    ) -> Result<ReadStatus> {
        let mut sink = Sink { buffers, sizes, overflow };
        match self {
            ReadState::Sparse(state) => {
                state.read(schema, fragments, cache, subarray, targets, &mut sink)
            }
            ReadState::Dense(state) => {
                state.read(schema, fragments, cache, subarray, targets, &mut sink)
            }
        }
    }
}

impl SparseState {
    fn read(
        &mut self,
        schema: &ArraySchema,
        fragments: &[FragmentReader],
        cache: &TileCache,
        subarray: &[(i64, i64)],
        targets: &[BufferTarget],
        sink: &mut Sink,
    ) -> Result<ReadStatus> {
        if !self.primed {
            for stream in &mut self.streams {
                let frag = &fragments[stream.frag_idx];
                stream.tiles = frag.sparse_tiles_over(subarray);
                stream.advance(schema, frag, cache, subarray)?;
            }
            self.primed = true;
        }

        if let Some(pending) = self.pending.clone() {
            let frag = &fragments[pending.frag_idx];
            if !sink.emit(frag, cache, targets, pending.tile_id, pending.cell_idx)? {
                return Ok(ReadStatus::Incomplete);
            }
            self.pending = None;
        }

        let mut heap: BinaryHeap<Reverse<Located>> = self
            .streams
            .iter()
            .filter_map(|s| s.current.clone())
            .map(Reverse)
            .collect();

        loop {
            let Some(Reverse(top)) = heap.pop() else {
                return Ok(ReadStatus::Completed);
            };

            // Older fragments' cells at the same coordinates are shadowed.
            while let Some(Reverse(peek)) = heap.peek() {
                if peek.key != top.key {
                    break;
                }
                let Reverse(shadowed) = heap.pop().expect("peeked above"); // INVARIANT: peek returned Some
                let stream = &mut self.streams[shadowed.frag_idx];
                stream.advance(schema, &fragments[shadowed.frag_idx], cache, subarray)?;
                if let Some(next) = stream.current.clone() {
                    heap.push(Reverse(next));
                }
            }

            // Within the winning fragment a later duplicate supersedes.
            let mut winner = top;
            loop {
                let stream = &mut self.streams[winner.frag_idx];
                stream.advance(schema, &fragments[winner.frag_idx], cache, subarray)?;
                match stream.current.clone() {
                    Some(next) if next.key == winner.key => winner = next,
                    Some(next) => {
                        heap.push(Reverse(next));
                        break;
                    }
                    None => break,
                }
            }

            let frag = &fragments[winner.frag_idx];
            let marker_tile = frag.tile(cache, self.del_slot, winner.tile_id)?;
            if marker_tile.cell(winner.cell_idx) == self.del_pattern.as_slice() {
                continue;
            }

            if !sink.emit(frag, cache, targets, winner.tile_id, winner.cell_idx)? {
                self.pending = Some(winner);
                return Ok(ReadStatus::Incomplete);
            }
        }
    }
}

impl DenseState {
    fn read(
        &mut self,
        schema: &ArraySchema,
        fragments: &[FragmentReader],
        cache: &TileCache,
        subarray: &[(i64, i64)],
        targets: &[BufferTarget],
        sink: &mut Sink,
    ) -> Result<ReadStatus> {
        // Every dense fragment covers the full domain, so the newest one
        // shadows the rest tile for tile.
        let Some(frag) = fragments.last() else {
            return Ok(ReadStatus::Completed);
        };

        if !self.primed {
            self.tiles = frag.dense_tiles_over(subarray);
            self.primed = true;
        }

        if let Some((tile_id, pos)) = self.pending {
            if !sink.emit(frag, cache, targets, tile_id, pos)? {
                return Ok(ReadStatus::Incomplete);
            }
            self.pending = None;
        }

        let extents = schema.tile_extents().expect("dense schemas always carry extents"); // INVARIANT: schema validation
        let col_cells = schema.cell_order() == Layout::ColMajor;

        loop {
            if self.walker.is_none() {
                if self.tile_pos >= self.tiles.len() {
                    return Ok(ReadStatus::Completed);
                }
                let (_, tile_ranges) = &self.tiles[self.tile_pos];
                let visible: Vec<(i64, i64)> = tile_ranges
                    .iter()
                    .zip(subarray)
                    .map(|(&(tlo, thi), &(qlo, qhi))| (tlo.max(qlo), thi.min(qhi)))
                    .collect();
                self.walker = Some(RangeWalker::new(&visible, col_cells));
            }

            let (tile_id, tile_ranges) = self.tiles[self.tile_pos].clone();
            let walker = self.walker.as_mut().expect("set above"); // INVARIANT: initialized in this iteration
            while let Some(coords) = walker.next() {
                let offsets: crate::schema::Coords = coords
                    .iter()
                    .zip(&tile_ranges)
                    .map(|(&c, &(tlo, _))| c - tlo)
                    .collect();
                let pos = linear_position(&offsets, extents, col_cells);
                if !sink.emit(frag, cache, targets, tile_id, pos)? {
                    self.pending = Some((tile_id, pos));
                    return Ok(ReadStatus::Incomplete);
                }
            }
            self.walker = None;
            self.tile_pos += 1;
        }
    }
}

/// Cell-at-a-time façade over the read path. Owns the handle plus a set
/// of internal buffers and refills them on demand, so callers can walk
/// cells without managing overflow themselves.
pub struct ArrayIterator {
    array: Array,
    buffers: Vec<Vec<u8>>,
    sizes: Vec<usize>,
    cursors: Vec<usize>,
    cell: usize,
    cells_in_batch: usize,
    end: bool,
}

impl ArrayIterator {
    pub(crate) fn new(array: Array, buffer_sizes: &[usize]) -> Result<Self> {
        ensure!(
            buffer_sizes.len() == array.targets().len(),
            "iterator expects {} buffer sizes, got {}",
            array.targets().len(),
            buffer_sizes.len()
        );
        let buffers: Vec<Vec<u8>> = buffer_sizes.iter().map(|&n| vec![0u8; n]).collect();
        let sizes = vec![0usize; buffers.len()];
        let cursors = vec![0usize; buffers.len()];
        let mut iter = Self {
            array,
            buffers,
            sizes,
            cursors,
            cell: 0,
            cells_in_batch: 0,
            end: false,
        };
        iter.refill()?;
        Ok(iter)
    }

    fn refill(&mut self) -> Result<()> {
        let mut views: Vec<&mut [u8]> = self.buffers.iter_mut().map(|b| b.as_mut_slice()).collect();
        self.array.read(&mut views, &mut self.sizes)?;

        self.cursors.fill(0);
        self.cell = 0;
        self.cells_in_batch = self.batch_cell_count()?;
        if self.cells_in_batch == 0 {
            if self.sizes.iter().any(|&s| s > 0) || self.array.overflow_any() {
                bail!("iterator buffers are too small for a single cell");
            }
            self.end = true;
        }
        Ok(())
    }

    fn batch_cell_count(&self) -> Result<usize> {
        for (i, target) in self.array.targets().iter().enumerate() {
            let width = match target {
                BufferTarget::Coords => self.array.schema().coords_size(),
                BufferTarget::Fixed(slot) => self
                    .array
                    .schema()
                    .attribute(*slot)
                    .cell_size()
                    .expect("fixed target has a size"), // INVARIANT: target kind
                BufferTarget::VarOffsets(_) => 8,
                BufferTarget::VarPayload(_) => continue,
            };
            return Ok(self.sizes[i] / width);
        }
        bail!("no countable buffer in the selection")
    }

    /// `true` once every cell of the subarray has been visited.
    pub fn end(&self) -> bool {
        self.end
    }

    /// Bytes of the current cell in buffer `buffer_idx`.
    pub fn value(&self, buffer_idx: usize) -> Result<&[u8]> {
        ensure!(!self.end, "iterator is exhausted");
        ensure!(
            buffer_idx < self.buffers.len(),
            "buffer index {} out of range",
            buffer_idx
        );
        let width = self.value_width(buffer_idx);
        let start = self.cursors[buffer_idx];
        Ok(&self.buffers[buffer_idx][start..start + width])
    }

    fn value_width(&self, buffer_idx: usize) -> usize {
        match self.array.targets()[buffer_idx] {
            BufferTarget::Coords => self.array.schema().coords_size(),
            BufferTarget::Fixed(slot) => self
                .array
                .schema()
                .attribute(slot)
                .cell_size()
                .expect("fixed target has a size"), // INVARIANT: target kind
            BufferTarget::VarOffsets(_) => 8,
            BufferTarget::VarPayload(_) => {
                // Sibling offsets buffer precedes the payload buffer.
                let offsets_idx = buffer_idx - 1;
                let start = self.offset_at(offsets_idx, self.cell);
                let end = if self.cell + 1 < self.cells_in_batch {
                    self.offset_at(offsets_idx, self.cell + 1)
                } else {
                    self.sizes[buffer_idx] as u64
                };
                (end - start) as usize
            }
        }
    }

    fn offset_at(&self, offsets_idx: usize, cell: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buffers[offsets_idx][cell * 8..cell * 8 + 8]);
        u64::from_le_bytes(raw)
    }

    /// Moves to the next cell, transparently refilling the internal
    /// buffers from the array.
    pub fn next(&mut self) -> Result<()> {
        ensure!(!self.end, "iterator is exhausted");
        for i in 0..self.buffers.len() {
            self.cursors[i] += self.value_width(i);
        }
        self.cell += 1;
        if self.cell >= self.cells_in_batch {
            self.refill()?;
        }
        Ok(())
    }

    /// Releases the iterator, handing the underlying handle back for
    /// finalization.
    pub fn finalize(self) -> Array {
        self.array
    }
}
