//! # Tiles
//!
//! The tile is the I/O and compression unit. On the write path a
//! [`TileBuilder`] accumulates cells for one attribute (or for the
//! coordinates) until it reaches its cell budget; the fragment writer then
//! flushes all current tiles together so attribute tile `k` stays
//! positionally aligned with coordinate tile `k`. On the read path a
//! [`DecodedTile`] is the decompressed image of one tile, shared between
//! readers via `Arc` through the tile cache.
//!
//! ## Variable-Length Tiles
//!
//! A variable-length attribute is a pair of files: the payload file holds
//! concatenated cell values, the offsets file holds one `u64` start offset
//! per cell plus a terminating total size. Offsets are relative to their
//! own tile's payload, so each (payload tile, offsets tile) pair
//! decompresses independently of the rest of the file.

use eyre::{ensure, Result};

/// Accumulates cells of one attribute for the tile currently being built.
#[derive(Debug)]
pub struct TileBuilder {
    /// Fixed bytes per cell, `None` for variable-length.
    cell_size: Option<usize>,
    max_cells: u64,
    payload: Vec<u8>,
    /// Var only: start offset of each appended cell.
    offsets: Vec<u64>,
    cell_count: u64,
}

impl TileBuilder {
    pub fn fixed(cell_size: usize, max_cells: u64) -> Self {
        Self {
            cell_size: Some(cell_size),
            max_cells,
            payload: Vec::with_capacity(cell_size * max_cells as usize),
            offsets: Vec::new(),
            cell_count: 0,
        }
    }

    pub fn var(max_cells: u64) -> Self {
        Self {
            cell_size: None,
            max_cells,
            payload: Vec::new(),
            offsets: Vec::with_capacity(max_cells as usize),
            cell_count: 0,
        }
    }

    pub fn append(&mut self, cell: &[u8]) -> Result<()> {
        ensure!(self.cell_count < self.max_cells, "tile is full");
        if let Some(cell_size) = self.cell_size {
            ensure!(
                cell.len() == cell_size,
                "cell of {} bytes appended to a tile of {}-byte cells",
                cell.len(),
                cell_size
            );
        } else {
            self.offsets.push(self.payload.len() as u64);
        }
        self.payload.extend_from_slice(cell);
        self.cell_count += 1;
        Ok(())
    }

    pub fn cell_count(&self) -> u64 {
        self.cell_count
    }

    pub fn is_empty(&self) -> bool {
        self.cell_count == 0
    }

    pub fn full(&self) -> bool {
        self.cell_count >= self.max_cells
    }

    /// Serialized payload tile. For fixed attributes this is the cell data
    /// verbatim.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialized offsets tile: per-cell starts plus the terminating total
    /// size. Empty for fixed-size tiles.
    pub fn offsets_tile(&self) -> Vec<u8> {
        if self.cell_size.is_some() {
            return Vec::new();
        }
        let mut bytes = Vec::with_capacity((self.offsets.len() + 1) * 8);
        for &offset in &self.offsets {
            bytes.extend(offset.to_le_bytes());
        }
        bytes.extend((self.payload.len() as u64).to_le_bytes());
        bytes
    }

    /// Empties the builder for the next tile, keeping its allocation.
    pub fn reset(&mut self) {
        self.payload.clear();
        self.offsets.clear();
        self.cell_count = 0;
    }
}

/// Immutable decompressed tile on the read path.
#[derive(Debug)]
pub struct DecodedTile {
    payload: Vec<u8>,
    /// Var only: per-cell start offsets plus terminating size.
    offsets: Option<Vec<u64>>,
    cell_size: Option<usize>,
}

impl DecodedTile {
    pub fn fixed(payload: Vec<u8>, cell_size: usize) -> Result<Self> {
        ensure!(cell_size > 0, "fixed tiles need a positive cell size");
        ensure!(
            payload.len() % cell_size == 0,
            "tile of {} bytes is not a whole number of {}-byte cells",
            payload.len(),
            cell_size
        );
        Ok(Self {
            payload,
            offsets: None,
            cell_size: Some(cell_size),
        })
    }

    /// Assembles a variable tile from its decompressed payload and offsets
    /// tiles.
    pub fn var(payload: Vec<u8>, offsets_tile: &[u8]) -> Result<Self> {
        ensure!(
            offsets_tile.len() % 8 == 0 && !offsets_tile.is_empty(),
            "offsets tile of {} bytes is malformed",
            offsets_tile.len()
        );
        let mut offsets = Vec::with_capacity(offsets_tile.len() / 8);
        for chunk in offsets_tile.chunks_exact(8) {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            offsets.push(u64::from_le_bytes(buf));
        }
        ensure!(
            offsets.windows(2).all(|w| w[0] <= w[1]),
            "offsets tile is not monotonically increasing"
        );
        ensure!(
            *offsets.last().expect("nonempty by construction") == payload.len() as u64, // INVARIANT: length checked above
            "offsets terminator {} disagrees with payload length {}",
            offsets.last().expect("nonempty by construction"),
            payload.len()
        );
        Ok(Self {
            payload,
            offsets: Some(offsets),
            cell_size: None,
        })
    }

    pub fn cell_count(&self) -> u64 {
        match (&self.offsets, self.cell_size) {
            (Some(offsets), _) => (offsets.len() - 1) as u64,
            (None, Some(cell_size)) => (self.payload.len() / cell_size) as u64,
            // INVARIANT: constructors always set exactly one of the two.
            (None, None) => unreachable!("tile without shape"),
        }
    }

    /// Value bytes of cell `i`.
    pub fn cell(&self, i: u64) -> &[u8] {
        match (&self.offsets, self.cell_size) {
            (Some(offsets), _) => {
                let start = offsets[i as usize] as usize;
                let end = offsets[i as usize + 1] as usize;
                &self.payload[start..end]
            }
            (None, Some(cell_size)) => {
                let start = i as usize * cell_size;
                &self.payload[start..start + cell_size]
            }
            (None, None) => unreachable!("tile without shape"),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Memory footprint, used for cache accounting.
    pub fn nbytes(&self) -> usize {
        self.payload.len() + self.offsets.as_ref().map_or(0, |o| o.len() * 8)
    }
}
