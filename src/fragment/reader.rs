//! # Fragment Reader
//!
//! Read-time view of one live fragment: decodes the book-keeping into
//! memory, opens the tile files with the configured read method, selects
//! the tiles a subarray touches, and serves decompressed tiles through the
//! shared cache.
//!
//! Book-keeping is read-only after open, so a reader needs no locking; the
//! only shared mutable structure it touches is the tile cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};

use crate::cache::TileCache;
use crate::config::IoMethod;
use crate::io::{self, FileReader};
use crate::schema::{ArraySchema, Coords, Layout};
use crate::tile::DecodedTile;

use super::book_keeping::BookKeeping;
use super::{attr_path, attr_var_path, book_keeping_path, coords_path, is_live, slot_count};

pub struct FragmentReader {
    name: String,
    /// Process-wide id used in tile cache keys; stable across handles via
    /// the manager's open-fragment registry.
    uid: u64,
    dir: PathBuf,
    schema: Arc<ArraySchema>,
    book: BookKeeping,
    files: Vec<FileReader>,
    var_files: Vec<Option<FileReader>>,
}

impl FragmentReader {
    /// Opens a live fragment. Fails on a missing commit marker or a
    /// corrupt book-keeping file; the caller decides whether to skip the
    /// fragment or abort the open.
    pub fn open(
        array_dir: &Path,
        name: &str,
        uid: u64,
        schema: Arc<ArraySchema>,
        read_method: IoMethod,
    ) -> Result<Self> {
        let dir = array_dir.join(name);
        ensure!(
            is_live(&dir),
            "fragment '{}' has no book-keeping file; it never committed",
            name
        );
        let bytes = io::read_file(&book_keeping_path(&dir))?;
        let book = BookKeeping::load(&schema, &bytes)
            .wrap_err_with(|| format!("corrupt book-keeping in fragment '{}'", name))?;

        let slots = slot_count(&schema);
        let mut files = Vec::with_capacity(slots);
        let mut var_files = Vec::with_capacity(slots);
        for slot in 0..slots {
            if slot == schema.attribute_num() {
                files.push(FileReader::open(&coords_path(&dir), read_method)?);
                var_files.push(None);
            } else {
                let attr = schema.attribute(slot);
                files.push(FileReader::open(&attr_path(&dir, &attr.name), read_method)?);
                var_files.push(if attr.is_var() {
                    Some(FileReader::open(&attr_var_path(&dir, &attr.name), read_method)?)
                } else {
                    None
                });
            }
        }

        Ok(Self {
            name: name.to_string(),
            uid,
            dir,
            schema,
            book,
            files,
            var_files,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tile_num(&self) -> u64 {
        self.book.tile_num()
    }

    pub fn coords_slot(&self) -> usize {
        self.schema.attribute_num()
    }

    pub fn mbr(&self, tile_id: u64) -> &[(i64, i64)] {
        self.book.mbr(tile_id)
    }

    pub fn bounding(&self, tile_id: u64) -> &(Coords, Coords) {
        self.book.bounding(tile_id)
    }

    /// Sparse tile selection: every tile whose MBR intersects the
    /// subarray, in tile order (the order they were written).
    pub fn sparse_tiles_over(&self, subarray: &[(i64, i64)]) -> Vec<u64> {
        (0..self.tile_num())
            .filter(|&tile_id| ArraySchema::ranges_intersect(self.book.mbr(tile_id), subarray))
            .collect()
    }

    /// Dense tile selection: every tile whose cell block intersects the
    /// subarray, walked in tile order. Returns `(tile id, cell ranges)`
    /// pairs.
    pub fn dense_tiles_over(&self, subarray: &[(i64, i64)]) -> Vec<(u64, Vec<(i64, i64)>)> {
        let schema = &self.schema;
        let extents = schema.tile_extents().expect("dense schemas always carry extents"); // INVARIANT: schema validation
        let tile_ranges: Vec<(i64, i64)> = subarray
            .iter()
            .zip(schema.domain().iter().zip(extents))
            .map(|(&(qlo, qhi), (&(lo, _), &e))| ((qlo - lo) / e, (qhi - lo) / e))
            .collect();
        let counts = schema.tile_counts().expect("extents imply counts"); // INVARIANT: same
        let reversed = schema.tile_order() == Layout::ColMajor;

        crate::schema::order::RangeWalker::new(&tile_ranges, reversed)
            .map(|tile| {
                let id = crate::schema::order::linear_position(&tile, &counts, reversed);
                (id, schema.tile_cell_ranges(&tile))
            })
            .collect()
    }

    /// Fetches one decompressed tile through the cache; concurrent misses
    /// on the same tile decompress once.
    pub fn tile(&self, cache: &TileCache, slot: usize, tile_id: u64) -> Result<Arc<DecodedTile>> {
        cache.get_or_load((self.uid, slot, tile_id), || self.load_tile(slot, tile_id))
    }

    fn read_frame(&self, file: &FileReader, offset: u64, size: u64) -> Result<Vec<u8>> {
        let mut frame = vec![0u8; size as usize];
        file.read_at(offset, &mut frame)?;
        Ok(frame)
    }

    fn load_tile(&self, slot: usize, tile_id: u64) -> Result<DecodedTile> {
        let compressor = if slot == self.schema.attribute_num() {
            crate::codec::Compressor::None
        } else {
            self.schema.attribute(slot).compressor
        };
        let frame = self.read_frame(
            &self.files[slot],
            self.book.tile_offset(slot, tile_id),
            self.book.tile_size(slot, tile_id),
        )?;
        let payload = compressor.decompress(&frame)?;

        match &self.var_files[slot] {
            Some(var_file) => {
                let offsets_frame = self.read_frame(
                    var_file,
                    self.book.tile_var_offset(slot, tile_id),
                    self.book.tile_var_size(slot, tile_id),
                )?;
                let offsets_tile = compressor.decompress(&offsets_frame)?;
                DecodedTile::var(payload, &offsets_tile)
            }
            None => {
                let cell_size = if slot == self.schema.attribute_num() {
                    self.schema.coords_size()
                } else {
                    self.schema
                        .attribute(slot)
                        .cell_size()
                        .expect("slot without offsets file is fixed-size") // INVARIANT: var_files[slot] is Some for var attributes
                };
                DecodedTile::fixed(payload, cell_size)
            }
        }
    }
}
