//! # Book-Keeping
//!
//! The per-fragment index over tiles: for each file slot the byte offset
//! and compressed size of every tile frame, for variable attributes the
//! paired arrays describing the offsets file, and for sparse fragments the
//! per-tile MBRs and bounding coordinates.
//!
//! The serialized file is the fragment's commit marker: the writer
//! publishes it atomically as the last step of sealing, and a reader
//! treats its absence as "this fragment never happened".
//!
//! ## Format
//!
//! ```text
//! [u8; 4] magic "TDBK", u32 version
//! per file slot (attributes in schema order, then coords if sparse):
//!     u64 tile_num
//!     tile_num x u64 offsets
//!     tile_num x u64 compressed sizes
//!     variable attributes only:
//!         tile_num x u64 offsets-file offsets
//!         tile_num x u64 offsets-file compressed sizes
//! sparse only:
//!     tile_num x (2 x coords_size) MBRs           (lo, hi per dimension)
//!     tile_num x (2 x coords_size) bounding coords (first cell, last cell)
//! ```

use eyre::{ensure, Result, WrapErr};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{BOOK_KEEPING_MAGIC, BOOK_KEEPING_VERSION};
use crate::schema::wire::ByteReader;
use crate::schema::{ArraySchema, Coords, Datatype};

use super::slot_count;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct Header {
    magic: [u8; 4],
    version: U32,
}

/// Index over one fragment's tiles. Read-only after fragment open; the
/// writer fills it record by record as tiles flush.
#[derive(Debug, Default)]
pub struct BookKeeping {
    /// Per slot, per tile: frame offset in the slot's main file.
    tile_offsets: Vec<Vec<u64>>,
    /// Per slot, per tile: frame size (compressed, prefix included).
    tile_sizes: Vec<Vec<u64>>,
    /// Var slots only, per tile: frame offset in the offsets file.
    tile_var_offsets: Vec<Vec<u64>>,
    /// Var slots only, per tile: frame size in the offsets file.
    tile_var_sizes: Vec<Vec<u64>>,
    /// Sparse only, per tile.
    mbrs: Vec<Vec<(i64, i64)>>,
    /// Sparse only, per tile: coordinates of the first and last cell.
    bounding_coords: Vec<(Coords, Coords)>,
}

impl BookKeeping {
    pub fn new(schema: &ArraySchema) -> Self {
        let slots = slot_count(schema);
        Self {
            tile_offsets: vec![Vec::new(); slots],
            tile_sizes: vec![Vec::new(); slots],
            tile_var_offsets: vec![Vec::new(); slots],
            tile_var_sizes: vec![Vec::new(); slots],
            mbrs: Vec::new(),
            bounding_coords: Vec::new(),
        }
    }

    pub fn tile_num(&self) -> u64 {
        self.tile_offsets.first().map_or(0, |v| v.len() as u64)
    }

    pub fn record_tile(&mut self, slot: usize, offset: u64, size: u64) {
        self.tile_offsets[slot].push(offset);
        self.tile_sizes[slot].push(size);
    }

    pub fn record_var_tile(&mut self, slot: usize, offset: u64, size: u64) {
        self.tile_var_offsets[slot].push(offset);
        self.tile_var_sizes[slot].push(size);
    }

    pub fn record_sparse_tile(&mut self, mbr: Vec<(i64, i64)>, first: Coords, last: Coords) {
        self.mbrs.push(mbr);
        self.bounding_coords.push((first, last));
    }

    pub fn tile_offset(&self, slot: usize, tile_id: u64) -> u64 {
        self.tile_offsets[slot][tile_id as usize]
    }

    pub fn tile_size(&self, slot: usize, tile_id: u64) -> u64 {
        self.tile_sizes[slot][tile_id as usize]
    }

    pub fn tile_var_offset(&self, slot: usize, tile_id: u64) -> u64 {
        self.tile_var_offsets[slot][tile_id as usize]
    }

    pub fn tile_var_size(&self, slot: usize, tile_id: u64) -> u64 {
        self.tile_var_sizes[slot][tile_id as usize]
    }

    pub fn mbr(&self, tile_id: u64) -> &[(i64, i64)] {
        &self.mbrs[tile_id as usize]
    }

    pub fn bounding(&self, tile_id: u64) -> &(Coords, Coords) {
        &self.bounding_coords[tile_id as usize]
    }

    fn write_coord(buf: &mut Vec<u8>, datatype: Datatype, value: i64) {
        match datatype {
            Datatype::Int32 => buf.extend((value as i32).to_le_bytes()),
            _ => buf.extend(value.to_le_bytes()),
        }
    }

    fn read_coord(r: &mut ByteReader, datatype: Datatype) -> Result<i64> {
        Ok(match datatype {
            Datatype::Int32 => {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(r.take(4)?);
                i32::from_le_bytes(bytes) as i64
            }
            _ => r.read_i64()?,
        })
    }

    pub fn serialize(&self, schema: &ArraySchema) -> Vec<u8> {
        let header = Header {
            magic: *BOOK_KEEPING_MAGIC,
            version: U32::new(BOOK_KEEPING_VERSION),
        };
        let mut buf = header.as_bytes().to_vec();
        let tile_num = self.tile_num();
        let coords_type = schema.coords_type();

        for slot in 0..self.tile_offsets.len() {
            buf.extend(tile_num.to_le_bytes());
            for &offset in &self.tile_offsets[slot] {
                buf.extend(offset.to_le_bytes());
            }
            for &size in &self.tile_sizes[slot] {
                buf.extend(size.to_le_bytes());
            }
            let is_var = slot < schema.attribute_num() && schema.attribute(slot).is_var();
            if is_var {
                for &offset in &self.tile_var_offsets[slot] {
                    buf.extend(offset.to_le_bytes());
                }
                for &size in &self.tile_var_sizes[slot] {
                    buf.extend(size.to_le_bytes());
                }
            }
        }

        if !schema.is_dense() {
            for mbr in &self.mbrs {
                for &(lo, hi) in mbr {
                    Self::write_coord(&mut buf, coords_type, lo);
                    Self::write_coord(&mut buf, coords_type, hi);
                }
            }
            for (first, last) in &self.bounding_coords {
                for &c in first.iter() {
                    Self::write_coord(&mut buf, coords_type, c);
                }
                for &c in last.iter() {
                    Self::write_coord(&mut buf, coords_type, c);
                }
            }
        }
        buf
    }

    pub fn load(schema: &ArraySchema, bytes: &[u8]) -> Result<Self> {
        let header = Header::ref_from_prefix(bytes)
            .map_err(|_| eyre::eyre!("book-keeping file is shorter than its header"))?
            .0;
        ensure!(
            header.magic == *BOOK_KEEPING_MAGIC,
            "bad book-keeping magic {:?}",
            header.magic
        );
        ensure!(
            header.version.get() == BOOK_KEEPING_VERSION,
            "unsupported book-keeping version {}",
            header.version.get()
        );

        let mut r = ByteReader::new(&bytes[std::mem::size_of::<Header>()..]);
        let slots = slot_count(schema);
        let coords_type = schema.coords_type();
        let mut book = BookKeeping::new(schema);
        let mut tile_num = None;

        let read_u64_array = |r: &mut ByteReader, n: u64| -> Result<Vec<u64>> {
            let mut values = Vec::with_capacity(n as usize);
            for _ in 0..n {
                values.push(r.read_u64()?);
            }
            Ok(values)
        };

        for slot in 0..slots {
            let n = r
                .read_u64()
                .wrap_err_with(|| format!("truncated tile count for slot {}", slot))?;
            match tile_num {
                None => tile_num = Some(n),
                Some(expected) => ensure!(
                    n == expected,
                    "slot {} records {} tiles, slot 0 records {}",
                    slot,
                    n,
                    expected
                ),
            }
            book.tile_offsets[slot] = read_u64_array(&mut r, n)?;
            book.tile_sizes[slot] = read_u64_array(&mut r, n)?;
            ensure!(
                book.tile_offsets[slot].windows(2).all(|w| w[0] < w[1]),
                "tile offsets of slot {} are not strictly increasing",
                slot
            );
            let is_var = slot < schema.attribute_num() && schema.attribute(slot).is_var();
            if is_var {
                book.tile_var_offsets[slot] = read_u64_array(&mut r, n)?;
                book.tile_var_sizes[slot] = read_u64_array(&mut r, n)?;
                ensure!(
                    book.tile_var_offsets[slot].windows(2).all(|w| w[0] < w[1]),
                    "offsets-file tile offsets of slot {} are not strictly increasing",
                    slot
                );
            }
        }

        if !schema.is_dense() {
            let n = tile_num.unwrap_or(0);
            for _ in 0..n {
                let mut mbr = Vec::with_capacity(schema.dim_num());
                for _ in 0..schema.dim_num() {
                    let lo = Self::read_coord(&mut r, coords_type)?;
                    let hi = Self::read_coord(&mut r, coords_type)?;
                    ensure!(lo <= hi, "inverted MBR range [{}, {}]", lo, hi);
                    mbr.push((lo, hi));
                }
                book.mbrs.push(mbr);
            }
            for _ in 0..n {
                let mut first = Coords::new();
                let mut last = Coords::new();
                for _ in 0..schema.dim_num() {
                    first.push(Self::read_coord(&mut r, coords_type)?);
                }
                for _ in 0..schema.dim_num() {
                    last.push(Self::read_coord(&mut r, coords_type)?);
                }
                book.bounding_coords.push((first, last));
            }
        }

        ensure!(
            r.remaining() == 0,
            "{} trailing bytes in book-keeping file",
            r.remaining()
        );
        Ok(book)
    }
}
