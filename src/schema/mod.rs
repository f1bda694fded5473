//! # Array Schema
//!
//! The immutable description of an array: dimension names and typed domain,
//! optional tile extents, attributes (type, values per cell, compressor),
//! cell and tile orderings, and the sparse tile capacity. A schema is
//! written once at array creation and never mutated; every open of the
//! array reloads it from `__array_schema.tdb`.
//!
//! ## On-Disk Format
//!
//! Little-endian, tightly packed:
//!
//! ```text
//! u32 name_len, name bytes
//! u32 dim_num, then per dimension: u32 name_len, name bytes
//! u8 coords_type, u8 cell_order, u8 tile_order, u8 dense
//! per dimension: lo, hi as coords_type
//! u8 1 + per-dimension extents as coords_type, or u8 0 when absent
//! i64 capacity
//! u32 attribute_num, then per attribute:
//!     u32 name_len, name bytes, u8 type, u32 values_per_cell, u8 compressor
//! ```
//!
//! `values_per_cell == 0xFFFF_FFFF` ([`VAR_NUM`]) marks a variable-length
//! attribute.
//!
//! ## Orders
//!
//! The cell order arranges cells within a tile, the tile order arranges
//! tiles within a fragment. Either may be row-major, column-major, or (for
//! sparse arrays) Hilbert. Hilbert ties are broken by row-major comparison
//! of the raw coordinates, so all orders are total.
//!
//! ## Reserved Values
//!
//! Each datatype reserves one deletion sentinel (`i32::MIN`, `i64::MIN`,
//! negative infinity, `0xFF`). A deletion write fills every attribute value
//! of the cell with its sentinel; the reader drops such cells. Live data
//! must not use these values.

pub mod hilbert;
pub mod order;
pub(crate) mod wire;

use std::cmp::Ordering;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::codec::Compressor;
use crate::config::FRAGMENT_PREFIX;
use hilbert::{bits_for_extent, hilbert_index};
pub use order::{CellKey, Coords, GlobalKey};
use wire::{write_string, ByteReader};

/// `values_per_cell` marker for variable-length attributes.
pub const VAR_NUM: u32 = u32::MAX;

/// Reserved buffer name addressing the coordinates of a sparse array.
pub const COORDS_NAME: &str = "__coords";

/// Element types of attributes and coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    Int32,
    Int64,
    Float32,
    Float64,
    UInt8,
    Char,
}

impl Datatype {
    pub fn size(self) -> usize {
        match self {
            Datatype::Int32 | Datatype::Float32 => 4,
            Datatype::Int64 | Datatype::Float64 => 8,
            Datatype::UInt8 | Datatype::Char => 1,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Datatype::Int32 => 0,
            Datatype::Int64 => 1,
            Datatype::Float32 => 2,
            Datatype::Float64 => 3,
            Datatype::UInt8 => 4,
            Datatype::Char => 5,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Datatype::Int32,
            1 => Datatype::Int64,
            2 => Datatype::Float32,
            3 => Datatype::Float64,
            4 => Datatype::UInt8,
            5 => Datatype::Char,
            other => bail!("unknown datatype code {}", other),
        })
    }

    /// Only integer coordinates are supported; Hilbert bit budgets and MBR
    /// arithmetic are ill-defined over floating-point domains.
    pub fn valid_for_coords(self) -> bool {
        matches!(self, Datatype::Int32 | Datatype::Int64)
    }

    /// The reserved deletion sentinel, one element.
    pub fn del_element(self) -> SmallVec<[u8; 8]> {
        let mut bytes = SmallVec::new();
        match self {
            Datatype::Int32 => bytes.extend_from_slice(&i32::MIN.to_le_bytes()),
            Datatype::Int64 => bytes.extend_from_slice(&i64::MIN.to_le_bytes()),
            Datatype::Float32 => bytes.extend_from_slice(&f32::NEG_INFINITY.to_le_bytes()),
            Datatype::Float64 => bytes.extend_from_slice(&f64::NEG_INFINITY.to_le_bytes()),
            Datatype::UInt8 | Datatype::Char => bytes.push(0xFF),
        }
        bytes
    }
}

/// Cell or tile ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    RowMajor,
    ColMajor,
    Hilbert,
}

impl Layout {
    pub fn code(self) -> u8 {
        match self {
            Layout::RowMajor => 0,
            Layout::ColMajor => 1,
            Layout::Hilbert => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Layout::RowMajor,
            1 => Layout::ColMajor,
            2 => Layout::Hilbert,
            other => bail!("unknown layout code {}", other),
        })
    }
}

/// One attribute of an array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub datatype: Datatype,
    pub cell_val_num: u32,
    pub compressor: Compressor,
}

impl Attribute {
    pub fn is_var(&self) -> bool {
        self.cell_val_num == VAR_NUM
    }

    /// Fixed byte size of one cell value, `None` for variable length.
    pub fn cell_size(&self) -> Option<usize> {
        if self.is_var() {
            None
        } else {
            Some(self.datatype.size() * self.cell_val_num as usize)
        }
    }

    /// The full deletion payload for one cell of this attribute. Variable
    /// attributes use a single sentinel element.
    pub fn deletion_cell(&self) -> Vec<u8> {
        let element = self.datatype.del_element();
        let repeat = if self.is_var() { 1 } else { self.cell_val_num as usize };
        let mut cell = Vec::with_capacity(element.len() * repeat);
        for _ in 0..repeat {
            cell.extend_from_slice(&element);
        }
        cell
    }
}

/// Immutable array schema. Construct through [`ArraySchema::dense`] or
/// [`ArraySchema::sparse`].
#[derive(Debug, Clone, PartialEq)]
pub struct ArraySchema {
    array_name: String,
    dimensions: Vec<String>,
    domain: Vec<(i64, i64)>,
    tile_extents: Option<Vec<i64>>,
    coords_type: Datatype,
    cell_order: Layout,
    tile_order: Layout,
    dense: bool,
    capacity: u64,
    attributes: Vec<Attribute>,
    // Derived, not serialized.
    cell_bits: u32,
    tile_bits: u32,
}

/// Default sparse tile capacity when the builder does not set one.
pub const DEFAULT_CAPACITY: u64 = 10_000;

pub struct SchemaBuilder {
    array_name: String,
    dense: bool,
    dimensions: Vec<String>,
    domain: Vec<(i64, i64)>,
    tile_extents: Option<Vec<i64>>,
    coords_type: Datatype,
    cell_order: Layout,
    tile_order: Layout,
    capacity: u64,
    attributes: Vec<Attribute>,
}

impl SchemaBuilder {
    fn new(name: &str, dense: bool) -> Self {
        Self {
            array_name: name.to_string(),
            dense,
            dimensions: Vec::new(),
            domain: Vec::new(),
            tile_extents: None,
            coords_type: Datatype::Int64,
            cell_order: Layout::RowMajor,
            tile_order: Layout::RowMajor,
            capacity: DEFAULT_CAPACITY,
            attributes: Vec::new(),
        }
    }

    pub fn coords_type(mut self, datatype: Datatype) -> Self {
        self.coords_type = datatype;
        self
    }

    pub fn dimension(mut self, name: &str, lo: i64, hi: i64) -> Self {
        self.dimensions.push(name.to_string());
        self.domain.push((lo, hi));
        self
    }

    pub fn tile_extents(mut self, extents: &[i64]) -> Self {
        self.tile_extents = Some(extents.to_vec());
        self
    }

    pub fn cell_order(mut self, order: Layout) -> Self {
        self.cell_order = order;
        self
    }

    pub fn tile_order(mut self, order: Layout) -> Self {
        self.tile_order = order;
        self
    }

    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Fixed single-value uncompressed attribute.
    pub fn attribute(self, name: &str, datatype: Datatype) -> Self {
        self.attribute_with(name, datatype, 1, Compressor::None)
    }

    pub fn attribute_with(
        mut self,
        name: &str,
        datatype: Datatype,
        cell_val_num: u32,
        compressor: Compressor,
    ) -> Self {
        self.attributes.push(Attribute {
            name: name.to_string(),
            datatype,
            cell_val_num,
            compressor,
        });
        self
    }

    pub fn build(self) -> Result<ArraySchema> {
        let schema = ArraySchema {
            array_name: self.array_name,
            dimensions: self.dimensions,
            domain: self.domain,
            tile_extents: self.tile_extents,
            coords_type: self.coords_type,
            cell_order: self.cell_order,
            tile_order: self.tile_order,
            dense: self.dense,
            capacity: self.capacity,
            attributes: self.attributes,
            cell_bits: 0,
            tile_bits: 0,
        };
        schema.validated()
    }
}

impl ArraySchema {
    pub fn dense(name: &str) -> SchemaBuilder {
        SchemaBuilder::new(name, true)
    }

    pub fn sparse(name: &str) -> SchemaBuilder {
        SchemaBuilder::new(name, false)
    }

    fn validated(mut self) -> Result<Self> {
        // The array name doubles as its workspace-relative path, so group
        // nesting like "climate/weather" is legal but escapes are not.
        ensure!(!self.array_name.is_empty(), "array name is empty");
        ensure!(
            !self.array_name.starts_with('/'),
            "array name '{}' must be workspace-relative",
            self.array_name
        );
        ensure!(
            self.array_name.split('/').all(|seg| !seg.is_empty() && seg != ".." && seg != "."),
            "array name '{}' contains an invalid path segment",
            self.array_name
        );
        ensure!(!self.dimensions.is_empty(), "array needs at least one dimension");
        ensure!(
            self.coords_type.valid_for_coords(),
            "{:?} coordinates are not supported",
            self.coords_type
        );

        for (i, name) in self.dimensions.iter().enumerate() {
            ensure!(!name.is_empty(), "dimension {} has an empty name", i);
            ensure!(
                self.dimensions[..i].iter().all(|other| other != name),
                "duplicate dimension name '{}'",
                name
            );
        }
        for &(lo, hi) in &self.domain {
            ensure!(lo <= hi, "empty domain range [{}, {}]", lo, hi);
            if self.coords_type == Datatype::Int32 {
                ensure!(
                    i32::try_from(lo).is_ok() && i32::try_from(hi).is_ok(),
                    "domain [{}, {}] does not fit int32 coordinates",
                    lo,
                    hi
                );
            }
        }

        if let Some(extents) = &self.tile_extents {
            ensure!(
                extents.len() == self.dimensions.len(),
                "{} tile extents for {} dimensions",
                extents.len(),
                self.dimensions.len()
            );
            for (d, &extent) in extents.iter().enumerate() {
                let span = self.domain[d].1 - self.domain[d].0 + 1;
                ensure!(extent > 0, "tile extent of dimension {} must be positive", d);
                ensure!(
                    span % extent == 0,
                    "domain of dimension {} ({} cells) is not aligned to tile extent {}",
                    d,
                    span,
                    extent
                );
            }
        } else {
            ensure!(self.dense, "dense arrays require tile extents");
        }
        if self.dense {
            ensure!(
                self.tile_extents.is_some(),
                "dense arrays require tile extents"
            );
            ensure!(
                self.cell_order != Layout::Hilbert && self.tile_order != Layout::Hilbert,
                "hilbert order is supported for sparse arrays only"
            );
        } else {
            ensure!(self.capacity > 0, "sparse tile capacity must be positive");
        }

        ensure!(!self.attributes.is_empty(), "array needs at least one attribute");
        for (i, attr) in self.attributes.iter().enumerate() {
            ensure!(!attr.name.is_empty(), "attribute {} has an empty name", i);
            ensure!(
                !attr.name.starts_with(FRAGMENT_PREFIX),
                "attribute name '{}' collides with engine files",
                attr.name
            );
            ensure!(
                self.attributes[..i].iter().all(|other| other.name != attr.name),
                "duplicate attribute name '{}'",
                attr.name
            );
            ensure!(
                !self.dimensions.contains(&attr.name),
                "attribute '{}' shares a name with a dimension",
                attr.name
            );
            ensure!(
                attr.cell_val_num >= 1,
                "attribute '{}' has zero values per cell",
                attr.name
            );
        }

        // Hilbert bit budgets, frozen here so comparators never recompute.
        if self.cell_order == Layout::Hilbert {
            let bits = self
                .domain
                .iter()
                .map(|&(lo, hi)| bits_for_extent((hi - lo + 1) as u64))
                .max()
                .unwrap_or(1);
            ensure!(
                self.dimensions.len() as u32 * bits <= 64,
                "hilbert index over {} dimensions x {} bits exceeds 64 bits",
                self.dimensions.len(),
                bits
            );
            self.cell_bits = bits;
        }
        // Without tile extents there are no space tiles, so a Hilbert tile
        // order degenerates and needs no bit budget.
        if self.tile_order == Layout::Hilbert {
            if let Some(extents) = &self.tile_extents {
                let bits = self
                    .domain
                    .iter()
                    .zip(extents)
                    .map(|(&(lo, hi), &e)| bits_for_extent(((hi - lo + 1) / e) as u64))
                    .max()
                    .unwrap_or(1);
                ensure!(
                    self.dimensions.len() as u32 * bits <= 64,
                    "hilbert tile order over {} dimensions x {} bits exceeds 64 bits",
                    self.dimensions.len(),
                    bits
                );
                self.tile_bits = bits;
            }
        }

        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.array_name
    }

    pub fn dim_num(&self) -> usize {
        self.dimensions.len()
    }

    pub fn dimensions(&self) -> &[String] {
        &self.dimensions
    }

    pub fn domain(&self) -> &[(i64, i64)] {
        &self.domain
    }

    pub fn tile_extents(&self) -> Option<&[i64]> {
        self.tile_extents.as_deref()
    }

    pub fn coords_type(&self) -> Datatype {
        self.coords_type
    }

    pub fn cell_order(&self) -> Layout {
        self.cell_order
    }

    pub fn tile_order(&self) -> Layout {
        self.tile_order
    }

    pub fn is_dense(&self) -> bool {
        self.dense
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute_num(&self) -> usize {
        self.attributes.len()
    }

    pub fn attribute(&self, idx: usize) -> &Attribute {
        &self.attributes[idx]
    }

    pub fn attribute_index(&self, name: &str) -> Result<usize> {
        self.attributes
            .iter()
            .position(|a| a.name == name)
            .ok_or_else(|| eyre::eyre!("array '{}' has no attribute '{}'", self.array_name, name))
    }

    /// Byte size of one coordinate tuple.
    pub fn coords_size(&self) -> usize {
        self.coords_type.size() * self.dim_num()
    }

    /// Cells per dense tile: the product of the tile extents.
    pub fn tile_cell_num(&self) -> Option<u64> {
        self.tile_extents
            .as_ref()
            .map(|extents| extents.iter().map(|&e| e as u64).product())
    }

    /// Tile grid size per dimension (requires tile extents).
    pub fn tile_counts(&self) -> Option<Vec<i64>> {
        self.tile_extents.as_ref().map(|extents| {
            self.domain
                .iter()
                .zip(extents)
                .map(|(&(lo, hi), &e)| (hi - lo + 1) / e)
                .collect()
        })
    }

    /// Same dimensions, domain, tile extents, and cell order.
    pub fn join_compatible(&self, other: &ArraySchema) -> bool {
        self.dimensions == other.dimensions
            && self.domain == other.domain
            && self.tile_extents == other.tile_extents
            && self.cell_order == other.cell_order
    }

    // ------------------------------------------------------------------
    // Coordinates
    // ------------------------------------------------------------------

    /// Decodes one raw coordinate tuple.
    pub fn decode_coords(&self, bytes: &[u8]) -> Coords {
        debug_assert_eq!(bytes.len(), self.coords_size());
        let mut coords = Coords::new();
        let elem = self.coords_type.size();
        for d in 0..self.dim_num() {
            let lane = &bytes[d * elem..(d + 1) * elem];
            let value = match self.coords_type {
                Datatype::Int32 => {
                    let mut buf = [0u8; 4];
                    buf.copy_from_slice(lane);
                    i32::from_le_bytes(buf) as i64
                }
                _ => {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(lane);
                    i64::from_le_bytes(buf)
                }
            };
            coords.push(value);
        }
        coords
    }

    /// Encodes a coordinate tuple into the schema's raw layout.
    pub fn encode_coords(&self, coords: &[i64], out: &mut Vec<u8>) {
        debug_assert_eq!(coords.len(), self.dim_num());
        for &c in coords {
            match self.coords_type {
                Datatype::Int32 => out.extend((c as i32).to_le_bytes()),
                _ => out.extend(c.to_le_bytes()),
            }
        }
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    fn layout_key(&self, layout: Layout, tuple: &[i64], offsets_base: &[i64], bits: u32) -> CellKey {
        match layout {
            Layout::RowMajor => CellKey::Linear(tuple.iter().copied().collect()),
            Layout::ColMajor => CellKey::Linear(tuple.iter().rev().copied().collect()),
            Layout::Hilbert => {
                let mut offsets: SmallVec<[u64; 4]> = SmallVec::new();
                for (d, &c) in tuple.iter().enumerate() {
                    offsets.push((c - offsets_base[d]) as u64);
                }
                CellKey::Hilbert {
                    index: hilbert_index(&offsets, bits),
                    coords: tuple.iter().copied().collect(),
                }
            }
        }
    }

    /// Cell-order key of one coordinate tuple.
    pub fn cell_key(&self, coords: &[i64]) -> CellKey {
        let base: SmallVec<[i64; 4]> = self.domain.iter().map(|&(lo, _)| lo).collect();
        self.layout_key(self.cell_order, coords, &base, self.cell_bits)
    }

    /// Tile-order key of the space tile containing `coords`, when the
    /// schema defines tile extents.
    pub fn space_tile_key(&self, coords: &[i64]) -> Option<CellKey> {
        let extents = self.tile_extents.as_ref()?;
        let tile: SmallVec<[i64; 4]> = coords
            .iter()
            .zip(self.domain.iter().zip(extents))
            .map(|(&c, (&(lo, _), &e))| (c - lo) / e)
            .collect();
        let zero: SmallVec<[i64; 4]> = smallvec::smallvec![0; tile.len()];
        Some(self.layout_key(self.tile_order, &tile, &zero, self.tile_bits))
    }

    /// Position of `coords` in the array's global order.
    pub fn global_key(&self, coords: &[i64]) -> GlobalKey {
        GlobalKey {
            tile: self.space_tile_key(coords),
            cell: self.cell_key(coords),
        }
    }

    /// Total order over coordinate tuples: `(tile order, cell order)`.
    pub fn global_cmp(&self, a: &[i64], b: &[i64]) -> Ordering {
        self.global_key(a).cmp(&self.global_key(b))
    }

    /// Dense tile id: integer division of coordinates by the tile extents,
    /// linearized by tile order.
    pub fn tile_id(&self, coords: &[i64]) -> u64 {
        let extents = self.tile_extents.as_ref().expect("dense schemas always carry extents"); // INVARIANT: validated at build
        let counts = self.tile_counts().expect("extents imply counts"); // INVARIANT: same
        let tile: SmallVec<[i64; 4]> = coords
            .iter()
            .zip(self.domain.iter().zip(extents))
            .map(|(&c, (&(lo, _), &e))| (c - lo) / e)
            .collect();
        order::linear_position(&tile, &counts, self.tile_order == Layout::ColMajor)
    }

    /// The per-dimension cell ranges covered by the dense tile at grid
    /// position `tile`.
    pub fn tile_cell_ranges(&self, tile: &[i64]) -> Vec<(i64, i64)> {
        let extents = self.tile_extents.as_ref().expect("dense schemas always carry extents"); // INVARIANT: validated at build
        tile.iter()
            .zip(self.domain.iter().zip(extents))
            .map(|(&t, (&(lo, _), &e))| (lo + t * e, lo + (t + 1) * e - 1))
            .collect()
    }

    // ------------------------------------------------------------------
    // Subarrays and MBRs
    // ------------------------------------------------------------------

    /// The whole domain as a flattened `[lo0, hi0, lo1, hi1, ...]` subarray.
    pub fn full_domain(&self) -> Vec<i64> {
        self.domain.iter().flat_map(|&(lo, hi)| [lo, hi]).collect()
    }

    /// Validates a flattened subarray against the domain.
    pub fn parse_subarray(&self, flat: &[i64]) -> Result<Vec<(i64, i64)>> {
        ensure!(
            flat.len() == 2 * self.dim_num(),
            "subarray has {} bounds, expected {}",
            flat.len(),
            2 * self.dim_num()
        );
        let mut ranges = Vec::with_capacity(self.dim_num());
        for d in 0..self.dim_num() {
            let (lo, hi) = (flat[2 * d], flat[2 * d + 1]);
            ensure!(lo <= hi, "subarray range [{}, {}] is empty on dimension {}", lo, hi, d);
            ensure!(
                lo >= self.domain[d].0 && hi <= self.domain[d].1,
                "subarray [{}, {}] is outside the domain [{}, {}] of dimension {}",
                lo,
                hi,
                self.domain[d].0,
                self.domain[d].1,
                d
            );
            ranges.push((lo, hi));
        }
        Ok(ranges)
    }

    pub fn cell_in(&self, coords: &[i64], subarray: &[(i64, i64)]) -> bool {
        coords
            .iter()
            .zip(subarray)
            .all(|(&c, &(lo, hi))| c >= lo && c <= hi)
    }

    pub fn ranges_intersect(a: &[(i64, i64)], b: &[(i64, i64)]) -> bool {
        a.iter().zip(b).all(|(&(alo, ahi), &(blo, bhi))| alo <= bhi && blo <= ahi)
    }

    /// Grows `mbr` to contain `coords`; seeds it on first use.
    pub fn expand_mbr(mbr: &mut Vec<(i64, i64)>, coords: &[i64]) {
        if mbr.is_empty() {
            mbr.extend(coords.iter().map(|&c| (c, c)));
            return;
        }
        for (range, &c) in mbr.iter_mut().zip(coords) {
            range.0 = range.0.min(c);
            range.1 = range.1.max(c);
        }
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    fn write_coord(&self, buf: &mut Vec<u8>, value: i64) {
        match self.coords_type {
            Datatype::Int32 => buf.extend((value as i32).to_le_bytes()),
            _ => buf.extend(value.to_le_bytes()),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_string(&mut buf, &self.array_name);

        buf.extend((self.dimensions.len() as u32).to_le_bytes());
        for dim in &self.dimensions {
            write_string(&mut buf, dim);
        }

        buf.push(self.coords_type.code());
        buf.push(self.cell_order.code());
        buf.push(self.tile_order.code());
        buf.push(self.dense as u8);

        for &(lo, hi) in &self.domain {
            self.write_coord(&mut buf, lo);
            self.write_coord(&mut buf, hi);
        }

        match &self.tile_extents {
            Some(extents) => {
                buf.push(1);
                for &e in extents {
                    self.write_coord(&mut buf, e);
                }
            }
            None => buf.push(0),
        }

        buf.extend((self.capacity as i64).to_le_bytes());

        buf.extend((self.attributes.len() as u32).to_le_bytes());
        for attr in &self.attributes {
            write_string(&mut buf, &attr.name);
            buf.push(attr.datatype.code());
            buf.extend(attr.cell_val_num.to_le_bytes());
            buf.push(attr.compressor.code());
        }
        buf
    }

    pub fn load(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        let array_name = r.read_string()?;

        let dim_num = r.read_u32()? as usize;
        let mut dimensions = Vec::with_capacity(dim_num);
        for _ in 0..dim_num {
            dimensions.push(r.read_string()?);
        }

        let coords_type = Datatype::from_code(r.read_u8()?)?;
        let cell_order = Layout::from_code(r.read_u8()?)?;
        let tile_order = Layout::from_code(r.read_u8()?)?;
        let dense = r.read_u8()? != 0;

        let read_coord = |r: &mut ByteReader| -> Result<i64> {
            Ok(match coords_type {
                Datatype::Int32 => {
                    let mut buf = [0u8; 4];
                    buf.copy_from_slice(r.take(4)?);
                    i32::from_le_bytes(buf) as i64
                }
                _ => r.read_i64()?,
            })
        };

        let mut domain = Vec::with_capacity(dim_num);
        for _ in 0..dim_num {
            let lo = read_coord(&mut r)?;
            let hi = read_coord(&mut r)?;
            domain.push((lo, hi));
        }

        let tile_extents = if r.read_u8()? != 0 {
            let mut extents = Vec::with_capacity(dim_num);
            for _ in 0..dim_num {
                extents.push(read_coord(&mut r)?);
            }
            Some(extents)
        } else {
            None
        };

        let capacity = r.read_i64()?;
        ensure!(capacity >= 0, "negative capacity {} in schema file", capacity);

        let attribute_num = r.read_u32()? as usize;
        let mut attributes = Vec::with_capacity(attribute_num);
        for _ in 0..attribute_num {
            let name = r.read_string()?;
            let datatype = Datatype::from_code(r.read_u8()?)?;
            let cell_val_num = r.read_u32()?;
            let compressor = Compressor::from_code(r.read_u8()?)?;
            attributes.push(Attribute {
                name,
                datatype,
                cell_val_num,
                compressor,
            });
        }
        ensure!(r.remaining() == 0, "{} trailing bytes in schema file", r.remaining());

        ArraySchema {
            array_name,
            dimensions,
            domain,
            tile_extents,
            coords_type,
            cell_order,
            tile_order,
            dense,
            capacity: capacity as u64,
            attributes,
            cell_bits: 0,
            tile_bits: 0,
        }
        .validated()
    }
}
