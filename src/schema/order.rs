//! # Cell and Tile Ordering
//!
//! Total orders over coordinate tuples. A schema freezes two layouts: the
//! cell order (within a tile) and the tile order (between tiles). The read
//! path merges fragments by comparing [`GlobalKey`]s, which compose an
//! optional space-tile component (ordered by tile order) with the cell
//! component (ordered by cell order).
//!
//! HILBERT keys carry the curve index plus the raw coordinates; equal
//! indexes are ordered by row-major coordinate comparison, which makes the
//! order total even when the curve's bit budget aliases coordinates.

use std::cmp::Ordering;

use smallvec::SmallVec;

/// Decoded coordinate tuple. Four inline dimensions cover the common case.
pub type Coords = SmallVec<[i64; 4]>;

/// Comparison key of one cell (or one space tile) under a frozen layout.
///
/// `Linear` stores the tuple already permuted into comparison order
/// (reversed for column-major), so comparison is plain lexicographic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellKey {
    Linear(Coords),
    Hilbert { index: u64, coords: Coords },
}

impl Ord for CellKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (CellKey::Linear(a), CellKey::Linear(b)) => a.cmp(b),
            (
                CellKey::Hilbert { index: ia, coords: ca },
                CellKey::Hilbert { index: ib, coords: cb },
            ) => ia.cmp(ib).then_with(|| ca.cmp(cb)),
            // INVARIANT: keys being compared always come from one schema,
            // which freezes a single layout per key kind.
            _ => unreachable!("mixed cell key variants from one schema"),
        }
    }
}

impl PartialOrd for CellKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Position of a cell in the array's global order: space tile first (when
/// the schema defines tile extents), then cell order within the tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalKey {
    pub tile: Option<CellKey>,
    pub cell: CellKey,
}

impl Ord for GlobalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.tile, &other.tile) {
            (Some(a), Some(b)) => a.cmp(b).then_with(|| self.cell.cmp(&other.cell)),
            (None, None) => self.cell.cmp(&other.cell),
            // INVARIANT: both keys come from one schema, so tile presence
            // agrees.
            _ => unreachable!("mixed global key shapes from one schema"),
        }
    }
}

impl PartialOrd for GlobalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Linear position of `tuple` within a grid of `counts` per dimension,
/// row-major (`reversed = false`) or column-major (`reversed = true`).
pub fn linear_position(tuple: &[i64], counts: &[i64], reversed: bool) -> u64 {
    let mut position = 0u64;
    if reversed {
        for i in (0..tuple.len()).rev() {
            position = position * counts[i] as u64 + tuple[i] as u64;
        }
    } else {
        for i in 0..tuple.len() {
            position = position * counts[i] as u64 + tuple[i] as u64;
        }
    }
    position
}

/// Odometer over an inclusive hyper-rectangle, yielding tuples in
/// row-major or column-major order.
#[derive(Debug, Clone)]
pub struct RangeWalker {
    ranges: Vec<(i64, i64)>,
    current: Coords,
    reversed: bool,
    done: bool,
}

impl RangeWalker {
    /// `reversed = false` walks row-major (last dimension fastest),
    /// `reversed = true` column-major (first dimension fastest).
    pub fn new(ranges: &[(i64, i64)], reversed: bool) -> Self {
        let done = ranges.is_empty() || ranges.iter().any(|&(lo, hi)| lo > hi);
        let current = ranges.iter().map(|&(lo, _)| lo).collect();
        Self {
            ranges: ranges.to_vec(),
            current,
            reversed,
            done,
        }
    }

    fn advance(&mut self) {
        let dims = self.ranges.len();
        let order: Box<dyn Iterator<Item = usize>> = if self.reversed {
            Box::new(0..dims)
        } else {
            Box::new((0..dims).rev())
        };
        for d in order {
            if self.current[d] < self.ranges[d].1 {
                self.current[d] += 1;
                return;
            }
            self.current[d] = self.ranges[d].0;
        }
        self.done = true;
    }
}

impl Iterator for RangeWalker {
    type Item = Coords;

    fn next(&mut self) -> Option<Coords> {
        if self.done {
            return None;
        }
        let tuple = self.current.clone();
        self.advance();
        Some(tuple)
    }
}
