//! Observations: a dense grid of typed cells plus a vector of auxiliary scalars.
//!
//! The [`Grid`] is the spatial half of an observation, the auxiliary vector the
//! non-spatial half (battery level, score, velocity). A [`ValueIndex`] maps
//! every distinct cell value to the set of positions holding it, so the
//! Predictor and Comparator never scan the full grid to find a value.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// A grid cell code.
pub type Symbol = i64;

/// An auxiliary (non-spatial) value.
pub type Scalar = i64;

// ---------------------------------------------------------------------------
// Positions and offsets
// ---------------------------------------------------------------------------

/// A grid coordinate.
///
/// Ordered by `(x, y)`; this is the processing order of the Predictor's work
/// queue, which keeps predictions reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pos {
    pub x: usize,
    pub y: usize,
}

impl Pos {
    pub const fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }

    /// The offset that leads from `self` to `other`.
    pub fn offset_to(self, other: Pos) -> Offset {
        Offset::new(
            other.x as i64 - self.x as i64,
            other.y as i64 - self.y as i64,
        )
    }

    /// Apply an offset. Returns `None` if either coordinate would go negative.
    ///
    /// This does not check against any grid; use [`Grid::resolve`] for that.
    pub fn shifted(self, offset: Offset) -> Option<Pos> {
        let x = i64::try_from(self.x).ok()?.checked_add(offset.dx)?;
        let y = i64::try_from(self.y).ok()?.checked_add(offset.dy)?;
        Some(Pos::new(usize::try_from(x).ok()?, usize::try_from(y).ok()?))
    }

    pub fn manhattan(self, other: Pos) -> u32 {
        (self.x.abs_diff(other.x) + self.y.abs_diff(other.y)) as u32
    }
}

impl std::fmt::Display for Pos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

/// A signed offset relative to a triggering cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Offset {
    pub dx: i64,
    pub dy: i64,
}

impl Offset {
    pub const fn new(dx: i64, dy: i64) -> Self {
        Self { dx, dy }
    }

    pub const fn zero() -> Self {
        Self::new(0, 0)
    }

    pub fn is_zero(self) -> bool {
        self.dx == 0 && self.dy == 0
    }
}

impl std::fmt::Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:+},{:+}", self.dx, self.dy)
    }
}

// ---------------------------------------------------------------------------
// Grid
// ---------------------------------------------------------------------------

/// Dense row-major grid of cell values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Grid {
    width: usize,
    height: usize,
    cells: Vec<Symbol>,
}

impl Grid {
    /// Create a grid with every cell set to `value`.
    pub fn filled(width: usize, height: usize, value: Symbol) -> Self {
        Self {
            width,
            height,
            cells: vec![value; width * height],
        }
    }

    /// Build a grid from rows, where `rows[y][x]` is the cell at `(x, y)`.
    pub fn from_rows(rows: Vec<Vec<Symbol>>) -> Result<Self, AgentError> {
        let height = rows.len();
        let width = rows.first().map_or(0, Vec::len);
        let mut cells = Vec::with_capacity(width * height);
        for (row, values) in rows.into_iter().enumerate() {
            if values.len() != width {
                return Err(AgentError::RaggedGrid {
                    row,
                    expected: width,
                    actual: values.len(),
                });
            }
            cells.extend(values);
        }
        Ok(Self {
            width,
            height,
            cells,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn contains(&self, pos: Pos) -> bool {
        pos.x < self.width && pos.y < self.height
    }

    pub fn get(&self, pos: Pos) -> Option<Symbol> {
        self.contains(pos)
            .then(|| self.cells[pos.y * self.width + pos.x])
    }

    /// Overwrite a cell, returning the previous value. Out-of-grid writes are ignored.
    pub fn set(&mut self, pos: Pos, value: Symbol) -> Option<Symbol> {
        if !self.contains(pos) {
            return None;
        }
        let idx = pos.y * self.width + pos.x;
        Some(std::mem::replace(&mut self.cells[idx], value))
    }

    /// Resolve `pos + offset`, or `None` if it falls outside the grid.
    pub fn resolve(&self, pos: Pos, offset: Offset) -> Option<Pos> {
        pos.shifted(offset).filter(|p| self.contains(*p))
    }

    /// Value at `pos + offset`, or `None` outside the grid.
    pub fn value_at(&self, pos: Pos, offset: Offset) -> Option<Symbol> {
        self.resolve(pos, offset).and_then(|p| self.get(p))
    }

    /// All positions in processing order.
    pub fn positions(&self) -> impl Iterator<Item = Pos> + '_ {
        (0..self.width).flat_map(move |x| (0..self.height).map(move |y| Pos::new(x, y)))
    }

    /// All `(position, value)` pairs in processing order.
    pub fn cells(&self) -> impl Iterator<Item = (Pos, Symbol)> + '_ {
        self.positions()
            .map(move |p| (p, self.cells[p.y * self.width + p.x]))
    }

    /// Positions whose value differs from `other`, in processing order.
    ///
    /// Grids of different shape are compared over their common area.
    pub fn diff(&self, other: &Grid) -> Vec<Pos> {
        self.positions()
            .filter(|p| other.contains(*p) && self.get(*p) != other.get(*p))
            .collect()
    }

    pub fn same_shape(&self, other: &Grid) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// Rows of the grid, `rows[y][x]`.
    pub fn rows(&self) -> Vec<Vec<Symbol>> {
        if self.width == 0 {
            return Vec::new();
        }
        self.cells.chunks(self.width).map(<[Symbol]>::to_vec).collect()
    }
}

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// Immutable snapshot of the environment handed to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Observation {
    pub grid: Grid,
    pub aux: Vec<Scalar>,
}

impl Observation {
    pub fn new(grid: Grid, aux: Vec<Scalar>) -> Self {
        Self { grid, aux }
    }

    /// Convenience constructor from `rows[y][x]`.
    pub fn from_rows(rows: Vec<Vec<Symbol>>, aux: Vec<Scalar>) -> Result<Self, AgentError> {
        Ok(Self::new(Grid::from_rows(rows)?, aux))
    }
}

// ---------------------------------------------------------------------------
// Value index
// ---------------------------------------------------------------------------

/// Value → positions index over one grid.
///
/// Built once per observation and updated incrementally as the Predictor
/// applies deltas, so lookups stay O(log n).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueIndex {
    positions: BTreeMap<Symbol, BTreeSet<Pos>>,
}

impl ValueIndex {
    pub fn from_grid(grid: &Grid) -> Self {
        let mut positions: BTreeMap<Symbol, BTreeSet<Pos>> = BTreeMap::new();
        for (pos, value) in grid.cells() {
            positions.entry(value).or_default().insert(pos);
        }
        Self { positions }
    }

    /// Move `pos` from `old` to `new`.
    pub fn update_cell(&mut self, pos: Pos, old: Symbol, new: Symbol) {
        if old == new {
            return;
        }
        if let Some(set) = self.positions.get_mut(&old) {
            set.remove(&pos);
            if set.is_empty() {
                self.positions.remove(&old);
            }
        }
        self.positions.entry(new).or_default().insert(pos);
    }

    pub fn positions(&self, value: Symbol) -> Option<&BTreeSet<Pos>> {
        self.positions.get(&value)
    }

    pub fn count(&self, value: Symbol) -> usize {
        self.positions.get(&value).map_or(0, BTreeSet::len)
    }

    pub fn contains(&self, value: Symbol) -> bool {
        self.positions.contains_key(&value)
    }

    pub fn values(&self) -> impl Iterator<Item = Symbol> + '_ {
        self.positions.keys().copied()
    }

    /// Manhattan distance from `from` to the nearest cell holding `value`.
    pub fn nearest(&self, from: Pos, value: Symbol) -> Option<u32> {
        self.positions
            .get(&value)?
            .iter()
            .map(|p| from.manhattan(*p))
            .min()
    }

    /// Least frequent value that is focus-eligible.
    ///
    /// Falls back to the globally least frequent value and marks it eligible
    /// when none of the present values is. Ties prefer the smaller symbol.
    pub fn focus_value(&self, focus: &mut FocusSet) -> Option<Symbol> {
        let mut heap: BinaryHeap<Reverse<(usize, Symbol)>> = self
            .positions
            .iter()
            .map(|(value, set)| Reverse((set.len(), *value)))
            .collect();
        let Reverse((_, least)) = *heap.peek()?;
        while let Some(Reverse((_, value))) = heap.pop() {
            if focus.contains(value) {
                return Some(value);
            }
        }
        focus.insert(least);
        Some(least)
    }
}

/// Values the agent has seen change and therefore considers salient.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FocusSet(BTreeSet<Symbol>);

impl FocusSet {
    pub fn insert(&mut self, value: Symbol) -> bool {
        self.0.insert(value)
    }

    pub fn contains(&self, value: Symbol) -> bool {
        self.0.contains(&value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Symbol> + '_ {
        self.0.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Grid {
        Grid::from_rows(vec![vec![0, 0, 2], vec![1, 0, 3], vec![0, 2, 0]]).unwrap()
    }

    #[test]
    fn ragged_rows_rejected() {
        let err = Grid::from_rows(vec![vec![0, 0], vec![0]]).unwrap_err();
        assert!(matches!(
            err,
            AgentError::RaggedGrid {
                row: 1,
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn rows_address_x_then_y() {
        let grid = sample();
        assert_eq!(grid.get(Pos::new(0, 1)), Some(1));
        assert_eq!(grid.get(Pos::new(2, 1)), Some(3));
        assert_eq!(grid.get(Pos::new(3, 0)), None);
        assert_eq!(grid.rows(), vec![vec![0, 0, 2], vec![1, 0, 3], vec![0, 2, 0]]);
    }

    #[test]
    fn resolve_respects_bounds() {
        let grid = sample();
        let origin = Pos::new(0, 0);
        assert_eq!(grid.resolve(origin, Offset::new(-1, 0)), None);
        assert_eq!(grid.resolve(origin, Offset::new(2, 2)), Some(Pos::new(2, 2)));
        assert_eq!(grid.resolve(origin, Offset::new(3, 0)), None);
        assert_eq!(grid.value_at(Pos::new(1, 1), Offset::new(1, 0)), Some(3));
    }

    #[test]
    fn positions_are_ordered() {
        let grid = sample();
        let positions: Vec<Pos> = grid.positions().collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);
        assert_eq!(positions.len(), 9);
    }

    #[test]
    fn diff_lists_changed_cells() {
        let a = sample();
        let mut b = a.clone();
        b.set(Pos::new(0, 1), 0);
        b.set(Pos::new(1, 1), 1);
        assert_eq!(a.diff(&b), vec![Pos::new(0, 1), Pos::new(1, 1)]);
        assert!(a.diff(&a).is_empty());
    }

    #[test]
    fn index_tracks_incremental_updates() {
        let mut grid = sample();
        let mut index = ValueIndex::from_grid(&grid);
        assert_eq!(index.count(0), 5);
        assert_eq!(index.count(1), 1);

        let old = grid.set(Pos::new(1, 1), 1).unwrap();
        index.update_cell(Pos::new(1, 1), old, 1);
        assert_eq!(index.count(0), 4);
        assert_eq!(index.count(1), 2);
        assert_eq!(index, ValueIndex::from_grid(&grid));

        let old = grid.set(Pos::new(2, 1), 0).unwrap();
        index.update_cell(Pos::new(2, 1), old, 0);
        assert!(!index.contains(3));
    }

    #[test]
    fn nearest_uses_manhattan_distance() {
        let index = ValueIndex::from_grid(&sample());
        assert_eq!(index.nearest(Pos::new(0, 0), 3), Some(3));
        assert_eq!(index.nearest(Pos::new(2, 1), 3), Some(0));
        assert_eq!(index.nearest(Pos::new(0, 0), 9), None);
    }

    #[test]
    fn focus_bootstraps_then_prefers_salient_values() {
        let index = ValueIndex::from_grid(&sample());
        let mut focus = FocusSet::default();

        // Nothing salient yet: least frequent value, smaller symbol on ties.
        assert_eq!(index.focus_value(&mut focus), Some(1));
        assert!(focus.contains(1));

        // A salient value wins even when it is more frequent.
        let mut focus = FocusSet::default();
        focus.insert(2);
        assert_eq!(index.focus_value(&mut focus), Some(2));
        assert_eq!(focus.len(), 1);
    }
}
