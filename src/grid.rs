//! Lambda grid: the ordered index space of candidate thresholds
//!
//! A grid is one or two ascending axes of threshold values; the Cartesian
//! product is flattened row-major (last axis fastest) into a single cell
//! index space shared by the loss tables, the p-value vectors, and the
//! rejection-region strategies.
//!
//! Axis ordering convention: values ascend and the realized risk is
//! monotone non-increasing along each axis, so the most permissive cell is
//! index 0 and the most conservative cell is the last one. The
//! fixed-sequence strategies and the conservative empty-set fallback both
//! rely on this convention.

use serde::{Deserialize, Serialize};

/// Evenly spaced values over [lo, hi], inclusive of both endpoints. The
/// endpoints are exact, not reconstructed from the step.
pub fn linspace(lo: f64, hi: f64, n: usize) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![lo];
    }
    let step = (hi - lo) / (n - 1) as f64;
    let mut values: Vec<f64> = (0..n).map(|i| lo + step * i as f64).collect();
    values[n - 1] = hi;
    values
}

/// Ordered 1-D or 2-D grid of candidate lambdas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LambdaGrid {
    axes: Vec<Vec<f64>>,
}

impl LambdaGrid {
    /// Single-axis grid. Values must be ascending.
    pub fn one_dim(values: Vec<f64>) -> Self {
        debug_assert!(values.windows(2).all(|w| w[0] <= w[1]));
        Self { axes: vec![values] }
    }

    /// Two-axis grid, flattened with the second axis fastest.
    pub fn two_dim(lambda1s: Vec<f64>, lambda2s: Vec<f64>) -> Self {
        debug_assert!(lambda1s.windows(2).all(|w| w[0] <= w[1]));
        debug_assert!(lambda2s.windows(2).all(|w| w[0] <= w[1]));
        Self {
            axes: vec![lambda1s, lambda2s],
        }
    }

    /// Number of axes (1 or 2).
    pub fn dim(&self) -> usize {
        self.axes.len()
    }

    /// Values along axis `d`.
    pub fn axis(&self, d: usize) -> &[f64] {
        &self.axes[d]
    }

    /// Total number of flattened cells.
    pub fn num_cells(&self) -> usize {
        self.axes.iter().map(Vec::len).product()
    }

    /// Decompose a flat cell index into per-axis indices.
    pub fn multi_index(&self, cell: usize) -> Vec<usize> {
        debug_assert!(cell < self.num_cells());
        match self.axes.len() {
            1 => vec![cell],
            2 => {
                let w = self.axes[1].len();
                vec![cell / w, cell % w]
            }
            _ => unreachable!("grids are 1-D or 2-D"),
        }
    }

    /// Flatten per-axis indices into a cell index.
    pub fn flat_index(&self, idx: &[usize]) -> usize {
        match self.axes.len() {
            1 => idx[0],
            2 => idx[0] * self.axes[1].len() + idx[1],
            _ => unreachable!("grids are 1-D or 2-D"),
        }
    }

    /// Lambda values at a flat cell index.
    pub fn cell_values(&self, cell: usize) -> Vec<f64> {
        self.multi_index(cell)
            .iter()
            .zip(&self.axes)
            .map(|(&i, axis)| axis[i])
            .collect()
    }

    /// The most conservative cell: the top boundary of every axis.
    ///
    /// Used as the placeholder selection when no cell is statistically
    /// valid (predict-nothing fallback).
    pub fn conservative_cell(&self) -> usize {
        self.num_cells() - 1
    }

    /// Pick the extremal (most permissive) cell from a valid set.
    ///
    /// Tie-break is deterministic: minimum lambda1, then minimum lambda2
    /// among the cells sharing that lambda1. Returns None on an empty set.
    pub fn select_extremal(&self, valid: &[usize]) -> Option<usize> {
        valid
            .iter()
            .copied()
            .min_by_key(|&cell| self.multi_index(cell))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linspace_endpoints() {
        let v = linspace(0.0, 1.0, 5);
        assert_eq!(v, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(linspace(0.0, 1.0, 1), vec![0.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }

    #[test]
    fn test_flat_and_multi_index_roundtrip() {
        let grid = LambdaGrid::two_dim(linspace(0.0, 1.0, 3), linspace(0.0, 1.0, 4));
        assert_eq!(grid.num_cells(), 12);
        for cell in 0..grid.num_cells() {
            let mi = grid.multi_index(cell);
            assert_eq!(grid.flat_index(&mi), cell);
        }
        // Second axis is fastest
        assert_eq!(grid.multi_index(5), vec![1, 1]);
    }

    #[test]
    fn test_cell_values() {
        let grid = LambdaGrid::two_dim(vec![0.1, 0.2], vec![0.5, 0.6, 0.7]);
        assert_eq!(grid.cell_values(0), vec![0.1, 0.5]);
        assert_eq!(grid.cell_values(5), vec![0.2, 0.7]);
    }

    #[test]
    fn test_select_extremal_tie_break() {
        let grid = LambdaGrid::two_dim(vec![0.1, 0.2, 0.3], vec![0.5, 0.6]);
        // Cells: (0.2, 0.6) = 3, (0.2, 0.5) = 2, (0.3, 0.5) = 4
        let chosen = grid.select_extremal(&[3, 4, 2]).unwrap();
        assert_eq!(chosen, 2);
        assert_eq!(grid.cell_values(chosen), vec![0.2, 0.5]);
        assert_eq!(grid.select_extremal(&[]), None);
    }

    #[test]
    fn test_conservative_cell_is_top_boundary() {
        let grid = LambdaGrid::one_dim(linspace(0.0, 1.0, 100));
        assert_eq!(grid.cell_values(grid.conservative_cell()), vec![1.0]);
    }
}
