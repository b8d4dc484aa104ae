//! Rectangular raster shared by the engine, the router and the particles.
//!
//! Cells are stored row-major: `index = row * cols + col`. Row 0 is the top of
//! the board and the last row is the base level particles race toward.

use serde::{Deserialize, Serialize};

/// Fixed grid shape and physical extent. Immutable for a simulation's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    pub rows: usize,
    pub cols: usize,
    /// Physical length along the columns (x axis)
    pub length_x: f64,
    /// Physical length along the rows (y axis, toward base level)
    pub length_y: f64,
}

impl Grid {
    pub fn new(rows: usize, cols: usize, length_x: f64, length_y: f64) -> Self {
        Self { rows, cols, length_x, length_y }
    }

    /// Total number of cells.
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Node spacing `(dx, dy)`; the lengths span node centres, so n nodes give n - 1 intervals.
    pub fn spacing(&self) -> (f64, f64) {
        let dx = self.length_x / (self.cols.max(2) - 1) as f64;
        let dy = self.length_y / (self.rows.max(2) - 1) as f64;
        (dx, dy)
    }

    /// Area represented by one cell.
    pub fn cell_area(&self) -> f64 {
        let (dx, dy) = self.spacing();
        dx * dy
    }

    #[inline]
    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.cols + col
    }

    #[inline]
    pub fn coords(&self, index: usize) -> (usize, usize) {
        (index / self.cols, index % self.cols)
    }

    /// Index of the last row, where particles are considered arrived.
    pub fn base_row(&self) -> usize {
        self.rows - 1
    }

    /// First row below the uplifted plateau.
    pub fn scarp_row(&self) -> usize {
        self.rows / 2
    }

    /// 8-connected neighbours inside the grid (no wrapping), with their
    /// physical distance from the centre cell.
    pub fn neighbors_8(&self, row: usize, col: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let (dx, dy) = self.spacing();
        let diag = (dx * dx + dy * dy).sqrt();
        let (row, col) = (row as i64, col as i64);

        (-1i64..=1)
            .flat_map(move |dr| (-1i64..=1).map(move |dc| (dr, dc)))
            .filter(|&(dr, dc)| dr != 0 || dc != 0)
            .filter_map(move |(dr, dc)| {
                let nr = row + dr;
                let nc = col + dc;
                if nr < 0 || nc < 0 || nr >= self.rows as i64 || nc >= self.cols as i64 {
                    return None;
                }
                let dist = match (dr, dc) {
                    (0, _) => dx,
                    (_, 0) => dy,
                    _ => diag,
                };
                Some((self.index(nr as usize, nc as usize), dist))
            })
    }
}
