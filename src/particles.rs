//! Racing particles advected along the receiver graph.
//!
//! Only a random share of the particles moves on each step, which slows the
//! race down without touching the routing itself. A particle sitting on a
//! base-level cell routes to itself, so once arrived it never leaves.

use rand::seq::SliceRandom;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::ConfigError;
use crate::grid::Grid;
use crate::routing::ReceiverMap;

/// Fraction of particles moved per step, in (0, 1].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpeedFactor(f64);

impl SpeedFactor {
    pub fn new(value: f64) -> Result<Self, ConfigError> {
        if value > 0.0 && value <= 1.0 {
            Ok(Self(value))
        } else {
            Err(ConfigError::SpeedFactor(value))
        }
    }

    pub fn get(&self) -> f64 {
        self.0
    }

    /// How many of `n` particles move in one step.
    pub fn moving_count(&self, n: usize) -> usize {
        ((n as f64 * self.0).round() as usize).min(n)
    }
}

impl Default for SpeedFactor {
    fn default() -> Self {
        Self(0.5)
    }
}

/// Cosmetic particle sizes are drawn from this range (pixels).
const SIZE_RANGE: std::ops::Range<u8> = 2..6;

/// Particle positions in grid coordinates. Particles have no identity beyond
/// their slot.
#[derive(Debug, Clone)]
pub struct ParticleField {
    grid: Grid,
    rows: Vec<usize>,
    cols: Vec<usize>,
    sizes: Vec<u8>,
    // Scratch permutation reused by advect
    order: Vec<usize>,
    rng: ChaCha8Rng,
}

impl ParticleField {
    /// Create `n` particles spread over the upper half of `grid`.
    pub fn new(grid: Grid, n: usize, seed: u64) -> Result<Self, ConfigError> {
        if grid.rows < 4 || grid.cols < 2 {
            return Err(ConfigError::GridShape { rows: grid.rows, cols: grid.cols });
        }
        let mut field = Self {
            grid,
            rows: Vec::new(),
            cols: Vec::new(),
            sizes: Vec::new(),
            order: Vec::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        };
        field.resize(n)?;
        Ok(field)
    }

    /// Replace the whole set with `n` fresh particles. Old positions are discarded.
    pub fn resize(&mut self, n: usize) -> Result<(), ConfigError> {
        if n == 0 {
            return Err(ConfigError::ParticleCount);
        }
        let rng = &mut self.rng;
        self.sizes = (0..n).map(|_| rng.gen_range(SIZE_RANGE)).collect();
        self.order = (0..n).collect();
        self.rows = vec![0; n];
        self.cols = vec![0; n];
        self.initialize();
        Ok(())
    }

    /// Draw new random positions: `row` in `[1, rows/2)`, `col` in `[0, cols)`.
    pub fn initialize(&mut self) {
        let row_range = 1..self.grid.scarp_row();
        let col_range = 0..self.grid.cols;
        for (row, col) in self.rows.iter_mut().zip(self.cols.iter_mut()) {
            *row = self.rng.gen_range(row_range.clone());
            *col = self.rng.gen_range(col_range.clone());
        }
    }

    pub fn reset(&mut self) {
        self.initialize();
    }

    /// Move a random subset of `speed.moving_count(n)` particles one hop along
    /// `receivers`. Returns the number of particles selected.
    pub fn advect(&mut self, receivers: &ReceiverMap, speed: SpeedFactor) -> usize {
        debug_assert_eq!(receivers.grid().len(), self.grid.len());

        let k = speed.moving_count(self.len());
        let (selected, _) = self.order.partial_shuffle(&mut self.rng, k);
        for &p in selected.iter() {
            let cell = self.grid.index(self.rows[p], self.cols[p]);
            let (row, col) = self.grid.coords(receivers.get(cell));
            self.rows[p] = row;
            self.cols[p] = col;
        }
        k
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn cols(&self) -> &[usize] {
        &self.cols
    }

    pub fn sizes(&self) -> &[u8] {
        &self.sizes
    }

    /// Top-left pixel of each particle as `(x, y)` arrays.
    pub fn pixel_positions(&self, scale: u32) -> (Vec<u32>, Vec<u32>) {
        let x = self.cols.iter().map(|&c| c as u32 * scale).collect();
        let y = self.rows.iter().map(|&r| r as u32 * scale).collect();
        (x, y)
    }

    /// Place particles explicitly. Positions must lie inside the grid.
    #[cfg(test)]
    pub fn set_positions(&mut self, rows: Vec<usize>, cols: Vec<usize>) -> Result<(), ConfigError> {
        let in_bounds = rows.iter().all(|&r| r < self.grid.rows) && cols.iter().all(|&c| c < self.grid.cols);
        if rows.is_empty() || rows.len() != cols.len() || !in_bounds {
            return Err(ConfigError::GridShape { rows: self.grid.rows, cols: self.grid.cols });
        }
        let n = rows.len();
        if n != self.len() {
            let rng = &mut self.rng;
            self.sizes = (0..n).map(|_| rng.gen_range(SIZE_RANGE)).collect();
            self.order = (0..n).collect();
        }
        self.rows = rows;
        self.cols = cols;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every non-base cell drains straight down.
    fn downward(grid: &Grid) -> ReceiverMap {
        let receivers = (0..grid.len())
            .map(|i| {
                let (row, col) = grid.coords(i);
                if row == grid.base_row() { i } else { grid.index(row + 1, col) }
            })
            .collect();
        ReceiverMap::from_vec(*grid, receivers).unwrap()
    }

    #[test]
    fn test_speed_factor_bounds() {
        assert!(SpeedFactor::new(0.0).is_err());
        assert!(SpeedFactor::new(-0.2).is_err());
        assert!(SpeedFactor::new(1.01).is_err());
        assert_eq!(SpeedFactor::new(1.0).unwrap().moving_count(37), 37);
        assert_eq!(SpeedFactor::default().moving_count(10), 5);
        assert_eq!(SpeedFactor::default().moving_count(5), 3);
    }

    #[test]
    fn test_initial_positions_in_upper_half() {
        let grid = Grid::new(20, 15, 14.0, 19.0);
        let field = ParticleField::new(grid, 500, 11).unwrap();
        assert_eq!(field.len(), 500);
        assert!(field.rows().iter().all(|&r| (1..10).contains(&r)));
        assert!(field.cols().iter().all(|&c| c < 15));
        assert!(field.sizes().iter().all(|&s| (2..6).contains(&s)));
    }

    #[test]
    fn test_full_speed_moves_everyone() {
        let grid = Grid::new(10, 8, 7.0, 9.0);
        let map = downward(&grid);
        let mut field = ParticleField::new(grid, 64, 5).unwrap();
        let before = field.rows().to_vec();

        let moved = field.advect(&map, SpeedFactor::new(1.0).unwrap());
        assert_eq!(moved, 64);
        for (b, a) in before.iter().zip(field.rows()) {
            assert_eq!(*a, b + 1);
        }
    }

    #[test]
    fn test_half_speed_moves_subset() {
        let grid = Grid::new(10, 8, 7.0, 9.0);
        let map = downward(&grid);
        let mut field = ParticleField::new(grid, 40, 9).unwrap();
        let before = field.rows().to_vec();

        let moved = field.advect(&map, SpeedFactor::default());
        let changed = before.iter().zip(field.rows()).filter(|(b, a)| b != a).count();
        assert_eq!(moved, 20);
        assert_eq!(changed, 20);
    }

    #[test]
    fn test_arrived_particles_stay_and_all_in_bounds() {
        let grid = Grid::new(12, 6, 5.0, 11.0);
        let map = downward(&grid);
        let mut field = ParticleField::new(grid, 100, 21).unwrap();

        for _ in 0..200 {
            field.advect(&map, SpeedFactor::new(0.3).unwrap());
            assert!(field.rows().iter().all(|&r| r < grid.rows));
            assert!(field.cols().iter().all(|&c| c < grid.cols));
        }
        assert!(field.rows().iter().all(|&r| r == grid.base_row()));
    }

    #[test]
    fn test_resize_reinitializes() {
        let grid = Grid::new(10, 10, 9.0, 9.0);
        let mut field = ParticleField::new(grid, 10, 1).unwrap();
        field.resize(25).unwrap();
        assert_eq!(field.len(), 25);
        assert_eq!(field.sizes().len(), 25);
        assert!(field.rows().iter().all(|&r| (1..5).contains(&r)));
        assert_eq!(field.resize(0), Err(ConfigError::ParticleCount));
    }

    #[test]
    fn test_degenerate_grids_rejected() {
        for (rows, cols) in [(3, 10), (10, 1), (10, 0)] {
            let grid = Grid::new(rows, cols, 1.0, 1.0);
            assert_eq!(
                ParticleField::new(grid, 5, 0).err(),
                Some(ConfigError::GridShape { rows, cols }),
                "{}x{} grid accepted",
                rows,
                cols
            );
        }
        assert!(ParticleField::new(Grid::new(4, 2, 1.0, 1.0), 5, 0).is_ok());
    }

    #[test]
    fn test_set_positions_checks_bounds() {
        let grid = Grid::new(10, 10, 9.0, 9.0);
        let mut field = ParticleField::new(grid, 4, 1).unwrap();
        assert!(field.set_positions(vec![9, 9], vec![0, 10]).is_err());
        field.set_positions(vec![9, 9, 9], vec![0, 4, 5]).unwrap();
        assert_eq!(field.len(), 3);
        assert_eq!(field.pixel_positions(3), (vec![0, 12, 15], vec![27, 27, 27]));
    }
}
