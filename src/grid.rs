// Uniform 2D grid over the clustering candidates, used for fixed-radius neighbour queries.

/// Particles sorted by grid cell (counting sort), with per-cell start/count tables.
#[derive(Debug, Clone)]
pub struct NeighbourGrid {
    min_x: f64,
    min_y: f64,
    inv_cell_size: f64,
    dim_x: usize,
    dim_y: usize,
    cell_starts: Vec<usize>,
    cell_counts: Vec<usize>,
    cell_particle_indices: Vec<usize>,
}

// Upper bound on cells per particle; sparse inputs get coarser (still >= eps) cells.
const MAX_CELLS_PER_POINT: usize = 4;

impl NeighbourGrid {
    /// Builds the grid with cells at least `min_cell_size` wide.
    pub fn build(points: &[(f64, f64)], min_cell_size: f64) -> Self {
        let n = points.len();
        let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
        let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for &(x, y) in points {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        if n == 0 {
            min_x = 0.0;
            min_y = 0.0;
            max_x = 0.0;
            max_y = 0.0;
        }

        let extent = (max_x - min_x).max(max_y - min_y).max(0.0);
        let max_cells = (n * MAX_CELLS_PER_POINT).max(1) as f64;
        let cell_size = min_cell_size.max(extent / max_cells.sqrt()).max(f64::MIN_POSITIVE);
        let inv_cell_size = 1.0 / cell_size;

        let dim_x = (((max_x - min_x) * inv_cell_size).floor() as usize) + 1;
        let dim_y = (((max_y - min_y) * inv_cell_size).floor() as usize) + 1;
        let num_cells = dim_x * dim_y;

        let mut grid = NeighbourGrid {
            min_x,
            min_y,
            inv_cell_size,
            dim_x,
            dim_y,
            cell_starts: vec![0; num_cells],
            cell_counts: vec![0; num_cells],
            cell_particle_indices: vec![0; n],
        };

        // Phase 1: count particles per cell.
        let cell_of: Vec<usize> = points.iter().map(|&p| grid.cell_idx(p)).collect();
        for &c in &cell_of {
            grid.cell_counts[c] += 1;
        }

        // Phase 2: prefix sum for cell start indices.
        let mut total = 0;
        for c in 0..num_cells {
            grid.cell_starts[c] = total;
            total += grid.cell_counts[c];
        }

        // Phase 3: scatter particle indices, preserving input order within a cell.
        let mut write_offsets = vec![0usize; num_cells];
        for (idx, &c) in cell_of.iter().enumerate() {
            grid.cell_particle_indices[grid.cell_starts[c] + write_offsets[c]] = idx;
            write_offsets[c] += 1;
        }
        grid
    }

    #[inline(always)]
    fn cell_coords(&self, (x, y): (f64, f64)) -> (i64, i64) {
        (
            ((x - self.min_x) * self.inv_cell_size).floor() as i64,
            ((y - self.min_y) * self.inv_cell_size).floor() as i64,
        )
    }

    #[inline(always)]
    fn cell_idx(&self, p: (f64, f64)) -> usize {
        let (gx, gy) = self.cell_coords(p);
        // Clamp to grid dimensions to handle edge cases
        let gx = gx.clamp(0, self.dim_x as i64 - 1) as usize;
        let gy = gy.clamp(0, self.dim_y as i64 - 1) as usize;
        gy * self.dim_x + gx
    }

    /// Calls `f` with the index of every point within `max_dist` of `pos`
    /// (the query point itself included when it is one of `points`).
    /// `max_dist` must not exceed the cell size used at build time.
    pub fn for_each_neighbor<F>(&self, points: &[(f64, f64)], pos: (f64, f64), max_dist: f64, mut f: F)
    where
        F: FnMut(usize),
    {
        let max_dist_sq = max_dist * max_dist;
        let (cx, cy) = self.cell_coords(pos);

        for dy in -1..=1 {
            for dx in -1..=1 {
                let gx = cx + dx;
                let gy = cy + dy;
                if gx < 0 || gy < 0 || gx >= self.dim_x as i64 || gy >= self.dim_y as i64 {
                    continue;
                }
                let cell = gy as usize * self.dim_x + gx as usize;
                let start = self.cell_starts[cell];
                let end = start + self.cell_counts[cell];
                for &idx in &self.cell_particle_indices[start..end] {
                    let (x, y) = points[idx];
                    let ddx = x - pos.0;
                    let ddy = y - pos.1;
                    if ddx * ddx + ddy * ddy <= max_dist_sq {
                        f(idx);
                    }
                }
            }
        }
    }

    /// Indices of every point within `max_dist` of `pos`, in ascending order.
    pub fn neighbors(&self, points: &[(f64, f64)], pos: (f64, f64), max_dist: f64) -> Vec<usize> {
        let mut out = Vec::new();
        self.for_each_neighbor(points, pos, max_dist, |i| out.push(i));
        out.sort_unstable();
        out
    }
}
