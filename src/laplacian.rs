use crate::grid::Grid;

/// Compressed-sparse-row matrix, just large enough for the operator algebra
/// the diffusion engine needs: band construction, Kronecker products, sums,
/// and matrix-vector products.
#[derive(Debug, Clone)]
pub struct SparseMatrix {
    nrows: usize,
    ncols: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<f64>,
}

impl SparseMatrix {
    /// Assembles from (row, col, value) triplets; duplicate entries are summed.
    pub fn from_triplets(nrows: usize, ncols: usize, mut triplets: Vec<(usize, usize, f64)>) -> Self {
        triplets.sort_unstable_by_key(|&(r, c, _)| (r, c));

        let mut row_ptr = Vec::with_capacity(nrows + 1);
        let mut col_idx = Vec::with_capacity(triplets.len());
        let mut values = Vec::with_capacity(triplets.len());

        row_ptr.push(0);
        let mut current_row = 0;
        let mut prev: Option<(usize, usize)> = None;
        for (r, c, v) in triplets {
            debug_assert!(r < nrows && c < ncols);
            while current_row < r {
                row_ptr.push(col_idx.len());
                current_row += 1;
            }
            if prev == Some((r, c)) {
                if let Some(last) = values.last_mut() {
                    *last += v;
                }
            } else {
                col_idx.push(c);
                values.push(v);
                prev = Some((r, c));
            }
        }
        while current_row < nrows {
            row_ptr.push(col_idx.len());
            current_row += 1;
        }

        Self { nrows, ncols, row_ptr, col_idx, values }
    }

    /// Identity matrix of order `n`.
    pub fn identity(n: usize) -> Self {
        let triplets = (0..n).map(|i| (i, i, 1.0)).collect();
        Self::from_triplets(n, n, triplets)
    }

    /// Tridiagonal 1D second-difference stencil `{1, -2, 1}` of order `n`.
    pub fn second_difference(n: usize) -> Self {
        let mut triplets = Vec::with_capacity(3 * n);
        for i in 0..n {
            if i > 0 {
                triplets.push((i, i - 1, 1.0));
            }
            triplets.push((i, i, -2.0));
            if i + 1 < n {
                triplets.push((i, i + 1, 1.0));
            }
        }
        Self::from_triplets(n, n, triplets)
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Kronecker product `self ⊗ other`.
    pub fn kron(&self, other: &Self) -> Self {
        let nrows = self.nrows * other.nrows;
        let ncols = self.ncols * other.ncols;
        let mut triplets = Vec::with_capacity(self.nnz() * other.nnz());
        for ar in 0..self.nrows {
            for ai in self.row_ptr[ar]..self.row_ptr[ar + 1] {
                let ac = self.col_idx[ai];
                let av = self.values[ai];
                for br in 0..other.nrows {
                    for bi in other.row_ptr[br]..other.row_ptr[br + 1] {
                        let bc = other.col_idx[bi];
                        triplets.push((
                            ar * other.nrows + br,
                            ac * other.ncols + bc,
                            av * other.values[bi],
                        ));
                    }
                }
            }
        }
        Self::from_triplets(nrows, ncols, triplets)
    }

    /// Element-wise sum of two matrices of identical shape.
    pub fn add(&self, other: &Self) -> Self {
        assert_eq!((self.nrows, self.ncols), (other.nrows, other.ncols));
        let mut triplets = Vec::with_capacity(self.nnz() + other.nnz());
        for m in [self, other] {
            for r in 0..m.nrows {
                for i in m.row_ptr[r]..m.row_ptr[r + 1] {
                    triplets.push((r, m.col_idx[i], m.values[i]));
                }
            }
        }
        Self::from_triplets(self.nrows, self.ncols, triplets)
    }

    /// Computes `y = A * x`.
    pub fn mul_vec(&self, x: &[f64], y: &mut [f64]) {
        debug_assert_eq!(x.len(), self.ncols);
        debug_assert_eq!(y.len(), self.nrows);
        for r in 0..self.nrows {
            let mut sum = 0.0;
            for i in self.row_ptr[r]..self.row_ptr[r + 1] {
                sum += self.values[i] * x[self.col_idx[i]];
            }
            y[r] = sum;
        }
    }

    /// Value at (row, col); zero if the entry is not stored.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        for i in self.row_ptr[row]..self.row_ptr[row + 1] {
            if self.col_idx[i] == col {
                return self.values[i];
            }
        }
        0.0
    }
}

/// Builds the discrete Laplacian for the grid as a Kronecker sum of 1D
/// second-difference stencils:
///
/// 3D: `L = Iz ⊗ Iy ⊗ Dx + Iz ⊗ Dy ⊗ Ix + Dz ⊗ Iy ⊗ Ix` (7-point stencil,
/// interior diagonal -6). A single z-layer degenerates to the 2D 5-point
/// stencil (interior diagonal -4).
///
/// The operator couples interior cells only; boundary corrections are
/// injected per iteration as a separate vector, so one operator serves
/// every boundary-condition combination.
pub fn build_laplacian(grid: &Grid) -> SparseMatrix {
    let (nx, ny, nz) = (grid.nx, grid.ny, grid.nz);

    let dx = SparseMatrix::second_difference(nx);
    let dy = SparseMatrix::second_difference(ny);
    let ix = SparseMatrix::identity(nx);
    let iy = SparseMatrix::identity(ny);

    // With k = i + j*nx (+ l*nx*ny), x is the fastest axis, so the x stencil
    // sits rightmost in each Kronecker product.
    let l2 = iy.kron(&dx).add(&dy.kron(&ix));
    if grid.is_2d() {
        return l2;
    }

    let dz = SparseMatrix::second_difference(nz);
    let iz = SparseMatrix::identity(nz);
    let ixy = SparseMatrix::identity(nx * ny);
    iz.kron(&l2).add(&dz.kron(&ixy))
}
