use crate::grid::{BoundaryCode, Grid};

/// Fills `b` with the additive boundary correction for the field `s`.
///
/// For every boundary cell the correction encodes what the missing stencil
/// neighbor would have contributed: the opposite-face value for periodic
/// axes, a mirrored ghost value for Dirichlet faces (`2*bc - S`), or a
/// one-sided flux ghost for Neumann faces (`±h*bc + S`). Corrections are
/// applied independently per axis and summed, so `L*s + b` is the complete
/// diffusion stencil. `values` holds the six face values in the order
/// `[-x, +x, -y, +y, -z, +z]`.
pub fn boundary_vector(
    grid: &Grid,
    codes: &[BoundaryCode; 3],
    values: &[f64; 6],
    s: &[f64],
    b: &mut [f64],
) {
    debug_assert_eq!(s.len(), grid.ngrids());
    debug_assert_eq!(b.len(), grid.ngrids());
    b.fill(0.0);

    let (nx, ny, nz) = (grid.nx, grid.ny, grid.nz);
    let h = grid.spacing();

    // X faces: one (minus, plus) pair per x-row.
    for l in 0..nz {
        for j in 0..ny {
            let k = grid.cell_index(0, j, l);
            apply_face_pair(codes[0], values[0], values[1], h, k, k + nx - 1, s, b);
        }
    }

    // Y faces: the j = 0 and j = ny-1 rows of every z-slab.
    for l in 0..nz {
        let mut i_p = grid.cell_index(0, ny - 1, l);
        for i_m in grid.cell_index(0, 0, l)..=grid.cell_index(nx - 1, 0, l) {
            apply_face_pair(codes[1], values[2], values[3], h, i_m, i_p, s, b);
            i_p += 1;
        }
    }

    // Z faces: bottom and top slabs. A single-layer grid has no z stencil.
    if nz > 1 {
        let mut i_p = grid.cell_index(0, 0, nz - 1);
        for i_m in 0..nx * ny {
            apply_face_pair(codes[2], values[4], values[5], h, i_m, i_p, s, b);
            i_p += 1;
        }
    }
}

/// The component of the boundary correction that is linear in the field
/// itself (wrap couplings and the `±S(self)` ghost terms). Equal to
/// `boundary_vector` evaluated with all face values zeroed; the implicit
/// stepper folds this part into its system operator.
pub fn boundary_linear_part(
    grid: &Grid,
    codes: &[BoundaryCode; 3],
    s: &[f64],
    b: &mut [f64],
) {
    boundary_vector(grid, codes, &[0.0; 6], s, b);
}

#[inline]
fn apply_face_pair(
    code: BoundaryCode,
    bcm: f64,
    bcp: f64,
    h: f64,
    i_m: usize,
    i_p: usize,
    s: &[f64],
    b: &mut [f64],
) {
    match code {
        BoundaryCode::PeriodicPeriodic => {
            b[i_m] += s[i_p];
            b[i_p] += s[i_m];
        }
        BoundaryCode::DirichletDirichlet => {
            b[i_m] += 2.0 * bcm - s[i_m];
            b[i_p] += 2.0 * bcp - s[i_p];
        }
        BoundaryCode::NeumannDirichlet => {
            b[i_m] += -h * bcm + s[i_m];
            b[i_p] += 2.0 * bcp - s[i_p];
        }
        BoundaryCode::NeumannNeumann => {
            b[i_m] += -h * bcm + s[i_m];
            b[i_p] += h * bcp + s[i_p];
        }
        BoundaryCode::DirichletNeumann => {
            b[i_m] += 2.0 * bcm - s[i_m];
            b[i_p] += h * bcp + s[i_p];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::DomainBounds;
    use approx::assert_relative_eq;

    fn cube_grid(n: usize) -> Grid {
        let bounds =
            DomainBounds { xlo: 0.0, xhi: 1.0, ylo: 0.0, yhi: 1.0, zlo: 0.0, zhi: 1.0 };
        Grid::new(bounds, n, n, n).unwrap()
    }

    #[test]
    fn test_periodic_wraps_opposite_face() {
        let grid = cube_grid(3);
        let codes = [BoundaryCode::PeriodicPeriodic; 3];
        let mut s = vec![0.0; grid.ngrids()];
        s[grid.cell_index(2, 1, 1)] = 5.0;
        let mut b = vec![0.0; grid.ngrids()];
        boundary_vector(&grid, &codes, &[0.0; 6], &s, &mut b);
        // The +x face value wraps onto the -x face cell of the same row.
        assert_relative_eq!(b[grid.cell_index(0, 1, 1)], 5.0);
    }

    #[test]
    fn test_dirichlet_ghost_on_both_faces() {
        let grid = cube_grid(3);
        let codes = [
            BoundaryCode::DirichletDirichlet,
            BoundaryCode::NeumannNeumann,
            BoundaryCode::NeumannNeumann,
        ];
        let values = [1.0, 0.25, 0.0, 0.0, 0.0, 0.0];
        let s = vec![0.5; grid.ngrids()];
        let mut b = vec![0.0; grid.ngrids()];
        boundary_vector(&grid, &codes, &values, &s, &mut b);

        // -x cell of an interior row: 2*1.0 - 0.5 from x, +0.5 from each
        // zero-flux Neumann y/z membership (interior row: none).
        let k = grid.cell_index(0, 1, 1);
        assert_relative_eq!(b[k], 2.0 * 1.0 - 0.5);
        let k = grid.cell_index(2, 1, 1);
        assert_relative_eq!(b[k], 2.0 * 0.25 - 0.5);
        // Interior cells get no correction.
        assert_relative_eq!(b[grid.cell_index(1, 1, 1)], 0.0);
    }

    #[test]
    fn test_neumann_flux_sign_convention() {
        let grid = cube_grid(3);
        let codes = [
            BoundaryCode::NeumannNeumann,
            BoundaryCode::PeriodicPeriodic,
            BoundaryCode::PeriodicPeriodic,
        ];
        let values = [2.0, 3.0, 0.0, 0.0, 0.0, 0.0];
        let s = vec![1.0; grid.ngrids()];
        let mut b = vec![0.0; grid.ngrids()];
        boundary_vector(&grid, &codes, &values, &s, &mut b);
        let h = grid.spacing();

        // -x: -h*bc + S(self) plus the periodic y/z wrap of the uniform field.
        let corner = grid.cell_index(0, 0, 0);
        assert_relative_eq!(b[corner], (-h * 2.0 + 1.0) + 1.0 + 1.0);
        let k = grid.cell_index(2, 1, 1);
        assert_relative_eq!(b[k], h * 3.0 + 1.0);
    }

    #[test]
    fn test_correction_splits_into_constant_and_linear_parts() {
        let grid = cube_grid(4);
        let codes = [
            BoundaryCode::DirichletDirichlet,
            BoundaryCode::NeumannDirichlet,
            BoundaryCode::DirichletNeumann,
        ];
        let values = [1.0, 0.2, 0.3, 0.4, 0.5, 0.6];
        let s: Vec<f64> = (0..grid.ngrids()).map(|k| 0.01 * k as f64).collect();

        let mut full = vec![0.0; grid.ngrids()];
        boundary_vector(&grid, &codes, &values, &s, &mut full);

        let zero_field = vec![0.0; grid.ngrids()];
        let mut constant = vec![0.0; grid.ngrids()];
        boundary_vector(&grid, &codes, &values, &zero_field, &mut constant);

        let mut linear = vec![0.0; grid.ngrids()];
        boundary_linear_part(&grid, &codes, &s, &mut linear);

        for k in 0..grid.ngrids() {
            assert_relative_eq!(full[k], constant[k] + linear[k], epsilon = 1e-14);
        }
    }
}
