use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Axis-aligned domain bounding box, in simulation length units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DomainBounds {
    pub xlo: f64,
    pub xhi: f64,
    pub ylo: f64,
    pub yhi: f64,
    pub zlo: f64,
    pub zhi: f64,
}

/// Structured grid over the domain. Cells are uniform cubes of side `h`;
/// cell `(i, j, l)` maps to linear index `k = i + j*nx + l*nx*ny`.
#[derive(Debug, Clone)]
pub struct Grid {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    pub bounds: DomainBounds,
    h: f64,
}

impl Grid {
    /// Builds a grid from domain bounds and per-axis cell counts.
    /// Fails if the resulting cells are not cubic.
    pub fn new(bounds: DomainBounds, nx: usize, ny: usize, nz: usize) -> Result<Self> {
        if nx == 0 || ny == 0 || nz == 0 {
            bail!("Grid dimensions must be positive (got {}x{}x{}).", nx, ny, nz);
        }
        let gridx = (bounds.xhi - bounds.xlo) / nx as f64;
        let gridy = (bounds.yhi - bounds.ylo) / ny as f64;
        let gridz = (bounds.zhi - bounds.zlo) / nz as f64;
        if gridx <= 0.0 {
            bail!("Domain bounds are degenerate along x.");
        }
        if !is_equal(gridx, gridy, gridz) {
            bail!(
                "Grid is not cubic: cell sizes {:.6e} / {:.6e} / {:.6e}.",
                gridx,
                gridy,
                gridz
            );
        }
        Ok(Self { nx, ny, nz, bounds, h: gridx })
    }

    /// Total number of cells.
    #[inline(always)]
    pub fn ngrids(&self) -> usize {
        self.nx * self.ny * self.nz
    }

    /// Uniform cell size.
    #[inline(always)]
    pub fn spacing(&self) -> f64 {
        self.h
    }

    /// Linear index of cell `(i, j, l)` (0-based along each axis).
    #[inline(always)]
    pub fn cell_index(&self, i: usize, j: usize, l: usize) -> usize {
        i + j * self.nx + l * self.nx * self.ny
    }

    /// A grid with a single z-layer degenerates to the 2D operator.
    #[inline(always)]
    pub fn is_2d(&self) -> bool {
        self.nz == 1
    }

    /// Center coordinate of cell `(i, j, l)`.
    pub fn cell_center(&self, i: usize, j: usize, l: usize) -> (f64, f64, f64) {
        (
            self.bounds.xlo + (i as f64 + 0.5) * self.h,
            self.bounds.ylo + (j as f64 + 0.5) * self.h,
            self.bounds.zlo + (l as f64 + 0.5) * self.h,
        )
    }
}

fn is_equal(a: f64, b: f64, c: f64) -> bool {
    let epsilon = 1e-10;
    let scale = a.abs().max(1.0);
    (a - b).abs() <= epsilon * scale && (a - c).abs() <= epsilon * scale
}

/// Boundary condition pair for one axis: the first letter applies to the
/// minus face, the second to the plus face.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryCode {
    /// `pp`: wrap-around coupling to the opposite face.
    PeriodicPeriodic,
    /// `dd`: fixed value on both faces.
    DirichletDirichlet,
    /// `nd`: fixed flux on the minus face, fixed value on the plus face.
    NeumannDirichlet,
    /// `nn`: fixed flux on both faces.
    NeumannNeumann,
    /// `dn`: fixed value on the minus face, fixed flux on the plus face.
    DirichletNeumann,
}

impl BoundaryCode {
    /// Parses the two-letter code used in input files. An unrecognized
    /// code is a fatal configuration error.
    pub fn parse(code: &str) -> Result<Self> {
        match code {
            "pp" => Ok(BoundaryCode::PeriodicPeriodic),
            "dd" => Ok(BoundaryCode::DirichletDirichlet),
            "nd" => Ok(BoundaryCode::NeumannDirichlet),
            "nn" => Ok(BoundaryCode::NeumannNeumann),
            "dn" => Ok(BoundaryCode::DirichletNeumann),
            other => bail!("Illegal boundary condition code '{}'.", other),
        }
    }
}

/// Whether a species dissolves in the liquid phase (and therefore diffuses)
/// or lives in the gas phase (left to external chemistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeciesKind {
    Liquid,
    Gas,
}

/// Per-species metadata consumed by the diffusion engine.
///
/// `boundary` holds the six face values in the order
/// `[-x, +x, -y, +y, -z, +z]`; `bc` holds the per-axis code for x, y, z.
#[derive(Debug, Clone)]
pub struct Species {
    pub name: String,
    pub diffusion_coeff: f64,
    pub kind: SpeciesKind,
    pub boundary: [f64; 6],
    pub bc: [BoundaryCode; 3],
    /// Initial bulk concentration used to seed the field.
    pub initial: f64,
}

impl Species {
    /// Largest of the six face values; used as a fallback driving value
    /// when no initial concentration is configured.
    pub fn max_boundary(&self) -> f64 {
        self.boundary.iter().copied().fold(f64::MIN, f64::max)
    }

    /// Species that the stepper should advance: liquid-phase with a
    /// nonzero diffusion coefficient.
    pub fn diffuses(&self) -> bool {
        self.kind == SpeciesKind::Liquid && self.diffusion_coeff != 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_bounds() -> DomainBounds {
        DomainBounds { xlo: 0.0, xhi: 1.0, ylo: 0.0, yhi: 1.0, zlo: 0.0, zhi: 1.0 }
    }

    #[test]
    fn test_linear_index_mapping() {
        let grid = Grid::new(unit_bounds(), 4, 4, 4).unwrap();
        assert_eq!(grid.ngrids(), 64);
        assert_eq!(grid.cell_index(0, 0, 0), 0);
        assert_eq!(grid.cell_index(3, 0, 0), 3);
        assert_eq!(grid.cell_index(0, 1, 0), 4);
        assert_eq!(grid.cell_index(0, 0, 1), 16);
        assert_eq!(grid.cell_index(3, 3, 3), 63);
        assert!((grid.spacing() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_non_cubic_grid_rejected() {
        let bounds = DomainBounds { xhi: 2.0, ..unit_bounds() };
        assert!(Grid::new(bounds, 4, 4, 4).is_err());
    }

    #[test]
    fn test_boundary_code_parse() {
        assert_eq!(BoundaryCode::parse("pp").unwrap(), BoundaryCode::PeriodicPeriodic);
        assert_eq!(BoundaryCode::parse("dd").unwrap(), BoundaryCode::DirichletDirichlet);
        assert_eq!(BoundaryCode::parse("nd").unwrap(), BoundaryCode::NeumannDirichlet);
        assert_eq!(BoundaryCode::parse("nn").unwrap(), BoundaryCode::NeumannNeumann);
        assert_eq!(BoundaryCode::parse("dn").unwrap(), BoundaryCode::DirichletNeumann);
        assert!(BoundaryCode::parse("xx").is_err());
    }

    #[test]
    fn test_species_max_boundary() {
        let species = Species {
            name: "o2".into(),
            diffusion_coeff: 2.3e-9,
            kind: SpeciesKind::Liquid,
            boundary: [1.0, 0.0, 0.0, 0.5, 0.0, 0.0],
            bc: [BoundaryCode::DirichletDirichlet; 3],
            initial: 0.0,
        };
        assert_eq!(species.max_boundary(), 1.0);
        assert!(species.diffuses());
    }
}
