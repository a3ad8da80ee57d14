use crate::boundary::{boundary_linear_part, boundary_vector};
use crate::grid::{Grid, Species};
use crate::laplacian::{build_laplacian, SparseMatrix};
use crate::solver::{bicgstab, SolverSettings};
use anyhow::{bail, Result};
use log::{debug, warn};
use rayon::prelude::*;

/// Negative concentrations within numerical noise are clamped here rather
/// than to zero, so downstream rate laws never see a log/division singularity.
pub const CONCENTRATION_FLOOR: f64 = 1e-20;

/// A concentration this far below zero is solver divergence, not noise.
const DIVERGENCE_THRESHOLD: f64 = -1e-6;

/// Time discretization of the diffusion-reaction update, chosen at
/// configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepScheme {
    /// Forward update `S += dt*(2r*(L*S + B) + R)`.
    Explicit,
    /// Backward-Euler update solved iteratively each step.
    Implicit,
}

/// Runtime knobs for the stepper and its convergence controller.
#[derive(Debug, Clone)]
pub struct StepperSettings {
    pub scheme: StepScheme,
    /// Sub-iteration timestep of the quasi-steady solve.
    pub timestep: f64,
    /// Relative-change tolerance deciding per-species convergence.
    pub tolerance: f64,
    /// Convergence is evaluated every `relax_stride` iterations; between
    /// checkpoints the explicit mode accumulates residuals to damp noise.
    pub relax_stride: usize,
    /// Iteration cap: exceeding it accepts the current state with a warning
    /// instead of deadlocking the outer simulation.
    pub max_iterations: usize,
    pub solver: SolverSettings,
}

impl Default for StepperSettings {
    fn default() -> Self {
        Self {
            scheme: StepScheme::Explicit,
            timestep: 1e-4,
            tolerance: 1e-6,
            relax_stride: 1,
            max_iterations: 500_000,
            solver: SolverSettings::default(),
        }
    }
}

/// Per-species solver state carried across iterations and macro-steps.
#[derive(Debug, Clone)]
struct SpeciesState {
    converged: bool,
    /// Peak field magnitude at the previous checkpoint; the reference for
    /// the convergence ratio. Seeded lazily from the current field.
    prev_peak: f64,
    /// Residual accumulated between checkpoints (explicit relax stride).
    residual_acc: Vec<f64>,
    // Scratch buffers, allocated once per topology.
    bc: Vec<f64>,
    lap_s: Vec<f64>,
    res: Vec<f64>,
}

impl SpeciesState {
    fn new(ngrids: usize) -> Self {
        Self {
            converged: false,
            prev_peak: 0.0,
            residual_acc: vec![0.0; ngrids],
            bc: vec![0.0; ngrids],
            lap_s: vec![0.0; ngrids],
            res: vec![0.0; ngrids],
        }
    }
}

/// Outcome of one quasi-steady solve.
#[derive(Debug, Clone, Copy)]
pub struct SolveReport {
    pub iterations: usize,
    pub converged: bool,
}

/// Advances all diffusing species to quasi-steady state over the grid.
///
/// Owns the assembled Laplacian and all per-species scratch; the operator is
/// rebuilt only when the grid topology changes. Concentration and reaction
/// fields stay owned by the caller.
pub struct DiffusionSolver {
    grid: Grid,
    laplacian: SparseMatrix,
    settings: StepperSettings,
    /// Per-species diffusion number `r = D / (2h^2)`.
    diffusion_number: Vec<f64>,
    states: Vec<SpeciesState>,
}

impl DiffusionSolver {
    pub fn new(grid: Grid, species: &[Species], settings: StepperSettings) -> Result<Self> {
        if settings.timestep <= 0.0 {
            bail!("Diffusion timestep must be positive.");
        }
        if settings.tolerance <= 0.0 {
            bail!("Diffusion tolerance must be positive.");
        }
        if settings.relax_stride == 0 {
            bail!("Relaxation stride must be at least 1.");
        }
        if settings.max_iterations == 0 {
            bail!("Iteration cap must be at least 1.");
        }

        let laplacian = build_laplacian(&grid);
        debug!(
            "Assembled {} Laplacian: {} cells, {} nonzeros.",
            if grid.is_2d() { "2D" } else { "3D" },
            grid.ngrids(),
            laplacian.nnz()
        );

        let h = grid.spacing();
        let diffusion_number =
            species.iter().map(|sp| sp.diffusion_coeff / (2.0 * h * h)).collect();
        let states = species.iter().map(|_| SpeciesState::new(grid.ngrids())).collect();

        Ok(Self { grid, laplacian, settings, diffusion_number, states })
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Rebuilds the operator and scratch after a grid topology change.
    pub fn rebuild(&mut self, grid: Grid, species: &[Species]) {
        let h = grid.spacing();
        self.laplacian = build_laplacian(&grid);
        self.diffusion_number =
            species.iter().map(|sp| sp.diffusion_coeff / (2.0 * h * h)).collect();
        self.states = species.iter().map(|_| SpeciesState::new(grid.ngrids())).collect();
        self.grid = grid;
    }

    /// Iterates the stepper until every diffusing species converges or the
    /// iteration cap trips. `fields` holds one concentration vector per
    /// species and is updated in place; `rates` is the external
    /// consumption/production source term, read-only for the whole solve.
    pub fn solve(
        &mut self,
        species: &[Species],
        fields: &mut [Vec<f64>],
        rates: &[Vec<f64>],
    ) -> Result<SolveReport> {
        let nnus = species.len();
        if fields.len() != nnus || rates.len() != nnus || self.states.len() != nnus {
            bail!(
                "Species/field/rate count mismatch: {} species, {} fields, {} rates.",
                nnus,
                fields.len(),
                rates.len()
            );
        }
        for state in &mut self.states {
            state.converged = false;
            state.residual_acc.fill(0.0);
        }

        let grid = &self.grid;
        let laplacian = &self.laplacian;
        let settings = &self.settings;
        let diffusion_number = &self.diffusion_number;

        let mut iteration = 0usize;
        loop {
            iteration += 1;

            self.states
                .par_iter_mut()
                .zip(fields.par_iter_mut())
                .enumerate()
                .map(|(idx, (state, field))| -> Result<()> {
                    let sp = &species[idx];
                    if !sp.diffuses() || state.converged {
                        return Ok(());
                    }
                    let max_delta = match settings.scheme {
                        StepScheme::Explicit => step_explicit(
                            grid,
                            laplacian,
                            settings,
                            diffusion_number[idx],
                            sp,
                            state,
                            field,
                            &rates[idx],
                            iteration,
                        )?,
                        StepScheme::Implicit => step_implicit(
                            grid,
                            laplacian,
                            settings,
                            diffusion_number[idx],
                            sp,
                            state,
                            field,
                            &rates[idx],
                        )?,
                    };

                    // Convergence is only decided at stride checkpoints;
                    // intermediate iterations count as not converged.
                    if iteration % settings.relax_stride == 0 {
                        if state.prev_peak == 0.0 {
                            let peak = peak_magnitude(field);
                            state.prev_peak = if peak != 0.0 { peak } else { 1.0 };
                        }
                        let ratio = max_delta / state.prev_peak;
                        if ratio < settings.tolerance {
                            state.converged = true;
                        }
                    }
                    Ok(())
                })
                .collect::<Result<Vec<()>>>()?;

            let all_converged = self
                .states
                .iter()
                .zip(species)
                .filter(|(_, sp)| sp.diffuses())
                .all(|(state, _)| state.converged);

            if all_converged {
                debug!("Diffusion converged after {} iterations.", iteration);
                store_peaks(&mut self.states, fields);
                return Ok(SolveReport { iterations: iteration, converged: true });
            }
            if iteration >= settings.max_iterations {
                warn!(
                    "Diffusion exceeded {} iterations; forcing convergence with the current state.",
                    settings.max_iterations
                );
                store_peaks(&mut self.states, fields);
                return Ok(SolveReport { iterations: iteration, converged: false });
            }
        }
    }
}

/// End-of-solve bookkeeping: each field's peak becomes the next solve's
/// convergence reference.
fn store_peaks(states: &mut [SpeciesState], fields: &[Vec<f64>]) {
    for (state, field) in states.iter_mut().zip(fields) {
        state.prev_peak = peak_magnitude(field);
    }
}

#[allow(clippy::too_many_arguments)]
fn step_explicit(
    grid: &Grid,
    laplacian: &SparseMatrix,
    settings: &StepperSettings,
    r: f64,
    sp: &Species,
    state: &mut SpeciesState,
    field: &mut [f64],
    rate: &[f64],
    iteration: usize,
) -> Result<f64> {
    boundary_vector(grid, &sp.bc, &sp.boundary, field, &mut state.bc);
    laplacian.mul_vec(field, &mut state.lap_s);

    let dt = settings.timestep;
    for k in 0..field.len() {
        state.res[k] = (2.0 * r * (state.lap_s[k] + state.bc[k]) + rate[k]) * dt;
    }

    let mut max_delta = 0.0;
    if settings.relax_stride > 1 {
        if iteration % settings.relax_stride != 0 {
            for k in 0..field.len() {
                state.residual_acc[k] += state.res[k];
            }
        } else {
            max_delta = peak_magnitude(&state.residual_acc);
            state.residual_acc.fill(0.0);
        }
    } else {
        max_delta = peak_magnitude(&state.res);
    }

    for k in 0..field.len() {
        field[k] += state.res[k];
    }
    clamp_field(sp, field)?;
    Ok(max_delta)
}

#[allow(clippy::too_many_arguments)]
fn step_implicit(
    grid: &Grid,
    laplacian: &SparseMatrix,
    settings: &StepperSettings,
    r: f64,
    sp: &Species,
    state: &mut SpeciesState,
    field: &mut [f64],
    rate: &[f64],
) -> Result<f64> {
    let dt = settings.timestep;
    let n = field.len();

    // Constant part of the boundary correction (actual face values, zero
    // field); the field-dependent part is folded into the system operator.
    state.res.fill(0.0);
    boundary_vector(grid, &sp.bc, &sp.boundary, &state.res, &mut state.bc);

    let mut rhs = vec![0.0; n];
    for k in 0..n {
        rhs[k] = field[k] + dt * (2.0 * r * state.bc[k] + rate[k]);
    }

    // A*x = x - 2r*dt*(L*x + B_lin(x)).
    let mut lap_x = vec![0.0; n];
    let mut bc_x = vec![0.0; n];
    let apply = |x: &[f64], out: &mut [f64]| {
        laplacian.mul_vec(x, &mut lap_x);
        boundary_linear_part(grid, &sp.bc, x, &mut bc_x);
        for k in 0..x.len() {
            out[k] = x[k] - 2.0 * r * dt * (lap_x[k] + bc_x[k]);
        }
    };
    let next = bicgstab(apply, &rhs, field, &settings.solver);

    let mut max_delta = 0.0f64;
    for k in 0..n {
        max_delta = max_delta.max((next[k] - field[k]).abs());
        field[k] = next[k];
    }
    clamp_field(sp, field)?;
    Ok(max_delta)
}

/// Clamps negatives within noise to the concentration floor; a value far
/// below zero aborts the run as solver divergence.
fn clamp_field(sp: &Species, field: &mut [f64]) -> Result<()> {
    for (k, v) in field.iter_mut().enumerate() {
        if *v < DIVERGENCE_THRESHOLD {
            bail!(
                "Concentration of species '{}' diverged to {:.3e} at cell {}.",
                sp.name,
                *v,
                k
            );
        }
        if *v < 0.0 {
            *v = CONCENTRATION_FLOOR;
        }
    }
    Ok(())
}

fn peak_magnitude(values: &[f64]) -> f64 {
    values.iter().fold(0.0, |acc: f64, v| acc.max(v.abs()))
}
