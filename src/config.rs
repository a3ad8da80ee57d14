use crate::diffusion::{StepScheme, StepperSettings};
use crate::grid::{BoundaryCode, DomainBounds, Grid, Species, SpeciesKind};
use crate::kinetics::{ArrheniusParams, ReactionNetwork, Stoichiometry};
use crate::ode::OdeMethod;
use crate::solver::SolverSettings;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

// Domain bounds and grid resolution.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DomainConfig {
    pub xlo: f64,
    pub xhi: f64,
    pub ylo: f64,
    pub yhi: f64,
    pub zlo: f64,
    pub zhi: f64,
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
}

// One chemical species and its boundary treatment, loaded from config.toml.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SpeciesConfig {
    pub name: String,
    pub diffusion_coeff: f64,
    #[serde(default = "default_species_kind")]
    pub kind: SpeciesKind,
    /// Two-letter boundary code per axis: x, y, z.
    pub bc: [String; 3],
    /// Face values in the order [-x, +x, -y, +y, -z, +z].
    pub boundary: [f64; 6],
    #[serde(default)]
    pub initial: f64,
}

fn default_species_kind() -> SpeciesKind {
    SpeciesKind::Liquid
}

// Quasi-steady diffusion solve settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DiffusionConfig {
    /// "explicit" or "implicit".
    pub scheme: String,
    pub timestep: f64,
    pub tolerance: f64,
    #[serde(default = "default_relax_stride")]
    pub relax_stride: usize,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_solver_max_iterations")]
    pub solver_max_iterations: usize,
    #[serde(default = "default_solver_rel_tolerance")]
    pub solver_rel_tolerance: f64,
    #[serde(default = "default_solver_abs_tolerance")]
    pub solver_abs_tolerance: f64,
}

fn default_relax_stride() -> usize {
    1
}

fn default_max_iterations() -> usize {
    500_000
}

fn default_solver_max_iterations() -> usize {
    2000
}

fn default_solver_rel_tolerance() -> f64 {
    1e-9
}

fn default_solver_abs_tolerance() -> f64 {
    1e-12
}

// One reaction: Arrhenius parameters plus per-species stoichiometry rows.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ReactionConfig {
    pub a: f64,
    pub n: f64,
    pub ea: f64,
    /// Reactant exponents entering the rate law, one entry per species.
    pub exponents: Vec<f64>,
    /// Net production coefficients, one entry per species.
    pub net: Vec<f64>,
}

// Per-particle reaction kinetics settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct KineticsConfig {
    /// "rk4" or "rkf45".
    pub integrator: String,
    #[serde(default = "default_rk4_steps")]
    pub rk4_steps: usize,
    #[serde(default = "default_min_steps")]
    pub min_steps: usize,
    #[serde(default = "default_max_iters")]
    pub max_iters: usize,
    #[serde(default = "default_rel_tol")]
    pub rel_tol: f64,
    #[serde(default = "default_abs_tol")]
    pub abs_tol: f64,
    #[serde(default = "default_volume_factor")]
    pub volume_factor: f64,
    #[serde(default = "default_boltz")]
    pub boltz: f64,
    /// Prefer the sparse stoichiometry representation.
    #[serde(default)]
    pub sparse: bool,
    pub reactions: Vec<ReactionConfig>,
}

fn default_rk4_steps() -> usize {
    100
}

fn default_min_steps() -> usize {
    1
}

fn default_max_iters() -> usize {
    100
}

fn default_rel_tol() -> f64 {
    1e-6
}

fn default_abs_tol() -> f64 {
    1e-8
}

fn default_volume_factor() -> f64 {
    1.0
}

fn default_boltz() -> f64 {
    // kcal/(mol K), matching activation energies given in kcal/mol.
    0.0019872067
}

// Initial particle population.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ParticlesConfig {
    pub count: usize,
    pub temperature: f64,
    /// Uniform jitter half-width applied around `temperature`.
    #[serde(default)]
    pub temperature_jitter: f64,
    pub seed: u64,
    /// Initial per-species amounts, one entry per species in reaction order.
    pub initial_species: Vec<f64>,
}

// Macro-timestep loop settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TimingConfig {
    pub macro_timestep: f64,
    pub total_steps: usize,
}

// Output settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OutputConfig {
    pub base_filename: String,
    pub save_fields: bool,
    pub save_stats: bool,
    #[serde(default = "default_record_interval")]
    pub record_interval: usize,
}

fn default_record_interval() -> usize {
    1
}

// Main configuration structure, loaded from config.toml.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EngineConfig {
    pub domain: DomainConfig,
    pub diffusion: DiffusionConfig,
    pub species: Vec<SpeciesConfig>,
    pub kinetics: KineticsConfig,
    pub particles: ParticlesConfig,
    pub timing: TimingConfig,
    pub output: OutputConfig,
}

impl EngineConfig {
    /// Loads the engine configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        let config_str = std::fs::read_to_string(path_ref).map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path_ref.display(), e)
        })?;
        let config: EngineConfig = toml::from_str(&config_str).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from '{}': {}", path_ref.display(), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.species.is_empty() {
            bail!("At least one species must be configured.");
        }
        if self.diffusion.timestep <= 0.0 {
            bail!("diffusion.timestep must be positive.");
        }
        if self.diffusion.tolerance <= 0.0 {
            bail!("diffusion.tolerance must be positive.");
        }
        if self.timing.macro_timestep <= 0.0 {
            bail!("timing.macro_timestep must be positive.");
        }
        if self.kinetics.reactions.is_empty() {
            bail!("kinetics.reactions must not be empty.");
        }
        let nspecies = self.kinetics.reactions[0].exponents.len();
        if self.particles.initial_species.len() != nspecies {
            bail!(
                "particles.initial_species has {} entries, reactions cover {} species.",
                self.particles.initial_species.len(),
                nspecies
            );
        }
        Ok(())
    }

    /// Builds the structured grid from the domain section.
    pub fn get_grid(&self) -> Result<Grid> {
        let d = &self.domain;
        let bounds = DomainBounds {
            xlo: d.xlo,
            xhi: d.xhi,
            ylo: d.ylo,
            yhi: d.yhi,
            zlo: d.zlo,
            zhi: d.zhi,
        };
        Grid::new(bounds, d.nx, d.ny, d.nz)
    }

    /// Converts the species section into the runtime metadata, parsing the
    /// boundary-condition codes.
    pub fn get_species(&self) -> Result<Vec<Species>> {
        self.species
            .iter()
            .map(|sc| {
                let bc = [
                    BoundaryCode::parse(&sc.bc[0])?,
                    BoundaryCode::parse(&sc.bc[1])?,
                    BoundaryCode::parse(&sc.bc[2])?,
                ];
                Ok(Species {
                    name: sc.name.clone(),
                    diffusion_coeff: sc.diffusion_coeff,
                    kind: sc.kind,
                    boundary: sc.boundary,
                    bc,
                    initial: sc.initial,
                })
            })
            .collect()
    }

    /// Converts the diffusion section into stepper settings.
    pub fn get_stepper_settings(&self) -> Result<StepperSettings> {
        let scheme = match self.diffusion.scheme.as_str() {
            "explicit" => StepScheme::Explicit,
            "implicit" => StepScheme::Implicit,
            other => bail!("Unknown diffusion scheme '{}' (expected explicit/implicit).", other),
        };
        Ok(StepperSettings {
            scheme,
            timestep: self.diffusion.timestep,
            tolerance: self.diffusion.tolerance,
            relax_stride: self.diffusion.relax_stride,
            max_iterations: self.diffusion.max_iterations,
            solver: SolverSettings {
                max_iterations: self.diffusion.solver_max_iterations,
                rel_tolerance: self.diffusion.solver_rel_tolerance,
                abs_tolerance: self.diffusion.solver_abs_tolerance,
            },
        })
    }

    /// Converts the kinetics section into the ODE method selector.
    pub fn get_ode_method(&self) -> Result<OdeMethod> {
        match self.kinetics.integrator.as_str() {
            "rk4" => Ok(OdeMethod::Rk4 { steps: self.kinetics.rk4_steps }),
            "rkf45" => Ok(OdeMethod::Rkf45 {
                min_steps: self.kinetics.min_steps,
                max_iters: self.kinetics.max_iters,
                rel_tol: self.kinetics.rel_tol,
                abs_tol: self.kinetics.abs_tol,
            }),
            other => bail!("Unknown integrator '{}' (expected rk4/rkf45).", other),
        }
    }

    /// Builds the shared reaction network from the kinetics section. The
    /// particle species vector length follows the stoichiometry row width.
    pub fn get_reaction_network(&self) -> Result<ReactionNetwork> {
        let k = &self.kinetics;
        let nspecies = k.reactions[0].exponents.len();
        let names = (0..nspecies).map(|i| format!("y{}", i)).collect();

        let mut arrhenius = Vec::with_capacity(k.reactions.len());
        let mut exponents = Vec::with_capacity(k.reactions.len());
        let mut net = Vec::with_capacity(k.reactions.len());
        for r in &k.reactions {
            arrhenius.push(ArrheniusParams { a: r.a, n: r.n, ea: r.ea });
            exponents.push(r.exponents.clone());
            net.push(r.net.clone());
        }

        let stoich = if k.sparse {
            Stoichiometry::sparsify(&exponents, &net)
        } else {
            Stoichiometry::Dense { exponents, net }
        };
        ReactionNetwork::new(names, arrhenius, stoich, k.volume_factor, k.boltz)
    }
}
