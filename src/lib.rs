//! Diffusion-reaction engine for chemical species over a structured grid,
//! plus per-particle reaction-network kinetics.
//!
//! The diffusion side advances concentration fields to a quasi-steady state
//! with an explicit or implicit finite-difference stepper driven by a
//! convergence controller. The kinetics side integrates each particle's
//! species vector over a macro-timestep with fixed-step RK4 or adaptive
//! RKF45, in parallel across particles.

pub mod boundary;
pub mod config;
pub mod diffusion;
pub mod grid;
pub mod kinetics;
pub mod laplacian;
pub mod ode;
pub mod solver;

pub use config::EngineConfig;
pub use diffusion::{DiffusionSolver, SolveReport, StepScheme, StepperSettings};
pub use grid::{BoundaryCode, DomainBounds, Grid, Species, SpeciesKind};
pub use kinetics::{
    integrate_particles, ArrheniusParams, KineticsReport, ParticleState, ReactionNetwork,
    Stoichiometry,
};
pub use laplacian::{build_laplacian, SparseMatrix};
pub use ode::{OdeCounters, OdeMethod};
pub use solver::SolverSettings;
