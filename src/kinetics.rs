use crate::ode::{integrate, OdeCounters, OdeMethod, ZERO_TOLERANCE};
use anyhow::{bail, Context, Result};
use log::{debug, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Arrhenius parameters of one reaction: `k(T) = A * T^n * exp(-Ea/(kB*T))`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ArrheniusParams {
    /// Pre-exponential factor.
    pub a: f64,
    /// Temperature exponent.
    pub n: f64,
    /// Activation energy, in units consistent with the configured Boltzmann
    /// constant.
    pub ea: f64,
}

impl ArrheniusParams {
    /// Forward rate constant at temperature `theta`.
    #[inline]
    pub fn rate_constant(&self, theta: f64, boltz: f64) -> f64 {
        self.a * theta.powf(self.n) * (-self.ea / (boltz * theta)).exp()
    }
}

/// One sparse stoichiometry term: species index plus coefficient.
#[derive(Debug, Clone, Copy)]
pub struct StoichTerm {
    species: usize,
    coeff: f64,
}

/// Sparse representation of one reaction: reactant exponents for the rate
/// law, the net coefficients for the species balance, and whether every
/// reactant exponent is integral (enabling the integer-power fast path).
#[derive(Debug, Clone)]
pub struct SparseReaction {
    reactants: Vec<StoichTerm>,
    net: Vec<StoichTerm>,
    integral: bool,
}

/// Stoichiometry storage, selected at network construction time.
///
/// The dense form keeps full `reaction x species` tables and suits small
/// networks; the sparse form keeps index/coefficient lists per reaction and
/// wins when most coefficients are zero.
#[derive(Debug, Clone)]
pub enum Stoichiometry {
    Dense {
        /// Reactant exponents entering the rate law, `[reaction][species]`.
        exponents: Vec<Vec<f64>>,
        /// Net production coefficients (products minus reactants).
        net: Vec<Vec<f64>>,
    },
    Sparse {
        reactions: Vec<SparseReaction>,
    },
}

impl Stoichiometry {
    /// Converts dense tables to the sparse per-reaction representation.
    pub fn sparsify(exponents: &[Vec<f64>], net: &[Vec<f64>]) -> Self {
        let reactions = exponents
            .iter()
            .zip(net)
            .map(|(exp_row, net_row)| {
                let reactants: Vec<StoichTerm> = exp_row
                    .iter()
                    .enumerate()
                    .filter(|(_, &e)| e != 0.0)
                    .map(|(species, &coeff)| StoichTerm { species, coeff })
                    .collect();
                let net: Vec<StoichTerm> = net_row
                    .iter()
                    .enumerate()
                    .filter(|(_, &c)| c != 0.0)
                    .map(|(species, &coeff)| StoichTerm { species, coeff })
                    .collect();
                let integral = reactants.iter().all(|t| t.coeff.fract() == 0.0);
                SparseReaction { reactants, net, integral }
            })
            .collect();
        Stoichiometry::Sparse { reactions }
    }

    fn nreactions(&self) -> usize {
        match self {
            Stoichiometry::Dense { exponents, .. } => exponents.len(),
            Stoichiometry::Sparse { reactions } => reactions.len(),
        }
    }
}

/// Integer power by repeated squaring; the hot path for integral
/// stoichiometric exponents.
#[inline]
fn powint(base: f64, exponent: i64) -> f64 {
    let mut result = 1.0;
    let mut b = if exponent < 0 { 1.0 / base } else { base };
    let mut e = exponent.unsigned_abs();
    while e > 0 {
        if e & 1 == 1 {
            result *= b;
        }
        b *= b;
        e >>= 1;
    }
    result
}

/// Shared, read-only reaction network: Arrhenius tables plus stoichiometry.
/// Rebuilt only when the reaction definition changes; every per-particle
/// integration in a macro-timestep reads the same instance.
#[derive(Debug, Clone)]
pub struct ReactionNetwork {
    species_names: Vec<String>,
    arrhenius: Vec<ArrheniusParams>,
    stoich: Stoichiometry,
    /// Volume conversion between stored amounts and concentrations: the rate
    /// law sees `y / volume_factor`, the balance is scaled back by it.
    volume_factor: f64,
    /// Boltzmann (or gas) constant in the unit system of `ea` and `theta`.
    boltz: f64,
}

impl ReactionNetwork {
    pub fn new(
        species_names: Vec<String>,
        arrhenius: Vec<ArrheniusParams>,
        stoich: Stoichiometry,
        volume_factor: f64,
        boltz: f64,
    ) -> Result<Self> {
        let nspecies = species_names.len();
        if nspecies == 0 {
            bail!("Reaction network has no species.");
        }
        if arrhenius.is_empty() {
            bail!("Reaction network has no rate parameters.");
        }
        if stoich.nreactions() != arrhenius.len() {
            bail!(
                "Stoichiometry covers {} reactions but {} rate parameter sets were given.",
                stoich.nreactions(),
                arrhenius.len()
            );
        }
        match &stoich {
            Stoichiometry::Dense { exponents, net } => {
                if net.len() != exponents.len() {
                    bail!("Reactant and net stoichiometry tables disagree on reaction count.");
                }
                for row in exponents.iter().chain(net.iter()) {
                    if row.len() != nspecies {
                        bail!(
                            "Stoichiometry row covers {} species, expected {}.",
                            row.len(),
                            nspecies
                        );
                    }
                }
            }
            Stoichiometry::Sparse { reactions } => {
                for r in reactions {
                    for t in r.reactants.iter().chain(r.net.iter()) {
                        if t.species >= nspecies {
                            bail!(
                                "Stoichiometry references species index {} of {}.",
                                t.species,
                                nspecies
                            );
                        }
                    }
                }
            }
        }
        if boltz <= 0.0 {
            bail!("Boltzmann constant must be positive.");
        }
        if volume_factor <= 0.0 {
            bail!("Volume factor must be positive.");
        }
        debug!(
            "Reaction network: {} species, {} reactions, volume factor {}.",
            nspecies,
            arrhenius.len(),
            volume_factor
        );
        Ok(Self { species_names, arrhenius, stoich, volume_factor, boltz })
    }

    pub fn nspecies(&self) -> usize {
        self.species_names.len()
    }

    pub fn nreactions(&self) -> usize {
        self.arrhenius.len()
    }

    pub fn species_names(&self) -> &[String] {
        &self.species_names
    }

    /// Fills `k_for` with the forward rate constant of every reaction at
    /// temperature `theta`.
    pub fn rate_constants(&self, theta: f64, k_for: &mut [f64]) {
        debug_assert_eq!(k_for.len(), self.nreactions());
        for (k, p) in k_for.iter_mut().zip(&self.arrhenius) {
            *k = p.rate_constant(theta, self.boltz);
        }
    }

    /// Species balance `dy/dt` from the current amounts and the precomputed
    /// rate constants. The rate law exponentiates concentrations
    /// `y / volume_factor`; the balance is scaled back by the same factor.
    /// `rates` is per-reaction scratch.
    pub fn rhs(&self, k_for: &[f64], y: &[f64], rates: &mut [f64], dy: &mut [f64]) {
        debug_assert_eq!(y.len(), self.nspecies());
        debug_assert_eq!(dy.len(), self.nspecies());
        debug_assert_eq!(rates.len(), self.nreactions());
        dy.fill(0.0);
        let inv_v = 1.0 / self.volume_factor;

        match &self.stoich {
            Stoichiometry::Dense { exponents, net } => {
                for (j, exp_row) in exponents.iter().enumerate() {
                    let mut rate = k_for[j];
                    for (i, &e) in exp_row.iter().enumerate() {
                        if e != 0.0 {
                            rate *= (y[i] * inv_v).powf(e);
                        }
                    }
                    rates[j] = rate;
                }
                for (j, net_row) in net.iter().enumerate() {
                    let scaled = rates[j] * self.volume_factor;
                    for (i, &c) in net_row.iter().enumerate() {
                        dy[i] += c * scaled;
                    }
                }
            }
            Stoichiometry::Sparse { reactions } => {
                for (j, r) in reactions.iter().enumerate() {
                    let mut rate = k_for[j];
                    if r.integral {
                        for t in &r.reactants {
                            rate *= powint(y[t.species] * inv_v, t.coeff as i64);
                        }
                    } else {
                        for t in &r.reactants {
                            rate *= (y[t.species] * inv_v).powf(t.coeff);
                        }
                    }
                    rates[j] = rate;
                }
                for (j, r) in reactions.iter().enumerate() {
                    let scaled = rates[j] * self.volume_factor;
                    for t in &r.net {
                        dy[t.species] += t.coeff * scaled;
                    }
                }
            }
        }
    }
}

/// Per-particle kinetics state: local temperature plus the species vector
/// the integrator advances in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticleState {
    pub temperature: f64,
    pub species: Vec<f64>,
}

/// Outcome of one macro-timestep of kinetics over the particle population.
#[derive(Debug, Clone, Copy, Default)]
pub struct KineticsReport {
    pub counters: OdeCounters,
}

/// Advances every particle's species vector over one macro-timestep.
///
/// Particles are independent, so integration runs in parallel with the
/// network tables shared read-only. A particle whose adaptive integration
/// fails keeps its pre-step species vector and increments the failure
/// counter; a species driven below the noise threshold of zero aborts the
/// run as a diverging network.
pub fn integrate_particles(
    network: &ReactionNetwork,
    method: &OdeMethod,
    t_stop: f64,
    particles: &mut [ParticleState],
) -> Result<KineticsReport> {
    if t_stop <= 0.0 {
        bail!("Kinetics timestep must be positive.");
    }

    let counters = particles
        .par_iter_mut()
        .map(|particle| -> Result<OdeCounters> {
            if particle.species.len() != network.nspecies() {
                bail!(
                    "Particle carries {} species, network defines {}.",
                    particle.species.len(),
                    network.nspecies()
                );
            }

            let mut counters = OdeCounters::default();
            let mut k_for = vec![0.0; network.nreactions()];
            network.rate_constants(particle.temperature, &mut k_for);

            let mut rates = vec![0.0; network.nreactions()];
            let rhs = |y: &[f64], dy: &mut [f64]| {
                network.rhs(&k_for, y, &mut rates, dy);
            };

            let before = particle.species.clone();
            if let Err(err) = integrate(method, t_stop, &mut particle.species, rhs, &mut counters)
            {
                warn!("Kinetics integration failed for a particle: {err:#}");
                particle.species.copy_from_slice(&before);
                return Ok(counters);
            }

            for (i, value) in particle.species.iter_mut().enumerate() {
                if *value < -ZERO_TOLERANCE {
                    bail!(
                        "Species '{}' integrated to {:.3e}; the reaction network diverged.",
                        network.species_names()[i],
                        *value
                    );
                }
                if value.abs() < ZERO_TOLERANCE {
                    *value = 0.0;
                }
            }
            Ok(counters)
        })
        .try_reduce(OdeCounters::default, |mut acc, c| {
            acc.merge(&c);
            Ok(acc)
        })
        .context("Chemical kinetics step failed.")?;

    if counters.fails > 0 {
        warn!(
            "{} particle integration(s) failed this step; their species were left unchanged.",
            counters.fails
        );
    }
    Ok(KineticsReport { counters })
}
