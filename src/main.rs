use anyhow::Result;
use log::{error, info, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::time::Instant;

use chemistry_engine::{
    integrate_particles, DiffusionSolver, EngineConfig, OdeCounters, ParticleState,
};

/// Per-macro-step statistics recorded for the output file.
#[derive(Debug, Clone, Serialize)]
struct StepStats {
    step: usize,
    sim_time: f64,
    diffusion_iterations: usize,
    diffusion_converged: bool,
    field_totals: Vec<f64>,
    mean_particle_species: Vec<f64>,
    ode_steps: u64,
    ode_iters: u64,
    ode_funcs: u64,
    ode_fails: u64,
}

fn main() -> Result<()> {
    env_logger::init();

    info!("Starting Chemistry Engine (CPU Parallel)...");

    let config_path =
        std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = EngineConfig::load(&config_path)?;

    info!("Using {} Rayon threads.", rayon::current_num_threads());

    // --- Initialize the diffusion engine ---
    let grid = config.get_grid()?;
    let species = config.get_species()?;
    let settings = config.get_stepper_settings()?;
    info!(
        "Grid: {}x{}x{} ({} cells, h = {:.4e}), {} species.",
        grid.nx,
        grid.ny,
        grid.nz,
        grid.ngrids(),
        grid.spacing(),
        species.len()
    );
    let mut solver = DiffusionSolver::new(grid.clone(), &species, settings)?;

    // Seed each field with the configured initial concentration, falling
    // back to the largest boundary value as the driving concentration.
    let mut fields: Vec<Vec<f64>> = species
        .iter()
        .map(|sp| {
            let seed = if sp.initial > 0.0 { sp.initial } else { sp.max_boundary().max(0.0) };
            vec![seed; grid.ngrids()]
        })
        .collect();
    let rates: Vec<Vec<f64>> = vec![vec![0.0; grid.ngrids()]; species.len()];

    // --- Initialize the kinetics engine ---
    let network = config.get_reaction_network()?;
    let method = config.get_ode_method()?;
    let pc = &config.particles;
    let mut rng = StdRng::seed_from_u64(pc.seed);
    let mut particles: Vec<ParticleState> = (0..pc.count)
        .map(|_| {
            let jitter = if pc.temperature_jitter > 0.0 {
                rng.random_range(-pc.temperature_jitter..=pc.temperature_jitter)
            } else {
                0.0
            };
            ParticleState {
                temperature: pc.temperature + jitter,
                species: pc.initial_species.clone(),
            }
        })
        .collect();
    info!(
        "Kinetics: {} particles, {} reactions over {} species.",
        particles.len(),
        network.nreactions(),
        network.nspecies()
    );

    // --- Macro-timestep loop ---
    let total_steps = config.timing.total_steps;
    let dt = config.timing.macro_timestep;
    let record_interval = config.output.record_interval.max(1);

    info!("Starting simulation loop for {} steps...", total_steps);
    let start_time = Instant::now();
    let mut previous_print_time = start_time;
    let mut stats: Vec<StepStats> = Vec::with_capacity(total_steps);
    let mut total_counters = OdeCounters::default();

    for step in 0..total_steps {
        let step_start_time = Instant::now();

        let report = solver.solve(&species, &mut fields, &rates)?;
        if !report.converged {
            warn!("Step {}: diffusion accepted unconverged after {} iterations.",
                step + 1, report.iterations);
        }

        let kinetics = integrate_particles(&network, &method, dt, &mut particles)?;
        total_counters.merge(&kinetics.counters);

        let step_duration = step_start_time.elapsed();

        let current_time = Instant::now();
        let should_print_status =
            current_time.duration_since(previous_print_time).as_secs_f64() >= 5.0;
        let is_record_step = (step + 1) % record_interval == 0;
        let is_last_step = step == total_steps - 1;

        if should_print_status || is_record_step || is_last_step {
            info!(
                "Step [{}/{}] ({:.2} s) | Diffusion iters: {} | ODE steps: {} | Step Time: {:6.2} ms | Elapsed: {:.2} s",
                step + 1,
                total_steps,
                (step + 1) as f64 * dt,
                report.iterations,
                kinetics.counters.steps,
                step_duration.as_secs_f64() * 1000.0,
                start_time.elapsed().as_secs_f64()
            );
            previous_print_time = current_time;
        } else {
            trace!(
                "Step [{}/{}] completed in {:.2} ms",
                step + 1,
                total_steps,
                step_duration.as_secs_f64() * 1000.0
            );
        }

        if is_record_step || is_last_step {
            let field_totals = fields.iter().map(|f| f.iter().sum()).collect();
            let mean_particle_species = mean_species(&particles, network.nspecies());
            stats.push(StepStats {
                step: step + 1,
                sim_time: (step + 1) as f64 * dt,
                diffusion_iterations: report.iterations,
                diffusion_converged: report.converged,
                field_totals,
                mean_particle_species,
                ode_steps: kinetics.counters.steps,
                ode_iters: kinetics.counters.iters,
                ode_funcs: kinetics.counters.funcs,
                ode_fails: kinetics.counters.fails,
            });
        }
    }

    let total_duration = start_time.elapsed();
    info!(
        "Simulation finished in {:.3} seconds. ODE totals: {} steps, {} attempts, {} evaluations, {} failures.",
        total_duration.as_secs_f64(),
        total_counters.steps,
        total_counters.iters,
        total_counters.funcs,
        total_counters.fails
    );

    // --- Save recorded data ---
    if config.output.save_stats {
        let filename = format!("{}_stats.json", config.output.base_filename);
        match File::create(&filename) {
            Ok(mut file) => match serde_json::to_string(&stats) {
                Ok(json_string) => {
                    if let Err(e) = file.write_all(json_string.as_bytes()) {
                        error!("Error writing stats JSON to file '{}': {}", filename, e);
                    } else {
                        info!("Step statistics saved to {}", filename);
                    }
                }
                Err(e) => error!("Error serializing stats to JSON: {}", e),
            },
            Err(e) => error!("Error creating stats file '{}': {}", filename, e),
        }
    } else {
        info!("Skipping saving stats as per config (save_stats is false).");
    }

    if config.output.save_fields {
        let filename = format!("{}_fields.csv", config.output.base_filename);
        match csv::Writer::from_path(&filename) {
            Ok(mut writer) => {
                let mut header = vec!["x".to_string(), "y".to_string(), "z".to_string()];
                header.extend(species.iter().map(|sp| sp.name.clone()));
                writer.write_record(&header)?;
                for l in 0..grid.nz {
                    for j in 0..grid.ny {
                        for i in 0..grid.nx {
                            let (x, y, z) = grid.cell_center(i, j, l);
                            let k = grid.cell_index(i, j, l);
                            let mut record = vec![
                                format!("{:.6}", x),
                                format!("{:.6}", y),
                                format!("{:.6}", z),
                            ];
                            record.extend(fields.iter().map(|f| format!("{:.6e}", f[k])));
                            writer.write_record(&record)?;
                        }
                    }
                }
                writer.flush()?;
                info!("Final concentration fields saved to {}", filename);
            }
            Err(e) => error!("Error saving CSV file '{}': {}", filename, e),
        }
    } else {
        info!("Skipping saving fields as per config.");
    }

    info!("Simulation Complete.");
    Ok(())
}

fn mean_species(particles: &[ParticleState], nspecies: usize) -> Vec<f64> {
    let mut means = vec![0.0; nspecies];
    if particles.is_empty() {
        return means;
    }
    for p in particles {
        for (m, v) in means.iter_mut().zip(&p.species) {
            *m += v;
        }
    }
    for m in &mut means {
        *m /= particles.len() as f64;
    }
    means
}
