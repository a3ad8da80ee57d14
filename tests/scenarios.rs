//! End-to-end scenarios exercising the diffusion and kinetics engines
//! together through their public interfaces.

use approx::assert_relative_eq;
use chemistry_engine::{
    integrate_particles, ArrheniusParams, BoundaryCode, DiffusionSolver, DomainBounds, Grid,
    OdeMethod, ParticleState, ReactionNetwork, Species, SpeciesKind, SolverSettings,
    StepScheme, StepperSettings, Stoichiometry,
};

fn unit_cube(n: usize) -> Grid {
    let bounds = DomainBounds { xlo: 0.0, xhi: 1.0, ylo: 0.0, yhi: 1.0, zlo: 0.0, zhi: 1.0 };
    Grid::new(bounds, n, n, n).unwrap()
}

fn supply_species() -> Species {
    // Fixed supply of 1.0 on the -x face, zero on +x, no flux through the
    // other faces.
    Species {
        name: "o2".into(),
        diffusion_coeff: 1.0,
        kind: SpeciesKind::Liquid,
        boundary: [1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        bc: [
            BoundaryCode::DirichletDirichlet,
            BoundaryCode::NeumannNeumann,
            BoundaryCode::NeumannNeumann,
        ],
        initial: 0.5,
    }
}

fn settings(scheme: StepScheme, timestep: f64) -> StepperSettings {
    StepperSettings {
        scheme,
        timestep,
        tolerance: 1e-6,
        relax_stride: 1,
        max_iterations: 500_000,
        solver: SolverSettings::default(),
    }
}

#[test]
fn gradient_across_fixed_supply_faces() {
    // 4x4x4 grid, D = 1, supply of 1.0 on -x, sink of 0.0 on +x, sealed
    // y/z faces: the converged field is a linear profile along x that is
    // uniform over every y/z face.
    let grid = unit_cube(4);
    let sp = vec![supply_species()];
    // h = 0.25, explicit stability requires dt <= h^2 / (6 D).
    let mut solver =
        DiffusionSolver::new(grid.clone(), &sp, settings(StepScheme::Explicit, 0.005)).unwrap();

    let mut fields = vec![vec![0.5; grid.ngrids()]];
    let rates = vec![vec![0.0; grid.ngrids()]];
    let report = solver.solve(&sp, &mut fields, &rates).unwrap();
    assert!(report.converged);

    // Mirrored-ghost Dirichlet faces place the boundary value half a cell
    // outside the first center, so the profile is 0.875, 0.625, 0.375, 0.125.
    let expected = [0.875, 0.625, 0.375, 0.125];
    for l in 0..4 {
        for j in 0..4 {
            for i in 0..4 {
                let v = fields[0][grid.cell_index(i, j, l)];
                assert_relative_eq!(v, expected[i], epsilon = 1e-3);
            }
        }
    }

    // Face uniformity along y and z.
    for i in 0..4 {
        let reference = fields[0][grid.cell_index(i, 0, 0)];
        for l in 0..4 {
            for j in 0..4 {
                assert_relative_eq!(
                    fields[0][grid.cell_index(i, j, l)],
                    reference,
                    epsilon = 1e-6
                );
            }
        }
    }
}

#[test]
fn explicit_and_implicit_gradient_agreement() {
    let grid = unit_cube(4);
    let sp = vec![supply_species()];
    let rates = vec![vec![0.0; grid.ngrids()]];

    let mut explicit =
        DiffusionSolver::new(grid.clone(), &sp, settings(StepScheme::Explicit, 0.005)).unwrap();
    let mut fields_exp = vec![vec![0.5; grid.ngrids()]];
    assert!(explicit.solve(&sp, &mut fields_exp, &rates).unwrap().converged);

    let mut implicit =
        DiffusionSolver::new(grid.clone(), &sp, settings(StepScheme::Implicit, 0.05)).unwrap();
    let mut fields_imp = vec![vec![0.5; grid.ngrids()]];
    assert!(implicit.solve(&sp, &mut fields_imp, &rates).unwrap().converged);

    for k in 0..grid.ngrids() {
        assert_relative_eq!(fields_exp[0][k], fields_imp[0][k], epsilon = 1e-3);
    }
}

#[test]
fn first_order_decay_over_ten_seconds() {
    // A -> B with k = 0.1/s, [A](0) = 1, [B](0) = 0, integrated over 10 s:
    // [A] must follow exp(-k t) within the configured relative tolerance.
    let network = ReactionNetwork::new(
        vec!["a".into(), "b".into()],
        vec![ArrheniusParams { a: 0.1, n: 0.0, ea: 0.0 }],
        Stoichiometry::Dense { exponents: vec![vec![1.0, 0.0]], net: vec![vec![-1.0, 1.0]] },
        1.0,
        1.0,
    )
    .unwrap();

    let rel_tol = 1e-6;
    let method =
        OdeMethod::Rkf45 { min_steps: 1, max_iters: 100, rel_tol, abs_tol: 1e-9 };
    let mut particles = vec![ParticleState { temperature: 298.0, species: vec![1.0, 0.0] }];

    let report = integrate_particles(&network, &method, 10.0, &mut particles).unwrap();
    assert_eq!(report.counters.fails, 0);

    let expected = (-0.1f64 * 10.0).exp();
    assert_relative_eq!(particles[0].species[0], expected, max_relative = 100.0 * rel_tol);
    assert_relative_eq!(
        particles[0].species[0] + particles[0].species[1],
        1.0,
        max_relative = 1e-8
    );
}

#[test]
fn rk4_and_rkf45_trajectories_agree() {
    // Same network integrated by both methods stays within the adaptive
    // scheme's error tolerance.
    let network = ReactionNetwork::new(
        vec!["a".into(), "b".into(), "c".into()],
        vec![
            ArrheniusParams { a: 0.3, n: 0.0, ea: 0.0 },
            ArrheniusParams { a: 0.05, n: 0.0, ea: 0.0 },
        ],
        Stoichiometry::Dense {
            exponents: vec![vec![1.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]],
            net: vec![vec![-1.0, -1.0, 1.0], vec![1.0, 1.0, -1.0]],
        },
        1.0,
        1.0,
    )
    .unwrap();

    let initial = vec![1.0, 0.8, 0.0];
    let mut fixed = vec![ParticleState { temperature: 300.0, species: initial.clone() }];
    let mut adaptive = vec![ParticleState { temperature: 300.0, species: initial }];

    integrate_particles(&network, &OdeMethod::Rk4 { steps: 2000 }, 5.0, &mut fixed).unwrap();
    integrate_particles(
        &network,
        &OdeMethod::Rkf45 { min_steps: 1, max_iters: 500, rel_tol: 1e-9, abs_tol: 1e-12 },
        5.0,
        &mut adaptive,
    )
    .unwrap();

    for i in 0..3 {
        assert_relative_eq!(
            fixed[0].species[i],
            adaptive[0].species[i],
            epsilon = 1e-6
        );
    }
}

#[test]
fn diffusion_consumes_external_rate_field() {
    // A uniform sink lowers the steady state below the pure-diffusion
    // profile everywhere while staying non-negative.
    let grid = unit_cube(4);
    let sp = vec![supply_species()];
    let mut solver =
        DiffusionSolver::new(grid.clone(), &sp, settings(StepScheme::Explicit, 0.005)).unwrap();

    let mut baseline = vec![vec![0.5; grid.ngrids()]];
    let zero = vec![vec![0.0; grid.ngrids()]];
    solver.solve(&sp, &mut baseline, &zero).unwrap();

    let mut consumed = vec![vec![0.5; grid.ngrids()]];
    let sink = vec![vec![-0.5; grid.ngrids()]];
    let mut solver2 =
        DiffusionSolver::new(grid.clone(), &sp, settings(StepScheme::Explicit, 0.005)).unwrap();
    let report = solver2.solve(&sp, &mut consumed, &sink).unwrap();
    assert!(report.converged);

    for k in 0..grid.ngrids() {
        assert!(consumed[0][k] <= baseline[0][k] + 1e-9);
        assert!(consumed[0][k] >= 0.0);
    }
}
