use anyhow::{bail, Result};

/// Values within ten machine epsilons of zero are treated as zero when
/// post-processing integration results.
pub const ZERO_TOLERANCE: f64 = 10.0 * f64::EPSILON;

/// Time integration method for the per-particle kinetics ODE systems.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OdeMethod {
    /// Classic fourth-order Runge-Kutta with a fixed number of steps.
    Rk4 { steps: usize },
    /// Runge-Kutta-Fehlberg 4(5) with adaptive step-size control.
    Rkf45 { min_steps: usize, max_iters: usize, rel_tol: f64, abs_tol: f64 },
}

impl Default for OdeMethod {
    fn default() -> Self {
        OdeMethod::Rkf45 { min_steps: 1, max_iters: 100, rel_tol: 1e-6, abs_tol: 1e-8 }
    }
}

/// Work counters accumulated across integrations, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OdeCounters {
    /// Accepted steps.
    pub steps: u64,
    /// Attempted steps, including rejected ones.
    pub iters: u64,
    /// Right-hand-side evaluations.
    pub funcs: u64,
    /// Integrations that ran out of step attempts before reaching the end.
    pub fails: u64,
}

impl OdeCounters {
    pub fn merge(&mut self, other: &OdeCounters) {
        self.steps += other.steps;
        self.iters += other.iters;
        self.funcs += other.funcs;
        self.fails += other.fails;
    }
}

/// Advances `y` from `t = 0` to `t = t_stop` with fixed-step RK4.
///
/// `rhs(y, dy)` evaluates the derivative; scratch buffers are allocated once
/// per call and reused across steps.
pub fn rk4<F>(t_stop: f64, steps: usize, y: &mut [f64], mut rhs: F, counters: &mut OdeCounters)
where
    F: FnMut(&[f64], &mut [f64]),
{
    let n = y.len();
    let h = t_stop / steps as f64;

    let mut k1 = vec![0.0; n];
    let mut k2 = vec![0.0; n];
    let mut k3 = vec![0.0; n];
    let mut k4 = vec![0.0; n];
    let mut yp = vec![0.0; n];

    for _ in 0..steps {
        rhs(y, &mut k1);

        for i in 0..n {
            yp[i] = y[i] + 0.5 * h * k1[i];
        }
        rhs(&yp, &mut k2);

        for i in 0..n {
            yp[i] = y[i] + 0.5 * h * k2[i];
        }
        rhs(&yp, &mut k3);

        for i in 0..n {
            yp[i] = y[i] + h * k3[i];
        }
        rhs(&yp, &mut k4);

        for i in 0..n {
            y[i] += h / 6.0 * (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]);
        }

        counters.steps += 1;
        counters.iters += 1;
        counters.funcs += 4;
    }
}

// Fehlberg 4(5) tableau, in the incremental form that reuses each stage
// combination directly.
const C21: f64 = 0.25;
const C31: f64 = 0.09375;
const C32: f64 = 0.28125;
const C41: f64 = 0.879_380_974_055_53;
const C42: f64 = -3.277_196_176_604_5;
const C43: f64 = 3.320_892_125_625_8;
const C51: f64 = 2.032_407_407_407_4;
const C52: f64 = -8.0;
const C53: f64 = 7.173_489_278_752_4;
const C54: f64 = -0.205_896_686_159_84;
const C61: f64 = -0.296_296_296_296_3;
const C62: f64 = 2.0;
const C63: f64 = -1.381_676_413_255_4;
const C64: f64 = 0.452_972_709_551_66;
const C65: f64 = -0.275;

// Fourth-order solution weights.
const A1: f64 = 0.115_740_740_740_74;
const A3: f64 = 0.548_927_875_243_66;
const A4: f64 = 0.535_331_384_015_6;
const A5: f64 = -0.2;

// Fifth-order weights, used only through the embedded error estimate.
const B1: f64 = 0.118_518_518_518_52;
const B3: f64 = 0.518_986_354_775_83;
const B4: f64 = 0.506_131_490_342_01;
const B5: f64 = -0.18;
const B6: f64 = 0.036_363_636_363_636;

/// Step-size safety factor `(1/2)^(1/4)` for the fourth-order error control.
const H_SAFE: f64 = 0.840_896_415;
/// Step growth/shrink is limited to this factor per attempt.
const ADAPTION_LIMIT: f64 = 4.0;

/// Scratch space for one RKF45 integration, sized once per system.
struct Rkf45Scratch {
    f1: Vec<f64>,
    f2: Vec<f64>,
    f3: Vec<f64>,
    f4: Vec<f64>,
    f5: Vec<f64>,
    f6: Vec<f64>,
    yp: Vec<f64>,
}

impl Rkf45Scratch {
    fn new(n: usize) -> Self {
        Self {
            f1: vec![0.0; n],
            f2: vec![0.0; n],
            f3: vec![0.0; n],
            f4: vec![0.0; n],
            f5: vec![0.0; n],
            f6: vec![0.0; n],
            yp: vec![0.0; n],
        }
    }
}

/// One Fehlberg 4(5) trial step of size `h` from `y`, writing the
/// fourth-order result to `y_out` and the per-component embedded error
/// estimate to `err`. Six derivative evaluations.
fn rkf45_step<F>(
    h: f64,
    y: &[f64],
    y_out: &mut [f64],
    err: &mut [f64],
    s: &mut Rkf45Scratch,
    rhs: &mut F,
) where
    F: FnMut(&[f64], &mut [f64]),
{
    let n = y.len();

    rhs(y, &mut s.f1);
    for i in 0..n {
        s.yp[i] = y[i] + h * C21 * s.f1[i];
    }

    rhs(&s.yp, &mut s.f2);
    for i in 0..n {
        s.yp[i] = y[i] + h * (C31 * s.f1[i] + C32 * s.f2[i]);
    }

    rhs(&s.yp, &mut s.f3);
    for i in 0..n {
        s.yp[i] = y[i] + h * (C41 * s.f1[i] + C42 * s.f2[i] + C43 * s.f3[i]);
    }

    rhs(&s.yp, &mut s.f4);
    for i in 0..n {
        s.yp[i] =
            y[i] + h * (C51 * s.f1[i] + C52 * s.f2[i] + C53 * s.f3[i] + C54 * s.f4[i]);
    }

    rhs(&s.yp, &mut s.f5);
    for i in 0..n {
        s.yp[i] = y[i]
            + h * (C61 * s.f1[i]
                + C62 * s.f2[i]
                + C63 * s.f3[i]
                + C64 * s.f4[i]
                + C65 * s.f5[i]);
    }

    rhs(&s.yp, &mut s.f6);
    for i in 0..n {
        y_out[i] =
            y[i] + h * (A1 * s.f1[i] + A3 * s.f3[i] + A4 * s.f4[i] + A5 * s.f5[i]);
        let y5 = y[i]
            + h * (B1 * s.f1[i]
                + B3 * s.f3[i]
                + B4 * s.f4[i]
                + B5 * s.f5[i]
                + B6 * s.f6[i]);
        err[i] = (y_out[i] - y5).abs();
    }
}

/// Estimates a starting step size from the scaled derivative norms, following
/// the standard weighted-RMS heuristic. At most ten trial evaluations.
#[allow(clippy::too_many_arguments)]
fn rkf45_h0<F>(
    t_stop: f64,
    h_max: f64,
    h_min: f64,
    rel_tol: f64,
    abs_tol: f64,
    y: &[f64],
    s: &mut Rkf45Scratch,
    rhs: &mut F,
    counters: &mut OdeCounters,
) -> f64
where
    F: FnMut(&[f64], &mut [f64]),
{
    let n = y.len();
    let lower = h_min.max(t_stop * f64::EPSILON);
    let upper = h_max.min(t_stop);

    let mut hg = (lower * upper).sqrt();
    if upper < lower {
        return hg;
    }

    rhs(y, &mut s.f1);
    counters.funcs += 1;

    let mut hnew = hg;
    for _ in 0..10 {
        // Euler trial step, then a second-difference estimate
        // of y'' in the weighted-RMS norm.
        for i in 0..n {
            s.yp[i] = y[i] + hg * s.f1[i];
        }
        rhs(&s.yp, &mut s.f2);
        counters.funcs += 1;

        let mut yddnrm = 0.0;
        for i in 0..n {
            let wt = rel_tol * y[i].abs() + abs_tol;
            let ydd = (s.f2[i] - s.f1[i]) / hg;
            yddnrm += (ydd / wt) * (ydd / wt);
        }
        yddnrm = (yddnrm / n as f64).sqrt();

        hnew = if yddnrm * upper * upper > 2.0 {
            (2.0 / yddnrm).sqrt()
        } else {
            (hg * upper).sqrt()
        };

        if (hnew / hg - 1.0).abs() <= 0.1 {
            break;
        }
        if hnew > 2.0 * hg || hnew < 0.5 * hg {
            hnew = hg;
            break;
        }
        hg = hnew;
    }

    0.5 * hnew.clamp(lower, upper)
}

/// Integrates `y` over `[0, t_stop]` with adaptive RKF45.
///
/// Fails when the attempt budget runs out before reaching `t_stop`; the
/// caller decides how to recover. A step already at the minimum size is
/// taken regardless of its error estimate, trading accuracy for progress.
pub fn rkf45<F>(
    t_stop: f64,
    min_steps: usize,
    max_iters: usize,
    rel_tol: f64,
    abs_tol: f64,
    y: &mut [f64],
    mut rhs: F,
    counters: &mut OdeCounters,
) -> Result<()>
where
    F: FnMut(&[f64], &mut [f64]),
{
    let n = y.len();
    let h_max = t_stop / min_steps.max(1) as f64;
    let h_min = 100.0 * t_stop * f64::EPSILON;

    let mut scratch = Rkf45Scratch::new(n);
    let mut y_out = vec![0.0; n];
    let mut err = vec![0.0; n];

    // Endpoint tolerance: a landing within one rounding error of t_stop
    // counts as finished rather than spawning a sliver step.
    let tround = t_stop * f64::EPSILON;
    let mut t = 0.0;
    let mut h = rkf45_h0(
        t_stop, h_max, h_min, rel_tol, abs_tol, y, &mut scratch, &mut rhs, counters,
    );
    let mut iters = 0usize;

    while t + tround < t_stop {
        // Stretch the final step slightly rather than taking a sliver.
        if t + 1.05 * h >= t_stop {
            h = t_stop - t;
        }

        rkf45_step(h, y, &mut y_out, &mut err, &mut scratch, &mut rhs);
        counters.iters += 1;
        counters.funcs += 6;
        iters += 1;

        // Weighted RMS of the embedded error estimate.
        let mut err2 = 0.0;
        for i in 0..n {
            let wt = rel_tol * y[i].abs() + abs_tol;
            err2 += (err[i] / wt) * (err[i] / wt);
        }
        let rms_err = (err2 / n as f64).sqrt();

        // A step already at the minimum size is taken regardless of the
        // estimate; the controller cannot shrink it further.
        if rms_err <= 1.0 || h <= h_min {
            t += h;
            y.copy_from_slice(&y_out);
            counters.steps += 1;
        }

        // Fourth-order controller with bounded adaption.
        let mut hfac = if rms_err > 0.0 {
            H_SAFE * rms_err.powf(-0.25)
        } else {
            ADAPTION_LIMIT
        };
        hfac = hfac.clamp(1.0 / ADAPTION_LIMIT, ADAPTION_LIMIT);
        h = (h * hfac).min(h_max).max(h_min);

        if t + tround < t_stop && iters >= max_iters {
            counters.fails += 1;
            bail!("Adaptive integration exceeded {} step attempts.", max_iters);
        }
    }

    Ok(())
}

/// Integrates `y` over `[0, t_stop]` with the configured method.
pub fn integrate<F>(
    method: &OdeMethod,
    t_stop: f64,
    y: &mut [f64],
    rhs: F,
    counters: &mut OdeCounters,
) -> Result<()>
where
    F: FnMut(&[f64], &mut [f64]),
{
    match *method {
        OdeMethod::Rk4 { steps } => {
            if steps == 0 {
                bail!("Fixed-step integration needs at least one step.");
            }
            rk4(t_stop, steps, y, rhs, counters);
            Ok(())
        }
        OdeMethod::Rkf45 { min_steps, max_iters, rel_tol, abs_tol } => {
            rkf45(t_stop, min_steps, max_iters, rel_tol, abs_tol, y, rhs, counters)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rk4_exponential_decay() {
        // y' = -k*y, y(0) = 1 => y(t) = exp(-k*t).
        let k = 0.5;
        let mut y = vec![1.0];
        let mut counters = OdeCounters::default();
        rk4(2.0, 100, &mut y, |y, dy| dy[0] = -k * y[0], &mut counters);
        assert_relative_eq!(y[0], (-k * 2.0f64).exp(), epsilon = 1e-8);
        assert_eq!(counters.steps, 100);
        assert_eq!(counters.funcs, 400);
    }

    #[test]
    fn test_rkf45_exponential_decay() {
        let k = 0.1;
        let mut y = vec![1.0];
        let mut counters = OdeCounters::default();
        rkf45(10.0, 1, 200, 1e-8, 1e-10, &mut y, |y, dy| dy[0] = -k * y[0], &mut counters)
            .unwrap();
        assert_relative_eq!(y[0], (-1.0f64).exp(), epsilon = 1e-7);
        assert!(counters.steps > 0);
        assert!(counters.iters >= counters.steps);
        assert_eq!(counters.fails, 0);
    }

    #[test]
    fn test_rkf45_coupled_system() {
        // y0' = -y0, y1' = y0 - y1. Exact: y0 = e^-t, y1 = (c + t) e^-t.
        let mut y = vec![1.0, 0.0];
        let mut counters = OdeCounters::default();
        rkf45(
            1.0,
            1,
            200,
            1e-9,
            1e-12,
            &mut y,
            |y, dy| {
                dy[0] = -y[0];
                dy[1] = y[0] - y[1];
            },
            &mut counters,
        )
        .unwrap();
        let e = (-1.0f64).exp();
        assert_relative_eq!(y[0], e, epsilon = 1e-7);
        assert_relative_eq!(y[1], e, epsilon = 1e-7);
    }

    #[test]
    fn test_rkf45_iteration_budget_exhausted() {
        // A single allowed attempt cannot cover the interval at the forced
        // tight tolerance.
        let mut y = vec![1.0];
        let mut counters = OdeCounters::default();
        let result = rkf45(
            1.0,
            1000,
            1,
            1e-14,
            1e-16,
            &mut y,
            |y, dy| dy[0] = -50.0 * y[0] + (y[0] * 10.0).sin(),
            &mut counters,
        );
        assert!(result.is_err());
        assert_eq!(counters.fails, 1);
    }

    #[test]
    fn test_minimum_step_size_keeps_progressing() {
        // An unsatisfiable tolerance drives the controller down to the
        // minimum step size; steps at the floor are still taken, so the
        // integration makes progress until the attempt budget runs out.
        let mut y = vec![1.0];
        let mut counters = OdeCounters::default();
        let result = rkf45(
            1.0,
            1,
            50,
            1e-300,
            1e-300,
            &mut y,
            |y, dy| dy[0] = -y[0],
            &mut counters,
        );
        assert!(result.is_err());
        assert_eq!(counters.fails, 1);
        assert!(counters.steps > 0);
    }

    #[test]
    fn test_inert_components_relax_the_error_norm() {
        // The error estimate is a weighted RMS over all components, so
        // padding a system with inert species lowers the norm and lets the
        // controller take larger steps than the single-species system.
        let rel_tol = 1e-10;
        let abs_tol = 1e-12;

        let mut y_single = vec![1.0];
        let mut c_single = OdeCounters::default();
        rkf45(10.0, 1, 1_000_000, rel_tol, abs_tol, &mut y_single, |y, dy| dy[0] = -y[0],
            &mut c_single)
        .unwrap();

        let mut y_padded = vec![1.0, 0.0, 0.0, 0.0];
        let mut c_padded = OdeCounters::default();
        rkf45(
            10.0,
            1,
            1_000_000,
            rel_tol,
            abs_tol,
            &mut y_padded,
            |y, dy| {
                dy[0] = -y[0];
                dy[1] = 0.0;
                dy[2] = 0.0;
                dy[3] = 0.0;
            },
            &mut c_padded,
        )
        .unwrap();

        let expected = (-10.0f64).exp();
        assert_relative_eq!(y_single[0], expected, max_relative = 1e-6);
        assert_relative_eq!(y_padded[0], expected, max_relative = 1e-6);
        assert!(c_padded.funcs < c_single.funcs);
    }

    #[test]
    fn test_rk4_and_rkf45_agree() {
        let rhs = |y: &[f64], dy: &mut [f64]| {
            dy[0] = -0.3 * y[0] + 0.05 * y[1];
            dy[1] = 0.3 * y[0] - 0.05 * y[1];
        };
        let mut c1 = OdeCounters::default();
        let mut c2 = OdeCounters::default();

        let mut y_rk4 = vec![2.0, 0.5];
        rk4(5.0, 500, &mut y_rk4, rhs, &mut c1);

        let mut y_rkf = vec![2.0, 0.5];
        rkf45(5.0, 1, 500, 1e-9, 1e-12, &mut y_rkf, rhs, &mut c2).unwrap();

        assert_relative_eq!(y_rk4[0], y_rkf[0], epsilon = 1e-6);
        assert_relative_eq!(y_rk4[1], y_rkf[1], epsilon = 1e-6);
        // Mass is conserved by this pair of rates.
        assert_relative_eq!(y_rkf[0] + y_rkf[1], 2.5, epsilon = 1e-8);
    }

    #[test]
    fn test_counters_merge() {
        let mut a = OdeCounters { steps: 3, iters: 4, funcs: 24, fails: 0 };
        let b = OdeCounters { steps: 1, iters: 2, funcs: 12, fails: 1 };
        a.merge(&b);
        assert_eq!(a, OdeCounters { steps: 4, iters: 6, funcs: 36, fails: 1 });
    }
}
