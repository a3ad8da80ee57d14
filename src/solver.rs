/// Settings for the iterative linear solver used by the implicit stepper.
#[derive(Debug, Clone, Copy)]
pub struct SolverSettings {
    /// Maximum number of BiCGSTAB iterations per solve.
    pub max_iterations: usize,
    /// Relative residual tolerance.
    pub rel_tolerance: f64,
    /// Absolute residual tolerance.
    pub abs_tolerance: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self { max_iterations: 2000, rel_tolerance: 1e-9, abs_tolerance: 1e-12 }
    }
}

/// Solves `A x = b` with BiCGSTAB, where `A` is supplied as a matrix-free
/// operator `apply(x, out)`. The implicit diffusion system folds the
/// boundary-flux terms into the operator, which breaks symmetry for mixed
/// Neumann/Dirichlet axes, so a nonsymmetric Krylov method is used.
///
/// Starts from `x0` and returns the best iterate once the residual norm
/// drops below `max(abs_tolerance, rel_tolerance * ||b||)` or the
/// iteration budget runs out.
pub fn bicgstab<F>(mut apply: F, b: &[f64], x0: &[f64], settings: &SolverSettings) -> Vec<f64>
where
    F: FnMut(&[f64], &mut [f64]),
{
    let n = b.len();
    if n == 0 {
        return Vec::new();
    }

    let mut x = x0.to_vec();
    let mut ax = vec![0.0; n];
    apply(&x, &mut ax);

    let mut r: Vec<f64> = (0..n).map(|i| b[i] - ax[i]).collect();
    let b_norm = l2_norm(b).max(1.0);
    let tol = settings.abs_tolerance.max(settings.rel_tolerance * b_norm);
    if l2_norm(&r) <= tol {
        return x;
    }

    // Shadow residual, fixed at the initial residual.
    let r_hat = r.clone();

    let mut rho = 1.0;
    let mut alpha = 1.0;
    let mut omega = 1.0;
    let mut v = vec![0.0; n];
    let mut p = vec![0.0; n];
    let mut s = vec![0.0; n];
    let mut t = vec![0.0; n];

    for iter in 0..settings.max_iterations {
        let rho_new = dot(&r_hat, &r);
        if rho_new.abs() < 1e-300 {
            break;
        }

        if iter == 0 {
            p.copy_from_slice(&r);
        } else {
            let beta = (rho_new / rho) * (alpha / omega);
            for i in 0..n {
                p[i] = r[i] + beta * (p[i] - omega * v[i]);
            }
        }

        apply(&p, &mut v);
        let denom = dot(&r_hat, &v);
        if denom.abs() < 1e-300 {
            break;
        }
        alpha = rho_new / denom;

        for i in 0..n {
            s[i] = r[i] - alpha * v[i];
        }
        if l2_norm(&s) <= tol {
            for i in 0..n {
                x[i] += alpha * p[i];
            }
            break;
        }

        apply(&s, &mut t);
        let tt = dot(&t, &t);
        if tt.abs() < 1e-300 {
            break;
        }
        omega = dot(&t, &s) / tt;

        for i in 0..n {
            x[i] += alpha * p[i] + omega * s[i];
            r[i] = s[i] - omega * t[i];
        }

        if l2_norm(&r) <= tol || omega.abs() < 1e-300 {
            break;
        }
        rho = rho_new;
    }

    x
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn l2_norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}
