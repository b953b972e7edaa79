//! Random-intercept linear mixed-effects model.
//!
//! `y = Xβ + b_subject + ε` with `b ~ N(0, σ_b²)` and `ε ~ N(0, σ²)`,
//! fitted by restricted maximum likelihood. The REML criterion is profiled
//! over the variance ratio `θ = σ_b² / σ²`: for fixed θ the block inverse
//! of the compound-symmetric covariance is closed-form
//! (`W_i = I − θ/(1 + n_i θ) · J`), β is a GLS solve and σ² has an
//! explicit maximiser, so only a one-dimensional search remains.
//!
//! Subjects may contribute any number of observations, which is what makes
//! the model usable when repeated measurements have gaps.

use crate::error::EngineError;
use crate::report::{Cell, ResultTable};
use crate::special;
use nalgebra::{DMatrix, DVector};
use std::ops::Range;

const LOG_THETA_MIN: f64 = -12.0;
const LOG_THETA_MAX: f64 = 8.0;
const GRID_STEP: f64 = 0.5;
const GOLDEN_ITERATIONS: usize = 80;

/// Wald χ² test of one fixed-effect term.
#[derive(Debug, Clone, PartialEq)]
pub struct WaldTest {
    pub term: String,
    pub chi2: f64,
    pub df: usize,
    pub p_value: f64,
}

/// Fitted random-intercept model.
#[derive(Debug, Clone, PartialEq)]
pub struct MixedModelFit {
    pub coefficients: DVector<f64>,
    /// Covariance of the fixed-effect estimates.
    pub covariance: DMatrix<f64>,
    /// σ²
    pub residual_variance: f64,
    /// σ_b²
    pub subject_variance: f64,
    pub reml_log_likelihood: f64,
    pub n_obs: usize,
    pub n_subjects: usize,
    pub wald: Vec<WaldTest>,
}

impl MixedModelFit {
    pub fn wald_test(&self, term: &str) -> Option<&WaldTest> {
        self.wald.iter().find(|w| w.term == term)
    }

    /// `Source, Chi2, df, p, Variance`: one row per tested term followed by
    /// the two variance components.
    pub fn to_result_table(&self) -> ResultTable {
        let mut table = ResultTable::new(&["Source", "Chi2", "df", "p", "Variance"]);
        for w in &self.wald {
            table.push(vec![
                Cell::text(&w.term),
                Cell::num(w.chi2),
                Cell::count(w.df),
                Cell::num(w.p_value),
            ]);
        }
        table.push(vec![
            Cell::text("Subject variance"),
            Cell::Empty,
            Cell::Empty,
            Cell::Empty,
            Cell::num(self.subject_variance),
        ]);
        table.push(vec![
            Cell::text("Residual variance"),
            Cell::Empty,
            Cell::Empty,
            Cell::Empty,
            Cell::num(self.residual_variance),
        ]);
        table
    }
}

/// Sufficient statistics, so each likelihood evaluation is O(groups · p²).
struct Moments {
    xtx: DMatrix<f64>,
    xty: DVector<f64>,
    yty: f64,
    /// Per subject: (n_i, X_i'1, 1'y_i).
    blocks: Vec<(f64, DVector<f64>, f64)>,
    n: usize,
    p: usize,
}

struct Profile {
    log_likelihood: f64,
    beta: DVector<f64>,
    xwx_inv: DMatrix<f64>,
    sigma2: f64,
}

impl Moments {
    fn new(y: &[f64], x: &DMatrix<f64>, subjects: &[usize], n_subjects: usize) -> Self {
        let p = x.ncols();
        let yv = DVector::from_column_slice(y);
        let xt = x.transpose();
        let mut blocks = vec![(0.0, DVector::zeros(p), 0.0); n_subjects];
        for (row, &s) in subjects.iter().enumerate() {
            let block = &mut blocks[s];
            block.0 += 1.0;
            block.1 += x.row(row).transpose();
            block.2 += y[row];
        }
        Self {
            xtx: &xt * x,
            xty: &xt * &yv,
            yty: yv.norm_squared(),
            blocks,
            n: y.len(),
            p,
        }
    }

    /// Profiled REML log-likelihood at θ.
    fn profile(&self, theta: f64) -> Option<Profile> {
        let mut xwx = self.xtx.clone();
        let mut xwy = self.xty.clone();
        let mut ywy = self.yty;
        let mut log_det_v = 0.0;
        for (n_i, s_i, t_i) in &self.blocks {
            if *n_i == 0.0 {
                continue;
            }
            let c = theta / (1.0 + n_i * theta);
            xwx -= s_i * s_i.transpose() * c;
            xwy -= s_i * (c * t_i);
            ywy -= c * t_i * t_i;
            log_det_v += (1.0 + n_i * theta).ln();
        }
        let chol = xwx.cholesky()?;
        let beta = chol.solve(&xwy);
        let q = ywy - beta.dot(&xwy);
        let dof = (self.n - self.p) as f64;
        let sigma2 = q / dof;
        if sigma2.is_nan() || sigma2 <= 0.0 {
            return None;
        }
        let log_det_xwx: f64 = chol.l().diagonal().iter().map(|d| 2.0 * d.ln()).sum();
        let log_likelihood = -0.5
            * (dof * (1.0 + (2.0 * std::f64::consts::PI).ln())
                + dof * sigma2.ln()
                + log_det_v
                + log_det_xwx);
        Some(Profile {
            log_likelihood,
            beta,
            xwx_inv: chol.inverse(),
            sigma2,
        })
    }

    fn objective(&self, log_theta: f64) -> f64 {
        self.profile(log_theta.exp())
            .map_or(f64::NEG_INFINITY, |p| p.log_likelihood)
    }
}

/// Golden-section maximisation of `f` on `[a, b]`.
fn golden_max(f: impl Fn(f64) -> f64, mut a: f64, mut b: f64) -> f64 {
    let ratio = (5f64.sqrt() - 1.0) / 2.0;
    let mut c = b - ratio * (b - a);
    let mut d = a + ratio * (b - a);
    let (mut fc, mut fd) = (f(c), f(d));
    for _ in 0..GOLDEN_ITERATIONS {
        if fc >= fd {
            b = d;
            d = c;
            fd = fc;
            c = b - ratio * (b - a);
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + ratio * (b - a);
            fd = f(d);
        }
    }
    (a + b) / 2.0
}

/// Fits the random-intercept model.
///
/// `x` is the fixed-effects design (intercept included), `subjects[i]` the
/// subject index (`0..n_subjects`) of row `i`, and `terms` the named column
/// ranges of `x` to Wald-test.
pub fn fit_random_intercept(
    y: &[f64],
    x: &DMatrix<f64>,
    subjects: &[usize],
    terms: &[(String, Range<usize>)],
) -> Result<MixedModelFit, EngineError> {
    let n = y.len();
    if x.nrows() != n || subjects.len() != n {
        return Err(EngineError::DimensionMismatch {
            expected: n,
            actual: x.nrows().min(subjects.len()),
        });
    }
    if y.iter().any(|v| !v.is_finite()) {
        return Err(EngineError::fit("response contains non-finite values"));
    }
    let n_subjects = subjects.iter().max().map_or(0, |m| m + 1);
    let active = {
        let mut seen = vec![false; n_subjects];
        for &s in subjects {
            seen[s] = true;
        }
        seen.iter().filter(|&&v| v).count()
    };
    if active < 2 {
        return Err(EngineError::insufficient(
            "mixed model needs at least 2 subjects",
        ));
    }
    if n <= x.ncols() {
        return Err(EngineError::insufficient(format!(
            "{} observations for {} fixed effects",
            n,
            x.ncols()
        )));
    }

    let moments = Moments::new(y, x, subjects, n_subjects);

    // coarse grid, then golden section around the best grid point
    let steps = ((LOG_THETA_MAX - LOG_THETA_MIN) / GRID_STEP).round() as usize;
    let grid: Vec<f64> = (0..=steps)
        .map(|i| LOG_THETA_MIN + i as f64 * GRID_STEP)
        .collect();
    let values: Vec<f64> = grid.iter().map(|&g| moments.objective(g)).collect();
    let best = values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map_or(0, |(i, _)| i);
    let lo = grid[best.saturating_sub(1)];
    let hi = grid[(best + 1).min(grid.len() - 1)];
    let log_theta = golden_max(|g| moments.objective(g), lo, hi);

    let interior = moments.profile(log_theta.exp());
    let boundary = moments.profile(0.0);
    let (theta, profile) = match (interior, boundary) {
        (Some(i), Some(b)) if b.log_likelihood >= i.log_likelihood => (0.0, b),
        (Some(i), _) => (log_theta.exp(), i),
        (None, Some(b)) => (0.0, b),
        (None, None) => {
            return Err(EngineError::fit(
                "mixed model failed: fixed-effects design is singular",
            ))
        }
    };

    let covariance = &profile.xwx_inv * profile.sigma2;
    let mut wald = Vec::with_capacity(terms.len());
    for (name, range) in terms {
        let len = range.len();
        if len == 0 || range.end > covariance.ncols() {
            continue;
        }
        let b = profile.beta.rows(range.start, len).clone_owned();
        let cov = covariance
            .view((range.start, range.start), (len, len))
            .clone_owned();
        let chi2 = match cov.cholesky() {
            Some(c) => b.dot(&c.solve(&b)),
            None => f64::NAN,
        };
        wald.push(WaldTest {
            term: name.clone(),
            chi2,
            df: len,
            p_value: special::chi2_sf(chi2, len as f64),
        });
    }

    tracing::debug!(
        theta,
        sigma2 = profile.sigma2,
        loglik = profile.log_likelihood,
        "random-intercept REML fit"
    );

    Ok(MixedModelFit {
        coefficients: profile.beta,
        covariance,
        residual_variance: profile.sigma2,
        subject_variance: theta * profile.sigma2,
        reml_log_likelihood: profile.log_likelihood,
        n_obs: n,
        n_subjects: active,
        wald,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    /// Intercept + effects-coded 3-level within factor.
    fn design(levels: &[usize]) -> DMatrix<f64> {
        DMatrix::from_fn(levels.len(), 3, |r, c| match c {
            0 => 1.0,
            _ => {
                let j = c - 1;
                if levels[r] == j {
                    1.0
                } else if levels[r] == 2 {
                    -1.0
                } else {
                    0.0
                }
            }
        })
    }

    fn simulated(subject_sd: f64, seed: u64) -> (Vec<f64>, Vec<usize>, Vec<usize>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let b = Normal::new(0.0, subject_sd).unwrap();
        let e = Normal::new(0.0, 1.0).unwrap();
        let (mut y, mut subj, mut lvl) = (Vec::new(), Vec::new(), Vec::new());
        for s in 0..12 {
            let bs = b.sample(&mut rng);
            for level in 0..3 {
                y.push(10.0 + 2.0 * level as f64 + bs + e.sample(&mut rng));
                subj.push(s);
                lvl.push(level);
            }
        }
        (y, subj, lvl)
    }

    #[test]
    fn recovers_subject_variance_and_effect() {
        let (y, subj, lvl) = simulated(3.0, 7);
        let x = design(&lvl);
        let fit = fit_random_intercept(&y, &x, &subj, &[("Time".into(), 1..3)]).unwrap();
        assert!(fit.subject_variance > fit.residual_variance);
        let w = fit.wald_test("Time").unwrap();
        assert_eq!(w.df, 2);
        assert!(w.p_value < 1e-4);
        assert!((fit.coefficients[0] - 12.0).abs() < 3.5);
        assert_eq!(fit.n_subjects, 12);
    }

    #[test]
    fn handles_missing_observations() {
        let (mut y, mut subj, mut lvl) = simulated(2.0, 11);
        // drop three observations from different subjects
        for idx in [34, 20, 4] {
            y.remove(idx);
            subj.remove(idx);
            lvl.remove(idx);
        }
        let x = design(&lvl);
        let fit = fit_random_intercept(&y, &x, &subj, &[("Time".into(), 1..3)]).unwrap();
        assert_eq!(fit.n_obs, 33);
        assert!(fit.wald_test("Time").unwrap().p_value < 0.01);
        assert!(fit.reml_log_likelihood.is_finite());
    }

    #[test]
    fn no_subject_effect_goes_to_boundary() {
        // every subject has the same mean, so between-subject variance is zero
        let mut y = Vec::new();
        let mut subj = Vec::new();
        let mut lvl = Vec::new();
        let pattern = [[1.0, 2.0, 3.0], [2.0, 3.0, 1.0], [3.0, 1.0, 2.0]];
        for s in 0..6 {
            for level in 0..3 {
                y.push(pattern[s % 3][level] + level as f64);
                subj.push(s);
                lvl.push(level);
            }
        }
        let x = design(&lvl);
        let fit = fit_random_intercept(&y, &x, &subj, &[]).unwrap();
        assert!(fit.subject_variance < 1e-3 * fit.residual_variance);
    }

    #[test]
    fn single_subject_rejected() {
        let y = vec![1.0, 2.0, 3.0, 4.0];
        let x = design(&[0, 1, 2, 0]);
        let err = fit_random_intercept(&y, &x, &[0, 0, 0, 0], &[]).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData { .. }));
    }

    #[test]
    fn table_lists_terms_and_components() {
        let (y, subj, lvl) = simulated(1.0, 3);
        let fit = fit_random_intercept(&y, &design(&lvl), &subj, &[("Time".into(), 1..3)]).unwrap();
        let t = fit.to_result_table();
        assert_eq!(t.len(), 3);
        assert_eq!(t.value("Time", "df"), Some(2.0));
        assert!(t.value("Residual variance", "Variance").is_some());
        assert_eq!(t.value("Residual variance", "Chi2"), None);
    }
}
