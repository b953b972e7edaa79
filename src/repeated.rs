//! Repeated-measures and mixed (split-plot) ANOVA.
//!
//! Both take complete data: one row per subject, one value per
//! within-subject level. Sphericity is checked with Mauchly's test on
//! orthonormal Helmert contrasts; when it is rejected the within-subject
//! effects are re-tested on Greenhouse-Geisser corrected degrees of
//! freedom.
//!
//! ```
//! use u_labstat::repeated::rm_anova;
//!
//! let data = vec![
//!     vec![5.0, 7.0, 9.0],
//!     vec![4.0, 6.0, 9.0],
//!     vec![6.0, 7.0, 10.0],
//!     vec![5.0, 8.0, 11.0],
//! ];
//! let result = rm_anova(&data, "Time", 0.05).unwrap();
//! let time = result.effect("Time").unwrap();
//! assert!((time.f - 74.4545).abs() < 1e-3);
//! assert_eq!(time.df1, 2.0);
//! ```

use crate::error::EngineError;
use crate::report::{Cell, ResultTable};
use crate::special;
use nalgebra::DMatrix;

/// Mauchly's sphericity test plus the Greenhouse-Geisser epsilon.
#[derive(Debug, Clone, PartialEq)]
pub struct SphericityTest {
    pub w: f64,
    pub chi2: f64,
    pub df: f64,
    pub p_value: f64,
    pub epsilon: f64,
}

/// One tested effect. Degrees of freedom are already corrected when a
/// sphericity correction was applied.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectRow {
    pub source: String,
    pub ss: f64,
    pub df1: f64,
    pub df2: f64,
    pub ms: f64,
    pub f: f64,
    pub p_value: f64,
    /// Uncorrected p-value, kept for the record.
    pub p_uncorrected: f64,
}

/// An error stratum.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRow {
    pub source: String,
    pub ss: f64,
    pub df: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepeatedAnova {
    pub effects: Vec<EffectRow>,
    pub errors: Vec<ErrorRow>,
    pub sphericity: Option<SphericityTest>,
    /// Greenhouse-Geisser epsilon, when the correction was applied.
    pub correction: Option<f64>,
    pub notes: Vec<String>,
}

impl RepeatedAnova {
    pub fn effect(&self, source: &str) -> Option<&EffectRow> {
        self.effects.iter().find(|e| e.source == source)
    }

    pub fn to_result_table(&self) -> ResultTable {
        let mut table = ResultTable::new(&["Source", "SS", "df", "MS", "F", "p", "p (uncorrected)"]);
        for e in &self.effects {
            table.push(vec![
                Cell::text(&e.source),
                Cell::num(e.ss),
                Cell::num(e.df1),
                Cell::num(e.ms),
                Cell::num(e.f),
                Cell::num(e.p_value),
                Cell::num(e.p_uncorrected),
            ]);
        }
        for e in &self.errors {
            table.push(vec![
                Cell::text(&e.source),
                Cell::num(e.ss),
                Cell::num(e.df),
                Cell::num(e.ss / e.df),
            ]);
        }
        table
    }

    /// Mauchly / Greenhouse-Geisser summary, if sphericity was tested.
    pub fn sphericity_table(&self) -> Option<ResultTable> {
        let s = self.sphericity.as_ref()?;
        let mut table = ResultTable::new(&["Test", "W", "Chi2", "df", "p", "GG epsilon"]);
        table.push(vec![
            Cell::text("Mauchly"),
            Cell::num(s.w),
            Cell::num(s.chi2),
            Cell::num(s.df),
            Cell::num(s.p_value),
            Cell::num(s.epsilon),
        ]);
        Some(table)
    }
}

// ── Sphericity ────────────────────────────────────────────────────────

/// Orthonormal Helmert contrasts, `k × (k − 1)`.
fn helmert(k: usize) -> DMatrix<f64> {
    DMatrix::from_fn(k, k - 1, |i, j| {
        let norm = (((j + 1) * (j + 2)) as f64).sqrt();
        if i <= j {
            1.0 / norm
        } else if i == j + 1 {
            -((j + 1) as f64) / norm
        } else {
            0.0
        }
    })
}

/// Mauchly's test on a contrast covariance `s` estimated with `df_error`
/// degrees of freedom. `None` when `s` is singular.
pub fn mauchly(s: &DMatrix<f64>, df_error: f64) -> Option<SphericityTest> {
    let p = s.nrows();
    if p < 2 || df_error < p as f64 {
        return None;
    }
    let trace = s.trace();
    let det = s.determinant();
    if trace.is_nan() || det.is_nan() || trace <= 0.0 || det <= 0.0 {
        return None;
    }
    let pf = p as f64;
    let w = det / (trace / pf).powi(p as i32);
    let correction = (2.0 * pf * pf + pf + 2.0) / (6.0 * pf);
    let chi2 = -(df_error - correction) * w.ln();
    let df = pf * (pf + 1.0) / 2.0 - 1.0;
    Some(SphericityTest {
        w,
        chi2,
        df,
        p_value: special::chi2_sf(chi2.max(0.0), df),
        epsilon: greenhouse_geisser(s),
    })
}

/// Greenhouse-Geisser ε from a contrast covariance, clamped to `[1/p, 1]`.
pub fn greenhouse_geisser(s: &DMatrix<f64>) -> f64 {
    let p = s.nrows() as f64;
    let trace = s.trace();
    let trace_sq = (s * s).trace();
    if trace_sq <= 0.0 {
        return 1.0;
    }
    (trace * trace / (p * trace_sq)).clamp(1.0 / p, 1.0)
}

/// Contrast covariance pooled over groups.
fn contrast_covariance(data: &[Vec<f64>], groups: &[usize], n_groups: usize) -> (DMatrix<f64>, f64) {
    let k = data[0].len();
    let c = helmert(k);
    let y = DMatrix::from_fn(data.len(), k, |i, j| data[i][j]);
    let mut z = &y * &c;
    let mut present = 0;
    for g in 0..n_groups {
        let rows: Vec<usize> = (0..data.len()).filter(|&i| groups[i] == g).collect();
        if rows.is_empty() {
            continue;
        }
        present += 1;
        for col in 0..z.ncols() {
            let m = rows.iter().map(|&i| z[(i, col)]).sum::<f64>() / rows.len() as f64;
            for &i in &rows {
                z[(i, col)] -= m;
            }
        }
    }
    let df = data.len().saturating_sub(present) as f64;
    ((z.transpose() * &z) / df, df)
}

/// Runs Mauchly (levels > 2) and decides whether to correct.
fn check_sphericity(
    data: &[Vec<f64>],
    groups: &[usize],
    n_groups: usize,
    alpha: f64,
    notes: &mut Vec<String>,
) -> (Option<SphericityTest>, Option<f64>) {
    let k = data[0].len();
    if k < 3 {
        notes.push("Sphericity holds trivially with two levels; Mauchly's test skipped".into());
        return (None, None);
    }
    let (s, df) = contrast_covariance(data, groups, n_groups);
    match mauchly(&s, df) {
        Some(test) if test.p_value < alpha => {
            notes.push(format!(
                "Sphericity violated (Mauchly W = {:.4}, p = {:.4}); Greenhouse-Geisser correction applied (epsilon = {:.4})",
                test.w, test.p_value, test.epsilon
            ));
            let eps = test.epsilon;
            (Some(test), Some(eps))
        }
        Some(test) => (Some(test), None),
        None => {
            notes.push(
                "Mauchly's test not computable (too few subjects for the number of levels); no sphericity correction applied"
                    .into(),
            );
            (None, None)
        }
    }
}

fn effect(source: &str, ss: f64, df1: f64, ss_err: f64, df2: f64, epsilon: Option<f64>) -> EffectRow {
    let ms = ss / df1;
    let ms_err = ss_err / df2;
    let f = if ms_err > 0.0 {
        ms / ms_err
    } else if ms > 0.0 {
        f64::INFINITY
    } else {
        f64::NAN
    };
    let p_uncorrected = special::f_sf(f, df1, df2);
    let eps = epsilon.unwrap_or(1.0);
    EffectRow {
        source: source.to_string(),
        ss,
        df1: df1 * eps,
        df2: df2 * eps,
        ms,
        f,
        p_value: special::f_sf(f, df1 * eps, df2 * eps),
        p_uncorrected,
    }
}

fn validate(data: &[Vec<f64>]) -> Result<(usize, usize), EngineError> {
    let n = data.len();
    let k = data.first().map_or(0, Vec::len);
    if k < 2 {
        return Err(EngineError::insufficient("at least 2 within-subject levels required"));
    }
    if data.iter().any(|r| r.len() != k) {
        return Err(EngineError::fit("subjects have differing numbers of levels"));
    }
    if data.iter().flatten().any(|v| !v.is_finite()) {
        return Err(EngineError::fit("non-finite measurement"));
    }
    Ok((n, k))
}

// ── Designs ───────────────────────────────────────────────────────────

/// One-way repeated-measures ANOVA.
pub fn rm_anova(data: &[Vec<f64>], within_name: &str, alpha: f64) -> Result<RepeatedAnova, EngineError> {
    let (n, k) = validate(data)?;
    if n < 2 {
        return Err(EngineError::insufficient(format!(
            "{n} complete subject(s); repeated-measures ANOVA needs at least 2"
        )));
    }
    let (nf, kf) = (n as f64, k as f64);
    let grand = data.iter().flatten().sum::<f64>() / (nf * kf);
    let ss_total: f64 = data.iter().flatten().map(|v| (v - grand).powi(2)).sum();
    let ss_subjects: f64 = data
        .iter()
        .map(|r| kf * (r.iter().sum::<f64>() / kf - grand).powi(2))
        .sum();
    let ss_within: f64 = (0..k)
        .map(|j| {
            let m = data.iter().map(|r| r[j]).sum::<f64>() / nf;
            nf * (m - grand).powi(2)
        })
        .sum();
    let ss_error = (ss_total - ss_subjects - ss_within).max(0.0);
    let df_within = kf - 1.0;
    let df_error = (nf - 1.0) * (kf - 1.0);

    let mut notes = Vec::new();
    let groups = vec![0; n];
    let (sphericity, correction) = check_sphericity(data, &groups, 1, alpha, &mut notes);

    Ok(RepeatedAnova {
        effects: vec![effect(within_name, ss_within, df_within, ss_error, df_error, correction)],
        errors: vec![ErrorRow {
            source: "Error".into(),
            ss: ss_error,
            df: df_error,
        }],
        sphericity,
        correction,
        notes,
    })
}

/// Mixed ANOVA: one between-subject factor (`groups[i]` indexes
/// `group_names`) crossed with the within-subject levels.
///
/// Effects are reported as `between`, `within` and `between:within`.
pub fn mixed_anova(
    data: &[Vec<f64>],
    groups: &[usize],
    n_groups: usize,
    between_name: &str,
    within_name: &str,
    alpha: f64,
) -> Result<RepeatedAnova, EngineError> {
    let (n, k) = validate(data)?;
    if groups.len() != n {
        return Err(EngineError::DimensionMismatch {
            expected: n,
            actual: groups.len(),
        });
    }
    let sizes: Vec<usize> = (0..n_groups)
        .map(|g| groups.iter().filter(|&&x| x == g).count())
        .collect();
    let present = sizes.iter().filter(|&&s| s > 0).count();
    if present < 2 {
        return Err(EngineError::insufficient(
            "mixed ANOVA needs at least 2 between-subject groups",
        ));
    }
    if n <= present {
        return Err(EngineError::insufficient(
            "mixed ANOVA needs more subjects than between-subject groups",
        ));
    }

    let (nf, kf) = (n as f64, k as f64);
    let grand = data.iter().flatten().sum::<f64>() / (nf * kf);
    let ss_total: f64 = data.iter().flatten().map(|v| (v - grand).powi(2)).sum();
    let ss_subjects: f64 = data
        .iter()
        .map(|r| kf * (r.iter().sum::<f64>() / kf - grand).powi(2))
        .sum();

    // cell means: group × level
    let mut cell = vec![vec![0.0; k]; n_groups];
    for (row, &g) in data.iter().zip(groups) {
        for j in 0..k {
            cell[g][j] += row[j];
        }
    }
    for g in 0..n_groups {
        if sizes[g] > 0 {
            for v in &mut cell[g] {
                *v /= sizes[g] as f64;
            }
        }
    }
    let ss_between: f64 = (0..n_groups)
        .filter(|&g| sizes[g] > 0)
        .map(|g| {
            let m = cell[g].iter().sum::<f64>() / kf;
            sizes[g] as f64 * kf * (m - grand).powi(2)
        })
        .sum();
    let ss_within: f64 = (0..k)
        .map(|j| {
            let m = data.iter().map(|r| r[j]).sum::<f64>() / nf;
            nf * (m - grand).powi(2)
        })
        .sum();
    let ss_cells: f64 = (0..n_groups)
        .filter(|&g| sizes[g] > 0)
        .map(|g| {
            cell[g]
                .iter()
                .map(|m| sizes[g] as f64 * (m - grand).powi(2))
                .sum::<f64>()
        })
        .sum();
    let ss_interaction = (ss_cells - ss_between - ss_within).max(0.0);
    let ss_subject_error = (ss_subjects - ss_between).max(0.0);
    let ss_within_error = (ss_total - ss_subjects - ss_within - ss_interaction).max(0.0);

    let gf = present as f64;
    let df_between = gf - 1.0;
    let df_subject_error = nf - gf;
    let df_within = kf - 1.0;
    let df_interaction = (gf - 1.0) * (kf - 1.0);
    let df_within_error = (nf - gf) * (kf - 1.0);

    let mut notes = Vec::new();
    let (sphericity, correction) = check_sphericity(data, groups, n_groups, alpha, &mut notes);
    let interaction_name = format!("{between_name}:{within_name}");

    Ok(RepeatedAnova {
        effects: vec![
            effect(between_name, ss_between, df_between, ss_subject_error, df_subject_error, None),
            effect(within_name, ss_within, df_within, ss_within_error, df_within_error, correction),
            effect(
                &interaction_name,
                ss_interaction,
                df_interaction,
                ss_within_error,
                df_within_error,
                correction,
            ),
        ],
        errors: vec![
            ErrorRow {
                source: "Error (between)".into(),
                ss: ss_subject_error,
                df: df_subject_error,
            },
            ErrorRow {
                source: "Error (within)".into(),
                ss: ss_within_error,
                df: df_within_error,
            },
        ],
        sphericity,
        correction,
        notes,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixed_model::fit_random_intercept;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn noisy(n: usize, k: usize, offsets: &[f64]) -> Vec<Vec<f64>> {
        (0..n)
            .map(|i| {
                (0..k)
                    .map(|j| 10.0 + i as f64 * 0.8 + offsets[j] + ((i * 7 + j * 3) % 5) as f64 * 0.3 - 0.6)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn helmert_is_orthonormal() {
        let c = helmert(4);
        let g = c.transpose() * &c;
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((g[(i, j)] - expected).abs() < 1e-12);
            }
        }
        // contrasts sum to zero over levels
        for j in 0..3 {
            assert!(c.column(j).sum().abs() < 1e-12);
        }
    }

    #[test]
    fn two_levels_skip_mauchly() {
        let data = noisy(8, 2, &[0.0, 2.0]);
        let r = rm_anova(&data, "Time", 0.05).unwrap();
        assert!(r.sphericity.is_none());
        assert!(r.correction.is_none());
        assert!(r.notes.iter().any(|n| n.contains("Mauchly's test skipped")));
    }

    #[test]
    fn two_levels_match_paired_t() {
        let data = noisy(8, 2, &[0.0, 1.0]);
        let r = rm_anova(&data, "Time", 0.05).unwrap();
        let x: Vec<f64> = data.iter().map(|r| r[0]).collect();
        let y: Vec<f64> = data.iter().map(|r| r[1]).collect();
        let t = crate::testing::paired_t_test(&x, &y).unwrap();
        let e = r.effect("Time").unwrap();
        assert!((e.f - t.statistic * t.statistic).abs() < 1e-8);
        assert!((e.p_value - t.p_value).abs() < 1e-8);
    }

    #[test]
    fn sphericity_violation_triggers_correction() {
        let mut rng = StdRng::seed_from_u64(42);
        let subj = Normal::new(0.0, 2.0).unwrap();
        let e = Normal::new(0.0, 1.0).unwrap();
        let data: Vec<Vec<f64>> = (0..24)
            .map(|_| {
                let s = subj.sample(&mut rng);
                vec![
                    s + e.sample(&mut rng),
                    s + 3.0 + e.sample(&mut rng),
                    s + 6.0 + 6.0 * e.sample(&mut rng),
                ]
            })
            .collect();
        let r = rm_anova(&data, "Time", 0.05).unwrap();
        let sph = r.sphericity.as_ref().unwrap();
        assert!(sph.p_value < 0.05, "Mauchly p = {}", sph.p_value);
        let eps = r.correction.unwrap();
        assert!(eps < 1.0 && eps >= 0.5);
        let time = r.effect("Time").unwrap();
        assert!((time.df1 - 2.0 * eps).abs() < 1e-12);
        // with F > 1 shrinking both df makes the test more conservative
        assert!(time.f > 1.0, "F = {}", time.f);
        assert!(time.p_value >= time.p_uncorrected);
        assert!(r.sphericity_table().is_some());
    }

    #[test]
    fn epsilon_is_one_for_spherical_covariance() {
        let s = DMatrix::<f64>::identity(3, 3) * 2.0;
        assert!((greenhouse_geisser(&s) - 1.0).abs() < 1e-12);
        let t = mauchly(&s, 20.0).unwrap();
        assert!((t.w - 1.0).abs() < 1e-12);
        assert!(t.p_value > 0.99);
    }

    #[test]
    fn balanced_lmm_wald_matches_rm_anova() {
        let data = noisy(10, 3, &[0.0, 1.5, 2.0]);
        let r = rm_anova(&data, "Time", 0.05).unwrap();
        let f = r.effect("Time").unwrap().f;

        let mut y = Vec::new();
        let mut subjects = Vec::new();
        let mut levels = Vec::new();
        for (i, row) in data.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                y.push(*v);
                subjects.push(i);
                levels.push(j);
            }
        }
        let x = DMatrix::from_fn(y.len(), 3, |r, c| match c {
            0 => 1.0,
            _ if levels[r] == c - 1 => 1.0,
            _ if levels[r] == 2 => -1.0,
            _ => 0.0,
        });
        let fit = fit_random_intercept(&y, &x, &subjects, &[("Time".into(), 1..3)]).unwrap();
        let chi2 = fit.wald_test("Time").unwrap().chi2;
        assert!((chi2 / 2.0 - f).abs() / f < 1e-3, "chi2/2 = {}, F = {}", chi2 / 2.0, f);
    }

    #[test]
    fn mixed_partition_adds_up() {
        let data = noisy(12, 3, &[0.0, 1.0, 3.0]);
        let groups: Vec<usize> = (0..12).map(|i| i % 2).collect();
        // add a group × time interaction
        let data: Vec<Vec<f64>> = data
            .iter()
            .zip(&groups)
            .map(|(r, &g)| r.iter().enumerate().map(|(j, v)| v + (g * j) as f64 * 2.0).collect())
            .collect();
        let r = mixed_anova(&data, &groups, 2, "Dose", "Time", 0.05).unwrap();

        let grand = data.iter().flatten().sum::<f64>() / 36.0;
        let ss_total: f64 = data.iter().flatten().map(|v| (v - grand).powi(2)).sum();
        let explained: f64 = r.effects.iter().map(|e| e.ss).sum::<f64>() + r.errors.iter().map(|e| e.ss).sum::<f64>();
        assert!((explained - ss_total).abs() < 1e-8);

        assert!(r.effect("Dose:Time").unwrap().p_value < 0.001);
        assert_eq!(r.errors[0].df, 10.0);
        assert_eq!(r.errors[1].df, 20.0);
        assert_eq!(r.to_result_table().len(), 5);
    }

    #[test]
    fn mixed_needs_two_groups() {
        let data = noisy(6, 3, &[0.0, 1.0, 2.0]);
        let err = mixed_anova(&data, &[0; 6], 1, "Dose", "Time", 0.05).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData { .. }));
    }

    #[test]
    fn rejects_single_level_and_single_subject() {
        assert!(rm_anova(&[vec![1.0], vec![2.0]], "T", 0.05).is_err());
        assert!(rm_anova(&[vec![1.0, 2.0]], "T", 0.05).is_err());
    }
}
