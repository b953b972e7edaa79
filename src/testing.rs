//! Primitive hypothesis tests.
//!
//! Every function takes plain slices and returns `None` when the test is
//! not computable for the input (too few observations, zero variance,
//! non-finite values). Callers decide how to report that.
//!
//! # Example
//!
//! ```
//! use u_labstat::testing::{shapiro_wilk_test, student_t_test};
//!
//! let a = [5.1, 4.9, 5.2, 5.0, 4.8, 5.3];
//! let b = [7.1, 6.9, 7.2, 7.0, 6.8, 7.3];
//! assert!(student_t_test(&a, &b).unwrap().p_value < 0.001);
//! assert!(shapiro_wilk_test(&a).unwrap().p_value > 0.05);
//! ```

use crate::special;
use crate::stats;

/// Result of a hypothesis test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestResult {
    /// Test statistic (t, F, χ², U, W, or odds ratio).
    pub statistic: f64,
    /// Degrees of freedom; `0.0` where not applicable.
    pub df: f64,
    pub p_value: f64,
}

fn all_finite(data: &[f64]) -> bool {
    data.iter().all(|v| v.is_finite())
}

// ── t-tests ───────────────────────────────────────────────────────────

/// One-sample t-test of H₀: μ = `mu0`.
pub fn one_sample_t_test(data: &[f64], mu0: f64) -> Option<TestResult> {
    let n = data.len();
    if n < 2 || !all_finite(data) {
        return None;
    }
    let sd = stats::std_dev(data)?;
    if sd < 1e-300 {
        return None;
    }
    let t = (stats::mean(data)? - mu0) / (sd / (n as f64).sqrt());
    let df = (n - 1) as f64;
    Some(TestResult {
        statistic: t,
        df,
        p_value: special::t_two_sided_p(t, df),
    })
}

/// Student's two-sample t-test with pooled variance.
pub fn student_t_test(a: &[f64], b: &[f64]) -> Option<TestResult> {
    let (n1, n2) = (a.len(), b.len());
    if n1 < 2 || n2 < 2 || !all_finite(a) || !all_finite(b) {
        return None;
    }
    let df = (n1 + n2 - 2) as f64;
    let pooled = ((n1 - 1) as f64 * stats::variance(a)? + (n2 - 1) as f64 * stats::variance(b)?) / df;
    let se = (pooled * (1.0 / n1 as f64 + 1.0 / n2 as f64)).sqrt();
    if se < 1e-300 {
        return None;
    }
    let t = (stats::mean(a)? - stats::mean(b)?) / se;
    Some(TestResult {
        statistic: t,
        df,
        p_value: special::t_two_sided_p(t, df),
    })
}

/// Welch's unequal-variance t-test (Welch-Satterthwaite df).
pub fn welch_t_test(a: &[f64], b: &[f64]) -> Option<TestResult> {
    let (n1, n2) = (a.len() as f64, b.len() as f64);
    if a.len() < 2 || b.len() < 2 || !all_finite(a) || !all_finite(b) {
        return None;
    }
    let v1 = stats::variance(a)? / n1;
    let v2 = stats::variance(b)? / n2;
    if v1 + v2 < 1e-300 {
        return None;
    }
    let t = (stats::mean(a)? - stats::mean(b)?) / (v1 + v2).sqrt();
    let df = (v1 + v2).powi(2) / (v1 * v1 / (n1 - 1.0) + v2 * v2 / (n2 - 1.0));
    Some(TestResult {
        statistic: t,
        df,
        p_value: special::t_two_sided_p(t, df),
    })
}

/// Paired t-test on x − y.
pub fn paired_t_test(x: &[f64], y: &[f64]) -> Option<TestResult> {
    if x.len() != y.len() {
        return None;
    }
    let diffs: Vec<f64> = x.iter().zip(y).map(|(a, b)| a - b).collect();
    one_sample_t_test(&diffs, 0.0)
}

// ── ANOVA & variance homogeneity ──────────────────────────────────────

/// One-way ANOVA decomposition.
#[derive(Debug, Clone, PartialEq)]
pub struct AnovaResult {
    pub f_statistic: f64,
    pub df_between: usize,
    pub df_within: usize,
    pub p_value: f64,
    pub ss_between: f64,
    pub ss_within: f64,
    pub ms_between: f64,
    pub ms_within: f64,
    pub group_means: Vec<f64>,
}

/// One-way ANOVA. Groups need at least one observation each and the
/// design needs at least one error degree of freedom.
pub fn one_way_anova(groups: &[&[f64]]) -> Option<AnovaResult> {
    let k = groups.len();
    if k < 2 || groups.iter().any(|g| g.is_empty() || !all_finite(g)) {
        return None;
    }
    let total_n: usize = groups.iter().map(|g| g.len()).sum();
    if total_n <= k {
        return None;
    }
    let grand_mean = groups.iter().flat_map(|g| g.iter()).sum::<f64>() / total_n as f64;
    let group_means: Vec<f64> = groups
        .iter()
        .map(|g| g.iter().sum::<f64>() / g.len() as f64)
        .collect();

    let ss_between: f64 = groups
        .iter()
        .zip(&group_means)
        .map(|(g, m)| g.len() as f64 * (m - grand_mean).powi(2))
        .sum();
    let ss_within: f64 = groups
        .iter()
        .zip(&group_means)
        .map(|(g, m)| g.iter().map(|x| (x - m).powi(2)).sum::<f64>())
        .sum();

    let df_between = k - 1;
    let df_within = total_n - k;
    let ms_between = ss_between / df_between as f64;
    let ms_within = ss_within / df_within as f64;
    let (f_statistic, p_value) = if ms_within > 1e-300 {
        let f = ms_between / ms_within;
        (f, special::f_sf(f, df_between as f64, df_within as f64))
    } else if ms_between > 1e-300 {
        (f64::INFINITY, 0.0)
    } else {
        return None;
    };

    Some(AnovaResult {
        f_statistic,
        df_between,
        df_within,
        p_value,
        ss_between,
        ss_within,
        ms_between,
        ms_within,
        group_means,
    })
}

/// Levene's test, median-centred (Brown-Forsythe): one-way ANOVA on
/// |x − median(group)|.
pub fn levene_test(groups: &[&[f64]]) -> Option<TestResult> {
    if groups.len() < 2 || groups.iter().any(|g| g.len() < 2) {
        return None;
    }
    let deviations: Vec<Vec<f64>> = groups
        .iter()
        .map(|g| {
            let med = stats::median(g)?;
            Some(g.iter().map(|x| (x - med).abs()).collect())
        })
        .collect::<Option<_>>()?;
    let refs: Vec<&[f64]> = deviations.iter().map(Vec::as_slice).collect();
    let anova = one_way_anova(&refs)?;
    Some(TestResult {
        statistic: anova.f_statistic,
        df: anova.df_between as f64,
        p_value: anova.p_value,
    })
}

// ── Shapiro-Wilk ──────────────────────────────────────────────────────

/// Shapiro-Wilk W and its p-value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapiroWilkResult {
    pub w: f64,
    pub p_value: f64,
}

// Royston (1995) AS R94 polynomial coefficients
const SW_C1: [f64; 6] = [0.0, 0.221157, -0.147981, -2.07119, 4.434685, -2.706056];
const SW_C2: [f64; 6] = [0.0, 0.042981, -0.293762, -1.752461, 5.682633, -3.582633];
const SW_C3: [f64; 4] = [0.544, -0.39978, 0.025054, -6.714e-4];
const SW_C4: [f64; 4] = [1.3822, -0.77857, 0.062767, -0.0020322];
const SW_C5: [f64; 4] = [-1.5861, -0.31082, -0.083751, 0.0038915];
const SW_C6: [f64; 3] = [-0.4803, -0.082676, 0.0030302];
const SW_G: [f64; 2] = [-2.273, 0.459];

fn poly(c: &[f64], x: f64) -> f64 {
    c.iter().rev().fold(0.0, |acc, &ci| acc * x + ci)
}

/// Shapiro-Wilk normality test (Royston AS R94), valid for 3 ≤ n ≤ 5000.
///
/// Returns `None` outside that range, for constant data or non-finite
/// values.
pub fn shapiro_wilk_test(data: &[f64]) -> Option<ShapiroWilkResult> {
    let n = data.len();
    if !(3..=5000).contains(&n) || !all_finite(data) {
        return None;
    }
    let mut x = data.to_vec();
    x.sort_by(|a, b| a.total_cmp(b));
    let range = x[n - 1] - x[0];
    if range < 1e-300 {
        return None;
    }
    let mean = x.iter().sum::<f64>() / n as f64;
    let ssq: f64 = x.iter().map(|v| (v - mean).powi(2)).sum();
    if ssq < 1e-300 {
        return None;
    }

    if n == 3 {
        let a = std::f64::consts::FRAC_1_SQRT_2;
        let w = ((a * (x[2] - x[0])).powi(2) / ssq).clamp(0.75, 1.0);
        let p = (6.0 / std::f64::consts::PI) * (w.sqrt().asin() - std::f64::consts::FRAC_PI_3);
        return Some(ShapiroWilkResult {
            w,
            p_value: p.clamp(0.0, 1.0),
        });
    }

    let half = n / 2;
    let nf = n as f64;
    // Blom scores for the lower half (negative)
    let m: Vec<f64> = (1..=half)
        .map(|i| special::normal_quantile((i as f64 - 0.375) / (nf + 0.25)))
        .collect();
    let summ2 = 2.0 * m.iter().map(|v| v * v).sum::<f64>();
    let ssumm2 = summ2.sqrt();
    let rsn = 1.0 / nf.sqrt();

    let mut a = vec![0.0; half];
    a[0] = poly(&SW_C1, rsn) - m[0] / ssumm2;
    let (first_free, fac) = if n > 5 {
        a[1] = poly(&SW_C2, rsn) - m[1] / ssumm2;
        let num = summ2 - 2.0 * m[0] * m[0] - 2.0 * m[1] * m[1];
        let den = 1.0 - 2.0 * a[0] * a[0] - 2.0 * a[1] * a[1];
        (2, (num / den).sqrt())
    } else {
        let num = summ2 - 2.0 * m[0] * m[0];
        let den = 1.0 - 2.0 * a[0] * a[0];
        (1, (num / den).sqrt())
    };
    if !fac.is_finite() || fac <= 0.0 {
        return None;
    }
    for i in first_free..half {
        a[i] = -m[i] / fac;
    }

    let numerator: f64 = (0..half).map(|i| a[i] * (x[n - 1 - i] - x[i])).sum();
    let w = (numerator * numerator / ssq).min(1.0);
    Some(ShapiroWilkResult {
        w,
        p_value: shapiro_wilk_p(w, n),
    })
}

fn shapiro_wilk_p(w: f64, n: usize) -> f64 {
    let w1 = (1.0 - w).ln();
    if !w1.is_finite() {
        return 1.0;
    }
    let nf = n as f64;
    let z = if n <= 11 {
        let gamma = poly(&SW_G, nf);
        if w1 >= gamma {
            return 0.0;
        }
        let y = -(gamma - w1).ln();
        (y - poly(&SW_C3, nf)) / poly(&SW_C4, nf).exp()
    } else {
        let ln_n = nf.ln();
        (w1 - poly(&SW_C5, ln_n)) / poly(&SW_C6, ln_n).exp()
    };
    (1.0 - special::normal_cdf(z)).clamp(0.0, 1.0)
}

// ── Rank tests ────────────────────────────────────────────────────────

/// Mann-Whitney U (normal approximation with tie correction).
///
/// The statistic is U of the first sample.
pub fn mann_whitney_u_test(a: &[f64], b: &[f64]) -> Option<TestResult> {
    let (n1, n2) = (a.len(), b.len());
    if n1 == 0 || n2 == 0 || n1 + n2 < 3 || !all_finite(a) || !all_finite(b) {
        return None;
    }
    let combined: Vec<f64> = a.iter().chain(b).copied().collect();
    let ranks = stats::ranks(&combined);
    let (n1f, n2f) = (n1 as f64, n2 as f64);
    let n = n1f + n2f;
    let r1: f64 = ranks[..n1].iter().sum();
    let u1 = r1 - n1f * (n1f + 1.0) / 2.0;

    let sigma_sq = n1f * n2f / 12.0 * ((n + 1.0) - stats::tie_term(&combined) / (n * (n - 1.0)));
    if sigma_sq <= 0.0 {
        return None;
    }
    let z = (u1 - n1f * n2f / 2.0) / sigma_sq.sqrt();
    Some(TestResult {
        statistic: u1,
        df: 0.0,
        p_value: special::normal_two_sided_p(z),
    })
}

/// Wilcoxon signed-rank test on x − y (zero differences dropped, normal
/// approximation with tie correction). The statistic is T⁺.
pub fn wilcoxon_signed_rank_test(x: &[f64], y: &[f64]) -> Option<TestResult> {
    if x.len() != y.len() || !all_finite(x) || !all_finite(y) {
        return None;
    }
    let diffs: Vec<f64> = x
        .iter()
        .zip(y)
        .map(|(a, b)| a - b)
        .filter(|d| d.abs() > 1e-300)
        .collect();
    let n = diffs.len();
    if n < 2 {
        return None;
    }
    let abs: Vec<f64> = diffs.iter().map(|d| d.abs()).collect();
    let ranks = stats::ranks(&abs);
    let t_plus: f64 = diffs
        .iter()
        .zip(&ranks)
        .filter(|(d, _)| **d > 0.0)
        // fold from +0.0: an empty f64 sum is -0.0
        .fold(0.0, |acc, (_, r)| acc + r);
    let nf = n as f64;
    let sigma_sq = nf * (nf + 1.0) * (2.0 * nf + 1.0) / 24.0 - stats::tie_term(&abs) / 48.0;
    if sigma_sq <= 0.0 {
        return None;
    }
    let z = (t_plus - nf * (nf + 1.0) / 4.0) / sigma_sq.sqrt();
    Some(TestResult {
        statistic: t_plus,
        df: 0.0,
        p_value: special::normal_two_sided_p(z),
    })
}

/// Kruskal-Wallis H test (tie corrected, χ² approximation).
pub fn kruskal_wallis_test(groups: &[&[f64]]) -> Option<TestResult> {
    let k = groups.len();
    if k < 2 || groups.iter().any(|g| g.is_empty() || !all_finite(g)) {
        return None;
    }
    let combined: Vec<f64> = groups.iter().flat_map(|g| g.iter().copied()).collect();
    let nf = combined.len() as f64;
    let ranks = stats::ranks(&combined);

    let mut h = 0.0;
    let mut offset = 0;
    for g in groups {
        let r: f64 = ranks[offset..offset + g.len()].iter().sum();
        h += r * r / g.len() as f64;
        offset += g.len();
    }
    h = 12.0 / (nf * (nf + 1.0)) * h - 3.0 * (nf + 1.0);

    let correction = 1.0 - stats::tie_term(&combined) / (nf.powi(3) - nf);
    if correction <= 1e-15 {
        return None;
    }
    h /= correction;
    let df = (k - 1) as f64;
    Some(TestResult {
        statistic: h,
        df,
        p_value: special::chi2_sf(h, df),
    })
}

/// Friedman test on complete blocks.
///
/// `blocks[i][j]` is subject `i` under condition `j`; every block must
/// have the same number (≥ 2) of conditions.
pub fn friedman_test(blocks: &[Vec<f64>]) -> Option<TestResult> {
    let n = blocks.len();
    let k = blocks.first()?.len();
    if n < 2 || k < 2 || blocks.iter().any(|b| b.len() != k || !all_finite(b)) {
        return None;
    }
    let mut rank_sums = vec![0.0; k];
    let mut ties = 0.0;
    for block in blocks {
        for (j, r) in stats::ranks(block).into_iter().enumerate() {
            rank_sums[j] += r;
        }
        ties += stats::tie_term(block);
    }
    let (nf, kf) = (n as f64, k as f64);
    let q = 12.0 / (nf * kf * (kf + 1.0)) * rank_sums.iter().map(|r| r * r).sum::<f64>()
        - 3.0 * nf * (kf + 1.0);
    let correction = 1.0 - ties / (nf * (kf.powi(3) - kf));
    if correction <= 1e-15 {
        return None;
    }
    let stat = q / correction;
    let df = kf - 1.0;
    Some(TestResult {
        statistic: stat,
        df,
        p_value: special::chi2_sf(stat, df),
    })
}

// ── Contingency tables ────────────────────────────────────────────────

/// Chi-square test of independence with its expected counts.
#[derive(Debug, Clone, PartialEq)]
pub struct ChiSquareResult {
    pub statistic: f64,
    pub df: f64,
    pub p_value: f64,
    /// Row-major expected frequencies.
    pub expected: Vec<f64>,
    /// Whether Yates' continuity correction was applied.
    pub yates: bool,
}

impl ChiSquareResult {
    /// Smallest expected cell count.
    pub fn min_expected(&self) -> f64 {
        self.expected.iter().copied().fold(f64::INFINITY, f64::min)
    }
}

/// Pearson chi-square test of independence on a row-major `n_rows × n_cols`
/// table. Yates' continuity correction is applied to 2×2 tables when
/// `yates_on_2x2` is set.
pub fn chi_squared_independence(
    table: &[f64],
    n_rows: usize,
    n_cols: usize,
    yates_on_2x2: bool,
) -> Option<ChiSquareResult> {
    if n_rows < 2 || n_cols < 2 || table.len() != n_rows * n_cols {
        return None;
    }
    if table.iter().any(|v| *v < 0.0 || !v.is_finite()) {
        return None;
    }
    let row_sums: Vec<f64> = (0..n_rows)
        .map(|i| table[i * n_cols..(i + 1) * n_cols].iter().sum())
        .collect();
    let col_sums: Vec<f64> = (0..n_cols)
        .map(|j| (0..n_rows).map(|i| table[i * n_cols + j]).sum())
        .collect();
    let total: f64 = row_sums.iter().sum();
    if total <= 0.0 || row_sums.iter().chain(&col_sums).any(|s| *s <= 0.0) {
        return None;
    }

    let yates = yates_on_2x2 && n_rows == 2 && n_cols == 2;
    let mut expected = Vec::with_capacity(table.len());
    let mut chi2 = 0.0;
    for i in 0..n_rows {
        for j in 0..n_cols {
            let e = row_sums[i] * col_sums[j] / total;
            let mut diff = (table[i * n_cols + j] - e).abs();
            if yates {
                diff -= diff.min(0.5);
            }
            chi2 += diff * diff / e;
            expected.push(e);
        }
    }
    let df = ((n_rows - 1) * (n_cols - 1)) as f64;
    Some(ChiSquareResult {
        statistic: chi2,
        df,
        p_value: special::chi2_sf(chi2, df),
        expected,
        yates,
    })
}

/// Two-sided Fisher exact test on the 2×2 table `[[a, b], [c, d]]`.
///
/// The statistic is the sample odds ratio (infinite when `b·c = 0`).
pub fn fisher_exact_test(a: u64, b: u64, c: u64, d: u64) -> Option<TestResult> {
    use statrs::stats_tests::{fishers_exact_with_odds_ratio, Alternative};

    if a + b == 0 || c + d == 0 || a + c == 0 || b + d == 0 {
        return None;
    }
    let (odds_ratio, p_value) =
        fishers_exact_with_odds_ratio(&[a, b, c, d], Alternative::TwoSided).ok()?;
    Some(TestResult {
        statistic: odds_ratio,
        df: 0.0,
        p_value: p_value.min(1.0),
    })
}

// ── Multiple comparisons ──────────────────────────────────────────────

/// Holm step-down adjustment. Output is in input order.
///
/// ```
/// use u_labstat::testing::holm_correction;
///
/// let adj = holm_correction(&[0.01, 0.04, 0.03]).unwrap();
/// assert!((adj[0] - 0.03).abs() < 1e-12);
/// assert!((adj[1] - 0.06).abs() < 1e-12);
/// assert!((adj[2] - 0.06).abs() < 1e-12);
/// ```
pub fn holm_correction(p_values: &[f64]) -> Option<Vec<f64>> {
    if p_values.is_empty() || p_values.iter().any(|p| !p.is_finite()) {
        return None;
    }
    let m = p_values.len();
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&i, &j| p_values[i].total_cmp(&p_values[j]));
    let mut adjusted = vec![0.0; m];
    let mut running = 0.0f64;
    for (rank, &idx) in order.iter().enumerate() {
        let candidate = ((m - rank) as f64 * p_values[idx]).min(1.0);
        running = running.max(candidate);
        adjusted[idx] = running;
    }
    Some(adjusted)
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn student_matches_reference() {
        // pooled sd = sqrt(2.5), se = 1
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [2.5, 3.5, 4.5, 5.5, 6.5];
        let r = student_t_test(&a, &b).unwrap();
        assert!((r.statistic + 1.5).abs() < 1e-10);
        assert_eq!(r.df, 8.0);
        assert!((r.p_value - 0.1720).abs() < 1e-4);
    }

    #[test]
    fn welch_df_between_bounds() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [10.0, 20.0, 15.0, 30.0, 12.0, 18.0];
        let r = welch_t_test(&a, &b).unwrap();
        assert!(r.df > 4.0 && r.df < 9.0);
        assert!(r.p_value < 0.05);
    }

    #[test]
    fn constant_samples_not_computable() {
        assert!(student_t_test(&[1.0, 1.0], &[1.0, 1.0]).is_none());
        assert!(one_sample_t_test(&[2.0, 2.0, 2.0], 0.0).is_none());
        assert!(shapiro_wilk_test(&[3.0; 10]).is_none());
    }

    #[test]
    fn anova_three_groups() {
        let g1 = [5.0, 6.0, 7.0, 5.5, 6.5];
        let g2 = [8.0, 9.0, 8.5, 9.5, 8.0];
        let g3 = [4.0, 3.0, 3.5, 4.5, 4.0];
        let r = one_way_anova(&[&g1, &g2, &g3]).unwrap();
        assert_eq!(r.df_between, 2);
        assert_eq!(r.df_within, 12);
        assert!(r.p_value < 0.001);
        assert!((r.ss_between + r.ss_within - 63.2333).abs() < 1e-3);
    }

    #[test]
    fn anova_needs_two_groups() {
        assert!(one_way_anova(&[&[1.0, 2.0, 3.0]]).is_none());
    }

    #[test]
    fn levene_detects_spread_difference() {
        let tight = [4.9, 5.0, 5.0, 5.1, 5.0];
        let wide = [0.0, 3.0, 5.0, 7.0, 10.0];
        assert!(levene_test(&[&tight, &wide]).unwrap().p_value < 0.05);
    }

    #[test]
    fn shapiro_reference_value() {
        // right-skewed sample, W ≈ 0.789
        let data = [148.0, 154.0, 158.0, 160.0, 161.0, 162.0, 166.0, 170.0, 182.0, 195.0, 236.0];
        let r = shapiro_wilk_test(&data).unwrap();
        assert!((r.w - 0.79).abs() < 0.01, "w = {}", r.w);
        assert!(r.p_value < 0.01);
    }

    #[test]
    fn shapiro_normal_scores_pass() {
        let n = 30;
        let data: Vec<f64> = (1..=n)
            .map(|i| special::normal_quantile((i as f64 - 0.375) / (n as f64 + 0.25)))
            .collect();
        let r = shapiro_wilk_test(&data).unwrap();
        assert!(r.w > 0.98);
        assert!(r.p_value > 0.5);
    }

    #[test]
    fn shapiro_three_points() {
        let r = shapiro_wilk_test(&[1.0, 2.0, 3.0]).unwrap();
        assert!((r.w - 1.0).abs() < 1e-12);
        assert!((r.p_value - 1.0).abs() < 1e-6);
    }

    #[test]
    fn shapiro_size_window() {
        assert!(shapiro_wilk_test(&[1.0, 2.0]).is_none());
        let big: Vec<f64> = (0..5001).map(|i| i as f64).collect();
        assert!(shapiro_wilk_test(&big).is_none());
    }

    #[test]
    fn mann_whitney_separated() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [6.0, 7.0, 8.0, 9.0, 10.0];
        let r = mann_whitney_u_test(&a, &b).unwrap();
        assert_eq!(r.statistic, 0.0);
        assert!(r.p_value < 0.05);
    }

    #[test]
    fn wilcoxon_shift() {
        let before = [5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        let after = [6.1, 7.3, 8.2, 9.4, 10.1, 11.6, 12.2, 13.5];
        let r = wilcoxon_signed_rank_test(&after, &before).unwrap();
        assert_eq!(r.statistic, 36.0);
        assert!(r.p_value < 0.05);
    }

    #[test]
    fn wilcoxon_no_positive_differences_gives_positive_zero() {
        let before = [5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        let after = [6.1, 7.3, 8.2, 9.4, 10.1, 11.6, 12.2, 13.5];
        let r = wilcoxon_signed_rank_test(&before, &after).unwrap();
        assert_eq!(r.statistic.to_bits(), 0.0f64.to_bits());
        assert!(r.p_value < 0.05);
    }

    #[test]
    fn wilcoxon_all_zero_differences() {
        assert!(wilcoxon_signed_rank_test(&[1.0, 2.0], &[1.0, 2.0]).is_none());
    }

    #[test]
    fn kruskal_separated() {
        let g1 = [1.0, 2.0, 3.0, 4.0, 5.0];
        let g2 = [6.0, 7.0, 8.0, 9.0, 10.0];
        let g3 = [11.0, 12.0, 13.0, 14.0, 15.0];
        let r = kruskal_wallis_test(&[&g1, &g2, &g3]).unwrap();
        assert!((r.statistic - 12.5).abs() < 1e-10);
        assert!(r.p_value < 0.01);
    }

    #[test]
    fn friedman_consistent_ordering() {
        // every subject ranks the conditions the same way
        let blocks: Vec<Vec<f64>> = (0..6)
            .map(|i| vec![i as f64, i as f64 + 1.0, i as f64 + 2.5])
            .collect();
        let r = friedman_test(&blocks).unwrap();
        assert!((r.statistic - 12.0).abs() < 1e-10);
        assert_eq!(r.df, 2.0);
        assert!(r.p_value < 0.01);
    }

    #[test]
    fn friedman_ragged_rejected() {
        assert!(friedman_test(&[vec![1.0, 2.0], vec![1.0]]).is_none());
    }

    #[test]
    fn chi_square_reference() {
        let r = chi_squared_independence(&[30.0, 10.0, 20.0, 40.0], 2, 2, false).unwrap();
        assert!((r.statistic - 16.6667).abs() < 1e-3);
        assert!(r.p_value < 0.001);
        assert!(!r.yates);
        let corrected = chi_squared_independence(&[30.0, 10.0, 20.0, 40.0], 2, 2, true).unwrap();
        assert!(corrected.yates);
        assert!(corrected.statistic < r.statistic);
        assert!((corrected.statistic - 15.0417).abs() < 1e-3);
    }

    #[test]
    fn chi_square_expected_counts() {
        let r = chi_squared_independence(&[2.0, 1.0, 1.0, 2.0], 2, 2, true).unwrap();
        assert!((r.min_expected() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn chi_square_zero_margin() {
        assert!(chi_squared_independence(&[0.0, 0.0, 1.0, 2.0], 2, 2, false).is_none());
    }

    #[test]
    fn fisher_tea_tasting() {
        let r = fisher_exact_test(3, 1, 1, 3).unwrap();
        assert!((r.p_value - 0.4857).abs() < 1e-3);
        assert!((r.statistic - 9.0).abs() < 1e-12);
    }

    #[test]
    fn holm_monotone_example() {
        let adj = holm_correction(&[0.04, 0.001, 0.03, 0.5]).unwrap();
        assert!((adj[1] - 0.004).abs() < 1e-12);
        assert!((adj[2] - 0.09).abs() < 1e-12);
        assert!((adj[0] - 0.09).abs() < 1e-12);
        assert!((adj[3] - 0.5).abs() < 1e-12);
        assert!(holm_correction(&[]).is_none());
    }

    proptest! {
        #[test]
        fn holm_never_below_raw(ps in proptest::collection::vec(0.0f64..=1.0, 1..20)) {
            let adj = holm_correction(&ps).unwrap();
            for (raw, a) in ps.iter().zip(&adj) {
                prop_assert!(*a >= *raw - 1e-15);
                prop_assert!(*a <= 1.0);
            }
            // monotone in the raw ordering
            let mut order: Vec<usize> = (0..ps.len()).collect();
            order.sort_by(|&i, &j| ps[i].total_cmp(&ps[j]));
            for w in order.windows(2) {
                prop_assert!(adj[w[0]] <= adj[w[1]] + 1e-15);
            }
        }
    }
}
