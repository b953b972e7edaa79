//! Multivariate procedures: one-way MANOVA and the Pearson correlation
//! matrix.
//!
//! MANOVA compares group centroids on several measurements at once. The
//! hypothesis (H) and error (E) SSCP matrices are built from the group
//! means; Pillai's trace is the primary statistic because it is the most
//! robust of the classical four, and Wilks' lambda is reported alongside.

use crate::error::EngineError;
use crate::report::{Cell, ResultTable};
use crate::special;
use nalgebra::{DMatrix, DVector};

/// One multivariate test statistic with its F approximation.
#[derive(Debug, Clone, PartialEq)]
pub struct MultivariateStat {
    pub name: String,
    pub value: f64,
    pub f: f64,
    pub df1: f64,
    pub df2: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManovaResult {
    pub pillai: MultivariateStat,
    pub wilks: MultivariateStat,
    pub n: usize,
    pub groups: usize,
    pub variables: usize,
}

impl ManovaResult {
    pub fn to_result_table(&self) -> ResultTable {
        let mut table = ResultTable::new(&["Statistic", "Value", "F", "df1", "df2", "p"]);
        for s in [&self.pillai, &self.wilks] {
            table.push(vec![
                Cell::text(&s.name),
                Cell::num(s.value),
                Cell::num(s.f),
                Cell::num(s.df1),
                Cell::num(s.df2),
                Cell::num(s.p_value),
            ]);
        }
        table
    }
}

/// One-way MANOVA. `rows[i]` holds the measurements of observation `i`,
/// `groups[i]` its group index in `0..n_groups`.
pub fn manova(rows: &[Vec<f64>], groups: &[usize], n_groups: usize) -> Result<ManovaResult, EngineError> {
    let n = rows.len();
    if groups.len() != n {
        return Err(EngineError::DimensionMismatch {
            expected: n,
            actual: groups.len(),
        });
    }
    let p = rows.first().map_or(0, Vec::len);
    if p == 0 || rows.iter().any(|r| r.len() != p) {
        return Err(EngineError::fit("observations have differing numbers of measurements"));
    }
    if rows.iter().flatten().any(|v| !v.is_finite()) {
        return Err(EngineError::fit("non-finite measurement"));
    }
    let sizes: Vec<usize> = (0..n_groups)
        .map(|g| groups.iter().filter(|&&x| x == g).count())
        .collect();
    let k = sizes.iter().filter(|&&s| s > 0).count();
    if k < 2 {
        return Err(EngineError::insufficient("MANOVA needs at least 2 groups"));
    }
    if n < k + p {
        return Err(EngineError::insufficient(format!(
            "{n} observations are too few for {p} measurements in {k} groups"
        )));
    }

    let to_vec = |r: &Vec<f64>| DVector::from_column_slice(r);
    let grand = rows
        .iter()
        .fold(DVector::zeros(p), |acc, r| acc + to_vec(r))
        / n as f64;
    let mut means = vec![DVector::zeros(p); n_groups];
    for (r, &g) in rows.iter().zip(groups) {
        means[g] += to_vec(r);
    }
    for (m, &s) in means.iter_mut().zip(&sizes) {
        if s > 0 {
            *m /= s as f64;
        }
    }

    let mut h = DMatrix::zeros(p, p);
    for (m, &s) in means.iter().zip(&sizes) {
        if s > 0 {
            let d = m - &grand;
            h += &d * d.transpose() * s as f64;
        }
    }
    let mut e = DMatrix::zeros(p, p);
    for (r, &g) in rows.iter().zip(groups) {
        let d = to_vec(r) - &means[g];
        e += &d * d.transpose();
    }
    let t = &h + &e;

    if is_singular(&e) || is_singular(&t) {
        return Err(EngineError::fit(
            "MANOVA failed: SSCP matrix is singular (collinear measurements)",
        ));
    }
    let t_inv = t
        .clone()
        .try_inverse()
        .ok_or_else(|| EngineError::fit("MANOVA failed: total SSCP matrix is not invertible"))?;
    let det_t = t.determinant();
    let det_e = e.determinant();

    let (nf, pf, q) = (n as f64, p as f64, (k - 1) as f64);
    let df_error = nf - k as f64;

    // Pillai's trace
    let v = (&h * &t_inv).trace();
    let s = pf.min(q);
    let m = ((pf - q).abs() - 1.0) / 2.0;
    let nn = (df_error - pf - 1.0) / 2.0;
    let p_df1 = s * (2.0 * m + s + 1.0);
    let p_df2 = s * (2.0 * nn + s + 1.0);
    let p_f = if s - v > 0.0 {
        (2.0 * nn + s + 1.0) / (2.0 * m + s + 1.0) * v / (s - v)
    } else {
        f64::INFINITY
    };

    // Wilks' lambda, Rao's F
    let lambda = det_e / det_t;
    let denom = pf * pf + q * q - 5.0;
    let tt = if denom > 0.0 {
        ((pf * pf * q * q - 4.0) / denom).sqrt()
    } else {
        1.0
    };
    let w_df1 = pf * q;
    let w_df2 = (df_error - (pf - q + 1.0) / 2.0) * tt - (pf * q - 2.0) / 2.0;
    let root = lambda.powf(1.0 / tt);
    let w_f = (1.0 - root) / root * w_df2 / w_df1;

    Ok(ManovaResult {
        pillai: MultivariateStat {
            name: "Pillai's trace".into(),
            value: v,
            f: p_f,
            df1: p_df1,
            df2: p_df2,
            p_value: special::f_sf(p_f, p_df1, p_df2),
        },
        wilks: MultivariateStat {
            name: "Wilks' lambda".into(),
            value: lambda,
            f: w_f,
            df1: w_df1,
            df2: w_df2,
            p_value: special::f_sf(w_f, w_df1, w_df2),
        },
        n,
        groups: k,
        variables: p,
    })
}

/// Determinant negligible relative to the diagonal product (Hadamard bound).
fn is_singular(m: &DMatrix<f64>) -> bool {
    let scale: f64 = m.diagonal().iter().product();
    let det = m.determinant();
    scale.is_nan() || scale <= 0.0 || det <= scale * 1e-12
}

// ── Correlation ───────────────────────────────────────────────────────

/// Pearson r and its two-sided p-value. `None` with fewer than 3 pairs or a
/// constant variable.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    let n = x.len();
    if n < 3 || y.len() != n {
        return None;
    }
    let mx = x.iter().sum::<f64>() / n as f64;
    let my = y.iter().sum::<f64>() / n as f64;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx).powi(2);
        syy += (b - my).powi(2);
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return None;
    }
    let r = (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0);
    let df = (n - 2) as f64;
    let p = if r.abs() >= 1.0 {
        0.0
    } else {
        special::t_two_sided_p(r * (df / (1.0 - r * r)).sqrt(), df)
    };
    Some((r, p))
}

/// Pairwise-complete Pearson correlations, one row per column pair.
///
/// ```
/// use u_labstat::multivariate::correlation_matrix;
///
/// let cols = vec![
///     ("a".to_string(), vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0)]),
///     ("b".to_string(), vec![Some(2.0), Some(4.1), Some(5.9), Some(8.0)]),
/// ];
/// let table = correlation_matrix(&cols).unwrap();
/// assert!(table.value("a vs b", "r").unwrap() > 0.99);
/// ```
pub fn correlation_matrix(columns: &[(String, Vec<Option<f64>>)]) -> Result<ResultTable, EngineError> {
    if columns.len() < 2 {
        return Err(EngineError::insufficient(
            "correlation matrix needs at least 2 numeric columns",
        ));
    }
    let mut table = ResultTable::new(&["Pair", "Variable 1", "Variable 2", "r", "n", "p"]);
    for i in 0..columns.len() {
        for j in i + 1..columns.len() {
            let (name_a, a) = &columns[i];
            let (name_b, b) = &columns[j];
            let (x, y): (Vec<f64>, Vec<f64>) = a
                .iter()
                .zip(b)
                .filter_map(|(u, v)| Some(((*u)?, (*v)?)))
                .unzip();
            let (r, p) = pearson(&x, &y).map_or((None, None), |(r, p)| (Some(r), Some(p)));
            table.push(vec![
                Cell::text(format!("{name_a} vs {name_b}")),
                Cell::text(name_a),
                Cell::text(name_b),
                Cell::opt(r),
                Cell::count(x.len()),
                Cell::opt(p),
            ]);
        }
    }
    Ok(table)
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::one_way_anova;

    #[test]
    fn single_variable_reduces_to_anova() {
        let a = [4.0, 5.0, 6.0, 5.5];
        let b = [6.5, 7.0, 8.0, 7.5];
        let c = [9.0, 10.0, 8.5, 11.0];
        let rows: Vec<Vec<f64>> = a.iter().chain(&b).chain(&c).map(|v| vec![*v]).collect();
        let groups: Vec<usize> = (0..12).map(|i| i / 4).collect();
        let r = manova(&rows, &groups, 3).unwrap();
        let anova = one_way_anova(&[&a, &b, &c]).unwrap();
        assert!((r.pillai.f - anova.f_statistic).abs() < 1e-8);
        assert!((r.wilks.f - anova.f_statistic).abs() < 1e-8);
        assert_eq!(r.pillai.df1, 2.0);
        assert_eq!(r.pillai.df2, 9.0);
        assert!((r.pillai.p_value - anova.p_value).abs() < 1e-10);
    }

    #[test]
    fn separated_centroids() {
        let mut rows = Vec::new();
        let mut groups = Vec::new();
        let jitter = [-0.3, 0.1, 0.25, -0.1, 0.0, 0.2];
        // centroids (0, 5), (2, 5), (0, 2) span both dimensions
        let centroids = [(0.0, 5.0), (2.0, 5.0), (0.0, 2.0)];
        for (g, (cx, cy)) in centroids.iter().enumerate() {
            for (i, j) in jitter.iter().enumerate() {
                rows.push(vec![cx + j, cy + jitter[(i + 2) % 6]]);
                groups.push(g);
            }
        }
        let r = manova(&rows, &groups, 3).unwrap();
        assert!(r.pillai.p_value < 1e-4);
        assert!(r.wilks.p_value < 1e-4);
        assert!(r.pillai.value > 0.0 && r.pillai.value <= 2.0);
        assert!(r.wilks.value > 0.0 && r.wilks.value < 1.0);
        assert_eq!(r.to_result_table().len(), 2);
    }

    #[test]
    fn collinear_measurements_fail() {
        let rows: Vec<Vec<f64>> = (0..8).map(|i| vec![i as f64, 2.0 * i as f64]).collect();
        let groups: Vec<usize> = (0..8).map(|i| i % 2).collect();
        assert!(matches!(
            manova(&rows, &groups, 2),
            Err(EngineError::StatisticalFit { .. })
        ));
    }

    #[test]
    fn pearson_edge_cases() {
        assert!(pearson(&[1.0, 2.0], &[1.0, 2.0]).is_none());
        assert!(pearson(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]).is_none());
        let (r, p) = pearson(&[1.0, 2.0, 3.0, 4.0], &[4.0, 3.0, 2.0, 1.0]).unwrap();
        assert_eq!(r, -1.0);
        assert_eq!(p, 0.0);
    }

    #[test]
    fn correlation_uses_pairwise_complete_rows() {
        let cols = vec![
            ("a".to_string(), vec![Some(1.0), Some(2.0), None, Some(4.0), Some(5.0)]),
            ("b".to_string(), vec![Some(1.5), None, Some(3.0), Some(4.5), Some(4.0)]),
            ("c".to_string(), vec![Some(3.0), Some(1.0), Some(2.0), Some(5.0), Some(4.0)]),
        ];
        let t = correlation_matrix(&cols).unwrap();
        assert_eq!(t.len(), 3);
        assert_eq!(t.value("a vs b", "n"), Some(3.0));
        assert_eq!(t.value("a vs c", "n"), Some(4.0));
        assert!(correlation_matrix(&cols[..1]).is_err());
    }
}
