//! Linear models on factor and covariate designs.
//!
//! Factors are effects-coded (sum-to-zero), covariates are centred, and
//! every model carries an intercept. [`LinearModel::anova`] produces a
//! Type II table: each term is tested after every other term that does
//! not contain it, which keeps main effects meaningful in unbalanced
//! designs.
//!
//! ```
//! use u_labstat::linear_model::{Factor, LinearModel};
//!
//! let dose: Vec<String> = ["lo", "lo", "lo", "hi", "hi", "hi"].iter().map(|s| s.to_string()).collect();
//! let model = LinearModel::new(vec![1.0, 2.0, 3.0, 7.0, 8.0, 9.0])
//!     .with_factor(Factor::from_labels("dose", &dose))
//!     .unwrap();
//! let table = model.anova(&model.full_factorial()).unwrap();
//! let row = table.term("dose").unwrap();
//! assert_eq!(row.df, 1);
//! assert!((row.ss - 54.0).abs() < 1e-9);
//! ```

use crate::error::EngineError;
use crate::report::{Cell, ResultTable};
use crate::special;
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeSet;
use std::ops::Range;

/// Relative singular-value cutoff below which a design counts as singular.
const RANK_TOLERANCE: f64 = 1e-9;

// ── Model inputs ──────────────────────────────────────────────────────

/// A categorical predictor. Levels are sorted; `codes[i]` indexes `levels`.
#[derive(Debug, Clone, PartialEq)]
pub struct Factor {
    pub name: String,
    pub levels: Vec<String>,
    pub codes: Vec<usize>,
}

impl Factor {
    pub fn from_labels(name: &str, labels: &[String]) -> Self {
        let levels: Vec<String> = labels
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let codes = labels
            .iter()
            .map(|l| levels.binary_search(l).unwrap_or(0))
            .collect();
        Self {
            name: name.to_string(),
            levels,
            codes,
        }
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }
}

/// A continuous predictor.
#[derive(Debug, Clone, PartialEq)]
pub struct Covariate {
    pub name: String,
    pub values: Vec<f64>,
}

/// One component of a model term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Part {
    Factor(usize),
    Covariate(usize),
}

/// A main effect (one part) or an interaction (several parts).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Term {
    pub parts: Vec<Part>,
}

impl Term {
    pub fn factor(index: usize) -> Self {
        Self {
            parts: vec![Part::Factor(index)],
        }
    }

    pub fn covariate(index: usize) -> Self {
        Self {
            parts: vec![Part::Covariate(index)],
        }
    }

    pub fn interaction(parts: &[Part]) -> Self {
        let mut parts = parts.to_vec();
        parts.sort();
        parts.dedup();
        Self { parts }
    }

    /// Order of the term (1 for main effects).
    pub fn order(&self) -> usize {
        self.parts.len()
    }

    /// True when every part of `other` is in `self` and `self` is larger.
    pub fn strictly_contains(&self, other: &Term) -> bool {
        self.parts.len() > other.parts.len() && other.parts.iter().all(|p| self.parts.contains(p))
    }

    fn factor_indices(&self) -> Vec<usize> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Factor(i) => Some(*i),
                Part::Covariate(_) => None,
            })
            .collect()
    }
}

// ── Fit results ───────────────────────────────────────────────────────

/// Ordinary least-squares fit.
#[derive(Debug, Clone, PartialEq)]
pub struct OlsFit {
    pub coefficients: DVector<f64>,
    pub rss: f64,
    pub df_residual: usize,
}

/// One line of an ANOVA table.
#[derive(Debug, Clone, PartialEq)]
pub struct AnovaRow {
    pub source: String,
    pub ss: f64,
    pub df: usize,
    pub ms: f64,
    pub f: f64,
    pub p_value: f64,
}

/// Type II ANOVA table.
#[derive(Debug, Clone, PartialEq)]
pub struct AnovaTable {
    pub rows: Vec<AnovaRow>,
    pub residual_ss: f64,
    pub residual_df: usize,
}

impl AnovaTable {
    /// Residual mean square.
    pub fn mse(&self) -> f64 {
        self.residual_ss / self.residual_df as f64
    }

    pub fn term(&self, source: &str) -> Option<&AnovaRow> {
        self.rows.iter().find(|r| r.source == source)
    }

    /// `Source, SS, df, MS, F, p` with a trailing Residual row.
    pub fn to_result_table(&self) -> ResultTable {
        let mut table = ResultTable::new(&["Source", "SS", "df", "MS", "F", "p"]);
        for r in &self.rows {
            table.push(vec![
                Cell::text(&r.source),
                Cell::num(r.ss),
                Cell::count(r.df),
                Cell::num(r.ms),
                Cell::num(r.f),
                Cell::num(r.p_value),
            ]);
        }
        table.push(vec![
            Cell::text("Residual"),
            Cell::num(self.residual_ss),
            Cell::count(self.residual_df),
            Cell::num(self.mse()),
        ]);
        table
    }
}

// ── Model ─────────────────────────────────────────────────────────────

/// Response plus predictors, all of equal length.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    y: Vec<f64>,
    factors: Vec<Factor>,
    covariates: Vec<Covariate>,
}

impl LinearModel {
    pub fn new(y: Vec<f64>) -> Self {
        Self {
            y,
            factors: Vec::new(),
            covariates: Vec::new(),
        }
    }

    pub fn with_factor(mut self, factor: Factor) -> Result<Self, EngineError> {
        if factor.codes.len() != self.y.len() {
            return Err(EngineError::DimensionMismatch {
                expected: self.y.len(),
                actual: factor.codes.len(),
            });
        }
        self.factors.push(factor);
        Ok(self)
    }

    pub fn with_covariate(mut self, name: &str, values: Vec<f64>) -> Result<Self, EngineError> {
        if values.len() != self.y.len() {
            return Err(EngineError::DimensionMismatch {
                expected: self.y.len(),
                actual: values.len(),
            });
        }
        self.covariates.push(Covariate {
            name: name.to_string(),
            values,
        });
        Ok(self)
    }

    pub fn n(&self) -> usize {
        self.y.len()
    }

    pub fn response(&self) -> &[f64] {
        &self.y
    }

    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    /// Display name, e.g. `dose`, `dose:sex`.
    pub fn term_name(&self, term: &Term) -> String {
        let names: Vec<&str> = term
            .parts
            .iter()
            .map(|p| match p {
                Part::Factor(i) => self.factors[*i].name.as_str(),
                Part::Covariate(i) => self.covariates[*i].name.as_str(),
            })
            .collect();
        names.join(":")
    }

    /// Every main effect and interaction of the factors, lowest order first.
    pub fn full_factorial(&self) -> Vec<Term> {
        let k = self.factors.len();
        let mut terms: Vec<Term> = (1u32..(1 << k))
            .map(|mask| {
                let parts: Vec<Part> = (0..k)
                    .filter(|i| mask & (1 << i) != 0)
                    .map(Part::Factor)
                    .collect();
                Term { parts }
            })
            .collect();
        terms.sort_by(|a, b| a.order().cmp(&b.order()).then_with(|| a.parts.cmp(&b.parts)));
        terms
    }

    fn part_columns(&self, part: Part) -> Vec<Vec<f64>> {
        match part {
            Part::Factor(i) => {
                let f = &self.factors[i];
                let last = f.level_count().saturating_sub(1);
                (0..last)
                    .map(|j| {
                        f.codes
                            .iter()
                            .map(|&c| {
                                if c == j {
                                    1.0
                                } else if c == last {
                                    -1.0
                                } else {
                                    0.0
                                }
                            })
                            .collect()
                    })
                    .collect()
            }
            Part::Covariate(i) => {
                let v = &self.covariates[i].values;
                let m = v.iter().sum::<f64>() / v.len().max(1) as f64;
                vec![v.iter().map(|x| x - m).collect()]
            }
        }
    }

    fn term_columns(&self, term: &Term) -> Vec<Vec<f64>> {
        let mut cols = vec![vec![1.0; self.n()]];
        for &part in &term.parts {
            let part_cols = self.part_columns(part);
            let mut next = Vec::with_capacity(cols.len() * part_cols.len());
            for c in &cols {
                for p in &part_cols {
                    next.push(c.iter().zip(p).map(|(a, b)| a * b).collect());
                }
            }
            cols = next;
        }
        cols
    }

    /// Design matrix (intercept first) and the column range of each term.
    pub fn design(&self, terms: &[Term]) -> (DMatrix<f64>, Vec<Range<usize>>) {
        let mut columns = vec![vec![1.0; self.n()]];
        let mut ranges = Vec::with_capacity(terms.len());
        for term in terms {
            let start = columns.len();
            columns.extend(self.term_columns(term));
            ranges.push(start..columns.len());
        }
        let x = DMatrix::from_fn(self.n(), columns.len(), |r, c| columns[c][r]);
        (x, ranges)
    }

    /// Least-squares fit of `terms` (plus intercept).
    pub fn fit(&self, terms: &[Term]) -> Result<OlsFit, EngineError> {
        if self.y.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::fit("response contains non-finite values"));
        }
        let (x, _) = self.design(terms);
        let p = x.ncols();
        if self.n() <= p {
            return Err(EngineError::insufficient(format!(
                "{} observations for {} model parameters",
                self.n(),
                p
            )));
        }
        if is_rank_deficient(&x) {
            return Err(self.singular_error(terms));
        }
        let y = DVector::from_column_slice(&self.y);
        let xt = x.transpose();
        let chol = (&xt * &x)
            .cholesky()
            .ok_or_else(|| self.singular_error(terms))?;
        let coefficients = chol.solve(&(&xt * &y));
        let resid = &y - &x * &coefficients;
        Ok(OlsFit {
            coefficients,
            rss: resid.norm_squared(),
            df_residual: self.n() - p,
        })
    }

    /// Type II ANOVA over `terms`.
    pub fn anova(&self, terms: &[Term]) -> Result<AnovaTable, EngineError> {
        for f in &self.factors {
            if f.level_count() < 2 {
                return Err(EngineError::insufficient(format!(
                    "factor '{}' has fewer than 2 levels",
                    f.name
                )));
            }
        }
        let full = self.fit(terms)?;
        if full.df_residual == 0 {
            return Err(EngineError::insufficient("no residual degrees of freedom"));
        }
        let mse = full.rss / full.df_residual as f64;

        let mut rows = Vec::with_capacity(terms.len());
        for term in terms {
            let with: Vec<Term> = terms
                .iter()
                .filter(|t| !t.strictly_contains(term))
                .cloned()
                .collect();
            let without: Vec<Term> = with.iter().filter(|t| *t != term).cloned().collect();
            let rss_with = self.fit(&with)?.rss;
            let rss_without = self.fit(&without)?.rss;
            let ss = (rss_without - rss_with).max(0.0);
            let df = self.term_columns(term).len();
            let ms = ss / df as f64;
            let (f, p_value) = if mse > 0.0 {
                let f = ms / mse;
                (f, special::f_sf(f, df as f64, full.df_residual as f64))
            } else if ms > 0.0 {
                (f64::INFINITY, 0.0)
            } else {
                (f64::NAN, f64::NAN)
            };
            rows.push(AnovaRow {
                source: self.term_name(term),
                ss,
                df,
                ms,
                f,
                p_value,
            });
        }
        Ok(AnovaTable {
            rows,
            residual_ss: full.rss,
            residual_df: full.df_residual,
        })
    }

    /// Level combinations of `factors` with no observations, formatted as
    /// `a=x & b=y`.
    pub fn empty_cells(&self, factors: &[usize]) -> Vec<String> {
        let observed: BTreeSet<Vec<usize>> = (0..self.n())
            .map(|row| factors.iter().map(|&f| self.factors[f].codes[row]).collect())
            .collect();
        let mut combo = vec![0usize; factors.len()];
        let mut empty = Vec::new();
        loop {
            if !observed.contains(&combo) {
                let label: Vec<String> = factors
                    .iter()
                    .zip(&combo)
                    .map(|(&f, &c)| format!("{}={}", self.factors[f].name, self.factors[f].levels[c]))
                    .collect();
                empty.push(label.join(" & "));
            }
            // odometer increment
            let mut pos = 0;
            loop {
                if pos == factors.len() {
                    return empty;
                }
                combo[pos] += 1;
                if combo[pos] < self.factors[factors[pos]].level_count() {
                    break;
                }
                combo[pos] = 0;
                pos += 1;
            }
        }
    }

    fn singular_error(&self, terms: &[Term]) -> EngineError {
        let mut missing = BTreeSet::new();
        for term in terms {
            let factors = term.factor_indices();
            if factors.len() >= 2 {
                missing.extend(self.empty_cells(&factors));
            }
        }
        if missing.is_empty() {
            EngineError::fit("design matrix is singular: predictors are collinear")
        } else {
            let list: Vec<String> = missing.into_iter().collect();
            EngineError::fit(format!(
                "design matrix is singular: no observations for {}; drop the interaction or collect data for these combinations",
                list.join(", ")
            ))
        }
    }
}

fn is_rank_deficient(x: &DMatrix<f64>) -> bool {
    let sv = x.clone().svd(false, false).singular_values;
    let max = sv.iter().copied().fold(0.0f64, f64::max);
    let min = sv.iter().copied().fold(f64::INFINITY, f64::min);
    max <= 0.0 || min / max < RANK_TOLERANCE
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::one_way_anova;

    fn labels(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    /// 2×2 design, 3 replicates per cell.
    fn two_by_two() -> LinearModel {
        let a = labels(&["a1", "a1", "a1", "a1", "a1", "a1", "a2", "a2", "a2", "a2", "a2", "a2"]);
        let b = labels(&["b1", "b1", "b1", "b2", "b2", "b2", "b1", "b1", "b1", "b2", "b2", "b2"]);
        let y = vec![
            10.0, 11.0, 12.0, 13.0, 12.5, 14.0, 14.5, 15.0, 16.0, 21.0, 19.5, 20.0,
        ];
        LinearModel::new(y)
            .with_factor(Factor::from_labels("A", &a))
            .unwrap()
            .with_factor(Factor::from_labels("B", &b))
            .unwrap()
    }

    #[test]
    fn one_factor_matches_one_way_anova() {
        let g = labels(&["x", "x", "x", "y", "y", "y", "z", "z", "z", "z"]);
        let y = vec![4.0, 5.0, 6.0, 6.5, 7.0, 8.0, 9.0, 10.0, 8.5, 11.0];
        let model = LinearModel::new(y.clone())
            .with_factor(Factor::from_labels("g", &g))
            .unwrap();
        let table = model.anova(&model.full_factorial()).unwrap();
        let reference = one_way_anova(&[&y[0..3], &y[3..6], &y[6..10]]).unwrap();
        let row = table.term("g").unwrap();
        assert_eq!(row.df, 2);
        assert_eq!(table.residual_df, 7);
        assert!((row.ss - reference.ss_between).abs() < 1e-9);
        assert!((row.f - reference.f_statistic).abs() < 1e-9);
        assert!((row.p_value - reference.p_value).abs() < 1e-9);
    }

    #[test]
    fn balanced_two_way_matches_classical_sums_of_squares() {
        let model = two_by_two();
        let table = model.anova(&model.full_factorial()).unwrap();
        let y = model.response();
        let grand = y.iter().sum::<f64>() / 12.0;
        let cell = |i: usize| y[i * 3..i * 3 + 3].iter().sum::<f64>() / 3.0;
        let cells = [cell(0), cell(1), cell(2), cell(3)];
        let a_means = [(cells[0] + cells[1]) / 2.0, (cells[2] + cells[3]) / 2.0];
        let b_means = [(cells[0] + cells[2]) / 2.0, (cells[1] + cells[3]) / 2.0];
        let ss_a: f64 = a_means.iter().map(|m| 6.0 * (m - grand).powi(2)).sum();
        let ss_b: f64 = b_means.iter().map(|m| 6.0 * (m - grand).powi(2)).sum();
        let ss_cells: f64 = cells.iter().map(|m| 3.0 * (m - grand).powi(2)).sum();
        let ss_ab = ss_cells - ss_a - ss_b;

        assert!((table.term("A").unwrap().ss - ss_a).abs() < 1e-8);
        assert!((table.term("B").unwrap().ss - ss_b).abs() < 1e-8);
        assert!((table.term("A:B").unwrap().ss - ss_ab).abs() < 1e-8);
        assert_eq!(table.residual_df, 8);
        assert!(table.term("A").unwrap().p_value < 0.001);
    }

    #[test]
    fn full_factorial_order() {
        let model = two_by_two();
        let names: Vec<String> = model
            .full_factorial()
            .iter()
            .map(|t| model.term_name(t))
            .collect();
        assert_eq!(names, vec!["A", "B", "A:B"]);
    }

    #[test]
    fn empty_cell_named_in_error() {
        let a = labels(&["a1", "a1", "a1", "a1", "a2", "a2"]);
        let b = labels(&["b1", "b1", "b2", "b2", "b1", "b1"]);
        let model = LinearModel::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .with_factor(Factor::from_labels("A", &a))
            .unwrap()
            .with_factor(Factor::from_labels("B", &b))
            .unwrap();
        assert_eq!(model.empty_cells(&[0, 1]), vec!["A=a2 & B=b2"]);
        let err = model.anova(&model.full_factorial()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("singular"), "{msg}");
        assert!(msg.contains("A=a2 & B=b2"), "{msg}");
    }

    #[test]
    fn covariate_effect_detected() {
        let g = labels(&["c", "c", "c", "c", "c", "t", "t", "t", "t", "t"]);
        let x = vec![1.0, 2.0, 3.0, 4.0, 5.0, 1.5, 2.5, 3.5, 4.5, 5.5];
        let noise = [0.1, -0.2, 0.05, 0.15, -0.1, -0.05, 0.2, -0.15, 0.1, 0.0];
        let y: Vec<f64> = x
            .iter()
            .zip(&g)
            .zip(noise)
            .map(|((x, g), e)| 2.0 * x + if g == "t" { 3.0 } else { 0.0 } + e)
            .collect();
        let model = LinearModel::new(y)
            .with_factor(Factor::from_labels("group", &g))
            .unwrap()
            .with_covariate("weight", x)
            .unwrap();
        let table = model.anova(&[Term::factor(0), Term::covariate(0)]).unwrap();
        assert!(table.term("weight").unwrap().p_value < 1e-6);
        assert!(table.term("group").unwrap().p_value < 1e-6);
        assert_eq!(table.residual_df, 7);
    }

    #[test]
    fn single_level_factor_rejected() {
        let model = LinearModel::new(vec![1.0, 2.0, 3.0])
            .with_factor(Factor::from_labels("g", &labels(&["a", "a", "a"])))
            .unwrap();
        assert!(matches!(
            model.anova(&model.full_factorial()),
            Err(EngineError::InsufficientData { .. })
        ));
    }

    #[test]
    fn length_mismatch() {
        let err = LinearModel::new(vec![1.0, 2.0])
            .with_covariate("x", vec![1.0])
            .unwrap_err();
        assert_eq!(err, EngineError::DimensionMismatch { expected: 2, actual: 1 });
    }

    #[test]
    fn result_table_layout() {
        let model = two_by_two();
        let t = model.anova(&model.full_factorial()).unwrap().to_result_table();
        assert_eq!(t.columns, vec!["Source", "SS", "df", "MS", "F", "p"]);
        assert_eq!(t.len(), 4);
        assert_eq!(t.value("Residual", "df"), Some(8.0));
    }
}
