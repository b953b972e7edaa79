//! Univariate outlier screening.
//!
//! Three interchangeable methods flag extreme values in a numeric sample:
//!
//! | Method | Rule | Default threshold |
//! |--------|------|-------------------|
//! | [`Iqr`](OutlierMethod::Iqr) | outside `[Q1 − k·IQR, Q3 + k·IQR]` | k = 1.5 |
//! | [`StdDev`](OutlierMethod::StdDev) | more than k standard deviations from the mean | k = 3.0 |
//! | [`Grubbs`](OutlierMethod::Grubbs) | single most extreme value if G exceeds the critical value | α = 0.05 |
//!
//! Missing values (NaN) are ignored and never flagged. Samples with fewer
//! than two distinct values always produce an all-false mask. Bounds are
//! exclusive: a value exactly on a fence is kept.
//!
//! ```
//! use u_labstat::outlier::{detect, OutlierMethod};
//!
//! let sample = [10.2, 9.8, 10.1, 10.0, 9.9, 25.0, f64::NAN];
//! let report = detect(&sample, OutlierMethod::Iqr, None);
//! assert_eq!(report.mask, vec![false, false, false, false, false, true, false]);
//! assert_eq!(report.excluded_count(), 1);
//! ```

use crate::special;
use crate::stats;
use serde::Serialize;

// ── Method ────────────────────────────────────────────────────────────

/// Outlier detection method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierMethod {
    Iqr,
    StdDev,
    Grubbs,
}

impl OutlierMethod {
    /// Parses a method name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "iqr" => Some(Self::Iqr),
            "std" | "sd" | "stddev" | "std_dev" | "zscore" | "z-score" => Some(Self::StdDev),
            "grubbs" => Some(Self::Grubbs),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Iqr => "iqr",
            Self::StdDev => "std",
            Self::Grubbs => "grubbs",
        }
    }

    /// Threshold used when the caller supplies none.
    pub fn default_threshold(self) -> f64 {
        match self {
            Self::Iqr => 1.5,
            Self::StdDev => 3.0,
            Self::Grubbs => 0.05,
        }
    }
}

impl std::fmt::Display for OutlierMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Report ────────────────────────────────────────────────────────────

/// Method-specific detail behind a mask.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutlierMetadata {
    /// Nothing was computed (degenerate sample).
    None,
    Iqr {
        q1: f64,
        q3: f64,
        iqr: f64,
        lower: f64,
        upper: f64,
    },
    StdDev {
        mean: f64,
        std_dev: f64,
        lower: f64,
        upper: f64,
    },
    Grubbs {
        statistic: f64,
        critical_value: f64,
        alpha: f64,
        /// Position of the most extreme value in the input sample.
        outlier_index: usize,
    },
}

/// Outcome of one detection run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutlierReport {
    pub method: OutlierMethod,
    /// Threshold actually applied (α for Grubbs).
    pub threshold: f64,
    /// One flag per input value.
    pub mask: Vec<bool>,
    pub metadata: OutlierMetadata,
    pub notes: Vec<String>,
}

impl OutlierReport {
    fn clean(method: OutlierMethod, threshold: f64, len: usize) -> Self {
        Self {
            method,
            threshold,
            mask: vec![false; len],
            metadata: OutlierMetadata::None,
            notes: Vec::new(),
        }
    }

    /// Number of flagged values.
    pub fn excluded_count(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }
}

// ── Detection ─────────────────────────────────────────────────────────

/// Flags outliers in `sample` with `method`.
///
/// `threshold` overrides the method default. For Grubbs it is the
/// significance level and only accepted inside (0, 0.5); anything else
/// falls back to α = 0.05 with a note.
pub fn detect(sample: &[f64], method: OutlierMethod, threshold: Option<f64>) -> OutlierReport {
    let valid: Vec<(usize, f64)> = sample
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .map(|(i, &v)| (i, v))
        .collect();
    let values: Vec<f64> = valid.iter().map(|&(_, v)| v).collect();

    let mut notes = Vec::new();
    let threshold = match (method, threshold) {
        (OutlierMethod::Grubbs, Some(t)) if t > 0.0 && t < 0.5 => t,
        (OutlierMethod::Grubbs, Some(t)) => {
            notes.push(format!(
                "Grubbs threshold {t} is not a significance level in (0, 0.5); alpha = 0.05 used"
            ));
            0.05
        }
        (_, Some(t)) if t.is_finite() && t > 0.0 => t,
        (m, _) => m.default_threshold(),
    };

    let mut report = OutlierReport::clean(method, threshold, sample.len());
    report.notes = notes;
    if stats::distinct_count(&values) < 2 {
        return report;
    }

    match method {
        OutlierMethod::Iqr => detect_iqr(&valid, &values, threshold, &mut report),
        OutlierMethod::StdDev => detect_std(&valid, &values, threshold, &mut report),
        OutlierMethod::Grubbs => detect_grubbs(&valid, &values, threshold, &mut report),
    }
    report
}

/// Like [`detect`] but takes the method by name; unknown names fall back
/// to IQR with a note.
pub fn detect_named(sample: &[f64], name: &str, threshold: Option<f64>) -> OutlierReport {
    match OutlierMethod::from_name(name) {
        Some(method) => detect(sample, method, threshold),
        None => {
            tracing::warn!(method = name, "unknown outlier method, using IQR");
            // the caller's threshold belongs to a different method
            let mut report = detect(sample, OutlierMethod::Iqr, None);
            report
                .notes
                .push(format!("Unknown outlier method '{name}'; IQR (k = 1.5) used instead"));
            report
        }
    }
}

fn detect_iqr(valid: &[(usize, f64)], values: &[f64], k: f64, report: &mut OutlierReport) {
    let (Some(q1), Some(q3)) = (stats::quantile(values, 0.25), stats::quantile(values, 0.75)) else {
        return;
    };
    let iqr = q3 - q1;
    if iqr == 0.0 {
        return;
    }
    let (lower, upper) = (q1 - k * iqr, q3 + k * iqr);
    for &(idx, v) in valid {
        report.mask[idx] = v < lower || v > upper;
    }
    report.metadata = OutlierMetadata::Iqr {
        q1,
        q3,
        iqr,
        lower,
        upper,
    };
}

fn detect_std(valid: &[(usize, f64)], values: &[f64], k: f64, report: &mut OutlierReport) {
    let (Some(mean), Some(std_dev)) = (stats::mean(values), stats::std_dev(values)) else {
        return;
    };
    if std_dev == 0.0 {
        return;
    }
    let (lower, upper) = (mean - k * std_dev, mean + k * std_dev);
    for &(idx, v) in valid {
        report.mask[idx] = v < lower || v > upper;
    }
    report.metadata = OutlierMetadata::StdDev {
        mean,
        std_dev,
        lower,
        upper,
    };
}

fn detect_grubbs(valid: &[(usize, f64)], values: &[f64], alpha: f64, report: &mut OutlierReport) {
    let n = values.len();
    if n < 3 {
        report
            .notes
            .push("Grubbs test requires at least 3 values; nothing flagged".to_string());
        return;
    }
    let (Some(mean), Some(sd)) = (stats::mean(values), stats::std_dev(values)) else {
        return;
    };
    if sd < 1e-15 {
        return;
    }
    let Some(&(idx, value)) = valid
        .iter()
        .max_by(|a, b| (a.1 - mean).abs().total_cmp(&(b.1 - mean).abs()))
    else {
        return;
    };
    let statistic = (value - mean).abs() / sd;

    // G_crit = (n−1)/√n · √(t² / (n − 2 + t²)), t at α/(2n) with n−2 df
    let df = (n - 2) as f64;
    let t = special::t_quantile(1.0 - alpha / (2.0 * n as f64), df);
    let critical_value = ((n - 1) as f64 / (n as f64).sqrt()) * (t * t / (df + t * t)).sqrt();

    if statistic > critical_value {
        report.mask[idx] = true;
    }
    report.metadata = OutlierMetadata::Grubbs {
        statistic,
        critical_value,
        alpha,
        outlier_index: idx,
    };
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn method_names() {
        assert_eq!(OutlierMethod::from_name("IQR"), Some(OutlierMethod::Iqr));
        assert_eq!(OutlierMethod::from_name("sd"), Some(OutlierMethod::StdDev));
        assert_eq!(OutlierMethod::from_name("zscore"), Some(OutlierMethod::StdDev));
        assert_eq!(OutlierMethod::from_name(" grubbs "), Some(OutlierMethod::Grubbs));
        assert_eq!(OutlierMethod::from_name("lof"), None);
    }

    #[test]
    fn iqr_bounds_and_exclusive_fence() {
        // type-7 quartiles of five values are the 2nd and 4th order statistics
        let sample = [0.0, 1.0, 2.0, 3.0, 6.0];
        let report = detect(&sample, OutlierMethod::Iqr, Some(1.5));
        match report.metadata {
            OutlierMetadata::Iqr {
                q1,
                q3,
                iqr,
                lower,
                upper,
            } => {
                assert_eq!((q1, q3, iqr), (1.0, 3.0, 2.0));
                assert_eq!(lower, q1 - 1.5 * iqr);
                assert_eq!(upper, q3 + 1.5 * iqr);
                assert_eq!(upper, 6.0);
            }
            ref other => panic!("unexpected metadata {other:?}"),
        }
        // 6.0 sits exactly on the upper fence
        assert!(report.mask.iter().all(|&m| !m));
    }

    #[test]
    fn iqr_zero_spread_flags_nothing() {
        let sample = [5.0, 5.0, 5.0, 5.0, 5.0, 5.0, 100.0];
        let report = detect(&sample, OutlierMethod::Iqr, None);
        assert_eq!(report.excluded_count(), 0);
    }

    #[test]
    fn std_dev_flags_far_point() {
        let mut sample: Vec<f64> = (0..30).map(|i| 10.0 + (i % 5) as f64 * 0.1).collect();
        sample.push(30.0);
        let report = detect(&sample, OutlierMethod::StdDev, Some(3.0));
        assert_eq!(report.excluded_count(), 1);
        assert!(report.mask[30]);
        assert!(matches!(report.metadata, OutlierMetadata::StdDev { .. }));
    }

    #[test]
    fn grubbs_flags_single_extreme() {
        let sample = [2.0, 2.1, 2.2, 2.0, 2.1, 2.3, 50.0];
        let report = detect(&sample, OutlierMethod::Grubbs, None);
        assert_eq!(report.mask, vec![false, false, false, false, false, false, true]);
        match report.metadata {
            OutlierMetadata::Grubbs {
                statistic,
                critical_value,
                alpha,
                outlier_index,
            } => {
                assert!(statistic > critical_value);
                assert_eq!(alpha, 0.05);
                assert_eq!(outlier_index, 6);
            }
            ref other => panic!("unexpected metadata {other:?}"),
        }
    }

    #[test]
    fn grubbs_critical_value_reference() {
        // tabulated two-sided critical value for n = 10, α = 0.05: 2.290
        let sample = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        let report = detect(&sample, OutlierMethod::Grubbs, Some(0.05));
        match report.metadata {
            OutlierMetadata::Grubbs { critical_value, .. } => {
                assert!((critical_value - 2.290).abs() < 2e-3, "{critical_value}")
            }
            ref other => panic!("unexpected metadata {other:?}"),
        }
        assert_eq!(report.excluded_count(), 0);
    }

    #[test]
    fn grubbs_needs_three_values() {
        let report = detect(&[1.0, 100.0], OutlierMethod::Grubbs, None);
        assert_eq!(report.mask, vec![false, false]);
        assert_eq!(report.metadata, OutlierMetadata::None);
        assert!(!report.notes.is_empty());
    }

    #[test]
    fn grubbs_threshold_reinterpretation() {
        let sample = [2.0, 2.1, 2.2, 2.0, 2.1, 2.3, 50.0];
        let strict = detect(&sample, OutlierMethod::Grubbs, Some(0.01));
        assert_eq!(strict.threshold, 0.01);
        assert!(strict.notes.is_empty());
        let ignored = detect(&sample, OutlierMethod::Grubbs, Some(3.0));
        assert_eq!(ignored.threshold, 0.05);
        assert_eq!(ignored.notes.len(), 1);
    }

    #[test]
    fn unknown_method_falls_back_to_iqr() {
        let sample = [10.2, 9.8, 10.1, 10.0, 9.9, 25.0];
        let report = detect_named(&sample, "mahalanobis", Some(0.2));
        assert_eq!(report.method, OutlierMethod::Iqr);
        assert_eq!(report.threshold, 1.5);
        assert!(report.notes[0].contains("mahalanobis"));
        assert!(report.mask[5]);
    }

    #[test]
    fn missing_values_never_flagged() {
        let sample = [f64::NAN, 1.0, 1.1, 0.9, 1.0, 50.0];
        let report = detect(&sample, OutlierMethod::Iqr, None);
        assert!(!report.mask[0]);
        assert!(report.mask[5]);
        assert_eq!(report.mask.len(), sample.len());
    }

    #[test]
    fn empty_sample() {
        for m in [OutlierMethod::Iqr, OutlierMethod::StdDev, OutlierMethod::Grubbs] {
            let report = detect(&[], m, None);
            assert!(report.mask.is_empty());
            assert_eq!(report.metadata, OutlierMetadata::None);
        }
    }

    fn any_method() -> impl Strategy<Value = OutlierMethod> {
        prop_oneof![
            Just(OutlierMethod::Iqr),
            Just(OutlierMethod::StdDev),
            Just(OutlierMethod::Grubbs)
        ]
    }

    proptest! {
        #[test]
        fn degenerate_samples_never_flag(
            value in -1e6f64..1e6,
            len in 0usize..40,
            nan_every in 2usize..6,
            method in any_method(),
        ) {
            let sample: Vec<f64> = (0..len)
                .map(|i| if i % nan_every == 0 { f64::NAN } else { value })
                .collect();
            let report = detect(&sample, method, None);
            prop_assert_eq!(report.mask.len(), sample.len());
            prop_assert!(report.mask.iter().all(|&m| !m));
        }

        #[test]
        fn grubbs_flags_at_most_one(sample in proptest::collection::vec(-100.0f64..100.0, 0..60)) {
            let report = detect(&sample, OutlierMethod::Grubbs, Some(0.2));
            prop_assert!(report.excluded_count() <= 1);
            if sample.len() < 3 {
                prop_assert_eq!(report.excluded_count(), 0);
            }
        }

        #[test]
        fn iqr_flags_strictly_outside(sample in proptest::collection::vec(-50.0f64..50.0, 2..60)) {
            let report = detect(&sample, OutlierMethod::Iqr, None);
            prop_assert_eq!(report.mask.len(), sample.len());
            if let OutlierMetadata::Iqr { lower, upper, .. } = report.metadata {
                for (v, flagged) in sample.iter().zip(&report.mask) {
                    prop_assert_eq!(*flagged, *v < lower || *v > upper);
                }
            }
        }

        #[test]
        fn detection_is_deterministic(sample in proptest::collection::vec(-50.0f64..50.0, 0..40)) {
            let a = detect(&sample, OutlierMethod::StdDev, Some(2.0));
            let b = detect(&sample, OutlierMethod::StdDev, Some(2.0));
            prop_assert_eq!(a, b);
        }
    }
}
