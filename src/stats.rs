//! Descriptive statistics.
//!
//! Small `Option`-returning helpers shared by every test: `None` means the
//! quantity is not defined for the input (too few values, non-finite data).
//!
//! ```
//! use u_labstat::stats;
//!
//! let data = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
//! assert_eq!(stats::mean(&data), Some(5.0));
//! assert!((stats::std_dev(&data).unwrap() - 2.138).abs() < 1e-3);
//! assert_eq!(stats::median(&data), Some(4.5));
//! ```

/// Arithmetic mean.
pub fn mean(data: &[f64]) -> Option<f64> {
    if data.is_empty() || data.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(data.iter().sum::<f64>() / data.len() as f64)
}

/// Sample variance (ddof = 1).
pub fn variance(data: &[f64]) -> Option<f64> {
    if data.len() < 2 {
        return None;
    }
    let m = mean(data)?;
    let ss: f64 = data.iter().map(|x| (x - m).powi(2)).sum();
    Some(ss / (data.len() - 1) as f64)
}

/// Sample standard deviation (ddof = 1).
pub fn std_dev(data: &[f64]) -> Option<f64> {
    variance(data).map(f64::sqrt)
}

/// Standard error of the mean.
pub fn sem(data: &[f64]) -> Option<f64> {
    std_dev(data).map(|s| s / (data.len() as f64).sqrt())
}

/// Quantile with linear interpolation between order statistics
/// (Hyndman-Fan type 7, the default of most statistical software).
///
/// `p` must lie in `[0, 1]`.
pub fn quantile(data: &[f64], p: f64) -> Option<f64> {
    if data.is_empty() || !(0.0..=1.0).contains(&p) || data.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(quantile_sorted(&sorted, p))
}

/// Type 7 quantile of data already sorted ascending.
pub fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let h = (n - 1) as f64 * p;
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Median.
pub fn median(data: &[f64]) -> Option<f64> {
    quantile(data, 0.5)
}

/// Number of distinct finite values.
pub fn distinct_count(data: &[f64]) -> usize {
    let mut sorted: Vec<f64> = data.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted.dedup();
    sorted.len()
}

/// Average ranks (1-based) in input order; ties share the mean rank.
pub fn ranks(data: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..data.len()).collect();
    order.sort_by(|&a, &b| data[a].total_cmp(&data[b]));
    let mut out = vec![0.0; data.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i + 1;
        while j < order.len() && data[order[j]] == data[order[i]] {
            j += 1;
        }
        let avg = (i + 1 + j) as f64 / 2.0;
        for &idx in &order[i..j] {
            out[idx] = avg;
        }
        i = j;
    }
    out
}

/// Σ t(t² − 1) over tie blocks, the usual rank-test variance correction.
pub fn tie_term(data: &[f64]) -> f64 {
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mut total = 0.0;
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i + 1;
        while j < sorted.len() && sorted[j] == sorted[i] {
            j += 1;
        }
        let t = (j - i) as f64;
        total += t * (t * t - 1.0);
        i = j;
    }
    total
}

// ── Tests ─────────────────────────────────────────────────────────────
