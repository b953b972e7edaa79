//! Post-hoc multiple comparisons.
//!
//! Run after a significant omnibus test to locate the differing groups:
//!
//! - [`tukey_hsd`]: all pairs, Tukey-Kramer with studentized-range p-values
//! - [`dunnett`]: every treatment against one control
//! - [`pairwise_mann_whitney`], [`pairwise_paired`], [`simple_effects`]:
//!   pairwise tests with Holm step-down adjustment
//!
//! Each returns a [`PosthocResult`] whose table ends in an adjusted p-value
//! and a `Significant` flag.

use crate::error::EngineError;
use crate::report::{Cell, PosthocResult, ResultTable};
use crate::special;
use crate::stats;
use crate::testing;

/// Labelled sample.
pub type Group = (String, Vec<f64>);

fn yes_no(significant: bool) -> Cell {
    Cell::text(if significant { "yes" } else { "no" })
}

/// Holm adjustment that tolerates non-finite entries (left as NaN).
fn holm_finite(p_values: &[f64]) -> Vec<f64> {
    let finite: Vec<f64> = p_values.iter().copied().filter(|p| p.is_finite()).collect();
    let adjusted = testing::holm_correction(&finite).unwrap_or_default();
    let mut it = adjusted.into_iter();
    p_values
        .iter()
        .map(|p| {
            if p.is_finite() {
                it.next().unwrap_or(f64::NAN)
            } else {
                f64::NAN
            }
        })
        .collect()
}

/// Pooled within-group mean square and its degrees of freedom.
fn pooled_error(groups: &[Group]) -> Option<(f64, f64)> {
    let mut ss = 0.0;
    let mut df = 0usize;
    for (_, v) in groups {
        if v.len() >= 2 {
            ss += stats::variance(v)? * (v.len() - 1) as f64;
            df += v.len() - 1;
        }
    }
    (df > 0).then(|| (ss / df as f64, df as f64))
}

fn means(groups: &[Group]) -> Result<Vec<f64>, EngineError> {
    groups
        .iter()
        .map(|(name, v)| {
            stats::mean(v).ok_or_else(|| EngineError::insufficient(format!("group '{name}' has no values")))
        })
        .collect()
}

// ── Tukey ─────────────────────────────────────────────────────────────

/// Tukey HSD (Tukey-Kramer for unequal sizes).
///
/// `error` supplies the model MSE and its degrees of freedom; without it
/// the pooled within-group variance is used.
///
/// ```
/// use u_labstat::posthoc::tukey_hsd;
///
/// let groups = vec![
///     ("a".to_string(), vec![1.0, 2.0, 3.0]),
///     ("b".to_string(), vec![1.5, 2.5, 3.5]),
///     ("c".to_string(), vec![8.0, 9.0, 10.0]),
/// ];
/// let r = tukey_hsd(&groups, None, 0.05).unwrap();
/// assert!(r.table.value("a vs b", "p-adj").unwrap() > 0.5);
/// assert!(r.table.value("a vs c", "p-adj").unwrap() < 0.01);
/// ```
pub fn tukey_hsd(groups: &[Group], error: Option<(f64, f64)>, alpha: f64) -> Result<PosthocResult, EngineError> {
    let k = groups.len();
    if k < 2 {
        return Err(EngineError::insufficient("Tukey HSD needs at least 2 groups"));
    }
    let (mse, df) = error
        .or_else(|| pooled_error(groups))
        .ok_or_else(|| EngineError::insufficient("no within-group degrees of freedom"))?;
    if mse.is_nan() || mse <= 0.0 || df <= 0.0 {
        return Err(EngineError::fit("error variance is zero; Tukey HSD undefined"));
    }
    let m = means(groups)?;
    let q_crit = special::qtukey(1.0 - alpha, k, df);

    let mut table = ResultTable::new(&[
        "Comparison",
        "Group 1",
        "Group 2",
        "Mean diff",
        "q",
        "p-adj",
        "Lower",
        "Upper",
        "Significant",
    ]);
    for i in 0..k {
        for j in i + 1..k {
            let (ni, nj) = (groups[i].1.len() as f64, groups[j].1.len() as f64);
            let diff = m[j] - m[i];
            let se = (mse / 2.0 * (1.0 / ni + 1.0 / nj)).sqrt();
            let q = diff.abs() / se;
            let p = special::tukey_sf(q, k, df);
            let half = q_crit * se;
            table.push(vec![
                Cell::text(format!("{} vs {}", groups[i].0, groups[j].0)),
                Cell::text(&groups[i].0),
                Cell::text(&groups[j].0),
                Cell::num(diff),
                Cell::num(q),
                Cell::num(p),
                Cell::num(diff - half),
                Cell::num(diff + half),
                yes_no(p <= alpha),
            ]);
        }
    }
    Ok(PosthocResult::new(
        "Tukey HSD",
        "all pairwise comparisons after a significant ANOVA; family-wise error controlled by the studentized range",
        table,
    ))
}

// ── Dunnett ───────────────────────────────────────────────────────────

/// Dunnett's many-to-one comparisons against `control` (two-sided).
pub fn dunnett(
    groups: &[Group],
    control: &str,
    error: Option<(f64, f64)>,
    alpha: f64,
    panels: usize,
) -> Result<PosthocResult, EngineError> {
    let c = groups
        .iter()
        .position(|(name, _)| name == control)
        .ok_or_else(|| EngineError::insufficient(format!("control group '{control}' not present in the data")))?;
    if groups.len() < 2 {
        return Err(EngineError::insufficient("Dunnett's test needs a control and at least one treatment"));
    }
    let (mse, df) = error
        .or_else(|| pooled_error(groups))
        .ok_or_else(|| EngineError::insufficient("no within-group degrees of freedom"))?;
    if mse.is_nan() || mse <= 0.0 || df <= 0.0 {
        return Err(EngineError::fit("error variance is zero; Dunnett's test undefined"));
    }
    let m = means(groups)?;
    let n0 = groups[c].1.len() as f64;
    let treatments: Vec<usize> = (0..groups.len()).filter(|&i| i != c).collect();
    let lambdas: Vec<f64> = treatments
        .iter()
        .map(|&i| {
            let ni = groups[i].1.len() as f64;
            (ni / (ni + n0)).sqrt()
        })
        .collect();

    let mut table = ResultTable::new(&["Comparison", "Group", "Control", "Mean diff", "t", "p-adj", "Significant"]);
    for &i in &treatments {
        let ni = groups[i].1.len() as f64;
        let diff = m[i] - m[c];
        let t = diff / (mse * (1.0 / ni + 1.0 / n0)).sqrt();
        let p = special::dunnett_p(t.abs(), &lambdas, df, panels);
        table.push(vec![
            Cell::text(format!("{} vs {}", groups[i].0, control)),
            Cell::text(&groups[i].0),
            Cell::text(control),
            Cell::num(diff),
            Cell::num(t),
            Cell::num(p),
            yes_no(p <= alpha),
        ]);
    }
    Ok(PosthocResult::new(
        "Dunnett",
        format!("each group compared with control '{control}'; family-wise error controlled across the many-to-one family"),
        table,
    ))
}

// ── Holm-corrected pairwise tests ─────────────────────────────────────

/// Pairs to compare: control against each other group when a control is
/// given and present, otherwise all pairs.
fn comparison_pairs(groups: &[Group], control: Option<&str>) -> Vec<(usize, usize)> {
    if let Some(c) = control.and_then(|c| groups.iter().position(|(n, _)| n == c)) {
        return (0..groups.len()).filter(|&i| i != c).map(|i| (c, i)).collect();
    }
    let mut pairs = Vec::new();
    for i in 0..groups.len() {
        for j in i + 1..groups.len() {
            pairs.push((i, j));
        }
    }
    pairs
}

/// Mann-Whitney U for each pair with Holm correction.
pub fn pairwise_mann_whitney(groups: &[Group], control: Option<&str>, alpha: f64) -> Result<PosthocResult, EngineError> {
    if groups.len() < 2 {
        return Err(EngineError::insufficient("pairwise comparisons need at least 2 groups"));
    }
    let pairs = comparison_pairs(groups, control);
    let results: Vec<Option<testing::TestResult>> = pairs
        .iter()
        .map(|&(i, j)| testing::mann_whitney_u_test(&groups[i].1, &groups[j].1))
        .collect();
    let raw: Vec<f64> = results.iter().map(|r| r.map_or(f64::NAN, |r| r.p_value)).collect();
    let adjusted = holm_finite(&raw);

    let mut table = ResultTable::new(&["Comparison", "Group 1", "Group 2", "U", "p", "p-adj (Holm)", "Significant"]);
    for (((i, j), r), adj) in pairs.iter().zip(&results).zip(&adjusted) {
        table.push(vec![
            Cell::text(format!("{} vs {}", groups[*i].0, groups[*j].0)),
            Cell::text(&groups[*i].0),
            Cell::text(&groups[*j].0),
            Cell::opt(r.map(|r| r.statistic)),
            Cell::opt(r.map(|r| r.p_value)),
            Cell::num(*adj),
            yes_no(adj.is_finite() && *adj <= alpha),
        ]);
    }
    let scope = if control.is_some_and(|c| groups.iter().any(|(n, _)| n == c)) {
        "each group against the control"
    } else {
        "all pairs"
    };
    Ok(PosthocResult::new(
        "Pairwise Mann-Whitney U (Holm)",
        format!("non-parametric follow-up of a significant Kruskal-Wallis test over {scope}; Holm step-down correction"),
        table,
    ))
}

/// Test used for paired follow-ups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairedMethod {
    TTest,
    Wilcoxon,
}

/// All level pairs of complete within-subject data, Holm corrected.
/// `levels[j].1[i]` is subject `i` at level `j`.
pub fn pairwise_paired(levels: &[Group], method: PairedMethod, alpha: f64) -> Result<PosthocResult, EngineError> {
    if levels.len() < 2 {
        return Err(EngineError::insufficient("pairwise comparisons need at least 2 levels"));
    }
    let pairs = comparison_pairs(levels, None);
    let results: Vec<Option<testing::TestResult>> = pairs
        .iter()
        .map(|&(i, j)| match method {
            PairedMethod::TTest => testing::paired_t_test(&levels[i].1, &levels[j].1),
            PairedMethod::Wilcoxon => testing::wilcoxon_signed_rank_test(&levels[i].1, &levels[j].1),
        })
        .collect();
    let raw: Vec<f64> = results.iter().map(|r| r.map_or(f64::NAN, |r| r.p_value)).collect();
    let adjusted = holm_finite(&raw);

    let mut table = ResultTable::new(&["Comparison", "Level 1", "Level 2", "Statistic", "p", "p-adj (Holm)", "Significant"]);
    for (((i, j), r), adj) in pairs.iter().zip(&results).zip(&adjusted) {
        table.push(vec![
            Cell::text(format!("{} vs {}", levels[*i].0, levels[*j].0)),
            Cell::text(&levels[*i].0),
            Cell::text(&levels[*j].0),
            Cell::opt(r.map(|r| r.statistic)),
            Cell::opt(r.map(|r| r.p_value)),
            Cell::num(*adj),
            yes_no(adj.is_finite() && *adj <= alpha),
        ]);
    }
    let (name, rationale) = match method {
        PairedMethod::TTest => (
            "Pairwise paired t-tests (Holm)",
            "follow-up of a significant within-subject effect; Holm step-down correction",
        ),
        PairedMethod::Wilcoxon => (
            "Pairwise Wilcoxon signed-rank (Holm)",
            "non-parametric follow-up of a significant Friedman test; Holm step-down correction",
        ),
    };
    Ok(PosthocResult::new(name, rationale, table))
}

/// One cell of a factorial layout: `group` of the focus factor observed
/// under `condition` (a level or level combination of the other factors).
#[derive(Debug, Clone, PartialEq)]
pub struct EffectCell {
    pub condition: String,
    pub group: String,
    pub values: Vec<f64>,
}

/// Simple effects: focus-factor groups compared pairwise within each
/// condition, Holm corrected over the whole family.
///
/// With `error` the pooled model MSE is used (t on `df` degrees of
/// freedom); without it each pair gets a Welch test.
pub fn simple_effects(cells: &[EffectCell], error: Option<(f64, f64)>, alpha: f64) -> Result<PosthocResult, EngineError> {
    let mut conditions: Vec<&str> = cells.iter().map(|c| c.condition.as_str()).collect();
    conditions.sort_unstable();
    conditions.dedup();

    let mut rows: Vec<(String, String, String, f64, f64, f64)> = Vec::new();
    for cond in &conditions {
        let within: Vec<&EffectCell> = cells.iter().filter(|c| c.condition == *cond).collect();
        for i in 0..within.len() {
            for j in i + 1..within.len() {
                let (a, b) = (within[i], within[j]);
                let (Some(ma), Some(mb)) = (stats::mean(&a.values), stats::mean(&b.values)) else {
                    continue;
                };
                let diff = mb - ma;
                let (t, p) = match error {
                    Some((mse, df)) => {
                        let se = (mse * (1.0 / a.values.len() as f64 + 1.0 / b.values.len() as f64)).sqrt();
                        let t = diff / se;
                        (t, special::t_two_sided_p(t, df))
                    }
                    None => testing::welch_t_test(&b.values, &a.values)
                        .map_or((f64::NAN, f64::NAN), |r| (r.statistic, r.p_value)),
                };
                rows.push((cond.to_string(), a.group.clone(), b.group.clone(), diff, t, p));
            }
        }
    }
    if rows.is_empty() {
        return Err(EngineError::insufficient("no condition has two groups to compare"));
    }
    let raw: Vec<f64> = rows.iter().map(|r| r.5).collect();
    let adjusted = holm_finite(&raw);

    let mut table = ResultTable::new(&[
        "Comparison",
        "Condition",
        "Group 1",
        "Group 2",
        "Mean diff",
        "t",
        "p",
        "p-adj (Holm)",
        "Significant",
    ]);
    for ((cond, g1, g2, diff, t, p), adj) in rows.into_iter().zip(adjusted) {
        table.push(vec![
            Cell::text(format!("{g1} vs {g2} @ {cond}")),
            Cell::text(cond),
            Cell::text(g1),
            Cell::text(g2),
            Cell::num(diff),
            Cell::num(t),
            Cell::num(p),
            Cell::num(adj),
            yes_no(adj.is_finite() && adj <= alpha),
        ]);
    }
    let rationale = if error.is_some() {
        "significant interaction: groups compared within each condition using the pooled model error; Holm step-down correction"
    } else {
        "significant interaction: groups compared within each condition with Welch t-tests; Holm step-down correction"
    };
    Ok(PosthocResult::new("Simple effects", rationale, table))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str, v: &[f64]) -> Group {
        (name.to_string(), v.to_vec())
    }

    fn three() -> Vec<Group> {
        vec![
            group("ctrl", &[10.0, 11.0, 9.5, 10.5, 10.2]),
            group("low", &[10.4, 11.2, 9.9, 10.8, 10.1]),
            group("high", &[14.0, 15.2, 13.8, 14.6, 15.0]),
        ]
    }

    #[test]
    fn tukey_two_groups_matches_t_test() {
        let g = vec![group("a", &[1.0, 2.0, 3.0, 4.0]), group("b", &[2.5, 3.5, 4.5, 6.0])];
        let r = tukey_hsd(&g, None, 0.05).unwrap();
        let t = testing::student_t_test(&g[0].1, &g[1].1).unwrap();
        let p = r.table.value("a vs b", "p-adj").unwrap();
        assert!((p - t.p_value).abs() < 1e-4, "{p} vs {}", t.p_value);
    }

    #[test]
    fn tukey_p_values_in_unit_interval() {
        let r = tukey_hsd(&three(), None, 0.05).unwrap();
        for p in r.table.column_values("p-adj") {
            let p = p.unwrap();
            assert!((0.0..=1.0).contains(&p));
        }
        assert_eq!(r.table.len(), 3);
        let lower = r.table.value("ctrl vs high", "Lower").unwrap();
        assert!(lower > 0.0);
        assert_eq!(r.table.row("ctrl vs low").unwrap()[8], Cell::text("no"));
    }

    #[test]
    fn dunnett_against_control() {
        let r = dunnett(&three(), "ctrl", None, 0.05, 96).unwrap();
        assert_eq!(r.table.len(), 2);
        assert!(r.table.value("high vs ctrl", "p-adj").unwrap() < 0.001);
        assert!(r.table.value("low vs ctrl", "p-adj").unwrap() > 0.1);
        assert!(r.rationale.contains("ctrl"));
    }

    #[test]
    fn dunnett_unknown_control() {
        let err = dunnett(&three(), "vehicle", None, 0.05, 96).unwrap_err();
        assert!(err.to_string().contains("vehicle"));
    }

    #[test]
    fn dunnett_is_less_conservative_than_tukey_for_control_pairs() {
        let d = dunnett(&three(), "ctrl", None, 0.05, 96).unwrap();
        let t = tukey_hsd(&three(), None, 0.05).unwrap();
        let pd = d.table.value("low vs ctrl", "p-adj").unwrap();
        let pt = t.table.value("ctrl vs low", "p-adj").unwrap();
        assert!(pd <= pt + 1e-3);
    }

    #[test]
    fn mann_whitney_restricted_to_control() {
        let all = pairwise_mann_whitney(&three(), None, 0.05).unwrap();
        assert_eq!(all.table.len(), 3);
        let ctl = pairwise_mann_whitney(&three(), Some("ctrl"), 0.05).unwrap();
        assert_eq!(ctl.table.len(), 2);
        for (raw, adj) in ctl.table.column_values("p").iter().zip(ctl.table.column_values("p-adj (Holm)")) {
            assert!(adj.unwrap() >= raw.unwrap());
        }
    }

    #[test]
    fn paired_follow_up() {
        let levels = vec![
            group("d0", &[10.0, 11.0, 12.0, 10.5, 11.5, 12.5]),
            group("d7", &[12.1, 13.0, 14.2, 12.4, 13.6, 14.4]),
            group("d14", &[15.0, 16.3, 17.1, 15.2, 16.9, 17.8]),
        ];
        let r = pairwise_paired(&levels, PairedMethod::TTest, 0.05).unwrap();
        assert_eq!(r.table.len(), 3);
        assert!(r.table.value("d0 vs d14", "p-adj (Holm)").unwrap() < 0.001);
        let w = pairwise_paired(&levels, PairedMethod::Wilcoxon, 0.05).unwrap();
        assert_eq!(w.method, "Pairwise Wilcoxon signed-rank (Holm)");
    }

    #[test]
    fn simple_effects_per_condition() {
        let cells = vec![
            EffectCell { condition: "F".into(), group: "lo".into(), values: vec![1.0, 1.2, 0.9] },
            EffectCell { condition: "F".into(), group: "hi".into(), values: vec![1.1, 1.0, 1.3] },
            EffectCell { condition: "M".into(), group: "lo".into(), values: vec![1.0, 1.1, 0.8] },
            EffectCell { condition: "M".into(), group: "hi".into(), values: vec![5.0, 5.2, 4.9] },
        ];
        let r = simple_effects(&cells, Some((0.02, 8.0)), 0.05).unwrap();
        assert_eq!(r.table.len(), 2);
        assert!(r.table.value("lo vs hi @ M", "p-adj (Holm)").unwrap() < 0.001);
        assert!(r.table.value("lo vs hi @ F", "p-adj (Holm)").unwrap() > 0.05);
        let welch = simple_effects(&cells, None, 0.05).unwrap();
        assert!(welch.rationale.contains("Welch"));
    }

    #[test]
    fn holm_keeps_non_finite_slots() {
        let adj = holm_finite(&[0.01, f64::NAN, 0.04]);
        assert!((adj[0] - 0.02).abs() < 1e-12);
        assert!(adj[1].is_nan());
        assert!((adj[2] - 0.04).abs() < 1e-12);
    }
}
