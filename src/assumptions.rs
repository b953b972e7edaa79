//! Assumption checking.
//!
//! For every measured parameter the checker groups the observations,
//! optionally screens outliers per group, and records the pre-test outcomes
//! the suggester needs: Shapiro-Wilk normality per group and Levene
//! (median-centred) homogeneity of variance across groups. Failures never
//! abort the batch; they land in the parameter's `error` field.
//!
//! ```
//! use u_labstat::assumptions::{AssumptionChecker, CheckRequest};
//! use u_labstat::config::{AnalysisRequest, EngineConfig};
//! use u_labstat::csv_parser::CsvParser;
//!
//! let df = CsvParser::new()
//!     .parse_str("dose,weight\nlo,10.1\nlo,9.8\nlo,10.4\nhi,12.0\nhi,12.6\nhi,11.9\n")
//!     .unwrap();
//! let config = EngineConfig::default();
//! let request = CheckRequest::from(&AnalysisRequest::new(&["dose"], &["weight"]));
//! let results = AssumptionChecker::new(&config).check(&df, &request);
//! let weight = &results["weight"];
//! assert!(weight.error.is_none());
//! assert_eq!(weight.groups.len(), 2);
//! assert_eq!(weight.groups[0].group, "hi");
//! ```

use crate::config::{AnalysisRequest, EngineConfig};
use crate::dataframe::DataFrame;
use crate::error::EngineError;
use crate::outlier;
use crate::reshape::{to_long_form, LongForm};
use crate::stats;
use crate::testing;
use serde::Serialize;
use std::collections::BTreeMap;

/// Group label used when no grouping column is requested.
pub const OVERALL: &str = "Overall";

/// Joins the labels of the (sorted) grouping columns into one group key.
///
/// ```
/// use u_labstat::assumptions::combined_key;
///
/// assert_eq!(combined_key(&[]), "Overall");
/// assert_eq!(combined_key(&["10".into(), "F".into()]), "10 | F");
/// ```
pub fn combined_key(labels: &[String]) -> String {
    if labels.is_empty() {
        OVERALL.to_string()
    } else {
        labels.join(" | ")
    }
}

// ── Result types ──────────────────────────────────────────────────────

/// How observations were grouped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "columns", rename_all = "snake_case")]
pub enum Grouping {
    None,
    Single(String),
    /// Several columns, sorted by name.
    Combined(Vec<String>),
}

impl Grouping {
    pub fn from_columns(sorted: &[String]) -> Self {
        match sorted {
            [] => Grouping::None,
            [one] => Grouping::Single(one.clone()),
            many => Grouping::Combined(many.to_vec()),
        }
    }

    pub fn factor_count(&self) -> usize {
        match self {
            Grouping::None => 0,
            Grouping::Single(_) => 1,
            Grouping::Combined(cols) => cols.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Numeric,
    Categorical,
}

/// Descriptive summary of one group. Categorical parameters only fill `n`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSummary {
    pub group: String,
    pub n: usize,
    pub mean: Option<f64>,
    pub std_dev: Option<f64>,
    pub sem: Option<f64>,
    pub median: Option<f64>,
}

impl GroupSummary {
    fn numeric(group: &str, values: &[f64]) -> Self {
        Self {
            group: group.to_string(),
            n: values.len(),
            mean: stats::mean(values),
            std_dev: stats::std_dev(values),
            sem: stats::sem(values),
            median: stats::median(values),
        }
    }

    fn count(group: &str, n: usize) -> Self {
        Self {
            group: group.to_string(),
            n,
            mean: None,
            std_dev: None,
            sem: None,
            median: None,
        }
    }
}

/// Shapiro-Wilk outcome for one group.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NormalityOutcome {
    Tested {
        group: String,
        n: usize,
        statistic: f64,
        p_value: f64,
    },
    Untestable {
        group: String,
        n: usize,
        note: String,
    },
}

impl NormalityOutcome {
    /// Tested and not rejected at `alpha`. Untestable groups never pass.
    pub fn passes(&self, alpha: f64) -> bool {
        matches!(self, NormalityOutcome::Tested { p_value, .. } if *p_value >= alpha)
    }

    pub fn group(&self) -> &str {
        match self {
            NormalityOutcome::Tested { group, .. } | NormalityOutcome::Untestable { group, .. } => group,
        }
    }
}

/// Levene outcome across groups.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VarianceOutcome {
    Tested { statistic: f64, p_value: f64 },
    Untestable { note: String },
}

/// Pre-test outcomes for one parameter (or one within-subject level).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssumptionCheckResult {
    pub parameter: String,
    pub grouping: Grouping,
    pub kind: ParameterKind,
    pub groups: Vec<GroupSummary>,
    pub normality: Vec<NormalityOutcome>,
    pub variance: VarianceOutcome,
    pub all_groups_normal: bool,
    pub any_group_not_normal: bool,
    pub equal_variance: bool,
    pub outliers_excluded: usize,
    pub notes: Vec<String>,
    pub error: Option<String>,
}

impl AssumptionCheckResult {
    fn failed(parameter: &str, grouping: Grouping, error: impl ToString) -> Self {
        Self {
            parameter: parameter.to_string(),
            grouping,
            kind: ParameterKind::Numeric,
            groups: Vec::new(),
            normality: Vec::new(),
            variance: VarianceOutcome::Untestable {
                note: "not evaluated".into(),
            },
            all_groups_normal: false,
            any_group_not_normal: false,
            equal_variance: false,
            outliers_excluded: 0,
            notes: Vec::new(),
            error: Some(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Whether Levene's test could be run.
    pub fn variance_tested(&self) -> bool {
        matches!(self.variance, VarianceOutcome::Tested { .. })
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

// ── Request ───────────────────────────────────────────────────────────

/// Inputs of one checking run.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckRequest {
    pub grouping_columns: Vec<String>,
    pub numeric_columns: Vec<String>,
    pub is_repeated: bool,
    pub subject_id_column: Option<String>,
    pub exclude_outliers: bool,
    pub outlier_method: String,
    pub outlier_threshold: Option<f64>,
    pub within_factor_name: String,
}

impl From<&AnalysisRequest> for CheckRequest {
    fn from(r: &AnalysisRequest) -> Self {
        Self {
            grouping_columns: r.sorted_grouping_columns(),
            numeric_columns: r.numeric_columns.clone(),
            is_repeated: r.is_repeated,
            subject_id_column: r.subject_id_column.clone(),
            exclude_outliers: r.exclude_outliers,
            outlier_method: r.outlier_method.clone(),
            outlier_threshold: r.outlier_threshold,
            within_factor_name: r.within_factor_name.clone(),
        }
    }
}

// ── Checker ───────────────────────────────────────────────────────────

/// Runs the pre-tests with the thresholds of an [`EngineConfig`].
#[derive(Debug, Clone, Copy)]
pub struct AssumptionChecker<'a> {
    config: &'a EngineConfig,
}

impl<'a> AssumptionChecker<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// One result per requested numeric column (in repeated mode: per
    /// within-subject level).
    pub fn check(&self, df: &DataFrame, request: &CheckRequest) -> BTreeMap<String, AssumptionCheckResult> {
        let mut sorted = request.grouping_columns.clone();
        sorted.sort();
        sorted.dedup();
        if request.is_repeated {
            self.check_repeated(df, request, &sorted)
        } else {
            request
                .numeric_columns
                .iter()
                .map(|p| (p.clone(), self.check_independent(df, request, &sorted, p)))
                .collect()
        }
    }

    fn check_independent(
        &self,
        df: &DataFrame,
        request: &CheckRequest,
        grouping_columns: &[String],
        parameter: &str,
    ) -> AssumptionCheckResult {
        let grouping = Grouping::from_columns(grouping_columns);
        if let Err(e) = df.require(parameter) {
            return AssumptionCheckResult::failed(parameter, grouping, e);
        }
        for g in grouping_columns {
            if let Err(e) = df.require(g) {
                return AssumptionCheckResult::failed(parameter, grouping, e);
            }
        }

        let numeric = df.is_numeric_like(parameter).unwrap_or(false);
        let mut rows: Vec<(Vec<String>, Observation)> = Vec::new();
        for row in 0..df.row_count() {
            let labels: Option<Vec<String>> = grouping_columns.iter().map(|g| df.label_at(g, row)).collect();
            let Some(labels) = labels else { continue };
            let obs = if numeric {
                df.numeric_at(parameter, row).map(Observation::Value)
            } else {
                df.label_at(parameter, row).map(Observation::Label)
            };
            if let Some(obs) = obs {
                rows.push((labels, obs));
            }
        }
        if rows.is_empty() {
            return AssumptionCheckResult::failed(
                parameter,
                grouping,
                EngineError::insufficient(format!("no valid data for '{parameter}'")),
            );
        }
        self.evaluate(parameter, grouping, grouping_columns, rows, request)
    }

    fn check_repeated(
        &self,
        df: &DataFrame,
        request: &CheckRequest,
        between: &[String],
    ) -> BTreeMap<String, AssumptionCheckResult> {
        let grouping = Grouping::from_columns(between);
        let fail_all = |msg: String| -> BTreeMap<String, AssumptionCheckResult> {
            request
                .numeric_columns
                .iter()
                .map(|p| (p.clone(), AssumptionCheckResult::failed(p, grouping.clone(), &msg)))
                .collect()
        };
        let Some(subject) = request.subject_id_column.as_deref() else {
            return fail_all("repeated measures require a subject identifier column".into());
        };
        if df.column_by_name(subject).is_none() {
            return fail_all(format!("subject identifier column '{subject}' not found"));
        }
        let long = match to_long_form(df, subject, &request.numeric_columns, between, &request.within_factor_name) {
            Ok(long) => long,
            Err(e) => return fail_all(e.to_string()),
        };

        request
            .numeric_columns
            .iter()
            .map(|level| (level.clone(), self.check_level(&long, level, between, request)))
            .collect()
    }

    fn check_level(
        &self,
        long: &LongForm,
        level: &str,
        between: &[String],
        request: &CheckRequest,
    ) -> AssumptionCheckResult {
        let grouping = Grouping::from_columns(between);
        let mut missing_subject = 0;
        let mut missing_between = vec![0usize; between.len()];
        let mut rows = Vec::new();
        for r in long.level_rows(level) {
            let mut identified = true;
            if r.subject.is_none() {
                missing_subject += 1;
                identified = false;
            }
            for (count, label) in missing_between.iter_mut().zip(&r.between) {
                if label.is_none() {
                    *count += 1;
                    identified = false;
                }
            }
            if identified {
                if let Some(v) = r.value {
                    rows.push((r.between.iter().flatten().cloned().collect(), Observation::Value(v)));
                }
            }
        }

        let mut missing = Vec::new();
        if missing_subject > 0 {
            missing.push(format!(
                "subject id '{}' missing in {} row(s)",
                long.subject_column, missing_subject
            ));
        }
        for (col, &count) in between.iter().zip(&missing_between) {
            if count > 0 {
                missing.push(format!("grouping parameter '{col}' missing in {count} row(s)"));
            }
        }
        if !missing.is_empty() {
            return AssumptionCheckResult::failed(
                level,
                grouping,
                format!("level '{level}': {}", missing.join("; ")),
            );
        }
        if rows.is_empty() {
            return AssumptionCheckResult::failed(
                level,
                grouping,
                EngineError::insufficient(format!("level '{level}': all measurement values are missing")),
            );
        }
        self.evaluate(level, grouping, between, rows, request)
    }

    /// Shared core: group, screen outliers, summarise, pre-test.
    fn evaluate(
        &self,
        parameter: &str,
        grouping: Grouping,
        grouping_columns: &[String],
        rows: Vec<(Vec<String>, Observation)>,
        request: &CheckRequest,
    ) -> AssumptionCheckResult {
        let mut by_group: BTreeMap<String, Vec<Observation>> = BTreeMap::new();
        for (labels, obs) in rows {
            by_group.entry(combined_key(&labels)).or_default().push(obs);
        }
        if !grouping_columns.is_empty() && by_group.len() < 2 {
            return AssumptionCheckResult::failed(
                parameter,
                grouping,
                EngineError::insufficient(format!(
                    "grouping column(s) {} yield fewer than 2 groups with data",
                    grouping_columns
                        .iter()
                        .map(|c| format!("'{c}'"))
                        .collect::<Vec<_>>()
                        .join(", ")
                )),
            );
        }

        let categorical = by_group
            .values()
            .flatten()
            .any(|o| matches!(o, Observation::Label(_)));
        if categorical {
            return AssumptionCheckResult {
                parameter: parameter.to_string(),
                grouping,
                kind: ParameterKind::Categorical,
                groups: by_group.iter().map(|(g, obs)| GroupSummary::count(g, obs.len())).collect(),
                normality: Vec::new(),
                variance: VarianceOutcome::Untestable {
                    note: "not applicable to categorical data".into(),
                },
                all_groups_normal: false,
                any_group_not_normal: false,
                equal_variance: false,
                outliers_excluded: 0,
                notes: Vec::new(),
                error: None,
            };
        }

        let mut notes = Vec::new();
        let mut excluded = 0;
        let mut samples: Vec<(String, Vec<f64>)> = Vec::with_capacity(by_group.len());
        for (group, obs) in by_group {
            let values: Vec<f64> = obs.iter().filter_map(Observation::value).collect();
            let values = if request.exclude_outliers {
                let report = outlier::detect_named(&values, &request.outlier_method, request.outlier_threshold);
                excluded += report.excluded_count();
                for note in report.notes {
                    if !notes.contains(&note) {
                        notes.push(note);
                    }
                }
                values
                    .iter()
                    .zip(&report.mask)
                    .filter_map(|(v, &flag)| (!flag).then_some(*v))
                    .collect()
            } else {
                values
            };
            samples.push((group, values));
        }
        if excluded > 0 {
            notes.push(format!(
                "{excluded} outlier(s) excluded per group using '{}'",
                request.outlier_method
            ));
        }

        let normality: Vec<NormalityOutcome> = samples
            .iter()
            .map(|(group, values)| self.normality(group, values))
            .collect();
        let all_groups_normal = !normality.is_empty() && normality.iter().all(|o| o.passes(self.config.alpha));
        let any_group_not_normal = normality.iter().any(|o| !o.passes(self.config.alpha));

        let variance = self.variance(&samples);
        let equal_variance = matches!(variance, VarianceOutcome::Tested { p_value, .. } if p_value > self.config.alpha);

        tracing::debug!(
            parameter,
            groups = samples.len(),
            all_groups_normal,
            equal_variance,
            "assumptions checked"
        );

        AssumptionCheckResult {
            parameter: parameter.to_string(),
            grouping,
            kind: ParameterKind::Numeric,
            groups: samples.iter().map(|(g, v)| GroupSummary::numeric(g, v)).collect(),
            normality,
            variance,
            all_groups_normal,
            any_group_not_normal,
            equal_variance,
            outliers_excluded: excluded,
            notes,
            error: None,
        }
    }

    fn normality(&self, group: &str, values: &[f64]) -> NormalityOutcome {
        let n = values.len();
        let untestable = |note: &str| NormalityOutcome::Untestable {
            group: group.to_string(),
            n,
            note: note.to_string(),
        };
        if n < self.config.min_normality_n {
            return untestable(&format!("insufficient data (n < {})", self.config.min_normality_n));
        }
        if n > self.config.max_normality_n {
            return untestable(&format!(
                "n > {}; Shapiro-Wilk not applied",
                self.config.max_normality_n
            ));
        }
        if stats::distinct_count(values) < 2 {
            return untestable("constant data");
        }
        match testing::shapiro_wilk_test(values) {
            Some(r) => NormalityOutcome::Tested {
                group: group.to_string(),
                n,
                statistic: r.w,
                p_value: r.p_value,
            },
            None => untestable("Shapiro-Wilk could not be computed"),
        }
    }

    fn variance(&self, samples: &[(String, Vec<f64>)]) -> VarianceOutcome {
        let pool: Vec<&[f64]> = samples
            .iter()
            .map(|(_, v)| v.as_slice())
            .filter(|v| v.len() >= 2 && stats::variance(v).is_some_and(|s| s > self.config.variance_floor))
            .collect();
        if pool.len() < 2 {
            return VarianceOutcome::Untestable {
                note: "insufficient groups with variability for Levene's test".into(),
            };
        }
        match testing::levene_test(&pool) {
            Some(r) => VarianceOutcome::Tested {
                statistic: r.statistic,
                p_value: r.p_value,
            },
            None => VarianceOutcome::Untestable {
                note: "Levene's test could not be computed".into(),
            },
        }
    }
}

/// A measurement cell: numeric value or categorical label.
#[derive(Debug, Clone, PartialEq)]
enum Observation {
    Value(f64),
    Label(String),
}

impl Observation {
    fn value(&self) -> Option<f64> {
        match self {
            Observation::Value(v) => Some(*v),
            Observation::Label(_) => None,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
