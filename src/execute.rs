//! Test execution.
//!
//! [`TestExecutor`] maps every [`TestKind`] to a handler. Handlers prepare
//! their own data (numeric coercion, optional whole-column outlier
//! exclusion, listwise deletion), run the procedure, and attach post-hoc
//! comparisons when the omnibus result is significant. Any error is
//! converted into a failed [`TestExecutionResult`] by the dispatcher.
//!
//! Fallbacks never happen silently: Fisher's exact test replacing a sparse
//! chi-square, the mixed-effects model replacing a repeated-measures ANOVA
//! on incomplete data, the interaction model replacing a plain ANCOVA and
//! simple effects replacing main-effect comparisons each leave a note.
//!
//! ```
//! use u_labstat::config::EngineConfig;
//! use u_labstat::csv_parser::CsvParser;
//! use u_labstat::execute::{ExecutionRequest, TestExecutor};
//!
//! let df = CsvParser::new()
//!     .parse_str("g,v\na,1.0\na,1.2\na,0.9\na,1.1\nb,2.0\nb,2.3\nb,2.1\nb,1.9\n")
//!     .unwrap();
//! let config = EngineConfig::default();
//! let result = TestExecutor::new(&config).execute_key(&df, "ttest_welch", &ExecutionRequest::new(&["v"], &["g"]));
//! assert_eq!(result.test, "Welch's t-test");
//! assert!(result.p_value.unwrap() < 0.05);
//!
//! let unknown = TestExecutor::new(&config).execute_key(&df, "bogus", &ExecutionRequest::new(&["v"], &["g"]));
//! assert_eq!(unknown.error.as_deref(), Some("unsupported test 'bogus'"));
//! ```

use crate::assumptions::combined_key;
use crate::config::{AnalysisRequest, EngineConfig};
use crate::dataframe::DataFrame;
use crate::error::EngineError;
use crate::linear_model::{AnovaRow, AnovaTable, Factor, LinearModel, Part, Term};
use crate::mixed_model::fit_random_intercept;
use crate::multivariate;
use crate::outlier;
use crate::posthoc::{self, EffectCell, Group, PairedMethod};
use crate::repeated::{self, RepeatedAnova};
use crate::report::{Cell, PosthocResult, ResultTable, TestExecutionResult};
use crate::reshape::{to_long_form, LongForm};
use crate::stats;
use crate::suggest::TestKind;
use crate::testing::{self, TestResult};
use std::collections::BTreeMap;
use std::ops::Range;

// ── Request ───────────────────────────────────────────────────────────

/// Inputs of one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    /// The parameter (first entry) or, for repeated and cross-parameter
    /// procedures, every column involved.
    pub measurement_columns: Vec<String>,
    pub grouping_columns: Vec<String>,
    pub is_repeated: bool,
    pub subject_id_column: Option<String>,
    pub exclude_outliers: bool,
    pub outlier_method: String,
    pub outlier_threshold: Option<f64>,
    pub control_group: Option<String>,
    pub covariate: Option<String>,
    pub within_factor_name: String,
}

impl ExecutionRequest {
    pub fn new(measurement_columns: &[&str], grouping_columns: &[&str]) -> Self {
        Self {
            measurement_columns: measurement_columns.iter().map(|s| s.to_string()).collect(),
            grouping_columns: grouping_columns.iter().map(|s| s.to_string()).collect(),
            is_repeated: false,
            subject_id_column: None,
            exclude_outliers: false,
            outlier_method: "iqr".into(),
            outlier_threshold: None,
            control_group: None,
            covariate: None,
            within_factor_name: "Within".into(),
        }
    }

    fn from_request(request: &AnalysisRequest, measurement_columns: Vec<String>) -> Self {
        Self {
            measurement_columns,
            grouping_columns: request.sorted_grouping_columns(),
            is_repeated: request.is_repeated,
            subject_id_column: request.subject_id_column.clone(),
            exclude_outliers: request.exclude_outliers,
            outlier_method: request.outlier_method.clone(),
            outlier_threshold: request.outlier_threshold,
            control_group: request.control_group.clone(),
            covariate: request.covariate.clone(),
            within_factor_name: request.within_factor_name.clone(),
        }
    }

    /// One independent-groups parameter.
    pub fn for_parameter(request: &AnalysisRequest, parameter: &str) -> Self {
        Self {
            is_repeated: false,
            ..Self::from_request(request, vec![parameter.to_string()])
        }
    }

    /// The within-subject set of a repeated-measures request.
    pub fn for_within(request: &AnalysisRequest) -> Self {
        Self::from_request(request, request.numeric_columns.clone())
    }

    /// All parameters at once (MANOVA, correlation matrix).
    pub fn for_cross(request: &AnalysisRequest) -> Self {
        Self {
            is_repeated: false,
            ..Self::from_request(request, request.numeric_columns.clone())
        }
    }

    pub fn repeated(mut self, subject_id_column: &str) -> Self {
        self.is_repeated = true;
        self.subject_id_column = Some(subject_id_column.to_string());
        self
    }

    pub fn exclude_outliers(mut self, method: &str, threshold: Option<f64>) -> Self {
        self.exclude_outliers = true;
        self.outlier_method = method.to_string();
        self.outlier_threshold = threshold;
        self
    }

    pub fn control_group(mut self, label: &str) -> Self {
        self.control_group = Some(label.to_string());
        self
    }

    pub fn covariate(mut self, column: &str) -> Self {
        self.covariate = Some(column.to_string());
        self
    }

    pub fn within_factor_name(mut self, name: &str) -> Self {
        self.within_factor_name = name.to_string();
        self
    }

    fn parameter(&self) -> Result<&str, EngineError> {
        self.measurement_columns
            .first()
            .map(String::as_str)
            .ok_or_else(|| EngineError::insufficient("no measurement column given"))
    }

    fn sorted_grouping(&self) -> Vec<String> {
        let mut cols = self.grouping_columns.clone();
        cols.sort();
        cols.dedup();
        cols
    }
}

// ── Prepared data ─────────────────────────────────────────────────────

struct PreparedRow {
    /// Dataset row, for covariate lookup.
    row: usize,
    labels: Vec<String>,
    value: f64,
}

/// One measurement column with its grouping labels, cleaned.
struct Prepared {
    factor_names: Vec<String>,
    rows: Vec<PreparedRow>,
    excluded: usize,
    notes: Vec<String>,
}

impl Prepared {
    /// Samples keyed by combined group label, sorted by label.
    fn groups(&self) -> Vec<Group> {
        let mut map: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for r in &self.rows {
            map.entry(combined_key(&r.labels)).or_default().push(r.value);
        }
        map.into_iter().collect()
    }

    fn attach(self, mut result: TestExecutionResult) -> TestExecutionResult {
        result.outliers_excluded = self.excluded;
        let mut notes = self.notes;
        notes.append(&mut result.notes);
        result.notes = notes;
        result
    }
}

/// Long-form repeated data after identifier checks and outlier removal.
struct RepeatedData {
    long: LongForm,
    excluded: usize,
    notes: Vec<String>,
}

impl RepeatedData {
    fn complete(&self) -> (Vec<String>, Vec<Vec<f64>>, usize) {
        let subjects = self.long.complete_subjects();
        let dropped = self.long.subject_count().saturating_sub(subjects.len());
        let groups = subjects.iter().map(|s| combined_key(&s.between)).collect();
        let data = subjects.into_iter().map(|s| s.values).collect();
        (groups, data, dropped)
    }

    fn level_groups(&self, data: &[Vec<f64>]) -> Vec<Group> {
        self.long
            .levels
            .iter()
            .enumerate()
            .map(|(j, level)| (level.clone(), data.iter().map(|r| r[j]).collect()))
            .collect()
    }

    fn attach(self, mut result: TestExecutionResult) -> TestExecutionResult {
        result.outliers_excluded = self.excluded;
        let mut notes = self.notes;
        notes.append(&mut result.notes);
        result.notes = notes;
        result
    }
}

fn test_table(label: &str, r: &TestResult) -> ResultTable {
    let mut table = ResultTable::new(&["Test", "Statistic", "df", "p"]);
    table.push(vec![
        Cell::text(label),
        Cell::num(r.statistic),
        if r.df > 0.0 { Cell::num(r.df) } else { Cell::Empty },
        Cell::num(r.p_value),
    ]);
    table
}

fn descriptives(groups: &[Group]) -> ResultTable {
    let mut table = ResultTable::new(&["Group", "n", "Mean", "SD", "SEM", "Median"]);
    for (name, v) in groups {
        table.push(vec![
            Cell::text(name),
            Cell::count(v.len()),
            Cell::opt(stats::mean(v)),
            Cell::opt(stats::std_dev(v)),
            Cell::opt(stats::sem(v)),
            Cell::opt(stats::median(v)),
        ]);
    }
    table
}

fn refs(groups: &[Group]) -> Vec<&[f64]> {
    groups.iter().map(|(_, v)| v.as_slice()).collect()
}

fn need_groups(groups: &[Group], min: usize, test: &str) -> Result<(), EngineError> {
    if groups.len() < min {
        return Err(EngineError::insufficient(format!(
            "{test} needs at least {min} groups, found {}",
            groups.len()
        )));
    }
    Ok(())
}

// ── Executor ──────────────────────────────────────────────────────────

/// Dispatches [`TestKind`]s to their handlers.
#[derive(Debug, Clone, Copy)]
pub struct TestExecutor<'a> {
    config: &'a EngineConfig,
}

impl<'a> TestExecutor<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// Runs the test named by `key`; unknown keys give an error result.
    pub fn execute_key(&self, df: &DataFrame, key: &str, request: &ExecutionRequest) -> TestExecutionResult {
        match TestKind::from_key(key) {
            Some(kind) => self.execute(df, kind, request),
            None => TestExecutionResult::failed(key, EngineError::UnsupportedTest { key: key.to_string() }),
        }
    }

    pub fn execute(&self, df: &DataFrame, kind: TestKind, request: &ExecutionRequest) -> TestExecutionResult {
        let outcome = match kind {
            TestKind::SummaryOnly => Ok(self.summary(df, request)),
            TestKind::FrequencySummary => Ok(self.frequency_summary(df, request)),
            TestKind::ChiSquare | TestKind::FisherExact => self.contingency(df, kind, request),
            TestKind::StudentT | TestKind::WelchT | TestKind::MannWhitney => self.two_groups(df, kind, request),
            TestKind::KruskalWallis => self.kruskal_wallis(df, request),
            TestKind::OneWayAnova => self.one_way_anova(df, request),
            TestKind::TwoWayAnova | TestKind::NWayAnova => self.factorial_anova(df, kind, request),
            TestKind::Ancova => self.ancova(df, request),
            TestKind::Dunnett => self.dunnett(df, request),
            TestKind::PairedT | TestKind::Wilcoxon => self.paired(df, kind, request),
            TestKind::Friedman => self.friedman(df, request),
            TestKind::RepeatedAnova => self.repeated_anova(df, request),
            TestKind::MixedAnova => self.mixed_anova(df, request),
            TestKind::Manova => self.manova(df, request),
            TestKind::CorrelationMatrix => self.correlation_matrix(df, request),
        };
        match outcome {
            Ok(result) => {
                tracing::info!(
                    test = %result.test,
                    statistic = ?result.statistic,
                    p_value = ?result.p_value,
                    "test executed"
                );
                result
            }
            Err(e) => {
                tracing::debug!(test = kind.key(), error = %e, "test failed");
                TestExecutionResult::failed(kind.display_name(), e)
            }
        }
    }

    fn alpha(&self) -> f64 {
        self.config.alpha
    }

    // ── Preparation ───────────────────────────────────────────────────

    fn prepare(&self, df: &DataFrame, request: &ExecutionRequest) -> Result<Prepared, EngineError> {
        let parameter = request.parameter()?;
        df.require(parameter)?;
        let factor_names = request.sorted_grouping();
        for g in &factor_names {
            df.require(g)?;
        }

        let values: Vec<f64> = (0..df.row_count())
            .map(|r| df.numeric_at(parameter, r).unwrap_or(f64::NAN))
            .collect();
        let mut flagged = vec![false; values.len()];
        let mut notes = Vec::new();
        let mut excluded = 0;
        if request.exclude_outliers {
            let report = outlier::detect_named(&values, &request.outlier_method, request.outlier_threshold);
            excluded = report.excluded_count();
            notes.extend(report.notes);
            if excluded > 0 {
                notes.push(format!(
                    "{excluded} outlier(s) excluded from '{parameter}' before testing ({}, whole column)",
                    report.method.name()
                ));
            }
            flagged = report.mask;
        }

        let rows: Vec<PreparedRow> = values
            .iter()
            .enumerate()
            .filter(|(r, v)| v.is_finite() && !flagged[*r])
            .filter_map(|(r, &value)| {
                let labels: Option<Vec<String>> = factor_names.iter().map(|g| df.label_at(g, r)).collect();
                labels.map(|labels| PreparedRow { row: r, labels, value })
            })
            .collect();
        if rows.is_empty() {
            return Err(EngineError::insufficient(format!("no valid data for '{parameter}'")));
        }
        Ok(Prepared {
            factor_names,
            rows,
            excluded,
            notes,
        })
    }

    fn prepare_repeated(&self, df: &DataFrame, request: &ExecutionRequest) -> Result<RepeatedData, EngineError> {
        let subject = request
            .subject_id_column
            .as_deref()
            .ok_or_else(|| EngineError::insufficient("repeated measures require a subject identifier column"))?;
        df.require(subject)?;
        if request.measurement_columns.len() < 2 {
            return Err(EngineError::insufficient(format!(
                "repeated measures need at least 2 within-subject levels, found {}",
                request.measurement_columns.len()
            )));
        }
        let between = request.sorted_grouping();
        let long = to_long_form(df, subject, &request.measurement_columns, &between, &request.within_factor_name)?;

        let missing_rows = |column: &str| (0..df.row_count()).filter(|&r| df.label_at(column, r).is_none()).count();
        let mut missing = Vec::new();
        let n = missing_rows(subject);
        if n > 0 {
            missing.push(format!("subject id '{subject}' missing in {n} row(s)"));
        }
        for g in &between {
            let n = missing_rows(g);
            if n > 0 {
                missing.push(format!("grouping parameter '{g}' missing in {n} row(s)"));
            }
        }
        if !missing.is_empty() {
            return Err(EngineError::insufficient(format!(
                "missing identifiers: {}",
                missing.join("; ")
            )));
        }
        if long.rows.iter().all(|r| r.value.is_none()) {
            return Err(EngineError::insufficient("no valid data"));
        }

        let mut notes = Vec::new();
        let mut excluded = 0;
        let long = if request.exclude_outliers {
            let values: Vec<f64> = long.rows.iter().map(|r| r.value.unwrap_or(f64::NAN)).collect();
            let report = outlier::detect_named(&values, &request.outlier_method, request.outlier_threshold);
            excluded = report.excluded_count();
            notes.extend(report.notes);
            if excluded > 0 {
                notes.push(format!(
                    "{excluded} outlier(s) excluded across all levels ({}); they are treated as missing observations",
                    report.method.name()
                ));
            }
            long.with_values_removed(&report.mask)
        } else {
            long
        };
        Ok(RepeatedData { long, excluded, notes })
    }

    fn control_among<'g>(&self, groups: &'g [Group], request: &ExecutionRequest, notes: &mut Vec<String>) -> Option<&'g str> {
        let control = request.control_group.as_deref()?;
        let found = groups.iter().find(|(name, _)| name == control).map(|(name, _)| name.as_str());
        if found.is_none() {
            notes.push(format!(
                "Control group '{control}' not found among the groups; all pairwise comparisons used"
            ));
        }
        found
    }

    fn attach_posthoc(result: &mut TestExecutionResult, posthoc: Result<PosthocResult, EngineError>) {
        match posthoc {
            Ok(p) => result.posthoc = Some(p),
            Err(e) => result.note(format!("Post-hoc comparisons not computed: {e}")),
        }
    }

    // ── Descriptive ───────────────────────────────────────────────────

    fn summary(&self, df: &DataFrame, request: &ExecutionRequest) -> TestExecutionResult {
        let mut result = TestExecutionResult::new(TestKind::SummaryOnly.display_name());
        if request.is_repeated {
            let mut table = descriptives(&[]);
            for level in &request.measurement_columns {
                let single = ExecutionRequest {
                    measurement_columns: vec![level.clone()],
                    is_repeated: false,
                    exclude_outliers: false,
                    ..request.clone()
                };
                match self.prepare(df, &single) {
                    Ok(p) => {
                        let groups: Vec<Group> = p
                            .groups()
                            .into_iter()
                            .map(|(g, v)| {
                                let label = if p.factor_names.is_empty() {
                                    level.clone()
                                } else {
                                    format!("{level} | {g}")
                                };
                                (label, v)
                            })
                            .collect();
                        table.extend(descriptives(&groups));
                    }
                    Err(e) => result.note(format!("No summary for '{level}': {e}")),
                }
            }
            return result.with_table(table);
        }
        match self.prepare(df, request) {
            Ok(p) => {
                let table = descriptives(&p.groups());
                p.attach(result.with_table(table))
            }
            Err(e) => {
                result.note(format!("No descriptive summary available: {e}"));
                result
            }
        }
    }

    fn frequency_summary(&self, df: &DataFrame, request: &ExecutionRequest) -> TestExecutionResult {
        let mut result = TestExecutionResult::new(TestKind::FrequencySummary.display_name());
        match self.frequencies(df, request) {
            Ok(counts) => {
                let mut table = ResultTable::new(&["Group", "Value", "Count"]);
                for ((group, value), n) in counts {
                    table.push(vec![Cell::text(group), Cell::text(value), Cell::count(n)]);
                }
                result.with_table(table)
            }
            Err(e) => {
                result.note(format!("No frequency summary available: {e}"));
                result
            }
        }
    }

    /// Counts of (group, value) pairs over rows where both are present.
    fn frequencies(
        &self,
        df: &DataFrame,
        request: &ExecutionRequest,
    ) -> Result<BTreeMap<(String, String), usize>, EngineError> {
        let parameter = request.parameter()?;
        df.require(parameter)?;
        let factor_names = request.sorted_grouping();
        for g in &factor_names {
            df.require(g)?;
        }
        let mut counts = BTreeMap::new();
        for r in 0..df.row_count() {
            let labels: Option<Vec<String>> = factor_names.iter().map(|g| df.label_at(g, r)).collect();
            if let (Some(labels), Some(value)) = (labels, df.label_at(parameter, r)) {
                *counts.entry((combined_key(&labels), value)).or_insert(0) += 1;
            }
        }
        if counts.is_empty() {
            return Err(EngineError::insufficient(format!("no valid data for '{parameter}'")));
        }
        Ok(counts)
    }

    // ── Contingency ───────────────────────────────────────────────────

    fn contingency(&self, df: &DataFrame, kind: TestKind, request: &ExecutionRequest) -> Result<TestExecutionResult, EngineError> {
        if request.grouping_columns.is_empty() {
            return Err(EngineError::insufficient(
                "a contingency test needs at least one grouping factor",
            ));
        }
        let counts = self.frequencies(df, request)?;
        let mut values: Vec<&str> = counts.keys().map(|(_, v)| v.as_str()).collect();
        values.sort_unstable();
        values.dedup();
        let mut groups: Vec<&str> = counts.keys().map(|(g, _)| g.as_str()).collect();
        groups.sort_unstable();
        groups.dedup();
        let (n_rows, n_cols) = (values.len(), groups.len());
        if n_rows < 2 || n_cols < 2 {
            return Err(EngineError::insufficient(format!(
                "contingency table is {n_rows}x{n_cols}; at least 2x2 is required"
            )));
        }

        let mut cells = Vec::with_capacity(n_rows * n_cols);
        let mut header = vec!["Value"];
        header.extend(groups.iter().copied());
        let mut table = ResultTable::new(&header);
        for v in &values {
            let mut row = vec![Cell::text(*v)];
            for g in &groups {
                let n = counts
                    .get(&(g.to_string(), v.to_string()))
                    .copied()
                    .unwrap_or(0);
                cells.push(n as f64);
                row.push(Cell::count(n));
            }
            table.push(row);
        }

        let chi = testing::chi_squared_independence(&cells, n_rows, n_cols, true)
            .ok_or_else(|| EngineError::insufficient("chi-square test could not be computed"))?;
        let is_2x2 = n_rows == 2 && n_cols == 2;
        let sparse = chi.min_expected() < self.config.min_expected_frequency;

        if kind == TestKind::FisherExact || (is_2x2 && sparse) {
            if !is_2x2 {
                return Err(EngineError::insufficient(format!(
                    "Fisher's exact test needs a 2x2 table, found {n_rows}x{n_cols}"
                )));
            }
            let [a, b, c, d] = [cells[0], cells[1], cells[2], cells[3]].map(|x| x as u64);
            let fisher = testing::fisher_exact_test(a, b, c, d)
                .ok_or_else(|| EngineError::insufficient("Fisher's exact test could not be computed"))?;
            let mut result = TestExecutionResult::new(TestKind::FisherExact.display_name())
                .with_statistic(fisher.statistic, fisher.p_value)
                .with_table(table);
            if kind == TestKind::ChiSquare {
                tracing::warn!(min_expected = chi.min_expected(), "sparse 2x2 table, Fisher's exact test substituted");
                result.note(format!(
                    "Expected cell count below {} (minimum {:.2}) in a 2x2 table; Fisher's Exact Test used instead of chi-square",
                    self.config.min_expected_frequency,
                    chi.min_expected()
                ));
            }
            result.note("Statistic is the sample odds ratio");
            return Ok(result);
        }

        let mut result = TestExecutionResult::new(TestKind::ChiSquare.display_name())
            .with_statistic(chi.statistic, chi.p_value)
            .with_table(table);
        if chi.yates {
            result.note("Yates' continuity correction applied to the 2x2 table");
        }
        if sparse {
            result.note(format!(
                "Caution: at least one expected cell count is below {} (minimum {:.2}); the chi-square approximation may be unreliable",
                self.config.min_expected_frequency,
                chi.min_expected()
            ));
        }
        Ok(result)
    }

    // ── Independent groups ────────────────────────────────────────────

    fn two_groups(&self, df: &DataFrame, kind: TestKind, request: &ExecutionRequest) -> Result<TestExecutionResult, EngineError> {
        let prepared = self.prepare(df, request)?;
        let groups = prepared.groups();
        let name = kind.display_name();
        if groups.len() != 2 {
            return Err(EngineError::insufficient(format!(
                "{name} requires exactly 2 groups, found {}",
                groups.len()
            )));
        }
        let (a, b) = (&groups[0].1, &groups[1].1);
        let outcome = match kind {
            TestKind::StudentT => testing::student_t_test(a, b),
            TestKind::WelchT => testing::welch_t_test(a, b),
            _ => testing::mann_whitney_u_test(a, b),
        };
        let r = outcome.ok_or_else(|| {
            EngineError::insufficient(format!(
                "{name} could not be computed (each group needs at least 2 values and some variability)"
            ))
        })?;
        let result = TestExecutionResult::new(name)
            .with_statistic(r.statistic, r.p_value)
            .with_table(test_table(&format!("{} vs {}", groups[0].0, groups[1].0), &r));
        Ok(prepared.attach(result))
    }

    fn kruskal_wallis(&self, df: &DataFrame, request: &ExecutionRequest) -> Result<TestExecutionResult, EngineError> {
        let prepared = self.prepare(df, request)?;
        let groups = prepared.groups();
        need_groups(&groups, 2, "Kruskal-Wallis")?;
        let r = testing::kruskal_wallis_test(&refs(&groups))
            .ok_or_else(|| EngineError::insufficient("Kruskal-Wallis could not be computed (all values tied)"))?;
        let mut result = TestExecutionResult::new(TestKind::KruskalWallis.display_name())
            .with_statistic(r.statistic, r.p_value)
            .with_table(test_table("H", &r));
        if r.p_value <= self.alpha() {
            let mut notes = Vec::new();
            let control = self.control_among(&groups, request, &mut notes);
            notes.into_iter().for_each(|n| result.note(n));
            Self::attach_posthoc(&mut result, posthoc::pairwise_mann_whitney(&groups, control, self.alpha()));
        }
        Ok(prepared.attach(result))
    }

    fn one_way_anova(&self, df: &DataFrame, request: &ExecutionRequest) -> Result<TestExecutionResult, EngineError> {
        let prepared = self.prepare(df, request)?;
        let groups = prepared.groups();
        need_groups(&groups, 2, "One-way ANOVA")?;
        let r = testing::one_way_anova(&refs(&groups)).ok_or_else(|| {
            EngineError::insufficient("one-way ANOVA could not be computed (no within-group variability)")
        })?;
        let source = if prepared.factor_names.is_empty() {
            "Between".to_string()
        } else {
            prepared.factor_names.join(":")
        };
        let table = AnovaTable {
            rows: vec![AnovaRow {
                source,
                ss: r.ss_between,
                df: r.df_between,
                ms: r.ms_between,
                f: r.f_statistic,
                p_value: r.p_value,
            }],
            residual_ss: r.ss_within,
            residual_df: r.df_within,
        };
        let mut result = TestExecutionResult::new(TestKind::OneWayAnova.display_name())
            .with_statistic(r.f_statistic, r.p_value)
            .with_table(table.to_result_table());

        if r.p_value <= self.alpha() {
            let error = Some((r.ms_within, r.df_within as f64));
            let mut notes = Vec::new();
            let posthoc = match self.control_among(&groups, request, &mut notes) {
                Some(control) => {
                    posthoc::dunnett(&groups, control, error, self.alpha(), self.config.dunnett_resolution)
                }
                None => posthoc::tukey_hsd(&groups, error, self.alpha()),
            };
            notes.into_iter().for_each(|n| result.note(n));
            Self::attach_posthoc(&mut result, posthoc);
        }
        Ok(prepared.attach(result))
    }

    fn factorial_model(prepared: &Prepared) -> Result<LinearModel, EngineError> {
        let y: Vec<f64> = prepared.rows.iter().map(|r| r.value).collect();
        prepared
            .factor_names
            .iter()
            .enumerate()
            .try_fold(LinearModel::new(y), |model, (i, name)| {
                let labels: Vec<String> = prepared.rows.iter().map(|r| r.labels[i].clone()).collect();
                model.with_factor(Factor::from_labels(name, &labels))
            })
    }

    fn factorial_anova(&self, df: &DataFrame, kind: TestKind, request: &ExecutionRequest) -> Result<TestExecutionResult, EngineError> {
        let prepared = self.prepare(df, request)?;
        let k = prepared.factor_names.len();
        if kind == TestKind::TwoWayAnova && k != 2 {
            return Err(EngineError::insufficient(format!(
                "two-way ANOVA needs exactly 2 grouping factors, found {k}"
            )));
        }
        if k < 2 {
            return Err(EngineError::insufficient(format!(
                "N-way ANOVA needs at least 2 grouping factors, found {k}"
            )));
        }
        let model = Self::factorial_model(&prepared)?;
        let terms = model.full_factorial();
        let anova = model.anova(&terms)?;
        let top = terms
            .last()
            .ok_or_else(|| EngineError::fit("factorial model without terms"))?;
        let top_name = model.term_name(top);
        let interaction = anova
            .term(&top_name)
            .ok_or_else(|| EngineError::fit(format!("term '{top_name}' missing from the ANOVA table")))?;

        let mut result = TestExecutionResult::new(kind.display_name())
            .with_statistic(interaction.f, interaction.p_value)
            .with_table(anova.to_result_table());
        result.note(format!(
            "Type II sums of squares; statistic and p-value refer to the interaction '{top_name}'"
        ));

        let error = Some((anova.mse(), anova.residual_df as f64));
        if interaction.p_value <= self.alpha() {
            let focus = &prepared.factor_names[0];
            let mut cells: BTreeMap<(String, String), Vec<f64>> = BTreeMap::new();
            for r in &prepared.rows {
                cells
                    .entry((combined_key(&r.labels[1..]), r.labels[0].clone()))
                    .or_default()
                    .push(r.value);
            }
            let cells: Vec<EffectCell> = cells
                .into_iter()
                .map(|((condition, group), values)| EffectCell { condition, group, values })
                .collect();
            result.note(format!(
                "Significant interaction '{top_name}': simple effects of '{focus}' within each level of {} reported instead of main-effect comparisons",
                prepared.factor_names[1..].join(" x ")
            ));
            Self::attach_posthoc(&mut result, posthoc::simple_effects(&cells, error, self.alpha()));
        } else {
            let mut merged: Option<PosthocResult> = None;
            let mut significant = Vec::new();
            for (i, name) in prepared.factor_names.iter().enumerate() {
                if !anova.term(name).is_some_and(|row| row.p_value <= self.alpha()) {
                    continue;
                }
                let mut by_level: BTreeMap<String, Vec<f64>> = BTreeMap::new();
                for r in &prepared.rows {
                    by_level.entry(r.labels[i].clone()).or_default().push(r.value);
                }
                let groups: Vec<Group> = by_level.into_iter().collect();
                match posthoc::tukey_hsd(&groups, error, self.alpha()) {
                    Ok(mut ph) => {
                        for row in &mut ph.table.rows {
                            if let Some(Cell::Text(label)) = row.first_mut() {
                                *label = format!("{name}: {label}");
                            }
                        }
                        significant.push(name.clone());
                        match merged.as_mut() {
                            Some(m) => m.table.extend(ph.table),
                            None => merged = Some(ph),
                        }
                    }
                    Err(e) => result.note(format!("Post-hoc comparisons for '{name}' not computed: {e}")),
                }
            }
            if let Some(mut ph) = merged {
                ph.rationale = format!(
                    "pairwise comparisons of the significant main effect(s) {} using the model MSE",
                    significant.join(", ")
                );
                result.posthoc = Some(ph);
            }
        }
        Ok(prepared.attach(result))
    }

    fn ancova(&self, df: &DataFrame, request: &ExecutionRequest) -> Result<TestExecutionResult, EngineError> {
        let covariate = request
            .covariate
            .as_deref()
            .ok_or_else(|| EngineError::insufficient("ANCOVA needs a covariate column"))?;
        df.require(covariate)?;
        let prepared = self.prepare(df, request)?;
        if prepared.factor_names.is_empty() {
            return Err(EngineError::insufficient("ANCOVA needs a grouping factor"));
        }

        let mut y = Vec::new();
        let mut labels = Vec::new();
        let mut x = Vec::new();
        for r in &prepared.rows {
            if let Some(c) = df.numeric_at(covariate, r.row) {
                y.push(r.value);
                labels.push(combined_key(&r.labels));
                x.push(c);
            }
        }
        let dropped = prepared.rows.len() - y.len();
        let group_name = prepared.factor_names.join(":");
        let factor = Factor::from_labels(&group_name, &labels);
        if factor.level_count() < 2 {
            return Err(EngineError::insufficient(format!(
                "ANCOVA needs at least 2 groups with covariate values, found {}",
                factor.level_count()
            )));
        }
        let model = LinearModel::new(y).with_factor(factor)?.with_covariate(covariate, x)?;

        let slopes_terms = [
            Term::factor(0),
            Term::covariate(0),
            Term::interaction(&[Part::Factor(0), Part::Covariate(0)]),
        ];
        let slopes = model.anova(&slopes_terms)?;
        let slopes_name = model.term_name(&slopes_terms[2]);
        let slopes_row = slopes
            .term(&slopes_name)
            .ok_or_else(|| EngineError::fit("slope interaction missing from the ANOVA table"))?;

        let mut result;
        if slopes_row.p_value <= self.alpha() {
            tracing::warn!(p_value = slopes_row.p_value, "heterogeneous regression slopes");
            result = TestExecutionResult::new(TestKind::Ancova.display_name())
                .with_statistic(slopes_row.f, slopes_row.p_value)
                .with_table(slopes.to_result_table());
            result.note(format!(
                "Homogeneity of regression slopes rejected (F = {:.3}, p = {:.4}): the effect of '{covariate}' differs by group, so the interaction model is reported instead of a standard ANCOVA",
                slopes_row.f, slopes_row.p_value
            ));
        } else {
            let terms = [Term::factor(0), Term::covariate(0)];
            let anova = model.anova(&terms)?;
            let group = anova
                .term(&group_name)
                .ok_or_else(|| EngineError::fit("group term missing from the ANOVA table"))?;
            result = TestExecutionResult::new(TestKind::Ancova.display_name())
                .with_statistic(group.f, group.p_value)
                .with_table(anova.to_result_table());
            result.note(format!(
                "Homogeneity of regression slopes holds (interaction p = {:.4}); group effect adjusted for '{covariate}'",
                slopes_row.p_value
            ));
        }
        if dropped > 0 {
            result.note(format!("{dropped} row(s) without a covariate value excluded"));
        }
        Ok(prepared.attach(result))
    }

    fn dunnett(&self, df: &DataFrame, request: &ExecutionRequest) -> Result<TestExecutionResult, EngineError> {
        let control = request
            .control_group
            .as_deref()
            .ok_or_else(|| EngineError::insufficient("Dunnett's test needs a control group"))?;
        let prepared = self.prepare(df, request)?;
        let groups = prepared.groups();
        need_groups(&groups, 2, "Dunnett's test")?;
        let ph = posthoc::dunnett(&groups, control, None, self.alpha(), self.config.dunnett_resolution)?;
        let max_t = ph
            .table
            .column_values("t")
            .into_iter()
            .flatten()
            .map(f64::abs)
            .fold(f64::NAN, f64::max);
        let min_p = ph
            .table
            .column_values("p-adj")
            .into_iter()
            .flatten()
            .fold(f64::NAN, f64::min);
        let mut result = TestExecutionResult::new(TestKind::Dunnett.display_name())
            .with_statistic(max_t, min_p)
            .with_table(ph.table);
        result.note("Statistic is the largest |t| over all comparisons with the control; p-value is the smallest adjusted p");
        Ok(prepared.attach(result))
    }

    // ── Repeated measures ─────────────────────────────────────────────

    fn paired(&self, df: &DataFrame, kind: TestKind, request: &ExecutionRequest) -> Result<TestExecutionResult, EngineError> {
        let data = self.prepare_repeated(df, request)?;
        let name = kind.display_name();
        if data.long.levels.len() != 2 {
            return Err(EngineError::insufficient(format!(
                "{name} requires exactly 2 within-subject levels, found {}",
                data.long.levels.len()
            )));
        }
        let (_, rows, dropped) = data.complete();
        let x: Vec<f64> = rows.iter().map(|r| r[0]).collect();
        let y: Vec<f64> = rows.iter().map(|r| r[1]).collect();
        let outcome = match kind {
            TestKind::PairedT => testing::paired_t_test(&x, &y),
            _ => testing::wilcoxon_signed_rank_test(&x, &y),
        };
        let r = outcome.ok_or_else(|| {
            EngineError::insufficient(format!(
                "{name} could not be computed ({} complete pair(s); non-zero differences required)",
                rows.len()
            ))
        })?;
        let label = format!("{} vs {}", data.long.levels[0], data.long.levels[1]);
        let mut result = TestExecutionResult::new(name)
            .with_statistic(r.statistic, r.p_value)
            .with_table(test_table(&label, &r));
        if dropped > 0 {
            result.note(format!(
                "{dropped} subject(s) without both observations excluded (complete pairs required)"
            ));
        }
        Ok(data.attach(result))
    }

    fn friedman(&self, df: &DataFrame, request: &ExecutionRequest) -> Result<TestExecutionResult, EngineError> {
        let data = self.prepare_repeated(df, request)?;
        let (_, rows, dropped) = data.complete();
        let r = testing::friedman_test(&rows).ok_or_else(|| {
            EngineError::insufficient(format!(
                "Friedman test could not be computed ({} complete subject(s))",
                rows.len()
            ))
        })?;
        let mut result = TestExecutionResult::new(TestKind::Friedman.display_name())
            .with_statistic(r.statistic, r.p_value)
            .with_table(test_table("Chi2", &r));
        if dropped > 0 {
            result.note(format!("{dropped} incomplete subject(s) excluded"));
        }
        if r.p_value <= self.alpha() {
            let levels = data.level_groups(&rows);
            Self::attach_posthoc(
                &mut result,
                posthoc::pairwise_paired(&levels, PairedMethod::Wilcoxon, self.alpha()),
            );
        }
        Ok(data.attach(result))
    }

    /// Random-intercept model on every observed long-form value.
    fn mixed_model(&self, long: &LongForm, between_name: Option<&str>) -> Result<TestExecutionResult, EngineError> {
        let rows: Vec<_> = long.identified_rows().filter(|r| r.value.is_some()).collect();
        let y: Vec<f64> = rows.iter().filter_map(|r| r.value).collect();
        let mut subject_index: BTreeMap<&str, usize> = BTreeMap::new();
        let mut subjects = Vec::with_capacity(rows.len());
        for r in &rows {
            let id = r.subject.as_deref().unwrap_or_default();
            let next = subject_index.len();
            subjects.push(*subject_index.entry(id).or_insert(next));
        }

        let mut model = LinearModel::new(y.clone());
        if let Some(name) = between_name {
            let labels: Vec<String> = rows
                .iter()
                .map(|r| r.between.iter().flatten().cloned().collect::<Vec<_>>())
                .map(|l| combined_key(&l))
                .collect();
            model = model.with_factor(Factor::from_labels(name, &labels))?;
        }
        let levels: Vec<String> = rows.iter().map(|r| r.level.clone()).collect();
        model = model.with_factor(Factor::from_labels(&long.within_name, &levels))?;

        let terms = model.full_factorial();
        let (x, ranges) = model.design(&terms);
        let named: Vec<(String, Range<usize>)> = terms
            .iter()
            .zip(ranges)
            .map(|(t, r)| (model.term_name(t), r))
            .collect();
        let focus = named
            .last()
            .map(|(name, _)| name.clone())
            .ok_or_else(|| EngineError::fit("mixed model without fixed-effect terms"))?;
        let fit = fit_random_intercept(&y, &x, &subjects, &named)?;
        let wald = fit
            .wald_test(&focus)
            .ok_or_else(|| EngineError::fit(format!("no Wald test for '{focus}'")))?;
        let mut result = TestExecutionResult::new("Linear mixed-effects model (REML)")
            .with_statistic(wald.chi2, wald.p_value)
            .with_table(fit.to_result_table());
        result.note(format!(
            "Statistic is the Wald chi-square of '{focus}' ({} observations, {} subjects)",
            fit.n_obs, fit.n_subjects
        ));
        Ok(result)
    }

    /// Runs the classic procedure on complete data, or `mixed` (and then
    /// listwise deletion) when values are missing.
    fn with_missing_data_fallback(
        data: &RepeatedData,
        test: &str,
        mixed: impl FnOnce() -> Result<TestExecutionResult, EngineError>,
        classic: impl Fn(&[String], &[Vec<f64>]) -> Result<TestExecutionResult, EngineError>,
    ) -> Result<TestExecutionResult, EngineError> {
        let missing = data.long.missing_value_count();
        if missing == 0 {
            let (groups, rows, _) = data.complete();
            return classic(&groups, &rows);
        }
        tracing::warn!(missing, test, "incomplete repeated data, fitting a mixed-effects model");
        let substitution = format!(
            "{missing} missing observation(s) in the repeated measurements; a linear mixed-effects model (random intercept per subject, REML) was used instead of the {test} so that no subject is dropped"
        );
        match mixed() {
            Ok(mut result) => {
                result.notes.insert(0, substitution);
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(error = %e, "mixed-effects model failed, listwise deletion");
                let (groups, rows, dropped) = data.complete();
                let mut result = classic(&groups, &rows)?;
                result.notes.insert(0, substitution);
                result.notes.insert(
                    1,
                    format!(
                        "The mixed-effects model failed ({e}); fell back to the {test} with listwise deletion of {dropped} incomplete subject(s)"
                    ),
                );
                Ok(result)
            }
        }
    }

    fn rm_result(test: &str, anova: RepeatedAnova, effect: &str) -> Result<TestExecutionResult, EngineError> {
        let row = anova
            .effect(effect)
            .ok_or_else(|| EngineError::fit(format!("effect '{effect}' missing from the ANOVA table")))?;
        let mut result = TestExecutionResult::new(test)
            .with_statistic(row.f, row.p_value)
            .with_table(anova.to_result_table());
        result.notes.extend(anova.notes.iter().cloned());
        Ok(result)
    }

    fn repeated_anova(&self, df: &DataFrame, request: &ExecutionRequest) -> Result<TestExecutionResult, EngineError> {
        let mut ignored = None;
        let request = if request.grouping_columns.is_empty() {
            request.clone()
        } else {
            ignored = Some(request.sorted_grouping().join(", "));
            ExecutionRequest {
                grouping_columns: Vec::new(),
                ..request.clone()
            }
        };
        let data = self.prepare_repeated(df, &request)?;
        let within = request.within_factor_name.clone();
        let test = TestKind::RepeatedAnova.display_name();
        let alpha = self.alpha();

        let mut result = Self::with_missing_data_fallback(
            &data,
            test,
            || self.mixed_model(&data.long, None),
            |_, rows| {
                let anova = repeated::rm_anova(rows, &within, alpha)?;
                let significant = anova.effect(&within).is_some_and(|e| e.p_value <= alpha);
                let mut result = Self::rm_result(test, anova, &within)?;
                if significant {
                    Self::attach_posthoc(
                        &mut result,
                        posthoc::pairwise_paired(&data.level_groups(rows), PairedMethod::TTest, alpha),
                    );
                }
                Ok(result)
            },
        )?;
        if let Some(cols) = ignored {
            result.note(format!(
                "Between-subject factor(s) {cols} ignored by the one-way repeated-measures ANOVA; use the mixed ANOVA to model them"
            ));
        }
        Ok(data.attach(result))
    }

    fn mixed_anova(&self, df: &DataFrame, request: &ExecutionRequest) -> Result<TestExecutionResult, EngineError> {
        if request.grouping_columns.is_empty() {
            return Err(EngineError::insufficient(
                "mixed ANOVA needs at least one between-subject grouping factor",
            ));
        }
        let data = self.prepare_repeated(df, request)?;
        let between = request.sorted_grouping().join(" x ");
        let within = request.within_factor_name.clone();
        let interaction = format!("{between}:{within}");
        let test = TestKind::MixedAnova.display_name();
        let alpha = self.alpha();

        let result = Self::with_missing_data_fallback(
            &data,
            test,
            || self.mixed_model(&data.long, Some(&between)),
            |groups, rows| {
                let index: BTreeMap<&str, usize> = {
                    let mut names: Vec<&str> = groups.iter().map(String::as_str).collect();
                    names.sort_unstable();
                    names.dedup();
                    names.into_iter().enumerate().map(|(i, g)| (g, i)).collect()
                };
                let codes: Vec<usize> = groups.iter().map(|g| index.get(g.as_str()).copied().unwrap_or(0)).collect();
                let anova = repeated::mixed_anova(rows, &codes, index.len(), &between, &within, alpha)?;
                let interaction_p = anova.effect(&interaction).map(|e| e.p_value);
                let within_p = anova.effect(&within).map(|e| e.p_value);
                let mut result = Self::rm_result(test, anova, &interaction)?;

                if interaction_p.is_some_and(|p| p <= alpha) {
                    let mut cells: BTreeMap<(String, String), Vec<f64>> = BTreeMap::new();
                    for (g, r) in groups.iter().zip(rows) {
                        for (level, v) in data.long.levels.iter().zip(r) {
                            cells.entry((level.clone(), g.clone())).or_default().push(*v);
                        }
                    }
                    let cells: Vec<EffectCell> = cells
                        .into_iter()
                        .map(|((condition, group), values)| EffectCell { condition, group, values })
                        .collect();
                    result.note(format!(
                        "Significant interaction '{interaction}': groups compared at each level of '{within}' instead of main-effect comparisons"
                    ));
                    Self::attach_posthoc(&mut result, posthoc::simple_effects(&cells, None, alpha));
                } else if within_p.is_some_and(|p| p <= alpha) {
                    Self::attach_posthoc(
                        &mut result,
                        posthoc::pairwise_paired(&data.level_groups(rows), PairedMethod::TTest, alpha),
                    );
                }
                Ok(result)
            },
        )?;
        Ok(data.attach(result))
    }

    // ── Cross-parameter ───────────────────────────────────────────────

    fn manova(&self, df: &DataFrame, request: &ExecutionRequest) -> Result<TestExecutionResult, EngineError> {
        let columns = &request.measurement_columns;
        if columns.len() < 2 {
            return Err(EngineError::insufficient(format!(
                "MANOVA needs at least 2 measurement columns, found {}",
                columns.len()
            )));
        }
        let factor_names = request.sorted_grouping();
        if factor_names.is_empty() {
            return Err(EngineError::insufficient("MANOVA needs at least one grouping factor"));
        }
        for name in columns.iter().chain(&factor_names) {
            df.require(name)?;
        }

        let n = df.row_count();
        let mut flagged = vec![false; n];
        let mut notes = Vec::new();
        if request.exclude_outliers {
            for c in columns {
                let values: Vec<f64> = (0..n).map(|r| df.numeric_at(c, r).unwrap_or(f64::NAN)).collect();
                let report = outlier::detect_named(&values, &request.outlier_method, request.outlier_threshold);
                for note in report.notes {
                    if !notes.contains(&note) {
                        notes.push(note);
                    }
                }
                for (f, m) in flagged.iter_mut().zip(report.mask) {
                    *f |= m;
                }
            }
        }
        let excluded = flagged.iter().filter(|&&f| f).count();
        if excluded > 0 {
            notes.push(format!("{excluded} row(s) with an outlier in any measurement excluded"));
        }

        let mut rows = Vec::new();
        let mut keys = Vec::new();
        for r in (0..n).filter(|&r| !flagged[r]) {
            let labels: Option<Vec<String>> = factor_names.iter().map(|g| df.label_at(g, r)).collect();
            let values: Option<Vec<f64>> = columns.iter().map(|c| df.numeric_at(c, r)).collect();
            if let (Some(labels), Some(values)) = (labels, values) {
                keys.push(combined_key(&labels));
                rows.push(values);
            }
        }
        if rows.is_empty() {
            return Err(EngineError::insufficient("no valid data"));
        }
        let mut names: Vec<&str> = keys.iter().map(String::as_str).collect();
        names.sort_unstable();
        names.dedup();
        let codes: Vec<usize> = keys
            .iter()
            .map(|k| names.binary_search(&k.as_str()).unwrap_or(0))
            .collect();

        let fit = multivariate::manova(&rows, &codes, names.len())?;
        let mut result = TestExecutionResult::new(TestKind::Manova.display_name())
            .with_statistic(fit.pillai.value, fit.pillai.p_value)
            .with_table(fit.to_result_table());
        result.notes = notes;
        result.outliers_excluded = excluded;
        result.note("Pillai's trace is the primary statistic; Wilks' lambda reported alongside");
        Ok(result)
    }

    fn correlation_matrix(&self, df: &DataFrame, request: &ExecutionRequest) -> Result<TestExecutionResult, EngineError> {
        let names = if request.measurement_columns.len() >= 2 {
            request.measurement_columns.clone()
        } else {
            df.numeric_column_names()
        };
        if names.len() < 2 {
            return Err(EngineError::insufficient(format!(
                "correlation matrix needs at least 2 numeric columns, found {}",
                names.len()
            )));
        }
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            df.require(&name)?;
            let values: Vec<Option<f64>> = (0..df.row_count()).map(|r| df.numeric_at(&name, r)).collect();
            columns.push((name, values));
        }
        let table = multivariate::correlation_matrix(&columns)?;
        let mut result = TestExecutionResult::new(TestKind::CorrelationMatrix.display_name()).with_table(table);
        result.note("Pearson correlations on pairwise complete observations");
        Ok(result)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataframe::Column;
    use crate::special::normal_quantile;

    fn normal_fixture(n: usize, mu: f64, sigma: f64) -> Vec<f64> {
        (1..=n)
            .map(|i| mu + sigma * normal_quantile((i as f64 - 0.375) / (n as f64 + 0.25)))
            .collect()
    }

    fn frame(groups: &[(&str, Vec<f64>)]) -> DataFrame {
        let mut labels = Vec::new();
        let mut values = Vec::new();
        for (g, v) in groups {
            for x in v {
                labels.push(Some(g.to_string()));
                values.push(*x);
            }
        }
        DataFrame::new()
            .with_column("group", Column::from_labels(&labels))
            .unwrap()
            .with_column("value", Column::from_f64s(&values))
            .unwrap()
    }

    fn run(df: &DataFrame, key: &str, request: &ExecutionRequest) -> TestExecutionResult {
        let config = EngineConfig::default();
        TestExecutor::new(&config).execute_key(df, key, request)
    }

    fn independent() -> ExecutionRequest {
        ExecutionRequest::new(&["value"], &["group"])
    }

    fn three_groups() -> DataFrame {
        frame(&[
            ("a", normal_fixture(15, 10.0, 2.0)),
            ("b", normal_fixture(15, 15.0, 2.0)),
            ("c", normal_fixture(15, 20.0, 2.0)),
        ])
    }

    #[test]
    fn t_test_separated_groups() {
        let df = frame(&[("a", normal_fixture(20, 10.0, 2.0)), ("b", normal_fixture(20, 15.0, 2.0))]);
        let r = run(&df, "ttest_ind", &independent());
        assert!(r.is_ok(), "{:?}", r.error);
        assert_eq!(r.test, "Independent t-test");
        assert!(r.statistic.is_some());
        assert!(r.p_value.unwrap() < 0.05);
    }

    #[test]
    fn execution_is_idempotent() {
        let df = three_groups();
        let first = run(&df, "anova_oneway", &independent());
        let second = run(&df, "anova_oneway", &independent());
        assert_eq!(first.statistic.unwrap().to_bits(), second.statistic.unwrap().to_bits());
        assert_eq!(first.p_value.unwrap().to_bits(), second.p_value.unwrap().to_bits());
    }

    #[test]
    fn two_group_tests_reject_other_counts() {
        let r = run(&three_groups(), "mann_whitney", &independent());
        assert!(r.error.as_deref().unwrap().contains("exactly 2 groups"));
        assert!(r.statistic.is_none());
    }

    #[test]
    fn one_way_anova_with_tukey() {
        let r = run(&three_groups(), "anova_oneway", &independent());
        assert!(r.p_value.unwrap() < 0.05);
        let ph = r.posthoc.as_ref().unwrap();
        assert_eq!(ph.method, "Tukey HSD");
        assert_eq!(ph.table.len(), 3);
        let table = r.results_data.as_ref().unwrap();
        assert!(table.value("group", "F").is_some());
        assert!(table.row("Residual").is_some());
    }

    #[test]
    fn one_way_anova_with_control_uses_dunnett() {
        let r = run(&three_groups(), "anova_oneway", &independent().control_group("a"));
        assert_eq!(r.posthoc.as_ref().unwrap().method, "Dunnett");

        let r = run(&three_groups(), "anova_oneway", &independent().control_group("zzz"));
        assert_eq!(r.posthoc.as_ref().unwrap().method, "Tukey HSD");
        assert!(r.notes.iter().any(|n| n.contains("'zzz' not found")));
    }

    #[test]
    fn rank_tests_agree_with_parametric() {
        let df = three_groups();
        let kw = run(&df, "kruskal_wallis", &independent());
        assert!(kw.p_value.unwrap() < 0.05);
        assert!(kw.posthoc.is_some());

        let two = frame(&[("a", normal_fixture(15, 10.0, 2.0)), ("b", normal_fixture(15, 15.0, 2.0))]);
        let mw = run(&two, "mann_whitney", &independent());
        assert!(mw.p_value.unwrap() < 0.05);
    }

    #[test]
    fn empty_and_single_group_errors() {
        let empty = DataFrame::new()
            .with_column("group", Column::from_labels::<&str>(&[]))
            .unwrap()
            .with_column("value", Column::from_f64s(&[]))
            .unwrap();
        let r = run(&empty, "anova_oneway", &independent());
        assert!(r.error.as_deref().unwrap().contains("no valid data"));
        assert!(r.statistic.is_none() && r.p_value.is_none() && r.results_data.is_none());

        let single = frame(&[("a", normal_fixture(10, 1.0, 1.0))]);
        let r = run(&single, "anova_oneway", &independent());
        assert!(r.error.is_some());
        assert!(r.p_value.is_none());
    }

    #[test]
    fn missing_column_is_an_error_result() {
        let r = run(&three_groups(), "anova_oneway", &ExecutionRequest::new(&["ghost"], &["group"]));
        assert_eq!(r.error.as_deref(), Some("column 'ghost' not found"));
        assert_eq!(r.test, "One-way ANOVA");
    }

    #[test]
    fn summary_has_no_statistic_and_no_error() {
        let r = run(&three_groups(), "none", &independent());
        assert!(r.is_ok());
        assert!(r.statistic.is_none());
        assert_eq!(r.results_data.unwrap().len(), 3);
    }

    #[test]
    fn whole_column_outlier_exclusion() {
        let mut a = normal_fixture(15, 10.0, 1.0);
        a.push(60.0);
        let df = frame(&[("a", a), ("b", normal_fixture(15, 11.0, 1.0))]);
        let r = run(&df, "ttest_welch", &independent().exclude_outliers("iqr", None));
        assert_eq!(r.outliers_excluded, 1);
        assert!(r.notes.iter().any(|n| n.contains("whole column")));
    }

    fn categorical(pairs: &[(&str, &str, usize)]) -> DataFrame {
        let mut g = Vec::new();
        let mut o = Vec::new();
        for (group, outcome, n) in pairs {
            for _ in 0..*n {
                g.push(Some(*group));
                o.push(Some(*outcome));
            }
        }
        DataFrame::new()
            .with_column("group", Column::from_labels(&g))
            .unwrap()
            .with_column("outcome", Column::from_labels(&o))
            .unwrap()
    }

    #[test]
    fn sparse_2x2_substitutes_fisher() {
        let df = categorical(&[("a", "yes", 3), ("a", "no", 1), ("b", "yes", 1), ("b", "no", 3)]);
        let r = run(&df, "chi_square", &ExecutionRequest::new(&["outcome"], &["group"]));
        assert_eq!(r.test, "Fisher's Exact Test");
        assert!(r.notes.iter().any(|n| n.contains("instead of chi-square")));
        assert!(r.p_value.unwrap() > 0.05);
    }

    #[test]
    fn chi_square_on_larger_table() {
        let df = categorical(&[
            ("a", "yes", 30),
            ("a", "no", 10),
            ("b", "yes", 12),
            ("b", "no", 28),
            ("c", "yes", 20),
            ("c", "no", 20),
        ]);
        let r = run(&df, "chi_square", &ExecutionRequest::new(&["outcome"], &["group"]));
        assert_eq!(r.test, "Chi-square test of independence");
        assert!(r.p_value.unwrap() < 0.05);
        assert!(!r.notes.iter().any(|n| n.contains("Yates")));
    }

    #[test]
    fn two_way_anova_and_singular_design() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        let mut v = Vec::new();
        for (i, (la, lb, mu)) in [("a1", "b1", 10.0), ("a1", "b2", 12.0), ("a2", "b1", 14.0), ("a2", "b2", 22.0)]
            .iter()
            .enumerate()
        {
            for j in 0..4 {
                a.push(Some(*la));
                b.push(Some(*lb));
                v.push(mu + ((i * 7 + j * 3) % 5) as f64 * 0.3 - 0.6);
            }
        }
        let df = DataFrame::new()
            .with_column("A", Column::from_labels(&a))
            .unwrap()
            .with_column("B", Column::from_labels(&b))
            .unwrap()
            .with_column("v", Column::from_f64s(&v))
            .unwrap();
        let request = ExecutionRequest::new(&["v"], &["B", "A"]);
        let r = run(&df, "anova_twoway", &request);
        assert!(r.is_ok(), "{:?}", r.error);
        assert!(r.results_data.as_ref().unwrap().row("A:B").is_some());
        assert!(r.p_value.unwrap() < 0.05);
        assert_eq!(r.posthoc.as_ref().unwrap().method, "Simple effects");
        assert!(r.notes.iter().any(|n| n.contains("simple effects")));

        let keep: Vec<bool> = (0..16).map(|i| i < 12).collect();
        let holed = df.filter_rows(&keep).unwrap();
        let r = run(&holed, "anova_twoway", &request);
        let err = r.error.as_deref().unwrap();
        assert!(err.contains("A=a2 & B=b2"), "{err}");
    }

    fn three_factor_frame(bump: f64) -> DataFrame {
        let mut a = Vec::new();
        let mut b = Vec::new();
        let mut c = Vec::new();
        let mut v = Vec::new();
        for (ia, la) in ["a1", "a2", "a3"].iter().enumerate() {
            for lb in ["b1", "b2"] {
                for lc in ["c1", "c2"] {
                    let cell = 10.0 + 4.0 * ia as f64 + if (*la, lb, lc) == ("a3", "b2", "c2") { bump } else { 0.0 };
                    for e in [-0.5, 0.0, 0.5] {
                        a.push(Some(*la));
                        b.push(Some(lb));
                        c.push(Some(lc));
                        v.push(cell + e);
                    }
                }
            }
        }
        DataFrame::new()
            .with_column("A", Column::from_labels(&a))
            .unwrap()
            .with_column("B", Column::from_labels(&b))
            .unwrap()
            .with_column("C", Column::from_labels(&c))
            .unwrap()
            .with_column("v", Column::from_f64s(&v))
            .unwrap()
    }

    #[test]
    fn three_factor_anova_follows_up_main_effect() {
        let request = ExecutionRequest::new(&["v"], &["C", "A", "B"]);
        let r = run(&three_factor_frame(0.0), "anova_nway", &request);
        assert!(r.is_ok(), "{:?}", r.error);
        assert_eq!(r.test, "N-way ANOVA");
        let table = r.results_data.as_ref().unwrap();
        for term in ["A", "B", "C", "A:B", "A:C", "B:C", "A:B:C"] {
            assert!(table.row(term).is_some(), "missing {term}");
        }
        assert!(r.notes.iter().any(|n| n.contains("interaction 'A:B:C'")));
        assert!(r.p_value.unwrap() > 0.5);

        let ph = r.posthoc.as_ref().unwrap();
        assert_eq!(ph.method, "Tukey HSD");
        assert!(ph.rationale.contains("main effect(s) A "), "{}", ph.rationale);
        assert_eq!(ph.table.len(), 3);
        assert!(ph.table.row("A: a1 vs a3").is_some());
        assert!(ph
            .table
            .rows
            .iter()
            .all(|row| row.first().and_then(Cell::as_str).is_some_and(|l| l.starts_with("A: "))));
    }

    #[test]
    fn three_factor_interaction_reports_simple_effects() {
        let r = run(
            &three_factor_frame(8.0),
            "anova_nway",
            &ExecutionRequest::new(&["v"], &["A", "B", "C"]),
        );
        assert!(r.is_ok(), "{:?}", r.error);
        assert!(r.p_value.unwrap() < 0.05);
        assert_eq!(r.posthoc.as_ref().unwrap().method, "Simple effects");
        assert!(r
            .notes
            .iter()
            .any(|n| n.contains("simple effects of 'A' within each level of B x C")));
    }

    fn ancova_frame(slopes: [f64; 3]) -> DataFrame {
        let mut g = Vec::new();
        let mut x = Vec::new();
        let mut y = Vec::new();
        for (k, (name, base)) in [("g1", 5.0), ("g2", 8.0), ("g3", 11.0)].iter().enumerate() {
            for i in 1..=8 {
                g.push(Some(*name));
                x.push(i as f64);
                y.push(base + slopes[k] * i as f64 + ((i * 7) % 5) as f64 * 0.1);
            }
        }
        DataFrame::new()
            .with_column("group", Column::from_labels(&g))
            .unwrap()
            .with_column("age", Column::from_f64s(&x))
            .unwrap()
            .with_column("value", Column::from_f64s(&y))
            .unwrap()
    }

    #[test]
    fn ancova_parallel_slopes() {
        let r = run(&ancova_frame([2.0, 2.0, 2.0]), "ancova", &independent().covariate("age"));
        assert!(r.is_ok(), "{:?}", r.error);
        assert!(r.p_value.unwrap() < 0.05);
        assert!(r.notes.iter().any(|n| n.contains("slopes holds")));
        assert!(r.results_data.unwrap().row("group:age").is_none());
    }

    #[test]
    fn ancova_reports_interaction_model_when_slopes_differ() {
        let r = run(&ancova_frame([1.0, 2.0, 4.0]), "ancova", &independent().covariate("age"));
        assert!(r.notes.iter().any(|n| n.contains("interaction model is reported")));
        assert!(r.results_data.unwrap().row("group:age").is_some());
    }

    #[test]
    fn ancova_without_covariate() {
        let r = run(&three_groups(), "ancova", &independent());
        assert!(r.error.as_deref().unwrap().contains("covariate"));
    }

    #[test]
    fn standalone_dunnett() {
        let r = run(&three_groups(), "dunnett", &independent().control_group("a"));
        assert!(r.is_ok(), "{:?}", r.error);
        assert_eq!(r.results_data.as_ref().unwrap().len(), 2);
        assert!(r.p_value.unwrap() < 0.05);

        let r = run(&three_groups(), "dunnett", &independent());
        assert!(r.error.is_some());
    }

    fn repeated_frame(missing: bool) -> DataFrame {
        let n = 8;
        let ids: Vec<String> = (0..n).map(|i| format!("s{i}")).collect();
        let dose: Vec<&str> = (0..n).map(|i| if i % 2 == 0 { "lo" } else { "hi" }).collect();
        let level = |j: usize| -> Vec<Option<f64>> {
            (0..n)
                .map(|i| {
                    if missing && i == 3 && j == 2 {
                        None
                    } else {
                        Some(10.0 + i as f64 * 0.5 + j as f64 * 2.0 + ((i * 7 + j * 3) % 5) as f64 * 0.3 - 0.6)
                    }
                })
                .collect()
        };
        let ids: Vec<Option<&str>> = ids.iter().map(|s| Some(s.as_str())).collect();
        let dose: Vec<Option<&str>> = dose.into_iter().map(Some).collect();
        DataFrame::new()
            .with_column("id", Column::from_labels(&ids))
            .unwrap()
            .with_column("dose", Column::from_labels(&dose))
            .unwrap()
            .with_column("d0", Column::from_numeric_options(&level(0)))
            .unwrap()
            .with_column("d7", Column::from_numeric_options(&level(1)))
            .unwrap()
            .with_column("d14", Column::from_numeric_options(&level(2)))
            .unwrap()
    }

    fn within(levels: &[&str], between: &[&str]) -> ExecutionRequest {
        ExecutionRequest::new(levels, between).repeated("id").within_factor_name("Time")
    }

    #[test]
    fn rm_anova_complete_data() {
        let r = run(&repeated_frame(false), "anova_rm", &within(&["d0", "d7", "d14"], &[]));
        assert!(r.is_ok(), "{:?}", r.error);
        assert_eq!(r.test, "Repeated-measures ANOVA");
        assert!(r.p_value.unwrap() < 0.05);
        assert!(!r.notes.iter().any(|n| n.contains("mixed-effects model")));
        assert_eq!(r.posthoc.as_ref().unwrap().method, "Pairwise paired t-tests (Holm)");
    }

    #[test]
    fn rm_anova_missing_value_uses_mixed_model() {
        let r = run(&repeated_frame(true), "anova_rm", &within(&["d0", "d7", "d14"], &[]));
        assert!(r.is_ok(), "{:?}", r.error);
        assert_eq!(r.test, "Linear mixed-effects model (REML)");
        assert!(r.notes[0].contains("mixed-effects model"));
        assert!(r.p_value.unwrap() < 0.05);
        let table = r.results_data.unwrap();
        assert!(table.row("Time").is_some());
        assert!(table.row("Subject variance").is_some());
    }

    #[test]
    fn mixed_anova_complete_and_incomplete() {
        let request = within(&["d0", "d7", "d14"], &["dose"]);
        let r = run(&repeated_frame(false), "anova_mixed", &request);
        assert!(r.is_ok(), "{:?}", r.error);
        assert!(r.results_data.as_ref().unwrap().row("dose:Time").is_some());

        let r = run(&repeated_frame(true), "anova_mixed", &request);
        assert!(r.is_ok(), "{:?}", r.error);
        assert!(r.notes[0].contains("mixed-effects model"));
    }

    #[test]
    fn failed_mixed_model_falls_back_to_listwise_deletion() {
        let config = EngineConfig::default();
        let executor = TestExecutor::new(&config);
        let data = executor
            .prepare_repeated(&repeated_frame(true), &within(&["d0", "d7", "d14"], &[]))
            .unwrap();
        let test = TestKind::RepeatedAnova.display_name();
        let r = TestExecutor::with_missing_data_fallback(
            &data,
            test,
            || Err(EngineError::fit("fixed-effects design is singular")),
            |_, rows| {
                assert_eq!(rows.len(), 7);
                TestExecutor::rm_result(test, repeated::rm_anova(rows, "Time", 0.05)?, "Time")
            },
        )
        .unwrap();
        assert_eq!(r.test, "Repeated-measures ANOVA");
        assert!(r.notes[0].contains("mixed-effects model"));
        assert!(r.notes[1].contains("listwise deletion of 1 incomplete subject(s)"), "{:?}", r.notes);
        assert!(r.notes[1].contains("design is singular"));
        assert!(r.p_value.unwrap() < 0.05);
    }

    #[test]
    fn paired_tests_drop_incomplete_pairs() {
        let r = run(&repeated_frame(true), "ttest_paired", &within(&["d7", "d14"], &[]));
        assert!(r.is_ok(), "{:?}", r.error);
        assert!(r.notes.iter().any(|n| n.contains("1 subject(s)")));
        assert!(r.p_value.unwrap() < 0.05);

        let r = run(&repeated_frame(false), "ttest_paired", &within(&["d0", "d7", "d14"], &[]));
        assert!(r.error.as_deref().unwrap().contains("exactly 2"));
    }

    #[test]
    fn friedman_with_posthoc() {
        let r = run(&repeated_frame(false), "friedman", &within(&["d0", "d7", "d14"], &[]));
        assert!(r.p_value.unwrap() < 0.05);
        assert!(r.posthoc.is_some());
    }

    #[test]
    fn repeated_requires_subject_column() {
        let request = ExecutionRequest {
            is_repeated: true,
            ..ExecutionRequest::new(&["d0", "d7"], &[])
        };
        let r = run(&repeated_frame(false), "ttest_paired", &request);
        assert!(r.error.as_deref().unwrap().contains("subject identifier"));
    }

    #[test]
    fn manova_and_correlation() {
        let mut g = Vec::new();
        let mut v1 = Vec::new();
        let mut v2 = Vec::new();
        for (k, name) in ["a", "b", "c"].iter().enumerate() {
            for i in 0..8 {
                g.push(Some(*name));
                v1.push(10.0 + 3.0 * k as f64 + ((i * 7) % 5) as f64 * 0.4);
                v2.push(5.0 - 2.0 * k as f64 + ((i * 3) % 4) as f64 * 0.5);
            }
        }
        let df = DataFrame::new()
            .with_column("group", Column::from_labels(&g))
            .unwrap()
            .with_column("v1", Column::from_f64s(&v1))
            .unwrap()
            .with_column("v2", Column::from_f64s(&v2))
            .unwrap();
        let r = run(&df, "manova", &ExecutionRequest::new(&["v1", "v2"], &["group"]));
        assert!(r.is_ok(), "{:?}", r.error);
        assert!(r.p_value.unwrap() < 0.05);
        assert!(r.results_data.unwrap().row("Wilks' lambda").is_some());

        let r = run(&df, "correlation_matrix", &ExecutionRequest::new(&["v1"], &[]));
        assert!(r.is_ok());
        assert!(r.statistic.is_none());
        assert_eq!(r.results_data.unwrap().len(), 1);
    }
}
