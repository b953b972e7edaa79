//! Analysis orchestration.
//!
//! [`AnalysisEngine::analyze`] composes the whole pipeline for one request:
//! assumption checks, test suggestion and test execution for every
//! parameter (or for the within-subject set in repeated mode), optionally
//! once per value of a splitting column. Failures stay local: a parameter
//! that cannot be analysed carries an `error`, its siblings are unaffected,
//! and the caller always receives a complete report.

use crate::assumptions::{AssumptionCheckResult, AssumptionChecker, CheckRequest};
use crate::config::{AnalysisRequest, EngineConfig};
use crate::dataframe::DataFrame;
use crate::execute::{ExecutionRequest, TestExecutor};
use crate::report::TestExecutionResult;
use crate::suggest::{ParameterSuggestions, SuggestionContext, SuggestionInput, TestKind, TestSuggester, TestSuggestion};
use serde::Serialize;
use std::collections::BTreeMap;

/// Key of [`AnalysisRequest::chosen_test_per_parameter`] that selects the
/// cross-parameter procedure.
pub const MULTIVARIATE_KEY: &str = "multivariate";

// ── Report types ──────────────────────────────────────────────────────

/// Everything produced for one parameter (or one within-subject set).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterReport {
    /// One entry for an independent parameter; one per level in repeated mode.
    pub checks: Vec<AssumptionCheckResult>,
    pub suggestions: Vec<TestSuggestion>,
    pub suggestion_notes: Vec<String>,
    pub execution: TestExecutionResult,
}

/// MANOVA / correlation across all parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossParameterReport {
    pub suggestions: Vec<TestSuggestion>,
    pub execution: TestExecutionResult,
}

/// Results for one value of the splitting column (or the whole dataset).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StratumReport {
    pub split_value: Option<String>,
    pub rows: usize,
    pub parameters: BTreeMap<String, ParameterReport>,
    pub cross_parameter: Option<CrossParameterReport>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub strata: Vec<StratumReport>,
    pub notes: Vec<String>,
}

impl AnalysisReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Every parameter report whose execution failed, with its stratum.
    pub fn failures(&self) -> Vec<(Option<&str>, &str, &str)> {
        self.strata
            .iter()
            .flat_map(|s| {
                s.parameters.iter().filter_map(move |(name, p)| {
                    p.execution
                        .error
                        .as_deref()
                        .map(|e| (s.split_value.as_deref(), name.as_str(), e))
                })
            })
            .collect()
    }
}

// ── Engine ────────────────────────────────────────────────────────────

/// Stateless pipeline driver; one engine can serve any number of requests.
///
/// ```
/// use u_labstat::config::{AnalysisRequest, EngineConfig};
/// use u_labstat::csv_parser::CsvParser;
/// use u_labstat::engine::AnalysisEngine;
///
/// let df = CsvParser::new()
///     .parse_str("site,g,v\nA,x,1.0\nA,x,1.4\nA,y,2.0\nA,y,2.2\nB,x,3.0\nB,x,3.1\nB,y,3.3\nB,y,2.9\n")
///     .unwrap();
/// let request = AnalysisRequest::new(&["g"], &["v"]).split_by("site");
/// let report = AnalysisEngine::new(EngineConfig::default()).analyze(&df, &request);
/// assert_eq!(report.strata.len(), 2);
/// assert_eq!(report.strata[1].split_value.as_deref(), Some("B"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct AnalysisEngine {
    config: EngineConfig,
}

impl AnalysisEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn analyze(&self, df: &DataFrame, request: &AnalysisRequest) -> AnalysisReport {
        let mut notes = self.request_notes(df, request);
        let mut request = request.clone();

        let Some(split) = request.splitting_column.clone() else {
            return AnalysisReport {
                strata: vec![self.analyze_stratum(df, &request, None)],
                notes,
            };
        };
        let levels = match df.distinct_labels(&split) {
            Ok(levels) => levels,
            Err(e) => {
                tracing::warn!(column = %split, "splitting column unavailable, analysing the whole dataset");
                notes.push(format!("Splitting ignored: {e}"));
                return AnalysisReport {
                    strata: vec![self.analyze_stratum(df, &request, None)],
                    notes,
                };
            }
        };
        if request.grouping_columns.iter().any(|g| *g == split) {
            request.grouping_columns.retain(|g| *g != split);
            notes.push(format!(
                "Splitting column '{split}' removed from the grouping columns; each stratum has a single value of it"
            ));
        }
        let unlabeled = (0..df.row_count()).filter(|&r| df.label_at(&split, r).is_none()).count();
        if unlabeled > 0 {
            notes.push(format!(
                "{unlabeled} row(s) without a value of '{split}' belong to no stratum"
            ));
        }
        notes.push(format!(
            "Data split by '{split}' into {} strata, each analysed independently",
            levels.len()
        ));
        tracing::debug!(column = %split, strata = levels.len(), "splitting dataset");

        let strata = levels
            .into_iter()
            .map(|level| {
                let mask: Vec<bool> = (0..df.row_count())
                    .map(|r| df.label_at(&split, r).as_deref() == Some(level.as_str()))
                    .collect();
                match df.filter_rows(&mask) {
                    Ok(subset) => self.analyze_stratum(&subset, &request, Some(level)),
                    Err(e) => StratumReport {
                        split_value: Some(level),
                        rows: 0,
                        parameters: BTreeMap::new(),
                        cross_parameter: None,
                        notes: vec![format!("Stratum not analysed: {e}")],
                    },
                }
            })
            .collect();
        AnalysisReport { strata, notes }
    }

    fn request_notes(&self, df: &DataFrame, request: &AnalysisRequest) -> Vec<String> {
        let mut notes = Vec::new();
        let named = request
            .grouping_columns
            .iter()
            .chain(&request.numeric_columns)
            .chain(request.subject_id_column.iter())
            .chain(request.covariate.iter())
            .chain(request.splitting_column.iter());
        for name in named {
            if df.column_by_name(name).is_none() {
                tracing::warn!(column = %name, "requested column not found");
                notes.push(format!("Column '{name}' not found in the dataset"));
            }
        }
        if request.numeric_columns.is_empty() {
            notes.push("No parameters requested".into());
        }
        if request.exclude_outliers {
            notes.push(match request.outlier_threshold {
                Some(t) => format!(
                    "Outlier exclusion enabled ({}, threshold {t}): per group for assumption checks, whole column for test execution",
                    request.outlier_method
                ),
                None => format!(
                    "Outlier exclusion enabled ({}, default threshold): per group for assumption checks, whole column for test execution",
                    request.outlier_method
                ),
            });
        }
        for (parameter, key) in &request.chosen_test_per_parameter {
            if TestKind::from_key(key).is_none() {
                notes.push(format!("Unknown test '{key}' chosen for '{parameter}'"));
            }
        }
        notes
    }

    fn analyze_stratum(&self, df: &DataFrame, request: &AnalysisRequest, split_value: Option<String>) -> StratumReport {
        let checks = AssumptionChecker::new(&self.config).check(df, &CheckRequest::from(request));
        let subject_id_present = request
            .subject_id_column
            .as_deref()
            .is_some_and(|s| df.column_by_name(s).is_some());
        let set = TestSuggester::suggest(&SuggestionInput {
            num_grouping_factors: request.sorted_grouping_columns().len(),
            numeric_parameters: &request.numeric_columns,
            is_repeated: request.is_repeated,
            assumption_results: &checks,
            subject_id_present,
            within_factor_name: &request.within_factor_name,
            context: SuggestionContext {
                has_control_group: request.control_group.is_some(),
                has_covariate: request.covariate.is_some(),
                exclude_outliers: request.exclude_outliers,
                outlier_method: Some(request.outlier_method.clone()),
                outlier_threshold: request.outlier_threshold,
            },
        });

        let executor = TestExecutor::new(&self.config);
        let mut parameters = BTreeMap::new();
        if request.is_repeated {
            let level_checks: Vec<AssumptionCheckResult> = request
                .numeric_columns
                .iter()
                .filter_map(|c| checks.get(c).cloned())
                .collect();
            if let Some(within) = set.parameters.into_iter().next() {
                let report = self.run_parameter(
                    &executor,
                    df,
                    request,
                    within,
                    level_checks,
                    ExecutionRequest::for_within(request),
                );
                parameters.insert(request.within_factor_name.clone(), report);
            }
        } else {
            for suggestions in set.parameters {
                let name = suggestions.parameter.clone();
                let check: Vec<AssumptionCheckResult> = checks.get(&name).cloned().into_iter().collect();
                let exec_request = ExecutionRequest::for_parameter(request, &name);
                let report = self.run_parameter(&executor, df, request, suggestions, check, exec_request);
                parameters.insert(name, report);
            }
        }

        let cross_parameter = self.run_cross_parameter(&executor, df, request, set.cross_parameter);
        StratumReport {
            split_value,
            rows: df.row_count(),
            parameters,
            cross_parameter,
            notes: set.notes,
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(parameter = %suggestions.parameter))]
    fn run_parameter(
        &self,
        executor: &TestExecutor<'_>,
        df: &DataFrame,
        request: &AnalysisRequest,
        suggestions: ParameterSuggestions,
        checks: Vec<AssumptionCheckResult>,
        exec_request: ExecutionRequest,
    ) -> ParameterReport {
        let chosen = request.chosen_test_per_parameter.get(&suggestions.parameter);
        let execution = match (&suggestions.error, chosen, suggestions.primary()) {
            (Some(error), _, _) => {
                tracing::debug!(%error, "parameter not executed");
                TestExecutionResult::failed(TestKind::SummaryOnly.display_name(), error)
            }
            (None, Some(key), _) => {
                tracing::debug!(test = %key, "running chosen test");
                executor.execute_key(df, key, &exec_request)
            }
            (None, None, Some(primary)) => executor.execute(df, primary.key, &exec_request),
            (None, None, None) => executor.execute(df, TestKind::SummaryOnly, &exec_request),
        };
        ParameterReport {
            checks,
            suggestions: suggestions.suggestions,
            suggestion_notes: suggestions.notes,
            execution,
        }
    }

    fn run_cross_parameter(
        &self,
        executor: &TestExecutor<'_>,
        df: &DataFrame,
        request: &AnalysisRequest,
        suggestions: Vec<TestSuggestion>,
    ) -> Option<CrossParameterReport> {
        let exec_request = ExecutionRequest::for_cross(request);
        let execution = match request.chosen_test_per_parameter.get(MULTIVARIATE_KEY) {
            Some(key) => executor.execute_key(df, key, &exec_request),
            None => {
                let primary = suggestions.iter().find(|s| s.primary)?;
                executor.execute(df, primary.key, &exec_request)
            }
        };
        Some(CrossParameterReport { suggestions, execution })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
