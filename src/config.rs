//! Engine constants and per-call analysis requests.
//!
//! [`EngineConfig`] holds the numeric tolerances shared by every
//! component. It is passed explicitly; nothing in the crate reads a
//! global. [`AnalysisRequest`] is the per-call description of which
//! columns to analyse and how, deserializable from JSON.
//!
//! # Example
//!
//! ```
//! use u_labstat::config::{AnalysisRequest, EngineConfig};
//!
//! let config = EngineConfig::default().alpha(0.01);
//! assert_eq!(config.alpha, 0.01);
//!
//! let request = AnalysisRequest::from_json(
//!     r#"{"grouping_columns": ["dose"], "numeric_columns": ["ALT", "AST"]}"#,
//! )
//! .unwrap();
//! assert_eq!(request.numeric_columns, vec!["ALT", "AST"]);
//! assert_eq!(request.outlier_method, "iqr");
//! ```

use crate::error::EngineError;
use serde::Deserialize;
use std::collections::BTreeMap;

// ── EngineConfig ──────────────────────────────────────────────────────

/// Numeric constants used throughout the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Significance level for every decision (default: 0.05).
    pub alpha: f64,
    /// Groups whose sample variance is at or below this are treated as
    /// constant (default: 1e-10).
    pub variance_floor: f64,
    /// Smallest group size for Shapiro-Wilk (default: 3).
    pub min_normality_n: usize,
    /// Largest group size for Shapiro-Wilk (default: 5000).
    pub max_normality_n: usize,
    /// Expected cell count under which chi-square is considered unreliable
    /// (default: 5.0).
    pub min_expected_frequency: f64,
    /// Simpson panels per axis for the Dunnett integral (default: 96).
    pub dunnett_resolution: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            variance_floor: 1e-10,
            min_normality_n: 3,
            max_normality_n: 5000,
            min_expected_frequency: 5.0,
            dunnett_resolution: 96,
        }
    }
}

impl EngineConfig {
    /// Sets the significance level.
    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Sets the variance floor.
    pub fn variance_floor(mut self, floor: f64) -> Self {
        self.variance_floor = floor;
        self
    }

    /// Sets the Shapiro-Wilk size window.
    pub fn normality_range(mut self, min_n: usize, max_n: usize) -> Self {
        self.min_normality_n = min_n.max(3);
        self.max_normality_n = max_n.min(5000);
        self
    }

    /// Sets the expected-frequency threshold for contingency tables.
    pub fn min_expected_frequency(mut self, value: f64) -> Self {
        self.min_expected_frequency = value;
        self
    }

    /// Sets the Dunnett integration resolution (rounded up to even).
    pub fn dunnett_resolution(mut self, panels: usize) -> Self {
        self.dunnett_resolution = (panels.max(16) + 1) / 2 * 2;
        self
    }
}

// ── AnalysisRequest ───────────────────────────────────────────────────

/// Per-call analysis configuration.
///
/// Every field except the column lists is optional in JSON.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnalysisRequest {
    /// Categorical factors defining the comparison groups.
    pub grouping_columns: Vec<String>,
    /// Measured parameters, in reporting order. In repeated mode these are
    /// the wide within-subject columns (one per level).
    pub numeric_columns: Vec<String>,
    pub is_repeated: bool,
    pub subject_id_column: Option<String>,
    pub exclude_outliers: bool,
    /// `iqr`, `std` or `grubbs`; unknown names fall back to IQR.
    pub outlier_method: String,
    /// Method-specific threshold; the method default when absent.
    pub outlier_threshold: Option<f64>,
    /// Test key per parameter overriding the primary suggestion. The key
    /// `multivariate` selects the cross-parameter procedure.
    pub chosen_test_per_parameter: BTreeMap<String, String>,
    pub control_group: Option<String>,
    pub covariate: Option<String>,
    pub splitting_column: Option<String>,
    /// Label for the within-subject factor in repeated mode.
    pub within_factor_name: String,
}

impl Default for AnalysisRequest {
    fn default() -> Self {
        Self {
            grouping_columns: Vec::new(),
            numeric_columns: Vec::new(),
            is_repeated: false,
            subject_id_column: None,
            exclude_outliers: false,
            outlier_method: "iqr".to_string(),
            outlier_threshold: None,
            chosen_test_per_parameter: BTreeMap::new(),
            control_group: None,
            covariate: None,
            splitting_column: None,
            within_factor_name: "Within".to_string(),
        }
    }
}

impl AnalysisRequest {
    /// Independent-groups request over the given columns.
    pub fn new(grouping_columns: &[&str], numeric_columns: &[&str]) -> Self {
        Self {
            grouping_columns: grouping_columns.iter().map(|s| s.to_string()).collect(),
            numeric_columns: numeric_columns.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Switches to repeated-measures mode keyed by `subject_id_column`.
    pub fn repeated(mut self, subject_id_column: &str) -> Self {
        self.is_repeated = true;
        self.subject_id_column = Some(subject_id_column.to_string());
        self
    }

    /// Enables outlier exclusion with the given method and threshold.
    pub fn exclude_outliers(mut self, method: &str, threshold: Option<f64>) -> Self {
        self.exclude_outliers = true;
        self.outlier_method = method.to_string();
        self.outlier_threshold = threshold;
        self
    }

    /// Overrides the test run for one parameter.
    pub fn choose_test(mut self, parameter: &str, key: &str) -> Self {
        self.chosen_test_per_parameter
            .insert(parameter.to_string(), key.to_string());
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

    pub fn split_by(mut self, column: &str) -> Self {
        self.splitting_column = Some(column.to_string());
        self
    }

    /// Parses a request from JSON.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json).map_err(|e| EngineError::fit(format!("invalid request: {e}")))
    }

    /// Grouping columns sorted by name, duplicates removed.
    pub fn sorted_grouping_columns(&self) -> Vec<String> {
        let mut cols = self.grouping_columns.clone();
        cols.sort();
        cols.dedup();
        cols
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
