//! # u-labstat
//!
//! Statistical analysis decision engine for laboratory datasets.
//!
//! Given a table of experimental measurements and a request describing
//! which columns are grouping factors and which are measured parameters,
//! u-labstat screens outliers, checks the parametric assumptions of every
//! comparison group, recommends a hypothesis test and runs it, falling
//! back to a more robust procedure (with an explicit note) when the data
//! calls for it.
//!
//! ## Modules
//!
//! - [`dataframe`] — Column-major dataset (DataFrame, Column, ValidityBitmap)
//! - [`csv_parser`] — CSV parsing with automatic type inference
//! - [`reshape`] — Wide → long-form view for repeated measures
//! - [`stats`] — Descriptive statistics and ranking
//! - [`special`] — Distribution functions, studentized range, Dunnett probabilities
//! - [`testing`] — Primitive hypothesis tests (t, ANOVA, Levene, Shapiro-Wilk, rank tests, chi-square, Fisher)
//! - [`outlier`] — IQR, standard-deviation and Grubbs outlier screening
//! - [`linear_model`] — OLS factorial ANOVA and ANCOVA with Type II sums of squares
//! - [`mixed_model`] — Random-intercept linear mixed model (REML)
//! - [`repeated`] — Repeated-measures and mixed ANOVA with sphericity correction
//! - [`multivariate`] — MANOVA and correlation matrix
//! - [`posthoc`] — Tukey HSD, Dunnett, Holm-corrected pairwise comparisons
//! - [`report`] — Result tables and execution results
//! - [`assumptions`] — AssumptionChecker
//! - [`suggest`] — TestSuggester decision tree
//! - [`execute`] — TestExecutor dispatch
//! - [`engine`] — AnalysisEngine orchestration across parameters and strata
//! - [`config`] — Numeric constants and per-call request
//! - [`error`] — Error types
//!
//! ## Quick Start
//!
//! ```
//! use u_labstat::config::{AnalysisRequest, EngineConfig};
//! use u_labstat::csv_parser::CsvParser;
//! use u_labstat::engine::AnalysisEngine;
//!
//! let csv = "group,weight\n\
//!            ctrl,20.1\nctrl,19.5\nctrl,20.8\nctrl,20.3\nctrl,19.9\nctrl,20.6\n\
//!            dosed,25.2\ndosed,24.6\ndosed,25.9\ndosed,25.1\ndosed,24.8\ndosed,25.5\n";
//! let df = CsvParser::new().parse_str(csv).unwrap();
//!
//! let request = AnalysisRequest::new(&["group"], &["weight"]);
//! let report = AnalysisEngine::new(EngineConfig::default()).analyze(&df, &request);
//!
//! let weight = &report.strata[0].parameters["weight"];
//! assert!(weight.execution.error.is_none());
//! assert!(weight.execution.p_value.unwrap() < 0.05);
//! ```

pub mod assumptions;
pub mod config;
pub mod csv_parser;
pub mod dataframe;
pub mod engine;
pub mod error;
pub mod execute;
pub mod linear_model;
pub mod mixed_model;
pub mod multivariate;
pub mod outlier;
pub mod posthoc;
pub mod repeated;
pub mod report;
pub mod reshape;
pub mod special;
pub mod stats;
pub mod suggest;
pub mod testing;
