//! Test suggestion.
//!
//! Turns the assumption outcomes of every parameter into an ordered list
//! of admissible tests. Each rule contributes its suggestions in order;
//! once all rules have run the first item marked `suggested` becomes the
//! `primary` one, so callers always see the full set plus one default.
//!
//! ```
//! use u_labstat::suggest::TestKind;
//!
//! assert_eq!(TestKind::from_key("ttest_ind"), Some(TestKind::StudentT));
//! assert_eq!(TestKind::from_key("none"), Some(TestKind::SummaryOnly));
//! assert_eq!(TestKind::WelchT.key(), "ttest_welch");
//! assert_eq!(TestKind::FisherExact.display_name(), "Fisher's Exact Test");
//! ```

use crate::assumptions::{AssumptionCheckResult, ParameterKind};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

// ── TestKind ──────────────────────────────────────────────────────────

/// Every procedure the executor can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TestKind {
    SummaryOnly,
    FrequencySummary,
    ChiSquare,
    FisherExact,
    StudentT,
    WelchT,
    MannWhitney,
    OneWayAnova,
    TwoWayAnova,
    NWayAnova,
    KruskalWallis,
    Ancova,
    Dunnett,
    PairedT,
    Wilcoxon,
    RepeatedAnova,
    Friedman,
    MixedAnova,
    Manova,
    CorrelationMatrix,
}

impl TestKind {
    pub const ALL: [TestKind; 20] = [
        TestKind::SummaryOnly,
        TestKind::FrequencySummary,
        TestKind::ChiSquare,
        TestKind::FisherExact,
        TestKind::StudentT,
        TestKind::WelchT,
        TestKind::MannWhitney,
        TestKind::OneWayAnova,
        TestKind::TwoWayAnova,
        TestKind::NWayAnova,
        TestKind::KruskalWallis,
        TestKind::Ancova,
        TestKind::Dunnett,
        TestKind::PairedT,
        TestKind::Wilcoxon,
        TestKind::RepeatedAnova,
        TestKind::Friedman,
        TestKind::MixedAnova,
        TestKind::Manova,
        TestKind::CorrelationMatrix,
    ];

    /// Stable machine key.
    pub fn key(self) -> &'static str {
        match self {
            TestKind::SummaryOnly => "summary_only",
            TestKind::FrequencySummary => "frequency_summary",
            TestKind::ChiSquare => "chi_square",
            TestKind::FisherExact => "fisher_exact",
            TestKind::StudentT => "ttest_ind_equal_var",
            TestKind::WelchT => "ttest_welch",
            TestKind::MannWhitney => "mann_whitney",
            TestKind::OneWayAnova => "anova_oneway",
            TestKind::TwoWayAnova => "anova_twoway",
            TestKind::NWayAnova => "anova_nway",
            TestKind::KruskalWallis => "kruskal_wallis",
            TestKind::Ancova => "ancova",
            TestKind::Dunnett => "dunnett",
            TestKind::PairedT => "ttest_paired",
            TestKind::Wilcoxon => "wilcoxon",
            TestKind::RepeatedAnova => "anova_rm",
            TestKind::Friedman => "friedman",
            TestKind::MixedAnova => "anova_mixed",
            TestKind::Manova => "manova",
            TestKind::CorrelationMatrix => "correlation_matrix",
        }
    }

    /// Human-readable name, also used as `TestExecutionResult::test`.
    pub fn display_name(self) -> &'static str {
        match self {
            TestKind::SummaryOnly => "Descriptive summary",
            TestKind::FrequencySummary => "Frequency summary",
            TestKind::ChiSquare => "Chi-square test of independence",
            TestKind::FisherExact => "Fisher's Exact Test",
            TestKind::StudentT => "Independent t-test",
            TestKind::WelchT => "Welch's t-test",
            TestKind::MannWhitney => "Mann-Whitney U",
            TestKind::OneWayAnova => "One-way ANOVA",
            TestKind::TwoWayAnova => "Two-way ANOVA",
            TestKind::NWayAnova => "N-way ANOVA",
            TestKind::KruskalWallis => "Kruskal-Wallis",
            TestKind::Ancova => "ANCOVA",
            TestKind::Dunnett => "Dunnett's test",
            TestKind::PairedT => "Paired t-test",
            TestKind::Wilcoxon => "Wilcoxon signed-rank",
            TestKind::RepeatedAnova => "Repeated-measures ANOVA",
            TestKind::Friedman => "Friedman test",
            TestKind::MixedAnova => "Mixed ANOVA",
            TestKind::Manova => "MANOVA",
            TestKind::CorrelationMatrix => "Correlation matrix",
        }
    }

    /// Parses a key or one of its accepted aliases (case-insensitive).
    pub fn from_key(key: &str) -> Option<Self> {
        let key = key.trim().to_ascii_lowercase();
        let alias = match key.as_str() {
            "none" | "error" | "summary" => Some(TestKind::SummaryOnly),
            "frequency" => Some(TestKind::FrequencySummary),
            "chi2" | "chi_squared" => Some(TestKind::ChiSquare),
            "fisher" => Some(TestKind::FisherExact),
            "ttest_ind" | "student_t" | "ttest" => Some(TestKind::StudentT),
            "welch" | "ttest_ind_unequal_var" => Some(TestKind::WelchT),
            "mannwhitney" | "mann_whitney_u" => Some(TestKind::MannWhitney),
            "anova" | "one_way_anova" => Some(TestKind::OneWayAnova),
            "two_way_anova" => Some(TestKind::TwoWayAnova),
            "kruskal" => Some(TestKind::KruskalWallis),
            "paired_t" | "ttest_rel" => Some(TestKind::PairedT),
            "wilcoxon_signed_rank" => Some(TestKind::Wilcoxon),
            "rm_anova" | "repeated_anova" => Some(TestKind::RepeatedAnova),
            "mixed_anova" => Some(TestKind::MixedAnova),
            "correlation" => Some(TestKind::CorrelationMatrix),
            _ => None,
        };
        alias.or_else(|| Self::ALL.into_iter().find(|k| k.key() == key))
    }

    /// Whether the procedure needs the repeated-measures (long-form) layout.
    pub fn is_repeated(self) -> bool {
        matches!(
            self,
            TestKind::PairedT
                | TestKind::Wilcoxon
                | TestKind::RepeatedAnova
                | TestKind::Friedman
                | TestKind::MixedAnova
        )
    }

    /// Whether the procedure spans several measurement columns at once.
    pub fn is_cross_parameter(self) -> bool {
        matches!(self, TestKind::Manova | TestKind::CorrelationMatrix)
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl Serialize for TestKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.key())
    }
}

// ── Suggestions ───────────────────────────────────────────────────────

/// One entry of a suggestion list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestSuggestion {
    pub key: TestKind,
    pub name: String,
    pub rationale: String,
    /// Admissible under the observed assumptions.
    pub suggested: bool,
    /// The default the executor runs. At most one per list.
    pub primary: bool,
}

impl TestSuggestion {
    fn suggested(key: TestKind, rationale: impl Into<String>) -> Self {
        Self {
            key,
            name: key.display_name().to_string(),
            rationale: rationale.into(),
            suggested: true,
            primary: false,
        }
    }

    fn alternative(key: TestKind, rationale: impl Into<String>) -> Self {
        Self {
            suggested: false,
            ..Self::suggested(key, rationale)
        }
    }
}

/// Suggestions for one parameter, or for the within-subject set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterSuggestions {
    pub parameter: String,
    pub suggestions: Vec<TestSuggestion>,
    pub notes: Vec<String>,
    /// Set when the assumption checks failed; no test was suggested.
    pub error: Option<String>,
}

impl ParameterSuggestions {
    fn new(parameter: &str) -> Self {
        Self {
            parameter: parameter.to_string(),
            suggestions: Vec::new(),
            notes: Vec::new(),
            error: None,
        }
    }

    fn failed(parameter: &str, error: impl Into<String>) -> Self {
        let error = error.into();
        let mut s = Self::new(parameter);
        s.suggestions.push(TestSuggestion::alternative(
            TestKind::SummaryOnly,
            format!("No test can be suggested: {error}"),
        ));
        s.error = Some(error);
        s
    }

    pub fn primary(&self) -> Option<&TestSuggestion> {
        self.suggestions.iter().find(|s| s.primary)
    }

    pub fn get(&self, key: TestKind) -> Option<&TestSuggestion> {
        self.suggestions.iter().find(|s| s.key == key)
    }

    /// Marks the first suggested item primary; forces a summary when
    /// nothing qualified.
    fn finish(mut self) -> Self {
        if self.error.is_some() {
            return self;
        }
        match self.suggestions.iter_mut().find(|s| s.suggested) {
            Some(first) => first.primary = true,
            None => {
                let mut summary =
                    TestSuggestion::suggested(TestKind::SummaryOnly, "No hypothesis test qualified");
                summary.primary = true;
                self.suggestions.retain(|s| s.key != TestKind::SummaryOnly);
                self.suggestions.insert(0, summary);
                self.notes.push(
                    "No parametric or non-parametric test qualified for this parameter; descriptive summary only"
                        .into(),
                );
            }
        }
        self
    }
}

/// Request-level facts that shape the suggestions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SuggestionContext {
    pub has_control_group: bool,
    pub has_covariate: bool,
    pub exclude_outliers: bool,
    pub outlier_method: Option<String>,
    pub outlier_threshold: Option<f64>,
}

/// Everything the suggester looks at.
#[derive(Debug, Clone)]
pub struct SuggestionInput<'a> {
    pub num_grouping_factors: usize,
    pub numeric_parameters: &'a [String],
    pub is_repeated: bool,
    pub assumption_results: &'a BTreeMap<String, AssumptionCheckResult>,
    pub subject_id_present: bool,
    /// Label of the within-subject set in repeated mode.
    pub within_factor_name: &'a str,
    pub context: SuggestionContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuggestionSet {
    /// In request order. Repeated mode has a single entry for the
    /// within-subject set.
    pub parameters: Vec<ParameterSuggestions>,
    /// MANOVA / correlation across parameters; empty when not applicable.
    pub cross_parameter: Vec<TestSuggestion>,
    pub notes: Vec<String>,
}

impl SuggestionSet {
    pub fn for_parameter(&self, parameter: &str) -> Option<&ParameterSuggestions> {
        self.parameters.iter().find(|p| p.parameter == parameter)
    }

    pub fn cross_parameter_primary(&self) -> Option<&TestSuggestion> {
        self.cross_parameter.iter().find(|s| s.primary)
    }
}

const REPEATED_NOTE: &str = "Sphericity is assumed for within-subject factors with more than two levels; \
     a violation triggers a Greenhouse-Geisser correction, not a different test. \
     Missing repeated observations switch the analysis to a linear mixed-effects model.";

// ── Suggester ─────────────────────────────────────────────────────────

/// Decision tree from assumption outcomes to test suggestions.
///
/// ```
/// use std::collections::BTreeMap;
/// use u_labstat::suggest::{SuggestionContext, SuggestionInput, TestKind, TestSuggester};
///
/// let results = BTreeMap::new();
/// let params = vec!["weight".to_string()];
/// let set = TestSuggester::suggest(&SuggestionInput {
///     num_grouping_factors: 1,
///     numeric_parameters: &params,
///     is_repeated: false,
///     assumption_results: &results,
///     subject_id_present: false,
///     within_factor_name: "Within",
///     context: SuggestionContext::default(),
/// });
/// // no checks for "weight": an error entry, never a test
/// let weight = set.for_parameter("weight").unwrap();
/// assert!(weight.error.is_some());
/// assert!(weight.primary().is_none());
/// assert_eq!(weight.suggestions[0].key, TestKind::SummaryOnly);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TestSuggester;

impl TestSuggester {
    pub fn suggest(input: &SuggestionInput<'_>) -> SuggestionSet {
        let mut notes = Vec::new();
        if input.context.exclude_outliers {
            let method = input.context.outlier_method.as_deref().unwrap_or("iqr");
            notes.push(match input.context.outlier_threshold {
                Some(t) => format!("Assumptions evaluated after per-group outlier exclusion ({method}, threshold {t})"),
                None => format!("Assumptions evaluated after per-group outlier exclusion ({method}, default threshold)"),
            });
        }

        if input.is_repeated {
            let within = Self::repeated(input);
            tracing::debug!(
                primary = within.primary().map(|s| s.key.key()),
                "repeated-measures suggestion"
            );
            return SuggestionSet {
                parameters: vec![within],
                cross_parameter: Vec::new(),
                notes,
            };
        }

        let parameters: Vec<ParameterSuggestions> = input
            .numeric_parameters
            .iter()
            .map(|p| {
                let s = Self::independent(p, input.assumption_results.get(p), input);
                tracing::debug!(parameter = %p, primary = s.primary().map(|s| s.key.key()), "suggestion");
                s
            })
            .collect();

        SuggestionSet {
            parameters,
            cross_parameter: Self::cross_parameter(input),
            notes,
        }
    }

    fn independent(
        parameter: &str,
        result: Option<&AssumptionCheckResult>,
        input: &SuggestionInput<'_>,
    ) -> ParameterSuggestions {
        let Some(result) = result else {
            return ParameterSuggestions::failed(parameter, "assumption checks missing for this parameter");
        };
        if let Some(error) = &result.error {
            return ParameterSuggestions::failed(parameter, error.clone());
        }

        let mut out = ParameterSuggestions::new(parameter);
        let list = &mut out.suggestions;
        let ctx = &input.context;

        if result.kind == ParameterKind::Categorical {
            if input.num_grouping_factors >= 1 {
                list.push(TestSuggestion::suggested(
                    TestKind::ChiSquare,
                    "Categorical outcome compared across groups",
                ));
                list.push(TestSuggestion::alternative(
                    TestKind::FisherExact,
                    "Exact test for 2x2 tables; substituted automatically when expected counts are below 5",
                ));
            } else {
                list.push(TestSuggestion::suggested(
                    TestKind::FrequencySummary,
                    "Categorical outcome without a grouping factor",
                ));
            }
            return out.finish();
        }

        let k = result.group_count();
        let normal = result.all_groups_normal;
        match k {
            0 | 1 => {
                list.push(TestSuggestion::suggested(
                    TestKind::SummaryOnly,
                    "Fewer than two groups; nothing to compare",
                ));
            }
            2 => {
                if normal {
                    if result.variance_tested() {
                        if result.equal_variance {
                            list.push(TestSuggestion::suggested(
                                TestKind::StudentT,
                                "Both groups normal with equal variances",
                            ));
                            list.push(TestSuggestion::alternative(
                                TestKind::WelchT,
                                "Does not assume equal variances",
                            ));
                        } else {
                            list.push(TestSuggestion::suggested(
                                TestKind::WelchT,
                                "Both groups normal but variances differ (Levene)",
                            ));
                            list.push(TestSuggestion::alternative(
                                TestKind::StudentT,
                                "Requires equal variances, rejected by Levene's test",
                            ));
                        }
                    } else {
                        list.push(TestSuggestion::suggested(
                            TestKind::WelchT,
                            "Both groups normal; variance homogeneity could not be tested",
                        ));
                        list.push(TestSuggestion::alternative(
                            TestKind::StudentT,
                            "Requires equal variances, which could not be verified",
                        ));
                        out.notes.push(
                            "Levene's test was not computable; Welch's t-test is used because it does not assume equal variances"
                                .into(),
                        );
                    }
                    list.push(TestSuggestion::alternative(
                        TestKind::MannWhitney,
                        "Rank-based alternative without a normality assumption",
                    ));
                } else {
                    list.push(TestSuggestion::suggested(
                        TestKind::MannWhitney,
                        "Normality not met or not testable in at least one group",
                    ));
                    list.push(TestSuggestion::alternative(
                        TestKind::StudentT,
                        "Requires normal groups with equal variances",
                    ));
                    list.push(TestSuggestion::alternative(
                        TestKind::WelchT,
                        "Requires normal groups",
                    ));
                }
            }
            _ => {
                let anova = match input.num_grouping_factors {
                    0 | 1 => TestKind::OneWayAnova,
                    2 => TestKind::TwoWayAnova,
                    _ => TestKind::NWayAnova,
                };
                if normal && result.equal_variance {
                    list.push(TestSuggestion::suggested(
                        anova,
                        "All groups normal with equal variances",
                    ));
                    list.push(TestSuggestion::alternative(
                        TestKind::KruskalWallis,
                        "Rank-based alternative without a normality assumption",
                    ));
                } else {
                    list.push(TestSuggestion::suggested(
                        TestKind::KruskalWallis,
                        if normal {
                            "Variances differ or could not be tested"
                        } else {
                            "Normality not met or not testable in at least one group"
                        },
                    ));
                    list.push(TestSuggestion::alternative(
                        anova,
                        "Requires normal groups with equal variances",
                    ));
                }
            }
        }

        // tie-break: the first suggested rule stays primary, so these lead only when nothing above qualified
        if k >= 2 && input.numeric_parameters.len() == 1 && input.num_grouping_factors == 1 {
            if ctx.has_covariate {
                list.push(TestSuggestion::suggested(
                    TestKind::Ancova,
                    "Group effect adjusted for the selected covariate",
                ));
            } else {
                list.push(TestSuggestion::alternative(
                    TestKind::Ancova,
                    "Select a covariate to adjust the group effect",
                ));
            }
        }

        if k >= 2 {
            if ctx.has_control_group && k > 2 {
                list.push(TestSuggestion::suggested(
                    TestKind::Dunnett,
                    "Each treatment group compared with the control group",
                ));
            } else {
                list.push(TestSuggestion::alternative(
                    TestKind::Dunnett,
                    "Needs a control group and more than two groups",
                ));
            }
        }

        out.finish()
    }

    fn cross_parameter(input: &SuggestionInput<'_>) -> Vec<TestSuggestion> {
        if input.numeric_parameters.len() < 2 || input.num_grouping_factors == 0 {
            return Vec::new();
        }
        let numeric: Vec<&AssumptionCheckResult> = input
            .numeric_parameters
            .iter()
            .filter_map(|p| input.assumption_results.get(p))
            .filter(|r| r.is_ok() && r.kind == ParameterKind::Numeric)
            .collect();
        if numeric.len() < 2 {
            return Vec::new();
        }
        let all_pass = numeric.len() == input.numeric_parameters.len()
            && numeric.iter().all(|r| r.all_groups_normal && r.equal_variance);

        let mut manova = if all_pass {
            TestSuggestion::suggested(
                TestKind::Manova,
                "Every parameter is normal with equal variances across groups",
            )
        } else {
            TestSuggestion::alternative(
                TestKind::Manova,
                "Not every parameter met normality and variance homogeneity",
            )
        };
        manova.primary = all_pass;
        vec![
            manova,
            TestSuggestion::alternative(
                TestKind::CorrelationMatrix,
                "Pairwise Pearson correlations between the parameters",
            ),
        ]
    }

    fn repeated(input: &SuggestionInput<'_>) -> ParameterSuggestions {
        let name = input.within_factor_name;
        if !input.subject_id_present {
            return ParameterSuggestions::failed(name, "repeated measures require a subject identifier column");
        }
        let levels = input.numeric_parameters;
        let mut results = Vec::with_capacity(levels.len());
        for level in levels {
            let Some(r) = input.assumption_results.get(level) else {
                return ParameterSuggestions::failed(name, format!("assumption checks missing for level '{level}'"));
            };
            if let Some(error) = &r.error {
                return ParameterSuggestions::failed(name, error.clone());
            }
            if r.kind == ParameterKind::Categorical {
                return ParameterSuggestions::failed(name, format!("level '{level}' is not numeric"));
            }
            results.push(r);
        }

        let mut out = ParameterSuggestions::new(name);
        out.notes.push(REPEATED_NOTE.into());
        if levels.len() < 2 {
            out.suggestions.push(TestSuggestion::suggested(
                TestKind::SummaryOnly,
                "Repeated measures need at least two within-subject levels",
            ));
            return out.finish();
        }

        let normal = results.iter().all(|r| r.all_groups_normal);
        let list = &mut out.suggestions;
        if input.num_grouping_factors == 0 {
            // one group per level: variance homogeneity is not testable here
            let (parametric, rank) = if levels.len() == 2 {
                (TestKind::PairedT, TestKind::Wilcoxon)
            } else {
                (TestKind::RepeatedAnova, TestKind::Friedman)
            };
            if normal {
                list.push(TestSuggestion::suggested(parametric, "All within-subject levels normal"));
                list.push(TestSuggestion::alternative(
                    rank,
                    "Rank-based alternative without a normality assumption",
                ));
            } else {
                list.push(TestSuggestion::suggested(
                    rank,
                    "Normality not met or not testable at one or more levels",
                ));
                list.push(TestSuggestion::alternative(parametric, "Requires normal levels"));
            }
        } else {
            let homogeneous = results.iter().all(|r| r.equal_variance);
            if normal && homogeneous {
                list.push(TestSuggestion::suggested(
                    TestKind::MixedAnova,
                    "Between-subject groups normal with equal variances at every level",
                ));
            } else {
                list.push(TestSuggestion::alternative(
                    TestKind::MixedAnova,
                    "Requires normal groups with equal variances at every level",
                ));
                list.push(TestSuggestion::suggested(
                    TestKind::SummaryOnly,
                    "Assumptions of the mixed ANOVA not met",
                ));
                out.notes.push(
                    "No standard non-parametric equivalent exists for mixed between x within designs; descriptive summary only"
                        .into(),
                );
            }
        }
        out.finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
