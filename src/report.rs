//! Serializable result containers.
//!
//! Every executed procedure produces a [`TestExecutionResult`]. Statistic
//! and p-value are only stored when finite, so a JSON consumer sees `null`
//! rather than `NaN`, which JSON cannot represent.

use serde::Serialize;

// ── Tables ────────────────────────────────────────────────────────────

/// One cell of a [`ResultTable`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Text(String),
    Number(f64),
    Count(u64),
    Empty,
}

impl Cell {
    /// A numeric cell; non-finite values become [`Cell::Empty`].
    pub fn num(v: f64) -> Self {
        if v.is_finite() {
            Cell::Number(v)
        } else {
            Cell::Empty
        }
    }

    /// Numeric cell from an optional value.
    pub fn opt(v: Option<f64>) -> Self {
        v.map_or(Cell::Empty, Cell::num)
    }

    pub fn text(s: impl Into<String>) -> Self {
        Cell::Text(s.into())
    }

    pub fn count(n: usize) -> Self {
        Cell::Count(n as u64)
    }

    /// Numeric content, if any.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Number(v) => Some(*v),
            Cell::Count(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Row-oriented result table. The first column conventionally holds the
/// row label (source, group, comparison).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl ResultTable {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Appends a row, padding or truncating it to the column count.
    pub fn push(&mut self, mut row: Vec<Cell>) {
        row.resize(self.columns.len(), Cell::Empty);
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Appends all rows of `other`; columns must match.
    pub fn extend(&mut self, other: ResultTable) {
        if other.columns == self.columns {
            self.rows.extend(other.rows);
        }
    }

    fn column_position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    /// First row whose label cell equals `label`.
    pub fn row(&self, label: &str) -> Option<&[Cell]> {
        self.rows
            .iter()
            .find(|r| r.first().and_then(Cell::as_str) == Some(label))
            .map(Vec::as_slice)
    }

    /// Numeric value at (`label`, `column`).
    ///
    /// ```
    /// use u_labstat::report::{Cell, ResultTable};
    ///
    /// let mut t = ResultTable::new(&["Source", "F"]);
    /// t.push(vec![Cell::text("dose"), Cell::num(4.2)]);
    /// assert_eq!(t.value("dose", "F"), Some(4.2));
    /// assert_eq!(t.value("sex", "F"), None);
    /// ```
    pub fn value(&self, label: &str, column: &str) -> Option<f64> {
        let col = self.column_position(column)?;
        self.row(label)?.get(col)?.as_f64()
    }

    /// Every numeric value of one column, in row order.
    pub fn column_values(&self, column: &str) -> Vec<Option<f64>> {
        match self.column_position(column) {
            Some(col) => self
                .rows
                .iter()
                .map(|r| r.get(col).and_then(Cell::as_f64))
                .collect(),
            None => Vec::new(),
        }
    }
}

// ── Post-hoc ──────────────────────────────────────────────────────────

/// Follow-up comparisons run after a significant omnibus result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PosthocResult {
    /// e.g. "Tukey HSD", "Dunnett", "Pairwise Mann-Whitney U (Holm)".
    pub method: String,
    /// Why this follow-up was chosen.
    pub rationale: String,
    pub table: ResultTable,
    pub notes: Vec<String>,
}

impl PosthocResult {
    pub fn new(method: impl Into<String>, rationale: impl Into<String>, table: ResultTable) -> Self {
        Self {
            method: method.into(),
            rationale: rationale.into(),
            table,
            notes: Vec::new(),
        }
    }
}

// ── Execution result ──────────────────────────────────────────────────

/// Outcome of one executed procedure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestExecutionResult {
    /// Display name of the test that actually ran (after any substitution).
    pub test: String,
    pub statistic: Option<f64>,
    pub p_value: Option<f64>,
    pub results_data: Option<ResultTable>,
    #[serde(rename = "posthoc_data")]
    pub posthoc: Option<PosthocResult>,
    pub error: Option<String>,
    pub notes: Vec<String>,
    pub outliers_excluded: usize,
}

impl TestExecutionResult {
    /// An empty result for `test`.
    pub fn new(test: impl Into<String>) -> Self {
        Self {
            test: test.into(),
            statistic: None,
            p_value: None,
            results_data: None,
            posthoc: None,
            error: None,
            notes: Vec::new(),
            outliers_excluded: 0,
        }
    }

    /// A result carrying only an error message.
    pub fn failed(test: impl Into<String>, error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(test)
        }
    }

    /// Stores statistic and p-value, dropping non-finite values.
    pub fn with_statistic(mut self, statistic: f64, p_value: f64) -> Self {
        self.statistic = statistic.is_finite().then_some(statistic);
        self.p_value = p_value.is_finite().then_some(p_value);
        self
    }

    pub fn with_table(mut self, table: ResultTable) -> Self {
        self.results_data = Some(table);
        self
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// True when the procedure completed without error.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// True when a p-value exists and lies at or below `alpha`.
    pub fn is_significant(&self, alpha: f64) -> bool {
        self.p_value.is_some_and(|p| p <= alpha)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_finite_values_dropped() {
        let r = TestExecutionResult::new("One-way ANOVA").with_statistic(f64::INFINITY, 0.0);
        assert_eq!(r.statistic, None);
        assert_eq!(r.p_value, Some(0.0));
        let r = TestExecutionResult::new("x").with_statistic(1.0, f64::NAN);
        assert_eq!(r.p_value, None);
        assert!(!r.is_significant(0.05));
    }

    #[test]
    fn failed_result() {
        let r = TestExecutionResult::failed("Welch's t-test", "insufficient data");
        assert!(!r.is_ok());
        assert_eq!(r.error.as_deref(), Some("insufficient data"));
        assert_eq!(r.statistic, None);
    }

    #[test]
    fn table_rows_padded() {
        let mut t = ResultTable::new(&["Group", "n", "Mean"]);
        t.push(vec![Cell::text("a"), Cell::count(3)]);
        assert_eq!(t.rows[0].len(), 3);
        assert_eq!(t.value("a", "n"), Some(3.0));
        assert_eq!(t.value("a", "Mean"), None);
        assert_eq!(t.column_values("n"), vec![Some(3.0)]);
    }

    #[test]
    fn serializes_to_json() {
        let mut t = ResultTable::new(&["Source", "p"]);
        t.push(vec![Cell::text("dose"), Cell::num(f64::NAN)]);
        let r = TestExecutionResult::new("One-way ANOVA")
            .with_statistic(3.5, 0.04)
            .with_table(t);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["test"], "One-way ANOVA");
        assert_eq!(json["results_data"]["rows"][0][1], serde_json::Value::Null);
        assert!(json["posthoc_data"].is_null());
        assert!(json["error"].is_null());
    }
}
