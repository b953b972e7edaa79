//! Wide → long-form reshaping for repeated measures.
//!
//! In a wide table every within-subject level (time point, condition) is
//! its own column. [`to_long_form`] builds a separate [`LongForm`] with one
//! row per (subject, level); the input frame is never modified.
//!
//! ```
//! use u_labstat::dataframe::{Column, DataFrame};
//! use u_labstat::reshape::to_long_form;
//!
//! let df = DataFrame::new()
//!     .with_column("animal", Column::from_labels(&[Some("A1"), Some("A2")])).unwrap()
//!     .with_column("day0", Column::from_f64s(&[10.0, 11.0])).unwrap()
//!     .with_column("day7", Column::from_numeric_options(&[Some(12.0), None])).unwrap();
//!
//! let long = to_long_form(&df, "animal", &["day0".into(), "day7".into()], &[], "Day").unwrap();
//! assert_eq!(long.rows.len(), 4);
//! assert_eq!(long.missing_value_count(), 1);
//! assert_eq!(long.complete_subjects().len(), 1);
//! ```

use crate::dataframe::DataFrame;
use crate::error::EngineError;
use std::collections::{BTreeMap, BTreeSet};

/// One (subject, level) observation.
#[derive(Debug, Clone, PartialEq)]
pub struct LongRow {
    /// `None` when the subject id cell was empty.
    pub subject: Option<String>,
    pub level: String,
    pub value: Option<f64>,
    /// Between-subject factor labels, aligned with [`LongForm::between`].
    pub between: Vec<Option<String>>,
}

/// Long-form view of a repeated-measures table.
#[derive(Debug, Clone, PartialEq)]
pub struct LongForm {
    pub subject_column: String,
    /// Name of the synthetic within-subject factor.
    pub within_name: String,
    /// Within levels in the order of the original wide columns.
    pub levels: Vec<String>,
    pub between: Vec<String>,
    pub rows: Vec<LongRow>,
}

/// A subject observed at every level.
#[derive(Debug, Clone, PartialEq)]
pub struct CompleteSubject {
    pub subject: String,
    pub between: Vec<String>,
    /// One value per level, in [`LongForm::levels`] order.
    pub values: Vec<f64>,
}

/// Builds the long form of `level_columns`.
///
/// Subject ids must be unique among non-empty cells; a repeated id would
/// put two observations in one (subject, level) slot and is rejected.
pub fn to_long_form(
    df: &DataFrame,
    subject_column: &str,
    level_columns: &[String],
    between: &[String],
    within_name: &str,
) -> Result<LongForm, EngineError> {
    df.require(subject_column)?;
    for name in level_columns.iter().chain(between) {
        df.require(name)?;
    }

    let mut seen = BTreeSet::new();
    for row in 0..df.row_count() {
        if let Some(id) = df.label_at(subject_column, row) {
            if !seen.insert(id.clone()) {
                return Err(EngineError::DuplicateObservation {
                    subject: id,
                    level: level_columns.first().cloned().unwrap_or_default(),
                });
            }
        }
    }

    let mut rows = Vec::with_capacity(df.row_count() * level_columns.len());
    for row in 0..df.row_count() {
        let subject = df.label_at(subject_column, row);
        let labels: Vec<Option<String>> = between.iter().map(|b| df.label_at(b, row)).collect();
        for level in level_columns {
            rows.push(LongRow {
                subject: subject.clone(),
                level: level.clone(),
                value: df.numeric_at(level, row),
                between: labels.clone(),
            });
        }
    }

    Ok(LongForm {
        subject_column: subject_column.to_string(),
        within_name: within_name.to_string(),
        levels: level_columns.to_vec(),
        between: between.to_vec(),
        rows,
    })
}

impl LongForm {
    /// Rows belonging to one level.
    pub fn level_rows<'a>(&'a self, level: &'a str) -> impl Iterator<Item = &'a LongRow> + 'a {
        self.rows.iter().filter(move |r| r.level == level)
    }

    /// Rows with an identified subject and complete between labels.
    pub fn identified_rows(&self) -> impl Iterator<Item = &LongRow> {
        self.rows
            .iter()
            .filter(|r| r.subject.is_some() && r.between.iter().all(Option::is_some))
    }

    /// Missing measurements among identified rows.
    pub fn missing_value_count(&self) -> usize {
        self.identified_rows().filter(|r| r.value.is_none()).count()
    }

    /// Subjects (with complete between labels) observed at every level,
    /// sorted by subject id.
    pub fn complete_subjects(&self) -> Vec<CompleteSubject> {
        let level_index: BTreeMap<&str, usize> = self
            .levels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.as_str(), i))
            .collect();
        let mut by_subject: BTreeMap<&str, (Vec<String>, Vec<Option<f64>>)> = BTreeMap::new();
        for r in self.identified_rows() {
            let Some(subject) = r.subject.as_deref() else {
                continue;
            };
            let entry = by_subject.entry(subject).or_insert_with(|| {
                (
                    r.between.iter().flatten().cloned().collect(),
                    vec![None; self.levels.len()],
                )
            });
            if let Some(&i) = level_index.get(r.level.as_str()) {
                entry.1[i] = r.value;
            }
        }
        by_subject
            .into_iter()
            .filter_map(|(subject, (between, values))| {
                let values: Option<Vec<f64>> = values.into_iter().collect();
                values.map(|values| CompleteSubject {
                    subject: subject.to_string(),
                    between,
                    values,
                })
            })
            .collect()
    }

    /// Number of distinct identified subjects.
    pub fn subject_count(&self) -> usize {
        self.identified_rows()
            .filter_map(|r| r.subject.as_deref())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Returns a copy with the flagged rows' values set to missing.
    pub fn with_values_removed(&self, mask: &[bool]) -> LongForm {
        let mut out = self.clone();
        for (row, &drop) in out.rows.iter_mut().zip(mask) {
            if drop {
                row.value = None;
            }
        }
        out
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
