//! Column-major dataset consumed by the engine.
//!
//! The [`DataFrame`] stores named, equal-length columns together with a
//! compact validity bitmap marking missing cells. The engine never mutates
//! a frame it receives: row selection goes through
//! [`DataFrame::filter_rows`], which returns a new frame.
//!
//! # Column Types
//!
//! | Type | Storage | Typical role |
//! |------|---------|--------------|
//! | [`Numeric`](Column::Numeric) | `Vec<f64>` + bitmap | Measurements, covariates |
//! | [`Boolean`](Column::Boolean) | `Vec<bool>` + bitmap | Flags |
//! | [`Categorical`](Column::Categorical) | Dictionary + `Vec<u32>` | Grouping factors, subject ids |
//! | [`Text`](Column::Text) | `Vec<String>` + bitmap | Free-form labels |
//!
//! # Example
//!
//! ```
//! use u_labstat::dataframe::{Column, DataFrame};
//!
//! let mut df = DataFrame::new();
//! df.add_column("dose".into(), Column::from_labels(&[Some("low"), Some("high"), None]))
//!     .unwrap();
//! df.add_column("weight".into(), Column::from_numeric_options(&[Some(20.5), None, Some(19.8)]))
//!     .unwrap();
//!
//! assert_eq!(df.row_count(), 3);
//! assert_eq!(df.label_at("dose", 1).as_deref(), Some("high"));
//! assert_eq!(df.numeric_at("weight", 1), None);
//! ```

use crate::error::EngineError;
use std::collections::BTreeSet;

// ── ValidityBitmap ────────────────────────────────────────────────────

/// Bit-packed validity bitmap (1 = present, 0 = missing).
#[derive(Debug, Clone, PartialEq)]
pub struct ValidityBitmap {
    bits: Vec<u64>,
    len: usize,
}

impl ValidityBitmap {
    /// Creates a bitmap where all `len` positions are valid.
    pub fn all_valid(len: usize) -> Self {
        let n_words = len.div_ceil(64);
        let mut bits = vec![u64::MAX; n_words];
        let trailing = len % 64;
        if trailing != 0 && n_words > 0 {
            bits[n_words - 1] = (1u64 << trailing) - 1;
        }
        Self { bits, len }
    }

    /// Creates an empty bitmap with no rows.
    pub fn empty() -> Self {
        Self {
            bits: Vec::new(),
            len: 0,
        }
    }

    /// Builds a bitmap from per-row presence flags.
    pub fn from_flags(flags: impl IntoIterator<Item = bool>) -> Self {
        let mut bm = Self::empty();
        for f in flags {
            bm.push(f);
        }
        bm
    }

    /// Returns `true` if the value at `idx` is present.
    #[inline]
    pub fn is_valid(&self, idx: usize) -> bool {
        debug_assert!(idx < self.len, "index {idx} out of bounds (len={})", self.len);
        let (word, bit) = (idx / 64, idx % 64);
        (self.bits[word] >> bit) & 1 == 1
    }

    /// Appends a new position.
    pub fn push(&mut self, valid: bool) {
        let idx = self.len;
        self.len += 1;
        let (word, bit) = (idx / 64, idx % 64);
        if word >= self.bits.len() {
            self.bits.push(0);
        }
        if valid {
            self.bits[word] |= 1u64 << bit;
        }
    }

    /// Number of tracked positions.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the bitmap tracks zero positions.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Counts missing positions.
    pub fn null_count(&self) -> usize {
        let valid: usize = self.bits.iter().map(|w| w.count_ones() as usize).sum();
        self.len - valid
    }

    /// Keeps the positions where `mask` is `true`.
    fn filter(&self, mask: &[bool]) -> Self {
        Self::from_flags(
            mask.iter()
                .enumerate()
                .filter(|(_, &keep)| keep)
                .map(|(i, _)| self.is_valid(i)),
        )
    }
}

// ── DataType ──────────────────────────────────────────────────────────

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Numeric,
    Boolean,
    Categorical,
    Text,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Numeric => write!(f, "Numeric"),
            Self::Boolean => write!(f, "Boolean"),
            Self::Categorical => write!(f, "Categorical"),
            Self::Text => write!(f, "Text"),
        }
    }
}

// ── Column ────────────────────────────────────────────────────────────

/// A typed column. Missing positions hold a placeholder that is never read.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Numeric {
        values: Vec<f64>,
        validity: ValidityBitmap,
    },
    Boolean {
        values: Vec<bool>,
        validity: ValidityBitmap,
    },
    /// Dictionary-encoded labels; `indices[i]` points into `dictionary`.
    Categorical {
        dictionary: Vec<String>,
        indices: Vec<u32>,
        validity: ValidityBitmap,
    },
    Text {
        values: Vec<String>,
        validity: ValidityBitmap,
    },
}

impl Column {
    /// Creates a numeric column.
    pub fn numeric(values: Vec<f64>, validity: ValidityBitmap) -> Self {
        Self::Numeric { values, validity }
    }

    /// Creates a boolean column.
    pub fn boolean(values: Vec<bool>, validity: ValidityBitmap) -> Self {
        Self::Boolean { values, validity }
    }

    /// Creates a categorical column from a dictionary and indices.
    pub fn categorical(dictionary: Vec<String>, indices: Vec<u32>, validity: ValidityBitmap) -> Self {
        Self::Categorical {
            dictionary,
            indices,
            validity,
        }
    }

    /// Creates a text column.
    pub fn text(values: Vec<String>, validity: ValidityBitmap) -> Self {
        Self::Text { values, validity }
    }

    /// Numeric column from optional values. `None` and NaN become missing.
    pub fn from_numeric_options(values: &[Option<f64>]) -> Self {
        let validity = ValidityBitmap::from_flags(values.iter().map(|v| matches!(v, Some(x) if !x.is_nan())));
        let values = values.iter().map(|v| v.unwrap_or(0.0)).collect();
        Self::Numeric { values, validity }
    }

    /// Numeric column without missing values. NaN entries are marked missing.
    pub fn from_f64s(values: &[f64]) -> Self {
        let validity = ValidityBitmap::from_flags(values.iter().map(|v| !v.is_nan()));
        Self::Numeric {
            values: values.iter().map(|v| if v.is_nan() { 0.0 } else { *v }).collect(),
            validity,
        }
    }

    /// Dictionary-encoded categorical column from optional labels.
    pub fn from_labels<S: AsRef<str>>(labels: &[Option<S>]) -> Self {
        let mut dictionary: Vec<String> = Vec::new();
        let mut indices = Vec::with_capacity(labels.len());
        let mut validity = ValidityBitmap::empty();
        for label in labels {
            match label {
                Some(s) => {
                    let s = s.as_ref();
                    let idx = match dictionary.iter().position(|d| d == s) {
                        Some(i) => i,
                        None => {
                            dictionary.push(s.to_string());
                            dictionary.len() - 1
                        }
                    };
                    indices.push(idx as u32);
                    validity.push(true);
                }
                None => {
                    indices.push(0);
                    validity.push(false);
                }
            }
        }
        Self::Categorical {
            dictionary,
            indices,
            validity,
        }
    }

    /// Returns the storage type.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Numeric { .. } => DataType::Numeric,
            Self::Boolean { .. } => DataType::Boolean,
            Self::Categorical { .. } => DataType::Categorical,
            Self::Text { .. } => DataType::Text,
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.validity().len()
    }

    /// Returns `true` if the column has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The validity bitmap.
    pub fn validity(&self) -> &ValidityBitmap {
        match self {
            Self::Numeric { validity, .. }
            | Self::Boolean { validity, .. }
            | Self::Categorical { validity, .. }
            | Self::Text { validity, .. } => validity,
        }
    }

    /// Number of missing values.
    pub fn null_count(&self) -> usize {
        self.validity().null_count()
    }

    /// Returns `true` if the value at `idx` is present.
    pub fn is_valid(&self, idx: usize) -> bool {
        self.validity().is_valid(idx)
    }

    /// Stringified cell value, `None` when missing.
    ///
    /// Integral numbers print without a fractional part so that numeric
    /// grouping codes (`1`, `2`) read the same as their text form.
    pub fn label_at(&self, idx: usize) -> Option<String> {
        if !self.is_valid(idx) {
            return None;
        }
        Some(match self {
            Self::Numeric { values, .. } => format_number(values[idx]),
            Self::Boolean { values, .. } => values[idx].to_string(),
            Self::Categorical {
                dictionary,
                indices,
                ..
            } => dictionary.get(indices[idx] as usize)?.clone(),
            Self::Text { values, .. } => values[idx].clone(),
        })
    }

    /// Numeric cell value with coercion.
    ///
    /// Text and categorical cells that parse as a finite number are
    /// accepted; everything else (including missing cells) is `None`.
    pub fn numeric_at(&self, idx: usize) -> Option<f64> {
        if !self.is_valid(idx) {
            return None;
        }
        let v = match self {
            Self::Numeric { values, .. } => values[idx],
            Self::Boolean { values, .. } => {
                if values[idx] {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Categorical {
                dictionary,
                indices,
                ..
            } => dictionary.get(indices[idx] as usize)?.trim().parse().ok()?,
            Self::Text { values, .. } => values[idx].trim().parse().ok()?,
        };
        v.is_finite().then_some(v)
    }

    /// True when every present cell yields a number: numeric columns, and
    /// text or categorical columns whose labels all parse. Boolean columns
    /// are categorical by nature and never count.
    pub fn is_numeric_like(&self) -> bool {
        match self {
            Self::Numeric { .. } => true,
            Self::Boolean { .. } => false,
            Self::Categorical { .. } | Self::Text { .. } => {
                let present: Vec<usize> = (0..self.len()).filter(|&i| self.is_valid(i)).collect();
                !present.is_empty() && present.iter().all(|&i| self.numeric_at(i).is_some())
            }
        }
    }

    /// Returns a new column holding the rows where `mask` is `true`.
    pub fn filter(&self, mask: &[bool]) -> Self {
        let keep = |i: &usize| mask.get(*i).copied().unwrap_or(false);
        match self {
            Self::Numeric { values, validity } => Self::Numeric {
                values: (0..values.len()).filter(keep).map(|i| values[i]).collect(),
                validity: validity.filter(mask),
            },
            Self::Boolean { values, validity } => Self::Boolean {
                values: (0..values.len()).filter(keep).map(|i| values[i]).collect(),
                validity: validity.filter(mask),
            },
            Self::Categorical {
                dictionary,
                indices,
                validity,
            } => Self::Categorical {
                dictionary: dictionary.clone(),
                indices: (0..indices.len()).filter(keep).map(|i| indices[i]).collect(),
                validity: validity.filter(mask),
            },
            Self::Text { values, validity } => Self::Text {
                values: (0..values.len())
                    .filter(keep)
                    .map(|i| values[i].clone())
                    .collect(),
                validity: validity.filter(mask),
            },
        }
    }
}

/// Formats a number the way labels are displayed (`3` rather than `3.0`).
pub fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

// ── DataFrame ─────────────────────────────────────────────────────────

/// Column-major tabular data structure.
///
/// All columns have the same number of rows.
#[derive(Debug, Clone)]
pub struct DataFrame {
    names: Vec<String>,
    columns: Vec<Column>,
    row_count: usize,
}

impl DataFrame {
    /// Creates an empty DataFrame with no columns or rows.
    pub fn new() -> Self {
        Self {
            names: Vec::new(),
            columns: Vec::new(),
            row_count: 0,
        }
    }

    /// Adds a named column.
    ///
    /// Returns an error if the column length doesn't match the existing
    /// row count (unless this is the first column).
    pub fn add_column(&mut self, name: String, column: Column) -> Result<(), EngineError> {
        let col_len = column.len();
        if self.columns.is_empty() {
            self.row_count = col_len;
        } else if col_len != self.row_count {
            return Err(EngineError::DimensionMismatch {
                expected: self.row_count,
                actual: col_len,
            });
        }
        self.names.push(name);
        self.columns.push(column);
        Ok(())
    }

    /// Builder-style variant of [`add_column`](Self::add_column).
    pub fn with_column(mut self, name: &str, column: Column) -> Result<Self, EngineError> {
        self.add_column(name.to_string(), column)?;
        Ok(self)
    }

    /// Number of rows.
    #[inline]
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Number of columns.
    #[inline]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` if the DataFrame has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Returns the column at `index`.
    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    /// Returns the column with the given `name`.
    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.column_index(name).map(|i| &self.columns[i])
    }

    /// Like [`column_by_name`](Self::column_by_name) but with a typed error.
    pub fn require(&self, name: &str) -> Result<&Column, EngineError> {
        self.column_by_name(name)
            .ok_or_else(|| EngineError::ColumnNotFound { name: name.to_string() })
    }

    /// Returns the index of the column with the given `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Iterator over (name, column) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.names.iter().map(|s| s.as_str()).zip(self.columns.iter())
    }

    /// Stringified cell, `None` when missing or the column does not exist.
    pub fn label_at(&self, column: &str, row: usize) -> Option<String> {
        self.column_by_name(column)?.label_at(row)
    }

    /// Numeric cell with coercion, `None` when missing, non-numeric or absent.
    pub fn numeric_at(&self, column: &str, row: usize) -> Option<f64> {
        self.column_by_name(column)?.numeric_at(row)
    }

    /// Whether `column` can be analysed as a measurement (see
    /// [`Column::is_numeric_like`]).
    pub fn is_numeric_like(&self, column: &str) -> Result<bool, EngineError> {
        Ok(self.require(column)?.is_numeric_like())
    }

    /// Names of the columns stored as numbers.
    pub fn numeric_column_names(&self) -> Vec<String> {
        self.iter()
            .filter(|(_, c)| c.data_type() == DataType::Numeric)
            .map(|(n, _)| n.to_string())
            .collect()
    }

    /// Sorted distinct labels of a column (missing cells skipped).
    pub fn distinct_labels(&self, column: &str) -> Result<Vec<String>, EngineError> {
        let col = self.require(column)?;
        let set: BTreeSet<String> = (0..self.row_count).filter_map(|i| col.label_at(i)).collect();
        Ok(set.into_iter().collect())
    }

    /// Returns a new frame with the rows where `mask` is `true`.
    pub fn filter_rows(&self, mask: &[bool]) -> Result<DataFrame, EngineError> {
        if mask.len() != self.row_count {
            return Err(EngineError::DimensionMismatch {
                expected: self.row_count,
                actual: mask.len(),
            });
        }
        let row_count = mask.iter().filter(|&&k| k).count();
        Ok(DataFrame {
            names: self.names.clone(),
            columns: self.columns.iter().map(|c| c.filter(mask)).collect(),
            row_count,
        })
    }
}

impl Default for DataFrame {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_all_valid_and_boundaries() {
        let bm = ValidityBitmap::all_valid(65);
        assert_eq!(bm.bits.len(), 2);
        assert_eq!(bm.null_count(), 0);
        assert!(bm.is_valid(64));
    }

    #[test]
    fn bitmap_from_flags_across_words() {
        let bm = ValidityBitmap::from_flags((0..130).map(|i| i % 3 != 0));
        assert_eq!(bm.len(), 130);
        assert_eq!(bm.null_count(), (0..130).filter(|i| i % 3 == 0).count());
        assert!(!bm.is_valid(129));
        assert!(bm.is_valid(128));
    }

    #[test]
    fn numeric_options_mark_nan_missing() {
        let col = Column::from_numeric_options(&[Some(1.0), None, Some(f64::NAN), Some(4.0)]);
        assert_eq!(col.null_count(), 2);
        assert_eq!(col.numeric_at(0), Some(1.0));
        assert_eq!(col.numeric_at(2), None);
    }

    #[test]
    fn labels_are_dictionary_encoded() {
        let col = Column::from_labels(&[Some("a"), Some("b"), Some("a"), None]);
        match &col {
            Column::Categorical { dictionary, .. } => assert_eq!(dictionary.len(), 2),
            _ => panic!("expected categorical"),
        }
        assert_eq!(col.label_at(2).as_deref(), Some("a"));
        assert_eq!(col.label_at(3), None);
    }

    #[test]
    fn numeric_labels_drop_trailing_zero() {
        let col = Column::from_f64s(&[1.0, 2.5]);
        assert_eq!(col.label_at(0).as_deref(), Some("1"));
        assert_eq!(col.label_at(1).as_deref(), Some("2.5"));
    }

    #[test]
    fn text_coerces_to_numeric() {
        let col = Column::text(
            vec!["1.5".into(), "abc".into(), " 3 ".into()],
            ValidityBitmap::all_valid(3),
        );
        assert_eq!(col.numeric_at(0), Some(1.5));
        assert_eq!(col.numeric_at(1), None);
        assert_eq!(col.numeric_at(2), Some(3.0));
    }

    #[test]
    fn column_length_mismatch() {
        let mut df = DataFrame::new();
        df.add_column("x".into(), Column::from_f64s(&[1.0, 2.0])).unwrap();
        let result = df.add_column("y".into(), Column::from_f64s(&[1.0, 2.0, 3.0]));
        assert!(matches!(result, Err(EngineError::DimensionMismatch { .. })));
    }

    #[test]
    fn filter_rows_returns_new_frame() {
        let df = DataFrame::new()
            .with_column("g", Column::from_labels(&[Some("a"), Some("b"), None]))
            .unwrap()
            .with_column("v", Column::from_numeric_options(&[Some(1.0), None, Some(3.0)]))
            .unwrap();
        let filtered = df.filter_rows(&[false, true, true]).unwrap();
        assert_eq!(filtered.row_count(), 2);
        assert_eq!(filtered.label_at("g", 0).as_deref(), Some("b"));
        assert_eq!(filtered.label_at("g", 1), None);
        assert_eq!(filtered.numeric_at("v", 1), Some(3.0));
        // original untouched
        assert_eq!(df.row_count(), 3);
    }

    #[test]
    fn distinct_labels_sorted() {
        let df = DataFrame::new()
            .with_column("g", Column::from_labels(&[Some("c"), Some("a"), Some("c"), None]))
            .unwrap();
        assert_eq!(df.distinct_labels("g").unwrap(), vec!["a", "c"]);
        assert!(df.distinct_labels("missing").is_err());
    }

    #[test]
    fn numeric_column_names_only_numeric() {
        let df = DataFrame::new()
            .with_column("g", Column::from_labels(&[Some("a")]))
            .unwrap()
            .with_column("v", Column::from_f64s(&[1.0]))
            .unwrap();
        assert_eq!(df.numeric_column_names(), vec!["v"]);
    }

    #[test]
    fn numeric_like_detection() {
        let df = DataFrame::new()
            .with_column("codes", Column::from_labels(&[Some("1.5"), None, Some("2")]))
            .unwrap()
            .with_column("sex", Column::from_labels(&[Some("F"), Some("M"), Some("F")]))
            .unwrap()
            .with_column("flag", Column::boolean(vec![true, false, true], ValidityBitmap::all_valid(3)))
            .unwrap();
        assert!(df.is_numeric_like("codes").unwrap());
        assert!(!df.is_numeric_like("sex").unwrap());
        assert!(!df.is_numeric_like("flag").unwrap());
        assert!(df.is_numeric_like("nope").is_err());
    }
}
