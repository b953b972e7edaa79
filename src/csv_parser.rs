//! CSV ingestion for measurement tables.
//!
//! Parses delimited text into a [`DataFrame`](crate::dataframe::DataFrame),
//! inferring one type per column: a column whose non-missing cells all
//! parse as numbers becomes `Numeric`; low-cardinality labels (group names,
//! treatment arms) become `Categorical`; everything else stays `Text`.
//! Labels are kept verbatim, so `yes`/`no` outcomes are categories rather
//! than booleans.
//!
//! # Example
//!
//! ```
//! use u_labstat::csv_parser::CsvParser;
//! use u_labstat::dataframe::DataType;
//!
//! let csv = "subject,group,weight\nS1,ctrl,20.5\nS2,ctrl,NA\nS3,treated,23.1\nS4,treated,22.8\n";
//! let df = CsvParser::new().parse_str(csv).unwrap();
//! assert_eq!(df.row_count(), 4);
//! assert_eq!(df.column_by_name("group").unwrap().data_type(), DataType::Categorical);
//! assert_eq!(df.column_by_name("weight").unwrap().data_type(), DataType::Numeric);
//! assert_eq!(df.numeric_at("weight", 1), None);
//! ```

use crate::dataframe::{Column, DataFrame, DataType, ValidityBitmap};
use crate::error::EngineError;
use std::collections::{HashMap, HashSet};

/// Standard missing-value markers recognized during parsing.
const DEFAULT_NULL_MARKERS: &[&str] = &[
    "", "NA", "N/A", "na", "n/a", "null", "NULL", "None", "none", ".", "NaN", "nan", "#N/A",
];

/// Maximum unique-value ratio for a label column to be stored as Categorical.
const CATEGORICAL_THRESHOLD: f64 = 0.5;

/// Maximum dictionary size for categorical columns.
const MAX_CATEGORICAL_UNIQUE: usize = 1000;

/// CSV parser configuration and entry point.
#[derive(Debug, Clone)]
pub struct CsvParser {
    delimiter: u8,
    null_markers: Vec<String>,
    categorical: Vec<String>,
}

impl CsvParser {
    /// Comma delimiter, header row, standard missing markers.
    pub fn new() -> Self {
        Self {
            delimiter: b',',
            null_markers: DEFAULT_NULL_MARKERS.iter().map(|s| (*s).to_string()).collect(),
            categorical: Vec::new(),
        }
    }

    /// Sets the field delimiter.
    pub fn delimiter(mut self, delim: u8) -> Self {
        self.delimiter = delim;
        self
    }

    /// Forces the named columns to be read as categorical labels, even when
    /// every value is numeric (e.g. numbered dose levels or subject ids).
    pub fn categorical_columns(mut self, names: &[&str]) -> Self {
        self.categorical = names.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Parses a CSV string. The first row is the header.
    pub fn parse_str(&self, input: &str) -> Result<DataFrame, EngineError> {
        let input = input.strip_prefix('\u{feff}').unwrap_or(input);
        let raw_rows = parse_raw(input, self.delimiter as char);
        let Some((headers, data_rows)) = raw_rows.split_first() else {
            return Ok(DataFrame::new());
        };

        let n_cols = headers.len();
        let mut raw_columns: Vec<Vec<&str>> = vec![Vec::with_capacity(data_rows.len()); n_cols];
        for (line_idx, row) in data_rows.iter().enumerate() {
            if row.len() != n_cols {
                return Err(EngineError::CsvParse {
                    line: line_idx + 2,
                    message: format!("expected {n_cols} fields, got {}", row.len()),
                });
            }
            for (col_idx, field) in row.iter().enumerate() {
                raw_columns[col_idx].push(field.trim());
            }
        }

        let mut df = DataFrame::new();
        for (name, raw) in headers.iter().zip(raw_columns.iter()) {
            let name = name.trim().to_string();
            let force_categorical = self.categorical.contains(&name);
            df.add_column(name, self.build_column(raw, force_categorical))?;
        }
        Ok(df)
    }

    /// Parses a CSV file from disk.
    pub fn parse_file(&self, path: &str) -> Result<DataFrame, EngineError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_str(&content)
    }

    fn is_null(&self, value: &str) -> bool {
        self.null_markers.iter().any(|m| m == value)
    }

    fn build_column(&self, values: &[&str], force_categorical: bool) -> Column {
        let null_flags: Vec<bool> = values.iter().map(|s| self.is_null(s)).collect();
        let present: Vec<&str> = values
            .iter()
            .zip(null_flags.iter())
            .filter(|(_, &is_null)| !is_null)
            .map(|(&v, _)| v)
            .collect();

        let data_type = if force_categorical {
            DataType::Categorical
        } else if present.iter().all(|s| s.parse::<f64>().is_ok()) {
            DataType::Numeric
        } else {
            let unique: HashSet<&str> = present.iter().copied().collect();
            let ratio = unique.len() as f64 / present.len().max(1) as f64;
            if ratio <= CATEGORICAL_THRESHOLD && unique.len() <= MAX_CATEGORICAL_UNIQUE {
                DataType::Categorical
            } else {
                DataType::Text
            }
        };

        let validity = ValidityBitmap::from_flags(null_flags.iter().map(|n| !n));
        match data_type {
            DataType::Numeric => Column::numeric(
                values
                    .iter()
                    .zip(null_flags.iter())
                    .map(|(v, &null)| if null { 0.0 } else { v.parse().unwrap_or(0.0) })
                    .collect(),
                validity,
            ),
            DataType::Categorical => {
                let mut lookup: HashMap<&str, u32> = HashMap::new();
                let mut dictionary = Vec::new();
                let indices = values
                    .iter()
                    .zip(null_flags.iter())
                    .map(|(&v, &null)| {
                        if null {
                            return 0;
                        }
                        *lookup.entry(v).or_insert_with(|| {
                            dictionary.push(v.to_string());
                            (dictionary.len() - 1) as u32
                        })
                    })
                    .collect();
                Column::categorical(dictionary, indices, validity)
            }
            _ => Column::text(
                values
                    .iter()
                    .zip(null_flags.iter())
                    .map(|(v, &null)| if null { String::new() } else { v.to_string() })
                    .collect(),
                validity,
            ),
        }
    }
}

impl Default for CsvParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits CSV text into rows of fields (RFC 4180 quoting, CRLF tolerant).
fn parse_raw(input: &str, delim: char) -> Vec<Vec<String>> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut current_row: Vec<String> = Vec::new();
    let mut current_field = String::new();
    let mut in_quotes = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current_field.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                current_field.push(c);
            }
        } else if c == '"' && current_field.is_empty() {
            in_quotes = true;
        } else if c == delim {
            current_row.push(std::mem::take(&mut current_field));
        } else if c == '\n' {
            if current_field.ends_with('\r') {
                current_field.pop();
            }
            current_row.push(std::mem::take(&mut current_field));
            if current_row.iter().any(|f| !f.is_empty()) {
                rows.push(std::mem::take(&mut current_row));
            } else {
                current_row.clear();
            }
        } else {
            current_field.push(c);
        }
    }

    if current_field.ends_with('\r') {
        current_field.pop();
    }
    if !current_field.is_empty() || !current_row.is_empty() {
        current_row.push(current_field);
        if current_row.iter().any(|f| !f.is_empty()) {
            rows.push(current_row);
        }
    }
    rows
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_numeric_and_categorical() {
        let csv = "group,value\nA,1.0\nA,2.0\nB,3.0\nB,4.0\n";
        let df = CsvParser::new().parse_str(csv).unwrap();
        assert_eq!(df.column_by_name("group").unwrap().data_type(), DataType::Categorical);
        assert_eq!(df.column_by_name("value").unwrap().data_type(), DataType::Numeric);
    }

    #[test]
    fn parse_file_reads_from_disk() {
        let path = std::env::temp_dir().join(format!("u_labstat_csv_{}.csv", std::process::id()));
        std::fs::write(&path, "group,value\nA,1.0\nB,2.5\n").unwrap();
        let df = CsvParser::new().parse_file(path.to_str().unwrap());
        std::fs::remove_file(&path).unwrap();
        let df = df.unwrap();
        assert_eq!(df.row_count(), 2);
        assert_eq!(df.numeric_at("value", 1), Some(2.5));

        let err = CsvParser::new().parse_file("/nonexistent/u_labstat.csv").unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
    }

    #[test]
    fn missing_markers() {
        let csv = "v\n1\nNA\n\n3\nn/a\n";
        let df = CsvParser::new().parse_str(csv).unwrap();
        // the blank line is skipped, NA and n/a are missing
        assert_eq!(df.row_count(), 4);
        assert_eq!(df.column(0).unwrap().null_count(), 2);
    }

    #[test]
    fn unique_labels_become_text() {
        let csv = "subject\nS1\nS2\nS3\n";
        let df = CsvParser::new().parse_str(csv).unwrap();
        assert_eq!(df.column(0).unwrap().data_type(), DataType::Text);
        assert_eq!(df.label_at("subject", 2).as_deref(), Some("S3"));
    }

    #[test]
    fn forced_categorical_numbers() {
        let csv = "dose,v\n1,2.0\n2,3.0\n1,4.0\n";
        let df = CsvParser::new()
            .categorical_columns(&["dose"])
            .parse_str(csv)
            .unwrap();
        assert_eq!(df.column_by_name("dose").unwrap().data_type(), DataType::Categorical);
        assert_eq!(df.distinct_labels("dose").unwrap(), vec!["1", "2"]);
    }

    #[test]
    fn quoted_fields_and_crlf() {
        let csv = "name,v\r\n\"a, b\",1\r\n\"say \"\"hi\"\"\",2\r\n";
        let df = CsvParser::new().parse_str(csv).unwrap();
        assert_eq!(df.row_count(), 2);
        assert_eq!(df.label_at("name", 0).as_deref(), Some("a, b"));
        assert_eq!(df.label_at("name", 1).as_deref(), Some("say \"hi\""));
        assert_eq!(df.numeric_at("v", 1), Some(2.0));
    }

    #[test]
    fn field_count_mismatch() {
        let err = CsvParser::new().parse_str("a,b\n1\n").unwrap_err();
        assert!(matches!(err, EngineError::CsvParse { line: 2, .. }));
    }

    #[test]
    fn empty_input() {
        let df = CsvParser::new().parse_str("").unwrap();
        assert!(df.is_empty());
    }

    #[test]
    fn semicolon_delimiter() {
        let df = CsvParser::new()
            .delimiter(b';')
            .parse_str("a;b\n1;2\n")
            .unwrap();
        assert_eq!(df.numeric_at("b", 0), Some(2.0));
    }
}
