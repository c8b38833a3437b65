//! Tabular input for batch runs
//!
//! Turns delimited text into one [`VariableValueSet`] per data row. Header
//! problems fail the whole parse; row problems are reported per row and the
//! remaining rows stay usable.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::template::{TemplateDefinition, VariableType, VariableValueSet};

pub mod parser;

pub use parser::{parse_csv, parse_for_template};

/// Hard failures that make the whole input unusable
#[derive(Error, Debug)]
pub enum ParseError {
    /// Required variables with no column
    #[error("Header is missing required columns: {}", .missing.join(", "))]
    MissingHeaderColumns {
        /// Column names that were expected
        missing: Vec<String>,
    },

    /// Two header columns share a name
    #[error("Header contains duplicate column '{0}'")]
    DuplicateHeader(String),

    /// The configured delimiter cannot be used
    #[error("Delimiter {0:?} must be a single ASCII character")]
    InvalidDelimiter(char),

    /// Nothing to read, not even a header
    #[error("Input has no header row")]
    EmptyInput,

    /// Reader failure outside a single record
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// A variable the parser should look for in each row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedVariable {
    /// Variable and column name
    pub name: String,
    /// Rows without a value for it are invalid
    pub required: bool,
}

impl ExpectedVariable {
    /// A variable every row must supply
    pub fn required(name: impl Into<String>) -> Self {
        Self { name: name.into(), required: true }
    }

    /// A variable rows may leave out
    pub fn optional(name: impl Into<String>) -> Self {
        Self { name: name.into(), required: false }
    }

    /// Expected variables for a template; required means required without a default
    pub fn from_template(template: &TemplateDefinition) -> Vec<Self> {
        template
            .variables
            .iter()
            .map(|v| Self {
                name: v.name.clone(),
                required: v.must_be_supplied(),
            })
            .collect()
    }
}

/// Parser options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvParseOptions {
    /// Single ASCII character
    pub delimiter: char,
    /// Without a header, expected variables bind to columns in order
    pub has_header: bool,
    /// Trim surrounding whitespace from every field
    pub trim_whitespace: bool,
    /// Ignore rows whose fields are all empty
    pub skip_empty_rows: bool,
    /// Cap on data rows read; further rows are dropped with a warning
    pub max_rows: Option<usize>,
    /// Types that column values must parse as
    pub column_types: HashMap<String, VariableType>,
}

impl Default for CsvParseOptions {
    fn default() -> Self {
        Self {
            delimiter: ',',
            has_header: true,
            trim_whitespace: true,
            skip_empty_rows: true,
            max_rows: None,
            column_types: HashMap::new(),
        }
    }
}

impl CsvParseOptions {
    /// Set the field delimiter
    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Set whether the first row is a header
    pub fn with_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }

    /// Toggle whitespace trimming
    pub fn with_trim(mut self, trim: bool) -> Self {
        self.trim_whitespace = trim;
        self
    }

    /// Toggle skipping of empty rows
    pub fn with_skip_empty_rows(mut self, skip: bool) -> Self {
        self.skip_empty_rows = skip;
        self
    }

    /// Read at most `max_rows` data rows
    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    /// Require values of `column` to parse as `var_type`
    pub fn with_column_type(mut self, column: impl Into<String>, var_type: VariableType) -> Self {
        self.column_types.insert(column.into(), var_type);
        self
    }
}

/// A value that failed its column type hint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidValue {
    /// Column name
    pub column: String,
    /// Offending field value
    pub value: String,
    /// Type the column was declared as
    pub expected: VariableType,
}

/// Problems found in one data row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowDiagnostic {
    /// 0-based data row index in file order
    pub row_index: usize,
    /// 1-based physical line, when known
    pub line: Option<u64>,
    /// Required variables that were absent or empty
    pub missing_columns: Vec<String>,
    /// Values that failed their column type
    pub invalid_values: Vec<InvalidValue>,
    /// Record-level read failure
    pub message: Option<String>,
}

/// File-level notices that do not invalidate rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParseWarning {
    /// Input exceeded `max_rows` and was cut off
    Truncated {
        /// Configured cap
        max_rows: usize,
    },
    /// An optional expected variable has no column
    MissingOptionalColumn {
        /// Variable name
        name: String,
    },
}

/// File-level statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseStatistics {
    /// Data rows read, including invalid ones, excluding skipped empty rows
    pub total_rows: usize,
    /// Rows turned into value sets
    pub valid_rows: usize,
    /// Rows reported in diagnostics
    pub invalid_rows: usize,
    /// Empty rows left out
    pub skipped_rows: usize,
    /// Whether `max_rows` cut the input short
    pub truncated: bool,
    /// Narrowest type every non-empty value of a column fits
    pub inferred_types: BTreeMap<String, VariableType>,
}

/// Parser output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedRows {
    /// Valid rows, in file order
    pub value_sets: Vec<VariableValueSet>,
    /// Source row index for each entry of `value_sets`
    pub row_indices: Vec<usize>,
    /// One entry per invalid row
    pub diagnostics: Vec<RowDiagnostic>,
    /// File-level notices
    pub warnings: Vec<ParseWarning>,
    /// Row counts and inferred column types
    pub statistics: ParseStatistics,
}
