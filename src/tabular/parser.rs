//! CSV parsing into variable value sets

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use super::{
    CsvParseOptions, ExpectedVariable, InvalidValue, ParseError, ParseStatistics, ParseWarning,
    ParsedRows, RowDiagnostic,
};
use crate::template::{TemplateDefinition, VariableType, VariableValueSet};
use crate::value::VariableValue;

/// A variable bound to a column position
#[derive(Debug)]
struct ColumnBinding {
    name: String,
    index: Option<usize>,
    required: bool,
}

fn narrowest_type(raw: &str) -> VariableType {
    let value = VariableValue::from(raw);
    if value.as_boolean().is_some() {
        VariableType::Boolean
    } else if value.as_number().is_some() {
        VariableType::Number
    } else {
        VariableType::Text
    }
}

fn widen(current: Option<VariableType>, next: VariableType) -> VariableType {
    match current {
        None => next,
        Some(t) if t == next => t,
        Some(_) => VariableType::Text,
    }
}

fn fits(raw: &str, expected: VariableType) -> bool {
    let value = VariableValue::from(raw);
    match expected {
        VariableType::Number => value.as_number().is_some(),
        VariableType::Boolean => value.as_boolean().is_some(),
        VariableType::Text | VariableType::Enum => true,
    }
}

/// Bind expected variables to header columns, failing on a malformed header
fn bind_header(
    header: &csv::StringRecord,
    expected: &[ExpectedVariable],
    warnings: &mut Vec<ParseWarning>,
) -> Result<Vec<ColumnBinding>, ParseError> {
    let names: Vec<&str> = header.iter().map(str::trim).collect();

    let mut seen = HashSet::new();
    for name in &names {
        if !name.is_empty() && !seen.insert(*name) {
            return Err(ParseError::DuplicateHeader(name.to_string()));
        }
    }

    if expected.is_empty() {
        return Ok(names
            .iter()
            .enumerate()
            .filter(|(_, name)| !name.is_empty())
            .map(|(index, name)| ColumnBinding {
                name: name.to_string(),
                index: Some(index),
                required: false,
            })
            .collect());
    }

    let position = |name: &str| names.iter().position(|h| *h == name);

    let missing: Vec<String> = expected
        .iter()
        .filter(|e| e.required && position(&e.name).is_none())
        .map(|e| e.name.clone())
        .collect();
    if !missing.is_empty() {
        return Err(ParseError::MissingHeaderColumns { missing });
    }

    Ok(expected
        .iter()
        .map(|e| {
            let index = position(&e.name);
            if index.is_none() {
                warnings.push(ParseWarning::MissingOptionalColumn { name: e.name.clone() });
            }
            ColumnBinding {
                name: e.name.clone(),
                index,
                required: e.required,
            }
        })
        .collect())
}

/// Bind expected variables to columns by position when there is no header
fn bind_positional(expected: &[ExpectedVariable], width: usize) -> Vec<ColumnBinding> {
    if expected.is_empty() {
        return (0..width)
            .map(|index| ColumnBinding {
                name: format!("column_{}", index + 1),
                index: Some(index),
                required: false,
            })
            .collect();
    }
    expected
        .iter()
        .enumerate()
        .map(|(index, e)| ColumnBinding {
            name: e.name.clone(),
            index: Some(index),
            required: e.required,
        })
        .collect()
}

/// Parse delimited text into value sets
pub fn parse_csv(
    text: &str,
    expected: &[ExpectedVariable],
    options: &CsvParseOptions,
) -> Result<ParsedRows, ParseError> {
    if !options.delimiter.is_ascii() {
        return Err(ParseError::InvalidDelimiter(options.delimiter));
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(options.delimiter as u8)
        .has_headers(false)
        .flexible(true)
        .trim(if options.trim_whitespace {
            csv::Trim::All
        } else {
            csv::Trim::None
        })
        .from_reader(text.as_bytes());

    let mut records = reader.records().peekable();
    let mut parsed = ParsedRows::default();

    let bindings = if options.has_header {
        let header = records.next().ok_or(ParseError::EmptyInput)??;
        bind_header(&header, expected, &mut parsed.warnings)?
    } else {
        let width = match records.peek() {
            Some(Ok(first)) => first.len(),
            _ => 0,
        };
        bind_positional(expected, width)
    };

    let mut inferred: BTreeMap<String, Option<VariableType>> =
        bindings.iter().map(|b| (b.name.clone(), None)).collect();
    let mut stats = ParseStatistics::default();

    for (row_index, result) in records.enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                if options.max_rows.map_or(false, |max| stats.total_rows >= max) {
                    stats.truncated = true;
                    break;
                }
                warn!(row_index, error = %e, "Unreadable CSV record");
                stats.total_rows += 1;
                stats.invalid_rows += 1;
                parsed.diagnostics.push(RowDiagnostic {
                    row_index,
                    line: e.position().map(|p| p.line()),
                    message: Some(e.to_string()),
                    ..Default::default()
                });
                continue;
            }
        };

        if record.iter().all(|field| field.trim().is_empty()) && options.skip_empty_rows {
            stats.skipped_rows += 1;
            continue;
        }

        if let Some(max) = options.max_rows {
            if stats.total_rows >= max {
                stats.truncated = true;
                break;
            }
        }
        stats.total_rows += 1;

        let mut diagnostic = RowDiagnostic {
            row_index,
            line: record.position().map(|p| p.line()),
            ..Default::default()
        };
        let mut values = VariableValueSet::new();

        for binding in &bindings {
            let raw = binding.index.and_then(|i| record.get(i)).unwrap_or("");
            if raw.is_empty() {
                if binding.required {
                    diagnostic.missing_columns.push(binding.name.clone());
                }
                continue;
            }

            if let Some(&hint) = options.column_types.get(&binding.name) {
                if !fits(raw, hint) {
                    diagnostic.invalid_values.push(InvalidValue {
                        column: binding.name.clone(),
                        value: raw.to_string(),
                        expected: hint,
                    });
                }
            }

            if let Some(slot) = inferred.get_mut(&binding.name) {
                *slot = Some(widen(*slot, narrowest_type(raw)));
            }
            values.insert(binding.name.clone(), raw);
        }

        if diagnostic.missing_columns.is_empty() && diagnostic.invalid_values.is_empty() {
            stats.valid_rows += 1;
            parsed.value_sets.push(values);
            parsed.row_indices.push(row_index);
        } else {
            debug!(
                row_index,
                missing = ?diagnostic.missing_columns,
                invalid = diagnostic.invalid_values.len(),
                "Row excluded"
            );
            stats.invalid_rows += 1;
            parsed.diagnostics.push(diagnostic);
        }
    }

    if stats.truncated {
        if let Some(max_rows) = options.max_rows {
            warn!(max_rows, "CSV input truncated");
            parsed.warnings.push(ParseWarning::Truncated { max_rows });
        }
    }

    stats.inferred_types = inferred
        .into_iter()
        .filter_map(|(name, t)| t.map(|t| (name, t)))
        .collect();
    parsed.statistics = stats;

    debug!(
        total = parsed.statistics.total_rows,
        valid = parsed.statistics.valid_rows,
        invalid = parsed.statistics.invalid_rows,
        "CSV parsed"
    );

    Ok(parsed)
}

/// Parse rows for a template's variables
pub fn parse_for_template(
    text: &str,
    template: &TemplateDefinition,
    options: &CsvParseOptions,
) -> Result<ParsedRows, ParseError> {
    parse_csv(text, &ExpectedVariable::from_template(template), options)
}
