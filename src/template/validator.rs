//! Value set validation
//!
//! Checks a proposed [`VariableValueSet`] against a template's variable
//! definitions. Expected invalid input yields [`ValidationOutcome::Invalid`];
//! only malformed definitions produce an `Err`.

use std::collections::HashSet;
use std::fmt;

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::extractor::is_valid_name;
use super::{Constraint, TemplateError, VariableDefinition, VariableType, VariableValueSet};
use crate::value::VariableValue;

/// Why a single variable failed validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum VariableErrorKind {
    /// Required variable absent from the value set
    Missing,
    /// Required variable present but null
    Null,
    /// Value cannot be read as the declared type
    TypeMismatch {
        /// Declared type
        expected: VariableType,
        /// Shape of the supplied value
        actual: String,
    },
    /// Value is not a member of the enumeration
    NotInEnum {
        /// Supplied value
        value: String,
        /// Declared options
        allowed: Vec<String>,
    },
    /// Number outside the declared range
    OutOfRange {
        /// Supplied number
        value: f64,
        /// Lower bound
        min: Option<f64>,
        /// Upper bound
        max: Option<f64>,
    },
    /// Text does not match the declared pattern
    PatternMismatch {
        /// Supplied text
        value: String,
        /// Declared pattern
        pattern: String,
    },
    /// Text length outside the declared bounds
    LengthOutOfRange {
        /// Length of the supplied text
        length: usize,
        /// Shortest allowed
        min: Option<usize>,
        /// Longest allowed
        max: Option<usize>,
    },
}

impl VariableErrorKind {
    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            VariableErrorKind::Missing => "missing",
            VariableErrorKind::Null => "null",
            VariableErrorKind::TypeMismatch { .. } => "type_mismatch",
            VariableErrorKind::NotInEnum { .. } => "not_in_enum",
            VariableErrorKind::OutOfRange { .. } => "out_of_range",
            VariableErrorKind::PatternMismatch { .. } => "pattern_mismatch",
            VariableErrorKind::LengthOutOfRange { .. } => "length_out_of_range",
        }
    }
}

/// A validation failure for one variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableError {
    /// Variable that failed
    pub variable: String,
    /// What was wrong with it
    pub kind: VariableErrorKind,
}

impl fmt::Display for VariableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            VariableErrorKind::Missing => write!(f, "'{}' is required", self.variable),
            VariableErrorKind::Null => write!(f, "'{}' must not be null", self.variable),
            VariableErrorKind::TypeMismatch { expected, actual } => {
                write!(f, "'{}' expected {}, got {}", self.variable, expected, actual)
            }
            VariableErrorKind::NotInEnum { value, allowed } => write!(
                f,
                "'{}' value '{}' not in [{}]",
                self.variable,
                value,
                allowed.join(", ")
            ),
            VariableErrorKind::OutOfRange { value, min, max } => write!(
                f,
                "'{}' value {} outside [{}, {}]",
                self.variable,
                value,
                min.map(|m| m.to_string()).unwrap_or_default(),
                max.map(|m| m.to_string()).unwrap_or_default()
            ),
            VariableErrorKind::PatternMismatch { value, pattern } => {
                write!(f, "'{}' value '{}' does not match {}", self.variable, value, pattern)
            }
            VariableErrorKind::LengthOutOfRange { length, min, max } => write!(
                f,
                "'{}' length {} outside [{}, {}]",
                self.variable,
                length,
                min.map(|m| m.to_string()).unwrap_or_default(),
                max.map(|m| m.to_string()).unwrap_or_default()
            ),
        }
    }
}

/// Structured validation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValidationOutcome {
    /// Every variable passed
    Valid,
    /// At least one variable failed
    Invalid {
        /// One entry per failing check
        errors: Vec<VariableError>,
    },
}

impl ValidationOutcome {
    /// Whether validation passed
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid)
    }

    /// Empty for a valid outcome
    pub fn errors(&self) -> &[VariableError] {
        match self {
            ValidationOutcome::Valid => &[],
            ValidationOutcome::Invalid { errors } => errors,
        }
    }

    /// Names reported as missing, in definition order
    pub fn missing(&self) -> Vec<&str> {
        self.errors()
            .iter()
            .filter(|e| e.kind == VariableErrorKind::Missing)
            .map(|e| e.variable.as_str())
            .collect()
    }

    /// One-line summary of every error
    pub fn summary(&self) -> String {
        self.errors()
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validation capability used by the batch coordinator
pub trait Validator: Send + Sync {
    /// Reject malformed definitions (programmer error)
    fn check_definitions(&self, definitions: &[VariableDefinition]) -> Result<(), TemplateError>;

    /// Validate one value set
    fn validate(
        &self,
        definitions: &[VariableDefinition],
        values: &VariableValueSet,
    ) -> Result<ValidationOutcome, TemplateError>;
}

/// Default validator with a compiled-pattern cache
#[derive(Debug, Default)]
pub struct VariableValidator {
    patterns: DashMap<String, Regex>,
}

impl VariableValidator {
    /// Validator with an empty pattern cache
    pub fn new() -> Self {
        Self::default()
    }

    fn pattern(&self, definition: &VariableDefinition, pattern: &str) -> Result<Regex, TemplateError> {
        if let Some(re) = self.patterns.get(pattern) {
            return Ok(re.clone());
        }
        let re = Regex::new(pattern).map_err(|e| TemplateError::MalformedDefinition {
            variable: definition.name.clone(),
            reason: format!("invalid pattern: {}", e),
        })?;
        self.patterns.insert(pattern.to_string(), re.clone());
        Ok(re)
    }

    /// Type and constraint checks for a present, non-null value
    fn check_value(
        &self,
        definition: &VariableDefinition,
        value: &VariableValue,
    ) -> Result<Option<VariableErrorKind>, TemplateError> {
        let mismatch = |expected: VariableType| VariableErrorKind::TypeMismatch {
            expected,
            actual: value.kind().to_string(),
        };

        match definition.var_type {
            VariableType::Text => {
                if matches!(value, VariableValue::Map(_)) {
                    return Ok(Some(mismatch(VariableType::Text)));
                }
            }
            VariableType::Number => {
                if value.as_number().is_none() {
                    return Ok(Some(mismatch(VariableType::Number)));
                }
            }
            VariableType::Boolean => {
                if value.as_boolean().is_none() {
                    return Ok(Some(mismatch(VariableType::Boolean)));
                }
            }
            VariableType::Enum => {
                if definition.options.is_empty() {
                    return Err(TemplateError::MalformedDefinition {
                        variable: definition.name.clone(),
                        reason: "enum variable has no options".to_string(),
                    });
                }
                if matches!(value, VariableValue::Map(_)) {
                    return Ok(Some(mismatch(VariableType::Enum)));
                }
                let rendered = value.render();
                if !definition.options.iter().any(|o| *o == rendered) {
                    return Ok(Some(VariableErrorKind::NotInEnum {
                        value: rendered,
                        allowed: definition.options.clone(),
                    }));
                }
            }
        }

        let Some(constraint) = &definition.constraint else {
            return Ok(None);
        };

        let failure = match constraint {
            Constraint::Range { min, max } => match value.as_number() {
                None => Some(mismatch(VariableType::Number)),
                Some(n) => {
                    let below = min.map_or(false, |m| n < m);
                    let above = max.map_or(false, |m| n > m);
                    (below || above).then(|| VariableErrorKind::OutOfRange {
                        value: n,
                        min: *min,
                        max: *max,
                    })
                }
            },
            Constraint::Pattern(pattern) => {
                let re = self.pattern(definition, pattern)?;
                let rendered = value.render();
                (!re.is_match(&rendered)).then(|| VariableErrorKind::PatternMismatch {
                    value: rendered,
                    pattern: pattern.clone(),
                })
            }
            Constraint::Length { min, max } => {
                let length = value.render().chars().count();
                let short = min.map_or(false, |m| length < m);
                let long = max.map_or(false, |m| length > m);
                (short || long).then(|| VariableErrorKind::LengthOutOfRange {
                    length,
                    min: *min,
                    max: *max,
                })
            }
        };

        Ok(failure)
    }
}

impl Validator for VariableValidator {
    fn check_definitions(&self, definitions: &[VariableDefinition]) -> Result<(), TemplateError> {
        let mut seen = HashSet::new();

        for definition in definitions {
            let malformed = |reason: String| TemplateError::MalformedDefinition {
                variable: definition.name.clone(),
                reason,
            };

            if !is_valid_name(&definition.name) {
                return Err(malformed("invalid variable name".to_string()));
            }
            if !seen.insert(definition.name.as_str()) {
                return Err(malformed("duplicate definition".to_string()));
            }
            if definition.var_type == VariableType::Enum && definition.options.is_empty() {
                return Err(malformed("enum variable has no options".to_string()));
            }

            match &definition.constraint {
                Some(Constraint::Range { min: Some(lo), max: Some(hi) }) if lo > hi => {
                    return Err(malformed(format!("range minimum {} exceeds maximum {}", lo, hi)));
                }
                Some(Constraint::Length { min: Some(lo), max: Some(hi) }) if lo > hi => {
                    return Err(malformed(format!("length minimum {} exceeds maximum {}", lo, hi)));
                }
                Some(Constraint::Pattern(pattern)) => {
                    self.pattern(definition, pattern)?;
                }
                _ => {}
            }

            if let Some(default) = definition.default_value.as_ref().filter(|d| !d.is_null()) {
                if let Some(kind) = self.check_value(definition, default)? {
                    let error = VariableError {
                        variable: definition.name.clone(),
                        kind,
                    };
                    return Err(malformed(format!("default value is invalid: {}", error)));
                }
            }
        }

        Ok(())
    }

    fn validate(
        &self,
        definitions: &[VariableDefinition],
        values: &VariableValueSet,
    ) -> Result<ValidationOutcome, TemplateError> {
        let mut errors = Vec::new();

        for definition in definitions {
            let kind = match values.get(&definition.name) {
                None if definition.must_be_supplied() => Some(VariableErrorKind::Missing),
                Some(v) if v.is_null() && definition.must_be_supplied() => Some(VariableErrorKind::Null),
                None => None,
                Some(v) if v.is_null() => None,
                Some(v) => self.check_value(definition, v)?,
            };

            if let Some(kind) = kind {
                errors.push(VariableError {
                    variable: definition.name.clone(),
                    kind,
                });
            }
        }

        if errors.is_empty() {
            Ok(ValidationOutcome::Valid)
        } else {
            Ok(ValidationOutcome::Invalid { errors })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn definitions() -> Vec<VariableDefinition> {
        vec![
            VariableDefinition::required("name"),
            VariableDefinition::required("amount")
                .with_type(VariableType::Number)
                .with_constraint(Constraint::Range { min: Some(0.0), max: Some(1000.0) }),
            VariableDefinition::new("urgent").with_type(VariableType::Boolean),
            VariableDefinition::new("tone").with_options(["warm", "formal"]),
            VariableDefinition::required("greeting").with_default("Hello"),
        ]
    }

    #[test]
    fn test_valid_value_set() {
        let values = VariableValueSet::new()
            .with("name", "Sam")
            .with("amount", "42")
            .with("urgent", "TRUE")
            .with("tone", "warm");
        let outcome = VariableValidator::new().validate(&definitions(), &values).unwrap();
        assert!(outcome.is_valid());
    }

    #[test]
    fn test_missing_reports_exactly_absent_required_names() {
        let values = VariableValueSet::new().with("urgent", "false");
        let outcome = VariableValidator::new().validate(&definitions(), &values).unwrap();
        assert_eq!(outcome.missing(), vec!["name", "amount"]);
    }

    #[test]
    fn test_missing_is_distinct_from_type_invalid() {
        let values = VariableValueSet::new().with("name", "Sam").with("amount", "lots");
        let outcome = VariableValidator::new().validate(&definitions(), &values).unwrap();
        assert_eq!(outcome.errors().len(), 1);
        assert_eq!(outcome.errors()[0].kind.code(), "type_mismatch");
        assert!(outcome.missing().is_empty());
    }

    #[test]
    fn test_null_required_value() {
        let values = VariableValueSet::new()
            .with("name", VariableValue::Null)
            .with("amount", 3i64);
        let outcome = VariableValidator::new().validate(&definitions(), &values).unwrap();
        assert_eq!(outcome.errors()[0].kind, VariableErrorKind::Null);
    }

    #[test]
    fn test_enum_range_and_boolean_failures() {
        let values = VariableValueSet::new()
            .with("name", "Sam")
            .with("amount", 5000i64)
            .with("urgent", "maybe")
            .with("tone", "angry");
        let outcome = VariableValidator::new().validate(&definitions(), &values).unwrap();
        let codes: Vec<_> = outcome.errors().iter().map(|e| e.kind.code()).collect();
        assert_eq!(codes, vec!["out_of_range", "type_mismatch", "not_in_enum"]);
    }

    #[test]
    fn test_pattern_and_length_constraints() {
        let defs = vec![
            VariableDefinition::required("code").with_constraint(Constraint::Pattern("^[A-Z]{3}$".into())),
            VariableDefinition::required("note").with_constraint(Constraint::Length { min: Some(2), max: Some(4) }),
        ];
        let validator = VariableValidator::new();

        let ok = VariableValueSet::new().with("code", "ABC").with("note", "abc");
        assert!(validator.validate(&defs, &ok).unwrap().is_valid());

        let bad = VariableValueSet::new().with("code", "abc").with("note", "abcdef");
        let codes: Vec<_> = validator
            .validate(&defs, &bad)
            .unwrap()
            .errors()
            .iter()
            .map(|e| e.kind.code())
            .collect();
        assert_eq!(codes, vec!["pattern_mismatch", "length_out_of_range"]);
    }

    #[test]
    fn test_malformed_definitions_are_errors() {
        let validator = VariableValidator::new();

        let duplicate = vec![VariableDefinition::new("a"), VariableDefinition::new("a")];
        assert!(validator.check_definitions(&duplicate).is_err());

        let empty_enum = vec![VariableDefinition::new("e").with_type(VariableType::Enum)];
        assert!(validator.check_definitions(&empty_enum).is_err());

        let bad_regex = vec![VariableDefinition::new("r").with_constraint(Constraint::Pattern("(".into()))];
        assert!(matches!(
            validator.check_definitions(&bad_regex),
            Err(TemplateError::MalformedDefinition { .. })
        ));

        let bad_default = vec![VariableDefinition::new("n")
            .with_type(VariableType::Number)
            .with_default("ten")];
        assert!(validator.check_definitions(&bad_default).is_err());

        let inverted = vec![VariableDefinition::new("x")
            .with_constraint(Constraint::Range { min: Some(5.0), max: Some(1.0) })];
        assert!(validator.check_definitions(&inverted).is_err());

        assert!(validator.check_definitions(&definitions()).is_ok());
    }

    #[test]
    fn test_validate_fails_hard_on_optionless_enum() {
        let defs = vec![VariableDefinition::new("e").with_type(VariableType::Enum)];
        let values = VariableValueSet::new().with("e", "x");
        assert!(VariableValidator::new().validate(&defs, &values).is_err());
    }
}
