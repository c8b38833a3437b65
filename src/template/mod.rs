//! Prompt templates, variable definitions and value sets
//!
//! Templates carry `{{name}}` placeholders. This module provides the types that
//! describe a template and its variables, plus the three stages that turn a
//! template and a value set into final prompt text:
//!
//! - [`extractor`]: finds placeholders in template text
//! - [`validator`]: checks a value set against variable definitions
//! - [`resolver`]: substitutes validated values into the template

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::VariableValue;

pub mod extractor;
pub mod resolver;
pub mod validator;

pub use extractor::{extract_variables, ExtractedVariables, Placeholder};
pub use resolver::{content_hash, Resolver, TemplateResolver};
pub use validator::{
    ValidationOutcome, Validator, VariableError, VariableErrorKind, VariableValidator,
};

/// Errors raised by template parsing, definition checking and resolution
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    /// `{{` without a matching `}}`
    #[error("Unterminated placeholder starting at byte {position}")]
    UnterminatedPlaceholder {
        /// Byte offset of the opening `{{`
        position: usize,
    },

    /// `{{}}` with nothing inside
    #[error("Empty placeholder at byte {position}")]
    EmptyPlaceholder {
        /// Byte offset of the opening `{{`
        position: usize,
    },

    /// Name is not an identifier
    #[error("Invalid variable name '{name}' at byte {position}")]
    InvalidVariableName {
        /// Name as written
        name: String,
        /// Byte offset of the opening `{{`
        position: usize,
    },

    /// Placeholders with no matching definition
    #[error("Template references undefined variables: {}", .names.join(", "))]
    UndefinedVariables {
        /// Undefined names, in first-occurrence order
        names: Vec<String>,
    },

    /// A placeholder had no value and no default
    #[error("No value for variable '{name}'")]
    UnresolvedVariable {
        /// Variable without a value
        name: String,
    },

    /// A definition contradicts itself
    #[error("Malformed definition for '{variable}': {reason}")]
    MalformedDefinition {
        /// Offending definition
        variable: String,
        /// What is inconsistent
        reason: String,
    },

    /// A constraint regex does not compile
    #[error("Invalid constraint expression '{expression}': {reason}")]
    InvalidConstraint {
        /// Expression as written
        expression: String,
        /// Compiler or parser message
        reason: String,
    },
}

/// Declared type of a template variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    /// Any string
    Text,
    /// Parsed as a finite float
    Number,
    /// `true` or `false`, case-insensitive
    Boolean,
    /// One of the declared options
    Enum,
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VariableType::Text => "text",
            VariableType::Number => "number",
            VariableType::Boolean => "boolean",
            VariableType::Enum => "enum",
        };
        f.write_str(name)
    }
}

impl Default for VariableType {
    fn default() -> Self {
        VariableType::Text
    }
}

/// Constraint evaluated against a variable value after type checking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    /// Numeric range, inclusive on both ends
    Range {
        /// Lower bound
        min: Option<f64>,
        /// Upper bound
        max: Option<f64>,
    },
    /// Regular expression the rendered value must match
    Pattern(String),
    /// Character length bounds, inclusive
    Length {
        /// Shortest allowed length
        min: Option<usize>,
        /// Longest allowed length
        max: Option<usize>,
    },
}

fn split_bounds(body: &str) -> Option<(&str, &str)> {
    body.split_once("..")
        .map(|(lo, hi)| (lo.trim(), hi.trim()))
}

impl FromStr for Constraint {
    type Err = TemplateError;

    /// Parses `range:MIN..MAX`, `len:MIN..MAX` and `regex:PATTERN`.
    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| TemplateError::InvalidConstraint {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let (kind, body) = expression
            .split_once(':')
            .ok_or_else(|| invalid("expected '<kind>:<body>'"))?;

        match kind.trim() {
            "regex" => Ok(Constraint::Pattern(body.to_string())),
            "range" => {
                let (lo, hi) = split_bounds(body).ok_or_else(|| invalid("expected MIN..MAX"))?;
                let parse = |s: &str| -> Result<Option<f64>, TemplateError> {
                    if s.is_empty() {
                        Ok(None)
                    } else {
                        s.parse::<f64>().map(Some).map_err(|_| invalid("bound is not a number"))
                    }
                };
                Ok(Constraint::Range { min: parse(lo)?, max: parse(hi)? })
            }
            "len" => {
                let (lo, hi) = split_bounds(body).ok_or_else(|| invalid("expected MIN..MAX"))?;
                let parse = |s: &str| -> Result<Option<usize>, TemplateError> {
                    if s.is_empty() {
                        Ok(None)
                    } else {
                        s.parse::<usize>().map(Some).map_err(|_| invalid("bound is not a length"))
                    }
                };
                Ok(Constraint::Length { min: parse(lo)?, max: parse(hi)? })
            }
            other => Err(invalid(&format!("unknown constraint kind '{}'", other))),
        }
    }
}

/// Definition of a single template variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    /// Variable name as referenced by `{{name}}`
    pub name: String,

    /// Declared type
    #[serde(default)]
    pub var_type: VariableType,

    /// Whether a value must be supplied (unless a default exists)
    #[serde(default)]
    pub required: bool,

    /// Value used when the variable is absent from a value set
    #[serde(default)]
    pub default_value: Option<VariableValue>,

    /// Allowed values for `enum` variables
    #[serde(default)]
    pub options: Vec<String>,

    /// Optional constraint on the value
    #[serde(default)]
    pub constraint: Option<Constraint>,

    /// Human readable description
    #[serde(default)]
    pub description: Option<String>,
}

impl VariableDefinition {
    /// Create an optional text variable
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            var_type: VariableType::Text,
            required: false,
            default_value: None,
            options: Vec::new(),
            constraint: None,
            description: None,
        }
    }

    /// Create a required text variable
    pub fn required(name: impl Into<String>) -> Self {
        Self::new(name).with_required(true)
    }

    /// Set the declared type
    pub fn with_type(mut self, var_type: VariableType) -> Self {
        self.var_type = var_type;
        self
    }

    /// Set whether a value must be present
    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Used when the value set has no entry for this variable
    pub fn with_default(mut self, value: impl Into<VariableValue>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    /// Make this an enum variable with the given members
    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.var_type = VariableType::Enum;
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Attach a range, length or pattern constraint
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraint = Some(constraint);
        self
    }

    /// Set a free-form description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// A value must come from the value set: required and no default
    pub fn must_be_supplied(&self) -> bool {
        self.required && self.default_value.is_none()
    }
}

/// An immutable prompt template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDefinition {
    /// Stable identifier, also used by template stores
    pub id: String,
    /// Text with `{{name}}` placeholders
    pub body: String,
    /// Declared variables
    #[serde(default)]
    pub variables: Vec<VariableDefinition>,
}

/// Result of cross-checking placeholders against definitions
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateAnalysis {
    /// Placeholders found in the body
    pub extracted: ExtractedVariables,
    /// Referenced in the body but not defined
    pub undefined: Vec<String>,
    /// Defined but never referenced
    pub unused: Vec<String>,
}

impl TemplateAnalysis {
    /// Whether every placeholder has a definition
    pub fn is_consistent(&self) -> bool {
        self.undefined.is_empty()
    }
}

impl TemplateDefinition {
    /// Template with no declared variables
    pub fn new(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            variables: Vec::new(),
        }
    }

    /// Declare a variable
    pub fn with_variable(mut self, definition: VariableDefinition) -> Self {
        self.variables.push(definition);
        self
    }

    /// Look up a definition by name
    pub fn variable(&self, name: &str) -> Option<&VariableDefinition> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Extract placeholders and compare them to the defined variables
    pub fn analyze(&self) -> Result<TemplateAnalysis, TemplateError> {
        let extracted = extract_variables(&self.body)?;

        let undefined = extracted
            .names
            .iter()
            .filter(|name| self.variable(name).is_none())
            .cloned()
            .collect();

        let unused = self
            .variables
            .iter()
            .filter(|v| !extracted.names.contains(&v.name))
            .map(|v| v.name.clone())
            .collect();

        Ok(TemplateAnalysis {
            extracted,
            undefined,
            unused,
        })
    }
}

/// One complete assignment of values to a template's variables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableValueSet {
    values: BTreeMap<String, VariableValue>,
}

impl VariableValueSet {
    /// Empty value set
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<VariableValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or replace a value
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<VariableValue>) {
        self.values.insert(name.into(), value.into());
    }

    /// Value for `name`
    pub fn get(&self, name: &str) -> Option<&VariableValue> {
        self.values.get(name)
    }

    /// Whether `name` has an entry, null included
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Entries ordered by name
    pub fn iter(&self) -> impl Iterator<Item = (&String, &VariableValue)> {
        self.values.iter()
    }
}

impl<K, V> FromIterator<(K, V)> for VariableValueSet
where
    K: Into<String>,
    V: Into<VariableValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// A template resolved against one value set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPrompt {
    /// Template that was resolved
    pub template_id: String,
    /// Values the text was resolved from, defaults included
    pub values: VariableValueSet,
    /// Final prompt text
    pub text: String,
    /// Hex SHA-256 of the template id and resolved text
    pub content_hash: String,
}
