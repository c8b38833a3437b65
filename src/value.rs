//! Closed value union shared by variable value sets and metadata bags.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Metadata bag with a closed, statically checkable value type
pub type Metadata = BTreeMap<String, VariableValue>;

/// A variable value or metadata entry
///
/// Maps are ordered so that formatting and hashing stay deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableValue {
    /// Explicit null
    Null,
    /// Boolean value
    Boolean(bool),
    /// Numeric value
    Number(f64),
    /// Text value
    Text(String),
    /// Nested map
    Map(BTreeMap<String, VariableValue>),
}

impl VariableValue {
    /// Whether the value is an explicit null
    pub fn is_null(&self) -> bool {
        matches!(self, VariableValue::Null)
    }

    /// Name of the value's shape, used in diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            VariableValue::Null => "null",
            VariableValue::Boolean(_) => "boolean",
            VariableValue::Number(_) => "number",
            VariableValue::Text(_) => "text",
            VariableValue::Map(_) => "map",
        }
    }

    /// Borrow the text content if this is a text value
    pub fn as_text(&self) -> Option<&str> {
        match self {
            VariableValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Interpret the value as a number, parsing text when needed
    pub fn as_number(&self) -> Option<f64> {
        match self {
            VariableValue::Number(n) if n.is_finite() => Some(*n),
            VariableValue::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }

    /// Interpret the value as a boolean; text must be `true`/`false` in any case
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            VariableValue::Boolean(b) => Some(*b),
            VariableValue::Text(s) => {
                let s = s.trim();
                if s.eq_ignore_ascii_case("true") {
                    Some(true)
                } else if s.eq_ignore_ascii_case("false") {
                    Some(false)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Render the value as substitution text
    pub fn render(&self) -> String {
        self.to_string()
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableValue::Null => Ok(()),
            VariableValue::Boolean(b) => write!(f, "{}", b),
            VariableValue::Number(n) => f.write_str(&format_number(*n)),
            VariableValue::Text(s) => f.write_str(s),
            VariableValue::Map(map) => write_json_map(f, map),
        }
    }
}

/// Compact JSON for nested maps, numbers formatted like scalar substitutions
fn write_json_map(f: &mut fmt::Formatter<'_>, map: &BTreeMap<String, VariableValue>) -> fmt::Result {
    f.write_str("{")?;
    for (i, (key, value)) in map.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write_json_string(f, key)?;
        f.write_str(":")?;
        match value {
            VariableValue::Null => f.write_str("null")?,
            VariableValue::Boolean(b) => write!(f, "{}", b)?,
            VariableValue::Number(n) if n.is_finite() => f.write_str(&format_number(*n))?,
            VariableValue::Number(_) => f.write_str("null")?,
            VariableValue::Text(s) => write_json_string(f, s)?,
            VariableValue::Map(nested) => write_json_map(f, nested)?,
        }
    }
    f.write_str("}")
}

fn write_json_string(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    let quoted = serde_json::to_string(s).map_err(|_| fmt::Error)?;
    f.write_str(&quoted)
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        VariableValue::Text(value.to_string())
    }
}

impl From<String> for VariableValue {
    fn from(value: String) -> Self {
        VariableValue::Text(value)
    }
}

impl From<f64> for VariableValue {
    fn from(value: f64) -> Self {
        VariableValue::Number(value)
    }
}

impl From<i64> for VariableValue {
    fn from(value: i64) -> Self {
        VariableValue::Number(value as f64)
    }
}

impl From<bool> for VariableValue {
    fn from(value: bool) -> Self {
        VariableValue::Boolean(value)
    }
}

impl From<BTreeMap<String, VariableValue>> for VariableValue {
    fn from(value: BTreeMap<String, VariableValue>) -> Self {
        VariableValue::Map(value)
    }
}
