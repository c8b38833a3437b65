//! Placeholder extraction
//!
//! Scans template text for `{{ name }}` placeholders. Whitespace inside the
//! delimiters is ignored, so `{{ name }}` and `{{name}}` refer to the same
//! variable. A `}}` outside a placeholder is literal text.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::TemplateError;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

lazy_static! {
    static ref NAME_PATTERN: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").expect("placeholder name pattern is valid");
}

/// A placeholder occurrence in template text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placeholder {
    /// Trimmed variable name
    pub name: String,
    /// Byte offset of the opening `{{`
    pub start: usize,
    /// Byte offset just past the closing `}}`
    pub end: usize,
}

/// Placeholders found in a template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedVariables {
    /// De-duplicated names in first-occurrence order
    pub names: Vec<String>,
    /// Every occurrence, in text order
    pub placeholders: Vec<Placeholder>,
}

impl ExtractedVariables {
    /// Whether `name` occurs at least once
    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

/// Whether `name` is a valid placeholder name
pub fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

/// Extract the placeholders from `text`
///
/// Fails on the first unterminated, empty or malformed placeholder, reporting
/// the byte position of its opening delimiter.
pub fn extract_variables(text: &str) -> Result<ExtractedVariables, TemplateError> {
    let mut extracted = ExtractedVariables::default();
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find(OPEN) {
        let start = cursor + offset;
        let inner_start = start + OPEN.len();

        let close = text[inner_start..]
            .find(CLOSE)
            .ok_or(TemplateError::UnterminatedPlaceholder { position: start })?;
        let inner_end = inner_start + close;
        let end = inner_end + CLOSE.len();

        let name = text[inner_start..inner_end].trim();
        if name.is_empty() {
            return Err(TemplateError::EmptyPlaceholder { position: start });
        }
        if !is_valid_name(name) {
            return Err(TemplateError::InvalidVariableName {
                name: name.to_string(),
                position: start,
            });
        }

        if !extracted.contains(name) {
            extracted.names.push(name.to_string());
        }
        extracted.placeholders.push(Placeholder {
            name: name.to_string(),
            start,
            end,
        });

        cursor = end;
    }

    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_first_occurrence_order_without_duplicates() {
        let extracted = extract_variables("{{b}} and {{a}} then {{ b }} again").unwrap();
        assert_eq!(extracted.names, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(extracted.placeholders.len(), 3);
    }

    #[test]
    fn test_positions_cover_delimiters() {
        let text = "Hi {{ name }}!";
        let extracted = extract_variables(text).unwrap();
        let p = &extracted.placeholders[0];
        assert_eq!(p.start, 3);
        assert_eq!(&text[p.start..p.end], "{{ name }}");
    }

    #[test]
    fn test_unterminated_placeholder_reports_position() {
        let err = extract_variables("ok {{done}} then {{broken").unwrap_err();
        assert_eq!(err, TemplateError::UnterminatedPlaceholder { position: 17 });
    }

    #[test]
    fn test_empty_and_invalid_names() {
        assert_eq!(
            extract_variables("x {{   }}").unwrap_err(),
            TemplateError::EmptyPlaceholder { position: 2 }
        );
        assert!(matches!(
            extract_variables("{{1st}}"),
            Err(TemplateError::InvalidVariableName { .. })
        ));
        assert!(matches!(
            extract_variables("{{a {{b}}"),
            Err(TemplateError::InvalidVariableName { .. })
        ));
    }

    #[test]
    fn test_plain_text_and_stray_closers() {
        let extracted = extract_variables("no placeholders }} here").unwrap();
        assert!(extracted.names.is_empty());
    }

    #[test]
    fn test_dotted_and_dashed_names() {
        let extracted = extract_variables("{{user.name}} {{order-id}}").unwrap();
        assert_eq!(extracted.names, vec!["user.name", "order-id"]);
    }
}
