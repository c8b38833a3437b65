//! Placeholder substitution
//!
//! Resolution is deterministic: the same template and value set always give
//! byte-identical text, so the content hash doubles as a dedup key.

use sha2::{Digest, Sha256};

use super::{
    extract_variables, ResolvedPrompt, TemplateDefinition, TemplateError, VariableType,
    VariableValueSet,
};
use crate::value::VariableValue;

/// Resolution capability used by the batch coordinator
pub trait Resolver: Send + Sync {
    /// Substitute a validated value set into the template
    fn resolve(
        &self,
        template: &TemplateDefinition,
        values: &VariableValueSet,
    ) -> Result<ResolvedPrompt, TemplateError>;
}

/// Default `{{name}}` resolver
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateResolver;

impl TemplateResolver {
    /// Resolver with no state
    pub fn new() -> Self {
        Self
    }

    fn render_value(template: &TemplateDefinition, name: &str, value: &VariableValue) -> String {
        match template.variable(name).map(|d| d.var_type) {
            Some(VariableType::Boolean) => match value.as_boolean() {
                Some(b) => b.to_string(),
                None => value.render(),
            },
            _ => value.render(),
        }
    }

    fn value_for<'a>(
        template: &'a TemplateDefinition,
        values: &'a VariableValueSet,
        name: &str,
    ) -> Result<Option<&'a VariableValue>, TemplateError> {
        if let Some(value) = values.get(name).filter(|v| !v.is_null()) {
            return Ok(Some(value));
        }
        match template.variable(name) {
            Some(definition) => Ok(definition.default_value.as_ref().filter(|v| !v.is_null())),
            None => Err(TemplateError::UnresolvedVariable {
                name: name.to_string(),
            }),
        }
    }
}

impl Resolver for TemplateResolver {
    fn resolve(
        &self,
        template: &TemplateDefinition,
        values: &VariableValueSet,
    ) -> Result<ResolvedPrompt, TemplateError> {
        let extracted = extract_variables(&template.body)?;
        let mut text = String::with_capacity(template.body.len());
        let mut cursor = 0;

        for placeholder in &extracted.placeholders {
            text.push_str(&template.body[cursor..placeholder.start]);
            if let Some(value) = Self::value_for(template, values, &placeholder.name)? {
                text.push_str(&Self::render_value(template, &placeholder.name, value));
            }
            cursor = placeholder.end;
        }
        text.push_str(&template.body[cursor..]);

        Ok(ResolvedPrompt {
            template_id: template.id.clone(),
            values: values.clone(),
            content_hash: content_hash(&template.id, &text),
            text,
        })
    }
}

/// Lowercase hex SHA-256 over the template id and resolved text
pub fn content_hash(template_id: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(template_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::VariableDefinition;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn greeting() -> TemplateDefinition {
        TemplateDefinition::new("greeting", "Hi {{name}}, you owe {{amount}}")
            .with_variable(VariableDefinition::required("name"))
            .with_variable(VariableDefinition::required("amount").with_type(VariableType::Number))
    }

    #[test]
    fn test_exact_substitution() {
        let values = VariableValueSet::new().with("name", "Sam").with("amount", "42");
        let resolved = TemplateResolver.resolve(&greeting(), &values).unwrap();
        assert_eq!(resolved.text, "Hi Sam, you owe 42");
        assert_eq!(resolved.template_id, "greeting");
    }

    #[test]
    fn test_defaults_fill_absent_variables() {
        let template = TemplateDefinition::new("t", "{{ salutation }} {{name}}{{suffix}}")
            .with_variable(VariableDefinition::new("salutation").with_default("Dear"))
            .with_variable(VariableDefinition::required("name"))
            .with_variable(VariableDefinition::new("suffix"));
        let values = VariableValueSet::new().with("name", "Ada");
        let resolved = TemplateResolver.resolve(&template, &values).unwrap();
        assert_eq!(resolved.text, "Dear Ada");
    }

    #[test]
    fn test_typed_formatting() {
        let template = TemplateDefinition::new("t", "{{n}} {{flag}}")
            .with_variable(VariableDefinition::new("n").with_type(VariableType::Number))
            .with_variable(VariableDefinition::new("flag").with_type(VariableType::Boolean));
        let values = VariableValueSet::new().with("n", 7i64).with("flag", "TRUE");
        let resolved = TemplateResolver.resolve(&template, &values).unwrap();
        assert_eq!(resolved.text, "7 true");
    }

    #[test]
    fn test_unknown_placeholder_without_value_fails() {
        let template = TemplateDefinition::new("t", "{{ghost}}");
        let err = TemplateResolver
            .resolve(&template, &VariableValueSet::new())
            .unwrap_err();
        assert_eq!(err, TemplateError::UnresolvedVariable { name: "ghost".into() });
    }

    #[test]
    fn test_hash_depends_on_template_id() {
        assert_ne!(content_hash("a", "text"), content_hash("b", "text"));
        assert_eq!(content_hash("a", "text").len(), 64);
    }

    proptest! {
        #[test]
        fn prop_resolution_is_idempotent_and_complete(
            a in "[a-zA-Z0-9 ,.!?]{0,24}",
            b in "[a-zA-Z0-9 ,.!?]{0,24}",
        ) {
            let template = TemplateDefinition::new("p", "<{{a}}|{{ b }}|{{a}}>")
                .with_variable(VariableDefinition::required("a"))
                .with_variable(VariableDefinition::required("b"));
            let values = VariableValueSet::new().with("a", a.as_str()).with("b", b.as_str());

            let first = TemplateResolver.resolve(&template, &values).unwrap();
            let second = TemplateResolver.resolve(&template, &values).unwrap();

            prop_assert_eq!(&first.text, &format!("<{}|{}|{}>", a, b, a));
            prop_assert_eq!(&first.text, &second.text);
            prop_assert_eq!(&first.content_hash, &second.content_hash);
            prop_assert!(!first.text.contains("{{"));
        }
    }
}
