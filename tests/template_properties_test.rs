//! Extraction, validation and resolution properties

use std::collections::BTreeSet;

use pretty_assertions::assert_eq;
use promptrun::template::{
    extract_variables, Resolver, TemplateDefinition, TemplateResolver, Validator,
    VariableDefinition, VariableValidator, VariableValueSet,
};
use proptest::prelude::*;

fn literal() -> impl Strategy<Value = String> {
    "[a-zA-Z ,.!?]{0,20}"
}

fn name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,6}"
}

/// Template body built from alternating literal text and placeholders
fn body() -> impl Strategy<Value = (String, Vec<String>)> {
    prop::collection::vec((literal(), name()), 0..6).prop_flat_map(|parts| {
        literal().prop_map(move |tail| {
            let mut text = String::new();
            let mut names = Vec::new();
            for (lit, n) in &parts {
                text.push_str(lit);
                text.push_str(&format!("{{{{{}}}}}", n));
                names.push(n.clone());
            }
            text.push_str(&tail);
            (text, names)
        })
    })
}

proptest! {
    #[test]
    fn extraction_is_deduplicated_in_first_occurrence_order((text, names) in body()) {
        let extracted = extract_variables(&text).unwrap();

        let mut expected = Vec::new();
        for n in &names {
            if !expected.contains(n) {
                expected.push(n.clone());
            }
        }
        prop_assert_eq!(&extracted.names, &expected);
        prop_assert_eq!(extracted.placeholders.len(), names.len());
    }

    #[test]
    fn text_without_placeholders_resolves_to_itself(text in literal()) {
        let template = TemplateDefinition::new("plain", text.clone());
        let resolved = TemplateResolver::new().resolve(&template, &VariableValueSet::new()).unwrap();
        prop_assert_eq!(resolved.text, text);
    }

    #[test]
    fn resolution_is_deterministic((text, names) in body(), value in "[a-zA-Z0-9 ]{0,12}") {
        let mut template = TemplateDefinition::new("t", text);
        let mut values = VariableValueSet::new();
        for n in names.iter().collect::<BTreeSet<_>>() {
            template = template.with_variable(VariableDefinition::required(n.as_str()));
            values.insert(n.as_str(), value.as_str());
        }

        let resolver = TemplateResolver::new();
        let first = resolver.resolve(&template, &values).unwrap();
        let second = resolver.resolve(&template, &values).unwrap();
        prop_assert_eq!(&first.text, &second.text);
        prop_assert_eq!(&first.content_hash, &second.content_hash);
        prop_assert!(!first.text.contains("{{"));
    }

    #[test]
    fn missing_reports_exactly_the_absent_required_names(
        present in prop::collection::btree_set(0usize..5, 0..5)
    ) {
        let definitions: Vec<_> = (0..5)
            .map(|i| VariableDefinition::required(format!("v{}", i)))
            .collect();
        let values: VariableValueSet = present
            .iter()
            .map(|i| (format!("v{}", i), "x"))
            .collect();

        let outcome = VariableValidator::new().validate(&definitions, &values).unwrap();
        let expected: Vec<String> = (0..5)
            .filter(|i| !present.contains(i))
            .map(|i| format!("v{}", i))
            .collect();
        let missing: Vec<String> = outcome.missing().into_iter().map(String::from).collect();
        prop_assert_eq!(missing, expected);
        prop_assert_eq!(outcome.is_valid(), present.len() == 5);
    }
}

#[test]
fn substituted_values_are_not_expanded_again() {
    let template = TemplateDefinition::new("t", "say {{a}}")
        .with_variable(VariableDefinition::required("a"))
        .with_variable(VariableDefinition::new("b"));
    let values = VariableValueSet::new().with("a", "{{b}}").with("b", "oops");

    let resolved = TemplateResolver::new().resolve(&template, &values).unwrap();
    assert_eq!(resolved.text, "say {{b}}");
}

#[test]
fn whitespace_inside_delimiters_is_ignored() {
    let extracted = extract_variables("{{ name }} and {{name}}").unwrap();
    assert_eq!(extracted.names, vec!["name".to_string()]);
    assert_eq!(extracted.placeholders.len(), 2);
}
