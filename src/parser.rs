//! Parses the variable/expression references inside an entity's raw
//! options. Pure: no I/O, no engine state, fully described by spec.md
//! §4.3.

use rustc_hash::FxHashSet;

use crate::definition::EntityDefinition;
use crate::entity::{OptionMap, OptionValue};
use crate::ids::VariableId;

/// The substituted text for one field, plus the variable ids the
/// substitution read from.
pub struct ParsedText {
    pub text: String,
    pub variable_ids: FxHashSet<VariableId>,
}

/// Resolves variable/expression references inside a string. The engine
/// never implements this itself — it is a named collaborator (spec.md §6).
pub trait VariableParser {
    fn parse_variables(&self, text: &str) -> ParsedText;
}

/// Parses `raw_options` against `definition`, returning the options the
/// module should receive and the set of variable ids the parse depended
/// on.
///
/// - Unknown definition: options pass through unchanged, variable set is
///   empty (we cannot know which fields need parsing).
/// - Fields not declared in the definition are dropped (sanitization
///   boundary).
/// - Fields declared but not `use_variables`: copied unchanged.
/// - Fields declared and `use_variables`: parsed; variables touched while
///   parsing a field in `ignored_for_subscribe` are excluded from the
///   returned variable set.
pub fn parse_options(
    definition: Option<&EntityDefinition>,
    raw_options: &OptionMap,
    parser: &dyn VariableParser,
) -> (OptionMap, FxHashSet<VariableId>) {
    let Some(definition) = definition else {
        return (raw_options.clone(), FxHashSet::default());
    };

    let mut parsed_options = OptionMap::new();
    let mut variable_ids = FxHashSet::default();

    for field in &definition.fields {
        let Some(raw_value) = raw_options.get(&field.id) else {
            continue;
        };

        if !field.use_variables {
            parsed_options.insert(field.id.clone(), raw_value.clone());
            continue;
        }

        let ParsedText {
            text,
            variable_ids: touched,
        } = parser.parse_variables(&raw_value.as_parse_input());

        if !definition.ignored_for_subscribe.contains(&field.id) {
            variable_ids.extend(touched);
        }

        parsed_options.insert(field.id.clone(), OptionValue::String(text));
    }

    (parsed_options, variable_ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::FieldDefinition;
    use crate::ids::{DefinitionId, FieldId};

    struct EchoParser;

    impl VariableParser for EchoParser {
        fn parse_variables(&self, text: &str) -> ParsedText {
            // Pretend every `$(x)` token is a variable reference named `x`.
            let mut variable_ids = FxHashSet::default();
            let mut out = String::new();
            let mut rest = text;
            while let Some(start) = rest.find("$(") {
                out.push_str(&rest[..start]);
                let after = &rest[start + 2..];
                let end = after.find(')').unwrap_or(after.len());
                let name = &after[..end];
                variable_ids.insert(VariableId::new(name));
                out.push_str(&format!("<{name}>"));
                rest = &after[end.min(after.len())..];
                rest = rest.strip_prefix(')').unwrap_or(rest);
            }
            out.push_str(rest);
            ParsedText {
                text: out,
                variable_ids,
            }
        }
    }

    fn definition() -> EntityDefinition {
        EntityDefinition {
            id: DefinitionId::new("def"),
            fields: vec![
                FieldDefinition {
                    id: FieldId::new("label"),
                    use_variables: true,
                },
                FieldDefinition {
                    id: FieldId::new("id"),
                    use_variables: true,
                },
                FieldDefinition {
                    id: FieldId::new("color"),
                    use_variables: false,
                },
            ],
            ignored_for_subscribe: [FieldId::new("id")].into_iter().collect(),
            has_lifecycle_functions: true,
        }
    }

    #[test]
    fn unknown_definition_passes_options_through_with_empty_variable_set() {
        let mut raw = OptionMap::new();
        raw.insert(FieldId::new("label"), OptionValue::String("$(v1)".into()));
        let (options, vars) = parse_options(None, &raw, &EchoParser);
        assert_eq!(options, raw);
        assert!(vars.is_empty());
    }

    #[test]
    fn fields_not_in_definition_are_dropped() {
        let def = definition();
        let mut raw = OptionMap::new();
        raw.insert(FieldId::new("label"), OptionValue::String("hi".into()));
        raw.insert(FieldId::new("mystery"), OptionValue::String("x".into()));
        let (options, _) = parse_options(Some(&def), &raw, &EchoParser);
        assert!(!options.contains_key(&FieldId::new("mystery")));
    }

    #[test]
    fn non_variable_fields_are_copied_unchanged() {
        let def = definition();
        let mut raw = OptionMap::new();
        raw.insert(FieldId::new("color"), OptionValue::String("red".into()));
        let (options, _) = parse_options(Some(&def), &raw, &EchoParser);
        assert_eq!(
            options.get(&FieldId::new("color")),
            Some(&OptionValue::String("red".into()))
        );
    }

    #[test]
    fn ignored_for_subscribe_fields_contribute_no_variables() {
        let def = definition();
        let mut raw = OptionMap::new();
        raw.insert(FieldId::new("label"), OptionValue::String("$(v1)".into()));
        raw.insert(FieldId::new("id"), OptionValue::String("$(v2)".into()));
        let (_, vars) = parse_options(Some(&def), &raw, &EchoParser);
        assert!(vars.contains(&VariableId::new("v1")));
        assert!(!vars.contains(&VariableId::new("v2")));
    }
}
