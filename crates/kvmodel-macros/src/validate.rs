//! Compile-time validation for the Model derive macro.
//!
//! Every check runs and the errors are combined, so one build reports all
//! problems of a model at once.

use proc_macro2::Span;
use syn::{Error, GenericArgument, PathArguments, Type};

use crate::parse::{FieldDef, ModelDef};

/// Validate a parsed model definition.
pub fn validate_model(model: &ModelDef) -> Result<(), Error> {
    let mut errors = Vec::new();

    validate_identifier("model name", &model.model_name, model.model_name_span, &mut errors);
    validate_identity(model, &mut errors);
    validate_state(model, &mut errors);
    validate_single(model, |f| f.version, "version", &mut errors);
    validate_ordering(model, &mut errors);
    for structure in &model.structures {
        validate_identifier("structure name", &structure.value(), structure.span(), &mut errors);
    }

    for field in &model.fields {
        validate_field(field, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        let mut combined = errors.remove(0);
        for err in errors {
            combined.combine(err);
        }
        Err(combined)
    }
}

/// Names end up inside keys, so they must be plain identifiers.
fn validate_identifier(what: &str, name: &str, span: Span, errors: &mut Vec<Error>) {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        errors.push(Error::new(
            span,
            format!("{what} {name:?} must be an identifier (letters, digits, underscores)"),
        ));
    }
}

fn validate_identity(model: &ModelDef, errors: &mut Vec<Error>) {
    let count = model.fields.iter().filter(|f| f.primary_key).count();
    if count == 0 {
        errors.push(Error::new(
            model.name.span(),
            "Model requires exactly one #[kvmodel(primary_key)] field",
        ));
    }
    validate_single(model, |f| f.primary_key, "primary_key", errors);
}

fn validate_state(model: &ModelDef, errors: &mut Vec<Error>) {
    if model.state_field().is_none() {
        errors.push(Error::new(
            model.name.span(),
            "Model requires a #[kvmodel(state)] field of type InstanceState",
        ));
    }
    validate_single(model, |f| f.state, "state", errors);
}

/// Report every field after the first carrying `flag`.
fn validate_single(
    model: &ModelDef,
    flag: impl Fn(&FieldDef) -> bool,
    attr: &str,
    errors: &mut Vec<Error>,
) {
    for field in model.fields.iter().filter(|f| flag(f)).skip(1) {
        errors.push(Error::new(
            field.name.span(),
            format!("only one field may be marked #[kvmodel({attr})]"),
        ));
    }
}

fn validate_ordering(model: &ModelDef, errors: &mut Vec<Error>) {
    let Some(ordering) = &model.ordering else {
        return;
    };
    let spec = ordering.value();
    let field = spec.strip_prefix('-').unwrap_or(&spec);
    if !model.stored_fields().any(|f| f.name == field) {
        errors.push(Error::new(
            ordering.span(),
            format!("ordering field {field:?} is not a stored field of this model"),
        ));
    }
}

fn validate_field(field: &FieldDef, errors: &mut Vec<Error>) {
    let span = field.name.span();
    if field.state && (field.skip || field.has_storage_attrs()) {
        errors.push(Error::new(span, "state field cannot carry other kvmodel attributes"));
    }
    if field.skip && field.has_storage_attrs() {
        errors.push(Error::new(span, "skipped field cannot carry storage attributes"));
    }
    if field.auto && !field.primary_key {
        errors.push(Error::new(
            span,
            "auto requires primary_key; add #[kvmodel(primary_key)] to this field",
        ));
    }
    if field.version && (field.primary_key || is_option(&field.ty)) {
        errors.push(Error::new(span, "version field must be a non-optional integer"));
    }
    if field.primary_key && field.auto && !is_option(&field.ty) {
        errors.push(Error::new(
            span,
            "auto primary key must be an Option so new instances can have no id",
        ));
    }
    if is_nested_option(&field.ty) {
        errors.push(Error::new(span, "nested Option<Option<T>> is not supported"));
    }
}

fn option_inner(ty: &Type) -> Option<&Type> {
    let Type::Path(path) = ty else {
        return None;
    };
    let segment = path.path.segments.last()?;
    if segment.ident != "Option" {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    match args.args.first()? {
        GenericArgument::Type(inner) => Some(inner),
        _ => None,
    }
}

fn is_option(ty: &Type) -> bool {
    option_inner(ty).is_some()
}

fn is_nested_option(ty: &Type) -> bool {
    option_inner(ty).is_some_and(is_option)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_model;
    use syn::{DeriveInput, parse_quote};

    fn check(input: DeriveInput) -> Result<(), String> {
        let model = parse_model(&input).map_err(|e| e.to_string())?;
        validate_model(&model).map_err(|e| {
            e.into_iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n")
        })
    }

    #[test]
    fn accepts_a_complete_model() {
        check(parse_quote! {
            #[kvmodel(ordering = "-score")]
            struct Hero {
                #[kvmodel(primary_key, auto)]
                id: Option<i64>,
                score: i64,
                #[kvmodel(version)]
                version: i64,
                #[kvmodel(state)]
                state: InstanceState,
            }
        })
        .unwrap();
    }

    #[test]
    fn identity_and_state_are_required_once() {
        let err = check(parse_quote! {
            struct Nothing {
                name: String,
            }
        })
        .unwrap_err();
        assert!(err.contains("primary_key"));
        assert!(err.contains("state"));

        let err = check(parse_quote! {
            struct Twice {
                #[kvmodel(primary_key)]
                a: String,
                #[kvmodel(primary_key)]
                b: String,
                #[kvmodel(state)]
                s1: InstanceState,
                #[kvmodel(state)]
                s2: InstanceState,
            }
        })
        .unwrap_err();
        assert!(err.contains("only one field may be marked #[kvmodel(primary_key)]"));
        assert!(err.contains("only one field may be marked #[kvmodel(state)]"));
    }

    #[test]
    fn attribute_conflicts() {
        let err = check(parse_quote! {
            #[kvmodel(name = "bad-name", ordering = "missing")]
            struct Hero {
                #[kvmodel(primary_key, auto)]
                id: i64,
                #[kvmodel(auto)]
                other: Option<i64>,
                #[kvmodel(skip, index)]
                cache: String,
                #[kvmodel(state, index)]
                state: InstanceState,
            }
        })
        .unwrap_err();
        for needle in [
            "must be an identifier",
            "ordering field",
            "must be an Option",
            "auto requires primary_key",
            "skipped field",
            "state field",
        ] {
            assert!(err.contains(needle), "missing {needle:?} in {err}");
        }
    }
}
