//! Parsing logic for the Model derive macro.
//!
//! This module extracts struct-level and field-level `#[kvmodel(...)]`
//! attributes from the derive input into `ModelDef` and `FieldDef`, which
//! the validation and code generation passes consume.

use proc_macro2::Span;
use syn::{Attribute, Data, DeriveInput, Error, Field, Fields, Ident, Lit, LitStr, Result, Type};

/// Parsed model definition from a struct with `#[derive(Model)]`.
#[derive(Debug)]
pub struct ModelDef {
    /// The struct name (e.g., `Hero`).
    pub name: Ident,
    /// Model name used in every key (e.g., `"hero"`).
    pub model_name: String,
    /// Span of the `name = "..."` literal, or of the struct name.
    pub model_name_span: Span,
    /// Default storage ordering, `"field"` or `"-field"`.
    pub ordering: Option<LitStr>,
    /// Per-instance structured containers.
    pub structures: Vec<LitStr>,
    pub fields: Vec<FieldDef>,
}

impl ModelDef {
    /// Fields stored in the record, in declaration order.
    pub fn stored_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.is_stored())
    }

    pub fn primary_key_field(&self) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.primary_key)
    }

    pub fn state_field(&self) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.state)
    }

    pub fn version_field(&self) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.version)
    }
}

/// Parsed field definition.
#[derive(Debug)]
pub struct FieldDef {
    pub name: Ident,
    pub ty: Type,
    pub primary_key: bool,
    pub auto: bool,
    pub index: bool,
    pub unique: bool,
    pub blank: bool,
    pub version: bool,
    /// Not stored; rebuilt from `Default` on load.
    pub skip: bool,
    /// Holds the instance's `InstanceState`.
    pub state: bool,
    pub max_length: Option<usize>,
    pub pattern: Option<LitStr>,
}

impl FieldDef {
    pub fn is_stored(&self) -> bool {
        !self.skip && !self.state
    }

    /// Whether any storage attribute is set, for conflict checks.
    pub fn has_storage_attrs(&self) -> bool {
        self.primary_key
            || self.auto
            || self.index
            || self.unique
            || self.blank
            || self.version
            || self.max_length.is_some()
            || self.pattern.is_some()
    }
}

/// Parse the derive input into a `ModelDef`.
///
/// Returns an error if:
/// - The input is not a struct
/// - The struct is generic or uses tuple or unit syntax
/// - Unknown attributes are present
/// - Attribute values are invalid
pub fn parse_model(input: &DeriveInput) -> Result<ModelDef> {
    let name = input.ident.clone();

    if !input.generics.params.is_empty() {
        return Err(Error::new_spanned(
            &input.generics,
            "Model cannot be derived for generic structs",
        ));
    }

    let StructAttrs {
        model_name,
        ordering,
        structures,
    } = parse_struct_attrs(&input.attrs)?;

    let fields = match &input.data {
        Data::Struct(data) => parse_fields(&data.fields)?,
        Data::Enum(_) => {
            return Err(Error::new_spanned(
                input,
                "Model can only be derived for structs, not enums",
            ));
        }
        Data::Union(_) => {
            return Err(Error::new_spanned(
                input,
                "Model can only be derived for structs, not unions",
            ));
        }
    };

    let (model_name, model_name_span) = match model_name {
        Some(lit) => (lit.value(), lit.span()),
        None => (to_snake_case(&name.to_string()), name.span()),
    };

    Ok(ModelDef {
        name,
        model_name,
        model_name_span,
        ordering,
        structures,
        fields,
    })
}

#[derive(Default)]
struct StructAttrs {
    model_name: Option<LitStr>,
    ordering: Option<LitStr>,
    structures: Vec<LitStr>,
}

/// Parse struct-level `#[kvmodel(...)]` attributes.
///
/// Supported keys:
/// - `name = "..."` (overrides the snake_case struct name)
/// - `ordering = "field"` or `ordering = "-field"`
/// - `structures("a", "b")`
fn parse_struct_attrs(attrs: &[Attribute]) -> Result<StructAttrs> {
    let mut result = StructAttrs::default();

    for attr in attrs {
        if !attr.path().is_ident("kvmodel") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                result.model_name = Some(meta.value()?.parse()?);
            } else if meta.path.is_ident("ordering") {
                result.ordering = Some(meta.value()?.parse()?);
            } else if meta.path.is_ident("structures") {
                let content;
                syn::parenthesized!(content in meta.input);
                let names = content.parse_terminated(
                    <LitStr as syn::parse::Parse>::parse,
                    syn::Token![,],
                )?;
                result.structures.extend(names);
            } else {
                return Err(meta.error(
                    "unknown kvmodel struct attribute (expected name, ordering or structures)",
                ));
            }
            Ok(())
        })?;
    }

    Ok(result)
}

/// Parse all fields from a struct.
fn parse_fields(fields: &Fields) -> Result<Vec<FieldDef>> {
    match fields {
        Fields::Named(named) => named.named.iter().map(parse_field).collect(),
        Fields::Unnamed(_) => Err(Error::new(
            Span::call_site(),
            "Model requires a struct with named fields, not a tuple struct",
        )),
        Fields::Unit => Err(Error::new(
            Span::call_site(),
            "Model requires a struct with fields, not a unit struct",
        )),
    }
}

fn parse_field(field: &Field) -> Result<FieldDef> {
    let name = field
        .ident
        .clone()
        .ok_or_else(|| Error::new_spanned(field, "expected named field"))?;

    let mut def = FieldDef {
        name,
        ty: field.ty.clone(),
        primary_key: false,
        auto: false,
        index: false,
        unique: false,
        blank: false,
        version: false,
        skip: false,
        state: false,
        max_length: None,
        pattern: None,
    };

    for attr in &field.attrs {
        if !attr.path().is_ident("kvmodel") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            let path = &meta.path;

            if path.is_ident("primary_key") {
                def.primary_key = true;
            } else if path.is_ident("auto") {
                def.auto = true;
            } else if path.is_ident("index") {
                def.index = true;
            } else if path.is_ident("unique") {
                def.unique = true;
            } else if path.is_ident("blank") {
                def.blank = true;
            } else if path.is_ident("version") {
                def.version = true;
            } else if path.is_ident("skip") {
                def.skip = true;
            } else if path.is_ident("state") {
                def.state = true;
            } else if path.is_ident("max_length") {
                let value: Lit = meta.value()?.parse()?;
                match &value {
                    Lit::Int(lit) => def.max_length = Some(lit.base10_parse()?),
                    _ => {
                        return Err(Error::new_spanned(
                            value,
                            "expected integer literal for max_length",
                        ));
                    }
                }
            } else if path.is_ident("pattern") {
                let value: Lit = meta.value()?.parse()?;
                match value {
                    Lit::Str(lit) => def.pattern = Some(lit),
                    other => {
                        return Err(Error::new_spanned(
                            other,
                            "expected string literal for pattern",
                        ));
                    }
                }
            } else {
                return Err(meta.error(format!(
                    "unknown kvmodel field attribute `{}`",
                    path.get_ident().map(ToString::to_string).unwrap_or_default()
                )));
            }
            Ok(())
        })?;
    }

    Ok(def)
}

/// `HeroTeam` → `hero_team`.
pub fn to_snake_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    let mut prev_lower = false;
    for c in s.chars() {
        if c.is_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.extend(c.to_lowercase());
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    #[test]
    fn parses_struct_and_field_attributes() {
        let input: DeriveInput = parse_quote! {
            #[kvmodel(ordering = "-score", structures("friends", "log"))]
            struct HeroTeam {
                #[kvmodel(primary_key, auto)]
                id: Option<i64>,
                #[kvmodel(max_length = 20, pattern = "^[A-Z]")]
                name: String,
                #[kvmodel(unique)]
                handle: Option<String>,
                score: i64,
                #[kvmodel(skip)]
                cache: Vec<String>,
                #[kvmodel(state)]
                state: InstanceState,
            }
        };
        let model = parse_model(&input).unwrap();
        assert_eq!(model.model_name, "hero_team");
        assert_eq!(model.ordering.as_ref().map(LitStr::value).as_deref(), Some("-score"));
        assert_eq!(
            model.structures.iter().map(LitStr::value).collect::<Vec<_>>(),
            vec!["friends", "log"]
        );
        assert_eq!(model.stored_fields().count(), 4);
        let pk = model.primary_key_field().unwrap();
        assert!(pk.auto);
        let name = &model.fields[1];
        assert_eq!(name.max_length, Some(20));
        assert_eq!(name.pattern.as_ref().map(LitStr::value).as_deref(), Some("^[A-Z]"));
        assert_eq!(model.state_field().unwrap().name, "state");
    }

    #[test]
    fn explicit_name_wins() {
        let input: DeriveInput = parse_quote! {
            #[kvmodel(name = "person")]
            struct User {
                #[kvmodel(primary_key)]
                email: String,
                #[kvmodel(state)]
                state: InstanceState,
            }
        };
        assert_eq!(parse_model(&input).unwrap().model_name, "person");
    }

    #[test]
    fn rejects_non_structs_generics_and_unknown_attributes() {
        let input: DeriveInput = parse_quote! {
            enum Color { Red }
        };
        assert!(parse_model(&input).unwrap_err().to_string().contains("enums"));

        let input: DeriveInput = parse_quote! {
            struct Pair(i64, String);
        };
        assert!(parse_model(&input).unwrap_err().to_string().contains("tuple"));

        let input: DeriveInput = parse_quote! {
            struct Boxed<T> { value: T }
        };
        assert!(parse_model(&input).unwrap_err().to_string().contains("generic"));

        let input: DeriveInput = parse_quote! {
            struct Odd {
                #[kvmodel(sortable)]
                id: i64,
            }
        };
        assert!(parse_model(&input).unwrap_err().to_string().contains("sortable"));
    }

    #[test]
    fn snake_case() {
        assert_eq!(to_snake_case("Hero"), "hero");
        assert_eq!(to_snake_case("HeroTeam"), "hero_team");
        assert_eq!(to_snake_case("Item2Part"), "item2_part");
    }
}
