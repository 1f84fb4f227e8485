//! Procedural macros for kvmodel.
//!
//! `kvmodel-macros` is the **compile-time codegen layer**. `#[derive(Model)]`
//! turns a plain struct into a `kvmodel_core::Model`: a static field registry,
//! record conversion, identity and state accessors, and the optimistic
//! version hooks. These macros are used by application crates via the
//! `kvmodel` facade; generated code names `kvmodel_core` directly.

use proc_macro::TokenStream;
use quote::quote;
use syn::ext::IdentExt;

mod parse;
mod validate;

use parse::{FieldDef, ModelDef, parse_model};

/// Derive macro for the `Model` trait.
///
/// # Attributes
///
/// Struct level:
/// - `#[kvmodel(name = "hero")]` - Model name in keys (defaults to snake_case struct name)
/// - `#[kvmodel(ordering = "-score")]` - Default storage ordering on a numeric field
/// - `#[kvmodel(structures("friends", "log"))]` - Per-instance containers deleted with it
///
/// Field level:
/// - `primary_key` - The identity field (exactly one)
/// - `auto` - Identity assigned from the backend counter; field must be `Option<_>`
/// - `index` / `unique` - Keep a lookup structure so the field can be filtered
/// - `blank` - Accept empty strings
/// - `version` - Optimistic version counter
/// - `max_length = N`, `pattern = "regex"` - Validation rules for text
/// - `skip` - Not stored; rebuilt with `Default` on load
/// - `state` - The `InstanceState` field (exactly one)
///
/// # Example
///
/// ```ignore
/// use kvmodel::prelude::*;
///
/// #[derive(Model, Debug, Clone)]
/// #[kvmodel(ordering = "-score")]
/// struct Hero {
///     #[kvmodel(primary_key, auto)]
///     id: Option<i64>,
///     #[kvmodel(max_length = 40)]
///     name: String,
///     #[kvmodel(index)]
///     team: String,
///     score: i64,
///     #[kvmodel(state)]
///     state: InstanceState,
/// }
/// ```
#[proc_macro_derive(Model, attributes(kvmodel))]
pub fn derive_model(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as syn::DeriveInput);

    let model = match parse_model(&input) {
        Ok(m) => m,
        Err(e) => return e.to_compile_error().into(),
    };

    if let Err(e) = validate::validate_model(&model) {
        return e.to_compile_error().into();
    }

    generate_model_impl(&model).into()
}

/// Generate the Model trait implementation from a validated definition.
fn generate_model_impl(model: &ModelDef) -> proc_macro2::TokenStream {
    let name = &model.name;
    let model_name = &model.model_name;
    let ordering = match &model.ordering {
        Some(lit) => quote! { ::core::option::Option::Some(#lit) },
        None => quote! { ::core::option::Option::None },
    };
    let structures = &model.structures;

    let field_infos = generate_field_infos(model);
    let identity = generate_identity(model);
    let to_record = generate_to_record(model);
    let from_record = generate_from_record(model);
    let state = generate_state(model);
    let version = generate_version(model);

    quote! {
        impl ::kvmodel_core::Model for #name {
            const MODEL_NAME: &'static str = #model_name;
            const ORDERING: ::core::option::Option<&'static str> = #ordering;
            const STRUCTURES: &'static [&'static str] = &[#(#structures),*];

            fn fields() -> &'static [::kvmodel_core::FieldInfo] {
                static FIELDS: &[::kvmodel_core::FieldInfo] = &[#(#field_infos),*];
                FIELDS
            }

            #identity
            #to_record
            #from_record
            #state
            #version
        }
    }
}

fn record_name(field: &FieldDef) -> String {
    field.name.unraw().to_string()
}

/// One `FieldInfo` constructor per stored field. Type and nullability come
/// from the field's `FieldValue` impl, so unsupported types fail to compile.
fn generate_field_infos(model: &ModelDef) -> Vec<proc_macro2::TokenStream> {
    model
        .stored_fields()
        .map(|field| {
            let record_name = record_name(field);
            let ty = &field.ty;
            let primary_key = field.primary_key;
            let auto = field.auto;
            let index = field.index;
            let unique = field.unique;
            let blank = field.blank;
            let version = field.version;
            let max_length = match field.max_length {
                Some(n) => quote! { ::core::option::Option::Some(#n) },
                None => quote! { ::core::option::Option::None },
            };
            let pattern = match &field.pattern {
                Some(lit) => quote! { ::core::option::Option::Some(#lit) },
                None => quote! { ::core::option::Option::None },
            };
            quote! {
                ::kvmodel_core::FieldInfo::new(
                    #record_name,
                    <#ty as ::kvmodel_core::FieldValue>::FIELD_TYPE,
                )
                .nullable(<#ty as ::kvmodel_core::FieldValue>::NULLABLE)
                .primary_key(#primary_key)
                .auto(#auto)
                .index(#index)
                .unique(#unique)
                .blank(#blank)
                .version(#version)
                .max_length_opt(#max_length)
                .pattern_opt(#pattern)
            }
        })
        .collect()
}

fn generate_identity(model: &ModelDef) -> proc_macro2::TokenStream {
    // Validation guarantees the field exists.
    let Some(pk) = model.primary_key_field() else {
        return quote! {};
    };
    let field = &pk.name;
    let ty = &pk.ty;
    quote! {
        fn primary_key(&self) -> ::core::option::Option<::std::string::String> {
            let value = ::kvmodel_core::FieldValue::to_value(&self.#field);
            <#ty as ::kvmodel_core::FieldValue>::FIELD_TYPE
                .encode(&value)
                .filter(|id| !id.is_empty())
        }

        fn set_primary_key(&mut self, id: &str) -> ::kvmodel_core::Result<()> {
            let value = <#ty as ::kvmodel_core::FieldValue>::FIELD_TYPE.decode(id)?;
            self.#field = <#ty as ::kvmodel_core::FieldValue>::from_value(value)?;
            ::core::result::Result::Ok(())
        }
    }
}

fn generate_to_record(model: &ModelDef) -> proc_macro2::TokenStream {
    let sets = model.stored_fields().map(|field| {
        let ident = &field.name;
        let record_name = record_name(field);
        quote! {
            record.set(#record_name, ::kvmodel_core::FieldValue::to_value(&self.#ident));
        }
    });
    quote! {
        fn to_record(&self) -> ::kvmodel_core::Record {
            let mut record = ::kvmodel_core::Record::new();
            #(#sets)*
            record
        }
    }
}

fn generate_from_record(model: &ModelDef) -> proc_macro2::TokenStream {
    let inits = model.fields.iter().map(|field| {
        let ident = &field.name;
        if field.state {
            quote! { #ident: ::kvmodel_core::InstanceState::loaded() }
        } else if field.skip {
            quote! { #ident: ::core::default::Default::default() }
        } else {
            let ty = &field.ty;
            let record_name = record_name(field);
            quote! { #ident: record.field::<#ty>(#record_name)? }
        }
    });
    quote! {
        fn from_record(id: &str, record: &::kvmodel_core::Record) -> ::kvmodel_core::Result<Self> {
            let mut instance = Self { #(#inits),* };
            if !id.is_empty() && ::kvmodel_core::Model::primary_key(&instance).is_none() {
                ::kvmodel_core::Model::set_primary_key(&mut instance, id)?;
            }
            ::core::result::Result::Ok(instance)
        }
    }
}

fn generate_state(model: &ModelDef) -> proc_macro2::TokenStream {
    let Some(state) = model.state_field() else {
        return quote! {};
    };
    let field = &state.name;
    quote! {
        fn state(&self) -> &::kvmodel_core::InstanceState {
            &self.#field
        }

        fn state_mut(&mut self) -> &mut ::kvmodel_core::InstanceState {
            &mut self.#field
        }
    }
}

fn generate_version(model: &ModelDef) -> proc_macro2::TokenStream {
    let Some(version) = model.version_field() else {
        return quote! {};
    };
    let field = &version.name;
    let ty = &version.ty;
    quote! {
        fn version(&self) -> ::core::option::Option<i64> {
            match ::kvmodel_core::FieldValue::to_value(&self.#field) {
                ::kvmodel_core::Value::Int(v) => ::core::option::Option::Some(v),
                _ => ::core::option::Option::None,
            }
        }

        fn set_version(&mut self, version: i64) {
            if let ::core::result::Result::Ok(v) =
                <#ty as ::kvmodel_core::FieldValue>::from_value(::kvmodel_core::Value::Int(version))
            {
                self.#field = v;
            }
        }
    }
}
