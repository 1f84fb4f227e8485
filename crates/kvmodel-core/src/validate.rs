//! Field-level validation run before an instance is serialized.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use regex::Regex;

use crate::error::ValidationError;
use crate::field::FieldInfo;
use crate::model::Model;
use crate::record::Record;
use crate::types::FieldType;
use crate::value::Value;

/// Compiled patterns, shared process-wide.
struct RegexCache {
    cache: RwLock<HashMap<String, Regex>>,
}

impl RegexCache {
    fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_compile(&self, pattern: &str) -> Result<Regex, regex::Error> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(regex) = cache.get(pattern) {
                return Ok(regex.clone());
            }
        }

        let regex = Regex::new(pattern)?;
        {
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            cache.insert(pattern.to_string(), regex.clone());
        }
        Ok(regex)
    }
}

fn regex_cache() -> &'static RegexCache {
    static CACHE: OnceLock<RegexCache> = OnceLock::new();
    CACHE.get_or_init(RegexCache::new)
}

/// Check if a string matches a regex pattern. Invalid patterns never match.
pub fn matches_pattern(value: &str, pattern: &str) -> bool {
    match regex_cache().get_or_compile(pattern) {
        Ok(regex) => regex.is_match(value),
        Err(e) => {
            tracing::warn!(
                pattern = pattern,
                error = %e,
                "Invalid regex pattern in validation, treating as non-match"
            );
            false
        }
    }
}

/// Compile-check a pattern, returning a message when it is invalid.
pub fn validate_pattern(pattern: &str) -> Option<String> {
    match regex_cache().get_or_compile(pattern) {
        Ok(_) => None,
        Err(e) => Some(format!("invalid regex pattern: {e}")),
    }
}

const IDENTIFIER: &str = "^[A-Za-z_][A-Za-z0-9_]*$";

/// Names that end up inside keys must not contain separators or globs.
pub fn is_identifier(name: &str) -> bool {
    matches_pattern(name, IDENTIFIER)
}

/// Check one field value against its descriptor.
pub fn validate_field(info: &FieldInfo, value: &Value, errors: &mut ValidationError) {
    if info.primary_key && info.auto {
        return;
    }
    match value {
        Value::Null => {
            if !info.nullable && !info.primary_key {
                errors.add_required(info.name);
            }
        }
        Value::Text(text) if info.field_type == FieldType::Text => {
            if text.is_empty() && !info.blank {
                errors.add_required(info.name);
                return;
            }
            if let Some(max) = info.max_length {
                let len = text.chars().count();
                if len > max {
                    errors.add_max_length(info.name, max, len);
                }
            }
            if let Some(pattern) = info.pattern {
                if !matches_pattern(text, pattern) {
                    errors.add_pattern(info.name, pattern);
                }
            }
        }
        _ => {}
    }
}

/// Validate every field of a record, then the model-level hook.
pub fn validate_instance<M: Model>(instance: &M, record: &Record) -> Result<(), ValidationError> {
    let mut errors = ValidationError::new();
    for info in M::fields() {
        let value = record.get(info.name).unwrap_or(&Value::Null);
        validate_field(info, value, &mut errors);
    }
    if let Err(model_errors) = instance.validate() {
        errors.extend(model_errors);
    }
    errors.into_result()
}
