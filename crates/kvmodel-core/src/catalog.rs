//! Model catalog: registered model metadata and key layout.
//!
//! A catalog is constructed explicitly and shared by reference (usually an
//! `Arc`) between sessions and queries. Registration resolves a model's
//! field registry once; lookups afterwards are map reads.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::config::BackendConfig;
use crate::error::{Error, Result, SchemaError, SchemaErrorKind};
use crate::field::FieldInfo;
use crate::model::Model;
use crate::record::Record;
use crate::types::FieldType;
use crate::validate::{is_identifier, validate_pattern};
use crate::value::Value;

/// Requested or default ordering on a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ordering {
    pub field: String,
    pub descending: bool,
}

impl Ordering {
    /// Parse `"field"` (ascending) or `"-field"` (descending).
    pub fn parse(spec: &str) -> Self {
        match spec.strip_prefix('-') {
            Some(field) => Self {
                field: field.to_string(),
                descending: true,
            },
            None => Self {
                field: spec.to_string(),
                descending: false,
            },
        }
    }
}

impl fmt::Display for Ordering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.descending {
            write!(f, "-{}", self.field)
        } else {
            f.write_str(&self.field)
        }
    }
}

/// Names of every backend key a model uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelKeys {
    base: String,
}

impl ModelKeys {
    pub fn new(namespace: &str, model: &str) -> Self {
        Self {
            base: format!("{namespace}{model}"),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Collection of all ids.
    pub fn ids(&self) -> String {
        format!("{}:ids", self.base)
    }

    /// Auto-id counter.
    pub fn counter(&self) -> String {
        format!("{}:id", self.base)
    }

    /// Record hash of one instance.
    pub fn object(&self, id: &str) -> String {
        format!("{}:obj:{id}", self.base)
    }

    /// Index collection for one encoded field value.
    pub fn index(&self, field: &str, value: &str) -> String {
        format!("{}:idx:{field}:{value}", self.base)
    }

    /// Hash mapping unique values of a field to ids.
    pub fn unique(&self, field: &str) -> String {
        format!("{}:uni:{field}", self.base)
    }

    /// Fresh temporary key name.
    pub fn temp(&self) -> String {
        format!("{}:tmp:{}", self.base, uuid::Uuid::new_v4().simple())
    }

    pub fn temp_prefix(&self) -> String {
        format!("{}:tmp:", self.base)
    }

    /// Structured container owned by one instance.
    pub fn structure(&self, id: &str, name: &str) -> String {
        format!("{}:obj:{id}:{name}", self.base)
    }

    /// `SORT ... BY` pattern dereferencing each id into a record field.
    pub fn sort_pattern(&self, field: &str) -> String {
        format!("{}:obj:*->{field}", self.base)
    }
}

/// Registered metadata of one model.
#[derive(Debug, Clone)]
pub struct ModelMeta {
    pub name: &'static str,
    pub keys: ModelKeys,
    pub identity: FieldInfo,
    pub fields: &'static [FieldInfo],
    pub default_ordering: Option<Ordering>,
    pub auto_id: bool,
    pub version_field: Option<&'static str>,
    pub structures: &'static [&'static str],
    type_id: TypeId,
}

impl ModelMeta {
    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Fields that can be sorted on and projected.
    pub fn scalar_fields(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter().filter(|f| f.field_type.is_scalar())
    }

    /// Non-identity fields with an index or unique mapping.
    pub fn indexed_fields(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter().filter(|f| !f.primary_key && f.index)
    }

    /// Id collection and indices are sorted sets.
    pub fn is_ordered(&self) -> bool {
        self.default_ordering.is_some()
    }

    pub fn is<M: Model>(&self) -> bool {
        self.type_id == TypeId::of::<M>()
    }

    /// Sorted-set score of a record under the default ordering.
    pub fn score(&self, record: &Record) -> Option<f64> {
        let ordering = self.default_ordering.as_ref()?;
        let info = self.field(&ordering.field)?;
        Some(
            record
                .get(info.name)
                .and_then(|v| info.field_type.score(v))
                .unwrap_or(0.0),
        )
    }

    /// Encoded index value for a field, `None` for `Null`.
    pub fn index_value(&self, info: &FieldInfo, value: &Value) -> Option<String> {
        info.field_type.encode(value)
    }

    fn from_model<M: Model>(config: &BackendConfig) -> Result<Self> {
        let invalid = |message: String| {
            Error::Schema(SchemaError {
                kind: SchemaErrorKind::Invalid,
                model: M::MODEL_NAME.to_string(),
                message,
            })
        };

        if !is_identifier(M::MODEL_NAME) {
            return Err(invalid(format!(
                "model name {:?} is not an identifier",
                M::MODEL_NAME
            )));
        }

        let fields = M::fields();
        let mut identity = None;
        let mut version_field = None;
        for (i, info) in fields.iter().enumerate() {
            if !is_identifier(info.name) {
                return Err(invalid(format!("field name {:?} is not an identifier", info.name)));
            }
            if fields[..i].iter().any(|f| f.name == info.name) {
                return Err(invalid(format!("field {:?} declared twice", info.name)));
            }
            if info.primary_key {
                if identity.replace(*info).is_some() {
                    return Err(invalid("more than one primary_key field".to_string()));
                }
                if !matches!(info.field_type, FieldType::Int | FieldType::Text) {
                    return Err(invalid(format!(
                        "primary key {:?} must be an integer or text field",
                        info.name
                    )));
                }
                if info.auto && info.field_type != FieldType::Int {
                    return Err(invalid(format!(
                        "auto primary key {:?} must be an integer field",
                        info.name
                    )));
                }
            } else if info.auto {
                return Err(invalid(format!("auto on non-identity field {:?}", info.name)));
            }
            if info.index && !info.field_type.is_scalar() {
                return Err(invalid(format!("{} field {:?} cannot be indexed", info.field_type.name(), info.name)));
            }
            if info.version {
                if info.field_type != FieldType::Int || info.primary_key {
                    return Err(invalid(format!(
                        "version field {:?} must be a non-identity integer",
                        info.name
                    )));
                }
                if version_field.replace(info.name).is_some() {
                    return Err(invalid("more than one version field".to_string()));
                }
            }
            if let Some(pattern) = info.pattern {
                if let Some(message) = validate_pattern(pattern) {
                    return Err(invalid(format!("field {:?}: {message}", info.name)));
                }
            }
        }
        let identity = identity.ok_or_else(|| invalid("no primary_key field".to_string()))?;

        let default_ordering = match M::ORDERING {
            Some(spec) => {
                let ordering = Ordering::parse(spec);
                let info = fields
                    .iter()
                    .find(|f| f.name == ordering.field)
                    .ok_or_else(|| invalid(format!("ordering field {:?} does not exist", ordering.field)))?;
                if !info.field_type.is_numeric() {
                    return Err(invalid(format!(
                        "ordering field {:?} must be numeric to score a sorted set",
                        ordering.field
                    )));
                }
                Some(ordering)
            }
            None => None,
        };

        for (i, name) in M::STRUCTURES.iter().enumerate() {
            if !is_identifier(name) || M::STRUCTURES[..i].contains(name) {
                return Err(invalid(format!("invalid or duplicate structure {name:?}")));
            }
        }

        Ok(Self {
            name: M::MODEL_NAME,
            keys: ModelKeys::new(&config.namespace, M::MODEL_NAME),
            identity,
            fields,
            default_ordering,
            auto_id: identity.auto,
            version_field,
            structures: M::STRUCTURES,
            type_id: TypeId::of::<M>(),
        })
    }
}

#[derive(Debug, Default)]
struct Registry {
    by_type: HashMap<TypeId, Arc<ModelMeta>>,
    by_name: HashMap<&'static str, Arc<ModelMeta>>,
    order: Vec<Arc<ModelMeta>>,
}

/// Explicit registry of the models one application uses.
#[derive(Debug)]
pub struct ModelCatalog {
    config: BackendConfig,
    registry: RwLock<Registry>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self {
            config: BackendConfig::default(),
            registry: RwLock::new(Registry::default()),
        }
    }
}

impl ModelCatalog {
    pub fn new(config: BackendConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry: RwLock::new(Registry::default()),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Register a model. Registering the same model again returns the
    /// existing metadata.
    pub fn register<M: Model>(&self) -> Result<Arc<ModelMeta>> {
        if let Some(meta) = self.lookup::<M>() {
            return Ok(meta);
        }
        let meta = Arc::new(ModelMeta::from_model::<M>(&self.config)?);

        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = registry.by_type.get(&TypeId::of::<M>()) {
            return Ok(Arc::clone(existing));
        }
        if registry.by_name.contains_key(M::MODEL_NAME) {
            return Err(Error::Schema(SchemaError {
                kind: SchemaErrorKind::Invalid,
                model: M::MODEL_NAME.to_string(),
                message: "another model is registered under this name".to_string(),
            }));
        }
        registry.by_type.insert(TypeId::of::<M>(), Arc::clone(&meta));
        registry.by_name.insert(M::MODEL_NAME, Arc::clone(&meta));
        registry.order.push(Arc::clone(&meta));
        tracing::debug!(
            model = M::MODEL_NAME,
            fields = meta.fields.len(),
            ordered = meta.is_ordered(),
            "Registered model"
        );
        Ok(meta)
    }

    fn lookup<M: Model>(&self) -> Option<Arc<ModelMeta>> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        registry.by_type.get(&TypeId::of::<M>()).cloned()
    }

    /// Metadata of a registered model.
    pub fn meta<M: Model>(&self) -> Result<Arc<ModelMeta>> {
        self.lookup::<M>().ok_or_else(|| {
            Error::Schema(SchemaError {
                kind: SchemaErrorKind::NotRegistered,
                model: M::MODEL_NAME.to_string(),
                message: "model is not registered with this catalog".to_string(),
            })
        })
    }

    pub fn meta_by_name(&self, name: &str) -> Option<Arc<ModelMeta>> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        registry.by_name.get(name).cloned()
    }

    /// Registered models in registration order.
    pub fn models(&self) -> Vec<Arc<ModelMeta>> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        registry.order.clone()
    }
}
