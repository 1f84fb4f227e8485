//! Records: the field values of one instance, in declaration order.

use crate::catalog::ModelMeta;
use crate::error::{Error, Result};
use crate::field::FieldValue;
use crate::value::Value;

/// Ordered field name to value map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    entries: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Set a field, replacing any previous value in place.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(pos).1)
    }

    /// Typed read. A missing field reads as the type's default.
    pub fn field<T: FieldValue>(&self, name: &str) -> Result<T> {
        match self.get(name) {
            None => Ok(T::default()),
            Some(value) => T::from_value(value.clone()).map_err(|err| match err {
                Error::Type(mut e) => {
                    e.field = Some(name.to_string());
                    Error::Type(e)
                }
                other => other,
            }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Backend hash pairs. The identity field and `Null` values are omitted;
    /// the commit script writes the id itself.
    pub fn to_hash(&self, meta: &ModelMeta) -> Vec<(String, String)> {
        meta.fields
            .iter()
            .filter(|info| !info.primary_key)
            .filter_map(|info| {
                let value = self.get(info.name)?;
                let encoded = info.field_type.encode(value)?;
                Some((info.name.to_string(), encoded))
            })
            .collect()
    }

    /// Decode backend hash pairs. Unknown names are ignored; the identity
    /// field is set from `id`.
    pub fn from_hash<'a>(
        meta: &ModelMeta,
        id: &str,
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self> {
        let mut record = Record::new();
        record.set(meta.identity.name, meta.identity.field_type.decode(id)?);
        for (name, raw) in pairs {
            let Some(info) = meta.field(name) else {
                continue;
            };
            if info.primary_key {
                continue;
            }
            let value = info.field_type.decode(raw).map_err(|err| match err {
                Error::Type(mut e) => {
                    e.field = Some(name.to_string());
                    Error::Type(e)
                }
                other => other,
            })?;
            record.set(name, value);
        }
        Ok(record)
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (name, value) in iter {
            record.set(name, value);
        }
        record
    }
}
