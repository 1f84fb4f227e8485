//! Full-text search hand-off.

use std::collections::BTreeMap;
use std::sync::RwLock;

use kvmodel_core::{ModelMeta, Result};

/// External search collaborator.
///
/// A query's `search(text)` asks the engine for matching ids, which then
/// narrow the query like an identity filter.
pub trait SearchEngine: Send + Sync {
    fn search(&self, meta: &ModelMeta, text: &str) -> Result<Vec<String>>;
}

/// Term lookup table keyed by model name, for tests and small datasets.
///
/// Each indexed document is split on whitespace; a search matches ids
/// whose document contains every term of the text, case-insensitively.
#[derive(Debug, Default)]
pub struct TermIndex {
    documents: RwLock<BTreeMap<(String, String), Vec<String>>>,
}

impl TermIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn terms(text: &str) -> Vec<String> {
        text.split_whitespace().map(str::to_lowercase).collect()
    }

    /// Index (or re-index) one document.
    pub fn index(&self, model: &str, id: &str, text: &str) {
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        documents.insert((model.to_string(), id.to_string()), Self::terms(text));
    }

    pub fn remove(&self, model: &str, id: &str) {
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        documents.remove(&(model.to_string(), id.to_string()));
    }

    pub fn len(&self) -> usize {
        self.documents.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SearchEngine for TermIndex {
    fn search(&self, meta: &ModelMeta, text: &str) -> Result<Vec<String>> {
        let wanted = Self::terms(text);
        let documents = self.documents.read().unwrap_or_else(|e| e.into_inner());
        Ok(documents
            .iter()
            .filter(|((model, _), terms)| {
                model == meta.name && wanted.iter().all(|w| terms.contains(w))
            })
            .map(|((_, id), _)| id.clone())
            .collect())
    }
}
